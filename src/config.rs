// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors

use std::time::Duration;

use crate::layout::Pid;

/// Settings shared by every component of one instance.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Prefix of every OS object name. Instances only see each other when
    /// they use the same namespace.
    pub namespace: String,
    /// Upper bound for the whole startup sequence.
    pub init_timeout: Duration,
    /// Upper bound for every named lock acquisition.
    pub lock_timeout: Duration,
    /// How often a client checks that the leader is alive.
    pub heartbeat_interval: Duration,
    /// Pause between two relay passes over all channels.
    pub relay_poll_interval: Duration,
    /// Identity recorded in the registry. Defaults to the OS pid.
    pub pid: Option<Pid>,
}

impl RelayConfig {
    pub const DEFAULT_NAMESPACE: &'static str = "mts_relay";

    pub fn new(namespace: &str) -> Self {
        Self {
            namespace: namespace.to_owned(),
            ..Self::default()
        }
    }

    pub fn with_init_timeout(mut self, timeout: Duration) -> Self {
        self.init_timeout = timeout;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_relay_poll_interval(mut self, interval: Duration) -> Self {
        self.relay_poll_interval = interval;
        self
    }

    pub fn with_pid(mut self, pid: Pid) -> Self {
        self.pid = Some(pid);
        self
    }

    pub(crate) fn effective_pid(&self) -> Pid {
        self.pid.unwrap_or_else(crate::liveness::current_pid)
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            namespace: Self::DEFAULT_NAMESPACE.to_owned(),
            init_timeout: Duration::from_millis(2000),
            lock_timeout: Duration::from_millis(500),
            heartbeat_interval: Duration::from_millis(500),
            relay_poll_interval: Duration::from_millis(1),
            pid: None,
        }
    }
}
