// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Process liveness queries.

use crate::layout::Pid;
use crate::platform;

/// Reports whether the process owning a slot still runs.
///
/// Must not report a live process as dead. PID reuse can make a dead owner
/// look alive; callers accept that.
pub trait LivenessOracle: Send + Sync {
    fn is_alive(&self, pid: Pid) -> bool;
}

/// Asks the OS via `kill(pid, 0)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsLiveness;

impl LivenessOracle for OsLiveness {
    fn is_alive(&self, pid: Pid) -> bool {
        platform::pid_alive(pid)
    }
}

/// The OS id of the calling process.
pub fn current_pid() -> Pid {
    platform::current_pid()
}
