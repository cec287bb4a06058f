// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Test doubles shared by the integration tests.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use mts_relay::{
    current_pid, remove_namespace, FrequencyTable, LivenessOracle, MasterBusy, Pid, RelayConfig,
    SlotIndex, TuningInterface,
};
use mts_relay::names::SharedNames;

static COUNTER: AtomicUsize = AtomicUsize::new(0);

/// A namespace no other test (or earlier run) uses.
pub fn unique_namespace(prefix: &str) -> String {
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    let ns = format!("{prefix}_{n}_{}", current_pid());
    remove_namespace(&SharedNames::new(&ns));
    ns
}

/// Fast timings so elections and failures show up within a test's patience.
pub fn test_config(namespace: &str, pid: Pid) -> RelayConfig {
    RelayConfig::new(namespace)
        .with_pid(pid)
        .with_init_timeout(Duration::from_secs(2))
        .with_lock_timeout(Duration::from_millis(200))
        .with_heartbeat_interval(Duration::from_millis(10))
        .with_relay_poll_interval(Duration::from_millis(1))
}

/// Every positive pid is alive until the test kills it.
#[derive(Default)]
pub struct FakeLiveness {
    dead: Mutex<HashSet<Pid>>,
}

impl FakeLiveness {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn kill(&self, pid: Pid) {
        self.dead.lock().insert(pid);
    }
}

impl LivenessOracle for FakeLiveness {
    fn is_alive(&self, pid: Pid) -> bool {
        pid > 0 && !self.dead.lock().contains(&pid)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TuningCall {
    Register,
    Deregister,
    RelayEnabled(SlotIndex, bool),
    Table(SlotIndex, FrequencyTable),
}

/// Records every call; can be made to refuse registration.
#[derive(Default)]
pub struct RecordingTuning {
    busy: Mutex<bool>,
    master: Mutex<bool>,
    calls: Mutex<Vec<TuningCall>>,
}

impl RecordingTuning {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Refuses every registration, as if another driver held the interface.
    pub fn busy() -> Arc<Self> {
        let tuning = Self::default();
        *tuning.busy.lock() = true;
        Arc::new(tuning)
    }

    pub fn set_busy(&self, busy: bool) {
        *self.busy.lock() = busy;
    }

    pub fn is_master(&self) -> bool {
        *self.master.lock()
    }

    pub fn calls(&self) -> Vec<TuningCall> {
        self.calls.lock().clone()
    }

    pub fn tables_for(&self, channel: SlotIndex) -> Vec<FrequencyTable> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                TuningCall::Table(ch, t) if *ch == channel => Some(*t),
                _ => None,
            })
            .collect()
    }

    pub fn relay_state(&self, channel: SlotIndex) -> Option<bool> {
        self.calls.lock().iter().rev().find_map(|c| match c {
            TuningCall::RelayEnabled(ch, enabled) if *ch == channel => Some(*enabled),
            _ => None,
        })
    }
}

impl TuningInterface for RecordingTuning {
    fn register_as_master(&self) -> Result<(), MasterBusy> {
        if *self.busy.lock() {
            return Err(MasterBusy);
        }
        *self.master.lock() = true;
        self.calls.lock().push(TuningCall::Register);
        Ok(())
    }

    fn deregister_master(&self) {
        *self.master.lock() = false;
        self.calls.lock().push(TuningCall::Deregister);
    }

    fn set_channel_relay_enabled(&self, channel: SlotIndex, enabled: bool) {
        self.calls.lock().push(TuningCall::RelayEnabled(channel, enabled));
    }

    fn set_channel_tuning_table(&self, channel: SlotIndex, freqs: &FrequencyTable) {
        self.calls.lock().push(TuningCall::Table(channel, *freqs));
    }
}

/// Poll `cond` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    cond()
}

/// A recognisable non-12-TET table.
pub fn detuned_table(cents_up: f64) -> FrequencyTable {
    let ratio = 2f64.powf(cents_up / 1200.0);
    let base = mts_relay::equal_temperament();
    std::array::from_fn(|n| base[n] * ratio)
}
