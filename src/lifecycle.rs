// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Bounded startup, emergency cleanup, teardown and last-exit cleanup.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam_channel::RecvTimeoutError;

use crate::config::RelayConfig;
use crate::election::{decide_role, Role};
use crate::error::{Error, FatalInitError, Result};
use crate::instance::Core;
use crate::layout::{PendingAction, Pid, SlotIndex};
use crate::liveness::LivenessOracle;
use crate::names::SharedNames;
use crate::shared::{remove_namespace, SharedResources};
use crate::tuning::TuningInterface;
use crate::worker::Worker;

/// Attempts to reopen after finding the registry retired by a concurrent
/// last-exit cleanup.
const RETIRED_REOPEN_ATTEMPTS: usize = 3;

/// Result of the background part of startup.
struct Bootstrapped {
    shared: SharedResources,
    slot: SlotIndex,
    role: Role,
}

/// Open the namespace, claim a slot and decide the role.
///
/// Runs on its own thread. Once `cancel` is set no further named object is
/// opened, so an abandoned run cannot resurrect objects removed by emergency
/// cleanup; it only ever touches the orphaned mappings it already holds.
fn bootstrap(
    config: &RelayConfig,
    pid: Pid,
    liveness: &dyn LivenessOracle,
    cancel: &Arc<AtomicBool>,
) -> Result<Bootstrapped> {
    for attempt in 0..RETIRED_REOPEN_ATTEMPTS {
        let shared = SharedResources::open_cancellable(config, Arc::clone(cancel))?;
        let claimed = {
            let mut reg = shared.lock_registry()?;
            if cancel.load(Ordering::Acquire) {
                return Err(Error::Cancelled);
            }
            if reg.retired() {
                None
            } else {
                Some(reg.claim(pid, liveness)?)
            }
        };
        let Some(slot) = claimed else {
            tracing::debug!(attempt, "registry retired by the last instance, reopening");
            continue;
        };
        tracing::info!(slot, pid, namespace = %config.namespace, "claimed channel");

        shared.reset_channel(slot)?;
        let role = decide_role(&shared, slot, liveness)?;
        return Ok(Bootstrapped { shared, slot, role });
    }
    Err(Error::Io(io::Error::other(
        "shared registry kept being retired during startup",
    )))
}

/// Bring up an instance within `config.init_timeout`.
pub(crate) fn initialize(
    config: RelayConfig,
    tuning: Arc<dyn TuningInterface>,
    liveness: Arc<dyn LivenessOracle>,
) -> std::result::Result<Arc<Core>, FatalInitError> {
    let pid = config.effective_pid();
    let names = SharedNames::new(&config.namespace);
    let cancel = Arc::new(AtomicBool::new(false));
    let (tx, rx) = crossbeam_channel::bounded(1);

    let task = {
        let config = config.clone();
        let liveness = Arc::clone(&liveness);
        let cancel = Arc::clone(&cancel);
        move || {
            let result = bootstrap(&config, pid, liveness.as_ref(), &cancel);
            // The receiver is gone if startup already timed out.
            let _ = tx.send(result);
        }
    };
    // The handle is dropped: on timeout the thread is abandoned, not joined.
    if let Err(e) = thread::Builder::new().name("mts-relay-init".into()).spawn(task) {
        return Err(FatalInitError::Failed(e.into()));
    }

    match rx.recv_timeout(config.init_timeout) {
        Ok(Ok(boot)) => start_role(config, pid, boot, tuning, liveness).map_err(FatalInitError::Failed),
        Ok(Err(e)) => {
            if e.is_corruption_suspect() {
                tracing::error!(error = %e, "startup failed, resetting shared state");
                emergency_cleanup(&names);
            }
            Err(FatalInitError::Failed(e))
        }
        Err(RecvTimeoutError::Timeout) => {
            cancel.store(true, Ordering::Release);
            let timeout_ms = config.init_timeout.as_millis() as u64;
            tracing::error!(timeout_ms, "startup timed out, resetting shared state");
            emergency_cleanup(&names);
            Err(FatalInitError::TimedOut { timeout_ms })
        }
        Err(RecvTimeoutError::Disconnected) => {
            emergency_cleanup(&names);
            Err(FatalInitError::Failed(Error::Io(io::Error::other(
                "initialization thread exited without a result",
            ))))
        }
    }
}

/// Turn a finished bootstrap into a running leader or client.
fn start_role(
    config: RelayConfig,
    pid: Pid,
    boot: Bootstrapped,
    tuning: Arc<dyn TuningInterface>,
    liveness: Arc<dyn LivenessOracle>,
) -> Result<Arc<Core>> {
    let slot = boot.slot;
    let core = Arc::new(Core::new(config, pid, boot.shared, tuning, liveness, slot));
    let started = match boot.role {
        Role::Leader { occupied } => match core.assume_leadership(slot, &occupied) {
            Ok(true) => Ok(()),
            Ok(false) => core.start_heartbeat(),
            Err(e) => Err(e),
        },
        Role::Client { leader } => {
            tracing::info!(slot, leader, "joined as client");
            core.start_heartbeat()
        }
    };
    if let Err(e) = started {
        core.teardown();
        return Err(e);
    }
    Ok(core)
}

/// Remove every shared object of the namespace, whatever state it is in.
///
/// Used when startup timed out or failed in a way that suggests a deadlocked
/// peer or a corrupted segment. Instances still attached keep running on the
/// orphaned objects until they exit.
pub fn emergency_cleanup(names: &SharedNames) -> usize {
    let removed = remove_namespace(names);
    tracing::error!(namespace = %names.namespace(), removed, "emergency cleanup removed shared objects");
    removed
}

impl Core {
    /// Stop relaying and polling after a lock failure, then give up the slot
    /// in the background so a peer can take over the leader role.
    ///
    /// The registry lock may be the one that failed, so the release is
    /// retried on `mts-relay-release` until it succeeds or teardown runs.
    pub(crate) fn deactivate(self: &Arc<Self>, reason: &Error) {
        tracing::error!(error = %reason, "multi-instance support disabled");
        self.set_inactive(Some(reason.to_string()));
        if let Some(heartbeat) = self.take_heartbeat() {
            heartbeat.stop();
        }
        self.step_down(None);
        if self.owned_slot().is_none() {
            return;
        }

        let core = Arc::clone(self);
        let interval = self.config.heartbeat_interval;
        let spawned = Worker::spawn("mts-relay-release", move |stop| {
            while !core.release_slot() {
                if !stop.wait(interval) {
                    break;
                }
            }
        });
        match spawned {
            Ok(worker) => self.put_release(worker),
            Err(e) => tracing::warn!(error = %e, "could not start slot release, leaving it to teardown"),
        }
    }

    /// One bounded attempt to hand our slot, and the leader claim on it, back
    /// to the registry. True once nothing is left to release.
    fn release_slot(&self) -> bool {
        let Some(slot) = self.owned_slot() else {
            return true;
        };
        let mut reg = match self.shared.lock_registry() {
            Ok(reg) => reg,
            Err(e) => {
                tracing::debug!(slot, error = %e, "slot release deferred");
                return false;
            }
        };
        reg.release(slot, self.pid);
        if reg.leader() == Some(slot) {
            reg.set_leader(None);
        }
        self.set_slot(slot, false);
        tracing::info!(slot, pid = self.pid, "released slot of deactivated instance");
        true
    }

    /// Leave the registry. Idempotent.
    pub(crate) fn teardown(&self) {
        if self.close() {
            return;
        }
        let _transition = self.transition.lock();
        if let Some(release) = self.take_release() {
            release.stop();
        }
        if let Some(heartbeat) = self.take_heartbeat() {
            heartbeat.stop();
        }

        let owned = self.owned_slot();
        if let Some(slot) = owned {
            let disabled = self
                .shared
                .lock_tuning(slot)
                .map(|mut block| block.set_pending(PendingAction::DisableRelay));
            if let Err(e) = disabled {
                tracing::warn!(slot, error = %e, "could not disable relay for own channel");
            }
            if let Err(e) = self.shared.lock_notes(slot).map(|mut notes| notes.clear()) {
                tracing::warn!(slot, error = %e, "could not clear own notes");
            }
        }
        // Deregister before giving up the leader index, so a successor never
        // finds the interface still taken by us.
        self.step_down(owned);

        self.leave_registry(owned);
        self.set_inactive(None);
    }

    fn leave_registry(&self, owned: Option<SlotIndex>) {
        let mut reg = match self.shared.lock_registry() {
            Ok(reg) => reg,
            Err(e) => {
                tracing::warn!(error = %e, "could not release slot, leaving it to be reclaimed as stale");
                return;
            }
        };
        if let Some(slot) = owned {
            reg.release(slot, self.pid);
            if reg.leader() == Some(slot) {
                reg.set_leader(None);
            }
        }
        let stale = reg.collect_stale(self.liveness.as_ref());
        if !stale.is_empty() {
            tracing::info!(slots = ?stale, "cleared slots of dead instances");
        }
        if reg.occupied_slots().is_empty() {
            reg.retire();
            if !self.shared.is_current() {
                // Orphaned by an emergency cleanup; the names now belong to
                // a newer registry.
                tracing::info!(namespace = %self.config.namespace, "left orphaned registry");
                return;
            }
            // Removal happens under the lock; anyone who opened the old
            // objects and waits for this lock will see `retired` and reopen.
            let removed = remove_namespace(self.shared.names());
            tracing::info!(
                namespace = %self.config.namespace,
                removed,
                "last instance exited, removed shared objects"
            );
        }
    }
}
