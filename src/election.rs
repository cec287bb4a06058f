// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Leader election and the client heartbeat.
//
// Election is not a vote: the first instance to observe, under the registry
// lock, that no live leader exists writes itself as leader in the same
// critical section. Later observers then see a valid leader and stay clients.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::instance::Core;
use crate::layout::{PendingAction, SlotIndex};
use crate::liveness::LivenessOracle;
use crate::relay;
use crate::shared::SharedResources;
use crate::worker::Worker;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Role {
    /// `leader_index` now points at our slot; `occupied` lists every
    /// occupied slot seen in the same critical section.
    Leader { occupied: Vec<SlotIndex> },
    Client { leader: SlotIndex },
}

/// Decide the role of the instance holding `slot`.
pub(crate) fn decide_role(
    shared: &SharedResources,
    slot: SlotIndex,
    oracle: &dyn LivenessOracle,
) -> Result<Role> {
    let mut reg = shared.lock_registry()?;
    match reg.live_leader(oracle) {
        Some(leader) if leader != slot => Ok(Role::Client { leader }),
        _ => {
            reg.set_leader(Some(slot));
            Ok(Role::Leader {
                occupied: reg.occupied_slots(),
            })
        }
    }
}

/// Open the tuning lock of every occupied channel and ask the relay to
/// (re)enable it and push its table. A channel whose lock times out keeps
/// whatever it had pending.
fn prepare_leadership(shared: &SharedResources, occupied: &[SlotIndex]) -> Result<()> {
    for &channel in occupied {
        shared.tuning_mutex(channel)?;
    }
    for &channel in occupied {
        match shared.lock_tuning(channel) {
            Ok(mut block) => {
                block.set_pending(PendingAction::EnableRelay);
                block.set_dirty(true);
            }
            Err(e @ Error::DeadlockSuspected { .. }) => {
                tracing::warn!(channel, error = %e, "could not take over channel");
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Undo our `leader_index` write if nobody has replaced it since.
fn rollback_leader(shared: &SharedResources, slot: SlotIndex) {
    match shared.lock_registry() {
        Ok(mut reg) => {
            if reg.leader() == Some(slot) {
                reg.set_leader(None);
            }
        }
        Err(e) => tracing::warn!(slot, error = %e, "could not withdraw leadership claim"),
    }
}

impl Core {
    /// Finish a promotion whose `leader_index` write already happened.
    ///
    /// `Ok(false)` if the tuning interface refused us; the claim is withdrawn
    /// and the caller stays a client.
    pub(crate) fn assume_leadership(self: &Arc<Self>, slot: SlotIndex, occupied: &[SlotIndex]) -> Result<bool> {
        if let Err(e) = prepare_leadership(&self.shared, occupied) {
            rollback_leader(&self.shared, slot);
            return Err(e);
        }
        if let Err(busy) = self.tuning.register_as_master() {
            tracing::warn!(slot, error = %busy, "tuning interface refused registration, staying client");
            rollback_leader(&self.shared, slot);
            return Ok(false);
        }
        match relay::spawn(Arc::clone(self)) {
            Ok(worker) => {
                self.set_leader(true);
                self.put_relay(worker);
                tracing::info!(slot, pid = self.pid, channels = ?occupied, "became leader");
                Ok(true)
            }
            Err(e) => {
                self.tuning.deregister_master();
                rollback_leader(&self.shared, slot);
                Err(e.into())
            }
        }
    }

    /// Give up the leader role without touching the registry.
    pub(crate) fn step_down(&self, vacated: Option<SlotIndex>) {
        if let Some(relay) = self.take_relay() {
            relay.stop();
        }
        if !self.set_leader(false) {
            return;
        }
        if let Some(channel) = vacated {
            self.tuning.set_channel_relay_enabled(channel, false);
        }
        self.tuning.deregister_master();
        tracing::info!(pid = self.pid, "stepped down as leader");
    }

    pub(crate) fn start_heartbeat(self: &Arc<Self>) -> Result<()> {
        let core = Arc::clone(self);
        let interval = self.config.heartbeat_interval;
        let worker = Worker::spawn("mts-relay-heartbeat", move |stop| {
            while stop.wait(interval) {
                if core.heartbeat_tick() {
                    break;
                }
            }
        })?;
        self.put_heartbeat(worker);
        Ok(())
    }

    /// One liveness check of the leader. Returns true when the heartbeat is
    /// no longer needed.
    fn heartbeat_tick(self: &Arc<Self>) -> bool {
        if self.is_closed() || !self.is_active() || self.is_leader() {
            return true;
        }
        // Another transition is running; check again next period.
        let Some(_transition) = self.transition.try_lock() else {
            return false;
        };
        if self.is_closed() || !self.is_active() || self.is_leader() {
            return true;
        }
        // Guests have no slot to lead from.
        let Some(slot) = self.owned_slot() else {
            return false;
        };

        match decide_role(&self.shared, slot, self.liveness.as_ref()) {
            Ok(Role::Client { .. }) => false,
            Ok(Role::Leader { occupied }) => {
                tracing::info!(slot, "leader is gone, promoting");
                match self.assume_leadership(slot, &occupied) {
                    Ok(promoted) => promoted,
                    Err(e) => {
                        tracing::warn!(slot, error = %e, "promotion failed");
                        false
                    }
                }
            }
            Err(e) => {
                tracing::warn!(slot, error = %e, "heartbeat check failed");
                false
            }
        }
    }
}
