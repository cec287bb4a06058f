// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Slot acquisition and membership rules. Everything here runs on a registry
// reached through its lock guard.

use crate::error::{Error, Result};
use crate::layout::{Pid, RegistryData, SlotIndex, CHANNEL_COUNT};
use crate::liveness::LivenessOracle;

impl RegistryData {
    /// Occupied, but the recorded owner is gone.
    pub(crate) fn is_stale(&self, idx: SlotIndex, oracle: &dyn LivenessOracle) -> bool {
        let slot = self.slot(idx);
        slot.occupied && !oracle.is_alive(slot.owner_pid)
    }

    pub(crate) fn is_claimable(&self, idx: SlotIndex, oracle: &dyn LivenessOracle) -> bool {
        !self.slot(idx).occupied || self.is_stale(idx, oracle)
    }

    pub(crate) fn is_owned_by(&self, idx: SlotIndex, pid: Pid) -> bool {
        let slot = self.slot(idx);
        slot.occupied && slot.owner_pid == pid
    }

    /// Claim the first free or stale slot for `pid`.
    pub(crate) fn claim(&mut self, pid: Pid, oracle: &dyn LivenessOracle) -> Result<SlotIndex> {
        let idx = (0..CHANNEL_COUNT)
            .find(|&i| self.is_claimable(i, oracle))
            .ok_or(Error::NoSlotsAvailable)?;
        self.take(idx, pid, oracle);
        Ok(idx)
    }

    /// Claim `idx` if it is free or stale.
    pub(crate) fn try_claim(&mut self, idx: SlotIndex, pid: Pid, oracle: &dyn LivenessOracle) -> bool {
        if !self.is_claimable(idx, oracle) {
            return false;
        }
        self.take(idx, pid, oracle);
        true
    }

    fn take(&mut self, idx: SlotIndex, pid: Pid, oracle: &dyn LivenessOracle) {
        if self.is_stale(idx, oracle) {
            tracing::warn!(
                slot = idx,
                dead_pid = self.slot(idx).owner_pid,
                "reclaiming slot of dead instance"
            );
        }
        self.occupy(idx, pid);
    }

    /// Vacate `idx` if `pid` still owns it.
    pub(crate) fn release(&mut self, idx: SlotIndex, pid: Pid) -> bool {
        if !self.is_owned_by(idx, pid) {
            return false;
        }
        self.vacate(idx);
        true
    }

    /// The declared leader, if it references an occupied slot with a live
    /// owner.
    pub(crate) fn live_leader(&self, oracle: &dyn LivenessOracle) -> Option<SlotIndex> {
        self.leader()
            .filter(|&idx| self.slot(idx).occupied && !self.is_stale(idx, oracle))
    }

    /// Clear every stale slot, and the leader if it no longer references an
    /// occupied slot. Returns the reclaimed slots.
    pub(crate) fn collect_stale(&mut self, oracle: &dyn LivenessOracle) -> Vec<SlotIndex> {
        let stale: Vec<SlotIndex> = (0..CHANNEL_COUNT)
            .filter(|&i| self.is_stale(i, oracle))
            .collect();
        for &idx in &stale {
            self.vacate(idx);
        }
        if self.leader().is_some_and(|l| !self.slot(l).occupied) {
            self.set_leader(None);
        }
        stale
    }

    pub(crate) fn occupied_slots(&self) -> Vec<SlotIndex> {
        (0..CHANNEL_COUNT).filter(|&i| self.slot(i).occupied).collect()
    }
}
