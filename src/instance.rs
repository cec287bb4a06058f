// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// The per-plugin-instance handle and the surface the rest of the plugin uses.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::RelayConfig;
use crate::error::{FatalInitError, MigrationError, Result};
use crate::layout::{FrequencyTable, NoteRecord, PendingAction, Pid, SlotIndex, CHANNEL_COUNT};
use crate::lifecycle;
use crate::liveness::LivenessOracle;
use crate::shared::SharedResources;
use crate::tuning::TuningInterface;
use crate::worker::Worker;

const NO_SLOT: usize = usize::MAX;

#[derive(Default)]
struct Workers {
    heartbeat: Option<Worker>,
    relay: Option<Worker>,
    release: Option<Worker>,
}

/// State of an initialized instance, shared with its heartbeat and relay
/// threads.
///
/// The realtime path only reads atomics. Role and slot transitions
/// (promotion, migration, teardown) are serialised by `transition`, which the
/// heartbeat only ever `try_lock`s, so any holder may join the heartbeat.
pub(crate) struct Core {
    pub(crate) config: RelayConfig,
    pub(crate) pid: Pid,
    pub(crate) shared: SharedResources,
    pub(crate) tuning: Arc<dyn TuningInterface>,
    pub(crate) liveness: Arc<dyn LivenessOracle>,
    pub(crate) transition: Mutex<()>,
    slot: AtomicUsize,
    owns_slot: AtomicBool,
    active: AtomicBool,
    leader: AtomicBool,
    closed: AtomicBool,
    error_message: Mutex<Option<String>>,
    workers: Mutex<Workers>,
}

impl Core {
    pub(crate) fn new(
        config: RelayConfig,
        pid: Pid,
        shared: SharedResources,
        tuning: Arc<dyn TuningInterface>,
        liveness: Arc<dyn LivenessOracle>,
        slot: SlotIndex,
    ) -> Self {
        Self {
            config,
            pid,
            shared,
            tuning,
            liveness,
            transition: Mutex::new(()),
            slot: AtomicUsize::new(slot),
            owns_slot: AtomicBool::new(true),
            active: AtomicBool::new(true),
            leader: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            error_message: Mutex::new(None),
            workers: Mutex::new(Workers::default()),
        }
    }

    pub(crate) fn own_slot(&self) -> Option<SlotIndex> {
        match self.slot.load(Ordering::Acquire) {
            NO_SLOT => None,
            slot => Some(slot),
        }
    }

    /// The slot this instance holds in the registry; `None` for a guest.
    pub(crate) fn owned_slot(&self) -> Option<SlotIndex> {
        self.own_slot()
            .filter(|_| self.owns_slot.load(Ordering::Acquire))
    }

    pub(crate) fn set_slot(&self, slot: SlotIndex, owns: bool) {
        self.owns_slot.store(owns, Ordering::Release);
        self.slot.store(slot, Ordering::Release);
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub(crate) fn set_inactive(&self, reason: Option<String>) {
        self.active.store(false, Ordering::Release);
        if reason.is_some() {
            *self.error_message.lock() = reason;
        }
    }

    pub(crate) fn is_leader(&self) -> bool {
        self.leader.load(Ordering::Acquire)
    }

    pub(crate) fn set_leader(&self, leader: bool) -> bool {
        self.leader.swap(leader, Ordering::AcqRel)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn close(&self) -> bool {
        self.closed.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn put_heartbeat(&self, worker: Worker) {
        let old = self.workers.lock().heartbeat.replace(worker);
        if let Some(old) = old {
            old.stop();
        }
    }

    pub(crate) fn take_heartbeat(&self) -> Option<Worker> {
        self.workers.lock().heartbeat.take()
    }

    pub(crate) fn put_relay(&self, worker: Worker) {
        let old = self.workers.lock().relay.replace(worker);
        if let Some(old) = old {
            old.stop();
        }
    }

    pub(crate) fn take_relay(&self) -> Option<Worker> {
        self.workers.lock().relay.take()
    }

    pub(crate) fn put_release(&self, worker: Worker) {
        let old = self.workers.lock().release.replace(worker);
        if let Some(old) = old {
            old.stop();
        }
    }

    pub(crate) fn take_release(&self) -> Option<Worker> {
        self.workers.lock().release.take()
    }

    /// Whether the realtime path may still write `slot`. Checked with the
    /// slot's lock held, so a migration that has cleared ownership never
    /// sees a late write land on a vacated channel.
    fn may_write(&self, slot: SlotIndex) -> bool {
        self.is_active() && self.owned_slot() == Some(slot)
    }

    /// Hand `channel` back: ask the leader to stop relaying it and drop its
    /// ghost notes. Returns its last frequency table.
    fn vacate_channel(&self, channel: SlotIndex) -> Option<FrequencyTable> {
        let table = match self.shared.lock_tuning(channel) {
            Ok(mut block) => {
                block.set_pending(PendingAction::DisableRelay);
                block.set_dirty(false);
                Some(*block.frequencies())
            }
            Err(e) => {
                tracing::warn!(channel, error = %e, "could not disable relay for vacated channel");
                None
            }
        };
        if let Err(e) = self.shared.lock_notes(channel).map(|mut notes| notes.clear()) {
            tracing::warn!(channel, error = %e, "could not clear notes of vacated channel");
        }
        table
    }

    /// Initialise a newly claimed channel, carrying over the previous table.
    fn adopt_channel(&self, channel: SlotIndex, carried: Option<FrequencyTable>) {
        let adopted = self.shared.lock_tuning(channel).map(|mut block| {
            block.reset();
            if let Some(table) = &carried {
                block.set_frequencies(table);
                block.set_dirty(true);
            }
        });
        if let Err(e) = adopted {
            tracing::warn!(channel, error = %e, "could not initialise tuning of new channel");
        }
        if let Err(e) = self.shared.lock_notes(channel).map(|mut notes| notes.clear()) {
            tracing::warn!(channel, error = %e, "could not clear notes of new channel");
        }
    }
}

/// One plugin instance's membership in the shared channel registry.
///
/// Construct with [`Instance::start`] (never fails, may be inactive) or
/// [`Instance::initialize`]. Dropping the instance releases its channel, and
/// the last instance to go removes every shared object.
pub struct Instance {
    core: Option<Arc<Core>>,
    init_error: Option<String>,
}

impl Instance {
    /// Join the registry of `config.namespace` within `config.init_timeout`.
    pub fn initialize(
        config: RelayConfig,
        tuning: Arc<dyn TuningInterface>,
        liveness: Arc<dyn LivenessOracle>,
    ) -> std::result::Result<Self, FatalInitError> {
        let core = lifecycle::initialize(config, tuning, liveness)?;
        Ok(Self {
            core: Some(core),
            init_error: None,
        })
    }

    /// Like [`Instance::initialize`], but a failure yields an inactive
    /// instance that carries the reason in [`Instance::get_error_message`].
    pub fn start(
        config: RelayConfig,
        tuning: Arc<dyn TuningInterface>,
        liveness: Arc<dyn LivenessOracle>,
    ) -> Self {
        match Self::initialize(config, tuning, liveness) {
            Ok(instance) => instance,
            Err(e) => {
                tracing::error!(error = %e, "multi-instance support disabled");
                Self {
                    core: None,
                    init_error: Some(e.to_string()),
                }
            }
        }
    }

    fn active_core(&self) -> Option<&Arc<Core>> {
        self.core.as_ref().filter(|core| core.is_active())
    }

    /// Publish this channel's tuning table for the leader to relay.
    ///
    /// A no-op while inactive or while sharing a channel held by another
    /// instance.
    pub fn update_freqs(&self, freqs: &FrequencyTable) -> Result<()> {
        let Some(core) = self.active_core() else {
            return Ok(());
        };
        let Some(slot) = core.owned_slot() else {
            return Ok(());
        };
        let mut block = core.shared.lock_tuning(slot)?;
        if !core.may_write(slot) {
            return Ok(());
        }
        block.set_frequencies(freqs);
        block.set_dirty(true);
        Ok(())
    }

    /// Replace the notes other instances see for this channel.
    pub fn update_notes(&self, notes: &[NoteRecord]) -> Result<()> {
        let Some(core) = self.active_core() else {
            return Ok(());
        };
        let Some(slot) = core.owned_slot() else {
            return Ok(());
        };
        let mut block = core.shared.lock_notes(slot)?;
        if !core.may_write(slot) {
            return Ok(());
        }
        let dropped = block.publish(notes);
        drop(block);
        if dropped > 0 {
            tracing::debug!(channel = slot, dropped, "note list truncated");
        }
        Ok(())
    }

    /// Notes published on `channels`, in channel order.
    pub fn get_channels_notes(&self, channels: &BTreeSet<SlotIndex>) -> Result<Vec<NoteRecord>> {
        let Some(core) = self.active_core() else {
            return Ok(Vec::new());
        };
        let mut out = Vec::new();
        for &channel in channels {
            out.extend_from_slice(core.shared.lock_notes(channel)?.notes());
        }
        Ok(out)
    }

    pub fn get_channel_index(&self) -> Option<SlotIndex> {
        self.active_core().and_then(|core| core.own_slot())
    }

    pub fn get_is_active(&self) -> bool {
        self.active_core().is_some()
    }

    /// Whether this instance currently drives the tuning interface.
    pub fn is_leader(&self) -> bool {
        self.active_core().is_some_and(|core| core.is_leader())
    }

    /// Why the instance is inactive, if it is.
    pub fn get_error_message(&self) -> Option<String> {
        if let Some(e) = &self.init_error {
            return Some(e.clone());
        }
        self.core.as_ref().and_then(|core| core.error_message.lock().clone())
    }

    /// Move to channel `desired`.
    ///
    /// A free or stale slot is claimed, and leadership follows it. A slot held
    /// by a live instance is shared without eviction: this instance keeps
    /// showing that channel but publishes nothing to it, and a leader steps
    /// down. The previous slot is vacated in both cases.
    pub fn change_channel(&self, desired: SlotIndex) -> std::result::Result<(), MigrationError> {
        let core = self.active_core().ok_or(MigrationError::Inactive)?;
        if desired >= CHANNEL_COUNT {
            return Err(MigrationError::InvalidChannel(desired));
        }

        let _transition = core.transition.lock();
        if !core.is_active() {
            return Err(MigrationError::Inactive);
        }
        let old = core.owned_slot();
        if old == Some(desired) {
            return Ok(());
        }
        let was_leader = core.is_leader();

        // Stop realtime writes to the old channel before anyone else can
        // claim it, then hand it back while it is still ours.
        let carried = old.and_then(|old| {
            core.set_slot(old, false);
            core.vacate_channel(old)
        });

        let claimed = {
            let mut reg = match core.shared.lock_registry() {
                Ok(reg) => reg,
                Err(e) => {
                    if let Some(old) = old {
                        core.set_slot(old, true);
                    }
                    core.deactivate(&e);
                    return Err(MigrationError::Deactivated(e));
                }
            };
            if let Some(old) = old {
                reg.release(old, core.pid);
            }
            let claimed = reg.try_claim(desired, core.pid, core.liveness.as_ref());
            if was_leader {
                if claimed {
                    reg.set_leader(Some(desired));
                } else if reg.leader() == old {
                    reg.set_leader(None);
                }
            }
            claimed
        };

        if claimed {
            core.adopt_channel(desired, carried);
        }
        core.set_slot(desired, claimed);
        tracing::info!(from = ?old, to = desired, owner = claimed, "changed channel");

        if was_leader && !claimed {
            core.step_down(old);
            if let Err(e) = core.start_heartbeat() {
                core.deactivate(&e);
                return Err(MigrationError::Deactivated(e));
            }
        }
        Ok(())
    }

    /// Leave the registry now instead of at drop.
    pub fn shutdown(mut self) {
        if let Some(core) = self.core.take() {
            core.teardown();
        }
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        if let Some(core) = self.core.take() {
            core.teardown();
        }
    }
}
