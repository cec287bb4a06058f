// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Leader-side relay: drains pending channel actions and dirty tuning tables
// into the tuning interface.

use std::io;
use std::sync::Arc;

use crate::instance::Core;
use crate::layout::{FrequencyTable, PendingAction, SlotIndex, CHANNEL_COUNT};
use crate::shared::SharedResources;
use crate::tuning::TuningInterface;
use crate::worker::Worker;

/// What one channel asks of the tuning interface, taken under its lock.
#[derive(Default)]
struct ChannelWork {
    relay_enabled: Option<bool>,
    table: Option<FrequencyTable>,
}

fn take_work(shared: &SharedResources, channel: SlotIndex) -> crate::Result<ChannelWork> {
    let mut block = shared.lock_tuning(channel)?;
    let mut work = ChannelWork::default();
    match block.pending() {
        PendingAction::DisableRelay => {
            block.set_dirty(false);
            work.relay_enabled = Some(false);
        }
        PendingAction::EnableRelay => work.relay_enabled = Some(true),
        PendingAction::None => {}
    }
    block.set_pending(PendingAction::None);
    if block.dirty() {
        block.set_dirty(false);
        work.table = Some(*block.frequencies());
    }
    Ok(work)
}

/// One pass over all channels. Returns how many interface calls were made.
///
/// The interface is called after the channel lock is released, so a slow
/// driver never stalls the writer of that channel. A lock timeout skips the
/// channel until the next pass.
pub(crate) fn relay_pass(shared: &SharedResources, tuning: &dyn TuningInterface) -> usize {
    let mut calls = 0;
    for channel in 0..CHANNEL_COUNT {
        let work = match take_work(shared, channel) {
            Ok(work) => work,
            Err(e) => {
                tracing::warn!(channel, error = %e, "relay skipped channel");
                continue;
            }
        };
        if let Some(enabled) = work.relay_enabled {
            tracing::debug!(channel, enabled, "relay state change");
            tuning.set_channel_relay_enabled(channel, enabled);
            calls += 1;
        }
        if let Some(table) = work.table {
            tracing::trace!(channel, "pushing tuning table");
            tuning.set_channel_tuning_table(channel, &table);
            calls += 1;
        }
    }
    calls
}

/// Start the relay thread for a leader.
pub(crate) fn spawn(core: Arc<Core>) -> io::Result<Worker> {
    let poll = core.config.relay_poll_interval;
    Worker::spawn("mts-relay-server", move |stop| {
        tracing::info!(namespace = %core.config.namespace, "relay loop started");
        loop {
            relay_pass(&core.shared, core.tuning.as_ref());
            if !stop.wait(poll) {
                break;
            }
        }
        tracing::info!(namespace = %core.config.namespace, "relay loop stopped");
    })
}
