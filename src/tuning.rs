// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// The device-wide tuning interface driven by the elected leader.

use crate::error::MasterBusy;
use crate::layout::{FrequencyTable, SlotIndex};

/// Narrow view of the external tuning driver.
///
/// Only one process may be registered as master at a time. Registration is
/// idempotent for the current master. Every call after a successful
/// `register_as_master` comes from the leader's relay thread or from its
/// teardown.
pub trait TuningInterface: Send + Sync {
    fn register_as_master(&self) -> Result<(), MasterBusy>;

    fn deregister_master(&self);

    /// Start or stop applying this channel's table to incoming notes.
    fn set_channel_relay_enabled(&self, channel: SlotIndex, enabled: bool);

    fn set_channel_tuning_table(&self, channel: SlotIndex, freqs: &FrequencyTable);
}
