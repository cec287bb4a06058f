// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Coordination layer for plugin instances running in separate processes on
// one machine. Instances share 16 channel identities through a registry in
// named shared memory, and elect one leader that alone drives the
// device-wide tuning interface on behalf of all of them.

pub mod names;

mod platform;

mod shm;
pub use shm::{ShmHandle, ShmOpenMode};

mod mutex;
pub use mutex::IpcMutex;

mod scoped_access;

mod error;
pub use error::{Error, FatalInitError, MasterBusy, MigrationError, Result};

mod layout;
pub use layout::{
    equal_temperament, FrequencyTable, NoteRecord, PendingAction, Pid, RegistrySnapshot, Slot, SlotIndex,
    TuningSnapshot, CHANNEL_COUNT, MAX_NOTES, NOTES_PER_TABLE,
};

mod config;
pub use config::RelayConfig;

mod liveness;
pub use liveness::{current_pid, LivenessOracle, OsLiveness};

mod tuning;
pub use tuning::TuningInterface;

mod shared;
pub use shared::{remove_namespace, SharedResources};

mod registry;
mod worker;
mod election;
mod relay;

pub mod lifecycle;

mod instance;
pub use instance::Instance;
