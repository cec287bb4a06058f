// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Error types.

use thiserror::Error;

use crate::layout::CHANNEL_COUNT;

#[derive(Error, Debug)]
pub enum Error {
    /// A bounded lock acquisition timed out. Another instance may be
    /// deadlocked holding it, or the shared state is corrupted.
    #[error("timed out after {timeout_ms}ms waiting for {lock}; another instance may be deadlocked")]
    DeadlockSuspected { lock: String, timeout_ms: u64 },

    #[error("all {max} channels are in use by other instances", max = CHANNEL_COUNT)]
    NoSlotsAvailable,

    #[error("channel {0} is out of range (0..{max})", max = CHANNEL_COUNT)]
    InvalidChannel(usize),

    /// Initialization was abandoned by its caller.
    #[error("initialization was cancelled")]
    Cancelled,

    #[error("shared memory error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the shared state may be left in a state only emergency
    /// cleanup can recover from.
    pub fn is_corruption_suspect(&self) -> bool {
        matches!(self, Error::DeadlockSuspected { .. } | Error::Io(_))
    }
}

/// Startup failure. The instance ends up permanently inactive.
#[derive(Error, Debug)]
pub enum FatalInitError {
    #[error("could not start multi-instance support: {0}")]
    Failed(#[source] Error),

    #[error(
        "multi-instance startup did not finish within {timeout_ms}ms; \
         shared state was possibly deadlocked or corrupted and has been reset"
    )]
    TimedOut { timeout_ms: u64 },
}

/// Failure of [`Instance::change_channel`](crate::Instance::change_channel).
#[derive(Error, Debug)]
pub enum MigrationError {
    #[error("instance is inactive")]
    Inactive,

    /// The instance stays on its current channel.
    #[error("channel {0} is out of range (0..{max})", max = CHANNEL_COUNT)]
    InvalidChannel(usize),

    /// The registry could not be locked; the instance has been deactivated.
    #[error("channel change failed, multi-instance support disabled: {0}")]
    Deactivated(#[source] Error),
}

/// Another driver already holds the tuning interface.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("tuning interface already has a master")]
pub struct MasterBusy;

pub type Result<T> = std::result::Result<T, Error>;
