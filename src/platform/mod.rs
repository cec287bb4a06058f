// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors

#[cfg(unix)]
pub mod posix;

#[cfg(not(unix))]
compile_error!("mts-relay requires POSIX shared memory and process-shared pthread mutexes");

#[cfg(unix)]
pub use posix::{current_pid, pid_alive, PlatformMutex, PlatformShm, ShmMode};
