// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Named inter-process mutex with bounded acquisition.

use std::io;
use std::time::Duration;

use crate::platform::PlatformMutex;

/// A named, inter-process mutex.
///
/// A `pthread_mutex_t` stored in its own shared memory segment with
/// `PTHREAD_PROCESS_SHARED` and, where supported, `PTHREAD_MUTEX_ROBUST`.
/// There is deliberately no unbounded `lock`: every acquisition in this crate
/// is a [`IpcMutex::lock_timeout`].
pub struct IpcMutex {
    inner: PlatformMutex,
    name: String,
}

impl IpcMutex {
    /// Open (or create) a named inter-process mutex.
    pub fn open(name: &str) -> io::Result<Self> {
        let inner = PlatformMutex::open(name)?;
        Ok(Self {
            inner,
            name: name.to_owned(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// `Ok(true)` if acquired within `timeout`, `Ok(false)` on timeout.
    pub fn lock_timeout(&self, timeout: Duration) -> io::Result<bool> {
        self.inner.lock_timeout(timeout)
    }

    /// `Ok(true)` if acquired, `Ok(false)` if contended.
    pub fn try_lock(&self) -> io::Result<bool> {
        self.inner.try_lock()
    }

    pub fn unlock(&self) -> io::Result<()> {
        self.inner.unlock()
    }

    /// Remove the named mutex so the next `open` creates a fresh one.
    /// `Ok(false)` if it did not exist.
    pub fn clear_storage(name: &str) -> io::Result<bool> {
        PlatformMutex::clear_storage(name)
    }
}
