// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// RAII guard that holds a named mutex for the lifetime of the access and
// exposes the shared structure it protects.

use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::IpcMutex;

/// Locks on construction, unlocks on drop.
///
/// Not `Send`: a pthread mutex must be unlocked by the thread that locked it.
pub struct ScopedAccess<'a, T> {
    data: NonNull<T>,
    mtx: &'a IpcMutex,
    _marker: PhantomData<&'a mut T>,
}

impl<'a, T> ScopedAccess<'a, T> {
    /// Lock `mtx` within `timeout`; a timeout is reported as
    /// [`Error::DeadlockSuspected`].
    ///
    /// # Safety
    /// `data` must stay mapped for `'a` and must only ever be accessed while
    /// `mtx` is held.
    pub(crate) unsafe fn acquire(mtx: &'a IpcMutex, data: NonNull<T>, timeout: Duration) -> Result<Self> {
        if !mtx.lock_timeout(timeout)? {
            return Err(Error::DeadlockSuspected {
                lock: mtx.name().to_owned(),
                timeout_ms: timeout.as_millis() as u64,
            });
        }
        Ok(Self {
            data,
            mtx,
            _marker: PhantomData,
        })
    }
}

impl<T> Deref for ScopedAccess<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: exclusive access is guaranteed by the held mutex.
        unsafe { self.data.as_ref() }
    }
}

impl<T> DerefMut for ScopedAccess<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { self.data.as_mut() }
    }
}

impl<T> Drop for ScopedAccess<'_, T> {
    fn drop(&mut self) {
        if let Err(e) = self.mtx.unlock() {
            tracing::warn!(mutex = %self.mtx.name(), error = %e, "unlock failed");
        }
    }
}
