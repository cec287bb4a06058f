// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Named shared memory segment handle.

use std::io;

use crate::platform::{PlatformShm, ShmMode};

/// Open mode for shared memory segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShmOpenMode {
    /// Create exclusively; fail if it already exists.
    Create,
    /// Open existing; fail if it does not exist.
    Open,
    /// Create if missing, open if it already exists.
    CreateOrOpen,
}

/// A named, inter-process shared memory region.
///
/// A freshly created region is zero-filled. A trailing counter tracks how
/// many mappings are alive. Dropping a handle unmaps it but never removes the
/// name; removal is explicit via [`ShmHandle::unlink`] or
/// [`ShmHandle::unlink_by_name`].
pub struct ShmHandle {
    inner: PlatformShm,
}

impl ShmHandle {
    /// Map `size` usable bytes of the segment `name`.
    pub fn acquire(name: &str, size: usize, mode: ShmOpenMode) -> io::Result<Self> {
        let platform_mode = match mode {
            ShmOpenMode::Create => ShmMode::Create,
            ShmOpenMode::Open => ShmMode::Open,
            ShmOpenMode::CreateOrOpen => ShmMode::CreateOrOpen,
        };
        let inner = PlatformShm::acquire(name, size, platform_mode)?;
        Ok(Self { inner })
    }

    /// Pointer to the start of the usable region.
    pub fn get(&self) -> *mut u8 {
        self.inner.as_mut_ptr()
    }

    pub fn user_size(&self) -> usize {
        self.inner.user_size()
    }

    /// Whether this handle's mapping created the segment.
    pub fn is_creator(&self) -> bool {
        self.inner.prev_ref_count() == 0
    }

    /// Number of live mappings, across processes.
    pub fn ref_count(&self) -> i32 {
        self.inner.ref_count()
    }

    /// The POSIX name used to open the segment.
    pub fn name(&self) -> &str {
        self.inner.name()
    }

    /// Whether the name still refers to this handle's segment. False once it
    /// was removed, even if a new segment was created under the same name.
    pub fn is_current(&self) -> bool {
        self.inner.is_current()
    }

    /// Remove the name; this mapping stays usable.
    pub fn unlink(&self) {
        self.inner.unlink();
    }

    /// Remove a segment by name. `Ok(false)` if it did not exist.
    pub fn unlink_by_name(name: &str) -> io::Result<bool> {
        PlatformShm::unlink_by_name(name)
    }
}
