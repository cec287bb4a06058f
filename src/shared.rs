// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// The one handle through which an instance reaches cross-process state.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use crate::config::RelayConfig;
use crate::error::{Error, Result};
use crate::layout::{
    NoteRecord, NotesBlock, RegistryData, RegistrySnapshot, SharedLayout, SlotIndex, TuningBlock,
    TuningSnapshot, CHANNEL_COUNT, SEGMENT_SIZE,
};
use crate::names::SharedNames;
use crate::scoped_access::ScopedAccess;
use crate::{IpcMutex, ShmHandle, ShmOpenMode};

pub(crate) type RegistryGuard<'a> = ScopedAccess<'a, RegistryData>;
pub(crate) type TuningGuard<'a> = ScopedAccess<'a, TuningBlock>;
pub(crate) type NotesGuard<'a> = ScopedAccess<'a, NotesBlock>;

/// Mapped segment plus the named mutexes guarding its parts.
///
/// The registry mutex is opened eagerly; per-channel mutexes are opened the
/// first time the channel is touched. Dropping the handle unmaps everything
/// but removes nothing: removal goes through [`remove_namespace`].
pub struct SharedResources {
    names: SharedNames,
    shm: ShmHandle,
    layout: NonNull<SharedLayout>,
    registry_lock: IpcMutex,
    tuning_locks: [OnceLock<IpcMutex>; CHANNEL_COUNT],
    notes_locks: [OnceLock<IpcMutex>; CHANNEL_COUNT],
    lock_timeout: Duration,
    cancel: Arc<AtomicBool>,
}

// Safety: the segment is only accessed through ScopedAccess guards, which
// hold the matching named mutex.
unsafe impl Send for SharedResources {}
unsafe impl Sync for SharedResources {}

impl SharedResources {
    /// Open (creating if needed) the segment and registry mutex of
    /// `config.namespace`.
    pub fn open(config: &RelayConfig) -> Result<Self> {
        Self::open_cancellable(config, Arc::new(AtomicBool::new(false)))
    }

    /// Like [`SharedResources::open`], but every later attempt to open a named
    /// object fails with [`Error::Cancelled`] once `cancel` is set.
    pub(crate) fn open_cancellable(config: &RelayConfig, cancel: Arc<AtomicBool>) -> Result<Self> {
        let names = SharedNames::new(&config.namespace);
        check_cancel(&cancel)?;
        let shm = ShmHandle::acquire(&names.segment(), SEGMENT_SIZE, ShmOpenMode::CreateOrOpen)?;
        let layout = NonNull::new(shm.get() as *mut SharedLayout)
            .ok_or_else(|| Error::Io(std::io::Error::other("segment mapped at null")))?;
        if shm.is_creator() {
            tracing::info!(namespace = %names.namespace(), "created shared registry");
        }
        check_cancel(&cancel)?;
        let registry_lock = IpcMutex::open(&names.registry_lock())?;
        Ok(Self {
            names,
            shm,
            layout,
            registry_lock,
            tuning_locks: std::array::from_fn(|_| OnceLock::new()),
            notes_locks: std::array::from_fn(|_| OnceLock::new()),
            lock_timeout: config.lock_timeout,
            cancel,
        })
    }

    pub fn names(&self) -> &SharedNames {
        &self.names
    }

    /// Whether the namespace still names this handle's segment. False after
    /// an emergency cleanup, even once another instance re-created it.
    pub fn is_current(&self) -> bool {
        self.shm.is_current()
    }

    pub(crate) fn lock_registry(&self) -> Result<RegistryGuard<'_>> {
        let data = unsafe { NonNull::new_unchecked(std::ptr::addr_of_mut!((*self.layout.as_ptr()).registry)) };
        unsafe { ScopedAccess::acquire(&self.registry_lock, data, self.lock_timeout) }
    }

    pub(crate) fn lock_tuning(&self, channel: SlotIndex) -> Result<TuningGuard<'_>> {
        let mtx = self.tuning_mutex(channel)?;
        let data = unsafe {
            NonNull::new_unchecked(std::ptr::addr_of_mut!((*self.layout.as_ptr()).tuning[channel]))
        };
        unsafe { ScopedAccess::acquire(mtx, data, self.lock_timeout) }
    }

    pub(crate) fn lock_notes(&self, channel: SlotIndex) -> Result<NotesGuard<'_>> {
        let mtx = self.notes_mutex(channel)?;
        let data = unsafe {
            NonNull::new_unchecked(std::ptr::addr_of_mut!((*self.layout.as_ptr()).notes[channel]))
        };
        unsafe { ScopedAccess::acquire(mtx, data, self.lock_timeout) }
    }

    pub(crate) fn tuning_mutex(&self, channel: SlotIndex) -> Result<&IpcMutex> {
        check_channel(channel)?;
        self.open_lazily(&self.tuning_locks[channel], || self.names.tuning_lock(channel))
    }

    fn notes_mutex(&self, channel: SlotIndex) -> Result<&IpcMutex> {
        check_channel(channel)?;
        self.open_lazily(&self.notes_locks[channel], || self.names.notes_lock(channel))
    }

    fn open_lazily<'a>(
        &self,
        cell: &'a OnceLock<IpcMutex>,
        name: impl FnOnce() -> String,
    ) -> Result<&'a IpcMutex> {
        if let Some(mtx) = cell.get() {
            return Ok(mtx);
        }
        check_cancel(&self.cancel)?;
        let mtx = IpcMutex::open(&name())?;
        // A racing opener may have won; its handle is kept and ours dropped.
        Ok(cell.get_or_init(|| mtx))
    }

    /// Put a freshly claimed channel into its initial state. A stale slot may
    /// still hold a crashed owner's data.
    pub(crate) fn reset_channel(&self, channel: SlotIndex) -> Result<()> {
        self.lock_tuning(channel)?.reset();
        self.lock_notes(channel)?.clear();
        Ok(())
    }

    pub fn registry_snapshot(&self) -> Result<RegistrySnapshot> {
        Ok(self.lock_registry()?.snapshot())
    }

    pub fn tuning_snapshot(&self, channel: SlotIndex) -> Result<TuningSnapshot> {
        Ok(self.lock_tuning(channel)?.snapshot())
    }

    pub fn notes_snapshot(&self, channel: SlotIndex) -> Result<Vec<NoteRecord>> {
        Ok(self.lock_notes(channel)?.notes().to_vec())
    }
}

fn check_cancel(cancel: &AtomicBool) -> Result<()> {
    if cancel.load(Ordering::Acquire) {
        Err(Error::Cancelled)
    } else {
        Ok(())
    }
}

fn check_channel(channel: SlotIndex) -> Result<()> {
    if channel < CHANNEL_COUNT {
        Ok(())
    } else {
        Err(Error::InvalidChannel(channel))
    }
}

/// Remove the segment and every named mutex of a namespace.
///
/// Best-effort: failures are logged and the remaining objects are still
/// removed. Returns how many objects existed and were removed. Handles that
/// are still open keep working on the orphaned objects.
pub fn remove_namespace(names: &SharedNames) -> usize {
    let mut removed = 0;
    match ShmHandle::unlink_by_name(&names.segment()) {
        Ok(true) => removed += 1,
        Ok(false) => {}
        Err(e) => tracing::warn!(name = %names.segment(), error = %e, "failed to remove segment"),
    }
    for lock in names.all_locks() {
        match IpcMutex::clear_storage(&lock) {
            Ok(true) => removed += 1,
            Ok(false) => {}
            Err(e) => tracing::warn!(name = %lock, error = %e, "failed to remove mutex"),
        }
    }
    removed
}
