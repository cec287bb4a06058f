// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// POSIX backend: named shared memory segments, process-shared robust mutexes
// living in their own tiny segments, and process liveness queries.

use std::collections::HashMap;
use std::ffi::CString;
use std::io;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::names;

// ---------------------------------------------------------------------------
// Process-local mutex cache.
// All threads of one process that open the same named mutex must use the same
// mmap: macOS pthreads store internal pointers relative to the address used
// for pthread_mutex_init, so a second mapping at another address fails with
// EINVAL on lock.
// ---------------------------------------------------------------------------

pub(crate) struct CachedShm {
    pub(crate) shm: PlatformShm,
    local_ref: AtomicUsize,
}

#[derive(Default)]
struct ShmCache {
    map: HashMap<String, Arc<CachedShm>>,
}

fn mutex_cache() -> &'static Mutex<ShmCache> {
    static CACHE: OnceLock<Mutex<ShmCache>> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(ShmCache::default()))
}

/// Acquire or reuse a cached mapping.
///
/// The first local open runs `init_fn` while the cache lock is held, so no
/// other thread can see the object before it is initialised.
fn cached_shm_acquire<F>(name: &str, size: usize, init_fn: F) -> io::Result<Arc<CachedShm>>
where
    F: FnOnce(*mut u8) -> io::Result<()>,
{
    let mut c = mutex_cache().lock();
    if let Some(entry) = c.map.get(name) {
        entry.local_ref.fetch_add(1, Ordering::Relaxed);
        return Ok(Arc::clone(entry));
    }
    let shm = PlatformShm::acquire(name, size, ShmMode::CreateOrOpen)?;
    if shm.prev_ref_count() == 0 {
        init_fn(shm.as_mut_ptr())?;
    }
    let entry = Arc::new(CachedShm {
        shm,
        local_ref: AtomicUsize::new(1),
    });
    c.map.insert(name.to_string(), Arc::clone(&entry));
    Ok(entry)
}

fn cached_shm_release(name: &str, entry: &Arc<CachedShm>) {
    let mut c = mutex_cache().lock();
    // A purged entry may have been replaced by a fresh one under the same name.
    let same = c.map.get(name).is_some_and(|e| Arc::ptr_eq(e, entry));
    if same && entry.local_ref.fetch_sub(1, Ordering::AcqRel) <= 1 {
        c.map.remove(name);
    }
}

fn cached_shm_purge(name: &str) {
    mutex_cache().lock().map.remove(name);
}

// ---------------------------------------------------------------------------
// Robust mutex symbols, not exposed by `libc` on every platform.
// macOS has no robust mutexes.
// ---------------------------------------------------------------------------

#[cfg(not(target_os = "macos"))]
const EOWNERDEAD: i32 = libc::EOWNERDEAD;

#[cfg(not(target_os = "macos"))]
extern "C" {
    fn pthread_mutexattr_setrobust(
        attr: *mut libc::pthread_mutexattr_t,
        robustness: libc::c_int,
    ) -> libc::c_int;
    fn pthread_mutex_consistent(mutex: *mut libc::pthread_mutex_t) -> libc::c_int;
    fn pthread_mutex_timedlock(
        mutex: *mut libc::pthread_mutex_t,
        abstime: *const libc::timespec,
    ) -> libc::c_int;
}

#[cfg(not(target_os = "macos"))]
const PTHREAD_MUTEX_ROBUST: libc::c_int = 1;

// ---------------------------------------------------------------------------
// Layout helpers: user region rounded up to the counter alignment, followed
// by an `AtomicI32` counting live mappings.
// ---------------------------------------------------------------------------

const ALIGN: usize = std::mem::align_of::<AtomicI32>();

pub(crate) fn calc_size(user_size: usize) -> usize {
    let aligned = user_size.div_ceil(ALIGN) * ALIGN;
    aligned + std::mem::size_of::<AtomicI32>()
}

/// # Safety
/// `mem` must point to a live mapping of at least `total_size` bytes.
unsafe fn acc_of<'a>(mem: *mut u8, total_size: usize) -> &'a AtomicI32 {
    let offset = total_size - std::mem::size_of::<AtomicI32>();
    &*(mem.add(offset) as *const AtomicI32)
}

// ---------------------------------------------------------------------------
// PlatformShm
// ---------------------------------------------------------------------------

pub struct PlatformShm {
    mem: *mut u8,
    size: usize,
    user_size: usize,
    name: String,
    prev_ref: i32,
    unlinked: AtomicBool,
    identity: (libc::dev_t, libc::ino_t),
}

// Safety: the mapping is process-shared by design; all access to the user
// region is serialised by named mutexes.
unsafe impl Send for PlatformShm {}
unsafe impl Sync for PlatformShm {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShmMode {
    Create,
    Open,
    CreateOrOpen,
}

/// How long an opener waits for a concurrent creator to size the object.
const SIZE_WAIT: Duration = Duration::from_millis(100);

impl PlatformShm {
    pub fn acquire(name: &str, user_size: usize, mode: ShmMode) -> io::Result<Self> {
        if name.is_empty() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "name is empty"));
        }
        if user_size == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "size is 0"));
        }

        let posix_name = names::make_shm_name(name);
        let c_name = CString::new(posix_name.as_bytes())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let perms: libc::mode_t = 0o666;
        let total_size = calc_size(user_size);

        let open_excl = || unsafe {
            libc::shm_open(
                c_name.as_ptr(),
                libc::O_RDWR | libc::O_CREAT | libc::O_EXCL,
                perms as libc::c_uint,
            )
        };
        let open_existing =
            || unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, perms as libc::c_uint) };

        // Exclusive create first so ftruncate only runs on objects we own;
        // macOS may zero an already-sized object on a second ftruncate.
        let (fd, created) = match mode {
            ShmMode::Create => match open_excl() {
                -1 => return Err(io::Error::last_os_error()),
                f => (f, true),
            },
            ShmMode::Open => match open_existing() {
                -1 => return Err(io::Error::last_os_error()),
                f => (f, false),
            },
            ShmMode::CreateOrOpen => match open_excl() {
                -1 => {
                    let e = io::Error::last_os_error();
                    if e.raw_os_error() != Some(libc::EEXIST) {
                        return Err(e);
                    }
                    match open_existing() {
                        -1 => return Err(io::Error::last_os_error()),
                        f => (f, false),
                    }
                }
                f => (f, true),
            },
        };

        unsafe { libc::fchmod(fd, perms) };

        if created {
            if unsafe { libc::ftruncate(fd, total_size as libc::off_t) } != 0 {
                let err = io::Error::last_os_error();
                unsafe { libc::close(fd) };
                return Err(err);
            }
        } else if let Err(e) = wait_for_size(fd, total_size) {
            unsafe { libc::close(fd) };
            return Err(e);
        }

        Self::mmap_and_finish(fd, total_size, user_size, posix_name)
    }

    fn mmap_and_finish(
        fd: i32,
        total_size: usize,
        user_size: usize,
        posix_name: String,
    ) -> io::Result<Self> {
        let identity = match file_identity(fd) {
            Ok(id) => id,
            Err(e) => {
                unsafe { libc::close(fd) };
                return Err(e);
            }
        };
        let mem = unsafe {
            libc::mmap(
                ptr::null_mut(),
                total_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        unsafe { libc::close(fd) };

        if mem == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        let prev = unsafe { acc_of(mem as *mut u8, total_size).fetch_add(1, Ordering::AcqRel) };

        Ok(Self {
            mem: mem as *mut u8,
            size: total_size,
            user_size,
            name: posix_name,
            prev_ref: prev,
            unlinked: AtomicBool::new(false),
            identity,
        })
    }

    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.mem
    }

    pub fn user_size(&self) -> usize {
        self.user_size
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Mapping count before our own increment; 0 means we mapped it first.
    pub fn prev_ref_count(&self) -> i32 {
        self.prev_ref
    }

    pub fn ref_count(&self) -> i32 {
        unsafe { acc_of(self.mem, self.size).load(Ordering::Acquire) }
    }

    /// Remove the name. The mapping stays valid until drop. Idempotent per
    /// handle, so a later drop never unlinks an object re-created under the
    /// same name.
    pub fn unlink(&self) {
        if self.unlinked.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Ok(c_name) = CString::new(self.name.as_bytes()) {
            unsafe { libc::shm_unlink(c_name.as_ptr()) };
        }
    }

    /// Whether the name still refers to the object this handle mapped, as
    /// opposed to having been removed or re-created since.
    pub fn is_current(&self) -> bool {
        let Ok(c_name) = CString::new(self.name.as_bytes()) else {
            return false;
        };
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDONLY, 0 as libc::c_uint) };
        if fd == -1 {
            return false;
        }
        let identity = file_identity(fd);
        unsafe { libc::close(fd) };
        identity.is_ok_and(|id| id == self.identity)
    }

    /// Unlink by logical name. Returns false if the name did not exist.
    pub fn unlink_by_name(name: &str) -> io::Result<bool> {
        let posix_name = names::make_shm_name(name);
        let c_name = CString::new(posix_name.as_bytes())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        if unsafe { libc::shm_unlink(c_name.as_ptr()) } == 0 {
            return Ok(true);
        }
        let e = io::Error::last_os_error();
        if e.raw_os_error() == Some(libc::ENOENT) {
            Ok(false)
        } else {
            Err(e)
        }
    }
}

impl Drop for PlatformShm {
    fn drop(&mut self) {
        // Removal of the name is always explicit (last-exit or emergency
        // cleanup); dropping only releases this mapping.
        unsafe {
            acc_of(self.mem, self.size).fetch_sub(1, Ordering::AcqRel);
            libc::munmap(self.mem as *mut libc::c_void, self.size);
        }
    }
}

fn file_identity(fd: i32) -> io::Result<(libc::dev_t, libc::ino_t)> {
    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::fstat(fd, &mut st) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok((st.st_dev, st.st_ino))
}

/// An opener can race the creator between `shm_open` and `ftruncate`;
/// mapping a zero-length object would fault on first access.
fn wait_for_size(fd: i32, total_size: usize) -> io::Result<()> {
    let deadline = Instant::now() + SIZE_WAIT;
    loop {
        let mut st: libc::stat = unsafe { std::mem::zeroed() };
        if unsafe { libc::fstat(fd, &mut st) } != 0 {
            return Err(io::Error::last_os_error());
        }
        if st.st_size as usize >= total_size {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("shared object is {} bytes, expected {total_size}", st.st_size),
            ));
        }
        std::thread::sleep(Duration::from_millis(1));
    }
}

// ---------------------------------------------------------------------------
// PlatformMutex
// ---------------------------------------------------------------------------

pub struct PlatformMutex {
    cached: Arc<CachedShm>,
    name: String,
}

impl PlatformMutex {
    /// Open (or create) a named process-shared mutex.
    ///
    /// The creator initialises it with `PTHREAD_PROCESS_SHARED` and (except
    /// on macOS) `PTHREAD_MUTEX_ROBUST`, so a holder that dies releases it.
    pub fn open(name: &str) -> io::Result<Self> {
        let shm_size = std::mem::size_of::<libc::pthread_mutex_t>();
        let cached = cached_shm_acquire(name, shm_size, |base| {
            let mtx_ptr = base as *mut libc::pthread_mutex_t;
            unsafe {
                ptr::write_bytes(mtx_ptr, 0, 1);

                let mut attr: libc::pthread_mutexattr_t = std::mem::zeroed();
                let mut eno = libc::pthread_mutexattr_init(&mut attr);
                if eno != 0 {
                    return Err(io::Error::from_raw_os_error(eno));
                }

                eno = libc::pthread_mutexattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED);
                if eno != 0 {
                    libc::pthread_mutexattr_destroy(&mut attr);
                    return Err(io::Error::from_raw_os_error(eno));
                }

                #[cfg(not(target_os = "macos"))]
                {
                    eno = pthread_mutexattr_setrobust(&mut attr, PTHREAD_MUTEX_ROBUST);
                    if eno != 0 {
                        libc::pthread_mutexattr_destroy(&mut attr);
                        return Err(io::Error::from_raw_os_error(eno));
                    }
                }

                eno = libc::pthread_mutex_init(mtx_ptr, &attr);
                libc::pthread_mutexattr_destroy(&mut attr);
                if eno != 0 {
                    return Err(io::Error::from_raw_os_error(eno));
                }
            }
            Ok(())
        })?;

        Ok(Self {
            cached,
            name: name.to_string(),
        })
    }

    fn mtx_ptr(&self) -> *mut libc::pthread_mutex_t {
        self.cached.shm.as_mut_ptr() as *mut libc::pthread_mutex_t
    }

    /// `Ok(true)` if acquired within `timeout`, `Ok(false)` on timeout.
    /// A holder that died is recovered via `pthread_mutex_consistent`.
    #[cfg(not(target_os = "macos"))]
    pub fn lock_timeout(&self, timeout: Duration) -> io::Result<bool> {
        let mut ts: libc::timespec = unsafe { std::mem::zeroed() };
        unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut ts) };
        let ns_total = ts.tv_nsec as u64 + u64::from(timeout.subsec_nanos());
        ts.tv_sec += timeout.as_secs() as libc::time_t + (ns_total / 1_000_000_000) as libc::time_t;
        ts.tv_nsec = (ns_total % 1_000_000_000) as libc::c_long;
        loop {
            let eno = unsafe { pthread_mutex_timedlock(self.mtx_ptr(), &ts) };
            match eno {
                0 => return Ok(true),
                libc::ETIMEDOUT => return Ok(false),
                EOWNERDEAD => {
                    self.make_consistent()?;
                    return Ok(true);
                }
                libc::EINTR => continue,
                _ => return Err(io::Error::from_raw_os_error(eno)),
            }
        }
    }

    /// macOS lacks `pthread_mutex_timedlock`; poll `trylock` with backoff.
    #[cfg(target_os = "macos")]
    pub fn lock_timeout(&self, timeout: Duration) -> io::Result<bool> {
        let deadline = Instant::now() + timeout;
        let mut k = 0u32;
        loop {
            if self.try_lock()? {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            if k < 16 {
                std::thread::yield_now();
            } else {
                std::thread::sleep(Duration::from_micros(100));
            }
            k = k.saturating_add(1);
        }
    }

    pub fn try_lock(&self) -> io::Result<bool> {
        let eno = unsafe { libc::pthread_mutex_trylock(self.mtx_ptr()) };
        match eno {
            0 => Ok(true),
            libc::EBUSY => Ok(false),
            #[cfg(not(target_os = "macos"))]
            EOWNERDEAD => {
                self.make_consistent()?;
                Ok(true)
            }
            _ => Err(io::Error::from_raw_os_error(eno)),
        }
    }

    #[cfg(not(target_os = "macos"))]
    fn make_consistent(&self) -> io::Result<()> {
        tracing::warn!(mutex = %self.name, "previous holder died, recovering mutex");
        match unsafe { pthread_mutex_consistent(self.mtx_ptr()) } {
            0 => Ok(()),
            eno => Err(io::Error::from_raw_os_error(eno)),
        }
    }

    pub fn unlock(&self) -> io::Result<()> {
        match unsafe { libc::pthread_mutex_unlock(self.mtx_ptr()) } {
            0 => Ok(()),
            eno => Err(io::Error::from_raw_os_error(eno)),
        }
    }

    /// Remove the backing segment and forget the cached mapping, so the next
    /// `open` creates a fresh mutex. Existing handles keep working on the
    /// orphaned mapping.
    pub fn clear_storage(name: &str) -> io::Result<bool> {
        cached_shm_purge(name);
        PlatformShm::unlink_by_name(name)
    }
}

impl Drop for PlatformMutex {
    fn drop(&mut self) {
        // No pthread_mutex_destroy: on macOS the address may already be
        // recycled for another segment. munmap is enough.
        cached_shm_release(&self.name, &self.cached);
    }
}

// ---------------------------------------------------------------------------
// Processes
// ---------------------------------------------------------------------------

pub fn current_pid() -> i32 {
    unsafe { libc::getpid() }
}

/// `kill(pid, 0)` succeeds for live processes; EPERM still means the process
/// exists but belongs to someone else.
pub fn pid_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH)
}
