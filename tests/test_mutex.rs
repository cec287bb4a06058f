// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Named inter-process mutex: bounded acquisition, mutual exclusion and
// recovery from a holder that died.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use mts_relay::{current_pid, IpcMutex};

static COUNTER: AtomicUsize = AtomicUsize::new(0);

const PATIENCE: Duration = Duration::from_secs(5);

fn unique_name(prefix: &str) -> String {
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    let name = format!("{prefix}_mtx_{n}_{}", current_pid());
    let _ = IpcMutex::clear_storage(&name);
    name
}

#[test]
fn lock_unlock() {
    let name = unique_name("lock_unlock");
    let mtx = IpcMutex::open(&name).expect("open");
    assert_eq!(mtx.name(), name);
    assert!(mtx.lock_timeout(PATIENCE).expect("lock"));
    mtx.unlock().expect("unlock");
    assert!(IpcMutex::clear_storage(&name).expect("clear"));
}

#[test]
fn clear_storage_reports_missing() {
    let name = unique_name("clear_missing");
    assert!(!IpcMutex::clear_storage(&name).expect("clear"));
    {
        let _mtx = IpcMutex::open(&name).expect("open");
    }
    assert!(IpcMutex::clear_storage(&name).expect("clear"));
    let reopened = IpcMutex::open(&name).expect("reopen after clear");
    assert!(reopened.try_lock().expect("try_lock"));
    reopened.unlock().expect("unlock");
    IpcMutex::clear_storage(&name).expect("clear");
}

#[test]
fn lock_timeout_expires_while_held() {
    let name = unique_name("timeout");
    let (locked_tx, locked_rx) = std::sync::mpsc::channel();
    let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();

    let holder_name = name.clone();
    let holder = thread::spawn(move || {
        let mtx = IpcMutex::open(&holder_name).expect("open holder");
        assert!(mtx.lock_timeout(PATIENCE).expect("lock"));
        locked_tx.send(()).expect("signal");
        let _ = release_rx.recv();
        mtx.unlock().expect("unlock");
    });
    locked_rx.recv().expect("holder locked");

    let mtx = IpcMutex::open(&name).expect("open");
    let started = Instant::now();
    assert!(!mtx.lock_timeout(Duration::from_millis(50)).expect("lock_timeout"));
    assert!(started.elapsed() >= Duration::from_millis(40));
    assert!(!mtx.try_lock().expect("try_lock"));

    release_tx.send(()).expect("release");
    holder.join().expect("holder");
    assert!(mtx.lock_timeout(PATIENCE).expect("lock after release"));
    mtx.unlock().expect("unlock");
    IpcMutex::clear_storage(&name).expect("clear");
}

#[test]
fn mutual_exclusion_across_handles() {
    let name = unique_name("exclusion");
    let in_cs = Arc::new(AtomicBool::new(false));
    let violation = Arc::new(AtomicBool::new(false));
    let counter = Arc::new(AtomicI32::new(0));

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let name = name.clone();
            let in_cs = Arc::clone(&in_cs);
            let violation = Arc::clone(&violation);
            let counter = Arc::clone(&counter);
            thread::spawn(move || {
                let mtx = IpcMutex::open(&name).expect("open");
                for _ in 0..100 {
                    assert!(mtx.lock_timeout(PATIENCE).expect("lock"));
                    if in_cs.swap(true, Ordering::SeqCst) {
                        violation.store(true, Ordering::SeqCst);
                    }
                    counter.fetch_add(1, Ordering::Relaxed);
                    thread::yield_now();
                    in_cs.store(false, Ordering::SeqCst);
                    mtx.unlock().expect("unlock");
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }
    assert!(!violation.load(Ordering::SeqCst), "two holders at once");
    assert_eq!(counter.load(Ordering::Relaxed), 400);
    IpcMutex::clear_storage(&name).expect("clear");
}

#[cfg(target_os = "linux")]
#[test]
fn dead_holder_is_recovered() {
    let name = unique_name("dead_holder");
    // Keeps the mapping alive so the holder's exit cannot re-initialise it.
    let mtx = IpcMutex::open(&name).expect("open");
    let holder_name = name.clone();
    thread::spawn(move || {
        let mtx = IpcMutex::open(&holder_name).expect("open holder");
        assert!(mtx.lock_timeout(PATIENCE).expect("lock"));
        // Exits without unlocking.
    })
    .join()
    .expect("holder");

    assert!(mtx.lock_timeout(PATIENCE).expect("lock after owner death"));
    mtx.unlock().expect("unlock");
    assert!(mtx.try_lock().expect("try_lock"));
    mtx.unlock().expect("unlock");
    IpcMutex::clear_storage(&name).expect("clear");
}
