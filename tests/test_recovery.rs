// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Startup against a wedged registry: bounded init, emergency cleanup and
// recovery by the next instance.

mod common;

use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use common::{
    detuned_table, test_config, unique_namespace, wait_until, FakeLiveness, RecordingTuning,
};
use mts_relay::names::SharedNames;
use mts_relay::{
    lifecycle, Error, FatalInitError, Instance, IpcMutex, MigrationError, SharedResources, ShmHandle,
    ShmOpenMode,
};

const PATIENCE: Duration = Duration::from_secs(5);

/// Hold the registry lock of `names` from another thread until `release` is
/// signalled, as a deadlocked peer would.
fn wedge_registry(names: &SharedNames) -> (mpsc::Sender<()>, thread::JoinHandle<()>) {
    let lock_name = names.registry_lock();
    let (locked_tx, locked_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let handle = thread::spawn(move || {
        let mtx = IpcMutex::open(&lock_name).expect("open registry lock");
        assert!(mtx.lock_timeout(Duration::from_secs(1)).expect("lock"));
        locked_tx.send(()).expect("signal");
        let _ = release_rx.recv();
        mtx.unlock().expect("unlock");
    });
    locked_rx.recv().expect("wedge thread");
    (release_tx, handle)
}

#[test]
fn init_times_out_and_resets_shared_state() {
    let ns = unique_namespace("wedged_timeout");
    let names = SharedNames::new(&ns);
    let liveness = FakeLiveness::new();
    let tuning = RecordingTuning::new();

    let (release, wedge) = wedge_registry(&names);

    let config = test_config(&ns, 4001)
        .with_init_timeout(Duration::from_millis(200))
        .with_lock_timeout(Duration::from_secs(3));
    let started = Instant::now();
    let err = Instance::initialize(config, tuning.clone(), liveness.clone())
        .err()
        .expect("startup must time out");
    assert!(started.elapsed() < Duration::from_secs(2), "init was not bounded");
    assert!(matches!(err, FatalInitError::TimedOut { timeout_ms: 200 }));

    // Everything of the namespace was removed while the peer still held it.
    assert!(ShmHandle::acquire(&names.segment(), 1, ShmOpenMode::Open).is_err());
    assert!(!tuning.is_master());

    release.send(()).expect("release");
    wedge.join().expect("wedge thread");

    // The next instance starts from scratch.
    let a = Instance::initialize(test_config(&ns, 4002), tuning.clone(), liveness.clone())
        .expect("initialize after reset");
    assert_eq!(a.get_channel_index(), Some(0));
    assert!(a.is_leader());
}

#[test]
fn lock_timeout_during_init_fails_and_resets() {
    let ns = unique_namespace("wedged_lock");
    let names = SharedNames::new(&ns);
    let liveness = FakeLiveness::new();
    let tuning = RecordingTuning::new();

    let (release, wedge) = wedge_registry(&names);

    let config = test_config(&ns, 4101)
        .with_init_timeout(Duration::from_secs(3))
        .with_lock_timeout(Duration::from_millis(100));
    let instance = Instance::start(config, tuning.clone(), liveness.clone());
    assert!(!instance.get_is_active());
    let message = instance.get_error_message().expect("error message");
    assert!(message.contains("timed out"), "unexpected message: {message}");

    assert!(ShmHandle::acquire(&names.segment(), 1, ShmOpenMode::Open).is_err());

    release.send(()).expect("release");
    wedge.join().expect("wedge thread");

    // Inactive instances answer every call without touching shared state.
    assert_eq!(instance.get_channel_index(), None);
    assert!(!instance.is_leader());
    assert!(matches!(instance.change_channel(3), Err(MigrationError::Inactive)));
    assert!(instance
        .get_channels_notes(&[0usize].into_iter().collect())
        .expect("notes")
        .is_empty());
}

#[test]
fn direct_failure_reports_deadlock_suspect() {
    let ns = unique_namespace("wedged_direct");
    let names = SharedNames::new(&ns);
    let liveness = FakeLiveness::new();

    let (release, wedge) = wedge_registry(&names);
    let config = test_config(&ns, 4201).with_lock_timeout(Duration::from_millis(50));
    let err = Instance::initialize(config, RecordingTuning::new(), liveness)
        .err()
        .expect("must fail");
    match err {
        FatalInitError::Failed(e @ Error::DeadlockSuspected { .. }) => {
            assert!(e.is_corruption_suspect());
            assert!(e.to_string().contains(&names.registry_lock()));
        }
        other => panic!("unexpected error: {other}"),
    }
    release.send(()).expect("release");
    wedge.join().expect("wedge thread");
}

#[test]
fn migration_lock_timeout_deactivates_and_hands_over_leadership() {
    let ns = unique_namespace("wedged_migration");
    let names = SharedNames::new(&ns);
    let liveness = FakeLiveness::new();
    let tuning = RecordingTuning::new();

    let a = Instance::initialize(test_config(&ns, 4401), tuning.clone(), liveness.clone())
        .expect("initialize a");
    let b = Instance::initialize(test_config(&ns, 4402), tuning.clone(), liveness.clone())
        .expect("initialize b");
    assert!(a.is_leader());
    assert!(!b.is_leader());

    let (release, wedge) = wedge_registry(&names);
    let err = a.change_channel(5).expect_err("migration must fail");
    assert!(matches!(
        err,
        MigrationError::Deactivated(Error::DeadlockSuspected { .. })
    ));
    assert!(!a.get_is_active());
    assert!(!a.is_leader());
    assert_eq!(a.get_channel_index(), None);
    let message = a.get_error_message().expect("error message");
    assert!(message.contains("timed out"), "unexpected message: {message}");
    assert!(!tuning.is_master());
    assert!(matches!(a.change_channel(6), Err(MigrationError::Inactive)));

    release.send(()).expect("release");
    wedge.join().expect("wedge thread");

    // Once the lock frees up the old leader gives its slot back and the
    // client takes over.
    assert!(wait_until(PATIENCE, || b.is_leader()));
    assert!(tuning.is_master());
    let shared = SharedResources::open(&test_config(&ns, 4402)).expect("open");
    let snap = shared.registry_snapshot().expect("snapshot");
    assert_eq!(snap.leader, Some(1));
    assert!(!snap.slots[0].occupied);
    assert!(!snap.slots[5].occupied);

    let table = detuned_table(-9.0);
    b.update_freqs(&table).expect("update_freqs");
    assert!(wait_until(PATIENCE, || tuning.tables_for(1).contains(&table)));

    // The deactivated instance no longer writes anything.
    a.update_freqs(&detuned_table(4.0)).expect("inactive update");
    assert_eq!(shared.tuning_snapshot(0).expect("tuning").frequencies, mts_relay::equal_temperament());
}

#[test]
fn emergency_cleanup_orphans_running_instances() {
    let ns = unique_namespace("orphaned");
    let names = SharedNames::new(&ns);
    let liveness = FakeLiveness::new();
    let tuning = RecordingTuning::new();

    let a = Instance::initialize(test_config(&ns, 4301), tuning.clone(), liveness.clone())
        .expect("initialize a");
    assert!(lifecycle::emergency_cleanup(&names) > 0);

    // The old instance keeps working on its orphaned objects...
    a.update_freqs(&detuned_table(3.0)).expect("orphan write");
    assert!(a.get_is_active());

    // ...while a newcomer builds a fresh registry and leads it.
    let b = Instance::initialize(test_config(&ns, 4302), tuning.clone(), liveness.clone())
        .expect("initialize b");
    assert_eq!(b.get_channel_index(), Some(0));
    assert!(b.is_leader());

    // The orphan exiting last in its own registry leaves the new one alone.
    drop(a);
    let shared = SharedResources::open(&test_config(&ns, 4302)).expect("open");
    assert!(shared.is_current());
    let snap = shared.registry_snapshot().expect("snapshot");
    assert_eq!(snap.occupied_count(), 1);
    assert_eq!(snap.leader, Some(0));
    assert!(!snap.retired);
}

#[test]
fn emergency_cleanup_of_unused_namespace_removes_nothing() {
    let names = SharedNames::new(&unique_namespace("never_used"));
    assert_eq!(lifecycle::emergency_cleanup(&names), 0);
}
