use std::sync::Arc;
use std::time::Duration;

use crate::access::PathGate;
use crate::commands::reclaim::run_space_reclaim;
use crate::commands::recon::run_recon;
use crate::commands::resync::run_pending;
use crate::commands::store::{create_store, enable_worm};
use crate::engine::Engine;
use crate::error::DdbError;
use crate::ledger::model::{JobKind, JobStatus, VolumeFlag};
use crate::testutil::{fixture, test_config, SlowGate};

fn reclaim_jobs(engine: &Engine) -> Vec<JobStatus> {
    engine.ledger().read(|t| {
        t.jobs()
            .filter(|j| j.kind == JobKind::SpaceReclaim)
            .map(|j| j.status)
            .collect()
    })
}

#[test]
fn drops_dead_entries_and_stray_files() {
    let fx = fixture();
    let (store, subs) = fx.store("s", 2);
    let (_, dead) = fx.backup(store, subs[0], 700);
    let (_, live) = fx.backup(store, subs[0], 300);
    fx.engine
        .ledger()
        .write(|t| t.set_volume_flag(dead, VolumeFlag::Aged))
        .unwrap();
    let dir = fx.engine.index_dir(store, subs[0]);
    std::fs::write(dir.path().join("leftover.bin"), b"junk").unwrap();

    let stats = run_space_reclaim(&fx.engine, store, true).unwrap();
    assert_eq!(stats.substores, 2);
    assert_eq!(stats.entries_total, 2);
    assert_eq!(stats.entries_dropped, 1);
    assert_eq!(stats.bytes_reclaimed, 700);
    assert_eq!(stats.orphans_removed, 1);

    let index = dir.load().unwrap();
    assert!(index.contains(live));
    assert!(!index.contains(dead));
    assert!(!dir.path().join("leftover.bin").exists());
    assert_eq!(reclaim_jobs(&fx.engine), vec![JobStatus::Completed]);
}

#[test]
fn stray_files_survive_without_orphan_cleanup() {
    let fx = fixture();
    let (store, subs) = fx.store("s", 1);
    fx.backup(store, subs[0], 100);
    let dir = fx.engine.index_dir(store, subs[0]);
    std::fs::write(dir.path().join("leftover.bin"), b"junk").unwrap();

    let stats = run_space_reclaim(&fx.engine, store, false).unwrap();
    assert_eq!(stats.orphans_removed, 0);
    assert!(dir.path().join("leftover.bin").exists());
}

#[test]
fn refused_while_worm_locked() {
    let fx = fixture();
    let (store, _) = fx.store("s", 1);
    enable_worm(&fx.engine, store, 3).unwrap();

    let err = run_space_reclaim(&fx.engine, store, true).unwrap_err();
    assert!(
        matches!(err, DdbError::ReclaimRefusedWormLocked { store: s, .. } if s == store),
        "{err}"
    );
    assert!(err.is_policy_refusal());
    assert!(reclaim_jobs(&fx.engine).is_empty());

    fx.advance_days(4);
    run_space_reclaim(&fx.engine, store, true).unwrap();
}

#[test]
fn denied_index_write_fails_the_job() {
    let fx = fixture();
    let (store, subs) = fx.store("s", 1);
    fx.gate.deny(fx.engine.index_dir(store, subs[0]).path());

    let err = run_space_reclaim(&fx.engine, store, false).unwrap_err();
    assert!(matches!(err, DdbError::WriteDenied { .. }), "{err}");
    assert_eq!(reclaim_jobs(&fx.engine), vec![JobStatus::Failed]);
}

#[test]
fn hung_reclaim_is_killed_and_reported_as_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.reclaim.timeout = "100ms".into();
    let gate = Arc::new(SlowGate {
        delay: Duration::from_millis(600),
        inner: PathGate::new(),
    });
    let engine = Engine::builder(config).access(gate).open().unwrap();
    let store = create_store(&engine, "s", 1).unwrap();

    let err = run_space_reclaim(&engine, store, false).unwrap_err();
    assert!(matches!(err, DdbError::Timeout(_)), "{err}");
    assert_eq!(reclaim_jobs(&engine), vec![JobStatus::Killed]);
}

#[test]
fn refused_until_restored_index_is_resynced() {
    let fx = fixture();
    let (store, subs) = fx.store("s", 1);
    fx.backup(store, subs[0], 100);
    run_recon(&fx.engine, store, false).unwrap();

    let err = run_space_reclaim(&fx.engine, store, false).unwrap_err();
    assert!(matches!(err, DdbError::InvalidState(_)), "{err}");
    assert!(reclaim_jobs(&fx.engine).is_empty());

    run_pending(&fx.engine).unwrap();
    run_space_reclaim(&fx.engine, store, false).unwrap();
    assert_eq!(reclaim_jobs(&fx.engine), vec![JobStatus::Completed]);
}
