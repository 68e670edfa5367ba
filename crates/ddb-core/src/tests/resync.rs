use crate::commands::recon::run_recon;
use crate::commands::resync::{run_pending, run_resync};
use crate::error::DdbError;
use crate::events::EngineEvent;
use crate::index::IndexEntry;
use crate::ledger::model::{
    resync_flags, MaintenanceReason, RESYNC_FAILED, RESYNC_SUCCESS,
};
use crate::testutil::fixture;
use ddb_types::VolumeId;

#[test]
fn resync_records_history_and_clears_flag() {
    let fx = fixture();
    let (store, subs) = fx.store("s", 2);
    fx.backup(store, subs[0], 100);
    run_recon(&fx.engine, store, false).unwrap();
    assert!(fx
        .engine
        .ledger()
        .read(|t| t.require_store(store).unwrap().resync_needed));

    let reports = run_pending(&fx.engine).unwrap();
    assert_eq!(reports.len(), 1);
    let report = &reports[0];
    assert_eq!(report.status, RESYNC_SUCCESS);
    assert_eq!(report.attempt, 1);
    assert_ne!(report.flags & resync_flags::ALL_SUBSTORES, 0);

    fx.engine.ledger().read(|t| {
        assert!(!t.require_store(store).unwrap().resync_needed);
        let history = t.resync_history(store);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, RESYNC_SUCCESS);
        assert_eq!(history[0].reason, MaintenanceReason::PostReconstruction);
    });

    // Nothing left to do.
    assert!(run_pending(&fx.engine).unwrap().is_empty());
}

#[test]
fn resync_adds_missing_and_drops_stale_entries() {
    let fx = fixture();
    let (store, subs) = fx.store("s", 1);
    let (_, v1) = fx.backup(store, subs[0], 100);
    let (_, v2) = fx.backup(store, subs[0], 200);

    let dir = fx.engine.index_dir(store, subs[0]);
    let mut index = dir.load().unwrap();
    index.remove(v2);
    index.upsert(
        VolumeId(999),
        IndexEntry {
            chunk_count: 1,
            bytes: 1,
        },
    );
    dir.save(&mut index).unwrap();

    let report = run_resync(&fx.engine, store, MaintenanceReason::Operator).unwrap();
    assert_eq!(report.added, 1);
    assert_eq!(report.dropped, 1);
    assert_eq!(
        report.flags,
        resync_flags::ALL_SUBSTORES | resync_flags::ADD_MISSING | resync_flags::DROP_STALE
    );

    let index = dir.load().unwrap();
    assert!(index.contains(v1));
    assert!(index.contains(v2));
    assert!(!index.contains(VolumeId(999)));
}

#[test]
fn failed_resync_is_recorded_and_retried_with_next_attempt() {
    let fx = fixture();
    let (store, subs) = fx.store("s", 1);
    fx.backup(store, subs[0], 100);
    fx.engine
        .ledger()
        .write(|t| {
            t.store_mut(store)?.resync_needed = true;
            Ok(())
        })
        .unwrap();
    let dir = fx.engine.index_dir(store, subs[0]);
    fx.gate.deny(dir.path());
    let events = fx.engine.subscribe();

    let err = run_resync(&fx.engine, store, MaintenanceReason::Operator).unwrap_err();
    assert!(err.is_policy_refusal(), "{err}");
    assert!(events.try_iter().any(|e| matches!(
        e,
        EngineEvent::ResyncFinished {
            attempt: 1,
            status: RESYNC_FAILED,
            ..
        }
    )));
    // The pass keeps going past the failing store.
    assert!(run_pending(&fx.engine).unwrap().is_empty());

    fx.gate.allow(dir.path());
    let reports = run_pending(&fx.engine).unwrap();
    assert_eq!(reports[0].attempt, 3);

    let statuses: Vec<(u32, i32)> = fx.engine.ledger().read(|t| {
        t.resync_history(store)
            .iter()
            .map(|e| (e.attempt, e.status))
            .collect()
    });
    assert_eq!(
        statuses,
        vec![(1, RESYNC_FAILED), (2, RESYNC_FAILED), (3, RESYNC_SUCCESS)]
    );
}

#[test]
fn resync_waits_for_open_reconstruction() {
    let fx = crate::testutil::fixture_with(|c| c.recon.max_auto_resumes = 0);
    let (store, subs) = fx.store("s", 1);
    let (_, v1) = fx.backup(store, subs[0], 100);
    fx.reader.script(v1, crate::testutil::ReadScript::Kill);
    run_recon(&fx.engine, store, false).unwrap();

    let err = run_resync(&fx.engine, store, MaintenanceReason::Operator).unwrap_err();
    assert!(matches!(err, DdbError::InvalidState(_)), "{err}");
}
