use std::collections::BTreeSet;
use std::time::Duration;

use crate::commands::backup::begin_backup;
use crate::commands::recon::{resume_recon, run_recon, PauseReason};
use crate::engine::Engine;
use crate::error::DdbError;
use crate::events::EngineEvent;
use crate::jobs::JobHandle;
use crate::ledger::model::{Job, JobKind, JobStatus, ReconJob, ReconPhase, VolumeFlag};
use crate::testutil::{fixture, fixture_with, test_config, ReadScript};
use ddb_types::VolumeId;

#[test]
fn phase_edges() {
    use ReconPhase::*;
    assert!(NotStarted.can_transition_to(MarkedForRecovery));
    assert!(MarkedForRecovery.can_transition_to(AddRecords));
    assert!(AddRecords.can_transition_to(Pending));
    assert!(Pending.can_transition_to(AddRecords));
    assert!(AddRecords.can_transition_to(Completed));

    assert!(!Pending.can_transition_to(Completed));
    assert!(!Pending.can_transition_to(Failed));
    assert!(!NotStarted.can_transition_to(AddRecords));
    assert!(!Completed.can_transition_to(AddRecords));
    assert!(!Failed.can_transition_to(Pending));
}

#[test]
fn full_recon_rebuilds_index_from_ledger() {
    let fx = fixture();
    let (store, subs) = fx.store("s", 2);
    let (_, v1) = fx.backup(store, subs[0], 1000);
    let (_, v2) = fx.backup(store, subs[1], 3000);
    let before = fx.engine.index_dir(store, subs[0]).load().unwrap();
    crate::commands::ddb_backup::run_ddb_backup(&fx.engine, store).unwrap();

    fx.engine.index_dir(store, subs[0]).remove_all().unwrap();
    let report = run_recon(&fx.engine, store, true).unwrap();

    assert_eq!(report.phase, ReconPhase::Completed);
    assert_eq!(report.active_volumes, 2);
    assert_eq!(report.recovered, 2);
    let after = fx.engine.index_dir(store, subs[0]).load().unwrap();
    assert_eq!(after.entries, before.entries);
    assert!(fx.engine.index_dir(store, subs[1]).load().unwrap().contains(v2));
    assert!(after.contains(v1));

    fx.engine.ledger().read(|t| {
        for s in &subs {
            let row = t.require_substore(*s).unwrap();
            assert!(!row.recovery_pending);
            assert!(row.last_snap_job.is_none());
            assert!(row.last_snap_at.is_none());
        }
        assert!(!t.require_store(store).unwrap().resync_needed);
    });
}

#[test]
fn regular_recon_without_snapshot_replays_everything() {
    let fx = fixture();
    let (store, subs) = fx.store("s", 1);
    fx.backup(store, subs[0], 100);
    fx.backup(store, subs[0], 200);

    let report = run_recon(&fx.engine, store, false).unwrap();
    assert_eq!(report.phase, ReconPhase::Completed);
    assert_eq!(report.active_volumes, 2);
    assert!(fx
        .engine
        .ledger()
        .read(|t| t.require_store(store).unwrap().resync_needed));
}

#[test]
fn active_set_skips_aged_empty_and_uncommitted_volumes() {
    let fx = fixture();
    let (store, subs) = fx.store("s", 1);
    let (_, live) = fx.backup(store, subs[0], 100);
    let (_, aged) = fx.backup(store, subs[0], 100);
    let (_, empty) = fx.backup(store, subs[0], 0);
    let mut session = begin_backup(&fx.engine, store).unwrap();
    let uncommitted = session.write_volume(subs[0], 100, 2).unwrap();
    drop(session);
    fx.engine
        .ledger()
        .write(|t| t.set_volume_flag(aged, VolumeFlag::Aged))
        .unwrap();

    let report = run_recon(&fx.engine, store, true).unwrap();
    let active = fx
        .engine
        .ledger()
        .read(|t| t.require_recon_job(report.job).unwrap().active_set.clone());
    assert_eq!(active, BTreeSet::from([live]));
    let reads = fx.reader.reads();
    for skipped in [aged, empty, uncommitted] {
        assert!(!reads.contains(&skipped));
    }
}

#[test]
fn live_writer_blocks_mark_for_recovery() {
    let fx = fixture();
    let (store, subs) = fx.store("s", 1);
    let session = begin_backup(&fx.engine, store).unwrap();

    let err = run_recon(&fx.engine, store, true).unwrap_err();
    assert!(
        matches!(err, DdbError::RecoveryPreconditionUnmet { live_writers: 1, .. }),
        "{err}"
    );
    fx.engine.ledger().read(|t| {
        let recon = t.recon_jobs_of(store).next().unwrap();
        assert_eq!(recon.phase, ReconPhase::Failed);
        assert!(!t.require_substore(subs[0]).unwrap().recovery_pending);
    });
    drop(session);
}

#[test]
fn killed_helper_resumes_automatically() {
    let fx = fixture();
    let (store, subs) = fx.store("s", 1);
    let (_, v1) = fx.backup(store, subs[0], 100);
    fx.backup(store, subs[0], 100);
    fx.reader.script(v1, ReadScript::Kill);

    let report = run_recon(&fx.engine, store, true).unwrap();
    assert_eq!(report.phase, ReconPhase::Completed);
    assert_eq!(report.resumes, 1);
    assert_eq!(report.recovered, 2);
    assert_eq!(fx.reader.reads().iter().filter(|v| **v == v1).count(), 2);
}

#[test]
fn pending_after_auto_resumes_then_manual_resume() {
    let fx = fixture_with(|c| c.recon.max_auto_resumes = 0);
    let (store, subs) = fx.store("s", 1);
    let (_, v1) = fx.backup(store, subs[0], 100);
    fx.reader.script(v1, ReadScript::Kill);
    let events = fx.engine.subscribe();

    let report = run_recon(&fx.engine, store, true).unwrap();
    assert_eq!(report.phase, ReconPhase::Pending);
    assert_eq!(report.paused, Some(PauseReason::HelperKilled));
    assert_eq!(report.recovered, 0);
    assert!(events.try_iter().any(|e| matches!(
        e,
        EngineEvent::ReconPhaseChanged {
            to: ReconPhase::Pending,
            ..
        }
    )));

    let resumed = resume_recon(&fx.engine, report.job).unwrap();
    assert_eq!(resumed.phase, ReconPhase::Completed);
    assert_eq!(resumed.resumes, 1);
    assert!(fx.engine.index_dir(store, subs[0]).load().unwrap().contains(v1));
}

#[test]
fn unresponsive_helper_moves_job_to_pending() {
    let fx = fixture_with(|c| {
        c.recon.max_auto_resumes = 0;
        c.recon.helper_timeout = "200ms".into();
    });
    let (store, subs) = fx.store("s", 1);
    let (_, v1) = fx.backup(store, subs[0], 100);
    fx.reader.script(v1, ReadScript::Hang(Duration::from_secs(1)));

    let report = run_recon(&fx.engine, store, true).unwrap();
    assert_eq!(report.phase, ReconPhase::Pending);
    assert_eq!(report.paused, Some(PauseReason::HelperUnresponsive));

    let resumed = resume_recon(&fx.engine, report.job).unwrap();
    assert_eq!(resumed.phase, ReconPhase::Completed);
}

#[test]
fn operator_kill_stops_at_batch_boundary() {
    let fx = fixture_with(|c| {
        c.recon.max_volumes_per_batch = 1;
        c.recon.parallel_reads = false;
    });
    let (store, subs) = fx.store("s", 1);
    let mut volumes = Vec::new();
    for _ in 0..3 {
        volumes.push(fx.backup(store, subs[0], 100).1);
    }
    fx.reader
        .script(volumes[0], ReadScript::Hang(Duration::from_millis(300)));
    let events = fx.engine.subscribe();

    let engine = fx.engine.clone();
    let runner = std::thread::spawn(move || run_recon(&engine, store, true));

    let job = loop {
        match events.recv_timeout(Duration::from_secs(5)).unwrap() {
            EngineEvent::ReconPhaseChanged {
                job,
                to: ReconPhase::AddRecords,
                ..
            } => break job,
            _ => continue,
        }
    };
    fx.engine
        .scheduler()
        .kill(JobHandle {
            id: job,
            kind: JobKind::Recon,
        })
        .unwrap();

    let report = runner.join().unwrap().unwrap();
    assert_eq!(report.phase, ReconPhase::Pending);
    assert_eq!(report.paused, Some(PauseReason::OperatorKill));
    assert!(report.recovered < 3);

    let resumed = resume_recon(&fx.engine, job).unwrap();
    assert_eq!(resumed.phase, ReconPhase::Completed);
    assert_eq!(resumed.recovered, 3);
}

#[test]
fn unreadable_chunks_fail_the_job() {
    let fx = fixture();
    let (store, subs) = fx.store("s", 1);
    let (_, v1) = fx.backup(store, subs[0], 100);
    fx.reader.script(v1, ReadScript::Unreadable(vec![0, 3]));

    let err = run_recon(&fx.engine, store, true).unwrap_err();
    assert!(matches!(err, DdbError::ReconIncomplete { failed: 2, .. }), "{err}");
    fx.engine.ledger().read(|t| {
        let recon = t.recon_jobs_of(store).next().unwrap();
        assert_eq!(recon.phase, ReconPhase::Failed);
        assert_eq!(t.failed_chunks(recon.id).len(), 2);
        assert!(t.require_substore(subs[0]).unwrap().recovery_pending);
    });
}

#[test]
fn failed_volume_read_fails_the_job() {
    let fx = fixture();
    let (store, subs) = fx.store("s", 1);
    let (_, v1) = fx.backup(store, subs[0], 100);
    fx.reader.script(v1, ReadScript::Fail("media error".into()));

    let err = run_recon(&fx.engine, store, true).unwrap_err();
    assert!(matches!(err, DdbError::ReconIncomplete { failed: 1, .. }), "{err}");
}

#[test]
fn resuming_a_finished_job_is_rejected() {
    let fx = fixture();
    let (store, subs) = fx.store("s", 1);
    fx.backup(store, subs[0], 100);
    let report = run_recon(&fx.engine, store, true).unwrap();

    let err = resume_recon(&fx.engine, report.job).unwrap_err();
    assert!(matches!(err, DdbError::InvalidTransition { .. }), "{err}");
}

#[test]
fn only_one_open_recon_per_store() {
    let fx = fixture_with(|c| c.recon.max_auto_resumes = 0);
    let (store, subs) = fx.store("s", 1);
    let (_, v1) = fx.backup(store, subs[0], 100);
    fx.reader.script(v1, ReadScript::Kill);
    run_recon(&fx.engine, store, true).unwrap();

    let err = run_recon(&fx.engine, store, false).unwrap_err();
    assert!(matches!(err, DdbError::InvalidState(_)), "{err}");
}

#[test]
fn denied_index_write_fails_recon() {
    let fx = fixture();
    let (store, subs) = fx.store("s", 1);
    fx.backup(store, subs[0], 100);
    fx.gate.deny(fx.engine.index_dir(store, subs[0]).path());

    let err = run_recon(&fx.engine, store, true).unwrap_err();
    assert!(err.is_policy_refusal(), "{err}");
    let phase = fx
        .engine
        .ledger()
        .read(|t| t.recon_jobs_of(store).next().unwrap().phase);
    assert_eq!(phase, ReconPhase::Failed);
}

#[test]
fn interrupted_recon_is_parked_on_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.paths.ledger = Some(dir.path().join("ledger.bin"));

    let (store, job) = {
        let engine = Engine::builder(config.clone()).open().unwrap();
        let store = crate::commands::store::create_store(&engine, "s", 1).unwrap();
        let now = engine.now();
        let job = engine.ledger().read(|t| t.max_job_id()).get() + 1;
        let job = ddb_types::JobId(job);
        engine
            .ledger()
            .write(|t| {
                t.insert_job(Job::new(job, JobKind::Recon, Some(store), now));
                t.insert_recon_job(ReconJob {
                    id: job,
                    store,
                    full: true,
                    phase: ReconPhase::AddRecords,
                    active_set: BTreeSet::<VolumeId>::new(),
                    started_at: now,
                    finished_at: None,
                    resumes: 0,
                });
                Ok(())
            })
            .unwrap();
        (store, job)
    };

    let reopened = Engine::builder(config).open().unwrap();
    let phase = reopened
        .ledger()
        .read(|t| t.require_recon_job(job).unwrap().phase);
    assert_eq!(phase, ReconPhase::Pending);

    let report = resume_recon(&reopened, job).unwrap();
    assert_eq!(report.phase, ReconPhase::Completed);
    assert_eq!(report.store, store);
}

#[test]
fn recon_cut_off_before_replay_fails_on_reopen_and_can_be_rerun() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.paths.ledger = Some(dir.path().join("ledger.bin"));

    let (store, job) = {
        let engine = Engine::builder(config.clone()).open().unwrap();
        let store = crate::commands::store::create_store(&engine, "s", 2).unwrap();
        let now = engine.now();
        let job = ddb_types::JobId(engine.ledger().read(|t| t.max_job_id()).get() + 1);
        engine
            .ledger()
            .write(|t| {
                t.insert_job(Job::new(job, JobKind::Recon, Some(store), now));
                t.insert_recon_job(ReconJob {
                    id: job,
                    store,
                    full: false,
                    phase: ReconPhase::MarkedForRecovery,
                    active_set: BTreeSet::<VolumeId>::new(),
                    started_at: now,
                    finished_at: None,
                    resumes: 0,
                });
                let subs = t.require_store(store)?.substores.clone();
                for s in subs {
                    t.substore_mut(s)?.recovery_pending = true;
                }
                Ok(())
            })
            .unwrap();
        (store, job)
    };

    let reopened = Engine::builder(config).open().unwrap();
    reopened.ledger().read(|t| {
        let recon = t.require_recon_job(job).unwrap();
        assert_eq!(recon.phase, ReconPhase::Failed);
        assert!(recon.finished_at.is_some());
        assert_eq!(t.require_job(job).unwrap().status, JobStatus::Failed);
        assert!(t.open_recon_job(store).is_none());
        assert!(t.substores_of(store).all(|s| s.recovery_pending));
    });
    assert!(matches!(
        resume_recon(&reopened, job),
        Err(DdbError::InvalidTransition { .. })
    ));
    assert!(begin_backup(&reopened, store).is_err());

    let report = run_recon(&reopened, store, false).unwrap();
    assert_eq!(report.phase, ReconPhase::Completed);
    assert!(reopened
        .ledger()
        .read(|t| t.substores_of(store).all(|s| !s.recovery_pending)));
    begin_backup(&reopened, store).unwrap().commit().unwrap();
}

#[test]
fn repeated_full_recon_with_no_writes_is_stable() {
    let fx = fixture();
    let (store, subs) = fx.store("s", 2);
    fx.backup(store, subs[0], 1000);
    fx.backup(store, subs[1], 3000);
    fx.backup(store, subs[1], 500);

    let first = run_recon(&fx.engine, store, true).unwrap();
    let indexes_after_first: Vec<_> = subs
        .iter()
        .map(|s| fx.engine.index_dir(store, *s).load().unwrap().entries)
        .collect();
    let second = run_recon(&fx.engine, store, true).unwrap();
    let indexes_after_second: Vec<_> = subs
        .iter()
        .map(|s| fx.engine.index_dir(store, *s).load().unwrap().entries)
        .collect();

    assert_eq!(first.phase, ReconPhase::Completed);
    assert_eq!(second.phase, ReconPhase::Completed);
    assert_ne!(first.job, second.job);
    assert_eq!(first.active_volumes, second.active_volumes);
    assert_eq!(first.recovered, second.recovered);
    assert_eq!(indexes_after_first, indexes_after_second);

    fx.engine.ledger().read(|t| {
        let a = t.recon_job(first.job).unwrap();
        let b = t.recon_job(second.job).unwrap();
        assert_eq!(a.active_set, b.active_set);
        assert_eq!(a.active_set.len(), 3);
        assert!(t.failed_chunks(first.job).is_empty());
        assert!(t.failed_chunks(second.job).is_empty());
    });
}

#[test]
fn each_batch_saves_a_substore_index_once() {
    let fx = fixture_with(|c| {
        c.recon.parallel_reads = false;
        c.recon.max_auto_resumes = 1;
    });
    let (store, subs) = fx.store("s", 1);
    let volumes: Vec<VolumeId> = (0..4).map(|_| fx.backup(store, subs[0], 100).1).collect();
    fx.reader.script(volumes[2], ReadScript::Kill);
    let events = fx.engine.subscribe();

    let report = run_recon(&fx.engine, store, true).unwrap();
    assert_eq!(report.phase, ReconPhase::Completed);
    assert_eq!(report.recovered, 4);

    let committed: Vec<usize> = events
        .try_iter()
        .filter_map(|e| match e {
            EngineEvent::ReconBatchCommitted { job, volumes, .. } if job == report.job => {
                Some(volumes)
            }
            _ => None,
        })
        .collect();
    assert_eq!(committed, vec![2, 2]);

    // Reset to empty, then one save for the batch cut short by the kill and
    // one for the batch that finished the job.
    let index = fx.engine.index_dir(store, subs[0]).load().unwrap();
    assert_eq!(index.generation, 2);
    for v in &volumes {
        assert!(index.contains(*v));
    }
}
