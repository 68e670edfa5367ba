use crate::commands::backup::begin_backup;
use crate::commands::store::seal;
use crate::error::DdbError;
use crate::ledger::model::{JobStatus, VolumeFlag};
use crate::testutil::fixture;

#[test]
fn committed_backup_stamps_volumes_and_index() {
    let fx = fixture();
    let (store, subs) = fx.store("s", 2);

    let mut session = begin_backup(&fx.engine, store).unwrap();
    let v1 = session.write_volume(subs[0], 4096, 10).unwrap();
    let v2 = session.write_volume(subs[1], 2048, 5).unwrap();
    session.extend_volume(v1, 1024, 2).unwrap();
    let job = session.commit().unwrap();

    fx.engine.ledger().read(|t| {
        let j = t.require_job(job).unwrap();
        assert_eq!(j.status, JobStatus::Completed);
        assert!(j.finished_at.is_some());

        let vol = t.require_volume(v1).unwrap();
        assert_eq!(vol.physical_bytes, 5120);
        assert_eq!(vol.chunk_count, 12);
        assert_eq!(vol.flag, VolumeFlag::Active);
        assert!(vol.last_backup_at.is_some());
        assert_eq!(t.volumes_of_job(job).len(), 2);
        assert!(t.require_volume(v2).unwrap().last_backup_at.is_some());
    });

    let index = fx.engine.index_dir(store, subs[0]).load().unwrap();
    assert_eq!(index.entries[&v1].chunk_count, 12);
    assert_eq!(index.entries[&v1].bytes, 5120);
    assert!(!index.contains(v2));
}

#[test]
fn reference_links_job_to_existing_volume() {
    let fx = fixture();
    let (store, subs) = fx.store("s", 1);
    let (first, volume) = fx.backup(store, subs[0], 1000);

    let mut session = begin_backup(&fx.engine, store).unwrap();
    session.reference_volume(volume, 700).unwrap();
    let second = session.commit().unwrap();

    let refs = fx.engine.ledger().read(|t| t.jobs_referencing(volume));
    assert!(refs.contains(&first));
    assert!(refs.contains(&second));
}

#[test]
fn dropped_session_fails_the_job() {
    let fx = fixture();
    let (store, subs) = fx.store("s", 1);

    let mut session = begin_backup(&fx.engine, store).unwrap();
    let job = session.job();
    let volume = session.write_volume(subs[0], 100, 1).unwrap();
    drop(session);

    fx.engine.ledger().read(|t| {
        assert_eq!(t.require_job(job).unwrap().status, JobStatus::Failed);
        assert!(t.require_volume(volume).unwrap().last_backup_at.is_none());
    });
    assert_eq!(fx.engine.quiesce().live_writers(subs[0]), 0);
}

#[test]
fn sealed_store_accepts_no_backups() {
    let fx = fixture();
    let (store, _) = fx.store("s", 1);
    fx.advance_days(2);
    seal(&fx.engine, store).unwrap();

    let err = begin_backup(&fx.engine, store).err().unwrap();
    assert!(matches!(err, DdbError::StoreSealed(s) if s == store));
}

#[test]
fn foreign_substore_is_rejected() {
    let fx = fixture();
    let (store, _) = fx.store("a", 1);
    let (_, other_subs) = fx.store("b", 1);

    let mut session = begin_backup(&fx.engine, store).unwrap();
    let err = session.write_volume(other_subs[0], 10, 1).unwrap_err();
    assert!(matches!(err, DdbError::InvalidState(_)), "{err}");
}

#[test]
fn denied_index_path_stops_the_write() {
    let fx = fixture();
    let (store, subs) = fx.store("s", 1);
    fx.gate.deny(fx.engine.index_dir(store, subs[0]).path());

    let mut session = begin_backup(&fx.engine, store).unwrap();
    let err = session.write_volume(subs[0], 10, 1).unwrap_err();
    assert!(err.is_policy_refusal(), "{err}");
    assert_eq!(fx.engine.ledger().read(|t| t.volumes_of(store).count()), 0);
}
