use crate::jobs::{JobScheduler, LocalScheduler};
use crate::ledger::model::{JobKind, JobStatus};
use ddb_types::JobId;

#[test]
fn ids_continue_after_seed() {
    let scheduler = LocalScheduler::starting_after(JobId(41));
    let a = scheduler.submit(JobKind::Backup).unwrap();
    let b = scheduler.submit(JobKind::Recon).unwrap();
    assert_eq!(a.id, JobId(42));
    assert_eq!(b.id, JobId(43));
    assert_eq!(b.kind, JobKind::Recon);
    assert_eq!(scheduler.status(a).unwrap(), JobStatus::Running);
}

#[test]
fn kill_sticks_until_resume() {
    let scheduler = LocalScheduler::default();
    let job = scheduler.submit(JobKind::Recon).unwrap();

    scheduler.kill(job).unwrap();
    scheduler.update(job, JobStatus::Pending).unwrap();
    assert_eq!(scheduler.status(job).unwrap(), JobStatus::Killed);

    scheduler.resume(job).unwrap();
    assert_eq!(scheduler.status(job).unwrap(), JobStatus::Waiting);
    scheduler.update(job, JobStatus::Running).unwrap();
    assert_eq!(scheduler.status(job).unwrap(), JobStatus::Running);
}

#[test]
fn kill_does_not_touch_finished_jobs() {
    let scheduler = LocalScheduler::default();
    let job = scheduler.submit(JobKind::Backup).unwrap();
    scheduler.update(job, JobStatus::Completed).unwrap();
    scheduler.kill(job).unwrap();
    assert_eq!(scheduler.status(job).unwrap(), JobStatus::Completed);
}

#[test]
fn completed_job_cannot_be_resumed() {
    let scheduler = LocalScheduler::default();
    let job = scheduler.submit(JobKind::Backup).unwrap();
    scheduler.update(job, JobStatus::Completed).unwrap();
    let err = scheduler.resume(job).unwrap_err();
    assert!(err.to_string().contains("cannot be resumed"), "{err}");
}
