use tracing::{debug, warn};

use crate::engine::Engine;
use crate::error::Result;
use crate::jobs::JobHandle;
use crate::ledger::model::{Job, JobKind, JobStatus};
use ddb_types::StoreId;

/// Submit a job to the scheduler and record it in the ledger as running.
pub fn start_job(engine: &Engine, kind: JobKind, store: Option<StoreId>) -> Result<JobHandle> {
    let handle = engine.scheduler().submit(kind)?;
    let now = engine.now();
    engine.ledger().write(|t| {
        t.insert_job(Job::new(handle.id, kind, store, now));
        Ok(())
    })?;
    debug!(job = %handle.id, %kind, "job started");
    Ok(handle)
}

/// Record a job status in the ledger and report it to the scheduler.
/// Terminal statuses also stamp `finished_at`.
pub fn finish_job(engine: &Engine, handle: JobHandle, status: JobStatus) -> Result<()> {
    let now = engine.now();
    engine.ledger().write(|t| {
        let job = t.job_mut(handle.id)?;
        job.status = status;
        if status.is_terminal() {
            job.finished_at = Some(now);
        }
        Ok(())
    })?;
    engine.scheduler().update(handle, status)
}

/// Run `action` as a job of `kind`. The job ends `Completed` when the action
/// succeeds and `Failed` otherwise; the action's error wins over a failure to
/// record the outcome.
pub fn with_job<T>(
    engine: &Engine,
    kind: JobKind,
    store: Option<StoreId>,
    action: impl FnOnce(JobHandle) -> Result<T>,
) -> Result<T> {
    let handle = start_job(engine, kind, store)?;
    let result = action(handle);
    let status = if result.is_ok() {
        JobStatus::Completed
    } else {
        JobStatus::Failed
    };
    match finish_job(engine, handle, status) {
        Ok(()) => result,
        Err(record_err) => {
            if result.is_err() {
                warn!(job = %handle.id, "failed to record job outcome: {record_err}");
                result
            } else {
                Err(record_err)
            }
        }
    }
}

/// Whether the scheduler says an operator killed `handle`.
pub fn kill_requested(engine: &Engine, handle: JobHandle) -> bool {
    matches!(engine.scheduler().status(handle), Ok(JobStatus::Killed))
}
