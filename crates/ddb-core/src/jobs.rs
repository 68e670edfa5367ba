use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tracing::debug;

use crate::error::{DdbError, Result};
use crate::ledger::model::{JobKind, JobStatus};
use ddb_types::JobId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobHandle {
    pub id: JobId,
    pub kind: JobKind,
}

/// The job scheduler the engine reports to. It hands out job ids and is the
/// authority on whether an operator killed or resumed a job.
pub trait JobScheduler: Send + Sync {
    fn submit(&self, kind: JobKind) -> Result<JobHandle>;
    fn status(&self, job: JobHandle) -> Result<JobStatus>;
    /// Record a status reported by the engine.
    fn update(&self, job: JobHandle, status: JobStatus) -> Result<()>;
    fn kill(&self, job: JobHandle) -> Result<()>;
    fn resume(&self, job: JobHandle) -> Result<()>;
}

/// In-process scheduler: monotonically increasing ids, statuses in memory.
pub struct LocalScheduler {
    next_id: AtomicU64,
    statuses: Mutex<HashMap<JobId, JobStatus>>,
}

impl LocalScheduler {
    /// Ids start right after `last`, so they never collide with jobs already
    /// recorded in the ledger.
    pub fn starting_after(last: JobId) -> Self {
        Self {
            next_id: AtomicU64::new(last.get() + 1),
            statuses: Mutex::new(HashMap::new()),
        }
    }

    fn with_status<T>(
        &self,
        job: JobHandle,
        f: impl FnOnce(&mut JobStatus) -> Result<T>,
    ) -> Result<T> {
        let mut statuses = self.statuses.lock().unwrap_or_else(|e| e.into_inner());
        let status = statuses
            .entry(job.id)
            // Jobs submitted by an earlier process are unknown here; treat them as pending.
            .or_insert(JobStatus::Pending);
        f(status)
    }
}

impl Default for LocalScheduler {
    fn default() -> Self {
        Self::starting_after(JobId::NONE)
    }
}

impl JobScheduler for LocalScheduler {
    fn submit(&self, kind: JobKind) -> Result<JobHandle> {
        let id = JobId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.statuses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, JobStatus::Running);
        debug!(job = %id, %kind, "job submitted");
        Ok(JobHandle { id, kind })
    }

    fn status(&self, job: JobHandle) -> Result<JobStatus> {
        self.with_status(job, |s| Ok(*s))
    }

    fn update(&self, job: JobHandle, status: JobStatus) -> Result<()> {
        self.with_status(job, |s| {
            // An operator kill sticks until the operator resumes the job.
            if *s != JobStatus::Killed || status.is_terminal() || status == JobStatus::Waiting {
                *s = status;
            }
            Ok(())
        })
    }

    fn kill(&self, job: JobHandle) -> Result<()> {
        self.with_status(job, |s| {
            if !s.is_terminal() {
                *s = JobStatus::Killed;
            }
            Ok(())
        })
    }

    fn resume(&self, job: JobHandle) -> Result<()> {
        self.with_status(job, |s| match *s {
            JobStatus::Killed | JobStatus::Pending | JobStatus::Waiting => {
                *s = JobStatus::Waiting;
                Ok(())
            }
            other => Err(DdbError::InvalidState(format!(
                "{} is {other} and cannot be resumed",
                job.id
            ))),
        })
    }
}
