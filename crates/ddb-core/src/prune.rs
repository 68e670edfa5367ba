use chrono::{DateTime, Duration, Utc};

use crate::config::RetentionConfig;
use crate::ledger::model::{AgedReason, Job, JobStatus};
use ddb_types::JobId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgingDecision {
    Keep { reasons: Vec<String> },
    Age { reason: AgedReason },
}

#[derive(Debug, Clone)]
pub struct AgingEntry {
    pub job: JobId,
    pub started_at: DateTime<Utc>,
    pub decision: AgingDecision,
}

impl AgingEntry {
    pub fn ages(&self) -> bool {
        matches!(self.decision, AgingDecision::Age { .. })
    }
}

/// Decide which of a store's backup jobs age out. Jobs already aged are
/// skipped. Returns one entry per remaining job, newest first.
///
/// A completed job ages once `days` have passed since it started and at
/// least `cycles` newer completed jobs exist. Failed or killed jobs do not
/// count as cycles and age on `days` alone. Operator-deleted jobs always
/// age; running ones never do.
pub fn apply_policy(
    jobs: &[&Job],
    policy: &RetentionConfig,
    aged_bit: u32,
    now: DateTime<Utc>,
) -> Vec<AgingEntry> {
    let mut ordered: Vec<&Job> = jobs.to_vec();
    ordered.sort_by(|a, b| b.started_at.cmp(&a.started_at).then(b.id.cmp(&a.id)));

    let window = Duration::days(i64::from(policy.days));
    let mut newer_completed = 0u32;
    let mut entries = Vec::new();

    for job in ordered {
        let completed = job.status == JobStatus::Completed;
        if job.aged_by & aged_bit != 0 {
            if completed {
                newer_completed += 1;
            }
            continue;
        }

        let decision = if !job.status.is_terminal() {
            AgingDecision::Keep {
                reasons: vec![format!("job is {}", job.status)],
            }
        } else if job.deleted_by_operator {
            AgingDecision::Age {
                reason: AgedReason::OperatorDelete,
            }
        } else {
            let mut reasons = Vec::new();
            if now.signed_duration_since(job.started_at) < window {
                reasons.push(format!("within {} day(s)", policy.days));
            }
            if completed && newer_completed < policy.cycles {
                reasons.push(format!(
                    "cycle {} of {}",
                    newer_completed + 1,
                    policy.cycles
                ));
            }
            if reasons.is_empty() {
                AgingDecision::Age {
                    reason: AgedReason::Retention,
                }
            } else {
                AgingDecision::Keep { reasons }
            }
        };

        if completed {
            newer_completed += 1;
        }
        entries.push(AgingEntry {
            job: job.id,
            started_at: job.started_at,
            decision,
        });
    }
    entries
}
