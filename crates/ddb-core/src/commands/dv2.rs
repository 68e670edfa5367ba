use std::collections::HashMap;
use std::fmt;

use tracing::{debug, info, warn};

use crate::commands::util::with_job;
use crate::engine::Engine;
use crate::error::{DdbError, Result};
use crate::index::SubstoreIndex;
use crate::ledger::model::{JobKind, Verification, Volume, VolumeFlag};
use crate::reader::ReaderFault;
use ddb_types::{JobId, StoreId, SubstoreId, VolumeId};

/// Which volumes a verification run looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dv2Mode {
    /// Every live volume.
    Full,
    /// Only volumes not verified successfully since their last backup.
    Incremental,
}

/// How deep each volume is checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dv2Speed {
    /// Index presence and chunk count only.
    Quick,
    /// Also read every chunk back through the volume helper.
    Thorough,
}

impl fmt::Display for Dv2Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dv2Mode::Full => f.write_str("full"),
            Dv2Mode::Incremental => f.write_str("incremental"),
        }
    }
}

impl fmt::Display for Dv2Speed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dv2Speed::Quick => f.write_str("quick"),
            Dv2Speed::Thorough => f.write_str("thorough"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dv2Issue {
    pub volume: VolumeId,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct Dv2Report {
    pub job: JobId,
    pub store: StoreId,
    pub volumes_checked: usize,
    pub volumes_skipped: usize,
    pub chunks_verified: u64,
    pub issues: Vec<Dv2Issue>,
}

impl Dv2Report {
    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }
}

/// Verify the live volumes of `store` against its indexes (and, when
/// thorough, against the volume contents).
///
/// Problems found are reported, not raised: the job completes and the report
/// lists the issues. A helper that gets killed fails the job.
pub fn run_dv2(engine: &Engine, store: StoreId, mode: Dv2Mode, speed: Dv2Speed) -> Result<Dv2Report> {
    engine.ledger().read(|t| t.require_store(store).map(|_| ()))?;

    with_job(engine, JobKind::DataVerification, Some(store), |handle| {
        let volumes: Vec<Volume> = engine.ledger().read(|t| {
            t.volumes_of(store)
                .filter(|v| v.flag != VolumeFlag::Aged && v.last_backup_at.is_some())
                .cloned()
                .collect()
        });

        let mut report = Dv2Report {
            job: handle.id,
            store,
            volumes_checked: 0,
            volumes_skipped: 0,
            chunks_verified: 0,
            issues: Vec::new(),
        };
        let mut indexes: HashMap<SubstoreId, SubstoreIndex> = HashMap::new();
        let mut results = Vec::new();

        for volume in &volumes {
            if mode == Dv2Mode::Incremental && verified_since_backup(engine, volume) {
                report.volumes_skipped += 1;
                continue;
            }
            if !indexes.contains_key(&volume.substore) {
                let index = engine.index_dir(store, volume.substore).load()?;
                indexes.insert(volume.substore, index);
            }
            let index = &indexes[&volume.substore];

            let before = report.issues.len();
            match index.entries.get(&volume.id) {
                None => report.issues.push(Dv2Issue {
                    volume: volume.id,
                    message: "missing from the substore index".into(),
                }),
                Some(entry) if entry.chunk_count != volume.chunk_count => {
                    report.issues.push(Dv2Issue {
                        volume: volume.id,
                        message: format!(
                            "index records {} chunk(s), ledger {}",
                            entry.chunk_count, volume.chunk_count
                        ),
                    })
                }
                Some(_) => {}
            }

            if speed == Dv2Speed::Thorough {
                match engine.reader().scan(volume) {
                    Ok(scan) => {
                        report.chunks_verified += scan.chunks.saturating_sub(scan.unreadable.len() as u64);
                        for (chunk, reason) in scan.unreadable {
                            report.issues.push(Dv2Issue {
                                volume: volume.id,
                                message: format!("chunk {chunk} unreadable: {reason}"),
                            });
                        }
                    }
                    Err(ReaderFault::Failed(reason)) => report.issues.push(Dv2Issue {
                        volume: volume.id,
                        message: format!("volume unreadable: {reason}"),
                    }),
                    Err(ReaderFault::Killed) => {
                        return Err(DdbError::Other(format!(
                            "volume helper killed while verifying {}",
                            volume.id
                        )));
                    }
                }
            } else {
                report.chunks_verified += volume.chunk_count;
            }

            let ok = report.issues.len() == before;
            if !ok {
                warn!(job = %handle.id, volume = %volume.id, "verification found problems");
            }
            results.push((volume.id, ok));
            report.volumes_checked += 1;
        }

        let now = engine.now();
        let thorough = speed == Dv2Speed::Thorough;
        engine.ledger().write(|t| {
            for (volume, ok) in &results {
                t.upsert_verification(Verification {
                    volume: *volume,
                    job: handle.id,
                    at: now,
                    thorough,
                    ok: *ok,
                });
            }
            Ok(())
        })?;
        debug!(job = %handle.id, %mode, %speed, skipped = report.volumes_skipped, "verification recorded");
        info!(
            %store,
            checked = report.volumes_checked,
            issues = report.issues.len(),
            "data verification complete"
        );
        Ok(report)
    })
}

fn verified_since_backup(engine: &Engine, volume: &Volume) -> bool {
    engine.ledger().read(|t| {
        t.verification(volume.id).is_some_and(|v| {
            v.ok && volume.last_backup_at.map_or(true, |backup| v.at >= backup)
        })
    })
}
