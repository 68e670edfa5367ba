use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, info, warn};

use crate::access::require_write;
use crate::commands::store::auto_seal;
use crate::engine::Engine;
use crate::error::{DdbError, Result, WriteGate};
use crate::events::EngineEvent;
use crate::ledger::model::{AgedReason, AgedStamp, JobKind, VolumeFlag};
use crate::prune::{apply_policy, AgingDecision, AgingEntry};
use ddb_types::{JobId, StoreId, SubstoreId, VolumeId};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PruneStats {
    pub stores_visited: usize,
    pub stores_sealed: usize,
    pub jobs_aged: usize,
    pub volumes_marked: usize,
    pub volumes_aged: usize,
    pub volumes_purged: usize,
    pub archive_files_deleted: usize,
    pub bytes_freed: u64,
    pub stores_macro_pruned: usize,
    /// Stores whose volume phases were skipped because of an open WORM window.
    pub worm_deferred: usize,
    /// Stores whose volume phases wait for a resync after a regular reconstruction.
    pub resync_deferred: usize,
}

impl PruneStats {
    fn merge(&mut self, other: PruneStats) {
        self.stores_visited += other.stores_visited;
        self.stores_sealed += other.stores_sealed;
        self.jobs_aged += other.jobs_aged;
        self.volumes_marked += other.volumes_marked;
        self.volumes_aged += other.volumes_aged;
        self.volumes_purged += other.volumes_purged;
        self.archive_files_deleted += other.archive_files_deleted;
        self.bytes_freed += other.bytes_freed;
        self.stores_macro_pruned += other.stores_macro_pruned;
        self.worm_deferred += other.worm_deferred;
        self.resync_deferred += other.resync_deferred;
    }
}

/// One pruning pass over every store.
pub fn run_pruning(engine: &Engine) -> Result<PruneStats> {
    let mut stats = PruneStats {
        stores_sealed: auto_seal(engine)?.len(),
        ..PruneStats::default()
    };
    let stores: Vec<StoreId> = engine.ledger().read(|t| t.stores().map(|s| s.id).collect());
    for store in stores {
        stats.merge(prune_store(engine, store)?);
    }
    info!(
        jobs_aged = stats.jobs_aged,
        volumes_marked = stats.volumes_marked,
        volumes_aged = stats.volumes_aged,
        volumes_purged = stats.volumes_purged,
        stores_removed = stats.stores_macro_pruned,
        "pruning pass complete"
    );
    Ok(stats)
}

/// What the retention policy would do to the backup jobs of `store` right now.
pub fn preview_aging(engine: &Engine, store: StoreId) -> Result<Vec<AgingEntry>> {
    let now = engine.now();
    let config = engine.config();
    engine.ledger().read(|t| {
        t.require_store(store)?;
        let jobs: Vec<_> = t.backup_jobs_of(store).collect();
        Ok(apply_policy(
            &jobs,
            &config.retention,
            config.encoding.job_aged_bit,
            now,
        ))
    })
}

/// Prune one store: age jobs, then mark, delete, and purge volumes.
///
/// Volume phases are skipped while the store's WORM window is open, a
/// reconstruction owns it, or its restored index still awaits a resync. Only volumes that were already AGED when the pass
/// began are purged, so every AGED state is observable for at least one pass.
pub fn prune_store(engine: &Engine, store: StoreId) -> Result<PruneStats> {
    let mut stats = PruneStats {
        stores_visited: 1,
        ..PruneStats::default()
    };
    let now = engine.now();
    stats.jobs_aged = age_jobs(engine, store)?;

    let (row, busy, previously_aged, total_volumes) = engine.ledger().read(|t| -> Result<_> {
        let row = t.require_store(store)?.clone();
        let busy = t.open_recon_job(store).is_some()
            || t.substores_of(store).any(|s| s.recovery_pending);
        let aged: BTreeSet<VolumeId> = t
            .volumes_of(store)
            .filter(|v| v.flag == VolumeFlag::Aged)
            .map(|v| v.id)
            .collect();
        Ok((row, busy, aged, t.volumes_of(store).count()))
    })?;

    if busy {
        debug!(%store, "store is being recovered; volume pruning skipped");
        return Ok(stats);
    }
    if row.resync_needed {
        info!(%store, "index awaits resync; volume pruning deferred");
        stats.resync_deferred = 1;
        return Ok(stats);
    }
    if let Some(until) = row.worm_lock_at(now) {
        info!(%store, until = %until, "WORM lock active; volume pruning deferred");
        stats.worm_deferred = 1;
        return Ok(stats);
    }

    stats.volumes_marked = mark_volumes(engine, store)?;
    let sealed = row.is_sealed();
    delete_pending(engine, store, sealed, &mut stats)?;

    if sealed {
        if previously_aged.len() == total_volumes {
            macro_prune(engine, store)?;
            stats.stores_macro_pruned = 1;
        }
    } else if !previously_aged.is_empty() {
        let purged = engine.ledger().write(|t| {
            let mut purged = 0;
            for volume in &previously_aged {
                if t.purge_volume(*volume).is_some() {
                    purged += 1;
                }
            }
            Ok(purged)
        })?;
        debug!(%store, purged, "aged volumes purged from the ledger");
        stats.volumes_purged = purged;
    }
    Ok(stats)
}

/// Operator deletion: the job is aged immediately, whatever the policy says.
pub fn delete_job(engine: &Engine, job: JobId) -> Result<()> {
    let now = engine.now();
    let aged_bit = engine.config().encoding.job_aged_bit;
    engine.ledger().write(|t| {
        let seq = t.seq();
        let row = t.job_mut(job)?;
        if row.kind != JobKind::Backup {
            return Err(DdbError::InvalidState(format!(
                "{job} is a {} job; only backup jobs can be deleted",
                row.kind
            )));
        }
        if !row.status.is_terminal() {
            return Err(DdbError::InvalidState(format!(
                "{job} is {} and cannot be deleted",
                row.status
            )));
        }
        row.deleted_by_operator = true;
        if row.aged_by & aged_bit == 0 {
            row.aged_by |= aged_bit;
            row.aged = Some(AgedStamp {
                reason: AgedReason::OperatorDelete,
                at: now,
                seq,
            });
        }
        Ok(())
    })?;
    info!(%job, "backup job deleted by operator");
    Ok(())
}

fn age_jobs(engine: &Engine, store: StoreId) -> Result<usize> {
    let entries = preview_aging(engine, store)?;
    let due: Vec<(JobId, AgedReason)> = entries
        .iter()
        .filter_map(|e| match e.decision {
            AgingDecision::Age { reason } => Some((e.job, reason)),
            AgingDecision::Keep { .. } => None,
        })
        .collect();
    if due.is_empty() {
        return Ok(0);
    }

    let now = engine.now();
    let aged_bit = engine.config().encoding.job_aged_bit;
    engine.ledger().write(|t| {
        let seq = t.seq();
        for (job, reason) in &due {
            let row = t.job_mut(*job)?;
            row.aged_by |= aged_bit;
            row.aged = Some(AgedStamp {
                reason: *reason,
                at: now,
                seq,
            });
        }
        Ok(())
    })?;
    for (job, reason) in &due {
        debug!(%store, %job, ?reason, "backup job aged");
    }
    Ok(due.len())
}

/// ACTIVE -> PENDING_PRUNE for volumes whose every referencing job was aged
/// in an earlier transaction.
fn mark_volumes(engine: &Engine, store: StoreId) -> Result<usize> {
    let encoding = engine.config().encoding.clone();
    engine.ledger().write(|t| {
        let seq = t.seq();
        let eligible: Vec<VolumeId> = t
            .volumes_of(store)
            .filter(|v| v.flag == VolumeFlag::Active)
            .filter(|v| {
                t.jobs_referencing(v.id).iter().all(|job| {
                    t.job(*job).is_some_and(|j| {
                        j.is_aged(&encoding) && j.aged.as_ref().is_some_and(|a| a.seq < seq)
                    })
                })
            })
            .map(|v| v.id)
            .collect();
        for volume in &eligible {
            t.set_volume_flag(*volume, VolumeFlag::PendingPrune)?;
        }
        Ok(eligible.len())
    })
}

/// Physical delete pass for PENDING_PRUNE volumes: drop their index entries,
/// then their archive rows, and flag them AGED. Unsealed stores commit per
/// volume; a sealed store flips all of its pending volumes in one transaction.
fn delete_pending(engine: &Engine, store: StoreId, sealed: bool, stats: &mut PruneStats) -> Result<()> {
    let pending: BTreeMap<SubstoreId, Vec<VolumeId>> = engine.ledger().read(|t| {
        let mut by_substore: BTreeMap<SubstoreId, Vec<VolumeId>> = BTreeMap::new();
        for v in t.volumes_of(store).filter(|v| v.flag == VolumeFlag::PendingPrune) {
            by_substore.entry(v.substore).or_default().push(v.id);
        }
        by_substore
    });
    if pending.is_empty() {
        return Ok(());
    }

    let mut deleted = Vec::new();
    for (substore, volumes) in &pending {
        let dir = engine.index_dir(store, *substore);
        require_write(engine.access(), dir.path())?;
        let _write = match engine.quiesce().begin_write(*substore) {
            Ok(guard) => guard,
            Err(e) => {
                warn!(%store, %substore, "index busy; deletes postponed: {e}");
                continue;
            }
        };
        let mut index = dir.load()?;
        let mut changed = false;
        for volume in volumes {
            changed |= index.remove(*volume).is_some();
        }
        if changed {
            dir.save(&mut index)?;
        }
        if sealed {
            deleted.extend_from_slice(volumes);
        } else {
            for volume in volumes {
                let (files, bytes) = flip_to_aged(engine, store, &[*volume])?;
                stats.archive_files_deleted += files;
                stats.bytes_freed += bytes;
                stats.volumes_aged += 1;
            }
            publish_aged(engine, store, volumes.clone());
        }
    }

    if sealed && !deleted.is_empty() {
        let (files, bytes) = flip_to_aged(engine, store, &deleted)?;
        stats.archive_files_deleted += files;
        stats.bytes_freed += bytes;
        stats.volumes_aged += deleted.len();
        publish_aged(engine, store, deleted);
    }
    Ok(())
}

/// Returns `(archive files deleted, bytes freed)`.
fn flip_to_aged(engine: &Engine, store: StoreId, volumes: &[VolumeId]) -> Result<(usize, u64)> {
    let now = engine.now();
    engine.ledger().write(|t| {
        if let Some(until) = t.require_store(store)?.worm_lock_at(now) {
            return Err(DdbError::WriteDenied {
                target: store.to_string(),
                gate: WriteGate::Worm { until },
            });
        }
        let (mut files, mut bytes) = (0, 0);
        for volume in volumes {
            files += t.remove_archive_files_of_volume(*volume);
            let row = t.volume_mut(*volume)?;
            bytes += row.physical_bytes;
            row.physical_bytes = 0;
            t.set_volume_flag(*volume, VolumeFlag::Aged)?;
        }
        Ok((files, bytes))
    })
}

fn publish_aged(engine: &Engine, store: StoreId, volumes: Vec<VolumeId>) {
    debug!(%store, volumes = volumes.len(), "volumes aged");
    engine
        .events()
        .publish(EngineEvent::VolumesAged { store, volumes });
}

/// Remove a sealed, fully aged store: all metadata rows in one transaction,
/// then its index directories.
fn macro_prune(engine: &Engine, store: StoreId) -> Result<()> {
    let substores = engine
        .ledger()
        .read(|t| t.require_store(store).map(|s| s.substores.clone()))?;
    let dirs: Vec<_> = substores
        .iter()
        .map(|s| engine.index_dir(store, *s))
        .collect();
    for dir in &dirs {
        require_write(engine.access(), dir.path())?;
    }

    let now = engine.now();
    engine.ledger().write(|t| {
        if let Some(until) = t.require_store(store)?.worm_lock_at(now) {
            return Err(DdbError::WriteDenied {
                target: store.to_string(),
                gate: WriteGate::Worm { until },
            });
        }
        t.remove_store_metadata(store)?;
        Ok(())
    })?;

    for dir in &dirs {
        if let Err(e) = dir.remove_all() {
            warn!(%store, substore = %dir.substore(), "failed to remove index directory: {e}");
        }
    }
    info!(%store, "sealed store macro-pruned");
    engine
        .events()
        .publish(EngineEvent::StoreMacroPruned { store });
    Ok(())
}
