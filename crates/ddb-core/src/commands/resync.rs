use std::collections::BTreeMap;

use tracing::{debug, info, warn};

use crate::access::require_write;
use crate::commands::util::{finish_job, start_job};
use crate::engine::Engine;
use crate::error::{DdbError, Result};
use crate::events::EngineEvent;
use crate::index::IndexEntry;
use crate::ledger::model::{
    resync_flags, JobKind, JobStatus, MaintenanceReason, ResyncHistoryEntry, VolumeFlag,
    RESYNC_FAILED, RESYNC_IN_PROGRESS, RESYNC_SUCCESS,
};
use ddb_types::{JobId, StoreId, VolumeId};

#[derive(Debug, Clone)]
pub struct ResyncReport {
    pub store: StoreId,
    pub job: JobId,
    pub attempt: u32,
    pub status: i32,
    pub flags: u32,
    pub added: u64,
    pub dropped: u64,
}

/// Resync every store that asked for it. A failing store is logged and left
/// flagged; the next pass retries it with the next attempt number.
pub fn run_pending(engine: &Engine) -> Result<Vec<ResyncReport>> {
    let due: Vec<StoreId> = engine.ledger().read(|t| {
        t.stores()
            .filter(|s| s.resync_needed && t.open_recon_job(s.id).is_none())
            .map(|s| s.id)
            .collect()
    });
    let mut reports = Vec::with_capacity(due.len());
    for store in due {
        match run_resync(engine, store, MaintenanceReason::PostReconstruction) {
            Ok(report) => reports.push(report),
            Err(e) => warn!(%store, "resync failed: {e}"),
        }
    }
    Ok(reports)
}

/// Reconcile every substore index of `store` with the ledger.
pub fn run_resync(engine: &Engine, store: StoreId, reason: MaintenanceReason) -> Result<ResyncReport> {
    engine.ledger().read(|t| -> Result<()> {
        t.require_store(store)?;
        if let Some(open) = t.open_recon_job(store) {
            return Err(DdbError::InvalidState(format!(
                "{store} is being reconstructed by {}",
                open.id
            )));
        }
        Ok(())
    })?;

    let handle = start_job(engine, JobKind::Resync, Some(store))?;
    let now = engine.now();
    let (row, attempt) = engine.ledger().write(|t| {
        let attempt = t.resync_history(store).len() as u32 + 1;
        let row = t.push_resync_entry(ResyncHistoryEntry {
            store,
            at: now,
            flags: 0,
            attempt,
            reason,
            status: RESYNC_IN_PROGRESS,
            added: 0,
            dropped: 0,
        });
        Ok((row, attempt))
    })?;
    debug!(%store, attempt, "resync attempt started");

    match reconcile(engine, store) {
        Ok((flags, added, dropped)) => {
            engine.ledger().write(|t| {
                let entry = t.resync_entry_mut(row)?;
                entry.status = RESYNC_SUCCESS;
                entry.flags = flags;
                entry.added = added;
                entry.dropped = dropped;
                t.store_mut(store)?.resync_needed = false;
                Ok(())
            })?;
            finish_job(engine, handle, JobStatus::Completed)?;
            engine.events().publish(EngineEvent::ResyncFinished {
                store,
                attempt,
                status: RESYNC_SUCCESS,
            });
            info!(%store, attempt, added, dropped, reason = reason.code(), "resync complete");
            Ok(ResyncReport {
                store,
                job: handle.id,
                attempt,
                status: RESYNC_SUCCESS,
                flags,
                added,
                dropped,
            })
        }
        Err(e) => {
            let recorded = engine.ledger().write(|t| {
                t.resync_entry_mut(row)?.status = RESYNC_FAILED;
                Ok(())
            });
            if let Err(record_err) = recorded {
                warn!(%store, attempt, "failed to record resync failure: {record_err}");
            }
            if let Err(record_err) = finish_job(engine, handle, JobStatus::Failed) {
                warn!(%store, attempt, "failed to record resync job outcome: {record_err}");
            }
            engine.events().publish(EngineEvent::ResyncFinished {
                store,
                attempt,
                status: RESYNC_FAILED,
            });
            Err(e)
        }
    }
}

/// Returns `(flags, added, dropped)`.
fn reconcile(engine: &Engine, store: StoreId) -> Result<(u32, u64, u64)> {
    let substores = engine
        .ledger()
        .read(|t| t.require_store(store).map(|s| s.substores.clone()))?;

    let (mut added, mut dropped) = (0u64, 0u64);
    for substore in substores {
        let live: BTreeMap<VolumeId, IndexEntry> = engine.ledger().read(|t| {
            t.volumes_of_substore(substore)
                .filter(|v| v.flag != VolumeFlag::Aged && v.last_backup_at.is_some())
                .filter(|v| v.physical_bytes > 0)
                .map(|v| {
                    (
                        v.id,
                        IndexEntry {
                            chunk_count: v.chunk_count,
                            bytes: v.physical_bytes,
                        },
                    )
                })
                .collect()
        });

        let dir = engine.index_dir(store, substore);
        require_write(engine.access(), dir.path())?;
        let _write = engine.quiesce().begin_write(substore)?;
        let mut index = dir.load()?;

        let stale: Vec<VolumeId> = index
            .entries
            .keys()
            .filter(|v| !live.contains_key(v))
            .copied()
            .collect();
        for volume in &stale {
            index.remove(*volume);
        }
        let mut missing = 0u64;
        for (volume, entry) in &live {
            if !index.contains(*volume) {
                index.upsert(*volume, *entry);
                missing += 1;
            }
        }
        if missing > 0 || !stale.is_empty() {
            dir.save(&mut index)?;
        }
        debug!(%store, %substore, added = missing, dropped = stale.len(), "substore reconciled");
        added += missing;
        dropped += stale.len() as u64;
    }

    let mut flags = resync_flags::ALL_SUBSTORES;
    if added > 0 {
        flags |= resync_flags::ADD_MISSING;
    }
    if dropped > 0 {
        flags |= resync_flags::DROP_STALE;
    }
    Ok((flags, added, dropped))
}
