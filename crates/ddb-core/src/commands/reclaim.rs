use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_channel::RecvTimeoutError;
use tracing::{debug, info, warn};

use crate::access::require_write;
use crate::commands::util::{finish_job, start_job};
use crate::engine::Engine;
use crate::error::{DdbError, Result};
use crate::jobs::JobHandle;
use crate::ledger::model::{JobKind, JobStatus, VolumeFlag};
use ddb_types::{StoreId, SubstoreId, VolumeId};

/// Statistics returned by a space reclamation run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReclaimStats {
    pub substores: usize,
    pub entries_total: u64,
    pub entries_dropped: u64,
    pub bytes_reclaimed: u64,
    pub orphans_removed: usize,
}

/// Compact the substore indexes of `store`, optionally removing stray files.
///
/// Refused outright while the store is WORM-locked, being reconstructed, or
/// waiting for a resync of a restored index. The work runs on its own
/// thread; if it does not finish within `reclaim.timeout` it is considered
/// hung, told to stop, recorded as killed, and reported as `Timeout`.
pub fn run_space_reclaim(
    engine: &Engine,
    store: StoreId,
    with_orphan_cleanup: bool,
) -> Result<ReclaimStats> {
    let now = engine.now();
    let substores = engine.ledger().read(|t| -> Result<Vec<SubstoreId>> {
        let row = t.require_store(store)?;
        if let Some(until) = row.worm_lock_at(now) {
            return Err(DdbError::ReclaimRefusedWormLocked { store, until });
        }
        if let Some(open) = t.open_recon_job(store) {
            return Err(DdbError::InvalidState(format!(
                "{store} is being reconstructed by {}",
                open.id
            )));
        }
        if row.resync_needed {
            return Err(DdbError::InvalidState(format!(
                "{store} awaits a resync after reconstruction"
            )));
        }
        Ok(row.substores.clone())
    })?;
    let timeout = engine.config().reclaim.timeout_duration()?;

    let handle = start_job(engine, JobKind::SpaceReclaim, Some(store))?;
    let cancel = Arc::new(AtomicBool::new(false));
    let (tx, rx) = crossbeam_channel::bounded(1);

    let worker = engine.clone();
    let worker_cancel = Arc::clone(&cancel);
    let spawned = std::thread::Builder::new()
        .name("ddb-reclaim".into())
        .spawn(move || {
            let result = compact_store(
                &worker,
                store,
                &substores,
                with_orphan_cleanup,
                &worker_cancel,
            );
            let _ = tx.send(result);
        });
    if let Err(e) = spawned {
        record(engine, handle, JobStatus::Failed);
        return Err(e.into());
    }

    match rx.recv_timeout(timeout) {
        Ok(Ok(stats)) => {
            finish_job(engine, handle, JobStatus::Completed)?;
            info!(
                %store,
                substores = stats.substores,
                dropped = stats.entries_dropped,
                bytes = stats.bytes_reclaimed,
                orphans = stats.orphans_removed,
                "space reclamation complete"
            );
            Ok(stats)
        }
        Ok(Err(e)) => {
            record(engine, handle, JobStatus::Failed);
            Err(e)
        }
        Err(RecvTimeoutError::Timeout) => {
            cancel.store(true, Ordering::Relaxed);
            if let Err(e) = engine.scheduler().kill(handle) {
                warn!(job = %handle.id, "failed to kill reclaim job: {e}");
            }
            record(engine, handle, JobStatus::Killed);
            warn!(job = %handle.id, %store, ?timeout, "space reclamation hung; killed");
            Err(DdbError::Timeout(format!(
                "space reclamation of {store} exceeded {timeout:?}"
            )))
        }
        Err(RecvTimeoutError::Disconnected) => {
            record(engine, handle, JobStatus::Failed);
            Err(DdbError::Other(
                "space reclamation worker exited without a result".into(),
            ))
        }
    }
}

fn record(engine: &Engine, handle: JobHandle, status: JobStatus) {
    if let Err(e) = finish_job(engine, handle, status) {
        warn!(job = %handle.id, "failed to record reclaim outcome: {e}");
    }
}

fn check_cancelled(cancel: &AtomicBool) -> Result<()> {
    if cancel.load(Ordering::Relaxed) {
        return Err(DdbError::Other("space reclamation cancelled".into()));
    }
    Ok(())
}

fn compact_store(
    engine: &Engine,
    store: StoreId,
    substores: &[SubstoreId],
    with_orphan_cleanup: bool,
    cancel: &AtomicBool,
) -> Result<ReclaimStats> {
    let mut stats = ReclaimStats::default();
    for &substore in substores {
        check_cancelled(cancel)?;
        let dir = engine.index_dir(store, substore);
        require_write(engine.access(), dir.path())?;
        check_cancelled(cancel)?;

        let live: BTreeSet<VolumeId> = engine.ledger().read(|t| {
            t.volumes_of_substore(substore)
                .filter(|v| v.flag != VolumeFlag::Aged)
                .map(|v| v.id)
                .collect()
        });

        let _write = engine.quiesce().begin_write(substore)?;
        let mut index = dir.load()?;
        stats.entries_total += index.len() as u64;
        let dead: Vec<VolumeId> = index
            .entries
            .keys()
            .filter(|v| !live.contains(v))
            .copied()
            .collect();
        for volume in &dead {
            if let Some(entry) = index.remove(*volume) {
                stats.bytes_reclaimed += entry.bytes;
            }
        }
        if !dead.is_empty() {
            dir.save(&mut index)?;
        }
        stats.entries_dropped += dead.len() as u64;

        if with_orphan_cleanup {
            for stray in dir.stray_files()? {
                std::fs::remove_file(&stray)?;
                debug!(%substore, file = %stray.display(), "orphan file removed");
                stats.orphans_removed += 1;
            }
        }
        stats.substores += 1;
    }
    Ok(stats)
}
