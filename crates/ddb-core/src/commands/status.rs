use chrono::{DateTime, Utc};

use crate::engine::Engine;
use crate::error::Result;
use crate::ledger::model::{ReconPhase, ResyncHistoryEntry, SealInfo, Substore, VolumeFlag};
use ddb_types::{JobId, StoreId};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VolumeCounts {
    pub active: usize,
    pub pending_prune: usize,
    pub aged: usize,
    pub bytes: u64,
}

#[derive(Debug, Clone)]
pub struct StoreStatus {
    pub store: StoreId,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub sealed: Option<SealInfo>,
    /// End of the WORM window, if it is still open.
    pub worm_locked_until: Option<DateTime<Utc>>,
    pub resync_needed: bool,
    pub substores: Vec<Substore>,
    pub volumes: VolumeCounts,
    pub backup_jobs: usize,
    pub aged_jobs: usize,
    pub open_recon: Option<(JobId, ReconPhase)>,
    pub last_resync: Option<ResyncHistoryEntry>,
}

pub fn store_status(engine: &Engine, store: StoreId) -> Result<StoreStatus> {
    let now = engine.now();
    let encoding = &engine.config().encoding;
    engine.ledger().read(|t| {
        let row = t.require_store(store)?;
        let mut volumes = VolumeCounts::default();
        for v in t.volumes_of(store) {
            match v.flag {
                VolumeFlag::Active => volumes.active += 1,
                VolumeFlag::PendingPrune => volumes.pending_prune += 1,
                VolumeFlag::Aged => volumes.aged += 1,
            }
            volumes.bytes += v.physical_bytes;
        }
        let backup_jobs: Vec<_> = t.backup_jobs_of(store).collect();
        Ok(StoreStatus {
            store,
            name: row.name.clone(),
            created_at: row.created_at,
            sealed: row.sealed.clone(),
            worm_locked_until: row.worm_lock_at(now),
            resync_needed: row.resync_needed,
            substores: t.substores_of(store).cloned().collect(),
            volumes,
            backup_jobs: backup_jobs.len(),
            aged_jobs: backup_jobs.iter().filter(|j| j.is_aged(encoding)).count(),
            open_recon: t.open_recon_job(store).map(|r| (r.id, r.phase)),
            last_resync: t.resync_history(store).last().map(|e| (*e).clone()),
        })
    })
}

/// Status of every store, ordered by id.
pub fn all_store_status(engine: &Engine) -> Result<Vec<StoreStatus>> {
    let stores: Vec<StoreId> = engine.ledger().read(|t| t.stores().map(|s| s.id).collect());
    stores
        .into_iter()
        .map(|store| store_status(engine, store))
        .collect()
}
