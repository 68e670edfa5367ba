use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::model::*;
use crate::error::{DdbError, Result};
use ddb_types::{JobId, StoreId, SubstoreId, VolumeId};

/// The catalog rows, as one serializable snapshot.
///
/// Reads go through typed query methods; mutations are crate-private so only
/// the engine's documented transitions can change rows, always inside a
/// [`Ledger::write`](super::Ledger::write) transaction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Tables {
    seq: u64,
    next_store: u64,
    next_substore: u64,
    next_volume: u64,
    stores: BTreeMap<StoreId, Store>,
    access_paths: Vec<AccessPath>,
    caches: Vec<CacheDescriptor>,
    substores: BTreeMap<SubstoreId, Substore>,
    volumes: BTreeMap<VolumeId, Volume>,
    jobs: BTreeMap<JobId, Job>,
    archive_files: Vec<ArchiveFile>,
    recon_jobs: BTreeMap<JobId, ReconJob>,
    recon_batches: BTreeSet<ReconBatchRecord>,
    failed_chunks: Vec<FailedChunkRecord>,
    resync_history: Vec<ResyncHistoryEntry>,
    verifications: BTreeMap<VolumeId, Verification>,
}

// ── Queries ──────────────────────────────────────────────────────────────

impl Tables {
    /// Sequence number of the last committed transaction.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn store(&self, id: StoreId) -> Option<&Store> {
        self.stores.get(&id)
    }

    pub fn require_store(&self, id: StoreId) -> Result<&Store> {
        self.store(id).ok_or(DdbError::StoreNotFound(id))
    }

    pub fn stores(&self) -> impl Iterator<Item = &Store> {
        self.stores.values()
    }

    pub fn access_paths(&self, store: StoreId) -> Vec<&AccessPath> {
        self.access_paths.iter().filter(|p| p.store == store).collect()
    }

    pub fn cache_descriptors(&self, store: StoreId) -> Vec<&CacheDescriptor> {
        self.caches.iter().filter(|c| c.store == store).collect()
    }

    pub fn substore(&self, id: SubstoreId) -> Option<&Substore> {
        self.substores.get(&id)
    }

    pub fn require_substore(&self, id: SubstoreId) -> Result<&Substore> {
        self.substore(id).ok_or(DdbError::SubstoreNotFound(id))
    }

    pub fn substores_of(&self, store: StoreId) -> impl Iterator<Item = &Substore> {
        self.substores.values().filter(move |s| s.store == store)
    }

    pub fn volume(&self, id: VolumeId) -> Option<&Volume> {
        self.volumes.get(&id)
    }

    pub fn require_volume(&self, id: VolumeId) -> Result<&Volume> {
        self.volume(id).ok_or(DdbError::VolumeNotFound(id))
    }

    pub fn volumes_of(&self, store: StoreId) -> impl Iterator<Item = &Volume> {
        self.volumes.values().filter(move |v| v.store == store)
    }

    pub fn volumes_of_substore(&self, substore: SubstoreId) -> impl Iterator<Item = &Volume> {
        self.volumes.values().filter(move |v| v.substore == substore)
    }

    /// Range scan by creation time: volumes of `store` created strictly after
    /// `after` (all when `None`) and at or before `until` (open when `None`).
    pub fn volumes_created_between(
        &self,
        store: StoreId,
        after: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> impl Iterator<Item = &Volume> {
        self.volumes_of(store).filter(move |v| {
            after.map_or(true, |a| v.created_at > a) && until.map_or(true, |u| v.created_at <= u)
        })
    }

    pub fn job(&self, id: JobId) -> Option<&Job> {
        self.jobs.get(&id)
    }

    pub fn require_job(&self, id: JobId) -> Result<&Job> {
        self.job(id).ok_or(DdbError::JobNotFound(id))
    }

    pub fn jobs(&self) -> impl Iterator<Item = &Job> {
        self.jobs.values()
    }

    pub fn backup_jobs_of(&self, store: StoreId) -> impl Iterator<Item = &Job> {
        self.jobs
            .values()
            .filter(move |j| j.kind == JobKind::Backup && j.store == Some(store))
    }

    pub fn max_job_id(&self) -> JobId {
        self.jobs.keys().next_back().copied().unwrap_or(JobId::NONE)
    }

    pub fn archive_files_of_job(&self, job: JobId) -> impl Iterator<Item = &ArchiveFile> {
        self.archive_files.iter().filter(move |a| a.job == job)
    }

    /// Jobs with at least one archive file in `volume`.
    pub fn jobs_referencing(&self, volume: VolumeId) -> BTreeSet<JobId> {
        self.archive_files
            .iter()
            .filter(|a| a.volume == volume)
            .map(|a| a.job)
            .collect()
    }

    pub fn volumes_of_job(&self, job: JobId) -> BTreeSet<VolumeId> {
        self.archive_files_of_job(job).map(|a| a.volume).collect()
    }

    pub fn recon_job(&self, id: JobId) -> Option<&ReconJob> {
        self.recon_jobs.get(&id)
    }

    pub fn require_recon_job(&self, id: JobId) -> Result<&ReconJob> {
        self.recon_job(id).ok_or(DdbError::JobNotFound(id))
    }

    pub fn recon_jobs_of(&self, store: StoreId) -> impl Iterator<Item = &ReconJob> {
        self.recon_jobs.values().filter(move |r| r.store == store)
    }

    /// The non-terminal reconstruction job of `store`, if any.
    pub fn open_recon_job(&self, store: StoreId) -> Option<&ReconJob> {
        self.recon_jobs_of(store).find(|r| !r.phase.is_terminal())
    }

    /// Volumes already recovered by `job`.
    pub fn recon_batches(&self, job: JobId) -> BTreeSet<VolumeId> {
        let lo = ReconBatchRecord {
            job,
            volume: VolumeId(0),
        };
        let hi = ReconBatchRecord {
            job,
            volume: VolumeId(u64::MAX),
        };
        self.recon_batches
            .range(lo..=hi)
            .map(|r| r.volume)
            .collect()
    }

    pub fn failed_chunks(&self, job: JobId) -> Vec<&FailedChunkRecord> {
        self.failed_chunks.iter().filter(|f| f.job == job).collect()
    }

    pub fn resync_history(&self, store: StoreId) -> Vec<&ResyncHistoryEntry> {
        self.resync_history
            .iter()
            .filter(|r| r.store == store)
            .collect()
    }

    pub fn verification(&self, volume: VolumeId) -> Option<&Verification> {
        self.verifications.get(&volume)
    }
}

// ── Mutations ────────────────────────────────────────────────────────────

impl Tables {
    pub(crate) fn bump_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    pub(crate) fn insert_store(
        &mut self,
        name: &str,
        now: DateTime<Utc>,
        partitions: usize,
    ) -> (StoreId, Vec<SubstoreId>) {
        self.next_store += 1;
        let id = StoreId(self.next_store);
        let mut substores = Vec::with_capacity(partitions);
        for _ in 0..partitions {
            self.next_substore += 1;
            let sid = SubstoreId(self.next_substore);
            self.substores.insert(
                sid,
                Substore {
                    id: sid,
                    store: id,
                    last_snap_job: JobId::NONE,
                    last_snap_at: None,
                    recovery_pending: false,
                    state: SubstoreState::Active,
                },
            );
            substores.push(sid);
        }
        self.stores.insert(
            id,
            Store {
                id,
                name: name.to_string(),
                created_at: now,
                sealed: None,
                worm_until: None,
                resync_needed: false,
                substores: substores.clone(),
            },
        );
        (id, substores)
    }

    pub(crate) fn insert_access_path(&mut self, path: AccessPath) {
        self.access_paths.push(path);
    }

    pub(crate) fn insert_cache_descriptor(&mut self, cache: CacheDescriptor) {
        self.caches.push(cache);
    }

    pub(crate) fn store_mut(&mut self, id: StoreId) -> Result<&mut Store> {
        self.stores.get_mut(&id).ok_or(DdbError::StoreNotFound(id))
    }

    pub(crate) fn substore_mut(&mut self, id: SubstoreId) -> Result<&mut Substore> {
        self.substores
            .get_mut(&id)
            .ok_or(DdbError::SubstoreNotFound(id))
    }

    pub(crate) fn insert_volume(
        &mut self,
        store: StoreId,
        substore: SubstoreId,
        now: DateTime<Utc>,
    ) -> VolumeId {
        self.next_volume += 1;
        let id = VolumeId(self.next_volume);
        let seq = self.seq;
        self.volumes.insert(
            id,
            Volume {
                id,
                store,
                substore,
                created_at: now,
                last_backup_at: None,
                physical_bytes: 0,
                chunk_count: 0,
                flag: VolumeFlag::Active,
                flag_seq: seq,
            },
        );
        id
    }

    pub(crate) fn volume_mut(&mut self, id: VolumeId) -> Result<&mut Volume> {
        self.volumes.get_mut(&id).ok_or(DdbError::VolumeNotFound(id))
    }

    /// Change a volume's flag, stamping the current transaction's sequence number.
    pub(crate) fn set_volume_flag(&mut self, id: VolumeId, flag: VolumeFlag) -> Result<()> {
        let seq = self.seq;
        let volume = self.volume_mut(id)?;
        volume.flag = flag;
        volume.flag_seq = seq;
        Ok(())
    }

    /// Remove an AGED volume row and any archive files still pointing at it.
    pub(crate) fn purge_volume(&mut self, id: VolumeId) -> Option<Volume> {
        self.archive_files.retain(|a| a.volume != id);
        self.verifications.remove(&id);
        self.volumes.remove(&id)
    }

    pub(crate) fn insert_job(&mut self, job: Job) {
        self.jobs.insert(job.id, job);
    }

    pub(crate) fn job_mut(&mut self, id: JobId) -> Result<&mut Job> {
        self.jobs.get_mut(&id).ok_or(DdbError::JobNotFound(id))
    }

    pub(crate) fn insert_archive_file(&mut self, file: ArchiveFile) {
        self.archive_files.push(file);
    }

    /// Delete the archive files stored in `volume`. Returns how many were removed.
    pub(crate) fn remove_archive_files_of_volume(&mut self, volume: VolumeId) -> usize {
        let before = self.archive_files.len();
        self.archive_files.retain(|a| a.volume != volume);
        before - self.archive_files.len()
    }

    pub(crate) fn insert_recon_job(&mut self, job: ReconJob) {
        self.recon_jobs.insert(job.id, job);
    }

    pub(crate) fn recon_job_mut(&mut self, id: JobId) -> Result<&mut ReconJob> {
        self.recon_jobs
            .get_mut(&id)
            .ok_or(DdbError::JobNotFound(id))
    }

    /// Returns false when the record already existed.
    pub(crate) fn insert_recon_batch(&mut self, record: ReconBatchRecord) -> bool {
        self.recon_batches.insert(record)
    }

    pub(crate) fn insert_failed_chunk(&mut self, record: FailedChunkRecord) {
        self.failed_chunks.push(record);
    }

    /// Append a resync history row and return its position for later update.
    pub(crate) fn push_resync_entry(&mut self, entry: ResyncHistoryEntry) -> usize {
        self.resync_history.push(entry);
        self.resync_history.len() - 1
    }

    pub(crate) fn resync_entry_mut(&mut self, row: usize) -> Result<&mut ResyncHistoryEntry> {
        self.resync_history
            .get_mut(row)
            .ok_or_else(|| DdbError::Other(format!("resync history row {row} missing")))
    }

    pub(crate) fn upsert_verification(&mut self, verification: Verification) {
        self.verifications.insert(verification.volume, verification);
    }

    /// Remove every metadata row of a store: descriptor, access paths, cache
    /// descriptors, substores, and the (already aged) volume rows. Callers run
    /// this inside one transaction so the removal is all-or-nothing.
    pub(crate) fn remove_store_metadata(&mut self, id: StoreId) -> Result<Store> {
        let store = self.stores.remove(&id).ok_or(DdbError::StoreNotFound(id))?;
        self.access_paths.retain(|p| p.store != id);
        self.caches.retain(|c| c.store != id);
        self.substores.retain(|_, s| s.store != id);
        let volumes: Vec<VolumeId> = self
            .volumes
            .values()
            .filter(|v| v.store == id)
            .map(|v| v.id)
            .collect();
        for volume in volumes {
            self.purge_volume(volume);
        }
        Ok(store)
    }
}
