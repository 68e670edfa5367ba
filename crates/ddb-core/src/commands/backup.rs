use std::collections::BTreeSet;

use tracing::{debug, info, warn};

use crate::access::require_write;
use crate::commands::util::{finish_job, start_job};
use crate::engine::Engine;
use crate::error::{DdbError, Result};
use crate::index::IndexEntry;
use crate::jobs::JobHandle;
use crate::ledger::model::{ArchiveFile, JobKind, JobStatus, Volume, VolumeFlag};
use crate::quiesce::WriterSession;
use ddb_types::{JobId, StoreId, SubstoreId, VolumeId};

/// A running backup job writing into one store.
///
/// The session counts as a live writer on every substore of the store until
/// it is committed or dropped. Dropping an uncommitted session fails the job;
/// volumes it created stay uncommitted and are never recovered.
pub struct BackupSession {
    engine: Engine,
    handle: JobHandle,
    store: StoreId,
    _writers: Vec<WriterSession>,
    touched: BTreeSet<VolumeId>,
    finished: bool,
}

/// Open a backup session against `store`.
pub fn begin_backup(engine: &Engine, store: StoreId) -> Result<BackupSession> {
    let substores = engine.ledger().read(|t| -> Result<Vec<SubstoreId>> {
        let row = t.require_store(store)?;
        if row.is_sealed() {
            return Err(DdbError::StoreSealed(store));
        }
        if let Some(s) = t.substores_of(store).find(|s| s.recovery_pending) {
            return Err(DdbError::InvalidState(format!(
                "{} is being recovered; backups are refused",
                s.id
            )));
        }
        Ok(row.substores.clone())
    })?;

    let writers = substores
        .iter()
        .map(|s| engine.quiesce().register_writer(*s))
        .collect::<Result<Vec<_>>>()?;
    let handle = start_job(engine, JobKind::Backup, Some(store))?;
    debug!(job = %handle.id, %store, "backup session opened");
    Ok(BackupSession {
        engine: engine.clone(),
        handle,
        store,
        _writers: writers,
        touched: BTreeSet::new(),
        finished: false,
    })
}

impl BackupSession {
    pub fn job(&self) -> JobId {
        self.handle.id
    }

    pub fn store(&self) -> StoreId {
        self.store
    }

    /// Write a new volume into `substore`.
    pub fn write_volume(&mut self, substore: SubstoreId, bytes: u64, chunks: u64) -> Result<VolumeId> {
        self.check_substore(substore)?;
        let dir = self.engine.index_dir(self.store, substore);
        require_write(self.engine.access(), dir.path())?;
        let _write = self.engine.quiesce().begin_write(substore)?;

        let now = self.engine.now();
        let (job, store) = (self.handle.id, self.store);
        let volume = self.engine.ledger().write(|t| {
            if t.require_store(store)?.is_sealed() {
                return Err(DdbError::StoreSealed(store));
            }
            let id = t.insert_volume(store, substore, now);
            let row = t.volume_mut(id)?;
            row.physical_bytes = bytes;
            row.chunk_count = chunks;
            t.insert_archive_file(ArchiveFile {
                job,
                volume: id,
                bytes,
            });
            Ok(id)
        })?;

        let mut index = dir.load()?;
        index.upsert(
            volume,
            IndexEntry {
                chunk_count: chunks,
                bytes,
            },
        );
        dir.save(&mut index)?;
        self.touched.insert(volume);
        debug!(job = %job, %volume, %substore, bytes, chunks, "volume written");
        Ok(volume)
    }

    /// Append data to an existing active volume of this store.
    pub fn extend_volume(&mut self, volume: VolumeId, bytes: u64, chunks: u64) -> Result<()> {
        let current = self.writable_volume(volume)?;
        let dir = self.engine.index_dir(self.store, current.substore);
        require_write(self.engine.access(), dir.path())?;
        let _write = self.engine.quiesce().begin_write(current.substore)?;

        let job = self.handle.id;
        let updated = self.engine.ledger().write(|t| {
            let row = t.volume_mut(volume)?;
            if row.flag != VolumeFlag::Active {
                return Err(DdbError::InvalidState(format!(
                    "{volume} is {} and cannot be extended",
                    row.flag
                )));
            }
            row.physical_bytes += bytes;
            row.chunk_count += chunks;
            let entry = IndexEntry {
                chunk_count: row.chunk_count,
                bytes: row.physical_bytes,
            };
            t.insert_archive_file(ArchiveFile { job, volume, bytes });
            Ok(entry)
        })?;

        let mut index = dir.load()?;
        index.upsert(volume, updated);
        dir.save(&mut index)?;
        self.touched.insert(volume);
        Ok(())
    }

    /// Record that this backup deduplicated `bytes` against an existing volume.
    pub fn reference_volume(&mut self, volume: VolumeId, bytes: u64) -> Result<()> {
        self.writable_volume(volume)?;
        let job = self.handle.id;
        self.engine.ledger().write(|t| {
            let row = t.require_volume(volume)?;
            if row.flag != VolumeFlag::Active {
                return Err(DdbError::InvalidState(format!(
                    "{volume} is {} and cannot be referenced",
                    row.flag
                )));
            }
            t.insert_archive_file(ArchiveFile { job, volume, bytes });
            Ok(())
        })?;
        self.touched.insert(volume);
        Ok(())
    }

    /// Complete the job and stamp the last-backup time of every volume it touched.
    pub fn commit(mut self) -> Result<JobId> {
        let now = self.engine.now();
        let job = self.handle.id;
        let touched = std::mem::take(&mut self.touched);
        self.engine.ledger().write(|t| {
            for volume in &touched {
                t.volume_mut(*volume)?.last_backup_at = Some(now);
            }
            let row = t.job_mut(job)?;
            row.status = JobStatus::Completed;
            row.finished_at = Some(now);
            Ok(())
        })?;
        self.finished = true;
        self.engine
            .scheduler()
            .update(self.handle, JobStatus::Completed)?;
        info!(%job, store = %self.store, volumes = touched.len(), "backup committed");
        Ok(job)
    }

    fn check_substore(&self, substore: SubstoreId) -> Result<()> {
        let owner = self
            .engine
            .ledger()
            .read(|t| t.require_substore(substore).map(|s| s.store))?;
        if owner != self.store {
            return Err(DdbError::InvalidState(format!(
                "{substore} belongs to {owner}, not {}",
                self.store
            )));
        }
        Ok(())
    }

    fn writable_volume(&self, volume: VolumeId) -> Result<Volume> {
        let row = self
            .engine
            .ledger()
            .read(|t| t.require_volume(volume).cloned())?;
        if row.store != self.store {
            return Err(DdbError::InvalidState(format!(
                "{volume} belongs to {}, not {}",
                row.store, self.store
            )));
        }
        Ok(row)
    }
}

impl Drop for BackupSession {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        warn!(job = %self.handle.id, store = %self.store, "backup session dropped without commit");
        if let Err(e) = finish_job(&self.engine, self.handle, JobStatus::Failed) {
            warn!(job = %self.handle.id, "failed to record aborted backup: {e}");
        }
    }
}
