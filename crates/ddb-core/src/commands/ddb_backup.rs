use std::path::Path;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::access::require_write;
use crate::commands::util::with_job;
use crate::engine::Engine;
use crate::error::{DdbError, Result};
use crate::jobs::JobHandle;
use crate::ledger::model::JobKind;
use crate::quiesce::{quiesce, unquiesce};
use ddb_types::{JobId, StoreId, SubstoreId};

#[derive(Debug, Clone)]
pub struct SubstoreSnapshot {
    pub substore: SubstoreId,
    pub taken_at: DateTime<Utc>,
    pub files: usize,
    pub bytes: u64,
}

#[derive(Debug, Clone)]
pub struct DdbBackupReport {
    pub job: JobId,
    pub store: StoreId,
    pub snapshots: Vec<SubstoreSnapshot>,
}

impl DdbBackupReport {
    pub fn bytes_copied(&self) -> u64 {
        self.snapshots.iter().map(|s| s.bytes).sum()
    }
}

/// Snapshot every substore index of `store` into the backup directory.
///
/// Each substore is quiesced only while its files are copied. The snapshot
/// markers advance in one transaction after every substore succeeded; any
/// failure leaves all of them where they were.
pub fn run_ddb_backup(engine: &Engine, store: StoreId) -> Result<DdbBackupReport> {
    let substores = engine.ledger().read(|t| -> Result<Vec<SubstoreId>> {
        t.require_store(store)?;
        let mut ids = Vec::new();
        for s in t.substores_of(store) {
            if s.recovery_pending {
                return Err(DdbError::InvalidState(format!(
                    "{} has recovery pending; DDB backup refused",
                    s.id
                )));
            }
            ids.push(s.id);
        }
        Ok(ids)
    })?;

    with_job(engine, JobKind::DdbBackup, Some(store), |handle| {
        let snapshots = match snapshot_substores(engine, handle, store, &substores) {
            Ok(snapshots) => snapshots,
            Err(e) => {
                let dest = engine
                    .config()
                    .paths
                    .backup_dir
                    .join(format!("job-{}", handle.id.get()));
                if let Err(cleanup) = remove_dir_if_exists(&dest) {
                    warn!(job = %handle.id, "failed to remove partial DDB backup: {cleanup}");
                }
                return Err(e);
            }
        };

        engine.ledger().write(|t| {
            for snap in &snapshots {
                let row = t.substore_mut(snap.substore)?;
                row.last_snap_job = handle.id;
                row.last_snap_at = Some(snap.taken_at);
            }
            Ok(())
        })?;
        info!(
            job = %handle.id,
            %store,
            substores = snapshots.len(),
            "DDB backup complete; snapshot markers advanced"
        );
        Ok(DdbBackupReport {
            job: handle.id,
            store,
            snapshots,
        })
    })
}

fn snapshot_substores(
    engine: &Engine,
    handle: JobHandle,
    store: StoreId,
    substores: &[SubstoreId],
) -> Result<Vec<SubstoreSnapshot>> {
    let mut snapshots = Vec::with_capacity(substores.len());
    for &substore in substores {
        let dest = engine.backup_copy_dir(handle.id, substore);
        require_write(engine.access(), &dest)?;

        let token = quiesce(engine, substore)?;
        let taken_at = engine.now();
        let (files, bytes) = copy_index_files(&token.dir().index_files()?, &dest)?;
        unquiesce(token)?;

        debug!(job = %handle.id, %store, %substore, files, bytes, "substore index copied");
        snapshots.push(SubstoreSnapshot {
            substore,
            taken_at,
            files,
            bytes,
        });
    }
    Ok(snapshots)
}

fn copy_index_files(files: &[std::path::PathBuf], dest: &Path) -> Result<(usize, u64)> {
    std::fs::create_dir_all(dest)?;
    let mut bytes = 0;
    for src in files {
        let Some(name) = src.file_name() else {
            continue;
        };
        bytes += std::fs::copy(src, dest.join(name))?;
    }
    Ok((files.len(), bytes))
}

fn remove_dir_if_exists(path: &Path) -> Result<()> {
    match std::fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
