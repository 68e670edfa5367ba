use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{DdbError, Result, WriteGate};
use ddb_types::{StoreId, SubstoreId, VolumeId};

/// Index file holding the volume entries of one substore (MessagePack).
pub const INDEX_FILE: &str = "ddb.idx";
/// Small JSON file with the substore's runtime state.
pub const STATE_FILE: &str = "state.json";
/// Present while the substore is quiesced.
pub const QUIESCE_MARKER: &str = "quiesce.json";

/// What the on-disk index knows about one volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub chunk_count: u64,
    pub bytes: u64,
}

/// In-memory image of a substore's deduplication index.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubstoreIndex {
    pub entries: BTreeMap<VolumeId, IndexEntry>,
    pub generation: u64,
}

impl SubstoreIndex {
    pub fn contains(&self, volume: VolumeId) -> bool {
        self.entries.contains_key(&volume)
    }

    pub fn upsert(&mut self, volume: VolumeId, entry: IndexEntry) {
        self.entries.insert(volume, entry);
    }

    pub fn remove(&mut self, volume: VolumeId) -> Option<IndexEntry> {
        self.entries.remove(&volume)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct StateFile {
    substore: SubstoreId,
    generation: u64,
    updated_at: String,
}

/// Quiesce marker stored as `quiesce.json`; same shape as a repository lock entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuiesceMarker {
    pub hostname: String,
    pub pid: u32,
    pub time: String,
}

/// Where substore index directories live and how old a quiesce marker may get.
#[derive(Debug, Clone)]
pub struct IndexLayout {
    root: PathBuf,
    stale_marker_after: chrono::Duration,
}

impl IndexLayout {
    pub fn new(root: impl Into<PathBuf>, stale_marker_after: std::time::Duration) -> Self {
        Self {
            root: root.into(),
            stale_marker_after: chrono::Duration::from_std(stale_marker_after)
                .unwrap_or_else(|_| chrono::Duration::hours(6)),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn dir(&self, store: StoreId, substore: SubstoreId) -> IndexDir {
        IndexDir {
            path: self
                .root
                .join(format!("store-{}", store.get()))
                .join(format!("substore-{}", substore.get())),
            substore,
            stale_marker_after: self.stale_marker_after,
        }
    }
}

/// Handle to the index directory of one substore.
#[derive(Debug, Clone)]
pub struct IndexDir {
    path: PathBuf,
    substore: SubstoreId,
    stale_marker_after: chrono::Duration,
}

impl IndexDir {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn substore(&self) -> SubstoreId {
        self.substore
    }

    pub fn ensure(&self) -> Result<()> {
        std::fs::create_dir_all(&self.path)?;
        Ok(())
    }

    /// Load the index. A missing index file reads as an empty index.
    pub fn load(&self) -> Result<SubstoreIndex> {
        match std::fs::read(self.path.join(INDEX_FILE)) {
            Ok(data) => Ok(rmp_serde::from_slice(&data)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(SubstoreIndex::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Persist the index and bump the state file. Refused while quiesced.
    pub fn save(&self, index: &mut SubstoreIndex) -> Result<()> {
        self.check_not_quiesced()?;
        self.ensure()?;
        index.generation += 1;
        let data = rmp_serde::to_vec_named(index)?;
        write_atomic(&self.path.join(INDEX_FILE), &data)?;

        let state = StateFile {
            substore: self.substore,
            generation: index.generation,
            updated_at: Utc::now().to_rfc3339(),
        };
        let mut file = self.open_state_for_write()?;
        file.write_all(&serde_json::to_vec(&state)?)?;
        file.sync_all()?;
        debug!(substore = %self.substore, generation = index.generation, "index saved");
        Ok(())
    }

    /// Open the state file for writing.
    ///
    /// Fails with `PermissionDenied` while a live quiesce marker exists, no
    /// matter which process (or which engine instance) wrote the marker.
    pub fn open_state_for_write(&self) -> std::io::Result<std::fs::File> {
        if self.live_marker().is_some() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                format!(
                    "state file of {} is read-only while quiesced",
                    self.substore
                ),
            ));
        }
        std::fs::File::create(self.path.join(STATE_FILE))
    }

    pub(crate) fn check_not_quiesced(&self) -> Result<()> {
        if self.live_marker().is_some() {
            return Err(DdbError::WriteDenied {
                target: self.path.display().to_string(),
                gate: WriteGate::Quiesced,
            });
        }
        Ok(())
    }

    /// Create the quiesce marker exclusively.
    ///
    /// Fails with `AlreadyQuiesced` while another live marker exists. A stale
    /// marker is removed and creation retried once.
    pub(crate) fn create_quiesce_marker(&self, now: DateTime<Utc>) -> Result<QuiesceMarker> {
        self.ensure()?;
        let marker = QuiesceMarker {
            hostname: host_name(),
            pid: std::process::id(),
            time: now.to_rfc3339(),
        };
        let data = serde_json::to_vec(&marker)?;
        let path = self.path.join(QUIESCE_MARKER);

        for attempt in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    file.write_all(&data)?;
                    file.sync_all()?;
                    return Ok(marker);
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if attempt > 0 || !self.existing_marker_is_stale(&path) {
                        return Err(DdbError::AlreadyQuiesced(self.substore));
                    }
                    warn!(substore = %self.substore, "replacing stale quiesce marker");
                    remove_if_present(&path)?;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(DdbError::AlreadyQuiesced(self.substore))
    }

    /// Remove the quiesce marker if it is still the one `owned` describes.
    ///
    /// A marker that was replaced by another holder is left in place.
    pub(crate) fn clear_quiesce_marker(&self, owned: &QuiesceMarker) -> Result<()> {
        let path = self.path.join(QUIESCE_MARKER);
        let data = match std::fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_slice::<QuiesceMarker>(&data) {
            Ok(marker) if marker == *owned => remove_if_present(&path),
            Ok(marker) => {
                warn!(
                    substore = %self.substore,
                    holder = %marker.hostname,
                    pid = marker.pid,
                    "quiesce marker belongs to another holder; leaving it"
                );
                Ok(())
            }
            Err(_) => {
                warn!(substore = %self.substore, "leaving unreadable quiesce marker in place");
                Ok(())
            }
        }
    }

    /// Age check for a marker found in the way of a new quiesce. An unreadable
    /// marker may still be mid-write, so its file mtime decides.
    fn existing_marker_is_stale(&self, path: &Path) -> bool {
        let written = match std::fs::read(path)
            .ok()
            .and_then(|data| serde_json::from_slice::<QuiesceMarker>(&data).ok())
        {
            Some(marker) => match DateTime::parse_from_rfc3339(&marker.time) {
                Ok(at) => at.with_timezone(&Utc),
                Err(_) => return true,
            },
            None => match std::fs::metadata(path).and_then(|m| m.modified()) {
                Ok(modified) => DateTime::<Utc>::from(modified),
                // Vanished between the failed create and now.
                Err(_) => return true,
            },
        };
        Utc::now().signed_duration_since(written) > self.stale_marker_after
    }

    /// The quiesce marker, unless absent, unreadable, or stale.
    pub fn live_marker(&self) -> Option<QuiesceMarker> {
        let data = std::fs::read(self.path.join(QUIESCE_MARKER)).ok()?;
        let Ok(marker) = serde_json::from_slice::<QuiesceMarker>(&data) else {
            warn!(substore = %self.substore, "ignoring unreadable quiesce marker");
            return None;
        };
        let Ok(at) = DateTime::parse_from_rfc3339(&marker.time) else {
            return None;
        };
        if Utc::now().signed_duration_since(at.with_timezone(&Utc)) > self.stale_marker_after {
            debug!(substore = %self.substore, "quiesce marker is stale");
            return None;
        }
        Some(marker)
    }

    /// Files that make up the index (everything except the quiesce marker).
    pub fn index_files(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        let entries = match std::fs::read_dir(&self.path) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(files),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            if entry.file_name() == QUIESCE_MARKER {
                continue;
            }
            files.push(entry.path());
        }
        files.sort();
        Ok(files)
    }

    /// Files in the directory that are not part of a healthy index.
    pub fn stray_files(&self) -> Result<Vec<PathBuf>> {
        Ok(self
            .index_files()?
            .into_iter()
            .filter(|p| {
                p.file_name()
                    .map_or(true, |name| name != INDEX_FILE && name != STATE_FILE)
            })
            .collect())
    }

    /// Replace the index files with the ones found in `from`.
    pub fn restore_from(&self, from: &Path) -> Result<()> {
        self.check_not_quiesced()?;
        self.ensure()?;
        for name in [INDEX_FILE, STATE_FILE] {
            let src = from.join(name);
            if src.exists() {
                std::fs::copy(&src, self.path.join(name))?;
            }
        }
        Ok(())
    }

    /// Drop the index so it rebuilds from scratch.
    pub fn reset(&self) -> Result<()> {
        self.check_not_quiesced()?;
        match std::fs::remove_file(self.path.join(INDEX_FILE)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn remove_all(&self) -> Result<()> {
        match std::fs::remove_dir_all(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Host recorded in quiesce markers, so an operator can tell which service
/// instance froze a substore.
fn host_name() -> String {
    #[cfg(unix)]
    let name = nix::unistd::gethostname()
        .ok()
        .map(|h| h.to_string_lossy().into_owned());
    #[cfg(not(unix))]
    let name = std::env::var("COMPUTERNAME").ok();
    name.unwrap_or_else(|| "unknown".to_string())
}

fn remove_if_present(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(data)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}
