use thiserror::Error;

use crate::ledger::model::Volume;

/// What the helper found when it read a volume back.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VolumeScan {
    pub chunks: u64,
    pub bytes: u64,
    /// `(chunk number, reason)` for every chunk that could not be read.
    pub unreadable: Vec<(u64, String)>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReaderFault {
    /// The helper process went away mid-read. Transient: the job pauses and resumes.
    #[error("volume helper process was killed")]
    Killed,
    /// The helper ran but could not read the volume at all.
    #[error("volume helper failed: {0}")]
    Failed(String),
}

/// The external copy/replication helper that reads volume contents.
pub trait VolumeReader: Send + Sync {
    fn scan(&self, volume: &Volume) -> std::result::Result<VolumeScan, ReaderFault>;
}

/// Reader that trusts the chunk and byte counts recorded in the ledger.
#[derive(Debug, Default, Clone, Copy)]
pub struct LedgerVolumeReader;

impl VolumeReader for LedgerVolumeReader {
    fn scan(&self, volume: &Volume) -> std::result::Result<VolumeScan, ReaderFault> {
        Ok(VolumeScan {
            chunks: volume.chunk_count,
            bytes: volume.physical_bytes,
            unreadable: Vec::new(),
        })
    }
}
