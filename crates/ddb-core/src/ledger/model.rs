use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::EncodingConfig;
use ddb_types::{JobId, StoreId, SubstoreId, VolumeId};

/// Store descriptor (`IdxSIDBStore` in catalog terms).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Store {
    pub id: StoreId,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub sealed: Option<SealInfo>,
    /// End of the immutability window. `None` means the store was never locked.
    pub worm_until: Option<DateTime<Utc>>,
    pub resync_needed: bool,
    pub substores: Vec<SubstoreId>,
}

impl Store {
    pub fn is_sealed(&self) -> bool {
        self.sealed.is_some()
    }

    /// The lock end if the WORM window is still open at `now`.
    pub fn worm_lock_at(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.worm_until.filter(|until| now < *until)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SealInfo {
    pub at: DateTime<Utc>,
    pub reason: SealReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SealReason {
    Operator,
    MaxLifetime,
}

impl fmt::Display for SealReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SealReason::Operator => f.write_str("operator request"),
            SealReason::MaxLifetime => f.write_str("maximum lifetime reached"),
        }
    }
}

/// Access path descriptor (`IdxAccessPath`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessPath {
    pub store: StoreId,
    pub substore: SubstoreId,
    pub path: PathBuf,
}

/// Cache descriptor (`IdxCache`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheDescriptor {
    pub store: StoreId,
    pub substore: SubstoreId,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubstoreState {
    Active,
    Idle,
    Suspended,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Substore {
    pub id: SubstoreId,
    pub store: StoreId,
    /// Job of the last successful DDB backup. `JobId::NONE` when never backed
    /// up or after a full reconstruction.
    pub last_snap_job: JobId,
    /// When the snapshot behind `last_snap_job` was taken.
    pub last_snap_at: Option<DateTime<Utc>>,
    pub recovery_pending: bool,
    pub state: SubstoreState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VolumeFlag {
    Active,
    PendingPrune,
    Aged,
}

impl VolumeFlag {
    /// Numeric catalog code for this flag.
    pub fn code(self, encoding: &EncodingConfig) -> u32 {
        match self {
            VolumeFlag::Active => encoding.volume_active,
            VolumeFlag::PendingPrune => encoding.volume_pending_prune,
            VolumeFlag::Aged => encoding.volume_aged,
        }
    }

    pub fn from_code(code: u32, encoding: &EncodingConfig) -> Option<Self> {
        [VolumeFlag::Active, VolumeFlag::PendingPrune, VolumeFlag::Aged]
            .into_iter()
            .find(|flag| flag.code(encoding) == code)
    }
}

impl fmt::Display for VolumeFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VolumeFlag::Active => f.write_str("active"),
            VolumeFlag::PendingPrune => f.write_str("pending-prune"),
            VolumeFlag::Aged => f.write_str("aged"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Volume {
    pub id: VolumeId,
    pub store: StoreId,
    pub substore: SubstoreId,
    pub created_at: DateTime<Utc>,
    /// Last commit of a backup that wrote into or referenced this volume.
    pub last_backup_at: Option<DateTime<Utc>>,
    pub physical_bytes: u64,
    pub chunk_count: u64,
    pub flag: VolumeFlag,
    /// Ledger sequence number of the last flag change.
    pub flag_seq: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobKind {
    Backup,
    DdbBackup,
    Recon,
    Resync,
    SpaceReclaim,
    DataVerification,
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobKind::Backup => "backup",
            JobKind::DdbBackup => "ddb-backup",
            JobKind::Recon => "recon",
            JobKind::Resync => "resync",
            JobKind::SpaceReclaim => "space-reclaim",
            JobKind::DataVerification => "dv2",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    Running,
    Pending,
    Waiting,
    Completed,
    Killed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Killed | JobStatus::Failed
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobStatus::Running => "running",
            JobStatus::Pending => "pending",
            JobStatus::Waiting => "waiting",
            JobStatus::Completed => "completed",
            JobStatus::Killed => "killed",
            JobStatus::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgedReason {
    Retention,
    OperatorDelete,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgedStamp {
    pub reason: AgedReason,
    pub at: DateTime<Utc>,
    /// Ledger sequence number of the aging transaction.
    pub seq: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub kind: JobKind,
    pub store: Option<StoreId>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: JobStatus,
    /// Aged-by bitmask; see `EncodingConfig::job_aged_bit`.
    pub aged_by: u32,
    pub aged: Option<AgedStamp>,
    pub deleted_by_operator: bool,
}

impl Job {
    pub fn new(id: JobId, kind: JobKind, store: Option<StoreId>, now: DateTime<Utc>) -> Self {
        Self {
            id,
            kind,
            store,
            started_at: now,
            finished_at: None,
            status: JobStatus::Running,
            aged_by: 0,
            aged: None,
            deleted_by_operator: false,
        }
    }

    pub fn is_aged(&self, encoding: &EncodingConfig) -> bool {
        self.aged_by & encoding.job_aged_bit != 0
    }
}

/// One archive file: the bytes a job wrote into (or deduplicated against) a volume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveFile {
    pub job: JobId,
    pub volume: VolumeId,
    pub bytes: u64,
}

/// Phase of a reconstruction job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReconPhase {
    NotStarted,
    MarkedForRecovery,
    AddRecords,
    Pending,
    Completed,
    Failed,
}

impl ReconPhase {
    pub fn name(self) -> &'static str {
        match self {
            ReconPhase::NotStarted => "not-started",
            ReconPhase::MarkedForRecovery => "marked-for-recovery",
            ReconPhase::AddRecords => "add-records",
            ReconPhase::Pending => "pending",
            ReconPhase::Completed => "completed",
            ReconPhase::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ReconPhase::Completed | ReconPhase::Failed)
    }

    /// Legal edges of the reconstruction state machine.
    pub fn can_transition_to(self, next: ReconPhase) -> bool {
        use ReconPhase::*;
        matches!(
            (self, next),
            (NotStarted, MarkedForRecovery)
                | (NotStarted, Failed)
                | (MarkedForRecovery, AddRecords)
                | (MarkedForRecovery, Failed)
                | (AddRecords, Pending)
                | (AddRecords, Completed)
                | (AddRecords, Failed)
                | (Pending, AddRecords)
        )
    }
}

impl fmt::Display for ReconPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Durable state of one reconstruction job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconJob {
    pub id: JobId,
    pub store: StoreId,
    pub full: bool,
    pub phase: ReconPhase,
    /// Volumes the job must recover, fixed when the job entered `AddRecords`.
    pub active_set: std::collections::BTreeSet<VolumeId>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Number of times the job has been resumed from `Pending`.
    pub resumes: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReconBatchRecord {
    pub job: JobId,
    pub volume: VolumeId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedChunkRecord {
    pub job: JobId,
    pub volume: VolumeId,
    pub chunk: Option<u64>,
    pub reason: String,
}

/// Why a maintenance pass ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MaintenanceReason {
    PostReconstruction,
    Operator,
}

impl MaintenanceReason {
    pub fn code(self) -> u32 {
        match self {
            MaintenanceReason::PostReconstruction => 1,
            MaintenanceReason::Operator => 2,
        }
    }
}

/// Bits recorded in `ResyncHistoryEntry::flags`.
pub mod resync_flags {
    /// Index entries were added for live volumes the index did not know.
    pub const ADD_MISSING: u32 = 0x1;
    /// Index entries were dropped for volumes that are gone or aged.
    pub const DROP_STALE: u32 = 0x2;
    /// Every substore index of the store was visited.
    pub const ALL_SUBSTORES: u32 = 0x4;
}

pub const RESYNC_IN_PROGRESS: i32 = -1;
pub const RESYNC_SUCCESS: i32 = 0;
pub const RESYNC_FAILED: i32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResyncHistoryEntry {
    pub store: StoreId,
    pub at: DateTime<Utc>,
    pub flags: u32,
    pub attempt: u32,
    pub reason: MaintenanceReason,
    /// `-1` while running, `0` on success, positive on failure.
    pub status: i32,
    pub added: u64,
    pub dropped: u64,
}

/// Outcome of the last data verification of a volume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verification {
    pub volume: VolumeId,
    pub job: JobId,
    pub at: DateTime<Utc>,
    pub thorough: bool,
    pub ok: bool,
}
