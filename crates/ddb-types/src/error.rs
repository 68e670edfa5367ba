use std::fmt;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::ids::{JobId, StoreId, SubstoreId, VolumeId};

pub type Result<T> = std::result::Result<T, DdbError>;

/// Which policy gate refused a write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteGate {
    /// The store's immutability window is still open.
    Worm { until: DateTime<Utc> },
    /// The external access-control gate denied the path.
    AccessControl,
    /// The substore is quiesced for a DDB backup.
    Quiesced,
}

impl fmt::Display for WriteGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteGate::Worm { until } => write!(f, "WORM lock active until {}", until.to_rfc3339()),
            WriteGate::AccessControl => f.write_str("access control denied write"),
            WriteGate::Quiesced => f.write_str("substore is quiesced"),
        }
    }
}

#[derive(Debug, Error)]
pub enum DdbError {
    #[error("{0} is already quiesced")]
    AlreadyQuiesced(SubstoreId),

    #[error("write denied on '{target}': {gate}")]
    WriteDenied { target: String, gate: WriteGate },

    #[error("cannot mark {substore} for recovery: {live_writers} live writer(s)")]
    RecoveryPreconditionUnmet {
        substore: SubstoreId,
        live_writers: usize,
    },

    #[error("reconstruction {job} incomplete: {failed} failed chunk record(s)")]
    ReconIncomplete { job: JobId, failed: usize },

    #[error("ledger inconsistency in {job}: {detail}")]
    LedgerInconsistency { job: JobId, detail: String },

    #[error("space reclamation refused: {store} is WORM-locked until {}", until.to_rfc3339())]
    ReclaimRefusedWormLocked { store: StoreId, until: DateTime<Utc> },

    #[error("{0} not found")]
    StoreNotFound(StoreId),

    #[error("no store named '{0}'")]
    StoreNameNotFound(String),

    #[error("{0} not found")]
    SubstoreNotFound(SubstoreId),

    #[error("{0} not found")]
    VolumeNotFound(VolumeId),

    #[error("{0} not found")]
    JobNotFound(JobId),

    #[error("{0} is sealed and accepts no new volumes")]
    StoreSealed(StoreId),

    #[error("invalid phase transition {from} -> {to} for {job}")]
    InvalidTransition {
        job: JobId,
        from: &'static str,
        to: &'static str,
    },

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] rmp_serde::encode::Error),

    #[error("deserialization error: {0}")]
    Deserialization(#[from] rmp_serde::decode::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl DdbError {
    /// True for refusals that come from policy rather than from a fault.
    pub fn is_policy_refusal(&self) -> bool {
        matches!(
            self,
            DdbError::WriteDenied { .. } | DdbError::ReclaimRefusedWormLocked { .. }
        )
    }
}
