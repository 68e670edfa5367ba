use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::defaults::*;
use crate::error::{DdbError, Result};

/// Top-level engine configuration, usually read from `ddb.yaml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub recon: ReconConfig,
    #[serde(default)]
    pub quiesce: QuiesceConfig,
    #[serde(default)]
    pub resync: ResyncConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub lifetime: LifetimeConfig,
    #[serde(default)]
    pub reclaim: ReclaimConfig,
    #[serde(default)]
    pub encoding: EncodingConfig,
}

impl EngineConfig {
    /// Check cross-field constraints and that every duration string parses.
    pub fn validate(&self) -> Result<()> {
        if self.recon.max_volumes_per_batch == 0 {
            return Err(DdbError::Config(
                "recon.max_volumes_per_batch must be at least 1".into(),
            ));
        }
        self.recon.helper_timeout_duration()?;
        self.recon.resume_delay_duration()?;
        self.quiesce.drain_timeout_duration()?;
        self.quiesce.writer_block_timeout_duration()?;
        self.quiesce.stale_marker_duration()?;
        self.resync.interval_duration()?;
        self.reclaim.timeout_duration()?;
        self.encoding.validate()?;
        if let Some(seal_after) = self.lifetime.seal_after_days {
            if seal_after < self.lifetime.min_store_lifetime_days {
                return Err(DdbError::Config(format!(
                    "lifetime.seal_after_days ({seal_after}) is below min_store_lifetime_days ({})",
                    self.lifetime.min_store_lifetime_days
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PathsConfig {
    /// Root directory holding one index directory per substore.
    #[serde(default = "default_index_root")]
    pub index_root: PathBuf,
    /// Destination for DDB backup copies.
    #[serde(default = "default_backup_dir")]
    pub backup_dir: PathBuf,
    /// Ledger snapshot file. In-memory ledger when unset.
    #[serde(default)]
    pub ledger: Option<PathBuf>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            index_root: default_index_root(),
            backup_dir: default_backup_dir(),
            ledger: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReconConfig {
    /// Upper bound on volumes handed to the helper per batch.
    #[serde(default = "default_max_volumes_per_batch")]
    pub max_volumes_per_batch: usize,
    /// How long to wait for the helper's next result before declaring it lost.
    #[serde(default = "default_helper_timeout")]
    pub helper_timeout: String,
    /// Automatic `Pending -> AddRecords` resumes before handing back to the caller.
    #[serde(default = "default_max_auto_resumes")]
    pub max_auto_resumes: u32,
    #[serde(default = "default_resume_delay")]
    pub resume_delay: String,
    /// Read the volumes of a batch in parallel.
    #[serde(default = "default_true")]
    pub parallel_reads: bool,
}

impl ReconConfig {
    pub fn helper_timeout_duration(&self) -> Result<Duration> {
        parse_human_duration(&self.helper_timeout)
    }

    pub fn resume_delay_duration(&self) -> Result<Duration> {
        parse_human_duration(&self.resume_delay)
    }
}

impl Default for ReconConfig {
    fn default() -> Self {
        Self {
            max_volumes_per_batch: default_max_volumes_per_batch(),
            helper_timeout: default_helper_timeout(),
            max_auto_resumes: default_max_auto_resumes(),
            resume_delay: default_resume_delay(),
            parallel_reads: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QuiesceConfig {
    /// Max wait for in-flight index writes to drain after quiescing.
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout: String,
    /// Max time a writer blocks on a quiesced substore before giving up.
    #[serde(default = "default_writer_block_timeout")]
    pub writer_block_timeout: String,
    /// Quiesce markers older than this are ignored (left by a dead process).
    #[serde(default = "default_stale_marker_after")]
    pub stale_marker_after: String,
}

impl QuiesceConfig {
    pub fn drain_timeout_duration(&self) -> Result<Duration> {
        parse_human_duration(&self.drain_timeout)
    }

    pub fn writer_block_timeout_duration(&self) -> Result<Duration> {
        parse_human_duration(&self.writer_block_timeout)
    }

    pub fn stale_marker_duration(&self) -> Result<Duration> {
        parse_human_duration(&self.stale_marker_after)
    }
}

impl Default for QuiesceConfig {
    fn default() -> Self {
        Self {
            drain_timeout: default_drain_timeout(),
            writer_block_timeout: default_writer_block_timeout(),
            stale_marker_after: default_stale_marker_after(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResyncConfig {
    /// How often the maintenance task looks for stores needing resync.
    #[serde(default = "default_resync_interval")]
    pub interval: String,
    #[serde(default)]
    pub jitter_seconds: u64,
}

impl ResyncConfig {
    pub fn interval_duration(&self) -> Result<Duration> {
        parse_human_duration(&self.interval)
    }
}

impl Default for ResyncConfig {
    fn default() -> Self {
        Self {
            interval: default_resync_interval(),
            jitter_seconds: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetentionConfig {
    /// Minimum age of a backup job before it may be aged.
    #[serde(default = "default_retention_days")]
    pub days: u32,
    /// Number of newer completed backups that must exist before a job ages.
    #[serde(default = "default_retention_cycles")]
    pub cycles: u32,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            days: default_retention_days(),
            cycles: default_retention_cycles(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LifetimeConfig {
    /// A store younger than this cannot be sealed.
    #[serde(default = "default_min_store_lifetime_days")]
    pub min_store_lifetime_days: u32,
    /// Seal stores automatically once they reach this age.
    #[serde(default)]
    pub seal_after_days: Option<u32>,
}

impl Default for LifetimeConfig {
    fn default() -> Self {
        Self {
            min_store_lifetime_days: default_min_store_lifetime_days(),
            seal_after_days: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReclaimConfig {
    /// A reclaim job running longer than this is considered hung and killed.
    #[serde(default = "default_reclaim_timeout")]
    pub timeout: String,
}

impl ReclaimConfig {
    pub fn timeout_duration(&self) -> Result<Duration> {
        parse_human_duration(&self.timeout)
    }
}

impl Default for ReclaimConfig {
    fn default() -> Self {
        Self {
            timeout: default_reclaim_timeout(),
        }
    }
}

/// Numeric catalog codes for volume flags and the job aged bit.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EncodingConfig {
    #[serde(default = "default_volume_active_code")]
    pub volume_active: u32,
    #[serde(default = "default_volume_pending_prune_code")]
    pub volume_pending_prune: u32,
    #[serde(default = "default_volume_aged_code")]
    pub volume_aged: u32,
    /// Bit in a job's aged-by mask that marks it fully aged.
    #[serde(default = "default_job_aged_bit")]
    pub job_aged_bit: u32,
}

impl EncodingConfig {
    pub fn validate(&self) -> Result<()> {
        let codes = [self.volume_active, self.volume_pending_prune, self.volume_aged];
        if codes[0] == codes[1] || codes[0] == codes[2] || codes[1] == codes[2] {
            return Err(DdbError::Config(format!(
                "volume flag codes must be distinct, got {codes:?}"
            )));
        }
        if self.job_aged_bit.count_ones() != 1 {
            return Err(DdbError::Config(format!(
                "encoding.job_aged_bit must be a single bit, got {}",
                self.job_aged_bit
            )));
        }
        Ok(())
    }
}

impl Default for EncodingConfig {
    fn default() -> Self {
        Self {
            volume_active: default_volume_active_code(),
            volume_pending_prune: default_volume_pending_prune_code(),
            volume_aged: default_volume_aged_code(),
            job_aged_bit: default_job_aged_bit(),
        }
    }
}
