use std::path::PathBuf;
use std::time::Duration;

use crate::error::{DdbError, Result};

pub(super) fn default_index_root() -> PathBuf {
    PathBuf::from("ddb/index")
}

pub(super) fn default_backup_dir() -> PathBuf {
    PathBuf::from("ddb/backups")
}

pub(super) fn default_max_volumes_per_batch() -> usize {
    10_000
}

pub(super) fn default_helper_timeout() -> String {
    "5m".to_string()
}

pub(super) fn default_max_auto_resumes() -> u32 {
    3
}

pub(super) fn default_resume_delay() -> String {
    "10s".to_string()
}

pub(super) fn default_drain_timeout() -> String {
    "2m".to_string()
}

pub(super) fn default_writer_block_timeout() -> String {
    "10m".to_string()
}

pub(super) fn default_stale_marker_after() -> String {
    "6h".to_string()
}

pub(super) fn default_resync_interval() -> String {
    "15m".to_string()
}

pub(super) fn default_retention_days() -> u32 {
    30
}

pub(super) fn default_retention_cycles() -> u32 {
    2
}

pub(super) fn default_min_store_lifetime_days() -> u32 {
    1
}

pub(super) fn default_reclaim_timeout() -> String {
    "1h".to_string()
}

pub(super) fn default_volume_active_code() -> u32 {
    0
}

pub(super) fn default_volume_pending_prune_code() -> u32 {
    1
}

pub(super) fn default_volume_aged_code() -> u32 {
    6
}

pub(super) fn default_job_aged_bit() -> u32 {
    512
}

pub(super) fn default_true() -> bool {
    true
}

/// Parse a simple duration string like "250ms", "30s", "30m", "4h", or "2d".
/// A bare number is read as seconds.
pub fn parse_human_duration(raw: &str) -> Result<Duration> {
    let input = raw.trim();
    if input.is_empty() {
        return Err(DdbError::Config("duration must not be empty".into()));
    }

    let split = input
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(input.len());
    let (num_part, unit) = input.split_at(split);

    let value: u64 = num_part
        .parse()
        .map_err(|_| DdbError::Config(format!("invalid duration value: '{raw}'")))?;

    let duration = match unit {
        "ms" => Duration::from_millis(value),
        "" | "s" | "S" => Duration::from_secs(value),
        "m" | "M" => Duration::from_secs(value.saturating_mul(60)),
        "h" | "H" => Duration::from_secs(value.saturating_mul(60 * 60)),
        "d" | "D" => Duration::from_secs(value.saturating_mul(60 * 60 * 24)),
        other => {
            return Err(DdbError::Config(format!(
                "unsupported duration suffix '{other}' in '{raw}' (use ms/s/m/h/d)"
            )));
        }
    };

    if duration.is_zero() {
        return Err(DdbError::Config(
            "duration must be greater than zero".into(),
        ));
    }

    Ok(duration)
}
