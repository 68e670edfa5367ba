use std::time::{Duration, Instant};

use rand::Rng;

use crate::config::ResyncConfig;
use crate::error::Result;

/// When the background maintenance task wakes up.
///
/// Ticks are `interval` apart plus up to `jitter` extra, so several services
/// sharing one ledger do not all resync at the same instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaintenanceSchedule {
    pub interval: Duration,
    pub jitter: Duration,
}

impl MaintenanceSchedule {
    pub fn from_config(resync: &ResyncConfig) -> Result<Self> {
        Ok(Self {
            interval: resync.interval_duration()?,
            jitter: Duration::from_secs(resync.jitter_seconds),
        })
    }

    pub fn next_tick(&self, now: Instant) -> Instant {
        now + self.interval + self.sample_jitter()
    }

    fn sample_jitter(&self) -> Duration {
        let max = self.jitter.as_millis() as u64;
        if max == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=max))
    }
}
