use std::thread::JoinHandle;
use std::time::Instant;

use crossbeam_channel::{RecvTimeoutError, Sender};
use tracing::{debug, info, warn};

use super::scheduler::MaintenanceSchedule;
use crate::commands::prune::{run_pruning, PruneStats};
use crate::commands::resync::{run_pending, ResyncReport};
use crate::engine::Engine;
use crate::error::Result;

#[derive(Debug, Clone, Default)]
pub struct MaintenanceReport {
    pub resyncs: Vec<ResyncReport>,
    pub prune: PruneStats,
}

/// One maintenance tick: pending resyncs first, then a pruning pass.
pub fn run_once(engine: &Engine) -> Result<MaintenanceReport> {
    let resyncs = run_pending(engine)?;
    let prune = run_pruning(engine)?;
    Ok(MaintenanceReport { resyncs, prune })
}

/// Background thread running [`run_once`] every `resync.interval` (plus jitter).
pub struct MaintenanceTask {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

impl MaintenanceTask {
    pub fn spawn(engine: Engine) -> Result<Self> {
        let schedule = MaintenanceSchedule::from_config(&engine.config().resync)?;
        let (stop, stop_rx) = crossbeam_channel::bounded::<()>(1);

        let handle = std::thread::Builder::new()
            .name("ddb-maintenance".into())
            .spawn(move || loop {
                let now = Instant::now();
                let next = schedule.next_tick(now);
                match stop_rx.recv_timeout(next.saturating_duration_since(now)) {
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                        debug!("maintenance task stopping");
                        return;
                    }
                    Err(RecvTimeoutError::Timeout) => {}
                }
                match run_once(&engine) {
                    Ok(report) => info!(
                        resyncs = report.resyncs.len(),
                        volumes_aged = report.prune.volumes_aged,
                        "maintenance tick complete"
                    ),
                    Err(e) => warn!("maintenance tick failed: {e}"),
                }
            })?;
        info!(interval = ?schedule.interval, "maintenance task started");
        Ok(Self { stop, handle })
    }

    /// Stop the task and wait for an in-progress tick to finish.
    pub fn stop(self) {
        let _ = self.stop.send(());
        if self.handle.join().is_err() {
            warn!("maintenance task panicked");
        }
    }
}
