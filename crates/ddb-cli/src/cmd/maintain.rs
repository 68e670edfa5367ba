use std::time::Duration;

use ddb_core::app::maintenance::{run_once, MaintenanceReport, MaintenanceTask};
use ddb_core::Engine;

use crate::dispatch::CliResult;
use crate::format::format_bytes;
use crate::signal::{install_signal_handlers, wait_for_shutdown};

pub(crate) fn run_maintain(engine: &Engine, once: bool) -> CliResult {
    if once {
        print_report(&run_once(engine)?);
        return Ok(());
    }

    install_signal_handlers();
    let task = MaintenanceTask::spawn(engine.clone())?;
    tracing::info!(
        interval = %engine.config().resync.interval,
        "maintenance running; press Ctrl-C to stop"
    );
    wait_for_shutdown(Duration::from_millis(500));
    tracing::info!("shutdown signal received, waiting for the current tick");
    task.stop();
    Ok(())
}

fn print_report(report: &MaintenanceReport) {
    for resync in &report.resyncs {
        println!(
            "Resynced {} (attempt {}): {} added, {} dropped",
            resync.store, resync.attempt, resync.added, resync.dropped
        );
    }
    println!(
        "Pruning: {} job(s) aged, {} volume(s) aged, {} purged, {} freed",
        report.prune.jobs_aged,
        report.prune.volumes_aged,
        report.prune.volumes_purged,
        format_bytes(report.prune.bytes_freed)
    );
}
