use ddb_core::commands::recon::{self, ReconReport};
use ddb_core::commands::resync;
use ddb_core::ledger::model::{MaintenanceReason, ReconPhase};
use ddb_core::Engine;
use ddb_types::JobId;

use crate::dispatch::{resolve_store, CliResult};

pub(crate) fn run_recon(engine: &Engine, name: &str, full: bool) -> CliResult {
    let store = resolve_store(engine, name)?;
    let report = recon::run_recon(engine, store, full)?;
    print_report(&report);
    Ok(())
}

pub(crate) fn run_resume(engine: &Engine, job: u64) -> CliResult {
    let report = recon::resume_recon(engine, JobId(job))?;
    print_report(&report);
    Ok(())
}

pub(crate) fn run_resync(engine: &Engine, name: &str) -> CliResult {
    let store = resolve_store(engine, name)?;
    let report = resync::run_resync(engine, store, MaintenanceReason::Operator)?;
    println!(
        "Resync of '{name}' (attempt {}) complete: {} entries added, {} dropped",
        report.attempt, report.added, report.dropped
    );
    Ok(())
}

fn print_report(report: &ReconReport) {
    let kind = if report.full { "Full" } else { "Regular" };
    match report.phase {
        ReconPhase::Pending => {
            let why = report
                .paused
                .map(|r| format!("{r:?}"))
                .unwrap_or_else(|| "unknown".into());
            println!(
                "{kind} reconstruction {} paused ({why}): {}/{} volumes recovered",
                report.job, report.recovered, report.active_volumes
            );
            println!("Resume with `ddbctl resume-recon {}`", report.job.get());
        }
        phase => println!(
            "{kind} reconstruction {} {phase}: {}/{} volumes recovered, {} resume(s)",
            report.job, report.recovered, report.active_volumes, report.resumes
        ),
    }
}
