use ddb_core::commands::dv2::{self, Dv2Mode, Dv2Speed};
use ddb_core::Engine;

use crate::dispatch::{resolve_store, CliResult};

pub(crate) fn run_dv2(engine: &Engine, name: &str, mode: Dv2Mode, speed: Dv2Speed) -> CliResult {
    let store = resolve_store(engine, name)?;
    let report = dv2::run_dv2(engine, store, mode, speed)?;
    println!(
        "Verification {} ({mode}, {speed}) of '{name}': {} volume(s) checked, {} skipped, {} chunk(s) verified",
        report.job, report.volumes_checked, report.volumes_skipped, report.chunks_verified,
    );
    if report.is_clean() {
        println!("No problems found");
        return Ok(());
    }
    for issue in &report.issues {
        println!("  {}: {}", issue.volume, issue.message);
    }
    Err(format!("{} problem(s) found", report.issues.len()).into())
}
