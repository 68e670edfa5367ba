use ddb_core::commands::prune;
use ddb_core::prune::AgingDecision;
use ddb_core::Engine;
use ddb_types::JobId;

use crate::dispatch::{resolve_store, CliResult};
use crate::format::{format_bytes, format_time};

pub(crate) fn run_prune(engine: &Engine, list: Option<&str>) -> CliResult {
    if let Some(name) = list {
        let store = resolve_store(engine, name)?;
        for entry in prune::preview_aging(engine, store)? {
            let started = format_time(entry.started_at);
            match entry.decision {
                AgingDecision::Age { reason } => {
                    println!("{:<6} {}  {started}  [{reason:?}]", "age", entry.job)
                }
                AgingDecision::Keep { reasons } => println!(
                    "{:<6} {}  {started}  [{}]",
                    "keep",
                    entry.job,
                    reasons.join(", ")
                ),
            }
        }
        return Ok(());
    }

    let stats = prune::run_pruning(engine)?;
    println!(
        "Aged {} job(s); {} volume(s) marked, {} aged, {} purged; {} freed",
        stats.jobs_aged,
        stats.volumes_marked,
        stats.volumes_aged,
        stats.volumes_purged,
        format_bytes(stats.bytes_freed),
    );
    if stats.stores_sealed > 0 {
        println!("  {} store(s) sealed at end of lifetime", stats.stores_sealed);
    }
    if stats.stores_macro_pruned > 0 {
        println!("  {} sealed store(s) removed", stats.stores_macro_pruned);
    }
    if stats.worm_deferred > 0 {
        println!(
            "  {} store(s) skipped: WORM lock still active",
            stats.worm_deferred
        );
    }
    if stats.resync_deferred > 0 {
        println!(
            "  {} store(s) skipped: waiting for resync",
            stats.resync_deferred
        );
    }
    Ok(())
}

pub(crate) fn run_delete_job(engine: &Engine, job: u64) -> CliResult {
    let job = JobId(job);
    prune::delete_job(engine, job)?;
    println!("Deleted {job}; its volumes are released on the next prune");
    Ok(())
}
