use ddb_core::commands::reclaim::run_space_reclaim;
use ddb_core::Engine;

use crate::dispatch::{resolve_store, CliResult};
use crate::format::format_bytes;

pub(crate) fn run_reclaim(engine: &Engine, name: &str, orphans: bool) -> CliResult {
    let store = resolve_store(engine, name)?;
    let stats = run_space_reclaim(engine, store, orphans)?;
    println!(
        "Space reclamation of '{name}' complete: {} of {} index entries dropped, {} reclaimed",
        stats.entries_dropped,
        stats.entries_total,
        format_bytes(stats.bytes_reclaimed),
    );
    if orphans {
        println!("  {} orphan file(s) removed", stats.orphans_removed);
    }
    Ok(())
}
