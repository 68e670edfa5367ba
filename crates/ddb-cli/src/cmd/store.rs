use ddb_core::commands::store;
use ddb_core::Engine;

use crate::dispatch::{resolve_store, CliResult};
use crate::format::format_opt_time;

pub(crate) fn run_create_store(engine: &Engine, name: &str, partitions: usize) -> CliResult {
    let id = store::create_store(engine, name, partitions)?;
    println!("Created {id} '{name}' with {partitions} substore(s)");
    Ok(())
}

pub(crate) fn run_seal(engine: &Engine, name: &str) -> CliResult {
    let id = resolve_store(engine, name)?;
    store::seal(engine, id)?;
    println!("Sealed {id} '{name}'");
    Ok(())
}

pub(crate) fn run_worm(engine: &Engine, name: &str, days: u32) -> CliResult {
    let id = resolve_store(engine, name)?;
    store::enable_worm(engine, id, days)?;
    let until = engine
        .ledger()
        .read(|t| t.store(id).and_then(|s| s.worm_until));
    println!("WORM lock on '{name}' until {}", format_opt_time(until));
    Ok(())
}
