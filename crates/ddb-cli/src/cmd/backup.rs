use ddb_core::commands::backup::begin_backup;
use ddb_core::commands::ddb_backup;
use ddb_core::commands::store::substores_of;
use ddb_core::Engine;

use crate::dispatch::{resolve_store, CliResult};
use crate::format::{format_bytes, parse_size};

const CHUNK_SIZE: u64 = 64 * 1024;

pub(crate) fn run_backup(
    engine: &Engine,
    name: &str,
    size: &str,
    chunks: Option<u64>,
    substore: usize,
) -> CliResult {
    let store = resolve_store(engine, name)?;
    let bytes = parse_size(size)?;
    let chunks = chunks.unwrap_or_else(|| bytes.div_ceil(CHUNK_SIZE).max(1));
    let substores = substores_of(engine, store)?;
    let Some(&target) = substores.get(substore) else {
        return Err(format!(
            "store '{name}' has {} substore(s); index {substore} is out of range",
            substores.len()
        )
        .into());
    };

    let mut session = begin_backup(engine, store)?;
    let volume = session.write_volume(target, bytes, chunks)?;
    let job = session.commit()?;
    println!(
        "Backup {job} wrote {volume} ({}, {chunks} chunks) into {target}",
        format_bytes(bytes)
    );
    Ok(())
}

pub(crate) fn run_ddb_backup(engine: &Engine, name: &str) -> CliResult {
    let store = resolve_store(engine, name)?;
    let report = ddb_backup::run_ddb_backup(engine, store)?;
    for snap in &report.snapshots {
        println!(
            "  {}: {} file(s), {}",
            snap.substore,
            snap.files,
            format_bytes(snap.bytes)
        );
    }
    println!(
        "DDB backup {} of '{name}' complete: {} substore(s), {}",
        report.job,
        report.snapshots.len(),
        format_bytes(report.bytes_copied())
    );
    Ok(())
}
