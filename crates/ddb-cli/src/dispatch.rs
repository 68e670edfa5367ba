use ddb_core::commands::store::find_store;
use ddb_core::config::EngineConfig;
use ddb_core::Engine;
use ddb_types::StoreId;

use crate::cli::Commands;
use crate::cmd;

/// Ledger file used when the config does not name one.
const DEFAULT_LEDGER_FILE: &str = "ledger.mpk";

pub(crate) type CliResult<T = ()> = Result<T, Box<dyn std::error::Error>>;

/// Open the engine over a persistent ledger. Each CLI invocation is a fresh
/// process, so an in-memory ledger would forget everything on exit.
pub(crate) fn open_engine(config: &EngineConfig) -> CliResult<Engine> {
    let mut config = config.clone();
    if config.paths.ledger.is_none() {
        config.paths.ledger = Some(config.paths.index_root.join(DEFAULT_LEDGER_FILE));
    }
    Ok(Engine::builder(config).open()?)
}

pub(crate) fn resolve_store(engine: &Engine, name: &str) -> CliResult<StoreId> {
    find_store(engine, name).map_err(|e| format!("store '{name}': {e}").into())
}

pub(crate) fn dispatch_command(command: &Commands, config: &EngineConfig) -> CliResult {
    let engine = open_engine(config)?;
    match command {
        Commands::CreateStore { name, partitions } => {
            cmd::store::run_create_store(&engine, name, *partitions)
        }
        Commands::Backup {
            store,
            size,
            chunks,
            substore,
        } => cmd::backup::run_backup(&engine, store, size, *chunks, *substore),
        Commands::DdbBackup { store } => cmd::backup::run_ddb_backup(&engine, store),
        Commands::Recon { store, full } => cmd::recon::run_recon(&engine, store, *full),
        Commands::ResumeRecon { job } => cmd::recon::run_resume(&engine, *job),
        Commands::Resync { store } => cmd::recon::run_resync(&engine, store),
        Commands::Prune { list } => cmd::prune::run_prune(&engine, list.as_deref()),
        Commands::DeleteJob { job } => cmd::prune::run_delete_job(&engine, *job),
        Commands::Seal { store } => cmd::store::run_seal(&engine, store),
        Commands::Worm { store, days } => cmd::store::run_worm(&engine, store, *days),
        Commands::Reclaim { store, orphans } => {
            cmd::reclaim::run_reclaim(&engine, store, *orphans)
        }
        Commands::Dv2 { store, mode, speed } => {
            cmd::dv2::run_dv2(&engine, store, (*mode).into(), (*speed).into())
        }
        Commands::Status { store } => cmd::status::run_status(&engine, store.as_deref()),
        Commands::Maintain { once } => cmd::maintain::run_maintain(&engine, *once),
    }
}
