mod cli;
mod cmd;
mod dispatch;
mod format;
mod signal;
mod table;

use std::process::ExitCode;

use clap::Parser;

use ddb_core::config::{self, EngineConfig};

use cli::{Cli, Commands};
use dispatch::dispatch_command;

fn log_filter(cli: &Cli) -> &'static str {
    match (cli.verbose, &cli.command) {
        // `maintain` without --once runs until signalled; show its ticks.
        (0, Commands::Maintain { once: false }) => "info",
        (0, _) => "warn",
        (1, _) => "info",
        (2, _) => "debug",
        _ => "trace",
    }
}

fn load(cli: &Cli) -> Result<EngineConfig, String> {
    let Some(source) = config::resolve_config_path(cli.config.as_deref()) else {
        let searched: Vec<String> = config::default_config_search_paths()
            .into_iter()
            .map(|(path, level)| format!("  {} ({level})", path.display()))
            .collect();
        return Err(format!(
            "no configuration file found. Searched:\n{}",
            searched.join("\n")
        ));
    };
    tracing::info!(config = %source, "loading configuration");
    config::load_config(source.path()).map_err(|e| e.to_string())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(log_filter(&cli))
        .with_target(false)
        .init();

    let cfg = match load(&cli) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::FAILURE;
        }
    };

    match dispatch_command(&cli.command, &cfg) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {} failed: {e}", cli.command.name());
            ExitCode::FAILURE
        }
    }
}
