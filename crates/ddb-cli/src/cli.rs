use clap::{Parser, Subcommand, ValueEnum};

use ddb_core::commands::dv2::{Dv2Mode, Dv2Speed};

#[derive(Parser)]
#[command(
    name = "ddbctl",
    version,
    about = "Operate a deduplication store: backups, reconstruction, retention",
    after_help = "\
Configuration file lookup order:
  1. --config <path>             (explicit flag)
  2. $DDB_CONFIG                 (environment variable)
  3. ./ddb.yaml                  (project)
  4. /etc/ddb/config.yaml        (system, Unix only)

Environment variables:
  DDB_CONFIG        Path to configuration file (overrides default search)
  NO_COLOR          Disable colored table output"
)]
pub(crate) struct Cli {
    /// Path to configuration file (overrides DDB_CONFIG and default search)
    #[arg(short, long)]
    pub config: Option<String>,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Provision a new store and its substore index directories
    CreateStore {
        /// Store name
        name: String,

        /// Number of substores (index partitions)
        #[arg(short, long, default_value_t = 1)]
        partitions: usize,
    },

    /// Record a backup job that writes one new volume
    Backup {
        /// Store to back up into
        #[arg(short = 'S', long = "store")]
        store: String,

        /// Volume size (e.g. 500M, 2G)
        #[arg(long)]
        size: String,

        /// Number of chunks in the volume (default: one per 64 KiB)
        #[arg(long)]
        chunks: Option<u64>,

        /// Zero-based substore index to write into
        #[arg(long, default_value_t = 0)]
        substore: usize,
    },

    /// Copy every substore index of a store to the backup directory
    DdbBackup {
        #[arg(short = 'S', long = "store")]
        store: String,
    },

    /// Rebuild the substore indexes of a store from the ledger
    Recon {
        #[arg(short = 'S', long = "store")]
        store: String,

        /// Rebuild from empty instead of from the last DDB backup
        #[arg(long)]
        full: bool,
    },

    /// Continue a reconstruction parked in the pending phase
    ResumeRecon {
        /// Reconstruction job id
        job: u64,
    },

    /// Reconcile the substore indexes of a store with the ledger
    Resync {
        #[arg(short = 'S', long = "store")]
        store: String,
    },

    /// Run a pruning pass (age jobs, then mark, delete and purge volumes)
    Prune {
        /// Only show the aging decision for each backup job of this store
        #[arg(long, value_name = "STORE")]
        list: Option<String>,
    },

    /// Age a finished backup job now, regardless of retention
    DeleteJob {
        /// Backup job id
        job: u64,
    },

    /// Seal a store so it accepts no new volumes
    Seal {
        #[arg(short = 'S', long = "store")]
        store: String,
    },

    /// Enable or extend the WORM window of a store
    Worm {
        #[arg(short = 'S', long = "store")]
        store: String,

        /// Lock duration in days
        #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
        days: u32,
    },

    /// Compact the substore indexes of a store
    Reclaim {
        #[arg(short = 'S', long = "store")]
        store: String,

        /// Also delete stray files from the index directories
        #[arg(long)]
        orphans: bool,
    },

    /// Verify the live volumes of a store
    Dv2 {
        #[arg(short = 'S', long = "store")]
        store: String,

        #[arg(long, value_enum, default_value_t = ModeArg::Full)]
        mode: ModeArg,

        #[arg(long, value_enum, default_value_t = SpeedArg::Quick)]
        speed: SpeedArg,
    },

    /// Show store status
    Status {
        /// Limit output to one store
        #[arg(short = 'S', long = "store")]
        store: Option<String>,
    },

    /// Run resync and pruning periodically in the foreground
    Maintain {
        /// Run a single maintenance tick and exit
        #[arg(long)]
        once: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
pub(crate) enum ModeArg {
    Full,
    Incremental,
}

impl From<ModeArg> for Dv2Mode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Full => Dv2Mode::Full,
            ModeArg::Incremental => Dv2Mode::Incremental,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
pub(crate) enum SpeedArg {
    Quick,
    Thorough,
}

impl From<SpeedArg> for Dv2Speed {
    fn from(speed: SpeedArg) -> Self {
        match speed {
            SpeedArg::Quick => Dv2Speed::Quick,
            SpeedArg::Thorough => Dv2Speed::Thorough,
        }
    }
}

impl Commands {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Self::CreateStore { .. } => "create-store",
            Self::Backup { .. } => "backup",
            Self::DdbBackup { .. } => "ddb-backup",
            Self::Recon { .. } => "recon",
            Self::ResumeRecon { .. } => "resume-recon",
            Self::Resync { .. } => "resync",
            Self::Prune { .. } => "prune",
            Self::DeleteJob { .. } => "delete-job",
            Self::Seal { .. } => "seal",
            Self::Worm { .. } => "worm",
            Self::Reclaim { .. } => "reclaim",
            Self::Dv2 { .. } => "dv2",
            Self::Status { .. } => "status",
            Self::Maintain { .. } => "maintain",
        }
    }
}
