//! CLI definitions using clap.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

pub mod commands;

/// ctxhub - multi-tenant context store
#[derive(Parser, Debug)]
#[command(name = "ctxhub", author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Output as JSON
    #[arg(long, global = true)]
    pub json: bool,

    /// Increase logging verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Quiet mode (no logging)
    #[arg(short, long, global = true)]
    pub quiet: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Serve tenant requests as JSON lines on stdin/stdout
    Serve(ServeArgs),

    /// Inspect or change a store's schema version
    Migrate {
        /// Store path (default: ~/.ctxhub/data/context.db)
        #[arg(long, env = "CTXHUB_DB")]
        db: Option<PathBuf>,

        /// Persist pre-migration snapshots to this directory
        #[arg(long)]
        backup_dir: Option<PathBuf>,

        #[command(subcommand)]
        command: MigrateCommands,
    },

    /// Show version information
    Version,
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Parent directory of all tenant stores (default: ~/.ctxhub/tenants)
    #[arg(long, env = "CTXHUB_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Close tenant instances idle for this many seconds
    #[arg(long, default_value_t = 1800)]
    pub idle_timeout_secs: u64,

    /// Seconds between idle sweeps
    #[arg(long, default_value_t = 60)]
    pub sweep_interval_secs: u64,

    /// Persist pre-migration snapshots of tenant stores here
    #[arg(long)]
    pub backup_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum MigrateCommands {
    /// Show applied and pending migrations
    Status,

    /// Apply pending migrations (with backup and validation)
    Up,

    /// Roll back to a target version (with backup and validation)
    Rollback {
        /// Version to roll back to
        target: u32,
    },

    /// Check integrity, foreign keys and expected tables
    Validate,
}
