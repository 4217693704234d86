use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "bridge", version, about = "Database-to-cloud sync agent", disable_help_subcommand = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    #[command(flatten)]
    pub logging: LoggingArgs,

    /// Override the `.bridge` base directory (also supports BRIDGE_BASE_DIR).
    #[arg(long, env = "BRIDGE_BASE_DIR", global = true)]
    pub base_dir: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run one or more mapping syncs.
    Sync(SyncArgs),
    /// Print aggregate state for every known mapping.
    Status(StatusArgs),
}

#[derive(Debug, Args, Clone)]
#[command(group(clap::ArgGroup::new("selection").required(true).args(["all", "mapping"])))]
pub struct SyncArgs {
    /// Sync every mapping under config/mappings.
    #[arg(long)]
    pub all: bool,

    /// Sync one or more specific mappings by name (`<source>.<table>`).
    #[arg(long = "mapping", num_args = 1..)]
    pub mapping: Vec<String>,

    /// Run selected mappings concurrently (bounded by --workers).
    #[arg(long, conflicts_with = "sequential")]
    pub parallel: bool,

    /// Run selected mappings one at a time (default).
    #[arg(long, conflicts_with = "parallel")]
    pub sequential: bool,

    /// Write JSONL files but skip the upload and watermark advance steps.
    #[arg(long)]
    pub dry_run: bool,

    /// Ignore the stored watermark and re-extract from scratch for this run.
    #[arg(long)]
    pub force: bool,

    /// Concurrency cap for --parallel (default: 4).
    #[arg(long, default_value_t = 4)]
    pub workers: usize,

    /// Override each mapping's configured batch_size for this run.
    #[arg(long)]
    pub batch_size: Option<u32>,

    /// Print aggregate status after the sync completes.
    #[arg(long)]
    pub status: bool,
}

#[derive(Debug, Args, Clone)]
pub struct StatusArgs {
    /// Output JSON instead of human-readable text.
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Args, Clone)]
pub struct LoggingArgs {
    /// Logging filter (same syntax as RUST_LOG), e.g. `info`, `bridge=debug`.
    ///
    /// When not set, bridge defaults to a conservative `info` filter.
    #[arg(long, env = "BRIDGE_LOG")]
    pub log: Option<String>,

    /// Optional log file path. When set, logs are written to both console and file.
    #[arg(long, env = "BRIDGE_LOG_FILE")]
    pub log_file: Option<PathBuf>,
}
