//! Command-line interface definitions using clap.

use clap::{Parser, Subcommand};
use procpool::logging::LogFormat;
use std::path::PathBuf;

/// Run units of work on a pool of worker subprocesses.
#[derive(Parser, Debug)]
#[command(name = "procpool")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output (-v for debug, -vv for trace).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress all output except errors.
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Log output format (pretty, compact, json).
    #[arg(long, global = true, value_name = "FORMAT")]
    pub log_format: Option<LogFormat>,

    /// Also write logs to this file (rotated daily).
    #[arg(long, global = true, value_name = "PATH")]
    pub log_file: Option<PathBuf>,

    /// Disable colored output.
    #[arg(long, global = true, env = "NO_COLOR")]
    pub no_color: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start a pool, run a batch of sleep tasks on it, and report how they were spread.
    Run(RunArgs),
}

/// Arguments for the run command.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Number of worker processes (default: available parallelism).
    #[arg(short, long, env = "PROCPOOL_WORKERS")]
    pub workers: Option<usize>,

    /// Number of sleep tasks to schedule.
    #[arg(short, long, default_value_t = 8)]
    pub tasks: usize,

    /// How long each sleep task takes, in milliseconds.
    #[arg(long, default_value_t = 50)]
    pub sleep_ms: u64,

    /// Number of failing tasks to schedule after the sleep tasks.
    #[arg(long, default_value_t = 0)]
    pub fail: usize,

    /// Also broadcast one no-op task to every worker.
    #[arg(long)]
    pub broadcast: bool,

    /// Add this many workers before scheduling.
    #[arg(long, default_value_t = 0)]
    pub expand: usize,

    /// Remove this many workers from the tail before scheduling.
    #[arg(long, default_value_t = 0)]
    pub shrink: usize,

    /// Shutdown timeout in milliseconds; workers still running after it are killed.
    #[arg(long, value_name = "MILLIS")]
    pub timeout: Option<u64>,

    /// Print the report as JSON.
    #[arg(long)]
    pub json: bool,
}
