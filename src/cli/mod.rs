pub mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Upper bound for `events --days`.
const MAX_DAYS: i64 = 36_500;

#[derive(Parser)]
#[command(name = "almanac")]
#[command(about = "Keeps a local cache of events from remote iCalendar feeds", long_about = None)]
pub struct Cli {
    /// Config file (default: ~/.config/almanac/config.toml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Synchronize one source, or all of them
    Refresh {
        /// Source id, or "all"
        #[arg(default_value = "all")]
        source: String,

        /// Give up after this many seconds and keep the cached data
        #[arg(short, long)]
        deadline: Option<u64>,
    },
    /// List cached events
    Events {
        /// Days from now to include
        #[arg(short, long, default_value_t = 7, value_parser = clap::value_parser!(u32).range(1..=MAX_DAYS))]
        days: u32,

        /// Include cancelled events
        #[arg(long)]
        cancelled: bool,
    },
    /// Show per-source sync health
    Status,
    /// Delete expired events
    Cleanup,
    /// Show recent sync runs
    Runs {
        #[arg(short, long, default_value_t = 10)]
        limit: usize,
    },
}
