//! Command-line interface definitions.
//!
//! Uses clap derive API for argument parsing.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::geo::RadiusFilter;
use crate::output::Format;

/// Seismic feed ingestion and regional alarm evaluation.
#[derive(Parser, Debug)]
#[command(name = "seismoalarm")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Command to run
    #[command(subcommand)]
    pub command: Command,

    /// Enable verbose debug logging
    #[arg(long, global = true)]
    pub verbose: bool,

    /// Suppress all output except errors
    #[arg(long, global = true)]
    pub quiet: bool,

    /// YAML configuration file (built-in defaults when absent)
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    /// SQLite database path (overrides the configuration)
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,
}

/// Available commands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Ingest one feed snapshot, then evaluate every region
    Run(RunArgs),

    /// Evaluate the stored events without ingesting
    Evaluate(EvaluateArgs),

    /// Ingest and evaluate repeatedly
    Watch(WatchArgs),

    /// Run the timer-driven service with an HTTP read API
    Serve(ServeArgs),

    /// Show the most recent stored events
    Recent(RecentArgs),

    /// Compare the feed's newest day with the store
    Check(FeedArgs),
}

/// Where to read the feed from.
#[derive(Args, Debug, Clone)]
pub struct FeedArgs {
    /// Read a saved listing from a file (`-` for stdin) instead of fetching
    #[arg(long, short = 'i')]
    pub input: Option<PathBuf>,

    /// Feed URL (overrides the configuration)
    #[arg(long)]
    pub url: Option<String>,
}

/// Arguments for the `run` command.
#[derive(Args, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub feed: FeedArgs,

    /// Output format
    #[arg(long, short = 'f', default_value = "human", value_parser = parse_format)]
    pub format: Format,

    /// Print nothing unless new events arrived or a region is above NORMAL
    #[arg(long)]
    pub only_on_change: bool,
}

/// Arguments for the `evaluate` command.
#[derive(Args, Debug)]
pub struct EvaluateArgs {
    /// Output format
    #[arg(long, short = 'f', default_value = "human", value_parser = parse_format)]
    pub format: Format,
}

/// Arguments for the `watch` command.
#[derive(Args, Debug)]
pub struct WatchArgs {
    #[command(flatten)]
    pub feed: FeedArgs,

    /// Poll interval in seconds (minimum 30)
    #[arg(long, default_value = "60")]
    pub poll_interval: u64,

    /// Output format
    #[arg(long, short = 'f', default_value = "human", value_parser = parse_format)]
    pub format: Format,
}

/// Arguments for the `serve` command.
#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Port to listen on
    #[arg(long, short = 'p', default_value = "8080")]
    pub port: u16,

    /// Host to bind to
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    /// Poll interval in seconds (minimum 30)
    #[arg(long, default_value = "60")]
    pub poll_interval: u64,

    /// Feed URL (overrides the configuration)
    #[arg(long)]
    pub url: Option<String>,
}

/// Arguments for the `recent` command.
#[derive(Args, Debug)]
pub struct RecentArgs {
    /// Maximum number of events to show
    #[arg(long, short = 'n', default_value = "20")]
    pub limit: usize,

    /// Radius filter: lat,lon,radius_km
    #[arg(long, value_parser = parse_radius)]
    pub radius: Option<RadiusFilter>,

    /// Output format
    #[arg(long, short = 'f', default_value = "human", value_parser = parse_format)]
    pub format: Format,
}

/// Parse an output format from string.
fn parse_format(s: &str) -> Result<Format, String> {
    s.parse()
}

/// Parse a radius filter from string.
fn parse_radius(s: &str) -> Result<RadiusFilter, String> {
    s.parse()
}
