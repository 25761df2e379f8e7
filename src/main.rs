//! seismoalarm - seismic feed ingestion and regional alarm evaluation.
//!
//! Ingests the KOERI recent-earthquake listing into SQLite, deduplicating by
//! fingerprint, and classifies activity per region as NORMAL, ORANGE or RED.

use std::io::{self, Write};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use clap::Parser;
use tracing::{error, info, warn};

mod aggregate;
mod cli;
mod client;
mod cluster;
mod config;
mod errors;
mod geo;
mod models;
mod normalize;
mod output;
mod pipeline;
mod rules;
mod server;
mod store;

use cli::{Cli, Command};
use client::{FeedClient, FeedSource};
use config::Config;
use models::{AlarmResult, Severity};
use store::EventStore;

/// Lower bound for polling the feed.
const MIN_POLL_INTERVAL_SECS: u64 = 30;

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    init_tracing(cli.verbose, cli.quiet);

    let config = load_config(&cli)?;

    match cli.command {
        Command::Run(args) => cmd_run(&config, args),
        Command::Evaluate(args) => cmd_evaluate(&config, args),
        Command::Watch(args) => cmd_watch(&config, args),
        Command::Serve(args) => cmd_serve(config, args),
        Command::Recent(args) => cmd_recent(&config, args),
        Command::Check(args) => cmd_check(&config, args),
    }
}

/// Initialize tracing subscriber.
fn init_tracing(verbose: bool, quiet: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = if quiet {
        EnvFilter::new("error")
    } else if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();
}

/// Load and validate configuration, then apply CLI overrides.
fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::load(path).with_context(|| format!("failed to load {}", path.display()))?,
        None => {
            let config = Config::default();
            config.validate().context("built-in configuration is invalid")?;
            config
        }
    };
    if let Some(db) = &cli.db {
        config.db_path.clone_from(db);
    }
    Ok(config)
}

fn open_store(config: &Config) -> Result<EventStore> {
    EventStore::open(&config.db_path).with_context(|| format!("failed to open store {}", config.db_path.display()))
}

fn feed_source(config: &Config, feed: cli::FeedArgs) -> Result<FeedSource> {
    let url = feed.url.as_deref().unwrap_or(&config.feed_url);
    FeedSource::from_args(feed.input, url).context("failed to create feed client")
}

/// Ingest one snapshot from `source`, then evaluate.
fn ingest_and_evaluate(
    config: &Config,
    store: &mut EventStore,
    source: &FeedSource,
) -> Result<(pipeline::IngestReport, Vec<AlarmResult>)> {
    let rows = source
        .rows()
        .with_context(|| format!("failed to read feed from {}", source.describe()))?;
    let normalizer = config.normalizer()?;

    let report = pipeline::ingest(
        store,
        &normalizer,
        rows.iter().map(String::as_str),
        config.storage_capacity_max_rows,
    )
    .context("ingestion failed")?;

    let results = pipeline::evaluate(store, config, Utc::now()).context("evaluation failed")?;
    Ok((report, results))
}

/// Execute the `run` command - one ingestion and evaluation pass.
fn cmd_run(config: &Config, args: cli::RunArgs) -> Result<()> {
    let source = feed_source(config, args.feed)?;
    let mut store = open_store(config)?;

    let (report, results) = ingest_and_evaluate(config, &mut store, &source)?;

    if args.only_on_change && report.inserted == 0 && !results.iter().any(AlarmResult::is_alarm) {
        info!("no new events and no alarms, nothing to report");
        return Ok(());
    }

    let stdout = io::stdout();
    let mut handle = stdout.lock();
    output::write_results(&mut handle, &results, args.format)?;
    Ok(())
}

/// Execute the `evaluate` command - evaluate the store as it is.
fn cmd_evaluate(config: &Config, args: cli::EvaluateArgs) -> Result<()> {
    let store = open_store(config)?;
    let results = pipeline::evaluate(&store, config, Utc::now()).context("evaluation failed")?;

    let stdout = io::stdout();
    let mut handle = stdout.lock();
    output::write_results(&mut handle, &results, args.format)?;
    Ok(())
}

/// Execute the `watch` command - ingest and evaluate on a timer.
fn cmd_watch(config: &Config, args: cli::WatchArgs) -> Result<()> {
    let poll_interval = args.poll_interval.max(MIN_POLL_INTERVAL_SECS);
    if poll_interval != args.poll_interval {
        warn!("poll interval clamped to minimum of {MIN_POLL_INTERVAL_SECS} seconds");
    }

    let source = feed_source(config, args.feed)?;
    if matches!(source, FeedSource::Stdin) {
        bail!("watch cannot poll stdin; use --input FILE or a URL");
    }
    let mut store = open_store(config)?;

    info!("watching {} (poll every {poll_interval}s)", source.describe());

    let mut previous: Option<Vec<Severity>> = None;
    loop {
        match ingest_and_evaluate(config, &mut store, &source) {
            Ok((report, results)) => {
                let levels: Vec<Severity> = results.iter().map(|r| r.level).collect();
                let changed = previous.as_ref() != Some(&levels);
                if changed || report.inserted > 0 {
                    if let Err(e) = emit_results(&mut io::stdout().lock(), &results, args.format) {
                        warn!("failed to write results: {e}");
                    }
                }
                previous = Some(levels);
            }
            Err(e) => warn!("cycle failed, will retry: {e:#}"),
        }

        std::thread::sleep(Duration::from_secs(poll_interval));
    }
}

/// Write results and flush, so a long-running loop shows them immediately.
fn emit_results<W: Write>(writer: &mut W, results: &[AlarmResult], format: output::Format) -> io::Result<()> {
    output::write_results(writer, results, format)?;
    writer.flush()
}

/// Execute the `serve` command - timer-driven ingestion plus HTTP API.
fn cmd_serve(config: Config, args: cli::ServeArgs) -> Result<()> {
    let poll_interval = args.poll_interval.max(MIN_POLL_INTERVAL_SECS);
    let url = args.url.unwrap_or_else(|| config.feed_url.clone());
    let client = FeedClient::new(url.as_str()).context("failed to create feed client")?;
    let store = open_store(&config)?;

    let server_config = server::ServerConfig {
        port: args.port,
        host: args.host.clone(),
        poll_interval: Duration::from_secs(poll_interval),
    };

    println!("\x1b[1m🌍 seismoalarm\x1b[0m");
    println!("\x1b[2m───────────────────────────────────────\x1b[0m");
    println!("  Local:   \x1b[96mhttp://{}:{}\x1b[0m", args.host, args.port);
    println!("  Feed:    {url}");
    println!("  Poll:    {poll_interval}s");
    println!("  Regions: {}", config.regions.len());
    println!("\x1b[2m───────────────────────────────────────\x1b[0m");

    tokio::runtime::Runtime::new()
        .context("failed to create tokio runtime")?
        .block_on(server::run_server(config, client, server_config, store))
}

/// Execute the `recent` command - newest stored events.
fn cmd_recent(config: &Config, args: cli::RecentArgs) -> Result<()> {
    let store = open_store(config)?;

    let stdout = io::stdout();
    let mut handle = stdout.lock();

    match args.radius {
        Some(radius) => {
            let events: Vec<_> = store
                .query_recent(config.storage_capacity_max_rows)?
                .into_iter()
                .filter(|e| radius.contains(e.latitude, e.longitude))
                .take(args.limit)
                .collect();
            let center = (radius.center_lat, radius.center_lon);
            output::write_nearby_events(&mut handle, &events, center, args.format)?;
        }
        None => output::write_events(&mut handle, &store.query_recent(args.limit)?, args.format)?,
    }
    Ok(())
}

/// Execute the `check` command - reconcile the feed with the store.
fn cmd_check(config: &Config, args: cli::FeedArgs) -> Result<()> {
    let source = feed_source(config, args)?;
    let store = open_store(config)?;
    let rows = source
        .rows()
        .with_context(|| format!("failed to read feed from {}", source.describe()))?;

    let rec = pipeline::reconcile(&store, &config.normalizer()?, rows.iter().map(String::as_str), 5)?;
    if rec.missing() != 0 {
        warn!("store differs from feed by {} rows for {:?}", rec.missing(), rec.day);
    }

    let stdout = io::stdout();
    let mut handle = stdout.lock();
    output::write_reconciliation(&mut handle, &rec)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    /// Accepts writes, fails on flush.
    struct StuckWriter(Vec<u8>);

    impl Write for StuckWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "closed"))
        }
    }

    #[test]
    fn test_emit_results_reports_flush_error() {
        let t = Utc.with_ymd_and_hms(2025, 11, 20, 12, 0, 0).unwrap();
        let results = [AlarmResult::quiet("bandirma", 70.0, t)];

        let mut ok = Vec::new();
        emit_results(&mut ok, &results, output::Format::Ndjson).unwrap();
        assert!(!ok.is_empty());

        let mut stuck = StuckWriter(Vec::new());
        let err = emit_results(&mut stuck, &results, output::Format::Ndjson).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        assert!(!stuck.0.is_empty());
    }
}
