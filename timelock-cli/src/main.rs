//! TimeLock CLI — run, scan, data checks and the stdio detector server.
//!
//! Commands:
//! - `run` — scan every instrument-session of a TOML run config and export artifacts
//! - `scan` — one instrument-session, printed for debugging
//! - `check-data` — data-quality report for a directory of CSV bars
//! - `detector` — serve a built-in detector over stdin/stdout

use anyhow::{bail, Context, Result};
use chrono::{Duration, NaiveDate, TimeZone, Utc};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::EnvFilter;

use timelock_core::detectors::create_detector;
use timelock_core::domain::{SessionKey, Timeframe};
use timelock_core::harness::DetectorServer;
use timelock_core::quality::{check_series, QualityConfig};
use timelock_core::store::{BarStore, CsvBarStore, MemoryBarStore, SyntheticConfig, SyntheticSessions};
use timelock_runner::{build_harness, export_run, Orchestrator, RunConfig, RunResult, SessionStatus};

#[derive(Parser)]
#[command(name = "timelock", about = "TimeLock — lookahead-free signal backtesting")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every instrument-session in a TOML config and export the results.
    Run {
        /// Path to the run config.
        #[arg(long)]
        config: PathBuf,

        /// Directory of `<INSTRUMENT>.csv` bar files.
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Use generated sessions instead of real data.
        #[arg(long, default_value_t = false)]
        synthetic: bool,

        /// Override `orchestrator.workers`.
        #[arg(long)]
        workers: Option<usize>,

        /// Output directory for run.json, signals.jsonl and trades.csv.
        #[arg(long, default_value = "results")]
        output_dir: PathBuf,
    },
    /// Scan a single instrument-session and print what the detector saw.
    Scan {
        /// Path to the run config (detector, snapshot and execution settings).
        #[arg(long)]
        config: PathBuf,

        /// Instrument to scan.
        #[arg(long)]
        instrument: String,

        /// Session date (YYYY-MM-DD).
        #[arg(long)]
        date: String,

        /// Directory of `<INSTRUMENT>.csv` bar files.
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Use generated sessions instead of real data.
        #[arg(long, default_value_t = false)]
        synthetic: bool,

        /// How many session bars to print.
        #[arg(long, default_value_t = 5)]
        bars: usize,
    },
    /// Report data-quality warnings for a directory of CSV bars.
    CheckData {
        /// Directory of `<INSTRUMENT>.csv` bar files.
        #[arg(long)]
        data_dir: PathBuf,

        /// Bar timeframe: 1m, 5m, 15m, 30m, 1h or 1d.
        #[arg(long, default_value = "5m")]
        timeframe: String,

        /// Exchange offset from UTC in minutes.
        #[arg(long, default_value_t = -300, allow_hyphen_values = true)]
        utc_offset_minutes: i32,

        /// Keep pre/post-market bars.
        #[arg(long, default_value_t = false)]
        include_extended_hours: bool,

        /// Opening gaps at least this large (percent) are reported.
        #[arg(long, default_value_t = 0.5)]
        gap_threshold_pct: f64,
    },
    /// Serve a built-in detector on stdin/stdout (one JSON message per line).
    Detector {
        /// Built-in detector name.
        #[arg(long)]
        name: String,
    },
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config, data_dir, synthetic, workers, output_dir } => {
            run_cmd(&config, data_dir.as_deref(), synthetic, workers, &output_dir)
        }
        Commands::Scan { config, instrument, date, data_dir, synthetic, bars } => {
            scan_cmd(&config, &instrument, &date, data_dir.as_deref(), synthetic, bars)
        }
        Commands::CheckData { data_dir, timeframe, utc_offset_minutes, include_extended_hours, gap_threshold_pct } => {
            check_data_cmd(&data_dir, &timeframe, utc_offset_minutes, include_extended_hours, gap_threshold_pct)
        }
        Commands::Detector { name } => detector_cmd(&name),
    }
}

/// Logs go to stderr; stdout belongs to command output and the detector protocol.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("timelock=info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn load_config(path: &Path) -> Result<RunConfig> {
    RunConfig::load(path).with_context(|| format!("loading run config {}", path.display()))
}

fn open_store(config: &RunConfig, data_dir: Option<&Path>, synthetic: bool) -> Result<Box<dyn BarStore>> {
    match (data_dir, synthetic) {
        (Some(_), true) => bail!("--data-dir and --synthetic are mutually exclusive"),
        (None, false) => bail!("one of --data-dir or --synthetic is required"),
        (Some(dir), false) => {
            let store = CsvBarStore::open(dir, config.run.timeframe)
                .with_context(|| format!("opening bar directory {}", dir.display()))?;
            Ok(Box::new(store))
        }
        (None, true) => {
            let generator = SyntheticSessions::new(SyntheticConfig {
                timeframe: config.run.timeframe,
                utc_offset: config.utc_offset(),
                ..Default::default()
            });
            // Weekends eat into the lookback, so reach a little further back.
            let from = config.run.start - Duration::days(i64::from(config.snapshot.warmup_lookback_days) + 3);
            let bars = config
                .run
                .universe
                .iter()
                .chain(&config.run.references)
                .flat_map(|inst| generator.generate(inst, from, config.run.end));
            Ok(Box::new(MemoryBarStore::from_bars(bars)?))
        }
    }
}

fn run_cmd(
    config_path: &Path,
    data_dir: Option<&Path>,
    synthetic: bool,
    workers: Option<usize>,
    output_dir: &Path,
) -> Result<()> {
    let mut config = load_config(config_path)?;
    if let Some(workers) = workers {
        config.orchestrator.workers = workers;
    }
    let store = open_store(&config, data_dir, synthetic)?;
    let harness = build_harness(&config)?;

    let result = Orchestrator::new(&config, store.as_ref(), &harness)?.run()?;
    harness.shutdown();

    print_summary(&result);

    let run_dir = output_dir.join(&result.metadata.run_id[..12]);
    let paths = export_run(&result, &run_dir)?;
    info!(
        dir = %run_dir.display(),
        signals = result.signals.len(),
        trades = result.trades.len(),
        "artifacts exported"
    );
    println!("Artifacts saved to: {}", run_dir.display());
    println!("  {}", paths.run_json.display());
    println!("  {}", paths.signals_jsonl.display());
    println!("  {}", paths.trades_csv.display());

    if result.metadata.suspect {
        bail!("run is suspect: at least one session aborted on a data integrity violation");
    }
    Ok(())
}

fn scan_cmd(
    config_path: &Path,
    instrument: &str,
    date: &str,
    data_dir: Option<&Path>,
    synthetic: bool,
    show_bars: usize,
) -> Result<()> {
    let date = NaiveDate::parse_from_str(date, "%Y-%m-%d").with_context(|| format!("invalid date '{date}'"))?;
    let mut config = load_config(config_path)?;
    config.run.universe = vec![instrument.to_string()];
    config.run.start = date;
    config.run.end = date;

    let store = open_store(&config, data_dir, synthetic)?;
    let harness = build_harness(&config)?;
    let key = SessionKey::new(instrument, date);
    let outcome = Orchestrator::new(&config, store.as_ref(), &harness)?.run_session(&key);
    harness.shutdown();

    let report = &outcome.report;
    println!();
    println!("=== Scan {key} ===");
    println!("Detector:       {}", harness.detector_id());
    println!("Status:         {}", status_line(&report.status));
    println!("Bars scanned:   {}", report.bars_scanned);
    println!("Discarded:      {}", report.discarded_signals);
    println!("Errors:         {}", report.detection_errors);
    for failure in &outcome.failures {
        println!("  {} [{}] {}", failure.timestamp, failure.reason, failure.message);
    }

    match &outcome.signal {
        Some(signal) => {
            println!("Signal:         {:?} at {} (price {:.4})", signal.side, signal.timestamp, signal.price);
            for (name, value) in &signal.metrics {
                println!("  {name}: {value}");
            }
        }
        None => println!("Signal:         none"),
    }
    if let Some(trade) = &outcome.trade {
        println!(
            "Trade:          {:.4} -> {:.4} ({}, {:+.2}%, {} bars)",
            trade.entry_price,
            trade.exit_price,
            trade.exit_reason.as_str(),
            trade.pnl_pct,
            trade.bars_held
        );
    }
    if let Some(no_trade) = &outcome.no_trade {
        println!("No trade:       {:?}", no_trade.reason);
    }

    for warning in &report.warnings {
        println!("WARNING: {warning}");
    }

    let offset = config.utc_offset();
    let Some(start) = offset.from_local_datetime(&date.and_time(chrono::NaiveTime::MIN)).single() else {
        bail!("local midnight of {date} is ambiguous at offset {offset}");
    };
    let start = start.with_timezone(&Utc);
    let bars = store.range_query(instrument, config.run.timeframe, start, start + Duration::days(1))?;
    if !bars.is_empty() {
        println!();
        println!("{:<26} {:>10} {:>10} {:>10} {:>10} {:>10}", "Timestamp", "Open", "High", "Low", "Close", "Volume");
        for bar in bars.iter().take(show_bars) {
            println!(
                "{:<26} {:>10.4} {:>10.4} {:>10.4} {:>10.4} {:>10}",
                bar.timestamp.to_rfc3339(),
                bar.open,
                bar.high,
                bar.low,
                bar.close,
                bar.volume
            );
        }
        if bars.len() > show_bars {
            println!("... {} more", bars.len() - show_bars);
        }
    }
    println!();
    Ok(())
}

fn check_data_cmd(
    data_dir: &Path,
    timeframe: &str,
    utc_offset_minutes: i32,
    include_extended: bool,
    gap_threshold_pct: f64,
) -> Result<()> {
    let Some(timeframe) = Timeframe::parse(timeframe) else {
        bail!("unknown timeframe '{timeframe}'. Valid: 1m, 5m, 15m, 30m, 1h, 1d");
    };
    let Some(offset) = chrono::FixedOffset::east_opt(utc_offset_minutes * 60) else {
        bail!("utc offset out of range: {utc_offset_minutes} minutes");
    };
    let store = CsvBarStore::open(data_dir, timeframe)
        .with_context(|| format!("opening bar directory {}", data_dir.display()))?;
    let cfg = QualityConfig { gap_threshold_pct };

    let instruments = store.instruments();
    if instruments.is_empty() {
        println!("No CSV files in {}", data_dir.display());
        return Ok(());
    }

    let mut total_warnings = 0usize;
    println!("{:<8} {:>9} {:>9} {:>9}", "Symbol", "Sessions", "Bars", "Warnings");
    println!("{}", "-".repeat(38));
    let mut details = Vec::new();
    for instrument in &instruments {
        let Some(series) = store.as_memory().series(instrument, timeframe) else {
            continue;
        };
        let report = check_series(series, offset, include_extended, &cfg);
        let bars: usize = report.iter().map(|s| s.bars).sum();
        let warnings: usize = report.iter().map(|s| s.warnings.len()).sum();
        total_warnings += warnings;
        println!("{:<8} {:>9} {:>9} {:>9}", instrument, report.len(), bars, warnings);
        for session in report.into_iter().filter(|s| !s.warnings.is_empty()) {
            for warning in session.warnings {
                details.push(format!("{instrument} {}: {warning}", session.date));
            }
        }
    }

    if !details.is_empty() {
        println!();
        for line in &details {
            println!("WARNING: {line}");
        }
    }
    println!();
    println!("{} instrument(s), {total_warnings} warning(s)", instruments.len());
    Ok(())
}

fn detector_cmd(name: &str) -> Result<()> {
    let detector = create_detector(name)?;
    let mut server = DetectorServer::new(detector);
    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    server.serve(stdin.lock(), stdout.lock()).context("detector server I/O")?;
    Ok(())
}

fn status_line(status: &SessionStatus) -> String {
    match status {
        SessionStatus::Skipped { reason } | SessionStatus::Aborted { reason } | SessionStatus::Failed { reason } => {
            format!("{} ({reason})", status.label())
        }
        other => other.label().to_string(),
    }
}

fn print_summary(result: &RunResult) {
    let summary = result.summary();
    let meta = &result.metadata;
    println!();
    println!("=== Run {} ===", &meta.run_id[..12]);
    println!("Detector:       {}", meta.detector_id);
    println!("Policy:         {}", meta.policy);
    println!("Period:         {} to {}", meta.start, meta.end);
    println!("Universe:       {}", meta.universe.join(", "));
    println!("Duration:       {} ms", meta.duration_ms);
    println!();
    println!("--- Sessions ({}) ---", summary.sessions);
    for (status, count) in &summary.by_status {
        println!("{:<16}{count}", format!("{status}:"));
    }
    println!();
    println!("--- Outcomes ---");
    println!("Signals:        {}", summary.signals);
    println!("Trades:         {}", summary.trades);
    println!("No trade:       {}", summary.no_trades);
    for (reason, count) in &summary.by_exit_reason {
        println!("  {:<14}{count}", format!("{reason}:"));
    }
    println!();
    println!("Detection failures: {}", summary.detection_failures);
    for (reason, count) in &summary.failures_by_reason {
        println!("  {:<14}{count}", format!("{reason}:"));
    }
    println!(
        "Units:          {} spawned, {} reused, {} discarded",
        result.pool.spawned, result.pool.reused, result.pool.discarded
    );
    if meta.suspect {
        println!();
        println!("WARNING: run is SUSPECT (data integrity violation in at least one session)");
    }
    if meta.interrupted {
        println!("WARNING: run was interrupted; some sessions were abandoned");
    }
    println!();
}
