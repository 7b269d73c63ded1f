use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use orderflow_signals::session::hours::session_bounds;
use orderflow_signals::session::SessionDriver;
use orderflow_signals::sink::{Cadence, SignalEvent, SignalSink, TracingSink};
use orderflow_signals::streams::{
    extract_date_from_filename, find_zst_files, BookDepth, DatabentoSource, EventSource, FileSource,
};
use orderflow_signals::trading_core::{
    aggregate_events, run_backtest, summarize, BacktestReport, BarAggregator, IngestOutcome,
};
use orderflow_signals::{logging, Event, StrategyParams};

#[derive(Parser, Debug)]
#[command(name = "pipeline")]
#[command(about = "Order-flow setup backtests and replays over Databento MBP data")]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// Print verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Backtest every RTH session found in a directory of MBP exports
    Backtest {
        /// Directory containing .zst MBP exports
        #[arg(short, long, default_value = "data")]
        data_dir: PathBuf,

        /// Process only a specific date (YYYYMMDD format)
        #[arg(short = 'D', long)]
        date: Option<String>,

        /// Strategy parameters (flat JSON object)
        #[arg(short, long, default_value = "params.json")]
        params: PathBuf,

        /// Contract root used to pick the front month
        #[arg(long, default_value = "NQ")]
        root: String,

        /// Raw contract symbol; overrides the front-month pick
        #[arg(short, long)]
        symbol: Option<String>,
    },

    /// Fetch one RTH session from Databento and backtest it
    Fetch {
        /// Databento API key
        #[arg(short, long, env = "DATABENTO_API_KEY")]
        api_key: String,

        /// Session date (YYYY-MM-DD)
        #[arg(short = 'D', long)]
        date: NaiveDate,

        /// Raw contract symbol, e.g. NQH6
        #[arg(short, long)]
        symbol: String,

        #[arg(long, value_enum, default_value = "ten")]
        depth: BookDepth,

        #[arg(short, long, default_value = "params.json")]
        params: PathBuf,
    },

    /// Replay one export through the streaming session driver and compare
    /// its bar-close signals with the batch backtest
    Replay {
        /// Path to a single MBP export
        #[arg(short, long)]
        file: PathBuf,

        #[arg(short, long, default_value = "params.json")]
        params: PathBuf,

        #[arg(long, default_value = "NQ")]
        root: String,

        #[arg(short, long)]
        symbol: Option<String>,

        /// Simulated consumer poll interval (event time)
        #[arg(long, default_value = "10")]
        poll_secs: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let args = Args::parse();

    logging::init(if args.verbose {
        "orderflow_signals=debug,pipeline=debug"
    } else {
        "orderflow_signals=info,pipeline=info"
    });

    match args.command {
        Commands::Backtest { data_dir, date, params, root, symbol } => {
            let params = StrategyParams::load(&params)?;
            run_dir_backtest(&data_dir, date.as_deref(), &params, &root, symbol.as_deref())?;
        }
        Commands::Fetch { api_key, date, symbol, depth, params } => {
            let params = StrategyParams::load(&params)?;
            run_fetch(api_key, date, symbol, depth, &params).await?;
        }
        Commands::Replay { file, params, root, symbol, poll_secs } => {
            let params = StrategyParams::load(&params)?;
            run_replay(&file, &params, &root, symbol.as_deref(), poll_secs)?;
        }
    }

    Ok(())
}

#[derive(Debug)]
struct DayResult {
    date: NaiveDate,
    bars: usize,
    report: BacktestReport,
}

/// Events inside `[start, end)`, aggregated and backtested
fn backtest_session(events: &[Event], date: NaiveDate, params: &StrategyParams) -> Result<DayResult> {
    let (start, end) = session_bounds(date)?;
    let session: Vec<&Event> = events
        .iter()
        .filter(|e| e.timestamp() >= start && e.timestamp() < end)
        .collect();

    let bars = aggregate_events(
        session,
        start,
        chrono::Duration::seconds(params.bar_seconds as i64),
        params.tick_size,
    );
    let report = run_backtest(&bars, params);
    Ok(DayResult {
        date,
        bars: bars.len(),
        report,
    })
}

fn print_results(days: &[DayResult]) {
    let mut all_trades = Vec::new();
    for day in days {
        let s = &day.report.summary;
        info!(
            "{}: {} bars, {} trades, {} W / {} L, {:+.2} pts, max DD {:.2}",
            day.date, day.bars, s.trades, s.wins, s.losses, s.total_points, s.max_drawdown_points
        );
        for trade in &day.report.trades {
            debug!(
                "  {} {} @ {:.2} -> {:.2} ({}) {:+.2} pts, MFE {:.2}, MAE {:.2}",
                trade.entry_time.format("%H:%M"),
                trade.direction,
                trade.entry_price,
                trade.exit_price,
                trade.reason,
                trade.pnl_points,
                trade.mfe_points,
                trade.mae_points
            );
        }
        all_trades.extend(day.report.trades.iter().cloned());
    }

    let total = summarize(&all_trades);
    info!("═══════════════════════════════════════");
    info!(
        "TOTAL: {} trades | win rate {:.1}% | {:+.2} pts | max DD {:.2} pts | sharpe {}",
        total.trades,
        total.win_rate(),
        total.total_points,
        total.max_drawdown_points,
        total
            .sharpe
            .map_or_else(|| "n/a".to_string(), |s| format!("{:.2}", s))
    );
}

fn file_source(paths: Vec<PathBuf>, root: &str, symbol: Option<&str>) -> FileSource {
    match symbol {
        Some(symbol) => FileSource::new(paths, root).with_symbol(symbol),
        None => FileSource::new(paths, root),
    }
}

fn run_dir_backtest(
    data_dir: &Path,
    date: Option<&str>,
    params: &StrategyParams,
    root: &str,
    symbol: Option<&str>,
) -> Result<()> {
    info!("=== BACKTEST MODE ===");
    info!("Data directory: {:?}", data_dir);

    let files = find_zst_files(data_dir, date)?;
    info!("Found {} files", files.len());

    let mut days: Vec<DayResult> = files
        .par_iter()
        .map(|path| {
            let date = extract_date_from_filename(path)
                .with_context(|| format!("Failed to extract date from filename: {:?}", path))?;
            let events = file_source(vec![path.clone()], root, symbol).load_all()?;
            backtest_session(&events, date, params)
        })
        .collect::<Result<Vec<_>>>()?;
    days.sort_by_key(|d| d.date);

    print_results(&days);
    Ok(())
}

async fn run_fetch(
    api_key: String,
    date: NaiveDate,
    symbol: String,
    depth: BookDepth,
    params: &StrategyParams,
) -> Result<()> {
    info!("=== FETCH MODE ===");
    let (start, end) = session_bounds(date)?;
    let end = end.min(Utc::now());

    let source = DatabentoSource::new(api_key, symbol, depth);
    let events = source.fetch_range(start, end).await?;
    info!("Fetched {} events for {}", events.len(), source.symbol());

    let day = backtest_session(&events, date, params)?;
    print_results(&[day]);
    Ok(())
}

/// Tees published events into a shared buffer
struct Collect(Arc<std::sync::Mutex<Vec<SignalEvent>>>);

impl SignalSink for Collect {
    fn publish(&mut self, event: &SignalEvent) -> Result<()> {
        self.0
            .lock()
            .map_err(|_| anyhow::anyhow!("signal buffer poisoned"))?
            .push(event.clone());
        Ok(())
    }
}

fn run_replay(
    file: &Path,
    params: &StrategyParams,
    root: &str,
    symbol: Option<&str>,
    poll_secs: i64,
) -> Result<()> {
    info!("=== REPLAY MODE ===");
    let date = extract_date_from_filename(file)
        .with_context(|| format!("Failed to extract date from filename: {:?}", file))?;
    let (start, end) = session_bounds(date)?;
    let events = file_source(vec![file.to_path_buf()], root, symbol).load_all()?;

    let aggregator = Arc::new(BarAggregator::new(
        start,
        chrono::Duration::seconds(params.bar_seconds as i64),
        params.tick_size,
    ));
    let published = Arc::new(std::sync::Mutex::new(Vec::new()));
    let sinks: Vec<Box<dyn SignalSink>> = vec![Box::new(TracingSink), Box::new(Collect(published.clone()))];
    let mut driver = SessionDriver::new(aggregator.clone(), params.clone(), sinks);

    let poll_every = chrono::Duration::seconds(poll_secs.max(1));
    let mut next_poll: Option<DateTime<Utc>> = None;
    for event in events.iter().filter(|e| e.timestamp() < end) {
        let ts = event.timestamp();
        if let IngestOutcome::Accepted { closed } = aggregator.ingest(event) {
            let due = next_poll.is_some_and(|at| ts >= at);
            if closed > 0 || due {
                driver.poll();
                next_poll = Some(ts + poll_every);
            } else if next_poll.is_none() {
                next_poll = Some(ts + poll_every);
            }
        }
    }
    aggregator.flush();
    driver.poll();

    let streamed: Vec<SignalEvent> = published
        .lock()
        .map_err(|_| anyhow::anyhow!("signal buffer poisoned"))?
        .clone();
    let bar_close: Vec<_> = streamed
        .iter()
        .filter(|e| e.cadence == Cadence::BarClose)
        .map(|e| e.decision.clone())
        .collect();
    let running = streamed.len() - bar_close.len();

    let batch = backtest_session(&events, date, params)?;
    info!(
        "{}: {} bars, {} bar-close signals, {} running signals, {} late events",
        date,
        driver.history().len(),
        bar_close.len(),
        running,
        aggregator.late_events()
    );
    if bar_close == batch.report.decisions {
        info!("Bar-close signals match the batch backtest");
    } else {
        warn!(
            streamed = bar_close.len(),
            batch = batch.report.decisions.len(),
            "Bar-close signals differ from the batch backtest"
        );
    }
    Ok(())
}
