use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use orderflow_signals::session::hours::et_date;
use orderflow_signals::session::{run_live, LiveSettings, RetryPolicy};
use orderflow_signals::sink::{CsvSink, SignalSink, TracingSink};
use orderflow_signals::streams::{front_month_symbol, BookDepth, DatabentoSource};
use orderflow_signals::{logging, StrategyParams};

#[derive(Parser, Debug)]
#[command(author, version, about = "Live order-flow setup signals from Databento MBP data")]
struct Args {
    /// Databento API key
    #[arg(short, long, env = "DATABENTO_API_KEY")]
    api_key: String,

    /// Raw contract symbol (defaults to the front month of --root)
    #[arg(short, long, env = "ORDERFLOW_SYMBOL")]
    symbol: Option<String>,

    /// Contract root used to derive the front month
    #[arg(long, default_value = "NQ")]
    root: String,

    /// Strategy parameters (flat JSON object)
    #[arg(short, long, env = "ORDERFLOW_PARAMS", default_value = "params.json")]
    params: PathBuf,

    /// Book depth to subscribe to
    #[arg(long, value_enum, default_value = "ten")]
    depth: BookDepth,

    /// Seconds between consumer polls
    #[arg(long, default_value = "10")]
    poll_secs: u64,

    /// Append signals to this CSV log
    #[arg(long, default_value = "signals.csv")]
    signals_csv: PathBuf,

    /// Attempts for backfill and feed reconnects
    #[arg(long, default_value = "5")]
    max_attempts: u32,

    /// Start even outside 09:30-16:00 ET
    #[arg(long)]
    ignore_session_hours: bool,

    /// Minutes historical data lags real time; the live feed replays this gap
    #[arg(long, env = "DATABENTO_DATA_DELAY_MINUTES", default_value = "20")]
    history_delay_mins: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    logging::init("orderflow_signals=info,databento=info");

    let args = Args::parse();

    let params = StrategyParams::load(&args.params)
        .with_context(|| format!("Failed to load params from {:?}", args.params))?;

    let symbol = args
        .symbol
        .clone()
        .unwrap_or_else(|| front_month_symbol(&args.root, et_date(Utc::now())));

    info!("Starting order-flow signals");
    info!("Symbol: {} ({:?})", symbol, args.depth);
    info!("Params: {:?}", args.params);
    info!("Signal log: {:?}", args.signals_csv);

    let sinks: Vec<Box<dyn SignalSink>> = vec![
        Box::new(TracingSink),
        Box::new(CsvSink::open(&args.signals_csv)?),
    ];

    let settings = LiveSettings {
        poll_interval: Duration::from_secs(args.poll_secs.max(1)),
        retry: RetryPolicy {
            max_attempts: args.max_attempts,
            ..RetryPolicy::default()
        },
        ignore_session_hours: args.ignore_session_hours,
        history_delay: Duration::from_secs(args.history_delay_mins * 60),
    };

    let source = Arc::new(DatabentoSource::new(args.api_key, symbol, args.depth));
    run_live(source, params, sinks, settings).await
}
