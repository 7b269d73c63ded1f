//! Databento CSV exports (MBP-1 / MBP-10, optionally zstd-compressed)
//! replayed as an event source for offline runs

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Datelike, NaiveDate, Utc, Weekday};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use tokio::sync::watch;
use tracing::{debug, info};

use super::{EventCallback, EventSource};
use crate::types::{DepthLevel, DepthUpdate, Event, Side, Trade};

/// Front-month contract for a quarterly CME root on a given date.
///
/// The next March/June/September/December contract, rolling to the
/// following quarter from the second Friday of the contract month onward.
pub fn front_month_symbol(root: &str, date: NaiveDate) -> String {
    let mut year = date.year();
    let mut month = (date.month() - 1) / 3 * 3 + 3;

    let roll = NaiveDate::from_weekday_of_month_opt(year, month, Weekday::Fri, 2);
    if date.month() == month && roll.is_some_and(|roll| date >= roll) {
        month += 3;
        if month > 12 {
            month = 3;
            year += 1;
        }
    }

    let code = match month {
        3 => 'H',
        6 => 'M',
        9 => 'U',
        _ => 'Z',
    };
    format!("{}{}{}", root, code, year.rem_euclid(10))
}

/// Extract date from a filename like "glbx-mdp3-20250103.mbp-10.csv.zst"
pub fn extract_date_from_filename(path: &Path) -> Option<NaiveDate> {
    let filename = path.file_name()?.to_string_lossy();

    for part in filename.split(&['-', '.'][..]) {
        if part.len() == 8 && part.chars().all(|c| c.is_ascii_digit()) {
            return NaiveDate::parse_from_str(part, "%Y%m%d").ok();
        }
    }
    None
}

/// Find all .zst files in directory, optionally filtered by date
pub fn find_zst_files(data_dir: &Path, date_filter: Option<&str>) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();

    for entry in std::fs::read_dir(data_dir)
        .with_context(|| format!("Failed to read directory: {:?}", data_dir))?
    {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == "zst") {
            if let Some(filter) = date_filter {
                let matches = path
                    .file_name()
                    .is_some_and(|name| name.to_string_lossy().contains(filter));
                if !matches {
                    continue;
                }
            }
            files.push(path);
        }
    }

    files.sort();
    Ok(files)
}

/// Column positions resolved from the CSV header
struct Columns {
    /// `ts_recv` when exported, else `ts_event`
    timestamp: usize,
    action: usize,
    side: usize,
    size: usize,
    symbol: Option<usize>,
    /// `(bid_px, bid_sz, ask_px, ask_sz)` per level, best first
    levels: Vec<(usize, usize, usize, usize)>,
}

impl Columns {
    fn from_headers(headers: &csv::StringRecord) -> Result<Self> {
        let find = |name: &str| headers.iter().position(|h| h == name);
        let require = |name: &str| find(name).with_context(|| format!("Missing CSV column: {}", name));

        let mut levels = Vec::new();
        for i in 0.. {
            let level = (
                find(&format!("bid_px_{:02}", i)),
                find(&format!("bid_sz_{:02}", i)),
                find(&format!("ask_px_{:02}", i)),
                find(&format!("ask_sz_{:02}", i)),
            );
            match level {
                (Some(bp), Some(bs), Some(ap), Some(a_s)) => levels.push((bp, bs, ap, a_s)),
                _ => break,
            }
        }

        Ok(Self {
            timestamp: match find("ts_recv") {
                Some(i) => i,
                None => require("ts_event")?,
            },
            action: require("action")?,
            side: require("side")?,
            size: require("size")?,
            symbol: find("symbol"),
            levels,
        })
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    if let Ok(nanos) = raw.parse::<i64>() {
        return Ok(DateTime::<Utc>::from_timestamp_nanos(nanos));
    }
    Ok(DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("Failed to parse timestamp: {}", raw))?
        .with_timezone(&Utc))
}

/// Undefined prices and sizes are exported as empty fields
fn parse_or_zero<T: std::str::FromStr + Default>(raw: &str) -> T {
    raw.parse().unwrap_or_default()
}

fn parse_row(row: &csv::StringRecord, cols: &Columns) -> Result<Option<Event>> {
    let field = |i: usize| row.get(i).unwrap_or("");
    let timestamp = parse_timestamp(field(cols.timestamp))?;

    if field(cols.action) == "T" {
        let side = if field(cols.side) == "B" { Side::Buy } else { Side::Sell };
        return Ok(Some(Event::Trade(Trade {
            timestamp,
            side,
            size: parse_or_zero(field(cols.size)),
        })));
    }

    if cols.levels.is_empty() {
        return Ok(None);
    }
    let levels = cols
        .levels
        .iter()
        .map(|&(bp, bs, ap, a_s)| DepthLevel {
            bid_price: parse_or_zero(field(bp)),
            bid_size: parse_or_zero(field(bs)),
            ask_price: parse_or_zero(field(ap)),
            ask_size: parse_or_zero(field(a_s)),
        })
        .collect();
    Ok(Some(Event::DepthUpdate(DepthUpdate { timestamp, levels })))
}

/// Parse one MBP export into events for `symbol`, in file order
pub fn parse_mbp_file(path: &Path, symbol: &str) -> Result<Vec<Event>> {
    let file = File::open(path).with_context(|| format!("Failed to open file: {:?}", path))?;

    let reader: Box<dyn Read> = if path.extension().is_some_and(|ext| ext == "zst") {
        Box::new(
            zstd::stream::Decoder::new(file)
                .with_context(|| format!("Failed to create zstd decoder for: {:?}", path))?,
        )
    } else {
        Box::new(file)
    };

    let mut csv_reader = csv::Reader::from_reader(BufReader::new(reader));
    let cols = Columns::from_headers(csv_reader.headers().context("Failed to read CSV header")?)?;

    let mut events = Vec::new();
    let mut skipped_other_symbols = 0u64;

    for result in csv_reader.records() {
        let row = result.context("Failed to parse CSV row")?;

        if let Some(i) = cols.symbol {
            if row.get(i) != Some(symbol) {
                skipped_other_symbols += 1;
                continue;
            }
        }
        if let Some(event) = parse_row(&row, &cols)? {
            events.push(event);
        }
    }

    if skipped_other_symbols > 0 {
        debug!(skipped_other_symbols, "Skipped rows from other contracts");
    }
    Ok(events)
}

/// Replays Databento exports from disk
pub struct FileSource {
    paths: Vec<PathBuf>,
    root: String,
    symbol: Option<String>,
}

impl FileSource {
    /// Rows are filtered to the front-month contract of `root` for each file's
    /// date unless an explicit symbol is set.
    pub fn new(paths: Vec<PathBuf>, root: impl Into<String>) -> Self {
        Self {
            paths,
            root: root.into(),
            symbol: None,
        }
    }

    pub fn with_symbol(mut self, symbol: impl Into<String>) -> Self {
        self.symbol = Some(symbol.into());
        self
    }

    fn symbol_for(&self, path: &Path) -> Result<String> {
        if let Some(symbol) = &self.symbol {
            return Ok(symbol.clone());
        }
        let date = extract_date_from_filename(path)
            .with_context(|| format!("Failed to extract date from filename: {:?}", path))?;
        Ok(front_month_symbol(&self.root, date))
    }

    /// Every event in every file, stably sorted by timestamp
    pub fn load_all(&self) -> Result<Vec<Event>> {
        let mut events = Vec::new();
        for path in &self.paths {
            let symbol = self.symbol_for(path)?;
            let parsed = parse_mbp_file(path, &symbol)?;
            info!(file = ?path, %symbol, events = parsed.len(), "loaded");
            events.extend(parsed);
        }
        events.sort_by_key(|e| e.timestamp());
        Ok(events)
    }
}

#[async_trait]
impl EventSource for FileSource {
    async fn fetch_range(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<Event>> {
        let mut events = self.load_all()?;
        events.retain(|e| e.timestamp() >= start && e.timestamp() < end);
        Ok(events)
    }

    /// Replays the files as fast as the consumer allows
    async fn stream_live(
        &self,
        replay_from: Option<DateTime<Utc>>,
        mut on_event: EventCallback,
        shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let mut events = self.load_all()?;
        if let Some(from) = replay_from {
            events.retain(|e| e.timestamp() >= from);
        }
        for (i, event) in events.into_iter().enumerate() {
            if *shutdown.borrow() {
                break;
            }
            on_event(event);
            if i % 1024 == 1023 {
                tokio::task::yield_now().await;
            }
        }
        info!("File replay finished");
        Ok(())
    }
}
