//! Signal sinks: where decisions go once the detector emits them

use anyhow::{Context, Result};
use chrono_tz::America::New_York;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::path::Path;
use tracing::info;

use crate::trading_core::{Decision, Signal};

/// Which evaluation stream produced a signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cadence {
    /// Completed bars only; decisions at interval close
    BarClose,
    /// Completed bars plus the running bar; decisions intra-interval
    Running,
}

impl std::fmt::Display for Cadence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Cadence::BarClose => write!(f, "bar_close"),
            Cadence::Running => write!(f, "running"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalEvent {
    pub cadence: Cadence,
    pub decision: Decision,
}

/// Receives signals for notification or persistence
pub trait SignalSink: Send {
    fn publish(&mut self, event: &SignalEvent) -> Result<()>;
}

/// Collects events in memory
impl SignalSink for Vec<SignalEvent> {
    fn publish(&mut self, event: &SignalEvent) -> Result<()> {
        self.push(event.clone());
        Ok(())
    }
}

/// One log line per signal
#[derive(Debug, Default)]
pub struct TracingSink;

impl SignalSink for TracingSink {
    fn publish(&mut self, event: &SignalEvent) -> Result<()> {
        let d = &event.decision;
        match d.signal {
            Signal::Exit(reason) => info!(
                cadence = %event.cadence,
                bar = d.bar_index,
                direction = %d.direction,
                price = d.price,
                entry = d.entry_price,
                pnl_pts = d.pnl_points,
                %reason,
                "EXIT"
            ),
            signal => info!(
                cadence = %event.cadence,
                bar = d.bar_index,
                price = d.price,
                "{}",
                signal
            ),
        }
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct CsvRow {
    date: String,
    time_et: String,
    cadence: Cadence,
    signal: String,
    direction: String,
    price: f64,
    entry_price: Option<f64>,
    pnl_pts: Option<f64>,
    reason: Option<String>,
}

/// Append-only CSV signal log
pub struct CsvSink {
    writer: csv::Writer<File>,
}

impl CsvSink {
    /// Open (or create) the log; the header is written only to an empty file
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open signal log: {:?}", path))?;
        let is_empty = file
            .metadata()
            .with_context(|| format!("Failed to stat signal log: {:?}", path))?
            .len()
            == 0;

        let writer = csv::WriterBuilder::new()
            .has_headers(is_empty)
            .from_writer(file);
        Ok(Self { writer })
    }
}

impl SignalSink for CsvSink {
    fn publish(&mut self, event: &SignalEvent) -> Result<()> {
        let d = &event.decision;
        let et = d.timestamp.with_timezone(&New_York);
        let reason = match d.signal {
            Signal::Exit(reason) => Some(reason.to_string()),
            _ => None,
        };

        self.writer
            .serialize(CsvRow {
                date: et.format("%Y-%m-%d").to_string(),
                time_et: et.format("%H:%M:%S").to_string(),
                cadence: event.cadence,
                signal: d.signal.to_string(),
                direction: d.direction.to_string(),
                price: d.price,
                entry_price: d.entry_price,
                pnl_pts: d.pnl_points,
                reason,
            })
            .context("Failed to write signal row")?;
        self.writer.flush().context("Failed to flush signal log")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trading_core::ExitReason;
    use crate::types::Direction;
    use chrono::{TimeZone, Utc};

    fn event(signal: Signal, price: f64) -> SignalEvent {
        SignalEvent {
            cadence: Cadence::BarClose,
            decision: Decision {
                bar_index: 70,
                timestamp: Utc.with_ymd_and_hms(2026, 1, 5, 15, 40, 0).unwrap(),
                signal,
                direction: Direction::Long,
                price,
                entry_price: matches!(signal, Signal::Exit(_)).then_some(100.0),
                pnl_points: matches!(signal, Signal::Exit(_)).then_some(price - 100.0),
            },
        }
    }

    #[test]
    fn test_csv_sink_writes_header_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("signals.csv");

        {
            let mut sink = CsvSink::open(&path).unwrap();
            sink.publish(&event(Signal::EnterLong, 100.0)).unwrap();
        }
        {
            let mut sink = CsvSink::open(&path).unwrap();
            sink.publish(&event(Signal::Exit(ExitReason::Target), 110.0)).unwrap();
        }

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(
            lines[0],
            "date,time_et,cadence,signal,direction,price,entry_price,pnl_pts,reason"
        );
        assert_eq!(lines[1], "2026-01-05,10:40:00,bar_close,ENTER_LONG,LONG,100.0,,,");
        assert_eq!(lines[2], "2026-01-05,10:40:00,bar_close,EXIT,LONG,110.0,100.0,10.0,target");
    }

    #[test]
    fn test_vec_sink_collects() {
        let mut sink: Vec<SignalEvent> = Vec::new();
        sink.publish(&event(Signal::EnterLong, 100.0)).unwrap();
        assert_eq!(sink.len(), 1);
        assert_eq!(sink[0].decision.bar_index, 70);
    }
}
