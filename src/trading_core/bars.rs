//! Bar aggregation from trades and depth snapshots
//!
//! Events are bucketed by `floor((ts - session_start) / interval)`. The bucket
//! for the highest interval seen so far is the *open* bar; it closes (and is
//! queued for `drain_completed`) as soon as an event lands in a later
//! interval. Intervals without events produce no bar.
//!
//! The aggregator is shared between the feed task (`ingest`) and the session
//! loop (`drain_completed` / `peek_running`): the open accumulator sits behind
//! one mutex and completed bars travel through an mpsc FIFO, so draining never
//! contends with ingestion for the accumulator lock.

use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

use crate::types::{Bar, DepthUpdate, Event, Side, Trade};

/// Mutable state of the interval currently receiving events
#[derive(Debug, Clone)]
struct BarAccumulator {
    interval: u64,
    timestamp: DateTime<Utc>,
    mid_last: f64,
    bid_sum: u64,
    ask_sum: u64,
    samples: u64,
    buy_volume: u64,
    sell_volume: u64,
    ask_at_price: BTreeMap<i64, u64>,
    bid_at_price: BTreeMap<i64, u64>,
}

impl BarAccumulator {
    fn new(interval: u64, timestamp: DateTime<Utc>) -> Self {
        Self {
            interval,
            timestamp,
            mid_last: 0.0,
            bid_sum: 0,
            ask_sum: 0,
            samples: 0,
            buy_volume: 0,
            sell_volume: 0,
            ask_at_price: BTreeMap::new(),
            bid_at_price: BTreeMap::new(),
        }
    }

    fn add_trade(&mut self, trade: &Trade) {
        match trade.side {
            Side::Buy => self.buy_volume += trade.size,
            Side::Sell => self.sell_volume += trade.size,
        }
    }

    /// Returns false when the snapshot had no two-sided top of book
    fn add_depth(&mut self, update: &DepthUpdate, tick_size: f64) -> bool {
        let Some(mid) = update.mid() else {
            return false;
        };

        // Last write wins within the interval
        self.mid_last = mid;
        self.samples += 1;

        for level in &update.levels {
            self.bid_sum += level.bid_size;
            self.ask_sum += level.ask_size;

            if level.ask_price > 0.0 && level.ask_size > 0 {
                *self
                    .ask_at_price
                    .entry(price_to_ticks(level.ask_price, tick_size))
                    .or_insert(0) += level.ask_size;
            }
            if level.bid_price > 0.0 && level.bid_size > 0 {
                *self
                    .bid_at_price
                    .entry(price_to_ticks(level.bid_price, tick_size))
                    .or_insert(0) += level.bid_size;
            }
        }
        true
    }

    fn to_bar(&self, tick_size: f64) -> Bar {
        let (bid_depth_avg, ask_depth_avg) = if self.samples > 0 {
            (
                self.bid_sum as f64 / self.samples as f64,
                self.ask_sum as f64 / self.samples as f64,
            )
        } else {
            (0.0, 0.0)
        };

        Bar {
            timestamp: self.timestamp,
            interval: self.interval,
            mid: self.mid_last,
            bid_depth_avg,
            ask_depth_avg,
            depth_samples: self.samples,
            buy_volume: self.buy_volume,
            sell_volume: self.sell_volume,
            tick_size,
            resting_ask_depth: self.ask_at_price.clone(),
            resting_bid_depth: self.bid_at_price.clone(),
        }
    }
}

/// Round a price to the nearest tick and return the tick index
pub fn price_to_ticks(price: f64, tick_size: f64) -> i64 {
    (price / tick_size).round() as i64
}

/// What happened to an ingested event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Folded into the open bar; `closed` bars were queued as a side effect
    Accepted { closed: usize },
    /// Timestamp before session start
    BeforeSession,
    /// Interval already closed
    Late,
    /// Depth snapshot without a two-sided top of book
    NoQuote,
    /// Too far past session start to index
    OutOfRange,
}

#[derive(Debug, Default)]
struct OpenInterval {
    current: Option<BarAccumulator>,
}

/// Thread-safe, single-writer bar aggregator
pub struct BarAggregator {
    session_start: DateTime<Utc>,
    interval: Duration,
    tick_size: f64,
    open: Mutex<OpenInterval>,
    completed_tx: Sender<Bar>,
    completed_rx: Mutex<Receiver<Bar>>,
    late_events: AtomicU64,
}

impl BarAggregator {
    /// `interval` must be positive; callers take it from validated params.
    pub fn new(session_start: DateTime<Utc>, interval: Duration, tick_size: f64) -> Self {
        let (completed_tx, completed_rx) = mpsc::channel();
        Self {
            session_start,
            interval,
            tick_size,
            open: Mutex::new(OpenInterval::default()),
            completed_tx,
            completed_rx: Mutex::new(completed_rx),
            late_events: AtomicU64::new(0),
        }
    }

    /// Start of the given interval, `None` if it is not representable
    pub fn interval_start(&self, index: u64) -> Option<DateTime<Utc>> {
        let offset = self
            .interval
            .num_nanoseconds()?
            .checked_mul(i64::try_from(index).ok()?)?;
        self.session_start
            .checked_add_signed(Duration::nanoseconds(offset))
    }

    /// Interval index for a timestamp at or after session start. `None` when
    /// the elapsed time does not fit in nanoseconds.
    pub fn interval_index(&self, ts: DateTime<Utc>) -> Option<u64> {
        let elapsed = (ts - self.session_start).num_nanoseconds()?;
        let interval = self.interval.num_nanoseconds()?;
        if elapsed < 0 || interval <= 0 {
            return None;
        }
        u64::try_from(elapsed / interval).ok()
    }

    /// Number of events dropped because their interval had already closed
    pub fn late_events(&self) -> u64 {
        self.late_events.load(Ordering::Relaxed)
    }

    fn lock_open(&self) -> MutexGuard<'_, OpenInterval> {
        // A panic while holding the lock cannot leave the accumulator half
        // written in a way later events would misread, so keep going.
        self.open.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Fold one event into its bar
    pub fn ingest(&self, event: &Event) -> IngestOutcome {
        let ts = event.timestamp();
        if ts < self.session_start {
            return IngestOutcome::BeforeSession;
        }
        let Some((index, start)) = self
            .interval_index(ts)
            .and_then(|index| Some((index, self.interval_start(index)?)))
        else {
            debug!(%ts, "dropping event outside the representable session range");
            return IngestOutcome::OutOfRange;
        };

        let mut open = self.lock_open();
        let mut closed = 0;

        match open.current.as_ref().map(|acc| acc.interval) {
            Some(current) if index < current => {
                self.late_events.fetch_add(1, Ordering::Relaxed);
                debug!(index, current, "dropping event for closed interval");
                return IngestOutcome::Late;
            }
            Some(current) if index > current => {
                if let Some(done) = open.current.take() {
                    self.emit(done);
                    closed += 1;
                }
            }
            _ => {}
        }

        let acc = open
            .current
            .get_or_insert_with(|| BarAccumulator::new(index, start));

        match event {
            Event::Trade(trade) => acc.add_trade(trade),
            Event::DepthUpdate(update) => {
                if !acc.add_depth(update, self.tick_size) {
                    return IngestOutcome::NoQuote;
                }
            }
        }

        IngestOutcome::Accepted { closed }
    }

    fn emit(&self, acc: BarAccumulator) {
        let bar = acc.to_bar(self.tick_size);
        debug!(
            interval = bar.interval,
            mid = bar.mid,
            buy = bar.buy_volume,
            sell = bar.sell_volume,
            "bar closed"
        );
        // The receiver lives as long as self, so the send cannot fail
        let _ = self.completed_tx.send(bar);
    }

    /// Close the open interval. Used at the end of a complete historical log;
    /// a live feed never calls this mid-session.
    pub fn flush(&self) -> bool {
        let mut open = self.lock_open();
        match open.current.take() {
            Some(acc) => {
                self.emit(acc);
                true
            }
            None => false,
        }
    }

    /// Take every bar closed since the last call, oldest first. Never blocks
    /// on the feed.
    pub fn drain_completed(&self) -> Vec<Bar> {
        let rx = self
            .completed_rx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        rx.try_iter().collect()
    }

    /// Point-in-time copy of the open bar
    pub fn peek_running(&self) -> Option<Bar> {
        let open = self.lock_open();
        open.current.as_ref().map(|acc| acc.to_bar(self.tick_size))
    }
}

/// Aggregate a complete event log into closed bars (batch mode)
pub fn aggregate_events<'a, I>(
    events: I,
    session_start: DateTime<Utc>,
    interval: Duration,
    tick_size: f64,
) -> Vec<Bar>
where
    I: IntoIterator<Item = &'a Event>,
{
    let aggregator = BarAggregator::new(session_start, interval, tick_size);
    for event in events {
        aggregator.ingest(event);
    }
    aggregator.flush();
    aggregator.drain_completed()
}
