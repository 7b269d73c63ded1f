use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Aggressor side of a trade print
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

/// Trade print from the feed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub timestamp: DateTime<Utc>,
    pub side: Side,
    pub size: u64,
}

/// One price level of a book snapshot, best level first in `DepthUpdate::levels`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DepthLevel {
    pub bid_price: f64,
    pub bid_size: u64,
    pub ask_price: f64,
    pub ask_size: u64,
}

/// Order-book depth snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepthUpdate {
    pub timestamp: DateTime<Utc>,
    pub levels: Vec<DepthLevel>,
}

impl DepthUpdate {
    /// Midpoint of the best bid/ask, if the top level is two-sided
    pub fn mid(&self) -> Option<f64> {
        let top = self.levels.first()?;
        if top.bid_price > 0.0 && top.ask_price > 0.0 {
            Some((top.bid_price + top.ask_price) / 2.0)
        } else {
            None
        }
    }
}

/// Market event consumed by the bar aggregator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Event {
    Trade(Trade),
    DepthUpdate(DepthUpdate),
}

impl Event {
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Event::Trade(t) => t.timestamp,
            Event::DepthUpdate(d) => d.timestamp,
        }
    }
}

/// Fixed-interval summary bar.
///
/// `resting_ask_depth` / `resting_bid_depth` are keyed by tick index
/// (`price / tick_size`, rounded) and hold the depth summed over every
/// snapshot in the interval, not the latest book.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub timestamp: DateTime<Utc>,
    /// Interval index counted from session start
    pub interval: u64,
    pub mid: f64,
    pub bid_depth_avg: f64,
    pub ask_depth_avg: f64,
    pub depth_samples: u64,
    pub buy_volume: u64,
    pub sell_volume: u64,
    pub tick_size: f64,
    pub resting_ask_depth: BTreeMap<i64, u64>,
    pub resting_bid_depth: BTreeMap<i64, u64>,
}

impl Bar {
    /// True once at least one depth snapshot set `mid`
    pub fn has_quote(&self) -> bool {
        self.depth_samples > 0
    }

    /// Resting ask depth as (price, cumulative depth), ascending by price
    pub fn resting_asks(&self) -> impl Iterator<Item = (f64, u64)> + '_ {
        self.resting_ask_depth
            .iter()
            .map(move |(ticks, depth)| (*ticks as f64 * self.tick_size, *depth))
    }

    /// Resting bid depth as (price, cumulative depth), ascending by price
    pub fn resting_bids(&self) -> impl Iterator<Item = (f64, u64)> + '_ {
        self.resting_bid_depth
            .iter()
            .map(move |(ticks, depth)| (*ticks as f64 * self.tick_size, *depth))
    }
}

/// Trade direction of a setup or open position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    /// +1 for long, -1 for short. Multiplying a price by this projects it
    /// into a space where the favorable move is always upward.
    pub fn sign(self) -> f64 {
        match self {
            Direction::Long => 1.0,
            Direction::Short => -1.0,
        }
    }

    pub fn opposite(self) -> Self {
        match self {
            Direction::Long => Direction::Short,
            Direction::Short => Direction::Long,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Long => write!(f, "LONG"),
            Direction::Short => write!(f, "SHORT"),
        }
    }
}
