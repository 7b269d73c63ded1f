use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use databento::{
    dbn::{BidAskPair, Mbp10Msg, Mbp1Msg, RecordRef, SType, Schema, UNDEF_PRICE},
    historical::timeseries::GetRangeParams,
    live::Subscription,
    HistoricalClient, LiveClient,
};
use time::OffsetDateTime;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::{EventCallback, EventSource};
use crate::types::{DepthLevel, DepthUpdate, Event, Side, Trade};

pub const DATASET: &str = "GLBX.MDP3";

/// Book depth to subscribe to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum BookDepth {
    /// MBP-1: top of book
    Top,
    /// MBP-10: ten levels per side
    #[default]
    Ten,
}

impl BookDepth {
    fn schema(self) -> Schema {
        match self {
            BookDepth::Top => Schema::Mbp1,
            BookDepth::Ten => Schema::Mbp10,
        }
    }
}

/// Databento GLBX.MDP3 market-by-price feed for one raw symbol
pub struct DatabentoSource {
    api_key: String,
    symbol: String,
    depth: BookDepth,
}

impl DatabentoSource {
    pub fn new(api_key: impl Into<String>, symbol: impl Into<String>, depth: BookDepth) -> Self {
        Self {
            api_key: api_key.into(),
            symbol: symbol.into(),
            depth,
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }
}

fn to_offset(ts: DateTime<Utc>) -> Result<OffsetDateTime> {
    let nanos = ts
        .timestamp_nanos_opt()
        .with_context(|| format!("Timestamp out of range: {}", ts))?;
    OffsetDateTime::from_unix_timestamp_nanos(nanos as i128)
        .map_err(|e| anyhow::anyhow!("Date conversion error: {}", e))
}

fn fixed_to_price(px: i64) -> f64 {
    if px == UNDEF_PRICE {
        0.0
    } else {
        px as f64 / 1_000_000_000.0
    }
}

fn to_levels(levels: &[BidAskPair]) -> Vec<DepthLevel> {
    levels
        .iter()
        .map(|l| DepthLevel {
            bid_price: fixed_to_price(l.bid_px),
            bid_size: l.bid_sz as u64,
            ask_price: fixed_to_price(l.ask_px),
            ask_size: l.ask_sz as u64,
        })
        .collect()
}

/// Trade prints become trades (side `B` = buy aggressor, anything else
/// counts as selling); every other book record becomes a depth update from
/// its level array. Stamped with the receive time.
fn book_event(ts_recv: u64, action: u8, side: u8, size: u32, levels: &[BidAskPair]) -> Option<Event> {
    let timestamp = DateTime::<Utc>::from_timestamp_nanos(i64::try_from(ts_recv).ok()?);
    if action == b'T' {
        let side = if side == b'B' { Side::Buy } else { Side::Sell };
        return Some(Event::Trade(Trade {
            timestamp,
            side,
            size: size as u64,
        }));
    }
    Some(Event::DepthUpdate(DepthUpdate {
        timestamp,
        levels: to_levels(levels),
    }))
}

fn decode(record: &RecordRef, depth: BookDepth) -> Option<Event> {
    match depth {
        BookDepth::Top => {
            let m = record.get::<Mbp1Msg>()?;
            book_event(m.ts_recv, m.action as u8, m.side as u8, m.size, &m.levels)
        }
        BookDepth::Ten => {
            let m = record.get::<Mbp10Msg>()?;
            book_event(m.ts_recv, m.action as u8, m.side as u8, m.size, &m.levels)
        }
    }
}

#[async_trait]
impl EventSource for DatabentoSource {
    async fn fetch_range(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<Event>> {
        let mut client = HistoricalClient::builder().key(self.api_key.clone())?.build()?;

        info!(symbol = %self.symbol, %start, %end, schema = ?self.depth.schema(), "fetching history");

        let mut decoder = client
            .timeseries()
            .get_range(
                &GetRangeParams::builder()
                    .dataset(DATASET)
                    .date_time_range((to_offset(start)?, to_offset(end)?))
                    .symbols(self.symbol.as_str())
                    .stype_in(SType::RawSymbol)
                    .schema(self.depth.schema())
                    .build(),
            )
            .await
            .context("Failed to fetch from Databento")?;

        let mut events = Vec::new();
        while let Some(record) = decoder.decode_record_ref().await? {
            events.extend(decode(&record, self.depth));
        }

        debug!(events = events.len(), "history decoded");
        Ok(events)
    }

    async fn stream_live(
        &self,
        replay_from: Option<DateTime<Utc>>,
        mut on_event: EventCallback,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        info!("Connecting to Databento...");

        let mut client = LiveClient::builder()
            .key(self.api_key.clone())?
            .dataset(DATASET)
            .build()
            .await
            .context("Failed to connect to Databento")?;

        let mut subscription = Subscription::builder()
            .symbols(vec![self.symbol.clone()])
            .schema(self.depth.schema())
            .stype_in(SType::RawSymbol)
            .build();
        if let Some(from) = replay_from {
            subscription.start = Some(to_offset(from)?);
        }

        client
            .subscribe(subscription)
            .await
            .context("Failed to subscribe")?;
        client.start().await.context("Failed to start stream")?;

        info!(symbol = %self.symbol, replay_from = ?replay_from, "Subscribed");

        while !*shutdown.borrow() {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                record = client.next_record() => {
                    match record.context("Live feed error")? {
                        Some(record) => {
                            if let Some(event) = decode(&record, self.depth) {
                                on_event(event);
                            }
                        }
                        None => {
                            warn!("Databento stream ended");
                            break;
                        }
                    }
                }
            }
        }

        client.close().await.context("Failed to close live client")?;
        info!("Live client closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(bid: f64, ask: f64, bid_sz: u32, ask_sz: u32) -> BidAskPair {
        BidAskPair {
            bid_px: (bid * 1e9) as i64,
            ask_px: (ask * 1e9) as i64,
            bid_sz,
            ask_sz,
            bid_ct: 1,
            ask_ct: 1,
        }
    }

    #[test]
    fn test_trade_side_is_aggressor() {
        let levels = [pair(100.0, 100.25, 5, 5)];
        let buy = book_event(1, b'T', b'B', 3, &levels);
        assert!(matches!(buy, Some(Event::Trade(Trade { side: Side::Buy, size: 3, .. }))));
        let sell = book_event(1, b'T', b'A', 2, &levels);
        assert!(matches!(sell, Some(Event::Trade(Trade { side: Side::Sell, .. }))));
        let unknown = book_event(1, b'T', b'N', 2, &levels);
        assert!(matches!(unknown, Some(Event::Trade(Trade { side: Side::Sell, size: 2, .. }))));
    }

    #[test]
    fn test_book_record_becomes_depth_update() {
        let mut empty = pair(0.0, 0.0, 0, 0);
        empty.bid_px = UNDEF_PRICE;
        empty.ask_px = UNDEF_PRICE;
        let levels = [pair(100.0, 100.25, 5, 7), empty];

        let Some(Event::DepthUpdate(update)) = book_event(1_000, b'A', b'B', 1, &levels) else {
            panic!("expected depth update");
        };
        assert_eq!(update.levels.len(), 2);
        assert_eq!(update.levels[0].ask_size, 7);
        assert_eq!(update.levels[1].bid_price, 0.0);
        assert_eq!(update.mid(), Some(100.125));
        assert_eq!(update.timestamp.timestamp_nanos_opt(), Some(1_000));
    }

    #[test]
    fn test_unrepresentable_receive_time_is_dropped() {
        let levels = [pair(100.0, 100.25, 5, 5)];
        assert!(book_event(u64::MAX, b'T', b'B', 1, &levels).is_none());
    }
}
