//! Streaming vs batch: the bar-close cadence of the session driver must emit
//! exactly the decisions a batch backtest produces over the same event log,
//! however the consumer's polls interleave with the producer.

use chrono::{DateTime, Duration, TimeZone, Utc};
use proptest::prelude::*;
use std::sync::Arc;
use std::thread;

use orderflow_signals::session::SessionDriver;
use orderflow_signals::sink::{Cadence, SignalEvent};
use orderflow_signals::trading_core::{aggregate_events, run_backtest, BarAggregator, Decision, Signal};
use orderflow_signals::{DepthLevel, DepthUpdate, Direction, Event, Side, StrategyParams, Trade};

fn session_start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 5, 14, 30, 0).unwrap()
}

fn params() -> StrategyParams {
    StrategyParams {
        passive_lookback_bars: 60,
        min_passive_accumulation_count: 3,
        passive_cob_threshold: 50.0,
        key_level_points: 0.25,
        bos_swing_lookback: 2,
        bos_min_break_ticks: 2,
        bounce_bars: 3,
        bos_search_bars: 120,
        aggressive_min_volume: 150,
        aggressive_window_seconds: 60,
        ..StrategyParams::default()
    }
}

fn depth(minute: i64, mid: f64, bid_size: u64) -> Event {
    Event::DepthUpdate(DepthUpdate {
        timestamp: session_start() + Duration::seconds(minute * 60 + 1),
        levels: vec![DepthLevel {
            bid_price: mid - 0.125,
            bid_size,
            ask_price: mid + 0.125,
            ask_size: 1,
        }],
    })
}

fn trade(minute: i64, second: i64, side: Side, size: u64) -> Event {
    Event::Trade(Trade {
        timestamp: session_start() + Duration::seconds(minute * 60 + second),
        side,
        size,
    })
}

/// Bid accumulation around 100, a retest, a bounce, an aggressive break at
/// minute 70 and a stop-out at minute 71.
fn scenario_events() -> Vec<Event> {
    let mut events = Vec::new();
    for minute in 0..60 {
        let mid = if minute % 2 == 0 { 100.0 } else { 100.5 };
        events.push(depth(minute, mid, 60));
        events.push(trade(minute, 20, Side::Buy, 2));
        events.push(trade(minute, 20, Side::Sell, 2));
    }
    let tail = [100.0, 99.8, 100.4, 100.7, 101.0, 100.5, 100.5, 100.5, 100.5, 100.5];
    for (i, mid) in tail.into_iter().enumerate() {
        events.push(depth(60 + i as i64, mid, 0));
    }
    events.push(depth(70, 102.0, 0));
    events.push(trade(70, 10, Side::Buy, 120));
    events.push(trade(70, 30, Side::Sell, 50));
    events.push(trade(70, 45, Side::Buy, 80));
    events.push(depth(71, 95.0, 0));
    events
}

fn batch_decisions(events: &[Event], params: &StrategyParams) -> Vec<Decision> {
    let bars = aggregate_events(events, session_start(), Duration::seconds(60), 0.25);
    run_backtest(&bars, params).decisions
}

fn bar_close(events: Vec<SignalEvent>) -> Vec<Decision> {
    events
        .into_iter()
        .filter(|e| e.cadence == Cadence::BarClose)
        .map(|e| e.decision)
        .collect()
}

fn aggregator() -> Arc<BarAggregator> {
    Arc::new(BarAggregator::new(session_start(), Duration::seconds(60), 0.25))
}

#[test]
fn test_batch_scenario_enters_and_stops_out() {
    let decisions = batch_decisions(&scenario_events(), &params());
    assert_eq!(decisions.len(), 2);

    assert_eq!(decisions[0].bar_index, 70);
    assert_eq!(decisions[0].signal, Signal::EnterLong);
    assert_eq!(decisions[0].direction, Direction::Long);

    assert_eq!(decisions[1].bar_index, 71);
    assert!(!decisions[1].signal.is_entry());
    assert!(decisions[1].pnl_points.unwrap() < 0.0);
}

#[test]
fn test_polling_after_every_event_matches_batch() {
    let events = scenario_events();
    let params = params();

    let agg = aggregator();
    let mut driver = SessionDriver::new(agg.clone(), params.clone(), vec![]);
    let mut published = Vec::new();
    for event in &events {
        agg.ingest(event);
        published.extend(driver.poll());
    }
    agg.flush();
    published.extend(driver.poll());

    assert_eq!(bar_close(published), batch_decisions(&events, &params));
}

#[test]
fn test_warm_up_then_stream_matches_batch() {
    let events = scenario_events();
    let params = params();
    let (backfill, live) = events.split_at(150);

    let agg = aggregator();
    for event in backfill {
        agg.ingest(event);
    }
    let mut driver = SessionDriver::new(agg.clone(), params.clone(), vec![]);
    driver.warm_up();

    let mut published = Vec::new();
    for event in live {
        agg.ingest(event);
        published.extend(driver.poll());
    }
    agg.flush();
    published.extend(driver.poll());

    // Warm-up signals are not published, and the break happens after it
    assert_eq!(bar_close(published), batch_decisions(&events, &params));
}

#[test]
fn test_concurrent_producer_matches_batch() {
    let events = scenario_events();
    let params = params();

    let agg = aggregator();
    let producer = {
        let agg = agg.clone();
        let events = events.clone();
        thread::spawn(move || {
            for event in &events {
                agg.ingest(event);
            }
        })
    };

    let mut driver = SessionDriver::new(agg.clone(), params.clone(), vec![]);
    let mut published = Vec::new();
    while !producer.is_finished() {
        published.extend(driver.poll());
        thread::yield_now();
    }
    producer.join().unwrap();
    agg.flush();
    published.extend(driver.poll());

    assert_eq!(bar_close(published), batch_decisions(&events, &params));
}

proptest! {
    /// Any poll schedule yields the batch decisions on the bar-close cadence.
    #[test]
    fn poll_schedule_does_not_change_bar_close_signals(
        polls in prop::collection::vec(prop::bool::weighted(0.2), 190..200)
    ) {
        let events = scenario_events();
        let params = params();

        let agg = aggregator();
        let mut driver = SessionDriver::new(agg.clone(), params.clone(), vec![]);
        let mut published = Vec::new();
        for (i, event) in events.iter().enumerate() {
            agg.ingest(event);
            if polls.get(i).copied().unwrap_or(false) {
                published.extend(driver.poll());
            }
        }
        agg.flush();
        published.extend(driver.poll());

        prop_assert_eq!(bar_close(published), batch_decisions(&events, &params));
    }
}
