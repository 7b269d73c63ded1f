//! Setup detector state machine
//!
//! `step` is a pure transition: bar history up to `k`, params and the previous
//! position state in; a signal and the next state out. Callers own the state
//! value and thread it through successive calls, one value per evaluation
//! stream.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{StrategyParams, MIN_HISTORY_BARS};
use crate::types::{Bar, Direction};

use super::position::{initial_stop, manage, ExitReason, OpenPosition};
use super::setup::{find_entry, EntrySetup};

/// Signal emitted by one detector step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Signal {
    EnterLong,
    EnterShort,
    Exit(ExitReason),
}

impl Signal {
    pub fn is_entry(self) -> bool {
        matches!(self, Signal::EnterLong | Signal::EnterShort)
    }
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Signal::EnterLong => write!(f, "ENTER_LONG"),
            Signal::EnterShort => write!(f, "ENTER_SHORT"),
            Signal::Exit(_) => write!(f, "EXIT"),
        }
    }
}

/// Position state threaded between detector calls
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub enum PositionState {
    #[default]
    Flat,
    Open(OpenPosition),
}

impl PositionState {
    pub fn is_flat(&self) -> bool {
        matches!(self, PositionState::Flat)
    }

    pub fn position(&self) -> Option<&OpenPosition> {
        match self {
            PositionState::Flat => None,
            PositionState::Open(position) => Some(position),
        }
    }
}

/// Result of one detector step
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub signal: Option<Signal>,
    pub state: PositionState,
}

impl Step {
    fn unchanged(state: &PositionState) -> Self {
        Self {
            signal: None,
            state: state.clone(),
        }
    }
}

/// Evaluate bar `k`.
///
/// Only `bars[..=k]` is read. With fewer than `MIN_HISTORY_BARS` bars, `k`
/// out of range, or no quote on bar `k`, the step is a no-op.
pub fn step(bars: &[Bar], k: usize, params: &StrategyParams, state: &PositionState) -> Step {
    if k >= bars.len() {
        return Step::unchanged(state);
    }
    let history = &bars[..=k];
    if history.len() < MIN_HISTORY_BARS || !history[k].has_quote() {
        return Step::unchanged(state);
    }

    match state {
        PositionState::Flat => step_flat(history, k, params),
        PositionState::Open(position) => step_open(history, k, params, position),
    }
}

fn step_flat(history: &[Bar], k: usize, params: &StrategyParams) -> Step {
    if k < params.no_first_minutes || params.lunch_window.contains(k) {
        return Step::unchanged(&PositionState::Flat);
    }

    let setup = find_entry(history, params, Direction::Long)
        .or_else(|| find_entry(history, params, Direction::Short));

    match setup {
        Some(setup) => enter(history, params, setup),
        None => Step::unchanged(&PositionState::Flat),
    }
}

fn enter(history: &[Bar], params: &StrategyParams, setup: EntrySetup) -> Step {
    let (running_low, running_high) = history
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), b| (lo.min(b.mid), hi.max(b.mid)));

    let running_extreme = match setup.direction {
        Direction::Long => running_low,
        Direction::Short => running_high,
    };
    let stop_price = initial_stop(setup.entry_price, running_extreme, setup.direction, params);

    debug!(
        direction = %setup.direction,
        origin = setup.origin_index,
        retest = setup.retest_index,
        level = setup.level,
        entry = setup.entry_price,
        stop = stop_price,
        "setup confirmed"
    );

    let signal = match setup.direction {
        Direction::Long => Signal::EnterLong,
        Direction::Short => Signal::EnterShort,
    };
    Step {
        signal: Some(signal),
        state: PositionState::Open(OpenPosition {
            direction: setup.direction,
            entry_price: setup.entry_price,
            entry_bar_index: setup.entry_index,
            stop_price,
            key_levels_at_entry: vec![running_low, running_high, setup.level],
            running_extreme,
        }),
    }
}

fn step_open(history: &[Bar], k: usize, params: &StrategyParams, position: &OpenPosition) -> Step {
    let (exit, next) = manage(history, params, position);
    match exit {
        Some(reason) => {
            debug!(bar = k, %reason, price = history[k].mid, "exit");
            Step {
                signal: Some(Signal::Exit(reason)),
                state: PositionState::Flat,
            }
        }
        None => Step {
            signal: None,
            state: PositionState::Open(next),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use std::collections::BTreeMap;

    fn bar(i: usize, mid: f64, bid_depth: f64) -> Bar {
        Bar {
            timestamp: Utc.with_ymd_and_hms(2026, 1, 5, 14, 30, 0).unwrap() + Duration::minutes(i as i64),
            interval: i as u64,
            mid,
            bid_depth_avg: bid_depth,
            ask_depth_avg: 0.0,
            depth_samples: 1,
            buy_volume: 0,
            sell_volume: 0,
            tick_size: 0.25,
            resting_ask_depth: BTreeMap::new(),
            resting_bid_depth: BTreeMap::new(),
        }
    }

    fn scenario_params() -> StrategyParams {
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

    /// Accumulation at 100, retest at 99.8, bounce to 101 and a break at 70
    fn scenario_bars() -> Vec<Bar> {
        let mut bars: Vec<Bar> = (0..60)
            .map(|i| bar(i, if i % 2 == 0 { 100.0 } else { 100.5 }, 60.0))
            .collect();
        bars.push(bar(60, 100.0, 0.0));
        bars.push(bar(61, 99.8, 0.0));
        bars.push(bar(62, 100.4, 0.0));
        bars.push(bar(63, 100.7, 0.0));
        bars.push(bar(64, 101.0, 0.0));
        for i in 65..70 {
            bars.push(bar(i, 100.5, 0.0));
        }
        let mut breakout = bar(70, 102.0, 0.0);
        breakout.buy_volume = 200;
        breakout.sell_volume = 50;
        bars.push(breakout);
        bars
    }

    fn run_flat(bars: &[Bar], params: &StrategyParams) -> Vec<(usize, Step)> {
        (0..bars.len())
            .map(|k| (k, step(bars, k, params, &PositionState::Flat)))
            .filter(|(_, s)| s.signal.is_some())
            .collect()
    }

    #[test]
    fn test_scenario_enters_long_exactly_at_breakout() {
        let bars = scenario_bars();
        let params = scenario_params();
        let entries = run_flat(&bars, &params);
        assert_eq!(entries.len(), 1);

        let (k, step) = &entries[0];
        assert_eq!(*k, 70);
        assert_eq!(step.signal, Some(Signal::EnterLong));
        let position = step.state.position().unwrap();
        assert_eq!(position.entry_price, 102.0);
        assert_eq!(position.entry_bar_index, 70);
        assert!((position.stop_price - 97.8).abs() < 1e-9);
        assert_eq!(position.key_levels_at_entry, vec![99.8, 102.0, 100.0]);
        assert_eq!(position.running_extreme, 99.8);
    }

    #[test]
    fn test_scenario_falls_back_when_stop_too_far() {
        let bars = scenario_bars();
        let params = StrategyParams {
            sl_max_pts: 3.5,
            ..scenario_params()
        };
        let step = step(&bars, 70, &params, &PositionState::Flat);
        assert_eq!(step.signal, Some(Signal::EnterLong));
        assert_eq!(step.state.position().unwrap().stop_price, 87.0);
    }

    #[test]
    fn test_future_bars_do_not_change_decisions() {
        let mut bars = scenario_bars();
        let params = scenario_params();
        let truncated = step(&bars, 70, &params, &PositionState::Flat);
        for i in 71..90 {
            bars.push(bar(i, 90.0 + i as f64 * 0.1, 0.0));
        }
        assert_eq!(step(&bars, 70, &params, &PositionState::Flat), truncated);
    }

    #[test]
    fn test_weak_aggression_blocks_entry() {
        let mut bars = scenario_bars();
        bars[70].buy_volume = 100;
        assert!(run_flat(&bars, &scenario_params()).is_empty());
    }

    #[test]
    fn test_session_filters() {
        let bars = scenario_bars();
        let params = StrategyParams {
            no_first_minutes: 71,
            ..scenario_params()
        };
        assert!(run_flat(&bars, &params).is_empty());

        let params = StrategyParams {
            lunch_window: crate::config::LunchWindow::ElevenToOne,
            ..scenario_params()
        };
        // Bar 70 sits before the 11:00 blackout
        assert_eq!(run_flat(&bars, &params).len(), 1);
    }

    #[test]
    fn test_no_op_on_short_history_or_missing_quote() {
        let bars: Vec<Bar> = (0..19).map(|i| bar(i, 100.0, 60.0)).collect();
        let state = PositionState::Flat;
        assert_eq!(step(&bars, 18, &StrategyParams::default(), &state), Step::unchanged(&state));
        assert_eq!(step(&bars, 40, &StrategyParams::default(), &state), Step::unchanged(&state));

        let mut bars = scenario_bars();
        bars[70].depth_samples = 0;
        assert_eq!(step(&bars, 70, &scenario_params(), &state).signal, None);
    }

    #[test]
    fn test_breakeven_lock_then_stop() {
        let params = StrategyParams::default();
        let mut bars: Vec<Bar> = (0..20).map(|i| bar(i, 100.0, 0.0)).collect();
        let state = PositionState::Open(OpenPosition {
            direction: Direction::Long,
            entry_price: 100.0,
            entry_bar_index: 19,
            stop_price: 85.0,
            key_levels_at_entry: vec![100.0, 100.0, 100.0],
            running_extreme: 100.0,
        });

        bars.push(bar(20, 115.1, 0.0));
        let s1 = step(&bars, 20, &params, &state);
        assert_eq!(s1.signal, None);
        assert_eq!(s1.state.position().unwrap().stop_price, 98.0);

        // Above the raised stop: hold
        let mut holding = bars.clone();
        holding.push(bar(21, 98.5, 0.0));
        let s2 = step(&holding, 21, &params, &s1.state);
        assert_eq!(s2.signal, None);

        bars.push(bar(21, 97.9, 0.0));
        let s2 = step(&bars, 21, &params, &s1.state);
        assert_eq!(s2.signal, Some(Signal::Exit(ExitReason::Stop)));
        assert!(s2.state.is_flat());
    }

    #[test]
    fn test_short_mirror_enters_at_breakdown() {
        // Reflect the long scenario around 200: resistance accumulation on
        // the ask at 100, breakdown at bar 70.
        let bars: Vec<Bar> = scenario_bars()
            .into_iter()
            .map(|mut b| {
                b.mid = 200.0 - b.mid;
                b.ask_depth_avg = b.bid_depth_avg;
                b.bid_depth_avg = 0.0;
                std::mem::swap(&mut b.buy_volume, &mut b.sell_volume);
                b
            })
            .collect();
        let params = scenario_params();
        let entries = run_flat(&bars, &params);
        assert_eq!(entries.len(), 1);

        let (k, step) = &entries[0];
        assert_eq!(*k, 70);
        assert_eq!(step.signal, Some(Signal::EnterShort));
        let position = step.state.position().unwrap();
        assert_eq!(position.entry_price, 98.0);
        assert!(position.stop_price > position.entry_price);
        assert!((position.stop_price - 102.2).abs() < 1e-9);
        assert!((position.running_extreme - 100.2).abs() < 1e-9);
    }
}
