//! Entry setup search
//!
//! Passive accumulation at a level -> retest and bounce -> break of structure
//! -> aggressive volume in the break direction. The long side is written once
//! against a *projected* price series (`direction.sign() * mid`), so for a
//! short the same code reads ask-side depth, a resistance level, a retest from
//! above and a down-break.

use crate::config::{StrategyParams, POINT};
use crate::types::{Bar, Direction};

use super::structure::first_break;

/// A setup whose break of structure lands on the last bar of the history
#[derive(Debug, Clone, PartialEq)]
pub struct EntrySetup {
    pub direction: Direction,
    /// Bar that closed the passive accumulation window
    pub origin_index: usize,
    /// Bar that retested the level
    pub retest_index: usize,
    /// Accumulation level (support for long, resistance for short)
    pub level: f64,
    pub entry_index: usize,
    pub entry_price: f64,
}

/// Price series projected so the favorable move for `direction` is upward
pub(crate) fn projected_mids(bars: &[Bar], direction: Direction) -> Vec<f64> {
    let sign = direction.sign();
    bars.iter().map(|b| sign * b.mid).collect()
}

fn passive_depth(bar: &Bar, direction: Direction) -> f64 {
    match direction {
        Direction::Long => bar.bid_depth_avg,
        Direction::Short => bar.ask_depth_avg,
    }
}

/// Projected accumulation level for the window ending at `origin`.
///
/// The window is `bars[origin - lookback ..= origin]`; the level is the lowest
/// projected mid among bars whose passive depth reaches the threshold.
fn passive_level(
    bars: &[Bar],
    price: &[f64],
    origin: usize,
    params: &StrategyParams,
    direction: Direction,
) -> Option<f64> {
    let start = origin.saturating_sub(params.passive_lookback_bars);
    let mut count = 0;
    let mut level = f64::INFINITY;

    for idx in start..=origin {
        if passive_depth(&bars[idx], direction) >= params.passive_cob_threshold {
            count += 1;
            level = level.min(price[idx]);
        }
    }

    (count >= params.min_passive_accumulation_count).then_some(level)
}

/// Aggressive volume over the trailing window ending at `index`
pub fn aggression_confirms(bars: &[Bar], index: usize, params: &StrategyParams, direction: Direction) -> bool {
    let start = (index + 1).saturating_sub(params.aggressive_window_bars());
    let (buy, sell) = bars[start..=index]
        .iter()
        .fold((0u64, 0u64), |(b, s), bar| (b + bar.buy_volume, s + bar.sell_volume));

    let (with, against) = match direction {
        Direction::Long => (buy, sell),
        Direction::Short => (sell, buy),
    };
    with > against && with >= params.aggressive_min_volume
}

/// Search for a setup that enters on the last bar of `bars`.
///
/// `bars` must already be truncated to the evaluated index; nothing past the
/// last element exists as far as this function is concerned.
pub fn find_entry(bars: &[Bar], params: &StrategyParams, direction: Direction) -> Option<EntrySetup> {
    let n = bars.len();
    if n == 0 {
        return None;
    }
    let k = n - 1;

    let pivot = params.bos_swing_lookback;
    let bounce = params.bounce_bars;
    let search = params.bos_search_bars;
    let tolerance = params.key_level_points * POINT;
    let min_break = params.min_break();

    // Last origin that still leaves room for lookback, pivots and bounce
    let reserved = params.passive_lookback_bars + 2 * pivot + bounce + 1;
    let last_origin = k.checked_sub(reserved)?;
    let first_origin = k.saturating_sub(search);
    if first_origin > last_origin {
        return None;
    }

    let price = projected_mids(bars, direction);
    let retest_limit = n.saturating_sub(2 * pivot + bounce + 1);

    // The break found from a retest bar does not depend on the origin
    let mut breaks: Vec<Option<Option<usize>>> = vec![None; n];

    for origin in first_origin..=last_origin {
        let Some(level) = passive_level(bars, &price, origin, params, direction) else {
            continue;
        };

        for t in origin..(origin + search).min(retest_limit) {
            if price[t] > level + tolerance {
                continue;
            }
            // Rejection, not just a touch
            let bounced = price[t + 1..=t + bounce].iter().any(|&p| p > level + tolerance);
            if !bounced {
                continue;
            }

            // The break window must reach the evaluated bar
            let end = (t + search).min(n);
            if end <= k {
                continue;
            }
            let window = &price[t..end];
            if window.len() < 2 * pivot + 1 {
                continue;
            }

            let found = *breaks[t].get_or_insert_with(|| first_break(window, pivot, min_break, Direction::Long));
            let Some(offset) = found else {
                continue;
            };
            if t + offset != k {
                continue;
            }

            // Break far beyond the zone is an inconsistent read
            if price[k] < level - tolerance {
                continue;
            }
            if !aggression_confirms(bars, k, params, direction) {
                continue;
            }

            return Some(EntrySetup {
                direction,
                origin_index: origin,
                retest_index: t,
                level: direction.sign() * level,
                entry_index: k,
                entry_price: bars[k].mid,
            });
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use std::collections::BTreeMap;

    fn bar(i: usize, mid: f64, bid_depth: f64, ask_depth: f64) -> Bar {
        Bar {
            timestamp: Utc.with_ymd_and_hms(2026, 1, 5, 14, 30, 0).unwrap() + Duration::minutes(i as i64),
            interval: i as u64,
            mid,
            bid_depth_avg: bid_depth,
            ask_depth_avg: ask_depth,
            depth_samples: 1,
            buy_volume: 0,
            sell_volume: 0,
            tick_size: 0.25,
            resting_ask_depth: BTreeMap::new(),
            resting_bid_depth: BTreeMap::new(),
        }
    }

    #[test]
    fn test_passive_level_requires_min_count() {
        let params = StrategyParams {
            passive_lookback_bars: 3,
            min_passive_accumulation_count: 2,
            passive_cob_threshold: 50.0,
            ..StrategyParams::default()
        };
        let bars = vec![
            bar(0, 100.0, 60.0, 0.0),
            bar(1, 99.0, 10.0, 0.0),
            bar(2, 101.0, 70.0, 0.0),
            bar(3, 102.0, 10.0, 0.0),
        ];
        let price = projected_mids(&bars, Direction::Long);
        assert_eq!(passive_level(&bars, &price, 3, &params, Direction::Long), Some(100.0));
        assert_eq!(passive_level(&bars, &price, 1, &params, Direction::Long), None);

        // Short side reads ask depth and reports the projected (negated) max
        let short = projected_mids(&bars, Direction::Short);
        assert_eq!(passive_level(&bars, &short, 3, &params, Direction::Short), None);
    }

    #[test]
    fn test_aggression_window() {
        let params = StrategyParams {
            aggressive_window_seconds: 120,
            bar_seconds: 60,
            aggressive_min_volume: 100,
            ..StrategyParams::default()
        };
        let mut bars: Vec<Bar> = (0..4).map(|i| bar(i, 100.0, 0.0, 0.0)).collect();
        bars[2].buy_volume = 60;
        bars[3].buy_volume = 50;
        bars[3].sell_volume = 20;
        assert!(aggression_confirms(&bars, 3, &params, Direction::Long));
        assert!(!aggression_confirms(&bars, 3, &params, Direction::Short));

        // Bar 1 is outside the two-bar window
        bars[1].sell_volume = 1_000;
        assert!(aggression_confirms(&bars, 3, &params, Direction::Long));
    }

    #[test]
    fn test_no_entry_without_enough_history() {
        let params = StrategyParams::default();
        let bars: Vec<Bar> = (0..30).map(|i| bar(i, 100.0, 60.0, 0.0)).collect();
        assert_eq!(find_entry(&bars, &params, Direction::Long), None);
    }
}
