//! Open-position management: stop, reversal break, depth-based target
//!
//! Works in the same projected price space as the entry search, so every
//! rule is written once for the long side.

use serde::{Deserialize, Serialize};

use crate::config::{StrategyParams, TrailMode, POINT};
use crate::types::{Bar, Direction};

use super::setup::projected_mids;
use super::structure::first_break;

/// Breakeven lock places the stop this many points on the losing side of entry
pub const BREAKEVEN_OFFSET_POINTS: f64 = 2.0;

/// Spacing of round-number levels considered "key" for depth targets
pub const ROUND_LEVEL_STEP: f64 = 50.0;

/// Why a position was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    Stop,
    ReversalBos,
    Target,
    /// Held for `max_hold_bars`
    Time,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitReason::Stop => write!(f, "stop"),
            ExitReason::ReversalBos => write!(f, "reversal_bos"),
            ExitReason::Target => write!(f, "target"),
            ExitReason::Time => write!(f, "time"),
        }
    }
}

/// An open position as carried between detector calls
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenPosition {
    pub direction: Direction,
    pub entry_price: f64,
    pub entry_bar_index: usize,
    pub stop_price: f64,
    /// `[running_low, running_high, accumulation level]` at entry
    pub key_levels_at_entry: Vec<f64>,
    /// Support (long) or resistance (short) the initial stop was hung from
    pub running_extreme: f64,
}

/// Initial stop for an entry.
///
/// Hangs the stop `sl_buffer_pts` beyond the running extreme; falls back to
/// `sl_points_fallback` from entry when that stop would sit on the wrong side,
/// closer than three points, or further than `sl_max_pts`.
pub fn initial_stop(entry_price: f64, running_extreme: f64, direction: Direction, params: &StrategyParams) -> f64 {
    let sign = direction.sign();
    let entry = sign * entry_price;
    let support = sign * running_extreme;

    let mut stop = support - params.sl_buffer_pts * POINT;
    let distance = entry - stop;
    if stop >= entry || distance < 3.0 * POINT || distance > params.sl_max_pts {
        stop = entry - params.sl_points_fallback * POINT;
    }
    sign * stop
}

/// Nearest qualifying resting-depth level beyond `price`, minus the buffer.
///
/// Returned in projected space. Levels near an entry-time key level or a
/// round number are preferred when any exist and the preference is enabled.
fn depth_target(bar: &Bar, price: f64, key_levels: &[f64], params: &StrategyParams, direction: Direction) -> Option<f64> {
    let sign = direction.sign();
    let levels: Vec<(f64, u64)> = match direction {
        Direction::Long => bar.resting_asks().collect(),
        Direction::Short => bar.resting_bids().collect(),
    };

    let mut candidates: Vec<f64> = levels
        .into_iter()
        .filter(|&(px, depth)| sign * px > price && depth >= params.cob_tp_threshold)
        .map(|(px, _)| px)
        .collect();
    if candidates.is_empty() {
        return None;
    }

    if params.cob_prefer_key_levels {
        let near_key = |px: f64| {
            let near_entry_level = key_levels
                .iter()
                .any(|kl| kl.is_finite() && (px - kl).abs() <= params.cob_near_key_pts);
            let round = (px / ROUND_LEVEL_STEP).round() * ROUND_LEVEL_STEP;
            near_entry_level || (px - round).abs() <= params.cob_near_key_pts
        };
        let near: Vec<f64> = candidates.iter().copied().filter(|&px| near_key(px)).collect();
        if !near.is_empty() {
            candidates = near;
        }
    }

    let nearest = candidates
        .into_iter()
        .map(|px| sign * px)
        .fold(f64::INFINITY, f64::min);
    Some(nearest - params.tp_buffer_pts_cob * POINT)
}

/// Evaluate the last bar of `bars` against an open position.
///
/// Returns the exit reason, if any, and the position with its stop possibly
/// raised. Bars at or before the entry bar never exit.
pub fn manage(bars: &[Bar], params: &StrategyParams, position: &OpenPosition) -> (Option<ExitReason>, OpenPosition) {
    let mut next = position.clone();
    let Some(k) = bars.len().checked_sub(1) else {
        return (None, next);
    };
    if k <= position.entry_bar_index {
        return (None, next);
    }

    let direction = position.direction;
    let sign = direction.sign();
    let price = projected_mids(bars, direction);
    let p = price[k];
    let entry = sign * position.entry_price;
    let mut stop = sign * position.stop_price;

    // 1. Stop management, then the stop itself
    if params.trail_activation_pts > 0.0 {
        match params.trail_mode {
            TrailMode::BreakevenLock => {
                if p >= entry + params.trail_activation_pts * POINT {
                    stop = stop.max(entry - BREAKEVEN_OFFSET_POINTS * POINT);
                }
            }
            TrailMode::FromExtreme => {
                let best = price[position.entry_bar_index..=k]
                    .iter()
                    .copied()
                    .fold(f64::NEG_INFINITY, f64::max);
                if best >= entry + params.trail_activation_pts * POINT {
                    stop = stop.max(best - params.trail_distance_pts * POINT);
                }
            }
        }
    }
    next.stop_price = sign * stop;

    if p <= stop {
        return (Some(ExitReason::Stop), next);
    }

    // 2. Break of structure against the position since entry
    let pivot = params.bos_swing_lookback;
    if params.exit_on_reversal_bos && k > position.entry_bar_index + pivot {
        let since_entry = &price[position.entry_bar_index..=k];
        if since_entry.len() > 2 * pivot
            && first_break(since_entry, pivot, params.min_break(), Direction::Short).is_some()
        {
            return (Some(ExitReason::ReversalBos), next);
        }
    }

    // 3. Resting depth ahead of price
    if let Some(target) = depth_target(&bars[k], p, &position.key_levels_at_entry, params, direction) {
        let room = target - entry;
        let far_enough = params.min_tp_pts_above_entry <= 0.0 || room >= params.min_tp_pts_above_entry * POINT;
        if target > entry && p >= target && far_enough {
            return (Some(ExitReason::Target), next);
        }
    }

    (None, next)
}
