//! Evaluation streams and batch backtests
//!
//! An [`Evaluator`] owns one `PositionState` and turns detector steps into
//! [`Decision`]s with entry/exit pairing. The batch backtest and each live
//! cadence are all just evaluators fed different bar sequences, so the
//! per-session limits (`max_hold_bars`, `max_trades_per_day`) live here and
//! apply identically to both.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::StrategyParams;
use crate::types::{Bar, Direction};

use super::position::ExitReason;
use super::state_machine::{step, PositionState, Signal, Step};

/// A non-empty detector output, stamped with its bar
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub bar_index: usize,
    pub timestamp: DateTime<Utc>,
    pub signal: Signal,
    pub direction: Direction,
    pub price: f64,
    /// Entry price of the position an exit closes
    pub entry_price: Option<f64>,
    pub pnl_points: Option<f64>,
}

/// One evaluation stream with its own position state
#[derive(Debug, Clone)]
pub struct Evaluator {
    params: StrategyParams,
    state: PositionState,
    /// Entries taken this session
    entries: usize,
}

impl Evaluator {
    pub fn new(params: StrategyParams) -> Self {
        Self {
            params,
            state: PositionState::Flat,
            entries: 0,
        }
    }

    pub fn entries(&self) -> usize {
        self.entries
    }

    fn trade_cap_reached(&self) -> bool {
        self.params.max_trades_per_day > 0 && self.entries >= self.params.max_trades_per_day
    }

    /// Time exit for a position the detector kept open at `k`
    fn time_exit(&self, bars: &[Bar], k: usize, state: &PositionState) -> bool {
        let max_hold = self.params.max_hold_bars;
        match state {
            PositionState::Open(position) => {
                max_hold > 0 && k >= position.entry_bar_index + max_hold && bars[k].has_quote()
            }
            PositionState::Flat => false,
        }
    }

    pub fn state(&self) -> &PositionState {
        &self.state
    }

    pub fn params(&self) -> &StrategyParams {
        &self.params
    }

    /// Run the detector at `k` and advance the state
    pub fn evaluate(&mut self, bars: &[Bar], k: usize) -> Option<Decision> {
        if k >= bars.len() || (self.state.is_flat() && self.trade_cap_reached()) {
            return None;
        }

        let previous = self.state.position().cloned();
        let mut result = step(bars, k, &self.params, &self.state);
        if result.signal.is_none() && self.time_exit(bars, k, &result.state) {
            result = Step {
                signal: Some(Signal::Exit(ExitReason::Time)),
                state: PositionState::Flat,
            };
        }
        self.state = result.state;

        let signal = result.signal?;
        if signal.is_entry() {
            self.entries += 1;
        }
        let bar = &bars[k];
        let decision = match (signal, previous) {
            (Signal::Exit(_), Some(position)) => Decision {
                bar_index: k,
                timestamp: bar.timestamp,
                signal,
                direction: position.direction,
                price: bar.mid,
                entry_price: Some(position.entry_price),
                pnl_points: Some(position.direction.sign() * (bar.mid - position.entry_price)),
            },
            _ => Decision {
                bar_index: k,
                timestamp: bar.timestamp,
                signal,
                direction: match signal {
                    Signal::EnterShort => Direction::Short,
                    _ => Direction::Long,
                },
                price: bar.mid,
                entry_price: None,
                pnl_points: None,
            },
        };
        Some(decision)
    }
}

/// Entry paired with its exit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub direction: Direction,
    pub entry_index: usize,
    pub entry_time: DateTime<Utc>,
    pub entry_price: f64,
    pub exit_index: usize,
    pub exit_time: DateTime<Utc>,
    pub exit_price: f64,
    pub reason: ExitReason,
    pub pnl_points: f64,
    /// Best excursion in favor between entry and exit, in points
    pub mfe_points: f64,
    /// Worst excursion against, in points
    pub mae_points: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BacktestSummary {
    pub trades: usize,
    pub wins: usize,
    pub losses: usize,
    pub total_points: f64,
    /// Largest peak-to-trough fall of cumulative points
    pub max_drawdown_points: f64,
    /// Per-trade mean over standard deviation, annualised by sqrt(252)
    pub sharpe: Option<f64>,
}

impl BacktestSummary {
    pub fn win_rate(&self) -> f64 {
        if self.trades == 0 {
            0.0
        } else {
            self.wins as f64 / self.trades as f64 * 100.0
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestReport {
    pub decisions: Vec<Decision>,
    pub trades: Vec<TradeRecord>,
    pub summary: BacktestSummary,
    /// Position still open after the last bar
    pub final_state: PositionState,
}

/// Evaluate every bar of a closed sequence in order
pub fn run_backtest(bars: &[Bar], params: &StrategyParams) -> BacktestReport {
    let mut evaluator = Evaluator::new(params.clone());
    let decisions: Vec<Decision> = (0..bars.len())
        .filter_map(|k| evaluator.evaluate(bars, k))
        .collect();

    let trades = pair_trades(bars, &decisions);
    let summary = summarize(&trades);
    BacktestReport {
        decisions,
        trades,
        summary,
        final_state: evaluator.state().clone(),
    }
}

/// Favorable and adverse excursion over `bars[entry..=exit]`
fn excursions(bars: &[Bar], direction: Direction, entry_index: usize, exit_index: usize, entry_price: f64) -> (f64, f64) {
    let sign = direction.sign();
    let Some(held) = bars.get(entry_index..=exit_index) else {
        return (0.0, 0.0);
    };
    held.iter()
        .map(|b| sign * (b.mid - entry_price))
        .fold((0.0_f64, 0.0_f64), |(mfe, mae), moved| (mfe.max(moved), mae.max(-moved)))
}

/// Pair each exit with the entry before it
pub fn pair_trades(bars: &[Bar], decisions: &[Decision]) -> Vec<TradeRecord> {
    let mut trades = Vec::new();
    let mut open: Option<&Decision> = None;

    for decision in decisions {
        match decision.signal {
            Signal::EnterLong | Signal::EnterShort => open = Some(decision),
            Signal::Exit(reason) => {
                if let Some(entry) = open.take() {
                    let (mfe_points, mae_points) =
                        excursions(bars, entry.direction, entry.bar_index, decision.bar_index, entry.price);
                    trades.push(TradeRecord {
                        direction: entry.direction,
                        entry_index: entry.bar_index,
                        entry_time: entry.timestamp,
                        entry_price: entry.price,
                        exit_index: decision.bar_index,
                        exit_time: decision.timestamp,
                        exit_price: decision.price,
                        reason,
                        pnl_points: entry.direction.sign() * (decision.price - entry.price),
                        mfe_points,
                        mae_points,
                    });
                }
            }
        }
    }
    trades
}

fn max_drawdown(pnls: &[f64]) -> f64 {
    let mut cumulative = 0.0_f64;
    let mut peak = 0.0_f64;
    let mut max_dd = 0.0_f64;
    for pnl in pnls {
        cumulative += pnl;
        peak = peak.max(cumulative);
        max_dd = max_dd.max(peak - cumulative);
    }
    max_dd
}

/// `None` with fewer than two trades; 0 when every trade made the same
fn sharpe(pnls: &[f64]) -> Option<f64> {
    if pnls.len() < 2 {
        return None;
    }
    let n = pnls.len() as f64;
    let mean = pnls.iter().sum::<f64>() / n;
    let std = (pnls.iter().map(|p| (p - mean).powi(2)).sum::<f64>() / n).sqrt();
    if std < 1e-15 {
        return Some(0.0);
    }
    Some(mean / std * 252.0_f64.sqrt())
}

/// Summary over trades in chronological order
pub fn summarize(trades: &[TradeRecord]) -> BacktestSummary {
    let pnls: Vec<f64> = trades.iter().map(|t| t.pnl_points).collect();
    let wins = pnls.iter().filter(|&&p| p > 0.0).count();
    BacktestSummary {
        trades: trades.len(),
        wins,
        losses: trades.len() - wins,
        total_points: pnls.iter().sum(),
        max_drawdown_points: max_drawdown(&pnls),
        sharpe: sharpe(&pnls),
    }
}
