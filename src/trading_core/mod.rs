//! Trading Core - bar aggregation and the order-flow setup detector
//!
//! - Bar aggregation from trades and depth snapshots
//! - Swing pivots and break-of-structure detection
//! - Entry setup search (passive accumulation, retest, BOS, aggression)
//! - Position management (stops, reversal BOS, depth targets)
//! - The pure `step` state machine and evaluation streams over it

pub mod backtest;
pub mod bars;
pub mod position;
pub mod setup;
pub mod state_machine;
pub mod structure;

// Re-export commonly used types
pub use backtest::{run_backtest, summarize, BacktestReport, BacktestSummary, Decision, Evaluator, TradeRecord};
pub use bars::{aggregate_events, BarAggregator, IngestOutcome};
pub use position::{ExitReason, OpenPosition};
pub use state_machine::{step, PositionState, Signal, Step};
