//! Session driver: pulls bars from the aggregator and runs both cadences
//!
//! The bar-close cadence sees completed bars only and is evaluated once per
//! newly completed bar. The running cadence sees completed bars plus the open
//! bar and is evaluated once per poll. Each cadence owns its own evaluator, so
//! their position states never mix.

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::StrategyParams;
use crate::sink::{Cadence, SignalEvent, SignalSink};
use crate::trading_core::{BarAggregator, Evaluator, PositionState};
use crate::types::Bar;

pub struct SessionDriver {
    aggregator: Arc<BarAggregator>,
    history: Vec<Bar>,
    bar_close: Evaluator,
    running: Evaluator,
    sinks: Vec<Box<dyn SignalSink>>,
}

impl SessionDriver {
    pub fn new(aggregator: Arc<BarAggregator>, params: StrategyParams, sinks: Vec<Box<dyn SignalSink>>) -> Self {
        Self {
            aggregator,
            history: Vec::new(),
            bar_close: Evaluator::new(params.clone()),
            running: Evaluator::new(params),
            sinks,
        }
    }

    pub fn history(&self) -> &[Bar] {
        &self.history
    }

    pub fn bar_close_state(&self) -> &PositionState {
        self.bar_close.state()
    }

    pub fn running_state(&self) -> &PositionState {
        self.running.state()
    }

    /// Absorb bars completed so far (the backfill) without publishing.
    ///
    /// The bar-close cadence walks them so its state matches a batch run over
    /// the same bars; the running cadence starts from that state.
    pub fn warm_up(&mut self) -> usize {
        let backfill = self.aggregator.drain_completed();
        let count = backfill.len();
        for bar in backfill {
            self.history.push(bar);
            let k = self.history.len() - 1;
            if let Some(decision) = self.bar_close.evaluate(&self.history, k) {
                debug!(bar = k, signal = %decision.signal, "warm-up signal (not published)");
            }
        }
        self.running = self.bar_close.clone();

        info!(
            bars = count,
            flat = self.bar_close.state().is_flat(),
            "warm-up complete"
        );
        count
    }

    /// One consumer tick. Returns everything published during the tick.
    pub fn poll(&mut self) -> Vec<SignalEvent> {
        let mut events = Vec::new();

        for bar in self.aggregator.drain_completed() {
            self.history.push(bar);
            let k = self.history.len() - 1;
            if let Some(decision) = self.bar_close.evaluate(&self.history, k) {
                events.push(SignalEvent {
                    cadence: Cadence::BarClose,
                    decision,
                });
            }
        }

        if let Some(open) = self.aggregator.peek_running() {
            // The running bar is only borrowed into history for this call
            self.history.push(open);
            let k = self.history.len() - 1;
            let decision = self.running.evaluate(&self.history, k);
            self.history.pop();

            if let Some(decision) = decision {
                events.push(SignalEvent {
                    cadence: Cadence::Running,
                    decision,
                });
            }
        }

        for event in &events {
            self.publish(event);
        }
        events
    }

    fn publish(&mut self, event: &SignalEvent) {
        for sink in &mut self.sinks {
            if let Err(e) = sink.publish(event) {
                warn!(error = %e, cadence = %event.cadence, "signal sink failed");
            }
        }
    }
}
