//! Live session: backfill, warm-up, then producer feed and consumer poll loop

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

use super::driver::SessionDriver;
use super::hours::{et_date, is_rth, session_bounds};
use super::retry::RetryPolicy;
use crate::config::StrategyParams;
use crate::sink::SignalSink;
use crate::streams::{EventCallback, EventSource};
use crate::trading_core::BarAggregator;
use crate::types::Event;

#[derive(Debug, Clone)]
pub struct LiveSettings {
    /// Consumer cadence
    pub poll_interval: Duration,
    pub retry: RetryPolicy,
    /// Run even when the clock is outside regular trading hours
    pub ignore_session_hours: bool,
    /// How far historical data lags real time; the backfill stops this far
    /// back and the live feed replays from there
    pub history_delay: Duration,
}

impl Default for LiveSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            retry: RetryPolicy::default(),
            ignore_session_hours: false,
            history_delay: Duration::from_secs(20 * 60),
        }
    }
}

const NOTHING_SEEN: i64 = i64::MIN;

/// Where a (re)connect should resume: just past the newest event seen so
/// far, else the initial replay point
fn resume_point(last_seen: i64, initial: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    if last_seen == NOTHING_SEEN {
        return initial;
    }
    Some(DateTime::<Utc>::from_timestamp_nanos(last_seen) + chrono::Duration::nanoseconds(1))
}

/// Producer: keep the feed attached, reconnecting per the retry policy.
/// Reconnects resume after the last event received.
async fn run_feed(
    source: Arc<dyn EventSource>,
    aggregator: Arc<BarAggregator>,
    shutdown: watch::Receiver<bool>,
    retry: RetryPolicy,
    replay_from: Option<DateTime<Utc>>,
) -> Result<()> {
    let last_seen = Arc::new(AtomicI64::new(NOTHING_SEEN));
    let mut failures = 0u32;
    while !*shutdown.borrow() {
        let agg = aggregator.clone();
        let seen = last_seen.clone();
        let on_event: EventCallback = Box::new(move |event: Event| {
            if let Some(nanos) = event.timestamp().timestamp_nanos_opt() {
                seen.fetch_max(nanos, Ordering::Relaxed);
            }
            agg.ingest(&event);
        });

        let from = resume_point(last_seen.load(Ordering::Relaxed), replay_from);
        match source.stream_live(from, on_event, shutdown.clone()).await {
            Ok(()) => break,
            Err(e) if failures + 1 < retry.max_attempts.max(1) => {
                let delay = retry.delay(failures);
                warn!(
                    attempt = failures + 1,
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "live feed failed, reconnecting"
                );
                failures += 1;
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e.context("live feed failed permanently")),
        }
    }
    Ok(())
}

/// Run one live session until the close, ctrl-c, or a fatal feed error
pub async fn run_live(
    source: Arc<dyn EventSource>,
    params: StrategyParams,
    sinks: Vec<Box<dyn SignalSink>>,
    settings: LiveSettings,
) -> Result<()> {
    let now = Utc::now();
    if !settings.ignore_session_hours && !is_rth(now) {
        bail!("Outside regular trading hours (09:30-16:00 ET); not starting");
    }

    let (session_start, session_end) = session_bounds(et_date(now))?;
    run_session(source, params, sinks, &settings, session_start, session_end, now).await?;
    Ok(())
}

/// Backfill `[session_start, now - history_delay)`, then stream live from
/// the end of the backfill so the two halves meet without a gap.
async fn run_session(
    source: Arc<dyn EventSource>,
    params: StrategyParams,
    sinks: Vec<Box<dyn SignalSink>>,
    settings: &LiveSettings,
    session_start: DateTime<Utc>,
    session_end: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<SessionDriver> {
    let aggregator = Arc::new(BarAggregator::new(
        session_start,
        chrono::Duration::seconds(params.bar_seconds as i64),
        params.tick_size,
    ));

    let delay = chrono::Duration::from_std(settings.history_delay).context("history delay out of range")?;
    let replay_from = (now > session_start).then(|| (now - delay).max(session_start));

    if let Some(backfill_end) = replay_from.filter(|end| *end > session_start) {
        let history_source = source.as_ref();
        let backfill = settings
            .retry
            .run("backfill", move || history_source.fetch_range(session_start, backfill_end))
            .await
            .context("Failed to backfill session")?;
        info!(events = backfill.len(), %backfill_end, "backfill fetched");
        for event in &backfill {
            aggregator.ingest(event);
        }
    }

    let mut driver = SessionDriver::new(aggregator.clone(), params, sinks);
    driver.warm_up();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut feed = tokio::spawn(run_feed(
        source.clone(),
        aggregator.clone(),
        shutdown_rx,
        settings.retry,
        replay_from,
    ));

    let mut ticker = tokio::time::interval(settings.poll_interval);
    let mut feed_done = false;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                driver.poll();
                if !settings.ignore_session_hours && past(session_end) {
                    info!("Session closed");
                    break;
                }
            }
            result = &mut feed => {
                feed_done = true;
                match result.context("feed task panicked")? {
                    Ok(()) => info!("Feed ended"),
                    Err(e) => {
                        let _ = shutdown_tx.send(true);
                        return Err(e);
                    }
                }
                // The log is complete; close the last bar and pick it up
                aggregator.flush();
                driver.poll();
                break;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down...");
                break;
            }
        }
    }

    let _ = shutdown_tx.send(true);
    if !feed_done {
        match feed.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "feed stopped with error"),
            Err(e) => warn!(error = %e, "feed task panicked"),
        }
    }

    info!(
        bars = driver.history().len(),
        late_events = aggregator.late_events(),
        bar_close_flat = driver.bar_close_state().is_flat(),
        running_flat = driver.running_state().is_flat(),
        "live session finished"
    );
    Ok(driver)
}

fn past(ts: DateTime<Utc>) -> bool {
    Utc::now() >= ts
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::Mutex;

    use crate::types::{Side, Trade};

    fn session_start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 5, 14, 30, 0).unwrap()
    }

    /// One buy print every 10 seconds for the first 30 minutes
    fn tape() -> Vec<Event> {
        (0..180)
            .map(|i| {
                Event::Trade(Trade {
                    timestamp: session_start() + chrono::Duration::seconds(i * 10),
                    side: Side::Buy,
                    size: 1,
                })
            })
            .collect()
    }

    /// Serves `tape()` for history and live; the first live connection
    /// optionally drops after `fail_after` events.
    struct Tape {
        events: Vec<Event>,
        fail_after: Option<usize>,
        fetched: Mutex<Vec<(DateTime<Utc>, DateTime<Utc>)>>,
        replays: Mutex<Vec<Option<DateTime<Utc>>>>,
    }

    impl Tape {
        fn new(fail_after: Option<usize>) -> Self {
            Self {
                events: tape(),
                fail_after,
                fetched: Mutex::new(Vec::new()),
                replays: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl EventSource for Tape {
        async fn fetch_range(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<Event>> {
            self.fetched.lock().unwrap().push((start, end));
            Ok(self
                .events
                .iter()
                .filter(|e| e.timestamp() >= start && e.timestamp() < end)
                .cloned()
                .collect())
        }

        async fn stream_live(
            &self,
            replay_from: Option<DateTime<Utc>>,
            mut on_event: EventCallback,
            _shutdown: watch::Receiver<bool>,
        ) -> Result<()> {
            let attempt = {
                let mut replays = self.replays.lock().unwrap();
                replays.push(replay_from);
                replays.len()
            };
            let live = self
                .events
                .iter()
                .filter(|e| replay_from.map_or(true, |from| e.timestamp() >= from));
            for (sent, event) in live.enumerate() {
                if attempt == 1 && self.fail_after == Some(sent) {
                    anyhow::bail!("connection reset");
                }
                on_event(event.clone());
            }
            Ok(())
        }
    }

    fn settings() -> LiveSettings {
        LiveSettings {
            poll_interval: Duration::from_millis(5),
            retry: RetryPolicy {
                max_attempts: 3,
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(1),
            },
            ignore_session_hours: true,
            history_delay: Duration::from_secs(20 * 60),
        }
    }

    async fn run(source: Arc<Tape>) -> SessionDriver {
        let now = session_start() + chrono::Duration::minutes(25);
        let end = session_start() + chrono::Duration::hours(6);
        run_session(source, StrategyParams::default(), vec![], &settings(), session_start(), end, now)
            .await
            .unwrap()
    }

    fn assert_every_print_counted_once(driver: &SessionDriver) {
        let bars = driver.history();
        assert_eq!(bars.len(), 30);
        for (i, bar) in bars.iter().enumerate() {
            assert_eq!(bar.interval, i as u64);
            assert_eq!(bar.buy_volume, 6, "bar {}", i);
        }
    }

    #[tokio::test]
    async fn test_live_stream_starts_where_backfill_ends() {
        let source = Arc::new(Tape::new(None));
        let driver = run(source.clone()).await;

        let backfill_end = session_start() + chrono::Duration::minutes(5);
        assert_eq!(*source.fetched.lock().unwrap(), vec![(session_start(), backfill_end)]);
        assert_eq!(*source.replays.lock().unwrap(), vec![Some(backfill_end)]);
        assert_every_print_counted_once(&driver);
    }

    #[tokio::test]
    async fn test_reconnect_resumes_after_last_event() {
        let source = Arc::new(Tape::new(Some(40)));
        let driver = run(source.clone()).await;

        // 30 backfilled prints, then 40 live ones before the drop
        let last = session_start() + chrono::Duration::seconds(69 * 10);
        let replays = source.replays.lock().unwrap().clone();
        assert_eq!(replays.len(), 2);
        assert_eq!(replays[1], Some(last + chrono::Duration::nanoseconds(1)));
        assert_every_print_counted_once(&driver);
    }

    #[tokio::test]
    async fn test_no_backfill_inside_history_delay() {
        let source = Arc::new(Tape::new(None));
        let now = session_start() + chrono::Duration::minutes(10);
        let end = session_start() + chrono::Duration::hours(6);
        let driver = run_session(source.clone(), StrategyParams::default(), vec![], &settings(), session_start(), end, now)
            .await
            .unwrap();

        assert!(source.fetched.lock().unwrap().is_empty());
        assert_eq!(*source.replays.lock().unwrap(), vec![Some(session_start())]);
        assert_every_print_counted_once(&driver);
    }
}
