//! Event sources: historical range fetch and live subscription

mod databento_source;
mod file;

pub use databento_source::{BookDepth, DatabentoSource, DATASET};
pub use file::{extract_date_from_filename, find_zst_files, front_month_symbol, parse_mbp_file, FileSource};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::watch;

use crate::types::Event;

/// Called once per decoded event, in feed order
pub type EventCallback = Box<dyn FnMut(Event) + Send>;

#[async_trait]
pub trait EventSource: Send + Sync {
    /// Complete, time-ordered event log for `[start, end)`
    async fn fetch_range(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<Event>>;

    /// Feed events to `on_event` until the feed ends or `shutdown` flips to
    /// true. With `replay_from` set the feed starts at that instant instead
    /// of now, so nothing between a history fetch and the live stream is lost.
    async fn stream_live(
        &self,
        replay_from: Option<DateTime<Utc>>,
        on_event: EventCallback,
        shutdown: watch::Receiver<bool>,
    ) -> Result<()>;
}
