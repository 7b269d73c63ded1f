//! Regular trading hours for CME equity-index futures, in New York time

use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, TimeZone, Utc, Weekday};
use chrono_tz::America::New_York;

pub const RTH_START: (u32, u32) = (9, 30);
pub const RTH_END: (u32, u32) = (16, 0);

fn et_instant(date: NaiveDate, (hour, minute): (u32, u32)) -> Result<DateTime<Utc>> {
    let time = NaiveTime::from_hms_opt(hour, minute, 0).context("Invalid session time")?;
    let local = New_York
        .from_local_datetime(&date.and_time(time))
        .single()
        .with_context(|| format!("Ambiguous or missing ET time on {}", date))?;
    Ok(local.with_timezone(&Utc))
}

/// RTH `[open, close)` for a date. The open anchors bar index 0.
pub fn session_bounds(date: NaiveDate) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
    Ok((et_instant(date, RTH_START)?, et_instant(date, RTH_END)?))
}

/// New York calendar date of an instant
pub fn et_date(ts: DateTime<Utc>) -> NaiveDate {
    ts.with_timezone(&New_York).date_naive()
}

/// Weekday and within RTH. Exchange holidays are not modelled.
pub fn is_rth(ts: DateTime<Utc>) -> bool {
    let date = et_date(ts);
    if matches!(date.weekday(), Weekday::Sat | Weekday::Sun) {
        return false;
    }
    match session_bounds(date) {
        Ok((open, close)) => open <= ts && ts < close,
        Err(_) => false,
    }
}
