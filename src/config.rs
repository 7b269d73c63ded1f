//! Strategy parameters
//!
//! Loaded once at process start from a flat JSON object (`params.json`) and
//! never mutated afterwards. Key names follow the params files produced by the
//! research backtests so existing files load unchanged.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;
use thiserror::Error;

/// Value of one "point" of price movement
pub const POINT: f64 = 1.0;

/// Minimum bar history before the detector evaluates anything
pub const MIN_HISTORY_BARS: usize = 20;

/// Trailing key used by the research params files
const LEGACY_TRAIL_KEY: &str = "trail_sl_pts";

/// Keys that must be present in a params file
pub const REQUIRED_KEYS: [&str; 4] = [
    "passive_cob_threshold",
    "key_level_points",
    "aggressive_min_volume",
    "bos_swing_lookback",
];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read params file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("params must be a flat JSON object: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("missing required parameter `{0}`")]
    MissingKey(&'static str),

    #[error("invalid parameter `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// How the stop follows price once a position is in profit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TrailMode {
    /// Lock the stop at entry minus two points once activation is reached
    #[default]
    BreakevenLock,
    /// Trail `trail_distance_pts` behind the best price since entry
    FromExtreme,
}

/// Lunch-hour blackout, expressed in 1-minute bars from the 9:30 ET open
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum LunchWindow {
    #[default]
    #[serde(rename = "none")]
    None,
    #[serde(rename = "11-1")]
    ElevenToOne,
    #[serde(rename = "11:30-1")]
    ElevenThirtyToOne,
    #[serde(rename = "12-1")]
    TwelveToOne,
}

impl LunchWindow {
    /// Blocked bar range `[start, end)`, if any
    pub fn bar_range(self) -> Option<(usize, usize)> {
        match self {
            LunchWindow::None => None,
            LunchWindow::ElevenToOne => Some((90, 210)),
            LunchWindow::ElevenThirtyToOne => Some((120, 210)),
            LunchWindow::TwelveToOne => Some((150, 210)),
        }
    }

    pub fn contains(self, bar_index: usize) -> bool {
        self.bar_range()
            .is_some_and(|(start, end)| start <= bar_index && bar_index < end)
    }
}

/// Immutable thresholds for setup detection and position management
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyParams {
    // --- Passive accumulation ---
    /// Average resting depth a bar needs to count as passive accumulation
    pub passive_cob_threshold: f64,
    pub passive_lookback_bars: usize,
    #[serde(alias = "min_passive_count")]
    pub min_passive_accumulation_count: usize,
    /// Tolerance around the accumulation level (points)
    pub key_level_points: f64,

    // --- Retest / structure ---
    pub bounce_bars: usize,
    #[serde(alias = "pivot_lookback")]
    pub bos_swing_lookback: usize,
    pub bos_min_break_ticks: u32,
    pub bos_search_bars: usize,

    // --- Aggression ---
    pub aggressive_min_volume: u64,
    pub aggressive_window_seconds: u64,

    // --- Stops ---
    pub sl_buffer_pts: f64,
    pub sl_max_pts: f64,
    #[serde(alias = "sl_fallback_pts")]
    pub sl_points_fallback: f64,
    pub trail_activation_pts: f64,
    pub trail_mode: TrailMode,
    pub trail_distance_pts: f64,
    pub exit_on_reversal_bos: bool,
    /// Close after this many bars in the trade; 0 disables
    pub max_hold_bars: usize,
    /// Entries allowed per session; 0 means unlimited
    pub max_trades_per_day: usize,

    // --- Depth target ---
    pub cob_tp_threshold: u64,
    #[serde(alias = "tp_buffer_pts")]
    pub tp_buffer_pts_cob: f64,
    #[serde(alias = "near_key_pts")]
    pub cob_near_key_pts: f64,
    pub cob_prefer_key_levels: bool,
    pub min_tp_pts_above_entry: f64,

    // --- Session filters ---
    pub no_first_minutes: usize,
    pub lunch_window: LunchWindow,

    // --- Instrument / bars ---
    pub bar_seconds: u64,
    pub tick_size: f64,
}

impl Default for StrategyParams {
    fn default() -> Self {
        Self {
            passive_cob_threshold: 50.0,
            passive_lookback_bars: 60,
            min_passive_accumulation_count: 3,
            key_level_points: 20.0,
            bounce_bars: 5,
            bos_swing_lookback: 10,
            bos_min_break_ticks: 2,
            bos_search_bars: 120,
            aggressive_min_volume: 150,
            aggressive_window_seconds: 60,
            sl_buffer_pts: 2.0,
            sl_max_pts: 25.0,
            sl_points_fallback: 15.0,
            trail_activation_pts: 15.0,
            trail_mode: TrailMode::BreakevenLock,
            trail_distance_pts: 15.0,
            exit_on_reversal_bos: true,
            max_hold_bars: 0,
            max_trades_per_day: 0,
            cob_tp_threshold: 30,
            tp_buffer_pts_cob: 0.5,
            cob_near_key_pts: 20.0,
            cob_prefer_key_levels: true,
            min_tp_pts_above_entry: 0.0,
            no_first_minutes: 0,
            lunch_window: LunchWindow::None,
            bar_seconds: 60,
            tick_size: 0.25,
        }
    }
}

/// Research params files describe trailing with `trail_sl_pts` plus an
/// optional `trail_activation_pts`:
///
/// - activation 0: once `trail_sl_pts` in profit, lock the stop at entry - 2
/// - activation > 0: once that far in profit, trail `trail_sl_pts` behind
///   the best price
///
/// Rewrites that pair into `trail_mode` / `trail_activation_pts` /
/// `trail_distance_pts`. Files that already name a `trail_mode` must not use
/// `trail_sl_pts`.
fn translate_trail_keys(map: &mut Map<String, Value>) -> Result<(), ConfigError> {
    let Some(raw) = map.remove(LEGACY_TRAIL_KEY) else {
        return Ok(());
    };
    if map.contains_key("trail_mode") {
        return Err(ConfigError::Invalid {
            key: LEGACY_TRAIL_KEY,
            reason: "cannot be combined with trail_mode".to_string(),
        });
    }

    let number = |key: &'static str, value: &Value| {
        value.as_f64().ok_or_else(|| ConfigError::Invalid {
            key,
            reason: "must be a number".to_string(),
        })
    };
    let trail_sl = if raw.is_null() { 0.0 } else { number(LEGACY_TRAIL_KEY, &raw)? };
    let activation = match map.get("trail_activation_pts") {
        Some(v) if !v.is_null() => number("trail_activation_pts", v)?,
        _ => 0.0,
    };

    let (mode, activation, distance) = if trail_sl <= 0.0 {
        // Trailing disabled
        (TrailMode::BreakevenLock, 0.0, 0.0)
    } else if activation > 0.0 {
        (TrailMode::FromExtreme, activation, trail_sl)
    } else {
        (TrailMode::BreakevenLock, trail_sl, trail_sl)
    };

    map.insert("trail_mode".to_string(), serde_json::to_value(mode)?);
    map.insert("trail_activation_pts".to_string(), Value::from(activation));
    map.insert("trail_distance_pts".to_string(), Value::from(distance));
    Ok(())
}

impl StrategyParams {
    /// Parse params from a JSON object, enforcing required keys
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let map: Map<String, Value> = serde_json::from_str(raw)?;
        Self::from_map(map)
    }

    /// Build params from a flat key/value map
    pub fn from_map(mut map: Map<String, Value>) -> Result<Self, ConfigError> {
        for key in REQUIRED_KEYS {
            let present = map.get(key).is_some_and(|v| !v.is_null());
            if !present {
                return Err(ConfigError::MissingKey(key));
            }
        }
        translate_trail_keys(&mut map)?;

        let params: StrategyParams = serde_json::from_value(Value::Object(map))?;
        params.validate()?;
        Ok(params)
    }

    /// Load and validate a params file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(key: &'static str, reason: &str) -> ConfigError {
            ConfigError::Invalid {
                key,
                reason: reason.to_string(),
            }
        }

        if self.bar_seconds == 0 {
            return Err(invalid("bar_seconds", "must be positive"));
        }
        if !(self.tick_size > 0.0) {
            return Err(invalid("tick_size", "must be positive"));
        }
        if self.bos_swing_lookback == 0 {
            return Err(invalid("bos_swing_lookback", "must be at least 1"));
        }
        if self.passive_lookback_bars == 0 {
            return Err(invalid("passive_lookback_bars", "must be at least 1"));
        }
        if self.min_passive_accumulation_count == 0 {
            return Err(invalid("min_passive_accumulation_count", "must be at least 1"));
        }
        if self.bounce_bars == 0 {
            return Err(invalid("bounce_bars", "must be at least 1"));
        }
        if self.bos_search_bars == 0 {
            return Err(invalid("bos_search_bars", "must be at least 1"));
        }

        let distances: [(&'static str, f64); 9] = [
            ("passive_cob_threshold", self.passive_cob_threshold),
            ("key_level_points", self.key_level_points),
            ("sl_buffer_pts", self.sl_buffer_pts),
            ("sl_max_pts", self.sl_max_pts),
            ("trail_activation_pts", self.trail_activation_pts),
            ("trail_distance_pts", self.trail_distance_pts),
            ("tp_buffer_pts_cob", self.tp_buffer_pts_cob),
            ("cob_near_key_pts", self.cob_near_key_pts),
            ("min_tp_pts_above_entry", self.min_tp_pts_above_entry),
        ];
        for (key, value) in distances {
            if !value.is_finite() || value < 0.0 {
                return Err(invalid(key, "must be a finite, non-negative number"));
            }
        }
        if !(self.sl_points_fallback > 0.0) {
            return Err(invalid("sl_points_fallback", "must be positive"));
        }

        Ok(())
    }

    /// Number of bars covered by the aggressive-volume window
    pub fn aggressive_window_bars(&self) -> usize {
        ((self.aggressive_window_seconds / self.bar_seconds) as usize).max(1)
    }

    /// Minimum break beyond a swing pivot, in price
    pub fn min_break(&self) -> f64 {
        self.bos_min_break_ticks as f64 * self.tick_size
    }
}
