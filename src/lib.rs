// Library crate - bar aggregation, setup detection and session plumbing

pub mod config;
pub mod logging;
pub mod session;
pub mod sink;
pub mod streams;
pub mod trading_core;
pub mod types;

// Re-export commonly used types
pub use config::{ConfigError, StrategyParams};
pub use types::*;
