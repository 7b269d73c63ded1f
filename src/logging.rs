//! Tracing setup shared by the binaries

use tracing_subscriber::EnvFilter;

/// Install a fmt subscriber. `RUST_LOG` overrides the default directives.
pub fn init(default_directives: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives));

    // A second init (tests, embedding) keeps the first subscriber
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
