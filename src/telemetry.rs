//! Logging setup for applications embedding the session client.

use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is unset.
#[must_use]
pub fn default_directive(logging: bool) -> &'static str {
    if logging {
        "housing_sales_auth=debug"
    } else {
        "warn"
    }
}

/// Install a `fmt` subscriber honoring `RUST_LOG`, falling back to
/// [`default_directive`]. Does nothing if a global subscriber already exists.
pub fn init(logging: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(logging)));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
