// sqlmaster/crates/sqlmaster-client/src/telemetry.rs

use tracing_subscriber::{fmt, EnvFilter};

/// Client events at `info`, dependencies (reqwest, hyper, r2d2) only when they warn.
pub const DEFAULT_LOG_FILTER: &str = "warn,sqlmaster_client=info,sqlmaster=info";

/// Builds the filter from a `RUST_LOG`-style directive string, falling back to
/// [`DEFAULT_LOG_FILTER`] when it is absent or does not parse.
pub fn log_filter(directives: Option<&str>) -> EnvFilter {
    directives
        .filter(|d| !d.trim().is_empty())
        .and_then(|d| EnvFilter::try_new(d).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_LOG_FILTER))
}

/// Installs the global subscriber on stderr so stdout stays free for answers
/// and tables. Returns `false` if a subscriber was already installed.
pub fn init_tracing() -> bool {
    let directives = std::env::var("RUST_LOG").ok();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(log_filter(directives.as_deref()))
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .with_target(true)
        .with_writer(std::io::stderr)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber).is_ok()
}
