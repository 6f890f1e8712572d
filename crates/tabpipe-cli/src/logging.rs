use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Structured logs on stderr; stdout is reserved for JSON output.
///
/// Filter from `TABPIPE_LOG`, then `RUST_LOG`, else `info`.
pub(crate) fn init() {
    let filter = std::env::var("TABPIPE_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .and_then(|s| EnvFilter::try_new(s).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new("info"));

    let console = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true);

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .try_init();
}
