use anyhow::Result;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Installs a global tracing subscriber.
///
/// `RUST_LOG` wins if set; otherwise falls back to `default_level` (the
/// coordinator's `LOG_LEVEL` config value).
pub fn setup_logging(default_level: &str) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_line_number(true)
                .compact(),
        )
        .with(env_filter)
        .init();

    Ok(())
}
