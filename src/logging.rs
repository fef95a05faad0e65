#![forbid(unsafe_code)]

use anyhow::{Result, anyhow};
use tracing_subscriber::EnvFilter;

pub const DEFAULT_LOG_FILTER: &str = "info,bluema_server=debug";

/// Installs the global `tracing` subscriber, writing to stderr.
///
/// `RUST_LOG` takes precedence over [`DEFAULT_LOG_FILTER`] when it parses.
pub fn init_logging() -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init()
        .map_err(|err| anyhow!("installing log subscriber: {err}"))?;

    Ok(())
}
