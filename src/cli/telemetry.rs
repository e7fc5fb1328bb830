//! Tracing subscriber setup.
//!
//! Verbosity comes from the CLI (`-v` flags or `INGRESSO_LOG_LEVEL`); the
//! `RUST_LOG` env filter still wins when set, so per-module overrides work
//! the usual way. `INGRESSO_LOG_FORMAT=json` switches to line-delimited JSON
//! for collectors.

use anyhow::{Context, Result};
use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

pub fn init(level: Option<Level>) -> Result<()> {
    let default_directive = level.unwrap_or(Level::ERROR).to_string();
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&default_directive))
        .context("failed to build log filter")?;

    let json = std::env::var("INGRESSO_LOG_FORMAT")
        .map(|format| format.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        Registry::default()
            .with(filter)
            .with(fmt::layer().json().with_current_span(true))
            .try_init()
            .context("failed to initialize JSON logging")?;
    } else {
        Registry::default()
            .with(filter)
            .with(fmt::layer())
            .try_init()
            .context("failed to initialize logging")?;
    }

    Ok(())
}
