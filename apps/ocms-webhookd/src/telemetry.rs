//! Telemetry initialization (logging)

use anyhow::{Context, Result};
use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Resolved logging options
#[derive(Debug, Clone)]
pub struct TelemetryOptions {
    pub level: String,
    pub json: bool,
}

/// Initialize logging; `RUST_LOG` wins over the configured level
pub fn init_telemetry(options: &TelemetryOptions) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&options.level))
        .context("Failed to create environment filter")?;

    if options.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json().with_target(true))
            .try_init()
            .context("Failed to install tracing subscriber")?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().pretty().with_target(true).with_line_number(true))
            .try_init()
            .context("Failed to install tracing subscriber")?;
    }

    Ok(())
}

/// Helper to get the current log level
pub fn get_log_level(level_str: &str) -> Level {
    match level_str.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_log_level() {
        assert_eq!(get_log_level("trace"), Level::TRACE);
        assert_eq!(get_log_level("DEBUG"), Level::DEBUG);
        assert_eq!(get_log_level("info"), Level::INFO);
        assert_eq!(get_log_level("warn"), Level::WARN);
        assert_eq!(get_log_level("error"), Level::ERROR);
        assert_eq!(get_log_level("verbose"), Level::INFO);
    }
}
