//! Marquee Common Library
//!
//! Shared plumbing for the Marquee recommendation service:
//!
//! - [`config`] - Configuration loading (JSON5 format) and logging settings
//! - [`env`] - Environment variable lookups used for configuration overrides
//! - [`clock`] - Wall-clock timestamps
//! - [`error`] - Error types

pub mod clock;
pub mod config;
pub mod env;
pub mod error;

// Re-export commonly used types at the crate root
pub use clock::{current_timestamp_millis, current_timestamp_nanos};
pub use config::{LogFormat, LoggingConfig, load_config, parse_config};
pub use error::{Error, Result};

use tracing_subscriber::Layer;
use tracing_subscriber::registry::Registry;

/// Initialize tracing, optionally with an extra layer under the formatter.
///
/// Supports two output formats:
/// - `LogFormat::Text` (default): Human-readable text format
/// - `LogFormat::Json`: Structured JSON format for log aggregation systems
///
/// The extra layer sees every event that passes the level filter. It is used
/// to attach side-channel sinks such as log shippers.
///
/// # Example
///
/// ```ignore
/// use marquee_common::{LoggingConfig, LogFormat, init_tracing_with_layer};
/// use tracing_subscriber::layer::Identity;
///
/// let config = LoggingConfig {
///     level: "info".to_string(),
///     format: LogFormat::Json,
/// };
/// init_tracing_with_layer(&config, None::<Identity>)?;
/// ```
pub fn init_tracing_with_layer<L>(config: &LoggingConfig, extra: Option<L>) -> Result<()>
where
    L: Layer<Registry> + Send + Sync + 'static,
{
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    match config.format {
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(extra)
                .with(fmt::layer())
                .with(filter)
                .try_init()
                .map_err(|e| Error::Config(format!("Failed to initialize tracing: {}", e)))?;
        }
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(extra)
                .with(fmt::layer().json())
                .with(filter)
                .try_init()
                .map_err(|e| Error::Config(format!("Failed to initialize tracing: {}", e)))?;
        }
    }

    Ok(())
}
