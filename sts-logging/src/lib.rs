//! Structured logging setup for the token service and its tools

use serde::Deserialize;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Output format of the log stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// One JSON object per line (production)
    #[default]
    Json,
    /// Human-readable lines (development)
    Console,
}

impl LogFormat {
    /// Parse a format name, falling back to JSON for anything unknown
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "console" | "pretty" | "text" => LogFormat::Console,
            _ => LogFormat::Json,
        }
    }
}

fn env_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// Initialize logging in the requested format.
///
/// `RUST_LOG` wins over `default_level` when it is set. Calling this twice
/// in one process is a no-op for the second call.
pub fn init(service_name: &str, default_level: &str, format: LogFormat) {
    let initialized = match format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(env_filter(default_level))
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_file(true)
                    .with_line_number(true)
                    .with_current_span(false)
                    .with_span_list(false),
            )
            .try_init()
            .is_ok(),
        LogFormat::Console => tracing_subscriber::fmt()
            .with_env_filter(env_filter(default_level))
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .try_init()
            .is_ok(),
    };

    if initialized {
        tracing::info!(service = service_name, format = ?format, "Logging initialized");
    }
}

/// Initialize JSON logging (for production)
pub fn init_logging(service_name: &str, default_level: &str) {
    init(service_name, default_level, LogFormat::Json);
}

/// Initialize console logging (for development)
pub fn init_console_logging(service_name: &str, default_level: &str) {
    init(service_name, default_level, LogFormat::Console);
}
