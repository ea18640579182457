//! # Structured Logging
//!
//! Installs the global `tracing` subscriber for processes embedding the
//! classifier. Libraries only emit events; binaries call [`init_logging`].

use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use tracing_appender::non_blocking::NonBlocking;
use tracing_appender::rolling::RollingFileAppender;
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Registry};

use crate::types::{Error, ErrorKind, Result};

// Flag to track if logging has been initialized
static LOGGING_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Configuration for the logging system
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// The log level to use (trace, debug, info, warn, error)
    pub level: String,
    /// File name stem for rolling log files
    pub file_name: String,
    /// Whether to output logs to a file
    pub file_output: bool,
    /// The directory to store log files in
    pub log_dir: Option<String>,
    /// Whether to use JSON formatting
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file_name: "error-classifier".to_string(),
            file_output: false,
            log_dir: None,
            json_format: true,
        }
    }
}

/// Initializes the structured logging system. Later calls are no-ops.
pub fn init_logging(config: Option<LoggingConfig>) -> Result<()> {
    if LOGGING_INITIALIZED.swap(true, Ordering::SeqCst) {
        return Ok(());
    }

    let config = config.unwrap_or_default();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("warn,error_classifier={}", config.level)));

    let file_layer = match (config.file_output, config.log_dir.as_deref()) {
        (true, Some(log_dir)) => {
            let file_appender = RollingFileAppender::new(
                tracing_appender::rolling::Rotation::DAILY,
                log_dir,
                format!("{}.log", config.file_name),
            );
            let (non_blocking, guard) = NonBlocking::new(file_appender);

            // Keep the guard alive for the lifetime of the program
            Box::leak(Box::new(guard));

            Some(fmt::layer().with_writer(non_blocking).with_ansi(false))
        }
        _ => None,
    };

    let (json_layer, text_layer) = if config.json_format {
        let layer = fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_target(true);
        (Some(layer), None)
    } else {
        (None, Some(fmt::layer().with_target(true).with_thread_names(true)))
    };

    let subscriber = Registry::default()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .with(file_layer);

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        LOGGING_INITIALIZED.store(false, Ordering::SeqCst);
        return Err(Error::new(
            ErrorKind::Configuration,
            format!("Failed to set global subscriber: {}", e),
        ));
    }

    tracing::info!(
        level = %config.level,
        json = config.json_format,
        file_output = config.file_output,
        "Structured logging initialized"
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logging_config_from_partial_json() {
        let cfg: LoggingConfig = serde_json::from_str(r#"{ "level": "debug" }"#).unwrap();
        assert_eq!(cfg.level, "debug");
        assert!(cfg.json_format);
        assert!(!cfg.file_output);
    }
}
