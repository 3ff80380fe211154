//! Logging setup for the gateway binary.
//!
//! Logs are configured before the config file is read, so that config loading itself is logged.
//! Debug logging is therefore enabled after the fact through a reload handle.

use clap::ValueEnum;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, reload, EnvFilter, Registry};

use crate::error::{Error, ErrorDetails};

const DEFAULT_DIRECTIVES: &str = "warn,gateway=info,auditlimit_internal=info";
const DEBUG_DIRECTIVES: &str = "warn,gateway=debug,auditlimit_internal=debug,tower_http=debug";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogFormat::Pretty => write!(f, "pretty"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

pub struct DelayedDebugLogs {
    handle: reload::Handle<EnvFilter, Registry>,
    /// `RUST_LOG` always wins over the config file
    from_env: bool,
}

impl DelayedDebugLogs {
    pub fn enable_debug(&self) -> Result<(), Error> {
        if self.from_env {
            tracing::info!("`RUST_LOG` is set, ignoring `gateway.debug`");
            return Ok(());
        }
        self.handle
            .modify(|filter| *filter = EnvFilter::new(DEBUG_DIRECTIVES))
            .map_err(|e| {
                Error::new(ErrorDetails::Config {
                    message: format!("Failed to enable debug logs: {e}"),
                })
            })
    }
}

pub struct DelayedLogConfig {
    pub delayed_debug_logs: DelayedDebugLogs,
}

/// Installs the global `tracing` subscriber
pub fn setup_observability(log_format: LogFormat) -> Result<DelayedLogConfig, Error> {
    let (filter, from_env) = match EnvFilter::try_from_default_env() {
        Ok(filter) => (filter, true),
        Err(_) => (EnvFilter::new(DEFAULT_DIRECTIVES), false),
    };
    let (filter, handle) = reload::Layer::new(filter);

    let json_layer = (log_format == LogFormat::Json).then(|| fmt::layer().json());
    let pretty_layer = (log_format == LogFormat::Pretty).then(fmt::layer);

    tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(pretty_layer)
        .try_init()
        .map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Failed to initialize tracing subscriber: {e}"),
            })
        })?;

    Ok(DelayedLogConfig {
        delayed_debug_logs: DelayedDebugLogs { handle, from_env },
    })
}
