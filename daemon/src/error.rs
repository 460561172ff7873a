/// Error taxonomy for the daemon.
///
/// Each category has its own propagation rule:
///   - [`ConfigError`]    fatal, raised before the monitor starts.
///   - [`SourceError`]    transient once polling runs; fatal only during initialization.
///   - [`DeliveryError`]  per notification; logged and dropped.
///   - [`TransportError`] raised by the messaging transport, wrapped by the above.
///   - [`MonitorError`]   lifecycle failures surfaced to the caller.
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::status_parser::StatusParseError;

/// Invalid or missing configuration. Always fatal.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("failed to read env file {path}: {source}")]
    EnvFile {
        path: PathBuf,
        #[source]
        source: dotenvy::Error,
    },

    #[error("missing required setting `{field}` (set it in the config file or via ${env})")]
    Missing {
        field: &'static str,
        env: &'static str,
    },

    #[error("invalid setting `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// A single sample of the status source failed.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("status source {location} is unavailable: {source}")]
    Unavailable {
        location: String,
        #[source]
        source: std::io::Error,
    },

    #[error("status source {location} did not respond within {after:?}")]
    TimedOut { location: String, after: Duration },

    #[error("status source {location} holds malformed state: {source}")]
    Malformed {
        location: String,
        #[source]
        source: StatusParseError,
    },
}

/// Monitor lifecycle failures.
#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("monitor initialization failed: {0}")]
    InitializationFailed(#[source] SourceError),

    #[error("monitor has been stopped")]
    Stopped,
}

/// Failure talking to the messaging transport.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("request timed out")]
    Timeout,

    #[error("API rejected the request ({code}): {description}")]
    Api { code: i64, description: String },

    #[error("failed to decode API response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        // Request URLs embed the bot token.
        let err = err.without_url();
        if err.is_timeout() {
            TransportError::Timeout
        } else if err.is_connect() {
            TransportError::Connection(err.to_string())
        } else if err.is_decode() {
            TransportError::Decode(err.to_string())
        } else {
            TransportError::Http(err.to_string())
        }
    }
}

/// A change event could not be delivered to one subscription.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("delivery timed out after {0:?}")]
    TimedOut(Duration),

    #[error("subscription was cancelled")]
    Cancelled,
}
