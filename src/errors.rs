//! Error types for seismoalarm.
//!
//! Uses `thiserror` for library-style error definitions.

use thiserror::Error;

/// Errors that can occur in seismoalarm operations.
#[derive(Error, Debug)]
pub enum SeismoalarmError {
    /// HTTP request failed
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Feed endpoint returned an error status
    #[error("feed error (HTTP {status}): {message}")]
    Api { status: u16, message: String },

    /// Feed document could not be used
    #[error("unusable feed document: {0}")]
    Feed(String),

    /// Storage engine failure
    #[error("storage error: {0}")]
    Store(#[from] rusqlite::Error),

    /// Filesystem or stream failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding failed
    #[error("failed to encode JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML configuration could not be parsed
    #[error("failed to parse configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Configuration is missing or inconsistent
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Convenience alias for results carrying [`SeismoalarmError`].
pub type Result<T> = std::result::Result<T, SeismoalarmError>;
