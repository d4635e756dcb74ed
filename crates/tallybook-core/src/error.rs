//! Core error types for the Tallybook application.
//!
//! Configuration and preference-store failures live here because every
//! other crate in the workspace depends on them.

use thiserror::Error;

/// Configuration-specific errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Failed to determine config directory path
    #[error("could not determine config directory (XDG base directories not available)")]
    NoConfigDir,

    /// Failed to parse TOML
    #[error("failed to parse config TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Failed to serialize config
    #[error("failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),

    /// I/O error reading/writing config
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid configuration value
    #[error("invalid config value for {field}: {reason}")]
    InvalidValue {
        /// Field name
        field: String,
        /// Reason for invalidity
        reason: String,
    },
}

/// Errors raised by a [`crate::PreferenceStore`].
#[derive(Error, Debug)]
pub enum PreferenceError {
    /// Reading or writing the backing file failed.
    #[error("preference I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The backing file could not be encoded.
    #[error("preference encoding error: {0}")]
    Json(#[from] serde_json::Error),

    /// The backing file exists but does not hold a preference document.
    #[error("preference file {} is corrupt: {reason}", .path.display())]
    Corrupt {
        /// Backing file.
        path: std::path::PathBuf,
        /// Parser message.
        reason: String,
    },

    /// The in-process lock guarding the store was poisoned.
    #[error("preference store lock poisoned")]
    Poisoned,
}

/// Result type alias for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Result type alias for preference operations.
pub type PreferenceResult<T> = std::result::Result<T, PreferenceError>;
