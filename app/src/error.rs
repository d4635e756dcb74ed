//! Error type returned by the user-facing commands.

use serde::Serialize;
use std::fmt;
use tallybook_core::{ConfigError, PreferenceError};
use tallybook_db::{BootstrapError, DatabaseError};
use tallybook_keys::PassphraseError;

/// Serializable error for the command surface.
#[derive(Debug, Serialize)]
pub struct CommandError {
    /// Error code for frontend handling (e.g., "SECRET_INVALID")
    pub code: String,
    /// User-friendly error message
    pub message: String,
    /// Optional debugging context (never contains key material)
    pub details: Option<serde_json::Value>,
}

impl CommandError {
    /// Create a new command error.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    /// Create a command error with details.
    pub fn with_details(
        code: impl Into<String>,
        message: impl Into<String>,
        details: serde_json::Value,
    ) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: Some(details),
        }
    }

    /// Whether the user must go through the explicit secret reset.
    #[must_use]
    pub fn reset_required(&self) -> bool {
        self.details
            .as_ref()
            .and_then(|d| d.get("reset_required"))
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false)
    }
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for CommandError {}

impl From<PassphraseError> for CommandError {
    fn from(err: PassphraseError) -> Self {
        match err {
            PassphraseError::SecretNotFound => Self::new(
                "SECRET_NOT_FOUND",
                "The database secret has not been created yet",
            ),
            PassphraseError::SecretInvalid(cause) => Self::with_details(
                "SECRET_INVALID",
                "The database secret can no longer be unlocked on this device. \
                 Reset it to start with an empty database; the old file is kept as a backup.",
                serde_json::json!({ "reset_required": true, "cause": cause.to_string() }),
            ),
            PassphraseError::Corrupt(msg) => Self::new(
                "SECRET_CORRUPT",
                format!("The database secret record could not be written: {msg}"),
            ),
            PassphraseError::KeyVault(err) => {
                Self::new("KEY_STORE_ERROR", format!("Secure key store error: {err}"))
            }
            PassphraseError::Preferences(err) => err.into(),
        }
    }
}

impl From<BootstrapError> for CommandError {
    fn from(err: BootstrapError) -> Self {
        match err {
            BootstrapError::Secret(err) => err.into(),
            BootstrapError::BootstrapFailed(msg) => Self::new(
                "BOOTSTRAP_FAILED",
                format!("The database could not be opened: {msg}"),
            ),
            BootstrapError::AlreadyOpen => Self::new(
                "ALREADY_OPEN",
                "The database is open; restart the application before resetting",
            ),
            BootstrapError::Io(err) => err.into(),
            BootstrapError::Preferences(err) => err.into(),
        }
    }
}

impl From<DatabaseError> for CommandError {
    fn from(err: DatabaseError) -> Self {
        Self::new("DATABASE_ERROR", format!("Database error: {err}"))
    }
}

impl From<PreferenceError> for CommandError {
    fn from(err: PreferenceError) -> Self {
        Self::new("PREFERENCES_ERROR", format!("Preference store error: {err}"))
    }
}

impl From<ConfigError> for CommandError {
    fn from(err: ConfigError) -> Self {
        Self::new("CONFIG_ERROR", format!("Configuration error: {err}"))
    }
}

/// Convert `std::io::Error` to `CommandError`.
impl From<std::io::Error> for CommandError {
    fn from(err: std::io::Error) -> Self {
        Self::new("FILESYSTEM_ERROR", format!("Filesystem error: {err}"))
    }
}
