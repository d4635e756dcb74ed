//! Database and bootstrap error types.

use tallybook_core::PreferenceError;
use tallybook_keys::PassphraseError;
use thiserror::Error;

/// Storage engine errors.
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Failed to open or create the database file.
    #[error("failed to open database: {0}")]
    Open(String),

    /// Failed to configure database encryption.
    #[error("encryption configuration failed: {0}")]
    Encryption(String),

    /// The key does not decrypt the database, or is malformed.
    #[error("invalid encryption key")]
    InvalidKey,

    /// Re-encrypting the database under a new key failed.
    #[error("rekey failed: {0}")]
    Rekey(String),

    /// Migration execution failed.
    #[error("migration failed: {0}")]
    Migration(String),

    /// Serialization/deserialization failed.
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// Underlying `SQLx` error.
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// I/O error during database operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for database operations.
pub type Result<T> = std::result::Result<T, DatabaseError>;

/// Errors surfaced by [`DatabaseBootstrapper`](crate::DatabaseBootstrapper).
#[derive(Debug, Error)]
pub enum BootstrapError {
    /// The database secret is missing or cannot be unwrapped.
    #[error("database secret unavailable: {0}")]
    Secret(#[from] PassphraseError),

    /// The store cannot be opened with the current secret.
    #[error("bootstrap failed: {0}")]
    BootstrapFailed(String),

    /// The operation requires the store to be closed.
    #[error("database is already open")]
    AlreadyOpen,

    /// Filesystem operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Preference area failed.
    #[error("preference store error: {0}")]
    Preferences(#[from] PreferenceError),
}

impl BootstrapError {
    /// Whether recovery needs the explicit, user-initiated secret reset.
    #[must_use]
    pub fn requires_reset(&self) -> bool {
        matches!(self, Self::Secret(PassphraseError::SecretInvalid(_)))
    }
}

impl From<DatabaseError> for BootstrapError {
    fn from(err: DatabaseError) -> Self {
        Self::BootstrapFailed(err.to_string())
    }
}

/// Result type alias for bootstrap operations.
pub type BootstrapResult<T> = std::result::Result<T, BootstrapError>;
