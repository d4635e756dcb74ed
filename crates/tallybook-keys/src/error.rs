//! Error types for key wrapping and the passphrase store.

use tallybook_core::PreferenceError;
use thiserror::Error;

/// Errors raised by the key vault and its secure key store.
#[derive(Debug, Error)]
pub enum KeyVaultError {
    /// No key pair exists under the requested alias.
    #[error("key pair '{0}' is not available")]
    KeyUnavailable(String),

    /// Ciphertext is malformed or was wrapped under a different key.
    #[error("unwrap failed: {0}")]
    UnwrapFailed(String),

    /// Wrapping the secret failed.
    #[error("wrap failed: {0}")]
    WrapFailed(String),

    /// The secure key store itself failed (locked, unreachable, denied).
    #[error("secure key store error: {0}")]
    Backend(String),
}

/// Errors raised by the passphrase store.
#[derive(Debug, Error)]
pub enum PassphraseError {
    /// No wrapped secret has been persisted yet.
    #[error("database secret has not been created")]
    SecretNotFound,

    /// The wrapped secret exists but cannot be unwrapped.
    #[error("database secret is invalid: {0}")]
    SecretInvalid(#[source] KeyVaultError),

    /// The wrapped secret record could not be written, or store state is poisoned.
    #[error("database secret record error: {0}")]
    Corrupt(String),

    /// Key vault failure outside of unwrapping (creation, wrapping, deletion).
    #[error("key vault error: {0}")]
    KeyVault(#[from] KeyVaultError),

    /// The preference area failed.
    #[error("preference store error: {0}")]
    Preferences(#[from] PreferenceError),
}

/// Result type for key vault operations.
pub type KeyVaultResult<T> = std::result::Result<T, KeyVaultError>;

/// Result type for passphrase store operations.
pub type Result<T> = std::result::Result<T, PassphraseError>;
