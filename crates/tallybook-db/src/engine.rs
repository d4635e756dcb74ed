//! Contract between the bootstrap components and the encrypted storage engine.

use crate::error::Result;
use async_trait::async_trait;
use std::path::Path;
use tallybook_keys::SecretBuffer;

/// How the engine should interpret key bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyFormat {
    /// 32 raw key bytes, used directly as the cipher key.
    Raw,
    /// ASCII passphrase run through the engine's KDF (legacy databases).
    Passphrase,
}

/// A borrowed key for a single engine call.
///
/// The engine never takes ownership of key bytes; the caller wipes the
/// underlying [`SecretBuffer`] once the call returns.
#[derive(Debug, Clone, Copy)]
pub struct StoreKey<'a> {
    /// Key material.
    pub secret: &'a SecretBuffer,
    /// Interpretation of `secret`.
    pub format: KeyFormat,
}

impl<'a> StoreKey<'a> {
    /// A raw 256-bit key.
    #[must_use]
    pub fn raw(secret: &'a SecretBuffer) -> Self {
        Self {
            secret,
            format: KeyFormat::Raw,
        }
    }

    /// A passphrase key.
    #[must_use]
    pub fn passphrase(secret: &'a SecretBuffer) -> Self {
        Self {
            secret,
            format: KeyFormat::Passphrase,
        }
    }
}

/// Encrypted storage engine.
///
/// Only [`DatabaseBootstrapper`](crate::DatabaseBootstrapper) and
/// [`LegacyMigrationEngine`](crate::LegacyMigrationEngine) call these methods.
#[async_trait]
pub trait StorageEngine: Send + Sync + 'static {
    /// Open handle to the store.
    type Handle: Send + Sync + 'static;

    /// Open (creating if absent) the store at `path`.
    ///
    /// Must fail if `key` does not decrypt an existing file.
    async fn open(&self, path: &Path, key: StoreKey<'_>) -> Result<Self::Handle>;

    /// Re-encrypt the open store under `key`.
    ///
    /// Atomic: on failure the file on disk is unchanged.
    async fn rekey(&self, handle: &Self::Handle, key: StoreKey<'_>) -> Result<()>;

    /// Bring the schema up to date.
    async fn initialize_schema(&self, handle: &Self::Handle) -> Result<()>;

    /// Release the handle.
    async fn close(&self, handle: Self::Handle);
}
