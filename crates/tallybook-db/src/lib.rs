//! Tallybook Database Layer
//!
//! Opens the single encrypted `SQLite`/`SQLCipher` store the invoicing
//! application keeps its data in, and migrates databases still protected by
//! the legacy hardcoded passphrase to the wrapped-secret scheme.
//!
//! # Architecture
//!
//! - **Bootstrap**: [`DatabaseBootstrapper`] is the only entry point. It runs
//!   secret creation, legacy migration and the store open exactly once per
//!   process and hands every caller the same [`Arc`](std::sync::Arc) handle
//! - **Engine**: [`StorageEngine`] is the narrow contract the bootstrap needs;
//!   [`SqlCipherEngine`] implements it over `SQLx`
//! - **Migrations**: SQL migrations are embedded and versioned using `SQLx`
//! - **Diagnostics**: [`MigrationStatusStore`] records the last legacy
//!   migration outcome and backup location
//!
//! # Example
//!
//! ```ignore
//! use tallybook_db::{DatabaseBootstrapper, SqlCipherEngine};
//!
//! let bootstrapper = DatabaseBootstrapper::new(engine, passphrase, migration, db_path);
//! let db = bootstrapper.database().await?;
//! let mut tx = db.begin().await?;
//! ```
//!
//! # Design Principles
//!
//! - Domain repositories receive only the opened [`Database`]; they never see
//!   secret bytes, the wrapped secret or migration status
//! - Legacy migration is best-effort and never prevents the store from opening
//! - Key bytes are borrowed by the engine and wiped by whoever unwrapped them

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

pub mod bootstrap;
pub mod connection;
pub mod engine;
pub mod error;
pub mod legacy;
pub mod metadata;
pub mod migrations;
pub mod status;

#[cfg(test)]
mod test_support;

// Re-export commonly used types
pub use bootstrap::{BootstrapPhase, DatabaseBootstrapper};
pub use connection::{CipherSettings, EncryptedPool, SqlCipherEngine};
pub use engine::{KeyFormat, StorageEngine, StoreKey};
pub use error::{BootstrapError, BootstrapResult, DatabaseError, Result};
pub use legacy::{LegacyMigrationEngine, LEGACY_PASSPHRASE};
pub use status::{MigrationReport, MigrationStatusStore};

use std::path::Path;

/// Opened encrypted store handed to domain repositories.
#[derive(Debug)]
pub struct Database {
    pool: EncryptedPool,
}

impl Database {
    /// Open an encrypted database.
    ///
    /// # Arguments
    /// * `path` - Path to the database file (or `:memory:` for in-memory)
    /// * `key` - Key the file is encrypted under
    /// * `settings` - Cipher and pool parameters
    pub async fn open(
        path: impl AsRef<Path>,
        key: StoreKey<'_>,
        settings: &CipherSettings,
    ) -> Result<Self> {
        let pool = EncryptedPool::open(path, key, settings).await?;
        Ok(Self { pool })
    }

    /// Wrap an already opened encrypted pool.
    #[must_use]
    pub fn from_encrypted_pool(pool: EncryptedPool) -> Self {
        Self { pool }
    }

    /// Run all pending database migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        migrations::run_migrations(self.pool.pool()).await
    }

    /// Get the current schema version.
    pub async fn get_schema_version(&self) -> Result<i64> {
        migrations::get_schema_version(self.pool.pool()).await
    }

    /// Get a reference to the underlying connection pool.
    #[must_use]
    pub fn pool(&self) -> &sqlx::Pool<sqlx::Sqlite> {
        self.pool.pool()
    }

    /// Get a reference to the encrypted pool.
    #[must_use]
    pub fn encrypted_pool(&self) -> &EncryptedPool {
        &self.pool
    }

    /// Start a transaction.
    pub async fn begin(&self) -> Result<sqlx::Transaction<'static, sqlx::Sqlite>> {
        Ok(self.pool.pool().begin().await?)
    }

    /// Read a value from `app_metadata`.
    pub async fn get_metadata(&self, key: &str) -> Result<Option<serde_json::Value>> {
        metadata::get_metadata(self.pool.pool(), key).await
    }

    /// Write a value to `app_metadata`.
    pub async fn set_metadata(&self, key: &str, value: &serde_json::Value) -> Result<()> {
        metadata::set_metadata(self.pool.pool(), key, value).await
    }

    /// Verify that the database is readable with the key it was opened with.
    pub async fn verify_key(&self) -> Result<()> {
        self.pool.verify_key().await
    }

    /// Close the database connection gracefully.
    pub async fn close(self) {
        self.pool.close().await;
    }
}
