//! Database connection management with `SQLCipher` encryption.
//!
//! Provides an `EncryptedPool` wrapper around `SQLx` that handles `SQLCipher`
//! keying and rekeying, and [`SqlCipherEngine`], the production
//! [`StorageEngine`].

use crate::engine::{KeyFormat, StorageEngine, StoreKey};
use crate::error::{DatabaseError, Result};
use crate::{metadata, Database};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use std::str::FromStr;
use tallybook_core::StorageConfig;
use zeroize::Zeroizing;

/// Length of a raw `SQLCipher` key.
pub const RAW_KEY_LENGTH: usize = 32;

/// Key scheme recorded in `app_metadata` once the schema is initialized.
pub const KEY_SCHEME: &str = "x25519-wrapped-v1";

/// `SQLite` result code for "file is not a database", which is how
/// `SQLCipher` reports a wrong key.
const SQLITE_NOTADB: &str = "26";

/// Cipher and pool parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CipherSettings {
    /// Maximum pooled connections for the current database.
    pub max_connections: u32,
    /// `cipher_page_size` pragma.
    pub cipher_page_size: u32,
    /// `kdf_iter` pragma (passphrase keys only).
    pub kdf_iter: u32,
}

impl Default for CipherSettings {
    fn default() -> Self {
        Self::from(&StorageConfig::default())
    }
}

impl From<&StorageConfig> for CipherSettings {
    fn from(config: &StorageConfig) -> Self {
        Self {
            max_connections: config.max_connections,
            cipher_page_size: config.cipher_page_size,
            kdf_iter: config.kdf_iter,
        }
    }
}

/// Render a key as a `SQLCipher` pragma literal.
fn key_literal(key: StoreKey<'_>) -> Result<Zeroizing<String>> {
    match key.format {
        KeyFormat::Raw => {
            if key.secret.len() != RAW_KEY_LENGTH {
                return Err(DatabaseError::InvalidKey);
            }
            let hex = Zeroizing::new(hex::encode(key.secret.expose()));
            Ok(Zeroizing::new(format!("\"x'{}'\"", hex.as_str())))
        }
        KeyFormat::Passphrase => {
            let text =
                std::str::from_utf8(key.secret.expose()).map_err(|_| DatabaseError::InvalidKey)?;
            if text.is_empty() {
                return Err(DatabaseError::InvalidKey);
            }
            Ok(Zeroizing::new(format!("'{}'", text.replace('\'', "''"))))
        }
    }
}

fn is_wrong_key(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .and_then(|db| db.code())
        .is_some_and(|code| code == SQLITE_NOTADB)
}

/// Encrypted database connection pool using `SQLCipher`.
///
/// The pool does not retain key bytes; the caller wipes its [`StoreKey`]
/// buffer once [`EncryptedPool::open`] returns.
#[derive(Debug)]
pub struct EncryptedPool {
    pool: Pool<Sqlite>,
}

impl EncryptedPool {
    /// Open (or create) an encrypted database and verify the key.
    ///
    /// # Arguments
    /// * `path` - Path to the `SQLite` database file (or `:memory:` for in-memory)
    /// * `key` - Raw 32-byte key or legacy passphrase
    /// * `settings` - Cipher and pool parameters
    ///
    /// # Errors
    /// Returns `DatabaseError` if:
    /// - The database file cannot be opened
    /// - `SQLCipher` pragmas fail to execute, or the linked `SQLite` has no
    ///   `SQLCipher` support (`Encryption`)
    /// - The key is malformed or does not decrypt the file (`InvalidKey`)
    pub async fn open(
        path: impl AsRef<Path>,
        key: StoreKey<'_>,
        settings: &CipherSettings,
    ) -> Result<Self> {
        let literal = key_literal(key)?;
        let path_str = path.as_ref().to_str().ok_or_else(|| {
            DatabaseError::Open("invalid database path: not valid UTF-8".to_string())
        })?;

        let connect_options = SqliteConnectOptions::from_str(path_str)
            .map_err(|e| DatabaseError::Open(format!("invalid connection string: {e}")))?
            .pragma("key", literal.to_string())
            .pragma("cipher_page_size", settings.cipher_page_size.to_string())
            .pragma("kdf_iter", settings.kdf_iter.to_string())
            .pragma("cipher_hmac_algorithm", "HMAC_SHA512")
            .pragma("cipher_kdf_algorithm", "PBKDF2_HMAC_SHA512")
            .journal_mode(SqliteJournalMode::Delete)
            .create_if_missing(true);

        // Legacy files are only opened to be rekeyed, which must happen on the
        // single connection that knows the old key.
        let max_connections = match key.format {
            KeyFormat::Raw => settings.max_connections.max(1),
            KeyFormat::Passphrase => 1,
        };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(connect_options)
            .await
            .map_err(|e| {
                if is_wrong_key(&e) {
                    DatabaseError::InvalidKey
                } else {
                    DatabaseError::Encryption(format!("failed to initialize encrypted pool: {e}"))
                }
            })?;

        let pool = Self { pool };
        let checked = match pool.cipher_version().await {
            Ok(_) => pool.verify_key().await,
            Err(e) => Err(e),
        };
        if let Err(e) = checked {
            pool.close().await;
            return Err(e);
        }

        tracing::info!(path = %path_str, format = ?key.format, "Encrypted database opened");
        Ok(pool)
    }

    /// Get a reference to the underlying `SQLx` pool.
    #[must_use]
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    /// Re-encrypt the database under `key`.
    ///
    /// `SQLCipher` rewrites every page inside one transaction, so a failure
    /// leaves the file under its old key. Other pooled connections keep the
    /// old key; close the pool after rekeying.
    pub async fn rekey(&self, key: StoreKey<'_>) -> Result<()> {
        let literal = key_literal(key)?;
        let statement = Zeroizing::new(format!("PRAGMA rekey = {}", literal.as_str()));

        let mut conn = self.pool.acquire().await?;
        sqlx::query(statement.as_str())
            .persistent(false)
            .execute(&mut *conn)
            .await
            .map_err(|e| DatabaseError::Rekey(e.to_string()))?;

        sqlx::query_scalar::<_, i64>("SELECT count(*) FROM sqlite_master")
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| DatabaseError::Rekey(format!("verification after rekey: {e}")))?;

        tracing::info!("Encrypted database rekeyed");
        Ok(())
    }

    /// Close the connection pool gracefully.
    pub async fn close(self) {
        self.pool.close().await;
        tracing::debug!("Encrypted database pool closed");
    }

    /// Version of the linked `SQLCipher` library.
    ///
    /// # Errors
    /// Returns `DatabaseError::Encryption` when `SQLite` was built without
    /// `SQLCipher`, in which case the key pragmas are silently ignored.
    pub async fn cipher_version(&self) -> Result<String> {
        let version: Option<String> = sqlx::query_scalar("PRAGMA cipher_version")
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| DatabaseError::Encryption(format!("query cipher_version: {e}")))?;

        let version = version.ok_or_else(|| {
            DatabaseError::Encryption("linked SQLite has no SQLCipher support".to_string())
        })?;
        tracing::debug!(cipher_version = %version, "SQLCipher available");
        Ok(version)
    }

    /// Verify that the database is readable with the provided key.
    ///
    /// # Errors
    /// Returns `DatabaseError::InvalidKey` if the key is incorrect or the database is corrupted.
    pub async fn verify_key(&self) -> Result<()> {
        sqlx::query_scalar::<_, i64>("SELECT count(*) FROM sqlite_master")
            .fetch_one(&self.pool)
            .await
            .map_err(|_| DatabaseError::InvalidKey)?;

        Ok(())
    }
}

/// [`StorageEngine`] backed by `SQLCipher` through `SQLx`.
#[derive(Debug, Clone, Default)]
pub struct SqlCipherEngine {
    settings: CipherSettings,
}

impl SqlCipherEngine {
    /// Create an engine with explicit cipher settings.
    #[must_use]
    pub fn new(settings: CipherSettings) -> Self {
        Self { settings }
    }

    /// Cipher settings in use.
    #[must_use]
    pub fn settings(&self) -> &CipherSettings {
        &self.settings
    }
}

#[async_trait]
impl StorageEngine for SqlCipherEngine {
    type Handle = Database;

    async fn open(&self, path: &Path, key: StoreKey<'_>) -> Result<Database> {
        let pool = EncryptedPool::open(path, key, &self.settings).await?;
        Ok(Database::from_encrypted_pool(pool))
    }

    async fn rekey(&self, handle: &Database, key: StoreKey<'_>) -> Result<()> {
        handle.encrypted_pool().rekey(key).await
    }

    async fn initialize_schema(&self, handle: &Database) -> Result<()> {
        handle.run_migrations().await?;
        metadata::set_metadata(
            handle.pool(),
            metadata::KEY_SCHEME_KEY,
            &serde_json::Value::from(KEY_SCHEME),
        )
        .await?;
        Ok(())
    }

    async fn close(&self, handle: Database) {
        handle.close().await;
    }
}
