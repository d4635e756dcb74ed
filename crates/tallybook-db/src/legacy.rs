//! One-shot migration of a database still encrypted under the legacy passphrase.
//!
//! Earlier releases keyed the database with a fixed passphrase compiled into
//! the app. On the first launch of this version the file is backed up,
//! opened with that passphrase and rekeyed in place to the secret held by the
//! [`PassphraseStore`]. Every failure is recorded and swallowed: the app must
//! still start, and the bootstrapper then opens the file with the current
//! secret.
//!
//! The legacy passphrase is used for exactly one thing, the open in step 3.
//! It is never a fallback key.

use crate::engine::{StorageEngine, StoreKey};
use crate::error::DatabaseError;
use crate::status::MigrationStatusStore;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tallybook_core::{MigrationStatus, Timestamp};
use tallybook_keys::{PassphraseStore, SecretBuffer};
use thiserror::Error;
use tokio::sync::OnceCell;
use zeroize::Zeroizing;

/// Passphrase that protected databases created by releases before key wrapping.
pub const LEGACY_PASSPHRASE: &str = "tallybook-local-store-v1";

#[derive(Debug, Error)]
enum MigrationError {
    #[error("legacy database could not be opened: {0}")]
    LegacyOpenFailed(#[source] DatabaseError),

    #[error("current secret unavailable: {0}")]
    SecretUnavailable(String),

    #[error("rekey failed: {0}")]
    RekeyFailed(#[source] DatabaseError),
}

/// Upgrades a legacy-keyed database to the wrapped-secret scheme.
pub struct LegacyMigrationEngine<E: StorageEngine> {
    engine: Arc<E>,
    passphrase: Arc<PassphraseStore>,
    status: MigrationStatusStore,
    backup_dir: PathBuf,
    legacy_secret: Zeroizing<Vec<u8>>,
    enabled: bool,
    outcome: OnceCell<MigrationStatus>,
}

impl<E: StorageEngine> std::fmt::Debug for LegacyMigrationEngine<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LegacyMigrationEngine")
            .field("database", &self.passphrase.database_path())
            .field("backup_dir", &self.backup_dir)
            .field("enabled", &self.enabled)
            .field("outcome", &self.outcome.get())
            .finish_non_exhaustive()
    }
}

impl<E: StorageEngine> LegacyMigrationEngine<E> {
    /// Create an engine for the database guarded by `passphrase`.
    ///
    /// # Arguments
    /// * `engine` - Storage engine used to open and rekey the file
    /// * `passphrase` - Source of the current secret
    /// * `status` - Diagnostics record
    /// * `backup_dir` - Directory receiving the pre-migration copy
    pub fn new(
        engine: Arc<E>,
        passphrase: Arc<PassphraseStore>,
        status: MigrationStatusStore,
        backup_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            engine,
            passphrase,
            status,
            backup_dir: backup_dir.into(),
            legacy_secret: Zeroizing::new(LEGACY_PASSPHRASE.as_bytes().to_vec()),
            enabled: true,
            outcome: OnceCell::new(),
        }
    }

    /// Enable or disable migration. A disabled engine reports the recorded status.
    #[must_use]
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Use a different legacy passphrase.
    #[must_use]
    pub fn with_legacy_secret(mut self, secret: impl Into<Vec<u8>>) -> Self {
        self.legacy_secret = Zeroizing::new(secret.into());
        self
    }

    /// Directory backups are written to.
    #[must_use]
    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    /// Diagnostics record this engine writes to.
    #[must_use]
    pub fn status_store(&self) -> &MigrationStatusStore {
        &self.status
    }

    /// Attempt the migration and return its outcome.
    ///
    /// Runs at most once per engine; later calls return the first outcome.
    /// Never fails: errors are logged and recorded as
    /// [`MigrationStatus::Failure`].
    pub async fn try_migrate(&self) -> MigrationStatus {
        *self.outcome.get_or_init(|| self.attempt()).await
    }

    async fn attempt(&self) -> MigrationStatus {
        if !self.enabled {
            tracing::info!("Legacy database migration disabled");
            return self.recorded_status();
        }

        let database = self.passphrase.database_path();
        let exists = match tokio::fs::try_exists(database).await {
            Ok(exists) => exists,
            Err(e) => {
                tracing::warn!(error = %e, "Cannot probe database file; skipping migration");
                self.record(MigrationStatus::Failure);
                return MigrationStatus::Failure;
            }
        };

        if !exists {
            tracing::info!("No legacy database found");
            self.record(MigrationStatus::NoDatabase);
            return MigrationStatus::NoDatabase;
        }

        match self.passphrase.is_bound() {
            Ok(true) => {
                tracing::debug!("Database already uses the current secret");
                return self.recorded_status();
            }
            Ok(false) => {}
            Err(e) => tracing::warn!(error = %e, "Cannot read secret binding; attempting migration"),
        }

        let status = match self.migrate(database).await {
            Ok(()) => {
                tracing::info!("Legacy database migrated to the wrapped secret");
                MigrationStatus::Success
            }
            Err(e) => {
                tracing::warn!(error = %e, "Legacy database migration failed; continuing");
                MigrationStatus::Failure
            }
        };
        self.record(status);
        status
    }

    async fn migrate(&self, database: &Path) -> Result<(), MigrationError> {
        // Best effort, but always before anything that could modify the file.
        match self.create_backup(database).await {
            Ok(backup) => {
                tracing::info!(backup = %backup.display(), "Legacy database backed up");
                if let Err(e) = self.status.set_backup_dir(Some(&self.backup_dir)) {
                    tracing::warn!(error = %e, "Failed to record backup directory");
                }
            }
            Err(e) => tracing::warn!(error = %e, "Legacy database backup failed; continuing"),
        }

        let mut legacy = SecretBuffer::from_slice(&self.legacy_secret);
        let opened = self
            .engine
            .open(database, StoreKey::passphrase(&legacy))
            .await;
        legacy.wipe();
        let handle = opened.map_err(MigrationError::LegacyOpenFailed)?;

        let mut secret = match self.current_secret().await {
            Ok(secret) => secret,
            Err(e) => {
                self.engine.close(handle).await;
                return Err(e);
            }
        };
        let rekeyed = self.engine.rekey(&handle, StoreKey::raw(&secret)).await;
        secret.wipe();
        self.engine.close(handle).await;
        rekeyed.map_err(MigrationError::RekeyFailed)?;

        if let Err(e) = self.passphrase.mark_bound() {
            tracing::warn!(error = %e, "Failed to record secret binding");
        }
        Ok(())
    }

    async fn current_secret(&self) -> Result<SecretBuffer, MigrationError> {
        let store = Arc::clone(&self.passphrase);
        tokio::task::spawn_blocking(move || {
            store.ensure_secret_exists()?;
            store.get_raw_secret()
        })
        .await
        .map_err(|e| MigrationError::SecretUnavailable(format!("secret task failed: {e}")))?
        .map_err(|e| MigrationError::SecretUnavailable(e.to_string()))
    }

    async fn create_backup(&self, database: &Path) -> std::io::Result<PathBuf> {
        let name = database
            .file_name()
            .map_or_else(|| "database".into(), |n| n.to_string_lossy());
        let backup = self
            .backup_dir
            .join(format!("{name}_backup_{}", Timestamp::now().to_file_stamp()));

        tokio::fs::create_dir_all(&self.backup_dir).await?;
        tokio::fs::copy(database, &backup).await?;
        Ok(backup)
    }

    fn recorded_status(&self) -> MigrationStatus {
        self.status.get_status().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Cannot read migration status");
            MigrationStatus::None
        })
    }

    fn record(&self, status: MigrationStatus) {
        if let Err(e) = self
            .status
            .set_status(status)
            .and_then(|()| self.status.set_last_attempt(Timestamp::now()))
        {
            tracing::warn!(error = %e, status = %status, "Failed to record migration status");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{read_sealed, write_sealed, SealedFileEngine};
    use std::sync::atomic::Ordering;
    use tallybook_core::MemoryPreferences;
    use tallybook_keys::{KeyVault, MemoryKeyStore};
    use tempfile::TempDir;

    const LEGACY_CONTENTS: &[u8] = b"invoices: 2019-0001, 2019-0002";

    struct Fixture {
        tmp: TempDir,
        engine: Arc<SealedFileEngine>,
        passphrase: Arc<PassphraseStore>,
        status: MigrationStatusStore,
    }

    impl Fixture {
        fn new() -> Self {
            let tmp = TempDir::new().expect("create temp dir");
            let passphrase = PassphraseStore::new(
                Arc::new(MemoryPreferences::new()),
                Arc::new(KeyVault::new(MemoryKeyStore::new())),
                "tallybook.database.wrap",
                tmp.path().join("tallybook.db"),
            )
            .expect("create passphrase store");
            Self {
                tmp,
                engine: Arc::new(SealedFileEngine::default()),
                passphrase: Arc::new(passphrase),
                status: MigrationStatusStore::new(Arc::new(MemoryPreferences::new())),
            }
        }

        fn db_path(&self) -> PathBuf {
            self.tmp.path().join("tallybook.db")
        }

        fn backup_dir(&self) -> PathBuf {
            self.tmp.path().join("backups")
        }

        fn migrator(&self) -> LegacyMigrationEngine<SealedFileEngine> {
            LegacyMigrationEngine::new(
                Arc::clone(&self.engine),
                Arc::clone(&self.passphrase),
                self.status.clone(),
                self.backup_dir(),
            )
        }

        fn write_legacy(&self) {
            let legacy = SecretBuffer::from_slice(LEGACY_PASSPHRASE.as_bytes());
            write_sealed(&self.db_path(), StoreKey::passphrase(&legacy), LEGACY_CONTENTS);
        }

        fn backups(&self) -> Vec<PathBuf> {
            match std::fs::read_dir(self.backup_dir()) {
                Ok(entries) => entries
                    .map(|e| e.expect("dir entry").path())
                    .collect(),
                Err(_) => Vec::new(),
            }
        }
    }

    #[tokio::test]
    async fn test_no_database() {
        let fx = Fixture::new();
        let status = fx.migrator().try_migrate().await;

        assert_eq!(status, MigrationStatus::NoDatabase);
        assert_eq!(fx.status.get_status().expect("status"), MigrationStatus::NoDatabase);
        assert!(fx.status.get_last_attempt().expect("last attempt").is_some());
        assert!(!fx.backup_dir().exists());
        assert_eq!(fx.engine.passphrase_opens(), 0);
    }

    #[tokio::test]
    async fn test_successful_migration() {
        let fx = Fixture::new();
        fx.write_legacy();

        let status = fx.migrator().try_migrate().await;
        assert_eq!(status, MigrationStatus::Success);

        let report = fx.status.report().expect("report");
        assert_eq!(report.status, MigrationStatus::Success);
        assert_eq!(report.backup_dir, Some(fx.backup_dir()));

        let backups = fx.backups();
        assert_eq!(backups.len(), 1);
        let name = backups[0].file_name().expect("name").to_string_lossy().into_owned();
        assert!(name.starts_with("tallybook.db_backup_"));

        // The backup is still the legacy file; the live file opens only under the new secret.
        let legacy = SecretBuffer::from_slice(LEGACY_PASSPHRASE.as_bytes());
        assert_eq!(
            read_sealed(&backups[0], StoreKey::passphrase(&legacy)).as_deref(),
            Some(LEGACY_CONTENTS)
        );
        assert!(read_sealed(&fx.db_path(), StoreKey::passphrase(&legacy)).is_none());

        let secret = fx.passphrase.get_raw_secret().expect("current secret");
        assert_eq!(
            read_sealed(&fx.db_path(), StoreKey::raw(&secret)).as_deref(),
            Some(LEGACY_CONTENTS)
        );
        assert!(fx.passphrase.is_bound().expect("bound"));
        assert_eq!(fx.engine.closes(), 1);
    }

    #[tokio::test]
    async fn test_backup_failure_does_not_block_migration() {
        let fx = Fixture::new();
        fx.write_legacy();
        let blocked = fx.tmp.path().join("not-a-directory");
        std::fs::write(&blocked, b"occupied").expect("write blocking file");

        let migrator = LegacyMigrationEngine::new(
            Arc::clone(&fx.engine),
            Arc::clone(&fx.passphrase),
            fx.status.clone(),
            &blocked,
        );
        let status = migrator.try_migrate().await;

        assert_eq!(status, MigrationStatus::Success);
        assert_eq!(fx.status.get_backup_dir().expect("backup dir"), None);
        assert_eq!(std::fs::read(&blocked).expect("read blocking file"), b"occupied");

        let secret = fx.passphrase.get_raw_secret().expect("current secret");
        assert_eq!(
            read_sealed(&fx.db_path(), StoreKey::raw(&secret)).as_deref(),
            Some(LEGACY_CONTENTS)
        );
        assert_eq!(fx.engine.rekeys(), 1);
    }

    #[tokio::test]
    async fn test_rekey_failure_leaves_files_untouched() {
        let fx = Fixture::new();
        fx.write_legacy();
        let before = std::fs::read(fx.db_path()).expect("read legacy");
        fx.engine.fail_rekey.store(true, Ordering::SeqCst);

        let status = fx.migrator().try_migrate().await;
        assert_eq!(status, MigrationStatus::Failure);
        assert_eq!(fx.status.get_status().expect("status"), MigrationStatus::Failure);

        assert_eq!(std::fs::read(fx.db_path()).expect("read live"), before);
        let backups = fx.backups();
        assert_eq!(backups.len(), 1);
        assert_eq!(std::fs::read(&backups[0]).expect("read backup"), before);
        assert!(!fx.passphrase.is_bound().expect("bound"));
        assert_eq!(fx.engine.closes(), 1);
    }

    #[tokio::test]
    async fn test_wrong_legacy_secret() {
        let fx = Fixture::new();
        fx.write_legacy();
        let before = std::fs::read(fx.db_path()).expect("read legacy");

        let status = fx
            .migrator()
            .with_legacy_secret(b"not-the-legacy-passphrase".to_vec())
            .try_migrate()
            .await;

        assert_eq!(status, MigrationStatus::Failure);
        assert_eq!(fx.engine.rekeys(), 0);
        assert_eq!(std::fs::read(fx.db_path()).expect("read live"), before);
        assert_eq!(fx.backups().len(), 1);
    }

    #[tokio::test]
    async fn test_every_key_buffer_wiped() {
        let fx = Fixture::new();
        fx.write_legacy();
        fx.migrator().try_migrate().await;

        let witnesses = fx.engine.key_witnesses();
        assert_eq!(witnesses.len(), 2);
        assert!(witnesses.iter().all(tallybook_keys::WipeWitness::is_wiped));
    }

    #[tokio::test]
    async fn test_key_buffers_wiped_on_rekey_failure() {
        let fx = Fixture::new();
        fx.write_legacy();
        fx.engine.fail_rekey.store(true, Ordering::SeqCst);
        fx.migrator().try_migrate().await;

        let witnesses = fx.engine.key_witnesses();
        assert_eq!(witnesses.len(), 2);
        assert!(witnesses.iter().all(tallybook_keys::WipeWitness::is_wiped));
    }

    #[tokio::test]
    async fn test_attempted_once_per_engine() {
        let fx = Fixture::new();
        fx.write_legacy();
        let migrator = fx.migrator();

        assert_eq!(migrator.try_migrate().await, MigrationStatus::Success);
        assert_eq!(migrator.try_migrate().await, MigrationStatus::Success);
        assert_eq!(fx.engine.passphrase_opens(), 1);
        assert_eq!(fx.backups().len(), 1);
    }

    #[tokio::test]
    async fn test_bound_database_is_not_migrated_again() {
        let fx = Fixture::new();
        fx.write_legacy();
        assert_eq!(fx.migrator().try_migrate().await, MigrationStatus::Success);

        // Next launch: a fresh engine sees the bound file and leaves it alone.
        assert_eq!(fx.migrator().try_migrate().await, MigrationStatus::Success);
        assert_eq!(fx.engine.passphrase_opens(), 1);
        assert_eq!(fx.backups().len(), 1);
    }

    #[tokio::test]
    async fn test_disabled_reports_recorded_status() {
        let fx = Fixture::new();
        fx.write_legacy();
        fx.status.set_status(MigrationStatus::Failure).expect("seed status");

        let status = fx.migrator().enabled(false).try_migrate().await;
        assert_eq!(status, MigrationStatus::Failure);
        assert_eq!(fx.engine.passphrase_opens(), 0);
        assert!(fx.backups().is_empty());
    }
}
