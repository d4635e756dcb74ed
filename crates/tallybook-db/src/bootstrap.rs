//! Single entry point for obtaining the encrypted store.
//!
//! [`DatabaseBootstrapper::database`] moves through
//! `Unopened -> Opening -> Opened`. Entry into `Opening` is serialized by an
//! async mutex, so concurrent callers wait for the one opener and then share
//! its handle. A failed open returns to `Unopened` so the caller can retry,
//! for example after [`DatabaseBootstrapper::reset_secret`].

use crate::engine::{StorageEngine, StoreKey};
use crate::error::{BootstrapError, BootstrapResult};
use crate::legacy::LegacyMigrationEngine;
use once_cell::sync::OnceCell;
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tallybook_core::Timestamp;
use tallybook_keys::PassphraseStore;
use tokio::sync::{watch, Mutex, OwnedMutexGuard};

/// Lifecycle of the process-wide store handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BootstrapPhase {
    /// No handle, nobody opening.
    Unopened,
    /// A caller is running the opening sequence.
    Opening,
    /// The handle is published for the rest of the process.
    Opened,
}

impl fmt::Display for BootstrapPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unopened => "unopened",
            Self::Opening => "opening",
            Self::Opened => "opened",
        };
        f.write_str(s)
    }
}

async fn run_blocking<T, F>(f: F) -> BootstrapResult<T>
where
    F: FnOnce() -> tallybook_keys::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| BootstrapError::BootstrapFailed(format!("blocking task failed: {e}")))?
        .map_err(BootstrapError::from)
}

/// Owner of the one live store handle.
pub struct DatabaseBootstrapper<E: StorageEngine> {
    engine: Arc<E>,
    passphrase: Arc<PassphraseStore>,
    migration: Arc<LegacyMigrationEngine<E>>,
    handle: OnceCell<Arc<E::Handle>>,
    lock: Arc<Mutex<()>>,
    phase: watch::Sender<BootstrapPhase>,
}

impl<E: StorageEngine> fmt::Debug for DatabaseBootstrapper<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseBootstrapper")
            .field("database", &self.passphrase.database_path())
            .field("phase", &*self.phase.borrow())
            .finish_non_exhaustive()
    }
}

impl<E: StorageEngine> DatabaseBootstrapper<E> {
    /// Create a bootstrapper. `engine` must be the engine `migration` uses.
    pub fn new(
        engine: Arc<E>,
        passphrase: Arc<PassphraseStore>,
        migration: Arc<LegacyMigrationEngine<E>>,
    ) -> Arc<Self> {
        let (phase, _) = watch::channel(BootstrapPhase::Unopened);
        Arc::new(Self {
            engine,
            passphrase,
            migration,
            handle: OnceCell::new(),
            lock: Arc::new(Mutex::new(())),
            phase,
        })
    }

    /// Current phase.
    #[must_use]
    pub fn phase(&self) -> BootstrapPhase {
        *self.phase.borrow()
    }

    /// Observe phase transitions.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<BootstrapPhase> {
        self.phase.subscribe()
    }

    /// The handle, if already opened. Never starts an open.
    #[must_use]
    pub fn opened(&self) -> Option<Arc<E::Handle>> {
        self.handle.get().cloned()
    }

    /// Passphrase store backing this bootstrapper.
    #[must_use]
    pub fn passphrase(&self) -> &Arc<PassphraseStore> {
        &self.passphrase
    }

    /// Legacy migration engine run during opening.
    #[must_use]
    pub fn migration(&self) -> &Arc<LegacyMigrationEngine<E>> {
        &self.migration
    }

    /// Get the store handle, opening it on first use.
    ///
    /// All callers, concurrent or later, receive the same handle. The opening
    /// sequence runs on its own task; dropping the returned future does not
    /// cancel it.
    ///
    /// # Errors
    /// - `Secret` if the secret is missing or cannot be unwrapped
    /// - `BootstrapFailed` if the store cannot be opened with the current secret
    pub async fn database(self: &Arc<Self>) -> BootstrapResult<Arc<E::Handle>> {
        if let Some(handle) = self.handle.get() {
            return Ok(Arc::clone(handle));
        }

        let guard = Arc::clone(&self.lock).lock_owned().await;
        if let Some(handle) = self.handle.get() {
            return Ok(Arc::clone(handle));
        }

        let this = Arc::clone(self);
        tokio::spawn(async move { this.open_locked(guard).await })
            .await
            .map_err(|e| BootstrapError::BootstrapFailed(format!("bootstrap task failed: {e}")))?
    }

    async fn open_locked(&self, _guard: OwnedMutexGuard<()>) -> BootstrapResult<Arc<E::Handle>> {
        self.phase.send_replace(BootstrapPhase::Opening);
        tracing::debug!("Opening encrypted store");

        match self.open_sequence().await {
            Ok(handle) => {
                // Only the lock holder publishes, so the cell is empty here.
                let published = Arc::clone(self.handle.get_or_init(|| Arc::new(handle)));
                self.phase.send_replace(BootstrapPhase::Opened);
                tracing::info!("Encrypted store opened");
                Ok(published)
            }
            Err(e) => {
                self.phase.send_replace(BootstrapPhase::Unopened);
                tracing::warn!(error = %e, "Encrypted store failed to open");
                Err(e)
            }
        }
    }

    async fn open_sequence(&self) -> BootstrapResult<E::Handle> {
        let store = Arc::clone(&self.passphrase);
        run_blocking(move || store.ensure_secret_exists()).await?;

        let migration = self.migration.try_migrate().await;
        tracing::debug!(migration = %migration, "Legacy migration step finished");

        let store = Arc::clone(&self.passphrase);
        let mut secret = run_blocking(move || store.get_raw_secret()).await?;
        let opened = self
            .engine
            .open(self.passphrase.database_path(), StoreKey::raw(&secret))
            .await;
        secret.wipe();
        let handle = opened?;

        if let Err(e) = self.engine.initialize_schema(&handle).await {
            self.engine.close(handle).await;
            return Err(e.into());
        }

        let store = Arc::clone(&self.passphrase);
        if let Err(e) = run_blocking(move || store.mark_bound()).await {
            tracing::warn!(error = %e, "Failed to record secret binding");
        }
        Ok(handle)
    }

    /// Explicit, user-initiated recovery from an invalid secret.
    ///
    /// Moves the database file, which the lost secret encrypted, into the
    /// backup directory as `{name}_orphaned_{timestamp}` and resets the
    /// passphrase store. Returns where the file went, if it existed.
    ///
    /// # Errors
    /// `AlreadyOpen` once the store has been opened in this process.
    pub async fn reset_secret(&self) -> BootstrapResult<Option<PathBuf>> {
        let _guard = self.lock.lock().await;
        if self.handle.get().is_some() {
            return Err(BootstrapError::AlreadyOpen);
        }

        let database = self.passphrase.database_path();
        let orphaned = if tokio::fs::try_exists(database).await? {
            Some(self.move_aside(database).await?)
        } else {
            None
        };

        let store = Arc::clone(&self.passphrase);
        run_blocking(move || store.reset_secret()).await?;

        tracing::warn!(
            orphaned = ?orphaned.as_ref().map(|p| p.display().to_string()),
            "Database secret reset; a new store will be created on next open"
        );
        Ok(orphaned)
    }

    async fn move_aside(&self, database: &Path) -> BootstrapResult<PathBuf> {
        let backup_dir = self.migration.backup_dir();
        let name = database
            .file_name()
            .map_or_else(|| "database".into(), |n| n.to_string_lossy());
        let target = backup_dir.join(format!(
            "{name}_orphaned_{}",
            Timestamp::now().to_file_stamp()
        ));

        tokio::fs::create_dir_all(backup_dir).await?;
        tokio::fs::rename(database, &target).await?;
        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DatabaseError;
    use crate::status::MigrationStatusStore;
    use crate::test_support::{read_sealed, write_sealed, SealedFileEngine, SealedHandle};
    use crate::LEGACY_PASSPHRASE;
    use std::sync::atomic::Ordering;
    use tallybook_core::{MemoryPreferences, MigrationStatus, PassphraseState};
    use tallybook_keys::{KeyVault, MemoryKeyStore, PassphraseError, SecretBuffer};
    use tempfile::TempDir;

    const ALIAS: &str = "tallybook.database.wrap";

    struct Fixture {
        tmp: TempDir,
        keys: Arc<KeyVault<MemoryKeyStore>>,
        engine: Arc<SealedFileEngine>,
        status: MigrationStatusStore,
        bootstrapper: Arc<DatabaseBootstrapper<SealedFileEngine>>,
    }

    impl Fixture {
        fn new() -> Self {
            let tmp = TempDir::new().expect("create temp dir");
            let keys = Arc::new(KeyVault::new(MemoryKeyStore::new()));
            let engine = Arc::new(SealedFileEngine::default());
            let status = MigrationStatusStore::new(Arc::new(MemoryPreferences::new()));
            let passphrase = Arc::new(
                PassphraseStore::new(
                    Arc::new(MemoryPreferences::new()),
                    keys.clone(),
                    ALIAS,
                    tmp.path().join("tallybook.db"),
                )
                .expect("create passphrase store"),
            );
            let migration = Arc::new(LegacyMigrationEngine::new(
                Arc::clone(&engine),
                Arc::clone(&passphrase),
                status.clone(),
                tmp.path().join("backups"),
            ));
            let bootstrapper =
                DatabaseBootstrapper::new(Arc::clone(&engine), passphrase, migration);
            Self {
                tmp,
                keys,
                engine,
                status,
                bootstrapper,
            }
        }

        fn db_path(&self) -> PathBuf {
            self.tmp.path().join("tallybook.db")
        }

        fn write_legacy(&self, contents: &[u8]) {
            let legacy = SecretBuffer::from_slice(LEGACY_PASSPHRASE.as_bytes());
            write_sealed(&self.db_path(), StoreKey::passphrase(&legacy), contents);
        }

        fn passphrase_state(&self) -> PassphraseState {
            self.bootstrapper.passphrase().state().expect("passphrase state")
        }
    }

    #[tokio::test]
    async fn test_fresh_install() {
        let fx = Fixture::new();
        let mut states = fx.bootstrapper.passphrase().subscribe();
        assert_eq!(*states.borrow_and_update(), PassphraseState::NeedsCreation);
        assert_eq!(fx.bootstrapper.phase(), BootstrapPhase::Unopened);

        let db = fx.bootstrapper.database().await.expect("open database");

        assert_eq!(*states.borrow_and_update(), PassphraseState::Set);
        assert_eq!(fx.passphrase_state(), PassphraseState::Set);
        assert_eq!(fx.status.get_status().expect("status"), MigrationStatus::NoDatabase);
        assert_eq!(fx.bootstrapper.phase(), BootstrapPhase::Opened);
        assert!(!fx.tmp.path().join("backups").exists());
        assert_eq!(db.path, fx.db_path());
        assert!(fx.bootstrapper.passphrase().is_bound().expect("bound"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_share_one_open() {
        let fx = Fixture::new();
        fx.engine.open_delay_ms.store(50, Ordering::SeqCst);

        let callers = (0..16).map(|_| {
            let bootstrapper = Arc::clone(&fx.bootstrapper);
            tokio::spawn(async move { bootstrapper.database().await })
        });
        let handles: Vec<Arc<SealedHandle>> = futures::future::join_all(callers)
            .await
            .into_iter()
            .map(|joined| joined.expect("caller task").expect("database handle"))
            .collect();

        assert_eq!(fx.engine.raw_opens(), 1);
        let first = &handles[0];
        assert!(handles.iter().all(|h| Arc::ptr_eq(h, first)));
    }

    #[tokio::test]
    async fn test_later_callers_get_same_handle() {
        let fx = Fixture::new();
        let a = fx.bootstrapper.database().await.expect("first");
        let b = fx.bootstrapper.database().await.expect("second");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(Arc::ptr_eq(&a, &fx.bootstrapper.opened().expect("opened")));
        assert_eq!(fx.engine.raw_opens(), 1);
    }

    #[tokio::test]
    async fn test_legacy_database_migrated() {
        let fx = Fixture::new();
        fx.write_legacy(b"customers: acme");
        assert_eq!(fx.passphrase_state(), PassphraseState::NotSet);

        let db = fx.bootstrapper.database().await.expect("open database");

        assert_eq!(db.contents, b"customers: acme");
        assert_eq!(fx.passphrase_state(), PassphraseState::Set);
        let report = fx.status.report().expect("report");
        assert_eq!(report.status, MigrationStatus::Success);
        let backup_dir = report.backup_dir.expect("backup dir recorded");
        assert_eq!(std::fs::read_dir(backup_dir).expect("backups").count(), 1);

        // Opened with the new secret, not the legacy passphrase.
        let legacy = SecretBuffer::from_slice(LEGACY_PASSPHRASE.as_bytes());
        assert!(read_sealed(&fx.db_path(), StoreKey::passphrase(&legacy)).is_none());
        let secret = fx.bootstrapper.passphrase().get_raw_secret().expect("secret");
        assert!(read_sealed(&fx.db_path(), StoreKey::raw(&secret)).is_some());
    }

    #[tokio::test]
    async fn test_wrong_legacy_secret_surfaces_bootstrap_failed() {
        let fx = Fixture::new();
        let unknown = SecretBuffer::from_slice(b"some other passphrase");
        write_sealed(&fx.db_path(), StoreKey::passphrase(&unknown), b"unreadable");

        let result = fx.bootstrapper.database().await;

        assert!(matches!(result, Err(BootstrapError::BootstrapFailed(_))));
        assert_eq!(fx.status.get_status().expect("status"), MigrationStatus::Failure);
        assert_eq!(fx.bootstrapper.phase(), BootstrapPhase::Unopened);
        assert!(fx.bootstrapper.opened().is_none());

        // Recovery: reset moves the unreadable file aside and the next open starts fresh.
        let orphaned = fx
            .bootstrapper
            .reset_secret()
            .await
            .expect("reset secret")
            .expect("file moved aside");
        assert!(orphaned
            .file_name()
            .expect("name")
            .to_string_lossy()
            .starts_with("tallybook.db_orphaned_"));
        assert!(!fx.db_path().exists());

        let db = fx.bootstrapper.database().await.expect("open after reset");
        assert_eq!(db.contents, crate::test_support::FRESH_CONTENTS);
        assert_eq!(fx.bootstrapper.phase(), BootstrapPhase::Opened);
    }

    #[tokio::test]
    async fn test_invalid_secret_requires_reset() {
        let fx = Fixture::new();
        {
            // First launch creates and binds the store.
            let db = fx.bootstrapper.database().await.expect("first launch");
            assert_eq!(db.contents, crate::test_support::FRESH_CONTENTS);
        }

        // Simulate the next launch after the platform invalidated the key.
        let passphrase = Arc::clone(fx.bootstrapper.passphrase());
        fx.keys.store().invalidate(ALIAS).expect("invalidate key");
        let migration = Arc::new(LegacyMigrationEngine::new(
            Arc::clone(&fx.engine),
            Arc::clone(&passphrase),
            fx.status.clone(),
            fx.tmp.path().join("backups"),
        ));
        let relaunch = DatabaseBootstrapper::new(Arc::clone(&fx.engine), passphrase, migration);

        let err = relaunch.database().await.expect_err("secret is invalid");
        assert!(err.requires_reset());
        assert!(matches!(
            err,
            BootstrapError::Secret(PassphraseError::SecretInvalid(_))
        ));
        assert_eq!(
            relaunch.passphrase().state().expect("state"),
            PassphraseState::Invalid
        );
        assert_eq!(relaunch.phase(), BootstrapPhase::Unopened);
        // No replacement secret was created behind the user's back.
        assert!(relaunch.passphrase().has_secret().expect("has secret"));

        relaunch.reset_secret().await.expect("reset");
        relaunch.database().await.expect("open after reset");
        assert_eq!(
            relaunch.passphrase().state().expect("state"),
            PassphraseState::Set
        );
    }

    #[tokio::test]
    async fn test_open_failure_resets_and_retries() {
        let fx = Fixture::new();
        fx.engine.fail_open.store(true, Ordering::SeqCst);

        let result = fx.bootstrapper.database().await;
        assert!(matches!(result, Err(BootstrapError::BootstrapFailed(_))));
        assert_eq!(fx.bootstrapper.phase(), BootstrapPhase::Unopened);
        assert!(fx.bootstrapper.opened().is_none());

        fx.engine.fail_open.store(false, Ordering::SeqCst);
        fx.bootstrapper.database().await.expect("retry succeeds");
        assert_eq!(fx.bootstrapper.phase(), BootstrapPhase::Opened);
        assert_eq!(fx.engine.raw_opens(), 2);
    }

    #[tokio::test]
    async fn test_secret_wiped_on_success_and_failure() {
        let fx = Fixture::new();
        fx.write_legacy(b"quotes: Q-17");
        fx.bootstrapper.database().await.expect("open database");

        let witnesses = fx.engine.key_witnesses();
        // legacy open, rekey, current-secret open
        assert_eq!(witnesses.len(), 3);
        assert!(witnesses.iter().all(tallybook_keys::WipeWitness::is_wiped));

        let failing = Fixture::new();
        failing.engine.fail_open.store(true, Ordering::SeqCst);
        let _ = failing.bootstrapper.database().await;
        let witnesses = failing.engine.key_witnesses();
        assert_eq!(witnesses.len(), 1);
        assert!(witnesses[0].is_wiped());
    }

    #[tokio::test]
    async fn test_reset_refused_once_opened() {
        let fx = Fixture::new();
        fx.bootstrapper.database().await.expect("open database");
        assert!(matches!(
            fx.bootstrapper.reset_secret().await,
            Err(BootstrapError::AlreadyOpen)
        ));
        assert!(fx.db_path().exists());
    }

    #[tokio::test]
    async fn test_phase_observable() {
        let fx = Fixture::new();
        let mut phases = fx.bootstrapper.subscribe();
        assert_eq!(*phases.borrow_and_update(), BootstrapPhase::Unopened);

        fx.bootstrapper.database().await.expect("open database");
        assert!(phases.has_changed().expect("watch alive"));
        assert_eq!(*phases.borrow_and_update(), BootstrapPhase::Opened);
        assert_eq!(BootstrapPhase::Opening.to_string(), "opening");
    }

    #[test]
    fn test_database_error_is_bootstrap_failed() {
        let err = BootstrapError::from(DatabaseError::Open("disk gone".to_string()));
        assert!(!err.requires_reset());
    }
}
