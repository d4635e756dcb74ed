//! Application state: the storage bootstrap wired from configuration.

use crate::error::CommandError;
use std::sync::Arc;
use tallybook_core::{AppConfig, JsonFilePreferences, KeyBackend, StoragePaths};
use tallybook_db::{
    CipherSettings, DatabaseBootstrapper, LegacyMigrationEngine, MigrationStatusStore,
    SqlCipherEngine,
};
use tallybook_keys::{KeyVault, KeyringKeyStore, MemoryKeyStore, PassphraseStore, SecretWrapper};

/// Shared state for all commands.
#[derive(Debug)]
pub struct AppState {
    /// Resolved on-disk locations.
    pub paths: StoragePaths,
    /// Process-wide owner of the database handle.
    pub bootstrapper: Arc<DatabaseBootstrapper<SqlCipherEngine>>,
    /// Diagnostics record of the legacy migration.
    pub migration_status: MigrationStatusStore,
}

impl AppState {
    /// Wire the bootstrap components described by `config`.
    ///
    /// Creates the private data directory if it doesn't exist. Opens nothing.
    pub fn from_config(config: &AppConfig) -> Result<Self, CommandError> {
        let paths = config.paths()?;
        std::fs::create_dir_all(&paths.data_dir)?;
        tracing::info!(data_dir = %paths.data_dir.display(), "Storage directory ready");

        let wrapper: Arc<dyn SecretWrapper> = match config.keys.backend {
            KeyBackend::Keyring => Arc::new(KeyVault::new(KeyringKeyStore::new(
                config.keys.keyring_service.clone(),
            ))),
            KeyBackend::Memory => {
                tracing::warn!("Using in-memory key store; the database will not survive a restart");
                Arc::new(KeyVault::new(MemoryKeyStore::new()))
            }
        };

        let passphrase = Arc::new(PassphraseStore::new(
            Arc::new(JsonFilePreferences::new(&paths.secure_prefs)),
            wrapper,
            config.keys.key_alias.clone(),
            &paths.database,
        )?);
        // Migration status is diagnostics only; an unreadable file is not fatal.
        let migration_status = MigrationStatusStore::new(Arc::new(
            JsonFilePreferences::new(&paths.migration_prefs).set_aside_corrupt(),
        ));

        let engine = Arc::new(SqlCipherEngine::new(CipherSettings::from(&config.storage)));
        let migration = Arc::new(
            LegacyMigrationEngine::new(
                Arc::clone(&engine),
                Arc::clone(&passphrase),
                migration_status.clone(),
                &paths.backup_dir,
            )
            .enabled(config.migration.enabled),
        );
        let bootstrapper = DatabaseBootstrapper::new(engine, passphrase, migration);

        Ok(Self {
            paths,
            bootstrapper,
            migration_status,
        })
    }
}
