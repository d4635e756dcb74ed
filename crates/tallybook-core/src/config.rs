//! Configuration management for Tallybook.
//!
//! Provides TOML-based configuration with XDG-compliant paths and
//! environment variable overrides.

use crate::error::{ConfigError, ConfigResult};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::str::FromStr;

/// Main application configuration.
///
/// This is loaded from `~/.config/tallybook/config.toml` (or platform equivalent).
/// If the file doesn't exist, default values are used.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Encrypted store location and engine settings
    pub storage: StorageConfig,
    /// Key wrapping settings
    pub keys: KeyConfig,
    /// Legacy database migration settings
    pub migration: MigrationConfig,
}

impl AppConfig {
    /// Load configuration from disk, falling back to defaults if not found.
    ///
    /// # Errors
    /// Returns error if:
    /// - Config directory cannot be determined
    /// - File exists but cannot be read
    /// - File contents are not valid TOML
    pub fn load() -> ConfigResult<Self> {
        let config_path = Self::config_path()?;

        if config_path.exists() {
            tracing::debug!("Loading config from {}", config_path.display());
            let contents = fs::read_to_string(&config_path)?;
            let config = toml::from_str(&contents)?;
            Ok(config)
        } else {
            tracing::debug!("Config file not found, using defaults");
            Ok(Self::default())
        }
    }

    /// Load configuration with environment variable overrides.
    ///
    /// Supports the following environment variables:
    /// - `TALLYBOOK_DATA_DIR`: Override the private storage directory
    /// - `TALLYBOOK_KEY_BACKEND`: Override the key store backend (`keyring`/`memory`)
    /// - `TALLYBOOK_LEGACY_MIGRATION`: Enable or disable legacy migration (true/false)
    pub fn load_with_env() -> ConfigResult<Self> {
        let mut config = Self::load()?;
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Apply environment variable overrides to an already-loaded config.
    pub fn apply_env_overrides(&mut self) -> ConfigResult<()> {
        if let Ok(val) = std::env::var("TALLYBOOK_DATA_DIR") {
            if !val.is_empty() {
                tracing::debug!("Override storage.data_dir from env: {}", val);
                self.storage.data_dir = Some(PathBuf::from(val));
            }
        }

        if let Ok(val) = std::env::var("TALLYBOOK_KEY_BACKEND") {
            self.keys.backend = val.parse()?;
            tracing::debug!("Override keys.backend from env: {:?}", self.keys.backend);
        }

        if let Ok(val) = std::env::var("TALLYBOOK_LEGACY_MIGRATION") {
            if let Ok(enabled) = val.parse() {
                self.migration.enabled = enabled;
                tracing::debug!("Override migration.enabled from env: {}", enabled);
            }
        }

        Ok(())
    }

    /// Save configuration to disk.
    ///
    /// Creates the config directory if it doesn't exist.
    pub fn save(&self) -> ConfigResult<()> {
        let config_path = Self::config_path()?;
        let config_dir = config_path
            .parent()
            .ok_or_else(|| ConfigError::InvalidValue {
                field: "config_path".to_string(),
                reason: "no parent directory".to_string(),
            })?;

        fs::create_dir_all(config_dir)?;
        tracing::debug!("Saving config to {}", config_path.display());

        let contents = toml::to_string_pretty(self)?;
        fs::write(config_path, contents)?;
        Ok(())
    }

    /// Get the path to the configuration file.
    ///
    /// Uses XDG base directories: `~/.config/tallybook/config.toml`
    pub fn config_path() -> ConfigResult<PathBuf> {
        let dirs =
            ProjectDirs::from("com", "tallybook", "tallybook").ok_or(ConfigError::NoConfigDir)?;
        Ok(dirs.config_dir().join("config.toml"))
    }

    /// Get the default data directory path.
    ///
    /// Uses XDG base directories: `~/.local/share/tallybook`
    pub fn default_data_dir() -> ConfigResult<PathBuf> {
        let dirs =
            ProjectDirs::from("com", "tallybook", "tallybook").ok_or(ConfigError::NoConfigDir)?;
        Ok(dirs.data_dir().to_path_buf())
    }

    /// Resolve every on-disk location used by the storage bootstrap.
    pub fn paths(&self) -> ConfigResult<StoragePaths> {
        let data_dir = match &self.storage.data_dir {
            Some(dir) => dir.clone(),
            None => Self::default_data_dir()?,
        };
        Ok(StoragePaths::new(data_dir, &self.storage))
    }
}

/// Encrypted store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Private storage directory (platform data dir when unset)
    pub data_dir: Option<PathBuf>,
    /// Database file name; the legacy and current database share it
    pub database_file: String,
    /// Backup subdirectory name
    pub backup_dir: String,
    /// Maximum pooled connections to the opened store
    pub max_connections: u32,
    /// `SQLCipher` page size
    pub cipher_page_size: u32,
    /// `SQLCipher` KDF iterations (used for passphrase keys only)
    pub kdf_iter: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            database_file: "tallybook.db".to_string(),
            backup_dir: "backups".to_string(),
            max_connections: 5,
            cipher_page_size: 4096,
            kdf_iter: 256_000,
        }
    }
}

/// Where the key pair that wraps the database secret lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyBackend {
    /// OS credential store (Keychain, Credential Manager, Secret Service)
    Keyring,
    /// Process-local store; keys vanish on exit
    Memory,
}

impl FromStr for KeyBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "keyring" => Ok(Self::Keyring),
            "memory" => Ok(Self::Memory),
            other => Err(ConfigError::InvalidValue {
                field: "keys.backend".to_string(),
                reason: format!("unknown key backend '{other}'"),
            }),
        }
    }
}

/// Key wrapping settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyConfig {
    /// Alias of the key pair that wraps the database secret
    pub key_alias: String,
    /// Service name used for OS credential store entries
    pub keyring_service: String,
    /// Key store backend
    pub backend: KeyBackend,
}

impl Default for KeyConfig {
    fn default() -> Self {
        Self {
            key_alias: "tallybook.database.wrap".to_string(),
            keyring_service: "tallybook".to_string(),
            backend: KeyBackend::Keyring,
        }
    }
}

/// Legacy database migration settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
    /// Attempt to migrate a database protected by the legacy secret
    pub enabled: bool,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Resolved on-disk locations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoragePaths {
    /// Private storage root
    pub data_dir: PathBuf,
    /// Encrypted database file (legacy and current)
    pub database: PathBuf,
    /// Directory receiving pre-migration backups
    pub backup_dir: PathBuf,
    /// Preference file holding the wrapped secret
    pub secure_prefs: PathBuf,
    /// Preference file holding migration diagnostics
    pub migration_prefs: PathBuf,
}

impl StoragePaths {
    /// Derive all paths from a data directory.
    #[must_use]
    pub fn new(data_dir: PathBuf, storage: &StorageConfig) -> Self {
        let prefs_dir = data_dir.join("prefs");
        Self {
            database: data_dir.join(&storage.database_file),
            backup_dir: data_dir.join(&storage.backup_dir),
            secure_prefs: prefs_dir.join("secure_prefs.json"),
            migration_prefs: prefs_dir.join("migration_prefs.json"),
            data_dir,
        }
    }
}
