//! Tallybook Core - Foundation crate for the Tallybook invoicing application.
//!
//! This crate provides shared types, error handling, configuration management
//! and the small key-value preference stores that the storage bootstrap
//! components are built on.
//!
//! # Modules
//!
//! - [`error`] - Central error types using thiserror
//! - [`config`] - TOML-based configuration with XDG paths
//! - [`types`] - Shared enums (`PassphraseState`, `MigrationStatus`) and `Timestamp`
//! - [`prefs`] - Injectable preference stores (JSON file and in-memory)
//!
//! # Example
//!
//! ```rust
//! use tallybook_core::{AppConfig, MemoryPreferences, PreferenceStore};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = AppConfig::default();
//! assert_eq!(config.storage.database_file, "tallybook.db");
//!
//! let prefs = MemoryPreferences::new();
//! prefs.set("migration.status", "success")?;
//! assert_eq!(prefs.get("migration.status")?.as_deref(), Some("success"));
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

pub mod config;
pub mod error;
pub mod prefs;
pub mod types;

// Re-export commonly used types
pub use config::{AppConfig, KeyBackend, KeyConfig, MigrationConfig, StorageConfig, StoragePaths};
pub use error::{ConfigError, ConfigResult, PreferenceError, PreferenceResult};
pub use prefs::{JsonFilePreferences, MemoryPreferences, PreferenceStore};
pub use types::{MigrationStatus, PassphraseState, Timestamp};
