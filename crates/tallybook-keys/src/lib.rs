//! Tallybook Keys - lifecycle of the database encryption secret.
//!
//! The database is encrypted with a random 256-bit secret. That secret is
//! never stored in plaintext: it is wrapped for an X25519 key pair living in
//! a secure key store and only the [`WrappedSecret`] is persisted.
//!
//! # Security Model
//!
//! - Private wrapping key never leaves the [`SecureKeyStore`]
//! - Wrap = ephemeral X25519 + HKDF-SHA256 + ChaCha20-Poly1305, alias as AAD
//! - Every raw secret is handed out as a [`SecretBuffer`] and wiped after use
//! - A key invalidated by the platform surfaces as [`PassphraseState::Invalid`],
//!   never as a silently regenerated secret
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use tallybook_core::{MemoryPreferences, PassphraseState};
//! use tallybook_keys::{KeyVault, MemoryKeyStore, PassphraseStore};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let store = PassphraseStore::new(
//!     Arc::new(MemoryPreferences::new()),
//!     Arc::new(KeyVault::new(MemoryKeyStore::new())),
//!     "tallybook.database.wrap",
//!     "/nonexistent/tallybook.db",
//! )?;
//!
//! store.ensure_secret_exists()?;
//! let mut secret = store.get_raw_secret()?;
//! assert_eq!(secret.len(), 32);
//! secret.wipe();
//! assert_eq!(store.state()?, PassphraseState::Set);
//! # Ok(())
//! # }
//! ```
//!
//! [`PassphraseState::Invalid`]: tallybook_core::PassphraseState::Invalid

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

pub mod error;
pub mod keystore;
pub mod keyvault;
pub mod passphrase;
pub mod secret;

pub use error::{KeyVaultError, KeyVaultResult, PassphraseError, Result};
pub use keystore::{KeyringKeyStore, MemoryKeyStore, SecureKeyStore};
pub use keyvault::{KeyVault, SecretWrapper, WrappedSecret};
pub use passphrase::PassphraseStore;
pub use secret::{SecretBuffer, WipeWitness};
