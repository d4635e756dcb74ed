//! The passphrase store: single source of truth for the database secret.
//!
//! Persists only the [`WrappedSecret`] in the secure preference area, creates
//! a random 256-bit secret on first run, and publishes a [`PassphraseState`]
//! that UI code can observe through [`PassphraseStore::subscribe`].

use crate::error::{KeyVaultError, PassphraseError, Result};
use crate::keyvault::{SecretWrapper, WrappedSecret};
use crate::secret::SecretBuffer;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tallybook_core::{PassphraseState, PreferenceError, PreferenceStore};
use tokio::sync::watch;

/// Length of the generated database secret (256 bits).
pub const SECRET_LENGTH: usize = 32;

/// Preference key holding the wrapped secret.
pub const WRAPPED_SECRET_KEY: &str = "database.wrapped_secret";

/// Preference key recording that the current secret has opened the database file.
pub const SECRET_BOUND_KEY: &str = "database.secret_bound";

/// What the secure preference area holds for the secret.
enum Record {
    Missing,
    Wrapped(WrappedSecret),
    /// Present but undecodable, either the record or the whole area.
    Unreadable(String),
}

/// Owner of the database secret's lifecycle.
pub struct PassphraseStore {
    prefs: Arc<dyn PreferenceStore>,
    wrapper: Arc<dyn SecretWrapper>,
    alias: String,
    database_path: PathBuf,
    unwrap_failed: AtomicBool,
    create_lock: Mutex<()>,
    state: watch::Sender<PassphraseState>,
}

impl std::fmt::Debug for PassphraseStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PassphraseStore")
            .field("alias", &self.alias)
            .field("database_path", &self.database_path)
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

impl PassphraseStore {
    /// Create a store.
    ///
    /// # Arguments
    /// * `prefs` - Secure preference area holding the wrapped secret
    /// * `wrapper` - Key vault sealing the secret
    /// * `alias` - Alias of the wrapping key pair
    /// * `database_path` - Database file, used to tell a legacy install from a first run
    pub fn new(
        prefs: Arc<dyn PreferenceStore>,
        wrapper: Arc<dyn SecretWrapper>,
        alias: impl Into<String>,
        database_path: impl Into<PathBuf>,
    ) -> Result<Self> {
        let (state, _) = watch::channel(PassphraseState::NeedsCreation);
        let store = Self {
            prefs,
            wrapper,
            alias: alias.into(),
            database_path: database_path.into(),
            unwrap_failed: AtomicBool::new(false),
            create_lock: Mutex::new(()),
            state,
        };
        store.refresh_state()?;
        Ok(store)
    }

    /// Database file this store guards.
    #[must_use]
    pub fn database_path(&self) -> &Path {
        &self.database_path
    }

    /// Make sure a wrapped secret exists, generating one on first run.
    ///
    /// Idempotent: once a wrapped secret is persisted it is never replaced
    /// here, and concurrent callers are serialized.
    ///
    /// # Errors
    /// `SecretInvalid` if an unreadable record is persisted; only
    /// [`PassphraseStore::reset_secret`] replaces it.
    pub fn ensure_secret_exists(&self) -> Result<()> {
        let _guard = self
            .create_lock
            .lock()
            .map_err(|_| PassphraseError::Corrupt("secret creation lock poisoned".to_string()))?;

        match self.read_record()? {
            Record::Wrapped(_) => return Ok(()),
            Record::Unreadable(reason) => return Err(self.unreadable(reason)),
            Record::Missing => {}
        }

        self.wrapper.ensure_key_pair(&self.alias)?;

        let mut secret = SecretBuffer::random(SECRET_LENGTH);
        let wrapped = self.wrapper.wrap(&self.alias, &secret);
        secret.wipe();
        let wrapped = wrapped?;

        let encoded = serde_json::to_string(&wrapped)
            .map_err(|e| PassphraseError::Corrupt(format!("encode wrapped secret: {e}")))?;
        self.prefs.set(WRAPPED_SECRET_KEY, &encoded)?;
        self.unwrap_failed.store(false, Ordering::SeqCst);

        tracing::info!(alias = %self.alias, "Created and wrapped new database secret");
        self.refresh_state()?;
        Ok(())
    }

    /// Unwrap and return the plaintext secret.
    ///
    /// The caller owns the returned buffer and must wipe it once the store is
    /// opened.
    ///
    /// # Errors
    /// - `SecretNotFound` if no wrapped secret was ever created
    /// - `SecretInvalid` if the record is unreadable or the key vault cannot
    ///   unwrap it
    pub fn get_raw_secret(&self) -> Result<SecretBuffer> {
        let wrapped = match self.read_record()? {
            Record::Wrapped(wrapped) => wrapped,
            Record::Missing => return Err(PassphraseError::SecretNotFound),
            Record::Unreadable(reason) => return Err(self.unreadable(reason)),
        };

        match self.wrapper.unwrap(&wrapped) {
            Ok(secret) => {
                if self.unwrap_failed.swap(false, Ordering::SeqCst) {
                    tracing::info!("Database secret unwrapped again after an earlier failure");
                }
                self.publish(PassphraseState::Set);
                Ok(secret)
            }
            Err(err @ (KeyVaultError::UnwrapFailed(_) | KeyVaultError::KeyUnavailable(_))) => {
                tracing::warn!(error = %err, "Database secret could not be unwrapped");
                self.unwrap_failed.store(true, Ordering::SeqCst);
                self.publish(PassphraseState::Invalid);
                Err(PassphraseError::SecretInvalid(err))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Current state, re-derived from persisted data.
    pub fn state(&self) -> Result<PassphraseState> {
        self.refresh_state()
    }

    /// Observe state transitions.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<PassphraseState> {
        self.state.subscribe()
    }

    /// Whether a wrapped secret has been persisted, readable or not.
    pub fn has_secret(&self) -> Result<bool> {
        Ok(!matches!(self.read_record()?, Record::Missing))
    }

    /// Record that the current secret has opened the database file.
    pub fn mark_bound(&self) -> Result<()> {
        self.prefs.set(SECRET_BOUND_KEY, "true")?;
        Ok(())
    }

    /// Whether the database file is known to be encrypted under the current secret.
    pub fn is_bound(&self) -> Result<bool> {
        Ok(self.prefs.get(SECRET_BOUND_KEY)?.as_deref() == Some("true"))
    }

    /// Explicit, user-initiated reset after the secret became invalid.
    ///
    /// Removes the wrapped secret, the binding record and the key pair. An
    /// unreadable preference area is cleared as a whole. Data encrypted under
    /// the old secret becomes unreadable; callers must have moved it aside
    /// first.
    pub fn reset_secret(&self) -> Result<()> {
        let _guard = self
            .create_lock
            .lock()
            .map_err(|_| PassphraseError::Corrupt("secret creation lock poisoned".to_string()))?;

        match self.prefs.remove(WRAPPED_SECRET_KEY) {
            Ok(()) => self.prefs.remove(SECRET_BOUND_KEY)?,
            Err(PreferenceError::Corrupt { .. }) => self.prefs.clear()?,
            Err(err) => return Err(err.into()),
        }
        self.wrapper.delete_key_pair(&self.alias)?;
        self.unwrap_failed.store(false, Ordering::SeqCst);

        tracing::warn!(alias = %self.alias, "Database secret reset by user request");
        self.refresh_state()?;
        Ok(())
    }

    fn read_record(&self) -> Result<Record> {
        let encoded = match self.prefs.get(WRAPPED_SECRET_KEY) {
            Ok(Some(encoded)) => encoded,
            Ok(None) => return Ok(Record::Missing),
            Err(PreferenceError::Corrupt { reason, .. }) => {
                return Ok(Record::Unreadable(format!("secure preferences: {reason}")))
            }
            Err(err) => return Err(err.into()),
        };
        Ok(match serde_json::from_str(&encoded) {
            Ok(wrapped) => Record::Wrapped(wrapped),
            Err(e) => Record::Unreadable(format!("decode wrapped secret: {e}")),
        })
    }

    fn unreadable(&self, reason: String) -> PassphraseError {
        tracing::warn!(error = %reason, "Wrapped database secret is unreadable");
        self.publish(PassphraseState::Invalid);
        PassphraseError::SecretInvalid(KeyVaultError::UnwrapFailed(reason))
    }

    fn refresh_state(&self) -> Result<PassphraseState> {
        let state = if self.unwrap_failed.load(Ordering::SeqCst) {
            PassphraseState::Invalid
        } else {
            match self.read_record()? {
                Record::Unreadable(_) => PassphraseState::Invalid,
                Record::Wrapped(_) => PassphraseState::Set,
                Record::Missing if self.database_path.exists() => PassphraseState::NotSet,
                Record::Missing => PassphraseState::NeedsCreation,
            }
        };
        self.publish(state);
        Ok(state)
    }

    fn publish(&self, state: PassphraseState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::debug!(from = %previous, to = %state, "Passphrase state changed");
        }
    }
}
