//! Secure key stores holding the X25519 key pair that wraps the database secret.
//!
//! A [`SecureKeyStore`] can create a key pair, publish its public half and
//! perform a Diffie-Hellman agreement with it. The trait never hands the
//! private half to its caller, so a hardware-backed store (Secure Enclave,
//! Android Keystore) can implement it with a non-exportable key.
//!
//! The stores in this module are software stores and give no such
//! guarantee: the private key lives in the OS credential store or in
//! process memory, and is readable by anything that can read those.

use crate::error::{KeyVaultError, KeyVaultResult};
use crate::secret::SecretBuffer;
use keyring::Entry;
use rand::rngs::OsRng;
use std::collections::HashMap;
use std::sync::Mutex;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

/// Length of X25519 public keys and shared secrets.
pub const X25519_KEY_LENGTH: usize = 32;

/// Operations a secure key store offers on the key pair stored under an alias.
pub trait SecureKeyStore: Send + Sync {
    /// Whether a key pair exists under `alias`.
    fn contains(&self, alias: &str) -> KeyVaultResult<bool>;

    /// Create a fresh key pair under `alias`, replacing any existing one.
    fn generate(&self, alias: &str) -> KeyVaultResult<()>;

    /// Public half of the key pair.
    fn public_key(&self, alias: &str) -> KeyVaultResult<[u8; X25519_KEY_LENGTH]>;

    /// X25519 agreement between the stored private key and `peer_public`.
    fn agree(
        &self,
        alias: &str,
        peer_public: &[u8; X25519_KEY_LENGTH],
    ) -> KeyVaultResult<SecretBuffer>;

    /// Remove the key pair. Removing a missing alias is not an error.
    fn delete(&self, alias: &str) -> KeyVaultResult<()>;
}

fn agree_with(
    secret: &StaticSecret,
    peer_public: &[u8; X25519_KEY_LENGTH],
) -> KeyVaultResult<SecretBuffer> {
    let shared = secret.diffie_hellman(&PublicKey::from(*peer_public));
    if !shared.was_contributory() {
        return Err(KeyVaultError::UnwrapFailed(
            "peer public key is a low-order point".to_string(),
        ));
    }
    Ok(SecretBuffer::from_slice(shared.as_bytes()))
}

/// Key store backed by the OS credential store via the `keyring` crate.
///
/// The private key is stored hex-encoded as the entry's password. Any
/// process running as the same user with access to the credential store can
/// read it. Each agreement loads it into process memory and zeroizes it
/// afterwards.
#[derive(Debug, Clone)]
pub struct KeyringKeyStore {
    service: String,
}

impl KeyringKeyStore {
    /// Create a store that files entries under `service`.
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn entry(&self, alias: &str) -> KeyVaultResult<Entry> {
        Entry::new(&self.service, alias)
            .map_err(|e| KeyVaultError::Backend(format!("keyring init: {e}")))
    }

    fn load_secret(&self, alias: &str) -> KeyVaultResult<StaticSecret> {
        let encoded = match self.entry(alias)?.get_password() {
            Ok(value) => Zeroizing::new(value),
            Err(keyring::Error::NoEntry) => {
                return Err(KeyVaultError::KeyUnavailable(alias.to_string()))
            }
            Err(e) => return Err(KeyVaultError::Backend(format!("load key pair: {e}"))),
        };

        let mut bytes = Zeroizing::new([0u8; X25519_KEY_LENGTH]);
        hex::decode_to_slice(encoded.as_bytes(), &mut bytes[..]).map_err(|_| {
            // An entry we cannot parse is as unusable as a missing one.
            tracing::warn!(alias, "Keyring entry does not hold a valid X25519 key");
            KeyVaultError::KeyUnavailable(alias.to_string())
        })?;
        Ok(StaticSecret::from(*bytes))
    }
}

impl SecureKeyStore for KeyringKeyStore {
    fn contains(&self, alias: &str) -> KeyVaultResult<bool> {
        match self.entry(alias)?.get_password() {
            Ok(value) => {
                drop(Zeroizing::new(value));
                Ok(true)
            }
            Err(keyring::Error::NoEntry) => Ok(false),
            Err(e) => Err(KeyVaultError::Backend(format!("probe key pair: {e}"))),
        }
    }

    fn generate(&self, alias: &str) -> KeyVaultResult<()> {
        let secret = StaticSecret::random_from_rng(OsRng);
        let encoded = Zeroizing::new(hex::encode(secret.to_bytes()));
        self.entry(alias)?
            .set_password(&encoded)
            .map_err(|e| KeyVaultError::Backend(format!("store key pair: {e}")))?;
        tracing::info!(alias, "Generated wrapping key pair in OS credential store");
        Ok(())
    }

    fn public_key(&self, alias: &str) -> KeyVaultResult<[u8; X25519_KEY_LENGTH]> {
        let secret = self.load_secret(alias)?;
        Ok(PublicKey::from(&secret).to_bytes())
    }

    fn agree(
        &self,
        alias: &str,
        peer_public: &[u8; X25519_KEY_LENGTH],
    ) -> KeyVaultResult<SecretBuffer> {
        let secret = self.load_secret(alias)?;
        agree_with(&secret, peer_public)
    }

    fn delete(&self, alias: &str) -> KeyVaultResult<()> {
        match self.entry(alias)?.delete_password() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(KeyVaultError::Backend(format!("delete key pair: {e}"))),
        }
    }
}

/// Process-local key store. Keys vanish with the process.
#[derive(Default)]
pub struct MemoryKeyStore {
    keys: Mutex<HashMap<String, StaticSecret>>,
}

impl MemoryKeyStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the key pair under `alias` with an unrelated one, the way a
    /// device security event invalidates a hardware-backed key.
    pub fn invalidate(&self, alias: &str) -> KeyVaultResult<()> {
        self.generate(alias)
    }

    fn keys(&self) -> KeyVaultResult<std::sync::MutexGuard<'_, HashMap<String, StaticSecret>>> {
        self.keys
            .lock()
            .map_err(|_| KeyVaultError::Backend("memory key store lock poisoned".to_string()))
    }
}

impl std::fmt::Debug for MemoryKeyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let aliases = self.keys().map(|k| k.len()).unwrap_or(0);
        f.debug_struct("MemoryKeyStore")
            .field("aliases", &aliases)
            .finish()
    }
}

impl SecureKeyStore for MemoryKeyStore {
    fn contains(&self, alias: &str) -> KeyVaultResult<bool> {
        Ok(self.keys()?.contains_key(alias))
    }

    fn generate(&self, alias: &str) -> KeyVaultResult<()> {
        let secret = StaticSecret::random_from_rng(OsRng);
        self.keys()?.insert(alias.to_string(), secret);
        Ok(())
    }

    fn public_key(&self, alias: &str) -> KeyVaultResult<[u8; X25519_KEY_LENGTH]> {
        let keys = self.keys()?;
        let secret = keys
            .get(alias)
            .ok_or_else(|| KeyVaultError::KeyUnavailable(alias.to_string()))?;
        Ok(PublicKey::from(secret).to_bytes())
    }

    fn agree(
        &self,
        alias: &str,
        peer_public: &[u8; X25519_KEY_LENGTH],
    ) -> KeyVaultResult<SecretBuffer> {
        let keys = self.keys()?;
        let secret = keys
            .get(alias)
            .ok_or_else(|| KeyVaultError::KeyUnavailable(alias.to_string()))?;
        agree_with(secret, peer_public)
    }

    fn delete(&self, alias: &str) -> KeyVaultResult<()> {
        self.keys()?.remove(alias);
        Ok(())
    }
}
