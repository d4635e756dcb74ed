//! Asymmetric wrapping of the database secret.
//!
//! The secret is sealed to the public half of an X25519 key pair held in a
//! [`SecureKeyStore`]: a fresh ephemeral key agrees with the stored public
//! key, HKDF-SHA256 turns the shared secret into a ChaCha20-Poly1305 key, and
//! the AEAD seals the secret with the key alias as associated data.
//! Unwrapping repeats the agreement inside the key store, so the private key
//! never leaves it.
//!
//! # Envelope
//!
//! ```text
//! version (1) || ephemeral public key (32) || nonce (12) || ciphertext + tag
//! ```

use crate::error::{KeyVaultError, KeyVaultResult};
use crate::keystore::{SecureKeyStore, X25519_KEY_LENGTH};
use crate::secret::SecretBuffer;
use chacha20poly1305::{
    aead::{Aead, AeadCore, KeyInit, OsRng, Payload},
    ChaCha20Poly1305, Key, Nonce,
};
use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use x25519_dalek::{EphemeralSecret, PublicKey};
use zeroize::Zeroizing;

/// Envelope format version.
pub const ENVELOPE_VERSION: u8 = 1;

/// Length of the ChaCha20-Poly1305 nonce.
const NONCE_LENGTH: usize = 12;

/// Length of the Poly1305 tag.
const TAG_LENGTH: usize = 16;

const HEADER_LENGTH: usize = 1 + X25519_KEY_LENGTH + NONCE_LENGTH;

const HKDF_INFO: &[u8] = b"tallybook/secret-wrap/v1";

/// Ciphertext form of the database secret plus the alias of the key pair
/// that sealed it. This is the only durable form of the secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrappedSecret {
    /// Alias of the wrapping key pair
    pub alias: String,
    /// Sealed envelope
    #[serde(with = "hex_bytes")]
    pub ciphertext: Vec<u8>,
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        hex::decode(encoded).map_err(serde::de::Error::custom)
    }
}

/// The seam between the passphrase store and whatever protects its secret.
pub trait SecretWrapper: Send + Sync {
    /// Create the key pair under `alias` if it does not exist yet.
    fn ensure_key_pair(&self, alias: &str) -> KeyVaultResult<()>;

    /// Seal `secret` to the key pair under `alias`.
    fn wrap(&self, alias: &str, secret: &SecretBuffer) -> KeyVaultResult<WrappedSecret>;

    /// Recover the plaintext secret. The caller wipes the returned buffer.
    fn unwrap(&self, wrapped: &WrappedSecret) -> KeyVaultResult<SecretBuffer>;

    /// Remove the key pair under `alias`.
    fn delete_key_pair(&self, alias: &str) -> KeyVaultResult<()>;
}

/// X25519 + ChaCha20-Poly1305 key vault over a secure key store.
#[derive(Debug)]
pub struct KeyVault<S> {
    store: S,
}

impl<S: SecureKeyStore> KeyVault<S> {
    /// Create a vault delegating key custody to `store`.
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// The underlying key store.
    pub fn store(&self) -> &S {
        &self.store
    }
}

fn derive_wrap_key(
    shared: &SecretBuffer,
    ephemeral_public: &[u8; X25519_KEY_LENGTH],
    recipient_public: &[u8; X25519_KEY_LENGTH],
) -> KeyVaultResult<Zeroizing<[u8; 32]>> {
    let mut salt = [0u8; 2 * X25519_KEY_LENGTH];
    salt[..X25519_KEY_LENGTH].copy_from_slice(ephemeral_public);
    salt[X25519_KEY_LENGTH..].copy_from_slice(recipient_public);

    let hk = Hkdf::<Sha256>::new(Some(&salt), shared.expose());
    let mut okm = Zeroizing::new([0u8; 32]);
    hk.expand(HKDF_INFO, &mut okm[..])
        .map_err(|e| KeyVaultError::WrapFailed(format!("key derivation failed: {e}")))?;
    Ok(okm)
}

impl<S: SecureKeyStore> SecretWrapper for KeyVault<S> {
    fn ensure_key_pair(&self, alias: &str) -> KeyVaultResult<()> {
        if self.store.contains(alias)? {
            return Ok(());
        }
        self.store.generate(alias)
    }

    fn wrap(&self, alias: &str, secret: &SecretBuffer) -> KeyVaultResult<WrappedSecret> {
        if secret.is_wiped() {
            return Err(KeyVaultError::WrapFailed(
                "secret buffer was already wiped".to_string(),
            ));
        }

        let recipient_public = self.store.public_key(alias)?;

        let ephemeral = EphemeralSecret::random_from_rng(OsRng);
        let ephemeral_public = PublicKey::from(&ephemeral).to_bytes();
        let shared = ephemeral.diffie_hellman(&PublicKey::from(recipient_public));
        let mut shared = SecretBuffer::from_slice(shared.as_bytes());

        let key = derive_wrap_key(&shared, &ephemeral_public, &recipient_public)?;
        shared.wipe();

        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key[..]));
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let sealed = cipher
            .encrypt(
                &nonce,
                Payload {
                    msg: secret.expose(),
                    aad: alias.as_bytes(),
                },
            )
            .map_err(|e| KeyVaultError::WrapFailed(format!("encryption failed: {e}")))?;

        let mut ciphertext = Vec::with_capacity(HEADER_LENGTH + sealed.len());
        ciphertext.push(ENVELOPE_VERSION);
        ciphertext.extend_from_slice(&ephemeral_public);
        ciphertext.extend_from_slice(nonce.as_slice());
        ciphertext.extend_from_slice(&sealed);

        Ok(WrappedSecret {
            alias: alias.to_string(),
            ciphertext,
        })
    }

    fn unwrap(&self, wrapped: &WrappedSecret) -> KeyVaultResult<SecretBuffer> {
        let data = &wrapped.ciphertext;
        if data.len() < HEADER_LENGTH + TAG_LENGTH {
            return Err(KeyVaultError::UnwrapFailed(format!(
                "envelope too short: {} bytes",
                data.len()
            )));
        }
        if data[0] != ENVELOPE_VERSION {
            return Err(KeyVaultError::UnwrapFailed(format!(
                "unsupported envelope version {}",
                data[0]
            )));
        }

        let mut ephemeral_public = [0u8; X25519_KEY_LENGTH];
        ephemeral_public.copy_from_slice(&data[1..=X25519_KEY_LENGTH]);
        let nonce = Nonce::from_slice(&data[1 + X25519_KEY_LENGTH..HEADER_LENGTH]);
        let sealed = &data[HEADER_LENGTH..];

        let recipient_public = self.store.public_key(&wrapped.alias)?;
        let mut shared = self.store.agree(&wrapped.alias, &ephemeral_public)?;
        let key = derive_wrap_key(&shared, &ephemeral_public, &recipient_public)
            .map_err(|e| KeyVaultError::UnwrapFailed(e.to_string()))?;
        shared.wipe();

        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key[..]));
        let plaintext = cipher
            .decrypt(
                nonce,
                Payload {
                    msg: sealed,
                    aad: wrapped.alias.as_bytes(),
                },
            )
            .map_err(|_| {
                KeyVaultError::UnwrapFailed(
                    "authentication failed (wrong key pair or tampered envelope)".to_string(),
                )
            })?;

        Ok(SecretBuffer::new(plaintext))
    }

    fn delete_key_pair(&self, alias: &str) -> KeyVaultResult<()> {
        self.store.delete(alias)
    }
}
