//! In-process storage engine for exercising the bootstrap logic.
//!
//! Plain `SQLite` ignores `PRAGMA key`, so it cannot tell a right key from a
//! wrong one. [`SealedFileEngine`] stores one AEAD-sealed blob per file and
//! rejects any key that does not authenticate it.

use crate::engine::{KeyFormat, StorageEngine, StoreKey};
use crate::error::{DatabaseError, Result};
use async_trait::async_trait;
use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tallybook_keys::WipeWitness;

const MAGIC: &[u8; 8] = b"TBSEAL1\0";
const NONCE_LEN: usize = 12;

/// Content written into files created by [`SealedFileEngine::open`].
pub const FRESH_CONTENTS: &[u8] = b"fresh store";

fn derive_key(key: StoreKey<'_>) -> Result<[u8; 32]> {
    match key.format {
        KeyFormat::Raw => key
            .secret
            .expose()
            .try_into()
            .map_err(|_| DatabaseError::InvalidKey),
        KeyFormat::Passphrase => Ok(Sha256::digest(key.secret.expose()).into()),
    }
}

fn seal(key: &[u8; 32], contents: &[u8]) -> Vec<u8> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
    let ciphertext = cipher.encrypt(&nonce, contents).expect("seal contents");
    let mut out = MAGIC.to_vec();
    out.extend_from_slice(nonce.as_slice());
    out.extend_from_slice(&ciphertext);
    out
}

fn unseal(key: &[u8; 32], sealed: &[u8]) -> Result<Vec<u8>> {
    if sealed.len() < MAGIC.len() + NONCE_LEN || &sealed[..MAGIC.len()] != MAGIC {
        return Err(DatabaseError::Open("not a sealed store".to_string()));
    }
    let (nonce, ciphertext) = sealed[MAGIC.len()..].split_at(NONCE_LEN);
    ChaCha20Poly1305::new(Key::from_slice(key))
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| DatabaseError::InvalidKey)
}

/// Write a sealed file the way an earlier app version would have.
pub fn write_sealed(path: &Path, key: StoreKey<'_>, contents: &[u8]) {
    let key = derive_key(key).expect("derive key");
    std::fs::write(path, seal(&key, contents)).expect("write sealed file");
}

/// Read a sealed file, `None` if `key` does not open it.
pub fn read_sealed(path: &Path, key: StoreKey<'_>) -> Option<Vec<u8>> {
    let key = derive_key(key).ok()?;
    let sealed = std::fs::read(path).ok()?;
    unseal(&key, &sealed).ok()
}

/// Open handle to a sealed file.
#[derive(Debug)]
pub struct SealedHandle {
    /// File backing the handle.
    pub path: PathBuf,
    /// Decrypted contents.
    pub contents: Vec<u8>,
}

/// Storage engine over sealed files, with counters and failure injection.
#[derive(Debug, Default)]
pub struct SealedFileEngine {
    /// Fail every `open`.
    pub fail_open: AtomicBool,
    /// Fail every `rekey` without touching the file.
    pub fail_rekey: AtomicBool,
    /// Delay each `open`, widening race windows.
    pub open_delay_ms: AtomicU64,
    raw_opens: AtomicUsize,
    passphrase_opens: AtomicUsize,
    rekeys: AtomicUsize,
    closes: AtomicUsize,
    witnesses: Mutex<Vec<WipeWitness>>,
}

impl SealedFileEngine {
    /// Opens attempted with a raw key.
    pub fn raw_opens(&self) -> usize {
        self.raw_opens.load(Ordering::SeqCst)
    }

    /// Opens attempted with a passphrase key.
    pub fn passphrase_opens(&self) -> usize {
        self.passphrase_opens.load(Ordering::SeqCst)
    }

    /// Rekeys attempted.
    pub fn rekeys(&self) -> usize {
        self.rekeys.load(Ordering::SeqCst)
    }

    /// Handles closed.
    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Witnesses for every key buffer handed to the engine.
    pub fn key_witnesses(&self) -> Vec<WipeWitness> {
        self.witnesses.lock().expect("witness lock").clone()
    }

    fn observe(&self, key: StoreKey<'_>) {
        self.witnesses
            .lock()
            .expect("witness lock")
            .push(key.secret.witness());
    }
}

#[async_trait]
impl StorageEngine for SealedFileEngine {
    type Handle = SealedHandle;

    async fn open(&self, path: &Path, key: StoreKey<'_>) -> Result<SealedHandle> {
        self.observe(key);
        match key.format {
            KeyFormat::Raw => self.raw_opens.fetch_add(1, Ordering::SeqCst),
            KeyFormat::Passphrase => self.passphrase_opens.fetch_add(1, Ordering::SeqCst),
        };

        let delay = self.open_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(DatabaseError::Open("injected open failure".to_string()));
        }

        let derived = derive_key(key)?;
        let contents = match tokio::fs::read(path).await {
            Ok(sealed) => unseal(&derived, &sealed)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tokio::fs::write(path, seal(&derived, FRESH_CONTENTS)).await?;
                FRESH_CONTENTS.to_vec()
            }
            Err(e) => return Err(e.into()),
        };

        Ok(SealedHandle {
            path: path.to_path_buf(),
            contents,
        })
    }

    async fn rekey(&self, handle: &SealedHandle, key: StoreKey<'_>) -> Result<()> {
        self.observe(key);
        self.rekeys.fetch_add(1, Ordering::SeqCst);
        if self.fail_rekey.load(Ordering::SeqCst) {
            return Err(DatabaseError::Rekey("injected rekey failure".to_string()));
        }

        // Stage under the new key, then swap.
        let derived = derive_key(key)?;
        let staged = handle.path.with_extension("rekey");
        tokio::fs::write(&staged, seal(&derived, &handle.contents)).await?;
        tokio::fs::rename(&staged, &handle.path).await?;
        Ok(())
    }

    async fn initialize_schema(&self, _handle: &SealedHandle) -> Result<()> {
        Ok(())
    }

    async fn close(&self, _handle: SealedHandle) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}
