//! Zeroizing buffers for raw key material.
//!
//! Every function in this workspace that hands out raw secret bytes does so
//! through a [`SecretBuffer`]. The holder calls [`SecretBuffer::wipe`] once the
//! bytes are no longer needed; dropping the buffer wipes it as well, so an
//! early return through `?` cannot leave key material behind.

use rand::{rngs::OsRng, RngCore};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use zeroize::Zeroize;

/// Owned key bytes that are overwritten with zeroes on release.
pub struct SecretBuffer {
    bytes: Vec<u8>,
    wiped: Arc<AtomicBool>,
}

impl SecretBuffer {
    /// Take ownership of `bytes`.
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            wiped: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Copy `bytes` into a new buffer. The caller remains responsible for
    /// its own copy.
    #[must_use]
    pub fn from_slice(bytes: &[u8]) -> Self {
        Self::new(bytes.to_vec())
    }

    /// Fill a new buffer of `len` bytes from the OS CSPRNG.
    #[must_use]
    pub fn random(len: usize) -> Self {
        let mut bytes = vec![0u8; len];
        OsRng.fill_bytes(&mut bytes);
        Self::new(bytes)
    }

    /// Borrow the plaintext bytes. Empty once wiped.
    #[must_use]
    pub fn expose(&self) -> &[u8] {
        &self.bytes
    }

    /// Number of bytes held (zero after a wipe).
    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the buffer holds no bytes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Overwrite the bytes with zeroes. Safe to call more than once.
    pub fn wipe(&mut self) {
        self.bytes.zeroize();
        self.wiped.store(true, Ordering::SeqCst);
    }

    /// Whether [`wipe`](Self::wipe) has run.
    #[must_use]
    pub fn is_wiped(&self) -> bool {
        self.wiped.load(Ordering::SeqCst)
    }

    /// An observer that outlives the buffer and reports whether it was wiped.
    ///
    /// Exposes nothing about the contents.
    #[must_use]
    pub fn witness(&self) -> WipeWitness {
        WipeWitness {
            wiped: Arc::clone(&self.wiped),
        }
    }
}

impl Drop for SecretBuffer {
    fn drop(&mut self) {
        self.wipe();
    }
}

impl fmt::Debug for SecretBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretBuffer")
            .field("len", &self.bytes.len())
            .field("wiped", &self.is_wiped())
            .finish()
    }
}

/// Reports whether a [`SecretBuffer`] has been wiped.
#[derive(Debug, Clone)]
pub struct WipeWitness {
    wiped: Arc<AtomicBool>,
}

impl WipeWitness {
    /// `true` once the observed buffer was wiped or dropped.
    #[must_use]
    pub fn is_wiped(&self) -> bool {
        self.wiped.load(Ordering::SeqCst)
    }
}
