//! Encryption for cached records using AES-256-GCM
//!
//! Two key holders live here:
//! - [`KeyManager`]: the L1 key, regenerated on a fixed interval. It keeps the
//!   current generation and the one retired just before it, so entries sealed
//!   under the previous key can still be opened and re-sealed on next access.
//! - [`StorageCipher`]: a keyring shared by every instance writing to L2/L3.
//!   New values are sealed under the current key id; older ids stay decrypt-only.

use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit, Payload},
};
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use parking_lot::RwLock;
use rand::{RngCore, rngs::OsRng};
use tracing::{debug, info};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::CryptoError;

/// Nonce size for AES-256-GCM (96 bits)
pub const NONCE_SIZE: usize = 12;

/// Key size for AES-256 (256 bits)
pub const KEY_SIZE: usize = 32;

/// Environment variable holding the base64 L2/L3 storage key
pub const STORAGE_KEY_ENV: &str = "AUTHCACHE_STORAGE_KEY";

/// Environment variable naming the storage key id
pub const STORAGE_KEY_ID_ENV: &str = "AUTHCACHE_STORAGE_KEY_ID";

type KeyBytes = Zeroizing<[u8; KEY_SIZE]>;

fn random_key() -> KeyBytes {
    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    OsRng.fill_bytes(&mut key[..]);
    key
}

fn random_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

fn seal_with(
    key: &[u8; KEY_SIZE],
    nonce: &[u8; NONCE_SIZE],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| CryptoError::InvalidKey(format!("Failed to create cipher: {e}")))?;
    cipher
        .encrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| CryptoError::Encrypt)
}

fn open_with(
    key: &[u8; KEY_SIZE],
    nonce: &[u8; NONCE_SIZE],
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| CryptoError::InvalidKey(format!("Failed to create cipher: {e}")))?;
    cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map(Zeroizing::new)
        .map_err(|_| CryptoError::Decrypt)
}

/// Ciphertext held by the L1 store; overwritten with zeros when dropped
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SealedBlob {
    generation: u64,
    nonce: [u8; NONCE_SIZE],
    ciphertext: Vec<u8>,
}

impl SealedBlob {
    /// Key generation this blob was sealed under
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn len(&self) -> usize {
        self.ciphertext.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ciphertext.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn corrupt(&mut self) {
        if let Some(byte) = self.ciphertext.first_mut() {
            *byte ^= 0xff;
        }
    }
}

impl fmt::Debug for SealedBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SealedBlob")
            .field("generation", &self.generation)
            .field("len", &self.ciphertext.len())
            .finish()
    }
}

struct KeyVersion {
    generation: u64,
    key: KeyBytes,
    created_at: Instant,
}

impl KeyVersion {
    fn fresh(generation: u64) -> Self {
        Self {
            generation,
            key: random_key(),
            created_at: Instant::now(),
        }
    }
}

struct KeyRing {
    current: KeyVersion,
    previous: Option<KeyVersion>,
}

/// Owner of the rotating L1 encryption key
pub struct KeyManager {
    ring: RwLock<KeyRing>,
    rotation_interval: Duration,
}

impl KeyManager {
    pub fn new(rotation_interval: Duration) -> Self {
        Self {
            ring: RwLock::new(KeyRing {
                current: KeyVersion::fresh(1),
                previous: None,
            }),
            rotation_interval,
        }
    }

    pub fn rotation_interval(&self) -> Duration {
        self.rotation_interval
    }

    pub fn current_generation(&self) -> u64 {
        self.ring.read().current.generation
    }

    /// Generate a new key; the old current key is kept for decryption only and
    /// the one before it is dropped (and zeroized)
    pub fn rotate(&self) -> u64 {
        let mut ring = self.ring.write();
        let next = KeyVersion::fresh(ring.current.generation + 1);
        let retired = std::mem::replace(&mut ring.current, next);
        ring.previous = Some(retired);
        info!("L1 key rotated to generation {}", ring.current.generation);
        ring.current.generation
    }

    /// Rotate when the current key is older than the rotation interval
    pub fn rotate_if_due(&self) -> bool {
        let due = self.ring.read().current.created_at.elapsed() >= self.rotation_interval;
        if due {
            self.rotate();
        }
        due
    }

    /// Encrypt under the current key
    pub fn seal(&self, plaintext: &[u8], aad: &[u8]) -> Result<SealedBlob, CryptoError> {
        let ring = self.ring.read();
        let nonce = random_nonce();
        let ciphertext = seal_with(&ring.current.key, &nonce, plaintext, aad)?;
        Ok(SealedBlob {
            generation: ring.current.generation,
            nonce,
            ciphertext,
        })
    }

    /// Decrypt a blob sealed under the current or the previous key
    pub fn open(&self, blob: &SealedBlob, aad: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        let ring = self.ring.read();
        let version = if blob.generation == ring.current.generation {
            &ring.current
        } else {
            match &ring.previous {
                Some(previous) if previous.generation == blob.generation => previous,
                _ => {
                    debug!("Blob sealed under retired key generation {}", blob.generation);
                    return Err(CryptoError::RetiredKey(blob.generation));
                }
            }
        };
        open_with(&version.key, &blob.nonce, &blob.ciphertext, aad)
    }
}

impl fmt::Debug for KeyManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyManager")
            .field("generation", &self.current_generation())
            .field("rotation_interval", &self.rotation_interval)
            .finish()
    }
}

/// Ciphertext produced by [`StorageCipher`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageCiphertext {
    pub key_id: String,
    pub nonce: [u8; NONCE_SIZE],
    pub ciphertext: Vec<u8>,
}

/// Keyring for values written to L2/L3
#[derive(Clone)]
pub struct StorageCipher {
    current_key_id: String,
    keys: HashMap<String, KeyBytes>,
}

impl StorageCipher {
    pub fn new(key_id: impl Into<String>, key: [u8; KEY_SIZE]) -> Self {
        let key_id = key_id.into();
        let mut keys = HashMap::new();
        keys.insert(key_id.clone(), Zeroizing::new(key));
        Self {
            current_key_id: key_id,
            keys,
        }
    }

    /// Keyring with a freshly generated random key
    pub fn generate(key_id: impl Into<String>) -> Self {
        let key = random_key();
        Self::new(key_id, *key)
    }

    /// Load the storage key from `AUTHCACHE_STORAGE_KEY` (base64, 32 bytes)
    pub fn from_env() -> Result<Option<Self>, CryptoError> {
        match std::env::var(STORAGE_KEY_ENV) {
            Ok(key_str) => {
                let key = Self::parse_key(&key_str)?;
                let key_id =
                    std::env::var(STORAGE_KEY_ID_ENV).unwrap_or_else(|_| "primary".to_owned());
                Ok(Some(Self::new(key_id, *key)))
            }
            Err(std::env::VarError::NotPresent) => Ok(None),
            Err(e) => Err(CryptoError::InvalidKey(format!(
                "Failed to read {STORAGE_KEY_ENV}: {e}"
            ))),
        }
    }

    /// Parse a base64-encoded 32-byte key
    pub fn parse_key(key_str: &str) -> Result<KeyBytes, CryptoError> {
        let bytes = Zeroizing::new(BASE64.decode(key_str.trim())?);
        if bytes.len() != KEY_SIZE {
            return Err(CryptoError::InvalidKey(format!(
                "expected {KEY_SIZE} bytes, got {}",
                bytes.len()
            )));
        }
        let mut key = Zeroizing::new([0u8; KEY_SIZE]);
        key.copy_from_slice(&bytes);
        Ok(key)
    }

    /// Add a decrypt-only key (e.g. the key in use before a storage key rotation)
    pub fn with_decrypt_key(mut self, key_id: impl Into<String>, key: [u8; KEY_SIZE]) -> Self {
        self.keys
            .entry(key_id.into())
            .or_insert_with(|| Zeroizing::new(key));
        self
    }

    pub fn current_key_id(&self) -> &str {
        &self.current_key_id
    }

    pub fn encrypt(&self, plaintext: &[u8], aad: &[u8]) -> Result<StorageCiphertext, CryptoError> {
        let key = self
            .keys
            .get(&self.current_key_id)
            .ok_or_else(|| CryptoError::UnknownKey(self.current_key_id.clone()))?;
        let nonce = random_nonce();
        let ciphertext = seal_with(key, &nonce, plaintext, aad)?;
        Ok(StorageCiphertext {
            key_id: self.current_key_id.clone(),
            nonce,
            ciphertext,
        })
    }

    pub fn decrypt(
        &self,
        sealed: &StorageCiphertext,
        aad: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        let key = self
            .keys
            .get(&sealed.key_id)
            .ok_or_else(|| CryptoError::UnknownKey(sealed.key_id.clone()))?;
        open_with(key, &sealed.nonce, &sealed.ciphertext, aad)
    }
}

impl fmt::Debug for StorageCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageCipher")
            .field("current_key_id", &self.current_key_id)
            .field("keys", &self.keys.len())
            .finish()
    }
}
