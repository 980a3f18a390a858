//! AES-256-GCM sealing for the metadata section.

use crate::crypto::kdf::MasterKey;
use crate::error::{Error, Result};
use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use rand::RngCore;

/// Nonce size for AES-GCM (96 bits).
pub const NONCE_SIZE: usize = 12;

/// Authentication tag size (128 bits).
pub const TAG_SIZE: usize = 16;

/// AES-256-GCM cipher wrapper.
pub struct Cipher {
    cipher: Aes256Gcm,
}

impl Cipher {
    /// Create a cipher from the archive master key.
    pub fn new(key: &MasterKey) -> Self {
        Self {
            cipher: Aes256Gcm::new(key.as_bytes().into()),
        }
    }

    /// Encrypt data with a random nonce.
    ///
    /// Returns: nonce (12 bytes) || ciphertext || tag (16 bytes)
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| Error::Encryption(e.to_string()))?;

        let mut result = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        result.extend_from_slice(&nonce_bytes);
        result.extend_from_slice(&ciphertext);

        Ok(result)
    }

    /// Decrypt data that was encrypted with `encrypt`.
    ///
    /// Expects: nonce (12 bytes) || ciphertext || tag (16 bytes)
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.len() < NONCE_SIZE + TAG_SIZE {
            return Err(Error::Decryption);
        }

        let (nonce_bytes, ciphertext) = ciphertext.split_at(NONCE_SIZE);
        let nonce = Nonce::from_slice(nonce_bytes);

        self.cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| Error::Decryption)
    }
}

/// Seal a serialized metadata tree. Plaintext archives store it as is.
pub fn seal_metadata(plaintext: &[u8], key: Option<&MasterKey>) -> Result<Vec<u8>> {
    match key {
        Some(key) => Cipher::new(key).encrypt(plaintext),
        None => Ok(plaintext.to_vec()),
    }
}

/// Open a sealed metadata tree.
pub fn open_metadata(sealed: &[u8], key: Option<&MasterKey>) -> Result<Vec<u8>> {
    match key {
        Some(key) => Cipher::new(key).decrypt(sealed),
        None => Ok(sealed.to_vec()),
    }
}
