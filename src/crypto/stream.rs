//! Per-file counter-mode encryption state.
//!
//! Every file rewrite gets a fresh random IV under the shared master key.
//! Reusing an IV with the same key leaks the XOR of two plaintexts, so
//! [`FileCrypto::generate`] is the only constructor that hands out new IVs.

use crate::crypto::kdf::MasterKey;
use crate::error::{Error, Result};
use chacha20::ChaCha20;
use ctr::cipher::{KeyIvInit, StreamCipher};
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;

/// SHA-256 digest length.
pub const DIGEST_SIZE: usize = 32;

/// Symmetric cipher applied to file content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CipherKind {
    #[serde(rename = "none")]
    None,
    #[serde(rename = "aes-256-ctr")]
    Aes256Ctr,
    #[serde(rename = "chacha20")]
    ChaCha20,
}

impl CipherKind {
    /// IV / nonce length this cipher needs.
    pub fn iv_len(self) -> usize {
        match self {
            CipherKind::None => 0,
            CipherKind::Aes256Ctr => 16,
            CipherKind::ChaCha20 => 12,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CipherKind::None => "none",
            CipherKind::Aes256Ctr => "aes-256-ctr",
            CipherKind::ChaCha20 => "chacha20",
        }
    }
}

impl fmt::Display for CipherKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CipherKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(CipherKind::None),
            "aes-256-ctr" | "aes" => Ok(CipherKind::Aes256Ctr),
            "chacha20" => Ok(CipherKind::ChaCha20),
            other => Err(Error::InvalidConfig(format!("unknown cipher: {}", other))),
        }
    }
}

/// Cipher choice, IV and plaintext digest attached to one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileCrypto {
    pub cipher: CipherKind,
    /// IV or nonce; absent for unencrypted content.
    #[serde(with = "hex_opt", default)]
    pub encryption_data: Option<Vec<u8>>,
    /// SHA-256 of the plaintext; absent until content has been written.
    #[serde(with = "hex_opt", default)]
    pub digest: Option<Vec<u8>>,
}

impl FileCrypto {
    /// State for a file that has never been written.
    pub fn empty() -> Self {
        Self {
            cipher: CipherKind::None,
            encryption_data: None,
            digest: None,
        }
    }

    /// Fresh state for a new write, with a random IV from the thread CSPRNG.
    pub fn generate(cipher: CipherKind) -> Self {
        let encryption_data = match cipher.iv_len() {
            0 => None,
            len => {
                let mut iv = vec![0u8; len];
                rand::thread_rng().fill_bytes(&mut iv);
                Some(iv)
            }
        };
        Self {
            cipher,
            encryption_data,
            digest: None,
        }
    }

    /// Hex rendering of the digest, for display.
    pub fn digest_hex(&self) -> Option<String> {
        self.digest.as_ref().map(hex::encode)
    }
}

/// Running keystream for one file, positioned at the start of its content.
pub enum Keystream {
    Aes256Ctr(Box<Aes256Ctr>),
    ChaCha20(Box<ChaCha20>),
}

impl Keystream {
    /// Build the keystream for `crypto`, or `None` for unencrypted content.
    pub fn new(crypto: &FileCrypto, key: &MasterKey) -> Result<Option<Self>> {
        if crypto.cipher == CipherKind::None {
            return Ok(None);
        }

        let iv = crypto
            .encryption_data
            .as_deref()
            .filter(|iv| iv.len() == crypto.cipher.iv_len())
            .ok_or(Error::Decryption)?;

        let stream = match crypto.cipher {
            CipherKind::None => return Ok(None),
            CipherKind::Aes256Ctr => Keystream::Aes256Ctr(Box::new(
                Aes256Ctr::new_from_slices(key.as_bytes(), iv)
                    .map_err(|e| Error::Encryption(e.to_string()))?,
            )),
            CipherKind::ChaCha20 => Keystream::ChaCha20(Box::new(
                ChaCha20::new_from_slices(key.as_bytes(), iv)
                    .map_err(|e| Error::Encryption(e.to_string()))?,
            )),
        };
        Ok(Some(stream))
    }

    /// XOR the next `buf.len()` keystream bytes into `buf`.
    pub fn apply(&mut self, buf: &mut [u8]) {
        match self {
            Keystream::Aes256Ctr(c) => c.apply_keystream(buf),
            Keystream::ChaCha20(c) => c.apply_keystream(buf),
        }
    }
}

mod hex_opt {
    use super::*;

    pub fn serialize<S: Serializer>(value: &Option<Vec<u8>>, s: S) -> std::result::Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => s.serialize_some(&hex::encode(bytes)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Option<Vec<u8>>, D::Error> {
        let value: Option<String> = Option::deserialize(d)?;
        value
            .map(|h| hex::decode(h).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> MasterKey {
        MasterKey::from_bytes([0x42; 32])
    }

    #[test]
    fn test_generate_fresh_iv() {
        let a = FileCrypto::generate(CipherKind::Aes256Ctr);
        let b = FileCrypto::generate(CipherKind::Aes256Ctr);
        assert_eq!(a.encryption_data.as_ref().unwrap().len(), 16);
        assert_ne!(a.encryption_data, b.encryption_data);

        let c = FileCrypto::generate(CipherKind::ChaCha20);
        assert_eq!(c.encryption_data.as_ref().unwrap().len(), 12);

        assert!(FileCrypto::generate(CipherKind::None).encryption_data.is_none());
    }

    #[test]
    fn test_keystream_is_incremental() {
        for kind in [CipherKind::Aes256Ctr, CipherKind::ChaCha20] {
            let crypto = FileCrypto::generate(kind);
            let data: Vec<u8> = (0..1000).map(|i| (i % 251) as u8).collect();

            let mut whole = data.clone();
            Keystream::new(&crypto, &key()).unwrap().unwrap().apply(&mut whole);

            let mut pieces = data.clone();
            let mut ks = Keystream::new(&crypto, &key()).unwrap().unwrap();
            for chunk in pieces.chunks_mut(37) {
                ks.apply(chunk);
            }

            assert_eq!(whole, pieces);
            assert_ne!(whole, data);

            Keystream::new(&crypto, &key()).unwrap().unwrap().apply(&mut whole);
            assert_eq!(whole, data);
        }
    }

    #[test]
    fn test_none_has_no_keystream() {
        assert!(Keystream::new(&FileCrypto::empty(), &key()).unwrap().is_none());
    }

    #[test]
    fn test_missing_iv_rejected() {
        let crypto = FileCrypto {
            cipher: CipherKind::Aes256Ctr,
            encryption_data: None,
            digest: None,
        };
        assert!(matches!(Keystream::new(&crypto, &key()), Err(Error::Decryption)));
    }

    #[test]
    fn test_json_uses_hex() {
        let crypto = FileCrypto {
            cipher: CipherKind::ChaCha20,
            encryption_data: Some(vec![0xab; 12]),
            digest: None,
        };
        let json = serde_json::to_string(&crypto).unwrap();
        assert!(json.contains("\"chacha20\""));
        assert!(json.contains(&"ab".repeat(12)));

        let back: FileCrypto = serde_json::from_str(&json).unwrap();
        assert_eq!(back, crypto);
    }

    #[test]
    fn test_cipher_from_str() {
        assert_eq!("aes-256-ctr".parse::<CipherKind>().unwrap(), CipherKind::Aes256Ctr);
        assert_eq!("none".parse::<CipherKind>().unwrap(), CipherKind::None);
        assert!("rot13".parse::<CipherKind>().is_err());
    }
}
