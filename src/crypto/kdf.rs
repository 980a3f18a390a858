//! Password-based key derivation descriptors.
//!
//! A [`KdfDescriptor`] is stored in cleartext next to the archive header. It
//! names the algorithm and its public parameters (salt, cost factors) so the
//! master key can be re-derived from the password on every open. Neither the
//! password nor the derived key is ever stored.

use crate::config::kdf_params;
use crate::error::{Error, Result};
use argon2::{Algorithm, Argon2, Params, Version};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fmt;
use zeroize::Zeroize;

/// Salt shared by the password-based variants.
pub type Salt = [u8; kdf_params::SALT_LENGTH];

/// The archive's 256-bit master key.
///
/// Zeroized on drop.
#[derive(Clone)]
pub struct MasterKey {
    bytes: [u8; kdf_params::KEY_LENGTH],
}

impl MasterKey {
    pub fn from_bytes(bytes: [u8; kdf_params::KEY_LENGTH]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; kdf_params::KEY_LENGTH] {
        &self.bytes
    }
}

impl Drop for MasterKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl PartialEq for MasterKey {
    fn eq(&self, other: &Self) -> bool {
        // Not constant time; only used by tests and password checks on
        // already-derived keys.
        self.bytes == other.bytes
    }
}

impl Eq for MasterKey {}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MasterKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// How the archive's master key is obtained from a password.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KdfDescriptor {
    /// No password; metadata and content are stored unencrypted.
    Plaintext,
    /// PBKDF2-HMAC-SHA256.
    Pbkdf2 { iterations: u32, salt: Salt },
    /// scrypt with N = 2^log_n.
    Scrypt { log_n: u8, r: u32, p: u32, salt: Salt },
    /// Argon2id.
    Argon2id {
        memory_kib: u32,
        iterations: u32,
        parallelism: u32,
        salt: Salt,
    },
}

fn fresh_salt() -> Salt {
    let mut salt = [0u8; kdf_params::SALT_LENGTH];
    rand::thread_rng().fill_bytes(&mut salt);
    salt
}

impl KdfDescriptor {
    /// Descriptor for an archive without a password.
    pub fn plaintext() -> Self {
        Self::Plaintext
    }

    /// PBKDF2 with the default iteration count and a fresh salt.
    pub fn pbkdf2() -> Self {
        Self::pbkdf2_with(kdf_params::PBKDF2_ITERATIONS)
    }

    /// PBKDF2 with an explicit iteration count and a fresh salt.
    pub fn pbkdf2_with(iterations: u32) -> Self {
        Self::Pbkdf2 {
            iterations,
            salt: fresh_salt(),
        }
    }

    /// scrypt with the default cost parameters and a fresh salt.
    pub fn scrypt() -> Self {
        Self::scrypt_with(
            kdf_params::SCRYPT_LOG_N,
            kdf_params::SCRYPT_R,
            kdf_params::SCRYPT_P,
        )
    }

    /// scrypt with explicit cost parameters and a fresh salt.
    pub fn scrypt_with(log_n: u8, r: u32, p: u32) -> Self {
        Self::Scrypt {
            log_n,
            r,
            p,
            salt: fresh_salt(),
        }
    }

    /// Argon2id with the default cost parameters and a fresh salt.
    pub fn argon2id() -> Self {
        Self::argon2id_with(
            kdf_params::ARGON2_MEMORY_COST,
            kdf_params::ARGON2_TIME_COST,
            kdf_params::ARGON2_PARALLELISM,
        )
    }

    /// Argon2id with explicit cost parameters and a fresh salt.
    pub fn argon2id_with(memory_kib: u32, iterations: u32, parallelism: u32) -> Self {
        Self::Argon2id {
            memory_kib,
            iterations,
            parallelism,
            salt: fresh_salt(),
        }
    }

    /// Same algorithm and cost parameters with a fresh salt.
    pub fn reseeded(&self) -> Self {
        match *self {
            Self::Plaintext => Self::Plaintext,
            Self::Pbkdf2 { iterations, .. } => Self::pbkdf2_with(iterations),
            Self::Scrypt { log_n, r, p, .. } => Self::scrypt_with(log_n, r, p),
            Self::Argon2id {
                memory_kib,
                iterations,
                parallelism,
                ..
            } => Self::argon2id_with(memory_kib, iterations, parallelism),
        }
    }

    /// Whether this descriptor protects anything.
    pub fn is_plaintext(&self) -> bool {
        matches!(self, Self::Plaintext)
    }

    /// Short algorithm name for display.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Plaintext => "plaintext",
            Self::Pbkdf2 { .. } => "pbkdf2-sha256",
            Self::Scrypt { .. } => "scrypt",
            Self::Argon2id { .. } => "argon2id",
        }
    }

    /// The stored salt, if the variant has one.
    pub fn salt(&self) -> Option<&Salt> {
        match self {
            Self::Plaintext => None,
            Self::Pbkdf2 { salt, .. } | Self::Scrypt { salt, .. } | Self::Argon2id { salt, .. } => {
                Some(salt)
            }
        }
    }

    /// Derive the master key from a password.
    ///
    /// Deterministic for a given descriptor. A wrong password is not detected
    /// here; it yields a key that fails to open the metadata section. The
    /// plaintext variant ignores the password and yields an all-zero key
    /// that is never used to seal anything.
    pub fn derive_key(&self, password: &[u8]) -> Result<MasterKey> {
        let mut key = [0u8; kdf_params::KEY_LENGTH];

        if self.is_plaintext() {
            return Ok(MasterKey::from_bytes(key));
        }
        if password.len() < kdf_params::MIN_PASSWORD_LENGTH {
            return Err(Error::PasswordTooShort {
                min: kdf_params::MIN_PASSWORD_LENGTH,
            });
        }

        match self {
            Self::Plaintext => {}
            Self::Pbkdf2 { iterations, salt } => {
                pbkdf2::pbkdf2_hmac::<Sha256>(password, salt, *iterations, &mut key);
            }
            Self::Scrypt { log_n, r, p, salt } => {
                let params = scrypt::Params::new(*log_n, *r, *p, kdf_params::KEY_LENGTH)
                    .map_err(|e| Error::KeyDerivation(e.to_string()))?;
                scrypt::scrypt(password, salt, &params, &mut key)
                    .map_err(|e| Error::KeyDerivation(e.to_string()))?;
            }
            Self::Argon2id {
                memory_kib,
                iterations,
                parallelism,
                salt,
            } => {
                let params = Params::new(
                    *memory_kib,
                    *iterations,
                    *parallelism,
                    Some(kdf_params::KEY_LENGTH),
                )
                .map_err(|e| Error::KeyDerivation(e.to_string()))?;

                let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
                argon2
                    .hash_password_into(password, salt, &mut key)
                    .map_err(|e| Error::KeyDerivation(e.to_string()))?;
            }
        }

        let master = MasterKey::from_bytes(key);
        key.zeroize();
        Ok(master)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cheap_descriptors() -> Vec<KdfDescriptor> {
        vec![
            KdfDescriptor::pbkdf2_with(1000),
            KdfDescriptor::scrypt_with(10, 8, 1),
            KdfDescriptor::argon2id_with(1024, 1, 1),
        ]
    }

    #[test]
    fn test_key_derivation_deterministic() {
        for kdf in cheap_descriptors() {
            let key1 = kdf.derive_key(b"password123").unwrap();
            let key2 = kdf.derive_key(b"password123").unwrap();
            assert_eq!(key1, key2, "{} must be deterministic", kdf.name());
        }
    }

    #[test]
    fn test_different_passwords_different_keys() {
        for kdf in cheap_descriptors() {
            let key1 = kdf.derive_key(b"password1").unwrap();
            let key2 = kdf.derive_key(b"password2").unwrap();
            assert_ne!(key1, key2, "{} ignored the password", kdf.name());
        }
    }

    #[test]
    fn test_different_salts_different_keys() {
        let kdf1 = KdfDescriptor::Pbkdf2 {
            iterations: 1000,
            salt: [1u8; 32],
        };
        let kdf2 = KdfDescriptor::Pbkdf2 {
            iterations: 1000,
            salt: [2u8; 32],
        };

        let key1 = kdf1.derive_key(b"password").unwrap();
        let key2 = kdf2.derive_key(b"password").unwrap();

        assert_ne!(key1, key2);
    }

    #[test]
    fn test_algorithms_disagree() {
        let salt = [9u8; 32];
        let pbkdf2 = KdfDescriptor::Pbkdf2 {
            iterations: 1000,
            salt,
        };
        let scrypt = KdfDescriptor::Scrypt {
            log_n: 10,
            r: 8,
            p: 1,
            salt,
        };
        assert_ne!(
            pbkdf2.derive_key(b"password").unwrap(),
            scrypt.derive_key(b"password").unwrap()
        );
    }

    #[test]
    fn test_new_generates_random_salt() {
        let kdf1 = KdfDescriptor::pbkdf2();
        let kdf2 = KdfDescriptor::pbkdf2();

        assert_ne!(kdf1.salt(), kdf2.salt());
        assert!(KdfDescriptor::plaintext().salt().is_none());
    }

    #[test]
    fn test_reseeded_keeps_costs() {
        let kdf = KdfDescriptor::scrypt_with(4, 8, 1);
        let fresh = kdf.reseeded();

        assert_ne!(kdf.salt(), fresh.salt());
        assert!(matches!(fresh, KdfDescriptor::Scrypt { log_n: 4, r: 8, p: 1, .. }));
        assert_eq!(KdfDescriptor::plaintext().reseeded(), KdfDescriptor::Plaintext);
    }

    #[test]
    fn test_short_password_rejected() {
        let kdf = KdfDescriptor::pbkdf2_with(1000);
        assert!(matches!(
            kdf.derive_key(b""),
            Err(Error::PasswordTooShort { .. })
        ));
        assert!(matches!(
            kdf.derive_key(b"abc"),
            Err(Error::PasswordTooShort { .. })
        ));
    }

    #[test]
    fn test_plaintext_accepts_empty_password() {
        let key = KdfDescriptor::plaintext().derive_key(b"").unwrap();
        assert_eq!(key.as_bytes(), &[0u8; 32]);
    }

    #[test]
    fn test_invalid_scrypt_params() {
        let kdf = KdfDescriptor::Scrypt {
            log_n: 0,
            r: 0,
            p: 0,
            salt: [0u8; 32],
        };
        assert!(matches!(
            kdf.derive_key(b"password"),
            Err(Error::KeyDerivation(_))
        ));
    }

    #[test]
    fn test_debug_redacts_key() {
        let key = MasterKey::from_bytes([7u8; 32]);
        let shown = format!("{:?}", key);
        assert!(shown.contains("REDACTED"));
        assert!(!shown.contains('7'));
    }

    #[test]
    fn test_descriptor_bincode_roundtrip() {
        let kdf = KdfDescriptor::scrypt_with(10, 8, 1);
        let bytes = bincode::serialize(&kdf).unwrap();
        let back: KdfDescriptor = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, kdf);
    }
}
