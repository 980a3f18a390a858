//! Cryptographic operations for blockvault.
//!
//! This module provides:
//! - Key derivation descriptors (PBKDF2, scrypt, Argon2id, or none)
//! - AES-256-GCM sealing of the metadata section
//! - Counter-mode stream ciphers for file content

mod cipher;
mod kdf;
mod stream;

pub use cipher::{open_metadata, seal_metadata, Cipher};
pub use kdf::{KdfDescriptor, MasterKey, Salt};
pub use stream::{CipherKind, FileCrypto, Keystream, DIGEST_SIZE};
