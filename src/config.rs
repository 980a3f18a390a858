//! Configuration constants and types for blockvault archives.

use crate::crypto::CipherKind;
use serde::{Deserialize, Serialize};

/// Default block size (64 KiB).
pub const DEFAULT_BLOCK_SIZE: u32 = 64 * 1024;

/// Smallest accepted block size.
pub const MIN_BLOCK_SIZE: u32 = 512;

/// Largest accepted block size (16 MiB).
pub const MAX_BLOCK_SIZE: u32 = 16 * 1024 * 1024;

/// Default zlib level for content compression.
pub const DEFAULT_COMPRESSION_LEVEL: u32 = 6;

/// Archive magic number: "BVLT" in bytes.
pub const ARCHIVE_MAGIC: [u8; 4] = [0x42, 0x56, 0x4c, 0x54];

/// Current archive format version.
pub const ARCHIVE_VERSION: u32 = 1;

/// Reserved space for the cleartext key-derivation descriptor.
pub const DESCRIPTOR_CAPACITY: u32 = 256;

/// Default reserved space for the sealed metadata tree (1 MiB).
pub const DEFAULT_METADATA_CAPACITY: u64 = 1024 * 1024;

/// Key derivation parameters.
pub mod kdf_params {
    /// Salt length in bytes.
    pub const SALT_LENGTH: usize = 32;

    /// Derived key length in bytes (256 bits).
    pub const KEY_LENGTH: usize = 32;

    /// Shortest password accepted by the password-based variants.
    pub const MIN_PASSWORD_LENGTH: usize = 4;

    /// PBKDF2-HMAC-SHA256 iteration count for new archives.
    pub const PBKDF2_ITERATIONS: u32 = 600_000;

    /// Scrypt cost exponent (N = 2^15).
    pub const SCRYPT_LOG_N: u8 = 15;

    /// Scrypt block size parameter.
    pub const SCRYPT_R: u32 = 8;

    /// Scrypt parallelism parameter.
    pub const SCRYPT_P: u32 = 1;

    /// Argon2id memory cost in KiB (64 MB).
    pub const ARGON2_MEMORY_COST: u32 = 65536;

    /// Argon2id time cost (iterations).
    pub const ARGON2_TIME_COST: u32 = 3;

    /// Argon2id parallelism factor.
    pub const ARGON2_PARALLELISM: u32 = 4;
}

/// Secure wipe parameters.
pub mod wipe_params {
    /// Number of random overwrite passes.
    pub const RANDOM_PASSES: u8 = 3;

    /// Number of zero overwrite passes.
    pub const ZERO_PASSES: u8 = 1;
}

/// Configuration for archive creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveConfig {
    /// Size of every block in the data region.
    pub block_size: u32,

    /// Whether file content is zlib-compressed before encryption.
    pub compression: bool,

    /// zlib level (0-9) when compression is enabled.
    pub compression_level: u32,

    /// Bytes reserved for the sealed metadata tree.
    pub metadata_capacity: u64,

    /// Cipher used for new file content unless overridden per write.
    pub cipher: CipherKind,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            compression: true,
            compression_level: DEFAULT_COMPRESSION_LEVEL,
            metadata_capacity: DEFAULT_METADATA_CAPACITY,
            cipher: CipherKind::Aes256Ctr,
        }
    }
}

impl ArchiveConfig {
    /// Create a configuration with a custom block size and compression switch.
    pub fn new(block_size: u32, compression: bool) -> Self {
        Self {
            block_size,
            compression,
            ..Self::default()
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if !self.block_size.is_power_of_two()
            || !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&self.block_size)
        {
            return Err(format!(
                "Block size must be a power of 2 between {} and {}",
                MIN_BLOCK_SIZE, MAX_BLOCK_SIZE
            ));
        }
        if self.compression_level > 9 {
            return Err("Compression level must be between 0 and 9".to_string());
        }
        if self.metadata_capacity < 4096 {
            return Err("Metadata capacity must be at least 4096 bytes".to_string());
        }
        Ok(())
    }
}
