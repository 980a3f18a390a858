//! Error types for blockvault.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for blockvault operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in archive operations.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error on the archive file.
    #[error("I/O error: {0}")]
    Io(#[source] std::io::Error),

    /// File not found in the archive.
    #[error("File not found: {0}")]
    FileNotFound(String),

    /// Path already exists.
    #[error("Path already exists: {0}")]
    PathExists(String),

    /// Not a directory.
    #[error("Not a directory: {0}")]
    NotADirectory(String),

    /// Not a file.
    #[error("Not a file: {0}")]
    NotAFile(String),

    /// Invalid path format.
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// Archive file already exists at the target location.
    #[error("Archive already exists: {0}")]
    AlreadyInitialized(PathBuf),

    /// Invalid archive configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Encryption error.
    #[error("Encryption error: {0}")]
    Encryption(String),

    /// Decryption error (wrong password or corrupted data).
    #[error("Decryption failed: wrong password or corrupted data")]
    Decryption,

    /// Key derivation error.
    #[error("Key derivation error: {0}")]
    KeyDerivation(String),

    /// Password rejected before derivation.
    #[error("Password too short: at least {min} bytes required")]
    PasswordTooShort { min: usize },

    /// Plaintext digest mismatch or undecodable file content.
    #[error("Integrity check failed: {0}")]
    Integrity(String),

    /// Metadata tree and block region disagree.
    #[error("Allocation inconsistency: {0}")]
    AllocationInconsistency(String),

    /// Range set is not in canonical form.
    #[error("Invalid range set: {0}")]
    InvalidRangeSet(String),

    /// Sealed metadata tree does not fit its section.
    #[error("Metadata section full: need {needed} bytes, capacity is {capacity} bytes")]
    MetadataOverflow { needed: u64, capacity: u64 },

    /// Write pipeline stopped on request.
    #[error("Operation cancelled")]
    Cancelled,

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid archive magic number.
    #[error("Invalid archive format: expected magic 'BVLT'")]
    InvalidMagic,

    /// Version mismatch.
    #[error("Archive version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },
}

impl Error {
    /// Wrap this error so it can travel through `std::io::Read`/`Write`
    /// pipeline stages and be recovered intact on the other side.
    pub(crate) fn into_io(self) -> std::io::Error {
        std::io::Error::other(self)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        if !e.get_ref().is_some_and(|inner| inner.is::<Error>()) {
            return Error::Io(e);
        }
        match e.into_inner().map(|inner| inner.downcast::<Error>()) {
            Some(Ok(inner)) => *inner,
            _ => Error::Io(std::io::Error::other("pipeline error lost in transit")),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
