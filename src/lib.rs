//! Blockvault
//!
//! An encrypted, optionally compressed virtual file system kept in a single
//! archive file: a password-protected metadata tree of files, folders and
//! tags, plus a block-addressed data region holding file content.
//!
//! # Features
//!
//! - **Block store**: fixed-size blocks handed out by a monotonic allocator
//! - **Range sets**: compact, canonical `(start, length)` runs tracking which blocks belong to a file
//! - **Key derivation**: PBKDF2-HMAC-SHA256, scrypt or Argon2id, or an unprotected plaintext mode
//! - **Streaming content pipeline**: zlib compression, AES-256-CTR or ChaCha20, SHA-256 integrity digest
//! - **Secure erase**: deleted files' blocks are overwritten before the archive shrinks
//!
//! # Architecture
//!
//! ```text
//! Data → SHA-256 → Compress (zlib) → Encrypt (CTR) → Blocks (archive file)
//! Tree → JSON → Seal (AES-256-GCM) → Metadata section
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use blockvault::{Archive, ArchiveConfig, KdfDescriptor};
//! use std::path::Path;
//!
//! // Create a new archive
//! let mut archive = Archive::create(
//!     Path::new("./vault.bv"),
//!     ArchiveConfig::default(),
//!     KdfDescriptor::argon2id(),
//!     b"password",
//! ).unwrap();
//!
//! // Write a file
//! archive.write_file("/secret.txt", b"Hidden data").unwrap();
//!
//! // Read it back
//! let data = archive.read_file("/secret.txt").unwrap();
//! assert_eq!(data, b"Hidden data");
//! ```

pub mod config;
pub mod crypto;
pub mod error;
pub mod pipeline;
pub mod rangeset;
pub mod storage;
pub mod vfs;

pub use config::ArchiveConfig;
pub use crypto::{CipherKind, KdfDescriptor};
pub use error::{Error, Result};
pub use rangeset::RangeSet;
pub use vfs::Archive;
