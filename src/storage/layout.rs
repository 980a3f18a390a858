//! On-disk archive layout.
//!
//! ```text
//! +-----------------------+  0
//! | header (32 bytes)     |
//! +-----------------------+  32
//! | kdf descriptor        |  u32 length + bincode, zero padded
//! +-----------------------+  32 + descriptor_capacity
//! | sealed metadata tree  |  u64 length + sealed bytes, zero padded
//! +-----------------------+  block_region_offset
//! | block 0 | block 1 |...|
//! ```
//!
//! All integers are little-endian. The header and descriptor are cleartext;
//! everything needed to decrypt the rest is in them.

use crate::config::{ArchiveConfig, ARCHIVE_MAGIC, ARCHIVE_VERSION, DESCRIPTOR_CAPACITY};
use crate::crypto::KdfDescriptor;
use crate::error::{Error, Result};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};

/// Fixed header size.
pub const HEADER_SIZE: u64 = 32;

const FLAG_COMPRESSION: u32 = 1;

/// Fixed-size archive header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveHeader {
    pub version: u32,
    pub block_size: u32,
    pub compression: bool,
    pub compression_level: u32,
    pub descriptor_capacity: u32,
    pub metadata_capacity: u64,
}

impl ArchiveHeader {
    /// Header for a new archive.
    pub fn new(config: &ArchiveConfig) -> Self {
        Self {
            version: ARCHIVE_VERSION,
            block_size: config.block_size,
            compression: config.compression,
            compression_level: config.compression_level,
            descriptor_capacity: DESCRIPTOR_CAPACITY,
            metadata_capacity: config.metadata_capacity,
        }
    }

    /// Serialize to the fixed 32-byte form.
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE as usize] {
        let mut flags = (self.compression_level & 0xff) << 8;
        if self.compression {
            flags |= FLAG_COMPRESSION;
        }

        let mut out = [0u8; HEADER_SIZE as usize];
        out[0..4].copy_from_slice(&ARCHIVE_MAGIC);
        out[4..8].copy_from_slice(&self.version.to_le_bytes());
        out[8..12].copy_from_slice(&self.block_size.to_le_bytes());
        out[12..16].copy_from_slice(&flags.to_le_bytes());
        out[16..20].copy_from_slice(&self.descriptor_capacity.to_le_bytes());
        out[20..28].copy_from_slice(&self.metadata_capacity.to_le_bytes());
        out
    }

    /// Parse and validate a header.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE as usize || bytes[0..4] != ARCHIVE_MAGIC {
            return Err(Error::InvalidMagic);
        }

        let u32_at = |at: usize| u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);
        let mut u64_bytes = [0u8; 8];
        u64_bytes.copy_from_slice(&bytes[20..28]);

        let version = u32_at(4);
        if version != ARCHIVE_VERSION {
            return Err(Error::VersionMismatch {
                expected: ARCHIVE_VERSION,
                found: version,
            });
        }

        let flags = u32_at(12);
        let header = Self {
            version,
            block_size: u32_at(8),
            compression: flags & FLAG_COMPRESSION != 0,
            compression_level: (flags >> 8) & 0xff,
            descriptor_capacity: u32_at(16),
            metadata_capacity: u64::from_le_bytes(u64_bytes),
        };

        if header.block_size == 0 || header.descriptor_capacity < 4 || header.metadata_capacity < 8 {
            return Err(Error::Serialization("archive header has zero-sized sections".to_string()));
        }
        Ok(header)
    }

    /// Offset of the descriptor section.
    pub fn descriptor_offset(&self) -> u64 {
        HEADER_SIZE
    }

    /// Offset of the metadata section.
    pub fn metadata_offset(&self) -> u64 {
        HEADER_SIZE + self.descriptor_capacity as u64
    }

    /// Offset of block 0.
    pub fn block_region_offset(&self) -> u64 {
        self.metadata_offset() + self.metadata_capacity
    }

    /// Read the header from the start of `file`.
    pub fn read(file: &File) -> Result<Self> {
        let mut bytes = [0u8; HEADER_SIZE as usize];
        let mut f = file;
        f.seek(SeekFrom::Start(0))?;
        f.read_exact(&mut bytes).map_err(|e| match e.kind() {
            std::io::ErrorKind::UnexpectedEof => Error::InvalidMagic,
            _ => Error::Io(e),
        })?;
        Self::from_bytes(&bytes)
    }

    /// Write the header to the start of `file`.
    pub fn write(&self, file: &File) -> Result<()> {
        write_at(file, 0, &self.to_bytes())
    }
}

fn write_at(file: &File, offset: u64, data: &[u8]) -> Result<()> {
    let mut f = file;
    f.seek(SeekFrom::Start(offset))?;
    f.write_all(data)?;
    Ok(())
}

fn read_at(file: &File, offset: u64, len: usize) -> Result<Vec<u8>> {
    let mut f = file;
    f.seek(SeekFrom::Start(offset))?;
    let mut buf = vec![0u8; len];
    f.read_exact(&mut buf)?;
    Ok(buf)
}

/// Write the cleartext key-derivation descriptor.
pub fn write_descriptor(file: &File, header: &ArchiveHeader, descriptor: &KdfDescriptor) -> Result<()> {
    let encoded = bincode::serialize(descriptor)?;
    let capacity = header.descriptor_capacity as usize;
    if encoded.len() + 4 > capacity {
        return Err(Error::Serialization(format!(
            "descriptor needs {} bytes, section holds {}",
            encoded.len() + 4,
            capacity
        )));
    }

    let mut section = vec![0u8; capacity];
    section[0..4].copy_from_slice(&(encoded.len() as u32).to_le_bytes());
    section[4..4 + encoded.len()].copy_from_slice(&encoded);
    write_at(file, header.descriptor_offset(), &section)
}

/// Read the cleartext key-derivation descriptor.
pub fn read_descriptor(file: &File, header: &ArchiveHeader) -> Result<KdfDescriptor> {
    let section = read_at(file, header.descriptor_offset(), header.descriptor_capacity as usize)?;
    let len = u32::from_le_bytes([section[0], section[1], section[2], section[3]]) as usize;
    if len + 4 > section.len() {
        return Err(Error::Serialization("descriptor length exceeds its section".to_string()));
    }
    Ok(bincode::deserialize(&section[4..4 + len])?)
}

/// Fail with [`Error::MetadataOverflow`] if `sealed_len` bytes of sealed tree
/// would not fit the metadata section.
pub fn check_metadata_fits(header: &ArchiveHeader, sealed_len: usize) -> Result<()> {
    let needed = sealed_len as u64 + 8;
    if needed > header.metadata_capacity {
        return Err(Error::MetadataOverflow {
            needed,
            capacity: header.metadata_capacity,
        });
    }
    Ok(())
}

/// Write the sealed metadata tree, clearing any longer previous contents.
pub fn write_metadata(file: &File, header: &ArchiveHeader, sealed: &[u8]) -> Result<()> {
    check_metadata_fits(header, sealed.len())?;
    let needed = sealed.len() as u64 + 8;

    let previous = read_metadata_len(file, header).unwrap_or(0).min(header.metadata_capacity - 8);

    let mut section = Vec::with_capacity(needed.max(previous + 8) as usize);
    section.extend_from_slice(&(sealed.len() as u64).to_le_bytes());
    section.extend_from_slice(sealed);
    if previous > sealed.len() as u64 {
        section.resize((previous + 8) as usize, 0);
    }
    write_at(file, header.metadata_offset(), &section)
}

fn read_metadata_len(file: &File, header: &ArchiveHeader) -> Result<u64> {
    let bytes = read_at(file, header.metadata_offset(), 8)?;
    let mut len = [0u8; 8];
    len.copy_from_slice(&bytes);
    Ok(u64::from_le_bytes(len))
}

/// Read the sealed metadata tree.
pub fn read_metadata(file: &File, header: &ArchiveHeader) -> Result<Vec<u8>> {
    let len = read_metadata_len(file, header)?;
    if len.saturating_add(8) > header.metadata_capacity {
        return Err(Error::Serialization("metadata length exceeds its section".to_string()));
    }
    read_at(file, header.metadata_offset() + 8, len as usize)
}
