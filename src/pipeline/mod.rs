//! Content pipeline between a file's plaintext and its blocks.
//!
//! ```text
//! write: plaintext → SHA-256 → zlib → stream cipher → fixed-size blocks
//! read:  blocks → stream cipher → zlib → plaintext (→ SHA-256 check)
//! ```
//!
//! Both directions are ordinary `std::io::Write`/`Read` stages, so callers
//! can stream arbitrarily large files without holding them in memory.

mod reader;
mod writer;

pub use reader::ContentReader;
pub use writer::ContentWriter;

use crate::crypto::FileCrypto;
use crate::rangeset::RangeSet;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Buffer size used when copying between a caller's stream and the pipeline.
pub const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Everything the block region holds for one version of a file's content.
///
/// Produced as a whole by [`ContentWriter::finish`] and swapped into the
/// file entry in one assignment, so readers never see a mix of old and new
/// fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileContent {
    /// Blocks holding the transformed bytes, in write order.
    pub blocks: RangeSet,
    /// Plaintext length.
    pub size: u64,
    /// Length of the compressed, encrypted stream.
    pub disk_size: u64,
    /// When this content was written (Unix epoch seconds).
    pub modified: u64,
    pub crypto: FileCrypto,
}

impl FileContent {
    /// Content of a file that has never been written.
    pub fn empty() -> Self {
        Self {
            blocks: RangeSet::new(),
            size: 0,
            disk_size: 0,
            modified: current_timestamp(),
            crypto: FileCrypto::empty(),
        }
    }
}

/// Receives byte-count updates from long reads and writes.
pub trait ProgressSink {
    fn advance(&mut self, bytes: u64);
}

impl<F: FnMut(u64)> ProgressSink for F {
    fn advance(&mut self, bytes: u64) {
        self(bytes)
    }
}

/// Get current Unix timestamp.
pub(crate) fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{CipherKind, MasterKey};
    use crate::error::Error;
    use crate::storage::BlockStore;
    use std::io::{Read, Write};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use tempfile::tempfile;

    const BS: u32 = 512;

    fn store() -> BlockStore {
        BlockStore::new(tempfile().unwrap(), BS, 0, 0)
    }

    fn key() -> MasterKey {
        MasterKey::from_bytes([0x5a; 32])
    }

    fn write(store: &mut BlockStore, data: &[u8], cipher: CipherKind, compression: Option<u32>) -> FileContent {
        let mut writer = ContentWriter::new(store, &key(), cipher, compression).unwrap();
        writer.write_all(data).unwrap();
        writer.finish().unwrap()
    }

    fn read(store: &BlockStore, content: &FileContent, compressed: bool) -> crate::Result<Vec<u8>> {
        ContentReader::new(store.reader().unwrap(), content, &key(), compressed, true)?.read_all()
    }

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    #[test]
    fn test_hello_world_roundtrip() {
        let mut s = store();
        let content = write(&mut s, b"hello world", CipherKind::Aes256Ctr, Some(6));

        assert_eq!(content.size, 11);
        assert_eq!(content.blocks.size(), 1);
        assert!(content.crypto.digest.is_some());
        assert_eq!(read(&s, &content, true).unwrap(), b"hello world");
    }

    #[test]
    fn test_every_cipher_and_compression_mode() {
        let data = sample(3 * BS as usize + 17);
        for cipher in [CipherKind::None, CipherKind::Aes256Ctr, CipherKind::ChaCha20] {
            for compression in [None, Some(1), Some(9)] {
                let mut s = store();
                let content = write(&mut s, &data, cipher, compression);
                let back = read(&s, &content, compression.is_some()).unwrap();
                assert_eq!(back, data, "{} / {:?}", cipher, compression);
            }
        }
    }

    #[test]
    fn test_uncompressed_block_accounting() {
        let mut s = store();
        let data = sample(2 * BS as usize + 1);
        let content = write(&mut s, &data, CipherKind::ChaCha20, None);

        assert_eq!(content.disk_size, data.len() as u64);
        assert_eq!(content.blocks.pairs().collect::<Vec<_>>(), vec![(0, 3)]);
        assert_eq!(s.frontier(), 3);
    }

    #[test]
    fn test_ciphertext_differs_from_plaintext() {
        let mut s = store();
        let data = vec![0u8; BS as usize];
        let content = write(&mut s, &data, CipherKind::Aes256Ctr, None);
        assert_ne!(s.read_block(content.blocks.first().unwrap()).unwrap(), data);
    }

    #[test]
    fn test_empty_content() {
        let mut s = store();
        let raw = write(&mut s, b"", CipherKind::Aes256Ctr, None);
        assert!(raw.blocks.is_empty());
        assert_eq!(read(&s, &raw, false).unwrap(), Vec::<u8>::new());

        let zipped = write(&mut s, b"", CipherKind::Aes256Ctr, Some(6));
        assert_eq!(zipped.size, 0);
        assert_eq!(read(&s, &zipped, true).unwrap(), Vec::<u8>::new());

        assert!(read(&s, &FileContent::empty(), true).unwrap().is_empty());
    }

    #[test]
    fn test_rewrite_uses_disjoint_blocks() {
        let mut s = store();
        let first = write(&mut s, &sample(1500), CipherKind::Aes256Ctr, None);
        let second = write(&mut s, &sample(1500), CipherKind::Aes256Ctr, None);
        assert!(first.blocks.is_disjoint(&second.blocks));
        assert_ne!(first.crypto.encryption_data, second.crypto.encryption_data);
    }

    #[test]
    fn test_flipped_byte_fails_integrity() {
        for compression in [None, Some(6)] {
            let mut s = store();
            let content = write(&mut s, b"hello world", CipherKind::Aes256Ctr, compression);
            let idx = content.blocks.first().unwrap();

            let mut block = s.read_block(idx).unwrap();
            block[3] ^= 0x01;
            s.write_block(idx, &block).unwrap();

            let result = read(&s, &content, compression.is_some());
            assert!(
                matches!(result, Err(Error::Integrity(_))),
                "{:?}: {:?}",
                compression,
                result
            );
        }
    }

    #[test]
    fn test_unchecked_read_ignores_digest() {
        let mut s = store();
        let content = write(&mut s, b"hello world", CipherKind::ChaCha20, None);
        let idx = content.blocks.first().unwrap();
        let mut block = s.read_block(idx).unwrap();
        block[0] ^= 0xff;
        s.write_block(idx, &block).unwrap();

        let reader = ContentReader::new(s.reader().unwrap(), &content, &key(), false, false).unwrap();
        let data = reader.read_all().unwrap();
        assert_eq!(data.len(), 11);
        assert_eq!(&data[1..], b"ello world");
    }

    /// Bytes that zlib cannot shrink, so compressed offsets track plaintext ones.
    fn noise(len: usize) -> Vec<u8> {
        let mut state = 0x9e37_79b9_7f4a_7c15u64;
        (0..len)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                (state >> 24) as u8
            })
            .collect()
    }

    #[test]
    fn test_unchecked_compressed_read_keeps_prefix() {
        let mut s = store();
        let data = noise(4 * BS as usize);
        let content = write(&mut s, &data, CipherKind::Aes256Ctr, Some(6));
        let idx = content.blocks.values().nth(2).unwrap();

        let mut block = s.read_block(idx).unwrap();
        block[100] ^= 0x40;
        s.write_block(idx, &block).unwrap();

        assert!(matches!(read(&s, &content, true), Err(Error::Integrity(_))));

        let reader = ContentReader::new(s.reader().unwrap(), &content, &key(), true, false).unwrap();
        let recovered = reader.read_all().unwrap();
        let prefix = BS as usize;
        assert!(recovered.len() >= prefix && recovered.len() <= data.len());
        assert_eq!(&recovered[..prefix], &data[..prefix]);
    }

    #[test]
    fn test_reader_stops_at_logical_size() {
        let mut s = store();
        let content = write(&mut s, &sample(700), CipherKind::None, None);

        let mut reader = ContentReader::new(s.reader().unwrap(), &content, &key(), false, true).unwrap();
        let mut buf = vec![0u8; 4096];
        let mut total = 0;
        loop {
            let n = reader.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            total += n;
        }
        assert_eq!(total, 700);
        assert_eq!(reader.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_missing_block_is_inconsistency() {
        let mut s = store();
        let mut content = write(&mut s, &sample(1200), CipherKind::None, None);
        content.blocks = RangeSet::from_pair(0, 1);

        let result = read(&s, &content, false);
        assert!(matches!(result, Err(Error::AllocationInconsistency(_))));
    }

    #[test]
    fn test_cancel_abandons_blocks() {
        let mut s = store();
        let flag = Arc::new(AtomicBool::new(false));
        let mut writer = ContentWriter::new(&mut s, &key(), CipherKind::Aes256Ctr, None)
            .unwrap()
            .with_cancel(flag.clone());

        writer.write_all(&sample(2 * BS as usize)).unwrap();
        flag.store(true, Ordering::SeqCst);
        let err = writer.write_all(b"more").unwrap_err();
        assert!(matches!(Error::from(err), Error::Cancelled));
        drop(writer);

        assert_eq!(s.frontier(), 2);
    }

    #[test]
    fn test_copy_reports_progress() {
        let mut s = store();
        let data = sample(3 * COPY_BUFFER_SIZE / 2);
        let mut seen = 0u64;

        let mut writer = ContentWriter::new(&mut s, &key(), CipherKind::Aes256Ctr, Some(6)).unwrap();
        let copied = writer
            .copy_from(&mut data.as_slice(), &mut |n: u64| seen += n)
            .unwrap();
        let content = writer.finish().unwrap();

        assert_eq!(copied, data.len() as u64);
        assert_eq!(seen, data.len() as u64);

        let mut out = Vec::new();
        let mut read_seen = 0u64;
        ContentReader::new(s.reader().unwrap(), &content, &key(), true, true)
            .unwrap()
            .copy_to(&mut out, &mut |n: u64| read_seen += n)
            .unwrap();
        assert_eq!(out, data);
        assert_eq!(read_seen, data.len() as u64);
    }
}
