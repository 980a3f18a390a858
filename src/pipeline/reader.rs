//! Read side of the content pipeline.

use super::{FileContent, ProgressSink, COPY_BUFFER_SIZE};
use crate::crypto::{Keystream, MasterKey};
use crate::error::{Error, Result};
use crate::rangeset::Values;
use crate::storage::BlockReader;
use flate2::read::ZlibDecoder;
use sha2::{Digest, Sha256};
use std::io::{self, Read, Write};

/// Streams a file's plaintext back out of its blocks.
///
/// Output ends exactly at the recorded logical size. When constructed with
/// `check_hash_on_finish`, the plaintext digest is compared once the stream
/// is exhausted, and any sign of damage (digest mismatch, undecodable
/// compressed data, a stream that ends early) is an [`Error::Integrity`].
/// Without the check the reader hands back whatever it can recover.
pub struct ContentReader<'a> {
    source: Source<'a>,
    content: &'a FileContent,
    remaining: u64,
    hasher: Sha256,
    check: bool,
    verified: bool,
}

impl<'a> ContentReader<'a> {
    pub fn new(
        reader: BlockReader,
        content: &'a FileContent,
        key: &MasterKey,
        compressed: bool,
        check_hash_on_finish: bool,
    ) -> Result<Self> {
        let blocks = BlockSource {
            reader,
            blocks: content.blocks.values(),
            remaining: content.disk_size,
            current: Vec::new(),
            pos: 0,
        };
        let cipher = CipherSource {
            inner: blocks,
            keystream: Keystream::new(&content.crypto, key)?,
        };
        let source = if compressed {
            Source::Zlib(Box::new(ZlibDecoder::new(cipher)))
        } else {
            Source::Raw(cipher)
        };

        Ok(Self {
            source,
            content,
            remaining: content.size,
            hasher: Sha256::new(),
            check: check_hash_on_finish,
            verified: false,
        })
    }

    /// Logical size of the content.
    pub fn size(&self) -> u64 {
        self.content.size
    }

    /// Read the whole content into memory.
    pub fn read_all(mut self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(usize::try_from(self.content.size).unwrap_or(0));
        self.read_to_end(&mut out)?;
        Ok(out)
    }

    /// Stream the content into `dst`, reporting bytes to `progress`.
    pub fn copy_to(mut self, dst: &mut dyn Write, progress: &mut dyn ProgressSink) -> Result<u64> {
        let mut buf = vec![0u8; COPY_BUFFER_SIZE];
        let mut total = 0u64;
        loop {
            let n = self.read(&mut buf)?;
            if n == 0 {
                break;
            }
            dst.write_all(&buf[..n])?;
            total += n as u64;
            progress.advance(n as u64);
        }
        Ok(total)
    }

    /// Drain whatever has not been read yet and run the integrity check.
    pub fn finish(mut self) -> Result<()> {
        io::copy(&mut self, &mut io::sink())?;
        self.verify()
    }

    fn verify(&mut self) -> Result<()> {
        if self.verified || !self.check {
            return Ok(());
        }
        let actual = std::mem::take(&mut self.hasher).finalize();

        match &self.content.crypto.digest {
            Some(expected) if expected.as_slice() == actual.as_slice() => {}
            Some(expected) => {
                return Err(Error::Integrity(format!(
                    "digest mismatch: expected {}, got {}",
                    hex::encode(expected),
                    hex::encode(actual)
                )))
            }
            None if self.content.size == 0 => {}
            None => return Err(Error::Integrity("no digest recorded for content".to_string())),
        }
        self.verified = true;
        Ok(())
    }

    /// An error raised by the decompressor itself rather than a stage below it.
    fn is_decode_failure(&self, e: &io::Error) -> bool {
        let from_pipeline = e.get_ref().is_some_and(|inner| inner.is::<Error>());
        matches!(self.source, Source::Zlib(_)) && !from_pipeline
    }

    fn classify(&self, e: io::Error) -> io::Error {
        if self.is_decode_failure(&e) {
            return Error::Integrity(format!("compressed stream is corrupt: {}", e)).into_io();
        }
        e
    }
}

impl Read for ContentReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 {
            self.verify().map_err(Error::into_io)?;
            return Ok(0);
        }
        if buf.is_empty() {
            return Ok(0);
        }

        let want = buf.len().min(usize::try_from(self.remaining).unwrap_or(usize::MAX));
        let n = match self.source.read(&mut buf[..want]) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Err(e),
            Err(e) if !self.check && self.is_decode_failure(&e) => {
                log::warn!(
                    "compressed stream is corrupt with {} bytes outstanding; keeping what was recovered: {}",
                    self.remaining,
                    e
                );
                self.remaining = 0;
                return Ok(0);
            }
            Err(e) => return Err(self.classify(e)),
        };

        if n == 0 {
            if self.check {
                return Err(Error::Integrity(format!(
                    "content ends {} bytes before its recorded size",
                    self.remaining
                ))
                .into_io());
            }
            log::warn!(
                "content ends {} bytes before its recorded size; returning what was recovered",
                self.remaining
            );
            self.remaining = 0;
            return Ok(0);
        }

        self.hasher.update(&buf[..n]);
        self.remaining -= n as u64;
        Ok(n)
    }
}

enum Source<'a> {
    Raw(CipherSource<'a>),
    Zlib(Box<ZlibDecoder<CipherSource<'a>>>),
}

impl Read for Source<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Source::Raw(src) => src.read(buf),
            Source::Zlib(src) => src.read(buf),
        }
    }
}

/// Decrypts in place on the way out of the block source.
struct CipherSource<'a> {
    inner: BlockSource<'a>,
    keystream: Option<Keystream>,
}

impl Read for CipherSource<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if let Some(keystream) = &mut self.keystream {
            keystream.apply(&mut buf[..n]);
        }
        Ok(n)
    }
}

/// Concatenation of a file's blocks, cut off at the stored size.
struct BlockSource<'a> {
    reader: BlockReader,
    blocks: Values<'a>,
    remaining: u64,
    current: Vec<u8>,
    pos: usize,
}

impl Read for BlockSource<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() || self.remaining == 0 {
            return Ok(0);
        }

        if self.pos == self.current.len() {
            let idx = self.blocks.next().ok_or_else(|| {
                Error::AllocationInconsistency(format!(
                    "block list ends {} bytes short of the stored size",
                    self.remaining
                ))
                .into_io()
            })?;
            self.current = self.reader.read_block(idx).map_err(Error::into_io)?;
            self.pos = 0;
        }

        let available = (self.current.len() - self.pos) as u64;
        let n = (buf.len() as u64).min(available).min(self.remaining) as usize;
        buf[..n].copy_from_slice(&self.current[self.pos..self.pos + n]);
        self.pos += n;
        self.remaining -= n as u64;
        Ok(n)
    }
}
