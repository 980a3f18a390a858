//! Write side of the content pipeline.

use super::{current_timestamp, FileContent, ProgressSink, COPY_BUFFER_SIZE};
use crate::crypto::{CipherKind, FileCrypto, Keystream, MasterKey};
use crate::error::{Error, Result};
use crate::rangeset::RangeSet;
use crate::storage::BlockStore;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Streams plaintext into freshly allocated blocks.
///
/// Bytes written are hashed, optionally zlib-compressed, encrypted under a
/// new IV, and cut into blocks that are allocated and written as they fill.
/// Call [`finish`](Self::finish) to flush the tail and obtain the
/// [`FileContent`] describing the result. A writer dropped without finishing
/// (after an error or cancellation) leaves its blocks behind as dead space.
pub struct ContentWriter<'a> {
    stage: Option<Stage<'a>>,
    crypto: FileCrypto,
    hasher: Sha256,
    size: u64,
    cancel: Option<Arc<AtomicBool>>,
}

impl<'a> ContentWriter<'a> {
    /// Start a new content stream.
    ///
    /// `compression` is the zlib level, or `None` to store the stream as is.
    pub fn new(
        store: &'a mut BlockStore,
        key: &MasterKey,
        cipher: CipherKind,
        compression: Option<u32>,
    ) -> Result<Self> {
        let crypto = FileCrypto::generate(cipher);
        let keystream = Keystream::new(&crypto, key)?;

        let sink = CipherSink {
            keystream,
            scratch: Vec::new(),
            blocks: BlockSink::new(store),
        };
        let stage = match compression {
            Some(level) => Stage::Zlib(ZlibEncoder::new(sink, Compression::new(level.min(9)))),
            None => Stage::Raw(sink),
        };

        Ok(Self {
            stage: Some(stage),
            crypto,
            hasher: Sha256::new(),
            size: 0,
            cancel: None,
        })
    }

    /// Stop with [`Error::Cancelled`] on the next write once `flag` is set.
    pub fn with_cancel(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    /// Crypto parameters this stream is being encrypted with.
    pub fn crypto(&self) -> &FileCrypto {
        &self.crypto
    }

    /// Plaintext bytes accepted so far.
    pub fn bytes_written(&self) -> u64 {
        self.size
    }

    /// Pump `src` to exhaustion, reporting plaintext bytes to `progress`.
    pub fn copy_from(&mut self, src: &mut dyn Read, progress: &mut dyn ProgressSink) -> Result<u64> {
        let mut buf = vec![0u8; COPY_BUFFER_SIZE];
        let mut total = 0u64;
        loop {
            let n = match src.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            self.write_all(&buf[..n])?;
            total += n as u64;
            progress.advance(n as u64);
        }
        Ok(total)
    }

    /// Flush the tail block and describe what was written.
    pub fn finish(mut self) -> Result<FileContent> {
        self.check_cancel()?;

        let stage = self
            .stage
            .take()
            .ok_or_else(|| Error::Io(io::Error::other("content writer already finished")))?;
        let (blocks, disk_size) = stage.finish().map_err(|e| {
            log::warn!("content write failed while flushing: {}", e);
            e
        })?;

        let mut crypto = std::mem::replace(&mut self.crypto, FileCrypto::empty());
        crypto.digest = Some(std::mem::take(&mut self.hasher).finalize().to_vec());

        log::debug!(
            "content written: {} bytes plaintext, {} bytes stored in {} blocks ({})",
            self.size,
            disk_size,
            blocks.size(),
            crypto.cipher
        );

        Ok(FileContent {
            blocks,
            size: self.size,
            disk_size,
            modified: current_timestamp(),
            crypto,
        })
    }

    fn check_cancel(&self) -> Result<()> {
        match &self.cancel {
            Some(flag) if flag.load(Ordering::SeqCst) => Err(Error::Cancelled),
            _ => Ok(()),
        }
    }
}

impl Write for ContentWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.check_cancel().map_err(Error::into_io)?;
        let stage = self
            .stage
            .as_mut()
            .ok_or_else(|| io::Error::other("content writer already finished"))?;

        let n = stage.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.size += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.stage.as_mut() {
            Some(stage) => stage.flush(),
            None => Ok(()),
        }
    }
}

impl Drop for ContentWriter<'_> {
    fn drop(&mut self) {
        if let Some(stage) = &self.stage {
            let abandoned = stage.blocks_written();
            if !abandoned.is_empty() {
                log::warn!(
                    "content write abandoned; {} blocks left as dead space",
                    abandoned.size()
                );
            }
        }
    }
}

enum Stage<'a> {
    Raw(CipherSink<'a>),
    Zlib(ZlibEncoder<CipherSink<'a>>),
}

impl Stage<'_> {
    fn blocks_written(&self) -> &RangeSet {
        match self {
            Stage::Raw(sink) => &sink.blocks.blocks,
            Stage::Zlib(encoder) => &encoder.get_ref().blocks.blocks,
        }
    }

    fn finish(self) -> Result<(RangeSet, u64)> {
        let sink = match self {
            Stage::Raw(sink) => sink,
            Stage::Zlib(encoder) => encoder.finish()?,
        };
        sink.blocks.finish()
    }
}

impl Write for Stage<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Stage::Raw(sink) => sink.write(buf),
            Stage::Zlib(encoder) => encoder.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Stage::Raw(sink) => sink.flush(),
            Stage::Zlib(encoder) => encoder.flush(),
        }
    }
}

/// Encrypts in place on the way to the block sink.
struct CipherSink<'a> {
    keystream: Option<Keystream>,
    scratch: Vec<u8>,
    blocks: BlockSink<'a>,
}

impl Write for CipherSink<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut self.keystream {
            Some(keystream) => {
                self.scratch.clear();
                self.scratch.extend_from_slice(buf);
                keystream.apply(&mut self.scratch);
                self.blocks.write_all(&self.scratch)?;
            }
            None => self.blocks.write_all(buf)?,
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Cuts the transformed stream into blocks.
struct BlockSink<'a> {
    store: &'a mut BlockStore,
    pending: Vec<u8>,
    blocks: RangeSet,
    disk_size: u64,
}

impl<'a> BlockSink<'a> {
    fn new(store: &'a mut BlockStore) -> Self {
        let block_size = store.block_size() as usize;
        Self {
            store,
            pending: Vec::with_capacity(block_size),
            blocks: RangeSet::new(),
            disk_size: 0,
        }
    }

    fn emit(&mut self) -> Result<()> {
        let idx = self.store.allocate();
        self.store.write_block(idx, &self.pending)?;
        self.blocks.add(idx);
        self.pending.clear();
        Ok(())
    }

    /// Zero-pad and write the last partial block.
    fn finish(mut self) -> Result<(RangeSet, u64)> {
        if !self.pending.is_empty() {
            self.pending.resize(self.store.block_size() as usize, 0);
            self.emit()?;
        }
        Ok((self.blocks, self.disk_size))
    }
}

impl Write for BlockSink<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let block_size = self.store.block_size() as usize;
        let mut rest = buf;
        while !rest.is_empty() {
            let take = (block_size - self.pending.len()).min(rest.len());
            self.pending.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
            if self.pending.len() == block_size {
                self.emit().map_err(Error::into_io)?;
            }
        }
        self.disk_size += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
