//! Fixed-size block region and its monotonic allocator.

use crate::error::{Error, Result};
use crate::rangeset::RangeSet;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};

/// Index of a block in the data region.
pub type BlockIndex = u64;

/// Anything that can enumerate the block sets of every live file.
pub trait BlockInventory {
    /// Call `visit` once per live file with that file's blocks.
    fn visit_block_sets(&self, visit: &mut dyn FnMut(&RangeSet));
}

impl BlockInventory for [RangeSet] {
    fn visit_block_sets(&self, visit: &mut dyn FnMut(&RangeSet)) {
        self.iter().for_each(|set| visit(set));
    }
}

impl BlockInventory for Vec<RangeSet> {
    fn visit_block_sets(&self, visit: &mut dyn FnMut(&RangeSet)) {
        self.as_slice().visit_block_sets(visit)
    }
}

/// Union of every live file's blocks.
pub fn live_blocks(inventory: &dyn BlockInventory) -> RangeSet {
    let mut live = RangeSet::new();
    inventory.visit_block_sets(&mut |set| live = live.union(set));
    live
}

/// The allocation frontier implied by an inventory: one past the highest
/// live block, or 0 when nothing is allocated.
pub fn used_block_count(inventory: &dyn BlockInventory) -> u64 {
    live_blocks(inventory).end().unwrap_or(0)
}

/// Read-only handle on the block region.
///
/// Owns its own file handle so content can be streamed out of the archive
/// while a [`BlockStore`] is writing other blocks.
#[derive(Debug)]
pub struct BlockReader {
    file: File,
    block_size: u32,
    region_offset: u64,
}

impl BlockReader {
    /// Size of every block.
    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// Read one full block.
    pub fn read_block(&self, idx: BlockIndex) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.block_size as usize];
        let mut f = &self.file;
        f.seek(SeekFrom::Start(block_offset(self.region_offset, self.block_size, idx)))?;
        f.read_exact(&mut buf).map_err(|e| match e.kind() {
            std::io::ErrorKind::UnexpectedEof => Error::AllocationInconsistency(format!(
                "block {} lies past the end of the archive",
                idx
            )),
            _ => Error::Io(e),
        })?;
        Ok(buf)
    }
}

fn block_offset(region_offset: u64, block_size: u32, idx: BlockIndex) -> u64 {
    region_offset + idx * block_size as u64
}

/// Owner of the archive's block region.
///
/// Blocks are handed out strictly in increasing order and never reused while
/// the store is open; freed blocks stay behind as dead space.
#[derive(Debug)]
pub struct BlockStore {
    reader: BlockReader,
    frontier: BlockIndex,
}

impl BlockStore {
    /// Wrap an open archive file whose block region starts at `region_offset`.
    pub fn new(file: File, block_size: u32, region_offset: u64, frontier: BlockIndex) -> Self {
        Self {
            reader: BlockReader {
                file,
                block_size,
                region_offset,
            },
            frontier,
        }
    }

    /// Size of every block.
    pub fn block_size(&self) -> u32 {
        self.reader.block_size
    }

    /// Byte offset of block `idx` in the archive file.
    pub fn offset_of(&self, idx: BlockIndex) -> u64 {
        block_offset(self.reader.region_offset, self.reader.block_size, idx)
    }

    /// One past the highest block handed out.
    pub fn frontier(&self) -> BlockIndex {
        self.frontier
    }

    /// The underlying archive file.
    pub fn file(&self) -> &File {
        &self.reader.file
    }

    /// Hand out the next block index.
    pub fn allocate(&mut self) -> BlockIndex {
        let idx = self.frontier;
        self.frontier += 1;
        log::trace!("allocated block {}", idx);
        idx
    }

    /// Read one full block.
    pub fn read_block(&self, idx: BlockIndex) -> Result<Vec<u8>> {
        self.reader.read_block(idx)
    }

    /// Write one full block. `data` must be exactly one block long.
    pub fn write_block(&mut self, idx: BlockIndex, data: &[u8]) -> Result<()> {
        if data.len() != self.reader.block_size as usize {
            return Err(Error::AllocationInconsistency(format!(
                "block payload is {} bytes, block size is {}",
                data.len(),
                self.reader.block_size
            )));
        }
        let mut f = &self.reader.file;
        f.seek(SeekFrom::Start(self.offset_of(idx)))?;
        f.write_all(data)?;
        Ok(())
    }

    /// An independent read handle on the same region.
    pub fn reader(&self) -> Result<BlockReader> {
        Ok(BlockReader {
            file: self.reader.file.try_clone()?,
            block_size: self.reader.block_size,
            region_offset: self.reader.region_offset,
        })
    }

    /// Drop every block at or past `frontier` from the file and move the
    /// frontier back to it. Callers must have established that no live file
    /// references those blocks.
    pub fn truncate_to(&mut self, frontier: BlockIndex) -> Result<()> {
        if frontier > self.frontier {
            return Err(Error::AllocationInconsistency(format!(
                "cannot truncate forward from {} to {}",
                self.frontier, frontier
            )));
        }
        let len = self.offset_of(frontier);
        if self.reader.file.metadata()?.len() > len {
            self.reader.file.set_len(len)?;
        }
        if frontier < self.frontier {
            log::debug!("block region truncated from {} to {} blocks", self.frontier, frontier);
        }
        self.frontier = frontier;
        Ok(())
    }

    /// Flush file contents and metadata to disk.
    pub fn sync(&self) -> Result<()> {
        self.reader.file.sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempfile;

    const BS: u32 = 512;

    fn store() -> BlockStore {
        BlockStore::new(tempfile().unwrap(), BS, 100, 0)
    }

    #[test]
    fn test_allocate_is_monotonic() {
        let mut s = store();
        assert_eq!(s.allocate(), 0);
        assert_eq!(s.allocate(), 1);
        assert_eq!(s.allocate(), 2);
        assert_eq!(s.frontier(), 3);
    }

    #[test]
    fn test_write_then_read_block() {
        let mut s = store();
        let a = s.allocate();
        let b = s.allocate();
        s.write_block(a, &[1u8; BS as usize]).unwrap();
        s.write_block(b, &[2u8; BS as usize]).unwrap();

        assert_eq!(s.read_block(a).unwrap(), vec![1u8; BS as usize]);
        assert_eq!(s.read_block(b).unwrap(), vec![2u8; BS as usize]);
        assert_eq!(s.file().metadata().unwrap().len(), 100 + 2 * BS as u64);
    }

    #[test]
    fn test_write_rejects_partial_block() {
        let mut s = store();
        let idx = s.allocate();
        assert!(matches!(
            s.write_block(idx, &[0u8; 10]),
            Err(Error::AllocationInconsistency(_))
        ));
    }

    #[test]
    fn test_read_past_end_is_inconsistency() {
        let s = store();
        assert!(matches!(s.read_block(4), Err(Error::AllocationInconsistency(_))));
    }

    #[test]
    fn test_independent_reader() {
        let mut s = store();
        let idx = s.allocate();
        s.write_block(idx, &[9u8; BS as usize]).unwrap();

        let reader = s.reader().unwrap();
        let next = s.allocate();
        s.write_block(next, &[8u8; BS as usize]).unwrap();

        assert_eq!(reader.read_block(idx).unwrap(), vec![9u8; BS as usize]);
        assert_eq!(reader.read_block(next).unwrap(), vec![8u8; BS as usize]);
    }

    #[test]
    fn test_used_block_count() {
        let inventory = vec![
            RangeSet::from_pairs(vec![(0, 3), (5, 2)]).unwrap(),
            RangeSet::from_pairs(vec![(3, 2)]).unwrap(),
        ];
        assert_eq!(used_block_count(&inventory), 7);
        assert_eq!(used_block_count(&Vec::<RangeSet>::new()), 0);
        assert_eq!(used_block_count(&vec![RangeSet::new()]), 0);
    }

    #[test]
    fn test_truncate_to() {
        let mut s = store();
        for byte in 0..4u8 {
            let idx = s.allocate();
            s.write_block(idx, &[byte; BS as usize]).unwrap();
        }

        s.truncate_to(2).unwrap();
        assert_eq!(s.frontier(), 2);
        assert_eq!(s.file().metadata().unwrap().len(), 100 + 2 * BS as u64);
        assert_eq!(s.allocate(), 2);
        assert!(s.truncate_to(10).is_err());
    }
}
