//! Secure erase of block ranges.

use crate::config::wipe_params;
use crate::error::Result;
use crate::rangeset::RangeSet;
use crate::storage::block_store::{BlockIndex, BlockStore};
use rand::RngCore;

/// Every index at or past `frontier`. Subtract this from a wipe set so that
/// never-written space past the end of the archive is not touched.
pub fn beyond_frontier(frontier: BlockIndex) -> RangeSet {
    RangeSet::from_pair(frontier, u64::MAX - frontier)
}

/// Overwrite every block in `blocks`.
///
/// Performs [`wipe_params::RANDOM_PASSES`] random passes followed by
/// [`wipe_params::ZERO_PASSES`] zero passes over each block, then syncs. The
/// allocation frontier is left alone. Returns the number of blocks wiped.
pub fn wipe_blocks(store: &mut BlockStore, blocks: &RangeSet) -> Result<u64> {
    wipe_blocks_with(store, blocks, wipe_params::RANDOM_PASSES)
}

/// [`wipe_blocks`] with an explicit number of random passes.
pub fn wipe_blocks_with(store: &mut BlockStore, blocks: &RangeSet, random_passes: u8) -> Result<u64> {
    if blocks.is_empty() {
        return Ok(0);
    }

    let block_size = store.block_size() as usize;
    let mut rng = rand::thread_rng();
    let mut pattern = vec![0u8; block_size];

    for _ in 0..random_passes {
        for idx in blocks.values() {
            rng.fill_bytes(&mut pattern);
            store.write_block(idx, &pattern)?;
        }
        store.sync()?;
    }

    pattern.fill(0);
    for _ in 0..wipe_params::ZERO_PASSES {
        for idx in blocks.values() {
            store.write_block(idx, &pattern)?;
        }
        store.sync()?;
    }

    log::info!(
        "wiped {} blocks in {} runs",
        blocks.size(),
        blocks.pair_count()
    );
    Ok(blocks.size())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempfile;

    const BS: u32 = 512;

    fn filled_store(blocks: u8) -> BlockStore {
        let mut store = BlockStore::new(tempfile().unwrap(), BS, 0, 0);
        for byte in 1..=blocks {
            let idx = store.allocate();
            store.write_block(idx, &[byte; BS as usize]).unwrap();
        }
        store
    }

    #[test]
    fn test_wipe_zeroes_only_selected_blocks() {
        let mut store = filled_store(5);
        let targets = RangeSet::from_pairs(vec![(1, 2), (4, 1)]).unwrap();

        assert_eq!(wipe_blocks(&mut store, &targets).unwrap(), 3);

        assert_eq!(store.read_block(0).unwrap(), vec![1u8; BS as usize]);
        assert_eq!(store.read_block(1).unwrap(), vec![0u8; BS as usize]);
        assert_eq!(store.read_block(2).unwrap(), vec![0u8; BS as usize]);
        assert_eq!(store.read_block(3).unwrap(), vec![4u8; BS as usize]);
        assert_eq!(store.read_block(4).unwrap(), vec![0u8; BS as usize]);
        assert_eq!(store.frontier(), 5);
    }

    #[test]
    fn test_wipe_empty_set_is_noop() {
        let mut store = filled_store(1);
        assert_eq!(wipe_blocks(&mut store, &RangeSet::new()).unwrap(), 0);
        assert_eq!(store.read_block(0).unwrap(), vec![1u8; BS as usize]);
    }

    #[test]
    fn test_beyond_frontier_masks_unwritten_space() {
        let mut store = filled_store(3);
        let requested = RangeSet::from_pairs(vec![(1, 6)]).unwrap();
        let safe = requested.subtract(&beyond_frontier(store.frontier()));
        assert_eq!(safe.pairs().collect::<Vec<_>>(), vec![(1, 2)]);

        wipe_blocks_with(&mut store, &safe, 0).unwrap();
        assert_eq!(store.file().metadata().unwrap().len(), 3 * BS as u64);
    }

    #[test]
    fn test_beyond_frontier_from_zero() {
        let everything = beyond_frontier(0);
        assert!(everything.contains(0));
        assert!(everything.contains(u64::MAX - 1));
        assert!(RangeSet::from_pair(0, 10).subtract(&everything).is_empty());
    }
}
