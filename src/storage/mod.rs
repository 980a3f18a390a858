//! Storage layer for the archive file.
//!
//! This module handles:
//! - The fixed header and cleartext/sealed sections
//! - The block region and its allocator
//! - Secure erase of dead blocks

mod block_store;
mod erase;
pub mod layout;

pub use block_store::{
    live_blocks, used_block_count, BlockIndex, BlockInventory, BlockReader, BlockStore,
};
pub use erase::{beyond_frontier, wipe_blocks, wipe_blocks_with};
pub use layout::{ArchiveHeader, HEADER_SIZE};
