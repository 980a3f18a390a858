//! Virtual file system over the block store.
//!
//! Provides files, directories and tags on top of the content pipeline,
//! with the whole tree kept in the archive's sealed metadata section.

mod operations;
mod path;
mod tree;
mod types;

pub use operations::{Archive, ArchiveInfo, PasswordSource, VerifyReport, WriteOptions};
pub use path::VfsPath;
pub use tree::MetadataTree;
pub use types::{guess_media_type, DirEntry, FileEntry, Inode, InodeId, InodeKind, DEFAULT_MEDIA_TYPE};
