//! Archive tree types: inodes, file entries, directory listings.

use crate::pipeline::{current_timestamp, FileContent};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Unique identifier for an inode.
pub type InodeId = u64;

/// Root inode ID (always 0).
pub const ROOT_INODE_ID: InodeId = 0;

/// Media type used when nothing better is known.
pub const DEFAULT_MEDIA_TYPE: &str = "application/octet-stream";

/// An inode representing a file or directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Inode {
    /// Unique identifier.
    pub id: InodeId,
    /// Name of the file or directory.
    pub name: String,
    /// Containing directory; `None` only for the root.
    pub parent: Option<InodeId>,
    /// Creation timestamp (Unix epoch seconds).
    pub created: u64,
    /// Last modification timestamp (Unix epoch seconds).
    pub modified: u64,
    pub kind: InodeKind,
}

/// What an inode is.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InodeKind {
    /// A regular file.
    File(FileEntry),
    /// A directory with child inode IDs.
    Directory { children: Vec<InodeId> },
}

/// A stored file: its content descriptor plus user-facing attributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    #[serde(flatten)]
    pub content: FileContent,
    pub media_type: String,
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

impl FileEntry {
    /// An entry with no content yet.
    pub fn new(media_type: String) -> Self {
        Self {
            content: FileContent::empty(),
            media_type,
            tags: BTreeSet::new(),
        }
    }
}

impl Inode {
    /// Create a new, empty file inode.
    pub fn new_file(id: InodeId, name: String, parent: InodeId, media_type: String) -> Self {
        let now = current_timestamp();
        Self {
            id,
            name,
            parent: Some(parent),
            created: now,
            modified: now,
            kind: InodeKind::File(FileEntry::new(media_type)),
        }
    }

    /// Create a new directory inode.
    pub fn new_directory(id: InodeId, name: String, parent: Option<InodeId>) -> Self {
        let now = current_timestamp();
        Self {
            id,
            name,
            parent,
            created: now,
            modified: now,
            kind: InodeKind::Directory {
                children: Vec::new(),
            },
        }
    }

    /// Create the root directory inode.
    pub fn root() -> Self {
        Self::new_directory(ROOT_INODE_ID, "/".to_string(), None)
    }

    /// Check if this is a file.
    pub fn is_file(&self) -> bool {
        matches!(self.kind, InodeKind::File(_))
    }

    /// Check if this is a directory.
    pub fn is_directory(&self) -> bool {
        matches!(self.kind, InodeKind::Directory { .. })
    }

    /// File entry, if this is a file.
    pub fn file(&self) -> Option<&FileEntry> {
        match &self.kind {
            InodeKind::File(entry) => Some(entry),
            InodeKind::Directory { .. } => None,
        }
    }

    /// Mutable file entry, if this is a file.
    pub fn file_mut(&mut self) -> Option<&mut FileEntry> {
        match &mut self.kind {
            InodeKind::File(entry) => Some(entry),
            InodeKind::Directory { .. } => None,
        }
    }

    /// Logical size in bytes (0 for directories).
    pub fn size(&self) -> u64 {
        self.file().map_or(0, |f| f.content.size)
    }

    /// Get children if this is a directory.
    pub fn children(&self) -> Option<&Vec<InodeId>> {
        match &self.kind {
            InodeKind::Directory { children } => Some(children),
            InodeKind::File(_) => None,
        }
    }

    fn children_mut(&mut self) -> Option<&mut Vec<InodeId>> {
        match &mut self.kind {
            InodeKind::Directory { children } => Some(children),
            InodeKind::File(_) => None,
        }
    }

    /// Add a child to this directory.
    pub fn add_child(&mut self, child_id: InodeId) -> bool {
        if let Some(children) = self.children_mut() {
            if !children.contains(&child_id) {
                children.push(child_id);
                self.touch();
                return true;
            }
        }
        false
    }

    /// Remove a child from this directory.
    pub fn remove_child(&mut self, child_id: InodeId) -> bool {
        if let Some(children) = self.children_mut() {
            if let Some(pos) = children.iter().position(|&id| id == child_id) {
                children.remove(pos);
                self.touch();
                return true;
            }
        }
        false
    }

    /// Update modification time.
    pub fn touch(&mut self) {
        self.modified = current_timestamp();
    }
}

/// A directory entry for listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirEntry {
    /// Name of the entry.
    pub name: String,
    /// Inode ID.
    pub inode_id: InodeId,
    /// Whether this is a directory.
    pub is_dir: bool,
    /// Size in bytes (for files).
    pub size: u64,
    /// Media type (for files).
    pub media_type: Option<String>,
    /// Last modification timestamp.
    pub modified: u64,
}

impl DirEntry {
    /// Create from an inode.
    pub fn from_inode(inode: &Inode) -> Self {
        Self {
            name: inode.name.clone(),
            inode_id: inode.id,
            is_dir: inode.is_directory(),
            size: inode.size(),
            media_type: inode.file().map(|f| f.media_type.clone()),
            modified: inode.modified,
        }
    }
}

/// Guess a media type from a file name's extension.
pub fn guess_media_type(name: &str) -> &'static str {
    let ext = match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => ext.to_ascii_lowercase(),
        _ => return DEFAULT_MEDIA_TYPE,
    };
    match ext.as_str() {
        "txt" | "log" => "text/plain",
        "md" => "text/markdown",
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "csv" => "text/csv",
        "js" => "text/javascript",
        "json" => "application/json",
        "xml" => "application/xml",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "gz" => "application/gzip",
        "tar" => "application/x-tar",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "svg" => "image/svg+xml",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        _ => DEFAULT_MEDIA_TYPE,
    }
}
