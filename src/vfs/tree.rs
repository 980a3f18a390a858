//! Metadata tree - every inode in the archive.

use crate::crypto::CipherKind;
use crate::error::{Error, Result};
use crate::rangeset::RangeSet;
use crate::storage::BlockInventory;
use crate::vfs::path::VfsPath;
use crate::vfs::types::{FileEntry, Inode, InodeId, InodeKind, ROOT_INODE_ID};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Version of the JSON tree layout.
pub const TREE_VERSION: u32 = 1;

/// The tree stored (sealed) in the archive's metadata section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataTree {
    pub version: u32,
    /// Root inode ID.
    pub root: InodeId,
    /// Next available inode ID.
    pub next_id: InodeId,
    /// Cipher for new content when a write does not name one.
    pub default_cipher: CipherKind,
    /// All inodes indexed by ID.
    pub inodes: BTreeMap<InodeId, Inode>,
}

impl MetadataTree {
    /// A tree holding only the root directory.
    pub fn new(default_cipher: CipherKind) -> Self {
        let mut inodes = BTreeMap::new();
        inodes.insert(ROOT_INODE_ID, Inode::root());

        Self {
            version: TREE_VERSION,
            root: ROOT_INODE_ID,
            next_id: ROOT_INODE_ID + 1,
            default_cipher,
            inodes,
        }
    }

    /// Check structural invariants after loading.
    pub fn validate(&self) -> Result<()> {
        if self.version != TREE_VERSION {
            return Err(Error::VersionMismatch {
                expected: TREE_VERSION,
                found: self.version,
            });
        }
        match self.inodes.get(&self.root) {
            Some(root) if root.is_directory() && root.parent.is_none() => {}
            _ => return Err(Error::Serialization("metadata tree has no root directory".to_string())),
        }

        for inode in self.inodes.values() {
            if inode.id >= self.next_id {
                return Err(Error::Serialization(format!(
                    "inode {} is not below the next id {}",
                    inode.id, self.next_id
                )));
            }
            if let Some(parent) = inode.parent {
                let linked = self
                    .inodes
                    .get(&parent)
                    .and_then(|p| p.children())
                    .is_some_and(|children| children.contains(&inode.id));
                if !linked {
                    return Err(Error::Serialization(format!(
                        "inode {} is not listed by its parent {}",
                        inode.id, parent
                    )));
                }
            }
        }
        self.check_reachable()
    }

    /// Every inode must be listed exactly once on a walk down from the root.
    /// Rules out cycles and detached subtrees, which would otherwise make
    /// `path_of` and `subtree` run forever.
    fn check_reachable(&self) -> Result<()> {
        let mut seen = BTreeSet::new();
        seen.insert(self.root);
        let mut stack = vec![self.root];

        while let Some(dir) = stack.pop() {
            let children = self.get(dir).and_then(Inode::children).into_iter().flatten();
            for &child in children {
                let inode = self.get(child).ok_or_else(|| {
                    Error::Serialization(format!("directory {} lists missing inode {}", dir, child))
                })?;
                if inode.parent != Some(dir) || !seen.insert(child) {
                    return Err(Error::Serialization(format!(
                        "inode {} is linked more than once or under the wrong parent",
                        child
                    )));
                }
                stack.push(child);
            }
        }

        if seen.len() != self.inodes.len() {
            return Err(Error::Serialization(format!(
                "{} inodes are not reachable from the root",
                self.inodes.len() - seen.len()
            )));
        }
        Ok(())
    }

    /// Ensure no two files claim the same block.
    pub fn check_allocations(&self) -> Result<()> {
        let mut claimed = RangeSet::new();
        for (id, entry) in self.files() {
            let blocks = &entry.content.blocks;
            if !claimed.is_disjoint(blocks) {
                return Err(Error::AllocationInconsistency(format!(
                    "{} shares blocks {:?} with another file",
                    self.path_of(id),
                    claimed.intersection(blocks)
                )));
            }
            claimed = claimed.union(blocks);
        }
        Ok(())
    }

    /// Allocate a new inode ID.
    pub fn alloc_id(&mut self) -> InodeId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Get an inode by ID.
    pub fn get(&self, id: InodeId) -> Option<&Inode> {
        self.inodes.get(&id)
    }

    /// Get a mutable inode by ID.
    pub fn get_mut(&mut self, id: InodeId) -> Option<&mut Inode> {
        self.inodes.get_mut(&id)
    }

    /// Insert an inode and link it under its parent.
    pub fn insert(&mut self, inode: Inode) -> Result<()> {
        let id = inode.id;
        if let Some(parent_id) = inode.parent {
            let parent = self
                .inodes
                .get_mut(&parent_id)
                .ok_or_else(|| Error::FileNotFound(format!("inode {}", parent_id)))?;
            if !parent.add_child(id) {
                return Err(Error::NotADirectory(parent.name.clone()));
            }
        }
        self.inodes.insert(id, inode);
        Ok(())
    }

    /// Find a child of `dir` by name.
    pub fn child(&self, dir: InodeId, name: &str) -> Option<InodeId> {
        self.get(dir)?
            .children()?
            .iter()
            .copied()
            .find(|&id| self.get(id).is_some_and(|child| child.name == name))
    }

    /// Resolve a path to an inode ID.
    pub fn resolve(&self, path: &VfsPath) -> Result<InodeId> {
        let mut current = self.root;
        for component in path.components() {
            let inode = self
                .get(current)
                .ok_or_else(|| Error::FileNotFound(path.to_string()))?;
            if !inode.is_directory() {
                return Err(Error::NotADirectory(path.to_string()));
            }
            current = self
                .child(current, component)
                .ok_or_else(|| Error::FileNotFound(path.to_string()))?;
        }
        Ok(current)
    }

    /// Rebuild the absolute path of an inode by walking parent links.
    pub fn path_of(&self, id: InodeId) -> String {
        let mut names = Vec::new();
        let mut current = self.get(id);
        while let Some(inode) = current {
            if inode.parent.is_none() {
                break;
            }
            names.push(inode.name.as_str());
            current = inode.parent.and_then(|p| self.get(p));
        }
        if names.is_empty() {
            return "/".to_string();
        }
        names.iter().rev().fold(String::new(), |mut acc, name| {
            acc.push('/');
            acc.push_str(name);
            acc
        })
    }

    /// `id` and everything below it, children before parents.
    pub fn subtree(&self, id: InodeId) -> Vec<InodeId> {
        let mut order = Vec::new();
        let mut stack = vec![(id, false)];
        while let Some((current, expanded)) = stack.pop() {
            if expanded {
                order.push(current);
                continue;
            }
            stack.push((current, true));
            if let Some(children) = self.get(current).and_then(|i| i.children()) {
                stack.extend(children.iter().map(|&c| (c, false)));
            }
        }
        order
    }

    /// Detach `id` and its descendants; returns the removed inodes.
    pub fn remove_subtree(&mut self, id: InodeId) -> Vec<Inode> {
        if let Some(parent) = self.get(id).and_then(|i| i.parent) {
            if let Some(parent) = self.inodes.get_mut(&parent) {
                parent.remove_child(id);
            }
        }
        self.subtree(id)
            .into_iter()
            .filter_map(|victim| self.inodes.remove(&victim))
            .collect()
    }

    /// Every file entry with its inode ID.
    pub fn files(&self) -> impl Iterator<Item = (InodeId, &FileEntry)> + '_ {
        self.inodes.values().filter_map(|inode| match &inode.kind {
            InodeKind::File(entry) => Some((inode.id, entry)),
            InodeKind::Directory { .. } => None,
        })
    }

    /// Get total number of files.
    pub fn file_count(&self) -> usize {
        self.files().count()
    }

    /// Get total number of directories.
    pub fn dir_count(&self) -> usize {
        self.inodes.values().filter(|i| i.is_directory()).count()
    }

    /// Total logical size of all files.
    pub fn total_size(&self) -> u64 {
        self.files().map(|(_, f)| f.content.size).sum()
    }

    /// Total stored size of all files.
    pub fn total_disk_size(&self) -> u64 {
        self.files().map(|(_, f)| f.content.disk_size).sum()
    }

    /// Serialize to JSON.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Deserialize from JSON and validate.
    pub fn from_json(data: &[u8]) -> Result<Self> {
        let tree: MetadataTree = serde_json::from_slice(data)?;
        tree.validate()?;
        Ok(tree)
    }
}

impl BlockInventory for MetadataTree {
    fn visit_block_sets(&self, visit: &mut dyn FnMut(&RangeSet)) {
        self.files().for_each(|(_, entry)| visit(&entry.content.blocks));
    }
}
