//! Archive operations - the main interface.

use crate::config::ArchiveConfig;
use crate::crypto::{open_metadata, seal_metadata, CipherKind, KdfDescriptor, MasterKey};
use crate::error::{Error, Result};
use crate::pipeline::{ContentReader, ContentWriter, FileContent, ProgressSink};
use crate::rangeset::RangeSet;
use crate::storage::layout::{
    check_metadata_fits, read_descriptor, read_metadata, write_descriptor, write_metadata,
};
use crate::storage::{
    beyond_frontier, live_blocks, used_block_count, wipe_blocks, ArchiveHeader, BlockIndex,
    BlockStore,
};
use crate::vfs::path::VfsPath;
use crate::vfs::tree::MetadataTree;
use crate::vfs::types::{guess_media_type, DirEntry, FileEntry, Inode, InodeId};
use std::fs::OpenOptions;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use zeroize::Zeroizing;

/// Supplies the archive password when one is needed.
pub trait PasswordSource {
    /// Called at most once per open, and only for password-protected
    /// archives.
    fn password(&mut self, descriptor: &KdfDescriptor) -> Result<Zeroizing<Vec<u8>>>;
}

struct FixedPassword<'a>(&'a [u8]);

impl PasswordSource for FixedPassword<'_> {
    fn password(&mut self, _descriptor: &KdfDescriptor) -> Result<Zeroizing<Vec<u8>>> {
        Ok(Zeroizing::new(self.0.to_vec()))
    }
}

/// Per-write overrides.
#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    /// Cipher for this content; the archive default when `None`.
    pub cipher: Option<CipherKind>,
    /// Media type; kept (or guessed from the name for new files) when `None`.
    pub media_type: Option<String>,
    /// Cooperative cancellation flag.
    pub cancel: Option<Arc<AtomicBool>>,
}

/// Result of [`Archive::verify`].
#[derive(Debug, Clone, Default)]
pub struct VerifyReport {
    /// Number of files read back.
    pub files_checked: usize,
    /// Plaintext bytes read back.
    pub bytes_checked: u64,
    /// Files that failed (path, reason).
    pub damaged: Vec<(String, String)>,
}

impl VerifyReport {
    pub fn is_clean(&self) -> bool {
        self.damaged.is_empty()
    }
}

/// Archive information summary.
#[derive(Debug)]
pub struct ArchiveInfo {
    pub path: PathBuf,
    pub version: u32,
    pub block_size: u32,
    pub compression: Option<u32>,
    pub kdf: &'static str,
    pub default_cipher: CipherKind,
    pub file_count: usize,
    pub dir_count: usize,
    pub total_file_size: u64,
    pub total_disk_size: u64,
    /// One past the highest allocated block.
    pub frontier: BlockIndex,
    pub live_blocks: u64,
    pub dead_blocks: u64,
    pub metadata_capacity: u64,
    pub archive_len: u64,
}

/// An open archive.
pub struct Archive {
    /// Archive file location.
    path: PathBuf,
    header: ArchiveHeader,
    descriptor: KdfDescriptor,
    /// Master key derived from the password.
    key: MasterKey,
    tree: MetadataTree,
    store: BlockStore,
    /// Whether there are unsaved changes.
    dirty: bool,
}

impl Archive {
    /// Create a new archive file.
    ///
    /// # Arguments
    ///
    /// * `path` - Location of the new archive; must not exist yet
    /// * `config` - Archive configuration
    /// * `descriptor` - How the master key is derived from `password`
    /// * `password` - Ignored for [`KdfDescriptor::Plaintext`]
    pub fn create(
        path: &Path,
        config: ArchiveConfig,
        descriptor: KdfDescriptor,
        password: &[u8],
    ) -> Result<Self> {
        config.validate().map_err(Error::InvalidConfig)?;
        let key = descriptor.derive_key(password)?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| match e.kind() {
                io::ErrorKind::AlreadyExists => Error::AlreadyInitialized(path.to_path_buf()),
                _ => Error::Io(e),
            })?;

        let header = ArchiveHeader::new(&config);
        let default_cipher = if descriptor.is_plaintext() {
            CipherKind::None
        } else {
            config.cipher
        };
        let store = BlockStore::new(file, header.block_size, header.block_region_offset(), 0);

        let mut archive = Self {
            path: path.to_path_buf(),
            header,
            descriptor,
            key,
            tree: MetadataTree::new(default_cipher),
            store,
            dirty: true,
        };
        archive.sync()?;

        log::info!(
            "created archive {} (block size {}, kdf {}, cipher {})",
            path.display(),
            archive.header.block_size,
            archive.descriptor.name(),
            default_cipher
        );
        Ok(archive)
    }

    /// Open an existing archive with a known password.
    pub fn open(path: &Path, password: &[u8]) -> Result<Self> {
        Self::open_with(path, &mut FixedPassword(password))
    }

    /// Open an existing archive, asking `source` for the password only if
    /// the archive is password-protected.
    pub fn open_with(path: &Path, source: &mut dyn PasswordSource) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;

        let header = ArchiveHeader::read(&file)?;
        let descriptor = read_descriptor(&file, &header)?;
        let key = if descriptor.is_plaintext() {
            descriptor.derive_key(&[])?
        } else {
            let password = source.password(&descriptor)?;
            descriptor.derive_key(&password)?
        };

        let sealed = read_metadata(&file, &header)?;
        let sealing_key = (!descriptor.is_plaintext()).then_some(&key);
        let json = Zeroizing::new(open_metadata(&sealed, sealing_key)?);
        let tree = MetadataTree::from_json(&json).map_err(|e| match e {
            Error::Serialization(_) if sealing_key.is_some() => Error::Decryption,
            other => other,
        })?;
        tree.check_allocations()?;

        let frontier = used_block_count(&tree);
        let store = BlockStore::new(file, header.block_size, header.block_region_offset(), frontier);

        log::info!(
            "opened archive {} ({} files, frontier {})",
            path.display(),
            tree.file_count(),
            frontier
        );

        Ok(Self {
            path: path.to_path_buf(),
            header,
            descriptor,
            key,
            tree,
            store,
            dirty: false,
        })
    }

    fn sealing_key(&self) -> Option<&MasterKey> {
        (!self.descriptor.is_plaintext()).then_some(&self.key)
    }

    fn compression(&self) -> Option<u32> {
        self.header
            .compression
            .then_some(self.header.compression_level)
    }

    /// Write metadata tree, descriptor and header, then fsync.
    ///
    /// The tree is sealed and checked against the section capacity before
    /// anything touches the file, so an overflow leaves the archive as it
    /// was. The descriptor goes last: a crash between the two writes during a
    /// password change leaves a tree sealed under the new key next to the old
    /// descriptor.
    pub fn sync(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }

        let json = Zeroizing::new(self.tree.to_json()?);
        let sealed = seal_metadata(&json, self.sealing_key())?;
        check_metadata_fits(&self.header, sealed.len())?;

        let file = self.store.file();
        write_metadata(file, &self.header, &sealed)?;
        write_descriptor(file, &self.header, &self.descriptor)?;
        self.header.write(file)?;
        self.store.sync()?;

        log::debug!(
            "metadata synced: {} bytes of {} capacity",
            sealed.len() + 8,
            self.header.metadata_capacity
        );
        self.dirty = false;
        Ok(())
    }

    /// Resolve `path` to a new entry's parent directory and name.
    fn prepare_new(&self, path: &VfsPath) -> Result<(InodeId, String)> {
        let (parent_path, name) = path
            .split()
            .ok_or_else(|| Error::PathExists("/".to_string()))?;

        let parent_id = self.tree.resolve(&parent_path)?;
        if !self.tree.get(parent_id).is_some_and(Inode::is_directory) {
            return Err(Error::NotADirectory(parent_path.to_string()));
        }
        if self.tree.child(parent_id, name).is_some() {
            return Err(Error::PathExists(path.to_string()));
        }
        Ok((parent_id, name.to_string()))
    }

    fn file_entry(&self, path: &str) -> Result<&FileEntry> {
        let vfs_path = VfsPath::parse(path)?;
        let id = self.tree.resolve(&vfs_path)?;
        self.tree
            .get(id)
            .and_then(Inode::file)
            .ok_or_else(|| Error::NotAFile(path.to_string()))
    }

    fn file_entry_mut(&mut self, path: &str) -> Result<&mut FileEntry> {
        let vfs_path = VfsPath::parse(path)?;
        let id = self.tree.resolve(&vfs_path)?;
        self.tree
            .get_mut(id)
            .and_then(Inode::file_mut)
            .ok_or_else(|| Error::NotAFile(path.to_string()))
    }

    /// Create a directory.
    pub fn create_dir(&mut self, path: &str) -> Result<InodeId> {
        let vfs_path = VfsPath::parse(path)?;
        let (parent_id, name) = self.prepare_new(&vfs_path)?;

        let id = self.tree.alloc_id();
        self.tree
            .insert(Inode::new_directory(id, name, Some(parent_id)))?;

        self.dirty = true;
        self.sync()?;
        Ok(id)
    }

    /// Create an empty file.
    pub fn create_file(&mut self, path: &str) -> Result<InodeId> {
        let vfs_path = VfsPath::parse(path)?;
        let (parent_id, name) = self.prepare_new(&vfs_path)?;

        let id = self.tree.alloc_id();
        let media_type = guess_media_type(&name).to_string();
        self.tree
            .insert(Inode::new_file(id, name, parent_id, media_type))?;

        self.dirty = true;
        self.sync()?;
        Ok(id)
    }

    /// Create or fully rewrite a file from an in-memory buffer.
    pub fn write_file(&mut self, path: &str, data: &[u8]) -> Result<InodeId> {
        self.write_file_with(path, &mut &data[..], &WriteOptions::default(), &mut |_: u64| {})
    }

    /// Create or fully rewrite a file from a stream.
    ///
    /// The new content goes to freshly allocated blocks; the previous blocks
    /// become dead space. If the stream fails or is cancelled the file is
    /// left exactly as it was.
    pub fn write_file_with(
        &mut self,
        path: &str,
        src: &mut dyn Read,
        options: &WriteOptions,
        progress: &mut dyn ProgressSink,
    ) -> Result<InodeId> {
        let vfs_path = VfsPath::parse(path)?;
        if vfs_path.is_root() {
            return Err(Error::NotAFile("/".to_string()));
        }

        let existing = match self.tree.resolve(&vfs_path) {
            Ok(id) if self.tree.get(id).is_some_and(Inode::is_file) => Some(id),
            Ok(_) => return Err(Error::NotAFile(path.to_string())),
            Err(Error::FileNotFound(_)) => None,
            Err(e) => return Err(e),
        };
        let target = match existing {
            Some(id) => Target::Existing(id),
            None => {
                let (parent, name) = self.prepare_new(&vfs_path)?;
                Target::New { parent, name }
            }
        };

        let cipher = if self.descriptor.is_plaintext() {
            CipherKind::None
        } else {
            options.cipher.unwrap_or(self.tree.default_cipher)
        };
        let compression = self.compression();

        let mut writer = ContentWriter::new(&mut self.store, &self.key, cipher, compression)?;
        if let Some(flag) = &options.cancel {
            writer = writer.with_cancel(flag.clone());
        }
        writer.copy_from(src, progress)?;
        let content = writer.finish()?;

        let id = match target {
            Target::Existing(id) => {
                let inode = self
                    .tree
                    .get_mut(id)
                    .ok_or_else(|| Error::FileNotFound(path.to_string()))?;
                inode.touch();
                let entry = inode
                    .file_mut()
                    .ok_or_else(|| Error::NotAFile(path.to_string()))?;
                let old = std::mem::replace(&mut entry.content, content);
                if let Some(media_type) = &options.media_type {
                    entry.media_type = media_type.clone();
                }
                log::debug!("{} rewritten; {} blocks now dead", path, old.blocks.size());
                id
            }
            Target::New { parent, name } => {
                let id = self.tree.alloc_id();
                let media_type = options
                    .media_type
                    .clone()
                    .unwrap_or_else(|| guess_media_type(&name).to_string());
                let mut inode = Inode::new_file(id, name, parent, media_type);
                if let Some(entry) = inode.file_mut() {
                    entry.content = content;
                }
                self.tree.insert(inode)?;
                id
            }
        };

        self.dirty = true;
        self.sync()?;
        Ok(id)
    }

    /// Read a file, failing on any integrity problem.
    pub fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        self.open_reader(path, true)?.read_all()
    }

    /// Read whatever can be recovered from a file, skipping the digest check.
    pub fn read_file_unchecked(&self, path: &str) -> Result<Vec<u8>> {
        self.open_reader(path, false)?.read_all()
    }

    /// Stream a file's plaintext.
    pub fn open_reader(&self, path: &str, check_hash_on_finish: bool) -> Result<ContentReader<'_>> {
        let entry = self.file_entry(path)?;
        ContentReader::new(
            self.store.reader()?,
            &entry.content,
            &self.key,
            self.header.compression,
            check_hash_on_finish,
        )
    }

    /// List directory contents, sorted by name.
    pub fn list_dir(&self, path: &str) -> Result<Vec<DirEntry>> {
        let vfs_path = VfsPath::parse(path)?;
        let inode_id = self.tree.resolve(&vfs_path)?;

        let children = self
            .tree
            .get(inode_id)
            .and_then(Inode::children)
            .ok_or_else(|| Error::NotADirectory(path.to_string()))?;

        let mut entries: Vec<DirEntry> = children
            .iter()
            .filter_map(|&id| self.tree.get(id))
            .map(DirEntry::from_inode)
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    /// Get file or directory info.
    pub fn stat(&self, path: &str) -> Result<Inode> {
        let vfs_path = VfsPath::parse(path)?;
        let inode_id = self.tree.resolve(&vfs_path)?;

        self.tree
            .get(inode_id)
            .cloned()
            .ok_or_else(|| Error::FileNotFound(path.to_string()))
    }

    /// Delete a file, or a directory with everything under it.
    ///
    /// The metadata is synced first; the deleted files' blocks that still
    /// lie below the recomputed frontier are then wiped, and the archive is
    /// truncated to that frontier. Returns the number of blocks wiped.
    pub fn delete(&mut self, path: &str) -> Result<u64> {
        let vfs_path = VfsPath::parse(path)?;
        if vfs_path.is_root() {
            return Err(Error::InvalidPath("cannot delete the root directory".to_string()));
        }
        let id = self.tree.resolve(&vfs_path)?;

        let removed = self.tree.remove_subtree(id);
        let deleted: RangeSet = removed
            .iter()
            .filter_map(Inode::file)
            .fold(RangeSet::new(), |acc, f| acc.union(&f.content.blocks));

        self.dirty = true;
        self.sync()?;

        let frontier = used_block_count(&self.tree);
        let to_wipe = deleted.subtract(&beyond_frontier(frontier));
        let wiped = wipe_blocks(&mut self.store, &to_wipe)?;
        self.store.truncate_to(frontier)?;
        self.store.sync()?;

        log::info!(
            "deleted {} ({} inodes, {} blocks released, {} wiped)",
            path,
            removed.len(),
            deleted.size(),
            wiped
        );
        Ok(wiped)
    }

    /// Tag a file. Returns `false` if it already had the tag.
    pub fn add_tag(&mut self, path: &str, tag: &str) -> Result<bool> {
        let tag = normalize_tag(tag)?;
        let added = self.file_entry_mut(path)?.tags.insert(tag);
        if added {
            self.dirty = true;
            self.sync()?;
        }
        Ok(added)
    }

    /// Untag a file. Returns `false` if it did not have the tag.
    pub fn remove_tag(&mut self, path: &str, tag: &str) -> Result<bool> {
        let tag = normalize_tag(tag)?;
        let removed = self.file_entry_mut(path)?.tags.remove(&tag);
        if removed {
            self.dirty = true;
            self.sync()?;
        }
        Ok(removed)
    }

    /// Paths of every file carrying `tag`, sorted.
    pub fn find_by_tag(&self, tag: &str) -> Result<Vec<String>> {
        let tag = normalize_tag(tag)?;
        let mut paths: Vec<String> = self
            .tree
            .files()
            .filter(|(_, entry)| entry.tags.contains(&tag))
            .map(|(id, _)| self.tree.path_of(id))
            .collect();
        paths.sort();
        Ok(paths)
    }

    /// Replace a file's media type.
    pub fn set_media_type(&mut self, path: &str, media_type: &str) -> Result<()> {
        let media_type = media_type.trim();
        if media_type.is_empty() {
            return Err(Error::InvalidConfig("media type must not be empty".to_string()));
        }
        self.file_entry_mut(path)?.media_type = media_type.to_string();
        self.dirty = true;
        self.sync()
    }

    /// Re-key the archive.
    ///
    /// Every file is re-encrypted under the new key before the new descriptor
    /// is written; the superseded blocks are wiped afterwards. If anything
    /// fails before the new metadata is on disk, the archive keeps its old
    /// password and contents, and the blocks written for the new key are
    /// wiped instead.
    pub fn change_password(&mut self, descriptor: KdfDescriptor, password: &[u8]) -> Result<()> {
        let new_key = descriptor.derive_key(password)?;
        let default_cipher = match (descriptor.is_plaintext(), self.tree.default_cipher) {
            (true, _) => CipherKind::None,
            (false, CipherKind::None) => CipherKind::Aes256Ctr,
            (false, current) => current,
        };

        let rewritten = match self.reencrypt_all(&new_key, default_cipher) {
            Ok(rewritten) => rewritten,
            Err((e, written)) => {
                self.discard_blocks(&written);
                return Err(e);
            }
        };

        let mut fresh = RangeSet::new();
        let mut previous = Vec::with_capacity(rewritten.len());
        for (id, content) in rewritten {
            fresh = fresh.union(&content.blocks);
            if let Some(entry) = self.tree.get_mut(id).and_then(Inode::file_mut) {
                previous.push((id, std::mem::replace(&mut entry.content, content)));
            }
        }
        let old_cipher = std::mem::replace(&mut self.tree.default_cipher, default_cipher);
        let old_descriptor = std::mem::replace(&mut self.descriptor, descriptor);
        let old_key = std::mem::replace(&mut self.key, new_key);
        self.dirty = true;

        if let Err(e) = self.sync() {
            for (id, content) in previous {
                if let Some(entry) = self.tree.get_mut(id).and_then(Inode::file_mut) {
                    entry.content = content;
                }
            }
            self.tree.default_cipher = old_cipher;
            self.descriptor = old_descriptor;
            self.key = old_key;
            self.discard_blocks(&fresh);
            log::warn!("password change rolled back: {}", e);
            return Err(e);
        }

        let superseded = previous
            .iter()
            .fold(RangeSet::new(), |acc, (_, old)| acc.union(&old.blocks));
        let to_wipe = superseded.subtract(&beyond_frontier(self.store.frontier()));
        wipe_blocks(&mut self.store, &to_wipe)?;

        log::info!(
            "password changed: {} files re-encrypted, kdf now {}",
            previous.len(),
            self.descriptor.name()
        );
        Ok(())
    }

    /// Copy every file into new blocks under `key`. On failure, returns the
    /// blocks already written alongside the error.
    fn reencrypt_all(
        &mut self,
        key: &MasterKey,
        default_cipher: CipherKind,
    ) -> std::result::Result<Vec<(InodeId, FileContent)>, (Error, RangeSet)> {
        let compression = self.compression();
        let ids: Vec<InodeId> = self.tree.files().map(|(id, _)| id).collect();
        let mut rewritten: Vec<(InodeId, FileContent)> = Vec::with_capacity(ids.len());

        for id in ids {
            let old = match self.tree.get(id).and_then(Inode::file) {
                Some(entry) => entry.content.clone(),
                None => continue,
            };
            let cipher = match (old.crypto.cipher, default_cipher) {
                (_, CipherKind::None) | (CipherKind::None, _) => default_cipher,
                (kept, _) => kept,
            };

            let result = self.reencrypt_one(&old, key, cipher, compression);
            match result {
                Ok(mut content) => {
                    content.modified = old.modified;
                    rewritten.push((id, content));
                }
                Err(e) => {
                    let written = rewritten
                        .iter()
                        .fold(RangeSet::new(), |acc, (_, c)| acc.union(&c.blocks));
                    return Err((e, written));
                }
            }
        }
        Ok(rewritten)
    }

    fn reencrypt_one(
        &mut self,
        old: &FileContent,
        key: &MasterKey,
        cipher: CipherKind,
        compression: Option<u32>,
    ) -> Result<FileContent> {
        let mut reader = ContentReader::new(
            self.store.reader()?,
            old,
            &self.key,
            self.header.compression,
            true,
        )?;
        let mut writer = ContentWriter::new(&mut self.store, key, cipher, compression)?;
        io::copy(&mut reader, &mut writer)?;
        writer.finish()
    }

    /// Wipe blocks no live file references, then drop the tail of the block
    /// region back to the live frontier.
    fn discard_blocks(&mut self, blocks: &RangeSet) {
        let live = live_blocks(&self.tree);
        let to_wipe = blocks
            .subtract(&live)
            .subtract(&beyond_frontier(self.store.frontier()));
        let frontier = live.end().unwrap_or(0);
        let outcome = wipe_blocks(&mut self.store, &to_wipe)
            .and_then(|_| self.store.truncate_to(frontier.min(self.store.frontier())));
        if let Err(e) = outcome {
            log::warn!("could not discard {} blocks: {}", blocks.size(), e);
        }
    }

    /// Read back every file with the integrity check enabled.
    pub fn verify(&self) -> Result<VerifyReport> {
        let mut report = VerifyReport::default();
        for (id, entry) in self.tree.files() {
            let outcome = ContentReader::new(
                self.store.reader()?,
                &entry.content,
                &self.key,
                self.header.compression,
                true,
            )
            .and_then(ContentReader::finish);

            report.files_checked += 1;
            match outcome {
                Ok(()) => report.bytes_checked += entry.content.size,
                Err(
                    e @ (Error::Integrity(_) | Error::AllocationInconsistency(_) | Error::Decryption),
                ) => {
                    let path = self.tree.path_of(id);
                    log::warn!("{} failed verification: {}", path, e);
                    report.damaged.push((path, e.to_string()));
                }
                Err(e) => return Err(e),
            }
        }
        Ok(report)
    }

    /// Get archive info.
    pub fn info(&self) -> Result<ArchiveInfo> {
        let live = live_blocks(&self.tree).size();
        let frontier = self.store.frontier();
        Ok(ArchiveInfo {
            path: self.path.clone(),
            version: self.header.version,
            block_size: self.header.block_size,
            compression: self.compression(),
            kdf: self.descriptor.name(),
            default_cipher: self.tree.default_cipher,
            file_count: self.tree.file_count(),
            dir_count: self.tree.dir_count(),
            total_file_size: self.tree.total_size(),
            total_disk_size: self.tree.total_disk_size(),
            frontier,
            live_blocks: live,
            dead_blocks: frontier.saturating_sub(live),
            metadata_capacity: self.header.metadata_capacity,
            archive_len: self.store.file().metadata()?.len(),
        })
    }

    /// The key-derivation descriptor in force.
    pub fn descriptor(&self) -> &KdfDescriptor {
        &self.descriptor
    }

    /// Content descriptor of a file.
    pub fn content(&self, path: &str) -> Result<&FileContent> {
        Ok(&self.file_entry(path)?.content)
    }

    /// Byte offset of block `idx` in the archive file.
    pub fn block_offset(&self, idx: BlockIndex) -> u64 {
        self.store.offset_of(idx)
    }

    /// Archive file location.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for Archive {
    fn drop(&mut self) {
        // Try to sync on drop
        if let Err(e) = self.sync() {
            log::warn!("final sync of {} failed: {}", self.path.display(), e);
        }
    }
}

enum Target {
    Existing(InodeId),
    New { parent: InodeId, name: String },
}

fn normalize_tag(tag: &str) -> Result<String> {
    let tag = tag.trim();
    if tag.is_empty() {
        return Err(Error::InvalidConfig("tag must not be empty".to_string()));
    }
    Ok(tag.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::atomic::Ordering;
    use tempfile::TempDir;

    const PASSWORD: &[u8] = b"test_password";

    fn config() -> ArchiveConfig {
        ArchiveConfig {
            block_size: 512,
            metadata_capacity: 64 * 1024,
            ..ArchiveConfig::default()
        }
    }

    fn create(dir: &TempDir) -> Archive {
        Archive::create(
            &dir.path().join("test.bv"),
            config(),
            KdfDescriptor::pbkdf2_with(1000),
            PASSWORD,
        )
        .unwrap()
    }

    #[test]
    fn test_create_and_open() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.bv");
        drop(create(&dir));

        let archive = Archive::open(&path, PASSWORD).unwrap();
        assert_eq!(archive.tree.file_count(), 0);
        assert_eq!(archive.store.frontier(), 0);
    }

    #[test]
    fn test_create_refuses_existing() {
        let dir = TempDir::new().unwrap();
        drop(create(&dir));
        let result = Archive::create(
            &dir.path().join("test.bv"),
            config(),
            KdfDescriptor::pbkdf2_with(1000),
            PASSWORD,
        );
        assert!(matches!(result, Err(Error::AlreadyInitialized(_))));
    }

    #[test]
    fn test_write_and_read_file() {
        let dir = TempDir::new().unwrap();
        let mut archive = create(&dir);

        archive.write_file("/secret.txt", b"Hello, secret world!").unwrap();
        assert_eq!(archive.read_file("/secret.txt").unwrap(), b"Hello, secret world!");

        let stat = archive.stat("/secret.txt").unwrap();
        assert_eq!(stat.size(), 20);
        assert_eq!(stat.file().unwrap().media_type, "text/plain");
        assert_eq!(stat.file().unwrap().content.crypto.cipher, CipherKind::Aes256Ctr);
    }

    #[test]
    fn test_create_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let mut archive = create(&dir);

        archive.create_file("/empty.json").unwrap();
        assert!(archive.read_file("/empty.json").unwrap().is_empty());
        assert!(matches!(archive.create_file("/empty.json"), Err(Error::PathExists(_))));
        assert_eq!(archive.stat("/empty.json").unwrap().file().unwrap().media_type, "application/json");
    }

    #[test]
    fn test_directories() {
        let dir = TempDir::new().unwrap();
        let mut archive = create(&dir);

        archive.create_dir("/docs").unwrap();
        archive.write_file("/docs/readme.txt", b"Read me!").unwrap();

        let entries = archive.list_dir("/docs").unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "readme.txt");

        assert!(matches!(archive.create_dir("/docs"), Err(Error::PathExists(_))));
        assert!(matches!(archive.list_dir("/docs/readme.txt"), Err(Error::NotADirectory(_))));
        assert!(matches!(archive.write_file("/docs", b"x"), Err(Error::NotAFile(_))));
        assert!(matches!(archive.write_file("/nope/a", b"x"), Err(Error::FileNotFound(_))));
    }

    #[test]
    fn test_rewrite_allocates_fresh_blocks() {
        let dir = TempDir::new().unwrap();
        let mut archive = create(&dir);

        archive.write_file("/f", &[7u8; 1500]).unwrap();
        let first = archive.content("/f").unwrap().clone();
        archive.write_file("/f", &[8u8; 1500]).unwrap();
        let second = archive.content("/f").unwrap().clone();

        assert!(first.blocks.is_disjoint(&second.blocks));
        assert_ne!(first.crypto.encryption_data, second.crypto.encryption_data);
        assert_eq!(archive.read_file("/f").unwrap(), vec![8u8; 1500]);
    }

    #[test]
    fn test_cancelled_write_keeps_old_content() {
        let dir = TempDir::new().unwrap();
        let mut archive = create(&dir);
        archive.write_file("/f", b"original").unwrap();

        let flag = Arc::new(AtomicBool::new(true));
        let options = WriteOptions {
            cancel: Some(flag.clone()),
            ..WriteOptions::default()
        };
        let result = archive.write_file_with("/f", &mut &b"replacement"[..], &options, &mut |_: u64| {});
        assert!(matches!(result, Err(Error::Cancelled)));
        assert_eq!(archive.read_file("/f").unwrap(), b"original");

        flag.store(false, Ordering::SeqCst);
        let result = archive.write_file_with("/g", &mut &b"new"[..], &options, &mut |_: u64| {});
        assert!(result.is_ok());
    }

    #[test]
    fn test_delete_truncates_and_wipes() {
        let dir = TempDir::new().unwrap();
        let mut archive = create(&dir);

        archive.write_file("/keep", &[1u8; 600]).unwrap();
        archive.write_file("/drop", &[2u8; 600]).unwrap();
        let dropped = archive.content("/drop").unwrap().blocks.clone();
        let frontier_before = archive.store.frontier();

        archive.delete("/drop").unwrap();
        assert!(matches!(archive.stat("/drop"), Err(Error::FileNotFound(_))));
        assert!(archive.store.frontier() < frontier_before);
        assert_eq!(archive.store.frontier(), dropped.first().unwrap());
        assert_eq!(archive.read_file("/keep").unwrap(), vec![1u8; 600]);
    }

    #[test]
    fn test_delete_wipes_interior_blocks() {
        let dir = TempDir::new().unwrap();
        let mut archive = create(&dir);

        archive.write_file("/first", &[1u8; 600]).unwrap();
        archive.write_file("/last", &[2u8; 600]).unwrap();
        let first = archive.content("/first").unwrap().blocks.clone();

        assert_eq!(archive.delete("/first").unwrap(), first.size());
        for idx in first.values() {
            assert_eq!(archive.store.read_block(idx).unwrap(), vec![0u8; 512]);
        }
        assert_eq!(archive.read_file("/last").unwrap(), vec![2u8; 600]);
    }

    #[test]
    fn test_delete_directory_recursively() {
        let dir = TempDir::new().unwrap();
        let mut archive = create(&dir);

        archive.create_dir("/a").unwrap();
        archive.create_dir("/a/b").unwrap();
        archive.write_file("/a/b/c", b"deep").unwrap();
        archive.delete("/a").unwrap();

        assert!(archive.list_dir("/").unwrap().is_empty());
        assert_eq!(archive.tree.inodes.len(), 1);
        assert_eq!(archive.store.frontier(), 0);
        assert!(matches!(archive.delete("/"), Err(Error::InvalidPath(_))));
    }

    #[test]
    fn test_tags_and_media_type() {
        let dir = TempDir::new().unwrap();
        let mut archive = create(&dir);
        archive.write_file("/a.txt", b"a").unwrap();
        archive.write_file("/b.bin", b"b").unwrap();

        assert!(archive.add_tag("/a.txt", "work").unwrap());
        assert!(!archive.add_tag("/a.txt", " work ").unwrap());
        assert!(archive.add_tag("/b.bin", "work").unwrap());
        assert_eq!(archive.find_by_tag("work").unwrap(), vec!["/a.txt", "/b.bin"]);

        assert!(archive.remove_tag("/a.txt", "work").unwrap());
        assert_eq!(archive.find_by_tag("work").unwrap(), vec!["/b.bin"]);
        assert!(archive.add_tag("/a.txt", "  ").is_err());

        archive.set_media_type("/b.bin", "image/png").unwrap();
        assert_eq!(archive.stat("/b.bin").unwrap().file().unwrap().media_type, "image/png");
    }

    #[test]
    fn test_change_password() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.bv");
        {
            let mut archive = create(&dir);
            archive.write_file("/a", &[3u8; 2000]).unwrap();
            archive.write_file("/b", b"bee").unwrap();
            let old_blocks = archive.content("/a").unwrap().blocks.clone();

            archive
                .change_password(KdfDescriptor::scrypt_with(4, 8, 1), b"new_password")
                .unwrap();
            assert!(archive.content("/a").unwrap().blocks.is_disjoint(&old_blocks));
            for idx in old_blocks.values() {
                assert_eq!(archive.store.read_block(idx).unwrap(), vec![0u8; 512]);
            }
        }

        assert!(matches!(Archive::open(&path, PASSWORD), Err(Error::Decryption)));
        let archive = Archive::open(&path, b"new_password").unwrap();
        assert_eq!(archive.descriptor().name(), "scrypt");
        assert_eq!(archive.read_file("/a").unwrap(), vec![3u8; 2000]);
        assert_eq!(archive.read_file("/b").unwrap(), b"bee");
    }

    /// Grow the first file's tag until the metadata section has no room
    /// left for another byte of tree.
    fn fill_metadata(archive: &mut Archive, path: &str) {
        let (mut fits, mut overflows) = (0usize, 4096usize);
        while overflows - fits > 1 {
            let mid = (fits + overflows) / 2;
            let tag = "x".repeat(mid);
            match archive.add_tag(path, &tag) {
                Ok(_) => fits = mid,
                Err(Error::MetadataOverflow { .. }) => overflows = mid,
                Err(e) => panic!("unexpected error: {}", e),
            }
            archive.remove_tag(path, &tag).unwrap();
        }
        if fits > 0 {
            archive.add_tag(path, &"x".repeat(fits)).unwrap();
        }
    }

    #[test]
    fn test_failed_password_change_keeps_old_key() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.bv");
        let descriptor = KdfDescriptor::pbkdf2_with(1000);
        let config = ArchiveConfig {
            metadata_capacity: 4096,
            cipher: CipherKind::None,
            ..config()
        };
        let files: Vec<(String, Vec<u8>)> = (0..6u8)
            .map(|i| (format!("/f-{}", i), vec![i; 700 + i as usize * 100]))
            .collect();
        {
            let mut archive = Archive::create(&path, config, descriptor.clone(), PASSWORD).unwrap();
            for (name, data) in &files {
                archive.write_file(name, data).unwrap();
            }
            fill_metadata(&mut archive, "/f-0");
            let frontier = archive.store.frontier();
            let file_len = fs::metadata(&path).unwrap().len();
            let blocks = archive.content("/f-3").unwrap().blocks.clone();

            let result = archive.change_password(KdfDescriptor::pbkdf2_with(1000), b"new_password");
            assert!(matches!(result, Err(Error::MetadataOverflow { .. })));

            assert_eq!(archive.descriptor(), &descriptor);
            assert_eq!(archive.tree.default_cipher, CipherKind::None);
            assert_eq!(archive.content("/f-3").unwrap().blocks, blocks);
            assert_eq!(archive.store.frontier(), frontier);
            assert_eq!(fs::metadata(&path).unwrap().len(), file_len);
            for (name, data) in &files {
                assert_eq!(&archive.read_file(name).unwrap(), data);
            }
        }

        assert!(matches!(Archive::open(&path, b"new_password"), Err(Error::Decryption)));
        let archive = Archive::open(&path, PASSWORD).unwrap();
        for (name, data) in &files {
            assert_eq!(&archive.read_file(name).unwrap(), data);
        }
        assert!(archive.verify().unwrap().is_clean());
    }

    #[test]
    fn test_verify_and_info() {
        let dir = TempDir::new().unwrap();
        let mut archive = create(&dir);
        archive.write_file("/a", &[5u8; 1000]).unwrap();
        archive.write_file("/a", &[6u8; 1000]).unwrap();

        let report = archive.verify().unwrap();
        assert!(report.is_clean());
        assert_eq!(report.files_checked, 1);
        assert_eq!(report.bytes_checked, 1000);

        let info = archive.info().unwrap();
        assert_eq!(info.file_count, 1);
        assert_eq!(info.dir_count, 1);
        assert_eq!(info.kdf, "pbkdf2-sha256");
        assert_eq!(info.frontier, info.live_blocks + info.dead_blocks);
        assert!(info.dead_blocks > 0);
    }

    struct CountingSource(usize);

    impl PasswordSource for CountingSource {
        fn password(&mut self, _descriptor: &KdfDescriptor) -> Result<Zeroizing<Vec<u8>>> {
            self.0 += 1;
            Ok(Zeroizing::new(PASSWORD.to_vec()))
        }
    }

    #[test]
    fn test_password_source_only_asked_when_needed() {
        let dir = TempDir::new().unwrap();
        let sealed = dir.path().join("sealed.bv");
        let open = dir.path().join("open.bv");
        drop(Archive::create(&sealed, config(), KdfDescriptor::pbkdf2_with(1000), PASSWORD).unwrap());
        drop(Archive::create(&open, config(), KdfDescriptor::plaintext(), b"").unwrap());

        let mut source = CountingSource(0);
        Archive::open_with(&open, &mut source).unwrap();
        assert_eq!(source.0, 0);
        Archive::open_with(&sealed, &mut source).unwrap();
        assert_eq!(source.0, 1);
    }
}
