//! The directory layer.
//!
//! A directory **is** a file: its body is a packed array of fixed-size
//! entries mapping names to inode sectors. There are no `.` or `..`
//! entries on disk. A directory inode records its parent, the path walker
//! resolves the dot names, and the root is its own parent.
//!
//! Name mutation across directories is serialized by the filesystem's
//! operation lock (see [`fsys`](crate::fsys)); a [`Dir`] handle itself only
//! adds a readdir cursor on top of its open inode.

use crate::{
    NAME_MAX, ROOT_DIR_SECTOR,
    disk_layout::{DIR_ENTRY_SIZE, DiskDirEntry},
    fsys::AspenFsInner,
    inode::Inode,
};
use aspen::{KernelError, fs::Sector};
use std::sync::Arc;

/// Default entry capacity a fresh directory's file is sized for. Adding
/// beyond it grows the file like any other write.
pub const INITIAL_ENTRY_CAP: usize = 16;

/// An open directory: an inode plus a readdir cursor.
pub struct Dir {
    inode: Arc<Inode>,
    pos: usize,
}

impl Dir {
    /// Wraps an open inode. The caller keeps ownership of the open on
    /// error (the inode still has to be closed).
    pub(crate) fn from_inode(inode: Arc<Inode>) -> Result<Dir, KernelError> {
        if inode.is_dir() {
            Ok(Dir { inode, pos: 0 })
        } else {
            Err(KernelError::NotDirectory)
        }
    }

    /// The directory's inode.
    pub fn inode(&self) -> &Arc<Inode> {
        &self.inode
    }

    /// The directory's inode sector.
    pub fn inumber(&self) -> Sector {
        self.inode.inumber()
    }

    /// The parent directory's inode sector; the root names itself.
    pub fn parent(&self) -> Sector {
        self.inode
            .parent()
            .expect("directory inode without a parent")
    }

    /// Releases the underlying inode open.
    pub fn close(self, fs: &AspenFsInner) {
        self.inode.close(fs);
    }

    fn entry_count(&self) -> usize {
        self.inode.length() / DIR_ENTRY_SIZE
    }

    fn read_entry(&self, fs: &AspenFsInner, idx: usize) -> DiskDirEntry {
        let mut raw = [0u8; DIR_ENTRY_SIZE];
        let n = self.inode.read_at(fs, &mut raw, idx * DIR_ENTRY_SIZE);
        assert_eq!(n, DIR_ENTRY_SIZE, "directory body truncated");
        DiskDirEntry::from_bytes(&raw)
    }

    fn write_entry(
        &self,
        fs: &AspenFsInner,
        idx: usize,
        entry: &DiskDirEntry,
    ) -> Result<(), KernelError> {
        let n = self
            .inode
            .write_at(fs, &entry.as_bytes(), idx * DIR_ENTRY_SIZE);
        // A short write can only mean the append that grows the directory
        // ran out of sectors.
        if n != DIR_ENTRY_SIZE {
            return Err(KernelError::NoSpace);
        }
        Ok(())
    }

    /// The inode sector the name maps to.
    pub fn lookup(&self, fs: &AspenFsInner, name: &str) -> Result<Sector, KernelError> {
        for idx in 0..self.entry_count() {
            let entry = self.read_entry(fs, idx);
            if entry.name() == Some(name) {
                return entry
                    .inode_sector
                    .get()
                    .ok_or(KernelError::FilesystemCorrupted("live entry without inode"));
            }
        }
        Err(KernelError::NoSuchEntry)
    }

    /// Binds `name` to `sector`, reusing the first free slot or appending.
    pub fn add(&self, fs: &AspenFsInner, name: &str, sector: Sector) -> Result<(), KernelError> {
        if name.is_empty() {
            return Err(KernelError::InvalidArgument);
        }
        if name.len() > NAME_MAX {
            return Err(KernelError::NameTooLong);
        }
        if self.inode.is_removed() {
            // The directory is unlinked; nothing new may become reachable
            // through it.
            return Err(KernelError::NoSuchEntry);
        }
        if self.lookup(fs, name).is_ok() {
            return Err(KernelError::FileExist);
        }
        let entry = DiskDirEntry::new(name, sector).ok_or(KernelError::NameTooLong)?;
        for idx in 0..self.entry_count() {
            if !self.read_entry(fs, idx).is_in_use() {
                return self.write_entry(fs, idx, &entry);
            }
        }
        self.write_entry(fs, self.entry_count(), &entry)
    }

    /// Unbinds `name` and marks its inode for deletion on the last close.
    ///
    /// Rejects the dot names, the root, and non-empty directories.
    pub fn remove(&self, fs: &AspenFsInner, name: &str) -> Result<(), KernelError> {
        if name == "." || name == ".." {
            return Err(KernelError::InvalidArgument);
        }
        let (idx, entry) = self
            .find_slot(fs, name)
            .ok_or(KernelError::NoSuchEntry)?;
        let target_sector = entry
            .inode_sector
            .get()
            .ok_or(KernelError::FilesystemCorrupted("live entry without inode"))?;
        if target_sector == ROOT_DIR_SECTOR {
            return Err(KernelError::Busy);
        }
        let target = fs.inodes.open(fs, target_sector)?;
        if target.is_dir() && has_live_entries(fs, &target) {
            target.close(fs);
            return Err(KernelError::DirectoryNotEmpty);
        }
        // Unbind the name first so no new open can reach the inode, then
        // flag it; holders keep reading until their last close.
        let mut cleared = entry;
        cleared.clear();
        self.write_entry(fs, idx, &cleared)?;
        target.remove();
        target.close(fs);
        Ok(())
    }

    /// The next live entry name, advancing the cursor; `None` at the end.
    pub fn readdir(&mut self, fs: &AspenFsInner) -> Option<String> {
        while self.pos < self.entry_count() {
            let entry = self.read_entry(fs, self.pos);
            self.pos += 1;
            if let Some(name) = entry.name() {
                return Some(name.to_string());
            }
        }
        None
    }

    fn find_slot(&self, fs: &AspenFsInner, name: &str) -> Option<(usize, DiskDirEntry)> {
        (0..self.entry_count()).find_map(|idx| {
            let entry = self.read_entry(fs, idx);
            (entry.name() == Some(name)).then_some((idx, entry))
        })
    }
}

/// Creates a directory inode at `sector` sized for `entry_cap` entries, all
/// free. The capacity is only a starting size; adding entries past it grows
/// the backing file.
pub(crate) fn create(
    fs: &AspenFsInner,
    sector: Sector,
    entry_cap: usize,
    parent_dir: Sector,
) -> Result<(), KernelError> {
    Inode::create(fs, sector, entry_cap * DIR_ENTRY_SIZE, Some(parent_dir))
}

fn has_live_entries(fs: &AspenFsInner, inode: &Arc<Inode>) -> bool {
    let count = inode.length() / DIR_ENTRY_SIZE;
    let mut raw = [0u8; DIR_ENTRY_SIZE];
    (0..count).any(|idx| {
        let n = inode.read_at(fs, &mut raw, idx * DIR_ENTRY_SIZE);
        assert_eq!(n, DIR_ENTRY_SIZE, "directory body truncated");
        DiskDirEntry::from_bytes(&raw).is_in_use()
    })
}
