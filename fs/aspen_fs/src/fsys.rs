//! Filesystem glue.
//!
//! [`AspenFs`] binds the layers together: it owns the disk, the buffer
//! cache, the free map, and the open-inode table, and it is where paths
//! turn into inodes. Formatting lays down the two reserved inodes, the
//! free-map file at sector 0 and the root directory at sector 1, and
//! mounting reads them back.
//!
//! Paths split on `/`. A leading `/` resolves from the root, anything else
//! from the caller's current directory; `.` and `..` are walked (`..` at
//! the root stays put), every intermediate component must be a directory,
//! and a trailing `/` is tolerated.
//!
//! Name-mutating operations (create, mkdir, remove) serialize on one
//! filesystem-wide lock, closing the race between a name lookup and the
//! entry mutation it justifies. Read-only traffic never takes it.

use crate::{
    FREE_MAP_SECTOR, ROOT_DIR_SECTOR,
    cache::Cache,
    directory::{self, Dir},
    file::File,
    freemap::FreeMap,
    inode::{Inode, InodeTable},
};
use aspen::{
    KernelError, info,
    fs::{Disk, Sector},
    sync::Mutex,
};
use std::sync::Arc;

/// The filesystem's shared state; reached through [`AspenFs`].
pub struct AspenFsInner {
    /// The backing device; the cache holds its own handle to the same one.
    pub disk: Disk,
    pub(crate) cache: Cache,
    /// Free-sector accounting; exposed for allocation probes.
    pub freemap: FreeMap,
    pub(crate) inodes: InodeTable,
    op_lock: Mutex<()>,
}

/// A mounted AspenOS filesystem.
///
/// Cheap to clone; clones share the mount. Call [`AspenFs::unmount`] when
/// done so the flusher stops and every dirty buffer reaches the device.
#[derive(Clone)]
pub struct AspenFs(pub Arc<AspenFsInner>);

impl core::ops::Deref for AspenFs {
    type Target = AspenFsInner;
    fn deref(&self) -> &AspenFsInner {
        &self.0
    }
}

/// What a path resolved to: a regular file or a directory.
pub enum FsObject {
    File(File),
    Dir(Dir),
}

impl FsObject {
    /// Whether this is a directory.
    pub fn is_dir(&self) -> bool {
        matches!(self, FsObject::Dir(_))
    }

    /// Inode sector regardless of kind.
    pub fn inumber(&self) -> Sector {
        match self {
            FsObject::File(f) => f.inumber(),
            FsObject::Dir(d) => d.inumber(),
        }
    }

    /// Extracts the regular file, closing the handle if it is a directory.
    pub fn into_file(self, fs: &AspenFsInner) -> Result<File, KernelError> {
        match self {
            FsObject::File(f) => Ok(f),
            FsObject::Dir(d) => {
                d.close(fs);
                Err(KernelError::IsDirectory)
            }
        }
    }

    /// Extracts the directory, closing the handle if it is a file.
    pub fn into_dir(self, fs: &AspenFsInner) -> Result<Dir, KernelError> {
        match self {
            FsObject::Dir(d) => Ok(d),
            FsObject::File(f) => {
                f.close(fs);
                Err(KernelError::NotDirectory)
            }
        }
    }

    /// Closes the handle.
    pub fn close(self, fs: &AspenFsInner) {
        match self {
            FsObject::File(f) => f.close(fs),
            FsObject::Dir(d) => d.close(fs),
        }
    }
}

fn split_path(path: &str) -> (Vec<&str>, Option<&str>) {
    let mut parts: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    let base = parts.pop();
    (parts, base)
}

impl AspenFs {
    /// Wipes `disk` into a fresh filesystem and mounts it.
    pub fn format(disk: Disk) -> Result<AspenFs, KernelError> {
        let sectors = disk.size();
        let inner = Arc::new(AspenFsInner {
            cache: Cache::new(disk.clone()),
            freemap: FreeMap::new(sectors),
            inodes: InodeTable::new(),
            op_lock: Mutex::new(()),
            disk,
        });
        if !inner.freemap.mark(FREE_MAP_SECTOR) || !inner.freemap.mark(ROOT_DIR_SECTOR) {
            return Err(KernelError::InvalidArgument);
        }
        // The free-map file itself, then the root; both draw data sectors
        // from the still in-memory map.
        Inode::create(&inner, FREE_MAP_SECTOR, FreeMap::byte_len(sectors), None)?;
        directory::create(
            &inner,
            ROOT_DIR_SECTOR,
            directory::INITIAL_ENTRY_CAP,
            ROOT_DIR_SECTOR,
        )?;
        let map_file = inner.inodes.open(&inner, FREE_MAP_SECTOR)?;
        inner.freemap.attach(map_file);
        inner.freemap.persist(&inner);
        info!(
            "[aspen-fs] formatted: {} sectors, {} free",
            sectors,
            inner.freemap.count_free()
        );
        Ok(AspenFs(inner))
    }

    /// Mounts the filesystem already on `disk`.
    pub fn mount(disk: Disk) -> Result<AspenFs, KernelError> {
        let sectors = disk.size();
        let inner = Arc::new(AspenFsInner {
            cache: Cache::new(disk.clone()),
            freemap: FreeMap::new(sectors),
            inodes: InodeTable::new(),
            op_lock: Mutex::new(()),
            disk,
        });
        let map_file = inner.inodes.open(&inner, FREE_MAP_SECTOR)?;
        let mut bytes = vec![0u8; map_file.length()];
        let read = map_file.read_at(&inner, &mut bytes, 0);
        if read != bytes.len() {
            map_file.close(&inner);
            return Err(KernelError::FilesystemCorrupted("free map file truncated"));
        }
        inner.freemap.load(&bytes);
        inner.freemap.attach(map_file);
        let root = inner.inodes.open(&inner, ROOT_DIR_SECTOR)?;
        let is_dir = root.is_dir();
        root.close(&inner);
        if !is_dir {
            return Err(KernelError::FilesystemCorrupted("root is not a directory"));
        }
        info!(
            "[aspen-fs] mounted: {} sectors, {} free",
            sectors,
            inner.freemap.count_free()
        );
        Ok(AspenFs(inner))
    }

    /// Tears the mount down: stops the flusher and writes every dirty
    /// buffer out. Safe to call once per clone; later calls are no-ops.
    pub fn unmount(self) {
        if let Some(map_file) = self.freemap.detach() {
            map_file.close(&self);
        }
        self.cache.shutdown();
        info!("[aspen-fs] unmounted");
    }

    /// Opens a fresh handle on the root directory.
    pub fn root(&self) -> Result<Dir, KernelError> {
        let inode = self.inodes.open(self, ROOT_DIR_SECTOR)?;
        Dir::from_inode(inode)
    }

    fn start_dir(&self, cwd: Option<&Dir>, path: &str) -> Result<Dir, KernelError> {
        match cwd {
            Some(cwd) if !path.starts_with('/') => {
                cwd.inode().reopen();
                Dir::from_inode(Arc::clone(cwd.inode()))
            }
            _ => self.root(),
        }
    }

    /// Walks `parts` from `dir`, consuming the handle; every component must
    /// resolve to a directory.
    fn walk<'a>(
        &self,
        mut dir: Dir,
        parts: impl IntoIterator<Item = &'a str>,
    ) -> Result<Dir, KernelError> {
        for comp in parts {
            let next = match comp {
                "." => continue,
                ".." => {
                    let parent = dir.parent();
                    if parent == dir.inumber() {
                        // `..` at the root stays at the root.
                        continue;
                    }
                    self.inodes.open(self, parent)
                }
                name => dir
                    .lookup(self, name)
                    .and_then(|sector| self.inodes.open(self, sector)),
            };
            let inode = match next {
                Ok(inode) => inode,
                Err(e) => {
                    dir.close(self);
                    return Err(e);
                }
            };
            if !inode.is_dir() {
                inode.close(self);
                dir.close(self);
                return Err(KernelError::NotDirectory);
            }
            dir.close(self);
            dir = Dir::from_inode(inode)?;
        }
        Ok(dir)
    }

    /// Opens whatever `path` names.
    pub fn open(&self, cwd: Option<&Dir>, path: &str) -> Result<FsObject, KernelError> {
        let (prefix, base) = split_path(path);
        let dir = self.walk(self.start_dir(cwd, path)?, prefix)?;
        let name = match base {
            None => return Ok(FsObject::Dir(dir)),
            Some(dot @ ("." | "..")) => {
                return Ok(FsObject::Dir(self.walk(dir, [dot])?));
            }
            Some(name) => name,
        };
        let found = dir
            .lookup(self, name)
            .and_then(|sector| self.inodes.open(self, sector));
        dir.close(self);
        let inode = found?;
        if inode.is_dir() {
            Ok(FsObject::Dir(Dir::from_inode(inode)?))
        } else {
            Ok(FsObject::File(File::from_inode(inode)?))
        }
    }

    /// Opens `path` as a directory.
    pub fn open_dir(&self, cwd: Option<&Dir>, path: &str) -> Result<Dir, KernelError> {
        let object = self.open(cwd, path)?;
        object.into_dir(self)
    }

    /// Creates a regular file of `size` zero bytes. Fails if the name
    /// exists, is empty, or is too long.
    pub fn create(
        &self,
        cwd: Option<&Dir>,
        path: &str,
        size: usize,
    ) -> Result<(), KernelError> {
        self.create_node(cwd, path, |fs, sector, _parent| {
            Inode::create(fs, sector, size, None)
        })
    }

    /// Creates an empty directory.
    pub fn mkdir(&self, cwd: Option<&Dir>, path: &str) -> Result<(), KernelError> {
        self.create_node(cwd, path, |fs, sector, parent| {
            directory::create(fs, sector, directory::INITIAL_ENTRY_CAP, parent)
        })
    }

    fn create_node(
        &self,
        cwd: Option<&Dir>,
        path: &str,
        build: impl FnOnce(&AspenFsInner, Sector, Sector) -> Result<(), KernelError>,
    ) -> Result<(), KernelError> {
        let op = self.op_lock.lock();
        let result = self.create_node_locked(cwd, path, build);
        op.unlock();
        result
    }

    fn create_node_locked(
        &self,
        cwd: Option<&Dir>,
        path: &str,
        build: impl FnOnce(&AspenFsInner, Sector, Sector) -> Result<(), KernelError>,
    ) -> Result<(), KernelError> {
        let (prefix, base) = split_path(path);
        let Some(name) = base else {
            return Err(KernelError::InvalidArgument);
        };
        if name == "." || name == ".." {
            return Err(KernelError::InvalidArgument);
        }
        let dir = self.walk(self.start_dir(cwd, path)?, prefix)?;
        let result = (|| {
            let sector = self
                .freemap
                .allocate(self, 1)
                .ok_or(KernelError::NoSpace)?;
            if let Err(e) = build(self, sector, dir.inumber()) {
                // The inode sector was never written; data sectors an
                // aborted build claimed stay lost until reformat.
                self.freemap.release(self, sector, 1);
                return Err(e);
            }
            if let Err(e) = dir.add(self, name, sector) {
                let inode = self.inodes.open(self, sector)?;
                inode.remove();
                inode.close(self);
                return Err(e);
            }
            Ok(())
        })();
        dir.close(self);
        result
    }

    /// Removes whatever `path` names. Directories must be empty; `.`,
    /// `..`, and the root are refused.
    pub fn remove(&self, cwd: Option<&Dir>, path: &str) -> Result<(), KernelError> {
        let op = self.op_lock.lock();
        let result = (|| {
            let (prefix, base) = split_path(path);
            let Some(name) = base else {
                // The root itself.
                return Err(KernelError::Busy);
            };
            let dir = self.walk(self.start_dir(cwd, path)?, prefix)?;
            let result = dir.remove(self, name);
            dir.close(self);
            result
        })();
        op.unlock();
        result
    }

    /// Writes every dirty buffer to the device and empties the cache.
    pub fn flush(&self) {
        self.cache.flush();
    }

    /// Whether the cache currently holds `sector`. Probe for tests.
    pub fn cached(&self, sector: Sector) -> bool {
        self.cache.contains(sector)
    }

    /// Free sectors left on the device. Probe for tests.
    pub fn free_sectors(&self) -> usize {
        self.freemap.count_free()
    }

    /// Open inodes in the table. Probe for tests.
    pub fn open_inodes(&self) -> usize {
        self.inodes.open_inodes()
    }
}
