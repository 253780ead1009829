//! The inode layer.
//!
//! An inode is the on-disk record of one file or directory: its length, its
//! parent (directories only), and the tiered index mapping file offsets to
//! data sectors. This module keeps the **single in-memory view** of each
//! inode: opening a sector that is already open returns the same
//! reference-counted [`Inode`], so open counts, removal, and write denial
//! are coordinated kernel-wide.
//!
//! Files grow on write. Extending a file allocates and zeroes every sector
//! between the old end and the new one, wiring fresh indirect blocks into
//! the index as the walk crosses 128-slot group boundaries; the in-memory
//! length moves only after the new sectors exist, so every offset below
//! `length` is always backed by an allocated sector. Writes past EOF thus
//! leave zero-filled holes, and reads past EOF come back short.
//!
//! A removed inode gives up its sectors on the last close: the inode sector
//! itself, then the data sectors, then the index blocks, each exactly once.

use crate::{
    DIRECT_CNT, INDIRECT_CNT, MAX_FILE_SECTORS, PTRS_PER_SECTOR, SECTOR_SIZE, bytes_to_sectors,
    disk_layout::{DiskInode, IndirectBlock},
    fsys::AspenFsInner,
};
use aspen::{
    KernelError,
    fs::Sector,
    sync::{Mutex, RwLock, SpinLock},
};
use std::{collections::BTreeMap, sync::Arc};

struct OpenMeta {
    open_count: usize,
    removed: bool,
    deny_write_count: usize,
}

/// The in-memory side of one on-disk inode.
///
/// Obtained from [`InodeTable::open`]; every holder must balance its open
/// with [`Inode::close`].
pub struct Inode {
    sector: Sector,
    meta: SpinLock<OpenMeta>,
    /// Cached copy of the inode sector.
    data: RwLock<DiskInode>,
    /// Serializes length extensions; concurrent writers may otherwise
    /// interleave the index walk and the length update.
    grow: Mutex<()>,
}

impl Inode {
    /// The sector holding this inode; its identity.
    #[inline]
    pub fn inumber(&self) -> Sector {
        self.sector
    }

    /// Current file length in bytes.
    pub fn length(&self) -> usize {
        self.data.read().length as usize
    }

    /// Whether the inode names a directory.
    pub fn is_dir(&self) -> bool {
        self.data.read().is_dir()
    }

    /// The containing directory's inode sector; `None` for regular files.
    pub fn parent(&self) -> Option<Sector> {
        self.data.read().parent_dir.get()
    }

    /// Takes another reference to an already-open inode.
    pub fn reopen(&self) {
        let mut meta = self.meta.lock();
        meta.open_count += 1;
        meta.unlock();
    }

    /// Current number of opens. Probe for tests.
    pub fn open_count(&self) -> usize {
        let meta = self.meta.lock();
        let n = meta.open_count;
        meta.unlock();
        n
    }

    /// Marks the inode for deletion on the last close.
    pub fn remove(&self) {
        let mut meta = self.meta.lock();
        meta.removed = true;
        meta.unlock();
    }

    /// Whether the inode is marked for deletion.
    pub fn is_removed(&self) -> bool {
        let meta = self.meta.lock();
        let removed = meta.removed;
        meta.unlock();
        removed
    }

    /// Forbids writes through this inode until a matching
    /// [`Inode::allow_write`].
    pub fn deny_write(&self) {
        let mut meta = self.meta.lock();
        meta.deny_write_count += 1;
        assert!(meta.deny_write_count <= meta.open_count);
        meta.unlock();
    }

    /// Re-permits writes denied by [`Inode::deny_write`].
    pub fn allow_write(&self) {
        let mut meta = self.meta.lock();
        assert!(meta.deny_write_count > 0);
        meta.deny_write_count -= 1;
        meta.unlock();
    }

    /// Drops one reference. On the last close of a removed inode, every
    /// owned sector goes back to the free map.
    pub fn close(&self, fs: &AspenFsInner) {
        let mut map = fs.inodes.map.lock();
        let mut meta = self.meta.lock();
        assert!(meta.open_count > 0);
        meta.open_count -= 1;
        let last = meta.open_count == 0;
        let removed = meta.removed;
        meta.unlock();
        if last {
            map.remove(&self.sector.into_usize());
        }
        map.unlock();
        if last && removed {
            self.destroy(fs);
        }
    }

    /// The device sector backing byte `pos`, or `None` past EOF.
    pub fn byte_to_sector(&self, fs: &AspenFsInner, pos: usize) -> Option<Sector> {
        let disk = *self.data.read();
        if pos >= disk.length as usize {
            return None;
        }
        Some(lookup_index(fs, &disk, pos / SECTOR_SIZE))
    }

    /// Reads up to `buf.len()` bytes starting at `offset`; returns the byte
    /// count, short at EOF.
    pub fn read_at(&self, fs: &AspenFsInner, buf: &mut [u8], offset: usize) -> usize {
        let disk = *self.data.read();
        let length = disk.length as usize;
        let end = core::cmp::min(offset.saturating_add(buf.len()), length);
        if offset >= end {
            return 0;
        }
        let mut done = 0;
        let mut pos = offset;
        let mut bounce = [0u8; SECTOR_SIZE];
        while pos < end {
            let sector = lookup_index(fs, &disk, pos / SECTOR_SIZE);
            let ofs = pos % SECTOR_SIZE;
            let chunk = core::cmp::min(SECTOR_SIZE - ofs, end - pos);
            fs.cache.read(sector, &mut bounce);
            buf[done..done + chunk].copy_from_slice(&bounce[ofs..ofs + chunk]);
            pos += chunk;
            done += chunk;
        }
        done
    }

    /// Writes `buf` at `offset`, extending the file as needed; returns the
    /// byte count, short when growth fails or writes are denied (0).
    ///
    /// A write past EOF allocates and zeroes every sector in between, so
    /// the skipped range reads back as zeros.
    pub fn write_at(&self, fs: &AspenFsInner, buf: &[u8], offset: usize) -> usize {
        {
            let meta = self.meta.lock();
            let denied = meta.deny_write_count > 0;
            meta.unlock();
            if denied {
                return 0;
            }
        }
        if buf.is_empty() {
            return 0;
        }
        let want_end = offset + buf.len();
        if want_end > self.length() {
            let guard = self.grow.lock();
            let cur = self.length();
            if want_end > cur {
                let mut disk = *self.data.read();
                if extend_index(fs, &mut disk, bytes_to_sectors(cur), bytes_to_sectors(want_end))
                    .is_ok()
                {
                    disk.length = want_end as i32;
                    let mut cached = self.data.write();
                    *cached = disk;
                    drop(cached);
                    fs.cache.write(self.sector, &disk.as_sector());
                }
                // On failure the length stays put and the write comes back
                // short; sectors the aborted walk already claimed are not
                // reclaimed.
            }
            guard.unlock();
        }
        let disk = *self.data.read();
        let end = core::cmp::min(want_end, disk.length as usize);
        if offset >= end {
            return 0;
        }
        let mut done = 0;
        let mut pos = offset;
        let mut bounce = [0u8; SECTOR_SIZE];
        while pos < end {
            let sector = lookup_index(fs, &disk, pos / SECTOR_SIZE);
            let ofs = pos % SECTOR_SIZE;
            let chunk = core::cmp::min(SECTOR_SIZE - ofs, end - pos);
            if chunk == SECTOR_SIZE {
                bounce.copy_from_slice(&buf[done..done + SECTOR_SIZE]);
            } else {
                fs.cache.read(sector, &mut bounce);
                bounce[ofs..ofs + chunk].copy_from_slice(&buf[done..done + chunk]);
            }
            fs.cache.write(sector, &bounce);
            pos += chunk;
            done += chunk;
        }
        done
    }

    /// Writes an inode of `length` zero-filled bytes at `sector`.
    ///
    /// Every data sector is allocated and zeroed up front; `parent_dir`
    /// distinguishes a directory from a regular file. The sector itself
    /// must already be claimed by the caller.
    pub fn create(
        fs: &AspenFsInner,
        sector: Sector,
        length: usize,
        parent_dir: Option<Sector>,
    ) -> Result<(), KernelError> {
        let mut disk = DiskInode::new(parent_dir);
        extend_index(fs, &mut disk, 0, bytes_to_sectors(length))?;
        disk.length = length as i32;
        fs.cache.write(sector, &disk.as_sector());
        Ok(())
    }

    /// Releases every sector the inode owns, in fixed order: the inode
    /// sector, the direct data sectors, each indirect block's data sectors
    /// followed by the block itself, then the double-indirect tree. The
    /// index fills contiguously, so the walk stops at the first gap.
    fn destroy(&self, fs: &AspenFsInner) {
        let disk = *self.data.read();
        fs.freemap.release(fs, self.sector, 1);
        for ptr in disk.direct.iter() {
            match ptr.get() {
                Some(s) => fs.freemap.release(fs, s, 1),
                None => return,
            }
        }
        for ptr in disk.indirect.iter() {
            match ptr.get() {
                Some(s) => {
                    if !release_indirect(fs, s) {
                        return;
                    }
                }
                None => return,
            }
        }
        if let Some(dbl) = disk.double_indirect.get() {
            let mut raw = [0u8; SECTOR_SIZE];
            fs.cache.read(dbl, &mut raw);
            let block = IndirectBlock::from_sector(&raw);
            for ptr in block.iter() {
                match ptr.get() {
                    Some(s) => {
                        if !release_indirect(fs, s) {
                            break;
                        }
                    }
                    None => break,
                }
            }
            fs.freemap.release(fs, dbl, 1);
        }
    }
}

/// Releases an indirect block's data sectors and the block itself; `false`
/// when the block ended at a gap (the index stops there).
fn release_indirect(fs: &AspenFsInner, sector: Sector) -> bool {
    let mut raw = [0u8; SECTOR_SIZE];
    fs.cache.read(sector, &mut raw);
    let block = IndirectBlock::from_sector(&raw);
    let mut full = true;
    for ptr in block.iter() {
        match ptr.get() {
            Some(s) => fs.freemap.release(fs, s, 1),
            None => {
                full = false;
                break;
            }
        }
    }
    fs.freemap.release(fs, sector, 1);
    full
}

/// Maps a logical sector index through the tiered index. The caller has
/// checked the offset against `length`; an unallocated reference below that
/// is a corrupted index.
fn lookup_index(fs: &AspenFsInner, disk: &DiskInode, idx: usize) -> Sector {
    let missing = || panic!("offset below file length maps to an unallocated sector");
    if idx < DIRECT_CNT {
        return disk.direct[idx].get().unwrap_or_else(missing);
    }
    let idx = idx - DIRECT_CNT;
    let mut raw = [0u8; SECTOR_SIZE];
    if idx < INDIRECT_CNT * PTRS_PER_SECTOR {
        let ind = disk.indirect[idx / PTRS_PER_SECTOR]
            .get()
            .unwrap_or_else(missing);
        fs.cache.read(ind, &mut raw);
        let block = IndirectBlock::from_sector(&raw);
        return block[idx % PTRS_PER_SECTOR].get().unwrap_or_else(missing);
    }
    let idx = idx - INDIRECT_CNT * PTRS_PER_SECTOR;
    let dbl = disk.double_indirect.get().unwrap_or_else(missing);
    fs.cache.read(dbl, &mut raw);
    let block = IndirectBlock::from_sector(&raw);
    let child = block[idx / PTRS_PER_SECTOR].get().unwrap_or_else(missing);
    fs.cache.read(child, &mut raw);
    let block = IndirectBlock::from_sector(&raw);
    block[idx % PTRS_PER_SECTOR].get().unwrap_or_else(missing)
}

/// Grows the index from `from` to `to` logical sectors.
///
/// Each new data sector is zeroed through the cache before the index
/// references it. Fresh indirect blocks start all-unallocated and are
/// written back when their 128-slot group fills or the walk ends; the
/// double-indirect block is brought in lazily on the first crossing into
/// its region. On exhaustion the walk stops where it stands: the caller's
/// in-core inode is discarded unwritten, and sectors the walk already
/// claimed stay claimed.
fn extend_index(
    fs: &AspenFsInner,
    disk: &mut DiskInode,
    from: usize,
    to: usize,
) -> Result<(), KernelError> {
    if to > MAX_FILE_SECTORS {
        return Err(KernelError::NoSpace);
    }

    // The indirect block currently being filled, and the double-indirect
    // block once the walk reaches its region: (sector, contents, dirty).
    let mut ind: Option<(Sector, IndirectBlock, bool)> = None;
    let mut ind_group = usize::MAX;
    let mut dbl: Option<(Sector, IndirectBlock, bool)> = None;

    let zero = [0u8; SECTOR_SIZE];
    for i in from..to {
        let data_sector = fs.freemap.allocate(fs, 1).ok_or(KernelError::NoSpace)?;
        fs.cache.write(data_sector, &zero);

        if i < DIRECT_CNT {
            disk.direct[i] = data_sector.into();
            continue;
        }
        let idx = i - DIRECT_CNT;
        let (group, slot) = (idx / PTRS_PER_SECTOR, idx % PTRS_PER_SECTOR);
        if ind_group != group {
            if let Some((sec, block, dirty)) = ind.take() {
                if dirty {
                    fs.cache.write(sec, &block.as_sector());
                }
            }
            ind = Some(enter_group(fs, disk, &mut dbl, group)?);
            ind_group = group;
        }
        let (_, block, dirty) = ind.as_mut().unwrap();
        block[slot] = data_sector.into();
        *dirty = true;
        if slot == PTRS_PER_SECTOR - 1 {
            let (sec, block, _) = ind.take().unwrap();
            fs.cache.write(sec, &block.as_sector());
            ind_group = usize::MAX;
        }
    }
    if let Some((sec, block, dirty)) = ind.take() {
        if dirty {
            fs.cache.write(sec, &block.as_sector());
        }
    }
    if let Some((sec, block, dirty)) = dbl.take() {
        if dirty {
            fs.cache.write(sec, &block.as_sector());
        }
    }
    Ok(())
}

/// Brings indirect group `group` in core: reads the existing block, or
/// allocates a fresh all-unallocated one and wires it into the inode (or
/// the double-indirect block, which itself materializes lazily here).
fn enter_group(
    fs: &AspenFsInner,
    disk: &mut DiskInode,
    dbl: &mut Option<(Sector, IndirectBlock, bool)>,
    group: usize,
) -> Result<(Sector, IndirectBlock, bool), KernelError> {
    let existing = if group < INDIRECT_CNT {
        disk.indirect[group]
    } else {
        if dbl.is_none() {
            *dbl = Some(match disk.double_indirect.get() {
                Some(s) => {
                    let mut raw = [0u8; SECTOR_SIZE];
                    fs.cache.read(s, &mut raw);
                    (s, IndirectBlock::from_sector(&raw), false)
                }
                None => {
                    let s = fs.freemap.allocate(fs, 1).ok_or(KernelError::NoSpace)?;
                    disk.double_indirect = s.into();
                    (s, IndirectBlock::empty(), true)
                }
            });
        }
        dbl.as_ref().unwrap().1[group - INDIRECT_CNT]
    };
    match existing.get() {
        Some(s) => {
            let mut raw = [0u8; SECTOR_SIZE];
            fs.cache.read(s, &mut raw);
            Ok((s, IndirectBlock::from_sector(&raw), false))
        }
        None => {
            let s = fs.freemap.allocate(fs, 1).ok_or(KernelError::NoSpace)?;
            if group < INDIRECT_CNT {
                disk.indirect[group] = s.into();
            } else {
                let d = dbl.as_mut().unwrap();
                d.1[group - INDIRECT_CNT] = s.into();
                d.2 = true;
            }
            Ok((s, IndirectBlock::empty(), true))
        }
    }
}

/// The open-inode table: at most one in-memory [`Inode`] per sector.
pub(crate) struct InodeTable {
    map: SpinLock<BTreeMap<usize, Arc<Inode>>>,
}

impl InodeTable {
    pub(crate) fn new() -> Self {
        InodeTable {
            map: SpinLock::new(BTreeMap::new()),
        }
    }

    /// Opens the inode at `sector`, reading it from disk on the first open
    /// and bumping the open count otherwise.
    pub(crate) fn open(
        &self,
        fs: &AspenFsInner,
        sector: Sector,
    ) -> Result<Arc<Inode>, KernelError> {
        let map = self.map.lock();
        if let Some(inode) = map.get(&sector.into_usize()) {
            let inode = Arc::clone(inode);
            map.unlock();
            inode.reopen();
            return Ok(inode);
        }
        map.unlock();

        // First open: pull the inode sector in without the table locked.
        let mut raw = [0u8; SECTOR_SIZE];
        fs.cache.read(sector, &mut raw);
        let disk = DiskInode::from_sector(&raw)?;

        let mut map = self.map.lock();
        // Someone may have beaten us to the insert.
        if let Some(inode) = map.get(&sector.into_usize()) {
            let inode = Arc::clone(inode);
            map.unlock();
            inode.reopen();
            return Ok(inode);
        }
        let inode = Arc::new(Inode {
            sector,
            meta: SpinLock::new(OpenMeta {
                open_count: 1,
                removed: false,
                deny_write_count: 0,
            }),
            data: RwLock::new(disk),
            grow: Mutex::new(()),
        });
        map.insert(sector.into_usize(), Arc::clone(&inode));
        map.unlock();
        Ok(inode)
    }

    /// Number of open inodes. Probe for tests.
    pub(crate) fn open_inodes(&self) -> usize {
        let map = self.map.lock();
        let n = map.len();
        map.unlock();
        n
    }
}
