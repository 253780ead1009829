//! # The AspenOS on-disk filesystem.
//!
//! This crate is the disk half of AspenOS: everything between the
//! sector-addressed block device and the file descriptors a process holds.
//! Bottom-up:
//!
//! ```text
//! ┌───────────────────────────────────────────┐
//! │ file_struct::FileStruct                   │
//! │ - per-process descriptor table, cwd       │
//! ├───────────────────────────────────────────┤
//! │ fsys::AspenFs                             │
//! │ - format/mount, path resolution           │
//! ├─────────────────────┬─────────────────────┤
//! │ directory::Dir      │ file::File          │
//! │ - names → inodes    │ - position, deny    │
//! ├─────────────────────┴─────────────────────┤
//! │ inode                                     │
//! │ - offset → sector index, growth, teardown │
//! ├──────────────────────┬────────────────────┤
//! │ cache::Cache         │ freemap::FreeMap   │
//! │ - write-back buffers │ - sector bitmap    │
//! ├──────────────────────┴────────────────────┤
//! │ aspen::fs::Disk                           │
//! └───────────────────────────────────────────┘
//! ```
//!
//! A file's data lives in 512-byte sectors reached through a tiered index:
//! ten direct slots in the inode, ten indirect blocks of 128 slots each, and
//! one double-indirect block of 128 indirect blocks. All sector traffic,
//! index blocks included, flows through the buffer cache, which writes back
//! lazily: a background flusher sweeps dirty buffers every
//! [`FLUSH_INTERVAL`], and unmounting flushes unconditionally.
//!
//! Directories are ordinary files holding fixed-size name entries; a
//! directory inode records its parent, and the root is its own parent.

macro_rules! const_assert {
    ($($tt:tt)*) => {
        const _: () = assert!($($tt)*);
    }
}

pub mod cache;
pub mod directory;
pub mod disk_layout;
pub mod file;
pub mod file_struct;
pub mod freemap;
pub mod fsys;
pub mod inode;

pub use aspen::KernelError;
pub use aspen::fs::{SECTOR_SIZE, Sector};
pub use fsys::{AspenFs, FsObject};

use core::time::Duration;

/// Direct index slots in an inode.
pub const DIRECT_CNT: usize = 10;

/// Indirect index slots in an inode.
pub const INDIRECT_CNT: usize = 10;

/// Sector indices held by one indirect block.
pub const PTRS_PER_SECTOR: usize = SECTOR_SIZE / core::mem::size_of::<u32>();
const_assert!(PTRS_PER_SECTOR == 128);

/// Largest file the index can address, in sectors.
pub const MAX_FILE_SECTORS: usize =
    DIRECT_CNT + INDIRECT_CNT * PTRS_PER_SECTOR + PTRS_PER_SECTOR * PTRS_PER_SECTOR;

/// Longest permitted name of a directory entry.
pub const NAME_MAX: usize = 14;

/// Sector of the inode backing the free-map file.
pub const FREE_MAP_SECTOR: Sector = Sector(0);

/// Sector of the root directory's inode.
pub const ROOT_DIR_SECTOR: Sector = Sector(1);

/// Buffers in the cache pool.
pub const MAX_CACHE_SIZE: usize = 64;

/// Cadence of the background write-behind sweep.
pub const FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Number of sectors needed to hold `bytes` bytes.
#[inline]
pub fn bytes_to_sectors(bytes: usize) -> usize {
    bytes.div_ceil(SECTOR_SIZE)
}
