//! Block-device abstraction.
//!
//! A disk is an array of fixed-size sectors addressed by [`Sector`] number.
//! The filesystem reaches it through the [`Disk`] handle, which is cheap to
//! clone and safe to share between threads; the backing store implements
//! [`BlockDevice`]. On the host the backing store is [`MemDisk`], an
//! in-memory image.

use crate::{KernelError, sync::SpinLock};
use std::sync::Arc;

/// Size of one sector in bytes, the access granularity of every device.
pub const SECTOR_SIZE: usize = 512;

/// Sector, an access granularity for the disk.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd)]
pub struct Sector(pub usize);

impl Sector {
    /// Get the byte offset represented by the sector.
    #[inline]
    pub fn into_offset(self) -> usize {
        self.0 * SECTOR_SIZE
    }

    /// Cast into usize.
    #[inline]
    pub fn into_usize(self) -> usize {
        self.0
    }
}

impl core::ops::Add<usize> for Sector {
    type Output = Self;

    fn add(self, rhs: usize) -> Self {
        Self(self.0 + rhs)
    }
}

/// A sector-addressed storage device.
pub trait BlockDevice: Send + Sync {
    /// Read the sector into `buf`.
    fn read(&self, sector: Sector, buf: &mut [u8; SECTOR_SIZE]) -> Result<(), KernelError>;

    /// Write `buf` to the sector.
    fn write(&self, sector: Sector, buf: &[u8; SECTOR_SIZE]) -> Result<(), KernelError>;

    /// Device capacity in sectors.
    fn size(&self) -> usize;
}

/// The disk, a device that has a byte sink.
///
/// A shared handle over a [`BlockDevice`]; clones address the same device.
#[derive(Clone)]
pub struct Disk(Arc<dyn BlockDevice>);

impl Disk {
    /// Create a new disk handle over the given device.
    pub fn new(dev: impl BlockDevice + 'static) -> Self {
        Self(Arc::new(dev))
    }

    /// Read [`SECTOR_SIZE`] bytes from disk starting from `sector`.
    pub fn read(&self, sector: Sector, buf: &mut [u8; SECTOR_SIZE]) -> Result<(), KernelError> {
        self.0.read(sector, buf)
    }

    /// Write [`SECTOR_SIZE`] bytes to disk starting from `sector`.
    pub fn write(&self, sector: Sector, buf: &[u8; SECTOR_SIZE]) -> Result<(), KernelError> {
        self.0.write(sector, buf)
    }

    /// Device capacity in sectors.
    pub fn size(&self) -> usize {
        self.0.size()
    }
}

/// An in-memory disk image.
///
/// Sectors start zeroed, which doubles as a freshly wiped device.
pub struct MemDisk {
    sectors: SpinLock<Vec<[u8; SECTOR_SIZE]>>,
}

impl MemDisk {
    /// Create an image of `size` sectors.
    pub fn new(size: usize) -> Self {
        Self {
            sectors: SpinLock::new(vec![[0u8; SECTOR_SIZE]; size]),
        }
    }
}

impl BlockDevice for MemDisk {
    fn read(&self, sector: Sector, buf: &mut [u8; SECTOR_SIZE]) -> Result<(), KernelError> {
        let guard = self.sectors.lock();
        let result = match guard.get(sector.into_usize()) {
            Some(data) => {
                buf.copy_from_slice(data);
                Ok(())
            }
            None => Err(KernelError::IOError),
        };
        guard.unlock();
        result
    }

    fn write(&self, sector: Sector, buf: &[u8; SECTOR_SIZE]) -> Result<(), KernelError> {
        let mut guard = self.sectors.lock();
        let result = match guard.get_mut(sector.into_usize()) {
            Some(data) => {
                data.copy_from_slice(buf);
                Ok(())
            }
            None => Err(KernelError::IOError),
        };
        guard.unlock();
        result
    }

    fn size(&self) -> usize {
        let guard = self.sectors.lock();
        let n = guard.len();
        guard.unlock();
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let disk = Disk::new(MemDisk::new(8));
        let mut buf = [0u8; SECTOR_SIZE];
        buf[0] = 0xa5;
        buf[SECTOR_SIZE - 1] = 0x5a;
        disk.write(Sector(3), &buf).unwrap();
        let mut out = [0u8; SECTOR_SIZE];
        disk.read(Sector(3), &mut out).unwrap();
        assert_eq!(buf, out);
    }

    #[test]
    fn out_of_range_is_io_error() {
        let disk = Disk::new(MemDisk::new(2));
        let mut buf = [0u8; SECTOR_SIZE];
        assert_eq!(disk.read(Sector(2), &mut buf), Err(KernelError::IOError));
        assert_eq!(disk.write(Sector(9), &buf), Err(KernelError::IOError));
    }
}
