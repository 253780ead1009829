//! Regular-file handles.
//!
//! A [`File`] is one holder's view of an open regular file: the shared
//! inode plus a private position. Positions never interfere across handles,
//! even handles over the same inode.

use crate::{fsys::AspenFsInner, inode::Inode};
use aspen::{KernelError, fs::Sector};
use std::sync::Arc;

/// An open regular file.
pub struct File {
    inode: Arc<Inode>,
    pos: usize,
    denied_write: bool,
}

impl File {
    /// Wraps an open inode. The caller keeps ownership of the open on
    /// error (the inode still has to be closed).
    pub(crate) fn from_inode(inode: Arc<Inode>) -> Result<File, KernelError> {
        if inode.is_dir() {
            Err(KernelError::IsDirectory)
        } else {
            Ok(File {
                inode,
                pos: 0,
                denied_write: false,
            })
        }
    }

    /// The file's inode.
    pub fn inode(&self) -> &Arc<Inode> {
        &self.inode
    }

    /// The file's inode sector.
    pub fn inumber(&self) -> Sector {
        self.inode.inumber()
    }

    /// Current file length in bytes.
    pub fn length(&self) -> usize {
        self.inode.length()
    }

    /// Reads from the current position, advancing it; short at EOF.
    pub fn read(&mut self, fs: &AspenFsInner, buf: &mut [u8]) -> usize {
        let n = self.inode.read_at(fs, buf, self.pos);
        self.pos += n;
        n
    }

    /// Reads at an absolute offset without moving the position.
    pub fn read_at(&self, fs: &AspenFsInner, buf: &mut [u8], offset: usize) -> usize {
        self.inode.read_at(fs, buf, offset)
    }

    /// Writes at the current position, advancing it; extends the file when
    /// the write runs past EOF.
    pub fn write(&mut self, fs: &AspenFsInner, buf: &[u8]) -> usize {
        let n = self.inode.write_at(fs, buf, self.pos);
        self.pos += n;
        n
    }

    /// Writes at an absolute offset without moving the position.
    pub fn write_at(&self, fs: &AspenFsInner, buf: &[u8], offset: usize) -> usize {
        self.inode.write_at(fs, buf, offset)
    }

    /// Moves the position; seeking past EOF is fine, the next write fills
    /// the gap with zeros.
    pub fn seek(&mut self, pos: usize) {
        self.pos = pos;
    }

    /// The current position.
    pub fn tell(&self) -> usize {
        self.pos
    }

    /// Forbids writes to the underlying inode through any handle for as
    /// long as this handle keeps the denial.
    pub fn deny_write(&mut self) {
        if !self.denied_write {
            self.denied_write = true;
            self.inode.deny_write();
        }
    }

    /// Withdraws this handle's write denial.
    pub fn allow_write(&mut self) {
        if self.denied_write {
            self.denied_write = false;
            self.inode.allow_write();
        }
    }

    /// Closes the handle, balancing its denial and its inode open.
    pub fn close(mut self, fs: &AspenFsInner) {
        self.allow_write();
        self.inode.close(fs);
    }
}
