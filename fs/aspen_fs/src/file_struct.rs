//! Per-process file state.
//!
//! A [`FileStruct`] is the filesystem-facing state of one process: its
//! current working directory and its descriptor table. Descriptors 0 and 1
//! are wired to the console; real opens hand out descriptors from 2
//! upward, monotonically per process, so a stale descriptor never aliases a
//! later open.
//!
//! The surrounding dispatcher owns argument marshalling and turns the
//! [`KernelError`]s returned here into the userspace `-1`/`false`
//! convention ([`KernelError::into_isize`]).

use crate::{
    directory::Dir,
    file::File,
    fsys::{AspenFs, FsObject},
};
use aspen::{KernelError, print};
use std::collections::BTreeMap;

/// Represents an index into a process's file descriptor table.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy)]
pub struct FileDescriptor(pub i32);

/// The kind of object a descriptor refers to.
enum FdEntry {
    /// Standard input; reads drain the console (nothing, on the host).
    Stdin,
    /// Standard output; writes land on the console.
    Stdout,
    /// An open regular file with its position.
    File(File),
    /// An open directory with its readdir cursor.
    Dir(Dir),
}

const MAX_OPEN_FILES: usize = 128;

/// The filesystem state of one process.
pub struct FileStruct {
    fs: AspenFs,
    /// Current working directory; unset means the root.
    cwd: Option<Dir>,
    files: BTreeMap<FileDescriptor, FdEntry>,
    next_fd: i32,
}

impl FileStruct {
    /// Fresh state on `fs`: stdio wired up, cwd at the root.
    pub fn new(fs: &AspenFs) -> FileStruct {
        let mut files = BTreeMap::new();
        files.insert(FileDescriptor(0), FdEntry::Stdin);
        files.insert(FileDescriptor(1), FdEntry::Stdout);
        FileStruct {
            fs: fs.clone(),
            cwd: None,
            files,
            next_fd: 2,
        }
    }

    fn cwd(&self) -> Option<&Dir> {
        self.cwd.as_ref()
    }

    /// Creates a regular file of `size` zero bytes.
    pub fn create(&self, name: &str, size: usize) -> Result<(), KernelError> {
        self.fs.create(self.cwd(), name, size)
    }

    /// Removes a file or an empty directory.
    pub fn remove(&self, name: &str) -> Result<(), KernelError> {
        self.fs.remove(self.cwd(), name)
    }

    /// Opens `name` and installs it in the descriptor table.
    pub fn open(&mut self, name: &str) -> Result<FileDescriptor, KernelError> {
        if self.files.len() >= MAX_OPEN_FILES {
            return Err(KernelError::TooManyOpenFile);
        }
        let object = self.fs.open(self.cwd(), name)?;
        let fd = FileDescriptor(self.next_fd);
        self.next_fd += 1;
        self.files.insert(
            fd,
            match object {
                FsObject::File(f) => FdEntry::File(f),
                FsObject::Dir(d) => FdEntry::Dir(d),
            },
        );
        Ok(fd)
    }

    /// Size in bytes of the open file or directory.
    pub fn filesize(&self, fd: FileDescriptor) -> Result<usize, KernelError> {
        match self.files.get(&fd) {
            Some(FdEntry::File(f)) => Ok(f.length()),
            Some(FdEntry::Dir(d)) => Ok(d.inode().length()),
            _ => Err(KernelError::BadFileDescriptor),
        }
    }

    /// Reads from the descriptor; fd 0 drains the console input.
    pub fn read(&mut self, fd: FileDescriptor, buf: &mut [u8]) -> Result<usize, KernelError> {
        match self.files.get_mut(&fd) {
            Some(FdEntry::Stdin) => Ok(0),
            Some(FdEntry::File(f)) => Ok(f.read(&self.fs, buf)),
            Some(FdEntry::Dir(_)) => Err(KernelError::IsDirectory),
            _ => Err(KernelError::BadFileDescriptor),
        }
    }

    /// Writes to the descriptor; fd 1 goes to the console.
    pub fn write(&mut self, fd: FileDescriptor, buf: &[u8]) -> Result<usize, KernelError> {
        match self.files.get_mut(&fd) {
            Some(FdEntry::Stdout) => {
                print!("{}", String::from_utf8_lossy(buf));
                Ok(buf.len())
            }
            Some(FdEntry::File(f)) => Ok(f.write(&self.fs, buf)),
            Some(FdEntry::Dir(_)) => Err(KernelError::IsDirectory),
            _ => Err(KernelError::BadFileDescriptor),
        }
    }

    /// Moves the file position.
    pub fn seek(&mut self, fd: FileDescriptor, pos: usize) -> Result<(), KernelError> {
        match self.files.get_mut(&fd) {
            Some(FdEntry::File(f)) => {
                f.seek(pos);
                Ok(())
            }
            Some(FdEntry::Dir(_)) => Err(KernelError::IsDirectory),
            _ => Err(KernelError::BadFileDescriptor),
        }
    }

    /// The current file position.
    pub fn tell(&self, fd: FileDescriptor) -> Result<usize, KernelError> {
        match self.files.get(&fd) {
            Some(FdEntry::File(f)) => Ok(f.tell()),
            Some(FdEntry::Dir(_)) => Err(KernelError::IsDirectory),
            _ => Err(KernelError::BadFileDescriptor),
        }
    }

    /// Closes the descriptor. The console descriptors stay.
    pub fn close(&mut self, fd: FileDescriptor) -> Result<(), KernelError> {
        match self.files.get(&fd) {
            Some(FdEntry::File(_)) | Some(FdEntry::Dir(_)) => {}
            _ => return Err(KernelError::BadFileDescriptor),
        }
        match self.files.remove(&fd) {
            Some(FdEntry::File(f)) => f.close(&self.fs),
            Some(FdEntry::Dir(d)) => d.close(&self.fs),
            _ => unreachable!(),
        }
        Ok(())
    }

    /// Changes the current working directory.
    pub fn chdir(&mut self, path: &str) -> Result<(), KernelError> {
        let dir = self.fs.open_dir(self.cwd(), path)?;
        if let Some(old) = self.cwd.replace(dir) {
            old.close(&self.fs);
        }
        Ok(())
    }

    /// Creates an empty directory.
    pub fn mkdir(&self, path: &str) -> Result<(), KernelError> {
        self.fs.mkdir(self.cwd(), path)
    }

    /// The next entry name of an open directory, or `None` at the end.
    pub fn readdir(&mut self, fd: FileDescriptor) -> Result<Option<String>, KernelError> {
        match self.files.get_mut(&fd) {
            Some(FdEntry::Dir(d)) => Ok(d.readdir(&self.fs)),
            Some(FdEntry::File(_)) => Err(KernelError::NotDirectory),
            _ => Err(KernelError::BadFileDescriptor),
        }
    }

    /// Whether the descriptor names a directory.
    pub fn isdir(&self, fd: FileDescriptor) -> Result<bool, KernelError> {
        match self.files.get(&fd) {
            Some(FdEntry::File(_)) => Ok(false),
            Some(FdEntry::Dir(_)) => Ok(true),
            _ => Err(KernelError::BadFileDescriptor),
        }
    }

    /// The inode sector behind the descriptor.
    pub fn inumber(&self, fd: FileDescriptor) -> Result<usize, KernelError> {
        match self.files.get(&fd) {
            Some(FdEntry::File(f)) => Ok(f.inumber().into_usize()),
            Some(FdEntry::Dir(d)) => Ok(d.inumber().into_usize()),
            _ => Err(KernelError::BadFileDescriptor),
        }
    }

    /// Releases every open descriptor; process exit.
    pub fn close_all(&mut self) {
        for (_, entry) in std::mem::take(&mut self.files) {
            match entry {
                FdEntry::File(f) => f.close(&self.fs),
                FdEntry::Dir(d) => d.close(&self.fs),
                FdEntry::Stdin | FdEntry::Stdout => {}
            }
        }
    }
}

impl Drop for FileStruct {
    fn drop(&mut self) {
        self.close_all();
        if let Some(cwd) = self.cwd.take() {
            cwd.close(&self.fs);
        }
    }
}
