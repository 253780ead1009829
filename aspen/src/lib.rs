//! # AspenOS kernel-support services.
//!
//! AspenOS is a small teaching operating system. This crate carries the
//! services its subsystems assume from the surrounding kernel: the error
//! type shared across every layer, the kernel print macros, the locking
//! primitives (spinlock, sleeping mutex, condition variable, semaphore,
//! reader-writer lock), thread creation and parking, and the block-device
//! abstraction.
//!
//! On real hardware these services are backed by the scheduler and the
//! device layer. This repository hosts the on-disk filesystem core, so the
//! same interfaces are backed by the host: threads are OS threads, the
//! console is standard error, and block devices are in-memory images. The
//! filesystem code is oblivious to the difference.

#[macro_use]
pub mod kprint;

pub mod fs;
pub mod sync;
pub mod thread;

/// Enum representing errors that can occur during a kernel operation.
///
/// Each variant corresponds to a specific type of error that might occur
/// while handling a kernel operation. These errors can be returned to the
/// user program to indicate the nature of the failure.
#[derive(Debug, Eq, PartialEq, Clone, Copy)]
pub enum KernelError {
    /// No such file or directory. (ENOENT)
    NoSuchEntry,
    /// IO Error. (EIO)
    IOError,
    /// Bad file descriptor. (EBADF)
    BadFileDescriptor,
    /// Device or resource busy. (EBUSY)
    Busy,
    /// File exists. (EEXIST)
    FileExist,
    /// Not a directory. (ENOTDIR)
    NotDirectory,
    /// Is a directory. (EISDIR)
    IsDirectory,
    /// Invalid argument. (EINVAL)
    InvalidArgument,
    /// Too many open files. (EMFILE)
    TooManyOpenFile,
    /// No space left on device. (ENOSPC)
    NoSpace,
    /// File name too long. (ENAMETOOLONG)
    NameTooLong,
    /// Directory not empty. (ENOTEMPTY)
    DirectoryNotEmpty,
    /// File system is corrupted. (EFSCORRUPTED)
    FilesystemCorrupted(&'static str),
    /// Operation is not supported. (ENOTSUPP)
    NotSupportedOperation,
}

impl KernelError {
    /// Converts the [`KernelError`] into the corresponding error code for the
    /// system call boundary. The dispatcher surfaces every variant as a
    /// negative return value; callers that report plain success/failure
    /// collapse it to `-1`.
    pub fn into_isize(self) -> isize {
        match self {
            KernelError::NoSuchEntry => -2,
            KernelError::IOError => -5,
            KernelError::BadFileDescriptor => -9,
            KernelError::Busy => -16,
            KernelError::FileExist => -17,
            KernelError::NotDirectory => -20,
            KernelError::IsDirectory => -21,
            KernelError::InvalidArgument => -22,
            KernelError::TooManyOpenFile => -24,
            KernelError::NoSpace => -28,
            KernelError::NameTooLong => -36,
            KernelError::DirectoryNotEmpty => -39,
            KernelError::FilesystemCorrupted(_) => -117,
            KernelError::NotSupportedOperation => -524,
        }
    }
}
