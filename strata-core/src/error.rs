//! The single error type returned by every fallible operation in the
//! workspace.
//!
//! spec.md §7 enumerates the error kinds a conforming implementation must
//! distinguish. [`KernelError`] carries exactly those, plus [`Fatal`] for
//! the kernel-internal invariant violations spec.md §4.12 says must abort
//! rather than propagate.
//!
//! [`Fatal`]: KernelError::Fatal

/// Errors produced by the file system and virtual memory subsystems.
///
/// This mirrors the teacher kernel's `KernelError` enum in spirit (one flat
/// enum shared by every subsystem, convertible to a numeric code at the
/// syscall boundary) but is scoped to the error kinds spec.md §7 actually
/// names.
#[derive(Debug, thiserror::Error, Eq, PartialEq, Clone, Copy)]
pub enum KernelError {
    /// The free map or the swap bitmap has no free slot left.
    #[error("no space left on device")]
    NoSpace,
    /// The kernel-side allocator could not satisfy a request (frame pool
    /// exhausted with no evictable victim, index-block allocation failed).
    #[error("out of memory")]
    NoMemory,
    /// A path component, directory entry, or swap/frame handle does not
    /// exist.
    #[error("no such file or directory")]
    NotFound,
    /// The final component of a `create`/`mkdir` path already exists.
    #[error("file exists")]
    Exists,
    /// An operation that requires a plain file was given a directory.
    #[error("is a directory")]
    IsDirectory,
    /// An operation that requires a directory was given a plain file, or an
    /// intermediate path component was not a directory.
    #[error("not a directory")]
    NotDirectory,
    /// `remove` was attempted on a non-empty directory.
    #[error("directory not empty")]
    NotEmpty,
    /// The block device (or swap device) reported a read/write failure.
    #[error("device I/O error")]
    Io,
    /// Write access was denied: either the inode has `deny_write_cnt > 0`
    /// (a running executable), or a write fault hit a non-writable page.
    #[error("permission denied")]
    Denied,
    /// A name was empty or longer than `NAME_MAX`, an `mmap` address was
    /// misaligned or zero, or some other caller-supplied argument was
    /// malformed.
    #[error("invalid argument")]
    InvalidArgument,
    /// A kernel-internal invariant was violated (lock-order breach, a
    /// double-free of a sector/frame/swap-slot, an inode open-count
    /// underflow). Per spec.md §4.12 this is not recoverable: the caller
    /// should route it to [`crate::logging::fatal`] and abort.
    #[error("fatal kernel invariant violation: {0}")]
    Fatal(&'static str),
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = core::result::Result<T, KernelError>;
