#![forbid(unsafe_code)]
//! Error types for flatfat.
//!
//! # Error Taxonomy
//!
//! flatfat uses a two-layer error model:
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `flatfat-types` | Malformed bytes found while decoding on-disk records |
//! | Runtime | `FatError` | `flatfat-error` (this crate) | Errors returned by every public volume operation |
//!
//! `flatfat-error` does not depend on `flatfat-types`. Crates that decode
//! on-disk bytes convert a `ParseError` into `FatError::Corruption` with the
//! block it was read from, or into `FatError::InvalidGeometry` when the bad
//! value came from a configuration rather than the image.
//!
//! ## errno Mapping
//!
//! | Variant | errno |
//! |---------|-------|
//! | `Io` | raw OS error, else `EIO` |
//! | `Corruption` | `EIO` |
//! | `InvalidGeometry` | `EINVAL` |
//! | `NotFound` | `ENOENT` |
//! | `AlreadyExists` | `EEXIST` |
//! | `AlreadyOpen` | `EBUSY` |
//! | `InvalidDescriptor` | `EBADF` |
//! | `InvalidOffset` | `EINVAL` |
//! | `PastEndOfFile` | `EINVAL` |
//! | `NoSpace` | `ENOSPC` |
//! | `InvalidName` | `EINVAL` |
//! | `FileTooLarge` | `EFBIG` |
//!
//! No operation recovers internally. A failure in the middle of `create` or
//! `write` can leave metadata and data blocks out of step; nothing rolls it
//! back.

use thiserror::Error;

/// Unified error type for all flatfat operations.
#[derive(Debug, Error)]
pub enum FatError {
    /// Backing store I/O failed, including short reads and writes.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// On-disk metadata is inconsistent at a known block.
    ///
    /// Raised for out-of-range links, cyclic chains, undecodable directory
    /// records, and chains shorter than a declared size.
    #[error("corrupt volume at block {block}: {detail}")]
    Corruption { block: u64, detail: String },

    /// Volume geometry is invalid or does not match the backing store.
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The file already has a live descriptor.
    #[error("already open: {0}")]
    AlreadyOpen(String),

    #[error("invalid descriptor: {0}")]
    InvalidDescriptor(u64),

    /// Seek target falls outside `[0, size]`.
    #[error("invalid offset: {0}")]
    InvalidOffset(i64),

    /// A read asked for more bytes than remain after the cursor.
    #[error("read past end of file: requested {requested} bytes, {available} available")]
    PastEndOfFile { requested: usize, available: u32 },

    /// The allocation table has no unused block left.
    #[error("no space left on volume")]
    NoSpace,

    #[error("invalid name: {0:?}")]
    InvalidName(String),

    /// File size would exceed the 32-bit on-disk size field.
    #[error("file too large")]
    FileTooLarge,
}

impl FatError {
    /// Convert this error into a POSIX errno.
    ///
    /// The match is exhaustive; a new variant does not compile until it has
    /// an errno.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Corruption { .. } => libc::EIO,
            Self::InvalidGeometry(_)
            | Self::InvalidOffset(_)
            | Self::PastEndOfFile { .. }
            | Self::InvalidName(_) => libc::EINVAL,
            Self::NotFound(_) => libc::ENOENT,
            Self::AlreadyExists(_) => libc::EEXIST,
            Self::AlreadyOpen(_) => libc::EBUSY,
            Self::InvalidDescriptor(_) => libc::EBADF,
            Self::NoSpace => libc::ENOSPC,
            Self::FileTooLarge => libc::EFBIG,
        }
    }

    /// Shorthand for a `Corruption` error.
    #[must_use]
    pub fn corruption(block: impl Into<u64>, detail: impl Into<String>) -> Self {
        Self::Corruption {
            block: block.into(),
            detail: detail.into(),
        }
    }
}

/// Result alias using `FatError`.
pub type Result<T> = std::result::Result<T, FatError>;
