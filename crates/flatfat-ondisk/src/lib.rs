#![forbid(unsafe_code)]
//! On-disk format for flatfat volumes.
//!
//! Pure layout and codec crate with no I/O. Computes the fixed region offsets
//! of a volume image and encodes/decodes the 32-byte directory entry record.

pub mod dirent;
pub mod layout;

pub use dirent::{DirEntry, EntryName};
pub use layout::VolumeLayout;
