//! In-memory open file table.

use flatfat_dir::EntrySlot;
use flatfat_error::{FatError, Result};
use flatfat_ondisk::EntryName;
use flatfat_types::{BlockNumber, FileDescriptor};
use std::collections::BTreeMap;

/// Cursor state of one open file.
///
/// `block_offset` is the cursor's position inside `current_block` and may
/// equal the block size: the cursor then sits at the end of that block and
/// the next transfer first moves to (or allocates) its successor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenFile {
    pub path: String,
    pub name: EntryName,
    /// Where the file's directory record lives; records never move.
    pub slot: EntrySlot,
    pub file_pointer: u32,
    pub first_block: BlockNumber,
    pub current_block: BlockNumber,
    pub block_offset: u32,
    pub size: u32,
}

impl OpenFile {
    #[must_use]
    pub fn new(path: &str, slot: EntrySlot) -> Self {
        Self {
            path: path.to_owned(),
            name: slot.entry.name,
            first_block: slot.entry.first_block,
            current_block: slot.entry.first_block,
            block_offset: 0,
            file_pointer: 0,
            size: slot.entry.size,
            slot,
        }
    }

    /// Bytes between the cursor and the end of the file.
    #[must_use]
    pub fn remaining(&self) -> u32 {
        self.size.saturating_sub(self.file_pointer)
    }
}

/// Descriptor → cursor map with a monotonic descriptor counter.
#[derive(Debug, Default)]
pub struct OpenFileTable {
    next_descriptor: u64,
    files: BTreeMap<FileDescriptor, OpenFile>,
}

impl OpenFileTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a live handle was opened with exactly `path`.
    #[must_use]
    pub fn is_open(&self, path: &str) -> bool {
        self.files.values().any(|file| file.path == path)
    }

    /// Publish a new size to every handle on the record at `slot`.
    ///
    /// Paths that share their first eight bytes open the same record, so
    /// several handles can track one file.
    pub fn share_size(&mut self, slot: &EntrySlot, size: u32) {
        for file in self.files.values_mut() {
            if file.slot.block == slot.block && file.slot.offset == slot.offset {
                file.size = size;
                file.slot.entry.size = size;
            }
        }
    }

    /// Register `file` under the next descriptor.
    pub fn insert(&mut self, file: OpenFile) -> FileDescriptor {
        let fd = FileDescriptor(self.next_descriptor);
        self.next_descriptor += 1;
        self.files.insert(fd, file);
        fd
    }

    pub fn get(&self, fd: FileDescriptor) -> Result<&OpenFile> {
        self.files.get(&fd).ok_or(FatError::InvalidDescriptor(fd.0))
    }

    pub fn get_mut(&mut self, fd: FileDescriptor) -> Result<&mut OpenFile> {
        self.files
            .get_mut(&fd)
            .ok_or(FatError::InvalidDescriptor(fd.0))
    }

    pub fn remove(&mut self, fd: FileDescriptor) -> Result<OpenFile> {
        self.files
            .remove(&fd)
            .ok_or(FatError::InvalidDescriptor(fd.0))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.files.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}
