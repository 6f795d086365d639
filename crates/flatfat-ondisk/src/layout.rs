//! Fixed-offset regions of a volume image.
//!
//! ```text
//! 0                 table_size*4      table_size*5    +block_size
//! | allocation table | free bitmap     | root header   | data blocks ...
//! ```

use flatfat_types::{BlockNumber, BlockSize, ParseError, TABLE_ENTRY_SIZE};
use serde::{Deserialize, Serialize};

/// Geometry of one volume, derived from its capacity and block size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeLayout {
    block_size: BlockSize,
    table_size: u32,
}

impl VolumeLayout {
    /// Derive the layout for a data region of `disk_capacity` bytes.
    ///
    /// `disk_capacity` must be a whole, non-zero number of blocks and the
    /// resulting table must be addressable by signed 32-bit links.
    pub fn new(disk_capacity: u64, block_size: BlockSize) -> Result<Self, ParseError> {
        let bs = u64::from(block_size.get());
        if disk_capacity % bs != 0 {
            return Err(ParseError::InvalidField {
                field: "disk_capacity",
                reason: "must be a multiple of block_size",
            });
        }
        let blocks = disk_capacity / bs;
        if blocks == 0 {
            return Err(ParseError::InvalidField {
                field: "disk_capacity",
                reason: "must hold at least one block",
            });
        }
        let table_size = u32::try_from(blocks)
            .ok()
            .filter(|n| i32::try_from(*n).is_ok())
            .ok_or(ParseError::InvalidField {
                field: "disk_capacity",
                reason: "block count exceeds signed 32-bit links",
            })?;
        Ok(Self {
            block_size,
            table_size,
        })
    }

    #[must_use]
    pub fn block_size(&self) -> BlockSize {
        self.block_size
    }

    /// Number of blocks in the data region (one table slot each).
    #[must_use]
    pub fn table_size(&self) -> u32 {
        self.table_size
    }

    #[must_use]
    pub fn table_offset(&self) -> u64 {
        0
    }

    #[must_use]
    pub fn table_len(&self) -> usize {
        self.table_size as usize * TABLE_ENTRY_SIZE
    }

    #[must_use]
    pub fn bitmap_offset(&self) -> u64 {
        u64::from(self.table_size) * TABLE_ENTRY_SIZE as u64
    }

    #[must_use]
    pub fn bitmap_len(&self) -> usize {
        self.table_size as usize
    }

    /// Offset of the one-block root directory header.
    #[must_use]
    pub fn root_offset(&self) -> u64 {
        self.bitmap_offset() + u64::from(self.table_size)
    }

    #[must_use]
    pub fn data_offset(&self) -> u64 {
        self.root_offset() + u64::from(self.block_size.get())
    }

    /// Total bytes a backing store must provide for this layout.
    #[must_use]
    pub fn image_len(&self) -> u64 {
        self.data_offset() + u64::from(self.table_size) * u64::from(self.block_size.get())
    }

    /// Whether `block` indexes a slot of the allocation table.
    #[must_use]
    pub fn contains(&self, block: BlockNumber) -> bool {
        block.0 < self.table_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flatfat_types::{DEFAULT_BLOCK_SIZE, DEFAULT_DISK_CAPACITY};

    #[test]
    fn reference_geometry_offsets() {
        let layout = VolumeLayout::new(DEFAULT_DISK_CAPACITY, BlockSize::default()).unwrap();
        assert_eq!(layout.table_size(), 262_144);
        assert_eq!(layout.table_offset(), 0);
        assert_eq!(layout.table_len(), 1_048_576);
        assert_eq!(layout.bitmap_offset(), 1_048_576);
        assert_eq!(layout.bitmap_len(), 262_144);
        assert_eq!(layout.root_offset(), 1_310_720);
        assert_eq!(layout.data_offset(), 1_310_720 + u64::from(DEFAULT_BLOCK_SIZE));
        assert_eq!(
            layout.image_len(),
            layout.data_offset() + DEFAULT_DISK_CAPACITY
        );
    }

    #[test]
    fn contains_is_bounded_by_table_size() {
        let layout = VolumeLayout::new(8 * 512, BlockSize::new(512).unwrap()).unwrap();
        assert_eq!(layout.table_size(), 8);
        assert_eq!(layout.image_len(), layout.data_offset() + 8 * 512);
        assert!(layout.contains(BlockNumber(7)));
        assert!(!layout.contains(BlockNumber(8)));
    }

    #[test]
    fn rejects_partial_and_empty_capacity() {
        let bs = BlockSize::new(1024).unwrap();
        assert!(matches!(
            VolumeLayout::new(1536, bs),
            Err(ParseError::InvalidField {
                field: "disk_capacity",
                ..
            })
        ));
        assert!(VolumeLayout::new(0, bs).is_err());
    }

    #[test]
    fn rejects_table_beyond_signed_links() {
        let bs = BlockSize::new(64).unwrap();
        let too_many = (u64::from(u32::MAX >> 1) + 1) * 64;
        assert!(VolumeLayout::new(too_many, bs).is_err());
        assert!(VolumeLayout::new(too_many - 64, bs).is_ok());
    }
}
