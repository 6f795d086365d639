#![forbid(unsafe_code)]
//! Block allocation.
//!
//! The allocation table keeps one "next block" link per data block, which
//! strings the blocks of a file or directory into a chain, and a parallel
//! used map. Allocation is first-fit over the used map.
//!
//! ## On-disk form
//!
//! - table: `table_size` signed 32-bit LE links at offset 0, `-1` = end
//! - bitmap: `table_size` bytes, `1` = allocated, `0` = free
//! - root header: one block holding the encoded root entry, zero padded

use flatfat_block::ByteDevice;
use flatfat_error::{FatError, Result};
use flatfat_ondisk::{DirEntry, VolumeLayout};
use flatfat_types::{BlockNumber, TABLE_ENTRY_SIZE, encode_link, read_le_i32};
use tracing::{debug, trace, warn};

/// In-memory allocation table and used map.
///
/// Invariant: `links.len() == used.len()`, and every `Some` link points
/// inside the table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationTable {
    links: Vec<Option<BlockNumber>>,
    used: Vec<bool>,
}

impl AllocationTable {
    /// Empty table: every block free, every link at chain end.
    #[must_use]
    pub fn new(table_size: u32) -> Self {
        let len = table_size as usize;
        Self {
            links: vec![None; len],
            used: vec![false; len],
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.links.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    fn index(&self, block: BlockNumber) -> Result<usize> {
        let idx = block.as_index();
        if idx >= self.links.len() {
            return Err(FatError::corruption(
                block.0,
                format!("block index outside table of {} entries", self.links.len()),
            ));
        }
        Ok(idx)
    }

    /// Allocate the lowest-indexed free block.
    pub fn allocate_block(&mut self) -> Result<BlockNumber> {
        let Some(idx) = self.used.iter().position(|used| !used) else {
            warn!(
                target: "flatfat::alloc",
                event = "alloc_exhausted",
                table_size = self.links.len()
            );
            return Err(FatError::NoSpace);
        };
        self.used[idx] = true;
        self.links[idx] = None;
        let block = BlockNumber(
            u32::try_from(idx).map_err(|_| FatError::corruption(0_u32, "table index overflow"))?,
        );
        debug!(target: "flatfat::alloc", event = "block_alloc", block = block.0);
        Ok(block)
    }

    /// Successor of `block` in its chain.
    pub fn next(&self, block: BlockNumber) -> Result<Option<BlockNumber>> {
        let idx = self.index(block)?;
        Ok(self.links[idx])
    }

    /// Make `to` the successor of `from`.
    pub fn link(&mut self, from: BlockNumber, to: BlockNumber) -> Result<()> {
        let from_idx = self.index(from)?;
        self.index(to)?;
        self.links[from_idx] = Some(to);
        trace!(target: "flatfat::alloc", event = "block_link", from = from.0, to = to.0);
        Ok(())
    }

    #[must_use]
    pub fn is_used(&self, block: BlockNumber) -> bool {
        self.used.get(block.as_index()).copied().unwrap_or(false)
    }

    #[must_use]
    pub fn free_count(&self) -> usize {
        self.used.iter().filter(|used| !**used).count()
    }

    /// Iterate the blocks of the chain starting at `start`.
    #[must_use]
    pub fn chain(&self, start: BlockNumber) -> Chain<'_> {
        Chain {
            table: self,
            next: Some(start),
            steps: 0,
        }
    }

    /// Encode the link table.
    pub fn encode_links(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.links.len() * TABLE_ENTRY_SIZE);
        for (idx, link) in self.links.iter().enumerate() {
            let raw = encode_link(*link).map_err(|err| {
                FatError::corruption(idx as u64, format!("unencodable link: {err}"))
            })?;
            out.extend_from_slice(&raw.to_le_bytes());
        }
        Ok(out)
    }

    /// Encode the used map, one byte per block.
    #[must_use]
    pub fn encode_bitmap(&self) -> Vec<u8> {
        self.used.iter().map(|used| u8::from(*used)).collect()
    }

    /// Rebuild a table from its encoded regions, validating every link.
    pub fn decode(table: &[u8], bitmap: &[u8]) -> Result<Self> {
        if table.len() != bitmap.len() * TABLE_ENTRY_SIZE {
            return Err(FatError::InvalidGeometry(format!(
                "table region of {} bytes does not match bitmap of {} entries",
                table.len(),
                bitmap.len()
            )));
        }
        let len = bitmap.len();

        let used = bitmap
            .iter()
            .enumerate()
            .map(|(idx, byte)| match byte {
                0 => Ok(false),
                1 => Ok(true),
                other => Err(FatError::corruption(
                    idx as u64,
                    format!("bitmap byte {other:#04x} is neither 0 nor 1"),
                )),
            })
            .collect::<Result<Vec<bool>>>()?;

        let mut links = Vec::with_capacity(len);
        for idx in 0..len {
            let raw = read_le_i32(table, idx * TABLE_ENTRY_SIZE)
                .map_err(|err| FatError::corruption(idx as u64, err.to_string()))?;
            let link = BlockNumber::from_raw_link(raw)
                .map_err(|err| FatError::corruption(idx as u64, err.to_string()))?;
            if let Some(target) = link {
                if target.as_index() >= len {
                    return Err(FatError::corruption(
                        idx as u64,
                        format!("link to block {target} outside table of {len} entries"),
                    ));
                }
                if !used[target.as_index()] {
                    return Err(FatError::corruption(
                        idx as u64,
                        format!("link to unallocated block {target}"),
                    ));
                }
            }
            links.push(link);
        }

        Ok(Self { links, used })
    }

    /// Read the table and used map of a volume.
    pub fn load(dev: &dyn ByteDevice, layout: &VolumeLayout) -> Result<Self> {
        let mut table = vec![0_u8; layout.table_len()];
        dev.read_exact_at(layout.table_offset(), &mut table)?;
        let mut bitmap = vec![0_u8; layout.bitmap_len()];
        dev.read_exact_at(layout.bitmap_offset(), &mut bitmap)?;
        let loaded = Self::decode(&table, &bitmap)?;
        if loaded.len() != layout.table_size() as usize {
            return Err(FatError::InvalidGeometry(format!(
                "loaded {} table entries, layout expects {}",
                loaded.len(),
                layout.table_size()
            )));
        }
        Ok(loaded)
    }

    /// Write the table, used map and root header to their fixed offsets.
    ///
    /// The three writes are not atomic as a group.
    pub fn flush(&self, dev: &dyn ByteDevice, layout: &VolumeLayout, root: &DirEntry) -> Result<()> {
        dev.write_all_at(layout.table_offset(), &self.encode_links()?)?;
        dev.write_all_at(layout.bitmap_offset(), &self.encode_bitmap())?;

        let mut header = vec![0_u8; layout.block_size().as_usize()];
        root.encode_into(&mut header, 0)
            .map_err(|err| FatError::corruption(0_u32, format!("root entry: {err}")))?;
        dev.write_all_at(layout.root_offset(), &header)?;
        trace!(
            target: "flatfat::alloc",
            event = "metadata_flush",
            free = self.free_count(),
            root_size = root.size
        );
        Ok(())
    }
}

/// Iterator over one chain; see [`AllocationTable::chain`].
///
/// Yields `Corruption` (once, then stops) on an out-of-range link or when
/// the walk takes more steps than the table has blocks.
#[derive(Debug)]
pub struct Chain<'a> {
    table: &'a AllocationTable,
    next: Option<BlockNumber>,
    steps: usize,
}

impl Iterator for Chain<'_> {
    type Item = Result<BlockNumber>;

    fn next(&mut self) -> Option<Self::Item> {
        let block = self.next.take()?;
        self.steps += 1;
        if self.steps > self.table.len() {
            return Some(Err(FatError::corruption(block.0, "cycle in block chain")));
        }
        match self.table.next(block) {
            Ok(next) => {
                self.next = next;
                Some(Ok(block))
            }
            Err(err) => Some(Err(err)),
        }
    }
}
