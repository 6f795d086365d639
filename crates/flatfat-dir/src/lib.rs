#![forbid(unsafe_code)]
//! Root directory operations.
//!
//! The namespace is flat: one root directory whose entry list is a chain of
//! blocks packed with 32-byte records. The root entry's `size` is the byte
//! length of that list, so the last block is partially filled unless `size`
//! is a multiple of the block size.
//!
//! The first root block starts with `.` and `..` records. They are written
//! by [`init_root`] and skipped by every lookup.

use flatfat_alloc::AllocationTable;
use flatfat_block::{BlockBuf, BlockDevice};
use flatfat_error::{FatError, Result};
use flatfat_ondisk::{DirEntry, EntryName};
use flatfat_types::{BlockNumber, DIR_ENTRY_SIZE};
use tracing::{debug, trace};

#[expect(clippy::cast_possible_truncation)]
const RECORD_LEN: u32 = DIR_ENTRY_SIZE as u32;

/// A directory record together with where it is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntrySlot {
    pub block: BlockNumber,
    /// Byte offset of the record within `block`.
    pub offset: usize,
    pub entry: DirEntry,
}

/// Names that can be created in the root directory.
pub fn validate_name(path: &str) -> Result<EntryName> {
    let name = EntryName::from_path(path);
    if name.is_empty() || name.is_dot() {
        return Err(FatError::InvalidName(path.to_owned()));
    }
    Ok(name)
}

/// Allocate the first root block and write the `.`/`..` records.
///
/// Returns the root entry, whose `size` covers the two records.
pub fn init_root(dev: &dyn BlockDevice, table: &mut AllocationTable) -> Result<DirEntry> {
    let block = table.allocate_block()?;
    let size = 2 * RECORD_LEN;

    let mut buf = BlockBuf::zeroed(dev.block_size());
    for (slot, name) in [EntryName::DOT, EntryName::DOT_DOT].into_iter().enumerate() {
        DirEntry::directory(name, block, size)
            .encode_into(buf.as_mut_slice(), slot * DIR_ENTRY_SIZE)
            .map_err(|err| FatError::corruption(block.0, err.to_string()))?;
    }
    dev.write_block(block, buf.as_slice())?;
    debug!(target: "flatfat::dir", event = "root_init", block = block.0);

    Ok(DirEntry::directory(EntryName::default(), block, size))
}

fn check_root(root: &DirEntry) -> Result<()> {
    if !root.is_directory {
        return Err(FatError::corruption(
            root.first_block.0,
            "root entry is not a directory",
        ));
    }
    if root.size as usize % DIR_ENTRY_SIZE != 0 {
        return Err(FatError::corruption(
            root.first_block.0,
            format!("root size {} is not a whole number of entries", root.size),
        ));
    }
    Ok(())
}

/// Walk every record of the root directory in on-disk order.
///
/// `visit` returns `true` to stop the walk early.
fn scan<F>(
    dev: &dyn BlockDevice,
    table: &AllocationTable,
    root: &DirEntry,
    mut visit: F,
) -> Result<()>
where
    F: FnMut(EntrySlot) -> bool,
{
    check_root(root)?;
    let block_size = dev.block_size().as_usize();
    let mut remaining = root.size as usize;

    for block in table.chain(root.first_block) {
        if remaining == 0 {
            break;
        }
        let block = block?;
        let buf = dev.read_block(block)?;
        let in_block = remaining.min(block_size);
        for offset in (0..in_block).step_by(DIR_ENTRY_SIZE) {
            let entry = DirEntry::decode_at(buf.as_slice(), offset)
                .map_err(|err| FatError::corruption(block.0, format!("entry at {offset}: {err}")))?;
            if visit(EntrySlot {
                block,
                offset,
                entry,
            }) {
                return Ok(());
            }
        }
        remaining -= in_block;
    }

    if remaining > 0 {
        return Err(FatError::corruption(
            root.first_block.0,
            format!("directory chain ends with {remaining} bytes of entries unaccounted for"),
        ));
    }
    Ok(())
}

/// Find the first file record whose stored name equals `name`.
pub fn find(
    dev: &dyn BlockDevice,
    table: &AllocationTable,
    root: &DirEntry,
    name: &EntryName,
) -> Result<Option<EntrySlot>> {
    let mut found = None;
    scan(dev, table, root, |slot| {
        if !slot.entry.is_dot_entry() && slot.entry.name == *name {
            found = Some(slot);
            return true;
        }
        false
    })?;
    trace!(
        target: "flatfat::dir",
        event = "dir_find",
        name = %name,
        hit = found.is_some()
    );
    Ok(found)
}

/// All file records in directory order.
pub fn list(
    dev: &dyn BlockDevice,
    table: &AllocationTable,
    root: &DirEntry,
) -> Result<Vec<DirEntry>> {
    let mut entries = Vec::new();
    scan(dev, table, root, |slot| {
        if !slot.entry.is_dot_entry() {
            entries.push(slot.entry);
        }
        false
    })?;
    Ok(entries)
}

/// Append `entry` to the end of the root entry list.
///
/// When the last directory block is exactly full a new block is
/// allocated and linked. Grows `root.size` by one record. The caller
/// flushes the updated root and table.
pub fn append_entry(
    dev: &dyn BlockDevice,
    table: &mut AllocationTable,
    root: &mut DirEntry,
    entry: &DirEntry,
) -> Result<EntrySlot> {
    check_root(root)?;
    let block_size = dev.block_size().as_usize();
    let new_size = root
        .size
        .checked_add(RECORD_LEN)
        .ok_or(FatError::NoSpace)?;

    let mut last = root.first_block;
    let mut blocks = 0_usize;
    for block in table.chain(root.first_block) {
        last = block?;
        blocks += 1;
    }

    let used_in_last = (root.size as usize)
        .checked_sub((blocks - 1) * block_size)
        .filter(|used| *used <= block_size)
        .ok_or_else(|| {
            FatError::corruption(
                last.0,
                format!(
                    "directory of {} bytes does not match a chain of {blocks} blocks",
                    root.size
                ),
            )
        })?;

    let (block, offset, mut buf) = if used_in_last == block_size {
        let fresh = table.allocate_block()?;
        table.link(last, fresh)?;
        debug!(
            target: "flatfat::dir",
            event = "dir_grow",
            block = fresh.0,
            prev = last.0
        );
        (fresh, 0, BlockBuf::zeroed(dev.block_size()))
    } else {
        (last, used_in_last, dev.read_block(last)?)
    };

    entry
        .encode_into(buf.as_mut_slice(), offset)
        .map_err(|err| FatError::corruption(block.0, err.to_string()))?;
    dev.write_block(block, buf.as_slice())?;
    root.size = new_size;

    trace!(
        target: "flatfat::dir",
        event = "dir_append",
        name = %entry.name,
        block = block.0,
        offset
    );
    Ok(EntrySlot {
        block,
        offset,
        entry: *entry,
    })
}

/// Rewrite the record at `slot` with `slot.entry`.
pub fn rewrite_entry(dev: &dyn BlockDevice, slot: &EntrySlot) -> Result<()> {
    let mut buf = dev.read_block(slot.block)?;
    slot.entry
        .encode_into(buf.as_mut_slice(), slot.offset)
        .map_err(|err| FatError::corruption(slot.block.0, err.to_string()))?;
    dev.write_block(slot.block, buf.as_slice())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flatfat_block::{ByteBlockDevice, MemByteDevice};
    use flatfat_types::BlockSize;

    /// Two records per block, so directories chain quickly.
    fn small_dev(blocks: u32) -> (ByteBlockDevice<MemByteDevice>, AllocationTable) {
        let bs = BlockSize::new(64).unwrap();
        let mem = MemByteDevice::new(u64::from(blocks) * 64).unwrap();
        let dev = ByteBlockDevice::new(mem, bs, 0, blocks).unwrap();
        (dev, AllocationTable::new(blocks))
    }

    fn add_file(
        dev: &dyn BlockDevice,
        table: &mut AllocationTable,
        root: &mut DirEntry,
        name: &str,
    ) -> EntrySlot {
        let data = table.allocate_block().unwrap();
        let entry = DirEntry::file(EntryName::from_path(name), data);
        append_entry(dev, table, root, &entry).unwrap()
    }

    #[test]
    fn init_root_writes_dot_entries() {
        let (dev, mut table) = small_dev(4);
        let root = init_root(&dev, &mut table).unwrap();
        assert!(root.is_directory);
        assert_eq!(root.first_block, BlockNumber(0));
        assert_eq!(root.size, 64);
        assert!(table.is_used(BlockNumber(0)));

        let buf = dev.read_block(BlockNumber(0)).unwrap();
        let dot = DirEntry::decode_at(buf.as_slice(), 0).unwrap();
        let dotdot = DirEntry::decode_at(buf.as_slice(), 32).unwrap();
        assert_eq!(dot.name, EntryName::DOT);
        assert_eq!(dotdot.name, EntryName::DOT_DOT);
        assert!(dot.is_dot_entry() && dotdot.is_dot_entry());
    }

    #[test]
    fn find_skips_dot_entries() {
        let (dev, mut table) = small_dev(4);
        let root = init_root(&dev, &mut table).unwrap();
        assert_eq!(find(&dev, &table, &root, &EntryName::DOT).unwrap(), None);
        assert_eq!(find(&dev, &table, &root, &EntryName::DOT_DOT).unwrap(), None);
        assert!(list(&dev, &table, &root).unwrap().is_empty());
    }

    #[test]
    fn append_grows_the_directory_chain() {
        let (dev, mut table) = small_dev(16);
        let mut root = init_root(&dev, &mut table).unwrap();

        // Block 0 is full with `.`/`..`; every second file needs a new block.
        let a = add_file(&dev, &mut table, &mut root, "a");
        assert_eq!(a.offset, 0);
        assert_ne!(a.block, root.first_block);
        let b = add_file(&dev, &mut table, &mut root, "b");
        assert_eq!((b.block, b.offset), (a.block, 32));
        let c = add_file(&dev, &mut table, &mut root, "c");
        assert_eq!(c.offset, 0);
        assert_ne!(c.block, a.block);
        assert_eq!(root.size, 5 * 32);

        let chain: Vec<BlockNumber> = table
            .chain(root.first_block)
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(chain, vec![root.first_block, a.block, c.block]);

        for name in ["a", "b", "c"] {
            let slot = find(&dev, &table, &root, &EntryName::from_path(name))
                .unwrap()
                .expect("entry present");
            assert_eq!(slot.entry.name, EntryName::from_path(name));
            assert_eq!(slot.entry.size, 0);
        }
        let names: Vec<String> = list(&dev, &table, &root)
            .unwrap()
            .iter()
            .map(|entry| entry.name.to_string())
            .collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[test]
    fn append_fills_partial_block_in_place() {
        let bs = BlockSize::new(4096).unwrap();
        let mem = MemByteDevice::new(4 * 4096).unwrap();
        let dev = ByteBlockDevice::new(mem, bs, 0, 4).unwrap();
        let mut table = AllocationTable::new(4);
        let mut root = init_root(&dev, &mut table).unwrap();

        let slot = add_file(&dev, &mut table, &mut root, "notes");
        assert_eq!((slot.block, slot.offset), (root.first_block, 64));
        assert_eq!(root.size, 96);
        assert_eq!(table.next(root.first_block).unwrap(), None);
    }

    #[test]
    fn rewrite_entry_updates_size_in_place() {
        let (dev, mut table) = small_dev(8);
        let mut root = init_root(&dev, &mut table).unwrap();
        let mut slot = add_file(&dev, &mut table, &mut root, "log");
        add_file(&dev, &mut table, &mut root, "other");

        slot.entry.size = 1234;
        rewrite_entry(&dev, &slot).unwrap();

        let found = find(&dev, &table, &root, &EntryName::from_path("log"))
            .unwrap()
            .unwrap();
        assert_eq!(found.entry.size, 1234);
        let other = find(&dev, &table, &root, &EntryName::from_path("other"))
            .unwrap()
            .unwrap();
        assert_eq!(other.entry.size, 0);
    }

    #[test]
    fn truncated_chain_is_corruption() {
        let (dev, mut table) = small_dev(4);
        let mut root = init_root(&dev, &mut table).unwrap();
        root.size = 4 * 32;
        let err = find(&dev, &table, &root, &EntryName::from_path("x")).unwrap_err();
        assert!(matches!(err, FatError::Corruption { .. }));
    }

    #[test]
    fn find_returns_first_match_on_truncated_names() {
        let (dev, mut table) = small_dev(8);
        let mut root = init_root(&dev, &mut table).unwrap();
        let first = add_file(&dev, &mut table, &mut root, "abcdefghX");
        let slot = find(&dev, &table, &root, &EntryName::from_path("abcdefghY"))
            .unwrap()
            .unwrap();
        assert_eq!(slot, first);
    }

    #[test]
    fn validate_name_rejects_reserved_and_empty() {
        assert!(validate_name("").is_err());
        assert!(validate_name(".").is_err());
        assert!(validate_name("..").is_err());
        assert_eq!(validate_name("report.txt").unwrap(), EntryName::from_path("report.t"));
    }
}
