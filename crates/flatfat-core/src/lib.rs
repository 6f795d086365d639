#![forbid(unsafe_code)]
//! Volume lifecycle and block-chained file I/O.
//!
//! A [`FatVolume`] owns the backing device, the in-memory allocation table,
//! the root directory entry and the open file table. Every mutating
//! operation takes `&mut self`; nothing here is shared across threads.
//!
//! ```ignore
//! let mut vol = FatVolume::format(MemByteDevice::new(len)?, &config)?;
//! vol.create("notes")?;
//! let fd = vol.open("notes")?;
//! vol.write(fd, b"hello")?;
//! vol.seek(fd, 0, SeekOrigin::Start)?;
//! assert_eq!(vol.read(fd, 5)?, b"hello");
//! ```

mod config;
mod open_files;

pub use config::VolumeConfig;
pub use open_files::{OpenFile, OpenFileTable};

pub use flatfat_block::{BlockDevice, ByteDevice, FileByteDevice, MemByteDevice};
pub use flatfat_dir::EntrySlot;
pub use flatfat_error::{FatError, Result};
pub use flatfat_ondisk::{DirEntry, EntryName, VolumeLayout};
pub use flatfat_types::{BlockNumber, BlockSize, FileDescriptor, SeekOrigin};

use flatfat_alloc::AllocationTable;
use flatfat_block::{BlockBuf, ByteBlockDevice};
use flatfat_types::DIR_ENTRY_SIZE;
use std::path::Path;
use tracing::{debug, info, trace, warn};

/// A formatted or mounted volume.
pub struct FatVolume<D: ByteDevice> {
    dev: ByteBlockDevice<D>,
    layout: VolumeLayout,
    table: AllocationTable,
    root: DirEntry,
    files: OpenFileTable,
}

impl<D: ByteDevice> std::fmt::Debug for FatVolume<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FatVolume")
            .field("layout", &self.layout)
            .field("root", &self.root)
            .field("free_blocks", &self.table.free_count())
            .field("open_files", &self.files.len())
            .finish_non_exhaustive()
    }
}

fn attach<D: ByteDevice>(inner: D, layout: &VolumeLayout) -> Result<ByteBlockDevice<D>> {
    ByteBlockDevice::new(
        inner,
        layout.block_size(),
        layout.data_offset(),
        layout.table_size(),
    )
}

impl<D: ByteDevice> FatVolume<D> {
    /// Lay down an empty volume on `inner`.
    ///
    /// The device must already be at least `layout.image_len()` bytes.
    /// Existing contents of the metadata regions are overwritten; data
    /// blocks are left as they are.
    pub fn format(inner: D, config: &VolumeConfig) -> Result<Self> {
        let layout = config.layout()?;
        let dev = attach(inner, &layout)?;
        let mut table = AllocationTable::new(layout.table_size());
        let root = flatfat_dir::init_root(&dev, &mut table)?;

        let vol = Self {
            dev,
            layout,
            table,
            root,
            files: OpenFileTable::new(),
        };
        vol.flush_metadata()?;
        info!(
            target: "flatfat::core",
            event = "format",
            table_size = layout.table_size(),
            block_size = layout.block_size().get(),
            image_len = layout.image_len()
        );
        Ok(vol)
    }

    /// Mount a volume previously formatted with the same `config`.
    pub fn mount(inner: D, config: &VolumeConfig) -> Result<Self> {
        let layout = config.layout()?;
        let dev = attach(inner, &layout)?;
        let table = AllocationTable::load(dev.inner(), &layout)?;

        let mut header = [0_u8; DIR_ENTRY_SIZE];
        dev.inner().read_exact_at(layout.root_offset(), &mut header)?;
        let root = DirEntry::decode(&header)
            .map_err(|err| FatError::corruption(0_u32, format!("root header: {err}")))?;
        if let Err(err) = check_root_header(&root, &layout, &table) {
            warn!(target: "flatfat::core", event = "mount_rejected", error = %err);
            return Err(err);
        }

        let entries = flatfat_dir::list(&dev, &table, &root)?;
        info!(
            target: "flatfat::core",
            event = "mount",
            table_size = layout.table_size(),
            block_size = layout.block_size().get(),
            entries = entries.len(),
            free_blocks = table.free_count()
        );
        Ok(Self {
            dev,
            layout,
            table,
            root,
            files: OpenFileTable::new(),
        })
    }

    /// Create an empty file in the root directory.
    pub fn create(&mut self, path: &str) -> Result<()> {
        let name = flatfat_dir::validate_name(path)?;
        if flatfat_dir::find(&self.dev, &self.table, &self.root, &name)?.is_some() {
            return Err(FatError::AlreadyExists(path.to_owned()));
        }

        let data = self.table.allocate_block()?;
        let entry = DirEntry::file(name, data);
        let slot = flatfat_dir::append_entry(&self.dev, &mut self.table, &mut self.root, &entry)?;
        self.dev
            .write_block(data, BlockBuf::zeroed(self.layout.block_size()).as_slice())?;
        self.flush_metadata()?;

        debug!(
            target: "flatfat::core",
            event = "create",
            name = %name,
            first_block = data.0,
            dir_block = slot.block.0,
            dir_offset = slot.offset
        );
        Ok(())
    }

    /// Open an existing file with its cursor at offset 0.
    pub fn open(&mut self, path: &str) -> Result<FileDescriptor> {
        if self.files.is_open(path) {
            return Err(FatError::AlreadyOpen(path.to_owned()));
        }
        let name = EntryName::from_path(path);
        let slot = flatfat_dir::find(&self.dev, &self.table, &self.root, &name)?
            .ok_or_else(|| FatError::NotFound(path.to_owned()))?;

        let fd = self.files.insert(OpenFile::new(path, slot));
        debug!(
            target: "flatfat::core",
            event = "open",
            fd = fd.0,
            name = %name,
            size = slot.entry.size
        );
        Ok(fd)
    }

    pub fn close(&mut self, fd: FileDescriptor) -> Result<()> {
        let file = self.files.remove(fd)?;
        debug!(target: "flatfat::core", event = "close", fd = fd.0, name = %file.name);
        Ok(())
    }

    /// Move the cursor and return the new absolute offset.
    ///
    /// The target must lie in `0..=size`.
    pub fn seek(&mut self, fd: FileDescriptor, offset: i64, origin: SeekOrigin) -> Result<u32> {
        let block_size = self.layout.block_size().get();
        let file = self.files.get_mut(fd)?;
        let base = match origin {
            SeekOrigin::Start => 0,
            SeekOrigin::Current => i64::from(file.file_pointer),
            SeekOrigin::End => i64::from(file.size),
        };
        let target = base
            .checked_add(offset)
            .ok_or(FatError::InvalidOffset(offset))?;
        let target = u32::try_from(target)
            .ok()
            .filter(|target| *target <= file.size)
            .ok_or(FatError::InvalidOffset(target))?;

        position_cursor(&self.table, file, target, block_size)?;
        trace!(
            target: "flatfat::core",
            event = "seek",
            fd = fd.0,
            offset = target,
            block = file.current_block.0,
            block_offset = file.block_offset
        );
        Ok(target)
    }

    /// Read exactly `n` bytes from the cursor.
    ///
    /// Fails with `PastEndOfFile` instead of returning a short read.
    pub fn read(&mut self, fd: FileDescriptor, n: usize) -> Result<Vec<u8>> {
        let file = self.files.get_mut(fd)?;
        let available = file.remaining();
        let want = u32::try_from(n)
            .ok()
            .filter(|want| *want <= available)
            .ok_or(FatError::PastEndOfFile {
                requested: n,
                available,
            })?;
        read_chunks(&self.dev, &self.table, file, want)
    }

    /// Write `data` at the cursor, growing the file and its chain as needed.
    pub fn write(&mut self, fd: FileDescriptor, data: &[u8]) -> Result<()> {
        let file = self.files.get_mut(fd)?;
        let len = u32::try_from(data.len()).map_err(|_| FatError::FileTooLarge)?;
        file.file_pointer
            .checked_add(len)
            .ok_or(FatError::FileTooLarge)?;
        if data.is_empty() {
            return Ok(());
        }

        let written = write_chunks(&self.dev, &mut self.table, file, data, len);
        let (slot, size) = (file.slot, file.size);
        self.files.share_size(&slot, size);
        let flushed = self.flush_metadata();
        written?;
        flushed
    }

    /// Directory record for `path`.
    pub fn stat(&self, path: &str) -> Result<DirEntry> {
        let name = EntryName::from_path(path);
        flatfat_dir::find(&self.dev, &self.table, &self.root, &name)?
            .map(|slot| slot.entry)
            .ok_or_else(|| FatError::NotFound(path.to_owned()))
    }

    /// Every file in directory order.
    pub fn list(&self) -> Result<Vec<DirEntry>> {
        flatfat_dir::list(&self.dev, &self.table, &self.root)
    }

    /// Current cursor offset of `fd`.
    pub fn tell(&self, fd: FileDescriptor) -> Result<u32> {
        Ok(self.files.get(fd)?.file_pointer)
    }

    #[must_use]
    pub fn free_blocks(&self) -> usize {
        self.table.free_count()
    }

    #[must_use]
    pub fn layout(&self) -> &VolumeLayout {
        &self.layout
    }

    #[must_use]
    pub fn root(&self) -> &DirEntry {
        &self.root
    }

    /// Flush metadata and ask the device to persist everything.
    pub fn sync(&self) -> Result<()> {
        self.flush_metadata()?;
        self.dev.sync()
    }

    /// Unmount, handing back the backing device. Open handles are dropped.
    #[must_use]
    pub fn into_device(self) -> D {
        self.dev.into_inner()
    }

    fn flush_metadata(&self) -> Result<()> {
        self.table.flush(self.dev.inner(), &self.layout, &self.root)
    }
}

impl FatVolume<FileByteDevice> {
    /// Mount the image at `path`, or create and format it when absent.
    pub fn open_path(path: impl AsRef<Path>, config: &VolumeConfig) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            return Self::mount(FileByteDevice::open(path)?, config);
        }
        let layout = config.layout()?;
        let dev = FileByteDevice::create(path, layout.image_len())?;
        info!(
            target: "flatfat::core",
            event = "image_create",
            path = %path.display(),
            len = layout.image_len()
        );
        Self::format(dev, config)
    }
}

fn check_root_header(
    root: &DirEntry,
    layout: &VolumeLayout,
    table: &AllocationTable,
) -> Result<()> {
    let block = root.first_block;
    if !root.is_directory {
        return Err(FatError::corruption(block.0, "root header is not a directory"));
    }
    if !layout.contains(block) {
        return Err(FatError::corruption(
            block.0,
            format!("root block outside table of {} entries", layout.table_size()),
        ));
    }
    if !table.is_used(block) {
        return Err(FatError::corruption(block.0, "root block is not allocated"));
    }
    Ok(())
}

/// Re-walk the chain from `first_block` to place the cursor at `target`.
///
/// When `target` lands exactly on a block boundary at the end of the chain
/// the cursor is parked at `block_offset == block_size` of the last block.
fn position_cursor(
    table: &AllocationTable,
    file: &mut OpenFile,
    target: u32,
    block_size: u32,
) -> Result<()> {
    let mut block = file.first_block;
    let mut remaining = target;
    while remaining >= block_size {
        match table.next(block)? {
            Some(next) => {
                block = next;
                remaining -= block_size;
            }
            None => break,
        }
    }
    if remaining > block_size {
        return Err(FatError::corruption(
            block.0,
            format!("chain ends {remaining} bytes short of offset {target}"),
        ));
    }
    file.current_block = block;
    file.block_offset = remaining;
    file.file_pointer = target;
    Ok(())
}

fn chain_broken(block: BlockNumber, file: &OpenFile) -> FatError {
    FatError::corruption(
        block.0,
        format!(
            "chain of {} ends before its size of {} bytes",
            file.name, file.size
        ),
    )
}

fn read_chunks(
    dev: &dyn BlockDevice,
    table: &AllocationTable,
    file: &mut OpenFile,
    want: u32,
) -> Result<Vec<u8>> {
    let block_size = dev.block_size().get();
    let mut out = Vec::with_capacity(want as usize);
    let mut got = 0_u32;

    while got < want {
        if file.block_offset == block_size {
            let next = table
                .next(file.current_block)?
                .ok_or_else(|| chain_broken(file.current_block, file))?;
            file.current_block = next;
            file.block_offset = 0;
        }

        let buf = dev.read_block(file.current_block)?;
        let start = file.block_offset;
        let take = (want - got).min(block_size - start);
        out.extend_from_slice(&buf.as_slice()[start as usize..(start + take) as usize]);

        got += take;
        file.block_offset += take;
        file.file_pointer += take;
        trace!(
            target: "flatfat::core",
            event = "read_chunk",
            block = file.current_block.0,
            offset = start,
            len = take
        );
    }
    Ok(out)
}

/// Copy `data` (`len` bytes, already checked against the size field) into
/// the chain at the cursor.
fn write_chunks(
    dev: &dyn BlockDevice,
    table: &mut AllocationTable,
    file: &mut OpenFile,
    data: &[u8],
    len: u32,
) -> Result<()> {
    let block_size = dev.block_size();
    let bs = block_size.get();
    let mut written = 0_u32;

    while written < len {
        let mut fresh = false;
        if file.block_offset == bs {
            let next = if let Some(next) = table.next(file.current_block)? {
                next
            } else {
                let block = table.allocate_block()?;
                table.link(file.current_block, block)?;
                fresh = true;
                block
            };
            file.current_block = next;
            file.block_offset = 0;
        }

        let start = file.block_offset;
        let take = (len - written).min(bs - start);
        let mut buf = if fresh || take == bs {
            BlockBuf::zeroed(block_size)
        } else {
            dev.read_block(file.current_block)?
        };
        let (src, dst) = (written as usize, start as usize);
        buf.as_mut_slice()[dst..dst + take as usize]
            .copy_from_slice(&data[src..src + take as usize]);
        dev.write_block(file.current_block, buf.as_slice())?;

        written += take;
        file.block_offset += take;
        file.file_pointer += take;
        trace!(
            target: "flatfat::core",
            event = "write_chunk",
            block = file.current_block.0,
            offset = start,
            len = take,
            fresh
        );

        if file.file_pointer > file.size {
            file.size = file.file_pointer;
            file.slot.entry.size = file.size;
            flatfat_dir::rewrite_entry(dev, &file.slot)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_volume(blocks: u64, block_size: u32) -> FatVolume<MemByteDevice> {
        let config = VolumeConfig::new(blocks * u64::from(block_size), block_size);
        let layout = config.layout().unwrap();
        let mem = MemByteDevice::new(layout.image_len()).unwrap();
        FatVolume::format(mem, &config).unwrap()
    }

    fn image_bytes(vol: &FatVolume<MemByteDevice>) -> Vec<u8> {
        let inner = vol.dev.inner();
        let mut bytes = vec![0_u8; usize::try_from(inner.len_bytes()).unwrap()];
        inner.read_exact_at(0, &mut bytes).unwrap();
        bytes
    }

    #[test]
    fn format_reserves_root_block() {
        let vol = small_volume(8, 512);
        assert_eq!(vol.root().first_block, BlockNumber(0));
        assert!(vol.root().is_directory);
        assert_eq!(vol.root().size, 64);
        assert_eq!(vol.free_blocks(), 7);
        assert!(vol.list().unwrap().is_empty());
    }

    #[test]
    fn format_rejects_short_device() {
        let config = VolumeConfig::new(8 * 512, 512);
        let mem = MemByteDevice::new(1024).unwrap();
        assert!(matches!(
            FatVolume::format(mem, &config),
            Err(FatError::InvalidGeometry(_))
        ));
    }

    #[test]
    fn create_allocates_and_zeroes_data_block() {
        let mut vol = small_volume(8, 512);
        vol.create("a").unwrap();
        let entry = vol.stat("a").unwrap();
        assert_eq!(entry.first_block, BlockNumber(1));
        assert_eq!(entry.size, 0);
        assert!(!entry.is_directory);
        assert_eq!(vol.root().size, 96);
        assert_eq!(vol.free_blocks(), 6);
        let buf = vol.dev.read_block(entry.first_block).unwrap();
        assert!(buf.as_slice().iter().all(|b| *b == 0));
    }

    #[test]
    fn cursor_parks_at_end_of_full_block() {
        let mut vol = small_volume(8, 512);
        vol.create("a").unwrap();
        let fd = vol.open("a").unwrap();
        vol.write(fd, &[7_u8; 512]).unwrap();

        let file = vol.files.get(fd).unwrap();
        assert_eq!(file.current_block, file.first_block);
        assert_eq!(file.block_offset, 512);
        assert_eq!(vol.table.next(file.first_block).unwrap(), None);

        assert_eq!(vol.seek(fd, 512, SeekOrigin::Start).unwrap(), 512);
        let file = vol.files.get(fd).unwrap();
        assert_eq!((file.current_block, file.block_offset), (file.first_block, 512));

        vol.write(fd, &[9_u8; 1]).unwrap();
        let file = vol.files.get(fd).unwrap();
        let second = vol.table.next(file.first_block).unwrap().unwrap();
        assert_eq!(file.current_block, second);
        assert_eq!(file.block_offset, 1);
        assert_eq!(file.size, 513);
    }

    #[test]
    fn seek_walks_into_following_blocks() {
        let mut vol = small_volume(8, 512);
        vol.create("a").unwrap();
        let fd = vol.open("a").unwrap();
        vol.write(fd, &[1_u8; 1500]).unwrap();

        vol.seek(fd, 1024, SeekOrigin::Start).unwrap();
        let file = vol.files.get(fd).unwrap();
        let chain: Vec<BlockNumber> = vol
            .table
            .chain(file.first_block)
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(chain.len(), 3);
        assert_eq!((file.current_block, file.block_offset), (chain[2], 0));
    }

    #[test]
    fn write_failure_still_flushes_linked_blocks() {
        // Root takes block 0, the file's first block is 1, one block remains.
        let mut vol = small_volume(3, 512);
        vol.create("a").unwrap();
        let fd = vol.open("a").unwrap();
        let err = vol.write(fd, &[5_u8; 1600]).unwrap_err();
        assert!(matches!(err, FatError::NoSpace));
        assert_eq!(vol.stat("a").unwrap().size, 1024);

        let config = VolumeConfig::new(3 * 512, 512);
        let mut vol = FatVolume::mount(vol.into_device(), &config).unwrap();
        let fd = vol.open("a").unwrap();
        assert_eq!(vol.read(fd, 1024).unwrap(), vec![5_u8; 1024]);
    }

    #[test]
    fn write_past_u32_size_fails_before_touching_the_image() {
        let mut vol = small_volume(8, 512);
        vol.create("a").unwrap();
        let fd = vol.open("a").unwrap();
        vol.write(fd, b"seed").unwrap();
        {
            let file = vol.files.get_mut(fd).unwrap();
            file.size = u32::MAX - 2;
            file.file_pointer = u32::MAX - 2;
        }

        let before = image_bytes(&vol);
        let free = vol.free_blocks();
        assert!(matches!(vol.write(fd, &[1_u8; 3]), Err(FatError::FileTooLarge)));
        assert_eq!(image_bytes(&vol), before);
        assert_eq!(vol.free_blocks(), free);
        assert_eq!(vol.tell(fd).unwrap(), u32::MAX - 2);
    }

    #[test]
    fn growth_through_one_handle_is_visible_to_another() {
        let mut vol = small_volume(8, 512);
        vol.create("abcdefghX").unwrap();
        let writer = vol.open("abcdefghX").unwrap();
        let reader = vol.open("abcdefghY").unwrap();

        vol.write(writer, &[4_u8; 700]).unwrap();
        assert_eq!(vol.files.get(reader).unwrap().size, 700);
        assert_eq!(vol.read(reader, 700).unwrap(), vec![4_u8; 700]);

        // A shorter write through the second handle must not shrink the record.
        vol.seek(reader, 0, SeekOrigin::Start).unwrap();
        vol.write(reader, &[5_u8; 10]).unwrap();
        assert_eq!(vol.stat("abcdefgh").unwrap().size, 700);
    }

    #[test]
    fn mount_rejects_unallocated_root() {
        let vol = small_volume(4, 512);
        let layout = *vol.layout();
        let mem = vol.into_device();
        mem.write_all_at(layout.bitmap_offset(), &[0]).unwrap();
        assert!(matches!(
            FatVolume::mount(mem, &VolumeConfig::new(4 * 512, 512)),
            Err(FatError::Corruption { block: 0, .. })
        ));
    }

    #[test]
    fn mount_rejects_file_root_header() {
        let vol = small_volume(4, 512);
        let layout = *vol.layout();
        let mem = vol.into_device();
        mem.write_all_at(layout.root_offset(), &[0]).unwrap();
        assert!(matches!(
            FatVolume::mount(mem, &VolumeConfig::new(4 * 512, 512)),
            Err(FatError::Corruption { .. })
        ));
    }
}
