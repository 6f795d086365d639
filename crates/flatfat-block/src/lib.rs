#![forbid(unsafe_code)]
//! Backing store I/O.
//!
//! Provides the `ByteDevice` trait for positioned byte I/O over a raw image,
//! a file-backed and an in-memory implementation, and `ByteBlockDevice`, a
//! block-addressed view of the data region that starts at a fixed byte
//! offset inside the image.

use flatfat_error::{FatError, Result};
use flatfat_types::{BlockNumber, BlockSize};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;

/// Owned block buffer.
///
/// Invariant: length == block size of the originating device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockBuf {
    bytes: Vec<u8>,
}

impl BlockBuf {
    /// All-zero block of `block_size` bytes.
    #[must_use]
    pub fn zeroed(block_size: BlockSize) -> Self {
        Self {
            bytes: vec![0_u8; block_size.as_usize()],
        }
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes
    }
}

fn checked_end(offset: u64, len: usize, device_len: u64, op: &str) -> Result<()> {
    let end = u64::try_from(len)
        .ok()
        .and_then(|len| offset.checked_add(len))
        .ok_or_else(|| FatError::Io(io::Error::other(format!("{op} range overflows u64"))))?;
    if end > device_len {
        return Err(FatError::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("{op} out of bounds: offset={offset} len={len} device_len={device_len}"),
        )));
    }
    Ok(())
}

/// Byte-addressed device for fixed-offset I/O (pread/pwrite semantics).
///
/// A transfer either moves every requested byte or fails; a short transfer
/// is an `Io` error.
pub trait ByteDevice {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write all bytes in `buf` to `offset`.
    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

/// File-backed byte device using `pread`/`pwrite` style I/O.
#[derive(Debug)]
pub struct FileByteDevice {
    file: File,
    len: u64,
}

impl FileByteDevice {
    /// Open an existing image for reading and writing.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())?;
        let len = file.metadata()?.len();
        Ok(Self { file, len })
    }

    /// Create (or truncate) an image and size it to `len` bytes.
    ///
    /// The file is extended with `set_len`, so unwritten regions read back
    /// as zeros and stay sparse on filesystems that support it.
    pub fn create(path: impl AsRef<Path>, len: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;
        file.set_len(len)?;
        Ok(Self { file, len })
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        checked_end(offset, buf.len(), self.len, "read")?;
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        checked_end(offset, buf.len(), self.len, "write")?;
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// Fixed-size in-memory byte device.
#[derive(Debug)]
pub struct MemByteDevice {
    bytes: Mutex<Vec<u8>>,
}

impl MemByteDevice {
    /// Zero-filled device of `len` bytes.
    pub fn new(len: u64) -> Result<Self> {
        let len = usize::try_from(len)
            .map_err(|_| FatError::InvalidGeometry(format!("image length {len} exceeds memory")))?;
        Ok(Self {
            bytes: Mutex::new(vec![0_u8; len]),
        })
    }
}

impl ByteDevice for MemByteDevice {
    fn len_bytes(&self) -> u64 {
        self.bytes.lock().len() as u64
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let bytes = self.bytes.lock();
        checked_end(offset, buf.len(), bytes.len() as u64, "read")?;
        let start = usize::try_from(offset)
            .map_err(|_| FatError::Io(io::Error::other("offset overflows usize")))?;
        buf.copy_from_slice(&bytes[start..start + buf.len()]);
        drop(bytes);
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let mut bytes = self.bytes.lock();
        checked_end(offset, buf.len(), bytes.len() as u64, "write")?;
        let start = usize::try_from(offset)
            .map_err(|_| FatError::Io(io::Error::other("offset overflows usize")))?;
        bytes[start..start + buf.len()].copy_from_slice(buf);
        drop(bytes);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

/// Block-addressed I/O interface.
pub trait BlockDevice {
    /// Read a block by number.
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf>;

    /// Write a block by number. `data.len()` MUST equal `block_size()`.
    fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()>;

    /// Device block size.
    fn block_size(&self) -> BlockSize;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

/// Block view of the region of a `ByteDevice` that starts at `base_offset`.
///
/// Block `n` lives at `base_offset + n * block_size`. The metadata regions
/// before `base_offset` stay reachable through [`ByteBlockDevice::inner`].
#[derive(Debug)]
pub struct ByteBlockDevice<D: ByteDevice> {
    inner: D,
    block_size: BlockSize,
    base_offset: u64,
    block_count: u32,
}

impl<D: ByteDevice> ByteBlockDevice<D> {
    pub fn new(inner: D, block_size: BlockSize, base_offset: u64, block_count: u32) -> Result<Self> {
        let needed = u64::from(block_count)
            .checked_mul(u64::from(block_size.get()))
            .and_then(|region| region.checked_add(base_offset))
            .ok_or_else(|| FatError::InvalidGeometry("block region overflows u64".to_owned()))?;
        let len = inner.len_bytes();
        if len < needed {
            return Err(FatError::InvalidGeometry(format!(
                "image too short: len_bytes={len} needed={needed}"
            )));
        }
        Ok(Self {
            inner,
            block_size,
            base_offset,
            block_count,
        })
    }

    #[must_use]
    pub fn inner(&self) -> &D {
        &self.inner
    }

    #[must_use]
    pub fn into_inner(self) -> D {
        self.inner
    }

    fn offset_of(&self, block: BlockNumber) -> Result<u64> {
        if block.0 >= self.block_count {
            return Err(FatError::corruption(
                block.0,
                format!("block out of range: block_count={}", self.block_count),
            ));
        }
        Ok(self.base_offset + u64::from(block.0) * u64::from(self.block_size.get()))
    }
}

impl<D: ByteDevice> BlockDevice for ByteBlockDevice<D> {
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf> {
        let offset = self.offset_of(block)?;
        let mut buf = BlockBuf::zeroed(self.block_size);
        self.inner.read_exact_at(offset, buf.as_mut_slice())?;
        Ok(buf)
    }

    fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()> {
        let expected = self.block_size.as_usize();
        if data.len() != expected {
            return Err(FatError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "write_block data size mismatch: got={} expected={expected}",
                    data.len()
                ),
            )));
        }
        let offset = self.offset_of(block)?;
        self.inner.write_all_at(offset, data)
    }

    fn block_size(&self) -> BlockSize {
        self.block_size
    }

    fn sync(&self) -> Result<()> {
        self.inner.sync()
    }
}
