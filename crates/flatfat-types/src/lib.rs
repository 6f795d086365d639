#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Reference volume capacity (1 GiB).
pub const DEFAULT_DISK_CAPACITY: u64 = 1024 * 1024 * 1024;
/// Reference block size (4 KiB).
pub const DEFAULT_BLOCK_SIZE: u32 = 4 * 1024;

/// Encoded size of one directory entry record.
pub const DIR_ENTRY_SIZE: usize = 32;
/// Bytes of a name that are stored and compared.
pub const NAME_LEN: usize = 8;

/// On-disk allocation table value marking the end of a chain.
pub const CHAIN_END: i32 = -1;
/// Width of one allocation table slot on disk.
pub const TABLE_ENTRY_SIZE: usize = 4;

pub const MIN_BLOCK_SIZE: u32 = 64;
pub const MAX_BLOCK_SIZE: u32 = 65536;

/// Index of a block in the data region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockNumber(pub u32);

impl BlockNumber {
    /// Decode an on-disk signed link. `CHAIN_END` maps to `None`.
    pub fn from_raw_link(raw: i32) -> Result<Option<Self>, ParseError> {
        if raw == CHAIN_END {
            return Ok(None);
        }
        u32::try_from(raw)
            .map(|value| Some(Self(value)))
            .map_err(|_| ParseError::InvalidField {
                field: "block_link",
                reason: "negative block index",
            })
    }

    /// Encode as an on-disk signed link.
    pub fn to_raw(self) -> Result<i32, ParseError> {
        i32::try_from(self.0).map_err(|_| ParseError::IntegerConversion {
            field: "block_number",
        })
    }

    #[must_use]
    pub fn as_index(self) -> usize {
        self.0 as usize
    }
}

/// Encode an optional link, writing `CHAIN_END` for the terminus.
pub fn encode_link(link: Option<BlockNumber>) -> Result<i32, ParseError> {
    link.map_or(Ok(CHAIN_END), BlockNumber::to_raw)
}

/// Validated block size (power of two in `MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE`).
///
/// The lower bound keeps room for the two reserved directory records in the
/// first root directory block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockSize(u32);

impl BlockSize {
    pub fn new(value: u32) -> Result<Self, ParseError> {
        if !value.is_power_of_two() || !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&value) {
            return Err(ParseError::InvalidField {
                field: "block_size",
                reason: "must be power of two in 64..=65536",
            });
        }
        Ok(Self(value))
    }

    #[must_use]
    pub fn get(self) -> u32 {
        self.0
    }

    #[must_use]
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl Default for BlockSize {
    fn default() -> Self {
        Self(DEFAULT_BLOCK_SIZE)
    }
}

/// Session-scoped handle for an open file.
///
/// Assigned monotonically from zero and never reused while the volume is
/// mounted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FileDescriptor(pub u64);

/// Reference point for `seek`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SeekOrigin {
    Start,
    Current,
    End,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_le_i32(data: &[u8], offset: usize) -> Result<i32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], ParseError> {
    let bytes = ensure_slice(data, offset, N)?;
    let mut out = [0_u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

/// Slice of `bytes` up to the first NUL.
#[must_use]
pub fn trim_nul_padded(bytes: &[u8]) -> &[u8] {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    &bytes[..end]
}

impl fmt::Display for BlockNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for BlockSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for FileDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fd{}", self.0)
    }
}
