//! Directory entry record.
//!
//! | Bytes | Field |
//! |-------|-------|
//! | 0 | is-directory flag (0 or 1) |
//! | 1..9 | name, NUL padded |
//! | 9..13 | first block, i32 LE |
//! | 13..17 | size, u32 LE |
//! | 17..32 | reserved, zero |

use flatfat_types::{
    BlockNumber, DIR_ENTRY_SIZE, NAME_LEN, ParseError, read_fixed, read_le_i32, read_le_u32,
    trim_nul_padded,
};
use serde::{Deserialize, Serialize};
use std::fmt;

const FLAG_OFFSET: usize = 0;
const NAME_OFFSET: usize = 1;
const FIRST_BLOCK_OFFSET: usize = NAME_OFFSET + NAME_LEN;
const SIZE_OFFSET: usize = FIRST_BLOCK_OFFSET + 4;

/// Stored form of a name: the first `NAME_LEN` bytes, NUL padded.
///
/// Two paths that share their first eight bytes produce the same
/// `EntryName`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct EntryName([u8; NAME_LEN]);

impl EntryName {
    pub const DOT: Self = Self(*b".\0\0\0\0\0\0\0");
    pub const DOT_DOT: Self = Self(*b"..\0\0\0\0\0\0");

    /// Truncate `path` to its first `NAME_LEN` bytes.
    #[must_use]
    pub fn from_path(path: &str) -> Self {
        Self::from_bytes(path.as_bytes())
    }

    #[must_use]
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut raw = [0_u8; NAME_LEN];
        let len = bytes.len().min(NAME_LEN);
        raw[..len].copy_from_slice(&bytes[..len]);
        Self(raw)
    }

    /// Name bytes without NUL padding.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        trim_nul_padded(&self.0)
    }

    #[must_use]
    pub fn raw(&self) -> &[u8; NAME_LEN] {
        &self.0
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }

    /// `.` or `..`.
    #[must_use]
    pub fn is_dot(&self) -> bool {
        *self == Self::DOT || *self == Self::DOT_DOT
    }
}

impl PartialEq<str> for EntryName {
    fn eq(&self, other: &str) -> bool {
        *self == Self::from_path(other)
    }
}

impl fmt::Display for EntryName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(self.as_bytes()))
    }
}

impl fmt::Debug for EntryName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntryName({:?})", String::from_utf8_lossy(self.as_bytes()))
    }
}

/// One file or directory record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub is_directory: bool,
    pub name: EntryName,
    pub first_block: BlockNumber,
    /// Content length for files; entry-list length for directories.
    pub size: u32,
}

impl DirEntry {
    #[must_use]
    pub fn file(name: EntryName, first_block: BlockNumber) -> Self {
        Self {
            is_directory: false,
            name,
            first_block,
            size: 0,
        }
    }

    #[must_use]
    pub fn directory(name: EntryName, first_block: BlockNumber, size: u32) -> Self {
        Self {
            is_directory: true,
            name,
            first_block,
            size,
        }
    }

    /// The reserved `.`/`..` records of the root directory.
    #[must_use]
    pub fn is_dot_entry(&self) -> bool {
        self.is_directory && self.name.is_dot()
    }

    /// Decode one record. `data` must be exactly `DIR_ENTRY_SIZE` bytes.
    pub fn decode(data: &[u8]) -> Result<Self, ParseError> {
        if data.len() > DIR_ENTRY_SIZE {
            return Err(ParseError::InvalidField {
                field: "dir_entry",
                reason: "record longer than 32 bytes",
            });
        }
        let record = read_fixed::<DIR_ENTRY_SIZE>(data, 0)?;

        let is_directory = match record[FLAG_OFFSET] {
            0 => false,
            1 => true,
            _ => {
                return Err(ParseError::InvalidField {
                    field: "is_directory",
                    reason: "flag byte must be 0 or 1",
                });
            }
        };
        let name = EntryName(read_fixed::<NAME_LEN>(&record, NAME_OFFSET)?);
        let first_block = BlockNumber::from_raw_link(read_le_i32(&record, FIRST_BLOCK_OFFSET)?)?
            .ok_or(ParseError::InvalidField {
                field: "first_block",
                reason: "entry has no first block",
            })?;
        let size = read_le_u32(&record, SIZE_OFFSET)?;

        Ok(Self {
            is_directory,
            name,
            first_block,
            size,
        })
    }

    /// Decode the record starting at `offset` within a block.
    pub fn decode_at(block: &[u8], offset: usize) -> Result<Self, ParseError> {
        let end = offset
            .checked_add(DIR_ENTRY_SIZE)
            .ok_or(ParseError::InvalidField {
                field: "offset",
                reason: "overflow",
            })?;
        let record = block.get(offset..end).ok_or(ParseError::InsufficientData {
            needed: DIR_ENTRY_SIZE,
            offset,
            actual: block.len().saturating_sub(offset),
        })?;
        Self::decode(record)
    }

    pub fn encode(&self) -> Result<[u8; DIR_ENTRY_SIZE], ParseError> {
        let mut out = [0_u8; DIR_ENTRY_SIZE];
        out[FLAG_OFFSET] = u8::from(self.is_directory);
        out[NAME_OFFSET..FIRST_BLOCK_OFFSET].copy_from_slice(self.name.raw());
        out[FIRST_BLOCK_OFFSET..SIZE_OFFSET].copy_from_slice(&self.first_block.to_raw()?.to_le_bytes());
        out[SIZE_OFFSET..SIZE_OFFSET + 4].copy_from_slice(&self.size.to_le_bytes());
        Ok(out)
    }

    /// Encode into `block` at `offset`.
    pub fn encode_into(&self, block: &mut [u8], offset: usize) -> Result<(), ParseError> {
        let available = block.len().saturating_sub(offset);
        let dst = block
            .get_mut(offset..offset.saturating_add(DIR_ENTRY_SIZE))
            .filter(|dst| dst.len() == DIR_ENTRY_SIZE)
            .ok_or(ParseError::InsufficientData {
                needed: DIR_ENTRY_SIZE,
                offset,
                actual: available,
            })?;
        dst.copy_from_slice(&self.encode()?);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_matches_on_disk_layout() {
        let entry = DirEntry {
            is_directory: false,
            name: EntryName::from_path("new_fil2"),
            first_block: BlockNumber(0x0102_0304),
            size: 0xAABB_CCDD,
        };
        let raw = entry.encode().unwrap();
        assert_eq!(raw[0], 0);
        assert_eq!(&raw[1..9], b"new_fil2");
        assert_eq!(&raw[9..13], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(&raw[13..17], &[0xDD, 0xCC, 0xBB, 0xAA]);
        assert!(raw[17..].iter().all(|b| *b == 0));
        assert_eq!(DirEntry::decode(&raw).unwrap(), entry);
    }

    #[test]
    fn short_names_are_nul_padded() {
        let entry = DirEntry::directory(EntryName::DOT_DOT, BlockNumber(0), 64);
        let raw = entry.encode().unwrap();
        assert_eq!(raw[0], 1);
        assert_eq!(&raw[1..9], b"..\0\0\0\0\0\0");
        let back = DirEntry::decode(&raw).unwrap();
        assert!(back.is_dot_entry());
        assert_eq!(back.name.as_bytes(), b"..");
    }

    #[test]
    fn long_names_truncate_to_eight_bytes() {
        let x = EntryName::from_path("abcdefghX");
        let y = EntryName::from_path("abcdefghY");
        assert_eq!(x, y);
        assert_eq!(x.as_bytes(), b"abcdefgh");
        assert!(x == *"abcdefgh");
        assert_ne!(EntryName::from_path("abc"), EntryName::from_path("abcd"));
    }

    #[test]
    fn decode_rejects_malformed_records() {
        let good = DirEntry::file(EntryName::from_path("f"), BlockNumber(3))
            .encode()
            .unwrap();

        assert!(matches!(
            DirEntry::decode(&good[..31]),
            Err(ParseError::InsufficientData { needed: 32, .. })
        ));

        let mut long = good.to_vec();
        long.push(0);
        assert!(DirEntry::decode(&long).is_err());

        let mut bad_flag = good;
        bad_flag[0] = 7;
        assert!(matches!(
            DirEntry::decode(&bad_flag),
            Err(ParseError::InvalidField {
                field: "is_directory",
                ..
            })
        ));

        let mut negative = good;
        negative[9..13].copy_from_slice(&(-1_i32).to_le_bytes());
        assert!(DirEntry::decode(&negative).is_err());
    }

    #[test]
    fn decode_at_and_encode_into_are_bounds_checked() {
        let mut block = vec![0_u8; 64];
        let entry = DirEntry::file(EntryName::from_path("data"), BlockNumber(9));
        entry.encode_into(&mut block, 32).unwrap();
        assert_eq!(DirEntry::decode_at(&block, 32).unwrap(), entry);

        assert!(entry.encode_into(&mut block, 40).is_err());
        assert!(DirEntry::decode_at(&block, 48).is_err());
        assert!(DirEntry::decode_at(&block, usize::MAX).is_err());
    }
}
