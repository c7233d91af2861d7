#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Logical block size of every HFS medium.
pub const LOGICAL_BLOCK_SIZE: usize = 512;
/// Location of the Master Directory Block.
pub const MDB_BLOCK: u64 = 2;
/// `drSigWord` value ("BD").
pub const HFS_SIGNATURE: u16 = 0x4244;
/// First block of the volume bitmap on every volume written by this engine.
pub const DEFAULT_BITMAP_START: u16 = 3;
/// Number of allocation-block bits held by one logical bitmap block.
pub const BITS_PER_BITMAP_BLOCK: u32 = 4096;
/// B-tree node size for both catalog and extents trees.
pub const BTREE_NODE_SIZE: usize = 512;

pub const MAX_NAME_LEN: usize = 31;
pub const MAX_VOLUME_NAME_LEN: usize = 27;

/// Seconds between 1904-01-01 and 1970-01-01.
pub const MAC_EPOCH_OFFSET: i64 = 2_082_844_800;

/// `drAtrb` bits.
pub const ATTR_HW_LOCKED: u16 = 1 << 7;
pub const ATTR_UNMOUNTED: u16 = 1 << 8;
pub const ATTR_SPARED_BAD: u16 = 1 << 9;
pub const ATTR_SW_LOCKED: u16 = 1 << 15;

/// Logical block number relative to the start of the selected partition.
///
/// This is a unit-carrying wrapper to prevent mixing logical blocks,
/// allocation blocks and B-tree node indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockNumber(pub u64);

impl BlockNumber {
    #[must_use]
    pub fn checked_add(self, blocks: u64) -> Option<Self> {
        self.0.checked_add(blocks).map(Self)
    }
}

/// Catalog Node ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Cnid(pub u32);

impl Cnid {
    pub const NONE: Self = Self(0);
    pub const ROOT_PARENT: Self = Self(1);
    pub const ROOT_DIR: Self = Self(2);
    pub const EXTENTS_FILE: Self = Self(3);
    pub const CATALOG_FILE: Self = Self(4);
    pub const BAD_BLOCKS: Self = Self(5);
    pub const FIRST_USER: Self = Self(16);

    #[must_use]
    pub fn is_reserved(self) -> bool {
        self.0 < Self::FIRST_USER.0
    }
}

/// Fork selector of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ForkKind {
    Data,
    Resource,
}

impl ForkKind {
    /// Fork type byte as stored in extents keys.
    #[must_use]
    pub fn code(self) -> u8 {
        match self {
            Self::Data => 0x00,
            Self::Resource => 0xFF,
        }
    }

    pub fn from_code(code: u8) -> Result<Self, ParseError> {
        match code {
            0x00 => Ok(Self::Data),
            0xFF => Ok(Self::Resource),
            _ => Err(ParseError::InvalidField {
                field: "fork_type",
                reason: "must be 0x00 or 0xFF",
            }),
        }
    }
}

/// A run of allocation blocks. `count == 0` marks an unused slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Extent {
    pub start: u16,
    pub count: u16,
}

impl Extent {
    pub const EMPTY: Self = Self { start: 0, count: 0 };

    #[must_use]
    pub fn new(start: u16, count: u16) -> Self {
        Self { start, count }
    }

    #[must_use]
    pub fn is_empty(self) -> bool {
        self.count == 0
    }

    /// One past the last allocation block of the run.
    #[must_use]
    pub fn end(self) -> u32 {
        u32::from(self.start) + u32::from(self.count)
    }

    #[must_use]
    pub fn overlaps(self, other: Self) -> bool {
        !self.is_empty()
            && !other.is_empty()
            && u32::from(self.start) < other.end()
            && u32::from(other.start) < self.end()
    }
}

/// The three-slot extent record used inline in catalog entries and in
/// extents-overflow leaves.
pub type ExtentRecord = [Extent; 3];

/// Timestamp in seconds since 1904-01-01 00:00:00.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MacTime(pub u32);

impl MacTime {
    #[must_use]
    pub fn now() -> Self {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX));
        Self::from_unix(secs)
    }

    /// Saturates at the representable range (1904..2040).
    #[must_use]
    pub fn from_unix(secs: i64) -> Self {
        let mac = secs.saturating_add(MAC_EPOCH_OFFSET);
        Self(u32::try_from(mac.max(0)).unwrap_or(u32::MAX))
    }

    #[must_use]
    pub fn to_unix(self) -> i64 {
        i64::from(self.0) - MAC_EPOCH_OFFSET
    }
}

impl fmt::Display for BlockNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Cnid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ForkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Data => f.write_str("data"),
            Self::Resource => f.write_str("rsrc"),
        }
    }
}

impl fmt::Display for Extent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}+{}", self.start, self.count)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid magic: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u64, actual: u64 },
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
pub fn read_u8(data: &[u8], offset: usize) -> Result<u8, ParseError> {
    Ok(ensure_slice(data, offset, 1)?[0])
}

#[inline]
pub fn read_be_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_be_i16(data: &[u8], offset: usize) -> Result<i16, ParseError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(i16::from_be_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_be_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], ParseError> {
    let bytes = ensure_slice(data, offset, N)?;
    let mut out = [0_u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

/// Writers index directly: callers serialize into buffers they sized.
#[inline]
pub fn put_be_u16(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
}

#[inline]
pub fn put_be_i16(buf: &mut [u8], offset: usize, value: i16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
}

#[inline]
pub fn put_be_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
}

/// Read a Pascal string whose storage is `1 + max_len` bytes.
pub fn read_pstring(data: &[u8], offset: usize, max_len: usize) -> Result<Vec<u8>, ParseError> {
    let len = usize::from(read_u8(data, offset)?);
    if len > max_len {
        return Err(ParseError::InvalidField {
            field: "pstring_len",
            reason: "length byte exceeds field capacity",
        });
    }
    Ok(ensure_slice(data, offset + 1, len)?.to_vec())
}

/// Write a Pascal string into `1 + max_len` bytes, zero-filling the tail.
///
/// Names longer than `max_len` are truncated; callers validate first.
pub fn put_pstring(buf: &mut [u8], offset: usize, name: &[u8], max_len: usize) {
    let len = name.len().min(max_len);
    buf[offset] = u8::try_from(len).unwrap_or(u8::MAX);
    buf[offset + 1..=offset + len].copy_from_slice(&name[..len]);
    buf[offset + 1 + len..=offset + max_len].fill(0);
}

/// Lossy rendering of an 8-bit HFS name for messages and logs.
#[must_use]
pub fn display_name(name: &[u8]) -> String {
    String::from_utf8_lossy(name).into_owned()
}

#[must_use]
pub fn round_up(value: u64, unit: u64) -> u64 {
    if unit == 0 {
        return value;
    }
    value.div_ceil(unit) * unit
}
