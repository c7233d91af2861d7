//! Fixed-size node codec.
//!
//! A node is a 14-byte descriptor, records packed upward from offset 14, and
//! a table of big-endian `u16` record offsets growing down from the end of
//! the node. Entry `i` of the table (counting from the last two bytes)
//! locates record `i`; the entry after the last record locates free space.

use hfs_error::{HfsError, Result};
use hfs_types::{put_be_u16, put_be_u32, read_be_u16, read_be_u32, read_u8};
use serde::{Deserialize, Serialize};
use tracing::error;

pub const NODE_DESCRIPTOR_SIZE: usize = 14;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeKind {
    Index,
    Header,
    Map,
    Leaf,
}

impl NodeKind {
    #[must_use]
    pub fn code(self) -> u8 {
        match self {
            Self::Index => 0x00,
            Self::Header => 0x01,
            Self::Map => 0x02,
            Self::Leaf => 0xFF,
        }
    }

    #[must_use]
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x00 => Some(Self::Index),
            0x01 => Some(Self::Header),
            0x02 => Some(Self::Map),
            0xFF => Some(Self::Leaf),
            _ => None,
        }
    }
}

/// Decoded node: descriptor fields plus raw record bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub flink: u32,
    pub blink: u32,
    pub kind: NodeKind,
    pub height: u8,
    pub records: Vec<Vec<u8>>,
}

fn corrupt(node: u32, detail: String) -> HfsError {
    HfsError::Corruption {
        block: u64::from(node),
        detail,
    }
}

impl Node {
    #[must_use]
    pub fn new(kind: NodeKind, height: u8) -> Self {
        Self {
            flink: 0,
            blink: 0,
            kind,
            height,
            records: Vec::new(),
        }
    }

    /// Bytes the node occupies when serialized, offset table included.
    #[must_use]
    pub fn used_bytes(&self) -> usize {
        Self::size_of(&self.records)
    }

    #[must_use]
    pub fn size_of(records: &[Vec<u8>]) -> usize {
        NODE_DESCRIPTOR_SIZE + records.iter().map(Vec::len).sum::<usize>() + 2 * (records.len() + 1)
    }

    #[must_use]
    pub fn fits(&self, node_size: usize) -> bool {
        self.used_bytes() <= node_size
    }

    pub fn parse(index: u32, data: &[u8]) -> Result<Self> {
        let node_size = data.len();
        let field = |e: hfs_types::ParseError| corrupt(index, e.to_string());
        let flink = read_be_u32(data, 0).map_err(field)?;
        let blink = read_be_u32(data, 4).map_err(field)?;
        let kind_code = read_u8(data, 8).map_err(field)?;
        let height = read_u8(data, 9).map_err(field)?;
        let count = usize::from(read_be_u16(data, 10).map_err(field)?);

        let Some(kind) = NodeKind::from_code(kind_code) else {
            error!(node = index, kind_code, "btree_invariant_violation");
            return Err(corrupt(index, format!("unknown node kind {kind_code:#04x}")));
        };
        if NODE_DESCRIPTOR_SIZE + 2 * (count + 1) > node_size {
            error!(node = index, count, "btree_invariant_violation");
            return Err(corrupt(
                index,
                format!("record count {count} cannot fit in {node_size}-byte node"),
            ));
        }

        let table_floor = node_size - 2 * (count + 1);
        let mut offsets = Vec::with_capacity(count + 1);
        for i in 0..=count {
            let at = node_size - 2 * (i + 1);
            offsets.push(usize::from(read_be_u16(data, at).map_err(field)?));
        }
        if offsets[0] != NODE_DESCRIPTOR_SIZE {
            error!(node = index, first = offsets[0], "btree_invariant_violation");
            return Err(corrupt(
                index,
                format!("first record offset {} != {NODE_DESCRIPTOR_SIZE}", offsets[0]),
            ));
        }
        if offsets.windows(2).any(|w| w[0] > w[1]) || offsets[count] > table_floor {
            error!(node = index, ?offsets, "btree_invariant_violation");
            return Err(corrupt(index, "record offsets not ascending".to_owned()));
        }

        let records = offsets
            .windows(2)
            .map(|w| data[w[0]..w[1]].to_vec())
            .collect();
        Ok(Self {
            flink,
            blink,
            kind,
            height,
            records,
        })
    }

    pub fn serialize(&self, index: u32, node_size: usize) -> Result<Vec<u8>> {
        if !self.fits(node_size) {
            return Err(corrupt(
                index,
                format!(
                    "node overflow on write: {} bytes > {node_size}",
                    self.used_bytes()
                ),
            ));
        }
        let count = u16::try_from(self.records.len())
            .map_err(|_| corrupt(index, "record count overflow".to_owned()))?;
        let mut buf = vec![0_u8; node_size];
        put_be_u32(&mut buf, 0, self.flink);
        put_be_u32(&mut buf, 4, self.blink);
        buf[8] = self.kind.code();
        buf[9] = self.height;
        put_be_u16(&mut buf, 10, count);

        let mut offset = NODE_DESCRIPTOR_SIZE;
        for (i, rec) in self.records.iter().enumerate() {
            put_be_u16(&mut buf, node_size - 2 * (i + 1), offset_u16(offset));
            buf[offset..offset + rec.len()].copy_from_slice(rec);
            offset += rec.len();
        }
        put_be_u16(
            &mut buf,
            node_size - 2 * (self.records.len() + 1),
            offset_u16(offset),
        );
        Ok(buf)
    }
}

#[expect(clippy::cast_possible_truncation)]
fn offset_u16(offset: usize) -> u16 {
    // Offsets are bounded by the node size, itself at most 512 here.
    offset as u16
}

// ── Record layout ───────────────────────────────────────────────────────────

/// Key body of a record (the bytes after the key-length byte).
pub fn record_key(node: u32, rec: &[u8]) -> Result<&[u8]> {
    let len = usize::from(
        *rec.first()
            .ok_or_else(|| corrupt(node, "empty record".to_owned()))?,
    );
    rec.get(1..=len)
        .ok_or_else(|| corrupt(node, format!("key length {len} exceeds record")))
}

/// Data that follows the key, which is padded to an even offset.
pub fn record_data(node: u32, rec: &[u8]) -> Result<&[u8]> {
    let key_len = record_key(node, rec)?.len();
    let start = (1 + key_len).next_multiple_of(2);
    rec.get(start..)
        .ok_or_else(|| corrupt(node, "record data starts past end".to_owned()))
}

#[must_use]
pub fn leaf_record(key: &[u8], data: &[u8]) -> Vec<u8> {
    let key_end = 1 + key.len();
    let data_start = key_end.next_multiple_of(2);
    let mut rec = vec![0_u8; data_start + data.len()];
    rec[0] = u8::try_from(key.len()).unwrap_or(u8::MAX);
    rec[1..key_end].copy_from_slice(key);
    rec[data_start..].copy_from_slice(data);
    rec
}

/// Index record: key zero-padded to `max_key_len`, then the child pointer.
#[must_use]
pub fn index_record(key: &[u8], child: u32, max_key_len: u8) -> Vec<u8> {
    let max = usize::from(max_key_len);
    let key_end = 1 + max;
    let ptr_at = key_end.next_multiple_of(2);
    let mut rec = vec![0_u8; ptr_at + 4];
    rec[0] = max_key_len;
    let n = key.len().min(max);
    rec[1..=n].copy_from_slice(&key[..n]);
    put_be_u32(&mut rec, ptr_at, child);
    rec
}

pub fn index_child(node: u32, rec: &[u8]) -> Result<u32> {
    let data = record_data(node, rec)?;
    read_be_u32(data, 0).map_err(|e| corrupt(node, format!("index pointer: {e}")))
}
