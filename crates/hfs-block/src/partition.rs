//! Apple Partition Map reading.
//!
//! Block 0 of a partitioned medium holds the driver descriptor ("ER"); the
//! map entries ("PM") start at block 1, one per block, and the first entry
//! records how many entries the map has. Only selection and counting live
//! here; creating or editing a map is left to external tooling.

use crate::ByteDevice;
use hfs_error::{HfsError, Result};
use hfs_types::{LOGICAL_BLOCK_SIZE, ParseError, read_be_u16, read_be_u32, read_fixed};
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const DDR_SIGNATURE: u16 = 0x4552;
pub const PM_SIGNATURE: u16 = 0x504D;
pub const HFS_PARTITION_TYPE: &str = "Apple_HFS";

/// One entry of the partition map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionEntry {
    /// 1-based position in the map.
    pub map_index: u32,
    pub map_block_count: u32,
    pub start: u64,
    pub block_count: u64,
    pub name: String,
    pub kind: String,
}

impl PartitionEntry {
    #[must_use]
    pub fn is_hfs(&self) -> bool {
        self.kind == HFS_PARTITION_TYPE
    }
}

fn c_string(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// Parse one map block. `None` when the block has no "PM" signature.
pub fn parse_partition_entry(
    block: &[u8],
    map_index: u32,
) -> std::result::Result<Option<PartitionEntry>, ParseError> {
    if read_be_u16(block, 0)? != PM_SIGNATURE {
        return Ok(None);
    }
    let name: [u8; 32] = read_fixed(block, 16)?;
    let kind: [u8; 32] = read_fixed(block, 48)?;
    Ok(Some(PartitionEntry {
        map_index,
        map_block_count: read_be_u32(block, 4)?,
        start: u64::from(read_be_u32(block, 8)?),
        block_count: u64::from(read_be_u32(block, 12)?),
        name: c_string(&name),
        kind: c_string(&kind),
    }))
}

fn read_raw_block(dev: &dyn ByteDevice, block: u64) -> Result<Vec<u8>> {
    let mut buf = vec![0_u8; LOGICAL_BLOCK_SIZE];
    dev.read_exact_at(block * LOGICAL_BLOCK_SIZE as u64, &mut buf)?;
    Ok(buf)
}

/// Read every map entry. An unpartitioned medium yields an empty list.
pub fn read_partition_map(dev: &dyn ByteDevice) -> Result<Vec<PartitionEntry>> {
    let total = dev.len_bytes() / LOGICAL_BLOCK_SIZE as u64;
    if total < 2 {
        return Ok(Vec::new());
    }
    let first = read_raw_block(dev, 1)?;
    let parse = |e: ParseError| HfsError::Corruption {
        block: 1,
        detail: e.to_string(),
    };
    let Some(head) = parse_partition_entry(&first, 1).map_err(parse)? else {
        return Ok(Vec::new());
    };

    let map_len = u64::from(head.map_block_count).min(total - 1);
    let mut entries = vec![head];
    for idx in 2..=map_len {
        let raw = read_raw_block(dev, idx)?;
        let map_index = u32::try_from(idx).unwrap_or(u32::MAX);
        let entry = parse_partition_entry(&raw, map_index).map_err(|e| HfsError::Corruption {
            block: idx,
            detail: e.to_string(),
        })?;
        let Some(entry) = entry else {
            return Err(HfsError::Corruption {
                block: idx,
                detail: "partition map entry lacks PM signature".to_owned(),
            });
        };
        entries.push(entry);
    }
    debug!(entries = entries.len(), "partition_map_read");
    Ok(entries)
}

/// Number of `Apple_HFS` partitions on the medium.
pub fn count_partitions(dev: &dyn ByteDevice) -> Result<usize> {
    Ok(read_partition_map(dev)?
        .iter()
        .filter(|e| e.is_hfs())
        .count())
}

/// Resolve a partition number to `(start_block, block_count)`.
///
/// `0` selects the whole medium; `n` selects the n-th `Apple_HFS` partition.
pub fn locate_partition(dev: &dyn ByteDevice, pnum: u32) -> Result<(u64, u64)> {
    let total = dev.len_bytes() / LOGICAL_BLOCK_SIZE as u64;
    if pnum == 0 {
        return Ok((0, total));
    }
    let map = read_partition_map(dev)?;
    if map.is_empty() {
        return Err(HfsError::InvalidArgument(format!(
            "partition {pnum} requested but medium has no partition map"
        )));
    }
    let wanted = usize::try_from(pnum - 1).unwrap_or(usize::MAX);
    let entry = map
        .iter()
        .filter(|e| e.is_hfs())
        .nth(wanted)
        .ok_or_else(|| HfsError::NotFound(format!("HFS partition {pnum}")))?;
    let end = entry.start.checked_add(entry.block_count);
    if end.is_none_or(|end| end > total) {
        return Err(HfsError::Corruption {
            block: u64::from(entry.map_index),
            detail: format!(
                "partition extends past medium: start={} count={} medium_blocks={total}",
                entry.start, entry.block_count
            ),
        });
    }
    Ok((entry.start, entry.block_count))
}
