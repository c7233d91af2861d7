#![forbid(unsafe_code)]
//! On-disk format codecs for classic HFS.
//!
//! Pure parsing crate, no I/O. Decodes and encodes the Master Directory
//! Block, catalog keys and records, extents-overflow keys and extent
//! records, and supplies the two key orderings the B-tree engine is
//! instantiated with.

pub mod catalog;
pub mod extents;
pub mod mdb;

pub use catalog::{
    CATALOG_MAX_KEY_LEN, CatalogKey, CatalogOrder, CatalogRecord, DirFinderInfo, DirRecord,
    FILE_HAS_THREAD, FILE_LOCKED, FileFinderInfo, FileRecord, ForkData, ThreadRecord,
};
pub use extents::{EXTENTS_MAX_KEY_LEN, ExtentsKey, ExtentsOrder};
pub use mdb::{MDB_SIZE, MasterDirectoryBlock};

use hfs_types::{Extent, ExtentRecord, ParseError, put_be_u16, read_be_u16};

/// Size of a three-slot extent record.
pub const EXTENT_RECORD_SIZE: usize = 12;

pub fn parse_extent_record(data: &[u8], offset: usize) -> Result<ExtentRecord, ParseError> {
    let mut rec = [Extent::EMPTY; 3];
    for (i, ext) in rec.iter_mut().enumerate() {
        ext.start = read_be_u16(data, offset + 4 * i)?;
        ext.count = read_be_u16(data, offset + 4 * i + 2)?;
    }
    Ok(rec)
}

pub fn put_extent_record(buf: &mut [u8], offset: usize, rec: &ExtentRecord) {
    for (i, ext) in rec.iter().enumerate() {
        put_be_u16(buf, offset + 4 * i, ext.start);
        put_be_u16(buf, offset + 4 * i + 2, ext.count);
    }
}

#[must_use]
pub fn extent_record_bytes(rec: &ExtentRecord) -> [u8; EXTENT_RECORD_SIZE] {
    let mut buf = [0_u8; EXTENT_RECORD_SIZE];
    put_extent_record(&mut buf, 0, rec);
    buf
}

/// Allocation blocks covered by the used slots of a record.
#[must_use]
pub fn extent_record_blocks(rec: &ExtentRecord) -> u32 {
    rec.iter().map(|e| u32::from(e.count)).sum()
}
