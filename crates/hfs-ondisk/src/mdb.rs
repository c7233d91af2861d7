//! Master Directory Block.

use crate::{parse_extent_record, put_extent_record};
use hfs_types::{
    ATTR_HW_LOCKED, ATTR_SW_LOCKED, ATTR_UNMOUNTED, Cnid, ExtentRecord, HFS_SIGNATURE,
    LOGICAL_BLOCK_SIZE, MAX_VOLUME_NAME_LEN, MacTime, ParseError, put_be_u16, put_be_u32,
    put_pstring, read_be_u16, read_be_u32, read_pstring,
};
use serde::{Deserialize, Serialize};

/// Bytes of the MDB actually used inside its 512-byte block.
pub const MDB_SIZE: usize = 162;

/// Volume header as stored at logical block 2 (and its copy near the end).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterDirectoryBlock {
    // ── Identity & dates ─────────────────────────────────────────────────
    pub created: MacTime,
    pub modified: MacTime,
    pub backup: MacTime,
    pub backup_seq: u16,
    pub write_count: u32,
    pub attributes: u16,
    pub volume_name: Vec<u8>,

    // ── Geometry ─────────────────────────────────────────────────────────
    pub bitmap_start: u16,
    pub alloc_ptr: u16,
    pub alloc_blocks: u16,
    pub alloc_block_size: u32,
    pub clump_size: u32,
    pub first_alloc_block: u16,
    pub free_blocks: u16,

    // ── Catalog bookkeeping ──────────────────────────────────────────────
    pub next_cnid: u32,
    pub root_files: u16,
    pub root_dirs: u16,
    pub file_count: u32,
    pub dir_count: u32,
    pub finder_info: [u32; 8],

    // ── Cache hints (opaque, preserved) ──────────────────────────────────
    pub vcb_cache_size: u16,
    pub bitmap_cache_size: u16,
    pub common_cache_size: u16,

    // ── Tree files ───────────────────────────────────────────────────────
    pub extents_clump: u32,
    pub extents_file_size: u32,
    pub extents_extents: ExtentRecord,
    pub catalog_clump: u32,
    pub catalog_file_size: u32,
    pub catalog_extents: ExtentRecord,
}

impl MasterDirectoryBlock {
    pub fn parse(block: &[u8]) -> Result<Self, ParseError> {
        if block.len() < MDB_SIZE {
            return Err(ParseError::InsufficientData {
                needed: MDB_SIZE,
                offset: 0,
                actual: block.len(),
            });
        }
        let signature = read_be_u16(block, 0)?;
        if signature != HFS_SIGNATURE {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(HFS_SIGNATURE),
                actual: u64::from(signature),
            });
        }

        let alloc_block_size = read_be_u32(block, 20)?;
        if alloc_block_size == 0 || alloc_block_size % LOGICAL_BLOCK_SIZE as u32 != 0 {
            return Err(ParseError::InvalidField {
                field: "drAlBlkSiz",
                reason: "must be a non-zero multiple of 512",
            });
        }
        let volume_name = read_pstring(block, 36, MAX_VOLUME_NAME_LEN)?;
        if volume_name.is_empty() {
            return Err(ParseError::InvalidField {
                field: "drVN",
                reason: "volume name is empty",
            });
        }

        let mut finder_info = [0_u32; 8];
        for (i, word) in finder_info.iter_mut().enumerate() {
            *word = read_be_u32(block, 92 + 4 * i)?;
        }

        Ok(Self {
            created: MacTime(read_be_u32(block, 2)?),
            modified: MacTime(read_be_u32(block, 6)?),
            attributes: read_be_u16(block, 10)?,
            root_files: read_be_u16(block, 12)?,
            bitmap_start: read_be_u16(block, 14)?,
            alloc_ptr: read_be_u16(block, 16)?,
            alloc_blocks: read_be_u16(block, 18)?,
            alloc_block_size,
            clump_size: read_be_u32(block, 24)?,
            first_alloc_block: read_be_u16(block, 28)?,
            next_cnid: read_be_u32(block, 30)?,
            free_blocks: read_be_u16(block, 34)?,
            volume_name,
            backup: MacTime(read_be_u32(block, 64)?),
            backup_seq: read_be_u16(block, 68)?,
            write_count: read_be_u32(block, 70)?,
            extents_clump: read_be_u32(block, 74)?,
            catalog_clump: read_be_u32(block, 78)?,
            root_dirs: read_be_u16(block, 82)?,
            file_count: read_be_u32(block, 84)?,
            dir_count: read_be_u32(block, 88)?,
            finder_info,
            vcb_cache_size: read_be_u16(block, 124)?,
            bitmap_cache_size: read_be_u16(block, 126)?,
            common_cache_size: read_be_u16(block, 128)?,
            extents_file_size: read_be_u32(block, 130)?,
            extents_extents: parse_extent_record(block, 134)?,
            catalog_file_size: read_be_u32(block, 146)?,
            catalog_extents: parse_extent_record(block, 150)?,
        })
    }

    /// Overwrite the MDB fields of `block`, leaving bytes past them intact.
    pub fn write_into(&self, block: &mut [u8]) {
        put_be_u16(block, 0, HFS_SIGNATURE);
        put_be_u32(block, 2, self.created.0);
        put_be_u32(block, 6, self.modified.0);
        put_be_u16(block, 10, self.attributes);
        put_be_u16(block, 12, self.root_files);
        put_be_u16(block, 14, self.bitmap_start);
        put_be_u16(block, 16, self.alloc_ptr);
        put_be_u16(block, 18, self.alloc_blocks);
        put_be_u32(block, 20, self.alloc_block_size);
        put_be_u32(block, 24, self.clump_size);
        put_be_u16(block, 28, self.first_alloc_block);
        put_be_u32(block, 30, self.next_cnid);
        put_be_u16(block, 34, self.free_blocks);
        put_pstring(block, 36, &self.volume_name, MAX_VOLUME_NAME_LEN);
        put_be_u32(block, 64, self.backup.0);
        put_be_u16(block, 68, self.backup_seq);
        put_be_u32(block, 70, self.write_count);
        put_be_u32(block, 74, self.extents_clump);
        put_be_u32(block, 78, self.catalog_clump);
        put_be_u16(block, 82, self.root_dirs);
        put_be_u32(block, 84, self.file_count);
        put_be_u32(block, 88, self.dir_count);
        for (i, word) in self.finder_info.iter().enumerate() {
            put_be_u32(block, 92 + 4 * i, *word);
        }
        put_be_u16(block, 124, self.vcb_cache_size);
        put_be_u16(block, 126, self.bitmap_cache_size);
        put_be_u16(block, 128, self.common_cache_size);
        put_be_u32(block, 130, self.extents_file_size);
        put_extent_record(block, 134, &self.extents_extents);
        put_be_u32(block, 146, self.catalog_file_size);
        put_extent_record(block, 150, &self.catalog_extents);
    }

    #[must_use]
    pub fn to_block(&self) -> Vec<u8> {
        let mut block = vec![0_u8; LOGICAL_BLOCK_SIZE];
        self.write_into(&mut block);
        block
    }

    /// Logical blocks per allocation block.
    #[must_use]
    pub fn sectors_per_alloc_block(&self) -> u64 {
        u64::from(self.alloc_block_size) / LOGICAL_BLOCK_SIZE as u64
    }

    /// First logical block of allocation block `ablock`.
    #[must_use]
    pub fn alloc_block_sector(&self, ablock: u16) -> u64 {
        u64::from(self.first_alloc_block) + u64::from(ablock) * self.sectors_per_alloc_block()
    }

    /// Logical blocks occupied by the volume bitmap.
    #[must_use]
    pub fn bitmap_sectors(&self) -> u64 {
        u64::from(self.alloc_blocks).div_ceil(u64::from(hfs_types::BITS_PER_BITMAP_BLOCK))
    }

    #[must_use]
    pub fn blessed(&self) -> Cnid {
        Cnid(self.finder_info[0])
    }

    pub fn set_blessed(&mut self, dir: Cnid) {
        self.finder_info[0] = dir.0;
    }

    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.attributes & (ATTR_HW_LOCKED | ATTR_SW_LOCKED) != 0
    }

    #[must_use]
    pub fn was_unmounted_cleanly(&self) -> bool {
        self.attributes & ATTR_UNMOUNTED != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hfs_types::Extent;

    fn sample() -> MasterDirectoryBlock {
        MasterDirectoryBlock {
            created: MacTime(0xB000_0000),
            modified: MacTime(0xB000_0010),
            backup: MacTime(0),
            backup_seq: 0,
            write_count: 7,
            attributes: ATTR_UNMOUNTED,
            volume_name: b"Untitled".to_vec(),
            bitmap_start: 3,
            alloc_ptr: 0,
            alloc_blocks: 1594,
            alloc_block_size: 512,
            clump_size: 6144,
            first_alloc_block: 4,
            free_blocks: 1500,
            next_cnid: 16,
            root_files: 0,
            root_dirs: 0,
            file_count: 0,
            dir_count: 0,
            finder_info: [2, 0, 0, 0, 0, 0, 0, 0],
            vcb_cache_size: 0,
            bitmap_cache_size: 0,
            common_cache_size: 0,
            extents_clump: 6144,
            extents_file_size: 6144,
            extents_extents: [Extent::new(0, 12), Extent::EMPTY, Extent::EMPTY],
            catalog_clump: 6144,
            catalog_file_size: 6144,
            catalog_extents: [Extent::new(12, 12), Extent::EMPTY, Extent::EMPTY],
        }
    }

    #[test]
    fn field_offsets_match_layout() {
        let block = sample().to_block();
        assert_eq!(&block[0..2], &[0x42, 0x44]);
        assert_eq!(&block[18..20], &1594_u16.to_be_bytes());
        assert_eq!(block[36], 8);
        assert_eq!(&block[37..45], b"Untitled");
        assert_eq!(&block[134..138], &[0, 0, 0, 12]);
        assert_eq!(&block[150..154], &[0, 12, 0, 12]);
        assert_eq!(MasterDirectoryBlock::parse(&block).expect("parse"), sample());
    }

    #[test]
    fn derived_geometry() {
        let mut mdb = sample();
        mdb.alloc_block_size = 1024;
        assert_eq!(mdb.sectors_per_alloc_block(), 2);
        assert_eq!(mdb.alloc_block_sector(10), 4 + 20);
        assert_eq!(mdb.bitmap_sectors(), 1);
        assert_eq!(mdb.blessed(), Cnid::ROOT_DIR);
        assert!(mdb.was_unmounted_cleanly());
        assert!(!mdb.is_locked());
    }

    #[test]
    fn rejects_bad_signature_and_block_size() {
        let mut block = sample().to_block();
        block[0] = 0xD2;
        assert!(matches!(
            MasterDirectoryBlock::parse(&block),
            Err(ParseError::InvalidMagic { .. })
        ));

        let mut block = sample().to_block();
        put_be_u32(&mut block, 20, 700);
        assert!(matches!(
            MasterDirectoryBlock::parse(&block),
            Err(ParseError::InvalidField { field: "drAlBlkSiz", .. })
        ));
    }

    #[test]
    fn write_into_preserves_trailing_bytes() {
        let mut block = vec![0xAA_u8; 512];
        sample().write_into(&mut block);
        assert_eq!(block[MDB_SIZE], 0xAA);
        assert_eq!(block[511], 0xAA);
    }
}
