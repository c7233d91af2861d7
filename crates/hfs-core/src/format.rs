//! Writing an empty volume onto a partition.

use crate::options::FormatOptions;
use crate::path::validate_name;
use crate::volume::{TreeKind, TreeStore, VolumeState, place_run};
use hfs_alloc::VolumeBitmap;
use hfs_block::BlockDevice;
use hfs_btree::BTree;
use hfs_error::{HfsError, Result};
use hfs_ondisk::{
    CatalogKey, CatalogOrder, CatalogRecord, DirFinderInfo, DirRecord, ExtentsKey, ExtentsOrder,
    MasterDirectoryBlock, ThreadRecord, extent_record_bytes,
};
use hfs_types::{
    ATTR_SPARED_BAD, ATTR_UNMOUNTED, BITS_PER_BITMAP_BLOCK, BlockNumber, Cnid, DEFAULT_BITMAP_START,
    Extent, ExtentRecord, ForkKind, LOGICAL_BLOCK_SIZE, MAX_VOLUME_NAME_LEN, MDB_BLOCK, MacTime,
    display_name,
};
use std::collections::BTreeSet;
use tracing::{debug, info};

/// Smallest partition accepted, in 512-byte blocks (400 KiB).
pub const MIN_FORMAT_BLOCKS: u64 = 800;

/// Blocks outside the allocation area besides the bitmap: two boot blocks,
/// the MDB, the alternate MDB and the final block.
const RESERVED_BLOCKS: u64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Geometry {
    alloc_block_size: u32,
    alloc_blocks: u16,
    bitmap_sectors: u16,
    first_alloc_block: u16,
}

/// Smallest allocation block size (a multiple of 512) that keeps the block
/// count within 16 bits.
fn plan_geometry(total: u64) -> Result<Geometry> {
    let usable = total - RESERVED_BLOCKS;
    let mut alloc_block_size = LOGICAL_BLOCK_SIZE as u32;
    loop {
        let per = u64::from(alloc_block_size) / LOGICAL_BLOCK_SIZE as u64;
        let bitmap = (usable / per).div_ceil(u64::from(BITS_PER_BITMAP_BLOCK));
        let blocks = (usable - bitmap) / per;
        if let Ok(alloc_blocks) = u16::try_from(blocks) {
            let bitmap_sectors = u16::try_from(bitmap)
                .map_err(|_| HfsError::InvalidArgument("bitmap too large".to_owned()))?;
            return Ok(Geometry {
                alloc_block_size,
                alloc_blocks,
                bitmap_sectors,
                first_alloc_block: DEFAULT_BITMAP_START + bitmap_sectors,
            });
        }
        alloc_block_size = alloc_block_size
            .checked_add(LOGICAL_BLOCK_SIZE as u32)
            .ok_or_else(|| HfsError::InvalidArgument("partition too large".to_owned()))?;
    }
}

/// Group sorted allocation block numbers into extents.
fn runs_of(blocks: &BTreeSet<u16>) -> Vec<Extent> {
    let mut runs: Vec<Extent> = Vec::new();
    for &b in blocks {
        match runs.last_mut() {
            Some(last) if last.end() == u32::from(b) => last.count += 1,
            _ => runs.push(Extent::new(b, 1)),
        }
    }
    runs
}

fn bad_alloc_blocks(geo: &Geometry, bad: &[u64]) -> Result<BTreeSet<u16>> {
    let per = u64::from(geo.alloc_block_size) / LOGICAL_BLOCK_SIZE as u64;
    let first = u64::from(geo.first_alloc_block);
    let end = first + u64::from(geo.alloc_blocks) * per;
    let mut out = BTreeSet::new();
    for &block in bad {
        if block < first {
            return Err(HfsError::InvalidArgument(format!(
                "bad block {block} lies in the volume header or bitmap"
            )));
        }
        if block >= end {
            continue;
        }
        out.insert(u16::try_from((block - first) / per).unwrap_or(u16::MAX));
    }
    Ok(out)
}

/// Allocate an initial tree file of `blocks` allocation blocks.
fn allocate_tree_file(bitmap: &mut VolumeBitmap, blocks: u32) -> Result<ExtentRecord> {
    let mut slots = [Extent::EMPTY; 3];
    for run in bitmap.allocate(blocks, None)? {
        if !place_run(&mut slots, run) {
            return Err(HfsError::InvalidArgument(
                "bad blocks fragment the tree files beyond three extents".to_owned(),
            ));
        }
    }
    Ok(slots)
}

/// Write an empty HFS volume over the whole of `dev`.
pub fn format_device(dev: &dyn BlockDevice, options: &FormatOptions) -> Result<()> {
    validate_name(&options.volume_name, MAX_VOLUME_NAME_LEN)?;
    if !dev.is_writable() {
        return Err(HfsError::ReadOnly);
    }
    let total = dev.block_count();
    if total < MIN_FORMAT_BLOCKS {
        return Err(HfsError::InvalidArgument(format!(
            "partition of {total} blocks is below the {MIN_FORMAT_BLOCKS}-block minimum"
        )));
    }

    let geo = plan_geometry(total)?;
    let mut bitmap = VolumeBitmap::new(u32::from(geo.alloc_blocks));
    let bad = runs_of(&bad_alloc_blocks(&geo, &options.bad_blocks)?);
    for ext in &bad {
        bitmap.mark_used(*ext)?;
    }

    let tree_blocks = (u32::from(geo.alloc_blocks) / 128).max(4);
    let tree_bytes = tree_blocks * geo.alloc_block_size;
    let extents_extents = allocate_tree_file(&mut bitmap, tree_blocks)?;
    let catalog_extents = allocate_tree_file(&mut bitmap, tree_blocks)?;

    let now = MacTime::now();
    let mdb = MasterDirectoryBlock {
        created: now,
        modified: now,
        backup: MacTime(0),
        backup_seq: 0,
        write_count: 0,
        attributes: ATTR_UNMOUNTED | if bad.is_empty() { 0 } else { ATTR_SPARED_BAD },
        volume_name: options.volume_name.clone(),
        bitmap_start: DEFAULT_BITMAP_START,
        alloc_ptr: 0,
        alloc_blocks: geo.alloc_blocks,
        alloc_block_size: geo.alloc_block_size,
        clump_size: 4 * geo.alloc_block_size,
        first_alloc_block: geo.first_alloc_block,
        free_blocks: 0,
        next_cnid: Cnid::FIRST_USER.0,
        root_files: 0,
        root_dirs: 0,
        file_count: 0,
        dir_count: 0,
        finder_info: [0; 8],
        vcb_cache_size: 0,
        bitmap_cache_size: 0,
        common_cache_size: 0,
        extents_clump: tree_bytes,
        extents_file_size: tree_bytes,
        extents_extents,
        catalog_clump: tree_bytes,
        catalog_file_size: tree_bytes,
        catalog_extents,
    };
    let mut state = VolumeState {
        mdb,
        mdb_dirty: true,
        bitmap,
    };

    let zeros = vec![0_u8; LOGICAL_BLOCK_SIZE];
    for block in 0..MDB_BLOCK {
        dev.write_block(BlockNumber(block), &zeros)?;
    }

    let mut ext_store = TreeStore {
        dev,
        state: &mut state,
        kind: TreeKind::Extents,
    };
    let mut extents = BTree::<ExtentsOrder>::create(&mut ext_store)?;
    let mut fabn = 0_u16;
    for chunk in bad.chunks(3) {
        let mut rec = [Extent::EMPTY; 3];
        for (slot, ext) in rec.iter_mut().zip(chunk) {
            *slot = *ext;
        }
        let key = ExtentsKey::new(Cnid::BAD_BLOCKS, ForkKind::Data, fabn);
        extents.insert(&mut ext_store, &key.to_bytes(), &extent_record_bytes(&rec))?;
        fabn += chunk.iter().map(|e| e.count).sum::<u16>();
    }

    let mut cat_store = TreeStore {
        dev,
        state: &mut state,
        kind: TreeKind::Catalog,
    };
    let mut catalog = BTree::<CatalogOrder>::create(&mut cat_store)?;
    let root = CatalogRecord::Directory(DirRecord {
        flags: 0,
        valence: 0,
        id: Cnid::ROOT_DIR,
        created: now,
        modified: now,
        backup: MacTime(0),
        finder: DirFinderInfo::default(),
        ext_finder: [0; 16],
    });
    let root_key = CatalogKey::new(Cnid::ROOT_PARENT, &options.volume_name);
    catalog.insert(&mut cat_store, &root_key.to_bytes(), &root.to_bytes())?;
    let thread = CatalogRecord::DirThread(ThreadRecord {
        parent: Cnid::ROOT_PARENT,
        name: options.volume_name.clone(),
    });
    catalog.insert(
        &mut cat_store,
        &CatalogKey::thread(Cnid::ROOT_DIR).to_bytes(),
        &thread.to_bytes(),
    )?;

    state.sync_free();
    let bits = state.bitmap.as_bytes();
    for sector in 0..usize::from(geo.bitmap_sectors) {
        let at = sector * LOGICAL_BLOCK_SIZE;
        dev.write_block(
            BlockNumber(u64::from(DEFAULT_BITMAP_START) + sector as u64),
            &bits[at..at + LOGICAL_BLOCK_SIZE],
        )?;
    }
    let block = state.mdb.to_block();
    dev.write_block(BlockNumber(MDB_BLOCK), &block)?;
    dev.write_block(BlockNumber(total - 2), &block)?;
    dev.sync()?;

    debug!(
        alloc_block_size = geo.alloc_block_size,
        alloc_blocks = geo.alloc_blocks,
        bitmap_sectors = geo.bitmap_sectors,
        tree_blocks,
        bad_runs = bad.len(),
        "format_geometry"
    );
    info!(
        name = %display_name(&options.volume_name),
        blocks = total,
        free_blocks = state.bitmap.free(),
        "volume_formatted"
    );
    Ok(())
}
