//! Mounted volume state: MDB, bitmap, both B-trees and the tree-file node
//! store that maps tree nodes onto allocation blocks.

use crate::entity::EntryKind;
use crate::options::{MountMode, MountOptions};
use hfs_alloc::VolumeBitmap;
use hfs_block::BlockDevice;
use hfs_btree::{BTree, NODE_SIZE, NodeStore};
use hfs_error::{HfsError, Result};
use hfs_ondisk::{CatalogKey, CatalogOrder, ExtentsOrder, MasterDirectoryBlock};
use hfs_types::{
    ATTR_UNMOUNTED, BlockNumber, Cnid, Extent, ExtentRecord, LOGICAL_BLOCK_SIZE, MDB_BLOCK, MacTime,
    ParseError, display_name,
};
use tracing::{debug, error, info, warn};

pub(crate) fn corrupt(block: u64, detail: impl Into<String>) -> HfsError {
    HfsError::Corruption {
        block,
        detail: detail.into(),
    }
}

pub(crate) fn parse_failure(block: u64, err: &ParseError) -> HfsError {
    corrupt(block, err.to_string())
}

// ── Space bookkeeping ───────────────────────────────────────────────────────

/// The MDB and bitmap, borrowed together by anything that allocates.
#[derive(Debug)]
pub(crate) struct VolumeState {
    pub mdb: MasterDirectoryBlock,
    pub mdb_dirty: bool,
    pub bitmap: VolumeBitmap,
}

impl VolumeState {
    /// Record a mutation: bump the modify date and schedule an MDB write.
    pub fn touch(&mut self) {
        self.mdb.modified = MacTime::now();
        self.mdb_dirty = true;
    }

    /// Mirror the bitmap's free count into the MDB.
    pub fn sync_free(&mut self) {
        self.mdb.free_blocks = u16::try_from(self.bitmap.free()).unwrap_or(u16::MAX);
        self.mdb_dirty = true;
    }

    /// Logical block holding sector `within` of allocation block `ablock`.
    pub fn sector_of(&self, ablock: u16, within: u64) -> BlockNumber {
        BlockNumber(self.mdb.alloc_block_sector(ablock) + within)
    }

    pub fn alloc_block_bytes(&self) -> u64 {
        u64::from(self.mdb.alloc_block_size)
    }
}

// ── Tree files ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TreeKind {
    Extents,
    Catalog,
}

impl TreeKind {
    fn cnid(self) -> Cnid {
        match self {
            Self::Extents => Cnid::EXTENTS_FILE,
            Self::Catalog => Cnid::CATALOG_FILE,
        }
    }
}

/// [`NodeStore`] over one of the two tree files.
///
/// Tree files live entirely in the three extents recorded in the MDB; a
/// growth request that would need a fourth extent fails with `NoSpace`.
pub(crate) struct TreeStore<'a> {
    pub dev: &'a dyn BlockDevice,
    pub state: &'a mut VolumeState,
    pub kind: TreeKind,
}

impl TreeStore<'_> {
    fn file(&self) -> (u32, &ExtentRecord, u32) {
        let m = &self.state.mdb;
        match self.kind {
            TreeKind::Extents => (m.extents_file_size, &m.extents_extents, m.extents_clump),
            TreeKind::Catalog => (m.catalog_file_size, &m.catalog_extents, m.catalog_clump),
        }
    }

    fn file_mut(&mut self) -> (&mut u32, &mut ExtentRecord) {
        let m = &mut self.state.mdb;
        match self.kind {
            TreeKind::Extents => (&mut m.extents_file_size, &mut m.extents_extents),
            TreeKind::Catalog => (&mut m.catalog_file_size, &mut m.catalog_extents),
        }
    }

    fn node_sector(&self, index: u32) -> Result<BlockNumber> {
        let (size, extents, _) = self.file();
        let byte = u64::from(index) * NODE_SIZE as u64;
        if byte >= u64::from(size) {
            return Err(corrupt(
                u64::from(index),
                format!("{:?} node {index} beyond tree file of {size} bytes", self.kind),
            ));
        }
        let ab = self.state.alloc_block_bytes();
        let fabn = byte / ab;
        let within = (byte % ab) / LOGICAL_BLOCK_SIZE as u64;
        let mut base = 0_u64;
        for ext in extents.iter().take_while(|e| !e.is_empty()) {
            let count = u64::from(ext.count);
            if fabn < base + count {
                let ablock = u64::from(ext.start) + (fabn - base);
                let ablock = u16::try_from(ablock)
                    .map_err(|_| corrupt(u64::from(index), "tree extent past 65535"))?;
                return Ok(self.state.sector_of(ablock, within));
            }
            base += count;
        }
        Err(corrupt(
            u64::from(index),
            format!("{:?} tree extents cover fewer blocks than its size", self.kind),
        ))
    }
}

impl NodeStore for TreeStore<'_> {
    fn read_node(&mut self, index: u32) -> Result<Vec<u8>> {
        let sector = self.node_sector(index)?;
        Ok(self.dev.read_block(sector)?.into_inner())
    }

    fn write_node(&mut self, index: u32, data: &[u8]) -> Result<()> {
        let sector = self.node_sector(index)?;
        self.dev.write_block(sector, data)
    }

    fn node_capacity(&self) -> u32 {
        self.file().0 / NODE_SIZE as u32
    }

    fn grow(&mut self, min_nodes: u32) -> Result<u32> {
        let (size, extents, clump) = self.file();
        let have = size / NODE_SIZE as u32;
        if min_nodes <= have {
            return Ok(have);
        }
        let ab = self.state.mdb.alloc_block_size;
        let need_bytes = (min_nodes - have) * NODE_SIZE as u32;
        let mut want = need_bytes.max(clump).div_ceil(ab);
        if want > self.state.bitmap.free() {
            want = need_bytes.div_ceil(ab);
        }
        let last = extents.iter().rev().copied().find(|e| !e.is_empty());
        let mut slots = *extents;

        let runs = self.state.bitmap.allocate(want, last)?;
        for run in &runs {
            if !place_run(&mut slots, *run) {
                for undo in &runs {
                    self.state.bitmap.mark_free(*undo)?;
                }
                warn!(tree = ?self.kind, want, "tree_file_extents_exhausted");
                return Err(HfsError::NoSpace);
            }
        }

        let added = want * ab;
        let (size_ref, ext_ref) = self.file_mut();
        *size_ref += added;
        *ext_ref = slots;
        let new_size = *size_ref;
        self.state.sync_free();
        debug!(
            tree = ?self.kind,
            cnid = self.kind.cnid().0,
            size = new_size,
            "tree_file_grown"
        );
        Ok(new_size / NODE_SIZE as u32)
    }
}

/// Append `run` to an inline extent record, merging with the last used slot
/// when contiguous. Returns false when all three slots are taken.
pub(crate) fn place_run(slots: &mut ExtentRecord, run: Extent) -> bool {
    let used = slots.iter().take_while(|e| !e.is_empty()).count();
    if let Some(last) = used.checked_sub(1).map(|i| &mut slots[i])
        && last.end() == u32::from(run.start)
        && let Some(count) = last.count.checked_add(run.count)
    {
        last.count = count;
        return true;
    }
    if used == slots.len() {
        return false;
    }
    slots[used] = run;
    true
}

// ── Volume ──────────────────────────────────────────────────────────────────

/// One mounted volume.
pub(crate) struct Volume {
    pub dev: Box<dyn BlockDevice>,
    pub state: VolumeState,
    pub catalog: BTree<CatalogOrder>,
    pub extents: BTree<ExtentsOrder>,
    pub writable: bool,
    pub options: MountOptions,
    pub cwd: Cnid,
    poisoned: Option<String>,
}

impl std::fmt::Debug for Volume {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Volume")
            .field("name", &display_name(&self.state.mdb.volume_name))
            .field("writable", &self.writable)
            .field("poisoned", &self.poisoned)
            .finish_non_exhaustive()
    }
}

impl Volume {
    /// Validate the MDB, load the bitmap and open both trees.
    pub fn mount(dev: Box<dyn BlockDevice>, options: &MountOptions) -> Result<Self> {
        let raw = dev.read_block(BlockNumber(MDB_BLOCK))?;
        let mdb = MasterDirectoryBlock::parse(raw.as_slice()).map_err(|err| match err {
            ParseError::InvalidMagic { .. } => HfsError::Format("not an HFS volume".to_owned()),
            other => HfsError::Format(format!("master directory block: {other}")),
        })?;
        check_geometry(&mdb, dev.block_count())?;

        let mut bits = Vec::new();
        for sector in 0..mdb.bitmap_sectors() {
            let block = dev.read_block(BlockNumber(u64::from(mdb.bitmap_start) + sector))?;
            bits.extend_from_slice(block.as_slice());
        }
        let bitmap = VolumeBitmap::from_bytes(bits, u32::from(mdb.alloc_blocks))?;
        if bitmap.free() != u32::from(mdb.free_blocks) {
            warn!(
                mdb_free = mdb.free_blocks,
                bitmap_free = bitmap.free(),
                "free_count_mismatch"
            );
        }

        let writable = negotiate_access(&mdb, dev.as_ref(), options)?;
        let mut state = VolumeState {
            mdb,
            mdb_dirty: false,
            bitmap,
        };
        let extents = BTree::<ExtentsOrder>::open(&mut TreeStore {
            dev: dev.as_ref(),
            state: &mut state,
            kind: TreeKind::Extents,
        })?;
        let catalog = BTree::<CatalogOrder>::open(&mut TreeStore {
            dev: dev.as_ref(),
            state: &mut state,
            kind: TreeKind::Catalog,
        })?;

        let mut vol = Self {
            dev,
            state,
            catalog,
            extents,
            writable,
            options: options.clone(),
            cwd: Cnid::ROOT_DIR,
            poisoned: None,
        };
        if vol.thread(Cnid::ROOT_DIR)?.0 != EntryKind::Directory {
            return Err(corrupt(0, "root directory thread is not a directory thread"));
        }
        if vol.writable {
            // Clear the clean-unmount flag on disk before anything else changes.
            vol.state.mdb.attributes &= !ATTR_UNMOUNTED;
            vol.state.mdb_dirty = true;
            vol.flush()?;
        }
        info!(
            name = %display_name(vol.name()),
            writable = vol.writable,
            alloc_blocks = vol.state.mdb.alloc_blocks,
            free_blocks = vol.state.bitmap.free(),
            "volume_mounted"
        );
        Ok(vol)
    }

    pub fn name(&self) -> &[u8] {
        &self.state.mdb.volume_name
    }

    /// Gate for every mutating call.
    pub fn check_mutable(&self) -> Result<()> {
        if let Some(reason) = &self.poisoned {
            return Err(HfsError::Poisoned(reason.clone()));
        }
        if !self.writable {
            return Err(HfsError::ReadOnly);
        }
        Ok(())
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned.is_some()
    }

    /// Poison the volume when `result` carries a fatal error.
    pub fn settle<T>(&mut self, op: &'static str, result: Result<T>) -> Result<T> {
        if let Err(err) = &result
            && err.is_fatal()
            && self.poisoned.is_none()
        {
            error!(op, error = %err, name = %display_name(self.name()), "volume_poisoned");
            self.poisoned = Some(format!("{op}: {err}"));
        }
        result
    }

    pub fn catalog_parts(&mut self) -> (&mut BTree<CatalogOrder>, TreeStore<'_>) {
        (
            &mut self.catalog,
            TreeStore {
                dev: self.dev.as_ref(),
                state: &mut self.state,
                kind: TreeKind::Catalog,
            },
        )
    }

    pub fn extents_parts(&mut self) -> (&mut BTree<ExtentsOrder>, TreeStore<'_>) {
        (
            &mut self.extents,
            TreeStore {
                dev: self.dev.as_ref(),
                state: &mut self.state,
                kind: TreeKind::Extents,
            },
        )
    }

    /// Hand out the next catalog node ID. Exhaustion is treated as corruption.
    pub fn next_cnid(&mut self) -> Result<Cnid> {
        let id = self.state.mdb.next_cnid;
        if id < Cnid::FIRST_USER.0 {
            return Err(corrupt(MDB_BLOCK, format!("next catalog id {id} is reserved")));
        }
        let Some(next) = id.checked_add(1) else {
            return Err(corrupt(MDB_BLOCK, "catalog node ids exhausted"));
        };
        self.state.mdb.next_cnid = next;
        self.state.mdb_dirty = true;
        Ok(Cnid(id))
    }

    /// Write the dirty bitmap sectors, sync, then write the MDB and sync
    /// again, so the MDB never reaches the medium ahead of the bitmap and
    /// tree nodes it describes.
    ///
    /// Does nothing beyond the device sync when nothing changed since the
    /// last flush; a failed write leaves everything still dirty.
    pub fn flush(&mut self) -> Result<()> {
        if !self.writable {
            return Ok(());
        }
        let start = u64::from(self.state.mdb.bitmap_start);
        let mut dirty = self.state.bitmap.take_dirty().into_iter();
        while let Some((sector, bytes)) = dirty.next() {
            if let Err(err) = self
                .dev
                .write_block(BlockNumber(start + u64::from(sector)), &bytes)
            {
                self.state
                    .bitmap
                    .restore_dirty(std::iter::once(sector).chain(dirty.map(|(s, _)| s)));
                return Err(err);
            }
        }
        if self.state.mdb_dirty {
            self.dev.sync()?;
            self.state.mdb.write_count = self.state.mdb.write_count.wrapping_add(1);
            if let Err(err) = self.write_mdb(BlockNumber(MDB_BLOCK)) {
                self.state.mdb.write_count = self.state.mdb.write_count.wrapping_sub(1);
                return Err(err);
            }
            self.state.mdb_dirty = false;
        }
        self.dev.sync()
    }

    fn write_mdb(&self, at: BlockNumber) -> Result<()> {
        let mut block = self.dev.read_block(at)?.into_inner();
        self.state.mdb.write_into(&mut block);
        self.dev.write_block(at, &block)
    }

    /// Final flush: mark the volume cleanly unmounted and refresh the
    /// alternate MDB.
    ///
    /// The clean flag goes out last. Everything else is synced first, then
    /// the alternate MDB, and only then the primary one.
    pub fn unmount(mut self) -> Result<()> {
        if self.writable && self.poisoned.is_none() {
            self.flush()?;
            self.state.mdb.attributes |= ATTR_UNMOUNTED;
            let alternate = self.dev.block_count().saturating_sub(2);
            if alternate > MDB_BLOCK {
                self.write_mdb(BlockNumber(alternate))?;
            }
            self.state.mdb_dirty = true;
            self.flush()?;
        }
        info!(name = %display_name(self.name()), "volume_unmounted");
        Ok(())
    }

    // ── Data blocks ─────────────────────────────────────────────────────────

    pub fn read_sector(&self, block: BlockNumber) -> Result<Vec<u8>> {
        Ok(self.dev.read_block(block)?.into_inner())
    }

    pub fn write_sector(&self, block: BlockNumber, data: &[u8]) -> Result<()> {
        self.dev.write_block(block, data)
    }

    /// Zero every logical block of `ext`.
    pub fn zero_extent(&self, ext: Extent) -> Result<()> {
        let zeros = vec![0_u8; LOGICAL_BLOCK_SIZE];
        let per = self.state.mdb.sectors_per_alloc_block();
        for i in 0..u64::from(ext.count) * per {
            self.dev
                .write_block(self.state.sector_of(ext.start, i), &zeros)?;
        }
        Ok(())
    }

    /// Catalog key of the directory or file `cnid`, found through its thread.
    pub fn key_of(&mut self, cnid: Cnid) -> Result<CatalogKey> {
        let (_, thread) = self.thread(cnid)?;
        Ok(CatalogKey::new(thread.parent, &thread.name))
    }
}

fn check_geometry(mdb: &MasterDirectoryBlock, blocks: u64) -> Result<()> {
    let bitmap_end = u64::from(mdb.bitmap_start) + mdb.bitmap_sectors();
    if u64::from(mdb.bitmap_start) <= MDB_BLOCK || bitmap_end > u64::from(mdb.first_alloc_block) {
        return Err(HfsError::Format(format!(
            "bitmap at {}..{bitmap_end} overlaps the header or allocation area",
            mdb.bitmap_start
        )));
    }
    let alloc_end = u64::from(mdb.first_alloc_block)
        + u64::from(mdb.alloc_blocks) * mdb.sectors_per_alloc_block();
    if alloc_end > blocks {
        return Err(HfsError::Format(format!(
            "allocation area ends at block {alloc_end}, partition has {blocks}"
        )));
    }
    if mdb.free_blocks > mdb.alloc_blocks {
        return Err(HfsError::Format(format!(
            "{} free of {} allocation blocks",
            mdb.free_blocks, mdb.alloc_blocks
        )));
    }
    Ok(())
}

fn negotiate_access(
    mdb: &MasterDirectoryBlock,
    dev: &dyn BlockDevice,
    options: &MountOptions,
) -> Result<bool> {
    let clean = mdb.was_unmounted_cleanly();
    let can_write = dev.is_writable() && !mdb.is_locked();
    match options.mode {
        MountMode::ReadOnly => Ok(false),
        MountMode::ReadWrite => {
            if !can_write {
                return Err(HfsError::ReadOnly);
            }
            if !clean {
                return Err(HfsError::NeedsCheck(format!(
                    "{} was not cleanly unmounted",
                    display_name(&mdb.volume_name)
                )));
            }
            Ok(true)
        }
        MountMode::Any => {
            if can_write && !clean {
                warn!(
                    name = %display_name(&mdb.volume_name),
                    "volume_not_clean_mounting_read_only"
                );
            }
            Ok(can_write && clean)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn place_run_merges_then_fills_slots() {
        let mut slots = [Extent::new(0, 4), Extent::EMPTY, Extent::EMPTY];
        assert!(place_run(&mut slots, Extent::new(4, 2)));
        assert_eq!(slots[0], Extent::new(0, 6));
        assert!(place_run(&mut slots, Extent::new(10, 1)));
        assert!(place_run(&mut slots, Extent::new(20, 1)));
        assert!(place_run(&mut slots, Extent::new(21, 3)));
        assert_eq!(slots[2], Extent::new(20, 4));
        assert!(!place_run(&mut slots, Extent::new(30, 1)));
    }

    #[test]
    fn place_run_into_empty_record() {
        let mut slots = [Extent::EMPTY; 3];
        assert!(place_run(&mut slots, Extent::new(7, 3)));
        assert_eq!(slots, [Extent::new(7, 3), Extent::EMPTY, Extent::EMPTY]);
    }
}
