//! Fork I/O for open files.
//!
//! A fork's allocation blocks are its three inline extents followed by any
//! overflow records in the extents tree, keyed by the fork-relative block
//! number where each record starts. Writes grow the fork in clump-sized
//! steps; blocks past the logical end are returned to the bitmap only when
//! the handle is flushed, closed or switched to the other fork.

use crate::VolumeId;
use crate::volume::{Volume, corrupt, parse_failure};
use hfs_error::{HfsError, Result};
use hfs_ondisk::{
    CatalogRecord, ExtentsKey, FileRecord, ForkData, extent_record_bytes, parse_extent_record,
};
use hfs_types::{BlockNumber, Cnid, Extent, ExtentRecord, ForkKind, LOGICAL_BLOCK_SIZE, MacTime};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

const SECTOR: u64 = LOGICAL_BLOCK_SIZE as u64;

/// Reference point for [`crate::VolumeRegistry::seek`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Whence {
    Start,
    Current,
    End,
}

// ── Extent lists ────────────────────────────────────────────────────────────

fn blocks_in(list: &[Extent]) -> u32 {
    list.iter().map(|e| u32::from(e.count)).sum()
}

fn physical_len(list: &[Extent], alloc_block_size: u32) -> u32 {
    blocks_in(list).saturating_mul(alloc_block_size)
}

/// Append a run, merging it into the last extent when contiguous.
fn append_run(list: &mut Vec<Extent>, run: Extent) {
    if let Some(last) = list.last_mut()
        && last.end() == u32::from(run.start)
        && let Some(count) = last.count.checked_add(run.count)
    {
        last.count = count;
        return;
    }
    list.push(run);
}

/// Split a fork's extents after its first `keep` blocks.
fn split_at_blocks(list: &[Extent], keep: u32) -> (Vec<Extent>, Vec<Extent>) {
    let mut kept = Vec::new();
    let mut freed = Vec::new();
    let mut base = 0_u32;
    for ext in list {
        let count = u32::from(ext.count);
        if base >= keep {
            freed.push(*ext);
        } else if base + count > keep {
            let head = u16::try_from(keep - base).unwrap_or(ext.count);
            kept.push(Extent::new(ext.start, head));
            freed.push(Extent::new(ext.start + head, ext.count - head));
        } else {
            kept.push(*ext);
        }
        base += count;
    }
    (kept, freed)
}

fn record_of(list: &[Extent]) -> ExtentRecord {
    let mut rec = [Extent::EMPTY; 3];
    for (slot, ext) in rec.iter_mut().zip(list) {
        *slot = *ext;
    }
    rec
}

/// Every extent of a fork, inline ones first.
pub(crate) fn load_extents(
    vol: &mut Volume,
    cnid: Cnid,
    fork: ForkKind,
    inline: &ExtentRecord,
) -> Result<Vec<Extent>> {
    let mut list: Vec<Extent> = inline.iter().copied().take_while(|e| !e.is_empty()).collect();
    if list.len() < inline.len() {
        return Ok(list);
    }
    let mut fabn = blocks_in(&list);
    while let Ok(start) = u16::try_from(fabn) {
        let key = ExtentsKey::new(cnid, fork, start).to_bytes();
        let (tree, mut store) = vol.extents_parts();
        let Some(data) = tree.search(&mut store, &key)? else {
            break;
        };
        let rec = parse_extent_record(&data, 0).map_err(|err| parse_failure(u64::from(cnid.0), &err))?;
        let used: Vec<Extent> = rec.iter().copied().take_while(|e| !e.is_empty()).collect();
        if used.is_empty() {
            return Err(corrupt(
                u64::from(cnid.0),
                format!("empty overflow extent record for {cnid} {fork} at block {start}"),
            ));
        }
        fabn += blocks_in(&used);
        let full = used.len() == rec.len();
        list.extend(used);
        if !full {
            break;
        }
    }
    Ok(list)
}

fn overflow_records(
    vol: &mut Volume,
    cnid: Cnid,
    fork: ForkKind,
) -> Result<Vec<(u16, ExtentRecord)>> {
    let (tree, mut store) = vol.extents_parts();
    let mut out = Vec::new();
    let mut cursor = tree.seek_ge(&mut store, &ExtentsKey::new(cnid, fork, 0).to_bytes())?;
    while let Some(entry) = cursor {
        let key = ExtentsKey::parse(&entry.key).map_err(|err| parse_failure(u64::from(cnid.0), &err))?;
        if key.file != cnid || key.fork != fork {
            break;
        }
        let rec = parse_extent_record(&entry.data, 0)
            .map_err(|err| parse_failure(u64::from(cnid.0), &err))?;
        out.push((key.start_block, rec));
        cursor = tree.next_after(&mut store, &entry.key)?;
    }
    Ok(out)
}

/// Make the extents tree hold exactly the overflow part of `list`.
///
/// Returns the inline record for the catalog.
pub(crate) fn store_extents(
    vol: &mut Volume,
    cnid: Cnid,
    fork: ForkKind,
    list: &[Extent],
) -> Result<ExtentRecord> {
    let inline = record_of(list);
    let mut wanted: Vec<(u16, ExtentRecord)> = Vec::new();
    let mut fabn = blocks_in(&list[..list.len().min(3)]);
    for chunk in list.get(3..).unwrap_or_default().chunks(3) {
        let start = u16::try_from(fabn).map_err(|_| HfsError::NoSpace)?;
        wanted.push((start, record_of(chunk)));
        fabn += blocks_in(chunk);
    }

    let existing = overflow_records(vol, cnid, fork)?;
    if existing.is_empty() && wanted.is_empty() {
        return Ok(inline);
    }
    let (tree, mut store) = vol.extents_parts();
    for (start, rec) in &wanted {
        let key = ExtentsKey::new(cnid, fork, *start).to_bytes();
        match existing.iter().find(|(s, _)| s == start) {
            Some((_, old)) if old == rec => {}
            Some(_) => tree.update(&mut store, &key, &extent_record_bytes(rec))?,
            None => tree.insert(&mut store, &key, &extent_record_bytes(rec))?,
        }
    }
    for (start, _) in &existing {
        if !wanted.iter().any(|(s, _)| s == start) {
            tree.delete(&mut store, &ExtentsKey::new(cnid, fork, *start).to_bytes())?;
        }
    }
    trace!(cnid = cnid.0, %fork, overflow_records = wanted.len(), "extents_stored");
    Ok(inline)
}

/// Drop both forks' overflow records and free every block of a file whose
/// catalog entry is already gone.
pub(crate) fn release_file_space(vol: &mut Volume, record: &FileRecord) -> Result<()> {
    let mut freed = Vec::new();
    for fork in [ForkKind::Data, ForkKind::Resource] {
        let list = load_extents(vol, record.id, fork, &record.fork(fork).extents)?;
        store_extents(vol, record.id, fork, &[])?;
        freed.extend(list);
    }
    for ext in &freed {
        vol.state.bitmap.mark_free(*ext)?;
    }
    vol.state.sync_free();
    debug!(cnid = record.id.0, freed_blocks = blocks_in(&freed), "file_space_released");
    Ok(())
}

// ── Open files ──────────────────────────────────────────────────────────────

/// State behind a `FileId`.
#[derive(Debug)]
pub(crate) struct OpenFile {
    pub vol: VolumeId,
    pub cnid: Cnid,
    pub record: FileRecord,
    pub fork: ForkKind,
    pub pos: u32,
    /// Extents of `fork`.
    extents: Vec<Extent>,
    /// Forks whose blocks past the logical end still need freeing.
    pending_trim: Vec<ForkKind>,
    dirty: bool,
}

impl OpenFile {
    pub fn open(vol: &mut Volume, vol_id: VolumeId, record: FileRecord) -> Result<Self> {
        let fork = ForkKind::Data;
        let extents = load_extents(vol, record.id, fork, &record.data.extents)?;
        check_coverage(vol, record.id, record.fork(fork), &extents)?;
        Ok(Self {
            vol: vol_id,
            cnid: record.id,
            record,
            fork,
            pos: 0,
            extents,
            pending_trim: Vec::new(),
            dirty: false,
        })
    }

    /// Logical length of the selected fork.
    pub fn len(&self) -> u32 {
        self.record.fork(self.fork).logical_len
    }

    fn check_writable(&self, vol: &Volume) -> Result<()> {
        vol.check_mutable()?;
        if self.record.is_locked() {
            return Err(HfsError::Locked);
        }
        Ok(())
    }

    fn schedule_trim(&mut self, fork: ForkKind) {
        if !self.pending_trim.contains(&fork) {
            self.pending_trim.push(fork);
        }
    }

    fn map_sector(&self, vol: &Volume, sector: u64) -> Result<BlockNumber> {
        let per = vol.state.mdb.sectors_per_alloc_block();
        let fabn = sector / per;
        let within = sector % per;
        let mut base = 0_u64;
        for ext in &self.extents {
            let count = u64::from(ext.count);
            if fabn < base + count {
                let ablock = u16::try_from(u64::from(ext.start) + fabn - base)
                    .map_err(|_| corrupt(u64::from(self.cnid.0), "extent past 65535"))?;
                return Ok(vol.state.sector_of(ablock, within));
            }
            base += count;
        }
        Err(corrupt(
            u64::from(self.cnid.0),
            format!("{} {} has no block for sector {sector}", self.cnid, self.fork),
        ))
    }

    pub fn read(&mut self, vol: &Volume, len: usize) -> Result<Vec<u8>> {
        let avail = self.len().saturating_sub(self.pos);
        let n = u32::try_from(len).unwrap_or(u32::MAX).min(avail);
        let mut out = Vec::with_capacity(n as usize);
        let mut off = u64::from(self.pos);
        let end = off + u64::from(n);
        while off < end {
            let at = (off % SECTOR) as usize;
            let take = (SECTOR - off % SECTOR).min(end - off) as usize;
            let block = vol.read_sector(self.map_sector(vol, off / SECTOR)?)?;
            out.extend_from_slice(&block[at..at + take]);
            off += take as u64;
        }
        self.pos += n;
        Ok(out)
    }

    pub fn write(&mut self, vol: &mut Volume, data: &[u8]) -> Result<usize> {
        self.check_writable(vol)?;
        if data.is_empty() {
            return Ok(0);
        }
        let end = u32::try_from(data.len())
            .ok()
            .and_then(|len| self.pos.checked_add(len))
            .ok_or_else(|| HfsError::InvalidArgument("write past the 4 GiB fork limit".to_owned()))?;
        self.reserve(vol, end)?;

        let mut off = u64::from(self.pos);
        let mut src = data;
        while !src.is_empty() {
            let at = (off % SECTOR) as usize;
            let take = (LOGICAL_BLOCK_SIZE - at).min(src.len());
            let sector = self.map_sector(vol, off / SECTOR)?;
            let mut block = if take == LOGICAL_BLOCK_SIZE {
                vec![0_u8; LOGICAL_BLOCK_SIZE]
            } else {
                vol.read_sector(sector)?
            };
            block[at..at + take].copy_from_slice(&src[..take]);
            vol.write_sector(sector, &block)?;
            src = &src[take..];
            off += take as u64;
        }

        self.pos = end;
        let fork = self.record.fork_mut(self.fork);
        fork.logical_len = fork.logical_len.max(end);
        self.record.modified = MacTime::now();
        self.dirty = true;
        Ok(data.len())
    }

    /// Make sure the fork has blocks for bytes `0..end`.
    fn reserve(&mut self, vol: &mut Volume, end: u32) -> Result<()> {
        let ab = vol.state.mdb.alloc_block_size;
        let needed = end.div_ceil(ab);
        let have = blocks_in(&self.extents);
        if needed <= have {
            return Ok(());
        }
        let short = needed - have;
        let clump = self.clump_blocks(vol);
        let mut want = short.div_ceil(clump).saturating_mul(clump);
        if want > vol.state.bitmap.free() {
            want = short;
        }

        let runs = vol.state.bitmap.allocate(want, self.extents.last().copied())?;
        vol.state.sync_free();
        let before = self.extents.clone();
        let saved = *self.record.fork(self.fork);
        for run in &runs {
            append_run(&mut self.extents, *run);
        }
        if let Err(err) = self.commit_extents(vol) {
            self.extents = before;
            *self.record.fork_mut(self.fork) = saved;
            if let Err(undo) = store_extents(vol, self.cnid, self.fork, &self.extents) {
                warn!(cnid = self.cnid.0, error = %undo, "extent_rollback_failed");
                return Err(err);
            }
            for run in &runs {
                vol.state.bitmap.mark_free(*run)?;
            }
            vol.state.sync_free();
            return Err(err);
        }

        if vol.options.zero_new_blocks {
            for run in &runs {
                vol.zero_extent(*run)?;
            }
        }
        if want > short {
            self.schedule_trim(self.fork);
        }
        debug!(
            cnid = self.cnid.0,
            fork = %self.fork,
            blocks = want,
            runs = runs.len(),
            "fork_extended"
        );
        Ok(())
    }

    fn clump_blocks(&self, vol: &Volume) -> u32 {
        let ab = vol.state.mdb.alloc_block_size;
        let clump = match self.record.clump_size {
            0 => vol.state.mdb.clump_size,
            n => u32::from(n),
        };
        clump.div_ceil(ab).max(1)
    }

    /// Persist the current fork's extents and physical length.
    fn commit_extents(&mut self, vol: &mut Volume) -> Result<()> {
        let inline = store_extents(vol, self.cnid, self.fork, &self.extents)?;
        let ab = vol.state.mdb.alloc_block_size;
        let fork = self.record.fork_mut(self.fork);
        fork.extents = inline;
        fork.physical_len = physical_len(&self.extents, ab);
        fork.start_block = self.extents.first().map_or(0, |e| e.start);
        self.dirty = true;
        self.write_back(vol)
    }

    fn write_back(&mut self, vol: &mut Volume) -> Result<()> {
        let key = vol.key_of(self.cnid)?;
        vol.put_record(&key, &CatalogRecord::File(self.record.clone()))?;
        vol.state.touch();
        self.dirty = false;
        Ok(())
    }

    pub fn seek(&mut self, offset: i64, whence: Whence) -> Result<u32> {
        let base = match whence {
            Whence::Start => 0,
            Whence::Current => i64::from(self.pos),
            Whence::End => i64::from(self.len()),
        };
        let target = base
            .checked_add(offset)
            .filter(|t| (0..=i64::from(self.len())).contains(t))
            .ok_or_else(|| {
                HfsError::InvalidArgument(format!(
                    "seek to {base}{offset:+} outside 0..={}",
                    self.len()
                ))
            })?;
        self.pos = u32::try_from(target).unwrap_or(self.pos);
        Ok(self.pos)
    }

    /// Take over catalog attributes; written back on the next flush.
    pub fn set_attributes(&mut self, ent: &crate::DirEntity) {
        ent.apply_to_file(&mut self.record);
        self.dirty = true;
    }

    /// Shrink the selected fork. Lengths at or past the end are a no-op.
    pub fn truncate(&mut self, vol: &Volume, len: u32) -> Result<()> {
        self.check_writable(vol)?;
        let fork = self.record.fork_mut(self.fork);
        if len >= fork.logical_len {
            return Ok(());
        }
        fork.logical_len = len;
        self.pos = self.pos.min(len);
        self.record.modified = MacTime::now();
        self.dirty = true;
        self.schedule_trim(self.fork);
        Ok(())
    }

    /// Free the blocks of `fork` past its logical end.
    fn trim(&mut self, vol: &mut Volume, fork: ForkKind) -> Result<()> {
        let ab = vol.state.mdb.alloc_block_size;
        let data = *self.record.fork(fork);
        let keep = data.logical_len.div_ceil(ab);
        let list = if fork == self.fork {
            self.extents.clone()
        } else {
            load_extents(vol, self.cnid, fork, &data.extents)?
        };
        let (kept, freed) = split_at_blocks(&list, keep);
        if freed.is_empty() {
            return Ok(());
        }

        let inline = store_extents(vol, self.cnid, fork, &kept)?;
        let entry = self.record.fork_mut(fork);
        entry.extents = inline;
        entry.physical_len = physical_len(&kept, ab);
        entry.start_block = kept.first().map_or(0, |e| e.start);
        if fork == self.fork {
            self.extents.clone_from(&kept);
        }
        self.write_back(vol)?;

        for ext in &freed {
            vol.state.bitmap.mark_free(*ext)?;
        }
        vol.state.sync_free();
        debug!(cnid = self.cnid.0, %fork, freed_blocks = blocks_in(&freed), "fork_trimmed");
        Ok(())
    }

    /// Run pending trims and write the catalog record if it changed.
    pub fn flush(&mut self, vol: &mut Volume) -> Result<()> {
        if !vol.writable || vol.is_poisoned() {
            if self.dirty || !self.pending_trim.is_empty() {
                warn!(
                    cnid = self.cnid.0,
                    poisoned = vol.is_poisoned(),
                    pending_trims = self.pending_trim.len(),
                    "fork_changes_dropped"
                );
            }
            return Ok(());
        }
        while let Some(&fork) = self.pending_trim.first() {
            self.trim(vol, fork)?;
            self.pending_trim.remove(0);
        }
        if self.dirty {
            self.write_back(vol)?;
        }
        Ok(())
    }

    /// Flush, then select `fork` and rewind.
    ///
    /// The selection changes even when the flush fails; that error is
    /// still returned. A fork whose extents cannot be loaded is left with
    /// none, so reads from it fail instead of landing on the old fork.
    pub fn set_fork(&mut self, vol: &mut Volume, fork: ForkKind) -> Result<()> {
        let flushed = self.flush(vol);
        self.fork = fork;
        self.pos = 0;
        self.extents.clear();
        let data = *self.record.fork(fork);
        let extents = load_extents(vol, self.cnid, fork, &data.extents)?;
        check_coverage(vol, self.cnid, &data, &extents)?;
        self.extents = extents;
        flushed
    }

    pub fn close(mut self, vol: &mut Volume) -> Result<()> {
        self.flush(vol)
    }
}

fn check_coverage(vol: &Volume, cnid: Cnid, fork: &ForkData, list: &[Extent]) -> Result<()> {
    let covered = u64::from(blocks_in(list)) * u64::from(vol.state.mdb.alloc_block_size);
    if covered < u64::from(fork.logical_len) {
        return Err(corrupt(
            u64::from(cnid.0),
            format!(
                "{cnid} fork of {} bytes has only {covered} bytes of extents",
                fork.logical_len
            ),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_keeps_prefix_and_frees_tail() {
        let list = [Extent::new(10, 4), Extent::new(30, 6)];
        let (kept, freed) = split_at_blocks(&list, 7);
        assert_eq!(kept, vec![Extent::new(10, 4), Extent::new(30, 3)]);
        assert_eq!(freed, vec![Extent::new(33, 3)]);

        let (kept, freed) = split_at_blocks(&list, 0);
        assert!(kept.is_empty());
        assert_eq!(freed, list.to_vec());

        let (kept, freed) = split_at_blocks(&list, 10);
        assert_eq!(kept, list.to_vec());
        assert!(freed.is_empty());
    }

    #[test]
    fn append_merges_contiguous_runs() {
        let mut list = vec![Extent::new(5, 2)];
        append_run(&mut list, Extent::new(7, 3));
        append_run(&mut list, Extent::new(20, 1));
        assert_eq!(list, vec![Extent::new(5, 5), Extent::new(20, 1)]);
    }

    #[test]
    fn record_of_pads_with_empty_extents() {
        let rec = record_of(&[Extent::new(1, 1)]);
        assert_eq!(rec, [Extent::new(1, 1), Extent::EMPTY, Extent::EMPTY]);
        assert_eq!(physical_len(&[Extent::new(1, 3)], 1024), 3072);
    }
}
