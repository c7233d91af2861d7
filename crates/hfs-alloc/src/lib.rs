#![forbid(unsafe_code)]
//! Allocation-block bookkeeping for an HFS volume.
//!
//! ## Design
//!
//! 1. **Bitmap**: raw MSB-first bit manipulation and run search over the
//!    volume bitmap bytes.
//! 2. **VolumeBitmap**: the loaded bitmap plus its free count and the set of
//!    512-byte bitmap sectors that need writing back.
//!
//! Placement policy: grow the fork's last extent in place when the
//! following blocks are free, otherwise take the smallest free run that
//! satisfies the request (lowest address on ties), otherwise take the
//! largest runs until the request is met. A request larger than the total
//! free count fails before any bit changes.

use hfs_error::{HfsError, Result};
use hfs_types::{BITS_PER_BITMAP_BLOCK, Extent, LOGICAL_BLOCK_SIZE};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{debug, error, trace};

// ── Bitmap operations ───────────────────────────────────────────────────────

/// Get bit `idx` (bit 0 is the high bit of byte 0).
#[must_use]
pub fn bitmap_get(bitmap: &[u8], idx: u32) -> bool {
    let byte = (idx / 8) as usize;
    let bit = 0x80_u8 >> (idx % 8);
    bitmap.get(byte).is_some_and(|b| b & bit != 0)
}

pub fn bitmap_set(bitmap: &mut [u8], idx: u32) {
    let byte = (idx / 8) as usize;
    if byte < bitmap.len() {
        bitmap[byte] |= 0x80_u8 >> (idx % 8);
    }
}

pub fn bitmap_clear(bitmap: &mut [u8], idx: u32) {
    let byte = (idx / 8) as usize;
    if byte < bitmap.len() {
        bitmap[byte] &= !(0x80_u8 >> (idx % 8));
    }
}

/// Count free (zero) bits in the first `count` bits of `bitmap`.
#[must_use]
pub fn bitmap_count_free(bitmap: &[u8], count: u32) -> u32 {
    let full_bytes = (count / 8) as usize;
    let mut free = 0_u32;
    for &b in bitmap.iter().take(full_bytes) {
        free += b.count_zeros();
    }
    for idx in (count / 8) * 8..count {
        if !bitmap_get(bitmap, idx) {
            free += 1;
        }
    }
    free
}

/// First free bit at or after `start`, wrapping around to 0.
#[must_use]
pub fn bitmap_find_free(bitmap: &[u8], count: u32, start: u32) -> Option<u32> {
    (start..count)
        .chain(0..start.min(count))
        .find(|&idx| !bitmap_get(bitmap, idx))
}

/// Number of consecutive free bits starting at `start`, capped at `max`.
#[must_use]
pub fn bitmap_free_run_at(bitmap: &[u8], count: u32, start: u32, max: u32) -> u32 {
    let end = start.saturating_add(max).min(count);
    let run = (start..end)
        .take_while(|&idx| !bitmap_get(bitmap, idx))
        .count();
    u32::try_from(run).unwrap_or(u32::MAX)
}

/// Every maximal free run as `(start, len)`, in ascending address order.
#[must_use]
pub fn bitmap_free_runs(bitmap: &[u8], count: u32) -> Vec<(u32, u32)> {
    let mut runs = Vec::new();
    let mut idx = 0_u32;
    while idx < count {
        // Skip fully allocated bytes quickly.
        if idx % 8 == 0 && bitmap.get((idx / 8) as usize) == Some(&0xFF) && idx + 8 <= count {
            idx += 8;
            continue;
        }
        if bitmap_get(bitmap, idx) {
            idx += 1;
            continue;
        }
        let len = bitmap_free_run_at(bitmap, count, idx, count - idx);
        runs.push((idx, len));
        idx += len;
    }
    runs
}

/// Smallest free run of at least `n` bits; ties go to the lowest address.
#[must_use]
pub fn bitmap_best_fit(bitmap: &[u8], count: u32, n: u32) -> Option<(u32, u32)> {
    if n == 0 {
        return None;
    }
    bitmap_free_runs(bitmap, count)
        .into_iter()
        .filter(|&(_, len)| len >= n)
        .min_by_key(|&(start, len)| (len, start))
}

/// Largest free run; ties go to the lowest address.
#[must_use]
pub fn bitmap_largest_run(bitmap: &[u8], count: u32) -> Option<(u32, u32)> {
    bitmap_free_runs(bitmap, count)
        .into_iter()
        .min_by_key(|&(start, len)| (std::cmp::Reverse(len), start))
}

// ── Volume bitmap ───────────────────────────────────────────────────────────

/// Snapshot of allocator counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BitmapStats {
    pub total_blocks: u32,
    pub free_blocks: u32,
    pub dirty_sectors: usize,
}

/// In-memory volume bitmap for `total` allocation blocks.
#[derive(Debug, Clone)]
pub struct VolumeBitmap {
    bits: Vec<u8>,
    total: u32,
    free: u32,
    dirty: BTreeSet<u32>,
}

const SECTOR_BYTES: usize = LOGICAL_BLOCK_SIZE;

fn ext_u16(start: u32, count: u32) -> Result<Extent> {
    let start = u16::try_from(start)
        .map_err(|_| HfsError::InvalidArgument(format!("allocation block {start} out of range")))?;
    let count = u16::try_from(count)
        .map_err(|_| HfsError::InvalidArgument(format!("run length {count} out of range")))?;
    Ok(Extent::new(start, count))
}

impl VolumeBitmap {
    /// All blocks free, storage padded to whole bitmap sectors.
    #[must_use]
    pub fn new(total: u32) -> Self {
        let sectors = total.div_ceil(BITS_PER_BITMAP_BLOCK).max(1) as usize;
        Self {
            bits: vec![0_u8; sectors * SECTOR_BYTES],
            total,
            free: total,
            dirty: BTreeSet::new(),
        }
    }

    /// Adopt bitmap sectors read from disk.
    pub fn from_bytes(mut bits: Vec<u8>, total: u32) -> Result<Self> {
        let sectors = total.div_ceil(BITS_PER_BITMAP_BLOCK).max(1) as usize;
        if bits.len() < total.div_ceil(8) as usize {
            return Err(HfsError::Format(format!(
                "bitmap of {} bytes cannot cover {total} allocation blocks",
                bits.len()
            )));
        }
        bits.resize(sectors * SECTOR_BYTES, 0);
        let free = bitmap_count_free(&bits, total);
        Ok(Self {
            bits,
            total,
            free,
            dirty: BTreeSet::new(),
        })
    }

    #[must_use]
    pub fn total(&self) -> u32 {
        self.total
    }

    #[must_use]
    pub fn free(&self) -> u32 {
        self.free
    }

    #[must_use]
    pub fn stats(&self) -> BitmapStats {
        BitmapStats {
            total_blocks: self.total,
            free_blocks: self.free,
            dirty_sectors: self.dirty.len(),
        }
    }

    #[must_use]
    pub fn is_allocated(&self, block: u32) -> bool {
        bitmap_get(&self.bits, block)
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    /// Recount free bits from the bitmap itself.
    #[must_use]
    pub fn recount_free(&self) -> u32 {
        bitmap_count_free(&self.bits, self.total)
    }

    fn touch(&mut self, block: u32) {
        self.dirty.insert(block / BITS_PER_BITMAP_BLOCK);
    }

    fn check_range(&self, ext: Extent) -> Result<()> {
        if ext.end() > self.total {
            error!(start = ext.start, count = ext.count, total = self.total, "bitmap_range_violation");
            return Err(HfsError::Corruption {
                block: u64::from(ext.start),
                detail: format!("extent {ext} beyond {} allocation blocks", self.total),
            });
        }
        Ok(())
    }

    /// Mark an extent used. Every block must currently be free.
    pub fn mark_used(&mut self, ext: Extent) -> Result<()> {
        self.check_range(ext)?;
        let start = u32::from(ext.start);
        if let Some(idx) = (start..ext.end()).find(|&i| bitmap_get(&self.bits, i)) {
            error!(block = idx, extent = %ext, "bitmap_double_allocation");
            return Err(HfsError::Corruption {
                block: u64::from(idx),
                detail: format!("allocation block {idx} already in use"),
            });
        }
        for idx in start..ext.end() {
            bitmap_set(&mut self.bits, idx);
            self.touch(idx);
        }
        self.free -= u32::from(ext.count);
        Ok(())
    }

    /// Mark an extent free. Every block must currently be used.
    pub fn mark_free(&mut self, ext: Extent) -> Result<()> {
        self.check_range(ext)?;
        let start = u32::from(ext.start);
        if let Some(idx) = (start..ext.end()).find(|&i| !bitmap_get(&self.bits, i)) {
            error!(block = idx, extent = %ext, "bitmap_double_free");
            return Err(HfsError::Corruption {
                block: u64::from(idx),
                detail: format!("allocation block {idx} already free"),
            });
        }
        for idx in start..ext.end() {
            bitmap_clear(&mut self.bits, idx);
            self.touch(idx);
        }
        self.free += u32::from(ext.count);
        trace!(extent = %ext, free = self.free, "bitmap_free");
        Ok(())
    }

    /// Free blocks directly after `last`, up to `want`.
    #[must_use]
    pub fn contiguous_after(&self, last: Extent, want: u32) -> u32 {
        if last.is_empty() {
            return 0;
        }
        bitmap_free_run_at(&self.bits, self.total, last.end(), want)
    }

    /// Allocate `want` blocks for a fork whose last extent is `last`.
    ///
    /// Returns the new runs in allocation order. The first run starts at
    /// `last.end()` when the fork could be grown in place. Fails with
    /// `NoSpace` and changes nothing when fewer than `want` blocks are free.
    pub fn allocate(&mut self, want: u32, last: Option<Extent>) -> Result<Vec<Extent>> {
        if want == 0 {
            return Ok(Vec::new());
        }
        if want > self.free {
            debug!(want, free = self.free, "bitmap_alloc_nospace");
            return Err(HfsError::NoSpace);
        }

        // Runs are claimed provisionally so each search skips earlier picks,
        // then released and committed through `mark_used`.
        let mut picked: Vec<(u32, u32)> = Vec::new();
        let mut remaining = want;
        if let Some(last) = last {
            let grow = self.contiguous_after(last, remaining);
            if grow > 0 {
                picked.push((last.end(), grow));
                remaining -= grow;
                self.claim(last.end(), grow, true);
            }
        }
        while remaining > 0 {
            let pick = bitmap_best_fit(&self.bits, self.total, remaining)
                .or_else(|| bitmap_largest_run(&self.bits, self.total));
            let Some((start, len)) = pick else {
                break;
            };
            let take = len.min(remaining);
            picked.push((start, take));
            remaining -= take;
            self.claim(start, take, true);
        }
        for &(start, len) in &picked {
            self.claim(start, len, false);
        }
        if remaining > 0 {
            error!(want, free = self.free, "bitmap_free_count_mismatch");
            return Err(HfsError::Corruption {
                block: 0,
                detail: format!("free count {} overstates free runs", self.free),
            });
        }

        let runs = picked
            .into_iter()
            .map(|(start, len)| ext_u16(start, len))
            .collect::<Result<Vec<_>>>()?;
        for ext in &runs {
            self.mark_used(*ext)?;
        }
        debug!(want, runs = runs.len(), free = self.free, "bitmap_alloc");
        Ok(runs)
    }

    fn claim(&mut self, start: u32, len: u32, used: bool) {
        for idx in start..start + len {
            if used {
                bitmap_set(&mut self.bits, idx);
            } else {
                bitmap_clear(&mut self.bits, idx);
            }
        }
    }

    /// Bitmap sectors changed since the last `take_dirty`, as
    /// `(sector_index, bytes)`.
    pub fn take_dirty(&mut self) -> Vec<(u32, Vec<u8>)> {
        let dirty = std::mem::take(&mut self.dirty);
        dirty
            .into_iter()
            .map(|sector| {
                let at = sector as usize * SECTOR_BYTES;
                (sector, self.bits[at..at + SECTOR_BYTES].to_vec())
            })
            .collect()
    }

    /// Put sectors back on the dirty list after a failed write-out.
    pub fn restore_dirty(&mut self, sectors: impl IntoIterator<Item = u32>) {
        self.dirty.extend(sectors);
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        !self.dirty.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn msb_first_bit_order() {
        let mut bm = vec![0_u8; 2];
        bitmap_set(&mut bm, 0);
        bitmap_set(&mut bm, 9);
        assert_eq!(bm, vec![0x80, 0x40]);
        assert!(bitmap_get(&bm, 9));
        bitmap_clear(&mut bm, 0);
        assert_eq!(bm[0], 0);
        assert_eq!(bitmap_count_free(&bm, 12), 11);
    }

    #[test]
    fn bitmap_find_free_wraps() {
        let mut bm = vec![0xFF_u8; 2];
        bitmap_clear(&mut bm, 3);
        assert_eq!(bitmap_find_free(&bm, 16, 5), Some(3));
        assert_eq!(bitmap_find_free(&[0xFF, 0xFF], 16, 0), None);
    }

    #[test]
    fn best_fit_prefers_smallest_sufficient_then_lowest() {
        // Free runs: 2..6 (4), 10..12 (2), 14..17 (3), 20..22 (2)
        let mut bm = vec![0xFF_u8; 4];
        for idx in (2..6).chain(10..12).chain(14..17).chain(20..22) {
            bitmap_clear(&mut bm, idx);
        }
        assert_eq!(bitmap_best_fit(&bm, 32, 2), Some((10, 2)));
        assert_eq!(bitmap_best_fit(&bm, 32, 3), Some((14, 3)));
        assert_eq!(bitmap_best_fit(&bm, 32, 4), Some((2, 4)));
        assert_eq!(bitmap_best_fit(&bm, 32, 5), None);
        assert_eq!(bitmap_largest_run(&bm, 32), Some((2, 4)));
    }

    #[test]
    fn allocate_extends_last_extent_first() {
        let mut vb = VolumeBitmap::new(100);
        vb.mark_used(Extent::new(0, 10)).expect("used");
        let runs = vb.allocate(5, Some(Extent::new(0, 10))).expect("alloc");
        assert_eq!(runs, vec![Extent::new(10, 5)]);
        assert_eq!(vb.free(), 85);
    }

    #[test]
    fn allocate_splits_across_runs_when_needed() {
        let mut vb = VolumeBitmap::new(32);
        vb.mark_used(Extent::new(0, 32)).expect("fill");
        vb.mark_free(Extent::new(4, 3)).expect("hole");
        vb.mark_free(Extent::new(20, 5)).expect("hole");
        let runs = vb.allocate(7, None).expect("alloc");
        assert_eq!(runs, vec![Extent::new(20, 5), Extent::new(4, 2)]);
        assert_eq!(vb.free(), 1);
        assert!(!vb.is_allocated(6));
    }

    #[test]
    fn allocate_more_than_free_changes_nothing() {
        let mut vb = VolumeBitmap::new(16);
        vb.mark_used(Extent::new(0, 10)).expect("used");
        let before = vb.as_bytes().to_vec();
        assert!(matches!(vb.allocate(7, None), Err(HfsError::NoSpace)));
        assert_eq!(vb.as_bytes(), &before[..]);
        assert_eq!(vb.free(), 6);
    }

    #[test]
    fn double_allocation_and_double_free_are_corruption() {
        let mut vb = VolumeBitmap::new(16);
        vb.mark_used(Extent::new(2, 2)).expect("used");
        assert!(matches!(
            vb.mark_used(Extent::new(3, 1)),
            Err(HfsError::Corruption { block: 3, .. })
        ));
        assert!(matches!(
            vb.mark_free(Extent::new(4, 1)),
            Err(HfsError::Corruption { block: 4, .. })
        ));
        assert!(matches!(
            vb.mark_used(Extent::new(15, 2)),
            Err(HfsError::Corruption { .. })
        ));
    }

    #[test]
    fn dirty_sectors_track_touched_bits() {
        let mut vb = VolumeBitmap::new(10_000);
        vb.mark_used(Extent::new(5, 1)).expect("used");
        vb.mark_used(Extent::new(4095, 2)).expect("used");
        let dirty = vb.take_dirty();
        assert_eq!(dirty.iter().map(|(s, _)| *s).collect::<Vec<_>>(), vec![0, 1]);
        assert_eq!(dirty[1].1[0], 0x80);
        assert!(vb.take_dirty().is_empty());
        vb.restore_dirty([2]);
        assert!(vb.is_dirty());
    }

    #[test]
    fn from_bytes_counts_only_covered_bits() {
        let vb = VolumeBitmap::from_bytes(vec![0xF0, 0xFF], 12).expect("load");
        assert_eq!(vb.free(), 4);
        assert!(VolumeBitmap::from_bytes(vec![0], 12).is_err());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn alloc_free_sequences_keep_count_and_disjointness(
            ops in proptest::collection::vec((1_u32..40, any::<bool>()), 1..60),
        ) {
            let total = 300_u32;
            let mut vb = VolumeBitmap::new(total);
            let mut live: Vec<Extent> = Vec::new();
            for (want, free_one) in ops {
                if free_one && !live.is_empty() {
                    let ext = live.remove(want as usize % live.len());
                    vb.mark_free(ext).expect("free");
                } else {
                    match vb.allocate(want, live.last().copied()) {
                        Ok(runs) => {
                            prop_assert_eq!(runs.iter().map(|r| u32::from(r.count)).sum::<u32>(), want);
                            live.extend(runs);
                        }
                        Err(HfsError::NoSpace) => prop_assert!(want > vb.free()),
                        Err(e) => return Err(TestCaseError::fail(e.to_string())),
                    }
                }
                let used: u32 = live.iter().map(|e| u32::from(e.count)).sum();
                prop_assert_eq!(vb.free(), total - used);
                prop_assert_eq!(vb.recount_free(), vb.free());
                for (i, a) in live.iter().enumerate() {
                    for b in &live[i + 1..] {
                        prop_assert!(!a.overlaps(*b));
                    }
                }
            }
        }
    }
}
