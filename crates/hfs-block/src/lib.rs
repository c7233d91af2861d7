#![forbid(unsafe_code)]
//! Block I/O layer for HFS media.
//!
//! Provides byte devices (files and in-memory images), partition selection
//! through the Apple partition map, the 512-byte `BlockDevice` trait, and an
//! ARC-managed write-back cache whose dirty blocks reach the medium only on
//! flush or under write pressure.

pub mod partition;

pub use partition::{
    HFS_PARTITION_TYPE, PartitionEntry, count_partitions, locate_partition, read_partition_map,
};

use hfs_error::{HfsError, Result};
use hfs_types::{BlockNumber, LOGICAL_BLOCK_SIZE};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, trace};

const BLOCK_BYTES: u64 = LOGICAL_BLOCK_SIZE as u64;

fn out_of_range(what: &str, detail: String) -> HfsError {
    HfsError::Io(std::io::Error::new(
        std::io::ErrorKind::UnexpectedEof,
        format!("{what} out of range: {detail}"),
    ))
}

fn check_span(what: &str, offset: u64, len: usize, total: u64) -> Result<()> {
    let len_u64 = u64::try_from(len).map_err(|_| out_of_range(what, format!("len={len}")))?;
    let end = offset.checked_add(len_u64);
    if end.is_none_or(|end| end > total) {
        return Err(out_of_range(
            what,
            format!("offset={offset} len={len} device_len={total}"),
        ));
    }
    Ok(())
}

/// Owned block buffer.
///
/// Invariant: length == `LOGICAL_BLOCK_SIZE`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockBuf {
    bytes: Vec<u8>,
}

impl BlockBuf {
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub fn into_inner(self) -> Vec<u8> {
        self.bytes
    }
}

/// Byte-addressed device for fixed-offset I/O (pread/pwrite semantics).
pub trait ByteDevice: Send + Sync {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write all bytes in `buf` to `offset`.
    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;

    /// Whether writes can succeed at all.
    fn is_writable(&self) -> bool {
        true
    }
}

impl<T: ByteDevice + ?Sized> ByteDevice for Box<T> {
    fn len_bytes(&self) -> u64 {
        (**self).len_bytes()
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        (**self).read_exact_at(offset, buf)
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        (**self).write_all_at(offset, buf)
    }

    fn sync(&self) -> Result<()> {
        (**self).sync()
    }

    fn is_writable(&self) -> bool {
        (**self).is_writable()
    }
}

/// File-backed byte device using `pread`/`pwrite` style I/O.
///
/// Opens read-write when permitted and silently falls back to read-only;
/// [`ByteDevice::is_writable`] reports which one happened.
#[derive(Debug, Clone)]
pub struct FileByteDevice {
    file: Arc<File>,
    len: u64,
    writable: bool,
}

impl FileByteDevice {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let (file, writable) = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map(|file| (file, true))
            .or_else(|_| {
                OpenOptions::new()
                    .read(true)
                    .open(path.as_ref())
                    .map(|file| (file, false))
            })?;
        let len = file.metadata()?.len();
        debug!(path = %path.as_ref().display(), len, writable, "file_device_open");
        Ok(Self {
            file: Arc::new(file),
            len,
            writable,
        })
    }

    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new().read(true).open(path.as_ref())?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            len,
            writable: false,
        })
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_span("read", offset, buf.len(), self.len)?;
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(HfsError::ReadOnly);
        }
        check_span("write", offset, buf.len(), self.len)?;
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        if self.writable {
            self.file.sync_all()?;
        }
        Ok(())
    }

    fn is_writable(&self) -> bool {
        self.writable
    }
}

/// In-memory medium. Clones share the same storage, so an image can be
/// unmounted and mounted again without copying it.
#[derive(Debug, Clone)]
pub struct MemoryByteDevice {
    bytes: Arc<Mutex<Vec<u8>>>,
    writable: bool,
}

impl MemoryByteDevice {
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self::from_bytes(vec![0_u8; len])
    }

    #[must_use]
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Arc::new(Mutex::new(bytes)),
            writable: true,
        }
    }

    /// A handle on the same storage that rejects writes.
    #[must_use]
    pub fn read_only(&self) -> Self {
        Self {
            bytes: Arc::clone(&self.bytes),
            writable: false,
        }
    }

    #[must_use]
    pub fn to_vec(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }
}

impl ByteDevice for MemoryByteDevice {
    fn len_bytes(&self) -> u64 {
        u64::try_from(self.bytes.lock().len()).unwrap_or(0)
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let bytes = self.bytes.lock();
        check_span("read", offset, buf.len(), u64::try_from(bytes.len()).unwrap_or(0))?;
        let start = usize::try_from(offset).map_err(|_| out_of_range("read", offset.to_string()))?;
        buf.copy_from_slice(&bytes[start..start + buf.len()]);
        drop(bytes);
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(HfsError::ReadOnly);
        }
        let mut bytes = self.bytes.lock();
        check_span("write", offset, buf.len(), u64::try_from(bytes.len()).unwrap_or(0))?;
        let start =
            usize::try_from(offset).map_err(|_| out_of_range("write", offset.to_string()))?;
        bytes[start..start + buf.len()].copy_from_slice(buf);
        drop(bytes);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }

    fn is_writable(&self) -> bool {
        self.writable
    }
}

/// 512-byte block I/O interface, relative to the selected partition.
pub trait BlockDevice: Send + Sync {
    /// Read a block by number.
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf>;

    /// Write a block by number. `data.len()` MUST equal `LOGICAL_BLOCK_SIZE`.
    fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()>;

    /// Total number of blocks.
    fn block_count(&self) -> u64;

    /// Write back anything buffered, then flush the medium.
    fn sync(&self) -> Result<()>;

    fn is_writable(&self) -> bool;
}

impl<T: BlockDevice + ?Sized> BlockDevice for Box<T> {
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf> {
        (**self).read_block(block)
    }

    fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()> {
        (**self).write_block(block, data)
    }

    fn block_count(&self) -> u64 {
        (**self).block_count()
    }

    fn sync(&self) -> Result<()> {
        (**self).sync()
    }

    fn is_writable(&self) -> bool {
        (**self).is_writable()
    }
}

/// A contiguous window of 512-byte blocks on a byte device.
#[derive(Debug)]
pub struct PartitionDevice<D: ByteDevice> {
    inner: D,
    start: u64,
    block_count: u64,
}

impl<D: ByteDevice> PartitionDevice<D> {
    pub fn new(inner: D, start: u64, block_count: u64) -> Result<Self> {
        let total = inner.len_bytes() / BLOCK_BYTES;
        let end = start.checked_add(block_count);
        if end.is_none_or(|end| end > total) {
            return Err(HfsError::Format(format!(
                "partition outside medium: start={start} count={block_count} medium_blocks={total}"
            )));
        }
        Ok(Self {
            inner,
            start,
            block_count,
        })
    }

    /// The entire medium, ignoring any trailing partial block.
    pub fn whole(inner: D) -> Result<Self> {
        let total = inner.len_bytes() / BLOCK_BYTES;
        Self::new(inner, 0, total)
    }

    /// Select partition `pnum` (0 = whole medium).
    pub fn select(inner: D, pnum: u32) -> Result<Self> {
        let (start, count) = locate_partition(&inner, pnum)?;
        debug!(pnum, start, count, "partition_selected");
        Self::new(inner, start, count)
    }

    #[must_use]
    pub fn start(&self) -> u64 {
        self.start
    }

    #[must_use]
    pub fn inner(&self) -> &D {
        &self.inner
    }

    fn byte_offset(&self, block: BlockNumber) -> Result<u64> {
        if block.0 >= self.block_count {
            return Err(out_of_range(
                "block",
                format!("block={} block_count={}", block.0, self.block_count),
            ));
        }
        Ok((self.start + block.0) * BLOCK_BYTES)
    }
}

impl<D: ByteDevice> BlockDevice for PartitionDevice<D> {
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf> {
        let offset = self.byte_offset(block)?;
        let mut buf = vec![0_u8; LOGICAL_BLOCK_SIZE];
        self.inner.read_exact_at(offset, &mut buf)?;
        Ok(BlockBuf::new(buf))
    }

    fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()> {
        if data.len() != LOGICAL_BLOCK_SIZE {
            return Err(HfsError::InvalidArgument(format!(
                "write_block data size mismatch: got={} expected={LOGICAL_BLOCK_SIZE}",
                data.len()
            )));
        }
        let offset = self.byte_offset(block)?;
        self.inner.write_all_at(offset, data)
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn sync(&self) -> Result<()> {
        self.inner.sync()
    }

    fn is_writable(&self) -> bool {
        self.inner.is_writable()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArcList {
    T1,
    T2,
    B1,
    B2,
}

/// Adaptive replacement bookkeeping for clean blocks.
#[derive(Debug)]
struct ArcState {
    capacity: usize,
    /// Target size for the T1 list.
    p: usize,
    t1: VecDeque<BlockNumber>,
    t2: VecDeque<BlockNumber>,
    b1: VecDeque<BlockNumber>,
    b2: VecDeque<BlockNumber>,
    loc: HashMap<BlockNumber, ArcList>,
    resident: HashMap<BlockNumber, Vec<u8>>,
}

impl ArcState {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            p: 0,
            t1: VecDeque::new(),
            t2: VecDeque::new(),
            b1: VecDeque::new(),
            b2: VecDeque::new(),
            loc: HashMap::new(),
            resident: HashMap::new(),
        }
    }

    fn remove_from_list(list: &mut VecDeque<BlockNumber>, key: BlockNumber) {
        if let Some(pos) = list.iter().position(|k| *k == key) {
            let _ = list.remove(pos);
        }
    }

    fn on_hit(&mut self, key: BlockNumber) {
        match self.loc.get(&key).copied() {
            Some(ArcList::T1) => {
                Self::remove_from_list(&mut self.t1, key);
                self.t2.push_back(key);
                self.loc.insert(key, ArcList::T2);
            }
            Some(ArcList::T2) => {
                Self::remove_from_list(&mut self.t2, key);
                self.t2.push_back(key);
            }
            _ => {}
        }
    }

    /// Evict one resident block into a ghost list, when the cache is full.
    fn replace(&mut self, incoming_in_b2: bool) {
        if self.t1.len() + self.t2.len() < self.capacity {
            return;
        }
        let t1_len = self.t1.len();
        if t1_len >= 1 && (t1_len > self.p || (incoming_in_b2 && t1_len == self.p)) {
            if let Some(victim) = self.t1.pop_front() {
                self.loc.insert(victim, ArcList::B1);
                let _ = self.resident.remove(&victim);
                self.b1.push_back(victim);
            }
        } else if let Some(victim) = self.t2.pop_front() {
            self.loc.insert(victim, ArcList::B2);
            let _ = self.resident.remove(&victim);
            self.b2.push_back(victim);
        } else if let Some(victim) = self.t1.pop_front() {
            self.loc.insert(victim, ArcList::B1);
            let _ = self.resident.remove(&victim);
            self.b1.push_back(victim);
        }
    }

    fn on_miss_or_ghost_hit(&mut self, key: BlockNumber) {
        match self.loc.get(&key).copied() {
            Some(ArcList::B1) => {
                let delta = (self.b2.len().max(1) / self.b1.len().max(1)).max(1);
                self.p = (self.p + delta).min(self.capacity);
                Self::remove_from_list(&mut self.b1, key);
                self.replace(false);
                self.t2.push_back(key);
                self.loc.insert(key, ArcList::T2);
                return;
            }
            Some(ArcList::B2) => {
                let delta = (self.b1.len().max(1) / self.b2.len().max(1)).max(1);
                self.p = self.p.saturating_sub(delta);
                Self::remove_from_list(&mut self.b2, key);
                self.replace(true);
                self.t2.push_back(key);
                self.loc.insert(key, ArcList::T2);
                return;
            }
            Some(ArcList::T1 | ArcList::T2) => {
                self.on_hit(key);
                return;
            }
            None => {}
        }

        let l1 = self.t1.len() + self.b1.len();
        let total = l1 + self.t2.len() + self.b2.len();
        if l1 >= self.capacity {
            if self.t1.len() < self.capacity {
                if let Some(ghost) = self.b1.pop_front() {
                    let _ = self.loc.remove(&ghost);
                }
                self.replace(false);
            } else if let Some(victim) = self.t1.pop_front() {
                let _ = self.loc.remove(&victim);
                let _ = self.resident.remove(&victim);
            }
        } else if total >= self.capacity {
            if total >= self.capacity.saturating_mul(2) {
                if let Some(ghost) = self.b2.pop_front() {
                    let _ = self.loc.remove(&ghost);
                }
            }
            self.replace(false);
        }

        self.t1.push_back(key);
        self.loc.insert(key, ArcList::T1);
    }

    fn insert_clean(&mut self, key: BlockNumber, bytes: Vec<u8>) {
        self.on_miss_or_ghost_hit(key);
        self.resident.insert(key, bytes);
    }

    /// Drop any clean copy; a dirty version now supersedes it.
    fn forget(&mut self, key: BlockNumber) {
        if self.resident.remove(&key).is_some() {
            match self.loc.remove(&key) {
                Some(ArcList::T1) => Self::remove_from_list(&mut self.t1, key),
                Some(ArcList::T2) => Self::remove_from_list(&mut self.t2, key),
                _ => {}
            }
        }
    }
}

#[derive(Debug)]
struct CacheState {
    arc: ArcState,
    /// Ordered so flush writes ascend by block number.
    dirty: BTreeMap<BlockNumber, Vec<u8>>,
}

/// Write-back cache around a [`BlockDevice`].
///
/// Clean blocks are managed by ARC with `capacity_blocks` resident entries.
/// Written blocks are held dirty until [`BlockCache::flush_dirty`] (or
/// [`BlockDevice::sync`]) writes them in ascending order; once more than
/// `capacity_blocks` are dirty, the write that crossed the bound flushes.
/// A failed flush leaves every unwritten block dirty.
#[derive(Debug)]
pub struct BlockCache<D: BlockDevice> {
    inner: D,
    capacity: usize,
    state: Mutex<CacheState>,
}

impl<D: BlockDevice> BlockCache<D> {
    pub fn new(inner: D, capacity_blocks: usize) -> Result<Self> {
        if capacity_blocks == 0 {
            return Err(HfsError::InvalidArgument(
                "cache capacity_blocks must be > 0".to_owned(),
            ));
        }
        Ok(Self {
            inner,
            capacity: capacity_blocks,
            state: Mutex::new(CacheState {
                arc: ArcState::new(capacity_blocks),
                dirty: BTreeMap::new(),
            }),
        })
    }

    #[must_use]
    pub fn inner(&self) -> &D {
        &self.inner
    }

    #[must_use]
    pub fn dirty_count(&self) -> usize {
        self.state.lock().dirty.len()
    }

    #[must_use]
    pub fn resident_count(&self) -> usize {
        self.state.lock().arc.resident.len()
    }

    /// Write every dirty block to the inner device, lowest block first.
    ///
    /// Returns the number of blocks written.
    pub fn flush_dirty(&self) -> Result<usize> {
        let mut guard = self.state.lock();
        let pending: Vec<BlockNumber> = guard.dirty.keys().copied().collect();
        let mut written = 0_usize;
        for block in pending {
            let Some(bytes) = guard.dirty.get(&block) else {
                continue;
            };
            self.inner.write_block(block, bytes)?;
            if let Some(bytes) = guard.dirty.remove(&block) {
                guard.arc.insert_clean(block, bytes);
            }
            written += 1;
        }
        drop(guard);
        if written > 0 {
            trace!(written, "cache_writeback");
        }
        Ok(written)
    }
}

impl<D: BlockDevice> BlockDevice for BlockCache<D> {
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf> {
        {
            let mut guard = self.state.lock();
            if let Some(bytes) = guard.dirty.get(&block) {
                return Ok(BlockBuf::new(bytes.clone()));
            }
            if let Some(bytes) = guard.arc.resident.get(&block).cloned() {
                guard.arc.on_hit(block);
                drop(guard);
                return Ok(BlockBuf::new(bytes));
            }
        }

        let buf = self.inner.read_block(block)?;
        self.state
            .lock()
            .arc
            .insert_clean(block, buf.as_slice().to_vec());
        Ok(buf)
    }

    fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()> {
        if !self.inner.is_writable() {
            return Err(HfsError::ReadOnly);
        }
        if data.len() != LOGICAL_BLOCK_SIZE {
            return Err(HfsError::InvalidArgument(format!(
                "write_block data size mismatch: got={} expected={LOGICAL_BLOCK_SIZE}",
                data.len()
            )));
        }
        if block.0 >= self.inner.block_count() {
            return Err(out_of_range(
                "block",
                format!("block={} block_count={}", block.0, self.inner.block_count()),
            ));
        }
        let over = {
            let mut guard = self.state.lock();
            guard.arc.forget(block);
            guard.dirty.insert(block, data.to_vec());
            guard.dirty.len() > self.capacity
        };
        if over {
            self.flush_dirty()?;
        }
        Ok(())
    }

    fn block_count(&self) -> u64 {
        self.inner.block_count()
    }

    fn sync(&self) -> Result<()> {
        self.flush_dirty()?;
        self.inner.sync()
    }

    fn is_writable(&self) -> bool {
        self.inner.is_writable()
    }
}
