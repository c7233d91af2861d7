#![forbid(unsafe_code)]
//! HFS volume engine.
//!
//! [`VolumeRegistry`] is the entry point: it mounts volumes, tracks the
//! current volume, and hands out opaque [`VolumeId`], [`DirId`] and
//! [`FileId`] handles for directory iteration and fork I/O. Paths use `:`
//! as the separator (see the `path` rules on [`VolumeRegistry::stat`]).
//!
//! ```no_run
//! use hfs_core::{FormatOptions, MemoryByteDevice, MountOptions, VolumeRegistry, format_partition};
//!
//! let disk = MemoryByteDevice::new(800 * 1024);
//! format_partition(disk.clone(), 0, &FormatOptions::new("Scratch"))?;
//!
//! let mut reg = VolumeRegistry::new();
//! let vol = reg.mount_partition(disk, 0, &MountOptions::read_write())?;
//! reg.mkdir(Some(vol), b"Scratch:Docs")?;
//! let file = reg.create(Some(vol), b"Scratch:Docs:note", *b"TEXT", *b"ttxt")?;
//! reg.write(file, b"hello")?;
//! reg.close(file)?;
//! reg.umount(Some(vol))?;
//! # Ok::<(), hfs_core::HfsError>(())
//! ```

mod catalog;
mod entity;
mod fork;
mod format;
mod ops;
mod options;
mod path;
mod volume;

pub use entity::{DirEntity, EntryKind, VolumeEntity};
pub use fork::Whence;
pub use format::{MIN_FORMAT_BLOCKS, format_device};
pub use hfs_block::{
    BlockBuf, BlockCache, BlockDevice, ByteDevice, FileByteDevice, MemoryByteDevice,
    PartitionDevice, count_partitions,
};
pub use hfs_error::{HfsError, Result};
pub use hfs_types::{BlockNumber, Cnid, ForkKind, MacTime};
pub use options::{FormatOptions, MountMode, MountOptions};

use fork::OpenFile;
use hfs_ondisk::{CatalogKey, CatalogRecord};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tracing::{debug, info, warn};
use volume::Volume;

// ── Handles ─────────────────────────────────────────────────────────────────

/// A mounted volume. Stale after `umount`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VolumeId(u32);

/// An open directory iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DirId(u32);

/// An open file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileId(u32);

#[derive(Debug)]
enum DirCursor {
    /// Roots of every volume mounted when the iteration began.
    Meta { volumes: Vec<VolumeId>, next: usize },
    Catalog {
        vol: VolumeId,
        dir: Cnid,
        last: CatalogKey,
    },
}

// ── Free functions ──────────────────────────────────────────────────────────

/// Format partition `pnum` (0 = whole medium) of the image at `path`.
pub fn format(path: impl AsRef<Path>, pnum: u32, options: &FormatOptions) -> Result<()> {
    format_partition(FileByteDevice::open(path)?, pnum, options)
}

/// Format partition `pnum` of an already opened medium.
pub fn format_partition<D: ByteDevice>(dev: D, pnum: u32, options: &FormatOptions) -> Result<()> {
    let part = PartitionDevice::select(dev, pnum)?;
    format_device(&part, options)
}

/// Number of HFS partitions in the partition map of the image at `path`.
pub fn count_partitions_at(path: impl AsRef<Path>) -> Result<usize> {
    count_partitions(&FileByteDevice::open_read_only(path)?)
}

fn pick(
    volumes: &mut BTreeMap<VolumeId, Volume>,
    current: Option<VolumeId>,
    vol: Option<VolumeId>,
) -> Result<(VolumeId, &mut Volume)> {
    let id = vol
        .or(current)
        .ok_or_else(|| HfsError::NotFound("no current volume".to_owned()))?;
    let v = volumes.get_mut(&id).ok_or(HfsError::BadHandle)?;
    Ok((id, v))
}

fn flush_volume(id: VolumeId, v: &mut Volume, files: &mut HashMap<FileId, OpenFile>) -> Result<()> {
    if !v.writable {
        return Ok(());
    }
    v.check_mutable()?;
    for file in files.values_mut().filter(|f| f.vol == id) {
        let result = file.flush(v);
        v.settle("flush", result)?;
    }
    let result = v.flush();
    v.settle("flush", result)
}

// ── Registry ────────────────────────────────────────────────────────────────

/// Every mounted volume plus the directory and file handles opened on them.
///
/// All operations that take `vol: Option<VolumeId>` act on the current
/// volume when given `None`. The most recent successful mount becomes
/// current; `set_vol` changes it.
#[derive(Debug, Default)]
pub struct VolumeRegistry {
    volumes: BTreeMap<VolumeId, Volume>,
    current: Option<VolumeId>,
    dirs: HashMap<DirId, DirCursor>,
    files: HashMap<FileId, OpenFile>,
    next_handle: u32,
}

impl VolumeRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn next_handle(&mut self) -> u32 {
        self.next_handle += 1;
        self.next_handle
    }

    fn file_parts(&mut self, file: FileId) -> Result<(&mut OpenFile, &mut Volume)> {
        let f = self.files.get_mut(&file).ok_or(HfsError::BadHandle)?;
        let v = self.volumes.get_mut(&f.vol).ok_or(HfsError::BadHandle)?;
        Ok((f, v))
    }

    // ── Mounting ────────────────────────────────────────────────────────────

    /// Mount partition `pnum` (0 = whole medium) of the image at `path`.
    pub fn mount(
        &mut self,
        path: impl AsRef<Path>,
        pnum: u32,
        options: &MountOptions,
    ) -> Result<VolumeId> {
        let path = path.as_ref();
        let dev = if options.mode == MountMode::ReadOnly {
            FileByteDevice::open_read_only(path)?
        } else {
            FileByteDevice::open(path)?
        };
        debug!(path = %path.display(), pnum, mode = ?options.mode, "mount_open");
        self.mount_partition(dev, pnum, options)
    }

    pub fn mount_partition<D: ByteDevice + 'static>(
        &mut self,
        dev: D,
        pnum: u32,
        options: &MountOptions,
    ) -> Result<VolumeId> {
        let part = PartitionDevice::select(dev, pnum)?;
        self.mount_device(Box::new(part), options)
    }

    /// Mount a volume occupying all of `dev`, caching it unless
    /// `options.no_cache` is set.
    pub fn mount_device(
        &mut self,
        dev: Box<dyn BlockDevice>,
        options: &MountOptions,
    ) -> Result<VolumeId> {
        let dev: Box<dyn BlockDevice> = if options.no_cache {
            dev
        } else {
            Box::new(BlockCache::new(dev, options.cache_blocks)?)
        };
        let vol = Volume::mount(dev, options)?;
        let id = VolumeId(self.next_handle());
        self.volumes.insert(id, vol);
        self.current = Some(id);
        Ok(id)
    }

    /// Write back open files, the bitmap and the MDB of one volume.
    pub fn flush(&mut self, vol: Option<VolumeId>) -> Result<()> {
        let (id, v) = pick(&mut self.volumes, self.current, vol)?;
        flush_volume(id, v, &mut self.files)
    }

    /// Flush every volume, reporting the first failure.
    pub fn flush_all(&mut self) -> Result<()> {
        let mut first = None;
        for (id, v) in &mut self.volumes {
            if let Err(err) = flush_volume(*id, v, &mut self.files) {
                warn!(volume = id.0, error = %err, "flush_failed");
                first.get_or_insert(err);
            }
        }
        first.map_or(Ok(()), Err)
    }

    /// Close the volume's files, flush it and release it. Its handles go
    /// stale even when the final flush fails.
    pub fn umount(&mut self, vol: Option<VolumeId>) -> Result<()> {
        let (id, _) = pick(&mut self.volumes, self.current, vol)?;
        let Some(mut v) = self.volumes.remove(&id) else {
            return Err(HfsError::BadHandle);
        };
        let mut first = None;
        let open: Vec<FileId> = self
            .files
            .iter()
            .filter(|(_, f)| f.vol == id)
            .map(|(fid, _)| *fid)
            .collect();
        for fid in open {
            if let Some(file) = self.files.remove(&fid) {
                let result = file.close(&mut v);
                if let Err(err) = v.settle("umount", result) {
                    first.get_or_insert(err);
                }
            }
        }
        self.dirs
            .retain(|_, d| !matches!(d, DirCursor::Catalog { vol, .. } if *vol == id));
        if self.current == Some(id) {
            self.current = None;
        }
        let result = v.unmount();
        first.map_or(result, Err)
    }

    pub fn umount_all(&mut self) -> Result<()> {
        let mut first = None;
        let ids: Vec<VolumeId> = self.volumes.keys().rev().copied().collect();
        for id in ids {
            if let Err(err) = self.umount(Some(id)) {
                warn!(volume = id.0, error = %err, "umount_failed");
                first.get_or_insert(err);
            }
        }
        first.map_or(Ok(()), Err)
    }

    // ── Volumes ─────────────────────────────────────────────────────────────

    /// Most recently mounted volume named `name`; the empty name is the
    /// current volume.
    pub fn get_vol(&self, name: &[u8]) -> Result<VolumeId> {
        if name.is_empty() {
            return self
                .current
                .ok_or_else(|| HfsError::NotFound("no current volume".to_owned()));
        }
        self.volumes
            .iter()
            .rev()
            .find(|(_, v)| v.name() == name)
            .map(|(id, _)| *id)
            .ok_or_else(|| HfsError::NotFound(format!("volume {}", hfs_types::display_name(name))))
    }

    pub fn set_vol(&mut self, vol: VolumeId) -> Result<()> {
        if !self.volumes.contains_key(&vol) {
            return Err(HfsError::BadHandle);
        }
        self.current = Some(vol);
        Ok(())
    }

    #[must_use]
    pub fn current_vol(&self) -> Option<VolumeId> {
        self.current
    }

    pub fn vstat(&mut self, vol: Option<VolumeId>) -> Result<VolumeEntity> {
        let (_, v) = pick(&mut self.volumes, self.current, vol)?;
        Ok(v.volume_entity())
    }

    /// Apply the clump size, dates and blessed folder from `ent`.
    pub fn vsetattr(&mut self, vol: Option<VolumeId>, ent: &VolumeEntity) -> Result<()> {
        let (_, v) = pick(&mut self.volumes, self.current, vol)?;
        v.check_mutable()?;
        let result = v.set_volume_attributes(ent);
        v.settle("vsetattr", result)
    }

    // ── Working directory ───────────────────────────────────────────────────

    pub fn chdir(&mut self, vol: Option<VolumeId>, path: &[u8]) -> Result<()> {
        let (_, v) = pick(&mut self.volumes, self.current, vol)?;
        let result = v.chdir(path);
        v.settle("chdir", result)
    }

    pub fn getcwd(&mut self, vol: Option<VolumeId>) -> Result<Cnid> {
        let (_, v) = pick(&mut self.volumes, self.current, vol)?;
        Ok(v.cwd)
    }

    pub fn setcwd(&mut self, vol: Option<VolumeId>, dir: Cnid) -> Result<()> {
        let (_, v) = pick(&mut self.volumes, self.current, vol)?;
        let result = v.set_cwd(dir);
        v.settle("setcwd", result)
    }

    /// Parent CNID and name of `cnid`.
    pub fn dirinfo(&mut self, vol: Option<VolumeId>, cnid: Cnid) -> Result<(Cnid, Vec<u8>)> {
        let (_, v) = pick(&mut self.volumes, self.current, vol)?;
        let result = v.thread(cnid).map(|(_, t)| (t.parent, t.name));
        v.settle("dirinfo", result)
    }

    // ── Directories ─────────────────────────────────────────────────────────

    /// Start iterating a directory.
    ///
    /// With no volume and an empty path the iteration yields the root
    /// directory of every mounted volume.
    pub fn opendir(&mut self, vol: Option<VolumeId>, path: &[u8]) -> Result<DirId> {
        let cursor = if vol.is_none() && path.is_empty() {
            DirCursor::Meta {
                volumes: self.volumes.keys().copied().collect(),
                next: 0,
            }
        } else {
            let (id, v) = pick(&mut self.volumes, self.current, vol)?;
            let result = path::resolve(v, path).and_then(path::Resolved::existing);
            match v.settle("opendir", result)? {
                (_, CatalogRecord::Directory(d)) => DirCursor::Catalog {
                    vol: id,
                    dir: d.id,
                    last: CatalogKey::thread(d.id),
                },
                _ => return Err(HfsError::NotDirectory),
            }
        };
        let id = DirId(self.next_handle());
        self.dirs.insert(id, cursor);
        Ok(id)
    }

    /// Next entry in catalog order, or `None` at the end.
    pub fn readdir(&mut self, dir: DirId) -> Result<Option<DirEntity>> {
        let cursor = self.dirs.get_mut(&dir).ok_or(HfsError::BadHandle)?;
        match cursor {
            DirCursor::Meta { volumes, next } => {
                while let Some(&id) = volumes.get(*next) {
                    *next += 1;
                    if let Some(v) = self.volumes.get_mut(&id) {
                        let result = v.stat_id(Cnid::ROOT_DIR);
                        return v.settle("readdir", result).map(Some);
                    }
                }
                Ok(None)
            }
            DirCursor::Catalog { vol, dir, last } => {
                let v = self.volumes.get_mut(&*vol).ok_or(HfsError::BadHandle)?;
                let result = v.next_child(*dir, last);
                let Some((key, record)) = v.settle("readdir", result)? else {
                    return Ok(None);
                };
                let entity = DirEntity::from_catalog(&key, &record).ok_or_else(|| {
                    HfsError::Corruption {
                        block: u64::from(dir.0),
                        detail: "thread record listed as a directory entry".to_owned(),
                    }
                });
                *last = key;
                entity.map(Some)
            }
        }
    }

    pub fn closedir(&mut self, dir: DirId) -> Result<()> {
        self.dirs.remove(&dir).map(|_| ()).ok_or(HfsError::BadHandle)
    }

    pub fn mkdir(&mut self, vol: Option<VolumeId>, path: &[u8]) -> Result<Cnid> {
        let (_, v) = pick(&mut self.volumes, self.current, vol)?;
        v.check_mutable()?;
        let result = v.mkdir(path);
        v.settle("mkdir", result)
    }

    /// Remove an empty directory.
    pub fn rmdir(&mut self, vol: Option<VolumeId>, path: &[u8]) -> Result<()> {
        let (_, v) = pick(&mut self.volumes, self.current, vol)?;
        v.check_mutable()?;
        let result = v.rmdir(path);
        v.settle("rmdir", result)
    }

    // ── Files ───────────────────────────────────────────────────────────────

    /// Create an empty file and open its data fork.
    pub fn create(
        &mut self,
        vol: Option<VolumeId>,
        path: &[u8],
        file_type: [u8; 4],
        creator: [u8; 4],
    ) -> Result<FileId> {
        let (id, v) = pick(&mut self.volumes, self.current, vol)?;
        v.check_mutable()?;
        let result = v
            .create_file(path, file_type, creator)
            .and_then(|record| OpenFile::open(v, id, record));
        let file = v.settle("create", result)?;
        let fid = FileId(self.next_handle());
        self.files.insert(fid, file);
        Ok(fid)
    }

    /// Open a file's data fork. On a writable volume a file may only be
    /// open once.
    pub fn open(&mut self, vol: Option<VolumeId>, path: &[u8]) -> Result<FileId> {
        let (id, v) = pick(&mut self.volumes, self.current, vol)?;
        let result = path::resolve(v, path).and_then(path::Resolved::existing);
        let record = match v.settle("open", result)? {
            (_, CatalogRecord::File(f)) => f,
            _ => return Err(HfsError::IsDirectory),
        };
        if v.writable && self.files.values().any(|f| f.vol == id && f.cnid == record.id) {
            return Err(HfsError::Busy(format!(
                "{} is already open",
                hfs_types::display_name(path)
            )));
        }
        let result = OpenFile::open(v, id, record);
        let file = v.settle("open", result)?;
        let fid = FileId(self.next_handle());
        self.files.insert(fid, file);
        Ok(fid)
    }

    /// Select the data or resource fork and rewind.
    pub fn setfork(&mut self, file: FileId, fork: ForkKind) -> Result<()> {
        let (f, v) = self.file_parts(file)?;
        let result = f.set_fork(v, fork);
        v.settle("setfork", result)
    }

    pub fn getfork(&self, file: FileId) -> Result<ForkKind> {
        self.files.get(&file).map(|f| f.fork).ok_or(HfsError::BadHandle)
    }

    /// Read up to `buf.len()` bytes at the file position.
    pub fn read(&mut self, file: FileId, buf: &mut [u8]) -> Result<usize> {
        let (f, v) = self.file_parts(file)?;
        let result = f.read(v, buf.len());
        let bytes = v.settle("read", result)?;
        buf[..bytes.len()].copy_from_slice(&bytes);
        Ok(bytes.len())
    }

    /// Write all of `data` at the file position, growing the fork as needed.
    pub fn write(&mut self, file: FileId, data: &[u8]) -> Result<usize> {
        let (f, v) = self.file_parts(file)?;
        let result = f.write(v, data);
        v.settle("write", result)
    }

    /// Shrink the open fork to `len` bytes. Blocks are released on close.
    pub fn truncate(&mut self, file: FileId, len: u32) -> Result<()> {
        let (f, v) = self.file_parts(file)?;
        let result = f.truncate(v, len);
        v.settle("truncate", result)
    }

    /// Move the file position; targets outside `0..=len` are rejected.
    pub fn seek(&mut self, file: FileId, offset: i64, whence: Whence) -> Result<u32> {
        let f = self.files.get_mut(&file).ok_or(HfsError::BadHandle)?;
        f.seek(offset, whence)
    }

    pub fn close(&mut self, file: FileId) -> Result<()> {
        let f = self.files.remove(&file).ok_or(HfsError::BadHandle)?;
        let v = self.volumes.get_mut(&f.vol).ok_or(HfsError::BadHandle)?;
        let result = f.close(v);
        v.settle("close", result)
    }

    // ── Attributes ──────────────────────────────────────────────────────────

    /// Describe the entry at `path`.
    ///
    /// A path containing `:` that does not start with one is absolute and
    /// begins with the volume name (`Vol:Dir:File`). Other paths are
    /// relative to the volume's current directory; after an optional
    /// leading `:`, each further `:` climbs one level (`::Sibling`). A
    /// trailing `:` requires the entry to be a directory. The empty path
    /// names the current directory.
    pub fn stat(&mut self, vol: Option<VolumeId>, path: &[u8]) -> Result<DirEntity> {
        let (_, v) = pick(&mut self.volumes, self.current, vol)?;
        let result = v.stat_path(path);
        v.settle("stat", result)
    }

    /// Describe an open file, including unflushed length changes.
    pub fn fstat(&mut self, file: FileId) -> Result<DirEntity> {
        let (f, v) = self.file_parts(file)?;
        let result = v.key_of(f.cnid);
        let key = v.settle("fstat", result)?;
        Ok(DirEntity::from_file(&key, &f.record))
    }

    pub fn setattr(&mut self, vol: Option<VolumeId>, path: &[u8], ent: &DirEntity) -> Result<()> {
        let (id, v) = pick(&mut self.volumes, self.current, vol)?;
        v.check_mutable()?;
        let result = v.set_attributes(path, ent);
        if let Some(cnid) = v.settle("setattr", result)? {
            for f in self.files.values_mut().filter(|f| f.vol == id && f.cnid == cnid) {
                f.set_attributes(ent);
            }
        }
        Ok(())
    }

    pub fn fsetattr(&mut self, file: FileId, ent: &DirEntity) -> Result<()> {
        let (f, v) = self.file_parts(file)?;
        v.check_mutable()?;
        f.set_attributes(ent);
        Ok(())
    }

    // ── Namespace ───────────────────────────────────────────────────────────

    /// Delete a closed, unlocked file and free its blocks.
    pub fn delete(&mut self, vol: Option<VolumeId>, path: &[u8]) -> Result<()> {
        let (id, v) = pick(&mut self.volumes, self.current, vol)?;
        v.check_mutable()?;
        let files = &self.files;
        let result = v.delete_file(path, |cnid| {
            files.values().any(|f| f.vol == id && f.cnid == cnid)
        });
        v.settle("delete", result)
    }

    /// Rename or move an entry. Naming an existing directory as the
    /// destination moves the entry into it; renaming the root directory
    /// renames the volume.
    pub fn rename(&mut self, vol: Option<VolumeId>, src: &[u8], dst: &[u8]) -> Result<()> {
        let (_, v) = pick(&mut self.volumes, self.current, vol)?;
        v.check_mutable()?;
        let result = v.rename(src, dst);
        v.settle("rename", result)
    }
}

impl Drop for VolumeRegistry {
    fn drop(&mut self) {
        if self.volumes.is_empty() {
            return;
        }
        info!(volumes = self.volumes.len(), "registry_dropped_unmounting");
        if let Err(err) = self.umount_all() {
            warn!(error = %err, "umount_on_drop_failed");
        }
    }
}
