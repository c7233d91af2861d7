//! Caller-facing records for directory entries and volume statistics.

use hfs_ondisk::{CatalogKey, CatalogRecord, DirRecord, FILE_LOCKED, FileRecord};
use hfs_types::{Cnid, MacTime};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryKind {
    File,
    Directory,
}

/// One catalog entry as seen by callers of `stat`, `readdir` and `setattr`.
///
/// File-only fields are zero for directories and directory-only fields are
/// zero for files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntity {
    pub name: Vec<u8>,
    pub kind: EntryKind,
    pub cnid: Cnid,
    pub parent: Cnid,
    pub locked: bool,
    pub created: MacTime,
    pub modified: MacTime,
    pub backup: MacTime,
    pub finder_flags: u16,
    /// (v, h)
    pub location: (i16, i16),

    pub data_len: u32,
    pub resource_len: u32,
    pub file_type: [u8; 4],
    pub creator: [u8; 4],

    pub valence: u16,
    /// top, left, bottom, right
    pub rect: [i16; 4],
}

impl DirEntity {
    /// `None` for thread records.
    #[must_use]
    pub fn from_catalog(key: &CatalogKey, record: &CatalogRecord) -> Option<Self> {
        match record {
            CatalogRecord::Directory(d) => Some(Self::from_dir(key, d)),
            CatalogRecord::File(f) => Some(Self::from_file(key, f)),
            CatalogRecord::DirThread(_) | CatalogRecord::FileThread(_) => None,
        }
    }

    #[must_use]
    pub fn from_dir(key: &CatalogKey, d: &DirRecord) -> Self {
        Self {
            name: key.name.clone(),
            kind: EntryKind::Directory,
            cnid: d.id,
            parent: key.parent,
            locked: false,
            created: d.created,
            modified: d.modified,
            backup: d.backup,
            finder_flags: d.finder.flags,
            location: d.finder.location,
            data_len: 0,
            resource_len: 0,
            file_type: [0; 4],
            creator: [0; 4],
            valence: d.valence,
            rect: d.finder.rect,
        }
    }

    #[must_use]
    pub fn from_file(key: &CatalogKey, f: &FileRecord) -> Self {
        Self {
            name: key.name.clone(),
            kind: EntryKind::File,
            cnid: f.id,
            parent: key.parent,
            locked: f.is_locked(),
            created: f.created,
            modified: f.modified,
            backup: f.backup,
            finder_flags: f.finder.flags,
            location: f.finder.location,
            data_len: f.data.logical_len,
            resource_len: f.resource.logical_len,
            file_type: f.finder.file_type,
            creator: f.finder.creator,
            valence: 0,
            rect: [0; 4],
        }
    }

    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    #[must_use]
    pub fn name_str(&self) -> String {
        String::from_utf8_lossy(&self.name).into_owned()
    }

    /// Copy the settable attributes onto a file record.
    pub(crate) fn apply_to_file(&self, f: &mut FileRecord) {
        f.created = self.created;
        f.modified = self.modified;
        f.backup = self.backup;
        f.finder.flags = self.finder_flags;
        f.finder.location = self.location;
        f.finder.file_type = self.file_type;
        f.finder.creator = self.creator;
        if self.locked {
            f.flags |= FILE_LOCKED;
        } else {
            f.flags &= !FILE_LOCKED;
        }
    }

    /// Copy the settable attributes onto a directory record.
    pub(crate) fn apply_to_dir(&self, d: &mut DirRecord) {
        d.created = self.created;
        d.modified = self.modified;
        d.backup = self.backup;
        d.finder.flags = self.finder_flags;
        d.finder.location = self.location;
        d.finder.rect = self.rect;
    }
}

/// Volume statistics returned by `vstat`; `vsetattr` applies the clump
/// size, the three dates and the blessed folder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeEntity {
    pub name: Vec<u8>,
    pub locked: bool,
    pub writable: bool,
    pub total_bytes: u64,
    pub free_bytes: u64,
    pub alloc_block_size: u32,
    pub clump_size: u32,
    pub file_count: u32,
    pub dir_count: u32,
    pub created: MacTime,
    pub modified: MacTime,
    pub backup: MacTime,
    pub blessed: Cnid,
}
