//! Catalog-file keys and records.
//!
//! Keys are `(parent CNID, name)`. Names are opaque 8-bit strings compared
//! byte-wise, case-sensitively. Every file and directory has a matching
//! thread record keyed by `(own CNID, "")` that points back at its parent
//! and name.

use hfs_btree::KeyOrder;
use hfs_types::{
    Cnid, ExtentRecord, ForkKind, MAX_NAME_LEN, MacTime, ParseError, put_be_i16, put_be_u16,
    put_be_u32, put_pstring, read_be_i16, read_be_u16, read_be_u32, read_fixed, read_pstring,
    read_u8,
};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use crate::{parse_extent_record, put_extent_record};

/// 1 reserved + 4 parent + 32 name.
pub const CATALOG_MAX_KEY_LEN: u8 = 37;

pub const DIR_RECORD_SIZE: usize = 70;
pub const FILE_RECORD_SIZE: usize = 102;
pub const THREAD_RECORD_SIZE: usize = 46;

const TYPE_DIR: u8 = 1;
const TYPE_FILE: u8 = 2;
const TYPE_DIR_THREAD: u8 = 3;
const TYPE_FILE_THREAD: u8 = 4;

/// `filFlags` bit 0.
pub const FILE_LOCKED: u8 = 0x01;
/// `filFlags` bit 1: a file thread record exists.
pub const FILE_HAS_THREAD: u8 = 0x02;

// ── Key ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CatalogKey {
    pub parent: Cnid,
    pub name: Vec<u8>,
}

impl CatalogKey {
    #[must_use]
    pub fn new(parent: Cnid, name: &[u8]) -> Self {
        Self {
            parent,
            name: name.to_vec(),
        }
    }

    /// Key of the thread record for `cnid`.
    #[must_use]
    pub fn thread(cnid: Cnid) -> Self {
        Self {
            parent: cnid,
            name: Vec::new(),
        }
    }

    /// Key body as stored after the key-length byte.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let len = self.name.len().min(MAX_NAME_LEN);
        let mut body = vec![0_u8; 6 + len];
        put_be_u32(&mut body, 1, self.parent.0);
        body[5] = u8::try_from(len).unwrap_or(u8::MAX);
        body[6..].copy_from_slice(&self.name[..len]);
        body
    }

    pub fn parse(body: &[u8]) -> Result<Self, ParseError> {
        Ok(Self {
            parent: Cnid(read_be_u32(body, 1)?),
            name: read_pstring(body, 5, MAX_NAME_LEN)?,
        })
    }
}

/// Parent CNID first, then name bytes. Index-record padding past the name
/// length is ignored.
#[derive(Debug, Clone, Copy)]
pub struct CatalogOrder;

fn key_parts(body: &[u8]) -> (u32, &[u8]) {
    let parent = read_be_u32(body, 1).unwrap_or(0);
    let len = usize::from(read_u8(body, 5).unwrap_or(0));
    let name = body.get(6..6 + len).or_else(|| body.get(6..)).unwrap_or(&[]);
    (parent, name)
}

impl KeyOrder for CatalogOrder {
    const MAX_KEY_LEN: u8 = CATALOG_MAX_KEY_LEN;
    const NAME: &'static str = "catalog";

    fn compare(a: &[u8], b: &[u8]) -> Ordering {
        let (pa, na) = key_parts(a);
        let (pb, nb) = key_parts(b);
        pa.cmp(&pb).then_with(|| na.cmp(nb))
    }

    fn describe(key: &[u8]) -> String {
        let (parent, name) = key_parts(key);
        format!("({parent}, {:?})", String::from_utf8_lossy(name))
    }
}

// ── Finder info ─────────────────────────────────────────────────────────────

/// `FInfo`: the file's half of the Finder's bookkeeping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileFinderInfo {
    pub file_type: [u8; 4],
    pub creator: [u8; 4],
    pub flags: u16,
    pub location: (i16, i16),
    pub folder: i16,
}

impl FileFinderInfo {
    fn parse(data: &[u8], at: usize) -> Result<Self, ParseError> {
        Ok(Self {
            file_type: read_fixed(data, at)?,
            creator: read_fixed(data, at + 4)?,
            flags: read_be_u16(data, at + 8)?,
            location: (read_be_i16(data, at + 10)?, read_be_i16(data, at + 12)?),
            folder: read_be_i16(data, at + 14)?,
        })
    }

    fn write(&self, buf: &mut [u8], at: usize) {
        buf[at..at + 4].copy_from_slice(&self.file_type);
        buf[at + 4..at + 8].copy_from_slice(&self.creator);
        put_be_u16(buf, at + 8, self.flags);
        put_be_i16(buf, at + 10, self.location.0);
        put_be_i16(buf, at + 12, self.location.1);
        put_be_i16(buf, at + 14, self.folder);
    }
}

/// `DInfo`: window rectangle and Finder flags of a directory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirFinderInfo {
    /// top, left, bottom, right
    pub rect: [i16; 4],
    pub flags: u16,
    pub location: (i16, i16),
    pub view: i16,
}

impl DirFinderInfo {
    fn parse(data: &[u8], at: usize) -> Result<Self, ParseError> {
        let mut rect = [0_i16; 4];
        for (i, v) in rect.iter_mut().enumerate() {
            *v = read_be_i16(data, at + 2 * i)?;
        }
        Ok(Self {
            rect,
            flags: read_be_u16(data, at + 8)?,
            location: (read_be_i16(data, at + 10)?, read_be_i16(data, at + 12)?),
            view: read_be_i16(data, at + 14)?,
        })
    }

    fn write(&self, buf: &mut [u8], at: usize) {
        for (i, v) in self.rect.iter().enumerate() {
            put_be_i16(buf, at + 2 * i, *v);
        }
        put_be_u16(buf, at + 8, self.flags);
        put_be_i16(buf, at + 10, self.location.0);
        put_be_i16(buf, at + 12, self.location.1);
        put_be_i16(buf, at + 14, self.view);
    }
}

// ── Records ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirRecord {
    pub flags: u16,
    pub valence: u16,
    pub id: Cnid,
    pub created: MacTime,
    pub modified: MacTime,
    pub backup: MacTime,
    pub finder: DirFinderInfo,
    pub ext_finder: [u8; 16],
}

/// Logical and physical length plus inline extents of one fork.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForkData {
    pub start_block: u16,
    pub logical_len: u32,
    pub physical_len: u32,
    pub extents: ExtentRecord,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub flags: u8,
    pub version: u8,
    pub finder: FileFinderInfo,
    pub id: Cnid,
    pub data: ForkData,
    pub resource: ForkData,
    pub created: MacTime,
    pub modified: MacTime,
    pub backup: MacTime,
    pub ext_finder: [u8; 16],
    pub clump_size: u16,
}

impl FileRecord {
    #[must_use]
    pub fn fork(&self, which: ForkKind) -> &ForkData {
        match which {
            ForkKind::Data => &self.data,
            ForkKind::Resource => &self.resource,
        }
    }

    pub fn fork_mut(&mut self, which: ForkKind) -> &mut ForkData {
        match which {
            ForkKind::Data => &mut self.data,
            ForkKind::Resource => &mut self.resource,
        }
    }

    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.flags & FILE_LOCKED != 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadRecord {
    pub parent: Cnid,
    pub name: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CatalogRecord {
    Directory(DirRecord),
    File(FileRecord),
    DirThread(ThreadRecord),
    FileThread(ThreadRecord),
}

impl CatalogRecord {
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        match read_u8(data, 0)? {
            TYPE_DIR => parse_dir(data).map(Self::Directory),
            TYPE_FILE => parse_file(data).map(Self::File),
            TYPE_DIR_THREAD => parse_thread(data).map(Self::DirThread),
            TYPE_FILE_THREAD => parse_thread(data).map(Self::FileThread),
            _ => Err(ParseError::InvalidField {
                field: "cdrType",
                reason: "unknown catalog record type",
            }),
        }
    }

    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Self::Directory(d) => dir_bytes(d),
            Self::File(f) => file_bytes(f),
            Self::DirThread(t) => thread_bytes(TYPE_DIR_THREAD, t),
            Self::FileThread(t) => thread_bytes(TYPE_FILE_THREAD, t),
        }
    }

    /// CNID of the file or directory this record describes.
    #[must_use]
    pub fn cnid(&self) -> Option<Cnid> {
        match self {
            Self::Directory(d) => Some(d.id),
            Self::File(f) => Some(f.id),
            Self::DirThread(_) | Self::FileThread(_) => None,
        }
    }

    #[must_use]
    pub fn is_thread(&self) -> bool {
        matches!(self, Self::DirThread(_) | Self::FileThread(_))
    }
}

fn parse_dir(data: &[u8]) -> Result<DirRecord, ParseError> {
    Ok(DirRecord {
        flags: read_be_u16(data, 2)?,
        valence: read_be_u16(data, 4)?,
        id: Cnid(read_be_u32(data, 6)?),
        created: MacTime(read_be_u32(data, 10)?),
        modified: MacTime(read_be_u32(data, 14)?),
        backup: MacTime(read_be_u32(data, 18)?),
        finder: DirFinderInfo::parse(data, 22)?,
        ext_finder: read_fixed(data, 38)?,
    })
}

fn dir_bytes(d: &DirRecord) -> Vec<u8> {
    let mut buf = vec![0_u8; DIR_RECORD_SIZE];
    buf[0] = TYPE_DIR;
    put_be_u16(&mut buf, 2, d.flags);
    put_be_u16(&mut buf, 4, d.valence);
    put_be_u32(&mut buf, 6, d.id.0);
    put_be_u32(&mut buf, 10, d.created.0);
    put_be_u32(&mut buf, 14, d.modified.0);
    put_be_u32(&mut buf, 18, d.backup.0);
    d.finder.write(&mut buf, 22);
    buf[38..54].copy_from_slice(&d.ext_finder);
    buf
}

fn parse_file(data: &[u8]) -> Result<FileRecord, ParseError> {
    Ok(FileRecord {
        flags: read_u8(data, 2)?,
        version: read_u8(data, 3)?,
        finder: FileFinderInfo::parse(data, 4)?,
        id: Cnid(read_be_u32(data, 20)?),
        data: ForkData {
            start_block: read_be_u16(data, 24)?,
            logical_len: read_be_u32(data, 26)?,
            physical_len: read_be_u32(data, 30)?,
            extents: parse_extent_record(data, 74)?,
        },
        resource: ForkData {
            start_block: read_be_u16(data, 34)?,
            logical_len: read_be_u32(data, 36)?,
            physical_len: read_be_u32(data, 40)?,
            extents: parse_extent_record(data, 86)?,
        },
        created: MacTime(read_be_u32(data, 44)?),
        modified: MacTime(read_be_u32(data, 48)?),
        backup: MacTime(read_be_u32(data, 52)?),
        ext_finder: read_fixed(data, 56)?,
        clump_size: read_be_u16(data, 72)?,
    })
}

fn file_bytes(f: &FileRecord) -> Vec<u8> {
    let mut buf = vec![0_u8; FILE_RECORD_SIZE];
    buf[0] = TYPE_FILE;
    buf[2] = f.flags;
    buf[3] = f.version;
    f.finder.write(&mut buf, 4);
    put_be_u32(&mut buf, 20, f.id.0);
    put_be_u16(&mut buf, 24, f.data.start_block);
    put_be_u32(&mut buf, 26, f.data.logical_len);
    put_be_u32(&mut buf, 30, f.data.physical_len);
    put_be_u16(&mut buf, 34, f.resource.start_block);
    put_be_u32(&mut buf, 36, f.resource.logical_len);
    put_be_u32(&mut buf, 40, f.resource.physical_len);
    put_be_u32(&mut buf, 44, f.created.0);
    put_be_u32(&mut buf, 48, f.modified.0);
    put_be_u32(&mut buf, 52, f.backup.0);
    buf[56..72].copy_from_slice(&f.ext_finder);
    put_be_u16(&mut buf, 72, f.clump_size);
    put_extent_record(&mut buf, 74, &f.data.extents);
    put_extent_record(&mut buf, 86, &f.resource.extents);
    buf
}

fn parse_thread(data: &[u8]) -> Result<ThreadRecord, ParseError> {
    Ok(ThreadRecord {
        parent: Cnid(read_be_u32(data, 10)?),
        name: read_pstring(data, 14, MAX_NAME_LEN)?,
    })
}

fn thread_bytes(kind: u8, t: &ThreadRecord) -> Vec<u8> {
    let mut buf = vec![0_u8; THREAD_RECORD_SIZE];
    buf[0] = kind;
    put_be_u32(&mut buf, 10, t.parent.0);
    put_pstring(&mut buf, 14, &t.name, MAX_NAME_LEN);
    buf
}
