//! Path-level operations on one mounted volume.

use crate::entity::{DirEntity, EntryKind, VolumeEntity};
use crate::fork::release_file_space;
use crate::path::{resolve, validate_name};
use crate::volume::{Volume, corrupt};
use hfs_error::{HfsError, Result};
use hfs_ondisk::{
    CatalogKey, CatalogRecord, DirFinderInfo, DirRecord, FILE_HAS_THREAD, FileFinderInfo,
    FileRecord, ForkData,
};
use hfs_types::{Cnid, MAX_VOLUME_NAME_LEN, MacTime, display_name};
use tracing::{debug, info};

fn entity(key: &CatalogKey, record: &CatalogRecord) -> Result<DirEntity> {
    DirEntity::from_catalog(key, record).ok_or_else(|| {
        corrupt(
            u64::from(key.parent.0),
            format!("thread record under ({}, {})", key.parent, display_name(&key.name)),
        )
    })
}

impl Volume {
    pub(crate) fn stat_path(&mut self, path: &[u8]) -> Result<DirEntity> {
        let (key, record) = resolve(self, path)?.existing()?;
        entity(&key, &record)
    }

    pub(crate) fn stat_id(&mut self, cnid: Cnid) -> Result<DirEntity> {
        let (key, record) = self.record_by_id(cnid)?;
        entity(&key, &record)
    }

    pub(crate) fn volume_entity(&self) -> VolumeEntity {
        let m = &self.state.mdb;
        let ab = u64::from(m.alloc_block_size);
        VolumeEntity {
            name: m.volume_name.clone(),
            locked: m.is_locked(),
            writable: self.writable,
            total_bytes: u64::from(m.alloc_blocks) * ab,
            free_bytes: u64::from(self.state.bitmap.free()) * ab,
            alloc_block_size: m.alloc_block_size,
            clump_size: m.clump_size,
            file_count: m.file_count,
            dir_count: m.dir_count,
            created: m.created,
            modified: m.modified,
            backup: m.backup,
            blessed: m.blessed(),
        }
    }

    pub(crate) fn set_volume_attributes(&mut self, ent: &VolumeEntity) -> Result<()> {
        let ab = self.state.mdb.alloc_block_size;
        if ent.clump_size == 0 || ent.clump_size % ab != 0 {
            return Err(HfsError::InvalidArgument(format!(
                "clump size {} is not a multiple of the {ab}-byte allocation block",
                ent.clump_size
            )));
        }
        if ent.blessed != Cnid::NONE && self.thread(ent.blessed)?.0 != EntryKind::Directory {
            return Err(HfsError::NotDirectory);
        }
        let mdb = &mut self.state.mdb;
        mdb.clump_size = ent.clump_size;
        mdb.created = ent.created;
        mdb.modified = ent.modified;
        mdb.backup = ent.backup;
        mdb.set_blessed(ent.blessed);
        self.state.mdb_dirty = true;
        Ok(())
    }

    pub(crate) fn chdir(&mut self, path: &[u8]) -> Result<()> {
        match resolve(self, path)?.existing()? {
            (_, CatalogRecord::Directory(d)) => {
                self.cwd = d.id;
                Ok(())
            }
            _ => Err(HfsError::NotDirectory),
        }
    }

    pub(crate) fn set_cwd(&mut self, dir: Cnid) -> Result<()> {
        if self.thread(dir)?.0 != EntryKind::Directory {
            return Err(HfsError::NotDirectory);
        }
        self.cwd = dir;
        Ok(())
    }

    pub(crate) fn mkdir(&mut self, path: &[u8]) -> Result<Cnid> {
        let target = resolve(self, path)?;
        if target.found.is_some() {
            return Err(HfsError::Exists(display_name(path)));
        }
        let id = self.next_cnid()?;
        let now = MacTime::now();
        let record = CatalogRecord::Directory(DirRecord {
            flags: 0,
            valence: 0,
            id,
            created: now,
            modified: now,
            backup: MacTime(0),
            finder: DirFinderInfo::default(),
            ext_finder: [0; 16],
        });
        self.insert_entry(target.parent, &target.name, &record)?;
        Ok(id)
    }

    pub(crate) fn rmdir(&mut self, path: &[u8]) -> Result<()> {
        let (key, record) = resolve(self, path)?.existing()?;
        let CatalogRecord::Directory(dir) = &record else {
            return Err(HfsError::NotDirectory);
        };
        if dir.id == Cnid::ROOT_DIR {
            return Err(HfsError::Busy("the root directory cannot be removed".to_owned()));
        }
        if dir.valence != 0 {
            return Err(HfsError::NotEmpty);
        }
        self.remove_entry(&key, &record)?;
        if self.cwd == dir.id {
            self.cwd = key.parent;
        }
        if self.state.mdb.blessed() == dir.id {
            self.state.mdb.set_blessed(Cnid::NONE);
        }
        Ok(())
    }

    pub(crate) fn create_file(
        &mut self,
        path: &[u8],
        file_type: [u8; 4],
        creator: [u8; 4],
    ) -> Result<FileRecord> {
        let target = resolve(self, path)?;
        if target.found.is_some() {
            return Err(HfsError::Exists(display_name(path)));
        }
        let id = self.next_cnid()?;
        let now = MacTime::now();
        let record = FileRecord {
            flags: FILE_HAS_THREAD,
            version: 0,
            finder: FileFinderInfo {
                file_type,
                creator,
                ..FileFinderInfo::default()
            },
            id,
            data: ForkData::default(),
            resource: ForkData::default(),
            created: now,
            modified: now,
            backup: MacTime(0),
            ext_finder: [0; 16],
            clump_size: 0,
        };
        self.insert_entry(target.parent, &target.name, &CatalogRecord::File(record.clone()))?;
        Ok(record)
    }

    /// Remove a file and release its blocks. `is_open` reports whether a
    /// handle still refers to a CNID.
    pub(crate) fn delete_file(&mut self, path: &[u8], is_open: impl Fn(Cnid) -> bool) -> Result<()> {
        let (key, record) = resolve(self, path)?.existing()?;
        let CatalogRecord::File(file) = &record else {
            return Err(HfsError::IsDirectory);
        };
        if file.is_locked() {
            return Err(HfsError::Locked);
        }
        if is_open(file.id) {
            return Err(HfsError::Busy(format!("{} is open", display_name(path))));
        }
        self.remove_entry(&key, &record)?;
        release_file_space(self, file)
    }

    pub(crate) fn rename(&mut self, src: &[u8], dst: &[u8]) -> Result<()> {
        let (src_key, record) = resolve(self, src)?.existing()?;
        let id = record.cnid().unwrap_or(Cnid::NONE);
        if id == Cnid::ROOT_DIR {
            return self.rename_volume(&src_key, &record, dst);
        }

        let target = resolve(self, dst)?;
        let (to_parent, to_name) = match &target.found {
            Some(found) if found.cnid() == Some(id) => return Ok(()),
            Some(CatalogRecord::Directory(d)) => (d.id, src_key.name.clone()),
            Some(_) => return Err(HfsError::Exists(display_name(dst))),
            None => (target.parent, target.name.clone()),
        };
        if to_parent != src_key.parent && self.lookup(to_parent, &to_name)?.is_some() {
            return Err(HfsError::Exists(display_name(&to_name)));
        }
        if matches!(record, CatalogRecord::Directory(_)) {
            let mut at = to_parent;
            while at != Cnid::ROOT_DIR {
                if at == id {
                    return Err(HfsError::InvalidArgument(format!(
                        "cannot move {} inside itself",
                        display_name(src)
                    )));
                }
                at = self.parent_of(at)?;
            }
        }
        self.move_entry(&src_key, &record, to_parent, &to_name)
    }

    /// Renaming the root directory renames the volume.
    fn rename_volume(
        &mut self,
        root_key: &CatalogKey,
        root: &CatalogRecord,
        dst: &[u8],
    ) -> Result<()> {
        let name = dst.strip_suffix(b":").unwrap_or(dst);
        validate_name(name, MAX_VOLUME_NAME_LEN)?;
        self.move_entry(root_key, root, Cnid::ROOT_PARENT, name)?;
        info!(
            from = %display_name(&self.state.mdb.volume_name),
            to = %display_name(name),
            "volume_renamed"
        );
        self.state.mdb.volume_name = name.to_vec();
        self.state.touch();
        Ok(())
    }

    /// Apply `ent` to the entry at `path`. Returns the CNID when the entry
    /// is a file so open handles can pick up the change.
    pub(crate) fn set_attributes(&mut self, path: &[u8], ent: &DirEntity) -> Result<Option<Cnid>> {
        let (key, record) = resolve(self, path)?.existing()?;
        let (record, file) = match record {
            CatalogRecord::Directory(mut d) => {
                ent.apply_to_dir(&mut d);
                (CatalogRecord::Directory(d), None)
            }
            CatalogRecord::File(mut f) => {
                ent.apply_to_file(&mut f);
                let id = f.id;
                (CatalogRecord::File(f), Some(id))
            }
            CatalogRecord::DirThread(_) | CatalogRecord::FileThread(_) => {
                return Err(corrupt(u64::from(key.parent.0), "path resolved to a thread record"));
            }
        };
        self.put_record(&key, &record)?;
        self.state.touch();
        debug!(parent = key.parent.0, name = %display_name(&key.name), "attributes_set");
        Ok(file)
    }
}
