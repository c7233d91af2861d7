//! Catalog maintenance on a mounted volume: lookups through thread records,
//! paired record/thread insertion and removal, moves, and the valence and
//! MDB counters that track them.

use crate::entity::EntryKind;
use crate::volume::{Volume, corrupt, parse_failure};
use hfs_error::{HfsError, Result};
use hfs_ondisk::{CatalogKey, CatalogRecord, ThreadRecord};
use hfs_types::{Cnid, MacTime, display_name};
use tracing::{debug, warn};

fn kind_of(record: &CatalogRecord) -> Result<EntryKind> {
    match record {
        CatalogRecord::Directory(_) => Ok(EntryKind::Directory),
        CatalogRecord::File(_) => Ok(EntryKind::File),
        CatalogRecord::DirThread(_) | CatalogRecord::FileThread(_) => Err(
            HfsError::InvalidArgument("thread records are not catalog entries".to_owned()),
        ),
    }
}

fn thread_for(kind: EntryKind, parent: Cnid, name: &[u8]) -> CatalogRecord {
    let thread = ThreadRecord {
        parent,
        name: name.to_vec(),
    };
    match kind {
        EntryKind::Directory => CatalogRecord::DirThread(thread),
        EntryKind::File => CatalogRecord::FileThread(thread),
    }
}

fn step_u16(value: u16, up: bool) -> Option<u16> {
    if up {
        value.checked_add(1)
    } else {
        value.checked_sub(1)
    }
}

fn step_u32(value: u32, up: bool) -> u32 {
    if up {
        value.saturating_add(1)
    } else {
        value.saturating_sub(1)
    }
}

impl Volume {
    /// Record stored under `(parent, name)`.
    pub(crate) fn lookup(&mut self, parent: Cnid, name: &[u8]) -> Result<Option<CatalogRecord>> {
        let key = CatalogKey::new(parent, name).to_bytes();
        let (tree, mut store) = self.catalog_parts();
        let Some(data) = tree.search(&mut store, &key)? else {
            return Ok(None);
        };
        CatalogRecord::parse(&data)
            .map(Some)
            .map_err(|err| parse_failure(u64::from(parent.0), &err))
    }

    /// Thread record of `cnid` and the kind of entry it points at.
    pub(crate) fn thread(&mut self, cnid: Cnid) -> Result<(EntryKind, ThreadRecord)> {
        match self.lookup(cnid, b"")? {
            Some(CatalogRecord::DirThread(t)) => Ok((EntryKind::Directory, t)),
            Some(CatalogRecord::FileThread(t)) => Ok((EntryKind::File, t)),
            Some(_) => Err(corrupt(
                u64::from(cnid.0),
                format!("non-thread record stored under thread key of {cnid}"),
            )),
            None => Err(HfsError::NotFound(format!("catalog id {cnid}"))),
        }
    }

    /// The directory or file record of `cnid` together with its key.
    pub(crate) fn record_by_id(&mut self, cnid: Cnid) -> Result<(CatalogKey, CatalogRecord)> {
        let (_, thread) = self.thread(cnid)?;
        match self.lookup(thread.parent, &thread.name)? {
            Some(record) if record.cnid() == Some(cnid) => {
                Ok((CatalogKey::new(thread.parent, &thread.name), record))
            }
            _ => Err(corrupt(
                u64::from(cnid.0),
                format!(
                    "thread of {cnid} names ({}, {}) which holds no such entry",
                    thread.parent,
                    display_name(&thread.name)
                ),
            )),
        }
    }

    pub(crate) fn parent_of(&mut self, dir: Cnid) -> Result<Cnid> {
        if dir == Cnid::ROOT_DIR {
            return Err(HfsError::NotFound(
                "no directory above the root".to_owned(),
            ));
        }
        Ok(self.thread(dir)?.1.parent)
    }

    /// Replace the record under an existing key.
    pub(crate) fn put_record(&mut self, key: &CatalogKey, record: &CatalogRecord) -> Result<()> {
        let (tree, mut store) = self.catalog_parts();
        tree.update(&mut store, &key.to_bytes(), &record.to_bytes())
    }

    /// Child of `dir` sorting directly after `after`.
    pub(crate) fn next_child(
        &mut self,
        dir: Cnid,
        after: &CatalogKey,
    ) -> Result<Option<(CatalogKey, CatalogRecord)>> {
        let (tree, mut store) = self.catalog_parts();
        let Some(entry) = tree.next_after(&mut store, &after.to_bytes())? else {
            return Ok(None);
        };
        let key = CatalogKey::parse(&entry.key).map_err(|err| parse_failure(u64::from(dir.0), &err))?;
        if key.parent != dir {
            return Ok(None);
        }
        let record =
            CatalogRecord::parse(&entry.data).map_err(|err| parse_failure(u64::from(dir.0), &err))?;
        Ok(Some((key, record)))
    }

    /// Insert a file or directory record and its thread under `parent`.
    ///
    /// Either both records land or neither does.
    pub(crate) fn insert_entry(
        &mut self,
        parent: Cnid,
        name: &[u8],
        record: &CatalogRecord,
    ) -> Result<()> {
        let kind = kind_of(record)?;
        let cnid = record.cnid().unwrap_or(Cnid::NONE);
        let key = CatalogKey::new(parent, name).to_bytes();
        let thread = thread_for(kind, parent, name);

        let (tree, mut store) = self.catalog_parts();
        tree.insert(&mut store, &key, &record.to_bytes())?;
        if let Err(err) = tree.insert(
            &mut store,
            &CatalogKey::thread(cnid).to_bytes(),
            &thread.to_bytes(),
        ) {
            tree.delete(&mut store, &key)?;
            return Err(err);
        }
        self.adjust_parent(parent, kind, true)?;
        debug!(parent = parent.0, cnid = cnid.0, name = %display_name(name), ?kind, "catalog_insert");
        Ok(())
    }

    /// Remove a file or directory record and its thread.
    pub(crate) fn remove_entry(&mut self, key: &CatalogKey, record: &CatalogRecord) -> Result<()> {
        let kind = kind_of(record)?;
        let cnid = record.cnid().unwrap_or(Cnid::NONE);
        let (tree, mut store) = self.catalog_parts();
        tree.delete(&mut store, &key.to_bytes())?;
        match tree.delete(&mut store, &CatalogKey::thread(cnid).to_bytes()) {
            Ok(()) => {}
            Err(HfsError::NotFound(_)) if kind == EntryKind::File => {
                // Files created elsewhere may lack a thread.
            }
            Err(err) => return Err(err),
        }
        self.adjust_parent(key.parent, kind, false)?;
        debug!(parent = key.parent.0, cnid = cnid.0, name = %display_name(&key.name), ?kind, "catalog_remove");
        Ok(())
    }

    /// Re-key an entry to `(to_parent, to_name)` and repoint its thread.
    pub(crate) fn move_entry(
        &mut self,
        key: &CatalogKey,
        record: &CatalogRecord,
        to_parent: Cnid,
        to_name: &[u8],
    ) -> Result<()> {
        let new_key = CatalogKey::new(to_parent, to_name);
        if new_key == *key {
            return Ok(());
        }
        let kind = kind_of(record)?;
        let cnid = record.cnid().unwrap_or(Cnid::NONE);

        let (tree, mut store) = self.catalog_parts();
        tree.insert(&mut store, &new_key.to_bytes(), &record.to_bytes())?;
        tree.delete(&mut store, &key.to_bytes())?;
        let thread_key = CatalogKey::thread(cnid).to_bytes();
        let thread = thread_for(kind, to_parent, to_name).to_bytes();
        match tree.update(&mut store, &thread_key, &thread) {
            Ok(()) => {}
            Err(HfsError::NotFound(_)) if kind == EntryKind::File => {
                warn!(cnid = cnid.0, "file_without_thread_moved");
            }
            Err(err) => return Err(err),
        }

        if to_parent == key.parent {
            if to_parent != Cnid::ROOT_PARENT {
                self.touch_dir(to_parent)?;
            }
        } else {
            self.adjust_parent(key.parent, kind, false)?;
            self.adjust_parent(to_parent, kind, true)?;
        }
        self.state.touch();
        debug!(
            cnid = cnid.0,
            from_parent = key.parent.0,
            to_parent = to_parent.0,
            name = %display_name(to_name),
            "catalog_move"
        );
        Ok(())
    }

    fn touch_dir(&mut self, dir: Cnid) -> Result<()> {
        let (key, record) = self.record_by_id(dir)?;
        let CatalogRecord::Directory(mut d) = record else {
            return Err(HfsError::NotDirectory);
        };
        d.modified = MacTime::now();
        self.put_record(&key, &CatalogRecord::Directory(d))
    }

    /// Step the parent's valence and the volume counters by one.
    fn adjust_parent(&mut self, parent: Cnid, kind: EntryKind, up: bool) -> Result<()> {
        // The root's own record sits under the pseudo-parent, which has no
        // record or counters.
        if parent != Cnid::ROOT_PARENT {
            let (key, record) = self.record_by_id(parent)?;
            let CatalogRecord::Directory(mut dir) = record else {
                return Err(corrupt(
                    u64::from(parent.0),
                    format!("parent {parent} is not a directory"),
                ));
            };
            dir.valence = step_u16(dir.valence, up).ok_or_else(|| {
                corrupt(
                    u64::from(parent.0),
                    format!("valence of {parent} out of range"),
                )
            })?;
            dir.modified = MacTime::now();
            self.put_record(&key, &CatalogRecord::Directory(dir))?;

            let mdb = &mut self.state.mdb;
            let at_root = parent == Cnid::ROOT_DIR;
            match kind {
                EntryKind::File => {
                    mdb.file_count = step_u32(mdb.file_count, up);
                    if at_root {
                        mdb.root_files = step_u16(mdb.root_files, up).unwrap_or(mdb.root_files);
                    }
                }
                EntryKind::Directory => {
                    mdb.dir_count = step_u32(mdb.dir_count, up);
                    if at_root {
                        mdb.root_dirs = step_u16(mdb.root_dirs, up).unwrap_or(mdb.root_dirs);
                    }
                }
            }
        }
        self.state.touch();
        Ok(())
    }
}
