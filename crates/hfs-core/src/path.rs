//! Colon-separated path resolution.
//!
//! A path containing `:` that does not begin with one is absolute and starts
//! with the volume name. Anything else is relative to the volume's current
//! directory; after an optional leading `:`, every further `:` climbs one
//! level. A trailing `:` demands a directory.

use crate::volume::Volume;
use hfs_error::{HfsError, Result};
use hfs_ondisk::{CatalogKey, CatalogRecord};
use hfs_types::{Cnid, MAX_NAME_LEN, display_name};

/// Outcome of walking a path up to its final component.
#[derive(Debug, Clone)]
pub(crate) struct Resolved {
    pub parent: Cnid,
    pub name: Vec<u8>,
    pub found: Option<CatalogRecord>,
}

impl Resolved {
    pub fn key(&self) -> CatalogKey {
        CatalogKey::new(self.parent, &self.name)
    }

    /// The entry itself, or `NotFound` naming the missing component.
    pub fn existing(self) -> Result<(CatalogKey, CatalogRecord)> {
        let key = self.key();
        match self.found {
            Some(record) => Ok((key, record)),
            None => Err(HfsError::NotFound(display_name(&self.name))),
        }
    }
}

/// Check one path component.
pub(crate) fn validate_name(name: &[u8], max: usize) -> Result<()> {
    if name.is_empty() {
        return Err(HfsError::InvalidArgument("empty name".to_owned()));
    }
    if name.len() > max {
        return Err(HfsError::NameTooLong);
    }
    if name.contains(&b':') {
        return Err(HfsError::InvalidArgument(format!(
            "name {} contains ':'",
            display_name(name)
        )));
    }
    Ok(())
}

/// Entry for the directory `dir` itself, found through its thread.
fn resolve_dir(vol: &mut Volume, dir: Cnid) -> Result<Resolved> {
    let (_, thread) = vol.thread(dir)?;
    let found = vol.lookup(thread.parent, &thread.name)?;
    Ok(Resolved {
        parent: thread.parent,
        name: thread.name,
        found,
    })
}

pub(crate) fn resolve(vol: &mut Volume, path: &[u8]) -> Result<Resolved> {
    let absolute = path.contains(&b':') && path.first() != Some(&b':');
    let (mut dir, mut rest) = if absolute {
        let colon = path.iter().position(|&b| b == b':').unwrap_or(path.len());
        let volume = &path[..colon];
        if volume != vol.name() {
            return Err(HfsError::NotFound(format!(
                "volume {}",
                display_name(volume)
            )));
        }
        (Cnid::ROOT_DIR, &path[colon + 1..])
    } else {
        (vol.cwd, path.strip_prefix(b":").unwrap_or(path))
    };

    while let Some(tail) = rest.strip_prefix(b":") {
        dir = vol.parent_of(dir)?;
        rest = tail;
    }
    let want_dir = rest.last() == Some(&b':');
    let rest = rest.strip_suffix(b":").unwrap_or(rest);
    if rest.is_empty() {
        return resolve_dir(vol, dir);
    }

    let mut parts: Vec<&[u8]> = rest.split(|&b| b == b':').collect();
    let last = parts.pop().unwrap_or_default();
    for part in parts {
        if part.is_empty() {
            dir = vol.parent_of(dir)?;
            continue;
        }
        validate_name(part, MAX_NAME_LEN)?;
        match vol.lookup(dir, part)? {
            Some(CatalogRecord::Directory(d)) => dir = d.id,
            Some(_) => return Err(HfsError::NotDirectory),
            None => return Err(HfsError::NotFound(display_name(part))),
        }
    }
    if last.is_empty() {
        dir = vol.parent_of(dir)?;
        return resolve_dir(vol, dir);
    }

    validate_name(last, MAX_NAME_LEN)?;
    let found = vol.lookup(dir, last)?;
    if want_dir && matches!(found, Some(CatalogRecord::File(_))) {
        return Err(HfsError::NotDirectory);
    }
    Ok(Resolved {
        parent: dir,
        name: last.to_vec(),
        found,
    })
}
