//! Extents-overflow keys.
//!
//! Each leaf holds a three-slot extent record continuing a fork's extent
//! list at file allocation block `start_block`.

use hfs_btree::KeyOrder;
use hfs_types::{Cnid, ForkKind, ParseError, put_be_u16, put_be_u32, read_be_u16, read_be_u32, read_u8};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

pub const EXTENTS_MAX_KEY_LEN: u8 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExtentsKey {
    pub file: Cnid,
    pub fork: ForkKind,
    /// First file allocation block the record covers.
    pub start_block: u16,
}

impl ExtentsKey {
    #[must_use]
    pub fn new(file: Cnid, fork: ForkKind, start_block: u16) -> Self {
        Self {
            file,
            fork,
            start_block,
        }
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; 7] {
        let mut body = [0_u8; 7];
        body[0] = self.fork.code();
        put_be_u32(&mut body, 1, self.file.0);
        put_be_u16(&mut body, 5, self.start_block);
        body
    }

    pub fn parse(body: &[u8]) -> Result<Self, ParseError> {
        Ok(Self {
            fork: ForkKind::from_code(read_u8(body, 0)?)?,
            file: Cnid(read_be_u32(body, 1)?),
            start_block: read_be_u16(body, 5)?,
        })
    }
}

/// File CNID, then fork type, then starting block.
#[derive(Debug, Clone, Copy)]
pub struct ExtentsOrder;

fn key_parts(body: &[u8]) -> (u32, u8, u16) {
    (
        read_be_u32(body, 1).unwrap_or(0),
        read_u8(body, 0).unwrap_or(0),
        read_be_u16(body, 5).unwrap_or(0),
    )
}

impl KeyOrder for ExtentsOrder {
    const MAX_KEY_LEN: u8 = EXTENTS_MAX_KEY_LEN;
    const NAME: &'static str = "extents";

    fn compare(a: &[u8], b: &[u8]) -> Ordering {
        key_parts(a).cmp(&key_parts(b))
    }

    fn describe(key: &[u8]) -> String {
        let (file, fork, start) = key_parts(key);
        format!("(file {file}, fork {fork:#04x}, fabn {start})")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_layout() {
        let key = ExtentsKey::new(Cnid(0x20), ForkKind::Resource, 9);
        let body = key.to_bytes();
        assert_eq!(body, [0xFF, 0, 0, 0, 0x20, 0, 9]);
        assert_eq!(ExtentsKey::parse(&body).expect("parse"), key);
    }

    #[test]
    fn ordering_is_file_fork_block() {
        let k = |f: u32, fork: ForkKind, s: u16| ExtentsKey::new(Cnid(f), fork, s).to_bytes();
        let cmp = |a: [u8; 7], b: [u8; 7]| ExtentsOrder::compare(&a, &b);
        assert_eq!(cmp(k(16, ForkKind::Resource, 0), k(17, ForkKind::Data, 0)), Ordering::Less);
        assert_eq!(cmp(k(16, ForkKind::Data, 90), k(16, ForkKind::Resource, 3)), Ordering::Less);
        assert_eq!(cmp(k(16, ForkKind::Data, 3), k(16, ForkKind::Data, 30)), Ordering::Less);
        assert_eq!(cmp(k(16, ForkKind::Data, 3), k(16, ForkKind::Data, 3)), Ordering::Equal);
    }

    #[test]
    fn bad_fork_code_is_rejected() {
        assert!(ExtentsKey::parse(&[0x11, 0, 0, 0, 1, 0, 0]).is_err());
    }
}
