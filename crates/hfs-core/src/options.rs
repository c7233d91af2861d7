//! Mount and format configuration.

use serde::{Deserialize, Serialize};

/// How a mount negotiates write access.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MountMode {
    /// Never write.
    ReadOnly,
    /// Fail unless the medium is writable, unlocked and cleanly unmounted.
    ReadWrite,
    /// Read-write when possible, otherwise read-only.
    #[default]
    Any,
}

/// Options for [`crate::VolumeRegistry::mount`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountOptions {
    pub mode: MountMode,
    /// Bypass the block cache: every block read and write goes straight to
    /// the medium.
    pub no_cache: bool,
    /// Zero-fill allocation blocks as forks grow into them.
    pub zero_new_blocks: bool,
    /// Block cache capacity, in 512-byte blocks.
    pub cache_blocks: usize,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            mode: MountMode::Any,
            no_cache: false,
            zero_new_blocks: false,
            cache_blocks: 256,
        }
    }
}

impl MountOptions {
    #[must_use]
    pub fn read_only() -> Self {
        Self {
            mode: MountMode::ReadOnly,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn read_write() -> Self {
        Self {
            mode: MountMode::ReadWrite,
            ..Self::default()
        }
    }
}

/// Options for [`crate::format`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatOptions {
    /// 1 to 27 bytes, no `:`.
    pub volume_name: Vec<u8>,
    /// Logical block numbers (relative to the partition) to keep out of use.
    pub bad_blocks: Vec<u64>,
}

impl FormatOptions {
    #[must_use]
    pub fn new(volume_name: impl Into<Vec<u8>>) -> Self {
        Self {
            volume_name: volume_name.into(),
            bad_blocks: Vec::new(),
        }
    }
}
