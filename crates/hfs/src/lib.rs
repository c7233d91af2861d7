#![forbid(unsafe_code)]
//! Public facade for the HFS engine.
//!
//! Re-exports the volume registry and its entity types from `hfs-core`.
//! Downstream bindings depend on this crate rather than on the layers
//! underneath.

pub use hfs_core::*;
