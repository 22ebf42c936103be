//! File system primitives: streaming fingerprints and source tree walking.

pub mod checksum;
pub mod walker;
