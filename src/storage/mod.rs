//! Upload storage on the local filesystem.
//!
//! [`chunks::ChunkStore`] owns the per-submission directories and the
//! fragment layout, [`reassembler::Reassembler`] turns complete fragment
//! sets into files, and [`sidecar::MetadataSidecarWriter`] describes each
//! file for the record builder.

pub mod chunks;
pub mod paths;
pub mod reassembler;
pub mod records;
pub mod sidecar;
