//! Incremental SHA-256 tree hashing.
//!
//! Data is split into fixed 1 MiB blocks, each block is hashed with SHA-256,
//! and adjacent digests are paired and re-hashed level by level until a
//! single root remains. The cold-storage service uses this root to verify
//! uploads and retrieved byte ranges without fixing block boundaries in a
//! single linear pass.

mod digest;
mod hasher;

pub use digest::{ParseTreeHashError, TreeHash};
pub use hasher::{HashSummary, TreeHasher, combine, hash_reader};

/// Size of one tree-hash leaf block: 1 MiB.
pub const BLOCK_SIZE: usize = 1024 * 1024;
