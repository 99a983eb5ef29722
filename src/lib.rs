//! mph_index — sharded minimal perfect hash tables over byte-string keys.
//!
//! - Build once on a set of **unique** keys; O(1) lookups: key -> unique
//!   index in `[0..n)`, confirmed by a byte-wise compare against the stored
//!   key (no false positives).
//! - Two-level "hash, displace, compress" layout: per-bucket seeds in
//!   level-0, key indices in level-1.
//! - `ShardedTable` partitions large corpora by a leading bit prefix,
//!   in memory or spilled to per-shard files, with optional parallel builds
//!   and suffix-only key storage.
//! - Binary dump/load for both flavours, including a keys-file co-located
//!   dump.

mod bucket;
mod error;
mod hash;
mod keys;
mod shard;
mod sharded;
mod table;

pub use error::MphError;
pub use sharded::{ShardedBuilder, ShardedTable, SpillConfig};
pub use table::Table;
