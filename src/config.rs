// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{Database, Error, Result};
use std::path::{Path, PathBuf};

pub(crate) const KIB: u64 = 1_024;
pub(crate) const MIB: u64 = 1_024 * KIB;
pub(crate) const GIB: u64 = 1_024 * MIB;
pub(crate) const TIB: u64 = 1_024 * GIB;

/// Metadata-cell blocks are appended to the ID file in this granularity.
pub(crate) const ID_BLOCK_SIZE: u64 = 128 * MIB;

/// Number of named snapshot slots at the head of the data file.
///
/// 256 slots of 16 bytes fill exactly one page.
pub(crate) const NUM_TOP_ROOTS: u32 = 256;

/// Hard cap on binary-node keys; the key count is stored in one byte.
pub(crate) const BINARY_NODE_MAX_KEYS: usize = 254;

/// Session slots are allocated from one 64-bit atomic bitmap, which caps
/// the number of concurrent sessions at 64.
pub(crate) const MAX_SESSIONS: u32 = 64;

/// When to (re)compute node checksums.
///
/// The policies are mutually exclusive by construction. The deferred
/// policies (`OnMsync`, `OnCompact`) blank the checksum field when a node
/// is modified in place and restore it later, which is why they cannot be
/// combined with checksum verification on the read path.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ChecksumPolicy {
    /// Recompute on every modification. Safest, slowest.
    OnModify,

    /// Recompute while flushing, under the segment sync lock.
    ///
    /// Guarantees at-rest integrity without per-write cost; the
    /// recommended production default.
    OnMsync,

    /// Recompute when the compactor relocates a node.
    OnCompact,
}

/// How eagerly `flush` pushes dirty segment bytes to disk
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SyncKind {
    /// Update flush cursors without calling msync
    None,

    /// Schedule an asynchronous msync
    Async,

    /// Block until the bytes are durable
    Sync,
}

/// Whether the engine may be written to
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OpenMode {
    /// Reads only; no write session can be started
    ReadOnly,

    /// Normal read-write operation
    ReadWrite,
}

/// Startup behavior after an unclean shutdown
#[derive(Copy, Clone, Debug, Default)]
pub struct RecoverArgs {
    /// Verify the checksum of every live node while scanning
    pub validate_checksum: bool,

    /// Accept bytes written past the last msync boundary.
    ///
    /// Faster recovery and fewer lost writes, at the risk of trusting
    /// bytes that never fully reached the disk.
    pub recover_unsync: bool,
}

/// Engine configuration builder
#[derive(Clone, Debug)]
pub struct Config {
    /// Database folder
    #[doc(hidden)]
    pub path: PathBuf,

    /// Hard cap on the data file
    pub(crate) max_database_size: u64,

    /// Maximum number of node IDs
    pub(crate) max_objects: u64,

    /// Segment size; power of two, < 4 GiB
    pub(crate) segment_size: u64,

    /// Longest accepted key
    pub(crate) max_key_length: usize,

    /// Size of the session slot table
    pub(crate) max_threads: u32,

    /// Branch count at which a setlist promotes to a full node
    pub(crate) full_node_threshold: usize,

    /// Leaf size at which a binary leaf splits into a setlist
    pub(crate) binary_refactor_threshold: usize,

    /// Checksum maintenance policy
    pub(crate) checksum_policy: ChecksumPolicy,

    /// Verify checksums on every read
    pub(crate) verify_on_read: bool,

    /// Freed/allocated ratio (in percent) above which a sealed segment
    /// becomes a compaction candidate
    pub(crate) compact_empty_pct: u32,

    /// Cache-residency budgets, hottest tier first
    pub(crate) cache_bytes: [u64; 4],

    /// Startup behavior
    pub(crate) recover: RecoverArgs,
}

impl Config {
    /// Creates a configuration for the given database folder.
    ///
    /// The folder is created on open if it does not exist.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().into(),
            max_database_size: 8 * TIB,
            max_objects: 1 << 30,
            segment_size: 32 * MIB,
            max_key_length: 1_024,
            max_threads: MAX_SESSIONS,
            full_node_threshold: 128,
            binary_refactor_threshold: 4_096,
            checksum_policy: ChecksumPolicy::OnMsync,
            verify_on_read: false,
            compact_empty_pct: 50,
            cache_bytes: [GIB, 2 * GIB, 4 * GIB, 8 * GIB],
            recover: RecoverArgs::default(),
        }
    }

    /// Sets the hard cap on the data file size.
    ///
    /// Default: 8 TiB
    #[must_use]
    pub fn max_database_size(mut self, bytes: u64) -> Self {
        self.max_database_size = bytes;
        self
    }

    /// Sets the maximum number of node IDs.
    ///
    /// Default: `1 << 30`
    #[must_use]
    pub fn max_objects(mut self, count: u64) -> Self {
        self.max_objects = count;
        self
    }

    /// Sets the segment size. Must be a power of two below 4 GiB.
    ///
    /// Default: 32 MiB
    #[must_use]
    pub fn segment_size(mut self, bytes: u64) -> Self {
        self.segment_size = bytes;
        self
    }

    /// Sets the longest accepted key. May not exceed 1024.
    ///
    /// Default: 1024
    #[must_use]
    pub fn max_key_length(mut self, bytes: usize) -> Self {
        self.max_key_length = bytes;
        self
    }

    /// Sets the number of session slots.
    ///
    /// May not exceed 64: session allocation works off a single 64-bit
    /// atomic bitmap.
    ///
    /// Default: 64
    #[must_use]
    pub fn max_threads(mut self, count: u32) -> Self {
        self.max_threads = count;
        self
    }

    /// Sets the branch count at which a setlist node becomes a full node.
    ///
    /// Default: 128
    #[must_use]
    pub fn full_node_threshold(mut self, branches: usize) -> Self {
        self.full_node_threshold = branches;
        self
    }

    /// Sets the leaf size at which a binary leaf splits into a setlist.
    ///
    /// Default: 4096 (one page)
    #[must_use]
    pub fn binary_refactor_threshold(mut self, bytes: usize) -> Self {
        self.binary_refactor_threshold = bytes;
        self
    }

    /// Selects the checksum maintenance policy.
    ///
    /// Default: [`ChecksumPolicy::OnMsync`]
    #[must_use]
    pub fn checksum_policy(mut self, policy: ChecksumPolicy) -> Self {
        self.checksum_policy = policy;
        self
    }

    /// Verifies node checksums on every read.
    ///
    /// Only valid together with [`ChecksumPolicy::OnModify`]; the deferred
    /// policies leave blanked checksums behind between modification and
    /// the restoring pass.
    ///
    /// Default: off
    #[must_use]
    pub fn verify_checksums_on_read(mut self, verify: bool) -> Self {
        self.verify_on_read = verify;
        self
    }

    /// Sets the emptiness percentage above which a sealed segment is
    /// compacted.
    ///
    /// Default: 50
    #[must_use]
    pub fn compact_empty_percent(mut self, pct: u32) -> Self {
        self.compact_empty_pct = pct;
        self
    }

    /// Sets the cache-residency budgets (hot, warm, cool, cold), in bytes.
    ///
    /// Segments are kept resident hottest-first until the budgets are
    /// spent; everything beyond is advised out.
    #[must_use]
    pub fn cache_bytes(mut self, hot: u64, warm: u64, cool: u64, cold: u64) -> Self {
        self.cache_bytes = [hot, warm, cool, cold];
        self
    }

    /// Sets the recovery behavior for the next open.
    #[must_use]
    pub fn recover_args(mut self, args: RecoverArgs) -> Self {
        self.recover = args;
        self
    }

    /// Opens the database in read-write mode.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, the folder is
    /// locked by another process, or the on-disk state cannot be read.
    pub fn open(self) -> Result<Database> {
        Database::open(self, OpenMode::ReadWrite)
    }

    /// Opens the database in read-only mode.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the on-disk
    /// state cannot be read.
    pub fn open_read_only(self) -> Result<Database> {
        Database::open(self, OpenMode::ReadOnly)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if !self.segment_size.is_power_of_two() {
            return Err(Error::InvalidConfig("segment_size must be a power of two"));
        }
        if self.segment_size >= 4 * GIB {
            return Err(Error::InvalidConfig(
                "segment_size must be below 4 GiB (offsets are 32-bit)",
            ));
        }
        if self.segment_size < 64 * KIB {
            return Err(Error::InvalidConfig("segment_size must be at least 64 KiB"));
        }
        if self.max_key_length == 0 || self.max_key_length > 1_024 {
            return Err(Error::InvalidConfig("max_key_length must be in 1..=1024"));
        }
        if self.max_threads < 3 || self.max_threads > MAX_SESSIONS {
            // the engine itself needs slots for the compactor and for
            // manual compaction next to at least one application session
            return Err(Error::InvalidConfig("max_threads must be in 3..=64"));
        }
        if self.max_database_size < self.segment_size * 2 {
            return Err(Error::InvalidConfig(
                "max_database_size must hold at least two segments",
            ));
        }
        if self.max_objects == 0 || self.max_objects > (1 << 40) {
            return Err(Error::InvalidConfig("max_objects must be in 1..=2^40"));
        }
        if self.full_node_threshold < 2 || self.full_node_threshold > 256 {
            return Err(Error::InvalidConfig("full_node_threshold must be in 2..=256"));
        }
        if self.binary_refactor_threshold < 256 || self.binary_refactor_threshold > 32_768 {
            // binary-node entry offsets are 16-bit
            return Err(Error::InvalidConfig(
                "binary_refactor_threshold must be in 256..=32768",
            ));
        }
        if self.compact_empty_pct == 0 || self.compact_empty_pct > 100 {
            return Err(Error::InvalidConfig("compact_empty_percent must be in 1..=100"));
        }
        if self.verify_on_read && self.checksum_policy != ChecksumPolicy::OnModify {
            // Deferred policies blank the checksum on modify; a reader
            // verifying in that window would report phantom corruption.
            return Err(Error::InvalidConfig(
                "verify_checksums_on_read requires ChecksumPolicy::OnModify",
            ));
        }
        Ok(())
    }

    /// Largest value accepted by `upsert`.
    pub(crate) fn max_value_size(&self) -> usize {
        (self.segment_size / 2) as usize
    }

    pub(crate) fn max_segments(&self) -> u64 {
        self.max_database_size / self.segment_size
    }

    /// Hash over the layout-relevant constants, stored in the data-file
    /// header. Reopening with constants that change the on-disk layout is
    /// rejected by comparing this value.
    pub(crate) fn state_hash(&self) -> u32 {
        let mut buf = [0u8; 28];
        buf[0..8].copy_from_slice(&self.max_database_size.to_le_bytes());
        buf[8..16].copy_from_slice(&self.max_objects.to_le_bytes());
        buf[16..24].copy_from_slice(&self.segment_size.to_le_bytes());
        buf[24..28].copy_from_slice(&(self.max_key_length as u32).to_le_bytes());
        xxhash_rust::xxh32::xxh32(&buf, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_rejects_odd_segment_size() {
        let cfg = Config::new(".").segment_size(3 * MIB);
        assert!(matches!(cfg.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn config_rejects_giant_segments() {
        let cfg = Config::new(".").segment_size(4 * GIB);
        assert!(matches!(cfg.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn config_rejects_verify_with_deferred_checksums() {
        let cfg = Config::new(".")
            .checksum_policy(ChecksumPolicy::OnMsync)
            .verify_checksums_on_read(true);
        assert!(matches!(cfg.validate(), Err(Error::InvalidConfig(_))));

        let cfg = Config::new(".")
            .checksum_policy(ChecksumPolicy::OnModify)
            .verify_checksums_on_read(true);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn config_hash_tracks_layout_constants() {
        let a = Config::new(".");
        let b = Config::new(".").segment_size(64 * MIB);
        assert_ne!(a.state_hash(), b.state_hash());
        assert_eq!(a.state_hash(), Config::new("elsewhere").state_hash());
    }
}
