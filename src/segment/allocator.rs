// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::sync_lock::SyncLocks;
use super::{
    SegmentId, SegmentState, HDR_CLEAN_SHUTDOWN, HDR_CONFIG_HASH, HDR_EPOCH, HDR_GLOBAL_VERSION,
    HDR_MAGIC, MAGIC_BYTES, META_READ_BYTES, META_READ_EPOCH, META_STATE, SEGMENT_HEADER_SIZE,
    SEG_ALLOC_POS, SEG_EPOCH, SEG_FREED, SEG_LAST_SYNC, SEG_META_OFF, SEG_META_SIZE,
    TOP_ROOTS_OFF, TOP_ROOT_SLOT_SIZE,
};
use crate::config::{Config, NUM_TOP_ROOTS};
use crate::mapping::{round_to_page, BlockMap, Mapping};
use crate::meta::NodeLocation;
use crate::node::{self, NodeHeader, HEADER_SIZE};
use crate::{ChecksumPolicy, Error, Result, SyncKind};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;

/// Per-session allocation state: the active segment and a private mirror
/// of its bump pointer.
///
/// The mirror is authoritative until [`SegmentAllocator::publish_alloc`]
/// stores it into the segment header; node bytes are always fully written
/// before the store, so every byte below a published `alloc_pos` is
/// stable.
#[derive(Debug, Default)]
pub struct AllocHandle {
    seg: Option<SegmentId>,
    pos: u64,
}

impl AllocHandle {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

/// The L1 arena: hands out node regions, tracks freed bytes, flushes, and
/// feeds the compactor.
pub struct SegmentAllocator {
    head: Mapping,
    blocks: BlockMap,
    segment_size: u64,
    max_segments: u64,
    free_segs: Mutex<VecDeque<SegmentId>>,
    pub(crate) sync_locks: SyncLocks,
    checksum_on_msync: bool,
}

impl SegmentAllocator {
    /// Opens (or creates) the data file inside `dir`.
    ///
    /// Returns the allocator and whether the file was freshly created.
    pub fn open(dir: &Path, config: &Config) -> Result<(Self, bool)> {
        let path = dir.join("data");
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let max_segments = config.max_segments();
        let head_len =
            round_to_page(SEG_META_OFF as u64 + max_segments * SEG_META_SIZE as u64) as usize;

        let fresh = file.metadata()?.len() == 0;
        if fresh {
            file.set_len(head_len as u64)?;
        } else if file.metadata()?.len() < head_len as u64 {
            return Err(Error::Corruption("data file shorter than its head region"));
        }

        let head = Mapping::new(&file, 0, head_len)?;
        let blocks = BlockMap::new(
            file,
            head_len as u64,
            config.segment_size,
            max_segments,
        )?;

        let this = Self {
            head,
            blocks,
            segment_size: config.segment_size,
            max_segments,
            free_segs: Mutex::new(VecDeque::new()),
            sync_locks: SyncLocks::new(),
            checksum_on_msync: config.checksum_policy == ChecksumPolicy::OnMsync,
        };

        if fresh {
            this.head.write_bytes(HDR_MAGIC, &MAGIC_BYTES);
            this.head
                .write_bytes(HDR_CONFIG_HASH, &config.state_hash().to_le_bytes());
            this.global_version().store(1, Ordering::Release);
            this.epoch().store(1, Ordering::Release);
            log::debug!("created data file ({max_segments} segments max)");
        } else {
            if this.head.slice()[HDR_MAGIC..HDR_MAGIC + 4] != MAGIC_BYTES {
                return Err(Error::Corruption("bad data file magic"));
            }
            let stored = u32::from_le_bytes(
                this.head.slice()[HDR_CONFIG_HASH..HDR_CONFIG_HASH + 4]
                    .try_into()
                    .map_err(|_| Error::Corruption("truncated header"))?,
            );
            if stored != config.state_hash() {
                return Err(Error::ConfigMismatch);
            }
        }

        Ok((this, fresh))
    }

    #[must_use]
    pub fn segment_size(&self) -> u64 {
        self.segment_size
    }

    /// Number of segments that exist in the file.
    #[must_use]
    pub fn segment_count(&self) -> u64 {
        self.blocks.count()
    }

    // ------------------------------------------------------------------
    // head-region words

    pub(crate) fn global_version(&self) -> &AtomicU64 {
        self.head.atomic_u64(HDR_GLOBAL_VERSION)
    }

    pub(crate) fn epoch(&self) -> &AtomicU64 {
        self.head.atomic_u64(HDR_EPOCH)
    }

    pub(crate) fn clean_shutdown(&self) -> &AtomicU32 {
        self.head.atomic_u32(HDR_CLEAN_SHUTDOWN)
    }

    /// Atomic node-ID word of a top-root slot.
    pub(crate) fn top_root_id(&self, slot: u32) -> Result<&AtomicU64> {
        if slot >= NUM_TOP_ROOTS {
            return Err(Error::UnknownTopRoot);
        }
        Ok(self
            .head
            .atomic_u64(TOP_ROOTS_OFF + slot as usize * TOP_ROOT_SLOT_SIZE))
    }

    /// Atomic retain counter of a top-root slot.
    pub(crate) fn top_root_retain(&self, slot: u32) -> Result<&AtomicU64> {
        if slot >= NUM_TOP_ROOTS {
            return Err(Error::UnknownTopRoot);
        }
        Ok(self
            .head
            .atomic_u64(TOP_ROOTS_OFF + slot as usize * TOP_ROOT_SLOT_SIZE + 8))
    }

    fn seg_meta_word32(&self, segment: SegmentId, off: usize) -> &AtomicU32 {
        debug_assert!(segment < self.max_segments);
        self.head
            .atomic_u32(SEG_META_OFF + segment as usize * SEG_META_SIZE + off)
    }

    pub(crate) fn state(&self, segment: SegmentId) -> SegmentState {
        SegmentState::from_u32(self.seg_meta_word32(segment, META_STATE).load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, segment: SegmentId, state: SegmentState) {
        self.seg_meta_word32(segment, META_STATE)
            .store(state as u32, Ordering::Release);
    }

    /// Claims a fully evacuated sealed segment for recycling; only one
    /// caller wins.
    pub(crate) fn try_retire(&self, segment: SegmentId) -> bool {
        self.seg_meta_word32(segment, META_STATE)
            .compare_exchange(
                SegmentState::Sealed as u32,
                SegmentState::Retiring as u32,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Size-weighted read statistics, feeding cache priority.
    pub fn note_read(&self, segment: SegmentId, bytes: u64) {
        self.seg_meta_word32(segment, META_READ_EPOCH).store(
            self.epoch().load(Ordering::Relaxed) as u32,
            Ordering::Relaxed,
        );
        self.head
            .atomic_u64(SEG_META_OFF + segment as usize * SEG_META_SIZE + META_READ_BYTES)
            .fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn read_stats(&self, segment: SegmentId) -> (u32, u64) {
        (
            self.seg_meta_word32(segment, META_READ_EPOCH).load(Ordering::Relaxed),
            self.head
                .atomic_u64(SEG_META_OFF + segment as usize * SEG_META_SIZE + META_READ_BYTES)
                .load(Ordering::Relaxed),
        )
    }

    // ------------------------------------------------------------------
    // segment-header words

    pub(crate) fn alloc_pos(&self, segment: SegmentId) -> &AtomicU32 {
        self.blocks.block_atomic_u32(segment, SEG_ALLOC_POS)
    }

    pub(crate) fn freed_bytes(&self, segment: SegmentId) -> &AtomicU32 {
        self.blocks.block_atomic_u32(segment, SEG_FREED)
    }

    pub(crate) fn last_sync_pos(&self, segment: SegmentId) -> &AtomicU32 {
        self.blocks.block_atomic_u32(segment, SEG_LAST_SYNC)
    }

    pub(crate) fn seg_epoch(&self, segment: SegmentId) -> &AtomicU64 {
        self.blocks.block_atomic_u64(segment, SEG_EPOCH)
    }

    // ------------------------------------------------------------------
    // node byte access

    /// Bounds-checks a location against the segment area.
    pub(crate) fn check_bounds(&self, location: NodeLocation, len: u64) -> Result<()> {
        let seg = location.segment(self.segment_size);
        let off = location.within_segment(self.segment_size);
        if seg >= self.segment_count()
            || off < SEGMENT_HEADER_SIZE
            || off + len > self.segment_size
        {
            return Err(Error::Corruption("node location out of segment bounds"));
        }
        Ok(())
    }

    /// Shared view of a node region.
    #[must_use]
    pub(crate) fn node_slice(&self, location: NodeLocation, len: u64) -> &[u8] {
        let seg = location.segment(self.segment_size);
        let off = location.within_segment(self.segment_size) as usize;
        &self.blocks.block_slice(seg)[off..off + len as usize]
    }

    /// Mutable view of a node region; caller must own it (bump
    /// reservation, modify guard past the sync boundary, or recovery).
    #[must_use]
    pub(crate) fn node_slice_mut(&self, location: NodeLocation, len: u64) -> &mut [u8] {
        let seg = location.segment(self.segment_size);
        let off = location.within_segment(self.segment_size) as usize;
        self.blocks.block_slice_mut(seg, off, len as usize)
    }

    /// Whether the bytes at `location` are already covered by an msync.
    ///
    /// In-place modification is only allowed while this is false; past the
    /// boundary, writers fall back to clone-then-free.
    #[must_use]
    pub(crate) fn is_synced(&self, location: NodeLocation) -> bool {
        let seg = location.segment(self.segment_size);
        let off = location.within_segment(self.segment_size);
        u64::from(self.last_sync_pos(seg).load(Ordering::Acquire)) > off
    }

    // ------------------------------------------------------------------
    // allocation

    /// Reserves `size` bytes (padded to alignment) in the session's
    /// active segment, rotating to a fresh segment when it is full.
    ///
    /// The reservation is private until [`Self::publish_alloc`].
    pub fn alloc(&self, handle: &mut AllocHandle, size: u32) -> Result<NodeLocation> {
        let need = u64::from(node::capacity_of(size));
        debug_assert!(need >= HEADER_SIZE as u64);

        if need > self.segment_size - SEGMENT_HEADER_SIZE {
            return Err(Error::ValueTooLarge);
        }

        loop {
            if let Some(seg) = handle.seg {
                if handle.pos + need <= self.segment_size {
                    let location =
                        NodeLocation::new(seg * self.segment_size + handle.pos);
                    handle.pos += need;
                    return Ok(location);
                }
                self.seal(handle);
            }
            let seg = self.open_segment()?;
            handle.seg = Some(seg);
            handle.pos = u64::from(self.alloc_pos(seg).load(Ordering::Acquire));
        }
    }

    /// Publishes the session's bump pointer, making every byte below it
    /// stable for readers, flushes and recovery.
    pub fn publish_alloc(&self, handle: &AllocHandle) {
        if let Some(seg) = handle.seg {
            self.alloc_pos(seg).store(handle.pos as u32, Ordering::Release);
        }
    }

    /// Returns unused reservation space, for failed multi-part builds.
    pub fn unalloc(&self, handle: &mut AllocHandle, location: NodeLocation, size: u32) {
        let need = u64::from(node::capacity_of(size));
        let seg = location.segment(self.segment_size);
        if handle.seg == Some(seg)
            && handle.pos == location.within_segment(self.segment_size) + need
        {
            handle.pos -= need;
        } else {
            // someone already allocated past us; count the hole as freed
            self.free(location, node::capacity_of(size));
        }
    }

    /// Seals the session's active segment.
    pub fn seal(&self, handle: &mut AllocHandle) {
        if let Some(seg) = handle.seg.take() {
            self.alloc_pos(seg).store(handle.pos as u32, Ordering::Release);
            self.set_state(seg, SegmentState::Sealed);
            log::trace!(
                "sealed segment {seg} at {} of {} bytes",
                handle.pos,
                self.segment_size,
            );
        }
        handle.pos = 0;
    }

    fn open_segment(&self) -> Result<SegmentId> {
        let seg = {
            let mut free = self.free_segs.lock()?;
            free.pop_front()
        };

        let seg = match seg {
            Some(seg) => seg,
            None => {
                let seg = self.segment_count();
                self.blocks.ensure(seg + 1)?;
                seg
            }
        };

        self.alloc_pos(seg).store(SEGMENT_HEADER_SIZE as u32, Ordering::Release);
        self.freed_bytes(seg).store(0, Ordering::Release);
        self.last_sync_pos(seg).store(SEGMENT_HEADER_SIZE as u32, Ordering::Release);
        self.seg_epoch(seg).store(
            self.epoch().fetch_add(1, Ordering::AcqRel),
            Ordering::Release,
        );
        self.set_state(seg, SegmentState::Active);

        log::trace!("opened segment {seg}");
        Ok(seg)
    }

    /// Marks a node's capacity as freed in its owning segment.
    ///
    /// Never blocks; the bytes are reclaimed when the segment is
    /// compacted or recycled.
    pub fn free(&self, location: NodeLocation, capacity: u32) {
        let seg = location.segment(self.segment_size);
        self.freed_bytes(seg).fetch_add(capacity, Ordering::AcqRel);
    }

    /// Hands a fully evacuated segment back for reuse.
    ///
    /// Must only be called once no session can still hold pointers into
    /// it (the GC queue guarantees this).
    pub fn recycle(&self, segment: SegmentId) -> Result<()> {
        self.alloc_pos(segment).store(SEGMENT_HEADER_SIZE as u32, Ordering::Release);
        self.freed_bytes(segment).store(0, Ordering::Release);
        self.last_sync_pos(segment).store(SEGMENT_HEADER_SIZE as u32, Ordering::Release);
        self.set_state(segment, SegmentState::Free);

        self.free_segs.lock()?.push_back(segment);
        log::debug!("recycled segment {segment}");
        Ok(())
    }

    pub(crate) fn enqueue_free(&self, segment: SegmentId) -> Result<()> {
        self.free_segs.lock()?.push_back(segment);
        Ok(())
    }

    // ------------------------------------------------------------------
    // durability

    /// Flushes every segment whose sync cursor lags its bump pointer.
    ///
    /// Under the `OnMsync` checksum policy, dirty nodes in the flushed
    /// range get their checksum computed first, while the segment's sync
    /// lock excludes in-place modification.
    pub fn sync(&self, kind: SyncKind) -> Result<()> {
        if kind == SyncKind::None {
            return Ok(());
        }

        for seg in 0..self.segment_count() {
            if self.state(seg) == SegmentState::Free {
                continue;
            }

            let synced = u64::from(self.last_sync_pos(seg).load(Ordering::Acquire));
            if synced >= u64::from(self.alloc_pos(seg).load(Ordering::Acquire)) {
                continue;
            }

            let _guard = self.sync_locks.msync(seg);
            let target = u64::from(self.alloc_pos(seg).load(Ordering::Acquire));
            if synced >= target {
                continue;
            }

            if self.checksum_on_msync {
                self.fill_checksums(seg, synced, target)?;
            }

            let page = page_size::get() as u64;
            let from = synced & !(page - 1);
            let len = (target - from) as usize;
            if kind == SyncKind::Sync {
                self.blocks.flush_block_range(seg, from as usize, len, true)?;
            } else {
                self.blocks.flush_block_range(seg, from as usize, len, false)?;
            }

            self.last_sync_pos(seg).store(target as u32, Ordering::Release);
            log::trace!("synced segment {seg} up to {target}");
        }

        // the head region carries the top roots and counters
        self.head.flush_range(0, self.head.len())?;

        Ok(())
    }

    fn fill_checksums(&self, seg: SegmentId, from: u64, to: u64) -> Result<()> {
        self.walk_nodes(seg, from, to, |off, header| {
            let location = NodeLocation::new(seg * self.segment_size + off);
            let bytes = self.node_slice_mut(location, u64::from(node::capacity_of(header.size)));
            node::mark_synced(bytes);
            if header.is_dirty() || header.checksum == 0 {
                node::update_checksum(bytes);
            }
            Ok(())
        })
    }

    /// Walks the packed node regions of a segment between two offsets.
    ///
    /// Stops early at zeroed (never written) space.
    pub(crate) fn walk_nodes(
        &self,
        seg: SegmentId,
        from: u64,
        to: u64,
        mut f: impl FnMut(u64, &NodeHeader) -> Result<()>,
    ) -> Result<()> {
        let mut pos = from.max(SEGMENT_HEADER_SIZE);

        while pos + HEADER_SIZE as u64 <= to {
            let location = NodeLocation::new(seg * self.segment_size + pos);
            let header = NodeHeader::read(self.node_slice(location, HEADER_SIZE as u64));

            if header.size == 0 {
                break;
            }
            if (header.size as usize) < HEADER_SIZE
                || pos + u64::from(header.capacity()) > self.segment_size
            {
                return Err(Error::Corruption("node region overruns its segment"));
            }

            f(pos, &header)?;
            pos += u64::from(header.capacity());
        }

        Ok(())
    }

    // ------------------------------------------------------------------
    // compaction support

    /// Sealed segments whose emptiness crosses `threshold_pct`, ordered
    /// by emptiness x age (ascending).
    #[must_use]
    pub fn compact_candidates(&self, threshold_pct: u32) -> Vec<SegmentId> {
        let now = self.epoch().load(Ordering::Relaxed);
        let mut scored: Vec<(u64, SegmentId)> = Vec::new();

        for seg in 0..self.segment_count() {
            if self.state(seg) != SegmentState::Sealed {
                continue;
            }
            let allocated =
                u64::from(self.alloc_pos(seg).load(Ordering::Acquire)) - SEGMENT_HEADER_SIZE;
            if allocated == 0 {
                continue;
            }
            let freed = u64::from(self.freed_bytes(seg).load(Ordering::Acquire));
            if freed * 100 < allocated * u64::from(threshold_pct) {
                continue;
            }

            let emptiness = freed * 1_000 / allocated;
            let age = now.saturating_sub(self.seg_epoch(seg).load(Ordering::Relaxed));
            scored.push((emptiness * age.max(1), seg));
        }

        scored.sort_unstable();
        scored.into_iter().map(|(_, seg)| seg).collect()
    }

    /// Applies residency advice per tier budget, hottest segments first.
    pub fn apply_cache_advice(&self, budgets: &[u64; 4]) {
        let mut segs: Vec<(u64, SegmentId)> = (0..self.segment_count())
            .filter(|seg| self.state(*seg) != SegmentState::Free)
            .map(|seg| {
                let (epoch, bytes) = self.read_stats(seg);
                (u64::from(epoch) << 32 | (bytes >> 10).min(u32::MAX.into()), seg)
            })
            .collect();
        segs.sort_unstable_by(|a, b| b.cmp(a));

        let mut budget: u64 = budgets.iter().sum();
        for (_, seg) in segs {
            if budget >= self.segment_size {
                budget -= self.segment_size;
                self.blocks.advise_block(seg, memmap2::Advice::WillNeed);
            } else {
                self.blocks.advise_block(seg, memmap2::Advice::Normal);
            }
        }
    }

    /// Bytes allocated, bytes freed, per-state counts; for stats output.
    #[must_use]
    pub fn usage(&self) -> SegmentUsage {
        let mut usage = SegmentUsage::default();
        for seg in 0..self.segment_count() {
            match self.state(seg) {
                SegmentState::Free => usage.free += 1,
                SegmentState::Active => usage.active += 1,
                SegmentState::Sealed | SegmentState::Retiring => usage.sealed += 1,
            }
            if self.state(seg) != SegmentState::Free {
                usage.allocated_bytes +=
                    u64::from(self.alloc_pos(seg).load(Ordering::Relaxed)) - SEGMENT_HEADER_SIZE;
                usage.freed_bytes += u64::from(self.freed_bytes(seg).load(Ordering::Relaxed));
            }
        }
        usage
    }
}

/// Aggregate arena statistics
#[derive(Debug, Default, Clone, Copy)]
pub struct SegmentUsage {
    /// Segments available for reuse
    pub free: u64,
    /// Segments receiving allocations
    pub active: u64,
    /// Immutable segments
    pub sealed: u64,
    /// Bytes handed out across all non-free segments
    pub allocated_bytes: u64,
    /// Bytes released back across all non-free segments
    pub freed_bytes: u64,
}

impl std::fmt::Debug for SegmentAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "SegmentAllocator({} segments of {} bytes)",
            self.segment_count(),
            self.segment_size,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn test_config(dir: &Path) -> Config {
        Config::new(dir)
            .segment_size(1 << 20)
            .max_database_size(1 << 26)
            .max_objects(1 << 16)
    }

    #[test]
    fn bump_allocation_rotates_segments() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let cfg = test_config(dir.path());
        let (seg, fresh) = SegmentAllocator::open(dir.path(), &cfg)?;
        assert!(fresh);

        let mut handle = AllocHandle::new();
        let first = seg.alloc(&mut handle, 100)?;
        assert_eq!(SEGMENT_HEADER_SIZE, first.offset());

        let second = seg.alloc(&mut handle, 100)?;
        assert_eq!(SEGMENT_HEADER_SIZE + 104, second.offset());

        // exhaust the rest of the segment; the allocator must rotate
        let big = (1 << 20) / 2 - 128;
        let a = seg.alloc(&mut handle, big)?;
        let b = seg.alloc(&mut handle, big)?;
        assert_eq!(0, a.segment(1 << 20));
        assert_eq!(1, b.segment(1 << 20));
        assert_eq!(SegmentState::Sealed, seg.state(0));
        assert_eq!(SegmentState::Active, seg.state(1));

        Ok(())
    }

    #[test]
    fn freed_bytes_make_candidates() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let cfg = test_config(dir.path());
        let (seg, _) = SegmentAllocator::open(dir.path(), &cfg)?;

        let mut handle = AllocHandle::new();
        let loc = seg.alloc(&mut handle, 1_000)?;
        seg.publish_alloc(&handle);
        seg.seal(&mut handle);

        assert!(seg.compact_candidates(50).is_empty());

        seg.free(loc, crate::node::capacity_of(1_000));
        assert_eq!(vec![0], seg.compact_candidates(50));

        // recycled segments come back through the free list
        seg.recycle(0)?;
        assert_eq!(SegmentState::Free, seg.state(0));
        let loc = seg.alloc(&mut handle, 64)?;
        assert_eq!(0, loc.segment(1 << 20));

        Ok(())
    }

    #[test]
    fn rejects_oversized_allocations() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let cfg = test_config(dir.path());
        let (seg, _) = SegmentAllocator::open(dir.path(), &cfg)?;

        let mut handle = AllocHandle::new();
        assert!(matches!(
            seg.alloc(&mut handle, 1 << 20),
            Err(Error::ValueTooLarge),
        ));
        Ok(())
    }

    #[test]
    fn sync_advances_the_flush_cursor() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let cfg = test_config(dir.path());
        let (seg, _) = SegmentAllocator::open(dir.path(), &cfg)?;

        let mut handle = AllocHandle::new();
        let loc = seg.alloc(&mut handle, 256)?;

        let buf = seg.node_slice_mut(loc, 256);
        crate::node::NodeHeader::new(
            crate::node::NodeType::Value,
            256,
            crate::node::NodeId::from_u64(1),
            1,
        )
        .write_to(buf);
        seg.publish_alloc(&handle);

        assert!(!seg.is_synced(loc));
        seg.sync(SyncKind::Sync)?;
        assert!(seg.is_synced(loc));

        // the checksum-on-msync policy stamped the dirty node
        let header = crate::node::NodeHeader::read(seg.node_slice(loc, 256));
        assert_ne!(0, header.checksum);
        crate::node::verify_checksum(seg.node_slice(loc, 256))?;

        Ok(())
    }
}
