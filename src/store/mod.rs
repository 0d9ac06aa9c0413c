// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The node store: typed reads, writes and relocation layered on the
//! segment arena (L1) and the metadata table (L2).
//!
//! ## Read protocol
//!
//! 1. acquire-load the metadata cell
//! 2. follow its location into the mapped segment
//! 3. re-check `header.id` against the requested ID; a mismatch means the
//!    slot was reassigned between the load and the read, so retry
//! 4. optionally verify the checksum
//! 5. feed the per-segment read statistics
//!
//! ## Write protocol
//!
//! New nodes are bump-allocated, fully written, then published with one
//! release-store of the metadata cell. In-place modification takes the
//! cell's modify bit (fencing off the compactor) plus the segment's sync
//! lock (fencing off msync), and is only legal for bytes behind the sync
//! boundary; otherwise the writer clones into a fresh allocation under
//! the same ID and lets the transaction log free the old bytes on commit.

use crate::config::Config;
use crate::gc::GcQueue;
use crate::meta::{Meta, MetaCell, NodeLocation};
use crate::node::binary::BinaryView;
use crate::node::full::FullView;
use crate::node::setlist::SetlistView;
use crate::node::value::ValueView;
use crate::node::{self, NodeHeader, NodeId, NodeType, HEADER_SIZE};
use crate::segment::{AllocHandle, SegmentAllocator};
use crate::stop_signal::StopSignal;
use crate::table::IdTable;
use crate::{ChecksumPolicy, Error, OpenMode, Result};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Attempts before a location/ID mismatch is declared corruption rather
/// than benign slot reuse.
const READ_RETRY_BUDGET: usize = 64;

/// Everything shared by sessions, the compactor and the GC thread.
pub(crate) struct Core {
    pub config: Config,
    pub ids: IdTable,
    pub seg: SegmentAllocator,
    pub gc: GcQueue,
    pub stop: StopSignal,
    pub mode: OpenMode,

    /// Set on corruption; flips the engine read-only
    pub poisoned: AtomicBool,

    /// Claimed by the single write session
    pub writer_active: AtomicBool,

    /// Versions at or above this may still be mutated in place by the
    /// writer; the compactor must not relocate them. `u64::MAX` while no
    /// write session exists.
    pub uncommitted_floor: AtomicU64,

    /// Advisory lock on the database folder
    #[allow(dead_code)]
    pub lockfile: std::fs::File,
}

impl Core {
    /// Records corruption: logs, flips read-only, returns the error.
    pub fn corrupt(&self, what: &'static str) -> Error {
        log::error!("corruption detected: {what}; engine is now read-only");
        self.poisoned.store(true, Ordering::Release);
        Error::Corruption(what)
    }

    pub fn ensure_writable(&self) -> Result<()> {
        if self.mode == OpenMode::ReadOnly || self.poisoned.load(Ordering::Acquire) {
            return Err(Error::ReadOnly);
        }
        Ok(())
    }
}

/// Pins the GC sequence for one session while shared state is accessed.
///
/// Raw node slices obtained through this guard are valid until the guard
/// drops.
pub(crate) struct ReadGuard<'s> {
    core: &'s Core,
    slot: usize,
}

impl<'s> ReadGuard<'s> {
    pub fn new(core: &'s Core, slot: usize) -> Self {
        core.gc.lock_session(slot);
        Self { core, slot }
    }

    pub fn core(&self) -> &'s Core {
        self.core
    }
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        self.core.gc.unlock_session(self.slot);
    }
}

/// Typed, read-only view of a node's bytes.
pub(crate) enum NodeKind<'a> {
    Value(ValueView<'a>),
    Binary(BinaryView<'a>),
    Setlist(SetlistView<'a>),
    Full(FullView<'a>),
}

/// A metadata cell plus a cached load of it.
pub(crate) struct ObjectRef<'g> {
    core: &'g Core,
    cell: &'g MetaCell,
    cached: Meta,
    id: NodeId,
}

impl<'g> ObjectRef<'g> {
    pub fn get(guard: &ReadGuard<'g>, id: NodeId) -> Result<Self> {
        let core = guard.core();
        let cell = core.ids.cell(id)?;
        let cached = cell.load(Ordering::Acquire);
        if cached.ref_count() == 0 {
            return Err(core.corrupt("reference to a dead node ID"));
        }
        Ok(Self {
            core,
            cell,
            cached,
            id,
        })
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn meta(&self) -> Meta {
        self.cached
    }

    pub fn cell(&self) -> &'g MetaCell {
        self.cell
    }

    pub fn refresh(&mut self) {
        self.cached = self.cell.load(Ordering::Acquire);
    }

    /// The node's bytes (header + payload), after the ID re-check.
    pub fn node_bytes(&mut self) -> Result<&'g [u8]> {
        for _ in 0..READ_RETRY_BUDGET {
            let location = self.cached.location();

            self.core
                .seg
                .check_bounds(location, HEADER_SIZE as u64)
                .map_err(|_| self.core.corrupt("metadata cell points outside segments"))?;

            let header = NodeHeader::read(self.core.seg.node_slice(location, HEADER_SIZE as u64));

            if header.node_id() != self.id {
                // slot reassigned under us; reload and retry
                self.refresh();
                if self.cached.ref_count() == 0 {
                    return Err(self.core.corrupt("node released during read"));
                }
                continue;
            }

            let len = u64::from(header.capacity());
            self.core
                .seg
                .check_bounds(location, len)
                .map_err(|_| self.core.corrupt("node size overruns its segment"))?;

            let bytes = self.core.seg.node_slice(location, len);

            if self.core.config.verify_on_read {
                if let Err(e) = node::verify_checksum(bytes) {
                    self.core.poisoned.store(true, Ordering::Release);
                    log::error!("checksum mismatch on node {}; engine is now read-only", self.id);
                    return Err(e);
                }
            }

            self.core.seg.note_read(
                location.segment(self.core.seg.segment_size()),
                u64::from(header.size),
            );

            return Ok(bytes);
        }

        Err(self.core.corrupt("node read retry budget exhausted"))
    }

    /// The node's bytes, parsed per its type tag.
    pub fn view(&mut self) -> Result<NodeKind<'g>> {
        let bytes = self.node_bytes()?;
        view_of(self.core, bytes)
    }

    /// Increments the reference count; fails on saturation.
    pub fn retain(&self) -> Result<()> {
        if self.cell.retain() {
            Ok(())
        } else {
            Err(Error::RefCountSaturated)
        }
    }
}

pub(crate) fn view_of<'a>(core: &Core, bytes: &'a [u8]) -> Result<NodeKind<'a>> {
    match NodeHeader::read(bytes).node_type() {
        NodeType::Value => Ok(NodeKind::Value(ValueView::new(bytes)?)),
        NodeType::Binary => Ok(NodeKind::Binary(BinaryView::new(bytes)?)),
        NodeType::Setlist => Ok(NodeKind::Setlist(SetlistView::new(bytes)?)),
        NodeType::Full => Ok(NodeKind::Full(FullView::new(bytes)?)),
        NodeType::Free | NodeType::Undefined => {
            Err(core.corrupt("node bytes carry an unusable type tag"))
        }
    }
}

/// Log of everything a transaction did, for commit/abort processing.
#[derive(Default)]
pub(crate) struct TxLog {
    /// IDs allocated by this transaction
    pub allocated: Vec<NodeId>,

    /// Cells repointed in place (same ID, new bytes), with their prior
    /// word; the old bytes stay intact until commit so abort can restore
    pub moved: Vec<(NodeId, Meta)>,

    /// References dropped by this transaction; the actual release runs at
    /// commit, so abort can simply forget them
    pub deferred_release: Vec<NodeId>,

    /// Root handles whose ID this transaction replaced: the reference
    /// they used to own, plus their defunct flag. An abort settles the
    /// orphaned reference and flips the flag so the handle's own drop
    /// becomes a no-op.
    pub swapped_roots: Vec<(NodeId, std::sync::Arc<AtomicBool>)>,
}

impl TxLog {
    pub fn is_empty(&self) -> bool {
        self.allocated.is_empty()
            && self.moved.is_empty()
            && self.deferred_release.is_empty()
            && self.swapped_roots.is_empty()
    }
}

/// Mutable context threaded through every trie write.
pub(crate) struct WriteCtx<'s> {
    pub core: &'s Core,
    pub alloc: &'s mut AllocHandle,
    pub log: &'s mut TxLog,

    /// Version stamped into nodes created by this transaction
    pub txn_version: u64,

    /// Nodes at or below this version belong to some snapshot and must be
    /// cloned before modification
    pub always_clone: u64,
}

impl<'s> WriteCtx<'s> {
    /// Whether this node may be rewritten without a clone: it was created
    /// by the current transaction and nobody else references it.
    pub fn is_unique(&self, meta: Meta, header_version: u64) -> bool {
        meta.ref_count() == 1 && header_version > self.always_clone
    }

    /// Allocates and publishes a new node. `build` must write the full
    /// payload; the header is written here.
    pub fn alloc_node(
        &mut self,
        node_type: NodeType,
        size: u32,
        build: impl FnOnce(&mut [u8], NodeId, u64),
    ) -> Result<NodeId> {
        let (id, cell) = self.core.ids.new_id()?;

        let location = match self.core.seg.alloc(self.alloc, size) {
            Ok(location) => location,
            Err(e) => {
                // hand the fresh ID straight back
                cell.release();
                self.core.ids.free_id(id)?;
                return Err(e);
            }
        };

        let capacity = node::capacity_of(size);
        let buf = self.core.seg.node_slice_mut(location, u64::from(capacity));
        buf[size as usize..].fill(0);
        build(buf, id, self.txn_version);
        debug_assert_eq!(size, NodeHeader::read(buf).size);
        debug_assert_eq!(id, NodeHeader::read(buf).node_id());

        if self.core.config.checksum_policy == ChecksumPolicy::OnModify {
            node::update_checksum(buf);
        }

        self.core.seg.publish_alloc(self.alloc);
        cell.store(Meta::new(node_type, location, 1), Ordering::Release);

        self.log.allocated.push(id);
        Ok(id)
    }

    /// Rewrites a node into a fresh allocation under the same ID.
    ///
    /// Parents keep pointing at `id`; the prior cell word is logged so an
    /// abort can swing the cell back to the old bytes (which stay intact
    /// because in-transaction frees are deferred).
    pub fn realloc_node(
        &mut self,
        oref: &mut ObjectRef<'_>,
        node_type: NodeType,
        size: u32,
        build: impl FnOnce(&mut [u8], NodeId, u64),
    ) -> Result<()> {
        let prior = oref.meta();
        let id = oref.id();

        let location = self.core.seg.alloc(self.alloc, size)?;
        let capacity = node::capacity_of(size);
        let buf = self.core.seg.node_slice_mut(location, u64::from(capacity));
        buf[size as usize..].fill(0);
        build(buf, id, self.txn_version);

        if self.core.config.checksum_policy == ChecksumPolicy::OnModify {
            node::update_checksum(buf);
        }

        self.core.seg.publish_alloc(self.alloc);
        oref.cell()
            .store(Meta::new(node_type, location, prior.ref_count()), Ordering::Release);
        oref.refresh();

        self.log.moved.push((id, prior));
        Ok(())
    }

    /// Mutates a node's bytes in place if the sync boundary allows it.
    ///
    /// Takes the cell's modify bit and the segment sync lock in "modify"
    /// mode. Returns `None` when the bytes are already covered by an
    /// msync (or the lock is held by one); the caller falls back to
    /// [`Self::realloc_node`].
    pub fn modify_in_place<R>(
        &mut self,
        oref: &mut ObjectRef<'_>,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> Result<Option<R>> {
        let observed = oref.cell().modify_begin();
        let location = observed.location();
        let segment = location.segment(self.core.seg.segment_size());

        let result = if let Some(_modify) = self.core.seg.sync_locks.try_modify(segment) {
            if self.core.seg.is_synced(location) {
                None
            } else {
                let header =
                    NodeHeader::read(self.core.seg.node_slice(location, HEADER_SIZE as u64));
                debug_assert_eq!(header.node_id(), oref.id());
                debug_assert!(header.version > self.always_clone);

                let buf = self
                    .core
                    .seg
                    .node_slice_mut(location, u64::from(header.capacity()));
                let r = f(buf);

                if self.core.config.checksum_policy == ChecksumPolicy::OnModify {
                    node::update_checksum(buf);
                } else {
                    node::clear_checksum(buf);
                }
                Some(r)
            }
        } else {
            None
        };

        oref.cell().modify_end();
        oref.refresh();
        Ok(result)
    }

    /// Drops a reference at commit time; a no-op if the transaction
    /// aborts instead.
    pub fn defer_release(&mut self, id: NodeId) {
        if !id.is_null() {
            self.log.deferred_release.push(id);
        }
    }
}

/// Releases one reference on `id`, cascading through children with an
/// explicit work list (a recursive walk could overflow the stack on tall
/// tries). Newly dead nodes have their bytes marked free and their IDs
/// pushed onto the freelist.
pub(crate) fn release_cascade(core: &Core, id: NodeId) -> Result<()> {
    let mut work = vec![id];

    while let Some(id) = work.pop() {
        if id.is_null() {
            continue;
        }

        let cell = core.ids.cell(id)?;
        let prior = cell.release();
        if prior.ref_count() != 1 {
            continue;
        }

        // last owner: enumerate children, then free bytes and ID
        let location = prior.location();
        core.seg.check_bounds(location, HEADER_SIZE as u64)?;
        let header = NodeHeader::read(core.seg.node_slice(location, HEADER_SIZE as u64));
        if header.node_id() != id {
            return Err(core.corrupt("released node does not own its bytes"));
        }

        let len = u64::from(header.capacity());
        core.seg.check_bounds(location, len)?;
        let bytes = core.seg.node_slice(location, len);

        if header.node_type().is_inner() {
            push_children(core, bytes, &mut work)?;
        }

        core.seg.free(location, header.capacity());
        core.ids.free_id(id)?;
    }

    Ok(())
}

fn push_children(core: &Core, bytes: &[u8], work: &mut Vec<NodeId>) -> Result<()> {
    match view_of(core, bytes)? {
        NodeKind::Value(_) => {}
        NodeKind::Binary(view) => {
            for (_, vid) in view.entries() {
                work.push(vid);
            }
        }
        NodeKind::Setlist(view) => {
            if !view.eof_value().is_null() {
                work.push(view.eof_value());
            }
            for (_, child) in view.branches() {
                work.push(child);
            }
        }
        NodeKind::Full(view) => {
            if !view.eof_value().is_null() {
                work.push(view.eof_value());
            }
            for (_, child) in view.branches() {
                work.push(child);
            }
        }
    }
    Ok(())
}

/// Evacuates one live node for compaction.
///
/// Copies the bytes to a fresh location, then CAS-publishes the move.
/// Returns `false` when the node moved, died, or was locked in the
/// meantime; the destination copy is rolled back in that case.
pub(crate) fn try_relocate(
    core: &Core,
    alloc: &mut AllocHandle,
    id: NodeId,
    expected: NodeLocation,
) -> Result<bool> {
    let cell = core.ids.cell(id)?;
    if !cell.try_start_move(expected) {
        return Ok(false);
    }

    core.seg.check_bounds(expected, HEADER_SIZE as u64)?;
    let header = NodeHeader::read(core.seg.node_slice(expected, HEADER_SIZE as u64));
    if header.node_id() != id {
        return Ok(false);
    }

    // nodes the writer may still mutate in place are left alone; they
    // will be young and their segment gets another pass later
    if header.version >= core.uncommitted_floor.load(Ordering::Acquire) {
        return Ok(false);
    }

    let capacity = u64::from(header.capacity());
    core.seg.check_bounds(expected, capacity)?;
    let src = core.seg.node_slice(expected, capacity);

    if !crate::Checksum::from_raw(header.checksum).is_deferred() {
        if let Err(e) = node::verify_checksum(src) {
            core.poisoned.store(true, Ordering::Release);
            log::error!("checksum mismatch while relocating node {id}; engine is now read-only");
            return Err(e);
        }
    }

    let dst_loc = core.seg.alloc(alloc, header.size)?;
    let dst = core.seg.node_slice_mut(dst_loc, capacity);
    dst.copy_from_slice(src);

    if core.config.checksum_policy == ChecksumPolicy::OnCompact {
        node::update_checksum(dst);
    }

    if cell.try_move(expected, dst_loc) {
        core.seg.publish_alloc(alloc);
        core.seg.free(expected, header.capacity());
        Ok(true)
    } else {
        core.seg.unalloc(alloc, dst_loc, header.size);
        Ok(false)
    }
}
