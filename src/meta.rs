// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The packed 64-bit metadata word that backs every node ID.
//!
//! Bit layout, LSB first:
//!
//! ```text
//! ref      : 15   reference count, saturating
//! type     :  3   node type tag
//! modify   :  1   set while a writer mutates the bytes in place
//! location : 45   byte offset into the segment area, divided by 8
//! ```
//!
//! The location is stored pre-divided because nodes are 8-byte aligned;
//! 45 bits of aligned offset address 256 TiB, comfortably past the 8 TiB
//! database cap. Cells of free IDs reuse the location bits to store the
//! next free ID, forming the freelist.

use crate::node::{NodeId, NodeType};
use std::sync::atomic::{AtomicU64, Ordering};

const REF_BITS: u32 = 15;
const REF_MASK: u64 = (1 << REF_BITS) - 1;

const TYPE_SHIFT: u32 = 15;
const TYPE_MASK: u64 = 0b111 << TYPE_SHIFT;

const MODIFY_BIT: u64 = 1 << 18;

const LOC_SHIFT: u32 = 19;

/// An absolute byte offset into the segment area of the data file.
///
/// Always 8-byte aligned; segment index and in-segment offset are
/// recovered by dividing by the configured segment size.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct NodeLocation(u64);

impl NodeLocation {
    #[must_use]
    pub fn new(offset: u64) -> Self {
        debug_assert_eq!(offset % 8, 0, "node locations are 8-byte aligned");
        Self(offset)
    }

    #[must_use]
    pub fn offset(self) -> u64 {
        self.0
    }

    /// Segment index for a given segment size.
    #[must_use]
    pub fn segment(self, segment_size: u64) -> u64 {
        self.0 / segment_size
    }

    /// Offset within the segment for a given segment size.
    #[must_use]
    pub fn within_segment(self, segment_size: u64) -> u64 {
        self.0 & (segment_size - 1)
    }
}

/// Decoded snapshot of a metadata cell
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Meta(u64);

impl Meta {
    /// Reference counts saturate here, leaving slack bits so racing
    /// `retain` calls can overshoot and back off without wrapping.
    pub const MAX_REF: u64 = REF_MASK - 64;

    #[must_use]
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub fn to_raw(self) -> u64 {
        self.0
    }

    #[must_use]
    pub fn new(node_type: NodeType, location: NodeLocation, ref_count: u64) -> Self {
        debug_assert!(ref_count <= REF_MASK);
        Self(ref_count | ((node_type as u64) << TYPE_SHIFT) | ((location.offset() >> 3) << LOC_SHIFT))
    }

    /// Freelist link: a dead cell whose location bits hold the next free ID.
    #[must_use]
    pub fn freelist(next: NodeId) -> Self {
        Self(((NodeType::Free as u64) << TYPE_SHIFT) | (next.to_u64() << LOC_SHIFT))
    }

    /// Terminator of the freelist.
    #[must_use]
    pub fn freelist_end() -> Self {
        Self::freelist(NodeId::NULL)
    }

    #[must_use]
    pub fn ref_count(self) -> u64 {
        self.0 & REF_MASK
    }

    #[must_use]
    pub fn node_type(self) -> NodeType {
        NodeType::from_tag(((self.0 & TYPE_MASK) >> TYPE_SHIFT) as u8)
    }

    #[must_use]
    pub fn location(self) -> NodeLocation {
        NodeLocation::new((self.0 >> LOC_SHIFT) << 3)
    }

    /// For freelist cells: the next free ID.
    #[must_use]
    pub fn next_free(self) -> NodeId {
        NodeId::from_u64(self.0 >> LOC_SHIFT)
    }

    #[must_use]
    pub fn is_modifying(self) -> bool {
        self.0 & MODIFY_BIT != 0
    }

    #[must_use]
    pub fn with_location(self, location: NodeLocation) -> Self {
        let cleared = self.0 & ((1 << LOC_SHIFT) - 1);
        Self(cleared | ((location.offset() >> 3) << LOC_SHIFT))
    }

    /// Copy with the modify bit cleared; used when recovery sweeps away
    /// locks left behind by a crash.
    #[must_use]
    pub fn cleared_modify(self) -> Self {
        Self(self.0 & !MODIFY_BIT)
    }
}

impl std::fmt::Debug for Meta {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Meta")
            .field("ref", &self.ref_count())
            .field("type", &self.node_type())
            .field("loc", &self.location().offset())
            .field("modify", &self.is_modifying())
            .finish()
    }
}

/// One atomic metadata cell, shared by all sessions.
///
/// Location/type stores use release ordering and loads use acquire: that
/// pairing is what makes a node's header and payload visible to a reader
/// that follows the location pointer (the reader additionally re-checks
/// `header.id` to detect slot reuse).
#[repr(transparent)]
pub struct MetaCell(AtomicU64);

impl MetaCell {
    /// Reinterprets a shared atomic as a cell.
    #[must_use]
    pub fn from_atomic(atom: &AtomicU64) -> &Self {
        // SAFETY: repr(transparent) over AtomicU64
        unsafe { &*std::ptr::from_ref(atom).cast::<Self>() }
    }

    #[must_use]
    pub fn load(&self, ordering: Ordering) -> Meta {
        Meta::from_raw(self.0.load(ordering))
    }

    pub fn store(&self, meta: Meta, ordering: Ordering) {
        self.0.store(meta.to_raw(), ordering);
    }

    /// Increments the reference count.
    ///
    /// Returns `false` on saturation; the overshoot is rolled back and the
    /// caller must clone instead of sharing.
    #[must_use]
    pub fn retain(&self) -> bool {
        let prev = Meta::from_raw(self.0.fetch_add(1, Ordering::Acquire));
        debug_assert!(prev.ref_count() > 0, "retain of a dead cell");

        if prev.ref_count() >= Meta::MAX_REF {
            self.0.fetch_sub(1, Ordering::Release);
            return false;
        }
        true
    }

    /// Decrements the reference count, returning the state before the
    /// decrement. A previous count of 1 means the caller now owns the
    /// node's carcass and must free its children, bytes and ID.
    pub fn release(&self) -> Meta {
        let prev = Meta::from_raw(self.0.fetch_sub(1, Ordering::AcqRel));
        debug_assert!(prev.ref_count() > 0, "release of a dead cell");
        prev
    }

    /// Cheap pre-check for the relocation protocol: is the node still
    /// live, unlocked, and where the compactor last saw it?
    #[must_use]
    pub fn try_start_move(&self, expected: NodeLocation) -> bool {
        let cur = self.load(Ordering::Acquire);
        cur.ref_count() > 0 && !cur.is_modifying() && cur.location() == expected
    }

    /// Publishes a relocation: CAS the location from `from` to `to`.
    ///
    /// Fails if the node moved, died, or entered an in-place modification
    /// since `try_start_move`.
    #[must_use]
    pub fn try_move(&self, from: NodeLocation, to: NodeLocation) -> bool {
        let mut cur = self.load(Ordering::Acquire);
        loop {
            if cur.ref_count() == 0 || cur.is_modifying() || cur.location() != from {
                return false;
            }
            match self.0.compare_exchange_weak(
                cur.to_raw(),
                cur.with_location(to).to_raw(),
                Ordering::Release,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(raw) => cur = Meta::from_raw(raw),
            }
        }
    }

    /// Sets the modify bit, blocking relocation of this node.
    ///
    /// Returns the cell state observed at the moment the bit was taken.
    pub fn modify_begin(&self) -> Meta {
        let mut cur = self.load(Ordering::Acquire);
        loop {
            debug_assert!(!cur.is_modifying(), "modify lock is not re-entrant");
            match self.0.compare_exchange_weak(
                cur.to_raw(),
                cur.to_raw() | MODIFY_BIT,
                Ordering::Acquire,
                Ordering::Acquire,
            ) {
                Ok(raw) => return Meta::from_raw(raw | MODIFY_BIT),
                Err(raw) => cur = Meta::from_raw(raw),
            }
        }
    }

    /// Clears the modify bit, re-allowing relocation.
    pub fn modify_end(&self) {
        let prev = self.0.fetch_and(!MODIFY_BIT, Ordering::Release);
        debug_assert!(prev & MODIFY_BIT != 0, "modify_end without modify_begin");
    }
}

impl std::fmt::Debug for MetaCell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.load(Ordering::Relaxed).fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meta_round_trip() {
        let loc = NodeLocation::new(0x1234_5678 * 8);
        let meta = Meta::new(NodeType::Setlist, loc, 3);

        assert_eq!(3, meta.ref_count());
        assert_eq!(NodeType::Setlist, meta.node_type());
        assert_eq!(loc, meta.location());
        assert!(!meta.is_modifying());

        let moved = meta.with_location(NodeLocation::new(64));
        assert_eq!(64, moved.location().offset());
        assert_eq!(3, moved.ref_count());
        assert_eq!(NodeType::Setlist, moved.node_type());
    }

    #[test]
    fn meta_freelist_links() {
        let link = Meta::freelist(NodeId::from_u64(42));
        assert_eq!(0, link.ref_count());
        assert_eq!(NodeType::Free, link.node_type());
        assert_eq!(42, link.next_free().to_u64());

        assert!(Meta::freelist_end().next_free().is_null());
    }

    #[test]
    fn cell_retain_saturates() {
        let atom = AtomicU64::new(
            Meta::new(NodeType::Value, NodeLocation::new(0), Meta::MAX_REF).to_raw(),
        );
        let cell = MetaCell::from_atomic(&atom);

        assert!(!cell.retain());
        assert_eq!(Meta::MAX_REF, cell.load(Ordering::Relaxed).ref_count());
    }

    #[test]
    fn cell_move_protocol() {
        let a = NodeLocation::new(0);
        let b = NodeLocation::new(4_096);

        let atom = AtomicU64::new(Meta::new(NodeType::Binary, a, 1).to_raw());
        let cell = MetaCell::from_atomic(&atom);

        assert!(cell.try_start_move(a));
        assert!(cell.try_move(a, b));
        assert_eq!(b, cell.load(Ordering::Relaxed).location());

        // second publish from the stale location must fail
        assert!(!cell.try_move(a, b));

        // the modify bit blocks relocation
        cell.modify_begin();
        assert!(!cell.try_start_move(b));
        assert!(!cell.try_move(b, a));
        cell.modify_end();
        assert!(cell.try_move(b, a));
    }

    #[test]
    fn cell_release_reports_last_owner() {
        let atom = AtomicU64::new(Meta::new(NodeType::Value, NodeLocation::new(8), 2).to_raw());
        let cell = MetaCell::from_atomic(&atom);

        assert_eq!(2, cell.release().ref_count());
        assert_eq!(1, cell.release().ref_count());
        assert_eq!(0, cell.load(Ordering::Relaxed).ref_count());
    }
}
