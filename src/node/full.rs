// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The full inner node: 256 direct child slots.
//!
//! Once a setlist crosses the branching threshold, dispatch by direct
//! indexing beats scanning branch bytes, at the cost of 2 KiB of slots.

use super::coding::{read_id, read_u16, read_u64, write_id, write_u16, write_u64};
use super::{NodeHeader, NodeId, NodeType, HEADER_SIZE};
use crate::{Error, Result};

const NUM_OFF: usize = HEADER_SIZE;
const PREFIX_CAP_OFF: usize = HEADER_SIZE + 2;
const PREFIX_LEN_OFF: usize = HEADER_SIZE + 4;
const EOF_OFF: usize = HEADER_SIZE + 8;
const DESC_OFF: usize = HEADER_SIZE + 16;
const PREFIX_OFF: usize = HEADER_SIZE + 24;

/// View over a full node.
#[derive(Clone, Copy)]
pub struct FullView<'a> {
    bytes: &'a [u8],
    prefix_cap: usize,
}

impl<'a> FullView<'a> {
    pub fn new(bytes: &'a [u8]) -> Result<Self> {
        let size = NodeHeader::read(bytes).size as usize;
        if size < PREFIX_OFF || size > bytes.len() {
            return Err(Error::Corruption("full node size out of bounds"));
        }

        let prefix_cap = read_u16(bytes, PREFIX_CAP_OFF) as usize;
        if PREFIX_OFF + prefix_cap + 256 * 8 > size {
            return Err(Error::Corruption("full node slots out of bounds"));
        }

        Ok(Self {
            bytes: &bytes[..size],
            prefix_cap,
        })
    }

    /// Count of occupied child slots.
    #[must_use]
    pub fn num_branches(&self) -> usize {
        read_u16(self.bytes, NUM_OFF) as usize
    }

    #[must_use]
    pub fn prefix(&self) -> &'a [u8] {
        let len = read_u16(self.bytes, PREFIX_LEN_OFF) as usize;
        &self.bytes[PREFIX_OFF..PREFIX_OFF + len]
    }

    #[must_use]
    pub fn eof_value(&self) -> NodeId {
        read_id(self.bytes, EOF_OFF)
    }

    #[must_use]
    pub fn descendants(&self) -> u64 {
        read_u64(self.bytes, DESC_OFF)
    }

    fn slots_off(&self) -> usize {
        PREFIX_OFF + self.prefix_cap
    }

    #[must_use]
    pub fn child(&self, byte: u8) -> NodeId {
        read_id(self.bytes, self.slots_off() + byte as usize * 8)
    }

    /// First occupied slot with byte >= `byte`.
    #[must_use]
    pub fn lower_bound(&self, byte: u8) -> Option<(u8, NodeId)> {
        (byte..=255).find_map(|b| {
            let child = self.child(b);
            (!child.is_null()).then_some((b, child))
        })
    }

    /// Last occupied slot with byte <= `byte`.
    #[must_use]
    pub fn upper_bound_back(&self, byte: u8) -> Option<(u8, NodeId)> {
        (0..=byte).rev().find_map(|b| {
            let child = self.child(b);
            (!child.is_null()).then_some((b, child))
        })
    }

    /// All occupied (branch byte, child) pairs in byte order.
    pub fn branches(&self) -> impl Iterator<Item = (u8, NodeId)> + '_ {
        (0u16..256).filter_map(|b| {
            let child = self.child(b as u8);
            (!child.is_null()).then_some((b as u8, child))
        })
    }

    #[must_use]
    pub fn child_slot_offset(&self, byte: u8) -> usize {
        self.slots_off() + byte as usize * 8
    }

    #[must_use]
    pub fn eof_slot_offset(&self) -> usize {
        EOF_OFF
    }

    #[must_use]
    pub fn descendants_slot_offset(&self) -> usize {
        DESC_OFF
    }

    #[must_use]
    pub fn num_slot_offset(&self) -> usize {
        NUM_OFF
    }
}

/// Total node size for a prefix capacity.
#[must_use]
pub fn layout_size(prefix_cap: usize) -> u32 {
    (PREFIX_OFF + prefix_cap + 256 * 8) as u32
}

/// Writes a complete full node from branches already in byte order.
pub fn write_new(
    buf: &mut [u8],
    id: NodeId,
    version: u64,
    prefix: &[u8],
    eof_value: NodeId,
    descendants: u64,
    branches: &[(u8, NodeId)],
) {
    let size = layout_size(prefix.len());
    debug_assert!(buf.len() >= size as usize);

    write_u16(buf, NUM_OFF, branches.len() as u16);
    write_u16(buf, PREFIX_CAP_OFF, prefix.len() as u16);
    write_u16(buf, PREFIX_LEN_OFF, prefix.len() as u16);
    write_u16(buf, PREFIX_LEN_OFF + 2, 0);
    write_id(buf, EOF_OFF, eof_value);
    write_u64(buf, DESC_OFF, descendants);
    buf[PREFIX_OFF..PREFIX_OFF + prefix.len()].copy_from_slice(prefix);

    let slots_off = PREFIX_OFF + prefix.len();
    buf[slots_off..slots_off + 256 * 8].fill(0);
    for (byte, child) in branches {
        write_id(buf, slots_off + *byte as usize * 8, *child);
    }

    NodeHeader::new(NodeType::Full, size, id, version).write_to(buf);
}

/// Truncates the stored prefix in place to one of its suffixes.
pub fn truncate_prefix_in_place(node_bytes: &mut [u8], new_len: usize) {
    let old_len = read_u16(node_bytes, PREFIX_LEN_OFF) as usize;
    debug_assert!(new_len <= old_len);

    let start = PREFIX_OFF + (old_len - new_len);
    node_bytes.copy_within(start..PREFIX_OFF + old_len, PREFIX_OFF);
    write_u16(node_bytes, PREFIX_LEN_OFF, new_len as u16);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_dispatch() -> crate::Result<()> {
        let size = layout_size(2);
        let mut buf = vec![0u8; super::super::capacity_of(size) as usize];
        write_new(
            &mut buf,
            NodeId::from_u64(3),
            0,
            b"xy",
            NodeId::NULL,
            5,
            &[(0, NodeId::from_u64(20)), (b'm', NodeId::from_u64(21)), (255, NodeId::from_u64(22))],
        );

        let view = FullView::new(&buf)?;
        assert_eq!(3, view.num_branches());
        assert_eq!(b"xy", view.prefix());
        assert!(view.eof_value().is_null());

        assert_eq!(NodeId::from_u64(21), view.child(b'm'));
        assert!(view.child(b'n').is_null());

        assert_eq!(Some((b'm', NodeId::from_u64(21))), view.lower_bound(1));
        assert_eq!(Some((255, NodeId::from_u64(22))), view.lower_bound(b'n'));
        assert_eq!(Some((0, NodeId::from_u64(20))), view.upper_bound_back(b'l'));

        let all: Vec<u8> = view.branches().map(|(b, _)| b).collect();
        assert_eq!(vec![0, b'm', 255], all);

        Ok(())
    }
}
