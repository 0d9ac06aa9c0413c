// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The setlist inner node: a compressed prefix, an optional end-of-prefix
//! value, and a sorted list of (branch byte, child ID) pairs.
//!
//! The prefix region is sized by a separate capacity field so a prefix
//! split can truncate it in place (the truncated prefix is always a
//! suffix of the old one), without shifting the branch arrays.

use super::coding::{read_id, read_u16, read_u64, write_id, write_u16, write_u64};
use super::{NodeHeader, NodeId, NodeType, HEADER_SIZE};
use crate::{Error, Result};

const NUM_OFF: usize = HEADER_SIZE;
const PREFIX_CAP_OFF: usize = HEADER_SIZE + 2;
const PREFIX_LEN_OFF: usize = HEADER_SIZE + 4;
const EOF_OFF: usize = HEADER_SIZE + 8;
const DESC_OFF: usize = HEADER_SIZE + 16;
const PREFIX_OFF: usize = HEADER_SIZE + 24;

/// View over a setlist node.
#[derive(Clone, Copy)]
pub struct SetlistView<'a> {
    bytes: &'a [u8],
    num: usize,
    prefix_cap: usize,
}

impl<'a> SetlistView<'a> {
    pub fn new(bytes: &'a [u8]) -> Result<Self> {
        let size = NodeHeader::read(bytes).size as usize;
        if size < PREFIX_OFF || size > bytes.len() {
            return Err(Error::Corruption("setlist node size out of bounds"));
        }

        let num = read_u16(bytes, NUM_OFF) as usize;
        let prefix_cap = read_u16(bytes, PREFIX_CAP_OFF) as usize;
        if PREFIX_OFF + prefix_cap + num * 9 > size {
            return Err(Error::Corruption("setlist node arrays out of bounds"));
        }

        Ok(Self {
            bytes: &bytes[..size],
            num,
            prefix_cap,
        })
    }

    #[must_use]
    pub fn num_branches(&self) -> usize {
        self.num
    }

    #[must_use]
    pub fn prefix(&self) -> &'a [u8] {
        let len = read_u16(self.bytes, PREFIX_LEN_OFF) as usize;
        &self.bytes[PREFIX_OFF..PREFIX_OFF + len]
    }

    /// End-of-prefix value node, for the key that ends exactly here.
    #[must_use]
    pub fn eof_value(&self) -> NodeId {
        read_id(self.bytes, EOF_OFF)
    }

    /// Number of keys stored in this subtree.
    #[must_use]
    pub fn descendants(&self) -> u64 {
        read_u64(self.bytes, DESC_OFF)
    }

    fn branches_off(&self) -> usize {
        PREFIX_OFF + self.prefix_cap
    }

    fn children_off(&self) -> usize {
        self.branches_off() + self.num
    }

    #[must_use]
    pub fn branch_byte(&self, index: usize) -> u8 {
        debug_assert!(index < self.num);
        self.bytes[self.branches_off() + index]
    }

    #[must_use]
    pub fn child(&self, index: usize) -> NodeId {
        debug_assert!(index < self.num);
        read_id(self.bytes, self.children_off() + index * 8)
    }

    /// Exact branch lookup.
    #[must_use]
    pub fn find(&self, byte: u8) -> Option<usize> {
        let branches = &self.bytes[self.branches_off()..self.branches_off() + self.num];
        branches.binary_search(&byte).ok()
    }

    /// First branch with byte >= `byte`.
    #[must_use]
    pub fn lower_bound(&self, byte: u8) -> Option<usize> {
        let branches = &self.bytes[self.branches_off()..self.branches_off() + self.num];
        let index = match branches.binary_search(&byte) {
            Ok(i) | Err(i) => i,
        };
        (index < self.num).then_some(index)
    }

    /// All (branch byte, child) pairs in branch order.
    pub fn branches(&self) -> impl Iterator<Item = (u8, NodeId)> + '_ {
        (0..self.num).map(|i| (self.branch_byte(i), self.child(i)))
    }

    /// Byte offset of a child-ID slot, for in-place patching.
    #[must_use]
    pub fn child_slot_offset(&self, index: usize) -> usize {
        self.children_off() + index * 8
    }

    /// Byte offset of the end-of-prefix value slot.
    #[must_use]
    pub fn eof_slot_offset(&self) -> usize {
        EOF_OFF
    }

    /// Byte offset of the descendant counter.
    #[must_use]
    pub fn descendants_slot_offset(&self) -> usize {
        DESC_OFF
    }
}

/// Total node size for a prefix capacity and branch count.
#[must_use]
pub fn layout_size(prefix_cap: usize, num: usize) -> u32 {
    (PREFIX_OFF + prefix_cap + num * 9) as u32
}

/// Writes a complete setlist node from branches already in byte order.
pub fn write_new(
    buf: &mut [u8],
    id: NodeId,
    version: u64,
    prefix: &[u8],
    eof_value: NodeId,
    descendants: u64,
    branches: &[(u8, NodeId)],
) {
    let num = branches.len();
    let size = layout_size(prefix.len(), num);
    debug_assert!(buf.len() >= size as usize);
    debug_assert!(branches.windows(2).all(|w| w[0].0 < w[1].0));

    write_u16(buf, NUM_OFF, num as u16);
    write_u16(buf, PREFIX_CAP_OFF, prefix.len() as u16);
    write_u16(buf, PREFIX_LEN_OFF, prefix.len() as u16);
    write_u16(buf, PREFIX_LEN_OFF + 2, 0);
    write_id(buf, EOF_OFF, eof_value);
    write_u64(buf, DESC_OFF, descendants);
    buf[PREFIX_OFF..PREFIX_OFF + prefix.len()].copy_from_slice(prefix);

    let branches_off = PREFIX_OFF + prefix.len();
    let children_off = branches_off + num;
    for (index, (byte, child)) in branches.iter().enumerate() {
        buf[branches_off + index] = *byte;
        write_id(buf, children_off + index * 8, *child);
    }

    NodeHeader::new(NodeType::Setlist, size, id, version).write_to(buf);
}

/// Truncates the stored prefix in place to one of its suffixes.
///
/// Arrays after the prefix region do not move: the capacity field keeps
/// the region width, only the length and content change.
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

    fn build(prefix: &[u8], eof: u64, branches: &[(u8, u64)]) -> Vec<u8> {
        let size = layout_size(prefix.len(), branches.len());
        let mut buf = vec![0u8; super::super::capacity_of(size) as usize];
        let branches: Vec<_> = branches
            .iter()
            .map(|(b, c)| (*b, NodeId::from_u64(*c)))
            .collect();
        write_new(
            &mut buf,
            NodeId::from_u64(2),
            0,
            prefix,
            NodeId::from_u64(eof),
            42,
            &branches,
        );
        buf
    }

    #[test]
    fn lookup_and_bounds() -> crate::Result<()> {
        let buf = build(b"pre", 7, &[(b'a', 10), (b'c', 11), (b'x', 12)]);
        let view = SetlistView::new(&buf)?;

        assert_eq!(b"pre", view.prefix());
        assert_eq!(NodeId::from_u64(7), view.eof_value());
        assert_eq!(42, view.descendants());
        assert_eq!(3, view.num_branches());

        assert_eq!(Some(1), view.find(b'c'));
        assert_eq!(None, view.find(b'b'));

        assert_eq!(Some(0), view.lower_bound(0));
        assert_eq!(Some(1), view.lower_bound(b'b'));
        assert_eq!(Some(2), view.lower_bound(b'd'));
        assert_eq!(None, view.lower_bound(b'y'));

        assert_eq!(NodeId::from_u64(12), view.child(2));

        Ok(())
    }

    #[test]
    fn prefix_truncation_preserves_branches() -> crate::Result<()> {
        let mut buf = build(b"abcdef", 0, &[(b'q', 3), (b'r', 4)]);

        truncate_prefix_in_place(&mut buf, 2);

        let view = SetlistView::new(&buf)?;
        assert_eq!(b"ef", view.prefix());
        assert_eq!(Some(0), view.find(b'q'));
        assert_eq!(NodeId::from_u64(4), view.child(1));

        Ok(())
    }
}
