// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Typed node layouts.
//!
//! Every node starts with a fixed [`NodeHeader`], followed by a
//! type-specific payload. Node bytes live in mapped segments and are
//! parsed as little-endian fields through plain slices, so no layout
//! ever requires an aligned pointer. The next node begins at the next
//! 8-byte boundary after `size` (which itself need not be a multiple
//! of 8).

pub mod binary;
pub mod full;
pub mod setlist;
pub mod value;

use crate::checksum::Checksum;
use bytemuck::{Pod, Zeroable};

/// A stable 40-bit node identifier; 0 is the null ID.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u64);

impl NodeId {
    /// The reserved null ID
    pub const NULL: Self = Self(0);

    #[must_use]
    #[doc(hidden)]
    pub fn from_u64(raw: u64) -> Self {
        debug_assert!(raw < (1 << 40), "node IDs are 40-bit");
        Self(raw)
    }

    #[must_use]
    #[doc(hidden)]
    pub fn to_u64(self) -> u64 {
        self.0
    }

    /// Whether this is the null ID
    #[must_use]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Node type tag, stored in both the metadata cell and the node header
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum NodeType {
    /// Dead cell linked into the ID freelist
    Free = 0,

    /// Opaque byte payload
    Value = 1,

    /// Sorted (key, value-ID) leaf container
    Binary = 2,

    /// Inner node with a sorted branch-byte list
    Setlist = 3,

    /// Inner node with 256 direct child slots
    Full = 4,

    /// Allocated but not yet initialized
    Undefined = 5,
}

impl NodeType {
    #[must_use]
    pub(crate) fn from_tag(tag: u8) -> Self {
        match tag {
            0 => Self::Free,
            1 => Self::Value,
            2 => Self::Binary,
            3 => Self::Setlist,
            4 => Self::Full,
            _ => Self::Undefined,
        }
    }

    /// Whether nodes of this type reference children by ID.
    #[must_use]
    pub(crate) fn is_inner(self) -> bool {
        matches!(self, Self::Binary | Self::Setlist | Self::Full)
    }
}

/// Set while a node's bytes differ from its stored checksum.
///
/// The flag bits live above the low 3 type-tag bits of `tag`.
pub const FLAG_DIRTY: u16 = 1 << 8;

/// Set once the node has been fully covered by an msync.
pub const FLAG_SYNCED: u16 = 1 << 9;

/// Fixed 40-byte header at the start of every node region.
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
#[repr(C)]
pub struct NodeHeader {
    /// xxhash-64 over everything after this field; 0 while deferred
    pub checksum: u64,

    /// Total node size in bytes, header included
    pub size: u32,

    /// Low 3 bits: [`NodeType`] tag; bits 8/9: the dirty-flag pair
    pub tag: u16,

    reserved: u16,

    /// Owning node ID; readers re-check this against the ID they asked for
    pub id: u64,

    /// ID of the node this one superseded within its transaction, if any
    pub prev: u64,

    /// Write-session clone version at creation time
    pub version: u64,
}

/// Size of [`NodeHeader`] in bytes
pub const HEADER_SIZE: usize = std::mem::size_of::<NodeHeader>();

/// Bytes actually reserved for a node of `size` bytes: its region is
/// padded out to the next 8-byte boundary.
#[must_use]
pub fn capacity_of(size: u32) -> u32 {
    (size + 7) & !7
}

impl NodeHeader {
    #[must_use]
    pub fn new(node_type: NodeType, size: u32, id: NodeId, version: u64) -> Self {
        Self {
            checksum: 0,
            size,
            tag: node_type as u16 | FLAG_DIRTY,
            reserved: 0,
            id: id.to_u64(),
            prev: 0,
            version,
        }
    }

    /// Copies a header out of a node region.
    ///
    /// The copy is deliberate: the source bytes may be concurrently
    /// recycled, and the reader validates `id` on the copy afterwards.
    #[must_use]
    pub fn read(node_bytes: &[u8]) -> Self {
        bytemuck::pod_read_unaligned(&node_bytes[..HEADER_SIZE])
    }

    pub fn write_to(&self, node_bytes: &mut [u8]) {
        node_bytes[..HEADER_SIZE].copy_from_slice(bytemuck::bytes_of(self));
    }

    #[must_use]
    pub fn node_type(&self) -> NodeType {
        NodeType::from_tag((self.tag & 0b111) as u8)
    }

    #[must_use]
    pub fn node_id(&self) -> NodeId {
        NodeId::from_u64(self.id & ((1 << 40) - 1))
    }

    #[must_use]
    pub fn capacity(&self) -> u32 {
        capacity_of(self.size)
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.tag & FLAG_DIRTY != 0
    }
}

/// Computes the checksum of a whole node region (header + payload,
/// excluding the checksum field itself).
#[must_use]
pub fn checksum_node(node_bytes: &[u8]) -> Checksum {
    let size = NodeHeader::read(node_bytes).size as usize;
    Checksum::compute(&node_bytes[8..size])
}

/// Writes a freshly computed checksum into a node region and clears the
/// dirty flag.
///
/// The flags sit inside the covered region, so they are finalized before
/// the hash runs.
pub fn update_checksum(node_bytes: &mut [u8]) {
    let tag = u16::from_le_bytes([node_bytes[12], node_bytes[13]]) & !FLAG_DIRTY;
    node_bytes[12..14].copy_from_slice(&tag.to_le_bytes());

    let sum = checksum_node(node_bytes).into_u64();
    node_bytes[0..8].copy_from_slice(&sum.to_le_bytes());
}

/// Blanks the checksum (deferred policies) and marks the node dirty.
pub fn clear_checksum(node_bytes: &mut [u8]) {
    node_bytes[0..8].copy_from_slice(&0u64.to_le_bytes());

    let tag = (u16::from_le_bytes([node_bytes[12], node_bytes[13]]) | FLAG_DIRTY) & !FLAG_SYNCED;
    node_bytes[12..14].copy_from_slice(&tag.to_le_bytes());
}

/// Records that the node's bytes are fully covered by an msync.
pub fn mark_synced(node_bytes: &mut [u8]) {
    let tag = u16::from_le_bytes([node_bytes[12], node_bytes[13]]) | FLAG_SYNCED;
    node_bytes[12..14].copy_from_slice(&tag.to_le_bytes());
}

/// Verifies a node's stored checksum, treating 0 as "deferred, not
/// checkable".
pub fn verify_checksum(node_bytes: &[u8]) -> crate::Result<()> {
    let stored = Checksum::from_raw(NodeHeader::read(node_bytes).checksum);
    if stored.is_deferred() {
        return Ok(());
    }
    checksum_node(node_bytes).check(stored)
}

pub(crate) mod coding {
    //! Little-endian field access within node payloads.

    use super::NodeId;
    use byteorder::{ByteOrder, LittleEndian};

    pub fn read_u16(bytes: &[u8], offset: usize) -> u16 {
        LittleEndian::read_u16(&bytes[offset..offset + 2])
    }

    pub fn write_u16(bytes: &mut [u8], offset: usize, value: u16) {
        LittleEndian::write_u16(&mut bytes[offset..offset + 2], value);
    }

    pub fn read_u64(bytes: &[u8], offset: usize) -> u64 {
        LittleEndian::read_u64(&bytes[offset..offset + 8])
    }

    pub fn write_u64(bytes: &mut [u8], offset: usize, value: u64) {
        LittleEndian::write_u64(&mut bytes[offset..offset + 8], value);
    }

    pub fn read_id(bytes: &[u8], offset: usize) -> NodeId {
        NodeId::from_u64(read_u64(bytes, offset))
    }

    pub fn write_id(bytes: &mut [u8], offset: usize, id: NodeId) {
        write_u64(bytes, offset, id.to_u64());
    }
}

/// Longest shared prefix of two keys.
#[must_use]
pub fn common_prefix<'a>(a: &'a [u8], b: &[u8]) -> &'a [u8] {
    let len = a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count();
    &a[..len]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let mut buf = vec![0u8; 64];
        let header = NodeHeader::new(NodeType::Binary, 61, NodeId::from_u64(99), 7);
        header.write_to(&mut buf);

        let back = NodeHeader::read(&buf);
        assert_eq!(61, back.size);
        assert_eq!(64, back.capacity());
        assert_eq!(NodeType::Binary, back.node_type());
        assert_eq!(99, back.node_id().to_u64());
        assert_eq!(7, back.version);
        assert!(back.is_dirty());
    }

    #[test]
    fn flags_do_not_disturb_the_type_tag() {
        for node_type in [
            NodeType::Value,
            NodeType::Binary,
            NodeType::Setlist,
            NodeType::Full,
        ] {
            // a fresh header starts dirty, without losing its type
            let header = NodeHeader::new(node_type, 48, NodeId::from_u64(5), 1);
            assert_eq!(node_type, header.node_type());
            assert!(header.is_dirty());

            let mut buf = vec![0u8; 48];
            header.write_to(&mut buf);

            update_checksum(&mut buf);
            assert_eq!(node_type, NodeHeader::read(&buf).node_type());
            assert!(!NodeHeader::read(&buf).is_dirty());

            clear_checksum(&mut buf);
            assert_eq!(node_type, NodeHeader::read(&buf).node_type());
            assert!(NodeHeader::read(&buf).is_dirty());

            mark_synced(&mut buf);
            assert_eq!(node_type, NodeHeader::read(&buf).node_type());
        }
    }

    #[test]
    fn checksum_covers_payload() {
        let mut buf = vec![0u8; 64];
        let header = NodeHeader::new(NodeType::Value, 48, NodeId::from_u64(1), 0);
        header.write_to(&mut buf);
        buf[HEADER_SIZE..48].fill(0xab);

        update_checksum(&mut buf);
        assert!(verify_checksum(&buf).is_ok());
        assert!(!NodeHeader::read(&buf).is_dirty());

        buf[47] ^= 1;
        assert!(verify_checksum(&buf).is_err());

        // padding bytes are not covered
        buf[47] ^= 1;
        buf[50] = 0xff;
        assert!(verify_checksum(&buf).is_ok());

        clear_checksum(&mut buf);
        assert!(verify_checksum(&buf).is_ok()); // deferred, not checkable
        assert!(NodeHeader::read(&buf).is_dirty());
    }

    #[test]
    fn common_prefix_basics() {
        assert_eq!(b"ab", common_prefix(b"abc", b"abd"));
        assert_eq!(b"", common_prefix(b"x", b"y"));
        assert_eq!(b"ab", common_prefix(b"ab", b"abc"));
    }
}
