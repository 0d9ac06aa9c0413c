// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The binary node: a sorted array of (key, value-ID) pairs.
//!
//! Binary nodes are the leaf containers of the trie. The payload is a
//! count, a table of 16-bit entry offsets in key order, and the entries
//! themselves: `{value_id: u64, key_len: u16, key bytes}`. Lookups are a
//! binary search over the offset table.
//!
//! Layout changes always rebuild the node; only the value-ID slot of an
//! existing entry is ever patched in place.

use super::coding::{read_id, read_u16, write_id, write_u16};
use super::{NodeHeader, NodeId, NodeType, HEADER_SIZE};
use crate::{Error, Result};

const NUM_OFF: usize = HEADER_SIZE;
const TABLE_OFF: usize = HEADER_SIZE + 4;

/// Fixed per-entry cost next to the key bytes: value ID, key length, and
/// the offset-table slot.
pub const ENTRY_OVERHEAD: usize = 8 + 2 + 2;

/// View over a binary node.
#[derive(Clone, Copy)]
pub struct BinaryView<'a> {
    bytes: &'a [u8],
    num: usize,
}

impl<'a> BinaryView<'a> {
    pub fn new(bytes: &'a [u8]) -> Result<Self> {
        let size = NodeHeader::read(bytes).size as usize;
        if size < TABLE_OFF || size > bytes.len() {
            return Err(Error::Corruption("binary node size out of bounds"));
        }
        let num = read_u16(bytes, NUM_OFF) as usize;
        if TABLE_OFF + num * 2 > size {
            return Err(Error::Corruption("binary node offset table out of bounds"));
        }
        Ok(Self {
            bytes: &bytes[..size],
            num,
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.num
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.num == 0
    }

    fn entry_offset(&self, index: usize) -> usize {
        debug_assert!(index < self.num);
        read_u16(self.bytes, TABLE_OFF + index * 2) as usize
    }

    #[must_use]
    pub fn key(&self, index: usize) -> &'a [u8] {
        let off = self.entry_offset(index);
        let klen = read_u16(self.bytes, off + 8) as usize;
        &self.bytes[off + 10..off + 10 + klen]
    }

    #[must_use]
    pub fn value_id(&self, index: usize) -> NodeId {
        read_id(self.bytes, self.entry_offset(index))
    }

    /// Byte offset (within the node) of an entry's value-ID slot, for
    /// in-place replacement under a modify guard.
    #[must_use]
    pub fn value_slot_offset(&self, index: usize) -> usize {
        self.entry_offset(index)
    }

    /// Binary search; `Err` carries the insertion point.
    pub fn search(&self, key: &[u8]) -> std::result::Result<usize, usize> {
        let mut lo = 0;
        let mut hi = self.num;
        while lo < hi {
            let mid = (lo + hi) / 2;
            match self.key(mid).cmp(key) {
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
                std::cmp::Ordering::Equal => return Ok(mid),
            }
        }
        Err(lo)
    }

    /// All entries in key order.
    pub fn entries(&self) -> impl Iterator<Item = (&'a [u8], NodeId)> + '_ {
        (0..self.num).map(|i| (self.key(i), self.value_id(i)))
    }

    /// Sum of key lengths, used for layout computations during rebuilds.
    #[must_use]
    pub fn keys_byte_len(&self) -> usize {
        (0..self.num).map(|i| self.key(i).len()).sum()
    }
}

/// Total node size for the given entry count and summed key length.
#[must_use]
pub fn layout_size(num: usize, keys_byte_len: usize) -> u32 {
    (TABLE_OFF + num * ENTRY_OVERHEAD + keys_byte_len) as u32
}

/// Node size after inserting one more key of `key_len` bytes.
#[must_use]
pub fn layout_size_after_insert(view: &BinaryView<'_>, key_len: usize) -> u32 {
    layout_size(view.len() + 1, view.keys_byte_len() + key_len)
}

/// Writes a complete binary node from entries already in key order.
pub fn write_new<'e>(
    buf: &mut [u8],
    id: NodeId,
    version: u64,
    entries: impl ExactSizeIterator<Item = (&'e [u8], NodeId)>,
) {
    let num = entries.len();
    debug_assert!(num <= crate::config::BINARY_NODE_MAX_KEYS);

    let mut cursor = TABLE_OFF + num * 2;
    let mut prev_key: Option<Vec<u8>> = None;

    write_u16(buf, NUM_OFF, num as u16);
    write_u16(buf, NUM_OFF + 2, 0);

    for (index, (key, vid)) in entries.enumerate() {
        if cfg!(debug_assertions) {
            if let Some(p) = &prev_key {
                debug_assert!(p.as_slice() < key, "binary entries must be sorted");
            }
            prev_key = Some(key.to_vec());
        }

        write_u16(buf, TABLE_OFF + index * 2, cursor as u16);
        write_id(buf, cursor, vid);
        write_u16(buf, cursor + 8, key.len() as u16);
        buf[cursor + 10..cursor + 10 + key.len()].copy_from_slice(key);
        cursor += 10 + key.len();
    }

    NodeHeader::new(NodeType::Binary, cursor as u32, id, version).write_to(buf);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(entries: &[(&[u8], u64)]) -> Vec<u8> {
        let keys: usize = entries.iter().map(|(k, _)| k.len()).sum();
        let size = layout_size(entries.len(), keys);
        let mut buf = vec![0u8; super::super::capacity_of(size) as usize];
        write_new(
            &mut buf,
            NodeId::from_u64(1),
            0,
            entries
                .iter()
                .map(|(k, v)| (*k, NodeId::from_u64(*v)))
                .collect::<Vec<_>>()
                .into_iter(),
        );
        buf
    }

    #[test]
    fn search_and_iterate() -> crate::Result<()> {
        let buf = build(&[(b"", 9), (b"apple", 10), (b"banana", 11), (b"cherry", 12)]);
        let view = BinaryView::new(&buf)?;

        assert_eq!(4, view.len());
        assert_eq!(Ok(0), view.search(b""));
        assert_eq!(Ok(2), view.search(b"banana"));
        assert_eq!(Err(2), view.search(b"avocado"));
        assert_eq!(Err(4), view.search(b"zzz"));

        assert_eq!(NodeId::from_u64(11), view.value_id(2));
        assert_eq!(b"cherry", view.key(3));

        let collected: Vec<_> = view.entries().map(|(k, _)| k.to_vec()).collect();
        assert_eq!(
            vec![b"".to_vec(), b"apple".to_vec(), b"banana".to_vec(), b"cherry".to_vec()],
            collected,
        );

        Ok(())
    }

    #[test]
    fn layout_matches_written_size() -> crate::Result<()> {
        let buf = build(&[(b"a", 1), (b"bb", 2)]);
        let view = BinaryView::new(&buf)?;
        let header = NodeHeader::read(&buf);

        assert_eq!(layout_size(2, 3), header.size);
        assert_eq!(3, view.keys_byte_len());
        assert_eq!(layout_size(3, 6), layout_size_after_insert(&view, 3));

        Ok(())
    }
}
