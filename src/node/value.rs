// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{NodeHeader, NodeId, NodeType, HEADER_SIZE};
use crate::{Error, Result};

/// View over a value node: an opaque byte payload.
pub struct ValueView<'a> {
    bytes: &'a [u8],
    size: usize,
}

impl<'a> ValueView<'a> {
    pub fn new(bytes: &'a [u8]) -> Result<Self> {
        let size = NodeHeader::read(bytes).size as usize;
        if size < HEADER_SIZE || size > bytes.len() {
            return Err(Error::Corruption("value node size out of bounds"));
        }
        Ok(Self { bytes, size })
    }

    #[must_use]
    pub fn value(&self) -> &'a [u8] {
        &self.bytes[HEADER_SIZE..self.size]
    }

    #[must_use]
    pub fn value_len(&self) -> usize {
        self.size - HEADER_SIZE
    }
}

/// Total node size for a value of `value_len` bytes.
#[must_use]
pub fn layout_size(value_len: usize) -> u32 {
    (HEADER_SIZE + value_len) as u32
}

/// Writes a complete value node into `buf`.
pub fn write_new(buf: &mut [u8], id: NodeId, version: u64, value: &[u8]) {
    let size = layout_size(value.len());
    debug_assert!(buf.len() >= size as usize);

    NodeHeader::new(NodeType::Value, size, id, version).write_to(buf);
    buf[HEADER_SIZE..HEADER_SIZE + value.len()].copy_from_slice(value);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_round_trip() -> crate::Result<()> {
        let size = layout_size(11) as usize;
        let mut buf = vec![0u8; super::super::capacity_of(size as u32) as usize];
        write_new(&mut buf, NodeId::from_u64(7), 1, b"hello world");

        let view = ValueView::new(&buf)?;
        assert_eq!(b"hello world", view.value());
        assert_eq!(11, view.value_len());

        Ok(())
    }
}
