// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The node-metadata table: a memory-mapped file of atomic 64-bit cells,
//! one per node ID.
//!
//! The file starts with a 4 KiB header `{magic, block_size, next_alloc,
//! end_id, freelist_head}`, followed by cell blocks appended in 128 MiB
//! steps. Unused cells form a singly linked freelist threaded through the
//! cells themselves: a dead cell's location bits hold the next free ID,
//! and the list head lives in the header.
//!
//! `free_id` is two atomic operations and never blocks. `new_id` pops the
//! freelist under a small mutex (the CAS alone cannot defend against the
//! A-B-A of a concurrent pop/push of the same head) and falls back to
//! bumping `next_alloc`; only growing the mapped region takes the growth
//! mutex, and freshly mapped blocks are mlocked so metadata lookups never
//! page-fault on the read path.

use crate::config::ID_BLOCK_SIZE;
use crate::mapping::{BlockMap, Mapping};
use crate::meta::{Meta, MetaCell};
use crate::node::{NodeId, NodeType};
use crate::{Error, Result};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

const ID_MAGIC: [u8; 4] = [b'C', b'O', b'W', b'i'];

const HDR_MAGIC: usize = 0;
const HDR_BLOCK_SIZE: usize = 4;
const HDR_NEXT_ALLOC: usize = 8;
const HDR_END_ID: usize = 16;
const HDR_FREELIST: usize = 24;

const HEADER_LEN: usize = 4_096;

/// The L2 ID allocator.
pub struct IdTable {
    header: Mapping,
    blocks: BlockMap,
    max_objects: u64,
    alloc_mutex: Mutex<()>,
}

impl IdTable {
    /// Opens (or creates) the ID file inside `dir`.
    pub fn open(dir: &Path, max_objects: u64) -> Result<Self> {
        let path = dir.join("ids");
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let fresh = file.metadata()?.len() == 0;
        if fresh {
            file.set_len(HEADER_LEN as u64)?;
        }

        let header = Mapping::new(&file, 0, HEADER_LEN)?;
        let max_blocks = (max_objects * 8).div_ceil(ID_BLOCK_SIZE);
        let blocks = BlockMap::new(file, HEADER_LEN as u64, ID_BLOCK_SIZE, max_blocks.max(1))?;

        let this = Self {
            header,
            blocks,
            max_objects,
            alloc_mutex: Mutex::new(()),
        };

        if fresh {
            this.header.write_bytes(HDR_MAGIC, &ID_MAGIC);
            this.header
                .write_bytes(HDR_BLOCK_SIZE, &(ID_BLOCK_SIZE as u32).to_le_bytes());
            // ID 0 is reserved as null
            this.next_alloc().store(1, Ordering::Release);
            this.end_id()
                .store(this.blocks.count() * ID_BLOCK_SIZE / 8, Ordering::Release);
            this.freelist()
                .store(Meta::freelist_end().to_raw(), Ordering::Release);
            log::debug!("created ID file (max {max_objects} objects)");
        } else if this.header.slice()[HDR_MAGIC..HDR_MAGIC + 4] != ID_MAGIC {
            return Err(Error::Corruption("bad ID file magic"));
        }

        for block in 0..this.blocks.count() {
            this.blocks.lock_block_resident(block);
        }

        Ok(this)
    }

    fn next_alloc(&self) -> &AtomicU64 {
        self.header.atomic_u64(HDR_NEXT_ALLOC)
    }

    fn end_id(&self) -> &AtomicU64 {
        self.header.atomic_u64(HDR_END_ID)
    }

    fn freelist(&self) -> &AtomicU64 {
        self.header.atomic_u64(HDR_FREELIST)
    }

    /// Highest ID ever handed out, plus one.
    #[must_use]
    pub fn high_water(&self) -> u64 {
        self.next_alloc().load(Ordering::Acquire)
    }

    /// The metadata cell backing an ID.
    pub fn cell(&self, id: NodeId) -> Result<&MetaCell> {
        if id.is_null() || id.to_u64() >= self.end_id().load(Ordering::Acquire) {
            return Err(Error::Corruption("node ID outside the metadata table"));
        }

        let abs = id.to_u64() * 8;
        let atom = self
            .blocks
            .block_atomic_u64(abs / ID_BLOCK_SIZE, (abs & (ID_BLOCK_SIZE - 1)) as usize);
        Ok(MetaCell::from_atomic(atom))
    }

    /// Allocates an ID, initialized to `{ref: 1, type: undefined, loc: 0}`.
    ///
    /// Storing 0 into the returned cell would make the allocator consider
    /// the slot free and corrupt the freelist invariant; the caller must
    /// either publish a real location or `free_id` it.
    pub fn new_id(&self) -> Result<(NodeId, &MetaCell)> {
        let reused = {
            let _guard = self.alloc_mutex.lock()?;

            let mut head = Meta::from_raw(self.freelist().load(Ordering::Acquire));
            loop {
                let id = head.next_free();
                if id.is_null() {
                    break None;
                }

                let link = self.cell(id)?.load(Ordering::Relaxed);
                match self.freelist().compare_exchange(
                    head.to_raw(),
                    link.to_raw(),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => break Some(id),
                    Err(raw) => head = Meta::from_raw(raw),
                }
            }
        };

        let id = match reused {
            Some(id) => id,
            None => self.brand_new()?,
        };

        let cell = self.cell(id)?;
        cell.store(Meta::new(NodeType::Undefined, crate::meta::NodeLocation::new(0), 1), Ordering::Relaxed);
        Ok((id, cell))
    }

    fn brand_new(&self) -> Result<NodeId> {
        let raw = self.next_alloc().fetch_add(1, Ordering::Relaxed);
        if raw >= self.max_objects {
            self.next_alloc().fetch_sub(1, Ordering::Relaxed);
            return Err(Error::IdSpaceExhausted);
        }

        self.grow_for(raw)?;
        Ok(NodeId::from_u64(raw))
    }

    fn grow_for(&self, id: u64) -> Result<()> {
        if id < self.end_id().load(Ordering::Acquire) {
            return Ok(());
        }

        let want = ((id + 1) * 8).div_ceil(ID_BLOCK_SIZE);
        let before = self.blocks.count();
        self.blocks.ensure(want).map_err(|e| match e {
            Error::DatabaseFull => Error::IdSpaceExhausted,
            other => other,
        })?;

        for block in before..self.blocks.count() {
            self.blocks.lock_block_resident(block);
        }
        self.end_id()
            .store(self.blocks.count() * ID_BLOCK_SIZE / 8, Ordering::Release);

        Ok(())
    }

    /// Returns an ID to the freelist.
    ///
    /// The cell must already show a zero reference count.
    pub fn free_id(&self, id: NodeId) -> Result<()> {
        debug_assert!(!id.is_null());

        let cell = self.cell(id)?;
        debug_assert_eq!(0, cell.load(Ordering::Relaxed).ref_count());

        let new_head = Meta::freelist(id);
        let mut cur = self.freelist().load(Ordering::Acquire);
        loop {
            debug_assert_eq!(0, Meta::from_raw(cur).ref_count());
            cell.store(Meta::from_raw(cur), Ordering::Release);

            match self.freelist().compare_exchange_weak(
                cur,
                new_head.to_raw(),
                Ordering::Release,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(raw) => cur = raw,
            }
        }
    }

    /// Number of IDs whose reference count is nonzero.
    ///
    /// Diagnostic; pairs with the freelist to partition the ID space.
    #[must_use]
    pub fn count_ids_in_use(&self) -> u64 {
        let mut used = 0;
        for raw in 1..self.high_water() {
            if let Ok(cell) = self.cell(NodeId::from_u64(raw)) {
                if cell.load(Ordering::Relaxed).ref_count() > 0 {
                    used += 1;
                }
            }
        }
        used
    }

    /// Walks every allocated ID.
    ///
    /// IDs past the mapped end are skipped: a crash can persist a bumped
    /// `next_alloc` before the grown block becomes durable.
    pub(crate) fn for_each_cell(
        &self,
        mut f: impl FnMut(NodeId, &MetaCell) -> Result<()>,
    ) -> Result<()> {
        for raw in 1..self.high_water() {
            let id = NodeId::from_u64(raw);
            if let Ok(cell) = self.cell(id) {
                f(id, cell)?;
            }
        }
        Ok(())
    }

    /// Flushes the header and all cell blocks.
    pub fn flush(&self, blocking: bool) -> Result<()> {
        for block in 0..self.blocks.count() {
            self.blocks.flush_block(block, blocking)?;
        }
        if blocking {
            self.header.flush_range(0, HEADER_LEN)?;
        } else {
            self.header.flush_async_range(0, HEADER_LEN)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for IdTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "IdTable(high_water={}, end={})",
            self.high_water(),
            self.end_id().load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn ids_allocate_and_recycle() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let ids = IdTable::open(dir.path(), 1 << 20)?;

        let (a, cell_a) = ids.new_id()?;
        let (b, _) = ids.new_id()?;
        assert_eq!(1, a.to_u64());
        assert_eq!(2, b.to_u64());
        assert_eq!(1, cell_a.load(Ordering::Relaxed).ref_count());
        assert_eq!(2, ids.count_ids_in_use());

        // drop a's refcount to zero and recycle it
        cell_a.release();
        ids.free_id(a)?;
        assert_eq!(1, ids.count_ids_in_use());

        let (c, _) = ids.new_id()?;
        assert_eq!(a, c, "freed ID should be reused before fresh ones");
        assert_eq!(3, ids.new_id()?.0.to_u64());

        Ok(())
    }

    #[test]
    fn ids_freelist_is_lifo_chain() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let ids = IdTable::open(dir.path(), 1 << 20)?;

        let mut handed = Vec::new();
        for _ in 0..5 {
            let (id, _) = ids.new_id()?;
            handed.push(id);
        }
        for id in &handed {
            ids.cell(*id)?.release();
            ids.free_id(*id)?;
        }
        assert_eq!(0, ids.count_ids_in_use());

        // LIFO: the last freed comes back first
        for expect in handed.iter().rev() {
            let (id, _) = ids.new_id()?;
            assert_eq!(*expect, id);
        }

        Ok(())
    }

    #[test]
    fn ids_exhaustion_fails_cleanly() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let ids = IdTable::open(dir.path(), 3)?;

        ids.new_id()?;
        ids.new_id()?;
        assert!(matches!(ids.new_id(), Err(Error::IdSpaceExhausted)));

        Ok(())
    }

    #[test]
    fn ids_survive_reopen() -> Result<()> {
        let dir = tempfile::tempdir()?;

        let first;
        {
            let ids = IdTable::open(dir.path(), 1 << 20)?;
            first = ids.new_id()?.0;
            ids.flush(true)?;
        }

        {
            let ids = IdTable::open(dir.path(), 1 << 20)?;
            assert_eq!(1, ids.count_ids_in_use());
            let (next, _) = ids.new_id()?;
            assert_ne!(first, next);
        }

        Ok(())
    }
}
