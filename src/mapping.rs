// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Memory-mapped file regions.
//!
//! This module is the unsafe perimeter of the crate: everything above it
//! works with plain slices, atomics and copied-out structs. The safety
//! contract for handing out references into mapped memory is:
//!
//! * A [`Mapping`] (and every block of a [`BlockMap`]) stays mapped until
//!   the owning struct is dropped; maps are append-only and never move.
//! * Mutable access to plain (non-atomic) bytes is only performed by the
//!   single thread that owns the enclosing region: the writer owns its
//!   active segment past the bump pointer, the compactor owns its
//!   destination copies, and recovery runs before any session exists.
//! * All cross-thread cells (metadata cells, segment counters, header
//!   words) are accessed exclusively through [`AtomicU64`]/[`AtomicU32`]
//!   references derived here, with the orderings chosen by the caller.
//! * Shared `&[u8]` views of node bytes are only read while the node is
//!   pinned: reachable from a retained root, or covered by the GC queue.
//!   Relocation copies, it never mutates the source in place.

use crate::{Error, Result};
use memmap2::{Advice, MmapOptions, MmapRaw};
use std::fs::File;
use std::sync::atomic::{AtomicPtr, AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;

/// Rounds up to the OS page size.
pub fn round_to_page(len: u64) -> u64 {
    let page = page_size::get() as u64;
    (len + page - 1) & !(page - 1)
}

/// A fixed region of a file, mapped read-write.
pub struct Mapping {
    map: MmapRaw,
    len: usize,
}

impl Mapping {
    /// Maps `len` bytes of `file` starting at `offset` (page-aligned).
    pub fn new(file: &File, offset: u64, len: usize) -> Result<Self> {
        debug_assert_eq!(offset % page_size::get() as u64, 0);

        let map = MmapOptions::new()
            .offset(offset)
            .len(len)
            .map_raw(file)
            .map_err(Error::Io)?;

        Ok(Self { map, len })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Shared view of the whole region.
    ///
    /// See the module docs for when reading this is sound.
    #[must_use]
    pub fn slice(&self) -> &[u8] {
        // SAFETY: the map lives as long as self and is never remapped
        unsafe {
            std::slice::from_raw_parts(self.map.as_ptr(), self.len)
        }
    }

    /// Atomic view of the 8 bytes at `offset`.
    ///
    /// # Panics
    ///
    /// Panics if the offset is out of bounds or not 8-byte aligned.
    #[must_use]
    pub fn atomic_u64(&self, offset: usize) -> &AtomicU64 {
        assert!(offset + 8 <= self.len);
        assert_eq!(offset % 8, 0);

        // SAFETY: in-bounds, aligned, and the mapping outlives the borrow;
        // all concurrent access to this word goes through the same atomic
        unsafe {
            &*self.map.as_ptr().add(offset).cast::<AtomicU64>()
        }
    }

    /// Atomic view of the 4 bytes at `offset`.
    ///
    /// # Panics
    ///
    /// Panics if the offset is out of bounds or not 4-byte aligned.
    #[must_use]
    pub fn atomic_u32(&self, offset: usize) -> &AtomicU32 {
        assert!(offset + 4 <= self.len);
        assert_eq!(offset % 4, 0);

        // SAFETY: as for atomic_u64
        unsafe {
            &*self.map.as_ptr().add(offset).cast::<AtomicU32>()
        }
    }

    /// Overwrites bytes at `offset`. Single-owner regions only.
    pub fn write_bytes(&self, offset: usize, bytes: &[u8]) {
        assert!(offset + bytes.len() <= self.len);

        // SAFETY: in-bounds; the caller owns this region (module contract)
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.map.as_mut_ptr().add(offset),
                bytes.len(),
            );
        }
    }

    /// Flushes `[offset, offset + len)` to disk, blocking.
    pub fn flush_range(&self, offset: usize, len: usize) -> Result<()> {
        self.map.flush_range(offset, len).map_err(Error::Io)
    }

    /// Schedules an asynchronous flush of `[offset, offset + len)`.
    pub fn flush_async_range(&self, offset: usize, len: usize) -> Result<()> {
        self.map.flush_async_range(offset, len).map_err(Error::Io)
    }

    /// Tries to pin the region into RAM, logging on failure.
    pub fn lock_resident(&self) {
        if let Err(e) = self.map.lock() {
            log::warn!("unable to mlock mapped region: {e}");

            if let Err(e) = self.map.advise(Advice::Random) {
                log::debug!("madvise(Random) failed: {e}");
            }
        }
    }

    /// Applies a residency hint to the whole region.
    pub fn advise(&self, advice: Advice) {
        if let Err(e) = self.map.advise(advice) {
            log::debug!("madvise failed: {e}");
        }
    }
}

impl std::fmt::Debug for Mapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Mapping({} bytes)", self.len)
    }
}

/// A growable sequence of equally sized, individually mapped blocks of one
/// file, with lock-free block lookup.
///
/// Blocks live at `base + index * block_size` in the file. The pointer
/// table is sized up front from the configured maximum, so `get` is one
/// atomic load; growth appends under a mutex and publishes the new block
/// pointer last.
pub struct BlockMap {
    file: File,
    base: u64,
    block_size: u64,
    ptrs: Box<[AtomicPtr<u8>]>,
    maps: Mutex<Vec<MmapRaw>>,
    count: AtomicU64,
    grow_lock: Mutex<()>,
}

impl BlockMap {
    pub fn new(file: File, base: u64, block_size: u64, max_blocks: u64) -> Result<Self> {
        debug_assert_eq!(base % page_size::get() as u64, 0);
        debug_assert!(block_size.is_power_of_two());

        let mut ptrs = Vec::new();
        ptrs.resize_with(max_blocks as usize, || AtomicPtr::new(std::ptr::null_mut()));

        let this = Self {
            file,
            base,
            block_size,
            ptrs: ptrs.into_boxed_slice(),
            maps: Mutex::new(Vec::new()),
            count: AtomicU64::new(0),
            grow_lock: Mutex::new(()),
        };

        // Map whatever the file already contains
        let len = this.file.metadata()?.len();
        let existing = len.saturating_sub(base) / block_size;
        this.ensure(existing)?;

        Ok(this)
    }

    #[must_use]
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn max_blocks(&self) -> u64 {
        self.ptrs.len() as u64
    }

    /// Base pointer of a mapped block.
    ///
    /// # Panics
    ///
    /// Panics if the block has not been mapped yet.
    #[must_use]
    pub fn get(&self, block: u64) -> *mut u8 {
        let ptr = self
            .ptrs
            .get(block as usize)
            .map_or(std::ptr::null_mut(), |p| p.load(Ordering::Acquire));
        assert!(!ptr.is_null(), "block {block} is not mapped");
        ptr
    }

    /// Shared view of a whole block.
    #[must_use]
    pub fn block_slice(&self, block: u64) -> &[u8] {
        let ptr = self.get(block);

        // SAFETY: block pointers are published once and stay mapped until
        // drop; the module contract governs concurrent byte access
        unsafe {
            std::slice::from_raw_parts(ptr, self.block_size as usize)
        }
    }

    /// Atomic view of 8 bytes within a mapped block.
    ///
    /// # Panics
    ///
    /// Panics if the block is unmapped, or the offset is out of bounds or
    /// not 8-byte aligned.
    #[must_use]
    pub fn block_atomic_u64(&self, block: u64, offset: usize) -> &AtomicU64 {
        assert!(offset + 8 <= self.block_size as usize);
        assert_eq!(offset % 8, 0);
        let ptr = self.get(block);

        // SAFETY: in-bounds, aligned, mapped until drop; concurrent access
        // to this word goes through the same atomic
        unsafe { &*ptr.add(offset).cast::<AtomicU64>() }
    }

    /// Atomic view of 4 bytes within a mapped block.
    ///
    /// # Panics
    ///
    /// Panics if the block is unmapped, or the offset is out of bounds or
    /// not 4-byte aligned.
    #[must_use]
    pub fn block_atomic_u32(&self, block: u64, offset: usize) -> &AtomicU32 {
        assert!(offset + 4 <= self.block_size as usize);
        assert_eq!(offset % 4, 0);
        let ptr = self.get(block);

        // SAFETY: as for block_atomic_u64
        unsafe { &*ptr.add(offset).cast::<AtomicU32>() }
    }

    /// Mutable view of a byte range within a block.
    ///
    /// The caller must own the range per the module contract (bump-pointer
    /// reservation, relocation destination, or recovery).
    #[must_use]
    #[allow(clippy::mut_from_ref)]
    pub fn block_slice_mut(&self, block: u64, offset: usize, len: usize) -> &mut [u8] {
        assert!(offset + len <= self.block_size as usize);
        let ptr = self.get(block);

        // SAFETY: in-bounds, mapped until drop; exclusivity is the
        // caller's obligation (see module docs)
        unsafe { std::slice::from_raw_parts_mut(ptr.add(offset), len) }
    }

    /// Grows the file (and pointer table) so that blocks `0..want` exist.
    ///
    /// Returns `Error::DatabaseFull` past the configured maximum.
    pub fn ensure(&self, want: u64) -> Result<()> {
        if want <= self.count.load(Ordering::Acquire) {
            return Ok(());
        }

        let _guard = self.grow_lock.lock()?;

        let have = self.count.load(Ordering::Acquire);
        if want <= have {
            return Ok(()); // another thread grew first
        }
        if want > self.max_blocks() {
            return Err(Error::DatabaseFull);
        }

        let new_len = self.base + want * self.block_size;
        if self.file.metadata()?.len() < new_len {
            self.file.set_len(new_len)?;
        }

        let mut maps = self.maps.lock()?;
        for block in have..want {
            let map = MmapOptions::new()
                .offset(self.base + block * self.block_size)
                .len(self.block_size as usize)
                .map_raw(&self.file)
                .map_err(Error::Io)?;

            let ptr = map.as_mut_ptr();
            maps.push(map);

            self.ptrs[block as usize].store(ptr, Ordering::Release);
        }
        drop(maps);

        self.count.store(want, Ordering::Release);
        log::trace!("block map grown to {want} blocks of {} bytes", self.block_size);

        Ok(())
    }

    /// Flushes one block.
    pub fn flush_block(&self, block: u64, blocking: bool) -> Result<()> {
        let maps = self.maps.lock()?;
        let map = maps.get(block as usize).ok_or(Error::Corruption(
            "flush of unmapped block",
        ))?;
        if blocking {
            map.flush().map_err(Error::Io)
        } else {
            map.flush_async().map_err(Error::Io)
        }
    }

    /// Flushes a byte range of one block.
    pub fn flush_block_range(
        &self,
        block: u64,
        offset: usize,
        len: usize,
        blocking: bool,
    ) -> Result<()> {
        let maps = self.maps.lock()?;
        let map = maps.get(block as usize).ok_or(Error::Corruption(
            "flush of unmapped block",
        ))?;
        if blocking {
            map.flush_range(offset, len).map_err(Error::Io)
        } else {
            map.flush_async_range(offset, len).map_err(Error::Io)
        }
    }

    /// Tries to pin one block into RAM, logging on failure.
    pub fn lock_block_resident(&self, block: u64) {
        let Ok(maps) = self.maps.lock() else { return };
        if let Some(map) = maps.get(block as usize) {
            if let Err(e) = map.lock() {
                log::warn!("unable to mlock block {block}: {e}");
                if let Err(e) = map.advise(Advice::Random) {
                    log::debug!("madvise(Random) failed: {e}");
                }
            }
        }
    }

    /// Applies a residency hint to one block.
    pub fn advise_block(&self, block: u64, advice: Advice) {
        let Ok(maps) = self.maps.lock() else { return };
        if let Some(map) = maps.get(block as usize) {
            if let Err(e) = map.advise(advice) {
                log::debug!("madvise failed: {e}");
            }
        }
    }
}

impl std::fmt::Debug for BlockMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "BlockMap({} blocks of {} bytes)",
            self.count(),
            self.block_size,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn block_map_grows_and_persists() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("blocks");

        {
            let file = std::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)?;
            file.set_len(4_096)?;

            let blocks = BlockMap::new(file, 4_096, 65_536, 8)?;
            assert_eq!(0, blocks.count());

            blocks.ensure(2)?;
            assert_eq!(2, blocks.count());

            let word = Mapping::new(
                &std::fs::OpenOptions::new().read(true).write(true).open(&path)?,
                4_096,
                65_536,
            )?;
            word.atomic_u64(0).store(0xfeed, Ordering::Release);
            word.flush_range(0, 8)?;
            blocks.flush_block(0, true)?;
        }

        {
            let file = std::fs::OpenOptions::new().read(true).write(true).open(&path)?;
            let blocks = BlockMap::new(file, 4_096, 65_536, 8)?;
            assert_eq!(2, blocks.count());

            let slice = blocks.block_slice(0);
            assert_eq!(&0xfeed_u64.to_le_bytes()[..], &slice[0..8]);
        }

        Ok(())
    }

    #[test]
    fn block_map_respects_maximum() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("blocks");

        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let blocks = BlockMap::new(file, 0, 65_536, 2)?;
        blocks.ensure(2)?;
        assert!(matches!(blocks.ensure(3), Err(Error::DatabaseFull)));

        Ok(())
    }
}
