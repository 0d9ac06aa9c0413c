// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The background compactor.
//!
//! Walks sealed segments whose freed-byte ratio crossed the threshold,
//! evacuates their live nodes into its own active segment through the
//! CAS relocation protocol, and retires the emptied segments through the
//! GC queue so no reader can observe recycled bytes.
//!
//! Runs concurrently with the writer and all readers; it never blocks
//! either, and a node it loses a race on is simply skipped until the
//! segment's next pass.

use crate::gc::Record;
use crate::meta::NodeLocation;
use crate::segment::{AllocHandle, SegmentId, SEGMENT_HEADER_SIZE};
use crate::store::{self, Core, ReadGuard};
use crate::Result;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Relocation attempts per node before the segment is left for a later
/// pass.
const MOVE_RETRY_BUDGET: usize = 3;

/// How many compaction rounds pass between cache-residency sweeps.
const ADVICE_INTERVAL: u32 = 64;

/// Returns an evacuated segment to the free list once every session
/// that might hold pointers into it has released.
struct SegmentRecycle {
    core: Weak<Core>,
    segment: SegmentId,
}

impl Drop for SegmentRecycle {
    fn drop(&mut self) {
        if let Some(core) = self.core.upgrade() {
            if let Err(e) = core.seg.recycle(self.segment) {
                log::error!("failed to recycle segment {}: {e}", self.segment);
            }
        }
    }
}

/// Long-running worker; one per database.
pub(crate) fn worker(core: &Arc<Core>) {
    let slot = match core.gc.register_session() {
        Ok(slot) => slot,
        Err(e) => {
            log::error!("compactor could not register a session: {e}");
            return;
        }
    };

    let mut alloc = AllocHandle::new();
    let mut rounds = 0u32;

    while !core.stop.is_stopped() {
        match run_once(core, slot, &mut alloc) {
            Ok(true) => {}
            Ok(false) => std::thread::sleep(Duration::from_millis(50)),
            Err(e) => {
                log::error!("compaction pass failed: {e}");
                std::thread::sleep(Duration::from_millis(250));
            }
        }

        rounds = rounds.wrapping_add(1);
        if rounds % ADVICE_INTERVAL == 0 {
            core.seg.apply_cache_advice(&core.config.cache_bytes);
        }
    }

    core.seg.seal(&mut alloc);
    core.gc.unregister_session(slot);
}

/// Compacts the best candidate segment, if any. Returns whether any
/// work happened.
pub(crate) fn run_once(core: &Arc<Core>, slot: usize, alloc: &mut AllocHandle) -> Result<bool> {
    if core.poisoned.load(Ordering::Acquire) {
        // a corrupt engine is frozen read-only
        return Ok(false);
    }

    let candidates = core
        .seg
        .compact_candidates(core.config.compact_empty_pct);

    for segment in candidates {
        if compact_segment(core, slot, alloc, segment)? {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Evacuates one segment's live nodes. Returns whether the segment was
/// fully emptied and handed to the GC queue.
fn compact_segment(
    core: &Arc<Core>,
    slot: usize,
    alloc: &mut AllocHandle,
    segment: SegmentId,
) -> Result<bool> {
    let segment_size = core.seg.segment_size();
    let target = u64::from(core.seg.alloc_pos(segment).load(Ordering::Acquire));
    let mut moved = 0usize;
    let mut skipped = 0usize;

    {
        let guard = ReadGuard::new(core, slot);
        let _ = &guard; // pins reclamation while we walk raw headers

        let mut failed = false;
        core.seg.walk_nodes(segment, SEGMENT_HEADER_SIZE, target, |off, header| {
            let id = header.node_id();
            let location = NodeLocation::new(segment * segment_size + off);

            let Ok(cell) = core.ids.cell(id) else {
                return Ok(()); // stale header of a long-dead node
            };
            let meta = cell.load(Ordering::Acquire);
            if meta.ref_count() == 0 || meta.location() != location {
                return Ok(());
            }

            let mut relocated = false;
            for _ in 0..MOVE_RETRY_BUDGET {
                match store::try_relocate(core, alloc, id, location) {
                    Ok(true) => {
                        relocated = true;
                        break;
                    }
                    Ok(false) => {
                        let now = cell.load(Ordering::Acquire);
                        if now.ref_count() == 0 || now.location() != location {
                            // moved or died on its own; nothing to do
                            relocated = true;
                            break;
                        }
                    }
                    Err(e) => return Err(e),
                }
            }

            if relocated {
                moved += 1;
            } else {
                skipped += 1;
                failed = true;
            }
            Ok(())
        })?;

        if failed {
            log::trace!(
                "segment {segment}: {moved} nodes moved, {skipped} contended; retrying later",
            );
            return Ok(false);
        }
    }

    // the freed counter is the authority on emptiness: bytes a pending
    // transaction realloc'd away are only freed at its commit, and an
    // abort would swing the cells back here
    let allocated = u64::from(core.seg.alloc_pos(segment).load(Ordering::Acquire))
        - SEGMENT_HEADER_SIZE;
    let freed = u64::from(core.seg.freed_bytes(segment).load(Ordering::Acquire));
    if freed < allocated {
        log::trace!("segment {segment}: {} bytes still pending", allocated - freed);
        return Ok(false);
    }

    // every byte is dead; retire the segment through the GC queue so
    // in-flight readers drain before the bytes are reused
    if !core.seg.try_retire(segment) {
        return Ok(false);
    }

    log::debug!("segment {segment} evacuated ({moved} nodes moved)");

    let record: Record = Box::new(SegmentRecycle {
        core: Arc::downgrade(core),
        segment,
    });
    core.gc.push(record).map_err(|e| {
        log::error!("failed to queue segment {segment} for recycling");
        e
    })?;

    Ok(true)
}

/// Manual single-step compaction, exposed through the database handle.
pub(crate) fn compact_next_segment(core: &Arc<Core>) -> Result<bool> {
    let slot = core.gc.register_session()?;
    let mut alloc = AllocHandle::new();

    let result = run_once(core, slot, &mut alloc);

    core.seg.seal(&mut alloc);
    core.gc.unregister_session(slot);
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recycle_record_survives_dead_core() {
        // a record whose engine is already gone must drop quietly
        let record = SegmentRecycle {
            core: Weak::new(),
            segment: 3,
        };
        drop(record);
    }
}
