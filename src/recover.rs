// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Startup recovery.
//!
//! Runs before any session exists, so it owns every byte. The pass:
//!
//! 1. demotes every formerly active segment to sealed (its owner is gone)
//! 2. after an unclean shutdown, clamps each segment's bump pointer to
//!    its last durable msync offset, unless `recover_unsync` accepts the
//!    tail at the caller's risk
//! 3. rebuilds the freed-byte counters by walking the node regions and
//!    checking which of them their metadata cells still point at,
//!    optionally re-verifying checksums
//! 4. sweeps modify bits a crashed writer left in the metadata table
//! 5. rebuilds the free-segment list

use crate::config::RecoverArgs;
use crate::meta::NodeLocation;
use crate::node;
use crate::segment::{SegmentState, SEGMENT_HEADER_SIZE};
use crate::store::Core;
use crate::Result;
use std::sync::atomic::Ordering;

pub(crate) fn run(core: &Core, fresh: bool, args: &RecoverArgs) -> Result<()> {
    if fresh {
        core.seg.clean_shutdown().store(0, Ordering::Release);
        return Ok(());
    }

    let clean = core.seg.clean_shutdown().swap(0, Ordering::AcqRel) == 1;
    let segment_size = core.seg.segment_size();
    let mut live_nodes = 0u64;
    let mut lost_tail = 0u64;

    for segment in 0..core.seg.segment_count() {
        match core.seg.state(segment) {
            SegmentState::Free => {
                core.seg.enqueue_free(segment)?;
                continue;
            }
            SegmentState::Active | SegmentState::Sealed | SegmentState::Retiring => {
                core.seg.set_state(segment, SegmentState::Sealed);
            }
        }

        let mut target = u64::from(core.seg.alloc_pos(segment).load(Ordering::Acquire));
        let synced = u64::from(core.seg.last_sync_pos(segment).load(Ordering::Acquire));

        if !clean && !args.recover_unsync && synced < target {
            // bytes past the msync boundary never became durable
            lost_tail += target - synced;
            target = synced;
            core.seg.alloc_pos(segment).store(target as u32, Ordering::Release);
        }

        let mut freed = 0u64;
        core.seg
            .walk_nodes(segment, SEGMENT_HEADER_SIZE, target, |off, header| {
                let location = NodeLocation::new(segment * segment_size + off);
                let id = header.node_id();

                let live = !id.is_null()
                    && core.ids.cell(id).is_ok_and(|cell| {
                        let meta = cell.load(Ordering::Acquire);
                        meta.ref_count() > 0 && meta.location() == location
                    });

                if live {
                    live_nodes += 1;
                    if args.validate_checksum {
                        let bytes =
                            core.seg.node_slice(location, u64::from(header.capacity()));
                        node::verify_checksum(bytes)?;
                    }
                } else {
                    freed += u64::from(header.capacity());
                }
                Ok(())
            })?;

        core.seg.freed_bytes(segment).store(freed as u32, Ordering::Release);
        core.seg
            .last_sync_pos(segment)
            .store(synced.min(target) as u32, Ordering::Release);
    }

    // a crashed writer can leave modify bits and dangling locations
    // behind; cells pointing past a clamped bump pointer are dead weight
    // until their IDs resurface through the freelist
    let mut swept = 0u64;
    core.ids.for_each_cell(|_, cell| {
        let meta = cell.load(Ordering::Relaxed);
        if meta.is_modifying() {
            cell.store(meta.cleared_modify(), Ordering::Relaxed);
            swept += 1;
        }
        Ok(())
    })?;

    if swept > 0 {
        log::warn!("recovery cleared {swept} stale modify bits");
    }
    if lost_tail > 0 {
        log::warn!("recovery discarded {lost_tail} bytes past the msync boundary");
    }
    log::debug!(
        "recovery complete: {} segments, {live_nodes} live nodes (clean={clean})",
        core.seg.segment_count(),
    );

    Ok(())
}
