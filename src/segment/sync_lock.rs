// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Per-segment exclusion between msync and in-place modification.
//!
//! An in-place modify takes the shared side; an msync takes the exclusive
//! side, so no checksummed flush can race a mutation of the bytes it
//! covers. The locks are striped by segment index: a collision merely
//! serializes an msync against a modify of an unrelated segment, which
//! costs latency, never correctness.

use super::SegmentId;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

const STRIPES: usize = 4_096;

pub struct SyncLocks {
    stripes: Box<[RwLock<()>]>,
}

impl SyncLocks {
    #[must_use]
    pub fn new() -> Self {
        let mut stripes = Vec::with_capacity(STRIPES);
        stripes.resize_with(STRIPES, || RwLock::new(()));
        Self {
            stripes: stripes.into_boxed_slice(),
        }
    }

    fn stripe(&self, segment: SegmentId) -> &RwLock<()> {
        &self.stripes[segment as usize & (STRIPES - 1)]
    }

    /// Non-blocking "modify" side; `None` while an msync is running.
    #[must_use]
    pub fn try_modify(&self, segment: SegmentId) -> Option<RwLockReadGuard<'_, ()>> {
        self.stripe(segment).try_read().ok()
    }

    /// Blocking "msync" side; waits for in-flight modifies to finish.
    pub fn msync(&self, segment: SegmentId) -> RwLockWriteGuard<'_, ()> {
        self.stripe(segment)
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Default for SyncLocks {
    fn default() -> Self {
        Self::new()
    }
}
