// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The garbage-collection queue: deferred destruction of resources that
//! readers may still be touching.
//!
//! Cleanup follows one rule: remove every reference to a resource from
//! the shared state first, then push the resource here. Sessions bracket
//! all shared-state access between `lock` and `unlock` on their slot. The
//! queue guarantees that an element pushed at sequence `S` is not dropped
//! until every session whose held sequence predates `S` has released at
//! least once; either the session locked after the push (and therefore
//! cannot find the unreferenced resource), or its unlock happens before
//! the drop.
//!
//! Session lock/unlock is pure atomics; only push/poll take the queue
//! mutex. All sequence accesses are seq-cst so they also order against
//! top-root publication.

use crate::{Error, Result};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering::SeqCst};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// A queued cleanup record; dropping it performs the reclamation.
pub type Record = Box<dyn Send>;

/// Sequence value of an unlocked session slot
const NPOS: u64 = u64::MAX;

/// Fixed table of session slots, allocated from one atomic bitmap.
pub struct SessionSlots {
    bitmap: AtomicU64,
    seqs: Box<[AtomicU64]>,
}

impl SessionSlots {
    fn new(count: u32) -> Self {
        assert!(count <= 64, "session allocation uses a 64-bit bitmap");
        let mut seqs = Vec::with_capacity(count as usize);
        seqs.resize_with(count as usize, || AtomicU64::new(NPOS));
        Self {
            bitmap: AtomicU64::new(0),
            seqs: seqs.into_boxed_slice(),
        }
    }

    fn acquire(&self) -> Result<usize> {
        let mut cur = self.bitmap.load(SeqCst);
        loop {
            let free = (!cur).trailing_zeros() as usize;
            if free >= self.seqs.len() {
                return Err(Error::SessionLimit);
            }
            match self
                .bitmap
                .compare_exchange_weak(cur, cur | (1 << free), SeqCst, SeqCst)
            {
                Ok(_) => {
                    self.seqs[free].store(NPOS, SeqCst);
                    return Ok(free);
                }
                Err(raw) => cur = raw,
            }
        }
    }

    fn release(&self, slot: usize) {
        self.seqs[slot].store(NPOS, SeqCst);
        self.bitmap.fetch_and(!(1 << slot), SeqCst);
    }

    /// Smallest sequence currently held by any locked session.
    fn min_held(&self) -> u64 {
        let live = self.bitmap.load(SeqCst);
        let mut min = u64::MAX;
        for (index, seq) in self.seqs.iter().enumerate() {
            if live & (1 << index) != 0 {
                min = min.min(seq.load(SeqCst));
            }
        }
        min
    }
}

/// The bounded reclamation queue.
pub struct GcQueue {
    slots: SessionSlots,
    end: AtomicU64,
    entries: Mutex<VecDeque<(u64, Record)>>,
    cond: Condvar,
    waiting: AtomicBool,
    capacity: usize,
}

impl GcQueue {
    #[must_use]
    pub fn new(capacity: usize, max_sessions: u32) -> Self {
        Self {
            slots: SessionSlots::new(max_sessions),
            end: AtomicU64::new(0),
            entries: Mutex::new(VecDeque::with_capacity(capacity + 1)),
            cond: Condvar::new(),
            waiting: AtomicBool::new(false),
            capacity,
        }
    }

    /// Claims a session slot. Fails when all slots are taken.
    pub fn register_session(&self) -> Result<usize> {
        self.slots.acquire()
    }

    /// Returns a session slot; the slot must be unlocked.
    pub fn unregister_session(&self, slot: usize) {
        debug_assert_eq!(NPOS, self.slots.seqs[slot].load(SeqCst));
        self.slots.release(slot);
    }

    /// Declares the session's held sequence, pinning every element pushed
    /// from now on.
    ///
    /// The double-check makes the declaration race-free: if a push lands
    /// between the load and the store, the re-load differs and we retry,
    /// so the session either holds a sequence no older than the push or
    /// provably locked after it.
    pub fn lock_session(&self, slot: usize) {
        let seq = &self.slots.seqs[slot];
        loop {
            debug_assert_eq!(NPOS, seq.load(SeqCst), "session lock is not re-entrant");
            let observed = self.end.load(SeqCst);
            seq.store(observed, SeqCst);
            if self.end.load(SeqCst) == observed {
                return;
            }
            seq.store(NPOS, SeqCst);
        }
    }

    /// Clears the session's held sequence and wakes a blocked push.
    pub fn unlock_session(&self, slot: usize) {
        let prev = self.slots.seqs[slot].swap(NPOS, SeqCst);
        debug_assert_ne!(NPOS, prev, "unlock without lock");

        if self.waiting.swap(false, SeqCst) {
            // the flag may be re-set by a waiter that is still blocked
            let _guard = self.entries.lock();
            self.cond.notify_all();
        }
    }

    /// Pushes a cleanup record.
    ///
    /// Blocks while the queue is over capacity and the oldest elements
    /// are still pinned by sessions that predate them.
    ///
    /// The calling thread must not hold a session lock: its own pin
    /// would deadlock a full queue.
    pub fn push(&self, record: Record) -> Result<()> {
        let mut dropped = Vec::new();
        {
            let mut entries = self.entries.lock()?;
            let seq = self.end.fetch_add(1, SeqCst);
            entries.push_back((seq, record));

            loop {
                Self::take_reclaimable(&mut entries, &self.slots, &mut dropped);
                if entries.len() <= self.capacity {
                    break;
                }
                self.waiting.store(true, SeqCst);
                entries = self.cond.wait_timeout(entries, Duration::from_millis(50))?.0;
            }
        }

        // run destructors outside the queue mutex
        drop(dropped);
        self.cond.notify_all();
        Ok(())
    }

    /// Opportunistically reclaims without blocking.
    pub fn poll(&self) -> Result<usize> {
        let mut dropped = Vec::new();
        {
            let mut entries = self.entries.lock()?;
            Self::take_reclaimable(&mut entries, &self.slots, &mut dropped);
        }
        let count = dropped.len();
        drop(dropped);
        Ok(count)
    }

    /// Drains everything. Only valid when no session is locked.
    pub fn flush(&self) -> Result<()> {
        let drained: Vec<_> = {
            let mut entries = self.entries.lock()?;
            entries.drain(..).collect()
        };
        drop(drained);
        Ok(())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    /// Whether any session slot is registered.
    #[must_use]
    pub fn has_sessions(&self) -> bool {
        self.slots.bitmap.load(SeqCst) != 0
    }

    /// Processes the queue until the stop signal fires.
    pub fn run(&self, stop: &crate::stop_signal::StopSignal) {
        while !stop.is_stopped() {
            if let Err(e) = self.poll() {
                log::error!("gc poll failed: {e}");
                return;
            }

            let Ok(entries) = self.entries.lock() else { return };
            let _ = self.cond.wait_timeout(entries, Duration::from_millis(20));
        }

        if let Err(e) = self.poll() {
            log::error!("gc drain failed: {e}");
        }
    }

    /// Wakes a parked `run`.
    pub fn notify_run(&self) {
        self.cond.notify_all();
    }

    fn take_reclaimable(
        entries: &mut VecDeque<(u64, Record)>,
        slots: &SessionSlots,
        out: &mut Vec<Record>,
    ) {
        let min_held = slots.min_held();
        while let Some((seq, _)) = entries.front() {
            if *seq >= min_held {
                break;
            }
            if let Some((_, record)) = entries.pop_front() {
                out.push(record);
            }
        }
    }
}

impl std::fmt::Debug for GcQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "GcQueue(len={}, end={})", self.len(), self.end.load(SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, SeqCst);
        }
    }

    #[test]
    fn reclaim_waits_for_predating_sessions() -> Result<()> {
        let gc = GcQueue::new(16, 4);
        let session = gc.register_session()?;

        // session locked before the push pins the element
        gc.lock_session(session);

        let flag = Arc::new(AtomicBool::new(false));
        gc.push(Box::new(DropFlag(flag.clone())))?;
        gc.poll()?;
        assert!(!flag.load(SeqCst), "dropped under an older session");

        gc.unlock_session(session);
        gc.poll()?;
        assert!(flag.load(SeqCst), "not reclaimed after release");

        gc.unregister_session(session);
        Ok(())
    }

    #[test]
    fn sessions_locked_after_push_do_not_pin() -> Result<()> {
        let gc = GcQueue::new(16, 4);
        let session = gc.register_session()?;

        let flag = Arc::new(AtomicBool::new(false));
        gc.push(Box::new(DropFlag(flag.clone())))?;

        gc.lock_session(session);
        gc.poll()?;
        assert!(flag.load(SeqCst), "later session must not pin older pushes");

        gc.unlock_session(session);
        gc.unregister_session(session);
        Ok(())
    }

    #[test]
    fn full_queue_blocks_until_reader_releases() -> Result<()> {
        let gc = Arc::new(GcQueue::new(2, 4));
        let session = gc.register_session()?;
        gc.lock_session(session);

        for _ in 0..2 {
            gc.push(Box::new(()))?;
        }

        let gc2 = Arc::clone(&gc);
        let pusher = std::thread::spawn(move || gc2.push(Box::new(())));

        // give the pusher time to hit the full queue
        std::thread::sleep(Duration::from_millis(50));
        assert!(!pusher.is_finished());

        gc.unlock_session(session);
        pusher.join().map_err(|_| Error::Poisoned)??;

        gc.unregister_session(session);
        Ok(())
    }

    #[test]
    fn slots_are_bounded() -> Result<()> {
        let gc = GcQueue::new(4, 2);
        let a = gc.register_session()?;
        let _b = gc.register_session()?;
        assert!(matches!(gc.register_session(), Err(Error::SessionLimit)));

        gc.unregister_session(a);
        assert!(gc.register_session().is_ok());
        Ok(())
    }
}
