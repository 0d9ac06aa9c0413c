// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Read and write sessions.
//!
//! Any number of read sessions run in parallel; exactly one write session
//! exists per process. Each session owns a GC slot and pins its sequence
//! for the duration of every operation, which is what keeps freed bytes
//! from being reused under a running read.
//!
//! A write transaction moves through `idle -> open -> committing ->
//! closed`: it opens on the first mutation, commits when its root is
//! published through [`WriteSession::set_top_root`], and aborts by
//! swinging every rewritten cell back to its logged prior bytes and
//! cascade-releasing everything it allocated.

use crate::gc::Record;
use crate::node::NodeId;
use crate::segment::AllocHandle;
use crate::store::{release_cascade, Core, ObjectRef, ReadGuard, TxLog, WriteCtx};
use crate::tree::{self, cursor::CursorState};
use crate::{Error, KvPair, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// An owned reference to a trie root: the unit of snapshot isolation.
///
/// Holding a `Root` keeps every node reachable from it alive, even as
/// the writer publishes newer versions. Dropping it releases the
/// reference.
///
/// A handle that was rewritten by a write transaction which then
/// aborted becomes *defunct*: the abort already settled its reference,
/// and any further use fails with [`Error::Aborted`].
pub struct Root {
    pub(crate) id: NodeId,
    core: Weak<Core>,
    pub(crate) defunct: Arc<AtomicBool>,
}

impl Root {
    pub(crate) fn new(id: NodeId, core: &Arc<Core>) -> Self {
        Self {
            id,
            core: Arc::downgrade(core),
            defunct: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Whether this handle refers to the empty trie.
    #[must_use]
    pub fn is_null(&self) -> bool {
        self.id.is_null()
    }

    /// Whether an aborted transaction invalidated this handle.
    #[must_use]
    pub fn is_defunct(&self) -> bool {
        self.defunct.load(Ordering::Acquire)
    }

    /// The raw node ID, for diagnostics.
    #[must_use]
    pub fn node_id(&self) -> crate::NodeId {
        self.id
    }

    pub(crate) fn check_usable(&self) -> Result<()> {
        if self.is_defunct() {
            return Err(Error::Aborted);
        }
        Ok(())
    }
}

impl Drop for Root {
    fn drop(&mut self) {
        if self.id.is_null() || self.is_defunct() {
            return;
        }
        if let Some(core) = self.core.upgrade() {
            if let Err(e) = release_cascade(&core, self.id) {
                log::error!("failed to release root {}: {e}", self.id);
            }
        }
    }
}

impl std::fmt::Debug for Root {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Root({})", self.id)
    }
}

/// Drops one reference to a retired root once every reader that might
/// have loaded it has released.
pub(crate) struct RootRelease {
    pub core: Weak<Core>,
    pub id: NodeId,
}

impl Drop for RootRelease {
    fn drop(&mut self) {
        if self.id.is_null() {
            return;
        }
        if let Some(core) = self.core.upgrade() {
            if let Err(e) = release_cascade(&core, self.id) {
                log::error!("failed to release retired root {}: {e}", self.id);
            }
        }
    }
}

fn load_top_root(core: &Arc<Core>, guard: &ReadGuard<'_>, name: u32) -> Result<Root> {
    let slot = core.seg.top_root_id(name)?;
    let raw = slot.load(Ordering::SeqCst);
    if raw == 0 {
        return Ok(Root::new(NodeId::NULL, core));
    }

    let id = NodeId::from_u64(raw);
    ObjectRef::get(guard, id)?.retain()?;
    Ok(Root::new(id, core))
}

// ---------------------------------------------------------------------
// read session

/// A snapshot-isolated reader. One per thread; any number in parallel.
pub struct ReadSession {
    core: Arc<Core>,
    slot: usize,
    pinned: Option<Root>,
}

impl ReadSession {
    pub(crate) fn new(core: Arc<Core>) -> Result<Self> {
        let slot = core.gc.register_session()?;
        Ok(Self {
            core,
            slot,
            pinned: None,
        })
    }

    fn guard(&self) -> ReadGuard<'_> {
        ReadGuard::new(&self.core, self.slot)
    }

    /// Loads and retains the named snapshot.
    pub fn get_top_root(&self, name: u32) -> Result<Root> {
        let guard = self.guard();
        load_top_root(&self.core, &guard, name)
    }

    /// Pins a snapshot for the lifetime of this session.
    pub fn set_session_revision(&mut self, root: Root) {
        self.pinned = Some(root);
    }

    /// The snapshot pinned by [`Self::set_session_revision`], if any.
    #[must_use]
    pub fn session_revision(&self) -> Option<&Root> {
        self.pinned.as_ref()
    }

    /// Point lookup.
    pub fn get(&self, root: &Root, key: &[u8]) -> Result<Option<Vec<u8>>> {
        root.check_usable()?;
        check_key(&self.core, key)?;
        let guard = self.guard();
        tree::get(&guard, root.id, key)
    }

    /// Positions a cursor at the first key >= `key`.
    pub fn lower_bound<'s>(&'s self, root: &'s Root, key: &[u8]) -> Result<Cursor<'s>> {
        root.check_usable()?;
        check_key(&self.core, key)?;
        let mut state = CursorState::new(root.id);
        {
            let guard = self.guard();
            state.lower_bound(&guard, key)?;
        }
        Ok(Cursor {
            session: self,
            state,
            _root: std::marker::PhantomData,
        })
    }

    /// First pair with key >= `key`, if any.
    pub fn get_greater_equal(&self, root: &Root, key: &[u8]) -> Result<Option<KvPair>> {
        let cursor = self.lower_bound(root, key)?;
        cursor.pair()
    }

    /// Last pair with key < `key`, if any.
    pub fn get_less_than(&self, root: &Root, key: &[u8]) -> Result<Option<KvPair>> {
        root.check_usable()?;
        check_key(&self.core, key)?;
        let mut state = CursorState::new(root.id);
        let guard = self.guard();
        if state.lower_bound(&guard, key)? {
            state.previous(&guard)?;
        } else {
            state.seek_last(&guard)?;
        }
        pair_of(&guard, &state)
    }

    /// The largest pair, if any.
    pub fn get_max(&self, root: &Root) -> Result<Option<KvPair>> {
        root.check_usable()?;
        let mut state = CursorState::new(root.id);
        let guard = self.guard();
        state.seek_last(&guard)?;
        pair_of(&guard, &state)
    }
}

impl Drop for ReadSession {
    fn drop(&mut self) {
        // the pinned root must release before the slot goes away
        self.pinned = None;
        self.core.gc.unregister_session(self.slot);
    }
}

fn check_key(core: &Core, key: &[u8]) -> Result<()> {
    if key.len() > core.config.max_key_length {
        return Err(Error::KeyTooLong);
    }
    Ok(())
}

fn pair_of(guard: &ReadGuard<'_>, state: &CursorState) -> Result<Option<KvPair>> {
    let (Some(key), Some(vid)) = (state.key(), state.value_id()) else {
        return Ok(None);
    };
    Ok(Some((key.to_vec(), tree::read_value(guard, vid)?)))
}

/// An ordered iterator over one snapshot.
///
/// The cursor borrows its session and root, so it cannot outlive either;
/// stepping re-reads nodes through the ID indirection, which makes
/// concurrent compaction invisible.
pub struct Cursor<'s> {
    session: &'s ReadSession,
    state: CursorState,
    /// Keeps the root handle borrowed so its reference cannot drop away
    /// under the cursor's frames
    _root: std::marker::PhantomData<&'s Root>,
}

impl Cursor<'_> {
    /// Whether the cursor points at a pair.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.state.is_valid()
    }

    /// The current key, while valid.
    #[must_use]
    pub fn key(&self) -> Option<&[u8]> {
        self.state.key()
    }

    /// The current value, while valid.
    pub fn value(&self) -> Result<Option<Vec<u8>>> {
        let Some(vid) = self.state.value_id() else {
            return Ok(None);
        };
        let guard = self.session.guard();
        Ok(Some(tree::read_value(&guard, vid)?))
    }

    /// The current pair, while valid.
    pub fn pair(&self) -> Result<Option<KvPair>> {
        let guard = self.session.guard();
        pair_of(&guard, &self.state)
    }

    /// Advances to the next key; returns whether the cursor is valid.
    pub fn next(&mut self) -> Result<bool> {
        let guard = self.session.guard();
        self.state.next(&guard)
    }

    /// Steps back to the previous key; returns whether the cursor is
    /// valid.
    pub fn previous(&mut self) -> Result<bool> {
        let guard = self.session.guard();
        self.state.previous(&guard)
    }

    /// Re-positions at the first key >= `key`.
    pub fn seek(&mut self, key: &[u8]) -> Result<bool> {
        let guard = self.session.guard();
        self.state.lower_bound(&guard, key)
    }

    /// Re-positions at the smallest key.
    pub fn seek_first(&mut self) -> Result<bool> {
        let guard = self.session.guard();
        self.state.seek_first(&guard)
    }

    /// Re-positions at the largest key.
    pub fn seek_last(&mut self) -> Result<bool> {
        let guard = self.session.guard();
        self.state.seek_last(&guard)
    }
}

// ---------------------------------------------------------------------
// write session

/// The single writer.
///
/// Mutations build a private tree hanging off the session's root
/// handles; nothing becomes visible to readers until
/// [`Self::set_top_root`] publishes it.
pub struct WriteSession {
    core: Arc<Core>,
    slot: usize,
    alloc: AllocHandle,
    log: TxLog,
    txn_version: u64,
    always_clone: u64,
    abort_requested: Arc<AtomicBool>,

    /// Roots frozen through [`Self::retain`], so [`Self::release`] can
    /// pay back the exact snapshot even after the slot advanced
    frozen: Vec<(u32, NodeId)>,
}

impl WriteSession {
    pub(crate) fn new(core: Arc<Core>) -> Result<Self> {
        core.ensure_writable()?;

        if core
            .writer_active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::WriterActive);
        }

        let slot = match core.gc.register_session() {
            Ok(slot) => slot,
            Err(e) => {
                core.writer_active.store(false, Ordering::Release);
                return Err(e);
            }
        };

        let mut this = Self {
            core,
            slot,
            alloc: AllocHandle::new(),
            log: TxLog::default(),
            txn_version: 0,
            always_clone: 0,
            abort_requested: Arc::new(AtomicBool::new(false)),
            frozen: Vec::new(),
        };
        this.advance_version();
        Ok(this)
    }

    /// Starts a fresh version window: everything that exists now will be
    /// cloned before modification from here on.
    fn advance_version(&mut self) {
        let version = self.core.seg.global_version().fetch_add(1, Ordering::AcqRel) + 1;
        self.txn_version = version;
        self.always_clone = version - 1;
        self.core.uncommitted_floor.store(version, Ordering::Release);
    }

    /// A flag another thread may set to make the session abort at its
    /// next operation boundary; in-flight operations run to completion.
    #[must_use]
    pub fn abort_signal(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.abort_requested)
    }

    fn check_abort(&mut self) -> Result<()> {
        if self.abort_requested.load(Ordering::Acquire) {
            self.abort();
            return Err(Error::Aborted);
        }
        Ok(())
    }

    fn guard(&self) -> ReadGuard<'_> {
        ReadGuard::new(&self.core, self.slot)
    }

    /// Loads and retains the named snapshot.
    pub fn get_top_root(&self, name: u32) -> Result<Root> {
        let guard = self.guard();
        load_top_root(&self.core, &guard, name)
    }

    /// Point lookup through the writer's own (possibly uncommitted) root.
    pub fn get(&self, root: &Root, key: &[u8]) -> Result<Option<Vec<u8>>> {
        root.check_usable()?;
        check_key(&self.core, key)?;
        let guard = self.guard();
        tree::get(&guard, root.id, key)
    }

    /// Inserts or replaces `key`, updating `root` in place.
    ///
    /// Returns the previous value's size, or -1 if the key was inserted.
    pub fn upsert(&mut self, root: &mut Root, key: &[u8], value: &[u8]) -> Result<i64> {
        root.check_usable()?;
        self.core.ensure_writable()?;
        self.check_abort()?;
        check_key(&self.core, key)?;
        if value.len() > self.core.config.max_value_size() {
            return Err(Error::ValueTooLarge);
        }

        let result = {
            let guard = ReadGuard::new(&self.core, self.slot);
            let mut ctx = WriteCtx {
                core: &self.core,
                alloc: &mut self.alloc,
                log: &mut self.log,
                txn_version: self.txn_version,
                always_clone: self.always_clone,
            };
            tree::upsert(&mut ctx, &guard, root.id, key, value)
        };

        match result {
            Ok((new_root, prev)) => {
                self.swap_root(root, new_root);
                Ok(prev)
            }
            Err(e) => {
                self.abort();
                Err(e)
            }
        }
    }

    /// Removes `key`, updating `root` in place.
    ///
    /// Returns the removed value's size, or -1 if the key was absent.
    pub fn remove(&mut self, root: &mut Root, key: &[u8]) -> Result<i64> {
        root.check_usable()?;
        self.core.ensure_writable()?;
        self.check_abort()?;
        check_key(&self.core, key)?;

        let result = {
            let guard = ReadGuard::new(&self.core, self.slot);
            let mut ctx = WriteCtx {
                core: &self.core,
                alloc: &mut self.alloc,
                log: &mut self.log,
                txn_version: self.txn_version,
                always_clone: self.always_clone,
            };
            tree::remove(&mut ctx, &guard, root.id, key)
        };

        match result {
            Ok((new_root, removed)) => {
                self.swap_root(root, new_root);
                Ok(removed)
            }
            Err(e) => {
                self.abort();
                Err(e)
            }
        }
    }

    /// Re-points a root handle after a copy-on-write descent. The old
    /// reference is paid at commit; the handle is remembered so an abort
    /// can settle it instead.
    fn swap_root(&mut self, root: &mut Root, new_root: NodeId) {
        if new_root == root.id {
            return;
        }
        let old = root.id;
        root.id = new_root;
        if !old.is_null() {
            self.log.deferred_release.push(old);
        }
        self.log
            .swapped_roots
            .push((old, Arc::clone(&root.defunct)));
    }

    /// Publishes `root` under `name`, committing the transaction.
    ///
    /// New read sessions see the root immediately; sessions that loaded
    /// the previous root keep it until they release.
    pub fn set_top_root(&mut self, name: u32, root: &mut Root) -> Result<()> {
        root.check_usable()?;
        self.core.ensure_writable()?;
        self.check_abort()?;

        let old = {
            let guard = self.guard();
            if !root.id.is_null() {
                ObjectRef::get(&guard, root.id)?.retain()?;
            }
            let slot = self.core.seg.top_root_id(name)?;
            NodeId::from_u64(slot.swap(root.id.to_u64(), Ordering::SeqCst))
        };

        // the push must not run under our own session lock
        if !old.is_null() {
            let record: Record = Box::new(RootRelease {
                core: Arc::downgrade(&self.core),
                id: old,
            });
            self.core.gc.push(record)?;
        }

        self.commit_log()?;
        self.advance_version();
        log::trace!("published top root {name} -> {}", root.id);
        Ok(())
    }

    /// Bumps the named slot's retain counter and takes one reference on
    /// the root it currently holds, freezing that snapshot even if the
    /// writer advances the named root afterwards.
    pub fn retain(&mut self, name: u32) -> Result<()> {
        let id = {
            let guard = self.guard();
            let id = NodeId::from_u64(self.core.seg.top_root_id(name)?.load(Ordering::SeqCst));
            if !id.is_null() {
                ObjectRef::get(&guard, id)?.retain()?;
            }
            id
        };
        self.core
            .seg
            .top_root_retain(name)?
            .fetch_add(1, Ordering::AcqRel);
        self.frozen.push((name, id));
        Ok(())
    }

    /// Undoes one [`Self::retain`] on the named slot, releasing the
    /// snapshot that was frozen at retain time.
    pub fn release(&mut self, name: u32) -> Result<()> {
        let Some(index) = self.frozen.iter().rposition(|(n, _)| *n == name) else {
            return Err(Error::UnknownTopRoot);
        };
        let (_, id) = self.frozen.swap_remove(index);

        self.core
            .seg
            .top_root_retain(name)?
            .fetch_sub(1, Ordering::AcqRel);

        if !id.is_null() {
            let record: Record = Box::new(RootRelease {
                core: Arc::downgrade(&self.core),
                id,
            });
            self.core.gc.push(record)?;
        }
        Ok(())
    }

    /// Advances the clone version: every node that exists now is treated
    /// as shared, so subsequent edits clone instead of mutating in place.
    pub fn fork(&mut self) {
        self.advance_version();
    }

    /// Full structural audit of the trie under `root`; returns its key
    /// count.
    pub fn validate(&self, root: &Root) -> Result<u64> {
        root.check_usable()?;
        let guard = self.guard();
        tree::validate(&guard, root.id)
    }

    /// Number of keys under `root`.
    pub fn count(&self, root: &Root) -> Result<u64> {
        root.check_usable()?;
        let guard = self.guard();
        tree::count_keys(&guard, root.id)
    }

    /// Commit: pay out the deferred releases and forget the undo log.
    fn commit_log(&mut self) -> Result<()> {
        self.log.swapped_roots.clear();

        for (_, prior) in self.log.moved.drain(..) {
            // the rewritten node's old bytes become garbage now
            let location = prior.location();
            let header = crate::node::NodeHeader::read(
                self.core
                    .seg
                    .node_slice(location, crate::node::HEADER_SIZE as u64),
            );
            self.core.seg.free(location, header.capacity());
        }

        self.log.allocated.clear();

        for id in std::mem::take(&mut self.log.deferred_release) {
            release_cascade(&self.core, id)?;
        }
        Ok(())
    }

    /// Rolls the transaction back: rewritten cells are swung back to
    /// their prior bytes, allocated nodes are cascade-released, deferred
    /// releases are forgotten.
    pub fn abort(&mut self) {
        self.abort_requested.store(false, Ordering::Release);
        if self.log.is_empty() {
            self.advance_version();
            return;
        }

        // restore rewritten cells, newest first; the modify bit keeps the
        // compactor from racing the restore
        for (id, prior) in self.log.moved.drain(..).rev() {
            let Ok(cell) = self.core.ids.cell(id) else {
                continue;
            };
            cell.modify_begin();
            let current = cell.load(Ordering::Acquire);
            let location = current.location();
            if self.core.seg.check_bounds(location, crate::node::HEADER_SIZE as u64).is_ok() {
                let header = crate::node::NodeHeader::read(
                    self.core
                        .seg
                        .node_slice(location, crate::node::HEADER_SIZE as u64),
                );
                self.core.seg.free(location, header.capacity());
            }
            cell.store(prior, Ordering::SeqCst);
        }

        // release allocations newest-first; parents cascade into their
        // children, which then show up here already dead
        for id in std::mem::take(&mut self.log.allocated).into_iter().rev() {
            let Ok(cell) = self.core.ids.cell(id) else {
                continue;
            };
            if cell.load(Ordering::Acquire).ref_count() == 0 {
                continue;
            }
            if let Err(e) = release_cascade(&self.core, id) {
                log::error!("abort failed to release node {id}: {e}");
            }
        }

        // root handles this transaction re-pointed are now orphans: flag
        // them dead and settle the reference each used to own (unless the
        // old root was itself transaction-local and is already gone)
        for (old, defunct) in std::mem::take(&mut self.log.swapped_roots) {
            defunct.store(true, Ordering::Release);
            if old.is_null() {
                continue;
            }
            let still_live = self
                .core
                .ids
                .cell(old)
                .map(|cell| cell.load(Ordering::Acquire).ref_count() > 0)
                .unwrap_or(false);
            if still_live {
                if let Err(e) = release_cascade(&self.core, old) {
                    log::error!("abort failed to settle root {old}: {e}");
                }
            }
        }

        self.log.deferred_release.clear();
        self.advance_version();
        log::debug!("write transaction aborted");
    }
}

impl Drop for WriteSession {
    fn drop(&mut self) {
        if !self.log.is_empty() {
            self.abort();
        }
        for (_, id) in std::mem::take(&mut self.frozen) {
            if !id.is_null() {
                if let Err(e) = release_cascade(&self.core, id) {
                    log::error!("failed to release frozen root {id}: {e}");
                }
            }
        }
        self.core.seg.seal(&mut self.alloc);
        self.core.gc.unregister_session(self.slot);
        self.core
            .uncommitted_floor
            .store(u64::MAX, Ordering::Release);
        self.core.writer_active.store(false, Ordering::Release);
    }
}
