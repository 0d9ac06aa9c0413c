// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Cursor machinery: ordered traversal over one trie snapshot.
//!
//! A cursor is a stack of (node ID, position) frames plus the key bytes
//! accumulated on the way down. Frames hold IDs, not pointers, so every
//! step re-reads nodes through the metadata cells; the snapshot's
//! retained root keeps all reachable IDs alive, and compaction moving
//! bytes underneath is invisible through the indirection.

use super::NodeKind;
use crate::node::NodeId;
use crate::store::{ObjectRef, ReadGuard};
use crate::{Error, Result};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum FramePos {
    /// At the inner node's end-of-prefix value
    Eof,
    /// At (or descended through) this branch byte
    Branch(u8),
    /// At this entry of a binary leaf
    Entry(usize),
}

#[derive(Debug)]
struct Frame {
    id: NodeId,
    /// Length of the accumulated key before this node's contributions
    base: usize,
    pos: FramePos,
}

/// Position state of a cursor, independent of the owning session.
#[derive(Debug, Default)]
pub(crate) struct CursorState {
    root: NodeId,
    path: Vec<Frame>,
    key_buf: Vec<u8>,
    value: NodeId,
    valid: bool,
}

fn load_kind<'g>(guard: &ReadGuard<'g>, id: NodeId) -> Result<NodeKind<'g>> {
    let mut oref = ObjectRef::get(guard, id)?;
    let bytes = oref.node_bytes()?;
    crate::store::view_of(guard.core(), bytes)
}

impl CursorState {
    pub fn new(root: NodeId) -> Self {
        Self {
            root,
            ..Self::default()
        }
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn key(&self) -> Option<&[u8]> {
        self.valid.then_some(self.key_buf.as_slice())
    }

    pub fn value_id(&self) -> Option<NodeId> {
        self.valid.then_some(self.value)
    }

    fn reset(&mut self) {
        self.path.clear();
        self.key_buf.clear();
        self.value = NodeId::NULL;
        self.valid = false;
    }

    /// Positions at the smallest key.
    pub fn seek_first(&mut self, guard: &ReadGuard<'_>) -> Result<bool> {
        self.reset();
        if self.root.is_null() {
            return Ok(false);
        }
        self.descend_min(guard, self.root)?;
        self.valid = true;
        Ok(true)
    }

    /// Positions at the largest key.
    pub fn seek_last(&mut self, guard: &ReadGuard<'_>) -> Result<bool> {
        self.reset();
        if self.root.is_null() {
            return Ok(false);
        }
        self.descend_max(guard, self.root)?;
        self.valid = true;
        Ok(true)
    }

    /// Positions at the first key >= `key`.
    pub fn lower_bound(&mut self, guard: &ReadGuard<'_>, key: &[u8]) -> Result<bool> {
        self.reset();
        if self.root.is_null() {
            return Ok(false);
        }

        let mut id = self.root;
        let mut remaining = key;

        loop {
            let kind = load_kind(guard, id)?;
            match kind {
                NodeKind::Value(_) => {
                    return Err(guard.core().corrupt("value node in trie position"));
                }
                NodeKind::Binary(view) => {
                    if view.is_empty() {
                        return Err(guard.core().corrupt("empty leaf in trie"));
                    }
                    let base = self.key_buf.len();
                    let index = match view.search(remaining) {
                        Ok(i) | Err(i) => i,
                    };
                    if index < view.len() {
                        self.key_buf.extend_from_slice(view.key(index));
                        self.value = view.value_id(index);
                        self.path.push(Frame {
                            id,
                            base,
                            pos: FramePos::Entry(index),
                        });
                        self.valid = true;
                        return Ok(true);
                    }
                    // everything in this leaf is smaller; move on
                    self.path.push(Frame {
                        id,
                        base,
                        pos: FramePos::Entry(view.len() - 1),
                    });
                    self.valid = true;
                    return self.next(guard);
                }
                ref inner @ (NodeKind::Setlist(_) | NodeKind::Full(_)) => {
                    let (prefix, eof) = match inner {
                        NodeKind::Setlist(v) => (v.prefix(), v.eof_value()),
                        NodeKind::Full(v) => (v.prefix(), v.eof_value()),
                        _ => return Err(Error::Corruption("unreachable node kind")),
                    };

                    let shared = crate::node::common_prefix(remaining, prefix).len();
                    let base = self.key_buf.len();

                    if shared < prefix.len() {
                        if remaining.len() == shared || remaining[shared] < prefix[shared] {
                            // the whole subtree sorts after the key
                            self.descend_min(guard, id)?;
                            self.valid = true;
                            return Ok(true);
                        }
                        // the whole subtree sorts before the key
                        self.valid = true;
                        return self.next(guard);
                    }

                    self.key_buf.extend_from_slice(prefix);

                    if remaining.len() == prefix.len() {
                        if !eof.is_null() {
                            self.value = eof;
                            self.path.push(Frame {
                                id,
                                base,
                                pos: FramePos::Eof,
                            });
                            self.valid = true;
                            return Ok(true);
                        }
                        if let Some((byte, child)) = self.first_branch(guard, id)? {
                            self.path.push(Frame {
                                id,
                                base,
                                pos: FramePos::Branch(byte),
                            });
                            self.key_buf.push(byte);
                            self.descend_min(guard, child)?;
                            self.valid = true;
                            return Ok(true);
                        }
                        return Err(guard.core().corrupt("inner node with nothing below"));
                    }

                    let want = remaining[prefix.len()];
                    match self.branch_lower_bound(guard, id, want)? {
                        Some((byte, child)) if byte == want => {
                            self.path.push(Frame {
                                id,
                                base,
                                pos: FramePos::Branch(byte),
                            });
                            self.key_buf.push(byte);
                            remaining = &remaining[prefix.len() + 1..];
                            id = child;
                        }
                        Some((byte, child)) => {
                            self.path.push(Frame {
                                id,
                                base,
                                pos: FramePos::Branch(byte),
                            });
                            self.key_buf.push(byte);
                            self.descend_min(guard, child)?;
                            self.valid = true;
                            return Ok(true);
                        }
                        None => {
                            // every branch sorts before the key; the
                            // placeholder frame lets next() ascend past it
                            self.path.push(Frame {
                                id,
                                base,
                                pos: FramePos::Branch(want),
                            });
                            self.valid = true;
                            return self.next(guard);
                        }
                    }
                }
            }
        }
    }

    /// Advances to the next key in lexicographic order.
    pub fn next(&mut self, guard: &ReadGuard<'_>) -> Result<bool> {
        if !self.valid {
            return Ok(false);
        }

        loop {
            let Some(frame) = self.path.last_mut() else {
                self.reset();
                return Ok(false);
            };
            let (id, base, pos) = (frame.id, frame.base, frame.pos);

            match pos {
                FramePos::Entry(index) => {
                    let NodeKind::Binary(view) = load_kind(guard, id)? else {
                        return Err(guard.core().corrupt("leaf frame on a non-leaf"));
                    };
                    if index + 1 < view.len() {
                        frame.pos = FramePos::Entry(index + 1);
                        self.key_buf.truncate(base);
                        self.key_buf.extend_from_slice(view.key(index + 1));
                        self.value = view.value_id(index + 1);
                        return Ok(true);
                    }
                    self.path.pop();
                }
                FramePos::Eof => {
                    if let Some((byte, child)) = self.first_branch(guard, id)? {
                        let prefix_len = self.prefix_len(guard, id)?;
                        if let Some(frame) = self.path.last_mut() {
                            frame.pos = FramePos::Branch(byte);
                        }
                        self.key_buf.truncate(base + prefix_len);
                        self.key_buf.push(byte);
                        self.descend_min(guard, child)?;
                        return Ok(true);
                    }
                    self.path.pop();
                }
                FramePos::Branch(byte) => {
                    if byte < 255 {
                        if let Some((next_byte, child)) =
                            self.branch_lower_bound(guard, id, byte + 1)?
                        {
                            let prefix_len = self.prefix_len(guard, id)?;
                            if let Some(frame) = self.path.last_mut() {
                                frame.pos = FramePos::Branch(next_byte);
                            }
                            self.key_buf.truncate(base + prefix_len);
                            self.key_buf.push(next_byte);
                            self.descend_min(guard, child)?;
                            return Ok(true);
                        }
                    }
                    self.path.pop();
                }
            }
        }
    }

    /// Steps back to the previous key in lexicographic order.
    pub fn previous(&mut self, guard: &ReadGuard<'_>) -> Result<bool> {
        if !self.valid {
            return Ok(false);
        }

        loop {
            let Some(frame) = self.path.last_mut() else {
                self.reset();
                return Ok(false);
            };
            let (id, base, pos) = (frame.id, frame.base, frame.pos);

            match pos {
                FramePos::Entry(index) => {
                    if index > 0 {
                        let NodeKind::Binary(view) = load_kind(guard, id)? else {
                            return Err(guard.core().corrupt("leaf frame on a non-leaf"));
                        };
                        frame.pos = FramePos::Entry(index - 1);
                        self.key_buf.truncate(base);
                        self.key_buf.extend_from_slice(view.key(index - 1));
                        self.value = view.value_id(index - 1);
                        return Ok(true);
                    }
                    self.path.pop();
                }
                FramePos::Eof => {
                    self.path.pop();
                }
                FramePos::Branch(byte) => {
                    if let Some((prev_byte, child)) = self.branch_upper_bound(guard, id, byte)? {
                        let prefix_len = self.prefix_len(guard, id)?;
                        if let Some(frame) = self.path.last_mut() {
                            frame.pos = FramePos::Branch(prev_byte);
                        }
                        self.key_buf.truncate(base + prefix_len);
                        self.key_buf.push(prev_byte);
                        self.descend_max(guard, child)?;
                        return Ok(true);
                    }

                    // before the first branch comes the eof value
                    let eof = self.eof_of(guard, id)?;
                    if !eof.is_null() {
                        let prefix_len = self.prefix_len(guard, id)?;
                        if let Some(frame) = self.path.last_mut() {
                            frame.pos = FramePos::Eof;
                        }
                        self.key_buf.truncate(base + prefix_len);
                        self.value = eof;
                        return Ok(true);
                    }
                    self.path.pop();
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // descent helpers

    fn descend_min(&mut self, guard: &ReadGuard<'_>, mut id: NodeId) -> Result<()> {
        loop {
            let base = self.key_buf.len();
            match load_kind(guard, id)? {
                NodeKind::Value(_) => {
                    return Err(guard.core().corrupt("value node in trie position"));
                }
                NodeKind::Binary(view) => {
                    if view.is_empty() {
                        return Err(guard.core().corrupt("empty leaf in trie"));
                    }
                    self.key_buf.extend_from_slice(view.key(0));
                    self.value = view.value_id(0);
                    self.path.push(Frame {
                        id,
                        base,
                        pos: FramePos::Entry(0),
                    });
                    return Ok(());
                }
                NodeKind::Setlist(view) => {
                    self.key_buf.extend_from_slice(view.prefix());
                    if !view.eof_value().is_null() {
                        self.value = view.eof_value();
                        self.path.push(Frame {
                            id,
                            base,
                            pos: FramePos::Eof,
                        });
                        return Ok(());
                    }
                    if view.num_branches() == 0 {
                        return Err(guard.core().corrupt("inner node with nothing below"));
                    }
                    let byte = view.branch_byte(0);
                    let child = view.child(0);
                    self.path.push(Frame {
                        id,
                        base,
                        pos: FramePos::Branch(byte),
                    });
                    self.key_buf.push(byte);
                    id = child;
                }
                NodeKind::Full(view) => {
                    self.key_buf.extend_from_slice(view.prefix());
                    if !view.eof_value().is_null() {
                        self.value = view.eof_value();
                        self.path.push(Frame {
                            id,
                            base,
                            pos: FramePos::Eof,
                        });
                        return Ok(());
                    }
                    let Some((byte, child)) = view.lower_bound(0) else {
                        return Err(guard.core().corrupt("inner node with nothing below"));
                    };
                    self.path.push(Frame {
                        id,
                        base,
                        pos: FramePos::Branch(byte),
                    });
                    self.key_buf.push(byte);
                    id = child;
                }
            }
        }
    }

    fn descend_max(&mut self, guard: &ReadGuard<'_>, mut id: NodeId) -> Result<()> {
        loop {
            let base = self.key_buf.len();
            match load_kind(guard, id)? {
                NodeKind::Value(_) => {
                    return Err(guard.core().corrupt("value node in trie position"));
                }
                NodeKind::Binary(view) => {
                    if view.is_empty() {
                        return Err(guard.core().corrupt("empty leaf in trie"));
                    }
                    let last = view.len() - 1;
                    self.key_buf.extend_from_slice(view.key(last));
                    self.value = view.value_id(last);
                    self.path.push(Frame {
                        id,
                        base,
                        pos: FramePos::Entry(last),
                    });
                    return Ok(());
                }
                NodeKind::Setlist(view) => {
                    self.key_buf.extend_from_slice(view.prefix());
                    if view.num_branches() == 0 {
                        if view.eof_value().is_null() {
                            return Err(guard.core().corrupt("inner node with nothing below"));
                        }
                        self.value = view.eof_value();
                        self.path.push(Frame {
                            id,
                            base,
                            pos: FramePos::Eof,
                        });
                        return Ok(());
                    }
                    let last = view.num_branches() - 1;
                    let byte = view.branch_byte(last);
                    let child = view.child(last);
                    self.path.push(Frame {
                        id,
                        base,
                        pos: FramePos::Branch(byte),
                    });
                    self.key_buf.push(byte);
                    id = child;
                }
                NodeKind::Full(view) => {
                    self.key_buf.extend_from_slice(view.prefix());
                    let Some((byte, child)) = view.upper_bound_back(255) else {
                        if view.eof_value().is_null() {
                            return Err(guard.core().corrupt("inner node with nothing below"));
                        }
                        self.value = view.eof_value();
                        self.path.push(Frame {
                            id,
                            base,
                            pos: FramePos::Eof,
                        });
                        return Ok(());
                    };
                    self.path.push(Frame {
                        id,
                        base,
                        pos: FramePos::Branch(byte),
                    });
                    self.key_buf.push(byte);
                    id = child;
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // per-node lookups (frames hold IDs, so these re-read each time)

    fn prefix_len(&self, guard: &ReadGuard<'_>, id: NodeId) -> Result<usize> {
        Ok(match load_kind(guard, id)? {
            NodeKind::Setlist(view) => view.prefix().len(),
            NodeKind::Full(view) => view.prefix().len(),
            _ => 0,
        })
    }

    fn eof_of(&self, guard: &ReadGuard<'_>, id: NodeId) -> Result<NodeId> {
        Ok(match load_kind(guard, id)? {
            NodeKind::Setlist(view) => view.eof_value(),
            NodeKind::Full(view) => view.eof_value(),
            _ => NodeId::NULL,
        })
    }

    fn first_branch(&self, guard: &ReadGuard<'_>, id: NodeId) -> Result<Option<(u8, NodeId)>> {
        Ok(match load_kind(guard, id)? {
            NodeKind::Setlist(view) => (view.num_branches() > 0)
                .then(|| (view.branch_byte(0), view.child(0))),
            NodeKind::Full(view) => view.lower_bound(0),
            _ => None,
        })
    }

    /// First branch with byte >= `want`.
    fn branch_lower_bound(
        &self,
        guard: &ReadGuard<'_>,
        id: NodeId,
        want: u8,
    ) -> Result<Option<(u8, NodeId)>> {
        Ok(match load_kind(guard, id)? {
            NodeKind::Setlist(view) => view
                .lower_bound(want)
                .map(|i| (view.branch_byte(i), view.child(i))),
            NodeKind::Full(view) => view.lower_bound(want),
            _ => None,
        })
    }

    /// Last branch with byte < `want`.
    fn branch_upper_bound(
        &self,
        guard: &ReadGuard<'_>,
        id: NodeId,
        want: u8,
    ) -> Result<Option<(u8, NodeId)>> {
        if want == 0 {
            return Ok(None);
        }
        Ok(match load_kind(guard, id)? {
            NodeKind::Setlist(view) => {
                let index = view.lower_bound(want).unwrap_or(view.num_branches());
                (index > 0).then(|| (view.branch_byte(index - 1), view.child(index - 1)))
            }
            NodeKind::Full(view) => view.upper_bound_back(want - 1),
            _ => None,
        })
    }
}
