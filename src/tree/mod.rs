// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The radix-trie layer: upsert, erase, point lookup and validation over
//! the node store.
//!
//! ## Copy-on-write discipline
//!
//! A node may be rewritten without cloning only when it is *unique*:
//! reference count 1 and created by the current transaction (stored
//! version above the session's clone version). Everything else is cloned
//! on the way down, which is what keeps older snapshots intact.
//!
//! ## Reference ownership during a transaction
//!
//! * a node allocated under a new ID *retains* every pre-existing child
//!   it takes; children freshly created for it transfer their initial
//!   reference instead
//! * a node rewritten under its own ID (realloc / in-place) keeps its
//!   reference set; children it drops are defer-released, pre-existing
//!   children it newly absorbs are retained
//! * unlinking a whole node defers one release of it; the cascade at
//!   commit pays out its children
//!
//! Abort unwinds by construction: allocated nodes are cascade-released
//! (undoing exactly their retains), rewritten cells are swung back to
//! their logged prior bytes, and deferred releases are forgotten.

pub mod cursor;

use crate::node::coding::{write_id, write_u16, write_u64};
use crate::node::{
    binary::{self, BinaryView},
    common_prefix, full, setlist, value, NodeHeader, NodeId, NodeType,
};
use crate::store::{NodeKind, ObjectRef, ReadGuard, WriteCtx};
use crate::{Error, Result};

/// Returned size when a key was not present
pub(crate) const NOT_FOUND: i64 = -1;

// ---------------------------------------------------------------------
// read side

/// Point lookup; pure read, no clone.
pub(crate) fn get(guard: &ReadGuard<'_>, root: NodeId, key: &[u8]) -> Result<Option<Vec<u8>>> {
    let mut id = root;
    let mut remaining = key;

    loop {
        if id.is_null() {
            return Ok(None);
        }

        let mut oref = ObjectRef::get(guard, id)?;
        match oref.view()? {
            NodeKind::Value(_) => {
                return Err(guard.core().corrupt("value node in trie position"));
            }
            NodeKind::Binary(view) => {
                return match view.search(remaining) {
                    Ok(index) => Ok(Some(read_value(guard, view.value_id(index))?)),
                    Err(_) => Ok(None),
                };
            }
            NodeKind::Setlist(view) => {
                let prefix = view.prefix();
                if !remaining.starts_with(prefix) {
                    return Ok(None);
                }
                if remaining.len() == prefix.len() {
                    let eof = view.eof_value();
                    return if eof.is_null() {
                        Ok(None)
                    } else {
                        Ok(Some(read_value(guard, eof)?))
                    };
                }
                match view.find(remaining[prefix.len()]) {
                    Some(index) => {
                        id = view.child(index);
                        remaining = &remaining[prefix.len() + 1..];
                    }
                    None => return Ok(None),
                }
            }
            NodeKind::Full(view) => {
                let prefix = view.prefix();
                if !remaining.starts_with(prefix) {
                    return Ok(None);
                }
                if remaining.len() == prefix.len() {
                    let eof = view.eof_value();
                    return if eof.is_null() {
                        Ok(None)
                    } else {
                        Ok(Some(read_value(guard, eof)?))
                    };
                }
                let child = view.child(remaining[prefix.len()]);
                if child.is_null() {
                    return Ok(None);
                }
                id = child;
                remaining = &remaining[prefix.len() + 1..];
            }
        }
    }
}

pub(crate) fn read_value(guard: &ReadGuard<'_>, vid: NodeId) -> Result<Vec<u8>> {
    let mut oref = ObjectRef::get(guard, vid)?;
    match oref.view()? {
        NodeKind::Value(view) => Ok(view.value().to_vec()),
        _ => Err(guard.core().corrupt("expected a value node")),
    }
}

fn value_len(guard: &ReadGuard<'_>, vid: NodeId) -> Result<i64> {
    let mut oref = ObjectRef::get(guard, vid)?;
    match oref.view()? {
        NodeKind::Value(view) => Ok(view.value_len() as i64),
        _ => Err(guard.core().corrupt("expected a value node")),
    }
}

/// Number of keys under `root`.
pub(crate) fn count_keys(guard: &ReadGuard<'_>, root: NodeId) -> Result<u64> {
    if root.is_null() {
        return Ok(0);
    }
    let mut oref = ObjectRef::get(guard, root)?;
    Ok(match oref.view()? {
        NodeKind::Value(_) => return Err(guard.core().corrupt("value node in trie position")),
        NodeKind::Binary(view) => view.len() as u64,
        NodeKind::Setlist(view) => view.descendants(),
        NodeKind::Full(view) => view.descendants(),
    })
}

// ---------------------------------------------------------------------
// shared inner-node access for the write path

struct InnerSnapshot<'a> {
    node_type: NodeType,
    prefix: &'a [u8],
    eof: NodeId,
    descendants: u64,
    branches: Vec<(u8, NodeId)>,
    eof_slot: usize,
    desc_slot: usize,
}

fn inner_snapshot<'a>(kind: &NodeKind<'a>) -> Option<InnerSnapshot<'a>> {
    match kind {
        NodeKind::Setlist(view) => Some(InnerSnapshot {
            node_type: NodeType::Setlist,
            prefix: view.prefix(),
            eof: view.eof_value(),
            descendants: view.descendants(),
            branches: view.branches().collect(),
            eof_slot: view.eof_slot_offset(),
            desc_slot: view.descendants_slot_offset(),
        }),
        NodeKind::Full(view) => Some(InnerSnapshot {
            node_type: NodeType::Full,
            prefix: view.prefix(),
            eof: view.eof_value(),
            descendants: view.descendants(),
            branches: view.branches().collect(),
            eof_slot: view.eof_slot_offset(),
            desc_slot: view.descendants_slot_offset(),
        }),
        _ => None,
    }
}

enum BuildTarget<'o, 'g> {
    /// New ID; the build retains pre-existing references it copies
    Fresh,
    /// Same ID, new bytes; references transfer
    Realloc(&'o mut ObjectRef<'g>),
}

/// Writes an inner node of the given type from parts.
fn build_inner(
    ctx: &mut WriteCtx<'_>,
    target: BuildTarget<'_, '_>,
    node_type: NodeType,
    prefix: &[u8],
    eof: NodeId,
    descendants: u64,
    branches: &[(u8, NodeId)],
) -> Result<NodeId> {
    debug_assert!(matches!(node_type, NodeType::Setlist | NodeType::Full));

    let size = if node_type == NodeType::Setlist {
        setlist::layout_size(prefix.len(), branches.len())
    } else {
        full::layout_size(prefix.len())
    };

    let write = |buf: &mut [u8], id: NodeId, version: u64| {
        if node_type == NodeType::Setlist {
            setlist::write_new(buf, id, version, prefix, eof, descendants, branches);
        } else {
            full::write_new(buf, id, version, prefix, eof, descendants, branches);
        }
    };

    match target {
        BuildTarget::Fresh => ctx.alloc_node(node_type, size, write),
        BuildTarget::Realloc(oref) => {
            let id = oref.id();
            ctx.realloc_node(oref, node_type, size, write)?;
            Ok(id)
        }
    }
}

fn retain_ref(guard: &ReadGuard<'_>, id: NodeId) -> Result<()> {
    if !id.is_null() {
        ObjectRef::get(guard, id)?.retain()?;
    }
    Ok(())
}

fn new_value_node(ctx: &mut WriteCtx<'_>, val: &[u8]) -> Result<NodeId> {
    ctx.alloc_node(NodeType::Value, value::layout_size(val.len()), |buf, id, ver| {
        value::write_new(buf, id, ver, val);
    })
}

/// A binary leaf holding a single (key, fresh value) entry.
fn new_leaf(ctx: &mut WriteCtx<'_>, key: &[u8], val: &[u8]) -> Result<NodeId> {
    let vid = new_value_node(ctx, val)?;
    ctx.alloc_node(
        NodeType::Binary,
        binary::layout_size(1, key.len()),
        |buf, id, ver| binary::write_new(buf, id, ver, [(key, vid)].into_iter()),
    )
}

// ---------------------------------------------------------------------
// upsert

/// Inserts or replaces `key`, returning the new root and the previous
/// value's size (or [`NOT_FOUND`]).
pub(crate) fn upsert(
    ctx: &mut WriteCtx<'_>,
    guard: &ReadGuard<'_>,
    root: NodeId,
    key: &[u8],
    val: &[u8],
) -> Result<(NodeId, i64)> {
    if root.is_null() {
        return Ok((new_leaf(ctx, key, val)?, NOT_FOUND));
    }

    let mut prev = NOT_FOUND;
    let new_root = upsert_node(ctx, guard, root, key, val, &mut prev)?;
    Ok((new_root, prev))
}

fn upsert_node(
    ctx: &mut WriteCtx<'_>,
    guard: &ReadGuard<'_>,
    id: NodeId,
    key: &[u8],
    val: &[u8],
    prev: &mut i64,
) -> Result<NodeId> {
    let mut oref = ObjectRef::get(guard, id)?;
    let bytes = oref.node_bytes()?;
    let header = NodeHeader::read(bytes);
    let unique = ctx.is_unique(oref.meta(), header.version);

    let kind = crate::store::view_of(ctx.core, bytes)?;
    match kind {
        NodeKind::Binary(view) => upsert_binary(ctx, guard, &mut oref, view, unique, key, val, prev),
        NodeKind::Setlist(_) | NodeKind::Full(_) => {
            upsert_inner(ctx, guard, &mut oref, &kind, unique, key, val, prev)
        }
        NodeKind::Value(_) => Err(ctx.core.corrupt("value node in trie position")),
    }
}

#[allow(clippy::too_many_arguments)]
fn upsert_binary(
    ctx: &mut WriteCtx<'_>,
    guard: &ReadGuard<'_>,
    oref: &mut ObjectRef<'_>,
    view: BinaryView<'_>,
    unique: bool,
    key: &[u8],
    val: &[u8],
    prev: &mut i64,
) -> Result<NodeId> {
    let id = oref.id();

    match view.search(key) {
        Ok(index) => {
            let old_vid = view.value_id(index);
            *prev = value_len(guard, old_vid)?;
            let new_vid = new_value_node(ctx, val)?;

            if unique {
                let slot = view.value_slot_offset(index);
                let patched = ctx
                    .modify_in_place(oref, |buf| write_id(buf, slot, new_vid))?
                    .is_some();
                if !patched {
                    let entries: Vec<(&[u8], NodeId)> = view
                        .entries()
                        .enumerate()
                        .map(|(i, (k, v))| (k, if i == index { new_vid } else { v }))
                        .collect();
                    let size = binary::layout_size(entries.len(), view.keys_byte_len());
                    ctx.realloc_node(oref, NodeType::Binary, size, |buf, nid, ver| {
                        binary::write_new(buf, nid, ver, entries.into_iter());
                    })?;
                }
                ctx.defer_release(old_vid);
                Ok(id)
            } else {
                for (i, (_, v)) in view.entries().enumerate() {
                    if i != index {
                        retain_ref(guard, v)?;
                    }
                }
                let entries: Vec<(&[u8], NodeId)> = view
                    .entries()
                    .enumerate()
                    .map(|(i, (k, v))| (k, if i == index { new_vid } else { v }))
                    .collect();
                let size = binary::layout_size(entries.len(), view.keys_byte_len());
                ctx.alloc_node(NodeType::Binary, size, |buf, nid, ver| {
                    binary::write_new(buf, nid, ver, entries.into_iter());
                })
            }
        }
        Err(insert_at) => {
            *prev = NOT_FOUND;

            let overflows = view.len() + 1 > crate::config::BINARY_NODE_MAX_KEYS
                || binary::layout_size_after_insert(&view, key.len())
                    > ctx.core.config.binary_refactor_threshold as u32;

            if overflows && view.len() >= 2 {
                let refactored = refactor_binary(ctx, guard, oref, view, unique)?;
                return upsert_node(ctx, guard, refactored, key, val, prev);
            }

            let new_vid = new_value_node(ctx, val)?;
            let entries: Vec<(&[u8], NodeId)> = view
                .entries()
                .take(insert_at)
                .chain(std::iter::once((key, new_vid)))
                .chain(view.entries().skip(insert_at))
                .collect();
            let size = binary::layout_size(entries.len(), view.keys_byte_len() + key.len());

            if unique {
                ctx.realloc_node(oref, NodeType::Binary, size, |buf, nid, ver| {
                    binary::write_new(buf, nid, ver, entries.into_iter());
                })?;
                Ok(id)
            } else {
                for (_, v) in view.entries() {
                    retain_ref(guard, v)?;
                }
                ctx.alloc_node(NodeType::Binary, size, |buf, nid, ver| {
                    binary::write_new(buf, nid, ver, entries.into_iter());
                })
            }
        }
    }
}

/// Splits an overflowing binary leaf into a setlist whose children are
/// binary leaves, grouped by the byte after the common prefix.
fn refactor_binary(
    ctx: &mut WriteCtx<'_>,
    guard: &ReadGuard<'_>,
    oref: &mut ObjectRef<'_>,
    view: BinaryView<'_>,
    unique: bool,
) -> Result<NodeId> {
    let n = view.len();
    debug_assert!(n >= 2);

    let cpre = common_prefix(view.key(0), view.key(n - 1));
    let has_eof = view.key(0).len() == cpre.len();
    let eof_vid = if has_eof { view.value_id(0) } else { NodeId::NULL };

    let mut branches: Vec<(u8, NodeId)> = Vec::new();
    let mut start = usize::from(has_eof);

    while start < n {
        let byte = view.key(start)[cpre.len()];
        let mut end = start + 1;
        while end < n && view.key(end)[cpre.len()] == byte {
            end += 1;
        }

        let mut keys_len = 0;
        let entries: Vec<(&[u8], NodeId)> = (start..end)
            .map(|i| {
                let k = &view.key(i)[cpre.len() + 1..];
                keys_len += k.len();
                (k, view.value_id(i))
            })
            .collect();

        // the child leaf becomes the new owner of these values
        for (_, vid) in &entries {
            retain_ref(guard, *vid)?;
            if unique {
                // the rewritten leaf's old bytes are freed without a
                // cascade, so its ownership must be released explicitly
                ctx.defer_release(*vid);
            }
        }

        let child = ctx.alloc_node(
            NodeType::Binary,
            binary::layout_size(entries.len(), keys_len),
            |buf, nid, ver| binary::write_new(buf, nid, ver, entries.into_iter()),
        )?;
        branches.push((byte, child));
        start = end;
    }

    let node_type = if branches.len() > ctx.core.config.full_node_threshold {
        NodeType::Full
    } else {
        NodeType::Setlist
    };

    if unique {
        build_inner(
            ctx,
            BuildTarget::Realloc(oref),
            node_type,
            cpre,
            eof_vid,
            n as u64,
            &branches,
        )
    } else {
        retain_ref(guard, eof_vid)?;
        build_inner(
            ctx,
            BuildTarget::Fresh,
            node_type,
            cpre,
            eof_vid,
            n as u64,
            &branches,
        )
    }
}

#[allow(clippy::too_many_arguments)]
fn upsert_inner(
    ctx: &mut WriteCtx<'_>,
    guard: &ReadGuard<'_>,
    oref: &mut ObjectRef<'_>,
    kind: &NodeKind<'_>,
    unique: bool,
    key: &[u8],
    val: &[u8],
    prev: &mut i64,
) -> Result<NodeId> {
    let id = oref.id();
    let snap = inner_snapshot(kind).ok_or(Error::Corruption("expected an inner node"))?;
    let cpre_len = common_prefix(key, snap.prefix).len();

    if cpre_len < snap.prefix.len() {
        *prev = NOT_FOUND;
        return split_prefix(ctx, guard, oref, &snap, unique, key, cpre_len, val);
    }

    if key.len() == snap.prefix.len() {
        // the key ends exactly at this node
        let old = snap.eof;
        *prev = if old.is_null() {
            NOT_FOUND
        } else {
            value_len(guard, old)?
        };
        let new_vid = new_value_node(ctx, val)?;
        let descendants = snap.descendants + u64::from(old.is_null());

        if unique {
            let (eof_slot, desc_slot) = (snap.eof_slot, snap.desc_slot);
            let patched = ctx
                .modify_in_place(oref, |buf| {
                    write_id(buf, eof_slot, new_vid);
                    write_u64(buf, desc_slot, descendants);
                })?
                .is_some();
            if !patched {
                build_inner(
                    ctx,
                    BuildTarget::Realloc(oref),
                    snap.node_type,
                    snap.prefix,
                    new_vid,
                    descendants,
                    &snap.branches,
                )?;
            }
            ctx.defer_release(old);
            return Ok(id);
        }

        for (_, child) in &snap.branches {
            retain_ref(guard, *child)?;
        }
        return build_inner(
            ctx,
            BuildTarget::Fresh,
            snap.node_type,
            snap.prefix,
            new_vid,
            descendants,
            &snap.branches,
        );
    }

    let byte = key[snap.prefix.len()];
    let rest = &key[snap.prefix.len() + 1..];
    let existing = snap
        .branches
        .iter()
        .find(|(b, _)| *b == byte)
        .map(|(_, c)| *c);

    if let Some(child) = existing {
        let new_child = upsert_node(ctx, guard, child, rest, val, prev)?;
        let inserted = *prev == NOT_FOUND;

        if new_child == child && !inserted {
            return Ok(id);
        }

        let descendants = snap.descendants + u64::from(inserted);

        if unique {
            let (desc_slot, child_slot) = (snap.desc_slot, child_slot(kind, byte));
            let patched = ctx
                .modify_in_place(oref, |buf| {
                    write_u64(buf, desc_slot, descendants);
                    if new_child != child {
                        write_id(buf, child_slot, new_child);
                    }
                })?
                .is_some();
            if !patched {
                let branches: Vec<(u8, NodeId)> = snap
                    .branches
                    .iter()
                    .map(|(b, c)| (*b, if *b == byte { new_child } else { *c }))
                    .collect();
                build_inner(
                    ctx,
                    BuildTarget::Realloc(oref),
                    snap.node_type,
                    snap.prefix,
                    snap.eof,
                    descendants,
                    &branches,
                )?;
            }
            if new_child != child {
                ctx.defer_release(child);
            }
            return Ok(id);
        }

        debug_assert_ne!(new_child, child, "a shared parent cannot have a unique child");
        for (b, c) in &snap.branches {
            if *b != byte {
                retain_ref(guard, *c)?;
            }
        }
        retain_ref(guard, snap.eof)?;

        let branches: Vec<(u8, NodeId)> = snap
            .branches
            .iter()
            .map(|(b, c)| (*b, if *b == byte { new_child } else { *c }))
            .collect();
        return build_inner(
            ctx,
            BuildTarget::Fresh,
            snap.node_type,
            snap.prefix,
            snap.eof,
            descendants,
            &branches,
        );
    }

    // no branch for this byte yet
    *prev = NOT_FOUND;
    let leaf = new_leaf(ctx, rest, val)?;
    let descendants = snap.descendants + 1;

    // in-place slot fill is possible for full nodes: the slot exists
    if unique && snap.node_type == NodeType::Full {
        if let NodeKind::Full(view) = kind {
            let (child_slot, desc_slot, num_slot) = (
                view.child_slot_offset(byte),
                snap.desc_slot,
                view.num_slot_offset(),
            );
            let num = view.num_branches() as u16 + 1;
            let patched = ctx
                .modify_in_place(oref, |buf| {
                    write_id(buf, child_slot, leaf);
                    write_u64(buf, desc_slot, descendants);
                    write_u16(buf, num_slot, num);
                })?
                .is_some();
            if patched {
                return Ok(id);
            }
        }
    }

    let mut branches = snap.branches.clone();
    let at = branches.partition_point(|(b, _)| *b < byte);
    branches.insert(at, (byte, leaf));

    let node_type = if branches.len() > ctx.core.config.full_node_threshold {
        NodeType::Full
    } else {
        snap.node_type
    };

    if unique {
        build_inner(
            ctx,
            BuildTarget::Realloc(oref),
            node_type,
            snap.prefix,
            snap.eof,
            descendants,
            &branches,
        )
    } else {
        for (b, c) in &snap.branches {
            debug_assert_ne!(*b, byte);
            retain_ref(guard, *c)?;
        }
        retain_ref(guard, snap.eof)?;
        build_inner(
            ctx,
            BuildTarget::Fresh,
            node_type,
            snap.prefix,
            snap.eof,
            descendants,
            &branches,
        )
    }
}

fn child_slot(kind: &NodeKind<'_>, byte: u8) -> usize {
    match kind {
        NodeKind::Setlist(view) => {
            let index = view.find(byte).unwrap_or_default();
            view.child_slot_offset(index)
        }
        NodeKind::Full(view) => view.child_slot_offset(byte),
        _ => 0,
    }
}

/// The key diverges inside this node's prefix: interpose a new setlist
/// at the shared part, with the truncated node and the new leaf (or an
/// end-of-prefix value) below it.
#[allow(clippy::too_many_arguments)]
fn split_prefix(
    ctx: &mut WriteCtx<'_>,
    guard: &ReadGuard<'_>,
    oref: &mut ObjectRef<'_>,
    snap: &InnerSnapshot<'_>,
    unique: bool,
    key: &[u8],
    cpre_len: usize,
    val: &[u8],
) -> Result<NodeId> {
    let old_byte = snap.prefix[cpre_len];
    let truncated = &snap.prefix[cpre_len + 1..];
    let cpre = &key[..cpre_len];

    let lowered = if unique {
        let new_len = truncated.len();
        let node_type = snap.node_type;
        let patched = ctx
            .modify_in_place(oref, |buf| {
                if node_type == NodeType::Setlist {
                    setlist::truncate_prefix_in_place(buf, new_len);
                } else {
                    full::truncate_prefix_in_place(buf, new_len);
                }
            })?
            .is_some();
        if !patched {
            build_inner(
                ctx,
                BuildTarget::Realloc(oref),
                snap.node_type,
                truncated,
                snap.eof,
                snap.descendants,
                &snap.branches,
            )?;
        }
        // pre-existing ID taken by the new parent; the caller will still
        // release its own reference when it sees a different ID come back
        retain_ref(guard, oref.id())?;
        oref.id()
    } else {
        for (_, child) in &snap.branches {
            retain_ref(guard, *child)?;
        }
        retain_ref(guard, snap.eof)?;
        build_inner(
            ctx,
            BuildTarget::Fresh,
            snap.node_type,
            truncated,
            snap.eof,
            snap.descendants,
            &snap.branches,
        )?
    };

    if key.len() == cpre_len {
        // the new key ends at the split point
        let vid = new_value_node(ctx, val)?;
        build_inner(
            ctx,
            BuildTarget::Fresh,
            NodeType::Setlist,
            cpre,
            vid,
            snap.descendants + 1,
            &[(old_byte, lowered)],
        )
    } else {
        let new_byte = key[cpre_len];
        debug_assert_ne!(new_byte, old_byte);
        let leaf = new_leaf(ctx, &key[cpre_len + 1..], val)?;

        let branches = if new_byte < old_byte {
            [(new_byte, leaf), (old_byte, lowered)]
        } else {
            [(old_byte, lowered), (new_byte, leaf)]
        };
        build_inner(
            ctx,
            BuildTarget::Fresh,
            NodeType::Setlist,
            cpre,
            NodeId::NULL,
            snap.descendants + 1,
            &branches,
        )
    }
}

// ---------------------------------------------------------------------
// erase

/// Removes `key`, returning the (possibly null) new root and the removed
/// value's size, or [`NOT_FOUND`] with the root untouched.
pub(crate) fn remove(
    ctx: &mut WriteCtx<'_>,
    guard: &ReadGuard<'_>,
    root: NodeId,
    key: &[u8],
) -> Result<(NodeId, i64)> {
    if root.is_null() {
        return Ok((root, NOT_FOUND));
    }

    let mut removed = NOT_FOUND;
    let result = erase_node(ctx, guard, root, key, &mut removed)?;
    Ok((result.unwrap_or(NodeId::NULL), removed))
}

/// `None` means the subtree became empty; the caller drops its reference
/// to the input node (the cascade pays out any children it still holds).
fn erase_node(
    ctx: &mut WriteCtx<'_>,
    guard: &ReadGuard<'_>,
    id: NodeId,
    key: &[u8],
    removed: &mut i64,
) -> Result<Option<NodeId>> {
    let mut oref = ObjectRef::get(guard, id)?;
    let bytes = oref.node_bytes()?;
    let header = NodeHeader::read(bytes);
    let unique = ctx.is_unique(oref.meta(), header.version);

    let kind = crate::store::view_of(ctx.core, bytes)?;
    match kind {
        NodeKind::Binary(view) => erase_binary(ctx, guard, &mut oref, view, unique, key, removed),
        NodeKind::Setlist(_) | NodeKind::Full(_) => {
            erase_inner(ctx, guard, &mut oref, &kind, unique, key, removed)
        }
        NodeKind::Value(_) => Err(ctx.core.corrupt("value node in trie position")),
    }
}

fn erase_binary(
    ctx: &mut WriteCtx<'_>,
    guard: &ReadGuard<'_>,
    oref: &mut ObjectRef<'_>,
    view: BinaryView<'_>,
    unique: bool,
    key: &[u8],
    removed: &mut i64,
) -> Result<Option<NodeId>> {
    let Ok(index) = view.search(key) else {
        *removed = NOT_FOUND;
        return Ok(Some(oref.id()));
    };

    let old_vid = view.value_id(index);
    *removed = value_len(guard, old_vid)?;

    if view.len() == 1 {
        // the caller's release of this node pays out the value
        return Ok(None);
    }

    let entries: Vec<(&[u8], NodeId)> = view
        .entries()
        .enumerate()
        .filter(|(i, _)| *i != index)
        .map(|(_, e)| e)
        .collect();
    let size = binary::layout_size(entries.len(), view.keys_byte_len() - key.len());

    if unique {
        ctx.realloc_node(oref, NodeType::Binary, size, |buf, nid, ver| {
            binary::write_new(buf, nid, ver, entries.into_iter());
        })?;
        ctx.defer_release(old_vid);
        Ok(Some(oref.id()))
    } else {
        for (i, (_, v)) in view.entries().enumerate() {
            if i != index {
                retain_ref(guard, v)?;
            }
        }
        let nid = ctx.alloc_node(NodeType::Binary, size, |buf, nid, ver| {
            binary::write_new(buf, nid, ver, entries.into_iter());
        })?;
        Ok(Some(nid))
    }
}

#[allow(clippy::too_many_arguments)]
fn erase_inner(
    ctx: &mut WriteCtx<'_>,
    guard: &ReadGuard<'_>,
    oref: &mut ObjectRef<'_>,
    kind: &NodeKind<'_>,
    unique: bool,
    key: &[u8],
    removed: &mut i64,
) -> Result<Option<NodeId>> {
    let id = oref.id();
    let snap = inner_snapshot(kind).ok_or(Error::Corruption("expected an inner node"))?;

    if !key.starts_with(snap.prefix) {
        *removed = NOT_FOUND;
        return Ok(Some(id));
    }

    if key.len() == snap.prefix.len() {
        // removing the end-of-prefix value
        if snap.eof.is_null() {
            *removed = NOT_FOUND;
            return Ok(Some(id));
        }
        *removed = value_len(guard, snap.eof)?;

        if snap.branches.is_empty() {
            return Ok(None);
        }
        if snap.branches.len() == 1 {
            if unique {
                // the rewrite drops the eof value from this node
                ctx.defer_release(snap.eof);
            }
            return collapse_single(ctx, guard, oref, &snap, unique, None).map(Some);
        }

        let descendants = snap.descendants - 1;
        if unique {
            let (eof_slot, desc_slot) = (snap.eof_slot, snap.desc_slot);
            let patched = ctx
                .modify_in_place(oref, |buf| {
                    write_id(buf, eof_slot, NodeId::NULL);
                    write_u64(buf, desc_slot, descendants);
                })?
                .is_some();
            if !patched {
                build_inner(
                    ctx,
                    BuildTarget::Realloc(oref),
                    snap.node_type,
                    snap.prefix,
                    NodeId::NULL,
                    descendants,
                    &snap.branches,
                )?;
            }
            ctx.defer_release(snap.eof);
            return Ok(Some(id));
        }

        for (_, child) in &snap.branches {
            retain_ref(guard, *child)?;
        }
        return build_inner(
            ctx,
            BuildTarget::Fresh,
            demoted(ctx, snap.node_type, snap.branches.len()),
            snap.prefix,
            NodeId::NULL,
            descendants,
            &snap.branches,
        )
        .map(Some);
    }

    let byte = key[snap.prefix.len()];
    let rest = &key[snap.prefix.len() + 1..];
    let Some(child) = snap
        .branches
        .iter()
        .find(|(b, _)| *b == byte)
        .map(|(_, c)| *c)
    else {
        *removed = NOT_FOUND;
        return Ok(Some(id));
    };

    let child_result = erase_node(ctx, guard, child, rest, removed)?;
    if *removed == NOT_FOUND {
        return Ok(Some(id));
    }

    let descendants = snap.descendants - 1;

    match child_result {
        Some(new_child) => {
            if unique {
                let (desc_slot, slot) = (snap.desc_slot, child_slot(kind, byte));
                let patched = ctx
                    .modify_in_place(oref, |buf| {
                        write_u64(buf, desc_slot, descendants);
                        if new_child != child {
                            write_id(buf, slot, new_child);
                        }
                    })?
                    .is_some();
                if !patched {
                    let branches: Vec<(u8, NodeId)> = snap
                        .branches
                        .iter()
                        .map(|(b, c)| (*b, if *b == byte { new_child } else { *c }))
                        .collect();
                    build_inner(
                        ctx,
                        BuildTarget::Realloc(oref),
                        snap.node_type,
                        snap.prefix,
                        snap.eof,
                        descendants,
                        &branches,
                    )?;
                }
                if new_child != child {
                    ctx.defer_release(child);
                }
                Ok(Some(id))
            } else {
                debug_assert_ne!(new_child, child);
                for (b, c) in &snap.branches {
                    if *b != byte {
                        retain_ref(guard, *c)?;
                    }
                }
                retain_ref(guard, snap.eof)?;

                let branches: Vec<(u8, NodeId)> = snap
                    .branches
                    .iter()
                    .map(|(b, c)| (*b, if *b == byte { new_child } else { *c }))
                    .collect();
                build_inner(
                    ctx,
                    BuildTarget::Fresh,
                    snap.node_type,
                    snap.prefix,
                    snap.eof,
                    descendants,
                    &branches,
                )
                .map(Some)
            }
        }
        None => {
            // the child vanished entirely
            let remaining: Vec<(u8, NodeId)> = snap
                .branches
                .iter()
                .filter(|(b, _)| *b != byte)
                .copied()
                .collect();

            if remaining.is_empty() && snap.eof.is_null() {
                return Ok(None);
            }
            if remaining.is_empty() {
                // only the end-of-prefix value is left: shrink to a leaf
                return collapse_to_leaf(ctx, guard, oref, &snap, unique, child).map(Some);
            }
            if remaining.len() == 1 && snap.eof.is_null() {
                return collapse_single(ctx, guard, oref, &snap, unique, Some((byte, child)))
                    .map(Some);
            }

            if unique {
                build_inner(
                    ctx,
                    BuildTarget::Realloc(oref),
                    demoted(ctx, snap.node_type, remaining.len()),
                    snap.prefix,
                    snap.eof,
                    descendants,
                    &remaining,
                )?;
                ctx.defer_release(child);
                Ok(Some(id))
            } else {
                for (_, c) in &remaining {
                    retain_ref(guard, *c)?;
                }
                retain_ref(guard, snap.eof)?;
                build_inner(
                    ctx,
                    BuildTarget::Fresh,
                    demoted(ctx, snap.node_type, remaining.len()),
                    snap.prefix,
                    snap.eof,
                    descendants,
                    &remaining,
                )
                .map(Some)
            }
        }
    }
}

/// Full nodes fall back to a setlist once erase leaves them half empty.
fn demoted(ctx: &WriteCtx<'_>, node_type: NodeType, branch_count: usize) -> NodeType {
    if node_type == NodeType::Full && branch_count < ctx.core.config.full_node_threshold / 2 {
        NodeType::Setlist
    } else {
        node_type
    }
}

/// Only the end-of-prefix value remains: the node becomes a binary leaf
/// holding `{prefix -> value}`.
fn collapse_to_leaf(
    ctx: &mut WriteCtx<'_>,
    guard: &ReadGuard<'_>,
    oref: &mut ObjectRef<'_>,
    snap: &InnerSnapshot<'_>,
    unique: bool,
    removed_child: NodeId,
) -> Result<NodeId> {
    let size = binary::layout_size(1, snap.prefix.len());
    let entries = [(snap.prefix, snap.eof)];

    if unique {
        ctx.realloc_node(oref, NodeType::Binary, size, |buf, nid, ver| {
            binary::write_new(buf, nid, ver, entries.into_iter());
        })?;
        ctx.defer_release(removed_child);
        Ok(oref.id())
    } else {
        retain_ref(guard, snap.eof)?;
        ctx.alloc_node(NodeType::Binary, size, |buf, nid, ver| {
            binary::write_new(buf, nid, ver, entries.into_iter());
        })
    }
}

/// One branch (and no end-of-prefix value) remains: merge this node's
/// prefix, the branch byte and the child into a single node.
///
/// `removed` is the branch that just vanished, if any.
fn collapse_single(
    ctx: &mut WriteCtx<'_>,
    guard: &ReadGuard<'_>,
    oref: &mut ObjectRef<'_>,
    snap: &InnerSnapshot<'_>,
    unique: bool,
    removed: Option<(u8, NodeId)>,
) -> Result<NodeId> {
    let (keep_byte, keep_child) = *snap
        .branches
        .iter()
        .find(|(b, _)| removed.map_or(true, |(rb, _)| *b != rb))
        .ok_or(Error::Corruption("collapse of a branchless node"))?;

    let mut merged_prefix = Vec::with_capacity(snap.prefix.len() + 1 + 64);
    merged_prefix.extend_from_slice(snap.prefix);
    merged_prefix.push(keep_byte);

    let mut child_ref = ObjectRef::get(guard, keep_child)?;
    let child_kind = child_ref.view()?;

    enum Merged<'a> {
        Leaf(Vec<(Vec<u8>, NodeId)>, usize),
        Inner(InnerSnapshot<'a>),
    }

    let merged = match &child_kind {
        NodeKind::Binary(view) => {
            let mut keys_len = 0;
            let entries: Vec<(Vec<u8>, NodeId)> = view
                .entries()
                .map(|(k, v)| {
                    let mut key = merged_prefix.clone();
                    key.extend_from_slice(k);
                    keys_len += key.len();
                    (key, v)
                })
                .collect();
            Merged::Leaf(entries, keys_len)
        }
        kind => {
            let child_snap =
                inner_snapshot(kind).ok_or(Error::Corruption("expected an inner node"))?;
            merged_prefix.extend_from_slice(child_snap.prefix);
            Merged::Inner(child_snap)
        }
    };

    // the merged node can blow the leaf budget; then the two-level shape
    // simply stays
    if let Merged::Leaf(entries, keys_len) = &merged {
        let size = binary::layout_size(entries.len(), *keys_len);
        if size > ctx.core.config.binary_refactor_threshold as u32 {
            return keep_two_level(ctx, guard, oref, snap, unique, removed, (keep_byte, keep_child));
        }
        let entries: Vec<(&[u8], NodeId)> =
            entries.iter().map(|(k, v)| (k.as_slice(), *v)).collect();

        // this node absorbs the child's values; the release of the child
        // itself (cascade) pays back these retains
        for (_, v) in &entries {
            retain_ref(guard, *v)?;
        }

        let built = if unique {
            ctx.realloc_node(oref, NodeType::Binary, size, |buf, nid, ver| {
                binary::write_new(buf, nid, ver, entries.into_iter());
            })?;
            oref.id()
        } else {
            ctx.alloc_node(NodeType::Binary, size, |buf, nid, ver| {
                binary::write_new(buf, nid, ver, entries.into_iter());
            })?
        };

        finish_collapse(ctx, guard, unique, removed, keep_child)?;
        return Ok(built);
    }

    let Merged::Inner(child_snap) = merged else {
        return Err(Error::Corruption("unreachable merge state"));
    };

    for (_, c) in &child_snap.branches {
        retain_ref(guard, *c)?;
    }
    retain_ref(guard, child_snap.eof)?;

    let built = if unique {
        build_inner(
            ctx,
            BuildTarget::Realloc(oref),
            child_snap.node_type,
            &merged_prefix,
            child_snap.eof,
            child_snap.descendants,
            &child_snap.branches,
        )?
    } else {
        build_inner(
            ctx,
            BuildTarget::Fresh,
            child_snap.node_type,
            &merged_prefix,
            child_snap.eof,
            child_snap.descendants,
            &child_snap.branches,
        )?
    };

    finish_collapse(ctx, guard, unique, removed, keep_child)?;
    Ok(built)
}

fn finish_collapse(
    ctx: &mut WriteCtx<'_>,
    _guard: &ReadGuard<'_>,
    unique: bool,
    removed: Option<(u8, NodeId)>,
    keep_child: NodeId,
) -> Result<()> {
    if unique {
        // the rewritten node dropped both its surviving child (absorbed)
        // and, on the erase path, the emptied one
        ctx.defer_release(keep_child);
        if let Some((_, gone)) = removed {
            ctx.defer_release(gone);
        }
    }
    // in the clone case, the caller's release of the old node cascades
    // into both children
    Ok(())
}

/// Collapse would overshoot the leaf budget: rebuild as an inner node
/// with the single branch kept.
///
/// Both paths that land here (erasing the eof value, or emptying the
/// other branch) leave no end-of-prefix value behind.
#[allow(clippy::too_many_arguments)]
fn keep_two_level(
    ctx: &mut WriteCtx<'_>,
    guard: &ReadGuard<'_>,
    oref: &mut ObjectRef<'_>,
    snap: &InnerSnapshot<'_>,
    unique: bool,
    removed: Option<(u8, NodeId)>,
    keep: (u8, NodeId),
) -> Result<NodeId> {
    let branches = [keep];
    let descendants = snap.descendants - 1;

    if unique {
        build_inner(
            ctx,
            BuildTarget::Realloc(oref),
            NodeType::Setlist,
            snap.prefix,
            NodeId::NULL,
            descendants,
            &branches,
        )?;
        if let Some((_, gone)) = removed {
            ctx.defer_release(gone);
        }
        Ok(oref.id())
    } else {
        retain_ref(guard, keep.1)?;
        build_inner(
            ctx,
            BuildTarget::Fresh,
            NodeType::Setlist,
            snap.prefix,
            NodeId::NULL,
            descendants,
            &branches,
        )
    }
}

// ---------------------------------------------------------------------
// validation

/// Full structural audit of the trie under `root`.
///
/// Checks header/cell agreement, checksums, prefix lengths, entry order
/// and descendant counts; detects reference cycles. Returns the number
/// of keys.
pub(crate) fn validate(guard: &ReadGuard<'_>, root: NodeId) -> Result<u64> {
    use rustc_hash::FxHashSet;

    if root.is_null() {
        return Ok(0);
    }

    let mut seen: FxHashSet<NodeId> = FxHashSet::default();
    let mut work: Vec<(NodeId, usize)> = vec![(root, 0)];
    let mut keys = 0u64;

    while let Some((id, depth)) = work.pop() {
        if depth > 1_032 {
            // every level consumes at least one key byte
            return Err(Error::Corruption("trie deeper than any legal key"));
        }
        if !seen.insert(id) {
            return Err(Error::Corruption("node reachable twice within one root"));
        }

        let mut oref = ObjectRef::get(guard, id)?;
        let bytes = oref.node_bytes()?;
        crate::node::verify_checksum(bytes)?;

        let meta = oref.meta();
        if meta.ref_count() == 0 {
            return Err(Error::Corruption("live node with zero references"));
        }

        match crate::store::view_of(guard.core(), bytes)? {
            NodeKind::Value(_) => {
                return Err(Error::Corruption("value node in trie position"));
            }
            NodeKind::Binary(view) => {
                keys += view.len() as u64;
                let mut prev: Option<&[u8]> = None;
                for (k, vid) in view.entries() {
                    if let Some(p) = prev {
                        if p >= k {
                            return Err(Error::Corruption("binary entries out of order"));
                        }
                    }
                    prev = Some(k);

                    let mut vref = ObjectRef::get(guard, vid)?;
                    if !matches!(vref.view()?, NodeKind::Value(_)) {
                        return Err(Error::Corruption("binary entry points at a non-value"));
                    }
                }
            }
            NodeKind::Setlist(view) => {
                let expected = view.descendants();
                let mut sum = 0u64;
                if !view.eof_value().is_null() {
                    sum += 1;
                    let mut vref = ObjectRef::get(guard, view.eof_value())?;
                    if !matches!(vref.view()?, NodeKind::Value(_)) {
                        return Err(Error::Corruption("eof slot points at a non-value"));
                    }
                }
                for (_, child) in view.branches() {
                    sum += count_keys(guard, child)?;
                    work.push((child, depth + 1));
                }
                if sum != expected {
                    return Err(Error::Corruption("descendant count mismatch"));
                }
            }
            NodeKind::Full(view) => {
                let expected = view.descendants();
                let mut sum = 0u64;
                let mut occupied = 0usize;
                if !view.eof_value().is_null() {
                    sum += 1;
                }
                for (_, child) in view.branches() {
                    occupied += 1;
                    sum += count_keys(guard, child)?;
                    work.push((child, depth + 1));
                }
                if occupied != view.num_branches() {
                    return Err(Error::Corruption("full node branch count mismatch"));
                }
                if sum != expected {
                    return Err(Error::Corruption("descendant count mismatch"));
                }
            }
        }
    }

    Ok(keys)
}
