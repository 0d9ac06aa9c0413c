// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! A persistent, copy-on-write radix trie storage engine.
//!
//! ##### NOTE
//!
//! > This crate provides the raw trie engine: a single-writer, multi-reader
//! > key-value store with snapshot isolation and on-disk durability.
//! > It is the storage layer a database is built on, not a database itself.
//!
//! ##### About
//!
//! Keys and values are stored in radix tries whose nodes live in a
//! memory-mapped segment arena. Every node is addressed through a stable
//! 40-bit ID and an atomic metadata cell, so concurrent readers never take
//! locks: a reader pins a snapshot (a *top root*), walks the trie through
//! ID indirection, and is protected from reclamation by a garbage-collection
//! queue. The single writer clones shared nodes before modifying them
//! (copy-on-write), which makes snapshots free: old versions simply keep
//! referencing the nodes they always did.
//!
//! Space is reclaimed by a background compactor that evacuates live nodes
//! out of mostly-empty segments and recycles the segments whole.
//!
//! Keys are limited to 1024 bytes; values are limited to half a segment
//! (16 MiB in the default configuration).
//!
//! # Example usage
//!
//! ```
//! use cow_tree::Config;
//! #
//! # let folder = tempfile::tempdir()?;
//!
//! let db = Config::new(folder).open()?;
//!
//! // All writes go through the (single) write session
//! let mut writer = db.start_write_session()?;
//! let mut root = writer.get_top_root(0)?;
//! writer.upsert(&mut root, b"my_key", b"my_value")?;
//!
//! // Publishing the root makes the state visible to new readers
//! writer.set_top_root(0, &mut root)?;
//!
//! // Readers pin a snapshot and are isolated from later commits
//! let reader = db.start_read_session()?;
//! let snapshot = reader.get_top_root(0)?;
//! let item = reader.get(&snapshot, b"my_key")?;
//! assert_eq!(Some(b"my_value".as_slice()), item.as_deref());
//!
//! // Ordered iteration through cursors
//! let mut cursor = reader.lower_bound(&snapshot, b"")?;
//! while let Some((key, value)) = cursor.pair()? {
//!     // ...
//!     # let _ = (key, value);
//!     cursor.next()?;
//! }
//! #
//! # Ok::<(), cow_tree::Error>(())
//! ```

#![deny(clippy::all, missing_docs, clippy::cargo)]
#![deny(clippy::unwrap_used)]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(clippy::pedantic, clippy::nursery)]
#![warn(clippy::expect_used)]
#![allow(clippy::missing_const_for_fn)]
#![warn(clippy::multiple_crate_versions)]
#![allow(clippy::option_if_let_else)]

mod checksum;
mod compaction;
mod config;
mod database;
mod error;
mod gc;
mod mapping;
mod meta;
mod node;
mod recover;
mod segment;
mod session;
mod stop_signal;
mod store;
mod table;
mod tree;

/// KV-tuple, typically returned by a cursor
pub type KvPair = (Vec<u8>, Vec<u8>);

#[doc(hidden)]
pub use node::NodeId;

pub use {
    checksum::Checksum,
    config::{ChecksumPolicy, Config, OpenMode, RecoverArgs, SyncKind},
    database::{Database, Root},
    error::{Error, Result},
    session::{Cursor, ReadSession, WriteSession},
};
