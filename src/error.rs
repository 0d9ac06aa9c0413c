// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::Checksum;

/// Represents errors that can occur in the trie engine
#[derive(Debug)]
pub enum Error {
    /// I/O error
    Io(std::io::Error),

    /// Invalid checksum value (got, expected)
    ChecksumMismatch {
        /// Checksum computed over the node bytes
        got: Checksum,
        /// Checksum stored in the node header
        expected: Checksum,
    },

    /// On-disk state is inconsistent; the engine has switched to read-only
    Corruption(&'static str),

    /// The configuration is not usable
    InvalidConfig(&'static str),

    /// The database was created with an incompatible configuration
    ConfigMismatch,

    /// Key exceeds `max_key_length`
    KeyTooLong,

    /// Value exceeds half the segment size
    ValueTooLarge,

    /// Top-root name is outside the slot table
    UnknownTopRoot,

    /// All `max_objects` node IDs are in use
    IdSpaceExhausted,

    /// A node's reference count hit its saturation limit
    RefCountSaturated,

    /// The data file cannot grow past `max_database_size`
    DatabaseFull,

    /// All session slots are taken (see `max_threads`)
    SessionLimit,

    /// A write session already exists for this process
    WriterActive,

    /// The engine is read-only, either by open mode or after corruption
    ReadOnly,

    /// The write session was asked to abort
    Aborted,

    /// A lock was poisoned by a panicking thread
    Poisoned,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CowTreeError: {self:?}")
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        Self::Poisoned
    }
}

/// Engine result
pub type Result<T> = std::result::Result<T, Error>;
