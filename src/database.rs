// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::compaction;
use crate::config::{Config, NUM_TOP_ROOTS};
use crate::gc::GcQueue;
use crate::segment::SegmentAllocator;
use crate::session::{ReadSession, WriteSession};
use crate::stop_signal::StopSignal;
use crate::store::Core;
use crate::table::IdTable;
use crate::{OpenMode, Result, SyncKind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

pub use crate::session::Root;

/// The engine handle: owns the files, the metadata table, the GC queue
/// and the background threads.
///
/// Obtained through [`Config::open`]. Cloning is not needed: sessions
/// keep the engine alive on their own.
pub struct Database {
    core: Arc<Core>,
    threads: Mutex<Vec<std::thread::JoinHandle<()>>>,
}

impl Database {
    pub(crate) fn open(config: Config, mode: OpenMode) -> Result<Self> {
        use fs4::fs_std::FileExt;

        config.validate()?;
        std::fs::create_dir_all(&config.path)?;

        let lockfile = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(config.path.join("lock"))?;
        if mode == OpenMode::ReadWrite {
            lockfile
                .try_lock_exclusive()
                .map_err(std::io::Error::from)?;
        } else {
            lockfile.try_lock_shared().map_err(std::io::Error::from)?;
        }

        let ids = IdTable::open(&config.path, config.max_objects)?;
        let (seg, fresh) = SegmentAllocator::open(&config.path, &config)?;

        let core = Arc::new(Core {
            gc: GcQueue::new(256, config.max_threads),
            stop: StopSignal::default(),
            mode,
            poisoned: AtomicBool::new(false),
            writer_active: AtomicBool::new(false),
            uncommitted_floor: AtomicU64::new(u64::MAX),
            lockfile,
            ids,
            seg,
            config,
        });

        crate::recover::run(&core, fresh, &core.config.recover)?;

        let threads = if mode == OpenMode::ReadWrite {
            let gc_core = Arc::clone(&core);
            let gc_thread = std::thread::Builder::new()
                .name("cow-tree-gc".into())
                .spawn(move || gc_core.gc.run(&gc_core.stop))?;

            let compact_core = Arc::clone(&core);
            let compact_thread = std::thread::Builder::new()
                .name("cow-tree-compact".into())
                .spawn(move || compaction::worker(&compact_core))?;

            vec![gc_thread, compact_thread]
        } else {
            Vec::new()
        };

        log::debug!(
            "opened database at {:?} ({mode:?}, {} segments)",
            core.config.path,
            core.seg.segment_count(),
        );

        Ok(Self {
            core,
            threads: Mutex::new(threads),
        })
    }

    /// Starts a snapshot-isolated read session.
    ///
    /// Fails when all session slots are taken (see `max_threads`).
    pub fn start_read_session(&self) -> Result<ReadSession> {
        ReadSession::new(Arc::clone(&self.core))
    }

    /// Starts the write session.
    ///
    /// At most one exists per process; further attempts fail with
    /// [`crate::Error::WriterActive`].
    pub fn start_write_session(&self) -> Result<WriteSession> {
        WriteSession::new(Arc::clone(&self.core))
    }

    /// Flushes dirty bytes to disk: the metadata table first, then every
    /// lagging segment, then the head region.
    pub fn flush(&self, kind: SyncKind) -> Result<()> {
        if kind == SyncKind::None {
            return Ok(());
        }
        self.core.ids.flush(kind == SyncKind::Sync)?;
        self.core.seg.sync(kind)?;
        Ok(())
    }

    /// Runs one manual compaction step. Returns whether a segment was
    /// evacuated or queued for recycling.
    pub fn compact_next_segment(&self) -> Result<bool> {
        compaction::compact_next_segment(&self.core)
    }

    /// Number of node IDs whose reference count is nonzero.
    #[must_use]
    pub fn count_ids_in_use(&self) -> u64 {
        self.core.ids.count_ids_in_use()
    }

    /// Writes engine statistics to `out`.
    pub fn print_stats(&self, out: &mut dyn std::io::Write, detailed: bool) -> Result<()> {
        let usage = self.core.seg.usage();
        let seg_size = self.core.seg.segment_size();

        writeln!(out, "segments: {} total ({} bytes each)", self.core.seg.segment_count(), seg_size)?;
        writeln!(
            out,
            "  active: {}  sealed: {}  free: {}",
            usage.active, usage.sealed, usage.free,
        )?;
        writeln!(
            out,
            "  allocated: {} bytes  freed: {} bytes",
            usage.allocated_bytes, usage.freed_bytes,
        )?;
        writeln!(out, "ids: {} in use (high water {})",
            self.core.ids.count_ids_in_use(),
            self.core.ids.high_water(),
        )?;
        writeln!(out, "gc queue: {} pending", self.core.gc.len())?;

        let mut occupied = 0;
        for slot in 0..NUM_TOP_ROOTS {
            if self.core.seg.top_root_id(slot)?.load(Ordering::Relaxed) != 0 {
                occupied += 1;
            }
        }
        writeln!(out, "top roots: {occupied} of {NUM_TOP_ROOTS} occupied")?;

        if detailed {
            for seg in 0..self.core.seg.segment_count() {
                let state = self.core.seg.state(seg);
                let alloc = self.core.seg.alloc_pos(seg).load(Ordering::Relaxed);
                let freed = self.core.seg.freed_bytes(seg).load(Ordering::Relaxed);
                let synced = self.core.seg.last_sync_pos(seg).load(Ordering::Relaxed);
                let (read_epoch, read_bytes) = self.core.seg.read_stats(seg);
                writeln!(
                    out,
                    "  segment {seg:>6}: {state:?} alloc={alloc} freed={freed} synced={synced} \
                     reads={read_bytes}B@{read_epoch}",
                )?;
            }
        }

        Ok(())
    }

    /// Whether the engine flipped read-only after detecting corruption.
    #[must_use]
    pub fn is_poisoned(&self) -> bool {
        self.core.poisoned.load(Ordering::Acquire)
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        self.core.stop.send();
        self.core.gc.notify_run();

        if let Ok(mut threads) = self.threads.lock() {
            for handle in threads.drain(..) {
                let _ = handle.join();
            }
        }

        // the queue may only be drained when nobody can be mid-read
        if self.core.gc.has_sessions() {
            log::warn!("database dropped with live sessions; skipping gc drain");
        } else if let Err(e) = self.core.gc.flush() {
            log::warn!("gc flush on shutdown failed: {e}");
        }

        if self.core.mode == OpenMode::ReadWrite && !self.is_poisoned() {
            if let Err(e) = self.core.ids.flush(true) {
                log::error!("final metadata flush failed: {e}");
            }
            if let Err(e) = self.core.seg.sync(SyncKind::Sync) {
                log::error!("final segment flush failed: {e}");
            } else {
                self.core.seg.clean_shutdown().store(1, Ordering::Release);
                let _ = self.core.seg.sync(SyncKind::Sync);
            }
        }

        log::debug!("database closed");
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Database({:?})", self.core.config.path)
    }
}
