//! Write coalescing for the remote backend.
//!
//! Every accepted write becomes a [`PendingWrite`] in a table keyed by block
//! ID and a background task that commits it. Non-final versions wait out a
//! delay window first, so a burst of writes to a growing block collapses into
//! one upload of its newest content. A newer submission cancels and replaces
//! the pending descriptor; an older one is rejected outright.
//!
//! Immediately before uploading, the task takes the block's [`KeyLocks`]
//! shard and re-checks that it is still the freshest descriptor. The shard is
//! held for the whole upload, so at most one upload per block is in flight.
use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

use bytes::Bytes;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use tokio::sync::{MutexGuard, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, trace, warn};

use super::bounded;
use super::key_lock::KeyLocks;
use super::object_store::{ObjectStore, block_key, block_metadata};
use super::reaper;
use crate::config::CoalesceConfig;
use crate::error::{Error, Result};
use crate::model::{BlockId, Version};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum WriteStatus {
    Pending = 0,
    WaitingDelay = 1,
    DelayCompleted = 2,
    ContextCanceled = 3,
    Writing = 4,
    WriteCompleted = 5,
    WriteFailed = 6,
    OverriddenNewer = 7,
    AlreadyProcessed = 8,
    Panic = 9,
}

impl WriteStatus {
    fn from_u8(value: u8) -> WriteStatus {
        match value {
            0 => WriteStatus::Pending,
            1 => WriteStatus::WaitingDelay,
            2 => WriteStatus::DelayCompleted,
            3 => WriteStatus::ContextCanceled,
            4 => WriteStatus::Writing,
            5 => WriteStatus::WriteCompleted,
            6 => WriteStatus::WriteFailed,
            7 => WriteStatus::OverriddenNewer,
            8 => WriteStatus::AlreadyProcessed,
            _ => WriteStatus::Panic,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WriteStatus::ContextCanceled
                | WriteStatus::WriteCompleted
                | WriteStatus::WriteFailed
                | WriteStatus::OverriddenNewer
                | WriteStatus::AlreadyProcessed
                | WriteStatus::Panic
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WriteStatus::Pending => "pending",
            WriteStatus::WaitingDelay => "waiting_delay",
            WriteStatus::DelayCompleted => "delay_completed",
            WriteStatus::ContextCanceled => "context_canceled",
            WriteStatus::Writing => "writing",
            WriteStatus::WriteCompleted => "write_completed",
            WriteStatus::WriteFailed => "write_failed",
            WriteStatus::OverriddenNewer => "overridden_newer",
            WriteStatus::AlreadyProcessed => "already_processed",
            WriteStatus::Panic => "panic",
        }
    }
}

impl fmt::Display for WriteStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One outstanding write of a block.
#[derive(Debug)]
pub struct PendingWrite {
    pub(super) block_id: BlockId,
    pub(super) version: Version,
    pub(super) payload: Bytes,
    pub(super) cancel: CancellationToken,
    pub(super) started: Instant,
    status: AtomicU8,
}

impl PendingWrite {
    fn new(block_id: BlockId, version: Version, payload: Bytes, cancel: CancellationToken) -> Self {
        PendingWrite {
            block_id,
            version,
            payload,
            cancel,
            started: Instant::now(),
            status: AtomicU8::new(WriteStatus::Pending as u8),
        }
    }

    pub fn status(&self) -> WriteStatus {
        WriteStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    fn set_status(&self, status: WriteStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    fn finish(&self, status: WriteStatus) -> WriteStatus {
        self.set_status(status);
        status
    }
}

#[derive(Debug, Default)]
pub(super) struct Counters {
    submitted: AtomicU64,
    stale: AtomicU64,
    superseded: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    canceled: AtomicU64,
    overridden: AtomicU64,
    already_processed: AtomicU64,
    panicked: AtomicU64,
    pub(super) reaped: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Point-in-time copy of the engine counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoalesceStats {
    pub submitted: u64,
    pub stale: u64,
    pub superseded: u64,
    pub completed: u64,
    pub failed: u64,
    pub canceled: u64,
    pub overridden: u64,
    pub already_processed: u64,
    pub panicked: u64,
    pub reaped: u64,
}

#[derive(Debug)]
pub(super) struct Engine {
    pub(super) store: Arc<dyn ObjectStore>,
    pub(super) prefix: String,
    pub(super) config: CoalesceConfig,
    pub(super) table: DashMap<BlockId, Arc<PendingWrite>>,
    pub(super) locks: KeyLocks,
    pub(super) shutdown: CancellationToken,
    pub(super) tasks: TaskTracker,
    pub(super) settled: Notify,
    pub(super) counters: Counters,
}

/// Owner of the pending-write table, its commit tasks and the reaper.
///
/// Dropping the coalescer cancels everything that has not started uploading.
#[derive(Debug)]
pub struct WriteCoalescer {
    engine: Arc<Engine>,
}

impl WriteCoalescer {
    /// Must be called inside a tokio runtime; starts the reaper.
    pub fn new(
        store: Arc<dyn ObjectStore>,
        prefix: impl Into<String>,
        config: CoalesceConfig,
    ) -> WriteCoalescer {
        let engine = Arc::new(Engine {
            store,
            prefix: prefix.into(),
            locks: KeyLocks::new(config.lock_shards),
            config,
            table: DashMap::new(),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
            settled: Notify::new(),
            counters: Counters::default(),
        });
        engine.tasks.spawn(reaper::run(engine.clone()));
        WriteCoalescer { engine }
    }

    /// Accept `payload` as version `version` of `block_id`.
    ///
    /// Returns once the write is in the table; the upload happens in the
    /// background. A version older than the one already pending is rejected
    /// with [`Error::StaleVersion`].
    pub fn submit(&self, block_id: &BlockId, payload: Bytes, version: Version) -> Result<()> {
        let engine = &self.engine;
        if engine.shutdown.is_cancelled() {
            return Err(Error::ShuttingDown);
        }

        let write = Arc::new(PendingWrite::new(
            block_id.clone(),
            version,
            payload,
            engine.shutdown.child_token(),
        ));

        match engine.table.entry(block_id.clone()) {
            Entry::Occupied(mut entry) => {
                let pending = entry.get().version;
                if pending > version {
                    bump(&engine.counters.stale);
                    debug!(%block_id, %pending, submitted = %version, "discarding stale block write");
                    return Err(Error::StaleVersion {
                        block_id: block_id.clone(),
                        pending,
                        submitted: version,
                    });
                }
                entry.get().cancel.cancel();
                entry.insert(write.clone());
                bump(&engine.counters.superseded);
                trace!(%block_id, replaced = %pending, %version, "superseded pending write");
            }
            Entry::Vacant(entry) => {
                entry.insert(write.clone());
            }
        }

        bump(&engine.counters.submitted);
        engine.tasks.spawn(engine.clone().run(write));
        Ok(())
    }

    /// Payload of the descriptor currently pending for `block_id`.
    pub fn pending_payload(&self, block_id: &BlockId) -> Option<Bytes> {
        self.engine.table.get(block_id).map(|w| w.payload.clone())
    }

    /// Version and status of the descriptor currently pending for `block_id`.
    pub fn status(&self, block_id: &BlockId) -> Option<(Version, WriteStatus)> {
        self.engine
            .table
            .get(block_id)
            .map(|w| (w.version, w.status()))
    }

    pub fn pending_ids(&self) -> Vec<BlockId> {
        self.engine.table.iter().map(|e| e.key().clone()).collect()
    }

    pub fn pending_count(&self) -> usize {
        self.engine.table.len()
    }

    /// Cancel and drop the pending write for `block_id` unless it is already
    /// uploading. Returns whether a descriptor was dropped.
    pub fn discard(&self, block_id: &BlockId) -> bool {
        let removed = self
            .engine
            .table
            .remove_if(block_id, |_, w| w.status() != WriteStatus::Writing);
        if let Some((_, write)) = &removed {
            write.cancel.cancel();
            self.engine.settled.notify_waiters();
        }
        removed.is_some()
    }

    /// Take the key lock of `block_id`, waiting for a running upload of it
    /// to finish. No upload of the block starts while the guard is held.
    pub async fn lock_block(&self, block_id: &BlockId) -> MutexGuard<'_, ()> {
        self.engine.locks.lock(block_id).await
    }

    pub fn stats(&self) -> CoalesceStats {
        let c = &self.engine.counters;
        let load = |v: &AtomicU64| v.load(Ordering::Relaxed);
        CoalesceStats {
            submitted: load(&c.submitted),
            stale: load(&c.stale),
            superseded: load(&c.superseded),
            completed: load(&c.completed),
            failed: load(&c.failed),
            canceled: load(&c.canceled),
            overridden: load(&c.overridden),
            already_processed: load(&c.already_processed),
            panicked: load(&c.panicked),
            reaped: load(&c.reaped),
        }
    }

    /// Wait until no write is pending.
    pub async fn flush(&self) {
        self.wait_until(|table| table.is_empty()).await;
    }

    /// Wait until nothing is pending for `block_id`.
    pub async fn settle(&self, block_id: &BlockId) {
        self.wait_until(|table| !table.contains_key(block_id)).await;
    }

    async fn wait_until(&self, done: impl Fn(&DashMap<BlockId, Arc<PendingWrite>>) -> bool) {
        loop {
            let settled = self.engine.settled.notified();
            if done(&self.engine.table) {
                return;
            }
            settled.await;
        }
    }

    /// Cancel every pending write and the reaper, then wait for all tasks.
    /// Uploads already in progress run to completion.
    pub async fn shutdown(&self) {
        self.engine.shutdown.cancel();
        self.engine.tasks.close();
        self.engine.tasks.wait().await;
        debug!(remaining = self.engine.table.len(), "write coalescer stopped");
    }
}

impl Drop for WriteCoalescer {
    fn drop(&mut self) {
        self.engine.shutdown.cancel();
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

impl Engine {
    async fn run(self: Arc<Self>, write: Arc<PendingWrite>) {
        let outcome = AssertUnwindSafe(self.commit(&write)).catch_unwind().await;
        let counters = &self.counters;
        match outcome {
            Ok(Ok(status)) => {
                match status {
                    WriteStatus::WriteCompleted => bump(&counters.completed),
                    WriteStatus::ContextCanceled => bump(&counters.canceled),
                    WriteStatus::OverriddenNewer => bump(&counters.overridden),
                    WriteStatus::AlreadyProcessed => bump(&counters.already_processed),
                    _ => {}
                }
                trace!(block_id = %write.block_id, version = %write.version, %status, "commit task finished");
            }
            Ok(Err(err)) => {
                bump(&counters.failed);
                warn!(block_id = %write.block_id, version = %write.version, %err, "block upload failed");
            }
            Err(panic) => {
                write.set_status(WriteStatus::Panic);
                bump(&counters.panicked);
                error!(
                    block_id = %write.block_id,
                    version = %write.version,
                    panic = panic_message(panic.as_ref()),
                    "block commit task panicked"
                );
            }
        }
        self.release(&write);
    }

    pub(super) async fn commit(&self, write: &Arc<PendingWrite>) -> Result<WriteStatus> {
        write.set_status(WriteStatus::WaitingDelay);
        if !write.version.is_final() {
            tokio::select! {
                biased;
                () = write.cancel.cancelled() => return Ok(write.finish(WriteStatus::ContextCanceled)),
                () = tokio::time::sleep(self.config.delay) => {}
            }
        }
        write.set_status(WriteStatus::DelayCompleted);

        let _key_guard = tokio::select! {
            biased;
            () = write.cancel.cancelled() => return Ok(write.finish(WriteStatus::ContextCanceled)),
            guard = self.locks.lock(&write.block_id) => guard,
        };
        if write.cancel.is_cancelled() {
            return Ok(write.finish(WriteStatus::ContextCanceled));
        }

        // Checked and marked under the table shard lock so the reaper cannot
        // evict the descriptor between the check and the upload.
        {
            let Some(current) = self.table.get(&write.block_id) else {
                return Ok(write.finish(WriteStatus::AlreadyProcessed));
            };
            if current.version > write.version {
                return Ok(write.finish(WriteStatus::OverriddenNewer));
            }
            if write.cancel.is_cancelled() {
                return Ok(write.finish(WriteStatus::ContextCanceled));
            }
            write.set_status(WriteStatus::Writing);
        }

        let key = block_key(&self.prefix, &write.block_id);
        let metadata = block_metadata(&write.block_id, write.version);
        let upload = self.store.put(&key, write.payload.clone(), &metadata);
        match bounded("block upload", self.config.op_timeout, upload).await {
            Ok(()) => {
                debug!(
                    block_id = %write.block_id,
                    version = %write.version,
                    size = write.payload.len(),
                    "committed block"
                );
                Ok(write.finish(WriteStatus::WriteCompleted))
            }
            Err(err) => {
                write.set_status(WriteStatus::WriteFailed);
                Err(err)
            }
        }
    }

    /// Remove `write` from the table only if it is still the descriptor
    /// mapped to its block ID.
    fn release(&self, write: &Arc<PendingWrite>) {
        self.table
            .remove_if(&write.block_id, |_, current| Arc::ptr_eq(current, write));
        self.settled.notify_waiters();
    }
}
