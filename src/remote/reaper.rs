//! Periodic eviction of pending writes stuck mid-protocol.
use std::sync::Arc;
use std::sync::atomic::Ordering;

use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::coalesce::{Engine, PendingWrite, WriteStatus};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(super) struct Sweep {
    pub total: usize,
    pub reclaimed: usize,
}

pub(super) async fn run(engine: Arc<Engine>) {
    let mut interval = tokio::time::interval(engine.config.reap_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // the first tick completes immediately
    interval.tick().await;

    loop {
        tokio::select! {
            biased;
            () = engine.shutdown.cancelled() => break,
            _ = interval.tick() => {
                let sweep = engine.sweep(Instant::now());
                if sweep.reclaimed > 0 {
                    info!(total = sweep.total, reclaimed = sweep.reclaimed, "reclaimed zombie block writes");
                } else {
                    debug!(total = sweep.total, "pending block writes");
                }
            }
        }
    }
    debug!("reaper stopped");
}

impl Engine {
    /// Evict every descriptor older than the zombie age that is not
    /// uploading. Uploading descriptors are only logged.
    pub(super) fn sweep(&self, now: Instant) -> Sweep {
        let zombie_age = self.config.zombie_age;
        let mut sweep = Sweep::default();
        let mut candidates: Vec<Arc<PendingWrite>> = Vec::new();

        for entry in self.table.iter() {
            sweep.total += 1;
            let write = entry.value();
            let age = now.saturating_duration_since(write.started);
            if age <= zombie_age {
                continue;
            }
            if write.status() == WriteStatus::Writing {
                warn!(
                    block_id = %write.block_id,
                    version = %write.version,
                    age_secs = age.as_secs(),
                    "block upload still running"
                );
                continue;
            }
            candidates.push(write.clone());
        }

        // The status may have moved to `writing` since the scan; the removal
        // re-checks it under the shard lock.
        for write in candidates {
            let removed = self.table.remove_if(&write.block_id, |_, current| {
                Arc::ptr_eq(current, &write) && current.status() != WriteStatus::Writing
            });
            if removed.is_some() {
                write.cancel.cancel();
                sweep.reclaimed += 1;
                debug!(
                    block_id = %write.block_id,
                    version = %write.version,
                    status = %write.status(),
                    cancelled = write.cancel.is_cancelled(),
                    "evicted zombie block write"
                );
            }
        }

        if sweep.reclaimed > 0 {
            self.counters
                .reaped
                .fetch_add(sweep.reclaimed as u64, Ordering::Relaxed);
            self.settled.notify_waiters();
        }
        sweep
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;

    use crate::config::CoalesceConfig;
    use crate::model::{BlockId, Version};
    use crate::remote::coalesce::{WriteCoalescer, WriteStatus};
    use crate::remote::memory::MemoryObjectStore;
    use crate::remote::object_store::block_key;

    fn id() -> BlockId {
        BlockId::parse("abcd0001").unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn long_running_upload_is_never_reaped() {
        let memory = std::sync::Arc::new(MemoryObjectStore::new());
        memory.set_put_latency(Duration::from_secs(60));
        let config = CoalesceConfig {
            op_timeout: Duration::from_secs(120),
            ..CoalesceConfig::default()
        };
        let coalescer = WriteCoalescer::new(memory.clone(), "", config);

        coalescer.submit(&id(), Bytes::from_static(b"big"), Version::FINAL).unwrap();
        tokio::time::sleep(Duration::from_secs(45)).await;

        assert_eq!(coalescer.status(&id()).unwrap().1, WriteStatus::Writing);
        assert_eq!(coalescer.stats().reaped, 0);

        coalescer.flush().await;
        assert_eq!(coalescer.stats().completed, 1);
        assert!(memory.object(&block_key("", &id())).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn write_stuck_behind_the_key_lock_is_reclaimed() {
        let memory = std::sync::Arc::new(MemoryObjectStore::new());
        memory.set_put_latency(Duration::from_secs(60));
        let config = CoalesceConfig {
            op_timeout: Duration::from_secs(120),
            ..CoalesceConfig::default()
        };
        let coalescer = WriteCoalescer::new(memory.clone(), "", config);
        let key = block_key("", &id());

        // v1 uploads for a minute and holds the block's key lock meanwhile
        coalescer.submit(&id(), Bytes::from_static(b"v1"), Version::FINAL).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        coalescer.submit(&id(), Bytes::from_static(b"v2"), Version::FINAL).unwrap();

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(coalescer.status(&id()).unwrap().1, WriteStatus::DelayCompleted);
        assert_eq!(coalescer.stats().reaped, 0);

        tokio::time::sleep(Duration::from_secs(12)).await;
        assert_eq!(coalescer.status(&id()), None);
        assert_eq!(coalescer.stats().reaped, 1);
        // the running upload was left alone
        assert_eq!(memory.in_flight(&key), 1);

        coalescer.flush().await;
        tokio::time::sleep(Duration::from_secs(30)).await;
        let versions: Vec<_> = memory.uploads().iter().map(|u| u.payload.clone()).collect();
        assert_eq!(versions, vec![Bytes::from_static(b"v1")]);
        assert_eq!(coalescer.stats().canceled, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_counts_pending_writes() {
        let memory = std::sync::Arc::new(MemoryObjectStore::new());
        let coalescer = WriteCoalescer::new(memory, "", CoalesceConfig::default());
        for n in 0..3 {
            let id = BlockId::parse(format!("blk{n:04}")).unwrap();
            coalescer.submit(&id, Bytes::new(), Version::new(1)).unwrap();
        }
        assert_eq!(coalescer.pending_count(), 3);
        coalescer.flush().await;
        assert_eq!(coalescer.stats().reaped, 0);
        assert_eq!(coalescer.stats().completed, 3);
    }
}
