use std::hash::{DefaultHasher, Hash, Hasher};

use tokio::sync::{Mutex, MutexGuard};

use crate::model::BlockId;

/// Fixed array of mutexes; a block ID always maps to the same shard, so
/// holding its shard serializes all work on that ID without a global lock.
#[derive(Debug)]
pub struct KeyLocks {
    shards: Box<[Mutex<()>]>,
}

impl KeyLocks {
    pub fn new(shards: usize) -> KeyLocks {
        KeyLocks {
            shards: (0..shards.max(1)).map(|_| Mutex::new(())).collect(),
        }
    }

    pub fn shard_of(&self, key: &BlockId) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.shards.len() as u64) as usize
    }

    pub async fn lock(&self, key: &BlockId) -> MutexGuard<'_, ()> {
        self.shards[self.shard_of(key)].lock().await
    }
}
