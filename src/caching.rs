//! Client-side caching for RESP3 connections.
//!
//! Replies to a conservative allowlist of read commands are cached under a
//! `(command invocation, key)` fingerprint — the command component is the
//! full argument list, so reads differing in any argument occupy separate
//! slots — and served locally until the server sends an `invalidate` push
//! frame for the key.  Concurrent misses for the same fingerprint collapse
//! into a single server request: the first caller installs a sentinel,
//! everyone else awaits its result.

use std::collections::hash_map::DefaultHasher;
use std::hash::Hasher;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard};

use lru::LruCache;
use tokio::sync::watch;

use crate::types::{ErrorKind, RedisResult, Value};

/// Configuration of the client-side cache.
#[derive(Clone, Copy, Debug)]
pub struct CacheConfig {
    pub(crate) size: NonZeroUsize,
}

/// Default bound on the number of cached keys.
pub const DEFAULT_CACHE_SIZE: usize = 10_000;

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            size: NonZeroUsize::new(DEFAULT_CACHE_SIZE).unwrap(),
        }
    }
}

impl CacheConfig {
    /// Creates a cache configuration bounded to `size` keys.
    pub fn new(size: usize) -> RedisResult<Self> {
        match NonZeroUsize::new(size) {
            Some(size) => Ok(CacheConfig { size }),
            None => Err((
                ErrorKind::InvalidClientConfig,
                "Cache size must be positive",
            )
                .into()),
        }
    }
}

// The payload a miss winner publishes to its waiters.  Errors are carried as
// strings because the failure must reach every waiter of the fingerprint.
type SentinelPayload = Option<Result<Value, String>>;

// One cached command over a key.  `value: None` marks an in-flight fetch;
// the receiver is the coalescing point waiters subscribe to.
struct CacheSlot {
    cmd: Vec<u8>,
    value: Option<Value>,
    receiver: watch::Receiver<SentinelPayload>,
}

// All cached commands for one key.  Invalidation drops the whole item, so
// an `invalidate k` push evicts every fingerprint over `k` at once.
struct CacheItem {
    slots: Vec<CacheSlot>,
}

type Shard = LruCache<Vec<u8>, CacheItem>;

const SHARD_COUNT: usize = 16;

/// The outcome of a cache probe.
pub(crate) enum CacheLookup {
    /// Served locally, either from a stored value or from a coalesced fetch
    /// that completed while waiting.
    Hit(Value),
    /// A coalesced fetch failed; the failure propagates to every waiter.
    Failed(String),
    /// This caller won the right to fetch; it must call
    /// [`CacheManager::complete`] or [`CacheManager::fail`] with the guard.
    Guard(CacheGuard),
}

/// Held by the single in-flight fetch for a fingerprint.
pub(crate) struct CacheGuard {
    sender: watch::Sender<SentinelPayload>,
}

#[derive(Clone)]
pub(crate) struct CacheManager {
    shards: Arc<Vec<Mutex<Shard>>>,
}

impl CacheManager {
    pub(crate) fn new(config: CacheConfig) -> Self {
        let per_shard = (config.size.get() / SHARD_COUNT).max(1);
        let shards = (0..SHARD_COUNT)
            .map(|_| Mutex::new(LruCache::new(NonZeroUsize::new(per_shard).unwrap())))
            .collect();
        CacheManager {
            shards: Arc::new(shards),
        }
    }

    fn shard(&self, key: &[u8]) -> MutexGuard<'_, Shard> {
        let mut hasher = DefaultHasher::new();
        hasher.write(key);
        let lock = &self.shards[hasher.finish() as usize % self.shards.len()];
        lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Probes the cache for `(cmd, key)`.  At most one caller per
    /// fingerprint gets a [`CacheLookup::Guard`]; concurrent callers wait on
    /// the winner's sentinel instead of talking to the server.
    pub(crate) async fn lookup(&self, cmd: &[u8], key: &[u8]) -> CacheLookup {
        loop {
            let mut receiver = {
                let mut shard = self.shard(key);
                match shard.get_mut(key) {
                    Some(item) => {
                        match item.slots.iter().position(|slot| slot.cmd == cmd) {
                            Some(idx) => {
                                if let Some(value) = &item.slots[idx].value {
                                    return CacheLookup::Hit(value.clone());
                                }
                                let receiver = item.slots[idx].receiver.clone();
                                if receiver.has_changed().is_err() {
                                    // The previous winner went away without
                                    // publishing; take over its sentinel.
                                    let (sender, receiver) = watch::channel(None);
                                    item.slots[idx].receiver = receiver;
                                    return CacheLookup::Guard(CacheGuard { sender });
                                }
                                receiver
                            }
                            None => {
                                let (sender, receiver) = watch::channel(None);
                                item.slots.push(CacheSlot {
                                    cmd: cmd.to_vec(),
                                    value: None,
                                    receiver,
                                });
                                return CacheLookup::Guard(CacheGuard { sender });
                            }
                        }
                    }
                    None => {
                        let (sender, receiver) = watch::channel(None);
                        shard.push(
                            key.to_vec(),
                            CacheItem {
                                slots: vec![CacheSlot {
                                    cmd: cmd.to_vec(),
                                    value: None,
                                    receiver,
                                }],
                            },
                        );
                        return CacheLookup::Guard(CacheGuard { sender });
                    }
                }
            };

            // Await the winner's result outside the lock.
            if receiver.changed().await.is_err() {
                // Winner dropped without publishing; retry and possibly
                // become the winner ourselves.
                continue;
            }
            let current = receiver.borrow().clone();
            match current {
                Some(Ok(value)) => return CacheLookup::Hit(value),
                Some(Err(detail)) => return CacheLookup::Failed(detail),
                None => continue,
            }
        }
    }

    /// Publishes a successful fetch: stores the value and wakes the waiters.
    pub(crate) fn complete(&self, cmd: &[u8], key: &[u8], guard: CacheGuard, value: Value) {
        {
            let mut shard = self.shard(key);
            if let Some(item) = shard.peek_mut(key) {
                if let Some(slot) = item.slots.iter_mut().find(|slot| slot.cmd == cmd) {
                    slot.value = Some(value.clone());
                }
            }
        }
        let _ = guard.sender.send(Some(Ok(value)));
    }

    /// Publishes a failed fetch: removes the sentinel and fails the waiters.
    pub(crate) fn fail(&self, cmd: &[u8], key: &[u8], guard: CacheGuard, detail: String) {
        {
            let mut shard = self.shard(key);
            if let Some(item) = shard.peek_mut(key) {
                item.slots.retain(|slot| slot.cmd != cmd || slot.value.is_some());
                if item.slots.is_empty() {
                    shard.pop(key);
                }
            }
        }
        let _ = guard.sender.send(Some(Err(detail)));
    }

    /// Evicts every fingerprint whose key equals `key`.
    pub(crate) fn invalidate(&self, key: &[u8]) {
        self.shard(key).pop(key);
    }

    /// Empties the cache entirely.
    pub(crate) fn clear(&self) {
        for shard in self.shards.iter() {
            shard
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .clear();
        }
    }

    /// Applies the payload of an `invalidate` push frame: a list of keys to
    /// evict, or a Nil/empty payload meaning "flush everything".
    pub(crate) fn handle_invalidation(&self, data: &[Value]) {
        match data.first() {
            Some(Value::Array(keys)) if !keys.is_empty() => {
                for key in keys {
                    if let Some(key) = key.as_bytes() {
                        self.invalidate(key);
                    }
                }
            }
            Some(Value::BulkString(key)) => self.invalidate(key),
            _ => self.clear(),
        }
    }
}
