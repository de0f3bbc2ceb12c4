//! In-process storage backend.

use std::collections::hash_map::RandomState;
use std::collections::HashMap;
use std::hash::BuildHasher;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use super::{Storage, StorageError, MAX_EXPIRY};
use crate::deadline::Deadline;

/// How often expired entries are physically removed by default.
pub const DEFAULT_RECLAIM_INTERVAL: Duration = Duration::from_secs(60);

/// `now + duration`, clamped to [`MAX_EXPIRY`].
fn expiry_after(now: Instant, duration: Duration) -> Instant {
    now + duration.min(MAX_EXPIRY)
}

/// A fixed-window counter.
#[derive(Debug, Clone, Copy)]
struct CounterEntry {
    count: u64,
    expires_at: Instant,
}

impl CounterEntry {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// Counters and blocks for one partition of the key space.
///
/// Both tables sit behind the same lock so that a key's counter and its
/// block are always updated under one critical section.
#[derive(Debug, Default)]
struct Tables {
    counters: HashMap<String, CounterEntry>,
    /// Key -> instant the block ends.
    blocks: HashMap<String, Instant>,
}

impl Tables {
    fn reclaim(&mut self, now: Instant) -> (usize, usize) {
        let counters_before = self.counters.len();
        let blocks_before = self.blocks.len();

        self.counters.retain(|_, entry| entry.is_live(now));
        self.blocks.retain(|_, until| now < *until);

        (
            counters_before - self.counters.len(),
            blocks_before - self.blocks.len(),
        )
    }
}

/// State shared between the store and its reclamation task.
struct Shared {
    shards: Box<[RwLock<Tables>]>,
    hasher: RandomState,
    closed: AtomicBool,
}

impl Shared {
    fn shard(&self, key: &str) -> &RwLock<Tables> {
        if self.shards.len() == 1 {
            return &self.shards[0];
        }
        let index = self.hasher.hash_one(key) as usize % self.shards.len();
        &self.shards[index]
    }

    fn reclaim_expired(&self) -> (usize, usize) {
        let now = Instant::now();
        self.shards.iter().fold((0, 0), |(counters, blocks), shard| {
            let (c, b) = shard.write().reclaim(now);
            (counters + c, blocks + b)
        })
    }
}

/// Rate limit state held in process memory.
///
/// Every read treats expired entries as absent, so correctness never depends
/// on the background reclamation task; that task only bounds memory use.
///
/// By default all keys share one lock. [`MemoryStore::with_options`] can
/// split the key space into independently locked shards for deployments with
/// many distinct identities.
pub struct MemoryStore {
    shared: Arc<Shared>,
    /// Flipped to `true` on close. Dropping it also stops the task.
    shutdown: watch::Sender<bool>,
    reclaimer: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("shards", &self.shared.shards.len())
            .field("closed", &self.shared.closed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl MemoryStore {
    /// Create a store with a single lock and the default reclamation interval.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new() -> Self {
        Self::with_options(DEFAULT_RECLAIM_INTERVAL, 1)
    }

    /// Create a store with a custom reclamation interval and shard count.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn with_options(reclaim_interval: Duration, shards: usize) -> Self {
        let shards = shards.max(1);
        let shared = Arc::new(Shared {
            shards: (0..shards).map(|_| RwLock::new(Tables::default())).collect(),
            hasher: RandomState::new(),
            closed: AtomicBool::new(false),
        });

        let (shutdown, shutdown_rx) = watch::channel(false);
        let reclaim_interval = reclaim_interval.max(Duration::from_millis(1));
        let handle = spawn_reclaimer(Arc::downgrade(&shared), reclaim_interval, shutdown_rx);

        debug!(
            shards = shards,
            reclaim_interval = ?reclaim_interval,
            "Created in-memory store"
        );

        Self {
            shared,
            shutdown,
            reclaimer: Mutex::new(Some(handle)),
        }
    }

    /// Remove every expired counter and block now.
    ///
    /// Returns the number of counters and blocks removed.
    pub fn reclaim_expired(&self) -> (usize, usize) {
        self.shared.reclaim_expired()
    }

    /// Number of counter entries physically held, expired or not.
    pub fn counter_count(&self) -> usize {
        self.shared.shards.iter().map(|s| s.read().counters.len()).sum()
    }

    /// Number of block entries physically held, expired or not.
    pub fn block_count(&self) -> usize {
        self.shared.shards.iter().map(|s| s.read().blocks.len()).sum()
    }

    /// Number of independently locked partitions.
    pub fn shard_count(&self) -> usize {
        self.shared.shards.len()
    }

    fn ensure_open(&self) -> Result<(), StorageError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(StorageError::Closed);
        }
        Ok(())
    }
}

fn spawn_reclaimer(
    shared: Weak<Shared>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let Some(shared) = shared.upgrade() else { break };
                    let (counters, blocks) = shared.reclaim_expired();
                    if counters + blocks > 0 {
                        debug!(
                            counters = counters,
                            blocks = blocks,
                            "Reclaimed expired rate limit entries"
                        );
                    }
                }
                _ = shutdown.changed() => break,
            }
        }

        trace!("Reclamation task stopped");
    })
}

#[async_trait]
impl Storage for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn increment(
        &self,
        key: &str,
        ttl: Duration,
        deadline: Deadline,
    ) -> Result<u64, StorageError> {
        self.ensure_open()?;
        deadline.check("increment")?;

        let now = Instant::now();
        let mut tables = self.shared.shard(key).write();

        if let Some(entry) = tables.counters.get_mut(key) {
            if entry.is_live(now) {
                entry.count += 1;
                return Ok(entry.count);
            }
        }

        tables.counters.insert(
            key.to_string(),
            CounterEntry {
                count: 1,
                expires_at: expiry_after(now, ttl),
            },
        );
        Ok(1)
    }

    async fn get(&self, key: &str, deadline: Deadline) -> Result<u64, StorageError> {
        self.ensure_open()?;
        deadline.check("get")?;

        let now = Instant::now();
        let tables = self.shared.shard(key).read();

        Ok(tables
            .counters
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map_or(0, |entry| entry.count))
    }

    async fn set_block(
        &self,
        key: &str,
        duration: Duration,
        deadline: Deadline,
    ) -> Result<(), StorageError> {
        self.ensure_open()?;
        deadline.check("set_block")?;

        let until = expiry_after(Instant::now(), duration);
        self.shared
            .shard(key)
            .write()
            .blocks
            .insert(key.to_string(), until);
        Ok(())
    }

    async fn is_blocked(&self, key: &str, deadline: Deadline) -> Result<bool, StorageError> {
        self.ensure_open()?;
        deadline.check("is_blocked")?;

        let now = Instant::now();
        let tables = self.shared.shard(key).read();

        Ok(tables.blocks.get(key).is_some_and(|until| now < *until))
    }

    async fn close(&self) -> Result<(), StorageError> {
        self.shared.closed.store(true, Ordering::SeqCst);
        // The task may already be gone; nothing to signal then.
        let _ = self.shutdown.send(true);

        let handle = self.reclaimer.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Reclamation task ended abnormally");
            }
            info!("In-memory store closed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(1);

    #[tokio::test(start_paused = true)]
    async fn test_increment_counts_up() {
        let store = MemoryStore::new();

        assert_eq!(store.increment("k", TTL, Deadline::none()).await.unwrap(), 1);
        assert_eq!(store.increment("k", TTL, Deadline::none()).await.unwrap(), 2);
        assert_eq!(store.increment("k", TTL, Deadline::none()).await.unwrap(), 3);
        assert_eq!(store.get("k", Deadline::none()).await.unwrap(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_increment_restarts_after_expiry() {
        let store = MemoryStore::new();

        store
            .increment("k", Duration::from_millis(100), Deadline::none())
            .await
            .unwrap();
        tokio::time::advance(Duration::from_millis(150)).await;

        assert_eq!(store.get("k", Deadline::none()).await.unwrap(), 0);
        assert_eq!(store.increment("k", TTL, Deadline::none()).await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_increment_keeps_original_expiry() {
        let store = MemoryStore::new();

        store.increment("k", TTL, Deadline::none()).await.unwrap();
        tokio::time::advance(Duration::from_millis(600)).await;
        assert_eq!(store.increment("k", TTL, Deadline::none()).await.unwrap(), 2);

        // 1.1s after the first increment the window is over even though the
        // second increment was only 0.5s ago.
        tokio::time::advance(Duration::from_millis(500)).await;
        assert_eq!(store.get("k", Deadline::none()).await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_missing_key() {
        let store = MemoryStore::new();
        assert_eq!(store.get("missing", Deadline::none()).await.unwrap(), 0);
        assert_eq!(store.counter_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_block_expires() {
        let store = MemoryStore::new();
        assert!(!store.is_blocked("k", Deadline::none()).await.unwrap());

        store
            .set_block("k", Duration::from_millis(100), Deadline::none())
            .await
            .unwrap();
        assert!(store.is_blocked("k", Deadline::none()).await.unwrap());

        tokio::time::advance(Duration::from_millis(150)).await;
        assert!(!store.is_blocked("k", Deadline::none()).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_block_overwrites() {
        let store = MemoryStore::new();

        store
            .set_block("k", Duration::from_secs(10), Deadline::none())
            .await
            .unwrap();
        store
            .set_block("k", Duration::from_millis(100), Deadline::none())
            .await
            .unwrap();

        tokio::time::advance(Duration::from_millis(150)).await;
        assert!(!store.is_blocked("k", Deadline::none()).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_duration_block_is_never_active() {
        let store = MemoryStore::new();

        store
            .set_block("k", Duration::ZERO, Deadline::none())
            .await
            .unwrap();
        assert!(!store.is_blocked("k", Deadline::none()).await.unwrap());

        // Also clears an earlier block.
        store
            .set_block("k", Duration::from_secs(10), Deadline::none())
            .await
            .unwrap();
        store
            .set_block("k", Duration::ZERO, Deadline::none())
            .await
            .unwrap();
        assert!(!store.is_blocked("k", Deadline::none()).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_huge_durations_are_clamped() {
        let store = MemoryStore::new();

        store
            .set_block("k", Duration::MAX, Deadline::none())
            .await
            .unwrap();
        assert_eq!(
            store.increment("k", Duration::MAX, Deadline::none()).await.unwrap(),
            1
        );

        tokio::time::advance(Duration::from_secs(10 * 365 * 24 * 60 * 60)).await;
        assert!(store.is_blocked("k", Deadline::none()).await.unwrap());
        assert_eq!(store.get("k", Deadline::none()).await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_block_is_independent_of_counter() {
        let store = MemoryStore::new();

        store.set_block("k", TTL, Deadline::none()).await.unwrap();
        assert_eq!(store.get("k", Deadline::none()).await.unwrap(), 0);

        store.increment("other", TTL, Deadline::none()).await.unwrap();
        assert!(!store.is_blocked("other", Deadline::none()).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reclaim_expired_removes_dead_entries() {
        let store = MemoryStore::new();

        store.increment("old", TTL, Deadline::none()).await.unwrap();
        store.set_block("old", TTL, Deadline::none()).await.unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;
        store.increment("new", TTL, Deadline::none()).await.unwrap();

        assert_eq!(store.counter_count(), 2);
        assert_eq!(store.block_count(), 1);

        assert_eq!(store.reclaim_expired(), (1, 1));
        assert_eq!(store.counter_count(), 1);
        assert_eq!(store.block_count(), 0);
        assert_eq!(store.get("new", Deadline::none()).await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_reclamation() {
        let store = MemoryStore::with_options(Duration::from_secs(10), 1);

        store.increment("k", TTL, Deadline::none()).await.unwrap();
        store.set_block("k", TTL, Deadline::none()).await.unwrap();

        // Expired entries stay until the task runs.
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(store.counter_count(), 1);
        assert_eq!(store.block_count(), 1);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(store.counter_count(), 0);
        assert_eq!(store.block_count(), 0);

        store.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_is_idempotent_and_final() {
        let store = MemoryStore::new();
        store.increment("k", TTL, Deadline::none()).await.unwrap();

        store.close().await.unwrap();
        store.close().await.unwrap();
        assert!(store.reclaimer.lock().is_none());

        assert!(matches!(
            store.increment("k", TTL, Deadline::none()).await,
            Err(StorageError::Closed)
        ));
        assert!(matches!(
            store.is_blocked("k", Deadline::none()).await,
            Err(StorageError::Closed)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_deadline_leaves_state_untouched() {
        let store = MemoryStore::new();
        let expired = Deadline::after(Duration::ZERO);

        let err = store.increment("k", TTL, expired).await.unwrap_err();
        assert!(err.is_timeout());
        assert!(store.set_block("k", TTL, expired).await.unwrap_err().is_timeout());
        assert!(store.get("k", expired).await.unwrap_err().is_timeout());

        assert_eq!(store.get("k", Deadline::none()).await.unwrap(), 0);
        assert!(!store.is_blocked("k", Deadline::none()).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sharded_store_keeps_keys_apart() {
        let store = MemoryStore::with_options(DEFAULT_RECLAIM_INTERVAL, 8);
        assert_eq!(store.shard_count(), 8);

        for i in 0..50 {
            let key = format!("ip:10.0.0.{}", i);
            for _ in 0..=i % 3 {
                store.increment(&key, TTL, Deadline::none()).await.unwrap();
            }
        }

        for i in 0..50 {
            let key = format!("ip:10.0.0.{}", i);
            let expected = (i % 3 + 1) as u64;
            assert_eq!(store.get(&key, Deadline::none()).await.unwrap(), expected);
        }
        assert_eq!(store.counter_count(), 50);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_increments_are_not_lost() {
        let store = Arc::new(MemoryStore::new());
        let ttl = Duration::from_secs(60);

        let tasks: Vec<_> = (0..100)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.increment("k", ttl, Deadline::none()).await })
            })
            .collect();

        let mut seen = Vec::new();
        for task in tasks {
            seen.push(task.await.unwrap().unwrap());
        }
        seen.sort_unstable();

        assert_eq!(seen, (1..=100).collect::<Vec<u64>>());
        assert_eq!(store.get("k", Deadline::none()).await.unwrap(), 100);
    }
}
