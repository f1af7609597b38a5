//! Cache of live projection appliers, keyed by aggregate id.
//!
//! Projections are built lazily: the first access replays the aggregate's
//! log into a fresh applier, and the handle is cached for later callers.
//! Concurrent first accesses coalesce onto a single replay. Handles whose
//! apply task idled out are detected via [`ApplierHandle::is_alive`] and
//! rebuilt transparently.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OnceCell};

use crate::applier::{self, ApplierConfig, ApplierHandle};
use crate::error::ReplayError;
use crate::log::EventLog;
use crate::tree::Tree;

type Slot = Arc<OnceCell<ApplierHandle>>;

/// Lazily built, coalescing cache of per-aggregate projections.
pub struct ProjectionCache {
    log: EventLog,
    config: ApplierConfig,
    slots: Mutex<HashMap<String, Slot>>,
}

impl std::fmt::Debug for ProjectionCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectionCache")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ProjectionCache {
    /// Create a cache over the given log. Appliers spawned by this cache
    /// shut down after `idle_timeout` without traffic.
    pub fn new(log: EventLog, idle_timeout: std::time::Duration) -> Self {
        Self {
            log,
            config: ApplierConfig { idle_timeout },
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Get the live projection for `aggregate_id`, building it from the
    /// log if it does not exist yet.
    ///
    /// Concurrent callers for the same aggregate share one replay; only
    /// one applier task is ever spawned per aggregate. If a previous
    /// handle's task idled out, a fresh projection replaces it.
    ///
    /// # Errors
    ///
    /// [`ReplayError`] if the aggregate's history could not be read. No
    /// cache entry is left behind on failure.
    pub async fn get_or_create(&self, aggregate_id: &str) -> Result<ApplierHandle, ReplayError> {
        let slot = self.slot(aggregate_id, false).await;
        if let Some(handle) = self.init(aggregate_id, &slot).await? {
            return Ok(handle);
        }

        // The cached task idled out. Take a fresh slot; another caller may
        // have already done so, in which case we join their replay.
        tracing::debug!(aggregate_id, "cached projection is stale, rebuilding");
        let slot = self.slot(aggregate_id, true).await;
        match self.init(aggregate_id, &slot).await? {
            Some(handle) => Ok(handle),
            // The rebuilt task cannot have idled out between creation and
            // return unless the timeout is pathologically short; surface
            // that as a replay-level read of zero rather than looping.
            None => self.build(aggregate_id).await,
        }
    }

    /// Drop the cached projection for one aggregate and stop its task.
    ///
    /// The log is untouched; the next access rebuilds from history.
    pub async fn evict(&self, aggregate_id: &str) {
        let slot = self.slots.lock().await.remove(aggregate_id);
        if let Some(slot) = slot
            && let Some(handle) = slot.get()
        {
            handle.shutdown();
        }
    }

    /// Drop every cached projection and stop their tasks.
    pub async fn evict_all(&self) {
        let slots = std::mem::take(&mut *self.slots.lock().await);
        for slot in slots.into_values() {
            if let Some(handle) = slot.get() {
                handle.shutdown();
            }
        }
    }

    /// Number of cached projections, live or stale.
    pub async fn len(&self) -> usize {
        self.slots.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.slots.lock().await.is_empty()
    }

    /// Fetch the slot for an aggregate, optionally replacing a slot whose
    /// handle went stale. The map lock is held only for the lookup; replay
    /// happens on the slot's own cell.
    async fn slot(&self, aggregate_id: &str, replace_stale: bool) -> Slot {
        let mut slots = self.slots.lock().await;
        if replace_stale
            && let Some(slot) = slots.get(aggregate_id)
            && let Some(handle) = slot.get()
            && !handle.is_alive()
        {
            slots.remove(aggregate_id);
        }
        slots
            .entry(aggregate_id.to_owned())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone()
    }

    /// Initialize the slot if needed and return its handle, or `None` if
    /// the cached handle's task has exited.
    async fn init(
        &self,
        aggregate_id: &str,
        slot: &Slot,
    ) -> Result<Option<ApplierHandle>, ReplayError> {
        let handle = slot
            .get_or_try_init(|| self.build(aggregate_id))
            .await?
            .clone();
        Ok(handle.is_alive().then_some(handle))
    }

    /// Replay the aggregate's log into a fresh applier.
    ///
    /// The delivery stream is gated while history is drained so live
    /// appends issued mid-replay are buffered, then flushed in order; the
    /// applier's high-water mark drops whatever replay already covered.
    async fn build(&self, aggregate_id: &str) -> Result<ApplierHandle, ReplayError> {
        let stream = self.log.stream(aggregate_id);
        stream.enter_buffering();

        let handle = applier::spawn_applier(
            aggregate_id.to_owned(),
            Tree::default(),
            stream.clone(),
            self.config.clone(),
        );

        let history = match self.log.replay(aggregate_id, 0).await {
            Ok(history) => history,
            Err(error) => {
                handle.shutdown();
                stream.enter_live();
                return Err(error);
            }
        };

        let replayed = history.len();
        for event in history {
            handle.deliver(event);
        }
        stream.enter_live();

        tracing::info!(aggregate_id, replayed, "projection built from log");
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventKind, NewNode};
    use crate::storage::{EventStorage, MemoryStorage};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn cache_over(storage: Arc<dyn EventStorage>, idle_timeout: Duration) -> ProjectionCache {
        ProjectionCache::new(EventLog::new(storage), idle_timeout)
    }

    fn add(id: &str, parent: Option<&str>) -> EventKind {
        EventKind::NodeAdded {
            node: NewNode {
                id: id.into(),
                name: id.into(),
                operations: Default::default(),
            },
            parent_id: parent.map(str::to_owned),
        }
    }

    /// Storage wrapper that counts replay reads.
    struct CountingStorage {
        inner: MemoryStorage,
        reads: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl EventStorage for CountingStorage {
        async fn insert_event(
            &self,
            aggregate_id: &str,
            event_type: &str,
            payload: &serde_json::Value,
            correlation_token: Option<&str>,
        ) -> Result<u64, crate::error::StorageError> {
            self.inner
                .insert_event(aggregate_id, event_type, payload, correlation_token)
                .await
        }

        async fn select_events(
            &self,
            aggregate_id: &str,
            from_sequence_id: u64,
        ) -> Result<Vec<crate::storage::EventRow>, crate::error::StorageError> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            self.inner.select_events(aggregate_id, from_sequence_id).await
        }
    }

    #[tokio::test]
    async fn first_access_replays_the_log() {
        let storage = Arc::new(MemoryStorage::new());
        let log = EventLog::new(storage.clone());
        log.append("sketch-1", add("root", None), None)
            .await
            .expect("append");
        log.append("sketch-1", add("a", Some("root")), None)
            .await
            .expect("append");

        let cache = cache_over(storage, Duration::from_secs(60));
        let handle = cache.get_or_create("sketch-1").await.expect("projection");
        let tree = handle.tree().await.expect("tree");
        assert_eq!(tree.last_applied, 2);
        assert_eq!(tree.get("a").expect("a exists").full_path, "/a");
    }

    #[tokio::test]
    async fn repeated_access_returns_the_cached_projection() {
        let storage: Arc<CountingStorage> = Arc::new(CountingStorage {
            inner: MemoryStorage::new(),
            reads: AtomicUsize::new(0),
        });
        let cache = cache_over(storage.clone(), Duration::from_secs(60));

        let first = cache.get_or_create("sketch-1").await.expect("projection");
        let second = cache.get_or_create("sketch-1").await.expect("projection");

        assert_eq!(storage.reads.load(Ordering::SeqCst), 1, "one replay only");
        assert_eq!(cache.len().await, 1);
        assert_eq!(first.aggregate_id(), second.aggregate_id());
    }

    #[tokio::test]
    async fn concurrent_first_accesses_share_one_replay() {
        let storage: Arc<CountingStorage> = Arc::new(CountingStorage {
            inner: MemoryStorage::new(),
            reads: AtomicUsize::new(0),
        });
        let cache = Arc::new(cache_over(storage.clone(), Duration::from_secs(60)));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            tasks.push(tokio::spawn(async move {
                cache.get_or_create("sketch-1").await.expect("projection")
            }));
        }
        for task in tasks {
            task.await.expect("task");
        }

        assert_eq!(storage.reads.load(Ordering::SeqCst), 1, "replay coalesced");
    }

    #[tokio::test]
    async fn stale_handle_is_rebuilt_transparently() {
        let storage = Arc::new(MemoryStorage::new());
        let log = EventLog::new(storage.clone());
        log.append("sketch-1", add("root", None), None)
            .await
            .expect("append");

        let cache = cache_over(storage, Duration::from_millis(50));
        let first = cache.get_or_create("sketch-1").await.expect("projection");

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!first.is_alive(), "task should idle out");

        let second = cache.get_or_create("sketch-1").await.expect("projection");
        assert!(second.is_alive());
        let tree = second.tree().await.expect("tree");
        assert_eq!(tree.last_applied, 1, "rebuilt from the log");
    }

    #[tokio::test]
    async fn evict_stops_the_task_and_forgets_the_entry() {
        let storage = Arc::new(MemoryStorage::new());
        let cache = cache_over(storage, Duration::from_secs(60));
        let handle = cache.get_or_create("sketch-1").await.expect("projection");

        cache.evict("sketch-1").await;
        assert!(cache.is_empty().await);

        // Shutdown is asynchronous; give the task a beat to drain it.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_alive());
    }

    #[tokio::test]
    async fn evict_all_clears_every_aggregate() {
        let storage = Arc::new(MemoryStorage::new());
        let cache = cache_over(storage, Duration::from_secs(60));
        cache.get_or_create("sketch-1").await.expect("projection");
        cache.get_or_create("sketch-2").await.expect("projection");
        assert_eq!(cache.len().await, 2);

        cache.evict_all().await;
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn replay_failure_leaves_no_cache_entry() {
        struct FailingStorage;

        #[async_trait::async_trait]
        impl EventStorage for FailingStorage {
            async fn insert_event(
                &self,
                _aggregate_id: &str,
                _event_type: &str,
                _payload: &serde_json::Value,
                _correlation_token: Option<&str>,
            ) -> Result<u64, crate::error::StorageError> {
                Err(crate::error::StorageError::Write("disk full".into()))
            }

            async fn select_events(
                &self,
                _aggregate_id: &str,
                _from_sequence_id: u64,
            ) -> Result<Vec<crate::storage::EventRow>, crate::error::StorageError> {
                Err(crate::error::StorageError::Read("disk gone".into()))
            }
        }

        let cache = cache_over(Arc::new(FailingStorage), Duration::from_secs(60));
        let err = cache
            .get_or_create("sketch-1")
            .await
            .expect_err("replay should fail");
        assert!(matches!(err, ReplayError::Storage(_)));

        // The failed slot does not pin the error; a later attempt retries.
        let err = cache
            .get_or_create("sketch-1")
            .await
            .expect_err("replay should fail again");
        assert!(matches!(err, ReplayError::Storage(_)));
    }
}
