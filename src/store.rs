//! Top-level entry point that composes the event log, delivery streams,
//! appliers, and the projection cache into a single [`SketchStore`] type.
//!
//! The store is opened via [`SketchStoreBuilder`], which configures the
//! storage backend and the timeouts governing applier idle eviction and
//! `append_applied` waits. Every collaborator hangs off the store
//! instance; two stores built over different backends share nothing.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use crate::cache::ProjectionCache;
use crate::error::{AppendError, TreeReadError, WaitError};
use crate::event::{Event, EventKind};
use crate::log::EventLog;
use crate::storage::{EventStorage, MemoryStorage};
use crate::tree::Tree;

/// Default idle timeout for projection appliers: 5 minutes.
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Default wait bound for [`SketchStore::append_applied`]: 10 seconds.
const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Central registry that manages sketch projection lifecycles.
///
/// The store owns the append path (durable write, then in-order delivery
/// to the aggregate's projection) and the read path (lazily built,
/// replay-backed tree snapshots). Trees are cache; the log is truth.
///
/// `Clone` is cheap -- all internal state is `Arc`-wrapped. Independent
/// stores built via separate builders share no state.
#[derive(Clone)]
pub struct SketchStore {
    log: EventLog,
    cache: Arc<ProjectionCache>,
    wait_timeout: Duration,
}

impl std::fmt::Debug for SketchStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SketchStore")
            .field("wait_timeout", &self.wait_timeout)
            .finish_non_exhaustive()
    }
}

impl SketchStore {
    /// Append one event to a sketch's log.
    ///
    /// The durable write happens first; only after storage has assigned a
    /// sequence number is the event delivered to the sketch's stream. The
    /// returned [`Event`] carries the assigned number. Callers that need
    /// to observe the event's effect on the tree should use
    /// [`append_applied`](SketchStore::append_applied) instead.
    ///
    /// # Errors
    ///
    /// [`AppendError`] if encoding or the durable write failed; nothing
    /// was persisted or delivered.
    pub async fn append(
        &self,
        aggregate_id: &str,
        kind: EventKind,
        correlation_token: Option<String>,
    ) -> Result<Event, AppendError> {
        self.log.append(aggregate_id, kind, correlation_token).await
    }

    /// Append one event and wait until the sketch's projection has applied
    /// it (or permanently skipped it).
    ///
    /// The waiter is registered under the event's correlation token before
    /// the durable write is issued, so the applied notification cannot be
    /// missed however quickly the applier runs. When `correlation_token`
    /// is `None` a fresh UUID is generated.
    ///
    /// # Returns
    ///
    /// The applied event. On return, [`current_tree`](SketchStore::current_tree)
    /// reflects the mutation.
    ///
    /// # Errors
    ///
    /// - [`WaitError::Replay`] if the projection could not be built.
    /// - [`WaitError::Append`] if the durable write failed; nothing was
    ///   persisted.
    /// - [`WaitError::Rejected`] if the event was persisted but is
    ///   structurally invalid; it was skipped and will never apply.
    /// - [`WaitError::Timeout`] if the applied notification did not arrive
    ///   in time. The event was persisted and may still apply.
    pub async fn append_applied(
        &self,
        aggregate_id: &str,
        kind: EventKind,
        correlation_token: Option<String>,
    ) -> Result<Event, WaitError> {
        let handle = self.cache.get_or_create(aggregate_id).await?;

        let token =
            correlation_token.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let notified = handle
            .watch(token.clone())
            .map_err(|_| WaitError::ApplierGone)?;

        let event = match self.log.append(aggregate_id, kind, Some(token.clone())).await {
            Ok(event) => event,
            Err(error) => {
                handle.unwatch(&token);
                return Err(error.into());
            }
        };

        match tokio::time::timeout(self.wait_timeout, notified).await {
            Ok(Ok(Ok(applied))) => Ok(applied),
            Ok(Ok(Err(rejected))) => Err(rejected.into()),
            Ok(Err(_gone)) => Err(WaitError::ApplierGone),
            Err(_elapsed) => {
                handle.unwatch(&token);
                tracing::warn!(
                    aggregate_id,
                    sequence_id = event.sequence_id,
                    "timed out waiting for event to apply"
                );
                Err(WaitError::Timeout {
                    sequence_id: event.sequence_id,
                })
            }
        }
    }

    /// Current tree snapshot for a sketch, building the projection from
    /// the log on first access.
    ///
    /// # Errors
    ///
    /// [`TreeReadError`] if the projection could not be built or its
    /// applier exited mid-read.
    pub async fn current_tree(&self, aggregate_id: &str) -> Result<Tree, TreeReadError> {
        let handle = self.cache.get_or_create(aggregate_id).await?;
        match handle.tree().await {
            // The applier can idle out between lookup and read; one
            // rebuild covers that window.
            Err(TreeReadError::ApplierGone) => {
                self.cache.get_or_create(aggregate_id).await?.tree().await
            }
            result => result,
        }
    }

    /// Sequence number of the last event folded into a sketch's tree.
    ///
    /// # Errors
    ///
    /// [`TreeReadError`] if the projection could not be built or its
    /// applier exited mid-read.
    pub async fn last_applied(&self, aggregate_id: &str) -> Result<u64, TreeReadError> {
        let handle = self.cache.get_or_create(aggregate_id).await?;
        match handle.last_applied().await {
            Err(TreeReadError::ApplierGone) => {
                self.cache
                    .get_or_create(aggregate_id)
                    .await?
                    .last_applied()
                    .await
            }
            result => result,
        }
    }

    /// Subscribe to applied-event notifications for one sketch.
    ///
    /// Notifications arrive in strictly increasing sequence order. The
    /// channel closes if the sketch's applier idles out; re-subscribing
    /// rebuilds the projection.
    ///
    /// # Errors
    ///
    /// [`TreeReadError::Replay`] if the projection could not be built.
    pub async fn subscribe(
        &self,
        aggregate_id: &str,
    ) -> Result<broadcast::Receiver<Event>, TreeReadError> {
        let handle = self.cache.get_or_create(aggregate_id).await?;
        Ok(handle.subscribe())
    }

    /// Drop every cached projection and stop their appliers.
    ///
    /// Storage is untouched: the next access to any sketch rebuilds its
    /// tree by full replay. Intended for tests that reuse one store
    /// across cases.
    pub async fn reset_all(&self) {
        self.cache.evict_all().await;
    }

    /// Drop one sketch's cached projection and stop its applier.
    pub async fn evict(&self, aggregate_id: &str) {
        self.cache.evict(aggregate_id).await;
    }
}

/// Builder for configuring and opening a [`SketchStore`].
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use sketchtree::{MemoryStorage, SketchStoreBuilder};
///
/// let store = SketchStoreBuilder::new()
///     .storage(Arc::new(MemoryStorage::new()))
///     .idle_timeout(std::time::Duration::from_secs(60))
///     .build();
/// ```
pub struct SketchStoreBuilder {
    storage: Option<Arc<dyn EventStorage>>,
    idle_timeout: Duration,
    wait_timeout: Duration,
}

impl SketchStoreBuilder {
    /// Create a new builder with default timeouts and no storage backend.
    pub fn new() -> Self {
        Self {
            storage: None,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
        }
    }

    /// Set the durable storage backend.
    ///
    /// Defaults to an in-process [`MemoryStorage`] when not set; pass a
    /// relational-backed implementation for durability.
    ///
    /// # Returns
    ///
    /// `self` for method chaining.
    pub fn storage(mut self, storage: Arc<dyn EventStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Set the idle timeout for applier eviction.
    ///
    /// Appliers that receive no events or reads for this duration shut
    /// down; the next access transparently rebuilds the tree from the
    /// log. Defaults to 5 minutes.
    ///
    /// # Returns
    ///
    /// `self` for method chaining.
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Set the wait bound for [`SketchStore::append_applied`].
    ///
    /// Defaults to 10 seconds.
    ///
    /// # Returns
    ///
    /// `self` for method chaining.
    pub fn wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = timeout;
        self
    }

    /// Build the [`SketchStore`].
    pub fn build(self) -> SketchStore {
        let storage = self
            .storage
            .unwrap_or_else(|| Arc::new(MemoryStorage::new()));
        let log = EventLog::new(storage);
        let cache = ProjectionCache::new(log.clone(), self.idle_timeout);
        SketchStore {
            log,
            cache: Arc::new(cache),
            wait_timeout: self.wait_timeout,
        }
    }
}

impl Default for SketchStoreBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MutateError;
    use crate::event::NewNode;
    use crate::tree::Method;
    use serde_json::json;

    fn store() -> SketchStore {
        SketchStoreBuilder::new().build()
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

    #[tokio::test]
    async fn append_applied_returns_once_the_tree_reflects_the_event() {
        let store = store();
        let event = store
            .append_applied("sketch-1", add("root", None), None)
            .await
            .expect("append should apply");
        assert_eq!(event.sequence_id, 1);
        assert!(
            event.correlation_token.is_some(),
            "a token is generated when none is supplied"
        );

        let tree = store.current_tree("sketch-1").await.expect("tree");
        assert_eq!(tree.last_applied, 1);
        assert!(tree.contains("root"));
    }

    #[tokio::test]
    async fn append_applied_surfaces_the_structural_error() {
        let store = store();
        store
            .append_applied("sketch-1", add("root", None), None)
            .await
            .expect("root add should apply");

        let err = store
            .append_applied(
                "sketch-1",
                EventKind::NodeDeleted {
                    node_id: Some("root".into()),
                },
                None,
            )
            .await
            .expect_err("root delete should be rejected");
        match err {
            WaitError::Rejected(rejected) => {
                assert_eq!(rejected.sequence_id, 2);
                assert_eq!(rejected.error, MutateError::RootDeleteForbidden);
            }
            other => panic!("expected Rejected, got {other:?}"),
        }

        // The rejected event advanced the high-water mark but left no trace.
        let tree = store.current_tree("sketch-1").await.expect("tree");
        assert_eq!(tree.last_applied, 2);
        assert!(tree.contains("root"));
    }

    #[tokio::test]
    async fn append_applied_honors_a_caller_supplied_token() {
        let store = store();
        let event = store
            .append_applied("sketch-1", add("root", None), Some("req-42".into()))
            .await
            .expect("append should apply");
        assert_eq!(event.correlation_token.as_deref(), Some("req-42"));
    }

    #[tokio::test]
    async fn plain_append_still_reaches_the_projection() {
        let store = store();
        // Build the projection first so the stream is live.
        store.current_tree("sketch-1").await.expect("empty tree");

        store
            .append("sketch-1", add("root", None), None)
            .await
            .expect("append");
        store
            .append("sketch-1", add("a", Some("root")), None)
            .await
            .expect("append");

        // Delivery is asynchronous relative to plain append.
        let applied = store
            .append_applied("sketch-1", add("b", Some("root")), None)
            .await
            .expect("append should apply");
        assert_eq!(applied.sequence_id, 3);

        let tree = store.current_tree("sketch-1").await.expect("tree");
        assert_eq!(tree.get("a").expect("a exists").full_path, "/a");
        assert_eq!(tree.get("b").expect("b exists").full_path, "/b");
    }

    #[tokio::test]
    async fn subscribe_sees_applied_events_in_order() {
        let store = store();
        let mut applied = store.subscribe("sketch-1").await.expect("subscribe");

        store
            .append_applied("sketch-1", add("root", None), None)
            .await
            .expect("append");
        store
            .append_applied("sketch-1", add("a", Some("root")), None)
            .await
            .expect("append");

        assert_eq!(applied.recv().await.expect("first").sequence_id, 1);
        assert_eq!(applied.recv().await.expect("second").sequence_id, 2);
    }

    #[tokio::test]
    async fn reset_all_preserves_the_log_and_rebuilds_on_access() {
        let store = store();
        store
            .append_applied("sketch-1", add("root", None), None)
            .await
            .expect("append");
        store
            .append_applied(
                "sketch-1",
                EventKind::NodeUpdatedData {
                    node_id: "root".into(),
                    method: Method::Get,
                    data: json!({"response": {"status": 200}}),
                },
                None,
            )
            .await
            .expect("append");

        store.reset_all().await;

        let tree = store.current_tree("sketch-1").await.expect("rebuilt tree");
        assert_eq!(tree.last_applied, 2);
        let root = tree.root_node().expect("root exists");
        assert_eq!(
            root.operations.get(&Method::Get),
            Some(&json!({"response": {"status": 200}}))
        );
    }

    #[tokio::test]
    async fn independent_stores_share_no_state() {
        let a = store();
        let b = store();
        a.append_applied("sketch-1", add("root", None), None)
            .await
            .expect("append");

        let tree = b.current_tree("sketch-1").await.expect("tree");
        assert!(tree.is_empty(), "separate backends, separate histories");
    }

    #[tokio::test]
    async fn cloned_stores_share_the_same_backend() {
        let a = store();
        let b = a.clone();
        a.append_applied("sketch-1", add("root", None), None)
            .await
            .expect("append");

        let tree = b.current_tree("sketch-1").await.expect("tree");
        assert!(tree.contains("root"));
    }
}
