//! Per-aggregate apply loop that owns the materialized tree.
//!
//! One tokio task per aggregate drains a single-consumer channel of events,
//! applying each through the pure mutator strictly in sequence order. This
//! is the only place an aggregate's tree is mutated; readers get clones of
//! the current snapshot through the handle. The task idles out after a
//! configurable timeout of inactivity and is transparently re-created by
//! the cache on next access (the tree is rebuilt from the log, not lost).
//!
//! Public API: [`ApplierHandle`] (cloneable async handle) and the
//! crate-internal [`spawn_applier`] used by the projection cache.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_stream::wrappers::BroadcastStream;

use crate::delivery::{DeliveryStream, ListenerId};
use crate::error::{RejectedEvent, TreeReadError};
use crate::event::Event;
use crate::mutator;
use crate::tree::Tree;

/// Capacity of the applied-notification broadcast channel. A lagging
/// subscriber loses old notifications, never the tree itself.
const APPLIED_CHANNEL_CAPACITY: usize = 256;

/// Configuration for the apply loop.
#[derive(Debug, Clone)]
pub(crate) struct ApplierConfig {
    /// How long the task waits for traffic before shutting down.
    pub idle_timeout: Duration,
}

/// Result delivered to a correlation-token waiter: the applied event, or
/// the structural error that caused it to be skipped.
pub type WatchResult = Result<Event, RejectedEvent>;

/// Control messages sent from [`ApplierHandle`] to the apply task.
pub(crate) enum ApplierMessage {
    /// Retrieve a clone of the current tree snapshot.
    GetTree {
        reply: oneshot::Sender<Tree>,
    },

    /// Retrieve the last applied sequence number.
    GetLastApplied {
        reply: oneshot::Sender<u64>,
    },

    /// Register a one-shot waiter for the event carrying this correlation
    /// token. Registered before the append is issued so the notification
    /// cannot be missed.
    Watch {
        token: String,
        notify: oneshot::Sender<WatchResult>,
    },

    /// Detach a waiter that gave up. The mutation it was waiting for still
    /// completes and affects the shared tree.
    Unwatch {
        token: String,
    },

    /// Gracefully shut down the apply task.
    Shutdown,
}

enum Wakeup {
    Event(Option<Event>),
    Message(Option<ApplierMessage>),
}

/// Runs one aggregate's apply loop.
///
/// The loop exits when both channels close, a `Shutdown` message arrives,
/// or the idle timeout elapses with no traffic.
async fn run_applier(
    aggregate_id: String,
    mut tree: Tree,
    mut events_rx: mpsc::UnboundedReceiver<Event>,
    mut messages_rx: mpsc::UnboundedReceiver<ApplierMessage>,
    applied_tx: broadcast::Sender<Event>,
    config: ApplierConfig,
) {
    let mut waiters: HashMap<String, oneshot::Sender<WatchResult>> = HashMap::new();

    loop {
        // Biased toward events so reads issued after an applied
        // notification observe the tree that notification described.
        let wakeup = tokio::time::timeout(config.idle_timeout, async {
            tokio::select! {
                biased;
                event = events_rx.recv() => Wakeup::Event(event),
                message = messages_rx.recv() => Wakeup::Message(message),
            }
        })
        .await;

        match wakeup {
            Err(_elapsed) => {
                tracing::info!(aggregate_id, "projection applier idle, shutting down");
                break;
            }
            Ok(Wakeup::Event(Some(event))) => {
                apply_one(&aggregate_id, &mut tree, event, &mut waiters, &applied_tx);
            }
            Ok(Wakeup::Message(Some(message))) => match message {
                ApplierMessage::GetTree { reply } => {
                    // If the receiver was dropped the caller stopped
                    // caring; discard silently.
                    let _ = reply.send(tree.clone());
                }
                ApplierMessage::GetLastApplied { reply } => {
                    let _ = reply.send(tree.last_applied);
                }
                ApplierMessage::Watch { token, notify } => {
                    waiters.insert(token, notify);
                }
                ApplierMessage::Unwatch { token } => {
                    waiters.remove(&token);
                }
                ApplierMessage::Shutdown => break,
            },
            // A closed channel means all senders are gone.
            Ok(Wakeup::Event(None)) | Ok(Wakeup::Message(None)) => break,
        }
    }
}

/// Apply a single event: dedup, mutate, publish.
fn apply_one(
    aggregate_id: &str,
    tree: &mut Tree,
    event: Event,
    waiters: &mut HashMap<String, oneshot::Sender<WatchResult>>,
    applied_tx: &broadcast::Sender<Event>,
) {
    // Replay and live delivery can race at the boundary; anything at or
    // below the high-water mark has already been applied (or skipped).
    if event.sequence_id <= tree.last_applied {
        tracing::debug!(
            aggregate_id,
            sequence_id = event.sequence_id,
            last_applied = tree.last_applied,
            "dropping stale or duplicate event"
        );
        return;
    }

    match mutator::apply(tree, &event) {
        Ok(mut next) => {
            next.last_applied = event.sequence_id;
            *tree = next;
            tracing::debug!(
                aggregate_id,
                sequence_id = event.sequence_id,
                event_type = event.kind.type_name(),
                "event applied"
            );
            resolve_waiter(waiters, &event, Ok(event.clone()));
            // No subscribers is fine; the tree is already updated.
            let _ = applied_tx.send(event);
        }
        Err(error) => {
            tracing::error!(
                aggregate_id,
                sequence_id = event.sequence_id,
                correlation_token = event.correlation_token.as_deref(),
                error = %error,
                "event could not be applied, skipping permanently"
            );
            // Advance the high-water mark so a redelivery of the same
            // event is not retried; retrying a structurally invalid event
            // can never succeed.
            tree.last_applied = event.sequence_id;
            resolve_waiter(
                waiters,
                &event,
                Err(RejectedEvent {
                    sequence_id: event.sequence_id,
                    error,
                }),
            );
        }
    }
}

/// Fire the waiter registered under the event's correlation token, if any.
fn resolve_waiter(
    waiters: &mut HashMap<String, oneshot::Sender<WatchResult>>,
    event: &Event,
    result: WatchResult,
) {
    if let Some(token) = event.correlation_token.as_deref()
        && let Some(notify) = waiters.remove(token)
    {
        let _ = notify.send(result);
    }
}

/// Async handle to a running projection applier.
///
/// Lightweight and cloneable; all methods are non-blocking sends to the
/// apply task (plus a oneshot await for reads).
pub struct ApplierHandle {
    aggregate_id: Arc<str>,
    events_tx: mpsc::UnboundedSender<Event>,
    messages_tx: mpsc::UnboundedSender<ApplierMessage>,
    applied_tx: broadcast::Sender<Event>,
    stream: Arc<DeliveryStream>,
    listener_id: ListenerId,
}

impl Clone for ApplierHandle {
    fn clone(&self) -> Self {
        Self {
            aggregate_id: self.aggregate_id.clone(),
            events_tx: self.events_tx.clone(),
            messages_tx: self.messages_tx.clone(),
            applied_tx: self.applied_tx.clone(),
            stream: self.stream.clone(),
            listener_id: self.listener_id,
        }
    }
}

impl std::fmt::Debug for ApplierHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApplierHandle")
            .field("aggregate_id", &self.aggregate_id)
            .finish_non_exhaustive()
    }
}

impl ApplierHandle {
    /// The aggregate this handle projects.
    pub fn aggregate_id(&self) -> &str {
        &self.aggregate_id
    }

    /// Check whether the apply task behind this handle is still running.
    ///
    /// The cache uses this to replace handles whose task idled out.
    pub fn is_alive(&self) -> bool {
        !self.messages_tx.is_closed()
    }

    /// Retrieve a clone of the current tree snapshot.
    ///
    /// The snapshot may be superseded by later events the moment it is
    /// returned; it is never mutated in place.
    ///
    /// # Errors
    ///
    /// [`TreeReadError::ApplierGone`] if the apply task has exited.
    pub async fn tree(&self) -> Result<Tree, TreeReadError> {
        let (tx, rx) = oneshot::channel();
        self.messages_tx
            .send(ApplierMessage::GetTree { reply: tx })
            .map_err(|_| TreeReadError::ApplierGone)?;
        rx.await.map_err(|_| TreeReadError::ApplierGone)
    }

    /// Sequence number of the last event folded into the tree.
    ///
    /// # Errors
    ///
    /// [`TreeReadError::ApplierGone`] if the apply task has exited.
    pub async fn last_applied(&self) -> Result<u64, TreeReadError> {
        let (tx, rx) = oneshot::channel();
        self.messages_tx
            .send(ApplierMessage::GetLastApplied { reply: tx })
            .map_err(|_| TreeReadError::ApplierGone)?;
        rx.await.map_err(|_| TreeReadError::ApplierGone)
    }

    /// Subscribe to applied-event notifications.
    ///
    /// Notifications are delivered in strictly increasing sequence order.
    /// A receiver that falls more than the channel capacity behind observes
    /// a lag error, not reordered events.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.applied_tx.subscribe()
    }

    /// Applied-event notifications as a [`tokio_stream::Stream`].
    pub fn stream(&self) -> BroadcastStream<Event> {
        BroadcastStream::new(self.applied_tx.subscribe())
    }

    /// Register a waiter for the event carrying `token`, before issuing
    /// the append it correlates with.
    ///
    /// The returned receiver resolves with the applied event, or with the
    /// structural error if the event is skipped.
    ///
    /// # Errors
    ///
    /// [`TreeReadError::ApplierGone`] if the apply task has exited.
    pub fn watch(&self, token: String) -> Result<oneshot::Receiver<WatchResult>, TreeReadError> {
        let (notify, rx) = oneshot::channel();
        self.messages_tx
            .send(ApplierMessage::Watch { token, notify })
            .map_err(|_| TreeReadError::ApplierGone)?;
        Ok(rx)
    }

    /// Detach the waiter registered under `token`.
    ///
    /// Callers that give up waiting must detach; the mutation they were
    /// waiting for still completes.
    pub fn unwatch(&self, token: &str) {
        let _ = self.messages_tx.send(ApplierMessage::Unwatch {
            token: token.to_owned(),
        });
    }

    /// Feed one event directly into the apply queue, bypassing the
    /// delivery stream. Used to drain replay before the stream goes live.
    pub(crate) fn deliver(&self, event: Event) {
        let _ = self.events_tx.send(event);
    }

    /// Shut down the apply task and detach from the delivery stream.
    pub(crate) fn shutdown(&self) {
        self.stream.remove_listener(self.listener_id);
        let _ = self.messages_tx.send(ApplierMessage::Shutdown);
    }
}

/// Spawn the apply task for one aggregate and subscribe it to the
/// aggregate's delivery stream.
///
/// The caller (the projection cache) is responsible for gating the stream:
/// `enter_buffering` before replay, feed history via
/// [`ApplierHandle::deliver`], then `enter_live`.
pub(crate) fn spawn_applier(
    aggregate_id: String,
    tree: Tree,
    stream: Arc<DeliveryStream>,
    config: ApplierConfig,
) -> ApplierHandle {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (messages_tx, messages_rx) = mpsc::unbounded_channel();
    let (applied_tx, _) = broadcast::channel(APPLIED_CHANNEL_CAPACITY);

    let listener_id = stream.add_listener(events_tx.clone());

    tokio::spawn(run_applier(
        aggregate_id.clone(),
        tree,
        events_rx,
        messages_rx,
        applied_tx.clone(),
        config,
    ));

    ApplierHandle {
        aggregate_id: aggregate_id.into(),
        events_tx,
        messages_tx,
        applied_tx,
        stream,
        listener_id,
    }
}
