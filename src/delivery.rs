//! Per-aggregate ordered fan-out of events, with a buffering gate.
//!
//! A listener that is still consuming historical replay must not also
//! receive live events out of order relative to the tail of history it has
//! not seen yet. The stream therefore starts in `Buffering`: live pushes
//! queue in arrival order and are flushed, still in order, when
//! [`DeliveryStream::enter_live`] is called after replay has positioned the
//! listener. Each listener gets its own unbounded channel so a slow
//! listener never blocks delivery to the others.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use tokio::sync::mpsc;

use crate::event::Event;

/// Identifies one registered listener for removal.
pub type ListenerId = u64;

enum StreamState {
    /// Pushes queue in arrival order; nothing is delivered.
    Buffering(VecDeque<Event>),
    /// Pushes are delivered immediately.
    Live,
}

struct StreamInner {
    state: StreamState,
    listeners: HashMap<ListenerId, mpsc::UnboundedSender<Event>>,
    next_listener: ListenerId,
}

/// One aggregate's delivery stream.
///
/// All operations are non-blocking; the internal mutex is never held across
/// an await point.
pub struct DeliveryStream {
    inner: Mutex<StreamInner>,
}

impl Default for DeliveryStream {
    fn default() -> Self {
        Self::new()
    }
}

impl DeliveryStream {
    /// Create a stream in the initial `Buffering` state.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(StreamInner {
                state: StreamState::Buffering(VecDeque::new()),
                listeners: HashMap::new(),
                next_listener: 0,
            }),
        }
    }

    /// Register a listener; events are delivered on `sender`.
    ///
    /// Returns an id for [`remove_listener`](DeliveryStream::remove_listener).
    pub fn add_listener(&self, sender: mpsc::UnboundedSender<Event>) -> ListenerId {
        let mut inner = self.lock();
        let id = inner.next_listener;
        inner.next_listener += 1;
        inner.listeners.insert(id, sender);
        id
    }

    /// Remove a listener. Removing an unknown or already-removed id is a
    /// no-op.
    pub fn remove_listener(&self, id: ListenerId) {
        self.lock().listeners.remove(&id);
    }

    /// Number of currently registered listeners.
    pub fn listener_count(&self) -> usize {
        self.lock().listeners.len()
    }

    /// Switch to `Buffering`, queueing subsequent pushes.
    ///
    /// Called before a fresh replay so live appends racing the replay are
    /// held back. Idempotent: an already-buffering stream keeps its queue.
    pub fn enter_buffering(&self) {
        let mut inner = self.lock();
        if let StreamState::Live = inner.state {
            inner.state = StreamState::Buffering(VecDeque::new());
        }
    }

    /// Flush any buffered events to listeners in original arrival order,
    /// then deliver all subsequent pushes immediately. Idempotent.
    pub fn enter_live(&self) {
        let mut inner = self.lock();
        let prior = std::mem::replace(&mut inner.state, StreamState::Live);
        if let StreamState::Buffering(queue) = prior {
            for event in queue {
                fan_out(&mut inner, event);
            }
        }
    }

    /// Push one event into the stream.
    ///
    /// Buffered while the stream is `Buffering`, fanned out to every
    /// listener while `Live`. Listeners whose receiver has been dropped are
    /// pruned here.
    pub fn push(&self, event: Event) {
        let mut inner = self.lock();
        if let StreamState::Buffering(queue) = &mut inner.state {
            queue.push_back(event);
        } else {
            fan_out(&mut inner, event);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StreamInner> {
        // A poisoned mutex means a panic while holding the lock; the state
        // is still structurally sound for fan-out bookkeeping.
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Deliver `event` to every listener, pruning the ones whose receiver is
/// gone.
fn fan_out(inner: &mut StreamInner, event: Event) {
    let mut dead = Vec::new();
    for (id, sender) in &inner.listeners {
        if sender.send(event.clone()).is_err() {
            dead.push(*id);
        }
    }
    for id in dead {
        tracing::debug!(listener_id = id, "pruning dead delivery listener");
        inner.listeners.remove(&id);
    }
}
