//! Durable, ordered, append-only event log with per-aggregate delivery.
//!
//! The log owns the registry of [`DeliveryStream`]s. A successful append
//! persists the event, then pushes it into the aggregate's stream exactly
//! once before returning, so any subsequent replay already sees it and any
//! live listener receives it (or finds it buffered behind a replay gate).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::delivery::DeliveryStream;
use crate::error::{AppendError, ReplayError};
use crate::event::{Event, EventKind, decode_row, encode_kind};
use crate::storage::EventStorage;

/// Handle to the shared event log. `Clone` is cheap; all state is
/// `Arc`-wrapped.
#[derive(Clone)]
pub struct EventLog {
    storage: Arc<dyn EventStorage>,
    streams: Arc<Mutex<HashMap<String, Arc<DeliveryStream>>>>,
    // Serializes insert+push per aggregate so stream delivery order always
    // matches sequence order, even under concurrent appends.
    append_locks: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl std::fmt::Debug for EventLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLog").finish_non_exhaustive()
    }
}

impl EventLog {
    /// Create a log over the given storage backend.
    pub fn new(storage: Arc<dyn EventStorage>) -> Self {
        Self {
            storage,
            streams: Arc::new(Mutex::new(HashMap::new())),
            append_locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn append_lock(&self, aggregate_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = match self.append_locks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        locks
            .entry(aggregate_id.to_owned())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Get or create the delivery stream for an aggregate.
    pub fn stream(&self, aggregate_id: &str) -> Arc<DeliveryStream> {
        let mut streams = match self.streams.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        streams
            .entry(aggregate_id.to_owned())
            .or_insert_with(|| Arc::new(DeliveryStream::new()))
            .clone()
    }

    /// Persist one event, assign its sequence number, and push it into the
    /// aggregate's delivery stream.
    ///
    /// The push happens before this method returns and exactly once per
    /// successful append. Delivery order matches sequence order even under
    /// concurrent appends. For a failed append nothing is delivered
    /// anywhere and no projection state changes.
    ///
    /// # Errors
    ///
    /// [`AppendError::Encode`] if the payload cannot be serialized;
    /// [`AppendError::Storage`] if the durable write fails.
    pub async fn append(
        &self,
        aggregate_id: &str,
        kind: EventKind,
        correlation_token: Option<String>,
    ) -> Result<Event, AppendError> {
        let (event_type, payload) = encode_kind(&kind)?;

        // Hold the aggregate's append lock across write and delivery so a
        // concurrent append cannot deliver its event ahead of an earlier
        // sequence number.
        let lock = self.append_lock(aggregate_id);
        let _ordering = lock.lock().await;

        let sequence_id = self
            .storage
            .insert_event(
                aggregate_id,
                &event_type,
                &payload,
                correlation_token.as_deref(),
            )
            .await?;

        let event = Event {
            sequence_id,
            aggregate_id: aggregate_id.to_owned(),
            kind,
            correlation_token,
        };
        tracing::debug!(
            aggregate_id,
            sequence_id,
            event_type = %event_type,
            "event appended"
        );
        self.stream(aggregate_id).push(event.clone());
        Ok(event)
    }

    /// Replay all events for an aggregate at or after `from_sequence_id`,
    /// in ascending order.
    ///
    /// Rows that no longer decode (foreign writers, retired event types)
    /// are skipped with a warning rather than failing the aggregate.
    ///
    /// # Errors
    ///
    /// Returns [`ReplayError`] if the durable read fails.
    pub async fn replay(
        &self,
        aggregate_id: &str,
        from_sequence_id: u64,
    ) -> Result<Vec<Event>, ReplayError> {
        let rows = self
            .storage
            .select_events(aggregate_id, from_sequence_id)
            .await?;
        let events = rows
            .into_iter()
            .filter_map(|row| decode_row(aggregate_id, row))
            .collect();
        Ok(events)
    }
}
