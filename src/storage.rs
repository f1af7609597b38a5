//! Durable-storage collaborator boundary.
//!
//! The engine consumes exactly two operations from its storage backend:
//! an atomic insert that assigns the per-aggregate sequence number, and an
//! ordered range read for replay. Relational backends implement
//! [`EventStorage`] out of crate; [`MemoryStorage`] is the in-process
//! reference backend used by tests and embedders that do not need
//! durability.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::StorageError;

/// One persisted event row as it crosses the storage boundary.
#[derive(Debug, Clone, PartialEq)]
pub struct EventRow {
    /// Per-aggregate sequence number assigned by the backend.
    pub sequence_id: u64,
    /// Wire-level event type tag (e.g. `"node_added"`).
    pub event_type: String,
    /// JSON payload specific to the event type.
    pub payload: Value,
    /// Opaque caller-supplied correlation value, if any.
    pub correlation_token: Option<String>,
}

/// Append-only event storage, keyed by aggregate id.
///
/// # Contract
///
/// - `insert_event` must be atomic and must assign sequence numbers that
///   are unique and monotonically increasing per aggregate, starting at 1.
///   Concurrent inserts for different aggregates must not interfere.
/// - `select_events` must return an exhaustive, gap-free, ascending
///   sequence of all rows at or after `from_sequence_id`; calling it again
///   with the same arguments yields the same rows, modulo new inserts.
#[async_trait]
pub trait EventStorage: Send + Sync + 'static {
    /// Persist one event and return its assigned sequence number.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Write`] if the durable write fails. Nothing
    /// is persisted in that case.
    async fn insert_event(
        &self,
        aggregate_id: &str,
        event_type: &str,
        payload: &Value,
        correlation_token: Option<&str>,
    ) -> Result<u64, StorageError>;

    /// Read all rows for `aggregate_id` at or after `from_sequence_id`,
    /// in ascending sequence order.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Read`] if the durable read fails.
    async fn select_events(
        &self,
        aggregate_id: &str,
        from_sequence_id: u64,
    ) -> Result<Vec<EventRow>, StorageError>;
}

/// In-memory [`EventStorage`] backend.
///
/// Each aggregate's rows live in an ordered `Vec`; the next sequence number
/// is the vector length plus one, so assignment is atomic under the single
/// mutex. Not durable across process restarts.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    inner: Mutex<HashMap<String, Vec<EventRow>>>,
}

impl MemoryStorage {
    /// Create an empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventStorage for MemoryStorage {
    async fn insert_event(
        &self,
        aggregate_id: &str,
        event_type: &str,
        payload: &Value,
        correlation_token: Option<&str>,
    ) -> Result<u64, StorageError> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| StorageError::Write("storage mutex poisoned".into()))?;
        let rows = inner.entry(aggregate_id.to_owned()).or_default();
        let sequence_id = rows.len() as u64 + 1;
        rows.push(EventRow {
            sequence_id,
            event_type: event_type.to_owned(),
            payload: payload.clone(),
            correlation_token: correlation_token.map(str::to_owned),
        });
        Ok(sequence_id)
    }

    async fn select_events(
        &self,
        aggregate_id: &str,
        from_sequence_id: u64,
    ) -> Result<Vec<EventRow>, StorageError> {
        let inner = self
            .inner
            .lock()
            .map_err(|_| StorageError::Read("storage mutex poisoned".into()))?;
        let rows = inner
            .get(aggregate_id)
            .map(|rows| {
                rows.iter()
                    .filter(|r| r.sequence_id >= from_sequence_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn sequence_numbers_start_at_one_and_ascend() {
        let storage = MemoryStorage::new();
        for expected in 1..=3 {
            let seq = storage
                .insert_event("sketch-1", "node_added", &json!({}), None)
                .await
                .expect("insert should succeed");
            assert_eq!(seq, expected);
        }
    }

    #[tokio::test]
    async fn sequences_are_independent_per_aggregate() {
        let storage = MemoryStorage::new();
        storage
            .insert_event("sketch-1", "node_added", &json!({}), None)
            .await
            .expect("insert should succeed");
        let seq = storage
            .insert_event("sketch-2", "node_added", &json!({}), None)
            .await
            .expect("insert should succeed");
        assert_eq!(seq, 1, "second aggregate starts its own sequence");
    }

    #[tokio::test]
    async fn select_from_zero_and_one_both_return_everything() {
        let storage = MemoryStorage::new();
        for _ in 0..3 {
            storage
                .insert_event("sketch-1", "node_added", &json!({}), None)
                .await
                .expect("insert should succeed");
        }
        let from_zero = storage
            .select_events("sketch-1", 0)
            .await
            .expect("select should succeed");
        let from_one = storage
            .select_events("sketch-1", 1)
            .await
            .expect("select should succeed");
        assert_eq!(from_zero.len(), 3);
        assert_eq!(from_zero, from_one);
    }

    #[tokio::test]
    async fn select_from_midpoint_is_gap_free_and_ascending() {
        let storage = MemoryStorage::new();
        for i in 0..5 {
            storage
                .insert_event("sketch-1", "node_added", &json!({"i": i}), None)
                .await
                .expect("insert should succeed");
        }
        let rows = storage
            .select_events("sketch-1", 3)
            .await
            .expect("select should succeed");
        let sequences: Vec<u64> = rows.iter().map(|r| r.sequence_id).collect();
        assert_eq!(sequences, vec![3, 4, 5]);
    }

    #[tokio::test]
    async fn select_unknown_aggregate_is_empty() {
        let storage = MemoryStorage::new();
        let rows = storage
            .select_events("nope", 0)
            .await
            .expect("select should succeed");
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn correlation_token_round_trips() {
        let storage = MemoryStorage::new();
        storage
            .insert_event("sketch-1", "node_moved", &json!({}), Some("tok-9"))
            .await
            .expect("insert should succeed");
        let rows = storage
            .select_events("sketch-1", 0)
            .await
            .expect("select should succeed");
        assert_eq!(rows[0].correlation_token.as_deref(), Some("tok-9"));
    }
}
