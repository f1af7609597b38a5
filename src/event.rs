//! Event types and wire encoding for the durable-storage boundary.
//!
//! Events cross the storage boundary as a `(type, json payload)` pair plus
//! an optional correlation token; [`encode_kind`] and [`decode_row`] convert
//! between that shape and the typed [`EventKind`] enum. Rows that cannot be
//! decoded (unknown type, malformed payload) are skipped with a warning so
//! one foreign row never wedges a replay.

use std::collections::BTreeMap;

use serde::ser::Error as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::storage::EventRow;
use crate::tree::Method;

/// Initial shape of a node carried by a `node_added` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewNode {
    /// Unique node id within the aggregate.
    pub id: String,
    /// Display name; contributes one path segment.
    pub name: String,
    /// Optional initial per-method data.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub operations: BTreeMap<Method, Value>,
}

/// The edit operations a sketch tree understands.
///
/// Adjacently tagged: `{"type": "node_added", "data": {...}}`. The tag
/// strings are the wire-level event types stored in the durable log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EventKind {
    /// Insert a node under `parent_id`, or at the root when absent.
    NodeAdded {
        node: NewNode,
        parent_id: Option<String>,
    },

    /// Update scalar node fields. Today that is the name; a rename cascades
    /// a path recomputation through the whole subtree.
    NodeUpdatedFields {
        node_id: String,
        name: Option<String>,
    },

    /// Merge `data` into the node's entry for `method`, field by field.
    NodeUpdatedData {
        node_id: String,
        method: Method,
        data: Value,
    },

    /// Reparent `source_id` under `target_id`, or under the root when
    /// `target_id` is absent.
    NodeMoved {
        source_id: Option<String>,
        target_id: Option<String>,
    },

    /// Remove a node and its entire subtree.
    NodeDeleted { node_id: Option<String> },
}

impl EventKind {
    /// The wire-level type tag for this kind (e.g. `"node_moved"`).
    pub fn type_name(&self) -> &'static str {
        match self {
            EventKind::NodeAdded { .. } => "node_added",
            EventKind::NodeUpdatedFields { .. } => "node_updated_fields",
            EventKind::NodeUpdatedData { .. } => "node_updated_data",
            EventKind::NodeMoved { .. } => "node_moved",
            EventKind::NodeDeleted { .. } => "node_deleted",
        }
    }
}

/// One durable, immutable edit of a sketch tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Per-aggregate monotonic sequence number, assigned at append time.
    pub sequence_id: u64,
    /// The aggregate (sketch) this event belongs to.
    pub aggregate_id: String,
    /// The edit operation and its payload.
    pub kind: EventKind,
    /// Opaque caller-supplied value matching a write to its applied
    /// notification.
    pub correlation_token: Option<String>,
}

/// Split an [`EventKind`] into the `(type, payload)` pair the storage
/// collaborator persists.
///
/// The payload is the `"data"` portion of the adjacently tagged enum;
/// `Value::Null` for a payload-free variant.
///
/// # Errors
///
/// Returns `serde_json::Error` if the kind cannot be serialized.
pub(crate) fn encode_kind(kind: &EventKind) -> serde_json::Result<(String, Value)> {
    let value = serde_json::to_value(kind)?;
    let Value::Object(mut obj) = value else {
        return Err(serde_json::Error::custom(
            "tagged event enum did not serialize to an object",
        ));
    };
    let event_type = match obj.get("type").and_then(Value::as_str) {
        Some(t) => t.to_owned(),
        None => {
            return Err(serde_json::Error::custom(
                "tagged event enum is missing its type field",
            ));
        }
    };
    let payload = obj.remove("data").unwrap_or(Value::Null);
    Ok((event_type, payload))
}

/// Reassemble a stored row into an [`Event`].
///
/// Returns `None` (after logging a warning) if the row's type is unknown or
/// its payload does not match the type's shape. Replay skips such rows;
/// they never fail an aggregate.
pub(crate) fn decode_row(aggregate_id: &str, row: EventRow) -> Option<Event> {
    let tagged = if row.payload.is_null() {
        serde_json::json!({ "type": row.event_type })
    } else {
        serde_json::json!({ "type": row.event_type, "data": row.payload })
    };

    match serde_json::from_value::<EventKind>(tagged) {
        Ok(kind) => Some(Event {
            sequence_id: row.sequence_id,
            aggregate_id: aggregate_id.to_owned(),
            kind,
            correlation_token: row.correlation_token,
        }),
        Err(e) => {
            tracing::warn!(
                aggregate_id,
                sequence_id = row.sequence_id,
                event_type = %row.event_type,
                error = %e,
                "skipping undecodable event row"
            );
            None
        }
    }
}
