//! Crate-level error types.
//!
//! Three families, mirroring how failures surface to callers:
//!
//! - [`MutateError`]: structural failures raised by the tree mutator. Always
//!   local to one event; the applier logs and permanently skips the event.
//! - [`StorageError`]: durable-storage failures, propagated synchronously to
//!   the original `append` caller.
//! - Lifecycle errors ([`ReplayError`], [`TreeReadError`], [`WaitError`]):
//!   failures to build or consult a projection.

/// A structural failure applying one event to a tree snapshot.
///
/// These are pure: the input tree is never modified when one is returned.
/// Retrying a structurally invalid event can never succeed, so the applier
/// skips such events permanently rather than retrying them.
// Display and Error are implemented by hand rather than derived: thiserror
// unconditionally treats a field named `source` as the error's source(), and
// `CircularMove::source` is a plain node-id String that is part of the API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutateError {
    /// The referenced node id is not present in the tree index.
    UnknownNode(String),

    /// A `node_added` event named a parent that is not in the index.
    UnknownParent(String),

    /// A `node_added` event carried an id that is already in the index.
    DuplicateNode(String),

    /// The root node cannot be renamed.
    RootRenameForbidden,

    /// The root node cannot be moved.
    RootMoveForbidden,

    /// The root node cannot be deleted.
    RootDeleteForbidden,

    /// Moving `source` under `target` would make the node its own ancestor.
    CircularMove {
        /// Id of the node being moved.
        source: String,
        /// Id of the intended new parent.
        target: String,
    },

    /// A `node_moved` payload was missing an id, or an id did not resolve.
    MissingSourceOrTarget,

    /// A `node_deleted` payload carried no node id.
    MissingNodeId,
}

impl std::fmt::Display for MutateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownNode(id) => write!(f, "unknown node: {id}"),
            Self::UnknownParent(id) => write!(f, "unknown parent: {id}"),
            Self::DuplicateNode(id) => write!(f, "duplicate node id: {id}"),
            Self::RootRenameForbidden => write!(f, "the root node cannot be renamed"),
            Self::RootMoveForbidden => write!(f, "the root node cannot be moved"),
            Self::RootDeleteForbidden => write!(f, "the root node cannot be deleted"),
            Self::CircularMove { source, target } => {
                write!(f, "cannot move {source} under its own descendant {target}")
            }
            Self::MissingSourceOrTarget => {
                write!(f, "move event is missing its source or target node")
            }
            Self::MissingNodeId => write!(f, "delete event carries no node id"),
        }
    }
}

impl std::error::Error for MutateError {}

/// A durable-storage failure from the [`EventStorage`](crate::EventStorage)
/// collaborator.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StorageError {
    /// The durable write failed. No event was persisted and nothing was
    /// delivered to any stream.
    #[error("durable write failed: {0}")]
    Write(String),

    /// The durable read failed while replaying an aggregate's log.
    #[error("durable read failed: {0}")]
    Read(String),
}

/// Error returned by [`EventLog::append`](crate::EventLog::append) and
/// [`SketchStore::append`](crate::SketchStore::append).
#[derive(Debug, thiserror::Error)]
pub enum AppendError {
    /// The event payload could not be serialized for the wire.
    #[error("event payload could not be encoded: {0}")]
    Encode(#[from] serde_json::Error),

    /// The durable write failed; the caller decides whether to retry.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Error returned when replaying an aggregate's log fails.
///
/// Propagated from `get_or_create` when a freshly created projection cannot
/// be positioned; no cache entry is left behind.
#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    /// The durable read failed.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Error returned when reading a projection's current tree fails.
#[derive(Debug, thiserror::Error)]
pub enum TreeReadError {
    /// The projection could not be (re)built from the log.
    #[error(transparent)]
    Replay(#[from] ReplayError),

    /// The applier task backing this projection has exited.
    #[error("projection applier is no longer running")]
    ApplierGone,
}

/// An event that was appended but permanently skipped by the applier.
///
/// Delivered to the correlation-token waiter so the appending caller learns
/// the structural error instead of timing out.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("event {sequence_id} could not be applied: {error}")]
pub struct RejectedEvent {
    /// Sequence number assigned to the skipped event.
    pub sequence_id: u64,
    /// The structural error raised by the mutator.
    #[source]
    pub error: MutateError,
}

/// Error returned by [`SketchStore::append_applied`](crate::SketchStore::append_applied).
#[derive(Debug, thiserror::Error)]
pub enum WaitError {
    /// The projection could not be (re)built before the append.
    #[error(transparent)]
    Replay(#[from] ReplayError),

    /// The append itself failed; nothing was persisted or delivered.
    #[error(transparent)]
    Append(#[from] AppendError),

    /// The event was persisted but failed to apply structurally.
    #[error(transparent)]
    Rejected(#[from] RejectedEvent),

    /// The event was persisted but its applied notification did not arrive
    /// within the configured wait timeout. The mutation may still complete
    /// and affect the shared tree.
    #[error("timed out waiting for event {sequence_id} to apply")]
    Timeout {
        /// Sequence number of the event this caller was waiting on.
        sequence_id: u64,
    },

    /// The applier task exited while the caller was waiting.
    #[error("projection applier is no longer running")]
    ApplierGone,
}
