//! Event-sourced tree projections for incremental API sketches.
//!
//! A sketch is an aggregate whose state is a tree of endpoint nodes. The
//! append-only event log is the only durable record; in-memory trees are
//! rebuilt from it on demand and kept current by per-aggregate appliers.

mod applier;
pub use applier::{ApplierHandle, WatchResult};
mod cache;
pub use cache::ProjectionCache;
mod delivery;
pub use delivery::{DeliveryStream, ListenerId};
mod error;
mod event;
mod log;
mod mutator;
mod storage;
mod store;
mod tree;

pub use error::{
    AppendError, MutateError, RejectedEvent, ReplayError, StorageError, TreeReadError, WaitError,
};
pub use event::{Event, EventKind, NewNode};
pub use log::EventLog;
pub use mutator::apply;
pub use storage::{EventRow, EventStorage, MemoryStorage};
pub use store::{SketchStore, SketchStoreBuilder};
pub use tree::{Method, Tree, TreeNode};
