//! Remote collection abstraction.
//!
//! A room on the remote side holds three things: a shape collection keyed by
//! shape id, a presence collection keyed by client id, and one snapshot
//! document. Backends implement [`ShapeCollection`] and
//! [`PresenceCollection`]; the engine only ever sees these traits.

mod convert;
mod memory;
mod snapshot;

pub use convert::{
    merge_fields, patch_from_fields, shape_from_fields, shape_to_fields, write_to_fields, KEY_SELECTED_BY,
    KEY_UPDATED_AT,
};
pub use memory::MemoryRoom;
pub use snapshot::SnapshotDocument;

use crate::error::RemoteResult;
use crate::presence::PresenceRecord;
use crate::shapes::ShapeId;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use tokio::sync::mpsc;

/// Boxed future for remote operations.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A flat remote document.
pub type DocFields = serde_json::Map<String, serde_json::Value>;

/// What happened to a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

/// One document change as delivered by a subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShapeChange {
    pub id: ShapeId,
    pub kind: ChangeKind,
    /// The full stored document after the change; empty for removals.
    #[serde(default)]
    pub fields: DocFields,
}

/// A group of changes delivered together.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FeedBatch {
    /// Set on the first batch of a subscription, which carries every
    /// existing document.
    #[serde(default)]
    pub initial: bool,
    pub changes: Vec<ShapeChange>,
}

/// Receiving side of a shape subscription.
pub type ShapeFeed = mpsc::UnboundedReceiver<FeedBatch>;

/// Receiving side of a presence subscription. Every item is the complete
/// current set of records.
pub type PresenceFeed = mpsc::UnboundedReceiver<Vec<PresenceRecord>>;

/// The shared shape collection and snapshot document.
pub trait ShapeCollection: Send + Sync {
    /// Merge-write one document.
    fn set_shape(&self, id: &str, fields: DocFields) -> BoxFuture<'_, RemoteResult<()>>;

    /// Merge-write several documents as one best-effort batch.
    fn set_shapes(&self, docs: Vec<(ShapeId, DocFields)>) -> BoxFuture<'_, RemoteResult<()>>;

    /// Delete one document. Deleting a missing document is not an error.
    fn delete_shape(&self, id: &str) -> BoxFuture<'_, RemoteResult<()>>;

    /// Start a change feed. The first batch carries every existing document.
    fn subscribe_shapes(&self) -> BoxFuture<'_, RemoteResult<ShapeFeed>>;

    /// Overwrite the snapshot document.
    fn write_snapshot(&self, snapshot: SnapshotDocument) -> BoxFuture<'_, RemoteResult<()>>;

    /// Read the snapshot document, if one was ever written.
    fn read_snapshot(&self) -> BoxFuture<'_, RemoteResult<Option<SnapshotDocument>>>;
}

/// The shared presence collection.
pub trait PresenceCollection: Send + Sync {
    /// Upsert a presence record; the remote side stamps `last_seen`.
    fn heartbeat(&self, record: PresenceRecord) -> BoxFuture<'_, RemoteResult<()>>;

    /// Remove a client's record.
    fn leave(&self, client_id: &str) -> BoxFuture<'_, RemoteResult<()>>;

    /// Start a presence feed. The first item is the current set.
    fn subscribe_presence(&self) -> BoxFuture<'_, RemoteResult<PresenceFeed>>;
}

/// A complete remote room: shapes, snapshot, and presence.
pub trait RemoteRoom: ShapeCollection + PresenceCollection {}

impl<T: ShapeCollection + PresenceCollection + ?Sized> RemoteRoom for T {}
