//! In-memory remote room.

use super::convert::{merge_fields, KEY_UPDATED_AT};
use super::{
    BoxFuture, ChangeKind, DocFields, FeedBatch, PresenceCollection, PresenceFeed, ShapeChange, ShapeCollection,
    ShapeFeed, SnapshotDocument,
};
use crate::clock::SharedClock;
use crate::error::{RemoteError, RemoteResult};
use crate::presence::PresenceRecord;
use crate::shapes::{ClientId, ShapeId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::mpsc;

#[derive(Default)]
struct RoomState {
    shapes: HashMap<ShapeId, DocFields>,
    /// Creation order, so initial batches are deterministic.
    order: Vec<ShapeId>,
    presence: HashMap<ClientId, PresenceRecord>,
    snapshot: Option<SnapshotDocument>,
    shape_subscribers: Vec<mpsc::UnboundedSender<FeedBatch>>,
    presence_subscribers: Vec<mpsc::UnboundedSender<Vec<PresenceRecord>>>,
}

impl RoomState {
    fn upsert(&mut self, id: ShapeId, fields: DocFields, now: u64) -> ShapeChange {
        let kind = if self.shapes.contains_key(&id) {
            ChangeKind::Modified
        } else {
            self.order.push(id.clone());
            ChangeKind::Added
        };
        let stored = self.shapes.entry(id.clone()).or_default();
        merge_fields(stored, fields);
        stored.insert(KEY_UPDATED_AT.into(), now.into());
        ShapeChange {
            id,
            kind,
            fields: stored.clone(),
        }
    }

    fn publish_shapes(&mut self, batch: FeedBatch) {
        self.shape_subscribers.retain(|tx| tx.send(batch.clone()).is_ok());
    }

    fn presence_list(&self) -> Vec<PresenceRecord> {
        let mut records: Vec<PresenceRecord> = self.presence.values().cloned().collect();
        records.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        records
    }

    fn publish_presence(&mut self) {
        let records = self.presence_list();
        self.presence_subscribers.retain(|tx| tx.send(records.clone()).is_ok());
    }
}

/// A remote room kept entirely in memory.
///
/// Serves as the backing store of the relay server and as the remote side in
/// tests. Timestamps come from the injected clock, standing in for server
/// time.
pub struct MemoryRoom {
    clock: SharedClock,
    state: RwLock<RoomState>,
    fail_writes: AtomicU32,
}

impl MemoryRoom {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            clock,
            state: RwLock::new(RoomState::default()),
            fail_writes: AtomicU32::new(0),
        }
    }

    /// Make the next `count` shape writes fail with a transport error.
    pub fn fail_next_writes(&self, count: u32) {
        self.fail_writes.store(count, Ordering::SeqCst);
    }

    /// Current stored fields of a shape.
    pub fn shape(&self, id: &str) -> Option<DocFields> {
        self.read().ok()?.shapes.get(id).cloned()
    }

    pub fn shape_count(&self) -> usize {
        self.read().map(|s| s.shapes.len()).unwrap_or(0)
    }

    pub fn presence_records(&self) -> Vec<PresenceRecord> {
        self.read().map(|s| s.presence_list()).unwrap_or_default()
    }

    /// Number of live shape subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.read().map(|s| s.shape_subscribers.len()).unwrap_or(0)
    }

    fn read(&self) -> RemoteResult<RwLockReadGuard<'_, RoomState>> {
        self.state
            .read()
            .map_err(|e| RemoteError::Transport(format!("Lock error: {}", e)))
    }

    fn write(&self) -> RemoteResult<RwLockWriteGuard<'_, RoomState>> {
        self.state
            .write()
            .map_err(|e| RemoteError::Transport(format!("Lock error: {}", e)))
    }

    fn check_injected_failure(&self) -> RemoteResult<()> {
        let injected = self
            .fail_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match injected {
            Ok(_) => Err(RemoteError::Transport("injected write failure".to_string())),
            Err(_) => Ok(()),
        }
    }
}

impl ShapeCollection for MemoryRoom {
    fn set_shape(&self, id: &str, fields: DocFields) -> BoxFuture<'_, RemoteResult<()>> {
        let id = id.to_string();
        Box::pin(async move {
            self.check_injected_failure()?;
            let now = self.clock.now_millis();
            let mut state = self.write()?;
            let change = state.upsert(id, fields, now);
            state.publish_shapes(FeedBatch {
                initial: false,
                changes: vec![change],
            });
            Ok(())
        })
    }

    fn set_shapes(&self, docs: Vec<(ShapeId, DocFields)>) -> BoxFuture<'_, RemoteResult<()>> {
        Box::pin(async move {
            self.check_injected_failure()?;
            let now = self.clock.now_millis();
            let mut state = self.write()?;
            let changes: Vec<ShapeChange> = docs
                .into_iter()
                .map(|(id, fields)| state.upsert(id, fields, now))
                .collect();
            if !changes.is_empty() {
                state.publish_shapes(FeedBatch {
                    initial: false,
                    changes,
                });
            }
            Ok(())
        })
    }

    fn delete_shape(&self, id: &str) -> BoxFuture<'_, RemoteResult<()>> {
        let id = id.to_string();
        Box::pin(async move {
            self.check_injected_failure()?;
            let mut state = self.write()?;
            if state.shapes.remove(&id).is_some() {
                state.order.retain(|existing| *existing != id);
                state.publish_shapes(FeedBatch {
                    initial: false,
                    changes: vec![ShapeChange {
                        id,
                        kind: ChangeKind::Removed,
                        fields: DocFields::new(),
                    }],
                });
            }
            Ok(())
        })
    }

    fn subscribe_shapes(&self) -> BoxFuture<'_, RemoteResult<ShapeFeed>> {
        Box::pin(async move {
            let (tx, rx) = mpsc::unbounded_channel();
            let mut state = self.write()?;
            let changes = state
                .order
                .iter()
                .filter_map(|id| {
                    state.shapes.get(id).map(|fields| ShapeChange {
                        id: id.clone(),
                        kind: ChangeKind::Added,
                        fields: fields.clone(),
                    })
                })
                .collect();
            tx.send(FeedBatch {
                initial: true,
                changes,
            })
            .map_err(|_| RemoteError::Disconnected)?;
            state.shape_subscribers.push(tx);
            Ok(rx)
        })
    }

    fn write_snapshot(&self, snapshot: SnapshotDocument) -> BoxFuture<'_, RemoteResult<()>> {
        Box::pin(async move {
            self.write()?.snapshot = Some(snapshot);
            Ok(())
        })
    }

    fn read_snapshot(&self) -> BoxFuture<'_, RemoteResult<Option<SnapshotDocument>>> {
        Box::pin(async move { Ok(self.read()?.snapshot.clone()) })
    }
}

impl PresenceCollection for MemoryRoom {
    fn heartbeat(&self, mut record: PresenceRecord) -> BoxFuture<'_, RemoteResult<()>> {
        Box::pin(async move {
            record.last_seen_at_millis = self.clock.now_millis();
            let mut state = self.write()?;
            state.presence.insert(record.client_id.clone(), record);
            state.publish_presence();
            Ok(())
        })
    }

    fn leave(&self, client_id: &str) -> BoxFuture<'_, RemoteResult<()>> {
        let client_id = client_id.to_string();
        Box::pin(async move {
            let mut state = self.write()?;
            if state.presence.remove(&client_id).is_some() {
                state.publish_presence();
            }
            Ok(())
        })
    }

    fn subscribe_presence(&self) -> BoxFuture<'_, RemoteResult<PresenceFeed>> {
        Box::pin(async move {
            let (tx, rx) = mpsc::unbounded_channel();
            let mut state = self.write()?;
            tx.send(state.presence_list())
                .map_err(|_| RemoteError::Disconnected)?;
            state.presence_subscribers.push(tx);
            Ok(rx)
        })
    }
}
