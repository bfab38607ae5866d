//! Per-client collaboration session.
//!
//! [`CanvasSession`] owns the local document together with the lock manager,
//! write scheduler, presence registry, and feed listener, and exposes the
//! intents a user (or anything acting for one) can issue. It is synchronous
//! and never awaits: everything bound for the remote room is queued as a
//! [`RemoteOp`] and drained with [`CanvasSession::take_outgoing`].
//! [`SessionDriver`] is the async loop that owns a session in production.

mod driver;

pub use driver::{Intent, SessionDriver, SessionEvent, SessionHandle};

use crate::canvas::CanvasDocument;
use crate::clock::SharedClock;
use crate::config::SyncConfig;
use crate::error::{LockError, RemoteResult};
use crate::feed::{ChangeFeedListener, FeedReport};
use crate::ids::IdGenerator;
use crate::layering::{self, ReorderDirection, ZAssignment};
use crate::layout;
use crate::lock::LockManager;
use crate::presence::{AvatarState, PresencePublisher, PresenceRecord, PresenceRegistry, PresenceUpdate};
use crate::remote::{write_to_fields, FeedBatch, RemoteRoom, SnapshotDocument};
use crate::scheduler::{OutboundWrite, ShapeWrite, SignificanceFilter, WriteScheduler};
use crate::shapes::{ClientId, LockDescriptor, Shape, ShapeId, ShapeKind, ShapePatch};
use kurbo::{Point, Vec2};
use std::sync::Arc;

/// One operation against the remote room.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteOp {
    Write(OutboundWrite),
    Heartbeat(PresenceRecord),
    Leave(ClientId),
    Snapshot(SnapshotDocument),
}

impl RemoteOp {
    /// Short description for logs and failure events.
    pub fn describe(&self) -> String {
        match self {
            RemoteOp::Write(OutboundWrite::Set(w)) => format!("write {}", w.id()),
            RemoteOp::Write(OutboundWrite::Batch(ws)) => format!("batch of {}", ws.len()),
            RemoteOp::Write(OutboundWrite::Delete(id)) => format!("delete {}", id),
            RemoteOp::Heartbeat(r) => format!("heartbeat {}", r.client_id),
            RemoteOp::Leave(id) => format!("leave {}", id),
            RemoteOp::Snapshot(_) => "snapshot".to_string(),
        }
    }

    /// Carry the operation out against `room`.
    pub async fn perform<R: RemoteRoom + ?Sized>(&self, room: &R) -> RemoteResult<()> {
        match self {
            RemoteOp::Write(OutboundWrite::Set(write)) => room.set_shape(write.id(), write_to_fields(write)).await,
            RemoteOp::Write(OutboundWrite::Batch(writes)) => {
                let docs = writes
                    .iter()
                    .map(|w| (w.id().to_string(), write_to_fields(w)))
                    .collect();
                room.set_shapes(docs).await
            }
            RemoteOp::Write(OutboundWrite::Delete(id)) => room.delete_shape(id).await,
            RemoteOp::Heartbeat(record) => room.heartbeat(record.clone()).await,
            RemoteOp::Leave(client_id) => room.leave(client_id).await,
            RemoteOp::Snapshot(snapshot) => room.write_snapshot(snapshot.clone()).await,
        }
    }
}

/// The collaboration engine for one client.
pub struct CanvasSession {
    config: SyncConfig,
    clock: SharedClock,
    ids: Arc<dyn IdGenerator>,
    doc: CanvasDocument,
    locks: LockManager,
    scheduler: WriteScheduler,
    presence: PresenceRegistry,
    publisher: PresencePublisher,
    /// Cursor and avatar as last published, carried on heartbeats.
    published: PresenceUpdate,
    feed: ChangeFeedListener,
    /// Lock sweeps wait for the first presence snapshot; before it every
    /// remote owner would look absent.
    presence_seen: bool,
    outgoing: Vec<RemoteOp>,
}

impl CanvasSession {
    pub fn new(local: LockDescriptor, config: SyncConfig, clock: SharedClock, ids: Arc<dyn IdGenerator>) -> Self {
        let presence = PresenceRegistry::new(local.user_id.clone(), clock.clone(), config.presence.clone());
        let publisher = PresencePublisher::from_config(&config.presence);
        Self {
            scheduler: WriteScheduler::new(clock.clone()),
            locks: LockManager::new(local),
            doc: CanvasDocument::new(),
            feed: ChangeFeedListener::new(),
            published: PresenceUpdate::default(),
            presence_seen: false,
            outgoing: Vec::new(),
            presence,
            publisher,
            config,
            clock,
            ids,
        }
    }

    pub fn document(&self) -> &CanvasDocument {
        &self.doc
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn presence(&self) -> &PresenceRegistry {
        &self.presence
    }

    pub fn scheduler(&self) -> &WriteScheduler {
        &self.scheduler
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn local_client(&self) -> &str {
        self.locks.local_client()
    }

    pub fn now_millis(&self) -> u64 {
        self.clock.now_millis()
    }

    /// Whether the initial shape batch has been applied.
    pub fn is_ready(&self) -> bool {
        self.feed.is_ready()
    }

    pub fn ready_signal(&self) -> tokio::sync::watch::Receiver<bool> {
        self.feed.ready_signal()
    }

    fn check_editable(&self, id: &str) -> Result<(), LockError> {
        let Some(shape) = self.doc.get(id) else {
            return Err(LockError::NotFound(id.to_string()));
        };
        if self.locks.is_locked_by_other(&self.doc, id, self.local_client()) {
            if let Some(owner) = &shape.selected_by {
                return Err(LockError::HeldBy {
                    shape_id: id.to_string(),
                    owner: owner.clone(),
                });
            }
        }
        Ok(())
    }

    fn top_z(&self) -> f64 {
        self.doc.max_z().map_or(0.0, |z| z + 1.0)
    }

    // --- Intents ---

    /// Create a shape of `kind` on top of everything else.
    pub fn create_shape(&mut self, kind: ShapeKind, attrs: ShapePatch) -> ShapeId {
        let mut shape = Shape::new(kind, Point::ZERO);
        shape.apply_patch(&attrs.clone().without_lock());
        if attrs.z_index.is_none() {
            shape.z_index = self.top_z();
        }
        let id = self.doc.add(shape, self.ids.as_ref());
        if let Some(shape) = self.doc.get(&id) {
            log::debug!("Created {} {}", shape.kind().as_str(), id);
            self.scheduler.write_now(ShapeWrite::with_lock(shape.clone()));
        }
        id
    }

    /// Apply a local edit.
    ///
    /// During a gesture the result streams out throttled; otherwise it is
    /// debounced. The lock field is not touched here; use selection for that.
    pub fn update_shape(&mut self, id: &str, patch: ShapePatch) -> Result<(), LockError> {
        self.check_editable(id)?;
        let patch = patch.without_lock();
        if patch.is_empty() {
            return Ok(());
        }
        self.doc.update(id, &patch);
        let Some(shape) = self.doc.get(id).cloned() else {
            return Ok(());
        };
        let write = ShapeWrite::content(shape);
        if self.locks.is_editing(id) {
            self.scheduler.write_throttled(write, self.config.writes.drag_throttle_ms);
        } else {
            let filter = SignificanceFilter::new(self.config.writes.significance_epsilon);
            self.scheduler.write_debounced(write, self.config.writes.debounce_ms, filter);
        }
        Ok(())
    }

    pub fn remove_shape(&mut self, id: &str) -> Result<(), LockError> {
        self.check_editable(id)?;
        self.locks.forget(id);
        self.doc.remove(id);
        self.scheduler.delete(id);
        Ok(())
    }

    /// Change the layering of `ids`. Shapes held by other clients are left
    /// where they are.
    pub fn reorder(&mut self, ids: &[ShapeId], direction: ReorderDirection) -> Vec<ZAssignment> {
        let movable: Vec<ShapeId> = ids
            .iter()
            .filter(|id| !self.locks.is_locked_by_other(&self.doc, id, self.local_client()))
            .cloned()
            .collect();
        let assignments = self.doc.reorder(&movable, direction);
        self.write_z(&assignments);
        assignments
    }

    fn write_z(&mut self, assignments: &[ZAssignment]) {
        let writes = assignments
            .iter()
            .filter_map(|(id, _)| self.doc.get(id))
            .map(|s| ShapeWrite::content(s.clone()))
            .collect();
        self.scheduler.write_batch(writes);
    }

    /// Make `ids` the local selection, releasing anything else held.
    ///
    /// Returns the claims that were refused.
    pub fn select_shapes(&mut self, ids: &[ShapeId]) -> Vec<LockError> {
        let stale: Vec<ShapeId> = self
            .locks
            .selection()
            .filter(|held| !ids.contains(held))
            .cloned()
            .collect();
        let local = self.local_client().to_string();
        for id in stale {
            self.locks.release(&mut self.doc, &mut self.scheduler, &id, &local);
        }

        let mut refused = Vec::new();
        for id in ids {
            if self.locks.holds(id) {
                continue;
            }
            if let Err(e) = self.locks.claim_local(&mut self.doc, &mut self.scheduler, id) {
                log::warn!("Selection refused: {}", e);
                refused.push(e);
            }
        }
        refused
    }

    pub fn deselect_all(&mut self) -> Vec<ShapeId> {
        self.locks.release_all(&mut self.doc, &mut self.scheduler)
    }

    /// Start a drag/resize/text gesture on a shape, selecting it if needed.
    pub fn begin_edit(&mut self, id: &str) -> Result<(), LockError> {
        if !self.locks.holds(id) {
            self.locks.claim_local(&mut self.doc, &mut self.scheduler, id)?;
        }
        self.locks.begin_edit(&self.doc, id)
    }

    /// Finish a gesture. The final state is written at once if the local
    /// client may still commit it; otherwise pending writes are dropped.
    pub fn end_edit(&mut self, id: &str) -> bool {
        if !self.locks.end_edit(&self.doc, id) {
            self.scheduler.cancel(id);
            return false;
        }
        if let Some(shape) = self.doc.get(id) {
            self.scheduler.write_now(ShapeWrite::content(shape.clone()));
        }
        true
    }

    /// Copy shapes, offset and unlocked, on top of the stack.
    pub fn duplicate(&mut self, ids: &[ShapeId]) -> Vec<ShapeId> {
        let mut sources: Vec<Shape> = ids.iter().filter_map(|id| self.doc.get(id)).cloned().collect();
        sources.sort_by(|a, b| a.z_index.total_cmp(&b.z_index).then_with(|| a.id.cmp(&b.id)));

        let offset = Vec2::new(self.config.duplicate_offset, self.config.duplicate_offset);
        let mut z = self.top_z();
        let mut created = Vec::with_capacity(sources.len());
        let mut writes = Vec::with_capacity(sources.len());
        for mut shape in sources {
            shape.id = ShapeId::new();
            shape.position += offset;
            shape.selected_by = None;
            shape.z_index = z;
            z += 1.0;
            let id = self.doc.add(shape, self.ids.as_ref());
            if let Some(copy) = self.doc.get(&id) {
                writes.push(ShapeWrite::content(copy.clone()));
            }
            created.push(id);
        }
        self.scheduler.write_batch(writes);
        created
    }

    /// Arrange shapes in a grid. Returns the shapes that moved.
    pub fn auto_layout(&mut self, ids: &[ShapeId]) -> Vec<ShapeId> {
        let local = self.local_client();
        let shapes: Vec<&Shape> = ids
            .iter()
            .filter(|id| !self.locks.is_locked_by_other(&self.doc, id, local))
            .filter_map(|id| self.doc.get(id))
            .collect();
        if shapes.len() < 2 {
            return Vec::new();
        }
        let placements = layout::auto_layout(&shapes);

        let mut writes = Vec::with_capacity(placements.len());
        for (id, position) in &placements {
            self.doc.update(id, &ShapePatch::moved_to(position.x, position.y));
            if let Some(shape) = self.doc.get(id) {
                writes.push(ShapeWrite::content(shape.clone()));
            }
        }
        self.scheduler.write_batch(writes);
        placements.into_iter().map(|(id, _)| id).collect()
    }

    pub fn move_cursor(&mut self, point: Point) {
        let local = self.local_client().to_string();
        self.presence.set_cursor(&local, Some(point));
        let now = self.clock.now_millis();
        if let Some(update) = self.publisher.offer_cursor(now, point) {
            self.publish(update);
        }
    }

    pub fn publish_avatar(&mut self, avatar: AvatarState) {
        let now = self.clock.now_millis();
        if let Some(update) = self.publisher.offer_avatar(now, avatar) {
            self.publish(update);
        }
    }

    /// Publish cursor/avatar values that were held back by the rate limit.
    pub fn flush_presence(&mut self) {
        let now = self.clock.now_millis();
        if let Some(update) = self.publisher.flush(now) {
            self.publish(update);
        }
    }

    fn publish(&mut self, update: PresenceUpdate) {
        self.published = update;
        self.heartbeat();
    }

    /// Refresh the local presence record.
    pub fn heartbeat(&mut self) {
        let local = self.locks.local().clone();
        let mut record = self
            .presence
            .heartbeat(&local.user_id, &local.display_name, &local.color)
            .clone();
        record.cursor = self.published.cursor;
        record.avatar = self.published.avatar.clone();
        self.outgoing.push(RemoteOp::Heartbeat(record));
    }

    /// The page is no longer visible: save a snapshot.
    pub fn hidden(&mut self) {
        self.queue_snapshot();
    }

    /// Graceful exit: release locks, save a snapshot, and leave presence.
    pub fn leave(&mut self) {
        let released = self.deselect_all();
        log::info!("Leaving, released {} locks", released.len());
        self.queue_snapshot();
        let local = self.local_client().to_string();
        self.presence.remove(&local);
        self.outgoing.push(RemoteOp::Leave(local));
    }

    // --- Remote input and housekeeping ---

    pub fn apply_feed(&mut self, batch: FeedBatch) -> FeedReport {
        let report = self.feed.apply(batch, &mut self.doc, &mut self.locks, &mut self.scheduler);
        if !report.is_empty() {
            log::debug!("Feed batch applied: {:?}", report);
        }
        report
    }

    pub fn apply_presence(&mut self, records: Vec<PresenceRecord>) {
        self.presence.apply_remote(records);
        self.presence_seen = true;
        self.locks.observe_active_clients(self.presence.roster_ids());
    }

    /// Expire stale presence and clear locks held by clients who left.
    pub fn reconcile_locks(&mut self) -> Vec<ShapeId> {
        if !self.presence_seen {
            return Vec::new();
        }
        let expired = self.presence.expire(self.config.presence.roster_ttl_ms);
        if !expired.is_empty() {
            log::info!("Presence expired for {:?}", expired);
        }
        let active = self.presence.roster_ids();
        self.locks.reconcile_against_presence(&mut self.doc, &mut self.scheduler, &active)
    }

    /// Fire due timers. Also renormalizes z values when they have become too
    /// dense and nothing is in flight.
    pub fn tick(&mut self) -> usize {
        let fired = self.scheduler.tick();
        if self.renormalize_due() {
            let assignments = layering::renormalize(&self.doc);
            log::info!("Renormalizing {} z values", assignments.len());
            self.doc.apply_z(&assignments);
            self.write_z(&assignments);
        }
        fired
    }

    /// No gesture, no lock held by anyone, and no write waiting.
    fn is_quiet(&self) -> bool {
        !self.locks.is_editing_any()
            && !self.scheduler.has_pending()
            && self.doc.shapes().all(|s| s.selected_by.is_none())
    }

    fn renormalize_due(&self) -> bool {
        self.is_quiet() && layering::needs_renormalize(&self.doc, self.config.min_layer_gap)
    }

    /// When [`tick`](Self::tick) next has work to do. A due renormalization
    /// makes that right away.
    pub fn next_deadline(&self) -> Option<u64> {
        let timers = self.scheduler.next_deadline();
        if self.renormalize_due() {
            let now = self.clock.now_millis();
            return Some(timers.map_or(now, |due| due.min(now)));
        }
        timers
    }

    pub fn snapshot(&self) -> SnapshotDocument {
        SnapshotDocument::capture(&self.doc, self.clock.now_millis())
    }

    pub fn queue_snapshot(&mut self) {
        let snapshot = self.snapshot();
        self.outgoing.push(RemoteOp::Snapshot(snapshot));
    }

    /// Seed the document from a saved snapshot. Only applies while the live
    /// feed has not delivered any shape; returns whether it was applied.
    pub fn hydrate_from_snapshot(&mut self, snapshot: &SnapshotDocument) -> bool {
        if self.feed.has_delivered_shapes() || snapshot.is_empty() {
            return false;
        }
        let restored = snapshot.restore();
        let mut added = 0;
        for shape in restored.shapes() {
            if !self.doc.contains(&shape.id) {
                self.doc.insert(shape.clone());
                added += 1;
            }
        }
        log::info!("Hydrated {} shapes from snapshot", added);
        true
    }

    /// Take everything queued for the remote room, in order.
    pub fn take_outgoing(&mut self) -> Vec<RemoteOp> {
        let mut ops: Vec<RemoteOp> = self
            .scheduler
            .take_outgoing()
            .into_iter()
            .map(RemoteOp::Write)
            .collect();
        ops.append(&mut self.outgoing);
        ops
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::ids::SequentialIds;
    use crate::remote::{
        shape_to_fields, ChangeKind, MemoryRoom, PresenceCollection, ShapeChange, ShapeCollection, ShapeFeed,
    };
    use crate::scheduler::LockField;

    fn session(name: &str, clock: &Arc<ManualClock>) -> CanvasSession {
        CanvasSession::new(
            LockDescriptor::new(name, "#ff0000", name.to_uppercase()),
            SyncConfig::default(),
            clock.clone(),
            Arc::new(SequentialIds::new(name)),
        )
    }

    async fn push(session: &mut CanvasSession, room: &MemoryRoom) {
        for op in session.take_outgoing() {
            op.perform(room).await.unwrap();
        }
    }

    fn pull(session: &mut CanvasSession, feed: &mut ShapeFeed) {
        while let Ok(batch) = feed.try_recv() {
            session.apply_feed(batch);
        }
    }

    fn rect_attrs(x: f64, y: f64) -> ShapePatch {
        ShapePatch {
            width: Some(Some(100.0)),
            height: Some(Some(50.0)),
            ..ShapePatch::moved_to(x, y)
        }
    }

    #[test]
    fn test_create_stacks_on_top() {
        let clock = ManualClock::shared(0);
        let mut a = session("a", &clock);
        let first = a.create_shape(ShapeKind::Rectangle, rect_attrs(0.0, 0.0));
        let second = a.create_shape(ShapeKind::Circle, ShapePatch::default());
        assert_eq!(first, "a-1");
        assert_eq!(a.document().get(&first).map(|s| s.z_index), Some(0.0));
        assert_eq!(a.document().get(&second).map(|s| s.z_index), Some(1.0));
        assert_eq!(a.take_outgoing().len(), 2);
    }

    #[test]
    fn test_update_is_debounced_outside_gesture_and_throttled_inside() {
        let clock = ManualClock::shared(0);
        let mut a = session("a", &clock);
        let id = a.create_shape(ShapeKind::Rectangle, rect_attrs(0.0, 0.0));
        a.take_outgoing();

        a.update_shape(&id, ShapePatch::moved_to(5.0, 5.0)).unwrap();
        assert!(a.take_outgoing().is_empty());
        clock.advance(30);
        a.tick();
        assert_eq!(a.take_outgoing().len(), 1);

        a.begin_edit(&id).unwrap();
        a.take_outgoing();
        clock.advance(100);
        a.update_shape(&id, ShapePatch::moved_to(6.0, 6.0)).unwrap();
        a.update_shape(&id, ShapePatch::moved_to(7.0, 7.0)).unwrap();
        // Leading edge only; the second call is held as the trailing write.
        assert_eq!(a.take_outgoing().len(), 1);
        assert!(a.end_edit(&id));
        let ops = a.take_outgoing();
        assert_eq!(ops.len(), 1);
        match &ops[0] {
            RemoteOp::Write(OutboundWrite::Set(w)) => assert_eq!(w.shape.position, Point::new(7.0, 7.0)),
            other => panic!("unexpected op {:?}", other),
        }
        assert!(!a.scheduler().has_pending());
    }

    #[test]
    fn test_lock_only_update_writes_nothing() {
        let clock = ManualClock::shared(0);
        let mut a = session("a", &clock);
        let id = a.create_shape(ShapeKind::Circle, ShapePatch::default());
        a.take_outgoing();
        let patch = ShapePatch {
            selected_by: Some(Some(LockDescriptor::new("z", "#000", "Z"))),
            ..ShapePatch::default()
        };
        assert_eq!(a.update_shape(&id, patch), Ok(()));
        clock.advance(1_000);
        a.tick();
        assert!(a.take_outgoing().is_empty());
        assert_eq!(a.document().get(&id).and_then(|s| s.owner()), None);
    }

    #[test]
    fn test_takeover_during_gesture_drops_trailing_write() {
        let clock = ManualClock::shared(1_000);
        let mut a = session("a", &clock);
        let id = a.create_shape(ShapeKind::Rectangle, rect_attrs(0.0, 0.0));
        a.begin_edit(&id).unwrap();
        clock.advance(100);
        a.update_shape(&id, ShapePatch::moved_to(5.0, 5.0)).unwrap();
        a.update_shape(&id, ShapePatch::moved_to(6.0, 6.0)).unwrap();
        a.take_outgoing();
        assert!(a.scheduler().has_pending_for(&id));

        let mut theirs = a.document().get(&id).cloned().unwrap();
        theirs.position = Point::new(300.0, 300.0);
        theirs.selected_by = Some(LockDescriptor::new("b", "#0000ff", "B"));
        let report = a.apply_feed(FeedBatch {
            initial: false,
            changes: vec![ShapeChange {
                id: id.clone(),
                kind: ChangeKind::Modified,
                fields: shape_to_fields(&theirs, LockField::Assert),
            }],
        });
        assert_eq!(report.taken_over, vec![id.clone()]);
        assert!(!a.locks().holds(&id));

        clock.advance(100);
        a.tick();
        assert!(a.take_outgoing().is_empty());
        assert!(!a.end_edit(&id));
        assert!(a.take_outgoing().is_empty());
        assert_eq!(a.document().get(&id).map(|s| s.position), Some(Point::new(300.0, 300.0)));
    }

    #[tokio::test]
    async fn test_two_clients_lock_handoff() {
        let clock = ManualClock::shared(1_000);
        let room = MemoryRoom::new(clock.clone());
        let mut a = session("a", &clock);
        let mut b = session("b", &clock);
        let mut feed_a = room.subscribe_shapes().await.unwrap();
        let mut feed_b = room.subscribe_shapes().await.unwrap();
        pull(&mut a, &mut feed_a);
        pull(&mut b, &mut feed_b);
        assert!(a.is_ready() && b.is_ready());

        let r = a.create_shape(ShapeKind::Rectangle, rect_attrs(10.0, 10.0));
        push(&mut a, &room).await;
        pull(&mut b, &mut feed_b);
        assert_eq!(b.document().get(&r).map(|s| s.position), Some(Point::new(10.0, 10.0)));

        assert!(b.select_shapes(&[r.clone()]).is_empty());
        push(&mut b, &room).await;
        pull(&mut a, &mut feed_a);

        let seen_by_a = a.document().get(&r).unwrap();
        assert_eq!(seen_by_a.position, Point::new(10.0, 10.0));
        assert_eq!(seen_by_a.owner(), Some("b"));
        assert!(a.update_shape(&r, ShapePatch::moved_to(0.0, 0.0)).is_err());
        assert!(matches!(a.select_shapes(&[r.clone()])[..], [LockError::HeldBy { .. }]));
    }

    #[tokio::test]
    async fn test_departed_owner_loses_lock_within_one_sweep() {
        let clock = ManualClock::shared(1_000);
        let room = MemoryRoom::new(clock.clone());
        let mut a = session("a", &clock);
        let mut b = session("b", &clock);
        let mut feed_a = room.subscribe_shapes().await.unwrap();
        let mut presence_a = room.subscribe_presence().await.unwrap();

        let r = b.create_shape(ShapeKind::Rectangle, rect_attrs(0.0, 0.0));
        b.select_shapes(&[r.clone()]);
        a.heartbeat();
        b.heartbeat();
        push(&mut a, &room).await;
        push(&mut b, &room).await;
        pull(&mut a, &mut feed_a);
        while let Ok(records) = presence_a.try_recv() {
            a.apply_presence(records);
        }
        assert!(a.reconcile_locks().is_empty());
        assert_eq!(a.document().get(&r).and_then(|s| s.owner()), Some("b"));

        // b vanishes without leaving; a keeps heartbeating.
        clock.advance(61_000);
        a.heartbeat();
        push(&mut a, &room).await;
        while let Ok(records) = presence_a.try_recv() {
            a.apply_presence(records);
        }
        assert_eq!(a.reconcile_locks(), vec![r.clone()]);
        assert_eq!(a.document().get(&r).and_then(|s| s.owner()), None);
        push(&mut a, &room).await;
        assert_eq!(room.shape(&r).and_then(|f| f.get("selectedBy").cloned()), Some(serde_json::Value::Null));
    }

    #[test]
    fn test_sweep_waits_for_presence() {
        let clock = ManualClock::shared(0);
        let mut a = session("a", &clock);
        let mut shape = Shape::rectangle(Point::ZERO, 1.0, 1.0).with_id("x");
        shape.selected_by = Some(LockDescriptor::new("z", "#000", "Z"));
        a.apply_feed(FeedBatch {
            initial: true,
            changes: vec![crate::remote::ShapeChange {
                id: "x".into(),
                kind: crate::remote::ChangeKind::Added,
                fields: crate::remote::shape_to_fields(&shape, crate::scheduler::LockField::Assert),
            }],
        });
        assert!(a.reconcile_locks().is_empty());
        a.apply_presence(vec![]);
        assert_eq!(a.reconcile_locks(), vec!["x".to_string()]);
    }

    #[test]
    fn test_duplicate_and_layout() {
        let clock = ManualClock::shared(0);
        let mut a = session("a", &clock);
        let one = a.create_shape(ShapeKind::Rectangle, rect_attrs(0.0, 0.0));
        let two = a.create_shape(ShapeKind::Rectangle, rect_attrs(300.0, 0.0));
        a.select_shapes(&[one.clone()]);
        a.take_outgoing();

        let copies = a.duplicate(&[one.clone(), two.clone()]);
        assert_eq!(copies.len(), 2);
        let copy = a.document().get(&copies[0]).unwrap();
        assert_eq!(copy.position, Point::new(16.0, 16.0));
        assert!(copy.selected_by.is_none());
        assert_eq!(copy.z_index, 2.0);
        assert!(matches!(&a.take_outgoing()[..], [RemoteOp::Write(OutboundWrite::Batch(ws))] if ws.len() == 2));

        let moved = a.auto_layout(&[one.clone(), two.clone()]);
        assert_eq!(moved, vec![one, two]);
        assert_eq!(a.take_outgoing().len(), 1);
        assert!(a.auto_layout(&copies[..1]).is_empty());
    }

    #[test]
    fn test_reorder_writes_one_batch() {
        let clock = ManualClock::shared(0);
        let mut a = session("a", &clock);
        let ids: Vec<ShapeId> = (0..3)
            .map(|_| a.create_shape(ShapeKind::Rectangle, ShapePatch::default()))
            .collect();
        a.take_outgoing();
        let assignments = a.reorder(&ids[2..], ReorderDirection::Backward);
        assert_eq!(assignments, vec![(ids[2].clone(), 0.5)]);
        assert!(matches!(&a.take_outgoing()[..], [RemoteOp::Write(OutboundWrite::Batch(ws))] if ws.len() == 1));
    }

    #[test]
    fn test_tick_renormalizes_when_idle() {
        let clock = ManualClock::shared(0);
        let mut a = session("a", &clock);
        let ids: Vec<ShapeId> = (0..3)
            .map(|_| a.create_shape(ShapeKind::Rectangle, ShapePatch::default()))
            .collect();
        // Alternately sinking the top two shapes halves the lowest gap each time.
        for i in 0..12 {
            let id = if i % 2 == 0 { &ids[2] } else { &ids[1] };
            a.reorder(std::slice::from_ref(id), ReorderDirection::Backward);
        }
        assert!(layering::needs_renormalize(a.document(), a.config().min_layer_gap));
        a.take_outgoing();
        assert_eq!(a.next_deadline(), Some(a.now_millis()));
        a.tick();
        assert_eq!(a.next_deadline(), None);
        assert!(matches!(&a.take_outgoing()[..], [RemoteOp::Write(OutboundWrite::Batch(_))]));
        let mut zs: Vec<f64> = a.document().shapes_ordered().map(|s| s.z_index).collect();
        zs.dedup();
        assert!(!layering::needs_renormalize(a.document(), a.config().min_layer_gap));
        assert_eq!(zs.len(), 3);
    }

    #[tokio::test]
    async fn test_snapshot_hydrates_only_an_empty_feed() {
        let clock = ManualClock::shared(0);
        let room = MemoryRoom::new(clock.clone());
        let mut a = session("a", &clock);
        let r = a.create_shape(ShapeKind::Circle, ShapePatch::default());
        a.hidden();
        push(&mut a, &room).await;
        let snapshot = room.read_snapshot().await.unwrap().unwrap();

        let mut fresh = session("c", &clock);
        fresh.apply_feed(FeedBatch {
            initial: true,
            changes: vec![],
        });
        assert!(fresh.hydrate_from_snapshot(&snapshot));
        assert!(fresh.document().contains(&r));

        let mut late = session("d", &clock);
        let mut feed = room.subscribe_shapes().await.unwrap();
        pull(&mut late, &mut feed);
        assert!(!late.hydrate_from_snapshot(&snapshot));
    }

    #[tokio::test]
    async fn test_leave_releases_and_removes_presence() {
        let clock = ManualClock::shared(0);
        let room = MemoryRoom::new(clock.clone());
        let mut a = session("a", &clock);
        let r = a.create_shape(ShapeKind::Rectangle, ShapePatch::default());
        a.select_shapes(&[r.clone()]);
        a.heartbeat();
        push(&mut a, &room).await;
        assert_eq!(room.presence_records().len(), 1);

        a.leave();
        push(&mut a, &room).await;
        assert!(room.presence_records().is_empty());
        assert_eq!(room.shape(&r).and_then(|f| f.get("selectedBy").cloned()), Some(serde_json::Value::Null));
        assert!(room.read_snapshot().await.unwrap().is_some());
    }

    #[test]
    fn test_cursor_publication_is_rate_limited() {
        let clock = ManualClock::shared(0);
        let mut a = session("a", &clock);
        a.move_cursor(Point::new(1.0, 1.0));
        a.move_cursor(Point::new(2.0, 2.0));
        assert_eq!(a.take_outgoing().len(), 1);
        clock.advance(50);
        a.flush_presence();
        match &a.take_outgoing()[..] {
            [RemoteOp::Heartbeat(record)] => assert_eq!(record.cursor, Some(Point::new(2.0, 2.0))),
            other => panic!("unexpected ops {:?}", other),
        }
    }
}
