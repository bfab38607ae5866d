//! Soft per-shape edit locks.
//!
//! A lock is the `selected_by` field of a shape. Locks are advisory: they
//! stop honest clients from editing a shape someone else has selected, and
//! they filter remote echoes so a client's in-progress edit is not yanked
//! around by stale copies of its own writes.
//!
//! Whether the local client holds a lock is decided by this manager's own
//! record of successful claims, never by what the document currently says.
//! A stale remote copy naming the local client therefore cannot make a lock
//! stick.

use crate::canvas::CanvasDocument;
use crate::error::LockError;
use crate::remote::{patch_from_fields, shape_from_fields, DocFields};
use crate::scheduler::{ShapeWrite, WriteScheduler};
use crate::shapes::{ClientId, LockDescriptor, ShapeId};
use std::collections::{BTreeSet, HashSet};

/// How a remote upsert was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// The shape was new and has been inserted.
    Inserted,
    /// The patch was merged in full.
    Applied,
    /// Content was ignored; at most the lock field was merged.
    Suppressed,
    /// Another client took over a shape the local client held.
    TakenOver,
}

/// Lock bookkeeping for the local client.
#[derive(Debug)]
pub struct LockManager {
    local: LockDescriptor,
    /// Shapes the local client has claimed.
    held: BTreeSet<ShapeId>,
    /// Shapes the local client is in the middle of a gesture on.
    editing: HashSet<ShapeId>,
    /// Clients known to be in the room, per the latest presence data.
    /// Until presence has been observed every owner counts as active.
    active_clients: Option<HashSet<ClientId>>,
}

impl LockManager {
    pub fn new(local: LockDescriptor) -> Self {
        Self {
            local,
            held: BTreeSet::new(),
            editing: HashSet::new(),
            active_clients: None,
        }
    }

    pub fn local(&self) -> &LockDescriptor {
        &self.local
    }

    pub fn local_client(&self) -> &str {
        &self.local.user_id
    }

    /// Shapes the local client currently holds.
    pub fn selection(&self) -> impl Iterator<Item = &ShapeId> {
        self.held.iter()
    }

    pub fn holds(&self, shape_id: &str) -> bool {
        self.held.contains(shape_id)
    }

    pub fn is_editing(&self, shape_id: &str) -> bool {
        self.editing.contains(shape_id)
    }

    pub fn is_editing_any(&self) -> bool {
        !self.editing.is_empty()
    }

    /// Update the set of clients considered alive.
    pub fn observe_active_clients(&mut self, active: HashSet<ClientId>) {
        self.active_clients = Some(active);
    }

    /// The local client always counts as active.
    pub fn is_active(&self, client_id: &str) -> bool {
        client_id == self.local.user_id
            || self
                .active_clients
                .as_ref()
                .is_none_or(|active| active.contains(client_id))
    }

    /// Whether another, still active, client holds the shape.
    pub fn is_locked_by_other(&self, doc: &CanvasDocument, shape_id: &str, client_id: &str) -> bool {
        doc.get(shape_id)
            .and_then(|s| s.owner())
            .is_some_and(|owner| owner != client_id && self.is_active(owner))
    }

    /// Put `owner` on a shape and write it out.
    ///
    /// Refused if a different active client holds the shape. A lock left
    /// behind by a client that is no longer active is taken over.
    pub fn claim(
        &mut self,
        doc: &mut CanvasDocument,
        scheduler: &mut WriteScheduler,
        shape_id: &str,
        owner: &LockDescriptor,
    ) -> Result<(), LockError> {
        let shape = doc
            .get_mut(shape_id)
            .ok_or_else(|| LockError::NotFound(shape_id.to_string()))?;
        if let Some(current) = &shape.selected_by {
            if current.user_id != owner.user_id && self.is_active(&current.user_id) {
                return Err(LockError::HeldBy {
                    shape_id: shape_id.to_string(),
                    owner: current.clone(),
                });
            }
            if current.user_id != owner.user_id {
                log::info!("Taking over lock on {} from departed {}", shape_id, current.user_id);
            }
        }
        shape.selected_by = Some(owner.clone());
        let snapshot = shape.clone();
        if owner.user_id == self.local.user_id {
            self.held.insert(shape_id.to_string());
        }
        scheduler.write_now(ShapeWrite::with_lock(snapshot));
        Ok(())
    }

    /// Claim for the local client.
    pub fn claim_local(
        &mut self,
        doc: &mut CanvasDocument,
        scheduler: &mut WriteScheduler,
        shape_id: &str,
    ) -> Result<(), LockError> {
        let local = self.local.clone();
        self.claim(doc, scheduler, shape_id, &local)
    }

    /// Clear the lock if `client_id` owns it. Pending writes for the shape
    /// are superseded by the releasing write.
    pub fn release(
        &mut self,
        doc: &mut CanvasDocument,
        scheduler: &mut WriteScheduler,
        shape_id: &str,
        client_id: &str,
    ) -> bool {
        if client_id == self.local.user_id {
            self.held.remove(shape_id);
            self.editing.remove(shape_id);
        }
        let Some(shape) = doc.get_mut(shape_id) else {
            return false;
        };
        if shape.owner() != Some(client_id) {
            return false;
        }
        shape.selected_by = None;
        scheduler.write_now(ShapeWrite::with_lock(shape.clone()));
        true
    }

    /// Release everything the local client holds.
    pub fn release_all(&mut self, doc: &mut CanvasDocument, scheduler: &mut WriteScheduler) -> Vec<ShapeId> {
        let held: Vec<ShapeId> = self.held.iter().cloned().collect();
        let local = self.local.user_id.clone();
        held.into_iter()
            .filter(|id| self.release(doc, scheduler, id, &local))
            .collect()
    }

    /// Drop local lock state for a shape that no longer exists.
    pub fn forget(&mut self, shape_id: &str) {
        self.held.remove(shape_id);
        self.editing.remove(shape_id);
    }

    /// Mark the start of a gesture. Refused if another client holds it.
    pub fn begin_edit(&mut self, doc: &CanvasDocument, shape_id: &str) -> Result<(), LockError> {
        let shape = doc
            .get(shape_id)
            .ok_or_else(|| LockError::NotFound(shape_id.to_string()))?;
        if let Some(owner) = &shape.selected_by {
            if self.is_locked_by_other(doc, shape_id, &self.local.user_id) {
                return Err(LockError::HeldBy {
                    shape_id: shape_id.to_string(),
                    owner: owner.clone(),
                });
            }
        }
        self.editing.insert(shape_id.to_string());
        Ok(())
    }

    /// Mark the end of a gesture. Returns whether the local client may
    /// commit its result, i.e. it still holds the shape or nobody does.
    pub fn end_edit(&mut self, doc: &CanvasDocument, shape_id: &str) -> bool {
        let was_editing = self.editing.remove(shape_id);
        let may_commit = doc
            .get(shape_id)
            .is_some_and(|s| s.owner().is_none_or(|owner| owner == self.local.user_id));
        was_editing && may_commit
    }

    /// Clear locks whose owner is not in `active`, locally and remotely.
    pub fn reconcile_against_presence(
        &mut self,
        doc: &mut CanvasDocument,
        scheduler: &mut WriteScheduler,
        active: &HashSet<ClientId>,
    ) -> Vec<ShapeId> {
        self.active_clients = Some(active.clone());
        let abandoned: Vec<ShapeId> = doc
            .shapes()
            .filter(|s| s.owner().is_some_and(|owner| !self.is_active(owner)))
            .map(|s| s.id.clone())
            .collect();
        for id in &abandoned {
            if let Some(shape) = doc.get_mut(id) {
                log::info!(
                    "Clearing abandoned lock on {} held by {}",
                    id,
                    shape.owner().unwrap_or_default()
                );
                shape.selected_by = None;
                scheduler.write_now(ShapeWrite::with_lock(shape.clone()));
            }
        }
        abandoned
    }

    /// Filter a remote insert/modify through the lock rules.
    pub fn on_remote_shape_upsert(
        &mut self,
        doc: &mut CanvasDocument,
        scheduler: &mut WriteScheduler,
        shape_id: &str,
        fields: &DocFields,
    ) -> UpsertOutcome {
        let mut patch = patch_from_fields(fields);
        if !doc.contains(shape_id) {
            let mut shape = shape_from_fields(shape_id, fields);
            if shape.owner() == Some(self.local.user_id.as_str()) && !self.holds(shape_id) {
                shape.selected_by = None;
                doc.insert(shape.clone());
                scheduler.write_now(ShapeWrite::with_lock(shape));
            } else {
                doc.insert(shape);
            }
            return UpsertOutcome::Inserted;
        }

        let incoming_owner = patch.selected_by.clone();
        let names_other = |owner: &Option<LockDescriptor>| {
            owner.as_ref().is_some_and(|o| o.user_id != self.local.user_id)
        };

        if self.editing.contains(shape_id) {
            if let Some(owner) = &incoming_owner {
                // Another client owns the shape now: the gesture is over and
                // nothing it queued may be written.
                if names_other(owner) {
                    log::info!("Lock on {} taken over mid-edit", shape_id);
                    self.editing.remove(shape_id);
                    self.held.remove(shape_id);
                    scheduler.cancel(shape_id);
                    doc.update(shape_id, &patch);
                    return UpsertOutcome::TakenOver;
                }
                if owner.is_some() || !self.holds(shape_id) {
                    doc.update(shape_id, &patch.lock_only());
                }
            }
            return UpsertOutcome::Suppressed;
        }

        if self.holds(shape_id) {
            return match &incoming_owner {
                Some(owner) if names_other(owner) => {
                    log::info!("Lock on {} taken over remotely", shape_id);
                    self.held.remove(shape_id);
                    scheduler.cancel(shape_id);
                    doc.update(shape_id, &patch);
                    UpsertOutcome::TakenOver
                }
                Some(Some(_)) => {
                    doc.update(shape_id, &patch.lock_only());
                    UpsertOutcome::Suppressed
                }
                // An explicit null is an echo from before our claim.
                _ => UpsertOutcome::Suppressed,
            };
        }

        // A remote copy claiming the local client for a shape it does not
        // hold is left over from an earlier claim; clear it.
        let stale_self_lock = matches!(&incoming_owner, Some(Some(o)) if o.user_id == self.local.user_id);
        if stale_self_lock {
            patch.selected_by = Some(None);
        }
        doc.update(shape_id, &patch);
        if stale_self_lock {
            if let Some(shape) = doc.get(shape_id) {
                scheduler.write_now(ShapeWrite::with_lock(shape.clone()));
            }
        }
        UpsertOutcome::Applied
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::remote::shape_to_fields;
    use crate::scheduler::{LockField, OutboundWrite};
    use crate::shapes::Shape;
    use kurbo::Point;
    use std::sync::Arc;

    fn descriptor(id: &str) -> LockDescriptor {
        LockDescriptor::new(id, "#123456", id.to_uppercase())
    }

    fn setup(local: &str) -> (LockManager, CanvasDocument, WriteScheduler) {
        setup_with_clock(local, ManualClock::shared(0))
    }

    fn setup_with_clock(local: &str, clock: Arc<ManualClock>) -> (LockManager, CanvasDocument, WriteScheduler) {
        let mut doc = CanvasDocument::new();
        doc.insert(Shape::rectangle(Point::new(10.0, 10.0), 20.0, 20.0).with_id("r"));
        let scheduler = WriteScheduler::new(clock);
        (LockManager::new(descriptor(local)), doc, scheduler)
    }

    fn active(ids: &[&str]) -> HashSet<ClientId> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    fn remote_fields(shape: &Shape) -> DocFields {
        shape_to_fields(shape, LockField::Assert)
    }

    #[test]
    fn test_claim_and_release() {
        let (mut locks, mut doc, mut scheduler) = setup("a");
        locks.claim_local(&mut doc, &mut scheduler, "r").unwrap();
        assert!(locks.holds("r"));
        assert_eq!(doc.get("r").and_then(|s| s.owner()), Some("a"));
        assert!(locks.release(&mut doc, &mut scheduler, "r", "a"));
        assert_eq!(doc.get("r").and_then(|s| s.owner()), None);
        assert!(!locks.holds("r"));

        let writes = scheduler.take_outgoing();
        assert_eq!(writes.len(), 2);
        assert!(matches!(&writes[1], OutboundWrite::Set(w) if w.lock == LockField::Assert && w.shape.selected_by.is_none()));
    }

    #[test]
    fn test_claim_refused_while_owner_active() {
        let (mut locks, mut doc, mut scheduler) = setup("a");
        locks.observe_active_clients(active(&["a", "b"]));
        locks.claim(&mut doc, &mut scheduler, "r", &descriptor("b")).unwrap();

        let err = locks.claim_local(&mut doc, &mut scheduler, "r").unwrap_err();
        assert!(matches!(err, LockError::HeldBy { ref owner, .. } if owner.user_id == "b"));
        assert!(!locks.release(&mut doc, &mut scheduler, "r", "a"));
        assert_eq!(doc.get("r").and_then(|s| s.owner()), Some("b"));
    }

    #[test]
    fn test_owners_count_as_active_before_presence() {
        let (mut locks, mut doc, mut scheduler) = setup("a");
        locks.claim(&mut doc, &mut scheduler, "r", &descriptor("b")).unwrap();
        assert!(locks.is_locked_by_other(&doc, "r", "a"));
        assert!(locks.claim_local(&mut doc, &mut scheduler, "r").is_err());
    }

    #[test]
    fn test_claim_takes_over_from_departed_owner() {
        let (mut locks, mut doc, mut scheduler) = setup("a");
        locks.observe_active_clients(active(&["b"]));
        locks.claim(&mut doc, &mut scheduler, "r", &descriptor("b")).unwrap();
        locks.observe_active_clients(active(&[]));
        locks.claim_local(&mut doc, &mut scheduler, "r").unwrap();
        assert_eq!(doc.get("r").and_then(|s| s.owner()), Some("a"));
    }

    #[test]
    fn test_claim_missing_shape() {
        let (mut locks, mut doc, mut scheduler) = setup("a");
        assert_eq!(
            locks.claim_local(&mut doc, &mut scheduler, "nope"),
            Err(LockError::NotFound("nope".to_string()))
        );
    }

    #[test]
    fn test_at_most_one_owner_under_contention() {
        let (mut locks, mut doc, mut scheduler) = setup("a");
        doc.insert(Shape::circle(Point::ZERO, 4.0).with_id("c"));
        let clients = ["a", "b", "c"];
        locks.observe_active_clients(active(&clients));

        let shapes = ["r", "c"];
        let mut seed: u64 = 0x2545_f491;
        for _ in 0..500 {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            let client = clients[(seed >> 33) as usize % 3];
            let shape = shapes[(seed >> 40) as usize % 2];
            let before = doc.get(shape).and_then(|s| s.owner().map(str::to_string));

            if (seed >> 50) % 2 == 0 {
                let result = locks.claim(&mut doc, &mut scheduler, shape, &descriptor(client));
                match &before {
                    Some(owner) if owner != client => assert!(result.is_err()),
                    _ => assert!(result.is_ok()),
                }
            } else {
                let released = locks.release(&mut doc, &mut scheduler, shape, client);
                assert_eq!(released, before.as_deref() == Some(client));
            }

            let after = doc.get(shape).and_then(|s| s.owner().map(str::to_string));
            if let (Some(b), Some(a)) = (&before, &after) {
                assert_eq!(a, b, "ownership moved without a release");
            }
        }
    }

    #[test]
    fn test_reconcile_clears_abandoned_locks() {
        let (mut locks, mut doc, mut scheduler) = setup("a");
        locks.observe_active_clients(active(&["b"]));
        locks.claim(&mut doc, &mut scheduler, "r", &descriptor("b")).unwrap();
        scheduler.take_outgoing();

        let cleared = locks.reconcile_against_presence(&mut doc, &mut scheduler, &active(&[]));
        assert_eq!(cleared, vec!["r".to_string()]);
        assert_eq!(doc.get("r").and_then(|s| s.owner()), None);
        assert_eq!(scheduler.take_outgoing().len(), 1);
    }

    #[test]
    fn test_reconcile_keeps_local_locks() {
        let (mut locks, mut doc, mut scheduler) = setup("a");
        locks.claim_local(&mut doc, &mut scheduler, "r").unwrap();
        let cleared = locks.reconcile_against_presence(&mut doc, &mut scheduler, &active(&[]));
        assert!(cleared.is_empty());
        assert!(locks.holds("r"));
    }

    #[test]
    fn test_remote_insert_and_apply() {
        let (mut locks, mut doc, mut scheduler) = setup("a");
        let shape = Shape::circle(Point::new(1.0, 1.0), 2.0).with_id("n");
        let outcome = locks.on_remote_shape_upsert(&mut doc, &mut scheduler, "n", &remote_fields(&shape));
        assert_eq!(outcome, UpsertOutcome::Inserted);

        let moved = Shape::circle(Point::new(5.0, 5.0), 2.0).with_id("n");
        let outcome = locks.on_remote_shape_upsert(&mut doc, &mut scheduler, "n", &remote_fields(&moved));
        assert_eq!(outcome, UpsertOutcome::Applied);
        assert_eq!(doc.get("n"), Some(&moved));
    }

    #[test]
    fn test_mid_edit_suppresses_geometry_but_merges_owner() {
        let (mut locks, mut doc, mut scheduler) = setup("a");
        locks.claim_local(&mut doc, &mut scheduler, "r").unwrap();
        locks.begin_edit(&doc, "r").unwrap();
        doc.update("r", &crate::shapes::ShapePatch::moved_to(50.0, 50.0));

        let mut stale = Shape::rectangle(Point::new(10.0, 10.0), 20.0, 20.0).with_id("r");
        stale.selected_by = None;
        let outcome = locks.on_remote_shape_upsert(&mut doc, &mut scheduler, "r", &remote_fields(&stale));
        assert_eq!(outcome, UpsertOutcome::Suppressed);
        let local = doc.get("r").unwrap();
        assert_eq!(local.position, Point::new(50.0, 50.0));
        assert_eq!(local.owner(), Some("a"));
    }

    #[test]
    fn test_takeover_mid_edit_ends_gesture_and_cancels_writes() {
        let clock = ManualClock::shared(1_000);
        let (mut locks, mut doc, mut scheduler) = setup_with_clock("a", clock.clone());
        locks.claim_local(&mut doc, &mut scheduler, "r").unwrap();
        locks.begin_edit(&doc, "r").unwrap();
        clock.advance(100);

        doc.update("r", &crate::shapes::ShapePatch::moved_to(5.0, 5.0));
        scheduler.write_throttled(ShapeWrite::content(doc.get("r").cloned().unwrap()), 50);
        doc.update("r", &crate::shapes::ShapePatch::moved_to(6.0, 6.0));
        scheduler.write_throttled(ShapeWrite::content(doc.get("r").cloned().unwrap()), 50);
        scheduler.take_outgoing();
        assert!(scheduler.has_pending_for("r"));

        let mut theirs = Shape::rectangle(Point::new(300.0, 300.0), 20.0, 20.0).with_id("r");
        theirs.selected_by = Some(descriptor("b"));
        let outcome = locks.on_remote_shape_upsert(&mut doc, &mut scheduler, "r", &remote_fields(&theirs));

        assert_eq!(outcome, UpsertOutcome::TakenOver);
        assert!(!locks.holds("r"));
        assert!(!locks.is_editing("r"));
        assert_eq!(doc.get("r"), Some(&theirs));
        clock.advance(100);
        scheduler.tick();
        assert!(scheduler.take_outgoing().is_empty());
    }

    #[test]
    fn test_explicit_null_never_clears_held_lock() {
        let (mut locks, mut doc, mut scheduler) = setup("a");
        locks.claim_local(&mut doc, &mut scheduler, "r").unwrap();
        let echo = Shape::rectangle(Point::new(99.0, 99.0), 20.0, 20.0).with_id("r");
        let outcome = locks.on_remote_shape_upsert(&mut doc, &mut scheduler, "r", &remote_fields(&echo));
        assert_eq!(outcome, UpsertOutcome::Suppressed);
        assert_eq!(doc.get("r").and_then(|s| s.owner()), Some("a"));
        assert_eq!(doc.get("r").map(|s| s.position), Some(Point::new(10.0, 10.0)));
    }

    #[test]
    fn test_remote_takeover_drops_local_lock() {
        let (mut locks, mut doc, mut scheduler) = setup("a");
        locks.claim_local(&mut doc, &mut scheduler, "r").unwrap();
        scheduler.write_debounced(
            ShapeWrite::content(doc.get("r").cloned().unwrap()),
            30,
            crate::scheduler::SignificanceFilter::new(0.1),
        );

        let mut theirs = Shape::rectangle(Point::new(70.0, 70.0), 20.0, 20.0).with_id("r");
        theirs.selected_by = Some(descriptor("b"));
        let outcome = locks.on_remote_shape_upsert(&mut doc, &mut scheduler, "r", &remote_fields(&theirs));

        assert_eq!(outcome, UpsertOutcome::TakenOver);
        assert!(!locks.holds("r"));
        assert!(!scheduler.has_pending_for("r"));
        assert_eq!(doc.get("r"), Some(&theirs));
    }

    #[test]
    fn test_stale_self_lock_is_cleared() {
        let (mut locks, mut doc, mut scheduler) = setup("a");
        let mut echo = doc.get("r").cloned().unwrap();
        echo.selected_by = Some(descriptor("a"));
        let outcome = locks.on_remote_shape_upsert(&mut doc, &mut scheduler, "r", &remote_fields(&echo));
        assert_eq!(outcome, UpsertOutcome::Applied);
        assert_eq!(doc.get("r").and_then(|s| s.owner()), None);
        assert_eq!(scheduler.take_outgoing().len(), 1);
    }

    #[test]
    fn test_end_edit_commit_rules() {
        let (mut locks, mut doc, mut scheduler) = setup("a");
        locks.begin_edit(&doc, "r").unwrap();
        assert!(locks.end_edit(&doc, "r"));
        assert!(!locks.end_edit(&doc, "r"));

        locks.observe_active_clients(active(&["b"]));
        locks.begin_edit(&doc, "r").unwrap();
        locks.claim(&mut doc, &mut scheduler, "r", &descriptor("b")).unwrap();
        assert!(!locks.end_edit(&doc, "r"));
        assert!(locks.begin_edit(&doc, "r").is_err());
    }
}
