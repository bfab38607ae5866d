//! Outbound write scheduling.
//!
//! The scheduler never talks to the remote store itself. It decides *when* a
//! shape should be written and queues the resulting [`OutboundWrite`]s in an
//! outbox that the owner drains with [`WriteScheduler::take_outgoing`]. Timed
//! writes (throttle trailing edges, debounce windows) only fire from
//! [`WriteScheduler::tick`], and [`WriteScheduler::next_deadline`] tells the
//! driver when that next needs to happen.

use crate::clock::SharedClock;
use crate::shapes::{Geometry, Shape, ShapeId};
use std::collections::HashMap;

/// How a write treats the stored lock field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockField {
    /// Omit `selectedBy`, leaving whatever the remote holds.
    Preserve,
    /// Write the shape's `selected_by`, including an explicit null.
    Assert,
}

/// One shape destined for the remote collection.
#[derive(Debug, Clone, PartialEq)]
pub struct ShapeWrite {
    pub shape: Shape,
    pub lock: LockField,
}

impl ShapeWrite {
    /// A write that leaves the remote lock alone.
    pub fn content(shape: Shape) -> Self {
        Self {
            shape,
            lock: LockField::Preserve,
        }
    }

    /// A write that carries the lock field as well.
    pub fn with_lock(shape: Shape) -> Self {
        Self {
            shape,
            lock: LockField::Assert,
        }
    }

    pub fn id(&self) -> &str {
        &self.shape.id
    }
}

/// A unit of work for the writer task.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundWrite {
    Set(ShapeWrite),
    Batch(Vec<ShapeWrite>),
    Delete(ShapeId),
}

/// Decides whether a debounced payload differs enough from what was last
/// written to be worth sending.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SignificanceFilter {
    pub epsilon: f64,
}

impl SignificanceFilter {
    pub fn new(epsilon: f64) -> Self {
        Self { epsilon }
    }

    /// Numeric fields count when they move by more than `epsilon`; any change
    /// to text, fill, kind, layer, or lock always counts.
    pub fn is_significant(&self, prev: &Shape, next: &Shape) -> bool {
        let far = |a: f64, b: f64| (a - b).abs() > self.epsilon;
        if far(prev.position.x, next.position.x) || far(prev.position.y, next.position.y) {
            return true;
        }
        let rotation_changed = match (prev.rotation, next.rotation) {
            (Some(a), Some(b)) => far(a, b),
            (None, None) => false,
            _ => true,
        };
        if rotation_changed
            || prev.fill != next.fill
            || prev.z_index != next.z_index
            || prev.selected_by != next.selected_by
        {
            return true;
        }
        match (&prev.geometry, &next.geometry) {
            (Geometry::Rectangle(a), Geometry::Rectangle(b)) => far(a.width, b.width) || far(a.height, b.height),
            (Geometry::Circle(a), Geometry::Circle(b)) => far(a.radius, b.radius),
            (Geometry::Text(a), Geometry::Text(b)) => a.content != b.content || far(a.font_size, b.font_size),
            _ => true,
        }
    }
}

/// Identifies one pending payload so a stale cancel cannot drop a newer one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteToken {
    pub shape_id: ShapeId,
    pub generation: u64,
}

#[derive(Debug, Clone)]
struct Pending {
    write: ShapeWrite,
    due_at: u64,
    generation: u64,
    filter: Option<SignificanceFilter>,
}

#[derive(Debug, Default)]
struct PendingWrite {
    last_write_at: Option<u64>,
    debounced: Option<Pending>,
    trailing: Option<Pending>,
}

impl PendingWrite {
    fn is_idle(&self) -> bool {
        self.debounced.is_none() && self.trailing.is_none()
    }

    fn deadline(&self) -> Option<u64> {
        [&self.debounced, &self.trailing]
            .into_iter()
            .flatten()
            .map(|p| p.due_at)
            .min()
    }
}

/// Per-shape write timing and the outbox.
pub struct WriteScheduler {
    clock: SharedClock,
    entries: HashMap<ShapeId, PendingWrite>,
    last_written: HashMap<ShapeId, Shape>,
    outgoing: Vec<OutboundWrite>,
    next_generation: u64,
}

impl WriteScheduler {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            clock,
            entries: HashMap::new(),
            last_written: HashMap::new(),
            outgoing: Vec::new(),
            next_generation: 1,
        }
    }

    /// Write immediately, superseding anything pending for the shape.
    pub fn write_now(&mut self, write: ShapeWrite) {
        let now = self.clock.now_millis();
        let entry = self.entries.entry(write.shape.id.clone()).or_default();
        entry.debounced = None;
        entry.trailing = None;
        entry.last_write_at = Some(now);
        self.emit(OutboundWrite::Set(write));
    }

    /// Leading-edge throttle with a single trailing write.
    ///
    /// The first call in an interval writes at once; later calls inside the
    /// interval replace the trailing payload, which goes out when the
    /// interval ends.
    pub fn write_throttled(&mut self, write: ShapeWrite, interval_ms: u64) -> Option<WriteToken> {
        let now = self.clock.now_millis();
        let id = write.shape.id.clone();
        let entry = self.entries.entry(id.clone()).or_default();
        let due_at = match entry.last_write_at {
            Some(last) if now.saturating_sub(last) < interval_ms => last + interval_ms,
            _ => {
                entry.debounced = None;
                entry.trailing = None;
                entry.last_write_at = Some(now);
                self.emit(OutboundWrite::Set(write));
                return None;
            }
        };
        let generation = self.next_generation;
        self.next_generation += 1;
        entry.trailing = Some(Pending {
            write,
            due_at,
            generation,
            filter: None,
        });
        Some(WriteToken {
            shape_id: id,
            generation,
        })
    }

    /// Write the last payload once `delay_ms` passes without another call,
    /// and only if `filter` deems it different from the last written value.
    pub fn write_debounced(&mut self, write: ShapeWrite, delay_ms: u64, filter: SignificanceFilter) -> WriteToken {
        let now = self.clock.now_millis();
        let id = write.shape.id.clone();
        let generation = self.next_generation;
        self.next_generation += 1;
        self.entries.entry(id.clone()).or_default().debounced = Some(Pending {
            write,
            due_at: now + delay_ms,
            generation,
            filter: Some(filter),
        });
        WriteToken {
            shape_id: id,
            generation,
        }
    }

    /// One multi-shape write; pending timers for those shapes are dropped.
    pub fn write_batch(&mut self, writes: Vec<ShapeWrite>) {
        if writes.is_empty() {
            return;
        }
        let now = self.clock.now_millis();
        for write in &writes {
            let entry = self.entries.entry(write.shape.id.clone()).or_default();
            entry.debounced = None;
            entry.trailing = None;
            entry.last_write_at = Some(now);
        }
        self.emit(OutboundWrite::Batch(writes));
    }

    /// Queue a remote delete and forget everything about the shape.
    pub fn delete(&mut self, id: &str) {
        self.entries.remove(id);
        self.last_written.remove(id);
        self.emit(OutboundWrite::Delete(id.to_string()));
    }

    /// Drop all pending payloads for a shape. Returns whether any existed.
    pub fn cancel(&mut self, id: &str) -> bool {
        match self.entries.get_mut(id) {
            Some(entry) => {
                let had = !entry.is_idle();
                entry.debounced = None;
                entry.trailing = None;
                had
            }
            None => false,
        }
    }

    /// Drop a pending payload only if it is still the one `token` refers to.
    pub fn cancel_token(&mut self, token: &WriteToken) -> bool {
        let Some(entry) = self.entries.get_mut(&token.shape_id) else {
            return false;
        };
        for slot in [&mut entry.debounced, &mut entry.trailing] {
            if slot.as_ref().is_some_and(|p| p.generation == token.generation) {
                *slot = None;
                return true;
            }
        }
        false
    }

    /// Fire every timer that is due. Returns how many writes were queued.
    pub fn tick(&mut self) -> usize {
        let now = self.clock.now_millis();
        let mut due: Vec<&ShapeId> = self
            .entries
            .iter()
            .filter(|(_, e)| e.deadline().is_some_and(|d| d <= now))
            .map(|(id, _)| id)
            .collect();
        due.sort();
        let due: Vec<ShapeId> = due.into_iter().cloned().collect();

        let mut fired = 0;
        for id in due {
            let Some(entry) = self.entries.get_mut(&id) else {
                continue;
            };
            let mut writes = Vec::new();
            if entry.trailing.as_ref().is_some_and(|p| p.due_at <= now) {
                if let Some(pending) = entry.trailing.take() {
                    entry.last_write_at = Some(now);
                    writes.push(pending.write);
                }
            }
            if entry.debounced.as_ref().is_some_and(|p| p.due_at <= now) {
                if let Some(pending) = entry.debounced.take() {
                    let significant = match (pending.filter, self.last_written.get(&id)) {
                        (Some(filter), Some(prev)) => filter.is_significant(prev, &pending.write.shape),
                        _ => true,
                    };
                    if significant {
                        entry.last_write_at = Some(now);
                        writes.push(pending.write);
                    } else {
                        log::debug!("Debounced write for {} below threshold, dropped", id);
                    }
                }
            }
            for write in writes {
                fired += 1;
                self.emit(OutboundWrite::Set(write));
            }
        }
        fired
    }

    /// Earliest time at which [`tick`](Self::tick) has work to do.
    pub fn next_deadline(&self) -> Option<u64> {
        self.entries.values().filter_map(PendingWrite::deadline).min()
    }

    pub fn has_pending(&self) -> bool {
        self.entries.values().any(|e| !e.is_idle())
    }

    pub fn has_pending_for(&self, id: &str) -> bool {
        self.entries.get(id).is_some_and(|e| !e.is_idle())
    }

    /// The value most recently queued for a shape.
    pub fn last_written(&self, id: &str) -> Option<&Shape> {
        self.last_written.get(id)
    }

    /// Take all queued writes.
    pub fn take_outgoing(&mut self) -> Vec<OutboundWrite> {
        std::mem::take(&mut self.outgoing)
    }

    fn emit(&mut self, write: OutboundWrite) {
        match &write {
            OutboundWrite::Set(w) => {
                log::debug!("Queue write for {}", w.shape.id);
                self.last_written.insert(w.shape.id.clone(), w.shape.clone());
            }
            OutboundWrite::Batch(ws) => {
                log::debug!("Queue batch write of {} shapes", ws.len());
                for w in ws {
                    self.last_written.insert(w.shape.id.clone(), w.shape.clone());
                }
            }
            OutboundWrite::Delete(id) => log::debug!("Queue delete for {}", id),
        }
        self.outgoing.push(write);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use kurbo::Point;
    use std::sync::Arc;

    fn rect_at(id: &str, x: f64) -> Shape {
        Shape::rectangle(Point::new(x, 0.0), 10.0, 10.0).with_id(id)
    }

    fn scheduler() -> (Arc<ManualClock>, WriteScheduler) {
        let clock = ManualClock::shared(1_000);
        let scheduler = WriteScheduler::new(clock.clone());
        (clock, scheduler)
    }

    fn set_x(write: &OutboundWrite) -> f64 {
        match write {
            OutboundWrite::Set(w) => w.shape.position.x,
            other => panic!("expected a single write, got {:?}", other),
        }
    }

    #[test]
    fn test_throttle_burst_writes_leading_and_one_trailing() {
        let clock = ManualClock::shared(0);
        let mut scheduler = WriteScheduler::new(clock.clone());

        // 100 calls spread over a 10 ms window.
        for i in 0..100 {
            clock.set(i / 10);
            scheduler.write_throttled(ShapeWrite::content(rect_at("r", i as f64)), 50);
        }
        let leading = scheduler.take_outgoing();
        assert_eq!(leading.len(), 1);
        assert_eq!(set_x(&leading[0]), 0.0);
        assert_eq!(scheduler.next_deadline(), Some(50));

        clock.set(49);
        assert_eq!(scheduler.tick(), 0);
        clock.set(50);
        assert_eq!(scheduler.tick(), 1);
        let trailing = scheduler.take_outgoing();
        assert_eq!(trailing.len(), 1);
        assert_eq!(set_x(&trailing[0]), 99.0);

        clock.set(500);
        assert_eq!(scheduler.tick(), 0);
        assert!(scheduler.take_outgoing().is_empty());
        assert!(!scheduler.has_pending());
    }

    #[test]
    fn test_debounce_keeps_last_payload() {
        let (clock, mut scheduler) = scheduler();
        let filter = SignificanceFilter::new(0.1);
        scheduler.write_debounced(ShapeWrite::content(rect_at("r", 1.0)), 30, filter);
        clock.advance(10);
        scheduler.write_debounced(ShapeWrite::content(rect_at("r", 2.0)), 30, filter);
        clock.advance(25);
        assert_eq!(scheduler.tick(), 0);
        clock.advance(5);
        assert_eq!(scheduler.tick(), 1);
        let out = scheduler.take_outgoing();
        assert_eq!(set_x(&out[0]), 2.0);
    }

    #[test]
    fn test_debounce_drops_insignificant_change() {
        let (clock, mut scheduler) = scheduler();
        scheduler.write_now(ShapeWrite::content(rect_at("r", 1.0)));
        scheduler.take_outgoing();

        scheduler.write_debounced(ShapeWrite::content(rect_at("r", 1.05)), 30, SignificanceFilter::new(0.1));
        clock.advance(30);
        assert_eq!(scheduler.tick(), 0);
        assert!(scheduler.take_outgoing().is_empty());
        assert!(!scheduler.has_pending());
    }

    #[test]
    fn test_write_now_cancels_pending() {
        let (_clock, mut scheduler) = scheduler();
        scheduler.write_debounced(ShapeWrite::content(rect_at("r", 1.0)), 30, SignificanceFilter::new(0.1));
        assert!(scheduler.has_pending_for("r"));
        scheduler.write_now(ShapeWrite::with_lock(rect_at("r", 5.0)));
        assert!(!scheduler.has_pending());
        assert_eq!(scheduler.take_outgoing().len(), 1);
    }

    #[test]
    fn test_batch_cancels_pending_and_emits_once() {
        let (_clock, mut scheduler) = scheduler();
        scheduler.write_debounced(ShapeWrite::content(rect_at("a", 1.0)), 30, SignificanceFilter::new(0.1));
        scheduler.write_batch(vec![
            ShapeWrite::content(rect_at("a", 2.0)),
            ShapeWrite::content(rect_at("b", 3.0)),
        ]);
        assert!(!scheduler.has_pending());
        let out = scheduler.take_outgoing();
        assert!(matches!(&out[..], [OutboundWrite::Batch(ws)] if ws.len() == 2));
        assert_eq!(scheduler.last_written("b").map(|s| s.position.x), Some(3.0));
    }

    #[test]
    fn test_delete_cancels_and_forgets() {
        let (clock, mut scheduler) = scheduler();
        scheduler.write_now(ShapeWrite::content(rect_at("r", 0.0)));
        scheduler.write_throttled(ShapeWrite::content(rect_at("r", 1.0)), 50);
        scheduler.delete("r");
        clock.advance(100);
        assert_eq!(scheduler.tick(), 0);
        let out = scheduler.take_outgoing();
        assert_eq!(out.last(), Some(&OutboundWrite::Delete("r".to_string())));
        assert!(scheduler.last_written("r").is_none());
    }

    #[test]
    fn test_stale_token_does_not_cancel_newer_payload() {
        let (_clock, mut scheduler) = scheduler();
        let filter = SignificanceFilter::new(0.1);
        let old = scheduler.write_debounced(ShapeWrite::content(rect_at("r", 1.0)), 30, filter);
        let new = scheduler.write_debounced(ShapeWrite::content(rect_at("r", 2.0)), 30, filter);
        assert!(!scheduler.cancel_token(&old));
        assert!(scheduler.has_pending_for("r"));
        assert!(scheduler.cancel_token(&new));
        assert!(!scheduler.has_pending_for("r"));
    }

    #[test]
    fn test_significance_filter_fields() {
        let filter = SignificanceFilter::new(0.1);
        let base = rect_at("r", 0.0);
        assert!(!filter.is_significant(&base, &rect_at("r", 0.05)));
        assert!(filter.is_significant(&base, &base.clone().with_fill("#000")));
        assert!(filter.is_significant(&base, &base.clone().with_z(0.01)));
        let mut rotated = base.clone();
        rotated.rotation = Some(0.0);
        assert!(filter.is_significant(&base, &rotated));
        let circle = Shape::circle(Point::ZERO, 5.0).with_id("r");
        assert!(filter.is_significant(&base, &circle));
    }
}
