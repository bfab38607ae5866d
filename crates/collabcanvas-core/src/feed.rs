//! Remote change feed handling.

use crate::canvas::CanvasDocument;
use crate::lock::{LockManager, UpsertOutcome};
use crate::remote::{ChangeKind, FeedBatch};
use crate::scheduler::WriteScheduler;
use crate::shapes::ShapeId;
use tokio::sync::watch;

/// Counts of what a feed batch did to the local document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedReport {
    pub inserted: usize,
    pub applied: usize,
    pub suppressed: usize,
    pub removed: usize,
    /// Shapes the local client lost to another client.
    pub taken_over: Vec<ShapeId>,
}

impl FeedReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Applies shape subscription batches to the local document.
///
/// Inserts and modifications go through the lock filter; removals drop the
/// shape and cancel its pending writes. The listener reports itself ready
/// once the initial batch has been applied, even when it was empty.
pub struct ChangeFeedListener {
    ready: watch::Sender<bool>,
    delivered_shapes: bool,
}

impl Default for ChangeFeedListener {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeFeedListener {
    pub fn new() -> Self {
        let (ready, _) = watch::channel(false);
        Self {
            ready,
            delivered_shapes: false,
        }
    }

    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    /// Watch for readiness.
    pub fn ready_signal(&self) -> watch::Receiver<bool> {
        self.ready.subscribe()
    }

    /// Whether the feed has delivered at least one shape.
    pub fn has_delivered_shapes(&self) -> bool {
        self.delivered_shapes
    }

    pub fn apply(
        &mut self,
        batch: FeedBatch,
        doc: &mut CanvasDocument,
        locks: &mut LockManager,
        scheduler: &mut WriteScheduler,
    ) -> FeedReport {
        let mut report = FeedReport::default();
        for change in batch.changes {
            match change.kind {
                ChangeKind::Added | ChangeKind::Modified => {
                    self.delivered_shapes = true;
                    match locks.on_remote_shape_upsert(doc, scheduler, &change.id, &change.fields) {
                        UpsertOutcome::Inserted => report.inserted += 1,
                        UpsertOutcome::Applied => report.applied += 1,
                        UpsertOutcome::Suppressed => report.suppressed += 1,
                        UpsertOutcome::TakenOver => report.taken_over.push(change.id),
                    }
                }
                ChangeKind::Removed => {
                    scheduler.cancel(&change.id);
                    locks.forget(&change.id);
                    if doc.remove(&change.id).is_some() {
                        report.removed += 1;
                    }
                }
            }
        }
        if batch.initial && !self.is_ready() {
            log::info!("Shape feed ready ({} shapes)", doc.len());
            self.ready.send_replace(true);
        }
        report
    }
}
