//! Whole-canvas snapshot document.
//!
//! Written periodically and when a client goes away; read once at cold start
//! to paint something before the live feed catches up.

use super::convert::{shape_from_fields, shape_to_fields};
use super::DocFields;
use crate::canvas::CanvasDocument;
use crate::scheduler::LockField;
use crate::shapes::ShapeId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotDocument {
    #[serde(default)]
    pub shapes_by_id: BTreeMap<ShapeId, DocFields>,
    #[serde(default)]
    pub all_ids: Vec<ShapeId>,
    #[serde(default)]
    pub updated_at: u64,
}

impl SnapshotDocument {
    /// Capture a document. Locks are left out since they go stale.
    pub fn capture(doc: &CanvasDocument, updated_at: u64) -> Self {
        Self {
            shapes_by_id: doc
                .shapes()
                .map(|s| (s.id.clone(), shape_to_fields(s, LockField::Preserve)))
                .collect(),
            all_ids: doc.ids().to_vec(),
            updated_at,
        }
    }

    /// Rebuild a document in `all_ids` order. Ids with no shape entry are
    /// skipped and entries missing from `all_ids` are appended.
    pub fn restore(&self) -> CanvasDocument {
        let mut doc = CanvasDocument::new();
        let listed = self.all_ids.iter().filter(|id| self.shapes_by_id.contains_key(*id));
        let unlisted = self.shapes_by_id.keys().filter(|id| !self.all_ids.contains(id));
        for id in listed.chain(unlisted) {
            if let Some(fields) = self.shapes_by_id.get(id) {
                let mut shape = shape_from_fields(id.clone(), fields);
                shape.selected_by = None;
                doc.insert(shape);
            }
        }
        doc
    }

    pub fn is_empty(&self) -> bool {
        self.shapes_by_id.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shapes::{LockDescriptor, Shape};
    use kurbo::Point;

    #[test]
    fn test_capture_and_restore() {
        let mut doc = CanvasDocument::new();
        doc.insert(Shape::rectangle(Point::new(1.0, 1.0), 5.0, 5.0).with_id("b"));
        let mut locked = Shape::circle(Point::new(2.0, 2.0), 3.0).with_id("a");
        locked.selected_by = Some(LockDescriptor::new("x", "#000", "X"));
        doc.insert(locked);

        let snapshot = SnapshotDocument::capture(&doc, 42);
        let restored = snapshot.restore();
        assert_eq!(restored.ids(), doc.ids());
        assert_eq!(restored.get("b"), doc.get("b"));
        assert_eq!(restored.get("a").and_then(|s| s.selected_by.clone()), None);
        assert!(restored.is_consistent());
    }

    #[test]
    fn test_restore_tolerates_inconsistent_ids() {
        let mut doc = CanvasDocument::new();
        doc.insert(Shape::rectangle(Point::ZERO, 1.0, 1.0).with_id("a"));
        let mut snapshot = SnapshotDocument::capture(&doc, 0);
        snapshot.all_ids = vec!["ghost".to_string()];
        let restored = snapshot.restore();
        assert_eq!(restored.ids(), ["a".to_string()]);
    }
}
