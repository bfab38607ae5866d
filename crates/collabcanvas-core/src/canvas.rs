//! Local document store.

use crate::ids::IdGenerator;
use crate::layering::{self, ReorderDirection, ZAssignment};
use crate::shapes::{Shape, ShapeId, ShapePatch};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// The client's in-memory copy of the shared canvas.
///
/// Shapes are keyed by id in `by_id`; `all_ids` lists every key exactly once
/// in insertion order. Render order is independent of `all_ids` and comes
/// from sorting by `(z_index, id)`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanvasDocument {
    by_id: HashMap<ShapeId, Shape>,
    all_ids: Vec<ShapeId>,
}

impl CanvasDocument {
    /// Create a new empty document.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a shape, assigning an id from `ids` when it has none.
    ///
    /// Upserts: adding a shape whose id is already present replaces it
    /// without duplicating the id in the order list.
    pub fn add(&mut self, mut shape: Shape, ids: &dyn IdGenerator) -> ShapeId {
        if shape.id.is_empty() {
            shape.id = ids.next_id();
        }
        let id = shape.id.clone();
        self.insert(shape);
        id
    }

    /// Upsert a shape that already carries an id.
    pub fn insert(&mut self, shape: Shape) {
        if !self.by_id.contains_key(&shape.id) {
            self.all_ids.push(shape.id.clone());
        }
        self.by_id.insert(shape.id.clone(), shape);
    }

    /// Merge a patch into an existing shape. Missing ids are a no-op.
    pub fn update(&mut self, id: &str, patch: &ShapePatch) -> bool {
        match self.by_id.get_mut(id) {
            Some(shape) => {
                shape.apply_patch(patch);
                true
            }
            None => false,
        }
    }

    /// Remove a shape from both the map and the order list.
    pub fn remove(&mut self, id: &str) -> Option<Shape> {
        let removed = self.by_id.remove(id)?;
        self.all_ids.retain(|existing| existing != id);
        Some(removed)
    }

    /// Apply a layering command and return the z values that changed.
    pub fn reorder(&mut self, ids: &[ShapeId], direction: ReorderDirection) -> Vec<ZAssignment> {
        let assignments = layering::plan(self, ids, direction);
        self.apply_z(&assignments);
        assignments
    }

    /// Write a set of z values back into the document.
    pub fn apply_z(&mut self, assignments: &[ZAssignment]) {
        for (id, z) in assignments {
            if let Some(shape) = self.by_id.get_mut(id) {
                shape.z_index = *z;
            }
        }
    }

    pub fn clear(&mut self) {
        self.by_id.clear();
        self.all_ids.clear();
    }

    pub fn get(&self, id: &str) -> Option<&Shape> {
        self.by_id.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Shape> {
        self.by_id.get_mut(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.by_id.contains_key(id)
    }

    /// Ids in insertion order.
    pub fn ids(&self) -> &[ShapeId] {
        &self.all_ids
    }

    /// All shapes in insertion order.
    pub fn shapes(&self) -> impl Iterator<Item = &Shape> {
        self.all_ids.iter().filter_map(|id| self.by_id.get(id))
    }

    /// Shapes in render order (back to front).
    pub fn shapes_ordered(&self) -> impl Iterator<Item = &Shape> {
        let mut shapes: Vec<&Shape> = self.by_id.values().collect();
        shapes.sort_by(|a, b| a.z_index.total_cmp(&b.z_index).then_with(|| a.id.cmp(&b.id)));
        shapes.into_iter()
    }

    pub fn max_z(&self) -> Option<f64> {
        self.by_id.values().map(|s| s.z_index).max_by(f64::total_cmp)
    }

    pub fn min_z(&self) -> Option<f64> {
        self.by_id.values().map(|s| s.z_index).min_by(f64::total_cmp)
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    /// Whether `all_ids` holds exactly the keys of `by_id`, once each, and
    /// every shape is stored under its own id.
    pub fn is_consistent(&self) -> bool {
        let mut seen = HashSet::with_capacity(self.all_ids.len());
        self.all_ids.len() == self.by_id.len()
            && self.all_ids.iter().all(|id| seen.insert(id) && self.by_id.contains_key(id))
            && self.by_id.iter().all(|(id, shape)| *id == shape.id)
    }

    /// Serialize the document to JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Deserialize a document from JSON.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}
