//! Partial shape updates.

use super::{LockDescriptor, ShapeKind};

/// A partial update to a shape.
///
/// Nullable fields are `Option<Option<T>>`: `None` leaves the field alone,
/// `Some(None)` clears it, `Some(Some(v))` sets it. This is the distinction
/// remote merge writes depend on ("don't touch" versus "clear").
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ShapePatch {
    pub kind: Option<ShapeKind>,
    pub x: Option<f64>,
    pub y: Option<f64>,
    pub width: Option<Option<f64>>,
    pub height: Option<Option<f64>>,
    pub radius: Option<Option<f64>>,
    pub text: Option<Option<String>>,
    pub font_size: Option<Option<f64>>,
    pub fill: Option<String>,
    pub rotation: Option<Option<f64>>,
    pub z_index: Option<f64>,
    pub selected_by: Option<Option<LockDescriptor>>,
}

impl ShapePatch {
    /// A patch that moves a shape.
    pub fn moved_to(x: f64, y: f64) -> Self {
        Self {
            x: Some(x),
            y: Some(y),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// The same patch with the lock field removed.
    pub fn without_lock(mut self) -> Self {
        self.selected_by = None;
        self
    }

    /// Only the lock field of this patch.
    pub fn lock_only(&self) -> Self {
        Self {
            selected_by: self.selected_by.clone(),
            ..Default::default()
        }
    }
}
