//! Rectangle geometry.

use kurbo::{Point, Rect, Size};
use serde::{Deserialize, Serialize};

/// Width and height of a rectangle shape.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Rectangle {
    pub width: f64,
    pub height: f64,
}

impl Rectangle {
    pub fn new(width: f64, height: f64) -> Self {
        Self { width, height }
    }

    /// Create a rectangle from two corner points, returning its top-left
    /// position alongside it.
    pub fn from_corners(p1: Point, p2: Point) -> (Point, Self) {
        let rect = Rect::from_points(p1, p2);
        (rect.origin(), Self::new(rect.width(), rect.height()))
    }

    pub fn size(&self) -> Size {
        Size::new(self.width.max(0.0), self.height.max(0.0))
    }
}
