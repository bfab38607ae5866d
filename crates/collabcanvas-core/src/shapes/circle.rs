//! Circle geometry.

use kurbo::Size;
use serde::{Deserialize, Serialize};

/// A circle, described by its radius.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Circle {
    pub radius: f64,
}

impl Circle {
    pub fn new(radius: f64) -> Self {
        Self { radius }
    }

    /// The square the circle occupies.
    pub fn size(&self) -> Size {
        let diameter = self.radius.max(0.0) * 2.0;
        Size::new(diameter, diameter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_circle_size_is_diameter() {
        assert_eq!(Circle::new(5.0).size(), Size::new(10.0, 10.0));
    }
}
