//! Text geometry.

use kurbo::Size;
use serde::{Deserialize, Serialize};

/// Font size used when none is given.
pub const DEFAULT_FONT_SIZE: f64 = 18.0;

/// A single-line text label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Text {
    pub content: String,
    /// Font size in pixels.
    pub font_size: f64,
}

impl Text {
    pub fn new(content: impl Into<String>, font_size: f64) -> Self {
        Self {
            content: content.into(),
            font_size,
        }
    }

    /// Approximate extent without a font shaper: a fixed advance per char.
    pub fn size(&self) -> Size {
        let font_size = self.font_size.max(0.0);
        let char_width = (font_size * 0.6).round().max(5.0);
        let chars = self.content.chars().count() as f64;
        Size::new((chars * char_width).max(10.0), font_size)
    }
}

impl Default for Text {
    fn default() -> Self {
        Self::new(String::new(), DEFAULT_FONT_SIZE)
    }
}
