//! Shape definitions for the shared canvas.

mod circle;
mod patch;
mod rectangle;
mod text;

pub use circle::Circle;
pub use patch::ShapePatch;
pub use rectangle::Rectangle;
pub use text::{DEFAULT_FONT_SIZE, Text};

use kurbo::{Point, Rect, Size};
use serde::{Deserialize, Serialize};

/// Unique identifier for shapes.
pub type ShapeId = String;

/// Unique identifier for a connected client.
pub type ClientId = String;

/// Fill used when a shape is created without one.
pub const DEFAULT_FILL: &str = "#4f46e5";

/// The kinds of shape the canvas supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShapeKind {
    #[default]
    Rectangle,
    Circle,
    Text,
}

impl ShapeKind {
    /// Name used in remote documents.
    pub fn as_str(&self) -> &'static str {
        match self {
            ShapeKind::Rectangle => "rectangle",
            ShapeKind::Circle => "circle",
            ShapeKind::Text => "text",
        }
    }

    /// Parse a remote kind name. Accepts the short `rect` spelling too.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "rectangle" | "rect" => Some(ShapeKind::Rectangle),
            "circle" => Some(ShapeKind::Circle),
            "text" => Some(ShapeKind::Text),
            _ => None,
        }
    }
}

/// Soft-lock marker: which client currently has a shape selected.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockDescriptor {
    pub user_id: ClientId,
    pub color: String,
    pub display_name: String,
}

impl LockDescriptor {
    pub fn new(
        user_id: impl Into<ClientId>,
        color: impl Into<String>,
        display_name: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            color: color.into(),
            display_name: display_name.into(),
        }
    }
}

/// Kind-specific geometry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Geometry {
    Rectangle(Rectangle),
    Circle(Circle),
    Text(Text),
}

impl Geometry {
    /// Default geometry for a kind.
    pub fn default_for(kind: ShapeKind) -> Self {
        match kind {
            ShapeKind::Rectangle => Geometry::Rectangle(Rectangle::default()),
            ShapeKind::Circle => Geometry::Circle(Circle::default()),
            ShapeKind::Text => Geometry::Text(Text::default()),
        }
    }

    pub fn kind(&self) -> ShapeKind {
        match self {
            Geometry::Rectangle(_) => ShapeKind::Rectangle,
            Geometry::Circle(_) => ShapeKind::Circle,
            Geometry::Text(_) => ShapeKind::Text,
        }
    }

    /// Extent of the geometry, used for layout.
    pub fn size(&self) -> Size {
        match self {
            Geometry::Rectangle(r) => r.size(),
            Geometry::Circle(c) => c.size(),
            Geometry::Text(t) => t.size(),
        }
    }
}

/// A drawable entity on the canvas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Shape {
    /// Empty until the document store assigns one.
    pub id: ShapeId,
    pub position: Point,
    pub geometry: Geometry,
    pub fill: String,
    /// Rotation in degrees.
    #[serde(default)]
    pub rotation: Option<f64>,
    /// Layering key; render order is ascending `(z_index, id)`.
    #[serde(default)]
    pub z_index: f64,
    #[serde(default)]
    pub selected_by: Option<LockDescriptor>,
}

impl Shape {
    /// Create a shape of the given kind with default geometry and no id.
    pub fn new(kind: ShapeKind, position: Point) -> Self {
        Self {
            id: ShapeId::new(),
            position,
            geometry: Geometry::default_for(kind),
            fill: DEFAULT_FILL.to_string(),
            rotation: None,
            z_index: 0.0,
            selected_by: None,
        }
    }

    /// Create a rectangle.
    pub fn rectangle(position: Point, width: f64, height: f64) -> Self {
        let mut shape = Self::new(ShapeKind::Rectangle, position);
        shape.geometry = Geometry::Rectangle(Rectangle::new(width, height));
        shape
    }

    /// Create a circle.
    pub fn circle(position: Point, radius: f64) -> Self {
        let mut shape = Self::new(ShapeKind::Circle, position);
        shape.geometry = Geometry::Circle(Circle::new(radius));
        shape
    }

    /// Create a text label.
    pub fn text(position: Point, content: impl Into<String>, font_size: f64) -> Self {
        let mut shape = Self::new(ShapeKind::Text, position);
        shape.geometry = Geometry::Text(Text::new(content, font_size));
        shape
    }

    /// Set the id (builder style).
    pub fn with_id(mut self, id: impl Into<ShapeId>) -> Self {
        self.id = id.into();
        self
    }

    /// Set the z index (builder style).
    pub fn with_z(mut self, z_index: f64) -> Self {
        self.z_index = z_index;
        self
    }

    /// Set the fill (builder style).
    pub fn with_fill(mut self, fill: impl Into<String>) -> Self {
        self.fill = fill.into();
        self
    }

    pub fn kind(&self) -> ShapeKind {
        self.geometry.kind()
    }

    /// Axis-aligned bounds, treating `position` as the top-left anchor.
    pub fn bounds(&self) -> Rect {
        Rect::from_origin_size(self.position, self.geometry.size())
    }

    /// Id of the client holding the soft lock, if any.
    pub fn owner(&self) -> Option<&str> {
        self.selected_by.as_ref().map(|d| d.user_id.as_str())
    }

    /// Whether a client other than `client_id` holds the lock.
    pub fn is_locked_by_other(&self, client_id: &str) -> bool {
        self.owner().is_some_and(|owner| owner != client_id)
    }

    /// Merge a partial patch into this shape.
    ///
    /// A kind change resets the geometry to the new kind's defaults before
    /// the patch's geometry fields are applied. Explicit nulls on geometry
    /// fields fall back to zero-equivalents; fields that do not apply to the
    /// current kind are ignored.
    pub fn apply_patch(&mut self, patch: &ShapePatch) {
        if let Some(kind) = patch.kind {
            if kind != self.kind() {
                self.geometry = Geometry::default_for(kind);
            }
        }
        if let Some(x) = patch.x {
            self.position.x = x;
        }
        if let Some(y) = patch.y {
            self.position.y = y;
        }
        match &mut self.geometry {
            Geometry::Rectangle(rect) => {
                if let Some(width) = patch.width {
                    rect.width = width.unwrap_or(0.0);
                }
                if let Some(height) = patch.height {
                    rect.height = height.unwrap_or(0.0);
                }
            }
            Geometry::Circle(circle) => {
                if let Some(radius) = patch.radius {
                    circle.radius = radius.unwrap_or(0.0);
                }
            }
            Geometry::Text(text) => {
                if let Some(content) = &patch.text {
                    text.content = content.clone().unwrap_or_default();
                }
                if let Some(font_size) = patch.font_size {
                    text.font_size = font_size.unwrap_or(DEFAULT_FONT_SIZE);
                }
            }
        }
        if let Some(fill) = &patch.fill {
            self.fill = fill.clone();
        }
        if let Some(rotation) = patch.rotation {
            self.rotation = rotation;
        }
        if let Some(z_index) = patch.z_index {
            self.z_index = z_index;
        }
        if let Some(selected_by) = &patch.selected_by {
            self.selected_by = selected_by.clone();
        }
    }
}
