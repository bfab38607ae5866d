//! Conversion between shapes and flat remote documents.
//!
//! Remote documents are plain JSON objects. Writes are merges: a key that is
//! absent leaves the stored value alone, while an explicit `null` clears it.
//! Reads are lenient since any client can write anything: missing, NaN, or
//! wrongly-typed numbers read as zero and unknown kinds as rectangles.

use super::DocFields;
use crate::scheduler::{LockField, ShapeWrite};
use crate::shapes::{Geometry, LockDescriptor, Shape, ShapeId, ShapeKind, ShapePatch, DEFAULT_FILL};
use serde_json::Value;

pub const KEY_TYPE: &str = "type";
pub const KEY_X: &str = "x";
pub const KEY_Y: &str = "y";
pub const KEY_WIDTH: &str = "width";
pub const KEY_HEIGHT: &str = "height";
pub const KEY_RADIUS: &str = "radius";
pub const KEY_TEXT: &str = "text";
pub const KEY_FONT_SIZE: &str = "fontSize";
pub const KEY_FILL: &str = "fill";
pub const KEY_ROTATION: &str = "rotation";
pub const KEY_Z_INDEX: &str = "zIndex";
pub const KEY_SELECTED_BY: &str = "selectedBy";
/// Assigned by the remote store on every write.
pub const KEY_UPDATED_AT: &str = "updatedAt";

fn number(value: f64) -> Value {
    serde_json::Number::from_f64(value)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

fn optional_number(value: Option<f64>) -> Value {
    value.map(number).unwrap_or(Value::Null)
}

/// Lenient number read: anything that is not a finite number is zero.
fn get_double(value: &Value) -> f64 {
    value.as_f64().filter(|v| v.is_finite()).unwrap_or(0.0)
}

/// Nullable number read: `null` clears, garbage reads as zero.
fn get_optional_double(value: &Value) -> Option<f64> {
    match value {
        Value::Null => None,
        other => Some(get_double(other)),
    }
}

/// Flatten a shape into document fields.
///
/// Every field that does not apply to the shape's kind is written as an
/// explicit `null` so a kind change clears stale geometry. `selectedBy` is
/// only included when the write asserts the lock.
pub fn shape_to_fields(shape: &Shape, lock: LockField) -> DocFields {
    let mut fields = DocFields::new();
    fields.insert(KEY_TYPE.into(), Value::from(shape.kind().as_str()));
    fields.insert(KEY_X.into(), number(shape.position.x));
    fields.insert(KEY_Y.into(), number(shape.position.y));

    let (mut width, mut height, mut radius) = (None, None, None);
    let (mut text, mut font_size) = (Value::Null, None);
    match &shape.geometry {
        Geometry::Rectangle(r) => {
            width = Some(r.width);
            height = Some(r.height);
        }
        Geometry::Circle(c) => radius = Some(c.radius),
        Geometry::Text(t) => {
            text = Value::from(t.content.clone());
            font_size = Some(t.font_size);
        }
    }
    fields.insert(KEY_WIDTH.into(), optional_number(width));
    fields.insert(KEY_HEIGHT.into(), optional_number(height));
    fields.insert(KEY_RADIUS.into(), optional_number(radius));
    fields.insert(KEY_TEXT.into(), text);
    fields.insert(KEY_FONT_SIZE.into(), optional_number(font_size));

    fields.insert(KEY_FILL.into(), Value::from(shape.fill.clone()));
    fields.insert(KEY_ROTATION.into(), optional_number(shape.rotation));
    fields.insert(KEY_Z_INDEX.into(), number(shape.z_index));

    if lock == LockField::Assert {
        let owner = shape
            .selected_by
            .as_ref()
            .and_then(|d| serde_json::to_value(d).ok())
            .unwrap_or(Value::Null);
        fields.insert(KEY_SELECTED_BY.into(), owner);
    }
    fields
}

/// Fields for a scheduled write.
pub fn write_to_fields(write: &ShapeWrite) -> DocFields {
    shape_to_fields(&write.shape, write.lock)
}

/// Read the fields present in a remote document as a patch.
pub fn patch_from_fields(fields: &DocFields) -> ShapePatch {
    let mut patch = ShapePatch::default();
    for (key, value) in fields {
        match key.as_str() {
            KEY_TYPE => {
                let kind = value.as_str().and_then(ShapeKind::parse);
                if kind.is_none() {
                    log::warn!("Unknown shape kind {}, reading as rectangle", value);
                }
                patch.kind = Some(kind.unwrap_or_default());
            }
            KEY_X => patch.x = Some(get_double(value)),
            KEY_Y => patch.y = Some(get_double(value)),
            KEY_WIDTH => patch.width = Some(get_optional_double(value)),
            KEY_HEIGHT => patch.height = Some(get_optional_double(value)),
            KEY_RADIUS => patch.radius = Some(get_optional_double(value)),
            KEY_TEXT => {
                patch.text = Some(match value {
                    Value::Null => None,
                    Value::String(s) => Some(s.clone()),
                    other => Some(other.to_string()),
                })
            }
            KEY_FONT_SIZE => patch.font_size = Some(get_optional_double(value)),
            KEY_FILL => {
                patch.fill = Some(value.as_str().unwrap_or(DEFAULT_FILL).to_string());
            }
            KEY_ROTATION => patch.rotation = Some(get_optional_double(value)),
            KEY_Z_INDEX => patch.z_index = Some(get_double(value)),
            KEY_SELECTED_BY => {
                let owner = match value {
                    Value::Null => None,
                    other => match serde_json::from_value::<LockDescriptor>(other.clone()) {
                        Ok(owner) => Some(owner),
                        Err(e) => {
                            log::warn!("Malformed selectedBy ({}), treating as unlocked", e);
                            None
                        }
                    },
                };
                patch.selected_by = Some(owner);
            }
            _ => {}
        }
    }
    patch
}

/// Build a whole shape from a remote document.
pub fn shape_from_fields(id: impl Into<ShapeId>, fields: &DocFields) -> Shape {
    let mut shape = Shape::new(ShapeKind::default(), kurbo::Point::ZERO).with_id(id);
    shape.apply_patch(&patch_from_fields(fields));
    shape
}

/// Merge-write `incoming` over `stored`.
pub fn merge_fields(stored: &mut DocFields, incoming: DocFields) {
    for (key, value) in incoming {
        stored.insert(key, value);
    }
}
