//! Z-order assignment.
//!
//! Every shape carries a floating-point `z_index`; rendering sorts ascending
//! with the id as tie-break. Reordering only ever rewrites the selected
//! shapes: front/back moves use integers past the current extreme, and
//! forward/backward moves land in the gap just past the nearest unselected
//! neighbor. Repeated gap splitting loses precision, so [`renormalize`]
//! renumbers everything to integers once the gaps get too small.

use crate::canvas::CanvasDocument;
use crate::shapes::ShapeId;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Direction of a layering command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReorderDirection {
    ToFront,
    Forward,
    Backward,
    ToBack,
}

/// New z value for one shape.
pub type ZAssignment = (ShapeId, f64);

/// Compute new z values for `ids` without touching the document.
///
/// Unknown ids are ignored; duplicates count once.
pub fn plan(doc: &CanvasDocument, ids: &[ShapeId], direction: ReorderDirection) -> Vec<ZAssignment> {
    let mut seen = HashSet::new();
    let mut selected: Vec<(ShapeId, f64)> = ids
        .iter()
        .filter(|id| seen.insert(id.as_str()))
        .filter_map(|id| doc.get(id).map(|s| (id.clone(), s.z_index)))
        .collect();
    if selected.is_empty() {
        return Vec::new();
    }
    sort_by_layer(&mut selected);

    match direction {
        ReorderDirection::ToFront => {
            let max = doc.max_z().unwrap_or(0.0);
            selected
                .into_iter()
                .enumerate()
                .map(|(i, (id, _))| (id, max + 1.0 + i as f64))
                .collect()
        }
        ReorderDirection::ToBack => {
            let min = doc.min_z().unwrap_or(0.0);
            let n = selected.len() as f64;
            selected
                .into_iter()
                .enumerate()
                .map(|(i, (id, _))| (id, min - n + i as f64))
                .collect()
        }
        ReorderDirection::Forward => step(doc, selected, true),
        ReorderDirection::Backward => step(doc, selected, false),
    }
}

/// Shapes moving into the same gap.
struct Gap {
    neighbor: f64,
    beyond: Option<f64>,
    members: Vec<(ShapeId, f64)>,
}

fn step(doc: &CanvasDocument, selected: Vec<(ShapeId, f64)>, forward: bool) -> Vec<ZAssignment> {
    let selected_ids: HashSet<&str> = selected.iter().map(|(id, _)| id.as_str()).collect();
    let mut others: Vec<f64> = doc
        .shapes()
        .filter(|s| !selected_ids.contains(s.id.as_str()))
        .map(|s| s.z_index)
        .collect();
    others.sort_by(f64::total_cmp);
    others.dedup();

    let mut result = Vec::with_capacity(selected.len());
    let mut gaps: Vec<Gap> = Vec::new();

    for (id, z) in selected {
        let (neighbor, beyond) = if forward {
            let mut above = others.iter().copied().filter(|&v| v > z);
            (above.next(), above.next())
        } else {
            let mut below = others.iter().rev().copied().filter(|&v| v < z);
            (below.next(), below.next())
        };
        match neighbor {
            None => {
                // Already at the extreme; nudge one step.
                let delta = if forward { 1.0 } else { -1.0 };
                result.push((id, z + delta));
            }
            Some(neighbor) => match gaps.iter_mut().find(|g| g.neighbor == neighbor) {
                Some(gap) => gap.members.push((id, z)),
                None => gaps.push(Gap {
                    neighbor,
                    beyond,
                    members: vec![(id, z)],
                }),
            },
        }
    }

    for gap in gaps {
        let m = gap.members.len();
        for (k, (id, _)) in gap.members.into_iter().enumerate() {
            let z = match gap.beyond {
                Some(beyond) => {
                    let t = (k + 1) as f64 / (m + 1) as f64;
                    if forward {
                        gap.neighbor + (beyond - gap.neighbor) * t
                    } else {
                        beyond + (gap.neighbor - beyond) * t
                    }
                }
                None if forward => gap.neighbor + (k + 1) as f64,
                None => gap.neighbor - (m - k) as f64,
            };
            result.push((id, z));
        }
    }
    result
}

fn sort_by_layer(items: &mut [(ShapeId, f64)]) {
    items.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
}

/// Smallest gap between adjacent distinct z values, if there are at least two.
pub fn min_gap(doc: &CanvasDocument) -> Option<f64> {
    let mut values: Vec<f64> = doc.shapes().map(|s| s.z_index).collect();
    values.sort_by(f64::total_cmp);
    values.dedup();
    values
        .windows(2)
        .map(|w| w[1] - w[0])
        .min_by(f64::total_cmp)
}

/// Whether precision has degraded enough to warrant renormalizing.
pub fn needs_renormalize(doc: &CanvasDocument, min_layer_gap: f64) -> bool {
    min_gap(doc).is_some_and(|gap| gap < min_layer_gap)
}

/// Renumber every shape to consecutive integers in render order.
///
/// Returns only the shapes whose z value changes.
pub fn renormalize(doc: &CanvasDocument) -> Vec<ZAssignment> {
    doc.shapes_ordered()
        .enumerate()
        .filter(|(i, s)| s.z_index != *i as f64)
        .map(|(i, s)| (s.id.clone(), i as f64))
        .collect()
}
