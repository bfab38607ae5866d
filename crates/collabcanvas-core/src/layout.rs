//! Grid auto-layout for a multi-selection.

use crate::shapes::{Shape, ShapeId};
use kurbo::{Point, Rect};

/// Gap between cells as a fraction of the average shape width.
const SPACING_RATIO: f64 = 0.3;

fn union(rects: impl Iterator<Item = Rect>) -> Option<Rect> {
    rects.reduce(|acc, r| acc.union(r))
}

/// Arrange `shapes` in a near-square grid centered where they were.
///
/// Shapes are placed row by row in the given order with `ceil(sqrt(n))`
/// columns. Each row is as tall as its tallest shape. Fewer than two shapes
/// are returned where they are.
pub fn auto_layout(shapes: &[&Shape]) -> Vec<(ShapeId, Point)> {
    if shapes.len() < 2 {
        return shapes.iter().map(|s| (s.id.clone(), s.position)).collect();
    }
    let Some(original) = union(shapes.iter().map(|s| s.bounds())) else {
        return Vec::new();
    };

    let sizes: Vec<_> = shapes.iter().map(|s| s.geometry.size()).collect();
    let average_width = sizes.iter().map(|s| s.width).sum::<f64>() / shapes.len() as f64;
    let spacing = average_width * SPACING_RATIO;
    let columns = (shapes.len() as f64).sqrt().ceil().max(1.0) as usize;

    let mut cells = Vec::with_capacity(shapes.len());
    let (mut x, mut y, mut row_height) = (0.0_f64, 0.0_f64, 0.0_f64);
    for (i, size) in sizes.iter().enumerate() {
        cells.push(Rect::from_origin_size(Point::new(x, y), *size));
        row_height = row_height.max(size.height);
        x += size.width + spacing;
        if (i + 1) % columns == 0 {
            x = 0.0;
            y += row_height + spacing;
            row_height = 0.0;
        }
    }

    let Some(grid) = union(cells.iter().copied()) else {
        return Vec::new();
    };
    let offset = original.center() - grid.center();
    shapes
        .iter()
        .zip(cells)
        .map(|(shape, cell)| (shape.id.clone(), cell.origin() + offset))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_shape_stays_put() {
        let shape = Shape::rectangle(Point::new(100.0, 100.0), 50.0, 50.0).with_id("1");
        assert_eq!(auto_layout(&[&shape]), vec![("1".to_string(), Point::new(100.0, 100.0))]);
        assert!(auto_layout(&[]).is_empty());
    }

    #[test]
    fn test_four_squares_form_two_by_two_grid() {
        let shapes: Vec<Shape> = (1..=4)
            .map(|i| Shape::rectangle(Point::ZERO, 100.0, 100.0).with_id(i.to_string()))
            .collect();
        let refs: Vec<&Shape> = shapes.iter().collect();
        let result = auto_layout(&refs);

        // Grid is 230x230 centered on the original (50, 50).
        let expected = [(-65.0, -65.0), (65.0, -65.0), (-65.0, 65.0), (65.0, 65.0)];
        for ((id, pos), (i, (ex, ey))) in result.iter().zip(expected.iter().enumerate()) {
            assert_eq!(id, &(i + 1).to_string());
            assert!((pos.x - ex).abs() < 1e-9, "x for {}: {}", id, pos.x);
            assert!((pos.y - ey).abs() < 1e-9, "y for {}: {}", id, pos.y);
        }
    }

    #[test]
    fn test_row_height_is_tallest_in_row() {
        let a = Shape::rectangle(Point::ZERO, 10.0, 40.0).with_id("a");
        let b = Shape::rectangle(Point::ZERO, 10.0, 10.0).with_id("b");
        let c = Shape::rectangle(Point::ZERO, 10.0, 10.0).with_id("c");
        let result = auto_layout(&[&a, &b, &c]);
        // Two columns; spacing = 3; the second row starts 40 + 3 below the first.
        assert!((result[2].1.y - result[0].1.y - 43.0).abs() < 1e-9);
        assert!((result[1].1.x - result[0].1.x - 13.0).abs() < 1e-9);
    }

    #[test]
    fn test_mixed_kinds_keep_order() {
        let circle = Shape::circle(Point::ZERO, 50.0).with_id("1");
        let text = Shape::text(Point::ZERO, "Hello", 18.0).with_id("2");
        let result = auto_layout(&[&circle, &text]);
        assert_eq!(result[0].0, "1");
        assert_eq!(result[1].0, "2");
    }
}
