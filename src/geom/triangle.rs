use serde::{Deserialize, Serialize};

use crate::{Point, Vector};

/// A planar triangle, the unit of light emission and reflection.
///
/// Vertex order defines the facing side: the normal is `(p1 - p0) x (p2 - p0)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Triangle {
    pub pts: [Point; 3],
}

impl Triangle {
    pub fn new(p0: Point, p1: Point, p2: Point) -> Self {
        Self { pts: [p0, p1, p2] }
    }

    pub fn centroid(&self) -> Point {
        let [a, b, c] = self.pts;
        Point::new(
            (a.x + b.x + c.x) / 3.0,
            (a.y + b.y + c.y) / 3.0,
            (a.z + b.z + c.z) / 3.0,
        )
    }

    pub fn area(&self) -> f64 {
        let [a, b, c] = self.pts;
        0.5 * Vector::from_points(a, b)
            .cross(Vector::from_points(a, c))
            .length()
    }

    /// Unit normal, or `None` for degenerate (collinear) triangles.
    pub fn normal(&self) -> Option<Vector> {
        let [a, b, c] = self.pts;
        Vector::normal(a, b, c)
    }

    /// Splits the triangle into four by connecting edge midpoints.
    ///
    /// All children keep the parent's winding (and thus its normal).
    pub fn subdivide(&self) -> [Triangle; 4] {
        let [a, b, c] = self.pts;
        let ab = a.lerp(b, 0.5);
        let bc = b.lerp(c, 0.5);
        let ca = c.lerp(a, 0.5);
        [
            Triangle::new(a, ab, ca),
            Triangle::new(ab, b, bc),
            Triangle::new(ca, bc, c),
            Triangle::new(ab, bc, ca),
        ]
    }
}
