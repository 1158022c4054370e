use crate::Vector;
use crate::geom::EPS;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Add;

/// Position in world space (patch vertices, hemicube eyes).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Point {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// Coordinate-wise comparison within `EPS`.
    pub fn is_close(&self, other: &Self) -> bool {
        [self.x - other.x, self.y - other.y, self.z - other.z]
            .iter()
            .all(|d| d.abs() < EPS)
    }

    /// Point at fraction `t` of the way from `self` to `other`.
    pub fn lerp(self, other: Self, t: f64) -> Self {
        self + Vector::from_points(self, other) * t
    }
}

impl fmt::Display for Point {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prec = f.precision().unwrap_or(3);
        write!(f, "({:.prec$}, {:.prec$}, {:.prec$})", self.x, self.y, self.z)
    }
}

impl Add<Vector> for Point {
    type Output = Point;
    fn add(self, v: Vector) -> Self {
        Self::new(self.x + v.dx, self.y + v.dy, self.z + v.dz)
    }
}
