//! Static scene description: surfaces owning triangle patches.
//!
//! A surface carries the optical properties shared by all of its patches and,
//! after a radiosity run, the published per-patch exitance.

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::geom::triangle::Triangle;
use crate::{Point, UID, Vector};

/// RGB triplet (reflectance, emission or exitance per channel).
pub type Rgb = [f64; 3];

/// A light-transport surface made of triangle patches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Surface {
    pub name: String,
    pub uid: UID,
    pub patches: Vec<Triangle>,
    /// Diffuse reflectance per channel, in [0, 1).
    pub reflectance: Rgb,
    /// Emitted exitance per channel.
    pub emission: Rgb,
    /// Solved exitance per patch (same order as `patches`), empty until published.
    pub exitance: Vec<Rgb>,
}

impl Surface {
    pub fn new(name: &str, patches: Vec<Triangle>, reflectance: Rgb, emission: Rgb) -> Result<Self> {
        for (c, r) in reflectance.iter().enumerate() {
            anyhow::ensure!(
                (0.0..1.0).contains(r),
                "Surface {name}: reflectance[{c}] = {r} must be in [0, 1)"
            );
        }
        for (c, e) in emission.iter().enumerate() {
            anyhow::ensure!(
                e.is_finite() && *e >= 0.0,
                "Surface {name}: emission[{c}] = {e} must be finite and >= 0"
            );
        }
        Ok(Self {
            name: name.to_string(),
            uid: UID::new(),
            patches,
            reflectance,
            emission,
            exitance: Vec::new(),
        })
    }

    /// Creates a rectangular surface spanned by `edge_u` and `edge_v` from `corner`.
    ///
    /// The facing side is `edge_u x edge_v`.
    pub fn rectangle(
        name: &str,
        corner: Point,
        edge_u: Vector,
        edge_v: Vector,
        reflectance: Rgb,
        emission: Rgb,
    ) -> Result<Self> {
        Self::new(
            name,
            rectangle_patches(corner, edge_u, edge_v).to_vec(),
            reflectance,
            emission,
        )
    }

    /// Returns a copy where every patch is split `levels` times (4^levels children each).
    pub fn subdivided(mut self, levels: usize) -> Self {
        for _ in 0..levels {
            self.patches = self.patches.iter().flat_map(|t| t.subdivide()).collect();
        }
        self.exitance.clear();
        self
    }

    pub fn area(&self) -> f64 {
        self.patches.iter().map(|t| t.area()).sum()
    }

    /// Area-weighted mean of the published exitance, if any.
    pub fn mean_exitance(&self) -> Option<Rgb> {
        if self.exitance.len() != self.patches.len() || self.patches.is_empty() {
            return None;
        }
        let total_area = self.area();
        if total_area <= 0.0 {
            return None;
        }
        let mut mean = [0.0; 3];
        for (tri, e) in self.patches.iter().zip(&self.exitance) {
            let a = tri.area();
            for c in 0..3 {
                mean[c] += e[c] * a;
            }
        }
        Some(mean.map(|m| m / total_area))
    }
}

/// Two triangles covering the parallelogram `corner`, `corner + u`, `corner + u + v`, `corner + v`.
pub fn rectangle_patches(corner: Point, edge_u: Vector, edge_v: Vector) -> [Triangle; 2] {
    let p0 = corner;
    let p1 = corner + edge_u;
    let p2 = corner + edge_u + edge_v;
    let p3 = corner + edge_v;
    [Triangle::new(p0, p1, p2), Triangle::new(p0, p2, p3)]
}

/// Ordered collection of surfaces.
///
/// Surface order is the traversal order used when patch ids are assigned.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Scene {
    surfaces: Vec<Surface>,
}

impl Scene {
    pub fn new(surfaces: Vec<Surface>) -> Self {
        Self { surfaces }
    }

    pub fn add_surface(&mut self, surface: Surface) {
        self.surfaces.push(surface);
    }

    pub fn surfaces(&self) -> &[Surface] {
        &self.surfaces
    }

    pub fn surfaces_mut(&mut self) -> &mut [Surface] {
        &mut self.surfaces
    }

    pub fn surface_by_uid(&self, uid: &UID) -> Option<&Surface> {
        self.surfaces.iter().find(|s| &s.uid == uid)
    }

    pub fn surface_by_name(&self, name: &str) -> Option<&Surface> {
        self.surfaces.iter().find(|s| s.name == name)
    }

    pub fn patch_count(&self) -> usize {
        self.surfaces.iter().map(|s| s.patches.len()).sum()
    }
}

/// Closed unit box with inward-facing walls and a square light in the ceiling.
///
/// Left wall red, right wall green, everything else white. Each rectangle
/// is split `subdivisions` times.
pub fn cornell_box(subdivisions: usize) -> Result<Scene> {
    let white = [0.75, 0.75, 0.75];
    let red = [0.63, 0.06, 0.05];
    let green = [0.14, 0.45, 0.09];
    let dark = [0.0; 3];

    let x = Vector::new(1., 0., 0.);
    let y = Vector::new(0., 1., 0.);
    let z = Vector::new(0., 0., 1.);
    let o = Point::new(0., 0., 0.);

    let (lo, hi, w) = (0.35, 0.65, 0.3);
    let ceiling_patches: Vec<Triangle> = [
        (Point::new(0., 0., 1.), y, x * lo),
        (Point::new(hi, 0., 1.), y, x * lo),
        (Point::new(lo, 0., 1.), y * lo, x * w),
        (Point::new(lo, hi, 1.), y * lo, x * w),
    ]
    .into_iter()
    .flat_map(|(c, u, v)| rectangle_patches(c, u, v))
    .collect();

    let surfaces = vec![
        Surface::rectangle("floor", o, x, y, white, dark)?,
        Surface::new("ceiling", ceiling_patches, white, dark)?,
        Surface::rectangle(
            "light",
            Point::new(lo, lo, 1.),
            y * w,
            x * w,
            [0.0; 3],
            [10.0, 10.0, 10.0],
        )?,
        Surface::rectangle("left", o, y, z, red, dark)?,
        Surface::rectangle("right", Point::new(1., 0., 0.), z, y, green, dark)?,
        Surface::rectangle("back", Point::new(0., 1., 0.), x, z, white, dark)?,
        Surface::rectangle("front", o, z, x, white, dark)?,
    ];

    Ok(Scene::new(
        surfaces
            .into_iter()
            .map(|s| s.subdivided(subdivisions))
            .collect(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rectangle_faces_along_u_cross_v() -> Result<()> {
        let s = Surface::rectangle(
            "floor",
            Point::new(0., 0., 0.),
            Vector::new(2., 0., 0.),
            Vector::new(0., 3., 0.),
            [0.5; 3],
            [0.0; 3],
        )?;
        assert_eq!(s.patches.len(), 2);
        assert!((s.area() - 6.0).abs() < 1e-12);
        for t in &s.patches {
            assert!(t.normal().unwrap().is_close(&Vector::new(0., 0., 1.)));
        }
        Ok(())
    }

    #[test]
    fn test_invalid_reflectance_rejected() {
        let r = Surface::new("bad", vec![], [1.0, 0.5, 0.5], [0.0; 3]);
        assert!(r.is_err());
        let r = Surface::new("bad", vec![], [0.5; 3], [-1.0, 0.0, 0.0]);
        assert!(r.is_err());
    }

    #[test]
    fn test_subdivided_patch_count() -> Result<()> {
        let s = Surface::rectangle(
            "wall",
            Point::new(0., 0., 0.),
            Vector::new(1., 0., 0.),
            Vector::new(0., 0., 1.),
            [0.5; 3],
            [0.0; 3],
        )?
        .subdivided(2);
        assert_eq!(s.patches.len(), 2 * 16);
        assert!((s.area() - 1.0).abs() < 1e-12);
        Ok(())
    }

    #[test]
    fn test_cornell_box_normals_point_inward() -> Result<()> {
        let scene = cornell_box(0)?;
        let center = Point::new(0.5, 0.5, 0.5);
        for s in scene.surfaces() {
            for t in &s.patches {
                let n = t.normal().unwrap();
                let to_center = Vector::from_points(t.centroid(), center);
                assert!(n.dot(to_center) > 0.0, "{} faces outward", s.name);
            }
        }
        // Walls, floor and ceiling (with the light) tile the whole box.
        let total_area: f64 = scene.surfaces().iter().map(|s| s.area()).sum();
        assert!((total_area - 6.0).abs() < 1e-9);
        Ok(())
    }

    #[test]
    fn test_scene_lookup() -> Result<()> {
        let mut scene = Scene::default();
        let floor = Surface::rectangle(
            "floor",
            Point::new(0., 0., 0.),
            Vector::new(1., 0., 0.),
            Vector::new(0., 1., 0.),
            [0.5; 3],
            [0.0; 3],
        )?;
        let uid = floor.uid.clone();
        scene.add_surface(floor);
        assert_eq!(scene.patch_count(), 2);
        assert_eq!(scene.surface_by_uid(&uid).map(|s| s.name.as_str()), Some("floor"));
        assert!(scene.surface_by_name("floor").is_some());
        assert!(scene.surface_by_name("ceiling").is_none());
        Ok(())
    }

    #[test]
    fn test_mean_exitance_requires_publish() -> Result<()> {
        let mut s = Surface::rectangle(
            "floor",
            Point::new(0., 0., 0.),
            Vector::new(1., 0., 0.),
            Vector::new(0., 1., 0.),
            [0.5; 3],
            [0.0; 3],
        )?;
        assert!(s.mean_exitance().is_none());
        s.exitance = vec![[1.0, 2.0, 3.0], [3.0, 2.0, 1.0]];
        let m = s.mean_exitance().unwrap();
        assert!((m[0] - 2.0).abs() < 1e-12);
        assert!((m[1] - 2.0).abs() < 1e-12);
        Ok(())
    }
}
