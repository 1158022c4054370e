//! Dense patch ids for light transport.
//!
//! Every triangle of every surface gets a zero-based id in scene traversal
//! order. Ids index the form-factor matrix and are what the render device
//! writes into pixels, so they must stay strictly below [`BACKGROUND_ID`].

use std::fmt;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::scene::{Rgb, Scene};
use crate::{Point, UID, Vector};

use super::error::RadiosityError;

/// Decoded pixel value meaning "no patch" (energy escaped the scene).
pub const BACKGROUND_ID: u32 = 0x00FF_FFFF;

/// Largest number of patches an id space below the sentinel can address.
pub const MAX_PATCHES: usize = BACKGROUND_ID as usize;

/// A registered light-transport patch.
#[derive(Debug, Clone)]
pub struct Patch {
    pub id: u32,
    /// Index of the owning surface in the scene.
    pub surface_index: usize,
    /// Index of the triangle within the owning surface.
    pub local_index: usize,
    pub vertices: [Point; 3],
    pub centroid: Point,
    /// Unit normal, `None` for degenerate triangles.
    pub normal: Option<Vector>,
    pub area: f64,
    pub reflectance: Rgb,
    pub emission: Rgb,
}

/// Identity of the geometry a form-factor matrix was sampled from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GeometryFingerprint {
    pub patch_count: u64,
    pub geometry_hash: u64,
}

impl fmt::Display for GeometryFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} patches / {:016x}",
            self.patch_count, self.geometry_hash
        )
    }
}

/// Id assignment for one scene load.
pub struct PatchRegistry {
    patches: Vec<Patch>,
    surface_uids: Vec<UID>,
    capacity: usize,
}

impl PatchRegistry {
    /// Walks surfaces in order and numbers their patches 0, 1, 2, ...
    ///
    /// `capacity` is the session's matrix ceiling; it is clamped to
    /// [`MAX_PATCHES`] so the background sentinel is never assigned.
    pub fn assign_ids(scene: &Scene, capacity: usize) -> Result<Self> {
        let capacity = capacity.min(MAX_PATCHES);
        let count = scene.patch_count();
        if count > capacity {
            return Err(RadiosityError::PatchCapacityExceeded { count, capacity }.into());
        }

        let mut patches = Vec::with_capacity(count);
        let mut surface_uids = Vec::with_capacity(scene.surfaces().len());
        let mut next_id: u32 = 0;

        for (surface_index, surface) in scene.surfaces().iter().enumerate() {
            surface_uids.push(surface.uid.clone());
            for (local_index, tri) in surface.patches.iter().enumerate() {
                patches.push(Patch {
                    id: next_id,
                    surface_index,
                    local_index,
                    vertices: tri.pts,
                    centroid: tri.centroid(),
                    normal: tri.normal(),
                    area: tri.area(),
                    reflectance: surface.reflectance,
                    emission: surface.emission,
                });
                next_id += 1;
            }
        }

        log::info!(
            "Registered {} patches on {} surfaces (capacity {})",
            patches.len(),
            surface_uids.len(),
            capacity
        );

        Ok(Self {
            patches,
            surface_uids,
            capacity,
        })
    }

    pub fn len(&self) -> usize {
        self.patches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patches.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn patches(&self) -> &[Patch] {
        &self.patches
    }

    pub fn patch(&self, id: u32) -> Option<&Patch> {
        self.patches.get(id as usize)
    }

    /// UID of the surface owning patch `id`.
    pub fn owner_of(&self, id: u32) -> Option<&UID> {
        let patch = self.patch(id)?;
        self.surface_uids.get(patch.surface_index)
    }

    /// (surface index, triangle index within the surface) of patch `id`.
    pub fn locate(&self, id: u32) -> Option<(usize, usize)> {
        self.patch(id).map(|p| (p.surface_index, p.local_index))
    }

    pub fn surface_uids(&self) -> &[UID] {
        &self.surface_uids
    }

    pub fn reflectance(&self, channel: usize) -> Vec<f64> {
        self.patches.iter().map(|p| p.reflectance[channel]).collect()
    }

    pub fn emission(&self, channel: usize) -> Vec<f64> {
        self.patches.iter().map(|p| p.emission[channel]).collect()
    }

    pub fn areas(&self) -> Vec<f64> {
        self.patches.iter().map(|p| p.area).collect()
    }

    /// FNV-1a over the vertex coordinates in id order.
    pub fn fingerprint(&self) -> GeometryFingerprint {
        const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
        const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

        let mut hash = FNV_OFFSET;
        for patch in &self.patches {
            for p in &patch.vertices {
                for coord in [p.x, p.y, p.z] {
                    for byte in coord.to_bits().to_le_bytes() {
                        hash ^= byte as u64;
                        hash = hash.wrapping_mul(FNV_PRIME);
                    }
                }
            }
        }

        GeometryFingerprint {
            patch_count: self.patches.len() as u64,
            geometry_hash: hash,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::{Surface, cornell_box};
    use std::collections::HashSet;

    fn floor(subdivisions: usize) -> Surface {
        Surface::rectangle(
            "floor",
            Point::new(0., 0., 0.),
            Vector::new(1., 0., 0.),
            Vector::new(0., 1., 0.),
            [0.5; 3],
            [0.0; 3],
        )
        .unwrap()
        .subdivided(subdivisions)
    }

    #[test]
    fn test_ids_dense_and_distinct() -> Result<()> {
        let scene = cornell_box(1)?;
        let reg = PatchRegistry::assign_ids(&scene, 100_000)?;
        let n = reg.len();
        assert_eq!(n, scene.patch_count());

        let ids: HashSet<u32> = reg.patches().iter().map(|p| p.id).collect();
        assert_eq!(ids.len(), n);
        assert!(ids.iter().all(|&id| (id as usize) < n));
        assert!(!ids.contains(&BACKGROUND_ID));
        Ok(())
    }

    #[test]
    fn test_capacity_exceeded() {
        let scene = Scene::new(vec![floor(2)]); // 32 patches
        let err = PatchRegistry::assign_ids(&scene, 16).err().unwrap();
        assert_eq!(
            err.downcast_ref::<RadiosityError>(),
            Some(&RadiosityError::PatchCapacityExceeded {
                count: 32,
                capacity: 16
            })
        );
    }

    #[test]
    fn test_capacity_clamped_below_sentinel() -> Result<()> {
        let scene = Scene::new(vec![floor(0)]);
        let reg = PatchRegistry::assign_ids(&scene, usize::MAX)?;
        assert_eq!(reg.capacity(), MAX_PATCHES);
        assert!((reg.capacity() as u64) <= BACKGROUND_ID as u64);
        Ok(())
    }

    #[test]
    fn test_owner_of() -> Result<()> {
        let a = floor(0);
        let b = floor(1);
        let (uid_a, uid_b) = (a.uid.clone(), b.uid.clone());
        let scene = Scene::new(vec![a, b]);
        let reg = PatchRegistry::assign_ids(&scene, 1000)?;

        assert_eq!(reg.owner_of(0), Some(&uid_a));
        assert_eq!(reg.owner_of(1), Some(&uid_a));
        assert_eq!(reg.owner_of(2), Some(&uid_b));
        assert_eq!(reg.locate(5), Some((1, 3)));
        assert_eq!(reg.owner_of(10), None);
        assert_eq!(reg.owner_of(BACKGROUND_ID), None);
        Ok(())
    }

    #[test]
    fn test_fingerprint_tracks_geometry() -> Result<()> {
        let scene = cornell_box(0)?;
        let f1 = PatchRegistry::assign_ids(&scene, 1000)?.fingerprint();
        let f2 = PatchRegistry::assign_ids(&scene, 1000)?.fingerprint();
        assert_eq!(f1, f2);

        let mut moved = scene.clone();
        moved.surfaces_mut()[0].patches[0].pts[0].x += 1e-6;
        let f3 = PatchRegistry::assign_ids(&moved, 1000)?.fingerprint();
        assert_eq!(f1.patch_count, f3.patch_count);
        assert_ne!(f1, f3);
        Ok(())
    }
}
