use std::f64::consts::TAU;

use anyhow::Result;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::{Point, Vector};

use super::error::RadiosityError;
use super::hemicube::{HemicubeFace, HemicubeRig};
use super::registry::{Patch, PatchRegistry};
use super::render::RenderDevice;

/// Sampling direction used when a patch or query has no usable normal.
pub const DEFAULT_NORMAL: Vector = Vector {
    dx: 0.0,
    dy: 0.0,
    dz: 1.0,
};

/// The five read-back buffers of one hemicube placement.
#[derive(Debug, Clone)]
pub struct HemicubeSample {
    pub eye: Point,
    pub forward: Vector,
    pub resolution: usize,
    /// Row-major pixels in [`HemicubeFace::ALL`] order.
    pub faces: [Vec<u32>; 5],
}

impl HemicubeSample {
    pub fn face(&self, face: HemicubeFace) -> &[u32] {
        &self.faces[face.index()]
    }
}

/// Places the hemicube over patches or points and reads back what it sees.
pub struct VisibilitySampler<'a, D: RenderDevice> {
    rig: &'a mut HemicubeRig,
    device: &'a mut D,
    offset: f64,
    jitter: Option<StdRng>,
}

impl<'a, D: RenderDevice> VisibilitySampler<'a, D> {
    pub fn new(rig: &'a mut HemicubeRig, device: &'a mut D, offset: f64) -> Result<Self> {
        if !(offset.is_finite() && offset > 0.0) {
            return Err(RadiosityError::InvalidOffset(offset).into());
        }
        Ok(Self {
            rig,
            device,
            offset,
            jitter: None,
        })
    }

    /// Rotates each patch's hemicube about its normal by a seeded random angle.
    pub fn with_jitter(mut self, seed: u64) -> Self {
        self.jitter = Some(StdRng::seed_from_u64(seed));
        self
    }

    /// Samples from the patch centroid along its normal.
    pub fn sample_from_patch(
        &mut self,
        registry: &PatchRegistry,
        patch: &Patch,
    ) -> Result<HemicubeSample> {
        let forward = match patch.normal {
            Some(n) => n,
            None => {
                log::warn!(
                    "Patch {} has a degenerate normal, sampling along {}",
                    patch.id,
                    DEFAULT_NORMAL
                );
                DEFAULT_NORMAL
            }
        };

        let [a, b, _] = patch.vertices;
        let mut up = Vector::from_points(a, b);
        if up.cross(forward).normalize().is_none() {
            up = forward.any_orthogonal().unwrap_or(Vector::new(1.0, 0.0, 0.0));
        }
        if let Some(rng) = self.jitter.as_mut() {
            let angle = rng.r#gen::<f64>() * TAU;
            up = (up - forward * up.dot(forward)).rotate_about(forward, angle);
        }

        self.sample(registry, patch.centroid, forward, up)
    }

    /// Samples from an arbitrary point and direction.
    pub fn sample_from_point(
        &mut self,
        registry: &PatchRegistry,
        eye: Point,
        forward: Vector,
        up: Vector,
    ) -> Result<HemicubeSample> {
        let forward = match forward.normalize() {
            Some(f) => f,
            None => {
                log::warn!("Zero-length sampling direction at {eye}, using {DEFAULT_NORMAL}");
                DEFAULT_NORMAL
            }
        };
        self.sample(registry, eye, forward, up)
    }

    fn sample(
        &mut self,
        registry: &PatchRegistry,
        eye: Point,
        forward: Vector,
        up: Vector,
    ) -> Result<HemicubeSample> {
        self.rig.position(eye, forward, up, self.offset)?;
        self.rig.render(&mut *self.device, registry)?;
        let faces = self.rig.read_back()?;
        Ok(HemicubeSample {
            eye,
            forward,
            resolution: self.rig.resolution(),
            faces,
        })
    }
}
