//! Five-faced virtual camera cluster approximating a hemisphere.
//!
//! The front face is a full `res x res` 90 degree view along the normal; the
//! four side faces only keep their upper `res x res/2` half (the part above
//! the base plane). Each pixel carries a precomputed delta form factor:
//!
//! - front: `dA / (pi * (u^2 + v^2 + 1)^2)`
//! - side:  `dA * n / (pi * (u^2 + n^2 + 1)^2)`
//!
//! with `dA = 4 / res^2` for a hemicube of half-side 1. Summed over all five
//! faces the weights integrate the cosine-weighted hemisphere to 1.

use std::cell::Cell;
use std::f64::consts::PI;
use std::marker::PhantomData;
use std::sync::Arc;

use anyhow::Result;

use crate::{Point, Vector};

use super::config::RadiosityConfig;
use super::error::RadiosityError;
use super::registry::PatchRegistry;
use super::render::{FaceCamera, FaceWindow, PixelBuffer, RenderDevice};

thread_local! {
    static RIG_ALIVE: Cell<bool> = const { Cell::new(false) };
}

/// One of the five hemicube faces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HemicubeFace {
    Front,
    Top,
    Right,
    Bottom,
    Left,
}

impl HemicubeFace {
    pub const ALL: [HemicubeFace; 5] = [
        HemicubeFace::Front,
        HemicubeFace::Top,
        HemicubeFace::Right,
        HemicubeFace::Bottom,
        HemicubeFace::Left,
    ];

    pub fn index(self) -> usize {
        match self {
            HemicubeFace::Front => 0,
            HemicubeFace::Top => 1,
            HemicubeFace::Right => 2,
            HemicubeFace::Bottom => 3,
            HemicubeFace::Left => 4,
        }
    }

    pub fn is_side(self) -> bool {
        self != HemicubeFace::Front
    }
}

/// Per-pixel delta form factors for one resolution. Immutable once built.
#[derive(Debug, Clone)]
pub struct WeightTables {
    resolution: usize,
    /// `res x res`, row-major.
    front: Vec<f64>,
    /// `res/2 x res`, row-major, row 0 adjacent to the front face.
    side: Vec<f64>,
}

impl WeightTables {
    pub fn new(resolution: usize) -> Result<Self> {
        if resolution == 0 || resolution % 2 != 0 {
            return Err(RadiosityError::InvalidResolution(resolution).into());
        }
        let res = resolution as f64;
        let half = resolution / 2;
        let d_a = 4.0 / (res * res);
        let coord = |i: usize| (i as f64 + 0.5) * 2.0 / res - 1.0;

        let mut front = Vec::with_capacity(resolution * resolution);
        for row in 0..resolution {
            let v = coord(row);
            for col in 0..resolution {
                let u = coord(col);
                let c = u * u + v * v + 1.0;
                front.push(d_a / (PI * c * c));
            }
        }

        let mut side = Vec::with_capacity(half * resolution);
        for row in 0..half {
            let n = 1.0 - (row as f64 + 0.5) / half as f64;
            for col in 0..resolution {
                let u = coord(col);
                let c = u * u + n * n + 1.0;
                side.push(d_a * n / (PI * c * c));
            }
        }

        Ok(Self {
            resolution,
            front,
            side,
        })
    }

    pub fn resolution(&self) -> usize {
        self.resolution
    }

    pub fn front(&self) -> &[f64] {
        &self.front
    }

    pub fn side(&self) -> &[f64] {
        &self.side
    }

    /// Weight table matching the pixel layout of `face`.
    pub fn for_face(&self, face: HemicubeFace) -> &[f64] {
        if face.is_side() { &self.side } else { &self.front }
    }

    /// Sum over the whole hemicube; approaches 1 as resolution grows.
    pub fn total(&self) -> f64 {
        self.front.iter().sum::<f64>() + 4.0 * self.side.iter().sum::<f64>()
    }
}

/// The single, repositionable hemicube of a sampling session.
///
/// At most one rig may be alive per thread (the render-device thread), and it
/// cannot leave that thread. Construction fails with
/// [`RadiosityError::RigInUse`] while another rig is alive.
pub struct HemicubeRig {
    side_length: f64,
    near: f64,
    far: f64,
    weights: Arc<WeightTables>,
    buffers: [PixelBuffer; 5],
    cameras: Option<[FaceCamera; 5]>,
    _device_thread: PhantomData<*const ()>,
}

impl HemicubeRig {
    pub fn new(side_length: f64, resolution: usize, near: f64, far: f64) -> Result<Self> {
        let weights = Arc::new(WeightTables::new(resolution)?);
        anyhow::ensure!(
            near > 0.0 && near < far,
            "Clip range must satisfy 0 < near < far (near = {near}, far = {far})"
        );

        let already_alive = RIG_ALIVE.with(|alive| alive.replace(true));
        if already_alive {
            return Err(RadiosityError::RigInUse.into());
        }

        let half = resolution / 2;
        let buffers = HemicubeFace::ALL.map(|face| {
            if face.is_side() {
                PixelBuffer::new(resolution, half)
            } else {
                PixelBuffer::new(resolution, resolution)
            }
        });

        Ok(Self {
            side_length,
            near,
            far,
            weights,
            buffers,
            cameras: None,
            _device_thread: PhantomData,
        })
    }

    pub fn from_config(config: &RadiosityConfig) -> Result<Self> {
        Self::new(config.side_length, config.resolution, config.near, config.far)
    }

    pub fn resolution(&self) -> usize {
        self.weights.resolution()
    }

    pub fn side_length(&self) -> f64 {
        self.side_length
    }

    /// Shared handle to the weight tables (safe to move to a worker thread).
    pub fn weights(&self) -> Arc<WeightTables> {
        Arc::clone(&self.weights)
    }

    /// Orients the five faces over `eye`, front looking along `forward`.
    ///
    /// The eye is pushed `offset` along `forward` to avoid self-intersection.
    /// `up` only needs to be non-parallel to `forward`; it is re-orthogonalized.
    pub fn position(&mut self, eye: Point, forward: Vector, up: Vector, offset: f64) -> Result<()> {
        if !(offset.is_finite() && offset > 0.0) {
            return Err(RadiosityError::InvalidOffset(offset).into());
        }
        let Some(forward) = forward.normalize() else {
            anyhow::bail!("Hemicube forward direction has zero length");
        };
        let up = (up - forward * up.dot(forward))
            .normalize()
            .or_else(|| forward.any_orthogonal())
            .ok_or_else(|| anyhow::anyhow!("No up direction orthogonal to {forward}"))?;
        let right = forward.cross(up);
        let eye = eye + forward * offset;
        let res = self.resolution();

        let front = FaceCamera {
            eye,
            forward,
            up,
            right,
            near: self.near,
            far: self.far,
            window: FaceWindow::FULL,
            width: res,
            height: res,
        };
        let side = |look: Vector| FaceCamera {
            eye,
            forward: look,
            up: forward,
            right: look.cross(forward),
            near: self.near,
            far: self.far,
            window: FaceWindow::UPPER_HALF,
            width: res,
            height: res / 2,
        };

        self.cameras = Some([front, side(up), side(right), side(-up), side(-right)]);
        Ok(())
    }

    pub fn camera(&self, face: HemicubeFace) -> Option<&FaceCamera> {
        self.cameras.as_ref().map(|c| &c[face.index()])
    }

    /// Renders all five faces with patch-id shading.
    pub fn render<D: RenderDevice>(&mut self, device: &mut D, patches: &PatchRegistry) -> Result<()> {
        let Some(cameras) = self.cameras.as_ref() else {
            anyhow::bail!("Hemicube rendered before being positioned");
        };
        device.begin_frame()?;
        for face in HemicubeFace::ALL {
            let i = face.index();
            device.render_patch_ids(patches, &cameras[i], &mut self.buffers[i])?;
        }
        Ok(())
    }

    /// Copies the five rendered buffers out, in [`HemicubeFace::ALL`] order.
    pub fn read_back(&mut self) -> Result<[Vec<u32>; 5]> {
        let mut out: [Vec<u32>; 5] = Default::default();
        for (buffer, dst) in self.buffers.iter_mut().zip(out.iter_mut()) {
            let (w, h) = (buffer.width(), buffer.height());
            let guard = buffer.open();
            *dst = guard.read_pixel_grid(w, h)?;
        }
        Ok(out)
    }

    /// World-space corners of a face at `side_length`, for debug drawing.
    pub fn face_outline(&self, face: HemicubeFace) -> Option<[Point; 4]> {
        let cam = self.camera(face)?;
        let h = 0.5 * self.side_length;
        let w = cam.window;
        let center = cam.eye + cam.forward * h;
        let corner = |u: f64, v: f64| center + cam.right * (u * h) + cam.up * (v * h);
        Some([
            corner(w.left, w.bottom),
            corner(w.right, w.bottom),
            corner(w.right, w.top),
            corner(w.left, w.top),
        ])
    }
}

impl Drop for HemicubeRig {
    fn drop(&mut self) {
        RIG_ALIVE.with(|alive| alive.set(false));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_weights_integrate_to_one() -> Result<()> {
        let coarse = WeightTables::new(8)?;
        let fine = WeightTables::new(256)?;
        let err_coarse = (coarse.total() - 1.0).abs();
        let err_fine = (fine.total() - 1.0).abs();
        assert!(err_coarse < 0.05, "res 8 total = {}", coarse.total());
        assert!(err_fine < 0.002, "res 256 total = {}", fine.total());
        assert!(err_fine <= err_coarse);
        Ok(())
    }

    #[test]
    fn test_weights_positive_and_sized() -> Result<()> {
        let w = WeightTables::new(16)?;
        assert_eq!(w.front().len(), 256);
        assert_eq!(w.side().len(), 128);
        assert!(w.front().iter().chain(w.side()).all(|&x| x > 0.0 && x.is_finite()));
        // Center pixels weigh more than corners; side row 0 more than the horizon row.
        assert!(w.front()[8 * 16 + 8] > w.front()[0]);
        assert!(w.side()[8] > w.side()[7 * 16 + 8]);
        Ok(())
    }

    #[test]
    fn test_odd_resolution_rejected() {
        let err = WeightTables::new(15).unwrap_err();
        assert_eq!(
            err.downcast_ref::<RadiosityError>(),
            Some(&RadiosityError::InvalidResolution(15))
        );
    }

    #[test]
    fn test_single_rig_per_thread() -> Result<()> {
        let rig = HemicubeRig::new(0.1, 8, 1e-3, 100.0)?;
        let second = HemicubeRig::new(0.1, 8, 1e-3, 100.0);
        assert_eq!(
            second.err().and_then(|e| e.downcast_ref::<RadiosityError>().cloned()),
            Some(RadiosityError::RigInUse)
        );
        drop(rig);
        let _again = HemicubeRig::new(0.1, 8, 1e-3, 100.0)?;
        Ok(())
    }

    #[test]
    fn test_failed_construction_does_not_hold_slot() -> Result<()> {
        assert!(HemicubeRig::new(0.1, 7, 1e-3, 100.0).is_err());
        let _rig = HemicubeRig::new(0.1, 8, 1e-3, 100.0)?;
        Ok(())
    }

    #[test]
    fn test_position_builds_orthonormal_faces() -> Result<()> {
        let mut rig = HemicubeRig::new(0.2, 8, 1e-3, 100.0)?;
        // Up deliberately not orthogonal to forward.
        rig.position(
            Point::new(1., 2., 3.),
            Vector::new(0., 0., 2.),
            Vector::new(0., 1., 1.),
            0.01,
        )?;
        let front = *rig.camera(HemicubeFace::Front).unwrap();
        assert!(front.eye.is_close(&Point::new(1., 2., 3.01)));
        assert!(front.forward.is_close(&Vector::new(0., 0., 1.)));
        assert!(front.up.dot(front.forward).abs() < 1e-12);

        for face in [
            HemicubeFace::Top,
            HemicubeFace::Right,
            HemicubeFace::Bottom,
            HemicubeFace::Left,
        ] {
            let cam = rig.camera(face).unwrap();
            assert!(cam.forward.dot(front.forward).abs() < 1e-12);
            assert!(cam.up.is_close(&front.forward));
            assert_eq!(cam.height, 4);
            assert_eq!(cam.window, FaceWindow::UPPER_HALF);
        }
        Ok(())
    }

    #[test]
    fn test_position_rejects_bad_offset() -> Result<()> {
        let mut rig = HemicubeRig::new(0.2, 8, 1e-3, 100.0)?;
        let r = rig.position(
            Point::new(0., 0., 0.),
            Vector::new(0., 0., 1.),
            Vector::new(0., 1., 0.),
            0.0,
        );
        assert!(r.is_err());
        Ok(())
    }

    #[test]
    fn test_face_outline_size() -> Result<()> {
        let mut rig = HemicubeRig::new(2.0, 8, 1e-3, 100.0)?;
        assert!(rig.face_outline(HemicubeFace::Front).is_none());
        rig.position(
            Point::new(0., 0., 0.),
            Vector::new(0., 0., 1.),
            Vector::new(0., 1., 0.),
            1e-3,
        )?;
        let [a, b, _, d] = rig.face_outline(HemicubeFace::Front).unwrap();
        assert!((Vector::from_points(a, b).length() - 2.0).abs() < 1e-12);
        assert!((Vector::from_points(a, d).length() - 2.0).abs() < 1e-12);
        let [a, _, _, d] = rig.face_outline(HemicubeFace::Left).unwrap();
        assert!((Vector::from_points(a, d).length() - 1.0).abs() < 1e-12);
        Ok(())
    }
}
