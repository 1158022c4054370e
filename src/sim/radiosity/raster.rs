//! CPU reference implementation of [`RenderDevice`].
//!
//! Z-buffered, near/far clipped flat-shading of patch ids. Depth is tested on
//! `1/z`, which is affine in screen space, so interpolation stays
//! perspective-correct without a projection matrix.

use anyhow::Result;

use crate::Vector;

use super::error::RadiosityError;
use super::registry::PatchRegistry;
use super::render::{FaceCamera, PixelBuffer, RenderDevice, encode_patch_id};

/// Camera-space vertex: (right, up, depth).
type CamVertex = (f64, f64, f64);

/// Software patch-id renderer.
pub struct SoftwareRasterizer {
    /// Skip triangles whose front side faces away from the eye.
    pub cull_back_faces: bool,
    depth: Vec<f64>,
    fail_next_frames: usize,
    frames_begun: usize,
}

impl SoftwareRasterizer {
    pub fn new() -> Self {
        Self {
            cull_back_faces: true,
            depth: Vec::new(),
            fail_next_frames: 0,
            frames_begun: 0,
        }
    }

    /// Makes the next `n` calls to `begin_frame` fail (fault injection).
    pub fn fail_next_frames(&mut self, n: usize) {
        self.fail_next_frames = n;
    }

    /// Number of successfully started frames.
    pub fn frames_begun(&self) -> usize {
        self.frames_begun
    }
}

impl Default for SoftwareRasterizer {
    fn default() -> Self {
        Self::new()
    }
}

impl RenderDevice for SoftwareRasterizer {
    fn begin_frame(&mut self) -> Result<()> {
        if self.fail_next_frames > 0 {
            self.fail_next_frames -= 1;
            return Err(RadiosityError::DeviceFailure("injected frame failure".into()).into());
        }
        self.frames_begun += 1;
        Ok(())
    }

    fn render_patch_ids(
        &mut self,
        patches: &PatchRegistry,
        camera: &FaceCamera,
        target: &mut PixelBuffer,
    ) -> Result<()> {
        anyhow::ensure!(
            target.width() == camera.width && target.height() == camera.height,
            "Target is {}x{}, camera expects {}x{}",
            target.width(),
            target.height(),
            camera.width,
            camera.height
        );

        target.clear();
        self.depth.clear();
        self.depth.resize(camera.width * camera.height, 0.0); // stores 1/z, 0 = infinitely far

        for patch in patches.patches() {
            if self.cull_back_faces {
                let Some(n) = patch.normal else {
                    continue;
                };
                let to_eye = Vector::from_points(patch.centroid, camera.eye);
                if n.dot(to_eye) <= 0.0 {
                    continue;
                }
            }

            let verts: Vec<CamVertex> = patch
                .vertices
                .iter()
                .map(|&p| camera.to_camera_space(p))
                .collect();
            let clipped = clip_depth(&clip_depth(&verts, camera.near, true), camera.far, false);
            if clipped.len() < 3 {
                continue;
            }

            let screen: Vec<(f64, f64, f64)> =
                clipped.iter().map(|&v| to_screen(v, camera)).collect();
            let pixel = encode_patch_id(patch.id);
            for k in 1..screen.len() - 1 {
                self.fill_triangle(
                    [screen[0], screen[k], screen[k + 1]],
                    pixel,
                    camera,
                    target.pixels_mut(),
                );
            }
        }
        Ok(())
    }
}

impl SoftwareRasterizer {
    /// Fills pixels whose centers lie inside the screen-space triangle.
    fn fill_triangle(
        &mut self,
        tri: [(f64, f64, f64); 3],
        pixel: u32,
        camera: &FaceCamera,
        pixels: &mut [u32],
    ) {
        let [a, b, c] = tri;
        let area = edge(a, b, c.0, c.1);
        if area.abs() < 1e-18 {
            return;
        }

        let min_x = a.0.min(b.0).min(c.0).floor().max(0.0) as usize;
        let min_y = a.1.min(b.1).min(c.1).floor().max(0.0) as usize;
        let max_x = (a.0.max(b.0).max(c.0).ceil() as isize).clamp(0, camera.width as isize) as usize;
        let max_y =
            (a.1.max(b.1).max(c.1).ceil() as isize).clamp(0, camera.height as isize) as usize;

        for row in min_y..max_y {
            let py = row as f64 + 0.5;
            for col in min_x..max_x {
                let px = col as f64 + 0.5;
                let w0 = edge(b, c, px, py) / area;
                let w1 = edge(c, a, px, py) / area;
                let w2 = edge(a, b, px, py) / area;
                if w0 < 0.0 || w1 < 0.0 || w2 < 0.0 {
                    continue;
                }
                let inv_z = w0 * a.2 + w1 * b.2 + w2 * c.2;
                let idx = row * camera.width + col;
                if inv_z > self.depth[idx] {
                    self.depth[idx] = inv_z;
                    pixels[idx] = pixel;
                }
            }
        }
    }
}

/// Signed doubled area of (a, b, p); sign flips with winding.
fn edge(a: (f64, f64, f64), b: (f64, f64, f64), px: f64, py: f64) -> f64 {
    (b.0 - a.0) * (py - a.1) - (b.1 - a.1) * (px - a.0)
}

/// Pixel coordinates (column, row) and `1/z` of a camera-space vertex.
fn to_screen(v: CamVertex, camera: &FaceCamera) -> (f64, f64, f64) {
    let (x, y, z) = v;
    let (u, t) = (x / z, y / z);
    let w = &camera.window;
    let col = (u - w.left) / (w.right - w.left) * camera.width as f64;
    let row = (w.top - t) / (w.top - w.bottom) * camera.height as f64;
    (col, row, 1.0 / z)
}

/// Sutherland-Hodgman against a depth plane: keeps `z >= limit` when
/// `keep_beyond`, else `z <= limit`.
fn clip_depth(poly: &[CamVertex], limit: f64, keep_beyond: bool) -> Vec<CamVertex> {
    let inside = |v: &CamVertex| if keep_beyond { v.2 >= limit } else { v.2 <= limit };
    let mut out = Vec::with_capacity(poly.len() + 2);
    for i in 0..poly.len() {
        let cur = poly[i];
        let next = poly[(i + 1) % poly.len()];
        let (cur_in, next_in) = (inside(&cur), inside(&next));
        if cur_in {
            out.push(cur);
        }
        if cur_in != next_in {
            let t = (limit - cur.2) / (next.2 - cur.2);
            out.push((
                cur.0 + (next.0 - cur.0) * t,
                cur.1 + (next.1 - cur.1) * t,
                limit,
            ));
        }
    }
    out
}
