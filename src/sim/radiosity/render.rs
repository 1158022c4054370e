//! Contract with the rendering collaborator.
//!
//! The radiosity core never rasterizes by itself. It asks a [`RenderDevice`]
//! to draw every patch flat-shaded with its id into a [`PixelBuffer`], then
//! reads the pixels back through a scoped [`PixelReadGuard`].

use std::ops::Deref;

use anyhow::Result;

use crate::{Point, Vector};

use super::registry::{BACKGROUND_ID, PatchRegistry};

/// Bits of a rendered pixel that carry the patch id. The top byte is unused.
pub const PATCH_ID_MASK: u32 = 0x00FF_FFFF;

/// Value a device clears its target to (background id, top byte set).
pub const CLEAR_PIXEL: u32 = 0xFF00_0000 | BACKGROUND_ID;

/// Packs a patch id into a pixel the way a device shades it.
pub fn encode_patch_id(id: u32) -> u32 {
    0xFF00_0000 | (id & PATCH_ID_MASK)
}

/// Recovers the patch id from a rendered pixel, ignoring the top byte.
pub fn decode_patch_id(pixel: u32) -> u32 {
    pixel & PATCH_ID_MASK
}

/// Visible part of the image plane at unit distance, in tangent space.
///
/// A full 90 degree face spans `[-1, 1]` in both directions.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FaceWindow {
    pub left: f64,
    pub right: f64,
    pub bottom: f64,
    pub top: f64,
}

impl FaceWindow {
    pub const FULL: Self = Self {
        left: -1.0,
        right: 1.0,
        bottom: -1.0,
        top: 1.0,
    };

    /// Upper half only: the part of a side face above the hemicube base.
    pub const UPPER_HALF: Self = Self {
        left: -1.0,
        right: 1.0,
        bottom: 0.0,
        top: 1.0,
    };
}

/// Perspective camera for one hemicube face (90 degree FOV, square pixels).
#[derive(Debug, Clone, Copy)]
pub struct FaceCamera {
    pub eye: Point,
    /// Unit view direction.
    pub forward: Vector,
    /// Unit up direction, orthogonal to `forward`.
    pub up: Vector,
    /// Unit right direction (`forward x up`).
    pub right: Vector,
    pub near: f64,
    pub far: f64,
    pub window: FaceWindow,
    pub width: usize,
    pub height: usize,
}

impl FaceCamera {
    /// Camera-space coordinates (right, up, depth) of a world point.
    pub fn to_camera_space(&self, p: Point) -> (f64, f64, f64) {
        let v = Vector::from_points(self.eye, p);
        (v.dot(self.right), v.dot(self.up), v.dot(self.forward))
    }

    /// World direction through the center of pixel (`row`, `col`).
    pub fn pixel_direction(&self, row: usize, col: usize) -> Vector {
        let w = &self.window;
        let u = w.left + (col as f64 + 0.5) / self.width as f64 * (w.right - w.left);
        let v = w.top - (row as f64 + 0.5) / self.height as f64 * (w.top - w.bottom);
        self.forward + self.right * u + self.up * v
    }
}

/// Rendering collaborator able to draw patch ids off-screen.
pub trait RenderDevice {
    /// Prepares the device for a frame. A failure here abandons the current sample.
    fn begin_frame(&mut self) -> Result<()> {
        Ok(())
    }

    /// Renders all patches of `patches`, shaded by id, into `target`.
    ///
    /// Pixels not covered by any patch must hold [`CLEAR_PIXEL`].
    fn render_patch_ids(
        &mut self,
        patches: &PatchRegistry,
        camera: &FaceCamera,
        target: &mut PixelBuffer,
    ) -> Result<()>;
}

/// Off-screen 32-bit pixel target.
#[derive(Debug, Clone)]
pub struct PixelBuffer {
    width: usize,
    height: usize,
    pixels: Vec<u32>,
    mapped: bool,
}

impl PixelBuffer {
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            pixels: vec![CLEAR_PIXEL; width * height],
            mapped: false,
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    /// True while a [`PixelReadGuard`] holds the buffer open for CPU reads.
    pub fn is_mapped(&self) -> bool {
        self.mapped
    }

    /// Device-side write access.
    pub fn pixels_mut(&mut self) -> &mut [u32] {
        &mut self.pixels
    }

    pub fn clear(&mut self) {
        self.pixels.fill(CLEAR_PIXEL);
    }

    /// Opens the buffer for CPU reads. The guard releases it on every exit path.
    pub fn open(&mut self) -> PixelReadGuard<'_> {
        self.mapped = true;
        PixelReadGuard { buffer: self }
    }
}

/// Scoped CPU read access to a [`PixelBuffer`].
pub struct PixelReadGuard<'a> {
    buffer: &'a mut PixelBuffer,
}

impl PixelReadGuard<'_> {
    /// Copies a `width x height` row-major grid out of the buffer.
    pub fn read_pixel_grid(&self, width: usize, height: usize) -> Result<Vec<u32>> {
        anyhow::ensure!(
            width == self.buffer.width && height == self.buffer.height,
            "Requested {width}x{height} grid from a {}x{} buffer",
            self.buffer.width,
            self.buffer.height
        );
        Ok(self.buffer.pixels.clone())
    }
}

impl Deref for PixelReadGuard<'_> {
    type Target = [u32];
    fn deref(&self) -> &[u32] {
        &self.buffer.pixels
    }
}

impl Drop for PixelReadGuard<'_> {
    fn drop(&mut self) {
        self.buffer.mapped = false;
    }
}
