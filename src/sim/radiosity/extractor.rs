//! Turns hemicube pixel buffers into form factors.
//!
//! Pure CPU traversal: every pixel is decoded to a patch id and contributes
//! its delta form factor to that receiver. Background pixels are escaped
//! energy; ids outside `[0, N)` are counted as corrupt and skipped.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;

use crate::scene::Rgb;
use crate::{Point, Vector};

use super::hemicube::{HemicubeFace, WeightTables};
use super::registry::BACKGROUND_ID;
use super::render::decode_patch_id;
use super::sampler::HemicubeSample;

/// Pixel tallies of one extraction pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtractStats {
    /// Pixels credited to a receiver.
    pub hits: usize,
    /// Pixels showing no patch.
    pub background: usize,
    /// Pixels decoding to an id outside `[0, N)`.
    pub out_of_range: usize,
    /// Pixels where the sender saw itself (offset too small); dropped.
    pub self_hits: usize,
}

impl ExtractStats {
    pub fn total(&self) -> usize {
        self.hits + self.background + self.out_of_range + self.self_hits
    }

    pub fn merge(&mut self, other: &ExtractStats) {
        self.hits += other.hits;
        self.background += other.background;
        self.out_of_range += other.out_of_range;
        self.self_hits += other.self_hits;
    }
}

/// Sparse visible-patch weights seen from one point and direction.
#[derive(Debug, Clone)]
pub struct VectorOccluders {
    pub eye: Point,
    pub direction: Vector,
    weights: HashMap<u32, f64>,
}

impl VectorOccluders {
    pub fn new(eye: Point, direction: Vector) -> Self {
        Self {
            eye,
            direction,
            weights: HashMap::new(),
        }
    }

    pub fn get(&self, id: u32) -> Option<f64> {
        self.weights.get(&id).copied()
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, f64)> + '_ {
        self.weights.iter().map(|(&id, &w)| (id, w))
    }

    /// Fraction of the hemisphere covered by patches (the rest is open sky).
    pub fn total_weight(&self) -> f64 {
        self.weights.values().sum()
    }

    /// Incoming exitance at the point: `sum_j w_j * E_j`.
    ///
    /// Ids without an exitance entry contribute nothing.
    pub fn gather(&self, exitance: &[Rgb]) -> Rgb {
        let mut out = [0.0; 3];
        for (&id, &w) in &self.weights {
            if let Some(e) = exitance.get(id as usize) {
                for c in 0..3 {
                    out[c] += w * e[c];
                }
            }
        }
        out
    }
}

/// Accumulates weighted pixel counts into matrix rows or sparse maps.
#[derive(Debug, Clone)]
pub struct FormFactorExtractor {
    weights: Arc<WeightTables>,
    patch_count: usize,
}

impl FormFactorExtractor {
    pub fn new(weights: Arc<WeightTables>, patch_count: usize) -> Self {
        Self {
            weights,
            patch_count,
        }
    }

    pub fn patch_count(&self) -> usize {
        self.patch_count
    }

    /// Adds the sender's view into `row` (`row[j] += weight` per pixel showing `j`).
    pub fn accumulate(
        &self,
        sender: u32,
        sample: &HemicubeSample,
        row: &mut [f64],
    ) -> Result<ExtractStats> {
        anyhow::ensure!(
            row.len() == self.patch_count,
            "Row of patch {sender} has {} entries, expected {}",
            row.len(),
            self.patch_count
        );
        let stats = self.traverse(sample, Some(sender), |receiver, w| {
            row[receiver as usize] += w;
        })?;
        if stats.out_of_range > 0 {
            log::warn!(
                "Patch {sender}: {} pixels decoded to ids outside [0, {})",
                stats.out_of_range,
                self.patch_count
            );
        }
        if stats.self_hits > 0 {
            log::debug!("Patch {sender}: {} self-hit pixels dropped", stats.self_hits);
        }
        Ok(stats)
    }

    /// Same decoding as [`Self::accumulate`], summed into a sparse map.
    pub fn accumulate_sparse(
        &self,
        sample: &HemicubeSample,
        into: &mut VectorOccluders,
    ) -> Result<ExtractStats> {
        let stats = self.traverse(sample, None, |id, w| {
            *into.weights.entry(id).or_insert(0.0) += w;
        })?;
        if stats.out_of_range > 0 {
            log::warn!(
                "Point {}: {} pixels decoded to ids outside [0, {})",
                sample.eye,
                stats.out_of_range,
                self.patch_count
            );
        }
        Ok(stats)
    }

    fn traverse<F>(
        &self,
        sample: &HemicubeSample,
        sender: Option<u32>,
        mut add: F,
    ) -> Result<ExtractStats>
    where
        F: FnMut(u32, f64),
    {
        for face in HemicubeFace::ALL {
            anyhow::ensure!(
                sample.face(face).len() == self.weights.for_face(face).len(),
                "{face:?} face has {} pixels, weight table {}",
                sample.face(face).len(),
                self.weights.for_face(face).len()
            );
        }

        let mut stats = ExtractStats::default();
        for face in HemicubeFace::ALL {
            let weights = self.weights.for_face(face);
            let pixels = sample.face(face);

            for (&pixel, &w) in pixels.iter().zip(weights) {
                let id = decode_patch_id(pixel);
                if id == BACKGROUND_ID {
                    stats.background += 1;
                } else if id as usize >= self.patch_count {
                    stats.out_of_range += 1;
                } else if Some(id) == sender {
                    stats.self_hits += 1;
                } else {
                    stats.hits += 1;
                    add(id, w);
                }
            }
        }
        Ok(stats)
    }
}
