use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::UID;
use crate::scene::{Rgb, Scene};

use super::error::RadiosityError;
use super::registry::PatchRegistry;
use super::solver::{ChannelSolution, SolveMethod};

/// Convergence summary of one colour channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelReport {
    pub converged: bool,
    pub sweeps: usize,
    pub residual: f64,
    pub residual_history: Vec<f64>,
}

/// Solved exitance of every patch.
#[derive(Debug, Clone, Serialize)]
pub struct RadiositySolution {
    pub method: SolveMethod,
    /// Per-patch RGB exitance, indexed by patch id.
    pub exitance: Vec<Rgb>,
    /// Red, green, blue.
    pub channels: [ChannelReport; 3],
}

#[derive(Serialize)]
struct SurfaceReport<'a> {
    uid: &'a UID,
    mean_exitance: Rgb,
}

#[derive(Serialize)]
struct SolutionReport<'a> {
    method: SolveMethod,
    patch_count: usize,
    channels: &'a [ChannelReport; 3],
    surfaces: Vec<SurfaceReport<'a>>,
}

impl RadiositySolution {
    /// Interleaves three channel solves into per-patch RGB.
    pub fn from_channels(method: SolveMethod, channels: [ChannelSolution; 3]) -> Self {
        let n = channels[0].exitance.len();
        let exitance = (0..n)
            .map(|i| {
                [
                    channels[0].exitance[i],
                    channels[1].exitance[i],
                    channels[2].exitance[i],
                ]
            })
            .collect();
        let channels = channels.map(|c| ChannelReport {
            converged: c.converged,
            sweeps: c.sweeps,
            residual: c.residual,
            residual_history: c.residual_history,
        });
        Self {
            method,
            exitance,
            channels,
        }
    }

    pub fn exitance_of(&self, id: u32) -> Option<Rgb> {
        self.exitance.get(id as usize).copied()
    }

    /// True when every channel met its tolerance.
    pub fn converged(&self) -> bool {
        self.channels.iter().all(|c| c.converged)
    }

    /// Writes each patch's exitance onto its owning surface.
    ///
    /// `scene` must be the scene the registry was built from.
    pub fn publish(&self, registry: &PatchRegistry, scene: &mut Scene) -> Result<()> {
        anyhow::ensure!(
            self.exitance.len() == registry.len() && scene.patch_count() == registry.len(),
            "Solution has {} patches, registry {}, scene {}",
            self.exitance.len(),
            registry.len(),
            scene.patch_count()
        );

        // Built aside and swapped in only once every patch has resolved.
        let mut staged: Vec<Vec<Rgb>> = scene
            .surfaces()
            .iter()
            .map(|s| vec![[0.0; 3]; s.patches.len()])
            .collect();
        for (id, &e) in self.exitance.iter().enumerate() {
            let id = id as u32;
            let (surface_index, local_index) = registry
                .locate(id)
                .ok_or(RadiosityError::UnknownPatch(id))?;
            let owner = registry.owner_of(id).ok_or(RadiosityError::UnknownPatch(id))?;
            let owned = scene
                .surfaces()
                .get(surface_index)
                .is_some_and(|s| &s.uid == owner);
            anyhow::ensure!(owned, "Patch {id} belongs to surface {owner}, not in the scene");
            let slot = staged[surface_index]
                .get_mut(local_index)
                .with_context(|| format!("Patch {id} has no slot on surface {owner}"))?;
            *slot = e;
        }

        for (surface, exitance) in scene.surfaces_mut().iter_mut().zip(staged) {
            surface.exitance = exitance;
        }
        log::info!("Published exitance of {} patches", self.exitance.len());
        Ok(())
    }

    /// Area-weighted mean exitance per surface, in registry surface order.
    pub fn surface_means(&self, registry: &PatchRegistry) -> Vec<Rgb> {
        let surfaces = registry.surface_uids().len();
        let mut sums = vec![[0.0; 3]; surfaces];
        let mut areas = vec![0.0; surfaces];
        for patch in registry.patches() {
            let Some(e) = self.exitance_of(patch.id) else {
                continue;
            };
            areas[patch.surface_index] += patch.area;
            for c in 0..3 {
                sums[patch.surface_index][c] += e[c] * patch.area;
            }
        }
        sums.iter()
            .zip(&areas)
            .map(|(s, &a)| if a > 0.0 { s.map(|v| v / a) } else { [0.0; 3] })
            .collect()
    }

    /// Writes a JSON summary (method, channel convergence, surface means).
    pub fn write_json_report(&self, registry: &PatchRegistry, path: &Path) -> Result<()> {
        let means = self.surface_means(registry);
        let report = SolutionReport {
            method: self.method,
            patch_count: self.exitance.len(),
            channels: &self.channels,
            surfaces: registry
                .surface_uids()
                .iter()
                .zip(means)
                .map(|(uid, mean_exitance)| SurfaceReport { uid, mean_exitance })
                .collect(),
        };

        let file = File::create(path)
            .with_context(|| format!("Failed to create report: {}", path.display()))?;
        serde_json::to_writer_pretty(BufWriter::new(file), &report)
            .with_context(|| format!("Failed to write report: {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::Surface;
    use crate::{Point, Vector};
    use tempfile::tempdir;

    fn channel(values: Vec<f64>, converged: bool) -> ChannelSolution {
        ChannelSolution {
            exitance: values,
            converged,
            sweeps: 3,
            residual: 1e-9,
            residual_history: vec![1e-3, 1e-6, 1e-9],
        }
    }

    fn two_surfaces() -> Scene {
        let a = Surface::rectangle(
            "a",
            Point::new(0., 0., 0.),
            Vector::new(1., 0., 0.),
            Vector::new(0., 1., 0.),
            [0.5; 3],
            [0.0; 3],
        )
        .unwrap();
        let b = Surface::rectangle(
            "b",
            Point::new(0., 0., 1.),
            Vector::new(0., 2., 0.),
            Vector::new(1., 0., 0.),
            [0.5; 3],
            [1.0; 3],
        )
        .unwrap();
        Scene::new(vec![a, b])
    }

    fn solution() -> RadiositySolution {
        RadiositySolution::from_channels(
            SolveMethod::Jacobi,
            [
                channel(vec![1.0, 1.0, 4.0, 4.0], true),
                channel(vec![2.0, 2.0, 5.0, 5.0], true),
                channel(vec![3.0, 3.0, 6.0, 6.0], false),
            ],
        )
    }

    #[test]
    fn test_channels_interleaved() {
        let sol = solution();
        assert_eq!(sol.exitance_of(2), Some([4.0, 5.0, 6.0]));
        assert_eq!(sol.exitance_of(4), None);
        assert!(!sol.converged());
    }

    #[test]
    fn test_publish_writes_onto_owners() -> Result<()> {
        let mut scene = two_surfaces();
        let reg = PatchRegistry::assign_ids(&scene, 100)?;
        let sol = solution();
        sol.publish(&reg, &mut scene)?;

        assert_eq!(scene.surfaces()[0].exitance, vec![[1.0, 2.0, 3.0]; 2]);
        assert_eq!(scene.surfaces()[1].exitance, vec![[4.0, 5.0, 6.0]; 2]);
        assert_eq!(scene.surfaces()[1].mean_exitance(), Some([4.0, 5.0, 6.0]));
        Ok(())
    }

    #[test]
    fn test_publish_rejects_other_scene() -> Result<()> {
        let scene = two_surfaces();
        let reg = PatchRegistry::assign_ids(&scene, 100)?;
        // Same shape, fresh UIDs.
        let mut other = two_surfaces();
        assert!(solution().publish(&reg, &mut other).is_err());
        Ok(())
    }

    #[test]
    fn test_failed_publish_leaves_scene_untouched() -> Result<()> {
        let mut scene = two_surfaces();
        let reg = PatchRegistry::assign_ids(&scene, 100)?;
        solution().publish(&reg, &mut scene)?;

        // Same first surface, fresh UID on the second.
        let mut mixed = scene.clone();
        mixed.surfaces_mut()[1] = two_surfaces().surfaces()[1].clone();
        mixed.surfaces_mut()[1].exitance = vec![[7.0; 3]; 2];
        let doubled = RadiositySolution {
            exitance: solution().exitance.iter().map(|e| e.map(|v| 2.0 * v)).collect(),
            ..solution()
        };

        assert!(doubled.publish(&reg, &mut mixed).is_err());
        assert_eq!(mixed.surfaces()[0].exitance, vec![[1.0, 2.0, 3.0]; 2]);
        assert_eq!(mixed.surfaces()[1].exitance, vec![[7.0; 3]; 2]);
        Ok(())
    }

    #[test]
    fn test_surface_means_and_report() -> Result<()> {
        let scene = two_surfaces();
        let reg = PatchRegistry::assign_ids(&scene, 100)?;
        let sol = solution();
        let means = sol.surface_means(&reg);
        assert_eq!(means, vec![[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]]);

        let dir = tempdir()?;
        let path = dir.path().join("report.json");
        sol.write_json_report(&reg, &path)?;
        let json: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path)?)?;
        assert_eq!(json["method"], "jacobi");
        assert_eq!(json["patch_count"], 4);
        assert_eq!(json["surfaces"].as_array().map(|s| s.len()), Some(2));
        assert_eq!(json["channels"][2]["converged"], false);
        Ok(())
    }
}
