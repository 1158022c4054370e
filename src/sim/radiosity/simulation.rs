use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread;

use anyhow::{Context, Result};
use rayon::prelude::*;

use crate::scene::{Rgb, Scene};
use crate::{Point, Vector};

use super::config::RadiosityConfig;
use super::error::RadiosityError;
use super::extractor::{ExtractStats, FormFactorExtractor, VectorOccluders};
use super::hemicube::HemicubeRig;
use super::matrix::FormFactorMatrix;
use super::persistence::{drop_matrix, recover_matrix};
use super::registry::PatchRegistry;
use super::render::RenderDevice;
use super::result::RadiositySolution;
use super::sampler::{DEFAULT_NORMAL, HemicubeSample, VisibilitySampler};
use super::solver::{ChannelProblem, ChannelSolution};

/// Shared flag checked between patches (sampling) and between sweeps (solving).
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SamplingProgress {
    /// Patches rendered so far (0..=patch_count).
    pub patches_done: usize,
    pub patch_count: usize,
    /// Share of extracted pixels that showed no patch.
    pub background_fraction: f64,
}

trait ProgressReporter {
    fn every_patches(&self) -> usize;
    fn report(&mut self, progress: &SamplingProgress);
}

struct NoProgress;
impl ProgressReporter for NoProgress {
    fn every_patches(&self) -> usize {
        0
    }
    fn report(&mut self, _progress: &SamplingProgress) {}
}

struct FnProgress<F> {
    every_patches: usize,
    f: F,
}
impl<F> ProgressReporter for FnProgress<F>
where
    F: FnMut(&SamplingProgress),
{
    fn every_patches(&self) -> usize {
        self.every_patches
    }
    fn report(&mut self, progress: &SamplingProgress) {
        (self.f)(progress);
    }
}

/// Pixel counters shared between the device thread and the extraction worker.
#[derive(Default)]
struct PixelTally {
    background: AtomicUsize,
    total: AtomicUsize,
}

impl PixelTally {
    fn add(&self, stats: &ExtractStats) {
        self.background.fetch_add(stats.background, Ordering::Relaxed);
        self.total.fetch_add(stats.total(), Ordering::Relaxed);
    }

    fn background_fraction(&self) -> f64 {
        let total = self.total.load(Ordering::Relaxed);
        if total == 0 {
            return 0.0;
        }
        self.background.load(Ordering::Relaxed) as f64 / total as f64
    }
}

/// Hemicube radiosity over one scene: assign, sample, solve, publish.
///
/// Owns the session's only [`HemicubeRig`], so it must stay on the thread
/// that owns the render device.
pub struct RadiositySimulation<D: RenderDevice> {
    config: RadiosityConfig,
    registry: PatchRegistry,
    rig: HemicubeRig,
    device: D,
    matrix: Option<FormFactorMatrix>,
    cancel: CancelToken,
}

impl<D: RenderDevice> RadiositySimulation<D> {
    /// Assigns patch ids and builds the rig. Fails before any sampling if the
    /// scene exceeds `config.max_patches`.
    pub fn new(scene: &Scene, device: D, config: RadiosityConfig) -> Result<Self> {
        config.validate()?;
        let registry = PatchRegistry::assign_ids(scene, config.max_patches)?;
        let rig = HemicubeRig::from_config(&config)?;
        Ok(Self {
            config,
            registry,
            rig,
            device,
            matrix: None,
            cancel: CancelToken::new(),
        })
    }

    pub fn config(&self) -> &RadiosityConfig {
        &self.config
    }

    pub fn registry(&self) -> &PatchRegistry {
        &self.registry
    }

    /// Form-factor matrix, once sampled or recovered.
    pub fn matrix(&self) -> Option<&FormFactorMatrix> {
        self.matrix.as_ref()
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    /// Handle that cancels this session from any thread.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Acquires the form-factor matrix, from the cache when it matches.
    pub fn sample(&mut self) -> Result<()> {
        self.sample_impl(NoProgress)
    }

    /// Like [`Self::sample`], reporting progress.
    ///
    /// - `every_patches=0` disables progress reporting.
    /// - The reporter is called once at start (`patches_done=0`), every
    ///   `every_patches` patches, and once at the end.
    pub fn sample_with_progress<F>(&mut self, every_patches: usize, report: F) -> Result<()>
    where
        F: FnMut(&SamplingProgress),
    {
        self.sample_impl(FnProgress {
            every_patches,
            f: report,
        })
    }

    fn sample_impl<R: ProgressReporter>(&mut self, mut reporter: R) -> Result<()> {
        let fingerprint = self.registry.fingerprint();

        if let Some(path) = self.config.matrix_cache.as_deref() {
            if path.exists() {
                match recover_matrix(path, &fingerprint) {
                    Ok(mut matrix) => {
                        log::info!("Matrix cache hit: {}", path.display());
                        // The cached matrix may predate the reciprocity setting.
                        if self.config.enforce_reciprocity {
                            matrix.enforce_reciprocity(&self.registry.areas());
                            log::debug!("Reciprocity enforced on the recovered matrix");
                        }
                        self.matrix = Some(matrix);
                        return Ok(());
                    }
                    Err(e) => log::warn!("Ignoring matrix cache {}: {e:#}", path.display()),
                }
            } else {
                log::info!("Matrix cache miss: {}", path.display());
            }
        }

        let n = self.registry.len();
        log::info!(
            "Sampling {n} patches at {res}x{res} (pipelined: {})",
            self.config.pipeline_extraction,
            res = self.config.resolution
        );

        let extractor = FormFactorExtractor::new(self.rig.weights(), n);
        let mut matrix = FormFactorMatrix::new(n)?;
        let tally = PixelTally::default();

        let registry = &self.registry;
        let cancel = &self.cancel;
        let retries = self.config.render_retries;
        let mut sampler =
            VisibilitySampler::new(&mut self.rig, &mut self.device, self.config.sample_offset)?;
        if let Some(seed) = self.config.jitter_seed {
            sampler = sampler.with_jitter(seed);
        }
        let driver = PatchDriver {
            registry,
            cancel,
            retries,
            tally: &tally,
        };

        let stats = if self.config.pipeline_extraction {
            thread::scope(|scope| -> Result<ExtractStats> {
                let (tx, rx) = mpsc::sync_channel::<(u32, HemicubeSample)>(1);
                let extractor = &extractor;
                let matrix = &mut matrix;
                let tally = &tally;
                let worker = scope.spawn(move || -> Result<ExtractStats> {
                    let mut stats = ExtractStats::default();
                    let mut row = vec![0.0; n];
                    for (id, sample) in rx {
                        row.fill(0.0);
                        let s = extractor.accumulate(id, &sample, &mut row)?;
                        matrix.store_row(id as usize, &row);
                        tally.add(&s);
                        stats.merge(&s);
                    }
                    Ok(stats)
                });

                let sent = driver.run(&mut sampler, &mut reporter, |id, sample| {
                    tx.send((id, sample))
                        .map_err(|_| anyhow::anyhow!("Extraction worker stopped early"))
                });
                drop(tx);
                // A worker error explains a failed send, so it is reported first.
                let stats = worker
                    .join()
                    .map_err(|_| anyhow::anyhow!("Extraction worker panicked"))??;
                sent?;
                Ok(stats)
            })?
        } else {
            let mut stats = ExtractStats::default();
            let mut row = vec![0.0; n];
            driver.run(&mut sampler, &mut reporter, |id, sample| {
                row.fill(0.0);
                let s = extractor.accumulate(id, &sample, &mut row)?;
                matrix.store_row(id as usize, &row);
                tally.add(&s);
                stats.merge(&s);
                Ok(())
            })?;
            stats
        };

        log::info!(
            "Sampled {n} patches: {} hits, {} background, {} self-hits, {} out of range",
            stats.hits,
            stats.background,
            stats.self_hits,
            stats.out_of_range
        );
        if stats.out_of_range > 0 {
            log::warn!(
                "{} pixels decoded to invalid patch ids during sampling",
                stats.out_of_range
            );
        }

        if self.config.enforce_reciprocity {
            matrix.enforce_reciprocity(&self.registry.areas());
            log::debug!("Reciprocity enforced on the form-factor matrix");
        }

        if let Some(path) = self.config.matrix_cache.as_deref() {
            if let Err(e) = drop_matrix(&matrix, fingerprint, path) {
                log::warn!("Could not write matrix cache: {e:#}");
            }
        }

        self.matrix = Some(matrix);
        Ok(())
    }

    /// Solves the three channels in parallel with the configured method.
    pub fn solve(&self) -> Result<RadiositySolution> {
        let Some(form_factors) = self.matrix.as_ref() else {
            anyhow::bail!("No form-factor matrix: call sample() before solve()");
        };
        let method = self.config.method;
        let (tolerance, max_sweeps) = (self.config.tolerance, self.config.max_sweeps);
        let registry = &self.registry;
        let cancel = &self.cancel;
        let areas = registry.areas();
        log::info!("Solving {} patches with {method}", registry.len());

        let channels: Vec<ChannelSolution> = (0..3)
            .into_par_iter()
            .map(|c| {
                let reflectance = registry.reflectance(c);
                let emission = registry.emission(c);
                let problem = ChannelProblem {
                    form_factors,
                    reflectance: &reflectance,
                    emission: &emission,
                    areas: &areas,
                };
                method
                    .solve(&problem, tolerance, max_sweeps, cancel)
                    .with_context(|| format!("Solving channel {c} failed"))
            })
            .collect::<Result<_>>()?;
        let channels: [ChannelSolution; 3] = channels
            .try_into()
            .map_err(|_| anyhow::anyhow!("Expected three channel solutions"))?;

        let solution = RadiositySolution::from_channels(method, channels);
        for (c, report) in solution.channels.iter().enumerate() {
            log::debug!(
                "Channel {c}: {} steps, residual {:.3e}, converged: {}",
                report.sweeps,
                report.residual,
                report.converged
            );
        }
        Ok(solution)
    }

    /// Writes `solution` onto the surfaces of `scene` (the scene this session was built from).
    pub fn publish(&self, solution: &RadiositySolution, scene: &mut Scene) -> Result<()> {
        solution.publish(&self.registry, scene)
    }

    /// Samples (unless a matrix is already present), solves and publishes.
    pub fn run(&mut self, scene: &mut Scene) -> Result<RadiositySolution> {
        if self.matrix.is_none() {
            self.sample()?;
        }
        let solution = self.solve()?;
        self.publish(&solution, scene)?;
        Ok(solution)
    }

    /// Visible patches and their weights from an arbitrary point.
    pub fn sample_point(&mut self, eye: Point, forward: Vector, up: Vector) -> Result<VectorOccluders> {
        let extractor = FormFactorExtractor::new(self.rig.weights(), self.registry.len());
        let mut sampler =
            VisibilitySampler::new(&mut self.rig, &mut self.device, self.config.sample_offset)?;
        let sample = sampler.sample_from_point(&self.registry, eye, forward, up)?;
        let mut occluders = VectorOccluders::new(sample.eye, sample.forward);
        extractor.accumulate_sparse(&sample, &mut occluders)?;
        Ok(occluders)
    }

    /// Incoming exitance at `point` over the hemisphere around `normal`.
    pub fn ambient_at(
        &mut self,
        point: Point,
        normal: Vector,
        solution: &RadiositySolution,
    ) -> Result<Rgb> {
        let normal = normal.normalize().unwrap_or(DEFAULT_NORMAL);
        let up = normal
            .any_orthogonal()
            .unwrap_or(Vector::new(1.0, 0.0, 0.0));
        let occluders = self.sample_point(point, normal, up)?;
        Ok(occluders.gather(&solution.exitance))
    }
}

/// Device-thread side of the per-patch sampling loop.
struct PatchDriver<'a> {
    registry: &'a PatchRegistry,
    cancel: &'a CancelToken,
    retries: usize,
    tally: &'a PixelTally,
}

impl PatchDriver<'_> {
    /// Samples every patch in id order and hands each sample to `sink`.
    fn run<D, R, S>(
        &self,
        sampler: &mut VisibilitySampler<'_, D>,
        reporter: &mut R,
        mut sink: S,
    ) -> Result<()>
    where
        D: RenderDevice,
        R: ProgressReporter,
        S: FnMut(u32, HemicubeSample) -> Result<()>,
    {
        let patch_count = self.registry.len();
        let report_every = reporter.every_patches();
        let progress = |patches_done: usize| SamplingProgress {
            patches_done,
            patch_count,
            background_fraction: self.tally.background_fraction(),
        };
        if report_every > 0 {
            reporter.report(&progress(0));
        }

        for (done, patch) in self.registry.patches().iter().enumerate() {
            if self.cancel.is_cancelled() {
                log::info!("Sampling cancelled after {done} of {patch_count} patches");
                return Err(RadiosityError::Cancelled.into());
            }

            let mut attempt = 0;
            let sample = loop {
                match sampler.sample_from_patch(self.registry, patch) {
                    Ok(sample) => break sample,
                    Err(e) if attempt < self.retries => {
                        attempt += 1;
                        log::warn!(
                            "Patch {}: sample abandoned ({e:#}), retry {attempt}/{}",
                            patch.id,
                            self.retries
                        );
                    }
                    Err(e) => {
                        return Err(e.context(format!(
                            "Sampling aborted at patch {} of {patch_count}; partial matrix discarded",
                            patch.id
                        )));
                    }
                }
            };
            log::debug!("Patch {} sampled", patch.id);
            sink(patch.id, sample)?;

            let done = done + 1;
            if report_every > 0 && (done % report_every == 0 || done == patch_count) {
                reporter.report(&progress(done));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::{Surface, cornell_box};
    use crate::sim::radiosity::raster::SoftwareRasterizer;
    use crate::sim::radiosity::solver::SolveMethod;

    fn small_config() -> RadiosityConfig {
        let mut config = RadiosityConfig::new();
        config.resolution = 16;
        config
    }

    /// Two unit squares facing each other one unit apart.
    fn parallel_plates() -> Scene {
        let bottom = Surface::rectangle(
            "bottom",
            Point::new(0., 0., 0.),
            Vector::new(1., 0., 0.),
            Vector::new(0., 1., 0.),
            [0.5; 3],
            [1.0; 3],
        )
        .unwrap();
        let top = Surface::rectangle(
            "top",
            Point::new(0., 0., 1.),
            Vector::new(0., 1., 0.),
            Vector::new(1., 0., 0.),
            [0.5; 3],
            [0.0; 3],
        )
        .unwrap();
        Scene::new(vec![bottom, top])
    }

    #[test]
    fn test_capacity_checked_before_sampling() {
        let scene = parallel_plates();
        let mut config = small_config();
        config.max_patches = 3;
        let err = RadiositySimulation::new(&scene, SoftwareRasterizer::new(), config)
            .err()
            .unwrap();
        assert_eq!(
            err.downcast_ref::<RadiosityError>(),
            Some(&RadiosityError::PatchCapacityExceeded {
                count: 4,
                capacity: 3
            })
        );
    }

    #[test]
    fn test_parallel_plates_form_factor() -> Result<()> {
        // Point form factor from either triangle centroid to the opposite
        // unit square one unit away is ~0.225 (plate-to-plate would be 0.1998).
        let scene = parallel_plates();
        let mut config = small_config();
        config.resolution = 64;
        let mut sim = RadiositySimulation::new(&scene, SoftwareRasterizer::new(), config)?;
        sim.sample()?;
        let f = sim.matrix().unwrap();
        let areas = sim.registry().areas();

        let mut plate_to_plate = 0.0;
        for i in 0..2 {
            for j in 2..4 {
                plate_to_plate += areas[i] * f.get(i, j);
            }
        }
        assert!(
            (plate_to_plate - 0.225).abs() < 0.01,
            "bottom->top form factor {plate_to_plate}"
        );
        for i in 0..4 {
            for j in 0..4 {
                let v = f.get(i, j);
                assert!(v.is_finite() && v >= 0.0);
            }
            assert_eq!(f.get(i, i), 0.0);
        }
        Ok(())
    }

    #[test]
    fn test_serial_and_pipelined_sampling_agree() -> Result<()> {
        let scene = cornell_box(0)?;
        let mut matrices = Vec::new();
        for pipeline in [false, true] {
            let mut config = small_config();
            config.pipeline_extraction = pipeline;
            let mut sim = RadiositySimulation::new(&scene, SoftwareRasterizer::new(), config)?;
            sim.sample()?;
            matrices.push(sim.matrix().unwrap().clone());
        }
        assert_eq!(matrices[0], matrices[1]);
        Ok(())
    }

    #[test]
    fn test_progress_reported() -> Result<()> {
        let scene = parallel_plates();
        let mut sim = RadiositySimulation::new(&scene, SoftwareRasterizer::new(), small_config())?;
        let mut seen = Vec::new();
        sim.sample_with_progress(2, |p| seen.push((p.patches_done, p.background_fraction)))?;
        let done: Vec<usize> = seen.iter().map(|s| s.0).collect();
        assert_eq!(done, vec![0, 2, 4]);
        assert!(seen.iter().all(|s| (0.0..=1.0).contains(&s.1)));
        Ok(())
    }

    #[test_log::test]
    fn test_device_failure_retried_once() -> Result<()> {
        let scene = parallel_plates();
        let mut sim = RadiositySimulation::new(&scene, SoftwareRasterizer::new(), small_config())?;
        sim.device_mut().fail_next_frames(1);
        sim.sample()?;
        assert!(sim.matrix().is_some());
        assert_eq!(sim.device().frames_begun(), 4);
        Ok(())
    }

    #[test_log::test]
    fn test_repeated_device_failure_aborts() -> Result<()> {
        let scene = parallel_plates();
        let mut sim = RadiositySimulation::new(&scene, SoftwareRasterizer::new(), small_config())?;
        sim.device_mut().fail_next_frames(2);
        let err = sim.sample().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RadiosityError>(),
            Some(RadiosityError::DeviceFailure(_))
        ));
        assert!(sim.matrix().is_none());
        Ok(())
    }

    #[test]
    fn test_cancelled_sampling_discards_matrix() -> Result<()> {
        let scene = parallel_plates();
        let mut sim = RadiositySimulation::new(&scene, SoftwareRasterizer::new(), small_config())?;
        let token = sim.cancel_token();
        let err = sim
            .sample_with_progress(1, |p| {
                if p.patches_done == 1 {
                    token.cancel();
                }
            })
            .unwrap_err();
        assert_eq!(
            err.downcast_ref::<RadiosityError>(),
            Some(&RadiosityError::Cancelled)
        );
        assert!(sim.matrix().is_none());
        Ok(())
    }

    #[test]
    fn test_solve_requires_matrix() -> Result<()> {
        let sim = RadiositySimulation::new(&parallel_plates(), SoftwareRasterizer::new(), small_config())?;
        assert!(sim.solve().is_err());
        Ok(())
    }

    #[test]
    fn test_run_publishes_and_lights_receiver() -> Result<()> {
        let mut scene = parallel_plates();
        let mut config = small_config();
        config.method = SolveMethod::Direct;
        let mut sim = RadiositySimulation::new(&scene, SoftwareRasterizer::new(), config)?;
        let solution = sim.run(&mut scene)?;
        assert!(solution.converged());

        let bottom = scene.surfaces()[0].mean_exitance().unwrap();
        let top = scene.surfaces()[1].mean_exitance().unwrap();
        // Emitter keeps at least its own emission; receiver gets ~0.5 * 0.2.
        assert!(bottom[0] >= 1.0);
        assert!(top[0] > 0.05 && top[0] < 0.2, "top exitance {}", top[0]);
        Ok(())
    }

    #[test]
    fn test_point_sampling_sees_emitter() -> Result<()> {
        let mut scene = parallel_plates();
        let mut sim = RadiositySimulation::new(&scene, SoftwareRasterizer::new(), small_config())?;
        let solution = sim.run(&mut scene)?;

        // Just below the top plate, looking down at the emitter.
        let occ = sim.sample_point(
            Point::new(0.5, 0.5, 0.9),
            Vector::new(0., 0., -1.),
            Vector::new(0., 1., 0.),
        )?;
        assert!(occ.get(0).is_some() && occ.get(1).is_some());
        assert!(occ.get(2).is_none() && occ.get(3).is_none());
        // Centered unit square 0.9 below: point form factor ~0.28.
        let w = occ.total_weight();
        assert!((w - 0.28).abs() < 0.02, "visible weight {w}");

        let ambient = sim.ambient_at(Point::new(0.5, 0.5, 0.9), Vector::new(0., 0., -1.), &solution)?;
        assert!(ambient[0] > 0.2 && ambient[0] < 0.35, "ambient {}", ambient[0]);
        Ok(())
    }
}
