use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use super::error::RadiosityError;
use super::solver::SolveMethod;

/// Configuration for a radiosity run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RadiosityConfig {
    /// Hemicube pixels per side (front face is `resolution^2`, sides half that).
    pub resolution: usize,
    /// World-space hemicube side length, only used for debug outlines.
    pub side_length: f64,
    /// Distance the sampling eye is pushed along the patch normal.
    pub sample_offset: f64,
    /// Near clip distance of the five face cameras.
    pub near: f64,
    /// Far clip distance of the five face cameras.
    pub far: f64,
    /// Patch-count ceiling for the session (matrix memory is O(N^2)).
    pub max_patches: usize,
    /// Linear solver used per color channel.
    pub method: SolveMethod,
    /// Convergence threshold (squared residual sum, or unshot energy for Southwell).
    pub tolerance: f64,
    /// Sweep cap for iterative solvers.
    pub max_sweeps: usize,
    /// Average `A_i F_ij` with `A_j F_ji` after sampling.
    pub enforce_reciprocity: bool,
    /// Seed for random hemicube rotation about the normal; `None` keeps it fixed.
    pub jitter_seed: Option<u64>,
    /// File used to drop/recover the form-factor matrix.
    pub matrix_cache: Option<PathBuf>,
    /// Retries of a failed patch render before the session is aborted.
    pub render_retries: usize,
    /// Extract weights on a worker thread while the next patch renders.
    pub pipeline_extraction: bool,
}

impl RadiosityConfig {
    pub fn new() -> Self {
        Self {
            resolution: 64,
            side_length: 0.1,
            sample_offset: 1e-3,
            near: 1e-4,
            far: 1e4,
            max_patches: 16_384,
            method: SolveMethod::GaussSeidel,
            tolerance: 1e-8,
            max_sweeps: 200,
            enforce_reciprocity: false,
            jitter_seed: None,
            matrix_cache: None,
            render_retries: 1,
            pipeline_extraction: true,
        }
    }

    /// Loads a (partial) configuration from JSON; missing fields keep defaults.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("Failed to open config: {}", path.display()))?;
        let config: Self = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("Failed to parse config: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.resolution == 0 || self.resolution % 2 != 0 {
            return Err(RadiosityError::InvalidResolution(self.resolution).into());
        }
        if !(self.sample_offset.is_finite() && self.sample_offset > 0.0) {
            return Err(RadiosityError::InvalidOffset(self.sample_offset).into());
        }
        anyhow::ensure!(
            self.near > 0.0 && self.near < self.far,
            "Clip range must satisfy 0 < near < far (near = {}, far = {})",
            self.near,
            self.far
        );
        anyhow::ensure!(
            self.tolerance > 0.0,
            "Tolerance must be > 0, got {}",
            self.tolerance
        );
        anyhow::ensure!(self.max_patches > 0, "max_patches must be > 0");
        Ok(())
    }
}

impl Default for RadiosityConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn test_config_defaults() {
        let config = RadiosityConfig::new();
        assert_eq!(config.resolution, 64);
        assert_eq!(config.method, SolveMethod::GaussSeidel);
        assert!(config.matrix_cache.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_odd_resolution() {
        let mut config = RadiosityConfig::new();
        config.resolution = 33;
        let err = config.validate().unwrap_err();
        assert_eq!(
            err.downcast_ref::<RadiosityError>(),
            Some(&RadiosityError::InvalidResolution(33))
        );
    }

    #[test]
    fn test_validate_rejects_zero_offset() {
        let mut config = RadiosityConfig::new();
        config.sample_offset = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_json_keeps_defaults() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("radiosity.json");
        let mut f = File::create(&path)?;
        writeln!(f, r#"{{ "resolution": 32, "method": "southwell" }}"#)?;
        drop(f);

        let config = RadiosityConfig::from_json_file(&path)?;
        assert_eq!(config.resolution, 32);
        assert_eq!(config.method, SolveMethod::Southwell);
        assert_eq!(config.max_sweeps, 200);
        Ok(())
    }
}
