use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use radiosity3d::scene::cornell_box;
use radiosity3d::sim::radiosity::{
    RadiosityConfig, RadiositySimulation, SoftwareRasterizer, SolveMethod,
};

#[derive(Parser)]
#[command(name = "radiosity3d", about = "Hemicube radiosity on the Cornell box")]
struct Cli {
    /// JSON configuration file (missing fields keep their defaults)
    #[arg(long)]
    config: Option<PathBuf>,
    /// Hemicube resolution (pixels per side, even)
    #[arg(long)]
    resolution: Option<usize>,
    /// Subdivision levels applied to every wall (4^n patches per rectangle half)
    #[arg(long, default_value_t = 2)]
    subdivisions: usize,
    /// Linear solver
    #[arg(long, value_enum)]
    method: Option<SolveMethod>,
    /// Drop/recover the form-factor matrix at this path
    #[arg(long)]
    cache: Option<PathBuf>,
    /// Write a JSON report of the solution
    #[arg(long)]
    report: Option<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => RadiosityConfig::from_json_file(path)?,
        None => RadiosityConfig::new(),
    };
    if let Some(resolution) = cli.resolution {
        config.resolution = resolution;
    }
    if let Some(method) = cli.method {
        config.method = method;
    }
    if cli.cache.is_some() {
        config.matrix_cache = cli.cache.clone();
    }

    let mut scene = cornell_box(cli.subdivisions)?;
    let mut sim = RadiositySimulation::new(&scene, SoftwareRasterizer::new(), config)?;
    let every = sim.registry().len().div_ceil(10).max(1);
    sim.sample_with_progress(every, |p| {
        log::info!(
            "Sampled {}/{} patches ({:.1}% background)",
            p.patches_done,
            p.patch_count,
            100.0 * p.background_fraction
        );
    })?;
    let solution = sim.solve()?;
    sim.publish(&solution, &mut scene)?;

    if !solution.converged() {
        log::warn!("Solution did not fully converge; showing best iterate");
    }
    println!("{:<10} {:>10} {:>10} {:>10}", "surface", "red", "green", "blue");
    for surface in scene.surfaces() {
        if let Some([r, g, b]) = surface.mean_exitance() {
            println!("{:<10} {r:>10.4} {g:>10.4} {b:>10.4}", surface.name);
        }
    }

    if let Some(path) = &cli.report {
        solution.write_json_report(sim.registry(), path)?;
        log::info!("Report written to {}", path.display());
    }
    Ok(())
}
