//! Hemicube radiosity: form factors from rasterized patch-id views, then a
//! per-channel linear solve for patch exitance.

pub mod config;
pub mod error;
pub mod extractor;
pub mod hemicube;
pub mod matrix;
pub mod persistence;
pub mod raster;
pub mod registry;
pub mod render;
pub mod result;
pub mod sampler;
pub mod simulation;
pub mod solver;

pub use config::RadiosityConfig;
pub use error::RadiosityError;
pub use extractor::{ExtractStats, FormFactorExtractor, VectorOccluders};
pub use hemicube::{HemicubeFace, HemicubeRig, WeightTables};
pub use matrix::FormFactorMatrix;
pub use persistence::{drop_matrix, recover_matrix};
pub use raster::SoftwareRasterizer;
pub use registry::{BACKGROUND_ID, GeometryFingerprint, Patch, PatchRegistry};
pub use render::{FaceCamera, PixelBuffer, RenderDevice};
pub use result::{ChannelReport, RadiositySolution};
pub use sampler::{HemicubeSample, VisibilitySampler};
pub use simulation::{CancelToken, RadiositySimulation, SamplingProgress};
pub use solver::{ChannelProblem, ChannelSolution, SolveMethod};
