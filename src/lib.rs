//! Geosolve Library
//!
//! Two-camera photogrammetric bundle adjustment over aerial image pairs.
//! This library provides:
//! - The camera geometry kernel: rotation convention, projection and
//!   back-projection onto a horizontal plane
//! - Pixel/sensor coordinate transforms
//! - Observation graphs of pixel correspondences between image pairs
//! - A base camera/terrain model and a terrain refinement model
//! - Bootstrap resampling for parameter uncertainty
//! - JSON project persistence
//!
//! Nonlinear least squares is delegated to the tiny-solver
//! Levenberg-Marquardt optimizer.

pub mod bootstrap;
pub mod camera;
pub mod features;
pub mod geometry;
pub mod model;
pub mod optimization;
pub mod project;
pub mod util;

// Re-export commonly used types
pub use camera::{CameraError, CameraPose, ImageExtent, InternalCalibration};
pub use features::{DataSet, Edge, FeatureMatcher, FeaturesError, ObservationGraph};
pub use geometry::{PixelCoordinate, SensorCoordinate};

pub use bootstrap::{BootstrapConfig, BootstrapError, BootstrapResult};
pub use model::{
    BaseModel, BaseModelSetup, GraphId, Model, ModelError, ModelId, ModelState, SolveReport,
    TerrainModel,
};
pub use optimization::{SolveSummary, SolverOptions};
pub use project::{Project, ProjectConfig, ProjectError};
