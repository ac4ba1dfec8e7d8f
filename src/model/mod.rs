//! Bundle-adjustment models.
//!
//! A [`Model`] is a tagged sum over the two model kinds:
//!
//! - [`BaseModel`]: two cameras over flat terrain. The first camera of the
//!   first edge is held fixed; the second camera and one 2D terrain point per
//!   correspondence are estimated.
//! - [`TerrainModel`]: cameras taken from a solved parent model and held
//!   fixed; one 3D terrain point per correspondence is estimated.
//!
//! Models reference their observation graph and parent by id ([`GraphId`],
//! [`ModelId`]) into the arenas owned by [`crate::project::Project`].
//!
//! Every model keeps an ordered history of solutions. Index 0 is the initial
//! guess, optional per-iteration snapshots follow, and the last entry is the
//! converged result.

use log::debug;
use nalgebra::{Point2, Point3};
use serde::{Deserialize, Serialize};

use crate::camera::{
    unproject_to_plane, CameraError, CameraPose, ImageExtent, InternalCalibration,
};
use crate::features::{Edge, FeaturesError, ObservationGraph};
use crate::optimization::{OptimizationError, SolveSummary};
use crate::util::{ProjectionError, UtilError};

pub mod base;
pub mod terrain;

pub use base::{BaseModel, BaseModelSetup};
pub use terrain::TerrainModel;

/// Index of a model in a project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModelId(pub usize);

/// Index of an observation graph in a project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GraphId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelState {
    #[default]
    Uninitialized,
    Initialized,
    Solved,
}

/// One optimization outcome of a [`BaseModel`]: camera poses indexed by
/// camera id and flat terrain points indexed by observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Solution {
    pub cameras: Vec<CameraPose>,
    pub terrain: Vec<Point2<f64>>,
}

/// One optimization outcome of a [`TerrainModel`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerrainSolution {
    pub terrain: Vec<Point3<f64>>,
}

/// Result of a `solve` call.
#[derive(Debug, Clone, PartialEq)]
pub enum SolveReport {
    Solved(SolveSummary),
    /// The model was already solved and was left untouched.
    AlreadySolved,
}

#[derive(thiserror::Error, Debug)]
pub enum ModelError {
    #[error("Observation graph is not computed")]
    GraphNotComputed,
    #[error("Observation graph has no edges")]
    NoEdges,
    #[error("Observation graph has no data set with a known image extent")]
    MissingDataSet,
    #[error("Terrain model has no parent model")]
    MissingParent,
    #[error("Unknown model {0:?}")]
    UnknownModel(ModelId),
    #[error("Unknown observation graph {0:?}")]
    UnknownGraph(GraphId),
    #[error("Not available: {0}")]
    NotAvailable(String),
    #[error("Model is not initialized")]
    NotInitialized,
    #[error("Invalid model parameters: {0}")]
    InvalidParams(String),
    #[error(transparent)]
    Camera(#[from] CameraError),
    #[error(transparent)]
    Features(#[from] FeaturesError),
    #[error(transparent)]
    Util(#[from] UtilError),
    #[error("Solver error: {0}")]
    Solver(String),
    #[error("Solver produced non-finite values for {0}")]
    NonFinite(String),
}

impl ModelError {
    /// Whether the failure is numerical and may succeed from another initial
    /// guess.
    pub fn is_numerical_instability(&self) -> bool {
        match self {
            ModelError::Camera(e) | ModelError::Util(UtilError::Camera(e)) => {
                e.is_numerical_instability()
            }
            ModelError::NonFinite(_) => true,
            _ => false,
        }
    }
}

impl From<OptimizationError> for ModelError {
    fn from(err: OptimizationError) -> Self {
        match err {
            OptimizationError::NonFinite(block) => ModelError::NonFinite(block),
            OptimizationError::NonFiniteInitialResidual => {
                ModelError::Camera(CameraError::ZeroDepth)
            }
            other => ModelError::Solver(other.to_string()),
        }
    }
}

/// A model of either kind, as stored in a project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Model {
    Base(BaseModel),
    Terrain(TerrainModel),
}

impl Model {
    pub fn graph(&self) -> GraphId {
        match self {
            Model::Base(m) => m.graph,
            Model::Terrain(m) => m.graph,
        }
    }

    pub fn parent(&self) -> Option<ModelId> {
        match self {
            Model::Base(_) => None,
            Model::Terrain(m) => m.parent,
        }
    }

    pub fn state(&self) -> ModelState {
        match self {
            Model::Base(m) => m.state(),
            Model::Terrain(m) => m.state(),
        }
    }

    pub fn is_solved(&self) -> bool {
        self.state() == ModelState::Solved
    }

    pub fn as_base(&self) -> Option<&BaseModel> {
        match self {
            Model::Base(m) => Some(m),
            Model::Terrain(_) => None,
        }
    }

    pub fn final_external(&self) -> Result<&[CameraPose], ModelError> {
        match self {
            Model::Base(m) => m.final_external(),
            Model::Terrain(m) => m.final_external(),
        }
    }

    /// `[f, ppx, ppy, pixel_pitch]` of the model.
    pub fn final_internal(&self) -> [f64; 4] {
        match self {
            Model::Base(m) => m.final_internal(),
            Model::Terrain(m) => m.final_internal(),
        }
    }

    pub fn final_terrain(&self) -> Result<Vec<Point3<f64>>, ModelError> {
        match self {
            Model::Base(m) => m.final_terrain(),
            Model::Terrain(m) => m.final_terrain(),
        }
    }

    pub fn num_solutions(&self) -> usize {
        match self {
            Model::Base(m) => m.solutions().len(),
            Model::Terrain(m) => m.solutions().len(),
        }
    }

    /// Reprojection error statistics in pixels for solution `index`.
    pub fn reprojection_error(
        &self,
        graph: &ObservationGraph,
        index: usize,
    ) -> Result<ProjectionError, ModelError> {
        match self {
            Model::Base(m) => m.reprojection_error(graph, index),
            Model::Terrain(m) => m.reprojection_error(graph, index),
        }
    }
}

impl From<BaseModel> for Model {
    fn from(model: BaseModel) -> Self {
        Model::Base(model)
    }
}

impl From<TerrainModel> for Model {
    fn from(model: TerrainModel) -> Self {
        Model::Terrain(model)
    }
}

/// Checks that `graph` is ready to be solved and returns its first edge and
/// image extent.
pub(crate) fn first_edge(graph: &ObservationGraph) -> Result<(&Edge, ImageExtent), ModelError> {
    if !graph.computed {
        return Err(ModelError::GraphNotComputed);
    }
    let edge = graph.edges().first().ok_or(ModelError::NoEdges)?;
    let extent = graph.extent().ok_or(ModelError::MissingDataSet)?;
    Ok((edge, extent))
}

fn camera_for(cameras: &[CameraPose], index: usize) -> Result<&CameraPose, ModelError> {
    cameras.get(index).ok_or_else(|| {
        ModelError::InvalidParams(format!(
            "edge references camera {index} but only {} cameras are known",
            cameras.len()
        ))
    })
}

/// Seeds one terrain point per correspondence of `edge` by back-projecting
/// both observations onto the plane at `elevation` and averaging the two.
pub(crate) fn seed_terrain(
    edge: &Edge,
    extent: &ImageExtent,
    internal: &InternalCalibration,
    pixel_pitch: f64,
    cameras: &[CameraPose],
    elevation: f64,
) -> Result<Vec<Point2<f64>>, ModelError> {
    let pose_a = camera_for(cameras, edge.cam_a())?;
    let pose_b = camera_for(cameras, edge.cam_b())?;

    let mut points = Vec::with_capacity(edge.len());
    for (obs_a, obs_b) in edge.pairs() {
        let ground_a = unproject_to_plane(
            internal,
            pose_a,
            &obs_a.to_sensor(pixel_pitch, extent),
            elevation,
        )?;
        let ground_b = unproject_to_plane(
            internal,
            pose_b,
            &obs_b.to_sensor(pixel_pitch, extent),
            elevation,
        )?;
        points.push(Point2::new(
            (ground_a.x + ground_b.x) / 2.0,
            (ground_a.y + ground_b.y) / 2.0,
        ));
    }
    debug!("Seeded {} terrain points at elevation {elevation}", points.len());
    Ok(points)
}

#[cfg(test)]
pub(crate) mod test_scene {
    //! Synthetic two-camera scenes shared by the model, bootstrap and project
    //! tests.

    use super::*;
    use crate::camera::project;
    use crate::features::DataSet;

    pub const PIXEL_PITCH: f64 = 0.0085e-3;

    pub fn internal() -> InternalCalibration {
        InternalCalibration::new(48.3355e-3, 0.0093e-3, -0.0276e-3)
    }

    pub fn extent() -> ImageExtent {
        ImageExtent::new(2832, 4256)
    }

    pub fn true_cameras() -> Vec<CameraPose> {
        vec![
            CameraPose::new(0.0, 0.0, 269.0, 0.0, 0.0, 0.0),
            CameraPose::new(12.0, 3.0, 268.0, 0.004, -0.003, 0.01),
        ]
    }

    /// Ground points seen by both cameras, with elevation `z`.
    pub fn ground_points(n: usize, z: f64) -> Vec<Point3<f64>> {
        (0..n)
            .map(|k| {
                let a = k as f64;
                Point3::new(
                    -50.0 + 22.0 * (a % 5.0) + 1.3 * a,
                    -35.0 + 17.0 * (a / 5.0).floor() - 0.7 * a,
                    z,
                )
            })
            .collect()
    }

    /// Projects `points` through both cameras into pixel observations.
    pub fn graph_for(cameras: &[CameraPose], points: &[Point3<f64>]) -> ObservationGraph {
        let mut edge = Edge::new(0, 1).unwrap();
        for p in points {
            let a = project(&internal(), &cameras[0], p).unwrap();
            let b = project(&internal(), &cameras[1], p).unwrap();
            edge.push(
                a.to_pixel(PIXEL_PITCH, &extent()),
                b.to_pixel(PIXEL_PITCH, &extent()),
            );
        }
        let data_set = DataSet::with_extent(vec!["a.png".into(), "b.png".into()], extent());
        ObservationGraph::from_edges(data_set, vec![edge])
    }

    pub fn flat_graph(n: usize) -> ObservationGraph {
        graph_for(&true_cameras(), &ground_points(n, 0.0))
    }
}
