//! Terrain refinement model.
//!
//! Takes the camera poses of a solved parent model as constants and
//! re-estimates one 3D terrain point per correspondence of its own
//! observation graph, typically a denser one than the parent's.

use log::info;
use nalgebra::{DVector, Point3};
use serde::{Deserialize, Serialize};

use super::base::{block, camera_block, terrain_block};
use super::{
    first_edge, seed_terrain, GraphId, Model, ModelError, ModelId, ModelState, SolveReport,
    TerrainSolution,
};
use crate::camera::validation::{validate_internal, validate_pixel_pitch};
use crate::camera::{CameraPose, InternalCalibration};
use crate::features::ObservationGraph;
use crate::optimization::{BlockValues, BundleProblem, SolverOptions};
use crate::util::{compute_reprojection_error, ProjectionError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerrainModel {
    pub graph: GraphId,
    pub parent: Option<ModelId>,
    internal: InternalCalibration,
    pixel_pitch: f64,
    /// Parent's final cameras, copied at solve time.
    #[serde(default)]
    cameras: Vec<CameraPose>,
    #[serde(default)]
    state: ModelState,
    #[serde(default)]
    solutions: Vec<TerrainSolution>,
}

impl TerrainModel {
    pub fn new(
        graph: GraphId,
        parent: Option<ModelId>,
        internal: InternalCalibration,
        pixel_pitch: f64,
    ) -> Result<Self, ModelError> {
        validate_internal(&internal)?;
        validate_pixel_pitch(pixel_pitch)?;
        Ok(TerrainModel {
            graph,
            parent,
            internal,
            pixel_pitch,
            cameras: Vec::new(),
            state: ModelState::Uninitialized,
            solutions: Vec::new(),
        })
    }

    /// A terrain model over `graph` inheriting the internals of `parent`.
    pub fn from_parent(
        graph: GraphId,
        parent_id: ModelId,
        parent: &Model,
    ) -> Result<Self, ModelError> {
        let [f, ppx, ppy, pixel_pitch] = parent.final_internal();
        Self::new(
            graph,
            Some(parent_id),
            InternalCalibration::new(f, ppx, ppy),
            pixel_pitch,
        )
    }

    pub fn internal(&self) -> &InternalCalibration {
        &self.internal
    }

    pub fn pixel_pitch(&self) -> f64 {
        self.pixel_pitch
    }

    pub fn state(&self) -> ModelState {
        self.state
    }

    pub fn solutions(&self) -> &[TerrainSolution] {
        &self.solutions
    }

    fn build_problem(
        &self,
        graph: &ObservationGraph,
        cameras: &[CameraPose],
        seeds: &[Point3<f64>],
    ) -> Result<BundleProblem, ModelError> {
        let (edge, extent) = first_edge(graph)?;
        let mut problem = BundleProblem::new();
        for cam in [edge.cam_a(), edge.cam_b()] {
            problem.add_parameter_block(
                camera_block(cam),
                DVector::from_row_slice(&cameras[cam].to_array()),
                true,
            )?;
        }

        let (name_a, name_b) = (camera_block(edge.cam_a()), camera_block(edge.cam_b()));
        for (k, ((obs_a, obs_b), point)) in edge.pairs().zip(seeds).enumerate() {
            let name = terrain_block(k);
            problem.add_parameter_block(
                name.clone(),
                DVector::from_column_slice(point.coords.as_slice()),
                false,
            )?;
            problem.add_reprojection(
                self.internal,
                obs_a.to_sensor(self.pixel_pitch, &extent),
                &name_a,
                &name,
            )?;
            problem.add_reprojection(
                self.internal,
                obs_b.to_sensor(self.pixel_pitch, &extent),
                &name_b,
                &name,
            )?;
        }
        Ok(problem)
    }

    fn solution_from(values: &BlockValues, len: usize) -> Result<TerrainSolution, ModelError> {
        let terrain = (0..len)
            .map(|k| block(values, &terrain_block(k)).map(|v| Point3::new(v[0], v[1], v[2])))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(TerrainSolution { terrain })
    }

    /// Solves the terrain with the cameras fixed to `parent_cameras`, the
    /// parent's `final_external()`.
    ///
    /// Terrain points are seeded at elevation 0 from the averaged
    /// back-projections, as in the base model.
    pub fn solve(
        &mut self,
        graph: &ObservationGraph,
        parent_cameras: Option<&[CameraPose]>,
        options: &SolverOptions,
    ) -> Result<SolveReport, ModelError> {
        if self.state == ModelState::Solved {
            info!("Terrain model already solved, skipping");
            return Ok(SolveReport::AlreadySolved);
        }
        if self.parent.is_none() {
            return Err(ModelError::MissingParent);
        }
        let cameras = parent_cameras.ok_or(ModelError::MissingParent)?;
        let (edge, extent) = first_edge(graph)?;

        let seeds: Vec<Point3<f64>> = seed_terrain(
            edge,
            &extent,
            &self.internal,
            self.pixel_pitch,
            cameras,
            0.0,
        )?
        .into_iter()
        .map(|p| Point3::new(p.x, p.y, 0.0))
        .collect();

        let problem = self.build_problem(graph, cameras, &seeds)?;
        let mut history = Vec::new();
        let (values, summary) = problem.solve(options, |snapshot| history.push(snapshot.clone()))?;

        let mut solutions = vec![TerrainSolution { terrain: seeds }];
        for snapshot in &history {
            solutions.push(Self::solution_from(snapshot, edge.len())?);
        }
        solutions.push(Self::solution_from(&values, edge.len())?);

        self.cameras = cameras.to_vec();
        self.solutions = solutions;
        self.state = ModelState::Solved;
        info!(
            "Terrain model solved: {} points, cost {:.6e} -> {:.6e}",
            edge.len(),
            summary.initial_cost,
            summary.final_cost
        );
        Ok(SolveReport::Solved(summary))
    }

    /// The fixed cameras, identical to the parent's at solve time.
    pub fn final_external(&self) -> Result<&[CameraPose], ModelError> {
        if self.state != ModelState::Solved {
            return Err(ModelError::NotAvailable(
                "cameras of an unsolved terrain model".to_string(),
            ));
        }
        Ok(&self.cameras)
    }

    pub fn final_internal(&self) -> [f64; 4] {
        self.internal.with_pixel_pitch(self.pixel_pitch)
    }

    pub fn final_terrain(&self) -> Result<Vec<Point3<f64>>, ModelError> {
        self.solutions
            .last()
            .map(|s| s.terrain.clone())
            .ok_or_else(|| {
                ModelError::NotAvailable("terrain of an unsolved terrain model".to_string())
            })
    }

    pub fn reprojection_error(
        &self,
        graph: &ObservationGraph,
        index: usize,
    ) -> Result<ProjectionError, ModelError> {
        let solution = self.solutions.get(index).ok_or_else(|| {
            ModelError::NotAvailable(format!(
                "solution {index} of {} for terrain model",
                self.solutions.len()
            ))
        })?;
        let (edge, extent) = first_edge(graph)?;
        Ok(compute_reprojection_error(
            &self.internal,
            self.pixel_pitch,
            &extent,
            edge,
            &self.cameras,
            &solution.terrain,
        )?)
    }
}
