//! Base camera/terrain model.
//!
//! Two cameras over flat terrain at elevation 0. The model works on the first
//! edge of its observation graph: camera `cam_a` is held fixed to remove the
//! gauge freedom, camera `cam_b` and one 2D terrain point per correspondence
//! are free.

use log::info;
use nalgebra::{DVector, Point2, Point3};
use serde::{Deserialize, Serialize};

use super::{first_edge, seed_terrain, GraphId, ModelError, ModelState, Solution, SolveReport};
use crate::camera::validation::{validate_internal, validate_pixel_pitch, validate_pose};
use crate::camera::{CameraPose, InternalCalibration};
use crate::features::ObservationGraph;
use crate::optimization::{BlockValues, BundleProblem, SolverOptions};
use crate::util::{compute_reprojection_error, ProjectionError};

/// Construction parameters of a [`BaseModel`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaseModelSetup {
    pub internal: InternalCalibration,
    pub pixel_pitch: f64,
    /// Initial poses, indexed by camera id.
    pub cameras: Vec<CameraPose>,
}

impl BaseModelSetup {
    pub fn validate(&self) -> Result<(), ModelError> {
        validate_internal(&self.internal)?;
        validate_pixel_pitch(self.pixel_pitch)?;
        if self.cameras.len() < 2 {
            return Err(ModelError::InvalidParams(format!(
                "base model needs two initial camera poses, got {}",
                self.cameras.len()
            )));
        }
        for pose in &self.cameras {
            validate_pose(pose)?;
        }
        Ok(())
    }
}

pub(crate) fn camera_block(index: usize) -> String {
    format!("camera/{index}")
}

pub(crate) fn terrain_block(index: usize) -> String {
    format!("terrain/{index}")
}

pub(crate) fn block<'a>(
    values: &'a BlockValues,
    name: &str,
) -> Result<&'a DVector<f64>, ModelError> {
    values
        .get(name)
        .ok_or_else(|| ModelError::Solver(format!("solver returned no values for {name}")))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaseModel {
    pub graph: GraphId,
    internal: InternalCalibration,
    pixel_pitch: f64,
    initial_cameras: Vec<CameraPose>,
    #[serde(default)]
    state: ModelState,
    #[serde(default)]
    solutions: Vec<Solution>,
}

impl BaseModel {
    pub fn new(graph: GraphId, setup: BaseModelSetup) -> Result<Self, ModelError> {
        setup.validate()?;
        Ok(BaseModel {
            graph,
            internal: setup.internal,
            pixel_pitch: setup.pixel_pitch,
            initial_cameras: setup.cameras,
            state: ModelState::Uninitialized,
            solutions: Vec::new(),
        })
    }

    pub fn internal(&self) -> &InternalCalibration {
        &self.internal
    }

    pub fn pixel_pitch(&self) -> f64 {
        self.pixel_pitch
    }

    pub fn initial_cameras(&self) -> &[CameraPose] {
        &self.initial_cameras
    }

    pub fn state(&self) -> ModelState {
        self.state
    }

    pub fn solutions(&self) -> &[Solution] {
        &self.solutions
    }

    /// Drops every solution and returns to the uninitialized state.
    pub fn reset(&mut self) {
        self.state = ModelState::Uninitialized;
        self.solutions.clear();
    }

    /// Computes the initial guess from the first edge of `graph`: the initial
    /// camera poses and one terrain point per correspondence, seeded by
    /// back-projecting both observations to elevation 0 and averaging.
    ///
    /// Replaces any existing solutions.
    pub fn initialize(&mut self, graph: &ObservationGraph) -> Result<(), ModelError> {
        let (edge, extent) = first_edge(graph)?;
        let terrain = seed_terrain(
            edge,
            &extent,
            &self.internal,
            self.pixel_pitch,
            &self.initial_cameras,
            0.0,
        )?;
        info!(
            "Initialized base model: cameras ({}, {}), {} terrain points",
            edge.cam_a(),
            edge.cam_b(),
            terrain.len()
        );
        self.solutions = vec![Solution {
            cameras: self.initial_cameras.clone(),
            terrain,
        }];
        self.state = ModelState::Initialized;
        Ok(())
    }

    /// Builds the bundle-adjustment problem over the initial guess: two
    /// residuals per correspondence, `cam_a` fixed, `cam_b` and every terrain
    /// point free.
    pub fn build_problem(&self, graph: &ObservationGraph) -> Result<BundleProblem, ModelError> {
        let (edge, extent) = first_edge(graph)?;
        let initial = self.solutions.first().ok_or(ModelError::NotInitialized)?;
        if initial.terrain.len() != edge.len() {
            return Err(ModelError::NotInitialized);
        }

        let mut problem = BundleProblem::new();
        for (cam, fixed) in [(edge.cam_a(), true), (edge.cam_b(), false)] {
            let pose = initial.cameras.get(cam).ok_or_else(|| {
                ModelError::InvalidParams(format!("no initial pose for camera {cam}"))
            })?;
            problem.add_parameter_block(
                camera_block(cam),
                DVector::from_row_slice(&pose.to_array()),
                fixed,
            )?;
        }

        let (name_a, name_b) = (camera_block(edge.cam_a()), camera_block(edge.cam_b()));
        for (k, ((obs_a, obs_b), point)) in edge.pairs().zip(&initial.terrain).enumerate() {
            let name = terrain_block(k);
            problem.add_parameter_block(
                name.clone(),
                DVector::from_vec(vec![point.x, point.y]),
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

    fn solution_from(
        &self,
        graph: &ObservationGraph,
        values: &BlockValues,
    ) -> Result<Solution, ModelError> {
        let (edge, _) = first_edge(graph)?;
        let initial = self.solutions.first().ok_or(ModelError::NotInitialized)?;

        let mut cameras = initial.cameras.clone();
        for cam in [edge.cam_a(), edge.cam_b()] {
            cameras[cam] = CameraPose::from_slice(block(values, &camera_block(cam))?.as_slice())?;
        }
        let terrain = (0..initial.terrain.len())
            .map(|k| block(values, &terrain_block(k)).map(|v| Point2::new(v[0], v[1])))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Solution { cameras, terrain })
    }

    /// Solves the model, initializing it first if needed.
    ///
    /// Appends one solution per iteration when `options.record_history` is
    /// set, then the converged solution, and marks the model solved. Solving
    /// a solved model does nothing and reports [`SolveReport::AlreadySolved`].
    pub fn solve(
        &mut self,
        graph: &ObservationGraph,
        options: &SolverOptions,
    ) -> Result<SolveReport, ModelError> {
        if self.state == ModelState::Solved {
            info!("Base model already solved, skipping");
            return Ok(SolveReport::AlreadySolved);
        }
        first_edge(graph)?;
        if self.state == ModelState::Uninitialized {
            self.initialize(graph)?;
        }

        let problem = self.build_problem(graph)?;
        let mut history = Vec::new();
        let (values, summary) = problem.solve(options, |snapshot| history.push(snapshot.clone()))?;

        let mut solutions = Vec::with_capacity(history.len() + 1);
        for snapshot in &history {
            solutions.push(self.solution_from(graph, snapshot)?);
        }
        solutions.push(self.solution_from(graph, &values)?);

        self.solutions.extend(solutions);
        self.state = ModelState::Solved;
        info!(
            "Base model solved: cost {:.6e} -> {:.6e}, {} solutions",
            summary.initial_cost,
            summary.final_cost,
            self.solutions.len()
        );
        Ok(SolveReport::Solved(summary))
    }

    fn last(&self) -> Result<&Solution, ModelError> {
        self.solutions.last().ok_or(ModelError::NotInitialized)
    }

    /// Camera poses of the last solution.
    pub fn final_external(&self) -> Result<&[CameraPose], ModelError> {
        Ok(&self.last()?.cameras)
    }

    /// `[f, ppx, ppy, pixel_pitch]`. Internals are not estimated, so this is
    /// the construction value.
    pub fn final_internal(&self) -> [f64; 4] {
        self.internal.with_pixel_pitch(self.pixel_pitch)
    }

    /// Terrain points of the last solution at elevation 0.
    pub fn final_terrain(&self) -> Result<Vec<Point3<f64>>, ModelError> {
        Ok(pad_terrain(&self.last()?.terrain))
    }

    pub fn reprojection_error(
        &self,
        graph: &ObservationGraph,
        index: usize,
    ) -> Result<ProjectionError, ModelError> {
        let solution = self.solutions.get(index).ok_or_else(|| {
            ModelError::NotAvailable(format!(
                "solution {index} of {} for base model",
                self.solutions.len()
            ))
        })?;
        let (edge, extent) = first_edge(graph)?;
        Ok(compute_reprojection_error(
            &self.internal,
            self.pixel_pitch,
            &extent,
            edge,
            &solution.cameras,
            &pad_terrain(&solution.terrain),
        )?)
    }
}

fn pad_terrain(terrain: &[Point2<f64>]) -> Vec<Point3<f64>> {
    terrain.iter().map(|p| Point3::new(p.x, p.y, 0.0)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::CameraError;
    use crate::model::test_scene::*;
    use crate::model::Model;
    use approx::assert_relative_eq;

    fn setup(cameras: Vec<CameraPose>) -> BaseModelSetup {
        BaseModelSetup {
            internal: internal(),
            pixel_pitch: PIXEL_PITCH,
            cameras,
        }
    }

    fn perturbed_cameras() -> Vec<CameraPose> {
        let mut cameras = true_cameras();
        cameras[1].x += 0.8;
        cameras[1].y -= 0.4;
        cameras[1].yaw += 0.002;
        cameras
    }

    #[test]
    fn test_problem_has_two_residuals_per_correspondence() {
        let graph = flat_graph(10);
        let mut model = BaseModel::new(GraphId(0), setup(perturbed_cameras())).unwrap();
        model.initialize(&graph).unwrap();
        let problem = model.build_problem(&graph).unwrap();
        assert_eq!(problem.num_residual_blocks(), 20);
        assert_eq!(problem.num_parameter_blocks(), 2 + 10);
        assert_eq!(problem.num_free_parameter_blocks(), 1 + 10);
        assert_eq!(problem.is_fixed("camera/0"), Some(true));
        assert_eq!(problem.is_fixed("camera/1"), Some(false));
    }

    #[test]
    fn test_solve_from_identical_initial_cameras() {
        let graph = flat_graph(10);
        let start = CameraPose::new(0.0, 0.0, 269.0, 0.0, 0.0, 0.0);
        let mut model = BaseModel::new(GraphId(0), setup(vec![start, start])).unwrap();

        let report = model.solve(&graph, &SolverOptions::default()).unwrap();
        let SolveReport::Solved(summary) = report else {
            panic!("expected a fresh solve");
        };
        assert!(summary.is_success());
        assert_eq!(model.state(), ModelState::Solved);

        let cameras = model.final_external().unwrap();
        assert_eq!(cameras[0], start);
        assert_ne!(cameras[1], start);
    }

    #[test]
    fn test_solve_recovers_scene() {
        let graph = flat_graph(10);
        let mut model = BaseModel::new(GraphId(0), setup(perturbed_cameras())).unwrap();
        let report = model.solve(&graph, &SolverOptions::default()).unwrap();
        let SolveReport::Solved(summary) = report else {
            panic!("expected a fresh solve");
        };
        assert!(summary.final_cost < summary.initial_cost * 1e-4);

        let initial_error = model.reprojection_error(&graph, 0).unwrap();
        let final_error = model.reprojection_error(&graph, model.solutions().len() - 1).unwrap();
        assert!(final_error.rmse < initial_error.rmse);
        assert!(final_error.rmse < 0.05, "{final_error:?}");
    }

    #[test]
    fn test_gauge_camera_is_bit_identical() {
        let graph = flat_graph(10);
        let mut cameras = perturbed_cameras();
        cameras[0] = CameraPose::new(0.1, -0.2, 269.3, 0.0012, -0.0007, 0.003);
        let mut model = BaseModel::new(GraphId(0), setup(cameras.clone())).unwrap();
        model.solve(&graph, &SolverOptions::default()).unwrap();
        let solved = model.final_external().unwrap();
        assert_eq!(solved[0].to_array(), cameras[0].to_array());
    }

    #[test]
    fn test_second_solve_is_a_no_op() {
        let graph = flat_graph(10);
        let mut model = BaseModel::new(GraphId(0), setup(perturbed_cameras())).unwrap();
        model.solve(&graph, &SolverOptions::default()).unwrap();
        let before = model.clone();
        let report = model.solve(&graph, &SolverOptions::default()).unwrap();
        assert_eq!(report, SolveReport::AlreadySolved);
        assert_eq!(model, before);
    }

    #[test]
    fn test_history_is_recorded() {
        let graph = flat_graph(10);
        let mut model = BaseModel::new(GraphId(0), setup(perturbed_cameras())).unwrap();
        let options = SolverOptions {
            record_history: true,
            ..SolverOptions::default()
        };
        let SolveReport::Solved(summary) = model.solve(&graph, &options).unwrap() else {
            panic!("expected a fresh solve");
        };
        assert_eq!(model.solutions().len(), 1 + summary.iterations + 1);
        assert_eq!(
            model.solutions().last(),
            model.solutions().get(model.solutions().len() - 2)
        );
    }

    #[test]
    fn test_history_leaves_final_solution_unchanged() {
        let graph = flat_graph(10);
        let start = CameraPose::new(0.0, 0.0, 269.0, 0.0, 0.0, 0.0);

        let mut plain = BaseModel::new(GraphId(0), setup(vec![start, start])).unwrap();
        plain.solve(&graph, &SolverOptions::default()).unwrap();

        let mut recorded = BaseModel::new(GraphId(0), setup(vec![start, start])).unwrap();
        let options = SolverOptions {
            record_history: true,
            ..SolverOptions::default()
        };
        recorded.solve(&graph, &options).unwrap();

        assert!(recorded.solutions().len() > plain.solutions().len());
        assert_eq!(recorded.solutions().last(), plain.solutions().last());
        assert_eq!(recorded.final_external().unwrap(), plain.final_external().unwrap());
    }

    #[test]
    fn test_repeated_solves_are_bit_identical() {
        let graph = flat_graph(10);
        let mut first = BaseModel::new(GraphId(0), setup(perturbed_cameras())).unwrap();
        let mut second = first.clone();
        first.solve(&graph, &SolverOptions::default()).unwrap();
        second.solve(&graph, &SolverOptions::default()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_uncomputed_graph_leaves_model_untouched() {
        let mut graph = flat_graph(10);
        graph.computed = false;
        let mut model = BaseModel::new(GraphId(0), setup(perturbed_cameras())).unwrap();
        let err = model.solve(&graph, &SolverOptions::default()).unwrap_err();
        assert!(matches!(err, ModelError::GraphNotComputed));
        assert_eq!(model.state(), ModelState::Uninitialized);
        assert!(model.solutions().is_empty());
        assert!(matches!(model.final_external(), Err(ModelError::NotInitialized)));
    }

    #[test]
    fn test_final_terrain_is_padded() {
        let graph = flat_graph(5);
        let mut model = BaseModel::new(GraphId(0), setup(true_cameras())).unwrap();
        model.initialize(&graph).unwrap();
        let terrain = model.final_terrain().unwrap();
        assert_eq!(terrain.len(), 5);
        for (p, truth) in terrain.iter().zip(ground_points(5, 0.0)) {
            assert_eq!(p.z, 0.0);
            assert_relative_eq!(p.x, truth.x, epsilon = 1e-6);
        }
        assert_eq!(
            model.final_internal(),
            [48.3355e-3, 0.0093e-3, -0.0276e-3, PIXEL_PITCH]
        );
    }

    #[test]
    fn test_setup_validation() {
        let mut bad = setup(true_cameras());
        bad.pixel_pitch = 0.0;
        assert!(matches!(
            BaseModel::new(GraphId(0), bad),
            Err(ModelError::Camera(CameraError::PixelPitchMustBePositive))
        ));
        assert!(matches!(
            BaseModel::new(GraphId(0), setup(vec![CameraPose::nadir(1.0)])),
            Err(ModelError::InvalidParams(_))
        ));
    }

    #[test]
    fn test_serializes_tagged() {
        let graph = flat_graph(3);
        let mut base = BaseModel::new(GraphId(0), setup(true_cameras())).unwrap();
        base.initialize(&graph).unwrap();
        let model = Model::from(base);
        let json = serde_json::to_value(&model).unwrap();
        assert_eq!(json["type"], "base");
        assert_eq!(json["state"], "initialized");
        let back: Model = serde_json::from_value(json).unwrap();
        assert_eq!(back, model);
    }
}
