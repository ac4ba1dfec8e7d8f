//! The `optimization` module adapts the bundle-adjustment problems built by
//! the models to the `tiny_solver` Levenberg-Marquardt optimizer.
//!
//! A [`BundleProblem`] holds named parameter blocks (camera poses and terrain
//! points), each flagged fixed or free, plus a list of reprojection residuals
//! referencing those blocks by name. Fixed blocks never reach the solver:
//! their values are baked into the residuals that use them, so they come back
//! from [`BundleProblem::solve`] bit-identical to their initial values.
//!
//! Solving can optionally be stepped one iteration at a time, which lets the
//! caller record a snapshot of the parameters after every iteration.

use std::collections::HashMap;

use log::info;
use nalgebra::DVector;
use serde::{Deserialize, Serialize};
use tiny_solver::factors::Factor;
use tiny_solver::ResidualBlock;

use crate::camera::InternalCalibration;
use crate::geometry::SensorCoordinate;

mod levenberg_marquardt;
pub mod reprojection;

use levenberg_marquardt::{LevenbergMarquardt, LinkedResidual};
pub use reprojection::ReprojectionFactor;

/// Parameter values keyed by block name.
pub type BlockValues = HashMap<String, DVector<f64>>;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum OptimizationError {
    #[error("Parameter block {0} is already defined")]
    DuplicateBlock(String),
    #[error("Unknown parameter block {0}")]
    UnknownBlock(String),
    #[error("Block {0} can't be both the pose and the point of a residual")]
    SelfResidual(String),
    #[error("Residual is not finite at the initial parameters")]
    NonFiniteInitialResidual,
    #[error("Solver produced non-finite values for block {0}")]
    NonFinite(String),
    #[error("Solver failed: {0}")]
    SolverFailed(String),
}

/// Dense solver for the reduced camera system left after eliminating the
/// terrain points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinearSolver {
    #[default]
    Cholesky,
    Qr,
}

/// Solver settings shared by every model solve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverOptions {
    pub max_iterations: usize,
    /// Kept for configuration compatibility. The reduced system is factored
    /// directly, so this has no effect on the solve.
    pub max_linear_solver_iterations: usize,
    pub linear_solver: LinearSolver,
    /// Stopping thresholds on the sum of squared residuals. Residuals are in
    /// sensor metres, so that sum starts around 1e-9.
    pub min_abs_decrease: f64,
    pub min_rel_decrease: f64,
    pub min_error: f64,
    /// Record a snapshot of the parameters after every iteration.
    pub record_history: bool,
}

impl Default for SolverOptions {
    fn default() -> Self {
        SolverOptions {
            max_iterations: 30,
            max_linear_solver_iterations: 3,
            linear_solver: LinearSolver::Cholesky,
            min_abs_decrease: 1e-24,
            min_rel_decrease: 1e-10,
            min_error: 1e-28,
            record_history: false,
        }
    }
}

/// Outcome of a [`BundleProblem::solve`] call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolveSummary {
    /// Half the sum of squared residuals at the initial parameters.
    pub initial_cost: f64,
    pub final_cost: f64,
    pub residual_blocks: usize,
    pub parameter_blocks: usize,
    pub free_parameter_blocks: usize,
    /// Levenberg-Marquardt iterations, rejected steps included.
    pub iterations: usize,
}

impl SolveSummary {
    pub fn is_success(&self) -> bool {
        self.final_cost.is_finite() && self.final_cost <= self.initial_cost * (1.0 + 1e-9)
    }
}

#[derive(Debug, Clone)]
struct ParameterBlock {
    name: String,
    values: DVector<f64>,
    fixed: bool,
}

#[derive(Debug, Clone)]
struct ReprojectionTerm {
    internal: InternalCalibration,
    observed: SensorCoordinate,
    pose: usize,
    point: usize,
}

/// A bundle-adjustment problem: named parameter blocks and reprojection
/// residuals connecting a pose block to a point block.
#[derive(Debug, Clone, Default)]
pub struct BundleProblem {
    blocks: Vec<ParameterBlock>,
    index: HashMap<String, usize>,
    residuals: Vec<ReprojectionTerm>,
}

impl BundleProblem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_parameter_block(
        &mut self,
        name: impl Into<String>,
        values: DVector<f64>,
        fixed: bool,
    ) -> Result<(), OptimizationError> {
        let name = name.into();
        if self.index.contains_key(&name) {
            return Err(OptimizationError::DuplicateBlock(name));
        }
        self.index.insert(name.clone(), self.blocks.len());
        self.blocks.push(ParameterBlock {
            name,
            values,
            fixed,
        });
        Ok(())
    }

    /// Adds the residual `project(internal, pose, point) - observed`.
    pub fn add_reprojection(
        &mut self,
        internal: InternalCalibration,
        observed: SensorCoordinate,
        pose: &str,
        point: &str,
    ) -> Result<(), OptimizationError> {
        let pose_index = self.block_index(pose)?;
        let point_index = self.block_index(point)?;
        if pose_index == point_index {
            return Err(OptimizationError::SelfResidual(pose.to_string()));
        }
        self.residuals.push(ReprojectionTerm {
            internal,
            observed,
            pose: pose_index,
            point: point_index,
        });
        Ok(())
    }

    fn block_index(&self, name: &str) -> Result<usize, OptimizationError> {
        self.index
            .get(name)
            .copied()
            .ok_or_else(|| OptimizationError::UnknownBlock(name.to_string()))
    }

    pub fn num_residual_blocks(&self) -> usize {
        self.residuals.len()
    }

    pub fn num_parameter_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn num_free_parameter_blocks(&self) -> usize {
        self.blocks.iter().filter(|b| !b.fixed).count()
    }

    pub fn is_fixed(&self, name: &str) -> Option<bool> {
        self.index.get(name).map(|&i| self.blocks[i].fixed)
    }

    pub fn initial_values(&self) -> BlockValues {
        self.blocks
            .iter()
            .map(|b| (b.name.clone(), b.values.clone()))
            .collect()
    }

    /// The factor of `residual` with its fixed blocks baked in, and the names
    /// of its free blocks in argument order.
    fn factor_for(&self, residual: &ReprojectionTerm) -> (ReprojectionFactor, Vec<String>) {
        let pose = &self.blocks[residual.pose];
        let point = &self.blocks[residual.point];
        let mut factor = ReprojectionFactor::new(residual.internal, residual.observed);
        let mut names = Vec::with_capacity(2);
        if pose.fixed {
            factor = factor.with_fixed_pose(pose.values.as_slice());
        } else {
            names.push(pose.name.clone());
        }
        if point.fixed {
            factor = factor.with_fixed_point(point.values.as_slice());
        } else {
            names.push(point.name.clone());
        }
        (factor, names)
    }

    /// Half the sum of squared residuals at `values`. Blocks missing from
    /// `values` take their initial value.
    pub fn cost(&self, values: &BlockValues) -> f64 {
        let mut total = 0.0;
        for residual in &self.residuals {
            let (factor, names) = self.factor_for(residual);
            let params: Vec<DVector<f64>> = names
                .iter()
                .map(|n| {
                    values
                        .get(n)
                        .cloned()
                        .unwrap_or_else(|| self.blocks[self.index[n]].values.clone())
                })
                .collect();
            let r: DVector<f64> = Factor::<f64>::residual_func(&factor, &params);
            total += 0.5 * r.norm_squared();
        }
        total
    }

    /// Indices of the free blocks, in insertion order.
    fn free_blocks(&self) -> Vec<usize> {
        (0..self.blocks.len()).filter(|&i| !self.blocks[i].fixed).collect()
    }

    /// One auto-differentiated residual per reprojection, linked to the
    /// positions of its free blocks in `free`.
    fn link(&self, free: &[usize]) -> Vec<LinkedResidual> {
        let mut position = vec![None; self.blocks.len()];
        for (k, &i) in free.iter().enumerate() {
            position[i] = Some(k);
        }
        self.residuals
            .iter()
            .enumerate()
            .map(|(id, residual)| {
                let (factor, names) = self.factor_for(residual);
                let names: Vec<&str> = names.iter().map(String::as_str).collect();
                LinkedResidual {
                    block: ResidualBlock::new(
                        id,
                        ReprojectionFactor::RESIDUAL_DIM,
                        id * ReprojectionFactor::RESIDUAL_DIM,
                        &names,
                        Box::new(factor),
                        None,
                    ),
                    pose: position[residual.pose],
                    point: position[residual.point],
                }
            })
            .collect()
    }

    /// Initial values with the free blocks replaced by `free_values`.
    fn assemble(&self, free: &[usize], free_values: &[DVector<f64>]) -> BlockValues {
        let mut values = self.initial_values();
        for (&i, v) in free.iter().zip(free_values) {
            values.insert(self.blocks[i].name.clone(), v.clone());
        }
        values
    }

    /// Runs Levenberg-Marquardt over the free blocks.
    ///
    /// Returns the values of every block (fixed blocks unchanged) together
    /// with a summary. When `options.record_history` is set, `on_iteration`
    /// is called with the full set of values after every iteration of the
    /// same solve, so recording does not change the result.
    pub fn solve<F>(
        &self,
        options: &SolverOptions,
        mut on_iteration: F,
    ) -> Result<(BlockValues, SolveSummary), OptimizationError>
    where
        F: FnMut(&BlockValues),
    {
        let initial = self.initial_values();
        let initial_cost = self.cost(&initial);
        if !initial_cost.is_finite() {
            return Err(OptimizationError::NonFiniteInitialResidual);
        }

        let mut summary = SolveSummary {
            initial_cost,
            final_cost: initial_cost,
            residual_blocks: self.num_residual_blocks(),
            parameter_blocks: self.num_parameter_blocks(),
            free_parameter_blocks: self.num_free_parameter_blocks(),
            iterations: 0,
        };
        info!(
            "Solving bundle problem: {} residual blocks, {} parameter blocks ({} free), \
             initial cost {:.6e}",
            summary.residual_blocks,
            summary.parameter_blocks,
            summary.free_parameter_blocks,
            initial_cost
        );

        let free = self.free_blocks();
        if free.is_empty() || self.residuals.is_empty() {
            return Ok((initial, summary));
        }

        let linked = self.link(&free);
        let start: Vec<DVector<f64>> =
            free.iter().map(|&i| self.blocks[i].values.clone()).collect();
        let sizes = start.iter().map(|v| v.len()).collect();
        let optimizer = LevenbergMarquardt::new(&linked, sizes);
        let (solved, iterations) = optimizer.minimize(start, options, |values| {
            if options.record_history {
                on_iteration(&self.assemble(&free, values));
            }
        })?;

        for (&i, v) in free.iter().zip(&solved) {
            if v.iter().any(|x| !x.is_finite()) {
                return Err(OptimizationError::NonFinite(self.blocks[i].name.clone()));
            }
        }
        let result = self.assemble(&free, &solved);
        summary.iterations = iterations;
        summary.final_cost = 0.5 * optimizer.squared_norm(&solved);
        info!(
            "Optimization finished after {} iterations: cost {:.6e} -> {:.6e}",
            iterations, summary.initial_cost, summary.final_cost
        );
        Ok((result, summary))
    }
}
