//! Levenberg-Marquardt driver for [`BundleProblem`](super::BundleProblem).
//!
//! Residuals and their Jacobians come from `tiny_solver`'s automatic
//! differentiation. The iteration itself runs here, over the free blocks in
//! insertion order, so two solves of the same problem perform the same
//! floating-point operations and return bit-identical values.
//!
//! The damping schedule follows `tiny_solver::LevenbergMarquardtOptimizer`:
//! Jacobi column scaling fixed on the first iteration, a diagonal damping
//! term clamped to `[1e-6, 1e32]` and the gain-ratio update of the damping
//! factor. A rejected step raises the damping and tries again instead of
//! ending the solve.
//!
//! Blocks that only ever appear as the point of a residual are eliminated
//! with the Schur complement, leaving a dense system over the pose blocks.

use log::{debug, trace};
use nalgebra::{DMatrix, DVector};
use tiny_solver::parameter_block::ParameterBlock;
use tiny_solver::ResidualBlock;

use super::{LinearSolver, OptimizationError, SolverOptions};

const MIN_DIAGONAL: f64 = 1e-6;
const MAX_DIAGONAL: f64 = 1e32;
const INITIAL_TRUST_REGION_RADIUS: f64 = 1e4;
const MAX_DAMPING: f64 = 1e32;

/// A residual and the free blocks it reads, in factor argument order.
pub(super) struct LinkedResidual {
    pub block: ResidualBlock,
    pub pose: Option<usize>,
    pub point: Option<usize>,
}

impl LinkedResidual {
    fn free(&self) -> impl Iterator<Item = usize> + '_ {
        self.pose.into_iter().chain(self.point)
    }

    fn parameter_blocks(&self, values: &[DVector<f64>]) -> Vec<ParameterBlock> {
        self.free()
            .map(|i| ParameterBlock::from_vec(values[i].clone()))
            .collect()
    }

    fn residual(&self, values: &[DVector<f64>]) -> DVector<f64> {
        let blocks = self.parameter_blocks(values);
        let refs: Vec<&ParameterBlock> = blocks.iter().collect();
        self.block.residual(&refs, false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Column {
    /// Offset into the reduced (pose) system.
    Reduced(usize),
    /// Index of an eliminated point block.
    Eliminated(usize),
    /// Referenced by no residual; left untouched.
    Unused,
}

/// Residuals and per-block Jacobians at the current values.
struct Linearization {
    residuals: Vec<DVector<f64>>,
    jacobians: Vec<Vec<(usize, DMatrix<f64>)>>,
    squared_norm: f64,
}

/// Scaled and undamped normal equations, split by the Schur partition.
struct NormalEquations {
    h_rr: DMatrix<f64>,
    g_r: DVector<f64>,
    h_re: Vec<DMatrix<f64>>,
    h_ee: Vec<DMatrix<f64>>,
    g_e: Vec<DVector<f64>>,
}

pub(super) struct LevenbergMarquardt<'a> {
    residuals: &'a [LinkedResidual],
    sizes: Vec<usize>,
    columns: Vec<Column>,
    reduced_dim: usize,
    eliminated_sizes: Vec<usize>,
}

fn damp(matrix: &DMatrix<f64>, u: f64) -> DMatrix<f64> {
    let mut damped = matrix.clone();
    for i in 0..matrix.nrows() {
        damped[(i, i)] += u * matrix[(i, i)].clamp(MIN_DIAGONAL, MAX_DIAGONAL);
    }
    damped
}

impl<'a> LevenbergMarquardt<'a> {
    /// `sizes[i]` is the dimension of free block `i`.
    pub(super) fn new(residuals: &'a [LinkedResidual], sizes: Vec<usize>) -> Self {
        let mut is_pose = vec![false; sizes.len()];
        let mut is_point = vec![false; sizes.len()];
        for residual in residuals {
            if let Some(i) = residual.pose {
                is_pose[i] = true;
            }
            if let Some(i) = residual.point {
                is_point[i] = true;
            }
        }

        let mut columns = Vec::with_capacity(sizes.len());
        let mut reduced_dim = 0;
        let mut eliminated_sizes = Vec::new();
        for (i, &size) in sizes.iter().enumerate() {
            if is_pose[i] {
                columns.push(Column::Reduced(reduced_dim));
                reduced_dim += size;
            } else if is_point[i] {
                columns.push(Column::Eliminated(eliminated_sizes.len()));
                eliminated_sizes.push(size);
            } else {
                columns.push(Column::Unused);
            }
        }

        LevenbergMarquardt {
            residuals,
            sizes,
            columns,
            reduced_dim,
            eliminated_sizes,
        }
    }

    /// Sum of squared residuals.
    pub(super) fn squared_norm(&self, values: &[DVector<f64>]) -> f64 {
        self.residuals
            .iter()
            .map(|r| r.residual(values).norm_squared())
            .sum()
    }

    fn linearize(&self, values: &[DVector<f64>]) -> Result<Linearization, OptimizationError> {
        let mut residuals = Vec::with_capacity(self.residuals.len());
        let mut jacobians = Vec::with_capacity(self.residuals.len());
        let mut squared_norm = 0.0;
        for linked in self.residuals {
            if linked.free().next().is_none() {
                let residual = linked.residual(values);
                squared_norm += residual.norm_squared();
                residuals.push(residual);
                jacobians.push(Vec::new());
                continue;
            }
            let blocks = linked.parameter_blocks(values);
            let refs: Vec<&ParameterBlock> = blocks.iter().collect();
            let (residual, jacobian) = linked.block.residual_and_jacobian(&refs);
            if jacobian.iter().any(|v| !v.is_finite()) {
                return Err(OptimizationError::SolverFailed(
                    "non-finite Jacobian".to_string(),
                ));
            }

            let mut parts = Vec::with_capacity(2);
            let mut col = 0;
            for i in linked.free() {
                let n = self.sizes[i];
                parts.push((i, jacobian.columns(col, n).into_owned()));
                col += n;
            }
            squared_norm += residual.norm_squared();
            residuals.push(residual);
            jacobians.push(parts);
        }
        Ok(Linearization {
            residuals,
            jacobians,
            squared_norm,
        })
    }

    /// Jacobi scaling `1 / (1 + |column|)` per free variable.
    fn jacobi_scaling(&self, linearization: &Linearization) -> Vec<DVector<f64>> {
        let mut norms: Vec<DVector<f64>> = self.sizes.iter().map(|&n| DVector::zeros(n)).collect();
        for parts in &linearization.jacobians {
            for (i, jacobian) in parts {
                for (c, column) in jacobian.column_iter().enumerate() {
                    norms[*i][c] += column.norm_squared();
                }
            }
        }
        norms
            .into_iter()
            .map(|n| n.map(|v| 1.0 / (1.0 + v.sqrt())))
            .collect()
    }

    fn normal_equations(
        &self,
        linearization: &Linearization,
        scaling: &[DVector<f64>],
    ) -> NormalEquations {
        let nr = self.reduced_dim;
        let mut eq = NormalEquations {
            h_rr: DMatrix::zeros(nr, nr),
            g_r: DVector::zeros(nr),
            h_re: self.eliminated_sizes.iter().map(|&k| DMatrix::zeros(nr, k)).collect(),
            h_ee: self.eliminated_sizes.iter().map(|&k| DMatrix::zeros(k, k)).collect(),
            g_e: self.eliminated_sizes.iter().map(|&k| DVector::zeros(k)).collect(),
        };

        for (residual, parts) in linearization.residuals.iter().zip(&linearization.jacobians) {
            let scaled: Vec<(usize, DMatrix<f64>)> = parts
                .iter()
                .map(|(i, jacobian)| {
                    let mut js = jacobian.clone();
                    for (c, mut column) in js.column_iter_mut().enumerate() {
                        column *= scaling[*i][c];
                    }
                    (*i, js)
                })
                .collect();

            for (a, ja) in &scaled {
                let g = -ja.tr_mul(residual);
                match self.columns[*a] {
                    Column::Reduced(oa) => {
                        let mut rows = eq.g_r.rows_mut(oa, g.len());
                        rows += &g;
                    }
                    Column::Eliminated(ea) => eq.g_e[ea] += &g,
                    Column::Unused => {}
                }

                for (b, jb) in &scaled {
                    let product = ja.tr_mul(jb);
                    match (self.columns[*a], self.columns[*b]) {
                        (Column::Reduced(oa), Column::Reduced(ob)) => {
                            let mut view = eq.h_rr.view_mut((oa, ob), product.shape());
                            view += &product;
                        }
                        (Column::Reduced(oa), Column::Eliminated(eb)) => {
                            let mut view = eq.h_re[eb].view_mut((oa, 0), product.shape());
                            view += &product;
                        }
                        (Column::Eliminated(ea), Column::Eliminated(eb)) if ea == eb => {
                            eq.h_ee[ea] += &product;
                        }
                        _ => {}
                    }
                }
            }
        }
        eq
    }

    /// Solves the damped system for the scaled step, or `None` when a
    /// damped block is not positive definite.
    fn solve_step(
        &self,
        eq: &NormalEquations,
        u: f64,
        linear_solver: LinearSolver,
    ) -> Option<(DVector<f64>, Vec<DVector<f64>>)> {
        let mut schur = damp(&eq.h_rr, u);
        let mut rhs = eq.g_r.clone();
        let mut inverses = Vec::with_capacity(eq.h_ee.len());
        for ((h_ee, h_re), g_e) in eq.h_ee.iter().zip(&eq.h_re).zip(&eq.g_e) {
            let inverse = damp(h_ee, u).cholesky()?.inverse();
            let w = h_re * &inverse;
            schur -= &w * h_re.transpose();
            rhs -= &w * g_e;
            inverses.push(inverse);
        }

        let step_r = if self.reduced_dim == 0 {
            DVector::zeros(0)
        } else {
            match linear_solver {
                LinearSolver::Cholesky => schur.cholesky()?.solve(&rhs),
                LinearSolver::Qr => schur.qr().solve(&rhs)?,
            }
        };

        let step_e = inverses
            .iter()
            .zip(&eq.h_re)
            .zip(&eq.g_e)
            .map(|((inverse, h_re), g_e)| inverse * (g_e - h_re.tr_mul(&step_r)))
            .collect();
        Some((step_r, step_e))
    }

    /// Unscaled update per free block.
    fn update(
        &self,
        step_r: &DVector<f64>,
        step_e: &[DVector<f64>],
        scaling: &[DVector<f64>],
    ) -> Vec<DVector<f64>> {
        self.columns
            .iter()
            .zip(&self.sizes)
            .zip(scaling)
            .map(|((column, &n), scale)| match *column {
                Column::Reduced(o) => step_r.rows(o, n).component_mul(scale),
                Column::Eliminated(e) => step_e[e].component_mul(scale),
                Column::Unused => DVector::zeros(n),
            })
            .collect()
    }

    /// Decrease of the squared norm predicted by the linear model.
    fn predicted_decrease(&self, linearization: &Linearization, dx: &[DVector<f64>]) -> f64 {
        linearization
            .residuals
            .iter()
            .zip(&linearization.jacobians)
            .map(|(residual, parts)| {
                let mut linear = residual.clone();
                for (i, jacobian) in parts {
                    linear += jacobian * &dx[*i];
                }
                residual.norm_squared() - linear.norm_squared()
            })
            .sum()
    }

    /// Minimizes from `values`, calling `on_iteration` with the current values
    /// after every iteration. Returns the final values and the number of
    /// iterations run.
    pub(super) fn minimize<F>(
        &self,
        mut values: Vec<DVector<f64>>,
        options: &SolverOptions,
        mut on_iteration: F,
    ) -> Result<(Vec<DVector<f64>>, usize), OptimizationError>
    where
        F: FnMut(&[DVector<f64>]),
    {
        let mut u = 1.0 / INITIAL_TRUST_REGION_RADIUS;
        let mut jacobi: Option<Vec<DVector<f64>>> = None;
        let mut iterations = 0;

        while iterations < options.max_iterations {
            iterations += 1;
            let linearization = self.linearize(&values)?;
            let current = linearization.squared_norm;
            let scaling = jacobi.get_or_insert_with(|| self.jacobi_scaling(&linearization));
            let eq = self.normal_equations(&linearization, scaling);

            let mut accepted = None;
            if let Some((step_r, step_e)) = self.solve_step(&eq, u, options.linear_solver) {
                let dx = self.update(&step_r, &step_e, scaling);
                let candidate: Vec<DVector<f64>> =
                    values.iter().zip(&dx).map(|(v, d)| v + d).collect();
                let candidate_norm = self.squared_norm(&candidate);
                let rho = (current - candidate_norm) / self.predicted_decrease(&linearization, &dx);
                trace!("iteration {iterations}: rho {rho:.3e}, damping {u:.3e}");
                if candidate_norm.is_finite() && rho > 0.0 {
                    accepted = Some((candidate, candidate_norm, rho));
                }
            }

            let Some((candidate, candidate_norm, rho)) = accepted else {
                u *= 2.0;
                on_iteration(&values);
                if u > MAX_DAMPING {
                    debug!("Damping exceeded {MAX_DAMPING:e}, stopping");
                    break;
                }
                continue;
            };

            values = candidate;
            let t = 2.0 * rho - 1.0;
            u *= (1.0_f64 / 3.0).max(1.0 - t * t * t);
            on_iteration(&values);
            debug!("iteration {iterations}: squared norm {current:.6e} -> {candidate_norm:.6e}");

            let decrease = (current - candidate_norm).abs();
            if candidate_norm < options.min_error
                || decrease < options.min_abs_decrease
                || decrease / current < options.min_rel_decrease
            {
                break;
            }
        }
        Ok((values, iterations))
    }
}
