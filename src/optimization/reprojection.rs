//! Reprojection residual for `tiny_solver`.
//!
//! One residual compares the projection of a terrain point through a camera
//! with the observed sensor coordinate. Either of the two parameter blocks
//! (camera pose, terrain point) may be held constant, in which case its value
//! is baked into the factor and the solver only sees the free block.

use nalgebra::{DVector, RealField};
use tiny_solver::factors::Factor;

use crate::camera::{project_point, InternalCalibration};
use crate::geometry::SensorCoordinate;

/// Residual of dimension 2: `project(internal, pose, point) - observed`.
#[derive(Debug, Clone)]
pub struct ReprojectionFactor {
    internal: InternalCalibration,
    observed: SensorCoordinate,
    fixed_pose: Option<Vec<f64>>,
    fixed_point: Option<Vec<f64>>,
}

impl ReprojectionFactor {
    pub const RESIDUAL_DIM: usize = 2;

    /// Both the pose and the point are free parameter blocks, passed to the
    /// residual in that order.
    pub fn new(internal: InternalCalibration, observed: SensorCoordinate) -> Self {
        ReprojectionFactor {
            internal,
            observed,
            fixed_pose: None,
            fixed_point: None,
        }
    }

    pub fn with_fixed_pose(mut self, pose: &[f64]) -> Self {
        self.fixed_pose = Some(pose.to_vec());
        self
    }

    pub fn with_fixed_point(mut self, point: &[f64]) -> Self {
        self.fixed_point = Some(point.to_vec());
        self
    }

    /// Number of parameter blocks the solver must supply.
    pub fn num_free_blocks(&self) -> usize {
        usize::from(self.fixed_pose.is_none()) + usize::from(self.fixed_point.is_none())
    }

    pub fn observed(&self) -> &SensorCoordinate {
        &self.observed
    }
}

fn constant<T: RealField>(values: &[f64]) -> Vec<T> {
    values.iter().map(|&v| nalgebra::convert(v)).collect()
}

impl<T: RealField> Factor<T> for ReprojectionFactor {
    fn residual_func(&self, params: &[DVector<T>]) -> DVector<T> {
        let mut free = params.iter();
        let pose: Vec<T> = match &self.fixed_pose {
            Some(pose) => constant(pose),
            None => free.next().map(|p| p.as_slice().to_vec()).unwrap_or_default(),
        };
        let point: Vec<T> = match &self.fixed_point {
            Some(point) => constant(point),
            None => free.next().map(|p| p.as_slice().to_vec()).unwrap_or_default(),
        };
        if pose.len() != 6 || !(2..=3).contains(&point.len()) {
            let nan: T = nalgebra::convert(f64::NAN);
            return DVector::from_element(Self::RESIDUAL_DIM, nan);
        }

        let projected = project_point(&self.internal, &pose, &point);
        let observed_x: T = nalgebra::convert(self.observed.x);
        let observed_y: T = nalgebra::convert(self.observed.y);
        DVector::from_vec(vec![
            projected[0].clone() - observed_x,
            projected[1].clone() - observed_y,
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{project, CameraPose};
    use approx::assert_relative_eq;
    use nalgebra::Point3;

    #[test]
    fn test_residual_is_zero_at_true_point() {
        let internal = InternalCalibration::new(0.05, 1e-5, -2e-5);
        let pose = CameraPose::new(3.0, -1.0, 200.0, 0.01, -0.02, 0.5);
        let point = Point3::new(12.0, 7.0, 0.0);
        let observed = project(&internal, &pose, &point).unwrap();

        let factor = ReprojectionFactor::new(internal, observed);
        let params = vec![
            DVector::from_row_slice(&pose.to_array()),
            DVector::from_vec(vec![12.0, 7.0]),
        ];
        let r: DVector<f64> = factor.residual_func(&params);
        assert_eq!(r.len(), 2);
        assert_relative_eq!(r.norm(), 0.0, epsilon = 1e-15);
    }

    #[test]
    fn test_fixed_pose_matches_free_pose() {
        let internal = InternalCalibration::new(0.05, 0.0, 0.0);
        let pose = CameraPose::new(0.0, 0.0, 150.0, 0.0, 0.1, 0.0);
        let observed = SensorCoordinate::new(0.001, -0.002);
        let point = vec![4.0, 5.0, 1.5];

        let free = ReprojectionFactor::new(internal, observed);
        let fixed = ReprojectionFactor::new(internal, observed).with_fixed_pose(&pose.to_array());
        assert_eq!(free.num_free_blocks(), 2);
        assert_eq!(fixed.num_free_blocks(), 1);

        let r_free: DVector<f64> = free.residual_func(&[
            DVector::from_row_slice(&pose.to_array()),
            DVector::from_vec(point.clone()),
        ]);
        let r_fixed: DVector<f64> = fixed.residual_func(&[DVector::from_vec(point)]);
        assert_relative_eq!(r_free, r_fixed, epsilon = 1e-15);
    }

    #[test]
    fn test_missing_or_short_block_gives_nan_residual() {
        let internal = InternalCalibration::new(0.05, 0.0, 0.0);
        let pose = CameraPose::nadir(150.0);
        let factor = ReprojectionFactor::new(internal, SensorCoordinate::default());

        let missing: DVector<f64> =
            factor.residual_func(&[DVector::from_row_slice(&pose.to_array())]);
        assert_eq!(missing.len(), 2);
        assert!(missing.iter().all(|v| v.is_nan()));

        let short: DVector<f64> = factor.residual_func(&[
            DVector::from_row_slice(&pose.to_array()[..5]),
            DVector::from_vec(vec![1.0, 2.0]),
        ]);
        assert!(short.iter().all(|v| v.is_nan()));
    }
}
