use crate::camera::{project, CameraError, CameraPose, ImageExtent, InternalCalibration};
use crate::features::Edge;
use nalgebra::Point3;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;

/// Ensure the parent directory of `path` exists
pub fn ensure_parent_dir(path: &Path) -> Result<(), UtilError> {
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() && !dir.exists() {
            fs::create_dir_all(dir).map_err(|e| {
                UtilError::InvalidParams(format!(
                    "Failed to create output directory {}: {e}",
                    dir.display()
                ))
            })?;
        }
    }
    Ok(())
}

#[derive(thiserror::Error, Debug)]
pub enum UtilError {
    #[error("Zero projection points")]
    ZeroProjectionPoints,
    #[error("Terrain has {terrain} points but the edge has {observations} observations")]
    MismatchedTerrain {
        terrain: usize,
        observations: usize,
    },
    #[error("Invalid parameters: {0}")]
    InvalidParams(String),
    #[error(transparent)]
    Camera(#[from] CameraError),
}

#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectionError {
    pub rmse: f64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub stddev: f64,
    pub median: f64,
}

impl fmt::Debug for ProjectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Projection Error [ rmse: {}, min: {}, max: {}, mean: {}, stddev: {}, median: {} ]",
            self.rmse, self.min, self.max, self.mean, self.stddev, self.median
        )
    }
}

impl ProjectionError {
    /// Summary statistics of a list of non-negative errors.
    pub fn from_errors(errors: &[f64]) -> Result<Self, UtilError> {
        if errors.is_empty() {
            return Err(UtilError::ZeroProjectionPoints);
        }

        let n = errors.len() as f64;
        let mean = errors.iter().sum::<f64>() / n;

        let variance: f64 = errors.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
        let stddev = variance.sqrt();

        let sum_squared: f64 = errors.iter().map(|x| x.powi(2)).sum::<f64>();
        let rmse = (sum_squared / n).sqrt();

        let min = errors.iter().fold(f64::INFINITY, |a, &b| a.min(b));
        let max = errors.iter().fold(f64::NEG_INFINITY, |a, &b| a.max(b));

        let mut sorted_errors = errors.to_vec();
        sorted_errors.sort_by(f64::total_cmp);
        let median = if sorted_errors.len() % 2 == 0 {
            let mid = sorted_errors.len() / 2;
            (sorted_errors[mid - 1] + sorted_errors[mid]) / 2.0
        } else {
            sorted_errors[sorted_errors.len() / 2]
        };

        Ok(ProjectionError {
            rmse,
            min,
            max,
            mean,
            stddev,
            median,
        })
    }
}

/// Reprojection error, in pixels, of `terrain` against the observations of
/// `edge`.
///
/// Every terrain point is projected through both cameras of the edge and
/// compared with the matching observation; each correspondence contributes
/// two errors. A point that can't be projected through either camera fails
/// the whole evaluation.
pub fn compute_reprojection_error(
    internal: &InternalCalibration,
    pixel_pitch: f64,
    extent: &ImageExtent,
    edge: &Edge,
    cameras: &[CameraPose],
    terrain: &[Point3<f64>],
) -> Result<ProjectionError, UtilError> {
    if terrain.len() != edge.len() {
        return Err(UtilError::MismatchedTerrain {
            terrain: terrain.len(),
            observations: edge.len(),
        });
    }
    let pose_a = cameras.get(edge.cam_a()).ok_or_else(|| {
        UtilError::InvalidParams(format!("Missing pose for camera {}", edge.cam_a()))
    })?;
    let pose_b = cameras.get(edge.cam_b()).ok_or_else(|| {
        UtilError::InvalidParams(format!("Missing pose for camera {}", edge.cam_b()))
    })?;

    let mut errors = vec![];
    for ((obs_a, obs_b), point) in edge.pairs().zip(terrain) {
        for (pose, observed) in [(pose_a, obs_a), (pose_b, obs_b)] {
            let predicted = project(internal, pose, point)?.to_pixel(pixel_pitch, extent);
            errors.push((predicted.i - observed.i).hypot(predicted.j - observed.j));
        }
    }

    ProjectionError::from_errors(&errors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::PixelCoordinate;
    use approx::assert_relative_eq;

    #[test]
    fn test_statistics() {
        let stats = ProjectionError::from_errors(&[1.0, 2.0, 3.0, 4.0]).unwrap();
        assert_relative_eq!(stats.mean, 2.5);
        assert_relative_eq!(stats.median, 2.5);
        assert_relative_eq!(stats.min, 1.0);
        assert_relative_eq!(stats.max, 4.0);
        assert_relative_eq!(stats.rmse, 7.5_f64.sqrt());
        assert_relative_eq!(stats.stddev, 1.25_f64.sqrt());

        let odd = ProjectionError::from_errors(&[5.0, 1.0, 3.0]).unwrap();
        assert_relative_eq!(odd.median, 3.0);
    }

    #[test]
    fn test_empty_errors() {
        assert!(matches!(
            ProjectionError::from_errors(&[]),
            Err(UtilError::ZeroProjectionPoints)
        ));
    }

    #[test]
    fn test_reprojection_error_of_exact_terrain_is_zero() {
        let internal = InternalCalibration::new(48.3355e-3, 0.0, 0.0);
        let pitch = 0.0085e-3;
        let extent = ImageExtent::new(2832, 4256);
        let cameras = vec![
            CameraPose::nadir(269.0),
            CameraPose::new(10.0, 0.0, 269.0, 0.0, 0.0, 0.0),
        ];
        let terrain = vec![Point3::new(1.0, 2.0, 0.0), Point3::new(-5.0, 4.0, 0.0)];

        let mut edge = Edge::new(0, 1).unwrap();
        for p in &terrain {
            let a = project(&internal, &cameras[0], p).unwrap().to_pixel(pitch, &extent);
            let b = project(&internal, &cameras[1], p).unwrap().to_pixel(pitch, &extent);
            edge.push(a, b);
        }
        let stats = compute_reprojection_error(&internal, pitch, &extent, &edge, &cameras, &terrain)
            .unwrap();
        assert!(stats.max < 1e-6);

        // Shift one observation by 3 pixels along the row.
        let (a, b) = (edge.obs_a()[0], edge.obs_b()[0]);
        let mut shifted = Edge::new(0, 1).unwrap();
        shifted.push(PixelCoordinate::new(a.i + 3.0, a.j), b);
        shifted.push(edge.obs_a()[1], edge.obs_b()[1]);
        let stats =
            compute_reprojection_error(&internal, pitch, &extent, &shifted, &cameras, &terrain)
                .unwrap();
        assert_relative_eq!(stats.max, 3.0, epsilon = 1e-6);

        assert!(matches!(
            compute_reprojection_error(&internal, pitch, &extent, &edge, &cameras, &terrain[..1]),
            Err(UtilError::MismatchedTerrain { .. })
        ));
    }

    #[test]
    fn test_unprojectable_point_fails_the_evaluation() {
        let internal = InternalCalibration::new(48.3355e-3, 0.0, 0.0);
        let pitch = 0.0085e-3;
        let extent = ImageExtent::new(2832, 4256);
        let cameras = vec![
            CameraPose::nadir(269.0),
            CameraPose::new(10.0, 0.0, 269.0, 0.0, 0.0, 0.0),
        ];
        let valid = Point3::new(1.0, 2.0, 0.0);
        let mut edge = Edge::new(0, 1).unwrap();
        edge.push(
            project(&internal, &cameras[0], &valid).unwrap().to_pixel(pitch, &extent),
            project(&internal, &cameras[1], &valid).unwrap().to_pixel(pitch, &extent),
        );
        edge.push(PixelCoordinate::new(0.0, 0.0), PixelCoordinate::new(0.0, 0.0));

        // Second point sits at camera altitude.
        let terrain = vec![valid, Point3::new(5.0, 5.0, 269.0)];
        let result =
            compute_reprojection_error(&internal, pitch, &extent, &edge, &cameras, &terrain);
        assert!(matches!(
            result,
            Err(UtilError::Camera(CameraError::ZeroDepth))
        ));
    }
}
