//! Frame camera projection and back-projection.
//!
//! The rotation convention is load-bearing: the roll matrix carries negated
//! cosine/sine terms and the composition order is `Pitch * Roll * Yaw`.
//! Forward projection and back-projection to a constant-elevation plane
//! both go through [`rotation_matrix`] so that they remain exact inverses.
//!
//! [`project_point`] is generic over [`RealField`] so the same code runs on
//! `f64` and on the dual numbers used by the optimizer for automatic
//! differentiation. It performs no depth check; [`project`] is the checked
//! `f64` entry point.

use nalgebra::{Matrix3, Point2, Point3, RealField, Vector2, Vector3};

use crate::camera::{CameraError, CameraPose, InternalCalibration};
use crate::geometry::SensorCoordinate;

/// Relative conditioning threshold below which the back-projection system is
/// treated as singular (|det| compared to the Hadamard bound of the matrix).
const SINGULARITY_THRESHOLD: f64 = 1e-12;

/// Builds the camera rotation matrix from the three pose angles.
///
/// ```text
/// Yaw   = [ cos(yaw)  -sin(yaw)  0 ]     Pitch = [ 1  0           0          ]
///         [ sin(yaw)   cos(yaw)  0 ]             [ 0  cos(pitch)  sin(pitch) ]
///         [ 0          0         1 ]             [ 0  -sin(pitch) cos(pitch) ]
///
/// Roll  = [ -cos(roll)  0  -sin(roll) ]
///         [  0          1   0         ]
///         [  sin(roll)  0  -cos(roll) ]
///
/// R = Pitch * Roll * Yaw
/// ```
pub fn rotation_matrix<T: RealField>(roll: T, pitch: T, yaw: T) -> Matrix3<T> {
    let zero = T::zero();
    let one = T::one();
    let (sin_y, cos_y) = (yaw.clone().sin(), yaw.cos());
    let (sin_p, cos_p) = (pitch.clone().sin(), pitch.cos());
    let (sin_r, cos_r) = (roll.clone().sin(), roll.cos());

    #[rustfmt::skip]
    let yaw_m = Matrix3::new(
        cos_y.clone(), -sin_y.clone(), zero.clone(),
        sin_y,         cos_y,          zero.clone(),
        zero.clone(),  zero.clone(),   one.clone(),
    );
    #[rustfmt::skip]
    let pitch_m = Matrix3::new(
        one.clone(),  zero.clone(),   zero.clone(),
        zero.clone(), cos_p.clone(),  sin_p.clone(),
        zero.clone(), -sin_p,         cos_p,
    );
    #[rustfmt::skip]
    let roll_m = Matrix3::new(
        -cos_r.clone(), zero.clone(), -sin_r.clone(),
        zero.clone(),   one,          zero.clone(),
        sin_r,          zero,         -cos_r,
    );

    pitch_m * roll_m * yaw_m
}

/// Translates and rotates a world point into the camera frame.
///
/// `pose` is `[x, y, z, roll, pitch, yaw]` and `point` is either `[x, y]`
/// (flat terrain at elevation 0) or `[x, y, z]`.
fn to_camera_frame<T: RealField>(pose: &[T], point: &[T]) -> Vector3<T> {
    let elevation = if point.len() > 2 {
        point[2].clone()
    } else {
        T::zero()
    };
    let r = rotation_matrix(pose[3].clone(), pose[4].clone(), pose[5].clone());
    let q = Vector3::new(
        point[0].clone() - pose[0].clone(),
        point[1].clone() - pose[1].clone(),
        pose[2].clone() - elevation,
    );
    r * q
}

/// Projects a world point to sensor coordinates (metres, origin at the
/// image centre).
///
/// No depth check is performed: a point with zero camera-frame depth yields
/// non-finite coordinates.
pub fn project_point<T: RealField>(
    internal: &InternalCalibration,
    pose: &[T],
    point: &[T],
) -> Vector2<T> {
    let q = to_camera_frame(pose, point);
    let x = q[0].clone() / q[2].clone();
    let y = q[1].clone() / q[2].clone();

    let f: T = nalgebra::convert(internal.focal_length);
    let ppx: T = nalgebra::convert(internal.ppx);
    let ppy: T = nalgebra::convert(internal.ppy);
    Vector2::new(f.clone() * x + ppx, f * y + ppy)
}

/// Checked forward projection of a world point.
///
/// # Errors
///
/// * [`CameraError::ZeroDepth`] if the camera-frame depth of the point is zero.
pub fn project(
    internal: &InternalCalibration,
    pose: &CameraPose,
    point: &Point3<f64>,
) -> Result<SensorCoordinate, CameraError> {
    let pose = pose.to_array();
    let point = [point.x, point.y, point.z];
    let q = to_camera_frame(&pose, &point);
    if q.z.abs() <= f64::EPSILON * q.norm() {
        return Err(CameraError::ZeroDepth);
    }
    let projected = project_point(internal, &pose, &point);
    if !projected.x.is_finite() || !projected.y.is_finite() {
        return Err(CameraError::ZeroDepth);
    }
    Ok(SensorCoordinate::new(projected.x, projected.y))
}

/// Back-projects a sensor coordinate onto the horizontal plane `z = elevation`.
///
/// The pinhole system `K * R * M` (calibration, rotation, plane-to-camera
/// translation) is solved against the homogeneous sensor coordinate with a
/// full-pivoting LU decomposition.
///
/// # Errors
///
/// * [`CameraError::SingularSystem`] if the system is singular, e.g. the
///   camera centre lies on the elevation plane or the viewing ray is parallel
///   to it.
/// * [`CameraError::PointAtInfinity`] if the solution has a vanishing
///   homogeneous coordinate.
pub fn unproject_to_plane(
    internal: &InternalCalibration,
    pose: &CameraPose,
    sensor: &SensorCoordinate,
    elevation: f64,
) -> Result<Point2<f64>, CameraError> {
    let f = internal.focal_length;
    #[rustfmt::skip]
    let k = Matrix3::new(
        f,   0.0, internal.ppx,
        0.0, f,   internal.ppy,
        0.0, 0.0, 1.0,
    );
    let r = rotation_matrix(pose.roll, pose.pitch, pose.yaw);
    // Plane point (X, Y, 1) to camera-centred coordinates.
    #[rustfmt::skip]
    let plane = Matrix3::new(
        1.0, 0.0, -pose.x,
        0.0, 1.0, -pose.y,
        0.0, 0.0, pose.z - elevation,
    );

    let a = k * r * plane;
    let bound: f64 = a.column_iter().map(|c| c.norm()).product();
    let det = a.determinant();
    if !det.is_finite() || !(bound > 0.0) || det.abs() <= SINGULARITY_THRESHOLD * bound {
        return Err(CameraError::SingularSystem);
    }

    let b = Vector3::new(sensor.x, sensor.y, 1.0);
    let sol = a.full_piv_lu().solve(&b).ok_or(CameraError::SingularSystem)?;

    if !(sol.z.abs() > f64::EPSILON * sol.norm()) {
        return Err(CameraError::PointAtInfinity);
    }
    let world = Point2::new(sol.x / sol.z, sol.y / sol.z);
    if !world.x.is_finite() || !world.y.is_finite() {
        return Err(CameraError::PointAtInfinity);
    }
    Ok(world)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sample_internal() -> InternalCalibration {
        InternalCalibration::new(48.3355e-3, 0.0093e-3, -0.0276e-3)
    }

    #[test]
    fn test_rotation_matrix_at_zero_angles() {
        let r = rotation_matrix(0.0, 0.0, 0.0);
        let expected = Matrix3::new(-1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, -1.0);
        assert_relative_eq!(r, expected, epsilon = 1e-15);
    }

    #[test]
    fn test_rotation_matrix_is_proper_rotation() {
        let r = rotation_matrix(0.3, -0.7, 1.9);
        assert_relative_eq!(r * r.transpose(), Matrix3::identity(), epsilon = 1e-12);
        assert_relative_eq!(r.determinant(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_rotation_matrix_composition_order() {
        let (roll, pitch, yaw) = (0.2_f64, 0.4_f64, -0.6_f64);
        let yaw_m = Matrix3::new(
            yaw.cos(),
            -yaw.sin(),
            0.0,
            yaw.sin(),
            yaw.cos(),
            0.0,
            0.0,
            0.0,
            1.0,
        );
        let pitch_m = Matrix3::new(
            1.0,
            0.0,
            0.0,
            0.0,
            pitch.cos(),
            pitch.sin(),
            0.0,
            -pitch.sin(),
            pitch.cos(),
        );
        let roll_m = Matrix3::new(
            -roll.cos(),
            0.0,
            -roll.sin(),
            0.0,
            1.0,
            0.0,
            roll.sin(),
            0.0,
            -roll.cos(),
        );
        let expected = pitch_m * roll_m * yaw_m;
        assert_relative_eq!(rotation_matrix(roll, pitch, yaw), expected, epsilon = 1e-15);
    }

    #[test]
    fn test_project_nadir_camera() {
        let internal = sample_internal();
        let pose = CameraPose::nadir(269.0);
        let point = Point3::new(10.0, 5.0, 0.0);
        let s = project(&internal, &pose, &point).unwrap();

        // Camera frame: (-10, 5, -269)
        assert_relative_eq!(
            s.x,
            internal.focal_length * (10.0 / 269.0) + internal.ppx,
            epsilon = 1e-15
        );
        assert_relative_eq!(
            s.y,
            internal.focal_length * (-5.0 / 269.0) + internal.ppy,
            epsilon = 1e-15
        );
    }

    #[test]
    fn test_project_zero_depth_is_rejected() {
        let internal = sample_internal();
        let pose = CameraPose::nadir(10.0);
        let point = Point3::new(3.0, 4.0, 10.0);
        assert_eq!(
            project(&internal, &pose, &point),
            Err(CameraError::ZeroDepth)
        );
    }

    #[test]
    fn test_unproject_then_project_round_trip() {
        let internal = sample_internal();
        let poses = [
            CameraPose::nadir(269.0),
            CameraPose::new(12.0, -7.0, 250.0, 0.05, -0.03, 0.4),
            CameraPose::new(-3.0, 40.0, 300.0, -0.1, 0.08, -2.2),
        ];
        let sensors = [
            SensorCoordinate::new(0.0, 0.0),
            SensorCoordinate::new(0.012, -0.008),
            SensorCoordinate::new(-0.017, 0.011),
        ];

        for pose in &poses {
            for elevation in [0.0, 12.5] {
                for s in &sensors {
                    let world = unproject_to_plane(&internal, pose, s, elevation).unwrap();
                    let back =
                        project(&internal, pose, &Point3::new(world.x, world.y, elevation))
                            .unwrap();
                    assert_relative_eq!(back.x, s.x, epsilon = 1e-12);
                    assert_relative_eq!(back.y, s.y, epsilon = 1e-12);
                }
            }
        }
    }

    #[test]
    fn test_unproject_principal_point_hits_nadir() {
        let internal = sample_internal();
        let pose = CameraPose::new(5.0, -2.0, 100.0, 0.0, 0.0, 0.0);
        let s = SensorCoordinate::new(internal.ppx, internal.ppy);
        let world = unproject_to_plane(&internal, &pose, &s, 0.0).unwrap();
        assert_relative_eq!(world.x, 5.0, epsilon = 1e-9);
        assert_relative_eq!(world.y, -2.0, epsilon = 1e-9);
    }

    #[test]
    fn test_unproject_camera_on_plane_is_singular() {
        let internal = sample_internal();
        let pose = CameraPose::nadir(20.0);
        let s = SensorCoordinate::new(0.001, 0.002);
        let err = unproject_to_plane(&internal, &pose, &s, 20.0).unwrap_err();
        assert_eq!(err, CameraError::SingularSystem);
        assert!(err.is_numerical_instability());
    }

    #[test]
    fn test_generic_projection_matches_checked() {
        let internal = sample_internal();
        let pose = CameraPose::new(1.0, 2.0, 150.0, 0.02, 0.01, 0.3);
        let point = [4.0, -6.0];
        let generic = project_point(&internal, &pose.to_array(), &point);
        let checked = project(&internal, &pose, &Point3::new(4.0, -6.0, 0.0)).unwrap();
        assert_relative_eq!(generic.x, checked.x, epsilon = 1e-15);
        assert_relative_eq!(generic.y, checked.y, epsilon = 1e-15);
    }
}
