//! Camera parameter types shared by every model.
//!
//! A camera is described by its external parameters ([`CameraPose`], 6 dof)
//! and its internal parameters ([`InternalCalibration`]: focal length and
//! principal point offsets, all in metres on the sensor plane). The
//! projection math itself lives in [`projection`].

use serde::{Deserialize, Serialize};

pub mod projection;

pub use projection::{project, project_point, rotation_matrix, unproject_to_plane};

/// External (extrinsic) camera parameters.
///
/// The pose is stored and serialized as a fixed-size array in the order
/// `[x, y, z, roll, pitch, yaw]`. `x, y, z` is the camera centre in world
/// coordinates; the three angles are in radians and are composed by
/// [`rotation_matrix`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f64; 6]", into = "[f64; 6]")]
pub struct CameraPose {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub roll: f64,
    pub pitch: f64,
    pub yaw: f64,
}

impl CameraPose {
    /// Number of scalar parameters in a pose block.
    pub const DOF: usize = 6;

    pub fn new(x: f64, y: f64, z: f64, roll: f64, pitch: f64, yaw: f64) -> Self {
        CameraPose {
            x,
            y,
            z,
            roll,
            pitch,
            yaw,
        }
    }

    /// A nadir-looking camera at height `z` above the origin.
    pub fn nadir(z: f64) -> Self {
        CameraPose::new(0.0, 0.0, z, 0.0, 0.0, 0.0)
    }

    pub fn to_array(&self) -> [f64; 6] {
        [self.x, self.y, self.z, self.roll, self.pitch, self.yaw]
    }

    pub fn from_slice(values: &[f64]) -> Result<Self, CameraError> {
        if values.len() != Self::DOF {
            return Err(CameraError::InvalidParams(format!(
                "camera pose requires {} values, got {}",
                Self::DOF,
                values.len()
            )));
        }
        Ok(CameraPose::new(
            values[0], values[1], values[2], values[3], values[4], values[5],
        ))
    }

    pub fn is_finite(&self) -> bool {
        self.to_array().iter().all(|v| v.is_finite())
    }
}

impl From<[f64; 6]> for CameraPose {
    fn from(values: [f64; 6]) -> Self {
        CameraPose::new(
            values[0], values[1], values[2], values[3], values[4], values[5],
        )
    }
}

impl From<CameraPose> for [f64; 6] {
    fn from(pose: CameraPose) -> Self {
        pose.to_array()
    }
}

/// Internal (intrinsic) camera parameters: `{f, ppx, ppy}`.
///
/// Serialized as a `[f, ppx, ppy]` array. Owned by a model and shared
/// read-only by all of its residuals.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f64; 3]", into = "[f64; 3]")]
pub struct InternalCalibration {
    /// Focal length in metres.
    pub focal_length: f64,
    /// Principal point offset along the sensor x axis, in metres.
    pub ppx: f64,
    /// Principal point offset along the sensor y axis, in metres.
    pub ppy: f64,
}

impl InternalCalibration {
    pub fn new(focal_length: f64, ppx: f64, ppy: f64) -> Self {
        InternalCalibration {
            focal_length,
            ppx,
            ppy,
        }
    }

    pub fn to_array(&self) -> [f64; 3] {
        [self.focal_length, self.ppx, self.ppy]
    }

    /// The internal vector extended with the sensor pixel pitch,
    /// `[f, ppx, ppy, pixel_pitch]`.
    pub fn with_pixel_pitch(&self, pixel_pitch: f64) -> [f64; 4] {
        [self.focal_length, self.ppx, self.ppy, pixel_pitch]
    }
}

impl From<[f64; 3]> for InternalCalibration {
    fn from(values: [f64; 3]) -> Self {
        InternalCalibration::new(values[0], values[1], values[2])
    }
}

impl From<InternalCalibration> for [f64; 3] {
    fn from(internal: InternalCalibration) -> Self {
        internal.to_array()
    }
}

/// Image extent in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageExtent {
    pub rows: u32,
    pub cols: u32,
}

impl ImageExtent {
    pub fn new(rows: u32, cols: u32) -> Self {
        ImageExtent { rows, cols }
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0 || self.cols == 0
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum CameraError {
    #[error("Singular back-projection system, camera may be parallel to the elevation plane")]
    SingularSystem,
    #[error("Camera-frame depth is zero, point lies in the camera's principal plane")]
    ZeroDepth,
    #[error("Back-projected point is at infinity")]
    PointAtInfinity,
    #[error("Focal length must be positive")]
    FocalLengthMustBePositive,
    #[error("Pixel pitch must be positive and finite")]
    PixelPitchMustBePositive,
    #[error("Principal point must be finite")]
    PrincipalPointMustBeFinite,
    #[error("Invalid camera parameters: {0}")]
    InvalidParams(String),
}

impl CameraError {
    /// Whether the error is a numerical-instability condition that a caller
    /// may retry with a different initial guess or elevation.
    pub fn is_numerical_instability(&self) -> bool {
        matches!(
            self,
            CameraError::SingularSystem | CameraError::ZeroDepth | CameraError::PointAtInfinity
        )
    }
}

/// Common validation functions for camera parameters
pub mod validation {
    use super::*;

    pub fn validate_internal(internal: &InternalCalibration) -> Result<(), CameraError> {
        if !(internal.focal_length > 0.0) || !internal.focal_length.is_finite() {
            return Err(CameraError::FocalLengthMustBePositive);
        }
        if !internal.ppx.is_finite() || !internal.ppy.is_finite() {
            return Err(CameraError::PrincipalPointMustBeFinite);
        }
        Ok(())
    }

    pub fn validate_pixel_pitch(pixel_pitch: f64) -> Result<(), CameraError> {
        if !(pixel_pitch > 0.0) || !pixel_pitch.is_finite() {
            return Err(CameraError::PixelPitchMustBePositive);
        }
        Ok(())
    }

    pub fn validate_pose(pose: &CameraPose) -> Result<(), CameraError> {
        if !pose.is_finite() {
            return Err(CameraError::InvalidParams(format!(
                "camera pose has non-finite values: {:?}",
                pose.to_array()
            )));
        }
        Ok(())
    }
}
