//! Pixel and sensor-plane coordinates.
//!
//! Pixel coordinates are `(i, j)` (row, column) with the origin at the top
//! left corner of the image. Sensor coordinates are `(x, y)` in metres with
//! the origin at the image centre, `x` to the right and `y` up. The two are
//! related by an affine transform parameterized by the pixel pitch and the
//! image extent. The centre is taken at the integer half extent, so an odd
//! dimension puts it on the pixel before the exact middle. No clamping to the
//! image bounds is performed.

use serde::{Deserialize, Serialize};

use crate::camera::ImageExtent;

/// A pixel coordinate `(i, j)`, serialized as `[i, j]`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(from = "[f64; 2]", into = "[f64; 2]")]
pub struct PixelCoordinate {
    /// Row
    pub i: f64,
    /// Column
    pub j: f64,
}

/// A metric sensor-plane coordinate `(x, y)`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(from = "[f64; 2]", into = "[f64; 2]")]
pub struct SensorCoordinate {
    pub x: f64,
    pub y: f64,
}

impl PixelCoordinate {
    pub fn new(i: f64, j: f64) -> Self {
        PixelCoordinate { i, j }
    }

    pub fn to_sensor(&self, pixel_pitch: f64, extent: &ImageExtent) -> SensorCoordinate {
        let (centre_i, centre_j) = centre(extent);
        SensorCoordinate::new(
            (self.j - centre_j) * pixel_pitch,
            (centre_i - self.i) * pixel_pitch,
        )
    }

    /// Scales both components, used to map coordinates found on a
    /// downscaled image back to full resolution.
    pub fn scaled(&self, factor: f64) -> Self {
        PixelCoordinate::new(self.i * factor, self.j * factor)
    }
}

impl SensorCoordinate {
    pub fn new(x: f64, y: f64) -> Self {
        SensorCoordinate { x, y }
    }

    pub fn to_pixel(&self, pixel_pitch: f64, extent: &ImageExtent) -> PixelCoordinate {
        let (centre_i, centre_j) = centre(extent);
        PixelCoordinate::new(
            centre_i - self.y / pixel_pitch,
            self.x / pixel_pitch + centre_j,
        )
    }
}

/// Pixel coordinate of the sensor origin.
fn centre(extent: &ImageExtent) -> (f64, f64) {
    ((extent.rows / 2) as f64, (extent.cols / 2) as f64)
}

impl From<[f64; 2]> for PixelCoordinate {
    fn from(v: [f64; 2]) -> Self {
        PixelCoordinate::new(v[0], v[1])
    }
}

impl From<PixelCoordinate> for [f64; 2] {
    fn from(p: PixelCoordinate) -> Self {
        [p.i, p.j]
    }
}

impl From<[f64; 2]> for SensorCoordinate {
    fn from(v: [f64; 2]) -> Self {
        SensorCoordinate::new(v[0], v[1])
    }
}

impl From<SensorCoordinate> for [f64; 2] {
    fn from(s: SensorCoordinate) -> Self {
        [s.x, s.y]
    }
}

/// Generate a grid of pixel coordinates evenly distributed across the image.
///
/// # Arguments
///
/// * `extent` - The image extent in pixels
/// * `n` - The approximate number of points to generate
/// * `margin` - Fraction of the image size left empty on every border
///
/// # Returns
///
/// Pixel coordinates at the centre of each grid cell, row by row.
pub fn sample_pixels(extent: &ImageExtent, n: usize, margin: f64) -> Vec<PixelCoordinate> {
    let mut pixels = Vec::new();
    if n == 0 || extent.is_empty() {
        return pixels;
    }

    let height = extent.rows as f64 * (1.0 - 2.0 * margin);
    let width = extent.cols as f64 * (1.0 - 2.0 * margin);
    let offset_i = extent.rows as f64 * margin;
    let offset_j = extent.cols as f64 * margin;

    // Calculate the number of cells in each dimension
    let num_cells_j = ((n as f64 * (width / height)).sqrt().round() as usize).max(1);
    let num_cells_i = ((n as f64 * (height / width)).sqrt().round() as usize).max(1);

    let cell_width = width / num_cells_j as f64;
    let cell_height = height / num_cells_i as f64;

    for a in 0..num_cells_i {
        for b in 0..num_cells_j {
            pixels.push(PixelCoordinate::new(
                offset_i + (a as f64 + 0.5) * cell_height,
                offset_j + (b as f64 + 0.5) * cell_width,
            ));
        }
    }

    pixels
}
