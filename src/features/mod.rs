//! Observation graph: pixel correspondences between pairs of images.
//!
//! An [`ObservationGraph`] holds an image-set descriptor ([`DataSet`]) and a
//! list of [`Edge`]s. Each edge names two cameras and carries two parallel
//! lists of pixel observations, `obs_a[k]` matching `obs_b[k]`, ordered by
//! increasing match distance. The correspondences themselves come from an
//! external [`FeatureMatcher`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView};
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::camera::ImageExtent;
use crate::geometry::PixelCoordinate;

#[derive(thiserror::Error, Debug)]
pub enum FeaturesError {
    #[error("Observation graph has no associated data set")]
    MissingDataSet,
    #[error("Invalid maximum number of matches: {0}")]
    InvalidMatchCount(usize),
    #[error("Invalid compute scale {0}, must be in (0, 1]")]
    InvalidScale(f64),
    #[error("Invalid edge ({cam_a}, {cam_b}): {reason}")]
    InvalidEdge {
        cam_a: usize,
        cam_b: usize,
        reason: String,
    },
    #[error("Observation graph has no edges")]
    NoEdges,
    #[error("Can't load image {}: {reason}", path.display())]
    ImageLoad { path: PathBuf, reason: String },
    #[error("Image {} is {found_rows}x{found_cols}, expected {rows}x{cols}", path.display())]
    InconsistentImageSize {
        path: PathBuf,
        rows: u32,
        cols: u32,
        found_rows: u32,
        found_cols: u32,
    },
    #[error("Feature matching failed: {0}")]
    Matcher(String),
    #[error("Observation lists differ in length: {len_a} != {len_b}")]
    MismatchedObservations { len_a: usize, len_b: usize },
    #[error("Observation index {index} out of range ({len} observations)")]
    IndexOutOfRange { index: usize, len: usize },
}

/// Image-set descriptor: file names relative to a data root, and the common
/// image extent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSet {
    pub filenames: Vec<String>,
    /// Image height in pixels, `0` until known.
    #[serde(default)]
    pub rows: u32,
    /// Image width in pixels, `0` until known.
    #[serde(default)]
    pub cols: u32,
}

impl DataSet {
    pub fn new(filenames: Vec<String>) -> Self {
        DataSet {
            filenames,
            rows: 0,
            cols: 0,
        }
    }

    pub fn with_extent(filenames: Vec<String>, extent: ImageExtent) -> Self {
        DataSet {
            filenames,
            rows: extent.rows,
            cols: extent.cols,
        }
    }

    /// The image extent, `None` while the images haven't been inspected.
    pub fn extent(&self) -> Option<ImageExtent> {
        let extent = ImageExtent::new(self.rows, self.cols);
        if extent.is_empty() {
            None
        } else {
            Some(extent)
        }
    }

    pub fn len(&self) -> usize {
        self.filenames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filenames.is_empty()
    }
}

/// One correspondence returned by a [`FeatureMatcher`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeatureMatch {
    pub a: PixelCoordinate,
    pub b: PixelCoordinate,
    /// Descriptor distance, lower is better.
    pub distance: f32,
}

/// External feature-matching service.
///
/// Given two decoded images, returns pixel correspondences ordered by
/// ascending match distance, at most `max_matches` of them. Detector,
/// descriptor and matcher are up to the implementation.
pub trait FeatureMatcher {
    fn match_features(
        &self,
        image_a: &DynamicImage,
        image_b: &DynamicImage,
        max_matches: usize,
    ) -> Result<Vec<FeatureMatch>, FeaturesError>;
}

#[derive(Deserialize)]
struct EdgeData {
    cam_a: usize,
    cam_b: usize,
    obs_a: Vec<PixelCoordinate>,
    obs_b: Vec<PixelCoordinate>,
}

/// A pair of cameras and their paired pixel observations.
///
/// `obs_a.len() == obs_b.len()` always holds: the lists can only be replaced
/// together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "EdgeData")]
pub struct Edge {
    cam_a: usize,
    cam_b: usize,
    obs_a: Vec<PixelCoordinate>,
    obs_b: Vec<PixelCoordinate>,
}

impl TryFrom<EdgeData> for Edge {
    type Error = FeaturesError;

    fn try_from(data: EdgeData) -> Result<Self, Self::Error> {
        let mut edge = Edge::new(data.cam_a, data.cam_b)?;
        edge.set_observations(data.obs_a, data.obs_b)?;
        Ok(edge)
    }
}

impl Edge {
    pub fn new(cam_a: usize, cam_b: usize) -> Result<Self, FeaturesError> {
        if cam_a == cam_b {
            return Err(FeaturesError::InvalidEdge {
                cam_a,
                cam_b,
                reason: "an edge must join two distinct cameras".to_string(),
            });
        }
        Ok(Edge {
            cam_a,
            cam_b,
            obs_a: Vec::new(),
            obs_b: Vec::new(),
        })
    }

    pub fn cam_a(&self) -> usize {
        self.cam_a
    }

    pub fn cam_b(&self) -> usize {
        self.cam_b
    }

    pub fn obs_a(&self) -> &[PixelCoordinate] {
        &self.obs_a
    }

    pub fn obs_b(&self) -> &[PixelCoordinate] {
        &self.obs_b
    }

    /// Number of correspondences.
    pub fn len(&self) -> usize {
        self.obs_a.len()
    }

    pub fn is_empty(&self) -> bool {
        self.obs_a.is_empty()
    }

    /// Iterates over `(obs_a[k], obs_b[k])` pairs.
    pub fn pairs(&self) -> impl Iterator<Item = (&PixelCoordinate, &PixelCoordinate)> {
        self.obs_a.iter().zip(self.obs_b.iter())
    }

    /// Replaces both observation lists.
    pub fn set_observations(
        &mut self,
        obs_a: Vec<PixelCoordinate>,
        obs_b: Vec<PixelCoordinate>,
    ) -> Result<(), FeaturesError> {
        if obs_a.len() != obs_b.len() {
            return Err(FeaturesError::MismatchedObservations {
                len_a: obs_a.len(),
                len_b: obs_b.len(),
            });
        }
        self.obs_a = obs_a;
        self.obs_b = obs_b;
        Ok(())
    }

    pub fn push(&mut self, a: PixelCoordinate, b: PixelCoordinate) {
        self.obs_a.push(a);
        self.obs_b.push(b);
    }

    /// Replaces the observations with the ones at `indices`, applying the same
    /// index list to both sides so that pairs stay together. Indices may
    /// repeat and their count may differ from the current length.
    pub fn resample(&mut self, indices: &[usize]) -> Result<(), FeaturesError> {
        let len = self.len();
        if let Some(&index) = indices.iter().find(|&&index| index >= len) {
            return Err(FeaturesError::IndexOutOfRange { index, len });
        }
        let obs_a = indices.iter().map(|&k| self.obs_a[k]).collect();
        let obs_b = indices.iter().map(|&k| self.obs_b[k]).collect();
        self.set_observations(obs_a, obs_b)
    }
}

/// Pairwise correspondences over an image set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservationGraph {
    pub data_set: Option<DataSet>,
    /// Requested number of correspondences per edge.
    pub number_of_matches: usize,
    /// Downscaling factor applied to the images before matching.
    pub compute_scale: f64,
    /// Set once [`ObservationGraph::compute`] has populated every edge.
    pub computed: bool,
    edges: Vec<Edge>,
}

impl ObservationGraph {
    pub fn new(data_set: Option<DataSet>, number_of_matches: usize, compute_scale: f64) -> Self {
        ObservationGraph {
            data_set,
            number_of_matches,
            compute_scale,
            computed: false,
            edges: Vec::new(),
        }
    }

    /// Builds an already computed graph from known correspondences, for
    /// observations produced outside of [`ObservationGraph::compute`].
    pub fn from_edges(data_set: DataSet, edges: Vec<Edge>) -> Self {
        let number_of_matches = edges.iter().map(Edge::len).max().unwrap_or(0);
        ObservationGraph {
            data_set: Some(data_set),
            number_of_matches,
            compute_scale: 1.0,
            computed: true,
            edges,
        }
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    /// Mutable access to the edges, for resampling an owned copy of a graph.
    pub fn edges_mut(&mut self) -> &mut [Edge] {
        &mut self.edges
    }

    pub fn extent(&self) -> Option<ImageExtent> {
        self.data_set.as_ref().and_then(DataSet::extent)
    }

    /// Appends an edge with empty observation lists and returns its index.
    pub fn add_edge(&mut self, cam_a: usize, cam_b: usize) -> Result<usize, FeaturesError> {
        let edge = Edge::new(cam_a, cam_b)?;
        if let Some(data_set) = &self.data_set {
            let n = data_set.len();
            if cam_a >= n || cam_b >= n {
                return Err(FeaturesError::InvalidEdge {
                    cam_a,
                    cam_b,
                    reason: format!("data set has only {n} images"),
                });
            }
        }
        self.edges.push(edge);
        Ok(self.edges.len() - 1)
    }

    /// Populates every edge with correspondences from `matcher` and marks the
    /// graph computed.
    ///
    /// Images are read from `data_root` joined with the data set file names
    /// and downscaled by `compute_scale` before matching. Matches are mapped
    /// back to full-resolution pixel coordinates, sorted by increasing
    /// distance and truncated to `number_of_matches`.
    ///
    /// Calling this on an already computed graph recomputes it; callers check
    /// [`ObservationGraph::computed`] to skip that.
    ///
    /// # Errors
    ///
    /// Fails without modifying the graph if there is no data set, the match
    /// count or scale is invalid, there are no edges, an image can't be
    /// decoded, or the matcher fails.
    pub fn compute(
        &mut self,
        data_root: &Path,
        matcher: &dyn FeatureMatcher,
    ) -> Result<(), FeaturesError> {
        let data_set = self.data_set.as_ref().ok_or(FeaturesError::MissingDataSet)?;
        if self.number_of_matches == 0 {
            return Err(FeaturesError::InvalidMatchCount(self.number_of_matches));
        }
        if !(self.compute_scale > 0.0 && self.compute_scale <= 1.0) {
            return Err(FeaturesError::InvalidScale(self.compute_scale));
        }
        if self.edges.is_empty() {
            return Err(FeaturesError::NoEdges);
        }

        let mut extent = data_set.extent();
        let mut images: HashMap<usize, DynamicImage> = HashMap::new();
        let mut results = Vec::with_capacity(self.edges.len());

        for (edge_index, edge) in self.edges.iter().enumerate() {
            for cam in [edge.cam_a, edge.cam_b] {
                if images.contains_key(&cam) {
                    continue;
                }
                let filename = data_set.filenames.get(cam).ok_or_else(|| {
                    FeaturesError::InvalidEdge {
                        cam_a: edge.cam_a,
                        cam_b: edge.cam_b,
                        reason: format!("data set has only {} images", data_set.len()),
                    }
                })?;
                let path = data_root.join(filename);
                let image = load_image(&path, &mut extent)?;
                images.insert(cam, downscale(image, self.compute_scale));
            }

            let image_a = &images[&edge.cam_a];
            let image_b = &images[&edge.cam_b];
            let mut matches =
                matcher.match_features(image_a, image_b, self.number_of_matches)?;
            matches.sort_by(|m, n| m.distance.total_cmp(&n.distance));
            matches.truncate(self.number_of_matches);

            let factor = 1.0 / self.compute_scale;
            let obs_a: Vec<_> = matches.iter().map(|m| m.a.scaled(factor)).collect();
            let obs_b: Vec<_> = matches.iter().map(|m| m.b.scaled(factor)).collect();
            debug!(
                "Edge {} ({}, {}): {} correspondences",
                edge_index,
                edge.cam_a,
                edge.cam_b,
                obs_a.len()
            );
            results.push((obs_a, obs_b));
        }

        for (edge, (obs_a, obs_b)) in self.edges.iter_mut().zip(results) {
            edge.set_observations(obs_a, obs_b)?;
        }
        if let (Some(data_set), Some(extent)) = (self.data_set.as_mut(), extent) {
            data_set.rows = extent.rows;
            data_set.cols = extent.cols;
        }
        self.computed = true;
        info!(
            "Computed observation graph: {} edges, {} matches requested per edge",
            self.edges.len(),
            self.number_of_matches
        );
        Ok(())
    }
}

fn load_image(
    path: &Path,
    extent: &mut Option<ImageExtent>,
) -> Result<DynamicImage, FeaturesError> {
    let image = image::open(path).map_err(|e| FeaturesError::ImageLoad {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    let (width, height) = image.dimensions();
    match extent {
        Some(expected) if expected.rows != height || expected.cols != width => {
            Err(FeaturesError::InconsistentImageSize {
                path: path.to_path_buf(),
                rows: expected.rows,
                cols: expected.cols,
                found_rows: height,
                found_cols: width,
            })
        }
        Some(_) => Ok(image),
        None => {
            *extent = Some(ImageExtent::new(height, width));
            Ok(image)
        }
    }
}

fn downscale(image: DynamicImage, scale: f64) -> DynamicImage {
    if scale >= 1.0 {
        return image;
    }
    let (width, height) = image.dimensions();
    let new_width = ((width as f64 * scale).round() as u32).max(1);
    let new_height = ((height as f64 * scale).round() as u32).max(1);
    image.resize_exact(new_width, new_height, FilterType::Triangle)
}
