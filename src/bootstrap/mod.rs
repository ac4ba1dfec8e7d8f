//! Nonparametric bootstrap over a base model.
//!
//! Each iteration clones the base model and its observation graph, replaces
//! the first edge's observations by a sample drawn with replacement, solves
//! the clone and records its final camera poses and internals. The same index
//! list is applied to both sides of the edge so correspondences stay paired.
//!
//! All draws come from one generator passed in by the caller, so a fixed seed
//! reproduces the whole run. The parallel runner draws every index list up
//! front in iteration order before solving, which yields the same samples as
//! the sequential runner.

use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{info, warn};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::camera::CameraPose;
use crate::features::ObservationGraph;
use crate::model::{first_edge, BaseModel, ModelError, ModelId};
use crate::optimization::SolverOptions;
use crate::util::{ensure_parent_dir, UtilError};

#[derive(thiserror::Error, Debug)]
pub enum BootstrapError {
    #[error("Invalid bootstrap configuration: {0}")]
    InvalidConfig(String),
    #[error("Model {0:?} is not a base model")]
    NotABaseModel(ModelId),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error("Bootstrap iteration {iteration} failed: {source}")]
    Iteration {
        iteration: usize,
        #[source]
        source: ModelError,
    },
    #[error("Bootstrap cancelled after {completed} iterations")]
    Cancelled { completed: usize },
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Util(#[from] UtilError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapConfig {
    /// Number of resampled solves.
    pub number_of_samples: usize,
    /// Observations per sample, the edge's observation count when unset.
    pub size_of_samples: Option<usize>,
    pub seed: u64,
    /// Solve iterations on the rayon thread pool.
    pub parallel: bool,
    /// Skip failed iterations instead of aborting the run.
    pub retain_partial: bool,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        BootstrapConfig {
            number_of_samples: 100,
            size_of_samples: None,
            seed: 0,
            parallel: false,
            retain_partial: false,
        }
    }
}

impl BootstrapConfig {
    pub fn validate(&self) -> Result<(), BootstrapError> {
        if self.number_of_samples == 0 {
            return Err(BootstrapError::InvalidConfig(
                "number_of_samples must be positive".to_string(),
            ));
        }
        if self.size_of_samples == Some(0) {
            return Err(BootstrapError::InvalidConfig(
                "size_of_samples must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BootstrapFailure {
    pub iteration: usize,
    pub reason: String,
}

/// Samples of a bootstrap run, in draw order.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BootstrapResult {
    /// Final camera poses of each successful iteration.
    pub external_samples: Vec<Vec<CameraPose>>,
    /// `[f, ppx, ppy, pixel_pitch]` of each successful iteration.
    pub internal_samples: Vec<[f64; 4]>,
    /// Iterations skipped with `retain_partial`.
    #[serde(default)]
    pub failures: Vec<BootstrapFailure>,
}

#[derive(Serialize)]
struct SampleRow {
    sample: usize,
    camera: usize,
    x: f64,
    y: f64,
    z: f64,
    roll: f64,
    pitch: f64,
    yaw: f64,
    f: f64,
    ppx: f64,
    ppy: f64,
    pixel_pitch: f64,
}

impl BootstrapResult {
    pub fn len(&self) -> usize {
        self.external_samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.external_samples.is_empty()
    }

    /// Writes one CSV row per (sample, camera) with the sample's internals.
    pub fn write_csv<W: Write>(&self, writer: W) -> Result<(), BootstrapError> {
        let mut wtr = csv::Writer::from_writer(writer);
        for (sample, (cameras, internal)) in self
            .external_samples
            .iter()
            .zip(&self.internal_samples)
            .enumerate()
        {
            for (camera, pose) in cameras.iter().enumerate() {
                wtr.serialize(SampleRow {
                    sample,
                    camera,
                    x: pose.x,
                    y: pose.y,
                    z: pose.z,
                    roll: pose.roll,
                    pitch: pose.pitch,
                    yaw: pose.yaw,
                    f: internal[0],
                    ppx: internal[1],
                    ppy: internal[2],
                    pixel_pitch: internal[3],
                })?;
            }
        }
        wtr.flush()?;
        Ok(())
    }

    pub fn save_csv(&self, path: &Path) -> Result<(), BootstrapError> {
        ensure_parent_dir(path)?;
        let file = std::fs::File::create(path)?;
        self.write_csv(file)
    }
}

/// A bootstrap run over a model of a project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bootstrap {
    pub model: ModelId,
    pub config: BootstrapConfig,
    #[serde(default)]
    pub result: Option<BootstrapResult>,
}

/// Draws `size` indices uniformly from `0..len`, with replacement.
pub fn draw_indices<R: Rng + ?Sized>(rng: &mut R, len: usize, size: usize) -> Vec<usize> {
    (0..size).map(|_| rng.random_range(0..len)).collect()
}

type Sample = (Vec<CameraPose>, [f64; 4]);

/// Solves one resampled copy of `base`. Nothing is shared with the caller's
/// model or graph.
fn solve_resample(
    base: &BaseModel,
    graph: &ObservationGraph,
    indices: &[usize],
    options: &SolverOptions,
) -> Result<Sample, ModelError> {
    let mut graph = graph.clone();
    if let Some(edge) = graph.edges_mut().first_mut() {
        edge.resample(indices)?;
    }

    let mut model = base.clone();
    model.reset();
    model.solve(&graph, options)?;
    Ok((model.final_external()?.to_vec(), model.final_internal()))
}

fn is_cancelled(cancel: Option<&AtomicBool>) -> bool {
    cancel.is_some_and(|flag| flag.load(Ordering::Relaxed))
}

/// Runs the bootstrap with the caller's generator.
///
/// `cancel` is checked between iterations. A failed iteration aborts the run
/// unless `config.retain_partial` is set, in which case it is recorded in
/// [`BootstrapResult::failures`] and skipped.
pub fn run<R: Rng + ?Sized>(
    base: &BaseModel,
    graph: &ObservationGraph,
    config: &BootstrapConfig,
    options: &SolverOptions,
    rng: &mut R,
    cancel: Option<&AtomicBool>,
) -> Result<BootstrapResult, BootstrapError> {
    config.validate()?;
    let (edge, _) = first_edge(graph)?;
    let len = edge.len();
    if len == 0 {
        return Err(BootstrapError::InvalidConfig(
            "first edge has no observations to resample".to_string(),
        ));
    }
    let size = config.size_of_samples.unwrap_or(len);
    let options = SolverOptions {
        record_history: false,
        ..options.clone()
    };
    info!(
        "Bootstrap: {} samples of {} observations drawn from {}",
        config.number_of_samples, size, len
    );

    let mut result = BootstrapResult::default();
    if config.parallel {
        let draws: Vec<Vec<usize>> = (0..config.number_of_samples)
            .map(|_| draw_indices(rng, len, size))
            .collect();
        let outcomes: Vec<Option<Result<Sample, ModelError>>> = draws
            .par_iter()
            .map(|indices| {
                if is_cancelled(cancel) {
                    None
                } else {
                    Some(solve_resample(base, graph, indices, &options))
                }
            })
            .collect();
        for (iteration, outcome) in outcomes.into_iter().enumerate() {
            let Some(outcome) = outcome else {
                return Err(BootstrapError::Cancelled {
                    completed: result.len(),
                });
            };
            record(&mut result, config, iteration, outcome)?;
        }
    } else {
        for iteration in 0..config.number_of_samples {
            if is_cancelled(cancel) {
                return Err(BootstrapError::Cancelled {
                    completed: result.len(),
                });
            }
            let indices = draw_indices(rng, len, size);
            let outcome = solve_resample(base, graph, &indices, &options);
            record(&mut result, config, iteration, outcome)?;
        }
    }

    info!(
        "Bootstrap finished: {} samples, {} failures",
        result.len(),
        result.failures.len()
    );
    Ok(result)
}

fn record(
    result: &mut BootstrapResult,
    config: &BootstrapConfig,
    iteration: usize,
    outcome: Result<Sample, ModelError>,
) -> Result<(), BootstrapError> {
    match outcome {
        Ok((external, internal)) => {
            info!("Bootstrap iteration {} / {} done", iteration + 1, config.number_of_samples);
            result.external_samples.push(external);
            result.internal_samples.push(internal);
            Ok(())
        }
        Err(source) if config.retain_partial => {
            warn!("Bootstrap iteration {iteration} skipped: {source}");
            result.failures.push(BootstrapFailure {
                iteration,
                reason: source.to_string(),
            });
            Ok(())
        }
        Err(source) => Err(BootstrapError::Iteration { iteration, source }),
    }
}

/// Runs the bootstrap with a generator seeded from `config.seed`.
pub fn run_seeded(
    base: &BaseModel,
    graph: &ObservationGraph,
    config: &BootstrapConfig,
    options: &SolverOptions,
    cancel: Option<&AtomicBool>,
) -> Result<BootstrapResult, BootstrapError> {
    let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
    run(base, graph, config, options, &mut rng, cancel)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::test_scene::*;
    use crate::model::{BaseModelSetup, GraphId};

    fn base_model(cameras: Vec<CameraPose>) -> BaseModel {
        BaseModel::new(
            GraphId(0),
            BaseModelSetup {
                internal: internal(),
                pixel_pitch: PIXEL_PITCH,
                cameras,
            },
        )
        .unwrap()
    }

    fn start_cameras() -> Vec<CameraPose> {
        let mut cameras = true_cameras();
        cameras[1].x += 0.5;
        cameras
    }

    fn config(number_of_samples: usize, size_of_samples: usize) -> BootstrapConfig {
        BootstrapConfig {
            number_of_samples,
            size_of_samples: Some(size_of_samples),
            seed: 42,
            ..BootstrapConfig::default()
        }
    }

    #[test]
    fn test_five_samples_of_ten() {
        let graph = flat_graph(10);
        let base = base_model(start_cameras());
        let result =
            run_seeded(&base, &graph, &config(5, 10), &SolverOptions::default(), None).unwrap();

        assert_eq!(result.external_samples.len(), 5);
        assert_eq!(result.internal_samples.len(), 5);
        assert!(result.failures.is_empty());
        for (cameras, internal) in result.external_samples.iter().zip(&result.internal_samples) {
            assert_eq!(cameras.len(), 2);
            assert_eq!(cameras[0], start_cameras()[0]);
            assert_eq!(*internal, base.final_internal());
        }
        // The base model itself is untouched.
        assert_eq!(base.state(), crate::model::ModelState::Uninitialized);
    }

    #[test]
    fn test_reproducible_with_fixed_seed() {
        let graph = flat_graph(10);
        let base = base_model(start_cameras());
        let first =
            run_seeded(&base, &graph, &config(3, 12), &SolverOptions::default(), None).unwrap();
        let second =
            run_seeded(&base, &graph, &config(3, 12), &SolverOptions::default(), None).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_parallel_matches_sequential() {
        let graph = flat_graph(10);
        let base = base_model(start_cameras());
        let sequential =
            run_seeded(&base, &graph, &config(4, 8), &SolverOptions::default(), None).unwrap();
        let parallel_config = BootstrapConfig {
            parallel: true,
            ..config(4, 8)
        };
        let parallel =
            run_seeded(&base, &graph, &parallel_config, &SolverOptions::default(), None).unwrap();
        assert_eq!(sequential, parallel);
    }

    #[test]
    fn test_draws_are_seeded_and_in_range() {
        let mut a = ChaCha8Rng::seed_from_u64(7);
        let mut b = ChaCha8Rng::seed_from_u64(7);
        let draw_a = draw_indices(&mut a, 10, 25);
        assert_eq!(draw_a.len(), 25);
        assert!(draw_a.iter().all(|&k| k < 10));
        assert_eq!(draw_a, draw_indices(&mut b, 10, 25));

        let mut c = ChaCha8Rng::seed_from_u64(8);
        assert_ne!(draw_a, draw_indices(&mut c, 10, 25));
    }

    #[test]
    fn test_resample_keeps_pairs() {
        let graph = flat_graph(10);
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let indices = draw_indices(&mut rng, 10, 15);

        let mut clone = graph.clone();
        clone.edges_mut()[0].resample(&indices).unwrap();
        let original = &graph.edges()[0];
        let resampled = &clone.edges()[0];
        assert_eq!(resampled.obs_a().len(), resampled.obs_b().len());
        assert_eq!(resampled.len(), 15);
        for (k, &index) in indices.iter().enumerate() {
            assert_eq!(resampled.obs_a()[k], original.obs_a()[index]);
            assert_eq!(resampled.obs_b()[k], original.obs_b()[index]);
        }
        assert_eq!(graph.edges()[0].len(), 10);
    }

    #[test]
    fn test_failure_aborts_by_default() {
        let graph = flat_graph(10);
        // A camera on the elevation plane makes back-projection singular.
        let mut cameras = start_cameras();
        cameras[1].z = 0.0;
        let base = base_model(cameras);

        let err = run_seeded(&base, &graph, &config(3, 10), &SolverOptions::default(), None)
            .unwrap_err();
        match err {
            BootstrapError::Iteration { iteration, source } => {
                assert_eq!(iteration, 0);
                assert!(source.is_numerical_instability());
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_failure_is_skipped_with_retain_partial() {
        let graph = flat_graph(10);
        let mut cameras = start_cameras();
        cameras[1].z = 0.0;
        let base = base_model(cameras);
        let config = BootstrapConfig {
            retain_partial: true,
            ..config(3, 10)
        };

        let result = run_seeded(&base, &graph, &config, &SolverOptions::default(), None).unwrap();
        assert!(result.is_empty());
        assert!(result.internal_samples.is_empty());
        let iterations: Vec<usize> = result.failures.iter().map(|f| f.iteration).collect();
        assert_eq!(iterations, vec![0, 1, 2]);
    }

    #[test]
    fn test_cancelled_before_start() {
        let graph = flat_graph(10);
        let base = base_model(start_cameras());
        let cancel = AtomicBool::new(true);
        for parallel in [false, true] {
            let config = BootstrapConfig {
                parallel,
                ..config(3, 10)
            };
            let err = run_seeded(&base, &graph, &config, &SolverOptions::default(), Some(&cancel))
                .unwrap_err();
            assert!(matches!(err, BootstrapError::Cancelled { completed: 0 }));
        }
    }

    #[test]
    fn test_invalid_config() {
        let graph = flat_graph(10);
        let base = base_model(start_cameras());
        for config in [config(0, 10), config(3, 0)] {
            assert!(matches!(
                run_seeded(&base, &graph, &config, &SolverOptions::default(), None),
                Err(BootstrapError::InvalidConfig(_))
            ));
        }
    }

    #[test]
    fn test_csv_export() {
        let result = BootstrapResult {
            external_samples: vec![true_cameras(), true_cameras()],
            internal_samples: vec![[1.0, 2.0, 3.0, 4.0]; 2],
            failures: Vec::new(),
        };
        let mut buffer = Vec::new();
        result.write_csv(&mut buffer).unwrap();
        let text = String::from_utf8(buffer).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 1 + 4);
        assert_eq!(
            lines[0],
            "sample,camera,x,y,z,roll,pitch,yaw,f,ppx,ppy,pixel_pitch"
        );
        assert!(lines[4].starts_with("1,1,12.0,3.0,268.0,"));
    }
}
