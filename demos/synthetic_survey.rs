//! Synthetic Survey Demo
//!
//! Builds a two-camera aerial survey over a known terrain, projects the
//! terrain into both images to create the correspondences, then runs the
//! full pipeline on it:
//! - base camera/terrain model from identical initial camera poses
//! - terrain refinement on a denser observation graph
//! - bootstrap of the base model
//!
//! The project is saved as JSON and the bootstrap samples as CSV.
//!
//! Usage:
//! ```bash
//! RUST_LOG=info cargo run --example synthetic_survey -- \
//!   --matches 10 --samples 5 --output output/synthetic
//! ```

use clap::Parser;
use geosolve::bootstrap::BootstrapConfig;
use geosolve::camera::{project, unproject_to_plane};
use geosolve::geometry::sample_pixels;
use geosolve::{
    BaseModel, BaseModelSetup, CameraPose, DataSet, Edge, ImageExtent, InternalCalibration,
    ObservationGraph, Project, SolveReport, SolverOptions,
};
use log::info;
use nalgebra::Point3;
use std::path::PathBuf;

/// Synthetic two-camera bundle adjustment
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Approximate correspondences in the base observation graph
    #[arg(short = 'm', long, default_value = "10")]
    matches: usize,

    /// Approximate correspondences in the terrain refinement graph
    #[arg(short = 'd', long, default_value = "40")]
    dense_matches: usize,

    /// Bootstrap samples
    #[arg(short = 's', long, default_value = "5")]
    samples: usize,

    /// Bootstrap seed
    #[arg(long, default_value = "42")]
    seed: u64,

    /// Solve bootstrap iterations in parallel
    #[arg(long)]
    parallel: bool,

    /// Output prefix for the project and samples files
    #[arg(short = 'o', long, default_value = "output/synthetic")]
    output: PathBuf,
}

const PIXEL_PITCH: f64 = 0.0085e-3;

/// Ground points under the centre camera: a grid of pixels back-projected to
/// the plane, then raised onto a smooth elevation surface.
fn terrain(
    internal: &InternalCalibration,
    extent: &ImageExtent,
    n: usize,
) -> Result<Vec<Point3<f64>>, Box<dyn std::error::Error>> {
    let camera = CameraPose::nadir(269.0);
    let mut points = Vec::new();
    for pixel in sample_pixels(extent, n, 0.2) {
        let ground = unproject_to_plane(
            internal,
            &camera,
            &pixel.to_sensor(PIXEL_PITCH, extent),
            0.0,
        )?;
        let z = 3.0 * (ground.x / 25.0).sin() * (ground.y / 30.0).cos();
        points.push(Point3::new(ground.x, ground.y, z));
    }
    Ok(points)
}

fn observe(
    internal: &InternalCalibration,
    extent: &ImageExtent,
    cameras: &[CameraPose],
    points: &[Point3<f64>],
) -> Result<Edge, Box<dyn std::error::Error>> {
    let mut edge = Edge::new(0, 1)?;
    for p in points {
        let a = project(internal, &cameras[0], p)?;
        let b = project(internal, &cameras[1], p)?;
        edge.push(
            a.to_pixel(PIXEL_PITCH, extent),
            b.to_pixel(PIXEL_PITCH, extent),
        );
    }
    Ok(edge)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logger
    env_logger::init();

    let cli = Cli::parse();

    let internal = InternalCalibration::new(48.3355e-3, 0.0093e-3, -0.0276e-3);
    let extent = ImageExtent::new(2832, 4256);
    let truth = [
        CameraPose::new(0.0, 0.0, 269.0, 0.0, 0.0, 0.0),
        CameraPose::new(14.0, 1.5, 268.2, 0.003, -0.002, 0.012),
    ];
    let data_set = DataSet::with_extent(vec!["left.jpg".into(), "right.jpg".into()], extent);

    let mut survey = Project::new(data_set.clone());
    let sparse_points = terrain(&internal, &extent, cli.matches)?;
    let sparse = survey.add_graph(ObservationGraph::from_edges(
        data_set.clone(),
        vec![observe(&internal, &extent, &truth, &sparse_points)?],
    ));
    let dense_points = terrain(&internal, &extent, cli.dense_matches)?;
    let dense = survey.add_graph(ObservationGraph::from_edges(
        data_set,
        vec![observe(&internal, &extent, &truth, &dense_points)?],
    ));

    let start = CameraPose::nadir(269.0);
    let base = survey.add_model(BaseModel::new(
        sparse,
        BaseModelSetup {
            internal,
            pixel_pitch: PIXEL_PITCH,
            cameras: vec![start, start],
        },
    )?)?;

    let options = SolverOptions::default();
    if let SolveReport::Solved(summary) = survey.solve_model(base, &options)? {
        println!(
            "Base model: cost {:.6e} -> {:.6e}",
            summary.initial_cost, summary.final_cost
        );
    }
    let base_model = survey.model(base)?;
    let cameras = base_model.final_external()?;
    println!("  camera 0: {:?}", cameras[0].to_array());
    println!("  camera 1: {:?}", cameras[1].to_array());
    println!("  truth 1:  {:?}", truth[1].to_array());
    let solutions = base_model.num_solutions();
    println!(
        "  {:?}",
        base_model.reprojection_error(survey.graph(sparse)?, solutions - 1)?
    );

    let refined = survey.add_terrain_model(dense, base)?;
    survey.solve_model(refined, &options)?;
    let points = survey.model(refined)?.final_terrain()?;
    let max_dz = points
        .iter()
        .zip(&dense_points)
        .map(|(p, t)| (p.z - t.z).abs())
        .fold(0.0, f64::max);
    println!(
        "Terrain model: {} points, max elevation error {:.4} m",
        points.len(),
        max_dz
    );

    let bootstrap = survey.add_bootstrap(
        base,
        BootstrapConfig {
            number_of_samples: cli.samples,
            size_of_samples: None,
            seed: cli.seed,
            parallel: cli.parallel,
            retain_partial: true,
        },
    )?;
    let result = survey.run_bootstrap(bootstrap, &options, None)?;
    println!(
        "Bootstrap: {} samples, {} failures",
        result.len(),
        result.failures.len()
    );
    let csv_path = cli.output.with_extension("samples.csv");
    result.save_csv(&csv_path)?;
    info!("Wrote bootstrap samples to {}", csv_path.display());

    let project_path = cli.output.with_extension("json");
    survey.to_file(&project_path)?;
    println!("Project saved to {}", project_path.display());

    Ok(())
}
