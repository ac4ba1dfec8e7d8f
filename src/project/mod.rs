//! Persisted project state.
//!
//! A [`Project`] owns the image-set descriptor, the observation graphs, the
//! models and the bootstrap runs. Models refer to graphs and to their parent
//! model by index into these arenas. Projects are stored as JSON; a new
//! project is usually created from a YAML [`ProjectConfig`].

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;

use log::info;
use serde::{Deserialize, Serialize};

use crate::bootstrap::{run_seeded, Bootstrap, BootstrapConfig, BootstrapError, BootstrapResult};
use crate::features::{DataSet, FeatureMatcher, FeaturesError, ObservationGraph};
use crate::model::{
    BaseModel, BaseModelSetup, GraphId, Model, ModelError, ModelId, SolveReport, TerrainModel,
};
use crate::optimization::SolverOptions;
use crate::util::{ensure_parent_dir, UtilError};

#[derive(thiserror::Error, Debug)]
pub enum ProjectError {
    #[error("Can't access {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Bootstrap(#[from] BootstrapError),
    #[error(transparent)]
    Features(#[from] FeaturesError),
    #[error(transparent)]
    Util(#[from] UtilError),
    #[error("Unknown bootstrap {0}")]
    UnknownBootstrap(usize),
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> ProjectError + '_ {
    move |source| ProjectError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn default_compute_scale() -> f64 {
    1.0
}

fn default_edges() -> Vec<(usize, usize)> {
    vec![(0, 1)]
}

/// YAML description of a new project.
///
/// ```yaml
/// data_set:
///   filenames: [left.jpg, right.jpg]
/// number_of_matches: 500
/// compute_scale: 0.5
/// base_model:
///   internal: [0.0483355, 0.0000093, -0.0000276]
///   pixel_pitch: 0.0000085
///   cameras:
///     - [0.0, 0.0, 269.0, 0.0, 0.0, 0.0]
///     - [0.0, 0.0, 269.0, 0.0, 0.0, 0.0]
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectConfig {
    pub data_set: DataSet,
    pub number_of_matches: usize,
    #[serde(default = "default_compute_scale")]
    pub compute_scale: f64,
    /// Camera pairs to match, `[(0, 1)]` when omitted.
    #[serde(default = "default_edges")]
    pub edges: Vec<(usize, usize)>,
    pub base_model: BaseModelSetup,
    #[serde(default)]
    pub bootstrap: Option<BootstrapConfig>,
    #[serde(default)]
    pub solver: SolverOptions,
}

impl ProjectConfig {
    pub fn load(path: &Path) -> Result<Self, ProjectError> {
        let file = File::open(path).map_err(io_error(path))?;
        Ok(serde_yaml::from_reader(BufReader::new(file))?)
    }

    pub fn save(&self, path: &Path) -> Result<(), ProjectError> {
        ensure_parent_dir(path)?;
        let file = File::create(path).map_err(io_error(path))?;
        serde_yaml::to_writer(BufWriter::new(file), self)?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Project {
    pub data_set: Option<DataSet>,
    #[serde(default)]
    pub graphs: Vec<ObservationGraph>,
    #[serde(default)]
    pub models: Vec<Model>,
    #[serde(default)]
    pub bootstraps: Vec<Bootstrap>,
}

impl Project {
    pub fn new(data_set: DataSet) -> Self {
        Project {
            data_set: Some(data_set),
            ..Project::default()
        }
    }

    /// Creates a project with one uncomputed graph, a base model over it and
    /// the optional bootstrap run described by `config`.
    pub fn from_config(config: &ProjectConfig) -> Result<Self, ProjectError> {
        let mut project = Project::new(config.data_set.clone());

        let mut graph = ObservationGraph::new(
            Some(config.data_set.clone()),
            config.number_of_matches,
            config.compute_scale,
        );
        for &(cam_a, cam_b) in &config.edges {
            graph.add_edge(cam_a, cam_b)?;
        }
        let graph = project.add_graph(graph);

        let base = project.add_model(BaseModel::new(graph, config.base_model.clone())?)?;
        if let Some(bootstrap) = &config.bootstrap {
            project.add_bootstrap(base, bootstrap.clone())?;
        }
        info!(
            "Created project with {} images and {} edges",
            config.data_set.len(),
            config.edges.len()
        );
        Ok(project)
    }

    pub fn from_file(path: &Path) -> Result<Self, ProjectError> {
        let file = File::open(path).map_err(io_error(path))?;
        let project = serde_json::from_reader(BufReader::new(file))?;
        info!("Loaded project from {}", path.display());
        Ok(project)
    }

    pub fn to_file(&self, path: &Path) -> Result<(), ProjectError> {
        ensure_parent_dir(path)?;
        let file = File::create(path).map_err(io_error(path))?;
        serde_json::to_writer_pretty(BufWriter::new(file), self)?;
        info!("Saved project to {}", path.display());
        Ok(())
    }

    pub fn add_graph(&mut self, graph: ObservationGraph) -> GraphId {
        self.graphs.push(graph);
        GraphId(self.graphs.len() - 1)
    }

    /// Adds a model. Its graph and parent must already be in the project, so
    /// parents always precede their children.
    pub fn add_model(&mut self, model: impl Into<Model>) -> Result<ModelId, ProjectError> {
        let model = model.into();
        self.graph(model.graph())?;
        if let Some(parent) = model.parent() {
            self.model(parent)?;
        }
        self.models.push(model);
        Ok(ModelId(self.models.len() - 1))
    }

    /// Adds a terrain model over `graph` using the internals of `parent`.
    pub fn add_terrain_model(
        &mut self,
        graph: GraphId,
        parent: ModelId,
    ) -> Result<ModelId, ProjectError> {
        let model = TerrainModel::from_parent(graph, parent, self.model(parent)?)?;
        self.add_model(model)
    }

    pub fn add_bootstrap(
        &mut self,
        model: ModelId,
        config: BootstrapConfig,
    ) -> Result<usize, ProjectError> {
        if self.model(model)?.as_base().is_none() {
            return Err(BootstrapError::NotABaseModel(model).into());
        }
        config.validate()?;
        self.bootstraps.push(Bootstrap {
            model,
            config,
            result: None,
        });
        Ok(self.bootstraps.len() - 1)
    }

    pub fn graph(&self, id: GraphId) -> Result<&ObservationGraph, ModelError> {
        self.graphs.get(id.0).ok_or(ModelError::UnknownGraph(id))
    }

    pub fn model(&self, id: ModelId) -> Result<&Model, ModelError> {
        self.models.get(id.0).ok_or(ModelError::UnknownModel(id))
    }

    /// Computes graph `id` unless it is already computed. Returns whether
    /// matching ran.
    pub fn compute_features(
        &mut self,
        id: GraphId,
        data_root: &Path,
        matcher: &dyn FeatureMatcher,
    ) -> Result<bool, ProjectError> {
        let graph = self
            .graphs
            .get_mut(id.0)
            .ok_or(ModelError::UnknownGraph(id))?;
        if graph.computed {
            info!("Graph {} already computed, skipping", id.0);
            return Ok(false);
        }
        graph.compute(data_root, matcher)?;
        if let (Some(data_set), Some(computed)) =
            (self.data_set.as_mut(), graph.data_set.as_ref())
        {
            if data_set.extent().is_none() {
                data_set.rows = computed.rows;
                data_set.cols = computed.cols;
            }
        }
        Ok(true)
    }

    /// Solves model `id`. A terrain model requires its parent to be solved.
    pub fn solve_model(
        &mut self,
        id: ModelId,
        options: &SolverOptions,
    ) -> Result<SolveReport, ProjectError> {
        let model = self.model(id)?;
        let parent_cameras = match model.parent() {
            Some(parent) => {
                let parent = self.model(parent)?;
                if !parent.is_solved() {
                    return Err(ModelError::NotAvailable(
                        "final cameras of an unsolved parent model".to_string(),
                    )
                    .into());
                }
                Some(parent.final_external()?.to_vec())
            }
            None => None,
        };

        let graph_id = model.graph();
        let graph = self
            .graphs
            .get(graph_id.0)
            .ok_or(ModelError::UnknownGraph(graph_id))?;
        let report = match self.models.get_mut(id.0).ok_or(ModelError::UnknownModel(id))? {
            Model::Base(model) => model.solve(graph, options)?,
            Model::Terrain(model) => model.solve(graph, parent_cameras.as_deref(), options)?,
        };
        Ok(report)
    }

    /// Runs bootstrap `index` and stores its result, replacing any previous
    /// one.
    pub fn run_bootstrap(
        &mut self,
        index: usize,
        options: &SolverOptions,
        cancel: Option<&AtomicBool>,
    ) -> Result<&BootstrapResult, ProjectError> {
        let bootstrap = self
            .bootstraps
            .get(index)
            .ok_or(ProjectError::UnknownBootstrap(index))?;
        let model_id = bootstrap.model;
        let base = self
            .model(model_id)?
            .as_base()
            .ok_or(BootstrapError::NotABaseModel(model_id))?;
        let graph = self.graph(base.graph)?;

        let result = run_seeded(base, graph, &bootstrap.config, options, cancel)?;
        let bootstrap = &mut self.bootstraps[index];
        Ok(bootstrap.result.insert(result))
    }
}
