use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Deserialize;

use crate::{CodeGenerator, Config, Project, Result, SceneBuild, Toolchain};

/// Options and flags used by [`SceneBuild`].
///
/// Start with [`SceneBuildOptions::new`] or [`SceneBuildOptions::from_config`],
/// chain calls to methods to set different options, then call
/// [`SceneBuildOptions::create`].
///
/// # Example Usage
///
/// ```no_run
/// # use std::sync::Arc;
/// # use parking_lot::RwLock;
/// # use lgn_scene_build::{CodeGenerator, Project, SceneBuildOptions, Toolchain};
/// # fn toolchain() -> Arc<dyn Toolchain> { unimplemented!() }
/// # fn generator() -> Arc<dyn CodeGenerator> { unimplemented!() }
/// # #[tokio::main]
/// # async fn main() {
/// let project = Arc::new(RwLock::new(Project::new("my_game/")));
/// let build = SceneBuildOptions::new("my_game/temp/")
///     .workers(4)
///     .extensions_dir("runtime/extensions/")
///     .create(project, toolchain(), generator())
///     .unwrap();
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct SceneBuildOptions {
    pub(crate) output_dir: PathBuf,
    pub(crate) extensions_dir: Option<PathBuf>,
    pub(crate) header_dirs: Vec<PathBuf>,
    pub(crate) workers: usize,
    pub(crate) max_relaunches: u32,
    pub(crate) delete_temporaries: bool,
    pub(crate) profiling: bool,
}

/// `[scene_build]` section of the configuration.
#[derive(Deserialize, Default)]
#[serde(default)]
struct SceneBuildSection {
    workers: Option<usize>,
    max_relaunches: Option<u32>,
    keep_temporaries: Option<bool>,
    profiling: Option<bool>,
}

impl SceneBuildOptions {
    /// Creates options writing artifacts to `output_dir`.
    pub fn new(output_dir: impl AsRef<Path>) -> Self {
        Self {
            output_dir: output_dir.as_ref().to_owned(),
            extensions_dir: None,
            header_dirs: vec![],
            workers: 1,
            max_relaunches: 32,
            delete_temporaries: true,
            profiling: true,
        }
    }

    /// Reads options from the `[scene_build]` section of `config`.
    ///
    /// Without an `output_dir` key, artifacts go to a directory of the
    /// system's temporary directory.
    pub fn from_config(config: &Config) -> Result<Self> {
        let output_dir = config
            .get_absolute_path("scene_build.output_dir")?
            .unwrap_or_else(|| std::env::temp_dir().join("lgn-scene-build"));
        let section: SceneBuildSection = config.get_or("scene_build", SceneBuildSection::default())?;

        let mut options = Self::new(output_dir);
        options.extensions_dir = config.get_absolute_path("scene_build.extensions_dir")?;
        options.header_dirs = config
            .get::<Vec<PathBuf>>("scene_build.header_dirs")?
            .unwrap_or_default();
        if let Some(workers) = section.workers {
            options = options.workers(workers);
        }
        if let Some(max_relaunches) = section.max_relaunches {
            options = options.max_relaunches(max_relaunches);
        }
        if let Some(keep_temporaries) = section.keep_temporaries {
            options = options.delete_temporaries(!keep_temporaries);
        }
        if let Some(profiling) = section.profiling {
            options = options.profiling(profiling);
        }
        Ok(options)
    }

    /// Directory holding the extension libraries. Without it every extension
    /// used by the project is linked, whether its library exists or not.
    #[must_use]
    pub fn extensions_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.extensions_dir = Some(dir.as_ref().to_owned());
        self
    }

    /// Adds an include directory to every compilation.
    #[must_use]
    pub fn header_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.header_dirs.push(dir.as_ref().to_owned());
        self
    }

    /// Number of tasks run at the same time. At least one.
    #[must_use]
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Number of relaunches after which a task waiting on its prerequisites
    /// fails.
    #[must_use]
    pub fn max_relaunches(mut self, max_relaunches: u32) -> Self {
        self.max_relaunches = max_relaunches;
        self
    }

    /// Deletes the code generated from events once compiled.
    #[must_use]
    pub fn delete_temporaries(mut self, delete_temporaries: bool) -> Self {
        self.delete_temporaries = delete_temporaries;
        self
    }

    /// Instruments edit-time code for the profiler. Runtime code never is.
    #[must_use]
    pub fn profiling(mut self, profiling: bool) -> Self {
        self.profiling = profiling;
        self
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Creates the [`SceneBuild`] of `project`.
    ///
    /// Must be called from within a Tokio runtime, which runs the workers.
    pub fn create(
        self,
        project: Arc<RwLock<Project>>,
        toolchain: Arc<dyn Toolchain>,
        generator: Arc<dyn CodeGenerator>,
    ) -> Result<SceneBuild> {
        SceneBuild::new(self, project, toolchain, generator)
    }
}
