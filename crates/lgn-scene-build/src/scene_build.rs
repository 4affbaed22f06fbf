use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::analyzer::{AnalysisRoot, DependenciesAnalyzer, DependencySet};
use crate::compiler::CodeCompiler;
use crate::layout::ArtifactLayout;
use crate::project::{ExternalEvents, ExternalEventsHandle, Project, Scene, SceneHandle, SourceFile};
use crate::staleness;
use crate::task::{CompileTask, CompilerCall, PostWork, PreWork, PreWorkOutcome, TaskContext};
use crate::toolchain::{CodeGenerator, CodeUnit, GenerationOptions, Toolchain};
use crate::{Error, Result, SceneBuildOptions, TargetMode};

/// Progress of the latest compilation requested for a scene and a target
/// mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SceneBuildState {
    Requested,
    AnalyzingDependencies,
    /// Waiting for source files or external events to be compiled.
    WaitingOnPrerequisites,
    Compiling,
    Linking,
    Linked,
    CompileFailed,
    LinkFailed,
    CycleDetected,
}

impl SceneBuildState {
    /// Whether the build is over, successfully or not.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Linked | Self::CompileFailed | Self::LinkFailed | Self::CycleDetected
        )
    }
}

/// Extensions of the `lib{name}` files an extension library can be found as.
const LIBRARY_SUFFIXES: [&str; 4] = [".a", ".dll.a", ".so", ".dylib"];

#[derive(Default)]
struct Prerequisites {
    /// Tasks building stale prerequisites.
    tasks: Vec<CompileTask>,
    /// Prerequisites not built yet, queued or not.
    outstanding: usize,
}

/// State shared by the build and its task hooks.
struct Pipeline {
    project: Arc<RwLock<Project>>,
    generator: Arc<dyn CodeGenerator>,
    layout: ArtifactLayout,
    extensions_dir: Option<PathBuf>,
    header_dirs: Vec<PathBuf>,
    profiling: bool,
    states: Mutex<HashMap<(SceneHandle, TargetMode), SceneBuildState>>,
}

impl Pipeline {
    fn set_state(&self, scene: SceneHandle, mode: TargetMode, state: SceneBuildState) {
        self.states.lock().insert((scene, mode), state);
    }

    /// Records a failure, keeping a detected cycle as the reason.
    fn fail(&self, scene: SceneHandle, mode: TargetMode, state: SceneBuildState) {
        self.states
            .lock()
            .entry((scene, mode))
            .and_modify(|current| {
                if *current != SceneBuildState::CycleDetected {
                    *current = state;
                }
            })
            .or_insert(state);
    }

    fn generation_options(&self, mode: TargetMode) -> GenerationOptions {
        GenerationOptions {
            mode,
            profiling: self.profiling && !mode.is_runtime(),
        }
    }

    fn header_dirs(&self, project: &Project) -> Vec<PathBuf> {
        let mut header_dirs = self.header_dirs.clone();
        header_dirs.push(project.root_dir().to_owned());
        header_dirs
    }

    /// External events of `deps` compiled standalone for `scene_name`.
    fn owned_external_events<'p>(
        project: &'p Project,
        deps: &DependencySet,
        scene_name: &str,
    ) -> Vec<(ExternalEventsHandle, &'p ExternalEvents)> {
        deps.external_events
            .iter()
            .filter_map(|name| {
                let (handle, external_events) = project.external_events_named(name)?;
                let owner = DependenciesAnalyzer::for_external_events(project, handle)
                    .ok()?
                    .external_events_can_be_compiled_for_a_scene();
                if owner.as_deref() == Some(scene_name) {
                    Some((handle, external_events))
                } else {
                    debug!(
                        "External events {} are not compiled on their own for scene {}",
                        name, scene_name
                    );
                    None
                }
            })
            .collect()
    }

    fn extension_libs(&self, project: &Project) -> Vec<String> {
        project
            .used_extensions()
            .iter()
            .flat_map(|extension| {
                std::iter::once(&extension.name).chain(extension.supplementary_libs.iter())
            })
            .filter(|name| match &self.extensions_dir {
                Some(dir) => {
                    let found = LIBRARY_SUFFIXES
                        .iter()
                        .any(|suffix| dir.join(format!("lib{}{}", name, suffix)).exists());
                    if !found {
                        debug!("No library found for extension {}, not linked", name);
                    }
                    found
                }
                None => true,
            })
            .cloned()
            .collect()
    }

    /// Plans the compilation of what `root` needs and is not built yet.
    /// Planned tasks belong to `scene`.
    fn prerequisites(
        self: &Arc<Self>,
        project: &Project,
        compiler: &CodeCompiler,
        root: AnalysisRoot,
        scene: SceneHandle,
        mode: TargetMode,
    ) -> Result<Prerequisites> {
        let scene_name = project
            .scene(scene)
            .ok_or_else(|| Error::MissingEntity(format!("scene {:?}", scene)))?
            .name();
        let deps = DependenciesAnalyzer::new(project, root)?.analyze()?;
        let mut prerequisites = Prerequisites::default();

        for name in &deps.source_files {
            let source_file = match project.source_file_named(name) {
                Some((_, source_file)) => source_file,
                None => {
                    warn!(
                        "Source file {} used by scene {} does not exist, skipped",
                        name, scene_name
                    );
                    continue;
                }
            };
            let output = self.layout.object_file(source_file.id(), mode);
            if compiler.has_task_for_output(&output) {
                prerequisites.outstanding += 1;
            } else if staleness::source_file_needs_rebuild(project, source_file, &output) {
                prerequisites
                    .tasks
                    .push(self.source_file_task(project, source_file, output, scene, mode));
                prerequisites.outstanding += 1;
            }
        }

        for (handle, external_events) in Self::owned_external_events(project, &deps, scene_name) {
            let output = self.layout.object_file(external_events.id(), mode);
            if compiler.has_task_for_output(&output) {
                prerequisites.outstanding += 1;
            } else if staleness::external_events_need_rebuild(external_events, &output) {
                prerequisites.tasks.push(self.external_events_task(
                    project,
                    external_events,
                    handle,
                    scene,
                    mode,
                ));
                prerequisites.outstanding += 1;
            }
        }

        Ok(prerequisites)
    }

    fn source_file_task(
        self: &Arc<Self>,
        project: &Project,
        source_file: &SourceFile,
        output: PathBuf,
        scene: SceneHandle,
        mode: TargetMode,
    ) -> CompileTask {
        let mut call = CompilerCall::compile(
            project.source_file_absolute_path(source_file),
            output,
            mode,
        );
        call.optimize = mode.is_runtime();
        call.extra_header_dirs = self.header_dirs(project);

        CompileTask::new(call, format!("{} [{}]", source_file.name(), mode))
            .with_scene(scene)
            .with_post_work(SourceFilePostWork {
                pipeline: self.clone(),
                scene,
                mode,
            })
    }

    fn external_events_task(
        self: &Arc<Self>,
        project: &Project,
        external_events: &ExternalEvents,
        handle: ExternalEventsHandle,
        scene: SceneHandle,
        mode: TargetMode,
    ) -> CompileTask {
        let mut call = CompilerCall::compile(
            self.layout.events_source(external_events.id(), mode),
            self.layout.object_file(external_events.id(), mode),
            mode,
        );
        call.events_generated_code = true;
        call.optimize = mode.is_runtime();
        call.extra_header_dirs = self.header_dirs(project);

        CompileTask::new(
            call,
            format!("external events {} [{}]", external_events.name(), mode),
        )
        .with_scene(scene)
        .with_pre_work(ExternalEventsPreWork {
            pipeline: self.clone(),
            external_events: handle,
            scene,
            mode,
        })
        .with_post_work(ExternalEventsPostWork {
            pipeline: self.clone(),
            scene,
            mode,
        })
    }

    fn scene_task(
        self: &Arc<Self>,
        project: &Project,
        scene: &Scene,
        handle: SceneHandle,
        mode: TargetMode,
    ) -> CompileTask {
        let mut call = CompilerCall::compile(
            self.layout.events_source(scene.id(), mode),
            self.layout.object_file(scene.id(), mode),
            mode,
        );
        call.events_generated_code = true;
        call.optimize = mode.is_runtime();
        call.extra_header_dirs = self.header_dirs(project);

        let revision = Arc::new(AtomicU64::new(scene.change_counter()));
        CompileTask::new(call, format!("scene {} [{}]", scene.name(), mode))
            .with_scene(handle)
            .with_pre_work(ScenePreWork {
                pipeline: self.clone(),
                scene: handle,
                mode,
                revision: revision.clone(),
            })
            .with_post_work(ScenePostWork {
                pipeline: self.clone(),
                scene: handle,
                mode,
                revision,
            })
    }

    /// Link task of `scene`. `revision` is the change counter of the scene
    /// when its code was generated.
    fn link_task(
        self: &Arc<Self>,
        project: &Project,
        scene: SceneHandle,
        mode: TargetMode,
        revision: u64,
    ) -> Result<CompileTask> {
        let scene_ref = project
            .scene(scene)
            .ok_or_else(|| Error::MissingEntity(format!("scene {:?}", scene)))?;
        let deps = DependenciesAnalyzer::for_scene(project, scene)?.analyze()?;

        let mut call = CompilerCall::link(
            self.layout.object_file(scene_ref.id(), mode),
            self.layout.linked_library(scene_ref.id(), mode),
            mode,
        );
        call.extra_object_files = deps
            .source_files
            .iter()
            .filter_map(|name| project.source_file_named(name))
            .map(|(_, source_file)| self.layout.object_file(source_file.id(), mode))
            .chain(
                Self::owned_external_events(project, &deps, scene_ref.name())
                    .into_iter()
                    .map(|(_, external_events)| self.layout.object_file(external_events.id(), mode)),
            )
            .collect();
        call.extra_libs = self.extension_libs(project);

        Ok(
            CompileTask::new(call, format!("link scene {} [{}]", scene_ref.name(), mode))
                .with_scene(scene)
                .with_post_work(LinkPostWork {
                    pipeline: self.clone(),
                    scene,
                    mode,
                    revision,
                }),
        )
    }

    fn queue_link(
        self: &Arc<Self>,
        project: &Project,
        compiler: &CodeCompiler,
        scene: SceneHandle,
        mode: TargetMode,
        revision: u64,
    ) {
        let queued = self
            .link_task(project, scene, mode, revision)
            .and_then(|task| compiler.add_task(task));
        match queued {
            Ok(()) => self.set_state(scene, mode, SceneBuildState::Linking),
            Err(err) => {
                error!("Unable to link scene {:?}: {}", scene, err);
                self.fail(scene, mode, SceneBuildState::LinkFailed);
            }
        }
    }
}

struct SourceFilePostWork {
    pipeline: Arc<Pipeline>,
    scene: SceneHandle,
    mode: TargetMode,
}

impl PostWork for SourceFilePostWork {
    fn execute(&mut self, context: &TaskContext<'_>, succeeded: bool) {
        if !succeeded {
            error!("{} failed, cancelling the build of its scene", context.description);
            context.compiler.remove_pending_tasks_related_to(self.scene);
            self.pipeline
                .fail(self.scene, self.mode, SceneBuildState::CompileFailed);
        }
    }
}

struct ExternalEventsPreWork {
    pipeline: Arc<Pipeline>,
    external_events: ExternalEventsHandle,
    scene: SceneHandle,
    mode: TargetMode,
}

impl PreWork for ExternalEventsPreWork {
    fn execute(&mut self, context: &TaskContext<'_>) -> PreWorkOutcome {
        let project = self.pipeline.project.read();
        let (external_events, scene) = match (
            project.external_events(self.external_events),
            project.scene(self.scene),
        ) {
            (Some(external_events), Some(scene)) => (external_events, scene),
            _ => {
                warn!("{}: external events or scene deleted", context.description);
                return PreWorkOutcome::Failed;
            }
        };

        let owner = DependenciesAnalyzer::for_external_events(&project, self.external_events)
            .map(|analyzer| analyzer.external_events_can_be_compiled_for_a_scene());
        if !matches!(&owner, Ok(Some(name)) if name == scene.name()) {
            warn!(
                "{}: no longer used by scene {} only",
                context.description,
                scene.name()
            );
            return PreWorkOutcome::Failed;
        }

        let prerequisites = match self.pipeline.prerequisites(
            &project,
            context.compiler,
            AnalysisRoot::ExternalEvents(self.external_events),
            self.scene,
            self.mode,
        ) {
            Ok(prerequisites) => prerequisites,
            Err(err) => {
                error!("{}: {}", context.description, err);
                return PreWorkOutcome::Failed;
            }
        };
        if prerequisites.outstanding > 0 {
            for task in prerequisites.tasks {
                if let Err(err) = context.compiler.add_task(task) {
                    warn!("{}: {}", context.description, err);
                    return PreWorkOutcome::Failed;
                }
            }
            debug!(
                "{} waits on {} prerequisite(s)",
                context.description, prerequisites.outstanding
            );
            return PreWorkOutcome::Relaunch;
        }

        let code = self.pipeline.generator.generate(
            &project,
            CodeUnit::ExternalEvents {
                external_events,
                scene,
            },
            &external_events.events().without_useless_events(),
            &self.pipeline.generation_options(self.mode),
        );
        if let Err(err) = fs::write(&context.call.input, code) {
            error!(
                "Unable to write {}: {}",
                context.call.input.display(),
                err
            );
            return PreWorkOutcome::Failed;
        }
        PreWorkOutcome::Ready
    }
}

struct ExternalEventsPostWork {
    pipeline: Arc<Pipeline>,
    scene: SceneHandle,
    mode: TargetMode,
}

impl PostWork for ExternalEventsPostWork {
    fn execute(&mut self, context: &TaskContext<'_>, succeeded: bool) {
        if !succeeded {
            error!("{} failed, cancelling the build of its scene", context.description);
            context.compiler.remove_pending_tasks_related_to(self.scene);
            self.pipeline
                .fail(self.scene, self.mode, SceneBuildState::CompileFailed);
            return;
        }

        // the scene may already be linked against the previous object file.
        let project = self.pipeline.project.read();
        if let Some(scene) = project.scene(self.scene) {
            if !scene.needs_recompilation(self.mode) {
                self.pipeline.queue_link(
                    &project,
                    context.compiler,
                    self.scene,
                    self.mode,
                    scene.change_counter(),
                );
            }
        }
    }
}

struct ScenePreWork {
    pipeline: Arc<Pipeline>,
    scene: SceneHandle,
    mode: TargetMode,
    revision: Arc<AtomicU64>,
}

impl PreWork for ScenePreWork {
    fn execute(&mut self, context: &TaskContext<'_>) -> PreWorkOutcome {
        self.pipeline
            .set_state(self.scene, self.mode, SceneBuildState::AnalyzingDependencies);
        let project = self.pipeline.project.read();

        let prerequisites =
            match self
                .pipeline
                .prerequisites(
                    &project,
                    context.compiler,
                    AnalysisRoot::Scene(self.scene),
                    self.scene,
                    self.mode,
                )
            {
                Ok(prerequisites) => prerequisites,
                Err(err @ Error::CircularDependency(_)) => {
                    error!("{}: {}", context.description, err);
                    self.pipeline
                        .set_state(self.scene, self.mode, SceneBuildState::CycleDetected);
                    return PreWorkOutcome::Failed;
                }
                Err(err) => {
                    warn!("{}: {}", context.description, err);
                    return PreWorkOutcome::Failed;
                }
            };

        if prerequisites.outstanding > 0 {
            for task in prerequisites.tasks {
                if let Err(err) = context.compiler.add_task(task) {
                    warn!("{}: {}", context.description, err);
                    return PreWorkOutcome::Failed;
                }
            }
            debug!(
                "{} waits on {} prerequisite(s)",
                context.description, prerequisites.outstanding
            );
            self.pipeline
                .set_state(self.scene, self.mode, SceneBuildState::WaitingOnPrerequisites);
            return PreWorkOutcome::Relaunch;
        }

        let scene = match project.scene(self.scene) {
            Some(scene) => scene,
            None => return PreWorkOutcome::Failed,
        };
        let code = self.pipeline.generator.generate(
            &project,
            CodeUnit::Scene(scene),
            &scene.events().without_useless_events(),
            &self.pipeline.generation_options(self.mode),
        );
        if let Err(err) = fs::write(&context.call.input, code) {
            error!(
                "Unable to write {}: {}",
                context.call.input.display(),
                err
            );
            return PreWorkOutcome::Failed;
        }

        self.revision
            .store(scene.change_counter(), Ordering::SeqCst);
        self.pipeline
            .set_state(self.scene, self.mode, SceneBuildState::Compiling);
        PreWorkOutcome::Ready
    }
}

struct ScenePostWork {
    pipeline: Arc<Pipeline>,
    scene: SceneHandle,
    mode: TargetMode,
    revision: Arc<AtomicU64>,
}

impl PostWork for ScenePostWork {
    fn execute(&mut self, context: &TaskContext<'_>, succeeded: bool) {
        if !succeeded {
            context.compiler.remove_pending_tasks_related_to(self.scene);
            self.pipeline
                .fail(self.scene, self.mode, SceneBuildState::CompileFailed);
            return;
        }

        let project = self.pipeline.project.read();
        self.pipeline.queue_link(
            &project,
            context.compiler,
            self.scene,
            self.mode,
            self.revision.load(Ordering::SeqCst),
        );
    }
}

struct LinkPostWork {
    pipeline: Arc<Pipeline>,
    scene: SceneHandle,
    mode: TargetMode,
    revision: u64,
}

impl PostWork for LinkPostWork {
    fn execute(&mut self, context: &TaskContext<'_>, succeeded: bool) {
        let output = &context.call.output;
        if !succeeded || !output.exists() {
            if succeeded {
                error!("{}: {} was not produced", context.description, output.display());
            }
            context.compiler.remove_pending_tasks_related_to(self.scene);
            self.pipeline
                .fail(self.scene, self.mode, SceneBuildState::LinkFailed);
            return;
        }

        let mut project = self.pipeline.project.write();
        match project.scene_mut(self.scene) {
            Some(scene) => {
                if scene.change_counter() == self.revision {
                    scene.set_compiled(self.mode, output.clone());
                } else {
                    info!(
                        "Scene {} changed while being built, it still needs to be recompiled",
                        scene.name()
                    );
                    scene.set_linked_artifact(self.mode, output.clone());
                }
                info!("Scene {} linked into {}", scene.name(), output.display());
                self.pipeline
                    .set_state(self.scene, self.mode, SceneBuildState::Linked);
            }
            None => warn!("{}: scene deleted", context.description),
        }
    }
}

/// Builds the scenes of a project.
///
/// Create it with [`SceneBuildOptions::create`].
pub struct SceneBuild {
    pipeline: Arc<Pipeline>,
    compiler: CodeCompiler,
}

impl SceneBuild {
    pub(crate) fn new(
        options: SceneBuildOptions,
        project: Arc<RwLock<Project>>,
        toolchain: Arc<dyn Toolchain>,
        generator: Arc<dyn CodeGenerator>,
    ) -> Result<Self> {
        let compiler = CodeCompiler::new(toolchain, &options)?;
        let pipeline = Arc::new(Pipeline {
            project,
            generator,
            layout: ArtifactLayout::new(&options.output_dir),
            extensions_dir: options.extensions_dir,
            header_dirs: options.header_dirs,
            profiling: options.profiling,
            states: Mutex::default(),
        });
        Ok(Self { pipeline, compiler })
    }

    pub fn project(&self) -> &Arc<RwLock<Project>> {
        &self.pipeline.project
    }

    pub fn compiler(&self) -> &CodeCompiler {
        &self.compiler
    }

    pub fn layout(&self) -> &ArtifactLayout {
        &self.pipeline.layout
    }

    /// Queues the compilation of `scene` and of its out of date
    /// prerequisites.
    ///
    /// Returns without waiting for the build. A circular dependency is
    /// reported right away and nothing is queued.
    pub fn request_scene_compilation(&self, scene: SceneHandle, mode: TargetMode) -> Result<()> {
        let project = self.pipeline.project.read();
        let scene_ref = project
            .scene(scene)
            .ok_or_else(|| Error::MissingEntity(format!("scene {:?}", scene)))?;
        info!(
            "Compilation of scene {} [{}] requested",
            scene_ref.name(),
            mode
        );

        let prerequisites = match self
            .pipeline
            .prerequisites(&project, &self.compiler, AnalysisRoot::Scene(scene), scene, mode)
        {
            Ok(prerequisites) => prerequisites,
            Err(err) => {
                if let Error::CircularDependency(_) = &err {
                    error!("Scene {} cannot be compiled: {}", scene_ref.name(), err);
                    self.pipeline
                        .set_state(scene, mode, SceneBuildState::CycleDetected);
                }
                return Err(err);
            }
        };

        self.pipeline
            .set_state(scene, mode, SceneBuildState::Requested);
        for task in prerequisites.tasks {
            self.compiler.add_task(task)?;
        }
        self.compiler
            .add_task(self.pipeline.scene_task(&project, scene_ref, scene, mode))
    }

    /// Queues the compilation of external events on their own, against the
    /// only scene using them. Once compiled, a scene already up to date is
    /// linked again.
    ///
    /// Returns `false` when the external events are used by no scene, by
    /// several scenes, or not at top level.
    pub fn request_external_events_compilation(
        &self,
        external_events: ExternalEventsHandle,
        mode: TargetMode,
    ) -> Result<bool> {
        let project = self.pipeline.project.read();
        let external_events_ref = project
            .external_events(external_events)
            .ok_or_else(|| Error::MissingEntity(format!("external events {:?}", external_events)))?;

        let owner = DependenciesAnalyzer::for_external_events(&project, external_events)?
            .external_events_can_be_compiled_for_a_scene();
        let scene = match owner.as_deref().and_then(|name| project.scene_named(name)) {
            Some((scene, _)) => scene,
            None => {
                info!(
                    "External events {} are not compiled on their own: not used by exactly one scene",
                    external_events_ref.name()
                );
                return Ok(false);
            }
        };

        self.compiler.add_task(self.pipeline.external_events_task(
            &project,
            external_events_ref,
            external_events,
            scene,
            mode,
        ))?;
        Ok(true)
    }

    /// State of the latest compilation requested for `scene` in `mode`.
    pub fn state(&self, scene: SceneHandle, mode: TargetMode) -> Option<SceneBuildState> {
        self.pipeline.states.lock().get(&(scene, mode)).copied()
    }

    /// Dependency graph of `root` in Graphviz DOT format.
    pub fn dependency_graph_dot(&self, root: AnalysisRoot) -> Result<String> {
        let project = self.pipeline.project.read();
        Ok(DependenciesAnalyzer::new(&project, root)?.dependency_graph_dot())
    }

    /// Waits until every queued task is done.
    pub async fn wait_idle(&self) {
        self.compiler.wait_idle().await;
    }

    pub async fn shutdown(&self) {
        self.compiler.shutdown().await;
    }
}
