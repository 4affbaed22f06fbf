use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use lgn_scene_build::events::{Event, EventList};
use lgn_scene_build::project::Extension;
use lgn_scene_build::{
    AnalysisRoot, CodeGenerator, CodeUnit, CompilerCall, Error, GenerationOptions, Project,
    SceneBuild, SceneBuildOptions, SceneBuildState, TargetMode, ToolOutput, Toolchain,
};
use parking_lot::{Mutex, RwLock};
use tempfile::TempDir;

type Hook = Box<dyn FnOnce() + Send>;

/// Writes every output it is asked for, except for inputs named in `failing`.
#[derive(Default)]
struct ScriptedToolchain {
    failing: HashSet<String>,
    calls: Mutex<Vec<CompilerCall>>,
    /// Run while compiling the first generated source.
    on_generated_code: Mutex<Option<Hook>>,
}

impl ScriptedToolchain {
    fn failing(names: &[&str]) -> Self {
        Self {
            failing: names.iter().map(|name| (*name).to_owned()).collect(),
            ..Self::default()
        }
    }

    fn calls(&self) -> Vec<CompilerCall> {
        self.calls.lock().clone()
    }

    fn inputs(&self) -> Vec<PathBuf> {
        self.calls().into_iter().map(|call| call.input).collect()
    }

    fn invoke(&self, call: &CompilerCall) -> io::Result<ToolOutput> {
        self.calls.lock().push(call.clone());
        if call.events_generated_code && !call.link {
            let hook = self.on_generated_code.lock().take();
            if let Some(hook) = hook {
                hook();
            }
        }
        let name = call
            .input
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        if self.failing.contains(&name) {
            return Ok(ToolOutput::failure(format!("{}:1: error: unknown type", name)));
        }
        fs::write(&call.output, "binary")?;
        Ok(ToolOutput::success(String::new()))
    }
}

impl Toolchain for ScriptedToolchain {
    fn compile(&self, call: &CompilerCall) -> io::Result<ToolOutput> {
        self.invoke(call)
    }

    fn link(&self, call: &CompilerCall) -> io::Result<ToolOutput> {
        self.invoke(call)
    }
}

#[derive(Default)]
struct RecordingGenerator {
    generated: Mutex<Vec<(String, GenerationOptions)>>,
}

impl CodeGenerator for RecordingGenerator {
    fn generate(
        &self,
        _project: &Project,
        unit: CodeUnit<'_>,
        events: &EventList,
        options: &GenerationOptions,
    ) -> String {
        self.generated
            .lock()
            .push((unit.name().to_owned(), *options));
        format!("// {} events of {}\n", events.len(), unit.name())
    }
}

struct Setup {
    work_dir: TempDir,
    project: Arc<RwLock<Project>>,
    toolchain: Arc<ScriptedToolchain>,
    generator: Arc<RecordingGenerator>,
}

impl Setup {
    fn new(toolchain: ScriptedToolchain) -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        let work_dir = tempfile::tempdir().unwrap();
        let project_dir = work_dir.path().join("project");
        fs::create_dir_all(&project_dir).unwrap();
        Self {
            project: Arc::new(RwLock::new(Project::new(&project_dir))),
            work_dir,
            toolchain: Arc::new(toolchain),
            generator: Arc::new(RecordingGenerator::default()),
        }
    }

    fn output_dir(&self) -> PathBuf {
        self.work_dir.path().join("output")
    }

    fn source_file(&self, name: &str) -> PathBuf {
        let path = self.work_dir.path().join("project").join(name);
        fs::write(&path, "void update() {}").unwrap();
        self.project.write().add_source_file(name, name);
        path
    }

    fn build_with(&self, options: SceneBuildOptions) -> SceneBuild {
        options
            .create(
                self.project.clone(),
                self.toolchain.clone(),
                self.generator.clone(),
            )
            .unwrap()
    }

    fn build(&self) -> SceneBuild {
        self.build_with(SceneBuildOptions::new(self.output_dir()))
    }
}

fn object_of(build: &SceneBuild, project: &Project, name: &str, mode: TargetMode) -> PathBuf {
    let id = project
        .scene_named(name)
        .map(|(_, scene)| scene.id())
        .or_else(|| project.external_events_named(name).map(|(_, e)| e.id()))
        .or_else(|| project.source_file_named(name).map(|(_, f)| f.id()))
        .unwrap();
    build.layout().object_file(id, mode)
}

fn events_source_of(build: &SceneBuild, project: &Project, name: &str, mode: TargetMode) -> PathBuf {
    let id = project
        .scene_named(name)
        .map(|(_, scene)| scene.id())
        .or_else(|| project.external_events_named(name).map(|(_, e)| e.id()))
        .unwrap();
    build.layout().events_source(id, mode)
}

#[tokio::test]
async fn stale_source_file_is_compiled_before_the_scene_is_linked() {
    let setup = Setup::new(ScriptedToolchain::default());
    let physics = setup.source_file("Physics.cpp");
    let main = setup.project.write().add_scene(
        "Main",
        EventList::new(vec![Event::cpp_code("Physics.cpp"), Event::comment("physics")]),
    );
    let build = setup.build();

    build
        .request_scene_compilation(main, TargetMode::EditTime)
        .unwrap();
    build.wait_idle().await;

    let project = setup.project.read();
    let main_source = events_source_of(&build, &project, "Main", TargetMode::EditTime);
    let main_object = object_of(&build, &project, "Main", TargetMode::EditTime);
    assert_eq!(
        setup.toolchain.inputs(),
        vec![physics, main_source.clone(), main_object]
    );

    let link = setup.toolchain.calls().pop().unwrap();
    assert!(link.link);
    assert_eq!(
        link.extra_object_files,
        vec![object_of(&build, &project, "Physics.cpp", TargetMode::EditTime)]
    );

    assert_eq!(
        build.state(main, TargetMode::EditTime),
        Some(SceneBuildState::Linked)
    );
    let scene = project.scene(main).unwrap();
    assert!(!scene.needs_recompilation(TargetMode::EditTime));
    assert_eq!(
        scene.compilation(TargetMode::EditTime).linked_artifact,
        Some(build.layout().linked_library(scene.id(), TargetMode::EditTime))
    );
    // the runtime flavor is untouched.
    assert!(scene.needs_recompilation(TargetMode::Runtime));

    // generated code is a temporary.
    assert!(!main_source.exists());
    assert!(!build.compiler().last_task_failed());
    drop(project);
    build.shutdown().await;
}

#[tokio::test]
async fn up_to_date_prerequisites_are_not_rebuilt() {
    let setup = Setup::new(ScriptedToolchain::default());
    setup.source_file("Physics.cpp");
    let main = setup
        .project
        .write()
        .add_scene("Main", EventList::new(vec![Event::cpp_code("Physics.cpp")]));
    let build = setup.build();

    build
        .request_scene_compilation(main, TargetMode::EditTime)
        .unwrap();
    build.wait_idle().await;
    assert_eq!(setup.toolchain.calls().len(), 3);

    build
        .request_scene_compilation(main, TargetMode::EditTime)
        .unwrap();
    build.wait_idle().await;

    let calls = setup.toolchain.calls();
    assert_eq!(calls.len(), 5);
    let project = setup.project.read();
    assert_eq!(
        calls[3].input,
        events_source_of(&build, &project, "Main", TargetMode::EditTime)
    );
    assert!(calls[4].link);
    drop(project);
    build.shutdown().await;
}

#[tokio::test]
async fn repeated_requests_are_coalesced() {
    let setup = Setup::new(ScriptedToolchain::default());
    setup.source_file("Physics.cpp");
    let main = setup
        .project
        .write()
        .add_scene("Main", EventList::new(vec![Event::cpp_code("Physics.cpp")]));
    let build = setup.build();

    // nothing runs until both requests are queued.
    build.compiler().disable_tasks_related_to(main);
    build
        .request_scene_compilation(main, TargetMode::EditTime)
        .unwrap();
    build
        .request_scene_compilation(main, TargetMode::EditTime)
        .unwrap();
    assert_eq!(build.compiler().current_tasks().len(), 2);
    build.compiler().enable_tasks_related_to(main);
    build.wait_idle().await;

    assert_eq!(setup.toolchain.calls().len(), 3);
    build.shutdown().await;
}

#[tokio::test]
async fn shared_external_events_are_not_compiled_standalone() {
    let setup = Setup::new(ScriptedToolchain::default());
    let (shared, scene_a) = {
        let mut project = setup.project.write();
        let shared = project.add_external_events("Shared", EventList::default());
        let scene_a = project.add_scene("SceneA", EventList::new(vec![Event::link("Shared")]));
        project.add_scene("SceneB", EventList::new(vec![Event::link("Shared")]));
        (shared, scene_a)
    };
    let build = setup.build();

    {
        let project = setup.project.read();
        let analyzer =
            lgn_scene_build::DependenciesAnalyzer::for_external_events(&project, shared).unwrap();
        assert_eq!(analyzer.external_events_can_be_compiled_for_a_scene(), None);
    }
    assert!(!build
        .request_external_events_compilation(shared, TargetMode::EditTime)
        .unwrap());

    build
        .request_scene_compilation(scene_a, TargetMode::EditTime)
        .unwrap();
    build.wait_idle().await;

    let project = setup.project.read();
    let shared_source = events_source_of(&build, &project, "Shared", TargetMode::EditTime);
    assert!(!setup.toolchain.inputs().contains(&shared_source));
    let link = setup.toolchain.calls().pop().unwrap();
    assert!(link.extra_object_files.is_empty());
    assert_eq!(
        build.state(scene_a, TargetMode::EditTime),
        Some(SceneBuildState::Linked)
    );
    drop(project);
    build.shutdown().await;
}

#[tokio::test]
async fn circular_dependency_queues_nothing() {
    let setup = Setup::new(ScriptedToolchain::default());
    let looping = {
        let mut project = setup.project.write();
        project.add_external_events("E1", EventList::new(vec![Event::link("Loop")]));
        project.add_scene("Loop", EventList::new(vec![Event::link("E1")]))
    };
    let build = setup.build();

    let result = build.request_scene_compilation(looping, TargetMode::Runtime);
    assert!(matches!(result, Err(Error::CircularDependency(_))));
    assert!(build.compiler().current_tasks().is_empty());
    assert_eq!(
        build.state(looping, TargetMode::Runtime),
        Some(SceneBuildState::CycleDetected)
    );

    build.wait_idle().await;
    assert!(setup.toolchain.calls().is_empty());
    assert!(setup
        .project
        .read()
        .scene(looping)
        .unwrap()
        .needs_recompilation(TargetMode::Runtime));
    build.shutdown().await;
}

#[tokio::test]
async fn failed_source_file_cancels_the_scene() {
    let setup = Setup::new(ScriptedToolchain::failing(&["Bad.cpp"]));
    let bad = setup.source_file("Bad.cpp");
    setup.source_file("Good.cpp");
    let main = setup.project.write().add_scene(
        "Main",
        EventList::new(vec![Event::cpp_code("Bad.cpp"), Event::cpp_code("Good.cpp")]),
    );
    let build = setup.build();

    build
        .request_scene_compilation(main, TargetMode::EditTime)
        .unwrap();
    build.wait_idle().await;

    assert_eq!(setup.toolchain.inputs(), vec![bad]);
    assert!(!build.compiler().has_task_related_to(main));
    assert_eq!(
        build.state(main, TargetMode::EditTime),
        Some(SceneBuildState::CompileFailed)
    );
    assert!(setup
        .project
        .read()
        .scene(main)
        .unwrap()
        .needs_recompilation(TargetMode::EditTime));
    assert!(build.compiler().last_task_failed());
    let diagnostics =
        fs::read_to_string(setup.output_dir().join("LatestCompilationOutput.txt")).unwrap();
    assert!(diagnostics.contains("Bad.cpp:1: error"));
    build.shutdown().await;
}

#[tokio::test]
async fn failed_link_keeps_the_scene_out_of_date() {
    let setup = Setup::new(ScriptedToolchain::default());
    let main = setup
        .project
        .write()
        .add_scene("Main", EventList::default());
    let main_object = {
        let project = setup.project.read();
        let id = project.scene(main).unwrap().id();
        lgn_scene_build::ArtifactLayout::new(setup.output_dir()).object_file(id, TargetMode::EditTime)
    };
    let object_name = main_object
        .file_name()
        .unwrap()
        .to_string_lossy()
        .into_owned();
    let toolchain = ScriptedToolchain::failing(&[object_name.as_str()]);
    let setup = Setup {
        toolchain: Arc::new(toolchain),
        ..setup
    };
    let build = setup.build();

    build
        .request_scene_compilation(main, TargetMode::EditTime)
        .unwrap();
    build.wait_idle().await;

    assert_eq!(setup.toolchain.calls().len(), 2);
    assert_eq!(
        build.state(main, TargetMode::EditTime),
        Some(SceneBuildState::LinkFailed)
    );
    assert!(setup
        .project
        .read()
        .scene(main)
        .unwrap()
        .needs_recompilation(TargetMode::EditTime));
    build.shutdown().await;
}

#[tokio::test]
async fn owned_external_events_are_compiled_and_linked() {
    let setup = Setup::new(ScriptedToolchain::default());
    let (hud, main) = {
        let mut project = setup.project.write();
        let hud = project.add_external_events(
            "Hud",
            EventList::new(vec![Event::comment("score"), Event::link("Missing")]),
        );
        let main = project.add_scene("Main", EventList::new(vec![Event::link("Hud")]));
        (hud, main)
    };
    let build = setup.build_with(SceneBuildOptions::new(setup.output_dir()).profiling(true));

    build
        .request_scene_compilation(main, TargetMode::Runtime)
        .unwrap();
    build.wait_idle().await;

    {
        let project = setup.project.read();
        let hud_source = events_source_of(&build, &project, "Hud", TargetMode::Runtime);
        let main_source = events_source_of(&build, &project, "Main", TargetMode::Runtime);
        let inputs = setup.toolchain.inputs();
        assert_eq!(inputs.len(), 3);
        assert_eq!(inputs[0], hud_source);
        assert_eq!(inputs[1], main_source);

        let link = setup.toolchain.calls().pop().unwrap();
        assert_eq!(
            link.extra_object_files,
            vec![object_of(&build, &project, "Hud", TargetMode::Runtime)]
        );
        assert!(!project
            .scene(main)
            .unwrap()
            .needs_recompilation(TargetMode::Runtime));
    }

    // runtime code is never instrumented.
    let generated = setup.generator.generated.lock().clone();
    assert_eq!(
        generated.iter().map(|(name, _)| name.as_str()).collect::<Vec<_>>(),
        vec!["Hud", "Main"]
    );
    assert!(generated.iter().all(|(_, options)| !options.profiling
        && options.mode == TargetMode::Runtime));

    // compiling the external events again relinks the up to date scene.
    assert!(build
        .request_external_events_compilation(hud, TargetMode::Runtime)
        .unwrap());
    build.wait_idle().await;
    let calls = setup.toolchain.calls();
    assert_eq!(calls.len(), 5);
    assert!(!calls[3].link);
    assert!(calls[4].link);
    assert_eq!(
        build.state(main, TargetMode::Runtime),
        Some(SceneBuildState::Linked)
    );
    build.shutdown().await;
}

#[tokio::test]
async fn external_events_rebuild_their_stale_source_files_first() {
    let setup = Setup::new(ScriptedToolchain::default());
    let physics = setup.source_file("Physics.cpp");
    let (hud, main) = {
        let mut project = setup.project.write();
        let hud = project.add_external_events(
            "Hud",
            EventList::new(vec![Event::cpp_code("Physics.cpp")]),
        );
        let main = project.add_scene("Main", EventList::new(vec![Event::link("Hud")]));
        (hud, main)
    };
    let build = setup.build();

    build
        .request_scene_compilation(main, TargetMode::EditTime)
        .unwrap();
    build.wait_idle().await;
    assert_eq!(setup.toolchain.calls().len(), 4);

    let (physics_object, hud_source, hud_object, main_object) = {
        let project = setup.project.read();
        (
            object_of(&build, &project, "Physics.cpp", TargetMode::EditTime),
            events_source_of(&build, &project, "Hud", TargetMode::EditTime),
            object_of(&build, &project, "Hud", TargetMode::EditTime),
            object_of(&build, &project, "Main", TargetMode::EditTime),
        )
    };
    // the object file is now older than its source.
    fs::File::options()
        .write(true)
        .open(&physics_object)
        .unwrap()
        .set_modified(SystemTime::now() - Duration::from_secs(3600))
        .unwrap();

    assert!(build
        .request_external_events_compilation(hud, TargetMode::EditTime)
        .unwrap());
    build.wait_idle().await;

    let inputs = setup.toolchain.inputs();
    assert_eq!(inputs[4..], [physics, hud_source, main_object]);
    let link = setup.toolchain.calls().pop().unwrap();
    assert!(link.link);
    assert!(link.extra_object_files.contains(&physics_object));
    assert!(link.extra_object_files.contains(&hud_object));
    assert_eq!(
        build.state(main, TargetMode::EditTime),
        Some(SceneBuildState::Linked)
    );
    build.shutdown().await;
}

#[tokio::test]
async fn scene_edited_while_building_stays_out_of_date() {
    let setup = Setup::new(ScriptedToolchain::default());
    let main = setup
        .project
        .write()
        .add_scene("Main", EventList::new(vec![Event::comment("v1")]));
    let project = setup.project.clone();
    *setup.toolchain.on_generated_code.lock() = Some(Box::new(move || {
        project
            .write()
            .set_scene_events(main, EventList::new(vec![Event::comment("v2")]));
    }));
    let build = setup.build();

    build
        .request_scene_compilation(main, TargetMode::EditTime)
        .unwrap();
    build.wait_idle().await;

    assert_eq!(setup.toolchain.calls().len(), 2);
    assert_eq!(
        build.state(main, TargetMode::EditTime),
        Some(SceneBuildState::Linked)
    );
    let project = setup.project.read();
    let scene = project.scene(main).unwrap();
    assert!(scene.needs_recompilation(TargetMode::EditTime));
    assert_eq!(
        scene.compilation(TargetMode::EditTime).linked_artifact,
        Some(build.layout().linked_library(scene.id(), TargetMode::EditTime))
    );
    drop(project);
    build.shutdown().await;
}

#[tokio::test]
async fn scene_deleted_while_queued_is_not_built() {
    let setup = Setup::new(ScriptedToolchain::default());
    let main = setup
        .project
        .write()
        .add_scene("Main", EventList::new(vec![Event::comment("score")]));
    let build = setup.build();

    build.compiler().disable_tasks_related_to(main);
    build
        .request_scene_compilation(main, TargetMode::EditTime)
        .unwrap();
    assert!(build.compiler().has_task_related_to(main));

    setup.project.write().remove_scene(main);
    build.compiler().enable_tasks_related_to(main);
    build.wait_idle().await;

    assert!(setup.toolchain.calls().is_empty());
    assert!(!build.compiler().has_task_related_to(main));
    let state = build.state(main, TargetMode::EditTime).unwrap();
    assert!(state.is_terminal());
    assert_eq!(state, SceneBuildState::CompileFailed);
    build.shutdown().await;
}

#[tokio::test]
async fn extension_libraries_are_linked_when_found() {
    let setup = Setup::new(ScriptedToolchain::default());
    let extensions_dir = setup.work_dir.path().join("extensions");
    fs::create_dir_all(&extensions_dir).unwrap();
    fs::write(extensions_dir.join("libPhysicsBehavior.a"), "").unwrap();
    fs::write(extensions_dir.join("libBox2D.so"), "").unwrap();

    let main = {
        let mut project = setup.project.write();
        project.add_extension(Extension {
            name: "PhysicsBehavior".to_owned(),
            supplementary_libs: vec!["Box2D".to_owned(), "Chipmunk".to_owned()],
        });
        project.add_extension(Extension::new("TextObject"));
        project.add_scene("Main", EventList::default())
    };
    let build = setup.build_with(
        SceneBuildOptions::new(setup.output_dir())
            .extensions_dir(&extensions_dir)
            .header_dir("/sdk/include"),
    );

    build
        .request_scene_compilation(main, TargetMode::EditTime)
        .unwrap();
    build.wait_idle().await;

    let calls = setup.toolchain.calls();
    let link = calls.last().unwrap();
    assert_eq!(link.extra_libs, vec!["PhysicsBehavior", "Box2D"]);
    assert!(calls[0]
        .extra_header_dirs
        .contains(&PathBuf::from("/sdk/include")));
    build.shutdown().await;
}

#[tokio::test]
async fn missing_source_file_is_skipped() {
    let setup = Setup::new(ScriptedToolchain::default());
    let main = setup.project.write().add_scene(
        "Main",
        EventList::new(vec![Event::cpp_code("Deleted.cpp")]),
    );
    let build = setup.build();

    build
        .request_scene_compilation(main, TargetMode::EditTime)
        .unwrap();
    build.wait_idle().await;

    assert_eq!(setup.toolchain.calls().len(), 2);
    assert_eq!(
        build.state(main, TargetMode::EditTime),
        Some(SceneBuildState::Linked)
    );
    build.shutdown().await;
}

#[tokio::test]
async fn deleted_scene_is_a_missing_entity() {
    let setup = Setup::new(ScriptedToolchain::default());
    let main = setup
        .project
        .write()
        .add_scene("Main", EventList::default());
    setup.project.write().remove_scene(main);
    let build = setup.build();

    assert!(matches!(
        build.request_scene_compilation(main, TargetMode::EditTime),
        Err(Error::MissingEntity(_))
    ));
    build.shutdown().await;
}

#[tokio::test]
async fn dependency_graph_dump() {
    let setup = Setup::new(ScriptedToolchain::default());
    let main = {
        let mut project = setup.project.write();
        project.add_external_events("Hud", EventList::default());
        project.add_scene("Main", EventList::new(vec![Event::link("Hud")]))
    };
    let build = setup.build();

    let dot = build
        .dependency_graph_dot(AnalysisRoot::Scene(main))
        .unwrap();
    assert!(dot.starts_with("digraph"));
    assert!(dot.contains("label = \"external events Hud\""));
    assert!(dot.contains("label = \"scene Main\""));
    build.shutdown().await;
}

#[test]
fn output_paths_do_not_depend_on_the_output_directory_contents() {
    let a = lgn_scene_build::ArtifactLayout::new(Path::new("out"));
    let b = lgn_scene_build::ArtifactLayout::new(Path::new("out"));
    let id = lgn_scene_build::EntityId::from(7);
    assert_eq!(
        a.linked_library(id, TargetMode::EditTime),
        b.linked_library(id, TargetMode::EditTime)
    );
}
