//! In-memory view of a game project as seen by the build.
//!
//! The editor owns the [`Project`] and serializes its edits with compilation
//! requests. The build only reads it, except for recording the outcome of a
//! link (see [`Scene::set_compiled`]).

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use slotmap::SlotMap;

use crate::analyzer::DependenciesAnalyzer;
use crate::events::EventList;
use crate::TargetMode;

// Compilation tasks outlive the editor's view of the project: a scene can be
// deleted while one of its tasks still waits in the queue. Tasks only hold
// these keys, and a key whose entity was removed no longer resolves.
slotmap::new_key_type!(
    /// Handle to a [`Scene`] of a [`Project`].
    pub struct SceneHandle;
    /// Handle to an [`ExternalEvents`] list of a [`Project`].
    pub struct ExternalEventsHandle;
    /// Handle to a [`SourceFile`] of a [`Project`].
    pub struct SourceFileHandle;
);

/// Project-assigned identity of an entity.
///
/// Unlike handles it is never reused within a project and does not depend
/// on where the entity lives in memory, which makes it suitable for naming
/// build artifacts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityId(u64);

impl EntityId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl From<u64> for EntityId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// A C++ file written by the user and compiled along with the events.
#[derive(Debug)]
pub struct SourceFile {
    id: EntityId,
    name: String,
    path: PathBuf,
}

impl SourceFile {
    pub fn id(&self) -> EntityId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Path of the file, relative to the project root.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// A named, reusable event tree that scenes can link to.
#[derive(Debug)]
pub struct ExternalEvents {
    id: EntityId,
    name: String,
    events: EventList,
    change_counter: u64,
    last_change: SystemTime,
}

impl ExternalEvents {
    pub fn id(&self) -> EntityId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn events(&self) -> &EventList {
        &self.events
    }

    /// Number of edits made to the events.
    pub fn change_counter(&self) -> u64 {
        self.change_counter
    }

    /// Wall-clock time of the last edit.
    pub fn last_change(&self) -> SystemTime {
        self.last_change
    }

    /// Overrides the time of the last edit, i.e. when restoring a saved project.
    pub fn set_last_change(&mut self, time: SystemTime) {
        self.last_change = time;
    }
}

/// Outcome of the latest compilation of a scene for one [`TargetMode`].
#[derive(Debug, Clone)]
pub struct SceneCompilation {
    pub needs_recompilation: bool,
    pub linked_artifact: Option<PathBuf>,
}

impl Default for SceneCompilation {
    fn default() -> Self {
        Self {
            needs_recompilation: true,
            linked_artifact: None,
        }
    }
}

#[derive(Debug)]
pub struct Scene {
    id: EntityId,
    name: String,
    events: EventList,
    change_counter: u64,
    edit_time: SceneCompilation,
    runtime: SceneCompilation,
}

impl Scene {
    pub fn id(&self) -> EntityId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn events(&self) -> &EventList {
        &self.events
    }

    pub fn change_counter(&self) -> u64 {
        self.change_counter
    }

    pub fn compilation(&self, mode: TargetMode) -> &SceneCompilation {
        match mode {
            TargetMode::EditTime => &self.edit_time,
            TargetMode::Runtime => &self.runtime,
        }
    }

    fn compilation_mut(&mut self, mode: TargetMode) -> &mut SceneCompilation {
        match mode {
            TargetMode::EditTime => &mut self.edit_time,
            TargetMode::Runtime => &mut self.runtime,
        }
    }

    pub fn needs_recompilation(&self, mode: TargetMode) -> bool {
        self.compilation(mode).needs_recompilation
    }

    /// Flags the scene as out of date for every target mode.
    pub fn mark_changed(&mut self) {
        self.change_counter += 1;
        self.edit_time.needs_recompilation = true;
        self.runtime.needs_recompilation = true;
    }

    /// Records a successful link.
    pub fn set_compiled(&mut self, mode: TargetMode, linked_artifact: PathBuf) {
        let compilation = self.compilation_mut(mode);
        compilation.needs_recompilation = false;
        compilation.linked_artifact = Some(linked_artifact);
    }

    /// Records a link of code that is already out of date.
    pub fn set_linked_artifact(&mut self, mode: TargetMode, linked_artifact: PathBuf) {
        self.compilation_mut(mode).linked_artifact = Some(linked_artifact);
    }
}

/// A platform extension used by the project, linked into every scene.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extension {
    pub name: String,
    pub supplementary_libs: Vec<String>,
}

impl Extension {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            supplementary_libs: vec![],
        }
    }
}

#[derive(Debug)]
pub struct Project {
    root_dir: PathBuf,
    scenes: SlotMap<SceneHandle, Scene>,
    external_events: SlotMap<ExternalEventsHandle, ExternalEvents>,
    source_files: SlotMap<SourceFileHandle, SourceFile>,
    used_extensions: Vec<Extension>,
    next_id: u64,
}

impl Project {
    /// Creates an empty project rooted at `root_dir`.
    pub fn new(root_dir: impl AsRef<Path>) -> Self {
        Self {
            root_dir: root_dir.as_ref().to_owned(),
            scenes: SlotMap::with_key(),
            external_events: SlotMap::with_key(),
            source_files: SlotMap::with_key(),
            used_extensions: vec![],
            next_id: 1,
        }
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    fn allocate_id(&mut self) -> EntityId {
        let id = EntityId(self.next_id);
        self.next_id += 1;
        id
    }

    pub fn add_scene(&mut self, name: impl Into<String>, events: EventList) -> SceneHandle {
        let id = self.allocate_id();
        self.scenes.insert(Scene {
            id,
            name: name.into(),
            events,
            change_counter: 0,
            edit_time: SceneCompilation::default(),
            runtime: SceneCompilation::default(),
        })
    }

    pub fn add_external_events(
        &mut self,
        name: impl Into<String>,
        events: EventList,
    ) -> ExternalEventsHandle {
        let id = self.allocate_id();
        self.external_events.insert(ExternalEvents {
            id,
            name: name.into(),
            events,
            change_counter: 0,
            last_change: SystemTime::now(),
        })
    }

    /// Registers a source file, `path` being relative to the project root.
    pub fn add_source_file(
        &mut self,
        name: impl Into<String>,
        path: impl AsRef<Path>,
    ) -> SourceFileHandle {
        let id = self.allocate_id();
        self.source_files.insert(SourceFile {
            id,
            name: name.into(),
            path: path.as_ref().to_owned(),
        })
    }

    pub fn remove_scene(&mut self, handle: SceneHandle) -> Option<Scene> {
        self.scenes.remove(handle)
    }

    pub fn remove_external_events(&mut self, handle: ExternalEventsHandle) -> Option<ExternalEvents> {
        self.external_events.remove(handle)
    }

    pub fn remove_source_file(&mut self, handle: SourceFileHandle) -> Option<SourceFile> {
        self.source_files.remove(handle)
    }

    pub fn add_extension(&mut self, extension: Extension) {
        self.used_extensions.push(extension);
    }

    pub fn used_extensions(&self) -> &[Extension] {
        &self.used_extensions
    }

    pub fn scene(&self, handle: SceneHandle) -> Option<&Scene> {
        self.scenes.get(handle)
    }

    pub fn scene_mut(&mut self, handle: SceneHandle) -> Option<&mut Scene> {
        self.scenes.get_mut(handle)
    }

    pub fn external_events(&self, handle: ExternalEventsHandle) -> Option<&ExternalEvents> {
        self.external_events.get(handle)
    }

    /// Mutable access to an external events list. Edit its events with
    /// [`Self::set_external_events_events`] to flag dependent scenes.
    pub fn external_events_mut(
        &mut self,
        handle: ExternalEventsHandle,
    ) -> Option<&mut ExternalEvents> {
        self.external_events.get_mut(handle)
    }

    pub fn source_file(&self, handle: SourceFileHandle) -> Option<&SourceFile> {
        self.source_files.get(handle)
    }

    pub fn scenes(&self) -> impl Iterator<Item = (SceneHandle, &Scene)> {
        self.scenes.iter()
    }

    pub fn all_external_events(&self) -> impl Iterator<Item = (ExternalEventsHandle, &ExternalEvents)> {
        self.external_events.iter()
    }

    pub fn source_files(&self) -> impl Iterator<Item = (SourceFileHandle, &SourceFile)> {
        self.source_files.iter()
    }

    pub fn scene_named(&self, name: &str) -> Option<(SceneHandle, &Scene)> {
        self.scenes.iter().find(|(_, scene)| scene.name == name)
    }

    pub fn external_events_named(&self, name: &str) -> Option<(ExternalEventsHandle, &ExternalEvents)> {
        self.external_events
            .iter()
            .find(|(_, events)| events.name == name)
    }

    pub fn source_file_named(&self, name: &str) -> Option<(SourceFileHandle, &SourceFile)> {
        self.source_files.iter().find(|(_, file)| file.name == name)
    }

    /// Absolute location of a source file on disk.
    pub fn source_file_absolute_path(&self, file: &SourceFile) -> PathBuf {
        if file.path.is_absolute() {
            file.path.clone()
        } else {
            self.root_dir.join(&file.path)
        }
    }

    /// Replaces the events of a scene. The scene and every scene linking to
    /// it need to be recompiled.
    pub fn set_scene_events(&mut self, handle: SceneHandle, events: EventList) -> bool {
        let name = match self.scenes.get_mut(handle) {
            Some(scene) => {
                scene.events = events;
                scene.mark_changed();
                scene.name.clone()
            }
            None => return false,
        };
        self.mark_dependents_changed(|deps| deps.scenes.contains(&name));
        true
    }

    /// Replaces the events of an external events list. Every scene using it,
    /// directly or not, needs to be recompiled.
    pub fn set_external_events_events(
        &mut self,
        handle: ExternalEventsHandle,
        events: EventList,
    ) -> bool {
        let name = match self.external_events.get_mut(handle) {
            Some(external_events) => {
                external_events.events = events;
                external_events.change_counter += 1;
                external_events.last_change = SystemTime::now();
                external_events.name.clone()
            }
            None => return false,
        };
        self.mark_dependents_changed(|deps| deps.external_events.contains(&name));
        true
    }

    fn mark_dependents_changed(&mut self, depends: impl Fn(&crate::DependencySet) -> bool) {
        let project: &Self = self;
        let dependents: Vec<SceneHandle> = project
            .scenes()
            .filter(|(handle, _)| {
                // a cycle leaves the scene unbuildable: flag it anyway.
                DependenciesAnalyzer::for_scene(project, *handle)
                    .and_then(|analyzer| analyzer.analyze())
                    .map_or(true, |deps| depends(&deps))
            })
            .map(|(handle, _)| handle)
            .collect();

        for handle in dependents {
            if let Some(scene) = self.scenes.get_mut(handle) {
                scene.mark_changed();
            }
        }
    }
}
