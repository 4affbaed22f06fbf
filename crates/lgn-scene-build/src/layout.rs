use std::env::consts::DLL_EXTENSION;
use std::path::{Path, PathBuf};

use crate::project::EntityId;
use crate::TargetMode;

/// Name of the file receiving the messages of the latest compiler or linker
/// invocation.
pub const DIAGNOSTICS_FILE_NAME: &str = "LatestCompilationOutput.txt";

/// Locations of the artifacts produced for project entities.
///
/// Paths only depend on the output directory, the entity id and the target
/// mode: requesting the same artifact twice always yields the same path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArtifactLayout {
    output_dir: PathBuf,
}

impl ArtifactLayout {
    pub fn new(output_dir: impl AsRef<Path>) -> Self {
        Self {
            output_dir: output_dir.as_ref().to_owned(),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    fn artifact(&self, id: EntityId, mode: TargetMode, suffix: &str) -> PathBuf {
        let infix = if mode.is_runtime() { "Runtime" } else { "" };
        self.output_dir
            .join(format!("GD{:08x}{}{}", id.get(), infix, suffix))
    }

    /// Object file compiled from a source file or from generated code.
    pub fn object_file(&self, id: EntityId, mode: TargetMode) -> PathBuf {
        self.artifact(id, mode, "ObjectFile.o")
    }

    /// C++ code generated from the events of a scene or external events.
    pub fn events_source(&self, id: EntityId, mode: TargetMode) -> PathBuf {
        self.artifact(id, mode, "EventsSource.cpp")
    }

    /// Dynamic library linked for a scene.
    pub fn linked_library(&self, id: EntityId, mode: TargetMode) -> PathBuf {
        self.artifact(id, mode, &format!("Code.{}", DLL_EXTENSION))
    }

    pub fn diagnostics_file(&self) -> PathBuf {
        self.output_dir.join(DIAGNOSTICS_FILE_NAME)
    }
}
