//! Incremental compilation of scene events.
//!
//! Scenes of a project are authored as event trees. Building a scene turns its
//! events into generated C++ code, compiles it along with everything the
//! scene depends on and links the result into a dynamic library the game
//! loads.
//!
//! # Build Process
//!
//! A build is requested per scene and per [`TargetMode`] through
//! [`SceneBuild::request_scene_compilation`]:
//!
//! - The dependencies of the scene are analyzed (see [`DependenciesAnalyzer`]):
//!   source files, external events and linked scenes, transitively. A cycle
//!   fails the request before anything is queued.
//! - Dependencies whose artifact is out of date (see [`staleness`]) are queued
//!   on the [`CodeCompiler`].
//! - The scene's own compilation task is queued last. Until its prerequisites
//!   are built it asks to be relaunched, moving to the back of the queue.
//! - A successful scene compilation queues a link task gathering every
//!   object file and extension library the scene needs. A successful link
//!   records the produced library on the scene.
//!
//! A failure cancels the remaining pending tasks of the scene.
//!
//! # Task Scheduling
//!
//! [`CodeCompiler`] owns a queue of [`CompileTask`]s drained by a pool of
//! workers. Each task may carry a [`PreWork`] hook, run before the compiler is
//! invoked, and a [`PostWork`] hook, run exactly once after. Two tasks writing
//! the same output never run at the same time.
//!
//! # Artifacts
//!
//! Artifact paths are derived from the project-assigned [`EntityId`] of the
//! compiled entity (see [`ArtifactLayout`]), making them stable across runs.
//! Edit-time and runtime builds use distinct artifacts.
//!
//! # Configuration
//!
//! [`SceneBuildOptions`] can be built in code or read from a [`Config`] loaded
//! from `scene-build.toml` files and `LGN_SCENE_BUILD_` environment variables.

// BEGIN - Legion Labs lints v0.6
// do not change or add/remove here, but one can add exceptions after this section
#![deny(unsafe_code)]
#![warn(future_incompatible, nonstandard_style, rust_2018_idioms)]
// Rustdoc lints
#![warn(
    rustdoc::broken_intra_doc_links,
    rustdoc::missing_crate_level_docs,
    rustdoc::private_intra_doc_links
)]
// Clippy pedantic lints, treat all as warnings by default, add exceptions in allow list
#![warn(clippy::pedantic)]
#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::if_not_else,
    clippy::items_after_statements,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::similar_names,
    clippy::shadow_unrelated,
    clippy::unreadable_literal,
    clippy::unseparated_literal_suffix
)]
// Clippy nursery lints, still under development
#![warn(
    clippy::debug_assert_with_mut_call,
    clippy::disallowed_method,
    clippy::disallowed_type,
    clippy::fallible_impl_from,
    clippy::imprecise_flops,
    clippy::mutex_integer,
    clippy::path_buf_push_overwrite,
    clippy::string_lit_as_bytes,
    clippy::use_self,
    clippy::useless_transmute
)]
// Clippy restriction lints, usually not considered bad, but useful in specific cases
#![warn(
    clippy::dbg_macro,
    clippy::exit,
    clippy::float_cmp_const,
    clippy::map_err_ignore,
    clippy::mem_forget,
    clippy::missing_enforced_import_renames,
    clippy::rest_pat_in_fully_bound_structs,
    clippy::string_to_string,
    clippy::todo,
    clippy::unimplemented,
    clippy::verbose_file_reads
)]
// END - Legion Labs lints v0.6
// crate-specific exceptions:
#![allow(clippy::missing_errors_doc)]

use std::fmt;
use std::io;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod analyzer;
mod compiler;
mod config;
pub mod events;
mod layout;
mod options;
pub mod project;
mod scene_build;
pub mod staleness;
mod task;
mod toolchain;

pub use analyzer::{AnalysisRoot, DependenciesAnalyzer, DependencySet};
pub use compiler::CodeCompiler;
pub use config::Config;
pub use layout::ArtifactLayout;
pub use options::SceneBuildOptions;
pub use project::{EntityId, ExternalEventsHandle, Project, SceneHandle, SourceFileHandle};
pub use scene_build::{SceneBuild, SceneBuildState};
pub use task::{CompileTask, CompilerCall, PostWork, PreWork, PreWorkOutcome, TaskContext};
pub use toolchain::{CodeGenerator, CodeUnit, GenerationOptions, ToolOutput, Toolchain};

/// Scene build error.
#[derive(Error, Debug)]
pub enum Error {
    /// The events of a compilation root link back to it.
    #[error("circular dependency: {0}")]
    CircularDependency(String),
    /// A handle or a name no longer resolves in the project.
    #[error("missing entity: {0}")]
    MissingEntity(String),
    #[error("compilation failed: {0}")]
    CompileFailed(String),
    #[error("link failed: {0}")]
    LinkFailed(String),
    /// A task asked to be relaunched more times than allowed.
    #[error("'{task}' was relaunched more than {budget} times")]
    RetryBudgetExceeded { task: String, budget: u32 },
    /// The compiler was shut down.
    #[error("the code compiler is shut down")]
    Shutdown,
    #[error("configuration error: {0}")]
    Config(#[from] Box<figment::Error>),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// A result type that can be used to indicate errors.
pub type Result<T> = std::result::Result<T, Error>;

/// Flavor of the code produced for a scene.
///
/// Both flavors use distinct artifacts and are built independently.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TargetMode {
    /// Code loaded by the editor's scene preview.
    EditTime,
    /// Code shipped with the game, without profiling instrumentation.
    Runtime,
}

impl TargetMode {
    pub fn is_runtime(self) -> bool {
        self == Self::Runtime
    }
}

impl fmt::Display for TargetMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EditTime => write!(f, "edit-time"),
            Self::Runtime => write!(f, "runtime"),
        }
    }
}
