//! External tools the build drives.

use std::io;

use crate::events::EventList;
use crate::project::{ExternalEvents, Project, Scene};
use crate::task::CompilerCall;
use crate::TargetMode;

/// Result of a compiler or linker invocation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ToolOutput {
    pub success: bool,
    /// Diagnostics printed by the tool.
    pub messages: String,
}

impl ToolOutput {
    pub fn success(messages: impl Into<String>) -> Self {
        Self {
            success: true,
            messages: messages.into(),
        }
    }

    pub fn failure(messages: impl Into<String>) -> Self {
        Self {
            success: false,
            messages: messages.into(),
        }
    }
}

/// Compiler and linker invoker.
///
/// Invocations are blocking and run on a dedicated thread. An `Err` means the
/// tool could not be invoked at all and is handled as a failed invocation.
pub trait Toolchain: Send + Sync {
    /// Compiles `call.input` into the object file `call.output`, using
    /// `call.extra_header_dirs` as include directories.
    fn compile(&self, call: &CompilerCall) -> io::Result<ToolOutput>;

    /// Links `call.input` and `call.extra_object_files` into the dynamic
    /// library `call.output`, along with `call.extra_libs`.
    fn link(&self, call: &CompilerCall) -> io::Result<ToolOutput>;
}

/// Unit of events turned into code.
#[derive(Clone, Copy, Debug)]
pub enum CodeUnit<'a> {
    Scene(&'a Scene),
    /// External events, compiled against the only scene using them.
    ExternalEvents {
        external_events: &'a ExternalEvents,
        scene: &'a Scene,
    },
}

impl CodeUnit<'_> {
    pub fn name(&self) -> &str {
        match self {
            CodeUnit::Scene(scene) => scene.name(),
            CodeUnit::ExternalEvents {
                external_events, ..
            } => external_events.name(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GenerationOptions {
    pub mode: TargetMode,
    /// Instruments the generated code for the profiler.
    pub profiling: bool,
}

/// Turns events into C++ code.
pub trait CodeGenerator: Send + Sync {
    /// Generates the code of `unit`. `events` are the unit's events, stripped
    /// of anything that produces no code.
    fn generate(
        &self,
        project: &Project,
        unit: CodeUnit<'_>,
        events: &EventList,
        options: &GenerationOptions,
    ) -> String;
}
