use std::fmt;
use std::path::PathBuf;

use crate::compiler::CodeCompiler;
use crate::project::SceneHandle;
use crate::TargetMode;

/// Parameters of a compiler or linker invocation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompilerCall {
    pub input: PathBuf,
    pub output: PathBuf,
    /// Links `input` and `extra_object_files` instead of compiling `input`.
    pub link: bool,
    pub optimize: bool,
    pub mode: TargetMode,
    /// `input` is code generated from events, deleted after a successful
    /// compilation when temporaries are not kept.
    pub events_generated_code: bool,
    pub extra_object_files: Vec<PathBuf>,
    pub extra_libs: Vec<String>,
    pub extra_header_dirs: Vec<PathBuf>,
}

impl CompilerCall {
    pub fn compile(input: impl Into<PathBuf>, output: impl Into<PathBuf>, mode: TargetMode) -> Self {
        Self {
            input: input.into(),
            output: output.into(),
            link: false,
            optimize: false,
            mode,
            events_generated_code: false,
            extra_object_files: vec![],
            extra_libs: vec![],
            extra_header_dirs: vec![],
        }
    }

    pub fn link(input: impl Into<PathBuf>, output: impl Into<PathBuf>, mode: TargetMode) -> Self {
        Self {
            link: true,
            ..Self::compile(input, output, mode)
        }
    }
}

/// Outcome of a [`PreWork`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PreWorkOutcome {
    /// The compiler can be invoked.
    Ready,
    /// Prerequisites are not built yet: the task goes back to the end of the
    /// queue.
    Relaunch,
    /// The task cannot be run. Its [`PostWork`] is told it failed.
    Failed,
}

/// What a hook knows about the task it runs for.
pub struct TaskContext<'a> {
    pub compiler: &'a CodeCompiler,
    pub call: &'a CompilerCall,
    pub scene: Option<SceneHandle>,
    pub description: &'a str,
}

/// Hook run before the compiler is invoked, every time the task is picked.
pub trait PreWork: Send {
    fn execute(&mut self, context: &TaskContext<'_>) -> PreWorkOutcome;
}

/// Hook run exactly once, when the task is done.
pub trait PostWork: Send {
    fn execute(&mut self, context: &TaskContext<'_>, succeeded: bool);
}

/// An entry of the [`CodeCompiler`] queue.
pub struct CompileTask {
    pub call: CompilerCall,
    /// Scene whose build the task belongs to.
    pub scene: Option<SceneHandle>,
    pub description: String,
    pub(crate) pre_work: Option<Box<dyn PreWork>>,
    pub(crate) post_work: Option<Box<dyn PostWork>>,
    pub(crate) relaunches: u32,
    pub(crate) relaunch_epoch: Option<u64>,
}

impl CompileTask {
    pub fn new(call: CompilerCall, description: impl Into<String>) -> Self {
        Self {
            call,
            scene: None,
            description: description.into(),
            pre_work: None,
            post_work: None,
            relaunches: 0,
            relaunch_epoch: None,
        }
    }

    #[must_use]
    pub fn with_scene(mut self, scene: SceneHandle) -> Self {
        self.scene = Some(scene);
        self
    }

    #[must_use]
    pub fn with_pre_work(mut self, pre_work: impl PreWork + 'static) -> Self {
        self.pre_work = Some(Box::new(pre_work));
        self
    }

    #[must_use]
    pub fn with_post_work(mut self, post_work: impl PostWork + 'static) -> Self {
        self.post_work = Some(Box::new(post_work));
        self
    }

    /// Number of times the task asked to be relaunched.
    pub fn relaunches(&self) -> u32 {
        self.relaunches
    }

    /// Two tasks are the same when they produce the same output the same way.
    pub fn is_same_task_as(&self, other: &Self) -> bool {
        self.call.output == other.call.output && self.call.link == other.call.link
    }
}

impl fmt::Debug for CompileTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompileTask")
            .field("description", &self.description)
            .field("call", &self.call)
            .field("scene", &self.scene)
            .field("relaunches", &self.relaunches)
            .finish()
    }
}
