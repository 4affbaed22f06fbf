//! Queue of compilation tasks and the workers draining it.
//!
//! Tasks are picked in queue order, skipping the ones that cannot run yet:
//! - tasks of a disabled scene,
//! - tasks writing an output another task is writing,
//! - tasks that asked to be relaunched while no other task completed since.
//!
//! A picked task leaves the queue while it runs. Its pre-work can therefore
//! enqueue prerequisites and ask for a relaunch without any other worker
//! observing the task in between.

use std::collections::{HashSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::layout::ArtifactLayout;
use crate::project::SceneHandle;
use crate::task::{CompileTask, PreWorkOutcome, TaskContext};
use crate::toolchain::Toolchain;
use crate::{Error, Result, SceneBuildOptions};

struct RunningTask {
    output: PathBuf,
    scene: Option<SceneHandle>,
    description: String,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<CompileTask>,
    running: Vec<RunningTask>,
    disabled: HashSet<SceneHandle>,
    /// Number of tasks done so far.
    completed: u64,
    shutdown: bool,
    last_task_failed: bool,
    last_task_messages: String,
}

impl QueueState {
    fn is_disabled(&self, task: &CompileTask) -> bool {
        task.scene
            .map_or(false, |scene| self.disabled.contains(&scene))
    }

    fn is_writing(&self, output: &Path) -> bool {
        self.running.iter().any(|running| running.output == output)
    }

    fn is_runnable(&self, task: &CompileTask) -> bool {
        !self.is_disabled(task)
            && !self.is_writing(&task.call.output)
            && task.relaunch_epoch.map_or(true, |epoch| {
                epoch != self.completed || self.running.is_empty()
            })
    }

    fn take_runnable(&mut self) -> Option<CompileTask> {
        let position = self.pending.iter().position(|task| self.is_runnable(task))?;
        let task = self.pending.remove(position)?;
        self.running.push(RunningTask {
            output: task.call.output.clone(),
            scene: task.scene,
            description: task.description.clone(),
        });
        Some(task)
    }

    fn release(&mut self, output: &Path) {
        if let Some(position) = self.running.iter().position(|r| r.output == output) {
            self.running.swap_remove(position);
        }
    }

    fn is_idle(&self) -> bool {
        self.running.is_empty() && self.pending.iter().all(|task| self.is_disabled(task))
    }
}

struct Inner {
    state: Mutex<QueueState>,
    work: Notify,
    idle: Notify,
    workers: Mutex<Vec<JoinHandle<()>>>,
    toolchain: Arc<dyn Toolchain>,
    layout: ArtifactLayout,
    max_relaunches: u32,
    delete_temporaries: bool,
}

/// Compilation task scheduler.
///
/// Cloning yields another handle to the same scheduler.
#[derive(Clone)]
pub struct CodeCompiler {
    inner: Arc<Inner>,
}

impl CodeCompiler {
    /// Creates the output directory and starts the workers.
    ///
    /// Must be called from within a Tokio runtime. Workers run until
    /// [`Self::shutdown`] is called.
    pub fn new(toolchain: Arc<dyn Toolchain>, options: &SceneBuildOptions) -> Result<Self> {
        fs::create_dir_all(&options.output_dir)?;

        let compiler = Self {
            inner: Arc::new(Inner {
                state: Mutex::new(QueueState::default()),
                work: Notify::new(),
                idle: Notify::new(),
                workers: Mutex::new(vec![]),
                toolchain,
                layout: ArtifactLayout::new(&options.output_dir),
                max_relaunches: options.max_relaunches,
                delete_temporaries: options.delete_temporaries,
            }),
        };

        let workers = (0..options.workers)
            .map(|_| tokio::spawn(compiler.clone().work()))
            .collect();
        *compiler.inner.workers.lock() = workers;

        info!(
            "Code compiler started with {} worker(s) in {}",
            options.workers,
            options.output_dir.display()
        );
        Ok(compiler)
    }

    pub fn output_dir(&self) -> &Path {
        self.inner.layout.output_dir()
    }

    /// Queues a task.
    ///
    /// A task equivalent to one already pending is dropped. A task equivalent
    /// to one being run is queued and runs once the running one is done.
    pub fn add_task(&self, task: CompileTask) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            if state.shutdown {
                return Err(Error::Shutdown);
            }
            if state.pending.iter().any(|pending| pending.is_same_task_as(&task)) {
                debug!("Task {} already pending, ignored", task.description);
                return Ok(());
            }
            if state.is_writing(&task.call.output) {
                debug!(
                    "Task {} is being run, queued to run after it",
                    task.description
                );
            }
            debug!("Task {} queued", task.description);
            state.pending.push_back(task);
        }
        self.inner.work.notify_waiters();
        Ok(())
    }

    /// Removes every pending task of `scene`. Running tasks are left alone.
    ///
    /// Returns the number of tasks removed.
    pub fn remove_pending_tasks_related_to(&self, scene: SceneHandle) -> usize {
        let removed = {
            let mut state = self.inner.state.lock();
            let before = state.pending.len();
            state.pending.retain(|task| task.scene != Some(scene));
            before - state.pending.len()
        };
        if removed > 0 {
            info!("Removed {} pending task(s) of scene {:?}", removed, scene);
        }
        self.inner.idle.notify_waiters();
        removed
    }

    /// Keeps the tasks of `scene` pending until
    /// [`Self::enable_tasks_related_to`] is called.
    pub fn disable_tasks_related_to(&self, scene: SceneHandle) {
        self.inner.state.lock().disabled.insert(scene);
        self.inner.idle.notify_waiters();
    }

    pub fn enable_tasks_related_to(&self, scene: SceneHandle) {
        self.inner.state.lock().disabled.remove(&scene);
        self.inner.work.notify_waiters();
    }

    /// Whether a task of `scene` is pending or running.
    pub fn has_task_related_to(&self, scene: SceneHandle) -> bool {
        let state = self.inner.state.lock();
        state.running.iter().any(|task| task.scene == Some(scene))
            || state.pending.iter().any(|task| task.scene == Some(scene))
    }

    /// Whether a task writing `output` is pending or running.
    pub fn has_task_for_output(&self, output: &Path) -> bool {
        let state = self.inner.state.lock();
        state.is_writing(output) || state.pending.iter().any(|task| task.call.output == output)
    }

    /// Descriptions of the running tasks, then of the pending ones in queue
    /// order.
    pub fn current_tasks(&self) -> Vec<String> {
        let state = self.inner.state.lock();
        state
            .running
            .iter()
            .map(|task| task.description.clone())
            .chain(state.pending.iter().map(|task| task.description.clone()))
            .collect()
    }

    /// Whether some task is running or can be run.
    pub fn compilation_in_process(&self) -> bool {
        !self.inner.state.lock().is_idle()
    }

    /// Whether the compiler or linker failed on the latest task.
    pub fn last_task_failed(&self) -> bool {
        self.inner.state.lock().last_task_failed
    }

    /// Diagnostics of the latest task.
    pub fn last_task_messages(&self) -> String {
        self.inner.state.lock().last_task_messages.clone()
    }

    /// Waits until no task is running and every pending task belongs to a
    /// disabled scene.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            let idle = self.inner.state.lock().is_idle();
            if idle {
                return;
            }
            notified.await;
        }
    }

    /// Deletes every file of the output directory.
    pub fn clear_output_directory(&self) -> Result<()> {
        for entry in fs::read_dir(self.output_dir())? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                fs::remove_file(entry.path())?;
            }
        }
        Ok(())
    }

    /// Drops the pending tasks and waits for the running ones to finish.
    pub async fn shutdown(&self) {
        let dropped = {
            let mut state = self.inner.state.lock();
            state.shutdown = true;
            state.pending.drain(..).count()
        };
        if dropped > 0 {
            warn!("Code compiler shut down with {} pending task(s)", dropped);
        }
        self.inner.work.notify_waiters();

        let workers = std::mem::take(&mut *self.inner.workers.lock());
        for worker in workers {
            if let Err(err) = worker.await {
                error!("Code compiler worker failed: {}", err);
            }
        }
        self.inner.idle.notify_waiters();
    }

    async fn work(self) {
        loop {
            let notified = self.inner.work.notified();
            let task = {
                let mut state = self.inner.state.lock();
                if state.shutdown {
                    return;
                }
                state.take_runnable()
            };

            match task {
                Some(task) => {
                    let output = task.call.output.clone();
                    let compiler = self.clone();
                    if let Err(err) = tokio::task::spawn_blocking(move || compiler.run(task)).await
                    {
                        error!("Task writing {} panicked: {}", output.display(), err);
                        self.done(&output, false, String::new());
                    }
                }
                None => notified.await,
            }
        }
    }

    fn run(&self, mut task: CompileTask) {
        let outcome = match task.pre_work.as_mut() {
            Some(pre_work) => pre_work.execute(&TaskContext {
                compiler: self,
                call: &task.call,
                scene: task.scene,
                description: &task.description,
            }),
            None => PreWorkOutcome::Ready,
        };

        match outcome {
            PreWorkOutcome::Relaunch if task.relaunches >= self.inner.max_relaunches => {
                let err = Error::RetryBudgetExceeded {
                    task: task.description.clone(),
                    budget: self.inner.max_relaunches,
                };
                error!("{}", err);
                self.finish(task, false, err.to_string());
            }
            PreWorkOutcome::Relaunch => {
                task.relaunches += 1;
                debug!(
                    "Task {} deferred ({} relaunch(es))",
                    task.description,
                    task.relaunches()
                );
                self.relaunch(task);
            }
            PreWorkOutcome::Failed => {
                warn!("Task {} aborted by its pre-work", task.description);
                self.finish(task, false, String::new());
            }
            PreWorkOutcome::Ready => {
                let start = Instant::now();
                info!("Compiling {} ...", task.description);
                let toolchain = &self.inner.toolchain;
                let output = if task.call.link {
                    toolchain.link(&task.call)
                } else {
                    toolchain.compile(&task.call)
                };
                let (succeeded, messages) = match output {
                    Ok(output) => (output.success, output.messages),
                    Err(err) => (false, format!("unable to launch the toolchain: {}", err)),
                };

                let diagnostics_file = self.inner.layout.diagnostics_file();
                if let Err(err) = fs::write(&diagnostics_file, &messages) {
                    warn!("Unable to write {}: {}", diagnostics_file.display(), err);
                }

                if succeeded
                    && self.inner.delete_temporaries
                    && task.call.events_generated_code
                    && !task.call.link
                {
                    if let Err(err) = fs::remove_file(&task.call.input) {
                        debug!("Unable to delete {}: {}", task.call.input.display(), err);
                    }
                }

                if succeeded {
                    info!(
                        "Compiling {} Ended ({}ms)",
                        task.description,
                        start.elapsed().as_millis()
                    );
                } else if task.call.link {
                    error!("{}", Error::LinkFailed(task.description.clone()));
                } else {
                    error!("{}", Error::CompileFailed(task.description.clone()));
                }
                self.finish(task, succeeded, messages);
            }
        }
    }

    fn relaunch(&self, mut task: CompileTask) {
        {
            let mut state = self.inner.state.lock();
            task.relaunch_epoch = Some(state.completed);
            state.release(&task.call.output);
            state.pending.push_back(task);
        }
        self.inner.work.notify_waiters();
    }

    fn finish(&self, mut task: CompileTask, succeeded: bool, messages: String) {
        if let Some(post_work) = task.post_work.as_mut() {
            post_work.execute(
                &TaskContext {
                    compiler: self,
                    call: &task.call,
                    scene: task.scene,
                    description: &task.description,
                },
                succeeded,
            );
        }
        self.done(&task.call.output, succeeded, messages);
    }

    fn done(&self, output: &Path, succeeded: bool, messages: String) {
        {
            let mut state = self.inner.state.lock();
            state.release(output);
            state.completed += 1;
            state.last_task_failed = !succeeded;
            state.last_task_messages = messages;
        }
        self.inner.work.notify_waiters();
        self.inner.idle.notify_waiters();
    }
}

#[cfg(test)]
#[path = "test_compiler.rs"]
mod test_compiler;
