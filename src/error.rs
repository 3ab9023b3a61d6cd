use std::fmt::{self, Display};
use std::time::Duration;

use camino::Utf8PathBuf;
use serde::Serialize;
use thiserror::Error;

use crate::engine::TaskId;
use crate::store::BlobId;

/// Failure of an external executable, or of its expected output.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Empty tool invocation")]
    Empty,

    #[error("`{command}` could not be started.\n{source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },

    #[error("`{command}` couldn't be wired to its input or output.\n{source}")]
    Redirect {
        command: String,
        source: std::io::Error,
    },

    #[error("`{command}` exited with status {code}")]
    Exit { command: String, code: i32 },

    #[error("`{command}` was terminated by a signal")]
    Signal { command: String },

    #[error("`{command}` timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    #[error("`{command}` did not produce {path}")]
    MissingOutput { command: String, path: Utf8PathBuf },
}

impl ToolError {
    /// Exit status reported by the tool, when it exited on its own.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            ToolError::Exit { code, .. } => Some(*code),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Blob {0} is not in the store")]
    NotFound(BlobId),

    #[error("'{0}' is not a valid blob id")]
    InvalidId(BlobId),

    #[error("No durable sink is configured, cannot checkpoint {0}")]
    NoSink(String),

    #[error("Couldn't access blob storage.\n{0}")]
    FileSystem(#[from] std::io::Error),

    #[error("Couldn't convert path to UTF-8.\n{0}")]
    PathFormat(#[from] camino::FromPathBufError),
}

#[derive(Debug, Error)]
pub enum FlowError {
    #[error(transparent)]
    ToolInvocation(#[from] ToolError),

    #[error("Promise on task {producer} (slot {slot:?}) dereferenced before its producer succeeded")]
    UnresolvedPromise { producer: TaskId, slot: Option<u32> },

    #[error("Key '{key}' is missing from the output of {stage}")]
    MissingKey { stage: String, key: String },

    #[error("Key '{key}' was produced twice by {stage}")]
    DuplicateKey { stage: String, key: String },

    #[error("Task {task} has no resource spec yet")]
    ResourceMisestimation { task: TaskId },

    #[error("Checkpoint log is inconsistent with the task graph: {0}")]
    RestartInconsistency(String),

    #[error("Workflow directory {0} already holds a checkpoint log, restart it instead")]
    AlreadyStarted(Utf8PathBuf),

    #[error("Cycle detected in task graph at task {0}")]
    Cycle(TaskId),

    #[error("Task {task} cannot attach work under {parent}, which it did not create")]
    ForeignParent { task: TaskId, parent: TaskId },

    #[error("Task {0} has already started, its children are fixed")]
    ParentStarted(TaskId),

    #[error("Task {0} already has a follow-on")]
    DuplicateFollowOn(TaskId),

    #[error("Stagger delay of task {task} (slot {slot}) is out of range")]
    StaggerOutOfRange { task: TaskId, slot: u32 },

    #[error("Task {0} is not part of the workflow")]
    UnknownTask(TaskId),

    #[error("Task {0} is already part of the workflow")]
    DuplicateTask(TaskId),

    #[error("Line {line}: {message}")]
    Parse { line: usize, message: String },

    #[error("Couldn't encode or decode a task value.\n{0}")]
    Codec(String),

    #[error("Couldn't start the worker pool.\n{0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Failed(RunFailure),
}

impl FlowError {
    pub(crate) fn codec(err: impl Display) -> Self {
        FlowError::Codec(err.to_string())
    }
}

/// A task that ended in `Failed`, with enough context to diagnose it.
#[derive(Debug, Clone, Serialize)]
pub struct TaskFailure {
    pub task: TaskId,
    pub name: String,
    pub message: String,
    /// Exit status of the external tool that caused the failure, if any.
    pub exit_code: Option<i32>,
}

impl TaskFailure {
    pub(crate) fn from_error(task: TaskId, name: &str, err: &anyhow::Error) -> Self {
        let exit_code = err.chain().find_map(|cause| {
            if let Some(tool) = cause.downcast_ref::<ToolError>() {
                return tool.exit_code();
            }
            match cause.downcast_ref::<FlowError>() {
                Some(FlowError::ToolInvocation(tool)) => tool.exit_code(),
                _ => None,
            }
        });

        Self {
            task,
            name: name.to_string(),
            message: format!("{err:#}"),
            exit_code,
        }
    }
}

/// Outcome of a run that could not complete every task.
#[derive(Debug, Clone, Serialize)]
pub struct RunFailure {
    pub failures: Vec<TaskFailure>,
    /// Tasks left `Pending` because something they wait on never succeeded.
    pub blocked: Vec<TaskId>,
}

impl Display for RunFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} task(s) failed, {} blocked",
            self.failures.len(),
            self.blocked.len()
        )?;

        for failure in &self.failures {
            write!(f, "\n - {} ({}): {}", failure.task, failure.name, failure.message)?;
            if let Some(code) = failure.exit_code {
                write!(f, " [exit {code}]")?;
            }
        }

        Ok(())
    }
}
