use std::borrow::Cow;
use std::fmt::{self, Display};
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use ciborium::Value;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::engine::context::JobContext;
use crate::engine::promise::{Promise, PromiseId, Returned, Stored};
use crate::engine::resources::ResourceSpec;
use crate::error::FlowError;

/// Stable identity of a task, unique within a workflow and across restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub(crate) u64);

impl TaskId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// Hands out fresh task ids. Shared between the scheduler and running bodies.
#[derive(Debug)]
pub(crate) struct IdAllocator(AtomicU64);

impl IdAllocator {
    pub fn starting_at(next: u64) -> Self {
        Self(AtomicU64::new(next))
    }

    pub fn next(&self) -> TaskId {
        TaskId(self.0.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskState {
    Pending,
    Ready,
    Running,
    Succeeded,
    Failed,
    /// Succeeded in an earlier attempt, restored from the checkpoint log.
    Skipped,
}

impl TaskState {
    pub fn is_done(self) -> bool {
        matches!(self, TaskState::Succeeded | TaskState::Skipped)
    }
}

/// How a task hangs off the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Link {
    Root,
    /// Starts after the parent succeeds.
    Child(TaskId),
    /// Starts after the predecessor and everything below it succeed.
    FollowOn(TaskId),
}

/// Everything needed to rebuild a task after a restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct TaskRecord {
    pub id: TaskId,
    pub link: Link,
    pub kind: String,
    pub name: String,
    pub args: Value,
    pub inputs: Vec<PromiseId>,
    pub resources: Option<ResourceSpec>,
    pub stagger: Option<u32>,
}

/// A unit of work in the job graph.
///
/// A job is plain data: its fields are the task's arguments and are persisted
/// in the checkpoint log, so a restarted workflow can rebuild it from its
/// [`kind`](Job::kind) alone. Any value another task produces must reach the
/// job as a [`Promise`] listed in [`inputs`](Job::inputs).
pub trait Job: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// The value this job produces.
    type Output: Serialize + DeserializeOwned + Send + Sync + 'static;

    /// Registry key for this job type. Must be unique per type.
    fn kind() -> Cow<'static, str>;

    fn name(&self) -> Cow<'static, str> {
        Self::kind()
    }

    /// Promises that must be resolvable before the body runs.
    fn inputs(&self) -> Vec<PromiseId> {
        Vec::new()
    }

    fn run(&self, ctx: &mut JobContext<'_>) -> anyhow::Result<Returned<Self::Output>>;
}

/// The object-safe face of [`Job`] that the scheduler holds.
pub(crate) trait ErasedJob: Send + Sync {
    fn run_erased(&self, ctx: &mut JobContext<'_>) -> anyhow::Result<Stored>;
}

// A blanket implementation to bridge the two. This is where the type erasure
// actually happens.
impl<J: Job> ErasedJob for J {
    fn run_erased(&self, ctx: &mut JobContext<'_>) -> anyhow::Result<Stored> {
        match J::run(self, ctx)? {
            Returned::Value(value) => Ok(Stored::Value(Value::serialized(&value)?)),
            Returned::Forward(promise) => Ok(Stored::Forward(promise.id())),
        }
    }
}

/// A job together with the scheduling hints for its task.
pub struct TaskSpec<J> {
    pub(crate) job: J,
    name: Option<String>,
    resources: Option<ResourceSpec>,
    stagger: Option<u32>,
}

impl<J: Job> TaskSpec<J> {
    pub fn new(job: J) -> Self {
        Self {
            job,
            name: None,
            resources: None,
            stagger: None,
        }
    }

    /// Overrides the display name derived from the job.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn resources(mut self, resources: ResourceSpec) -> Self {
        self.resources = Some(resources);
        self
    }

    /// Delays the body by `slot` times the configured stagger interval.
    pub fn stagger(mut self, slot: u32) -> Self {
        self.stagger = Some(slot);
        self
    }

    pub(crate) fn erase(
        self,
        id: TaskId,
        link: Link,
    ) -> Result<(TaskRecord, Arc<dyn ErasedJob>), FlowError> {
        let args = Value::serialized(&self.job).map_err(FlowError::codec)?;
        let name = match self.name {
            Some(name) => name,
            None => self.job.name().into_owned(),
        };

        let record = TaskRecord {
            id,
            link,
            kind: J::kind().into_owned(),
            name,
            args,
            inputs: self.job.inputs(),
            resources: self.resources,
            stagger: self.stagger,
        };

        Ok((record, Arc::new(self.job)))
    }
}

/// Anything that can be scheduled: a bare job or a configured [`TaskSpec`].
pub trait IntoTaskSpec {
    type Job: Job;

    fn into_spec(self) -> TaskSpec<Self::Job>;
}

impl<J: Job> IntoTaskSpec for J {
    type Job = J;

    fn into_spec(self) -> TaskSpec<J> {
        TaskSpec::new(self)
    }
}

impl<J: Job> IntoTaskSpec for TaskSpec<J> {
    type Job = J;

    fn into_spec(self) -> TaskSpec<J> {
        self
    }
}

/// A typed reference to a task that has been added to the graph.
#[derive(PartialEq, Eq, Hash)]
pub struct TaskRef<T> {
    id: TaskId,
    _phantom: PhantomData<fn() -> T>,
}

impl<T> TaskRef<T> {
    pub(crate) fn new(id: TaskId) -> Self {
        Self {
            id,
            _phantom: PhantomData,
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    /// The task's eventual return value.
    pub fn rv(&self) -> Promise<T> {
        Promise::new(PromiseId {
            producer: self.id,
            slot: None,
        })
    }

    /// One positional element of a tuple-shaped return value.
    pub fn slot<U>(&self, index: u32) -> Promise<U> {
        Promise::new(PromiseId {
            producer: self.id,
            slot: Some(index),
        })
    }
}

impl<T> Clone for TaskRef<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for TaskRef<T> {}

impl<T> fmt::Debug for TaskRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TaskRef({})", self.id)
    }
}
