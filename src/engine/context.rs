use std::collections::HashMap;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use ciborium::Value;
use serde::de::DeserializeOwned;

use crate::core::{Environment, FlowConfig};
use crate::engine::promise::{Promise, PromiseId, decode};
use crate::engine::resources::ResourceSpec;
use crate::engine::task::{ErasedJob, IdAllocator, IntoTaskSpec, Job, Link, TaskId, TaskRecord, TaskRef};
use crate::error::{FlowError, StoreError};
use crate::sink::CheckpointTarget;
use crate::store::{Access, BlobRef};
use crate::tools::Invocation;

/// A task created by a running body, integrated once the body succeeds.
pub(crate) struct Spawned {
    pub record: TaskRecord,
    pub job: Arc<dyn ErasedJob>,
}

/// The view of the workflow given to a running job body.
///
/// Promises resolve against a snapshot taken when the task was dispatched.
/// New tasks are buffered here and only become part of the graph if the body
/// returns successfully.
pub struct JobContext<'a> {
    pub env: &'a Environment,
    task: TaskId,
    resources: Option<ResourceSpec>,
    has_follow_on: bool,
    inputs: &'a HashMap<PromiseId, Value>,
    work_dir: &'a Utf8Path,
    ids: &'a IdAllocator,
    spawned: Vec<Spawned>,
    pub span: tracing::Span,
}

impl<'a> JobContext<'a> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        env: &'a Environment,
        task: TaskId,
        resources: Option<ResourceSpec>,
        has_follow_on: bool,
        inputs: &'a HashMap<PromiseId, Value>,
        work_dir: &'a Utf8Path,
        ids: &'a IdAllocator,
        span: tracing::Span,
    ) -> Self {
        Self {
            env,
            task,
            resources,
            has_follow_on,
            inputs,
            work_dir,
            ids,
            spawned: Vec::new(),
            span,
        }
    }

    pub(crate) fn into_spawned(self) -> Vec<Spawned> {
        self.spawned
    }

    pub fn task_id(&self) -> TaskId {
        self.task
    }

    pub fn config(&self) -> &FlowConfig {
        &self.env.config
    }

    /// Private scratch directory for this attempt of the task.
    pub fn work_dir(&self) -> &Utf8Path {
        self.work_dir
    }

    /// The resources this task was dispatched with.
    pub fn resources(&self) -> Result<ResourceSpec, FlowError> {
        self.resources
            .ok_or(FlowError::ResourceMisestimation { task: self.task })
    }

    /// Dereferences a promise this task declared as an input.
    pub fn resolve<T: DeserializeOwned>(&self, promise: &Promise<T>) -> Result<T, FlowError> {
        let id = promise.id();
        match self.inputs.get(&id) {
            Some(value) => decode(value),
            None => Err(FlowError::UnresolvedPromise {
                producer: id.producer,
                slot: id.slot,
            }),
        }
    }

    /// Adds a child of the running task.
    pub fn add_child<S: IntoTaskSpec>(
        &mut self,
        spec: S,
    ) -> Result<TaskRef<<S::Job as Job>::Output>, FlowError> {
        self.child_of(self.task, spec)
    }

    /// Adds the follow-on of the running task, at most one.
    pub fn add_follow_on<S: IntoTaskSpec>(
        &mut self,
        spec: S,
    ) -> Result<TaskRef<<S::Job as Job>::Output>, FlowError> {
        self.follow_on_of(self.task, spec)
    }

    /// Adds a child under `parent`, which must be this task or one it created.
    pub fn child_of<S: IntoTaskSpec>(
        &mut self,
        parent: TaskId,
        spec: S,
    ) -> Result<TaskRef<<S::Job as Job>::Output>, FlowError> {
        self.check_parent(parent)?;
        self.spawn(Link::Child(parent), spec)
    }

    /// Adds the follow-on of `parent`, which must be this task or one it
    /// created.
    pub fn follow_on_of<S: IntoTaskSpec>(
        &mut self,
        parent: TaskId,
        spec: S,
    ) -> Result<TaskRef<<S::Job as Job>::Output>, FlowError> {
        self.check_parent(parent)?;

        let taken = (parent == self.task && self.has_follow_on)
            || self
                .spawned
                .iter()
                .any(|s| s.record.link == Link::FollowOn(parent));
        if taken {
            return Err(FlowError::DuplicateFollowOn(parent));
        }

        self.spawn(Link::FollowOn(parent), spec)
    }

    fn check_parent(&self, parent: TaskId) -> Result<(), FlowError> {
        if parent == self.task || self.spawned.iter().any(|s| s.record.id == parent) {
            Ok(())
        } else {
            Err(FlowError::ForeignParent {
                task: self.task,
                parent,
            })
        }
    }

    fn spawn<S: IntoTaskSpec>(
        &mut self,
        link: Link,
        spec: S,
    ) -> Result<TaskRef<<S::Job as Job>::Output>, FlowError> {
        let id = self.ids.next();
        let (record, job) = spec.into_spec().erase(id, link)?;
        tracing::debug!("{} spawned {id} ({})", self.task, record.name);

        self.spawned.push(Spawned { record, job });
        Ok(TaskRef::new(id))
    }

    /// Copies a blob into the work directory under `name`.
    pub fn read_blob(
        &self,
        blob: &BlobRef,
        name: &str,
        access: Access,
    ) -> Result<Utf8PathBuf, StoreError> {
        let path = self.work_dir.join(name);
        self.env.store.get(blob, &path, access)?;
        Ok(path)
    }

    /// Stores a file produced by this task.
    pub fn write_blob(&self, path: &Utf8Path) -> Result<BlobRef, StoreError> {
        self.env.store.put(path, Some(self.task))
    }

    /// Runs an external tool, applying the configured timeout unless the
    /// invocation sets its own.
    pub fn run_tool(&self, invocation: Invocation) -> Result<(), FlowError> {
        let invocation = match invocation.timeout {
            Some(_) => invocation,
            None => invocation.timeout(self.env.config.tool_timeout),
        };

        tracing::info!("running {}", invocation.display());
        self.env.tools.run(&invocation)?;
        Ok(())
    }

    /// Writes a file to the durable sink. Asking for a checkpoint without a
    /// sink is an error, the file would otherwise be lost.
    pub fn checkpoint(&self, local: &Utf8Path, target: &CheckpointTarget) -> Result<(), StoreError> {
        let sink = self
            .env
            .sink
            .as_ref()
            .ok_or_else(|| StoreError::NoSink(target.key.clone()))?;

        sink.write_object(local, &target.key, target.region.as_deref())?;
        tracing::debug!("checkpointed {local} to {}", target.key);
        Ok(())
    }
}
