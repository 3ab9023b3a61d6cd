use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::{self, Display};
use std::fs;
use std::sync::Arc;
use std::time::Instant;

use camino::{Utf8Path, Utf8PathBuf};
use ciborium::Value;
use petgraph::graphmap::DiGraphMap;
use serde::de::DeserializeOwned;

use crate::checkpoint::{CheckpointLog, LOG_FILE, LogEntry};
use crate::core::Environment;
use crate::engine::{
    Diagnostics, ErasedJob, IdAllocator, IntoTaskSpec, Job, Link, Promise, PromiseId, Registry,
    ResourceSpec, Results, RunReport, Spawned, Stored, TaskId, TaskRecord, TaskRef, TaskState,
    decode, is_resolvable, resolve_value,
};
use crate::error::{FlowError, TaskFailure};
use crate::store::blobs_in;

/// Why one task waits on another.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Edge {
    Child,
    FollowOn,
    Data,
}

pub(crate) struct TaskEntry {
    pub record: TaskRecord,
    pub job: Arc<dyn ErasedJob>,
    pub state: TaskState,
    pub result: Option<Stored>,
    pub children: Vec<TaskId>,
    pub follow_on: Option<TaskId>,
    /// When the task joined the graph during a run, the origin of its stagger.
    pub anchor: Option<Instant>,
}

/// Everything the scheduler hands to a worker to run one task.
pub(crate) struct Dispatch {
    pub id: TaskId,
    pub name: String,
    pub job: Arc<dyn ErasedJob>,
    pub inputs: HashMap<PromiseId, Value>,
    pub resources: Option<ResourceSpec>,
    pub has_follow_on: bool,
    pub release: Option<Instant>,
    /// Staggered siblings share the task they hang off.
    pub batch: TaskId,
}

/// Read-only view of one task.
#[derive(Debug, Clone)]
pub struct TaskInfo<'a> {
    pub id: TaskId,
    pub name: &'a str,
    pub kind: &'a str,
    pub state: TaskState,
    pub link: Link,
    pub resources: Option<ResourceSpec>,
    pub stagger: Option<u32>,
    pub children: &'a [TaskId],
    pub follow_on: Option<TaskId>,
}

/// A dynamic job graph rooted at a single task, persisted in a directory.
///
/// The directory holds the checkpoint log, the run report and per-task
/// scratch space. Only the scheduler thread mutates the graph: bodies
/// running on workers hand their new tasks back when they finish.
pub struct Workflow {
    pub(crate) dir: Utf8PathBuf,
    pub(crate) env: Environment,
    pub(crate) root: TaskId,
    pub(crate) tasks: BTreeMap<TaskId, TaskEntry>,
    pub(crate) graph: DiGraphMap<TaskId, Edge>,
    pub(crate) log: CheckpointLog,
    pub(crate) ids: Arc<IdAllocator>,
    pub(crate) diagnostics: Diagnostics,
}

impl Workflow {
    /// Starts a new workflow in `dir` with `root` as its only task.
    pub fn create<S: IntoTaskSpec>(
        dir: impl AsRef<Utf8Path>,
        env: Environment,
        root: S,
    ) -> Result<(Self, TaskRef<<S::Job as Job>::Output>), FlowError> {
        let dir = dir.as_ref().to_owned();
        fs::create_dir_all(&dir)?;

        let mut log = CheckpointLog::create(&dir.join(LOG_FILE))?;
        let ids = Arc::new(IdAllocator::starting_at(0));
        let id = ids.next();

        let (record, job) = root.into_spec().erase(id, Link::Root)?;
        log.append(&LogEntry::Start {
            root: record.clone(),
        })?;

        let mut workflow = Self {
            dir,
            env,
            root: id,
            tasks: BTreeMap::new(),
            graph: DiGraphMap::new(),
            log,
            ids,
            diagnostics: Diagnostics::default(),
        };
        workflow.integrate(record, job, None)?;

        tracing::info!("created workflow in {}", workflow.dir);
        Ok((workflow, TaskRef::new(id)))
    }

    /// Rebuilds a workflow from the checkpoint log in `dir`.
    ///
    /// Tasks that succeeded before come back as `Skipped` with their results,
    /// together with every task they created. Failed and interrupted tasks
    /// come back `Pending` and run again from scratch.
    pub fn restart(
        dir: impl AsRef<Utf8Path>,
        env: Environment,
        registry: &Registry,
    ) -> Result<Self, FlowError> {
        let dir = dir.as_ref().to_owned();
        let path = dir.join(LOG_FILE);
        let (entries, valid_len) = CheckpointLog::replay(&path)?;

        let mut entries = entries.into_iter();
        let Some(LogEntry::Start { root }) = entries.next() else {
            return Err(FlowError::RestartInconsistency(
                "log does not begin with a start record".into(),
            ));
        };

        let root_id = root.id;
        let mut workflow = Self {
            dir,
            env,
            root: root_id,
            tasks: BTreeMap::new(),
            graph: DiGraphMap::new(),
            log: CheckpointLog::reopen(&path, valid_len)?,
            ids: Arc::new(IdAllocator::starting_at(0)),
            diagnostics: Diagnostics::default(),
        };
        workflow.restore(root, registry)?;

        for entry in entries {
            match entry {
                LogEntry::Start { .. } => {
                    return Err(FlowError::RestartInconsistency(
                        "second start record".into(),
                    ));
                }
                LogEntry::Attach { record } => workflow.restore(record, registry)?,
                LogEntry::Checkpoint {
                    task,
                    state,
                    result,
                    spawned,
                } => {
                    let entry = workflow.tasks.get_mut(&task).ok_or_else(|| {
                        FlowError::RestartInconsistency(format!(
                            "checkpoint for {task}, which is not in the graph"
                        ))
                    })?;

                    match (state, result) {
                        (TaskState::Succeeded, Some(result)) if !entry.state.is_done() => {
                            entry.state = TaskState::Skipped;
                            entry.result = Some(result);
                            for record in spawned {
                                workflow.restore(record, registry)?;
                            }
                        }
                        (TaskState::Failed, _) if !entry.state.is_done() => {
                            entry.state = TaskState::Pending;
                        }
                        (state, _) => {
                            return Err(FlowError::RestartInconsistency(format!(
                                "unexpected {state:?} checkpoint for {task} in state {:?}",
                                entry.state
                            )));
                        }
                    }
                }
            }
        }

        workflow.check_restored_blobs()?;

        let next = workflow.tasks.keys().last().map_or(0, |id| id.get() + 1);
        workflow.ids = Arc::new(IdAllocator::starting_at(next));

        let restored = workflow
            .tasks
            .values()
            .filter(|e| e.state == TaskState::Skipped)
            .count();
        tracing::info!(
            "restarted workflow in {}: {restored} of {} tasks already done",
            workflow.dir,
            workflow.tasks.len()
        );

        Ok(workflow)
    }

    /// Fails if a restored result names a blob the store no longer holds.
    fn check_restored_blobs(&self) -> Result<(), FlowError> {
        for (id, entry) in &self.tasks {
            let Some(Stored::Value(value)) = &entry.result else {
                continue;
            };

            if let Some(blob) = blobs_in(value)
                .into_iter()
                .find(|blob| !self.env.store.contains(blob))
            {
                return Err(FlowError::RestartInconsistency(format!(
                    "result of {id} names blob {}, which is no longer in the store",
                    blob.id
                )));
            }
        }

        Ok(())
    }

    fn restore(&mut self, record: TaskRecord, registry: &Registry) -> Result<(), FlowError> {
        let job = registry.decode(&record)?;
        let id = record.id;

        self.integrate(record, job, None).map_err(|err| match err {
            FlowError::RestartInconsistency(_) => err,
            other => FlowError::RestartInconsistency(format!("cannot restore {id}: {other}")),
        })
    }

    /// Attaches a child to a task that has not started yet.
    pub fn add_child<S: IntoTaskSpec>(
        &mut self,
        parent: TaskId,
        spec: S,
    ) -> Result<TaskRef<<S::Job as Job>::Output>, FlowError> {
        self.attach(Link::Child(parent), spec)
    }

    /// Attaches the follow-on of a task that has not started yet.
    pub fn add_follow_on<S: IntoTaskSpec>(
        &mut self,
        parent: TaskId,
        spec: S,
    ) -> Result<TaskRef<<S::Job as Job>::Output>, FlowError> {
        self.attach(Link::FollowOn(parent), spec)
    }

    fn attach<S: IntoTaskSpec>(
        &mut self,
        link: Link,
        spec: S,
    ) -> Result<TaskRef<<S::Job as Job>::Output>, FlowError> {
        if let Link::Child(parent) | Link::FollowOn(parent) = link {
            let entry = self.entry(parent)?;
            if entry.state != TaskState::Pending {
                return Err(FlowError::ParentStarted(parent));
            }
        }

        let id = self.ids.next();
        let (record, job) = spec.into_spec().erase(id, link)?;
        self.check_record(&record, &HashSet::new())?;

        self.log.append(&LogEntry::Attach {
            record: record.clone(),
        })?;
        self.integrate(record, job, None)?;

        Ok(TaskRef::new(id))
    }

    /// Runs every task that can run, until nothing is left to do.
    ///
    /// Independent branches keep going when a task fails. The run only
    /// succeeds if every task in the graph ends up done.
    pub fn run(&mut self) -> Result<RunReport, FlowError> {
        crate::engine::run_workflow(self)
    }

    /// The value behind a promise, once its producer chain has succeeded.
    pub fn resolve<T: DeserializeOwned>(&self, promise: &Promise<T>) -> Result<T, FlowError> {
        decode(&resolve_value(self, promise.id())?)
    }

    pub fn root(&self) -> TaskId {
        self.root
    }

    /// The root's return value. The type is not checked until resolution.
    pub fn root_promise<T>(&self) -> Promise<T> {
        TaskRef::new(self.root).rv()
    }

    pub fn dir(&self) -> &Utf8Path {
        &self.dir
    }

    pub fn env(&self) -> &Environment {
        &self.env
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    pub fn state(&self, id: TaskId) -> Option<TaskState> {
        self.tasks.get(&id).map(|e| e.state)
    }

    pub fn task(&self, id: TaskId) -> Option<TaskInfo<'_>> {
        self.tasks.get(&id).map(|entry| TaskInfo {
            id,
            name: &entry.record.name,
            kind: &entry.record.kind,
            state: entry.state,
            link: entry.record.link,
            resources: entry.record.resources,
            stagger: entry.record.stagger,
            children: &entry.children,
            follow_on: entry.follow_on,
        })
    }

    /// All tasks in creation order.
    pub fn tasks(&self) -> impl Iterator<Item = TaskInfo<'_>> {
        self.tasks.keys().filter_map(|id| self.task(*id))
    }

    fn entry(&self, id: TaskId) -> Result<&TaskEntry, FlowError> {
        self.tasks.get(&id).ok_or(FlowError::UnknownTask(id))
    }

    fn entry_mut(&mut self, id: TaskId) -> Result<&mut TaskEntry, FlowError> {
        self.tasks.get_mut(&id).ok_or(FlowError::UnknownTask(id))
    }

    /// Checks that `record` can join the graph. `batch` holds ids created
    /// earlier by the same body, which are about to join too.
    fn check_record(&self, record: &TaskRecord, batch: &HashSet<TaskId>) -> Result<(), FlowError> {
        let known = |id: TaskId| self.tasks.contains_key(&id) || batch.contains(&id);

        if known(record.id) {
            return Err(FlowError::DuplicateTask(record.id));
        }

        match record.link {
            Link::Root => {}
            Link::Child(parent) if !known(parent) => return Err(FlowError::UnknownTask(parent)),
            Link::FollowOn(parent) if !known(parent) => return Err(FlowError::UnknownTask(parent)),
            Link::FollowOn(parent) => {
                if let Some(existing) = self.tasks.get(&parent)
                    && existing.follow_on.is_some()
                {
                    return Err(FlowError::DuplicateFollowOn(parent));
                }
            }
            Link::Child(_) => {}
        }

        match record.inputs.iter().find(|input| !known(input.producer)) {
            Some(input) => Err(FlowError::UnknownTask(input.producer)),
            None => Ok(()),
        }
    }

    fn check_batch(&self, spawned: &[Spawned]) -> Result<(), FlowError> {
        let mut batch = HashSet::new();
        for Spawned { record, .. } in spawned {
            self.check_record(record, &batch)?;
            batch.insert(record.id);
        }
        Ok(())
    }

    pub(crate) fn integrate(
        &mut self,
        record: TaskRecord,
        job: Arc<dyn ErasedJob>,
        anchor: Option<Instant>,
    ) -> Result<(), FlowError> {
        self.check_record(&record, &HashSet::new())?;
        let id = record.id;

        self.graph.add_node(id);
        match record.link {
            Link::Root => {}
            Link::Child(parent) => {
                self.entry_mut(parent)?.children.push(id);
                self.graph.add_edge(parent, id, Edge::Child);
            }
            Link::FollowOn(parent) => {
                self.entry_mut(parent)?.follow_on = Some(id);
                self.graph.add_edge(parent, id, Edge::FollowOn);
            }
        }
        for input in &record.inputs {
            if !self.graph.contains_edge(input.producer, id) {
                self.graph.add_edge(input.producer, id, Edge::Data);
            }
        }

        self.tasks.insert(
            id,
            TaskEntry {
                record,
                job,
                state: TaskState::Pending,
                result: None,
                children: Vec::new(),
                follow_on: None,
                anchor,
            },
        );

        Ok(())
    }

    /// A task is finished once it is done and so is everything it spawned,
    /// its follow-on included.
    fn is_finished(&self, id: TaskId, memo: &mut HashSet<TaskId>) -> bool {
        if memo.contains(&id) {
            return true;
        }
        let Some(entry) = self.tasks.get(&id) else {
            return false;
        };

        let finished = entry.state.is_done()
            && entry.children.iter().all(|c| self.is_finished(*c, memo))
            && entry.follow_on.is_none_or(|f| self.is_finished(f, memo));

        if finished {
            memo.insert(id);
        }
        finished
    }

    fn is_ready(&self, entry: &TaskEntry, memo: &mut HashSet<TaskId>) -> bool {
        if entry.state != TaskState::Pending {
            return false;
        }

        let gate = match entry.record.link {
            Link::Root => true,
            Link::Child(parent) => self.tasks.get(&parent).is_some_and(|p| p.state.is_done()),
            Link::FollowOn(pred) => self.tasks.get(&pred).is_some_and(|p| {
                p.state.is_done() && p.children.iter().all(|c| self.is_finished(*c, memo))
            }),
        };

        gate && entry.record.inputs.iter().all(|p| is_resolvable(self, *p))
    }

    /// Moves every pending task whose dependencies are met to `Ready`.
    pub(crate) fn promote_ready(&mut self) -> Vec<TaskId> {
        let mut memo = HashSet::new();
        let ready: Vec<TaskId> = self
            .tasks
            .iter()
            .filter(|(_, entry)| self.is_ready(entry, &mut memo))
            .map(|(id, _)| *id)
            .collect();

        for id in &ready {
            if let Some(entry) = self.tasks.get_mut(id) {
                entry.state = TaskState::Ready;
            }
        }

        ready
    }

    /// Snapshots the inputs of a ready task and marks it running.
    pub(crate) fn dispatch(&mut self, id: TaskId, run_started: Instant) -> Result<Dispatch, FlowError> {
        let this = &*self;
        let entry = this.entry(id)?;

        let mut inputs = HashMap::new();
        for input in &entry.record.inputs {
            inputs.insert(*input, resolve_value(this, *input)?);
        }

        let release = match entry.record.stagger {
            Some(slot) => {
                let anchor = entry.anchor.unwrap_or(run_started);
                let release = self
                    .env
                    .config
                    .stagger
                    .checked_mul(slot)
                    .and_then(|delay| anchor.checked_add(delay))
                    .ok_or(FlowError::StaggerOutOfRange { task: id, slot })?;
                Some(release)
            }
            None => None,
        };
        let batch = match entry.record.link {
            Link::Root => id,
            Link::Child(parent) | Link::FollowOn(parent) => parent,
        };

        let dispatch = Dispatch {
            id,
            name: entry.record.name.clone(),
            job: entry.job.clone(),
            inputs,
            resources: entry.record.resources,
            has_follow_on: entry.follow_on.is_some(),
            release,
            batch,
        };

        self.entry_mut(id)?.state = TaskState::Running;

        Ok(dispatch)
    }

    /// Records the outcome of a body. On success the result is checkpointed
    /// together with the spawned tasks, which then join the graph.
    pub(crate) fn complete(
        &mut self,
        id: TaskId,
        outcome: anyhow::Result<(Stored, Vec<Spawned>)>,
        failures: &mut Vec<TaskFailure>,
    ) -> Result<(), FlowError> {
        let (result, spawned) = match outcome {
            Ok(done) => done,
            Err(err) => return self.fail(id, err, failures),
        };

        if let Err(err) = self.check_batch(&spawned) {
            return self.fail(id, err.into(), failures);
        }

        self.log.append(&LogEntry::Checkpoint {
            task: id,
            state: TaskState::Succeeded,
            result: Some(result.clone()),
            spawned: spawned.iter().map(|s| s.record.clone()).collect(),
        })?;

        let entry = self.entry_mut(id)?;
        entry.state = TaskState::Succeeded;
        entry.result = Some(result);
        tracing::info!("{id} ({}) succeeded", entry.record.name);

        let anchor = Instant::now();
        for Spawned { record, job } in spawned {
            self.integrate(record, job, Some(anchor))?;
        }

        Ok(())
    }

    pub(crate) fn fail(
        &mut self,
        id: TaskId,
        err: anyhow::Error,
        failures: &mut Vec<TaskFailure>,
    ) -> Result<(), FlowError> {
        self.log.append(&LogEntry::Checkpoint {
            task: id,
            state: TaskState::Failed,
            result: None,
            spawned: Vec::new(),
        })?;

        let entry = self.entry_mut(id)?;
        entry.state = TaskState::Failed;
        tracing::error!("{id} ({}) failed: {err:#}", entry.record.name);

        failures.push(TaskFailure::from_error(id, &entry.record.name, &err));
        Ok(())
    }
}

impl Results for Workflow {
    fn result(&self, task: TaskId) -> Option<&Stored> {
        self.tasks
            .get(&task)
            .filter(|entry| entry.state.is_done())
            .and_then(|entry| entry.result.as_ref())
    }
}

impl Display for Workflow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.diagnostics.render_mermaid(self))
    }
}

impl fmt::Debug for Workflow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Workflow")
            .field("dir", &self.dir)
            .field("root", &self.root)
            .field("tasks", &self.tasks.len())
            .finish_non_exhaustive()
    }
}
