mod diagnostics;

use std::collections::HashMap;
use std::fs;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::mpsc::channel;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use camino::Utf8Path;
use indicatif::ProgressStyle;
use serde::Serialize;
use tracing::Level;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::core::Environment;
use crate::engine::{IdAllocator, JobContext, Spawned, Stored, TaskId, TaskState};
use crate::error::{FlowError, RunFailure, TaskFailure};
use crate::workflow::{Dispatch, Workflow};

pub use diagnostics::Diagnostics;

pub(crate) const REPORT_FILE: &str = "report.json";

#[derive(Debug, Clone)]
pub struct TaskExecution {
    /// Earliest moment the body was allowed to start, for staggered tasks.
    pub released: Option<Instant>,
    /// When the body actually started.
    pub start: Instant,
    pub duration: Duration,
}

/// Summary of one run, also written to `report.json` in the workflow
/// directory.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub root: TaskId,
    /// Bodies executed during this run.
    pub executed: usize,
    /// Tasks restored as already done from an earlier attempt.
    pub restored: usize,
    pub failures: Vec<TaskFailure>,
    pub blocked: Vec<TaskId>,
    pub tasks: Vec<TaskSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskSummary {
    pub id: TaskId,
    pub name: String,
    pub kind: String,
    pub state: TaskState,
    pub duration_ms: Option<u128>,
}

/// What a worker sends back once a body has finished.
struct Completion {
    task: TaskId,
    outcome: anyhow::Result<(Stored, Vec<Spawned>)>,
    released: Option<Instant>,
    start: Instant,
    duration: Duration,
}

/// Spaces out the starts of one batch of staggered siblings.
#[derive(Debug, Default)]
struct StaggerGate {
    last_start: Mutex<Option<Instant>>,
}

impl StaggerGate {
    /// Waits until `release` and until `spacing` has passed since the last
    /// sibling started, then returns the start of this body.
    fn pass(&self, release: Instant, spacing: Duration) -> Instant {
        sleep_until(release);

        let mut last_start = self.last_start.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(earliest) = last_start.and_then(|last| last.checked_add(spacing)) {
            sleep_until(earliest);
        }
        let start = Instant::now();
        *last_start = Some(start);
        start
    }
}

fn sleep_until(moment: Instant) {
    let now = Instant::now();
    if moment > now {
        thread::sleep(moment - now);
    }
}

/// Runs the workflow until no task is running and none can start.
///
/// The calling thread is the scheduler: it is the only one that touches the
/// task table. Bodies run on a dedicated pool and report back over a
/// channel, carrying any tasks they created. After every completion the
/// pending tasks are re-examined, since a single result can unblock
/// children, follow-ons and promise consumers at once.
pub(crate) fn run_workflow(wf: &mut Workflow) -> Result<RunReport, FlowError> {
    #[cfg(feature = "logging")]
    crate::utils::init_logging();

    // Graph edges only ever point at newer tasks, this guards the invariant.
    petgraph::algo::toposort(&wf.graph, None)
        .map_err(|cycle| FlowError::Cycle(cycle.node_id()))?;

    let run_started = Instant::now();
    let workers = wf.env.config.workers.max(1);
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers)
        .thread_name(|i| format!("chromflow-worker-{i}"))
        .build()?;

    let restored = wf
        .tasks
        .values()
        .filter(|e| e.state == TaskState::Skipped)
        .count();

    let root_span = tracing::span!(Level::INFO, "workflow", root = %wf.root);
    if let Ok(style) = crate::utils::get_style_workflow() {
        root_span.pb_set_style(&style);
    }
    root_span.pb_set_length(wf.tasks.len() as u64);
    root_span.pb_inc(restored as u64);
    root_span.pb_set_message("Running tasks...");
    let _enter = root_span.enter();

    let task_style = crate::utils::get_style_task().ok();
    let work_root = wf.dir.join("work");
    let mut failures = Vec::new();
    let mut executed = 0;
    let mut gates: HashMap<TaskId, Arc<StaggerGate>> = HashMap::new();

    pool.in_place_scope(|s| -> Result<(), FlowError> {
        let (sender, receiver) = channel::<Completion>();
        let mut running = 0usize;

        loop {
            for id in wf.promote_ready() {
                let dispatch = match wf.dispatch(id, run_started) {
                    Ok(dispatch) => dispatch,
                    Err(err) => {
                        wf.fail(id, err.into(), &mut failures)?;
                        continue;
                    }
                };

                let sender = sender.clone();
                let env = wf.env.clone();
                let ids = wf.ids.clone();
                let work_root = work_root.clone();
                let style = task_style.clone();
                let gate = dispatch
                    .release
                    .map(|_| gates.entry(dispatch.batch).or_default().clone());

                running += 1;
                s.spawn(move |_| {
                    let completion = execute(dispatch, gate, &env, &ids, &work_root, style);
                    // The scheduler only hangs up when bailing out on an error.
                    let _ = sender.send(completion);
                });
            }

            if running == 0 {
                break;
            }

            let Ok(completion) = receiver.recv() else {
                break;
            };
            running -= 1;
            executed += 1;

            wf.diagnostics.execution_times.insert(
                completion.task,
                TaskExecution {
                    released: completion.released,
                    start: completion.start,
                    duration: completion.duration,
                },
            );
            wf.complete(completion.task, completion.outcome, &mut failures)?;

            root_span.pb_set_length(wf.tasks.len() as u64);
            root_span.pb_inc(1);
        }

        Ok(())
    })?;

    let blocked: Vec<TaskId> = wf
        .tasks
        .iter()
        .filter(|(_, entry)| entry.state == TaskState::Pending)
        .map(|(id, _)| *id)
        .collect();

    for id in &blocked {
        tracing::warn!("{id} never became ready");
    }

    let report = RunReport {
        root: wf.root,
        executed,
        restored,
        failures: failures.clone(),
        blocked: blocked.clone(),
        tasks: summarize(wf),
    };
    write_report(&wf.dir.join(REPORT_FILE), &report)?;

    tracing::info!(
        "ran {executed} tasks, {} failed, {} blocked {}",
        failures.len(),
        blocked.len(),
        crate::utils::as_overhead(run_started)
    );

    if failures.is_empty() && blocked.is_empty() {
        Ok(report)
    } else {
        Err(FlowError::Failed(RunFailure { failures, blocked }))
    }
}

fn execute(
    dispatch: Dispatch,
    gate: Option<Arc<StaggerGate>>,
    env: &Environment,
    ids: &IdAllocator,
    work_root: &Utf8Path,
    style: Option<ProgressStyle>,
) -> Completion {
    let Dispatch {
        id,
        name,
        job,
        inputs,
        resources,
        has_follow_on,
        release,
        batch: _,
    } = dispatch;

    let span = tracing::span!(Level::INFO, "task", %id, name = %name);
    if let Some(style) = &style {
        span.pb_set_style(style);
    }
    span.pb_set_message(&format!("Running {name}"));
    let _enter = span.enter();

    let start = match (release, gate) {
        (Some(release), Some(gate)) => {
            let start = gate.pass(release, env.config.stagger);
            tracing::debug!("{id} started {:?} past its release", start.saturating_duration_since(release));
            start
        }
        _ => Instant::now(),
    };
    let work_dir = work_root.join(id.to_string());

    let outcome: anyhow::Result<(Stored, Vec<Spawned>)> = prepare_work_dir(&work_dir).and_then(|()| {
        // AssertUnwindSafe is fine here: a panicking body only owns its
        // context, and its spawned tasks are thrown away with it.
        catch_unwind(AssertUnwindSafe(|| -> anyhow::Result<(Stored, Vec<Spawned>)> {
            let mut ctx = JobContext::new(
                env,
                id,
                resources,
                has_follow_on,
                &inputs,
                &work_dir,
                ids,
                span.clone(),
            );
            let stored = job.run_erased(&mut ctx)?;
            Ok((stored, ctx.into_spawned()))
        }))
        .unwrap_or_else(|panic| Err(anyhow::anyhow!(panic_message(panic))))
    });

    let duration = start.elapsed();

    if outcome.is_ok()
        && let Err(err) = fs::remove_dir_all(&work_dir)
    {
        tracing::warn!("couldn't clean up {work_dir}: {err}");
    }

    Completion {
        task: id,
        outcome,
        released: release,
        start,
        duration,
    }
}

/// Gives the attempt an empty scratch directory, dropping leftovers of a
/// previous attempt.
fn prepare_work_dir(dir: &Utf8Path) -> anyhow::Result<()> {
    if dir.exists() {
        fs::remove_dir_all(dir)?;
    }
    fs::create_dir_all(dir)?;
    Ok(())
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("Task panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("Task panicked: {s}")
    } else {
        String::from("Task panicked with unknown payload")
    }
}

fn summarize(wf: &Workflow) -> Vec<TaskSummary> {
    wf.tasks()
        .map(|task| TaskSummary {
            id: task.id,
            name: task.name.to_string(),
            kind: task.kind.to_string(),
            state: task.state,
            duration_ms: wf
                .diagnostics
                .execution_times
                .get(&task.id)
                .map(|t| t.duration.as_millis()),
        })
        .collect()
}

fn write_report(path: &Utf8Path, report: &RunReport) -> Result<(), FlowError> {
    let file = fs::File::create(path)?;
    serde_json::to_writer_pretty(file, report)?;
    Ok(())
}
