use std::borrow::Cow;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::engine::context::JobContext;
use crate::engine::promise::{Deferred, PromiseId, Returned};
use crate::engine::task::{Job, TaskSpec};
use crate::store::BlobRef;

/// Resources a task asks of the machine it runs on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub cpu_count: u32,
    pub memory_bytes: u64,
    pub disk_bytes: u64,
}

impl ResourceSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cpus(mut self, count: u32) -> Self {
        self.cpu_count = count;
        self
    }

    pub fn memory(mut self, bytes: u64) -> Self {
        self.memory_bytes = bytes;
        self
    }

    pub fn disk(mut self, bytes: u64) -> Self {
        self.disk_bytes = bytes;
        self
    }
}

/// Turns a measured input size into a [`ResourceSpec`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScalingPolicy {
    pub disk_factor: u64,
    pub memory_factor: Option<u64>,
    pub cpu_count: u32,
}

impl ScalingPolicy {
    pub fn disk(factor: u64) -> Self {
        Self {
            disk_factor: factor,
            memory_factor: None,
            cpu_count: 1,
        }
    }

    pub fn memory(mut self, factor: u64) -> Self {
        self.memory_factor = Some(factor);
        self
    }

    pub fn cpus(mut self, count: u32) -> Self {
        self.cpu_count = count;
        self
    }

    pub fn apply(&self, input_bytes: u64) -> ResourceSpec {
        ResourceSpec {
            cpu_count: self.cpu_count,
            memory_bytes: self
                .memory_factor
                .map(|factor| input_bytes.saturating_mul(factor))
                .unwrap_or_default(),
            disk_bytes: input_bytes.saturating_mul(self.disk_factor),
        }
    }
}

/// A job whose resource needs depend on the size of its inputs.
pub trait SizedJob: Job + Clone {
    /// Blobs whose combined size drives the estimate.
    fn sizing_inputs(&self) -> Vec<Deferred<BlobRef>>;

    fn scaling(&self) -> ScalingPolicy;
}

/// Runs a [`SizedJob`] in two phases.
///
/// The `Unsized` task resolves the sizing inputs, derives a [`ResourceSpec`]
/// and re-submits the same job as a single `Sized` child, forwarding its
/// result. Only the `Sized` phase runs the job body, and it never re-submits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound = "J: Serialize + DeserializeOwned")]
pub enum TwoPhase<J> {
    Unsized(J),
    Sized { job: J, spec: ResourceSpec },
}

impl<J: SizedJob> TwoPhase<J> {
    pub fn new(job: J) -> Self {
        TwoPhase::Unsized(job)
    }

    /// Moves to the `Sized` state for the given measured input. A job that is
    /// already sized stays as it is.
    pub fn transition(self, input_bytes: u64) -> Self {
        match self {
            TwoPhase::Unsized(job) => {
                let spec = job.scaling().apply(input_bytes);
                TwoPhase::Sized { job, spec }
            }
            sized => sized,
        }
    }

    pub fn job(&self) -> &J {
        match self {
            TwoPhase::Unsized(job) | TwoPhase::Sized { job, .. } => job,
        }
    }

    pub fn spec(&self) -> Option<ResourceSpec> {
        match self {
            TwoPhase::Unsized(_) => None,
            TwoPhase::Sized { spec, .. } => Some(*spec),
        }
    }
}

impl<J: SizedJob> Job for TwoPhase<J> {
    type Output = J::Output;

    fn kind() -> Cow<'static, str> {
        format!("two-phase<{}>", J::kind()).into()
    }

    fn name(&self) -> Cow<'static, str> {
        match self {
            TwoPhase::Unsized(job) => format!("{} (sizing)", job.name()).into(),
            TwoPhase::Sized { job, .. } => job.name(),
        }
    }

    fn inputs(&self) -> Vec<PromiseId> {
        let job = self.job();
        let mut inputs = job.inputs();

        if let TwoPhase::Unsized(_) = self {
            inputs.extend(job.sizing_inputs().iter().filter_map(Deferred::promise_id));
        }

        inputs
    }

    fn run(&self, ctx: &mut JobContext<'_>) -> anyhow::Result<Returned<Self::Output>> {
        match self {
            TwoPhase::Unsized(job) => {
                let mut input_bytes = 0u64;
                for blob in job.sizing_inputs() {
                    input_bytes = input_bytes.saturating_add(blob.get(ctx)?.size_bytes);
                }

                let sized = TwoPhase::Unsized(job.clone()).transition(input_bytes);
                let spec = sized.spec().unwrap_or_default();
                tracing::debug!("{} needs {spec:?} for {input_bytes} input bytes", job.name());

                let child = ctx.add_child(TaskSpec::new(sized).resources(spec))?;
                Ok(Returned::Forward(child.rv()))
            }
            TwoPhase::Sized { job, .. } => job.run(ctx),
        }
    }
}
