mod context;
mod fanout;
mod promise;
mod registry;
mod resources;
mod runner;
mod task;

pub use context::JobContext;
pub use fanout::{Attribute, Collect, FallbackPolicy, FanOut, WorkUnit, WorkUnitTable, check_keys};
pub use promise::{Deferred, Promise, PromiseId, Returned};
pub use registry::Registry;
pub use resources::{ResourceSpec, ScalingPolicy, SizedJob, TwoPhase};
pub use runner::{Diagnostics, RunReport, TaskExecution};
pub use task::{IntoTaskSpec, Job, Link, TaskId, TaskRef, TaskSpec, TaskState};

pub(crate) use context::Spawned;
pub(crate) use promise::{Results, Stored, decode, is_resolvable, resolve_value};
pub(crate) use runner::{REPORT_FILE, run_workflow};
pub(crate) use task::{ErasedJob, IdAllocator, TaskRecord};
