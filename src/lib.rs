#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod checkpoint;
mod core;
pub mod engine;
mod error;
mod manifest;
pub mod pipeline;
mod sink;
mod store;
mod tools;
mod utils;
mod workflow;

#[cfg(test)]
mod testing;

pub use crate::core::{DEFAULT_SENTINEL_EVENT, Environment, FlowConfig};
pub use crate::engine::{
    Deferred, IntoTaskSpec, Job, JobContext, Promise, Registry, ResourceSpec, Returned, RunReport,
    SizedJob, TaskId, TaskRef, TaskSpec, TaskState, TwoPhase, WorkUnit, WorkUnitTable,
};
pub use crate::error::{FlowError, RunFailure, StoreError, TaskFailure, ToolError};
pub use crate::manifest::Manifest;
pub use crate::sink::{CheckpointTarget, DirectorySink, DurableSink};
pub use crate::store::{Access, BlobId, BlobRef, BlobStore, LocalBlobStore};
pub use crate::tools::{Invocation, ProcessRunner, ToolRunner, ensure_output};
#[cfg(feature = "logging")]
pub use crate::utils::init_logging;
pub use crate::workflow::{TaskInfo, Workflow};
