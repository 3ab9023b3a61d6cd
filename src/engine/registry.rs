use std::collections::HashMap;
use std::sync::Arc;

use ciborium::Value;

use crate::engine::task::{ErasedJob, Job, TaskRecord};
use crate::error::FlowError;

type Decoder = fn(&Value) -> Result<Arc<dyn ErasedJob>, FlowError>;

/// Maps job kinds to decoders, so a restarted workflow can rebuild its tasks
/// from the checkpoint log.
#[derive(Default)]
pub struct Registry {
    decoders: HashMap<String, Decoder>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<J: Job>(&mut self) -> &mut Self {
        self.decoders.insert(J::kind().into_owned(), decode::<J>);
        self
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.decoders.contains_key(kind)
    }

    pub(crate) fn decode(&self, record: &TaskRecord) -> Result<Arc<dyn ErasedJob>, FlowError> {
        let decoder = self.decoders.get(&record.kind).ok_or_else(|| {
            FlowError::RestartInconsistency(format!(
                "task {} has kind '{}', which is not registered",
                record.id, record.kind
            ))
        })?;

        decoder(&record.args)
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<_> = self.decoders.keys().collect();
        kinds.sort();
        f.debug_struct("Registry").field("kinds", &kinds).finish()
    }
}

fn decode<J: Job>(args: &Value) -> Result<Arc<dyn ErasedJob>, FlowError> {
    let job: J = args.deserialized().map_err(FlowError::codec)?;
    Ok(Arc::new(job))
}
