//! Scatter work over a key set, then gather the results into one table.

use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::engine::context::JobContext;
use crate::engine::promise::{Promise, PromiseId, Returned};
use crate::engine::task::{Job, TaskId, TaskSpec};
use crate::error::FlowError;
use crate::store::BlobRef;

/// Resolves the keyed results of a fan-out over `J` into one map.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct Collect<J: Job> {
    pub parts: BTreeMap<String, Promise<J::Output>>,
}

impl<J: Job> Job for Collect<J> {
    type Output = BTreeMap<String, J::Output>;

    fn kind() -> Cow<'static, str> {
        format!("collect<{}>", J::kind()).into()
    }

    fn name(&self) -> Cow<'static, str> {
        format!("collect {} parts", self.parts.len()).into()
    }

    fn inputs(&self) -> Vec<PromiseId> {
        self.parts.values().map(Promise::id).collect()
    }

    fn run(&self, ctx: &mut JobContext<'_>) -> anyhow::Result<Returned<Self::Output>> {
        let mut out = BTreeMap::new();
        for (key, promise) in &self.parts {
            out.insert(key.clone(), ctx.resolve(promise)?);
        }
        Ok(Returned::Value(out))
    }
}

/// Spawns one child per key under a parent and a [`Collect`] sibling that
/// gathers their results.
pub struct FanOut<'c, 'a> {
    ctx: &'c mut JobContext<'a>,
    parent: TaskId,
    stage: String,
    staggered: bool,
}

impl<'c, 'a> FanOut<'c, 'a> {
    /// Fans out under the running task.
    pub fn new(ctx: &'c mut JobContext<'a>, stage: impl Into<String>) -> Self {
        let parent = ctx.task_id();
        Self {
            ctx,
            parent,
            stage: stage.into(),
            staggered: false,
        }
    }

    /// Fans out under a task created by the running body.
    pub fn under(mut self, parent: TaskId) -> Self {
        self.parent = parent;
        self
    }

    /// Gives the n-th child stagger slot n.
    pub fn staggered(mut self) -> Self {
        self.staggered = true;
        self
    }

    pub fn spawn<K, J, F>(
        self,
        keys: impl IntoIterator<Item = K>,
        mut make: F,
    ) -> Result<Promise<BTreeMap<String, J::Output>>, FlowError>
    where
        K: Into<String>,
        J: Job,
        F: FnMut(&str) -> TaskSpec<J>,
    {
        let mut parts = BTreeMap::new();

        for (slot, key) in keys.into_iter().enumerate() {
            let key = key.into();
            if parts.contains_key(&key) {
                return Err(FlowError::DuplicateKey {
                    stage: self.stage,
                    key,
                });
            }

            let mut spec = make(&key);
            if self.staggered {
                spec = spec.stagger(slot as u32);
            }

            let task = self.ctx.child_of(self.parent, spec)?;
            parts.insert(key, task.rv());
        }

        tracing::debug!("{} fanned out over {} keys", self.stage, parts.len());

        let gather = TaskSpec::new(Collect::<J> { parts }).name(format!("gather {}", self.stage));
        let gather = self.ctx.child_of(self.parent, gather)?;
        Ok(gather.rv())
    }
}

/// One attribute of a [`WorkUnit`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Attribute {
    Blob(BlobRef),
    /// Per-source artifacts, e.g. one sequence slice per event.
    Nested(BTreeMap<String, BlobRef>),
}

/// Everything produced for one key of a fan-out.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkUnit {
    pub name: String,
    pub attributes: BTreeMap<String, Attribute>,
}

impl WorkUnit {
    pub fn blob(&self, attribute: &str) -> Option<&BlobRef> {
        match self.attributes.get(attribute) {
            Some(Attribute::Blob(blob)) => Some(blob),
            _ => None,
        }
    }

    pub fn nested(&self, attribute: &str) -> Option<&BTreeMap<String, BlobRef>> {
        match self.attributes.get(attribute) {
            Some(Attribute::Nested(map)) => Some(map),
            _ => None,
        }
    }
}

/// The gathered result of a fan-out, keyed by unit name.
///
/// Every merge must cover exactly the table's keys, so a unit can never be
/// silently missing or duplicated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkUnitTable {
    units: BTreeMap<String, WorkUnit>,
}

impl WorkUnitTable {
    pub fn with_keys<I, K>(keys: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        let units = keys
            .into_iter()
            .map(Into::into)
            .map(|name: String| {
                let unit = WorkUnit {
                    name: name.clone(),
                    attributes: BTreeMap::new(),
                };
                (name, unit)
            })
            .collect();

        Self { units }
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.units.keys().map(String::as_str)
    }

    pub fn get(&self, key: &str) -> Option<&WorkUnit> {
        self.units.get(key)
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &WorkUnit> {
        self.units.values()
    }

    pub fn merge_blobs(
        &mut self,
        stage: &str,
        attribute: &str,
        parts: BTreeMap<String, BlobRef>,
    ) -> Result<(), FlowError> {
        self.merge(stage, attribute, parts, Attribute::Blob)
    }

    pub fn merge_nested(
        &mut self,
        stage: &str,
        attribute: &str,
        parts: BTreeMap<String, BTreeMap<String, BlobRef>>,
    ) -> Result<(), FlowError> {
        self.merge(stage, attribute, parts, Attribute::Nested)
    }

    fn merge<V>(
        &mut self,
        stage: &str,
        attribute: &str,
        parts: BTreeMap<String, V>,
        wrap: impl Fn(V) -> Attribute,
    ) -> Result<(), FlowError> {
        check_keys(stage, self.units.keys(), parts.keys())?;

        for (key, value) in parts {
            if let Some(unit) = self.units.get_mut(&key) {
                unit.attributes.insert(attribute.to_string(), wrap(value));
            }
        }

        Ok(())
    }
}

impl IntoIterator for WorkUnitTable {
    type Item = WorkUnit;
    type IntoIter = std::collections::btree_map::IntoValues<String, WorkUnit>;

    fn into_iter(self) -> Self::IntoIter {
        self.units.into_values()
    }
}

/// Fails with [`FlowError::MissingKey`] naming the first key that appears on
/// only one side.
pub fn check_keys<'k>(
    stage: &str,
    expected: impl IntoIterator<Item = &'k String>,
    actual: impl IntoIterator<Item = &'k String>,
) -> Result<(), FlowError> {
    let expected: BTreeSet<_> = expected.into_iter().collect();
    let actual: BTreeSet<_> = actual.into_iter().collect();

    match expected.symmetric_difference(&actual).next() {
        Some(key) => Err(FlowError::MissingKey {
            stage: stage.to_string(),
            key: key.to_string(),
        }),
        None => Ok(()),
    }
}

/// Decides what stands in for a per-source artifact that was not produced.
///
/// Only the sentinel source may come up empty, in which case its original
/// input is used for the unit. Any other source without output is an error.
/// Whether other sources deserve the same fallback is an open question; until
/// it is settled they fail loudly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallbackPolicy {
    pub sentinel: String,
}

impl FallbackPolicy {
    pub fn new(sentinel: impl Into<String>) -> Self {
        Self {
            sentinel: sentinel.into(),
        }
    }

    pub fn resolve(
        &self,
        source: &str,
        key: &str,
        found: Option<BlobRef>,
        fallback: &BlobRef,
    ) -> Result<BlobRef, FlowError> {
        match found {
            Some(blob) => Ok(blob),
            None if source == self.sentinel => {
                tracing::info!("{source} has no sequence for {key}, using its full input");
                Ok(fallback.clone())
            }
            None => Err(FlowError::MissingKey {
                stage: format!("sequence split of {source}"),
                key: key.to_string(),
            }),
        }
    }
}
