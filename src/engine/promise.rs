use std::collections::HashSet;
use std::fmt;
use std::marker::PhantomData;

use ciborium::Value;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::engine::context::JobContext;
use crate::engine::task::TaskId;
use crate::error::FlowError;

/// Untyped address of a future value: a task's return value, or one slot of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PromiseId {
    pub producer: TaskId,
    pub slot: Option<u32>,
}

/// A placeholder for a value another task will produce.
///
/// Promises are cheap, copyable and serializable, so they can be stored in
/// job arguments. They can only be dereferenced through the [`JobContext`] of
/// a task that declared them as an input, or through the workflow once the
/// producer has succeeded.
pub struct Promise<T> {
    id: PromiseId,
    _phantom: PhantomData<fn() -> T>,
}

impl<T> Promise<T> {
    pub(crate) fn new(id: PromiseId) -> Self {
        Self {
            id,
            _phantom: PhantomData,
        }
    }

    pub fn id(&self) -> PromiseId {
        self.id
    }

    pub fn producer(&self) -> TaskId {
        self.id.producer
    }
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Promise<T> {}

impl<T> PartialEq for Promise<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<T> Eq for Promise<T> {}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.id.slot {
            Some(slot) => write!(f, "Promise({}.{slot})", self.id.producer),
            None => write!(f, "Promise({})", self.id.producer),
        }
    }
}

impl<T> Serialize for Promise<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.id.serialize(serializer)
    }
}

impl<'de, T> Deserialize<'de> for Promise<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        PromiseId::deserialize(deserializer).map(Promise::new)
    }
}

/// What a job body hands back: a value now, or the value of another task.
pub enum Returned<T> {
    Value(T),
    Forward(Promise<T>),
}

/// A [`Returned`] after type erasure, as kept in the task table and the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) enum Stored {
    Value(Value),
    Forward(PromiseId),
}

/// A job argument that is either known up front or produced by another task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Deferred<T> {
    Ready(T),
    Promised(Promise<T>),
}

impl<T> Deferred<T> {
    pub fn promise_id(&self) -> Option<PromiseId> {
        match self {
            Deferred::Ready(_) => None,
            Deferred::Promised(promise) => Some(promise.id()),
        }
    }
}

impl<T: Clone + DeserializeOwned> Deferred<T> {
    pub fn get(&self, ctx: &JobContext<'_>) -> Result<T, FlowError> {
        match self {
            Deferred::Ready(value) => Ok(value.clone()),
            Deferred::Promised(promise) => ctx.resolve(promise),
        }
    }
}

impl<T> From<Promise<T>> for Deferred<T> {
    fn from(promise: Promise<T>) -> Self {
        Deferred::Promised(promise)
    }
}

/// Read access to the results of finished tasks.
pub(crate) trait Results {
    /// The stored result of `task`, only if it is done.
    fn result(&self, task: TaskId) -> Option<&Stored>;
}

/// Whether every link of the forward chain behind `id` is done.
pub(crate) fn is_resolvable(results: &impl Results, id: PromiseId) -> bool {
    let mut seen = HashSet::new();
    let mut current = id;

    loop {
        if !seen.insert(current.producer) {
            return false;
        }
        match results.result(current.producer) {
            None => return false,
            Some(Stored::Value(_)) => return true,
            Some(Stored::Forward(next)) => current = *next,
        }
    }
}

/// Follows forwards until a concrete value, then applies the slots collected
/// along the way, innermost first.
pub(crate) fn resolve_value(results: &impl Results, id: PromiseId) -> Result<Value, FlowError> {
    let mut seen = HashSet::new();
    let mut slots = Vec::new();
    let mut current = id;

    let mut value = loop {
        if !seen.insert(current.producer) {
            return Err(FlowError::Cycle(current.producer));
        }
        if let Some(slot) = current.slot {
            slots.push(slot);
        }
        match results.result(current.producer) {
            None => {
                return Err(FlowError::UnresolvedPromise {
                    producer: current.producer,
                    slot: current.slot,
                });
            }
            Some(Stored::Value(value)) => break value.clone(),
            Some(Stored::Forward(next)) => current = *next,
        }
    };

    for slot in slots.into_iter().rev() {
        value = select_slot(value, slot, id.producer)?;
    }

    Ok(value)
}

fn select_slot(value: Value, slot: u32, producer: TaskId) -> Result<Value, FlowError> {
    match value {
        Value::Array(items) => items.into_iter().nth(slot as usize).ok_or_else(|| {
            FlowError::Codec(format!("result of {producer} has no slot {slot}"))
        }),
        _ => Err(FlowError::Codec(format!(
            "result of {producer} is not a tuple, slot {slot} requested"
        ))),
    }
}

pub(crate) fn decode<T: DeserializeOwned>(value: &Value) -> Result<T, FlowError> {
    value.deserialized().map_err(FlowError::codec)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    struct Table(HashMap<TaskId, Stored>);

    impl Results for Table {
        fn result(&self, task: TaskId) -> Option<&Stored> {
            self.0.get(&task)
        }
    }

    fn value<T: Serialize>(v: T) -> Stored {
        Stored::Value(Value::serialized(&v).unwrap())
    }

    fn pid(producer: u64, slot: Option<u32>) -> PromiseId {
        PromiseId {
            producer: TaskId(producer),
            slot,
        }
    }

    #[test]
    fn test_forward_chain_composes_slots() {
        // t1 forwards slot 1 of t2, t2 forwards t3 whole, t3 is ((a, b), (c, d)).
        let table = Table(HashMap::from([
            (TaskId(1), Stored::Forward(pid(2, Some(1)))),
            (TaskId(2), Stored::Forward(pid(3, None))),
            (TaskId(3), value((("a", "b"), ("c", "d")))),
        ]));

        let whole: (String, String) = decode(&resolve_value(&table, pid(1, None)).unwrap()).unwrap();
        assert_eq!(whole, ("c".into(), "d".into()));

        let first: String = decode(&resolve_value(&table, pid(1, Some(0))).unwrap()).unwrap();
        assert_eq!(first, "c");
    }

    #[test]
    fn test_missing_link_is_unresolved() {
        let table = Table(HashMap::from([(TaskId(1), Stored::Forward(pid(2, None)))]));

        assert!(!is_resolvable(&table, pid(1, None)));
        assert!(matches!(
            resolve_value(&table, pid(1, None)),
            Err(FlowError::UnresolvedPromise { producer: TaskId(2), .. })
        ));
    }

    #[test]
    fn test_self_forward_never_resolves() {
        let table = Table(HashMap::from([(TaskId(1), Stored::Forward(pid(1, None)))]));

        assert!(!is_resolvable(&table, pid(1, None)));
        assert!(matches!(resolve_value(&table, pid(1, None)), Err(FlowError::Cycle(_))));
    }

    #[test]
    fn test_slot_out_of_range() {
        let table = Table(HashMap::from([(TaskId(1), value((1u32, 2u32)))]));
        assert!(matches!(
            resolve_value(&table, pid(1, Some(2))),
            Err(FlowError::Codec(_))
        ));
    }
}
