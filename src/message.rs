use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::Result;

/// Converts a message to and from its wire payload. One format instance is
/// shared by every cache of an execution.
pub trait MessageFormat<M>: Send + Sync {
    fn serialize(&self, message: &M) -> Value;
    fn parse(&self, payload: &Value) -> Result<M>;
}

/// Serde-backed format; the default for every built-in algorithm.
pub struct JsonFormat<M> {
    _marker: PhantomData<fn() -> M>,
}

impl<M> JsonFormat<M> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<M> Default for JsonFormat<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> MessageFormat<M> for JsonFormat<M>
where
    M: Serialize + DeserializeOwned + Send + Sync,
{
    fn serialize(&self, message: &M) -> Value {
        serde_json::to_value(message).unwrap_or(Value::Null)
    }

    fn parse(&self, payload: &Value) -> Result<M> {
        Ok(serde_json::from_value(payload.clone())?)
    }
}

/// Reduces two messages bound for the same vertex to one. Merges happen in
/// arbitrary order across threads and across peer arrival order, so the
/// operation must be commutative and associative.
pub trait MessageCombiner<M>: Send + Sync {
    fn combine(&self, stored: &mut M, incoming: M);
}

/// Keeps the smaller message. Used by shortest-path style algorithms.
#[derive(Debug, Clone, Copy, Default)]
pub struct MinCombiner;

impl<M: Ord> MessageCombiner<M> for MinCombiner {
    fn combine(&self, stored: &mut M, incoming: M) {
        if incoming < *stored {
            *stored = incoming;
        }
    }
}

/// Adds messages together. Used by rank-accumulating algorithms.
#[derive(Debug, Clone, Copy, Default)]
pub struct SumCombiner;

impl MessageCombiner<f64> for SumCombiner {
    fn combine(&self, stored: &mut f64, incoming: f64) {
        *stored += incoming;
    }
}
