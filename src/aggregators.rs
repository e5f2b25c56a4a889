use std::collections::BTreeMap;

use serde_json::{Map, Value};
use tracing::warn;

use crate::error::{PregelError, Result};

/// A named global reducer. Values flow worker -> conductor after every
/// superstep and conductor -> workers in the next `prepare_global_step`.
///
/// `aggregate_value` must be associative; merges arrive in arbitrary order
/// from the worker's own threads and from the conductor.
pub trait Aggregator: Send + Sync {
    fn name(&self) -> &str;
    fn reset(&mut self);
    fn aggregate_value(&mut self, value: &Value) -> Result<()>;
    fn serialize(&self) -> Value;
    fn boxed_clone(&self) -> Box<dyn Aggregator>;
}

/// Keeps the minimum of all aggregated integers. Resets to `u64::MAX`.
#[derive(Debug, Clone)]
pub struct MinU64Aggregator {
    name: String,
    value: u64,
}

impl MinU64Aggregator {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: u64::MAX,
        }
    }
}

impl Aggregator for MinU64Aggregator {
    fn name(&self) -> &str {
        &self.name
    }

    fn reset(&mut self) {
        self.value = u64::MAX;
    }

    fn aggregate_value(&mut self, value: &Value) -> Result<()> {
        let other = value.as_u64().ok_or_else(|| {
            PregelError::bad_parameter(format!("aggregator {} expects an integer", self.name))
        })?;
        self.value = self.value.min(other);
        Ok(())
    }

    fn serialize(&self) -> Value {
        Value::from(self.value)
    }

    fn boxed_clone(&self) -> Box<dyn Aggregator> {
        Box::new(self.clone())
    }
}

/// Sums all aggregated floats. Resets to zero.
#[derive(Debug, Clone)]
pub struct SumF64Aggregator {
    name: String,
    value: f64,
}

impl SumF64Aggregator {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: 0.0,
        }
    }
}

impl Aggregator for SumF64Aggregator {
    fn name(&self) -> &str {
        &self.name
    }

    fn reset(&mut self) {
        self.value = 0.0;
    }

    fn aggregate_value(&mut self, value: &Value) -> Result<()> {
        let other = value.as_f64().ok_or_else(|| {
            PregelError::bad_parameter(format!("aggregator {} expects a number", self.name))
        })?;
        self.value += other;
        Ok(())
    }

    fn serialize(&self) -> Value {
        Value::from(self.value)
    }

    fn boxed_clone(&self) -> Box<dyn Aggregator> {
        Box::new(self.clone())
    }
}

/// Logical-or over aggregated booleans; a convergence flag. Resets to
/// `false`.
#[derive(Debug, Clone)]
pub struct BoolOrAggregator {
    name: String,
    value: bool,
}

impl BoolOrAggregator {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: false,
        }
    }
}

impl Aggregator for BoolOrAggregator {
    fn name(&self) -> &str {
        &self.name
    }

    fn reset(&mut self) {
        self.value = false;
    }

    fn aggregate_value(&mut self, value: &Value) -> Result<()> {
        let other = value.as_bool().ok_or_else(|| {
            PregelError::bad_parameter(format!("aggregator {} expects a boolean", self.name))
        })?;
        self.value |= other;
        Ok(())
    }

    fn serialize(&self) -> Value {
        Value::from(self.value)
    }

    fn boxed_clone(&self) -> Box<dyn Aggregator> {
        Box::new(self.clone())
    }
}

/// Ordered set of the aggregators an algorithm declared. One instance
/// mirrors conductor-supplied values for the running superstep, one
/// accumulates worker-produced values for the next report, and every worker
/// task carries a short-lived snapshot merged in at the barrier.
pub struct AggregatorRegistry {
    entries: BTreeMap<String, Box<dyn Aggregator>>,
}

impl AggregatorRegistry {
    pub fn new(declarations: Vec<Box<dyn Aggregator>>) -> Self {
        let mut entries = BTreeMap::new();
        for aggregator in declarations {
            entries.insert(aggregator.name().to_owned(), aggregator);
        }
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn reset_values(&mut self) {
        for aggregator in self.entries.values_mut() {
            aggregator.reset();
        }
    }

    /// Merge one named value, e.g. from a vertex program.
    pub fn aggregate(&mut self, name: &str, value: &Value) -> Result<()> {
        match self.entries.get_mut(name) {
            Some(aggregator) => aggregator.aggregate_value(value),
            None => Err(PregelError::bad_parameter(format!(
                "unknown aggregator {name}"
            ))),
        }
    }

    /// Merge a JSON object of named values, e.g. the conductor's
    /// `aggregatorValues`. Unknown names are ignored, the conductor may
    /// carry values for other workers' algorithms.
    pub fn aggregate_json(&mut self, values: &Map<String, Value>) -> Result<()> {
        for (name, value) in values {
            if let Some(aggregator) = self.entries.get_mut(name) {
                aggregator.aggregate_value(value)?;
            }
        }
        Ok(())
    }

    /// Element-wise merge of another registry built from the same
    /// declarations.
    pub fn merge_registry(&mut self, other: &AggregatorRegistry) {
        for (name, theirs) in &other.entries {
            match self.entries.get_mut(name) {
                Some(ours) => {
                    if let Err(err) = ours.aggregate_value(&theirs.serialize()) {
                        warn!(aggregator = %name, %err, "aggregators.merge.failed");
                    }
                }
                None => warn!(aggregator = %name, "aggregators.merge.unknown"),
            }
        }
    }

    pub fn value_of(&self, name: &str) -> Option<Value> {
        self.entries.get(name).map(|a| a.serialize())
    }

    pub fn serialized_values(&self) -> Map<String, Value> {
        self.entries
            .iter()
            .map(|(name, aggregator)| (name.clone(), aggregator.serialize()))
            .collect()
    }
}

impl Clone for AggregatorRegistry {
    fn clone(&self) -> Self {
        Self {
            entries: self
                .entries
                .iter()
                .map(|(name, aggregator)| (name.clone(), aggregator.boxed_clone()))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn registry() -> AggregatorRegistry {
        AggregatorRegistry::new(vec![
            Box::new(MinU64Aggregator::new("shortest")),
            Box::new(SumF64Aggregator::new("residual")),
            Box::new(BoolOrAggregator::new("converged")),
        ])
    }

    #[test]
    fn aggregate_and_serialize_round_trip() {
        let mut reg = registry();
        reg.aggregate("shortest", &json!(9)).unwrap();
        reg.aggregate("shortest", &json!(4)).unwrap();
        reg.aggregate("residual", &json!(0.5)).unwrap();
        reg.aggregate("converged", &json!(true)).unwrap();

        let values = reg.serialized_values();
        assert_eq!(values["shortest"], json!(4));
        assert_eq!(values["residual"], json!(0.5));
        assert_eq!(values["converged"], json!(true));

        reg.reset_values();
        assert_eq!(reg.value_of("shortest"), Some(json!(u64::MAX)));
        assert_eq!(reg.value_of("converged"), Some(json!(false)));
    }

    #[test]
    fn unknown_name_is_an_error_for_direct_aggregate() {
        let mut reg = registry();
        assert!(reg.aggregate("missing", &json!(1)).is_err());
    }

    #[test]
    fn json_merge_skips_unknown_names() {
        let mut reg = registry();
        let mut values = Map::new();
        values.insert("shortest".into(), json!(2));
        values.insert("someone-elses".into(), json!("ignored"));
        reg.aggregate_json(&values).unwrap();
        assert_eq!(reg.value_of("shortest"), Some(json!(2)));
    }

    #[test]
    fn type_mismatch_is_rejected() {
        let mut reg = registry();
        assert!(reg.aggregate("shortest", &json!("nope")).is_err());
        assert!(reg.aggregate("converged", &json!(3)).is_err());
    }

    #[test]
    fn merge_registry_is_element_wise() {
        let mut left = registry();
        left.aggregate("shortest", &json!(10)).unwrap();
        left.aggregate("residual", &json!(1.0)).unwrap();

        let mut right = registry();
        right.aggregate("shortest", &json!(3)).unwrap();
        right.aggregate("residual", &json!(0.25)).unwrap();
        right.aggregate("converged", &json!(true)).unwrap();

        left.merge_registry(&right);
        assert_eq!(left.value_of("shortest"), Some(json!(3)));
        assert_eq!(left.value_of("residual"), Some(json!(1.25)));
        assert_eq!(left.value_of("converged"), Some(json!(true)));
    }

    proptest! {
        // Splitting a value stream across thread snapshots and merging the
        // snapshots must equal aggregating the stream directly.
        #[test]
        fn snapshot_merge_equals_direct_fold(
            values in proptest::collection::vec(any::<u64>(), 1..24),
            split in 0usize..24,
        ) {
            let split = split.min(values.len());
            let mut direct = registry();
            for v in &values {
                direct.aggregate("shortest", &json!(*v)).unwrap();
            }

            let mut first = registry();
            for v in &values[..split] {
                first.aggregate("shortest", &json!(*v)).unwrap();
            }
            let mut second = registry();
            for v in &values[split..] {
                second.aggregate("shortest", &json!(*v)).unwrap();
            }
            first.merge_registry(&second);
            prop_assert_eq!(first.value_of("shortest"), direct.value_of("shortest"));
        }
    }
}
