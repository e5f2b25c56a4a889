use std::sync::Arc;

use serde_json::{json, Value};
use tracing::debug;

use super::{Algorithm, ComputeContext, VertexComputation};
use crate::aggregators::{Aggregator, AggregatorRegistry, BoolOrAggregator, SumF64Aggregator};
use crate::cache::MessageIterator;
use crate::context::WorkerContext;
use crate::error::{PregelError, Result};
use crate::graph::GraphFormat;
use crate::message::{JsonFormat, MessageCombiner, MessageFormat, SumCombiner};

pub(super) const NAME: &str = "pagerank";

/// Sum of per-vertex rank movement in the last superstep.
const RESIDUAL: &str = "residual";
/// Set once the residual drops below the configured threshold.
const CONVERGED: &str = "converged";

const DEFAULT_DAMPING: f64 = 0.85;
const DEFAULT_MAX_SUPERSTEPS: u64 = 50;

/// Damped PageRank with a residual-based convergence vote.
///
/// Each vertex spreads `rank / out_degree` along its edges every superstep;
/// the residual aggregator carries the total rank movement to the
/// conductor, which mirrors the convergence flag back so every worker
/// halts in the same superstep.
pub struct PageRankAlgorithm {
    damping: f64,
    epsilon: f64,
    max_supersteps: u64,
}

impl PageRankAlgorithm {
    pub fn from_params(params: &Value) -> Result<Self> {
        let damping = match params.get("damping") {
            None => DEFAULT_DAMPING,
            Some(raw) => raw
                .as_f64()
                .filter(|d| (0.0..=1.0).contains(d))
                .ok_or_else(|| {
                    PregelError::bad_parameter("pagerank damping must be a number in [0, 1]")
                })?,
        };
        let epsilon = match params.get("epsilon") {
            None => 0.0,
            Some(raw) => raw
                .as_f64()
                .filter(|e| *e >= 0.0)
                .ok_or_else(|| {
                    PregelError::bad_parameter("pagerank epsilon must be a non-negative number")
                })?,
        };
        let max_supersteps = match params.get("maximumSupersteps") {
            None => DEFAULT_MAX_SUPERSTEPS,
            Some(raw) => raw.as_u64().filter(|m| *m > 0).ok_or_else(|| {
                PregelError::bad_parameter("pagerank maximumSupersteps must be a positive integer")
            })?,
        };
        Ok(Self {
            damping,
            epsilon,
            max_supersteps,
        })
    }
}

impl Algorithm<f64, f64, f64> for PageRankAlgorithm {
    fn name(&self) -> &'static str {
        NAME
    }

    fn graph_format(&self) -> Box<dyn GraphFormat<f64, f64>> {
        Box::new(PageRankGraphFormat)
    }

    fn message_format(&self) -> Arc<dyn MessageFormat<f64>> {
        Arc::new(JsonFormat::new())
    }

    fn message_combiner(&self) -> Option<Arc<dyn MessageCombiner<f64>>> {
        Some(Arc::new(SumCombiner))
    }

    fn aggregators(&self) -> Vec<Box<dyn Aggregator>> {
        vec![
            Box::new(SumF64Aggregator::new(RESIDUAL)),
            Box::new(BoolOrAggregator::new(CONVERGED)),
        ]
    }

    fn worker_context(&self) -> Option<Box<dyn WorkerContext>> {
        Some(Box::new(PageRankContext {
            epsilon: self.epsilon,
        }))
    }

    fn create_computation(&self, _gss: u64) -> Box<dyn VertexComputation<f64, f64, f64>> {
        Box::new(PageRankComputation {
            damping: self.damping,
            max_supersteps: self.max_supersteps,
        })
    }
}

/// Ranks are seeded in the first superstep; edge weights are unused.
struct PageRankGraphFormat;

impl GraphFormat<f64, f64> for PageRankGraphFormat {
    fn vertex_value(&self, _vertex_id: &str, _raw: &Value) -> Result<f64> {
        Ok(0.0)
    }

    fn edge_value(&self, _raw: &Value) -> Result<f64> {
        Ok(1.0)
    }
}

/// Turns the reported residual into the convergence flag the conductor
/// mirrors back to every worker.
struct PageRankContext {
    epsilon: f64,
}

impl WorkerContext for PageRankContext {
    fn pre_global_superstep(&mut self, gss: u64, conductor: &AggregatorRegistry) {
        debug!(
            gss,
            residual = conductor.value_of(RESIDUAL).and_then(|v| v.as_f64()),
            "pagerank.superstep.residual"
        );
    }

    fn post_global_superstep(&mut self, gss: u64, worker: &mut AggregatorRegistry) {
        if gss == 0 || self.epsilon <= 0.0 {
            return;
        }
        let residual = worker
            .value_of(RESIDUAL)
            .and_then(|v| v.as_f64())
            .unwrap_or(f64::MAX);
        if residual < self.epsilon {
            let _ = worker.aggregate(CONVERGED, &json!(true));
        }
    }
}

struct PageRankComputation {
    damping: f64,
    max_supersteps: u64,
}

impl VertexComputation<f64, f64, f64> for PageRankComputation {
    fn compute(
        &mut self,
        ctx: &mut ComputeContext<'_, '_, f64, f64, f64>,
        messages: &mut MessageIterator<'_, f64>,
    ) -> Result<()> {
        let total = ctx.total_vertex_count().max(1) as f64;
        let rank = if ctx.gss() == 0 {
            1.0 / total
        } else {
            let mut incoming = 0.0;
            while let Some(share) = messages.next() {
                incoming += *share;
            }
            let previous = ctx.vertex_value();
            let next = (1.0 - self.damping) / total + self.damping * incoming;
            ctx.aggregate(RESIDUAL, &json!((next - previous).abs()))?;
            next
        };
        ctx.set_vertex_value(rank);

        let converged = ctx
            .conductor_aggregated(CONVERGED)
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        if converged || ctx.gss() + 1 >= self.max_supersteps {
            ctx.vote_halt();
            return Ok(());
        }

        let degree = ctx.edges().len();
        if degree > 0 {
            let share = rank / degree as f64;
            for edge in ctx.edges() {
                ctx.send_along(edge, share);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_default_and_validate() {
        let algo = PageRankAlgorithm::from_params(&json!({})).unwrap();
        assert_eq!(algo.damping, DEFAULT_DAMPING);
        assert_eq!(algo.max_supersteps, DEFAULT_MAX_SUPERSTEPS);

        let algo =
            PageRankAlgorithm::from_params(&json!({"damping": 0.5, "maximumSupersteps": 10}))
                .unwrap();
        assert_eq!(algo.damping, 0.5);
        assert_eq!(algo.max_supersteps, 10);

        assert!(PageRankAlgorithm::from_params(&json!({"damping": 1.5})).is_err());
        assert!(PageRankAlgorithm::from_params(&json!({"maximumSupersteps": 0})).is_err());
        assert!(PageRankAlgorithm::from_params(&json!({"epsilon": -0.1})).is_err());
    }

    #[test]
    fn context_votes_convergence_below_epsilon() {
        let algo = PageRankAlgorithm::from_params(&json!({"epsilon": 0.01})).unwrap();
        let mut context = algo.worker_context().unwrap();
        let mut registry = AggregatorRegistry::new(algo.aggregators());

        registry.aggregate(RESIDUAL, &json!(0.5)).unwrap();
        context.post_global_superstep(3, &mut registry);
        assert_eq!(registry.value_of(CONVERGED), Some(json!(false)));

        registry.reset_values();
        registry.aggregate(RESIDUAL, &json!(0.001)).unwrap();
        context.post_global_superstep(4, &mut registry);
        assert_eq!(registry.value_of(CONVERGED), Some(json!(true)));
    }
}
