use std::sync::Arc;

use serde_json::Value;

use super::{Algorithm, ComputeContext, VertexComputation};
use crate::cache::MessageIterator;
use crate::error::{PregelError, Result};
use crate::graph::GraphFormat;
use crate::message::{JsonFormat, MessageCombiner, MessageFormat, MinCombiner};

pub(super) const NAME: &str = "sssp";

/// Unreached distance.
const INFINITY: u64 = u64::MAX;

/// Single-source shortest paths. Vertex values are distances from the
/// source, edge values are weights, messages are candidate distances
/// reduced by a min-combiner.
pub struct SsspAlgorithm {
    source: String,
}

impl SsspAlgorithm {
    pub fn from_params(params: &Value) -> Result<Self> {
        let source = params
            .get("source")
            .and_then(Value::as_str)
            .ok_or_else(|| PregelError::bad_parameter("sssp requires a source vertex id"))?;
        Ok(Self {
            source: source.to_owned(),
        })
    }
}

impl Algorithm<u64, u64, u64> for SsspAlgorithm {
    fn name(&self) -> &'static str {
        NAME
    }

    fn graph_format(&self) -> Box<dyn GraphFormat<u64, u64>> {
        Box::new(SsspGraphFormat)
    }

    fn message_format(&self) -> Arc<dyn MessageFormat<u64>> {
        Arc::new(JsonFormat::new())
    }

    fn message_combiner(&self) -> Option<Arc<dyn MessageCombiner<u64>>> {
        Some(Arc::new(MinCombiner))
    }

    fn create_computation(&self, _gss: u64) -> Box<dyn VertexComputation<u64, u64, u64>> {
        Box::new(SsspComputation {
            source: self.source.clone(),
        })
    }
}

/// Distances start unreached; missing edge weights default to one.
struct SsspGraphFormat;

impl GraphFormat<u64, u64> for SsspGraphFormat {
    fn vertex_value(&self, _vertex_id: &str, _raw: &Value) -> Result<u64> {
        Ok(INFINITY)
    }

    fn edge_value(&self, raw: &Value) -> Result<u64> {
        match raw {
            Value::Null => Ok(1),
            Value::Number(_) => raw
                .as_u64()
                .ok_or_else(|| PregelError::bad_parameter("sssp edge weight must be a non-negative integer")),
            _ => Err(PregelError::bad_parameter(
                "sssp edge weight must be a non-negative integer",
            )),
        }
    }
}

struct SsspComputation {
    source: String,
}

impl VertexComputation<u64, u64, u64> for SsspComputation {
    fn compute(
        &mut self,
        ctx: &mut ComputeContext<'_, '_, u64, u64, u64>,
        messages: &mut MessageIterator<'_, u64>,
    ) -> Result<()> {
        let current = ctx.vertex_value();
        let mut best = current;
        if ctx.gss() == 0 && ctx.vertex_id() == self.source {
            best = 0;
        }
        while let Some(candidate) = messages.next() {
            best = best.min(*candidate);
        }

        if best < current {
            ctx.set_vertex_value(best);
            for edge in ctx.edges() {
                ctx.send_along(edge, best.saturating_add(*edge.value()));
            }
        }
        ctx.vote_halt();
        Ok(())
    }
}
