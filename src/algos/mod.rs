//! The algorithm-facing surface: what a vertex program may do during
//! compute, what an algorithm must provide, and the factory that turns an
//! `algorithm` config string into a running worker.

mod pagerank;
mod sssp;

pub use pagerank::PageRankAlgorithm;
pub use sssp::SsspAlgorithm;

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use crate::aggregators::{Aggregator, AggregatorRegistry};
use crate::cache::{MessageIterator, OutgoingCache};
use crate::context::{ContextState, WorkerContext};
use crate::error::{PregelError, Result};
use crate::graph::{EdgeEntry, GraphFormat, GraphStore, VertexEntry};
use crate::message::{MessageCombiner, MessageFormat};
use crate::protocol::{GraphSource, WorkerConfig};
use crate::transport::Transport;
use crate::worker::{PregelWorker, Worker};

/// A user-supplied vertex algorithm. Binds the concrete vertex, edge and
/// message types the worker is parameterized over and hands out the
/// per-superstep computation plus the serialization artifacts shared by
/// every cache.
pub trait Algorithm<V, E, M>: Send + Sync {
    fn name(&self) -> &'static str;

    fn graph_format(&self) -> Box<dyn GraphFormat<V, E>>;

    fn message_format(&self) -> Arc<dyn MessageFormat<M>>;

    fn message_combiner(&self) -> Option<Arc<dyn MessageCombiner<M>>> {
        None
    }

    /// Aggregators this algorithm wants. Called once per registry, so
    /// fresh instances each time.
    fn aggregators(&self) -> Vec<Box<dyn Aggregator>> {
        Vec::new()
    }

    fn worker_context(&self) -> Option<Box<dyn WorkerContext>> {
        None
    }

    fn create_computation(&self, gss: u64) -> Box<dyn VertexComputation<V, E, M>>;
}

/// One superstep's vertex program. A fresh instance runs per worker task;
/// it never outlives the worker that created it.
pub trait VertexComputation<V, E, M> {
    fn compute(
        &mut self,
        ctx: &mut ComputeContext<'_, '_, V, E, M>,
        messages: &mut MessageIterator<'_, M>,
    ) -> Result<()>;
}

/// Everything a vertex program may touch while computing one vertex:
/// its value, its edges, the thread-local outgoing cache, the conductor's
/// aggregated values (read-only) and the thread's aggregator snapshot.
pub struct ComputeContext<'a, 'b, V, E, M> {
    gss: u64,
    entry: &'a VertexEntry,
    graph: &'a GraphStore<V, E>,
    outgoing: &'a mut OutgoingCache<'b, M>,
    conductor_aggregators: &'a AggregatorRegistry,
    worker_aggregators: &'a mut AggregatorRegistry,
    totals: &'a ContextState,
}

impl<'a, 'b, V: Clone, E, M> ComputeContext<'a, 'b, V, E, M> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        gss: u64,
        entry: &'a VertexEntry,
        graph: &'a GraphStore<V, E>,
        outgoing: &'a mut OutgoingCache<'b, M>,
        conductor_aggregators: &'a AggregatorRegistry,
        worker_aggregators: &'a mut AggregatorRegistry,
        totals: &'a ContextState,
    ) -> Self {
        Self {
            gss,
            entry,
            graph,
            outgoing,
            conductor_aggregators,
            worker_aggregators,
            totals,
        }
    }

    pub fn gss(&self) -> u64 {
        self.gss
    }

    pub fn vertex_id(&self) -> &str {
        self.entry.vertex_id()
    }

    pub fn vertex_value(&self) -> V {
        self.graph.value_of(self.entry)
    }

    pub fn set_vertex_value(&self, value: V) {
        self.graph.set_value(self.entry, value);
    }

    pub fn edges(&self) -> &'a [EdgeEntry<E>] {
        self.graph.edges_of(self.entry)
    }

    pub fn send(&mut self, vertex_id: &str, message: M) {
        self.outgoing.send_to_vertex(vertex_id, message);
    }

    /// Send along an edge, reusing its cached shard placement.
    pub fn send_along(&mut self, edge: &EdgeEntry<E>, message: M) {
        self.outgoing
            .send_to_shard(edge.shard_hint(), edge.to_vertex_id(), message);
    }

    /// Vote to halt. The vertex computes again only when a message
    /// arrives for it.
    pub fn vote_halt(&self) {
        self.entry.set_active(false);
    }

    pub fn reactivate(&self) {
        self.entry.set_active(true);
    }

    /// Fold a value into this worker's aggregator for the running
    /// superstep.
    pub fn aggregate(&mut self, name: &str, value: &Value) -> Result<()> {
        self.worker_aggregators.aggregate(name, value)
    }

    /// Value the conductor aggregated across all workers in the previous
    /// superstep.
    pub fn conductor_aggregated(&self, name: &str) -> Option<Value> {
        self.conductor_aggregators.value_of(name)
    }

    pub fn total_vertex_count(&self) -> u64 {
        self.totals.total_vertex_count
    }

    pub fn total_edge_count(&self) -> u64 {
        self.totals.total_edge_count
    }
}

/// Instantiate the worker named by `config.algorithm` over a loaded
/// partition. Unknown names fail with a bad-parameter error.
pub fn create_worker(
    config: WorkerConfig,
    source: &GraphSource,
    transport: Arc<dyn Transport>,
) -> Result<Box<dyn PregelWorker>> {
    match config.algorithm.as_str() {
        sssp::NAME => {
            let algorithm = SsspAlgorithm::from_params(&config.user_parameters)?;
            boxed(config, source, transport, algorithm)
        }
        pagerank::NAME => {
            let algorithm = PageRankAlgorithm::from_params(&config.user_parameters)?;
            boxed(config, source, transport, algorithm)
        }
        other => Err(PregelError::bad_parameter(format!(
            "unsupported algorithm {other}"
        ))),
    }
}

fn boxed<V, E, M, A>(
    config: WorkerConfig,
    source: &GraphSource,
    transport: Arc<dyn Transport>,
    algorithm: A,
) -> Result<Box<dyn PregelWorker>>
where
    V: Clone + Serialize + Send + Sync + 'static,
    E: Send + Sync + 'static,
    M: Clone + Send + Sync + 'static,
    A: Algorithm<V, E, M> + 'static,
{
    let graph = GraphStore::load(source, algorithm.graph_format().as_ref(), &config.shards)?;
    let worker = Worker::new(config, Box::new(algorithm), graph, transport)?;
    Ok(Box::new(worker))
}
