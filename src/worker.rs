use std::ops::Range;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Condvar, Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::aggregators::AggregatorRegistry;
use crate::algos::{Algorithm, ComputeContext};
use crate::cache::{IncomingCache, OutgoingCache};
use crate::context::{ContextState, WorkerContext};
use crate::error::{PregelError, Result};
use crate::graph::GraphStore;
use crate::message::{MessageCombiner, MessageFormat};
use crate::protocol::{
    self, FinalizeRequest, GssReport, PrepareGssRequest, ReceivedMessagesRequest, StartGssRequest,
    UnknownVertexPolicy, WorkerConfig, FINISHED_GSS_PATH,
};
use crate::state::WorkerState;
use crate::stats::WorkerStats;
use crate::transport::Transport;

/// Type-erased lifecycle surface the conductor-facing RPC layer drives.
/// All implementations serialize `prepare_global_step`,
/// `start_global_step` and `finalize_execution` against each other.
pub trait PregelWorker: Send + Sync {
    fn prepare_global_step(&self, req: PrepareGssRequest) -> Result<()>;
    fn start_global_step(&self, req: StartGssRequest) -> Result<()>;
    fn received_messages(&self, req: ReceivedMessagesRequest) -> Result<()>;
    fn finalize_execution(&self, req: FinalizeRequest) -> Result<()>;
    fn current_gss(&self) -> u64;
    fn expected_gss(&self) -> u64;
    /// Final vertex values, available after `finalize_execution`.
    fn results(&self) -> Option<Vec<(String, Value)>>;
}

/// Barrier accounting for the running superstep, guarded by one mutex (the
/// "thread mutex"): the count of outstanding range tasks plus the stats and
/// aggregator values they have folded in so far.
struct BarrierState {
    running_threads: usize,
    stats: WorkerStats,
    aggregators: AggregatorRegistry,
}

struct WorkerCore<V, E, M> {
    running: AtomicBool,
    state: WorkerState,
    context_state: ContextState,
    unknown_vertex_policy: UnknownVertexPolicy,
    algorithm: Box<dyn Algorithm<V, E, M>>,
    format: Arc<dyn MessageFormat<M>>,
    combiner: Option<Arc<dyn MessageCombiner<M>>>,
    graph: RwLock<Option<Arc<GraphStore<V, E>>>>,
    /// The two message caches; `read_index` names the one compute reads
    /// from, the other absorbs deliveries for the next superstep. Roles
    /// swap at every `prepare_global_step`.
    caches: [IncomingCache<M>; 2],
    read_index: AtomicUsize,
    conductor_aggregators: RwLock<AggregatorRegistry>,
    barrier: Mutex<BarrierState>,
    /// Signalled when `running_threads` drops to zero; lets
    /// `finalize_execution` wait out an in-flight superstep.
    barrier_idle: Condvar,
    worker_context: Mutex<Option<Box<dyn WorkerContext>>>,
    transport: Arc<dyn Transport>,
    results: Mutex<Option<Vec<(String, V)>>>,
}

/// The per-node compute engine: executes bulk-synchronous vertex programs
/// over the local partition, driven by conductor lifecycle calls.
pub struct Worker<V, E, M> {
    core: Arc<WorkerCore<V, E, M>>,
    pool: Mutex<Option<rayon::ThreadPool>>,
    results_path: Option<PathBuf>,
    /// Serializes lifecycle edges; only one conductor operation may be in
    /// flight at a time.
    conductor_lock: Mutex<()>,
}

impl<V, E, M> Worker<V, E, M>
where
    V: Clone + Serialize + Send + Sync + 'static,
    E: Send + Sync + 'static,
    M: Send + Sync + 'static,
{
    pub fn new(
        config: WorkerConfig,
        algorithm: Box<dyn Algorithm<V, E, M>>,
        graph: GraphStore<V, E>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        let state = WorkerState::new(
            config.database,
            config.execution_number,
            config.coordinator_id,
            config.shards,
        )?;
        let threads = config.parallelism.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        });
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads.max(1))
            .thread_name(|i| format!("pregel-worker-{i}"))
            .build()
            .map_err(|err| PregelError::Internal(format!("worker pool: {err}")))?;

        let format = algorithm.message_format();
        let combiner = algorithm.message_combiner();
        let context_state = ContextState {
            total_vertex_count: config.total_vertex_count,
            total_edge_count: config.total_edge_count,
        };
        let mut worker_context = algorithm.worker_context();
        if let Some(context) = worker_context.as_mut() {
            context.pre_application(&context_state);
        }

        info!(
            execution = state.execution_number(),
            algorithm = algorithm.name(),
            vertices = graph.vertex_count(),
            edges = graph.edge_count(),
            threads,
            "worker.created"
        );

        let caches = [
            IncomingCache::new(format.clone(), combiner.clone()),
            IncomingCache::new(format.clone(), combiner.clone()),
        ];
        let barrier = BarrierState {
            running_threads: 0,
            stats: WorkerStats::default(),
            aggregators: AggregatorRegistry::new(algorithm.aggregators()),
        };
        let conductor_aggregators = RwLock::new(AggregatorRegistry::new(algorithm.aggregators()));

        Ok(Self {
            core: Arc::new(WorkerCore {
                running: AtomicBool::new(true),
                state,
                context_state,
                unknown_vertex_policy: config.unknown_vertex_policy,
                algorithm,
                format,
                combiner,
                graph: RwLock::new(Some(Arc::new(graph))),
                caches,
                read_index: AtomicUsize::new(0),
                conductor_aggregators,
                barrier: Mutex::new(barrier),
                barrier_idle: Condvar::new(),
                worker_context: Mutex::new(worker_context),
                transport,
                results: Mutex::new(None),
            }),
            pool: Mutex::new(Some(pool)),
            results_path: config.results_path,
            conductor_lock: Mutex::new(()),
        })
    }

    pub fn state(&self) -> &WorkerState {
        &self.core.state
    }

    /// Messages queued for the next superstep, mostly useful to tests and
    /// metrics.
    pub fn queued_message_count(&self) -> u64 {
        self.core.write_cache().received_message_count()
    }

    /// Typed final vertex values, available after `finalize_execution`.
    pub fn typed_results(&self) -> Option<Vec<(String, V)>> {
        self.core.results.lock().clone()
    }
}

impl<V, E, M> PregelWorker for Worker<V, E, M>
where
    V: Clone + Serialize + Send + Sync + 'static,
    E: Send + Sync + 'static,
    M: Send + Sync + 'static,
{
    fn prepare_global_step(&self, req: PrepareGssRequest) -> Result<()> {
        let _guard = self.conductor_lock.lock();
        let core = &self.core;

        let expected = core.state.expected_gss();
        if req.gss != expected {
            return Err(PregelError::bad_parameter(format!(
                "superstep mismatch in prepare, expected gss {expected}, got {}",
                req.gss
            )));
        }

        // Validate conductor values on a staged copy so a malformed
        // request leaves the worker untouched.
        let staged = match &req.aggregator_values {
            Some(values) => {
                let mut staged = core.conductor_aggregators.read().clone();
                staged.reset_values();
                staged.aggregate_json(values)?;
                Some(staged)
            }
            None => None,
        };

        info!(gss = req.gss, "worker.gss.prepare");
        core.state.enter_gss(req.gss);
        // The write cache becomes the readable cache for this superstep.
        core.read_index.fetch_xor(1, Ordering::SeqCst);
        match staged {
            Some(staged) => *core.conductor_aggregators.write() = staged,
            None => core.conductor_aggregators.write().reset_values(),
        }
        core.barrier.lock().aggregators.reset_values();

        if let Some(context) = core.worker_context.lock().as_mut() {
            context.pre_global_superstep(req.gss, &core.conductor_aggregators.read());
        }
        Ok(())
    }

    fn received_messages(&self, req: ReceivedMessagesRequest) -> Result<()> {
        let core = &self.core;
        let current = core.state.current_gss();
        if req.gss != current {
            warn!(expected = current, got = req.gss, "worker.messages.out_of_sync");
            return Err(PregelError::OutOfSync {
                expected: current,
                got: req.gss,
            });
        }

        let graph_guard = core.graph.read();
        let graph = graph_guard
            .as_ref()
            .ok_or_else(|| PregelError::Internal("graph store already released".into()))?;

        match core.unknown_vertex_policy {
            UnknownVertexPolicy::Discard => {
                let known: Vec<(String, Value)> = req
                    .messages
                    .into_iter()
                    .filter(|(vertex_id, _)| {
                        let known = graph.contains(vertex_id);
                        if !known {
                            debug!(vertex = %vertex_id, "worker.messages.unknown_dropped");
                        }
                        known
                    })
                    .collect();
                core.write_cache().parse_messages(&known)
            }
            UnknownVertexPolicy::Reject => {
                if let Some((vertex_id, _)) =
                    req.messages.iter().find(|(id, _)| !graph.contains(id))
                {
                    return Err(PregelError::bad_parameter(format!(
                        "message for unknown vertex {vertex_id}"
                    )));
                }
                core.write_cache().parse_messages(&req.messages)
            }
        }
    }

    fn start_global_step(&self, req: StartGssRequest) -> Result<()> {
        let _guard = self.conductor_lock.lock();
        let core = &self.core;

        let current = core.state.current_gss();
        if req.gss != current {
            return Err(PregelError::bad_parameter(format!(
                "wrong gss in start, current is {current}, got {}",
                req.gss
            )));
        }
        let graph = core
            .graph
            .read()
            .clone()
            .ok_or_else(|| PregelError::Internal("graph store already released".into()))?;
        let pool_guard = self.pool.lock();
        let pool = pool_guard
            .as_ref()
            .ok_or_else(|| PregelError::Internal("worker already finalized".into()))?;

        let ranges = partition_ranges(graph.vertex_count(), pool.current_num_threads());
        info!(
            gss = req.gss,
            vertices = graph.vertex_count(),
            tasks = ranges.len(),
            "worker.gss.start"
        );
        // Set before enqueueing: tasks that finish while we are still
        // spawning must observe a positive count and not fire the barrier.
        core.barrier.lock().running_threads = ranges.len();
        for range in ranges {
            let core = Arc::clone(core);
            let graph = Arc::clone(&graph);
            let gss = req.gss;
            pool.spawn(move || core.execute_range(&graph, gss, range));
        }
        Ok(())
    }

    fn finalize_execution(&self, req: FinalizeRequest) -> Result<()> {
        let _guard = self.conductor_lock.lock();
        let core = &self.core;

        info!(store_results = req.store_results, "worker.finalize");
        core.running.store(false, Ordering::SeqCst);
        // Wait out an in-flight superstep: every spawned range task
        // reports to the barrier exactly once, cancelled or not, so a zero
        // count means full quiescence and nothing left touches the graph.
        {
            let mut barrier = core.barrier.lock();
            while barrier.running_threads > 0 {
                core.barrier_idle.wait(&mut barrier);
            }
        }
        drop(self.pool.lock().take());

        if let Some(graph) = core.graph.write().take() {
            if req.store_results {
                match &self.results_path {
                    Some(path) => {
                        if let Err(err) = graph.store_results(path) {
                            warn!(%err, "worker.finalize.store_failed");
                        }
                    }
                    None => warn!("worker.finalize.no_results_path"),
                }
            } else {
                info!("worker.finalize.discarding_results");
            }
            *core.results.lock() = Some(graph.results());
        }
        Ok(())
    }

    fn current_gss(&self) -> u64 {
        self.core.state.current_gss()
    }

    fn expected_gss(&self) -> u64 {
        self.core.state.expected_gss()
    }

    fn results(&self) -> Option<Vec<(String, Value)>> {
        self.core.results.lock().as_ref().map(|results| {
            results
                .iter()
                .map(|(vertex_id, value)| {
                    (
                        vertex_id.clone(),
                        serde_json::to_value(value).unwrap_or(Value::Null),
                    )
                })
                .collect()
        })
    }
}

impl<V, E, M> WorkerCore<V, E, M>
where
    V: Clone + Serialize + Send + Sync + 'static,
    E: Send + Sync + 'static,
    M: Send + Sync + 'static,
{
    fn read_cache(&self) -> &IncomingCache<M> {
        &self.caches[self.read_index.load(Ordering::SeqCst)]
    }

    fn write_cache(&self) -> &IncomingCache<M> {
        &self.caches[self.read_index.load(Ordering::SeqCst) ^ 1]
    }

    /// One worker task: run the vertex program over `[range.start,
    /// range.end)`, flush produced messages, then report to the barrier.
    fn execute_range(&self, graph: &Arc<GraphStore<V, E>>, gss: u64, range: Range<usize>) {
        let started = Instant::now();
        if !self.running.load(Ordering::SeqCst) {
            info!(gss, "worker.task.aborted");
            self.worker_thread_done(
                AggregatorRegistry::new(self.algorithm.aggregators()),
                WorkerStats::default(),
            );
            return;
        }

        let local_incoming = IncomingCache::new(self.format.clone(), self.combiner.clone());
        let mut outgoing = OutgoingCache::new(
            self.state.shards(),
            self.state.database(),
            self.format.clone(),
            self.combiner.clone(),
            &local_incoming,
            self.transport.as_ref(),
        );
        let mut thread_aggregators = AggregatorRegistry::new(self.algorithm.aggregators());
        let mut computation = self.algorithm.create_computation(gss);
        let mut stats = WorkerStats::default();

        {
            let conductor_aggregators = self.conductor_aggregators.read();
            let read_cache = self.read_cache();
            for entry in graph.vertex_iterator(range.start, range.end) {
                let mut messages = read_cache.get_messages(entry.vertex_id());
                if entry.is_active() || !messages.is_empty() {
                    let mut ctx = ComputeContext::new(
                        gss,
                        entry,
                        graph,
                        &mut outgoing,
                        &conductor_aggregators,
                        &mut thread_aggregators,
                        &self.context_state,
                    );
                    if let Err(err) = computation.compute(&mut ctx, &mut messages) {
                        warn!(gss, vertex = entry.vertex_id(), %err, "worker.task.compute_failed");
                        stats.failed = true;
                        break;
                    }
                    if entry.is_active() {
                        stats.active_count += 1;
                    } else {
                        debug!(vertex = entry.vertex_id(), "worker.vertex.halted");
                    }
                }
                if !self.running.load(Ordering::SeqCst) {
                    info!(gss, "worker.task.cancelled");
                    break;
                }
            }
        }

        outgoing.flush(gss);
        stats.send_count = outgoing.send_message_count();
        drop(outgoing);
        // The write cache locks internally; this is the only cross-thread
        // touch point of a task's output.
        self.write_cache().merge_cache(local_incoming);
        stats.superstep_runtime_milli = started.elapsed().as_millis() as u64;
        self.worker_thread_done(thread_aggregators, stats);
    }

    /// Barrier accounting. The last task of the superstep finishes the
    /// round: freeze stats, clear the read cache, advance the expected
    /// gss and report to the conductor.
    fn worker_thread_done(&self, thread_aggregators: AggregatorRegistry, thread_stats: WorkerStats) {
        let mut barrier = self.barrier.lock();
        barrier.aggregators.merge_registry(&thread_aggregators);
        barrier.stats.accumulate(&thread_stats);

        if barrier.running_threads == 0 {
            warn!("worker.barrier.underflow");
            return;
        }
        barrier.running_threads -= 1;
        if barrier.running_threads > 0 {
            return;
        }
        self.barrier_idle.notify_all();

        // Of this superstep we can only be sure of what we received in the
        // last one and what we sent in this one; peers may still be
        // delivering into the write cache.
        let gss = self.state.current_gss();
        let read_cache = self.read_cache();
        barrier.stats.received_count = read_cache.received_message_count();
        read_cache.clear();
        self.state.expect_next_gss();

        if let Some(context) = self.worker_context.lock().as_mut() {
            context.post_global_superstep(gss, &mut barrier.aggregators);
        }

        let stats = barrier.stats;
        let aggregator_values = if barrier.aggregators.is_empty() {
            None
        } else {
            Some(barrier.aggregators.serialized_values())
        };
        barrier.stats.reset();
        drop(barrier);

        info!(
            gss,
            active = stats.active_count,
            sent = stats.send_count,
            received = stats.received_count,
            runtime_ms = stats.superstep_runtime_milli,
            "worker.gss.finished"
        );

        if !self.running.load(Ordering::SeqCst) {
            // finalize_execution already has the conductor's attention.
            info!(gss, "worker.barrier.report_suppressed");
            return;
        }

        let report = GssReport {
            sender: self.state.shards().local_location().worker_id.clone(),
            execution_number: self.state.execution_number(),
            gss,
            done: stats.all_zero(),
            stats,
            aggregator_values,
        };
        match serde_json::to_value(&report) {
            Ok(body) => {
                let path = format!(
                    "{}/{}",
                    protocol::base_path(self.state.database()),
                    FINISHED_GSS_PATH
                );
                self.transport
                    .deliver(self.state.coordinator_id(), &path, body);
            }
            Err(err) => warn!(gss, %err, "worker.report.serialize_failed"),
        }
    }
}

/// Split `[0, total)` into roughly `threads` equal ranges; the last range
/// absorbs the remainder. The task count is whatever this returns, never a
/// derived estimate, otherwise the barrier could fire early or never.
fn partition_ranges(total: usize, threads: usize) -> Vec<Range<usize>> {
    // An empty partition still runs one task so the barrier fires and the
    // conductor hears from this worker.
    if total == 0 {
        return vec![0..0];
    }
    let delta = (total / threads.max(1)).max(1);
    let mut ranges = Vec::new();
    let mut start = 0;
    while start < total {
        let end = if start + 2 * delta > total {
            total
        } else {
            start + delta
        };
        ranges.push(start..end);
        start = end;
    }
    ranges
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algos::{create_worker, SsspAlgorithm};
    use crate::graph::GraphBuilder;
    use crate::protocol::GraphSource;
    use crate::state::ShardMap;
    use serde_json::json;

    #[test]
    fn ranges_cover_everything_without_overlap() {
        for (total, threads) in [(10, 3), (4, 8), (5, 2), (1, 1), (97, 16), (16, 16)] {
            let ranges = partition_ranges(total, threads);
            let mut expected = 0;
            for range in &ranges {
                assert_eq!(range.start, expected, "total={total} threads={threads}");
                assert!(range.end > range.start);
                expected = range.end;
            }
            assert_eq!(expected, total);
            assert!(ranges.len() <= threads.max(1));
        }
    }

    #[test]
    fn empty_partition_still_gets_one_task() {
        assert_eq!(partition_ranges(0, 4), vec![0..0]);
    }

    #[test]
    fn remainder_goes_to_the_last_range() {
        let ranges = partition_ranges(10, 3);
        assert_eq!(ranges, vec![0..3, 3..6, 6..10]);
    }

    struct NullTransport;

    impl Transport for NullTransport {
        fn deliver(&self, _base_url: &str, _path: &str, _body: Value) {}
    }

    fn sssp_worker() -> Worker<u64, u64, u64> {
        let shards = ShardMap::single("w0", "http://w0");
        let mut builder = GraphBuilder::new(shards.clone());
        builder.add_vertex("v0", u64::MAX).unwrap();
        builder.add_vertex("v1", u64::MAX).unwrap();
        builder.add_edge("v0", "v1", 1).unwrap();
        let graph = builder.build().unwrap();

        let config = WorkerConfig {
            execution_number: 9,
            database: "db".into(),
            coordinator_id: "http://conductor".into(),
            algorithm: "sssp".into(),
            user_parameters: json!({"source": "v0"}),
            total_vertex_count: 2,
            total_edge_count: 1,
            shards,
            parallelism: Some(2),
            results_path: None,
            unknown_vertex_policy: UnknownVertexPolicy::Discard,
        };
        let algorithm = SsspAlgorithm::from_params(&config.user_parameters).unwrap();
        Worker::new(config, Box::new(algorithm), graph, Arc::new(NullTransport)).unwrap()
    }

    #[test]
    fn prepare_rejects_skipped_supersteps_without_mutation() {
        let worker = sssp_worker();
        let err = worker.prepare_global_step(PrepareGssRequest {
            gss: 2,
            aggregator_values: None,
        });
        assert!(matches!(err, Err(PregelError::BadParameter(_))));
        assert_eq!(worker.current_gss(), 0);
        assert_eq!(worker.expected_gss(), 0);
    }

    #[test]
    fn start_requires_the_prepared_superstep() {
        let worker = sssp_worker();
        worker
            .prepare_global_step(PrepareGssRequest {
                gss: 0,
                aggregator_values: None,
            })
            .unwrap();
        let err = worker.start_global_step(StartGssRequest { gss: 3 });
        assert!(matches!(err, Err(PregelError::BadParameter(_))));
    }

    #[test]
    fn stale_messages_leave_the_write_cache_untouched() {
        let worker = sssp_worker();
        let err = worker.received_messages(ReceivedMessagesRequest {
            gss: 4,
            messages: vec![("v1".into(), json!(3))],
        });
        assert!(matches!(err, Err(PregelError::OutOfSync { .. })));
        assert_eq!(worker.queued_message_count(), 0);
    }

    #[test]
    fn unknown_vertices_are_dropped_under_the_default_policy() {
        let worker = sssp_worker();
        worker
            .received_messages(ReceivedMessagesRequest {
                gss: 0,
                messages: vec![("v1".into(), json!(3)), ("ghost".into(), json!(1))],
            })
            .unwrap();
        assert_eq!(worker.queued_message_count(), 1);
    }

    #[test]
    fn factory_worker_rejects_messages_for_unknown_vertices_when_told_to() {
        let config = WorkerConfig {
            execution_number: 1,
            database: "db".into(),
            coordinator_id: "http://conductor".into(),
            algorithm: "sssp".into(),
            user_parameters: json!({"source": "v0"}),
            total_vertex_count: 1,
            total_edge_count: 0,
            shards: ShardMap::single("w0", "http://w0"),
            parallelism: Some(1),
            results_path: None,
            unknown_vertex_policy: UnknownVertexPolicy::Reject,
        };
        let source: GraphSource =
            serde_json::from_value(json!({"vertices": [{"id": "v0"}], "edges": []})).unwrap();
        let worker = create_worker(config, &source, Arc::new(NullTransport)).unwrap();
        let err = worker.received_messages(ReceivedMessagesRequest {
            gss: 0,
            messages: vec![("ghost".into(), json!(1))],
        });
        assert!(matches!(err, Err(PregelError::BadParameter(_))));
    }
}
