mod common;

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use serde_json::{json, Value};

use pregel::algos::{Algorithm, ComputeContext, VertexComputation};
use pregel::cache::{IncomingCache, MessageIterator};
use pregel::error::Result;
use pregel::graph::{GraphBuilder, GraphFormat};
use pregel::message::{JsonFormat, MessageFormat, SumCombiner};
use pregel::protocol::{FinalizeRequest, PrepareGssRequest, StartGssRequest, WorkerConfig};
use pregel::{PregelWorker, ShardMap, Worker};

/// Two peer deliveries and one task-local flush hammer the same vertex;
/// the sum combiner must still account for every message exactly once.
#[test]
fn concurrent_merges_preserve_the_arithmetic_sum() {
    let cache = Arc::new(IncomingCache::<f64>::new(
        Arc::new(JsonFormat::new()),
        Some(Arc::new(SumCombiner)),
    ));

    let batch: Vec<(String, Value)> = (0..1000).map(|_| ("v1".to_owned(), json!(1.0))).collect();
    let mut handles = Vec::new();
    for _ in 0..2 {
        let cache = Arc::clone(&cache);
        let batch = batch.clone();
        handles.push(thread::spawn(move || {
            cache.parse_messages(&batch).unwrap();
        }));
    }
    {
        let cache = Arc::clone(&cache);
        handles.push(thread::spawn(move || {
            let local =
                IncomingCache::<f64>::new(Arc::new(JsonFormat::new()), Some(Arc::new(SumCombiner)));
            for _ in 0..500 {
                local.push("v1", 1.0);
            }
            cache.merge_cache(local);
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    let messages = cache.get_messages("v1");
    assert_eq!(messages.len(), 1, "combiner keeps a single slot");
    assert!((messages.as_slice()[0] - 2500.0).abs() < 1e-9);
    assert_eq!(cache.received_message_count(), 2500);
}

struct SlowAlgorithm;

struct SlowGraphFormat;

impl GraphFormat<u64, u64> for SlowGraphFormat {
    fn vertex_value(&self, _vertex_id: &str, _raw: &Value) -> Result<u64> {
        Ok(0)
    }

    fn edge_value(&self, _raw: &Value) -> Result<u64> {
        Ok(0)
    }
}

struct SlowComputation;

impl VertexComputation<u64, u64, u64> for SlowComputation {
    fn compute(
        &mut self,
        _ctx: &mut ComputeContext<'_, '_, u64, u64, u64>,
        _messages: &mut MessageIterator<'_, u64>,
    ) -> Result<()> {
        thread::sleep(Duration::from_millis(5));
        Ok(())
    }
}

impl Algorithm<u64, u64, u64> for SlowAlgorithm {
    fn name(&self) -> &'static str {
        "slow"
    }

    fn graph_format(&self) -> Box<dyn GraphFormat<u64, u64>> {
        Box::new(SlowGraphFormat)
    }

    fn message_format(&self) -> Arc<dyn MessageFormat<u64>> {
        Arc::new(JsonFormat::new())
    }

    fn create_computation(&self, _gss: u64) -> Box<dyn VertexComputation<u64, u64, u64>> {
        Box::new(SlowComputation)
    }
}

#[test]
fn finalize_joins_a_running_superstep_without_reporting() {
    let shards = ShardMap::single("w0", "http://w0:8529");
    let mut builder = GraphBuilder::new(shards.clone());
    for i in 0..100 {
        builder.add_vertex(&format!("v{i}"), 0).unwrap();
    }
    let graph = builder.build().unwrap();

    let config = WorkerConfig {
        execution_number: 3,
        database: "graphdb".into(),
        coordinator_id: "http://conductor:8529".into(),
        algorithm: "slow".into(),
        user_parameters: Value::Null,
        total_vertex_count: 100,
        total_edge_count: 0,
        shards,
        parallelism: Some(2),
        results_path: None,
        unknown_vertex_policy: Default::default(),
    };
    let (transport, receiver) = common::channel_transport();
    let worker = Worker::new(config, Box::new(SlowAlgorithm), graph, transport).unwrap();

    worker
        .prepare_global_step(PrepareGssRequest {
            gss: 0,
            aggregator_values: None,
        })
        .unwrap();
    worker.start_global_step(StartGssRequest { gss: 0 }).unwrap();

    // Both range tasks are asleep inside their first vertices; at 5ms per
    // vertex and 50 vertices per range the superstep would need ~250ms.
    thread::sleep(Duration::from_millis(30));
    let finalize_started = Instant::now();
    worker
        .finalize_execution(FinalizeRequest {
            store_results: false,
        })
        .unwrap();
    // Tasks observe the cancel within one vertex, so the join is quick.
    assert!(finalize_started.elapsed() < Duration::from_secs(2));

    // The conductor asked for the teardown; no completion report may
    // follow it.
    match receiver.recv_timeout(Duration::from_millis(300)) {
        Err(_) => {}
        Ok(delivery) => panic!("unexpected delivery after finalize: {}", delivery.path),
    }

    assert!(worker.typed_results().is_some());
}
