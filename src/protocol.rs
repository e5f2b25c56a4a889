//! Wire bodies exchanged with the conductor and with peer workers.
//!
//! Every struct here maps onto a fixed JSON shape; field names are part of
//! the protocol and must not drift.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::state::ShardMap;
use crate::stats::WorkerStats;

/// Conductor endpoint receiving completion reports.
pub const FINISHED_GSS_PATH: &str = "finishedGSS";
/// Worker endpoint receiving peer message batches.
pub const MESSAGES_PATH: &str = "messages";

/// API prefix shared by all pregel endpoints of one database.
pub fn base_path(database: &str) -> String {
    format!("_db/{database}/_api/pregel")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrepareGssRequest {
    pub gss: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregator_values: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StartGssRequest {
    pub gss: u64,
}

/// A batch of `(vertexId, payload)` pairs for one superstep. The same shape
/// is used inbound (peer deliveries) and outbound (flushed batches).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceivedMessagesRequest {
    pub gss: u64,
    pub messages: Vec<(String, Value)>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeRequest {
    #[serde(default)]
    pub store_results: bool,
}

/// Completion report posted to the conductor when the superstep barrier
/// fires.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GssReport {
    pub sender: String,
    pub execution_number: u64,
    pub gss: u64,
    pub done: bool,
    #[serde(flatten)]
    pub stats: WorkerStats,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregator_values: Option<Map<String, Value>>,
}

/// What to do with messages addressed to a vertex this worker does not
/// hold.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnknownVertexPolicy {
    /// Drop the message silently.
    #[default]
    Discard,
    /// Fail the delivering call with a bad-parameter error.
    Reject,
}

/// Init config handed to the worker constructor by the conductor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerConfig {
    pub execution_number: u64,
    pub database: String,
    pub coordinator_id: String,
    pub algorithm: String,
    #[serde(default)]
    pub user_parameters: Value,
    pub total_vertex_count: u64,
    pub total_edge_count: u64,
    pub shards: ShardMap,
    /// Worker pool size; defaults to the host's logical CPU count.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallelism: Option<usize>,
    /// Where `finalize_execution(store_results: true)` persists results.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results_path: Option<PathBuf>,
    #[serde(default)]
    pub unknown_vertex_policy: UnknownVertexPolicy,
}

/// Local partition data the factory loads the graph store from. Loading
/// pipelines proper are out of scope; this is the handoff shape.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphSource {
    pub vertices: Vec<SourceVertex>,
    pub edges: Vec<SourceEdge>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceVertex {
    pub id: String,
    #[serde(default)]
    pub value: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceEdge {
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub value: Value,
}
