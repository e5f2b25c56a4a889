use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::xxh3_64;

use crate::error::{PregelError, Result};

pub type ShardId = u32;

/// Address of one worker in the execution: a stable id for completion
/// reports and the base URL peers use to deliver messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShardLocation {
    pub worker_id: String,
    pub url: String,
}

/// Placement of vertex ids onto worker shards.
///
/// Placement is by xxh3 of the vertex id modulo the shard count, so every
/// worker resolves the same id to the same shard without coordination.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShardMap {
    pub local_shard: ShardId,
    pub locations: Vec<ShardLocation>,
}

impl ShardMap {
    /// Single-worker layout, everything local.
    pub fn single(worker_id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            local_shard: 0,
            locations: vec![ShardLocation {
                worker_id: worker_id.into(),
                url: url.into(),
            }],
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.locations.is_empty() {
            return Err(PregelError::bad_parameter("shard map has no locations"));
        }
        if (self.local_shard as usize) >= self.locations.len() {
            return Err(PregelError::bad_parameter(format!(
                "local shard {} outside shard map of size {}",
                self.local_shard,
                self.locations.len()
            )));
        }
        Ok(())
    }

    pub fn shard_count(&self) -> usize {
        self.locations.len()
    }

    pub fn shard_for(&self, vertex_id: &str) -> ShardId {
        (xxh3_64(vertex_id.as_bytes()) % self.locations.len() as u64) as ShardId
    }

    pub fn is_local(&self, shard: ShardId) -> bool {
        shard == self.local_shard
    }

    pub fn location(&self, shard: ShardId) -> Option<&ShardLocation> {
        self.locations.get(shard as usize)
    }

    pub fn local_location(&self) -> &ShardLocation {
        &self.locations[self.local_shard as usize]
    }
}

/// Per-execution identity plus the superstep counters.
///
/// `current_gss` advances only inside `prepare_global_step`; `expected_gss`
/// advances only when the superstep barrier completes.
#[derive(Debug)]
pub struct WorkerState {
    database: String,
    execution_number: u64,
    coordinator_id: String,
    shards: ShardMap,
    current_gss: AtomicU64,
    expected_gss: AtomicU64,
}

impl WorkerState {
    pub fn new(
        database: impl Into<String>,
        execution_number: u64,
        coordinator_id: impl Into<String>,
        shards: ShardMap,
    ) -> Result<Self> {
        shards.validate()?;
        Ok(Self {
            database: database.into(),
            execution_number,
            coordinator_id: coordinator_id.into(),
            shards,
            current_gss: AtomicU64::new(0),
            expected_gss: AtomicU64::new(0),
        })
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn execution_number(&self) -> u64 {
        self.execution_number
    }

    pub fn coordinator_id(&self) -> &str {
        &self.coordinator_id
    }

    pub fn shards(&self) -> &ShardMap {
        &self.shards
    }

    pub fn current_gss(&self) -> u64 {
        self.current_gss.load(Ordering::SeqCst)
    }

    pub fn expected_gss(&self) -> u64 {
        self.expected_gss.load(Ordering::SeqCst)
    }

    pub(crate) fn enter_gss(&self, gss: u64) {
        self.current_gss.store(gss, Ordering::SeqCst);
    }

    pub(crate) fn expect_next_gss(&self) {
        self.expected_gss
            .store(self.current_gss() + 1, Ordering::SeqCst);
    }
}
