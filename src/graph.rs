use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::Serialize;
use serde_json::Value;
use tracing::info;

use crate::error::{PregelError, Result};
use crate::protocol::GraphSource;
use crate::state::{ShardId, ShardMap};

/// Converts raw partition data into an algorithm's vertex and edge value
/// types while the graph store loads.
pub trait GraphFormat<V, E>: Send + Sync {
    fn vertex_value(&self, vertex_id: &str, raw: &Value) -> Result<V>;
    fn edge_value(&self, raw: &Value) -> Result<E>;
}

/// One local vertex. The value lives in the store's parallel value array;
/// the activity flag flips only through entry methods, by the thread that
/// owns the entry's range during compute.
pub struct VertexEntry {
    vertex_id: String,
    active: AtomicBool,
    shard: ShardId,
    value_slot: usize,
    edge_start: usize,
    edge_count: usize,
}

impl VertexEntry {
    pub fn vertex_id(&self) -> &str {
        &self.vertex_id
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::SeqCst);
    }

    pub fn shard(&self) -> ShardId {
        self.shard
    }

    pub fn value_slot(&self) -> usize {
        self.value_slot
    }
}

/// One outgoing edge. The target may live on another worker; `shard_hint`
/// caches its placement so sends skip re-hashing.
pub struct EdgeEntry<E> {
    to_vertex_id: String,
    value: E,
    shard_hint: ShardId,
}

impl<E> EdgeEntry<E> {
    pub fn to_vertex_id(&self) -> &str {
        &self.to_vertex_id
    }

    pub fn value(&self) -> &E {
        &self.value
    }

    pub fn shard_hint(&self) -> ShardId {
        self.shard_hint
    }
}

/// The worker's local partition: vertex entries, a parallel vertex-value
/// array and a flat edge array grouped by source vertex. Lives as long as
/// the execution.
///
/// Values sit behind per-slot mutexes. Compute tasks work on disjoint
/// entry ranges, so those locks are uncontended during a superstep; they
/// exist so the store can be shared across the pool without exclusive
/// borrows.
pub struct GraphStore<V, E> {
    entries: Vec<VertexEntry>,
    values: Vec<Mutex<V>>,
    edges: Vec<EdgeEntry<E>>,
    index: FxHashMap<String, usize>,
}

impl<V, E> GraphStore<V, E> {
    /// Load a partition through an algorithm's [`GraphFormat`].
    pub fn load(
        source: &GraphSource,
        format: &dyn GraphFormat<V, E>,
        shards: &ShardMap,
    ) -> Result<Self> {
        let mut builder = GraphBuilder::new(shards.clone());
        for vertex in &source.vertices {
            builder.add_vertex(&vertex.id, format.vertex_value(&vertex.id, &vertex.value)?)?;
        }
        for edge in &source.edges {
            builder.add_edge(&edge.from, &edge.to, format.edge_value(&edge.value)?)?;
        }
        builder.build()
    }

    pub fn vertex_count(&self) -> usize {
        self.entries.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn contains(&self, vertex_id: &str) -> bool {
        self.index.contains_key(vertex_id)
    }

    pub fn slot_of(&self, vertex_id: &str) -> Option<usize> {
        self.index.get(vertex_id).copied()
    }

    pub fn entry(&self, slot: usize) -> &VertexEntry {
        &self.entries[slot]
    }

    pub fn edges_of(&self, entry: &VertexEntry) -> &[EdgeEntry<E>] {
        &self.edges[entry.edge_start..entry.edge_start + entry.edge_count]
    }

    /// Entries for the half-open range `[start, end)`. Ranges handed to
    /// distinct worker tasks never overlap.
    pub fn vertex_iterator(&self, start: usize, end: usize) -> RangeIterator<'_> {
        let end = end.min(self.entries.len());
        let start = start.min(end);
        RangeIterator {
            entries: self.entries[start..end].iter(),
        }
    }
}

impl<V: Clone, E> GraphStore<V, E> {
    pub fn value_of(&self, entry: &VertexEntry) -> V {
        self.values[entry.value_slot].lock().clone()
    }

    pub fn set_value(&self, entry: &VertexEntry, value: V) {
        *self.values[entry.value_slot].lock() = value;
    }

    /// Snapshot of every vertex's final value.
    pub fn results(&self) -> Vec<(String, V)> {
        self.entries
            .iter()
            .map(|entry| {
                (
                    entry.vertex_id.clone(),
                    self.values[entry.value_slot].lock().clone(),
                )
            })
            .collect()
    }
}

impl<V: Clone + Serialize, E> GraphStore<V, E> {
    /// Persist results as JSON lines, one `{"vertex", "result"}` object per
    /// vertex.
    pub fn store_results(&self, path: &Path) -> Result<()> {
        #[derive(Serialize)]
        struct ResultLine<'a, V> {
            vertex: &'a str,
            result: V,
        }

        let mut out = BufWriter::new(File::create(path)?);
        for entry in &self.entries {
            let line = ResultLine {
                vertex: entry.vertex_id.as_str(),
                result: self.values[entry.value_slot].lock().clone(),
            };
            serde_json::to_writer(&mut out, &line)?;
            out.write_all(b"\n")?;
        }
        out.flush()?;
        info!(count = self.entries.len(), path = %path.display(), "graph.results.stored");
        Ok(())
    }
}

pub struct RangeIterator<'a> {
    entries: std::slice::Iter<'a, VertexEntry>,
}

impl<'a> Iterator for RangeIterator<'a> {
    type Item = &'a VertexEntry;

    fn next(&mut self) -> Option<Self::Item> {
        self.entries.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.entries.size_hint()
    }
}

/// Assembles a [`GraphStore`] from explicit vertex and edge inserts.
pub struct GraphBuilder<V, E> {
    shards: ShardMap,
    vertices: Vec<(String, V)>,
    index: FxHashMap<String, usize>,
    adjacency: FxHashMap<String, Vec<(String, E)>>,
    edge_total: usize,
}

impl<V, E> GraphBuilder<V, E> {
    pub fn new(shards: ShardMap) -> Self {
        Self {
            shards,
            vertices: Vec::new(),
            index: FxHashMap::default(),
            adjacency: FxHashMap::default(),
            edge_total: 0,
        }
    }

    pub fn add_vertex(&mut self, vertex_id: &str, value: V) -> Result<()> {
        if self.index.contains_key(vertex_id) {
            return Err(PregelError::bad_parameter(format!(
                "duplicate vertex {vertex_id}"
            )));
        }
        self.index.insert(vertex_id.to_owned(), self.vertices.len());
        self.vertices.push((vertex_id.to_owned(), value));
        Ok(())
    }

    /// The source must be a local vertex; the target may be anywhere.
    pub fn add_edge(&mut self, from: &str, to: &str, value: E) -> Result<()> {
        if !self.index.contains_key(from) {
            return Err(PregelError::bad_parameter(format!(
                "edge source {from} is not a local vertex"
            )));
        }
        self.adjacency
            .entry(from.to_owned())
            .or_default()
            .push((to.to_owned(), value));
        self.edge_total += 1;
        Ok(())
    }

    pub fn build(self) -> Result<GraphStore<V, E>> {
        let GraphBuilder {
            shards,
            vertices,
            index,
            mut adjacency,
            edge_total,
        } = self;
        let mut entries = Vec::with_capacity(vertices.len());
        let mut values = Vec::with_capacity(vertices.len());
        let mut edges = Vec::with_capacity(edge_total);

        for (slot, (vertex_id, value)) in vertices.into_iter().enumerate() {
            let outgoing = adjacency.remove(&vertex_id).unwrap_or_default();
            let edge_start = edges.len();
            for (to, edge_value) in outgoing {
                let shard_hint = shards.shard_for(&to);
                edges.push(EdgeEntry {
                    to_vertex_id: to,
                    value: edge_value,
                    shard_hint,
                });
            }
            entries.push(VertexEntry {
                shard: shards.shard_for(&vertex_id),
                vertex_id,
                active: AtomicBool::new(true),
                value_slot: slot,
                edge_start,
                edge_count: edges.len() - edge_start,
            });
            values.push(Mutex::new(value));
        }

        Ok(GraphStore {
            entries,
            values,
            edges,
            index,
        })
    }
}
