use std::sync::Arc;

use rustc_hash::FxHashMap;
use serde_json::Value;
use tracing::{trace, warn};

use super::{push_message, IncomingCache, MessageSlot};
use crate::message::{MessageCombiner, MessageFormat};
use crate::protocol::{self, ReceivedMessagesRequest, MESSAGES_PATH};
use crate::state::{ShardId, ShardMap};
use crate::transport::Transport;

/// Thread-local buffer for the messages one worker task produces.
///
/// Messages for the local shard shortcut straight into the bound
/// thread-local [`IncomingCache`]; everything else batches per destination
/// shard until [`flush`](Self::flush). No locking: one task owns one
/// instance.
pub struct OutgoingCache<'a, M> {
    shards: &'a ShardMap,
    database: &'a str,
    format: Arc<dyn MessageFormat<M>>,
    combiner: Option<Arc<dyn MessageCombiner<M>>>,
    local: &'a IncomingCache<M>,
    transport: &'a dyn Transport,
    remote: FxHashMap<ShardId, FxHashMap<String, MessageSlot<M>>>,
    sent: u64,
}

impl<'a, M> OutgoingCache<'a, M> {
    pub fn new(
        shards: &'a ShardMap,
        database: &'a str,
        format: Arc<dyn MessageFormat<M>>,
        combiner: Option<Arc<dyn MessageCombiner<M>>>,
        local: &'a IncomingCache<M>,
        transport: &'a dyn Transport,
    ) -> Self {
        Self {
            shards,
            database,
            format,
            combiner,
            local,
            transport,
            remote: FxHashMap::default(),
            sent: 0,
        }
    }

    pub fn send_to_vertex(&mut self, vertex_id: &str, message: M) {
        self.send_to_shard(self.shards.shard_for(vertex_id), vertex_id, message);
    }

    /// Like [`send_to_vertex`](Self::send_to_vertex) with the destination
    /// shard already known, e.g. from an edge's shard hint.
    pub fn send_to_shard(&mut self, shard: ShardId, vertex_id: &str, message: M) {
        self.sent += 1;
        if self.shards.is_local(shard) {
            self.local.push(vertex_id, message);
            return;
        }
        let batch = self.remote.entry(shard).or_default();
        push_message(
            batch.entry(vertex_id.to_owned()).or_default(),
            message,
            self.combiner.as_deref(),
        );
    }

    /// Hand every non-empty remote batch to the transport and clear it.
    /// Returns once all batches are submitted, not delivered.
    pub fn flush(&mut self, gss: u64) {
        if self.remote.is_empty() {
            return;
        }
        let path = format!("{}/{}", protocol::base_path(self.database), MESSAGES_PATH);
        for (shard, batch) in self.remote.drain() {
            if batch.is_empty() {
                continue;
            }
            let Some(location) = self.shards.location(shard) else {
                warn!(shard, "outgoing.flush.unknown_shard");
                continue;
            };
            let mut messages: Vec<(String, Value)> = Vec::new();
            for (vertex_id, slot) in batch {
                for message in &slot {
                    messages.push((vertex_id.clone(), self.format.serialize(message)));
                }
            }
            trace!(shard, count = messages.len(), url = %location.url, "outgoing.flush.batch");
            let body = ReceivedMessagesRequest { gss, messages };
            match serde_json::to_value(&body) {
                Ok(body) => self.transport.deliver(&location.url, &path, body),
                Err(err) => warn!(shard, %err, "outgoing.flush.serialize_failed"),
            }
        }
    }

    /// Total messages accepted, local shortcut and remote batches both.
    pub fn send_message_count(&self) -> u64 {
        self.sent
    }
}
