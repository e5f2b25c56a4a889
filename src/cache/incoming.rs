use std::sync::Arc;

use parking_lot::{MappedRwLockReadGuard, RwLock, RwLockReadGuard};
use rustc_hash::FxHashMap;
use serde_json::Value;

use super::{push_message, MessageSlot};
use crate::error::Result;
use crate::message::{MessageCombiner, MessageFormat};

struct CacheState<M> {
    slots: FxHashMap<String, MessageSlot<M>>,
    received: u64,
}

/// Per-vertex message buffer for one superstep.
///
/// Two instances exist per worker and swap roles at every
/// `prepare_global_step`: the read cache feeds vertex programs while the
/// write cache absorbs peer deliveries and local flushes for the next
/// superstep. Worker tasks additionally build short-lived thread-local
/// instances that are poured into the write cache when their range ends.
///
/// Writers exclude each other through the internal lock; readers share it,
/// which is safe during compute because the read and write caches are
/// distinct objects.
pub struct IncomingCache<M> {
    format: Arc<dyn MessageFormat<M>>,
    combiner: Option<Arc<dyn MessageCombiner<M>>>,
    state: RwLock<CacheState<M>>,
}

impl<M> IncomingCache<M> {
    pub fn new(
        format: Arc<dyn MessageFormat<M>>,
        combiner: Option<Arc<dyn MessageCombiner<M>>>,
    ) -> Self {
        Self {
            format,
            combiner,
            state: RwLock::new(CacheState {
                slots: FxHashMap::default(),
                received: 0,
            }),
        }
    }

    /// Append-or-combine a batch of `(vertex_id, payload)` pairs.
    ///
    /// The whole batch is parsed before anything is merged, so a malformed
    /// payload rejects the call with the cache unchanged.
    pub fn parse_messages(&self, pairs: &[(String, Value)]) -> Result<()> {
        let mut parsed = Vec::with_capacity(pairs.len());
        for (vertex_id, payload) in pairs {
            parsed.push((vertex_id.as_str(), self.format.parse(payload)?));
        }
        let mut state = self.state.write();
        for (vertex_id, message) in parsed {
            push_message(
                state.slots.entry(vertex_id.to_owned()).or_default(),
                message,
                self.combiner.as_deref(),
            );
            state.received += 1;
        }
        Ok(())
    }

    /// Single-message entry point for the outgoing cache's local shortcut.
    pub fn push(&self, vertex_id: &str, message: M) {
        let mut state = self.state.write();
        push_message(
            state.slots.entry(vertex_id.to_owned()).or_default(),
            message,
            self.combiner.as_deref(),
        );
        state.received += 1;
    }

    /// Pour another cache into this one, preserving combiner semantics and
    /// accumulating its received count.
    pub fn merge_cache(&self, other: IncomingCache<M>) {
        let incoming = other.state.into_inner();
        let mut state = self.state.write();
        for (vertex_id, slot) in incoming.slots {
            match state.slots.entry(vertex_id) {
                std::collections::hash_map::Entry::Vacant(entry) => {
                    entry.insert(slot);
                }
                std::collections::hash_map::Entry::Occupied(mut entry) => {
                    for message in slot {
                        push_message(entry.get_mut(), message, self.combiner.as_deref());
                    }
                }
            }
        }
        state.received += incoming.received;
    }

    /// Restartable iterator over the vertex's messages. Safe while no
    /// writer mutates this cache, which holds during compute because tasks
    /// only read the read cache.
    pub fn get_messages(&self, vertex_id: &str) -> MessageIterator<'_, M> {
        let slice = RwLockReadGuard::map(self.state.read(), |state| {
            state
                .slots
                .get(vertex_id)
                .map(|slot| slot.as_slice())
                .unwrap_or(&[])
        });
        MessageIterator { slice, pos: 0 }
    }

    pub fn received_message_count(&self) -> u64 {
        self.state.read().received
    }

    pub fn clear(&self) {
        let mut state = self.state.write();
        state.slots.clear();
        state.received = 0;
    }
}

/// Lazy view over one vertex's messages for a superstep. Holds the cache's
/// read lock for its lifetime.
pub struct MessageIterator<'a, M> {
    slice: MappedRwLockReadGuard<'a, [M]>,
    pos: usize,
}

impl<'a, M> MessageIterator<'a, M> {
    pub fn next(&mut self) -> Option<&M> {
        let message = self.slice.get(self.pos)?;
        self.pos += 1;
        Some(message)
    }

    pub fn restart(&mut self) {
        self.pos = 0;
    }

    pub fn len(&self) -> usize {
        self.slice.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slice.is_empty()
    }

    pub fn as_slice(&self) -> &[M] {
        &self.slice
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{JsonFormat, MinCombiner};
    use serde_json::json;

    fn combined_cache() -> IncomingCache<u64> {
        IncomingCache::new(Arc::new(JsonFormat::new()), Some(Arc::new(MinCombiner)))
    }

    fn listed_cache() -> IncomingCache<u64> {
        IncomingCache::new(Arc::new(JsonFormat::new()), None)
    }

    #[test]
    fn combiner_keeps_exactly_one_message_per_vertex() {
        let cache = combined_cache();
        cache
            .parse_messages(&[
                ("v1".into(), json!(9)),
                ("v1".into(), json!(4)),
                ("v1".into(), json!(6)),
            ])
            .unwrap();
        let mut messages = cache.get_messages("v1");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages.next(), Some(&4));
        assert_eq!(messages.next(), None);
        assert_eq!(cache.received_message_count(), 3);
    }

    #[test]
    fn without_combiner_all_messages_are_kept() {
        let cache = listed_cache();
        cache
            .parse_messages(&[("v1".into(), json!(9)), ("v1".into(), json!(4))])
            .unwrap();
        cache.push("v1", 6);
        let messages = cache.get_messages("v1");
        let mut seen: Vec<u64> = messages.as_slice().to_vec();
        seen.sort_unstable();
        assert_eq!(seen, vec![4, 6, 9]);
    }

    #[test]
    fn iterator_is_restartable_and_empty_for_unknown_vertices() {
        let cache = combined_cache();
        cache.push("v1", 2);
        let mut messages = cache.get_messages("v1");
        assert_eq!(messages.next(), Some(&2));
        assert_eq!(messages.next(), None);
        messages.restart();
        assert_eq!(messages.next(), Some(&2));

        let messages = cache.get_messages("v404");
        assert!(messages.is_empty());
    }

    #[test]
    fn malformed_batch_leaves_cache_unchanged() {
        let cache = combined_cache();
        cache.push("v1", 5);
        let err = cache.parse_messages(&[("v1".into(), json!(1)), ("v2".into(), json!("bad"))]);
        assert!(err.is_err());
        assert_eq!(cache.received_message_count(), 1);
        assert_eq!(cache.get_messages("v1").as_slice(), &[5]);
        assert!(cache.get_messages("v2").is_empty());
    }

    #[test]
    fn merge_combines_slots_and_counts() {
        let target = combined_cache();
        target.push("v1", 10);
        target.push("v2", 3);

        let local = combined_cache();
        local.push("v1", 2);
        local.push("v3", 8);

        target.merge_cache(local);
        assert_eq!(target.get_messages("v1").as_slice(), &[2]);
        assert_eq!(target.get_messages("v2").as_slice(), &[3]);
        assert_eq!(target.get_messages("v3").as_slice(), &[8]);
        assert_eq!(target.received_message_count(), 4);
    }

    #[test]
    fn clear_resets_slots_and_count() {
        let cache = combined_cache();
        cache.push("v1", 1);
        cache.clear();
        assert_eq!(cache.received_message_count(), 0);
        assert!(cache.get_messages("v1").is_empty());
    }
}
