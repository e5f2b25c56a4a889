//! The two-phase message caches. Incoming caches hold a superstep's input
//! per vertex; outgoing caches batch a task's output per destination shard.

mod incoming;
mod outgoing;

pub use incoming::{IncomingCache, MessageIterator};
pub use outgoing::OutgoingCache;

use smallvec::SmallVec;

use crate::message::MessageCombiner;

/// Per-vertex storage: exactly one message when a combiner is set (updated
/// in place), otherwise a list with no ordering guarantee.
pub(crate) type MessageSlot<M> = SmallVec<[M; 1]>;

pub(crate) fn push_message<M>(
    slot: &mut MessageSlot<M>,
    message: M,
    combiner: Option<&dyn MessageCombiner<M>>,
) {
    match combiner {
        Some(combiner) if !slot.is_empty() => combiner.combine(&mut slot[0], message),
        _ => slot.push(message),
    }
}
