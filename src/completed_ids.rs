use std::collections::VecDeque;
use rustc_hash::FxHashMap;
use tracing::trace;

/// A bounded record of recently finished message ids, oldest entries being evicted first.
///
/// An id in this cache was fully processed - sent and acknowledged, or received and dispatched.
///  It must neither start a new receive nor be reused for a new send while it is here. For
///  received messages, the final length is stored to allow re-sending a final ack that got lost.
pub struct CompletedIdCache {
    capacity: usize,
    insertion_order: VecDeque<u32>,
    final_lengths: FxHashMap<u32, Option<u32>>,
}

impl CompletedIdCache {
    pub fn new(capacity: usize) -> CompletedIdCache {
        assert!(capacity > 0);
        CompletedIdCache {
            capacity,
            insertion_order: VecDeque::with_capacity(capacity),
            final_lengths: FxHashMap::default(),
        }
    }

    /// NB: Re-inserting an id updates its final length but keeps its position in the eviction order
    pub fn insert(&mut self, message_id: u32, final_len: Option<u32>) {
        if let Some(existing) = self.final_lengths.get_mut(&message_id) {
            *existing = final_len;
            return;
        }

        if self.insertion_order.len() >= self.capacity {
            if let Some(evicted) = self.insertion_order.pop_front() {
                trace!("evicting message id {} from completed id cache", evicted);
                self.final_lengths.remove(&evicted);
            }
        }

        self.insertion_order.push_back(message_id);
        self.final_lengths.insert(message_id, final_len);
    }

    pub fn contains(&self, message_id: u32) -> bool {
        self.final_lengths.contains_key(&message_id)
    }

    /// The final length if the id is present and a length was recorded for it
    pub fn final_len(&self, message_id: u32) -> Option<u32> {
        self.final_lengths.get(&message_id)
            .cloned()
            .flatten()
    }

    pub fn len(&self) -> usize {
        self.insertion_order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.insertion_order.is_empty()
    }
}
