//! Bounded cache of skipped message keys.
//!
//! Keys are indexed by `(ratchet key, counter)` and evicted oldest-inserted first once
//! the cache exceeds its capacity. Evicted slots leave a tombstone (bounded by the
//! same capacity) so a late message for such a slot is reported as
//! [`Error::MessageKeyEvicted`](crate::Error::MessageKeyEvicted) instead of looking
//! like a replay.
//!
//! When a tombstone expires it is folded into a per-chain watermark: every counter
//! below the watermark of a chain counts as evicted. Replays of messages that old are
//! reported as evicted too, since nothing remains to tell them apart.

use crate::crypto::SymmetricKey;
use crate::keys::PublicKey;
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::debug;

/// Identifies one message key: the sender's ratchet key and the chain counter
pub(crate) type Slot = (PublicKey, u32);

pub(crate) struct SkippedKeys {
    keys: HashMap<Slot, SymmetricKey>,
    order: VecDeque<Slot>,
    evicted: HashSet<Slot>,
    evicted_order: VecDeque<Slot>,
    /// Per ratchet key, counters below the value are treated as evicted
    watermarks: HashMap<PublicKey, u32>,
    watermark_order: VecDeque<PublicKey>,
    capacity: usize,
}

impl SkippedKeys {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            keys: HashMap::new(),
            order: VecDeque::new(),
            evicted: HashSet::new(),
            evicted_order: VecDeque::new(),
            watermarks: HashMap::new(),
            watermark_order: VecDeque::new(),
            capacity,
        }
    }

    pub(crate) fn get(&self, slot: &Slot) -> Option<&SymmetricKey> {
        self.keys.get(slot)
    }

    /// Removes a key once its message has been decrypted.
    pub(crate) fn remove(&mut self, slot: &Slot) -> Option<SymmetricKey> {
        let key = self.keys.remove(slot)?;
        if let Some(position) = self.order.iter().position(|queued| queued == slot) {
            self.order.remove(position);
        }
        Some(key)
    }

    pub(crate) fn is_evicted(&self, slot: &Slot) -> bool {
        self.evicted.contains(slot)
            || self
                .watermarks
                .get(&slot.0)
                .is_some_and(|&watermark| slot.1 < watermark)
    }

    /// Caches a key, evicting the oldest entries past capacity.
    pub(crate) fn insert(&mut self, slot: Slot, key: SymmetricKey) {
        if self.keys.insert(slot, key).is_none() {
            self.order.push_back(slot);
        }

        while self.keys.len() > self.capacity {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            self.keys.remove(&oldest);
            self.tombstone(oldest);
            debug!(
                target: "secure_session::skipped",
                counter = oldest.1,
                "evicted skipped message key"
            );
        }
    }

    fn tombstone(&mut self, slot: Slot) {
        if self.evicted.insert(slot) {
            self.evicted_order.push_back(slot);
        }
        while self.evicted.len() > self.capacity {
            let Some(oldest) = self.evicted_order.pop_front() else {
                break;
            };
            self.evicted.remove(&oldest);
            self.raise_watermark(oldest);
        }
    }

    fn raise_watermark(&mut self, (ratchet_key, counter): Slot) {
        let next = counter.saturating_add(1);
        match self.watermarks.get_mut(&ratchet_key) {
            Some(watermark) => *watermark = (*watermark).max(next),
            None => {
                self.watermarks.insert(ratchet_key, next);
                self.watermark_order.push_back(ratchet_key);
            }
        }
        while self.watermarks.len() > self.capacity.max(1) {
            let Some(oldest) = self.watermark_order.pop_front() else {
                break;
            };
            self.watermarks.remove(&oldest);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.keys.len()
    }

    pub(crate) fn clear(&mut self) {
        self.keys.clear();
        self.order.clear();
        self.evicted.clear();
        self.evicted_order.clear();
        self.watermarks.clear();
        self.watermark_order.clear();
    }
}
