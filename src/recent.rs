use crate::infohash::InfoHash;
use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

/// Bounded dedup window over recently processed info hashes.
///
/// Announce callbacks can land on whatever task the DHT socket reader runs
/// on, so the cache is internally synchronized; contention is low (one
/// lock per announce). Eviction is strict insertion order: the set gives
/// O(1) membership, the queue gives O(1) oldest-first eviction.
pub struct RecentHashCache {
    inner: Mutex<Inner>,
    capacity: usize,
}

struct Inner {
    set: HashSet<InfoHash>,
    order: VecDeque<InfoHash>,
}

impl RecentHashCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                set: HashSet::with_capacity(capacity.min(4096)),
                order: VecDeque::with_capacity(capacity.min(4096)),
            }),
            capacity: capacity.max(1),
        }
    }

    pub fn seen(&self, hash: &InfoHash) -> bool {
        self.inner.lock().unwrap().set.contains(hash)
    }

    pub fn record(&self, hash: InfoHash) {
        let mut inner = self.inner.lock().unwrap();
        if !inner.set.insert(hash) {
            return;
        }
        inner.order.push_back(hash);
        while inner.order.len() > self.capacity {
            if let Some(oldest) = inner.order.pop_front() {
                inner.set.remove(&oldest);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().set.len()
    }
}
