use crate::infohash::InfoHash;
use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;
use std::time::Instant;

/// A metadata fetch waiting for a concurrency slot.
#[derive(Debug, Clone)]
pub struct PendingFetch {
    pub hash: InfoHash,
    pub peer_hint: Option<SocketAddr>,
    pub enqueued_at: Instant,
    pub attempts: u32,
}

/// Bounded FIFO of pending fetches, owned by the coordinator task.
///
/// Overflow is dropped and counted instead of growing without limit; a
/// fresh announce for the same hash later will re-queue it once the
/// recent-hash window has moved on.
pub struct FetchQueue {
    items: VecDeque<PendingFetch>,
    queued: HashSet<InfoHash>,
    limit: usize,
    dropped: u64,
}

impl FetchQueue {
    pub fn new(limit: usize) -> Self {
        Self {
            items: VecDeque::new(),
            queued: HashSet::new(),
            limit: limit.max(1),
            dropped: 0,
        }
    }

    /// False when the hash is already queued or the queue is full.
    pub fn enqueue(&mut self, hash: InfoHash, peer_hint: Option<SocketAddr>) -> bool {
        if self.queued.contains(&hash) {
            return false;
        }
        if self.items.len() >= self.limit {
            self.dropped += 1;
            return false;
        }
        self.queued.insert(hash);
        self.items.push_back(PendingFetch {
            hash,
            peer_hint,
            enqueued_at: Instant::now(),
            attempts: 0,
        });
        true
    }

    pub fn pop(&mut self) -> Option<PendingFetch> {
        let item = self.items.pop_front()?;
        self.queued.remove(&item.hash);
        Some(item)
    }

    pub fn pending(&self) -> usize {
        self.items.len()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}
