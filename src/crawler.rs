//! Pipeline coordinator: announce events in, deduplicated fetches out.
//!
//! One task owns the queue, the in-flight set, and every counter, so the
//! rest of the crate never touches shared mutable state (the recent-hash
//! cache is the single synchronized exception). Periodic work, like the
//! DHT walk and progress reporting, runs as interval ticks inside the
//! same select loop.

use crate::config::Config;
use crate::dht::{Announce, DhtProvider};
use crate::fetch::{FetchError, MetadataFetcher, TorrentMetadata};
use crate::infohash::InfoHash;
use crate::queue::FetchQueue;
use crate::recent::RecentHashCache;
use crate::scrape::ScrapeClient;
use crate::sink::MetadataSink;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Duration, Instant, MissedTickBehavior, interval};

#[derive(Debug, Clone)]
pub enum CrawlerEvent {
    Discovered(InfoHash),
    Indexed { hash: InfoHash, name: String },
    Status(String),
    Error(String),
    Progress { pending: usize, active: usize, indexed: u64 },
}

/// Read-only snapshot of the coordinator's counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct CrawlerStats {
    pub pending: usize,
    pub active: usize,
    pub indexed: u64,
    pub dropped: u64,
}

/// Walk throttle with explicit state: one timer consults it per tick and
/// the phase flips after each `period`, so there is no second timer racing
/// a shared flag.
struct DutyCycle {
    period: Duration,
    flipped_at: Instant,
    active: bool,
}

impl DutyCycle {
    fn new(period: Duration, start: Instant) -> Self {
        Self {
            period,
            flipped_at: start,
            active: true,
        }
    }

    fn allows(&mut self, now: Instant) -> bool {
        if now.duration_since(self.flipped_at) >= self.period {
            self.active = !self.active;
            self.flipped_at = now;
        }
        self.active
    }
}

pub struct CrawlerHandle {
    events: broadcast::Sender<CrawlerEvent>,
    stats: watch::Receiver<CrawlerStats>,
    scrape: ScrapeClient,
    shutdown: watch::Sender<bool>,
    coordinator: JoinHandle<()>,
    background: Vec<JoinHandle<()>>,
}

impl CrawlerHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<CrawlerEvent> {
        self.events.subscribe()
    }

    pub fn stats(&self) -> CrawlerStats {
        *self.stats.borrow()
    }

    /// Clone of the tracker scrape client, for liveness checks outside the
    /// fetch pipeline.
    pub fn scraper(&self) -> ScrapeClient {
        self.scrape.clone()
    }

    /// Stops the coordinator, aborting in-flight fetches and background
    /// tasks. Nothing partial reaches the sink: inserts only ever happen
    /// inside the coordinator, on completed fetches.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.coordinator.await;
        for task in self.background {
            task.abort();
        }
    }
}

/// Wires the pipeline together and spawns the coordinator task.
/// `background` carries collaborator tasks (the DHT socket reader) whose
/// lifetime should match the crawler's.
pub fn start(
    cfg: &Config,
    dht: Arc<dyn DhtProvider>,
    fetcher: Arc<dyn MetadataFetcher>,
    sink: Arc<dyn MetadataSink>,
    scrape: ScrapeClient,
    announce_rx: mpsc::Receiver<Announce>,
    background: Vec<JoinHandle<()>>,
) -> CrawlerHandle {
    let (events, _) = broadcast::channel(256);
    let (stats_tx, stats_rx) = watch::channel(CrawlerStats::default());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let coordinator = Coordinator {
        dht,
        fetcher,
        sink,
        recent: RecentHashCache::new(cfg.recent_hashes_cap),
        queue: FetchQueue::new(cfg.queue_limit),
        in_flight: HashSet::new(),
        fetch_tasks: HashMap::new(),
        active: 0,
        indexed: 0,
        max_concurrent: cfg.max_concurrent_fetches.max(1),
        walk_nodes_per_tick: cfg.walk_nodes_per_tick,
        walk_interval: Duration::from_millis(cfg.walk_interval_ms.max(1)),
        ignore_interval: Duration::from_millis(cfg.ignore_interval_ms.max(1)),
        progress_interval: Duration::from_secs(cfg.progress_every_secs.max(1)),
        events: events.clone(),
        stats_tx,
    };
    let task = tokio::spawn(coordinator.run(announce_rx, shutdown_rx));

    CrawlerHandle {
        events,
        stats: stats_rx,
        scrape,
        shutdown: shutdown_tx,
        coordinator: task,
        background,
    }
}

struct Coordinator {
    dht: Arc<dyn DhtProvider>,
    fetcher: Arc<dyn MetadataFetcher>,
    sink: Arc<dyn MetadataSink>,
    recent: RecentHashCache,
    queue: FetchQueue,
    in_flight: HashSet<InfoHash>,
    // Task id to hash, so a fetch that dies without returning (panic,
    // abort) can still be cleared from `in_flight`.
    fetch_tasks: HashMap<tokio::task::Id, InfoHash>,
    active: usize,
    indexed: u64,
    max_concurrent: usize,
    walk_nodes_per_tick: usize,
    walk_interval: Duration,
    ignore_interval: Duration,
    progress_interval: Duration,
    events: broadcast::Sender<CrawlerEvent>,
    stats_tx: watch::Sender<CrawlerStats>,
}

type FetchDone = (InfoHash, Result<TorrentMetadata, FetchError>);

impl Coordinator {
    async fn run(
        mut self,
        mut announce_rx: mpsc::Receiver<Announce>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let dht = self.dht.clone();
        let mut fetches: JoinSet<FetchDone> = JoinSet::new();
        let mut duty = DutyCycle::new(self.ignore_interval, Instant::now());

        let mut walk_tick = interval(self.walk_interval);
        walk_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut progress_tick = interval(self.progress_interval);
        progress_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        self.emit(CrawlerEvent::Status("active".into()));
        tracing::info!("crawler: started");

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = walk_tick.tick() => {
                    if duty.allows(Instant::now()) {
                        dht.walk_step(self.walk_nodes_per_tick).await;
                    }
                }
                _ = progress_tick.tick() => {
                    tracing::debug!(
                        pending = self.queue.pending(),
                        active = self.active,
                        indexed = self.indexed,
                        recent = self.recent.len(),
                        "crawler: progress"
                    );
                    self.emit(CrawlerEvent::Progress {
                        pending: self.queue.pending(),
                        active: self.active,
                        indexed: self.indexed,
                    });
                }
                announce = announce_rx.recv() => {
                    match announce {
                        Some(announce) => {
                            self.on_announce(announce);
                            self.drain(&mut fetches);
                        }
                        None => break,
                    }
                }
                Some(done) = fetches.join_next_with_id(), if !fetches.is_empty() => {
                    self.on_fetch_done(done);
                    self.drain(&mut fetches);
                }
            }
        }

        // Dropping the JoinSet aborts whatever is still in flight.
        drop(fetches);
        self.emit(CrawlerEvent::Status("stopped".into()));
        tracing::info!(indexed = self.indexed, "crawler: stopped");
    }

    fn on_announce(&mut self, announce: Announce) {
        self.emit(CrawlerEvent::Discovered(announce.hash));

        if self.recent.seen(&announce.hash) {
            return;
        }
        self.recent.record(announce.hash);
        if self.in_flight.contains(&announce.hash) {
            return;
        }
        if !self.queue.enqueue(announce.hash, announce.peer) {
            tracing::debug!(hash = %announce.hash.short(), "crawler: queue full, dropping");
        }
        self.publish_stats();
    }

    fn drain(&mut self, fetches: &mut JoinSet<FetchDone>) {
        while self.active < self.max_concurrent {
            let Some(mut pending) = self.queue.pop() else {
                break;
            };
            pending.attempts += 1;
            self.active += 1;
            self.in_flight.insert(pending.hash);
            tracing::trace!(
                hash = %pending.hash.short(),
                waited_ms = pending.enqueued_at.elapsed().as_millis() as u64,
                attempt = pending.attempts,
                "crawler: fetch started"
            );

            let fetcher = self.fetcher.clone();
            let task = fetches.spawn(async move {
                let result = fetcher.fetch(pending.hash, pending.peer_hint).await;
                (pending.hash, result)
            });
            self.fetch_tasks.insert(task.id(), pending.hash);
        }
        self.publish_stats();
    }

    fn on_fetch_done(
        &mut self,
        done: Result<(tokio::task::Id, FetchDone), tokio::task::JoinError>,
    ) {
        self.active = self.active.saturating_sub(1);
        let (hash, result) = match done {
            Ok((task_id, done)) => {
                self.fetch_tasks.remove(&task_id);
                done
            }
            Err(err) => {
                if let Some(hash) = self.fetch_tasks.remove(&err.id()) {
                    self.in_flight.remove(&hash);
                }
                if !err.is_cancelled() {
                    tracing::warn!(%err, "crawler: fetch task failed");
                }
                self.publish_stats();
                return;
            }
        };
        self.in_flight.remove(&hash);

        match result {
            Ok(meta) => match self.sink.insert(&meta) {
                Ok(()) => {
                    self.indexed += 1;
                    tracing::info!(hash = %hash.short(), name = %meta.name, "crawler: indexed");
                    self.emit(CrawlerEvent::Indexed {
                        hash,
                        name: meta.name,
                    });
                }
                Err(err) => {
                    // Rejection is the sink's prerogative; we do not retry.
                    self.emit(CrawlerEvent::Error(format!(
                        "sink rejected {}: {err}",
                        hash.short()
                    )));
                }
            },
            Err(err) => {
                tracing::debug!(hash = %hash.short(), %err, "crawler: fetch failed");
            }
        }
        self.publish_stats();
    }

    fn emit(&self, event: CrawlerEvent) {
        let _ = self.events.send(event);
    }

    fn publish_stats(&self) {
        self.stats_tx.send_replace(CrawlerStats {
            pending: self.queue.pending(),
            active: self.active,
            indexed: self.indexed,
            dropped: self.queue.dropped(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::time::sleep;

    fn hash(n: u8) -> InfoHash {
        InfoHash::new([n; 20])
    }

    fn test_config() -> Config {
        Config {
            output_path: "/tmp/unused".into(),
            dht_bind: "127.0.0.1:0".into(),
            dht_bootstrap: vec![],
            dht_max_known_nodes: 100,
            walk_interval_ms: 50,
            walk_nodes_per_tick: 4,
            ignore_interval_ms: 1_000,
            announce_buffer: 64,
            queue_limit: 100,
            max_concurrent_fetches: 10,
            recent_hashes_cap: 1_000,
            peers_per_hash: 4,
            peer_inflight: 2,
            peer_connect_timeout_secs: 1,
            fetch_timeout_secs: 2,
            progress_every_secs: 1,
            discovery_timeout_secs: 1,
            lookup_inflight: 2,
            lookup_max_queries: 4,
            lookup_query_timeout_ms: 100,
            lookup_recv_timeout_ms: 50,
            scrape_bind: "127.0.0.1:0".into(),
            scrape_timeout_secs: 1,
            scrape_sweep_every_secs: 1,
            scrape_after_index: false,
            trackers: vec![],
        }
    }

    struct NullDht;

    #[async_trait]
    impl DhtProvider for NullDht {
        async fn walk_step(&self, _max_nodes: usize) {}
        async fn find_peers(
            &self,
            _hash: InfoHash,
            _limit: usize,
        ) -> anyhow::Result<Vec<std::net::SocketAddr>> {
            Ok(vec![])
        }
    }

    struct MockFetcher {
        delay: Duration,
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    impl MockFetcher {
        fn new(delay: Duration) -> Self {
            Self {
                delay,
                active: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl MetadataFetcher for MockFetcher {
        async fn fetch(
            &self,
            hash: InfoHash,
            _peer_hint: Option<std::net::SocketAddr>,
        ) -> Result<TorrentMetadata, FetchError> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            sleep(self.delay).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(TorrentMetadata {
                hash,
                name: format!("torrent-{}", hash.short()),
                total_size: 1,
                piece_length: 1,
                files: vec![],
            })
        }
    }

    struct ChannelSink(mpsc::UnboundedSender<TorrentMetadata>);

    impl MetadataSink for ChannelSink {
        fn insert(&self, meta: &TorrentMetadata) -> anyhow::Result<()> {
            self.0.send(meta.clone())?;
            Ok(())
        }
    }

    async fn start_crawler<F: MetadataFetcher + 'static>(
        cfg: &Config,
        fetcher: Arc<F>,
    ) -> (
        CrawlerHandle,
        mpsc::Sender<Announce>,
        mpsc::UnboundedReceiver<TorrentMetadata>,
    ) {
        let (announce_tx, announce_rx) = mpsc::channel(cfg.announce_buffer);
        let (sink_tx, sink_rx) = mpsc::unbounded_channel();
        let scrape = ScrapeClient::bind(
            &cfg.scrape_bind,
            Duration::from_secs(cfg.scrape_timeout_secs),
            Duration::from_secs(cfg.scrape_sweep_every_secs),
            cfg.trackers.clone(),
        )
        .await
        .unwrap();

        let handle = start(
            cfg,
            Arc::new(NullDht),
            fetcher,
            Arc::new(ChannelSink(sink_tx)),
            scrape,
            announce_rx,
            vec![],
        );
        (handle, announce_tx, sink_rx)
    }

    #[tokio::test]
    async fn announce_to_sink_with_duplicates_suppressed() {
        let cfg = test_config();
        let fetcher = Arc::new(MockFetcher::new(Duration::from_millis(50)));
        let (handle, announce_tx, mut sink_rx) = start_crawler(&cfg, fetcher).await;

        let a = Announce {
            hash: hash(1),
            peer: Some("198.51.100.1:6881".parse().unwrap()),
        };
        announce_tx.send(a).await.unwrap();
        // Second announce for the same hash, different peer, before the
        // first fetch can have completed.
        announce_tx
            .send(Announce {
                hash: hash(1),
                peer: Some("198.51.100.2:6881".parse().unwrap()),
            })
            .await
            .unwrap();

        let meta = tokio::time::timeout(Duration::from_secs(2), sink_rx.recv())
            .await
            .expect("fetch should complete")
            .expect("sink should receive metadata");
        assert_eq!(meta.hash, hash(1));

        // No second insert for the duplicate.
        sleep(Duration::from_millis(200)).await;
        assert!(sink_rx.try_recv().is_err());
        assert_eq!(handle.stats().indexed, 1);

        handle.stop().await;
    }

    #[tokio::test]
    async fn active_fetches_never_exceed_the_cap() {
        let mut cfg = test_config();
        cfg.max_concurrent_fetches = 3;
        let fetcher = Arc::new(MockFetcher::new(Duration::from_millis(30)));
        let (handle, announce_tx, mut sink_rx) = start_crawler(&cfg, fetcher.clone()).await;

        for n in 0..20u8 {
            announce_tx
                .send(Announce {
                    hash: hash(n),
                    peer: None,
                })
                .await
                .unwrap();
        }

        let mut received = 0;
        while received < 20 {
            tokio::time::timeout(Duration::from_secs(5), sink_rx.recv())
                .await
                .expect("all fetches should complete")
                .expect("sink open");
            received += 1;
        }

        assert!(fetcher.peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(handle.stats().indexed, 20);
        handle.stop().await;
    }

    #[tokio::test]
    async fn queue_overflow_is_counted_not_buffered() {
        let mut cfg = test_config();
        cfg.max_concurrent_fetches = 1;
        cfg.queue_limit = 1;
        let fetcher = Arc::new(MockFetcher::new(Duration::from_millis(500)));
        let (handle, announce_tx, _sink_rx) = start_crawler(&cfg, fetcher).await;

        // First starts immediately, second occupies the single queue slot,
        // third overflows.
        for n in 1..=3u8 {
            announce_tx
                .send(Announce {
                    hash: hash(n),
                    peer: None,
                })
                .await
                .unwrap();
        }

        sleep(Duration::from_millis(100)).await;
        let stats = handle.stats();
        assert_eq!(stats.active, 1);
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.dropped, 1);
        handle.stop().await;
    }

    #[tokio::test]
    async fn stop_discards_in_flight_fetches() {
        let cfg = test_config();
        let fetcher = Arc::new(MockFetcher::new(Duration::from_secs(10)));
        let (handle, announce_tx, mut sink_rx) = start_crawler(&cfg, fetcher).await;

        announce_tx
            .send(Announce {
                hash: hash(9),
                peer: None,
            })
            .await
            .unwrap();
        sleep(Duration::from_millis(50)).await;
        assert_eq!(handle.stats().active, 1);

        handle.stop().await;
        // The aborted fetch must not produce an insert.
        assert!(sink_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn events_cover_discovery_and_indexing() {
        let cfg = test_config();
        let fetcher = Arc::new(MockFetcher::new(Duration::from_millis(10)));
        let (handle, announce_tx, mut sink_rx) = start_crawler(&cfg, fetcher).await;
        let mut events = handle.subscribe();

        announce_tx
            .send(Announce {
                hash: hash(7),
                peer: None,
            })
            .await
            .unwrap();
        sink_rx.recv().await.unwrap();

        let mut saw_discovered = false;
        let mut saw_indexed = false;
        while let Ok(event) = events.try_recv() {
            match event {
                CrawlerEvent::Discovered(h) if h == hash(7) => saw_discovered = true,
                CrawlerEvent::Indexed { hash: h, .. } if h == hash(7) => saw_indexed = true,
                _ => {}
            }
        }
        assert!(saw_discovered);
        assert!(saw_indexed);
        handle.stop().await;
    }

    /// Panics on the first fetch of hash(1), succeeds on everything else.
    struct FlakyFetcher {
        tripped: AtomicBool,
    }

    #[async_trait]
    impl MetadataFetcher for FlakyFetcher {
        async fn fetch(
            &self,
            h: InfoHash,
            _peer_hint: Option<std::net::SocketAddr>,
        ) -> Result<TorrentMetadata, FetchError> {
            if h == hash(1) && !self.tripped.swap(true, Ordering::SeqCst) {
                panic!("simulated fetch crash");
            }
            Ok(TorrentMetadata {
                hash: h,
                name: format!("torrent-{}", h.short()),
                total_size: 1,
                piece_length: 1,
                files: vec![],
            })
        }
    }

    #[tokio::test]
    async fn panicked_fetch_does_not_suppress_the_hash_forever() {
        let mut cfg = test_config();
        // A one-slot recent window, so a later announce can re-offer the
        // hash whose first fetch died.
        cfg.recent_hashes_cap = 1;
        let fetcher = Arc::new(FlakyFetcher {
            tripped: AtomicBool::new(false),
        });
        let (handle, announce_tx, mut sink_rx) = start_crawler(&cfg, fetcher).await;

        announce_tx
            .send(Announce {
                hash: hash(1),
                peer: None,
            })
            .await
            .unwrap();
        sleep(Duration::from_millis(100)).await;
        // The crashed task must not be counted as still active.
        assert_eq!(handle.stats().active, 0);

        // Evict hash(1) from the recent window, then announce it again.
        announce_tx
            .send(Announce {
                hash: hash(2),
                peer: None,
            })
            .await
            .unwrap();
        announce_tx
            .send(Announce {
                hash: hash(1),
                peer: None,
            })
            .await
            .unwrap();

        let mut indexed = Vec::new();
        for _ in 0..2 {
            let meta = tokio::time::timeout(Duration::from_secs(2), sink_rx.recv())
                .await
                .expect("retried fetch should reach the sink")
                .expect("sink open");
            indexed.push(meta.hash);
        }
        assert!(indexed.contains(&hash(1)));
        assert!(indexed.contains(&hash(2)));
        handle.stop().await;
    }

    #[test]
    fn duty_cycle_alternates_phases() {
        let start = Instant::now();
        let period = Duration::from_secs(1);
        let mut duty = DutyCycle::new(period, start);

        assert!(duty.allows(start));
        assert!(duty.allows(start + Duration::from_millis(500)));
        // Period elapsed: flips to the ignore phase.
        assert!(!duty.allows(start + period));
        assert!(!duty.allows(start + period + Duration::from_millis(500)));
        // And back on.
        assert!(duty.allows(start + period * 2));
    }
}
