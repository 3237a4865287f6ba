//! BEP 15 UDP tracker scrape client.
//!
//! One shared UDP socket serves every tracker; responses are demultiplexed
//! purely by transaction id. An actor task owns the pending-request map and
//! runs the connect/scrape handshake; callers get exactly one
//! `TrackerScrapeResult` per scrape, either from a response, a protocol
//! error, or the periodic timeout sweep.

use crate::infohash::InfoHash;
use anyhow::Context;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::{UdpSocket, lookup_host};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Duration, interval};

/// BEP 15 magic, a single 64-bit big-endian field on the wire.
pub const PROTOCOL_ID: u64 = 0x41727101980;

const ACTION_CONNECT: u32 = 0;
const ACTION_SCRAPE: u32 = 2;
const ACTION_ERROR: u32 = 3;

const CONNECT_RESPONSE_LEN: usize = 16;
// 8-byte header plus one (seeders, completed, leechers) triplet.
const SCRAPE_RESPONSE_LEN: usize = 20;

/// Outcome of one scrape attempt against one tracker, or the reduced
/// outcome of a multi-tracker fan-out.
#[derive(Debug, Clone, Default)]
pub struct TrackerScrapeResult {
    pub tracker: String,
    pub seeders: u32,
    pub completed: u32,
    pub leechers: u32,
    pub success: bool,
    pub error: Option<String>,
}

impl TrackerScrapeResult {
    fn failed(tracker: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            tracker: tracker.into(),
            success: false,
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

/// Handle to the scrape actor. Cheap to clone; dropping every handle stops
/// the actor.
#[derive(Clone)]
pub struct ScrapeClient {
    cmd_tx: mpsc::Sender<ScrapeCmd>,
    trackers: Arc<Vec<String>>,
    timeout: Duration,
}

struct ScrapeCmd {
    hash: InfoHash,
    tracker: String,
    addr: SocketAddr,
    reply: oneshot::Sender<TrackerScrapeResult>,
}

impl ScrapeClient {
    /// Binds the shared UDP socket and spawns the actor. A bind failure is
    /// fatal: the caller gets the error immediately and no task is spawned.
    pub async fn bind(
        bind: &str,
        timeout: Duration,
        sweep_every: Duration,
        trackers: Vec<String>,
    ) -> anyhow::Result<Self> {
        let socket = UdpSocket::bind(bind)
            .await
            .with_context(|| format!("bind scrape socket on {bind}"))?;
        if let Ok(addr) = socket.local_addr() {
            tracing::info!(bind = %addr, "scrape: listening");
        }

        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        tokio::spawn(run(socket, cmd_rx, timeout, sweep_every));

        Ok(Self {
            cmd_tx,
            trackers: Arc::new(trackers),
            timeout,
        })
    }

    /// Scrape one tracker. Resolves exactly once; never panics the caller
    /// on tracker misbehavior.
    pub async fn scrape(&self, host: &str, port: u16, hash: InfoHash) -> TrackerScrapeResult {
        let tracker = format!("{host}:{port}");

        let addr = match lookup_host(tracker.as_str()).await {
            Ok(mut addrs) => match addrs.next() {
                Some(addr) => addr,
                None => return TrackerScrapeResult::failed(&tracker, "DNS returned no addresses"),
            },
            Err(err) => {
                return TrackerScrapeResult::failed(&tracker, format!("DNS resolution failed: {err}"));
            }
        };

        let (reply, rx) = oneshot::channel();
        let cmd = ScrapeCmd {
            hash,
            tracker: tracker.clone(),
            addr,
            reply,
        };
        if self.cmd_tx.send(cmd).await.is_err() {
            return TrackerScrapeResult::failed(&tracker, "scrape client stopped");
        }

        // The sweep resolves stragglers; the outer guard only covers the
        // actor disappearing mid-request.
        match tokio::time::timeout(self.timeout + Duration::from_secs(5), rx).await {
            Ok(Ok(result)) => result,
            _ => TrackerScrapeResult::failed(&tracker, "scrape client stopped"),
        }
    }

    /// Fan a scrape out to every configured tracker and reduce the
    /// successes to the best available lower bound of swarm size.
    pub async fn scrape_multiple(&self, hash: InfoHash) -> TrackerScrapeResult {
        let mut join_set = tokio::task::JoinSet::new();
        for tracker in self.trackers.iter() {
            let Some((host, port)) = split_host_port(tracker) else {
                tracing::debug!(tracker = %tracker, "scrape: skipping malformed tracker entry");
                continue;
            };
            let client = self.clone();
            join_set.spawn(async move { client.scrape(&host, port, hash).await });
        }

        if join_set.is_empty() {
            return TrackerScrapeResult::failed("", "no trackers configured");
        }

        let mut results = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            if let Ok(result) = joined {
                results.push(result);
            }
        }
        reduce_results(results)
    }

    /// Common open trackers that answer UDP scrapes.
    pub fn default_trackers() -> Vec<String> {
        [
            "tracker.opentrackr.org:1337",
            "tracker.openbittorrent.com:6969",
            "open.stealth.si:80",
            "tracker.torrent.eu.org:451",
            "exodus.desync.com:6969",
            "tracker.tiny-vps.com:6969",
            "tracker.moeking.me:6969",
            "opentracker.i2p.rocks:6969",
        ]
        .into_iter()
        .map(str::to_string)
        .collect()
    }
}

fn split_host_port(tracker: &str) -> Option<(String, u16)> {
    let (host, port) = tracker.rsplit_once(':')?;
    if host.is_empty() {
        return None;
    }
    Some((host.to_string(), port.parse().ok()?))
}

/// Independent trackers see partial views of the same swarm and scrape
/// responses carry no peer identities, so results cannot be deduplicated;
/// the maximum seeder count (ties broken by leechers) is the best
/// lower-bound estimate.
fn reduce_results(results: Vec<TrackerScrapeResult>) -> TrackerScrapeResult {
    let mut best: Option<TrackerScrapeResult> = None;
    for r in results.into_iter().filter(|r| r.success) {
        best = match best {
            Some(b) if (b.seeders, b.leechers) >= (r.seeders, r.leechers) => Some(b),
            _ => Some(r),
        };
    }
    best.unwrap_or_else(|| TrackerScrapeResult::failed("", "no tracker responded"))
}

async fn run(
    socket: UdpSocket,
    mut cmd_rx: mpsc::Receiver<ScrapeCmd>,
    timeout: Duration,
    sweep_every: Duration,
) {
    let mut pending = PendingMap::default();
    let mut sweep = interval(sweep_every);
    let mut buf = vec![0u8; 2048];

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else {
                    // Every handle dropped; outstanding oneshots resolve as
                    // cancelled on the caller side.
                    break;
                };
                let addr = cmd.addr;
                let tx = pending.register(cmd.hash, cmd.tracker, addr, cmd.reply);
                if let Err(err) = socket.send_to(&encode_connect(tx), addr).await {
                    pending.complete(tx, |tracker| {
                        TrackerScrapeResult::failed(tracker, format!("send failed: {err}"))
                    });
                }
            }
            recv = socket.recv_from(&mut buf) => {
                let Ok((n, _from)) = recv else {
                    continue;
                };
                if let Wire::SendScrape { addr, packet } = pending.on_datagram(&buf[..n]) {
                    let _ = socket.send_to(&packet, addr).await;
                }
            }
            _ = sweep.tick() => {
                let expired = pending.sweep(timeout);
                if expired > 0 {
                    tracing::debug!(expired, "scrape: expired pending requests");
                }
            }
        }
    }
}

// ---- wire codec ----

fn encode_connect(tx: u32) -> [u8; 16] {
    let mut out = [0u8; 16];
    out[..8].copy_from_slice(&PROTOCOL_ID.to_be_bytes());
    out[8..12].copy_from_slice(&ACTION_CONNECT.to_be_bytes());
    out[12..16].copy_from_slice(&tx.to_be_bytes());
    out
}

fn encode_scrape(connection_id: u64, tx: u32, hash: &InfoHash) -> [u8; 36] {
    let mut out = [0u8; 36];
    out[..8].copy_from_slice(&connection_id.to_be_bytes());
    out[8..12].copy_from_slice(&ACTION_SCRAPE.to_be_bytes());
    out[12..16].copy_from_slice(&tx.to_be_bytes());
    out[16..36].copy_from_slice(hash.as_bytes());
    out
}

fn decode_header(buf: &[u8]) -> Option<(u32, u32)> {
    if buf.len() < 8 {
        return None;
    }
    let action = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    let tx = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
    Some((action, tx))
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn read_u64(buf: &[u8], at: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[at..at + 8]);
    u64::from_be_bytes(b)
}

// ---- pending-request state (pure, separately testable) ----

struct Pending {
    hash: InfoHash,
    tracker: String,
    addr: SocketAddr,
    connection_id: Option<u64>,
    created: Instant,
    reply: Option<oneshot::Sender<TrackerScrapeResult>>,
}

enum Wire {
    /// CONNECT handshake finished; ship the scrape request.
    SendScrape { addr: SocketAddr, packet: [u8; 36] },
    /// Request resolved (success, protocol error, or tracker error).
    Done,
    /// Stray, duplicate, or unparseable datagram; nothing changed.
    Ignored,
}

#[derive(Default)]
struct PendingMap {
    map: HashMap<u32, Pending>,
}

impl PendingMap {
    /// Registers under a fresh transaction id, re-drawing on collision so
    /// ids stay unique among all outstanding requests.
    fn register(
        &mut self,
        hash: InfoHash,
        tracker: String,
        addr: SocketAddr,
        reply: oneshot::Sender<TrackerScrapeResult>,
    ) -> u32 {
        let tx = self.fresh_tx();
        self.map.insert(
            tx,
            Pending {
                hash,
                tracker,
                addr,
                connection_id: None,
                created: Instant::now(),
                reply: Some(reply),
            },
        );
        tx
    }

    fn fresh_tx(&self) -> u32 {
        loop {
            let tx = rand::random::<u32>();
            if !self.map.contains_key(&tx) {
                return tx;
            }
        }
    }

    fn on_datagram(&mut self, buf: &[u8]) -> Wire {
        let Some((action, tx)) = decode_header(buf) else {
            return Wire::Ignored;
        };
        if !self.map.contains_key(&tx) {
            // UDP delivers strays, duplicates, and late packets; anything
            // we cannot correlate is dropped without touching state.
            return Wire::Ignored;
        }

        let connected = self.map[&tx].connection_id.is_some();
        match action {
            ACTION_CONNECT if !connected => self.on_connect_response(tx, buf),
            ACTION_SCRAPE if connected => self.on_scrape_response(tx, buf),
            ACTION_ERROR => {
                let message = if buf.len() > 8 {
                    String::from_utf8_lossy(&buf[8..]).into_owned()
                } else {
                    "tracker returned error".to_string()
                };
                self.complete(tx, |tracker| TrackerScrapeResult::failed(tracker, message));
                Wire::Done
            }
            other => {
                self.complete(tx, |tracker| {
                    TrackerScrapeResult::failed(tracker, format!("unexpected action {other}"))
                });
                Wire::Done
            }
        }
    }

    fn on_connect_response(&mut self, tx: u32, buf: &[u8]) -> Wire {
        if buf.len() < CONNECT_RESPONSE_LEN {
            self.complete(tx, |tracker| {
                TrackerScrapeResult::failed(tracker, "short connect response")
            });
            return Wire::Done;
        }
        let connection_id = read_u64(buf, 8);

        // The scrape gets its own transaction id; re-key the request so
        // correlation keeps working.
        let Some(mut entry) = self.map.remove(&tx) else {
            return Wire::Ignored;
        };
        entry.connection_id = Some(connection_id);
        let addr = entry.addr;
        let scrape_tx = self.fresh_tx();
        let packet = encode_scrape(connection_id, scrape_tx, &entry.hash);
        self.map.insert(scrape_tx, entry);
        Wire::SendScrape { addr, packet }
    }

    fn on_scrape_response(&mut self, tx: u32, buf: &[u8]) -> Wire {
        if buf.len() < SCRAPE_RESPONSE_LEN {
            self.complete(tx, |tracker| {
                TrackerScrapeResult::failed(tracker, "short scrape response")
            });
            return Wire::Done;
        }
        let seeders = read_u32(buf, 8);
        let completed = read_u32(buf, 12);
        let leechers = read_u32(buf, 16);
        self.complete(tx, |tracker| TrackerScrapeResult {
            tracker: tracker.to_string(),
            seeders,
            completed,
            leechers,
            success: true,
            error: None,
        });
        Wire::Done
    }

    /// Removes the request and resolves its caller. Removal is what makes
    /// every request complete exactly once.
    fn complete(&mut self, tx: u32, make: impl FnOnce(&str) -> TrackerScrapeResult) {
        let Some(mut entry) = self.map.remove(&tx) else {
            return;
        };
        let result = make(&entry.tracker);
        if !result.success {
            tracing::debug!(
                tracker = %entry.tracker,
                hash = %entry.hash.short(),
                error = result.error.as_deref().unwrap_or(""),
                "scrape: failed"
            );
        }
        if let Some(reply) = entry.reply.take() {
            let _ = reply.send(result);
        }
    }

    /// Expires requests older than `timeout`. Each expired request is
    /// reported as a failure once; later sweeps cannot see it again.
    fn sweep(&mut self, timeout: Duration) -> usize {
        let now = Instant::now();
        let expired: Vec<u32> = self
            .map
            .iter()
            .filter(|(_, p)| now.duration_since(p.created) >= timeout)
            .map(|(tx, _)| *tx)
            .collect();
        let count = expired.len();
        for tx in expired {
            self.complete(tx, |tracker| {
                TrackerScrapeResult::failed(tracker, "request timed out")
            });
        }
        count
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.map.len()
    }
}
