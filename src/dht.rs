//! The two DHT contracts the crawler consumes: advancing the walk one
//! bounded step, and locating peers for a single info hash. Routing-table
//! correctness is explicitly not a goal; the walk keeps a rotating ring of
//! known nodes and the lookup is a bounded best-effort iteration.

use crate::config::Config;
use crate::infohash::InfoHash;
use crate::krpc::{self, Message};
use anyhow::Context;
use async_trait::async_trait;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, timeout};

/// A swarm membership observation harvested from DHT traffic.
/// `get_peers` queries carry no endpoint for the swarm itself, so the peer
/// hint is only present for `announce_peer`.
#[derive(Debug, Clone, Copy)]
pub struct Announce {
    pub hash: InfoHash,
    pub peer: Option<SocketAddr>,
}

#[async_trait]
pub trait DhtProvider: Send + Sync {
    /// Advance the walk, contacting at most `max_nodes` nodes.
    async fn walk_step(&self, max_nodes: usize);

    /// Bounded iterative `get_peers` lookup for one hash.
    async fn find_peers(&self, hash: InfoHash, limit: usize)
    -> anyhow::Result<Vec<SocketAddr>>;
}

struct LookupParams {
    inflight: usize,
    max_queries: usize,
    query_timeout: Duration,
    recv_timeout: Duration,
    overall: Duration,
}

/// KRPC-speaking DHT provider on one shared UDP socket. The socket's
/// reader task learns nodes, answers queries minimally so remote routing
/// tables keep us, and harvests announces into the channel given at bind.
pub struct KrpcDht {
    socket: Arc<UdpSocket>,
    node_id: [u8; 20],
    ring: Mutex<NodeRing>,
    announce_tx: mpsc::Sender<Announce>,
    bootstrap: Vec<String>,
    lookup: LookupParams,
}

impl KrpcDht {
    /// Binds the walk socket, resolves bootstrap nodes, and spawns the
    /// reader task. Bind failure is fatal and surfaces immediately.
    pub async fn bind(
        cfg: &Config,
        announce_tx: mpsc::Sender<Announce>,
    ) -> anyhow::Result<(Arc<Self>, JoinHandle<()>)> {
        let socket = UdpSocket::bind(&cfg.dht_bind)
            .await
            .with_context(|| format!("bind dht socket on {}", cfg.dht_bind))?;
        if let Ok(addr) = socket.local_addr() {
            tracing::info!(bind = %addr, "dht: listening");
        }

        let dht = Arc::new(Self {
            socket: Arc::new(socket),
            node_id: rand::random::<[u8; 20]>(),
            ring: Mutex::new(NodeRing::new(cfg.dht_max_known_nodes)),
            announce_tx,
            bootstrap: cfg.dht_bootstrap.clone(),
            lookup: LookupParams {
                inflight: cfg.lookup_inflight,
                max_queries: cfg.lookup_max_queries,
                query_timeout: Duration::from_millis(cfg.lookup_query_timeout_ms),
                recv_timeout: Duration::from_millis(cfg.lookup_recv_timeout_ms),
                overall: Duration::from_secs(cfg.discovery_timeout_secs),
            },
        });

        for addr in resolve_all(&dht.bootstrap).await {
            dht.ring.lock().unwrap().push(addr);
        }

        let reader = tokio::spawn(dht.clone().read_loop());
        Ok((dht, reader))
    }

    async fn read_loop(self: Arc<Self>) {
        let mut buf = vec![0u8; 4096];
        loop {
            let Ok((n, from)) = self.socket.recv_from(&mut buf).await else {
                continue;
            };
            let Some(msg) = krpc::decode(&buf[..n]) else {
                continue;
            };
            match msg {
                Message::Response(resp) => {
                    let mut ring = self.ring.lock().unwrap();
                    for node in resp.nodes() {
                        ring.push(node.addr);
                    }
                }
                Message::Query(query) => {
                    if let Some((hash, peer)) = query.announce(from) {
                        // The coordinator owns backpressure; if it lags,
                        // dropping announces is the correct behavior.
                        if let Err(err) = self.announce_tx.try_send(Announce { hash, peer }) {
                            tracing::trace!(%err, "dht: announce channel full, dropping");
                        }
                    }
                    let reply = krpc::make_reply(query.tx, &self.node_id);
                    let _ = self.socket.send_to(&reply, from).await;
                    self.ring.lock().unwrap().push(from);
                }
            }
        }
    }
}

#[async_trait]
impl DhtProvider for KrpcDht {
    async fn walk_step(&self, max_nodes: usize) {
        let targets = self.ring.lock().unwrap().rotate_take(max_nodes);
        for (i, addr) in targets.into_iter().enumerate() {
            let target = rand::random::<[u8; 20]>();
            let tx = (i as u16).to_be_bytes();
            let msg = krpc::make_find_node(&tx, &self.node_id, &target);
            let _ = self.socket.send_to(&msg, addr).await;
        }
    }

    async fn find_peers(
        &self,
        hash: InfoHash,
        limit: usize,
    ) -> anyhow::Result<Vec<SocketAddr>> {
        // A throwaway socket per lookup keeps the walk socket's traffic
        // and this lookup's correlation completely separate.
        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .context("bind lookup socket")?;

        // Closest-first frontier: min-heap on XOR distance to the target.
        let mut frontier: BinaryHeap<(Reverse<[u8; 20]>, SocketAddr)> = BinaryHeap::new();
        let mut seen_nodes: HashSet<SocketAddr> = HashSet::new();
        for addr in self.ring.lock().unwrap().snapshot(64) {
            if seen_nodes.insert(addr) {
                frontier.push((Reverse([0u8; 20]), addr));
            }
        }
        if frontier.is_empty() {
            for addr in resolve_all(&self.bootstrap).await {
                if seen_nodes.insert(addr) {
                    frontier.push((Reverse([0u8; 20]), addr));
                }
            }
        }
        if frontier.is_empty() {
            anyhow::bail!("no dht nodes to query");
        }

        let mut peers: Vec<SocketAddr> = Vec::new();
        let mut seen_peers: HashSet<SocketAddr> = HashSet::new();
        let mut inflight: HashMap<[u8; 2], Instant> = HashMap::new();
        let mut tx_counter: u16 = rand::random();
        let mut queries = 0usize;
        let mut buf = vec![0u8; 4096];
        let deadline = Instant::now() + self.lookup.overall;

        while Instant::now() < deadline && peers.len() < limit && queries < self.lookup.max_queries
        {
            let now = Instant::now();
            inflight.retain(|_, sent| now.duration_since(*sent) <= self.lookup.query_timeout);

            while inflight.len() < self.lookup.inflight
                && queries < self.lookup.max_queries
                && peers.len() < limit
            {
                let Some((_, addr)) = frontier.pop() else { break };
                if addr.is_ipv6() {
                    continue;
                }
                tx_counter = tx_counter.wrapping_add(1);
                let tx = tx_counter.to_be_bytes();
                let msg = krpc::make_get_peers(&tx, &self.node_id, hash.as_bytes());
                let _ = socket.send_to(&msg, addr).await;
                inflight.insert(tx, Instant::now());
                queries += 1;
            }

            if inflight.is_empty() && frontier.is_empty() {
                break;
            }

            let Ok(Ok((n, _from))) = timeout(self.lookup.recv_timeout, socket.recv_from(&mut buf)).await
            else {
                continue;
            };
            let Some(Message::Response(resp)) = krpc::decode(&buf[..n]) else {
                continue;
            };
            // Only responses to transaction ids we issued count.
            let Some(tx) = resp.tx_pair() else { continue };
            if inflight.remove(&tx).is_none() {
                continue;
            }

            for node in resp.nodes() {
                if is_publicly_routable(node.addr) && seen_nodes.insert(node.addr) {
                    let dist = xor_distance(&node.id, hash.as_bytes());
                    frontier.push((Reverse(dist), node.addr));
                }
            }
            for peer in resp.peers() {
                if peer.port() != 0 && seen_peers.insert(peer) {
                    peers.push(peer);
                    if peers.len() >= limit {
                        break;
                    }
                }
            }
        }

        Ok(peers)
    }
}

fn xor_distance(a: &[u8; 20], b: &[u8; 20]) -> [u8; 20] {
    let mut out = [0u8; 20];
    for i in 0..20 {
        out[i] = a[i] ^ b[i];
    }
    out
}

async fn resolve_all(hosts: &[String]) -> Vec<SocketAddr> {
    let mut out = Vec::new();
    for host in hosts {
        match tokio::net::lookup_host(host.as_str()).await {
            Ok(addrs) => out.extend(addrs),
            Err(err) => {
                tracing::debug!(%err, host = %host, "dht: bootstrap resolve failed");
            }
        }
    }
    out
}

/// Insertion-ordered, bounded set of node addresses. `rotate_take` hands
/// out the oldest entries and cycles them to the back so the walk spreads
/// across everything we know.
struct NodeRing {
    order: VecDeque<SocketAddr>,
    set: HashSet<SocketAddr>,
    cap: usize,
}

impl NodeRing {
    fn new(cap: usize) -> Self {
        Self {
            order: VecDeque::new(),
            set: HashSet::new(),
            cap: cap.max(1),
        }
    }

    fn push(&mut self, addr: SocketAddr) {
        if addr.port() == 0 || !is_publicly_routable(addr) {
            return;
        }
        if !self.set.insert(addr) {
            return;
        }
        self.order.push_back(addr);
        while self.order.len() > self.cap {
            if let Some(old) = self.order.pop_front() {
                self.set.remove(&old);
            }
        }
    }

    fn rotate_take(&mut self, n: usize) -> Vec<SocketAddr> {
        let mut out = Vec::with_capacity(n.min(self.order.len()));
        for _ in 0..n.min(self.order.len()) {
            if let Some(addr) = self.order.pop_front() {
                self.order.push_back(addr);
                out.push(addr);
            }
        }
        out
    }

    fn snapshot(&self, n: usize) -> Vec<SocketAddr> {
        self.order.iter().take(n).copied().collect()
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.order.len()
    }
}

fn is_publicly_routable(addr: SocketAddr) -> bool {
    match addr.ip() {
        IpAddr::V4(v4) => {
            !(v4.is_private()
                || v4.is_loopback()
                || v4.is_unspecified()
                || v4.is_link_local()
                || v4.is_multicast()
                || v4.is_broadcast())
        }
        IpAddr::V6(v6) => {
            !(v6.is_loopback()
                || v6.is_unspecified()
                || v6.is_multicast()
                || v6.is_unique_local()
                || v6.is_unicast_link_local())
        }
    }
}
