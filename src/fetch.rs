//! Per-hash metadata acquisition: fast path straight to a hinted peer,
//! slow path through a DHT lookup first. The peer-wire framing itself
//! (BEP 10 extension messages, ut_metadata pieces) comes from `rbit`;
//! this module drives the exchange and turns the raw info dict into a
//! `TorrentMetadata`.

use crate::bencode;
use crate::config::Config;
use crate::dht::DhtProvider;
use crate::infohash::InfoHash;
use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use rbit::peer::{
    ExtensionHandshake, ExtensionMessage, METADATA_PIECE_SIZE, Message, MetadataMessage,
    MetadataMessageType, PeerConnection, PeerId, metadata_piece_size,
};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::time::{Duration, Instant, timeout, timeout_at};

/// Upper bound on a peer-advertised info dict. Real metadata tops out in
/// the single-digit MiB range; a peer claiming more is hostile or broken
/// and gets no piece requests at all.
const MAX_METADATA_SIZE: usize = 8 * 1024 * 1024;

#[derive(Debug, Clone, Serialize)]
pub struct TorrentFileEntry {
    pub path: String,
    pub size: u64,
}

/// The finished product of one successful fetch; handed to the sink once.
#[derive(Debug, Clone, Serialize)]
pub struct TorrentMetadata {
    pub hash: InfoHash,
    pub name: String,
    pub total_size: u64,
    pub piece_length: u64,
    pub files: Vec<TorrentFileEntry>,
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("timed out")]
    Timeout,
    #[error("no peers found")]
    NoPeers,
    #[error("network error: {0}")]
    Network(String),
    #[error("protocol error: {0}")]
    Protocol(String),
}

#[async_trait]
pub trait MetadataFetcher: Send + Sync {
    /// Resolves exactly once. No retry on failure; re-fetching is driven
    /// by a later announce after the recent-hash window moves on.
    async fn fetch(
        &self,
        hash: InfoHash,
        peer_hint: Option<SocketAddr>,
    ) -> Result<TorrentMetadata, FetchError>;
}

pub struct PeerWireFetcher {
    dht: Arc<dyn DhtProvider>,
    peers_per_hash: usize,
    peer_inflight: usize,
    connect_timeout: Duration,
    fetch_timeout: Duration,
    discovery_timeout: Duration,
}

impl PeerWireFetcher {
    pub fn new(cfg: &Config, dht: Arc<dyn DhtProvider>) -> Self {
        Self {
            dht,
            peers_per_hash: cfg.peers_per_hash,
            peer_inflight: cfg.peer_inflight.max(1),
            connect_timeout: Duration::from_secs(cfg.peer_connect_timeout_secs),
            fetch_timeout: Duration::from_secs(cfg.fetch_timeout_secs),
            discovery_timeout: Duration::from_secs(cfg.discovery_timeout_secs),
        }
    }
}

#[async_trait]
impl MetadataFetcher for PeerWireFetcher {
    async fn fetch(
        &self,
        hash: InfoHash,
        peer_hint: Option<SocketAddr>,
    ) -> Result<TorrentMetadata, FetchError> {
        let peers = match peer_hint {
            Some(addr) => vec![addr],
            None => {
                let found = timeout(
                    self.discovery_timeout,
                    self.dht.find_peers(hash, self.peers_per_hash),
                )
                .await
                .map_err(|_| FetchError::Timeout)?
                .map_err(|err| FetchError::Network(err.to_string()))?;
                if found.is_empty() {
                    return Err(FetchError::NoPeers);
                }
                found
            }
        };

        // Many peers refuse connections or lack ut_metadata; race a small
        // window of candidates and take the first full info dict. The
        // whole exchange phase shares one deadline: replacement candidates
        // only get whatever time the earlier failures left over.
        let deadline = Instant::now() + self.fetch_timeout;
        let mut join_set = tokio::task::JoinSet::new();
        let mut candidates = peers.into_iter();
        let connect_timeout = self.connect_timeout;
        let spawn_attempt = |join_set: &mut tokio::task::JoinSet<_>, peer: SocketAddr| {
            join_set.spawn(async move {
                let r = timeout_at(deadline, fetch_ut_metadata(peer, hash, connect_timeout)).await;
                (peer, r)
            });
        };
        for _ in 0..self.peer_inflight {
            if let Some(peer) = candidates.next() {
                spawn_attempt(&mut join_set, peer);
            }
        }

        let mut last_err = FetchError::NoPeers;
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((peer, Ok(Ok(info_bytes)))) => {
                    join_set.abort_all();
                    tracing::debug!(
                        hash = %hash.short(),
                        peer = %peer,
                        bytes = info_bytes.len(),
                        "fetch: got metadata"
                    );
                    return parse_info_dict(hash, &info_bytes);
                }
                Ok((peer, Ok(Err(err)))) => {
                    tracing::trace!(hash = %hash.short(), peer = %peer, %err, "fetch: peer failed");
                    last_err = FetchError::Network(err.to_string());
                }
                Ok((peer, Err(_elapsed))) => {
                    tracing::trace!(hash = %hash.short(), peer = %peer, "fetch: peer timed out");
                    last_err = FetchError::Timeout;
                }
                Err(err) => {
                    last_err = FetchError::Network(format!("fetch task join error: {err}"));
                }
            }
            if let Some(peer) = candidates.next() {
                spawn_attempt(&mut join_set, peer);
            }
        }
        Err(last_err)
    }
}

/// Pull the complete info dict off one peer over the ut_metadata extension.
/// The caller bounds the whole call with the shared fetch deadline, so the
/// per-message waits here are simply unbounded reads.
async fn fetch_ut_metadata(
    addr: SocketAddr,
    hash: InfoHash,
    connect_timeout: Duration,
) -> anyhow::Result<Vec<u8>> {
    let peer_id = *PeerId::generate().as_bytes();
    let mut conn = timeout(
        connect_timeout,
        PeerConnection::connect(addr, *hash.as_bytes(), peer_id),
    )
    .await
    .context("peer connect timed out")??;

    if !conn.supports_extension {
        anyhow::bail!("peer does not support BEP-10");
    }

    let mut hs = ExtensionHandshake::with_extensions(&[("ut_metadata", 1)]);
    hs.client = Some("trawler".to_string());
    conn.send(Message::Extended {
        id: 0,
        payload: hs.encode()?,
    })
    .await?;

    let (ut_id, advertised_size) = await_ut_handshake(&mut conn).await?;

    // A peer that omits metadata_size still reports total_size on the
    // first data message, so ask for piece 0 to learn it.
    let total_size = match advertised_size {
        Some(v) => v,
        None => {
            request_piece(&mut conn, ut_id, 0).await?;
            let msg = next_metadata(&mut conn, ut_id).await?;
            if msg.msg_type != MetadataMessageType::Data {
                anyhow::bail!("peer did not answer the size request");
            }
            msg.total_size.context("peer did not report metadata size")?
        }
    } as usize;

    let piece_count = metadata_piece_count(total_size)?;
    for piece in 0..piece_count {
        request_piece(&mut conn, ut_id, piece as u32).await?;
    }

    let mut pieces: Vec<Option<Bytes>> = vec![None; piece_count];
    let mut missing = piece_count;
    while missing > 0 {
        let msg = next_metadata(&mut conn, ut_id).await?;
        match msg.msg_type {
            MetadataMessageType::Reject => {
                anyhow::bail!("peer rejected metadata piece {}", msg.piece)
            }
            MetadataMessageType::Data => {
                let Some(data) = msg.data else { continue };
                let idx = msg.piece as usize;
                if idx < pieces.len() && pieces[idx].is_none() {
                    pieces[idx] = Some(data);
                    missing -= 1;
                }
            }
            _ => {}
        }
    }

    let mut out = vec![0u8; total_size];
    for (piece, maybe_data) in pieces.into_iter().enumerate() {
        let data = maybe_data.context("missing piece data")?;
        let expected = metadata_piece_size(piece as u32, total_size);
        let offset = piece * METADATA_PIECE_SIZE;
        let to_copy = expected
            .min(data.len())
            .min(out.len().saturating_sub(offset));
        out[offset..offset + to_copy].copy_from_slice(&data[..to_copy]);
    }
    Ok(out)
}

/// Validates a peer-advertised metadata size before any piece request or
/// reassembly buffer depends on it.
fn metadata_piece_count(total_size: usize) -> anyhow::Result<usize> {
    if total_size == 0 {
        anyhow::bail!("metadata has zero size");
    }
    if total_size > MAX_METADATA_SIZE {
        anyhow::bail!("peer advertised implausible metadata size {total_size}");
    }
    Ok(total_size.div_ceil(METADATA_PIECE_SIZE))
}

/// Skips non-extended traffic until the peer's extension handshake shows
/// up, then extracts its ut_metadata id and optional advertised size.
async fn await_ut_handshake(conn: &mut PeerConnection) -> anyhow::Result<(u8, Option<u32>)> {
    loop {
        let Message::Extended { id, payload } = conn.receive().await? else {
            continue;
        };
        let ExtensionMessage::Handshake(peer_hs) = ExtensionMessage::decode(id, payload.as_ref())?
        else {
            continue;
        };
        let Some(ut_id) = peer_hs.get_extension_id("ut_metadata") else {
            anyhow::bail!("peer did not advertise ut_metadata");
        };
        let size = peer_hs.metadata_size.and_then(|v| u32::try_from(v).ok());
        return Ok((ut_id, size));
    }
}

async fn request_piece(conn: &mut PeerConnection, ut_id: u8, piece: u32) -> anyhow::Result<()> {
    conn.send(Message::Extended {
        id: ut_id,
        payload: MetadataMessage::request(piece).encode()?,
    })
    .await?;
    Ok(())
}

/// Peers interleave choke/have/bitfield and other extended traffic while
/// serving ut_metadata; keep reading until a message on the right id.
async fn next_metadata(conn: &mut PeerConnection, ut_id: u8) -> anyhow::Result<MetadataMessage> {
    loop {
        let Message::Extended { id, payload } = conn.receive().await? else {
            continue;
        };
        if id != ut_id {
            continue;
        }
        return Ok(MetadataMessage::decode(payload.as_ref())?);
    }
}

/// Turn a raw bencoded info dict into the metadata record the sink gets.
pub fn parse_info_dict(hash: InfoHash, info: &[u8]) -> Result<TorrentMetadata, FetchError> {
    let name = bencode::dict_get_str(info, b"name.utf-8")
        .or_else(|| bencode::dict_get_str(info, b"name"))
        .ok_or_else(|| FetchError::Protocol("info dict has no name".into()))?
        .to_string();
    let piece_length = bencode::dict_get_int(info, b"piece length").unwrap_or(0).max(0) as u64;

    let files = match bencode::dict_get_list(info, b"files") {
        Some(entries) => {
            let mut files = Vec::with_capacity(entries.len());
            for entry in entries {
                let size = bencode::dict_get_int(entry, b"length").unwrap_or(0).max(0) as u64;
                let parts = bencode::dict_get_list(entry, b"path.utf-8")
                    .or_else(|| bencode::dict_get_list(entry, b"path"))
                    .unwrap_or_default();
                let path = parts
                    .iter()
                    .filter_map(|p| bencode::as_bytes(p))
                    .map(|p| String::from_utf8_lossy(p).into_owned())
                    .collect::<Vec<_>>()
                    .join("/");
                files.push(TorrentFileEntry { path, size });
            }
            if files.is_empty() {
                return Err(FetchError::Protocol("info dict has empty file list".into()));
            }
            files
        }
        None => {
            // Single-file torrent: the name is the path.
            let size = bencode::dict_get_int(info, b"length").unwrap_or(0).max(0) as u64;
            vec![TorrentFileEntry {
                path: name.clone(),
                size,
            }]
        }
    };

    let total_size = files.iter().map(|f| f.size).sum();
    Ok(TorrentMetadata {
        hash,
        name,
        total_size,
        piece_length,
        files,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash() -> InfoHash {
        InfoHash::new([0x42; 20])
    }

    #[test]
    fn single_file_info_dict() {
        let raw = b"d6:lengthi2048e4:name8:file.iso12:piece lengthi16384ee";
        let meta = parse_info_dict(hash(), raw).unwrap();
        assert_eq!(meta.name, "file.iso");
        assert_eq!(meta.total_size, 2048);
        assert_eq!(meta.piece_length, 16384);
        assert_eq!(meta.files.len(), 1);
        assert_eq!(meta.files[0].path, "file.iso");
    }

    #[test]
    fn multi_file_info_dict_sums_sizes_and_joins_paths() {
        let raw = b"d5:filesld6:lengthi100e4:pathl3:dir5:a.txteed6:lengthi200e4:pathl5:b.binee\
e4:name6:bundle12:piece lengthi32768ee";
        let meta = parse_info_dict(hash(), raw).unwrap();
        assert_eq!(meta.name, "bundle");
        assert_eq!(meta.total_size, 300);
        assert_eq!(meta.files.len(), 2);
        assert_eq!(meta.files[0].path, "dir/a.txt");
        assert_eq!(meta.files[0].size, 100);
        assert_eq!(meta.files[1].path, "b.bin");
    }

    #[test]
    fn utf8_name_takes_precedence() {
        let raw = b"d6:lengthi1e4:name3:old10:name.utf-83:newe";
        let meta = parse_info_dict(hash(), raw).unwrap();
        assert_eq!(meta.name, "new");
    }

    #[test]
    fn missing_name_is_a_protocol_error() {
        let raw = b"d6:lengthi1ee";
        assert!(matches!(
            parse_info_dict(hash(), raw),
            Err(FetchError::Protocol(_))
        ));
    }

    #[test]
    fn rejects_implausible_metadata_sizes() {
        assert!(metadata_piece_count(0).is_err());
        assert!(metadata_piece_count(MAX_METADATA_SIZE + 1).is_err());
        assert!(metadata_piece_count(u32::MAX as usize).is_err());
        assert_eq!(metadata_piece_count(1).unwrap(), 1);
        assert_eq!(
            metadata_piece_count(METADATA_PIECE_SIZE * 2).unwrap(),
            2
        );
        assert_eq!(
            metadata_piece_count(METADATA_PIECE_SIZE * 2 + 1).unwrap(),
            3
        );
    }

    mod budget {
        use super::*;
        use async_trait::async_trait;

        struct StaticPeers(Vec<SocketAddr>);

        #[async_trait]
        impl DhtProvider for StaticPeers {
            async fn walk_step(&self, _max_nodes: usize) {}
            async fn find_peers(
                &self,
                _hash: InfoHash,
                _limit: usize,
            ) -> anyhow::Result<Vec<SocketAddr>> {
                Ok(self.0.clone())
            }
        }

        fn test_config() -> Config {
            Config {
                output_path: "/tmp/unused".into(),
                dht_bind: "127.0.0.1:0".into(),
                dht_bootstrap: vec![],
                dht_max_known_nodes: 100,
                walk_interval_ms: 100,
                walk_nodes_per_tick: 4,
                ignore_interval_ms: 1_000,
                announce_buffer: 64,
                queue_limit: 100,
                max_concurrent_fetches: 10,
                recent_hashes_cap: 1_000,
                peers_per_hash: 3,
                peer_inflight: 1,
                peer_connect_timeout_secs: 10,
                fetch_timeout_secs: 1,
                progress_every_secs: 5,
                discovery_timeout_secs: 5,
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

        #[tokio::test]
        async fn silent_peers_cannot_stretch_the_fetch_deadline() {
            // Three listeners that accept TCP but never speak BitTorrent;
            // each candidate attempt hangs until a timeout cuts it off.
            let mut listeners = Vec::new();
            let mut addrs = Vec::new();
            for _ in 0..3 {
                let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
                addrs.push(listener.local_addr().unwrap());
                listeners.push(listener);
            }

            let cfg = test_config();
            let fetcher = PeerWireFetcher::new(&cfg, Arc::new(StaticPeers(addrs)));

            let started = Instant::now();
            let result = fetcher.fetch(hash(), None).await;
            let elapsed = started.elapsed();

            assert!(matches!(result, Err(FetchError::Timeout)));
            // One second of fetch budget shared by all three candidates.
            // Without a shared deadline this takes one budget per peer.
            assert!(
                elapsed < Duration::from_secs(2),
                "took {elapsed:?} for a 1s fetch budget"
            );
        }
    }
}
