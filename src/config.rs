use crate::scrape::ScrapeClient;
use std::path::PathBuf;

#[derive(Clone, Debug)]
pub struct Config {
    // Output
    pub output_path: PathBuf,

    // DHT walk
    pub dht_bind: String,
    pub dht_bootstrap: Vec<String>,
    pub dht_max_known_nodes: usize,
    pub walk_interval_ms: u64,
    pub walk_nodes_per_tick: usize,
    pub ignore_interval_ms: u64,
    pub announce_buffer: usize,

    // Fetch pipeline
    pub queue_limit: usize,
    pub max_concurrent_fetches: usize,
    pub recent_hashes_cap: usize,
    pub peers_per_hash: usize,
    pub peer_inflight: usize,
    pub peer_connect_timeout_secs: u64,
    pub fetch_timeout_secs: u64,
    pub progress_every_secs: u64,

    // DHT peer lookup (slow path)
    pub discovery_timeout_secs: u64,
    pub lookup_inflight: usize,
    pub lookup_max_queries: usize,
    pub lookup_query_timeout_ms: u64,
    pub lookup_recv_timeout_ms: u64,

    // Tracker scraping
    pub scrape_bind: String,
    pub scrape_timeout_secs: u64,
    pub scrape_sweep_every_secs: u64,
    pub scrape_after_index: bool,
    pub trackers: Vec<String>,
}

impl Config {
    pub fn load() -> Self {
        // If a .env file exists, load it. If not, keep going.
        // Precedence: process env > .env > code defaults.
        let _ = dotenvy::dotenv();
        Self::from_env()
    }

    fn from_env() -> Self {
        let default_trackers = ScrapeClient::default_trackers();
        let default_trackers_ref: Vec<&str> =
            default_trackers.iter().map(String::as_str).collect();

        Self {
            output_path: env_pathbuf("TRAWLER_OUTPUT", "data/torrents.jsonl"),

            dht_bind: env_string("TRAWLER_DHT_BIND", "0.0.0.0:0"),
            dht_bootstrap: env_csv_strings(
                "TRAWLER_DHT_BOOTSTRAP",
                &[
                    "router.bittorrent.com:6881",
                    "dht.transmissionbt.com:6881",
                    "router.utorrent.com:6881",
                ],
            ),
            dht_max_known_nodes: env_usize("TRAWLER_DHT_MAX_KNOWN_NODES", 10_000),
            walk_interval_ms: env_u64("TRAWLER_WALK_INTERVAL_MS", 100),
            walk_nodes_per_tick: env_usize("TRAWLER_WALK_NODES_PER_TICK", 16),
            ignore_interval_ms: env_u64("TRAWLER_IGNORE_INTERVAL_MS", 1_000),
            announce_buffer: env_usize("TRAWLER_ANNOUNCE_BUFFER", 1_024),

            queue_limit: env_usize("TRAWLER_QUEUE_LIMIT", 1_000),
            max_concurrent_fetches: env_usize("TRAWLER_MAX_CONCURRENT_FETCHES", 10),
            recent_hashes_cap: env_usize("TRAWLER_RECENT_HASHES_CAP", 10_000),
            peers_per_hash: env_usize("TRAWLER_PEERS_PER_HASH", 8),
            peer_inflight: env_usize("TRAWLER_PEER_INFLIGHT", 4),
            peer_connect_timeout_secs: env_u64("TRAWLER_PEER_CONNECT_TIMEOUT_SECS", 6),
            fetch_timeout_secs: env_u64("TRAWLER_FETCH_TIMEOUT_SECS", 16),
            progress_every_secs: env_u64("TRAWLER_PROGRESS_EVERY_SECS", 5),

            discovery_timeout_secs: env_u64("TRAWLER_DISCOVERY_TIMEOUT_SECS", 10),
            lookup_inflight: env_usize("TRAWLER_LOOKUP_INFLIGHT", 8),
            lookup_max_queries: env_usize("TRAWLER_LOOKUP_MAX_QUERIES", 32),
            lookup_query_timeout_ms: env_u64("TRAWLER_LOOKUP_QUERY_TIMEOUT_MS", 900),
            lookup_recv_timeout_ms: env_u64("TRAWLER_LOOKUP_RECV_TIMEOUT_MS", 250),

            scrape_bind: env_string("TRAWLER_SCRAPE_BIND", "0.0.0.0:0"),
            scrape_timeout_secs: env_u64("TRAWLER_SCRAPE_TIMEOUT_SECS", 15),
            scrape_sweep_every_secs: env_u64("TRAWLER_SCRAPE_SWEEP_EVERY_SECS", 5),
            scrape_after_index: env_enabled("TRAWLER_SCRAPE_AFTER_INDEX", true),
            trackers: env_csv_strings("TRAWLER_TRACKERS", &default_trackers_ref),
        }
    }
}

fn env_opt_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn env_string(name: &str, default: &str) -> String {
    env_opt_string(name).unwrap_or_else(|| default.to_string())
}

fn env_pathbuf(name: &str, default: &str) -> PathBuf {
    PathBuf::from(env_string(name, default))
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_usize(name: &str, default: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(default)
}

fn env_csv_strings(name: &str, defaults: &[&str]) -> Vec<String> {
    if let Some(s) = env_opt_string(name) {
        let v: Vec<String> = s
            .split(',')
            .map(|x| x.trim().to_string())
            .filter(|x| !x.is_empty())
            .collect();
        if !v.is_empty() {
            return v;
        }
    }
    defaults.iter().map(|s| s.to_string()).collect()
}

fn env_enabled(name: &str, default: bool) -> bool {
    match env_opt_string(name) {
        None => default,
        Some(v) => {
            let v = v.to_ascii_lowercase();
            if matches!(v.as_str(), "0" | "false" | "off" | "no") {
                return false;
            }
            if matches!(v.as_str(), "1" | "true" | "on" | "yes") {
                return true;
            }
            default
        }
    }
}
