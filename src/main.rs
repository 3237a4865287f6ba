mod bencode;
mod config;
mod crawler;
mod dht;
mod fetch;
mod infohash;
mod krpc;
mod queue;
mod recent;
mod scrape;
mod sink;

use crate::config::Config;
use crate::crawler::CrawlerEvent;
use crate::dht::KrpcDht;
use crate::fetch::PeerWireFetcher;
use crate::scrape::ScrapeClient;
use crate::sink::JsonlSink;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cfg = Config::load();

    let (announce_tx, announce_rx) = mpsc::channel(cfg.announce_buffer);
    let (dht, dht_reader) = KrpcDht::bind(&cfg, announce_tx).await?;

    let scrape = ScrapeClient::bind(
        &cfg.scrape_bind,
        Duration::from_secs(cfg.scrape_timeout_secs),
        Duration::from_secs(cfg.scrape_sweep_every_secs),
        cfg.trackers.clone(),
    )
    .await?;

    let fetcher = Arc::new(PeerWireFetcher::new(&cfg, dht.clone()));
    let sink = Arc::new(JsonlSink::open(&cfg.output_path)?);
    tracing::info!(output = %cfg.output_path.display(), "writing metadata");

    let crawler = crawler::start(
        &cfg,
        dht,
        fetcher,
        sink,
        scrape,
        announce_rx,
        vec![dht_reader],
    );

    // Follow the crawler's event stream: log what it indexes and, when
    // enabled, check swarm liveness for each fresh hash.
    let mut events = crawler.subscribe();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutting down");
                break;
            }
            event = events.recv() => {
                match event {
                    Ok(CrawlerEvent::Indexed { hash, .. }) if cfg.scrape_after_index => {
                        // Off the event loop so a slow tracker cannot stall it.
                        let scrape = crawler.scraper();
                        tokio::spawn(async move {
                            let result = scrape.scrape_multiple(hash).await;
                            if result.success {
                                tracing::info!(
                                    hash = %hash.short(),
                                    seeders = result.seeders,
                                    leechers = result.leechers,
                                    tracker = %result.tracker,
                                    "swarm liveness"
                                );
                            } else {
                                tracing::debug!(hash = %hash.short(), "no tracker answered");
                            }
                        });
                    }
                    Ok(CrawlerEvent::Progress { pending, active, indexed }) => {
                        tracing::info!(pending, active, indexed, "progress");
                    }
                    Ok(CrawlerEvent::Error(msg)) => tracing::warn!(%msg),
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "event stream lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    let stats = crawler.stats();
    tracing::info!(
        indexed = stats.indexed,
        pending = stats.pending,
        dropped = stats.dropped,
        "final counts"
    );
    crawler.stop().await;
    Ok(())
}
