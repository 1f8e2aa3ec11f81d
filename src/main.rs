use std::sync::Arc;

use anyhow::Result;
use dex_collector::{
    cache::{CacheLayer, RedisCache},
    config::AppConfig,
    dex::{QuoteSource, build_quote_source},
    orchestrator::{CollectorSettings, Orchestrator},
    rpc::{EndpointPool, GasSampler, PoolOptions},
    store::JsonlSink,
    utils,
};
use std::time::Duration;
use tokio::sync::watch;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    utils::init_logging();

    let config = AppConfig::load()?;
    let settings = CollectorSettings::from_config(&config)?;
    tracing::info!(
        dexes = config.dexes.len(),
        pairs = config.pairs.len(),
        endpoints = config.endpoints.len(),
        interval_secs = config.collection.interval_secs,
        max_concurrency = settings.max_concurrency,
        "[INIT] dex-collector starting"
    );

    // Endpoint pool ---------------------------------------------------------
    let endpoints = Arc::new(EndpointPool::new(
        &config.endpoints,
        PoolOptions {
            health_check_interval: Duration::from_secs(config.rpc.health_check_interval_secs),
            retry_backoff: Duration::from_millis(config.rpc.retry_backoff_ms),
        },
    )?);

    // One adapter per dex, chosen by protocol family -------------------------
    let sources = config
        .dexes
        .iter()
        .map(|dex| build_quote_source(dex.clone(), Arc::clone(&endpoints), config.rpc.max_attempts))
        .collect::<Result<Vec<Arc<dyn QuoteSource>>, _>>()?;

    // Cache: Redis when configured and reachable, in-memory otherwise --------
    let ttl = config.cache.default_ttl();
    let cache = if !config.cache.enabled {
        tracing::info!("[INIT] cache disabled");
        CacheLayer::disabled()
    } else if let Some(url) = config.cache.connection_url() {
        match RedisCache::connect(&url).await {
            Ok(redis) => CacheLayer::new(Arc::new(redis), ttl),
            Err(e) => {
                tracing::warn!(error = %e, "[INIT] redis unreachable, using in-memory cache");
                CacheLayer::memory(ttl)
            }
        }
    } else {
        CacheLayer::memory(ttl)
    };

    let sink = JsonlSink::new(&config.persistence.output_dir);
    tracing::info!(dir = %sink.dir().display(), "[INIT] writing records as JSON lines");

    let chain_id = config.endpoints.first().map(|e| e.chain_id).unwrap_or(1);
    let mut orchestrator = Orchestrator::new(sources, Arc::new(cache), Arc::new(sink), settings)
        .with_requests(config.pair_requests()?)
        .with_tokens(config.tokens.clone())
        .with_endpoints(Arc::clone(&endpoints));
    if config.collection.sample_gas {
        orchestrator = orchestrator.with_gas_source(Arc::new(GasSampler::new(
            Arc::clone(&endpoints),
            chain_id,
            config.rpc.max_attempts,
        )));
    }

    // Ctrl-C cancels the cycle in flight and stops the loop ------------------
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("[INIT] shutdown requested");
            let _ = shutdown_tx.send(true);
        }
    });

    if std::env::var("RUN_ONCE").is_ok_and(|v| v == "1") {
        let summary = orchestrator.run_cycle(shutdown_rx).await;
        tracing::info!(?summary, "[INIT] single cycle finished");
    } else {
        orchestrator
            .run(config.collection.interval(), shutdown_rx)
            .await;
    }

    endpoints.shutdown().await;
    Ok(())
}
