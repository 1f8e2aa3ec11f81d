//! Collection cycles: enumerate pairs, fetch them with bounded concurrency,
//! batch the results into persistence.
//!
//! A cycle walks `Idle -> Enumerating -> Dispatching -> Awaiting ->
//! Persisting -> Idle`. Failures stay local to the pair or endpoint that
//! produced them and are reported in the [`CycleSummary`].

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bigdecimal::BigDecimal;
use chrono::Utc;
use ethers::types::Address;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock, Semaphore, watch};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior, sleep, timeout};
use tracing::{debug, info, warn};

use crate::cache::{CacheLayer, keys};
use crate::config::AppConfig;
use crate::depth::{raw_notionals, sample_depth_curve};
use crate::dex::{QuoteSource, derive_price_record};
use crate::errors::{AdapterError, Result};
use crate::models::{LiquidityDepthSample, PriceRecord, ReserveSnapshot, TokenRef, TradingPair};
use crate::rpc::{EndpointPool, GasSource};
use crate::store::{RecordBatch, RecordSink};
use crate::utils::addr_hex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CyclePhase {
    Idle,
    Enumerating,
    Dispatching,
    Awaiting,
    Persisting,
}

/// A configured token pair that still has to be mapped to a pool.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PairRequest {
    pub dex: String,
    pub token_a: Address,
    pub token_b: Address,
    /// Known pool address; skips the factory lookup.
    pub pool: Option<Address>,
}

#[derive(Debug, Clone)]
pub struct CollectorSettings {
    pub max_concurrency: usize,
    /// Attempts per snapshot read, on top of endpoint rotation.
    pub fetch_retries: usize,
    pub retry_backoff: Duration,
    pub persist_retries: usize,
    /// Budget for one pair's fetch, and separately for its depth sampling.
    pub task_timeout: Duration,
    /// Depth notionals in input-token units. Empty disables sampling.
    pub depth_notionals: Vec<BigDecimal>,
    pub discovery_lock_ttl: Duration,
}

impl Default for CollectorSettings {
    fn default() -> Self {
        Self {
            max_concurrency: 20,
            fetch_retries: 3,
            retry_backoff: Duration::from_millis(50),
            persist_retries: 3,
            task_timeout: Duration::from_secs(60),
            depth_notionals: Vec::new(),
            discovery_lock_ttl: Duration::from_secs(30),
        }
    }
}

impl CollectorSettings {
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let collection = &config.collection;
        let call_timeout = config
            .endpoints
            .iter()
            .map(|e| e.timeout())
            .max()
            .unwrap_or(Duration::from_secs(20));
        let fetch_retries = collection.fetch_retries.max(1);
        Ok(Self {
            max_concurrency: collection.max_concurrency.max(1),
            fetch_retries,
            retry_backoff: collection.retry_backoff(),
            persist_retries: collection.persist_retries.max(1),
            task_timeout: call_timeout * u32::try_from(fetch_retries).unwrap_or(u32::MAX),
            depth_notionals: if collection.depth_sampling {
                collection.notionals()?
            } else {
                Vec::new()
            },
            ..Self::default()
        })
    }
}

/// Aggregate result of one cycle. Per-pair errors never escape a cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleSummary {
    pub cycle: u64,
    pub attempted: usize,
    pub succeeded: usize,
    /// Served from cache, nothing new to persist.
    pub cached: usize,
    pub failed: usize,
    /// Requests and pairs found not to exist, now inactive.
    pub not_found: usize,
    pub cancelled: usize,
    pub discovered: usize,
    pub depth_samples: usize,
    pub gas_sampled: bool,
    pub records_written: usize,
    /// Pairs whose records were dropped after persistence gave up.
    pub persist_failures: usize,
    pub healthy_endpoints: usize,
    pub total_endpoints: usize,
    pub elapsed_ms: u64,
}

impl CycleSummary {
    pub fn health_ratio(&self) -> String {
        format!("{}/{}", self.healthy_endpoints, self.total_endpoints)
    }
}

/// What the cache holds under `price:<pair>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairQuote {
    pub snapshot: ReserveSnapshot,
    pub price: PriceRecord,
}

/// Known pairs plus the outcome of every discovery request.
///
/// Reads go through a read-write lock; discovery takes `discovery` so only
/// one writer inserts at a time.
#[derive(Default)]
pub struct PairRegistry {
    pairs: RwLock<HashMap<Address, TradingPair>>,
    resolved: RwLock<HashMap<PairRequest, Option<Address>>>,
    discovery: Mutex<()>,
}

impl PairRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` when the pool is already known.
    pub async fn insert(&self, pair: TradingPair) -> bool {
        let mut pairs = self.pairs.write().await;
        if pairs.contains_key(&pair.pool_address) {
            return false;
        }
        pairs.insert(pair.pool_address, pair);
        true
    }

    pub async fn get(&self, pool: &Address) -> Option<TradingPair> {
        self.pairs.read().await.get(pool).cloned()
    }

    /// Active pairs ordered by pool address.
    pub async fn active(&self) -> Vec<TradingPair> {
        let mut active: Vec<TradingPair> = self
            .pairs
            .read()
            .await
            .values()
            .filter(|p| p.active)
            .cloned()
            .collect();
        active.sort_by_key(|p| p.pool_address);
        active
    }

    pub async fn deactivate(&self, pool: &Address) -> bool {
        match self.pairs.write().await.get_mut(pool) {
            Some(pair) if pair.active => {
                pair.active = false;
                true
            }
            _ => false,
        }
    }

    pub async fn len(&self) -> usize {
        self.pairs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.pairs.read().await.is_empty()
    }

    pub async fn pools_for(&self, dex: &str) -> Vec<Address> {
        let mut pools: Vec<Address> = self
            .pairs
            .read()
            .await
            .values()
            .filter(|p| p.dex == dex)
            .map(|p| p.pool_address)
            .collect();
        pools.sort();
        pools
    }

    /// Requests whose factory lookup reported no pool.
    pub async fn inactive_requests(&self) -> usize {
        self.resolved
            .read()
            .await
            .values()
            .filter(|pool| pool.is_none())
            .count()
    }

    async fn pending(&self, requests: &[PairRequest]) -> Vec<PairRequest> {
        let resolved = self.resolved.read().await;
        requests
            .iter()
            .filter(|r| !resolved.contains_key(*r))
            .cloned()
            .collect()
    }

    async fn resolve(&self, request: PairRequest, pool: Option<Address>) {
        self.resolved.write().await.insert(request, pool);
    }
}

enum PairOutcome {
    Collected(Box<CollectedPair>),
    Cached,
    NotFound,
    Failed(String),
    Cancelled,
}

struct CollectedPair {
    snapshot: ReserveSnapshot,
    price: PriceRecord,
    depth: Vec<LiquidityDepthSample>,
}

/// Everything a spawned pair task needs, cheap to clone.
#[derive(Clone)]
struct PairTask {
    source: Arc<dyn QuoteSource>,
    cache: Arc<CacheLayer>,
    settings: Arc<CollectorSettings>,
}

impl PairTask {
    async fn collect(&self, pair: &TradingPair) -> PairOutcome {
        let key = keys::price(&pair.pool_address);
        if self.cache.get_json::<PairQuote>(&key).await.is_some() {
            debug!(pair = %addr_hex(&pair.pool_address), "[CACHE] hit");
            return PairOutcome::Cached;
        }

        let fetch = self.fetch_with_retries(pair);
        let snapshot = match timeout(self.settings.task_timeout, fetch).await {
            Ok(Ok(snapshot)) => snapshot,
            Ok(Err(AdapterError::PairNotFound { .. })) => return PairOutcome::NotFound,
            Ok(Err(e)) => return PairOutcome::Failed(e.to_string()),
            Err(_) => {
                return PairOutcome::Failed(format!(
                    "timed out after {:?}",
                    self.settings.task_timeout
                ));
            }
        };

        let mut price = match derive_price_record(pair, &snapshot) {
            Ok(price) => price,
            Err(e) => return PairOutcome::Failed(e.to_string()),
        };

        let depth = if self.settings.depth_notionals.is_empty() {
            Vec::new()
        } else {
            match timeout(self.settings.task_timeout, self.sample_depth(pair, &snapshot)).await {
                Ok(samples) => samples,
                Err(_) => {
                    warn!(pair = %addr_hex(&pair.pool_address), "[DEX] depth sampling timed out");
                    Vec::new()
                }
            }
        };
        if !depth.is_empty() {
            price.depth_curve = serde_json::to_string(&depth).ok();
        }

        // `price:<pair>` is written by the cycle once the batch is persisted.
        PairOutcome::Collected(Box::new(CollectedPair {
            snapshot,
            price,
            depth,
        }))
    }

    async fn fetch_with_retries(
        &self,
        pair: &TradingPair,
    ) -> std::result::Result<ReserveSnapshot, AdapterError> {
        let max_attempts = self.settings.fetch_retries.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.source.fetch_reserve_state(pair).await {
                Ok(snapshot) => return Ok(snapshot),
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    debug!(
                        pair = %addr_hex(&pair.pool_address),
                        attempt,
                        error = %e,
                        "[DEX] read failed, retrying"
                    );
                    sleep(self.settings.retry_backoff * attempt as u32).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Both directions, notionals in the input token's units.
    async fn sample_depth(
        &self,
        pair: &TradingPair,
        snapshot: &ReserveSnapshot,
    ) -> Vec<LiquidityDepthSample> {
        let legs = [
            (&pair.token0, &pair.token1),
            (&pair.token1, &pair.token0),
        ];
        let mut samples = Vec::new();
        for (token_in, token_out) in legs {
            let amounts = raw_notionals(&self.settings.depth_notionals, token_in.decimals);
            match sample_depth_curve(
                self.source.as_ref(),
                pair,
                snapshot,
                token_in.address,
                token_out.address,
                &amounts,
            )
            .await
            {
                Ok(curve) => samples.extend(curve),
                Err(e) => debug!(
                    pair = %addr_hex(&pair.pool_address),
                    error = %e,
                    "[DEX] depth curve unavailable"
                ),
            }
        }
        samples
    }
}

/// Resolves once `rx` reads `true`. A dropped sender never cancels.
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

pub struct Orchestrator {
    sources: HashMap<String, Arc<dyn QuoteSource>>,
    requests: Vec<PairRequest>,
    known_tokens: HashMap<Address, TokenRef>,
    registry: PairRegistry,
    cache: Arc<CacheLayer>,
    sink: Arc<dyn RecordSink>,
    gas: Option<Arc<dyn GasSource>>,
    endpoints: Option<Arc<EndpointPool>>,
    settings: Arc<CollectorSettings>,
    phase: watch::Sender<CyclePhase>,
    cycles: AtomicU64,
}

impl Orchestrator {
    pub fn new(
        sources: Vec<Arc<dyn QuoteSource>>,
        cache: Arc<CacheLayer>,
        sink: Arc<dyn RecordSink>,
        settings: CollectorSettings,
    ) -> Self {
        let (phase, _) = watch::channel(CyclePhase::Idle);
        Self {
            sources: sources
                .into_iter()
                .map(|s| (s.dex().name.clone(), s))
                .collect(),
            requests: Vec::new(),
            known_tokens: HashMap::new(),
            registry: PairRegistry::new(),
            cache,
            sink,
            gas: None,
            endpoints: None,
            settings: Arc::new(settings),
            phase,
            cycles: AtomicU64::new(0),
        }
    }

    pub fn with_requests(mut self, requests: Vec<PairRequest>) -> Self {
        self.requests = requests;
        self
    }

    /// Configured token metadata, preferred over chain reads.
    pub fn with_tokens(mut self, tokens: Vec<TokenRef>) -> Self {
        self.known_tokens = tokens.into_iter().map(|t| (t.address, t)).collect();
        self
    }

    pub fn with_gas_source(mut self, gas: Arc<dyn GasSource>) -> Self {
        self.gas = Some(gas);
        self
    }

    pub fn with_endpoints(mut self, endpoints: Arc<EndpointPool>) -> Self {
        self.endpoints = Some(endpoints);
        self
    }

    pub fn registry(&self) -> &PairRegistry {
        &self.registry
    }

    pub fn cache(&self) -> &CacheLayer {
        &self.cache
    }

    pub fn phase(&self) -> CyclePhase {
        *self.phase.borrow()
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<CyclePhase> {
        self.phase.subscribe()
    }

    fn enter(&self, phase: CyclePhase) {
        debug!(?phase, "[CYCLE] phase");
        self.phase.send_replace(phase);
    }

    /// Run cycles every `interval` until `shutdown` reads `true`. The same
    /// signal cancels the cycle in flight.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = cancelled(&mut shutdown) => break,
                _ = ticker.tick() => {}
            }
            self.run_cycle(shutdown.clone()).await;
        }
        info!("[CYCLE] collection loop stopped");
    }

    /// One cycle cancelled after `deadline`.
    pub async fn run_cycle_with_deadline(&self, deadline: Duration) -> CycleSummary {
        let (tx, rx) = watch::channel(false);
        let timer = tokio::spawn(async move {
            sleep(deadline).await;
            let _ = tx.send(true);
        });
        let summary = self.run_cycle(rx).await;
        timer.abort();
        summary
    }

    pub async fn run_cycle(&self, cancel: watch::Receiver<bool>) -> CycleSummary {
        let started = Instant::now();
        let cycle = self.cycles.fetch_add(1, Ordering::Relaxed) + 1;
        let mut summary = CycleSummary {
            cycle,
            ..CycleSummary::default()
        };
        let mut batch = RecordBatch::default();

        self.enter(CyclePhase::Enumerating);
        let (discovered, missing) = self.enumerate().await;
        summary.discovered = discovered.len();
        summary.not_found += missing;
        batch.pairs = discovered;
        let active = self.registry.active().await;

        self.enter(CyclePhase::Dispatching);
        let gas_task = self.gas.clone().map(|gas| {
            let mut cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::select! {
                    biased;
                    _ = cancelled(&mut cancel) => None,
                    sample = gas.sample() => Some(sample),
                }
            })
        });

        let semaphore = Arc::new(Semaphore::new(self.settings.max_concurrency.max(1)));
        let mut tasks = JoinSet::new();
        for pair in active {
            let Some(source) = self.sources.get(&pair.dex) else {
                warn!(
                    pair = %addr_hex(&pair.pool_address),
                    dex = %pair.dex,
                    "[CYCLE] no adapter for dex"
                );
                summary.attempted += 1;
                summary.failed += 1;
                continue;
            };
            let task = PairTask {
                source: Arc::clone(source),
                cache: Arc::clone(&self.cache),
                settings: Arc::clone(&self.settings),
            };
            let semaphore = Arc::clone(&semaphore);
            let mut cancel = cancel.clone();
            summary.attempted += 1;
            tasks.spawn(async move {
                let outcome = tokio::select! {
                    biased;
                    _ = cancelled(&mut cancel) => PairOutcome::Cancelled,
                    outcome = async {
                        let _permit = semaphore.acquire_owned().await.ok();
                        task.collect(&pair).await
                    } => outcome,
                };
                (pair, outcome)
            });
        }

        self.enter(CyclePhase::Awaiting);
        let mut fresh = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            let (pair, outcome) = match joined {
                Ok(done) => done,
                Err(e) => {
                    warn!(error = %e, "[CYCLE] pair task aborted");
                    summary.failed += 1;
                    continue;
                }
            };
            match outcome {
                PairOutcome::Collected(collected) => {
                    let CollectedPair {
                        snapshot,
                        price,
                        depth,
                    } = *collected;
                    summary.succeeded += 1;
                    summary.depth_samples += depth.len();
                    fresh.push(PairQuote {
                        snapshot: snapshot.clone(),
                        price: price.clone(),
                    });
                    batch.snapshots.push(snapshot);
                    batch.prices.push(price);
                    batch.depth_samples.extend(depth);
                }
                PairOutcome::Cached => summary.cached += 1,
                PairOutcome::NotFound => {
                    debug!(pair = %pair.label(), "[DEX] pair no longer exists, deactivating");
                    self.registry.deactivate(&pair.pool_address).await;
                    summary.not_found += 1;
                }
                PairOutcome::Failed(error) => {
                    warn!(
                        pair = %pair.label(),
                        pool = %addr_hex(&pair.pool_address),
                        error = %error,
                        "[CYCLE] pair collection failed"
                    );
                    summary.failed += 1;
                }
                PairOutcome::Cancelled => summary.cancelled += 1,
            }
        }

        if let Some(handle) = gas_task {
            match handle.await {
                Ok(Some(Ok(sample))) => {
                    summary.gas_sampled = true;
                    batch.gas_samples.push(sample);
                }
                Ok(Some(Err(e))) => warn!(error = %e, "[GAS] sample failed"),
                Ok(None) => {}
                Err(e) => warn!(error = %e, "[GAS] sampler task aborted"),
            }
        }

        self.enter(CyclePhase::Persisting);
        let (written, dropped) = self.persist(&batch).await;
        summary.records_written = written;
        summary.persist_failures = dropped;
        // A dropped batch leaves no cache entry, so the next cycle reads
        // those pairs again.
        if dropped == 0 {
            for quote in &fresh {
                let key = keys::price(&quote.snapshot.pair);
                self.cache.set_json(&key, quote, None).await;
            }
        }

        if let Some(endpoints) = &self.endpoints {
            let (healthy, total) = endpoints.health_ratio();
            summary.healthy_endpoints = healthy;
            summary.total_endpoints = total;
        }
        summary.elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.enter(CyclePhase::Idle);

        info!(
            cycle,
            attempted = summary.attempted,
            succeeded = summary.succeeded,
            cached = summary.cached,
            failed = summary.failed,
            discovered = summary.discovered,
            not_found = summary.not_found,
            cancelled = summary.cancelled,
            records = summary.records_written,
            endpoints = %summary.health_ratio(),
            elapsed_ms = summary.elapsed_ms,
            "[CYCLE] collection cycle complete"
        );
        if summary.persist_failures > 0 {
            warn!(
                cycle,
                pairs = summary.persist_failures,
                "[STORE] batch dropped after retries"
            );
        }
        summary
    }

    /// Discover pools for pending requests. Returns new pairs and the
    /// number of requests the factories reported as nonexistent.
    async fn enumerate(&self) -> (Vec<TradingPair>, usize) {
        let _writer = self.registry.discovery.lock().await;
        let pending = self.registry.pending(&self.requests).await;
        if pending.is_empty() {
            return (Vec::new(), 0);
        }

        let mut by_dex: BTreeMap<String, Vec<PairRequest>> = BTreeMap::new();
        for request in pending {
            by_dex.entry(request.dex.clone()).or_default().push(request);
        }

        let mut discovered = Vec::new();
        let mut missing = 0;
        for (dex, requests) in by_dex {
            let dex = dex.as_str();
            let Some(source) = self.sources.get(dex) else {
                warn!(dex, "[DEX] no adapter configured, skipping discovery");
                continue;
            };
            let lock = keys::discovery_lock(dex);
            if !self.cache.try_lock(&lock, self.settings.discovery_lock_ttl).await {
                debug!(dex, "[DEX] discovery running elsewhere");
                continue;
            }

            for request in requests {
                match self.discover(source.as_ref(), &request).await {
                    Ok(Some(pair)) => {
                        let pool = pair.pool_address;
                        info!(
                            pair = %pair.label(),
                            pool = %addr_hex(&pool),
                            "[DEX] pair discovered"
                        );
                        if self.registry.insert(pair.clone()).await {
                            discovered.push(pair);
                        }
                        self.registry.resolve(request, Some(pool)).await;
                    }
                    Ok(None) => {
                        debug!(
                            dex,
                            token_a = %addr_hex(&request.token_a),
                            token_b = %addr_hex(&request.token_b),
                            "[DEX] pair does not exist, marked inactive"
                        );
                        self.registry.resolve(request, None).await;
                        missing += 1;
                    }
                    Err(e) => {
                        warn!(dex, error = %e, "[DEX] discovery failed, will retry next cycle")
                    }
                }
            }

            let pools: Vec<String> = self
                .registry
                .pools_for(dex)
                .await
                .iter()
                .map(addr_hex)
                .collect();
            self.cache.set_json(&keys::pairs(dex), &pools, None).await;
            self.cache.release(&lock).await;
        }
        (discovered, missing)
    }

    async fn discover(
        &self,
        source: &dyn QuoteSource,
        request: &PairRequest,
    ) -> std::result::Result<Option<TradingPair>, AdapterError> {
        let pool = match request.pool {
            Some(pool) => pool,
            None => match source.discover_pair(request.token_a, request.token_b).await? {
                Some(pool) => pool,
                None => return Ok(None),
            },
        };

        let (token0, token1) = source.fetch_tokens(pool).await?;
        let wanted: HashSet<Address> = [request.token_a, request.token_b].into();
        if token0 == token1 || !wanted.contains(&token0) || !wanted.contains(&token1) {
            return Err(AdapterError::InvalidState(format!(
                "pool {} does not trade the configured tokens",
                addr_hex(&pool)
            )));
        }

        Ok(Some(TradingPair {
            dex: source.dex().name.clone(),
            protocol: source.protocol(),
            token0: self.token(source, token0).await?,
            token1: self.token(source, token1).await?,
            pool_address: pool,
            fee: source.dex().fee,
            active: true,
            discovered_at: Utc::now(),
        }))
    }

    /// Configuration first, then `token:<addr>` in cache, then the chain.
    async fn token(
        &self,
        source: &dyn QuoteSource,
        address: Address,
    ) -> std::result::Result<TokenRef, AdapterError> {
        if let Some(token) = self.known_tokens.get(&address) {
            return Ok(token.clone());
        }
        let key = keys::token(&address);
        if let Some(token) = self.cache.get_json::<TokenRef>(&key).await {
            return Ok(token);
        }
        let token = source.fetch_token_metadata(address).await?;
        self.cache.set_json(&key, &token, None).await;
        Ok(token)
    }

    /// Write the batch with bounded retries. Returns `(written, dropped
    /// pairs)`.
    async fn persist(&self, batch: &RecordBatch) -> (usize, usize) {
        if batch.is_empty() {
            return (0, 0);
        }
        let max_attempts = self.settings.persist_retries.max(1);
        for attempt in 1..=max_attempts {
            match self.sink.write_batch(batch).await {
                Ok(written) => {
                    debug!(written, attempt, "[STORE] batch persisted");
                    return (written, 0);
                }
                Err(e) => {
                    warn!(attempt, max_attempts, error = %e, "[STORE] batch write failed");
                    if attempt < max_attempts {
                        sleep(self.settings.retry_backoff * attempt as u32).await;
                    }
                }
            }
        }
        (0, batch.affected_pairs())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheLayer;
    use crate::dex::fake::FakeSource;
    use crate::errors::PoolError;
    use crate::models::{CongestionLevel, GasPriceSample, ProtocolFamily};
    use crate::store::MemorySink;
    use async_trait::async_trait;
    use ethers::types::U256;
    use std::str::FromStr;

    fn token(byte: u8, symbol: &str) -> TokenRef {
        TokenRef {
            address: Address::repeat_byte(byte),
            symbol: symbol.into(),
            decimals: 18,
            chain_id: 1,
        }
    }

    fn pair(dex: &str, pool: u8) -> TradingPair {
        TradingPair {
            dex: dex.into(),
            protocol: ProtocolFamily::ConstantProduct,
            token0: token(0x01, "AAA"),
            token1: token(0x02, "BBB"),
            pool_address: Address::repeat_byte(pool),
            fee: 30,
            active: true,
            discovered_at: Utc::now(),
        }
    }

    fn settings() -> CollectorSettings {
        CollectorSettings {
            max_concurrency: 2,
            retry_backoff: Duration::from_millis(1),
            task_timeout: Duration::from_secs(5),
            ..CollectorSettings::default()
        }
    }

    fn no_cancel() -> watch::Receiver<bool> {
        let (tx, rx) = watch::channel(false);
        drop(tx);
        rx
    }

    async fn setup(
        source: FakeSource,
        cache: CacheLayer,
        settings: CollectorSettings,
        pools: &[u8],
    ) -> (Orchestrator, Arc<FakeSource>, Arc<MemorySink>) {
        let source = Arc::new(source);
        let sink = Arc::new(MemorySink::new());
        let orchestrator = Orchestrator::new(
            vec![source.clone() as Arc<dyn QuoteSource>],
            Arc::new(cache),
            sink.clone(),
            settings,
        );
        for &pool in pools {
            source.set_reserves(Address::repeat_byte(pool), 1000, 2000);
            orchestrator.registry().insert(pair("fake", pool)).await;
        }
        (orchestrator, source, sink)
    }

    struct FixedGas(Option<GasPriceSample>);

    #[async_trait]
    impl GasSource for FixedGas {
        async fn sample(&self) -> std::result::Result<GasPriceSample, PoolError> {
            self.0.clone().ok_or(PoolError::NoHealthyEndpoint)
        }
    }

    fn gas_sample() -> GasPriceSample {
        GasPriceSample {
            chain_id: 1,
            block_number: 10,
            base_fee: U256::from(30u64),
            priority_fee: U256::from(2u64),
            fast: U256::from(64u64),
            standard: U256::from(32u64),
            slow: U256::from(31u64),
            pending_tx_count: 120,
            congestion: CongestionLevel::Medium,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn one_failing_pair_does_not_block_the_rest() {
        let (orchestrator, source, sink) = setup(
            FakeSource::new("fake"),
            CacheLayer::disabled(),
            settings(),
            &[0x10, 0x11, 0x12],
        )
        .await;
        source.fail(Address::repeat_byte(0x11));

        let summary = orchestrator.run_cycle(no_cancel()).await;
        assert_eq!(summary.attempted, 3);
        assert_eq!(summary.succeeded, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(orchestrator.phase(), CyclePhase::Idle);
        // the failing pair was retried up to the fetch budget
        assert_eq!(source.reads(), 2 + 3);

        let batches = sink.batches().await;
        assert_eq!(batches.len(), 1);
        let batch = &batches[0];
        assert_eq!(batch.snapshots.len(), 2);
        assert_eq!(batch.prices.len(), 2);
        for (snapshot, price) in batch.snapshots.iter().zip(&batch.prices) {
            assert_eq!(snapshot.pair, price.pair);
            assert_eq!(snapshot.block_number, price.block_number);
            assert!(price.timestamp >= snapshot.timestamp);
            assert_eq!(price.price, BigDecimal::from(2u8));
            assert_eq!(price.inverse_price, BigDecimal::from_str("0.5").unwrap());
        }
        assert_eq!(summary.records_written, 4);
    }

    #[tokio::test]
    async fn cache_hit_skips_contract_reads() {
        let cache = CacheLayer::memory(Duration::from_secs(300));
        let (orchestrator, source, sink) =
            setup(FakeSource::new("fake"), cache, settings(), &[0x20, 0x21]).await;

        let first = orchestrator.run_cycle(no_cancel()).await;
        assert_eq!(first.succeeded, 2);
        assert_eq!(source.reads(), 2);

        let second = orchestrator.run_cycle(no_cancel()).await;
        assert_eq!(second.cached, 2);
        assert_eq!(second.succeeded, 0);
        assert_eq!(source.reads(), 2);
        assert_eq!(second.records_written, 0);
        assert_eq!(sink.batches().await.len(), 1);
        assert_eq!(orchestrator.cache().stats().hits, 2);
    }

    #[tokio::test]
    async fn persistence_is_retried_then_reported() {
        let (orchestrator, _source, sink) = setup(
            FakeSource::new("fake"),
            CacheLayer::disabled(),
            settings(),
            &[0x30, 0x31],
        )
        .await;

        sink.fail_next(2);
        let summary = orchestrator.run_cycle(no_cancel()).await;
        assert_eq!(summary.records_written, 4);
        assert_eq!(summary.persist_failures, 0);
        assert_eq!(sink.attempts(), 3);

        sink.fail_next(10);
        let summary = orchestrator.run_cycle(no_cancel()).await;
        assert_eq!(summary.succeeded, 2);
        assert_eq!(summary.records_written, 0);
        assert_eq!(summary.persist_failures, 2);
        assert_eq!(sink.attempts(), 6);
    }

    #[tokio::test]
    async fn dropped_batch_is_collected_again_next_cycle() {
        let cache = CacheLayer::memory(Duration::from_secs(300));
        let (orchestrator, source, sink) =
            setup(FakeSource::new("fake"), cache, settings(), &[0x38]).await;
        let pool = Address::repeat_byte(0x38);

        sink.fail_next(3);
        let first = orchestrator.run_cycle(no_cancel()).await;
        assert_eq!(first.succeeded, 1);
        assert_eq!(first.persist_failures, 1);
        assert!(!orchestrator.cache().exists(&keys::price(&pool)).await);

        let second = orchestrator.run_cycle(no_cancel()).await;
        assert_eq!(second.cached, 0);
        assert_eq!(second.succeeded, 1);
        assert_eq!(second.records_written, 2);
        assert_eq!(source.reads(), 2);
        assert_eq!(sink.batches().await.len(), 1);
        assert!(orchestrator.cache().exists(&keys::price(&pool)).await);

        let third = orchestrator.run_cycle(no_cancel()).await;
        assert_eq!(third.cached, 1);
        assert_eq!(source.reads(), 2);
    }

    #[tokio::test]
    async fn discovery_inserts_pairs_and_marks_missing_inactive() {
        let source = FakeSource::new("fake");
        let (a, b, c) = (
            Address::repeat_byte(0x01),
            Address::repeat_byte(0x02),
            Address::repeat_byte(0x03),
        );
        let pool = Address::repeat_byte(0x40);
        source.register_pool(b, a, pool);
        source.set_reserves(pool, 1000, 2000);

        let (orchestrator, source, sink) =
            setup(source, CacheLayer::memory(Duration::from_secs(300)), settings(), &[]).await;
        let orchestrator = orchestrator
            .with_tokens(vec![token(0x01, "AAA")])
            .with_requests(vec![
                PairRequest {
                    dex: "fake".into(),
                    token_a: b,
                    token_b: a,
                    pool: None,
                },
                PairRequest {
                    dex: "fake".into(),
                    token_a: a,
                    token_b: c,
                    pool: None,
                },
            ]);

        let summary = orchestrator.run_cycle(no_cancel()).await;
        assert_eq!(summary.discovered, 1);
        assert_eq!(summary.not_found, 1);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(orchestrator.registry().inactive_requests().await, 1);

        let discovered = orchestrator.registry().get(&pool).await.unwrap();
        assert_eq!(discovered.token0.address, a);
        assert_eq!(discovered.token0.symbol, "AAA");
        assert_eq!(discovered.token1.address, b);
        assert_eq!(discovered.token1.symbol, "T2");
        assert!(orchestrator.cache().exists(&keys::token(&b)).await);
        assert!(orchestrator.cache().exists(&keys::pairs("fake")).await);
        assert!(!orchestrator.cache().exists(&keys::discovery_lock("fake")).await);

        let batch = &sink.batches().await[0];
        assert_eq!(batch.pairs.len(), 1);
        assert_eq!(batch.snapshots.len(), 1);

        // resolved requests are not looked up again
        let again = orchestrator.run_cycle(no_cancel()).await;
        assert_eq!(again.discovered, 0);
        assert_eq!(again.not_found, 0);
        assert_eq!(source.reads(), 1);
    }

    #[tokio::test]
    async fn vanished_pair_is_deactivated() {
        let (orchestrator, source, _sink) = setup(
            FakeSource::new("fake"),
            CacheLayer::disabled(),
            settings(),
            &[0x50, 0x51],
        )
        .await;
        source
            .reserves
            .lock()
            .unwrap()
            .remove(&Address::repeat_byte(0x51));

        let summary = orchestrator.run_cycle(no_cancel()).await;
        assert_eq!(summary.not_found, 1);
        assert_eq!(summary.failed, 0);
        assert_eq!(orchestrator.registry().active().await.len(), 1);
        assert_eq!(orchestrator.registry().len().await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_leaves_no_partial_state() {
        let source = FakeSource::new("fake").with_delay(Duration::from_secs(10));
        let cache = CacheLayer::memory(Duration::from_secs(300));
        let (orchestrator, _source, sink) =
            setup(source, cache, settings(), &[0x60, 0x61, 0x62]).await;

        let summary = orchestrator
            .run_cycle_with_deadline(Duration::from_secs(1))
            .await;
        assert_eq!(summary.cancelled, 3);
        assert_eq!(summary.succeeded, 0);
        assert!(sink.batches().await.is_empty());
        assert!(!orchestrator.cache().exists(&keys::price(&Address::repeat_byte(0x60))).await);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_pair_times_out_instead_of_hanging() {
        let source = FakeSource::new("fake").with_delay(Duration::from_secs(30));
        let settings = CollectorSettings {
            task_timeout: Duration::from_secs(2),
            ..settings()
        };
        let (orchestrator, _source, _sink) =
            setup(source, CacheLayer::disabled(), settings, &[0x70]).await;

        let summary = orchestrator.run_cycle(no_cancel()).await;
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.records_written, 0);
    }

    #[tokio::test]
    async fn every_read_failing_still_completes() {
        let (orchestrator, source, sink) = setup(
            FakeSource::new("fake"),
            CacheLayer::disabled(),
            settings(),
            &[0x80, 0x81],
        )
        .await;
        source.fail(Address::repeat_byte(0x80));
        source.fail(Address::repeat_byte(0x81));
        let orchestrator = orchestrator.with_gas_source(Arc::new(FixedGas(None)));

        for _ in 0..3 {
            let summary = orchestrator.run_cycle(no_cancel()).await;
            assert_eq!(summary.failed, 2);
            assert!(!summary.gas_sampled);
        }
        assert!(sink.batches().await.is_empty());
    }

    #[tokio::test]
    async fn depth_and_gas_samples_join_the_batch() {
        let settings = CollectorSettings {
            depth_notionals: vec![BigDecimal::from(1u8), BigDecimal::from(10u8)],
            ..settings()
        };
        let source = FakeSource::new("fake");
        let (orchestrator, source, sink) =
            setup(source, CacheLayer::disabled(), settings, &[]).await;
        let pool = Address::repeat_byte(0x90);
        source
            .reserves
            .lock()
            .unwrap()
            .insert(pool, (U256::exp10(21), U256::exp10(21) * 2));
        orchestrator.registry().insert(pair("fake", 0x90)).await;
        let orchestrator = orchestrator.with_gas_source(Arc::new(FixedGas(Some(gas_sample()))));

        let summary = orchestrator.run_cycle(no_cancel()).await;
        assert!(summary.gas_sampled);
        let batch = &sink.batches().await[0];
        assert_eq!(batch.gas_samples.len(), 1);
        assert!(!batch.depth_samples.is_empty());
        assert_eq!(summary.depth_samples, batch.depth_samples.len());
        assert!(batch.prices[0].depth_curve.is_some());
        assert!(
            batch
                .depth_samples
                .iter()
                .all(|s| s.block_number == batch.snapshots[0].block_number)
        );
    }
}
