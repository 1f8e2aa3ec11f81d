//! Load-balanced pool of JSON-RPC endpoints.
//!
//! Selection is plain round-robin over every endpoint. Health is tracked
//! lazily: a failed call marks the endpoint unhealthy and `execute` moves on
//! to the next one, while a background loop periodically probes each
//! endpoint with `eth_blockNumber` and reports aggregate counts.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use ethers::providers::{Http, Middleware, Provider};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::EndpointConfig;
use crate::errors::PoolError;

pub type EndpointHandle = Arc<Endpoint>;

/// Result of the most recent probe of an endpoint.
#[derive(Debug, Clone)]
pub struct HealthCheck {
    pub healthy: bool,
    pub block_number: Option<u64>,
    pub error: Option<String>,
    pub checked_at: DateTime<Utc>,
}

/// One RPC endpoint. Only the pool mutates its health state.
#[derive(Debug)]
pub struct Endpoint {
    url: String,
    chain_id: u64,
    timeout: Duration,
    provider: Arc<Provider<Http>>,
    healthy: AtomicBool,
    last_check: Mutex<Option<HealthCheck>>,
}

impl Endpoint {
    fn new(config: &EndpointConfig) -> Result<Self, String> {
        let url = Url::parse(&config.url).map_err(|e| e.to_string())?;
        let provider = Provider::new(Http::new(url));
        Ok(Self {
            url: config.url.clone(),
            chain_id: config.chain_id,
            timeout: config.timeout(),
            provider: Arc::new(provider),
            healthy: AtomicBool::new(true),
            last_check: Mutex::new(None),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    /// Per-call timeout applied by [`EndpointPool::execute`].
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn provider(&self) -> Arc<Provider<Http>> {
        Arc::clone(&self.provider)
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    pub fn last_check(&self) -> Option<HealthCheck> {
        self.last_check
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn record(&self, check: HealthCheck) {
        self.healthy.store(check.healthy, Ordering::Relaxed);
        *self
            .last_check
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(check);
    }

    fn mark(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Relaxed);
    }
}

/// Tunables for the pool itself (endpoints come from [`EndpointConfig`]).
#[derive(Debug, Clone)]
pub struct PoolOptions {
    pub health_check_interval: Duration,
    pub retry_backoff: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            health_check_interval: Duration::from_secs(300),
            retry_backoff: Duration::from_millis(50),
        }
    }
}

pub struct EndpointPool {
    endpoints: Arc<Vec<EndpointHandle>>,
    next: AtomicUsize,
    retry_backoff: Duration,
    shutdown_tx: watch::Sender<bool>,
    health_task: Mutex<Option<JoinHandle<()>>>,
}

impl EndpointPool {
    /// Build the pool and start its health-check loop.
    ///
    /// Must be called from within a tokio runtime. Endpoints whose URL cannot
    /// be parsed are skipped with a warning.
    pub fn new(configs: &[EndpointConfig], options: PoolOptions) -> Result<Self, PoolError> {
        if configs.is_empty() {
            return Err(PoolError::NoEndpointsProvided);
        }

        let mut endpoints = Vec::with_capacity(configs.len());
        for config in configs {
            match Endpoint::new(config) {
                Ok(endpoint) => endpoints.push(Arc::new(endpoint)),
                Err(e) => {
                    warn!(url = %config.url, error = %e, "[POOL] skipping malformed endpoint")
                }
            }
        }
        if endpoints.is_empty() {
            return Err(PoolError::NoHealthyEndpoints);
        }

        let endpoints = Arc::new(endpoints);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let health_task = spawn_health_checker(
            Arc::clone(&endpoints),
            options.health_check_interval,
            shutdown_rx,
        );
        info!(
            endpoints = endpoints.len(),
            interval_secs = options.health_check_interval.as_secs(),
            "[POOL] endpoint pool ready"
        );

        Ok(Self {
            endpoints,
            next: AtomicUsize::new(0),
            retry_backoff: options.retry_backoff,
            shutdown_tx,
            health_task: Mutex::new(Some(health_task)),
        })
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// Next endpoint in rotation, whatever its last known health.
    pub fn acquire(&self) -> EndpointHandle {
        self.slot(self.next.fetch_add(1, Ordering::Relaxed))
    }

    fn slot(&self, position: usize) -> EndpointHandle {
        Arc::clone(&self.endpoints[position % self.endpoints.len()])
    }

    /// Rotate until an endpoint last seen healthy comes up, trying at most
    /// `max_attempts` positions.
    pub fn acquire_with_retry(&self, max_attempts: usize) -> Result<EndpointHandle, PoolError> {
        for _ in 0..max_attempts.max(1) {
            let endpoint = self.acquire();
            if endpoint.is_healthy() {
                return Ok(endpoint);
            }
            debug!(url = %endpoint.url(), "[POOL] skipping unhealthy endpoint");
        }
        Err(PoolError::NoHealthyEndpoint)
    }

    /// Run `op` against successive endpoints until one succeeds.
    ///
    /// Makes exactly `min(max_attempts, len)` attempts (at least one), each
    /// bounded by the endpoint's timeout, sleeping `retry_backoff` between
    /// attempts.
    pub async fn execute<T, E, F, Fut>(&self, op: F, max_attempts: usize) -> Result<T, PoolError>
    where
        F: Fn(EndpointHandle) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let attempts = max_attempts.clamp(1, self.endpoints.len());
        let mut last_error = String::new();
        // Retries walk forward from one reserved slot, whatever other callers
        // acquire in between.
        let start = self.next.fetch_add(1, Ordering::Relaxed);

        for attempt in 1..=attempts {
            let endpoint = self.slot(start.wrapping_add(attempt - 1));
            let outcome = tokio::time::timeout(endpoint.timeout(), op(Arc::clone(&endpoint))).await;
            match outcome {
                Ok(Ok(value)) => {
                    endpoint.mark(true);
                    return Ok(value);
                }
                Ok(Err(e)) => {
                    last_error = e.to_string();
                }
                Err(_) => {
                    last_error = PoolError::Timeout(endpoint.timeout()).to_string();
                }
            }
            endpoint.mark(false);
            debug!(
                url = %endpoint.url(),
                attempt,
                attempts,
                error = %last_error,
                "[POOL] endpoint call failed"
            );
            if attempt < attempts {
                tokio::time::sleep(self.retry_backoff).await;
            }
        }

        Err(PoolError::AllEndpointsFailed {
            attempts,
            last_error,
        })
    }

    /// `(healthy, total)` from the last known state of every endpoint.
    pub fn health_ratio(&self) -> (usize, usize) {
        let healthy = self.endpoints.iter().filter(|e| e.is_healthy()).count();
        (healthy, self.endpoints.len())
    }

    /// Probe every endpoint now, outside the regular schedule.
    pub async fn check_health(&self) -> (usize, usize) {
        check_all(&self.endpoints).await
    }

    /// Stop the health-check loop. Safe to call more than once.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let task = self
            .health_task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "[POOL] health-check task ended abnormally");
            }
            info!("[POOL] endpoint pool shut down");
        }
    }
}

impl Drop for EndpointPool {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(task) = self
            .health_task
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        {
            task.abort();
        }
    }
}

fn spawn_health_checker(
    endpoints: Arc<Vec<EndpointHandle>>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        // first probe one interval after start; construction already validated URLs
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    check_all(&endpoints).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("[POOL] health-check loop stopped");
    })
}

async fn check_all(endpoints: &[EndpointHandle]) -> (usize, usize) {
    let probes = endpoints.iter().map(|endpoint| async move {
        let provider = endpoint.provider();
        let result = tokio::time::timeout(endpoint.timeout(), provider.get_block_number()).await;
        let check = match result {
            Ok(Ok(block)) => HealthCheck {
                healthy: true,
                block_number: Some(block.as_u64()),
                error: None,
                checked_at: Utc::now(),
            },
            Ok(Err(e)) => HealthCheck {
                healthy: false,
                block_number: None,
                error: Some(e.to_string()),
                checked_at: Utc::now(),
            },
            Err(_) => HealthCheck {
                healthy: false,
                block_number: None,
                error: Some(PoolError::Timeout(endpoint.timeout()).to_string()),
                checked_at: Utc::now(),
            },
        };
        endpoint.record(check);
    });
    futures::future::join_all(probes).await;

    let healthy = endpoints.iter().filter(|e| e.is_healthy()).count();
    let total = endpoints.len();
    if healthy == total {
        info!(healthy, total, "[POOL] health check");
    } else {
        warn!(healthy, unhealthy = total - healthy, total, "[POOL] health check");
    }
    (healthy, total)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn configs(n: usize) -> Vec<EndpointConfig> {
        (0..n)
            .map(|i| EndpointConfig {
                url: format!("http://127.0.0.1:{}", 9000 + i),
                chain_id: 1,
                timeout_secs: 1,
            })
            .collect()
    }

    fn pool(n: usize) -> EndpointPool {
        EndpointPool::new(
            &configs(n),
            PoolOptions {
                health_check_interval: Duration::from_secs(3600),
                retry_backoff: Duration::from_millis(1),
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn empty_config_is_rejected() {
        let err = EndpointPool::new(&[], PoolOptions::default()).err().unwrap();
        assert!(matches!(err, PoolError::NoEndpointsProvided));
    }

    #[tokio::test]
    async fn all_malformed_urls_are_rejected() {
        let bad = vec![EndpointConfig {
            url: "not a url".into(),
            chain_id: 1,
            timeout_secs: 1,
        }];
        let err = EndpointPool::new(&bad, PoolOptions::default()).err().unwrap();
        assert!(matches!(err, PoolError::NoHealthyEndpoints));
    }

    #[tokio::test]
    async fn round_robin_wraps_after_n_calls() {
        let pool = pool(3);
        let first = pool.acquire();
        let _ = pool.acquire();
        let _ = pool.acquire();
        let fourth = pool.acquire();
        assert_eq!(first.url(), fourth.url());
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn execute_moves_to_next_endpoint_on_failure() {
        let pool = pool(3);
        let bad = pool.acquire().url().to_string();
        // rotation is now at the second endpoint; rewind so `bad` is tried first
        let _ = pool.acquire();
        let _ = pool.acquire();

        let result = pool
            .execute(
                |ep| {
                    let bad = bad.clone();
                    async move {
                        if ep.url() == bad {
                            Err("boom")
                        } else {
                            Ok(ep.url().to_string())
                        }
                    }
                },
                3,
            )
            .await
            .unwrap();
        assert_ne!(result, bad);
        assert_eq!(pool.health_ratio(), (2, 3));
    }

    #[tokio::test]
    async fn execute_exhausts_min_of_attempts_and_pool_size() {
        let pool = pool(3);
        let calls = AtomicUsize::new(0);
        let err = pool
            .execute(
                |_ep| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err::<(), _>("down") }
                },
                10,
            )
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(matches!(err, PoolError::AllEndpointsFailed { attempts: 3, .. }));

        let calls = AtomicUsize::new(0);
        let err = pool
            .execute(
                |_ep| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err::<(), _>("down") }
                },
                2,
            )
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(matches!(err, PoolError::AllEndpointsFailed { attempts: 2, .. }));
    }

    #[tokio::test]
    async fn execute_times_out_hung_calls() {
        let pool = pool(1);
        let err = pool
            .execute(
                |_ep| async {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok::<_, String>(())
                },
                1,
            )
            .await
            .unwrap_err();
        match err {
            PoolError::AllEndpointsFailed { attempts, last_error } => {
                assert_eq!(attempts, 1);
                assert!(last_error.contains("timed out"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn retry_uses_next_endpoint_despite_concurrent_acquires() {
        let pool = pool(2);
        let tried = Mutex::new(Vec::new());
        let result = pool
            .execute(
                |ep| {
                    tried.lock().unwrap().push(ep.url().to_string());
                    // another worker takes a slot between our attempts
                    let _ = pool.acquire();
                    async move {
                        if ep.url().ends_with(":9000") {
                            Err("boom")
                        } else {
                            Ok(ep.url().to_string())
                        }
                    }
                },
                2,
            )
            .await
            .unwrap();
        assert_eq!(result, "http://127.0.0.1:9001");
        assert_eq!(
            *tried.lock().unwrap(),
            vec!["http://127.0.0.1:9000", "http://127.0.0.1:9001"]
        );
    }

    #[tokio::test]
    async fn on_demand_check_marks_unreachable_endpoints() {
        let pool = pool(2);
        assert_eq!(pool.check_health().await, (0, 2));
        assert_eq!(pool.health_ratio(), (0, 2));
        for endpoint in pool.endpoints.iter() {
            let check = endpoint.last_check().unwrap();
            assert!(!check.healthy);
            assert!(check.block_number.is_none());
            assert!(check.error.is_some());
        }
        pool.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn health_loop_probes_each_interval_until_shutdown() {
        let interval = Duration::from_secs(60);
        let pool = EndpointPool::new(
            &configs(2),
            PoolOptions {
                health_check_interval: interval,
                retry_backoff: Duration::from_millis(1),
            },
        )
        .unwrap();
        assert_eq!(pool.health_ratio(), (2, 2));
        assert!(pool.endpoints.iter().all(|e| e.last_check().is_none()));

        tokio::time::sleep(interval).await;
        for _ in 0..30 {
            if pool.endpoints.iter().all(|e| e.last_check().is_some()) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        assert_eq!(pool.health_ratio(), (0, 2));
        assert!(pool.endpoints.iter().all(|e| e.last_check().is_some()));

        pool.shutdown().await;
        assert!(pool.health_task.lock().unwrap().is_none());
        for endpoint in pool.endpoints.iter() {
            endpoint.mark(true);
        }
        tokio::time::sleep(interval * 3).await;
        assert_eq!(pool.health_ratio(), (2, 2));
    }

    #[tokio::test]
    async fn acquire_with_retry_skips_unhealthy() {
        let pool = pool(2);
        pool.endpoints[0].mark(false);
        let endpoint = pool.acquire_with_retry(2).unwrap();
        assert_eq!(endpoint.url(), pool.endpoints[1].url());

        pool.endpoints[1].mark(false);
        assert!(matches!(
            pool.acquire_with_retry(4),
            Err(PoolError::NoHealthyEndpoint)
        ));
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let pool = pool(1);
        pool.shutdown().await;
        pool.shutdown().await;
        assert!(pool.health_task.lock().unwrap().is_none());
    }
}
