//! Configuration loader and application settings.
//!
//! Settings come from a TOML file (path in `COLLECTOR_CONFIG`, default
//! `collector.toml`); a handful of environment variables override it.

use std::collections::HashSet;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use bigdecimal::BigDecimal;
use ethers::types::Address;
use serde::Deserialize;
use url::Url;

use crate::errors::{AppError, Result};
use crate::models::{DexConfig, ProtocolFamily, TokenRef};
use crate::orchestrator::PairRequest;

const DEFAULT_CONFIG_PATH: &str = "collector.toml";

/// Consolidated application configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub endpoints: Vec<EndpointConfig>,
    #[serde(default)]
    pub rpc: RpcConfig,
    pub dexes: Vec<DexConfig>,
    #[serde(default)]
    pub tokens: Vec<TokenRef>,
    #[serde(default)]
    pub pairs: Vec<PairConfig>,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub collection: CollectionConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
}

/// One RPC endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct EndpointConfig {
    pub url: String,
    pub chain_id: u64,
    /// Per-call timeout.
    #[serde(default = "default_call_timeout_secs")]
    pub timeout_secs: u64,
}

impl EndpointConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    pub health_check_interval_secs: u64,
    pub retry_backoff_ms: u64,
    /// Attempts per pooled call; capped at the number of endpoints.
    pub max_attempts: usize,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            health_check_interval_secs: 300,
            retry_backoff_ms: 50,
            max_attempts: 3,
        }
    }
}

/// A token pair to track on one dex.
///
/// Tokens are referenced by configured symbol or by address; `pool` skips
/// factory discovery when the pool address is already known.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
pub struct PairConfig {
    pub dex: String,
    pub token0: String,
    pub token1: String,
    #[serde(default)]
    pub pool: Option<Address>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    /// Full connection URL; takes precedence over host/port/password.
    pub redis_url: Option<String>,
    pub host: Option<String>,
    pub port: u16,
    pub password: Option<String>,
    pub default_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            redis_url: None,
            host: None,
            port: 6379,
            password: None,
            default_ttl_secs: 300,
        }
    }
}

impl CacheConfig {
    /// Redis connection URL, if Redis is configured at all.
    pub fn connection_url(&self) -> Option<String> {
        if let Some(url) = &self.redis_url {
            return Some(url.clone());
        }
        let host = self.host.as_ref()?;
        Some(match &self.password {
            Some(password) => format!("redis://:{}@{}:{}/", password, host, self.port),
            None => format!("redis://{}:{}/", host, self.port),
        })
    }

    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CollectionConfig {
    pub interval_secs: u64,
    pub max_concurrency: usize,
    pub fetch_retries: usize,
    pub retry_backoff_ms: u64,
    pub persist_retries: usize,
    pub depth_sampling: bool,
    /// Trade sizes in display units of the input token.
    pub depth_notionals: Vec<String>,
    pub sample_gas: bool,
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            interval_secs: 300,
            max_concurrency: 20,
            fetch_retries: 3,
            retry_backoff_ms: 50,
            persist_retries: 3,
            depth_sampling: true,
            depth_notionals: ["1", "10", "100", "1000"].map(String::from).to_vec(),
            sample_gas: true,
        }
    }
}

impl CollectionConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn notionals(&self) -> Result<Vec<BigDecimal>> {
        self.depth_notionals
            .iter()
            .map(|raw| {
                BigDecimal::from_str(raw)
                    .map_err(|e| AppError::Config(format!("invalid depth notional {raw}: {e}")))
            })
            .collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub output_dir: PathBuf,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("data"),
        }
    }
}

fn default_call_timeout_secs() -> u64 {
    20
}

impl AppConfig {
    /// Load from the file named by `COLLECTOR_CONFIG`, then apply environment
    /// overrides and validate.
    pub fn load() -> Result<Self> {
        let path =
            std::env::var("COLLECTOR_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.into());
        let raw = std::fs::read_to_string(&path)
            .map_err(|e| AppError::Config(format!("cannot read {path}: {e}")))?;
        let mut config = Self::from_toml_str(&raw)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(urls) = std::env::var("RPC_URLS") {
            let chain_id = match std::env::var("CHAIN_ID") {
                Ok(raw) => raw
                    .parse()
                    .map_err(|e| AppError::Config(format!("invalid CHAIN_ID: {e}")))?,
                Err(_) => self.endpoints.first().map(|e| e.chain_id).unwrap_or(1),
            };
            let timeout_secs = self
                .endpoints
                .first()
                .map(|e| e.timeout_secs)
                .unwrap_or_else(default_call_timeout_secs);
            self.endpoints = urls
                .split(',')
                .map(str::trim)
                .filter(|u| !u.is_empty())
                .map(|url| EndpointConfig {
                    url: url.to_string(),
                    chain_id,
                    timeout_secs,
                })
                .collect();
        }
        if let Ok(url) = std::env::var("REDIS_URL") {
            self.cache.redis_url = Some(url);
        }
        if let Some(ttl) = env_parse::<u64>("CACHE_TTL_SECS")? {
            self.cache.default_ttl_secs = ttl;
        }
        if let Some(interval) = env_parse::<u64>("COLLECTION_INTERVAL_SECS")? {
            self.collection.interval_secs = interval;
        }
        if let Some(concurrency) = env_parse::<usize>("MAX_CONCURRENCY")? {
            self.collection.max_concurrency = concurrency;
        }
        if let Ok(dir) = std::env::var("OUTPUT_DIR") {
            self.persistence.output_dir = PathBuf::from(dir);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.endpoints.is_empty() {
            return Err(AppError::Config("at least one RPC endpoint is required".into()));
        }
        for endpoint in &self.endpoints {
            Url::parse(&endpoint.url)?;
        }

        let mut dex_names = HashSet::new();
        for dex in &self.dexes {
            ProtocolFamily::from_str(&dex.protocol)?;
            if !dex_names.insert(dex.name.as_str()) {
                return Err(AppError::Config(format!("duplicate dex name {}", dex.name)));
            }
        }

        for pair in &self.pairs {
            if !dex_names.contains(pair.dex.as_str()) {
                return Err(AppError::Config(format!(
                    "pair {}/{} references unknown dex {}",
                    pair.token0, pair.token1, pair.dex
                )));
            }
            for token in [&pair.token0, &pair.token1] {
                if self.token_by_symbol(token).is_none() && token.parse::<Address>().is_err() {
                    return Err(AppError::Config(format!(
                        "pair on {} references unknown token {}",
                        pair.dex, token
                    )));
                }
            }
        }

        if self.collection.max_concurrency == 0 {
            return Err(AppError::Config("max_concurrency must be positive".into()));
        }
        for notional in self.collection.notionals()? {
            if notional <= BigDecimal::from(0u8) {
                return Err(AppError::Config(format!(
                    "depth notional must be positive, got {notional}"
                )));
            }
        }
        Ok(())
    }

    pub fn token_by_symbol(&self, symbol: &str) -> Option<&TokenRef> {
        self.tokens
            .iter()
            .find(|t| t.symbol.eq_ignore_ascii_case(symbol))
    }

    pub fn dex(&self, name: &str) -> Option<&DexConfig> {
        self.dexes.iter().find(|d| d.name == name)
    }

    /// Symbol, or failing that a literal address.
    pub fn resolve_token(&self, reference: &str) -> Option<Address> {
        self.token_by_symbol(reference)
            .map(|t| t.address)
            .or_else(|| reference.parse().ok())
    }

    /// Configured pairs with token references resolved to addresses.
    pub fn pair_requests(&self) -> Result<Vec<PairRequest>> {
        self.pairs
            .iter()
            .map(|pair| {
                let token = |reference: &str| {
                    self.resolve_token(reference).ok_or_else(|| {
                        AppError::Config(format!("unknown token {reference} on {}", pair.dex))
                    })
                };
                Ok(PairRequest {
                    dex: pair.dex.clone(),
                    token_a: token(&pair.token0)?,
                    token_b: token(&pair.token1)?,
                    pool: pair.pool,
                })
            })
            .collect()
    }
}

fn env_parse<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .map_err(|e| AppError::Config(format!("invalid {key}: {e}"))),
        Err(_) => Ok(None),
    }
}
