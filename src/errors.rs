use std::time::Duration;

use ethers::{
    contract::ContractError,
    providers::{Http, Provider, ProviderError},
};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, AppError>;

/// Startup and configuration failures surfaced by the binary.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Environment variable error: {0}")]
    Env(#[from] std::env::VarError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("Endpoint pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("Adapter error: {0}")]
    Adapter(#[from] AdapterError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Persistence error: {0}")]
    Persist(#[from] PersistError),
}

/// Failures of the RPC endpoint pool.
#[derive(Debug, Clone, Error)]
pub enum PoolError {
    #[error("no RPC endpoints provided")]
    NoEndpointsProvided,

    #[error("no endpoint could be constructed from the configured URLs")]
    NoHealthyEndpoints,

    #[error("no healthy endpoint available")]
    NoHealthyEndpoint,

    #[error("all endpoints failed after {attempts} attempt(s): {last_error}")]
    AllEndpointsFailed { attempts: usize, last_error: String },

    #[error("call timed out after {0:?}")]
    Timeout(Duration),
}

/// Failures of a protocol adapter while reading pool state.
#[derive(Debug, Clone, Error)]
pub enum AdapterError {
    #[error("contract call failed: {0}")]
    ContractCallFailed(String),

    #[error("pair not found on {dex}: {detail}")]
    PairNotFound { dex: String, detail: String },

    #[error("unknown protocol family: {0}")]
    UnknownProtocol(String),

    #[error(transparent)]
    Endpoint(#[from] PoolError),

    #[error("invalid pool state: {0}")]
    InvalidState(String),
}

impl AdapterError {
    /// Whether retrying the same read could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AdapterError::ContractCallFailed(_) | AdapterError::Endpoint(_)
        )
    }
}

impl From<ProviderError> for AdapterError {
    fn from(err: ProviderError) -> Self {
        AdapterError::ContractCallFailed(err.to_string())
    }
}

impl From<ContractError<Provider<Http>>> for AdapterError {
    fn from(err: ContractError<Provider<Http>>) -> Self {
        AdapterError::ContractCallFailed(err.to_string())
    }
}

/// Failure of a single trade simulation.
#[derive(Debug, Clone, Error)]
pub enum QuoteError {
    #[error("simulation failed: {0}")]
    SimulationFailed(String),
}

impl From<PoolError> for QuoteError {
    fn from(err: PoolError) -> Self {
        QuoteError::SimulationFailed(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache miss")]
    Miss,

    #[error("cache unavailable: {0}")]
    Unavailable(String),

    #[error("cache serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<redis::RedisError> for CacheError {
    fn from(err: redis::RedisError) -> Self {
        CacheError::Unavailable(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("batch write failed: {0}")]
    WriteFailed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
