//! Scriptable in-memory `QuoteSource` for tests.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use ethers::types::{Address, U256};

use super::constant_product::quote_exact_in;
use super::{PoolState, QuoteSource, SwapQuote};
use crate::errors::{AdapterError, QuoteError};
use crate::models::{
    DexConfig, ProtocolFamily, ReserveSnapshot, SwapDirection, TokenRef, TradingPair,
};

pub(crate) struct FakeSource {
    dex: DexConfig,
    /// Pool address -> reserves served by `fetch_reserve_state`.
    pub reserves: Mutex<HashMap<Address, (U256, U256)>>,
    /// Pools whose reads fail with a transient error.
    pub failing: Mutex<HashSet<Address>>,
    /// Sorted token pair -> pool address known to the factory.
    pub pools: Mutex<HashMap<(Address, Address), Address>>,
    /// Per-amount quote overrides for `simulate_swap`.
    pub quotes: Mutex<HashMap<U256, Result<SwapQuote, QuoteError>>>,
    pub delay: Option<Duration>,
    pub reads: AtomicUsize,
    block: AtomicU64,
}

impl FakeSource {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            dex: DexConfig {
                name: name.to_string(),
                protocol: ProtocolFamily::ConstantProduct.as_str().to_string(),
                router: None,
                factory: Address::repeat_byte(0xfa),
                quoter: None,
                fee: 30,
                chain_id: 1,
                supports_multi_hop: false,
                supports_flash_loans: false,
            },
            reserves: Mutex::new(HashMap::new()),
            failing: Mutex::new(HashSet::new()),
            pools: Mutex::new(HashMap::new()),
            quotes: Mutex::new(HashMap::new()),
            delay: None,
            reads: AtomicUsize::new(0),
            block: AtomicU64::new(1_000),
        }
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub(crate) fn set_reserves(&self, pool: Address, reserve0: u64, reserve1: u64) {
        self.reserves
            .lock()
            .unwrap()
            .insert(pool, (U256::from(reserve0), U256::from(reserve1)));
    }

    pub(crate) fn fail(&self, pool: Address) {
        self.failing.lock().unwrap().insert(pool);
    }

    pub(crate) fn register_pool(&self, a: Address, b: Address, pool: Address) {
        self.pools.lock().unwrap().insert(sorted(a, b), pool);
    }

    pub(crate) fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

fn sorted(a: Address, b: Address) -> (Address, Address) {
    if a < b { (a, b) } else { (b, a) }
}

#[async_trait]
impl QuoteSource for FakeSource {
    fn dex(&self) -> &DexConfig {
        &self.dex
    }

    fn protocol(&self) -> ProtocolFamily {
        ProtocolFamily::ConstantProduct
    }

    async fn discover_pair(
        &self,
        token_a: Address,
        token_b: Address,
    ) -> Result<Option<Address>, AdapterError> {
        Ok(self.pools.lock().unwrap().get(&sorted(token_a, token_b)).copied())
    }

    async fn fetch_tokens(&self, pool: Address) -> Result<(Address, Address), AdapterError> {
        self.pools
            .lock()
            .unwrap()
            .iter()
            .find(|(_, p)| **p == pool)
            .map(|(tokens, _)| *tokens)
            .ok_or_else(|| AdapterError::ContractCallFailed("unknown pool".into()))
    }

    async fn fetch_token_metadata(&self, token: Address) -> Result<TokenRef, AdapterError> {
        Ok(TokenRef {
            address: token,
            symbol: format!("T{}", token.as_bytes()[19]),
            decimals: 18,
            chain_id: 1,
        })
    }

    async fn fetch_reserve_state(
        &self,
        pair: &TradingPair,
    ) -> Result<ReserveSnapshot, AdapterError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.lock().unwrap().contains(&pair.pool_address) {
            return Err(AdapterError::ContractCallFailed("forced failure".into()));
        }
        let (reserve0, reserve1) = self
            .reserves
            .lock()
            .unwrap()
            .get(&pair.pool_address)
            .copied()
            .ok_or_else(|| AdapterError::PairNotFound {
                dex: self.dex.name.clone(),
                detail: pair.label(),
            })?;
        Ok(ReserveSnapshot {
            pair: pair.pool_address,
            dex: self.dex.name.clone(),
            state: PoolState::ConstantProduct { reserve0, reserve1 },
            block_number: self.block.fetch_add(1, Ordering::SeqCst),
            timestamp: Utc::now(),
        })
    }

    async fn simulate_swap(
        &self,
        _pair: &TradingPair,
        snapshot: &ReserveSnapshot,
        direction: SwapDirection,
        amount_in: U256,
    ) -> Result<SwapQuote, QuoteError> {
        if let Some(scripted) = self.quotes.lock().unwrap().get(&amount_in) {
            return scripted.clone();
        }
        let PoolState::ConstantProduct { reserve0, reserve1 } = snapshot.state else {
            return Err(QuoteError::SimulationFailed("unexpected state".into()));
        };
        quote_exact_in(reserve0, reserve1, self.dex.fee, direction, amount_in)
    }
}
