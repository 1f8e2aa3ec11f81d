//! Protocol adapters: a uniform read interface over constant-product and
//! concentrated-liquidity pools.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use ethers::types::{Address, U256};

use crate::errors::{AdapterError, QuoteError};
use crate::models::{
    DexConfig, PriceRecord, ProtocolFamily, ReserveSnapshot, SwapDirection, TokenRef, TradingPair,
};
use crate::rpc::EndpointPool;

pub mod calc;
pub mod concentrated;
pub mod constant_product;
pub mod contracts;
pub mod state;

#[cfg(test)]
pub(crate) mod fake;

pub use concentrated::ConcentratedLiquidityAdapter;
pub use constant_product::ConstantProductAdapter;
pub use state::PoolState;

/// Outcome of simulating one exact-input swap against a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapQuote {
    pub amount_in: U256,
    pub amount_out: U256,
    pub sqrt_price_x96_before: U256,
    pub sqrt_price_x96_after: U256,
}

/// Read-side capability every supported AMM family provides.
#[async_trait]
pub trait QuoteSource: Send + Sync {
    fn dex(&self) -> &DexConfig;

    fn protocol(&self) -> ProtocolFamily;

    /// Factory lookup. `Ok(None)` means the factory reports no such pool.
    async fn discover_pair(
        &self,
        token_a: Address,
        token_b: Address,
    ) -> Result<Option<Address>, AdapterError>;

    /// `(token0, token1)` as ordered by the pool contract.
    async fn fetch_tokens(&self, pool: Address) -> Result<(Address, Address), AdapterError>;

    async fn fetch_token_metadata(&self, token: Address) -> Result<TokenRef, AdapterError>;

    async fn fetch_reserve_state(&self, pair: &TradingPair)
    -> Result<ReserveSnapshot, AdapterError>;

    async fn simulate_swap(
        &self,
        pair: &TradingPair,
        snapshot: &ReserveSnapshot,
        direction: SwapDirection,
        amount_in: U256,
    ) -> Result<SwapQuote, QuoteError>;
}

/// Pick the adapter for a dex by its protocol family.
pub fn build_quote_source(
    dex: DexConfig,
    endpoints: Arc<EndpointPool>,
    max_attempts: usize,
) -> Result<Arc<dyn QuoteSource>, AdapterError> {
    let source: Arc<dyn QuoteSource> = match ProtocolFamily::from_str(&dex.protocol)? {
        ProtocolFamily::ConstantProduct => {
            Arc::new(ConstantProductAdapter::new(dex, endpoints, max_attempts))
        }
        ProtocolFamily::ConcentratedLiquidity => Arc::new(ConcentratedLiquidityAdapter::new(
            dex,
            endpoints,
            max_attempts,
        )?),
    };
    Ok(source)
}

/// Normalise a snapshot into a price quoted as token1 per token0.
///
/// The record inherits the snapshot's block and timestamp.
pub fn derive_price_record(
    pair: &TradingPair,
    snapshot: &ReserveSnapshot,
) -> Result<PriceRecord, AdapterError> {
    let raw = snapshot
        .state
        .raw_price()
        .ok_or_else(|| AdapterError::InvalidState(format!("{} has no price", pair.label())))?;
    let display = calc::adjust_for_decimals(&raw, pair.token0.decimals, pair.token1.decimals);
    let (price, inverse_price) = calc::price_pair(&display)
        .ok_or_else(|| AdapterError::InvalidState(format!("{} price is zero", pair.label())))?;

    let (fee_growth_global0_x128, fee_growth_global1_x128) = match &snapshot.state {
        PoolState::ConcentratedLiquidity {
            fee_growth_global0_x128,
            fee_growth_global1_x128,
            ..
        } => (
            Some(fee_growth_global0_x128.to_string()),
            Some(fee_growth_global1_x128.to_string()),
        ),
        PoolState::ConstantProduct { .. } => (None, None),
    };

    Ok(PriceRecord {
        pair: snapshot.pair,
        dex: snapshot.dex.clone(),
        block_number: snapshot.block_number,
        timestamp: snapshot.timestamp,
        price,
        inverse_price,
        fee_growth_global0_x128,
        fee_growth_global1_x128,
        depth_curve: None,
    })
}

/// ERC-20 `symbol()` and `decimals()`.
pub(crate) async fn read_token_metadata(
    endpoints: &EndpointPool,
    token: Address,
    chain_id: u64,
    max_attempts: usize,
) -> Result<TokenRef, AdapterError> {
    let (symbol, decimals) = endpoints
        .execute(
            |endpoint| async move {
                let contract = contracts::Erc20::new(token, endpoint.provider());
                let symbol = contract.symbol().call().await?;
                let decimals = contract.decimals().call().await?;
                Ok::<_, AdapterError>((symbol, decimals))
            },
            max_attempts,
        )
        .await?;
    Ok(TokenRef {
        address: token,
        symbol,
        decimals,
        chain_id,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::EndpointConfig;
    use crate::rpc::PoolOptions;
    use bigdecimal::BigDecimal;
    use chrono::Utc;
    use std::str::FromStr;

    pub(crate) fn token(byte: u8, symbol: &str, decimals: u8) -> TokenRef {
        TokenRef {
            address: Address::repeat_byte(byte),
            symbol: symbol.to_string(),
            decimals,
            chain_id: 1,
        }
    }

    pub(crate) fn pair(protocol: ProtocolFamily, pool: u8, d0: u8, d1: u8) -> TradingPair {
        TradingPair {
            dex: "test-dex".into(),
            protocol,
            token0: token(0x01, "WETH", d0),
            token1: token(0x02, "USDC", d1),
            pool_address: Address::repeat_byte(pool),
            fee: 30,
            active: true,
            discovered_at: Utc::now(),
        }
    }

    pub(crate) fn snapshot(pair: &TradingPair, state: PoolState, block: u64) -> ReserveSnapshot {
        ReserveSnapshot {
            pair: pair.pool_address,
            dex: pair.dex.clone(),
            state,
            block_number: block,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn constant_product_record_from_reserves() {
        let pair = pair(ProtocolFamily::ConstantProduct, 0xaa, 18, 18);
        let snap = snapshot(
            &pair,
            PoolState::ConstantProduct {
                reserve0: U256::from(1000u64),
                reserve1: U256::from(2000u64),
            },
            100,
        );
        let record = derive_price_record(&pair, &snap).unwrap();
        assert_eq!(record.price, BigDecimal::from(2u8));
        assert_eq!(record.inverse_price, BigDecimal::from_str("0.5").unwrap());
        assert_eq!(record.block_number, snap.block_number);
        assert_eq!(record.timestamp, snap.timestamp);
        assert!(record.fee_growth_global0_x128.is_none());
    }

    #[test]
    fn concentrated_record_carries_fee_growth() {
        let pair = pair(ProtocolFamily::ConcentratedLiquidity, 0xbb, 18, 6);
        let snap = snapshot(
            &pair,
            PoolState::ConcentratedLiquidity {
                sqrt_price_x96: U256::from_dec_str("3068749236824975214635631").unwrap(),
                tick: -202_000,
                liquidity: 10u128.pow(18),
                fee_growth_global0_x128: U256::from(7u8),
                fee_growth_global1_x128: U256::from(9u8),
            },
            200,
        );
        let record = derive_price_record(&pair, &snap).unwrap();
        let target = BigDecimal::from_str("1500.25").unwrap();
        assert!((&record.price - &target).abs() < BigDecimal::from_str("1e-12").unwrap());
        let product = &record.price * &record.inverse_price;
        assert!((product - BigDecimal::from(1u8)).abs() < BigDecimal::from_str("1e-30").unwrap());
        assert_eq!(record.fee_growth_global0_x128.as_deref(), Some("7"));
        assert_eq!(record.fee_growth_global1_x128.as_deref(), Some("9"));
    }

    #[test]
    fn empty_pool_has_no_record() {
        let pair = pair(ProtocolFamily::ConstantProduct, 0xcc, 18, 18);
        let snap = snapshot(
            &pair,
            PoolState::ConstantProduct {
                reserve0: U256::zero(),
                reserve1: U256::zero(),
            },
            1,
        );
        assert!(matches!(
            derive_price_record(&pair, &snap),
            Err(AdapterError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn factory_selects_adapter_by_protocol() {
        let endpoints = Arc::new(
            EndpointPool::new(
                &[EndpointConfig {
                    url: "http://127.0.0.1:8545".into(),
                    chain_id: 1,
                    timeout_secs: 1,
                }],
                PoolOptions::default(),
            )
            .unwrap(),
        );
        let mut dex = DexConfig {
            name: "uni".into(),
            protocol: "amm-constant-product".into(),
            router: None,
            factory: Address::repeat_byte(0x11),
            quoter: None,
            fee: 30,
            chain_id: 1,
            supports_multi_hop: false,
            supports_flash_loans: false,
        };
        let v2 = build_quote_source(dex.clone(), Arc::clone(&endpoints), 3).unwrap();
        assert_eq!(v2.protocol(), ProtocolFamily::ConstantProduct);

        dex.protocol = "amm-concentrated-liquidity".into();
        let v3 = build_quote_source(dex.clone(), Arc::clone(&endpoints), 3).unwrap();
        assert_eq!(v3.protocol(), ProtocolFamily::ConcentratedLiquidity);
        assert_eq!(v3.dex().name, "uni");

        dex.protocol = "orderbook".into();
        let err = build_quote_source(dex, endpoints, 3).err().unwrap();
        assert!(matches!(err, AdapterError::UnknownProtocol(p) if p == "orderbook"));
    }
}
