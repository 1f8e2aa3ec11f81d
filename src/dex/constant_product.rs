//! Adapter for Uniswap V2 style `x * y = k` pools.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use ethers::providers::Middleware;
use ethers::types::{Address, BlockNumber, U256};
use tracing::debug;

use super::calc;
use super::contracts::{UniswapV2Factory, UniswapV2Pair};
use super::{PoolState, QuoteSource, SwapQuote, read_token_metadata};
use crate::errors::{AdapterError, QuoteError};
use crate::models::{
    DexConfig, ProtocolFamily, ReserveSnapshot, SwapDirection, TokenRef, TradingPair,
};
use crate::rpc::EndpointPool;
use crate::utils::addr_hex;

pub struct ConstantProductAdapter {
    dex: DexConfig,
    endpoints: Arc<EndpointPool>,
    max_attempts: usize,
}

impl ConstantProductAdapter {
    pub fn new(dex: DexConfig, endpoints: Arc<EndpointPool>, max_attempts: usize) -> Self {
        Self {
            dex,
            endpoints,
            max_attempts,
        }
    }
}

#[async_trait]
impl QuoteSource for ConstantProductAdapter {
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
        let factory = self.dex.factory;
        let pool = self
            .endpoints
            .execute(
                |endpoint| async move {
                    UniswapV2Factory::new(factory, endpoint.provider())
                        .get_pair(token_a, token_b)
                        .call()
                        .await
                },
                self.max_attempts,
            )
            .await?;

        if pool.is_zero() {
            debug!(
                dex = %self.dex.name,
                token_a = %addr_hex(&token_a),
                token_b = %addr_hex(&token_b),
                "[DEX] factory has no pair"
            );
            return Ok(None);
        }
        Ok(Some(pool))
    }

    async fn fetch_tokens(&self, pool: Address) -> Result<(Address, Address), AdapterError> {
        let tokens = self
            .endpoints
            .execute(
                |endpoint| async move {
                    let contract = UniswapV2Pair::new(pool, endpoint.provider());
                    let token0 = contract.token_0().call().await?;
                    let token1 = contract.token_1().call().await?;
                    Ok::<_, AdapterError>((token0, token1))
                },
                self.max_attempts,
            )
            .await?;
        Ok(tokens)
    }

    async fn fetch_token_metadata(&self, token: Address) -> Result<TokenRef, AdapterError> {
        read_token_metadata(&self.endpoints, token, self.dex.chain_id, self.max_attempts).await
    }

    async fn fetch_reserve_state(
        &self,
        pair: &TradingPair,
    ) -> Result<ReserveSnapshot, AdapterError> {
        let pool = pair.pool_address;
        if pool.is_zero() {
            return Err(AdapterError::PairNotFound {
                dex: self.dex.name.clone(),
                detail: pair.label(),
            });
        }

        let (block_number, reserve0, reserve1) = self
            .endpoints
            .execute(
                |endpoint| async move {
                    let provider = endpoint.provider();
                    let block = provider.get_block_number().await?;
                    let (reserve0, reserve1, _) = UniswapV2Pair::new(pool, provider)
                        .get_reserves()
                        .block(BlockNumber::Number(block))
                        .call()
                        .await?;
                    Ok::<_, AdapterError>((block.as_u64(), reserve0, reserve1))
                },
                self.max_attempts,
            )
            .await?;

        let state = PoolState::ConstantProduct {
            reserve0: U256::from(reserve0),
            reserve1: U256::from(reserve1),
        };
        if state.is_empty() {
            return Err(AdapterError::InvalidState(format!(
                "{} has empty reserves at block {block_number}",
                pair.label()
            )));
        }

        Ok(ReserveSnapshot {
            pair: pool,
            dex: self.dex.name.clone(),
            state,
            block_number,
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
        let PoolState::ConstantProduct { reserve0, reserve1 } = snapshot.state else {
            return Err(QuoteError::SimulationFailed(
                "snapshot is not constant-product state".into(),
            ));
        };
        quote_exact_in(reserve0, reserve1, self.dex.fee, direction, amount_in)
    }
}

/// Exact-input swap against known reserves. Pure, no RPC.
pub fn quote_exact_in(
    reserve0: U256,
    reserve1: U256,
    fee_bps: u32,
    direction: SwapDirection,
    amount_in: U256,
) -> Result<SwapQuote, QuoteError> {
    let (reserve_in, reserve_out) = match direction {
        SwapDirection::ZeroForOne => (reserve0, reserve1),
        SwapDirection::OneForZero => (reserve1, reserve0),
    };
    let amount_out = calc::constant_product_amount_out(amount_in, reserve_in, reserve_out, fee_bps)
        .ok_or_else(|| QuoteError::SimulationFailed("no output for this input".into()))?;

    let (after0, after1) =
        calc::reserves_after_swap(reserve0, reserve1, direction, amount_in, amount_out)
            .ok_or_else(|| QuoteError::SimulationFailed("reserve overflow".into()))?;

    let sqrt_before = calc::sqrt_price_x96_from_reserves(reserve0, reserve1)
        .ok_or_else(|| QuoteError::SimulationFailed("empty reserves".into()))?;
    let sqrt_after = calc::sqrt_price_x96_from_reserves(after0, after1)
        .ok_or_else(|| QuoteError::SimulationFailed("swap drains the pool".into()))?;

    Ok(SwapQuote {
        amount_in,
        amount_out,
        sqrt_price_x96_before: sqrt_before,
        sqrt_price_x96_after: sqrt_after,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reserves() -> (U256, U256) {
        (U256::exp10(21), U256::from(2_000_000u64) * U256::exp10(18))
    }

    #[test]
    fn quote_matches_v2_formula() {
        let quote = quote_exact_in(
            U256::from(1000u64),
            U256::from(2000u64),
            30,
            SwapDirection::ZeroForOne,
            U256::from(10u64),
        )
        .unwrap();
        assert_eq!(quote.amount_out, U256::from(19u64));
    }

    #[test]
    fn zero_for_one_lowers_price() {
        let (r0, r1) = reserves();
        let quote =
            quote_exact_in(r0, r1, 30, SwapDirection::ZeroForOne, U256::exp10(18)).unwrap();
        assert!(quote.sqrt_price_x96_after < quote.sqrt_price_x96_before);
    }

    #[test]
    fn one_for_zero_raises_price() {
        let (r0, r1) = reserves();
        let quote =
            quote_exact_in(r0, r1, 30, SwapDirection::OneForZero, U256::exp10(21)).unwrap();
        assert!(quote.sqrt_price_x96_after > quote.sqrt_price_x96_before);
    }

    #[test]
    fn larger_trades_move_price_further() {
        let (r0, r1) = reserves();
        let small =
            quote_exact_in(r0, r1, 30, SwapDirection::ZeroForOne, U256::exp10(18)).unwrap();
        let large =
            quote_exact_in(r0, r1, 30, SwapDirection::ZeroForOne, U256::exp10(20)).unwrap();
        let impact = |q: &SwapQuote| {
            calc::price_impact_pct(q.sqrt_price_x96_before, q.sqrt_price_x96_after).unwrap()
        };
        assert!(impact(&large) > impact(&small));
    }

    #[test]
    fn zero_input_is_rejected() {
        let (r0, r1) = reserves();
        assert!(matches!(
            quote_exact_in(r0, r1, 30, SwapDirection::ZeroForOne, U256::zero()),
            Err(QuoteError::SimulationFailed(_))
        ));
    }
}
