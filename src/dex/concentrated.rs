//! Adapter for Uniswap V3 style concentrated-liquidity pools.
//!
//! State comes from `slot0()`, `liquidity()` and the fee-growth
//! accumulators, all pinned to one block. Swaps are simulated with a
//! QuoterV2 `eth_call` at the snapshot's block.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use ethers::contract::BaseContract;
use ethers::providers::{Http, Middleware, Provider};
use ethers::types::{
    Address, BlockId, BlockNumber, Bytes, TransactionRequest, U64, U256,
    transaction::eip2718::TypedTransaction,
};
use tracing::debug;

use super::contracts::{self, UniswapV3Factory, UniswapV3Pool};
use super::{PoolState, QuoteSource, SwapQuote, read_token_metadata};
use crate::errors::{AdapterError, QuoteError};
use crate::models::{
    DexConfig, ProtocolFamily, ReserveSnapshot, SwapDirection, TokenRef, TradingPair,
};
use crate::rpc::EndpointPool;
use crate::utils::addr_hex;

/// Reverts are deterministic, so a quote gets a single attempt.
const QUOTE_ATTEMPTS: usize = 1;

pub struct ConcentratedLiquidityAdapter {
    dex: DexConfig,
    endpoints: Arc<EndpointPool>,
    max_attempts: usize,
    fee_growth: BaseContract,
    quoter: BaseContract,
}

impl ConcentratedLiquidityAdapter {
    pub fn new(
        dex: DexConfig,
        endpoints: Arc<EndpointPool>,
        max_attempts: usize,
    ) -> Result<Self, AdapterError> {
        Ok(Self {
            dex,
            endpoints,
            max_attempts,
            fee_growth: contracts::fee_growth_abi()?,
            quoter: contracts::quoter_abi()?,
        })
    }
}

/// `eth_call` pinned to `block`.
async fn raw_call(
    provider: &Provider<Http>,
    to: Address,
    data: Bytes,
    block: U64,
) -> Result<Bytes, AdapterError> {
    let tx: TypedTransaction = TransactionRequest::new().to(to).data(data).into();
    let block: BlockId = BlockNumber::Number(block).into();
    Ok(provider.call(&tx, Some(block)).await?)
}

async fn read_u256(
    provider: &Provider<Http>,
    abi: &BaseContract,
    to: Address,
    function: &str,
    block: U64,
) -> Result<U256, AdapterError> {
    let data = abi
        .encode(function, ())
        .map_err(|e| AdapterError::ContractCallFailed(format!("encode {function}: {e}")))?;
    let raw = raw_call(provider, to, data, block).await?;
    abi.decode_output(function, raw)
        .map_err(|e| AdapterError::ContractCallFailed(format!("decode {function}: {e}")))
}

#[async_trait]
impl QuoteSource for ConcentratedLiquidityAdapter {
    fn dex(&self) -> &DexConfig {
        &self.dex
    }

    fn protocol(&self) -> ProtocolFamily {
        ProtocolFamily::ConcentratedLiquidity
    }

    async fn discover_pair(
        &self,
        token_a: Address,
        token_b: Address,
    ) -> Result<Option<Address>, AdapterError> {
        let factory = self.dex.factory;
        let fee = self.dex.fee;
        let pool = self
            .endpoints
            .execute(
                |endpoint| async move {
                    UniswapV3Factory::new(factory, endpoint.provider())
                        .get_pool(token_a, token_b, fee)
                        .call()
                        .await
                },
                self.max_attempts,
            )
            .await?;

        if pool.is_zero() {
            debug!(
                dex = %self.dex.name,
                fee,
                token_a = %addr_hex(&token_a),
                token_b = %addr_hex(&token_b),
                "[DEX] factory has no pool"
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
                    let contract = UniswapV3Pool::new(pool, endpoint.provider());
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

        let fee_growth = &self.fee_growth;
        let (block_number, state) = self
            .endpoints
            .execute(
                |endpoint| async move {
                    let provider = endpoint.provider();
                    let block = provider.get_block_number().await?;
                    let contract = UniswapV3Pool::new(pool, Arc::clone(&provider));
                    let (sqrt_price_x96, tick, ..) = contract
                        .slot_0()
                        .block(BlockNumber::Number(block))
                        .call()
                        .await?;
                    let liquidity = contract
                        .liquidity()
                        .block(BlockNumber::Number(block))
                        .call()
                        .await?;
                    let growth0 =
                        read_u256(&provider, fee_growth, pool, "feeGrowthGlobal0X128", block)
                            .await?;
                    let growth1 =
                        read_u256(&provider, fee_growth, pool, "feeGrowthGlobal1X128", block)
                            .await?;

                    Ok::<_, AdapterError>((
                        block.as_u64(),
                        PoolState::ConcentratedLiquidity {
                            sqrt_price_x96,
                            tick,
                            liquidity,
                            fee_growth_global0_x128: growth0,
                            fee_growth_global1_x128: growth1,
                        },
                    ))
                },
                self.max_attempts,
            )
            .await?;

        if state.sqrt_price_x96().is_none() {
            return Err(AdapterError::InvalidState(format!(
                "{} is not initialised at block {block_number}",
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
        pair: &TradingPair,
        snapshot: &ReserveSnapshot,
        direction: SwapDirection,
        amount_in: U256,
    ) -> Result<SwapQuote, QuoteError> {
        let quoter_address = self.dex.quoter.ok_or_else(|| {
            QuoteError::SimulationFailed(format!("{} has no quoter configured", self.dex.name))
        })?;
        let sqrt_before = match &snapshot.state {
            PoolState::ConcentratedLiquidity { .. } => snapshot.state.sqrt_price_x96(),
            PoolState::ConstantProduct { .. } => None,
        }
        .ok_or_else(|| {
            QuoteError::SimulationFailed("snapshot is not concentrated-liquidity state".into())
        })?;

        let (token_in, token_out) = match direction {
            SwapDirection::ZeroForOne => (pair.token0.address, pair.token1.address),
            SwapDirection::OneForZero => (pair.token1.address, pair.token0.address),
        };
        let params = ((token_in, token_out, amount_in, pair.fee, U256::zero()),);
        let data = self
            .quoter
            .encode("quoteExactInputSingle", params)
            .map_err(|e| QuoteError::SimulationFailed(format!("encode quote: {e}")))?;
        let block = U64::from(snapshot.block_number);
        let quoter = &self.quoter;

        let (amount_out, sqrt_after) = self
            .endpoints
            .execute(
                |endpoint| {
                    let data = data.clone();
                    async move {
                        let raw =
                            raw_call(&endpoint.provider(), quoter_address, data, block)
                                .await?;
                        let (amount_out, sqrt_after, _ticks, _gas): (U256, U256, u32, U256) =
                            quoter
                                .decode_output("quoteExactInputSingle", raw)
                                .map_err(|e| {
                                    AdapterError::ContractCallFailed(format!("decode quote: {e}"))
                                })?;
                        Ok::<_, AdapterError>((amount_out, sqrt_after))
                    }
                },
                QUOTE_ATTEMPTS,
            )
            .await?;

        if amount_out.is_zero() {
            return Err(QuoteError::SimulationFailed("quoter returned zero output".into()));
        }
        Ok(SwapQuote {
            amount_in,
            amount_out,
            sqrt_price_x96_before: sqrt_before,
            sqrt_price_x96_after: sqrt_after,
        })
    }
}
