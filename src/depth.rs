//! Trade simulation and liquidity depth curves.
//!
//! Built on [`QuoteSource::simulate_swap`]: constant-product pools are
//! simulated locally from the snapshot's reserves, concentrated-liquidity
//! pools through the on-chain quoter.

use bigdecimal::BigDecimal;
use chrono::Utc;
use ethers::types::{Address, U256};
use tracing::debug;

use crate::dex::{QuoteSource, calc};
use crate::errors::QuoteError;
use crate::models::{LiquidityDepthSample, ReserveSnapshot, SwapDirection, TradingPair};
use crate::utils::addr_hex;

#[derive(Debug, Clone, PartialEq)]
pub struct TradeSimulation {
    pub amount_out: U256,
    /// Percent move of sqrt(price) caused by the trade.
    pub price_impact: BigDecimal,
}

/// Swap direction for `token_in -> token_out` on `pair`.
pub fn direction_of(
    pair: &TradingPair,
    token_in: Address,
    token_out: Address,
) -> Result<SwapDirection, QuoteError> {
    let (t0, t1) = (pair.token0.address, pair.token1.address);
    if token_in == t0 && token_out == t1 {
        Ok(SwapDirection::ZeroForOne)
    } else if token_in == t1 && token_out == t0 {
        Ok(SwapDirection::OneForZero)
    } else {
        Err(QuoteError::SimulationFailed(format!(
            "{} -> {} is not traded by {}",
            addr_hex(&token_in),
            addr_hex(&token_out),
            pair.label()
        )))
    }
}

pub async fn simulate_trade(
    source: &dyn QuoteSource,
    pair: &TradingPair,
    snapshot: &ReserveSnapshot,
    token_in: Address,
    token_out: Address,
    amount_in: U256,
) -> Result<TradeSimulation, QuoteError> {
    let direction = direction_of(pair, token_in, token_out)?;
    let quote = source
        .simulate_swap(pair, snapshot, direction, amount_in)
        .await?;
    let price_impact =
        calc::price_impact_pct(quote.sqrt_price_x96_before, quote.sqrt_price_x96_after)
            .ok_or_else(|| {
                QuoteError::SimulationFailed("pool has no price before the trade".into())
            })?;
    Ok(TradeSimulation {
        amount_out: quote.amount_out,
        price_impact,
    })
}

/// Simulate each notional in ascending order and keep the usable samples.
///
/// A sample is dropped when its simulation fails, when slippage is negative
/// or undefined, or when its impact is below an earlier accepted sample.
/// The result is therefore ordered by size with non-decreasing impact.
pub async fn sample_depth_curve(
    source: &dyn QuoteSource,
    pair: &TradingPair,
    snapshot: &ReserveSnapshot,
    token_in: Address,
    token_out: Address,
    amounts: &[U256],
) -> Result<Vec<LiquidityDepthSample>, QuoteError> {
    let direction = direction_of(pair, token_in, token_out)?;
    let mid = snapshot
        .state
        .raw_price()
        .ok_or_else(|| QuoteError::SimulationFailed(format!("{} has no price", pair.label())))?;

    let mut amounts: Vec<U256> = amounts.iter().copied().filter(|a| !a.is_zero()).collect();
    amounts.sort();
    amounts.dedup();

    let mut samples: Vec<LiquidityDepthSample> = Vec::with_capacity(amounts.len());
    for amount_in in amounts {
        let sim = match simulate_trade(source, pair, snapshot, token_in, token_out, amount_in).await
        {
            Ok(sim) => sim,
            Err(e) => {
                debug!(
                    pair = %addr_hex(&pair.pool_address),
                    amount_in = %amount_in,
                    error = %e,
                    "[DEX] depth sample skipped"
                );
                continue;
            }
        };

        let Some(slippage_bps) = calc::expected_out(&mid, direction, amount_in)
            .and_then(|expected| calc::slippage_bps(&expected, sim.amount_out))
        else {
            debug!(
                pair = %addr_hex(&pair.pool_address),
                amount_in = %amount_in,
                "[DEX] depth sample has negative slippage"
            );
            continue;
        };

        if let Some(previous) = samples.last() {
            if sim.price_impact < previous.price_impact {
                debug!(
                    pair = %addr_hex(&pair.pool_address),
                    amount_in = %amount_in,
                    "[DEX] depth sample breaks monotonic impact"
                );
                continue;
            }
        }

        let Some(execution_price) = calc::execution_price(
            direction,
            amount_in,
            sim.amount_out,
            pair.token0.decimals,
            pair.token1.decimals,
        ) else {
            continue;
        };

        samples.push(LiquidityDepthSample {
            pair: pair.pool_address,
            direction,
            amount_in,
            amount_out: sim.amount_out,
            price_impact: sim.price_impact,
            slippage_bps,
            execution_price,
            block_number: snapshot.block_number,
            timestamp: Utc::now().max(snapshot.timestamp),
        });
    }
    Ok(samples)
}

/// Display-unit notionals (e.g. `1.5` WETH) to raw token amounts.
pub fn raw_notionals(notionals: &[BigDecimal], decimals: u8) -> Vec<U256> {
    let scale = calc::pow10(i64::from(decimals));
    notionals
        .iter()
        .filter_map(|n| calc::decimal_to_u256(&(n * &scale)))
        .filter(|a| !a.is_zero())
        .collect()
}
