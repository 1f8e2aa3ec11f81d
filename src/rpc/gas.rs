//! Per-cycle network fee sampling.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use ethers::providers::Middleware;
use ethers::types::{BlockNumber, U256};
use tracing::debug;

use crate::errors::{AdapterError, PoolError};
use crate::models::{CongestionLevel, GasPriceSample};
use crate::rpc::EndpointPool;

/// Used when the node does not answer `eth_maxPriorityFeePerGas`.
pub const FALLBACK_PRIORITY_FEE_WEI: u64 = 1_500_000_000;

/// Anything that can produce one [`GasPriceSample`] on demand.
#[async_trait]
pub trait GasSource: Send + Sync {
    async fn sample(&self) -> Result<GasPriceSample, PoolError>;
}

/// Reads fee data for the latest block through the endpoint pool.
pub struct GasSampler {
    endpoints: Arc<EndpointPool>,
    chain_id: u64,
    max_attempts: usize,
}

impl GasSampler {
    pub fn new(endpoints: Arc<EndpointPool>, chain_id: u64, max_attempts: usize) -> Self {
        Self {
            endpoints,
            chain_id,
            max_attempts,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeTiers {
    pub slow: U256,
    pub standard: U256,
    pub fast: U256,
}

/// slow = base + priority/2, standard = base + priority,
/// fast = 2*base + 2*priority.
pub fn fee_tiers(base_fee: U256, priority_fee: U256) -> FeeTiers {
    FeeTiers {
        slow: base_fee.saturating_add(priority_fee / 2),
        standard: base_fee.saturating_add(priority_fee),
        fast: base_fee
            .saturating_mul(U256::from(2u8))
            .saturating_add(priority_fee.saturating_mul(U256::from(2u8))),
    }
}

#[async_trait]
impl GasSource for GasSampler {
    async fn sample(&self) -> Result<GasPriceSample, PoolError> {
        let chain_id = self.chain_id;
        self.endpoints
            .execute(
                |endpoint| async move {
                    let provider = endpoint.provider();
                    let latest = provider
                        .get_block(BlockNumber::Latest)
                        .await?
                        .ok_or_else(|| {
                            AdapterError::ContractCallFailed("latest block unavailable".into())
                        })?;

                    let base_fee = latest.base_fee_per_gas.unwrap_or_default();
                    let priority_fee = match provider
                        .request::<_, U256>("eth_maxPriorityFeePerGas", ())
                        .await
                    {
                        Ok(fee) => fee,
                        Err(e) => {
                            debug!(error = %e, "[GAS] priority fee unavailable, using fallback");
                            U256::from(FALLBACK_PRIORITY_FEE_WEI)
                        }
                    };
                    let pending_tx_count = match provider.get_block(BlockNumber::Pending).await {
                        Ok(Some(block)) => block.transactions.len() as u64,
                        _ => 0,
                    };

                    let tiers = fee_tiers(base_fee, priority_fee);
                    Ok::<_, AdapterError>(GasPriceSample {
                        chain_id,
                        block_number: latest.number.map(|n| n.as_u64()).unwrap_or_default(),
                        base_fee,
                        priority_fee,
                        fast: tiers.fast,
                        standard: tiers.standard,
                        slow: tiers.slow,
                        pending_tx_count,
                        congestion: CongestionLevel::from_utilization(
                            latest.gas_used,
                            latest.gas_limit,
                        ),
                        timestamp: Utc::now(),
                    })
                },
                self.max_attempts,
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tiers_are_ordered() {
        let gwei = U256::exp10(9);
        let tiers = fee_tiers(gwei * 30, gwei * 2);
        assert_eq!(tiers.slow, gwei * 31);
        assert_eq!(tiers.standard, gwei * 32);
        assert_eq!(tiers.fast, gwei * 64);
        assert!(tiers.slow <= tiers.standard && tiers.standard <= tiers.fast);
    }

    #[test]
    fn tiers_saturate_instead_of_overflowing() {
        let tiers = fee_tiers(U256::MAX, U256::MAX);
        assert_eq!(tiers.fast, U256::MAX);
    }
}
