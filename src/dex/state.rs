use bigdecimal::BigDecimal;
use ethers::types::U256;
use serde::{Deserialize, Serialize};

use crate::dex::calc;
use crate::utils::{decimal_string, u256_dec};

/// Protocol-specific part of a reserve snapshot.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PoolState {
    /// `getReserves()` of a constant-product pair.
    ConstantProduct {
        #[serde(with = "u256_dec")]
        reserve0: U256,
        #[serde(with = "u256_dec")]
        reserve1: U256,
    },
    /// `slot0()` and `liquidity()` of a concentrated-liquidity pool.
    ConcentratedLiquidity {
        #[serde(with = "u256_dec")]
        sqrt_price_x96: U256,
        tick: i32,
        #[serde(with = "decimal_string")]
        liquidity: u128,
        #[serde(with = "u256_dec")]
        fee_growth_global0_x128: U256,
        #[serde(with = "u256_dec")]
        fee_growth_global1_x128: U256,
    },
}

impl PoolState {
    /// Current sqrt(token1/token0) in Q64.96, in raw token units.
    ///
    /// Constant-product pools have no stored sqrt price, so it is derived
    /// from the reserves. `None` when the pool is empty.
    pub fn sqrt_price_x96(&self) -> Option<U256> {
        match self {
            PoolState::ConstantProduct { reserve0, reserve1 } => {
                calc::sqrt_price_x96_from_reserves(*reserve0, *reserve1)
            }
            PoolState::ConcentratedLiquidity { sqrt_price_x96, .. } => {
                (!sqrt_price_x96.is_zero()).then_some(*sqrt_price_x96)
            }
        }
    }

    /// token1/token0 in raw units (no decimal adjustment).
    pub fn raw_price(&self) -> Option<BigDecimal> {
        match self {
            PoolState::ConstantProduct { reserve0, reserve1 } => {
                calc::reserve_ratio(*reserve0, *reserve1)
            }
            PoolState::ConcentratedLiquidity { sqrt_price_x96, .. } => {
                calc::raw_price_from_sqrt_x96(*sqrt_price_x96)
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            PoolState::ConstantProduct { reserve0, reserve1 } => {
                reserve0.is_zero() || reserve1.is_zero()
            }
            PoolState::ConcentratedLiquidity {
                sqrt_price_x96,
                liquidity,
                ..
            } => sqrt_price_x96.is_zero() || *liquidity == 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_with_kind_tag_and_decimal_strings() {
        let state = PoolState::ConstantProduct {
            reserve0: U256::from(1000u64),
            reserve1: U256::from(2000u64),
        };
        let json = serde_json::to_string(&state).unwrap();
        assert_eq!(
            json,
            r#"{"kind":"constant_product","reserve0":"1000","reserve1":"2000"}"#
        );
        let back: PoolState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn empty_pools_have_no_price() {
        let state = PoolState::ConstantProduct {
            reserve0: U256::zero(),
            reserve1: U256::from(5u64),
        };
        assert!(state.is_empty());
        assert!(state.raw_price().is_none());
        assert!(state.sqrt_price_x96().is_none());
    }
}
