//! Shared data structures used throughout the collector.

use std::fmt;
use std::str::FromStr;

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use ethers::types::{Address, U256};
use serde::{Deserialize, Serialize};

use crate::dex::state::PoolState;
use crate::errors::AdapterError;
use crate::utils::{decimal_string, u256_dec};

/// AMM protocol family a dex deployment belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProtocolFamily {
    #[serde(rename = "amm-constant-product")]
    ConstantProduct,
    #[serde(rename = "amm-concentrated-liquidity")]
    ConcentratedLiquidity,
}

impl ProtocolFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolFamily::ConstantProduct => "amm-constant-product",
            ProtocolFamily::ConcentratedLiquidity => "amm-concentrated-liquidity",
        }
    }
}

impl fmt::Display for ProtocolFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProtocolFamily {
    type Err = AdapterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "amm-constant-product" => Ok(ProtocolFamily::ConstantProduct),
            "amm-concentrated-liquidity" => Ok(ProtocolFamily::ConcentratedLiquidity),
            other => Err(AdapterError::UnknownProtocol(other.to_string())),
        }
    }
}

/// One exchange deployment, as loaded from configuration.
///
/// `protocol` stays a plain string here so that an unsupported family is
/// rejected when the adapter is built rather than when the file is parsed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DexConfig {
    pub name: String,
    pub protocol: String,
    #[serde(default)]
    pub router: Option<Address>,
    pub factory: Address,
    #[serde(default)]
    pub quoter: Option<Address>,
    /// Basis points for constant-product pools, fee tier (pips) for
    /// concentrated-liquidity pools.
    pub fee: u32,
    pub chain_id: u64,
    #[serde(default)]
    pub supports_multi_hop: bool,
    #[serde(default)]
    pub supports_flash_loans: bool,
}

/// Immutable ERC-20 reference data.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TokenRef {
    pub address: Address,
    pub symbol: String,
    pub decimals: u8,
    pub chain_id: u64,
}

/// A pool on a given dex, uniquely identified by `pool_address`.
///
/// Pairs are never deleted, only deactivated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradingPair {
    pub dex: String,
    pub protocol: ProtocolFamily,
    pub token0: TokenRef,
    pub token1: TokenRef,
    pub pool_address: Address,
    pub fee: u32,
    pub active: bool,
    pub discovered_at: DateTime<Utc>,
}

impl TradingPair {
    /// Human-readable label such as `WETH/USDC@uniswap-v3`.
    pub fn label(&self) -> String {
        format!("{}/{}@{}", self.token0.symbol, self.token1.symbol, self.dex)
    }
}

/// Point-in-time observation of a pool's on-chain state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReserveSnapshot {
    pub pair: Address,
    pub dex: String,
    pub state: PoolState,
    pub block_number: u64,
    pub timestamp: DateTime<Utc>,
}

/// Price derived from a [`ReserveSnapshot`], quoted as token1 per token0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceRecord {
    pub pair: Address,
    pub dex: String,
    pub block_number: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(with = "decimal_string")]
    pub price: BigDecimal,
    #[serde(with = "decimal_string")]
    pub inverse_price: BigDecimal,
    pub fee_growth_global0_x128: Option<String>,
    pub fee_growth_global1_x128: Option<String>,
    /// JSON-serialized depth samples taken at the same block, if any.
    pub depth_curve: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwapDirection {
    /// token0 in, token1 out.
    ZeroForOne,
    /// token1 in, token0 out.
    OneForZero,
}

/// One point of a simulated price-impact curve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiquidityDepthSample {
    pub pair: Address,
    pub direction: SwapDirection,
    #[serde(with = "u256_dec")]
    pub amount_in: U256,
    #[serde(with = "u256_dec")]
    pub amount_out: U256,
    /// Percent change of the pool's sqrt price caused by the trade.
    #[serde(with = "decimal_string")]
    pub price_impact: BigDecimal,
    #[serde(with = "decimal_string")]
    pub slippage_bps: BigDecimal,
    /// token1 per token0, in display units.
    #[serde(with = "decimal_string")]
    pub execution_price: BigDecimal,
    pub block_number: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CongestionLevel {
    Low,
    Medium,
    High,
}

impl CongestionLevel {
    /// Classify by the share of the block gas limit actually used.
    pub fn from_utilization(gas_used: U256, gas_limit: U256) -> Self {
        if gas_limit.is_zero() {
            return CongestionLevel::Low;
        }
        let pct = gas_used.saturating_mul(U256::from(100u8)) / gas_limit;
        if pct >= U256::from(90u8) {
            CongestionLevel::High
        } else if pct >= U256::from(50u8) {
            CongestionLevel::Medium
        } else {
            CongestionLevel::Low
        }
    }
}

/// Network fee snapshot, all prices in wei.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GasPriceSample {
    pub chain_id: u64,
    pub block_number: u64,
    #[serde(with = "u256_dec")]
    pub base_fee: U256,
    #[serde(with = "u256_dec")]
    pub priority_fee: U256,
    #[serde(with = "u256_dec")]
    pub fast: U256,
    #[serde(with = "u256_dec")]
    pub standard: U256,
    #[serde(with = "u256_dec")]
    pub slow: U256,
    pub pending_tx_count: u64,
    pub congestion: CongestionLevel,
    pub timestamp: DateTime<Utc>,
}
