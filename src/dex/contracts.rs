//! Read-only contract bindings.

use ethers::abi::{Abi, parse_abi};
use ethers::contract::{BaseContract, abigen};

use crate::errors::AdapterError;

abigen!(
    UniswapV2Factory,
    r"[
        function getPair(address tokenA, address tokenB) view returns (address pair)
    ]",
);

abigen!(
    UniswapV2Pair,
    r"[
        function getReserves() view returns (uint112 reserve0, uint112 reserve1, uint32 blockTimestampLast)
        function token0() view returns (address)
        function token1() view returns (address)
    ]",
);

abigen!(
    UniswapV3Factory,
    r"[
        function getPool(address tokenA, address tokenB, uint24 fee) view returns (address pool)
    ]",
);

abigen!(
    UniswapV3Pool,
    r"[
        function slot0() view returns (uint160 sqrtPriceX96, int24 tick, uint16 observationIndex, uint16 observationCardinality, uint16 observationCardinalityNext, uint8 feeProtocol, bool unlocked)
        function liquidity() view returns (uint128)
        function fee() view returns (uint24)
        function token0() view returns (address)
        function token1() view returns (address)
    ]",
);

abigen!(
    Erc20,
    r"[
        function symbol() view returns (string)
        function decimals() view returns (uint8)
    ]",
);

/// Fee-growth accumulators are read through a raw call to keep their
/// solidity names.
pub fn fee_growth_abi() -> Result<BaseContract, AdapterError> {
    abi(&[
        "function feeGrowthGlobal0X128() external view returns (uint256)",
        "function feeGrowthGlobal1X128() external view returns (uint256)",
    ])
}

/// QuoterV2 single-pool exact-input quote.
pub fn quoter_abi() -> Result<BaseContract, AdapterError> {
    abi(&[
        "function quoteExactInputSingle((address,address,uint256,uint24,uint160) params) external returns (uint256 amountOut, uint160 sqrtPriceX96After, uint32 initializedTicksCrossed, uint256 gasEstimate)",
    ])
}

fn abi(signatures: &[&str]) -> Result<BaseContract, AdapterError> {
    let parsed: Abi = parse_abi(signatures)
        .map_err(|e| AdapterError::InvalidState(format!("bad ABI definition: {e}")))?;
    Ok(BaseContract::from(parsed))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_abis_parse() {
        assert!(fee_growth_abi().is_ok());
        assert!(quoter_abi().is_ok());
    }
}
