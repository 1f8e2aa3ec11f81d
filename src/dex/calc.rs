//! Fixed-point and arbitrary-precision pricing math.
//!
//! All on-chain integers are carried as `U256` and converted to `BigInt` /
//! `BigDecimal` for division; nothing here touches `f64`.

use bigdecimal::BigDecimal;
use ethers::types::U256;
use num_bigint::{BigInt, BigUint, Sign};
use num_traits::Zero;

use crate::models::SwapDirection;

/// Significant digits kept on stored prices.
pub const PRICE_PRECISION: u64 = 36;

const BPS_DENOMINATOR: u32 = 10_000;

pub fn u256_to_biguint(value: U256) -> BigUint {
    let mut buf = [0u8; 32];
    value.to_big_endian(&mut buf);
    BigUint::from_bytes_be(&buf)
}

pub fn u256_to_decimal(value: U256) -> BigDecimal {
    BigDecimal::new(BigInt::from_biguint(Sign::Plus, u256_to_biguint(value)), 0)
}

/// `None` on negative values or values wider than 256 bits.
pub fn biguint_to_u256(value: &BigUint) -> Option<U256> {
    let bytes = value.to_bytes_be();
    if bytes.len() > 32 {
        return None;
    }
    Some(U256::from_big_endian(&bytes))
}

/// Truncates toward zero.
pub fn decimal_to_u256(value: &BigDecimal) -> Option<U256> {
    let (int, _) = value.with_scale(0).into_bigint_and_exponent();
    match int.to_biguint() {
        Some(unsigned) => biguint_to_u256(&unsigned),
        None => None,
    }
}

/// Exact `10^exp` for any signed exponent.
pub fn pow10(exp: i64) -> BigDecimal {
    BigDecimal::new(BigInt::from(1u8), -exp)
}

fn q192() -> BigDecimal {
    BigDecimal::new(BigInt::from(1u8) << 192u32, 0)
}

/// Round a derived price for storage and strip trailing zeros.
pub fn round_price(value: &BigDecimal) -> BigDecimal {
    value.with_prec(PRICE_PRECISION).normalized()
}

/// reserve1 / reserve0 in raw units.
pub fn reserve_ratio(reserve0: U256, reserve1: U256) -> Option<BigDecimal> {
    if reserve0.is_zero() || reserve1.is_zero() {
        return None;
    }
    Some(u256_to_decimal(reserve1) / u256_to_decimal(reserve0))
}

/// `(sqrtPriceX96 / 2^96)^2`, i.e. token1/token0 in raw units.
pub fn raw_price_from_sqrt_x96(sqrt_price_x96: U256) -> Option<BigDecimal> {
    if sqrt_price_x96.is_zero() {
        return None;
    }
    let sqrt = u256_to_biguint(sqrt_price_x96);
    let squared = BigDecimal::new(BigInt::from_biguint(Sign::Plus, &sqrt * &sqrt), 0);
    Some(squared / q192())
}

/// `floor(sqrt(reserve1 / reserve0) * 2^96)`.
pub fn sqrt_price_x96_from_reserves(reserve0: U256, reserve1: U256) -> Option<U256> {
    if reserve0.is_zero() || reserve1.is_zero() {
        return None;
    }
    let scaled = (u256_to_biguint(reserve1) << 192u32) / u256_to_biguint(reserve0);
    biguint_to_u256(&scaled.sqrt())
}

/// Convert a raw token1/token0 ratio into display units.
pub fn adjust_for_decimals(raw_price: &BigDecimal, decimals0: u8, decimals1: u8) -> BigDecimal {
    raw_price * pow10(i64::from(decimals0) - i64::from(decimals1))
}

/// `(price, 1/price)` rounded for storage; `None` for a zero price.
pub fn price_pair(price: &BigDecimal) -> Option<(BigDecimal, BigDecimal)> {
    if price.is_zero() {
        return None;
    }
    let inverse = BigDecimal::from(1u8) / price;
    Some((round_price(price), round_price(&inverse)))
}

/// Uniswap V2 `getAmountOut` with a fee expressed in basis points.
pub fn constant_product_amount_out(
    amount_in: U256,
    reserve_in: U256,
    reserve_out: U256,
    fee_bps: u32,
) -> Option<U256> {
    if amount_in.is_zero() || reserve_in.is_zero() || reserve_out.is_zero() {
        return None;
    }
    if fee_bps >= BPS_DENOMINATOR {
        return None;
    }
    let amount_in_with_fee = amount_in.checked_mul(U256::from(BPS_DENOMINATOR - fee_bps))?;
    let numerator = amount_in_with_fee.checked_mul(reserve_out)?;
    let denominator = reserve_in
        .checked_mul(U256::from(BPS_DENOMINATOR))?
        .checked_add(amount_in_with_fee)?;
    Some(numerator / denominator)
}

/// Reserves after a constant-product swap. The whole input, fee included,
/// stays in the pool.
pub fn reserves_after_swap(
    reserve0: U256,
    reserve1: U256,
    direction: SwapDirection,
    amount_in: U256,
    amount_out: U256,
) -> Option<(U256, U256)> {
    match direction {
        SwapDirection::ZeroForOne => Some((
            reserve0.checked_add(amount_in)?,
            reserve1.checked_sub(amount_out)?,
        )),
        SwapDirection::OneForZero => Some((
            reserve0.checked_sub(amount_out)?,
            reserve1.checked_add(amount_in)?,
        )),
    }
}

/// `|after - before| / before * 100`.
pub fn price_impact_pct(sqrt_before: U256, sqrt_after: U256) -> Option<BigDecimal> {
    if sqrt_before.is_zero() {
        return None;
    }
    let delta = if sqrt_after >= sqrt_before {
        sqrt_after - sqrt_before
    } else {
        sqrt_before - sqrt_after
    };
    let pct = u256_to_decimal(delta) / u256_to_decimal(sqrt_before) * BigDecimal::from(100u8);
    Some(round_price(&pct))
}

/// Output a trade of `amount_in` would receive at the current mid price,
/// ignoring fees and impact.
pub fn expected_out(
    raw_price: &BigDecimal,
    direction: SwapDirection,
    amount_in: U256,
) -> Option<BigDecimal> {
    if raw_price.is_zero() {
        return None;
    }
    let amount = u256_to_decimal(amount_in);
    Some(match direction {
        SwapDirection::ZeroForOne => amount * raw_price,
        SwapDirection::OneForZero => amount / raw_price,
    })
}

/// `(expected - actual) / expected * 10000`. `None` when undefined or negative.
pub fn slippage_bps(expected: &BigDecimal, actual: U256) -> Option<BigDecimal> {
    if *expected <= BigDecimal::zero() {
        return None;
    }
    let bps = (expected - u256_to_decimal(actual)) / expected * BigDecimal::from(BPS_DENOMINATOR);
    if bps < BigDecimal::zero() {
        return None;
    }
    Some(round_price(&bps))
}

/// Realised price of a trade as token1 per token0 in display units.
pub fn execution_price(
    direction: SwapDirection,
    amount_in: U256,
    amount_out: U256,
    decimals0: u8,
    decimals1: u8,
) -> Option<BigDecimal> {
    if amount_in.is_zero() || amount_out.is_zero() {
        return None;
    }
    let (amount0, amount1) = match direction {
        SwapDirection::ZeroForOne => (amount_in, amount_out),
        SwapDirection::OneForZero => (amount_out, amount_in),
    };
    let raw = u256_to_decimal(amount1) / u256_to_decimal(amount0);
    Some(round_price(&adjust_for_decimals(&raw, decimals0, decimals1)))
}
