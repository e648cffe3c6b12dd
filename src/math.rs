// 2.0 math.rs: fixed-point integer arithmetic. every ledger quantity is a U256 at
// 18-decimal (WAD) precision. nothing here wraps: overflow is an error.

use alloy_primitives::aliases::U512;
use alloy_primitives::U256;
use thiserror::Error;

/// 1.0 in WAD precision.
pub const WAD: U256 = U256::from_limbs([1_000_000_000_000_000_000, 0, 0, 0]);

pub const WAD_I128: i128 = 1_000_000_000_000_000_000;

/// ln(2) scaled by WAD.
pub const LN_2_WAD: i128 = 693_147_180_559_945_309;

/// Below this exponent exp(x) rounds to zero at WAD precision.
pub const EXP_MIN_WAD: i128 = -41_446_531_673_892_822_312;

pub const SECONDS_PER_YEAR: u64 = 31_536_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MathError {
    #[error("Arithmetic overflow")]
    ArithmeticOverflow,

    #[error("Division by zero")]
    DivisionByZero,

    #[error("Logarithm of zero")]
    LogOfZero,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rounding {
    Down,
    Up,
}

// 2.1: 256 -> 512 -> 256 widening, so a*b never overflows before the division.
fn widen(x: U256) -> U512 {
    let l = x.as_limbs();
    U512::from_limbs([l[0], l[1], l[2], l[3], 0, 0, 0, 0])
}

fn narrow(x: U512) -> Result<U256, MathError> {
    let l = x.as_limbs();
    if l[4..].iter().any(|limb| *limb != 0) {
        return Err(MathError::ArithmeticOverflow);
    }
    Ok(U256::from_limbs([l[0], l[1], l[2], l[3]]))
}

/// `a * b / d` with an explicit rounding direction.
pub fn mul_div(a: U256, b: U256, d: U256, rounding: Rounding) -> Result<U256, MathError> {
    if d.is_zero() {
        return Err(MathError::DivisionByZero);
    }
    let product = widen(a) * widen(b);
    let denominator = widen(d);
    let mut quotient = product / denominator;
    if rounding == Rounding::Up && !(product % denominator).is_zero() {
        quotient += U512::from(1u64);
    }
    narrow(quotient)
}

pub fn mul_div_down(a: U256, b: U256, d: U256) -> Result<U256, MathError> {
    mul_div(a, b, d, Rounding::Down)
}

pub fn mul_div_up(a: U256, b: U256, d: U256) -> Result<U256, MathError> {
    mul_div(a, b, d, Rounding::Up)
}

pub fn wad_mul(a: U256, b: U256, rounding: Rounding) -> Result<U256, MathError> {
    mul_div(a, b, WAD, rounding)
}

pub fn wad_div(a: U256, b: U256, rounding: Rounding) -> Result<U256, MathError> {
    mul_div(a, WAD, b, rounding)
}

pub fn div_up(a: U256, b: U256) -> Result<U256, MathError> {
    mul_div(a, U256::from(1u64), b, Rounding::Up)
}

pub fn add(a: U256, b: U256) -> Result<U256, MathError> {
    a.checked_add(b).ok_or(MathError::ArithmeticOverflow)
}

pub fn sub(a: U256, b: U256) -> Result<U256, MathError> {
    a.checked_sub(b).ok_or(MathError::ArithmeticOverflow)
}

pub fn mul(a: U256, b: U256) -> Result<U256, MathError> {
    a.checked_mul(b).ok_or(MathError::ArithmeticOverflow)
}

/// Rounds `x` to a multiple of `quantum`.
pub fn quantize(x: U256, quantum: U256, rounding: Rounding) -> Result<U256, MathError> {
    if quantum <= U256::from(1u64) {
        return Ok(x);
    }
    let down = x / quantum * quantum;
    if rounding == Rounding::Up && down != x {
        return add(down, quantum);
    }
    Ok(down)
}

/// Floor square root. Newton iteration from a power-of-two guess above the root.
pub fn sqrt(x: U256) -> U256 {
    if x.is_zero() {
        return U256::ZERO;
    }
    let mut z = U256::from(1u64) << ((x.bit_len() + 1) / 2);
    loop {
        let next = (z + x / z) >> 1usize;
        if next >= z {
            return z;
        }
        z = next;
    }
}

/// sqrt of a WAD quantity, returned in WAD.
pub fn wad_sqrt(x: U256) -> Result<U256, MathError> {
    Ok(sqrt(mul(x, WAD)?))
}

// 2.2: e^r for r in [0, ln2) by Taylor series. terms vanish after ~25 steps.
fn exp_reduced(r: U256) -> Result<U256, MathError> {
    let mut sum = WAD;
    let mut term = WAD;
    let mut i = 1u64;
    while !term.is_zero() && i < 64 {
        term = mul_div_down(term, r, WAD * U256::from(i))?;
        sum = add(sum, term)?;
        i += 1;
    }
    Ok(sum)
}

/// e^x for a WAD-scaled signed exponent. Negative exponents use 1/e^|x|.
pub fn exp_wad(x: i128) -> Result<U256, MathError> {
    if x < 0 {
        if x < EXP_MIN_WAD {
            return Ok(U256::ZERO);
        }
        let positive = exp_wad(-x)?;
        return mul_div_down(WAD, WAD, positive);
    }
    // x = k*ln2 + r, e^x = 2^k * e^r
    let k = (x / LN_2_WAD) as usize;
    let r = x - (k as i128) * LN_2_WAD;
    let reduced = exp_reduced(U256::from(r as u128))?;
    if reduced.bit_len() + k > 255 {
        return Err(MathError::ArithmeticOverflow);
    }
    Ok(reduced << k)
}

/// Multiplicative growth factor for `rate_per_second` (WAD) applied over `elapsed` seconds.
pub fn exp_approx(rate_per_second: U256, elapsed: u64) -> Result<U256, MathError> {
    if elapsed == 0 || rate_per_second.is_zero() {
        return Ok(WAD);
    }
    let exponent = mul(rate_per_second, U256::from(elapsed))?;
    if exponent > U256::from(i128::MAX as u128) {
        return Err(MathError::ArithmeticOverflow);
    }
    exp_wad(exponent.saturating_to::<u128>() as i128)
}

/// Natural log of a positive WAD quantity, WAD-scaled.
pub fn ln_wad(x: U256) -> Result<i128, MathError> {
    if x.is_zero() {
        return Err(MathError::LogOfZero);
    }
    // normalize x = y * 2^k with y in [WAD, 2*WAD)
    let mut k: i128 = 0;
    let mut y = x;
    while y >= WAD << 1usize {
        y >>= 1usize;
        k += 1;
    }
    while y < WAD {
        y <<= 1usize;
        k -= 1;
    }
    // ln(y) = 2 * atanh(z), z = (y - 1) / (y + 1) in [0, 1/3)
    let z = mul_div_down(y - WAD, WAD, y + WAD)?;
    let z2 = mul_div_down(z, z, WAD)?;
    let mut term = z;
    let mut series = z;
    let mut i = 1u64;
    while !term.is_zero() && i < 64 {
        term = mul_div_down(term, z2, WAD)?;
        series = add(series, term / U256::from(2 * i + 1))?;
        i += 1;
    }
    let series = series.saturating_to::<u128>() as i128;
    Ok(2 * series + k * LN_2_WAD)
}

/// Lossy conversion for logging and tests.
pub fn wad_to_f64(x: U256) -> f64 {
    let whole = (x / WAD).saturating_to::<u128>() as f64;
    let frac = (x % WAD).saturating_to::<u128>() as f64 / 1e18;
    whole + frac
}

/// Signed view of a WAD value, clamped to i128.
pub fn to_i128_saturating(x: U256) -> i128 {
    x.saturating_to::<u128>().min(i128::MAX as u128) as i128
}

/// Per-second WAD rate from a WAD annual rate.
pub fn per_second(apr_wad: U256) -> U256 {
    apr_wad / U256::from(SECONDS_PER_YEAR)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wad(x: u64) -> U256 {
        U256::from(x) * WAD
    }

    #[test]
    fn mul_div_rounds_both_ways() {
        let a = U256::from(10u64);
        let b = U256::from(10u64);
        let d = U256::from(3u64);
        assert_eq!(mul_div(a, b, d, Rounding::Down).unwrap(), U256::from(33u64));
        assert_eq!(mul_div(a, b, d, Rounding::Up).unwrap(), U256::from(34u64));
        assert_eq!(mul_div(a, b, U256::from(5u64), Rounding::Up).unwrap(), U256::from(20u64));
    }

    #[test]
    fn mul_div_survives_wide_intermediate() {
        let big = U256::MAX / U256::from(2u64);
        let out = mul_div_down(big, WAD, WAD).unwrap();
        assert_eq!(out, big);
    }

    #[test]
    fn mul_div_overflow_and_zero_divisor() {
        assert_eq!(mul_div_down(U256::MAX, U256::from(2u64), U256::from(1u64)), Err(MathError::ArithmeticOverflow));
        assert_eq!(mul_div_down(WAD, WAD, U256::ZERO), Err(MathError::DivisionByZero));
        assert_eq!(add(U256::MAX, U256::from(1u64)), Err(MathError::ArithmeticOverflow));
        assert_eq!(sub(U256::ZERO, U256::from(1u64)), Err(MathError::ArithmeticOverflow));
    }

    #[test]
    fn sqrt_floor() {
        assert_eq!(sqrt(U256::from(0u64)), U256::ZERO);
        assert_eq!(sqrt(U256::from(1u64)), U256::from(1u64));
        assert_eq!(sqrt(U256::from(15u64)), U256::from(3u64));
        assert_eq!(sqrt(U256::from(16u64)), U256::from(4u64));
        assert_eq!(wad_sqrt(wad(4)).unwrap(), wad(2));
    }

    #[test]
    fn exp_matches_float() {
        for x in [0.0f64, 0.5, 1.0, 2.5, 10.0, -1.0, -3.0] {
            let xi = (x * 1e18) as i128;
            let got = wad_to_f64(exp_wad(xi).unwrap());
            let want = x.exp();
            assert!(((got - want) / want).abs() < 1e-12, "exp({x}) = {got}, want {want}");
        }
    }

    #[test]
    fn exp_approx_identity_and_growth() {
        assert_eq!(exp_approx(U256::from(1_000_000_000u64), 0).unwrap(), WAD);
        let rate = per_second(WAD / U256::from(10u64)); // 10% apr
        let year = exp_approx(rate, SECONDS_PER_YEAR).unwrap();
        let got = wad_to_f64(year);
        assert!((got - 0.1f64.exp()).abs() < 1e-9);
    }

    #[test]
    fn exp_overflow_is_error() {
        assert_eq!(exp_wad(200 * WAD_I128), Err(MathError::ArithmeticOverflow));
        assert_eq!(exp_wad(-50 * WAD_I128).unwrap(), U256::ZERO);
    }

    #[test]
    fn ln_matches_float() {
        for x in [0.01f64, 0.5, 1.0, 1.01, 2.0, 100.0, 1e6] {
            let xi = U256::from((x * 1e18) as u128);
            let got = ln_wad(xi).unwrap() as f64 / 1e18;
            assert!((got - x.ln()).abs() < 1e-12, "ln({x}) = {got}");
        }
        assert_eq!(ln_wad(U256::ZERO), Err(MathError::LogOfZero));
    }

    #[test]
    fn quantize_directions() {
        let q = U256::from(100u64);
        assert_eq!(quantize(U256::from(250u64), q, Rounding::Down).unwrap(), U256::from(200u64));
        assert_eq!(quantize(U256::from(250u64), q, Rounding::Up).unwrap(), U256::from(300u64));
        assert_eq!(quantize(U256::from(300u64), q, Rounding::Up).unwrap(), U256::from(300u64));
        assert_eq!(quantize(U256::from(7u64), U256::from(1u64), Rounding::Up).unwrap(), U256::from(7u64));
    }
}
