// 4.0 amm.rs: band pricing. every band runs its own constant-product-like curve whose
// shape is pinned by the oracle price. trades walk the ladder band by band.
// nothing here mutates: a trade is planned against a read-only view and applied after.

use alloy_primitives::U256;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::band::{BandError, BandLedger, DEAD_SHARES};
use crate::math::{
    add, div_up, exp_wad, ln_wad, mul, mul_div_down, mul_div_up, sqrt, MathError, WAD,
};
use crate::types::{BandIndex, Direction, UserId};

pub const MIN_A: u32 = 2;
pub const MAX_A: u32 = 10_000;

/// 1e-12 as a WAD fraction.
pub const MIN_FEE: U256 = U256::from_limbs([1_000_000, 0, 0, 0]);
/// 10% as a WAD fraction.
pub const MAX_FEE: U256 = U256::from_limbs([100_000_000_000_000_000, 0, 0, 0]);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AmmError {
    #[error("Amplification {0} out of range")]
    InvalidAmplification(u32),

    #[error("Fee {0} out of range")]
    InvalidFee(U256),

    #[error("Zero price")]
    ZeroPrice,

    #[error("Slippage exceeded: got {amount_out}, wanted at least {min_amount_out}")]
    SlippageExceeded { amount_out: U256, min_amount_out: U256 },

    #[error(transparent)]
    Band(#[from] BandError),

    #[error(transparent)]
    Math(#[from] MathError),
}

impl AmmError {
    pub fn is_recoverable(&self) -> bool {
        match self {
            AmmError::Math(_) => false,
            AmmError::Band(e) => e.is_recoverable(),
            _ => true,
        }
    }
}

/** 4.1: immutable curve parameters fixed at market creation */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AmmParams {
    pub a: u32,
    pub fee: U256,
    pub base_price: U256,
    /// ln(A / (A - 1)), WAD.
    pub log_a_ratio: i128,
    /// sqrt(A / (A - 1)), WAD.
    pub sqrt_band_ratio: U256,
}

impl AmmParams {
    pub fn new(a: u32, fee: U256, base_price: U256) -> Result<Self, AmmError> {
        if !(MIN_A..=MAX_A).contains(&a) {
            return Err(AmmError::InvalidAmplification(a));
        }
        if fee < MIN_FEE || fee > MAX_FEE {
            return Err(AmmError::InvalidFee(fee));
        }
        if base_price.is_zero() {
            return Err(AmmError::ZeroPrice);
        }
        let a_u = U256::from(a as u64);
        let a1 = a_u - U256::from(1u64);
        let ratio = mul_div_down(a_u, WAD, a1)?;
        Ok(Self {
            a,
            fee,
            base_price,
            log_a_ratio: ln_wad(ratio)?,
            sqrt_band_ratio: sqrt(mul(ratio, WAD)?),
        })
    }

    pub fn a(&self) -> U256 {
        U256::from(self.a as u64)
    }

    /// Upper oracle price of band `n`: base_price * rate_mul * ((A-1)/A)^n.
    pub fn p_oracle_up(&self, rate_mul: U256, n: BandIndex) -> Result<U256, MathError> {
        let base = mul_div_down(self.base_price, rate_mul, WAD)?;
        let exponent = (n as i128)
            .checked_mul(self.log_a_ratio)
            .ok_or(MathError::ArithmeticOverflow)?;
        let factor = exp_wad(-exponent)?;
        mul_div_down(base, factor, WAD)
    }

    pub fn p_oracle_down(&self, rate_mul: U256, n: BandIndex) -> Result<U256, MathError> {
        self.p_oracle_up(rate_mul, n + 1)
    }
}

/// Oracle-dependent inputs, read once per call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriceContext {
    pub price_oracle: U256,
    pub rate_mul: U256,
    pub collateral_rate_mul: U256,
}

// 4.2: the curve of one band. (f + x)(g + y) = inv with y in underlying collateral.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BandCurve {
    pub y0: U256,
    pub f: U256,
    pub g: U256,
    pub inv: U256,
}

impl BandCurve {
    pub fn new(a: U256, x: U256, y: U256, p_o: U256, p_up: U256) -> Result<Self, MathError> {
        let a1 = a - U256::from(1u64);
        let mut b = U256::ZERO;
        if !x.is_zero() {
            b = mul_div_down(mul(p_up, a1)?, x, p_o)?;
        }
        if !y.is_zero() {
            let t = mul_div_down(mul(p_o, a)?, p_o, p_up)?;
            b = add(b, mul_div_down(t, y, WAD)?)?;
        }
        let y0 = if !x.is_zero() && !y.is_zero() {
            let four_a = mul(a, U256::from(4u64))?;
            let cross = mul(mul_div_down(mul(p_o, four_a)?, y, WAD)?, x)?;
            let d = add(mul(b, b)?, cross)?;
            mul_div_down(add(b, sqrt(d))?, WAD, mul(p_o, a * U256::from(2u64))?)?
        } else {
            mul_div_down(b, WAD, mul(p_o, a)?)?
        };
        let f = mul_div_down(mul_div_down(mul(y0, a)?, p_o, p_up)?, p_o, WAD)?;
        let g = mul_div_down(mul(y0, a1)?, p_up, p_o)?;
        let inv = mul(add(f, x)?, add(g, y)?)?;
        Ok(Self { y0, f, g, inv })
    }

    /// AMM price at reserves (x, y), WAD.
    pub fn price(&self, x: U256, y: U256) -> Result<U256, MathError> {
        mul_div_down(add(self.f, x)?, WAD, add(self.g, y)?)
    }
}

/// A planned trade. Applying it is the only mutation a swap performs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapPlan {
    pub direction: Direction,
    pub in_amount: U256,
    pub out_amount: U256,
    /// (band, new borrowed reserve, new raw collateral reserve)
    pub updates: Vec<(BandIndex, U256, U256)>,
    pub active_band: BandIndex,
}

impl SwapPlan {
    pub fn apply(&self, bands: &mut BandLedger) {
        for (n, borrowed, collateral) in &self.updates {
            bands.set_reserves(*n, *borrowed, *collateral);
        }
        bands.set_active_band(self.active_band);
    }
}

/** 4.3: read-only pricing view over the ladder */
pub struct Amm<'a> {
    params: &'a AmmParams,
    bands: &'a BandLedger,
    ctx: PriceContext,
}

impl<'a> Amm<'a> {
    pub fn new(params: &'a AmmParams, bands: &'a BandLedger, ctx: PriceContext) -> Self {
        Self { params, bands, ctx }
    }

    pub fn params(&self) -> &AmmParams {
        self.params
    }

    pub fn bands(&self) -> &BandLedger {
        self.bands
    }

    pub fn context(&self) -> PriceContext {
        self.ctx
    }

    pub fn p_oracle_up(&self, n: BandIndex) -> Result<U256, MathError> {
        self.params.p_oracle_up(self.ctx.rate_mul, n)
    }

    pub fn p_oracle_down(&self, n: BandIndex) -> Result<U256, MathError> {
        self.params.p_oracle_down(self.ctx.rate_mul, n)
    }

    pub fn to_underlying(&self, raw: U256) -> Result<U256, MathError> {
        mul_div_down(raw, self.ctx.collateral_rate_mul, WAD)
    }

    /// Raw units needed to cover `underlying`, rounded in the pool's favor.
    pub fn to_raw_up(&self, underlying: U256) -> Result<U256, MathError> {
        mul_div_up(underlying, WAD, self.ctx.collateral_rate_mul)
    }

    pub fn curve_at(&self, n: BandIndex, x: U256, y: U256, p_o: U256) -> Result<BandCurve, MathError> {
        let p_up = self.p_oracle_up(n)?;
        BandCurve::new(self.params.a(), x, y, p_o, p_up)
    }

    /// Current AMM price at the active band.
    pub fn get_p(&self) -> Result<U256, MathError> {
        let n = self.bands.active_band();
        let band = self.bands.band(n);
        let p_o = self.ctx.price_oracle;
        if band.is_empty() {
            // geometric middle of the band's price range
            return self.mid_price(p_o, self.p_oracle_up(n)?, self.p_oracle_down(n)?);
        }
        let y = self.to_underlying(band.collateral)?;
        let curve = self.curve_at(n, band.borrowed, y, p_o)?;
        curve.price(band.borrowed, y)
    }

    // 4.4: quote. walks up the ladder for BuyCollateral, down for SellCollateral.
    pub fn calc_swap(&self, direction: Direction, amount_in: U256) -> Result<SwapPlan, AmmError> {
        match direction {
            Direction::BuyCollateral => self.calc_pump(amount_in),
            Direction::SellCollateral => self.calc_dump(amount_in),
        }
    }

    fn fee_gross_up(&self, net: U256) -> Result<U256, MathError> {
        mul_div_up(net, WAD, WAD - self.params.fee)
    }

    fn fee_net(&self, gross: U256) -> Result<U256, MathError> {
        mul_div_down(gross, WAD - self.params.fee, WAD)
    }

    fn calc_pump(&self, amount_in: U256) -> Result<SwapPlan, AmmError> {
        let active = self.bands.active_band();
        let p_o = self.ctx.price_oracle;
        let mut plan = SwapPlan {
            direction: Direction::BuyCollateral,
            in_amount: U256::ZERO,
            out_amount: U256::ZERO,
            updates: Vec::new(),
            active_band: active,
        };
        let mut remaining = amount_in;

        for (&n, band) in self.bands.bands_from(active) {
            if remaining.is_zero() {
                break;
            }
            if band.collateral.is_zero() {
                continue;
            }
            let y = self.to_underlying(band.collateral)?;
            let curve = self.curve_at(n, band.borrowed, y, p_o)?;
            if curve.g.is_zero() {
                continue;
            }
            let x_dest = div_up(curve.inv, curve.g)?
                .saturating_sub(curve.f)
                .saturating_sub(band.borrowed);
            let dx_full = self.fee_gross_up(x_dest)?;
            plan.active_band = n;

            if dx_full >= remaining {
                let dx_net = self.fee_net(remaining)?;
                let denom = add(add(curve.f, band.borrowed)?, dx_net)?;
                let y_new = div_up(curve.inv, denom)?.saturating_sub(curve.g).min(y);
                let raw_new = self.to_raw_up(y_new)?.min(band.collateral);
                plan.out_amount = add(plan.out_amount, band.collateral - raw_new)?;
                plan.in_amount = add(plan.in_amount, remaining)?;
                plan.updates.push((n, add(band.borrowed, remaining)?, raw_new));
                remaining = U256::ZERO;
            } else {
                plan.out_amount = add(plan.out_amount, band.collateral)?;
                plan.in_amount = add(plan.in_amount, dx_full)?;
                plan.updates.push((n, add(band.borrowed, dx_full)?, U256::ZERO));
                remaining -= dx_full;
            }
        }
        Ok(plan)
    }

    fn calc_dump(&self, amount_in: U256) -> Result<SwapPlan, AmmError> {
        let active = self.bands.active_band();
        let p_o = self.ctx.price_oracle;
        let mut plan = SwapPlan {
            direction: Direction::SellCollateral,
            in_amount: U256::ZERO,
            out_amount: U256::ZERO,
            updates: Vec::new(),
            active_band: active,
        };
        let mut remaining = amount_in;

        for (&n, band) in self.bands.bands_through(active).rev() {
            if remaining.is_zero() {
                break;
            }
            if band.borrowed.is_zero() {
                continue;
            }
            let y = self.to_underlying(band.collateral)?;
            let curve = self.curve_at(n, band.borrowed, y, p_o)?;
            if curve.f.is_zero() {
                continue;
            }
            let y_dest = div_up(curve.inv, curve.f)?.saturating_sub(curve.g).saturating_sub(y);
            let dy_full = self.to_raw_up(self.fee_gross_up(y_dest)?)?;
            plan.active_band = n;

            if dy_full >= remaining {
                let dy_net = self.fee_net(self.to_underlying(remaining)?)?;
                let denom = add(add(curve.g, y)?, dy_net)?;
                let x_new = div_up(curve.inv, denom)?.saturating_sub(curve.f).min(band.borrowed);
                plan.out_amount = add(plan.out_amount, band.borrowed - x_new)?;
                plan.in_amount = add(plan.in_amount, remaining)?;
                plan.updates.push((n, x_new, add(band.collateral, remaining)?));
                remaining = U256::ZERO;
            } else {
                plan.out_amount = add(plan.out_amount, band.borrowed)?;
                plan.in_amount = add(plan.in_amount, dy_full)?;
                plan.updates.push((n, U256::ZERO, add(band.collateral, dy_full)?));
                remaining -= dy_full;
            }
        }
        Ok(plan)
    }

    // 4.5: input needed to move the marginal price to `target`.
    pub fn amount_for_price(&self, target: U256) -> Result<(U256, Direction), AmmError> {
        if target.is_zero() {
            return Err(AmmError::ZeroPrice);
        }
        let p_o = self.ctx.price_oracle;
        let active = self.bands.active_band();
        let current = self.get_p()?;
        let mut amount = U256::ZERO;

        if target > current {
            for (&n, band) in self.bands.bands_from(active) {
                if band.collateral.is_zero() {
                    continue;
                }
                let y = self.to_underlying(band.collateral)?;
                let curve = self.curve_at(n, band.borrowed, y, p_o)?;
                if curve.g.is_zero() {
                    continue;
                }
                let x_dest = div_up(curve.inv, curve.g)?
                    .saturating_sub(curve.f)
                    .saturating_sub(band.borrowed);
                let band_top = mul_div_down(curve.inv, WAD, mul(curve.g, curve.g)?)?;
                if target >= band_top {
                    amount = add(amount, self.fee_gross_up(x_dest)?)?;
                    continue;
                }
                let fx_target = sqrt(mul_div_down(curve.inv, target, WAD)?);
                let dx = fx_target.saturating_sub(curve.f).saturating_sub(band.borrowed);
                amount = add(amount, self.fee_gross_up(dx.min(x_dest))?)?;
                break;
            }
            Ok((amount, Direction::BuyCollateral))
        } else {
            for (&n, band) in self.bands.bands_through(active).rev() {
                if band.borrowed.is_zero() {
                    continue;
                }
                let y = self.to_underlying(band.collateral)?;
                let curve = self.curve_at(n, band.borrowed, y, p_o)?;
                if curve.f.is_zero() {
                    continue;
                }
                let y_dest = div_up(curve.inv, curve.f)?.saturating_sub(curve.g).saturating_sub(y);
                let band_bottom = mul_div_up(curve.f, mul(curve.f, WAD)?, curve.inv)?;
                if target <= band_bottom {
                    amount = add(amount, self.to_raw_up(self.fee_gross_up(y_dest)?)?)?;
                    continue;
                }
                let gy_target = sqrt(mul_div_down(curve.inv, WAD, target)?);
                let dy = gy_target.saturating_sub(curve.g).saturating_sub(y);
                amount = add(amount, self.to_raw_up(self.fee_gross_up(dy.min(y_dest))?)?)?;
                break;
            }
            Ok((amount, Direction::SellCollateral))
        }
    }

    // 4.6: value of a user's liquidity in borrowed terms if the price slid through
    // each band adiabatically from the oracle price down to the band bottom.
    // bands the oracle has left behind are converted at constant p_o first.
    pub fn user_x_down(&self, user: UserId) -> Result<U256, AmmError> {
        let ticks = self.bands.user_ticks(user).ok_or(BandError::NoLiquidity(user))?;
        let p_o = self.ctx.price_oracle;
        let mut total = U256::ZERO;
        for (n, shares) in ticks.iter() {
            let band = self.bands.band(n);
            if shares.is_zero() || band.total_shares.is_zero() || band.is_empty() {
                continue;
            }
            let total_shares = band.total_shares + DEAD_SHARES;
            let p_up = self.p_oracle_up(n)?;
            let p_down = self.p_oracle_down(n)?;
            let x = band.borrowed;
            let y = self.to_underlying(band.collateral)?;

            let band_value = if p_o > p_up {
                // oracle above the band: everything to collateral, then sold at the band's mean
                let y_equiv = if y.is_zero() {
                    mul_div_down(x, WAD, self.mid_price(p_o, p_up, p_down)?)?
                } else {
                    y
                };
                mul_div_down(y_equiv, mul_div_down(p_up, WAD, self.params.sqrt_band_ratio)?, WAD)?
            } else if p_o < p_down {
                // oracle below the band: everything to the borrowed asset
                if x.is_zero() {
                    mul_div_down(y, self.mid_price(p_o, p_up, p_down)?, WAD)?
                } else {
                    x
                }
            } else {
                // in band: trade to p_o, then convert the rest on the way to p_down
                let curve = BandCurve::new(self.params.a(), x, y, p_o, p_up)?;
                let y_o = sqrt(mul_div_down(curve.inv, WAD, p_o)?).saturating_sub(curve.g);
                let x_o = curve
                    .inv
                    .checked_div(add(curve.g, y_o)?)
                    .unwrap_or_default()
                    .saturating_sub(curve.f);
                let conversion = sqrt(mul(p_down, p_o)?);
                add(x_o, mul_div_down(y_o, conversion, WAD)?)?
            };
            total = add(total, mul_div_down(band_value, shares, total_shares)?)?;
        }
        Ok(total)
    }

    // AMM price in the middle of band [p_down, p_up] at oracle p_o.
    fn mid_price(&self, p_o: U256, p_up: U256, p_down: U256) -> Result<U256, MathError> {
        mul_div_down(mul_div_down(p_o, p_o, p_down)?, p_o, p_up)
    }

    /// Underlying collateral and borrowed asset a user's shares currently claim.
    pub fn user_reserves(&self, user: UserId) -> Result<(U256, U256), AmmError> {
        let (x, y_raw) = self.bands.user_amounts(user)?;
        Ok((self.to_underlying(y_raw)?, x))
    }
}
