//! Dynamic position size limits derived from the risk score.
//!
//! Pure functions with no stored state: limits are recomputed on every
//! admission check and can never go stale.

use rust_decimal::Decimal;

use tradeguard_core::types::{PositionSizeLimit, RiskLimits};

/// Multiplier that scales position limits down as the risk score rises.
///
/// Step function: score >= 80 -> 0.3, >= 60 -> 0.5, >= 35 -> 0.7, else 1.0.
pub fn risk_adjustment_factor(risk_score: Decimal) -> Decimal {
    if risk_score >= Decimal::new(80, 0) {
        Decimal::new(3, 1)
    } else if risk_score >= Decimal::new(60, 0) {
        Decimal::new(5, 1)
    } else if risk_score >= Decimal::new(35, 0) {
        Decimal::new(7, 1)
    } else {
        Decimal::ONE
    }
}

/// Maximum share count a user may hold in one symbol.
///
/// The risk adjustment factor scales both the configured max position value
/// and the max concentration percentage; the tighter of the two wins. The
/// resulting value is floor-divided by the price and rounded down to the lot
/// size.
pub fn max_position(
    risk_score: Decimal,
    limits: &RiskLimits,
    portfolio_value: Decimal,
    current_price: Decimal,
    lot_size: Decimal,
) -> Decimal {
    if current_price <= Decimal::ZERO {
        return Decimal::ZERO;
    }

    let factor = risk_adjustment_factor(risk_score);
    let adjusted_value = limits.max_position_size * factor;
    let adjusted_concentration_pct = limits.max_portfolio_concentration * factor;
    let concentration_value =
        portfolio_value * adjusted_concentration_pct / Decimal::ONE_HUNDRED;

    let allowed_value = adjusted_value.min(concentration_value).max(Decimal::ZERO);
    let shares = (allowed_value / current_price).floor();
    round_to_lot(shares, lot_size)
}

/// Build the per-call position size limit snapshot.
pub fn position_size_limit(
    symbol: &str,
    risk_score: Decimal,
    limits: &RiskLimits,
    portfolio_value: Decimal,
    current_price: Decimal,
    current_shares: Decimal,
    lot_size: Decimal,
) -> PositionSizeLimit {
    let factor = risk_adjustment_factor(risk_score);
    let current_portfolio_pct = if portfolio_value > Decimal::ZERO {
        current_shares * current_price / portfolio_value * Decimal::ONE_HUNDRED
    } else {
        Decimal::ZERO
    };

    PositionSizeLimit {
        symbol: symbol.to_string(),
        max_shares: max_position(risk_score, limits, portfolio_value, current_price, lot_size),
        max_portfolio_pct: limits.max_portfolio_concentration * factor,
        current_shares,
        current_portfolio_pct,
        risk_adjustment_factor: factor,
    }
}

fn round_to_lot(shares: Decimal, lot_size: Decimal) -> Decimal {
    if lot_size <= Decimal::ONE {
        return shares;
    }
    (shares / lot_size).floor() * lot_size
}
