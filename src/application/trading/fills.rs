//! Paper fill math, shared by the portfolio tracker, candidate runners, and
//! the backtester. One implementation so live/paper/backtest semantics
//! cannot drift apart.

use crate::domain::contract::{OrderType, Signal};

/// Adverse entry fill: market buys pay up by the slippage factor, limit
/// buys fill at the limit price.
pub fn entry_fill_price(quote: f64, order_type: OrderType, limit_price: Option<f64>, slippage: f64) -> f64 {
    match order_type {
        OrderType::Market => quote * (1.0 + slippage),
        OrderType::Limit => limit_price.unwrap_or(quote),
    }
}

/// Adverse exit fill: market sells give up the slippage factor.
pub fn exit_fill_price(quote: f64, order_type: OrderType, limit_price: Option<f64>, slippage: f64) -> f64 {
    match order_type {
        OrderType::Market => quote * (1.0 - slippage),
        OrderType::Limit => limit_price.unwrap_or(quote),
    }
}

/// LIMIT orders earn maker fees, MARKET orders pay taker fees.
/// Fees are in percent units (0.40 = 0.40%).
pub fn fee_pct(order_type: OrderType, maker_fee_pct: f64, taker_fee_pct: f64) -> f64 {
    match order_type {
        OrderType::Limit => maker_fee_pct,
        OrderType::Market => taker_fee_pct,
    }
}

pub fn fee_amount(value: f64, fee_pct: f64) -> f64 {
    value * fee_pct / 100.0
}

/// Signal override beats the configured default.
pub fn slippage_for(signal: &Signal, default_slippage: f64) -> f64 {
    signal.slippage_tolerance.unwrap_or(default_slippage)
}

/// Fee-accurate realized P&L for closing `qty` of a position, with the
/// entry fee apportioned by the closed fraction.
pub fn realized_pnl(
    fill_price: f64,
    avg_entry: f64,
    qty: f64,
    position_qty: f64,
    total_entry_fee: f64,
    exit_fee: f64,
) -> (f64, f64, f64) {
    let close_fraction = if position_qty > 0.0 {
        (qty / position_qty).min(1.0)
    } else {
        1.0
    };
    let entry_fee_portion = total_entry_fee * close_fraction;
    let total_fee = entry_fee_portion + exit_fee;
    let pnl = (fill_price - avg_entry) * qty - total_fee;
    let pnl_pct = if avg_entry * qty > 0.0 {
        pnl / (avg_entry * qty)
    } else {
        0.0
    };
    (pnl, pnl_pct, entry_fee_portion)
}

/// Positions below this quantity are considered fully closed.
pub const QTY_EPSILON: f64 = 1e-6;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn market_fills_are_adverse_both_ways() {
        let buy = entry_fill_price(50_000.0, OrderType::Market, None, 0.0005);
        let sell = exit_fill_price(50_000.0, OrderType::Market, None, 0.0005);
        assert!((buy - 50_025.0).abs() < 1e-9);
        assert!((sell - 49_975.0).abs() < 1e-9);
    }

    #[test]
    fn limit_fills_at_limit_price() {
        assert_eq!(
            entry_fill_price(50_000.0, OrderType::Limit, Some(49_500.0), 0.0005),
            49_500.0
        );
        assert_eq!(
            exit_fill_price(50_000.0, OrderType::Limit, Some(50_500.0), 0.0005),
            50_500.0
        );
    }

    #[test]
    fn partial_close_apportions_entry_fee() {
        // Close half of a position that paid 0.4 entry fee
        let (pnl, _, portion) = realized_pnl(110.0, 100.0, 1.0, 2.0, 0.4, 0.1);
        assert!((portion - 0.2).abs() < 1e-12);
        assert!((pnl - (10.0 - 0.3)).abs() < 1e-12);
    }

    #[test]
    fn full_close_pnl_matches_formula() {
        let (pnl, pnl_pct, _) = realized_pnl(105.0, 100.0, 2.0, 2.0, 0.5, 0.3);
        // (105-100)*2 - 0.8
        assert!((pnl - 9.2).abs() < 1e-12);
        assert!((pnl_pct - 9.2 / 200.0).abs() < 1e-12);
    }
}
