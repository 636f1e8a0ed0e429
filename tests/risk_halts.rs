//! Risk-halt scenarios: daily-loss gating, structural halt persistence
//! across daily resets, and counter recovery from the store.

use evotrade::application::risk::RiskManager;
use evotrade::config::RiskConfig;
use evotrade::domain::contract::{Action, Intent, OrderType, Signal};
use evotrade::infrastructure::persistence::Store;
use serde_json::json;

fn buy(symbol: &str, size_pct: f64) -> Signal {
    Signal {
        symbol: symbol.to_string(),
        action: Action::Buy,
        size_pct,
        order_type: OrderType::Market,
        limit_price: None,
        stop_loss: None,
        take_profit: None,
        intent: Intent::Day,
        confidence: 0.5,
        reasoning: String::new(),
        slippage_tolerance: None,
        tag: None,
    }
}

fn risk_config() -> RiskConfig {
    RiskConfig {
        max_daily_loss_pct: 0.05,
        max_daily_trades: 50,
        max_drawdown_pct: 0.10,
        rollback_consecutive_losses: 999,
        ..RiskConfig::default()
    }
}

#[test]
fn daily_loss_halt_trips_only_past_the_limit() {
    let mut risk = RiskManager::new(risk_config());

    // Twenty losses of 0.5 each: -10 total against a -50 limit on 1000
    for _ in 0..20 {
        risk.record_trade_result(-0.5);
    }
    let check = risk.check_signal(&buy("BTC/USD", 0.05), 1000.0, 0, 0.0, Some(1000.0), true);
    assert!(check.passed, "under the limit must pass: {}", check.reason);

    // One more at -45 pushes the total to -55, past -50
    risk.record_trade_result(-45.0);
    let check = risk.check_signal(&buy("BTC/USD", 0.05), 1000.0, 0, 0.0, Some(1000.0), true);
    assert!(!check.passed);
    assert!(check.reason.contains("Daily"), "reason: {}", check.reason);

    // Exits still pass
    let mut close = buy("BTC/USD", 0.0);
    close.action = Action::Close;
    assert!(risk
        .check_signal(&close, 1000.0, 1, 0.0, Some(1000.0), false)
        .passed);
}

#[test]
fn drawdown_halt_survives_daily_reset() {
    let mut risk = RiskManager::new(risk_config());
    risk.update_portfolio_peak(1000.0);

    // 11% below peak: first BUY trips the structural halt
    let check = risk.check_signal(&buy("BTC/USD", 0.05), 890.0, 0, 0.0, None, true);
    assert!(!check.passed);
    assert!(check.reason.contains("Max drawdown"), "{}", check.reason);
    assert!(risk.is_halted());

    risk.reset_daily();
    let check = risk.check_signal(&buy("BTC/USD", 0.05), 890.0, 0, 0.0, None, true);
    assert!(!check.passed, "structural halt must survive the daily reset");

    // Only the manual unhalt clears it
    risk.unhalt();
    assert!(risk
        .check_signal(&buy("BTC/USD", 0.05), 890.0, 0, 0.0, None, true)
        .passed);
}

#[test]
fn halted_manager_never_passes_a_buy_until_unhalt() {
    let mut config = risk_config();
    config.rollback_consecutive_losses = 3;
    let mut risk = RiskManager::new(config);

    for _ in 0..3 {
        risk.record_trade_result(-1.0);
    }
    // Monotonicity: once the streak halt trips, every subsequent BUY fails
    for _ in 0..5 {
        let check = risk.check_signal(&buy("ETH/USD", 0.02), 1000.0, 0, 0.0, None, true);
        assert!(!check.passed);
    }
    // A winning streak recorded while halted resets the counter, but the
    // halt itself stays until cleared
    risk.record_trade_result(2.0);
    assert_eq!(risk.consecutive_losses(), 0);
    assert!(risk.is_halted());
    risk.unhalt();
    assert!(risk
        .check_signal(&buy("ETH/USD", 0.02), 1000.0, 0, 0.0, None, true)
        .passed);
}

#[tokio::test]
async fn counters_recover_from_the_store() {
    let store = Store::connect_memory().await.unwrap();

    // Peak comes from the daily snapshots
    for (date, value) in [("2025-05-01", 900.0), ("2025-05-02", 1200.0), ("2025-05-03", 1100.0)] {
        store
            .exec(
                "INSERT INTO daily_performance (date, portfolio_value, cash) VALUES (?, ?, ?)",
                &[json!(date), json!(value), json!(value)],
            )
            .await
            .unwrap();
    }
    // Two most recent trades are losses: streak of 2
    for (pnl, closed_at) in [(3.0, "2020-01-01T10:00:00"), (-1.0, "2020-01-02T10:00:00"), (-2.0, "2020-01-03T10:00:00")] {
        store
            .exec(
                "INSERT INTO trades (symbol, side, qty, entry_price, pnl, closed_at) \
                 VALUES ('BTC/USD', 'long', 1, 100, ?, ?)",
                &[json!(pnl), json!(closed_at)],
            )
            .await
            .unwrap();
    }

    let mut risk = RiskManager::new(risk_config());
    risk.initialize(&store, chrono_tz::UTC).await.unwrap();

    assert_eq!(risk.peak_portfolio(), Some(1200.0));
    assert_eq!(risk.consecutive_losses(), 2);
    // Trades closed years ago do not count toward today's counters
    assert_eq!(risk.daily_trades(), 0);
}
