//! Candidate isolation: a candidate runner trades a clone of the fund's
//! portfolio, and nothing it does can move the fund's cash, positions, or
//! trade history.

use chrono::Utc;
use evotrade::application::candidates::CandidateRunner;
use evotrade::application::strategy::builtin::BaselineStrategy;
use evotrade::application::trading::{PortfolioTracker, Position};
use evotrade::config::Config;
use evotrade::domain::contract::{Action, Intent, OrderType, Signal};
use evotrade::infrastructure::persistence::{RowExt, Store};
use std::collections::HashMap;

fn paper_config() -> Config {
    let mut config = Config::default();
    config.paper_balance_usd = 1000.0;
    config
}

fn buy(symbol: &str, size_pct: f64, tag: Option<&str>, stop_loss: Option<f64>) -> Signal {
    Signal {
        symbol: symbol.to_string(),
        action: Action::Buy,
        size_pct,
        order_type: OrderType::Market,
        limit_price: None,
        stop_loss,
        take_profit: None,
        intent: Intent::Day,
        confidence: 0.5,
        reasoning: String::new(),
        slippage_tolerance: None,
        tag: tag.map(str::to_string),
    }
}

#[tokio::test]
async fn candidate_trading_never_touches_the_fund() {
    let store = Store::connect_memory().await.unwrap();
    let mut fund = PortfolioTracker::new(paper_config(), store.clone(), None);
    fund.initialize().await.unwrap();

    // Fund opens a position with a stop
    fund.execute_signal(
        &buy("BTC/USD", 0.05, Some("f1"), Some(49_000.0)),
        50_000.0,
        0.25,
        0.40,
        None,
    )
    .await
    .unwrap();
    let fund_cash_before = fund.cash();
    let fund_position_before = fund.positions().get("f1").cloned().unwrap();

    // Candidate is seeded with a clone of the fund's state
    let cloned: Vec<Position> = fund.positions().values().cloned().collect();
    let mut runner = CandidateRunner::new(
        1,
        Box::new(BaselineStrategy::new()),
        "code".to_string(),
        "v_cand".to_string(),
        fund.cash(),
        cloned,
        paper_config().risk_limits(),
        0.0005,
        0.25,
        0.40,
    );
    assert!(
        runner.positions().contains_key("c1_f1"),
        "cloned position carries the slot prefix"
    );

    // Crash the price: the candidate's stop triggers and its clone closes
    let mut prices = HashMap::new();
    prices.insert("BTC/USD".to_string(), 48_000.0);
    let closed = runner.check_sl_tp(&prices);
    assert_eq!(closed.len(), 1);
    assert_eq!(closed[0].close_reason, "stop_loss");
    assert!(runner.positions().is_empty());

    // The fund is untouched: same cash, same position, same quantities
    assert_eq!(fund.cash(), fund_cash_before);
    let fund_position_after = fund.positions().get("f1").unwrap();
    assert_eq!(fund_position_after.qty, fund_position_before.qty);
    assert_eq!(fund_position_after.avg_entry, fund_position_before.avg_entry);

    // And no fund trade row appeared from the candidate's close
    let fund_trades = store
        .fetch_one("SELECT COUNT(*) as cnt FROM trades", &[])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(fund_trades.i64("cnt"), 0);
}

#[tokio::test]
async fn candidate_cash_moves_only_inside_the_runner() {
    let store = Store::connect_memory().await.unwrap();
    let mut fund = PortfolioTracker::new(paper_config(), store.clone(), None);
    fund.initialize().await.unwrap();
    let fund_cash = fund.cash();

    let mut runner = CandidateRunner::new(
        2,
        Box::new(BaselineStrategy::new()),
        "code".to_string(),
        "v_cand".to_string(),
        fund_cash,
        Vec::new(),
        paper_config().risk_limits(),
        0.0005,
        0.25,
        0.40,
    );

    // Drive a buy through the public scan path by giving the runner a
    // position with a stop already crossed, then confirm accounting stays
    // private. (BaselineStrategy emits nothing on empty candles, so the
    // clone path above is the trading route; here we just assert the
    // runner's books and the fund's books are different objects.)
    assert_eq!(runner.cash(), fund_cash);
    let status = runner.status();
    assert_eq!(status["trade_count"], serde_json::json!(0));

    // Mutating the fund afterwards does not touch the runner either
    fund.execute_signal(&buy("ETH/USD", 0.05, Some("e"), None), 2_000.0, 0.25, 0.40, None)
        .await
        .unwrap();
    assert_eq!(runner.cash(), fund_cash);
    assert!(runner.positions().is_empty());
}
