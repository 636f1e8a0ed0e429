//! End-to-end trading flow against an in-memory store: paper fills,
//! fee-accurate P&L, FIFO targeting, and the signal audit trail.

use evotrade::application::trading::PortfolioTracker;
use evotrade::config::Config;
use evotrade::domain::contract::{Action, Intent, OrderType, Signal};
use evotrade::infrastructure::persistence::{RowExt, Store};

fn paper_config(balance: f64) -> Config {
    let mut config = Config::default();
    config.paper_balance_usd = balance;
    config.default_slippage_factor = 0.0005;
    config
}

fn signal(symbol: &str, action: Action, size_pct: f64, tag: Option<&str>) -> Signal {
    Signal {
        symbol: symbol.to_string(),
        action,
        size_pct,
        order_type: OrderType::Market,
        limit_price: None,
        stop_loss: None,
        take_profit: None,
        intent: Intent::Day,
        confidence: 0.9,
        reasoning: "test".to_string(),
        slippage_tolerance: None,
        tag: tag.map(str::to_string),
    }
}

async fn tracker(balance: f64) -> (PortfolioTracker, Store) {
    let store = Store::connect_memory().await.unwrap();
    let mut tracker = PortfolioTracker::new(paper_config(balance), store.clone(), None);
    tracker.initialize().await.unwrap();
    (tracker, store)
}

#[tokio::test]
async fn buy_and_sell_at_a_profit() {
    let (mut tracker, store) = tracker(1000.0).await;

    // BUY BTC/USD 5% at quoted 50000: fill ~50025, fee ~0.20, cash ~949.80
    let results = tracker
        .execute_signal(
            &signal("BTC/USD", Action::Buy, 0.05, None),
            50_000.0,
            0.25,
            0.40,
            None,
        )
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
    let buy = &results[0];
    assert!((buy.price - 50_025.0).abs() < 1e-6, "fill {}", buy.price);
    assert!((buy.fee - 0.20).abs() < 1e-3, "entry fee {}", buy.fee);
    assert!((tracker.cash() - 949.80).abs() < 1e-2, "cash {}", tracker.cash());

    // CLOSE at quoted 51000: exit fill ~50974.5, pnl ~ +0.545, cash ~1000.55
    let results = tracker
        .execute_signal(
            &signal("BTC/USD", Action::Close, 1.0, None),
            51_000.0,
            0.25,
            0.40,
            None,
        )
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
    let close = &results[0];
    assert!((close.price - 50_974.5).abs() < 1e-6);
    assert!((close.fee - 0.2035).abs() < 1e-3, "exit fee {}", close.fee);
    let pnl = close.pnl.unwrap();
    assert!((pnl - 0.545).abs() < 0.01, "pnl {pnl}");
    assert!((tracker.cash() - 1000.55).abs() < 0.01, "cash {}", tracker.cash());
    assert_eq!(tracker.position_count(), 0);

    // Exactly one trade row, closed by signal
    let rows = store.fetch_all("SELECT * FROM trades", &[]).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].str_or("close_reason", ""), "signal");
    // pnl = (exit - entry) * qty - fees, within float tolerance
    let row = &rows[0];
    let reconstructed = (row.f64("exit_price") - row.f64("entry_price")) * row.f64("qty")
        - row.f64("fees");
    assert!((reconstructed - row.f64("pnl")).abs() < 1e-6);
}

#[tokio::test]
async fn flat_trade_loses_exactly_the_fee_drag() {
    let (mut tracker, _store) = tracker(1000.0).await;

    tracker
        .execute_signal(
            &signal("BTC/USD", Action::Buy, 0.05, None),
            50_000.0,
            0.25,
            0.40,
            None,
        )
        .await
        .unwrap();
    tracker
        .execute_signal(
            &signal("BTC/USD", Action::Close, 1.0, None),
            50_000.0,
            0.25,
            0.40,
            None,
        )
        .await
        .unwrap();

    let drag = 1000.0 - tracker.cash();
    assert!(drag > 0.0, "flat round trip must cost money");
    // ~ two 0.4% fees on $50 plus slippage both ways (~0.05)
    let expected = 2.0 * 0.004 * 50.0 + 0.05;
    assert!((drag - expected).abs() < 0.02, "drag {drag} vs {expected}");
}

#[tokio::test]
async fn multi_position_by_tag_with_fifo_sell() {
    let (mut tracker, store) = tracker(1000.0).await;

    tracker
        .execute_signal(
            &signal("BTC/USD", Action::Buy, 0.03, Some("a")),
            50_000.0,
            0.25,
            0.40,
            None,
        )
        .await
        .unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    tracker
        .execute_signal(
            &signal("BTC/USD", Action::Buy, 0.03, Some("b")),
            51_000.0,
            0.25,
            0.40,
            None,
        )
        .await
        .unwrap();
    assert_eq!(tracker.position_count(), 2, "two tagged positions, one symbol");

    // SELL without tag closes "a" first (FIFO)
    let results = tracker
        .execute_signal(
            &signal("BTC/USD", Action::Sell, 1.0, None),
            52_000.0,
            0.25,
            0.40,
            None,
        )
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].tag, "a");

    // CLOSE without tag sweeps what remains ("b")
    let results = tracker
        .execute_signal(
            &signal("BTC/USD", Action::Close, 1.0, None),
            53_000.0,
            0.25,
            0.40,
            None,
        )
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].tag, "b");
    assert_eq!(tracker.position_count(), 0);

    let rows = store
        .fetch_all("SELECT tag FROM trades ORDER BY id", &[])
        .await
        .unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].str_or("tag", ""), "a");
    assert_eq!(rows[1].str_or("tag", ""), "b");
}

#[tokio::test]
async fn tag_exclusivity_holds_through_a_busy_sequence() {
    let (mut tracker, _store) = tracker(10_000.0).await;

    for (tag, price) in [("x", 100.0), ("y", 101.0), ("z", 102.0)] {
        tracker
            .execute_signal(
                &signal("ETH/USD", Action::Buy, 0.02, Some(tag)),
                price,
                0.25,
                0.40,
                None,
            )
            .await
            .unwrap();
    }
    // Average into one of them
    tracker
        .execute_signal(
            &signal("ETH/USD", Action::Buy, 0.02, Some("y")),
            103.0,
            0.25,
            0.40,
            None,
        )
        .await
        .unwrap();

    // No two open positions ever share a tag
    let tags: Vec<&String> = tracker.positions().keys().collect();
    let mut deduped = tags.clone();
    deduped.sort();
    deduped.dedup();
    assert_eq!(tags.len(), deduped.len());
    assert_eq!(tracker.position_count(), 3);
}

#[tokio::test]
async fn untagged_buys_get_generated_tags() {
    let (mut tracker, _store) = tracker(1000.0).await;
    for _ in 0..3 {
        tracker
            .execute_signal(
                &signal("SOL/USD", Action::Buy, 0.02, None),
                80.0,
                0.25,
                0.40,
                None,
            )
            .await
            .unwrap();
    }
    assert_eq!(tracker.position_count(), 3);
    for tag in tracker.positions().keys() {
        assert!(tag.starts_with("auto_SOLUSD_"), "unexpected tag {tag}");
    }
}
