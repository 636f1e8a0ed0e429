//! Truth benchmarks: rigid shell component.
//!
//! Simple, verifiable metrics computed directly from raw store data. The
//! orchestrator cannot modify these; they exist so it can check its own
//! analysis modules against reality. Nothing here interprets: counts,
//! sums, and plain ratios only.

use anyhow::Result;
use serde_json::{json, Map, Value};

use crate::infrastructure::persistence::{RowExt, Store};

pub async fn compute_truth_benchmarks(store: &Store) -> Result<Value> {
    let mut out = Map::new();

    let trade_stats = store
        .fetch_one(
            "SELECT \
               COUNT(*) as trade_count, \
               COALESCE(SUM(CASE WHEN pnl > 0 THEN 1 ELSE 0 END), 0) as win_count, \
               COALESCE(SUM(CASE WHEN pnl < 0 THEN 1 ELSE 0 END), 0) as loss_count, \
               COALESCE(SUM(pnl), 0) as net_pnl, \
               COALESCE(SUM(fees), 0) as total_fees, \
               COALESCE(AVG(CASE WHEN pnl > 0 THEN pnl END), 0) as avg_win, \
               COALESCE(AVG(CASE WHEN pnl < 0 THEN pnl END), 0) as avg_loss \
             FROM trades WHERE closed_at IS NOT NULL",
            &[],
        )
        .await?
        .unwrap_or_default();

    let trade_count = trade_stats.i64("trade_count");
    let win_count = trade_stats.i64("win_count");
    let loss_count = trade_stats.i64("loss_count");
    let avg_win = trade_stats.f64("avg_win");
    let avg_loss = trade_stats.f64("avg_loss");

    out.insert("trade_count".into(), json!(trade_count));
    out.insert("win_count".into(), json!(win_count));
    out.insert("loss_count".into(), json!(loss_count));
    let win_rate = if trade_count > 0 {
        win_count as f64 / trade_count as f64
    } else {
        0.0
    };
    out.insert("win_rate".into(), json!(win_rate));
    out.insert("net_pnl".into(), json!(trade_stats.f64("net_pnl")));
    out.insert("total_fees".into(), json!(trade_stats.f64("total_fees")));
    out.insert("avg_win".into(), json!(avg_win));
    out.insert("avg_loss".into(), json!(avg_loss));

    // Expectancy: (win_rate * avg_win) + (loss_rate * avg_loss), signs respected
    let expectancy = if trade_count > 0 {
        let loss_rate = loss_count as f64 / trade_count as f64;
        win_rate * avg_win + loss_rate * avg_loss
    } else {
        0.0
    };
    out.insert("expectancy".into(), json!(expectancy));

    // Current loss streak: leading losses in the most recent trades
    let recent = store
        .fetch_all(
            "SELECT pnl FROM trades WHERE closed_at IS NOT NULL ORDER BY closed_at DESC LIMIT 50",
            &[],
        )
        .await?;
    let mut streak = 0;
    for t in &recent {
        if t.opt_f64("pnl").map(|p| p < 0.0).unwrap_or(false) {
            streak += 1;
        } else {
            break;
        }
    }
    out.insert("consecutive_losses".into(), json!(streak));

    let snapshot = store
        .fetch_one(
            "SELECT portfolio_value, cash FROM daily_performance ORDER BY date DESC LIMIT 1",
            &[],
        )
        .await?;
    out.insert(
        "portfolio_value".into(),
        snapshot
            .as_ref()
            .and_then(|s| s.get("portfolio_value").cloned())
            .unwrap_or(Value::Null),
    );
    out.insert(
        "portfolio_cash".into(),
        snapshot
            .as_ref()
            .and_then(|s| s.get("cash").cloned())
            .unwrap_or(Value::Null),
    );

    // Max drawdown over the daily snapshot series
    let snapshots = store
        .fetch_all(
            "SELECT portfolio_value FROM daily_performance ORDER BY date ASC",
            &[],
        )
        .await?;
    let mut peak = 0.0f64;
    let mut max_drawdown = 0.0f64;
    for s in &snapshots {
        let Some(val) = s.opt_f64("portfolio_value") else {
            continue;
        };
        if val > peak {
            peak = val;
        }
        if peak > 0.0 {
            max_drawdown = max_drawdown.max((peak - val) / peak);
        }
    }
    out.insert("max_drawdown_pct".into(), json!(max_drawdown));

    let sig_row = store
        .fetch_one(
            "SELECT COUNT(*) as total_signals, COALESCE(SUM(acted_on), 0) as acted_signals FROM signals",
            &[],
        )
        .await?
        .unwrap_or_default();
    let total_signals = sig_row.i64("total_signals");
    let acted_signals = sig_row.i64("acted_signals");
    out.insert("total_signals".into(), json!(total_signals));
    out.insert("acted_signals".into(), json!(acted_signals));
    out.insert(
        "signal_act_rate".into(),
        json!(if total_signals > 0 {
            acted_signals as f64 / total_signals as f64
        } else {
            0.0
        }),
    );

    let scan_row = store
        .fetch_one("SELECT COUNT(*) as total_scans FROM scan_results", &[])
        .await?
        .unwrap_or_default();
    out.insert("total_scans".into(), json!(scan_row.i64("total_scans")));
    for (key, sql) in [
        ("first_scan_at", "SELECT MIN(created_at) as v FROM scan_results"),
        ("last_scan_at", "SELECT MAX(created_at) as v FROM scan_results"),
    ] {
        let v = store
            .fetch_one(sql, &[])
            .await?
            .and_then(|r| r.get("v").cloned())
            .unwrap_or(Value::Null);
        out.insert(key.into(), v);
    }

    let version_row = store
        .fetch_one(
            "SELECT version FROM strategy_versions WHERE deployed_at IS NOT NULL \
             ORDER BY deployed_at DESC LIMIT 1",
            &[],
        )
        .await?;
    out.insert(
        "current_strategy_version".into(),
        version_row
            .and_then(|r| r.get("version").cloned())
            .unwrap_or(Value::Null),
    );
    let version_count = store
        .fetch_one("SELECT COUNT(*) as count FROM strategy_versions", &[])
        .await?
        .unwrap_or_default();
    out.insert(
        "strategy_version_count".into(),
        json!(version_count.i64("count")),
    );

    let pf_row = store
        .fetch_one(
            "SELECT \
               COALESCE(SUM(CASE WHEN pnl > 0 THEN pnl ELSE 0 END), 0) as gross_wins, \
               COALESCE(SUM(CASE WHEN pnl < 0 THEN ABS(pnl) ELSE 0 END), 0) as gross_losses \
             FROM trades WHERE closed_at IS NOT NULL",
            &[],
        )
        .await?
        .unwrap_or_default();
    let gross_wins = pf_row.f64("gross_wins");
    let gross_losses = pf_row.f64("gross_losses");
    let profit_factor = if gross_losses > 0.0 {
        json!(gross_wins / gross_losses)
    } else if gross_wins > 0.0 {
        json!("inf")
    } else {
        json!(0.0)
    };
    out.insert("profit_factor".into(), profit_factor);

    let reason_rows = store
        .fetch_all(
            "SELECT close_reason, COUNT(*) as cnt FROM trades \
             WHERE closed_at IS NOT NULL GROUP BY close_reason",
            &[],
        )
        .await?;
    let mut reasons = Map::new();
    for r in &reason_rows {
        reasons.insert(r.str_or("close_reason", "unknown"), json!(r.i64("cnt")));
    }
    out.insert("close_reason_breakdown".into(), Value::Object(reasons));

    let duration_row = store
        .fetch_one(
            "SELECT AVG((julianday(closed_at) - julianday(opened_at)) * 24) as avg_hours \
             FROM trades WHERE closed_at IS NOT NULL AND opened_at IS NOT NULL",
            &[],
        )
        .await?
        .unwrap_or_default();
    out.insert(
        "avg_trade_duration_hours".into(),
        json!(duration_row.f64("avg_hours")),
    );

    let extremes = store
        .fetch_one(
            "SELECT MAX(pnl_pct) as best, MIN(pnl_pct) as worst \
             FROM trades WHERE closed_at IS NOT NULL",
            &[],
        )
        .await?
        .unwrap_or_default();
    out.insert("best_trade_pnl_pct".into(), json!(extremes.f64("best")));
    out.insert("worst_trade_pnl_pct".into(), json!(extremes.f64("worst")));

    // Sharpe / Sortino from daily snapshots
    let values: Vec<f64> = snapshots
        .iter()
        .filter_map(|r| r.opt_f64("portfolio_value"))
        .collect();
    let mut sharpe = 0.0;
    let mut sortino = 0.0;
    if values.len() >= 3 {
        let returns: Vec<f64> = values
            .windows(2)
            .filter(|w| w[0] > 0.0)
            .map(|w| (w[1] - w[0]) / w[0])
            .collect();
        if returns.len() >= 2 {
            let mean = returns.iter().sum::<f64>() / returns.len() as f64;
            let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>()
                / (returns.len() - 1) as f64;
            let std = variance.sqrt();
            if std > 0.0 {
                sharpe = mean / std * 365f64.sqrt();
            }
            let downside: Vec<f64> = returns.iter().copied().filter(|r| *r < 0.0).collect();
            if downside.len() >= 2 {
                let down_var =
                    downside.iter().map(|r| r * r).sum::<f64>() / (downside.len() - 1) as f64;
                let down_std = down_var.sqrt();
                if down_std > 0.0 {
                    sortino = mean / down_std * 365f64.sqrt();
                }
            }
        }
    }
    out.insert("sharpe_ratio".into(), json!(sharpe));
    out.insert("sortino_ratio".into(), json!(sortino));

    Ok(Value::Object(out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn empty_store_yields_zeroed_benchmarks() {
        let store = Store::connect_memory().await.unwrap();
        let truth = compute_truth_benchmarks(&store).await.unwrap();
        assert_eq!(truth["trade_count"], json!(0));
        assert_eq!(truth["win_rate"], json!(0.0));
        assert_eq!(truth["portfolio_value"], Value::Null);
        assert_eq!(truth["consecutive_losses"], json!(0));
    }

    #[tokio::test]
    async fn trade_stats_and_streak_add_up() {
        let store = Store::connect_memory().await.unwrap();
        for (pnl, fees, closed_at) in [
            (5.0, 0.2, "2025-06-01T10:00:00"),
            (-2.0, 0.2, "2025-06-02T10:00:00"),
            (-1.0, 0.2, "2025-06-03T10:00:00"),
        ] {
            store
                .exec(
                    "INSERT INTO trades (symbol, side, qty, entry_price, exit_price, pnl, pnl_pct, \
                     fees, close_reason, opened_at, closed_at) \
                     VALUES ('BTC/USD', 'long', 1, 100, 101, ?, 0.01, ?, 'signal', '2025-06-01T09:00:00', ?)",
                    &[json!(pnl), json!(fees), json!(closed_at)],
                )
                .await
                .unwrap();
        }

        let truth = compute_truth_benchmarks(&store).await.unwrap();
        assert_eq!(truth["trade_count"], json!(3));
        assert_eq!(truth["win_count"], json!(1));
        assert_eq!(truth["consecutive_losses"], json!(2));
        assert!((truth["net_pnl"].as_f64().unwrap() - 2.0).abs() < 1e-9);
        // profit factor = 5 / 3
        assert!((truth["profit_factor"].as_f64().unwrap() - 5.0 / 3.0).abs() < 1e-9);
        let reasons = truth["close_reason_breakdown"].as_object().unwrap();
        assert_eq!(reasons["signal"], json!(3));
    }
}
