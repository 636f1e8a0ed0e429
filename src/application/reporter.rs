//! Daily and weekly performance reports rendered from stored data, used by
//! the notification sink and the orchestrator's context.

use anyhow::Result;
use chrono::{Duration, Utc};
use serde_json::{json, Map, Value};

use crate::infrastructure::persistence::{RowExt, Store};

pub struct Reporter {
    store: Store,
}

impl Reporter {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub async fn daily_summary(&self) -> Result<String> {
        let today = Utc::now().format("%Y-%m-%d").to_string();
        let perf = self
            .store
            .fetch_one(
                "SELECT * FROM daily_performance WHERE date = ?",
                &[json!(today)],
            )
            .await?;
        let Some(perf) = perf else {
            return Ok("No performance data for today.".to_string());
        };

        let positions = self
            .store
            .fetch_one("SELECT COUNT(*) as cnt FROM positions", &[])
            .await?
            .map(|r| r.i64("cnt"))
            .unwrap_or(0);
        let trades_today = self
            .store
            .fetch_all(
                "SELECT symbol, side, pnl FROM trades WHERE closed_at >= ?",
                &[json!(today)],
            )
            .await?;

        let total_trades = perf.i64("total_trades");
        let mut lines = vec![
            "--- Daily Summary ---".to_string(),
            format!("Portfolio: ${:.2}", perf.f64("portfolio_value")),
            format!("P&L: ${:+.2}", perf.f64("net_pnl")),
            format!(
                "Trades: {} ({}W/{}L)",
                total_trades,
                perf.i64("wins"),
                perf.i64("losses")
            ),
            if total_trades > 0 {
                format!("Win Rate: {:.0}%", perf.f64("win_rate") * 100.0)
            } else {
                "Win Rate: N/A".to_string()
            },
            format!("Fees: ${:.2}", perf.f64("fees_total")),
            format!("Open Positions: {positions}"),
        ];

        if !trades_today.is_empty() {
            lines.push(String::new());
            lines.push("Trades:".to_string());
            for t in &trades_today {
                let pnl = match t.opt_f64("pnl") {
                    Some(p) => format!("${p:+.2}"),
                    None => "open".to_string(),
                };
                lines.push(format!(
                    "  {} {} {}",
                    t.str_or("symbol", "?"),
                    t.str_or("side", "?"),
                    pnl
                ));
            }
        }

        Ok(lines.join("\n"))
    }

    pub async fn weekly_report(&self) -> Result<String> {
        let week_ago = (Utc::now() - Duration::days(7)).format("%Y-%m-%d").to_string();
        let perfs = self
            .store
            .fetch_all(
                "SELECT * FROM daily_performance WHERE date >= ? ORDER BY date",
                &[json!(week_ago)],
            )
            .await?;
        if perfs.is_empty() {
            return Ok("No performance data for this week.".to_string());
        }

        let trades = self
            .store
            .fetch_all(
                "SELECT pnl FROM trades WHERE closed_at >= ? ORDER BY closed_at ASC",
                &[json!(week_ago)],
            )
            .await?;

        let total_pnl: f64 = perfs.iter().map(|p| p.f64("net_pnl")).sum();
        let total_trades: i64 = perfs.iter().map(|p| p.i64("total_trades")).sum();
        let total_wins: i64 = perfs.iter().map(|p| p.i64("wins")).sum();
        let total_fees: f64 = perfs.iter().map(|p| p.f64("fees_total")).sum();
        let latest_value = perfs.last().map(|p| p.f64("portfolio_value")).unwrap_or(0.0);

        // Longest win/loss streaks over the week's trades
        let mut max_win_streak = 0i64;
        let mut max_loss_streak = 0i64;
        let mut current = 0i64;
        for t in &trades {
            let Some(pnl) = t.opt_f64("pnl") else { continue };
            if pnl > 0.0 {
                current = if current > 0 { current + 1 } else { 1 };
                max_win_streak = max_win_streak.max(current);
            } else {
                current = if current < 0 { current - 1 } else { -1 };
                max_loss_streak = max_loss_streak.max(current.abs());
            }
        }

        let mut lines = vec![
            "=== Weekly Report ===".to_string(),
            format!("Portfolio: ${latest_value:.2}"),
            format!("Week P&L: ${total_pnl:+.2}"),
            format!(
                "Trades: {} ({}W/{}L)",
                total_trades,
                total_wins,
                total_trades - total_wins
            ),
            if total_trades > 0 {
                format!(
                    "Win Rate: {:.0}%",
                    total_wins as f64 / total_trades as f64 * 100.0
                )
            } else {
                "Win Rate: N/A".to_string()
            },
            format!("Fees: ${total_fees:.2}"),
            format!("Best Win Streak: {max_win_streak}"),
            format!("Worst Loss Streak: {max_loss_streak}"),
            String::new(),
            "Daily Breakdown:".to_string(),
        ];
        for p in &perfs {
            lines.push(format!(
                "  {}: ${:+.2} ({} trades)",
                p.str_or("date", "?"),
                p.f64("net_pnl"),
                p.i64("total_trades")
            ));
        }

        Ok(lines.join("\n"))
    }

    /// Performance metrics over a recent window, optionally filtered to one
    /// strategy version. Feeds the orchestrator context.
    pub async fn strategy_performance(&self, version: Option<&str>, days: i64) -> Result<Value> {
        let cutoff = (Utc::now() - Duration::days(days))
            .format("%Y-%m-%d")
            .to_string();
        let trades = match version {
            Some(v) => {
                self.store
                    .fetch_all(
                        "SELECT pnl, fees FROM trades WHERE strategy_version = ? AND closed_at >= ?",
                        &[json!(v), json!(cutoff)],
                    )
                    .await?
            }
            None => {
                self.store
                    .fetch_all(
                        "SELECT pnl, fees FROM trades WHERE closed_at >= ?",
                        &[json!(cutoff)],
                    )
                    .await?
            }
        };

        let pnls: Vec<f64> = trades.iter().filter_map(|t| t.opt_f64("pnl")).collect();
        if pnls.is_empty() {
            return Ok(json!({"trades": 0, "win_rate": 0, "expectancy": 0, "net_pnl": 0}));
        }

        let wins: Vec<f64> = pnls.iter().copied().filter(|p| *p > 0.0).collect();
        let losses: Vec<f64> = pnls.iter().copied().filter(|p| *p < 0.0).collect();
        let total = pnls.len() as f64;
        let win_rate = wins.len() as f64 / total;
        let avg_win = if wins.is_empty() {
            0.0
        } else {
            wins.iter().sum::<f64>() / wins.len() as f64
        };
        let avg_loss = if losses.is_empty() {
            0.0
        } else {
            (losses.iter().sum::<f64>() / losses.len() as f64).abs()
        };

        let mut out = Map::new();
        out.insert("trades".into(), json!(pnls.len()));
        out.insert("wins".into(), json!(wins.len()));
        out.insert("losses".into(), json!(losses.len()));
        out.insert("win_rate".into(), json!(win_rate));
        out.insert("avg_win".into(), json!(avg_win));
        out.insert("avg_loss".into(), json!(avg_loss));
        out.insert(
            "expectancy".into(),
            json!(win_rate * avg_win - (1.0 - win_rate) * avg_loss),
        );
        out.insert("net_pnl".into(), json!(pnls.iter().sum::<f64>()));
        out.insert(
            "total_fees".into(),
            json!(trades.iter().map(|t| t.f64("fees")).sum::<f64>()),
        );
        let gross_loss: f64 = losses.iter().map(|l| l.abs()).sum();
        out.insert(
            "profit_factor".into(),
            if gross_loss > 0.0 {
                json!(wins.iter().sum::<f64>() / gross_loss)
            } else {
                Value::Null
            },
        );
        Ok(Value::Object(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_store_reports_gracefully() {
        let store = Store::connect_memory().await.unwrap();
        let reporter = Reporter::new(store);
        assert!(reporter.daily_summary().await.unwrap().contains("No performance"));
        assert!(reporter.weekly_report().await.unwrap().contains("No performance"));
        let perf = reporter.strategy_performance(None, 7).await.unwrap();
        assert_eq!(perf["trades"], json!(0));
    }

    #[tokio::test]
    async fn strategy_performance_math() {
        let store = Store::connect_memory().await.unwrap();
        let closed = Utc::now().format("%Y-%m-%dT%H:%M:%S").to_string();
        for pnl in [10.0, -5.0, 15.0, -10.0] {
            store
                .exec(
                    "INSERT INTO trades (symbol, side, qty, entry_price, pnl, fees, closed_at) \
                     VALUES ('BTC/USD', 'long', 1, 100, ?, 0.5, ?)",
                    &[json!(pnl), json!(closed)],
                )
                .await
                .unwrap();
        }
        let reporter = Reporter::new(store);
        let perf = reporter.strategy_performance(None, 7).await.unwrap();
        assert_eq!(perf["trades"], json!(4));
        assert_eq!(perf["win_rate"], json!(0.5));
        // expectancy = 0.5*12.5 - 0.5*7.5 = 2.5
        assert!((perf["expectancy"].as_f64().unwrap() - 2.5).abs() < 1e-9);
        // profit factor = 25/15
        assert!((perf["profit_factor"].as_f64().unwrap() - 25.0 / 15.0).abs() < 1e-9);
    }
}
