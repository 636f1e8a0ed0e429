//! Candidate manager: lifecycle for all candidate strategy slots.
//!
//! Creation, cancellation, promotion, persistence, and crash recovery.
//! Runner failures are isolated per slot: one broken candidate never takes
//! down a scan.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info};

use crate::application::strategy::loader::code_hash;
use crate::application::strategy::sandbox::validate_strategy_static;
use crate::application::strategy::WorkerStrategy;
use crate::application::trading::Position;
use crate::config::Config;
use crate::domain::contract::{Intent, SymbolData};
use crate::domain::time::{fmt_utc, local_date_string, parse_utc_lossy};
use crate::infrastructure::notification::Notifier;
use crate::infrastructure::persistence::{JsonRow, RowExt, Store};

use super::runner::{CandidateRunner, CandidateTrade};

pub struct CandidateManager {
    config: Config,
    store: Store,
    runners: HashMap<u32, CandidateRunner>,
    scan_counts: HashMap<u32, u32>,
    notifier: Option<Arc<Notifier>>,
}

impl CandidateManager {
    pub fn new(config: Config, store: Store) -> Self {
        Self {
            config,
            store,
            runners: HashMap::new(),
            scan_counts: HashMap::new(),
            notifier: None,
        }
    }

    pub fn set_notifier(&mut self, notifier: Arc<Notifier>) {
        self.notifier = Some(notifier);
    }

    pub fn active_slots(&self) -> Vec<u32> {
        let mut slots: Vec<u32> = self.runners.keys().copied().collect();
        slots.sort_unstable();
        slots
    }

    pub fn runner(&self, slot: u32) -> Option<&CandidateRunner> {
        self.runners.get(&slot)
    }

    /// Startup recovery: reconstruct every `running` candidate from the
    /// store: code, positions, trade history, and a cash figure rebuilt
    /// from the snapshot minus open-position cost plus realized results.
    pub async fn initialize(&mut self) -> Result<()> {
        let rows = self
            .store
            .fetch_all("SELECT * FROM candidates WHERE status = 'running'", &[])
            .await?;

        for row in rows {
            let slot = row.i64("slot") as u32;
            match self.recover_slot(slot, &row).await {
                Ok(()) => {
                    let runner = &self.runners[&slot];
                    info!(
                        slot,
                        version = %runner.version,
                        positions = runner.positions().len(),
                        "candidate recovered"
                    );
                }
                Err(e) => error!(slot, error = %e, "candidate recovery failed"),
            }
        }
        Ok(())
    }

    async fn recover_slot(&mut self, slot: u32, row: &JsonRow) -> Result<()> {
        let code = row.opt_str("code").context("candidate row missing code")?;
        let version = row.str_or("strategy_version", "unknown");

        let check = validate_strategy_static(&code);
        if !check.passed {
            bail!("recovered code failed validation: {:?}", check.errors);
        }
        let strategy = WorkerStrategy::from_code(&code, &self.config.worker).await?;

        let snapshot: Value = row
            .opt_str("portfolio_snapshot")
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or(Value::Null);
        let initial_cash = snapshot
            .get("cash")
            .and_then(Value::as_f64)
            .unwrap_or(self.config.paper_balance_usd);

        let mut runner = CandidateRunner::new(
            slot,
            Box::new(strategy),
            code,
            version.clone(),
            initial_cash,
            Vec::new(),
            self.config.risk_limits(),
            self.config.default_slippage_factor,
            self.config.kraken.maker_fee_pct,
            self.config.kraken.taker_fee_pct,
        );

        // Positions restore directly; tags already carry the slot prefix
        let pos_rows = self
            .store
            .fetch_all(
                "SELECT * FROM candidate_positions WHERE candidate_slot = ?",
                &[json!(slot)],
            )
            .await?;
        let mut positions = HashMap::new();
        for p in &pos_rows {
            let tag = p.str_or("tag", "");
            positions.insert(
                tag.clone(),
                Position {
                    symbol: p.str_or("symbol", ""),
                    tag,
                    side: p.str_or("side", "long"),
                    qty: p.f64("qty"),
                    avg_entry: p.f64("avg_entry"),
                    current_price: p.f64("current_price"),
                    entry_fee: p.f64("entry_fee"),
                    stop_loss: p.opt_f64("stop_loss"),
                    take_profit: p.opt_f64("take_profit"),
                    intent: Intent::parse_lossy(&p.str_or("intent", "DAY")),
                    strategy_version: Some(version.clone()),
                    opened_at: p
                        .opt_str("opened_at")
                        .and_then(|s| parse_utc_lossy(&s))
                        .unwrap_or_else(Utc::now),
                    updated_at: Utc::now(),
                    max_adverse_excursion: p.f64("max_adverse_excursion"),
                },
            );
        }

        // Completed trades reload into the full history for stable stats
        let trade_rows = self
            .store
            .fetch_all(
                "SELECT * FROM candidate_trades WHERE candidate_slot = ?",
                &[json!(slot)],
            )
            .await?;
        let trades: Vec<CandidateTrade> = trade_rows
            .iter()
            .map(|t| CandidateTrade {
                symbol: t.str_or("symbol", ""),
                tag: t.str_or("tag", ""),
                qty: t.f64("qty"),
                entry_price: t.f64("entry_price"),
                exit_price: t.f64("exit_price"),
                pnl: t.f64("pnl"),
                pnl_pct: t.f64("pnl_pct"),
                fees: t.f64("fees"),
                intent: Intent::parse_lossy(&t.str_or("intent", "DAY")),
                close_reason: t.str_or("close_reason", "signal"),
                opened_at: t
                    .opt_str("opened_at")
                    .and_then(|s| parse_utc_lossy(&s))
                    .unwrap_or_else(Utc::now),
                closed_at: t
                    .opt_str("closed_at")
                    .and_then(|s| parse_utc_lossy(&s))
                    .unwrap_or_else(Utc::now),
                max_adverse_excursion: t.f64("max_adverse_excursion"),
            })
            .collect();

        // cash = initial - open position cost + realized pnl + fees offset
        // (trade pnl is net of fees; the sale credit kept the fees out of
        // cash, so add them back), clamped at zero against rounding drift
        let pos_cost: f64 = positions.values().map(|p| p.avg_entry * p.qty).sum();
        let trade_pnl: f64 = trades.iter().map(|t| t.pnl).sum();
        let trade_fees: f64 = trades.iter().map(|t| t.fees).sum();
        let cash = (initial_cash - pos_cost + trade_pnl + trade_fees).max(0.0);

        runner.restore(positions, trades, cash);
        runner.initialize_strategy(&self.config.symbols).await?;
        self.runners.insert(slot, runner);
        Ok(())
    }

    /// Create a candidate in `slot`, canceling any existing occupant. The
    /// fund snapshot is cloned, with position tags renamed under the slot
    /// prefix.
    #[allow(clippy::too_many_arguments)]
    pub async fn create_candidate(
        &mut self,
        slot: u32,
        code: &str,
        version: &str,
        description: &str,
        backtest_summary: &str,
        evaluation_duration_days: Option<i64>,
        snapshot_cash: f64,
        initial_positions: Vec<Position>,
    ) -> Result<()> {
        if self.runners.contains_key(&slot) {
            self.cancel_candidate(slot, "replaced by new candidate")
                .await?;
        }

        let check = validate_strategy_static(code);
        if !check.passed {
            bail!("candidate code failed validation: {:?}", check.errors);
        }
        let strategy = WorkerStrategy::from_code(code, &self.config.worker).await?;

        let snapshot = json!({
            "cash": snapshot_cash,
            "positions": initial_positions
                .iter()
                .map(|p| json!({
                    "symbol": p.symbol,
                    "tag": p.tag,
                    "qty": p.qty,
                    "avg_entry": p.avg_entry,
                    "entry_fee": p.entry_fee,
                }))
                .collect::<Vec<_>>(),
            "total_value": snapshot_cash
                + initial_positions.iter().map(Position::market_value).sum::<f64>(),
        });

        let mut runner = CandidateRunner::new(
            slot,
            Box::new(strategy),
            code.to_string(),
            version.to_string(),
            snapshot_cash,
            initial_positions,
            self.config.risk_limits(),
            self.config.default_slippage_factor,
            self.config.kraken.maker_fee_pct,
            self.config.kraken.taker_fee_pct,
        );
        runner.initialize_strategy(&self.config.symbols).await?;

        self.store
            .exec(
                "INSERT OR REPLACE INTO candidates \
                 (slot, strategy_version, code, code_hash, description, backtest_summary, \
                  portfolio_snapshot, evaluation_duration_days, status, created_at, resolved_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'running', ?, NULL)",
                &[
                    json!(slot),
                    json!(version),
                    json!(code),
                    json!(code_hash(code)),
                    json!(description),
                    json!(backtest_summary),
                    json!(snapshot.to_string()),
                    evaluation_duration_days
                        .map(|d| json!(d))
                        .unwrap_or(Value::Null),
                    json!(fmt_utc(Utc::now())),
                ],
            )
            .await?;

        // Seed candidate_positions with the cloned snapshot
        self.persist_positions(slot, &runner).await?;

        self.runners.insert(slot, runner);
        info!(slot, %version, eval_days = ?evaluation_duration_days, "candidate created");
        if let Some(notifier) = &self.notifier {
            notifier
                .candidate_created(slot, version, evaluation_duration_days)
                .await;
        }
        Ok(())
    }

    /// Cancel a running candidate. Its position/trade history stays in the
    /// store for post-mortem.
    pub async fn cancel_candidate(&mut self, slot: u32, reason: &str) -> Result<()> {
        self.runners.remove(&slot);
        self.scan_counts.remove(&slot);
        self.store
            .exec(
                "UPDATE candidates SET status = 'canceled', resolved_at = ? \
                 WHERE slot = ? AND status = 'running'",
                &[json!(fmt_utc(Utc::now())), json!(slot)],
            )
            .await?;
        info!(slot, %reason, "candidate canceled");
        if let Some(notifier) = &self.notifier {
            notifier.candidate_canceled(slot, reason).await;
        }
        Ok(())
    }

    /// Promote: return the winning code, mark the slot `promoted`, cancel
    /// every other running candidate, and clear all runners.
    pub async fn promote_candidate(&mut self, slot: u32) -> Result<String> {
        let code = match self.runners.get(&slot) {
            Some(runner) => runner.code().to_string(),
            None => {
                // Fallback: the stored row
                let row = self
                    .store
                    .fetch_one(
                        "SELECT code FROM candidates WHERE slot = ? AND status = 'running'",
                        &[json!(slot)],
                    )
                    .await?;
                row.and_then(|r| r.opt_str("code"))
                    .with_context(|| format!("no running candidate in slot {slot}"))?
            }
        };

        let now = fmt_utc(Utc::now());
        self.store
            .exec(
                "UPDATE candidates SET status = 'promoted', resolved_at = ? \
                 WHERE slot = ? AND status = 'running'",
                &[json!(now.clone()), json!(slot)],
            )
            .await?;
        self.store
            .exec(
                "UPDATE candidates SET status = 'canceled', resolved_at = ? \
                 WHERE slot != ? AND status = 'running'",
                &[json!(now), json!(slot)],
            )
            .await?;

        self.runners.clear();
        self.scan_counts.clear();
        info!(slot, "candidate promoted");
        Ok(code)
    }

    /// Run every candidate against the shared market snapshot. Per-slot
    /// errors are logged, never propagated.
    pub async fn run_scans(&mut self, markets: &HashMap<String, SymbolData>, ts: DateTime<Utc>) {
        let slots = self.active_slots();
        for slot in slots {
            let Some(runner) = self.runners.get_mut(&slot) else {
                continue;
            };
            let executed = runner.run_scan(markets, ts).await;
            if !executed.is_empty() {
                info!(slot, fills = executed.len(), "candidate scan complete");
                if let Some(notifier) = &self.notifier {
                    for summary in &executed {
                        notifier.candidate_trade_executed(slot, summary).await;
                    }
                }
            }

            let count = self.scan_counts.entry(slot).or_insert(0);
            *count += 1;
            if *count % 10 == 0 {
                let status = self.runners[&slot].status();
                info!(
                    slot,
                    scans = *count,
                    positions = status["position_count"].as_u64().unwrap_or(0),
                    value = status["total_value"].as_f64().unwrap_or(0.0),
                    "candidate heartbeat"
                );
            }
        }
    }

    pub async fn check_sl_tp(&mut self, prices: &HashMap<String, f64>) {
        let slots = self.active_slots();
        for slot in slots {
            let Some(runner) = self.runners.get_mut(&slot) else {
                continue;
            };
            let closed = runner.check_sl_tp(prices);
            if closed.is_empty() {
                continue;
            }
            if let Some(notifier) = &self.notifier {
                for trade in &closed {
                    notifier
                        .candidate_trade_executed(
                            slot,
                            &format!(
                                "{} {} pnl ${:+.4} ({})",
                                trade.close_reason, trade.symbol, trade.pnl, trade.tag
                            ),
                        )
                        .await;
                }
            }
        }
    }

    /// Flush runner state to the store for crash recovery: positions are
    /// deleted and reinserted per slot, new trades/signals appended, and a
    /// daily performance row upserted.
    pub async fn persist_state(&mut self) -> Result<()> {
        let slots = self.active_slots();
        for slot in slots {
            if let Err(e) = self.persist_slot(slot).await {
                error!(slot, error = %e, "candidate persist failed");
            }
        }
        Ok(())
    }

    async fn persist_slot(&mut self, slot: u32) -> Result<()> {
        let Some(runner) = self.runners.get_mut(&slot) else {
            return Ok(());
        };
        let version = runner.version.clone();
        let status = runner.status();
        let new_trades = runner.take_new_trades();
        let new_signals = runner.take_new_signals();

        self.store
            .exec(
                "DELETE FROM candidate_positions WHERE candidate_slot = ?",
                &[json!(slot)],
            )
            .await?;
        let runner = &self.runners[&slot];
        self.persist_positions(slot, runner).await?;

        for trade in &new_trades {
            self.store
                .exec(
                    "INSERT INTO candidate_trades \
                     (candidate_slot, symbol, side, qty, entry_price, exit_price, pnl, pnl_pct, \
                      fees, intent, strategy_version, tag, close_reason, opened_at, closed_at, \
                      max_adverse_excursion) \
                     VALUES (?, ?, 'long', ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                    &[
                        json!(slot),
                        json!(trade.symbol),
                        json!(trade.qty),
                        json!(trade.entry_price),
                        json!(trade.exit_price),
                        json!(trade.pnl),
                        json!(trade.pnl_pct),
                        json!(trade.fees),
                        json!(trade.intent.as_str()),
                        json!(version),
                        json!(trade.tag),
                        json!(trade.close_reason),
                        json!(fmt_utc(trade.opened_at)),
                        json!(fmt_utc(trade.closed_at)),
                        json!(trade.max_adverse_excursion),
                    ],
                )
                .await?;
        }

        for sig in &new_signals {
            self.store
                .exec(
                    "INSERT INTO candidate_signals \
                     (candidate_slot, symbol, action, size_pct, confidence, intent, reasoning, \
                      strategy_regime, acted_on, rejected_reason, tag) \
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                    &[
                        json!(slot),
                        json!(sig.symbol),
                        json!(sig.action),
                        json!(sig.size_pct),
                        json!(sig.confidence),
                        json!(sig.intent),
                        json!(sig.reasoning),
                        sig.strategy_regime
                            .as_ref()
                            .map(|r| json!(r))
                            .unwrap_or(Value::Null),
                        json!(sig.acted_on as i64),
                        sig.rejected_reason
                            .as_ref()
                            .map(|r| json!(r))
                            .unwrap_or(Value::Null),
                        sig.tag.as_ref().map(|t| json!(t)).unwrap_or(Value::Null),
                    ],
                )
                .await?;
        }

        let today = local_date_string(self.config.tz());
        self.store
            .exec(
                "INSERT OR REPLACE INTO candidate_daily_performance \
                 (candidate_slot, date, portfolio_value, cash, total_trades, wins, losses, \
                  gross_pnl, net_pnl, fees_total, win_rate, strategy_version) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?)",
                &[
                    json!(slot),
                    json!(today),
                    status["total_value"].clone(),
                    status["cash"].clone(),
                    status["trade_count"].clone(),
                    status["wins"].clone(),
                    status["losses"].clone(),
                    status["pnl"].clone(),
                    status["pnl"].clone(),
                    status["win_rate"].clone(),
                    json!(version),
                ],
            )
            .await?;
        Ok(())
    }

    async fn persist_positions(&self, slot: u32, runner: &CandidateRunner) -> Result<()> {
        for pos in runner.positions().values() {
            self.store
                .exec(
                    "INSERT INTO candidate_positions \
                     (candidate_slot, symbol, tag, side, qty, avg_entry, current_price, \
                      unrealized_pnl, entry_fee, stop_loss, take_profit, intent, \
                      strategy_version, max_adverse_excursion, opened_at, updated_at) \
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                    &[
                        json!(slot),
                        json!(pos.symbol),
                        json!(pos.tag),
                        json!(pos.side),
                        json!(pos.qty),
                        json!(pos.avg_entry),
                        json!(pos.current_price),
                        json!((pos.current_price - pos.avg_entry) * pos.qty),
                        json!(pos.entry_fee),
                        pos.stop_loss.map(|v| json!(v)).unwrap_or(Value::Null),
                        pos.take_profit.map(|v| json!(v)).unwrap_or(Value::Null),
                        json!(pos.intent.as_str()),
                        json!(runner.version),
                        json!(pos.max_adverse_excursion),
                        json!(fmt_utc(pos.opened_at)),
                        json!(fmt_utc(pos.updated_at)),
                    ],
                )
                .await?;
        }
        Ok(())
    }

    /// Per-slot status for the orchestrator's nightly context: one entry
    /// per configured slot, running or empty.
    pub async fn orchestrator_context(&self) -> Result<Vec<Value>> {
        let mut context = Vec::new();
        for slot in 1..=self.config.orchestrator.max_candidates {
            match self.runners.get(&slot) {
                Some(runner) => {
                    let mut status = runner.status();
                    if let Some(row) = self
                        .store
                        .fetch_one(
                            "SELECT created_at, evaluation_duration_days, description \
                             FROM candidates WHERE slot = ? AND status = 'running'",
                            &[json!(slot)],
                        )
                        .await?
                    {
                        if let Some(map) = status.as_object_mut() {
                            map.insert(
                                "created_at".to_string(),
                                row.get("created_at").cloned().unwrap_or(Value::Null),
                            );
                            map.insert(
                                "evaluation_duration_days".to_string(),
                                row.get("evaluation_duration_days")
                                    .cloned()
                                    .unwrap_or(Value::Null),
                            );
                            map.insert(
                                "description".to_string(),
                                row.get("description").cloned().unwrap_or(Value::Null),
                            );
                        }
                    }
                    context.push(status);
                }
                None => context.push(json!({"slot": slot, "status": "empty"})),
            }
        }
        Ok(context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_worker_config() -> Config {
        let mut config = Config::default();
        config.worker.command = vec![
            "sh".to_string(),
            "-c".to_string(),
            r#"while read -r line; do echo '{"ok":true,"result":[]}'; done"#.to_string(),
        ];
        config
    }

    #[tokio::test]
    async fn create_persist_recover_cycle() {
        let store = Store::connect_memory().await.unwrap();
        let config = fake_worker_config();
        let mut manager = CandidateManager::new(config.clone(), store.clone());

        manager
            .create_candidate(1, "x = 1\n", "v_test", "desc", "bt", Some(7), 500.0, Vec::new())
            .await
            .unwrap();
        assert_eq!(manager.active_slots(), vec![1]);
        manager.persist_state().await.unwrap();

        // Fresh manager recovers the running slot from the store
        let mut recovered = CandidateManager::new(config, store.clone());
        recovered.initialize().await.unwrap();
        assert_eq!(recovered.active_slots(), vec![1]);
        let runner = recovered.runner(1).unwrap();
        assert!((runner.cash() - 500.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn promote_cancels_all_other_slots() {
        let store = Store::connect_memory().await.unwrap();
        let config = fake_worker_config();
        let mut manager = CandidateManager::new(config, store.clone());
        manager
            .create_candidate(1, "a = 1\n", "v1", "", "", None, 100.0, Vec::new())
            .await
            .unwrap();
        manager
            .create_candidate(2, "b = 2\n", "v2", "", "", None, 100.0, Vec::new())
            .await
            .unwrap();

        let code = manager.promote_candidate(2).await.unwrap();
        assert_eq!(code, "b = 2\n");
        assert!(manager.active_slots().is_empty());

        let rows = store
            .fetch_all("SELECT slot, status FROM candidates ORDER BY slot", &[])
            .await
            .unwrap();
        assert_eq!(rows[0].str_or("status", ""), "canceled");
        assert_eq!(rows[1].str_or("status", ""), "promoted");
    }

    #[tokio::test]
    async fn cancel_keeps_history_rows() {
        let store = Store::connect_memory().await.unwrap();
        let config = fake_worker_config();
        let mut manager = CandidateManager::new(config, store.clone());
        manager
            .create_candidate(1, "a = 1\n", "v1", "", "", None, 100.0, Vec::new())
            .await
            .unwrap();
        manager.persist_state().await.unwrap();
        manager.cancel_candidate(1, "test").await.unwrap();

        let row = store
            .fetch_one("SELECT status, resolved_at FROM candidates WHERE slot = 1", &[])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.str_or("status", ""), "canceled");
        assert!(row.opt_str("resolved_at").is_some());
    }

    #[tokio::test]
    async fn context_lists_every_slot() {
        let store = Store::connect_memory().await.unwrap();
        let config = fake_worker_config();
        let mut manager = CandidateManager::new(config, store);
        manager
            .create_candidate(2, "a = 1\n", "v1", "testing", "", Some(5), 100.0, Vec::new())
            .await
            .unwrap();

        let context = manager.orchestrator_context().await.unwrap();
        assert_eq!(context.len(), 3);
        assert_eq!(context[0]["status"], json!("empty"));
        assert_eq!(context[1]["status"], json!("running"));
        assert_eq!(context[1]["evaluation_duration_days"], json!(5));
        assert_eq!(context[2]["status"], json!("empty"));
    }
}
