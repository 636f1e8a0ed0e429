//! Nightly orchestration cycle: gather context → analyze → decide →
//! execute through the code pipeline → observe → log → maintain.
//!
//! The cycle is mutually exclusive with itself (a second fire returns a
//! skip message immediately) and its failure handler is the one place
//! where errors are structurally caught, notified, and absorbed; one bad
//! cycle never stops the system.

use anyhow::Result;
use chrono::Utc;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{error, info, warn};

use crate::application::ai::AiClient;
use crate::application::analysis::loader::{AnalysisLoader, MARKET_ANALYSIS, TRADE_PERFORMANCE};
use crate::application::analysis::runner::run_analysis_module;
use crate::application::analysis::sandbox::validate_analysis_module;
use crate::application::analysis::truth::compute_truth_benchmarks;
use crate::application::backtest::{Backtester, BacktestResult, CandleData};
use crate::application::candidates::CandidateManager;
use crate::application::data::DataStore;
use crate::application::reporter::Reporter;
use crate::application::state::ScanState;
use crate::application::strategy::loader::code_hash;
use crate::application::strategy::{validate_strategy, StrategyLoader, WorkerStrategy};
use crate::application::trading::PortfolioTracker;
use crate::config::Config;
use crate::domain::market::Timeframe;
use crate::domain::time::{fmt_utc, local_date_string};
use crate::infrastructure::notification::Notifier;
use crate::infrastructure::persistence::{ReadOnlyStore, RowExt, Store};

use super::decision::{extract_json, Decision, DecisionKind, PositionHandling};
use super::prompts;

/// Everything the analysis call sees, gathered up front.
struct CycleContext {
    ground_truth: Value,
    market_report: Value,
    perf_report: Value,
    market_code: String,
    perf_code: String,
    strategy_code: String,
    performance_7d: Value,
    daily_performance: Vec<Value>,
    recent_trades: Vec<Value>,
    version_history: Vec<Value>,
    token_usage: Value,
    candidates: Vec<Value>,
    observations: Vec<Value>,
    signal_drought: Value,
}

pub struct Orchestrator {
    config: Config,
    store: Store,
    ai: Arc<AiClient>,
    reporter: Reporter,
    data_store: Arc<DataStore>,
    notifier: Arc<Notifier>,
    candidates: Arc<Mutex<CandidateManager>>,
    strategy_loader: Arc<StrategyLoader>,
    analysis_loader: AnalysisLoader,
    portfolio: Arc<RwLock<PortfolioTracker>>,
    scan_state: Arc<RwLock<ScanState>>,
    cycle_lock: Mutex<()>,
    cycle_id: std::sync::Mutex<String>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        store: Store,
        ai: Arc<AiClient>,
        data_store: Arc<DataStore>,
        notifier: Arc<Notifier>,
        candidates: Arc<Mutex<CandidateManager>>,
        strategy_loader: Arc<StrategyLoader>,
        portfolio: Arc<RwLock<PortfolioTracker>>,
        scan_state: Arc<RwLock<ScanState>>,
    ) -> Self {
        let analysis_loader = AnalysisLoader::new(config.worker.analysis_dir.clone());
        Self {
            reporter: Reporter::new(store.clone()),
            config,
            store,
            ai,
            data_store,
            notifier,
            candidates,
            strategy_loader,
            analysis_loader,
            portfolio,
            scan_state,
            cycle_lock: Mutex::new(()),
            cycle_id: std::sync::Mutex::new(String::new()),
        }
    }

    /// Entry point for the scheduler. Mutually exclusive with itself;
    /// failures are absorbed here.
    pub async fn run_nightly_cycle(&self) -> String {
        let Ok(_guard) = self.cycle_lock.try_lock() else {
            warn!("orchestrator cycle already in progress");
            return "Orchestrator: skipped, cycle already in progress.".to_string();
        };

        let cycle_id = Utc::now().format("%Y%m%d_%H%M%S").to_string();
        *self.cycle_id.lock().expect("cycle id lock") = cycle_id.clone();
        info!(%cycle_id, "orchestrator cycle start");
        self.notifier.orchestrator_cycle_started().await;

        match self.run_cycle_inner().await {
            Ok(report) => report,
            Err(e) => {
                error!(error = %e, "orchestrator cycle failed");
                self.notifier
                    .system_error(&format!("Orchestrator cycle failed: {e:#}"))
                    .await;
                format!("Orchestrator: cycle failed ({e:#})")
            }
        }
    }

    async fn run_cycle_inner(&self) -> Result<String> {
        // Token budget gate
        let remaining = self.ai.tokens_remaining();
        if remaining < self.config.orchestrator.min_token_budget {
            warn!(remaining, "orchestrator skipped: insufficient token budget");
            self.notifier
                .orchestrator_cycle_completed("SKIPPED_BUDGET")
                .await;
            return Ok("Orchestrator: skipped, insufficient token budget remaining.".to_string());
        }

        let context = self.gather_context().await;
        let decision = self.analyze(&context).await?;

        let mut deployed_version = None;
        let report = match decision.kind {
            DecisionKind::NoChange => {
                format!("Orchestrator: No changes. {}", decision.reasoning)
            }
            DecisionKind::MarketAnalysisUpdate | DecisionKind::TradeAnalysisUpdate => {
                self.execute_analysis_change(&decision, &context).await?
            }
            DecisionKind::CreateCandidate => self.create_candidate(&decision, &context).await?,
            DecisionKind::CancelCandidate => self.cancel_candidate(&decision).await?,
            DecisionKind::PromoteCandidate => {
                let (report, version) = self.promote_candidate(&decision).await?;
                deployed_version = version;
                report
            }
            DecisionKind::Unknown => {
                warn!(decision = %decision.raw_kind, "unknown decision type");
                format!(
                    "Orchestrator: Unknown decision '{}', treated as NO_CHANGE.",
                    decision.raw_kind
                )
            }
        };

        self.store_observation(&decision).await;
        self.log_orchestration(&decision, deployed_version.as_deref())
            .await?;
        if let Err(e) = self.data_store.run_nightly_maintenance().await {
            warn!(error = %e, "data maintenance failed");
        }

        info!(decision = decision.kind.as_str(), "orchestrator cycle complete");
        self.notifier
            .orchestrator_cycle_completed(decision.kind.as_str())
            .await;
        Ok(report)
    }

    // --- Context gathering -------------------------------------------------

    async fn gather_context(&self) -> CycleContext {
        let ground_truth = match compute_truth_benchmarks(&self.store).await {
            Ok(truth) => truth,
            Err(e) => {
                error!(error = %e, "truth benchmarks failed");
                json!({"error": e.to_string()})
            }
        };

        let market_report = self.run_analysis(MARKET_ANALYSIS).await;
        let perf_report = self.run_analysis(TRADE_PERFORMANCE).await;
        let market_code = self
            .analysis_loader
            .module_code(MARKET_ANALYSIS)
            .unwrap_or_else(|| "No module".to_string());
        let perf_code = self
            .analysis_loader
            .module_code(TRADE_PERFORMANCE)
            .unwrap_or_else(|| "No module".to_string());
        let strategy_code = self
            .strategy_loader
            .active_code()
            .unwrap_or_else(|| "No strategy file".to_string());

        let performance_7d = self
            .reporter
            .strategy_performance(None, 7)
            .await
            .unwrap_or_else(|e| {
                warn!(error = %e, "performance context failed");
                json!({})
            });
        let daily_performance = self
            .fetch_values("SELECT * FROM daily_performance ORDER BY date DESC LIMIT 7")
            .await;
        let recent_trades = self
            .fetch_values(
                "SELECT symbol, side, pnl, pnl_pct, fees, intent, strategy_regime, close_reason, \
                 closed_at FROM trades WHERE closed_at IS NOT NULL ORDER BY closed_at DESC LIMIT 50",
            )
            .await;
        let version_history = self
            .fetch_values(
                "SELECT version, description, backtest_result, market_conditions \
                 FROM strategy_versions ORDER BY created_at DESC LIMIT 10",
            )
            .await;

        let token_usage = self.ai.daily_usage().await.unwrap_or_else(|e| {
            warn!(error = %e, "usage context failed");
            json!({"models": {}, "total_cost": 0, "daily_limit": 0, "used": 0})
        });

        let candidates = match self.candidates.lock().await.orchestrator_context().await {
            Ok(context) => context,
            Err(e) => {
                warn!(error = %e, "candidate context failed");
                Vec::new()
            }
        };

        let observations = self
            .fetch_values(
                "SELECT date, market_summary, strategy_assessment, notable_findings \
                 FROM orchestrator_observations WHERE date >= date('now', '-14 days') \
                 ORDER BY date DESC",
            )
            .await;

        let signal_drought = self.drought_info().await;

        CycleContext {
            ground_truth,
            market_report,
            perf_report,
            market_code,
            perf_code,
            strategy_code,
            performance_7d,
            daily_performance,
            recent_trades,
            version_history,
            token_usage,
            candidates,
            observations,
            signal_drought,
        }
    }

    async fn fetch_values(&self, sql: &str) -> Vec<Value> {
        match self.store.fetch_all(sql, &[]).await {
            Ok(rows) => rows.into_iter().map(Value::Object).collect(),
            Err(e) => {
                warn!(error = %e, sql, "context query failed");
                Vec::new()
            }
        }
    }

    /// Run one analysis module under its 30-second timeout. A missing or
    /// broken module produces an error stub, never a cycle abort.
    async fn run_analysis(&self, name: &str) -> Value {
        let path = self.analysis_loader.module_path(name);
        if !path.exists() {
            return json!({"error": format!("{name} module not deployed")});
        }
        let ro = ReadOnlyStore::new(self.store.clone());
        match run_analysis_module(&path, &self.config.worker, &ro, Duration::from_secs(30)).await {
            Ok(report) => report,
            Err(e) => {
                error!(module = name, error = %e, "analysis module failed");
                json!({"error": e.to_string()})
            }
        }
    }

    async fn drought_info(&self) -> Value {
        let mut out = Map::new();
        let queries = [
            (
                "last_signal_at",
                "SELECT created_at as v FROM signals ORDER BY created_at DESC LIMIT 1",
            ),
            (
                "signals_last_7d",
                "SELECT COUNT(*) as v FROM signals WHERE created_at >= datetime('now', '-7 days')",
            ),
            (
                "signals_last_30d",
                "SELECT COUNT(*) as v FROM signals WHERE created_at >= datetime('now', '-30 days')",
            ),
            (
                "scans_last_24h",
                "SELECT COUNT(*) as v FROM scan_results WHERE created_at >= datetime('now', '-1 day')",
            ),
        ];
        for (key, sql) in queries {
            let value = self
                .store
                .fetch_one(sql, &[])
                .await
                .ok()
                .flatten()
                .and_then(|r| r.get("v").cloned())
                .unwrap_or(Value::Null);
            out.insert(key.to_string(), value);
        }
        Value::Object(out)
    }

    // --- Analysis call -----------------------------------------------------

    async fn analyze(&self, context: &CycleContext) -> Result<Decision> {
        let risk = &self.config.risk;
        let prompt = format!(
            "Current fund state for nightly review.\n\n---\n\n\
             ## GROUND TRUTH (rigid shell, you cannot change this)\n{}\n\n---\n\n\
             ## YOUR MARKET ANALYSIS (you designed this module, you can rewrite it)\n\
             ### Module Output:\n{}\n\n### Module Source Code:\n```python\n{}\n```\n\n---\n\n\
             ## YOUR TRADE PERFORMANCE ANALYSIS (you designed this module, you can rewrite it)\n\
             ### Module Output:\n{}\n\n### Module Source Code:\n```python\n{}\n```\n\n---\n\n\
             ## YOUR STRATEGY (you designed this, you can rewrite it)\n\
             ### Strategy Source Code:\n```python\n{}\n```\n\n\
             ### Performance (Last 7 Days):\n{}\n\n\
             ### Daily Performance Snapshots:\n{}\n\n\
             ### Recent Trades (Last 50):\n{}\n\n\
             ### Strategy Version History:\n{}\n\n---\n\n\
             ## SYSTEM CONSTRAINTS (you cannot change these)\n\
             - Trading pairs: {}\n\
             - System: Long-only (no short selling, no leverage)\n\
             - Maker fee: {}% / Taker fee: {}%\n\
             - Default slippage: {:.2}% (signals can override per-trade)\n\
             - Max trade size: {:.0}% of portfolio\n\
             - Default trade size: {:.0}% of portfolio\n\
             - Max position size: {:.0}% of portfolio\n\
             - Max positions: {}\n\
             - Max daily loss: {:.0}% of portfolio (trading halts)\n\
             - Max drawdown: {:.0}% from peak (system halts)\n\
             - Consecutive loss halt: {} consecutive losses (persists across days)\n\
             - Max candidate slots: {}\n\
             - Token budget: {} / {} tokens used today\n\n---\n\n\
             ## CANDIDATE STRATEGIES\n{}\n\n---\n\n\
             ## SIGNAL & OBSERVATION STATE\n\
             ### Signal Drought Detection:\n{}\n\n\
             ### Recent Observations (last 14 days):\n{}\n\n---\n\n\
             Respond in JSON format.",
            pretty(&context.ground_truth),
            pretty(&context.market_report),
            context.market_code,
            pretty(&context.perf_report),
            context.perf_code,
            context.strategy_code,
            pretty(&context.performance_7d),
            pretty(&Value::Array(context.daily_performance.clone())),
            pretty(&Value::Array(context.recent_trades.clone())),
            pretty(&Value::Array(context.version_history.clone())),
            self.config.symbols.join(", "),
            self.config.kraken.maker_fee_pct,
            self.config.kraken.taker_fee_pct,
            self.config.default_slippage_factor * 100.0,
            risk.max_trade_pct * 100.0,
            risk.default_trade_pct * 100.0,
            risk.max_position_pct * 100.0,
            risk.max_positions,
            risk.max_daily_loss_pct * 100.0,
            risk.max_drawdown_pct * 100.0,
            risk.rollback_consecutive_losses,
            self.config.orchestrator.max_candidates,
            context.token_usage.get("used").cloned().unwrap_or(json!(0)),
            context
                .token_usage
                .get("daily_limit")
                .cloned()
                .unwrap_or(json!(0)),
            if context.candidates.is_empty() {
                "No active candidates. All slots available.".to_string()
            } else {
                pretty(&Value::Array(context.candidates.clone()))
            },
            pretty(&context.signal_drought),
            if context.observations.is_empty() {
                "No prior observations.".to_string()
            } else {
                pretty(&Value::Array(context.observations.clone()))
            },
        );

        let system = format!(
            "{}\n\n---\n\n{}\n\n---\n\n{}",
            prompts::LAYER_1_IDENTITY,
            prompts::FUND_MANDATE,
            prompts::layer_2_system(self.config.orchestrator.max_candidates)
        );

        let response = match self
            .ai
            .ask_opus(&prompt, &system, 4096, "nightly_analysis")
            .await
        {
            Ok(response) => response,
            Err(e) => {
                // LLM failure degrades to NO_CHANGE, never a crash
                warn!(error = %e, "analysis call failed; defaulting to NO_CHANGE");
                return Ok(Decision::no_change("Analysis call failed"));
            }
        };

        let decision = match extract_json(&response) {
            Some(parsed) => Decision::from_value(parsed),
            None => {
                warn!("analysis response did not parse; defaulting to NO_CHANGE");
                Decision::no_change("Failed to parse analysis response")
            }
        };
        self.store_thought("analysis", "opus", &prompt, &response, Some(&decision.parsed))
            .await;
        Ok(decision)
    }

    // --- Analysis module pipeline ------------------------------------------

    /// Single-loop pipeline: generate → review (math focus) → sandbox →
    /// deploy immediately. Read-only modules skip paper testing.
    async fn execute_analysis_change(
        &self,
        decision: &Decision,
        context: &CycleContext,
    ) -> Result<String> {
        let module_name = if decision.kind == DecisionKind::MarketAnalysisUpdate {
            MARKET_ANALYSIS
        } else {
            TRADE_PERFORMANCE
        };
        let current_code = if module_name == MARKET_ANALYSIS {
            &context.market_code
        } else {
            &context.perf_code
        };
        let mut changes = decision.specific_changes.clone();
        let schema = ReadOnlyStore::new(self.store.clone()).schema();

        for attempt in 1..=self.config.orchestrator.max_revisions {
            let gen_prompt = format!(
                "Generate a new {} module based on these requirements:\n\n\
                 ## Change Request\n{changes}\n\n\
                 ## Current Module Code (for reference)\n```python\n{current_code}\n```\n\n\
                 ## Available Store Schema\n{}\n\n\
                 ## Ground Truth Benchmarks (for context on what data exists)\n{}\n\n\
                 Generate the complete {module_name}.py file.",
                module_name.replace('_', " "),
                pretty(&schema),
                pretty(&context.ground_truth),
            );
            let code = match self
                .ai
                .ask_sonnet(
                    &gen_prompt,
                    prompts::ANALYSIS_CODE_GEN_SYSTEM,
                    8192,
                    &format!("analysis_gen_{module_name}_attempt_{attempt}"),
                )
                .await
            {
                Ok(code) => code,
                Err(e) => return Ok(format!("Analysis update aborted: {e}")),
            };
            self.store_thought(
                &format!("analysis_gen_{module_name}_{attempt}"),
                "sonnet",
                &gen_prompt,
                &code,
                None,
            )
            .await;
            let code = strip_code_fences(&code);

            let sandbox = validate_analysis_module(&code, module_name, &self.config.worker).await;
            if !sandbox.passed {
                warn!(
                    module = module_name,
                    attempt,
                    errors = ?sandbox.errors,
                    "analysis sandbox failed"
                );
                changes.push_str(&format!(
                    "\n\nPrevious attempt failed sandbox: {:?}. Fix these issues.",
                    sandbox.errors
                ));
                continue;
            }

            let review_prompt = format!(
                "Review this {} module for mathematical correctness and safety:\n\n\
                 ```python\n{code}\n```\n\n\
                 The orchestrator wants to change this module because: {changes}",
                module_name.replace('_', " "),
            );
            let review_response = match self
                .ai
                .ask_opus(
                    &review_prompt,
                    prompts::ANALYSIS_REVIEW_SYSTEM,
                    4096,
                    &format!("analysis_review_{module_name}_attempt_{attempt}"),
                )
                .await
            {
                Ok(response) => response,
                Err(e) => return Ok(format!("Analysis update aborted: {e}")),
            };
            let review = extract_json(&review_response)
                .unwrap_or_else(|| json!({"approved": false, "feedback": "Failed to parse review"}));
            self.store_thought(
                &format!("analysis_review_{module_name}_{attempt}"),
                "opus",
                &review_prompt,
                &review_response,
                Some(&review),
            )
            .await;

            if review.get("approved").and_then(Value::as_bool) == Some(true) {
                let version = format!("v{}", Utc::now().format("%Y%m%d_%H%M%S"));
                let hash = self.analysis_loader.deploy(module_name, &code, &version)?;
                info!(module = module_name, %version, %hash, "analysis module deployed");
                return Ok(format!(
                    "Analysis module '{module_name}' updated ({version}).\nChanges: {changes}"
                ));
            }
            let feedback = review
                .get("feedback")
                .and_then(Value::as_str)
                .unwrap_or("No feedback");
            let issues = review.get("math_errors").cloned().unwrap_or(json!([]));
            warn!(module = module_name, attempt, feedback, "analysis review rejected");
            changes.push_str(&format!(
                "\n\nReview feedback: {feedback}\nMath errors: {issues}"
            ));
        }

        Ok(format!(
            "Analysis module '{module_name}' update aborted after {} failed attempts.",
            self.config.orchestrator.max_revisions
        ))
    }

    // --- Candidate strategy pipeline ---------------------------------------

    /// Nested loops: the outer one drives strategic direction from the
    /// backtest reviews, the inner one drives code quality through sandbox
    /// and code review.
    async fn create_candidate(&self, decision: &Decision, context: &CycleContext) -> Result<String> {
        let Some(slot) = self.pick_slot(decision).await else {
            return Ok(
                "Cannot create candidate: all slots full and no replace_slot specified.".to_string(),
            );
        };

        let original_changes = decision.specific_changes.clone();
        let mut changes = original_changes.clone();
        let max_inner = self.config.orchestrator.max_revisions;
        let max_outer = self.config.orchestrator.max_strategy_iterations;

        let system_constraints = format!(
            "## System Constraints\n\
             - Trading pairs: {}\n\
             - Long-only (no short selling, no leverage)\n\
             - Maker fee: {}% / Taker fee: {}%\n\
             - Default slippage: {:.2}%\n\
             - Max trade size: {:.0}% of portfolio\n\
             - Default trade size: {:.0}% of portfolio\n\
             - Max positions: {}\n\
             - Max position per symbol: {:.0}% of portfolio\n\
             - Market entries include per-pair maker_fee_pct and taker_fee_pct\n\
             - Signals support an optional slippage_tolerance override (float)",
            self.config.symbols.join(", "),
            self.config.kraken.maker_fee_pct,
            self.config.kraken.taker_fee_pct,
            self.config.default_slippage_factor * 100.0,
            self.config.risk.max_trade_pct * 100.0,
            self.config.risk.default_trade_pct * 100.0,
            self.config.risk.max_positions,
            self.config.risk.max_position_pct * 100.0,
        );

        let mut attempt_history: Vec<Value> = Vec::new();

        for outer in 1..=max_outer {
            let mut inner_changes = changes.clone();
            let mut approved: Option<(String, String)> = None; // (code, diff)

            for inner in 1..=max_inner {
                let gen_prompt = format!(
                    "Generate a new trading strategy based on these requirements:\n\n\
                     ## Change Request\n{inner_changes}\n\n\
                     ## Current Strategy (for reference)\n```python\n{}\n```\n\n\
                     ## Performance Context\n{}\n\n\
                     {system_constraints}\n\n\
                     Generate the complete strategy worker file.",
                    context.strategy_code,
                    pretty(&context.performance_7d),
                );
                let code = match self
                    .ai
                    .ask_sonnet(
                        &gen_prompt,
                        prompts::CODE_GEN_SYSTEM,
                        8192,
                        &format!("candidate_gen_outer{outer}_inner{inner}"),
                    )
                    .await
                {
                    Ok(code) => code,
                    Err(e) => return Ok(format!("Candidate creation aborted: {e}")),
                };
                self.store_thought(
                    &format!("candidate_gen_o{outer}_i{inner}"),
                    "sonnet",
                    &gen_prompt,
                    &code,
                    None,
                )
                .await;
                let code = strip_code_fences(&code);

                let sandbox = validate_strategy(&code, &self.config.worker).await;
                if !sandbox.passed {
                    warn!(outer, inner, errors = ?sandbox.errors, "candidate sandbox failed");
                    inner_changes.push_str(&format!(
                        "\n\nPrevious attempt failed sandbox: {:?}. Fix these issues.",
                        sandbox.errors
                    ));
                    continue;
                }

                let diff = summarize_diff(&context.strategy_code, &code);
                let review_prompt = format!(
                    "Review this trading strategy code for correctness and safety.\n\n\
                     ## Changes from current strategy\n```diff\n{diff}\n```\n\n\
                     ## Full proposed code\n```python\n{code}\n```\n\n\
                     This is a candidate strategy that will run in paper simulation alongside \
                     the active strategy.\n\n{}",
                    pretty(&decision.parsed),
                );
                let review_response = match self
                    .ai
                    .ask_opus(
                        &review_prompt,
                        prompts::CODE_REVIEW_SYSTEM,
                        4096,
                        &format!("candidate_review_outer{outer}_inner{inner}"),
                    )
                    .await
                {
                    Ok(response) => response,
                    Err(e) => return Ok(format!("Candidate creation aborted: {e}")),
                };
                let review = extract_json(&review_response).unwrap_or_else(
                    || json!({"approved": false, "feedback": "Failed to parse review"}),
                );
                self.store_thought(
                    &format!("candidate_review_o{outer}_i{inner}"),
                    "opus",
                    &review_prompt,
                    &review_response,
                    Some(&review),
                )
                .await;

                if review.get("approved").and_then(Value::as_bool) == Some(true) {
                    approved = Some((code, diff));
                    break;
                }
                let feedback = review
                    .get("feedback")
                    .and_then(Value::as_str)
                    .unwrap_or("No feedback");
                let issues = review.get("issues").cloned().unwrap_or(json!([]));
                warn!(outer, inner, feedback, "candidate review rejected");
                inner_changes
                    .push_str(&format!("\n\nCode review feedback: {feedback}\nIssues: {issues}"));
            }

            let Some((approved_code, diff)) = approved else {
                warn!(outer, "candidate code quality exhausted");
                return Ok(format!(
                    "Candidate creation aborted: code quality failed after {max_inner} attempts."
                ));
            };

            // Backtest stage
            let (passed, summary, result) = self.run_backtest(&approved_code).await;
            if !passed {
                attempt_history.push(json!({
                    "attempt": outer, "outcome": "backtest_crash", "summary": summary,
                }));
                changes = format!(
                    "Original goal: {original_changes}\n\nPrevious attempt crashed during \
                     backtest: {summary}. Try a different approach."
                );
                continue;
            }

            let bt_review = self
                .review_backtest(result.as_ref(), &summary, decision, &diff, &attempt_history)
                .await;
            if bt_review.get("deploy").and_then(Value::as_bool) == Some(true) {
                let version = format!("v{}_candidate", Utc::now().format("%Y%m%d_%H%M%S"));
                let (snapshot_cash, initial_positions) = {
                    let portfolio = self.portfolio.read().await;
                    (portfolio.cash(), portfolio.positions().values().cloned().collect())
                };
                self.candidates
                    .lock()
                    .await
                    .create_candidate(
                        slot,
                        &approved_code,
                        &version,
                        &truncate(&changes, 500),
                        &truncate(&summary, 2000),
                        decision.evaluation_duration_days,
                        snapshot_cash,
                        initial_positions,
                    )
                    .await?;

                // Candidate-only version record: no deployed_at
                self.store
                    .exec(
                        "INSERT INTO strategy_versions \
                         (version, code_hash, description, backtest_result, market_conditions, code) \
                         VALUES (?, ?, ?, ?, ?, ?)",
                        &[
                            json!(version),
                            json!(code_hash(&approved_code)),
                            json!(format!("Candidate slot {slot}: {}", truncate(&changes, 200))),
                            json!(summary),
                            json!(decision.market_observations),
                            json!(approved_code),
                        ],
                    )
                    .await?;

                let eval = decision
                    .evaluation_duration_days
                    .map(|d| format!("{d}d"))
                    .unwrap_or_else(|| "indefinite".to_string());
                return Ok(format!(
                    "Candidate deployed to slot {slot} as {version} (evaluation: {eval})."
                ));
            }

            let reasoning = bt_review
                .get("reasoning")
                .and_then(Value::as_str)
                .unwrap_or("No reasoning")
                .to_string();
            let revision = bt_review
                .get("revision_instructions")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string();
            attempt_history.push(json!({
                "attempt": outer, "outcome": "rejected",
                "backtest_summary": summary, "reasoning": reasoning,
            }));
            changes = if revision.is_empty() {
                format!(
                    "{original_changes}\n\nPrevious backtest rejected: {reasoning}. \
                     Try a different approach."
                )
            } else {
                format!(
                    "Original goal: {original_changes}\n\nRevision from fund manager \
                     (attempt {outer}): {revision}"
                )
            };
        }

        Ok(format!(
            "Candidate creation aborted after {max_outer} strategy iterations."
        ))
    }

    /// Spawn the candidate code in a worker (10s import timeout), replay it
    /// through the backtester (60s timeout). Passing means "did not crash";
    /// the deploy judgment is a separate review.
    async fn run_backtest(&self, code: &str) -> (bool, String, Option<BacktestResult>) {
        let spawn = tokio::time::timeout(
            Duration::from_secs(10),
            WorkerStrategy::from_code(code, &self.config.worker),
        )
        .await;
        let mut strategy = match spawn {
            Err(_) => {
                return (
                    false,
                    "Strategy worker startup timed out (>10s)".to_string(),
                    None,
                )
            }
            Ok(Err(e)) => return (false, format!("Strategy failed to start: {e:#}"), None),
            Ok(Ok(strategy)) => strategy,
        };

        let mut candle_data = HashMap::new();
        for symbol in &self.config.symbols {
            let m5 = self
                .data_store
                .get_candles(symbol, Timeframe::M5, Some(8640))
                .await
                .unwrap_or_default();
            let h1 = self
                .data_store
                .get_candles(symbol, Timeframe::H1, Some(8760))
                .await
                .unwrap_or_default();
            let d1 = self
                .data_store
                .get_candles(symbol, Timeframe::D1, Some(2555))
                .await
                .unwrap_or_default();
            if !h1.is_empty() {
                candle_data.insert(symbol.clone(), (m5, h1, d1));
            }
        }
        if candle_data.is_empty() {
            info!("backtest skipped: no historical data yet");
            strategy.stop().await;
            return (true, "Skipped (no historical data yet)".to_string(), None);
        }

        let per_pair_fees = self.per_pair_fees().await;
        let mut backtester = Backtester::new(
            &mut strategy,
            self.config.risk_limits(),
            self.config.symbols.clone(),
            self.config.kraken.maker_fee_pct,
            self.config.kraken.taker_fee_pct,
            self.config.paper_balance_usd,
            per_pair_fees,
            self.config.default_slippage_factor,
        );

        let outcome = tokio::time::timeout(
            Duration::from_secs(60),
            backtester.run(&CandleData::Multi(candle_data)),
        )
        .await;
        drop(backtester);
        strategy.stop().await;

        match outcome {
            Err(_) => (
                false,
                "Strategy backtest timed out (>60s), possible infinite loop".to_string(),
                None,
            ),
            Ok(Err(e)) => (false, format!("Strategy crashed during backtest: {e:#}"), None),
            Ok(Ok(result)) => {
                info!(summary = %result.summary(), "backtest complete");
                (true, result.detailed_summary(), Some(result))
            }
        }
    }

    async fn per_pair_fees(&self) -> HashMap<String, (f64, f64)> {
        let mut fees = HashMap::new();
        if let Ok(rows) = self
            .store
            .fetch_all(
                "SELECT symbol, maker_fee_pct, taker_fee_pct FROM fee_schedule \
                 WHERE symbol IS NOT NULL",
                &[],
            )
            .await
        {
            for row in rows {
                if let Some(symbol) = row.opt_str("symbol") {
                    fees.insert(symbol, (row.f64("maker_fee_pct"), row.f64("taker_fee_pct")));
                }
            }
        }
        fees
    }

    async fn review_backtest(
        &self,
        result: Option<&BacktestResult>,
        summary: &str,
        decision: &Decision,
        diff: &str,
        attempt_history: &[Value],
    ) -> Value {
        if result.is_none() {
            // No data to judge; forward-test in a candidate slot instead
            return json!({
                "deploy": true,
                "reasoning": "No historical data available, deploying to candidate slot for live evaluation.",
                "concerns": ["No backtest data to evaluate"],
                "revision_instructions": "",
            });
        }

        let history_text = if attempt_history.is_empty() {
            "This is the first attempt.".to_string()
        } else {
            attempt_history
                .iter()
                .map(|h| {
                    format!(
                        "- Attempt {}: {} ({})",
                        h.get("attempt").cloned().unwrap_or(json!("?")),
                        h.get("outcome").and_then(Value::as_str).unwrap_or("?"),
                        h.get("reasoning")
                            .or_else(|| h.get("summary"))
                            .and_then(Value::as_str)
                            .unwrap_or("")
                    )
                })
                .collect::<Vec<_>>()
                .join("\n")
        };

        let review_prompt = format!(
            "Review these backtest results and decide whether to deploy the strategy to a \
             candidate slot.\n\n\
             ## Backtest Results\n{summary}\n\n\
             ## Strategy Change Context\n{}\n\n\
             ## Code Diff\n```diff\n{diff}\n```\n\n\
             ## Previous Attempts\n{history_text}",
            pretty(&json!({
                "decision": decision.raw_kind,
                "reasoning": decision.reasoning,
                "specific_changes": decision.specific_changes,
            })),
        );

        let response = match self
            .ai
            .ask_opus(&review_prompt, prompts::BACKTEST_REVIEW_SYSTEM, 4096, "backtest_review")
            .await
        {
            Ok(response) => response,
            Err(e) => {
                return json!({
                    "deploy": false,
                    "reasoning": format!("Backtest review call failed: {e}"),
                    "concerns": [],
                    "revision_instructions": "",
                })
            }
        };
        let parsed = extract_json(&response).unwrap_or_else(|| {
            json!({
                "deploy": false,
                "reasoning": "Failed to parse backtest review response",
                "concerns": [],
                "revision_instructions": "",
            })
        });
        self.store_thought("backtest_review", "opus", &review_prompt, &response, Some(&parsed))
            .await;
        parsed
    }

    // --- Candidate lifecycle decisions -------------------------------------

    async fn cancel_candidate(&self, decision: &Decision) -> Result<String> {
        let Some(slot) = decision.slot else {
            return Ok("Cannot cancel: no slot specified.".to_string());
        };
        let mut manager = self.candidates.lock().await;
        if !manager.active_slots().contains(&slot) {
            return Ok(format!("Cannot cancel: slot {slot} has no running candidate."));
        }
        manager.cancel_candidate(slot, &decision.reasoning).await?;
        Ok(format!("Candidate in slot {slot} canceled."))
    }

    async fn promote_candidate(&self, decision: &Decision) -> Result<(String, Option<String>)> {
        let Some(slot) = decision.slot else {
            return Ok(("Cannot promote: no slot specified.".to_string(), None));
        };
        {
            let manager = self.candidates.lock().await;
            if !manager.active_slots().contains(&slot) {
                return Ok((
                    format!("Cannot promote: slot {slot} has no running candidate."),
                    None,
                ));
            }
        }

        if decision.position_handling == PositionHandling::CloseAll {
            self.close_all_fund_positions().await;
        }

        let code = self.candidates.lock().await.promote_candidate(slot).await?;
        let version = format!("v{}_promoted", Utc::now().format("%Y%m%d_%H%M%S"));
        let hash = self.strategy_loader.deploy(&code, &version)?;

        // Retire the previous active version, then record the new one;
        // exactly one row stays deployed-and-unretired
        let now = fmt_utc(Utc::now());
        self.store
            .exec(
                "UPDATE strategy_versions SET retired_at = ? \
                 WHERE deployed_at IS NOT NULL AND retired_at IS NULL",
                &[json!(now.clone())],
            )
            .await?;
        self.store
            .exec(
                "INSERT OR REPLACE INTO strategy_versions \
                 (version, code_hash, description, deployed_at, code) \
                 VALUES (?, ?, ?, ?, ?)",
                &[
                    json!(version),
                    json!(hash),
                    json!(format!("Promoted from candidate slot {slot}")),
                    json!(now),
                    json!(code),
                ],
            )
            .await?;

        // The scan loop hot-reloads before its next analyze call
        self.scan_state.write().await.strategy_reload_needed = true;

        self.notifier.candidate_promoted(slot, &version).await;
        self.notifier
            .strategy_deployed(&version, &format!("Promoted from slot {slot}"))
            .await;

        let handling = match decision.position_handling {
            PositionHandling::Keep => "keep",
            PositionHandling::CloseAll => "close_all",
        };
        Ok((
            format!(
                "Candidate from slot {slot} promoted as {version}. Position handling: {handling}."
            ),
            Some(version),
        ))
    }

    async fn close_all_fund_positions(&self) {
        let mut portfolio = self.portfolio.write().await;
        let targets: Vec<(String, f64, f64)> = portfolio
            .positions()
            .values()
            .map(|p| (p.tag.clone(), p.qty, p.current_price.max(p.avg_entry)))
            .collect();
        for (tag, qty, price) in targets {
            let fill = price * (1.0 - self.config.default_slippage_factor);
            if let Err(e) = portfolio
                .close_qty(
                    &tag,
                    qty,
                    fill,
                    self.config.kraken.taker_fee_pct,
                    crate::domain::contract::Action::Close,
                    "signal",
                    None,
                )
                .await
            {
                error!(%tag, error = %e, "close-all failed for position");
            }
        }
    }

    async fn pick_slot(&self, decision: &Decision) -> Option<u32> {
        let manager = self.candidates.lock().await;
        let active = manager.active_slots();
        for slot in 1..=self.config.orchestrator.max_candidates {
            if !active.contains(&slot) {
                return Some(slot);
            }
        }
        decision
            .replace_slot
            .filter(|slot| (1..=self.config.orchestrator.max_candidates).contains(slot))
    }

    // --- Audit trail -------------------------------------------------------

    /// Thought spool: every AI response within a cycle, with its prompt and
    /// parse result, for later browsing. 30-day retention.
    async fn store_thought(
        &self,
        step: &str,
        model: &str,
        input_summary: &str,
        full_response: &str,
        parsed: Option<&Value>,
    ) {
        let cycle_id = self.cycle_id.lock().expect("cycle id lock").clone();
        let result = self
            .store
            .exec(
                "INSERT INTO orchestrator_thoughts \
                 (cycle_id, step, model, input_summary, full_response, parsed_result) \
                 VALUES (?, ?, ?, ?, ?, ?)",
                &[
                    json!(cycle_id),
                    json!(step),
                    json!(model),
                    json!(input_summary),
                    json!(full_response),
                    parsed.map(|p| json!(p.to_string())).unwrap_or(Value::Null),
                ],
            )
            .await;
        if let Err(e) = result {
            warn!(step, error = %e, "thought store failed");
        }
    }

    async fn store_observation(&self, decision: &Decision) {
        let cycle_id = self.cycle_id.lock().expect("cycle id lock").clone();
        let today = local_date_string(self.config.tz());
        let result = self
            .store
            .exec(
                "INSERT OR REPLACE INTO orchestrator_observations \
                 (date, cycle_id, market_summary, strategy_assessment, notable_findings) \
                 VALUES (?, ?, ?, ?, ?)",
                &[
                    json!(today),
                    json!(cycle_id),
                    json!(truncate(&decision.market_observations, 5000)),
                    json!(truncate(&decision.reasoning, 5000)),
                    json!(truncate(&decision.cross_reference_findings, 5000)),
                ],
            )
            .await;
        if let Err(e) = result {
            warn!(error = %e, "observation store failed");
            return;
        }
        // Rolling 30-day retention for observations and thoughts
        let _ = self
            .store
            .exec(
                "DELETE FROM orchestrator_observations WHERE date < date('now', '-30 days')",
                &[],
            )
            .await;
        let _ = self
            .store
            .exec(
                "DELETE FROM orchestrator_thoughts WHERE created_at < datetime('now', '-30 days')",
                &[],
            )
            .await;
    }

    async fn log_orchestration(
        &self,
        decision: &Decision,
        deployed_version: Option<&str>,
    ) -> Result<()> {
        let version_from = match deployed_version {
            Some(version) => self
                .store
                .fetch_one(
                    "SELECT parent_version FROM strategy_versions WHERE version = ?",
                    &[json!(version)],
                )
                .await?
                .and_then(|r| r.opt_str("parent_version")),
            None => self
                .store
                .fetch_one(
                    "SELECT version FROM strategy_versions WHERE retired_at IS NULL \
                     AND deployed_at IS NOT NULL ORDER BY deployed_at DESC LIMIT 1",
                    &[],
                )
                .await?
                .and_then(|r| r.opt_str("version")),
        };

        let cost_today = self
            .store
            .fetch_one(
                "SELECT COALESCE(SUM(cost_usd), 0) as total FROM token_usage \
                 WHERE created_at >= date('now')",
                &[],
            )
            .await?
            .map(|r| r.f64("total"))
            .unwrap_or(0.0);
        let tokens_used = self
            .ai
            .daily_usage()
            .await
            .ok()
            .and_then(|u| u.get("used").and_then(Value::as_u64))
            .unwrap_or(0);

        self.store
            .exec(
                "INSERT INTO orchestrator_log \
                 (date, action, analysis, changes, strategy_version_from, strategy_version_to, \
                  tokens_used, cost_usd) \
                 VALUES (date('now'), ?, ?, ?, ?, ?, ?, ?)",
                &[
                    json!(decision.raw_kind),
                    json!(decision.parsed.to_string()),
                    json!(decision.specific_changes),
                    version_from.map(|v| json!(v)).unwrap_or(Value::Null),
                    deployed_version.map(|v| json!(v)).unwrap_or(Value::Null),
                    json!(tokens_used),
                    json!(cost_today),
                ],
            )
            .await?;
        Ok(())
    }
}

fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

/// Strip one markdown code fence if the model wrapped its output despite
/// instructions.
fn strip_code_fences(raw: &str) -> String {
    let trimmed = raw.trim();
    let Some(start) = trimmed.find("```") else {
        return trimmed.to_string();
    };
    let after_fence = &trimmed[start + 3..];
    // Skip an optional language tag on the fence line
    let body = match after_fence.find('\n') {
        Some(newline) => &after_fence[newline + 1..],
        None => after_fence,
    };
    match body.find("```") {
        Some(end) => body[..end].trim().to_string(),
        None => trimmed.to_string(),
    }
}

/// Cheap line-level diff for review prompts: lines dropped from the old
/// code and lines new in the proposal, capped to keep prompts bounded.
fn summarize_diff(old: &str, new: &str) -> String {
    use std::collections::HashSet;
    let old_lines: HashSet<&str> = old.lines().collect();
    let new_lines: HashSet<&str> = new.lines().collect();

    let mut out = Vec::new();
    for line in old.lines() {
        if !new_lines.contains(line) && !line.trim().is_empty() {
            out.push(format!("- {line}"));
        }
    }
    for line in new.lines() {
        if !old_lines.contains(line) && !line.trim().is_empty() {
            out.push(format!("+ {line}"));
        }
    }
    if out.is_empty() {
        return "(no textual changes)".to_string();
    }
    if out.len() > 400 {
        let total = out.len();
        out.truncate(400);
        out.push(format!("... ({} more changed lines)", total - 400));
    }
    out.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fences_are_stripped() {
        let wrapped = "Here you go:\n```python\nx = 1\ny = 2\n```\nDone.";
        assert_eq!(strip_code_fences(wrapped), "x = 1\ny = 2");
        assert_eq!(strip_code_fences("plain code"), "plain code");
        // Unclosed fence falls back to the raw text
        assert!(strip_code_fences("```python\nx = 1").contains("x = 1"));
    }

    #[test]
    fn diff_lists_added_and_removed_lines() {
        let diff = summarize_diff("a\nb\nc", "a\nc\nd");
        assert!(diff.contains("- b"));
        assert!(diff.contains("+ d"));
        assert_eq!(summarize_diff("same", "same"), "(no textual changes)");
    }
}
