//! The trading engine: wires every component, owns the task set, and runs
//! the process lifetime from startup through the graceful shutdown
//! sequence.
//!
//! Concurrency model: one tokio runtime, shared mutable state behind
//! `Arc<RwLock<…>>`/`Arc<Mutex<…>>` owned here. Each handler completes its
//! in-memory mutation and store flush before yielding the lock, so no task
//! ever observes mid-mutation state.

use anyhow::{Context, Result};
use chrono::{Utc, Weekday};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::application::ai::AiClient;
use crate::application::candidates::CandidateManager;
use crate::application::data::DataStore;
use crate::application::orchestrator::Orchestrator;
use crate::application::reporter::Reporter;
use crate::application::risk::RiskManager;
use crate::application::scheduler::{until_next_daily, until_next_weekly};
use crate::application::state::ScanState;
use crate::application::strategy::loader::LoadSource;
use crate::application::strategy::StrategyLoader;
use crate::application::trading::{PortfolioTracker, SlTpTrigger};
use crate::config::{Config, Mode};
use crate::domain::contract::{Action, Signal, Strategy, SymbolData};
use crate::domain::market::Timeframe;
use crate::domain::time::fmt_utc;
use crate::infrastructure::exchange::{KrakenRest, KrakenWebSocket, WsEvent};
use crate::infrastructure::notification::Notifier;
use crate::infrastructure::observability::{Metrics, MetricsReporter};
use crate::infrastructure::persistence::Store;

/// Per-pair fee overrides on top of the configured defaults, refreshed by
/// the fee-check job.
#[derive(Debug, Clone)]
pub struct FeeBook {
    pub default_maker_pct: f64,
    pub default_taker_pct: f64,
    pub per_pair: HashMap<String, (f64, f64)>,
}

impl FeeBook {
    fn for_symbol(&self, symbol: &str) -> (f64, f64) {
        self.per_pair
            .get(symbol)
            .copied()
            .unwrap_or((self.default_maker_pct, self.default_taker_pct))
    }
}

pub struct Engine {
    config: Config,
    store: Store,
    portfolio: Arc<RwLock<PortfolioTracker>>,
    risk: Arc<RwLock<RiskManager>>,
    data_store: Arc<DataStore>,
    kraken: Arc<KrakenRest>,
    notifier: Arc<Notifier>,
    ai: Arc<AiClient>,
    candidates: Arc<Mutex<CandidateManager>>,
    orchestrator: Arc<Orchestrator>,
    strategy: Arc<Mutex<Box<dyn Strategy>>>,
    strategy_loader: Arc<StrategyLoader>,
    reporter: Reporter,
    scan_state: Arc<RwLock<ScanState>>,
    fee_book: Arc<RwLock<FeeBook>>,
    ws_prices: Arc<RwLock<HashMap<String, f64>>>,
    metrics: Metrics,
    scan_interval_minutes: u64,
    shutdown_tx: watch::Sender<bool>,
}

impl Engine {
    /// Full startup sequence: store → shell components → strategy (with
    /// fallback chain and state restore) → AI client → candidates →
    /// orchestrator. Fails only on unrecoverable startup errors.
    pub async fn build(config: Config) -> Result<Self> {
        let store = Store::connect(&config.db_url)
            .await
            .context("store open failed")?;
        let metrics = Metrics::new()?;

        let kraken = Arc::new(KrakenRest::new(config.kraken.clone()));
        let exchange: Option<Arc<dyn crate::domain::ports::ExchangeExecution>> =
            match config.mode {
                Mode::Live => Some(kraken.clone()),
                Mode::Paper => None,
            };

        let mut portfolio = PortfolioTracker::new(config.clone(), store.clone(), exchange);
        portfolio.initialize().await?;

        let mut risk = RiskManager::new(config.risk.clone());
        risk.initialize(&store, config.tz()).await?;

        let data_store = Arc::new(DataStore::new(store.clone(), config.data.clone()));
        let notifier = Arc::new(Notifier::new(config.telegram.clone()));

        // Strategy: filesystem → store fallback → built-in baseline
        let strategy_loader = Arc::new(StrategyLoader::new(
            config.worker.strategy_dir.clone(),
            config.worker.clone(),
        ));
        let loaded = strategy_loader.load_with_fallback(&store).await;
        if loaded.source == LoadSource::Builtin {
            notifier
                .system_error("Strategy load failed on all sources; running built-in baseline")
                .await;
        }
        let mut strategy = loaded.strategy;
        strategy
            .initialize(&config.risk_limits(), &config.symbols)
            .await?;
        if let Ok(Some(state)) = strategy_loader.latest_state(&store).await {
            if let Err(e) = strategy.load_state(state).await {
                warn!(error = %e, "strategy state restore failed");
            } else {
                info!("strategy state restored");
            }
        }
        let active_version = store
            .fetch_one(
                "SELECT version FROM strategy_versions WHERE deployed_at IS NOT NULL \
                 AND retired_at IS NULL ORDER BY deployed_at DESC LIMIT 1",
                &[],
            )
            .await?
            .and_then(|r| r.get("version").and_then(Value::as_str).map(str::to_string));
        portfolio.set_strategy_version(active_version);

        let ai = Arc::new(AiClient::new(
            config.ai.clone(),
            store.clone(),
            Some(metrics.clone()),
        ));
        if ai.is_configured() {
            if let Err(e) = ai.initialize().await {
                warn!(error = %e, "ai client init failed");
            }
        }

        let mut candidate_manager = CandidateManager::new(config.clone(), store.clone());
        candidate_manager.set_notifier(notifier.clone());
        candidate_manager.initialize().await?;
        let candidates = Arc::new(Mutex::new(candidate_manager));

        let scan_interval_minutes = strategy.scan_interval_minutes().max(1);
        let portfolio = Arc::new(RwLock::new(portfolio));
        let scan_state = Arc::new(RwLock::new(ScanState {
            strategy_hash: loaded.code_hash,
            ..ScanState::default()
        }));

        let orchestrator = Arc::new(Orchestrator::new(
            config.clone(),
            store.clone(),
            ai.clone(),
            data_store.clone(),
            notifier.clone(),
            candidates.clone(),
            strategy_loader.clone(),
            portfolio.clone(),
            scan_state.clone(),
        ));

        let fee_book = Arc::new(RwLock::new(FeeBook {
            default_maker_pct: config.kraken.maker_fee_pct,
            default_taker_pct: config.kraken.taker_fee_pct,
            per_pair: HashMap::new(),
        }));

        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            reporter: Reporter::new(store.clone()),
            store,
            portfolio,
            risk: Arc::new(RwLock::new(risk)),
            data_store,
            kraken,
            notifier,
            ai,
            candidates,
            orchestrator,
            strategy: Arc::new(Mutex::new(strategy)),
            strategy_loader,
            scan_state,
            fee_book,
            ws_prices: Arc::new(RwLock::new(HashMap::new())),
            metrics,
            scan_interval_minutes,
            config,
            shutdown_tx,
        })
    }

    /// Run until a shutdown signal arrives, then execute the shutdown
    /// sequence. Each scheduled job runs as its own task; jobs never
    /// overlap with themselves because each loop awaits its own handler.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        info!(
            mode = %self.config.mode,
            symbols = self.config.symbols.len(),
            "engine starting"
        );

        let mut handles: Vec<JoinHandle<()>> = Vec::new();

        // Market WebSocket + its event consumer
        let (ws_event_tx, ws_event_rx) = mpsc::channel::<WsEvent>(1024);
        let websocket = KrakenWebSocket::new(
            self.config.kraken.ws_url.clone(),
            self.config.symbols.clone(),
            ws_event_tx,
            Some(self.metrics.clone()),
        );
        let ws_prices_source = websocket.prices_handle();
        {
            let engine = self.clone();
            handles.push(tokio::spawn(async move {
                engine.consume_ws_events(ws_event_rx).await;
            }));
        }
        handles.push(tokio::spawn(websocket.run()));
        {
            // Mirror the socket's price map into the engine handle
            let ws_prices = self.ws_prices.clone();
            let mut shutdown = self.shutdown_tx.subscribe();
            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_secs(5));
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            let snapshot = ws_prices_source.read().await.clone();
                            *ws_prices.write().await = snapshot;
                        }
                        _ = shutdown.changed() => break,
                    }
                }
            }));
        }

        // Metrics reporter
        let reporter = MetricsReporter::new(self.portfolio.clone(), self.metrics.clone(), 60);
        handles.push(tokio::spawn(reporter.run()));

        // scan: every scan_interval minutes, first fire ~10s after startup
        handles.push(self.spawn_interval_job(
            "scan",
            Duration::from_secs(10),
            Duration::from_secs(self.scan_interval_minutes * 60),
            |engine| async move { engine.scan_once().await },
        ));

        // position_monitor: every 30 seconds
        handles.push(self.spawn_interval_job(
            "position_monitor",
            Duration::from_secs(30),
            Duration::from_secs(30),
            |engine| async move { engine.position_monitor_once().await },
        ));

        // fee_check: configured hours, first fire ~1 minute after startup
        handles.push(self.spawn_interval_job(
            "fee_check",
            Duration::from_secs(60),
            Duration::from_secs(self.config.fees.check_interval_hours * 3600),
            |engine| async move { engine.check_fees_once().await },
        ));

        // daily_snapshot at 23:55 local
        handles.push(self.spawn_daily_job("daily_snapshot", 23, 55, |engine| async move {
            engine.portfolio.write().await.snapshot_daily().await
        }));

        // daily_reset at 00:00 local
        handles.push(self.spawn_daily_job("daily_reset", 0, 0, |engine| async move {
            engine.risk.write().await.reset_daily();
            engine.portfolio.write().await.reset_daily();
            engine.ai.reset_daily_tokens();
            Ok(())
        }));

        // nightly_orchestration at the configured hour
        let orch_hour = self.config.orchestrator.start_hour;
        let orch_minute = self.config.orchestrator.start_minute;
        handles.push(
            self.spawn_daily_job("nightly_orchestration", orch_hour, orch_minute, |engine| async move {
                let report = engine.orchestrator.run_nightly_cycle().await;
                engine.notifier.daily_summary(&report).await;
                Ok(())
            }),
        );

        // weekly_report: Sunday 20:00 local
        handles.push(self.spawn_weekly_job(
            "weekly_report",
            Weekday::Sun,
            20,
            0,
            |engine| async move {
                let report = engine.reporter.weekly_report().await?;
                engine.notifier.weekly_report(&report).await;
                Ok(())
            },
        ));

        {
            let portfolio_value = self.portfolio.read().await.total_value();
            self.risk.write().await.update_portfolio_peak(portfolio_value);
            let positions = self.portfolio.read().await.position_count();
            self.notifier.system_online(portfolio_value, positions).await;
            self.store
                .log_activity(
                    "system",
                    "engine started",
                    Some(&format!("portfolio=${portfolio_value:.2} positions={positions}")),
                )
                .await;
            info!(
                portfolio = format!("{portfolio_value:.2}"),
                positions, "engine started"
            );
        }

        // Wait for a termination signal, watching the kill flag meanwhile
        self.wait_for_shutdown_signal().await;

        // Shutdown sequence, every step best-effort
        info!("shutdown sequence starting");
        let _ = self.shutdown_tx.send(true);

        // 1. (tasks stop firing via the watch channel) 2. strategy state
        {
            let mut strategy = self.strategy.lock().await;
            match strategy.get_state().await {
                Ok(state) => {
                    if let Err(e) = self.strategy_loader.save_state(&self.store, state).await {
                        warn!(error = %e, "strategy state save failed");
                    } else {
                        info!("strategy state saved");
                    }
                }
                Err(e) => warn!(error = %e, "strategy state fetch failed"),
            }
        }

        // 3. cancel unfilled exchange orders (live mode)
        if self.config.mode == Mode::Live {
            use crate::domain::ports::ExchangeExecution;
            if let Err(e) = self.kraken.cancel_all_orders().await {
                warn!(error = %e, "order cancellation failed during shutdown");
            }
        }

        // 4-5. websocket and notifier tasks die with their handles
        for handle in &handles {
            handle.abort();
        }

        // 6-7. REST client drops with the engine; commit and close the store
        self.store.log_activity("system", "engine stopped", None).await;
        if let Err(e) = self.store.commit().await {
            warn!(error = %e, "store commit failed during shutdown");
        }
        self.store.close().await;

        info!("shutdown complete");
        Ok(())
    }

    async fn wait_for_shutdown_signal(&self) {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).ok();
        loop {
            tokio::select! {
                result = tokio::signal::ctrl_c() => {
                    if result.is_ok() {
                        info!("interrupt received");
                    }
                    return;
                }
                _ = async {
                    match sigterm.as_mut() {
                        Some(signal) => { signal.recv().await; }
                        None => std::future::pending::<()>().await,
                    }
                } => {
                    info!("terminate received");
                    return;
                }
                _ = ticker.tick() => {
                    let kill = self.scan_state.read().await.kill_requested;
                    if kill {
                        warn!("kill switch requested: emergency stop");
                        self.emergency_stop().await;
                        self.scan_state.write().await.kill_requested = false;
                    }
                }
            }
        }
    }

    fn spawn_interval_job<F, Fut>(
        self: &Arc<Self>,
        name: &'static str,
        initial_delay: Duration,
        period: Duration,
        job: F,
    ) -> JoinHandle<()>
    where
        F: Fn(Arc<Engine>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send,
    {
        let engine = self.clone();
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(initial_delay) => {}
                _ = shutdown.changed() => return,
            }
            loop {
                if *shutdown.borrow() {
                    return;
                }
                if let Err(e) = job(engine.clone()).await {
                    error!(job = name, error = %e, "job failed; retrying at next fire");
                }
                tokio::select! {
                    _ = tokio::time::sleep(period) => {}
                    _ = shutdown.changed() => return,
                }
            }
        })
    }

    fn spawn_daily_job<F, Fut>(
        self: &Arc<Self>,
        name: &'static str,
        hour: u32,
        minute: u32,
        job: F,
    ) -> JoinHandle<()>
    where
        F: Fn(Arc<Engine>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send,
    {
        let engine = self.clone();
        let tz = self.config.tz();
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                let wait = until_next_daily(tz, hour, minute);
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = shutdown.changed() => return,
                }
                if *shutdown.borrow() {
                    return;
                }
                if let Err(e) = job(engine.clone()).await {
                    error!(job = name, error = %e, "job failed");
                }
                // Step past the trigger minute before recomputing
                tokio::time::sleep(Duration::from_secs(61)).await;
            }
        })
    }

    fn spawn_weekly_job<F, Fut>(
        self: &Arc<Self>,
        name: &'static str,
        weekday: Weekday,
        hour: u32,
        minute: u32,
        job: F,
    ) -> JoinHandle<()>
    where
        F: Fn(Arc<Engine>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send,
    {
        let engine = self.clone();
        let tz = self.config.tz();
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                let wait = until_next_weekly(tz, weekday, hour, minute);
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = shutdown.changed() => return,
                }
                if *shutdown.borrow() {
                    return;
                }
                if let Err(e) = job(engine.clone()).await {
                    error!(job = name, error = %e, "job failed");
                }
                tokio::time::sleep(Duration::from_secs(61)).await;
            }
        })
    }

    // --- WebSocket event handling ------------------------------------------

    async fn consume_ws_events(&self, mut events: mpsc::Receiver<WsEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                WsEvent::Ticker { .. } => {} // mirrored via the price map
                WsEvent::Ohlc { symbol, candle } => {
                    let series = crate::domain::market::CandleSeries::new(vec![candle]);
                    if let Err(e) = self
                        .data_store
                        .store_candles(&symbol, Timeframe::M5, &series)
                        .await
                    {
                        warn!(error = %e, symbol, "ws candle store failed");
                    }
                }
                WsEvent::PermanentFailure => {
                    self.scan_state.write().await.ws_degraded = true;
                    self.notifier.websocket_failed().await;
                }
            }
        }
    }

    // --- scan --------------------------------------------------------------

    async fn scan_once(self: Arc<Self>) -> Result<()> {
        {
            let state = self.scan_state.read().await;
            if state.paused {
                return Ok(());
            }
        }
        if self.risk.read().await.is_halted() {
            self.metrics.risk_halted.set(1.0);
            return Ok(());
        }
        self.metrics.risk_halted.set(0.0);

        self.reload_strategy_if_needed().await;

        let (markets, prices, mut scan_symbols) = self.collect_markets().await;
        if markets.is_empty() {
            self.metrics.scans_total.with_label_values(&["no_data"]).inc();
            return Ok(());
        }

        let portfolio_view = self.portfolio.write().await.get_portfolio(&prices).await?;
        let portfolio_value = portfolio_view.total_value;

        let signals = {
            let mut strategy = self.strategy.lock().await;
            strategy
                .analyze(&markets, &portfolio_view, Utc::now())
                .await
                .unwrap_or_else(|e| {
                    error!(error = %e, "strategy analyze failed");
                    Vec::new()
                })
        };
        let regime = self.strategy.lock().await.regime();

        for mut signal in signals {
            let (passed, reason) = {
                let portfolio = self.portfolio.read().await;
                let mut risk = self.risk.write().await;
                let check = risk.check_signal(
                    &signal,
                    portfolio_value,
                    portfolio.position_count(),
                    portfolio.position_value_for_symbol(&signal.symbol),
                    Some(portfolio.daily_start_value()),
                    portfolio.is_new_position(&signal),
                );
                (check.passed, check.reason)
            };

            if !passed {
                info!(symbol = %signal.symbol, %reason, "signal rejected");
                self.metrics
                    .signals_total
                    .with_label_values(&[&signal.action.to_string(), "rejected"])
                    .inc();
                self.persist_signal(&signal, regime.as_deref(), false, Some(&reason))
                    .await;
                self.notifier
                    .signal_rejected(&signal.symbol, &signal.action.to_string(), &reason)
                    .await;
                continue;
            }

            self.risk.read().await.clamp_signal(&mut signal);

            let price = prices.get(&signal.symbol).copied().unwrap_or(0.0);
            let (maker, taker) = self.fee_book.read().await.for_symbol(&signal.symbol);
            let results = self
                .portfolio
                .write()
                .await
                .execute_signal(&signal, price, maker, taker, regime.as_deref())
                .await?;

            if results.is_empty() {
                self.persist_signal(&signal, regime.as_deref(), false, Some("execution_failed"))
                    .await;
                continue;
            }

            self.persist_signal(&signal, regime.as_deref(), true, None).await;
            self.metrics
                .signals_total
                .with_label_values(&[&signal.action.to_string(), "executed"])
                .inc();

            for result in &results {
                if let Some(pnl) = result.pnl {
                    self.risk.write().await.record_trade_result(pnl);
                    self.metrics
                        .trades_total
                        .with_label_values(&[result
                            .close_reason
                            .as_deref()
                            .unwrap_or("signal")])
                        .inc();
                    let mut strategy = self.strategy.lock().await;
                    let _ = strategy
                        .on_position_closed(
                            &result.symbol,
                            pnl,
                            result.pnl_pct.unwrap_or(0.0),
                            &result.tag,
                        )
                        .await;
                }
                if result.action == Action::Buy {
                    let mut strategy = self.strategy.lock().await;
                    let _ = strategy
                        .on_fill(
                            &result.symbol,
                            Action::Buy,
                            result.qty,
                            result.price,
                            result.intent,
                            &result.tag,
                        )
                        .await;
                }
                self.notifier.trade_executed(result).await;
            }

            // Rollback triggers and the peak update run after each fill
            let new_value = self.portfolio.read().await.total_value();
            let daily_start = self.portfolio.read().await.daily_start_value();
            let rollback = self
                .risk
                .write()
                .await
                .check_rollback_triggers(new_value, daily_start);
            if !rollback.passed {
                warn!(reason = %rollback.reason, "rollback triggered");
                self.store
                    .log_activity("risk", "rollback halt", Some(&rollback.reason))
                    .await;
                self.notifier
                    .rollback_alert(&rollback.reason, "current")
                    .await;
            }
            self.risk.write().await.update_portfolio_peak(new_value);

            if let Some(entry) = scan_symbols.get_mut(&signal.symbol) {
                if let Some(map) = entry.as_object_mut() {
                    map.insert(
                        "signal".to_string(),
                        json!({
                            "action": signal.action.to_string(),
                            "confidence": signal.confidence,
                            "reasoning": signal.reasoning,
                        }),
                    );
                }
            }
        }

        // Candidates trade the same tick, isolated per slot
        {
            let mut candidates = self.candidates.lock().await;
            candidates.run_scans(&markets, Utc::now()).await;
            if let Err(e) = candidates.persist_state().await {
                warn!(error = %e, "candidate persist failed");
            }
        }

        self.persist_scan_results(&scan_symbols).await;
        {
            let mut state = self.scan_state.write().await;
            state.symbols = scan_symbols;
            state.last_scan = Some(Utc::now().format("%H:%M:%S").to_string());
        }

        // Periodic strategy state save
        {
            let mut strategy = self.strategy.lock().await;
            if let Ok(state) = strategy.get_state().await {
                let _ = self.strategy_loader.save_state(&self.store, state).await;
            }
        }

        self.metrics.scans_total.with_label_values(&["ok"]).inc();
        Ok(())
    }

    /// Fetch ticker + candles per symbol, falling back to REST history
    /// when the stored series is too thin. Per-symbol failures only skip
    /// that symbol.
    async fn collect_markets(
        &self,
    ) -> (
        HashMap<String, SymbolData>,
        HashMap<String, f64>,
        HashMap<String, Value>,
    ) {
        let mut markets = HashMap::new();
        let mut prices = HashMap::new();
        let mut scan_symbols = HashMap::new();
        let fee_book = self.fee_book.read().await.clone();

        for symbol in &self.config.symbols {
            let result: Result<()> = async {
                let ticker = self.kraken.get_ticker(symbol).await?;
                let price = ticker.last;
                if price <= 0.0 {
                    anyhow::bail!("zero price");
                }
                prices.insert(symbol.clone(), price);

                let mut candles_5m = self
                    .data_store
                    .get_candles(symbol, Timeframe::M5, Some(8640))
                    .await?;
                if candles_5m.len() < 30 {
                    // Cold start: bootstrap from the exchange
                    let fetched = self.kraken.get_ohlc(symbol, 5, None).await?;
                    if !fetched.is_empty() {
                        self.data_store
                            .store_candles(symbol, Timeframe::M5, &fetched)
                            .await?;
                        candles_5m = fetched;
                    }
                }
                let candles_1h = self
                    .data_store
                    .get_candles(symbol, Timeframe::H1, Some(8760))
                    .await?;
                let candles_1d = self
                    .data_store
                    .get_candles(symbol, Timeframe::D1, Some(2555))
                    .await?;

                let spread = self.kraken.get_spread(symbol).await.unwrap_or(0.0);
                let (maker, taker) = fee_book.for_symbol(symbol);

                scan_symbols.insert(
                    symbol.clone(),
                    json!({"price": price, "spread": spread}),
                );
                markets.insert(
                    symbol.clone(),
                    SymbolData {
                        symbol: symbol.clone(),
                        current_price: price,
                        candles_1h: if candles_1h.is_empty() {
                            candles_5m.resample(Timeframe::H1)
                        } else {
                            candles_1h
                        },
                        candles_1d: if candles_1d.is_empty() {
                            candles_5m.resample(Timeframe::D1)
                        } else {
                            candles_1d
                        },
                        candles_5m,
                        spread,
                        volume_24h: ticker.volume_24h,
                        maker_fee_pct: maker,
                        taker_fee_pct: taker,
                    },
                );
                Ok(())
            }
            .await;
            if let Err(e) = result {
                warn!(%symbol, error = %e, "symbol scan failed");
            }
        }

        (markets, prices, scan_symbols)
    }

    async fn reload_strategy_if_needed(&self) {
        let needed = self.scan_state.read().await.strategy_reload_needed;
        if !needed {
            return;
        }
        info!("hot-reloading strategy after promotion");
        let loaded = self.strategy_loader.load_with_fallback(&self.store).await;
        let mut strategy = loaded.strategy;
        if let Err(e) = strategy
            .initialize(&self.config.risk_limits(), &self.config.symbols)
            .await
        {
            error!(error = %e, "reloaded strategy failed to initialize; keeping previous");
            return;
        }
        *self.strategy.lock().await = strategy;

        let active_version = self
            .store
            .fetch_one(
                "SELECT version FROM strategy_versions WHERE deployed_at IS NOT NULL \
                 AND retired_at IS NULL ORDER BY deployed_at DESC LIMIT 1",
                &[],
            )
            .await
            .ok()
            .flatten()
            .and_then(|r| r.get("version").and_then(Value::as_str).map(str::to_string));
        self.portfolio
            .write()
            .await
            .set_strategy_version(active_version);

        let mut state = self.scan_state.write().await;
        state.strategy_reload_needed = false;
        state.strategy_hash = loaded.code_hash;
    }

    async fn persist_signal(
        &self,
        signal: &Signal,
        regime: Option<&str>,
        acted_on: bool,
        rejected_reason: Option<&str>,
    ) {
        let result = self
            .store
            .exec(
                "INSERT INTO signals \
                 (symbol, action, size_pct, confidence, intent, reasoning, strategy_version, \
                  strategy_regime, acted_on, rejected_reason, tag) \
                 VALUES (?, ?, ?, ?, ?, ?, \
                         (SELECT version FROM strategy_versions WHERE deployed_at IS NOT NULL \
                          AND retired_at IS NULL ORDER BY deployed_at DESC LIMIT 1), \
                         ?, ?, ?, ?)",
                &[
                    json!(signal.symbol),
                    json!(signal.action.to_string()),
                    json!(signal.size_pct),
                    json!(signal.confidence),
                    json!(signal.intent.as_str()),
                    json!(signal.reasoning),
                    regime.map(|r| json!(r)).unwrap_or(Value::Null),
                    json!(acted_on as i64),
                    rejected_reason.map(|r| json!(r)).unwrap_or(Value::Null),
                    signal.tag.as_ref().map(|t| json!(t)).unwrap_or(Value::Null),
                ],
            )
            .await;
        if let Err(e) = result {
            warn!(error = %e, "signal persist failed");
        }
    }

    async fn persist_scan_results(&self, scan_symbols: &HashMap<String, Value>) {
        let now = fmt_utc(Utc::now());
        for (symbol, info) in scan_symbols {
            let signal = info.get("signal");
            let result = self
                .store
                .exec(
                    "INSERT INTO scan_results \
                     (timestamp, symbol, price, spread, signal_generated, signal_action, \
                      signal_confidence) VALUES (?, ?, ?, ?, ?, ?, ?)",
                    &[
                        json!(now.clone()),
                        json!(symbol),
                        info.get("price").cloned().unwrap_or(json!(0.0)),
                        info.get("spread").cloned().unwrap_or(Value::Null),
                        json!(signal.is_some() as i64),
                        signal
                            .and_then(|s| s.get("action"))
                            .cloned()
                            .unwrap_or(Value::Null),
                        signal
                            .and_then(|s| s.get("confidence"))
                            .cloned()
                            .unwrap_or(Value::Null),
                    ],
                )
                .await;
            if let Err(e) = result {
                warn!(error = %e, "scan result persist failed");
            }
        }
    }

    // --- position monitor ---------------------------------------------------

    async fn position_monitor_once(self: Arc<Self>) -> Result<()> {
        let mut prices = self.ws_prices.read().await.clone();
        let degraded = self.scan_state.read().await.ws_degraded;
        if prices.is_empty() || degraded {
            // REST fallback when the stream is down or not yet warm
            for symbol in &self.config.symbols {
                if let Ok(ticker) = self.kraken.get_ticker(symbol).await {
                    if ticker.last > 0.0 {
                        prices.insert(symbol.clone(), ticker.last);
                    }
                }
            }
        }
        if prices.is_empty() {
            return Ok(());
        }

        let triggered: Vec<SlTpTrigger> =
            self.portfolio.write().await.update_prices(&prices).await;
        for trigger in triggered {
            let (_, taker) = self.fee_book.read().await.for_symbol(&trigger.symbol);
            let fill = trigger.price * (1.0 - self.config.default_slippage_factor);
            let qty = match self.portfolio.read().await.positions().get(&trigger.tag) {
                Some(pos) => pos.qty,
                None => continue, // already closed by an interleaved task
            };
            let result = self
                .portfolio
                .write()
                .await
                .close_qty(
                    &trigger.tag,
                    qty,
                    fill,
                    taker,
                    Action::Close,
                    &trigger.reason,
                    None,
                )
                .await;
            match result {
                Ok(trade) => {
                    if let Some(pnl) = trade.pnl {
                        self.risk.write().await.record_trade_result(pnl);
                        let mut strategy = self.strategy.lock().await;
                        let _ = strategy
                            .on_position_closed(
                                &trade.symbol,
                                pnl,
                                trade.pnl_pct.unwrap_or(0.0),
                                &trade.tag,
                            )
                            .await;
                    }
                    self.metrics
                        .trades_total
                        .with_label_values(&[trigger.reason.as_str()])
                        .inc();
                    self.notifier
                        .stop_triggered(&trigger.symbol, &trigger.reason, trigger.price)
                        .await;
                    self.notifier.trade_executed(&trade).await;
                }
                Err(e) => error!(tag = %trigger.tag, error = %e, "triggered close failed"),
            }
        }

        // Candidate SL/TP runs against the same prices
        self.candidates.lock().await.check_sl_tp(&prices).await;
        Ok(())
    }

    // --- fee check ----------------------------------------------------------

    async fn check_fees_once(self: Arc<Self>) -> Result<()> {
        if self.config.kraken.api_key.is_empty() {
            return Ok(());
        }
        for symbol in &self.config.symbols {
            match self.kraken.get_fee_schedule(symbol).await {
                Ok((maker, taker)) => {
                    self.fee_book
                        .write()
                        .await
                        .per_pair
                        .insert(symbol.clone(), (maker, taker));
                    if let Err(e) = self
                        .store
                        .exec(
                            "INSERT INTO fee_schedule (symbol, maker_fee_pct, taker_fee_pct) \
                             VALUES (?, ?, ?)",
                            &[json!(symbol), json!(maker), json!(taker)],
                        )
                        .await
                    {
                        warn!(error = %e, "fee schedule persist failed");
                    }
                    info!(%symbol, maker, taker, "fees updated");
                }
                Err(e) => {
                    warn!(%symbol, error = %e, "fee check failed");
                    break; // auth problems will fail for every pair
                }
            }
        }
        Ok(())
    }

    // --- emergency stop -----------------------------------------------------

    /// Close every open fund position immediately at the best known price.
    pub async fn emergency_stop(&self) {
        let targets: Vec<(String, String)> = self
            .portfolio
            .read()
            .await
            .positions()
            .values()
            .map(|p| (p.symbol.clone(), p.tag.clone()))
            .collect();
        for (symbol, tag) in targets {
            let price = match self.kraken.get_ticker(&symbol).await {
                Ok(ticker) if ticker.last > 0.0 => ticker.last,
                _ => {
                    self.portfolio
                        .read()
                        .await
                        .positions()
                        .get(&tag)
                        .map(|p| p.current_price)
                        .unwrap_or(0.0)
                }
            };
            if price <= 0.0 {
                continue;
            }
            let (_, taker) = self.fee_book.read().await.for_symbol(&symbol);
            let fill = price * (1.0 - self.config.default_slippage_factor);
            let qty = match self.portfolio.read().await.positions().get(&tag) {
                Some(pos) => pos.qty,
                None => continue,
            };
            let result = self
                .portfolio
                .write()
                .await
                .close_qty(&tag, qty, fill, taker, Action::Close, "emergency", None)
                .await;
            match result {
                Ok(trade) => {
                    if let Some(pnl) = trade.pnl {
                        self.risk.write().await.record_trade_result(pnl);
                    }
                    self.notifier.trade_executed(&trade).await;
                }
                Err(e) => error!(%tag, error = %e, "emergency close failed"),
            }
        }
        self.store
            .log_activity("risk", "emergency stop executed", None)
            .await;
        self.notifier.system_error("Emergency stop executed").await;
    }
}
