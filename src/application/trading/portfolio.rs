//! Portfolio tracker: position management and P&L tracking.
//!
//! Handles both paper and live execution. Positions are keyed by tag;
//! multiple open positions per symbol are allowed. Part of the rigid shell.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::Config;
use crate::domain::contract::{
    Action, ClosedTrade, Intent, OpenPosition, OrderType, PortfolioView, Signal,
};
use crate::domain::ports::ExchangeExecution;
use crate::domain::time::{fmt_utc, local_midnight_utc, parse_utc_lossy};
use crate::infrastructure::persistence::{JsonRow, RowExt, Store};

use super::fills;

#[derive(Debug, Clone)]
pub struct Position {
    pub symbol: String,
    pub tag: String,
    pub side: String,
    pub qty: f64,
    pub avg_entry: f64,
    pub current_price: f64,
    pub entry_fee: f64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub intent: Intent,
    pub strategy_version: Option<String>,
    pub opened_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Deepest drawdown-from-entry observed while open. Non-decreasing.
    pub max_adverse_excursion: f64,
}

impl Position {
    pub fn market_value(&self) -> f64 {
        self.qty
            * if self.current_price > 0.0 {
                self.current_price
            } else {
                self.avg_entry
            }
    }

    fn from_row(row: &JsonRow) -> Self {
        Position {
            symbol: row.str_or("symbol", ""),
            tag: row.str_or("tag", ""),
            side: row.str_or("side", "long"),
            qty: row.f64("qty"),
            avg_entry: row.f64("avg_entry"),
            current_price: row.f64("current_price"),
            entry_fee: row.f64("entry_fee"),
            stop_loss: row.opt_f64("stop_loss"),
            take_profit: row.opt_f64("take_profit"),
            intent: Intent::parse_lossy(&row.str_or("intent", "DAY")),
            strategy_version: row.opt_str("strategy_version"),
            opened_at: row
                .opt_str("opened_at")
                .and_then(|s| parse_utc_lossy(&s))
                .unwrap_or_else(Utc::now),
            updated_at: row
                .opt_str("updated_at")
                .and_then(|s| parse_utc_lossy(&s))
                .unwrap_or_else(Utc::now),
            max_adverse_excursion: row.f64("max_adverse_excursion"),
        }
    }
}

/// Outcome of an executed signal. `pnl` is set on closes only.
#[derive(Debug, Clone)]
pub struct TradeResult {
    pub symbol: String,
    pub action: Action,
    pub qty: f64,
    pub price: f64,
    pub fee: f64,
    pub pnl: Option<f64>,
    pub pnl_pct: Option<f64>,
    pub intent: Intent,
    pub tag: String,
    pub close_reason: Option<String>,
}

/// SL/TP crossing detected by the position monitor. The fill price is the
/// threshold itself (conservative); slippage applies on the close.
#[derive(Debug, Clone)]
pub struct SlTpTrigger {
    pub symbol: String,
    pub tag: String,
    pub reason: String,
    pub price: f64,
}

pub struct PortfolioTracker {
    config: Config,
    store: Store,
    exchange: Option<Arc<dyn ExchangeExecution>>,
    positions: HashMap<String, Position>,
    cash: f64,
    starting_cash: f64,
    fees_today: f64,
    daily_start_value: f64,
    tag_counters: HashMap<String, u32>,
    strategy_version: Option<String>,
}

impl PortfolioTracker {
    pub fn new(config: Config, store: Store, exchange: Option<Arc<dyn ExchangeExecution>>) -> Self {
        let cash = if config.is_paper() {
            config.paper_balance_usd
        } else {
            0.0
        };
        Self {
            config,
            store,
            exchange,
            positions: HashMap::new(),
            cash,
            starting_cash: cash,
            fees_today: 0.0,
            daily_start_value: 0.0,
            tag_counters: HashMap::new(),
            strategy_version: None,
        }
    }

    /// Load positions and cash from the store on startup.
    pub async fn initialize(&mut self) -> Result<()> {
        let rows = self.store.fetch_all("SELECT * FROM positions", &[]).await?;
        for row in &rows {
            let pos = Position::from_row(row);
            self.positions.insert(pos.tag.clone(), pos);
        }

        let last_snap = self
            .store
            .fetch_one(
                "SELECT cash, portfolio_value FROM daily_performance ORDER BY date DESC LIMIT 1",
                &[],
            )
            .await?;

        if let Some(cash) = last_snap.as_ref().and_then(|s| s.opt_f64("cash")) {
            self.cash = cash;
        } else if self.config.is_paper() {
            self.cash = self.config.paper_balance_usd;
        } else if let Some(exchange) = &self.exchange {
            match exchange.get_balance().await {
                Ok(balances) => {
                    self.cash = balances
                        .get("ZUSD")
                        .or_else(|| balances.get("USD"))
                        .copied()
                        .unwrap_or(0.0);
                    info!(cash = format!("{:.2}", self.cash), "live balance loaded");
                }
                Err(e) => warn!(error = %e, "live balance fetch failed"),
            }
        }

        self.daily_start_value = last_snap
            .as_ref()
            .and_then(|s| s.opt_f64("portfolio_value"))
            .unwrap_or_else(|| self.total_value());

        info!(
            positions = self.positions.len(),
            cash = format!("{:.2}", self.cash),
            "portfolio loaded"
        );
        Ok(())
    }

    pub fn set_strategy_version(&mut self, version: Option<String>) {
        self.strategy_version = version;
    }

    pub fn cash(&self) -> f64 {
        self.cash
    }

    pub fn fees_today(&self) -> f64 {
        self.fees_today
    }

    pub fn position_count(&self) -> usize {
        self.positions.len()
    }

    pub fn daily_start_value(&self) -> f64 {
        self.daily_start_value
    }

    pub fn positions(&self) -> &HashMap<String, Position> {
        &self.positions
    }

    /// Cash + mark-to-market of every open position.
    pub fn total_value(&self) -> f64 {
        self.cash + self.positions.values().map(Position::market_value).sum::<f64>()
    }

    /// Total exposure to one symbol across all its tags.
    pub fn position_value_for_symbol(&self, symbol: &str) -> f64 {
        self.positions
            .values()
            .filter(|p| p.symbol == symbol)
            .map(Position::market_value)
            .sum()
    }

    /// A BUY is an average-in (not a new position) when its tag already
    /// exists.
    pub fn is_new_position(&self, signal: &Signal) -> bool {
        match &signal.tag {
            Some(tag) => !self.positions.contains_key(tag),
            None => true,
        }
    }

    fn next_auto_tag(&mut self, symbol: &str) -> String {
        let clean = symbol.replace('/', "");
        loop {
            let n = self.tag_counters.entry(symbol.to_string()).or_insert(0);
            *n += 1;
            let tag = format!("auto_{}_{:03}", clean, n);
            if !self.positions.contains_key(&tag) {
                return tag;
            }
        }
    }

    /// Build the snapshot handed to the strategy. Updates current prices
    /// and MAE as a side effect.
    pub async fn get_portfolio(&mut self, prices: &HashMap<String, f64>) -> Result<PortfolioView> {
        for pos in self.positions.values_mut() {
            if let Some(price) = prices.get(&pos.symbol) {
                pos.current_price = *price;
                if *price < pos.avg_entry && pos.avg_entry > 0.0 {
                    let dd = (pos.avg_entry - price) / pos.avg_entry;
                    if dd > pos.max_adverse_excursion {
                        pos.max_adverse_excursion = dd;
                    }
                }
            }
        }

        let open_positions = self
            .positions
            .values()
            .map(|p| {
                let entry_value = p.avg_entry * p.qty;
                let pnl = (p.current_price - p.avg_entry) * p.qty;
                OpenPosition {
                    symbol: p.symbol.clone(),
                    side: p.side.clone(),
                    qty: p.qty,
                    avg_entry: p.avg_entry,
                    current_price: p.current_price,
                    unrealized_pnl: pnl,
                    unrealized_pnl_pct: if entry_value > 0.0 { pnl / entry_value } else { 0.0 },
                    intent: p.intent,
                    stop_loss: p.stop_loss,
                    take_profit: p.take_profit,
                    opened_at: p.opened_at,
                    tag: p.tag.clone(),
                }
            })
            .collect();

        let trade_rows = self
            .store
            .fetch_all(
                "SELECT * FROM trades WHERE closed_at IS NOT NULL ORDER BY closed_at DESC LIMIT 100",
                &[],
            )
            .await?;
        let recent_trades = trade_rows
            .iter()
            .map(|t| ClosedTrade {
                symbol: t.str_or("symbol", ""),
                side: t.str_or("side", "long"),
                qty: t.f64("qty"),
                entry_price: t.f64("entry_price"),
                exit_price: t.f64("exit_price"),
                pnl: t.f64("pnl"),
                pnl_pct: t.f64("pnl_pct"),
                fees: t.f64("fees"),
                intent: Intent::parse_lossy(&t.str_or("intent", "DAY")),
                opened_at: t
                    .opt_str("opened_at")
                    .and_then(|s| parse_utc_lossy(&s))
                    .unwrap_or_else(Utc::now),
                closed_at: t
                    .opt_str("closed_at")
                    .and_then(|s| parse_utc_lossy(&s))
                    .unwrap_or_else(Utc::now),
            })
            .collect();

        let total_value = self.total_value();
        Ok(PortfolioView {
            cash: self.cash,
            total_value,
            positions: open_positions,
            recent_trades,
            daily_pnl: total_value - self.daily_start_value,
            total_pnl: total_value - self.starting_cash,
            fees_today: self.fees_today,
        })
    }

    /// Execute a validated, clamped signal. Returns one result per fill
    /// (CLOSE without a tag can close several positions).
    pub async fn execute_signal(
        &mut self,
        signal: &Signal,
        current_price: f64,
        maker_fee_pct: f64,
        taker_fee_pct: f64,
        strategy_regime: Option<&str>,
    ) -> Result<Vec<TradeResult>> {
        match signal.action {
            Action::Buy => Ok(self
                .execute_buy(signal, current_price, maker_fee_pct, taker_fee_pct)
                .await?
                .into_iter()
                .collect()),
            Action::Sell => Ok(self
                .execute_sell(signal, current_price, maker_fee_pct, taker_fee_pct, strategy_regime)
                .await?
                .into_iter()
                .collect()),
            Action::Close => {
                self.execute_close(signal, current_price, maker_fee_pct, taker_fee_pct, strategy_regime)
                    .await
            }
            Action::Modify => Ok(self.execute_modify(signal).await?.into_iter().collect()),
        }
    }

    async fn execute_buy(
        &mut self,
        signal: &Signal,
        price: f64,
        maker_fee_pct: f64,
        taker_fee_pct: f64,
    ) -> Result<Option<TradeResult>> {
        if price <= 0.0 {
            warn!(symbol = %signal.symbol, "buy skipped: invalid price");
            return Ok(None);
        }
        let portfolio_value = self.total_value();
        let trade_value = portfolio_value * signal.size_pct;
        let fee_pct = fills::fee_pct(signal.order_type, maker_fee_pct, taker_fee_pct);
        let fee = fills::fee_amount(trade_value, fee_pct);

        if trade_value + fee > self.cash {
            warn!(
                needed = format!("{:.2}", trade_value + fee),
                available = format!("{:.2}", self.cash),
                "buy rejected: insufficient cash"
            );
            return Ok(None);
        }

        let fill_price = if self.config.is_paper() {
            fills::entry_fill_price(
                price,
                signal.order_type,
                signal.limit_price,
                fills::slippage_for(signal, self.config.default_slippage_factor),
            )
        } else {
            self.place_live_order(signal, "buy", trade_value / price, price)
                .await?
                .unwrap_or(price)
        };
        let qty = trade_value / fill_price;

        self.cash -= qty * fill_price + fee;
        self.fees_today += fee;

        let now = Utc::now();
        let tag = match &signal.tag {
            Some(tag) => tag.clone(),
            None => self.next_auto_tag(&signal.symbol),
        };

        if let Some(existing) = self.positions.get_mut(&tag) {
            // Average in
            let total_qty = existing.qty + qty;
            existing.avg_entry =
                (existing.avg_entry * existing.qty + fill_price * qty) / total_qty;
            existing.qty = total_qty;
            existing.entry_fee += fee;
            existing.current_price = fill_price;
            if signal.stop_loss.is_some() {
                existing.stop_loss = signal.stop_loss;
            }
            if signal.take_profit.is_some() {
                existing.take_profit = signal.take_profit;
            }
            existing.updated_at = now;
        } else {
            self.positions.insert(
                tag.clone(),
                Position {
                    symbol: signal.symbol.clone(),
                    tag: tag.clone(),
                    side: "long".to_string(),
                    qty,
                    avg_entry: fill_price,
                    current_price: fill_price,
                    entry_fee: fee,
                    stop_loss: signal.stop_loss,
                    take_profit: signal.take_profit,
                    intent: signal.intent,
                    strategy_version: self.strategy_version.clone(),
                    opened_at: now,
                    updated_at: now,
                    max_adverse_excursion: 0.0,
                },
            );
        }

        self.persist_position(&tag).await?;

        // Live mode: mirror SL/TP as exchange-native conditional orders so
        // stops survive even if this process dies
        if !self.config.is_paper()
            && (signal.stop_loss.is_some() || signal.take_profit.is_some())
        {
            if let Err(e) = self.place_conditional_orders(&tag, signal, qty).await {
                warn!(tag = %tag, error = %e, "conditional order placement failed");
            }
        }

        info!(
            symbol = %signal.symbol,
            qty = format!("{qty:.8}"),
            price = format!("{fill_price:.2}"),
            fee = format!("{fee:.4}"),
            tag = %tag,
            intent = %signal.intent,
            "buy filled"
        );

        Ok(Some(TradeResult {
            symbol: signal.symbol.clone(),
            action: Action::Buy,
            qty,
            price: fill_price,
            fee,
            pnl: None,
            pnl_pct: None,
            intent: signal.intent,
            tag,
            close_reason: None,
        }))
    }

    /// SELL: partial by value when 0 < size_pct < 1, else the whole
    /// position. Targets the tag when given, otherwise the oldest open
    /// position for the symbol (FIFO).
    async fn execute_sell(
        &mut self,
        signal: &Signal,
        price: f64,
        maker_fee_pct: f64,
        taker_fee_pct: f64,
        strategy_regime: Option<&str>,
    ) -> Result<Option<TradeResult>> {
        let Some(tag) = self.resolve_target(signal) else {
            warn!(symbol = %signal.symbol, "sell skipped: no open position");
            return Ok(None);
        };

        let pos_qty = self.positions[&tag].qty;
        let est_qty = if signal.size_pct > 0.0 && signal.size_pct < 1.0 {
            (self.total_value() * signal.size_pct / price).min(pos_qty)
        } else {
            pos_qty
        };
        let fill_price = self.resolve_exit_fill(signal, price, est_qty).await?;
        let qty = if signal.size_pct > 0.0 && signal.size_pct < 1.0 {
            let sell_value = self.total_value() * signal.size_pct;
            (sell_value / fill_price).min(pos_qty)
        } else {
            pos_qty
        };

        self.close_qty(
            &tag,
            qty,
            fill_price,
            fills::fee_pct(signal.order_type, maker_fee_pct, taker_fee_pct),
            Action::Sell,
            "signal",
            strategy_regime,
        )
        .await
        .map(Some)
    }

    /// CLOSE with a tag closes that position; without a tag it closes every
    /// position for the symbol.
    async fn execute_close(
        &mut self,
        signal: &Signal,
        price: f64,
        maker_fee_pct: f64,
        taker_fee_pct: f64,
        strategy_regime: Option<&str>,
    ) -> Result<Vec<TradeResult>> {
        let targets: Vec<String> = match &signal.tag {
            Some(tag) if self.positions.contains_key(tag) => vec![tag.clone()],
            Some(tag) => {
                warn!(tag = %tag, "close skipped: unknown tag");
                return Ok(Vec::new());
            }
            None => {
                let mut tags: Vec<&Position> = self
                    .positions
                    .values()
                    .filter(|p| p.symbol == signal.symbol)
                    .collect();
                tags.sort_by_key(|p| p.opened_at);
                tags.iter().map(|p| p.tag.clone()).collect()
            }
        };
        if targets.is_empty() {
            warn!(symbol = %signal.symbol, "close skipped: no open position");
            return Ok(Vec::new());
        }

        let total_qty: f64 = targets.iter().map(|t| self.positions[t].qty).sum();
        let fill_price = self.resolve_exit_fill(signal, price, total_qty).await?;
        let fee_pct = fills::fee_pct(signal.order_type, maker_fee_pct, taker_fee_pct);
        let mut results = Vec::new();
        for tag in targets {
            let qty = self.positions[&tag].qty;
            let result = self
                .close_qty(&tag, qty, fill_price, fee_pct, Action::Close, "signal", strategy_regime)
                .await?;
            results.push(result);
        }
        Ok(results)
    }

    async fn execute_modify(&mut self, signal: &Signal) -> Result<Option<TradeResult>> {
        let Some(tag) = signal.tag.as_ref().filter(|t| self.positions.contains_key(*t)) else {
            warn!(symbol = %signal.symbol, "modify skipped: requires an existing tag");
            return Ok(None);
        };
        let pos = self.positions.get_mut(tag).expect("checked above");
        if signal.stop_loss.is_some() {
            pos.stop_loss = signal.stop_loss;
        }
        if signal.take_profit.is_some() {
            pos.take_profit = signal.take_profit;
        }
        pos.intent = signal.intent;
        pos.updated_at = Utc::now();
        let symbol = pos.symbol.clone();
        let intent = pos.intent;
        let tag = tag.clone();
        self.persist_position(&tag).await?;

        Ok(Some(TradeResult {
            symbol,
            action: Action::Modify,
            qty: 0.0,
            price: 0.0,
            fee: 0.0,
            pnl: None,
            pnl_pct: None,
            intent,
            tag,
            close_reason: None,
        }))
    }

    /// SELL target resolution: explicit tag, else FIFO oldest for symbol.
    fn resolve_target(&self, signal: &Signal) -> Option<String> {
        if let Some(tag) = &signal.tag {
            return self.positions.contains_key(tag).then(|| tag.clone());
        }
        self.positions
            .values()
            .filter(|p| p.symbol == signal.symbol)
            .min_by_key(|p| p.opened_at)
            .map(|p| p.tag.clone())
    }

    async fn resolve_exit_fill(&mut self, signal: &Signal, price: f64, volume: f64) -> Result<f64> {
        if self.config.is_paper() {
            Ok(fills::exit_fill_price(
                price,
                signal.order_type,
                signal.limit_price,
                fills::slippage_for(signal, self.config.default_slippage_factor),
            ))
        } else {
            Ok(self
                .place_live_order(signal, "sell", volume, price)
                .await?
                .unwrap_or(price))
        }
    }

    /// Close `qty` of the tagged position at `fill_price`, recording the
    /// trade with fee-accurate P&L.
    pub async fn close_qty(
        &mut self,
        tag: &str,
        qty: f64,
        fill_price: f64,
        exit_fee_pct: f64,
        action: Action,
        close_reason: &str,
        strategy_regime: Option<&str>,
    ) -> Result<TradeResult> {
        let pos = self
            .positions
            .get(tag)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no position with tag {tag}"))?;

        let sale = qty * fill_price;
        let exit_fee = fills::fee_amount(sale, exit_fee_pct);
        let (pnl, pnl_pct, entry_fee_portion) =
            fills::realized_pnl(fill_price, pos.avg_entry, qty, pos.qty, pos.entry_fee, exit_fee);
        let total_fee = entry_fee_portion + exit_fee;

        self.cash += sale - exit_fee;
        self.fees_today += exit_fee;

        let now = fmt_utc(Utc::now());
        self.store
            .exec(
                "INSERT INTO trades \
                 (symbol, side, qty, entry_price, exit_price, pnl, pnl_pct, fees, intent, \
                  strategy_version, strategy_regime, tag, close_reason, max_adverse_excursion, \
                  opened_at, closed_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                &[
                    json!(pos.symbol),
                    json!(pos.side),
                    json!(qty),
                    json!(pos.avg_entry),
                    json!(fill_price),
                    json!(pnl),
                    json!(pnl_pct),
                    json!(total_fee),
                    json!(pos.intent.as_str()),
                    pos.strategy_version
                        .as_ref()
                        .map(|v| json!(v))
                        .unwrap_or(Value::Null),
                    strategy_regime.map(|r| json!(r)).unwrap_or(Value::Null),
                    json!(tag),
                    json!(close_reason),
                    json!(pos.max_adverse_excursion),
                    json!(fmt_utc(pos.opened_at)),
                    json!(now),
                ],
            )
            .await?;

        let remaining = pos.qty - qty;
        if remaining <= fills::QTY_EPSILON {
            self.positions.remove(tag);
            self.store
                .exec("DELETE FROM positions WHERE tag = ?", &[json!(tag)])
                .await?;
            if !self.config.is_paper() {
                self.cancel_conditional_orders(tag).await;
            }
        } else {
            let p = self.positions.get_mut(tag).expect("checked above");
            p.qty = remaining;
            p.entry_fee = pos.entry_fee - entry_fee_portion;
            p.updated_at = Utc::now();
            self.store
                .exec(
                    "UPDATE positions SET qty = ?, entry_fee = ?, updated_at = ? WHERE tag = ?",
                    &[json!(remaining), json!(p.entry_fee), json!(now), json!(tag)],
                )
                .await?;
        }

        info!(
            symbol = %pos.symbol,
            qty = format!("{qty:.8}"),
            price = format!("{fill_price:.2}"),
            pnl = format!("{pnl:.4}"),
            fee = format!("{exit_fee:.4}"),
            reason = close_reason,
            "position closed"
        );

        Ok(TradeResult {
            symbol: pos.symbol,
            action,
            qty,
            price: fill_price,
            fee: exit_fee,
            pnl: Some(pnl),
            pnl_pct: Some(pnl_pct),
            intent: pos.intent,
            tag: tag.to_string(),
            close_reason: Some(close_reason.to_string()),
        })
    }

    /// Live-mode order placement with fill confirmation. Returns the fill
    /// price when confirmed within the timeout.
    async fn place_live_order(
        &mut self,
        signal: &Signal,
        side: &str,
        volume: f64,
        quote: f64,
    ) -> Result<Option<f64>> {
        let Some(exchange) = self.exchange.clone() else {
            anyhow::bail!("live mode requires an exchange client");
        };
        let order_type = match signal.order_type {
            OrderType::Market => "market",
            OrderType::Limit => "limit",
        };
        let limit_price = match signal.order_type {
            OrderType::Limit => Some(signal.limit_price.unwrap_or(quote)),
            OrderType::Market => None,
        };
        let txid = exchange
            .place_order(&signal.symbol, side, order_type, volume, limit_price)
            .await
            .map_err(|e| anyhow::anyhow!("order placement failed: {e}"))?;

        self.store
            .exec(
                "INSERT OR REPLACE INTO orders (txid, tag, symbol, side, order_type, volume, status, purpose) \
                 VALUES (?, ?, ?, ?, ?, ?, 'pending', ?)",
                &[
                    json!(txid),
                    signal.tag.as_ref().map(|t| json!(t)).unwrap_or(Value::Null),
                    json!(signal.symbol),
                    json!(side),
                    json!(order_type),
                    json!(volume),
                    json!(if side == "buy" { "entry" } else { "exit" }),
                ],
            )
            .await?;

        // Poll for the fill; partial fills surface through filled_volume.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
        loop {
            match exchange.query_order(&txid).await {
                Ok(fill) if fill.status == "filled" && fill.filled_volume > 0.0 => {
                    self.store
                        .exec(
                            "UPDATE orders SET status = 'filled', filled_volume = ?, \
                             avg_fill_price = ?, fee = ?, filled_at = ? WHERE txid = ?",
                            &[
                                json!(fill.filled_volume),
                                json!(fill.avg_fill_price),
                                json!(fill.fee),
                                json!(fmt_utc(Utc::now())),
                                json!(txid),
                            ],
                        )
                        .await?;
                    return Ok(Some(fill.avg_fill_price));
                }
                Ok(_) => {}
                Err(e) => warn!(txid = %txid, error = %e, "fill query failed"),
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(txid = %txid, "fill confirmation timed out; using quoted price");
                self.store
                    .exec(
                        "UPDATE orders SET status = 'timeout' WHERE txid = ?",
                        &[json!(txid)],
                    )
                    .await?;
                return Ok(None);
            }
            tokio::time::sleep(Duration::from_secs(2)).await;
        }
    }

    /// Best-effort cancellation of a closed position's exchange-native
    /// SL/TP orders.
    async fn cancel_conditional_orders(&self, tag: &str) {
        let Some(exchange) = self.exchange.clone() else {
            return;
        };
        let row = match self
            .store
            .fetch_one(
                "SELECT sl_txid, tp_txid FROM conditional_orders WHERE tag = ? AND status = 'active'",
                &[json!(tag)],
            )
            .await
        {
            Ok(Some(row)) => row,
            _ => return,
        };
        for key in ["sl_txid", "tp_txid"] {
            if let Some(txid) = row.opt_str(key) {
                if let Err(e) = exchange.cancel_order(&txid).await {
                    warn!(tag, %txid, error = %e, "conditional order cancel failed");
                }
            }
        }
        let _ = self
            .store
            .exec(
                "UPDATE conditional_orders SET status = 'canceled', updated_at = ? WHERE tag = ?",
                &[json!(fmt_utc(Utc::now())), json!(tag)],
            )
            .await;
    }

    /// Exchange-native SL/TP orders for a live position, tracked in
    /// `conditional_orders`.
    async fn place_conditional_orders(
        &mut self,
        tag: &str,
        signal: &Signal,
        qty: f64,
    ) -> Result<()> {
        let Some(exchange) = self.exchange.clone() else {
            return Ok(());
        };
        let mut sl_txid = None;
        if let Some(sl) = signal.stop_loss {
            sl_txid = Some(
                exchange
                    .place_order(&signal.symbol, "sell", "stop-loss", qty, Some(sl))
                    .await
                    .map_err(|e| anyhow::anyhow!("stop-loss order: {e}"))?,
            );
        }
        let mut tp_txid = None;
        if let Some(tp) = signal.take_profit {
            tp_txid = Some(
                exchange
                    .place_order(&signal.symbol, "sell", "take-profit", qty, Some(tp))
                    .await
                    .map_err(|e| anyhow::anyhow!("take-profit order: {e}"))?,
            );
        }
        self.store
            .exec(
                "INSERT OR REPLACE INTO conditional_orders \
                 (tag, symbol, sl_txid, tp_txid, sl_price, tp_price, status) \
                 VALUES (?, ?, ?, ?, ?, ?, 'active')",
                &[
                    json!(tag),
                    json!(signal.symbol),
                    sl_txid.map(|t| json!(t)).unwrap_or(Value::Null),
                    tp_txid.map(|t| json!(t)).unwrap_or(Value::Null),
                    signal.stop_loss.map(|v| json!(v)).unwrap_or(Value::Null),
                    signal.take_profit.map(|v| json!(v)).unwrap_or(Value::Null),
                ],
            )
            .await?;
        Ok(())
    }

    /// Update prices, advance MAE, and collect SL/TP crossings. The caller
    /// issues the CLOSE signals.
    pub async fn update_prices(&mut self, prices: &HashMap<String, f64>) -> Vec<SlTpTrigger> {
        let mut triggered = Vec::new();
        for pos in self.positions.values_mut() {
            let Some(&price) = prices.get(&pos.symbol) else {
                continue;
            };
            pos.current_price = price;
            if price < pos.avg_entry && pos.avg_entry > 0.0 {
                let dd = (pos.avg_entry - price) / pos.avg_entry;
                if dd > pos.max_adverse_excursion {
                    pos.max_adverse_excursion = dd;
                }
            }

            if let Some(sl) = pos.stop_loss {
                if price <= sl {
                    triggered.push(SlTpTrigger {
                        symbol: pos.symbol.clone(),
                        tag: pos.tag.clone(),
                        reason: "stop_loss".to_string(),
                        price: sl,
                    });
                    continue;
                }
            }
            if let Some(tp) = pos.take_profit {
                if price >= tp {
                    triggered.push(SlTpTrigger {
                        symbol: pos.symbol.clone(),
                        tag: pos.tag.clone(),
                        reason: "take_profit".to_string(),
                        price: tp,
                    });
                }
            }
        }
        triggered
    }

    pub fn reset_daily(&mut self) {
        self.fees_today = 0.0;
    }

    /// End-of-day snapshot in the configured timezone. Also rolls the
    /// daily-start baseline forward.
    pub async fn snapshot_daily(&mut self) -> Result<()> {
        let tz = self.config.tz();
        let today = crate::domain::time::local_date_string(tz);
        let boundary = fmt_utc(local_midnight_utc(tz));

        let tv = self.total_value();
        let trades = self
            .store
            .fetch_all(
                "SELECT pnl, fees FROM trades WHERE datetime(closed_at) >= datetime(?) AND pnl IS NOT NULL",
                &[json!(boundary)],
            )
            .await?;
        let total = trades.len() as i64;
        let wins = trades.iter().filter(|t| t.f64("pnl") > 0.0).count() as i64;
        let losses = total - wins;
        // trade.pnl already has fees subtracted, so the sum IS net
        let net: f64 = trades.iter().map(|t| t.f64("pnl")).sum();
        let fees_from_trades: f64 = trades.iter().map(|t| t.f64("fees")).sum();
        let gross_before_fees = net + fees_from_trades;

        self.store
            .exec(
                "INSERT OR REPLACE INTO daily_performance \
                 (date, portfolio_value, cash, total_trades, wins, losses, gross_pnl, net_pnl, \
                  fees_total, win_rate, strategy_version) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                &[
                    json!(today),
                    json!(tv),
                    json!(self.cash),
                    json!(total),
                    json!(wins),
                    json!(losses),
                    json!(gross_before_fees),
                    json!(net),
                    json!(self.fees_today),
                    json!(if total > 0 { wins as f64 / total as f64 } else { 0.0 }),
                    self.strategy_version
                        .as_ref()
                        .map(|v| json!(v))
                        .unwrap_or(Value::Null),
                ],
            )
            .await?;
        self.daily_start_value = tv;
        info!(
            value = format!("{tv:.2}"),
            trades = total,
            pnl = format!("{net:.4}"),
            "daily snapshot"
        );
        Ok(())
    }

    async fn persist_position(&self, tag: &str) -> Result<()> {
        let Some(pos) = self.positions.get(tag) else {
            return Ok(());
        };
        self.store
            .exec(
                "INSERT OR REPLACE INTO positions \
                 (symbol, tag, side, qty, avg_entry, current_price, unrealized_pnl, entry_fee, \
                  stop_loss, take_profit, intent, strategy_version, max_adverse_excursion, \
                  opened_at, updated_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                &[
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
                    pos.strategy_version
                        .as_ref()
                        .map(|v| json!(v))
                        .unwrap_or(Value::Null),
                    json!(pos.max_adverse_excursion),
                    json!(fmt_utc(pos.opened_at)),
                    json!(fmt_utc(pos.updated_at)),
                ],
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::contract::OrderType;

    fn paper_config() -> Config {
        let mut config = Config::default();
        config.paper_balance_usd = 1000.0;
        config.default_slippage_factor = 0.0005;
        config
    }

    fn buy_signal(symbol: &str, size_pct: f64, tag: Option<&str>) -> Signal {
        Signal {
            symbol: symbol.to_string(),
            action: Action::Buy,
            size_pct,
            order_type: OrderType::Market,
            limit_price: None,
            stop_loss: None,
            take_profit: None,
            intent: Intent::Day,
            confidence: 0.8,
            reasoning: String::new(),
            slippage_tolerance: None,
            tag: tag.map(str::to_string),
        }
    }

    async fn tracker() -> PortfolioTracker {
        let store = Store::connect_memory().await.unwrap();
        let mut t = PortfolioTracker::new(paper_config(), store, None);
        t.initialize().await.unwrap();
        t
    }

    #[tokio::test]
    async fn buy_then_close_at_profit_matches_fee_math() {
        let mut t = tracker().await;

        let results = t
            .execute_signal(&buy_signal("BTC/USD", 0.05, None), 50_000.0, 0.25, 0.40, None)
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        let buy = &results[0];
        assert!((buy.price - 50_025.0).abs() < 1e-6);
        assert!((buy.fee - 0.20).abs() < 1e-6);
        assert!((t.cash() - 949.80).abs() < 1e-6);

        let close = Signal {
            action: Action::Close,
            ..buy_signal("BTC/USD", 1.0, None)
        };
        let results = t
            .execute_signal(&close, 51_000.0, 0.25, 0.40, None)
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        let closed = &results[0];
        assert!((closed.price - 50_974.5).abs() < 1e-6);
        let pnl = closed.pnl.unwrap();
        assert!(
            (pnl - 0.545).abs() < 0.01,
            "expected ~+0.545, got {pnl}"
        );
        assert!((t.cash() - 1000.55).abs() < 0.01, "cash {}", t.cash());
        assert_eq!(t.position_count(), 0);
        assert_eq!(closed.close_reason.as_deref(), Some("signal"));
    }

    #[tokio::test]
    async fn flat_trade_loses_the_fee_drag() {
        let mut t = tracker().await;
        t.execute_signal(&buy_signal("BTC/USD", 0.05, None), 50_000.0, 0.25, 0.40, None)
            .await
            .unwrap();
        let close = Signal {
            action: Action::Close,
            ..buy_signal("BTC/USD", 1.0, None)
        };
        t.execute_signal(&close, 50_000.0, 0.25, 0.40, None)
            .await
            .unwrap();
        // Two 0.4% fees on ~$50 plus slippage both ways
        assert!(t.cash() < 1000.0);
        assert!(
            (1000.0 - t.cash() - (2.0 * 0.004 * 50.0 + 0.05)).abs() < 0.02,
            "drag was {}",
            1000.0 - t.cash()
        );
    }

    #[tokio::test]
    async fn sell_without_tag_closes_fifo_then_close_rest() {
        let mut t = tracker().await;
        t.execute_signal(&buy_signal("BTC/USD", 0.03, Some("a")), 50_000.0, 0.25, 0.40, None)
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        t.execute_signal(&buy_signal("BTC/USD", 0.03, Some("b")), 51_000.0, 0.25, 0.40, None)
            .await
            .unwrap();
        assert_eq!(t.position_count(), 2);

        let sell = Signal {
            action: Action::Sell,
            size_pct: 1.0,
            ..buy_signal("BTC/USD", 1.0, None)
        };
        let results = t.execute_signal(&sell, 52_000.0, 0.25, 0.40, None).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].tag, "a", "FIFO closes the oldest first");

        let close = Signal {
            action: Action::Close,
            ..buy_signal("BTC/USD", 1.0, None)
        };
        let results = t.execute_signal(&close, 53_000.0, 0.25, 0.40, None).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].tag, "b");
        assert_eq!(t.position_count(), 0);

        let rows = t
            .store
            .fetch_all("SELECT tag FROM trades ORDER BY id", &[])
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn buy_with_same_tag_averages_in() {
        let mut t = tracker().await;
        t.execute_signal(&buy_signal("ETH/USD", 0.05, Some("e1")), 2000.0, 0.25, 0.40, None)
            .await
            .unwrap();
        t.execute_signal(&buy_signal("ETH/USD", 0.05, Some("e1")), 2200.0, 0.25, 0.40, None)
            .await
            .unwrap();
        assert_eq!(t.position_count(), 1);
        let pos = t.positions().get("e1").unwrap();
        assert!(pos.avg_entry > 2000.0 && pos.avg_entry < 2200.0);
    }

    #[tokio::test]
    async fn partial_sell_apportions_entry_fee() {
        let mut t = tracker().await;
        t.execute_signal(&buy_signal("BTC/USD", 0.10, Some("p")), 50_000.0, 0.25, 0.40, None)
            .await
            .unwrap();
        let entry_fee_before = t.positions().get("p").unwrap().entry_fee;

        let sell = Signal {
            action: Action::Sell,
            size_pct: 0.05,
            ..buy_signal("BTC/USD", 0.05, Some("p"))
        };
        let results = t.execute_signal(&sell, 50_000.0, 0.25, 0.40, None).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(t.position_count(), 1, "partial close keeps the position");
        let entry_fee_after = t.positions().get("p").unwrap().entry_fee;
        assert!(entry_fee_after < entry_fee_before);
        assert!(entry_fee_after > 0.0);
    }

    #[tokio::test]
    async fn modify_updates_stops_without_fees() {
        let mut t = tracker().await;
        t.execute_signal(&buy_signal("BTC/USD", 0.05, Some("m")), 50_000.0, 0.25, 0.40, None)
            .await
            .unwrap();
        let cash_before = t.cash();

        let modify = Signal {
            action: Action::Modify,
            size_pct: 0.0,
            stop_loss: Some(48_000.0),
            take_profit: Some(55_000.0),
            ..buy_signal("BTC/USD", 0.0, Some("m"))
        };
        let results = t.execute_signal(&modify, 50_000.0, 0.25, 0.40, None).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].fee, 0.0);
        assert_eq!(t.cash(), cash_before);
        let pos = t.positions().get("m").unwrap();
        assert_eq!(pos.stop_loss, Some(48_000.0));
        assert_eq!(pos.take_profit, Some(55_000.0));

        // MODIFY without a tag is a no-op
        let mut untagged = modify.clone();
        untagged.tag = None;
        let results = t.execute_signal(&untagged, 50_000.0, 0.25, 0.40, None).await.unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn sl_tp_triggers_report_threshold_price() {
        let mut t = tracker().await;
        let mut sig = buy_signal("BTC/USD", 0.05, Some("s"));
        sig.stop_loss = Some(49_000.0);
        sig.take_profit = Some(55_000.0);
        t.execute_signal(&sig, 50_000.0, 0.25, 0.40, None).await.unwrap();

        let mut prices = HashMap::new();
        prices.insert("BTC/USD".to_string(), 48_900.0);
        let triggered = t.update_prices(&prices).await;
        assert_eq!(triggered.len(), 1);
        assert_eq!(triggered[0].reason, "stop_loss");
        assert_eq!(triggered[0].price, 49_000.0);
        assert_eq!(triggered[0].tag, "s");
    }

    #[tokio::test]
    async fn mae_never_decreases() {
        let mut t = tracker().await;
        t.execute_signal(&buy_signal("BTC/USD", 0.05, Some("x")), 50_000.0, 0.25, 0.40, None)
            .await
            .unwrap();

        let mut prices = HashMap::new();
        prices.insert("BTC/USD".to_string(), 45_000.0);
        t.update_prices(&prices).await;
        let deep = t.positions().get("x").unwrap().max_adverse_excursion;
        assert!(deep > 0.09);

        prices.insert("BTC/USD".to_string(), 49_999.0);
        t.update_prices(&prices).await;
        let after_recovery = t.positions().get("x").unwrap().max_adverse_excursion;
        assert_eq!(deep, after_recovery, "MAE is monotone while open");
    }

    #[tokio::test]
    async fn insufficient_cash_rejects_buy() {
        let mut t = tracker().await;
        // Drain cash with a first large buy
        for tag in ["a", "b", "c", "d"] {
            t.execute_signal(&buy_signal("BTC/USD", 0.24, Some(tag)), 50_000.0, 0.25, 0.40, None)
                .await
                .unwrap();
        }
        let before = t.position_count();
        let results = t
            .execute_signal(&buy_signal("BTC/USD", 0.9, Some("z")), 50_000.0, 0.25, 0.40, None)
            .await
            .unwrap();
        assert!(results.is_empty());
        assert_eq!(t.position_count(), before);
    }

    #[tokio::test]
    async fn mass_conservation_over_a_trade_sequence() {
        let mut t = tracker().await;
        t.execute_signal(&buy_signal("BTC/USD", 0.05, Some("m1")), 50_000.0, 0.25, 0.40, None)
            .await
            .unwrap();
        t.execute_signal(&buy_signal("ETH/USD", 0.05, Some("m2")), 2_000.0, 0.25, 0.40, None)
            .await
            .unwrap();
        let close = Signal {
            action: Action::Close,
            ..buy_signal("BTC/USD", 1.0, None)
        };
        t.execute_signal(&close, 51_000.0, 0.25, 0.40, None).await.unwrap();

        // cash + position notional - realized pnl - fees paid == starting cash
        let rows = t.store.fetch_all("SELECT pnl, fees FROM trades", &[]).await.unwrap();
        let realized: f64 = rows.iter().map(|r| r.f64("pnl")).sum();
        let notional: f64 = t.positions().values().map(|p| p.qty * p.avg_entry).sum();
        let entry_fees_open: f64 = t.positions().values().map(|p| p.entry_fee).sum();
        let balance = t.cash() + notional + entry_fees_open - realized;
        assert!(
            (balance - 1000.0).abs() < 1e-6,
            "conservation violated: {balance}"
        );
    }
}
