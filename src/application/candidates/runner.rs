//! Candidate runner: isolated paper simulation for one candidate slot.
//!
//! Each runner owns private cash and positions and trades the same market
//! snapshot as the fund, with the same fill/slippage/fee rules. No exchange
//! calls, no fund state, no store handle: the manager persists snapshots.
//! Stats come from `all_trades`, which survives persistence; the
//! `new_trades` buffer is what gets flushed and cleared.

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::collections::HashMap;
use tracing::{info, warn};

use crate::application::trading::fills;
use crate::application::trading::Position;
use crate::domain::contract::{
    Action, Intent, OpenPosition, PortfolioView, RiskLimits, Signal, Strategy, SymbolData,
};

/// A completed candidate trade, kept as a record for persistence and stats.
#[derive(Debug, Clone)]
pub struct CandidateTrade {
    pub symbol: String,
    pub tag: String,
    pub qty: f64,
    pub entry_price: f64,
    pub exit_price: f64,
    pub pnl: f64,
    pub pnl_pct: f64,
    pub fees: f64,
    pub intent: Intent,
    pub close_reason: String,
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
    pub max_adverse_excursion: f64,
}

/// Signal record buffered for persistence, acted on or not.
#[derive(Debug, Clone)]
pub struct CandidateSignalRecord {
    pub symbol: String,
    pub action: String,
    pub size_pct: f64,
    pub confidence: f64,
    pub intent: String,
    pub reasoning: String,
    pub strategy_regime: Option<String>,
    pub acted_on: bool,
    pub rejected_reason: Option<String>,
    pub tag: Option<String>,
}

pub struct CandidateRunner {
    pub slot: u32,
    pub version: String,
    strategy: Box<dyn Strategy>,
    code: String,
    cash: f64,
    positions: HashMap<String, Position>,
    new_trades: Vec<CandidateTrade>,
    all_trades: Vec<CandidateTrade>,
    pending_signals: Vec<CandidateSignalRecord>,
    risk_limits: RiskLimits,
    slippage: f64,
    maker_fee_pct: f64,
    taker_fee_pct: f64,
    tag_counter: HashMap<String, u32>,
    current_regime: Option<String>,
}

impl CandidateRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        slot: u32,
        strategy: Box<dyn Strategy>,
        code: String,
        version: String,
        initial_cash: f64,
        initial_positions: Vec<Position>,
        risk_limits: RiskLimits,
        slippage: f64,
        maker_fee_pct: f64,
        taker_fee_pct: f64,
    ) -> Self {
        let mut runner = Self {
            slot,
            version: version.clone(),
            strategy,
            code,
            cash: initial_cash,
            positions: HashMap::new(),
            new_trades: Vec::new(),
            all_trades: Vec::new(),
            pending_signals: Vec::new(),
            risk_limits,
            slippage,
            maker_fee_pct,
            taker_fee_pct,
            tag_counter: HashMap::new(),
            current_regime: None,
        };
        // Clone fund positions under the slot prefix so candidate tags can
        // never collide with the fund's
        for mut pos in initial_positions {
            let tag = format!("c{}_{}", slot, pos.tag);
            pos.tag = tag.clone();
            pos.strategy_version = Some(version.clone());
            runner.positions.insert(tag, pos);
        }
        runner
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn cash(&self) -> f64 {
        self.cash
    }

    pub fn positions(&self) -> &HashMap<String, Position> {
        &self.positions
    }

    pub fn total_value(&self) -> f64 {
        self.cash + self.positions.values().map(Position::market_value).sum::<f64>()
    }

    /// Used by recovery: install state directly instead of cloning.
    pub fn restore(
        &mut self,
        positions: HashMap<String, Position>,
        trades: Vec<CandidateTrade>,
        cash: f64,
    ) {
        self.positions = positions;
        self.all_trades = trades;
        self.cash = cash;
    }

    pub async fn initialize_strategy(&mut self, symbols: &[String]) -> anyhow::Result<()> {
        let limits = self.risk_limits;
        self.strategy.initialize(&limits, symbols).await
    }

    fn next_tag(&mut self, symbol: &str) -> String {
        let clean = symbol.replace('/', "");
        loop {
            let n = {
                let counter = self.tag_counter.entry(symbol.to_string()).or_insert(0);
                *counter += 1;
                *counter
            };
            let tag = format!("c{}_{}_{:03}", self.slot, clean, n);
            if !self.positions.contains_key(&tag) {
                return tag;
            }
        }
    }

    fn build_portfolio(&mut self, prices: &HashMap<String, f64>) -> PortfolioView {
        for pos in self.positions.values_mut() {
            if let Some(&price) = prices.get(&pos.symbol) {
                pos.current_price = price;
                if price < pos.avg_entry && pos.avg_entry > 0.0 {
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
                let pnl = (p.current_price - p.avg_entry) * p.qty;
                OpenPosition {
                    symbol: p.symbol.clone(),
                    side: p.side.clone(),
                    qty: p.qty,
                    avg_entry: p.avg_entry,
                    current_price: p.current_price,
                    unrealized_pnl: pnl,
                    unrealized_pnl_pct: if p.avg_entry > 0.0 {
                        p.current_price / p.avg_entry - 1.0
                    } else {
                        0.0
                    },
                    intent: p.intent,
                    stop_loss: p.stop_loss,
                    take_profit: p.take_profit,
                    opened_at: p.opened_at,
                    tag: p.tag.clone(),
                }
            })
            .collect();

        let total_pnl: f64 = self.all_trades.iter().map(|t| t.pnl).sum();
        PortfolioView {
            cash: self.cash,
            total_value: self.total_value(),
            positions: open_positions,
            recent_trades: Vec::new(),
            daily_pnl: 0.0,
            total_pnl,
            fees_today: 0.0,
        }
    }

    /// One scan tick: run the candidate strategy and paper-execute its
    /// signals against private state. Returns one summary line per
    /// executed fill, for logging and notifications.
    pub async fn run_scan(
        &mut self,
        markets: &HashMap<String, SymbolData>,
        timestamp: DateTime<Utc>,
    ) -> Vec<String> {
        let prices: HashMap<String, f64> = markets
            .iter()
            .map(|(symbol, data)| (symbol.clone(), data.current_price))
            .collect();
        let portfolio = self.build_portfolio(&prices);

        let signals = match self.strategy.analyze(markets, &portfolio, timestamp).await {
            Ok(signals) => signals,
            Err(e) => {
                warn!(slot = self.slot, error = %e, "candidate strategy error");
                return Vec::new();
            }
        };
        self.current_regime = self.strategy.regime();

        let mut executed = Vec::new();
        for signal in signals {
            let mut record = CandidateSignalRecord {
                symbol: signal.symbol.clone(),
                action: signal.action.to_string(),
                size_pct: signal.size_pct,
                confidence: signal.confidence,
                intent: signal.intent.as_str().to_string(),
                reasoning: signal.reasoning.clone(),
                strategy_regime: self.current_regime.clone(),
                acted_on: false,
                rejected_reason: None,
                tag: signal.tag.clone(),
            };

            if !markets.contains_key(&signal.symbol) {
                record.rejected_reason = Some("invalid_symbol".to_string());
                self.pending_signals.push(record);
                continue;
            }
            let price = prices.get(&signal.symbol).copied().unwrap_or(0.0);
            if price <= 0.0 {
                record.rejected_reason = Some("invalid_price".to_string());
                self.pending_signals.push(record);
                continue;
            }

            let results = self.execute_signal(&signal, price, timestamp);
            if results.is_empty() {
                record.rejected_reason = Some("execution_failed".to_string());
            } else {
                record.acted_on = true;
                if record.tag.is_none() {
                    record.tag = Some(results[0].clone());
                }
                for tag in &results {
                    executed.push(format!("{} {} [{}]", signal.action, signal.symbol, tag));
                }
            }
            self.pending_signals.push(record);
        }
        executed
    }

    /// Returns affected position tags (empty = rejected / no-op).
    fn execute_signal(&mut self, signal: &Signal, price: f64, ts: DateTime<Utc>) -> Vec<String> {
        match signal.action {
            Action::Buy => self.execute_buy(signal, price, ts).into_iter().collect(),
            Action::Sell => self.execute_sell(signal, price, ts).into_iter().collect(),
            Action::Close => self.execute_close(signal, price, ts),
            Action::Modify => self.execute_modify(signal).into_iter().collect(),
        }
    }

    fn execute_buy(&mut self, signal: &Signal, price: f64, ts: DateTime<Utc>) -> Option<String> {
        let is_new = signal
            .tag
            .as_ref()
            .map(|tag| !self.positions.contains_key(tag))
            .unwrap_or(true);
        if is_new && self.positions.len() >= self.risk_limits.max_positions {
            return None;
        }

        // Same clamp the fund's risk manager applies
        let size_pct = signal.size_pct.min(self.risk_limits.max_trade_pct);
        if size_pct <= 0.0 {
            return None;
        }
        let trade_value = self.total_value() * size_pct;
        let fee_pct = fills::fee_pct(signal.order_type, self.maker_fee_pct, self.taker_fee_pct);
        let fee = fills::fee_amount(trade_value, fee_pct);
        if trade_value + fee > self.cash {
            return None;
        }

        let fill_price = fills::entry_fill_price(
            price,
            signal.order_type,
            signal.limit_price,
            signal.slippage_tolerance.unwrap_or(self.slippage),
        );
        let qty = trade_value / fill_price;
        self.cash -= trade_value + fee;

        let tag = match &signal.tag {
            Some(tag) => tag.clone(),
            None => self.next_tag(&signal.symbol),
        };
        if let Some(existing) = self.positions.get_mut(&tag) {
            let total_qty = existing.qty + qty;
            existing.avg_entry = (existing.avg_entry * existing.qty + fill_price * qty) / total_qty;
            existing.qty = total_qty;
            existing.entry_fee += fee;
            existing.current_price = fill_price;
            if signal.stop_loss.is_some() {
                existing.stop_loss = signal.stop_loss;
            }
            if signal.take_profit.is_some() {
                existing.take_profit = signal.take_profit;
            }
            existing.updated_at = ts;
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
                    strategy_version: Some(self.version.clone()),
                    opened_at: ts,
                    updated_at: ts,
                    max_adverse_excursion: 0.0,
                },
            );
        }

        info!(
            slot = self.slot,
            symbol = %signal.symbol,
            qty = format!("{qty:.8}"),
            price = format!("{fill_price:.2}"),
            "candidate buy"
        );
        Some(tag)
    }

    fn execute_sell(&mut self, signal: &Signal, price: f64, ts: DateTime<Utc>) -> Option<String> {
        let tag = match &signal.tag {
            Some(tag) => {
                if !self.positions.contains_key(tag) {
                    return None;
                }
                tag.clone()
            }
            // FIFO: oldest open position for this symbol
            None => self
                .positions
                .values()
                .filter(|p| p.symbol == signal.symbol)
                .min_by_key(|p| p.opened_at)
                .map(|p| p.tag.clone())?,
        };

        let fill_price = fills::exit_fill_price(
            price,
            signal.order_type,
            signal.limit_price,
            signal.slippage_tolerance.unwrap_or(self.slippage),
        );
        let pos_qty = self.positions[&tag].qty;
        let qty = if signal.size_pct > 0.0 && signal.size_pct < 1.0 {
            (self.total_value() * signal.size_pct / fill_price).min(pos_qty)
        } else {
            pos_qty
        };
        let fee_pct = fills::fee_pct(signal.order_type, self.maker_fee_pct, self.taker_fee_pct);
        self.close_qty(&tag, qty, fill_price, fee_pct, "signal", ts);
        Some(tag)
    }

    fn execute_close(&mut self, signal: &Signal, price: f64, ts: DateTime<Utc>) -> Vec<String> {
        let targets: Vec<String> = match &signal.tag {
            Some(tag) => {
                if self.positions.contains_key(tag) {
                    vec![tag.clone()]
                } else {
                    Vec::new()
                }
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

        let fill_price = fills::exit_fill_price(
            price,
            signal.order_type,
            signal.limit_price,
            signal.slippage_tolerance.unwrap_or(self.slippage),
        );
        let fee_pct = fills::fee_pct(signal.order_type, self.maker_fee_pct, self.taker_fee_pct);
        for tag in &targets {
            let qty = self.positions[tag].qty;
            self.close_qty(tag, qty, fill_price, fee_pct, "signal", ts);
        }
        targets
    }

    fn execute_modify(&mut self, signal: &Signal) -> Option<String> {
        let tag = signal.tag.as_ref()?;
        let pos = self.positions.get_mut(tag)?;
        if signal.stop_loss.is_some() {
            pos.stop_loss = signal.stop_loss;
        }
        if signal.take_profit.is_some() {
            pos.take_profit = signal.take_profit;
        }
        pos.intent = signal.intent;
        Some(tag.clone())
    }

    fn close_qty(
        &mut self,
        tag: &str,
        qty: f64,
        fill_price: f64,
        exit_fee_pct: f64,
        close_reason: &str,
        ts: DateTime<Utc>,
    ) {
        let Some(pos) = self.positions.get(tag).cloned() else {
            return;
        };
        let sale = qty * fill_price;
        let exit_fee = fills::fee_amount(sale, exit_fee_pct);
        let (pnl, pnl_pct, entry_fee_portion) =
            fills::realized_pnl(fill_price, pos.avg_entry, qty, pos.qty, pos.entry_fee, exit_fee);
        self.cash += sale - exit_fee;

        let trade = CandidateTrade {
            symbol: pos.symbol.clone(),
            tag: tag.to_string(),
            qty,
            entry_price: pos.avg_entry,
            exit_price: fill_price,
            pnl,
            pnl_pct,
            fees: entry_fee_portion + exit_fee,
            intent: pos.intent,
            close_reason: close_reason.to_string(),
            opened_at: pos.opened_at,
            closed_at: ts,
            max_adverse_excursion: pos.max_adverse_excursion,
        };
        self.new_trades.push(trade.clone());
        self.all_trades.push(trade);

        let remaining = pos.qty - qty;
        if remaining <= fills::QTY_EPSILON {
            self.positions.remove(tag);
        } else if let Some(p) = self.positions.get_mut(tag) {
            p.qty = remaining;
            p.entry_fee = pos.entry_fee - entry_fee_portion;
            p.updated_at = ts;
        }

        info!(
            slot = self.slot,
            tag,
            pnl = format!("{pnl:.4}"),
            reason = close_reason,
            "candidate close"
        );
    }

    /// SL/TP sweep against private positions; the threshold is the trigger
    /// price, slippage applies on the close.
    pub fn check_sl_tp(&mut self, prices: &HashMap<String, f64>) -> Vec<CandidateTrade> {
        let before = self.new_trades.len();
        let tags: Vec<String> = self.positions.keys().cloned().collect();
        for tag in tags {
            let Some(pos) = self.positions.get_mut(&tag) else {
                continue;
            };
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

            let triggered = if pos.stop_loss.map(|sl| price <= sl).unwrap_or(false) {
                Some(("stop_loss", pos.stop_loss.unwrap()))
            } else if pos.take_profit.map(|tp| price >= tp).unwrap_or(false) {
                Some(("take_profit", pos.take_profit.unwrap()))
            } else {
                None
            };

            if let Some((reason, threshold)) = triggered {
                let qty = pos.qty;
                let fill_price = threshold * (1.0 - self.slippage);
                self.close_qty(&tag, qty, fill_price, self.taker_fee_pct, reason, Utc::now());
            }
        }
        self.new_trades[before..].to_vec()
    }

    /// Cumulative stats from the full trade history, stable across
    /// persistence cycles.
    pub fn status(&self) -> Value {
        let trade_count = self.all_trades.len();
        let wins = self.all_trades.iter().filter(|t| t.pnl > 0.0).count();
        let losses = self.all_trades.iter().filter(|t| t.pnl <= 0.0).count();
        let total_pnl: f64 = self.all_trades.iter().map(|t| t.pnl).sum();
        json!({
            "slot": self.slot,
            "version": self.version,
            "status": "running",
            "cash": (self.cash * 100.0).round() / 100.0,
            "total_value": (self.total_value() * 100.0).round() / 100.0,
            "position_count": self.positions.len(),
            "trade_count": trade_count,
            "wins": wins,
            "losses": losses,
            "pnl": (total_pnl * 10000.0).round() / 10000.0,
            "win_rate": if trade_count > 0 {
                (wins as f64 / trade_count as f64 * 10000.0).round() / 10000.0
            } else {
                0.0
            },
        })
    }

    /// Trades accumulated since the last persist, then clear the buffer.
    /// `all_trades` is untouched, so visible stats do not move.
    pub fn take_new_trades(&mut self) -> Vec<CandidateTrade> {
        std::mem::take(&mut self.new_trades)
    }

    pub fn take_new_signals(&mut self) -> Vec<CandidateSignalRecord> {
        std::mem::take(&mut self.pending_signals)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::strategy::builtin::BaselineStrategy;
    use crate::domain::contract::OrderType;
    use crate::domain::market::CandleSeries;

    fn limits() -> RiskLimits {
        crate::config::Config::default().risk_limits()
    }

    fn runner_with_cash(cash: f64) -> CandidateRunner {
        CandidateRunner::new(
            1,
            Box::new(BaselineStrategy::new()),
            "code".to_string(),
            "v1".to_string(),
            cash,
            Vec::new(),
            limits(),
            0.0005,
            0.25,
            0.40,
        )
    }

    fn buy(symbol: &str, size_pct: f64, tag: Option<&str>) -> Signal {
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
            tag: tag.map(str::to_string),
        }
    }

    fn market(symbol: &str, price: f64) -> SymbolData {
        SymbolData {
            symbol: symbol.to_string(),
            current_price: price,
            candles_5m: CandleSeries::empty(),
            candles_1h: CandleSeries::empty(),
            candles_1d: CandleSeries::empty(),
            spread: 0.001,
            volume_24h: 0.0,
            maker_fee_pct: 0.25,
            taker_fee_pct: 0.40,
        }
    }

    #[test]
    fn buy_and_close_are_isolated_to_private_cash() {
        let mut runner = runner_with_cash(1000.0);
        let ts = Utc::now();
        let tags = runner.execute_signal(&buy("BTC/USD", 0.05, None), 50_000.0, ts);
        assert_eq!(tags.len(), 1);
        assert!(tags[0].starts_with("c1_BTCUSD_"));
        assert!(runner.cash() < 1000.0);

        let mut close = buy("BTC/USD", 1.0, None);
        close.action = Action::Close;
        let closed = runner.execute_signal(&close, 51_000.0, ts);
        assert_eq!(closed.len(), 1);
        assert_eq!(runner.positions().len(), 0);
        assert_eq!(runner.all_trades.len(), 1);
        assert!(runner.all_trades[0].pnl > 0.0);
    }

    #[test]
    fn size_is_clamped_to_max_trade_pct() {
        let mut runner = runner_with_cash(1000.0);
        let ts = Utc::now();
        runner.execute_signal(&buy("BTC/USD", 0.9, None), 50_000.0, ts);
        let pos = runner.positions().values().next().unwrap();
        // Clamped to 10% of 1000 = 100 notional
        assert!((pos.qty * pos.avg_entry - 100.0).abs() < 1.0);
    }

    #[test]
    fn status_survives_persist_cycle() {
        let mut runner = runner_with_cash(1000.0);
        let ts = Utc::now();
        runner.execute_signal(&buy("BTC/USD", 0.05, None), 50_000.0, ts);
        let mut close = buy("BTC/USD", 1.0, None);
        close.action = Action::Close;
        runner.execute_signal(&close, 51_000.0, ts);

        let before = runner.status();
        assert_eq!(before["trade_count"], json!(1));

        // Persist cycle drains new_trades but stats must not move
        let drained = runner.take_new_trades();
        assert_eq!(drained.len(), 1);
        let after = runner.status();
        assert_eq!(after["trade_count"], json!(1));
        assert_eq!(before["pnl"], after["pnl"]);
    }

    #[test]
    fn initial_positions_are_renamed_with_slot_prefix() {
        let fund_position = Position {
            symbol: "ETH/USD".to_string(),
            tag: "auto_ETHUSD_001".to_string(),
            side: "long".to_string(),
            qty: 1.0,
            avg_entry: 2000.0,
            current_price: 2000.0,
            entry_fee: 0.5,
            stop_loss: None,
            take_profit: None,
            intent: Intent::Day,
            strategy_version: None,
            opened_at: Utc::now(),
            updated_at: Utc::now(),
            max_adverse_excursion: 0.0,
        };
        let runner = CandidateRunner::new(
            2,
            Box::new(BaselineStrategy::new()),
            "code".to_string(),
            "v1".to_string(),
            500.0,
            vec![fund_position],
            limits(),
            0.0005,
            0.25,
            0.40,
        );
        assert!(runner.positions().contains_key("c2_auto_ETHUSD_001"));
    }

    #[test]
    fn sl_trigger_uses_threshold_price() {
        let mut runner = runner_with_cash(1000.0);
        let ts = Utc::now();
        let mut sig = buy("BTC/USD", 0.05, Some("c1_x"));
        sig.stop_loss = Some(49_000.0);
        runner.execute_signal(&sig, 50_000.0, ts);

        let mut prices = HashMap::new();
        prices.insert("BTC/USD".to_string(), 48_000.0);
        let closed = runner.check_sl_tp(&prices);
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].close_reason, "stop_loss");
        // Fill at the threshold less slippage, not at the observed price
        assert!((closed[0].exit_price - 49_000.0 * (1.0 - 0.0005)).abs() < 1e-6);
    }

    #[tokio::test]
    async fn invalid_symbols_are_recorded_as_rejected() {
        let mut runner = runner_with_cash(1000.0);
        // Strategy returning nothing; inject the signal path directly via
        // run_scan with a market the signal won't match
        let mut markets = HashMap::new();
        markets.insert("BTC/USD".to_string(), market("BTC/USD", 50_000.0));
        runner.run_scan(&markets, Utc::now()).await;
        // Baseline strategy yields nothing on empty candles; no records
        assert!(runner.take_new_signals().is_empty());
    }
}
