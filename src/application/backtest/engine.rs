//! Backtester: deterministic multi-timeframe replay against stored
//! candles, with the exact fill, fee, slippage, and risk-halt semantics of
//! the live path. Zero LLM cost: local data and computation only.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeSet, HashMap};
use tracing::warn;

use crate::application::trading::fills;
use crate::domain::contract::{
    Action, Intent, OpenPosition, OrderType, PortfolioView, RiskLimits, Signal, Strategy,
    SymbolData,
};
use crate::domain::market::{CandleSeries, Timeframe};

/// Input data: one series per symbol, or native (5m, 1h, 1d) triples.
/// Mode is auto-detected by the caller-facing `run`.
pub enum CandleData {
    Single(HashMap<String, CandleSeries>),
    Multi(HashMap<String, (CandleSeries, CandleSeries, CandleSeries)>),
}

#[derive(Debug, Clone)]
pub struct BacktestTrade {
    pub symbol: String,
    pub action: Action,
    pub qty: f64,
    pub price: f64,
    pub fee: f64,
    pub pnl: f64,
    pub pnl_pct: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct BacktestResult {
    pub total_trades: usize,
    pub wins: usize,
    pub losses: usize,
    pub gross_pnl: f64,
    pub total_fees: f64,
    pub net_pnl: f64,
    pub win_rate: f64,
    pub expectancy: f64,
    pub profit_factor: f64,
    pub max_drawdown_pct: f64,
    pub sharpe: f64,
    pub daily_returns: Vec<f64>,
    pub limit_orders_attempted: usize,
    pub limit_orders_filled: usize,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub total_days: i64,
    pub timeframe_mode: &'static str,
    pub trades: Vec<BacktestTrade>,
}

impl BacktestResult {
    pub fn summary(&self) -> String {
        let mut parts = Vec::new();
        if let (Some(start), Some(end)) = (self.start_date, self.end_date) {
            parts.push(format!(
                "Period: {} to {} ({}d)",
                start.format("%Y-%m-%d"),
                end.format("%Y-%m-%d"),
                self.total_days
            ));
        }
        parts.push(format!(
            "Trades: {} | Win Rate: {:.1}% | Net P&L: ${:.2} | Expectancy: ${:.4} | \
             Sharpe: {:.2} | Max DD: {:.1}% | Fees: ${:.2}",
            self.total_trades,
            self.win_rate * 100.0,
            self.net_pnl,
            self.expectancy,
            self.sharpe,
            self.max_drawdown_pct * 100.0,
            self.total_fees
        ));
        if self.limit_orders_attempted > 0 {
            parts.push(format!(
                "Limit Fill: {:.0}% ({}/{})",
                self.limit_orders_filled as f64 / self.limit_orders_attempted as f64 * 100.0,
                self.limit_orders_filled,
                self.limit_orders_attempted
            ));
        }
        parts.join(" | ")
    }

    /// Extended summary for AI review.
    pub fn detailed_summary(&self) -> String {
        let mut lines = vec![
            match (self.start_date, self.end_date) {
                (Some(start), Some(end)) => format!(
                    "Period: {} to {} ({} days)",
                    start.format("%Y-%m-%d"),
                    end.format("%Y-%m-%d"),
                    self.total_days
                ),
                _ => "Period: N/A".to_string(),
            },
            format!(
                "Mode: {}",
                if self.timeframe_mode == "multi" {
                    "Multi-timeframe (5m + 1h + 1d)"
                } else {
                    "Single timeframe"
                }
            ),
            format!("Total Trades: {}", self.total_trades),
            format!("Wins: {} | Losses: {}", self.wins, self.losses),
            format!("Win Rate: {:.1}%", self.win_rate * 100.0),
            format!("Net P&L: ${:.2}", self.net_pnl),
            format!("Gross P&L: ${:.2}", self.gross_pnl),
            format!("Total Fees: ${:.2}", self.total_fees),
            format!("Expectancy: ${:.4} per trade", self.expectancy),
            format!("Profit Factor: {:.2}", self.profit_factor),
            format!("Sharpe Ratio: {:.2}", self.sharpe),
            format!("Max Drawdown: {:.1}%", self.max_drawdown_pct * 100.0),
        ];
        if self.limit_orders_attempted > 0 {
            lines.push(format!(
                "Limit Fill Rate: {:.0}% ({}/{})",
                self.limit_orders_filled as f64 / self.limit_orders_attempted as f64 * 100.0,
                self.limit_orders_filled,
                self.limit_orders_attempted
            ));
        }
        lines.join("\n")
    }
}

#[derive(Debug, Clone)]
struct BtPosition {
    symbol: String,
    qty: f64,
    avg_entry: f64,
    entry_fee: f64,
    stop_loss: Option<f64>,
    take_profit: Option<f64>,
    opened_at: DateTime<Utc>,
}

/// Per-run mutable simulation state.
struct SimState {
    cash: f64,
    positions: HashMap<String, BtPosition>,
    trades: Vec<BacktestTrade>,
    daily_values: Vec<f64>,
    peak_value: f64,
    total_value: f64,
    day_start_value: f64,
    daily_trade_count: u32,
    consecutive_losses: u32,
    halted_today: bool,
    drawdown_halted: bool,
    consecutive_loss_halted: bool,
    limit_attempted: usize,
    limit_filled: usize,
}

pub struct Backtester<'a> {
    strategy: &'a mut dyn Strategy,
    risk_limits: RiskLimits,
    symbols: Vec<String>,
    maker_fee_pct: f64,
    taker_fee_pct: f64,
    starting_cash: f64,
    per_pair_fees: HashMap<String, (f64, f64)>,
    slippage: f64,
    tag_counter: HashMap<String, u32>,
}

impl<'a> Backtester<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        strategy: &'a mut dyn Strategy,
        risk_limits: RiskLimits,
        symbols: Vec<String>,
        maker_fee_pct: f64,
        taker_fee_pct: f64,
        starting_cash: f64,
        per_pair_fees: HashMap<String, (f64, f64)>,
        slippage: f64,
    ) -> Self {
        Self {
            strategy,
            risk_limits,
            symbols,
            maker_fee_pct,
            taker_fee_pct,
            starting_cash,
            per_pair_fees,
            slippage,
            tag_counter: HashMap::new(),
        }
    }

    fn maker_fee(&self, symbol: &str) -> f64 {
        self.per_pair_fees
            .get(symbol)
            .map(|f| f.0)
            .unwrap_or(self.maker_fee_pct)
    }

    fn taker_fee(&self, symbol: &str) -> f64 {
        self.per_pair_fees
            .get(symbol)
            .map(|f| f.1)
            .unwrap_or(self.taker_fee_pct)
    }

    fn bt_tag(&mut self, symbol: &str) -> String {
        let clean = symbol.replace('/', "");
        let n = self.tag_counter.entry(clean.clone()).or_insert(0);
        *n += 1;
        format!("bt_{}_{:03}", clean, n)
    }

    pub async fn run(&mut self, data: &CandleData) -> Result<BacktestResult> {
        match data {
            CandleData::Multi(map) => self.simulate(map, true).await,
            CandleData::Single(map) => {
                // Wrap single series as triples; 1h/1d views resample on
                // the fly from the full history.
                let wrapped: HashMap<String, (CandleSeries, CandleSeries, CandleSeries)> = map
                    .iter()
                    .map(|(symbol, series)| {
                        (
                            symbol.clone(),
                            (
                                series.clone(),
                                series.resample(Timeframe::H1),
                                series.resample(Timeframe::D1),
                            ),
                        )
                    })
                    .collect();
                self.simulate(&wrapped, false).await
            }
        }
    }

    async fn simulate(
        &mut self,
        data: &HashMap<String, (CandleSeries, CandleSeries, CandleSeries)>,
        multi: bool,
    ) -> Result<BacktestResult> {
        self.tag_counter.clear();
        self.strategy
            .initialize(&self.risk_limits, &self.symbols)
            .await?;

        // Union of 1h timestamps across symbols, iterated in order
        let mut timestamps: BTreeSet<DateTime<Utc>> = BTreeSet::new();
        for symbol in &self.symbols {
            if let Some((_, h1, _)) = data.get(symbol) {
                timestamps.extend(h1.timestamps());
            }
        }
        if timestamps.is_empty() {
            return Ok(BacktestResult {
                timeframe_mode: if multi { "multi" } else { "single" },
                ..BacktestResult::default()
            });
        }

        let mut state = SimState {
            cash: self.starting_cash,
            positions: HashMap::new(),
            trades: Vec::new(),
            daily_values: Vec::new(),
            peak_value: self.starting_cash,
            total_value: self.starting_cash,
            day_start_value: self.starting_cash,
            daily_trade_count: 0,
            consecutive_losses: 0,
            halted_today: false,
            drawdown_halted: false,
            consecutive_loss_halted: false,
            limit_attempted: 0,
            limit_filled: 0,
        };

        let mut prev_day = None;
        for &ts in &timestamps {
            // Day boundary before trading so day_start_value is correct
            let day = ts.date_naive();
            if prev_day != Some(day) {
                if prev_day.is_some() {
                    state.daily_values.push(state.total_value);
                    state.peak_value = state.peak_value.max(state.total_value);
                }
                state.day_start_value = state.total_value;
                state.daily_trade_count = 0;
                state.halted_today = false;
                prev_day = Some(day);
            }

            // Market snapshot per symbol at this timestamp
            let mut markets: HashMap<String, SymbolData> = HashMap::new();
            let mut prices: HashMap<String, f64> = HashMap::new();
            for symbol in &self.symbols {
                let Some((m5, h1, d1)) = data.get(symbol) else {
                    continue;
                };
                let hist_1h = CandleSeries::new(h1.up_to(ts).to_vec());
                let Some(last) = hist_1h.last() else {
                    continue;
                };
                let current_price = last.close;
                prices.insert(symbol.clone(), current_price);

                let hist_5m = {
                    let upto = m5.up_to(ts);
                    let start = upto.len().saturating_sub(8640);
                    CandleSeries::new(upto[start..].to_vec())
                };
                let hist_1d = CandleSeries::new(d1.up_to(ts).to_vec());
                let spread = hist_1h.median_intrabar_spread(100);
                let volume_24h = hist_1h.volume_tail(24);
                let pair_fees = self.per_pair_fees.get(symbol);

                markets.insert(
                    symbol.clone(),
                    SymbolData {
                        symbol: symbol.clone(),
                        current_price,
                        candles_5m: hist_5m,
                        candles_1h: hist_1h,
                        candles_1d: hist_1d,
                        spread,
                        volume_24h,
                        maker_fee_pct: pair_fees.map(|f| f.0).unwrap_or(self.maker_fee_pct),
                        taker_fee_pct: pair_fees.map(|f| f.1).unwrap_or(self.taker_fee_pct),
                    },
                );
            }
            if markets.is_empty() {
                continue;
            }

            state.total_value = total_value(&state, &prices);
            let portfolio =
                build_portfolio(&state, &prices, self.starting_cash, state.day_start_value);

            let signals = match self.strategy.analyze(&markets, &portfolio, ts).await {
                Ok(signals) => signals,
                Err(e) => {
                    warn!(error = %e, ts = %ts, "strategy error during backtest tick");
                    continue;
                }
            };

            for signal in &signals {
                let Some(&price) = prices.get(&signal.symbol) else {
                    continue;
                };
                match signal.action {
                    Action::Buy => {
                        self.execute_buy(&mut state, signal, price, data, ts, &prices)
                            .await?
                    }
                    Action::Sell | Action::Close => {
                        self.execute_exit(&mut state, signal, price, data, ts, &prices)
                            .await?
                    }
                    Action::Modify => {
                        if let Some(tag) = &signal.tag {
                            if let Some(pos) = state.positions.get_mut(tag) {
                                if signal.stop_loss.is_some() {
                                    pos.stop_loss = signal.stop_loss;
                                }
                                if signal.take_profit.is_some() {
                                    pos.take_profit = signal.take_profit;
                                }
                            }
                        }
                    }
                }
            }

            self.check_sl_tp(&mut state, data, ts, &prices).await?;

            // Drawdown halt persists across days
            if state.peak_value > 0.0
                && (state.peak_value - state.total_value) / state.peak_value
                    > self.risk_limits.max_drawdown_pct
            {
                state.drawdown_halted = true;
            }
        }

        // Final day's value
        state.daily_values.push(state.total_value);
        state.peak_value = state.peak_value.max(state.total_value);

        Ok(self.finish(
            state,
            timestamps.iter().next().copied(),
            timestamps.iter().next_back().copied(),
            multi,
        ))
    }

    async fn execute_buy(
        &mut self,
        state: &mut SimState,
        signal: &Signal,
        price: f64,
        data: &HashMap<String, (CandleSeries, CandleSeries, CandleSeries)>,
        ts: DateTime<Utc>,
        prices: &HashMap<String, f64>,
    ) -> Result<()> {
        // Risk halt simulation: entries only
        if state.halted_today || state.drawdown_halted || state.consecutive_loss_halted {
            return Ok(());
        }
        if state.daily_trade_count >= self.risk_limits.max_daily_trades {
            return Ok(());
        }

        let tag = signal
            .tag
            .clone()
            .unwrap_or_else(|| self.bt_tag(&signal.symbol));
        let is_new = !state.positions.contains_key(&tag);
        if is_new && state.positions.len() >= self.risk_limits.max_positions {
            return Ok(());
        }

        let (fill_price, fee_pct) = match signal.order_type {
            OrderType::Limit => {
                state.limit_attempted += 1;
                let limit_p = signal.limit_price.unwrap_or(price);
                let bar_low = data
                    .get(&signal.symbol)
                    .and_then(|(_, h1, _)| h1.at(ts))
                    .map(|bar| bar.low)
                    .unwrap_or(price);
                if bar_low > limit_p {
                    return Ok(()); // limit never reached this bar
                }
                state.limit_filled += 1;
                (limit_p, self.maker_fee(&signal.symbol))
            }
            OrderType::Market => (
                price * (1.0 + self.slippage),
                self.taker_fee(&signal.symbol),
            ),
        };

        // Oversized entries are rejected, matching the live risk manager
        if signal.size_pct > self.risk_limits.max_trade_pct {
            return Ok(());
        }
        let trade_value = state.total_value * signal.size_pct;
        if trade_value <= 0.0 {
            return Ok(());
        }
        let existing_value: f64 = state
            .positions
            .values()
            .filter(|p| p.symbol == signal.symbol)
            .map(|p| p.qty * prices.get(&p.symbol).copied().unwrap_or(p.avg_entry))
            .sum();
        if state.total_value > 0.0
            && (existing_value + trade_value) / state.total_value > self.risk_limits.max_position_pct
        {
            return Ok(());
        }
        let fee = fills::fee_amount(trade_value, fee_pct);
        if trade_value + fee > state.cash {
            return Ok(());
        }

        let qty = trade_value / fill_price;
        state.cash -= trade_value + fee;

        if let Some(existing) = state.positions.get_mut(&tag) {
            let total_qty = existing.qty + qty;
            existing.avg_entry = (existing.avg_entry * existing.qty + fill_price * qty) / total_qty;
            existing.qty = total_qty;
            existing.entry_fee += fee;
            if signal.stop_loss.is_some() {
                existing.stop_loss = signal.stop_loss;
            }
            if signal.take_profit.is_some() {
                existing.take_profit = signal.take_profit;
            }
        } else {
            state.positions.insert(
                tag.clone(),
                BtPosition {
                    symbol: signal.symbol.clone(),
                    qty,
                    avg_entry: fill_price,
                    entry_fee: fee,
                    stop_loss: signal.stop_loss,
                    take_profit: signal.take_profit,
                    opened_at: ts,
                },
            );
        }

        self.strategy
            .on_fill(&signal.symbol, Action::Buy, qty, fill_price, signal.intent, &tag)
            .await
            .ok();

        state.total_value = total_value(state, prices);
        self.check_daily_loss_halt(state);
        Ok(())
    }

    async fn execute_exit(
        &mut self,
        state: &mut SimState,
        signal: &Signal,
        price: f64,
        data: &HashMap<String, (CandleSeries, CandleSeries, CandleSeries)>,
        ts: DateTime<Utc>,
        prices: &HashMap<String, f64>,
    ) -> Result<()> {
        // LIMIT exit: fills only if the bar's high reached the limit
        if signal.order_type == OrderType::Limit {
            state.limit_attempted += 1;
            let limit_p = signal.limit_price.unwrap_or(price);
            let bar_high = data
                .get(&signal.symbol)
                .and_then(|(_, h1, _)| h1.at(ts))
                .map(|bar| bar.high)
                .unwrap_or(price);
            if bar_high < limit_p {
                return Ok(());
            }
            state.limit_filled += 1;
        }

        // CLOSE without tag closes every position for the symbol; SELL (or
        // CLOSE with tag) resolves one target, FIFO for untagged SELL.
        let targets: Vec<String> = if signal.action == Action::Close && signal.tag.is_none() {
            let mut tags: Vec<String> = state
                .positions
                .iter()
                .filter(|(_, p)| p.symbol == signal.symbol)
                .map(|(tag, _)| tag.clone())
                .collect();
            tags.sort_by_key(|tag| state.positions[tag].opened_at);
            tags
        } else {
            match resolve_position(signal, &state.positions) {
                Some(tag) => vec![tag],
                None => Vec::new(),
            }
        };

        for tag in targets {
            let pos = state.positions[&tag].clone();
            let (fill_price, exit_fee_pct) = match signal.order_type {
                OrderType::Limit => (
                    signal.limit_price.unwrap_or(price),
                    self.maker_fee(&signal.symbol),
                ),
                OrderType::Market => (
                    price * (1.0 - self.slippage),
                    self.taker_fee(&signal.symbol),
                ),
            };

            let qty = if signal.action == Action::Sell
                && signal.size_pct > 0.0
                && signal.size_pct < 1.0
            {
                let sell_value = state.total_value * signal.size_pct;
                (sell_value / fill_price).min(pos.qty)
            } else {
                pos.qty
            };

            let sale = qty * fill_price;
            let exit_fee = fills::fee_amount(sale, exit_fee_pct);
            let (pnl, pnl_pct, entry_fee_portion) =
                fills::realized_pnl(fill_price, pos.avg_entry, qty, pos.qty, pos.entry_fee, exit_fee);
            state.cash += sale - exit_fee;

            state.trades.push(BacktestTrade {
                symbol: signal.symbol.clone(),
                action: signal.action,
                qty,
                price: fill_price,
                fee: entry_fee_portion + exit_fee,
                pnl,
                pnl_pct,
                timestamp: ts,
            });

            self.strategy
                .on_fill(&signal.symbol, signal.action, qty, fill_price, signal.intent, &tag)
                .await
                .ok();

            let remaining = pos.qty - qty;
            if remaining <= fills::QTY_EPSILON {
                self.strategy
                    .on_position_closed(&signal.symbol, pnl, pnl_pct, &tag)
                    .await
                    .ok();
                state.positions.remove(&tag);
            } else if let Some(p) = state.positions.get_mut(&tag) {
                p.qty = remaining;
                p.entry_fee = pos.entry_fee - entry_fee_portion;
            }

            state.daily_trade_count += 1;
            if pnl < 0.0 {
                state.consecutive_losses += 1;
            } else {
                state.consecutive_losses = 0;
            }
        }

        state.total_value = total_value(state, prices);
        self.check_daily_loss_halt(state);
        if state.consecutive_losses >= self.risk_limits.rollback_consecutive_losses {
            state.consecutive_loss_halted = true;
        }
        Ok(())
    }

    /// SL/TP sweep after signals. 5-minute sub-bars within the current hour
    /// provide intrabar precision when available; the hourly bar is the
    /// fallback. Entries from this same bar never trigger.
    async fn check_sl_tp(
        &mut self,
        state: &mut SimState,
        data: &HashMap<String, (CandleSeries, CandleSeries, CandleSeries)>,
        ts: DateTime<Utc>,
        prices: &HashMap<String, f64>,
    ) -> Result<()> {
        let tags: Vec<String> = state.positions.keys().cloned().collect();
        for tag in tags {
            let Some(pos) = state.positions.get(&tag).cloned() else {
                continue;
            };
            if pos.opened_at == ts {
                continue;
            }
            if pos.stop_loss.is_none() && pos.take_profit.is_none() {
                continue;
            }
            let Some((m5, h1, _)) = data.get(&pos.symbol) else {
                continue;
            };

            let mut trigger_price = None;
            // Chronological 5m sub-bars; first touch wins
            let sub_bars = m5.between(ts, ts + Duration::hours(1));
            for bar in sub_bars {
                if let Some(sl) = pos.stop_loss {
                    if bar.low <= sl {
                        trigger_price = Some(sl);
                        break;
                    }
                }
                if let Some(tp) = pos.take_profit {
                    if bar.high >= tp {
                        trigger_price = Some(tp);
                        break;
                    }
                }
            }
            if trigger_price.is_none() {
                if let Some(bar) = h1.at(ts) {
                    if let Some(sl) = pos.stop_loss.filter(|sl| bar.low <= *sl) {
                        trigger_price = Some(sl);
                    } else if let Some(tp) = pos.take_profit.filter(|tp| bar.high >= *tp) {
                        trigger_price = Some(tp);
                    }
                }
            }

            let Some(threshold) = trigger_price else {
                continue;
            };
            // Threshold as trigger, then slippage: an SL/TP close is a
            // market order
            let fill_price = threshold * (1.0 - self.slippage);
            let qty = pos.qty;
            let sale = qty * fill_price;
            let exit_fee = fills::fee_amount(sale, self.taker_fee(&pos.symbol));
            let (pnl, pnl_pct, entry_fee_portion) =
                fills::realized_pnl(fill_price, pos.avg_entry, qty, pos.qty, pos.entry_fee, exit_fee);
            state.cash += sale - exit_fee;
            state.trades.push(BacktestTrade {
                symbol: pos.symbol.clone(),
                action: Action::Close,
                qty,
                price: fill_price,
                fee: entry_fee_portion + exit_fee,
                pnl,
                pnl_pct,
                timestamp: ts,
            });
            self.strategy
                .on_position_closed(&pos.symbol, pnl, pnl_pct, &tag)
                .await
                .ok();
            state.positions.remove(&tag);

            state.daily_trade_count += 1;
            if pnl < 0.0 {
                state.consecutive_losses += 1;
            } else {
                state.consecutive_losses = 0;
            }
            state.total_value = total_value(state, prices);
            self.check_daily_loss_halt(state);
            if state.consecutive_losses >= self.risk_limits.rollback_consecutive_losses {
                state.consecutive_loss_halted = true;
            }
        }
        Ok(())
    }

    fn check_daily_loss_halt(&self, state: &mut SimState) {
        let daily_pnl = state.total_value - state.day_start_value;
        if state.day_start_value > 0.0
            && -daily_pnl / state.day_start_value > self.risk_limits.max_daily_loss_pct
        {
            state.halted_today = true;
        }
    }

    fn finish(
        &self,
        state: SimState,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        multi: bool,
    ) -> BacktestResult {
        let trades = state.trades;
        let mut result = BacktestResult {
            timeframe_mode: if multi { "multi" } else { "single" },
            limit_orders_attempted: state.limit_attempted,
            limit_orders_filled: state.limit_filled,
            total_trades: trades.len(),
            wins: trades.iter().filter(|t| t.pnl > 0.0).count(),
            losses: trades.iter().filter(|t| t.pnl < 0.0).count(),
            total_fees: trades.iter().map(|t| t.fee).sum(),
            gross_pnl: trades.iter().map(|t| t.pnl + t.fee).sum(),
            net_pnl: trades.iter().map(|t| t.pnl).sum(),
            start_date: start,
            end_date: end,
            ..BacktestResult::default()
        };
        result.win_rate = if result.total_trades > 0 {
            result.wins as f64 / result.total_trades as f64
        } else {
            0.0
        };

        if result.total_trades > 0 {
            let avg_win = trades.iter().filter(|t| t.pnl > 0.0).map(|t| t.pnl).sum::<f64>()
                / result.wins.max(1) as f64;
            let avg_loss = trades
                .iter()
                .filter(|t| t.pnl <= 0.0)
                .map(|t| t.pnl)
                .sum::<f64>()
                .abs()
                / result.losses.max(1) as f64;
            result.expectancy = result.win_rate * avg_win - (1.0 - result.win_rate) * avg_loss;
        }

        let gross_profit: f64 = trades.iter().filter(|t| t.pnl > 0.0).map(|t| t.pnl).sum();
        let gross_loss: f64 = trades
            .iter()
            .filter(|t| t.pnl <= 0.0)
            .map(|t| t.pnl)
            .sum::<f64>()
            .abs();
        result.profit_factor = if gross_loss > 0.0 {
            gross_profit / gross_loss
        } else {
            f64::INFINITY
        };

        if !state.daily_values.is_empty() {
            let mut peak = state.daily_values[0];
            let mut max_dd = 0.0f64;
            for &v in &state.daily_values {
                if v > peak {
                    peak = v;
                }
                if peak > 0.0 {
                    max_dd = max_dd.max((peak - v) / peak);
                }
            }
            result.max_drawdown_pct = max_dd;

            result.daily_returns = state
                .daily_values
                .windows(2)
                .filter(|w| w[0] > 0.0)
                .map(|w| (w[1] - w[0]) / w[0])
                .collect();
            if result.daily_returns.len() > 1 {
                let n = result.daily_returns.len() as f64;
                let mean = result.daily_returns.iter().sum::<f64>() / n;
                let variance = result
                    .daily_returns
                    .iter()
                    .map(|r| (r - mean).powi(2))
                    .sum::<f64>()
                    / n;
                let std = variance.sqrt();
                if std > 0.0 {
                    result.sharpe = mean / std * 365f64.sqrt();
                }
            }
        }

        if let (Some(start), Some(end)) = (result.start_date, result.end_date) {
            result.total_days = (end - start).num_days().max(1);
        }

        result.trades = trades;
        result
    }
}

fn total_value(state: &SimState, prices: &HashMap<String, f64>) -> f64 {
    state.cash
        + state
            .positions
            .values()
            .map(|p| p.qty * prices.get(&p.symbol).copied().unwrap_or(p.avg_entry))
            .sum::<f64>()
}

fn build_portfolio(
    state: &SimState,
    prices: &HashMap<String, f64>,
    starting_cash: f64,
    day_start_value: f64,
) -> PortfolioView {
    let mut positions: Vec<OpenPosition> = state
        .positions
        .iter()
        .map(|(tag, pos)| {
            let current = prices.get(&pos.symbol).copied().unwrap_or(pos.avg_entry);
            let pnl = (current - pos.avg_entry) * pos.qty;
            OpenPosition {
                symbol: pos.symbol.clone(),
                side: "long".to_string(),
                qty: pos.qty,
                avg_entry: pos.avg_entry,
                current_price: current,
                unrealized_pnl: pnl,
                unrealized_pnl_pct: if pos.avg_entry > 0.0 {
                    (current - pos.avg_entry) / pos.avg_entry
                } else {
                    0.0
                },
                intent: Intent::Day,
                stop_loss: pos.stop_loss,
                take_profit: pos.take_profit,
                opened_at: pos.opened_at,
                tag: tag.clone(),
            }
        })
        .collect();
    positions.sort_by(|a, b| a.tag.cmp(&b.tag));

    PortfolioView {
        cash: state.cash,
        total_value: state.total_value,
        positions,
        recent_trades: Vec::new(),
        daily_pnl: state.total_value - day_start_value,
        total_pnl: state.total_value - starting_cash,
        fees_today: 0.0,
    }
}

/// Resolve by explicit tag, else oldest open position for the symbol.
fn resolve_position(signal: &Signal, positions: &HashMap<String, BtPosition>) -> Option<String> {
    if let Some(tag) = &signal.tag {
        if positions.contains_key(tag) {
            return Some(tag.clone());
        }
    }
    positions
        .iter()
        .filter(|(_, p)| p.symbol == signal.symbol)
        .min_by_key(|(_, p)| p.opened_at)
        .map(|(tag, _)| tag.clone())
}
