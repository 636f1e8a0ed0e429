//! Risk manager: hard limit enforcement on all signals.
//!
//! Part of the rigid shell; nothing the orchestrator deploys can modify
//! these limits. Every signal passes through `check_signal` before
//! execution. Pure and in-memory; mutable only through the explicit
//! recovery/reset entry points.

use chrono::{Datelike, TimeZone, Utc};
use chrono_tz::Tz;
use serde_json::json;
use tracing::{info, warn};

use crate::config::RiskConfig;
use crate::domain::contract::{Action, Signal};
use crate::infrastructure::persistence::{RowExt, Store};

#[derive(Debug, Clone)]
pub struct RiskCheck {
    pub passed: bool,
    pub reason: String,
}

impl RiskCheck {
    fn pass() -> Self {
        Self {
            passed: true,
            reason: "OK".to_string(),
        }
    }

    fn fail(reason: String) -> Self {
        Self {
            passed: false,
            reason,
        }
    }
}

pub struct RiskManager {
    config: RiskConfig,
    daily_trades: u32,
    daily_pnl: f64,
    consecutive_losses: u32,
    peak_portfolio: Option<f64>,
    halted: bool,
    halt_reason: String,
}

impl RiskManager {
    pub fn new(config: RiskConfig) -> Self {
        Self {
            config,
            daily_trades: 0,
            daily_pnl: 0.0,
            consecutive_losses: 0,
            peak_portfolio: None,
            halted: false,
            halt_reason: String::new(),
        }
    }

    /// Restore peak portfolio value and daily/streak counters from the store
    /// after a restart. The daily window is bounded by local midnight in the
    /// configured timezone, converted to UTC.
    pub async fn initialize(&mut self, store: &Store, tz: Tz) -> anyhow::Result<()> {
        if let Some(row) = store
            .fetch_one(
                "SELECT MAX(portfolio_value) as peak FROM daily_performance",
                &[],
            )
            .await?
        {
            if let Some(peak) = row.opt_f64("peak") {
                self.peak_portfolio = Some(peak);
                info!(peak = format!("{peak:.2}"), "risk peak loaded");
            }
        }

        let local_now = Utc::now().with_timezone(&tz);
        let midnight_local = tz
            .with_ymd_and_hms(
                local_now.date_naive().year(),
                local_now.date_naive().month(),
                local_now.date_naive().day(),
                0,
                0,
                0,
            )
            .single();
        if let Some(midnight) = midnight_local {
            let today_utc = midnight
                .with_timezone(&Utc)
                .format("%Y-%m-%d %H:%M:%S")
                .to_string();
            if let Some(row) = store
                .fetch_one(
                    "SELECT COUNT(*) as cnt, COALESCE(SUM(pnl), 0) as total_pnl \
                     FROM trades WHERE datetime(closed_at) >= datetime(?)",
                    &[json!(today_utc)],
                )
                .await?
            {
                self.daily_trades = row.i64("cnt") as u32;
                self.daily_pnl = row.f64("total_pnl");
            }
        }

        // Leading losses in the most recent trades
        let recent = store
            .fetch_all(
                "SELECT pnl FROM trades WHERE pnl IS NOT NULL ORDER BY closed_at DESC LIMIT 20",
                &[],
            )
            .await?;
        let mut streak = 0u32;
        for t in &recent {
            if t.f64("pnl") < 0.0 {
                streak += 1;
            } else {
                break;
            }
        }
        self.consecutive_losses = streak;

        if self.daily_trades > 0 || streak > 0 {
            info!(
                daily_trades = self.daily_trades,
                daily_pnl = format!("{:.2}", self.daily_pnl),
                consecutive_losses = streak,
                "risk counters restored"
            );
        }
        Ok(())
    }

    pub fn is_halted(&self) -> bool {
        self.halted || self.config.kill_switch
    }

    pub fn halt_reason(&self) -> String {
        if self.config.kill_switch {
            return "Emergency kill switch is ON".to_string();
        }
        self.halt_reason.clone()
    }

    pub fn daily_pnl(&self) -> f64 {
        self.daily_pnl
    }

    pub fn daily_trades(&self) -> u32 {
        self.daily_trades
    }

    pub fn consecutive_losses(&self) -> u32 {
        self.consecutive_losses
    }

    pub fn peak_portfolio(&self) -> Option<f64> {
        self.peak_portfolio
    }

    /// Zero the daily counters. Daily-loss halts clear with the day;
    /// drawdown and consecutive-loss halts are structural and persist.
    pub fn reset_daily(&mut self) {
        self.daily_trades = 0;
        self.daily_pnl = 0.0;
        if self.halted && self.halt_reason.contains("Daily portfolio drop") {
            self.halted = false;
            self.halt_reason.clear();
            info!("daily-loss halt cleared");
        }
        info!("risk daily reset");
    }

    pub fn record_trade_result(&mut self, pnl: f64) {
        self.daily_pnl += pnl;
        self.daily_trades += 1;
        if pnl < 0.0 {
            self.consecutive_losses += 1;
        } else {
            self.consecutive_losses = 0;
        }
    }

    pub fn update_portfolio_peak(&mut self, value: f64) {
        match self.peak_portfolio {
            Some(peak) if value <= peak => {}
            _ => self.peak_portfolio = Some(value),
        }
    }

    /// Validate a signal against every limit, in order. Exits always pass
    /// the entry-side blocks; the system must be able to reduce exposure
    /// under any conditions.
    pub fn check_signal(
        &mut self,
        signal: &Signal,
        portfolio_value: f64,
        open_position_count: usize,
        position_value_for_symbol: f64,
        daily_start_value: Option<f64>,
        is_new_position: bool,
    ) -> RiskCheck {
        let is_exit = signal.action.is_exit();
        let mut trade_value = 0.0;

        if self.config.kill_switch && !is_exit {
            return RiskCheck::fail("Emergency kill switch is ON".to_string());
        }

        if self.halted && !is_exit {
            return RiskCheck::fail(format!("Trading halted: {}", self.halt_reason));
        }

        // Daily loss limit against the start-of-day base
        let base_value = match daily_start_value {
            Some(v) if v > 0.0 => v,
            _ => portfolio_value,
        };
        let max_daily_loss = base_value * self.config.max_daily_loss_pct;
        if self.daily_pnl < -max_daily_loss && !is_exit {
            return RiskCheck::fail(format!(
                "Daily loss limit: ${:.2} < -${:.2}",
                self.daily_pnl, max_daily_loss
            ));
        }

        if self.daily_trades >= self.config.max_daily_trades && !is_exit {
            return RiskCheck::fail(format!(
                "Daily trade limit: {}/{}",
                self.daily_trades, self.config.max_daily_trades
            ));
        }

        // Max positions only gates genuinely new tags, not average-ins
        if signal.action == Action::Buy
            && is_new_position
            && open_position_count >= self.config.max_positions
        {
            return RiskCheck::fail(format!(
                "Max positions: {}/{}",
                open_position_count, self.config.max_positions
            ));
        }

        if !is_exit {
            if signal.size_pct <= 0.0 {
                return RiskCheck::fail(format!("Invalid size_pct: {}", signal.size_pct));
            }
            trade_value = portfolio_value * signal.size_pct;
            let max_trade = portfolio_value * self.config.max_trade_pct;
            if trade_value > max_trade {
                return RiskCheck::fail(format!(
                    "Trade size {:.1}% exceeds limit {:.1}%",
                    signal.size_pct * 100.0,
                    self.config.max_trade_pct * 100.0
                ));
            }
        }

        if signal.action == Action::Buy {
            let new_position_value = position_value_for_symbol + trade_value;
            let max_position = portfolio_value * self.config.max_position_pct;
            if new_position_value > max_position {
                return RiskCheck::fail(format!(
                    "Position size ${new_position_value:.2} exceeds limit ${max_position:.2}"
                ));
            }
        }

        if let Some(peak) = self.peak_portfolio {
            if !is_exit && peak > 0.0 {
                let drawdown = (peak - portfolio_value) / peak;
                if drawdown > self.config.max_drawdown_pct {
                    self.halted = true;
                    self.halt_reason = format!(
                        "Max drawdown {:.1}% > {:.1}%",
                        drawdown * 100.0,
                        self.config.max_drawdown_pct * 100.0
                    );
                    return RiskCheck::fail(self.halt_reason.clone());
                }
            }
        }

        if self.consecutive_losses >= self.config.rollback_consecutive_losses && !is_exit {
            self.halted = true;
            self.halt_reason = format!("{} consecutive losses", self.consecutive_losses);
            return RiskCheck::fail(self.halt_reason.clone());
        }

        RiskCheck::pass()
    }

    /// Shell-enforced rollback triggers, checked after each executed trade.
    pub fn check_rollback_triggers(
        &mut self,
        portfolio_value: f64,
        starting_value: f64,
    ) -> RiskCheck {
        let daily_loss_pct = if starting_value > 0.0 {
            (starting_value - portfolio_value) / starting_value
        } else {
            0.0
        };
        if daily_loss_pct > self.config.rollback_daily_loss_pct {
            self.halted = true;
            self.halt_reason = format!(
                "Daily portfolio drop {:.1}% > {:.1}%",
                daily_loss_pct * 100.0,
                self.config.rollback_daily_loss_pct * 100.0
            );
            return RiskCheck::fail(self.halt_reason.clone());
        }

        if self.consecutive_losses >= self.config.rollback_consecutive_losses {
            self.halted = true;
            self.halt_reason = format!(
                "{} consecutive losses, rollback triggered",
                self.consecutive_losses
            );
            return RiskCheck::fail(self.halt_reason.clone());
        }

        RiskCheck::pass()
    }

    /// Clamp oversized requests to the per-trade cap instead of rejecting.
    pub fn clamp_signal(&self, signal: &mut Signal) {
        let max_size = self.config.max_trade_pct;
        if signal.size_pct > max_size {
            warn!(
                symbol = %signal.symbol,
                original = signal.size_pct,
                clamped = max_size,
                "signal size clamped"
            );
            signal.size_pct = max_size;
        }
    }

    /// Manual operator reset. Clears the halt and the loss streak.
    pub fn unhalt(&mut self) {
        self.halted = false;
        self.halt_reason.clear();
        self.consecutive_losses = 0;
        info!("risk manager unhalted");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::contract::{Intent, OrderType};

    fn buy(symbol: &str, size_pct: f64) -> Signal {
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
            tag: None,
        }
    }

    fn manager() -> RiskManager {
        RiskManager::new(RiskConfig {
            max_daily_loss_pct: 0.05,
            max_daily_trades: 20,
            max_positions: 5,
            max_trade_pct: 0.10,
            max_position_pct: 0.25,
            max_drawdown_pct: 0.10,
            rollback_consecutive_losses: 3,
            ..RiskConfig::default()
        })
    }

    #[test]
    fn daily_loss_blocks_only_after_strictly_exceeding_limit() {
        let mut rm = manager();
        // Losses totalling -4.5, then a win to keep the streak rule quiet.
        // Limit is -50 on a 1000 base.
        for _ in 0..9 {
            rm.record_trade_result(-0.5);
        }
        rm.record_trade_result(1.0);
        assert!(rm.daily_pnl() > -50.0);
        assert!(rm
            .check_signal(&buy("BTC/USD", 0.05), 1000.0, 0, 0.0, Some(1000.0), true)
            .passed);

        rm.record_trade_result(-55.0);
        assert!(rm.daily_pnl() < -50.0);
        let check = rm.check_signal(&buy("BTC/USD", 0.05), 1000.0, 0, 0.0, Some(1000.0), true);
        assert!(!check.passed);
        assert!(check.reason.contains("Daily"), "{}", check.reason);
    }

    #[test]
    fn exits_pass_while_halted() {
        let mut rm = manager();
        rm.update_portfolio_peak(1000.0);
        let check = rm.check_signal(&buy("BTC/USD", 0.05), 890.0, 0, 0.0, None, true);
        assert!(!check.passed);
        assert!(check.reason.contains("Max drawdown"));
        assert!(rm.is_halted());

        let mut close = buy("BTC/USD", 0.0);
        close.action = Action::Close;
        assert!(rm
            .check_signal(&close, 890.0, 1, 0.0, None, false)
            .passed);
    }

    #[test]
    fn drawdown_halt_survives_daily_reset() {
        let mut rm = manager();
        rm.update_portfolio_peak(1000.0);
        assert!(!rm
            .check_signal(&buy("BTC/USD", 0.05), 890.0, 0, 0.0, None, true)
            .passed);
        rm.reset_daily();
        let check = rm.check_signal(&buy("BTC/USD", 0.05), 890.0, 0, 0.0, None, true);
        assert!(!check.passed, "structural halt must survive daily reset");
    }

    #[test]
    fn daily_loss_halt_clears_on_reset() {
        let mut rm = manager();
        // Trip the rollback daily-drop trigger (15% default)
        let check = rm.check_rollback_triggers(800.0, 1000.0);
        assert!(!check.passed);
        assert!(rm.is_halted());
        rm.reset_daily();
        assert!(!rm.is_halted(), "daily-drop halt clears with the day");
    }

    #[test]
    fn consecutive_loss_halt_and_unhalt() {
        let mut rm = manager();
        for _ in 0..3 {
            rm.record_trade_result(-1.0);
        }
        let check = rm.check_signal(&buy("BTC/USD", 0.05), 1000.0, 0, 0.0, None, true);
        assert!(!check.passed);
        assert!(check.reason.contains("consecutive losses"));

        rm.unhalt();
        assert!(rm
            .check_signal(&buy("BTC/USD", 0.05), 1000.0, 0, 0.0, None, true)
            .passed);
    }

    #[test]
    fn winning_trade_resets_streak() {
        let mut rm = manager();
        rm.record_trade_result(-1.0);
        rm.record_trade_result(-1.0);
        rm.record_trade_result(0.5);
        assert_eq!(rm.consecutive_losses(), 0);
    }

    #[test]
    fn max_positions_does_not_block_average_in() {
        let mut rm = manager();
        let check = rm.check_signal(&buy("BTC/USD", 0.05), 1000.0, 5, 0.0, None, false);
        assert!(check.passed, "average-in must bypass max_positions");
        let check = rm.check_signal(&buy("BTC/USD", 0.05), 1000.0, 5, 0.0, None, true);
        assert!(!check.passed);
    }

    #[test]
    fn per_symbol_cap_counts_existing_exposure() {
        let mut rm = manager();
        // 0.10 trade on top of 200 existing = 300 > 250 cap
        let check = rm.check_signal(&buy("BTC/USD", 0.10), 1000.0, 1, 200.0, None, false);
        assert!(!check.passed);
        assert!(check.reason.contains("Position size"));
    }

    #[test]
    fn clamp_reduces_size_without_rejecting() {
        let rm = manager();
        let mut sig = buy("BTC/USD", 0.5);
        rm.clamp_signal(&mut sig);
        assert!((sig.size_pct - 0.10).abs() < 1e-12);
    }

    #[test]
    fn entry_with_zero_size_rejected() {
        let mut rm = manager();
        let check = rm.check_signal(&buy("BTC/USD", 0.0), 1000.0, 0, 0.0, None, true);
        assert!(!check.passed);
        assert!(check.reason.contains("Invalid size_pct"));
    }
}
