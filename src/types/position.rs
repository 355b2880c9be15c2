use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::trade::{ExitReason, TradeSide};

/// One row in a position's entry history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryRecord {
    pub price: f64,
    pub quantity: f64,
    /// Quote-currency amount committed by this entry.
    pub investment: f64,
    pub timestamp: DateTime<Utc>,
    pub reason: String,
    /// 0 for the initial entry, then 1, 2, ... per DCA fill.
    pub dca_index: u32,
}

/// Result of applying a partial exit to the position state.
#[derive(Debug, Clone, Copy)]
pub struct PartialExitFill {
    pub closed_quantity: f64,
    pub remaining_quantity: f64,
}

/// Mutable state of an open position with DCA and partial-exit support.
///
/// `entry_price` and `quantity` mirror the averages derived from
/// `entry_history` and are recomputed after every DCA fill.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub side: TradeSide,
    pub entry_timestamp: DateTime<Utc>,
    /// Average entry price across all entries.
    pub entry_price: f64,
    /// Total quantity across all entries.
    pub quantity: f64,
    pub leverage: f64,

    // TP/SL management
    pub take_profit_price: Option<f64>,
    pub stop_loss_price: Option<f64>,
    pub trailing_stop_price: Option<f64>,
    pub trailing_stop_activated: bool,
    /// Absolute price distance maintained by the trailing stop.
    pub trailing_offset: Option<f64>,
    /// TP level that activated the trailing stop, if TP-triggered.
    pub trailing_start_point: Option<u8>,
    /// Highest price seen since trailing activation (long positions).
    pub highest_price: Option<f64>,
    /// Lowest price seen since trailing activation (short positions).
    pub lowest_price: Option<f64>,

    // Partial exits (TP1/TP2/TP3)
    pub use_tp1: bool,
    pub use_tp2: bool,
    pub use_tp3: bool,
    pub tp1_price: Option<f64>,
    pub tp2_price: Option<f64>,
    pub tp3_price: Option<f64>,
    /// Ratios are fractions of the original total quantity.
    pub tp1_ratio: f64,
    pub tp2_ratio: f64,
    pub tp3_ratio: f64,
    pub tp1_filled: bool,
    pub tp2_filled: bool,
    pub tp3_filled: bool,
    /// Open size after partial exits; `None` means untouched.
    pub remaining_quantity: Option<f64>,

    // P&L tracking
    pub unrealized_pnl: f64,
    pub unrealized_pnl_percent: f64,
    pub highest_pnl: f64,
    pub lowest_pnl: f64,

    // Entry context
    pub entry_reason: Option<String>,
    pub entry_rsi: Option<f64>,
    pub entry_atr: Option<f64>,

    // DCA tracking
    pub dca_count: u32,
    pub entry_history: Vec<EntryRecord>,
    /// Remaining trigger prices, consumed front-to-back.
    pub dca_levels: Vec<f64>,
    pub initial_investment: f64,
    pub total_investment: f64,
    pub last_filled_price: f64,

    // Hedge provenance
    pub is_dual_side: bool,
    pub main_position_side: Option<TradeSide>,
    pub dual_side_entry_index: Option<u32>,
    pub parent_trade_id: Option<u64>,
}

impl Position {
    /// Quantity-weighted average entry price from the entry history.
    pub fn average_entry_price(&self) -> f64 {
        if self.entry_history.is_empty() {
            return self.entry_price;
        }

        let total_cost: f64 = self
            .entry_history
            .iter()
            .map(|e| e.price * e.quantity)
            .sum();
        let total_quantity: f64 = self.entry_history.iter().map(|e| e.quantity).sum();

        if total_quantity == 0.0 {
            return self.entry_price;
        }

        total_cost / total_quantity
    }

    /// Total quantity across all entries.
    pub fn total_quantity(&self) -> f64 {
        if self.entry_history.is_empty() {
            return self.quantity;
        }
        self.entry_history.iter().map(|e| e.quantity).sum()
    }

    /// Open quantity after partial exits.
    pub fn current_quantity(&self) -> f64 {
        match self.remaining_quantity {
            Some(remaining) => remaining,
            None => self.total_quantity(),
        }
    }

    /// Unrealized P&L at the given price, against the average entry.
    pub fn unrealized_pnl_amount(&self, current_price: f64) -> f64 {
        let avg_price = self.average_entry_price();
        let total_qty = self.total_quantity();

        let price_diff = match self.side {
            TradeSide::Long => current_price - avg_price,
            TradeSide::Short => avg_price - current_price,
        };

        price_diff * total_qty * self.leverage
    }

    /// Recompute the unrealized P&L snapshot and high/low watermarks.
    pub fn update_unrealized_pnl(&mut self, current_price: f64) {
        self.unrealized_pnl = self.unrealized_pnl_amount(current_price);

        if self.total_investment > 0.0 {
            self.unrealized_pnl_percent = (self.unrealized_pnl / self.total_investment) * 100.0;
        } else {
            self.unrealized_pnl_percent = 0.0;
        }

        if self.unrealized_pnl > self.highest_pnl {
            self.highest_pnl = self.unrealized_pnl;
        }
        if self.unrealized_pnl < self.lowest_pnl {
            self.lowest_pnl = self.unrealized_pnl;
        }
    }

    /// Append a DCA entry and refresh the derived averages.
    pub fn add_entry(
        &mut self,
        price: f64,
        quantity: f64,
        investment: f64,
        timestamp: DateTime<Utc>,
        reason: &str,
    ) {
        let dca_index = self.dca_count + 1;
        self.entry_history.push(EntryRecord {
            price,
            quantity,
            investment,
            timestamp,
            reason: reason.to_string(),
            dca_index,
        });

        self.dca_count = dca_index;
        self.last_filled_price = price;
        self.total_investment += investment;
        self.entry_price = self.average_entry_price();
        self.quantity = self.total_quantity();
    }

    /// Apply a partial exit. The ratio refers to the original total
    /// quantity, clamped so the close never exceeds what remains.
    pub fn partial_exit(&mut self, tp_level: u8, exit_ratio: f64) -> PartialExitFill {
        let current = self.current_quantity();
        let mut closed = self.total_quantity() * exit_ratio;
        if closed > current {
            closed = current;
        }

        let remaining = current - closed;
        self.remaining_quantity = Some(remaining);

        match tp_level {
            1 => self.tp1_filled = true,
            2 => self.tp2_filled = true,
            3 => self.tp3_filled = true,
            _ => {}
        }

        PartialExitFill {
            closed_quantity: closed,
            remaining_quantity: remaining,
        }
    }

    pub fn tp_price(&self, level: u8) -> Option<f64> {
        match level {
            1 => self.tp1_price,
            2 => self.tp2_price,
            3 => self.tp3_price,
            _ => None,
        }
    }

    pub fn tp_ratio(&self, level: u8) -> f64 {
        match level {
            1 => self.tp1_ratio,
            2 => self.tp2_ratio,
            3 => self.tp3_ratio,
            _ => 0.0,
        }
    }

    pub fn has_partial_exits(&self) -> bool {
        self.use_tp1 || self.use_tp2 || self.use_tp3
    }

    pub fn all_tp_levels_filled(&self) -> bool {
        if self.use_tp1 && !self.tp1_filled {
            return false;
        }
        if self.use_tp2 && !self.tp2_filled {
            return false;
        }
        if self.use_tp3 && !self.tp3_filled {
            return false;
        }
        true
    }

    /// First unfilled TP level reached at the given price, if any.
    ///
    /// TP3 is skipped while the trailing stop is active; the trailing stop
    /// replaces it as the final exit.
    pub fn should_exit_partial(&self, current_price: f64) -> Option<u8> {
        let reached = |tp: f64| match self.side {
            TradeSide::Long => current_price >= tp,
            TradeSide::Short => current_price <= tp,
        };

        if self.use_tp1 && !self.tp1_filled {
            if let Some(tp) = self.tp1_price {
                if reached(tp) {
                    return Some(1);
                }
            }
        }
        if self.use_tp2 && !self.tp2_filled {
            if let Some(tp) = self.tp2_price {
                if reached(tp) {
                    return Some(2);
                }
            }
        }
        if self.use_tp3 && !self.tp3_filled && !self.trailing_stop_activated {
            if let Some(tp) = self.tp3_price {
                if reached(tp) {
                    return Some(3);
                }
            }
        }

        None
    }

    /// Full-close check: fallback take profit (only when no partial TPs are
    /// configured), then trailing stop, then stop loss.
    ///
    /// A stop-loss hit is classified as break-even when the SL sits at or
    /// beyond the average entry in the position's favor.
    pub fn should_exit_full(&self, current_price: f64) -> Option<ExitReason> {
        let has_partial_exits = self.has_partial_exits();

        match self.side {
            TradeSide::Long => {
                if !has_partial_exits {
                    if let Some(tp) = self.take_profit_price {
                        if current_price >= tp {
                            return Some(ExitReason::TakeProfit);
                        }
                    }
                }
                if let Some(trailing) = self.trailing_stop_price {
                    if current_price <= trailing {
                        return Some(ExitReason::TrailingStop);
                    }
                }
                if let Some(sl) = self.stop_loss_price {
                    if current_price <= sl {
                        return Some(if sl >= self.average_entry_price() {
                            ExitReason::BreakEven
                        } else {
                            ExitReason::StopLoss
                        });
                    }
                }
            }
            TradeSide::Short => {
                if !has_partial_exits {
                    if let Some(tp) = self.take_profit_price {
                        if current_price <= tp {
                            return Some(ExitReason::TakeProfit);
                        }
                    }
                }
                if let Some(trailing) = self.trailing_stop_price {
                    if current_price >= trailing {
                        return Some(ExitReason::TrailingStop);
                    }
                }
                if let Some(sl) = self.stop_loss_price {
                    if current_price >= sl {
                        return Some(if sl <= self.average_entry_price() {
                            ExitReason::BreakEven
                        } else {
                            ExitReason::StopLoss
                        });
                    }
                }
            }
        }

        None
    }

    /// Classify a stop-loss hit at the current SL level.
    pub fn is_break_even_stop(&self) -> bool {
        match (self.stop_loss_price, self.side) {
            (Some(sl), TradeSide::Long) => sl >= self.average_entry_price(),
            (Some(sl), TradeSide::Short) => sl <= self.average_entry_price(),
            (None, _) => false,
        }
    }

    /// Arm the trailing stop at the given price with a fixed offset.
    pub fn activate_trailing_stop(
        &mut self,
        current_price: f64,
        trailing_offset: f64,
        tp_level: Option<u8>,
    ) {
        match self.side {
            TradeSide::Long => {
                self.highest_price = Some(current_price);
                self.trailing_stop_price = Some(current_price - trailing_offset);
            }
            TradeSide::Short => {
                self.lowest_price = Some(current_price);
                self.trailing_stop_price = Some(current_price + trailing_offset);
            }
        }

        self.trailing_stop_activated = true;
        self.trailing_offset = Some(trailing_offset);
        self.trailing_start_point = tp_level;
    }

    /// Ratchet the trailing stop. The stop only moves in the position's
    /// favor, never back.
    pub fn update_trailing_stop(&mut self, current_price: f64) {
        if !self.trailing_stop_activated {
            return;
        }
        let offset = match self.trailing_offset {
            Some(offset) => offset,
            None => return,
        };

        match self.side {
            TradeSide::Long => {
                if self.highest_price.map_or(true, |h| current_price > h) {
                    self.highest_price = Some(current_price);
                    self.trailing_stop_price = Some(current_price - offset);
                }
            }
            TradeSide::Short => {
                if self.lowest_price.map_or(true, |l| current_price < l) {
                    self.lowest_price = Some(current_price);
                    self.trailing_stop_price = Some(current_price + offset);
                }
            }
        }
    }

    /// Whether the trailing stop level is breached at the given price.
    pub fn trailing_stop_hit(&self, current_price: f64) -> bool {
        if !self.trailing_stop_activated {
            return false;
        }
        match (self.trailing_stop_price, self.side) {
            (Some(stop), TradeSide::Long) => current_price <= stop,
            (Some(stop), TradeSide::Short) => current_price >= stop,
            (None, _) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 15, 10, 0, 0).unwrap()
    }

    fn long_position(price: f64, quantity: f64) -> Position {
        Position {
            side: TradeSide::Long,
            entry_timestamp: ts(),
            entry_price: price,
            quantity,
            leverage: 10.0,
            take_profit_price: None,
            stop_loss_price: None,
            trailing_stop_price: None,
            trailing_stop_activated: false,
            trailing_offset: None,
            trailing_start_point: None,
            highest_price: None,
            lowest_price: None,
            use_tp1: false,
            use_tp2: false,
            use_tp3: false,
            tp1_price: None,
            tp2_price: None,
            tp3_price: None,
            tp1_ratio: 0.0,
            tp2_ratio: 0.0,
            tp3_ratio: 0.0,
            tp1_filled: false,
            tp2_filled: false,
            tp3_filled: false,
            remaining_quantity: None,
            unrealized_pnl: 0.0,
            unrealized_pnl_percent: 0.0,
            highest_pnl: 0.0,
            lowest_pnl: 0.0,
            entry_reason: None,
            entry_rsi: None,
            entry_atr: None,
            dca_count: 0,
            entry_history: vec![EntryRecord {
                price,
                quantity,
                investment: 100.0,
                timestamp: ts(),
                reason: "initial_entry".to_string(),
                dca_index: 0,
            }],
            dca_levels: Vec::new(),
            initial_investment: 100.0,
            total_investment: 100.0,
            last_filled_price: price,
            is_dual_side: false,
            main_position_side: None,
            dual_side_entry_index: None,
            parent_trade_id: None,
        }
    }

    #[test]
    fn test_average_entry_after_dca() {
        let mut pos = long_position(100.0, 10.0);
        pos.add_entry(95.0, 5.0, 50.0, ts(), "dca_1");

        let expected = (100.0 * 10.0 + 95.0 * 5.0) / 15.0;
        assert!((pos.average_entry_price() - expected).abs() < 1e-9);
        assert!((pos.total_quantity() - 15.0).abs() < 1e-12);
        assert_eq!(pos.dca_count, 1);
        assert_eq!(pos.last_filled_price, 95.0);
        assert!((pos.total_investment - 150.0).abs() < 1e-12);
    }

    #[test]
    fn test_partial_exit_ratio_of_original() {
        let mut pos = long_position(100.0, 10.0);
        pos.use_tp1 = true;
        pos.tp1_ratio = 0.3;

        let fill = pos.partial_exit(1, 0.3);
        assert!((fill.closed_quantity - 3.0).abs() < 1e-12);
        assert!((fill.remaining_quantity - 7.0).abs() < 1e-12);
        assert!(pos.tp1_filled);

        // Second exit of 80% of original is clamped to what remains.
        pos.use_tp2 = true;
        pos.tp2_ratio = 0.8;
        let fill = pos.partial_exit(2, 0.8);
        assert!((fill.closed_quantity - 7.0).abs() < 1e-12);
        assert!((fill.remaining_quantity - 0.0).abs() < 1e-12);
        assert!(pos.all_tp_levels_filled());
    }

    #[test]
    fn test_should_exit_partial_skips_tp3_when_trailing() {
        let mut pos = long_position(100.0, 10.0);
        pos.use_tp3 = true;
        pos.tp3_price = Some(104.0);
        pos.trailing_stop_activated = true;

        assert_eq!(pos.should_exit_partial(105.0), None);

        pos.trailing_stop_activated = false;
        assert_eq!(pos.should_exit_partial(105.0), Some(3));
    }

    #[test]
    fn test_trailing_stop_is_monotone() {
        let mut pos = long_position(100.0, 10.0);
        pos.activate_trailing_stop(103.0, 1.03, Some(2));
        assert!((pos.trailing_stop_price.unwrap() - 101.97).abs() < 1e-9);

        pos.update_trailing_stop(105.0);
        assert!((pos.trailing_stop_price.unwrap() - 103.97).abs() < 1e-9);

        // A lower price never lowers the stop.
        pos.update_trailing_stop(103.0);
        assert!((pos.trailing_stop_price.unwrap() - 103.97).abs() < 1e-9);
        assert!(pos.trailing_stop_hit(103.5));
    }

    #[test]
    fn test_break_even_classification() {
        let mut pos = long_position(100.0, 10.0);
        pos.stop_loss_price = Some(98.0);
        assert_eq!(pos.should_exit_full(97.0), Some(ExitReason::StopLoss));

        pos.stop_loss_price = Some(100.0);
        assert_eq!(pos.should_exit_full(99.0), Some(ExitReason::BreakEven));
        assert!(pos.is_break_even_stop());
    }

    #[test]
    fn test_full_tp_skipped_when_partial_configured() {
        let mut pos = long_position(100.0, 10.0);
        pos.take_profit_price = Some(101.0);
        assert_eq!(pos.should_exit_full(102.0), Some(ExitReason::TakeProfit));

        pos.use_tp1 = true;
        assert_eq!(pos.should_exit_full(102.0), None);
    }

    #[test]
    fn test_unrealized_pnl_watermarks() {
        let mut pos = long_position(100.0, 10.0);
        pos.update_unrealized_pnl(101.0);
        assert!((pos.unrealized_pnl - 100.0).abs() < 1e-9);
        assert!((pos.unrealized_pnl_percent - 100.0).abs() < 1e-9);

        pos.update_unrealized_pnl(99.0);
        assert!((pos.unrealized_pnl + 100.0).abs() < 1e-9);
        assert!((pos.highest_pnl - 100.0).abs() < 1e-9);
        assert!((pos.lowest_pnl + 100.0).abs() < 1e-9);
    }
}
