use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::error::BacktestError;
use crate::types::{EntryRecord, ExitReason, Position, Trade, TradeSide};

/// Epsilon under which a remaining quantity counts as fully closed.
const FULLY_CLOSED_EPSILON: f64 = 1e-8;

/// Everything needed to open a position.
#[derive(Debug, Clone)]
pub struct OpenRequest {
    pub side: TradeSide,
    pub price: f64,
    pub quantity: f64,
    pub leverage: f64,
    pub timestamp: DateTime<Utc>,
    /// Quote-currency amount committed by the initial entry.
    pub investment: f64,
    pub take_profit_price: Option<f64>,
    pub stop_loss_price: Option<f64>,
    pub entry_reason: Option<String>,
    pub entry_rsi: Option<f64>,
    pub entry_atr: Option<f64>,
    pub is_dual_side: bool,
    pub main_position_side: Option<TradeSide>,
    pub dual_side_entry_index: Option<u32>,
    pub parent_trade_id: Option<u64>,
}

/// Owns one `Option<Position>` and the trade log it produces.
#[derive(Debug, Clone)]
pub struct PositionManager {
    fee_rate: f64,
    position: Option<Position>,
    trade_counter: u64,
    trades: Vec<Trade>,
}

impl PositionManager {
    pub fn new(fee_rate: f64) -> Self {
        debug!("PositionManager initialized with fee_rate={}%", fee_rate * 100.0);
        Self {
            fee_rate,
            position: None,
            trade_counter: 0,
            trades: Vec::new(),
        }
    }

    pub fn has_position(&self) -> bool {
        self.position.is_some()
    }

    pub fn position(&self) -> Option<&Position> {
        self.position.as_ref()
    }

    pub fn position_mut(&mut self) -> Option<&mut Position> {
        self.position.as_mut()
    }

    pub fn trades(&self) -> &[Trade] {
        &self.trades
    }

    pub fn take_trades(&mut self) -> Vec<Trade> {
        std::mem::take(&mut self.trades)
    }

    pub fn trade_counter(&self) -> u64 {
        self.trade_counter
    }

    /// Open a new position. Fails if one is already open.
    pub fn open(&mut self, request: OpenRequest) -> Result<&mut Position, BacktestError> {
        if self.position.is_some() {
            return Err(BacktestError::PositionInvariantViolation(
                "position already exists, close the current position first".to_string(),
            ));
        }

        let initial_entry = EntryRecord {
            price: request.price,
            quantity: request.quantity,
            investment: request.investment,
            timestamp: request.timestamp,
            reason: request
                .entry_reason
                .clone()
                .unwrap_or_else(|| "initial_entry".to_string()),
            dca_index: 0,
        };

        let position = Position {
            side: request.side,
            entry_timestamp: request.timestamp,
            entry_price: request.price,
            quantity: request.quantity,
            leverage: request.leverage,
            take_profit_price: request.take_profit_price,
            stop_loss_price: request.stop_loss_price,
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
            entry_reason: request.entry_reason,
            entry_rsi: request.entry_rsi,
            entry_atr: request.entry_atr,
            dca_count: 0,
            entry_history: vec![initial_entry],
            dca_levels: Vec::new(),
            initial_investment: request.investment,
            total_investment: request.investment,
            last_filled_price: request.price,
            is_dual_side: request.is_dual_side,
            main_position_side: request.main_position_side,
            dual_side_entry_index: request.dual_side_entry_index,
            parent_trade_id: request.parent_trade_id,
        };

        self.trade_counter += 1;

        info!(
            "Position opened: {} @ {:.2}, qty={:.6}, leverage={}x, investment={:.2}",
            position.side, position.entry_price, position.quantity, position.leverage,
            position.total_investment
        );

        self.position = Some(position);
        Ok(self.position.as_mut().unwrap())
    }

    /// Add a DCA entry to the open position.
    pub fn add_to_position(
        &mut self,
        price: f64,
        quantity: f64,
        investment: f64,
        timestamp: DateTime<Utc>,
        reason: &str,
    ) -> Result<&mut Position, BacktestError> {
        let position = self.position.as_mut().ok_or_else(|| {
            BacktestError::PositionInvariantViolation(
                "cannot add to position: no position exists".to_string(),
            )
        })?;

        position.add_entry(price, quantity, investment, timestamp, reason);

        info!(
            "DCA entry #{}: {} @ {:.2}, qty={:.6}, investment={:.2}; avg={:.2}, total_qty={:.6}",
            position.dca_count, position.side, price, quantity, investment, position.entry_price,
            position.quantity
        );

        Ok(position)
    }

    /// Close the open position in full and emit the trade record.
    pub fn close(
        &mut self,
        exit_price: f64,
        timestamp: DateTime<Utc>,
        exit_reason: ExitReason,
    ) -> Option<Trade> {
        let pos = match self.position.take() {
            Some(pos) => pos,
            None => {
                warn!("Attempted to close position when none exists");
                return None;
            }
        };

        let avg_entry_price = pos.average_entry_price();
        let close_quantity = pos.current_quantity();

        // Entry leg is charged at the average entry price.
        let entry_fee = avg_entry_price * close_quantity * self.fee_rate;
        let exit_fee = exit_price * close_quantity * self.fee_rate;

        let (price_diff, pnl_percent) = match pos.side {
            TradeSide::Long => (
                exit_price - avg_entry_price,
                ((exit_price / avg_entry_price) - 1.0) * 100.0,
            ),
            TradeSide::Short => (
                avg_entry_price - exit_price,
                ((avg_entry_price / exit_price) - 1.0) * 100.0,
            ),
        };

        let gross_pnl = price_diff * close_quantity * pos.leverage;
        let net_pnl = gross_pnl - (entry_fee + exit_fee);

        let trade = Trade {
            trade_number: self.trade_counter,
            side: pos.side,
            entry_timestamp: pos.entry_timestamp,
            entry_price: avg_entry_price,
            entry_reason: pos.entry_reason.clone(),
            exit_timestamp: timestamp,
            exit_price,
            exit_reason,
            quantity: close_quantity,
            leverage: pos.leverage,
            pnl: net_pnl,
            pnl_percent,
            entry_fee,
            exit_fee,
            take_profit_price: pos.take_profit_price,
            stop_loss_price: pos.stop_loss_price,
            trailing_stop_price: pos.trailing_stop_price,
            tp1_price: pos.tp1_price,
            tp2_price: pos.tp2_price,
            tp3_price: pos.tp3_price,
            next_dca_levels: pos.dca_levels.clone(),
            entry_rsi: pos.entry_rsi,
            entry_atr: pos.entry_atr,
            dca_count: pos.dca_count,
            entry_history: pos.entry_history.clone(),
            total_investment: pos.total_investment,
            is_partial_exit: false,
            tp_level: None,
            exit_ratio: None,
            remaining_quantity: None,
            is_dual_side: pos.is_dual_side,
            main_position_side: pos.main_position_side,
            dual_side_entry_index: pos.dual_side_entry_index,
            parent_trade_id: pos.parent_trade_id,
        };

        info!(
            "Position closed: {} @ {:.2}, avg_entry={:.2}, pnl={:.2} ({:.2}%), dca_count={}, reason={}",
            trade.side, exit_price, avg_entry_price, net_pnl, pnl_percent, trade.dca_count,
            exit_reason
        );

        self.trades.push(trade.clone());
        Some(trade)
    }

    /// Close part of the position at a TP level. `exit_ratio` refers to the
    /// original total quantity; `current_stop_loss` is the SL that was
    /// valid during this sub-trade, recorded before any break-even
    /// promotion that follows it.
    pub fn partial_close(
        &mut self,
        exit_price: f64,
        timestamp: DateTime<Utc>,
        tp_level: u8,
        exit_ratio: f64,
        current_stop_loss: Option<f64>,
    ) -> Option<Trade> {
        let pos = match self.position.as_mut() {
            Some(pos) => pos,
            None => {
                warn!("Attempted to partially close position when none exists");
                return None;
            }
        };

        let avg_entry_price = pos.average_entry_price();
        let fill = pos.partial_exit(tp_level, exit_ratio);
        let close_quantity = fill.closed_quantity;

        let entry_fee = avg_entry_price * close_quantity * self.fee_rate;
        let exit_fee = exit_price * close_quantity * self.fee_rate;

        let (price_diff, pnl_percent) = match pos.side {
            TradeSide::Long => (
                exit_price - avg_entry_price,
                ((exit_price / avg_entry_price) - 1.0) * 100.0,
            ),
            TradeSide::Short => (
                avg_entry_price - exit_price,
                ((avg_entry_price / exit_price) - 1.0) * 100.0,
            ),
        };

        let gross_pnl = price_diff * close_quantity * pos.leverage;
        let net_pnl = gross_pnl - (entry_fee + exit_fee);

        let stop_loss_for_record = current_stop_loss.or(pos.stop_loss_price);

        let trade = Trade {
            trade_number: self.trade_counter,
            side: pos.side,
            entry_timestamp: pos.entry_timestamp,
            entry_price: avg_entry_price,
            entry_reason: pos.entry_reason.clone(),
            exit_timestamp: timestamp,
            exit_price,
            exit_reason: ExitReason::for_tp_level(tp_level),
            quantity: close_quantity,
            leverage: pos.leverage,
            pnl: net_pnl,
            pnl_percent,
            entry_fee,
            exit_fee,
            take_profit_price: pos.take_profit_price,
            stop_loss_price: stop_loss_for_record,
            trailing_stop_price: pos.trailing_stop_price,
            tp1_price: pos.tp1_price,
            tp2_price: pos.tp2_price,
            tp3_price: pos.tp3_price,
            next_dca_levels: pos.dca_levels.clone(),
            entry_rsi: pos.entry_rsi,
            entry_atr: pos.entry_atr,
            dca_count: pos.dca_count,
            entry_history: pos.entry_history.clone(),
            total_investment: pos.total_investment,
            is_partial_exit: true,
            tp_level: Some(tp_level),
            exit_ratio: Some(exit_ratio),
            remaining_quantity: Some(fill.remaining_quantity),
            is_dual_side: pos.is_dual_side,
            main_position_side: pos.main_position_side,
            dual_side_entry_index: pos.dual_side_entry_index,
            parent_trade_id: pos.parent_trade_id,
        };

        info!(
            "Partial exit TP{}: {} @ {:.2}, closed={:.6} ({:.1}%), remaining={:.6}, pnl={:.2}",
            tp_level,
            trade.side,
            exit_price,
            close_quantity,
            exit_ratio * 100.0,
            fill.remaining_quantity,
            net_pnl
        );

        self.trades.push(trade.clone());

        if fill.remaining_quantity < FULLY_CLOSED_EPSILON {
            debug!(
                "All quantity closed via partial exits: remaining={:.12}, clearing position",
                fill.remaining_quantity
            );
            self.position = None;
        }

        Some(trade)
    }

    /// Arm the trailing stop on the remaining position after a TP fill.
    /// No-op when no position exists or the stop is already armed.
    pub fn activate_trailing_stop_after_tp(
        &mut self,
        current_price: f64,
        trailing_offset: f64,
        tp_level: Option<u8>,
    ) -> bool {
        let pos = match self.position.as_mut() {
            Some(pos) => pos,
            None => {
                warn!("Cannot activate trailing stop: no position exists");
                return false;
            }
        };

        if pos.trailing_stop_activated {
            debug!("Trailing stop already activated, skipping");
            return false;
        }

        pos.activate_trailing_stop(current_price, trailing_offset, tp_level);

        info!(
            "Trailing stop activated: side={}, price={:.2}, offset={:.4}, stop={:.2}, remaining={:.6}",
            pos.side,
            current_price,
            trailing_offset,
            pos.trailing_stop_price.unwrap_or(0.0),
            pos.current_quantity()
        );

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 0, minute, 0).unwrap()
    }

    fn open_long(manager: &mut PositionManager, price: f64, quantity: f64) {
        manager
            .open(OpenRequest {
                side: TradeSide::Long,
                price,
                quantity,
                leverage: 10.0,
                timestamp: ts(0),
                investment: 100.0,
                take_profit_price: None,
                stop_loss_price: None,
                entry_reason: Some("test".to_string()),
                entry_rsi: None,
                entry_atr: None,
                is_dual_side: false,
                main_position_side: None,
                dual_side_entry_index: None,
                parent_trade_id: None,
            })
            .unwrap();
    }

    #[test]
    fn test_double_open_is_invariant_violation() {
        let mut manager = PositionManager::new(0.0);
        open_long(&mut manager, 100.0, 10.0);

        let err = manager
            .open(OpenRequest {
                side: TradeSide::Short,
                price: 100.0,
                quantity: 1.0,
                leverage: 1.0,
                timestamp: ts(1),
                investment: 10.0,
                take_profit_price: None,
                stop_loss_price: None,
                entry_reason: None,
                entry_rsi: None,
                entry_atr: None,
                is_dual_side: false,
                main_position_side: None,
                dual_side_entry_index: None,
                parent_trade_id: None,
            })
            .unwrap_err();
        assert!(matches!(err, BacktestError::PositionInvariantViolation(_)));
    }

    #[test]
    fn test_close_pnl_and_fees() {
        let mut manager = PositionManager::new(0.001);
        open_long(&mut manager, 100.0, 10.0);

        let trade = manager.close(101.0, ts(5), ExitReason::TakeProfit).unwrap();
        let entry_fee = 100.0 * 10.0 * 0.001;
        let exit_fee = 101.0 * 10.0 * 0.001;

        assert!((trade.entry_fee - entry_fee).abs() < 1e-9);
        assert!((trade.exit_fee - exit_fee).abs() < 1e-9);
        // gross = 1 * 10 * 10 = 100
        assert!((trade.pnl - (100.0 - entry_fee - exit_fee)).abs() < 1e-9);
        assert!((trade.pnl_percent - 1.0).abs() < 1e-9);
        assert!(!manager.has_position());
        assert_eq!(manager.trades().len(), 1);
    }

    #[test]
    fn test_short_close_pnl() {
        let mut manager = PositionManager::new(0.0);
        manager
            .open(OpenRequest {
                side: TradeSide::Short,
                price: 100.0,
                quantity: 10.0,
                leverage: 5.0,
                timestamp: ts(0),
                investment: 200.0,
                take_profit_price: None,
                stop_loss_price: None,
                entry_reason: None,
                entry_rsi: None,
                entry_atr: None,
                is_dual_side: false,
                main_position_side: None,
                dual_side_entry_index: None,
                parent_trade_id: None,
            })
            .unwrap();

        let trade = manager.close(98.0, ts(3), ExitReason::TakeProfit).unwrap();
        // (100 - 98) * 10 * 5
        assert!((trade.pnl - 100.0).abs() < 1e-9);
        assert!((trade.pnl_percent - ((100.0 / 98.0) - 1.0) * 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_partial_close_sequence_conserves_quantity() {
        let mut manager = PositionManager::new(0.0);
        open_long(&mut manager, 100.0, 10.0);
        {
            let pos = manager.position_mut().unwrap();
            pos.use_tp1 = true;
            pos.use_tp2 = true;
            pos.use_tp3 = true;
            pos.tp1_ratio = 0.3;
            pos.tp2_ratio = 0.3;
            pos.tp3_ratio = 0.4;
        }

        let t1 = manager.partial_close(102.0, ts(1), 1, 0.3, Some(98.0)).unwrap();
        assert!(t1.is_partial_exit);
        assert_eq!(t1.tp_level, Some(1));
        assert_eq!(t1.stop_loss_price, Some(98.0));
        assert!((t1.remaining_quantity.unwrap() - 7.0).abs() < 1e-9);
        assert!(manager.has_position());

        let t2 = manager.partial_close(103.0, ts(2), 2, 0.3, Some(100.0)).unwrap();
        let t3 = manager.partial_close(104.0, ts(3), 3, 0.4, Some(102.0)).unwrap();

        // All quantity accounted for, slot cleared below epsilon.
        let closed: f64 = t1.quantity + t2.quantity + t3.quantity;
        assert!((closed - 10.0).abs() < 1e-9);
        assert!(!manager.has_position());
    }

    #[test]
    fn test_activate_trailing_stop_after_tp() {
        let mut manager = PositionManager::new(0.0);
        open_long(&mut manager, 100.0, 10.0);

        assert!(manager.activate_trailing_stop_after_tp(103.0, 1.03, Some(2)));
        // Already armed.
        assert!(!manager.activate_trailing_stop_after_tp(104.0, 1.03, Some(3)));

        let pos = manager.position().unwrap();
        assert!(pos.trailing_stop_activated);
        assert_eq!(pos.trailing_start_point, Some(2));
        assert!((pos.trailing_stop_price.unwrap() - 101.97).abs() < 1e-9);
    }
}
