use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::position::EntryRecord;

/// Position direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeSide {
    Long,
    Short,
}

impl TradeSide {
    pub fn opposite(&self) -> TradeSide {
        match self {
            TradeSide::Long => TradeSide::Short,
            TradeSide::Short => TradeSide::Long,
        }
    }

    /// +1 for long, -1 for short. Used for price-offset arithmetic.
    pub fn direction(&self) -> f64 {
        match self {
            TradeSide::Long => 1.0,
            TradeSide::Short => -1.0,
        }
    }
}

impl fmt::Display for TradeSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TradeSide::Long => write!(f, "long"),
            TradeSide::Short => write!(f, "short"),
        }
    }
}

/// Reason a trade (partial or full) was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    TakeProfit,
    Tp1,
    Tp2,
    Tp3,
    StopLoss,
    TrailingStop,
    BreakEven,
    /// Trend-reversal exit.
    Signal,
    HedgeTp,
    HedgeSl,
    /// Cascade close triggered by the other side.
    LinkedExit,
    /// Position held until the end of the backtest window.
    BacktestEnd,
}

impl ExitReason {
    pub fn for_tp_level(level: u8) -> ExitReason {
        match level {
            1 => ExitReason::Tp1,
            2 => ExitReason::Tp2,
            3 => ExitReason::Tp3,
            _ => ExitReason::TakeProfit,
        }
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExitReason::TakeProfit => "take_profit",
            ExitReason::Tp1 => "tp1",
            ExitReason::Tp2 => "tp2",
            ExitReason::Tp3 => "tp3",
            ExitReason::StopLoss => "stop_loss",
            ExitReason::TrailingStop => "trailing_stop",
            ExitReason::BreakEven => "break_even",
            ExitReason::Signal => "signal",
            ExitReason::HedgeTp => "hedge_tp",
            ExitReason::HedgeSl => "hedge_sl",
            ExitReason::LinkedExit => "linked_exit",
            ExitReason::BacktestEnd => "backtest_end",
        };
        write!(f, "{}", s)
    }
}

/// Record of a completed (partial or full) close.
///
/// For DCA positions `entry_price` is the average across all entries and
/// `entry_history` carries the full fill-by-fill record. For partial exits
/// `stop_loss_price` is the SL that was valid during this sub-trade, before
/// any break-even promotion that followed it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub trade_number: u64,
    pub side: TradeSide,

    // Entry
    pub entry_timestamp: DateTime<Utc>,
    pub entry_price: f64,
    pub entry_reason: Option<String>,

    // Exit
    pub exit_timestamp: DateTime<Utc>,
    pub exit_price: f64,
    pub exit_reason: ExitReason,

    // Sizing
    pub quantity: f64,
    pub leverage: f64,

    // P&L
    pub pnl: f64,
    pub pnl_percent: f64,
    pub entry_fee: f64,
    pub exit_fee: f64,

    // Price levels at exit time
    pub take_profit_price: Option<f64>,
    pub stop_loss_price: Option<f64>,
    pub trailing_stop_price: Option<f64>,
    pub tp1_price: Option<f64>,
    pub tp2_price: Option<f64>,
    pub tp3_price: Option<f64>,
    pub next_dca_levels: Vec<f64>,

    // Entry indicators
    pub entry_rsi: Option<f64>,
    pub entry_atr: Option<f64>,

    // DCA metadata
    pub dca_count: u32,
    pub entry_history: Vec<EntryRecord>,
    pub total_investment: f64,

    // Partial exit metadata
    pub is_partial_exit: bool,
    pub tp_level: Option<u8>,
    pub exit_ratio: Option<f64>,
    pub remaining_quantity: Option<f64>,

    // Hedge provenance
    pub is_dual_side: bool,
    pub main_position_side: Option<TradeSide>,
    pub dual_side_entry_index: Option<u32>,
    pub parent_trade_id: Option<u64>,
}

impl Trade {
    pub fn total_fees(&self) -> f64 {
        self.entry_fee + self.exit_fee
    }

    pub fn duration_seconds(&self) -> f64 {
        (self.exit_timestamp - self.entry_timestamp).num_milliseconds() as f64 / 1000.0
    }
}
