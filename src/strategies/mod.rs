pub mod hyperrsi;
pub mod signal_generator;

pub use hyperrsi::*;
pub use signal_generator::*;

use serde::{Deserialize, Serialize};

use crate::engine::dca::DcaSettings;
use crate::engine::dual_side::DualSideSettings;
use crate::types::{Candle, TradeSide};

/// Indicator values captured at signal time.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SignalIndicators {
    pub rsi: Option<f64>,
    pub previous_rsi: Option<f64>,
    pub trend_state: Option<i8>,
    pub atr: Option<f64>,
}

/// Entry decision for one bar. `side: None` means no trade.
#[derive(Debug, Clone)]
pub struct TradingSignal {
    pub side: Option<TradeSide>,
    pub reason: String,
    pub indicators: SignalIndicators,
}

impl TradingSignal {
    pub fn none(reason: impl Into<String>, indicators: SignalIndicators) -> Self {
        Self {
            side: None,
            reason: reason.into(),
            indicators,
        }
    }
}

/// TP1/TP2/TP3 price levels; `None` for disabled levels.
#[derive(Debug, Clone, Copy, Default)]
pub struct TpLevels {
    pub tp1: Option<f64>,
    pub tp2: Option<f64>,
    pub tp3: Option<f64>,
}

/// Exit orchestration configuration the engine reads from the strategy.
#[derive(Debug, Clone, Default)]
pub struct ExitRules {
    pub use_tp1: bool,
    pub use_tp2: bool,
    pub use_tp3: bool,
    /// Fractions of the original total quantity, in (0, 1].
    pub tp1_ratio: f64,
    pub tp2_ratio: f64,
    pub tp3_ratio: f64,
    /// Gates regular stop-loss exits; break-even exits always apply.
    pub use_sl: bool,
    pub use_trend_close: bool,
    pub use_break_even: bool,
    pub use_break_even_tp2: bool,
    pub use_break_even_tp3: bool,
    pub trailing_stop_active: bool,
    /// TP level (1-3) whose fill arms the trailing stop.
    pub trailing_start_point: u8,
}

/// Pluggable strategy boundary: signal, sizing, TP/SL computation, and the
/// on-demand indicator recomputation surface the engine consumes.
pub trait Strategy: Send {
    fn name(&self) -> &'static str;

    /// Generate the entry decision for the current bar. Implementations
    /// also advance their internal candle history here.
    fn generate_signal(&mut self, candle: &Candle) -> TradingSignal;

    /// Returns (quantity, leverage) for a fresh entry.
    fn calculate_position_size(
        &self,
        signal: &TradingSignal,
        current_balance: f64,
        current_price: f64,
    ) -> (f64, f64);

    /// Quote amount committed to a fresh entry at the given balance.
    fn entry_investment(&self, current_balance: f64) -> f64;

    /// Returns (take_profit, stop_loss); `None` for disabled features.
    fn calculate_tp_sl(
        &self,
        side: TradeSide,
        entry_price: f64,
        candle: &Candle,
    ) -> (Option<f64>, Option<f64>);

    fn calculate_tp_levels(
        &self,
        side: TradeSide,
        entry_price: f64,
        atr_value: Option<f64>,
    ) -> TpLevels;

    /// Absolute price offset maintained by the trailing stop.
    fn calculate_trailing_offset(
        &self,
        side: TradeSide,
        current_price: f64,
        tp2_price: Option<f64>,
        tp3_price: Option<f64>,
    ) -> f64;

    /// Whether the trailing stop should arm at the given unrealized P&L.
    fn should_activate_trailing_stop(&self, unrealized_pnl_percent: f64) -> bool;

    /// RSI recomputed from the strategy's candle history.
    fn compute_rsi(&self) -> Option<f64>;

    /// (EMA, SMA) trend averages recomputed from the candle history.
    fn compute_trend_averages(&self) -> (Option<f64>, Option<f64>);

    /// Trend state recomputed from the candle history; `None` below the
    /// minimum history for the classification.
    fn compute_trend_state(&self) -> Option<i8>;

    fn exit_rules(&self) -> &ExitRules;

    fn dca_settings(&self) -> &DcaSettings;

    fn dual_side_settings(&self) -> &DualSideSettings;
}
