use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use super::signal_generator::{RsiEntryMode, SignalGenerator};
use super::{ExitRules, SignalIndicators, Strategy, TpLevels, TradingSignal};
use crate::engine::dca::{DcaSettings, DcaSpacing, EntryCriterion};
use crate::engine::dual_side::{DualRatioType, DualSideSettings, DualSlTrigger, DualTpTrigger};
use crate::error::BacktestError;
use crate::indicators;
use crate::types::{Candle, CandleBuffer, TradeSide};

/// Bars of history kept for on-demand indicator recomputation. Enough for
/// RSI(14) and the 20/60 moving-average trend state.
const MAX_HISTORY: usize = 100;

/// Whether entries require the trend filter on top of RSI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryOption {
    RsiOnly,
    RsiTrend,
}

/// Allowed trading direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Long,
    Short,
    Both,
}

impl Direction {
    pub fn allows(&self, side: TradeSide) -> bool {
        matches!(
            (self, side),
            (Direction::Both, _) | (Direction::Long, TradeSide::Long) | (Direction::Short, TradeSide::Short)
        )
    }
}

/// Full TP/SL computation mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TpSlOption {
    Fixed,
    DynamicAtr,
}

/// How per-level TP distances are expressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TpOption {
    Percentage,
    Atr,
    Price,
}

/// TP level whose fill arms the trailing stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrailingStartPoint {
    Tp1,
    Tp2,
    Tp3,
}

impl TrailingStartPoint {
    pub fn level(&self) -> u8 {
        match self {
            TrailingStartPoint::Tp1 => 1,
            TrailingStartPoint::Tp2 => 2,
            TrailingStartPoint::Tp3 => 3,
        }
    }
}

/// HYPERRSI strategy parameters, deserialized from a flat key/value map.
/// Unknown keys are ignored; missing keys take the defaults below.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HyperrsiParams {
    // Entry configuration
    pub entry_option: EntryOption,
    pub rsi_entry_option: RsiEntryMode,
    pub direction: Direction,

    // RSI parameters
    pub rsi_oversold: f64,
    pub rsi_overbought: f64,
    pub rsi_period: usize,

    // Position sizing
    pub leverage: f64,
    /// Quote units committed per signal.
    pub investment: f64,

    // Full TP/SL configuration
    pub tp_sl_option: TpSlOption,
    pub stop_loss_percent: Option<f64>,
    pub take_profit_percent: Option<f64>,
    pub atr_sl_multiplier: f64,
    pub atr_tp_multiplier: f64,

    // Partial exits
    pub tp_option: TpOption,
    pub use_tp1: bool,
    pub use_tp2: bool,
    pub use_tp3: bool,
    pub tp1_value: f64,
    pub tp2_value: f64,
    pub tp3_value: f64,
    /// Percent of the original quantity, as integers 0 to 100.
    pub tp1_ratio: f64,
    pub tp2_ratio: f64,
    pub tp3_ratio: f64,

    // Stop loss gating
    pub use_sl: bool,

    // Break-even promotion
    pub use_break_even: bool,
    pub use_break_even_tp2: bool,
    pub use_break_even_tp3: bool,

    // Trailing stop
    pub trailing_stop_active: bool,
    pub trailing_start_point: TrailingStartPoint,
    /// Percent of current price used as the trailing offset.
    pub trailing_stop_offset_value: f64,
    pub use_trailing_stop_value_with_tp2_tp3_difference: bool,

    // Trend-reversal exit
    pub use_trend_close: bool,

    // DCA / pyramiding
    pub pyramiding_enabled: bool,
    pub pyramiding_limit: u32,
    pub entry_multiplier: f64,
    pub pyramiding_entry_type: DcaSpacing,
    pub pyramiding_value: f64,
    pub entry_criterion: EntryCriterion,
    #[serde(rename = "use_check_DCA_with_price")]
    pub use_check_dca_with_price: bool,
    pub use_rsi_with_pyramiding: bool,
    pub use_trend_logic: bool,

    // Dual-side (hedge)
    pub use_dual_side_entry: bool,
    pub dual_side_entry_trigger: u32,
    pub dual_side_entry_ratio_type: DualRatioType,
    pub dual_side_entry_ratio_value: f64,
    pub dual_side_entry_tp_trigger_type: DualTpTrigger,
    pub dual_side_entry_tp_value: f64,
    pub close_main_on_hedge_tp: bool,
    pub use_dual_sl: bool,
    pub dual_side_entry_sl_trigger_type: DualSlTrigger,
    pub dual_side_entry_sl_value: Option<f64>,
    pub dual_side_pyramiding_limit: u32,
    pub dual_side_trend_close: bool,
    pub dual_side_close_on_main_sl: bool,
}

impl Default for HyperrsiParams {
    fn default() -> Self {
        Self {
            entry_option: EntryOption::RsiTrend,
            rsi_entry_option: RsiEntryMode::Overshoot,
            direction: Direction::Both,
            rsi_oversold: 30.0,
            rsi_overbought: 70.0,
            rsi_period: 14,
            leverage: 10.0,
            investment: 100.0,
            tp_sl_option: TpSlOption::Fixed,
            stop_loss_percent: Some(2.0),
            take_profit_percent: Some(4.0),
            atr_sl_multiplier: 2.0,
            atr_tp_multiplier: 3.0,
            tp_option: TpOption::Percentage,
            use_tp1: false,
            use_tp2: false,
            use_tp3: false,
            tp1_value: 2.0,
            tp2_value: 3.0,
            tp3_value: 4.0,
            tp1_ratio: 30.0,
            tp2_ratio: 30.0,
            tp3_ratio: 40.0,
            use_sl: false,
            use_break_even: true,
            use_break_even_tp2: true,
            use_break_even_tp3: true,
            trailing_stop_active: false,
            trailing_start_point: TrailingStartPoint::Tp3,
            trailing_stop_offset_value: 0.5,
            use_trailing_stop_value_with_tp2_tp3_difference: false,
            use_trend_close: true,
            pyramiding_enabled: true,
            pyramiding_limit: 3,
            entry_multiplier: 1.6,
            pyramiding_entry_type: DcaSpacing::Percentage,
            pyramiding_value: 3.0,
            entry_criterion: EntryCriterion::Average,
            use_check_dca_with_price: true,
            use_rsi_with_pyramiding: true,
            use_trend_logic: true,
            use_dual_side_entry: false,
            dual_side_entry_trigger: 2,
            dual_side_entry_ratio_type: DualRatioType::PercentOfPosition,
            dual_side_entry_ratio_value: 100.0,
            dual_side_entry_tp_trigger_type: DualTpTrigger::DoNotClose,
            dual_side_entry_tp_value: 0.0,
            close_main_on_hedge_tp: false,
            use_dual_sl: false,
            dual_side_entry_sl_trigger_type: DualSlTrigger::Percent,
            dual_side_entry_sl_value: None,
            dual_side_pyramiding_limit: 1,
            dual_side_trend_close: false,
            dual_side_close_on_main_sl: false,
        }
    }
}

impl HyperrsiParams {
    /// Parse from a flat key/value map. Invalid enum tags and malformed
    /// values surface as `ParameterValidation`.
    pub fn from_value(value: &Value) -> Result<Self, BacktestError> {
        let params: HyperrsiParams = serde_json::from_value(value.clone())
            .map_err(|e| BacktestError::ParameterValidation(e.to_string()))?;
        params.validate()?;
        Ok(params)
    }

    /// TP is enabled by any partial level or by a legacy full-TP percent.
    pub fn take_profit_enabled(&self) -> bool {
        self.use_tp1
            || self.use_tp2
            || self.use_tp3
            || self.take_profit_percent.map_or(false, |p| p > 0.0)
    }

    /// SL is enabled by the explicit flag or by a legacy SL percent.
    pub fn stop_loss_enabled(&self) -> bool {
        self.use_sl || self.stop_loss_percent.map_or(false, |p| p > 0.0)
    }

    pub fn validate(&self) -> Result<(), BacktestError> {
        fn invalid(message: impl Into<String>) -> Result<(), BacktestError> {
            Err(BacktestError::ParameterValidation(message.into()))
        }

        if self.leverage <= 0.0 {
            return invalid("leverage must be positive");
        }
        if self.investment <= 0.0 {
            return invalid("investment must be positive");
        }

        if self.stop_loss_enabled() {
            if let Some(sl) = self.stop_loss_percent {
                if !(0.0 < sl && sl < 100.0) {
                    return invalid("stop_loss_percent must be between 0 and 100");
                }
            }
        }

        if self.take_profit_enabled() {
            if let Some(tp) = self.take_profit_percent {
                if !(0.0 < tp && tp < 100.0) {
                    return invalid("take_profit_percent must be between 0 and 100");
                }
            }

            for (enabled, value, ratio, name) in [
                (self.use_tp1, self.tp1_value, self.tp1_ratio, "tp1"),
                (self.use_tp2, self.tp2_value, self.tp2_ratio, "tp2"),
                (self.use_tp3, self.tp3_value, self.tp3_ratio, "tp3"),
            ] {
                if enabled {
                    if value <= 0.0 {
                        return invalid(format!("{} enabled but {}_value is not positive", name, name));
                    }
                    let fraction = ratio / 100.0;
                    if !(0.0 < fraction && fraction <= 1.0) {
                        return invalid(format!("{}_ratio must be between 0 and 100", name));
                    }
                }
            }
        }

        if self.pyramiding_limit < 1 || self.pyramiding_limit > 10 {
            return invalid(format!(
                "pyramiding_limit must be between 1 and 10, got {}",
                self.pyramiding_limit
            ));
        }
        if !(0.1..=10.0).contains(&self.entry_multiplier) {
            return invalid(format!(
                "entry_multiplier must be between 0.1 and 10.0, got {}",
                self.entry_multiplier
            ));
        }
        if self.pyramiding_value <= 0.0 {
            return invalid(format!(
                "pyramiding_value must be a positive number, got {}",
                self.pyramiding_value
            ));
        }

        Ok(())
    }

    fn exit_rules(&self) -> ExitRules {
        ExitRules {
            use_tp1: self.use_tp1,
            use_tp2: self.use_tp2,
            use_tp3: self.use_tp3,
            tp1_ratio: self.tp1_ratio / 100.0,
            tp2_ratio: self.tp2_ratio / 100.0,
            tp3_ratio: self.tp3_ratio / 100.0,
            use_sl: self.use_sl,
            use_trend_close: self.use_trend_close,
            use_break_even: self.use_break_even,
            use_break_even_tp2: self.use_break_even_tp2,
            use_break_even_tp3: self.use_break_even_tp3,
            trailing_stop_active: self.trailing_stop_active,
            trailing_start_point: self.trailing_start_point.level(),
        }
    }

    fn dca_settings(&self) -> DcaSettings {
        DcaSettings {
            enabled: self.pyramiding_enabled,
            limit: self.pyramiding_limit,
            entry_multiplier: self.entry_multiplier,
            spacing: self.pyramiding_entry_type,
            spacing_value: self.pyramiding_value,
            criterion: self.entry_criterion,
            use_price_check: self.use_check_dca_with_price,
            use_rsi_gate: self.use_rsi_with_pyramiding,
            use_trend_gate: self.use_trend_logic,
            rsi_oversold: self.rsi_oversold,
            rsi_overbought: self.rsi_overbought,
        }
    }

    fn dual_side_settings(&self) -> DualSideSettings {
        DualSideSettings {
            enabled: self.use_dual_side_entry,
            entry_trigger: self.dual_side_entry_trigger,
            ratio_type: self.dual_side_entry_ratio_type,
            ratio_value: self.dual_side_entry_ratio_value,
            tp_trigger: self.dual_side_entry_tp_trigger_type,
            tp_value: self.dual_side_entry_tp_value,
            close_main_on_hedge_tp: self.close_main_on_hedge_tp,
            use_sl: self.use_dual_sl,
            sl_trigger: self.dual_side_entry_sl_trigger_type,
            sl_value: self.dual_side_entry_sl_value,
            pyramiding_limit: self.dual_side_pyramiding_limit,
            trend_close: self.dual_side_trend_close,
            close_on_main_sl: self.dual_side_close_on_main_sl,
        }
    }
}

/// RSI-driven strategy with a multi-level trend filter, partial exits,
/// break-even promotion, trailing stops and DCA pyramiding.
pub struct HyperrsiStrategy {
    pub params: HyperrsiParams,
    signal_generator: SignalGenerator,
    price_history: CandleBuffer,
    exit_rules: ExitRules,
    dca_settings: DcaSettings,
    dual_side_settings: DualSideSettings,
}

impl HyperrsiStrategy {
    pub fn new(params: HyperrsiParams) -> Result<Self, BacktestError> {
        params.validate()?;

        let use_trend_filter = params.entry_option == EntryOption::RsiTrend;
        let signal_generator = SignalGenerator::new(
            params.rsi_oversold,
            params.rsi_overbought,
            params.rsi_period,
            use_trend_filter,
            params.rsi_entry_option,
        );

        info!(
            "HyperrsiStrategy initialized: direction={:?}, entry={:?}, mode={:?}, leverage={}x",
            params.direction, params.entry_option, params.rsi_entry_option, params.leverage
        );

        Ok(Self {
            exit_rules: params.exit_rules(),
            dca_settings: params.dca_settings(),
            dual_side_settings: params.dual_side_settings(),
            signal_generator,
            price_history: CandleBuffer::new(MAX_HISTORY),
            params,
        })
    }

    pub fn from_value(value: &Value) -> Result<Self, BacktestError> {
        Self::new(HyperrsiParams::from_value(value)?)
    }

    fn previous_rsi(&self) -> Option<f64> {
        let candles = self.price_history.candles();
        if candles.len() < 2 {
            return None;
        }

        let previous = &candles[candles.len() - 2];
        if previous.rsi.is_some() {
            return previous.rsi;
        }

        let closes: Vec<f64> = candles[..candles.len() - 1].iter().map(|c| c.close).collect();
        self.signal_generator.rsi(&closes)
    }

    fn current_atr(&self, candle: &Candle) -> Option<f64> {
        if candle.atr.is_some() {
            return candle.atr;
        }
        self.signal_generator.atr(
            &self.price_history.highs(),
            &self.price_history.lows(),
            &self.price_history.closes(),
            14,
        )
    }
}

impl Strategy for HyperrsiStrategy {
    fn name(&self) -> &'static str {
        "hyperrsi"
    }

    fn generate_signal(&mut self, candle: &Candle) -> TradingSignal {
        self.price_history.push(candle.clone());

        let closes = self.price_history.closes();

        let rsi = match candle.rsi.or_else(|| self.signal_generator.rsi(&closes)) {
            Some(rsi) => rsi,
            None => {
                let err = BacktestError::InsufficientHistory {
                    needed: self.params.rsi_period + 1,
                    have: closes.len(),
                };
                debug!("RSI unavailable: {}", err);
                return TradingSignal::none(err.to_string(), SignalIndicators::default());
            }
        };

        let previous_rsi = self.previous_rsi();
        let atr = self.current_atr(candle);

        let trend_state = if self.signal_generator.use_trend_filter {
            candle
                .trend_state
                .or_else(|| Some(self.signal_generator.trend_state(&closes)))
        } else {
            None
        };

        let indicators = SignalIndicators {
            rsi: Some(rsi),
            previous_rsi,
            trend_state,
            atr,
        };

        if self.params.direction.allows(TradeSide::Long) {
            let (has_long, reason) =
                self.signal_generator
                    .check_long_signal(rsi, trend_state, previous_rsi);
            if has_long {
                info!(
                    "Long signal: {} (rsi={:.2}, prev={:?}, trend={:?})",
                    reason, rsi, previous_rsi, trend_state
                );
                return TradingSignal {
                    side: Some(TradeSide::Long),
                    reason,
                    indicators,
                };
            }
        }

        if self.params.direction.allows(TradeSide::Short) {
            let (has_short, reason) =
                self.signal_generator
                    .check_short_signal(rsi, trend_state, previous_rsi);
            if has_short {
                info!(
                    "Short signal: {} (rsi={:.2}, prev={:?}, trend={:?})",
                    reason, rsi, previous_rsi, trend_state
                );
                return TradingSignal {
                    side: Some(TradeSide::Short),
                    reason,
                    indicators,
                };
            }
        }

        TradingSignal::none("No signal", indicators)
    }

    fn calculate_position_size(
        &self,
        _signal: &TradingSignal,
        current_balance: f64,
        current_price: f64,
    ) -> (f64, f64) {
        let investment = self.entry_investment(current_balance);
        let quantity = (investment * self.params.leverage) / current_price;
        (quantity, self.params.leverage)
    }

    fn entry_investment(&self, current_balance: f64) -> f64 {
        self.params.investment.min(current_balance * 0.95)
    }

    fn calculate_tp_sl(
        &self,
        side: TradeSide,
        entry_price: f64,
        candle: &Candle,
    ) -> (Option<f64>, Option<f64>) {
        let mut take_profit = None;
        let mut stop_loss = None;

        let tp_enabled = self.params.take_profit_enabled();
        let sl_enabled = self.params.stop_loss_enabled();

        match (self.params.tp_sl_option, candle.atr) {
            (TpSlOption::DynamicAtr, Some(atr)) => {
                let direction = side.direction();
                if tp_enabled {
                    take_profit = Some(entry_price + direction * atr * self.params.atr_tp_multiplier);
                }
                if sl_enabled {
                    stop_loss = Some(entry_price - direction * atr * self.params.atr_sl_multiplier);
                }
            }
            _ => {
                let direction = side.direction();
                if tp_enabled {
                    if let Some(tp_percent) = self.params.take_profit_percent {
                        take_profit = Some(entry_price * (1.0 + direction * tp_percent / 100.0));
                    }
                }
                if sl_enabled {
                    if let Some(sl_percent) = self.params.stop_loss_percent {
                        stop_loss = Some(entry_price * (1.0 - direction * sl_percent / 100.0));
                    }
                }
            }
        }

        debug!(
            "TP/SL calculated: side={}, entry={:.2}, tp={:?}, sl={:?}",
            side, entry_price, take_profit, stop_loss
        );

        (take_profit, stop_loss)
    }

    fn calculate_tp_levels(
        &self,
        side: TradeSide,
        entry_price: f64,
        atr_value: Option<f64>,
    ) -> TpLevels {
        let mut levels = TpLevels::default();
        let direction = side.direction();

        // ATR-based targets use at least 0.1% of the entry price per ATR.
        let atr_value = if self.params.tp_option == TpOption::Atr {
            let min_atr = entry_price * 0.001;
            match atr_value {
                Some(atr) if atr >= min_atr => Some(atr),
                _ => Some(min_atr),
            }
        } else {
            atr_value
        };

        let configured = [
            (self.params.use_tp1, self.params.tp1_value),
            (self.params.use_tp2, self.params.tp2_value),
            (self.params.use_tp3, self.params.tp3_value),
        ];

        for (index, (use_tp, tp_value)) in configured.into_iter().enumerate() {
            if !use_tp || tp_value <= 0.0 {
                continue;
            }

            let raw_tp = match self.params.tp_option {
                TpOption::Percentage => entry_price * (1.0 + direction * tp_value / 100.0),
                TpOption::Atr => entry_price + direction * atr_value.unwrap_or(0.0) * tp_value,
                TpOption::Price => entry_price + direction * tp_value,
            };

            // Safety clamp keeps the target on the profitable side.
            let tp_price = match side {
                TradeSide::Long => raw_tp.max(entry_price * 1.0001),
                TradeSide::Short => raw_tp.min(entry_price * 0.9999),
            };

            match index {
                0 => levels.tp1 = Some(tp_price),
                1 => levels.tp2 = Some(tp_price),
                _ => levels.tp3 = Some(tp_price),
            }
        }

        debug!(
            "TP levels: side={}, entry={:.2}, tp1={:?}, tp2={:?}, tp3={:?}",
            side, entry_price, levels.tp1, levels.tp2, levels.tp3
        );

        levels
    }

    fn calculate_trailing_offset(
        &self,
        side: TradeSide,
        current_price: f64,
        tp2_price: Option<f64>,
        tp3_price: Option<f64>,
    ) -> f64 {
        if self.params.use_trailing_stop_value_with_tp2_tp3_difference {
            if let (Some(tp2), Some(tp3)) = (tp2_price, tp3_price) {
                let offset = (tp3 - tp2).abs();
                debug!(
                    "Trailing offset from TP2/TP3 difference: {:.4} (side={})",
                    offset, side
                );
                return offset;
            }
        }

        let offset = (current_price * self.params.trailing_stop_offset_value * 0.01).abs();
        debug!(
            "Trailing offset from percentage: {:.4} ({}% of {:.2})",
            offset, self.params.trailing_stop_offset_value, current_price
        );
        offset
    }

    fn should_activate_trailing_stop(&self, unrealized_pnl_percent: f64) -> bool {
        if !self.params.trailing_stop_active {
            return false;
        }

        // With partial TPs configured, activation is driven by the
        // trailing_start_point fill instead of P&L.
        if self.params.use_tp1 || self.params.use_tp2 || self.params.use_tp3 {
            return false;
        }

        unrealized_pnl_percent >= 0.0
    }

    fn compute_rsi(&self) -> Option<f64> {
        self.signal_generator.rsi(&self.price_history.closes())
    }

    fn compute_trend_averages(&self) -> (Option<f64>, Option<f64>) {
        let closes = self.price_history.closes();
        (indicators::ema(&closes, 7), indicators::sma(&closes, 20))
    }

    fn compute_trend_state(&self) -> Option<i8> {
        let closes = self.price_history.closes();
        if closes.len() < 20 {
            return None;
        }
        Some(self.signal_generator.trend_state(&closes))
    }

    fn exit_rules(&self) -> &ExitRules {
        &self.exit_rules
    }

    fn dca_settings(&self) -> &DcaSettings {
        &self.dca_settings
    }

    fn dual_side_settings(&self) -> &DualSideSettings {
        &self.dual_side_settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn candle(close: f64, rsi: Option<f64>, atr: Option<f64>) -> Candle {
        Candle {
            timestamp: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
            open: close,
            high: close,
            low: close,
            close,
            volume: 1.0,
            rsi,
            atr,
            ema: None,
            sma: None,
            trend_state: None,
        }
    }

    #[test]
    fn test_params_from_flat_map() {
        let params = HyperrsiParams::from_value(&json!({
            "direction": "long",
            "rsi_entry_option": "crossunder",
            "leverage": 5,
            "use_tp1": true,
            "tp1_value": 1.5,
            "tp1_ratio": 25,
            "unknown_key_is_ignored": 42,
        }))
        .unwrap();

        assert_eq!(params.direction, Direction::Long);
        assert_eq!(params.rsi_entry_option, RsiEntryMode::Crossunder);
        assert_eq!(params.leverage, 5.0);
        assert!(params.use_tp1);
        assert_eq!(params.tp1_ratio, 25.0);
        // Defaults fill the rest.
        assert_eq!(params.rsi_oversold, 30.0);
        assert_eq!(params.pyramiding_limit, 3);
    }

    #[test]
    fn test_params_validation_errors() {
        let cases = [
            json!({"leverage": 0}),
            json!({"investment": -5}),
            json!({"stop_loss_percent": 120.0, "use_sl": true}),
            json!({"use_tp1": true, "tp1_value": 0.0}),
            json!({"use_tp1": true, "tp1_value": 2.0, "tp1_ratio": 0}),
            json!({"pyramiding_limit": 11}),
            json!({"entry_multiplier": 0.05}),
            json!({"pyramiding_value": 0.0}),
            json!({"direction": "sideways"}),
        ];

        for case in cases {
            let err = HyperrsiParams::from_value(&case).unwrap_err();
            assert!(
                matches!(err, BacktestError::ParameterValidation(_)),
                "expected validation error for {}",
                case
            );
        }
    }

    #[test]
    fn test_position_size_capped_by_balance() {
        let strategy = HyperrsiStrategy::new(HyperrsiParams::default()).unwrap();
        let signal = TradingSignal::none("n/a", SignalIndicators::default());

        // investment 100 at 10x on price 100 => 10 units
        let (qty, leverage) = strategy.calculate_position_size(&signal, 10_000.0, 100.0);
        assert!((qty - 10.0).abs() < 1e-12);
        assert_eq!(leverage, 10.0);

        // Balance cap: 95% of 50 = 47.5 => 4.75 units
        let (qty, _) = strategy.calculate_position_size(&signal, 50.0, 100.0);
        assert!((qty - 4.75).abs() < 1e-12);
    }

    #[test]
    fn test_tp_sl_fixed_percentage() {
        let params = HyperrsiParams {
            stop_loss_percent: Some(2.0),
            take_profit_percent: Some(4.0),
            ..HyperrsiParams::default()
        };
        let strategy = HyperrsiStrategy::new(params).unwrap();
        let c = candle(100.0, None, None);

        let (tp, sl) = strategy.calculate_tp_sl(TradeSide::Long, 100.0, &c);
        assert!((tp.unwrap() - 104.0).abs() < 1e-9);
        assert!((sl.unwrap() - 98.0).abs() < 1e-9);

        let (tp, sl) = strategy.calculate_tp_sl(TradeSide::Short, 100.0, &c);
        assert!((tp.unwrap() - 96.0).abs() < 1e-9);
        assert!((sl.unwrap() - 102.0).abs() < 1e-9);
    }

    #[test]
    fn test_tp_sl_dynamic_atr() {
        let params = HyperrsiParams {
            tp_sl_option: TpSlOption::DynamicAtr,
            atr_tp_multiplier: 3.0,
            atr_sl_multiplier: 2.0,
            ..HyperrsiParams::default()
        };
        let strategy = HyperrsiStrategy::new(params).unwrap();
        let c = candle(100.0, None, Some(1.5));

        let (tp, sl) = strategy.calculate_tp_sl(TradeSide::Long, 100.0, &c);
        assert!((tp.unwrap() - 104.5).abs() < 1e-9);
        assert!((sl.unwrap() - 97.0).abs() < 1e-9);
    }

    #[test]
    fn test_tp_sl_disabled_features_produce_none() {
        let params = HyperrsiParams {
            stop_loss_percent: None,
            take_profit_percent: None,
            use_sl: false,
            ..HyperrsiParams::default()
        };
        let strategy = HyperrsiStrategy::new(params).unwrap();
        let c = candle(100.0, None, None);

        let (tp, sl) = strategy.calculate_tp_sl(TradeSide::Long, 100.0, &c);
        assert_eq!(tp, None);
        assert_eq!(sl, None);
    }

    #[test]
    fn test_tp_levels_percentage() {
        let params = HyperrsiParams {
            use_tp1: true,
            use_tp2: true,
            use_tp3: true,
            tp1_value: 2.0,
            tp2_value: 3.0,
            tp3_value: 4.0,
            ..HyperrsiParams::default()
        };
        let strategy = HyperrsiStrategy::new(params).unwrap();

        let levels = strategy.calculate_tp_levels(TradeSide::Long, 100.0, None);
        assert!((levels.tp1.unwrap() - 102.0).abs() < 1e-9);
        assert!((levels.tp2.unwrap() - 103.0).abs() < 1e-9);
        assert!((levels.tp3.unwrap() - 104.0).abs() < 1e-9);

        let levels = strategy.calculate_tp_levels(TradeSide::Short, 100.0, None);
        assert!((levels.tp1.unwrap() - 98.0).abs() < 1e-9);
    }

    #[test]
    fn test_tp_levels_atr_minimum_clamp() {
        let params = HyperrsiParams {
            use_tp1: true,
            tp1_value: 2.0,
            tp_option: TpOption::Atr,
            ..HyperrsiParams::default()
        };
        let strategy = HyperrsiStrategy::new(params).unwrap();

        // ATR below 0.1% of entry is lifted to the minimum.
        let levels = strategy.calculate_tp_levels(TradeSide::Long, 100.0, Some(0.01));
        assert!((levels.tp1.unwrap() - 100.2).abs() < 1e-9);

        // Missing ATR uses the minimum as well.
        let levels = strategy.calculate_tp_levels(TradeSide::Long, 100.0, None);
        assert!((levels.tp1.unwrap() - 100.2).abs() < 1e-9);
    }

    #[test]
    fn test_tp_levels_safety_clamp() {
        let params = HyperrsiParams {
            use_tp1: true,
            tp1_value: 0.001,
            tp_option: TpOption::Price,
            ..HyperrsiParams::default()
        };
        let strategy = HyperrsiStrategy::new(params).unwrap();

        // A target closer than 0.01% is pushed to the profitable bound.
        let levels = strategy.calculate_tp_levels(TradeSide::Long, 100.0, None);
        assert!((levels.tp1.unwrap() - 100.01).abs() < 1e-9);

        let levels = strategy.calculate_tp_levels(TradeSide::Short, 100.0, None);
        assert!((levels.tp1.unwrap() - 99.99).abs() < 1e-9);
    }

    #[test]
    fn test_trailing_offset_modes() {
        let params = HyperrsiParams {
            trailing_stop_offset_value: 1.0,
            ..HyperrsiParams::default()
        };
        let strategy = HyperrsiStrategy::new(params).unwrap();
        let offset =
            strategy.calculate_trailing_offset(TradeSide::Long, 103.0, Some(103.0), Some(104.0));
        assert!((offset - 1.03).abs() < 1e-9);

        let params = HyperrsiParams {
            use_trailing_stop_value_with_tp2_tp3_difference: true,
            ..HyperrsiParams::default()
        };
        let strategy = HyperrsiStrategy::new(params).unwrap();
        let offset =
            strategy.calculate_trailing_offset(TradeSide::Long, 103.0, Some(103.0), Some(104.5));
        assert!((offset - 1.5).abs() < 1e-9);
    }

    #[test]
    fn test_should_activate_trailing_stop() {
        // TP levels configured: activation waits for the TP fill trigger.
        let params = HyperrsiParams {
            trailing_stop_active: true,
            use_tp1: true,
            tp1_value: 2.0,
            ..HyperrsiParams::default()
        };
        let strategy = HyperrsiStrategy::new(params).unwrap();
        assert!(!strategy.should_activate_trailing_stop(5.0));

        // No TP levels: activate as soon as P&L is non-negative.
        let params = HyperrsiParams {
            trailing_stop_active: true,
            ..HyperrsiParams::default()
        };
        let strategy = HyperrsiStrategy::new(params).unwrap();
        assert!(strategy.should_activate_trailing_stop(0.0));
        assert!(!strategy.should_activate_trailing_stop(-0.5));

        // Feature off entirely.
        let strategy = HyperrsiStrategy::new(HyperrsiParams::default()).unwrap();
        assert!(!strategy.should_activate_trailing_stop(10.0));
    }

    #[test]
    fn test_generate_signal_uses_precomputed_rsi() {
        let params = HyperrsiParams {
            entry_option: EntryOption::RsiOnly,
            direction: Direction::Long,
            ..HyperrsiParams::default()
        };
        let mut strategy = HyperrsiStrategy::new(params).unwrap();

        let signal = strategy.generate_signal(&candle(100.0, Some(25.0), None));
        assert_eq!(signal.side, Some(TradeSide::Long));
        assert_eq!(signal.indicators.rsi, Some(25.0));

        let signal = strategy.generate_signal(&candle(100.0, Some(50.0), None));
        assert_eq!(signal.side, None);
    }

    #[test]
    fn test_generate_signal_without_rsi_reports_skip() {
        let params = HyperrsiParams {
            entry_option: EntryOption::RsiOnly,
            ..HyperrsiParams::default()
        };
        let mut strategy = HyperrsiStrategy::new(params).unwrap();

        // One bar of history cannot produce RSI(14).
        let signal = strategy.generate_signal(&candle(100.0, None, None));
        assert_eq!(signal.side, None);
        assert_eq!(signal.indicators.rsi, None);
        assert!(signal.reason.contains("insufficient history"));
    }

    #[test]
    fn test_crossunder_needs_previous_rsi() {
        let params = HyperrsiParams {
            entry_option: EntryOption::RsiOnly,
            direction: Direction::Long,
            rsi_entry_option: RsiEntryMode::Crossunder,
            ..HyperrsiParams::default()
        };
        let mut strategy = HyperrsiStrategy::new(params).unwrap();

        // First bar: no previous RSI, no signal even though oversold.
        let signal = strategy.generate_signal(&candle(100.0, Some(25.0), None));
        assert_eq!(signal.side, None);

        // Second bar crossing under the threshold fires.
        let signal = strategy.generate_signal(&candle(99.0, Some(28.0), None));
        assert_eq!(signal.side, None); // previous 25 was already below
        let signal = strategy.generate_signal(&candle(98.0, Some(31.0), None));
        assert_eq!(signal.side, None);
        let signal = strategy.generate_signal(&candle(97.0, Some(29.0), None));
        assert_eq!(signal.side, Some(TradeSide::Long));
    }

    #[test]
    fn test_compute_trend_surface() {
        let mut strategy = HyperrsiStrategy::new(HyperrsiParams::default()).unwrap();
        assert_eq!(strategy.compute_trend_state(), None);

        for i in 0..30 {
            strategy.generate_signal(&candle(100.0 + i as f64 * 0.1, Some(50.0), None));
        }
        // 30 bars: trend state computable (0 below the 61-bar minimum),
        // averages available.
        assert_eq!(strategy.compute_trend_state(), Some(0));
        let (ema, sma) = strategy.compute_trend_averages();
        assert!(ema.is_some());
        assert!(sma.is_some());
    }
}
