use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::TradeSide;

/// How the hedge quantity is derived from the main position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DualRatioType {
    PercentOfPosition,
    FixedAmount,
}

/// How the hedge take-profit target is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DualTpTrigger {
    DoNotClose,
    /// Target the main position's most recent DCA fill, only once the
    /// final allowed DCA has filled.
    LastDcaOnPosition,
    /// Target the main position's protective stop.
    ExistingPosition,
    Percent,
}

/// How the hedge stop-loss is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DualSlTrigger {
    /// The main position's TP level referenced by `sl_value` (1, 2 or 3).
    ExistingPosition,
    Percent,
}

/// Dual-side (hedge) subsystem configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DualSideSettings {
    pub enabled: bool,
    /// Main-position DCA count at which the hedge opens.
    pub entry_trigger: u32,
    pub ratio_type: DualRatioType,
    pub ratio_value: f64,
    pub tp_trigger: DualTpTrigger,
    pub tp_value: f64,
    pub close_main_on_hedge_tp: bool,
    pub use_sl: bool,
    pub sl_trigger: DualSlTrigger,
    /// TP level index for `ExistingPosition`, percent for `Percent`.
    pub sl_value: Option<f64>,
    /// Max hedge entries over the life of one main trade.
    pub pyramiding_limit: u32,
    pub trend_close: bool,
    pub close_on_main_sl: bool,
}

impl Default for DualSideSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            entry_trigger: 2,
            ratio_type: DualRatioType::PercentOfPosition,
            ratio_value: 100.0,
            tp_trigger: DualTpTrigger::DoNotClose,
            tp_value: 0.0,
            close_main_on_hedge_tp: false,
            use_sl: false,
            sl_trigger: DualSlTrigger::Percent,
            sl_value: None,
            pyramiding_limit: 1,
            trend_close: false,
            close_on_main_sl: false,
        }
    }
}

/// Main TP prices passed to the hedge SL calculation.
#[derive(Debug, Clone, Copy, Default)]
pub struct MainTpPrices {
    pub tp1: Option<f64>,
    pub tp2: Option<f64>,
    pub tp3: Option<f64>,
}

/// Whether the hedge should be (re)entered at the given main DCA count.
pub fn should_open_dual_side(main_dca_count: u32, settings: &DualSideSettings) -> bool {
    settings.enabled && main_dca_count >= settings.entry_trigger
}

/// Whether another hedge entry fits under the hedge pyramiding limit.
pub fn can_add_dual_side(dual_entry_count: u32, settings: &DualSideSettings) -> bool {
    dual_entry_count < settings.pyramiding_limit
}

/// Hedge quantity from the main position's current size.
pub fn calculate_dual_side_quantity(main_quantity: f64, settings: &DualSideSettings) -> f64 {
    match settings.ratio_type {
        DualRatioType::PercentOfPosition => main_quantity * (settings.ratio_value / 100.0),
        DualRatioType::FixedAmount => settings.ratio_value,
    }
}

/// Hedge take-profit price per the configured trigger type.
///
/// Targets taken from the main position must lie in the hedge's profit
/// direction; a `LastDcaOnPosition` target at or behind the entry is
/// nudged 0.1% into profit to avoid a fee-only close.
pub fn calculate_dual_side_tp_price(
    entry_price: f64,
    side: TradeSide,
    settings: &DualSideSettings,
    main_stop_price: Option<f64>,
    last_main_dca_price: Option<f64>,
    is_last_main_dca: bool,
) -> Option<f64> {
    match settings.tp_trigger {
        DualTpTrigger::DoNotClose => None,
        DualTpTrigger::LastDcaOnPosition => {
            if !is_last_main_dca {
                return None;
            }
            let mut target = last_main_dca_price?;
            if target <= 0.0 {
                return None;
            }
            match side {
                TradeSide::Long if target <= entry_price => target = entry_price * 1.001,
                TradeSide::Short if target >= entry_price => target = entry_price * 0.999,
                _ => {}
            }
            Some(target)
        }
        DualTpTrigger::ExistingPosition => {
            let stop = main_stop_price?;
            match side {
                TradeSide::Long if stop <= entry_price => None,
                TradeSide::Short if stop >= entry_price => None,
                _ => Some(stop),
            }
        }
        DualTpTrigger::Percent => {
            if settings.tp_value <= 0.0 {
                return None;
            }
            Some(match side {
                TradeSide::Long => entry_price * (1.0 + settings.tp_value / 100.0),
                TradeSide::Short => entry_price * (1.0 - settings.tp_value / 100.0),
            })
        }
    }
}

/// Hedge stop-loss price per the configured trigger type.
pub fn calculate_dual_side_sl_price(
    entry_price: f64,
    side: TradeSide,
    settings: &DualSideSettings,
    main_tp_prices: &MainTpPrices,
) -> Option<f64> {
    if !settings.use_sl {
        return None;
    }

    match settings.sl_trigger {
        DualSlTrigger::ExistingPosition => {
            let level = settings.sl_value.unwrap_or(1.0) as u8;
            let price = match level {
                1 => main_tp_prices.tp1,
                2 => main_tp_prices.tp2,
                3 => main_tp_prices.tp3,
                _ => None,
            };
            debug!("Hedge SL from main TP{}: {:?}", level, price);
            price
        }
        DualSlTrigger::Percent => {
            let sl_percent = settings.sl_value.unwrap_or(0.0);
            Some(match side {
                TradeSide::Long => entry_price * (1.0 - sl_percent / 100.0),
                TradeSide::Short => entry_price * (1.0 + sl_percent / 100.0),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> DualSideSettings {
        DualSideSettings {
            enabled: true,
            entry_trigger: 2,
            ..DualSideSettings::default()
        }
    }

    #[test]
    fn test_entry_trigger_and_limit() {
        let s = settings();
        assert!(!should_open_dual_side(1, &s));
        assert!(should_open_dual_side(2, &s));
        assert!(should_open_dual_side(3, &s));
        assert!(can_add_dual_side(0, &s));
        assert!(!can_add_dual_side(1, &s));

        let disabled = DualSideSettings::default();
        assert!(!should_open_dual_side(5, &disabled));
    }

    #[test]
    fn test_quantity_modes() {
        let mut s = settings();
        s.ratio_value = 50.0;
        assert!((calculate_dual_side_quantity(30.0, &s) - 15.0).abs() < 1e-12);

        s.ratio_type = DualRatioType::FixedAmount;
        s.ratio_value = 2.5;
        assert!((calculate_dual_side_quantity(30.0, &s) - 2.5).abs() < 1e-12);
    }

    #[test]
    fn test_tp_do_not_close() {
        let s = settings();
        assert_eq!(
            calculate_dual_side_tp_price(100.0, TradeSide::Short, &s, Some(95.0), Some(96.0), true),
            None
        );
    }

    #[test]
    fn test_tp_last_dca_nudges_into_profit() {
        let mut s = settings();
        s.tp_trigger = DualTpTrigger::LastDcaOnPosition;

        // Only fires on the final main DCA fill.
        assert_eq!(
            calculate_dual_side_tp_price(100.0, TradeSide::Short, &s, None, Some(95.0), false),
            None
        );

        let tp =
            calculate_dual_side_tp_price(100.0, TradeSide::Short, &s, None, Some(95.0), true);
        assert_eq!(tp, Some(95.0));

        // A target at or behind the short entry is nudged 0.1% below it.
        let tp =
            calculate_dual_side_tp_price(100.0, TradeSide::Short, &s, None, Some(101.0), true);
        assert!((tp.unwrap() - 99.9).abs() < 1e-9);
    }

    #[test]
    fn test_tp_existing_position_requires_profit_direction() {
        let mut s = settings();
        s.tp_trigger = DualTpTrigger::ExistingPosition;

        // Short hedge, main SL below entry: valid target.
        let tp = calculate_dual_side_tp_price(100.0, TradeSide::Short, &s, Some(95.0), None, false);
        assert_eq!(tp, Some(95.0));

        // Main SL above the short hedge entry: no target.
        let tp = calculate_dual_side_tp_price(100.0, TradeSide::Short, &s, Some(105.0), None, false);
        assert_eq!(tp, None);
    }

    #[test]
    fn test_tp_percent() {
        let mut s = settings();
        s.tp_trigger = DualTpTrigger::Percent;
        s.tp_value = 2.0;

        let tp = calculate_dual_side_tp_price(100.0, TradeSide::Long, &s, None, None, false);
        assert!((tp.unwrap() - 102.0).abs() < 1e-9);

        s.tp_value = 0.0;
        assert_eq!(
            calculate_dual_side_tp_price(100.0, TradeSide::Long, &s, None, None, false),
            None
        );
    }

    #[test]
    fn test_sl_modes() {
        let mut s = settings();
        // SL disabled by default.
        assert_eq!(
            calculate_dual_side_sl_price(100.0, TradeSide::Short, &s, &MainTpPrices::default()),
            None
        );

        s.use_sl = true;
        s.sl_trigger = DualSlTrigger::ExistingPosition;
        s.sl_value = Some(2.0);
        let tps = MainTpPrices {
            tp1: Some(102.0),
            tp2: Some(103.0),
            tp3: Some(104.0),
        };
        assert_eq!(
            calculate_dual_side_sl_price(100.0, TradeSide::Short, &s, &tps),
            Some(103.0)
        );

        s.sl_trigger = DualSlTrigger::Percent;
        s.sl_value = Some(3.0);
        let sl = calculate_dual_side_sl_price(100.0, TradeSide::Short, &s, &tps);
        assert!((sl.unwrap() - 103.0).abs() < 1e-9);
    }
}
