use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::types::TradeSide;

/// How the distance to the next DCA level is expressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DcaSpacing {
    Percentage,
    /// Fixed quote-currency amount.
    Price,
    Atr,
}

/// Which price the DCA ladder is anchored to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryCriterion {
    Average,
    LastFilled,
}

/// Pyramiding configuration consumed by the engine's DCA phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DcaSettings {
    pub enabled: bool,
    /// Max number of additional entries, 1 to 10.
    pub limit: u32,
    /// Per-entry size scale factor; entry N invests initial * multiplier^N.
    pub entry_multiplier: f64,
    pub spacing: DcaSpacing,
    pub spacing_value: f64,
    pub criterion: EntryCriterion,
    pub use_price_check: bool,
    pub use_rsi_gate: bool,
    pub use_trend_gate: bool,
    pub rsi_oversold: f64,
    pub rsi_overbought: f64,
}

impl Default for DcaSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            limit: 3,
            entry_multiplier: 1.6,
            spacing: DcaSpacing::Percentage,
            spacing_value: 3.0,
            criterion: EntryCriterion::Average,
            use_price_check: true,
            use_rsi_gate: true,
            use_trend_gate: true,
            rsi_oversold: 30.0,
            rsi_overbought: 70.0,
        }
    }
}

/// Compute the ladder of DCA trigger prices.
///
/// Each level is offset from the previous level, not from the original
/// reference, so percentage spacing compounds down (long) or up (short).
pub fn calculate_dca_levels(
    avg_entry_price: f64,
    last_filled_price: f64,
    settings: &DcaSettings,
    side: TradeSide,
    atr_value: Option<f64>,
) -> Vec<f64> {
    let reference_price = match settings.criterion {
        EntryCriterion::Average => avg_entry_price,
        EntryCriterion::LastFilled => last_filled_price,
    };

    let mut levels = Vec::with_capacity(settings.limit as usize);
    let mut base_price = reference_price;

    for _ in 0..settings.limit {
        let level = match settings.spacing {
            DcaSpacing::Percentage => match side {
                TradeSide::Long => base_price * (1.0 - settings.spacing_value / 100.0),
                TradeSide::Short => base_price * (1.0 + settings.spacing_value / 100.0),
            },
            DcaSpacing::Price => match side {
                TradeSide::Long => base_price - settings.spacing_value,
                TradeSide::Short => base_price + settings.spacing_value,
            },
            DcaSpacing::Atr => match atr_value {
                Some(atr) if atr > 0.0 => match side {
                    TradeSide::Long => base_price - atr * settings.spacing_value,
                    TradeSide::Short => base_price + atr * settings.spacing_value,
                },
                _ => {
                    // Missing ATR falls back to 3% percentage spacing.
                    warn!("ATR unavailable for ATR-based DCA level, falling back to 3%");
                    match side {
                        TradeSide::Long => base_price * 0.97,
                        TradeSide::Short => base_price * 1.03,
                    }
                }
            },
        };

        levels.push(level);
        base_price = level;
    }

    debug!(
        "DCA levels calculated: {:?} (spacing={:?}, value={}, reference={:.2}, side={})",
        levels, settings.spacing, settings.spacing_value, reference_price, side
    );

    levels
}

/// Price gate for the next DCA entry. With the check disabled the gate
/// always passes.
pub fn check_price_trigger(
    current_price: f64,
    dca_levels: &[f64],
    side: TradeSide,
    use_price_check: bool,
) -> bool {
    if !use_price_check {
        return true;
    }

    let next_level = match dca_levels.first() {
        Some(level) => *level,
        None => return false,
    };

    match side {
        TradeSide::Long => current_price <= next_level,
        TradeSide::Short => current_price >= next_level,
    }
}

/// Investment and contract quantity for the Nth DCA entry (1-indexed),
/// scaled exponentially from the initial entry.
pub fn calculate_entry_size(
    initial_investment: f64,
    initial_contracts: f64,
    dca_count: u32,
    entry_multiplier: f64,
) -> (f64, f64) {
    let scale = entry_multiplier.powi(dca_count as i32);
    (initial_investment * scale, initial_contracts * scale)
}

/// RSI gate: long DCA requires an oversold RSI, short DCA an overbought
/// one. Missing RSI fails the gate.
pub fn check_rsi_gate(rsi: Option<f64>, side: TradeSide, settings: &DcaSettings) -> bool {
    if !settings.use_rsi_gate {
        return true;
    }

    let rsi = match rsi {
        Some(value) => value,
        None => {
            debug!("RSI value unavailable, DCA RSI gate fails");
            return false;
        }
    };

    match side {
        TradeSide::Long => rsi <= settings.rsi_oversold,
        TradeSide::Short => rsi >= settings.rsi_overbought,
    }
}

/// Trend gate for DCA entries.
///
/// Priority 1: a provided trend state blocks long adds at -2 and short
/// adds at +2, and decides alone. Priority 2: the EMA/SMA relationship
/// blocks adds against a strong trend (more than 2% divergence).
pub fn check_trend_gate(
    ema: Option<f64>,
    sma: Option<f64>,
    side: TradeSide,
    trend_state: Option<i8>,
    use_trend_gate: bool,
) -> bool {
    if !use_trend_gate {
        return true;
    }

    if let Some(state) = trend_state {
        return match side {
            TradeSide::Long => state != -2,
            TradeSide::Short => state != 2,
        };
    }

    let (ema, sma) = match (ema, sma) {
        (Some(e), Some(s)) => (e, s),
        _ => {
            debug!("EMA or SMA unavailable, DCA trend gate fails");
            return false;
        }
    };

    let trend_ratio = if sma != 0.0 { (ema - sma) / sma } else { 0.0 };
    let strong_trend_threshold = 0.02;

    match side {
        TradeSide::Long => trend_ratio >= -strong_trend_threshold,
        TradeSide::Short => trend_ratio <= strong_trend_threshold,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> DcaSettings {
        DcaSettings {
            enabled: true,
            limit: 3,
            entry_multiplier: 0.5,
            spacing: DcaSpacing::Percentage,
            spacing_value: 3.0,
            criterion: EntryCriterion::Average,
            use_price_check: true,
            use_rsi_gate: true,
            use_trend_gate: true,
            rsi_oversold: 30.0,
            rsi_overbought: 70.0,
        }
    }

    #[test]
    fn test_percentage_levels_compound() {
        let levels = calculate_dca_levels(100.0, 100.0, &settings(), TradeSide::Long, None);
        assert_eq!(levels.len(), 3);
        assert!((levels[0] - 97.0).abs() < 1e-9);
        assert!((levels[1] - 94.09).abs() < 1e-9);
        assert!((levels[2] - 91.2673).abs() < 1e-9);
    }

    #[test]
    fn test_fixed_amount_levels_short() {
        let mut s = settings();
        s.spacing = DcaSpacing::Price;
        s.spacing_value = 5.0;
        let levels = calculate_dca_levels(100.0, 100.0, &s, TradeSide::Short, None);
        assert_eq!(levels, vec![105.0, 110.0, 115.0]);
    }

    #[test]
    fn test_atr_levels_and_fallback() {
        let mut s = settings();
        s.spacing = DcaSpacing::Atr;
        s.spacing_value = 2.0;

        let levels = calculate_dca_levels(100.0, 100.0, &s, TradeSide::Long, Some(1.5));
        assert!((levels[0] - 97.0).abs() < 1e-9);
        assert!((levels[1] - 94.0).abs() < 1e-9);

        // Missing ATR falls back to 3% spacing.
        let levels = calculate_dca_levels(100.0, 100.0, &s, TradeSide::Long, None);
        assert!((levels[0] - 97.0).abs() < 1e-9);
        assert!((levels[1] - 94.09).abs() < 1e-9);
    }

    #[test]
    fn test_last_filled_reference() {
        let mut s = settings();
        s.criterion = EntryCriterion::LastFilled;
        let levels = calculate_dca_levels(100.0, 90.0, &s, TradeSide::Long, None);
        assert!((levels[0] - 87.3).abs() < 1e-9);
    }

    #[test]
    fn test_price_trigger() {
        assert!(check_price_trigger(96.9, &[97.0], TradeSide::Long, true));
        assert!(!check_price_trigger(97.1, &[97.0], TradeSide::Long, true));
        assert!(check_price_trigger(103.2, &[103.0], TradeSide::Short, true));
        // Disabled check always passes, empty ladder never does.
        assert!(check_price_trigger(200.0, &[97.0], TradeSide::Long, false));
        assert!(!check_price_trigger(90.0, &[], TradeSide::Long, true));
    }

    #[test]
    fn test_entry_size_scaling() {
        let (inv, qty) = calculate_entry_size(100.0, 10.0, 1, 0.5);
        assert!((inv - 50.0).abs() < 1e-12);
        assert!((qty - 5.0).abs() < 1e-12);

        let (inv, qty) = calculate_entry_size(100.0, 10.0, 2, 0.5);
        assert!((inv - 25.0).abs() < 1e-12);
        assert!((qty - 2.5).abs() < 1e-12);
    }

    #[test]
    fn test_rsi_gate() {
        let s = settings();
        assert!(check_rsi_gate(Some(28.0), TradeSide::Long, &s));
        assert!(!check_rsi_gate(Some(35.0), TradeSide::Long, &s));
        assert!(check_rsi_gate(Some(75.0), TradeSide::Short, &s));
        assert!(!check_rsi_gate(None, TradeSide::Long, &s));

        let mut s = s;
        s.use_rsi_gate = false;
        assert!(check_rsi_gate(None, TradeSide::Long, &s));
    }

    #[test]
    fn test_trend_gate_state_priority() {
        // Strong downtrend blocks long adds regardless of averages.
        assert!(!check_trend_gate(Some(100.0), Some(95.0), TradeSide::Long, Some(-2), true));
        assert!(check_trend_gate(None, None, TradeSide::Long, Some(0), true));
        assert!(!check_trend_gate(None, None, TradeSide::Short, Some(2), true));
    }

    #[test]
    fn test_trend_gate_ema_sma_fallback() {
        // EMA 9% below SMA: strong downtrend, long add blocked.
        assert!(!check_trend_gate(Some(100.0), Some(110.0), TradeSide::Long, None, true));
        // 1% divergence is tolerated.
        assert!(check_trend_gate(Some(99.0), Some(100.0), TradeSide::Long, None, true));
        // Missing averages fail the gate.
        assert!(!check_trend_gate(None, Some(100.0), TradeSide::Long, None, true));
        // Disabled gate always passes.
        assert!(check_trend_gate(None, None, TradeSide::Long, None, false));
    }
}
