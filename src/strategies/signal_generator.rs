use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::indicators;

/// RSI entry decision rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RsiEntryMode {
    /// RSI beyond the threshold.
    Overshoot,
    /// RSI crossing the threshold this bar.
    Crossunder,
    /// RSI turning back from the extreme zone.
    Reversal,
    /// RSI re-crossing out of the extreme zone.
    ReversalCrossunder,
}

/// Generates entry signals from RSI state and a multi-level trend filter.
///
/// Also computes RSI, ATR, and the 5-level trend state from raw series
/// when the candle source does not supply the columns.
#[derive(Debug, Clone)]
pub struct SignalGenerator {
    pub rsi_oversold: f64,
    pub rsi_overbought: f64,
    pub rsi_period: usize,
    pub use_trend_filter: bool,
    pub entry_mode: RsiEntryMode,
}

impl SignalGenerator {
    pub fn new(
        rsi_oversold: f64,
        rsi_overbought: f64,
        rsi_period: usize,
        use_trend_filter: bool,
        entry_mode: RsiEntryMode,
    ) -> Self {
        Self {
            rsi_oversold,
            rsi_overbought,
            rsi_period,
            use_trend_filter,
            entry_mode,
        }
    }

    /// Long entry check. Returns (has_signal, reason).
    pub fn check_long_signal(
        &self,
        rsi: f64,
        trend_state: Option<i8>,
        previous_rsi: Option<f64>,
    ) -> (bool, String) {
        let is_oversold = match self.entry_mode {
            RsiEntryMode::Crossunder => {
                let prev = match previous_rsi {
                    Some(prev) => prev,
                    None => return (false, "previous RSI required for crossunder".to_string()),
                };
                prev > self.rsi_oversold && rsi <= self.rsi_oversold
            }
            RsiEntryMode::Reversal => {
                let prev = match previous_rsi {
                    Some(prev) => prev,
                    None => return (false, "previous RSI required for reversal".to_string()),
                };
                (prev < self.rsi_oversold || rsi < self.rsi_oversold) && rsi > prev
            }
            RsiEntryMode::ReversalCrossunder => {
                let prev = match previous_rsi {
                    Some(prev) => prev,
                    None => {
                        return (
                            false,
                            "previous RSI required for reversal_crossunder".to_string(),
                        )
                    }
                };
                rsi >= self.rsi_oversold && prev < self.rsi_oversold
            }
            RsiEntryMode::Overshoot => rsi < self.rsi_oversold,
        };

        if !is_oversold {
            return (false, "RSI not oversold".to_string());
        }

        if self.use_trend_filter {
            if let Some(state) = trend_state {
                return match state {
                    -2 => (false, "strong downtrend detected, long entry blocked".to_string()),
                    2 => (true, "RSI oversold + strong uptrend".to_string()),
                    1 => (true, "RSI oversold + uptrend".to_string()),
                    -1 => (true, "RSI oversold + downtrend (allowed)".to_string()),
                    _ => (true, "RSI oversold + neutral trend".to_string()),
                };
            }
        }

        (true, "RSI oversold".to_string())
    }

    /// Short entry check. Returns (has_signal, reason).
    pub fn check_short_signal(
        &self,
        rsi: f64,
        trend_state: Option<i8>,
        previous_rsi: Option<f64>,
    ) -> (bool, String) {
        let is_overbought = match self.entry_mode {
            RsiEntryMode::Crossunder => {
                let prev = match previous_rsi {
                    Some(prev) => prev,
                    None => return (false, "previous RSI required for crossunder".to_string()),
                };
                prev < self.rsi_overbought && rsi >= self.rsi_overbought
            }
            RsiEntryMode::Reversal => {
                let prev = match previous_rsi {
                    Some(prev) => prev,
                    None => return (false, "previous RSI required for reversal".to_string()),
                };
                (prev > self.rsi_overbought || rsi > self.rsi_overbought) && rsi < prev
            }
            RsiEntryMode::ReversalCrossunder => {
                let prev = match previous_rsi {
                    Some(prev) => prev,
                    None => {
                        return (
                            false,
                            "previous RSI required for reversal_crossunder".to_string(),
                        )
                    }
                };
                rsi <= self.rsi_overbought && prev > self.rsi_overbought
            }
            RsiEntryMode::Overshoot => rsi > self.rsi_overbought,
        };

        if !is_overbought {
            return (false, "RSI not overbought".to_string());
        }

        if self.use_trend_filter {
            if let Some(state) = trend_state {
                return match state {
                    2 => (false, "strong uptrend detected, short entry blocked".to_string()),
                    -2 => (true, "RSI overbought + strong downtrend".to_string()),
                    -1 => (true, "RSI overbought + downtrend".to_string()),
                    1 => (true, "RSI overbought + uptrend (allowed)".to_string()),
                    _ => (true, "RSI overbought + neutral trend".to_string()),
                };
            }
        }

        (true, "RSI overbought".to_string())
    }

    /// 5-level trend state from a close series.
    ///
    /// +2 above the Bollinger upper band with positive momentum, +1 for
    /// price > MA20 > MA60 with positive momentum, mirrored for the
    /// downside, 0 inside the bands. Insufficient history returns 0.
    pub fn trend_state(&self, closes: &[f64]) -> i8 {
        const MA20_PERIOD: usize = 20;
        const MA60_PERIOD: usize = 60;
        const BB_PERIOD: usize = 20;
        const BB_STD: f64 = 2.0;
        const MOMENTUM_PERIOD: usize = 20;

        let required = MA60_PERIOD.max(BB_PERIOD).max(MOMENTUM_PERIOD) + 1;
        if closes.len() < required {
            debug!(
                "Insufficient data for trend calculation: {} < {}",
                closes.len(),
                required
            );
            return 0;
        }

        let current_price = closes[closes.len() - 1];
        let price_ago = closes[closes.len() - 1 - MOMENTUM_PERIOD];
        let momentum = (current_price - price_ago) / price_ago;

        let ma20 = match indicators::sma(closes, MA20_PERIOD) {
            Some(value) => value,
            None => return 0,
        };
        let ma60 = match indicators::sma(closes, MA60_PERIOD) {
            Some(value) => value,
            None => return 0,
        };

        let bb_middle = ma20;
        let bb_std = match indicators::stddev(closes, BB_PERIOD) {
            Some(value) => value,
            None => return 0,
        };
        let upper_band = bb_middle + bb_std * BB_STD;
        let lower_band = bb_middle - bb_std * BB_STD;

        let state = if current_price > upper_band && momentum > 0.0 {
            2
        } else if current_price > ma20 && ma20 > ma60 && momentum > 0.0 {
            1
        } else if current_price >= lower_band && current_price <= upper_band {
            0
        } else if current_price < ma20 && ma20 < ma60 && momentum < 0.0 {
            -1
        } else if current_price < lower_band && momentum < 0.0 {
            -2
        } else {
            0
        };

        debug!(
            "Trend state: state={}, price={:.2}, bb=[{:.2}, {:.2}], ma20={:.2}, ma60={:.2}, momentum={:.4}",
            state, current_price, lower_band, upper_band, ma20, ma60, momentum
        );

        state
    }

    pub fn rsi(&self, closes: &[f64]) -> Option<f64> {
        indicators::rsi(closes, self.rsi_period)
    }

    pub fn atr(&self, highs: &[f64], lows: &[f64], closes: &[f64], period: usize) -> Option<f64> {
        indicators::atr(highs, lows, closes, period)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn generator(mode: RsiEntryMode) -> SignalGenerator {
        SignalGenerator::new(30.0, 70.0, 14, false, mode)
    }

    #[test]
    fn test_overshoot_mode() {
        let g = generator(RsiEntryMode::Overshoot);
        assert!(g.check_long_signal(25.0, None, None).0);
        assert!(!g.check_long_signal(35.0, None, None).0);
        assert!(g.check_short_signal(75.0, None, None).0);
        assert!(!g.check_short_signal(65.0, None, None).0);
    }

    #[test]
    fn test_crossunder_mode_requires_previous() {
        let g = generator(RsiEntryMode::Crossunder);
        assert!(!g.check_long_signal(25.0, None, None).0);
        assert!(g.check_long_signal(29.0, None, Some(31.0)).0);
        // Already below last bar: no fresh cross.
        assert!(!g.check_long_signal(28.0, None, Some(29.0)).0);
        assert!(g.check_short_signal(71.0, None, Some(69.0)).0);
    }

    #[test]
    fn test_reversal_mode() {
        let g = generator(RsiEntryMode::Reversal);
        // Turning up from the oversold zone.
        assert!(g.check_long_signal(28.0, None, Some(25.0)).0);
        // Still falling: no signal.
        assert!(!g.check_long_signal(24.0, None, Some(25.0)).0);
        // Turning down from the overbought zone.
        assert!(g.check_short_signal(72.0, None, Some(75.0)).0);
    }

    #[test]
    fn test_reversal_crossunder_mode() {
        let g = generator(RsiEntryMode::ReversalCrossunder);
        assert!(g.check_long_signal(31.0, None, Some(28.0)).0);
        assert!(!g.check_long_signal(29.0, None, Some(28.0)).0);
        assert!(g.check_short_signal(69.0, None, Some(72.0)).0);
    }

    #[test]
    fn test_trend_filter_blocks_extremes_only() {
        let g = SignalGenerator::new(30.0, 70.0, 14, true, RsiEntryMode::Overshoot);

        let (signal, reason) = g.check_long_signal(25.0, Some(-2), None);
        assert!(!signal);
        assert!(reason.contains("blocked"));

        // -1 is allowed for longs, +2 blocked for shorts.
        assert!(g.check_long_signal(25.0, Some(-1), None).0);
        assert!(!g.check_short_signal(75.0, Some(2), None).0);
        assert!(g.check_short_signal(75.0, Some(1), None).0);
    }

    #[test]
    fn test_trend_state_insufficient_history() {
        let g = generator(RsiEntryMode::Overshoot);
        let closes: Vec<f64> = (0..60).map(|i| 100.0 + i as f64).collect();
        assert_eq!(g.trend_state(&closes), 0);
    }

    #[test]
    fn test_trend_state_uptrend_levels() {
        let g = generator(RsiEntryMode::Overshoot);

        // Gentle rise keeps price above both averages with positive
        // momentum but inside the band: uptrend.
        let closes: Vec<f64> = (0..61).map(|i| 100.0 + i as f64 * 0.1).collect();
        assert_eq!(g.trend_state(&closes), 1);

        // A final spike through the upper band: strong uptrend.
        let mut spiked = closes.clone();
        *spiked.last_mut().unwrap() += 10.0;
        assert_eq!(g.trend_state(&spiked), 2);
    }

    #[test]
    fn test_trend_state_gentle_downtrend_stays_neutral() {
        // Price below both averages but still inside the band: neutral.
        let g = generator(RsiEntryMode::Overshoot);
        let closes: Vec<f64> = (0..61).map(|i| 120.0 - i as f64 * 0.1).collect();
        assert_eq!(g.trend_state(&closes), 0);
    }

    #[test]
    fn test_trend_state_downtrend_crash() {
        let g = generator(RsiEntryMode::Overshoot);

        // Established downtrend (MA20 < MA60) plus a crash through the
        // lower band: downtrend.
        let mut closes: Vec<f64> = (0..60).map(|i| 120.0 - i as f64 * 0.1).collect();
        closes.push(104.0);
        assert_eq!(g.trend_state(&closes), -1);

        // Crash out of an uptrend (MA20 >= MA60): strong downtrend.
        let mut closes: Vec<f64> = (0..60).map(|i| 100.0 + i as f64 * 0.5).collect();
        closes.push(80.0);
        assert_eq!(g.trend_state(&closes), -2);
    }
}
