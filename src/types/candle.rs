use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// OHLCV candle with optional pre-computed indicator columns.
///
/// Indicator fields are populated by the candle source when available;
/// the strategy falls back to on-demand computation when they are `None`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,

    // Optional pre-computed indicators
    #[serde(default)]
    pub rsi: Option<f64>,
    #[serde(default)]
    pub atr: Option<f64>,
    #[serde(default)]
    pub ema: Option<f64>,
    #[serde(default)]
    pub sma: Option<f64>,
    /// 5-level trend classification in {-2, -1, 0, 1, 2}.
    #[serde(default)]
    pub trend_state: Option<i8>,
}

impl Candle {
    pub fn range(&self) -> f64 {
        self.high - self.low
    }

    /// Validate OHLC relationships: low <= min(open, close) and
    /// high >= max(open, close).
    pub fn validate_ohlc(&self) -> bool {
        if self.high < self.open.max(self.close).max(self.low) {
            return false;
        }
        if self.low > self.open.min(self.close).min(self.high) {
            return false;
        }
        true
    }
}

/// Bounded candle history buffer. Oldest candles are evicted once the
/// buffer reaches capacity.
#[derive(Debug, Clone, Default)]
pub struct CandleBuffer {
    candles: Vec<Candle>,
    max_size: usize,
}

impl CandleBuffer {
    pub fn new(max_size: usize) -> Self {
        Self {
            candles: Vec::with_capacity(max_size),
            max_size,
        }
    }

    pub fn push(&mut self, candle: Candle) {
        if self.candles.len() >= self.max_size {
            self.candles.remove(0);
        }
        self.candles.push(candle);
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    pub fn last(&self) -> Option<&Candle> {
        self.candles.last()
    }

    pub fn candles(&self) -> &[Candle] {
        &self.candles
    }

    pub fn closes(&self) -> Vec<f64> {
        self.candles.iter().map(|c| c.close).collect()
    }

    pub fn highs(&self) -> Vec<f64> {
        self.candles.iter().map(|c| c.high).collect()
    }

    pub fn lows(&self) -> Vec<f64> {
        self.candles.iter().map(|c| c.low).collect()
    }

    pub fn clear(&mut self) {
        self.candles.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn candle(close: f64) -> Candle {
        Candle {
            timestamp: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
            open: close,
            high: close,
            low: close,
            close,
            volume: 1.0,
            rsi: None,
            atr: None,
            ema: None,
            sma: None,
            trend_state: None,
        }
    }

    #[test]
    fn test_buffer_evicts_oldest() {
        let mut buffer = CandleBuffer::new(3);
        for price in [1.0, 2.0, 3.0, 4.0] {
            buffer.push(candle(price));
        }
        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.closes(), vec![2.0, 3.0, 4.0]);
        assert_eq!(buffer.last().unwrap().close, 4.0);
    }

    #[test]
    fn test_validate_ohlc() {
        let mut c = candle(100.0);
        c.high = 105.0;
        c.low = 99.0;
        assert!(c.validate_ohlc());

        c.low = 101.0;
        assert!(!c.validate_ohlc());
    }
}
