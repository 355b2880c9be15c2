use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::engine::results::BacktestResult;
use crate::types::{Candle, SymbolSpec};

/// Data availability report for a requested window.
#[derive(Debug, Clone)]
pub struct DataAvailability {
    pub available: bool,
    /// Fraction of the requested window actually covered, in [0, 1].
    pub coverage: f64,
    pub data_source: String,
}

/// Source of historical candles and instrument metadata.
///
/// Implementations must be thread-safe; a single source may be shared by
/// concurrently scheduled runs.
#[async_trait]
pub trait CandleSource: Send + Sync {
    /// Fetch candles for the window, sorted by timestamp ascending.
    async fn get_candles(
        &self,
        symbol: &str,
        timeframe: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>>;

    async fn validate_data_availability(
        &self,
        symbol: &str,
        timeframe: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<DataAvailability>;

    async fn get_symbol_info(&self, symbol: &str) -> Result<Option<SymbolSpec>>;
}

/// Receiver for completed backtest results.
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn store(&self, result: &BacktestResult) -> Result<()>;
}

/// Candle source backed by a pre-loaded in-memory vector.
///
/// Coverage is reported as 1.0 whenever any candle falls inside the
/// requested window.
pub struct MemoryCandleSource {
    candles: Vec<Candle>,
    symbol_spec: Option<SymbolSpec>,
}

impl MemoryCandleSource {
    pub fn new(candles: Vec<Candle>) -> Self {
        Self {
            candles,
            symbol_spec: None,
        }
    }

    pub fn with_symbol_spec(mut self, spec: SymbolSpec) -> Self {
        self.symbol_spec = Some(spec);
        self
    }
}

#[async_trait]
impl CandleSource for MemoryCandleSource {
    async fn get_candles(
        &self,
        _symbol: &str,
        _timeframe: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>> {
        Ok(self
            .candles
            .iter()
            .filter(|c| c.timestamp >= start && c.timestamp <= end)
            .cloned()
            .collect())
    }

    async fn validate_data_availability(
        &self,
        symbol: &str,
        timeframe: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<DataAvailability> {
        let count = self.get_candles(symbol, timeframe, start, end).await?.len();
        Ok(DataAvailability {
            available: count > 0,
            coverage: if count > 0 { 1.0 } else { 0.0 },
            data_source: "memory".to_string(),
        })
    }

    async fn get_symbol_info(&self, _symbol: &str) -> Result<Option<SymbolSpec>> {
        Ok(self.symbol_spec.clone())
    }
}

/// Result sink that collects results in memory.
#[derive(Default)]
pub struct MemoryResultSink {
    results: Mutex<Vec<BacktestResult>>,
}

impl MemoryResultSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn results(&self) -> Vec<BacktestResult> {
        self.results.lock().await.clone()
    }
}

#[async_trait]
impl ResultSink for MemoryResultSink {
    async fn store(&self, result: &BacktestResult) -> Result<()> {
        self.results.lock().await.push(result.clone());
        Ok(())
    }
}
