use thiserror::Error;

/// Failure modes of a backtest run.
///
/// `OrderTooSmall` and `InsufficientHistory` are operational: the engine
/// records them in the event log and keeps processing. The remaining
/// variants abort the run.
#[derive(Debug, Error)]
pub enum BacktestError {
    /// Out-of-range numeric parameter or invalid enum tag at strategy
    /// construction.
    #[error("invalid parameter: {0}")]
    ParameterValidation(String),

    /// The candle source returned nothing (or zero coverage) for the
    /// requested window.
    #[error("no candle data available: {0}")]
    DataUnavailable(String),

    /// On-demand indicator recomputation cannot proceed.
    #[error("insufficient history: need {needed} bars, have {have}")]
    InsufficientHistory { needed: usize, have: usize },

    /// Internal invariant breach, e.g. opening a second main position.
    #[error("position invariant violated: {0}")]
    PositionInvariantViolation(String),

    /// Computed quantity below the symbol's minimum order size.
    #[error("order quantity {quantity:.6} is below minimum size {minimum:.6}")]
    OrderTooSmall { quantity: f64, minimum: f64 },

    /// Error from an external collaborator (candle source, result sink).
    #[error(transparent)]
    Source(#[from] anyhow::Error),
}
