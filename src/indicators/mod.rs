pub mod atr;
pub mod rsi;

pub use atr::*;
pub use rsi::*;

/// Simple moving average over the last `period` values.
pub fn sma(values: &[f64], period: usize) -> Option<f64> {
    if period == 0 || values.len() < period {
        return None;
    }
    let sum: f64 = values.iter().rev().take(period).sum();
    Some(sum / period as f64)
}

/// Exponential moving average with `alpha = 2 / (span + 1)`, seeded from
/// the first value and folded over the whole series.
pub fn ema(values: &[f64], span: usize) -> Option<f64> {
    if span == 0 || values.len() < span {
        return None;
    }
    let alpha = 2.0 / (span as f64 + 1.0);
    let mut current = values[0];
    for value in &values[1..] {
        current = alpha * value + (1.0 - alpha) * current;
    }
    Some(current)
}

/// Sample standard deviation over the last `period` values.
pub fn stddev(values: &[f64], period: usize) -> Option<f64> {
    if period < 2 || values.len() < period {
        return None;
    }
    let mean = sma(values, period)?;
    let variance: f64 = values
        .iter()
        .rev()
        .take(period)
        .map(|v| {
            let diff = v - mean;
            diff * diff
        })
        .sum::<f64>()
        / (period as f64 - 1.0);
    Some(variance.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sma() {
        let values = [1.0, 2.0, 3.0, 4.0];
        assert_eq!(sma(&values, 2), Some(3.5));
        assert_eq!(sma(&values, 4), Some(2.5));
        assert_eq!(sma(&values, 5), None);
    }

    #[test]
    fn test_ema_matches_recursive_definition() {
        // span 3 => alpha 0.5
        let values = [2.0, 4.0, 8.0];
        // 2 -> 3 -> 5.5
        assert_eq!(ema(&values, 3), Some(5.5));
        assert_eq!(ema(&values[..2], 3), None);
    }

    #[test]
    fn test_stddev_is_sample_variance() {
        let values = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        let sd = stddev(&values, 8).unwrap();
        assert!((sd - 2.138089935).abs() < 1e-6);
        assert_eq!(stddev(&values, 1), None);
    }
}
