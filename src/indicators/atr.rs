/// Average true range: simple rolling mean of the last `period` true
/// ranges. The first bar's true range is its high-low span; later bars
/// include the gap from the previous close.
///
/// Returns `None` below `period + 1` bars.
pub fn atr(highs: &[f64], lows: &[f64], closes: &[f64], period: usize) -> Option<f64> {
    let len = closes.len();
    if period == 0 || len < period + 1 || highs.len() != len || lows.len() != len {
        return None;
    }

    let mut true_ranges = Vec::with_capacity(len);
    for i in 0..len {
        let hl = highs[i] - lows[i];
        let tr = if i == 0 {
            hl
        } else {
            let prev_close = closes[i - 1];
            hl.max((highs[i] - prev_close).abs())
                .max((lows[i] - prev_close).abs())
        };
        true_ranges.push(tr);
    }

    let sum: f64 = true_ranges.iter().rev().take(period).sum();
    Some(sum / period as f64)
}

#[cfg(test)]
mod tests {
    use super::atr;

    #[test]
    fn test_atr_insufficient_history() {
        let h = [101.0, 102.0];
        let l = [99.0, 100.0];
        let c = [100.0, 101.0];
        assert_eq!(atr(&h, &l, &c, 2), None);
    }

    #[test]
    fn test_atr_simple_ranges() {
        // No gaps: every true range equals high - low = 2.
        let h = [101.0, 102.0, 103.0];
        let l = [99.0, 100.0, 101.0];
        let c = [100.0, 101.0, 102.0];
        let value = atr(&h, &l, &c, 2).unwrap();
        assert!((value - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_atr_includes_gap_from_previous_close() {
        // Second bar gaps up: TR = max(1, |106-100|, |105-100|) = 6.
        let h = [101.0, 106.0, 107.0];
        let l = [99.0, 105.0, 106.0];
        let c = [100.0, 106.0, 106.5];
        let value = atr(&h, &l, &c, 2).unwrap();
        // TRs: [2, 6, max(1, 1, 0)] => mean of last two = 3.5
        assert!((value - 3.5).abs() < 1e-12);
    }
}
