/// RSI over a close series, using the simple rolling-mean variant: the
/// average gain and loss are plain means of the last `period` price
/// changes.
///
/// Returns `None` below `period + 1` closes, or when the window is
/// completely flat. A window with no losses returns 100.
pub fn rsi(closes: &[f64], period: usize) -> Option<f64> {
    if period == 0 || closes.len() < period + 1 {
        return None;
    }

    let changes: Vec<f64> = closes.windows(2).map(|w| w[1] - w[0]).collect();
    let window = &changes[changes.len() - period..];

    let avg_gain: f64 = window.iter().filter(|c| **c > 0.0).sum::<f64>() / period as f64;
    let avg_loss: f64 = -window.iter().filter(|c| **c < 0.0).sum::<f64>() / period as f64;

    if avg_loss == 0.0 {
        if avg_gain == 0.0 {
            return None;
        }
        return Some(100.0);
    }

    let rs = avg_gain / avg_loss;
    Some(100.0 - (100.0 / (1.0 + rs)))
}

#[cfg(test)]
mod tests {
    use super::rsi;

    #[test]
    fn test_rsi_insufficient_history() {
        assert_eq!(rsi(&[100.0, 101.0], 2), None);
    }

    #[test]
    fn test_rsi_balanced_moves() {
        // One +1 and one -1 change: avg gain == avg loss => RSI 50.
        let closes = [100.0, 101.0, 100.0];
        let value = rsi(&closes, 2).unwrap();
        assert!((value - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_rsi_all_gains_is_100() {
        let closes = [100.0, 101.0, 102.0, 103.0];
        assert_eq!(rsi(&closes, 3), Some(100.0));
    }

    #[test]
    fn test_rsi_flat_window_is_none() {
        let closes = [100.0, 100.0, 100.0, 100.0];
        assert_eq!(rsi(&closes, 3), None);
    }

    #[test]
    fn test_rsi_weighted_by_magnitude() {
        // Changes: +2, -1 over period 2: avg gain 1.0, avg loss 0.5.
        let closes = [100.0, 102.0, 101.0];
        let value = rsi(&closes, 2).unwrap();
        // rs = 2 => rsi = 100 - 100/3
        assert!((value - (100.0 - 100.0 / 3.0)).abs() < 1e-9);
    }
}
