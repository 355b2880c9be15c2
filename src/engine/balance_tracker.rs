use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

/// Net market exposure at snapshot time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExposureSide {
    Long,
    Short,
    /// Main and hedge positions open on opposite sides.
    Hedged,
}

impl fmt::Display for ExposureSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExposureSide::Long => write!(f, "long"),
            ExposureSide::Short => write!(f, "short"),
            ExposureSide::Hedged => write!(f, "hedged"),
        }
    }
}

/// One point on the equity curve.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceSnapshot {
    pub timestamp: DateTime<Utc>,
    pub balance: f64,
    /// balance + unrealized P&L across open positions.
    pub equity: f64,
    pub position_side: Option<ExposureSide>,
    pub position_size: f64,
    pub unrealized_pnl: f64,
    pub cumulative_pnl: f64,
    pub cumulative_trades: u64,
}

/// Tracks balance, equity curve and drawdown during a run.
#[derive(Debug, Clone)]
pub struct BalanceTracker {
    pub initial_balance: f64,
    pub current_balance: f64,
    snapshots: Vec<BalanceSnapshot>,

    // Drawdown tracking; amounts are <= 0.
    peak_equity: f64,
    current_drawdown: f64,
    pub max_drawdown: f64,
    pub max_drawdown_percent: f64,

    pub cumulative_pnl: f64,
    pub cumulative_trades: u64,
}

impl BalanceTracker {
    pub fn new(initial_balance: f64) -> Self {
        debug!("BalanceTracker initialized with {} quote units", initial_balance);
        Self {
            initial_balance,
            current_balance: initial_balance,
            snapshots: Vec::new(),
            peak_equity: initial_balance,
            current_drawdown: 0.0,
            max_drawdown: 0.0,
            max_drawdown_percent: 0.0,
            cumulative_pnl: 0.0,
            cumulative_trades: 0,
        }
    }

    /// Apply a realized trade result to the balance.
    pub fn apply_realized(&mut self, pnl: f64, fee: f64) {
        let net_pnl = pnl - fee;
        self.current_balance += net_pnl;
        self.cumulative_pnl += net_pnl;
        self.cumulative_trades += 1;

        debug!(
            "Balance updated: pnl={:.2}, new balance={:.2}",
            net_pnl, self.current_balance
        );
    }

    /// Deduct an entry fee (DCA or hedge add) without counting a trade.
    pub fn apply_fee(&mut self, fee: f64) {
        self.current_balance -= fee;
        self.cumulative_pnl -= fee;

        debug!("Entry fee deducted: fee={:.4}, new balance={:.2}", fee, self.current_balance);
    }

    /// Record one equity-curve point and refresh drawdown tracking.
    pub fn snapshot(
        &mut self,
        timestamp: DateTime<Utc>,
        position_side: Option<ExposureSide>,
        position_size: f64,
        unrealized_pnl: f64,
    ) {
        let equity = self.current_balance + unrealized_pnl;

        self.snapshots.push(BalanceSnapshot {
            timestamp,
            balance: self.current_balance,
            equity,
            position_side,
            position_size,
            unrealized_pnl,
            cumulative_pnl: self.cumulative_pnl,
            cumulative_trades: self.cumulative_trades,
        });

        self.update_drawdown(equity);
    }

    fn update_drawdown(&mut self, current_equity: f64) {
        if current_equity > self.peak_equity {
            self.peak_equity = current_equity;
            self.current_drawdown = 0.0;
        } else {
            self.current_drawdown = current_equity - self.peak_equity;

            if self.current_drawdown < self.max_drawdown {
                self.max_drawdown = self.current_drawdown;
                if self.peak_equity > 0.0 {
                    self.max_drawdown_percent = (self.max_drawdown / self.peak_equity) * 100.0;
                }
            }
        }
    }

    pub fn equity_curve(&self) -> &[BalanceSnapshot] {
        &self.snapshots
    }

    pub fn into_equity_curve(self) -> Vec<BalanceSnapshot> {
        self.snapshots
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 0, minute, 0).unwrap()
    }

    #[test]
    fn test_apply_realized() {
        let mut tracker = BalanceTracker::new(10_000.0);
        tracker.apply_realized(100.0, 5.0);
        assert!((tracker.current_balance - 10_095.0).abs() < 1e-9);
        assert!((tracker.cumulative_pnl - 95.0).abs() < 1e-9);
        assert_eq!(tracker.cumulative_trades, 1);
    }

    #[test]
    fn test_snapshot_equity_includes_unrealized() {
        let mut tracker = BalanceTracker::new(10_000.0);
        tracker.snapshot(ts(0), Some(ExposureSide::Long), 10.0, 250.0);

        let snap = &tracker.equity_curve()[0];
        assert!((snap.equity - 10_250.0).abs() < 1e-9);
        assert_eq!(snap.position_side, Some(ExposureSide::Long));
        assert_eq!(snap.cumulative_trades, 0);
    }

    #[test]
    fn test_drawdown_tracks_peak_equity() {
        let mut tracker = BalanceTracker::new(10_000.0);
        // New peak at 10_500, then a drop to 10_100.
        tracker.snapshot(ts(0), None, 0.0, 500.0);
        tracker.snapshot(ts(1), None, 0.0, 100.0);

        assert!((tracker.max_drawdown + 400.0).abs() < 1e-9);
        assert!((tracker.max_drawdown_percent + 400.0 / 10_500.0 * 100.0).abs() < 1e-9);

        // Recovery does not erase the max drawdown.
        tracker.snapshot(ts(2), None, 0.0, 600.0);
        assert!((tracker.max_drawdown + 400.0).abs() < 1e-9);
    }
}
