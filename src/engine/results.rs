use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

use super::balance_tracker::BalanceSnapshot;
use crate::types::Trade;

/// Complete result of one backtest run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestResult {
    // Run metadata
    pub id: Uuid,
    pub user_id: Option<Uuid>,
    pub symbol: String,
    pub timeframe: String,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,

    // Strategy configuration
    pub strategy_name: String,
    pub strategy_params: Value,

    // Execution info
    pub status: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub execution_time_seconds: Option<f64>,

    // Trading results
    pub initial_balance: f64,
    pub final_balance: f64,
    /// Unrealized P&L of positions still open at the end of the window.
    pub unrealized_pnl: f64,
    pub total_trades: u64,
    pub winning_trades: u64,
    pub losing_trades: u64,

    // Performance metrics
    pub total_return: f64,
    pub total_return_percent: f64,
    /// Drawdown amounts are <= 0.
    pub max_drawdown: f64,
    pub max_drawdown_percent: f64,

    pub win_rate: f64,
    pub profit_factor: f64,
    pub sharpe_ratio: Option<f64>,

    pub avg_win: f64,
    /// Negative number.
    pub avg_loss: f64,
    pub largest_win: f64,
    /// Negative number.
    pub largest_loss: f64,

    pub avg_trade_duration_minutes: Option<f64>,
    pub total_fees_paid: f64,

    // Time series
    pub trades: Vec<Trade>,
    pub equity_curve: Vec<BalanceSnapshot>,

    // Engine event counts by kind
    pub event_summary: BTreeMap<String, u64>,
}

impl BacktestResult {
    /// Derive all trade-level metrics from the trade history.
    pub fn calculate_metrics(&mut self) {
        self.total_return = self.final_balance - self.initial_balance;
        if self.initial_balance > 0.0 {
            self.total_return_percent = (self.total_return / self.initial_balance) * 100.0;
        }

        if self.trades.is_empty() {
            return;
        }

        let winners: Vec<&Trade> = self.trades.iter().filter(|t| t.pnl > 0.0).collect();
        let losers: Vec<&Trade> = self.trades.iter().filter(|t| t.pnl < 0.0).collect();

        self.total_trades = self.trades.len() as u64;
        self.winning_trades = winners.len() as u64;
        self.losing_trades = losers.len() as u64;

        if self.total_trades > 0 {
            self.win_rate = (self.winning_trades as f64 / self.total_trades as f64) * 100.0;
        }

        if !winners.is_empty() {
            let gross_profit: f64 = winners.iter().map(|t| t.pnl).sum();
            self.avg_win = gross_profit / winners.len() as f64;
            self.largest_win = winners.iter().map(|t| t.pnl).fold(f64::MIN, f64::max);
        }

        if !losers.is_empty() {
            let gross_loss: f64 = losers.iter().map(|t| t.pnl).sum();
            self.avg_loss = gross_loss / losers.len() as f64;
            self.largest_loss = losers.iter().map(|t| t.pnl).fold(f64::MAX, f64::min);
        }

        let total_profit: f64 = winners.iter().map(|t| t.pnl).sum();
        let total_loss: f64 = losers.iter().map(|t| t.pnl).sum::<f64>().abs();
        if total_loss > 0.0 {
            self.profit_factor = total_profit / total_loss;
        } else if total_profit > 0.0 {
            self.profit_factor = f64::MAX;
        }

        let total_duration: f64 = self.trades.iter().map(|t| t.duration_seconds()).sum();
        self.avg_trade_duration_minutes = Some(total_duration / self.trades.len() as f64 / 60.0);

        self.total_fees_paid = self.trades.iter().map(|t| t.total_fees()).sum();

        self.sharpe_ratio = self.calculate_sharpe_ratio();
    }

    /// Sharpe ratio over per-trade returns: mean / population standard
    /// deviation of `pnl_percent`. `None` below two trades or with zero
    /// variance.
    pub fn calculate_sharpe_ratio(&self) -> Option<f64> {
        let returns: Vec<f64> = self.trades.iter().map(|t| t.pnl_percent).collect();
        if returns.len() < 2 {
            return None;
        }

        let n = returns.len() as f64;
        let mean = returns.iter().sum::<f64>() / n;
        let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / n;
        let std_dev = variance.sqrt();

        if std_dev == 0.0 {
            return None;
        }

        Some(mean / std_dev)
    }
}
