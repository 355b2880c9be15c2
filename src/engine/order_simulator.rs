use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::BacktestError;
use crate::types::{Candle, TradeSide};

/// Slippage model applied to simulated fills.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlippageModel {
    None,
    /// `slippage_percent` is treated as an absolute price offset.
    FixedAmount,
    Percentage,
    /// Slippage is 10% of the candle range.
    Realistic,
}

/// Translates abstract TP/SL prices into fill prices with slippage and
/// candle-range hit detection. Pure functions; holds configuration only.
#[derive(Debug, Clone)]
pub struct OrderSimulator {
    slippage_model: SlippageModel,
    slippage_percent: f64,
    use_bid_ask_spread: bool,
}

impl OrderSimulator {
    pub fn new(
        slippage_model: SlippageModel,
        slippage_percent: f64,
        use_bid_ask_spread: bool,
    ) -> Self {
        debug!(
            "OrderSimulator initialized: model={:?}, slippage={}%, bid_ask={}",
            slippage_model, slippage_percent, use_bid_ask_spread
        );
        Self {
            slippage_model,
            slippage_percent,
            use_bid_ask_spread,
        }
    }

    /// Simulate a market order fill off the candle close, with adverse
    /// slippage for the taker side.
    pub fn simulate_market_fill(&self, side: TradeSide, candle: &Candle) -> f64 {
        let base_price = candle.close;

        let slippage = match self.slippage_model {
            SlippageModel::None => 0.0,
            SlippageModel::Percentage => base_price * (self.slippage_percent / 100.0),
            SlippageModel::Realistic => candle.range() * 0.1,
            SlippageModel::FixedAmount => self.slippage_percent,
        };

        let mut filled_price = match side {
            // Long entry buys at a higher price, short entry sells lower.
            TradeSide::Long => base_price + slippage,
            TradeSide::Short => base_price - slippage,
        };

        if self.use_bid_ask_spread {
            let spread = base_price * 0.0001;
            match side {
                TradeSide::Long => filled_price += spread / 2.0,
                TradeSide::Short => filled_price -= spread / 2.0,
            }
        }

        filled_price
    }

    /// Check whether a stop level was touched inside the candle. The fill
    /// is worse than the stop by the configured slippage.
    pub fn check_stop_hit(&self, candle: &Candle, stop_price: f64, side: TradeSide) -> Option<f64> {
        let slippage = stop_price * (self.slippage_percent / 100.0);

        match side {
            TradeSide::Long => {
                if candle.low <= stop_price {
                    return Some(stop_price - slippage);
                }
            }
            TradeSide::Short => {
                if candle.high >= stop_price {
                    return Some(stop_price + slippage);
                }
            }
        }

        None
    }

    /// Check whether a take-profit level was touched inside the candle.
    /// Favorable fills execute at the TP price with no slippage.
    pub fn check_take_profit_hit(
        &self,
        candle: &Candle,
        tp_price: f64,
        side: TradeSide,
    ) -> Option<f64> {
        match side {
            TradeSide::Long => {
                if candle.high >= tp_price {
                    return Some(tp_price);
                }
            }
            TradeSide::Short => {
                if candle.low <= tp_price {
                    return Some(tp_price);
                }
            }
        }

        None
    }

    /// Trailing stop fills behave like regular stop-loss fills, including
    /// the adverse slippage.
    pub fn check_trailing_stop_hit(
        &self,
        candle: &Candle,
        trailing_stop_price: f64,
        side: TradeSide,
    ) -> Option<f64> {
        self.check_stop_hit(candle, trailing_stop_price, side)
    }

    /// Execution prices must fall within the candle range, with a 10%
    /// tolerance for slippage beyond it.
    pub fn validate_execution_price(&self, price: f64, candle: &Candle) -> bool {
        let tolerance = candle.range() * 0.1;
        (candle.low - tolerance) <= price && price <= (candle.high + tolerance)
    }

    /// Validate quantity against the instrument minimum.
    pub fn validate_order_size(
        quantity: f64,
        minimum: f64,
        symbol: &str,
    ) -> Result<(), BacktestError> {
        if quantity <= 0.0 || quantity < minimum {
            warn!(
                "Order quantity {:.6} is below minimum size {:.6} for {}, order will be skipped",
                quantity, minimum, symbol
            );
            return Err(BacktestError::OrderTooSmall { quantity, minimum });
        }
        Ok(())
    }

    /// Round a quantity to the nearest multiple of `precision`, then strip
    /// float residue at the precision's decimal count.
    pub fn round_to_precision(quantity: f64, precision: f64) -> f64 {
        if precision <= 0.0 {
            return quantity;
        }

        let rounded = (quantity / precision).round() * precision;

        let decimal_places = if precision >= 1.0 {
            0
        } else {
            (-precision.log10()).ceil() as i32
        };
        let factor = 10f64.powi(decimal_places);
        (rounded * factor).round() / factor
    }
}

impl Default for OrderSimulator {
    fn default() -> Self {
        Self::new(SlippageModel::Percentage, 0.05, false)
    }
}
