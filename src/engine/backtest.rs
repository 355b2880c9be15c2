use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::balance_tracker::{BalanceTracker, ExposureSide};
use super::dca::{self, DcaSettings};
use super::dual_side::{self, DualSideSettings, MainTpPrices};
use super::events::{EventKind, EventLog};
use super::order_simulator::{OrderSimulator, SlippageModel};
use super::position_manager::{OpenRequest, PositionManager};
use super::results::BacktestResult;
use crate::data::CandleSource;
use crate::error::BacktestError;
use crate::strategies::{ExitRules, Strategy};
use crate::types::{Candle, ExitReason, Position, SymbolSpec, Trade, TradeSide};

/// Engine construction parameters.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub initial_balance: f64,
    pub fee_rate: f64,
    pub slippage_model: SlippageModel,
    pub slippage_percent: f64,
    pub use_bid_ask_spread: bool,
    pub log_events: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            initial_balance: 10_000.0,
            fee_rate: 0.0005,
            slippage_model: SlippageModel::Percentage,
            slippage_percent: 0.05,
            use_bid_ask_spread: false,
            log_events: true,
        }
    }
}

/// Inputs for one backtest run.
#[derive(Debug, Clone)]
pub struct BacktestRequest {
    pub user_id: Option<Uuid>,
    pub symbol: String,
    pub timeframe: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub strategy_name: String,
    /// Flat key/value parameter map, stored verbatim on the result.
    pub strategy_params: Value,
}

/// Snapshot of the main position used by the hedge subsystem.
struct MainState {
    side: TradeSide,
    leverage: f64,
    dca_count: u32,
    current_quantity: f64,
    last_filled_price: f64,
    stop_reference: Option<f64>,
    tp_prices: MainTpPrices,
}

/// Event-driven backtesting engine.
///
/// Owns the main and hedge position managers, the balance tracker, the
/// order simulator and the event log; drives the deterministic per-bar
/// loop over the candle stream.
pub struct BacktestEngine {
    source: Arc<dyn CandleSource>,
    config: EngineConfig,
    simulator: OrderSimulator,
    balance: BalanceTracker,
    main: PositionManager,
    hedge: PositionManager,
    events: Option<EventLog>,

    // Per-run state, populated at the start of `run`.
    symbol: String,
    symbol_spec: SymbolSpec,
    exit_rules: ExitRules,
    dca_settings: DcaSettings,
    dual_settings: DualSideSettings,
    dual_entry_count: u32,
}

impl BacktestEngine {
    pub fn new(source: Arc<dyn CandleSource>, config: EngineConfig) -> Self {
        let simulator = OrderSimulator::new(
            config.slippage_model,
            config.slippage_percent,
            config.use_bid_ask_spread,
        );
        let events = if config.log_events {
            Some(EventLog::default())
        } else {
            None
        };

        info!(
            "BacktestEngine initialized: balance={}, fee={}%, slippage={}%",
            config.initial_balance,
            config.fee_rate * 100.0,
            config.slippage_percent
        );

        Self {
            balance: BalanceTracker::new(config.initial_balance),
            main: PositionManager::new(config.fee_rate),
            hedge: PositionManager::new(config.fee_rate),
            simulator,
            events,
            source,
            config,
            symbol: String::new(),
            symbol_spec: SymbolSpec::fallback_for("BTC"),
            exit_rules: ExitRules::default(),
            dca_settings: DcaSettings::default(),
            dual_settings: DualSideSettings::default(),
            dual_entry_count: 0,
        }
    }

    /// Main position still open after the run, if any.
    pub fn main_position(&self) -> Option<&Position> {
        self.main.position()
    }

    /// Hedge position still open after the run, if any.
    pub fn hedge_position(&self) -> Option<&Position> {
        self.hedge.position()
    }

    /// Recorded engine events, when event logging is enabled.
    pub fn events(&self) -> Option<&EventLog> {
        self.events.as_ref()
    }

    /// Run the simulation over the requested window.
    pub async fn run<S: Strategy>(
        &mut self,
        request: &BacktestRequest,
        strategy: &mut S,
    ) -> Result<BacktestResult, BacktestError> {
        let started_at = Utc::now();

        self.symbol = request.symbol.clone();
        self.exit_rules = strategy.exit_rules().clone();
        self.dca_settings = strategy.dca_settings().clone();
        self.dual_settings = strategy.dual_side_settings().clone();
        self.dual_entry_count = 0;

        info!(
            "Starting backtest: {} {} from {} to {}",
            request.symbol, request.timeframe, request.start, request.end
        );

        // Resolve instrument specs, falling back to the per-base table.
        self.symbol_spec = match self.source.get_symbol_info(&request.symbol).await? {
            Some(spec) => {
                info!(
                    "Symbol specifications loaded: min_size={}, contract_size={}, tick_size={}",
                    spec.min_size, spec.contract_size, spec.tick_size
                );
                spec
            }
            None => {
                let base = SymbolSpec::base_of(&request.symbol);
                let spec = SymbolSpec::fallback_for(base);
                warn!(
                    "Failed to load symbol specifications for {}, using fallback: min_size={}, contract_size={}",
                    request.symbol, spec.min_size, spec.contract_size
                );
                spec
            }
        };

        let availability = self
            .source
            .validate_data_availability(
                &request.symbol,
                &request.timeframe,
                request.start,
                request.end,
            )
            .await?;

        if !availability.available || availability.coverage <= 0.0 {
            return Err(BacktestError::DataUnavailable(format!(
                "{} {} from {} to {}",
                request.symbol, request.timeframe, request.start, request.end
            )));
        }
        if availability.coverage < 0.9 {
            warn!("Low data coverage: {:.1}%", availability.coverage * 100.0);
        }

        let candles = self
            .source
            .get_candles(&request.symbol, &request.timeframe, request.start, request.end)
            .await?;

        if candles.is_empty() {
            return Err(BacktestError::DataUnavailable(format!(
                "no candles returned for {} {}",
                request.symbol, request.timeframe
            )));
        }

        info!("Processing {} candles", candles.len());

        for candle in &candles {
            self.process_candle(candle, strategy)?;
        }

        // Still-open positions are reported as unrealized P&L, not closed.
        let last_close = candles[candles.len() - 1].close;
        let last_timestamp = candles[candles.len() - 1].timestamp;
        let mut unrealized_pnl = 0.0;

        if let Some(position) = self.main.position_mut() {
            position.update_unrealized_pnl(last_close);
            unrealized_pnl += position.unrealized_pnl;
            let message = format!(
                "backtest ended with open main position: side={}, avg_entry={:.2}, remaining={:.6}, unrealized={:.2}, dca_count={}",
                position.side,
                position.average_entry_price(),
                position.current_quantity(),
                position.unrealized_pnl,
                position.dca_count
            );
            warn!("{}", message);
            self.record_event(last_timestamp, EventKind::Warning, message);
        }

        if let Some(position) = self.hedge.position_mut() {
            position.update_unrealized_pnl(last_close);
            unrealized_pnl += position.unrealized_pnl;
            let message = format!(
                "backtest ended with open hedge position: side={}, avg_entry={:.2}, remaining={:.6}, unrealized={:.2}",
                position.side,
                position.average_entry_price(),
                position.current_quantity(),
                position.unrealized_pnl
            );
            warn!("{}", message);
            self.record_event(last_timestamp, EventKind::Warning, message);
        }

        let completed_at = Utc::now();
        let execution_time = (completed_at - started_at).num_milliseconds() as f64 / 1000.0;

        let mut result = BacktestResult {
            id: Uuid::new_v4(),
            user_id: request.user_id,
            symbol: request.symbol.clone(),
            timeframe: request.timeframe.clone(),
            start_date: request.start,
            end_date: request.end,
            strategy_name: request.strategy_name.clone(),
            strategy_params: request.strategy_params.clone(),
            status: "completed".to_string(),
            started_at,
            completed_at: Some(completed_at),
            execution_time_seconds: Some(execution_time),
            initial_balance: self.config.initial_balance,
            final_balance: self.balance.current_balance,
            unrealized_pnl,
            total_trades: 0,
            winning_trades: 0,
            losing_trades: 0,
            total_return: 0.0,
            total_return_percent: 0.0,
            max_drawdown: self.balance.max_drawdown,
            max_drawdown_percent: self.balance.max_drawdown_percent,
            win_rate: 0.0,
            profit_factor: 0.0,
            sharpe_ratio: None,
            avg_win: 0.0,
            avg_loss: 0.0,
            largest_win: 0.0,
            largest_loss: 0.0,
            avg_trade_duration_minutes: None,
            total_fees_paid: 0.0,
            trades: self.collect_trades(),
            equity_curve: self.balance.equity_curve().to_vec(),
            event_summary: self
                .events
                .as_ref()
                .map(|log| log.summary())
                .unwrap_or_else(BTreeMap::new),
        };

        result.calculate_metrics();

        info!(
            "Backtest completed: {} trades, return {:.2}%, win rate {:.2}%",
            result.total_trades, result.total_return_percent, result.win_rate
        );

        Ok(result)
    }

    /// One bar of the deterministic event loop: main exits, hedge exits,
    /// DCA adds, P&L/trailing update or entry attempt, equity snapshot.
    fn process_candle<S: Strategy>(
        &mut self,
        candle: &Candle,
        strategy: &mut S,
    ) -> Result<(), BacktestError> {
        if self.main.has_position() {
            self.check_main_exits(candle, strategy);
        }

        if self.hedge.has_position() {
            self.check_hedge_exits(candle);
        }

        if self.main.has_position() {
            self.check_dca(candle, strategy)?;
        }

        if self.main.has_position() {
            self.update_open_position(candle, strategy);
        } else {
            self.try_entry(candle, strategy)?;
        }

        self.record_snapshot(candle);
        Ok(())
    }

    /// Main-position exit checks in priority order: trend reversal,
    /// trailing stop, partial TPs, full-TP fallback, stop loss.
    fn check_main_exits<S: Strategy>(&mut self, candle: &Candle, strategy: &mut S) {
        // The trailing stop tracks this bar's close before any hit check,
        // so same-bar checks see the newly raised stop.
        if let Some(position) = self.main.position_mut() {
            if position.trailing_stop_activated {
                position.update_trailing_stop(candle.close);
            }
        } else {
            return;
        }

        if self.exit_rules.use_trend_close && self.check_trend_reversal_exit(candle, strategy) {
            return;
        }

        let (side, trailing_price) = match self.main.position() {
            Some(position) if position.trailing_stop_activated => {
                (position.side, position.trailing_stop_price)
            }
            Some(position) => (position.side, None),
            None => return,
        };

        if let Some(stop) = trailing_price {
            if let Some(filled_price) = self.simulator.check_trailing_stop_hit(candle, stop, side) {
                if let Some(trade) = self.main.close(
                    filled_price,
                    candle.timestamp,
                    ExitReason::TrailingStop,
                ) {
                    self.apply_trade(&trade);
                    self.record_event(
                        candle.timestamp,
                        EventKind::TrailingStopHit,
                        format!("trailing stop hit @ {:.2}, pnl={:.2}", filled_price, trade.pnl),
                    );
                    self.handle_dual_after_main_close(trade.exit_reason, candle, filled_price, true);
                }
                return;
            }
        }

        if !self.check_partial_take_profits(candle, strategy) {
            // A skipped partial fill suppresses the remaining checks for
            // this bar.
            return;
        }

        // Full-TP fallback applies only without partial levels.
        let full_tp = match self.main.position() {
            Some(position) if !position.has_partial_exits() => position.take_profit_price,
            Some(_) => None,
            None => return,
        };

        if let Some(tp_price) = full_tp {
            if let Some(filled_price) = self.simulator.check_take_profit_hit(candle, tp_price, side)
            {
                if let Some(trade) =
                    self.main
                        .close(filled_price, candle.timestamp, ExitReason::TakeProfit)
                {
                    self.apply_trade(&trade);
                    self.record_event(
                        candle.timestamp,
                        EventKind::TakeProfitHit,
                        format!("take profit hit @ {:.2}, pnl={:.2}", filled_price, trade.pnl),
                    );
                    self.handle_dual_after_main_close(trade.exit_reason, candle, filled_price, true);
                }
                return;
            }
        }

        let (stop_loss, is_break_even) = match self.main.position() {
            Some(position) => (position.stop_loss_price, position.is_break_even_stop()),
            None => return,
        };

        if let Some(sl_price) = stop_loss {
            // Regular stop losses respect the use_sl switch; break-even
            // stops always apply.
            if !is_break_even && !self.exit_rules.use_sl {
                return;
            }

            if let Some(filled_price) = self.simulator.check_stop_hit(candle, sl_price, side) {
                // Break-even fills at the exact stop with no slippage.
                let filled_price = if is_break_even { sl_price } else { filled_price };
                let reason = if is_break_even {
                    ExitReason::BreakEven
                } else {
                    ExitReason::StopLoss
                };

                if let Some(trade) = self.main.close(filled_price, candle.timestamp, reason) {
                    self.apply_trade(&trade);
                    self.record_event(
                        candle.timestamp,
                        EventKind::StopLossHit,
                        format!(
                            "{} hit @ {:.2}, pnl={:.2}",
                            reason, filled_price, trade.pnl
                        ),
                    );
                    self.handle_dual_after_main_close(trade.exit_reason, candle, filled_price, true);
                }
            }
        }
    }

    /// Partial TP handling. Returns false when the remaining exit checks
    /// of this bar must be skipped (below-minimum fill).
    fn check_partial_take_profits<S: Strategy>(&mut self, candle: &Candle, strategy: &mut S) -> bool {
        let (side, level, tp_price, configured_ratio, total_quantity) = match self.main.position() {
            Some(position) => match position.should_exit_partial(candle.close) {
                Some(level) => (
                    position.side,
                    level,
                    position.tp_price(level),
                    position.tp_ratio(level),
                    position.total_quantity(),
                ),
                None => return true,
            },
            None => return true,
        };

        let tp_price = match tp_price {
            Some(price) => price,
            None => return true,
        };

        let filled_price = match self.simulator.check_take_profit_hit(candle, tp_price, side) {
            Some(price) => price,
            None => return true,
        };

        let partial_quantity = total_quantity * configured_ratio;
        let mut rounded_quantity =
            OrderSimulator::round_to_precision(partial_quantity, self.symbol_spec.contract_size);

        if let Err(err) = OrderSimulator::validate_order_size(
            rounded_quantity,
            self.symbol_spec.minimum_qty(),
            &self.symbol,
        ) {
            self.record_event(
                candle.timestamp,
                EventKind::OrderSkipped,
                format!("TP{} partial exit skipped: {}", level, err),
            );
            return false;
        }

        if rounded_quantity > total_quantity {
            rounded_quantity = total_quantity;
        }
        let exit_ratio = rounded_quantity / total_quantity;

        // Record the SL that was valid during this sub-trade, before any
        // break-even promotion below.
        let sl_snapshot = self.main.position().and_then(|p| p.stop_loss_price);

        let trade = match self.main.partial_close(
            filled_price,
            candle.timestamp,
            level,
            exit_ratio,
            sl_snapshot,
        ) {
            Some(trade) => trade,
            None => return true,
        };

        self.apply_trade(&trade);
        self.record_event(
            candle.timestamp,
            EventKind::TakeProfitHit,
            format!(
                "TP{} hit @ {:.2} ({:.0}% closed), pnl={:.2}",
                level,
                filled_price,
                exit_ratio * 100.0,
                trade.pnl
            ),
        );

        if !self.main.has_position() {
            debug!("All partial exits completed, position fully closed");
            self.handle_dual_after_main_close(trade.exit_reason, candle, filled_price, true);
            return true;
        }

        // Break-even promotion after the partial fill.
        let (tp2_price, tp3_price) = {
            let position = self.main.position_mut().unwrap();
            let break_even_price = match level {
                1 if self.exit_rules.use_break_even => Some(position.average_entry_price()),
                2 if self.exit_rules.use_break_even_tp2 => position.tp1_price,
                3 if self.exit_rules.use_break_even_tp3 => {
                    // Suppressed at full TP coverage.
                    let total_ratio =
                        position.tp1_ratio + position.tp2_ratio + position.tp3_ratio;
                    if total_ratio < 0.99 {
                        position.tp2_price
                    } else {
                        None
                    }
                }
                _ => None,
            };

            if let Some(price) = break_even_price {
                position.stop_loss_price = Some(price);
                debug!("Break-even after TP{}: SL moved to {:.2}", level, price);
            }

            (position.tp2_price, position.tp3_price)
        };

        // Arm the trailing stop when this level is the start point.
        if self.exit_rules.trailing_stop_active && level == self.exit_rules.trailing_start_point {
            let already_active = self
                .main
                .position()
                .map_or(false, |p| p.trailing_stop_activated);
            if !already_active {
                let offset =
                    strategy.calculate_trailing_offset(side, filled_price, tp2_price, tp3_price);
                if self
                    .main
                    .activate_trailing_stop_after_tp(filled_price, offset, Some(level))
                {
                    self.record_event(
                        candle.timestamp,
                        EventKind::TrailingStopActivated,
                        format!("trailing stop armed after TP{} (offset {:.4})", level, offset),
                    );
                }
            }
        }

        true
    }

    /// Trend-reversal exit: close the main position against a strong
    /// opposing trend state. Returns true when the position was closed.
    fn check_trend_reversal_exit<S: Strategy>(&mut self, candle: &Candle, strategy: &mut S) -> bool {
        let side = match self.main.position() {
            Some(position) => position.side,
            None => return false,
        };

        let trend_state = candle.trend_state.or_else(|| strategy.compute_trend_state());
        let state = match trend_state {
            Some(state) => state,
            None => return false,
        };

        let should_exit = matches!(
            (side, state),
            (TradeSide::Long, -2) | (TradeSide::Short, 2)
        );
        if !should_exit {
            return false;
        }

        info!(
            "Trend reversal detected: {} position, trend_state={}, closing",
            side, state
        );

        // Trend exits fill at the bar close with no slippage.
        if let Some(trade) = self
            .main
            .close(candle.close, candle.timestamp, ExitReason::Signal)
        {
            self.apply_trade(&trade);
            self.record_event(
                candle.timestamp,
                EventKind::PositionClosed,
                format!(
                    "trend reversal exit @ {:.2} (state={}), pnl={:.2}",
                    candle.close, state, trade.pnl
                ),
            );
            self.handle_dual_after_main_close(trade.exit_reason, candle, candle.close, true);
        }

        true
    }

    /// Hedge TP/SL checks, with the optional cascade onto the main side.
    fn check_hedge_exits(&mut self, candle: &Candle) {
        let (side, tp_price, sl_price) = match self.hedge.position() {
            Some(position) => (
                position.side,
                position.take_profit_price,
                position.stop_loss_price,
            ),
            None => return,
        };

        if let Some(tp_price) = tp_price {
            if let Some(filled_price) = self.simulator.check_take_profit_hit(candle, tp_price, side)
            {
                if let Some(trade) =
                    self.hedge
                        .close(filled_price, candle.timestamp, ExitReason::HedgeTp)
                {
                    self.apply_trade(&trade);
                    self.record_event(
                        candle.timestamp,
                        EventKind::TakeProfitHit,
                        format!("hedge TP hit @ {:.2}, pnl={:.2}", filled_price, trade.pnl),
                    );

                    if self.dual_settings.close_main_on_hedge_tp && self.main.has_position() {
                        if let Some(main_trade) =
                            self.main
                                .close(filled_price, candle.timestamp, ExitReason::HedgeTp)
                        {
                            self.apply_trade(&main_trade);
                            self.record_event(
                                candle.timestamp,
                                EventKind::PositionClosed,
                                format!(
                                    "main closed on hedge TP @ {:.2}, pnl={:.2}",
                                    filled_price, main_trade.pnl
                                ),
                            );
                            self.handle_dual_after_main_close(
                                main_trade.exit_reason,
                                candle,
                                filled_price,
                                false,
                            );
                        }
                    }
                }
                return;
            }
        }

        if let Some(sl_price) = sl_price {
            if let Some(filled_price) = self.simulator.check_stop_hit(candle, sl_price, side) {
                if let Some(trade) =
                    self.hedge
                        .close(filled_price, candle.timestamp, ExitReason::HedgeSl)
                {
                    self.apply_trade(&trade);
                    self.record_event(
                        candle.timestamp,
                        EventKind::StopLossHit,
                        format!("hedge SL hit @ {:.2}, pnl={:.2}", filled_price, trade.pnl),
                    );
                }
            }
        }
    }

    /// DCA phase: limit, price trigger, RSI gate and trend gate, then the
    /// scaled add plus hedge follow-up.
    fn check_dca<S: Strategy>(
        &mut self,
        candle: &Candle,
        strategy: &mut S,
    ) -> Result<(), BacktestError> {
        if !self.dca_settings.enabled {
            return Ok(());
        }

        let (side, dca_count, levels_empty, price_ok) = match self.main.position() {
            Some(position) => (
                position.side,
                position.dca_count,
                position.dca_levels.is_empty(),
                dca::check_price_trigger(
                    candle.close,
                    &position.dca_levels,
                    position.side,
                    self.dca_settings.use_price_check,
                ),
            ),
            None => return Ok(()),
        };

        if dca_count >= self.dca_settings.limit {
            debug!(
                "DCA limit reached: count={}, limit={}",
                dca_count, self.dca_settings.limit
            );
            return Ok(());
        }

        if levels_empty {
            warn!("No DCA levels set for position, skipping DCA check");
            return Ok(());
        }

        if !price_ok {
            return Ok(());
        }

        let rsi = candle.rsi.or_else(|| strategy.compute_rsi());
        if !dca::check_rsi_gate(rsi, side, &self.dca_settings) {
            return Ok(());
        }

        let (mut ema, mut sma) = (candle.ema, candle.sma);
        if ema.is_none() || sma.is_none() {
            let (computed_ema, computed_sma) = strategy.compute_trend_averages();
            ema = computed_ema;
            sma = computed_sma;
        }

        if !dca::check_trend_gate(
            ema,
            sma,
            side,
            candle.trend_state,
            self.dca_settings.use_trend_gate,
        ) {
            return Ok(());
        }

        self.execute_dca_entry(candle, strategy)
    }

    fn execute_dca_entry<S: Strategy>(
        &mut self,
        candle: &Candle,
        strategy: &mut S,
    ) -> Result<(), BacktestError> {
        let (side, next_index, initial_investment, initial_contracts) = match self.main.position() {
            Some(position) => (
                position.side,
                position.dca_count + 1,
                position.initial_investment,
                position
                    .entry_history
                    .first()
                    .map(|e| e.quantity)
                    .unwrap_or(position.quantity),
            ),
            None => return Ok(()),
        };

        let (investment, contracts) = dca::calculate_entry_size(
            initial_investment,
            initial_contracts,
            next_index,
            self.dca_settings.entry_multiplier,
        );

        let contracts =
            OrderSimulator::round_to_precision(contracts, self.symbol_spec.contract_size);

        if let Err(err) = OrderSimulator::validate_order_size(
            contracts,
            self.symbol_spec.minimum_qty(),
            &self.symbol,
        ) {
            self.record_event(
                candle.timestamp,
                EventKind::OrderSkipped,
                format!("DCA entry #{} skipped: {}", next_index, err),
            );
            return Ok(());
        }

        let filled_price = self.simulator.simulate_market_fill(side, candle);
        let entry_fee = investment * self.config.fee_rate;

        self.main.add_to_position(
            filled_price,
            contracts,
            investment,
            candle.timestamp,
            &format!("dca_{}", next_index),
        )?;
        self.balance.apply_fee(entry_fee);

        self.record_event(
            candle.timestamp,
            EventKind::DcaEntry,
            format!(
                "DCA entry #{}: {} @ {:.2}, qty={:.6}, investment={:.2}",
                next_index, side, filled_price, contracts, investment
            ),
        );

        // Rebuild the ladder and TP levels from the updated averages.
        let (avg_entry, last_filled) = {
            let position = self.main.position().unwrap();
            (position.average_entry_price(), position.last_filled_price)
        };

        let new_levels = dca::calculate_dca_levels(
            avg_entry,
            last_filled,
            &self.dca_settings,
            side,
            candle.atr,
        );
        let tp_levels = strategy.calculate_tp_levels(side, avg_entry, candle.atr);

        {
            let position = self.main.position_mut().unwrap();
            position.dca_levels = new_levels;
            position.tp1_price = tp_levels.tp1;
            position.tp2_price = tp_levels.tp2;
            position.tp3_price = tp_levels.tp3;
        }

        self.handle_dual_after_main_dca(candle);
        Ok(())
    }

    fn main_state(&self) -> Option<MainState> {
        self.main.position().map(|position| MainState {
            side: position.side,
            leverage: position.leverage,
            dca_count: position.dca_count,
            current_quantity: position.current_quantity(),
            last_filled_price: position.last_filled_price,
            stop_reference: if position.trailing_stop_activated
                && position.trailing_stop_price.is_some()
            {
                position.trailing_stop_price
            } else {
                position.stop_loss_price
            },
            tp_prices: MainTpPrices {
                tp1: position.tp1_price,
                tp2: position.tp2_price,
                tp3: position.tp3_price,
            },
        })
    }

    /// Hedge follow-up after a main DCA fill: refresh targets, then open
    /// or extend the opposite-side position once the trigger is reached.
    fn handle_dual_after_main_dca(&mut self, candle: &Candle) {
        if !self.dual_settings.enabled {
            return;
        }

        // Keep hedge TP/SL aligned with the latest main state.
        self.refresh_dual_targets();

        let main = match self.main_state() {
            Some(state) => state,
            None => return,
        };
        let is_last_dca = self.is_last_main_dca(main.dca_count);

        if !dual_side::should_open_dual_side(main.dca_count, &self.dual_settings) {
            return;
        }
        if !dual_side::can_add_dual_side(self.dual_entry_count, &self.dual_settings) {
            debug!(
                "Hedge entry limit reached: count={}, limit={}",
                self.dual_entry_count, self.dual_settings.pyramiding_limit
            );
            return;
        }

        let opposite_side = main.side.opposite();

        let quantity =
            dual_side::calculate_dual_side_quantity(main.current_quantity, &self.dual_settings);
        let quantity = OrderSimulator::round_to_precision(quantity, self.symbol_spec.contract_size);

        if let Err(err) = OrderSimulator::validate_order_size(
            quantity,
            self.symbol_spec.minimum_qty(),
            &self.symbol,
        ) {
            self.record_event(
                candle.timestamp,
                EventKind::OrderSkipped,
                format!("hedge entry skipped: {}", err),
            );
            return;
        }

        let filled_price = self.simulator.simulate_market_fill(opposite_side, candle);

        let tp_price = dual_side::calculate_dual_side_tp_price(
            filled_price,
            opposite_side,
            &self.dual_settings,
            main.stop_reference,
            Some(main.last_filled_price),
            is_last_dca,
        );
        let sl_price = dual_side::calculate_dual_side_sl_price(
            filled_price,
            opposite_side,
            &self.dual_settings,
            &main.tp_prices,
        );

        let investment = (filled_price * quantity) / main.leverage;
        let entry_fee = investment * self.config.fee_rate;
        let entry_index = self.dual_entry_count + 1;

        let open_result = if !self.hedge.has_position() {
            self.hedge
                .open(OpenRequest {
                    side: opposite_side,
                    price: filled_price,
                    quantity,
                    leverage: main.leverage,
                    timestamp: candle.timestamp,
                    investment,
                    take_profit_price: tp_price,
                    stop_loss_price: sl_price,
                    entry_reason: Some("dual_side_entry".to_string()),
                    entry_rsi: candle.rsi,
                    entry_atr: candle.atr,
                    is_dual_side: true,
                    main_position_side: Some(main.side),
                    dual_side_entry_index: Some(entry_index),
                    parent_trade_id: Some(self.main.trade_counter()),
                })
                .map(|_| ())
        } else {
            self.hedge
                .add_to_position(
                    filled_price,
                    quantity,
                    investment,
                    candle.timestamp,
                    &format!("dual_side_{}", entry_index),
                )
                .map(|position| {
                    position.take_profit_price = tp_price;
                    position.stop_loss_price = sl_price;
                })
        };

        if let Err(err) = open_result {
            warn!("Hedge entry failed: {}", err);
            return;
        }

        self.dual_entry_count += 1;
        self.balance.apply_fee(entry_fee);

        self.record_event(
            candle.timestamp,
            EventKind::DualSideEntry,
            format!(
                "hedge {} #{}: {} @ {:.2}, qty={:.6}, tp={:?}, sl={:?}",
                if entry_index == 1 { "open" } else { "add" },
                entry_index,
                opposite_side,
                filled_price,
                quantity,
                tp_price,
                sl_price
            ),
        );
    }

    /// Recompute hedge TP/SL against the current main state.
    fn refresh_dual_targets(&mut self) {
        if !self.hedge.has_position() {
            return;
        }
        let main = match self.main_state() {
            Some(state) => state,
            None => return,
        };
        let is_last_dca = self.is_last_main_dca(main.dca_count);

        let settings = self.dual_settings.clone();
        if let Some(hedge_position) = self.hedge.position_mut() {
            hedge_position.take_profit_price = dual_side::calculate_dual_side_tp_price(
                hedge_position.entry_price,
                hedge_position.side,
                &settings,
                main.stop_reference,
                Some(main.last_filled_price),
                is_last_dca,
            );
            hedge_position.stop_loss_price = dual_side::calculate_dual_side_sl_price(
                hedge_position.entry_price,
                hedge_position.side,
                &settings,
                &main.tp_prices,
            );
        }
    }

    fn is_last_main_dca(&self, dca_count: u32) -> bool {
        self.dca_settings.limit > 0 && dca_count >= self.dca_settings.limit
    }

    /// Cascade rules when the main position closed during this bar.
    fn handle_dual_after_main_close(
        &mut self,
        exit_reason: ExitReason,
        candle: &Candle,
        exit_price: f64,
        close_dual_position: bool,
    ) {
        if close_dual_position && self.hedge.has_position() {
            let should_close = match exit_reason {
                ExitReason::BreakEven | ExitReason::StopLoss => self.dual_settings.close_on_main_sl,
                ExitReason::Signal => self.dual_settings.trend_close,
                _ => true,
            };

            if should_close {
                self.close_dual_position(exit_price, candle.timestamp, ExitReason::LinkedExit);
            } else {
                debug!(
                    "Keeping hedge open after main close ({})",
                    exit_reason
                );
            }
        }

        // Hedge entries recount per main trade cycle.
        if !self.main.has_position() {
            self.dual_entry_count = 0;
        }
    }

    fn close_dual_position(
        &mut self,
        exit_price: f64,
        timestamp: DateTime<Utc>,
        reason: ExitReason,
    ) {
        if let Some(trade) = self.hedge.close(exit_price, timestamp, reason) {
            self.apply_trade(&trade);
            self.record_event(
                timestamp,
                EventKind::PositionClosed,
                format!(
                    "hedge closed ({}) @ {:.2}, pnl={:.2}",
                    reason, exit_price, trade.pnl
                ),
            );
        }
    }

    /// P&L refresh plus trailing-stop maintenance for the open position.
    fn update_open_position<S: Strategy>(&mut self, candle: &Candle, strategy: &mut S) {
        let (trailing_activated, old_stop, pnl_percent, side, tp2_price, tp3_price) = {
            let position = match self.main.position_mut() {
                Some(position) => position,
                None => return,
            };
            position.update_unrealized_pnl(candle.close);
            (
                position.trailing_stop_activated,
                position.trailing_stop_price,
                position.unrealized_pnl_percent,
                position.side,
                position.tp2_price,
                position.tp3_price,
            )
        };

        if trailing_activated {
            let position = self.main.position_mut().unwrap();
            position.update_trailing_stop(candle.close);
            let new_stop = position.trailing_stop_price;
            if old_stop != new_stop {
                self.record_event(
                    candle.timestamp,
                    EventKind::TrailingStopUpdated,
                    format!(
                        "trailing stop moved {:?} -> {:?} @ {:.2}",
                        old_stop, new_stop, candle.close
                    ),
                );
            }
        } else if strategy.should_activate_trailing_stop(pnl_percent) {
            let offset = strategy.calculate_trailing_offset(side, candle.close, tp2_price, tp3_price);
            if self
                .main
                .activate_trailing_stop_after_tp(candle.close, offset, None)
            {
                self.record_event(
                    candle.timestamp,
                    EventKind::TrailingStopActivated,
                    format!(
                        "trailing stop armed @ {:.2} (pnl {:.2}%)",
                        candle.close, pnl_percent
                    ),
                );
            }
        }
    }

    /// Entry attempt when no main position is open.
    fn try_entry<S: Strategy>(
        &mut self,
        candle: &Candle,
        strategy: &mut S,
    ) -> Result<(), BacktestError> {
        let signal = strategy.generate_signal(candle);

        let side = match signal.side {
            Some(side) => side,
            None => {
                // Missing RSI means the signal could not be evaluated.
                if signal.indicators.rsi.is_none() {
                    self.record_event(
                        candle.timestamp,
                        EventKind::SignalSkipped,
                        signal.reason.clone(),
                    );
                }
                return Ok(());
            }
        };

        self.record_event(
            candle.timestamp,
            EventKind::SignalGenerated,
            format!("{} signal: {}", side, signal.reason),
        );

        let (quantity, leverage) =
            strategy.calculate_position_size(&signal, self.balance.current_balance, candle.close);
        let quantity = OrderSimulator::round_to_precision(quantity, self.symbol_spec.contract_size);

        if let Err(err) = OrderSimulator::validate_order_size(
            quantity,
            self.symbol_spec.minimum_qty(),
            &self.symbol,
        ) {
            self.record_event(
                candle.timestamp,
                EventKind::OrderSkipped,
                format!("entry signal skipped: {}", err),
            );
            return Ok(());
        }

        let (take_profit, stop_loss) = strategy.calculate_tp_sl(side, candle.close, candle);
        let filled_price = self.simulator.simulate_market_fill(side, candle);
        let investment = strategy.entry_investment(self.balance.current_balance);
        let tp_levels = strategy.calculate_tp_levels(side, filled_price, signal.indicators.atr);

        self.main.open(OpenRequest {
            side,
            price: filled_price,
            quantity,
            leverage,
            timestamp: candle.timestamp,
            investment,
            take_profit_price: take_profit,
            stop_loss_price: stop_loss,
            entry_reason: Some(signal.reason.clone()),
            entry_rsi: signal.indicators.rsi,
            entry_atr: signal.indicators.atr,
            is_dual_side: false,
            main_position_side: None,
            dual_side_entry_index: None,
            parent_trade_id: None,
        })?;
        self.dual_entry_count = 0;

        let dca_levels = if self.dca_settings.enabled {
            dca::calculate_dca_levels(
                filled_price,
                filled_price,
                &self.dca_settings,
                side,
                candle.atr,
            )
        } else {
            Vec::new()
        };

        {
            let position = self.main.position_mut().unwrap();
            position.use_tp1 = self.exit_rules.use_tp1;
            position.use_tp2 = self.exit_rules.use_tp2;
            position.use_tp3 = self.exit_rules.use_tp3;
            position.tp1_price = tp_levels.tp1;
            position.tp2_price = tp_levels.tp2;
            position.tp3_price = tp_levels.tp3;
            position.tp1_ratio = self.exit_rules.tp1_ratio;
            position.tp2_ratio = self.exit_rules.tp2_ratio;
            position.tp3_ratio = self.exit_rules.tp3_ratio;
            position.dca_levels = dca_levels;
        }

        self.record_event(
            candle.timestamp,
            EventKind::PositionOpened,
            format!(
                "{} opened @ {:.2}, qty={:.6}, leverage={}x: {}",
                side, filled_price, quantity, leverage, signal.reason
            ),
        );

        // Without partial TP levels the trailing stop may arm right away.
        if strategy.should_activate_trailing_stop(0.0) {
            let offset =
                strategy.calculate_trailing_offset(side, filled_price, tp_levels.tp2, tp_levels.tp3);
            if self
                .main
                .activate_trailing_stop_after_tp(filled_price, offset, None)
            {
                self.record_event(
                    candle.timestamp,
                    EventKind::TrailingStopActivated,
                    format!("trailing stop armed at entry @ {:.2}", filled_price),
                );
            }
        }

        Ok(())
    }

    /// Combined equity snapshot for this bar.
    fn record_snapshot(&mut self, candle: &Candle) {
        if self.main.has_position() && self.hedge.has_position() {
            self.refresh_dual_targets();
        }

        let mut total_unrealized = 0.0;
        let mut position_size = 0.0;
        let mut position_side: Option<ExposureSide> = None;

        if let Some(position) = self.main.position_mut() {
            position.update_unrealized_pnl(candle.close);
            total_unrealized += position.unrealized_pnl;
            position_size += position.current_quantity();
            position_side = Some(match position.side {
                TradeSide::Long => ExposureSide::Long,
                TradeSide::Short => ExposureSide::Short,
            });
        }

        if let Some(position) = self.hedge.position_mut() {
            position.update_unrealized_pnl(candle.close);
            total_unrealized += position.unrealized_pnl;
            position_size += position.current_quantity();
            let hedge_side = match position.side {
                TradeSide::Long => ExposureSide::Long,
                TradeSide::Short => ExposureSide::Short,
            };
            position_side = match position_side {
                Some(main_side) if main_side != hedge_side => Some(ExposureSide::Hedged),
                Some(main_side) => Some(main_side),
                None => Some(hedge_side),
            };
        }

        self.balance.snapshot(
            candle.timestamp,
            position_side,
            position_size,
            total_unrealized,
        );
    }

    fn apply_trade(&mut self, trade: &Trade) {
        self.balance.apply_realized(trade.pnl, trade.total_fees());
    }

    fn record_event(&mut self, timestamp: DateTime<Utc>, kind: EventKind, message: String) {
        if let Some(log) = self.events.as_mut() {
            log.record(timestamp, kind, message);
        }
    }

    /// Combined main + hedge trades, re-sequenced by exit time.
    fn collect_trades(&mut self) -> Vec<Trade> {
        let mut trades = self.main.take_trades();
        trades.extend(self.hedge.take_trades());
        trades.sort_by_key(|t| t.exit_timestamp);

        for (index, trade) in trades.iter_mut().enumerate() {
            trade.trade_number = index as u64 + 1;
        }
        trades
    }
}
