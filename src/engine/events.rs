use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{info, warn};

/// Kind of engine event recorded during a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    SignalGenerated,
    SignalSkipped,
    PositionOpened,
    PositionClosed,
    DcaEntry,
    DualSideEntry,
    StopLossHit,
    TakeProfitHit,
    TrailingStopActivated,
    TrailingStopUpdated,
    TrailingStopHit,
    OrderSkipped,
    Warning,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::SignalGenerated => "signal_generated",
            EventKind::SignalSkipped => "signal_skipped",
            EventKind::PositionOpened => "position_opened",
            EventKind::PositionClosed => "position_closed",
            EventKind::DcaEntry => "dca_entry",
            EventKind::DualSideEntry => "dual_side_entry",
            EventKind::StopLossHit => "stop_loss_hit",
            EventKind::TakeProfitHit => "take_profit_hit",
            EventKind::TrailingStopActivated => "trailing_stop_activated",
            EventKind::TrailingStopUpdated => "trailing_stop_updated",
            EventKind::TrailingStopHit => "trailing_stop_hit",
            EventKind::OrderSkipped => "order_skipped",
            EventKind::Warning => "warning",
        }
    }
}

/// Single recorded engine event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineEvent {
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
    pub message: String,
}

/// Bounded in-memory event log. Oldest events are dropped past the cap;
/// per-kind counts survive trimming.
#[derive(Debug, Clone)]
pub struct EventLog {
    max_events: usize,
    events: Vec<EngineEvent>,
    counts: BTreeMap<EventKind, u64>,
}

impl EventLog {
    pub fn new(max_events: usize) -> Self {
        Self {
            max_events,
            events: Vec::new(),
            counts: BTreeMap::new(),
        }
    }

    pub fn record(&mut self, timestamp: DateTime<Utc>, kind: EventKind, message: impl Into<String>) {
        let message = message.into();

        match kind {
            EventKind::Warning | EventKind::OrderSkipped | EventKind::SignalSkipped => {
                warn!("[{}] {}", kind.as_str(), message)
            }
            _ => info!("[{}] {}", kind.as_str(), message),
        }

        self.events.push(EngineEvent {
            timestamp,
            kind,
            message,
        });
        *self.counts.entry(kind).or_insert(0) += 1;

        if self.events.len() > self.max_events {
            let excess = self.events.len() - self.max_events;
            self.events.drain(0..excess);
        }
    }

    pub fn events(&self) -> &[EngineEvent] {
        &self.events
    }

    /// Per-kind counts, keyed by the wire name.
    pub fn summary(&self) -> BTreeMap<String, u64> {
        self.counts
            .iter()
            .map(|(kind, count)| (kind.as_str().to_string(), *count))
            .collect()
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new(10_000)
    }
}
