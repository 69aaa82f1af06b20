//! Order lifecycle tracking across two independent channels.
//!
//! The WS streamer is the primary channel; the REST poller is the fallback.
//! Both append to the same line-delimited logs and each owns a private
//! fill-delta ledger, so they can run concurrently without a shared lock.

pub mod poller;
pub mod store;
pub mod streamer;

use std::collections::HashMap;

use serde_json::Value;

use crate::models::OrderEventKind;
use crate::providers::extract;

pub use poller::OrderRestPoller;
pub use store::OrderStore;
pub use streamer::{ChannelState, OrderLifecycleStreamer};

const FILL_EPSILON: f64 = 1e-9;

/// Last-seen order state for one channel's dedup ledger.
#[derive(Debug, Clone, Default)]
pub struct SeenOrder {
    pub status: String,
    pub filled: f64,
    pub size: Option<f64>,
}

/// Per-channel map of last-known fill state keyed by order id.
///
/// `advance` returns the strictly positive fill delta, if any, and moves the
/// ledger to `max(previous, observed)` so a late or repeated snapshot of the
/// same fill state never emits a second trade and never regresses.
#[derive(Debug, Default)]
pub struct FillLedger {
    seen: HashMap<String, SeenOrder>,
}

impl FillLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn previous(&self, order_id: &str) -> Option<&SeenOrder> {
        self.seen.get(order_id)
    }

    pub fn advance(
        &mut self,
        order_id: &str,
        status: &str,
        filled: Option<f64>,
        size: Option<f64>,
    ) -> Option<f64> {
        let prev_filled = self
            .seen
            .get(order_id)
            .map(|seen| seen.filled)
            .unwrap_or(0.0);
        let observed = filled.unwrap_or(prev_filled).max(0.0);
        let delta = observed - prev_filled;

        let entry = self.seen.entry(order_id.to_string()).or_default();
        entry.status = status.to_string();
        entry.filled = prev_filled.max(observed);
        if size.is_some() {
            entry.size = size;
        }

        (delta > FILL_EPSILON).then_some(delta)
    }
}

/// Classify a raw order payload: explicit event/type field first, else
/// inferred from filled vs requested size, else "update".
pub fn classify_event(row: &Value, filled: Option<f64>, size: Option<f64>) -> OrderEventKind {
    if let Some(label) = extract::first_str(row, extract::EVENT_KEYS)
        .or_else(|| extract::first_str(row, extract::STATUS_KEYS))
    {
        match label.to_ascii_lowercase().as_str() {
            "open" | "submitted" | "pending" | "placement" | "submit" => {
                return OrderEventKind::Submit
            }
            "partial" | "partially_filled" => return OrderEventKind::Partial,
            "filled" | "closed" | "matched" | "trade" | "fill" => return OrderEventKind::Filled,
            "cancel" | "cancelled" | "canceled" | "cancellation" => return OrderEventKind::Cancel,
            "reject" | "rejected" => return OrderEventKind::Reject,
            "update" => return OrderEventKind::Update,
            _ => {}
        }
    }
    match (filled, size) {
        (Some(filled), Some(size)) if filled > 0.0 && filled < size => OrderEventKind::Partial,
        (Some(filled), Some(size)) if size > 0.0 && filled >= size => OrderEventKind::Filled,
        _ => OrderEventKind::Update,
    }
}
