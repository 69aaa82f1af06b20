//! Candidate-key extraction for duck-typed provider payloads.
//!
//! Upstream shapes drift between deployments (camelCase vs snake_case, `id`
//! vs `order_id`, numbers as strings). Each logical field has an ordered
//! candidate list; adding support for a new provider shape means extending a
//! table, not adding branches.

use serde_json::Value;

pub const MARKET_ID_KEYS: &[&str] = &["market_id", "condition_id", "id", "market"];
pub const ORDER_ID_KEYS: &[&str] = &["id", "order_id", "orderID", "order_hash"];
pub const ORDER_MARKET_KEYS: &[&str] = &["market_id", "market", "condition_id", "asset_id"];
pub const STATUS_KEYS: &[&str] = &["status", "state"];
pub const EVENT_KEYS: &[&str] = &["event", "event_type", "type"];
pub const SIDE_KEYS: &[&str] = &["side", "action"];
pub const SIZE_KEYS: &[&str] = &["size", "original_size", "quantity"];
pub const FILLED_KEYS: &[&str] = &["filled_size", "filled", "size_matched", "executed_quantity"];
pub const PRICE_KEYS: &[&str] = &["price", "avg_price", "average_price"];
pub const TIMESTAMP_KEYS: &[&str] = &["timestamp", "ts", "time"];

pub const BID_KEYS: &[&str] = &["bid", "best_bid", "bestBid"];
pub const ASK_KEYS: &[&str] = &["ask", "best_ask", "bestAsk"];
pub const YES_PRICE_KEYS: &[&str] = &["yes_price", "last_trade_price", "lastPrice", "price"];
pub const VOLATILITY_KEYS: &[&str] = &["volatility", "vol"];

pub const ORDER_LIST_KEYS: &[&str] = &["data", "orders"];
pub const CURSOR_KEYS: &[&str] = &["next_cursor", "nextCursor", "cursor"];

/// First present (non-null) value among the candidate keys.
pub fn first_value<'a>(row: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    let obj = row.as_object()?;
    keys.iter()
        .find_map(|k| obj.get(*k))
        .filter(|v| !v.is_null())
}

/// First candidate key present as a non-empty string.
pub fn first_str(row: &Value, keys: &[&str]) -> Option<String> {
    for key in keys {
        match row.get(*key) {
            Some(Value::String(s)) if !s.trim().is_empty() => return Some(s.trim().to_string()),
            Some(Value::Number(n)) => return Some(n.to_string()),
            _ => {}
        }
    }
    None
}

/// First candidate key coercible to a finite f64 (numbers or numeric strings).
pub fn first_f64(row: &Value, keys: &[&str]) -> Option<f64> {
    for key in keys {
        if let Some(v) = row.get(*key) {
            if let Some(f) = as_f64(v) {
                return Some(f);
            }
        }
    }
    None
}

/// Coerce a JSON value to a finite f64.
pub fn as_f64(value: &Value) -> Option<f64> {
    let f = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    f.is_finite().then_some(f)
}

/// Locate a list payload: a bare array, or the first candidate key holding one.
pub fn extract_list<'a>(payload: &'a Value, keys: &[&str]) -> Option<&'a Vec<Value>> {
    if let Value::Array(items) = payload {
        return Some(items);
    }
    keys.iter().find_map(|k| payload.get(*k)?.as_array())
}
