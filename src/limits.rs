//! Risk Limits / Kill Switch
//!
//! Evaluates realized daily P&L against configured loss thresholds. Trigger
//! state is a small JSON document per shifted day, persisted on every
//! evaluation while breached and deleted once clear, so any process can
//! recompute the same result from the log + state file after a restart.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::models::KillSwitchResult;

#[derive(Debug, Clone)]
pub struct LimitsConfig {
    pub initial_balance: f64,
    pub limit_pct: f64,
    pub limit_usd: f64,
    pub cooldown_minutes: f64,
    pub enabled: bool,
    pub reset_hour: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct KillSwitchState {
    triggered_at: DateTime<Utc>,
    latest_day_pnl: f64,
    cooldown_minutes: f64,
    reset_hour: u32,
}

pub struct DailyLimits {
    config: LimitsConfig,
    exits_path: PathBuf,
    state_dir: PathBuf,
}

impl DailyLimits {
    pub fn new(config: LimitsConfig, exits_path: PathBuf, state_dir: PathBuf) -> Self {
        Self {
            config,
            exits_path,
            state_dir,
        }
    }

    /// Evaluate the global daily kill switch at `now`.
    ///
    /// Not an exception path: a breach is a state transition the order
    /// placement logic must check before submitting. IO failures fail open.
    pub fn check_daily_kill_switch(&self, now: DateTime<Utc>) -> KillSwitchResult {
        let cfg = &self.config;
        let threshold = loss_threshold(cfg.initial_balance, cfg.limit_pct, cfg.limit_usd);

        if !cfg.enabled {
            let t = threshold.map(|(v, _)| v).unwrap_or(f64::NEG_INFINITY);
            return KillSwitchResult::inactive(cfg.limit_pct, cfg.limit_usd, t, 0.0);
        }

        let day = shifted_date(now, cfg.reset_hour);
        let day_pnl = match self.day_pnl(day) {
            Ok(pnl) => pnl,
            Err(e) => {
                // Fail open: never halt all trading on a log read failure.
                warn!(error = %e, "realized-exit log unreadable; kill switch fails open");
                let t = threshold.map(|(v, _)| v).unwrap_or(f64::NEG_INFINITY);
                return KillSwitchResult::inactive(cfg.limit_pct, cfg.limit_usd, t, 0.0);
            }
        };

        let Some((threshold, label)) = threshold else {
            self.clear_state(day);
            return KillSwitchResult::inactive(
                cfg.limit_pct,
                cfg.limit_usd,
                f64::NEG_INFINITY,
                day_pnl,
            );
        };

        if day_pnl > threshold {
            self.clear_state(day);
            return KillSwitchResult::inactive(cfg.limit_pct, cfg.limit_usd, threshold, day_pnl);
        }

        // Breached: first breach stamps triggered_at, later evaluations reuse it.
        let triggered_at = self
            .load_state(day)
            .map(|state| state.triggered_at)
            .unwrap_or(now);

        let cooldown_remaining_minutes = if cfg.cooldown_minutes > 0.0 {
            let elapsed = (now - triggered_at).num_milliseconds() as f64 / 60_000.0;
            (cfg.cooldown_minutes - elapsed).max(0.0)
        } else {
            0.0
        };
        let recovery_mode = cfg.cooldown_minutes > 0.0 && cooldown_remaining_minutes <= 0.0;
        let active = !recovery_mode;

        if let Err(e) = self.save_state(
            day,
            &KillSwitchState {
                triggered_at,
                latest_day_pnl: day_pnl,
                cooldown_minutes: cfg.cooldown_minutes,
                reset_hour: cfg.reset_hour,
            },
        ) {
            warn!(error = %e, "failed to persist kill-switch state");
        }

        KillSwitchResult {
            active,
            reason: Some(format!(
                "{label}: day_pnl {day_pnl:.2} <= threshold {threshold:.2}"
            )),
            day_pnl,
            limit_pct: cfg.limit_pct,
            limit_usd: cfg.limit_usd,
            threshold,
            triggered_at: Some(triggered_at),
            cooldown_minutes: cfg.cooldown_minutes,
            cooldown_remaining_minutes,
            recovery_mode,
        }
    }

    /// Per-market companion guard: same threshold logic applied independently
    /// per market, returning the blocked set, P&L by market and the threshold
    /// used. Fails open (no blocks) on any read/parse failure.
    pub fn per_market_daily_loss_guard(
        &self,
        limit_pct: f64,
        limit_usd: f64,
        now: DateTime<Utc>,
    ) -> (BTreeSet<String>, BTreeMap<String, f64>, f64) {
        let threshold = match loss_threshold(self.config.initial_balance, limit_pct, limit_usd) {
            Some((value, _)) => value,
            None => return (BTreeSet::new(), BTreeMap::new(), f64::NEG_INFINITY),
        };

        let day = shifted_date(now, self.config.reset_hour);
        let rows = match read_jsonl(&self.exits_path) {
            Ok(rows) => rows,
            Err(e) => {
                warn!(error = %e, "per-market guard fails open: exits log unreadable");
                return (BTreeSet::new(), BTreeMap::new(), threshold);
            }
        };

        let mut pnl_by_market: BTreeMap<String, f64> = BTreeMap::new();
        for row in &rows {
            let Some(ts) = parse_timestamp(row.get("timestamp")) else {
                continue;
            };
            if shifted_date(ts, self.config.reset_hour) != day {
                continue;
            }
            let Some(market_id) = row.get("market_id").and_then(Value::as_str) else {
                continue;
            };
            let pnl = row
                .get("pnl_after_fees")
                .and_then(Value::as_f64)
                .or_else(|| row.get("pnl").and_then(Value::as_f64))
                .unwrap_or(0.0);
            *pnl_by_market.entry(market_id.to_string()).or_insert(0.0) += pnl;
        }

        let blocked: BTreeSet<String> = pnl_by_market
            .iter()
            .filter(|(_, pnl)| **pnl <= threshold)
            .map(|(market, _)| market.clone())
            .collect();
        if !blocked.is_empty() {
            debug!(blocked = blocked.len(), threshold, "per-market guard blocking");
        }
        (blocked, pnl_by_market, threshold)
    }

    fn day_pnl(&self, day: NaiveDate) -> Result<f64> {
        let rows = read_jsonl(&self.exits_path)?;
        let mut total = 0.0;
        for row in &rows {
            let Some(ts) = parse_timestamp(row.get("timestamp")) else {
                continue;
            };
            if shifted_date(ts, self.config.reset_hour) != day {
                continue;
            }
            total += row
                .get("pnl_after_fees")
                .and_then(Value::as_f64)
                .or_else(|| row.get("pnl").and_then(Value::as_f64))
                .unwrap_or(0.0);
        }
        Ok(total)
    }

    fn state_path(&self, day: NaiveDate) -> PathBuf {
        self.state_dir.join(format!("kill_switch_{day}.json"))
    }

    fn load_state(&self, day: NaiveDate) -> Option<KillSwitchState> {
        let text = fs::read_to_string(self.state_path(day)).ok()?;
        serde_json::from_str(&text).ok()
    }

    fn save_state(&self, day: NaiveDate, state: &KillSwitchState) -> Result<()> {
        fs::create_dir_all(&self.state_dir).context("Failed to create state dir")?;
        let text = serde_json::to_string_pretty(state).context("Failed to serialize state")?;
        fs::write(self.state_path(day), text).context("Failed to write kill-switch state")
    }

    fn clear_state(&self, day: NaiveDate) {
        let path = self.state_path(day);
        if path.exists() {
            let _ = fs::remove_file(path);
        }
    }
}

/// The effective loss threshold: the more negative of the enabled caps
/// (`0` disables a cap entirely). `None` when both caps are disabled.
fn loss_threshold(
    initial_balance: f64,
    limit_pct: f64,
    limit_usd: f64,
) -> Option<(f64, &'static str)> {
    let mut candidates: Vec<(f64, &'static str)> = Vec::with_capacity(2);
    if limit_pct > 0.0 && initial_balance > 0.0 {
        candidates.push((-(initial_balance * limit_pct).abs(), "pct_limit"));
    }
    if limit_usd > 0.0 {
        candidates.push((-limit_usd.abs(), "usd_limit"));
    }
    candidates
        .into_iter()
        .min_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal))
}

/// "Daily" shifted by `reset_hour` so the boundary need not be UTC midnight.
fn shifted_date(ts: DateTime<Utc>, reset_hour: u32) -> NaiveDate {
    (ts - Duration::hours(reset_hour as i64)).date_naive()
}

fn parse_timestamp(value: Option<&Value>) -> Option<DateTime<Utc>> {
    match value? {
        Value::Number(n) => {
            let secs = n.as_f64()?;
            Utc.timestamp_millis_opt((secs * 1000.0) as i64).single()
        }
        Value::String(s) => {
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Some(dt.with_timezone(&Utc));
            }
            let secs = s.trim().parse::<f64>().ok()?;
            Utc.timestamp_millis_opt((secs * 1000.0) as i64).single()
        }
        _ => None,
    }
}

fn read_jsonl(path: &Path) -> Result<Vec<Value>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let text =
        fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let mut rows = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        rows.push(serde_json::from_str(line).context("Malformed exits line")?);
    }
    Ok(rows)
}
