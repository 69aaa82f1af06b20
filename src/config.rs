//! Runtime configuration
//!
//! Everything is environment-driven (with `.env` support) so the same binary
//! can run live, degraded, or fully offline without a rebuild.

use std::env;
use std::path::PathBuf;

fn env_str(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_opt(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_bool(name: &str, default: bool) -> bool {
    env::var(name)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "yes" | "on" | "ON"))
        .unwrap_or(default)
}

fn env_f64(name: &str, default: f64) -> f64 {
    env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<f64>().ok())
        .unwrap_or(default)
}

fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_usize(name: &str, default: usize) -> usize {
    env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(default)
}

/// API credentials for the private order channels.
#[derive(Debug, Clone, Default)]
pub struct ApiCredentials {
    pub api_key: Option<String>,
    pub api_secret: Option<String>,
    pub api_passphrase: Option<String>,
}

impl ApiCredentials {
    pub fn is_complete(&self) -> bool {
        self.api_key.is_some() && self.api_secret.is_some() && self.api_passphrase.is_some()
    }
}

/// Application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Use bundled fixture markets instead of live providers.
    pub offline_mode: bool,
    /// Directory for append-only logs and persisted kill-switch state.
    pub data_dir: PathBuf,

    // Market data
    pub clob_rest_url: String,
    pub fetch_limit: usize,
    pub cache_ttl_secs: u64,
    /// WS idle beyond this marks the last fetch as a stale_ws fallback.
    pub ws_stale_secs: f64,
    pub risk_mid_threshold: f64,
    pub risk_high_threshold: f64,

    // Order lifecycle channels
    pub order_ws_enabled: bool,
    pub order_ws_url: String,
    pub order_ws_cooldown_secs: u64,
    pub ws_asset_limit: usize,
    pub order_poll_enabled: bool,
    pub order_poll_secs: u64,
    pub order_poll_limit: usize,
    pub credentials: ApiCredentials,

    // Trading / sizing
    pub initial_balance: f64,
    pub max_single_position: f64,
    pub min_position_size: f64,
    pub signal_floor: f64,
    pub max_order_balance_ratio: f64,

    // Daily loss limits
    pub daily_loss_enabled: bool,
    pub daily_loss_limit_pct: f64,
    pub daily_loss_limit_usd: f64,
    pub daily_loss_cooldown_minutes: f64,
    pub daily_loss_reset_hour: u32,
    pub per_market_loss_enabled: bool,
    pub per_market_loss_limit_pct: f64,
    pub per_market_loss_limit_usd: f64,

    pub loop_interval_secs: u64,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let risk_mid_threshold = env_f64("RISK_MID_THRESHOLD", 0.4).clamp(0.0, 1.0);
        let risk_high_threshold = env_f64("RISK_HIGH_THRESHOLD", 0.7).clamp(0.0, 1.0);
        // mid must never exceed high; a miswired env should not invert the bands
        let risk_high_threshold = risk_high_threshold.max(risk_mid_threshold);

        Ok(Self {
            offline_mode: env_bool("OFFLINE_MODE", false),
            data_dir: PathBuf::from(env_str("DATA_DIR", "./data")),

            clob_rest_url: env_str("CLOB_REST_URL", "https://clob.polymarket.com"),
            fetch_limit: env_usize("MARKET_FETCH_LIMIT", 50),
            cache_ttl_secs: env_u64("MARKET_CACHE_TTL_SECONDS", 30),
            ws_stale_secs: env_f64("WS_STALE_SECONDS", 120.0),
            risk_mid_threshold,
            risk_high_threshold,

            order_ws_enabled: env_bool("ORDER_WS_ENABLED", true),
            order_ws_url: env_str(
                "ORDER_WS_URL",
                "wss://ws-subscriptions-clob.polymarket.com/ws/user",
            ),
            order_ws_cooldown_secs: env_u64("ORDER_WS_COOLDOWN_SECONDS", 30),
            ws_asset_limit: env_usize("ORDER_WS_ASSET_LIMIT", 20),
            order_poll_enabled: env_bool("ORDER_REST_FALLBACK_ENABLED", false),
            order_poll_secs: env_u64("ORDER_REST_POLL_SECONDS", 15),
            order_poll_limit: env_usize("ORDER_REST_POLL_LIMIT", 100),
            credentials: ApiCredentials {
                api_key: env_opt("POLY_API_KEY"),
                api_secret: env_opt("POLY_API_SECRET"),
                api_passphrase: env_opt("POLY_API_PASSPHRASE"),
            },

            initial_balance: env_f64("INITIAL_BALANCE", 10_000.0),
            max_single_position: env_f64("MAX_SINGLE_POSITION", 0.05),
            min_position_size: env_f64("MIN_POSITION_SIZE", 100.0),
            signal_floor: env_f64("STRATEGY_SIGNAL_FLOOR", 0.12),
            max_order_balance_ratio: env_f64("MAX_ORDER_BALANCE_RATIO", 0.10),

            daily_loss_enabled: env_bool("DAILY_LOSS_ENABLED", true),
            daily_loss_limit_pct: env_f64("DAILY_LOSS_LIMIT_PCT", 0.02),
            daily_loss_limit_usd: env_f64("DAILY_LOSS_LIMIT_USD", 0.0),
            daily_loss_cooldown_minutes: env_f64("DAILY_LOSS_COOLDOWN_MINUTES", 0.0),
            daily_loss_reset_hour: env_u64("DAILY_LOSS_RESET_HOUR", 0) as u32 % 24,
            per_market_loss_enabled: env_bool("PER_MARKET_LOSS_ENABLED", false),
            per_market_loss_limit_pct: env_f64("PER_MARKET_LOSS_LIMIT_PCT", 0.0),
            per_market_loss_limit_usd: env_f64("PER_MARKET_LOSS_LIMIT_USD", 0.0),

            loop_interval_secs: env_u64("LOOP_INTERVAL_SECONDS", 60),
        })
    }
}
