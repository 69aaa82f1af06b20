//! polypulse - Resilient market-data & order-lifecycle runtime
//!
//! `run` drives the live decision loop: snapshots → strategy → risk →
//! kill-switch gating, with the WS streamer and REST poller recording what
//! actually happened. `simulate` runs the same pipeline offline and writes an
//! aggregate performance report.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio::time::interval;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use polypulse::config::Config;
use polypulse::limits::{DailyLimits, LimitsConfig};
use polypulse::market_data::{FreshnessTracker, MarketDataService, RiskThresholds};
use polypulse::orders::{OrderLifecycleStreamer, OrderRestPoller, OrderStore};
use polypulse::providers::{
    ClobOrdersClient, ClobRestProvider, ClobUserStream, FixtureProvider, MarketDataProvider,
};
use polypulse::risk::{Portfolio, RiskEngine};
use polypulse::sim::{build_report, run_simulation, write_report};
use polypulse::strategy::StrategyEngine;

#[derive(Parser)]
#[command(name = "polypulse", about = "Market-data and order-lifecycle runtime")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the live decision loop with both order channels.
    Run,
    /// Run one offline simulation cycle and write the report.
    Simulate {
        /// Output path for the report JSON document.
        #[arg(long, default_value = "data/simulation_report.json")]
        output: PathBuf,
    },
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "polypulse=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    match cli.command {
        Command::Run => run_loop(config).await,
        Command::Simulate { output } => simulate(config, &output).await,
    }
}

fn market_provider(config: &Config) -> Result<Arc<dyn MarketDataProvider>> {
    if config.offline_mode {
        info!("OFFLINE_MODE enabled; using fixture markets");
        Ok(Arc::new(FixtureProvider::with_jitter(0.01)))
    } else {
        Ok(Arc::new(ClobRestProvider::new(&config.clob_rest_url)?))
    }
}

fn build_service(config: &Config, freshness: FreshnessTracker) -> Result<MarketDataService> {
    Ok(MarketDataService::new(
        market_provider(config)?,
        freshness,
        RiskThresholds::new(config.risk_mid_threshold, config.risk_high_threshold),
        config.fetch_limit,
        Duration::from_secs(config.cache_ttl_secs),
        config.ws_stale_secs,
        config.offline_mode,
    ))
}

fn build_limits(config: &Config, store: &OrderStore) -> DailyLimits {
    DailyLimits::new(
        LimitsConfig {
            initial_balance: config.initial_balance,
            limit_pct: config.daily_loss_limit_pct,
            limit_usd: config.daily_loss_limit_usd,
            cooldown_minutes: config.daily_loss_cooldown_minutes,
            enabled: config.daily_loss_enabled,
            reset_hour: config.daily_loss_reset_hour,
        },
        store.realized_path().to_path_buf(),
        config.data_dir.join("state"),
    )
}

async fn run_loop(config: Config) -> Result<()> {
    info!("polypulse runtime starting");

    let store = OrderStore::new(&config.data_dir)?;
    let freshness = FreshnessTracker::new();
    let service = build_service(&config, freshness.clone())?;
    let limits = build_limits(&config, &store);

    let streamer = OrderLifecycleStreamer::new(
        Arc::new(ClobUserStream::new(
            &config.order_ws_url,
            config.credentials.clone(),
        )),
        store.clone(),
        freshness,
        config.order_ws_enabled && !config.offline_mode,
        config.credentials.is_complete(),
        Duration::from_secs(config.order_ws_cooldown_secs),
        config.ws_asset_limit,
    );
    let poller = OrderRestPoller::new(
        Arc::new(ClobOrdersClient::new(
            &config.clob_rest_url,
            config.credentials.clone(),
        )?),
        store.clone(),
        config.order_poll_enabled && !config.offline_mode,
        config.credentials.is_complete(),
        Duration::from_secs(config.order_poll_secs),
        config.order_poll_limit,
    );

    let engine = StrategyEngine::with_default_strategies(
        config.signal_floor,
        config.initial_balance,
        config.max_single_position,
        config.min_position_size,
    );
    let risk = RiskEngine::new(config.max_order_balance_ratio);
    let portfolio = Portfolio {
        balance: config.initial_balance,
        returns: Vec::new(),
    };

    let mut ticker = interval(Duration::from_secs(config.loop_interval_secs.max(1)));
    let mut started_channels = false;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested");
                break;
            }
            _ = ticker.tick() => {}
        }

        let snapshots = match service.get_snapshots(false).await {
            Ok(snapshots) => snapshots,
            Err(e) => {
                warn!(error = %e, "market fetch failed; retrying next cycle");
                continue;
            }
        };
        let market_ids: Vec<String> = snapshots.iter().map(|s| s.market_id.clone()).collect();

        if !started_channels {
            streamer.start(&market_ids).await?;
            poller.start(&market_ids).await?;
            started_channels = true;
        } else {
            streamer.update_markets(&market_ids).await?;
            poller.update_markets(&market_ids).await?;
        }

        let now = chrono::Utc::now();
        let kill_switch = limits.check_daily_kill_switch(now);
        if kill_switch.active {
            warn!(
                day_pnl = kill_switch.day_pnl,
                reason = kill_switch.reason.as_deref().unwrap_or(""),
                "kill switch active; skipping order generation"
            );
            continue;
        }
        if kill_switch.recovery_mode {
            info!(day_pnl = kill_switch.day_pnl, "kill switch in recovery mode");
        }
        let (blocked_markets, _, _) = limits.per_market_daily_loss_guard(
            config.per_market_loss_limit_pct,
            config.per_market_loss_limit_usd,
            now,
        );

        let meta = service.cache_metadata();
        if meta.fallback {
            info!(reason = meta.reason.as_deref().unwrap_or(""), "ingestion degraded");
        }

        for snapshot in &snapshots {
            if blocked_markets.contains(&snapshot.market_id) {
                continue;
            }
            let mut order = engine.generate_order(snapshot);
            if order.is_hold() {
                continue;
            }
            let approved = risk.validate_order(&mut order, &portfolio);
            if approved {
                // Live submission is an external concern; the decision itself
                // is the output of this loop.
                info!(
                    market_id = order.market_id.as_str(),
                    action = order.action.as_str(),
                    size = order.size,
                    "order approved"
                );
            } else {
                let rejections = order
                    .metadata
                    .risk
                    .as_ref()
                    .map(|r| r.rejections.join(","))
                    .unwrap_or_default();
                info!(
                    market_id = order.market_id.as_str(),
                    rejections = rejections.as_str(),
                    "order rejected"
                );
            }
        }

        info!(
            streamer = %streamer.get_status(),
            poller = %poller.get_status(),
            "channel status"
        );
    }

    streamer.stop().await;
    poller.stop().await;
    info!("polypulse runtime stopped");
    Ok(())
}

async fn simulate(mut config: Config, output: &PathBuf) -> Result<()> {
    config.offline_mode = true;
    let store = OrderStore::new(&config.data_dir)?;
    let service = build_service(&config, FreshnessTracker::new())?;
    let engine = StrategyEngine::with_default_strategies(
        config.signal_floor,
        config.initial_balance,
        config.max_single_position,
        config.min_position_size,
    );
    let risk = RiskEngine::new(config.max_order_balance_ratio);
    let portfolio = Portfolio {
        balance: config.initial_balance,
        returns: Vec::new(),
    };

    let trades = run_simulation(&service, &engine, &risk, &portfolio, Some(&store)).await?;
    let report = build_report(&trades, config.initial_balance);
    write_report(&report, output)?;

    let limits = build_limits(&config, &store);
    let kill_switch = limits.check_daily_kill_switch(chrono::Utc::now());
    info!(
        trades = trades.len(),
        day_pnl = kill_switch.day_pnl,
        kill_switch_active = kill_switch.active,
        "simulation complete"
    );
    Ok(())
}
