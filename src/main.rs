// =============================================================================
// Meridian — Main Entry Point
// =============================================================================
//
// The engine starts in dry-run mode for safety.  Flip `dry_run` in the
// config file (and restart) once the fleet behaves as expected against
// real balances.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod bot;
mod cache;
mod config;
mod coordinator;
mod engine;
mod evaluator;
mod gate;
mod market;
mod safety;
mod scheduler;
mod signals;
mod store;
mod trade;
mod types;

use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::EngineConfig;
use crate::engine::Engine;
use crate::market::client::ExchangeClient;

const CONFIG_PATH: &str = "engine_config.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Meridian Fleet Engine — Starting Up               ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let mut config = EngineConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        EngineConfig::default()
    });

    // SAFETY: force dry-run on startup; live trading is an explicit opt-in
    // after the process is already up and inspected.
    if !config.dry_run {
        warn!("config requests live trading — starting in dry-run anyway; re-enable at runtime");
        config.dry_run = true;
    }

    info!(
        rate_limit_per_minute = config.rate_limit_per_minute,
        burst = config.burst(),
        fast_tick_ms = config.fast_tick_ms,
        slow_tick_ms = config.slow_tick_ms,
        evaluator_parallelism = config.evaluator_parallelism,
        dry_run = config.dry_run,
        "engine configuration"
    );

    // ── 2. Exchange client ───────────────────────────────────────────────
    let api_key = std::env::var("MERIDIAN_API_KEY").unwrap_or_default();
    let api_secret = std::env::var("MERIDIAN_API_SECRET").unwrap_or_default();
    if api_key.is_empty() {
        warn!("MERIDIAN_API_KEY not set — signed endpoints will fail outside dry-run");
    }
    let client = Arc::new(ExchangeClient::new(api_key, api_secret));

    // ── 3. Engine bootstrap (store, data plane, bots) ────────────────────
    let bind_addr = config.bind_addr.clone();
    let engine = Engine::bootstrap(config, client)
        .await
        .context("engine bootstrap failed")?;

    // ── 4. Control API ───────────────────────────────────────────────────
    let api_engine = engine.clone();
    let api_task = tokio::spawn(async move {
        let app = api::router(api_engine);
        let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
            Ok(l) => l,
            Err(e) => {
                error!(addr = %bind_addr, error = %e, "failed to bind API server");
                return;
            }
        };
        info!(addr = %bind_addr, "API server listening");
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "API server failed");
        }
    });

    // ── 5. Scheduler loops ───────────────────────────────────────────────
    let fast_task = tokio::spawn(scheduler::run_fast_loop(engine.clone()));
    let slow_task = tokio::spawn(scheduler::run_slow_loop(engine.clone()));

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 6. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    warn!("Shutdown signal received — draining ticks and stopping");

    // Stop scheduling new ticks; in-flight per-bot work holds the tick locks
    // and open trades are never cancelled.
    fast_task.abort();
    slow_task.abort();

    // Wait for any in-flight per-bot passes to release their locks.
    for handle in engine.registry.list() {
        let _ = handle.tick_lock.lock().await;
    }

    if let Err(e) = engine.config.read().save(CONFIG_PATH) {
        error!(error = %e, "Failed to save engine config on shutdown");
    }

    api_task.abort();
    info!("Meridian shut down complete.");
    Ok(())
}
