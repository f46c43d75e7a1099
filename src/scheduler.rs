// =============================================================================
// Scheduler — periodic ticks driving the whole evaluation pipeline
// =============================================================================
//
// Fast tick: enumerate running bots, assemble the union of every key they
// need, resolve it with ONE coordinator batch, then fan the shared snapshot
// out to per-bot evaluation workers (bounded parallelism, per-bot tick
// locks).  This is what turns O(bots x signals) upstream calls into
// O(unique keys).
//
// Slow tick: proactively warm the long-TTL keys (accounts, candles) at
// BACKGROUND priority and prune old decision history.
//
// Every tick carries a deadline (80% of the tick period).  Keys that miss it
// resolve to StaleData: the affected bots record the fault, skip, and mutate
// nothing.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::bot::BotHandle;
use crate::config::EngineConfig;
use crate::coordinator::{DataError, DataOutcome};
use crate::engine::Engine;
use crate::evaluator::{self, DecisionRecord};
use crate::gate::Priority;
use crate::market::types::{DataKey, MarketPayload, MarketSnapshot, PairData};
use crate::safety::{self, SafetyContext};
use crate::trade::{self, TradeIntent};
use crate::types::BotStatus;

/// Candle granularity the evaluation path works on.
const CANDLE_GRANULARITY_SEC: u32 = 300;

/// What one fast tick did, for logging and tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct TickSummary {
    pub bots: usize,
    pub evaluated: usize,
    pub faulted: usize,
    pub promoted: usize,
    pub trades: usize,
    pub rejected: usize,
}

enum BotOutcome {
    Evaluated {
        promoted: bool,
        traded: bool,
        rejected: bool,
    },
    Faulted,
    Skipped,
}

// ---------------------------------------------------------------------------
// Key planning
// ---------------------------------------------------------------------------

/// Union of keys needed by `bots` this tick: one ticker and one candle key
/// per distinct pair (candle limit = the largest any bot on that pair needs)
/// plus the shared accounts view.
pub fn needed_keys(bots: &[Arc<BotHandle>]) -> Vec<DataKey> {
    let mut candle_limits: HashMap<String, u32> = HashMap::new();
    for handle in bots {
        let bot = handle.bot.read();
        let limit = bot.signal_config.candle_limit();
        candle_limits
            .entry(bot.pair.clone())
            .and_modify(|l| *l = (*l).max(limit))
            .or_insert(limit);
    }

    let mut keys = Vec::with_capacity(candle_limits.len() * 2 + 1);
    for (pair, limit) in &candle_limits {
        keys.push(DataKey::Ticker { pair: pair.clone() });
        keys.push(DataKey::Candles {
            pair: pair.clone(),
            granularity_sec: CANDLE_GRANULARITY_SEC,
            limit: *limit,
        });
    }
    keys.push(DataKey::Accounts);
    keys
}

/// Fold batch results into the per-tick snapshot, collecting per-key faults.
fn build_snapshot(
    results: HashMap<DataKey, Result<DataOutcome, DataError>>,
) -> (MarketSnapshot, HashMap<String, String>) {
    let mut snapshot = MarketSnapshot::new(Utc::now());
    let mut faults: HashMap<String, String> = HashMap::new();

    for (key, result) in results {
        match result {
            Ok(outcome) => {
                let payload = outcome.into_payload();
                match (key, payload) {
                    (DataKey::Ticker { pair }, MarketPayload::Ticker(ticker)) => {
                        snapshot.pairs.entry(pair).or_insert_with(PairData::default).ticker =
                            Some(ticker);
                    }
                    (DataKey::Candles { pair, .. }, MarketPayload::Candles(series)) => {
                        snapshot
                            .pairs
                            .entry(pair)
                            .or_insert_with(PairData::default)
                            .candles = Some(series);
                    }
                    (DataKey::Accounts, MarketPayload::Accounts(accounts)) => {
                        snapshot.accounts = accounts;
                    }
                    (key, _) => {
                        warn!(key = %key, "payload kind mismatch — dropping");
                    }
                }
            }
            Err(err) => {
                let fault = match err {
                    DataError::StaleData => "stale_data".to_string(),
                    DataError::Degraded(m) => format!("degraded_data: {m}"),
                    DataError::Fatal(m) => format!("fatal: {m}"),
                };
                if let Some(pair) = key.pair() {
                    faults.insert(pair.to_string(), fault);
                } else {
                    debug!(key = %key, fault = %fault, "non-pair key unavailable this tick");
                }
            }
        }
    }

    (snapshot, faults)
}

// ---------------------------------------------------------------------------
// Fast tick
// ---------------------------------------------------------------------------

/// One full evaluation sweep over all running bots.
pub async fn run_fast_tick(engine: &Arc<Engine>) -> TickSummary {
    let bots = engine.registry.running();
    let mut summary = TickSummary {
        bots: bots.len(),
        ..TickSummary::default()
    };
    if bots.is_empty() {
        return summary;
    }

    let config = engine.config.read().clone();
    let deadline = Instant::now() + Duration::from_millis(config.fast_tick_ms * 4 / 5);

    // One coordinated fetch for the whole fleet.
    let keys = needed_keys(&bots);
    let results = engine
        .coordinator
        .batch(keys, Priority::BotEvaluation, deadline)
        .await;

    let (snapshot, faults) = build_snapshot(results);
    let snapshot = Arc::new(snapshot);
    let faults = Arc::new(faults);

    // Fan out under bounded parallelism.
    let semaphore = Arc::new(Semaphore::new(config.evaluator_parallelism.max(1)));
    let mut workers = Vec::with_capacity(bots.len());

    for handle in bots {
        let engine = engine.clone();
        let snapshot = snapshot.clone();
        let faults = faults.clone();
        let config = config.clone();
        let semaphore = semaphore.clone();

        workers.push(tokio::spawn(async move {
            let _permit = semaphore.acquire().await.expect("semaphore never closed");
            tick_bot(&engine, &handle, &snapshot, &faults, &config).await
        }));
    }

    for worker in workers {
        match worker.await {
            Ok(BotOutcome::Evaluated {
                promoted,
                traded,
                rejected,
            }) => {
                summary.evaluated += 1;
                if promoted {
                    summary.promoted += 1;
                }
                if traded {
                    summary.trades += 1;
                }
                if rejected {
                    summary.rejected += 1;
                }
            }
            Ok(BotOutcome::Faulted) => summary.faulted += 1,
            Ok(BotOutcome::Skipped) => {}
            Err(err) => {
                error!(error = %err, "evaluator worker panicked");
                engine.push_error(format!("evaluator worker panicked: {err}"));
            }
        }
    }

    debug!(
        bots = summary.bots,
        evaluated = summary.evaluated,
        faulted = summary.faulted,
        promoted = summary.promoted,
        trades = summary.trades,
        rejected = summary.rejected,
        "fast tick complete"
    );

    summary
}

/// Evaluate one bot end-to-end against the shared snapshot.
async fn tick_bot(
    engine: &Arc<Engine>,
    handle: &Arc<BotHandle>,
    snapshot: &Arc<MarketSnapshot>,
    faults: &Arc<HashMap<String, String>>,
    config: &EngineConfig,
) -> BotOutcome {
    // Two ticks for the same bot never overlap.
    let _tick = handle.tick_lock.lock().await;

    let mut bot = handle.bot.read().clone();
    if bot.status != BotStatus::Running {
        return BotOutcome::Skipped;
    }

    // Invariant check before acting on configuration.
    if let Err(reason) = bot.validate() {
        error!(
            bot_id = %bot.id,
            name = %bot.name,
            pair = %bot.pair,
            reason = %reason,
            "invariant violation — halting bot"
        );
        engine.registry.halt_bot(bot.id, &reason);
        engine.push_error(format!("bot {} halted: {reason}", bot.name));
        bot.status = BotStatus::Stopped;
        if let Err(err) = engine.store.upsert_bot(&bot).await {
            error!(bot_id = %bot.id, error = %err, "failed to persist halted bot");
        }
        return BotOutcome::Skipped;
    }

    // Missing or stale data: record the fault, mutate nothing.
    let Some(pair_data) = snapshot.pair(&bot.pair).filter(|d| d.candles.is_some()) else {
        let fault = faults
            .get(&bot.pair)
            .cloned()
            .unwrap_or_else(|| "stale_data".to_string());
        let record = DecisionRecord::faulted(&bot, fault, snapshot.taken_at);
        finish_decision(engine, record).await;
        return BotOutcome::Faulted;
    };

    // --- Pure evaluation -----------------------------------------------------
    let evaluation = evaluator::evaluate(&bot.signal_config, pair_data);
    bot.current_combined_score = evaluation.composite.unwrap_or(0.0);
    bot.temperature = evaluation.temperature;

    let promoted = evaluator::apply_confirmation(&mut bot, evaluation.candidate, Utc::now());
    let mut record =
        DecisionRecord::from_evaluation(&bot, &evaluation, promoted.is_some(), snapshot.taken_at);

    let mut traded = false;
    let mut rejected = false;

    // --- Safety gate and execution -------------------------------------------
    if let Some(action) = promoted {
        let side = action
            .side()
            .expect("promoted action is never hold");

        let price = pair_data
            .ticker
            .as_ref()
            .map(|t| t.price)
            .or_else(|| pair_data.candles.as_ref().and_then(|c| c.last_close()))
            .unwrap_or(0.0);

        if price <= 0.0 {
            record.fault = Some("no_price".to_string());
        } else {
            // Dry-run has no real account to check against.
            let (quote_balance, base_balance) = if config.dry_run {
                (f64::INFINITY, f64::INFINITY)
            } else {
                (
                    snapshot.available_balance(bot.quote_currency()),
                    snapshot.available_balance(bot.base_currency()),
                )
            };

            let intended_size_usd = trade::buy_size_usd(&bot, evaluation.temperature, config);
            let intended_base_qty =
                trade::select_tranche_to_close(&bot.tranches, config.tranche_close_order)
                    .map(|t| t.base_quantity())
                    .unwrap_or(0.0);

            let ctx = SafetyContext {
                config,
                now: Utc::now(),
                current_price: price,
                intended_size_usd,
                intended_base_qty,
                quote_balance,
                base_balance,
                active_positions: engine.registry.active_position_count(),
                daily: engine.ledger.stats(),
            };

            match safety::check(&bot, side, evaluation.temperature, &ctx) {
                Err(reason) => {
                    safety::log_rejection(&bot, side, &reason);
                    record.reject_reason = Some(reason.to_string());
                    rejected = true;
                }
                Ok(()) => {
                    let intent = TradeIntent {
                        side,
                        price,
                        composite: evaluation.composite,
                        temperature: evaluation.temperature,
                    };
                    match engine.trade_service.execute(&mut bot, &intent, config).await {
                        Ok(executed) => {
                            record.trade_id = Some(executed.id);
                            traded = true;
                        }
                        Err(err) => {
                            warn!(bot_id = %bot.id, error = %err, "trade execution failed");
                            record.fault = Some(format!("trade_failed: {err}"));
                            engine.push_error(format!(
                                "trade failed for {}: {err}",
                                bot.name
                            ));
                        }
                    }
                }
            }
        }
    }

    // --- Write back and persist ----------------------------------------------
    *handle.bot.write() = bot.clone();
    if let Err(err) = engine.store.upsert_bot(&bot).await {
        // Persistent-store failures stop the bot.
        error!(bot_id = %bot.id, error = %err, "store failure — halting bot");
        engine.registry.halt_bot(bot.id, &format!("store failure: {err}"));
        engine.push_error(format!("store failure for {}: {err}", bot.name));
    }

    finish_decision(engine, record).await;

    BotOutcome::Evaluated {
        promoted: promoted.is_some(),
        traded,
        rejected,
    }
}

/// Push a decision to the ring buffer and the append-only history.
async fn finish_decision(engine: &Arc<Engine>, record: DecisionRecord) {
    engine.push_decision(record.clone());
    if let Err(err) = engine.store.append_decision(&record).await {
        warn!(bot_id = %record.bot_id, error = %err, "failed to persist decision");
    }
}

// ---------------------------------------------------------------------------
// Slow tick
// ---------------------------------------------------------------------------

/// Warm the long-TTL keys and prune history.
pub async fn run_slow_tick(engine: &Arc<Engine>) {
    let config = engine.config.read().clone();
    let bots = engine.registry.running();

    if !bots.is_empty() {
        let deadline = Instant::now() + Duration::from_millis(config.slow_tick_ms * 4 / 5);
        let keys = needed_keys(&bots);
        let results = engine
            .coordinator
            .batch(keys, Priority::Background, deadline)
            .await;
        let warmed = results.values().filter(|r| r.is_ok()).count();
        debug!(warmed, total = results.len(), "slow tick cache warm complete");
    }

    match engine
        .store
        .prune_decisions(config.decision_retention_days)
        .await
    {
        Ok(pruned) if pruned > 0 => info!(pruned, "decision history pruned"),
        Ok(_) => {}
        Err(err) => warn!(error = %err, "decision pruning failed"),
    }
}

// ---------------------------------------------------------------------------
// Loops
// ---------------------------------------------------------------------------

/// Fast-tick loop; runs until the task is aborted at shutdown.
pub async fn run_fast_loop(engine: Arc<Engine>) {
    info!("fast tick loop starting");
    loop {
        let period = Duration::from_millis(engine.config.read().fast_tick_ms.max(250));
        tokio::time::sleep(period).await;
        run_fast_tick(&engine).await;
    }
}

/// Slow-tick loop; runs until the task is aborted at shutdown.
pub async fn run_slow_loop(engine: Arc<Engine>) {
    info!("slow tick loop starting");
    loop {
        let period = Duration::from_millis(engine.config.read().slow_tick_ms.max(1_000));
        tokio::time::sleep(period).await;
        run_slow_tick(&engine).await;
    }
}
