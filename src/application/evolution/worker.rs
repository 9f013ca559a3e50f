//! Evolution worker: the periodic score / mutate / promote / discard cycle.
//!
//! Each cycle refreshes stale backtests for active strategies, applies the
//! promotion thresholds, discards chronic underperformers, and spawns
//! mutations from freshly promoted parents. Work on one strategy is
//! guarded by a named in-process lock so overlapping cycles never write
//! the same row concurrently (deployments with multiple processes put a
//! distributed lock in front of the cycle instead).
//!
//! A strategy never moves backward from `proposable` to `experiment`
//! within a cycle; the only exits from `proposable` are `discarded` or
//! deactivation.

use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::application::strategy_engine::backtest::BacktestEngine;
use crate::application::strategy_engine::mutation::MutationEngine;
use crate::application::strategy_engine::scoring::score_strategy;
use crate::domain::market::types::CandleRequest;
use crate::domain::repositories::{
    BacktestRepository, LineageRepository, StrategyRepository,
};
use crate::domain::strategy::ruleset::Ruleset;
use crate::domain::strategy::types::{StrategyRecord, StrategyStatus};
use crate::infrastructure::market_data::ProviderRouter;
use crate::infrastructure::observability::Metrics;

/// Promotion and discard thresholds.
#[derive(Debug, Clone)]
pub struct EvolutionThresholds {
    /// Trades required before a backtest is trusted at all.
    pub min_trades: u32,
    /// Win rate gate for `proposable`.
    pub win_rate: f64,
    /// Sharpe gate for `proposable`.
    pub sharpe: f64,
    /// Minimum test/train Sharpe ratio (overfit gate).
    pub overfit_ratio: f64,
    /// Evolution attempts before a strategy is discarded.
    pub attempt_cap: u32,
    /// Backtests older than this are re-run.
    pub backtest_staleness: ChronoDuration,
    /// Children spawned per promoted parent.
    pub mutations_per_parent: usize,
    /// Candle depth pulled per backtest.
    pub backtest_depth: usize,
}

impl Default for EvolutionThresholds {
    fn default() -> Self {
        Self {
            min_trades: 20,
            win_rate: 0.55,
            sharpe: 1.0,
            overfit_ratio: 0.7,
            attempt_cap: 10,
            backtest_staleness: ChronoDuration::hours(24),
            mutations_per_parent: 2,
            backtest_depth: 300,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub last_cycle_at: Option<DateTime<Utc>>,
    pub next_cycle_at: Option<DateTime<Utc>>,
    pub total_strategies: usize,
    pub experiment: usize,
    pub candidate: usize,
    pub proposable: usize,
    pub discarded: usize,
    pub backtest_queue_size: usize,
    pub promotion_rate: f64,
}

pub struct EvolutionWorker {
    strategies: Arc<dyn StrategyRepository>,
    backtests: Arc<dyn BacktestRepository>,
    lineage: Arc<dyn LineageRepository>,
    router: Arc<ProviderRouter>,
    metrics: Metrics,
    thresholds: EvolutionThresholds,
    interval: Duration,
    in_flight: Mutex<HashSet<String>>,
    last_cycle_at: Mutex<Option<DateTime<Utc>>>,
}

impl EvolutionWorker {
    pub fn new(
        strategies: Arc<dyn StrategyRepository>,
        backtests: Arc<dyn BacktestRepository>,
        lineage: Arc<dyn LineageRepository>,
        router: Arc<ProviderRouter>,
        metrics: Metrics,
        thresholds: EvolutionThresholds,
        interval: Duration,
    ) -> Self {
        Self {
            strategies,
            backtests,
            lineage,
            router,
            metrics,
            thresholds,
            interval,
            in_flight: Mutex::new(HashSet::new()),
            last_cycle_at: Mutex::new(None),
        }
    }

    /// Run cycles until the shutdown signal flips.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Evolution worker started (interval {:?}, thresholds: {} trades / {:.2} win rate / {:.1} sharpe)",
            self.interval, self.thresholds.min_trades, self.thresholds.win_rate,
            self.thresholds.sharpe
        );

        loop {
            match self.run_cycle().await {
                Ok(processed) => {
                    self.metrics
                        .evolution_cycles_total
                        .with_label_values(&["ok"])
                        .inc();
                    info!("Evolution cycle complete: {} strategies processed", processed);
                }
                Err(e) => {
                    self.metrics
                        .evolution_cycles_total
                        .with_label_values(&["error"])
                        .inc();
                    warn!("Evolution cycle failed: {:#}", e);
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Evolution worker shutting down");
                        return;
                    }
                }
            }
        }
    }

    /// One full pass over active strategies. Returns how many were
    /// processed (some may be skipped when another cycle holds their lock).
    pub async fn run_cycle(&self) -> Result<usize> {
        let strategies = self.strategies.list_active().await?;
        let mut processed = 0usize;
        let mut promoted_parents: Vec<StrategyRecord> = Vec::new();

        for strategy in strategies {
            if strategy.status == StrategyStatus::Discarded {
                continue;
            }
            if !self.try_lock(&strategy.id) {
                debug!("Strategy {} already being evolved, skipping", strategy.id);
                continue;
            }

            let result = self.evolve_one(&strategy).await;
            self.unlock(&strategy.id);

            match result {
                Ok(Some(promoted)) => {
                    promoted_parents.push(promoted);
                    processed += 1;
                }
                Ok(None) => processed += 1,
                Err(e) => warn!("Evolving {} failed: {:#}", strategy.id, e),
            }
        }

        for parent in promoted_parents {
            if let Err(e) = self.spawn_mutations(&parent).await {
                warn!("Mutation spawn failed for {}: {:#}", parent.id, e);
            }
        }

        let proposable = self
            .strategies
            .list_active()
            .await?
            .iter()
            .filter(|s| s.status == StrategyStatus::Proposable)
            .count();
        self.metrics.proposable_strategies.set(proposable as f64);

        *self.last_cycle_at.lock().expect("cycle timestamp lock") = Some(Utc::now());
        Ok(processed)
    }

    /// Evolve one strategy; returns it when this cycle promoted it to
    /// `proposable` (the caller then spawns mutations).
    async fn evolve_one(&self, strategy: &StrategyRecord) -> Result<Option<StrategyRecord>> {
        let needs_backtest = match strategy.last_backtest_at {
            None => true,
            Some(at) => Utc::now() - at > self.thresholds.backtest_staleness,
        };

        let report = if needs_backtest {
            let ruleset = Ruleset::parse(&strategy.ruleset);
            let symbol = backtest_symbol(&strategy.ruleset);
            let request = CandleRequest::historical(
                &symbol,
                ruleset.timeframe,
                self.thresholds.backtest_depth,
                None,
                None,
            );
            // Empty frames are fine: the strategy just is not promoted
            // this cycle. Evolution never crashes on provider failure.
            let candles = self.router.candles_or_empty(&request).await;
            let outcome = BacktestEngine::run(&ruleset, &candles);
            let report = BacktestEngine::report(&strategy.id, &symbol, &ruleset, &candles, &outcome);
            self.backtests.insert(&report).await?;
            Some(report)
        } else {
            self.backtests.latest_for(&strategy.id).await?
        };

        let Some(report) = report else {
            return Ok(None);
        };

        let metrics = crate::application::strategy_engine::backtest::BacktestMetrics {
            total_return: report.total_return,
            win_rate: report.win_rate,
            max_drawdown: report.max_drawdown,
            avg_pnl: report.avg_pnl,
            total_trades: report.total_trades,
            sharpe: report.sharpe,
        };
        let score = score_strategy(&metrics);
        let attempts = strategy.evolution_attempts + 1;

        let mut next_status = strategy.status;
        match strategy.status {
            StrategyStatus::Experiment => {
                if report.total_trades >= self.thresholds.min_trades && report.avg_pnl > 0.0 {
                    next_status = StrategyStatus::Candidate;
                }
            }
            StrategyStatus::Candidate => {
                let overfit_ok = report
                    .overfit_ratio()
                    .map(|r| r >= self.thresholds.overfit_ratio)
                    .unwrap_or(false);
                if report.win_rate >= self.thresholds.win_rate
                    && report.sharpe.map(|s| s > self.thresholds.sharpe).unwrap_or(false)
                    && overfit_ok
                {
                    next_status = StrategyStatus::Proposable;
                }
            }
            StrategyStatus::Proposable | StrategyStatus::Discarded => {}
        }

        // Discard cap applies only below proposable.
        if next_status != StrategyStatus::Proposable && attempts > self.thresholds.attempt_cap {
            next_status = StrategyStatus::Discarded;
            info!(
                "Discarding strategy {} after {} attempts without promotion",
                strategy.id, attempts
            );
        }

        self.strategies
            .update_evolution_state(
                &strategy.id,
                next_status,
                score,
                attempts,
                Some(Utc::now()),
            )
            .await?;

        if next_status == StrategyStatus::Proposable
            && strategy.status != StrategyStatus::Proposable
        {
            info!(
                "Strategy {} promoted to proposable (win rate {:.2}, sharpe {:?})",
                strategy.id, report.win_rate, report.sharpe
            );
            let mut promoted = strategy.clone();
            promoted.status = next_status;
            promoted.score = score;
            return Ok(Some(promoted));
        }
        Ok(None)
    }

    async fn spawn_mutations(&self, parent: &StrategyRecord) -> Result<()> {
        let outcomes = MutationEngine::mutate(
            parent,
            self.thresholds.mutations_per_parent,
            "evolution-worker",
        );
        for outcome in outcomes {
            self.strategies.create(&outcome.child).await?;
            self.lineage.add_edge(&outcome.edge).await?;
            debug!(
                "Spawned mutation {} from {} ({})",
                outcome.child.id, parent.id, outcome.edge.mutation_kind
            );
        }
        Ok(())
    }

    /// Ops-facing cycle status.
    pub async fn status(&self) -> Result<WorkerStatus> {
        let strategies = self.strategies.list_active().await?;
        let mut by_status: HashMap<StrategyStatus, usize> = HashMap::new();
        for strategy in &strategies {
            *by_status.entry(strategy.status).or_insert(0) += 1;
        }

        let stale_cutoff = Utc::now() - self.thresholds.backtest_staleness;
        let backtest_queue_size = strategies
            .iter()
            .filter(|s| {
                matches!(
                    s.status,
                    StrategyStatus::Experiment | StrategyStatus::Candidate
                ) && s.last_backtest_at.map(|at| at < stale_cutoff).unwrap_or(true)
            })
            .count();

        let proposable = *by_status.get(&StrategyStatus::Proposable).unwrap_or(&0);
        let promotion_rate = if strategies.is_empty() {
            0.0
        } else {
            proposable as f64 / strategies.len() as f64
        };

        let last_cycle_at = *self.last_cycle_at.lock().expect("cycle timestamp lock");
        Ok(WorkerStatus {
            last_cycle_at,
            next_cycle_at: last_cycle_at.map(|at| {
                at + ChronoDuration::from_std(self.interval).unwrap_or(ChronoDuration::hours(24))
            }),
            total_strategies: strategies.len(),
            experiment: *by_status.get(&StrategyStatus::Experiment).unwrap_or(&0),
            candidate: *by_status.get(&StrategyStatus::Candidate).unwrap_or(&0),
            proposable,
            discarded: *by_status.get(&StrategyStatus::Discarded).unwrap_or(&0),
            backtest_queue_size,
            promotion_rate,
        })
    }

    fn try_lock(&self, strategy_id: &str) -> bool {
        self.in_flight
            .lock()
            .expect("in-flight lock")
            .insert(strategy_id.to_string())
    }

    fn unlock(&self, strategy_id: &str) {
        self.in_flight
            .lock()
            .expect("in-flight lock")
            .remove(strategy_id);
    }
}

/// The symbol a strategy backtests against, from its ruleset document.
fn backtest_symbol(ruleset_doc: &Value) -> String {
    ruleset_doc
        .get("ticker")
        .and_then(Value::as_str)
        .or_else(|| {
            ruleset_doc
                .get("symbols")
                .and_then(Value::as_array)
                .and_then(|arr| arr.first())
                .and_then(Value::as_str)
        })
        .unwrap_or("SPY")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_backtest_symbol_resolution() {
        assert_eq!(backtest_symbol(&json!({"ticker": "AAPL"})), "AAPL");
        assert_eq!(backtest_symbol(&json!({"symbols": ["MSFT", "NVDA"]})), "MSFT");
        assert_eq!(backtest_symbol(&json!({})), "SPY");
    }
}
