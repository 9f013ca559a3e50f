//! Evolution worker cycle: promotion to proposable, mutation spawning,
//! and the no-demotion guarantee.

mod common;

use chrono::{Duration, Utc};
use common::{ScriptedProvider, choppy_frame, router_over};
use rust_decimal_macros::dec;
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

use tradebrain::application::evolution::{EvolutionThresholds, EvolutionWorker};
use tradebrain::domain::repositories::{
    BacktestRepository, LineageRepository, StrategyRepository,
};
use tradebrain::domain::strategy::{BacktestReport, StrategyRecord, StrategyStatus};
use tradebrain::domain::trading::AssetType;
use tradebrain::infrastructure::observability::Metrics;
use tradebrain::infrastructure::persistence::Database;
use tradebrain::infrastructure::persistence::repositories::{
    SqliteBacktestRepository, SqliteLineageRepository, SqliteStrategyRepository,
};

struct Fixture {
    worker: EvolutionWorker,
    strategies: Arc<dyn StrategyRepository>,
    lineage: Arc<dyn LineageRepository>,
    backtests: Arc<dyn BacktestRepository>,
    _cache_dir: tempfile::TempDir,
}

async fn fixture() -> Fixture {
    let db = Database::new_in_memory().await.unwrap();
    let pool = db.pool.clone();

    let strategies: Arc<dyn StrategyRepository> =
        Arc::new(SqliteStrategyRepository::new(pool.clone()));
    let backtests: Arc<dyn BacktestRepository> =
        Arc::new(SqliteBacktestRepository::new(pool.clone()));
    let lineage: Arc<dyn LineageRepository> = Arc::new(SqliteLineageRepository::new(pool));

    let provider = Arc::new(ScriptedProvider::new(dec!(100), choppy_frame(120)));
    let (router, cache_dir) = router_over(provider);

    let worker = EvolutionWorker::new(
        strategies.clone(),
        backtests.clone(),
        lineage.clone(),
        router,
        Metrics::new().unwrap(),
        EvolutionThresholds::default(),
        std::time::Duration::from_secs(3600),
    );

    Fixture {
        worker,
        strategies,
        lineage,
        backtests,
        _cache_dir: cache_dir,
    }
}

fn candidate_strategy(id: &str) -> StrategyRecord {
    let now = Utc::now();
    StrategyRecord {
        id: id.to_string(),
        owner_id: "creator".to_string(),
        name: "Candidate".to_string(),
        asset_type: AssetType::Stock,
        parameters: json!({}),
        ruleset: json!({
            "ticker": "AAPL",
            "conditions": [
                {"indicator": "RSI", "length": 14, "relation": "<", "value": 35.0}
            ],
            "exit": {"stop_loss": 0.03, "take_profit": 0.05},
            "timeframe": "1d"
        }),
        score: 0.4,
        status: StrategyStatus::Candidate,
        evolution_attempts: 2,
        is_active: true,
        // Fresh backtest timestamp: this cycle evaluates the stored report
        // instead of re-running the simulation.
        last_backtest_at: Some(now),
        created_at: now - Duration::days(30),
        updated_at: now,
    }
}

fn strong_report(strategy_id: &str) -> BacktestReport {
    let now = Utc::now();
    BacktestReport {
        id: Uuid::new_v4().to_string(),
        strategy_id: strategy_id.to_string(),
        symbol: "AAPL".to_string(),
        timeframe: "1d".to_string(),
        window_start: now - Duration::days(300),
        window_end: now,
        total_return: 0.34,
        win_rate: 0.62,
        max_drawdown: 0.09,
        avg_pnl: 1.8,
        total_trades: 80,
        sharpe: Some(1.6),
        train_sharpe: Some(2.0),
        test_sharpe: Some(1.6), // ratio 0.8, clears the 0.7 overfit gate
        created_at: now,
    }
}

#[tokio::test]
async fn strong_candidate_is_promoted_and_spawns_mutations() {
    let fx = fixture().await;
    fx.strategies
        .create(&candidate_strategy("cand-1"))
        .await
        .unwrap();
    fx.backtests.insert(&strong_report("cand-1")).await.unwrap();

    let processed = fx.worker.run_cycle().await.unwrap();
    assert!(processed >= 1);

    let promoted = fx.strategies.get("cand-1").await.unwrap().unwrap();
    assert_eq!(promoted.status, StrategyStatus::Proposable);
    assert!(promoted.is_proposable());
    assert!(promoted.score > 0.5);

    // Promotion spawns mutations linked by lineage, all starting in
    // experiment.
    let children = fx.lineage.children_of("cand-1").await.unwrap();
    assert_eq!(children.len(), 2);
    for edge in &children {
        let child = fx.strategies.get(&edge.child_id).await.unwrap().unwrap();
        assert_eq!(child.status, StrategyStatus::Experiment);
        assert!(edge.similarity.is_some());
    }
}

#[tokio::test]
async fn proposable_never_demotes_within_a_cycle() {
    let fx = fixture().await;
    fx.strategies
        .create(&candidate_strategy("cand-1"))
        .await
        .unwrap();
    fx.backtests.insert(&strong_report("cand-1")).await.unwrap();

    fx.worker.run_cycle().await.unwrap();
    let after_first = fx.strategies.get("cand-1").await.unwrap().unwrap();
    assert_eq!(after_first.status, StrategyStatus::Proposable);

    // A second cycle re-evaluates (including the freshly spawned children)
    // but the promoted strategy keeps its status.
    fx.worker.run_cycle().await.unwrap();
    let after_second = fx.strategies.get("cand-1").await.unwrap().unwrap();
    assert_eq!(after_second.status, StrategyStatus::Proposable);
}

#[tokio::test]
async fn weak_experiment_is_discarded_past_the_attempt_cap() {
    let fx = fixture().await;

    let mut strategy = candidate_strategy("tired");
    strategy.status = StrategyStatus::Experiment;
    strategy.evolution_attempts = 10; // at the cap; this cycle exceeds it
    fx.strategies.create(&strategy).await.unwrap();

    // A weak report that earns no promotion.
    let mut report = strong_report("tired");
    report.total_trades = 3;
    report.win_rate = 0.2;
    report.sharpe = Some(-0.5);
    report.avg_pnl = -2.0;
    fx.backtests.insert(&report).await.unwrap();

    fx.worker.run_cycle().await.unwrap();

    let discarded = fx.strategies.get("tired").await.unwrap().unwrap();
    assert_eq!(discarded.status, StrategyStatus::Discarded);
}

#[tokio::test]
async fn stale_strategies_get_fresh_backtests() {
    let fx = fixture().await;

    let mut strategy = candidate_strategy("stale");
    strategy.status = StrategyStatus::Experiment;
    strategy.evolution_attempts = 0;
    strategy.last_backtest_at = Some(Utc::now() - Duration::days(3));
    fx.strategies.create(&strategy).await.unwrap();

    fx.worker.run_cycle().await.unwrap();

    // A new report row exists and the bookkeeping advanced.
    let report = fx.backtests.latest_for("stale").await.unwrap();
    assert!(report.is_some());
    let refreshed = fx.strategies.get("stale").await.unwrap().unwrap();
    assert_eq!(refreshed.evolution_attempts, 1);
    assert!(refreshed.last_backtest_at.unwrap() > Utc::now() - Duration::minutes(5));
}

#[tokio::test]
async fn worker_status_reports_counts() {
    let fx = fixture().await;
    fx.strategies
        .create(&candidate_strategy("cand-1"))
        .await
        .unwrap();
    fx.backtests.insert(&strong_report("cand-1")).await.unwrap();

    fx.worker.run_cycle().await.unwrap();
    let status = fx.worker.status().await.unwrap();

    assert_eq!(status.proposable, 1);
    assert_eq!(status.experiment, 2); // spawned mutations
    assert!(status.last_cycle_at.is_some());
    assert!(status.promotion_rate > 0.0);
}
