//! Brain signal assembly end-to-end: accept, hold, low-confidence and
//! portfolio-risk refusals, all against scripted market data.

mod common;

use chrono::Utc;
use common::{ScriptedProvider, choppy_frame, downtrend_frame, router_over};
use rust_decimal_macros::dec;
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

use tradebrain::application::brain::assembler::{SignalAssembler, SignalSide};
use tradebrain::application::brain::multi_timeframe::MultiTimeframeAnalyzer;
use tradebrain::application::brain::portfolio_risk::PortfolioRiskManager;
use tradebrain::application::brain::regime::RegimeDetector;
use tradebrain::application::brain::user_risk::UserRiskProfiler;
use tradebrain::application::brain::volume::VolumeAnalyzer;
use tradebrain::domain::errors::SignalRefusal;
use tradebrain::domain::market::types::Candle;
use tradebrain::domain::repositories::{
    PaperAccountRepository, StrategyRepository, TradeRepository,
};
use tradebrain::domain::strategy::{StrategyRecord, StrategyStatus};
use tradebrain::domain::trading::{
    AssetType, Trade, TradeMode, TradeSide, TradeSource, TradeStatus,
};
use tradebrain::infrastructure::mcn::MemoryClusterStore;
use tradebrain::infrastructure::observability::Metrics;
use tradebrain::infrastructure::persistence::Database;
use tradebrain::infrastructure::persistence::repositories::{
    SqliteBacktestRepository, SqliteLineageRepository, SqlitePaperAccountRepository,
    SqliteStrategyRepository, SqliteTradeRepository,
};

struct Fixture {
    assembler: SignalAssembler,
    strategies: Arc<dyn StrategyRepository>,
    trades: Arc<dyn TradeRepository>,
    accounts: Arc<dyn PaperAccountRepository>,
    _cache_dir: tempfile::TempDir,
}

async fn fixture(candles: Vec<Candle>, last_price: f64, min_confidence: f64) -> Fixture {
    let db = Database::new_in_memory().await.unwrap();
    let pool = db.pool.clone();

    let strategies: Arc<dyn StrategyRepository> =
        Arc::new(SqliteStrategyRepository::new(pool.clone()));
    let lineage = Arc::new(SqliteLineageRepository::new(pool.clone()));
    let backtests = Arc::new(SqliteBacktestRepository::new(pool.clone()));
    let trades: Arc<dyn TradeRepository> = Arc::new(SqliteTradeRepository::new(pool.clone()));
    let accounts: Arc<dyn PaperAccountRepository> =
        Arc::new(SqlitePaperAccountRepository::new(pool));

    let provider = Arc::new(ScriptedProvider::new(
        rust_decimal::Decimal::from_f64_retain(last_price).unwrap(),
        candles,
    ));
    let (router, cache_dir) = router_over(provider);

    let memory = Arc::new(MemoryClusterStore::new(MemoryClusterStore::FIXED_DIM));
    let regime = Arc::new(RegimeDetector::new(router.clone(), memory));
    let metrics = Metrics::new().unwrap();

    let assembler = SignalAssembler::new(
        strategies.clone(),
        lineage,
        backtests,
        accounts.clone(),
        router.clone(),
        regime,
        Arc::new(MultiTimeframeAnalyzer::new(router.clone())),
        Arc::new(VolumeAnalyzer::new(router.clone())),
        Arc::new(UserRiskProfiler::new(trades.clone(), accounts.clone())),
        Arc::new(PortfolioRiskManager::new(
            trades.clone(),
            accounts.clone(),
            router,
        )),
        metrics,
        min_confidence,
    );

    Fixture {
        assembler,
        strategies,
        trades,
        accounts,
        _cache_dir: cache_dir,
    }
}

fn rsi_reversal_strategy(score: f64) -> StrategyRecord {
    let now = Utc::now();
    StrategyRecord {
        id: "strat-rsi".to_string(),
        owner_id: "creator".to_string(),
        name: "RSI Reversal".to_string(),
        asset_type: AssetType::Stock,
        parameters: json!({}),
        ruleset: json!({
            "conditions": [
                {"indicator": "RSI", "length": 14, "relation": "<", "value": 30.0}
            ],
            "exit": {"stop_loss": 0.02, "take_profit": 0.04},
            "timeframe": "1d"
        }),
        score,
        status: StrategyStatus::Proposable,
        evolution_attempts: 4,
        is_active: true,
        last_backtest_at: None,
        created_at: now,
        updated_at: now,
    }
}

#[tokio::test]
async fn oversold_downtrend_produces_buy_signal() {
    // 50 closes trending down: RSI deep below 30.
    let frame = downtrend_frame(50);
    let last_close = frame.last().unwrap().close_f64();
    let fx = fixture(frame, last_close, 0.3).await;

    fx.strategies
        .create(&rsi_reversal_strategy(0.8))
        .await
        .unwrap();
    fx.accounts.get_or_create("u1", dec!(100000)).await.unwrap();

    let signal = fx
        .assembler
        .generate("strat-rsi", "u1", "AAPL")
        .await
        .unwrap();

    assert_eq!(signal.side, SignalSide::Buy);
    assert!(signal.refusal.is_none());

    let entry = signal.entry.unwrap();
    assert!((entry - last_close).abs() < 1e-6);
    assert!((signal.stop_loss.unwrap() - entry * 0.98).abs() < 1e-6);
    assert!((signal.take_profit.unwrap() - entry * 1.04).abs() < 1e-6);
    assert!(signal.confidence >= 0.3);

    // The explanation covers every calibration factor.
    let factors: Vec<&str> = signal
        .explanation
        .factors
        .iter()
        .map(|f| f.factor.as_str())
        .collect();
    for expected in [
        "strategy_score",
        "signal_strength",
        "market_regime",
        "trend_alignment",
        "volume_confirmation",
        "user_risk_profile",
        "portfolio_risk",
    ] {
        assert!(factors.contains(&expected), "missing factor {}", expected);
    }
}

#[tokio::test]
async fn neutral_rsi_holds() {
    // Choppy frame: RSI hovers mid-range, far from the trigger.
    let frame = choppy_frame(60);
    let last_close = frame.last().unwrap().close_f64();
    let fx = fixture(frame, last_close, 0.3).await;

    fx.strategies
        .create(&rsi_reversal_strategy(0.8))
        .await
        .unwrap();
    fx.accounts.get_or_create("u1", dec!(100000)).await.unwrap();

    let signal = fx
        .assembler
        .generate("strat-rsi", "u1", "AAPL")
        .await
        .unwrap();

    assert_eq!(signal.side, SignalSide::Hold);
    assert_eq!(signal.confidence, 0.0);
    assert_eq!(signal.reasoning, "Entry conditions not met");
    assert!(signal.entry.is_none());
}

#[tokio::test]
async fn low_confidence_is_refused() {
    let frame = downtrend_frame(50);
    let last_close = frame.last().unwrap().close_f64();
    // Unreachable confidence floor forces the refusal path.
    let fx = fixture(frame, last_close, 0.99).await;

    fx.strategies
        .create(&rsi_reversal_strategy(0.5))
        .await
        .unwrap();
    fx.accounts.get_or_create("u1", dec!(100000)).await.unwrap();

    let signal = fx
        .assembler
        .generate("strat-rsi", "u1", "AAPL")
        .await
        .unwrap();

    assert_eq!(signal.refusal, Some(SignalRefusal::LowConfidence));
    assert_eq!(signal.side, SignalSide::Hold);
    assert!(signal.reasoning.starts_with("low-confidence"));
}

#[tokio::test]
async fn concentrated_portfolio_is_refused() {
    let frame = downtrend_frame(50);
    let last_close = frame.last().unwrap().close_f64();
    let fx = fixture(frame, last_close, 0.3).await;

    fx.strategies
        .create(&rsi_reversal_strategy(0.8))
        .await
        .unwrap();
    fx.accounts.get_or_create("u1", dec!(100000)).await.unwrap();

    // Existing AAPL exposure at 15% of capital; the nominal brain position
    // (10%) pushes the symbol past its 20% cap.
    fx.trades
        .create(&Trade {
            id: Uuid::new_v4().to_string(),
            user_id: "u1".to_string(),
            symbol: "AAPL".to_string(),
            asset_type: AssetType::Stock,
            side: TradeSide::Buy,
            quantity: dec!(100),
            entry_price: dec!(150),
            exit_price: None,
            status: TradeStatus::Open,
            mode: TradeMode::Paper,
            source: TradeSource::Manual,
            strategy_id: None,
            opened_at: Utc::now(),
            closed_at: None,
            realized_pnl: None,
        })
        .await
        .unwrap();

    let signal = fx
        .assembler
        .generate("strat-rsi", "u1", "AAPL")
        .await
        .unwrap();

    assert_eq!(signal.refusal, Some(SignalRefusal::PortfolioRisk));
    assert_eq!(signal.side, SignalSide::Hold);
    assert!(signal.reasoning.starts_with("portfolio-risk"));
    assert!(!signal.portfolio.as_ref().unwrap().allowed);
}
