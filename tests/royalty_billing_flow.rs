//! End-to-end royalty attribution and billing-lock scenarios against the
//! real SQLite repositories.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use rust_decimal_macros::dec;
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

use tradebrain::application::billing::{BillingCycle, RoyaltyEngine};
use tradebrain::domain::billing::{
    PaymentRecord, PaymentState, RoyaltyEntry, SubscriptionPlan,
};
use tradebrain::domain::ports::{ChargeReceipt, PaymentGateway};
use tradebrain::domain::repositories::{
    LineageRepository, PlanRepository, RoyaltyRepository, SettingsRepository,
    StrategyRepository, UserRepository,
};
use tradebrain::domain::strategy::{LineageEdge, MutationKind, StrategyRecord, StrategyStatus};
use tradebrain::domain::trading::{
    AssetType, Trade, TradeMode, TradeSide, TradeSource, TradeStatus,
};
use tradebrain::domain::user::{Role, User};
use tradebrain::infrastructure::observability::Metrics;
use tradebrain::infrastructure::persistence::Database;
use tradebrain::infrastructure::persistence::repositories::{
    SqliteLineageRepository, SqlitePlanRepository, SqliteRoyaltyRepository,
    SqliteSettingsRepository, SqliteStrategyRepository, SqliteUserRepository,
};

struct Fixture {
    strategies: Arc<dyn StrategyRepository>,
    lineage: Arc<dyn LineageRepository>,
    users: Arc<dyn UserRepository>,
    plans: Arc<dyn PlanRepository>,
    settings: Arc<dyn SettingsRepository>,
    ledger: Arc<dyn RoyaltyRepository>,
    engine: RoyaltyEngine,
}

async fn fixture() -> Fixture {
    let db = Database::new_in_memory().await.unwrap();
    let pool = db.pool.clone();

    let strategies: Arc<dyn StrategyRepository> =
        Arc::new(SqliteStrategyRepository::new(pool.clone()));
    let lineage: Arc<dyn LineageRepository> = Arc::new(SqliteLineageRepository::new(pool.clone()));
    let users: Arc<dyn UserRepository> = Arc::new(SqliteUserRepository::new(pool.clone()));
    let plans: Arc<dyn PlanRepository> = Arc::new(SqlitePlanRepository::new(pool.clone()));
    let settings: Arc<dyn SettingsRepository> =
        Arc::new(SqliteSettingsRepository::new(pool.clone()));
    let ledger: Arc<dyn RoyaltyRepository> = Arc::new(SqliteRoyaltyRepository::new(pool));

    let engine = RoyaltyEngine::new(
        strategies.clone(),
        lineage.clone(),
        users.clone(),
        plans.clone(),
        settings.clone(),
        ledger.clone(),
        Metrics::new().unwrap(),
    );

    Fixture {
        strategies,
        lineage,
        users,
        plans,
        settings,
        ledger,
        engine,
    }
}

fn strategy(id: &str, owner: &str, ruleset: serde_json::Value) -> StrategyRecord {
    let now = Utc::now();
    StrategyRecord {
        id: id.to_string(),
        owner_id: owner.to_string(),
        name: format!("strategy {}", id),
        asset_type: AssetType::Stock,
        parameters: json!({}),
        ruleset,
        score: 0.7,
        status: StrategyStatus::Proposable,
        evolution_attempts: 3,
        is_active: true,
        last_backtest_at: None,
        created_at: now,
        updated_at: now,
    }
}

fn creator(id: &str, plan: Option<&str>) -> User {
    User {
        id: id.to_string(),
        email: format!("{}@example.com", id),
        role: Role::Creator,
        auth_provider: "password".to_string(),
        current_plan_id: plan.map(String::from),
        royalty_percent_override: None,
        broker_connected: false,
        created_at: Utc::now(),
    }
}

fn closed_trade(user: &str, strategy: Option<&str>, pnl: rust_decimal::Decimal) -> Trade {
    let now = Utc::now();
    Trade {
        id: Uuid::new_v4().to_string(),
        user_id: user.to_string(),
        symbol: "AAPL".to_string(),
        asset_type: AssetType::Stock,
        side: TradeSide::Buy,
        quantity: dec!(10),
        entry_price: dec!(100),
        exit_price: Some(dec!(120)),
        status: TradeStatus::Closed,
        mode: TradeMode::Paper,
        source: TradeSource::Brain,
        strategy_id: strategy.map(String::from),
        opened_at: now - Duration::days(2),
        closed_at: Some(now),
        realized_pnl: Some(pnl),
    }
}

fn base_ruleset() -> serde_json::Value {
    json!({
        "conditions": [
            {"indicator": "RSI", "length": 14, "relation": "<", "value": 30.0},
            {"indicator": "SMA", "length": 20, "relation": ">", "other": "SMA_50"}
        ],
        "exit": {"stop_loss": 0.02, "take_profit": 0.04},
        "timeframe": "1d",
        "entry": "close"
    })
}

/// A ruleset two edits away from the base: mid-tier similarity.
fn mutated_ruleset() -> serde_json::Value {
    json!({
        "conditions": [
            {"indicator": "RSI", "length": 14, "relation": "<", "value": 35.0},
            {"indicator": "SMA", "length": 20, "relation": ">", "other": "SMA_50"}
        ],
        "exit": {"stop_loss": 0.02, "take_profit": 0.05},
        "timeframe": "1d",
        "entry": "close"
    })
}

#[tokio::test]
async fn original_strategy_earns_full_rate() {
    let fx = fixture().await;
    fx.users.upsert(&creator("creator-1", None)).await.unwrap();
    fx.strategies
        .create(&strategy("orig", "creator-1", base_ruleset()))
        .await
        .unwrap();

    let trade = closed_trade("trader-9", Some("orig"), dec!(200));
    let entry = fx.engine.record_for_trade(&trade).await.unwrap().unwrap();

    // No lineage parents: similarity 1.0, zero mutations, 5% rate.
    assert_eq!(entry.royalty_rate, 0.05);
    assert_eq!(entry.royalty_cents, 1000);
    assert_eq!(entry.trade_profit_cents, 20_000);
    // Ledger arithmetic holds exactly in cents.
    assert_eq!(entry.net_cents, entry.royalty_cents - entry.platform_fee_cents);
}

#[tokio::test]
async fn mid_tier_mutation_scenario() {
    let fx = fixture().await;

    fx.plans
        .upsert(&SubscriptionPlan {
            id: "plan-creator".to_string(),
            code: "creator".to_string(),
            name: "Creator".to_string(),
            monthly_price_cents: 2900,
            default_royalty_percent: 5.0,
            platform_fee_percent: Some(3.0),
            is_creator_plan: true,
            max_group_size: 50,
        })
        .await
        .unwrap();
    fx.users
        .upsert(&creator("creator-1", Some("plan-creator")))
        .await
        .unwrap();

    // A -> M1 -> B: two mutation steps from the original.
    fx.strategies
        .create(&strategy("strat-a", "creator-1", base_ruleset()))
        .await
        .unwrap();
    fx.strategies
        .create(&strategy("strat-m1", "creator-1", base_ruleset()))
        .await
        .unwrap();
    fx.strategies
        .create(&strategy("strat-b", "creator-1", mutated_ruleset()))
        .await
        .unwrap();

    for (parent, child) in [("strat-a", "strat-m1"), ("strat-m1", "strat-b")] {
        fx.lineage
            .add_edge(&LineageEdge {
                id: Uuid::new_v4().to_string(),
                parent_id: parent.to_string(),
                child_id: child.to_string(),
                mutation_kind: MutationKind::ParameterTweak,
                similarity: None,
                created_by: "worker".to_string(),
                created_at: Utc::now(),
            })
            .await
            .unwrap();
    }

    let trade = closed_trade("trader-9", Some("strat-b"), dec!(200));
    let breakdown = fx.engine.calculate(&trade).await.unwrap().unwrap();

    assert_eq!(breakdown.mutation_count, 2);
    assert_eq!(breakdown.original_strategy_id, "strat-a");
    assert!(
        breakdown.similarity > 0.5 && breakdown.similarity <= 0.7,
        "similarity {} outside the mid tier",
        breakdown.similarity
    );
    assert_eq!(breakdown.royalty_rate, 0.03);
    assert_eq!(breakdown.platform_fee_rate, 0.03);

    // $200 profit at 3% royalty with a 3% creator platform fee:
    // royalty $6.00, fee $0.18, net $5.82.
    let entry = fx.engine.record_for_trade(&trade).await.unwrap().unwrap();
    assert_eq!(entry.trade_profit_cents, 20_000);
    assert_eq!(entry.royalty_cents, 600);
    assert_eq!(entry.platform_fee_cents, 18);
    assert_eq!(entry.net_cents, 582);
}

#[tokio::test]
async fn unprofitable_or_unattributed_trades_earn_nothing() {
    let fx = fixture().await;
    fx.users.upsert(&creator("creator-1", None)).await.unwrap();
    fx.strategies
        .create(&strategy("orig", "creator-1", base_ruleset()))
        .await
        .unwrap();

    let losing = closed_trade("trader-9", Some("orig"), dec!(-50));
    assert!(fx.engine.record_for_trade(&losing).await.unwrap().is_none());

    let manual = closed_trade("trader-9", None, dec!(500));
    assert!(fx.engine.record_for_trade(&manual).await.unwrap().is_none());
}

struct AlwaysChargeGateway;

#[async_trait]
impl PaymentGateway for AlwaysChargeGateway {
    async fn charge_royalties(
        &self,
        _user_id: &str,
        _user_email: &str,
        amount_cents: i64,
        _description: &str,
    ) -> anyhow::Result<ChargeReceipt> {
        Ok(ChargeReceipt {
            reference: "ch_test".to_string(),
            amount_cents,
        })
    }
}

fn unpaid_entry(user: &str, net_cents: i64, age_days: i64) -> RoyaltyEntry {
    RoyaltyEntry {
        id: Uuid::new_v4().to_string(),
        user_id: user.to_string(),
        strategy_id: "strat".to_string(),
        trade_id: Uuid::new_v4().to_string(),
        royalty_cents: net_cents,
        royalty_rate: 0.05,
        platform_fee_cents: 0,
        platform_fee_rate: 0.0,
        net_cents,
        trade_profit_cents: net_cents * 20,
        paid_at: None,
        payment_id: None,
        created_at: Utc::now() - Duration::days(age_days),
    }
}

#[tokio::test]
async fn outstanding_dues_without_grace_lock_the_account() {
    let fx = fixture().await;
    fx.users.upsert(&creator("creator-1", None)).await.unwrap();

    // $15 unpaid, written two months ago.
    fx.ledger
        .insert(&unpaid_entry("creator-1", 1500, 62))
        .await
        .unwrap();

    // Only two successful payments: below the grace streak.
    for months_ago in [2i64, 3] {
        fx.ledger
            .record_payment(&PaymentRecord {
                id: Uuid::new_v4().to_string(),
                user_id: "creator-1".to_string(),
                period: Utc::now() - Duration::days(months_ago * 30),
                amount_cents: 1000,
                state: PaymentState::Succeeded,
                gateway_ref: None,
                created_at: Utc::now() - Duration::days(months_ago * 30),
            })
            .await
            .unwrap();
    }

    let billing = BillingCycle::new(
        fx.ledger.clone(),
        fx.users.clone(),
        fx.settings.clone(),
        Arc::new(AlwaysChargeGateway),
    );
    let status = billing.payment_status("creator-1").await.unwrap();

    assert!(status.has_unpaid_royalties);
    assert_eq!(status.outstanding_cents, 1500);
    assert!(!status.has_grace);
    assert!(status.should_lock);
}

#[tokio::test]
async fn lock_threshold_is_strict() {
    let fx = fixture().await;
    fx.users.upsert(&creator("creator-1", None)).await.unwrap();

    let billing = BillingCycle::new(
        fx.ledger.clone(),
        fx.users.clone(),
        fx.settings.clone(),
        Arc::new(AlwaysChargeGateway),
    );

    // Exactly $10.00 outstanding sits on the threshold: no lock.
    fx.ledger
        .insert(&unpaid_entry("creator-1", 1000, 45))
        .await
        .unwrap();
    let status = billing.payment_status("creator-1").await.unwrap();
    assert_eq!(status.outstanding_cents, 1000);
    assert!(status.has_unpaid_royalties);
    assert!(!status.should_lock);

    // One more cent tips it over.
    fx.ledger
        .insert(&unpaid_entry("creator-1", 1, 45))
        .await
        .unwrap();
    let status = billing.payment_status("creator-1").await.unwrap();
    assert_eq!(status.outstanding_cents, 1001);
    assert!(status.should_lock);
}

#[tokio::test]
async fn grace_covers_short_delays() {
    let fx = fixture().await;
    fx.users.upsert(&creator("creator-1", None)).await.unwrap();

    // $15 unpaid from last month; four consecutive successful payments.
    fx.ledger
        .insert(&unpaid_entry("creator-1", 1500, 31))
        .await
        .unwrap();
    for months_ago in 1i64..=4 {
        fx.ledger
            .record_payment(&PaymentRecord {
                id: Uuid::new_v4().to_string(),
                user_id: "creator-1".to_string(),
                period: Utc::now() - Duration::days(months_ago * 30),
                amount_cents: 1000,
                state: PaymentState::Succeeded,
                gateway_ref: None,
                created_at: Utc::now() - Duration::days(months_ago * 30),
            })
            .await
            .unwrap();
    }

    let billing = BillingCycle::new(
        fx.ledger.clone(),
        fx.users.clone(),
        fx.settings.clone(),
        Arc::new(AlwaysChargeGateway),
    );
    let status = billing.payment_status("creator-1").await.unwrap();

    assert!(status.has_grace);
    assert!(status.months_delinquent <= 2);
    assert!(!status.should_lock);
}

#[tokio::test]
async fn monthly_billing_settles_ledger_rows() {
    let fx = fixture().await;
    fx.users.upsert(&creator("creator-1", None)).await.unwrap();

    let now = Utc::now();
    fx.ledger
        .insert(&unpaid_entry("creator-1", 600, 0))
        .await
        .unwrap();
    fx.ledger
        .insert(&unpaid_entry("creator-1", 400, 0))
        .await
        .unwrap();

    let billing = BillingCycle::new(
        fx.ledger.clone(),
        fx.users.clone(),
        fx.settings.clone(),
        Arc::new(AlwaysChargeGateway),
    );

    use chrono::Datelike;
    let outcome = billing
        .process_monthly_billing("creator-1", now.year(), now.month(), false)
        .await
        .unwrap();

    assert!(outcome.success);
    assert_eq!(outcome.amount_charged_cents, 1000);

    // Nothing left unpaid afterwards.
    let status = billing.payment_status("creator-1").await.unwrap();
    assert_eq!(status.outstanding_cents, 0);
    assert!(!status.should_lock);
}
