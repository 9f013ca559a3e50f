//! Repository traits. The database owns persistent state; these traits are
//! the only way the application layer touches it.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::domain::billing::{
    AdminSettings, PaymentRecord, RoyaltyEntry, SubscriptionPlan,
};
use crate::domain::groups::{Group, GroupMember, GroupMessage};
use crate::domain::strategy::{BacktestReport, LineageEdge, StrategyRecord, StrategyStatus};
use crate::domain::trading::{PaperAccount, Trade, TradeMode, TradeStatus};
use crate::domain::user::User;

#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn get(&self, user_id: &str) -> Result<Option<User>>;
    async fn get_by_email(&self, email: &str) -> Result<Option<User>>;
    async fn upsert(&self, user: &User) -> Result<()>;
}

#[async_trait]
pub trait PlanRepository: Send + Sync {
    async fn get(&self, plan_id: &str) -> Result<Option<SubscriptionPlan>>;
    async fn get_by_code(&self, code: &str) -> Result<Option<SubscriptionPlan>>;
    async fn list(&self) -> Result<Vec<SubscriptionPlan>>;
    async fn upsert(&self, plan: &SubscriptionPlan) -> Result<()>;
}

#[async_trait]
pub trait SettingsRepository: Send + Sync {
    /// Returns the singleton settings row, inserting defaults on first use.
    async fn get(&self) -> Result<AdminSettings>;
    async fn update(&self, settings: &AdminSettings) -> Result<()>;
}

#[async_trait]
pub trait StrategyRepository: Send + Sync {
    async fn create(&self, strategy: &StrategyRecord) -> Result<()>;
    async fn get(&self, strategy_id: &str) -> Result<Option<StrategyRecord>>;
    async fn list_active(&self) -> Result<Vec<StrategyRecord>>;
    async fn list_by_owner(&self, owner_id: &str) -> Result<Vec<StrategyRecord>>;
    /// The only permitted in-place mutation: status, score, attempt count
    /// and backtest bookkeeping.
    async fn update_evolution_state(
        &self,
        strategy_id: &str,
        status: StrategyStatus,
        score: f64,
        evolution_attempts: u32,
        last_backtest_at: Option<DateTime<Utc>>,
    ) -> Result<()>;
    async fn set_active(&self, strategy_id: &str, active: bool) -> Result<()>;
}

#[async_trait]
pub trait LineageRepository: Send + Sync {
    async fn add_edge(&self, edge: &LineageEdge) -> Result<()>;
    /// Parent edges pointing at `child_id`.
    async fn parents_of(&self, child_id: &str) -> Result<Vec<LineageEdge>>;
    async fn children_of(&self, parent_id: &str) -> Result<Vec<LineageEdge>>;
    async fn count_children(&self, parent_id: &str) -> Result<u32>;
}

#[async_trait]
pub trait BacktestRepository: Send + Sync {
    async fn insert(&self, report: &BacktestReport) -> Result<()>;
    async fn latest_for(&self, strategy_id: &str) -> Result<Option<BacktestReport>>;
}

#[async_trait]
pub trait TradeRepository: Send + Sync {
    async fn create(&self, trade: &Trade) -> Result<()>;
    async fn get(&self, trade_id: &str) -> Result<Option<Trade>>;
    async fn list_for_user(
        &self,
        user_id: &str,
        status: Option<TradeStatus>,
        mode: Option<TradeMode>,
    ) -> Result<Vec<Trade>>;
    async fn close(
        &self,
        trade_id: &str,
        exit_price: Decimal,
        closed_at: DateTime<Utc>,
        realized_pnl: Decimal,
    ) -> Result<()>;
}

#[async_trait]
pub trait PaperAccountRepository: Send + Sync {
    async fn get_or_create(&self, user_id: &str, starting_balance: Decimal)
    -> Result<PaperAccount>;
    async fn get(&self, user_id: &str) -> Result<Option<PaperAccount>>;
    async fn update_balance(&self, user_id: &str, balance: Decimal) -> Result<()>;
}

#[async_trait]
pub trait RoyaltyRepository: Send + Sync {
    async fn insert(&self, entry: &RoyaltyEntry) -> Result<()>;
    async fn list_for_user(&self, user_id: &str) -> Result<Vec<RoyaltyEntry>>;
    /// Unpaid rows created within [start, end].
    async fn unpaid_in_window(
        &self,
        user_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<RoyaltyEntry>>;
    async fn mark_paid(
        &self,
        entry_ids: &[String],
        payment_id: &str,
        paid_at: DateTime<Utc>,
    ) -> Result<()>;
    async fn record_payment(&self, payment: &PaymentRecord) -> Result<()>;
    /// Payment attempts for a user, most recent period first.
    async fn payment_history(&self, user_id: &str) -> Result<Vec<PaymentRecord>>;
}

#[async_trait]
pub trait GroupRepository: Send + Sync {
    async fn create(&self, group: &Group) -> Result<()>;
    async fn get(&self, group_id: &str) -> Result<Option<Group>>;
    async fn get_by_join_code(&self, join_code: &str) -> Result<Option<Group>>;
    async fn delete(&self, group_id: &str) -> Result<()>;
    async fn add_member(&self, member: &GroupMember) -> Result<()>;
    async fn remove_member(&self, group_id: &str, user_id: &str) -> Result<()>;
    async fn members(&self, group_id: &str) -> Result<Vec<GroupMember>>;
    async fn add_message(&self, message: &GroupMessage) -> Result<()>;
    async fn messages(&self, group_id: &str, limit: usize) -> Result<Vec<GroupMessage>>;
    async fn get_message(&self, message_id: &str) -> Result<Option<GroupMessage>>;
    async fn delete_message(&self, message_id: &str) -> Result<()>;
}
