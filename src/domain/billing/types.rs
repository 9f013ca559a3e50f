//! Billing domain types.
//!
//! Monetary amounts on ledger rows are integer minor units (cents).
//! Rates stay as fractions; rounding to cents happens once, at write time.

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Round a decimal dollar amount to integer cents (banker-free, half-up).
pub fn to_cents(amount: Decimal) -> i64 {
    (amount * Decimal::from(100))
        .round()
        .to_i64()
        .unwrap_or(0)
}

/// Subscription plan. Identity (`code`) is immutable; pricing fields are
/// admin-updatable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionPlan {
    pub id: String,
    pub code: String,
    pub name: String,
    /// Monthly price in cents.
    pub monthly_price_cents: i64,
    /// Default royalty percent granted to creators on this plan, 0-100.
    pub default_royalty_percent: f64,
    /// Platform fee percent retained from royalties, 0-100.
    pub platform_fee_percent: Option<f64>,
    pub is_creator_plan: bool,
    /// Maximum group size for groups owned by users on this plan.
    pub max_group_size: u32,
}

/// Singleton admin-configurable settings row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdminSettings {
    /// Default platform fee percent when a creator has no plan, 0-100.
    pub platform_fee_percent: f64,
    /// Platform fee percent for creator-plan users, 0-100.
    pub creator_fee_percent: f64,
    /// Monthly realized-pnl threshold (cents) below which no platform fee
    /// applies to real-mode trading.
    pub pnl_fee_threshold_cents: i64,
    /// Consecutive paid months required before grace applies.
    pub grace_months: u32,
    pub updated_at: DateTime<Utc>,
}

impl Default for AdminSettings {
    fn default() -> Self {
        Self {
            platform_fee_percent: 5.0,
            creator_fee_percent: 3.0,
            pnl_fee_threshold_cents: 100_000,
            grace_months: 3,
            updated_at: Utc::now(),
        }
    }
}

/// Royalty attribution computed before a ledger write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoyaltyBreakdown {
    pub creator_id: String,
    pub strategy_id: String,
    pub original_strategy_id: String,
    pub similarity: f64,
    pub mutation_count: u32,
    /// Fraction of profit owed to the creator (0.05 = 5%).
    pub royalty_rate: f64,
    /// Fraction of the royalty retained by the platform.
    pub platform_fee_rate: f64,
    pub trade_profit_cents: i64,
    pub royalty_cents: i64,
    pub platform_fee_cents: i64,
    pub net_cents: i64,
}

/// Persistent royalty ledger row. Written only for profitable,
/// strategy-attributed trades.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoyaltyEntry {
    pub id: String,
    /// Strategy creator receiving the royalty.
    pub user_id: String,
    pub strategy_id: String,
    pub trade_id: String,
    pub royalty_cents: i64,
    pub royalty_rate: f64,
    pub platform_fee_cents: i64,
    pub platform_fee_rate: f64,
    pub net_cents: i64,
    pub trade_profit_cents: i64,
    pub paid_at: Option<DateTime<Utc>>,
    pub payment_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl RoyaltyEntry {
    /// Ledger arithmetic invariant: net = royalty - platform fee.
    pub fn validate(&self) -> Result<()> {
        if self.net_cents != self.royalty_cents - self.platform_fee_cents {
            return Err(anyhow!(
                "Ledger row {}: net {} != royalty {} - fee {}",
                self.id,
                self.net_cents,
                self.royalty_cents,
                self.platform_fee_cents
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentState {
    Succeeded,
    Failed,
    Pending,
}

impl fmt::Display for PaymentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PaymentState::Succeeded => "succeeded",
            PaymentState::Failed => "failed",
            PaymentState::Pending => "pending",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for PaymentState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "succeeded" => Ok(PaymentState::Succeeded),
            "failed" => Ok(PaymentState::Failed),
            "pending" => Ok(PaymentState::Pending),
            _ => Err(anyhow!("Invalid payment state: {}", s)),
        }
    }
}

/// Record of one monthly billing attempt against a creator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentRecord {
    pub id: String,
    pub user_id: String,
    /// Billing period as the first day of the month (UTC).
    pub period: DateTime<Utc>,
    pub amount_cents: i64,
    pub state: PaymentState,
    pub gateway_ref: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Aggregated unpaid royalties for one creator over one month.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonthlyStatement {
    pub user_id: String,
    pub year: i32,
    pub month: u32,
    pub outstanding_count: usize,
    pub royalty_cents: i64,
    pub platform_fee_cents: i64,
    pub net_cents: i64,
    pub entry_ids: Vec<String>,
}

/// Result of a billing run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillingOutcome {
    pub success: bool,
    pub message: String,
    pub amount_charged_cents: i64,
    pub gateway_ref: Option<String>,
    pub statement: MonthlyStatement,
}

/// Lock status checked by premium endpoints before acting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentStatus {
    pub user_id: String,
    pub has_unpaid_royalties: bool,
    pub outstanding_cents: i64,
    pub should_lock: bool,
    pub lock_threshold_cents: i64,
    pub has_grace: bool,
    pub months_delinquent: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_to_cents_rounds_half_up() {
        assert_eq!(to_cents(dec!(5.82)), 582);
        assert_eq!(to_cents(dec!(0.005)), 1);
        assert_eq!(to_cents(dec!(0.004)), 0);
        assert_eq!(to_cents(dec!(-1.25)), -125);
    }

    #[test]
    fn test_ledger_invariant() {
        let mut entry = RoyaltyEntry {
            id: "r1".into(),
            user_id: "u1".into(),
            strategy_id: "s1".into(),
            trade_id: "t1".into(),
            royalty_cents: 600,
            royalty_rate: 0.03,
            platform_fee_cents: 18,
            platform_fee_rate: 0.03,
            net_cents: 582,
            trade_profit_cents: 20_000,
            paid_at: None,
            payment_id: None,
            created_at: Utc::now(),
        };
        assert!(entry.validate().is_ok());

        entry.net_cents = 583;
        assert!(entry.validate().is_err());
    }
}
