//! Monthly billing cycle over the royalty ledger.
//!
//! Aggregates a creator's unpaid rows for one calendar month, charges the
//! payment gateway, marks rows paid, and answers the lock question for
//! premium endpoints: outstanding dues at or above the threshold lock the
//! account unless an earned grace window still covers the delay.

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Datelike, TimeZone, Utc};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::domain::billing::{
    BillingOutcome, MonthlyStatement, PaymentRecord, PaymentState, PaymentStatus,
};
use crate::domain::ports::PaymentGateway;
use crate::domain::repositories::{RoyaltyRepository, SettingsRepository, UserRepository};

/// Dues strictly above this (cents) trigger a hard lock.
const LOCK_THRESHOLD_CENTS: i64 = 1_000;
/// Months of delayed settlement an earned grace window covers.
const GRACE_DELAYED_MONTHS: u32 = 2;

pub struct BillingCycle {
    ledger: Arc<dyn RoyaltyRepository>,
    users: Arc<dyn UserRepository>,
    settings: Arc<dyn SettingsRepository>,
    gateway: Arc<dyn PaymentGateway>,
}

impl BillingCycle {
    pub fn new(
        ledger: Arc<dyn RoyaltyRepository>,
        users: Arc<dyn UserRepository>,
        settings: Arc<dyn SettingsRepository>,
        gateway: Arc<dyn PaymentGateway>,
    ) -> Self {
        Self {
            ledger,
            users,
            settings,
            gateway,
        }
    }

    /// Unpaid totals for one creator over one calendar month.
    pub async fn monthly_statement(
        &self,
        user_id: &str,
        year: i32,
        month: u32,
    ) -> Result<MonthlyStatement> {
        let (start, end) = month_bounds(year, month)?;
        let entries = self.ledger.unpaid_in_window(user_id, start, end).await?;

        Ok(MonthlyStatement {
            user_id: user_id.to_string(),
            year,
            month,
            outstanding_count: entries.len(),
            royalty_cents: entries.iter().map(|e| e.royalty_cents).sum(),
            platform_fee_cents: entries.iter().map(|e| e.platform_fee_cents).sum(),
            net_cents: entries.iter().map(|e| e.net_cents).sum(),
            entry_ids: entries.iter().map(|e| e.id.clone()).collect(),
        })
    }

    /// Charge a creator's outstanding dues for one month. With
    /// `admin_override`, rows are settled without touching the gateway.
    pub async fn process_monthly_billing(
        &self,
        user_id: &str,
        year: i32,
        month: u32,
        admin_override: bool,
    ) -> Result<BillingOutcome> {
        let user = self
            .users
            .get(user_id)
            .await?
            .ok_or_else(|| anyhow!("User not found: {}", user_id))?;
        let statement = self.monthly_statement(user_id, year, month).await?;

        if statement.outstanding_count == 0 {
            return Ok(BillingOutcome {
                success: true,
                message: "No outstanding royalties for this billing cycle".to_string(),
                amount_charged_cents: 0,
                gateway_ref: None,
                statement,
            });
        }

        let period = Utc
            .with_ymd_and_hms(year, month, 1, 0, 0, 0)
            .single()
            .ok_or_else(|| anyhow!("invalid billing period {}-{}", year, month))?;
        let now = Utc::now();

        if admin_override {
            let payment_id = Uuid::new_v4().to_string();
            self.ledger
                .mark_paid(&statement.entry_ids, &payment_id, now)
                .await?;
            self.ledger
                .record_payment(&PaymentRecord {
                    id: payment_id,
                    user_id: user_id.to_string(),
                    period,
                    amount_cents: statement.net_cents,
                    state: PaymentState::Succeeded,
                    gateway_ref: Some("admin-override".to_string()),
                    created_at: now,
                })
                .await?;
            info!(
                "Admin override settled {} royalty rows for {}",
                statement.outstanding_count, user_id
            );
            return Ok(BillingOutcome {
                success: true,
                message: "Admin override: royalties settled without charge".to_string(),
                amount_charged_cents: 0,
                gateway_ref: None,
                statement,
            });
        }

        let description = format!("Royalties for {:02}/{}", month, year);
        match self
            .gateway
            .charge_royalties(user_id, &user.email, statement.net_cents, &description)
            .await
        {
            Ok(receipt) => {
                let payment_id = Uuid::new_v4().to_string();
                self.ledger
                    .mark_paid(&statement.entry_ids, &payment_id, now)
                    .await
                    .context("mark ledger rows paid")?;
                self.ledger
                    .record_payment(&PaymentRecord {
                        id: payment_id,
                        user_id: user_id.to_string(),
                        period,
                        amount_cents: receipt.amount_cents,
                        state: PaymentState::Succeeded,
                        gateway_ref: Some(receipt.reference.clone()),
                        created_at: now,
                    })
                    .await?;

                Ok(BillingOutcome {
                    success: true,
                    message: "Monthly billing processed".to_string(),
                    amount_charged_cents: receipt.amount_cents,
                    gateway_ref: Some(receipt.reference),
                    statement,
                })
            }
            Err(error) => {
                warn!("Billing charge failed for {}: {}", user_id, error);
                self.ledger
                    .record_payment(&PaymentRecord {
                        id: Uuid::new_v4().to_string(),
                        user_id: user_id.to_string(),
                        period,
                        amount_cents: statement.net_cents,
                        state: PaymentState::Failed,
                        gateway_ref: None,
                        created_at: now,
                    })
                    .await?;

                Ok(BillingOutcome {
                    success: false,
                    message: format!("Failed to process billing: {}", error),
                    amount_charged_cents: 0,
                    gateway_ref: None,
                    statement,
                })
            }
        }
    }

    /// Lock decision for premium endpoints.
    ///
    /// Grace requires `grace_months` consecutive successful payments and
    /// covers up to two months of delayed settlement before the lock
    /// engages.
    pub async fn payment_status(&self, user_id: &str) -> Result<PaymentStatus> {
        let settings = self.settings.get().await?;
        let now = Utc::now();

        // All-time unpaid dues, not just the current month: dues age into
        // the lock, they do not expire out of it.
        let (window_start, window_end) = (
            Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).single().unwrap_or(now),
            now,
        );
        let unpaid = self
            .ledger
            .unpaid_in_window(user_id, window_start, window_end)
            .await?;
        let outstanding_cents: i64 = unpaid.iter().map(|e| e.net_cents).sum();

        let history = self.ledger.payment_history(user_id).await?;
        let consecutive_successes = history
            .iter()
            .take_while(|p| p.state == PaymentState::Succeeded)
            .count() as u32;
        let has_grace = consecutive_successes >= settings.grace_months;

        let months_delinquent = unpaid
            .iter()
            .map(|e| months_between(e.created_at, now))
            .max()
            .unwrap_or(0);

        // Strictly above the threshold: exactly $10.00 outstanding does
        // not lock.
        let over_threshold = outstanding_cents > LOCK_THRESHOLD_CENTS;
        let should_lock =
            over_threshold && (!has_grace || months_delinquent > GRACE_DELAYED_MONTHS);

        Ok(PaymentStatus {
            user_id: user_id.to_string(),
            has_unpaid_royalties: outstanding_cents > 0,
            outstanding_cents,
            should_lock,
            lock_threshold_cents: LOCK_THRESHOLD_CENTS,
            has_grace,
            months_delinquent,
        })
    }
}

fn month_bounds(year: i32, month: u32) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
    let start = Utc
        .with_ymd_and_hms(year, month, 1, 0, 0, 0)
        .single()
        .ok_or_else(|| anyhow!("invalid month {}-{}", year, month))?;
    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    let end = Utc
        .with_ymd_and_hms(next_year, next_month, 1, 0, 0, 0)
        .single()
        .ok_or_else(|| anyhow!("invalid month rollover"))?
        - chrono::Duration::seconds(1);
    Ok((start, end))
}

fn months_between(earlier: DateTime<Utc>, later: DateTime<Utc>) -> u32 {
    if later <= earlier {
        return 0;
    }
    let years = later.year() - earlier.year();
    let months = later.month() as i32 - earlier.month() as i32;
    (years * 12 + months).max(0) as u32
}
