use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;

use crate::domain::billing::{PaymentRecord, PaymentState, RoyaltyEntry};
use crate::domain::repositories::RoyaltyRepository;

pub struct SqliteRoyaltyRepository {
    pool: SqlitePool,
}

impl SqliteRoyaltyRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn entry_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<RoyaltyEntry> {
        Ok(RoyaltyEntry {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            strategy_id: row.try_get("strategy_id")?,
            trade_id: row.try_get("trade_id")?,
            royalty_cents: row.try_get("royalty_cents")?,
            royalty_rate: row.try_get("royalty_rate")?,
            platform_fee_cents: row.try_get("platform_fee_cents")?,
            platform_fee_rate: row.try_get("platform_fee_rate")?,
            net_cents: row.try_get("net_cents")?,
            trade_profit_cents: row.try_get("trade_profit_cents")?,
            paid_at: row.try_get("paid_at")?,
            payment_id: row.try_get("payment_id")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn payment_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<PaymentRecord> {
        let state: String = row.try_get("state")?;
        Ok(PaymentRecord {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            period: row.try_get("period")?,
            amount_cents: row.try_get("amount_cents")?,
            state: PaymentState::from_str(&state)?,
            gateway_ref: row.try_get("gateway_ref")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

#[async_trait]
impl RoyaltyRepository for SqliteRoyaltyRepository {
    async fn insert(&self, entry: &RoyaltyEntry) -> Result<()> {
        entry.validate()?;
        sqlx::query(
            r#"
            INSERT INTO royalty_ledger
                (id, user_id, strategy_id, trade_id, royalty_cents, royalty_rate,
                 platform_fee_cents, platform_fee_rate, net_cents,
                 trade_profit_cents, paid_at, payment_id, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&entry.id)
        .bind(&entry.user_id)
        .bind(&entry.strategy_id)
        .bind(&entry.trade_id)
        .bind(entry.royalty_cents)
        .bind(entry.royalty_rate)
        .bind(entry.platform_fee_cents)
        .bind(entry.platform_fee_rate)
        .bind(entry.net_cents)
        .bind(entry.trade_profit_cents)
        .bind(entry.paid_at)
        .bind(&entry.payment_id)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_for_user(&self, user_id: &str) -> Result<Vec<RoyaltyEntry>> {
        let rows =
            sqlx::query("SELECT * FROM royalty_ledger WHERE user_id = ? ORDER BY created_at")
                .bind(user_id)
                .fetch_all(&self.pool)
                .await?;
        rows.iter().map(Self::entry_from_row).collect()
    }

    async fn unpaid_in_window(
        &self,
        user_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<RoyaltyEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM royalty_ledger
            WHERE user_id = ? AND paid_at IS NULL
              AND created_at >= ? AND created_at <= ?
            ORDER BY created_at
            "#,
        )
        .bind(user_id)
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::entry_from_row).collect()
    }

    async fn mark_paid(
        &self,
        entry_ids: &[String],
        payment_id: &str,
        paid_at: DateTime<Utc>,
    ) -> Result<()> {
        for entry_id in entry_ids {
            sqlx::query("UPDATE royalty_ledger SET paid_at = ?, payment_id = ? WHERE id = ?")
                .bind(paid_at)
                .bind(payment_id)
                .bind(entry_id)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    async fn record_payment(&self, payment: &PaymentRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO royalty_payments
                (id, user_id, period, amount_cents, state, gateway_ref, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&payment.id)
        .bind(&payment.user_id)
        .bind(payment.period)
        .bind(payment.amount_cents)
        .bind(payment.state.to_string())
        .bind(&payment.gateway_ref)
        .bind(payment.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn payment_history(&self, user_id: &str) -> Result<Vec<PaymentRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM royalty_payments WHERE user_id = ? ORDER BY period DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::payment_from_row).collect()
    }
}
