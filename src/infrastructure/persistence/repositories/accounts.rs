use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use sqlx::{Row, SqlitePool};

use super::parse_decimal;
use crate::domain::repositories::PaperAccountRepository;
use crate::domain::trading::PaperAccount;

pub struct SqlitePaperAccountRepository {
    pool: SqlitePool,
}

impl SqlitePaperAccountRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<PaperAccount> {
        let balance: String = row.try_get("balance")?;
        let starting_balance: String = row.try_get("starting_balance")?;
        Ok(PaperAccount {
            user_id: row.try_get("user_id")?,
            balance: parse_decimal(&balance)?,
            starting_balance: parse_decimal(&starting_balance)?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[async_trait]
impl PaperAccountRepository for SqlitePaperAccountRepository {
    async fn get_or_create(
        &self,
        user_id: &str,
        starting_balance: Decimal,
    ) -> Result<PaperAccount> {
        if let Some(account) = self.get(user_id).await? {
            return Ok(account);
        }

        let account = PaperAccount {
            user_id: user_id.to_string(),
            balance: starting_balance,
            starting_balance,
            updated_at: Utc::now(),
        };
        sqlx::query(
            r#"
            INSERT INTO paper_accounts (user_id, balance, starting_balance, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(user_id) DO NOTHING
            "#,
        )
        .bind(&account.user_id)
        .bind(account.balance.to_string())
        .bind(account.starting_balance.to_string())
        .bind(account.updated_at)
        .execute(&self.pool)
        .await?;

        // Re-read in case a concurrent insert won the race.
        Ok(self.get(user_id).await?.unwrap_or(account))
    }

    async fn get(&self, user_id: &str) -> Result<Option<PaperAccount>> {
        let row = sqlx::query("SELECT * FROM paper_accounts WHERE user_id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::from_row).transpose()
    }

    async fn update_balance(&self, user_id: &str, balance: Decimal) -> Result<()> {
        sqlx::query("UPDATE paper_accounts SET balance = ?, updated_at = ? WHERE user_id = ?")
            .bind(balance.to_string())
            .bind(Utc::now())
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
