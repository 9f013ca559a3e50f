use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use tracing::debug;

use crate::domain::repositories::StrategyRepository;
use crate::domain::strategy::{StrategyRecord, StrategyStatus};
use crate::domain::trading::AssetType;

pub struct SqliteStrategyRepository {
    pool: SqlitePool,
}

impl SqliteStrategyRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<StrategyRecord> {
        let asset_type: String = row.try_get("asset_type")?;
        let status: String = row.try_get("status")?;
        let parameters_json: String = row.try_get("parameters_json")?;
        let ruleset_json: String = row.try_get("ruleset_json")?;

        Ok(StrategyRecord {
            id: row.try_get("id")?,
            owner_id: row.try_get("owner_id")?,
            name: row.try_get("name")?,
            asset_type: AssetType::from_str(&asset_type)?,
            parameters: serde_json::from_str(&parameters_json)
                .context("invalid parameters json")?,
            ruleset: serde_json::from_str(&ruleset_json).context("invalid ruleset json")?,
            score: row.try_get("score")?,
            status: StrategyStatus::from_str(&status)?,
            evolution_attempts: row.try_get::<i64, _>("evolution_attempts")? as u32,
            is_active: row.try_get("is_active")?,
            last_backtest_at: row.try_get("last_backtest_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[async_trait]
impl StrategyRepository for SqliteStrategyRepository {
    async fn create(&self, strategy: &StrategyRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO strategies
                (id, owner_id, name, asset_type, parameters_json, ruleset_json,
                 score, status, evolution_attempts, is_active, last_backtest_at,
                 created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&strategy.id)
        .bind(&strategy.owner_id)
        .bind(&strategy.name)
        .bind(strategy.asset_type.to_string())
        .bind(serde_json::to_string(&strategy.parameters)?)
        .bind(serde_json::to_string(&strategy.ruleset)?)
        .bind(strategy.score)
        .bind(strategy.status.to_string())
        .bind(strategy.evolution_attempts as i64)
        .bind(strategy.is_active)
        .bind(strategy.last_backtest_at)
        .bind(strategy.created_at)
        .bind(strategy.updated_at)
        .execute(&self.pool)
        .await
        .context("Failed to insert strategy")?;

        debug!("Persisted strategy {} ({})", strategy.name, strategy.id);
        Ok(())
    }

    async fn get(&self, strategy_id: &str) -> Result<Option<StrategyRecord>> {
        let row = sqlx::query("SELECT * FROM strategies WHERE id = ?")
            .bind(strategy_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::from_row).transpose()
    }

    async fn list_active(&self) -> Result<Vec<StrategyRecord>> {
        let rows = sqlx::query("SELECT * FROM strategies WHERE is_active = 1")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::from_row).collect()
    }

    async fn list_by_owner(&self, owner_id: &str) -> Result<Vec<StrategyRecord>> {
        let rows = sqlx::query("SELECT * FROM strategies WHERE owner_id = ? ORDER BY created_at")
            .bind(owner_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::from_row).collect()
    }

    async fn update_evolution_state(
        &self,
        strategy_id: &str,
        status: StrategyStatus,
        score: f64,
        evolution_attempts: u32,
        last_backtest_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE strategies
            SET status = ?, score = ?, evolution_attempts = ?,
                last_backtest_at = COALESCE(?, last_backtest_at), updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(status.to_string())
        .bind(score)
        .bind(evolution_attempts as i64)
        .bind(last_backtest_at)
        .bind(Utc::now())
        .bind(strategy_id)
        .execute(&self.pool)
        .await
        .context("Failed to update strategy evolution state")?;
        Ok(())
    }

    async fn set_active(&self, strategy_id: &str, active: bool) -> Result<()> {
        sqlx::query("UPDATE strategies SET is_active = ?, updated_at = ? WHERE id = ?")
            .bind(active)
            .bind(Utc::now())
            .bind(strategy_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
