use anyhow::Result;
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};

use crate::domain::billing::SubscriptionPlan;
use crate::domain::repositories::PlanRepository;

pub struct SqlitePlanRepository {
    pool: SqlitePool,
}

impl SqlitePlanRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<SubscriptionPlan> {
        Ok(SubscriptionPlan {
            id: row.try_get("id")?,
            code: row.try_get("code")?,
            name: row.try_get("name")?,
            monthly_price_cents: row.try_get("monthly_price_cents")?,
            default_royalty_percent: row.try_get("default_royalty_percent")?,
            platform_fee_percent: row.try_get("platform_fee_percent")?,
            is_creator_plan: row.try_get("is_creator_plan")?,
            max_group_size: row.try_get::<i64, _>("max_group_size")? as u32,
        })
    }
}

#[async_trait]
impl PlanRepository for SqlitePlanRepository {
    async fn get(&self, plan_id: &str) -> Result<Option<SubscriptionPlan>> {
        let row = sqlx::query("SELECT * FROM subscription_plans WHERE id = ?")
            .bind(plan_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::from_row).transpose()
    }

    async fn get_by_code(&self, code: &str) -> Result<Option<SubscriptionPlan>> {
        let row = sqlx::query("SELECT * FROM subscription_plans WHERE code = ?")
            .bind(code)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::from_row).transpose()
    }

    async fn list(&self) -> Result<Vec<SubscriptionPlan>> {
        let rows = sqlx::query("SELECT * FROM subscription_plans ORDER BY monthly_price_cents")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::from_row).collect()
    }

    async fn upsert(&self, plan: &SubscriptionPlan) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO subscription_plans
                (id, code, name, monthly_price_cents, default_royalty_percent,
                 platform_fee_percent, is_creator_plan, max_group_size)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                monthly_price_cents = excluded.monthly_price_cents,
                default_royalty_percent = excluded.default_royalty_percent,
                platform_fee_percent = excluded.platform_fee_percent,
                is_creator_plan = excluded.is_creator_plan,
                max_group_size = excluded.max_group_size
            "#,
        )
        .bind(&plan.id)
        .bind(&plan.code)
        .bind(&plan.name)
        .bind(plan.monthly_price_cents)
        .bind(plan.default_royalty_percent)
        .bind(plan.platform_fee_percent)
        .bind(plan.is_creator_plan)
        .bind(plan.max_group_size as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
