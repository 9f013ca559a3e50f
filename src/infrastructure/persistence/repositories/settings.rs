use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Row, SqlitePool};

use crate::domain::billing::AdminSettings;
use crate::domain::repositories::SettingsRepository;

pub struct SqliteSettingsRepository {
    pool: SqlitePool,
}

impl SqliteSettingsRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SettingsRepository for SqliteSettingsRepository {
    async fn get(&self) -> Result<AdminSettings> {
        let row = sqlx::query("SELECT * FROM admin_settings WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(AdminSettings {
                platform_fee_percent: row.try_get("platform_fee_percent")?,
                creator_fee_percent: row.try_get("creator_fee_percent")?,
                pnl_fee_threshold_cents: row.try_get("pnl_fee_threshold_cents")?,
                grace_months: row.try_get::<i64, _>("grace_months")? as u32,
                updated_at: row.try_get("updated_at")?,
            }),
            None => {
                let defaults = AdminSettings::default();
                self.update(&defaults).await?;
                Ok(defaults)
            }
        }
    }

    async fn update(&self, settings: &AdminSettings) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO admin_settings
                (id, platform_fee_percent, creator_fee_percent,
                 pnl_fee_threshold_cents, grace_months, updated_at)
            VALUES (1, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                platform_fee_percent = excluded.platform_fee_percent,
                creator_fee_percent = excluded.creator_fee_percent,
                pnl_fee_threshold_cents = excluded.pnl_fee_threshold_cents,
                grace_months = excluded.grace_months,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(settings.platform_fee_percent)
        .bind(settings.creator_fee_percent)
        .bind(settings.pnl_fee_threshold_cents)
        .bind(settings.grace_months as i64)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
