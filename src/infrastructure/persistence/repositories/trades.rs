use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{Row, SqlitePool};
use std::str::FromStr;

use super::{parse_decimal, parse_optional_decimal};
use crate::domain::repositories::TradeRepository;
use crate::domain::trading::{
    AssetType, Trade, TradeMode, TradeSide, TradeSource, TradeStatus,
};

pub struct SqliteTradeRepository {
    pool: SqlitePool,
}

impl SqliteTradeRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Trade> {
        let asset_type: String = row.try_get("asset_type")?;
        let side: String = row.try_get("side")?;
        let status: String = row.try_get("status")?;
        let mode: String = row.try_get("mode")?;
        let source: String = row.try_get("source")?;
        let quantity: String = row.try_get("quantity")?;
        let entry_price: String = row.try_get("entry_price")?;
        let exit_price: Option<String> = row.try_get("exit_price")?;
        let realized_pnl: Option<String> = row.try_get("realized_pnl")?;

        Ok(Trade {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            symbol: row.try_get("symbol")?,
            asset_type: AssetType::from_str(&asset_type)?,
            side: TradeSide::from_str(&side)?,
            quantity: parse_decimal(&quantity)?,
            entry_price: parse_decimal(&entry_price)?,
            exit_price: parse_optional_decimal(exit_price)?,
            status: TradeStatus::from_str(&status)?,
            mode: TradeMode::from_str(&mode)?,
            source: TradeSource::from_str(&source)?,
            strategy_id: row.try_get("strategy_id")?,
            opened_at: row.try_get("opened_at")?,
            closed_at: row.try_get("closed_at")?,
            realized_pnl: parse_optional_decimal(realized_pnl)?,
        })
    }
}

#[async_trait]
impl TradeRepository for SqliteTradeRepository {
    async fn create(&self, trade: &Trade) -> Result<()> {
        trade.validate_closed()?;
        sqlx::query(
            r#"
            INSERT INTO trades
                (id, user_id, symbol, asset_type, side, quantity, entry_price,
                 exit_price, status, mode, source, strategy_id, opened_at,
                 closed_at, realized_pnl)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&trade.id)
        .bind(&trade.user_id)
        .bind(&trade.symbol)
        .bind(trade.asset_type.to_string())
        .bind(trade.side.to_string())
        .bind(trade.quantity.to_string())
        .bind(trade.entry_price.to_string())
        .bind(trade.exit_price.map(|p| p.to_string()))
        .bind(trade.status.to_string())
        .bind(trade.mode.to_string())
        .bind(trade.source.to_string())
        .bind(&trade.strategy_id)
        .bind(trade.opened_at)
        .bind(trade.closed_at)
        .bind(trade.realized_pnl.map(|p| p.to_string()))
        .execute(&self.pool)
        .await
        .context("Failed to insert trade")?;
        Ok(())
    }

    async fn get(&self, trade_id: &str) -> Result<Option<Trade>> {
        let row = sqlx::query("SELECT * FROM trades WHERE id = ?")
            .bind(trade_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::from_row).transpose()
    }

    async fn list_for_user(
        &self,
        user_id: &str,
        status: Option<TradeStatus>,
        mode: Option<TradeMode>,
    ) -> Result<Vec<Trade>> {
        let mut sql = "SELECT * FROM trades WHERE user_id = ?".to_string();
        if status.is_some() {
            sql.push_str(" AND status = ?");
        }
        if mode.is_some() {
            sql.push_str(" AND mode = ?");
        }
        sql.push_str(" ORDER BY opened_at");

        let mut query = sqlx::query(&sql).bind(user_id);
        if let Some(status) = status {
            query = query.bind(status.to_string());
        }
        if let Some(mode) = mode {
            query = query.bind(mode.to_string());
        }

        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(Self::from_row).collect()
    }

    async fn close(
        &self,
        trade_id: &str,
        exit_price: Decimal,
        closed_at: DateTime<Utc>,
        realized_pnl: Decimal,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE trades
            SET status = 'CLOSED', exit_price = ?, closed_at = ?, realized_pnl = ?
            WHERE id = ? AND status = 'OPEN'
            "#,
        )
        .bind(exit_price.to_string())
        .bind(closed_at)
        .bind(realized_pnl.to_string())
        .bind(trade_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            anyhow::bail!("Trade {} is not open", trade_id);
        }
        Ok(())
    }
}
