use anyhow::Result;
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};

use crate::domain::repositories::BacktestRepository;
use crate::domain::strategy::BacktestReport;

pub struct SqliteBacktestRepository {
    pool: SqlitePool,
}

impl SqliteBacktestRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<BacktestReport> {
        Ok(BacktestReport {
            id: row.try_get("id")?,
            strategy_id: row.try_get("strategy_id")?,
            symbol: row.try_get("symbol")?,
            timeframe: row.try_get("timeframe")?,
            window_start: row.try_get("window_start")?,
            window_end: row.try_get("window_end")?,
            total_return: row.try_get("total_return")?,
            win_rate: row.try_get("win_rate")?,
            max_drawdown: row.try_get("max_drawdown")?,
            avg_pnl: row.try_get("avg_pnl")?,
            total_trades: row.try_get::<i64, _>("total_trades")? as u32,
            sharpe: row.try_get("sharpe")?,
            train_sharpe: row.try_get("train_sharpe")?,
            test_sharpe: row.try_get("test_sharpe")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

#[async_trait]
impl BacktestRepository for SqliteBacktestRepository {
    async fn insert(&self, report: &BacktestReport) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO strategy_backtests
                (id, strategy_id, symbol, timeframe, window_start, window_end,
                 total_return, win_rate, max_drawdown, avg_pnl, total_trades,
                 sharpe, train_sharpe, test_sharpe, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&report.id)
        .bind(&report.strategy_id)
        .bind(&report.symbol)
        .bind(&report.timeframe)
        .bind(report.window_start)
        .bind(report.window_end)
        .bind(report.total_return)
        .bind(report.win_rate)
        .bind(report.max_drawdown)
        .bind(report.avg_pnl)
        .bind(report.total_trades as i64)
        .bind(report.sharpe)
        .bind(report.train_sharpe)
        .bind(report.test_sharpe)
        .bind(report.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn latest_for(&self, strategy_id: &str) -> Result<Option<BacktestReport>> {
        let row = sqlx::query(
            "SELECT * FROM strategy_backtests WHERE strategy_id = ? ORDER BY created_at DESC LIMIT 1",
        )
        .bind(strategy_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::from_row).transpose()
    }
}
