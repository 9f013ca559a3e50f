use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use tokio::fs;
use tracing::info;

/// Shared database handle.
#[derive(Clone)]
pub struct Database {
    pub pool: SqlitePool,
}

impl Database {
    pub async fn new(db_url: &str) -> Result<Self> {
        if let Some(path_part) = db_url.strip_prefix("sqlite://") {
            let path = Path::new(path_part);
            if let Some(parent) = path.parent()
                && !parent.exists()
            {
                fs::create_dir_all(parent)
                    .await
                    .context("Failed to create database directory")?;
            }
        }

        let options = SqliteConnectOptions::from_str(db_url)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .context("Failed to connect to SQLite database")?;

        info!("Connected to database: {}", db_url);

        let db = Self { pool };
        db.init().await?;
        Ok(db)
    }

    /// In-memory database for tests. Single connection so every query sees
    /// the same memory store.
    pub async fn new_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .context("Failed to open in-memory database")?;

        let db = Self { pool };
        db.init().await?;
        Ok(db)
    }

    async fn init(&self) -> Result<()> {
        let mut conn = self.pool.acquire().await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                email TEXT NOT NULL UNIQUE,
                role TEXT NOT NULL DEFAULT 'user',
                auth_provider TEXT NOT NULL DEFAULT 'password',
                current_plan_id TEXT,
                royalty_percent_override REAL,
                broker_connected INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create users table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS subscription_plans (
                id TEXT PRIMARY KEY,
                code TEXT NOT NULL UNIQUE,
                name TEXT NOT NULL,
                monthly_price_cents INTEGER NOT NULL,
                default_royalty_percent REAL NOT NULL,
                platform_fee_percent REAL,
                is_creator_plan INTEGER NOT NULL DEFAULT 0,
                max_group_size INTEGER NOT NULL DEFAULT 10
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create subscription_plans table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS admin_settings (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                platform_fee_percent REAL NOT NULL,
                creator_fee_percent REAL NOT NULL,
                pnl_fee_threshold_cents INTEGER NOT NULL,
                grace_months INTEGER NOT NULL,
                updated_at TEXT NOT NULL
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create admin_settings table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS strategies (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                name TEXT NOT NULL,
                asset_type TEXT NOT NULL,
                parameters_json TEXT NOT NULL,
                ruleset_json TEXT NOT NULL,
                score REAL NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'experiment',
                evolution_attempts INTEGER NOT NULL DEFAULT 0,
                is_active INTEGER NOT NULL DEFAULT 1,
                last_backtest_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_strategies_owner ON strategies (owner_id);
            CREATE INDEX IF NOT EXISTS idx_strategies_status ON strategies (status, is_active);
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create strategies table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS strategy_lineage (
                id TEXT PRIMARY KEY,
                parent_id TEXT NOT NULL,
                child_id TEXT NOT NULL,
                mutation_kind TEXT NOT NULL,
                similarity REAL,
                created_by TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_lineage_child ON strategy_lineage (child_id);
            CREATE INDEX IF NOT EXISTS idx_lineage_parent ON strategy_lineage (parent_id);
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create strategy_lineage table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS strategy_backtests (
                id TEXT PRIMARY KEY,
                strategy_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                timeframe TEXT NOT NULL,
                window_start TEXT NOT NULL,
                window_end TEXT NOT NULL,
                total_return REAL NOT NULL,
                win_rate REAL NOT NULL,
                max_drawdown REAL NOT NULL,
                avg_pnl REAL NOT NULL,
                total_trades INTEGER NOT NULL,
                sharpe REAL,
                train_sharpe REAL,
                test_sharpe REAL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_backtests_strategy
            ON strategy_backtests (strategy_id, created_at);
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create strategy_backtests table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS trades (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                asset_type TEXT NOT NULL,
                side TEXT NOT NULL,
                quantity TEXT NOT NULL,
                entry_price TEXT NOT NULL,
                exit_price TEXT,
                status TEXT NOT NULL,
                mode TEXT NOT NULL,
                source TEXT NOT NULL,
                strategy_id TEXT,
                opened_at TEXT NOT NULL,
                closed_at TEXT,
                realized_pnl TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_trades_user ON trades (user_id, status, mode);
            CREATE INDEX IF NOT EXISTS idx_trades_symbol ON trades (user_id, symbol);
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create trades table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS paper_accounts (
                user_id TEXT PRIMARY KEY,
                balance TEXT NOT NULL,
                starting_balance TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create paper_accounts table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS royalty_ledger (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                strategy_id TEXT NOT NULL,
                trade_id TEXT NOT NULL,
                royalty_cents INTEGER NOT NULL,
                royalty_rate REAL NOT NULL,
                platform_fee_cents INTEGER NOT NULL,
                platform_fee_rate REAL NOT NULL,
                net_cents INTEGER NOT NULL,
                trade_profit_cents INTEGER NOT NULL,
                paid_at TEXT,
                payment_id TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_royalty_user
            ON royalty_ledger (user_id, created_at);
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create royalty_ledger table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS royalty_payments (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                period TEXT NOT NULL,
                amount_cents INTEGER NOT NULL,
                state TEXT NOT NULL,
                gateway_ref TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_payments_user
            ON royalty_payments (user_id, period);
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create royalty_payments table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS groups (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                name TEXT NOT NULL,
                join_code TEXT NOT NULL UNIQUE,
                created_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS group_members (
                group_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                joined_at TEXT NOT NULL,
                PRIMARY KEY (group_id, user_id)
            );
            CREATE TABLE IF NOT EXISTS group_messages (
                id TEXT PRIMARY KEY,
                group_id TEXT NOT NULL,
                sender_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                ciphertext BLOB NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_messages_group
            ON group_messages (group_id, created_at);
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create group tables")?;

        info!("Database schema initialized.");
        Ok(())
    }
}
