use anyhow::Result;
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use std::str::FromStr;

use crate::domain::repositories::UserRepository;
use crate::domain::user::{Role, User};

pub struct SqliteUserRepository {
    pool: SqlitePool,
}

impl SqliteUserRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<User> {
        let role_str: String = row.try_get("role")?;
        Ok(User {
            id: row.try_get("id")?,
            email: row.try_get("email")?,
            role: Role::from_str(&role_str)?,
            auth_provider: row.try_get("auth_provider")?,
            current_plan_id: row.try_get("current_plan_id")?,
            royalty_percent_override: row.try_get("royalty_percent_override")?,
            broker_connected: row.try_get("broker_connected")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

#[async_trait]
impl UserRepository for SqliteUserRepository {
    async fn get(&self, user_id: &str) -> Result<Option<User>> {
        let row = sqlx::query("SELECT * FROM users WHERE id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::from_row).transpose()
    }

    async fn get_by_email(&self, email: &str) -> Result<Option<User>> {
        let row = sqlx::query("SELECT * FROM users WHERE email = ?")
            .bind(email.to_lowercase())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::from_row).transpose()
    }

    async fn upsert(&self, user: &User) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO users (id, email, role, auth_provider, current_plan_id,
                               royalty_percent_override, broker_connected, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                email = excluded.email,
                role = excluded.role,
                auth_provider = excluded.auth_provider,
                current_plan_id = excluded.current_plan_id,
                royalty_percent_override = excluded.royalty_percent_override,
                broker_connected = excluded.broker_connected
            "#,
        )
        .bind(&user.id)
        .bind(user.email.to_lowercase())
        .bind(user.role.to_string())
        .bind(&user.auth_provider)
        .bind(&user.current_plan_id)
        .bind(user.royalty_percent_override)
        .bind(user.broker_connected)
        .bind(user.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
