use anyhow::Result;
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use std::str::FromStr;

use crate::domain::groups::{Group, GroupMember, GroupMessage, MessageKind};
use crate::domain::repositories::GroupRepository;

pub struct SqliteGroupRepository {
    pool: SqlitePool,
}

impl SqliteGroupRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn group_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Group> {
        Ok(Group {
            id: row.try_get("id")?,
            owner_id: row.try_get("owner_id")?,
            name: row.try_get("name")?,
            join_code: row.try_get("join_code")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn message_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<GroupMessage> {
        let kind: String = row.try_get("kind")?;
        Ok(GroupMessage {
            id: row.try_get("id")?,
            group_id: row.try_get("group_id")?,
            sender_id: row.try_get("sender_id")?,
            kind: MessageKind::from_str(&kind)?,
            ciphertext: row.try_get("ciphertext")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

#[async_trait]
impl GroupRepository for SqliteGroupRepository {
    async fn create(&self, group: &Group) -> Result<()> {
        sqlx::query(
            "INSERT INTO groups (id, owner_id, name, join_code, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&group.id)
        .bind(&group.owner_id)
        .bind(&group.name)
        .bind(&group.join_code)
        .bind(group.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, group_id: &str) -> Result<Option<Group>> {
        let row = sqlx::query("SELECT * FROM groups WHERE id = ?")
            .bind(group_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::group_from_row).transpose()
    }

    async fn get_by_join_code(&self, join_code: &str) -> Result<Option<Group>> {
        let row = sqlx::query("SELECT * FROM groups WHERE join_code = ?")
            .bind(join_code)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::group_from_row).transpose()
    }

    async fn delete(&self, group_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM group_messages WHERE group_id = ?")
            .bind(group_id)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM group_members WHERE group_id = ?")
            .bind(group_id)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM groups WHERE id = ?")
            .bind(group_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn add_member(&self, member: &GroupMember) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO group_members (group_id, user_id, joined_at)
            VALUES (?, ?, ?)
            ON CONFLICT(group_id, user_id) DO NOTHING
            "#,
        )
        .bind(&member.group_id)
        .bind(&member.user_id)
        .bind(member.joined_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove_member(&self, group_id: &str, user_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM group_members WHERE group_id = ? AND user_id = ?")
            .bind(group_id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn members(&self, group_id: &str) -> Result<Vec<GroupMember>> {
        let rows = sqlx::query("SELECT * FROM group_members WHERE group_id = ? ORDER BY joined_at")
            .bind(group_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                Ok(GroupMember {
                    group_id: row.try_get("group_id")?,
                    user_id: row.try_get("user_id")?,
                    joined_at: row.try_get("joined_at")?,
                })
            })
            .collect()
    }

    async fn add_message(&self, message: &GroupMessage) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO group_messages (id, group_id, sender_id, kind, ciphertext, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&message.id)
        .bind(&message.group_id)
        .bind(&message.sender_id)
        .bind(message.kind.to_string())
        .bind(&message.ciphertext)
        .bind(message.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn messages(&self, group_id: &str, limit: usize) -> Result<Vec<GroupMessage>> {
        let rows = sqlx::query(
            "SELECT * FROM group_messages WHERE group_id = ? ORDER BY created_at DESC LIMIT ?",
        )
        .bind(group_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        let mut messages: Vec<GroupMessage> = rows
            .iter()
            .map(Self::message_from_row)
            .collect::<Result<_>>()?;
        messages.reverse();
        Ok(messages)
    }

    async fn get_message(&self, message_id: &str) -> Result<Option<GroupMessage>> {
        let row = sqlx::query("SELECT * FROM group_messages WHERE id = ?")
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::message_from_row).transpose()
    }

    async fn delete_message(&self, message_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM group_messages WHERE id = ?")
            .bind(message_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
