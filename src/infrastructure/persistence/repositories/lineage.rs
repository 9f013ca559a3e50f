use anyhow::Result;
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use std::str::FromStr;

use crate::domain::repositories::LineageRepository;
use crate::domain::strategy::{LineageEdge, MutationKind};

pub struct SqliteLineageRepository {
    pool: SqlitePool,
}

impl SqliteLineageRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<LineageEdge> {
        let kind: String = row.try_get("mutation_kind")?;
        Ok(LineageEdge {
            id: row.try_get("id")?,
            parent_id: row.try_get("parent_id")?,
            child_id: row.try_get("child_id")?,
            mutation_kind: MutationKind::from_str(&kind)?,
            similarity: row.try_get("similarity")?,
            created_by: row.try_get("created_by")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

#[async_trait]
impl LineageRepository for SqliteLineageRepository {
    async fn add_edge(&self, edge: &LineageEdge) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO strategy_lineage
                (id, parent_id, child_id, mutation_kind, similarity, created_by, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&edge.id)
        .bind(&edge.parent_id)
        .bind(&edge.child_id)
        .bind(edge.mutation_kind.to_string())
        .bind(edge.similarity)
        .bind(&edge.created_by)
        .bind(edge.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn parents_of(&self, child_id: &str) -> Result<Vec<LineageEdge>> {
        let rows = sqlx::query("SELECT * FROM strategy_lineage WHERE child_id = ?")
            .bind(child_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::from_row).collect()
    }

    async fn children_of(&self, parent_id: &str) -> Result<Vec<LineageEdge>> {
        let rows = sqlx::query("SELECT * FROM strategy_lineage WHERE parent_id = ?")
            .bind(parent_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::from_row).collect()
    }

    async fn count_children(&self, parent_id: &str) -> Result<u32> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM strategy_lineage WHERE parent_id = ?")
            .bind(parent_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get::<i64, _>("n")? as u32)
    }
}
