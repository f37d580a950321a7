use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgPool, Row};
use tracing::debug;

use nancy_common::{BrainKind, ColumnSpec};

use crate::error::BrainError;
use crate::predicate::Predicate;
use crate::traits::{AnalyticalBrain, CompensationRow, PacketIndexRow};

/// Analytical brain backed by Postgres. Holds the per-packet index of
/// record, named tabular payloads, and the compensation bookkeeping the
/// router treats as the source of truth.
pub struct PgAnalyticalBrain {
    pool: PgPool,
}

impl PgAnalyticalBrain {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), BrainError> {
        for ddl in [
            "CREATE TABLE IF NOT EXISTS packets (
                packet_id TEXT PRIMARY KEY,
                plugin TEXT NOT NULL,
                content_type TEXT NOT NULL,
                created_at TIMESTAMPTZ,
                title TEXT,
                author TEXT,
                tags TEXT[] NOT NULL DEFAULT '{}',
                metadata JSONB NOT NULL DEFAULT '{}',
                packet_json JSONB NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS packet_tables (
                packet_id TEXT NOT NULL,
                table_name TEXT NOT NULL,
                columns JSONB NOT NULL,
                PRIMARY KEY (packet_id, table_name)
            )",
            "CREATE TABLE IF NOT EXISTS packet_rows (
                packet_id TEXT NOT NULL,
                table_name TEXT NOT NULL,
                row_ordinal INT NOT NULL,
                row JSONB NOT NULL,
                PRIMARY KEY (packet_id, table_name, row_ordinal)
            )",
            "CREATE TABLE IF NOT EXISTS pending_compensation (
                packet_id TEXT PRIMARY KEY,
                adapters TEXT[] NOT NULL,
                first_failed_at TIMESTAMPTZ NOT NULL,
                attempts INT NOT NULL DEFAULT 0
            )",
        ] {
            sqlx::query(ddl).execute(&self.pool).await?;
        }
        Ok(())
    }

    fn row_to_index(row: &sqlx::postgres::PgRow) -> Result<PacketIndexRow, BrainError> {
        let metadata_value: Value = row.try_get("metadata").map_err(BrainError::from)?;
        let metadata: BTreeMap<String, Value> = match metadata_value {
            Value::Object(map) => map.into_iter().collect(),
            _ => BTreeMap::new(),
        };
        Ok(PacketIndexRow {
            packet_id: row.try_get("packet_id").map_err(BrainError::from)?,
            plugin: row.try_get("plugin").map_err(BrainError::from)?,
            content_type: row.try_get("content_type").map_err(BrainError::from)?,
            created_at: row
                .try_get::<Option<DateTime<Utc>>, _>("created_at")
                .map_err(BrainError::from)?,
            title: row.try_get("title").map_err(BrainError::from)?,
            author: row.try_get("author").map_err(BrainError::from)?,
            tags: row.try_get("tags").map_err(BrainError::from)?,
            metadata,
        })
    }
}

#[async_trait]
impl AnalyticalBrain for PgAnalyticalBrain {
    async fn upsert_packet_row(
        &self,
        row: &PacketIndexRow,
        packet: &nancy_common::KnowledgePacket,
    ) -> Result<(), BrainError> {
        let metadata_json = Value::Object(
            row.metadata
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        );
        let packet_json = serde_json::to_value(packet)
            .map_err(|e| BrainError::Permanent(format!("packet serialization: {e}")))?;
        sqlx::query(
            "INSERT INTO packets (packet_id, plugin, content_type, created_at, title, author, tags, metadata, packet_json)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
             ON CONFLICT (packet_id) DO UPDATE
             SET plugin = EXCLUDED.plugin,
                 content_type = EXCLUDED.content_type,
                 created_at = EXCLUDED.created_at,
                 title = EXCLUDED.title,
                 author = EXCLUDED.author,
                 tags = EXCLUDED.tags,
                 metadata = EXCLUDED.metadata,
                 packet_json = EXCLUDED.packet_json",
        )
        .bind(&row.packet_id)
        .bind(&row.plugin)
        .bind(&row.content_type)
        .bind(row.created_at)
        .bind(&row.title)
        .bind(&row.author)
        .bind(&row.tags)
        .bind(&metadata_json)
        .bind(&packet_json)
        .execute(&self.pool)
        .await?;
        debug!(packet_id = %row.packet_id, "Upserted packet index row");
        Ok(())
    }

    async fn load_packet(
        &self,
        packet_id: &str,
    ) -> Result<Option<nancy_common::KnowledgePacket>, BrainError> {
        let row = sqlx::query("SELECT packet_json FROM packets WHERE packet_id = $1")
            .bind(packet_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let value: Value = row.try_get("packet_json").map_err(BrainError::from)?;
                let packet = serde_json::from_value(value)
                    .map_err(|e| BrainError::Permanent(format!("stored packet parse: {e}")))?;
                Ok(Some(packet))
            }
            None => Ok(None),
        }
    }

    async fn upsert_table(
        &self,
        packet_id: &str,
        table_name: &str,
        columns: &[ColumnSpec],
        rows: &[Vec<Value>],
    ) -> Result<(), BrainError> {
        let columns_json = serde_json::to_value(columns)
            .map_err(|e| BrainError::Permanent(format!("column spec serialization: {e}")))?;

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO packet_tables (packet_id, table_name, columns)
             VALUES ($1, $2, $3)
             ON CONFLICT (packet_id, table_name) DO UPDATE SET columns = EXCLUDED.columns",
        )
        .bind(packet_id)
        .bind(table_name)
        .bind(&columns_json)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM packet_rows WHERE packet_id = $1 AND table_name = $2")
            .bind(packet_id)
            .bind(table_name)
            .execute(&mut *tx)
            .await?;
        for (ordinal, row) in rows.iter().enumerate() {
            sqlx::query(
                "INSERT INTO packet_rows (packet_id, table_name, row_ordinal, row)
                 VALUES ($1, $2, $3, $4)",
            )
            .bind(packet_id)
            .bind(table_name)
            .bind(ordinal as i32)
            .bind(Value::Array(row.clone()))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn run_structured_query(
        &self,
        predicate: &Predicate,
    ) -> Result<Vec<PacketIndexRow>, BrainError> {
        let mut binds = Vec::new();
        let fragment = predicate.to_sql("metadata", &mut binds);
        let sql = format!(
            "SELECT packet_id, plugin, content_type, created_at, title, author, tags, metadata
             FROM packets WHERE {fragment} ORDER BY created_at DESC NULLS LAST",
        );
        let mut query = sqlx::query(&sql);
        for bind in &binds {
            query = query.bind(bind);
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_index).collect()
    }

    async fn count(&self, predicate: &Predicate) -> Result<u64, BrainError> {
        let mut binds = Vec::new();
        let fragment = predicate.to_sql("metadata", &mut binds);
        let sql = format!("SELECT COUNT(*) AS cnt FROM packets WHERE {fragment}");
        let mut query = sqlx::query(&sql);
        for bind in &binds {
            query = query.bind(bind);
        }
        let row = query.fetch_one(&self.pool).await?;
        let cnt: i64 = row.try_get("cnt").map_err(BrainError::from)?;
        Ok(cnt as u64)
    }

    async fn delete(&self, packet_id: &str) -> Result<(), BrainError> {
        let mut tx = self.pool.begin().await?;
        for sql in [
            "DELETE FROM packet_rows WHERE packet_id = $1",
            "DELETE FROM packet_tables WHERE packet_id = $1",
            "DELETE FROM pending_compensation WHERE packet_id = $1",
            "DELETE FROM packets WHERE packet_id = $1",
        ] {
            sqlx::query(sql).bind(packet_id).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn record_compensation(
        &self,
        packet_id: &str,
        failed: &[BrainKind],
    ) -> Result<(), BrainError> {
        let adapters: Vec<String> = failed.iter().map(|k| k.to_string()).collect();
        sqlx::query(
            "INSERT INTO pending_compensation (packet_id, adapters, first_failed_at, attempts)
             VALUES ($1, $2, $3, 0)
             ON CONFLICT (packet_id) DO UPDATE SET adapters = EXCLUDED.adapters",
        )
        .bind(packet_id)
        .bind(&adapters)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn clear_compensation(&self, packet_id: &str) -> Result<(), BrainError> {
        sqlx::query("DELETE FROM pending_compensation WHERE packet_id = $1")
            .bind(packet_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn bump_compensation_attempt(&self, packet_id: &str) -> Result<(), BrainError> {
        sqlx::query("UPDATE pending_compensation SET attempts = attempts + 1 WHERE packet_id = $1")
            .bind(packet_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn pending_compensation(&self) -> Result<Vec<CompensationRow>, BrainError> {
        let rows = sqlx::query(
            "SELECT packet_id, adapters, first_failed_at, attempts
             FROM pending_compensation ORDER BY first_failed_at",
        )
        .fetch_all(&self.pool)
        .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let adapters: Vec<String> = row.try_get("adapters").map_err(BrainError::from)?;
            out.push(CompensationRow {
                packet_id: row.try_get("packet_id").map_err(BrainError::from)?,
                adapters: adapters
                    .iter()
                    .filter_map(|s| s.parse().ok())
                    .collect(),
                first_failed_at: row.try_get("first_failed_at").map_err(BrainError::from)?,
                attempts: row.try_get::<i32, _>("attempts").map_err(BrainError::from)? as u32,
            });
        }
        Ok(out)
    }
}
