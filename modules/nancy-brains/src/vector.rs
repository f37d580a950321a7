use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use pgvector::Vector;
use sha2::{Digest, Sha256};
use sqlx::{PgPool, Row};
use tracing::debug;

use nancy_common::Chunk;

use crate::error::BrainError;
use crate::predicate::Predicate;
use crate::traits::{SearchHit, TextEmbedder, VectorBrain};

/// Vector brain backed by Postgres + pgvector. Chunks are keyed on
/// `(packet_id, ordinal)`; the collection carries a model tag and refuses
/// searches under a different embedding model.
pub struct PgVectorBrain {
    pool: PgPool,
    embedder: Arc<dyn TextEmbedder>,
}

impl PgVectorBrain {
    pub fn new(pool: PgPool, embedder: Arc<dyn TextEmbedder>) -> Self {
        Self { pool, embedder }
    }

    /// Create tables and stamp the collection's model tag. Fails with
    /// `ModelMismatch` if the store was written under another model.
    pub async fn migrate(&self) -> Result<(), BrainError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS packet_chunks (
                packet_id TEXT NOT NULL,
                ordinal INT NOT NULL,
                chunk_text TEXT NOT NULL,
                metadata JSONB NOT NULL DEFAULT '{}',
                embedding vector,
                PRIMARY KEY (packet_id, ordinal)
            )",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS vector_collection (
                singleton INT PRIMARY KEY DEFAULT 1,
                model_version TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "INSERT INTO vector_collection (singleton, model_version)
             VALUES (1, $1)
             ON CONFLICT (singleton) DO NOTHING",
        )
        .bind(self.embedder.model_id())
        .execute(&self.pool)
        .await?;
        self.check_model_tag().await
    }

    async fn check_model_tag(&self) -> Result<(), BrainError> {
        let stored: Option<(String,)> =
            sqlx::query_as("SELECT model_version FROM vector_collection WHERE singleton = 1")
                .fetch_optional(&self.pool)
                .await?;
        match stored {
            Some((stored,)) if stored != self.embedder.model_id() => {
                Err(BrainError::ModelMismatch {
                    stored,
                    configured: self.embedder.model_id().to_string(),
                })
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl VectorBrain for PgVectorBrain {
    async fn upsert_chunks(
        &self,
        packet_id: &str,
        chunks: &[Chunk],
        metadata: &BTreeMap<String, serde_json::Value>,
    ) -> Result<(), BrainError> {
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let embeddings = self.embedder.embed_batch(&texts).await?;
        let metadata_json = serde_json::Value::Object(
            metadata
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        );

        // Replace-then-insert keeps re-ingestion from leaving stale ordinals
        // behind when a packet shrinks.
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM packet_chunks WHERE packet_id = $1")
            .bind(packet_id)
            .execute(&mut *tx)
            .await?;
        for (chunk, embedding) in chunks.iter().zip(embeddings) {
            sqlx::query(
                "INSERT INTO packet_chunks (packet_id, ordinal, chunk_text, metadata, embedding)
                 VALUES ($1, $2, $3, $4, $5)
                 ON CONFLICT (packet_id, ordinal) DO UPDATE
                 SET chunk_text = EXCLUDED.chunk_text,
                     metadata = EXCLUDED.metadata,
                     embedding = EXCLUDED.embedding",
            )
            .bind(packet_id)
            .bind(chunk.ordinal as i32)
            .bind(&chunk.text)
            .bind(&metadata_json)
            .bind(Vector::from(embedding))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        debug!(packet_id, chunks = chunks.len(), "Upserted vector chunks");
        Ok(())
    }

    async fn semantic_search(
        &self,
        query_text: &str,
        k: usize,
        filter: Option<&Predicate>,
    ) -> Result<Vec<SearchHit>, BrainError> {
        self.check_model_tag().await?;

        let query_embedding = Vector::from(self.embedder.embed(query_text).await?);

        let mut binds: Vec<String> = Vec::new();
        let where_clause = match filter {
            Some(pred) if pred.is_conjunctive_filter() => {
                // Predicate binds start at $3; $1/$2 are embedding and limit.
                let mut offset_binds = Vec::new();
                let frag = pred.to_sql("metadata", &mut offset_binds);
                let frag = renumber_placeholders(&frag, 2);
                binds = offset_binds;
                format!("WHERE {frag}")
            }
            Some(_) => "WHERE FALSE".to_string(),
            None => String::new(),
        };

        let sql = format!(
            "SELECT packet_id, ordinal, chunk_text, (embedding <=> $1) AS distance
             FROM packet_chunks
             {where_clause}
             ORDER BY embedding <=> $1
             LIMIT $2",
        );

        let mut query = sqlx::query(&sql).bind(&query_embedding).bind(k as i64);
        for bind in &binds {
            query = query.bind(bind);
        }

        let rows = query.fetch_all(&self.pool).await?;
        let mut hits = Vec::with_capacity(rows.len());
        for row in rows {
            hits.push(SearchHit {
                packet_id: row.try_get("packet_id").map_err(BrainError::from)?,
                ordinal: row.try_get::<i32, _>("ordinal").map_err(BrainError::from)? as u32,
                text: row.try_get("chunk_text").map_err(BrainError::from)?,
                distance: row.try_get("distance").map_err(BrainError::from)?,
            });
        }
        Ok(hits)
    }

    async fn delete(&self, packet_id: &str) -> Result<(), BrainError> {
        sqlx::query("DELETE FROM packet_chunks WHERE packet_id = $1")
            .bind(packet_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// Shift `$n` placeholders in a rendered fragment by `offset`.
fn renumber_placeholders(fragment: &str, offset: usize) -> String {
    let mut out = String::with_capacity(fragment.len());
    let mut chars = fragment.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '$' && chars.peek().is_some_and(|n| n.is_ascii_digit()) {
            let mut digits = String::new();
            while chars.peek().is_some_and(|n| n.is_ascii_digit()) {
                digits.push(chars.next().unwrap());
            }
            let n: usize = digits.parse().unwrap_or(0);
            out.push('$');
            out.push_str(&(n + offset).to_string());
        } else {
            out.push(c);
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Embedding cache
// ---------------------------------------------------------------------------

/// Get-or-compute embedding cache backed by Postgres.
///
/// Keyed by SHA-256 of (model_version + input_text). On cache hit, returns
/// the stored embedding instantly. On cache miss, computes via the
/// underlying `TextEmbedder`, stores the result, and returns it.
pub struct CachedEmbedder {
    pool: PgPool,
    inner: Arc<dyn TextEmbedder>,
}

impl CachedEmbedder {
    pub fn new(pool: PgPool, inner: Arc<dyn TextEmbedder>) -> Self {
        Self { pool, inner }
    }

    pub async fn migrate(&self) -> Result<(), BrainError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS embedding_cache (
                input_hash TEXT PRIMARY KEY,
                model_version TEXT NOT NULL,
                embedding vector NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    fn hash_key(&self, text: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.inner.model_id().as_bytes());
        hasher.update(text.as_bytes());
        hex::encode(hasher.finalize())
    }

    async fn lookup(&self, hash: &str) -> Result<Option<Vec<f32>>, BrainError> {
        let cached: Option<(Vector,)> =
            sqlx::query_as("SELECT embedding FROM embedding_cache WHERE input_hash = $1")
                .bind(hash)
                .fetch_optional(&self.pool)
                .await?;
        Ok(cached.map(|(v,)| v.to_vec()))
    }

    async fn store(&self, hash: &str, embedding: &[f32]) -> Result<(), BrainError> {
        sqlx::query(
            "INSERT INTO embedding_cache (input_hash, model_version, embedding)
             VALUES ($1, $2, $3)
             ON CONFLICT (input_hash) DO NOTHING",
        )
        .bind(hash)
        .bind(self.inner.model_id())
        .bind(Vector::from(embedding.to_vec()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl TextEmbedder for CachedEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, BrainError> {
        let hash = self.hash_key(text);
        if let Some(embedding) = self.lookup(&hash).await? {
            return Ok(embedding);
        }
        let embedding = self.inner.embed(text).await?;
        self.store(&hash, &embedding).await?;
        Ok(embedding)
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, BrainError> {
        // Only the misses go to the provider, in one batch call.
        let mut out: Vec<Option<Vec<f32>>> = Vec::with_capacity(texts.len());
        let mut missing: Vec<(usize, String, String)> = Vec::new(); // (slot, hash, text)
        for (i, text) in texts.iter().enumerate() {
            let hash = self.hash_key(text);
            match self.lookup(&hash).await? {
                Some(embedding) => out.push(Some(embedding)),
                None => {
                    out.push(None);
                    missing.push((i, hash, text.clone()));
                }
            }
        }
        if !missing.is_empty() {
            let texts_to_embed: Vec<String> = missing.iter().map(|(_, _, t)| t.clone()).collect();
            let computed = self.inner.embed_batch(&texts_to_embed).await?;
            debug!(count = computed.len(), "Warmed embedding cache");
            for ((slot, hash, _), embedding) in missing.iter().zip(computed) {
                self.store(hash, &embedding).await?;
                out[*slot] = Some(embedding);
            }
        }
        Ok(out.into_iter().flatten().collect())
    }

    fn model_id(&self) -> &str {
        self.inner.model_id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renumber_shifts_only_placeholders() {
        let frag = "(metadata ->> 'a' >= $1 AND metadata ->> 'a' <= $2) OR x = $10";
        assert_eq!(
            renumber_placeholders(frag, 2),
            "(metadata ->> 'a' >= $3 AND metadata ->> 'a' <= $4) OR x = $12"
        );
        assert_eq!(renumber_placeholders("no binds, $ loose", 5), "no binds, $ loose");
    }
}
