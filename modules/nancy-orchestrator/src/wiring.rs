//! Production wiring: from environment configuration to a connected
//! `BrainSet` and a tuned `NancyConfig`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;

use llm_client::{EmbedModel, LlmHttpClient};
use nancy_brains::{
    BoltGraphBrain, BrainError, BrainSet, CachedEmbedder, GraphClient, LlmLinguistic,
    PgAnalyticalBrain, PgVectorBrain, TextEmbedder,
};
use nancy_common::Config;
use nancy_host::HostConfig;
use nancy_planner::PlannerConfig;
use nancy_router::RouterConfig;

use crate::facade::NancyConfig;

/// Adapter from the HTTP embedding client to the brain-facing trait.
struct HttpEmbedder {
    client: Arc<LlmHttpClient>,
}

#[async_trait::async_trait]
impl TextEmbedder for HttpEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, BrainError> {
        Ok(self.client.embed(text).await?)
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, BrainError> {
        Ok(self.client.embed_batch(texts).await?)
    }

    fn model_id(&self) -> &str {
        self.client.model_id()
    }
}

/// Connect every backend, run migrations, and hand back the four brains.
pub async fn connect_brains(config: &Config) -> Result<BrainSet> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.postgres_url)
        .await
        .context("Failed to connect to Postgres")?;

    let llm = Arc::new(LlmHttpClient::new(
        &config.llm_api_key,
        &config.llm_base_url,
        &config.chat_model,
        &config.embedding_model,
    ));

    let embedder: Arc<dyn TextEmbedder> = Arc::new(HttpEmbedder { client: llm.clone() });
    let cached = Arc::new(CachedEmbedder::new(pool.clone(), embedder));
    cached.migrate().await.context("embedding cache migration")?;

    let vector = PgVectorBrain::new(pool.clone(), cached.clone());
    vector.migrate().await.context("vector store migration")?;

    let analytical = PgAnalyticalBrain::new(pool.clone());
    analytical
        .migrate()
        .await
        .context("analytical store migration")?;

    let graph_client =
        GraphClient::connect(&config.graph_uri, &config.graph_user, &config.graph_password)
            .await
            .context("Failed to connect to graph store")?;
    let graph = BoltGraphBrain::new(graph_client);
    graph.migrate().await.context("graph store migration")?;

    Ok(BrainSet {
        vector: Arc::new(vector),
        analytical: Arc::new(analytical),
        graph: Arc::new(graph),
        linguistic: Arc::new(LlmLinguistic::new(llm)),
    })
}

/// Map the flat environment config onto the component configs.
pub fn nancy_config(config: &Config) -> NancyConfig {
    NancyConfig {
        queue_capacity: config.queue_capacity,
        ingest_workers: config.ingest_workers,
        query_concurrency: config.query_concurrency,
        query_acquire_timeout: Duration::from_secs(5),
        router: RouterConfig {
            max_retries: config.router_max_retries,
            base_delay: Duration::from_millis(config.router_base_delay_ms),
            ..Default::default()
        },
        planner: PlannerConfig {
            query_deadline: Duration::from_millis(config.query_deadline_ms),
            adapter_deadline: Duration::from_millis(config.adapter_deadline_ms),
            ..Default::default()
        },
        host: HostConfig {
            unhealthy_after: config.plugin_unhealthy_after,
            restart_budget: config.plugin_restart_budget,
            restart_window: Duration::from_secs(config.plugin_restart_window_secs),
            ..Default::default()
        },
        sweep_interval: Duration::from_secs(config.sweep_interval_secs),
        sweep_max_attempts: config.sweep_max_attempts,
        health_check_interval: Duration::from_secs(config.health_check_interval_secs),
        file_ingest_deadline: Duration::from_secs(300),
    }
}
