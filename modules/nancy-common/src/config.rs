use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

/// Process configuration loaded from environment variables. Immutable for
/// the lifetime of the process; there is no hot reload.
#[derive(Debug, Clone)]
pub struct Config {
    // Postgres (analytical + vector brains)
    pub postgres_url: String,

    // Graph store (bolt protocol via neo4rs driver)
    pub graph_uri: String,
    pub graph_user: String,
    pub graph_password: String,

    // LLM provider (OpenAI-compatible wire format)
    pub llm_api_key: String,
    pub llm_base_url: String,
    pub chat_model: String,
    pub embedding_model: String,

    // Ingestion
    pub queue_capacity: usize,
    pub ingest_workers: usize,

    // Queries
    pub query_concurrency: usize,
    pub query_deadline_ms: u64,
    pub adapter_deadline_ms: u64,

    // Router retry policy
    pub router_max_retries: u32,
    pub router_base_delay_ms: u64,

    // Compensation sweeper
    pub sweep_interval_secs: u64,
    pub sweep_max_attempts: u32,

    // Plugin supervision
    pub health_check_interval_secs: u64,
    /// Consecutive health-check failures before a plugin turns unhealthy.
    pub plugin_unhealthy_after: u32,
    /// Restarts allowed within the window before termination.
    pub plugin_restart_budget: usize,
    pub plugin_restart_window_secs: u64,

    // Plugin manifest file; absent means core-only operation.
    pub plugin_manifest_path: Option<PathBuf>,
}

impl Config {
    /// Load configuration from environment variables.
    /// Panics with a clear message if required vars are missing.
    pub fn from_env() -> Self {
        Self {
            postgres_url: required_env("NANCY_POSTGRES_URL"),
            graph_uri: required_env("NANCY_GRAPH_URI"),
            graph_user: required_env("NANCY_GRAPH_USER"),
            graph_password: required_env("NANCY_GRAPH_PASSWORD"),
            llm_api_key: required_env("NANCY_LLM_API_KEY"),
            llm_base_url: env::var("NANCY_LLM_BASE_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
            chat_model: env::var("NANCY_CHAT_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string()),
            embedding_model: env::var("NANCY_EMBEDDING_MODEL")
                .unwrap_or_else(|_| "text-embedding-3-small".to_string()),
            queue_capacity: parsed_env("NANCY_QUEUE_CAPACITY", 256),
            ingest_workers: parsed_env("NANCY_INGEST_WORKERS", 4),
            query_concurrency: parsed_env("NANCY_QUERY_CONCURRENCY", 8),
            query_deadline_ms: parsed_env("NANCY_QUERY_DEADLINE_MS", 30_000),
            adapter_deadline_ms: parsed_env("NANCY_ADAPTER_DEADLINE_MS", 10_000),
            router_max_retries: parsed_env("NANCY_ROUTER_MAX_RETRIES", 3),
            router_base_delay_ms: parsed_env("NANCY_ROUTER_BASE_DELAY_MS", 100),
            sweep_interval_secs: parsed_env("NANCY_SWEEP_INTERVAL_SECS", 60),
            sweep_max_attempts: parsed_env("NANCY_SWEEP_MAX_ATTEMPTS", 5),
            health_check_interval_secs: parsed_env("NANCY_HEALTH_CHECK_INTERVAL_SECS", 30),
            plugin_unhealthy_after: parsed_env("NANCY_PLUGIN_UNHEALTHY_AFTER", 3),
            plugin_restart_budget: parsed_env("NANCY_PLUGIN_RESTART_BUDGET", 3),
            plugin_restart_window_secs: parsed_env("NANCY_PLUGIN_RESTART_WINDOW_SECS", 300),
            plugin_manifest_path: env::var("NANCY_PLUGIN_MANIFEST").ok().map(PathBuf::from),
        }
    }
}

fn required_env(name: &str) -> String {
    env::var(name).unwrap_or_else(|_| panic!("{name} must be set"))
}

fn parsed_env<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

// --- Plugin manifests ---

/// Launch description for one external plugin process.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PluginManifest {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Extensions without the leading dot, e.g. `["md", "txt"]`.
    pub supported_extensions: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct ManifestFile {
    #[serde(default, rename = "plugin")]
    plugins: Vec<PluginManifest>,
}

/// Load plugin manifests from a TOML file of `[[plugin]]` tables.
/// Disabled plugins are filtered out here.
pub fn load_manifests(path: &Path) -> Result<Vec<PluginManifest>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read plugin manifest: {}", path.display()))?;
    let file: ManifestFile = toml::from_str(&content)
        .with_context(|| format!("Failed to parse plugin manifest: {}", path.display()))?;
    Ok(file.plugins.into_iter().filter(|p| p.enabled).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_parses_and_filters_disabled() {
        let toml = r#"
            [[plugin]]
            name = "document_plugin"
            command = "python3"
            args = ["-m", "nancy_document_plugin"]
            supported_extensions = ["md", "txt"]

            [[plugin]]
            name = "legacy_plugin"
            command = "legacy"
            enabled = false
            supported_extensions = ["doc"]
        "#;
        let file: ManifestFile = toml::from_str(toml).unwrap();
        let enabled: Vec<_> = file.plugins.into_iter().filter(|p| p.enabled).collect();
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].name, "document_plugin");
        assert_eq!(enabled[0].supported_extensions, vec!["md", "txt"]);
    }

    #[test]
    fn manifest_rejects_unknown_fields() {
        let toml = r#"
            [[plugin]]
            name = "p"
            command = "c"
            supported_extensions = []
            restart_policy = "always"
        "#;
        assert!(toml::from_str::<ManifestFile>(toml).is_err());
    }
}
