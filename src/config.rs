/// Configuration module for bostadsrag.
///
/// Handles loading, validating, and providing default configuration values.
/// The model provider can be switched at deploy time through
/// `BOSTADSRAG_MODEL_PROVIDER` without touching the file.
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::retrieval::RelevancePolicy;

pub const PROVIDER_ENV: &str = "BOSTADSRAG_MODEL_PROVIDER";

// ── Default value functions ──────────────────────────────────────────

fn default_db_path() -> String {
    "./bostadsrag.db".to_string()
}

fn default_pool_size() -> u32 {
    8
}

fn default_listen_addr() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_model_name() -> String {
    "gpt-4o-mini".to_string()
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_temperature() -> f32 {
    0.2
}

fn default_model_timeout() -> u64 {
    30
}

fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}

fn default_embedding_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_dimensions() -> usize {
    1536
}

fn default_embedding_timeout() -> u64 {
    10
}

fn default_chunk_size() -> usize {
    1000
}

fn default_max_steps() -> u8 {
    6
}

fn default_request_timeout() -> u64 {
    45
}

fn default_tool_timeout() -> u64 {
    15
}

fn default_channel_capacity() -> usize {
    32
}

fn cosine() -> RelevancePolicy {
    RelevancePolicy::Cosine {
        threshold: 0.5,
        limit: 5,
    }
}

fn default_interest_rates() -> RelevancePolicy {
    RelevancePolicy::Recency { limit: 50 }
}

fn default_land_registry() -> RelevancePolicy {
    RelevancePolicy::Hierarchical {
        child_domain: "land_registry_entries".to_string(),
        threshold: 0.5,
        category_limit: 3,
        children_per_category: 10,
    }
}

fn default_brokers() -> RelevancePolicy {
    RelevancePolicy::TieredMatch {
        primary_field: "county".to_string(),
        secondary_field: "locality".to_string(),
        limit: 5,
    }
}

// ── Config structs ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ModelProvider {
    #[default]
    OpenAi,
    Ollama,
}

impl ModelProvider {
    pub fn default_base_url(self) -> &'static str {
        match self {
            Self::OpenAi => "https://api.openai.com/v1",
            Self::Ollama => "http://localhost:11434/v1",
        }
    }

    pub fn requires_api_key(self) -> bool {
        matches!(self, Self::OpenAi)
    }
}

impl std::str::FromStr for ModelProvider {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "ollama" => Ok(Self::Ollama),
            other => anyhow::bail!("unknown model provider: {other}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingBackend {
    #[default]
    Http,
    /// Deterministic hash vectors; for offline development only.
    Mock,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    #[serde(default = "default_db_path")]
    pub db_path: String,

    #[serde(default = "default_pool_size")]
    pub db_pool_size: u32,

    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    #[serde(default)]
    pub provider: ModelProvider,

    #[serde(default)]
    pub model: ModelConfig,

    #[serde(default)]
    pub embedding: EmbeddingConfig,

    #[serde(default)]
    pub orchestration: OrchestrationConfig,

    #[serde(default)]
    pub domains: DomainsConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ModelConfig {
    #[serde(default = "default_model_name")]
    pub name: String,

    /// Overrides the provider's default endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_model_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default)]
    pub backend: EmbeddingBackend,

    #[serde(default = "default_embedding_model")]
    pub model: String,

    #[serde(default = "default_embedding_url")]
    pub base_url: String,

    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    #[serde(default = "default_dimensions")]
    pub dimensions: usize,

    #[serde(default = "default_embedding_timeout")]
    pub timeout_secs: u64,

    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct OrchestrationConfig {
    /// Hard ceiling on tool-call rounds per request.
    #[serde(default = "default_max_steps")]
    pub max_steps: u8,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_tool_timeout")]
    pub tool_timeout_secs: u64,

    /// Capacity of the event channel between loop and transport.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

/// One relevance policy per domain.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DomainsConfig {
    #[serde(default = "default_interest_rates")]
    pub interest_rates: RelevancePolicy,

    #[serde(default = "cosine")]
    pub traffic_situations: RelevancePolicy,

    #[serde(default = "cosine")]
    pub school_units: RelevancePolicy,

    /// Applies to the category domain; children live in `child_domain`.
    #[serde(default = "default_land_registry")]
    pub land_registry_categories: RelevancePolicy,

    #[serde(default = "cosine")]
    pub statistics: RelevancePolicy,

    #[serde(default = "default_brokers")]
    pub brokers: RelevancePolicy,

    #[serde(default = "cosine")]
    pub platform_faq: RelevancePolicy,
}

// ── Default impls ────────────────────────────────────────────────────

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            db_pool_size: default_pool_size(),
            listen_addr: default_listen_addr(),
            provider: ModelProvider::default(),
            model: ModelConfig::default(),
            embedding: EmbeddingConfig::default(),
            orchestration: OrchestrationConfig::default(),
            domains: DomainsConfig::default(),
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            name: default_model_name(),
            base_url: None,
            api_key_env: default_api_key_env(),
            temperature: default_temperature(),
            timeout_secs: default_model_timeout(),
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            backend: EmbeddingBackend::default(),
            model: default_embedding_model(),
            base_url: default_embedding_url(),
            api_key_env: default_api_key_env(),
            dimensions: default_dimensions(),
            timeout_secs: default_embedding_timeout(),
            chunk_size: default_chunk_size(),
        }
    }
}

impl Default for OrchestrationConfig {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            request_timeout_secs: default_request_timeout(),
            tool_timeout_secs: default_tool_timeout(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl Default for DomainsConfig {
    fn default() -> Self {
        Self {
            interest_rates: default_interest_rates(),
            traffic_situations: cosine(),
            school_units: cosine(),
            land_registry_categories: default_land_registry(),
            statistics: cosine(),
            brokers: default_brokers(),
            platform_faq: cosine(),
        }
    }
}

// ── Config implementation ────────────────────────────────────────────

impl Config {
    /// Load configuration from a JSON file.
    ///
    /// If `config_path` is empty, defaults to `"config.json"`. A missing
    /// default file is generated as a template. Environment overrides are
    /// applied last.
    pub fn load(config_path: &str) -> Result<Self> {
        let path = if config_path.is_empty() {
            "config.json"
        } else {
            config_path
        };

        let mut cfg = if !Path::new(path).exists() {
            info!("{path} not found, using defaults");
            let cfg = Self::default();
            if path == "config.json" {
                match cfg.save(path) {
                    Ok(()) => info!("Generated config template: {path}"),
                    Err(e) => warn!("Failed to generate config template: {e}"),
                }
            }
            cfg
        } else {
            let data = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config: {path}"))?;
            let cfg: Config = serde_json::from_str(&data)
                .with_context(|| format!("invalid JSON in {path}"))?;
            info!("Loaded configuration from {path}");
            cfg
        };

        cfg.apply_env_overrides(std::env::var(PROVIDER_ENV).ok().as_deref())?;
        Ok(cfg)
    }

    /// Apply the provider switch taken from the environment.
    pub fn apply_env_overrides(&mut self, provider: Option<&str>) -> Result<()> {
        if let Some(raw) = provider.filter(|p| !p.trim().is_empty()) {
            self.provider = raw
                .parse()
                .with_context(|| format!("invalid {PROVIDER_ENV}"))?;
            info!(provider = ?self.provider, "model provider overridden from environment");
        }
        Ok(())
    }

    /// Save configuration to a JSON file.
    pub fn save(&self, path: &str) -> Result<()> {
        let data = serde_json::to_string_pretty(self).context("failed to marshal config")?;
        std::fs::write(path, data).with_context(|| format!("failed to write config: {path}"))?;
        Ok(())
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.db_pool_size > 0, "db_pool_size must be positive");
        anyhow::ensure!(
            self.embedding.dimensions > 0,
            "embedding.dimensions must be positive"
        );
        anyhow::ensure!(
            self.embedding.chunk_size > 0,
            "embedding.chunk_size must be positive"
        );
        anyhow::ensure!(
            self.orchestration.max_steps > 0,
            "orchestration.max_steps must be positive"
        );
        anyhow::ensure!(
            self.orchestration.channel_capacity > 0,
            "orchestration.channel_capacity must be positive"
        );
        anyhow::ensure!(
            self.orchestration.request_timeout_secs > 0
                && self.orchestration.tool_timeout_secs > 0
                && self.model.timeout_secs > 0,
            "timeouts must be positive"
        );

        let d = &self.domains;
        for (name, policy) in [
            ("interest_rates", &d.interest_rates),
            ("traffic_situations", &d.traffic_situations),
            ("school_units", &d.school_units),
            ("land_registry_categories", &d.land_registry_categories),
            ("statistics", &d.statistics),
            ("brokers", &d.brokers),
            ("platform_faq", &d.platform_faq),
        ] {
            policy
                .validate()
                .with_context(|| format!("domains.{name}"))?;
        }
        Ok(())
    }

    pub fn model_base_url(&self) -> String {
        self.model
            .base_url
            .clone()
            .unwrap_or_else(|| self.provider.default_base_url().to_string())
    }

    /// API key for the model provider, read from the configured variable.
    pub fn model_api_key(&self) -> Option<String> {
        std::env::var(&self.model.api_key_env).ok()
    }

    pub fn embedding_api_key(&self) -> Option<String> {
        std::env::var(&self.embedding.api_key_env).ok()
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.orchestration.request_timeout_secs)
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.orchestration.tool_timeout_secs)
    }

    pub fn model_timeout(&self) -> Duration {
        Duration::from_secs(self.model.timeout_secs)
    }
}

// ── Tests ────────────────────────────────────────────────────────────
