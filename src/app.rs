//! Builds the runtime pieces (store, embedder, tools, model) from config.
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use crate::chat::{Orchestrator, OrchestratorSettings};
use crate::config::{Config, EmbeddingBackend};
use crate::db::Store;
use crate::embedder::mock::MockEmbedder;
use crate::embedder::openai::HttpEmbedder;
use crate::embedder::{Embedder, EmbeddingGenerator};
use crate::llm::LanguageModel;
use crate::llm::openai::ChatCompletionsModel;
use crate::retrieval::Retriever;
use crate::tools::{Dispatcher, ToolContext};

pub struct App {
    pub config: Config,
    pub store: Store,
    pub embeddings: EmbeddingGenerator,
    pub dispatcher: Dispatcher,
}

impl App {
    /// Open the store and wire the tool layer. No model is contacted.
    pub fn build(config: Config) -> Result<Self> {
        config.validate().context("invalid configuration")?;

        let store = Store::open(&config.db_path, config.db_pool_size)
            .with_context(|| format!("failed to open database {}", config.db_path))?;
        let embeddings = EmbeddingGenerator::new(build_embedder(&config)?, config.embedding.chunk_size);
        let retriever = Retriever::new(store.clone(), embeddings.clone());
        let dispatcher = Dispatcher::new(
            ToolContext::new(retriever, config.domains.clone()),
            config.tool_timeout(),
        );

        Ok(Self {
            config,
            store,
            embeddings,
            dispatcher,
        })
    }

    pub fn orchestrator(&self) -> Result<Orchestrator> {
        Ok(Orchestrator::new(
            build_model(&self.config)?,
            self.dispatcher.clone(),
            OrchestratorSettings::from(&self.config),
        ))
    }
}

pub fn build_embedder(config: &Config) -> Result<Arc<dyn Embedder>> {
    let e = &config.embedding;
    Ok(match e.backend {
        EmbeddingBackend::Http => {
            let timeout = std::time::Duration::from_secs(e.timeout_secs);
            Arc::new(
                HttpEmbedder::new(&e.base_url, &e.model, config.embedding_api_key(), e.dimensions, timeout)
                    .context("failed to create embedding client")?,
            )
        }
        EmbeddingBackend::Mock => {
            info!("using mock embedder ({} dims)", e.dimensions);
            Arc::new(MockEmbedder::new(e.dimensions))
        }
    })
}

pub fn build_model(config: &Config) -> Result<Arc<dyn LanguageModel>> {
    let api_key = config.model_api_key();
    if config.provider.requires_api_key() && api_key.is_none() {
        anyhow::bail!(
            "provider {:?} needs an API key in ${}",
            config.provider,
            config.model.api_key_env
        );
    }
    let base_url = config.model_base_url();
    info!(provider = ?config.provider, model = %config.model.name, %base_url, "language model configured");
    let model = ChatCompletionsModel::new(&base_url, &config.model.name, api_key, config.model.temperature)
        .context("failed to create model client")?;
    Ok(Arc::new(model))
}
