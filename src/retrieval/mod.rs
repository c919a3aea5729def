//! Domain retrieval behind one entry point.
//!
//! Each domain names its [`RelevancePolicy`] explicitly in configuration.
//! Cosine similarity and the broker directory's tiered string match are
//! different scoring conventions and are kept apart on purpose.
pub mod tiered;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::db::models::{CategoryMatch, Record, RetrievalResult};
use crate::db::{Store, StoreError};
use crate::embedder::EmbeddingGenerator;
use tiered::RankedRecord;

fn default_threshold() -> f64 {
    0.5
}

fn default_limit() -> usize {
    5
}

fn default_category_limit() -> usize {
    3
}

fn default_children_per_category() -> usize {
    10
}

/// How relevance is decided for one domain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum RelevancePolicy {
    /// Cosine similarity strictly above `threshold`.
    Cosine {
        #[serde(default = "default_threshold")]
        threshold: f64,
        #[serde(default = "default_limit")]
        limit: usize,
    },
    /// Newest records first; no vectors involved.
    Recency { limit: usize },
    /// Cosine match on categories, then children by exact parent reference.
    Hierarchical {
        child_domain: String,
        #[serde(default = "default_threshold")]
        threshold: f64,
        #[serde(default = "default_category_limit")]
        category_limit: usize,
        #[serde(default = "default_children_per_category")]
        children_per_category: usize,
    },
    /// Exact/partial string match tiers over two payload fields.
    TieredMatch {
        primary_field: String,
        secondary_field: String,
        #[serde(default = "default_limit")]
        limit: usize,
    },
}

impl RelevancePolicy {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Cosine { .. } => "cosine",
            Self::Recency { .. } => "recency",
            Self::Hierarchical { .. } => "hierarchical",
            Self::TieredMatch { .. } => "tiered_match",
        }
    }

    /// Whether the policy needs a query text.
    pub fn needs_query(&self) -> bool {
        !matches!(self, Self::Recency { .. })
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let threshold_ok = |t: f64| (-1.0..=1.0).contains(&t);
        match self {
            Self::Cosine { threshold, limit } => {
                anyhow::ensure!(threshold_ok(*threshold), "threshold must be within [-1, 1]");
                anyhow::ensure!(*limit > 0, "limit must be positive");
            }
            Self::Recency { limit } => anyhow::ensure!(*limit > 0, "limit must be positive"),
            Self::Hierarchical {
                child_domain,
                threshold,
                category_limit,
                children_per_category,
            } => {
                anyhow::ensure!(!child_domain.is_empty(), "child_domain is required");
                anyhow::ensure!(threshold_ok(*threshold), "threshold must be within [-1, 1]");
                anyhow::ensure!(*category_limit > 0, "category_limit must be positive");
                anyhow::ensure!(
                    *children_per_category > 0,
                    "children_per_category must be positive"
                );
            }
            Self::TieredMatch {
                primary_field,
                secondary_field,
                limit,
            } => {
                anyhow::ensure!(
                    !primary_field.is_empty() && !secondary_field.is_empty(),
                    "match fields are required"
                );
                anyhow::ensure!(*limit > 0, "limit must be positive");
            }
        }
        Ok(())
    }
}

#[derive(Error, Debug)]
pub enum RetrievalError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("store task failed: {0}")]
    Task(String),
}

/// Records retrieved for one domain, shaped by the policy that produced them.
#[derive(Debug, Clone)]
pub enum Retrieved {
    Similar(Vec<RetrievalResult>),
    Recent(Vec<Record>),
    Categories(Vec<CategoryMatch>),
    Ranked(Vec<RankedRecord>),
}

impl Retrieved {
    pub fn len(&self) -> usize {
        match self {
            Self::Similar(r) => r.len(),
            Self::Recent(r) => r.len(),
            Self::Categories(r) => r.len(),
            Self::Ranked(r) => r.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Items as JSON for a tool result.
    pub fn into_items(self) -> Vec<Value> {
        fn to_values<T: Serialize>(items: Vec<T>) -> Vec<Value> {
            items
                .into_iter()
                .filter_map(|i| serde_json::to_value(i).ok())
                .collect()
        }
        match self {
            Self::Similar(r) => to_values(r),
            Self::Recent(r) => to_values(r),
            Self::Categories(r) => to_values(r),
            Self::Ranked(r) => to_values(r),
        }
    }
}

/// Read side shared by all tool handlers: store plus query embedding.
#[derive(Clone)]
pub struct Retriever {
    store: Store,
    embeddings: EmbeddingGenerator,
}

impl Retriever {
    pub fn new(store: Store, embeddings: EmbeddingGenerator) -> Self {
        Self { store, embeddings }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Retrieve from `domain` under `policy`.
    ///
    /// `limit` may only narrow the policy's own limit. An embedding failure
    /// yields an empty result instead of an error.
    pub async fn retrieve(
        &self,
        domain: &str,
        policy: &RelevancePolicy,
        query: &str,
        limit: Option<usize>,
    ) -> Result<Retrieved, RetrievalError> {
        let narrow = |max: usize| limit.map_or(max, |l| l.clamp(1, max));
        let store = self.store.clone();
        let domain_owned = domain.to_string();

        let retrieved = match policy {
            RelevancePolicy::Recency { limit: max } => {
                let n = narrow(*max);
                Retrieved::Recent(
                    blocking(move || store.fetch_recent(&domain_owned, n)).await?,
                )
            }
            RelevancePolicy::TieredMatch {
                primary_field,
                secondary_field,
                limit: max,
            } => {
                let records = blocking(move || store.fetch_all(&domain_owned)).await?;
                Retrieved::Ranked(tiered::rank(
                    records,
                    primary_field,
                    secondary_field,
                    query,
                    narrow(*max),
                ))
            }
            RelevancePolicy::Cosine { threshold, limit: max } => {
                let Some(vector) = self.query_vector(domain, query).await else {
                    return Ok(Retrieved::Similar(Vec::new()));
                };
                let (threshold, n) = (*threshold, narrow(*max));
                Retrieved::Similar(
                    blocking(move || store.search(&domain_owned, &vector, threshold, n)).await?,
                )
            }
            RelevancePolicy::Hierarchical {
                child_domain,
                threshold,
                category_limit,
                children_per_category,
            } => {
                let Some(vector) = self.query_vector(domain, query).await else {
                    return Ok(Retrieved::Categories(Vec::new()));
                };
                let child_domain = child_domain.clone();
                let (threshold, categories, children) =
                    (*threshold, narrow(*category_limit), *children_per_category);
                Retrieved::Categories(
                    blocking(move || {
                        store.search_hierarchical(
                            &domain_owned,
                            &child_domain,
                            &vector,
                            threshold,
                            categories,
                            children,
                        )
                    })
                    .await?,
                )
            }
        };

        debug!(domain, policy = policy.name(), hits = retrieved.len(), "retrieval done");
        Ok(retrieved)
    }

    async fn query_vector(&self, domain: &str, query: &str) -> Option<Vec<f32>> {
        match self.embeddings.embed_query(query).await {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(domain, "query embedding failed, treating as no results: {e}");
                None
            }
        }
    }
}

async fn blocking<T, F>(f: F) -> Result<T, RetrievalError>
where
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| RetrievalError::Task(e.to_string()))?
        .map_err(RetrievalError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::NewRecord;
    use crate::embedder::mock::MockEmbedder;
    use serde_json::json;
    use std::sync::Arc;

    fn retriever(embedder: MockEmbedder) -> Retriever {
        Retriever::new(
            Store::open_in_memory().unwrap(),
            EmbeddingGenerator::new(Arc::new(embedder), 500),
        )
    }

    fn cosine() -> RelevancePolicy {
        RelevancePolicy::Cosine {
            threshold: 0.5,
            limit: 5,
        }
    }

    #[tokio::test]
    async fn test_cosine_policy_uses_query_embedding() {
        let r = retriever(MockEmbedder::new(2).with_vector("parkering", vec![1.0, 0.0]));
        r.store()
            .insert("faq", &NewRecord::new("p", json!({"a": "Parkering ingår"})), Some(&[0.9, 0.1]))
            .unwrap();
        r.store()
            .insert("faq", &NewRecord::new("q", json!({"a": "Annat"})), Some(&[0.0, 1.0]))
            .unwrap();

        let got = r.retrieve("faq", &cosine(), "parkering", None).await.unwrap();
        assert_eq!(got.len(), 1);
        let items = got.into_items();
        assert_eq!(items[0]["id"], "p");
        assert!(items[0]["similarity"].as_f64().unwrap() > 0.5);
    }

    #[tokio::test]
    async fn test_embedding_failure_yields_empty() {
        let r = retriever(MockEmbedder::failing(2));
        r.store()
            .insert("faq", &NewRecord::new("p", json!({})), Some(&[1.0, 0.0]))
            .unwrap();
        let got = r.retrieve("faq", &cosine(), "vad som helst", None).await.unwrap();
        assert!(got.is_empty());
    }

    #[tokio::test]
    async fn test_limit_only_narrows() {
        let r = retriever(MockEmbedder::new(2));
        for i in 0..8 {
            r.store()
                .insert("rates", &NewRecord::new(format!("r{i}"), json!({"i": i})), None)
                .unwrap();
        }
        let policy = RelevancePolicy::Recency { limit: 5 };
        assert_eq!(r.retrieve("rates", &policy, "", Some(100)).await.unwrap().len(), 5);
        assert_eq!(r.retrieve("rates", &policy, "", Some(2)).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_store_error_surfaces() {
        let r = retriever(MockEmbedder::new(4));
        r.store()
            .insert("schools", &NewRecord::new("s", json!({})), Some(&[1.0, 0.0, 0.0]))
            .unwrap();
        let err = r.retrieve("schools", &cosine(), "skola", None).await.unwrap_err();
        assert!(matches!(err, RetrievalError::Store(StoreError::DimensionMismatch { .. })));
    }

    #[test]
    fn test_policy_serde_tagged() {
        let p: RelevancePolicy =
            serde_json::from_str(r#"{"policy": "cosine", "threshold": 0.6}"#).unwrap();
        assert_eq!(
            p,
            RelevancePolicy::Cosine {
                threshold: 0.6,
                limit: 5
            }
        );
        let p: RelevancePolicy = serde_json::from_str(
            r#"{"policy": "tiered_match", "primary_field": "county", "secondary_field": "locality"}"#,
        )
        .unwrap();
        assert_eq!(p.name(), "tiered_match");
    }

    #[test]
    fn test_policy_validate() {
        assert!(cosine().validate().is_ok());
        let bad = RelevancePolicy::Cosine {
            threshold: 1.5,
            limit: 5,
        };
        assert!(bad.validate().is_err());
        assert!(RelevancePolicy::Recency { limit: 0 }.validate().is_err());
    }
}
