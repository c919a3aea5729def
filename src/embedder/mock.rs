/// Deterministic in-process embedder for tests and offline runs.
///
/// Vectors are derived from a hash of the text unless a fixed vector was
/// registered for that exact text.
use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use super::{Embedder, EmbeddingError, l2_normalize};

pub struct MockEmbedder {
    dimensions: usize,
    fixed: HashMap<String, Vec<f32>>,
    fail: bool,
    stall: bool,
    abandoned: Arc<AtomicUsize>,
}

/// Counts stalled calls whose future was dropped.
struct DropCounter(Arc<AtomicUsize>);

impl Drop for DropCounter {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

impl MockEmbedder {
    /// Create a new `MockEmbedder` with the given dimensionality.
    #[must_use]
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            fixed: HashMap::new(),
            fail: false,
            stall: false,
            abandoned: Arc::default(),
        }
    }

    /// An embedder whose every call fails as if the upstream were down.
    #[must_use]
    pub fn failing(dimensions: usize) -> Self {
        Self {
            fail: true,
            ..Self::new(dimensions)
        }
    }

    /// An embedder whose calls never complete.
    #[must_use]
    pub fn stalling(dimensions: usize) -> Self {
        Self {
            stall: true,
            ..Self::new(dimensions)
        }
    }

    /// Stalled calls that were dropped before finishing.
    pub fn abandoned_calls(&self) -> usize {
        self.abandoned.load(Ordering::SeqCst)
    }

    /// Pin the vector returned for `text`.
    #[must_use]
    pub fn with_vector(mut self, text: &str, vector: Vec<f32>) -> Self {
        self.fixed.insert(text.to_string(), vector);
        self
    }

    fn hashed(&self, text: &str) -> Vec<f32> {
        let mut hasher = DefaultHasher::new();
        text.hash(&mut hasher);
        let bytes = hasher.finish().to_le_bytes();

        let mut embedding: Vec<f32> = (0..self.dimensions)
            .map(|i| f32::from(bytes[i % 8]) / 255.0 - 0.5)
            .collect();
        l2_normalize(&mut embedding);
        embedding
    }
}

impl Default for MockEmbedder {
    fn default() -> Self {
        Self::new(384)
    }
}

#[async_trait]
impl Embedder for MockEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        if self.fail {
            return Err(EmbeddingError::Unavailable("mock embedder is offline".into()));
        }
        if self.stall {
            let _counter = DropCounter(self.abandoned.clone());
            std::future::pending::<()>().await;
        }
        Ok(self
            .fixed
            .get(text)
            .cloned()
            .unwrap_or_else(|| self.hashed(text)))
    }

    async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}
