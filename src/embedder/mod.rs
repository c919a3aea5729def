/// Embedder trait and the query/document embedding front-end.
///
/// Queries are embedded in one upstream call; documents are chunked first
/// and embedded chunk by chunk. Nothing here retries: callers decide.
pub mod chunking;
pub mod mock;
pub mod openai;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

/// Errors that can occur during embedding operations.
#[derive(Error, Debug)]
pub enum EmbeddingError {
    #[error("embedding service unavailable: {0}")]
    Unavailable(String),

    #[error("malformed embedding response: {0}")]
    Malformed(String),

    #[error("embedding request timed out")]
    TimedOut,

    #[error("empty input")]
    EmptyInput,
}

/// Text embedding backend.
///
/// Implementations must be `Send + Sync` so one instance can be shared
/// behind `Arc` by every concurrent request.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed a single text string into a vector.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;

    /// Embed multiple texts, one vector per input in input order.
    async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbeddingError>;

    /// Return the dimensionality of the embedding vectors.
    fn dimensions(&self) -> usize;
}

/// Front-end used by retrieval (queries) and ingestion (documents).
#[derive(Clone)]
pub struct EmbeddingGenerator {
    embedder: Arc<dyn Embedder>,
    chunk_size: usize,
}

impl EmbeddingGenerator {
    pub fn new(embedder: Arc<dyn Embedder>, chunk_size: usize) -> Self {
        Self {
            embedder,
            chunk_size,
        }
    }

    pub fn dimensions(&self) -> usize {
        self.embedder.dimensions()
    }

    /// Embed a short user question with a single upstream call.
    pub async fn embed_query(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(EmbeddingError::EmptyInput);
        }
        self.embedder.embed(text).await
    }

    /// Split a long text into bounded chunks and embed each one.
    ///
    /// Returns `(chunk, vector)` pairs in chunk order. An empty or
    /// whitespace-only document yields no chunks.
    pub async fn embed_document(
        &self,
        text: &str,
    ) -> Result<Vec<(String, Vec<f32>)>, EmbeddingError> {
        let chunks = chunking::split_into_chunks(text, self.chunk_size);
        if chunks.is_empty() {
            return Ok(Vec::new());
        }

        let refs: Vec<&str> = chunks.iter().map(String::as_str).collect();
        let vectors = self.embedder.embed_batch(&refs).await?;
        if vectors.len() != chunks.len() {
            return Err(EmbeddingError::Malformed(format!(
                "expected {} vectors, got {}",
                chunks.len(),
                vectors.len()
            )));
        }

        Ok(chunks.into_iter().zip(vectors).collect())
    }
}

/// L2-normalize a vector in place. Zero vectors are left untouched.
pub fn l2_normalize(vec: &mut [f32]) {
    let norm_sq: f32 = vec.iter().map(|v| v * v).sum();
    if norm_sq == 0.0 {
        return;
    }
    let inv = 1.0 / norm_sq.sqrt();
    for v in vec.iter_mut() {
        *v *= inv;
    }
}
