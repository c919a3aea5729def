//! OpenAI-compatible `/embeddings` client.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{Embedder, EmbeddingError};

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [&'a str],
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    index: usize,
    embedding: Vec<f32>,
}

/// Embedding provider speaking the OpenAI embeddings wire format.
pub struct HttpEmbedder {
    client: Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
    dimensions: usize,
}

impl HttpEmbedder {
    pub fn new(
        base_url: &str,
        model: &str,
        api_key: Option<String>,
        dimensions: usize,
        timeout: Duration,
    ) -> Result<Self, EmbeddingError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EmbeddingError::Unavailable(format!("http client: {e}")))?;

        Ok(Self {
            client,
            endpoint: format!("{}/embeddings", base_url.trim_end_matches('/')),
            model: model.to_string(),
            api_key,
            dimensions,
        })
    }

    async fn call_api(&self, input: &[&str]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let mut request = self.client.post(&self.endpoint).json(&EmbeddingRequest {
            model: &self.model,
            input,
        });
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                EmbeddingError::TimedOut
            } else {
                EmbeddingError::Unavailable(format!("request failed: {e}"))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EmbeddingError::Unavailable(format!("HTTP {status}: {body}")));
        }

        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| EmbeddingError::Malformed(e.to_string()))?;

        order_and_check(parsed.data, input.len(), self.dimensions)
    }
}

/// Restore input order and verify count and dimensionality.
fn order_and_check(
    mut data: Vec<EmbeddingData>,
    expected: usize,
    dimensions: usize,
) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    if data.len() != expected {
        return Err(EmbeddingError::Malformed(format!(
            "expected {expected} embeddings, got {}",
            data.len()
        )));
    }
    data.sort_by_key(|d| d.index);

    data.into_iter()
        .map(|d| {
            if d.embedding.len() == dimensions {
                Ok(d.embedding)
            } else {
                Err(EmbeddingError::Malformed(format!(
                    "expected {dimensions} dimensions, got {}",
                    d.embedding.len()
                )))
            }
        })
        .collect()
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        debug!(model = %self.model, chars = text.chars().count(), "embedding query");
        self.call_api(&[text])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| EmbeddingError::Malformed("no embedding returned".into()))
    }

    async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        self.call_api(texts).await
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(index: usize, embedding: Vec<f32>) -> EmbeddingData {
        EmbeddingData { index, embedding }
    }

    #[test]
    fn test_response_reordered_by_index() {
        let out = order_and_check(
            vec![data(1, vec![0.0, 1.0]), data(0, vec![1.0, 0.0])],
            2,
            2,
        )
        .unwrap();
        assert_eq!(out, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
    }

    #[test]
    fn test_wrong_dimension_is_malformed() {
        let err = order_and_check(vec![data(0, vec![1.0])], 1, 2).unwrap_err();
        assert!(matches!(err, EmbeddingError::Malformed(_)));
    }

    #[test]
    fn test_missing_embeddings_is_malformed() {
        let err = order_and_check(vec![], 1, 2).unwrap_err();
        assert!(matches!(err, EmbeddingError::Malformed(_)));
    }

    #[test]
    fn test_parse_wire_format() {
        let json = r#"{"object":"list","data":[{"object":"embedding","index":0,"embedding":[0.5,0.25]}],"model":"m"}"#;
        let parsed: EmbeddingResponse = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.data[0].embedding, vec![0.5, 0.25]);
    }
}
