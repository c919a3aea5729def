//! Operator-side loading of domain records.
//!
//! Two inputs are supported: free text documents, chunked and embedded
//! into a searchable domain, and JSON Lines exports of structured records.
use std::io::BufRead;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::info;

use crate::db::models::NewRecord;
use crate::db::{Store, StoreError};
use crate::embedder::{EmbeddingError, EmbeddingGenerator};

#[derive(Error, Debug)]
pub enum IngestError {
    #[error(transparent)]
    Embedding(#[from] EmbeddingError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("read failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("line {line}: {message}")]
    Line { line: usize, message: String },
}

/// One line of a JSON Lines export.
#[derive(Debug, Deserialize)]
struct ImportLine {
    id: String,
    #[serde(default)]
    parent: Option<String>,
    #[serde(default)]
    recorded_at: Option<DateTime<Utc>>,
    data: Value,
}

/// Chunk and embed `text` into `domain`, one record per chunk.
///
/// Chunk ids are `{source}#{n}`. Re-ingesting a source replaces all of its
/// earlier chunks, including those beyond the new chunk count.
pub async fn ingest_document(
    store: &Store,
    embeddings: &EmbeddingGenerator,
    domain: &str,
    source: &str,
    text: &str,
) -> Result<usize, IngestError> {
    let chunks = embeddings.embed_document(text).await?;
    let records: Vec<(NewRecord, Vec<f32>)> = chunks
        .into_iter()
        .enumerate()
        .map(|(n, (chunk, vector))| {
            let record = NewRecord::new(
                format!("{source}#{n}"),
                json!({ "text": chunk, "source": source, "position": n }),
            );
            (record, vector)
        })
        .collect();

    let replaced = store.replace_prefixed(domain, &format!("{source}#"), &records)?;
    info!(domain, source, chunks = records.len(), replaced, "document ingested");
    Ok(records.len())
}

/// Load JSON Lines records into `domain`.
///
/// With `embed_field`, the named string field of each record's `data` is
/// embedded and stored with it; without, records are stored unembedded
/// (time-series and tiered-match domains).
pub async fn load_records(
    store: &Store,
    embeddings: &EmbeddingGenerator,
    domain: &str,
    reader: impl BufRead,
    embed_field: Option<&str>,
) -> Result<usize, IngestError> {
    let mut loaded = 0;
    for (index, line) in reader.lines().enumerate() {
        let line_no = index + 1;
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let parsed: ImportLine = serde_json::from_str(&line).map_err(|e| IngestError::Line {
            line: line_no,
            message: e.to_string(),
        })?;

        let vector = match embed_field {
            Some(field) => {
                let text = parsed.data.get(field).and_then(Value::as_str).ok_or_else(|| {
                    IngestError::Line {
                        line: line_no,
                        message: format!("data.{field} is missing or not a string"),
                    }
                })?;
                Some(embeddings.embed_query(text).await?)
            }
            None => None,
        };

        let mut record = NewRecord::new(parsed.id, parsed.data);
        if let Some(parent) = parsed.parent {
            record = record.with_parent(parent);
        }
        if let Some(at) = parsed.recorded_at {
            record = record.recorded_at(at);
        }
        store.insert(domain, &record, vector.as_deref())?;
        loaded += 1;
    }
    info!(domain, records = loaded, "records loaded");
    Ok(loaded)
}
