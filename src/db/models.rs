use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

/// A record handed to the store by ingestion.
#[derive(Debug, Clone)]
pub struct NewRecord {
    /// Identifier from the upstream source, unique within a domain.
    pub external_id: String,
    pub payload: Value,
    /// `external_id` of the parent record in a category domain.
    pub parent_ref: Option<String>,
    /// Observation time for time-series domains.
    pub recorded_at: Option<DateTime<Utc>>,
}

impl NewRecord {
    pub fn new(external_id: impl Into<String>, payload: Value) -> Self {
        Self {
            external_id: external_id.into(),
            payload,
            parent_ref: None,
            recorded_at: None,
        }
    }

    #[must_use]
    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parent_ref = Some(parent.into());
        self
    }

    #[must_use]
    pub fn recorded_at(mut self, at: DateTime<Utc>) -> Self {
        self.recorded_at = Some(at);
        self
    }
}

/// A stored record as read back (vectors are never returned).
#[derive(Debug, Clone, Serialize)]
pub struct Record {
    #[serde(skip)]
    pub id: i64,
    #[serde(skip)]
    pub domain: String,
    #[serde(rename = "id")]
    pub external_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recorded_at: Option<DateTime<Utc>>,
    #[serde(rename = "data")]
    pub payload: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct RetrievalResult {
    #[serde(flatten)]
    pub record: Record,
    /// Cosine similarity in [-1, 1].
    pub similarity: f64,
}

/// A matched category together with its child records.
#[derive(Debug, Clone, Serialize)]
pub struct CategoryMatch {
    pub category: RetrievalResult,
    pub entries: Vec<Record>,
}
