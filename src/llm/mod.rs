/// Language-model seam used by the orchestration loop.
///
/// A model turn streams its text into a [`TurnWriter`] and ends with a
/// [`ModelDecision`]: either it wants tools run, or its text is the answer.
pub mod mock;
pub mod openai;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::chat::Message;
use crate::chat::stream::{Cancelled, TurnWriter};
use crate::tools::ToolDescriptor;

/// A tool call as requested by the model, before validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestedToolCall {
    pub id: String,
    pub name: String,
    /// Parsed argument object; unparseable text is kept as a JSON string
    /// so validation can reject it.
    pub arguments: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ModelDecision {
    CallTools(Vec<RequestedToolCall>),
    Answer,
}

pub struct ModelRequest<'a> {
    pub system: &'a str,
    pub messages: &'a [Message],
    /// Empty when the model must answer without tools.
    pub tools: &'a [ToolDescriptor],
}

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("model provider unavailable: {0}")]
    Unavailable(String),

    #[error("malformed model response: {0}")]
    Malformed(String),

    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Run one model turn, streaming text deltas into `out`.
    async fn respond(
        &self,
        request: &ModelRequest<'_>,
        out: &mut TurnWriter<'_>,
    ) -> Result<ModelDecision, ModelError>;

    fn name(&self) -> &str;
}
