//! Conversation model and the orchestration loop that answers it.
pub mod orchestrator;
pub mod server;
pub mod stream;

use serde::Serialize;

use crate::llm::RequestedToolCall;
use crate::tools::{ToolCall, ToolOutput};

pub use orchestrator::{ChatError, ChatOutcome, Orchestrator, OrchestratorSettings};

/// Answer given when no tool produced usable evidence.
pub const FALLBACK_ANSWER: &str = "Tyvärr har jag ingen information om det.";
pub const TIMEOUT_ANSWER: &str =
    "Tyvärr tog det för lång tid att ta fram ett svar. Försök gärna igen.";
pub const MODEL_FAILURE_ANSWER: &str =
    "Tyvärr kan jag inte svara just nu. Försök gärna igen om en stund.";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum Message {
    User {
        content: String,
    },
    Assistant {
        content: String,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<RequestedToolCall>,
    },
    Tool {
        call_id: String,
        tool_name: String,
        /// JSON text handed back to the model: results or a structured error.
        content: String,
        /// Present only when a handler actually ran.
        #[serde(skip)]
        invocation: Option<ToolInvocation>,
    },
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self::User {
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::Assistant {
            content: content.into(),
            tool_calls: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutcome {
    Success(ToolOutput),
    Failed(String),
}

/// One executed tool call, recorded with the step it ran in.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocation {
    pub step: u8,
    pub call: ToolCall,
    pub outcome: ToolOutcome,
}

impl ToolInvocation {
    pub fn has_evidence(&self) -> bool {
        matches!(&self.outcome, ToolOutcome::Success(out) if out.has_evidence())
    }
}

/// Append-only message history for one request.
#[derive(Debug, Clone, Default)]
pub struct Conversation {
    messages: Vec<Message>,
}

impl Conversation {
    pub fn new(history: Vec<Message>) -> Self {
        Self { messages: history }
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn invocations(&self) -> impl Iterator<Item = &ToolInvocation> {
        self.messages.iter().filter_map(|m| match m {
            Message::Tool {
                invocation: Some(inv),
                ..
            } => Some(inv),
            _ => None,
        })
    }

    /// Whether any tool call was attempted, valid or not.
    pub fn tools_attempted(&self) -> bool {
        self.messages.iter().any(|m| matches!(m, Message::Tool { .. }))
    }

    pub fn has_evidence(&self) -> bool {
        self.invocations().any(ToolInvocation::has_evidence)
    }

    /// Model text reaches the client only once some tool returned results.
    /// Every other answer is replaced by the fallback sentence.
    pub fn may_stream_answer(&self) -> bool {
        self.has_evidence()
    }
}
