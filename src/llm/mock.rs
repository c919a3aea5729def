//! Scripted language model for tests and offline runs.
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde_json::Value;

use super::{LanguageModel, ModelDecision, ModelError, ModelRequest, RequestedToolCall};
use crate::chat::Message;
use crate::chat::stream::TurnWriter;

#[derive(Debug, Clone)]
pub enum ScriptedTurn {
    /// Stream the text word by word, then answer.
    Answer(String),
    /// Request these `(tool name, arguments)` pairs.
    Tools(Vec<(String, Value)>),
    Fail(String),
    /// Stream the text, then fail as if the connection dropped.
    FailAfter(String),
    /// Never finish.
    Stall,
    /// Stream the text, then never finish.
    StallAfter(String),
}

impl ScriptedTurn {
    pub fn answer(text: impl Into<String>) -> Self {
        Self::Answer(text.into())
    }

    pub fn tool(name: &str, args: Value) -> Self {
        Self::Tools(vec![(name.to_string(), args)])
    }
}

/// What the model was shown on one turn.
#[derive(Debug, Clone)]
pub struct SeenRequest {
    pub tools_offered: usize,
    pub message_count: usize,
    /// Contents of every tool message in the conversation so far.
    pub tool_results: Vec<String>,
}

#[derive(Default)]
pub struct ScriptedModel {
    turns: Mutex<VecDeque<ScriptedTurn>>,
    repeat: Option<ScriptedTurn>,
    seen: Mutex<Vec<SeenRequest>>,
    next_call: AtomicUsize,
    abandoned: Arc<AtomicUsize>,
}

struct AbandonCounter(Arc<AtomicUsize>);

impl Drop for AbandonCounter {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

impl ScriptedModel {
    pub fn new(turns: impl IntoIterator<Item = ScriptedTurn>) -> Self {
        Self {
            turns: Mutex::new(turns.into_iter().collect()),
            ..Self::default()
        }
    }

    /// Plays `turns`, then repeats `forever` on every later turn.
    pub fn looping(turns: impl IntoIterator<Item = ScriptedTurn>, forever: ScriptedTurn) -> Self {
        Self {
            repeat: Some(forever),
            ..Self::new(turns)
        }
    }

    pub fn seen(&self) -> Vec<SeenRequest> {
        self.seen.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Number of stalled turns whose future was dropped before finishing.
    pub fn abandoned_turns(&self) -> usize {
        self.abandoned.load(Ordering::SeqCst)
    }

    fn next_turn(&self) -> Option<ScriptedTurn> {
        let mut turns = self.turns.lock().ok()?;
        turns.pop_front().or_else(|| self.repeat.clone())
    }

    async fn stall(&self) -> Result<ModelDecision, ModelError> {
        let _counter = AbandonCounter(self.abandoned.clone());
        std::future::pending::<()>().await;
        Err(ModelError::Malformed("stalled turn resumed".into()))
    }

    fn record(&self, request: &ModelRequest<'_>) {
        let tool_results = request
            .messages
            .iter()
            .filter_map(|m| match m {
                Message::Tool { content, .. } => Some(content.clone()),
                _ => None,
            })
            .collect();
        if let Ok(mut seen) = self.seen.lock() {
            seen.push(SeenRequest {
                tools_offered: request.tools.len(),
                message_count: request.messages.len(),
                tool_results,
            });
        }
    }
}

async fn stream_words(text: &str, out: &mut TurnWriter<'_>) -> Result<(), ModelError> {
    for piece in text.split_inclusive(' ') {
        out.push(piece).await?;
    }
    Ok(())
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn respond(
        &self,
        request: &ModelRequest<'_>,
        out: &mut TurnWriter<'_>,
    ) -> Result<ModelDecision, ModelError> {
        self.record(request);
        let turn = self
            .next_turn()
            .ok_or_else(|| ModelError::Malformed("script exhausted".into()))?;

        match turn {
            ScriptedTurn::Answer(text) => {
                stream_words(&text, out).await?;
                Ok(ModelDecision::Answer)
            }
            ScriptedTurn::Tools(calls) => Ok(ModelDecision::CallTools(
                calls
                    .into_iter()
                    .map(|(name, arguments)| RequestedToolCall {
                        id: format!("call_{}", self.next_call.fetch_add(1, Ordering::SeqCst)),
                        name,
                        arguments,
                    })
                    .collect(),
            )),
            ScriptedTurn::Fail(reason) => Err(ModelError::Unavailable(reason)),
            ScriptedTurn::FailAfter(text) => {
                stream_words(&text, out).await?;
                Err(ModelError::Unavailable("stream interrupted".into()))
            }
            ScriptedTurn::Stall => self.stall().await,
            ScriptedTurn::StallAfter(text) => {
                stream_words(&text, out).await?;
                self.stall().await
            }
        }
    }

    fn name(&self) -> &str {
        "scripted"
    }
}
