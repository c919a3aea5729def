//! Bounded tool-calling loop.
//!
//! One request walks the states `AwaitingModel -> AwaitingToolResult ->
//! AwaitingModel ... -> ProducingOutput -> Terminated`. Tool rounds are
//! capped by `max_steps`; the whole request is capped by an umbrella
//! deadline; every await is abandoned as soon as the client goes away.
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::stream::{Cancelled, EventSink, FinishReason, StreamEvent, TurnWriter};
use super::{
    Conversation, FALLBACK_ANSWER, MODEL_FAILURE_ANSWER, Message, TIMEOUT_ANSWER, ToolInvocation,
    ToolOutcome,
};
use crate::config::Config;
use crate::llm::{LanguageModel, ModelDecision, ModelError, ModelRequest, RequestedToolCall};
use crate::tools::{DispatchError, Dispatcher, ToolCall, ToolDescriptor, ToolExecutionError, ToolOutput};

pub const SYSTEM_DIRECTIVE: &str = "Du är assistenten på en svensk bostadsmarknadsplats. \
Svara alltid på svenska. Använd verktygen för att hämta fakta om räntor, trafikläget, skolor, \
fastighetsregistret, statistik, mäklare och plattformens vanliga frågor. Svara enbart utifrån \
det verktygen returnerar och hitta aldrig på uppgifter. Om verktygen inte ger något användbart \
svarar du exakt: \"Tyvärr har jag ingen information om det.\"";

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub max_steps: u8,
    pub request_timeout: Duration,
    pub model_timeout: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            max_steps: 6,
            request_timeout: Duration::from_secs(45),
            model_timeout: Duration::from_secs(30),
        }
    }
}

impl From<&Config> for OrchestratorSettings {
    fn from(config: &Config) -> Self {
        Self {
            max_steps: config.orchestration.max_steps,
            request_timeout: config.request_timeout(),
            model_timeout: config.model_timeout(),
        }
    }
}

#[derive(Error, Debug)]
pub enum ChatError {
    #[error("invalid conversation: {0}")]
    InvalidConversation(&'static str),

    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

#[derive(Debug)]
pub struct ChatOutcome {
    pub answer: String,
    pub steps: u8,
    pub reason: FinishReason,
    pub conversation: Conversation,
}

/// Rejects histories the loop cannot start from.
pub fn validate_history(history: &[Message]) -> Result<(), ChatError> {
    match history.last() {
        None => Err(ChatError::InvalidConversation("conversation is empty")),
        Some(Message::User { content }) if !content.trim().is_empty() => Ok(()),
        Some(Message::User { .. }) => Err(ChatError::InvalidConversation("last user message is empty")),
        Some(_) => Err(ChatError::InvalidConversation(
            "last message must come from the user",
        )),
    }
}

enum LoopState {
    AwaitingModel,
    AwaitingToolResult(Vec<RequestedToolCall>),
    ProducingOutput(Output),
    Terminated { answer: String, reason: FinishReason },
}

enum Output {
    /// The model's own answer; `streamed` when its deltas already went out.
    Answer { text: String, streamed: bool },
    StepLimit,
    Fixed {
        text: &'static str,
        reason: FinishReason,
    },
}

enum Interrupt {
    Cancelled,
    Deadline,
}

enum Turn {
    Decided(ModelDecision),
    Failed,
    Cancelled,
    Deadline,
}

/// How one requested call settled.
enum Settled {
    Ran(ToolCall, Result<ToolOutput, ToolExecutionError>),
    Rejected(DispatchError),
}

struct Run<'a> {
    sink: &'a EventSink,
    cancel: CancellationToken,
    deadline: Instant,
    conversation: Conversation,
    step: u8,
    /// Model text has reached the client.
    streamed: bool,
}

impl Run<'_> {
    async fn guard<F: Future>(&self, fut: F) -> Result<F::Output, Interrupt> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Interrupt::Cancelled),
            _ = tokio::time::sleep_until(self.deadline) => Err(Interrupt::Deadline),
            out = fut => Ok(out),
        }
    }

    async fn emit(&self, event: StreamEvent) -> Result<(), ChatError> {
        Ok(self.sink.send(event).await?)
    }

    async fn emit_text(&self, text: &str) -> Result<(), ChatError> {
        self.emit(StreamEvent::TextDelta {
            text: text.to_string(),
        })
        .await
    }

    /// Tell the client to drop the model text it has seen before a fixed
    /// sentence replaces it.
    async fn retract(&mut self) -> Result<(), ChatError> {
        if self.streamed {
            debug!("streamed model text retracted");
            self.emit(StreamEvent::TextReset).await?;
            self.streamed = false;
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct Orchestrator {
    model: Arc<dyn LanguageModel>,
    dispatcher: Dispatcher,
    settings: OrchestratorSettings,
}

impl Orchestrator {
    pub fn new(model: Arc<dyn LanguageModel>, dispatcher: Dispatcher, settings: OrchestratorSettings) -> Self {
        Self {
            model,
            dispatcher,
            settings,
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    /// Answer the last user message, streaming events into `sink`.
    ///
    /// Returns `ChatError::Cancelled` without a finish event when the
    /// sink's token fires.
    pub async fn run(&self, history: Vec<Message>, sink: EventSink) -> Result<ChatOutcome, ChatError> {
        validate_history(&history)?;
        let mut run = Run {
            sink: &sink,
            cancel: sink.cancel_token().clone(),
            deadline: Instant::now() + self.settings.request_timeout,
            conversation: Conversation::new(history),
            step: 0,
            streamed: false,
        };
        debug!(model = self.model.name(), "chat started");

        let mut state = LoopState::AwaitingModel;
        let (answer, reason) = loop {
            state = match state {
                LoopState::AwaitingModel => self.await_model(&mut run).await?,
                LoopState::AwaitingToolResult(calls) => self.await_tools(&mut run, calls).await?,
                LoopState::ProducingOutput(output) => self.produce_output(&mut run, output).await?,
                LoopState::Terminated { answer, reason } => break (answer, reason),
            };
        };

        info!(steps = run.step, ?reason, "chat finished");
        Ok(ChatOutcome {
            answer,
            steps: run.step,
            reason,
            conversation: run.conversation,
        })
    }

    /// One model turn. Also returns the turn's text and whether part of it
    /// already went out to the client.
    async fn model_turn(&self, run: &Run<'_>, tools: &[ToolDescriptor]) -> (Turn, String, bool) {
        let live = run.conversation.may_stream_answer();
        let request = ModelRequest {
            system: SYSTEM_DIRECTIVE,
            messages: run.conversation.messages(),
            tools,
        };
        let mut writer = TurnWriter::new(run.sink, live);
        let guarded = run
            .guard(tokio::time::timeout(
                self.settings.model_timeout,
                self.model.respond(&request, &mut writer),
            ))
            .await;

        let turn = match guarded {
            Err(Interrupt::Cancelled) | Ok(Ok(Err(ModelError::Cancelled(_)))) => Turn::Cancelled,
            Err(Interrupt::Deadline) => Turn::Deadline,
            Ok(Err(_)) => {
                warn!(timeout = ?self.settings.model_timeout, "model turn timed out");
                Turn::Failed
            }
            Ok(Ok(Err(e))) => {
                warn!("model turn failed: {e}");
                Turn::Failed
            }
            Ok(Ok(Ok(decision))) => Turn::Decided(decision),
        };
        let streamed = writer.has_streamed();
        (turn, writer.into_text(), streamed)
    }

    async fn await_model(&self, run: &mut Run<'_>) -> Result<LoopState, ChatError> {
        let tools = self.dispatcher.descriptors();
        let (turn, text, streamed) = self.model_turn(run, &tools).await;
        run.streamed |= streamed;

        Ok(match turn {
            Turn::Cancelled => return Err(Cancelled.into()),
            Turn::Deadline => LoopState::ProducingOutput(Output::Fixed {
                text: TIMEOUT_ANSWER,
                reason: FinishReason::Timeout,
            }),
            Turn::Failed => LoopState::ProducingOutput(Output::Fixed {
                text: MODEL_FAILURE_ANSWER,
                reason: FinishReason::ModelFailure,
            }),
            Turn::Decided(ModelDecision::CallTools(calls)) if !calls.is_empty() => {
                run.conversation.push(Message::Assistant {
                    content: text,
                    tool_calls: calls.clone(),
                });
                LoopState::AwaitingToolResult(calls)
            }
            Turn::Decided(_) => LoopState::ProducingOutput(Output::Answer { text, streamed }),
        })
    }

    async fn await_tools(&self, run: &mut Run<'_>, calls: Vec<RequestedToolCall>) -> Result<LoopState, ChatError> {
        run.step += 1;
        let step = run.step;
        info!(step, calls = calls.len(), "running tools");

        for c in &calls {
            run.emit(StreamEvent::ToolCall {
                step,
                call_id: c.id.clone(),
                tool: c.name.clone(),
                arguments: c.arguments.clone(),
            })
            .await?;
        }

        let settled = match run.guard(self.fan_out(&calls)).await {
            Ok(settled) => settled,
            Err(Interrupt::Cancelled) => return Err(Cancelled.into()),
            Err(Interrupt::Deadline) => {
                return Ok(LoopState::ProducingOutput(Output::Fixed {
                    text: TIMEOUT_ANSWER,
                    reason: FinishReason::Timeout,
                }));
            }
        };

        for (req, settled) in calls.into_iter().zip(settled) {
            let (content, result_count, error, invocation) = match settled {
                Settled::Ran(call, Ok(output)) => (
                    output.to_json().to_string(),
                    output.results.len(),
                    None,
                    Some(ToolInvocation {
                        step,
                        call,
                        outcome: ToolOutcome::Success(output),
                    }),
                ),
                Settled::Ran(call, Err(e)) => {
                    let err = DispatchError::from(e);
                    let message = err.to_string();
                    (
                        err.payload().to_string(),
                        0,
                        Some(message.clone()),
                        Some(ToolInvocation {
                            step,
                            call,
                            outcome: ToolOutcome::Failed(message),
                        }),
                    )
                }
                Settled::Rejected(err) => (err.payload().to_string(), 0, Some(err.to_string()), None),
            };

            run.emit(StreamEvent::ToolResult {
                step,
                call_id: req.id.clone(),
                tool: req.name.clone(),
                ok: error.is_none(),
                result_count,
                error,
            })
            .await?;
            run.conversation.push(Message::Tool {
                call_id: req.id,
                tool_name: req.name,
                content,
                invocation,
            });
        }

        if step >= self.settings.max_steps {
            info!(step, "step limit reached");
            Ok(LoopState::ProducingOutput(Output::StepLimit))
        } else {
            Ok(LoopState::AwaitingModel)
        }
    }

    /// Runs every valid call of one step concurrently. Results come back in
    /// request order regardless of completion order.
    async fn fan_out(&self, calls: &[RequestedToolCall]) -> Vec<Settled> {
        let mut slots: Vec<Option<Settled>> = Vec::with_capacity(calls.len());
        let mut tasks = JoinSet::new();

        for (index, req) in calls.iter().enumerate() {
            match self.dispatcher.resolve(&req.name, &req.arguments) {
                Ok(call) => {
                    slots.push(None);
                    let dispatcher = self.dispatcher.clone();
                    tasks.spawn(async move {
                        let result = dispatcher.execute(&call).await;
                        (index, call, result)
                    });
                }
                Err(e) => {
                    warn!(tool = %req.name, "rejected tool call: {e}");
                    slots.push(Some(Settled::Rejected(e)));
                }
            }
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, call, result)) => slots[index] = Some(Settled::Ran(call, result)),
                Err(e) => warn!("tool task ended abnormally: {e}"),
            }
        }

        calls
            .iter()
            .zip(slots)
            .map(|(req, slot)| slot.unwrap_or_else(|| self.crashed(req)))
            .collect()
    }

    fn crashed(&self, req: &RequestedToolCall) -> Settled {
        match self.dispatcher.resolve(&req.name, &req.arguments) {
            Ok(call) => Settled::Ran(call, Err(ToolExecutionError::Crashed)),
            Err(e) => Settled::Rejected(e),
        }
    }

    async fn produce_output(&self, run: &mut Run<'_>, output: Output) -> Result<LoopState, ChatError> {
        let (answer, reason) = match output {
            Output::Answer { text, streamed } if streamed && !text.trim().is_empty() => {
                (text, FinishReason::Answered)
            }
            Output::Answer { text, .. } => {
                if !text.is_empty() {
                    debug!(
                        chars = text.chars().count(),
                        tools_attempted = run.conversation.tools_attempted(),
                        "ungrounded answer withheld"
                    );
                }
                run.retract().await?;
                run.emit_text(FALLBACK_ANSWER).await?;
                (FALLBACK_ANSWER.to_string(), FinishReason::NoEvidence)
            }
            Output::StepLimit => self.forced_answer(run).await?,
            Output::Fixed { text, reason } => {
                run.retract().await?;
                run.emit_text(text).await?;
                (text.to_string(), reason)
            }
        };

        run.conversation.push(Message::assistant(answer.clone()));
        run.emit(StreamEvent::Finish {
            answer: answer.clone(),
            steps: run.step,
            reason,
        })
        .await?;
        Ok(LoopState::Terminated { answer, reason })
    }

    /// Final turn after the step limit: the model sees every tool result so
    /// far but is offered no tools.
    async fn forced_answer(&self, run: &mut Run<'_>) -> Result<(String, FinishReason), ChatError> {
        let (turn, text, streamed) = self.model_turn(run, &[]).await;
        run.streamed |= streamed;
        let fixed = match turn {
            Turn::Cancelled => return Err(Cancelled.into()),
            Turn::Deadline => Some((TIMEOUT_ANSWER, FinishReason::Timeout)),
            Turn::Failed => Some((MODEL_FAILURE_ANSWER, FinishReason::ModelFailure)),
            Turn::Decided(ModelDecision::CallTools(calls)) => {
                debug!(ignored = calls.len(), "tool calls after step limit ignored");
                None
            }
            Turn::Decided(ModelDecision::Answer) => None,
        };
        if let Some((sentence, reason)) = fixed {
            run.retract().await?;
            run.emit_text(sentence).await?;
            return Ok((sentence.to_string(), reason));
        }

        if streamed && !text.trim().is_empty() {
            Ok((text, FinishReason::StepLimit))
        } else {
            run.retract().await?;
            run.emit_text(FALLBACK_ANSWER).await?;
            Ok((FALLBACK_ANSWER.to_string(), FinishReason::StepLimit))
        }
    }
}
