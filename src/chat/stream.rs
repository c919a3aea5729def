//! Events flowing from the orchestration loop to the transport.
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Answered,
    NoEvidence,
    StepLimit,
    Timeout,
    ModelFailure,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StreamEvent {
    TextDelta {
        text: String,
    },
    /// The text streamed so far belongs to a turn that broke off and must be
    /// discarded.
    TextReset,
    ToolCall {
        step: u8,
        call_id: String,
        tool: String,
        arguments: Value,
    },
    ToolResult {
        step: u8,
        call_id: String,
        tool: String,
        ok: bool,
        result_count: usize,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Finish {
        answer: String,
        steps: u8,
        reason: FinishReason,
    },
}

impl StreamEvent {
    /// SSE event name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::TextDelta { .. } => "text-delta",
            Self::TextReset => "text-reset",
            Self::ToolCall { .. } => "tool-call",
            Self::ToolResult { .. } => "tool-result",
            Self::Finish { .. } => "finish",
        }
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("client disconnected")]
pub struct Cancelled;

/// Sending half of a request's event stream, tied to its cancellation token.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::Sender<StreamEvent>,
    cancel: CancellationToken,
}

pub fn channel(capacity: usize, cancel: CancellationToken) -> (EventSink, mpsc::Receiver<StreamEvent>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (EventSink { tx, cancel }, rx)
}

impl EventSink {
    /// Deliver an event, waiting for room. Fails once the consumer is gone;
    /// a closed receiver also cancels the request.
    pub async fn send(&self, event: StreamEvent) -> Result<(), Cancelled> {
        if self.cancel.is_cancelled() {
            return Err(Cancelled);
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Cancelled),
            sent = self.tx.send(event) => sent.map_err(|_| {
                self.cancel.cancel();
                Cancelled
            }),
        }
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// Collects one model turn's text and forwards it live when allowed.
///
/// When not live, deltas are held back so an ungrounded answer never
/// reaches the client. `has_streamed` tells whether the client already saw
/// part of this turn.
pub struct TurnWriter<'a> {
    sink: &'a EventSink,
    live: bool,
    text: String,
}

impl<'a> TurnWriter<'a> {
    pub fn new(sink: &'a EventSink, live: bool) -> Self {
        Self {
            sink,
            live,
            text: String::new(),
        }
    }

    pub async fn push(&mut self, delta: &str) -> Result<(), Cancelled> {
        self.text.push_str(delta);
        if self.live {
            self.sink
                .send(StreamEvent::TextDelta {
                    text: delta.to_string(),
                })
                .await?;
        }
        Ok(())
    }

    pub fn is_live(&self) -> bool {
        self.live
    }

    pub fn has_streamed(&self) -> bool {
        self.live && !self.text.is_empty()
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn into_text(self) -> String {
        self.text
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_live_writer_forwards_deltas() {
        let (sink, mut rx) = channel(8, CancellationToken::new());
        let mut w = TurnWriter::new(&sink, true);
        w.push("Hej ").await.unwrap();
        w.push("där").await.unwrap();
        assert!(w.is_live());
        assert!(w.has_streamed());
        assert_eq!(w.text(), "Hej där");
        assert_eq!(
            rx.recv().await,
            Some(StreamEvent::TextDelta { text: "Hej ".into() })
        );
    }

    #[tokio::test]
    async fn test_held_writer_buffers() {
        let (sink, mut rx) = channel(8, CancellationToken::new());
        let mut w = TurnWriter::new(&sink, false);
        w.push("påhittat svar").await.unwrap();
        assert!(!w.has_streamed());
        assert_eq!(w.into_text(), "påhittat svar");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_closed_receiver_cancels() {
        let token = CancellationToken::new();
        let (sink, rx) = channel(1, token.clone());
        drop(rx);
        let err = sink
            .send(StreamEvent::TextDelta { text: "x".into() })
            .await
            .unwrap_err();
        assert_eq!(err, Cancelled);
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_send_after_cancel_fails() {
        let token = CancellationToken::new();
        let (sink, _rx) = channel(1, token.clone());
        token.cancel();
        assert!(sink.send(StreamEvent::TextDelta { text: "x".into() }).await.is_err());
    }

    #[test]
    fn test_event_wire_shape() {
        let ev = StreamEvent::Finish {
            answer: "Svar".into(),
            steps: 2,
            reason: FinishReason::StepLimit,
        };
        assert_eq!(ev.name(), "finish");
        assert_eq!(
            serde_json::to_value(&ev).unwrap(),
            json!({"type": "finish", "answer": "Svar", "steps": 2, "reason": "step_limit"})
        );

        let ev = StreamEvent::ToolResult {
            step: 1,
            call_id: "c".into(),
            tool: "find_brokers".into(),
            ok: true,
            result_count: 0,
            error: None,
        };
        assert_eq!(ev.name(), "tool-result");
        assert!(serde_json::to_value(&ev).unwrap().get("error").is_none());

        assert_eq!(StreamEvent::TextReset.name(), "text-reset");
        assert_eq!(
            serde_json::to_value(StreamEvent::TextReset).unwrap(),
            json!({"type": "text-reset"})
        );
    }
}
