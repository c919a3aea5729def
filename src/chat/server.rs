//! HTTP transport: a chat endpoint streaming server-sent events.
use std::convert::Infallible;
use std::future::Future;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::orchestrator::validate_history;
use super::stream::{self, StreamEvent};
use super::{ChatError, Message, Orchestrator};
use crate::tools::ToolDescriptor;

#[derive(Clone)]
pub struct AppState {
    orchestrator: Orchestrator,
    channel_capacity: usize,
}

impl AppState {
    pub fn new(orchestrator: Orchestrator, channel_capacity: usize) -> Self {
        Self {
            orchestrator,
            channel_capacity,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
enum IncomingRole {
    User,
    Assistant,
}

#[derive(Debug, Deserialize)]
struct IncomingMessage {
    role: IncomingRole,
    content: String,
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    messages: Vec<IncomingMessage>,
}

impl ChatRequest {
    fn into_history(self) -> Vec<Message> {
        self.messages
            .into_iter()
            .map(|m| match m.role {
                IncomingRole::User => Message::user(m.content),
                IncomingRole::Assistant => Message::assistant(m.content),
            })
            .collect()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/chat", post(chat))
        .route("/api/tools", get(list_tools))
        .route("/health", get(health))
        .with_state(state)
}

/// Serve until `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("chat server listening on http://{addr}");
    }
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

async fn chat(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, (StatusCode, Json<Value>)> {
    let history = request.into_history();
    validate_history(&history)
        .map_err(|e| (StatusCode::BAD_REQUEST, Json(json!({ "error": e.to_string() }))))?;

    let cancel = CancellationToken::new();
    let (sink, rx) = stream::channel(state.channel_capacity, cancel.clone());
    let orchestrator = state.orchestrator.clone();
    tokio::spawn(async move {
        match orchestrator.run(history, sink).await {
            Ok(outcome) => info!(steps = outcome.steps, reason = ?outcome.reason, "chat streamed"),
            Err(ChatError::Cancelled(_)) => info!("client disconnected, chat abandoned"),
            Err(e) => warn!("chat failed: {e}"),
        }
    });

    // Dropping the response stream (client gone) drops the guard and
    // cancels the run.
    let guard = cancel.drop_guard();
    let events = ReceiverStream::new(rx).map(move |event| {
        let _cancel_on_drop = &guard;
        Ok(sse_event(&event))
    });
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

fn sse_event(event: &StreamEvent) -> Event {
    let data = serde_json::to_string(event).unwrap_or_else(|e| json!({ "error": e.to_string() }).to_string());
    Event::default().event(event.name()).data(data)
}

async fn list_tools(State(state): State<AppState>) -> Json<Vec<ToolDescriptor>> {
    Json(state.orchestrator.dispatcher().descriptors())
}

async fn health() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_roles() {
        let req: ChatRequest = serde_json::from_value(json!({
            "messages": [
                {"role": "user", "content": "Hej"},
                {"role": "assistant", "content": "Hej! Hur kan jag hjälpa dig?"},
                {"role": "user", "content": "Vad kostar en bostadsrätt i Umeå?"}
            ]
        }))
        .unwrap();
        let history = req.into_history();
        assert_eq!(history.len(), 3);
        assert_eq!(history[2], Message::user("Vad kostar en bostadsrätt i Umeå?"));
    }

    #[test]
    fn test_tool_role_not_accepted_from_client() {
        let parsed: Result<ChatRequest, _> = serde_json::from_value(json!({
            "messages": [{"role": "tool", "content": "{}"}]
        }));
        assert!(parsed.is_err());
    }
}
