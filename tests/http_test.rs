/// HTTP transport tests against a live server on an ephemeral port.
use std::sync::Arc;
use std::time::Duration;

use bostadsrag::chat::server::{self, AppState};
use bostadsrag::chat::{FALLBACK_ANSWER, MODEL_FAILURE_ANSWER, Orchestrator, OrchestratorSettings};
use bostadsrag::config::DomainsConfig;
use bostadsrag::db::Store;
use bostadsrag::db::models::NewRecord;
use bostadsrag::embedder::EmbeddingGenerator;
use bostadsrag::embedder::mock::MockEmbedder;
use bostadsrag::llm::mock::{ScriptedModel, ScriptedTurn};
use bostadsrag::retrieval::Retriever;
use bostadsrag::tools::{Dispatcher, ToolContext};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

struct TestServer {
    base: String,
    _shutdown: oneshot::Sender<()>,
}

async fn start(model: Arc<ScriptedModel>, store: Store) -> TestServer {
    let retriever = Retriever::new(
        store,
        EmbeddingGenerator::new(Arc::new(MockEmbedder::new(4)), 500),
    );
    let dispatcher = Dispatcher::new(
        ToolContext::new(retriever, DomainsConfig::default()),
        Duration::from_secs(5),
    );
    let orchestrator = Orchestrator::new(model, dispatcher, OrchestratorSettings::default());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = oneshot::channel::<()>();
    tokio::spawn(server::serve(listener, AppState::new(orchestrator, 16), async move {
        let _ = rx.await;
    }));

    TestServer {
        base: format!("http://{addr}"),
        _shutdown: tx,
    }
}

#[tokio::test]
async fn test_chat_streams_sse_events() {
    let model = Arc::new(ScriptedModel::new([
        ScriptedTurn::tool("find_brokers", json!({"location": "Kiruna"})),
        ScriptedTurn::answer("Det finns många mäklare i Kiruna."),
    ]));
    let srv = start(model, Store::open_in_memory().unwrap()).await;

    let body = reqwest::Client::new()
        .post(format!("{}/api/chat", srv.base))
        .json(&json!({"messages": [{"role": "user", "content": "Mäklare i Kiruna?"}]}))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();

    let tool_call = body.find("event: tool-call").unwrap();
    let tool_result = body.find("event: tool-result").unwrap();
    let finish = body.find("event: finish").unwrap();
    assert!(tool_call < tool_result && tool_result < finish);
    assert!(body.contains(FALLBACK_ANSWER));
    assert!(!body.contains("många mäklare"));
}

#[tokio::test]
async fn test_broken_answer_is_reset_on_the_wire() {
    let store = Store::open_in_memory().unwrap();
    store
        .insert("interest_rates", &NewRecord::new("r1", json!({"series": "STIBOR 3M", "rate": 4.0})), None)
        .unwrap();
    let model = Arc::new(ScriptedModel::new([
        ScriptedTurn::tool("get_interest_rates", json!({})),
        ScriptedTurn::FailAfter("Räntan är ".into()),
    ]));
    let srv = start(model, store).await;

    let body = reqwest::Client::new()
        .post(format!("{}/api/chat", srv.base))
        .json(&json!({"messages": [{"role": "user", "content": "Ränta?"}]}))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();

    let first_delta = body.find("event: text-delta").unwrap();
    let reset = body.find("event: text-reset").unwrap();
    let finish = body.find("event: finish").unwrap();
    assert!(first_delta < reset && reset < finish);
    assert!(body[reset..].contains(MODEL_FAILURE_ANSWER));
    assert!(!body[reset..].contains("Räntan är"));
}

#[tokio::test]
async fn test_rejects_bad_conversations() {
    let srv = start(Arc::new(ScriptedModel::default()), Store::open_in_memory().unwrap()).await;
    let client = reqwest::Client::new();

    for messages in [
        json!([]),
        json!([{"role": "user", "content": "Hej"}, {"role": "assistant", "content": "Hej!"}]),
    ] {
        let resp = client
            .post(format!("{}/api/chat", srv.base))
            .json(&json!({ "messages": messages }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);
        let err: Value = resp.json().await.unwrap();
        assert!(err["error"].as_str().unwrap().starts_with("invalid conversation"));
    }
}

#[tokio::test]
async fn test_tools_and_health() {
    let srv = start(Arc::new(ScriptedModel::default()), Store::open_in_memory().unwrap()).await;
    let client = reqwest::Client::new();

    let tools: Vec<Value> = client
        .get(format!("{}/api/tools", srv.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(tools.len(), 7);
    assert!(tools.iter().all(|t| t["input_schema"]["type"] == "object"));

    let health = client
        .get(format!("{}/health", srv.base))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(health, "ok");
}

/// Scenario D: the client hangs up mid-stream and the stalled model turn
/// is abandoned.
#[tokio::test]
async fn test_client_disconnect_abandons_request() {
    let store = Store::open_in_memory().unwrap();
    store
        .insert("interest_rates", &NewRecord::new("r1", json!({"series": "STIBOR 3M", "rate": 4.0})), None)
        .unwrap();
    let model = Arc::new(ScriptedModel::new([
        ScriptedTurn::tool("get_interest_rates", json!({})),
        ScriptedTurn::Stall,
    ]));
    let srv = start(model.clone(), store).await;

    let mut resp = reqwest::Client::new()
        .post(format!("{}/api/chat", srv.base))
        .json(&json!({"messages": [{"role": "user", "content": "Ränta?"}]}))
        .send()
        .await
        .unwrap();

    let mut seen = String::new();
    while !seen.contains("event: tool-result") {
        let chunk = tokio::time::timeout(Duration::from_secs(5), resp.chunk())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        seen.push_str(&String::from_utf8_lossy(&chunk));
    }
    drop(resp);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
    while model.abandoned_turns() == 0 {
        assert!(tokio::time::Instant::now() < deadline, "stalled turn was never abandoned");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(!seen.contains("event: finish"));
}
