//! Streaming client for OpenAI-compatible chat completions.
//!
//! Serves both the `openai` and `ollama` providers; they differ only in
//! base URL and whether a bearer key is sent.

use std::collections::BTreeMap;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use super::{LanguageModel, ModelDecision, ModelError, ModelRequest, RequestedToolCall};
use crate::chat::Message;
use crate::chat::stream::TurnWriter;
use crate::tools::ToolDescriptor;

pub struct ChatCompletionsModel {
    client: Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
    temperature: f32,
}

impl ChatCompletionsModel {
    pub fn new(
        base_url: &str,
        model: &str,
        api_key: Option<String>,
        temperature: f32,
    ) -> Result<Self, ModelError> {
        let client = Client::builder()
            .build()
            .map_err(|e| ModelError::Unavailable(format!("http client: {e}")))?;
        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            model: model.to_string(),
            api_key,
            temperature,
        })
    }

    fn body(&self, request: &ModelRequest<'_>) -> Value {
        let mut body = json!({
            "model": self.model,
            "stream": true,
            "temperature": self.temperature,
            "messages": wire_messages(request.system, request.messages),
        });
        if !request.tools.is_empty() {
            body["tools"] = wire_tools(request.tools);
            body["tool_choice"] = json!("auto");
        }
        body
    }
}

#[async_trait]
impl LanguageModel for ChatCompletionsModel {
    async fn respond(
        &self,
        request: &ModelRequest<'_>,
        out: &mut TurnWriter<'_>,
    ) -> Result<ModelDecision, ModelError> {
        let mut http = self.client.post(&self.endpoint).json(&self.body(request));
        if let Some(key) = &self.api_key {
            http = http.bearer_auth(key);
        }

        let mut response = http
            .send()
            .await
            .map_err(|e| ModelError::Unavailable(format!("request failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ModelError::Unavailable(format!("HTTP {status}: {body}")));
        }

        let mut lines = SseLines::default();
        let mut calls = ToolCallAssembler::default();

        'stream: while let Some(bytes) = response
            .chunk()
            .await
            .map_err(|e| ModelError::Unavailable(format!("stream interrupted: {e}")))?
        {
            for data in lines.feed(&bytes) {
                if data == "[DONE]" {
                    break 'stream;
                }
                let chunk: ChatChunk = serde_json::from_str(&data)
                    .map_err(|e| ModelError::Malformed(format!("{e}: {data}")))?;
                for choice in chunk.choices {
                    if let Some(text) = choice.delta.content.filter(|t| !t.is_empty()) {
                        out.push(&text).await?;
                    }
                    for delta in choice.delta.tool_calls {
                        calls.apply(delta);
                    }
                }
            }
        }

        let calls = calls.finish();
        debug!(model = %self.model, tool_calls = calls.len(), "model turn complete");
        if calls.is_empty() {
            Ok(ModelDecision::Answer)
        } else {
            Ok(ModelDecision::CallTools(calls))
        }
    }

    fn name(&self) -> &str {
        &self.model
    }
}

// ── Wire format ──────────────────────────────────────────────────────

fn wire_messages(system: &str, messages: &[Message]) -> Vec<Value> {
    let mut wire = Vec::with_capacity(messages.len() + 1);
    wire.push(json!({ "role": "system", "content": system }));

    for message in messages {
        wire.push(match message {
            Message::User { content } => json!({ "role": "user", "content": content }),
            Message::Assistant {
                content,
                tool_calls,
            } if !tool_calls.is_empty() => {
                let calls: Vec<Value> = tool_calls
                    .iter()
                    .map(|c| {
                        json!({
                            "id": c.id,
                            "type": "function",
                            "function": {
                                "name": c.name,
                                "arguments": arguments_text(&c.arguments),
                            },
                        })
                    })
                    .collect();
                let content = if content.is_empty() {
                    Value::Null
                } else {
                    json!(content)
                };
                json!({ "role": "assistant", "content": content, "tool_calls": calls })
            }
            Message::Assistant { content, .. } => json!({ "role": "assistant", "content": content }),
            Message::Tool {
                call_id, content, ..
            } => json!({ "role": "tool", "tool_call_id": call_id, "content": content }),
        });
    }
    wire
}

fn arguments_text(arguments: &Value) -> String {
    match arguments {
        Value::String(raw) => raw.clone(),
        other => other.to_string(),
    }
}

fn wire_tools(tools: &[ToolDescriptor]) -> Value {
    Value::Array(
        tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.input_schema,
                    },
                })
            })
            .collect(),
    )
}

#[derive(Debug, Deserialize)]
struct ChatChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ToolCallDelta>,
}

#[derive(Debug, Deserialize)]
struct ToolCallDelta {
    #[serde(default)]
    index: u32,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<FunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct FunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

/// Splits a byte stream into server-sent-event `data:` payloads.
///
/// Bytes are buffered until a full line arrives so multi-byte characters
/// split across network chunks decode correctly.
#[derive(Default)]
struct SseLines {
    buf: Vec<u8>,
}

impl SseLines {
    fn feed(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(bytes);
        let mut payloads = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\n', '\r']);
            if let Some(data) = line.strip_prefix("data:") {
                payloads.push(data.trim_start().to_string());
            }
        }
        payloads
    }
}

#[derive(Default)]
struct PartialCall {
    id: Option<String>,
    name: String,
    arguments: String,
}

/// Reassembles tool calls whose name and arguments arrive in fragments.
#[derive(Default)]
struct ToolCallAssembler {
    calls: BTreeMap<u32, PartialCall>,
}

impl ToolCallAssembler {
    fn apply(&mut self, delta: ToolCallDelta) {
        let call = self.calls.entry(delta.index).or_default();
        if let Some(id) = delta.id {
            call.id = Some(id);
        }
        if let Some(function) = delta.function {
            if let Some(name) = function.name {
                call.name.push_str(&name);
            }
            if let Some(args) = function.arguments {
                call.arguments.push_str(&args);
            }
        }
    }

    fn finish(self) -> Vec<RequestedToolCall> {
        self.calls
            .into_iter()
            .map(|(index, call)| {
                let raw = call.arguments.trim();
                let arguments = if raw.is_empty() {
                    Value::Null
                } else {
                    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
                };
                RequestedToolCall {
                    id: call.id.unwrap_or_else(|| format!("call_{index}")),
                    name: call.name,
                    arguments,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools;

    #[test]
    fn test_sse_lines_across_chunks() {
        let mut lines = SseLines::default();
        let text = "data: {\"a\":\"Tyvärr\"}\n\ndata: [DONE]\n";
        let bytes = text.as_bytes();
        // split inside the multi-byte 'ä'
        let split = text.find('ä').unwrap() + 1;

        let first = lines.feed(&bytes[..split]);
        assert!(first.is_empty());
        let rest = lines.feed(&bytes[split..]);
        assert_eq!(rest, vec!["{\"a\":\"Tyvärr\"}".to_string(), "[DONE]".to_string()]);
    }

    #[test]
    fn test_sse_ignores_comments_and_crlf() {
        let mut lines = SseLines::default();
        let out = lines.feed(b": keep-alive\r\nevent: x\r\ndata:{}\r\n");
        assert_eq!(out, vec!["{}".to_string()]);
    }

    #[test]
    fn test_tool_call_fragments_assembled() {
        let mut asm = ToolCallAssembler::default();
        let chunks = [
            r#"{"index":0,"id":"call_a","function":{"name":"find_brokers","arguments":""}}"#,
            r#"{"index":1,"id":"call_b","function":{"name":"get_interest_rates","arguments":""}}"#,
            r#"{"index":0,"function":{"arguments":"{\"location\":"}}"#,
            r#"{"index":0,"function":{"arguments":"\"Malmö\"}"}}"#,
        ];
        for c in chunks {
            asm.apply(serde_json::from_str(c).unwrap());
        }
        let calls = asm.finish();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].id, "call_a");
        assert_eq!(calls[0].arguments, json!({"location": "Malmö"}));
        assert_eq!(calls[1].name, "get_interest_rates");
        assert_eq!(calls[1].arguments, Value::Null);
    }

    #[test]
    fn test_broken_arguments_kept_as_string() {
        let mut asm = ToolCallAssembler::default();
        asm.apply(
            serde_json::from_str(r#"{"index":0,"function":{"name":"find_brokers","arguments":"{\"location\":"}}"#)
                .unwrap(),
        );
        let calls = asm.finish();
        assert_eq!(calls[0].id, "call_0");
        assert_eq!(calls[0].arguments, json!("{\"location\":"));
    }

    #[test]
    fn test_wire_messages_shape() {
        let messages = vec![
            Message::user("Vilka mäklare finns i Lund?"),
            Message::Assistant {
                content: String::new(),
                tool_calls: vec![RequestedToolCall {
                    id: "call_1".into(),
                    name: "find_brokers".into(),
                    arguments: json!({"location": "Lund"}),
                }],
            },
            Message::Tool {
                call_id: "call_1".into(),
                tool_name: "find_brokers".into(),
                content: "{\"results\":[]}".into(),
                invocation: None,
            },
        ];
        let wire = wire_messages("sys", &messages);
        assert_eq!(wire.len(), 4);
        assert_eq!(wire[0]["role"], "system");
        assert_eq!(wire[2]["content"], Value::Null);
        assert_eq!(wire[2]["tool_calls"][0]["function"]["arguments"], "{\"location\":\"Lund\"}");
        assert_eq!(wire[3]["tool_call_id"], "call_1");
    }

    #[test]
    fn test_tools_omitted_when_none_offered() {
        let model = ChatCompletionsModel::new("http://localhost:11434/v1/", "llama3", None, 0.0).unwrap();
        assert_eq!(model.endpoint, "http://localhost:11434/v1/chat/completions");

        let descriptors = tools::descriptors();
        let with_tools = model.body(&ModelRequest {
            system: "s",
            messages: &[],
            tools: &descriptors,
        });
        assert_eq!(with_tools["tools"].as_array().unwrap().len(), 7);

        let without = model.body(&ModelRequest {
            system: "s",
            messages: &[],
            tools: &[],
        });
        assert!(without.get("tools").is_none());
    }

    #[test]
    fn test_parse_chunk_with_content() {
        let chunk: ChatChunk = serde_json::from_str(
            r#"{"id":"x","choices":[{"index":0,"delta":{"role":"assistant","content":"Hej"},"finish_reason":null}]}"#,
        )
        .unwrap();
        assert_eq!(chunk.choices[0].delta.content.as_deref(), Some("Hej"));
        assert!(chunk.choices[0].delta.tool_calls.is_empty());
    }
}
