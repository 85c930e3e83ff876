//! OpenAI-compatible streaming chat completion with tool dispatch.
//!
//! Content deltas stream into the turn's `LinePipe` as they arrive so the
//! synthesis side can start speaking before the model finishes; tool-call
//! deltas accumulate until the stream ends and are then dispatched.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use sibyl_core::pipe::LinePipe;

use crate::sse::parse_sse_data;
use crate::{ChatBrain, ChatFunction, ChatMessage, FunctionCall, ToolCall, TurnRequest};

const DEFAULT_BASE_URL: &str = "https://api.openai.com";
const DEFAULT_MODEL: &str = "gpt-4o-mini";
/// Consecutive unknown-function replies tolerated before the turn fails.
const FUNCTION_ATTEMPTS: usize = 2;
/// Hard cap on model round-trips within one turn.
const MAX_ITERATIONS: usize = 8;

pub struct OpenAiBrain {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    history_size: usize,
}

impl OpenAiBrain {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: DEFAULT_BASE_URL.into(),
            api_key: api_key.into(),
            model: DEFAULT_MODEL.into(),
            history_size: 20,
        }
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_history_size(mut self, history_size: usize) -> Self {
        self.history_size = history_size;
        self
    }

    /// Stream one completion request, writing content deltas to `sink` and
    /// accumulating any tool calls into the returned assistant message.
    async fn stream_completion(
        &self,
        messages: &[ChatMessage],
        tools: &[serde_json::Value],
        sink: &LinePipe,
    ) -> anyhow::Result<ChatMessage> {
        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "stream": true,
        });
        if !tools.is_empty() {
            body["tools"] = json!(tools);
        }

        let resp = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("completion API error {status}: {body}");
        }

        let mut stream = std::pin::pin!(parse_sse_data(resp));
        let mut content = String::new();
        let mut calls: Vec<ToolCallAccumulator> = Vec::new();

        while let Some(data) = stream.next().await {
            let data = data?;
            if data == "[DONE]" {
                break;
            }
            let chunk: ChatCompletionChunk = match serde_json::from_str(&data) {
                Ok(chunk) => chunk,
                Err(e) => {
                    debug!(%e, "skipping unparseable completion chunk");
                    continue;
                }
            };
            let Some(choice) = chunk.choices.into_iter().next() else {
                continue;
            };
            if let Some(text) = choice.delta.content {
                if !text.is_empty() {
                    content.push_str(&text);
                    if sink.write(&text).is_err() {
                        anyhow::bail!("turn sink closed mid-stream");
                    }
                }
            }
            for delta in choice.delta.tool_calls.unwrap_or_default() {
                fold_tool_delta(&mut calls, delta);
            }
        }

        Ok(ChatMessage {
            role: "assistant".into(),
            content: (!content.is_empty()).then_some(content),
            name: None,
            tool_calls: (!calls.is_empty()).then(|| {
                calls
                    .into_iter()
                    .map(|acc| ToolCall {
                        id: acc.id,
                        kind: "function".into(),
                        function: FunctionCall {
                            name: acc.name,
                            arguments: acc.arguments,
                        },
                    })
                    .collect()
            }),
            tool_call_id: None,
        })
    }
}

#[async_trait]
impl ChatBrain for OpenAiBrain {
    async fn run_turn(
        &self,
        turn: TurnRequest,
        sink: Arc<LinePipe>,
    ) -> anyhow::Result<Vec<ChatMessage>> {
        let TurnRequest {
            system,
            history,
            message,
            functions,
        } = turn;

        let mut handlers: HashMap<String, Arc<dyn ChatFunction>> = HashMap::new();
        let mut tools = Vec::new();
        for function in &functions {
            let def = function.definition();
            tools.push(json!({
                "type": "function",
                "function": {
                    "name": def.name,
                    "description": def.description,
                    "parameters": def.parameters,
                }
            }));
            handlers.insert(def.name, Arc::clone(function));
        }

        // function exchanges accumulate in the returned history
        let mut new_history = history;
        let mut message = message;
        let mut failed_call = false;
        let mut bad_attempts = 0;

        for _ in 0..MAX_ITERATIONS {
            let mut messages = vec![system.clone()];
            messages.extend(new_history.iter().cloned());
            messages.push(message.clone());

            let reply = self.stream_completion(&messages, &tools, &sink).await?;

            new_history.push(message.clone());
            new_history.push(reply.clone());
            if new_history.len() > self.history_size {
                let excess = new_history.len() - self.history_size;
                new_history.drain(..excess);
            }

            let Some(calls) = reply.tool_calls.filter(|calls| !calls.is_empty()) else {
                failed_call = false;
                break; // plain assistant text: the turn is complete
            };

            // the voice turn shape is one call at a time
            let call = &calls[0];
            let result = match handlers.get(&call.function.name) {
                None => {
                    warn!(name = %call.function.name, "model called a function that does not exist");
                    failed_call = true;
                    bad_attempts += 1;
                    if bad_attempts >= FUNCTION_ATTEMPTS {
                        break;
                    }
                    format!(
                        "The function '{}' does not exist. Only call listed functions, then answer the original message.",
                        call.function.name
                    )
                }
                Some(handler) => {
                    failed_call = false;
                    bad_attempts = 0;

                    let args: serde_json::Value = if call.function.arguments.trim().is_empty() {
                        json!({})
                    } else {
                        serde_json::from_str(&call.function.arguments)
                            .context("failed to parse function arguments")?
                    };

                    let output = handler.call(args).await.context("function call failed")?;
                    debug!(name = %call.function.name, result = %output, "executed function");
                    output
                }
            };

            message = ChatMessage::tool_result(call.id.clone(), call.function.name.clone(), result);
        }

        if failed_call {
            anyhow::bail!("model kept calling unknown functions");
        }

        Ok(new_history)
    }
}

// --- streaming chunk wire types ---

#[derive(Debug, Deserialize)]
struct ChatCompletionChunk {
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
    tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
struct ToolCallDelta {
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<FunctionDelta>,
}

#[derive(Debug, Default, Deserialize)]
struct FunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

/// Accumulates one tool call across streaming deltas.
#[derive(Debug, Clone, Default)]
struct ToolCallAccumulator {
    id: String,
    name: String,
    arguments: String,
}

fn fold_tool_delta(calls: &mut Vec<ToolCallAccumulator>, delta: ToolCallDelta) {
    if delta.index >= calls.len() {
        calls.resize_with(delta.index + 1, Default::default);
    }
    let acc = &mut calls[delta.index];
    if let Some(id) = delta.id {
        acc.id = id;
    }
    if let Some(function) = delta.function {
        if let Some(name) = function.name {
            acc.name.push_str(&name);
        }
        if let Some(arguments) = function.arguments {
            acc.arguments.push_str(&arguments);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_parses_content_delta() {
        let chunk: ChatCompletionChunk = serde_json::from_str(
            r#"{"choices":[{"delta":{"content":"Hello"}}]}"#,
        )
        .unwrap();
        assert_eq!(chunk.choices[0].delta.content.as_deref(), Some("Hello"));
    }

    #[test]
    fn test_tool_deltas_accumulate_across_chunks() {
        let mut calls = Vec::new();

        let first: ChatCompletionChunk = serde_json::from_str(
            r#"{"choices":[{"delta":{"tool_calls":[
                {"index":0,"id":"call_1","function":{"name":"set_","arguments":"{\"na"}}
            ]}}]}"#,
        )
        .unwrap();
        let second: ChatCompletionChunk = serde_json::from_str(
            r#"{"choices":[{"delta":{"tool_calls":[
                {"index":0,"function":{"name":"voice","arguments":"me\":\"elli\"}"}}
            ]}}]}"#,
        )
        .unwrap();

        for chunk in [first, second] {
            for delta in chunk.choices.into_iter().next().unwrap().delta.tool_calls.unwrap() {
                fold_tool_delta(&mut calls, delta);
            }
        }

        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "call_1");
        assert_eq!(calls[0].name, "set_voice");
        assert_eq!(calls[0].arguments, r#"{"name":"elli"}"#);
    }

    #[test]
    fn test_tool_result_message_shape() {
        let msg = ChatMessage::tool_result("call_9", "leave_voice_chat", "disconnected");
        assert_eq!(msg.role, "tool");
        assert_eq!(msg.tool_call_id.as_deref(), Some("call_9"));
        assert_eq!(msg.content.as_deref(), Some("disconnected"));

        let wire = serde_json::to_value(&msg).unwrap();
        assert!(wire.get("tool_calls").is_none());
    }
}
