//! Anthropic messages API client with extended thinking.

use std::collections::HashMap;
use std::io::BufReader;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde_json::{Value, json};
use tracing::{debug, instrument};

use super::openai::parse_arguments;
use super::sse::SseReader;
use super::{DeltaSink, Model, ModelError};
use crate::core::provider::Provider;
use crate::core::types::{
    AssistantMessage, DeltaKind, Message, ModelReply, ModelRequest, ModelResponse, ReasoningEffort,
    ToolCall,
};

const API_VERSION: &str = "2023-06-01";
const MAX_TOKENS: u64 = 32_000;
/// How far past the blocks seen so far a new block index may point.
const MAX_BLOCK_INDEX_GAP: usize = 64;

/// Older families that reject the `thinking` parameter.
static NO_THINKING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^claude-(3-5|3-opus|3-sonnet|3-haiku|instant|2)")
        .expect("no-thinking pattern should be valid")
});

fn thinking_budget(effort: ReasoningEffort) -> u64 {
    match effort {
        ReasoningEffort::Low => 2_048,
        ReasoningEffort::Medium => 8_192,
        ReasoningEffort::High => 16_000,
    }
}

pub struct AnthropicClient {
    http: reqwest::blocking::Client,
    model: String,
    api_key: String,
    base_url: String,
    reasoning_effort: Option<ReasoningEffort>,
}

impl AnthropicClient {
    pub fn new(
        model: &str,
        api_key: String,
        base_url: &str,
        reasoning_effort: Option<ReasoningEffort>,
        timeout: Duration,
    ) -> Result<Self, ModelError> {
        let http = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| ModelError::transport(Provider::Anthropic, &err))?;
        Ok(Self {
            http,
            model: model.to_string(),
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            reasoning_effort,
        })
    }

    fn request_body(&self, request: &ModelRequest<'_>) -> Value {
        let mut body = json!({
            "model": self.model,
            "max_tokens": MAX_TOKENS,
            "system": request.system,
            "messages": anthropic_messages(request.messages),
            "stream": true,
        });
        if !request.tools.is_empty() {
            body["tools"] = Value::Array(
                request
                    .tools
                    .iter()
                    .map(|tool| {
                        json!({
                            "name": tool.name,
                            "description": tool.description,
                            "input_schema": tool.parameters,
                        })
                    })
                    .collect(),
            );
        }
        if let Some(effort) = request.reasoning_effort.or(self.reasoning_effort)
            && !NO_THINKING_RE.is_match(&self.model)
        {
            body["thinking"] = json!({
                "type": "enabled",
                "budget_tokens": thinking_budget(effort),
            });
        }
        body
    }
}

/// Convert a transcript to messages-API turns, merging consecutive same-role turns.
fn anthropic_messages(messages: &[Message]) -> Vec<Value> {
    let mut turns: Vec<(&'static str, Vec<Value>)> = Vec::new();
    for message in messages {
        let (role, blocks) = match message {
            Message::User(text) => ("user", vec![json!({"type": "text", "text": text})]),
            Message::Assistant(assistant) => ("assistant", assistant_blocks(assistant)),
            Message::ToolResult {
                call_id, content, ..
            } => (
                "user",
                vec![json!({"type": "tool_result", "tool_use_id": call_id, "content": content})],
            ),
        };
        match turns.last_mut() {
            Some((last_role, last_blocks)) if *last_role == role => last_blocks.extend(blocks),
            _ => turns.push((role, blocks)),
        }
    }
    turns
        .into_iter()
        .map(|(role, blocks)| json!({"role": role, "content": blocks}))
        .collect()
}

fn assistant_blocks(assistant: &AssistantMessage) -> Vec<Value> {
    if let Some(Value::Array(native)) = &assistant.native {
        return native.clone();
    }
    let mut blocks = Vec::new();
    if let Some(text) = assistant.text.as_deref().filter(|t| !t.is_empty()) {
        blocks.push(json!({"type": "text", "text": text}));
    }
    if let Some(call) = &assistant.tool_call {
        blocks.push(json!({
            "type": "tool_use",
            "id": call.id,
            "name": call.name,
            "input": call.arguments,
        }));
    }
    blocks
}

/// Accumulates content blocks from a streamed message.
#[derive(Debug, Default)]
struct StreamState {
    blocks: Vec<Value>,
    partial_json: HashMap<usize, String>,
}

impl StreamState {
    fn apply(&mut self, event: &Value, on_delta: &mut DeltaSink<'_>) -> Result<(), ModelError> {
        let index = event
            .get("index")
            .and_then(Value::as_u64)
            .and_then(|i| usize::try_from(i).ok());
        match event.get("type").and_then(Value::as_str) {
            Some("content_block_start") => {
                let (Some(index), Some(block)) = (index, event.get("content_block")) else {
                    return Ok(());
                };
                if index > self.blocks.len() + MAX_BLOCK_INDEX_GAP {
                    return Err(ModelError::Malformed {
                        provider: Provider::Anthropic,
                        message: format!("content block index {index} is out of range"),
                    });
                }
                if self.blocks.len() <= index {
                    self.blocks.resize(index + 1, Value::Null);
                }
                self.blocks[index] = block.clone();
            }
            Some("content_block_delta") => {
                let (Some(index), Some(delta)) = (index, event.get("delta")) else {
                    return Ok(());
                };
                let Some(block) = self.blocks.get_mut(index) else {
                    return Ok(());
                };
                match delta.get("type").and_then(Value::as_str) {
                    Some("text_delta") => {
                        let text = delta.get("text").and_then(Value::as_str).unwrap_or_default();
                        append_str(block, "text", text);
                        on_delta(DeltaKind::Text, text);
                    }
                    Some("thinking_delta") => {
                        let text = delta
                            .get("thinking")
                            .and_then(Value::as_str)
                            .unwrap_or_default();
                        append_str(block, "thinking", text);
                        on_delta(DeltaKind::Thinking, text);
                    }
                    Some("signature_delta") => {
                        let sig = delta
                            .get("signature")
                            .and_then(Value::as_str)
                            .unwrap_or_default();
                        append_str(block, "signature", sig);
                    }
                    Some("input_json_delta") => {
                        let part = delta
                            .get("partial_json")
                            .and_then(Value::as_str)
                            .unwrap_or_default();
                        self.partial_json.entry(index).or_default().push_str(part);
                        on_delta(DeltaKind::ToolArgs, part);
                    }
                    _ => {}
                }
            }
            Some("content_block_stop") => {
                if let Some(index) = index
                    && let Some(raw) = self.partial_json.remove(&index)
                    && let Some(block) = self.blocks.get_mut(index)
                {
                    block["input"] = parse_arguments(&raw);
                }
            }
            Some("error") => {
                let message = event
                    .get("error")
                    .and_then(|e| e.get("message"))
                    .and_then(Value::as_str)
                    .unwrap_or("stream error")
                    .to_string();
                return Err(ModelError::Provider {
                    provider: Provider::Anthropic,
                    status: None,
                    message,
                });
            }
            _ => {}
        }
        Ok(())
    }

    fn finish(self) -> Result<ModelReply, ModelError> {
        let mut native = Vec::new();
        let mut text = String::new();
        let mut call: Option<ToolCall> = None;
        for block in self.blocks.into_iter().filter(|b| !b.is_null()) {
            match block.get("type").and_then(Value::as_str) {
                Some("text") => {
                    text.push_str(block.get("text").and_then(Value::as_str).unwrap_or_default());
                }
                // Only the first tool use is dispatched, so later ones are dropped
                // to keep every tool_use paired with a tool_result.
                Some("tool_use") if call.is_some() => continue,
                Some("tool_use") => {
                    call = Some(ToolCall {
                        id: block
                            .get("id")
                            .and_then(Value::as_str)
                            .unwrap_or("toolu_0")
                            .to_string(),
                        name: block
                            .get("name")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                        arguments: block.get("input").cloned().unwrap_or_else(|| json!({})),
                    });
                }
                _ => {}
            }
            native.push(block);
        }

        let text = Some(text).filter(|t| !t.trim().is_empty());
        let response = match (&call, &text) {
            (Some(call), _) => ModelResponse::ToolCall(call.clone()),
            (None, Some(text)) => ModelResponse::FinalAnswer(text.clone()),
            (None, None) => {
                return Err(ModelError::Malformed {
                    provider: Provider::Anthropic,
                    message: "response had neither text nor a tool use".to_string(),
                });
            }
        };
        Ok(ModelReply {
            response,
            message: AssistantMessage {
                text,
                tool_call: call,
                native: Some(Value::Array(native)),
            },
        })
    }
}

fn append_str(block: &mut Value, key: &str, suffix: &str) {
    let current = block.get(key).and_then(Value::as_str).unwrap_or_default();
    block[key] = Value::String(format!("{current}{suffix}"));
}

impl Model for AnthropicClient {
    fn name(&self) -> &str {
        &self.model
    }

    #[instrument(skip_all, fields(model = %self.model))]
    fn invoke(
        &self,
        request: &ModelRequest<'_>,
        on_delta: &mut DeltaSink<'_>,
    ) -> Result<ModelReply, ModelError> {
        let url = format!("{}/messages", self.base_url);
        debug!(url = %url, "sending messages request");
        let response = self
            .http
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&self.request_body(request))
            .send()
            .map_err(|err| ModelError::transport(Provider::Anthropic, &err))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(ModelError::from_status(
                Provider::Anthropic,
                status.as_u16(),
                &body,
            ));
        }

        let mut state = StreamState::default();
        for event in SseReader::new(BufReader::new(response)) {
            let data = event.map_err(|err| ModelError::Provider {
                provider: Provider::Anthropic,
                status: None,
                message: format!("read stream: {err}"),
            })?;
            match serde_json::from_str::<Value>(&data) {
                Ok(event) => state.apply(&event, on_delta)?,
                Err(err) => debug!(err = %err, "skipping unparseable stream event"),
            }
        }
        state.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thinking_and_tool_use_stream_is_assembled() {
        let mut state = StreamState::default();
        let mut kinds = Vec::new();
        let mut sink = |kind: DeltaKind, _: &str| kinds.push(kind);
        let events = [
            json!({"type": "message_start", "message": {}}),
            json!({"type": "content_block_start", "index": 0, "content_block": {"type": "thinking", "thinking": ""}}),
            json!({"type": "content_block_delta", "index": 0, "delta": {"type": "thinking_delta", "thinking": "look"}}),
            json!({"type": "content_block_delta", "index": 0, "delta": {"type": "signature_delta", "signature": "sig"}}),
            json!({"type": "content_block_stop", "index": 0}),
            json!({"type": "content_block_start", "index": 1, "content_block": {"type": "tool_use", "id": "toolu_1", "name": "read_file", "input": {}}}),
            json!({"type": "content_block_delta", "index": 1, "delta": {"type": "input_json_delta", "partial_json": "{\"path\": \"a"}}),
            json!({"type": "content_block_delta", "index": 1, "delta": {"type": "input_json_delta", "partial_json": ".txt\"}"}}),
            json!({"type": "content_block_stop", "index": 1}),
            json!({"type": "content_block_start", "index": 2, "content_block": {"type": "tool_use", "id": "toolu_2", "name": "search", "input": {}}}),
            json!({"type": "content_block_stop", "index": 2}),
            json!({"type": "message_stop"}),
        ];
        for event in &events {
            state.apply(event, &mut sink).expect("apply");
        }
        let reply = state.finish().expect("reply");
        assert_eq!(
            reply.response,
            ModelResponse::ToolCall(ToolCall {
                id: "toolu_1".to_string(),
                name: "read_file".to_string(),
                arguments: json!({"path": "a.txt"}),
            })
        );
        let native = reply.message.native.expect("native");
        assert_eq!(native.as_array().map(Vec::len), Some(2));
        assert_eq!(native[0]["signature"], json!("sig"));
        assert_eq!(
            kinds,
            vec![DeltaKind::Thinking, DeltaKind::ToolArgs, DeltaKind::ToolArgs]
        );
    }

    #[test]
    fn far_out_of_range_block_index_is_malformed() {
        let mut state = StreamState::default();
        let mut sink = |_: DeltaKind, _: &str| {};
        let err = state
            .apply(
                &json!({"type": "content_block_start", "index": 4_000_000_000u64, "content_block": {"type": "text", "text": ""}}),
                &mut sink,
            )
            .unwrap_err();
        assert!(matches!(err, ModelError::Malformed { .. }));
        assert!(state.blocks.is_empty());
    }

    #[test]
    fn stream_error_event_is_provider_error() {
        let mut state = StreamState::default();
        let mut sink = |_: DeltaKind, _: &str| {};
        let err = state
            .apply(
                &json!({"type": "error", "error": {"type": "overloaded_error", "message": "Overloaded"}}),
                &mut sink,
            )
            .unwrap_err();
        assert!(err.is_transient());
        assert!(err.to_string().contains("Overloaded"));
    }

    #[test]
    fn tool_results_merge_into_following_user_turn() {
        let messages = anthropic_messages(&[
            Message::User("objective".to_string()),
            Message::Assistant(AssistantMessage {
                tool_call: Some(ToolCall {
                    id: "t1".to_string(),
                    name: "list_files".to_string(),
                    arguments: json!({}),
                }),
                ..AssistantMessage::default()
            }),
            Message::ToolResult {
                call_id: "t1".to_string(),
                name: "list_files".to_string(),
                content: "a.txt".to_string(),
            },
            Message::User("Final answer rejected".to_string()),
        ]);
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[1]["content"][0]["type"], json!("tool_use"));
        assert_eq!(messages[2]["role"], json!("user"));
        assert_eq!(messages[2]["content"].as_array().map(Vec::len), Some(2));
    }

    #[test]
    fn thinking_budget_follows_effort() {
        let client = AnthropicClient::new(
            "claude-opus-4-6",
            "key".to_string(),
            "http://127.0.0.1:9/v1",
            Some(ReasoningEffort::Low),
            Duration::from_secs(1),
        )
        .expect("client");
        let request = ModelRequest {
            system: "sys",
            messages: &[],
            tools: &[],
            reasoning_effort: None,
        };
        assert_eq!(client.request_body(&request)["thinking"]["budget_tokens"], json!(2048));

        let legacy = AnthropicClient::new(
            "claude-3-5-sonnet-latest",
            "key".to_string(),
            "http://127.0.0.1:9/v1",
            Some(ReasoningEffort::High),
            Duration::from_secs(1),
        )
        .expect("client");
        assert!(legacy.request_body(&request).get("thinking").is_none());
    }
}
