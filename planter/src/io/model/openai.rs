//! OpenAI-compatible chat-completions client (OpenAI, OpenRouter, Cerebras).

use std::collections::BTreeMap;
use std::io::BufReader;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde_json::{Map, Value, json};
use tracing::{debug, instrument};

use super::sse::SseReader;
use super::{DeltaSink, Model, ModelError};
use crate::core::provider::Provider;
use crate::core::types::{
    AssistantMessage, DeltaKind, Message, ModelReply, ModelRequest, ModelResponse, ReasoningEffort,
    ToolCall,
};

/// Model families that accept a reasoning-effort hint.
static REASONING_MODEL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(o[1-4]|gpt-5|gpt-oss)").expect("reasoning model pattern should be valid")
});

pub struct OpenAiCompatibleClient {
    http: reqwest::blocking::Client,
    provider: Provider,
    model: String,
    api_key: String,
    base_url: String,
    reasoning_effort: Option<ReasoningEffort>,
    extra_headers: Vec<(String, String)>,
}

impl OpenAiCompatibleClient {
    pub fn new(
        provider: Provider,
        model: &str,
        api_key: String,
        base_url: &str,
        reasoning_effort: Option<ReasoningEffort>,
        timeout: Duration,
        extra_headers: &[(&str, &str)],
    ) -> Result<Self, ModelError> {
        let http = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| ModelError::transport(provider, &err))?;
        Ok(Self {
            http,
            provider,
            model: model.to_string(),
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            reasoning_effort,
            extra_headers: extra_headers
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect(),
        })
    }

    fn request_body(&self, request: &ModelRequest<'_>) -> Value {
        let mut body = json!({
            "model": self.model,
            "messages": chat_messages(request.system, request.messages),
            "stream": true,
        });
        if !request.tools.is_empty() {
            body["tools"] = Value::Array(
                request
                    .tools
                    .iter()
                    .map(|tool| {
                        json!({
                            "type": "function",
                            "function": {
                                "name": tool.name,
                                "description": tool.description,
                                "parameters": tool.parameters,
                            }
                        })
                    })
                    .collect(),
            );
        }
        if let Some(effort) = request.reasoning_effort.or(self.reasoning_effort) {
            match self.provider {
                Provider::OpenRouter => {
                    body["reasoning"] = json!({"effort": effort.as_str()});
                }
                _ if REASONING_MODEL_RE.is_match(&self.model) => {
                    body["reasoning_effort"] = json!(effort.as_str());
                }
                _ => {}
            }
        }
        body
    }
}

/// Convert a transcript to chat-completions messages.
fn chat_messages(system: &str, messages: &[Message]) -> Vec<Value> {
    let mut out = vec![json!({"role": "system", "content": system})];
    for message in messages {
        out.push(match message {
            Message::User(text) => json!({"role": "user", "content": text}),
            Message::Assistant(assistant) => {
                let mut value = json!({
                    "role": "assistant",
                    "content": assistant.text.clone().map_or(Value::Null, Value::String),
                });
                if let Some(call) = &assistant.tool_call {
                    value["tool_calls"] = json!([{
                        "id": call.id,
                        "type": "function",
                        "function": {
                            "name": call.name,
                            "arguments": call.arguments.to_string(),
                        }
                    }]);
                }
                value
            }
            Message::ToolResult {
                call_id, content, ..
            } => json!({"role": "tool", "tool_call_id": call_id, "content": content}),
        });
    }
    out
}

/// Tool call assembled from streamed fragments.
#[derive(Debug, Default)]
struct PartialCall {
    id: String,
    name: String,
    arguments: String,
}

/// Accumulates one streamed completion.
#[derive(Debug, Default)]
struct StreamState {
    text: String,
    calls: BTreeMap<u64, PartialCall>,
}

impl StreamState {
    fn apply(&mut self, chunk: &Value, on_delta: &mut DeltaSink<'_>) {
        let Some(choices) = chunk.get("choices").and_then(Value::as_array) else {
            return;
        };
        for choice in choices {
            let Some(delta) = choice.get("delta") else {
                continue;
            };
            for key in ["reasoning_content", "reasoning"] {
                if let Some(thinking) = delta.get(key).and_then(Value::as_str)
                    && !thinking.is_empty()
                {
                    on_delta(DeltaKind::Thinking, thinking);
                }
            }
            if let Some(content) = delta.get("content").and_then(Value::as_str)
                && !content.is_empty()
            {
                self.text.push_str(content);
                on_delta(DeltaKind::Text, content);
            }
            let Some(calls) = delta.get("tool_calls").and_then(Value::as_array) else {
                continue;
            };
            for call in calls {
                let index = call.get("index").and_then(Value::as_u64).unwrap_or(0);
                let entry = self.calls.entry(index).or_default();
                if let Some(id) = call.get("id").and_then(Value::as_str) {
                    entry.id = id.to_string();
                }
                let Some(function) = call.get("function") else {
                    continue;
                };
                if let Some(name) = function.get("name").and_then(Value::as_str) {
                    entry.name.push_str(name);
                }
                if let Some(args) = function.get("arguments").and_then(Value::as_str)
                    && !args.is_empty()
                {
                    entry.arguments.push_str(args);
                    on_delta(DeltaKind::ToolArgs, args);
                }
            }
        }
    }

    fn finish(self, provider: Provider) -> Result<ModelReply, ModelError> {
        let text = Some(self.text).filter(|t| !t.trim().is_empty());
        if let Some(call) = self.calls.into_values().find(|c| !c.name.is_empty()) {
            let call = ToolCall {
                id: if call.id.is_empty() {
                    "call_0".to_string()
                } else {
                    call.id
                },
                name: call.name,
                arguments: parse_arguments(&call.arguments),
            };
            return Ok(ModelReply {
                response: ModelResponse::ToolCall(call.clone()),
                message: AssistantMessage {
                    text,
                    tool_call: Some(call),
                    native: None,
                },
            });
        }
        match text {
            Some(text) => Ok(ModelReply::final_answer(text)),
            None => Err(ModelError::Malformed {
                provider,
                message: "response had neither content nor a tool call".to_string(),
            }),
        }
    }
}

/// Parse streamed tool arguments. Unparseable text is kept as a string so
/// schema validation reports it to the model.
pub(crate) fn parse_arguments(raw: &str) -> Value {
    if raw.trim().is_empty() {
        return Value::Object(Map::new());
    }
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

impl Model for OpenAiCompatibleClient {
    fn name(&self) -> &str {
        &self.model
    }

    #[instrument(skip_all, fields(provider = %self.provider, model = %self.model))]
    fn invoke(
        &self,
        request: &ModelRequest<'_>,
        on_delta: &mut DeltaSink<'_>,
    ) -> Result<ModelReply, ModelError> {
        let url = format!("{}/chat/completions", self.base_url);
        let mut builder = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&self.request_body(request));
        for (key, value) in &self.extra_headers {
            builder = builder.header(key.as_str(), value.as_str());
        }
        debug!(url = %url, "sending chat completion");
        let response = builder
            .send()
            .map_err(|err| ModelError::transport(self.provider, &err))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(ModelError::from_status(self.provider, status.as_u16(), &body));
        }

        let mut state = StreamState::default();
        for event in SseReader::new(BufReader::new(response)) {
            let data = event.map_err(|err| ModelError::Provider {
                provider: self.provider,
                status: None,
                message: format!("read stream: {err}"),
            })?;
            let chunk: Value = match serde_json::from_str(&data) {
                Ok(chunk) => chunk,
                Err(err) => {
                    debug!(err = %err, "skipping unparseable stream chunk");
                    continue;
                }
            };
            if let Some(error) = chunk.get("error") {
                return Err(ModelError::Provider {
                    provider: self.provider,
                    status: None,
                    message: error.to_string(),
                });
            }
            state.apply(&chunk, on_delta);
        }
        state.finish(self.provider)
    }
}
