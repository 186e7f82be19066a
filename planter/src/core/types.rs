//! Shared deterministic types for the solve engine.
//!
//! These types define stable contracts between the step loop, the model
//! gateway, the sandbox and the session runtime. They carry no I/O and must
//! serialize the same way across runs so event logs stay replayable.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::truncate::truncate_chars;

/// Reasoning effort hint forwarded to model backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningEffort {
    Low,
    Medium,
    High,
}

impl ReasoningEffort {
    pub fn as_str(self) -> &'static str {
        match self {
            ReasoningEffort::Low => "low",
            ReasoningEffort::Medium => "medium",
            ReasoningEffort::High => "high",
        }
    }

    /// Parse a possibly blank effort value. Blank input means "unset".
    pub fn parse_optional(value: &str) -> Result<Option<Self>, String> {
        let cleaned = value.trim();
        if cleaned.is_empty() {
            return Ok(None);
        }
        cleaned.parse().map(Some)
    }
}

impl FromStr for ReasoningEffort {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(ReasoningEffort::Low),
            "medium" => Ok(ReasoningEffort::Medium),
            "high" => Ok(ReasoningEffort::High),
            _ => Err(format!(
                "invalid reasoning effort '{value}' (expected one of: high, low, medium)"
            )),
        }
    }
}

impl fmt::Display for ReasoningEffort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// Assistant turn as recorded in a transcript.
///
/// At most one tool call is kept per turn; the step loop dispatches calls one
/// at a time.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AssistantMessage {
    pub text: Option<String>,
    pub tool_call: Option<ToolCall>,
    /// Provider-native content blocks that must be sent back verbatim on the
    /// next request (signed thinking blocks, for example).
    pub native: Option<Value>,
}

/// One turn of a step-loop transcript.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    User(String),
    Assistant(AssistantMessage),
    ToolResult {
        call_id: String,
        name: String,
        content: String,
    },
}

/// Tool definition advertised to the model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON Schema for the tool arguments.
    pub parameters: Value,
}

/// Everything a model backend needs for one invocation.
#[derive(Debug, Clone, Copy)]
pub struct ModelRequest<'a> {
    pub system: &'a str,
    pub messages: &'a [Message],
    pub tools: &'a [ToolSpec],
    /// Overrides the client's configured effort when set.
    pub reasoning_effort: Option<ReasoningEffort>,
}

/// Tagged result of one model invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelResponse {
    ToolCall(ToolCall),
    FinalAnswer(String),
}

/// A model response together with the assistant turn to append to the transcript.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelReply {
    pub response: ModelResponse,
    pub message: AssistantMessage,
}

impl ModelReply {
    pub fn final_answer(text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            message: AssistantMessage {
                text: Some(text.clone()),
                ..AssistantMessage::default()
            },
            response: ModelResponse::FinalAnswer(text),
        }
    }

    pub fn tool_call(call: ToolCall) -> Self {
        Self {
            message: AssistantMessage {
                tool_call: Some(call.clone()),
                ..AssistantMessage::default()
            },
            response: ModelResponse::ToolCall(call),
        }
    }
}

/// Kind of streamed content fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeltaKind {
    Text,
    Thinking,
    ToolArgs,
}

impl DeltaKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DeltaKind::Text => "text",
            DeltaKind::Thinking => "thinking",
            DeltaKind::ToolArgs => "tool_args",
        }
    }
}

/// A tool result normalized for the model's context.
///
/// `text` never exceeds the cap it was built with; when the raw result was
/// longer, `text` is a prefix of it followed by a truncation marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Observation {
    pub tool: String,
    pub text: String,
    pub truncated: bool,
}

impl Observation {
    pub fn new(tool: impl Into<String>, raw: &str, cap: usize) -> Self {
        let (text, truncated) = truncate_chars(raw, cap);
        Self {
            tool: tool.into(),
            text,
            truncated,
        }
    }
}

/// Kind of externally visible unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepKind {
    ToolCall,
    SubDelegation,
    FinalAnswer,
}

/// One step emitted by a step loop. Immutable once emitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    /// 1-indexed step number within the emitting step loop.
    pub step: u32,
    pub depth: u32,
    pub kind: StepKind,
    pub payload: Value,
    /// Seconds since the session's solve call started.
    pub elapsed_secs: f64,
}

impl StepRecord {
    /// One-line description used for persisted summaries and CLI output.
    pub fn summary(&self) -> String {
        let label = match self.kind {
            StepKind::ToolCall => "tool",
            StepKind::SubDelegation => "subtask",
            StepKind::FinalAnswer => "final",
        };
        let detail = match self.kind {
            StepKind::FinalAnswer => self.payload.get("answer"),
            StepKind::SubDelegation => self.payload.get("objective"),
            StepKind::ToolCall => self.payload.get("tool"),
        }
        .and_then(Value::as_str)
        .unwrap_or_default();
        let (detail, _) = truncate_chars(detail.lines().next().unwrap_or_default(), 120);
        format!(
            "d{} s{} {label}: {detail} ({:.1}s)",
            self.depth, self.step, self.elapsed_secs
        )
    }
}

/// Lifecycle status of a persisted session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Running,
    Complete,
    Failed,
    Stopped,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Running => "running",
            SessionStatus::Complete => "complete",
            SessionStatus::Failed => "failed",
            SessionStatus::Stopped => "stopped",
        }
    }
}

/// Terminal outcome of one `solve` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SolveStatus {
    Complete,
    /// Step or time budget ran out; the answer is best-effort.
    BudgetExhausted,
    Failed,
    Stopped,
}

impl SolveStatus {
    /// Budget exhaustion is a normal terminal state for the session.
    pub fn session_status(self) -> SessionStatus {
        match self {
            SolveStatus::Complete | SolveStatus::BudgetExhausted => SessionStatus::Complete,
            SolveStatus::Failed => SessionStatus::Failed,
            SolveStatus::Stopped => SessionStatus::Stopped,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SolveStatus::Complete => "complete",
            SolveStatus::BudgetExhausted => "budget_exhausted",
            SolveStatus::Failed => "failed",
            SolveStatus::Stopped => "stopped",
        }
    }
}

/// Kind of one event-log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    SessionStarted,
    Trace,
    Step,
    Delta,
    SessionFinished,
}

impl EventKind {
    /// Events that must never be reordered behind a batched event.
    pub fn is_ordering_barrier(self) -> bool {
        matches!(self, EventKind::Step | EventKind::SessionFinished)
    }
}

/// One line of a session's `events.jsonl`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub seq: u64,
    #[serde(rename = "type")]
    pub kind: EventKind,
    /// RFC 3339 UTC timestamp.
    pub ts: String,
    pub data: Value,
}
