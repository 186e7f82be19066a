//! One bounded conversation between a model and the sandbox.
//!
//! A [`StepLoop`] owns its transcript and advances until the model answers,
//! a budget runs out, or the model asks to delegate. Delegation hands control
//! back to the caller (see [`super::decomposer`]), which runs the child and
//! resumes the loop with [`StepLoop::complete_delegation`].

use std::time::Instant;

use anyhow::Result;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use super::tools::{SUBTASK_TOOL, SubtaskArgs, ToolOutput, parse_subtask};
use super::{Engine, SolveContext};
use crate::core::acceptance::check_acceptance;
use crate::core::budget::deadline_passed;
use crate::core::types::{
    DeltaKind, Message, ModelReply, ModelRequest, ModelResponse, Observation, ReasoningEffort,
    StepKind, StepRecord, ToolCall, ToolSpec,
};
use crate::engine::prompt::{PromptInputs, objective_message};
use crate::io::model::{Model, ModelError};

/// Marker prepended to answers produced when a budget runs out.
pub const BUDGET_EXHAUSTED_MARKER: &str = "[budget exhausted]";

/// Lifecycle of one step loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Running,
    ModelWaiting,
    ToolExecuting,
    Finished,
    Aborted,
}

/// How a step loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopStatus {
    Finished,
    BudgetExhausted,
    Stopped,
    Failed(String),
}

impl LoopStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoopStatus::Finished => "finished",
            LoopStatus::BudgetExhausted => "budget_exhausted",
            LoopStatus::Stopped => "stopped",
            LoopStatus::Failed(_) => "failed",
        }
    }
}

/// Distilled result of a step loop. The transcript does not survive it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopOutcome {
    pub status: LoopStatus,
    pub answer: String,
    pub steps: u32,
}

impl LoopOutcome {
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: LoopStatus::Failed(message.into()),
            answer: String::new(),
            steps: 0,
        }
    }
}

/// A validated delegation directive waiting for the decomposer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelegationRequest {
    pub call_id: String,
    pub args: SubtaskArgs,
}

/// Child result folded back into the parent transcript.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelegationResult {
    pub objective: String,
    pub model: String,
    pub status: LoopStatus,
    /// Raw observation text before capping.
    pub observation: String,
}

/// What the caller must do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Advance {
    Delegate(DelegationRequest),
    Finished(LoopOutcome),
}

pub struct StepLoop<'e> {
    engine: &'e Engine,
    model: &'e dyn Model,
    depth: u32,
    reasoning_effort: Option<ReasoningEffort>,
    system: String,
    tools: Vec<ToolSpec>,
    transcript: Vec<Message>,
    steps: u32,
    state: LoopState,
    pending: Option<DelegationRequest>,
    last_answer: Option<String>,
    last_observation: Option<String>,
}

impl<'e> StepLoop<'e> {
    /// Seed a fresh transcript with the objective.
    pub fn new(
        engine: &'e Engine,
        model: &'e dyn Model,
        objective: &str,
        depth: u32,
        reasoning_effort: Option<ReasoningEffort>,
    ) -> Result<Self> {
        let budget = engine.budget();
        let may_delegate = budget.may_delegate(depth);
        let web_search = engine.sandbox().web_search_available();
        let system = engine.prompts().render_system(&PromptInputs {
            depth,
            max_depth: budget.max_depth,
            max_steps: budget.max_steps_per_call,
            may_delegate,
            acceptance_criteria: budget.acceptance_criteria,
            web_search,
            command_timeout_sec: budget.command_timeout_sec,
            max_solve_seconds: budget.max_solve_seconds,
            workspace: engine.workspace_label().map(str::to_string),
        })?;
        Ok(Self {
            engine,
            model,
            depth,
            reasoning_effort,
            system,
            tools: engine.tools().specs(may_delegate, web_search),
            transcript: vec![Message::User(objective_message(objective))],
            steps: 0,
            state: LoopState::Running,
            pending: None,
            last_answer: None,
            last_observation: None,
        })
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn steps(&self) -> u32 {
        self.steps
    }

    /// Run model turns until the loop finishes or asks for a child investigation.
    pub fn advance(&mut self, ctx: &mut SolveContext<'_>) -> Advance {
        let engine = self.engine;
        let budget = engine.budget();
        loop {
            if ctx.cancel.is_cancelled() {
                ctx.trace(self.depth, "session stopped; aborting step loop");
                return self.abort(LoopStatus::Stopped, "[stopped]");
            }
            if deadline_passed(ctx.deadline) {
                let reason = format!("time budget of {}s exhausted", budget.max_solve_seconds);
                ctx.trace(self.depth, &reason);
                return self.exhausted(&reason);
            }
            if self.steps >= budget.max_steps_per_call {
                let reason = format!("step budget of {} exhausted", budget.max_steps_per_call);
                ctx.trace(self.depth, &reason);
                return self.exhausted(&reason);
            }

            self.state = LoopState::ModelWaiting;
            let reply = match self.invoke(ctx) {
                Ok(reply) => reply,
                Err(err) => {
                    warn!(depth = self.depth, err = %err, "model call failed");
                    ctx.trace(self.depth, &format!("model call failed: {err}"));
                    let partial = self.best_effort();
                    self.state = LoopState::Aborted;
                    return Advance::Finished(LoopOutcome {
                        status: LoopStatus::Failed(err.to_string()),
                        answer: partial,
                        steps: self.steps,
                    });
                }
            };
            self.state = LoopState::Running;

            match reply.response {
                ModelResponse::FinalAnswer(answer) => {
                    if let Some(gap) = self.acceptance_gap(&answer) {
                        self.steps += 1;
                        ctx.trace(
                            self.depth,
                            &format!("step {}: final answer rejected by acceptance check", self.steps),
                        );
                        self.transcript.push(Message::Assistant(reply.message));
                        self.transcript.push(Message::User(gap));
                        self.last_answer = Some(answer);
                        continue;
                    }
                    self.steps += 1;
                    self.emit(ctx, StepKind::FinalAnswer, json!({ "answer": answer }));
                    self.state = LoopState::Finished;
                    info!(depth = self.depth, steps = self.steps, "step loop finished");
                    return Advance::Finished(LoopOutcome {
                        status: LoopStatus::Finished,
                        answer,
                        steps: self.steps,
                    });
                }
                ModelResponse::ToolCall(call) => {
                    self.transcript.push(Message::Assistant(reply.message));
                    if call.name == SUBTASK_TOOL {
                        if let Some(request) = self.delegation(ctx, &call) {
                            self.state = LoopState::ToolExecuting;
                            self.pending = Some(request.clone());
                            return Advance::Delegate(request);
                        }
                        continue;
                    }
                    self.state = LoopState::ToolExecuting;
                    let output = engine.tools().execute(engine.sandbox(), &call);
                    self.record_tool(ctx, &call, &output);
                    self.state = LoopState::Running;
                }
            }
        }
    }

    /// Fold a child investigation's result back as one observation.
    pub fn complete_delegation(&mut self, ctx: &mut SolveContext<'_>, result: DelegationResult) {
        let Some(request) = self.pending.take() else {
            warn!(depth = self.depth, "delegation result without a pending request");
            return;
        };
        let observation = Observation::new(
            SUBTASK_TOOL,
            &result.observation,
            self.engine.budget().max_observation_chars,
        );
        self.steps += 1;
        self.emit(
            ctx,
            StepKind::SubDelegation,
            json!({
                "objective": result.objective,
                "model": result.model,
                "status": result.status.as_str(),
                "observation": observation.text,
                "truncated": observation.truncated,
            }),
        );
        self.push_observation(request.call_id, SUBTASK_TOOL, observation.text);
        self.state = LoopState::Running;
    }

    fn invoke(&self, ctx: &mut SolveContext<'_>) -> Result<ModelReply, ModelError> {
        let request = ModelRequest {
            system: &self.system,
            messages: &self.transcript,
            tools: &self.tools,
            reasoning_effort: self.reasoning_effort,
        };
        let depth = self.depth;
        let started = Instant::now();
        let first = self.model.invoke(&request, &mut |kind: DeltaKind, text: &str| {
            ctx.observer.delta(depth, kind, text);
        });
        let result = match first {
            Err(err) if err.is_transient() => {
                ctx.trace(depth, &format!("model call failed, retrying once: {err}"));
                self.model.invoke(&request, &mut |kind: DeltaKind, text: &str| {
                    ctx.observer.delta(depth, kind, text);
                })
            }
            other => other,
        };
        debug!(
            depth,
            model = self.model.name(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            ok = result.is_ok(),
            "model turn"
        );
        result
    }

    fn acceptance_gap(&self, answer: &str) -> Option<String> {
        if !self.engine.budget().acceptance_criteria || self.model.fallback_note().is_some() {
            return None;
        }
        check_acceptance(answer).gap_message()
    }

    fn delegation(&mut self, ctx: &mut SolveContext<'_>, call: &ToolCall) -> Option<DelegationRequest> {
        if !self.engine.budget().may_delegate(self.depth) {
            let raw = format!(
                "error: {SUBTASK_TOOL} is not available at depth {}; answer directly",
                self.depth
            );
            self.record_tool(ctx, call, &ToolOutput::complete(raw));
            return None;
        }
        match parse_subtask(self.engine.tools(), call) {
            Ok(args) => {
                ctx.trace(self.depth, &format!("delegating subtask: {}", first_line(&args.objective)));
                Some(DelegationRequest {
                    call_id: call.id.clone(),
                    args,
                })
            }
            Err(err) => {
                self.record_tool(ctx, call, &ToolOutput::complete(format!("error: {err}")));
                None
            }
        }
    }

    fn record_tool(&mut self, ctx: &mut SolveContext<'_>, call: &ToolCall, output: &ToolOutput) {
        let mut observation = Observation::new(
            call.name.as_str(),
            &output.text,
            self.engine.budget().max_observation_chars,
        );
        observation.truncated |= output.truncated;
        self.steps += 1;
        self.emit(
            ctx,
            StepKind::ToolCall,
            json!({
                "tool": call.name,
                "arguments": call.arguments,
                "observation": observation.text,
                "truncated": observation.truncated,
            }),
        );
        self.push_observation(call.id.clone(), &call.name, observation.text);
    }

    fn push_observation(&mut self, call_id: String, name: &str, text: String) {
        self.last_observation = Some(text.clone());
        self.transcript.push(Message::ToolResult {
            call_id,
            name: name.to_string(),
            content: text,
        });
    }

    fn emit(&self, ctx: &mut SolveContext<'_>, kind: StepKind, payload: Value) {
        let record = StepRecord {
            step: self.steps,
            depth: self.depth,
            kind,
            payload,
            elapsed_secs: ctx.started.elapsed().as_secs_f64(),
        };
        ctx.observer.step(&record);
    }

    fn exhausted(&mut self, reason: &str) -> Advance {
        self.abort(
            LoopStatus::BudgetExhausted,
            &format!("{BUDGET_EXHAUSTED_MARKER} {reason}"),
        )
    }

    fn abort(&mut self, status: LoopStatus, header: &str) -> Advance {
        self.state = LoopState::Aborted;
        let best = self.best_effort();
        let answer = if best.is_empty() {
            header.to_string()
        } else {
            format!("{header}\n{best}")
        };
        Advance::Finished(LoopOutcome {
            status,
            answer,
            steps: self.steps,
        })
    }

    fn best_effort(&self) -> String {
        if let Some(answer) = &self.last_answer {
            return answer.clone();
        }
        if let Some(observation) = &self.last_observation {
            return format!("Last observation:\n{observation}");
        }
        String::new()
    }
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or_default().trim()
}
