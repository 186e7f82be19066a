//! Recursive decomposition: drives step loops and runs delegated children.
//!
//! Recursion is plain call-stack recursion. A child runs to completion on the
//! caller's thread before the parent's next turn, with a fresh transcript
//! seeded only from the delegated objective and artifacts.

use tracing::{info, instrument, warn};

use super::step_loop::{
    Advance, DelegationRequest, DelegationResult, LoopOutcome, LoopStatus, StepLoop,
};
use super::{Engine, SolveContext};
use crate::core::truncate::truncate_chars;
use crate::core::types::ReasoningEffort;
use crate::io::model::Model;

impl Engine {
    /// Investigate the root objective at depth 0 with the session's model.
    pub fn investigate(&self, objective: &str, ctx: &mut SolveContext<'_>) -> LoopOutcome {
        self.investigate_at(objective, 0, self.model(), None, ctx)
    }

    #[instrument(skip_all, fields(depth = depth, model = model.name()))]
    fn investigate_at(
        &self,
        objective: &str,
        depth: u32,
        model: &dyn Model,
        reasoning_effort: Option<ReasoningEffort>,
        ctx: &mut SolveContext<'_>,
    ) -> LoopOutcome {
        let mut step_loop = match StepLoop::new(self, model, objective, depth, reasoning_effort) {
            Ok(step_loop) => step_loop,
            Err(err) => {
                warn!(depth, err = %err, "could not start step loop");
                return LoopOutcome::failed(format!("start investigation: {err:#}"));
            }
        };
        loop {
            match step_loop.advance(ctx) {
                Advance::Delegate(request) => {
                    let result = self.delegate(&request, depth, model, reasoning_effort, ctx);
                    step_loop.complete_delegation(ctx, result);
                }
                Advance::Finished(outcome) => {
                    info!(
                        depth,
                        status = outcome.status.as_str(),
                        steps = outcome.steps,
                        "investigation ended"
                    );
                    return outcome;
                }
            }
        }
    }

    fn delegate(
        &self,
        request: &DelegationRequest,
        depth: u32,
        parent: &dyn Model,
        parent_effort: Option<ReasoningEffort>,
        ctx: &mut SolveContext<'_>,
    ) -> DelegationResult {
        let child_depth = depth + 1;
        let plan = child_plan(
            &request.args.objective,
            request.args.artifacts.as_deref(),
            self.budget().max_plan_chars,
        );
        let effort = request.args.reasoning_effort.or(parent_effort);
        let child_model =
            self.child_model(request.args.model.as_deref(), parent, effort, child_depth, ctx);
        let model: &dyn Model = match child_model.as_deref() {
            Some(child) => child,
            None => parent,
        };

        let outcome = self.investigate_at(&plan, child_depth, model, effort, ctx);
        DelegationResult {
            objective: request.args.objective.clone(),
            model: model.name().to_string(),
            observation: child_observation(&outcome),
            status: outcome.status,
        }
    }

    /// Ask the factory for a different model. `None` means reuse the parent's.
    fn child_model(
        &self,
        requested: Option<&str>,
        parent: &dyn Model,
        effort: Option<ReasoningEffort>,
        child_depth: u32,
        ctx: &mut SolveContext<'_>,
    ) -> Option<Box<dyn Model>> {
        let requested = requested.map(str::trim).filter(|name| !name.is_empty())?;
        if requested == parent.name() {
            return None;
        }
        let Some(factory) = self.factory() else {
            ctx.trace(
                child_depth,
                &format!(
                    "no model factory configured; subtask uses {} instead of {requested}",
                    parent.name()
                ),
            );
            return None;
        };
        match factory.create(requested, effort) {
            Ok(model) => {
                ctx.trace(child_depth, &format!("subtask uses model {}", model.name()));
                Some(model)
            }
            Err(err) => {
                warn!(model = requested, err = %err, "could not create subtask model");
                ctx.trace(
                    child_depth,
                    &format!(
                        "could not create model {requested}: {err}; subtask uses {}",
                        parent.name()
                    ),
                );
                None
            }
        }
    }
}

/// Objective handed to a child: the sub-objective plus any artifacts, capped.
pub fn child_plan(objective: &str, artifacts: Option<&str>, max_chars: usize) -> String {
    let objective = objective.trim();
    let plan = match artifacts.map(str::trim).filter(|a| !a.is_empty()) {
        Some(artifacts) => {
            format!("{objective}\n\nArtifacts from the parent investigation:\n{artifacts}")
        }
        None => objective.to_string(),
    };
    truncate_chars(&plan, max_chars).0
}

/// Render a child's outcome as the parent's observation text.
///
/// A child that did not finish is reported as degraded, never as a parent failure.
pub fn child_observation(outcome: &LoopOutcome) -> String {
    let answer = outcome.answer.trim();
    match &outcome.status {
        LoopStatus::Finished => answer.to_string(),
        LoopStatus::BudgetExhausted => format!(
            "subtask ran out of budget after {} steps; partial result:\n{answer}",
            outcome.steps
        ),
        LoopStatus::Stopped => "subtask stopped before it finished".to_string(),
        LoopStatus::Failed(message) if answer.is_empty() => {
            format!("error: subtask failed: {message}")
        }
        LoopStatus::Failed(message) => {
            format!("error: subtask failed: {message}\npartial result:\n{answer}")
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::core::budget::Budget;
    use crate::core::cancel::CancellationToken;
    use crate::core::types::{Message, StepKind};
    use crate::test_support::{
        RecordingObserver, ScriptedFactory, ScriptedModel, ScriptedSandbox, final_answer, tool_call,
    };

    fn budget() -> Budget {
        Budget {
            acceptance_criteria: false,
            ..Budget::default()
        }
    }

    fn subtask(objective: &str) -> crate::core::types::ModelReply {
        tool_call("subtask", json!({"objective": objective, "artifacts": "a.txt has 3 lines"}))
    }

    #[test]
    fn child_result_becomes_parent_observation() {
        let model = ScriptedModel::new(vec![
            subtask("count lines"),
            final_answer("child: 3 lines"),
            final_answer("parent: 3 lines"),
        ]);
        let requests = model.requests_handle();
        let engine = Engine::new(Box::new(model), Box::new(ScriptedSandbox::new()), budget())
            .expect("engine");
        let cancel = CancellationToken::new();
        let mut observer = RecordingObserver::default();
        let outcome = engine.investigate(
            "root",
            &mut SolveContext::new(&mut observer, &cancel, engine.budget()),
        );

        assert_eq!(outcome.status, LoopStatus::Finished);
        assert_eq!(outcome.answer, "parent: 3 lines");
        let shape: Vec<(u32, StepKind)> = observer.steps.iter().map(|r| (r.depth, r.kind)).collect();
        assert_eq!(
            shape,
            vec![
                (1, StepKind::FinalAnswer),
                (0, StepKind::SubDelegation),
                (0, StepKind::FinalAnswer),
            ]
        );
        assert_eq!(observer.steps[1].payload["observation"], json!("child: 3 lines"));

        let requests = requests.lock().expect("requests");
        // The child sees only its own objective and artifacts.
        let Message::User(child_objective) = &requests[1].messages[0] else {
            panic!("child should start with a user turn");
        };
        assert!(child_objective.starts_with("count lines"));
        assert!(child_objective.contains("a.txt has 3 lines"));
        assert_eq!(requests[1].messages.len(), 1);
    }

    #[test]
    fn depth_never_exceeds_max_depth() {
        let model = ScriptedModel::repeating(subtask("go deeper"));
        let engine = Engine::new(
            Box::new(model),
            Box::new(ScriptedSandbox::new()),
            Budget {
                max_depth: 2,
                max_steps_per_call: 2,
                ..budget()
            },
        )
        .expect("engine");
        let cancel = CancellationToken::new();
        let mut observer = RecordingObserver::default();
        engine.investigate(
            "root",
            &mut SolveContext::new(&mut observer, &cancel, engine.budget()),
        );

        assert!(!observer.steps.is_empty());
        assert!(observer.steps.iter().all(|r| r.depth <= 2));
        assert!(observer.steps.iter().any(|r| r.depth == 2));
        let leaf_delegations = observer
            .steps
            .iter()
            .filter(|r| r.depth == 2 && r.kind == StepKind::SubDelegation)
            .count();
        assert_eq!(leaf_delegations, 0);
    }

    #[test]
    fn child_abort_is_a_degraded_observation() {
        let model = ScriptedModel::from_results(vec![
            Ok(subtask("fragile")),
            Err(ScriptedModel::auth_error()),
            Ok(final_answer("parent recovered")),
        ]);
        let engine = Engine::new(Box::new(model), Box::new(ScriptedSandbox::new()), budget())
            .expect("engine");
        let cancel = CancellationToken::new();
        let mut observer = RecordingObserver::default();
        let outcome = engine.investigate(
            "root",
            &mut SolveContext::new(&mut observer, &cancel, engine.budget()),
        );

        assert_eq!(outcome.status, LoopStatus::Finished);
        let delegation = &observer.steps[0];
        assert_eq!(delegation.kind, StepKind::SubDelegation);
        assert_eq!(delegation.payload["status"], json!("failed"));
        assert!(
            delegation.payload["observation"]
                .as_str()
                .expect("observation")
                .starts_with("error: subtask failed")
        );
    }

    #[test]
    fn requested_model_comes_from_factory() {
        let parent = ScriptedModel::new(vec![
            tool_call("subtask", json!({"objective": "leaf", "model": "cheap-model"})),
            final_answer("parent done"),
        ]);
        let factory = ScriptedFactory::new().with_model(
            "cheap-model",
            ScriptedModel::new(vec![final_answer("leaf done")]).named("cheap-model"),
        );
        let created = factory.created_handle();
        let engine = Engine::new(Box::new(parent), Box::new(ScriptedSandbox::new()), budget())
            .expect("engine")
            .with_factory(Box::new(factory));
        let cancel = CancellationToken::new();
        let mut observer = RecordingObserver::default();
        let outcome = engine.investigate(
            "root",
            &mut SolveContext::new(&mut observer, &cancel, engine.budget()),
        );

        assert_eq!(outcome.answer, "parent done");
        assert_eq!(*created.lock().expect("created"), vec!["cheap-model".to_string()]);
        assert_eq!(observer.steps[1].payload["model"], json!("cheap-model"));
    }

    #[test]
    fn missing_factory_falls_back_to_parent_model() {
        let parent = ScriptedModel::new(vec![
            tool_call("subtask", json!({"objective": "leaf", "model": "cheap-model"})),
            final_answer("leaf done by parent model"),
            final_answer("parent done"),
        ]);
        let engine = Engine::new(Box::new(parent), Box::new(ScriptedSandbox::new()), budget())
            .expect("engine");
        let cancel = CancellationToken::new();
        let mut observer = RecordingObserver::default();
        let outcome = engine.investigate(
            "root",
            &mut SolveContext::new(&mut observer, &cancel, engine.budget()),
        );

        assert_eq!(outcome.answer, "parent done");
        assert!(observer.traces.iter().any(|t| t.contains("no model factory configured")));
    }

    #[test]
    fn plan_is_capped() {
        let plan = child_plan("objective", Some(&"x".repeat(500)), 100);
        assert!(plan.chars().count() <= 100);
        assert!(plan.starts_with("objective\n\nArtifacts"));
        assert_eq!(child_plan("  only objective ", Some("  "), 100), "only objective");
    }

    #[test]
    fn exhausted_child_reports_partial_result() {
        let text = child_observation(&LoopOutcome {
            status: LoopStatus::BudgetExhausted,
            answer: "[budget exhausted] step budget of 2 exhausted".to_string(),
            steps: 2,
        });
        assert!(text.starts_with("subtask ran out of budget after 2 steps"));
    }
}
