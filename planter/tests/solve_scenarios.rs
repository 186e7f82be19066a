//! End-to-end solve scenarios through `SessionRuntime`.
//!
//! These drive a whole session with scripted models: the real workspace
//! sandbox, the event log on disk, and the statuses a caller sees.

use std::fs;
use std::time::Duration;

use planter::core::types::{EventKind, SessionStatus, SolveStatus, StepKind, StepRecord};
use planter::engine::step_loop::BUDGET_EXHAUSTED_MARKER;
use planter::engine::{Engine, build_engine};
use planter::io::config::AgentConfig;
use planter::io::sandbox::{SandboxLimits, WorkspaceSandbox};
use planter::runtime::SessionRuntime;
use planter::test_support::{
    ScriptedModel, final_answer, offline_config, tool_call, workspace_with_files,
};
use serde_json::json;

fn engine_for(config: &AgentConfig, model: ScriptedModel) -> Engine {
    let sandbox = WorkspaceSandbox::new(
        &config.workspace,
        config.shell.clone(),
        SandboxLimits::from(&config.budget),
    )
    .expect("sandbox");
    Engine::new(Box::new(model), Box::new(sandbox), config.budget.clone()).expect("engine")
}

fn solve(runtime: &mut SessionRuntime, objective: &str) -> (SolveStatus, String, Vec<StepRecord>) {
    let mut steps = Vec::new();
    let result = runtime
        .solve(objective, |_| {}, |record| steps.push(record.clone()), |_, _| {})
        .expect("solve");
    (result.status, result.answer, steps)
}

#[test]
fn lists_files_then_answers_without_recursion() {
    let workspace = workspace_with_files(&[("a.txt", "alpha"), ("b.txt", "beta")]);
    let mut config = offline_config(workspace.path());
    config.budget.recursive = false;
    config.budget.max_steps_per_call = 3;

    let model = ScriptedModel::new(vec![
        tool_call("list_files", json!({})),
        final_answer("two files: a.txt and b.txt"),
    ]);
    let requests = model.requests_handle();
    let engine = engine_for(&config, model);
    let mut runtime =
        SessionRuntime::bootstrap(engine, &config, Some("s-list"), false).expect("bootstrap");

    let (status, answer, steps) = solve(&mut runtime, "How many text files are there?");

    assert_eq!(status, SolveStatus::Complete);
    assert_eq!(answer, "two files: a.txt and b.txt");
    let kinds: Vec<StepKind> = steps.iter().map(|s| s.kind).collect();
    assert_eq!(kinds, vec![StepKind::ToolCall, StepKind::FinalAnswer]);
    let observation = steps[0].payload["observation"].as_str().expect("observation");
    assert!(observation.contains("a.txt"));
    assert!(observation.contains("b.txt"));

    let requests = requests.lock().expect("lock");
    assert!(requests.iter().all(|r| !r.tools.iter().any(|t| t == "subtask")));
}

#[test]
fn wall_clock_budget_ends_in_budget_exhausted() {
    let workspace = workspace_with_files(&[("a.txt", "alpha")]);
    let mut config = offline_config(workspace.path());
    config.budget.max_solve_seconds = 1;

    let model = ScriptedModel::repeating(tool_call("list_files", json!({})))
        .with_delay(Duration::from_millis(300));
    let engine = engine_for(&config, model);
    let mut runtime =
        SessionRuntime::bootstrap(engine, &config, Some("s-slow"), false).expect("bootstrap");

    let (status, answer, steps) = solve(&mut runtime, "Keep looking forever");

    assert_eq!(status, SolveStatus::BudgetExhausted);
    assert!(answer.starts_with(BUDGET_EXHAUSTED_MARKER));
    assert!(!steps.is_empty());
    assert!(steps.iter().all(|s| s.kind == StepKind::ToolCall));

    // Exhaustion still ends the session; the answer carries the marker.
    let state = runtime.store().load_state("s-slow").expect("load").expect("state");
    assert_eq!(state.status, SessionStatus::Complete);
}

#[test]
fn missing_credentials_fail_the_session_with_the_config_problem() {
    let workspace = workspace_with_files(&[]);
    let config = offline_config(workspace.path());

    let engine = build_engine(&config).expect("engine");
    let note = engine.fallback_note().expect("echo fallback").to_string();
    let mut runtime =
        SessionRuntime::bootstrap(engine, &config, Some("s-offline"), false).expect("bootstrap");
    let result = runtime
        .solve("Summarize the repo", |_| {}, |_| {}, |_, _| {})
        .expect("solve");

    assert_eq!(result.status, SolveStatus::Failed);
    assert!(result.error.expect("error").contains(&note));
    assert!(result.answer.contains("Summarize the repo"));
}

#[test]
fn child_steps_precede_the_parent_delegation_record() {
    let workspace = workspace_with_files(&[("src/lib.rs", "fn a() {}\nfn b() {}\n")]);
    let mut config = offline_config(workspace.path());
    config.budget.max_depth = 1;

    // The child shares the parent's model when no factory is configured.
    let model = ScriptedModel::new(vec![
        tool_call("subtask", json!({"objective": "count functions in src/lib.rs"})),
        final_answer("2 functions"),
        final_answer("src/lib.rs defines 2 functions"),
    ]);
    let engine = engine_for(&config, model);
    let mut runtime =
        SessionRuntime::bootstrap(engine, &config, Some("s-tree"), false).expect("bootstrap");

    let (status, answer, steps) = solve(&mut runtime, "How many functions are there?");

    assert_eq!(status, SolveStatus::Complete);
    assert_eq!(answer, "src/lib.rs defines 2 functions");
    let shape: Vec<(u32, StepKind)> = steps.iter().map(|s| (s.depth, s.kind)).collect();
    assert_eq!(
        shape,
        vec![
            (1, StepKind::FinalAnswer),
            (0, StepKind::SubDelegation),
            (0, StepKind::FinalAnswer),
        ]
    );
    assert!(steps.iter().all(|s| s.depth <= config.budget.max_depth));
    assert_eq!(steps[1].payload["observation"], json!("2 functions"));
}

#[test]
fn step_budget_is_never_exceeded() {
    let workspace = workspace_with_files(&[("a.txt", "alpha")]);
    let mut config = offline_config(workspace.path());
    config.budget.recursive = false;
    config.budget.max_steps_per_call = 4;

    let engine = engine_for(
        &config,
        ScriptedModel::repeating(tool_call("read_file", json!({"path": "a.txt"}))),
    );
    let mut runtime =
        SessionRuntime::bootstrap(engine, &config, Some("s-steps"), false).expect("bootstrap");

    let (status, answer, steps) = solve(&mut runtime, "Read a.txt repeatedly");

    assert_eq!(status, SolveStatus::BudgetExhausted);
    assert_eq!(steps.len(), 4);
    let numbers: Vec<u32> = steps.iter().map(|s| s.step).collect();
    assert_eq!(numbers, vec![1, 2, 3, 4]);
    assert!(answer.contains("alpha"));
}

#[test]
fn resumed_session_appends_to_the_existing_log() {
    let workspace = workspace_with_files(&[]);
    let config = offline_config(workspace.path());

    let first = engine_for(&config, ScriptedModel::new(vec![final_answer("first")]));
    let mut runtime =
        SessionRuntime::bootstrap(first, &config, Some("s-resume"), false).expect("bootstrap");
    solve(&mut runtime, "first question");
    let log_path = runtime.store().events_path("s-resume");
    let before = fs::read_to_string(&log_path).expect("read log");
    let first_count = before.lines().count() as u64;
    drop(runtime);

    let second = engine_for(&config, ScriptedModel::new(vec![final_answer("second")]));
    let mut runtime =
        SessionRuntime::bootstrap(second, &config, Some("s-resume"), true).expect("resume");
    assert_eq!(runtime.state().last_seq, first_count);
    let (status, answer, _) = solve(&mut runtime, "second question");
    assert_eq!(status, SolveStatus::Complete);
    assert_eq!(answer, "second");

    let after = fs::read_to_string(&log_path).expect("read log");
    assert!(after.starts_with(&before));
    let events = runtime.store().events("s-resume").expect("events");
    let seqs: Vec<u64> = events.iter().map(|e| e.seq).collect();
    assert_eq!(seqs, (1..=events.len() as u64).collect::<Vec<_>>());
    let resumed_start = &events[first_count as usize];
    assert_eq!(resumed_start.kind, EventKind::SessionStarted);
    assert_eq!(resumed_start.data["resumed"], json!(true));

    let state = runtime.store().load_state("s-resume").expect("load").expect("state");
    assert_eq!(state.step_count, 2);
    assert_eq!(state.answer.as_deref(), Some("second"));
}

#[test]
fn file_cap_is_reported_on_the_step_record() {
    let raw = "x".repeat(1000);
    let workspace = workspace_with_files(&[("big.txt", raw.as_str())]);
    let mut config = offline_config(workspace.path());
    config.budget.max_file_chars = 64;
    config.budget.max_observation_chars = 6_000;

    let model = ScriptedModel::new(vec![
        tool_call("read_file", json!({"path": "big.txt"})),
        final_answer("it is all x"),
    ]);
    let engine = engine_for(&config, model);
    let mut runtime =
        SessionRuntime::bootstrap(engine, &config, Some("s-cap"), false).expect("bootstrap");

    let (_, _, steps) = solve(&mut runtime, "What is in big.txt?");

    let payload = &steps[0].payload;
    assert_eq!(payload["truncated"], json!(true));
    let text = payload["observation"].as_str().expect("observation");
    assert!(text.chars().count() <= 64);
    let marker = text.find("\n...[truncated").expect("marker");
    assert!(raw.starts_with(&text[..marker]));
}

#[test]
fn smaller_step_budget_never_yields_more_tool_calls() {
    let workspace = workspace_with_files(&[("a.txt", "alpha")]);
    let mut previous = usize::MAX;
    for max_steps in [6, 4, 3, 2, 1] {
        let mut config = offline_config(workspace.path());
        config.budget.recursive = false;
        config.budget.max_steps_per_call = max_steps;

        let model = ScriptedModel::new(vec![
            tool_call("read_file", json!({"path": "a.txt"})),
            tool_call("list_files", json!({})),
            tool_call("search", json!({"query": "alpha"})),
            final_answer("alpha"),
        ]);
        let engine = engine_for(&config, model);
        let id = format!("s-budget-{max_steps}");
        let mut runtime = SessionRuntime::bootstrap(engine, &config, Some(id.as_str()), false)
            .expect("bootstrap");
        let (_, _, steps) = solve(&mut runtime, "Find alpha");

        let tool_calls = steps
            .iter()
            .filter(|s| s.depth == 0 && s.kind == StepKind::ToolCall)
            .count();
        assert!(tool_calls <= previous, "max_steps {max_steps}: {tool_calls} > {previous}");
        assert!(tool_calls <= max_steps as usize);
        previous = tool_calls;
    }
    assert_eq!(previous, 1);
}
