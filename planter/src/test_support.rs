//! Scripted collaborators for engine and runtime tests.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use serde_json::Value;

use crate::core::provider::Provider;
use crate::core::truncate::Capped;
use crate::core::types::{
    DeltaKind, Message, ModelReply, ModelRequest, ModelResponse, ReasoningEffort, StepRecord,
    ToolCall,
};
use crate::engine::SolveObserver;
use crate::io::config::{AgentConfig, ConfigError};
use crate::io::model::{DeltaSink, Model, ModelError, ModelFactory};
use crate::io::sandbox::{Sandbox, SearchHit, ShellOutput, ToolError};
use crate::io::web_search::WebResult;

/// A reply requesting one tool call.
pub fn tool_call(name: &str, arguments: Value) -> ModelReply {
    ModelReply::tool_call(ToolCall {
        id: format!("call_{name}"),
        name: name.to_string(),
        arguments,
    })
}

pub fn final_answer(text: &str) -> ModelReply {
    ModelReply::final_answer(text)
}

/// Config with no credentials, rooted at `workspace`.
pub fn offline_config(workspace: &Path) -> AgentConfig {
    let mut config = AgentConfig::new(workspace);
    config.budget.acceptance_criteria = false;
    config
}

/// Temporary workspace containing `files` (path, contents).
pub fn workspace_with_files(files: &[(&str, &str)]) -> tempfile::TempDir {
    let dir = tempfile::tempdir().expect("create temp workspace");
    for (path, contents) in files {
        let full = dir.path().join(path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).expect("create parent dir");
        }
        fs::write(full, contents).expect("write workspace file");
    }
    dir
}

/// What a scripted model saw on one invocation.
#[derive(Debug, Clone)]
pub struct CapturedRequest {
    pub system: String,
    pub messages: Vec<Message>,
    pub tools: Vec<String>,
    pub reasoning_effort: Option<ReasoningEffort>,
}

/// Model that replays canned replies in order.
pub struct ScriptedModel {
    name: String,
    script: Mutex<VecDeque<Result<ModelReply, ModelError>>>,
    repeat: Option<ModelReply>,
    delay: Option<Duration>,
    requests: Arc<Mutex<Vec<CapturedRequest>>>,
}

impl ScriptedModel {
    pub fn new(replies: Vec<ModelReply>) -> Self {
        Self::from_results(replies.into_iter().map(Ok).collect())
    }

    pub fn from_results(results: Vec<Result<ModelReply, ModelError>>) -> Self {
        Self {
            name: "scripted".to_string(),
            script: Mutex::new(results.into()),
            repeat: None,
            delay: None,
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Returns `reply` on every invocation.
    pub fn repeating(reply: ModelReply) -> Self {
        Self {
            repeat: Some(reply),
            ..Self::new(Vec::new())
        }
    }

    pub fn named(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    /// Sleep before every reply.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn requests_handle(&self) -> Arc<Mutex<Vec<CapturedRequest>>> {
        Arc::clone(&self.requests)
    }

    pub fn provider_error(message: &str) -> ModelError {
        ModelError::Provider {
            provider: Provider::OpenAi,
            status: Some(502),
            message: message.to_string(),
        }
    }

    pub fn auth_error() -> ModelError {
        ModelError::Auth {
            provider: Provider::OpenAi,
            message: "invalid key".to_string(),
        }
    }
}

impl Model for ScriptedModel {
    fn name(&self) -> &str {
        &self.name
    }

    fn invoke(
        &self,
        request: &ModelRequest<'_>,
        on_delta: &mut DeltaSink<'_>,
    ) -> Result<ModelReply, ModelError> {
        self.requests.lock().expect("requests lock").push(CapturedRequest {
            system: request.system.to_string(),
            messages: request.messages.to_vec(),
            tools: request.tools.iter().map(|t| t.name.clone()).collect(),
            reasoning_effort: request.reasoning_effort,
        });
        if let Some(delay) = self.delay {
            thread::sleep(delay);
        }
        let next = self.script.lock().expect("script lock").pop_front();
        let reply = match next {
            Some(result) => result?,
            None => self.repeat.clone().ok_or_else(|| ModelError::Malformed {
                provider: Provider::OpenAi,
                message: "script exhausted".to_string(),
            })?,
        };
        if let ModelResponse::FinalAnswer(text) = &reply.response {
            on_delta(DeltaKind::Text, text);
        }
        Ok(reply)
    }
}

/// Factory handing out pre-built scripted models by name.
#[derive(Default)]
pub struct ScriptedFactory {
    models: Mutex<HashMap<String, ScriptedModel>>,
    created: Arc<Mutex<Vec<String>>>,
}

impl ScriptedFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_model(self, name: &str, model: ScriptedModel) -> Self {
        self.models
            .lock()
            .expect("models lock")
            .insert(name.to_string(), model);
        self
    }

    pub fn created_handle(&self) -> Arc<Mutex<Vec<String>>> {
        Arc::clone(&self.created)
    }
}

impl ModelFactory for ScriptedFactory {
    fn create(
        &self,
        model: &str,
        _effort: Option<ReasoningEffort>,
    ) -> Result<Box<dyn Model>, ModelError> {
        let found = self.models.lock().expect("models lock").remove(model);
        match found {
            Some(scripted) => {
                self.created
                    .lock()
                    .expect("created lock")
                    .push(model.to_string());
                Ok(Box::new(scripted))
            }
            None => Err(ModelError::Config(ConfigError::MissingCredential(format!(
                "no scripted model named {model}"
            )))),
        }
    }
}

/// In-memory sandbox that records which tools were called.
pub struct ScriptedSandbox {
    root: PathBuf,
    files: BTreeMap<String, String>,
    shell: Mutex<VecDeque<Result<ShellOutput, ToolError>>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedSandbox {
    pub fn new() -> Self {
        Self {
            root: PathBuf::from("/scripted-workspace"),
            files: BTreeMap::new(),
            shell: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Add empty files.
    pub fn with_files(mut self, paths: &[&str]) -> Self {
        for path in paths {
            self.files.insert((*path).to_string(), String::new());
        }
        self
    }

    pub fn with_file(mut self, path: &str, contents: &str) -> Self {
        self.files.insert(path.to_string(), contents.to_string());
        self
    }

    /// Queue a result for the next `run_shell` call.
    pub fn with_shell(self, result: Result<ShellOutput, ToolError>) -> Self {
        self.shell.lock().expect("shell lock").push_back(result);
        self
    }

    /// Tool names in call order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls lock").clone()
    }

    fn record(&self, tool: &str) {
        self.calls.lock().expect("calls lock").push(tool.to_string());
    }
}

impl Default for ScriptedSandbox {
    fn default() -> Self {
        Self::new()
    }
}

impl Sandbox for ScriptedSandbox {
    fn root(&self) -> &Path {
        &self.root
    }

    fn run_shell(&self, _command: &str) -> Result<ShellOutput, ToolError> {
        self.record("run_shell");
        self.shell
            .lock()
            .expect("shell lock")
            .pop_front()
            .unwrap_or_else(|| {
                Ok(ShellOutput {
                    exit_code: Some(0),
                    ..ShellOutput::default()
                })
            })
    }

    fn read_file(&self, path: &str) -> Result<(String, bool), ToolError> {
        self.record("read_file");
        if path.split('/').any(|part| part == "..") {
            return Err(ToolError::OutOfBounds {
                path: path.to_string(),
            });
        }
        self.files
            .get(path)
            .map(|contents| (contents.clone(), false))
            .ok_or_else(|| ToolError::Failed(format!("no such file: {path}")))
    }

    fn write_file(&self, path: &str, _content: &str) -> Result<String, ToolError> {
        self.record("write_file");
        Ok(path.to_string())
    }

    fn list_files(&self, glob: Option<&str>) -> Result<Capped<String>, ToolError> {
        self.record("list_files");
        let suffix = glob.map(|g| g.trim_start_matches('*'));
        let items = self
            .files
            .keys()
            .filter(|path| suffix.is_none_or(|s| path.ends_with(s)))
            .cloned()
            .collect();
        Ok(Capped::from_items(items, usize::MAX))
    }

    fn search(&self, query: &str, _glob: Option<&str>) -> Result<Capped<SearchHit>, ToolError> {
        self.record("search");
        let mut hits = Vec::new();
        for (path, contents) in &self.files {
            for (idx, line) in contents.lines().enumerate() {
                if line.contains(query) {
                    hits.push(SearchHit {
                        path: path.clone(),
                        line: idx + 1,
                        text: line.to_string(),
                    });
                }
            }
        }
        Ok(Capped::from_items(hits, usize::MAX))
    }

    fn web_search_available(&self) -> bool {
        false
    }

    fn web_search(&self, _query: &str) -> Result<Capped<WebResult>, ToolError> {
        self.record("web_search");
        Err(ToolError::NotAvailable {
            tool: "web_search".to_string(),
            reason: "no search key configured".to_string(),
        })
    }
}

/// Observer that keeps everything it is told.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    pub traces: Vec<String>,
    pub steps: Vec<StepRecord>,
    pub deltas: Vec<(DeltaKind, String)>,
}

impl SolveObserver for RecordingObserver {
    fn trace(&mut self, _depth: u32, message: &str) {
        self.traces.push(message.to_string());
    }

    fn step(&mut self, record: &StepRecord) {
        self.steps.push(record.clone());
    }

    fn delta(&mut self, _depth: u32, kind: DeltaKind, text: &str) {
        self.deltas.push((kind, text.to_string()));
    }
}
