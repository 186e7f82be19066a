//! The recursive solve engine.
//!
//! An [`Engine`] bundles the session's model, sandbox, budget and tool
//! registry. [`Engine::investigate`] runs the root step loop and any delegated
//! children, reporting traces, steps and streamed content through a
//! [`SolveObserver`].

pub mod decomposer;
pub mod prompt;
pub mod step_loop;
pub mod tools;

use std::time::Instant;

use anyhow::{Context, Result};
use tracing::{info, instrument, warn};

use crate::core::budget::Budget;
use crate::core::cancel::CancellationToken;
use crate::core::types::{DeltaKind, StepRecord};
use crate::io::config::{AgentConfig, ConfigError};
use crate::io::model::{
    ClientSettings, ConfiguredModelFactory, EchoFallbackModel, Model, ModelClient, ModelError,
    ModelFactory, resolve_model_target,
};
use crate::io::sandbox::{Sandbox, SandboxLimits, WorkspaceSandbox};
use crate::io::web_search::WebSearchClient;

use prompt::PromptEngine;
use tools::ToolRegistry;

/// Receives everything the engine reports while solving.
pub trait SolveObserver {
    fn trace(&mut self, depth: u32, message: &str);
    fn step(&mut self, record: &StepRecord);
    fn delta(&mut self, depth: u32, kind: DeltaKind, text: &str);
}

/// Per-solve state shared by every step loop of one session.
pub struct SolveContext<'a> {
    pub observer: &'a mut dyn SolveObserver,
    pub cancel: &'a CancellationToken,
    pub started: Instant,
    pub deadline: Option<Instant>,
}

impl<'a> SolveContext<'a> {
    pub fn new(
        observer: &'a mut dyn SolveObserver,
        cancel: &'a CancellationToken,
        budget: &Budget,
    ) -> Self {
        let started = Instant::now();
        Self {
            observer,
            cancel,
            started,
            deadline: budget.solve_deadline(started),
        }
    }

    pub fn trace(&mut self, depth: u32, message: &str) {
        self.observer.trace(depth, message);
    }
}

pub struct Engine {
    model: Box<dyn Model>,
    sandbox: Box<dyn Sandbox>,
    factory: Option<Box<dyn ModelFactory>>,
    budget: Budget,
    tools: ToolRegistry,
    prompts: PromptEngine,
    workspace_label: Option<String>,
}

impl Engine {
    pub fn new(model: Box<dyn Model>, sandbox: Box<dyn Sandbox>, budget: Budget) -> Result<Self> {
        Ok(Self {
            model,
            sandbox,
            factory: None,
            budget,
            tools: ToolRegistry::new().context("load tool registry")?,
            prompts: PromptEngine::new(),
            workspace_label: None,
        })
    }

    pub fn with_factory(mut self, factory: Box<dyn ModelFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Workspace path shown to the model in the system prompt.
    pub fn with_workspace_label(mut self, label: impl Into<String>) -> Self {
        self.workspace_label = Some(label.into());
        self
    }

    pub fn model(&self) -> &dyn Model {
        self.model.as_ref()
    }

    pub fn sandbox(&self) -> &dyn Sandbox {
        self.sandbox.as_ref()
    }

    pub fn factory(&self) -> Option<&dyn ModelFactory> {
        self.factory.as_deref()
    }

    pub fn budget(&self) -> &Budget {
        &self.budget
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub fn prompts(&self) -> &PromptEngine {
        &self.prompts
    }

    pub fn workspace_label(&self) -> Option<&str> {
        self.workspace_label.as_deref()
    }

    /// Configuration problem the session model stands in for, if any.
    pub fn fallback_note(&self) -> Option<&str> {
        self.model.fallback_note()
    }
}

/// Build the engine described by `config`.
///
/// A missing credential degrades to the echo fallback model. A provider that
/// contradicts the model name is an error.
#[instrument(skip_all, fields(workspace = %config.workspace.display()))]
pub fn build_engine(config: &AgentConfig) -> Result<Engine> {
    let mut sandbox = WorkspaceSandbox::new(
        &config.workspace,
        config.shell.clone(),
        SandboxLimits::from(&config.budget),
    )
    .context("open workspace sandbox")?;
    if let Some(key) = config.exa_api_key.as_deref().filter(|k| !k.trim().is_empty()) {
        let client = WebSearchClient::new(key, &config.exa_base_url, config.network_timeout())
            .context("build web search client")?;
        sandbox = sandbox.with_web_search(client);
    }

    let model = match resolve_model_target(config) {
        Ok((provider, name)) => {
            info!(provider = %provider, model = %name, "resolved session model");
            ClientSettings::new(config)
                .client(provider, &name, config.reasoning_effort)
                .context("build model client")?
        }
        Err(ModelError::Config(ConfigError::MissingCredential(note))) => {
            warn!(note = %note, "no model credential; using echo fallback");
            ModelClient::Echo(EchoFallbackModel::new(note))
        }
        Err(err) => return Err(err).context("resolve session model"),
    };

    let workspace_label = if config.demo {
        "<workspace>".to_string()
    } else {
        config.workspace.display().to_string()
    };
    let mut engine = Engine::new(Box::new(model), Box::new(sandbox), config.budget.clone())?
        .with_workspace_label(workspace_label);
    if let Some(factory) = build_model_factory(config) {
        engine = engine.with_factory(factory);
    }
    Ok(engine)
}

/// Factory for subtask models, or `None` when no provider has a credential.
pub fn build_model_factory(config: &AgentConfig) -> Option<Box<dyn ModelFactory>> {
    ConfiguredModelFactory::from_config(config)
        .map(|factory| Box::new(factory) as Box<dyn ModelFactory>)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::provider::{Provider, ProviderChoice};

    #[test]
    fn missing_credentials_build_an_echo_engine() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = AgentConfig::new(dir.path());
        let engine = build_engine(&config).expect("engine");
        assert_eq!(engine.model().name(), "echo-fallback");
        assert!(engine.fallback_note().is_some());
        assert!(engine.factory().is_none());
        assert!(build_model_factory(&config).is_none());
    }

    #[test]
    fn provider_mismatch_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = AgentConfig::new(dir.path());
        config.provider = ProviderChoice::Explicit(Provider::OpenAi);
        config.model = "claude-opus-4-6".to_string();
        config.openai.api_key = Some("k".to_string());
        let err = build_engine(&config).err().expect("mismatch");
        assert!(matches!(
            err.downcast_ref::<ModelError>(),
            Some(ModelError::ProviderMismatch(_))
        ));
    }

    #[test]
    fn credentialed_config_builds_a_factory() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = AgentConfig::new(dir.path());
        config.anthropic.api_key = Some("k".to_string());
        let engine = build_engine(&config).expect("engine");
        assert_eq!(engine.model().name(), "claude-opus-4-6");
        assert!(engine.fallback_note().is_none());
        assert!(engine.factory().is_some());
    }
}
