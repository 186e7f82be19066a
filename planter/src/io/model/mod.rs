//! Model gateway: one request/response contract over every backend.
//!
//! The [`Model`] trait is the seam the step loop talks to. Production code
//! picks a [`ModelClient`] variant once, at construction time, from the
//! provider-inference rules; tests substitute scripted models.

pub mod anthropic;
pub mod echo;
pub mod openai;
pub mod sse;

use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info};

use crate::core::provider::{
    Provider, ProviderChoice, ProviderMismatch, infer_provider, resolve_model_name,
    validate_model_provider,
};
use crate::core::types::{DeltaKind, ModelReply, ModelRequest, ReasoningEffort};
use crate::io::config::{AgentConfig, ConfigError};

pub use anthropic::AnthropicClient;
pub use echo::EchoFallbackModel;
pub use openai::OpenAiCompatibleClient;

/// Attribution headers sent to the aggregator.
pub const OPENROUTER_HEADERS: [(&str, &str); 2] = [
    ("HTTP-Referer", "https://github.com/planter"),
    ("X-Title", "Planter"),
];

/// Model backend failures. The gateway never retries them itself.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("{provider} rejected the credential: {message}")]
    Auth { provider: Provider, message: String },
    #[error("{provider} request failed: {message}")]
    Provider {
        provider: Provider,
        status: Option<u16>,
        message: String,
    },
    #[error(transparent)]
    ProviderMismatch(#[from] ProviderMismatch),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("malformed response from {provider}: {message}")]
    Malformed { provider: Provider, message: String },
}

impl ModelError {
    /// Whether one more attempt may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, ModelError::Provider { .. } | ModelError::Malformed { .. })
    }

    /// Classify an HTTP error status.
    pub fn from_status(provider: Provider, status: u16, body: &str) -> Self {
        let (message, _) = crate::core::truncate::truncate_chars(body.trim(), 500);
        let message = format!("HTTP {status}: {message}");
        if status == 401 || status == 403 {
            ModelError::Auth { provider, message }
        } else {
            ModelError::Provider {
                provider,
                status: Some(status),
                message,
            }
        }
    }

    pub fn transport(provider: Provider, err: &reqwest::Error) -> Self {
        ModelError::Provider {
            provider,
            status: err.status().map(|s| s.as_u16()),
            message: err.to_string(),
        }
    }
}

/// Callback receiving streamed content fragments.
pub type DeltaSink<'a> = dyn FnMut(DeltaKind, &str) + 'a;

/// A conversational model that either calls a tool or answers.
pub trait Model: Send + Sync {
    fn name(&self) -> &str;

    /// Run one turn, streaming partial content to `on_delta` before returning.
    fn invoke(
        &self,
        request: &ModelRequest<'_>,
        on_delta: &mut DeltaSink<'_>,
    ) -> Result<ModelReply, ModelError>;

    /// Set when this model is a stand-in for a missing configuration.
    fn fallback_note(&self) -> Option<&str> {
        None
    }
}

/// Closed set of production model clients.
pub enum ModelClient {
    OpenAiCompatible(OpenAiCompatibleClient),
    Anthropic(AnthropicClient),
    Echo(EchoFallbackModel),
}

impl Model for ModelClient {
    fn name(&self) -> &str {
        match self {
            ModelClient::OpenAiCompatible(client) => client.name(),
            ModelClient::Anthropic(client) => client.name(),
            ModelClient::Echo(client) => client.name(),
        }
    }

    fn invoke(
        &self,
        request: &ModelRequest<'_>,
        on_delta: &mut DeltaSink<'_>,
    ) -> Result<ModelReply, ModelError> {
        match self {
            ModelClient::OpenAiCompatible(client) => client.invoke(request, on_delta),
            ModelClient::Anthropic(client) => client.invoke(request, on_delta),
            ModelClient::Echo(client) => client.invoke(request, on_delta),
        }
    }

    fn fallback_note(&self) -> Option<&str> {
        match self {
            ModelClient::Echo(client) => client.fallback_note(),
            _ => None,
        }
    }
}

/// Everything needed to build a client for any provider.
#[derive(Debug, Clone)]
pub struct ClientSettings {
    config: AgentConfig,
}

impl ClientSettings {
    pub fn new(config: &AgentConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    fn timeout(&self) -> Duration {
        self.config.network_timeout()
    }

    /// Build a client for `model` on `provider`; the provider must have a key.
    pub fn client(
        &self,
        provider: Provider,
        model: &str,
        effort: Option<ReasoningEffort>,
    ) -> Result<ModelClient, ModelError> {
        let endpoint = self.config.endpoint(provider);
        let api_key = endpoint
            .api_key
            .clone()
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| missing_key(provider))?;
        info!(provider = %provider, model, "building model client");
        let client = match provider {
            Provider::Anthropic => ModelClient::Anthropic(AnthropicClient::new(
                model,
                api_key,
                &endpoint.base_url,
                effort,
                self.timeout(),
            )?),
            Provider::OpenAi | Provider::Cerebras => {
                ModelClient::OpenAiCompatible(OpenAiCompatibleClient::new(
                    provider,
                    model,
                    api_key,
                    &endpoint.base_url,
                    effort,
                    self.timeout(),
                    &[],
                )?)
            }
            Provider::OpenRouter => ModelClient::OpenAiCompatible(OpenAiCompatibleClient::new(
                provider,
                model,
                api_key,
                &endpoint.base_url,
                effort,
                self.timeout(),
                &OPENROUTER_HEADERS,
            )?),
        };
        Ok(client)
    }
}

fn missing_key(provider: Provider) -> ModelError {
    ModelError::Config(ConfigError::MissingCredential(format!(
        "provider '{provider}' has no API key (set PLANTER_{}_API_KEY or {}_API_KEY)",
        provider.as_str().to_ascii_uppercase(),
        provider.as_str().to_ascii_uppercase()
    )))
}

/// Pick the provider and model name for the session's main model.
pub fn resolve_model_target(config: &AgentConfig) -> Result<(Provider, String), ModelError> {
    match config.provider {
        ProviderChoice::Explicit(provider) => {
            let model = resolve_model_name(provider, &config.model);
            validate_model_provider(&model, provider)?;
            if !config.has_credential(provider) {
                return Err(missing_key(provider));
            }
            Ok((provider, model))
        }
        ProviderChoice::Auto => {
            let inferred = infer_provider(&config.model);
            if let Some(provider) = inferred.filter(|p| config.has_credential(*p)) {
                return Ok((provider, resolve_model_name(provider, &config.model)));
            }
            if inferred.is_none() && config.has_credential(Provider::OpenAi) {
                return Ok((Provider::OpenAi, config.model.trim().to_string()));
            }
            let provider = Provider::AUTO_ORDER
                .into_iter()
                .find(|p| config.has_credential(*p))
                .ok_or_else(|| {
                    ModelError::Config(ConfigError::MissingCredential(
                        "set an API key for anthropic, openai, openrouter or cerebras".to_string(),
                    ))
                })?;
            let model = config
                .settings
                .model_for(provider)
                .unwrap_or(provider.default_model());
            debug!(requested = %config.model, provider = %provider, model, "model provider has no key; using fallback provider");
            Ok((provider, model.to_string()))
        }
    }
}

/// Creates models by name mid-session, for delegated subtasks.
pub trait ModelFactory: Send + Sync {
    fn create(
        &self,
        model: &str,
        effort: Option<ReasoningEffort>,
    ) -> Result<Box<dyn Model>, ModelError>;
}

/// Factory backed by the configured provider credentials.
#[derive(Debug, Clone)]
pub struct ConfiguredModelFactory {
    settings: ClientSettings,
    default_effort: Option<ReasoningEffort>,
}

impl ConfiguredModelFactory {
    /// Returns `None` when no provider has a credential.
    pub fn from_config(config: &AgentConfig) -> Option<Self> {
        config.any_credential().then(|| Self {
            settings: ClientSettings::new(config),
            default_effort: config.reasoning_effort,
        })
    }

    /// Build a client for `model`, routed by the provider-inference rules.
    ///
    /// Names no pattern recognizes go to the OpenAI-compatible endpoint.
    pub fn client(
        &self,
        model: &str,
        effort: Option<ReasoningEffort>,
    ) -> Result<ModelClient, ModelError> {
        let model = model.trim();
        let provider = infer_provider(model).unwrap_or(Provider::OpenAi);
        self.settings
            .client(provider, model, effort.or(self.default_effort))
    }
}

impl ModelFactory for ConfiguredModelFactory {
    fn create(
        &self,
        model: &str,
        effort: Option<ReasoningEffort>,
    ) -> Result<Box<dyn Model>, ModelError> {
        Ok(Box::new(self.client(model, effort)?))
    }
}
