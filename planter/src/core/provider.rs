//! Model-name → provider inference.
//!
//! Inference is purely lexical so it stays deterministic and testable: the
//! same model name always maps to the same provider family.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Model backend family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    OpenAi,
    Anthropic,
    /// Request-routing aggregator; can serve any model.
    OpenRouter,
    Cerebras,
}

impl Provider {
    /// Order used when `auto` has to pick among configured credentials.
    pub const AUTO_ORDER: [Provider; 4] = [
        Provider::Anthropic,
        Provider::OpenAi,
        Provider::OpenRouter,
        Provider::Cerebras,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Provider::OpenAi => "openai",
            Provider::Anthropic => "anthropic",
            Provider::OpenRouter => "openrouter",
            Provider::Cerebras => "cerebras",
        }
    }

    pub fn default_model(self) -> &'static str {
        match self {
            Provider::OpenAi => "gpt-5.2",
            Provider::Anthropic => "claude-opus-4-6",
            Provider::OpenRouter => "anthropic/claude-sonnet-4-5",
            Provider::Cerebras => "qwen-3-235b-a22b-instruct-2507",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(Provider::OpenAi),
            "anthropic" => Ok(Provider::Anthropic),
            "openrouter" => Ok(Provider::OpenRouter),
            "cerebras" => Ok(Provider::Cerebras),
            other => Err(format!(
                "unknown provider '{other}' (expected auto, anthropic, cerebras, openai or openrouter)"
            )),
        }
    }
}

/// Caller-selected provider: explicit, or resolved from the model name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProviderChoice {
    #[default]
    Auto,
    Explicit(Provider),
}

impl FromStr for ProviderChoice {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let cleaned = value.trim();
        if cleaned.is_empty() || cleaned.eq_ignore_ascii_case("auto") {
            return Ok(ProviderChoice::Auto);
        }
        cleaned.parse().map(ProviderChoice::Explicit)
    }
}

impl fmt::Display for ProviderChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderChoice::Auto => f.write_str("auto"),
            ProviderChoice::Explicit(provider) => provider.fmt(f),
        }
    }
}

static ANTHROPIC_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^claude").expect("anthropic pattern should be valid"));
static OPENAI_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(gpt|o[1-4]-|o[1-4]$|chatgpt|dall-e|tts-|whisper)")
        .expect("openai pattern should be valid")
});
static CEREBRAS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(llama.*cerebras|qwen-3|gpt-oss|zai-glm)")
        .expect("cerebras pattern should be valid")
});

/// Return the provider a model name unambiguously belongs to.
///
/// Names containing `/` are aggregator ids; `gpt-oss` models are served by
/// Cerebras, so that pattern is checked before the OpenAI one.
pub fn infer_provider(model: &str) -> Option<Provider> {
    if model.contains('/') {
        return Some(Provider::OpenRouter);
    }
    if ANTHROPIC_RE.is_match(model) {
        return Some(Provider::Anthropic);
    }
    if CEREBRAS_RE.is_match(model) {
        return Some(Provider::Cerebras);
    }
    if OPENAI_RE.is_match(model) {
        return Some(Provider::OpenAi);
    }
    None
}

/// A model name that clearly belongs to a different provider than requested.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error(
    "model '{model}' belongs to provider '{inferred}', not '{requested}' \
     (use --provider {inferred} or pick a model that matches the current provider)"
)]
pub struct ProviderMismatch {
    pub model: String,
    pub inferred: Provider,
    pub requested: Provider,
}

/// Reject an explicit provider that contradicts the inferred one.
///
/// The aggregator accepts any model, and an aggregator-style name is never
/// treated as a contradiction.
pub fn validate_model_provider(model: &str, requested: Provider) -> Result<(), ProviderMismatch> {
    if requested == Provider::OpenRouter {
        return Ok(());
    }
    match infer_provider(model) {
        None | Some(Provider::OpenRouter) => Ok(()),
        Some(inferred) if inferred == requested => Ok(()),
        Some(inferred) => Err(ProviderMismatch {
            model: model.to_string(),
            inferred,
            requested,
        }),
    }
}

/// Pick the model name actually sent to `provider`.
///
/// Aggregator ids always contain `/`; a bare direct-provider name selected for
/// the aggregator falls back to the aggregator default.
pub fn resolve_model_name(provider: Provider, selected: &str) -> String {
    let selected = selected.trim();
    if selected.is_empty() {
        return provider.default_model().to_string();
    }
    if provider == Provider::OpenRouter && !selected.contains('/') {
        return Provider::OpenRouter.default_model().to_string();
    }
    selected.to_string()
}
