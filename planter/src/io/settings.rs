//! Persisted user defaults stored at `<workspace>/<session_dir>/settings.json`.
//!
//! The file is optional. A missing or unparsable file means "all defaults";
//! it never blocks startup.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::core::provider::Provider;
use crate::core::types::ReasoningEffort;
use crate::io::atomic::write_json_atomic;

pub const SETTINGS_FILE: &str = "settings.json";

/// Normalized persisted defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistentSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_reasoning_effort: Option<ReasoningEffort>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_model_openai: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_model_anthropic: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_model_openrouter: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_model_cerebras: Option<String>,
}

/// Loosely typed file contents; every field is optional and checked on load.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawSettings {
    default_model: Option<String>,
    default_reasoning_effort: Option<String>,
    default_model_openai: Option<String>,
    default_model_anthropic: Option<String>,
    default_model_openrouter: Option<String>,
    default_model_cerebras: Option<String>,
}

impl PersistentSettings {
    /// Per-provider default model override, if any.
    pub fn model_for(&self, provider: Provider) -> Option<&str> {
        match provider {
            Provider::OpenAi => self.default_model_openai.as_deref(),
            Provider::Anthropic => self.default_model_anthropic.as_deref(),
            Provider::OpenRouter => self.default_model_openrouter.as_deref(),
            Provider::Cerebras => self.default_model_cerebras.as_deref(),
        }
    }

    fn from_raw(raw: RawSettings) -> Self {
        let default_reasoning_effort = match raw
            .default_reasoning_effort
            .as_deref()
            .map(ReasoningEffort::parse_optional)
        {
            Some(Ok(effort)) => effort,
            Some(Err(err)) => {
                warn!(err = %err, "dropping invalid default_reasoning_effort from settings");
                None
            }
            None => None,
        };
        Self {
            default_model: non_blank(raw.default_model),
            default_reasoning_effort,
            default_model_openai: non_blank(raw.default_model_openai),
            default_model_anthropic: non_blank(raw.default_model_anthropic),
            default_model_openrouter: non_blank(raw.default_model_openrouter),
            default_model_cerebras: non_blank(raw.default_model_cerebras),
        }
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Reads and writes the settings file for one workspace.
#[derive(Debug, Clone)]
pub struct SettingsStore {
    path: PathBuf,
}

impl SettingsStore {
    pub fn new(session_root: &Path) -> Self {
        Self {
            path: session_root.join(SETTINGS_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load settings, falling back to defaults on any read or parse problem.
    pub fn load(&self) -> PersistentSettings {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return PersistentSettings::default();
            }
            Err(err) => {
                warn!(path = %self.path.display(), err = %err, "failed to read settings; using defaults");
                return PersistentSettings::default();
            }
        };
        match serde_json::from_str::<RawSettings>(&contents) {
            Ok(raw) => PersistentSettings::from_raw(raw),
            Err(err) => {
                warn!(path = %self.path.display(), err = %err, "failed to parse settings; using defaults");
                PersistentSettings::default()
            }
        }
    }

    /// Atomically replace the settings file.
    pub fn save(&self, settings: &PersistentSettings) -> Result<()> {
        write_json_atomic(&self.path, settings)
    }
}
