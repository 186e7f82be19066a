//! Agent configuration sourced from the environment and persisted settings.
//!
//! Every value has a documented default. Malformed values fail fast at
//! startup instead of being coerced.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::core::budget::Budget;
use crate::core::provider::{Provider, ProviderChoice};
use crate::core::types::ReasoningEffort;
use crate::io::settings::{PersistentSettings, SettingsStore};

pub const DEFAULT_MODEL: &str = "claude-opus-4-6";
pub const DEFAULT_SESSION_DIR: &str = ".planter";

/// Configuration problems. Fatal to session bootstrap, never to the process.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: '{value}'")]
    InvalidValue { key: String, value: String },
    #[error("{key} {reason}")]
    OutOfRange { key: &'static str, reason: String },
    #[error("invalid session id '{0}' (allowed: letters, digits, '-' and '_')")]
    InvalidSessionId(String),
    #[error("session '{0}' already exists; pass --resume to continue it")]
    SessionExists(String),
    #[error("no model credential configured: {0}")]
    MissingCredential(String),
}

/// Base URL and key for one model provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderEndpoint {
    pub api_key: Option<String>,
    pub base_url: String,
}

impl ProviderEndpoint {
    fn has_key(&self) -> bool {
        self.api_key.as_deref().is_some_and(|key| !key.trim().is_empty())
    }
}

/// Full engine configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentConfig {
    pub workspace: PathBuf,
    pub provider: ProviderChoice,
    pub model: String,
    pub reasoning_effort: Option<ReasoningEffort>,
    pub openai: ProviderEndpoint,
    pub anthropic: ProviderEndpoint,
    pub openrouter: ProviderEndpoint,
    pub cerebras: ProviderEndpoint,
    pub exa_api_key: Option<String>,
    pub exa_base_url: String,
    pub budget: Budget,
    pub shell: String,
    /// Session directory name, relative to the workspace.
    pub session_dir: String,
    pub network_timeout_sec: u64,
    /// Replace the workspace path with `<workspace>` in mirrored traces.
    pub demo: bool,
    pub event_push_url: Option<String>,
    /// Per-provider defaults from persisted settings, used by the model factory.
    pub settings: PersistentSettings,
}

impl AgentConfig {
    /// Defaults for `workspace` with no credentials.
    ///
    /// The workspace is resolved to an absolute path so redaction and the
    /// sandbox root agree.
    pub fn new(workspace: impl Into<PathBuf>) -> Self {
        Self {
            workspace: resolve_workspace(workspace.into()),
            provider: ProviderChoice::Auto,
            model: DEFAULT_MODEL.to_string(),
            reasoning_effort: Some(ReasoningEffort::High),
            openai: endpoint("https://api.openai.com/v1"),
            anthropic: endpoint("https://api.anthropic.com/v1"),
            openrouter: endpoint("https://openrouter.ai/api/v1"),
            cerebras: endpoint("https://api.cerebras.ai/v1"),
            exa_api_key: None,
            exa_base_url: "https://api.exa.ai".to_string(),
            budget: Budget::default(),
            shell: "/bin/sh".to_string(),
            session_dir: DEFAULT_SESSION_DIR.to_string(),
            network_timeout_sec: 180,
            demo: false,
            event_push_url: None,
            settings: PersistentSettings::default(),
        }
    }

    /// Read configuration from the process environment.
    pub fn from_env(workspace: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        Self::from_lookup(workspace, |key| std::env::var(key).ok())
    }

    /// Read configuration through `lookup`, then fill unset model and effort
    /// from the workspace's persisted settings.
    pub fn from_lookup<F>(workspace: impl Into<PathBuf>, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);
        let mut cfg = Self::new(workspace);

        if let Some(raw) = env.get("PLANTER_PROVIDER") {
            cfg.provider = raw.parse().map_err(|_| invalid("PLANTER_PROVIDER", &raw))?;
        }

        cfg.openai = env.endpoint("OPENAI", cfg.openai.base_url);
        cfg.anthropic = env.endpoint("ANTHROPIC", cfg.anthropic.base_url);
        cfg.openrouter = env.endpoint("OPENROUTER", cfg.openrouter.base_url);
        cfg.cerebras = env.endpoint("CEREBRAS", cfg.cerebras.base_url);
        cfg.exa_api_key = env
            .get("PLANTER_EXA_API_KEY")
            .or_else(|| env.get("EXA_API_KEY"));
        if let Some(url) = env.get("PLANTER_EXA_BASE_URL") {
            cfg.exa_base_url = url;
        }

        let budget = &mut cfg.budget;
        env.parse_into("PLANTER_MAX_DEPTH", &mut budget.max_depth)?;
        env.parse_into("PLANTER_MAX_STEPS_PER_CALL", &mut budget.max_steps_per_call)?;
        env.parse_into(
            "PLANTER_MAX_OBSERVATION_CHARS",
            &mut budget.max_observation_chars,
        )?;
        env.parse_into("PLANTER_MAX_PLAN_CHARS", &mut budget.max_plan_chars)?;
        env.parse_into("PLANTER_COMMAND_TIMEOUT_SEC", &mut budget.command_timeout_sec)?;
        env.parse_into(
            "PLANTER_MAX_SHELL_OUTPUT_CHARS",
            &mut budget.max_shell_output_chars,
        )?;
        env.parse_into("PLANTER_MAX_FILE_CHARS", &mut budget.max_file_chars)?;
        env.parse_into("PLANTER_MAX_FILES_LISTED", &mut budget.max_files_listed)?;
        env.parse_into("PLANTER_MAX_SEARCH_HITS", &mut budget.max_search_hits)?;
        env.parse_into(
            "PLANTER_MAX_PERSISTED_OBSERVATIONS",
            &mut budget.max_persisted_observations,
        )?;
        env.parse_into("PLANTER_MAX_SOLVE_SECONDS", &mut budget.max_solve_seconds)?;
        env.parse_bool_into("PLANTER_RECURSIVE", &mut budget.recursive)?;
        env.parse_into("PLANTER_MIN_SUBTASK_DEPTH", &mut budget.min_subtask_depth)?;
        env.parse_bool_into(
            "PLANTER_ACCEPTANCE_CRITERIA",
            &mut budget.acceptance_criteria,
        )?;

        if let Some(shell) = env.get("PLANTER_SHELL") {
            cfg.shell = shell;
        }
        if let Some(dir) = env.get("PLANTER_SESSION_DIR") {
            cfg.session_dir = dir;
        }
        env.parse_into("PLANTER_NETWORK_TIMEOUT_SEC", &mut cfg.network_timeout_sec)?;
        env.parse_bool_into("PLANTER_DEMO", &mut cfg.demo)?;
        cfg.event_push_url = env.get("PLANTER_EVENT_PUSH_URL");

        let env_effort = match env.get("PLANTER_REASONING_EFFORT") {
            Some(raw) => Some(
                ReasoningEffort::parse_optional(&raw)
                    .map_err(|_| invalid("PLANTER_REASONING_EFFORT", &raw))?,
            ),
            None => None,
        };
        let env_model = env.get("PLANTER_MODEL");

        cfg.validate()?;
        cfg.settings = SettingsStore::new(&cfg.session_root()).load();

        cfg.model = match env_model {
            Some(model) => model,
            None => cfg.settings_model(),
        };
        cfg.reasoning_effort = match env_effort {
            Some(effort) => effort,
            None => cfg
                .settings
                .default_reasoning_effort
                .or(cfg.reasoning_effort),
        };
        Ok(cfg)
    }

    fn settings_model(&self) -> String {
        let per_provider = match self.provider {
            ProviderChoice::Explicit(provider) => self.settings.model_for(provider),
            ProviderChoice::Auto => None,
        };
        per_provider
            .or(self.settings.default_model.as_deref())
            .map(str::to_string)
            .unwrap_or_else(|| match self.provider {
                ProviderChoice::Explicit(provider) => provider.default_model().to_string(),
                ProviderChoice::Auto => DEFAULT_MODEL.to_string(),
            })
    }

    /// Reject zero caps and timeouts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let budget = &self.budget;
        let positive: [(&'static str, u64); 10] = [
            ("max_steps_per_call", u64::from(budget.max_steps_per_call)),
            ("max_observation_chars", budget.max_observation_chars as u64),
            ("max_plan_chars", budget.max_plan_chars as u64),
            ("command_timeout_sec", budget.command_timeout_sec),
            ("max_shell_output_chars", budget.max_shell_output_chars as u64),
            ("max_file_chars", budget.max_file_chars as u64),
            ("max_files_listed", budget.max_files_listed as u64),
            ("max_search_hits", budget.max_search_hits as u64),
            (
                "max_persisted_observations",
                budget.max_persisted_observations as u64,
            ),
            ("network_timeout_sec", self.network_timeout_sec),
        ];
        for (key, value) in positive {
            if value == 0 {
                return Err(ConfigError::OutOfRange {
                    key,
                    reason: "must be > 0".to_string(),
                });
            }
        }
        let dir = self.session_dir.trim();
        if dir.is_empty() || dir.contains(['/', '\\']) || dir == "." || dir == ".." {
            return Err(ConfigError::OutOfRange {
                key: "session_dir",
                reason: format!("must be a plain directory name, got '{}'", self.session_dir),
            });
        }
        if self.shell.trim().is_empty() {
            return Err(ConfigError::OutOfRange {
                key: "shell",
                reason: "must not be empty".to_string(),
            });
        }
        Ok(())
    }

    /// `<workspace>/<session_dir>`.
    pub fn session_root(&self) -> PathBuf {
        self.workspace.join(&self.session_dir)
    }

    pub fn endpoint(&self, provider: Provider) -> &ProviderEndpoint {
        match provider {
            Provider::OpenAi => &self.openai,
            Provider::Anthropic => &self.anthropic,
            Provider::OpenRouter => &self.openrouter,
            Provider::Cerebras => &self.cerebras,
        }
    }

    pub fn has_credential(&self, provider: Provider) -> bool {
        self.endpoint(provider).has_key()
    }

    /// True when at least one model provider has a key.
    pub fn any_credential(&self) -> bool {
        Provider::AUTO_ORDER
            .iter()
            .any(|provider| self.has_credential(*provider))
    }

    pub fn network_timeout(&self) -> Duration {
        Duration::from_secs(self.network_timeout_sec)
    }

    /// Rewrite absolute workspace paths in `text` when demo mode is on.
    pub fn redact(&self, text: &str) -> String {
        if !self.demo {
            return text.to_string();
        }
        redact_workspace(text, &self.workspace)
    }
}

/// Canonical form of `path`, or its absolute form when it does not exist yet.
pub fn resolve_workspace(path: PathBuf) -> PathBuf {
    std::fs::canonicalize(&path)
        .or_else(|_| std::path::absolute(&path))
        .unwrap_or(path)
}

/// Replace every occurrence of `workspace` in `text` with `<workspace>`.
///
/// Relative paths are left alone; they would match unrelated text.
pub fn redact_workspace(text: &str, workspace: &Path) -> String {
    let root = workspace.to_string_lossy();
    if root.is_empty() || !workspace.is_absolute() {
        return text.to_string();
    }
    text.replace(root.as_ref(), "<workspace>")
}

fn endpoint(base_url: &str) -> ProviderEndpoint {
    ProviderEndpoint {
        api_key: None,
        base_url: base_url.to_string(),
    }
}

fn invalid(key: &str, value: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    }
}

/// Lookup wrapper that treats blank values as unset.
struct Env<F>(F);

impl<F: Fn(&str) -> Option<String>> Env<F> {
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    fn endpoint(&self, prefix: &str, default_base_url: String) -> ProviderEndpoint {
        let api_key = self
            .get(&format!("PLANTER_{prefix}_API_KEY"))
            .or_else(|| self.get(&format!("{prefix}_API_KEY")));
        let base_url = self
            .get(&format!("PLANTER_{prefix}_BASE_URL"))
            .unwrap_or(default_base_url);
        ProviderEndpoint { api_key, base_url }
    }

    fn parse_into<T: FromStr>(&self, key: &str, slot: &mut T) -> Result<(), ConfigError> {
        if let Some(raw) = self.get(key) {
            *slot = raw.parse().map_err(|_| invalid(key, &raw))?;
        }
        Ok(())
    }

    fn parse_bool_into(&self, key: &str, slot: &mut bool) -> Result<(), ConfigError> {
        if let Some(raw) = self.get(key) {
            *slot = match raw.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                _ => return Err(invalid(key, &raw)),
            };
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::fs;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn empty_environment_uses_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = AgentConfig::from_lookup(temp.path(), lookup(&[])).expect("config");
        assert_eq!(cfg.provider, ProviderChoice::Auto);
        assert_eq!(cfg.model, "claude-opus-4-6");
        assert_eq!(cfg.reasoning_effort, Some(ReasoningEffort::High));
        assert_eq!(cfg.budget, Budget::default());
        assert_eq!(cfg.session_dir, ".planter");
        assert!(!cfg.any_credential());
    }

    #[test]
    fn malformed_numbers_fail_fast() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = AgentConfig::from_lookup(temp.path(), lookup(&[("PLANTER_MAX_DEPTH", "four")]))
            .unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidValue {
                key: "PLANTER_MAX_DEPTH".to_string(),
                value: "four".to_string()
            }
        );
    }

    #[test]
    fn zero_caps_are_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = AgentConfig::from_lookup(
            temp.path(),
            lookup(&[("PLANTER_MAX_FILE_CHARS", "0")]),
        )
        .unwrap_err();
        assert!(err.to_string().contains("max_file_chars"));
    }

    #[test]
    fn generic_key_names_are_fallbacks() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = AgentConfig::from_lookup(
            temp.path(),
            lookup(&[
                ("ANTHROPIC_API_KEY", "generic"),
                ("PLANTER_OPENAI_API_KEY", "scoped"),
                ("OPENAI_API_KEY", "ignored"),
                ("PLANTER_RECURSIVE", "off"),
            ]),
        )
        .expect("config");
        assert_eq!(cfg.anthropic.api_key.as_deref(), Some("generic"));
        assert_eq!(cfg.openai.api_key.as_deref(), Some("scoped"));
        assert!(!cfg.budget.recursive);
    }

    #[test]
    fn settings_fill_only_unset_values() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path().join(".planter");
        fs::create_dir_all(&root).expect("mkdir");
        fs::write(
            root.join("settings.json"),
            r#"{"default_model": "gpt-5.2", "default_reasoning_effort": "low"}"#,
        )
        .expect("write settings");

        let from_settings = AgentConfig::from_lookup(temp.path(), lookup(&[])).expect("config");
        assert_eq!(from_settings.model, "gpt-5.2");
        assert_eq!(from_settings.reasoning_effort, Some(ReasoningEffort::Low));

        let from_env = AgentConfig::from_lookup(
            temp.path(),
            lookup(&[("PLANTER_MODEL", "claude-opus-4-6")]),
        )
        .expect("config");
        assert_eq!(from_env.model, "claude-opus-4-6");
        assert_eq!(from_env.reasoning_effort, Some(ReasoningEffort::Low));
    }

    #[test]
    fn explicit_provider_uses_its_default_model() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = AgentConfig::from_lookup(temp.path(), lookup(&[("PLANTER_PROVIDER", "cerebras")]))
            .expect("config");
        assert_eq!(cfg.model, "qwen-3-235b-a22b-instruct-2507");
    }

    #[test]
    fn demo_mode_redacts_workspace() {
        let mut cfg = AgentConfig::new("/home/me/project");
        assert_eq!(cfg.redact("/home/me/project/src"), "/home/me/project/src");
        cfg.demo = true;
        assert_eq!(cfg.redact("cat /home/me/project/src"), "cat <workspace>/src");
    }

    #[test]
    fn relative_workspace_is_resolved_before_redaction() {
        let mut cfg = AgentConfig::new(".");
        let cwd = std::fs::canonicalize(".").expect("cwd");
        assert_eq!(cfg.workspace, cwd);

        cfg.demo = true;
        assert_eq!(
            cfg.redact("read src/main.rs: 1.5 seconds"),
            "read src/main.rs: 1.5 seconds"
        );
        let inside = format!("{}/src/main.rs", cwd.display());
        assert_eq!(cfg.redact(&inside), "<workspace>/src/main.rs");
    }

    #[test]
    fn relative_paths_are_never_redacted() {
        assert_eq!(redact_workspace("a.b.c", Path::new(".")), "a.b.c");
    }
}
