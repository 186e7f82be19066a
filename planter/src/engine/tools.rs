//! Tool schema advertised to the model and dispatch of tool calls to the sandbox.

use anyhow::{Context, Result, anyhow};
use jsonschema::{Validator, validator_for};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use crate::core::types::{ReasoningEffort, ToolCall, ToolSpec};
use crate::io::sandbox::{Sandbox, ToolError};

/// Reserved tool name for delegating to a child investigation.
pub const SUBTASK_TOOL: &str = "subtask";
pub const WEB_SEARCH_TOOL: &str = "web_search";

const TOOL_DEFINITIONS: &str = include_str!("tools.json");

#[derive(Deserialize)]
struct GlobArgs {
    glob: Option<String>,
}

#[derive(Deserialize)]
struct SearchArgs {
    query: String,
    glob: Option<String>,
}

#[derive(Deserialize)]
struct PathArgs {
    path: String,
}

#[derive(Deserialize)]
struct WriteArgs {
    path: String,
    content: String,
}

#[derive(Deserialize)]
struct CommandArgs {
    command: String,
}

#[derive(Deserialize)]
struct QueryArgs {
    query: String,
}

/// Rendered result of one sandbox tool call.
///
/// `truncated` is set when the sandbox cut the raw result to its per-tool
/// cap, before any observation-level cut.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutput {
    pub text: String,
    pub truncated: bool,
}

impl ToolOutput {
    pub fn new(text: String, truncated: bool) -> Self {
        Self { text, truncated }
    }

    /// Output that was not cut.
    pub fn complete(text: String) -> Self {
        Self::new(text, false)
    }
}

/// Arguments of a delegation directive.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SubtaskArgs {
    pub objective: String,
    #[serde(default)]
    pub artifacts: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub reasoning_effort: Option<ReasoningEffort>,
}

struct ToolEntry {
    spec: ToolSpec,
    validator: Validator,
}

/// All tools with their compiled argument schemas.
pub struct ToolRegistry {
    entries: Vec<ToolEntry>,
}

impl ToolRegistry {
    pub fn new() -> Result<Self> {
        let definitions: Vec<Value> =
            serde_json::from_str(TOOL_DEFINITIONS).context("parse tool definitions")?;
        let mut entries = Vec::with_capacity(definitions.len());
        for definition in definitions {
            let name = field(&definition, "name")?;
            let description = field(&definition, "description")?;
            let parameters = definition
                .get("parameters")
                .cloned()
                .with_context(|| format!("tool {name} missing parameters"))?;
            let validator = validator_for(&parameters)
                .map_err(|err| anyhow!("invalid schema for tool {name}: {err}"))?;
            entries.push(ToolEntry {
                spec: ToolSpec {
                    name,
                    description,
                    parameters,
                },
                validator,
            });
        }
        Ok(Self { entries })
    }

    /// Tools offered at one depth. Delegation and web search appear only when usable.
    pub fn specs(&self, allow_delegation: bool, web_search: bool) -> Vec<ToolSpec> {
        self.entries
            .iter()
            .filter(|entry| match entry.spec.name.as_str() {
                SUBTASK_TOOL => allow_delegation,
                WEB_SEARCH_TOOL => web_search,
                _ => true,
            })
            .map(|entry| entry.spec.clone())
            .collect()
    }

    /// Check a call's arguments against its tool schema.
    pub fn validate(&self, call: &ToolCall) -> Result<(), ToolError> {
        let entry = self
            .entries
            .iter()
            .find(|entry| entry.spec.name == call.name)
            .ok_or_else(|| ToolError::InvalidArguments {
                tool: call.name.clone(),
                reason: "unknown tool".to_string(),
            })?;
        if entry.validator.is_valid(&call.arguments) {
            return Ok(());
        }
        let messages: Vec<String> = entry
            .validator
            .iter_errors(&call.arguments)
            .map(|err| err.to_string())
            .collect();
        Err(ToolError::InvalidArguments {
            tool: call.name.clone(),
            reason: messages.join("; "),
        })
    }

    /// Validate and run a sandbox tool, rendering the result or error as text.
    pub fn execute(&self, sandbox: &dyn Sandbox, call: &ToolCall) -> ToolOutput {
        match self.dispatch(sandbox, call) {
            Ok(output) => output,
            Err(ToolError::Timeout {
                timeout_secs,
                partial,
            }) => ToolOutput::new(
                format!(
                    "error: command timed out after {timeout_secs}s\npartial output:\n{}",
                    partial.render()
                ),
                partial.truncated,
            ),
            Err(err) => {
                debug!(tool = %call.name, err = %err, "tool call failed");
                ToolOutput::complete(format!("error: {err}"))
            }
        }
    }

    fn dispatch(&self, sandbox: &dyn Sandbox, call: &ToolCall) -> Result<ToolOutput, ToolError> {
        self.validate(call)?;
        match call.name.as_str() {
            "list_files" => {
                let args: GlobArgs = parse_args(call)?;
                let files = sandbox.list_files(args.glob.as_deref())?;
                Ok(if files.items.is_empty() {
                    ToolOutput::complete("(no files)".to_string())
                } else {
                    ToolOutput::new(files.render_lines(Clone::clone), files.truncated())
                })
            }
            "search" => {
                let args: SearchArgs = parse_args(call)?;
                let hits = sandbox.search(&args.query, args.glob.as_deref())?;
                Ok(if hits.items.is_empty() {
                    ToolOutput::complete("(no matches)".to_string())
                } else {
                    ToolOutput::new(hits.render_lines(|hit| hit.render()), hits.truncated())
                })
            }
            "read_file" => {
                let args: PathArgs = parse_args(call)?;
                let (text, truncated) = sandbox.read_file(&args.path)?;
                Ok(ToolOutput::new(text, truncated))
            }
            "write_file" => {
                let args: WriteArgs = parse_args(call)?;
                let written = sandbox.write_file(&args.path, &args.content)?;
                Ok(ToolOutput::complete(format!(
                    "wrote {} chars to {written}",
                    args.content.chars().count()
                )))
            }
            "run_shell" => {
                let args: CommandArgs = parse_args(call)?;
                let output = sandbox.run_shell(&args.command)?;
                Ok(ToolOutput::new(output.render(), output.truncated))
            }
            WEB_SEARCH_TOOL => {
                let args: QueryArgs = parse_args(call)?;
                let results = sandbox.web_search(&args.query)?;
                Ok(if results.items.is_empty() {
                    ToolOutput::complete("(no results)".to_string())
                } else {
                    ToolOutput::new(
                        results.render_lines(|result| result.render()),
                        results.truncated(),
                    )
                })
            }
            other => Err(ToolError::InvalidArguments {
                tool: other.to_string(),
                reason: "not a sandbox tool".to_string(),
            }),
        }
    }
}

/// Parse a delegation directive after schema validation.
pub fn parse_subtask(registry: &ToolRegistry, call: &ToolCall) -> Result<SubtaskArgs, ToolError> {
    registry.validate(call)?;
    let args: SubtaskArgs = parse_args(call)?;
    if args.objective.trim().is_empty() {
        return Err(ToolError::InvalidArguments {
            tool: SUBTASK_TOOL.to_string(),
            reason: "objective must not be blank".to_string(),
        });
    }
    Ok(args)
}

fn parse_args<T: DeserializeOwned>(call: &ToolCall) -> Result<T, ToolError> {
    serde_json::from_value(call.arguments.clone()).map_err(|err| ToolError::InvalidArguments {
        tool: call.name.clone(),
        reason: err.to_string(),
    })
}

fn field(definition: &Value, key: &str) -> Result<String> {
    definition
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .with_context(|| format!("tool definition missing {key}"))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::io::sandbox::{SandboxLimits, WorkspaceSandbox};
    use crate::test_support::{ScriptedSandbox, workspace_with_files};

    fn capped_sandbox(root: &std::path::Path) -> WorkspaceSandbox {
        let limits = SandboxLimits {
            command_timeout_sec: 5,
            max_shell_output_chars: 40,
            max_file_chars: 64,
            max_files_listed: 2,
            max_search_hits: 2,
        };
        WorkspaceSandbox::new(root, "/bin/sh", limits).expect("sandbox")
    }

    fn call(name: &str, arguments: Value) -> ToolCall {
        ToolCall {
            id: "c1".to_string(),
            name: name.to_string(),
            arguments,
        }
    }

    #[test]
    fn delegation_and_web_search_are_advertised_only_when_usable() {
        let registry = ToolRegistry::new().expect("registry");
        let names = |specs: Vec<ToolSpec>| specs.into_iter().map(|s| s.name).collect::<Vec<_>>();

        let base = names(registry.specs(false, false));
        assert!(!base.contains(&SUBTASK_TOOL.to_string()));
        assert!(!base.contains(&WEB_SEARCH_TOOL.to_string()));
        assert!(base.contains(&"run_shell".to_string()));

        let full = names(registry.specs(true, true));
        assert!(full.contains(&SUBTASK_TOOL.to_string()));
        assert!(full.contains(&WEB_SEARCH_TOOL.to_string()));
    }

    #[test]
    fn schema_violations_become_error_text() {
        let registry = ToolRegistry::new().expect("registry");
        let sandbox = ScriptedSandbox::new();
        let text = registry
            .execute(&sandbox, &call("read_file", json!({"file": "a.txt"})))
            .text;
        assert!(text.starts_with("error: invalid arguments for read_file"), "{text}");
        assert!(sandbox.calls().is_empty());

        let text = registry.execute(&sandbox, &call("rm_rf", json!({}))).text;
        assert!(text.contains("unknown tool"));
    }

    #[test]
    fn listing_renders_one_path_per_line() {
        let registry = ToolRegistry::new().expect("registry");
        let sandbox = ScriptedSandbox::new().with_files(&["a.txt", "b.txt"]);
        let output = registry.execute(&sandbox, &call("list_files", json!({})));
        assert_eq!(output.text, "a.txt\nb.txt");
        assert!(!output.truncated);
        assert_eq!(sandbox.calls(), vec!["list_files".to_string()]);
    }

    #[test]
    fn subtask_arguments_parse_with_optional_fields() {
        let registry = ToolRegistry::new().expect("registry");
        let args = parse_subtask(
            &registry,
            &call(
                SUBTASK_TOOL,
                json!({"objective": "count tests", "reasoning_effort": "low"}),
            ),
        )
        .expect("args");
        assert_eq!(args.objective, "count tests");
        assert_eq!(args.reasoning_effort, Some(ReasoningEffort::Low));
        assert!(parse_subtask(&registry, &call(SUBTASK_TOOL, json!({"objective": "  "}))).is_err());
        assert!(
            parse_subtask(
                &registry,
                &call(SUBTASK_TOOL, json!({"objective": "x", "reasoning_effort": "max"}))
            )
            .is_err()
        );
    }

    #[test]
    fn file_cap_marks_output_truncated() {
        let raw = "a".repeat(1000);
        let workspace = workspace_with_files(&[("big.txt", raw.as_str()), ("small.txt", "ok")]);
        let registry = ToolRegistry::new().expect("registry");
        let sandbox = capped_sandbox(workspace.path());

        let output = registry.execute(&sandbox, &call("read_file", json!({"path": "big.txt"})));
        assert!(output.truncated);
        assert!(output.text.chars().count() <= 64);
        let marker = output.text.find("\n...[truncated").expect("marker");
        assert!(raw.starts_with(&output.text[..marker]));

        let output = registry.execute(&sandbox, &call("read_file", json!({"path": "small.txt"})));
        assert_eq!(output, ToolOutput::complete("ok".to_string()));
    }

    #[test]
    fn listing_cap_marks_output_truncated() {
        let workspace = workspace_with_files(&[
            ("a.txt", ""),
            ("b.txt", ""),
            ("c.txt", ""),
            ("d.txt", ""),
        ]);
        let registry = ToolRegistry::new().expect("registry");
        let output = registry.execute(
            &capped_sandbox(workspace.path()),
            &call("list_files", json!({})),
        );
        assert!(output.truncated);
        assert_eq!(output.text.lines().count(), 3);
        assert!(output.text.ends_with("...[2 more omitted]"), "{}", output.text);
    }

    #[test]
    fn search_cap_marks_output_truncated() {
        let workspace =
            workspace_with_files(&[("notes.txt", "needle 1\nneedle 2\nneedle 3\nneedle 4\n")]);
        let registry = ToolRegistry::new().expect("registry");
        let output = registry.execute(
            &capped_sandbox(workspace.path()),
            &call("search", json!({"query": "needle"})),
        );
        assert!(output.truncated);
        assert!(output.text.ends_with("...[2 more omitted]"), "{}", output.text);
    }

    #[cfg(unix)]
    #[test]
    fn shell_cap_marks_output_truncated() {
        let workspace = workspace_with_files(&[]);
        let registry = ToolRegistry::new().expect("registry");
        let output = registry.execute(
            &capped_sandbox(workspace.path()),
            &call("run_shell", json!({"command": "printf '%0200d' 0"})),
        );
        assert!(output.truncated);
        assert!(output.text.contains("[truncated"), "{}", output.text);
    }
}
