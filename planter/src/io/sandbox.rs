//! Workspace-confined tool execution.
//!
//! [`Sandbox`] is the only seam through which the engine touches the
//! filesystem or spawns processes. Every operation resolves paths against a
//! fixed root and caps its result before handing it back.

use std::fs;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};
use ignore::WalkBuilder;
use ignore::overrides::OverrideBuilder;
use regex::{Regex, RegexBuilder};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, instrument};

use crate::core::budget::Budget;
use crate::core::truncate::{Capped, truncate_chars};
use crate::io::process::{run_command_with_timeout, shell_command};
use crate::io::web_search::{WebResult, WebSearchClient};

/// Longest line kept in a search hit.
const MAX_HIT_LINE_CHARS: usize = 300;
/// Bytes kept per pipe for each character of shell output cap.
const BYTES_PER_CHAR: usize = 4;

/// Output of one shell command after capping.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct ShellOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub truncated: bool,
}

impl ShellOutput {
    /// Text form fed back to the model.
    pub fn render(&self) -> String {
        let code = self
            .exit_code
            .map_or_else(|| "none".to_string(), |code| code.to_string());
        let mut out = format!("exit_code: {code}\n");
        if !self.stdout.is_empty() {
            out.push_str("stdout:\n");
            out.push_str(&self.stdout);
            if !self.stdout.ends_with('\n') {
                out.push('\n');
            }
        }
        if !self.stderr.is_empty() {
            out.push_str("stderr:\n");
            out.push_str(&self.stderr);
        }
        out.trim_end().to_string()
    }
}

/// One line matching a search query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SearchHit {
    pub path: String,
    pub line: usize,
    pub text: String,
}

impl SearchHit {
    pub fn render(&self) -> String {
        format!("{}:{}: {}", self.path, self.line, self.text)
    }
}

/// Sandbox failures. Always recovered as an error observation.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("path '{path}' resolves outside the workspace")]
    OutOfBounds { path: String },
    #[error("command timed out after {timeout_secs}s")]
    Timeout {
        timeout_secs: u64,
        /// Output captured before the timeout fired.
        partial: ShellOutput,
    },
    #[error("{tool} is not available: {reason}")]
    NotAvailable { tool: String, reason: String },
    #[error("invalid arguments for {tool}: {reason}")]
    InvalidArguments { tool: String, reason: String },
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{0}")]
    Failed(String),
}

impl ToolError {
    fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        ToolError::Io {
            context: context.into(),
            source,
        }
    }
}

/// Bounded operations against one workspace root.
pub trait Sandbox: Send + Sync {
    fn root(&self) -> &Path;

    fn run_shell(&self, command: &str) -> Result<ShellOutput, ToolError>;

    /// File contents capped to `max_file_chars`, with a truncation marker when cut.
    fn read_file(&self, path: &str) -> Result<(String, bool), ToolError>;

    /// Write `content`, creating parent directories. Returns the relative path written.
    fn write_file(&self, path: &str, content: &str) -> Result<String, ToolError>;

    /// Workspace-relative file paths in sorted order, optionally filtered by `glob`.
    fn list_files(&self, glob: Option<&str>) -> Result<Capped<String>, ToolError>;

    fn search(&self, query: &str, glob: Option<&str>) -> Result<Capped<SearchHit>, ToolError>;

    fn web_search_available(&self) -> bool;

    fn web_search(&self, query: &str) -> Result<Capped<WebResult>, ToolError>;
}

/// Caps applied by [`WorkspaceSandbox`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxLimits {
    pub command_timeout_sec: u64,
    pub max_shell_output_chars: usize,
    pub max_file_chars: usize,
    pub max_files_listed: usize,
    pub max_search_hits: usize,
}

impl From<&Budget> for SandboxLimits {
    fn from(budget: &Budget) -> Self {
        Self {
            command_timeout_sec: budget.command_timeout_sec,
            max_shell_output_chars: budget.max_shell_output_chars,
            max_file_chars: budget.max_file_chars,
            max_files_listed: budget.max_files_listed,
            max_search_hits: budget.max_search_hits,
        }
    }
}

/// Sandbox backed by the local filesystem and a shell.
pub struct WorkspaceSandbox {
    root: PathBuf,
    shell: String,
    limits: SandboxLimits,
    web: Option<WebSearchClient>,
}

impl WorkspaceSandbox {
    /// Create a sandbox rooted at `root`, which must exist.
    pub fn new(root: &Path, shell: impl Into<String>, limits: SandboxLimits) -> Result<Self> {
        let root = root
            .canonicalize()
            .with_context(|| format!("resolve workspace {}", root.display()))?;
        Ok(Self {
            root,
            shell: shell.into(),
            limits,
            web: None,
        })
    }

    pub fn with_web_search(mut self, client: WebSearchClient) -> Self {
        self.web = Some(client);
        self
    }

    /// Resolve a model-supplied path to an absolute path inside the root.
    pub fn resolve(&self, raw: &str) -> Result<PathBuf, ToolError> {
        let out_of_bounds = || ToolError::OutOfBounds {
            path: raw.to_string(),
        };
        let joined = self.root.join(raw.trim());
        let normalized = normalize_lexically(&joined).ok_or_else(out_of_bounds)?;

        // Symlinks are followed through the deepest existing ancestor.
        let mut existing = normalized.as_path();
        let mut rest = Vec::new();
        while !existing.exists() {
            let Some(name) = existing.file_name() else {
                return Err(out_of_bounds());
            };
            rest.push(name.to_os_string());
            existing = existing.parent().ok_or_else(out_of_bounds)?;
        }
        let mut resolved = existing
            .canonicalize()
            .map_err(|err| ToolError::io(format!("resolve {raw}"), err))?;
        for name in rest.into_iter().rev() {
            resolved.push(name);
        }

        if resolved.starts_with(&self.root) {
            Ok(resolved)
        } else {
            Err(out_of_bounds())
        }
    }

    fn relative(&self, path: &Path) -> String {
        let rel = path.strip_prefix(&self.root).unwrap_or(path);
        rel.components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/")
    }

    /// Files under the root, gitignore-aware, in sorted order.
    fn walk_files(&self, glob: Option<&str>, tool: &str) -> Result<Vec<PathBuf>, ToolError> {
        let mut builder = WalkBuilder::new(&self.root);
        builder
            .hidden(true)
            .require_git(false)
            .follow_links(false)
            .sort_by_file_name(|a, b| a.cmp(b));
        if let Some(pattern) = glob.map(str::trim).filter(|g| !g.is_empty()) {
            let mut overrides = OverrideBuilder::new(&self.root);
            overrides
                .add(pattern)
                .map_err(|err| invalid_glob(tool, pattern, &err))?;
            let overrides = overrides
                .build()
                .map_err(|err| invalid_glob(tool, pattern, &err))?;
            builder.overrides(overrides);
        }

        let mut files = Vec::new();
        for entry in builder.build() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    debug!(err = %err, "skipping unreadable entry");
                    continue;
                }
            };
            if entry.file_type().is_some_and(|ft| ft.is_file()) {
                files.push(entry.into_path());
            }
        }
        files.sort();
        Ok(files)
    }
}

fn invalid_glob(tool: &str, pattern: &str, err: &ignore::Error) -> ToolError {
    ToolError::InvalidArguments {
        tool: tool.to_string(),
        reason: format!("bad glob '{pattern}': {err}"),
    }
}

/// Resolve `.` and `..` without touching the filesystem.
///
/// Returns `None` when `..` climbs above the filesystem root.
fn normalize_lexically(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    return None;
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    Some(out)
}

/// Compile `query` as a regex, or as a literal when it is not valid regex syntax.
fn compile_query(query: &str) -> Result<Regex, regex::Error> {
    RegexBuilder::new(query)
        .size_limit(1 << 20)
        .build()
        .or_else(|_| Regex::new(&regex::escape(query)))
}

impl Sandbox for WorkspaceSandbox {
    fn root(&self) -> &Path {
        &self.root
    }

    #[instrument(skip_all, fields(timeout_secs = self.limits.command_timeout_sec))]
    fn run_shell(&self, command: &str) -> Result<ShellOutput, ToolError> {
        let cap = self.limits.max_shell_output_chars;
        let cmd = shell_command(&self.shell, command, &self.root);
        let output = run_command_with_timeout(
            cmd,
            std::time::Duration::from_secs(self.limits.command_timeout_sec),
            cap.saturating_mul(BYTES_PER_CHAR),
        )
        .map_err(|err| ToolError::Failed(format!("run shell command: {err:#}")))?;

        let (stdout, stdout_cut) = truncate_chars(&String::from_utf8_lossy(&output.stdout), cap);
        let (stderr, stderr_cut) = truncate_chars(&String::from_utf8_lossy(&output.stderr), cap);
        let shell_output = ShellOutput {
            stdout,
            stderr,
            exit_code: output.exit_code(),
            truncated: stdout_cut
                || stderr_cut
                || output.stdout_truncated > 0
                || output.stderr_truncated > 0,
        };
        if output.timed_out {
            return Err(ToolError::Timeout {
                timeout_secs: self.limits.command_timeout_sec,
                partial: shell_output,
            });
        }
        Ok(shell_output)
    }

    fn read_file(&self, path: &str) -> Result<(String, bool), ToolError> {
        let resolved = self.resolve(path)?;
        let bytes = fs::read(&resolved).map_err(|err| ToolError::io(format!("read {path}"), err))?;
        let text = String::from_utf8_lossy(&bytes);
        Ok(truncate_chars(&text, self.limits.max_file_chars))
    }

    fn write_file(&self, path: &str, content: &str) -> Result<String, ToolError> {
        let resolved = self.resolve(path)?;
        if resolved == self.root {
            return Err(ToolError::InvalidArguments {
                tool: "write_file".to_string(),
                reason: "path must name a file".to_string(),
            });
        }
        if let Some(parent) = resolved.parent() {
            fs::create_dir_all(parent)
                .map_err(|err| ToolError::io(format!("create directory for {path}"), err))?;
        }
        fs::write(&resolved, content).map_err(|err| ToolError::io(format!("write {path}"), err))?;
        Ok(self.relative(&resolved))
    }

    fn list_files(&self, glob: Option<&str>) -> Result<Capped<String>, ToolError> {
        let files = self
            .walk_files(glob, "list_files")?
            .iter()
            .map(|path| self.relative(path))
            .collect();
        Ok(Capped::from_items(files, self.limits.max_files_listed))
    }

    #[instrument(skip_all)]
    fn search(&self, query: &str, glob: Option<&str>) -> Result<Capped<SearchHit>, ToolError> {
        if query.is_empty() {
            return Err(ToolError::InvalidArguments {
                tool: "search".to_string(),
                reason: "query must not be empty".to_string(),
            });
        }
        let pattern = compile_query(query).map_err(|err| ToolError::InvalidArguments {
            tool: "search".to_string(),
            reason: err.to_string(),
        })?;

        let mut hits = Vec::new();
        for path in self.walk_files(glob, "search")? {
            // Binary and non-UTF-8 files are skipped.
            let Ok(contents) = fs::read_to_string(&path) else {
                continue;
            };
            let rel = self.relative(&path);
            for (idx, line) in contents.lines().enumerate() {
                if pattern.is_match(line) {
                    let (text, _) = truncate_chars(line.trim_end(), MAX_HIT_LINE_CHARS);
                    hits.push(SearchHit {
                        path: rel.clone(),
                        line: idx + 1,
                        text,
                    });
                }
            }
        }
        Ok(Capped::from_items(hits, self.limits.max_search_hits))
    }

    fn web_search_available(&self) -> bool {
        self.web.is_some()
    }

    fn web_search(&self, query: &str) -> Result<Capped<WebResult>, ToolError> {
        let client = self.web.as_ref().ok_or_else(|| ToolError::NotAvailable {
            tool: "web_search".to_string(),
            reason: "no search provider key configured".to_string(),
        })?;
        let results = client.search(query, self.limits.max_search_hits)?;
        Ok(Capped::from_items(results, self.limits.max_search_hits))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> SandboxLimits {
        SandboxLimits {
            command_timeout_sec: 5,
            max_shell_output_chars: 200,
            max_file_chars: 64,
            max_files_listed: 2,
            max_search_hits: 10,
        }
    }

    fn sandbox(root: &Path) -> WorkspaceSandbox {
        WorkspaceSandbox::new(root, "/bin/sh", limits()).expect("sandbox")
    }

    #[test]
    fn traversal_is_out_of_bounds() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ws = temp.path().join("ws");
        fs::create_dir_all(&ws).expect("mkdir");
        fs::write(temp.path().join("secret.txt"), "nope").expect("write");
        let sandbox = sandbox(&ws);

        for path in ["../secret.txt", "/etc/passwd", "a/../../secret.txt"] {
            let err = sandbox.read_file(path).unwrap_err();
            assert!(matches!(err, ToolError::OutOfBounds { .. }), "{path}: {err}");
        }
        assert!(matches!(
            sandbox.write_file("../escape.txt", "x").unwrap_err(),
            ToolError::OutOfBounds { .. }
        ));
        assert!(!temp.path().join("escape.txt").exists());
    }

    #[cfg(unix)]
    #[test]
    fn symlink_escape_is_out_of_bounds() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ws = temp.path().join("ws");
        fs::create_dir_all(&ws).expect("mkdir");
        std::os::unix::fs::symlink(temp.path(), ws.join("link")).expect("symlink");
        let sandbox = sandbox(&ws);
        assert!(matches!(
            sandbox.write_file("link/planted.txt", "x").unwrap_err(),
            ToolError::OutOfBounds { .. }
        ));
    }

    #[test]
    fn read_file_truncates_with_marker() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("big.txt"), "a".repeat(1000)).expect("write");
        let (text, truncated) = sandbox(temp.path()).read_file("big.txt").expect("read");
        assert!(truncated);
        assert!(text.chars().count() <= 64);
        assert!(text.contains("[truncated"));
    }

    #[test]
    fn write_then_list_is_sorted_and_capped() {
        let temp = tempfile::tempdir().expect("tempdir");
        let sandbox = sandbox(temp.path());
        sandbox.write_file("b.txt", "b").expect("write b");
        sandbox.write_file("nested/a.rs", "a").expect("write a");
        sandbox.write_file("c.txt", "c").expect("write c");

        let listed = sandbox.list_files(None).expect("list");
        assert_eq!(listed.items, vec!["b.txt", "c.txt"]);
        assert_eq!(listed.omitted, 1);

        let rust = sandbox.list_files(Some("*.rs")).expect("list rs");
        assert_eq!(rust.items, vec!["nested/a.rs"]);
    }

    #[test]
    fn gitignored_files_are_skipped() {
        let temp = tempfile::tempdir().expect("tempdir");
        let sandbox = sandbox(temp.path());
        fs::write(temp.path().join(".gitignore"), "target/\n").expect("write ignore");
        sandbox.write_file("target/out.txt", "x").expect("write");
        sandbox.write_file("src.txt", "x").expect("write");
        assert_eq!(sandbox.list_files(None).expect("list").items, vec!["src.txt"]);
    }

    #[test]
    fn search_reports_path_and_line() {
        let temp = tempfile::tempdir().expect("tempdir");
        let sandbox = sandbox(temp.path());
        sandbox
            .write_file("notes.txt", "alpha\nfn main() {\nbeta\n")
            .expect("write");
        let hits = sandbox.search("fn main(", None).expect("search");
        assert_eq!(hits.items.len(), 1);
        assert_eq!(hits.items[0].render(), "notes.txt:2: fn main() {");

        let regex_hits = sandbox.search("^(alpha|beta)$", None).expect("search");
        assert_eq!(regex_hits.items.len(), 2);
    }

    #[cfg(unix)]
    #[test]
    fn shell_runs_in_workspace_root() {
        let temp = tempfile::tempdir().expect("tempdir");
        let sandbox = sandbox(temp.path());
        sandbox.write_file("marker.txt", "here").expect("write");
        let output = sandbox.run_shell("cat marker.txt; exit 2").expect("shell");
        assert_eq!(output.stdout, "here");
        assert_eq!(output.exit_code, Some(2));
        assert!(output.render().starts_with("exit_code: 2\nstdout:\nhere"));
    }

    #[cfg(unix)]
    #[test]
    fn shell_timeout_returns_partial_output() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut limits = limits();
        limits.command_timeout_sec = 1;
        let sandbox = WorkspaceSandbox::new(temp.path(), "/bin/sh", limits).expect("sandbox");
        match sandbox.run_shell("echo started; sleep 20").unwrap_err() {
            ToolError::Timeout { partial, .. } => assert_eq!(partial.stdout, "started\n"),
            other => panic!("expected timeout, got {other}"),
        }
    }

    #[test]
    fn web_search_without_key_is_unavailable() {
        let temp = tempfile::tempdir().expect("tempdir");
        let sandbox = sandbox(temp.path());
        assert!(!sandbox.web_search_available());
        assert!(matches!(
            sandbox.web_search("rust").unwrap_err(),
            ToolError::NotAvailable { .. }
        ));
    }
}
