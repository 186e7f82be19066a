//! System prompt rendering for one step loop.

use anyhow::Result;
use minijinja::{Environment, context};

const SYSTEM_TEMPLATE: &str = include_str!("prompts/system.md");

/// Facts about the current investigation the system prompt describes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptInputs {
    pub depth: u32,
    pub max_depth: u32,
    pub max_steps: u32,
    pub may_delegate: bool,
    pub acceptance_criteria: bool,
    pub web_search: bool,
    pub command_timeout_sec: u64,
    pub max_solve_seconds: u64,
    /// Displayed workspace root, already redacted in demo mode.
    pub workspace: Option<String>,
}

/// Template engine wrapper around minijinja.
pub struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.add_template("system", SYSTEM_TEMPLATE)
            .expect("system template should be valid");
        Self { env }
    }

    pub fn render_system(&self, input: &PromptInputs) -> Result<String> {
        let template = self.env.get_template("system")?;
        let rendered = template.render(context! {
            depth => input.depth,
            max_depth => input.max_depth,
            max_steps => input.max_steps,
            may_delegate => input.may_delegate,
            acceptance_criteria => input.acceptance_criteria,
            web_search => input.web_search,
            command_timeout_sec => input.command_timeout_sec,
            max_solve_seconds => (input.max_solve_seconds > 0).then_some(input.max_solve_seconds),
            workspace => input.workspace.as_deref(),
        })?;
        Ok(rendered.trim().to_string())
    }
}

impl Default for PromptEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// First user turn of a step loop.
pub fn objective_message(objective: &str) -> String {
    objective.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs() -> PromptInputs {
        PromptInputs {
            depth: 0,
            max_depth: 4,
            max_steps: 100,
            may_delegate: true,
            acceptance_criteria: true,
            web_search: false,
            command_timeout_sec: 45,
            max_solve_seconds: 0,
            workspace: Some("<workspace>".to_string()),
        }
    }

    #[test]
    fn renders_delegation_and_acceptance_sections() {
        let prompt = PromptEngine::new().render_system(&inputs()).expect("render");
        assert!(prompt.contains("rooted at `<workspace>`"));
        assert!(prompt.contains("Use `subtask`"));
        assert!(prompt.contains("Acceptance criteria"));
        assert!(!prompt.contains("`web_search`"));
        assert!(!prompt.contains("must finish within"));
    }

    #[test]
    fn leaf_depth_omits_delegation() {
        let prompt = PromptEngine::new()
            .render_system(&PromptInputs {
                depth: 4,
                may_delegate: false,
                acceptance_criteria: false,
                web_search: true,
                max_solve_seconds: 30,
                ..inputs()
            })
            .expect("render");
        assert!(prompt.contains("Delegation is not available"));
        assert!(!prompt.contains("Use `subtask`"));
        assert!(!prompt.contains("[x]"));
        assert!(prompt.contains("`web_search`"));
        assert!(prompt.contains("within 30 seconds"));
    }
}
