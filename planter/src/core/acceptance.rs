//! Structural self-check applied to final answers.
//!
//! A final answer passes when it carries an "Acceptance criteria" section with
//! at least one list item and no item is marked unmet.

/// Outcome of checking one final answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcceptanceCheck {
    Satisfied,
    /// No criteria heading, or a heading with no list items under it.
    MissingCriteria,
    /// Criteria items the answer itself marks as not met.
    Unmet(Vec<String>),
}

impl AcceptanceCheck {
    pub fn is_satisfied(&self) -> bool {
        matches!(self, AcceptanceCheck::Satisfied)
    }

    /// Observation text fed back to the model when the check fails.
    pub fn gap_message(&self) -> Option<String> {
        match self {
            AcceptanceCheck::Satisfied => None,
            AcceptanceCheck::MissingCriteria => Some(
                "Final answer rejected: it has no \"Acceptance criteria\" section. \
                 State the criteria the answer must meet as a list under that heading, \
                 mark each one as met, then answer again."
                    .to_string(),
            ),
            AcceptanceCheck::Unmet(items) => Some(format!(
                "Final answer rejected: these acceptance criteria are not met yet:\n{}\n\
                 Keep investigating until they are met, or revise them, then answer again.",
                items
                    .iter()
                    .map(|item| format!("- {item}"))
                    .collect::<Vec<_>>()
                    .join("\n")
            )),
        }
    }
}

/// Check `answer` for a satisfied acceptance-criteria section.
pub fn check_acceptance(answer: &str) -> AcceptanceCheck {
    let mut lines = answer.lines();
    if !lines.by_ref().any(is_criteria_heading) {
        return AcceptanceCheck::MissingCriteria;
    }

    let mut items = Vec::new();
    for line in lines {
        let trimmed = line.trim();
        if trimmed.starts_with('#') {
            break;
        }
        if let Some(item) = list_item(trimmed) {
            items.push(item.to_string());
        }
    }
    if items.is_empty() {
        return AcceptanceCheck::MissingCriteria;
    }

    let unmet: Vec<String> = items.into_iter().filter(|item| is_unmet(item)).collect();
    if unmet.is_empty() {
        AcceptanceCheck::Satisfied
    } else {
        AcceptanceCheck::Unmet(unmet)
    }
}

fn is_criteria_heading(line: &str) -> bool {
    let stripped = line.trim().trim_start_matches(['#', '*', '_', ' ']);
    stripped.to_ascii_lowercase().starts_with("acceptance criteria")
}

fn list_item(line: &str) -> Option<&str> {
    if let Some(rest) = line.strip_prefix("- ").or_else(|| line.strip_prefix("* ")) {
        return Some(rest.trim());
    }
    let digits = line.chars().take_while(char::is_ascii_digit).count();
    if digits > 0 {
        let rest = &line[digits..];
        if let Some(rest) = rest.strip_prefix(". ").or_else(|| rest.strip_prefix(") ")) {
            return Some(rest.trim());
        }
    }
    None
}

fn is_unmet(item: &str) -> bool {
    let lower = item.to_ascii_lowercase();
    lower.starts_with("[ ]") || lower.contains("unmet") || lower.contains("not met")
}
