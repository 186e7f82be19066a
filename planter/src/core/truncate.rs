//! Deterministic truncation helpers.
//!
//! Every capped value keeps its head and appends a marker saying how much was
//! cut, so a truncated rendering is always `prefix + marker` and never longer
//! than the cap it was built with.

/// Truncate `raw` to at most `cap` characters.
///
/// Returns the rendered text and whether anything was cut. When `cap` is too
/// small to hold any marker the head is hard-cut instead.
pub fn truncate_chars(raw: &str, cap: usize) -> (String, bool) {
    let total = raw.chars().count();
    if total <= cap {
        return (raw.to_string(), false);
    }

    let mut keep = cap;
    loop {
        let marker = omitted_chars_marker(total - keep);
        let marker_len = marker.chars().count();
        if keep + marker_len <= cap {
            let mut out: String = raw.chars().take(keep).collect();
            out.push_str(&marker);
            return (out, true);
        }
        if keep == 0 {
            break;
        }
        keep = cap.saturating_sub(marker_len).min(keep - 1);
    }

    (raw.chars().take(cap).collect(), true)
}

fn omitted_chars_marker(omitted: usize) -> String {
    format!("\n...[truncated {omitted} chars]")
}

/// An ordered item list capped to a maximum length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capped<T> {
    pub items: Vec<T>,
    /// Number of items dropped from the tail.
    pub omitted: usize,
}

impl<T> Capped<T> {
    /// Keep the first `cap` items and count the rest.
    pub fn from_items(mut items: Vec<T>, cap: usize) -> Self {
        let omitted = items.len().saturating_sub(cap);
        items.truncate(cap);
        Self { items, omitted }
    }

    pub fn truncated(&self) -> bool {
        self.omitted > 0
    }

    /// Render one line per item plus an omission marker.
    pub fn render_lines<F: Fn(&T) -> String>(&self, render: F) -> String {
        let mut lines: Vec<String> = self.items.iter().map(render).collect();
        if self.omitted > 0 {
            lines.push(format!("...[{} more omitted]", self.omitted));
        }
        lines.join("\n")
    }
}
