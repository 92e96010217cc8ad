//! Parsing of the agent's serialized UI tree.
//!
//! The agent dumps every node as one line of `Name: value,` fields, such as
//! `Node: android.widget.TextView, Text: CR14_R3, Clickable: true, ...`.
//! Only the visible text labels matter for navigation. A label may itself
//! contain commas; it ends at the next `, Field:` or at the end of the line.

use regex::Regex;
use std::collections::HashSet;
use std::sync::OnceLock;

/// Turns a raw UI dump into the set of visible element labels.
pub trait UiTreeParser: Send + Sync {
    /// Labels present in `raw`. Empty and `null` labels are left out.
    fn parse(&self, raw: &str) -> HashSet<String>;
}

/// Extracts every `Text: <label>,` field from the dump.
#[derive(Debug, Default, Clone, Copy)]
pub struct TextLabelParser;

fn label_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        #[allow(clippy::expect_used)]
        Regex::new(r"(?m)Text: (.*?),(?: [A-Z][A-Za-z]*:|\s*$)").expect("label pattern is valid")
    })
}

impl UiTreeParser for TextLabelParser {
    fn parse(&self, raw: &str) -> HashSet<String> {
        label_pattern()
            .captures_iter(raw)
            .filter_map(|caps| caps.get(1))
            .map(|m| m.as_str().to_string())
            .filter(|label| !label.is_empty() && label != "null")
            .collect()
    }
}
