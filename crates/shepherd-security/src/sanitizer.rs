use regex::Regex;
use std::sync::OnceLock;

/// Tag names the prompt renderer uses to delimit sections. Free text that
/// contains these tags is escaped so it cannot close or open a section.
pub const STRUCTURAL_TAGS: &[&str] = &[
    "task",
    "task_id",
    "task_subject",
    "task_description",
    "inbox",
    "inbox_message",
    "instructions",
    "overlay",
    "completion",
];

fn tag_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            let names = STRUCTURAL_TAGS.join("|");
            Regex::new(&format!(r"(?i)<\s*/?\s*(?:{names})\b[^>]*>")).ok()
        })
        .as_ref()
}

/// Sanitizer for untrusted text placed into agent prompts.
///
/// Text is never rejected: control characters are stripped, structural tags
/// are neutralised, and the result is truncated on a character boundary.
#[derive(Debug, Clone)]
pub struct PromptSanitizer {
    max_field_chars: usize,
}

impl Default for PromptSanitizer {
    fn default() -> Self {
        Self {
            max_field_chars: 8_000,
        }
    }
}

impl PromptSanitizer {
    /// Sanitizer that truncates fields past `max_field_chars`.
    pub fn new(max_field_chars: usize) -> Self {
        Self { max_field_chars }
    }

    /// Length cap applied to each field.
    pub fn max_field_chars(&self) -> usize {
        self.max_field_chars
    }

    /// Clean one free-text field.
    pub fn sanitize(&self, input: &str) -> String {
        let cleaned: String = input
            .chars()
            .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
            .collect();
        let escaped = escape_structural_tags(&cleaned);
        truncate_chars(&escaped, self.max_field_chars)
    }
}

/// Replace the angle brackets of any structural tag with HTML entities.
pub fn escape_structural_tags(input: &str) -> String {
    let Some(pattern) = tag_pattern() else {
        return input.replace('<', "&lt;").replace('>', "&gt;");
    };
    pattern
        .replace_all(input, |caps: &regex::Captures<'_>| {
            caps[0].replace('<', "&lt;").replace('>', "&gt;")
        })
        .into_owned()
}

/// Keep at most `max_chars` characters, marking the cut.
pub fn truncate_chars(input: &str, max_chars: usize) -> String {
    match input.char_indices().nth(max_chars) {
        None => input.to_string(),
        Some((byte_index, _)) => {
            let mut out = input[..byte_index].to_string();
            out.push_str("\n[truncated]");
            out
        }
    }
}
