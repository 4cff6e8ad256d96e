//! Cleanup of role-play scaffolding before content is persisted.
//!
//! Dialogue agents think in terms of prompt markers (`<task>`,
//! `<expected_result>`, the termination sentinel) and occasionally echo them
//! back, or stutter their tool-use narration. Final message content gets one
//! pass through this filter so none of that leaks into the transcript.

use std::collections::HashSet;

use regex::Regex;

/// Prompt markers removed at their first occurrence only.
const MARKERS: [&str; 9] = [
    "<assistant>",
    "<user>",
    "<task>",
    "<expected_result>",
    "<context>",
    "<TASK_DONE>",
    "Instructions:",
    "Expected Result:",
    "Solution:",
];

/// Strip prompt markers and duplicated narration from final content.
/// Every removal keeps the previous value if it would empty the text.
pub fn strip_dialogue_markup(content: &str) -> String {
    let mut result = content.to_string();
    for marker in MARKERS {
        let filtered = result.replacen(marker, "", 1);
        if !filtered.is_empty() {
            result = filtered;
        }
    }

    let narration = Regex::new(r"I will use.*?I will use").unwrap();
    let filtered = narration.replace_all(&result, "").to_string();
    if !filtered.is_empty() {
        result = filtered;
    }

    remove_duplicate_sentences(&result)
}

/// Collapse repeated sentences, keeping the first occurrence. Segments are
/// delimited by CJK or ASCII sentence terminators; punctuation-only segments
/// survive untouched.
fn remove_duplicate_sentences(text: &str) -> String {
    const TERMINATORS: [char; 6] = ['。', '！', '？', '.', '!', '?'];

    let mut segments: Vec<(String, String)> = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        if TERMINATORS.contains(&ch) {
            segments.push((std::mem::take(&mut current), ch.to_string()));
        } else {
            current.push(ch);
        }
    }
    if !current.is_empty() {
        segments.push((current, String::new()));
    }

    let mut seen = HashSet::new();
    let mut out = String::new();
    for (sentence, punctuation) in segments {
        let trimmed = sentence.trim();
        if trimmed.is_empty() {
            out.push_str(&punctuation);
        } else if seen.insert(trimmed.to_string()) {
            out.push_str(trimmed);
            out.push_str(&punctuation);
        }
    }
    out
}
