//! Subtask planning: the decomposition record and the layered parser that
//! turns free-form planner replies into a subtask list.

use regex::Regex;
use serde::{Deserialize, Serialize};

/// One unit of work produced by task decomposition.
///
/// `dependencies` holds ids of subtasks whose results feed this one. They
/// shape the execution prompt only; scheduling stays in list order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubTask {
    pub id: u32,
    pub description: String,
    #[serde(default)]
    pub completed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<u32>,
}

impl SubTask {
    pub fn new(id: u32, description: impl Into<String>) -> Self {
        Self {
            id,
            description: description.into(),
            completed: false,
            result: None,
            dependencies: Vec::new(),
        }
    }

    pub fn with_dependencies(mut self, dependencies: Vec<u32>) -> Self {
        self.dependencies = dependencies;
        self
    }
}

/// Shape the planner is asked to produce. Missing ids are filled from the
/// list position during conversion.
#[derive(Deserialize)]
struct RawSubTask {
    #[serde(default)]
    id: Option<u32>,
    description: String,
    #[serde(default)]
    dependencies: Vec<u32>,
}

/// Parse a planner reply into subtasks.
///
/// Layered fallback: a fenced code block wins if present; otherwise the first
/// balanced top-level JSON array, then object, then the whole reply. If JSON
/// parsing fails on the chosen segment, a line-oriented heuristic matching
/// `<number><punctuation> <description>` lines is the last resort.
pub fn parse_subtasks(content: &str) -> Vec<SubTask> {
    let segment = extract_json_segment(content);
    match parse_json_subtasks(segment.trim()) {
        Some(tasks) => tasks,
        None => parse_numbered_lines(content),
    }
}

fn extract_json_segment(content: &str) -> &str {
    let fence = Regex::new(r"(?is)```(?:json)?\s*(.*?)```").unwrap();
    if let Some(caps) = fence.captures(content) {
        if let Some(block) = caps.get(1) {
            return block.as_str();
        }
    }
    if let Some(array) = extract_balanced_json(content, '[') {
        return array;
    }
    if let Some(object) = extract_balanced_json(content, '{') {
        return object;
    }
    content
}

/// Extract the first balanced top-level JSON segment opened by `open`
/// (`'['` or `'{'`).
///
/// Bracket characters inside quoted strings are skipped; both quote styles
/// and backslash escapes are honored, so embedded `[`/`{`/escaped quotes
/// never truncate the segment.
pub fn extract_balanced_json(text: &str, open: char) -> Option<&str> {
    let close = match open {
        '[' => ']',
        '{' => '}',
        _ => return None,
    };
    let start = text.find(open)?;

    let mut depth = 0usize;
    let mut in_string = false;
    let mut string_delim = '"';
    let mut escaped = false;
    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == string_delim {
                in_string = false;
            }
            continue;
        }
        if ch == '"' || ch == '\'' {
            in_string = true;
            string_delim = ch;
        } else if ch == open {
            depth += 1;
        } else if ch == close {
            depth -= 1;
            if depth == 0 {
                return Some(&text[start..start + offset + ch.len_utf8()]);
            }
        }
    }
    None
}

/// Parse a JSON segment as a subtask list. A bare object is wrapped into a
/// one-element list; a fragment without brackets is retried inside `[...]`.
/// Returns `None` only when JSON parsing itself fails.
fn parse_json_subtasks(segment: &str) -> Option<Vec<SubTask>> {
    let raw: Vec<RawSubTask> = if segment.starts_with('{') {
        vec![serde_json::from_str(segment).ok()?]
    } else if segment.starts_with('[') {
        serde_json::from_str(segment).ok()?
    } else {
        serde_json::from_str(&format!("[{}]", segment)).ok()?
    };

    Some(
        raw.into_iter()
            .enumerate()
            .map(|(index, task)| SubTask {
                id: task.id.filter(|&id| id != 0).unwrap_or(index as u32 + 1),
                description: task.description,
                completed: false,
                result: None,
                dependencies: task.dependencies,
            })
            .collect(),
    )
}

fn parse_numbered_lines(content: &str) -> Vec<SubTask> {
    let line = Regex::new(r"^(\d+)[.:)]\s+(.+)$").unwrap();
    content
        .lines()
        .filter_map(|raw| {
            let caps = line.captures(raw.trim())?;
            let id = caps[1].parse().ok()?;
            Some(SubTask::new(id, &caps[2]))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_balanced_array_ignores_embedded_brackets() {
        let text = r#"Here is the plan: [{"id": 1, "description": "use arr[0] and {braces}"}] done"#;
        let segment = extract_balanced_json(text, '[').unwrap();
        assert_eq!(
            segment,
            r#"[{"id": 1, "description": "use arr[0] and {braces}"}]"#
        );
    }

    #[test]
    fn test_balanced_extraction_handles_escaped_quotes() {
        let text = r#"x ["a \"quoted\" ]", "b"] y"#;
        let segment = extract_balanced_json(text, '[').unwrap();
        assert_eq!(segment, r#"["a \"quoted\" ]", "b"]"#);
    }

    #[test]
    fn test_balanced_extraction_handles_single_quotes() {
        let text = "before ['it] has a bracket', 2] after";
        let segment = extract_balanced_json(text, '[').unwrap();
        assert_eq!(segment, "['it] has a bracket', 2]");
    }

    #[test]
    fn test_fenced_block_takes_priority() {
        let content = "Ignore this [1, 2].\n```json\n[{\"id\": 3, \"description\": \"real step\"}]\n```";
        let tasks = parse_subtasks(content);
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].id, 3);
        assert_eq!(tasks[0].description, "real step");
    }

    #[test]
    fn test_single_object_wrapped_into_list() {
        let tasks = parse_subtasks(r#"{"id": 5, "description": "only step"}"#);
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].id, 5);
    }

    #[test]
    fn test_dependencies_parsed_and_defaulted() {
        let tasks = parse_subtasks(
            r#"[{"id": 1, "description": "fetch"},
               {"id": 2, "description": "summarize", "dependencies": [1]}]"#,
        );
        assert_eq!(tasks[0].dependencies, Vec::<u32>::new());
        assert_eq!(tasks[1].dependencies, vec![1]);
    }

    #[test]
    fn test_missing_ids_fall_back_to_position() {
        let tasks = parse_subtasks(
            r#"[{"description": "first"}, {"description": "second"}]"#,
        );
        assert_eq!(tasks[0].id, 1);
        assert_eq!(tasks[1].id, 2);
    }

    #[test]
    fn test_numbered_line_fallback() {
        let content = "Plan:\n1. Collect the data\n2) Clean it up\n3: Write the report\nnot a step";
        let tasks = parse_subtasks(content);
        assert_eq!(tasks.len(), 3);
        assert_eq!(tasks[0].description, "Collect the data");
        assert_eq!(tasks[1].description, "Clean it up");
        assert_eq!(tasks[2].id, 3);
    }

    #[test]
    fn test_unparseable_reply_yields_empty_list() {
        assert!(parse_subtasks("I could not produce a plan.").is_empty());
    }
}
