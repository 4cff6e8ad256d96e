use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::System => write!(f, "system"),
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
            Role::Tool => write!(f, "tool"),
        }
    }
}

/// A tool call as reconciled from streamed fragments.
///
/// `arguments` stays the raw concatenated string the model produced; it is
/// parsed into JSON only at dispatch time, so lossy intermediate states
/// (arguments split mid-token across chunks) never corrupt the call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

impl ToolCall {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments: arguments.into(),
        }
    }

    /// Parse the raw arguments into a JSON value. An empty arguments string
    /// parses as an empty object.
    pub fn arguments_value(&self) -> crate::Result<serde_json::Value> {
        if self.arguments.trim().is_empty() {
            return Ok(serde_json::json!({}));
        }
        Ok(serde_json::from_str(&self.arguments)?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub tool_calls: Vec<ToolCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn assistant_with_tool_calls(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_calls,
            tool_call_id: None,
        }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: Some(tool_call_id.into()),
        }
    }

    /// True when the message carries nothing: no content, no tool calls and
    /// no tool-call id. Such entries are never appended to a history.
    pub fn is_vacuous(&self) -> bool {
        self.content.is_empty() && self.tool_calls.is_empty() && self.tool_call_id.is_none()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl Usage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }

    pub fn add(&mut self, other: &Usage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}

/// One delta from a streaming completion.
///
/// Tool-call fragments carry the index of the call they belong to; a single
/// call's id, name and arguments may all be split across any number of
/// fragments and are reassembled by `StreamingCompletion`.
#[derive(Debug, Clone)]
pub enum StreamChunk {
    Start { model: String },
    Delta { content: String },
    ToolCallStart { index: usize, id: String, name: String },
    ToolCallDelta { index: usize, arguments: String },
    Done { usage: Option<Usage> },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_creation() {
        let msg = Message::user("Hello, world!");
        assert_eq!(msg.role, Role::User);
        assert_eq!(msg.content, "Hello, world!");
    }

    #[test]
    fn test_tool_result_carries_call_id() {
        let msg = Message::tool_result("call_1", "done");
        assert_eq!(msg.role, Role::Tool);
        assert_eq!(msg.tool_call_id.as_deref(), Some("call_1"));
    }

    #[test]
    fn test_vacuous_message() {
        assert!(Message::assistant("").is_vacuous());
        assert!(!Message::assistant("hi").is_vacuous());
        assert!(!Message::tool_result("call_1", "").is_vacuous());
        assert!(!Message::assistant_with_tool_calls(
            "",
            vec![ToolCall::new("call_1", "search", "{}")]
        )
        .is_vacuous());
    }

    #[test]
    fn test_arguments_value() {
        let call = ToolCall::new("call_1", "search", r#"{"query": "rust"}"#);
        let value = call.arguments_value().unwrap();
        assert_eq!(value["query"], "rust");

        let empty = ToolCall::new("call_2", "noop", "");
        assert_eq!(empty.arguments_value().unwrap(), serde_json::json!({}));

        let bad = ToolCall::new("call_3", "broken", "{oops");
        assert!(bad.arguments_value().is_err());
    }

    #[test]
    fn test_usage_totals() {
        let mut usage = Usage::new(10, 5);
        assert_eq!(usage.total_tokens, 15);
        usage.add(&Usage::new(1, 2));
        assert_eq!(usage.total_tokens, 18);
        assert_eq!(usage.prompt_tokens, 11);
    }

    #[test]
    fn test_role_display() {
        assert_eq!(Role::User.to_string(), "user");
        assert_eq!(Role::Assistant.to_string(), "assistant");
    }
}
