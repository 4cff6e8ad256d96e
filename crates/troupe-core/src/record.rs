use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Error;
use crate::message::Role;
use crate::stream::StreamingCompletion;
use crate::taskref::AgentTaskRef;

/// Lifecycle of a persisted conversation record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageStatus {
    Pending,
    Completed,
    Idle,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub description: String,
    pub payload: String,
}

/// One persisted conversation entry. `block` is set on the virtual records
/// handed back from block writes so callers can address the block they own
/// inside the shared turn record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: String,
    pub conversation_id: String,
    pub content: String,
    pub role: Role,
    pub status: MessageStatus,
    pub role_label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task: Option<TaskRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub conversation_id: String,
    pub content: String,
    pub role: Role,
    pub status: MessageStatus,
    pub role_label: String,
    pub task: Option<TaskRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentBlockKind {
    Text,
    ToolCall,
    ToolMessage,
    Task,
    PlanSteps,
    UserAgent,
    AssistantAgent,
    SubtaskStart,
    SubtaskComplete,
    SubtaskFailed,
    Coordinate,
    FinalResult,
    HtmlReport,
}

/// One entry in the ordered block list that backs a logical assistant turn.
/// The whole list is what gets serialized into `MessageRecord::content`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentBlock {
    #[serde(rename = "type")]
    pub kind: ContentBlockKind,
    pub content: Value,
    pub timestamp: i64,
    pub role_label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subtask_id: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_collapse: Option<bool>,
}

impl ContentBlock {
    pub fn new(kind: ContentBlockKind, content: Value, role_label: impl Into<String>) -> Self {
        Self {
            kind,
            content,
            timestamp: Utc::now().timestamp_millis(),
            role_label: role_label.into(),
            subtask_id: None,
            auto_collapse: None,
        }
    }

    pub fn text(content: impl Into<String>, role_label: impl Into<String>) -> Self {
        Self::new(ContentBlockKind::Text, Value::String(content.into()), role_label)
    }

    pub fn with_subtask(mut self, subtask_id: u32) -> Self {
        self.subtask_id = Some(subtask_id);
        self
    }
}

/// An action the studio can carry out on behalf of an agent, e.g. rendering
/// a report or publishing a summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StudioAction {
    pub kind: String,
    pub description: String,
    pub payload: Value,
}

impl StudioAction {
    pub fn new(kind: impl Into<String>, description: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            description: description.into(),
            payload,
        }
    }
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn create_message(&self, message: NewMessage) -> Result<MessageRecord, Error>;

    async fn update_message(
        &self,
        id: &str,
        content: &str,
        status: MessageStatus,
    ) -> Result<(), Error>;

    async fn create_task(
        &self,
        kind: &str,
        description: &str,
        payload: &str,
    ) -> Result<TaskRecord, Error>;

    async fn update_task(&self, id: &str, payload: &str) -> Result<(), Error>;
}

/// Push-side of record updates. Implementations forward records to whatever
/// transport feeds the UI.
pub trait RecordSink: Send + Sync {
    fn publish(&self, record: &MessageRecord);
}

/// External collaborator that turns agent output into user-facing artifacts.
/// `start_with_stream` must drain the completion and republish the growing
/// payload as fragments arrive.
#[async_trait]
pub trait Studio: Send + Sync {
    fn preview(&self, action: &StudioAction) -> String;

    async fn start(&self, action: StudioAction, task: &AgentTaskRef) -> Result<(), Error>;

    async fn start_with_stream(
        &self,
        action: StudioAction,
        completion: &StreamingCompletion,
        task: &AgentTaskRef,
    ) -> Result<(), Error>;
}
