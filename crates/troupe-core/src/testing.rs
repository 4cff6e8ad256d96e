//! Test utilities shared across the workspace.
//! Only compiled when running tests or with the `testing` feature.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use futures::stream;

use crate::error::Error;
use crate::message::{StreamChunk, Usage};
use crate::provider::{
    CompletionRequest, ModelKind, ModelResolver, Provider, ProviderKind, ResolvedModel,
    StreamResult,
};
use crate::record::{
    MessageRecord, MessageStatus, MessageStore, NewMessage, RecordSink, Studio, StudioAction,
    TaskRecord,
};
use crate::stream::StreamingCompletion;
use crate::taskref::AgentTaskRef;

/// A mock provider that replays pre-queued chunk sequences.
pub struct MockProvider {
    streams: Mutex<Vec<Vec<Result<StreamChunk, Error>>>>,
    /// Captured requests (for assertion).
    pub captured_requests: Mutex<Vec<CompletionRequest>>,
    pub name: String,
    pub kind: ProviderKind,
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MockProvider {
    pub fn new() -> Self {
        Self {
            streams: Mutex::new(Vec::new()),
            captured_requests: Mutex::new(Vec::new()),
            name: "mock".to_string(),
            kind: ProviderKind::Hosted,
        }
    }

    pub fn self_hosted() -> Self {
        Self {
            kind: ProviderKind::SelfHosted,
            ..Self::new()
        }
    }

    /// Queue a plain text response ending with nonzero usage.
    /// Streams are returned in FIFO order (first queued = first returned).
    pub fn queue_text(&self, content: &str) {
        self.queue_chunks(vec![
            Ok(StreamChunk::Start {
                model: "mock-model".to_string(),
            }),
            Ok(StreamChunk::Delta {
                content: content.to_string(),
            }),
            Ok(StreamChunk::Done {
                usage: Some(Usage::new(10, 20)),
            }),
        ]);
    }

    /// Queue a response that requests one tool call and nothing else.
    pub fn queue_tool_call(&self, id: &str, name: &str, arguments: &str) {
        self.queue_chunks(vec![
            Ok(StreamChunk::ToolCallStart {
                index: 0,
                id: id.to_string(),
                name: name.to_string(),
            }),
            Ok(StreamChunk::ToolCallDelta {
                index: 0,
                arguments: arguments.to_string(),
            }),
            Ok(StreamChunk::Done {
                usage: Some(Usage::new(5, 5)),
            }),
        ]);
    }

    /// Queue a stream that fails immediately.
    pub fn queue_error(&self, error: Error) {
        self.queue_chunks(vec![Err(error)]);
    }

    pub fn queue_chunks(&self, chunks: Vec<Result<StreamChunk, Error>>) {
        self.streams.lock().unwrap().insert(0, chunks);
    }

    pub fn request_count(&self) -> usize {
        self.captured_requests.lock().unwrap().len()
    }

    pub fn last_request(&self) -> Option<CompletionRequest> {
        self.captured_requests.lock().unwrap().last().cloned()
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.captured_requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn default_model(&self) -> Option<&str> {
        Some("mock-model")
    }

    fn kind(&self) -> ProviderKind {
        self.kind
    }

    async fn stream(&self, request: CompletionRequest) -> Result<StreamResult, Error> {
        self.captured_requests.lock().unwrap().push(request);
        match self.streams.lock().unwrap().pop() {
            Some(chunks) => Ok(Box::pin(stream::iter(chunks)) as StreamResult),
            None => Err(Error::api(500, "MockProvider: no streams queued")),
        }
    }
}

/// Resolver that hands out the same provider/model pairing for every kind.
pub struct StaticResolver {
    model: ResolvedModel,
}

impl StaticResolver {
    pub fn new(provider: std::sync::Arc<dyn Provider>, model: &str, supports_tools: bool) -> Self {
        Self {
            model: ResolvedModel {
                provider,
                model: model.to_string(),
                supports_tools,
            },
        }
    }
}

impl ModelResolver for StaticResolver {
    fn resolve(&self, _kind: ModelKind) -> Result<ResolvedModel, Error> {
        Ok(self.model.clone())
    }
}

/// In-memory message store with sequential ids.
pub struct MemoryStore {
    messages: Mutex<Vec<MessageRecord>>,
    tasks: Mutex<Vec<TaskRecord>>,
    next_id: AtomicU64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            messages: Mutex::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn records(&self) -> Vec<MessageRecord> {
        self.messages.lock().unwrap().clone()
    }

    pub fn tasks(&self) -> Vec<TaskRecord> {
        self.tasks.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn create_message(&self, message: NewMessage) -> Result<MessageRecord, Error> {
        let id = format!("msg-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let record = MessageRecord {
            id,
            conversation_id: message.conversation_id,
            content: message.content,
            role: message.role,
            status: message.status,
            role_label: message.role_label,
            task: message.task,
            block: None,
        };
        self.messages.lock().unwrap().push(record.clone());
        Ok(record)
    }

    async fn update_message(
        &self,
        id: &str,
        content: &str,
        status: MessageStatus,
    ) -> Result<(), Error> {
        let mut messages = self.messages.lock().unwrap();
        let record = messages
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| Error::storage(format!("no message with id {}", id)))?;
        record.content = content.to_string();
        record.status = status;
        Ok(())
    }

    async fn create_task(
        &self,
        kind: &str,
        description: &str,
        payload: &str,
    ) -> Result<TaskRecord, Error> {
        let id = format!("task-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let task = TaskRecord {
            id,
            kind: kind.to_string(),
            description: description.to_string(),
            payload: payload.to_string(),
        };
        self.tasks.lock().unwrap().push(task.clone());
        Ok(task)
    }

    async fn update_task(&self, id: &str, payload: &str) -> Result<(), Error> {
        let mut tasks = self.tasks.lock().unwrap();
        let task = tasks
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| Error::storage(format!("no task with id {}", id)))?;
        task.payload = payload.to_string();
        Ok(())
    }
}

/// Sink that keeps every published record for assertion.
#[derive(Default)]
pub struct CollectingSink {
    records: Mutex<Vec<MessageRecord>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<MessageRecord> {
        self.records.lock().unwrap().clone()
    }

    pub fn publish_count(&self) -> usize {
        self.records.lock().unwrap().len()
    }
}

impl RecordSink for CollectingSink {
    fn publish(&self, record: &MessageRecord) {
        self.records.lock().unwrap().push(record.clone());
    }
}

/// Studio double that records actions and drains any streamed completion.
#[derive(Default)]
pub struct RecordingStudio {
    pub actions: Mutex<Vec<StudioAction>>,
    pub streamed_payloads: Mutex<Vec<String>>,
}

impl RecordingStudio {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn action_count(&self) -> usize {
        self.actions.lock().unwrap().len()
    }
}

#[async_trait]
impl Studio for RecordingStudio {
    fn preview(&self, action: &StudioAction) -> String {
        format!("{}: {}", action.kind, action.description)
    }

    async fn start(&self, action: StudioAction, _task: &AgentTaskRef) -> Result<(), Error> {
        self.actions.lock().unwrap().push(action);
        Ok(())
    }

    async fn start_with_stream(
        &self,
        action: StudioAction,
        completion: &StreamingCompletion,
        _task: &AgentTaskRef,
    ) -> Result<(), Error> {
        self.actions.lock().unwrap().push(action);
        let content = completion.full_content().await.unwrap_or_default();
        self.streamed_payloads.lock().unwrap().push(content);
        Ok(())
    }
}
