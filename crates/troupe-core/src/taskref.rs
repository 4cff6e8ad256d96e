//! Turn-scoped aggregation and the task context threaded through agents.
//!
//! One logical assistant turn is backed by exactly one persisted record, no
//! matter how many nested agents emit into it. `TurnAggregator` owns that
//! record and its ordered block list; `AgentTaskRef` is the capability
//! bundle handed down through every nested call so sub-agents can append
//! blocks, honor cancellation, and reach the studio without ever allocating
//! a record of their own.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::Error;
use crate::filter::strip_dialogue_markup;
use crate::message::Role;
use crate::record::{
    ContentBlock, ContentBlockKind, MessageRecord, MessageStatus, MessageStore, NewMessage,
    RecordSink, Studio, StudioAction,
};

/// Label shown on the shared turn record and its blocks.
pub const TURN_ROLE_LABEL: &str = "Multi-Agent System";

struct SharedTurn {
    record_id: Option<String>,
    blocks: Vec<ContentBlock>,
}

/// Accumulates the ordered content blocks of one assistant turn and
/// republishes the whole serialized list on every write.
pub struct TurnAggregator {
    store: Arc<dyn MessageStore>,
    sink: Arc<dyn RecordSink>,
    conversation_id: String,
    turn: Mutex<SharedTurn>,
}

impl TurnAggregator {
    /// `existing_record_id` reuses a record supplied by the caller; otherwise
    /// the record is created lazily on the first block write.
    pub fn new(
        store: Arc<dyn MessageStore>,
        sink: Arc<dyn RecordSink>,
        conversation_id: impl Into<String>,
        existing_record_id: Option<String>,
    ) -> Self {
        Self {
            store,
            sink,
            conversation_id: conversation_id.into(),
            turn: Mutex::new(SharedTurn {
                record_id: existing_record_id,
                blocks: Vec::new(),
            }),
        }
    }

    fn lock_turn(&self) -> MutexGuard<'_, SharedTurn> {
        self.turn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn record_id(&self) -> Option<String> {
        self.lock_turn().record_id.clone()
    }

    async fn ensure_record(&self) -> Result<String, Error> {
        if let Some(id) = self.lock_turn().record_id.clone() {
            return Ok(id);
        }
        let record = self
            .store
            .create_message(NewMessage {
                conversation_id: self.conversation_id.clone(),
                content: "[]".to_string(),
                role: Role::Assistant,
                status: MessageStatus::Pending,
                role_label: TURN_ROLE_LABEL.to_string(),
                task: None,
            })
            .await?;
        let mut turn = self.lock_turn();
        if let Some(id) = &turn.record_id {
            return Ok(id.clone());
        }
        turn.record_id = Some(record.id.clone());
        Ok(record.id)
    }

    fn snapshot(
        &self,
        turn: &SharedTurn,
        id: &str,
        status: MessageStatus,
        block: Option<usize>,
    ) -> Result<MessageRecord, Error> {
        Ok(MessageRecord {
            id: id.to_string(),
            conversation_id: self.conversation_id.clone(),
            content: serde_json::to_string(&turn.blocks)?,
            role: Role::Assistant,
            status,
            role_label: TURN_ROLE_LABEL.to_string(),
            task: None,
            block,
        })
    }

    /// Append a block and republish. Returns a virtual record addressing the
    /// new block inside the shared turn record.
    pub async fn push_block(&self, block: ContentBlock) -> Result<MessageRecord, Error> {
        let id = self.ensure_record().await?;
        let record = {
            let mut turn = self.lock_turn();
            turn.blocks.push(block);
            let index = turn.blocks.len() - 1;
            self.snapshot(&turn, &id, MessageStatus::Pending, Some(index))?
        };
        self.sink.publish(&record);
        Ok(record)
    }

    /// Replace a block's content in place and republish.
    pub fn update_block(&self, index: usize, content: Value) -> Result<(), Error> {
        let record = {
            let mut turn = self.lock_turn();
            let Some(id) = turn.record_id.clone() else {
                debug!(index, "block update before any block was written");
                return Ok(());
            };
            match turn.blocks.get_mut(index) {
                Some(block) => block.content = content,
                None => {
                    debug!(index, "block update for unknown index");
                    return Ok(());
                }
            }
            self.snapshot(&turn, &id, MessageStatus::Pending, Some(index))?
        };
        self.sink.publish(&record);
        Ok(())
    }

    /// Flag a block as collapsible in the UI and republish.
    pub fn set_auto_collapse(&self, index: usize) -> Result<(), Error> {
        let record = {
            let mut turn = self.lock_turn();
            let Some(id) = turn.record_id.clone() else {
                return Ok(());
            };
            match turn.blocks.get_mut(index) {
                Some(block) => block.auto_collapse = Some(true),
                None => return Ok(()),
            }
            self.snapshot(&turn, &id, MessageStatus::Pending, Some(index))?
        };
        self.sink.publish(&record);
        Ok(())
    }

    /// Persist the full serialized block list with the given status.
    pub async fn complete_shared(&self, status: MessageStatus) -> Result<(), Error> {
        let (id, serialized, record) = {
            let turn = self.lock_turn();
            let Some(id) = turn.record_id.clone() else {
                debug!("turn completed without any block writes");
                return Ok(());
            };
            let record = self.snapshot(&turn, &id, status, None)?;
            (id, record.content.clone(), record)
        };
        self.store.update_message(&id, &serialized, status).await?;
        self.sink.publish(&record);
        Ok(())
    }

    /// Create a standalone record outside the shared turn, e.g. a task
    /// message owned by the studio.
    pub async fn create_standalone(&self, message: NewMessage) -> Result<MessageRecord, Error> {
        let record = self.store.create_message(message).await?;
        self.sink.publish(&record);
        Ok(record)
    }

    /// Persist a standalone record. Dialogue markup is stripped from the
    /// final content before it lands in storage.
    pub async fn complete_standalone(
        &self,
        record: &MessageRecord,
        content: &str,
        status: MessageStatus,
    ) -> Result<(), Error> {
        let filtered = strip_dialogue_markup(content);
        self.store
            .update_message(&record.id, &filtered, status)
            .await?;
        let mut updated = record.clone();
        updated.content = filtered;
        updated.status = status;
        self.sink.publish(&updated);
        Ok(())
    }

    pub fn publish(&self, record: &MessageRecord) {
        self.sink.publish(record);
    }

    pub fn store(&self) -> &Arc<dyn MessageStore> {
        &self.store
    }
}

/// Capability bundle passed by value through every nested agent call.
///
/// Constructed once by the orchestration root; sub-components only clone and
/// narrow it (attach a sub-task id) on the way down.
#[derive(Clone)]
pub struct AgentTaskRef {
    conversation_id: String,
    ui_message_id: Option<String>,
    subtask_id: Option<u32>,
    cancel: CancellationToken,
    studio: Arc<dyn Studio>,
    aggregator: Arc<TurnAggregator>,
}

impl AgentTaskRef {
    pub fn new(
        conversation_id: impl Into<String>,
        cancel: CancellationToken,
        studio: Arc<dyn Studio>,
        aggregator: Arc<TurnAggregator>,
    ) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            ui_message_id: None,
            subtask_id: None,
            cancel,
            studio,
            aggregator,
        }
    }

    pub fn with_ui_message_id(mut self, id: impl Into<String>) -> Self {
        self.ui_message_id = Some(id.into());
        self
    }

    pub fn with_subtask_id(mut self, id: u32) -> Self {
        self.subtask_id = Some(id);
        self
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn ui_message_id(&self) -> Option<&str> {
        self.ui_message_id.as_deref()
    }

    pub fn subtask_id(&self) -> Option<u32> {
        self.subtask_id
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn studio(&self) -> &Arc<dyn Studio> {
        &self.studio
    }

    /// Id of the shared turn record, preferring the externally supplied UI
    /// message id. Used to key usage events.
    pub fn turn_message_id(&self) -> Option<String> {
        self.ui_message_id
            .clone()
            .or_else(|| self.aggregator.record_id())
    }

    /// Start a new content block in the shared turn record, tagged with this
    /// ref's sub-task id when present.
    pub async fn create_message(
        &self,
        kind: ContentBlockKind,
        content: Value,
        role_label: &str,
    ) -> Result<MessageRecord, Error> {
        let mut block = ContentBlock::new(kind, content, role_label);
        block.subtask_id = self.subtask_id;
        self.aggregator.push_block(block).await
    }

    /// Update the content of the block a virtual record addresses. Records
    /// without a block index are left to `complete_message`.
    pub fn update_message(&self, record: &MessageRecord, content: Value) -> Result<(), Error> {
        match record.block {
            Some(index) => self.aggregator.update_block(index, content),
            None => Ok(()),
        }
    }

    /// Mark the addressed block as auto-collapsible.
    pub fn mark_collapsible(&self, record: &MessageRecord) -> Result<(), Error> {
        match record.block {
            Some(index) => self.aggregator.set_auto_collapse(index),
            None => Ok(()),
        }
    }

    /// Finalize a record. The shared turn record persists its serialized
    /// block list; standalone records persist their filtered content.
    pub async fn complete_message(
        &self,
        record: &MessageRecord,
        content: &str,
        status: MessageStatus,
    ) -> Result<(), Error> {
        let is_shared = self
            .aggregator
            .record_id()
            .is_some_and(|id| id == record.id);
        if is_shared {
            self.aggregator.complete_shared(status).await
        } else {
            self.aggregator
                .complete_standalone(record, content, status)
                .await
        }
    }

    /// Create a standalone task-backed record for a studio action.
    pub async fn create_task_message(
        &self,
        action: &StudioAction,
        status: MessageStatus,
    ) -> Result<MessageRecord, Error> {
        let payload = serde_json::to_string(&action.payload)?;
        let task = self
            .aggregator
            .store()
            .create_task(&action.kind, &action.description, &payload)
            .await?;
        self.aggregator
            .create_standalone(NewMessage {
                conversation_id: self.conversation_id.clone(),
                content: String::new(),
                role: Role::Tool,
                status,
                role_label: "Tool".to_string(),
                task: Some(task),
            })
            .await
    }

    /// Persist a task record's final payload and mark its message completed.
    pub async fn complete_task_message(
        &self,
        record: &MessageRecord,
        payload: &str,
    ) -> Result<(), Error> {
        if let Some(task) = &record.task {
            self.aggregator.store().update_task(&task.id, payload).await?;
        }
        self.aggregator
            .store()
            .update_message(&record.id, &record.content, MessageStatus::Completed)
            .await?;
        let mut updated = record.clone();
        if let Some(task) = updated.task.as_mut() {
            task.payload = payload.to_string();
        }
        updated.status = MessageStatus::Completed;
        self.aggregator.publish(&updated);
        Ok(())
    }

    /// Push a record snapshot to the UI without persisting anything.
    pub fn publish(&self, record: &MessageRecord) {
        self.aggregator.publish(record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::testing::{CollectingSink, MemoryStore, RecordingStudio};

    fn task_ref(
        existing: Option<String>,
    ) -> (AgentTaskRef, Arc<MemoryStore>, Arc<CollectingSink>) {
        let store = Arc::new(MemoryStore::new());
        let sink = Arc::new(CollectingSink::new());
        let aggregator = Arc::new(TurnAggregator::new(
            store.clone(),
            sink.clone(),
            "conv-1",
            existing,
        ));
        let task = AgentTaskRef::new(
            "conv-1",
            CancellationToken::new(),
            Arc::new(RecordingStudio::new()),
            aggregator,
        );
        (task, store, sink)
    }

    #[tokio::test]
    async fn test_blocks_share_one_persisted_record() {
        let (task, store, sink) = task_ref(None);

        let first = task
            .create_message(ContentBlockKind::UserAgent, json!("hello"), "User Agent")
            .await
            .unwrap();
        let second = task
            .create_message(ContentBlockKind::AssistantAgent, json!("hi"), "Assistant")
            .await
            .unwrap();

        assert_eq!(store.records().len(), 1);
        assert_eq!(first.id, second.id);
        assert_eq!(first.block, Some(0));
        assert_eq!(second.block, Some(1));
        assert_eq!(sink.publish_count(), 2);

        let published = sink.records();
        let blocks: Vec<ContentBlock> =
            serde_json::from_str(&published.last().unwrap().content).unwrap();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].kind, ContentBlockKind::UserAgent);
    }

    #[tokio::test]
    async fn test_updates_republish_without_persisting() {
        let (task, store, sink) = task_ref(None);

        let record = task
            .create_message(ContentBlockKind::Text, json!(""), "Assistant")
            .await
            .unwrap();
        task.update_message(&record, json!("partial answer")).unwrap();
        task.mark_collapsible(&record).unwrap();

        // The store still holds the lazily created empty list.
        assert_eq!(store.records()[0].content, "[]");
        assert_eq!(sink.publish_count(), 3);

        let blocks: Vec<ContentBlock> =
            serde_json::from_str(&sink.records().last().unwrap().content).unwrap();
        assert_eq!(blocks[0].content, json!("partial answer"));
        assert_eq!(blocks[0].auto_collapse, Some(true));
    }

    #[tokio::test]
    async fn test_completion_persists_block_list() {
        let (task, store, _sink) = task_ref(None);

        let record = task
            .create_message(ContentBlockKind::Text, json!("done"), "Assistant")
            .await
            .unwrap();
        task.complete_message(&record, "", MessageStatus::Completed)
            .await
            .unwrap();

        let stored = &store.records()[0];
        assert_eq!(stored.status, MessageStatus::Completed);
        let blocks: Vec<ContentBlock> = serde_json::from_str(&stored.content).unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].content, json!("done"));
    }

    #[tokio::test]
    async fn test_external_record_id_reused() {
        let (task, store, _sink) = task_ref(Some("ui-msg-7".to_string()));

        let record = task
            .create_message(ContentBlockKind::Text, json!("x"), "Assistant")
            .await
            .unwrap();

        assert_eq!(record.id, "ui-msg-7");
        // No lazy record is created when the id was supplied externally.
        assert!(store.records().is_empty());
    }

    #[tokio::test]
    async fn test_standalone_completion_filters_markup() {
        let (task, store, _sink) = task_ref(None);

        let action = StudioAction::new("report", "Render summary", json!({"title": "t"}));
        let record = task
            .create_task_message(&action, MessageStatus::Pending)
            .await
            .unwrap();
        assert!(record.task.is_some());

        task.complete_message(&record, "All set<TASK_DONE>", MessageStatus::Completed)
            .await
            .unwrap();

        let stored = store
            .records()
            .into_iter()
            .find(|r| r.id == record.id)
            .unwrap();
        assert_eq!(stored.content, "All set");
    }

    #[tokio::test]
    async fn test_subtask_id_tags_blocks() {
        let (task, _store, sink) = task_ref(None);
        let scoped = task.with_subtask_id(3);

        scoped
            .create_message(ContentBlockKind::SubtaskStart, json!("begin"), "Planner")
            .await
            .unwrap();

        let blocks: Vec<ContentBlock> =
            serde_json::from_str(&sink.records()[0].content).unwrap();
        assert_eq!(blocks[0].subtask_id, Some(3));
    }

    #[tokio::test]
    async fn test_task_message_payload_completion() {
        let (task, store, _sink) = task_ref(None);

        let action = StudioAction::new("summary", "Publish summary", json!({}));
        let record = task
            .create_task_message(&action, MessageStatus::Pending)
            .await
            .unwrap();
        task.complete_task_message(&record, "final payload")
            .await
            .unwrap();

        let tasks = store.tasks();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].payload, "final payload");
    }
}
