//! In-memory persistence for one CLI run.

use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use troupe_core::{Error, MessageRecord, MessageStatus, MessageStore, NewMessage, TaskRecord};

#[derive(Default)]
struct Tables {
    messages: Vec<MessageRecord>,
    tasks: Vec<TaskRecord>,
    next_id: u64,
}

/// Session-scoped message store. Records live only as long as the process;
/// the console renderer is the durable output.
#[derive(Default)]
pub struct SessionStore {
    tables: Mutex<Tables>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[cfg(test)]
    fn records(&self) -> Vec<MessageRecord> {
        self.lock_tables().messages.clone()
    }

    #[cfg(test)]
    fn stored_tasks(&self) -> Vec<TaskRecord> {
        self.lock_tables().tasks.clone()
    }
}

#[async_trait]
impl MessageStore for SessionStore {
    async fn create_message(&self, message: NewMessage) -> Result<MessageRecord, Error> {
        let mut tables = self.lock_tables();
        tables.next_id += 1;
        let record = MessageRecord {
            id: format!("msg-{}", tables.next_id),
            conversation_id: message.conversation_id,
            content: message.content,
            role: message.role,
            status: message.status,
            role_label: message.role_label,
            task: message.task,
            block: None,
        };
        tables.messages.push(record.clone());
        Ok(record)
    }

    async fn update_message(
        &self,
        id: &str,
        content: &str,
        status: MessageStatus,
    ) -> Result<(), Error> {
        let mut tables = self.lock_tables();
        let record = tables
            .messages
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
        let mut tables = self.lock_tables();
        tables.next_id += 1;
        let task = TaskRecord {
            id: format!("task-{}", tables.next_id),
            kind: kind.to_string(),
            description: description.to_string(),
            payload: payload.to_string(),
        };
        tables.tasks.push(task.clone());
        Ok(task)
    }

    async fn update_task(&self, id: &str, payload: &str) -> Result<(), Error> {
        let mut tables = self.lock_tables();
        let task = tables
            .tasks
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| Error::storage(format!("no task with id {}", id)))?;
        task.payload = payload.to_string();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use troupe_core::Role;

    fn new_message(content: &str) -> NewMessage {
        NewMessage {
            conversation_id: "conv-1".to_string(),
            content: content.to_string(),
            role: Role::Assistant,
            status: MessageStatus::Pending,
            role_label: "Assistant".to_string(),
            task: None,
        }
    }

    #[tokio::test]
    async fn test_create_and_update_message() {
        let store = SessionStore::new();
        let record = store.create_message(new_message("draft")).await.unwrap();
        store
            .update_message(&record.id, "final", MessageStatus::Completed)
            .await
            .unwrap();

        let records = store.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].content, "final");
        assert_eq!(records[0].status, MessageStatus::Completed);
    }

    #[tokio::test]
    async fn test_ids_are_unique_across_tables() {
        let store = SessionStore::new();
        let record = store.create_message(new_message("")).await.unwrap();
        let task = store.create_task("editor", "Plan", "").await.unwrap();

        assert_eq!(record.id, "msg-1");
        assert_eq!(task.id, "task-2");
    }

    #[tokio::test]
    async fn test_update_unknown_id_errors() {
        let store = SessionStore::new();
        assert!(store
            .update_message("msg-9", "x", MessageStatus::Completed)
            .await
            .is_err());
        assert!(store.update_task("task-9", "x").await.is_err());
    }

    #[tokio::test]
    async fn test_task_payload_update() {
        let store = SessionStore::new();
        let task = store.create_task("editor", "Plan", "").await.unwrap();
        store.update_task(&task.id, "1. step").await.unwrap();

        assert_eq!(store.stored_tasks()[0].payload, "1. step");
    }
}
