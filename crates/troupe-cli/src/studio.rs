//! Studio implementation backing agent actions in the CLI.

use async_trait::async_trait;
use futures::StreamExt;
use tracing::debug;

use troupe_core::{AgentTaskRef, Error, MessageStatus, StreamingCompletion, Studio, StudioAction};

/// Studio that persists actions as task-backed records. Streamed actions keep
/// the record's task payload current so the renderer can follow along; the
/// console itself is driven entirely by the record sink.
pub struct ConsoleStudio;

#[async_trait]
impl Studio for ConsoleStudio {
    fn preview(&self, action: &StudioAction) -> String {
        debug!(kind = %action.kind, description = %action.description, "studio preview");
        format!("{}: {}", action.kind, action.description)
    }

    async fn start(&self, action: StudioAction, task: &AgentTaskRef) -> Result<(), Error> {
        self.preview(&action);
        task.create_task_message(&action, MessageStatus::Completed)
            .await?;
        Ok(())
    }

    async fn start_with_stream(
        &self,
        action: StudioAction,
        completion: &StreamingCompletion,
        task: &AgentTaskRef,
    ) -> Result<(), Error> {
        let record = task
            .create_task_message(&action, MessageStatus::Pending)
            .await?;

        let mut fragments = completion.incremental_content();
        let mut payload = String::new();
        while let Some(item) = fragments.next().await {
            match item {
                Ok(fragment) => {
                    payload.push_str(&fragment);
                    let mut snapshot = record.clone();
                    if let Some(task_record) = snapshot.task.as_mut() {
                        task_record.payload = payload.clone();
                    }
                    task.publish(&snapshot);
                }
                Err(_) => {
                    // The caller surfaces the stream error; the record just
                    // keeps whatever arrived before it.
                    task.complete_message(&record, &payload, MessageStatus::Failed)
                        .await?;
                    return Ok(());
                }
            }
        }

        task.complete_task_message(&record, &payload).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    use troupe_core::testing::{CollectingSink, MemoryStore, MockProvider, RecordingStudio};
    use troupe_core::{CompletionRequest, Provider, StreamChunk, TurnAggregator};

    fn task_ref() -> (AgentTaskRef, Arc<MemoryStore>, Arc<CollectingSink>) {
        let store = Arc::new(MemoryStore::new());
        let sink = Arc::new(CollectingSink::new());
        let aggregator = Arc::new(TurnAggregator::new(
            store.clone(),
            sink.clone(),
            "conv-1",
            None,
        ));
        let task = AgentTaskRef::new(
            "conv-1",
            CancellationToken::new(),
            Arc::new(RecordingStudio::new()),
            aggregator,
        );
        (task, store, sink)
    }

    async fn completion_from(provider: &MockProvider) -> StreamingCompletion {
        let stream = provider.stream(CompletionRequest::new(vec![])).await.unwrap();
        StreamingCompletion::new(stream, CancellationToken::new())
    }

    #[tokio::test]
    async fn test_start_persists_a_completed_action_record() {
        let (task, store, _sink) = task_ref();
        let action = StudioAction::new("report", "Render report", json!({"title": "t"}));

        ConsoleStudio.start(action, &task).await.unwrap();

        let records = store.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, MessageStatus::Completed);
        assert_eq!(records[0].role_label, "Tool");
        let tasks = store.tasks();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].kind, "report");
    }

    #[tokio::test]
    async fn test_streamed_action_publishes_growing_payload() {
        let (task, store, sink) = task_ref();
        let provider = MockProvider::new();
        provider.queue_chunks(vec![
            Ok(StreamChunk::Delta {
                content: "The".to_string(),
            }),
            Ok(StreamChunk::Delta {
                content: " end.".to_string(),
            }),
            Ok(StreamChunk::Done { usage: None }),
        ]);
        let completion = completion_from(&provider).await;

        ConsoleStudio
            .start_with_stream(
                StudioAction::new("editor", "Final Task Summary", json!("")),
                &completion,
                &task,
            )
            .await
            .unwrap();

        // Pending record, one snapshot per fragment, then completion.
        assert_eq!(sink.publish_count(), 4);
        let published = sink.records();
        assert_eq!(published[2].task.as_ref().unwrap().payload, "The end.");

        assert_eq!(store.tasks()[0].payload, "The end.");
        assert_eq!(store.records()[0].status, MessageStatus::Completed);
    }

    #[tokio::test]
    async fn test_failed_stream_marks_the_record_failed() {
        let (task, store, _sink) = task_ref();
        let provider = MockProvider::new();
        provider.queue_error(Error::api(500, "upstream gone"));
        let completion = completion_from(&provider).await;

        ConsoleStudio
            .start_with_stream(
                StudioAction::new("editor", "Summary", json!("")),
                &completion,
                &task,
            )
            .await
            .unwrap();

        assert_eq!(store.records()[0].status, MessageStatus::Failed);
    }
}
