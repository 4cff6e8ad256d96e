use futures::StreamExt;
use serde_json::json;

use troupe_core::{
    AgentTaskRef, ContentBlockKind, Error, MessageStatus, StreamingCompletion,
};

/// Mirror a completion's running content into a fresh content block on the
/// turn record, republishing after every chunk. A failed stream leaves the
/// partial text in place and marks the record FAILED; the stream error itself
/// is surfaced to the caller through `full_content`, not from here.
pub(crate) async fn stream_into_block(
    task: &AgentTaskRef,
    completion: &StreamingCompletion,
    kind: ContentBlockKind,
    role_label: &str,
    collapse: bool,
) -> Result<(), Error> {
    let record = task.create_message(kind, json!(""), role_label).await?;
    let mut chunks = completion.running_content();
    while let Some(item) = chunks.next().await {
        match item {
            Ok(content) => task.update_message(&record, json!(content))?,
            Err(_) => {
                task.complete_message(&record, "", MessageStatus::Failed)
                    .await?;
                return Ok(());
            }
        }
    }
    task.complete_message(&record, "", MessageStatus::Completed)
        .await?;
    if collapse {
        task.mark_collapsible(&record)?;
    }
    Ok(())
}
