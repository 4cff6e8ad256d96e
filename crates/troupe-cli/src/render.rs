//! Console rendering of orchestrator events.
//!
//! The bus carries whole-record snapshots, so the renderer tracks how much of
//! each record it has already written and only emits the new tail.

use std::collections::HashMap;
use std::io::Write;

use serde_json::Value;
use tokio::sync::broadcast;
use tracing::debug;

use troupe_agents::OrchestratorEvent;
use troupe_core::{ContentBlock, ContentBlockKind, MessageRecord, MessageStatus};

#[derive(Default)]
struct RecordProgress {
    /// Index of the block currently being written.
    index: usize,
    /// Characters of that block's string content already written.
    written: usize,
    started: bool,
    closed: bool,
    /// Last task payload written (task-backed records only).
    payload: String,
}

/// Stateful translation of record snapshots into terminal output.
pub struct Renderer {
    progress: HashMap<String, RecordProgress>,
}

impl Default for Renderer {
    fn default() -> Self {
        Self::new()
    }
}

impl Renderer {
    pub fn new() -> Self {
        Self {
            progress: HashMap::new(),
        }
    }

    /// Translate one event into output fragments, in print order.
    pub fn handle(&mut self, event: &OrchestratorEvent) -> Vec<String> {
        match event {
            OrchestratorEvent::RecordUpdated { record } => self.handle_record(record),
            OrchestratorEvent::TokenUsage { usage, .. } => {
                vec![format!(
                    "[tokens] prompt {} completion {} total {}\n",
                    usage.prompt_tokens, usage.completion_tokens, usage.total_tokens
                )]
            }
        }
    }

    fn handle_record(&mut self, record: &MessageRecord) -> Vec<String> {
        if record.task.is_some() {
            return self.handle_task_record(record);
        }

        let blocks: Vec<ContentBlock> = match serde_json::from_str(&record.content) {
            Ok(blocks) => blocks,
            Err(e) => {
                debug!(record = %record.id, error = %e, "record content is not a block list");
                return Vec::new();
            }
        };
        let progress = self.progress.entry(record.id.clone()).or_default();

        let mut out = Vec::new();
        loop {
            let Some(block) = blocks.get(progress.index) else {
                break;
            };
            if !progress.started {
                out.extend(open_block(block));
                progress.started = true;
            }
            if let Value::String(content) = &block.content {
                if content.len() > progress.written {
                    out.push(content[progress.written..].to_string());
                    progress.written = content.len();
                }
            }
            if progress.index + 1 >= blocks.len() {
                break;
            }
            out.extend(close_block(block, progress.written));
            progress.index += 1;
            progress.written = 0;
            progress.started = false;
        }

        // Completion snapshots carry no block index; close the last block.
        if record.block.is_none() {
            if let Some(block) = blocks.get(progress.index) {
                if progress.started {
                    out.extend(close_block(block, progress.written));
                    progress.index += 1;
                    progress.written = 0;
                    progress.started = false;
                }
            }
            if record.status == MessageStatus::Failed {
                out.push("[turn failed]\n".to_string());
            }
        }
        out
    }

    fn handle_task_record(&mut self, record: &MessageRecord) -> Vec<String> {
        let Some(task) = &record.task else {
            return Vec::new();
        };
        let progress = self.progress.entry(record.id.clone()).or_default();

        let mut out = Vec::new();
        if !progress.started {
            out.push(format!("\n[{}] {}\n", task.kind, task.description));
            progress.started = true;
            // The initial payload is the action's encoded parameters, not
            // streamed content; skip it.
            progress.payload = task.payload.clone();
            return out;
        }

        if task.payload != progress.payload {
            match task.payload.strip_prefix(progress.payload.as_str()) {
                Some(delta) => out.push(delta.to_string()),
                None => out.push(format!("\n{}", task.payload)),
            }
            progress.written += 1;
            progress.payload = task.payload.clone();
        }
        if record.status != MessageStatus::Pending && !progress.closed {
            if progress.written > 0 {
                out.push("\n".to_string());
            }
            progress.closed = true;
        }
        out
    }
}

fn open_block(block: &ContentBlock) -> Vec<String> {
    match block.kind {
        ContentBlockKind::Text
        | ContentBlockKind::UserAgent
        | ContentBlockKind::AssistantAgent
        | ContentBlockKind::Coordinate
        | ContentBlockKind::FinalResult
        | ContentBlockKind::HtmlReport => {
            vec![format!("\n[{}]\n", block.role_label)]
        }
        ContentBlockKind::PlanSteps => {
            let mut out = vec![format!("\n[{}]\n", block.role_label)];
            if let Value::Array(steps) = &block.content {
                for (index, step) in steps.iter().enumerate() {
                    out.push(format!("  {}. {}\n", index + 1, text_of(step)));
                }
            }
            out
        }
        ContentBlockKind::SubtaskStart => {
            vec![format!(
                "\n[subtask {}/{}] {}\n",
                field(&block.content, "subtask_id"),
                field(&block.content, "total_subtasks"),
                field(&block.content, "description"),
            )]
        }
        ContentBlockKind::SubtaskComplete => {
            vec![format!(
                "[subtask {}] validated\n",
                field(&block.content, "subtask_id")
            )]
        }
        ContentBlockKind::SubtaskFailed => {
            vec![format!(
                "[subtask {}] failed validation\n",
                field(&block.content, "subtask_id")
            )]
        }
        ContentBlockKind::ToolCall => {
            vec![format!(
                "[tool] {} calls {}\n",
                field(&block.content, "agent"),
                field(&block.content, "tool"),
            )]
        }
        ContentBlockKind::ToolMessage => {
            if field(&block.content, "status") == "failed" {
                vec![format!(
                    "[tool] {} failed: {}\n",
                    field(&block.content, "tool"),
                    field(&block.content, "error"),
                )]
            } else {
                vec![format!("[tool] {} completed\n", field(&block.content, "tool"))]
            }
        }
        ContentBlockKind::Task => {
            vec![format!("\n{}\n", field(&block.content, "message"))]
        }
    }
}

/// Newline terminating a block whose raw content was streamed to the
/// terminal. Structured blocks already end their lines themselves.
fn close_block(block: &ContentBlock, written: usize) -> Vec<String> {
    let streams_raw = matches!(
        block.kind,
        ContentBlockKind::Text
            | ContentBlockKind::UserAgent
            | ContentBlockKind::AssistantAgent
            | ContentBlockKind::Coordinate
            | ContentBlockKind::FinalResult
    );
    if streams_raw && written > 0 {
        vec!["\n".to_string()]
    } else {
        Vec::new()
    }
}

fn field(content: &Value, name: &str) -> String {
    match content.get(name) {
        Some(Value::String(s)) => s.clone(),
        Some(value) => value.to_string(),
        None => String::new(),
    }
}

fn text_of(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Drain the event bus onto stdout until every sender is gone.
pub async fn run(mut events: broadcast::Receiver<OrchestratorEvent>) {
    let mut renderer = Renderer::new();
    let mut stdout = std::io::stdout();
    loop {
        match events.recv().await {
            Ok(event) => {
                for fragment in renderer.handle(&event) {
                    let _ = stdout.write_all(fragment.as_bytes());
                }
                let _ = stdout.flush();
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(skipped, "renderer fell behind the event bus");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
