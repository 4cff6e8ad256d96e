//! Top-level orchestration entry: wires the boundary collaborators into an
//! [`AgentTaskRef`], runs the coordinator and settles the turn record.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use troupe_core::{
    AgentTaskRef, Error, MessageStatus, MessageStore, ModelResolver, RecordSink, Studio,
    ToolRegistry, TurnAggregator, UsageTracker,
};

use crate::coordinator::CoordinateRolePlayAgent;
use crate::events::EventBus;

/// Result of one orchestration run.
#[derive(Debug)]
pub struct TaskOutcome {
    /// Final accumulated content, absent when cancellation stopped the run
    /// before any turn completed.
    pub content: Option<String>,
    /// Id of the persisted turn record, absent when nothing was written.
    pub record_id: Option<String>,
}

/// Long-lived handle owning the boundary collaborators. One orchestrator can
/// serve many conversations; each run gets its own coordinator, agent
/// histories and block accumulator.
pub struct Orchestrator {
    store: Arc<dyn MessageStore>,
    sink: Arc<dyn RecordSink>,
    studio: Arc<dyn Studio>,
    resolver: Arc<dyn ModelResolver>,
    usage: Arc<UsageTracker>,
    tools: ToolRegistry,
    events: EventBus,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn MessageStore>,
        sink: Arc<dyn RecordSink>,
        studio: Arc<dyn Studio>,
        resolver: Arc<dyn ModelResolver>,
    ) -> Self {
        Self {
            store,
            sink,
            studio,
            resolver,
            usage: Arc::new(UsageTracker::new()),
            tools: ToolRegistry::new(),
            events: EventBus::default(),
        }
    }

    /// Tools made available to the nested dialogue and task agents.
    pub fn with_tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
        self
    }

    /// Share an external event bus instead of the internal default.
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn usage(&self) -> &Arc<UsageTracker> {
        &self.usage
    }

    /// Run one task to completion. The shared turn record is marked
    /// COMPLETED on success and FAILED on error; cancellation surfaces as
    /// [`Error::Cancelled`] without forcing a failure status onto the record.
    pub async fn run_task(
        &self,
        conversation_id: &str,
        task_text: &str,
        ui_message_id: Option<&str>,
        cancel: CancellationToken,
    ) -> Result<TaskOutcome, Error> {
        let aggregator = Arc::new(TurnAggregator::new(
            self.store.clone(),
            self.sink.clone(),
            conversation_id,
            None,
        ));
        let mut task = AgentTaskRef::new(
            conversation_id,
            cancel,
            self.studio.clone(),
            aggregator.clone(),
        );
        if let Some(id) = ui_message_id {
            task = task.with_ui_message_id(id);
        }

        let mut coordinator = CoordinateRolePlayAgent::new(
            self.resolver.clone(),
            self.usage.clone(),
            self.tools.clone(),
            self.events.clone(),
        )?;

        info!(conversation = conversation_id, "starting orchestration run");
        match coordinator.play(task_text, &task).await {
            Ok(Some(completion)) => {
                let content = completion.full_content().await?;
                aggregator.complete_shared(MessageStatus::Completed).await?;
                info!(conversation = conversation_id, "orchestration run completed");
                Ok(TaskOutcome {
                    content: Some(content),
                    record_id: aggregator.record_id(),
                })
            }
            Ok(None) => {
                info!(
                    conversation = conversation_id,
                    "orchestration run stopped before any turn completed"
                );
                Ok(TaskOutcome {
                    content: None,
                    record_id: aggregator.record_id(),
                })
            }
            Err(err) if err.is_cancelled() => Err(err),
            Err(err) => {
                error!(conversation = conversation_id, error = %err, "orchestration run failed");
                aggregator.complete_shared(MessageStatus::Failed).await?;
                Err(err)
            }
        }
    }
}
