//! Coordinator that resolves one task by delegating to the dialogue or the
//! task-oriented tool, whichever the model picks.

use std::sync::Arc;

use chrono::Utc;
use tracing::debug;

use troupe_core::{
    AgentTaskRef, ContentBlockKind, Error, Message, ModelKind, ModelResolver,
    StreamingCompletion, ToolRegistry, UsageTracker,
};

use crate::blocks::stream_into_block;
use crate::conversation::ConversationAgent;
use crate::dialogue::{DialogueAgent, TASK_DONE};
use crate::events::{EventBus, OrchestratorEvent};
use crate::prompts;
use crate::task_oriented::TaskOrientedAgent;

/// Zero-temperature coordinator holding exactly two tools. It never solves
/// the task itself; each turn either delegates through a tool call or
/// declares the task done.
pub struct CoordinateRolePlayAgent {
    agent: ConversationAgent,
    events: EventBus,
}

impl CoordinateRolePlayAgent {
    pub fn new(
        resolver: Arc<dyn ModelResolver>,
        usage: Arc<UsageTracker>,
        tools: ToolRegistry,
        events: EventBus,
    ) -> Result<Self, Error> {
        let mut delegates = ToolRegistry::new();
        delegates.register(Arc::new(DialogueAgent::new(
            resolver.clone(),
            usage.clone(),
            tools.clone(),
        )?));
        delegates.register(Arc::new(TaskOrientedAgent::new(
            resolver.clone(),
            usage.clone(),
            tools,
        )?));
        let agent = ConversationAgent::new("Coordinate Agent", resolver, usage)
            .with_temperature(0.0)
            .with_tools(delegates)?;
        Ok(Self { agent, events })
    }

    /// Drive the coordination loop for one task. Each turn's accumulated
    /// content is published as a coordinate block; a turn containing the
    /// termination sentinel triggers one final answer turn.
    ///
    /// Returns the last completion, or `None` when cancellation stopped the
    /// loop before the most recent turn could dispatch.
    pub async fn play(
        &mut self,
        task_text: &str,
        task: &AgentTaskRef,
    ) -> Result<Option<StreamingCompletion>, Error> {
        self.agent
            .initial_system_message(prompts::coordinating_prompt(task_text));

        let mut message = prompts::start_coordinating_runner_prompt().to_string();
        let mut last;

        loop {
            last = self
                .agent
                .run(Message::user(message.as_str()), task, None, ModelKind::Text)
                .await?;
            let Some(completion) = last.as_ref() else {
                break;
            };
            let content = self.observe_turn(completion, task).await?;

            if content.to_uppercase().contains(TASK_DONE) {
                debug!("coordinator declared the task done, requesting final answer");
                message = format!("{content}{}", prompts::final_answer_prompt(task_text));
                last = self
                    .agent
                    .run(Message::user(message.as_str()), task, None, ModelKind::Text)
                    .await?;
                if let Some(final_completion) = last.as_ref() {
                    self.observe_turn(final_completion, task).await?;
                }
                break;
            }

            message = format!(
                "{content}{}",
                prompts::coordinating_next_instruction_prompt()
            );
        }

        Ok(last)
    }

    /// Publish one turn as a coordinate block, then emit a usage event once
    /// the completion reports nonzero token usage.
    async fn observe_turn(
        &self,
        completion: &StreamingCompletion,
        task: &AgentTaskRef,
    ) -> Result<String, Error> {
        stream_into_block(
            task,
            completion,
            ContentBlockKind::Coordinate,
            "Coordinate Agent",
            false,
        )
        .await?;
        let content = completion.full_content().await?;

        if let Some(usage) = completion.usage() {
            if usage.total_tokens > 0 {
                if let Some(message_id) = task.turn_message_id() {
                    self.events.publish(OrchestratorEvent::TokenUsage {
                        conversation_id: task.conversation_id().to_string(),
                        message_id,
                        usage,
                        timestamp: Utc::now().timestamp_millis(),
                    });
                }
            }
        }

        Ok(content)
    }
}
