//! Dialogue tool: a role-played user agent instructs a tool-wielding
//! assistant agent until the user side declares the task done.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;

use troupe_core::{
    AgentTaskRef, ContentBlockKind, Error, Message, ModelKind, ModelResolver, PropertySchema,
    Tool, ToolParameters, ToolRegistry, UsageTracker,
};

use crate::blocks::stream_into_block;
use crate::conversation::ConversationAgent;
use crate::prompts;

/// Sentinel the user side emits once it considers the task solved.
pub const TASK_DONE: &str = "TASK_DONE";

/// Rounds a dialogue may run before giving up.
pub const MAX_ITERATIONS: usize = 30;

const ABORTED: &str = "The task has been aborted.";

#[derive(Debug, Deserialize)]
struct DialogueQuery {
    question: String,
    expected_result: String,
    #[serde(default)]
    context: Option<String>,
}

/// Two [`ConversationAgent`]s in conversation with each other. The user side
/// breaks the task into instructions, the assistant side executes them with
/// the full tool registry. Exposed as a tool so a coordinator can delegate
/// whole tasks to it.
pub struct DialogueAgent {
    user_agent: Mutex<ConversationAgent>,
    assistant_agent: Mutex<ConversationAgent>,
    tool_summaries: Vec<String>,
    preamble: Option<String>,
}

impl DialogueAgent {
    pub fn new(
        resolver: Arc<dyn ModelResolver>,
        usage: Arc<UsageTracker>,
        tools: ToolRegistry,
    ) -> Result<Self, Error> {
        let tool_summaries = tools
            .definitions()
            .iter()
            .map(|def| format!("{}: {}", def.name, def.description))
            .collect();
        let user_agent =
            ConversationAgent::new("User Agent", resolver.clone(), usage.clone())
                .with_temperature(0.3);
        let assistant_agent = ConversationAgent::new("Assistant Agent", resolver, usage)
            .with_temperature(0.0)
            .with_tools(tools)?;
        Ok(Self {
            user_agent: Mutex::new(user_agent),
            assistant_agent: Mutex::new(assistant_agent),
            tool_summaries,
            preamble: None,
        })
    }

    /// Prepend a role preamble to the assistant side's system prompt. Used
    /// when the dialogue acts as a subtask executor.
    pub fn with_system_preamble(mut self, preamble: impl Into<String>) -> Self {
        self.preamble = Some(preamble.into());
        self
    }
}

#[async_trait]
impl Tool for DialogueAgent {
    fn name(&self) -> &str {
        "dialogue-assistant"
    }

    fn description(&self) -> &str {
        "A dialogue assistant that can help you with your questions."
    }

    fn parameters(&self) -> ToolParameters {
        ToolParameters::new()
            .add_property(
                "question",
                PropertySchema::string("The question to ask the assistant."),
                true,
            )
            .add_property(
                "expected_result",
                PropertySchema::string("The expected result of the question."),
                true,
            )
            .add_property(
                "context",
                PropertySchema::string("The context of the question."),
                false,
            )
    }

    async fn execute(&self, arguments: Value, task: &AgentTaskRef) -> Result<String, Error> {
        let query: DialogueQuery = serde_json::from_value(arguments)?;
        let mut user_agent = self.user_agent.lock().await;
        let mut assistant_agent = self.assistant_agent.lock().await;

        let mut assistant_system = prompts::assistant_prompt(
            &query.question,
            &query.expected_result,
            query.context.as_deref(),
        );
        if let Some(preamble) = &self.preamble {
            assistant_system = format!("{preamble}\n\n{assistant_system}");
        }
        assistant_agent.initial_system_message(assistant_system);
        user_agent.initial_system_message(prompts::user_prompt(
            &query.question,
            &self.tool_summaries,
            query.context.as_deref(),
        ));

        let mut message = prompts::start_runner_prompt().to_string();
        for round in 0..MAX_ITERATIONS {
            if task.is_cancelled() {
                return Ok(ABORTED.to_string());
            }
            let Some(outcome) = discuss_round(
                &mut user_agent,
                &mut assistant_agent,
                &message,
                task,
                &query.question,
            )
            .await?
            else {
                continue;
            };
            if outcome.done {
                debug!(round, "dialogue converged");
                return Ok(outcome.assistant_content);
            }
            message = outcome.assistant_content;
        }

        debug!("dialogue hit the iteration cap without converging");
        Ok(String::new())
    }
}

struct RoundOutcome {
    assistant_content: String,
    done: bool,
}

/// One instruct-then-solve exchange. Returns `None` when either side's run
/// was cancelled before dispatch.
async fn discuss_round(
    user_agent: &mut ConversationAgent,
    assistant_agent: &mut ConversationAgent,
    message: &str,
    task: &AgentTaskRef,
    question: &str,
) -> Result<Option<RoundOutcome>, Error> {
    let Some(user_completion) = user_agent
        .run(Message::user(message), task, None, ModelKind::Text)
        .await?
    else {
        return Ok(None);
    };
    stream_into_block(
        task,
        &user_completion,
        ContentBlockKind::UserAgent,
        user_agent.name(),
        true,
    )
    .await?;
    let mut user_content = user_completion.full_content().await?;

    let done = user_content.to_uppercase().contains(TASK_DONE);
    if done {
        user_content.push_str(&prompts::final_answer_prompt(question));
    } else {
        user_content.push_str(&prompts::auxiliary_information_prompt(question));
    }

    let Some(assistant_completion) = assistant_agent
        .run(Message::user(user_content.as_str()), task, None, ModelKind::Text)
        .await?
    else {
        return Ok(None);
    };
    stream_into_block(
        task,
        &assistant_completion,
        ContentBlockKind::AssistantAgent,
        assistant_agent.name(),
        true,
    )
    .await?;
    let mut assistant_content = assistant_completion.full_content().await?;

    if !done {
        assistant_content = prompts::next_instruction_prompt(&assistant_content);
    }

    Ok(Some(RoundOutcome {
        assistant_content,
        done,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    use troupe_core::testing::{
        CollectingSink, MemoryStore, MockProvider, RecordingStudio, StaticResolver,
    };
    use troupe_core::TurnAggregator;

    fn task_ref(cancel: CancellationToken) -> (AgentTaskRef, Arc<MemoryStore>, Arc<CollectingSink>)
    {
        let store = Arc::new(MemoryStore::new());
        let sink = Arc::new(CollectingSink::new());
        let aggregator = Arc::new(TurnAggregator::new(store.clone(), sink.clone(), "conv-1", None));
        let task = AgentTaskRef::new("conv-1", cancel, Arc::new(RecordingStudio::new()), aggregator);
        (task, store, sink)
    }

    fn dialogue_with(provider: Arc<MockProvider>) -> DialogueAgent {
        let resolver = Arc::new(StaticResolver::new(provider, "mock-model", true));
        DialogueAgent::new(resolver, Arc::new(UsageTracker::new()), ToolRegistry::new())
            .unwrap()
    }

    fn query() -> Value {
        json!({
            "question": "What is 2 + 2?",
            "expected_result": "A single number."
        })
    }

    #[tokio::test]
    async fn test_dialogue_converges_on_sentinel() {
        let provider = Arc::new(MockProvider::new());
        provider.queue_text("<TASK_DONE>");
        provider.queue_text("The answer is 4.");
        let agent = dialogue_with(provider.clone());
        let (task, _store, sink) = task_ref(CancellationToken::new());

        let result = agent.execute(query(), &task).await.unwrap();

        assert_eq!(result, "The answer is 4.");
        assert_eq!(provider.request_count(), 2);

        let records = sink.records();
        let last = records.last().unwrap();
        let blocks: Vec<troupe_core::ContentBlock> =
            serde_json::from_str(&last.content).unwrap();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].kind, ContentBlockKind::UserAgent);
        assert_eq!(blocks[1].kind, ContentBlockKind::AssistantAgent);
        assert!(blocks.iter().all(|b| b.auto_collapse == Some(true)));
    }

    #[tokio::test]
    async fn test_dialogue_feeds_solution_into_next_round() {
        let provider = Arc::new(MockProvider::new());
        provider.queue_text("Instructions: add the numbers. Expected Result: a sum.");
        provider.queue_text("Solution: the sum is 4.");
        provider.queue_text("<TASK_DONE>");
        provider.queue_text("The final answer is 4.");
        let agent = dialogue_with(provider.clone());
        let (task, _store, _sink) = task_ref(CancellationToken::new());

        let result = agent.execute(query(), &task).await.unwrap();

        assert_eq!(result, "The final answer is 4.");
        assert_eq!(provider.request_count(), 4);

        // Round two's user turn receives the assistant solution wrapped in a
        // next-instruction request.
        let requests = provider.requests();
        let user_round_two = &requests[2];
        let last = user_round_two.messages.last().unwrap();
        assert!(last.content.contains("Solution: the sum is 4."));
        assert!(last.content.contains("next instruction"));

        // The final assistant turn is asked for the final answer, not another
        // instruction.
        let assistant_final = &requests[3];
        let last = assistant_final.messages.last().unwrap();
        assert!(last.content.contains("final answer"));
        assert!(last.content.contains("<TASK_DONE>"));
    }

    #[tokio::test]
    async fn test_cancelled_dialogue_reports_abort() {
        let provider = Arc::new(MockProvider::new());
        let agent = dialogue_with(provider.clone());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let (task, _store, _sink) = task_ref(cancel);

        let result = agent.execute(query(), &task).await.unwrap();

        assert_eq!(result, "The task has been aborted.");
        assert_eq!(provider.request_count(), 0);
    }

    #[tokio::test]
    async fn test_iteration_cap_returns_empty() {
        let provider = Arc::new(MockProvider::new());
        for _ in 0..MAX_ITERATIONS {
            provider.queue_text("Instructions: keep going.");
            provider.queue_text("Solution: partial progress.");
        }
        let agent = dialogue_with(provider.clone());
        let (task, _store, _sink) = task_ref(CancellationToken::new());

        let result = agent.execute(query(), &task).await.unwrap();

        assert_eq!(result, "");
        assert_eq!(provider.request_count(), MAX_ITERATIONS * 2);
    }

    #[tokio::test]
    async fn test_tool_summaries_reach_user_prompt() {
        let provider = Arc::new(MockProvider::new());
        provider.queue_text("<TASK_DONE>");
        provider.queue_text("Done.");
        let resolver = Arc::new(StaticResolver::new(provider.clone(), "mock-model", true));

        struct Search;
        #[async_trait]
        impl Tool for Search {
            fn name(&self) -> &str {
                "search"
            }
            fn description(&self) -> &str {
                "Search the web."
            }
            fn parameters(&self) -> ToolParameters {
                ToolParameters::new()
            }
            async fn execute(&self, _: Value, _: &AgentTaskRef) -> Result<String, Error> {
                Ok(String::new())
            }
        }
        let mut tools = ToolRegistry::new();
        tools.register(Arc::new(Search));

        let agent = DialogueAgent::new(resolver, Arc::new(UsageTracker::new()), tools).unwrap();
        let (task, _store, _sink) = task_ref(CancellationToken::new());
        agent.execute(query(), &task).await.unwrap();

        let first = &provider.requests()[0];
        let system = &first.messages[0];
        assert!(system.content.contains("search: Search the web."));
    }
}
