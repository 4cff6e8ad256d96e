//! Task-oriented tool: plans subtasks, runs each through a fresh dialogue,
//! validates the results and summarizes the outcome.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

use troupe_core::{
    AgentTaskRef, ContentBlockKind, Error, Message, MessageStatus, ModelKind, ModelResolver,
    PropertySchema, StudioAction, Tool, ToolParameters, ToolRegistry, UsageTracker,
};

use crate::blocks::stream_into_block;
use crate::conversation::ConversationAgent;
use crate::dialogue::DialogueAgent;
use crate::plan::{parse_subtasks, SubTask};
use crate::prompts;

/// Upper bound on subtasks a plan may contain.
pub const MAX_SUBTASKS: usize = 7;

/// Execution attempts per subtask before it is marked failed.
pub const MAX_ATTEMPTS: usize = 3;

const ABORTED: &str = "Task has been aborted.";

#[derive(Debug, Deserialize)]
struct TaskQuery {
    task: String,
    expected_result: String,
}

/// Planner, per-subtask executor dialogues and a validator working through a
/// task plan in list order. Failed subtasks are recorded and skipped, never
/// fatal; the summary flags incomplete coverage instead.
pub struct TaskOrientedAgent {
    resolver: Arc<dyn ModelResolver>,
    usage: Arc<UsageTracker>,
    tools: ToolRegistry,
    planner: Mutex<ConversationAgent>,
    validator: Mutex<ConversationAgent>,
}

impl TaskOrientedAgent {
    pub fn new(
        resolver: Arc<dyn ModelResolver>,
        usage: Arc<UsageTracker>,
        tools: ToolRegistry,
    ) -> Result<Self, Error> {
        let planner = ConversationAgent::new("Planner Agent", resolver.clone(), usage.clone())
            .with_temperature(0.2)
            .with_tools(tools.clone())?;
        let validator = ConversationAgent::new("Validator Agent", resolver.clone(), usage.clone())
            .with_temperature(0.1);
        Ok(Self {
            resolver,
            usage,
            tools,
            planner: Mutex::new(planner),
            validator: Mutex::new(validator),
        })
    }

    /// Ask the planner for a subtask breakdown and parse its reply. The raw
    /// plan is mirrored into an editor task record chunk by chunk so the UI
    /// can show it while it streams.
    async fn decompose(
        &self,
        planner: &mut ConversationAgent,
        main_task: &str,
        task: &AgentTaskRef,
    ) -> Result<Vec<SubTask>, Error> {
        let Some(completion) = planner
            .run(
                Message::user(decompose_prompt(main_task)),
                task,
                None,
                ModelKind::Text,
            )
            .await?
        else {
            return Ok(Vec::new());
        };

        let action = StudioAction::new("editor", "Task Planning", json!(""));
        let record = task
            .create_task_message(&action, MessageStatus::Pending)
            .await?;

        let mut chunks = completion.running_content();
        while let Some(item) = chunks.next().await {
            match item {
                Ok(content) => {
                    let mut snapshot = record.clone();
                    if let Some(plan_task) = snapshot.task.as_mut() {
                        plan_task.payload = content.clone();
                    }
                    task.publish(&snapshot);
                    task.studio()
                        .preview(&StudioAction::new("editor", "Task Planning", json!(content)));
                }
                Err(_) => break,
            }
        }

        let content = completion.full_content().await?;
        task.complete_task_message(&record, &content).await?;

        let subtasks = parse_subtasks(&content);
        if subtasks.is_empty() {
            warn!("planner reply yielded no subtasks");
            return Ok(subtasks);
        }

        let lines: Vec<String> = subtasks.iter().map(annotate).collect();
        let plan_block = task
            .create_message(ContentBlockKind::PlanSteps, json!(lines), "Task-Oriented-Agent")
            .await?;
        task.complete_message(&plan_block, "", MessageStatus::Completed)
            .await?;

        Ok(subtasks)
    }

    /// Run one subtask through a fresh dialogue executor with bounded
    /// validation retries. Mutates the subtask's completion state in place.
    async fn run_subtask(
        &self,
        subtasks: &mut [SubTask],
        index: usize,
        main_task: &str,
        validator: &mut ConversationAgent,
        task: &AgentTaskRef,
    ) -> Result<(), Error> {
        let total = subtasks.len();
        let completed = subtasks.iter().filter(|t| t.completed).count();
        task.create_message(
            ContentBlockKind::SubtaskStart,
            json!({
                "subtask_id": subtasks[index].id,
                "description": subtasks[index].description,
                "status": "running",
                "completed_subtasks": completed,
                "total_subtasks": total,
            }),
            "Task Manager",
        )
        .await?;

        let mut retry_reasons = String::new();
        for attempt in 1..=MAX_ATTEMPTS {
            // A fresh executor per attempt: system prompts are first-write-wins,
            // and the rebuilt question must reach the next attempt's dialogue.
            let executor =
                DialogueAgent::new(self.resolver.clone(), self.usage.clone(), self.tools.clone())?
                    .with_system_preamble(prompts::executor_system_prompt());
            let (question, context) = subtask_prompt(subtasks, index, main_task, &retry_reasons);
            let mut result = executor
                .execute(
                    json!({
                        "question": question,
                        "expected_result": "",
                        "context": context,
                    }),
                    task,
                )
                .await?;
            if result.is_empty() {
                result = "Execution failed, unable to obtain result.".to_string();
            }

            let (valid, reason) =
                validate_subtask(validator, &subtasks[index], &result, task).await?;
            subtasks[index].completed = valid;
            subtasks[index].result = Some(result.clone());
            retry_reasons.push_str(&format!("\n\n{reason}"));

            if valid {
                debug!(subtask = subtasks[index].id, attempt, "subtask validated");
                let completed = subtasks.iter().filter(|t| t.completed).count();
                task.create_message(
                    ContentBlockKind::SubtaskComplete,
                    json!({
                        "subtask_id": subtasks[index].id,
                        "description": subtasks[index].description,
                        "result": result,
                        "status": "completed",
                        "completed_subtasks": completed,
                        "total_subtasks": total,
                        "validated": true,
                    }),
                    "Task Manager",
                )
                .await?;
                return Ok(());
            }
        }

        warn!(
            subtask = subtasks[index].id,
            attempts = MAX_ATTEMPTS,
            "subtask failed validation, moving on"
        );
        let completed = subtasks.iter().filter(|t| t.completed).count();
        task.create_message(
            ContentBlockKind::SubtaskFailed,
            json!({
                "subtask_id": subtasks[index].id,
                "description": subtasks[index].description,
                "status": "failed",
                "completed_subtasks": completed,
                "total_subtasks": total,
                "validated": false,
            }),
            "Task Manager",
        )
        .await?;
        Ok(())
    }

    /// Ask the planner for a closing narrative over all subtask outcomes,
    /// streamed both as a content block and to the studio.
    async fn summarize(
        &self,
        planner: &mut ConversationAgent,
        query: &TaskQuery,
        subtasks: &[SubTask],
        task: &AgentTaskRef,
    ) -> Result<String, Error> {
        let completed = subtasks.iter().filter(|t| t.completed).count();
        let all_completed = completed == subtasks.len();

        task.create_message(
            ContentBlockKind::Task,
            json!({
                "message": "Generating task summary...",
                "completed_subtasks": completed,
                "total_subtasks": subtasks.len(),
                "complete": all_completed,
            }),
            "Task",
        )
        .await?;

        let Some(completion) = planner
            .run(
                Message::user(summary_prompt(query, subtasks, completed)),
                task,
                None,
                ModelKind::Text,
            )
            .await?
        else {
            error!("unable to generate final summary");
            return Ok("Unable to generate final summary.".to_string());
        };

        stream_into_block(task, &completion, ContentBlockKind::FinalResult, "Task", false).await?;

        task.studio()
            .start_with_stream(
                StudioAction::new("editor", "Final Task Summary", json!("")),
                &completion,
                task,
            )
            .await?;

        completion.full_content().await
    }
}

#[async_trait]
impl Tool for TaskOrientedAgent {
    fn name(&self) -> &str {
        "task-oriented-assistant"
    }

    fn description(&self) -> &str {
        "A task assistant that breaks a complex task into subtasks and completes them one by one."
    }

    fn parameters(&self) -> ToolParameters {
        ToolParameters::new()
            .add_property(
                "task",
                PropertySchema::string("The main task to be executed."),
                true,
            )
            .add_property(
                "expected_result",
                PropertySchema::string("The expected result of the task."),
                true,
            )
            .add_property(
                "context",
                PropertySchema::string("Additional context for the task."),
                false,
            )
    }

    async fn execute(&self, arguments: Value, task: &AgentTaskRef) -> Result<String, Error> {
        let query: TaskQuery = serde_json::from_value(arguments)?;
        let mut planner = self.planner.lock().await;
        let mut validator = self.validator.lock().await;

        planner.initial_system_message(prompts::planner_system_prompt(MAX_SUBTASKS));
        validator.initial_system_message(prompts::validator_system_prompt());

        if task.is_cancelled() {
            return Ok(ABORTED.to_string());
        }

        let mut subtasks = self.decompose(&mut planner, &query.task, task).await?;
        if subtasks.is_empty() {
            return Ok(
                "Unable to decompose the task, please provide a clearer task description."
                    .to_string(),
            );
        }

        // Subtasks run in the order the planner listed them; dependencies
        // only feed prompt context, they do not reorder execution.
        for index in 0..subtasks.len() {
            if task.is_cancelled() {
                return Ok(ABORTED.to_string());
            }
            self.run_subtask(&mut subtasks, index, &query.task, &mut validator, task)
                .await?;
        }

        self.summarize(&mut planner, &query, &subtasks, task).await
    }
}

/// Judge one execution result with the validator agent. A missing completion
/// counts as a rejection so the retry loop stays bounded.
async fn validate_subtask(
    validator: &mut ConversationAgent,
    subtask: &SubTask,
    result: &str,
    task: &AgentTaskRef,
) -> Result<(bool, String), Error> {
    let Some(completion) = validator
        .run(
            Message::user(validation_prompt(&subtask.description, result)),
            task,
            None,
            ModelKind::Text,
        )
        .await?
    else {
        return Ok((
            false,
            "Validation failed, unable to obtain result.".to_string(),
        ));
    };
    let content = completion.full_content().await?;
    let valid = content.to_lowercase().contains("validated: true");
    Ok((valid, content))
}

fn annotate(subtask: &SubTask) -> String {
    if subtask.dependencies.is_empty() {
        return subtask.description.clone();
    }
    let deps = subtask
        .dependencies
        .iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(", ");
    format!("{} (depends on: {})", subtask.description, deps)
}

fn decompose_prompt(task: &str) -> String {
    format!(
        "Break tasks into subtasks.\n\
         Generate subtasks as needed. It is not necessary to generate the maximum number of \
         subtasks every time.\n\
         The task to be broken down is:\n\
         {task}\n\
         For each subtask, please provide:\n\
         1. id: a unique number\n\
         2. description: clear description of what needs to be done\n\
         3. dependencies: an array of subtask IDs that this subtask depends on (or empty array \
         if none)\n\n\
         Please ensure that the task is not overly decomposed. Only create subtasks that are \
         necessary and meaningful.\n\n\
         Please identify dependencies between subtasks. For example, if a subtask needs the \
         results from previous subtasks, list those subtask IDs in its dependencies.\n\n\
         Output a list of subtasks in JSON format."
    )
}

/// Build the executor's question and context for one attempt. Dependency
/// results are embedded only for dependencies that already completed with a
/// result; anything else is skipped silently.
fn subtask_prompt(
    subtasks: &[SubTask],
    index: usize,
    main_task: &str,
    retry_reasons: &str,
) -> (String, String) {
    let current = &subtasks[index];
    let mut question = format!(
        "Please execute the following subtask: \n\n{}\n\n",
        current.description
    );
    if !retry_reasons.is_empty() {
        question.push_str(&format!(
            "The previous execution result did not pass the validation. The reason is:\n\
             {retry_reasons}\n\
             please retry it in a different way."
        ));
    }

    let mut dependency_results = String::new();
    if !current.dependencies.is_empty() {
        dependency_results.push_str("Previous subtask results you can reference:\n\n");
        for dep_id in &current.dependencies {
            let Some(dep) = subtasks.iter().find(|t| t.id == *dep_id) else {
                continue;
            };
            if dep.completed {
                if let Some(result) = &dep.result {
                    dependency_results.push_str(&format!(
                        "Subtask #{dep_id} ({}):\n{result}\n\n",
                        dep.description
                    ));
                }
            }
        }
    }

    let context = format!(
        "This is part of a larger task.\n\
         Main task: {main_task}\n\n\
         Current subtask #{}: {}\n\n\
         {dependency_results}\n\n\
         Note: Please only solve this specific subtask. Even if you see other information in \
         the context, limit your response to the scope of the current subtask. Do not attempt \
         to solve other subtasks or the overall task.",
        current.id, current.description
    );

    (question, context)
}

fn validation_prompt(description: &str, result: &str) -> String {
    format!(
        "Please strictly verify whether the execution result of the following subtask fully \
         meets the requirements:\n\n\
         Subtask: {description}\n\n\
         Execution result:\n\
         {result}\n\n\
         Verification criteria:\n\
         1. Whether the result fully addresses all the requirements described in the subtask.\n\
         2. If the subtask requires code implementation, whether the complete code is provided.\n\
         3. If the subtask requires calculation or analysis, whether the specific executable \
         result is provided.\n\n\
         Please briefly explain the reasons for verification and provide a clear verification \
         result at the end, with the word count not exceeding 140 characters.\n\
         Reply in the language of the subtask and execution result.\n\
         If all requirements are fully met, output \"VALIDATED: true\", otherwise output \
         \"VALIDATED: false\" and list the unmet requirements."
    )
}

fn summary_prompt(query: &TaskQuery, subtasks: &[SubTask], completed: usize) -> String {
    let mut prompt = format!(
        "Based on the following completed subtask results, please generate a final task \
         summary:\n\n\
         Main task: {}\n\n\
         Expected result: {}\n\n",
        query.task, query.expected_result
    );
    prompt.push_str(&format!(
        "Subtask completion status: {completed}/{}\n\n",
        subtasks.len()
    ));

    for subtask in subtasks {
        prompt.push_str(&format!("Subtask #{}: {}\n", subtask.id, subtask.description));
        prompt.push_str(&format!(
            "Completion status: {}\n",
            if subtask.completed { "Completed" } else { "Incomplete" }
        ));
        if let Some(result) = &subtask.result {
            prompt.push_str(&format!("Result: {}\n\n", truncate(result, 200)));
        }
    }

    if completed != subtasks.len() {
        prompt.push_str(
            "\nNote: Not all subtasks were successfully completed. Please mention this in \
             your summary and explain the potential impact.",
        );
    }
    prompt
}

fn truncate(text: &str, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio_util::sync::CancellationToken;

    use troupe_core::testing::{
        CollectingSink, MemoryStore, MockProvider, RecordingStudio, StaticResolver,
    };
    use troupe_core::{ContentBlock, TurnAggregator};

    fn task_ref(
        cancel: CancellationToken,
    ) -> (
        AgentTaskRef,
        Arc<MemoryStore>,
        Arc<CollectingSink>,
        Arc<RecordingStudio>,
    ) {
        let store = Arc::new(MemoryStore::new());
        let sink = Arc::new(CollectingSink::new());
        let studio = Arc::new(RecordingStudio::new());
        let aggregator = Arc::new(TurnAggregator::new(store.clone(), sink.clone(), "conv-1", None));
        let task = AgentTaskRef::new("conv-1", cancel, studio.clone(), aggregator);
        (task, store, sink, studio)
    }

    fn agent_with(provider: Arc<MockProvider>) -> TaskOrientedAgent {
        let resolver = Arc::new(StaticResolver::new(provider, "mock-model", true));
        TaskOrientedAgent::new(resolver, Arc::new(UsageTracker::new()), ToolRegistry::new())
            .unwrap()
    }

    fn query() -> Value {
        json!({
            "task": "Compute the yearly totals",
            "expected_result": "A short report"
        })
    }

    fn block_kinds(sink: &CollectingSink) -> Vec<ContentBlockKind> {
        let records = sink.records();
        let last = records.last().unwrap();
        let blocks: Vec<ContentBlock> = serde_json::from_str(&last.content).unwrap();
        blocks.into_iter().map(|b| b.kind).collect()
    }

    #[tokio::test]
    async fn test_single_subtask_plan_runs_to_summary() {
        let provider = Arc::new(MockProvider::new());
        provider.queue_text(r#"[{"id": 1, "description": "add the numbers", "dependencies": []}]"#);
        provider.queue_text("<TASK_DONE>");
        provider.queue_text("The total is 42.");
        provider.queue_text("VALIDATED: true");
        provider.queue_text("All subtasks completed. The total is 42.");
        let agent = agent_with(provider.clone());
        let (task, store, sink, studio) = task_ref(CancellationToken::new());

        let result = agent.execute(query(), &task).await.unwrap();

        assert_eq!(result, "All subtasks completed. The total is 42.");
        assert_eq!(provider.request_count(), 5);

        let kinds = block_kinds(&sink);
        assert_eq!(
            kinds,
            vec![
                ContentBlockKind::PlanSteps,
                ContentBlockKind::SubtaskStart,
                ContentBlockKind::UserAgent,
                ContentBlockKind::AssistantAgent,
                ContentBlockKind::SubtaskComplete,
                ContentBlockKind::Task,
                ContentBlockKind::FinalResult,
            ]
        );

        // The raw plan is persisted as an editor task record.
        let tasks = store.tasks();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].kind, "editor");
        assert!(tasks[0].payload.contains("add the numbers"));

        // The summary is streamed to the studio as well.
        let payloads = studio.streamed_payloads.lock().unwrap();
        assert_eq!(payloads.as_slice(), ["All subtasks completed. The total is 42."]);
    }

    #[tokio::test]
    async fn test_rejected_subtask_is_attempted_exactly_three_times() {
        let provider = Arc::new(MockProvider::new());
        provider.queue_text(r#"[{"id": 1, "description": "write the essay", "dependencies": []}]"#);
        for _ in 0..MAX_ATTEMPTS {
            provider.queue_text("<TASK_DONE>");
            provider.queue_text("A half-finished essay.");
            provider.queue_text("VALIDATED: false. The essay is missing a conclusion.");
        }
        provider.queue_text("Summary: the essay could not be completed.");
        let agent = agent_with(provider.clone());
        let (task, _store, sink, _studio) = task_ref(CancellationToken::new());

        let result = agent.execute(query(), &task).await.unwrap();

        assert_eq!(result, "Summary: the essay could not be completed.");
        // 1 plan + 3 attempts x (user + assistant + validator) + 1 summary.
        assert_eq!(provider.request_count(), 11);

        let kinds = block_kinds(&sink);
        assert!(kinds.contains(&ContentBlockKind::SubtaskFailed));
        assert!(!kinds.contains(&ContentBlockKind::SubtaskComplete));

        // Retry attempts carry the accumulated rejection reasons.
        let requests = provider.requests();
        let second_attempt_system = &requests[4].messages[0];
        assert!(second_attempt_system
            .content
            .contains("missing a conclusion"));
        assert!(second_attempt_system
            .content
            .contains("did not pass the validation"));
    }

    #[tokio::test]
    async fn test_dependency_results_feed_later_subtasks() {
        let provider = Arc::new(MockProvider::new());
        provider.queue_text(
            r#"[
                {"id": 1, "description": "collect the figures", "dependencies": []},
                {"id": 2, "description": "compare the figures", "dependencies": [1, 3]},
                {"id": 3, "description": "file the report", "dependencies": []}
            ]"#,
        );
        for answer in ["Figures: 10 and 32.", "They differ by 22.", "Report filed."] {
            provider.queue_text("<TASK_DONE>");
            provider.queue_text(answer);
            provider.queue_text("VALIDATED: true");
        }
        provider.queue_text("All three subtasks are done.");
        let agent = agent_with(provider.clone());
        let (task, _store, _sink, _studio) = task_ref(CancellationToken::new());

        let result = agent.execute(query(), &task).await.unwrap();
        assert_eq!(result, "All three subtasks are done.");

        // Subtask 2's executor sees subtask 1's completed result, but nothing
        // for subtask 3, which has not run yet.
        let requests = provider.requests();
        let subtask_two_system = &requests[4].messages[0];
        assert!(subtask_two_system.content.contains("Figures: 10 and 32."));
        assert!(subtask_two_system.content.contains("Subtask #1"));
        assert!(!subtask_two_system.content.contains("Subtask #3"));
    }

    #[tokio::test]
    async fn test_unparseable_plan_reports_decomposition_failure() {
        let provider = Arc::new(MockProvider::new());
        provider.queue_text("I cannot break this task down any further.");
        let agent = agent_with(provider.clone());
        let (task, store, _sink, _studio) = task_ref(CancellationToken::new());

        let result = agent.execute(query(), &task).await.unwrap();

        assert_eq!(
            result,
            "Unable to decompose the task, please provide a clearer task description."
        );
        assert_eq!(provider.request_count(), 1);
        // The raw planner reply is still persisted for inspection.
        assert_eq!(store.tasks().len(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_task_reports_abort() {
        let provider = Arc::new(MockProvider::new());
        let agent = agent_with(provider.clone());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let (task, _store, _sink, _studio) = task_ref(cancel);

        let result = agent.execute(query(), &task).await.unwrap();

        assert_eq!(result, "Task has been aborted.");
        assert_eq!(provider.request_count(), 0);
    }
}
