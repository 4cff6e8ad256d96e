//! Base conversational agent: bounded history, streaming completion requests
//! and ordered tool dispatch.

use std::sync::Arc;

use serde_json::json;
use tracing::{debug, error, warn};

use troupe_core::{
    AgentTaskRef, CompletionRequest, ContentBlockKind, Error, Message, ModelKind, ModelResolver,
    Role, StreamingCompletion, ToolCall, ToolRegistry, UsageTracker,
};

/// Upper bound on retained history entries, system messages included.
pub const MAX_HISTORY_LENGTH: usize = 30;
/// Upper bound on tool definitions attached to one agent.
pub const MAX_TOOLS: usize = 180;
/// Upper bound on tool-dispatch rounds within one `run` call.
pub const MAX_TOOL_ROUNDS: usize = 20;

/// A single role-played participant in the orchestration.
///
/// Owns its conversation history exclusively; no other component mutates it.
/// One `run` call drives the request/tool-dispatch loop until the model stops
/// asking for tools or the round cap is hit.
pub struct ConversationAgent {
    name: String,
    temperature: f32,
    history: Vec<Message>,
    system_set: bool,
    tools: ToolRegistry,
    resolver: Arc<dyn ModelResolver>,
    usage: Arc<UsageTracker>,
}

impl ConversationAgent {
    pub fn new(
        name: impl Into<String>,
        resolver: Arc<dyn ModelResolver>,
        usage: Arc<UsageTracker>,
    ) -> Self {
        Self {
            name: name.into(),
            temperature: 0.5,
            history: Vec::new(),
            system_set: false,
            tools: ToolRegistry::new(),
            resolver,
            usage,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// Attach the tool set this agent may call. Fails when the set exceeds
    /// [`MAX_TOOLS`].
    pub fn with_tools(mut self, tools: ToolRegistry) -> Result<Self, Error> {
        if tools.len() > MAX_TOOLS {
            return Err(Error::invalid_request("Too many tools"));
        }
        self.tools = tools;
        Ok(self)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn history(&self) -> &[Message] {
        &self.history
    }

    /// Set the system message and seed the history with it. Only the first
    /// non-empty call takes effect; later calls are no-ops.
    pub fn initial_system_message(&mut self, content: impl Into<String>) {
        if self.system_set {
            return;
        }
        let content = content.into();
        if content.is_empty() {
            return;
        }
        self.system_set = true;
        self.add_to_history(Message::system(content));
    }

    /// Append a message unless it carries nothing, then enforce the history
    /// cap. System messages always survive trimming; the oldest non-system
    /// entries are dropped first, keeping the remainder in original order.
    pub fn add_to_history(&mut self, message: Message) {
        if message.is_vacuous() {
            return;
        }
        self.history.push(message);
        self.trim_history();
    }

    fn trim_history(&mut self) {
        if self.history.len() <= MAX_HISTORY_LENGTH {
            return;
        }
        let system_count = self
            .history
            .iter()
            .filter(|m| m.role == Role::System)
            .count();
        let keep = MAX_HISTORY_LENGTH.saturating_sub(system_count);
        let other_count = self.history.len() - system_count;
        let mut drop = other_count.saturating_sub(keep);
        self.history.retain(|m| {
            if m.role == Role::System {
                true
            } else if drop > 0 {
                drop -= 1;
                false
            } else {
                true
            }
        });
    }

    /// Issue one streaming completion request over the current history.
    ///
    /// Tools are silently dropped when the resolved model does not support
    /// tool calls. The returned completion reports its token usage to the
    /// shared tracker exactly once, when the stream finishes with nonzero
    /// usage.
    async fn generate_response(
        &self,
        task: &AgentTaskRef,
        tools: &ToolRegistry,
        kind: ModelKind,
    ) -> Result<StreamingCompletion, Error> {
        if task.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let resolved = self.resolver.resolve(kind)?;

        let mut request = CompletionRequest::new(self.history.clone())
            .with_model(&resolved.model)
            .with_temperature(self.temperature);
        if !tools.is_empty() {
            if resolved.supports_tools {
                request = request.with_tools(tools.definitions());
            } else {
                warn!(
                    agent = %self.name,
                    model = %resolved.model,
                    provider = resolved.provider.name(),
                    "model does not support tool calls, ignoring attached tools"
                );
            }
        }

        let upstream = resolved.provider.stream(request).await?;
        let completion = StreamingCompletion::new(upstream, task.cancel_token().clone());

        let tracker = self.usage.clone();
        let agent = self.name.clone();
        let watched = completion.clone();
        tokio::spawn(async move {
            match watched.completed().await {
                Ok(Some(usage)) if usage.total_tokens > 0 => {
                    debug!(
                        agent = %agent,
                        prompt = usage.prompt_tokens,
                        completion = usage.completion_tokens,
                        "token usage recorded"
                    );
                    tracker.add(&usage);
                }
                Ok(_) => {}
                Err(e) if e.is_cancelled() => {}
                Err(e) => error!(agent = %agent, error = %e, "completion stream failed"),
            }
        });

        Ok(completion)
    }

    /// Execute the model's tool calls strictly in order, one at a time.
    ///
    /// A failure never aborts the loop: every call leaves a tool-role history
    /// entry keyed by its tool_call_id, including calls skipped because
    /// cancellation fired mid-dispatch. Returns the calls that produced a
    /// non-empty result, or `None` if there was nothing to dispatch.
    async fn run_with_tools(
        &mut self,
        task: &AgentTaskRef,
        tool_calls: &[ToolCall],
        tools: &ToolRegistry,
    ) -> Result<Option<Vec<(ToolCall, String)>>, Error> {
        if tool_calls.is_empty() || tools.is_empty() {
            return Ok(None);
        }

        let mut results = Vec::new();
        self.add_to_history(Message::assistant_with_tool_calls("", tool_calls.to_vec()));

        for call in tool_calls {
            if task.is_cancelled() {
                self.add_to_history(Message::tool_result(
                    &call.id,
                    "User cancelled the operation",
                ));
                continue;
            }

            let Some(tool) = tools.get(&call.name) else {
                error!(tool = %call.name, "tool not found");
                self.add_to_history(Message::tool_result(
                    &call.id,
                    format!("Tool not found: {}", call.name),
                ));
                continue;
            };

            let arguments = match call.arguments_value() {
                Ok(value) => value,
                Err(e) => {
                    error!(tool = %call.name, error = %e, "failed to parse tool arguments");
                    self.add_to_history(Message::tool_result(
                        &call.id,
                        format!("Failed to parse tool arguments: {}, {}", e, call.arguments),
                    ));
                    continue;
                }
            };

            task.create_message(
                ContentBlockKind::ToolCall,
                json!({
                    "tool": call.name,
                    "agent": self.name,
                    "status": "started",
                    "parameters": arguments.clone(),
                }),
                "Tool Agent",
            )
            .await?;

            match tool.execute(arguments.clone(), task).await {
                Ok(result) if !result.is_empty() => {
                    self.add_to_history(Message::tool_result(&call.id, &result));
                    let label = if tool.description().is_empty() {
                        call.name.clone()
                    } else {
                        tool.description().to_string()
                    };
                    task.create_message(
                        ContentBlockKind::ToolMessage,
                        json!({
                            "tool": label,
                            "agent": self.name,
                            "status": "completed",
                            "parameters": arguments,
                            "result": result,
                        }),
                        "Tool Agent",
                    )
                    .await?;
                    results.push((call.clone(), result));
                }
                Ok(_) => {
                    self.add_to_history(Message::tool_result(
                        &call.id,
                        format!(
                            "Tool {} completed execution but returned no result",
                            call.name
                        ),
                    ));
                }
                Err(e) => {
                    error!(tool = %call.name, error = %e, "tool execution failed");
                    self.add_to_history(Message::tool_result(
                        &call.id,
                        format!("Tool {} execution failed: {}", call.name, e),
                    ));
                    task.create_message(
                        ContentBlockKind::ToolMessage,
                        json!({
                            "tool": call.name,
                            "agent": self.name,
                            "status": "failed",
                            "parameters": {},
                            "error": e.to_string(),
                        }),
                        "Tool Agent",
                    )
                    .await?;
                }
            }
        }

        Ok((!results.is_empty()).then_some(results))
    }

    /// Drive one turn: append the inbound message, then alternate completion
    /// requests and tool dispatch until the model stops calling tools or
    /// [`MAX_TOOL_ROUNDS`] is reached. The final accumulated content is
    /// appended to history as an assistant entry.
    ///
    /// Returns the last completion, or `None` when cancellation fired before
    /// any request was dispatched.
    pub async fn run(
        &mut self,
        message: Message,
        task: &AgentTaskRef,
        tools: Option<&ToolRegistry>,
        kind: ModelKind,
    ) -> Result<Option<StreamingCompletion>, Error> {
        if !self.system_set {
            return Err(Error::invalid_request("System message is not set"));
        }
        self.add_to_history(message);

        let tools = match tools {
            Some(t) if !t.is_empty() => t.clone(),
            _ => self.tools.clone(),
        };

        if task.is_cancelled() {
            return Ok(None);
        }

        let mut last: Option<StreamingCompletion> = None;
        let mut rounds = 0;
        while !task.is_cancelled() && rounds < MAX_TOOL_ROUNDS {
            let completion = self.generate_response(task, &tools, kind).await?;
            let calls = completion.tool_calls().await?;
            last = Some(completion);
            if calls.is_empty() {
                break;
            }
            self.run_with_tools(task, &calls, &tools).await?;
            rounds += 1;
        }
        if rounds >= MAX_TOOL_ROUNDS {
            self.add_to_history(Message::system(
                "Maximum tool execution limit reached, stopping execution",
            ));
        }

        if let Some(completion) = &last {
            if let Ok(content) = completion.full_content().await {
                if !content.is_empty() {
                    self.add_to_history(Message::assistant(content));
                }
            }
        }

        Ok(last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tokio_util::sync::CancellationToken;

    use troupe_core::testing::{
        CollectingSink, MemoryStore, MockProvider, RecordingStudio, StaticResolver,
    };
    use troupe_core::{PropertySchema, Tool, ToolParameters, TurnAggregator};

    struct EchoTool {
        calls: AtomicUsize,
    }

    impl EchoTool {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }

        fn description(&self) -> &str {
            "Echo the given message back."
        }

        fn parameters(&self) -> ToolParameters {
            ToolParameters::new().add_property(
                "message",
                PropertySchema::string("The message to echo."),
                true,
            )
        }

        async fn execute(
            &self,
            arguments: serde_json::Value,
            _task: &AgentTaskRef,
        ) -> Result<String, Error> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let message = arguments["message"].as_str().unwrap_or_default();
            Ok(format!("echo: {}", message))
        }
    }

    fn task_ref(cancel: CancellationToken) -> (AgentTaskRef, Arc<MemoryStore>, Arc<CollectingSink>) {
        let store = Arc::new(MemoryStore::new());
        let sink = Arc::new(CollectingSink::new());
        let aggregator = Arc::new(TurnAggregator::new(store.clone(), sink.clone(), "conv-1", None));
        let task = AgentTaskRef::new("conv-1", cancel, Arc::new(RecordingStudio::new()), aggregator);
        (task, store, sink)
    }

    fn agent_with(provider: Arc<MockProvider>, supports_tools: bool) -> ConversationAgent {
        let resolver = Arc::new(StaticResolver::new(provider, "mock-model", supports_tools));
        ConversationAgent::new("Test Agent", resolver, Arc::new(UsageTracker::new()))
    }

    fn echo_registry() -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool::new()));
        registry
    }

    #[test]
    fn test_too_many_tools_rejected() {
        let provider = Arc::new(MockProvider::new());
        let mut registry = ToolRegistry::new();
        for i in 0..=MAX_TOOLS {
            struct Named(String);
            #[async_trait]
            impl Tool for Named {
                fn name(&self) -> &str {
                    &self.0
                }
                fn description(&self) -> &str {
                    ""
                }
                fn parameters(&self) -> ToolParameters {
                    ToolParameters::new()
                }
                async fn execute(
                    &self,
                    _arguments: serde_json::Value,
                    _task: &AgentTaskRef,
                ) -> Result<String, Error> {
                    Ok(String::new())
                }
            }
            registry.register(Arc::new(Named(format!("tool-{}", i))));
        }

        let result = agent_with(provider, true).with_tools(registry);
        assert!(matches!(result, Err(Error::InvalidRequest(_))));
    }

    #[test]
    fn test_initial_system_message_is_idempotent() {
        let mut agent = agent_with(Arc::new(MockProvider::new()), true);
        agent.initial_system_message("first");
        agent.initial_system_message("second");

        assert_eq!(agent.history().len(), 1);
        assert_eq!(agent.history()[0].content, "first");
    }

    #[test]
    fn test_vacuous_messages_are_ignored() {
        let mut agent = agent_with(Arc::new(MockProvider::new()), true);
        agent.add_to_history(Message::user(""));
        assert!(agent.history().is_empty());

        agent.add_to_history(Message::tool_result("call-1", ""));
        assert_eq!(agent.history().len(), 1);
    }

    #[test]
    fn test_trim_keeps_system_and_recent_messages() {
        let mut agent = agent_with(Arc::new(MockProvider::new()), true);
        agent.initial_system_message("system rules");
        for i in 1..=40 {
            agent.add_to_history(Message::user(format!("msg {}", i)));
        }

        let history = agent.history();
        assert_eq!(history.len(), MAX_HISTORY_LENGTH);
        assert_eq!(history[0].role, Role::System);
        // 29 non-system slots remain, so the oldest kept user message is #12.
        assert_eq!(history[1].content, "msg 12");
        assert_eq!(history.last().unwrap().content, "msg 40");
    }

    #[tokio::test]
    async fn test_run_appends_single_assistant_entry() {
        let provider = Arc::new(MockProvider::new());
        provider.queue_text("The answer is 4");

        let mut agent = agent_with(provider.clone(), true);
        agent.initial_system_message("Answer questions.");
        let (task, _store, _sink) = task_ref(CancellationToken::new());

        let completion = agent
            .run(Message::user("What is 2+2?"), &task, None, ModelKind::Text)
            .await
            .unwrap()
            .expect("completion");

        assert_eq!(completion.full_content().await.unwrap(), "The answer is 4");
        assert_eq!(provider.request_count(), 1);

        let assistants: Vec<_> = agent
            .history()
            .iter()
            .filter(|m| m.role == Role::Assistant)
            .collect();
        assert_eq!(assistants.len(), 1);
        assert_eq!(assistants[0].content, "The answer is 4");
    }

    #[tokio::test]
    async fn test_run_without_system_message_fails() {
        let mut agent = agent_with(Arc::new(MockProvider::new()), true);
        let (task, _store, _sink) = task_ref(CancellationToken::new());

        let result = agent
            .run(Message::user("hi"), &task, None, ModelKind::Text)
            .await;
        assert!(matches!(result, Err(Error::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn test_run_dispatches_tools_in_order() {
        let provider = Arc::new(MockProvider::new());
        provider.queue_tool_call("call-1", "echo", r#"{"message": "hi"}"#);
        provider.queue_text("done");

        let mut agent = agent_with(provider.clone(), true)
            .with_tools(echo_registry())
            .unwrap();
        agent.initial_system_message("Use tools.");
        let (task, store, sink) = task_ref(CancellationToken::new());

        let completion = agent
            .run(Message::user("echo hi"), &task, None, ModelKind::Text)
            .await
            .unwrap()
            .expect("completion");

        assert_eq!(completion.full_content().await.unwrap(), "done");
        assert_eq!(provider.request_count(), 2);

        let tool_entries: Vec<_> = agent
            .history()
            .iter()
            .filter(|m| m.role == Role::Tool)
            .collect();
        assert_eq!(tool_entries.len(), 1);
        assert_eq!(tool_entries[0].content, "echo: hi");
        assert_eq!(tool_entries[0].tool_call_id.as_deref(), Some("call-1"));

        // The dispatch published started and completed blocks into one record.
        assert_eq!(store.records().len(), 1);
        let blocks: Vec<troupe_core::ContentBlock> =
            serde_json::from_str(&sink.records().last().unwrap().content).unwrap();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].kind, ContentBlockKind::ToolCall);
        assert_eq!(blocks[1].kind, ContentBlockKind::ToolMessage);
    }

    #[tokio::test]
    async fn test_cancelled_dispatch_records_markers() {
        let provider = Arc::new(MockProvider::new());
        let mut agent = agent_with(provider, true);
        agent.initial_system_message("Use tools.");

        let echo = Arc::new(EchoTool::new());
        let mut counted = ToolRegistry::new();
        counted.register(echo.clone());

        let cancel = CancellationToken::new();
        cancel.cancel();
        let (task, _store, _sink) = task_ref(cancel);

        let calls = vec![
            ToolCall::new("call-1", "echo", r#"{"message": "a"}"#),
            ToolCall::new("call-2", "echo", r#"{"message": "b"}"#),
        ];
        let results = agent
            .run_with_tools(&task, &calls, &counted)
            .await
            .unwrap();

        assert!(results.is_none());
        assert_eq!(echo.calls.load(Ordering::SeqCst), 0);
        let markers: Vec<_> = agent
            .history()
            .iter()
            .filter(|m| m.content == "User cancelled the operation")
            .collect();
        assert_eq!(markers.len(), 2);
    }

    #[tokio::test]
    async fn test_pre_cancelled_run_returns_none() {
        let provider = Arc::new(MockProvider::new());
        let mut agent = agent_with(provider.clone(), true);
        agent.initial_system_message("Answer questions.");

        let cancel = CancellationToken::new();
        cancel.cancel();
        let (task, _store, _sink) = task_ref(cancel);

        let result = agent
            .run(Message::user("hi"), &task, None, ModelKind::Text)
            .await
            .unwrap();
        assert!(result.is_none());
        assert_eq!(provider.request_count(), 0);
    }

    #[tokio::test]
    async fn test_tools_dropped_when_unsupported() {
        let provider = Arc::new(MockProvider::new());
        provider.queue_text("no tools used");

        let mut agent = agent_with(provider.clone(), false)
            .with_tools(echo_registry())
            .unwrap();
        agent.initial_system_message("Use tools.");
        let (task, _store, _sink) = task_ref(CancellationToken::new());

        agent
            .run(Message::user("echo hi"), &task, None, ModelKind::Text)
            .await
            .unwrap();

        let request = provider.last_request().expect("request");
        assert!(request.tools.is_empty());
    }

    #[tokio::test]
    async fn test_tool_round_cap_appends_system_note() {
        let provider = Arc::new(MockProvider::new());
        for _ in 0..MAX_TOOL_ROUNDS {
            provider.queue_tool_call("call-n", "echo", r#"{"message": "again"}"#);
        }

        let mut agent = agent_with(provider.clone(), true)
            .with_tools(echo_registry())
            .unwrap();
        agent.initial_system_message("Use tools.");
        let (task, _store, _sink) = task_ref(CancellationToken::new());

        agent
            .run(Message::user("loop forever"), &task, None, ModelKind::Text)
            .await
            .unwrap();

        assert_eq!(provider.request_count(), MAX_TOOL_ROUNDS);
        assert_eq!(
            agent.history().last().unwrap().content,
            "Maximum tool execution limit reached, stopping execution"
        );
    }

    #[tokio::test]
    async fn test_usage_reported_once_per_response() {
        let provider = Arc::new(MockProvider::new());
        provider.queue_text("ok");

        let tracker = Arc::new(UsageTracker::new());
        let resolver = Arc::new(StaticResolver::new(provider, "mock-model", true));
        let mut agent = ConversationAgent::new("Test Agent", resolver, tracker.clone());
        agent.initial_system_message("Answer.");
        let (task, _store, _sink) = task_ref(CancellationToken::new());

        agent
            .run(Message::user("hi"), &task, None, ModelKind::Text)
            .await
            .unwrap();

        // The usage subscription runs on a spawned task.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let stats = tracker.stats();
        assert_eq!(stats.session.total_tokens, 30);
        assert_eq!(stats.lifetime.total_tokens, 30);
    }
}
