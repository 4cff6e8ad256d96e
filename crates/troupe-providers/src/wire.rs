//! OpenAI-compatible chat wire format.
//!
//! Both the hosted provider and the self-hosted provider speak this format;
//! only the transport differs. The stream payload mapping lives here so each
//! transport loop stays a thin shell around it.

use serde::{Deserialize, Serialize};

use troupe_core::{CompletionRequest, Error, Message, Role, StreamChunk, ToolDefinition, Usage};

pub(crate) fn build_chat_request(
    request: &CompletionRequest,
    default_model: Option<&str>,
) -> ChatRequest {
    // Request model wins over the provider default; when both are absent the
    // field is omitted and the server decides.
    let model = request
        .model
        .clone()
        .or_else(|| default_model.map(str::to_string));

    let messages = request.messages.iter().map(convert_message).collect();

    let tools = if request.tools.is_empty() {
        None
    } else {
        Some(request.tools.iter().map(convert_tool).collect())
    };

    ChatRequest {
        model,
        messages,
        temperature: request.temperature,
        max_tokens: request.max_tokens,
        stream: Some(request.stream),
        tools,
        stream_options: if request.stream {
            Some(StreamOptions {
                include_usage: true,
            })
        } else {
            None
        },
    }
}

fn convert_message(message: &Message) -> ChatMessage {
    let role = match message.role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    };

    let content = if message.content.is_empty() {
        None
    } else {
        Some(message.content.clone())
    };

    let tool_calls = if message.tool_calls.is_empty() {
        None
    } else {
        Some(
            message
                .tool_calls
                .iter()
                .map(|tc| ChatToolCall {
                    id: tc.id.clone(),
                    r#type: "function".to_string(),
                    function: ChatFunctionCall {
                        name: tc.name.clone(),
                        arguments: tc.arguments.clone(),
                    },
                })
                .collect(),
        )
    };

    ChatMessage {
        role: role.to_string(),
        content,
        tool_calls,
        tool_call_id: message.tool_call_id.clone(),
    }
}

fn convert_tool(tool: &ToolDefinition) -> ChatTool {
    ChatTool {
        r#type: "function".to_string(),
        function: ChatFunction {
            name: tool.name.clone(),
            description: tool.description.clone(),
            parameters: serde_json::to_value(&tool.parameters).unwrap_or_default(),
        },
    }
}

/// Map one parsed stream payload to chunks.
///
/// Usage arrives on its own final payload when `stream_options.include_usage`
/// is set, after the finish-reason payload, so `Done` is never emitted here;
/// the transport sends it when the `[DONE]` marker (or the connection end)
/// arrives, carrying whatever `final_usage` captured by then.
pub(crate) fn delta_chunks(
    response: StreamResponse,
    started: &mut bool,
    final_usage: &mut Option<Usage>,
) -> Vec<StreamChunk> {
    let mut chunks = Vec::new();

    if !*started {
        *started = true;
        chunks.push(StreamChunk::Start {
            model: response.model.clone().unwrap_or_default(),
        });
    }

    if let Some(usage) = &response.usage {
        *final_usage = Some(Usage::new(usage.prompt_tokens, usage.completion_tokens));
    }

    for choice in response.choices {
        if let Some(content) = choice.delta.content {
            if !content.is_empty() {
                chunks.push(StreamChunk::Delta { content });
            }
        }

        if let Some(tool_calls) = choice.delta.tool_calls {
            for tc in tool_calls {
                let index = tc.index;
                let name = tc
                    .function
                    .as_ref()
                    .and_then(|f| f.name.clone())
                    .unwrap_or_default();
                if tc.id.is_some() || !name.is_empty() {
                    chunks.push(StreamChunk::ToolCallStart {
                        index,
                        id: tc.id.unwrap_or_default(),
                        name,
                    });
                }
                if let Some(arguments) = tc.function.and_then(|f| f.arguments) {
                    if !arguments.is_empty() {
                        chunks.push(StreamChunk::ToolCallDelta { index, arguments });
                    }
                }
            }
        }
    }

    chunks
}

pub(crate) fn parse_error(status: u16, body: &str) -> Error {
    #[derive(Deserialize)]
    struct ErrorResponse {
        error: ErrorDetail,
    }

    #[derive(Deserialize)]
    struct ErrorDetail {
        message: String,
    }

    if let Ok(err) = serde_json::from_str::<ErrorResponse>(body) {
        match status {
            401 => Error::auth(err.error.message),
            429 => Error::rate_limit(err.error.message),
            400 => Error::invalid_request(err.error.message),
            _ => Error::api(status, err.error.message),
        }
    } else {
        Error::api(status, body.to_string())
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct ChatRequest {
    /// Model to use. Optional for servers that have a default model.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ChatTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_options: Option<StreamOptions>,
}

#[derive(Debug, Serialize)]
pub(crate) struct StreamOptions {
    pub include_usage: bool,
}

#[derive(Debug, Serialize)]
pub(crate) struct ChatMessage {
    pub role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ChatToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub(crate) struct ChatToolCall {
    pub id: String,
    pub r#type: String,
    pub function: ChatFunctionCall,
}

#[derive(Debug, Serialize)]
pub(crate) struct ChatFunctionCall {
    pub name: String,
    pub arguments: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct ChatTool {
    pub r#type: String,
    pub function: ChatFunction,
}

#[derive(Debug, Serialize)]
pub(crate) struct ChatFunction {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

#[derive(Debug, Deserialize)]
pub(crate) struct StreamResponse {
    #[serde(default)]
    pub model: Option<String>,
    /// Empty on the trailing usage-only payload.
    #[serde(default)]
    pub choices: Vec<StreamChoice>,
    #[serde(default)]
    pub usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct StreamChoice {
    pub delta: StreamDelta,
    #[serde(default)]
    #[allow(dead_code)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct StreamDelta {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub tool_calls: Option<Vec<StreamToolCall>>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct StreamToolCall {
    #[serde(default)]
    pub index: usize,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub function: Option<StreamFunction>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct StreamFunction {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}
