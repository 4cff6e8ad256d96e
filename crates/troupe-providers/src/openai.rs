use async_trait::async_trait;
use reqwest::Client;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error};

use troupe_core::{
    CompletionRequest, Error, Provider, ProviderKind, StreamChunk, StreamResult, Usage,
};

use crate::wire;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Hosted OpenAI-compatible provider. Works against api.openai.com and any
/// gateway exposing the same chat-completions surface.
pub struct OpenAiProvider {
    client: Client,
    api_key: String,
    base_url: String,
    name: String,
    default_model: Option<String>,
}

impl OpenAiProvider {
    pub fn new(api_key: impl Into<String>) -> Self {
        // SSE needs HTTP/1.1 (HTTP/2 framing breaks some gateways) and no
        // automatic decompression (it buffers whole responses).
        let client = Client::builder()
            .http1_only()
            .no_gzip()
            .no_brotli()
            .no_deflate()
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            client,
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            name: "openai".to_string(),
            default_model: None,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = Some(model.into());
        self
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn default_model(&self) -> Option<&str> {
        self.default_model.as_deref()
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Hosted
    }

    async fn stream(&self, request: CompletionRequest) -> Result<StreamResult, Error> {
        let mut req = request;
        req.stream = true;

        let api_request = wire::build_chat_request(&req, self.default_model());
        debug!(
            provider = %self.name,
            model = ?api_request.model,
            message_count = api_request.messages.len(),
            has_tools = api_request.tools.is_some(),
            "chat stream request"
        );

        // Identity encoding keeps the proxy chain from buffering events.
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .header("Accept", "text/event-stream")
            .header("Accept-Encoding", "identity")
            .header("Cache-Control", "no-cache")
            .json(&api_request)
            .send()
            .await
            .map_err(|e| Error::network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            error!(status = status.as_u16(), body = %error_text, "chat stream request failed");
            return Err(wire::parse_error(status.as_u16(), &error_text));
        }

        let (tx, rx) = mpsc::channel::<Result<StreamChunk, Error>>(100);

        tokio::spawn(async move {
            let mut response = response;
            let mut buffer = String::new();
            let mut started = false;
            let mut final_usage: Option<Usage> = None;

            while let Ok(Some(chunk)) = response.chunk().await {
                match std::str::from_utf8(&chunk) {
                    Ok(text) => buffer.push_str(text),
                    Err(_) => {
                        error!("invalid UTF-8 in SSE stream");
                        continue;
                    }
                }

                // Process complete SSE events (separated by \n\n)
                while let Some(event_end) = buffer.find("\n\n") {
                    let event_data = buffer[..event_end].to_string();
                    buffer = buffer[event_end + 2..].to_string();

                    for line in event_data.lines() {
                        let Some(data) = line.strip_prefix("data: ") else {
                            continue;
                        };

                        if data == "[DONE]" {
                            let _ = tx
                                .send(Ok(StreamChunk::Done {
                                    usage: final_usage.take(),
                                }))
                                .await;
                            return;
                        }

                        match serde_json::from_str::<wire::StreamResponse>(data) {
                            Ok(payload) => {
                                for mapped in
                                    wire::delta_chunks(payload, &mut started, &mut final_usage)
                                {
                                    let _ = tx.send(Ok(mapped)).await;
                                }
                            }
                            Err(e) => {
                                error!(error = %e, data = %data, "failed to parse SSE payload");
                            }
                        }
                    }
                }
            }

            // Connection closed without a [DONE] marker.
            let _ = tx
                .send(Ok(StreamChunk::Done {
                    usage: final_usage.take(),
                }))
                .await;
        });

        Ok(Box::pin(ReceiverStream::new(rx)) as StreamResult)
    }
}
