use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use reqwest_eventsource::{Event, EventSource};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, trace};

use troupe_core::{
    CompletionRequest, Error, Provider, ProviderKind, StreamChunk, StreamResult, Usage,
};

use crate::wire;

const DEFAULT_BASE_URL: &str = "http://localhost:11434/v1";

/// Self-hosted provider for Ollama and other local servers exposing the
/// OpenAI-compatible surface. Tool support varies by model family, so the
/// resolver consults the tool-support policy before advertising tools.
pub struct OllamaProvider {
    client: Client,
    base_url: String,
    name: String,
    api_key: Option<String>,
    default_model: Option<String>,
}

impl OllamaProvider {
    pub fn new() -> Self {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            client,
            base_url: DEFAULT_BASE_URL.to_string(),
            name: "ollama".to_string(),
            api_key: None,
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

    /// Most local servers ignore auth; some gateways in front of them don't.
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = Some(model.into());
        self
    }
}

impl Default for OllamaProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Provider for OllamaProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn default_model(&self) -> Option<&str> {
        self.default_model.as_deref()
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::SelfHosted
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

        let mut request_builder = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Content-Type", "application/json")
            .json(&api_request);
        if let Some(key) = &self.api_key {
            request_builder = request_builder.header("Authorization", format!("Bearer {}", key));
        }

        let es = EventSource::new(request_builder).map_err(|e| Error::stream(e.to_string()))?;

        let (tx, rx) = mpsc::channel::<Result<StreamChunk, Error>>(100);

        tokio::spawn(async move {
            let mut es = es;
            let mut started = false;
            let mut final_usage: Option<Usage> = None;

            while let Some(event) = es.next().await {
                match event {
                    Ok(Event::Open) => {
                        debug!("SSE connection opened");
                    }
                    Ok(Event::Message(msg)) => {
                        trace!(data = %msg.data, "SSE event");

                        if msg.data == "[DONE]" {
                            let _ = tx
                                .send(Ok(StreamChunk::Done {
                                    usage: final_usage.take(),
                                }))
                                .await;
                            break;
                        }

                        match serde_json::from_str::<wire::StreamResponse>(&msg.data) {
                            Ok(payload) => {
                                for mapped in
                                    wire::delta_chunks(payload, &mut started, &mut final_usage)
                                {
                                    let _ = tx.send(Ok(mapped)).await;
                                }
                            }
                            Err(e) => {
                                error!(error = %e, data = %msg.data, "failed to parse SSE payload");
                            }
                        }
                    }
                    Err(reqwest_eventsource::Error::StreamEnded) => {
                        let _ = tx
                            .send(Ok(StreamChunk::Done {
                                usage: final_usage.take(),
                            }))
                            .await;
                        break;
                    }
                    Err(reqwest_eventsource::Error::InvalidStatusCode(status, response)) => {
                        let body = response.text().await.unwrap_or_default();
                        error!(status = status.as_u16(), body = %body, "chat stream request failed");
                        let _ = tx
                            .send(Err(wire::parse_error(status.as_u16(), &body)))
                            .await;
                        break;
                    }
                    Err(e) => {
                        error!(error = %e, "SSE error");
                        let _ = tx
                            .send(Err(Error::stream(format!("event stream error: {}", e))))
                            .await;
                        break;
                    }
                }
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)) as StreamResult)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_defaults() {
        let provider = OllamaProvider::new();
        assert_eq!(provider.name(), "ollama");
        assert_eq!(provider.kind(), ProviderKind::SelfHosted);
        assert_eq!(provider.default_model(), None);
    }

    #[test]
    fn test_provider_builders() {
        let provider = OllamaProvider::new()
            .with_name("workstation")
            .with_base_url("http://10.0.0.5:11434/v1")
            .with_default_model("llama3.1:70b");
        assert_eq!(provider.name(), "workstation");
        assert_eq!(provider.default_model(), Some("llama3.1:70b"));
    }
}
