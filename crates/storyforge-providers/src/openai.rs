//! OpenAI Chat Completions API provider.
//!
//! Talks to `/v1/chat/completions`. Also serves OpenRouter, Ollama and any
//! other OpenAI-compatible endpoint.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::utf8::Utf8Decoder;
use crate::{ChatMessage, CompletionRequest, LlmProvider, ModelApi, ProviderError, RawChunkStream};

const OPENAI_BASE_URL: &str = "https://api.openai.com";
const OPENROUTER_BASE_URL: &str = "https://openrouter.ai/api";
const OLLAMA_BASE_URL: &str = "http://localhost:11434";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// API style, determines minor behavior differences.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiStyle {
    OpenAi,
    OpenRouter,
    Ollama,
}

pub struct OpenAiProvider {
    pub base_url: String,
    pub api_style: ApiStyle,
    provider_id: String,
    api_key: Option<String>,
    client: reqwest::Client,
    /// Whole-request bound for non-streaming calls.
    request_timeout: Option<Duration>,
}

impl OpenAiProvider {
    pub fn openai(base_url: Option<&str>, api_key: String) -> Self {
        Self::build(
            "openai",
            base_url.unwrap_or(OPENAI_BASE_URL),
            ApiStyle::OpenAi,
            Some(api_key),
        )
    }

    pub fn openrouter(base_url: Option<&str>, api_key: String) -> Self {
        Self::build(
            "openrouter",
            base_url.unwrap_or(OPENROUTER_BASE_URL),
            ApiStyle::OpenRouter,
            Some(api_key),
        )
    }

    pub fn ollama(base_url: Option<&str>) -> Self {
        Self::build(
            "ollama",
            base_url.unwrap_or(OLLAMA_BASE_URL),
            ApiStyle::Ollama,
            None,
        )
    }

    /// Any other OpenAI-compatible server.
    pub fn compatible(id: &str, base_url: &str, api_key: Option<String>) -> Self {
        Self::build(id, base_url, ApiStyle::OpenAi, api_key)
    }

    fn build(id: &str, base_url: &str, api_style: ApiStyle, api_key: Option<String>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_style,
            provider_id: id.into(),
            api_key,
            client: http_client(),
            request_timeout: None,
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    fn body(&self, request: &CompletionRequest, stream: bool) -> OpenAiRequest {
        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        if let Some(ref system) = request.system {
            messages.push(ChatMessage {
                role: "system".into(),
                content: system.clone(),
            });
        }
        messages.extend(request.messages.iter().cloned());

        OpenAiRequest {
            model: request.model.clone(),
            messages,
            max_tokens: request.max_tokens,
            stream,
            temperature: request.temperature,
            response_format: request.json_mode.then(|| ResponseFormat {
                format_type: "json_object",
            }),
        }
    }

    async fn send(
        &self,
        body: &OpenAiRequest,
        cancel: &CancellationToken,
    ) -> Result<reqwest::Response, ProviderError> {
        debug!(model = %body.model, base_url = %self.base_url, stream = body.stream, "Calling OpenAI-compatible API");

        let mut req_builder = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .header("content-type", "application/json");

        // Auth differs by style
        if self.api_style != ApiStyle::Ollama {
            if let Some(ref key) = self.api_key {
                req_builder = req_builder.header("authorization", format!("Bearer {key}"));
            }
        }
        if self.api_style == ApiStyle::OpenRouter {
            req_builder = req_builder.header("HTTP-Referer", "https://storyforge.dev");
        }

        // A streamed body may legitimately outlive any fixed bound.
        if !body.stream {
            if let Some(timeout) = self.request_timeout {
                req_builder = req_builder.timeout(timeout);
            }
        }

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
            r = req_builder.json(body).send() => r.map_err(|e| timeout_error(e, self.request_timeout))?,
        };

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Status { status, body });
        }
        Ok(response)
    }
}

fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .build()
        .unwrap_or_else(|e| {
            warn!(%e, "Falling back to default HTTP client");
            reqwest::Client::new()
        })
}

fn timeout_error(err: reqwest::Error, limit: Option<Duration>) -> ProviderError {
    match limit {
        Some(limit) if err.is_timeout() => ProviderError::Timeout(limit),
        _ => ProviderError::Http(err),
    }
}

// --- OpenAI request/response types ---

#[derive(Debug, Serialize)]
struct OpenAiRequest {
    model: String,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: &'static str,
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    #[serde(default)]
    message: Option<CompletionMessage>,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
}

fn completion_text(completion: ChatCompletion) -> Result<String, ProviderError> {
    let choice = completion
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| ProviderError::Protocol("response has no choices".into()))?;
    Ok(choice
        .message
        .and_then(|m| m.content)
        .or(choice.text)
        .unwrap_or_default())
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn id(&self) -> &str {
        &self.provider_id
    }

    fn api(&self) -> ModelApi {
        match self.api_style {
            ApiStyle::Ollama => ModelApi::Ollama,
            _ => ModelApi::OpenAiCompletions,
        }
    }

    async fn complete(
        &self,
        request: &CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<String, ProviderError> {
        let body = self.body(request, false);
        let response = self.send(&body, cancel).await?;

        let completion: ChatCompletion = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
            r = response.json() => r.map_err(|e| timeout_error(e, self.request_timeout))?,
        };
        completion_text(completion)
    }

    async fn stream(
        &self,
        request: &CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<RawChunkStream, ProviderError> {
        let body = self.body(request, true);
        let response = self.send(&body, cancel).await?;

        let stopped = cancel.clone().cancelled_owned();
        let byte_stream = response.bytes_stream().take_until(stopped);

        let chunk_stream = futures::stream::unfold(
            RawState {
                bytes: Box::pin(byte_stream),
                decoder: Utf8Decoder::default(),
                done: false,
            },
            |mut state| async move {
                loop {
                    if state.done {
                        return None;
                    }
                    match state.bytes.next().await {
                        Some(Ok(chunk)) => {
                            let text = state.decoder.push(&chunk);
                            if text.is_empty() {
                                continue;
                            }
                            return Some((Ok(text), state));
                        }
                        Some(Err(e)) => {
                            state.done = true;
                            return Some((Err(ProviderError::Http(e)), state));
                        }
                        None => {
                            state.done = true;
                            return state.decoder.finish().map(|tail| (Ok(tail), state));
                        }
                    }
                }
            },
        );

        Ok(Box::pin(chunk_stream))
    }
}

struct RawState {
    bytes: std::pin::Pin<Box<dyn futures::Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send>>,
    decoder: Utf8Decoder,
    done: bool,
}
