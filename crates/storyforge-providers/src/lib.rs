//! Completion backend abstraction.
//!
//! Each backend implements the [`LlmProvider`] trait: a whole-response
//! `complete` call and a `stream` call that yields the raw body chunks of an
//! incremental-delta response (`data: <json>` lines terminated by
//! `data: [DONE]`). Decoding those lines is the caller's job.

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use storyforge_core::config::Config;

pub mod error;
pub mod openai;
pub mod scripted;
mod utf8;

pub use error::ProviderError;
pub use openai::OpenAiProvider;
pub use scripted::ScriptedProvider;

/// Supported backend wire protocols.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelApi {
    OpenAiCompletions,
    Ollama,
    Scripted,
}

/// One message in a completion request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".into(),
            content: content.into(),
        }
    }
}

/// A request to the backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub max_tokens: u32,
    pub temperature: Option<f64>,
    pub system: Option<String>,
    /// Ask the backend to answer with a single JSON object.
    #[serde(default)]
    pub json_mode: bool,
}

impl CompletionRequest {
    pub fn new(model: impl Into<String>, max_tokens: u32) -> Self {
        Self {
            model: model.into(),
            messages: Vec::new(),
            max_tokens,
            temperature: None,
            system: None,
            json_mode: false,
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_temperature(mut self, temperature: Option<f64>) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_json_mode(mut self) -> Self {
        self.json_mode = true;
        self
    }

    pub fn push(mut self, message: ChatMessage) -> Self {
        self.messages.push(message);
        self
    }
}

/// Raw body chunks of a streaming response, already decoded to UTF-8.
pub type RawChunkStream = Pin<Box<dyn Stream<Item = Result<String, ProviderError>> + Send>>;

/// The backend collaborator.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Provider identifier (e.g., "openai", "ollama").
    fn id(&self) -> &str;

    /// API protocol used by this provider.
    fn api(&self) -> ModelApi;

    /// Run a completion and return the whole response text.
    async fn complete(
        &self,
        request: &CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<String, ProviderError>;

    /// Start a streaming completion. The returned stream ends early when
    /// `cancel` fires.
    async fn stream(
        &self,
        request: &CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<RawChunkStream, ProviderError>;
}

/// Build the provider described by the first `models.providers` entry.
pub fn from_config(config: &Config) -> Result<Arc<dyn LlmProvider>, ProviderError> {
    let Some(pc) = config.first_provider() else {
        return Err(ProviderError::Credentials(
            "no provider configured under models.providers".into(),
        ));
    };
    let base_url = pc.base_url.as_deref();

    let provider = match pc.id.as_str() {
        "ollama" => OpenAiProvider::ollama(base_url),
        "openrouter" => OpenAiProvider::openrouter(base_url, require_key(pc)?),
        "openai" => OpenAiProvider::openai(base_url, require_key(pc)?),
        other => {
            let Some(url) = base_url else {
                return Err(ProviderError::Credentials(format!(
                    "provider '{other}' needs a base_url"
                )));
            };
            OpenAiProvider::compatible(other, url, pc.resolve_api_key())
        }
    };
    Ok(Arc::new(provider.with_request_timeout(config.request_timeout())))
}

fn require_key(pc: &storyforge_core::config::ProviderConfig) -> Result<String, ProviderError> {
    pc.resolve_api_key().ok_or_else(|| {
        ProviderError::Credentials(format!("provider '{}' has no API key configured", pc.id))
    })
}
