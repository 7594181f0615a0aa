//! In-memory provider that replays queued replies.
//!
//! Both `complete` and `stream` pop from the same FIFO queue, so a test can
//! script an entire request (classification call, then handler calls) in
//! order. Streamed replies are framed exactly like an OpenAI-compatible
//! stream: `data: {"choices":[{"delta":{"content":...}}]}` lines and a final
//! `data: [DONE]`.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::{CompletionRequest, LlmProvider, ModelApi, ProviderError, RawChunkStream};

#[derive(Debug, Clone)]
enum Scripted {
    Reply(String),
    Raw(Vec<String>),
    Fail(String),
    Stall,
}

pub struct ScriptedProvider {
    queue: Mutex<VecDeque<Scripted>>,
    requests: Mutex<Vec<CompletionRequest>>,
    chunk_chars: usize,
}

impl Default for ScriptedProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            chunk_chars: 4,
        }
    }

    /// Number of characters per streamed delta.
    pub fn with_chunk_chars(mut self, n: usize) -> Self {
        self.chunk_chars = n.max(1);
        self
    }

    /// Queue a reply. Streamed, it is split into several deltas.
    pub fn reply(self, text: impl Into<String>) -> Self {
        self.enqueue(Scripted::Reply(text.into()));
        self
    }

    /// Queue raw body chunks for a streaming call, passed through verbatim.
    pub fn raw_chunks<I, S>(self, chunks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.enqueue(Scripted::Raw(chunks.into_iter().map(Into::into).collect()));
        self
    }

    /// Queue a transport failure.
    pub fn fail(self, message: impl Into<String>) -> Self {
        self.enqueue(Scripted::Fail(message.into()));
        self
    }

    /// Queue a call that never answers until cancelled.
    pub fn stall(self) -> Self {
        self.enqueue(Scripted::Stall);
        self
    }

    /// Requests received so far, in call order.
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn remaining(&self) -> usize {
        self.queue.lock().map(|q| q.len()).unwrap_or(0)
    }

    fn enqueue(&self, item: Scripted) {
        if let Ok(mut queue) = self.queue.lock() {
            queue.push_back(item);
        }
    }

    fn next(&self, request: &CompletionRequest, call: &str) -> Result<Scripted, ProviderError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }
        self.queue
            .lock()
            .ok()
            .and_then(|mut q| q.pop_front())
            .ok_or_else(|| ProviderError::Exhausted(call.to_string()))
    }

    fn frame(&self, text: &str) -> Vec<String> {
        let chars: Vec<char> = text.chars().collect();
        let mut frames: Vec<String> = chars
            .chunks(self.chunk_chars)
            .map(|piece| {
                let delta: String = piece.iter().collect();
                let payload = json!({"choices": [{"delta": {"content": delta}}]});
                format!("data: {payload}\n\n")
            })
            .collect();
        frames.push("data: [DONE]\n\n".to_string());
        frames
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    fn id(&self) -> &str {
        "scripted"
    }

    fn api(&self) -> ModelApi {
        ModelApi::Scripted
    }

    async fn complete(
        &self,
        request: &CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<String, ProviderError> {
        if cancel.is_cancelled() {
            return Err(ProviderError::Cancelled);
        }
        match self.next(request, "complete")? {
            Scripted::Reply(text) => Ok(text),
            Scripted::Raw(chunks) => Ok(chunks.concat()),
            Scripted::Fail(message) => Err(ProviderError::Protocol(message)),
            Scripted::Stall => {
                cancel.cancelled().await;
                Err(ProviderError::Cancelled)
            }
        }
    }

    async fn stream(
        &self,
        request: &CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<RawChunkStream, ProviderError> {
        if cancel.is_cancelled() {
            return Err(ProviderError::Cancelled);
        }
        let frames = match self.next(request, "stream")? {
            Scripted::Reply(text) => self.frame(&text),
            Scripted::Raw(chunks) => chunks,
            Scripted::Fail(message) => return Err(ProviderError::Protocol(message)),
            Scripted::Stall => {
                let stalled = futures::stream::pending::<Result<String, ProviderError>>()
                    .take_until(cancel.clone().cancelled_owned());
                return Ok(Box::pin(stalled));
            }
        };
        let stream = futures::stream::iter(frames.into_iter().map(Ok))
            .take_until(cancel.clone().cancelled_owned());
        Ok(Box::pin(stream))
    }
}
