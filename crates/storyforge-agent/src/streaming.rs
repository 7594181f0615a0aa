//! Streaming tool executor.
//!
//! Consumes the backend's incremental-delta protocol (`data: <json>` lines,
//! terminated by `data: [DONE]`) and re-emits every delta as a `chat` event
//! the moment it is decoded. For entity-yielding actions the accumulated text
//! is run through the extractor once the stream ends, producing either one
//! `tool_call` event with the entity or one `error` event.

use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use storyforge_core::protocol::StreamingEvent;
use storyforge_core::types::{ToolCall, ToolCallStatus};
use storyforge_providers::{CompletionRequest, LlmProvider, ProviderError};

use crate::error::AgentError;
use crate::extract::extract;

/// Post-processing applied to the extracted entity before it is emitted.
pub type Finalizer = Box<dyn FnOnce(Value) -> Result<Value, AgentError> + Send>;

/// One decoded protocol line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Line {
    Delta(String),
    Done,
    Skip,
}

/// Decode one line of the delta protocol. Malformed lines are skipped.
pub fn parse_line(line: &str) -> Line {
    let line = line.trim();
    let Some(payload) = line.strip_prefix("data:") else {
        return Line::Skip;
    };
    let payload = payload.trim();
    if payload == "[DONE]" {
        return Line::Done;
    }

    let value: Value = match serde_json::from_str(payload) {
        Ok(v) => v,
        Err(e) => {
            trace!(%e, payload, "Skipping malformed stream line");
            return Line::Skip;
        }
    };

    let delta = value
        .pointer("/choices/0/delta/content")
        .or_else(|| value.pointer("/choices/0/text"))
        .or_else(|| value.get("content"))
        .or_else(|| value.get("delta"))
        .or_else(|| value.get("text"))
        .and_then(Value::as_str);

    match delta {
        Some(d) if !d.is_empty() => Line::Delta(d.to_string()),
        _ => Line::Skip,
    }
}

/// Splits arbitrary chunks into complete lines.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buffer: String,
}

impl LineBuffer {
    pub fn push(&mut self, chunk: &str) -> Vec<String> {
        self.buffer.push_str(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=pos).collect();
            lines.push(line.trim_end_matches(['\n', '\r']).to_string());
        }
        lines
    }

    /// A trailing line that never got its newline.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        if rest.trim().is_empty() { None } else { Some(rest) }
    }
}

/// Run `call` as a streaming completion. The returned stream is finite,
/// yields events in backend delta order and is not restartable. It ends
/// without a final event when `cancel` fires. Waiting longer than `idle` for
/// the stream to open, or for its next chunk, ends it with an `error` event.
pub fn execute(
    provider: Arc<dyn LlmProvider>,
    request: CompletionRequest,
    mut call: ToolCall,
    finalize: Option<Finalizer>,
    idle: Duration,
    cancel: CancellationToken,
) -> impl Stream<Item = StreamingEvent> + Send + 'static {
    async_stream::stream! {
        call.status = ToolCallStatus::Executing;
        debug!(action = call.action.as_str(), "Streaming tool call");

        let started = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            r = tokio::time::timeout(idle, provider.stream(&request, &cancel)) => {
                r.unwrap_or(Err(ProviderError::Timeout(idle)))
            }
        };
        let mut chunks = match started {
            Ok(s) => s,
            Err(e) => {
                call.status = ToolCallStatus::Failed;
                let err = AgentError::from(e);
                if !matches!(err, AgentError::Cancelled) {
                    warn!(%err, "Streaming call failed to start");
                    yield StreamingEvent::error(err.kind(), err.to_string());
                }
                return;
            }
        };

        let mut lines = LineBuffer::default();
        let mut accumulated = String::new();
        let mut done = false;

        while !done {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                c = tokio::time::timeout(idle, chunks.next()) => {
                    c.unwrap_or(Some(Err(ProviderError::Timeout(idle))))
                }
            };
            let chunk = match next {
                Some(Ok(chunk)) => chunk,
                Some(Err(e)) => {
                    call.status = ToolCallStatus::Failed;
                    let err = AgentError::from(e);
                    warn!(%err, "Stream broke mid-flight");
                    yield StreamingEvent::error(err.kind(), err.to_string());
                    return;
                }
                None => {
                    if let Some(tail) = lines.finish() {
                        if let Line::Delta(delta) = parse_line(&tail) {
                            accumulated.push_str(&delta);
                            yield StreamingEvent::chat(delta);
                        }
                    }
                    break;
                }
            };

            for line in lines.push(&chunk) {
                match parse_line(&line) {
                    Line::Delta(delta) => {
                        accumulated.push_str(&delta);
                        yield StreamingEvent::chat(delta);
                        tokio::task::yield_now().await;
                    }
                    Line::Done => {
                        done = true;
                        break;
                    }
                    Line::Skip => {}
                }
            }
        }

        if cancel.is_cancelled() {
            return;
        }

        if !call.action.yields_entity() {
            call.status = ToolCallStatus::Completed;
            return;
        }

        let entity = extract(&accumulated, &[], Some(&json!({})))
            .map_err(AgentError::from)
            .and_then(|value| match finalize {
                Some(f) => f(value),
                None => Ok(value),
            });

        match entity {
            Ok(entity) => {
                call.status = ToolCallStatus::Completed;
                let mut parameters = serde_json::Map::new();
                parameters.insert(call.action.result_key().to_string(), entity);
                yield StreamingEvent::tool_call(call.action, Value::Object(parameters))
                    .with_metadata("status", json!(call.status));
            }
            Err(err) => {
                call.status = ToolCallStatus::Failed;
                warn!(%err, chars = accumulated.len(), "Post-stream extraction failed");
                yield StreamingEvent::error(err.kind(), err.to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use storyforge_core::protocol::EventType;
    use storyforge_core::types::ToolAction;
    use storyforge_providers::ScriptedProvider;

    fn request() -> CompletionRequest {
        CompletionRequest::new("m", 100)
    }

    async fn collect(
        provider: ScriptedProvider,
        action: ToolAction,
        finalize: Option<Finalizer>,
    ) -> Vec<StreamingEvent> {
        execute(
            Arc::new(provider),
            request(),
            ToolCall::new(action, json!({})),
            finalize,
            Duration::from_secs(5),
            CancellationToken::new(),
        )
        .collect()
        .await
    }

    #[test]
    fn test_parse_line_variants() {
        assert_eq!(
            parse_line(r#"data: {"choices":[{"delta":{"content":"Hi"}}]}"#),
            Line::Delta("Hi".into())
        );
        assert_eq!(parse_line(r#"data: {"content":"x"}"#), Line::Delta("x".into()));
        assert_eq!(parse_line("data: [DONE]"), Line::Done);
        assert_eq!(parse_line("data: {not json"), Line::Skip);
        assert_eq!(parse_line(": keep-alive"), Line::Skip);
        assert_eq!(parse_line(r#"data: {"choices":[{"delta":{}}]}"#), Line::Skip);
    }

    #[test]
    fn test_line_buffer_joins_split_lines() {
        let mut buf = LineBuffer::default();
        assert!(buf.push("data: {\"con").is_empty());
        let lines = buf.push("tent\":\"a\"}\r\ndata: [DO");
        assert_eq!(lines, vec![r#"data: {"content":"a"}"#]);
        assert_eq!(buf.finish().as_deref(), Some("data: [DO"));
    }

    #[tokio::test]
    async fn test_chat_events_concatenate_to_full_text() {
        let text = "Once upon a time, in a harbor town.";
        let provider = ScriptedProvider::new().with_chunk_chars(3).reply(text);
        let events = collect(provider, ToolAction::Explain, None).await;

        assert!(events.iter().all(|e| e.event_type == EventType::Chat));
        assert!(events.len() > 5);
        let joined: String = events.iter().map(|e| e.content.as_str()).collect();
        assert_eq!(joined, text);
    }

    #[tokio::test]
    async fn test_malformed_lines_skipped_and_done_stops() {
        let provider = ScriptedProvider::new().raw_chunks([
            "data: {\"content\":\"a\"}\n\ndata: garbage\n",
            "data: {\"content\":\"b\"}\n",
            "data: [DONE]\n",
            "data: {\"content\":\"after\"}\n",
        ]);
        let events = collect(provider, ToolAction::Chat, None).await;
        let joined: String = events.iter().map(|e| e.content.as_str()).collect();
        assert_eq!(joined, "ab");
    }

    #[tokio::test]
    async fn test_entity_action_emits_tool_call_with_parsed_entity() {
        let json_text = r#"{"title": "Dusk", "characters": []}"#;
        let provider = ScriptedProvider::new().reply(json_text);
        let events = collect(provider, ToolAction::CreateScenario, None).await;

        let last = events.last().unwrap();
        assert_eq!(last.event_type, EventType::ToolCall);
        assert_eq!(last.content, "create_scenario");
        assert_eq!(last.metadata["parameters"]["scenario"]["title"], "Dusk");
        assert_eq!(last.metadata["status"], "completed");

        let joined: String = events
            .iter()
            .filter(|e| e.event_type == EventType::Chat)
            .map(|e| e.content.as_str())
            .collect();
        assert_eq!(joined, json_text);
    }

    #[tokio::test]
    async fn test_extraction_failure_emits_error_not_entity() {
        let provider = ScriptedProvider::new().reply("Sorry, I can't help with that.");
        let events = collect(provider, ToolAction::UpdateScenario, None).await;
        let last = events.last().unwrap();
        assert_eq!(last.event_type, EventType::Error);
        assert_eq!(last.metadata["kind"], "extraction");
        assert!(!events.iter().any(|e| e.event_type == EventType::ToolCall));
    }

    #[tokio::test]
    async fn test_finalizer_rejection_is_error() {
        let provider = ScriptedProvider::new().reply(r#"{"title": ""}"#);
        let finalize: Finalizer = Box::new(|_| Err(AgentError::invalid("scenario", "no title")));
        let events = collect(provider, ToolAction::CreateScenario, Some(finalize)).await;
        assert_eq!(events.last().unwrap().metadata["kind"], "invalid_entity");
    }

    #[tokio::test]
    async fn test_start_failure_is_single_error_event() {
        let provider = ScriptedProvider::new().fail("connection reset");
        let events = collect(provider, ToolAction::Chat, None).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::Error);
        assert_eq!(events[0].metadata["kind"], "backend");
    }

    #[tokio::test]
    async fn test_cancel_ends_stream_without_final_event() {
        let provider = ScriptedProvider::new().stall();
        let cancel = CancellationToken::new();
        let stream = execute(
            Arc::new(provider),
            request(),
            ToolCall::new(ToolAction::CreateScenario, json!({})),
            None,
            Duration::from_secs(5),
            cancel.clone(),
        );
        cancel.cancel();
        let events: Vec<StreamingEvent> = stream.collect().await;
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn test_stalled_stream_times_out_with_error_event() {
        let events: Vec<StreamingEvent> = execute(
            Arc::new(ScriptedProvider::new().stall()),
            request(),
            ToolCall::new(ToolAction::Chat, json!({})),
            None,
            Duration::from_millis(50),
            CancellationToken::new(),
        )
        .collect()
        .await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::Error);
        assert_eq!(events[0].metadata["kind"], "backend");
        assert!(events[0].content.contains("did not answer"));
    }
}
