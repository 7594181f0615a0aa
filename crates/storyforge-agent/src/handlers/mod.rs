//! Specialized handlers, one per (action, target) route.
//!
//! Every handler reads the operation and a borrowed scenario snapshot and
//! returns a [`HandlerOutput`]. A changed scenario is always a new value built
//! from a copy; the snapshot it was derived from is never touched.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use storyforge_core::protocol::{EventType, StreamingEvent};
use storyforge_core::scenario::{EntityKind, Scenario};
use storyforge_core::types::{Action, Operation, Target, ToolAction, ToolCall, Turn};
use storyforge_providers::{ChatMessage, CompletionRequest, LlmProvider, ProviderError};

use crate::error::AgentError;
use crate::settings::EngineSettings;
use crate::sink::EventSink;
use crate::streaming::{self, Finalizer};

pub mod chat;
pub mod entity;
pub mod explain;
pub mod field;
pub mod scenario;

pub use chat::ChatHandler;
pub use entity::EntityHandler;
pub use explain::ExplainHandler;
pub use field::FieldHandler;
pub use scenario::ScenarioHandler;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    Create,
    Modify,
}

impl Mode {
    fn of(action: Action) -> Self {
        if action == Action::Creation {
            Mode::Create
        } else {
            Mode::Modify
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Create => "create",
            Mode::Modify => "modify",
        }
    }
}

/// Single-valued scenario fields with their own handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScenarioField {
    Backstory,
    StoryArc,
    WritingStyle,
    Notes,
}

impl ScenarioField {
    pub fn target(&self) -> Target {
        match self {
            ScenarioField::Backstory => Target::Backstory,
            ScenarioField::StoryArc => Target::StoryArc,
            ScenarioField::WritingStyle => Target::WritingStyle,
            ScenarioField::Notes => Target::Notes,
        }
    }
}

/// Closed set of handler routes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerKind {
    Explain(Target),
    Entity(EntityKind, Mode),
    Field(ScenarioField, Mode),
    Scenario(Mode),
    Chat,
}

impl HandlerKind {
    pub fn route(action: Action, target: Target) -> Self {
        match (action, target) {
            (Action::GeneralConversation, _) | (_, Target::General) => HandlerKind::Chat,
            (Action::Details, target) => HandlerKind::Explain(target),
            (action, Target::Character) => HandlerKind::Entity(EntityKind::Character, Mode::of(action)),
            (action, Target::Location) => HandlerKind::Entity(EntityKind::Location, Mode::of(action)),
            (action, Target::Backstory) => HandlerKind::Field(ScenarioField::Backstory, Mode::of(action)),
            (action, Target::StoryArc) => HandlerKind::Field(ScenarioField::StoryArc, Mode::of(action)),
            (action, Target::WritingStyle) => {
                HandlerKind::Field(ScenarioField::WritingStyle, Mode::of(action))
            }
            (action, Target::Notes) => HandlerKind::Field(ScenarioField::Notes, Mode::of(action)),
            (action, Target::Scenario) => HandlerKind::Scenario(Mode::of(action)),
        }
    }

    pub fn for_operation(op: &Operation) -> Self {
        Self::route(op.action, op.target)
    }

    pub fn tag(&self) -> String {
        match self {
            HandlerKind::Explain(t) => format!("explain:{}", t.as_str()),
            HandlerKind::Entity(k, m) => format!("{}:{}", k.label(), m.as_str()),
            HandlerKind::Field(f, m) => format!("{}:{}", f.target().as_str(), m.as_str()),
            HandlerKind::Scenario(m) => format!("scenario:{}", m.as_str()),
            HandlerKind::Chat => "chat".to_string(),
        }
    }

    /// Whether the handler streams backend output through the executor.
    pub fn is_streaming(&self) -> bool {
        matches!(
            self,
            HandlerKind::Explain(_) | HandlerKind::Scenario(_) | HandlerKind::Chat
        )
    }

    pub fn handler(&self) -> Box<dyn Handler> {
        match *self {
            HandlerKind::Explain(target) => Box::new(ExplainHandler { target }),
            HandlerKind::Entity(kind, mode) => Box::new(EntityHandler { kind, mode }),
            HandlerKind::Field(field, mode) => Box::new(FieldHandler { field, mode }),
            HandlerKind::Scenario(mode) => Box::new(ScenarioHandler { mode }),
            HandlerKind::Chat => Box::new(ChatHandler),
        }
    }
}

/// Everything a handler may use besides the operation and the scenario.
pub struct HandlerContext<'a> {
    pub provider: &'a Arc<dyn LlmProvider>,
    pub settings: &'a EngineSettings,
    pub sink: &'a EventSink,
    pub cancel: &'a CancellationToken,
    pub user_id: &'a str,
    pub history: &'a [Turn],
}

impl HandlerContext<'_> {
    pub(crate) fn request(&self, system: String, user: String) -> CompletionRequest {
        CompletionRequest::new(self.settings.model.clone(), self.settings.max_tokens)
            .with_system(system)
            .with_temperature(self.settings.temperature)
            .push(ChatMessage::user(user))
    }

    pub(crate) async fn complete(&self, request: &CompletionRequest) -> Result<String, AgentError> {
        let limit = self.settings.request_timeout;
        match tokio::time::timeout(limit, self.provider.complete(request, self.cancel)).await {
            Ok(reply) => Ok(reply?),
            Err(_) => Err(ProviderError::Timeout(limit).into()),
        }
    }

    pub(crate) async fn status(&self, text: impl Into<String>) {
        self.sink.emit(StreamingEvent::status(text)).await;
    }

    /// Send a whole reply as one chat event.
    pub(crate) async fn say(&self, text: &str) {
        self.sink.emit(StreamingEvent::chat(text)).await;
    }

    /// Tell the caller to apply `next`. A scenario that did not exist before
    /// is announced as `create_scenario`.
    pub(crate) async fn emit_scenario(&self, previous: Option<&Scenario>, next: &Scenario) {
        let action = if previous.is_some() {
            ToolAction::UpdateScenario
        } else {
            ToolAction::CreateScenario
        };
        let entity = serde_json::to_value(next).unwrap_or_else(|_| json!({}));
        let mut parameters = serde_json::Map::new();
        parameters.insert(action.result_key().to_string(), entity);
        let event = StreamingEvent::tool_call(action, Value::Object(parameters))
            .with_metadata("status", json!("completed"));
        self.sink.emit(event).await;
    }

    /// Run a streaming tool call, forwarding every event to the sink.
    pub(crate) async fn stream(
        &self,
        request: CompletionRequest,
        action: ToolAction,
        finalize: Option<Finalizer>,
    ) -> Result<Streamed, AgentError> {
        let call = ToolCall::new(action, json!({ "model": request.model }));
        let events = streaming::execute(
            Arc::clone(self.provider),
            request,
            call,
            finalize,
            self.settings.request_timeout,
            self.cancel.clone(),
        );
        futures::pin_mut!(events);

        let mut out = Streamed::default();
        while let Some(event) = events.next().await {
            match event.event_type {
                EventType::Chat => out.text.push_str(&event.content),
                EventType::ToolCall => {
                    out.entity = event
                        .metadata
                        .pointer(&format!("/parameters/{}", action.result_key()))
                        .cloned();
                }
                EventType::Error => out.error = Some(event.content.clone()),
                _ => {}
            }
            self.sink.emit(event).await;
        }

        if self.cancel.is_cancelled() {
            return Err(AgentError::Cancelled);
        }
        Ok(out)
    }
}

/// What a streamed tool call produced.
#[derive(Debug, Default)]
pub struct Streamed {
    pub text: String,
    pub entity: Option<Value>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct HandlerOutput {
    pub response: String,
    /// The new scenario version, when the handler changed it.
    pub scenario: Option<Scenario>,
    pub follow_ups: Vec<String>,
    /// Set when the handler degraded to a user-facing failure message.
    pub error: Option<String>,
}

impl HandlerOutput {
    pub fn reply(response: impl Into<String>) -> Self {
        Self {
            response: response.into(),
            ..Self::default()
        }
    }

    pub fn failed(response: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            response: response.into(),
            error: Some(error.into()),
            ..Self::default()
        }
    }

    pub fn with_scenario(mut self, scenario: Scenario) -> Self {
        self.scenario = Some(scenario);
        self
    }

    pub fn with_follow_ups(mut self, follow_ups: Vec<String>) -> Self {
        self.follow_ups = follow_ups;
        self
    }
}

#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(
        &self,
        ctx: &HandlerContext<'_>,
        op: &Operation,
        scenario: Option<&Scenario>,
    ) -> Result<HandlerOutput, AgentError>;
}

/// The message used when an operation needs a scenario and there is none.
pub(crate) fn no_scenario_message(what: &str) -> String {
    format!("There's no scenario yet, so there is no {what} to work with. Would you like me to create a new scenario first?")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_is_total_over_closed_sets() {
        for action in Action::ALL {
            for target in Target::ALL {
                let kind = HandlerKind::route(action, target);
                if action == Action::GeneralConversation || target == Target::General {
                    assert_eq!(kind, HandlerKind::Chat);
                }
            }
        }
    }

    #[test]
    fn test_route_examples() {
        assert_eq!(
            HandlerKind::route(Action::Creation, Target::Character),
            HandlerKind::Entity(EntityKind::Character, Mode::Create)
        );
        assert_eq!(
            HandlerKind::route(Action::Modification, Target::WritingStyle),
            HandlerKind::Field(ScenarioField::WritingStyle, Mode::Modify)
        );
        assert_eq!(
            HandlerKind::route(Action::Details, Target::Location),
            HandlerKind::Explain(Target::Location)
        );
        assert_eq!(
            HandlerKind::route(Action::Creation, Target::Scenario),
            HandlerKind::Scenario(Mode::Create)
        );
    }

    #[test]
    fn test_tags() {
        assert_eq!(
            HandlerKind::Entity(EntityKind::Location, Mode::Modify).tag(),
            "location:modify"
        );
        assert!(HandlerKind::Chat.is_streaming());
        assert!(!HandlerKind::Field(ScenarioField::Notes, Mode::Create).is_streaming());
    }
}
