//! Engine entry point.

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::info;

use storyforge_core::config::Config;
use storyforge_core::protocol::StreamingEvent;
use storyforge_core::scenario::Scenario;
use storyforge_core::types::{AgentRequest, Category, Operation};
use storyforge_providers::{LlmProvider, ProviderError};

use crate::settings::EngineSettings;
use crate::sink::EventSink;
use crate::state::AgentState;
use crate::supervisor::Supervisor;

/// What one run produced. The engine never persists anything: the caller
/// stores `scenario` when `scenario_changed` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentOutcome {
    pub run_id: String,
    pub response: String,
    pub scenario: Option<Scenario>,
    pub scenario_changed: bool,
    pub follow_up_questions: Vec<String>,
    pub operations: Vec<Operation>,
    pub category: Option<Category>,
    pub error: Option<String>,
    pub cancelled: bool,
}

impl AgentOutcome {
    fn from_state(run_id: String, state: AgentState, cancelled: bool) -> Self {
        Self {
            run_id,
            response: state.current_response,
            scenario: state.scenario,
            scenario_changed: state.scenario_changed,
            follow_up_questions: state.follow_up_questions,
            operations: state.operations,
            category: state.category,
            error: state.error,
            cancelled,
        }
    }
}

pub struct Engine {
    provider: Arc<dyn LlmProvider>,
    settings: EngineSettings,
}

impl Engine {
    pub fn new(provider: Arc<dyn LlmProvider>, settings: EngineSettings) -> Self {
        Self { provider, settings }
    }

    pub fn from_config(config: &Config) -> Result<Self, ProviderError> {
        let provider = storyforge_providers::from_config(config)?;
        Ok(Self::new(provider, EngineSettings::from_config(config)))
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn provider_id(&self) -> &str {
        self.provider.id()
    }

    /// Run one request to completion, emitting events through `sink`. The
    /// run stops early when the sink's cancellation token fires.
    pub async fn run(&self, request: AgentRequest, sink: &EventSink) -> AgentOutcome {
        let start = Instant::now();
        let run_id = uuid::Uuid::new_v4().to_string();
        let cancel = sink.cancel_token().clone();
        info!(
            %run_id,
            user_id = %request.user_id,
            precommitted = request.operations.is_some(),
            "Agent run started"
        );

        let supervisor = Supervisor::new(&self.provider, &self.settings, sink, &cancel);
        let state = supervisor.run(AgentState::new(request)).await;
        let failures = state.failures;
        let steps = state.steps;
        let outcome = AgentOutcome::from_state(run_id, state, cancel.is_cancelled());

        info!(
            run_id = %outcome.run_id,
            operations = outcome.operations.len(),
            failures,
            steps,
            scenario_changed = outcome.scenario_changed,
            cancelled = outcome.cancelled,
            duration_ms = start.elapsed().as_millis() as u64,
            "Agent run finished"
        );
        outcome
    }

    /// Run `request` on a background task. Dropping the handle's receiver
    /// cancels the run.
    pub fn spawn(self: &Arc<Self>, request: AgentRequest) -> RunHandle {
        let cancel = CancellationToken::new();
        let (sink, events) = EventSink::channel(self.settings.event_buffer, cancel.clone());
        let engine = Arc::clone(self);
        let outcome = tokio::spawn(async move { engine.run(request, &sink).await });
        RunHandle {
            events,
            outcome,
            cancel,
        }
    }
}

/// A run in progress.
pub struct RunHandle {
    pub events: mpsc::Receiver<StreamingEvent>,
    pub outcome: JoinHandle<AgentOutcome>,
    pub cancel: CancellationToken,
}

impl RunHandle {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Split into an event stream and the pending outcome.
    pub fn into_parts(self) -> (ReceiverStream<StreamingEvent>, JoinHandle<AgentOutcome>) {
        (ReceiverStream::new(self.events), self.outcome)
    }

    /// Drain every event, then wait for the outcome.
    pub async fn collect(mut self) -> Result<(Vec<StreamingEvent>, AgentOutcome), JoinError> {
        let mut events = Vec::new();
        while let Some(event) = self.events.recv().await {
            events.push(event);
        }
        let outcome = self.outcome.await?;
        Ok((events, outcome))
    }
}
