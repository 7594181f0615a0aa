//! Supervisor state machine.
//!
//! ```text
//! start ─► classify? ─► dispatch ─► handler ─► dispatch ─► wrap_up ─► end
//!                           │                                 ▲
//!                           └─► handler ─► advance ─► handler ┘   (multi-op)
//! ```
//!
//! Every step returns the next [`NodeId`]. The step guard and the wrap-up
//! fallback for unknown routes mean the loop always terminates.

use std::sync::Arc;

use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use storyforge_core::protocol::StreamingEvent;
use storyforge_core::types::Category;
use storyforge_providers::LlmProvider;

use crate::classify::{self, operations_json};
use crate::error::AgentError;
use crate::followups;
use crate::handlers::{HandlerContext, HandlerKind};
use crate::sequencer;
use crate::settings::EngineSettings;
use crate::sink::EventSink;
use crate::state::{AgentState, NodeId};

/// Generic follow-ups offered at wrap-up when handlers suggested none.
const GENERIC_FOLLOW_UPS: usize = 2;

pub struct Supervisor<'a> {
    provider: &'a Arc<dyn LlmProvider>,
    settings: &'a EngineSettings,
    sink: &'a EventSink,
    cancel: &'a CancellationToken,
}

impl<'a> Supervisor<'a> {
    pub fn new(
        provider: &'a Arc<dyn LlmProvider>,
        settings: &'a EngineSettings,
        sink: &'a EventSink,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            provider,
            settings,
            sink,
            cancel,
        }
    }

    /// Drive `state` from its current node to `End`. Returns early, without a
    /// completion event, when the run is cancelled.
    pub async fn run(&self, mut state: AgentState) -> AgentState {
        loop {
            if self.cancel.is_cancelled() {
                debug!(node = %state.next_node, "Run cancelled, stopping");
                break;
            }

            let mut node = state.next_node;
            if node == NodeId::End {
                break;
            }
            state.steps += 1;
            if state.steps > self.settings.max_steps && node != NodeId::WrapUp {
                warn!(steps = state.steps, node = %node, "Step limit reached, wrapping up");
                node = NodeId::WrapUp;
            }
            debug!(step = state.steps, node = %node, "Supervisor step");

            state.next_node = match node {
                NodeId::Start => self.start(&mut state),
                NodeId::Classify => self.classify(&mut state).await,
                NodeId::Dispatch => self.dispatch(&mut state),
                NodeId::Handler(kind) => self.handle(&mut state, kind).await,
                NodeId::Advance => sequencer::advance(&mut state),
                NodeId::WrapUp => self.wrap_up(&mut state).await,
                NodeId::End => NodeId::End,
            };
            state.streaming_events = self.sink.take_journal();
        }
        state
    }

    fn start(&self, state: &mut AgentState) -> NodeId {
        if state.scenario.is_none() {
            let embedded = state
                .conversation_history
                .first()
                .and_then(|turn| turn.scenario.clone());
            if embedded.is_some() {
                debug!("Using scenario embedded in conversation history");
                state.scenario = embedded;
            }
        }

        // Operations supplied with the request count as a finished classification.
        if state.category.is_none() && !state.operations.is_empty() {
            state.category = Some(Category::from_operations(&state.operations));
        }

        if state.category.is_none() {
            NodeId::Classify
        } else {
            NodeId::Dispatch
        }
    }

    async fn classify(&self, state: &mut AgentState) -> NodeId {
        if state.category.is_some() {
            return NodeId::Dispatch;
        }
        self.sink
            .emit(StreamingEvent::status("Working out what you'd like to do..."))
            .await;

        let result = classify::classify(
            self.provider.as_ref(),
            self.settings,
            &state.user_input,
            &state.conversation_history,
            state.scenario.as_ref(),
            self.cancel,
        )
        .await;

        state.category = Some(Category::from_operations(&result.operations));
        state.operations = result.operations;
        NodeId::Dispatch
    }

    fn dispatch(&self, state: &mut AgentState) -> NodeId {
        if state.operations.is_empty() {
            return NodeId::WrapUp;
        }
        if state.completed == 0 {
            return sequencer::begin(state);
        }
        if state.is_multi_operation() {
            sequencer::advance(state)
        } else {
            NodeId::WrapUp
        }
    }

    async fn handle(&self, state: &mut AgentState, kind: HandlerKind) -> NodeId {
        let index = state.current_operation_index;
        let Some(op) = state.current_operation().cloned() else {
            return NodeId::WrapUp;
        };

        if state.is_multi_operation() {
            self.sink
                .emit(
                    StreamingEvent::status(format!(
                        "Step {} of {}: {}",
                        index + 1,
                        state.operations.len(),
                        op.prompt
                    ))
                    .with_metadata("op_index", json!(index)),
                )
                .await;
        }

        let handler = kind.handler();
        let result = {
            let ctx = HandlerContext {
                provider: self.provider,
                settings: self.settings,
                sink: self.sink,
                cancel: self.cancel,
                user_id: &state.user_id,
                history: &state.conversation_history,
            };
            handler.handle(&ctx, &op, state.scenario.as_ref()).await
        };

        match result {
            Ok(output) => {
                debug!(op_index = index, route = %kind.tag(), changed = output.scenario.is_some(), "Handler finished");
                sequencer::record(state, output, self.settings.max_follow_ups);
            }
            Err(AgentError::Cancelled) => return NodeId::End,
            Err(err) => {
                warn!(op_index = index, route = %kind.tag(), %err, "Handler failed");
                self.sink
                    .emit(
                        StreamingEvent::error(err.kind(), err.to_string())
                            .with_metadata("op_index", json!(index)),
                    )
                    .await;
                sequencer::record_failure(state, &op, &err);
            }
        }

        if state.is_multi_operation() {
            NodeId::Advance
        } else {
            NodeId::Dispatch
        }
    }

    async fn wrap_up(&self, state: &mut AgentState) -> NodeId {
        sequencer::finish(state);
        if state.follow_up_questions.is_empty() {
            followups::merge(
                &mut state.follow_up_questions,
                followups::generic(state.scenario.as_ref()),
                GENERIC_FOLLOW_UPS.min(self.settings.max_follow_ups),
            );
        }

        if !self.cancel.is_cancelled() {
            let event = StreamingEvent::completion(state.current_response.clone(), completion_metadata(state));
            self.sink.emit(event).await;
        }
        NodeId::End
    }
}

/// Summary carried by the final `completion` event. The scenario is only
/// included when a handler changed it.
pub fn completion_metadata(state: &AgentState) -> Value {
    let mut metadata = json!({
        "category": state.category,
        "operations": operations_json(&state.operations),
        "follow_up_questions": state.follow_up_questions,
        "scenario_changed": state.scenario_changed,
        "error": state.error,
    });
    if state.scenario_changed {
        if let (Some(map), Some(scenario)) = (metadata.as_object_mut(), state.scenario.as_ref()) {
            map.insert(
                "scenario".into(),
                serde_json::to_value(scenario).unwrap_or(Value::Null),
            );
        }
    }
    metadata
}
