//! Per-request state and the closed set of supervisor nodes.

use std::fmt;

use storyforge_core::protocol::StreamingEvent;
use storyforge_core::scenario::{EntityKind, Scenario};
use storyforge_core::types::{Action, AgentRequest, Category, Operation, Target, Turn};

use crate::handlers::{HandlerKind, Mode};

/// The record threaded through every supervisor step of one request. Created
/// fresh per request and dropped once the outcome has been built.
#[derive(Debug, Clone)]
pub struct AgentState {
    pub user_input: String,
    pub user_id: String,
    pub scenario: Option<Scenario>,
    /// Whether any handler produced a new scenario version.
    pub scenario_changed: bool,
    pub conversation_history: Vec<Turn>,
    /// Set once per request. A present category means classification is done.
    pub category: Option<Category>,
    pub action: Option<Action>,
    pub target: Option<Target>,
    pub operations: Vec<Operation>,
    pub current_operation_index: usize,
    /// Handlers that have run so far, successful or not.
    pub completed: usize,
    pub current_response: String,
    pub responses: Vec<String>,
    pub follow_up_questions: Vec<String>,
    /// Events emitted during the most recent step.
    pub streaming_events: Vec<StreamingEvent>,
    pub next_node: NodeId,
    pub error: Option<String>,
    pub failures: usize,
    pub steps: usize,
}

impl AgentState {
    pub fn new(request: AgentRequest) -> Self {
        Self {
            user_input: request.user_input,
            user_id: request.user_id,
            scenario: request.scenario,
            scenario_changed: false,
            conversation_history: request.conversation_history,
            category: None,
            action: None,
            target: None,
            operations: request.operations.unwrap_or_default(),
            current_operation_index: 0,
            completed: 0,
            current_response: String::new(),
            responses: Vec::new(),
            follow_up_questions: Vec::new(),
            streaming_events: Vec::new(),
            next_node: NodeId::Start,
            error: None,
            failures: 0,
            steps: 0,
        }
    }

    pub fn is_multi_operation(&self) -> bool {
        self.operations.len() > 1
    }

    pub fn current_operation(&self) -> Option<&Operation> {
        self.operations.get(self.current_operation_index)
    }
}

/// Supervisor nodes. Handler routes are carried inside `Handler` so every
/// transition is checked exhaustively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeId {
    Start,
    Classify,
    Dispatch,
    Handler(HandlerKind),
    Advance,
    WrapUp,
    End,
}

impl NodeId {
    /// Parse a routing tag. `handler:<action>:<target>` names a handler
    /// route; anything unrecognised goes to wrap-up.
    pub fn from_tag(tag: &str) -> Self {
        match tag.trim() {
            "start" => NodeId::Start,
            "classify" => NodeId::Classify,
            "dispatch" => NodeId::Dispatch,
            "advance" | "sequencer" => NodeId::Advance,
            "wrap_up" | "wrapup" => NodeId::WrapUp,
            "end" => NodeId::End,
            other => {
                let route = other.strip_prefix("handler:").and_then(|rest| {
                    let (action, target) = rest.split_once(':')?;
                    Some((Action::parse(action)?, Target::parse(target)?))
                });
                match route {
                    Some((action, target)) => NodeId::Handler(HandlerKind::route(action, target)),
                    None => NodeId::WrapUp,
                }
            }
        }
    }

    pub fn tag(&self) -> String {
        match self {
            NodeId::Start => "start".into(),
            NodeId::Classify => "classify".into(),
            NodeId::Dispatch => "dispatch".into(),
            NodeId::Handler(kind) => {
                let (action, target) = route_key(kind);
                format!("handler:{}:{}", action.as_str(), target.as_str())
            }
            NodeId::Advance => "advance".into(),
            NodeId::WrapUp => "wrap_up".into(),
            NodeId::End => "end".into(),
        }
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.tag())
    }
}

/// A representative (action, target) pair that routes to `kind`.
fn route_key(kind: &HandlerKind) -> (Action, Target) {
    let action = |mode: &Mode| match mode {
        Mode::Create => Action::Creation,
        Mode::Modify => Action::Modification,
    };
    match kind {
        HandlerKind::Explain(target) => (Action::Details, *target),
        HandlerKind::Entity(EntityKind::Character, mode) => (action(mode), Target::Character),
        HandlerKind::Entity(EntityKind::Location, mode) => (action(mode), Target::Location),
        HandlerKind::Field(field, mode) => (action(mode), field.target()),
        HandlerKind::Scenario(mode) => (action(mode), Target::Scenario),
        HandlerKind::Chat => (Action::GeneralConversation, Target::General),
    }
}
