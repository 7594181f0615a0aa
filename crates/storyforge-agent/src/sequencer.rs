//! Operation sequencer.
//!
//! Walks the operation list one handler at a time. A failed operation only
//! contributes an apology line; the index still advances and the next
//! operation runs.

use tracing::debug;

use storyforge_core::types::{Action, Operation};

use crate::error::AgentError;
use crate::followups;
use crate::handlers::{HandlerKind, HandlerOutput};
use crate::state::{AgentState, NodeId};

/// Route the first operation.
pub fn begin(state: &mut AgentState) -> NodeId {
    state.current_operation_index = 0;
    route_current(state)
}

/// Step past the operation that just finished. Past the end of the list the
/// sequence is over and control goes to wrap-up.
pub fn advance(state: &mut AgentState) -> NodeId {
    if state.current_operation_index < state.operations.len() {
        state.current_operation_index += 1;
    }
    route_current(state)
}

fn route_current(state: &mut AgentState) -> NodeId {
    let Some(op) = state.current_operation() else {
        debug!(total = state.operations.len(), "Operation sequence finished");
        return NodeId::WrapUp;
    };
    let (action, target) = (op.action, op.target);
    let kind = HandlerKind::for_operation(op);
    state.action = Some(action);
    state.target = Some(target);
    debug!(
        op_index = state.current_operation_index,
        action = action.as_str(),
        target = target.as_str(),
        route = %kind.tag(),
        "Routing operation"
    );
    NodeId::Handler(kind)
}

/// Fold a handler's output into the state.
pub fn record(state: &mut AgentState, output: HandlerOutput, max_follow_ups: usize) {
    state.completed += 1;
    if !output.response.trim().is_empty() {
        state.responses.push(output.response);
    }
    followups::merge(&mut state.follow_up_questions, output.follow_ups, max_follow_ups);
    if let Some(scenario) = output.scenario {
        state.scenario = Some(scenario);
        state.scenario_changed = true;
    }
    if let Some(err) = output.error {
        state.failures += 1;
        state.error.get_or_insert(err);
    }
}

/// Record a handler that returned an error instead of an output.
pub fn record_failure(state: &mut AgentState, op: &Operation, err: &AgentError) {
    state.completed += 1;
    state.failures += 1;
    state.error.get_or_insert_with(|| err.to_string());
    state.responses.push(apology(op));
}

fn apology(op: &Operation) -> String {
    let what = op.target.label();
    match op.action {
        Action::Creation => format!("Sorry, I ran into a problem creating the {what}. Please try that part again."),
        Action::Modification => format!("Sorry, I ran into a problem changing the {what}. Please try that part again."),
        _ => "Sorry, I ran into a problem answering that. Please try again.".to_string(),
    }
}

/// Join every handler's response into the final reply.
pub fn finish(state: &mut AgentState) {
    state.current_response = state.responses.join("\n\n");
}
