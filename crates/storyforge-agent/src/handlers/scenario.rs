//! Whole-scenario creation and rewrite, streamed.

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use storyforge_core::scenario::Scenario;
use storyforge_core::types::{Operation, ToolAction};

use super::{Handler, HandlerContext, HandlerOutput, Mode};
use crate::error::AgentError;
use crate::followups;
use crate::prompt;
use crate::streaming::Finalizer;

pub struct ScenarioHandler {
    pub mode: Mode,
}

#[async_trait]
impl Handler for ScenarioHandler {
    async fn handle(
        &self,
        ctx: &HandlerContext<'_>,
        op: &Operation,
        scenario: Option<&Scenario>,
    ) -> Result<HandlerOutput, AgentError> {
        // Modifying a scenario that does not exist yet creates it.
        let previous = match self.mode {
            Mode::Modify => scenario,
            Mode::Create => None,
        };
        let (action, mode) = match previous {
            Some(_) => (ToolAction::UpdateScenario, Mode::Modify),
            None => (ToolAction::CreateScenario, Mode::Create),
        };

        let prior = previous.cloned();
        let user_id = ctx.user_id.to_string();
        let finalize: Finalizer =
            Box::new(move |value| finalize_scenario(value, prior.as_ref(), &user_id));

        ctx.status(match mode {
            Mode::Create => "Drafting a new scenario...",
            Mode::Modify => "Rewriting the scenario...",
        })
        .await;

        let request = ctx
            .request(prompt::scenario_system(mode), prompt::scenario_user(op, previous))
            .with_json_mode();
        let streamed = ctx.stream(request, action, Some(finalize)).await?;

        if let Some(err) = streamed.error {
            return Ok(HandlerOutput::failed(
                "I wasn't able to build a scenario from that. Could you try describing it another way?",
                err,
            ));
        }
        let Some(entity) = streamed.entity else {
            return Ok(HandlerOutput::failed(
                "The scenario came back empty. Could you try again?",
                "no scenario in backend output",
            ));
        };
        let next: Scenario = serde_json::from_value(entity)
            .map_err(|e| AgentError::invalid("scenario", e.to_string()))?;
        debug!(
            title = %next.title,
            characters = next.characters.len(),
            locations = next.locations.len(),
            "Scenario built"
        );

        let response = match action {
            ToolAction::UpdateScenario => format!("Updated the scenario \"{}\".", next.title),
            _ => format!("Created the scenario \"{}\".", next.title),
        };
        ctx.say(&response).await;

        let follow_ups = followups::for_scenario(&next);
        Ok(HandlerOutput::reply(response)
            .with_scenario(next)
            .with_follow_ups(follow_ups))
    }
}

/// Turn the extracted object into a usable scenario: ids carried over from
/// `previous` by name, or assigned fresh.
fn finalize_scenario(
    value: Value,
    previous: Option<&Scenario>,
    user_id: &str,
) -> Result<Value, AgentError> {
    let value = value
        .get("scenario")
        .filter(|v| v.is_object())
        .cloned()
        .unwrap_or(value);
    let mut next: Scenario =
        serde_json::from_value(value).map_err(|e| AgentError::invalid("scenario", e.to_string()))?;

    match previous {
        Some(prev) => {
            next.carry_ids_from(prev, user_id);
            if next.title.trim().is_empty() {
                next.title = prev.title.clone();
            }
        }
        None => next.assign_missing_ids(user_id),
    }

    if next.title.trim().is_empty() && next.synopsis.trim().is_empty() && next.characters.is_empty() {
        return Err(AgentError::invalid("scenario", "no title, synopsis or characters"));
    }
    serde_json::to_value(&next).map_err(|e| AgentError::invalid("scenario", e.to_string()))
}
