//! Questions about the scenario, answered as streamed prose.

use async_trait::async_trait;
use serde_json::{Value, json};

use storyforge_core::scenario::{EntityKind, Scenario};
use storyforge_core::types::{Operation, Target, ToolAction};

use super::{Handler, HandlerContext, HandlerOutput, no_scenario_message};
use crate::disambiguate::{self, Pick};
use crate::error::AgentError;
use crate::followups;
use crate::prompt;

pub struct ExplainHandler {
    pub target: Target,
}

#[async_trait]
impl Handler for ExplainHandler {
    async fn handle(
        &self,
        ctx: &HandlerContext<'_>,
        op: &Operation,
        scenario: Option<&Scenario>,
    ) -> Result<HandlerOutput, AgentError> {
        let label = self.target.label();
        let Some(current) = scenario else {
            let msg = no_scenario_message(label);
            ctx.say(&msg).await;
            return Ok(HandlerOutput::reply(msg));
        };

        let focus = match self.focus(current, op) {
            Ok(focus) => focus,
            Err(question) => {
                ctx.say(&question).await;
                return Ok(HandlerOutput::reply(question));
            }
        };

        ctx.status(format!("Looking into the {label}...")).await;
        let request = ctx.request(
            prompt::explain_system(),
            prompt::explain_user(op, &focus, Some(current)),
        );
        let streamed = ctx.stream(request, ToolAction::Explain, None).await?;

        if let Some(err) = streamed.error {
            return Ok(HandlerOutput::failed(
                "I couldn't finish that explanation. Could you ask again?",
                err,
            ));
        }
        Ok(HandlerOutput::reply(streamed.text.trim())
            .with_follow_ups(followups::for_explain(self.target)))
    }
}

impl ExplainHandler {
    /// The slice of the scenario the question is about. `Err` carries a
    /// message for the user when the entity cannot be picked.
    fn focus(&self, scenario: &Scenario, op: &Operation) -> Result<Value, String> {
        let value = match self.target {
            Target::Character => {
                let names = scenario.character_names();
                let i = selected(disambiguate::pick(EntityKind::Character, &names, op))?;
                serde_json::to_value(&scenario.characters[i])
            }
            Target::Location => {
                let names = scenario.location_names();
                let i = selected(disambiguate::pick(EntityKind::Location, &names, op))?;
                serde_json::to_value(&scenario.locations[i])
            }
            Target::Backstory => Ok(json!(scenario.backstory)),
            Target::StoryArc => Ok(json!(scenario.story_arc)),
            Target::Notes => Ok(json!(scenario.notes)),
            Target::WritingStyle => serde_json::to_value(&scenario.writing_style),
            Target::Scenario | Target::General => serde_json::to_value(scenario),
        };
        Ok(value.unwrap_or(Value::Null))
    }
}

fn selected(pick: Pick) -> Result<usize, String> {
    match pick {
        Pick::Selected(i) => Ok(i),
        Pick::Clarify(msg) | Pick::Empty(msg) => Err(msg),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use storyforge_core::scenario::Location;
    use storyforge_core::types::Action;

    fn scenario() -> Scenario {
        Scenario {
            backstory: "An old war.".into(),
            locations: vec![
                Location {
                    name: "Harbor".into(),
                    ..Location::default()
                },
                Location {
                    name: "Spire".into(),
                    ..Location::default()
                },
            ],
            ..Scenario::default()
        }
    }

    #[test]
    fn test_focus_on_named_location() {
        let handler = ExplainHandler {
            target: Target::Location,
        };
        let op = Operation::new(Action::Details, Target::Location, "tell me about the Spire");
        assert_eq!(handler.focus(&scenario(), &op).unwrap()["name"], "Spire");
    }

    #[test]
    fn test_focus_asks_when_ambiguous() {
        let handler = ExplainHandler {
            target: Target::Location,
        };
        let op = Operation::new(Action::Details, Target::Location, "describe it");
        let question = handler.focus(&scenario(), &op).unwrap_err();
        assert!(question.contains("Harbor or Spire"));
    }

    #[test]
    fn test_focus_on_field() {
        let handler = ExplainHandler {
            target: Target::Backstory,
        };
        let op = Operation::new(Action::Details, Target::Backstory, "why the war?");
        assert_eq!(handler.focus(&scenario(), &op).unwrap(), json!("An old war."));
    }
}
