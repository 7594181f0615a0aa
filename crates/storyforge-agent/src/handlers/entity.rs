//! Character and location creation/modification.

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{debug, warn};

use storyforge_core::scenario::{Character, EntityKind, Location, Scenario};
use storyforge_core::types::Operation;

use super::{Handler, HandlerContext, HandlerOutput, Mode, no_scenario_message};
use crate::disambiguate::{self, Pick};
use crate::error::AgentError;
use crate::extract::{ParseError, extract};
use crate::followups;
use crate::prompt;

const REQUIRED: [&str; 2] = ["name", "description"];

pub struct EntityHandler {
    pub kind: EntityKind,
    pub mode: Mode,
}

#[async_trait]
impl Handler for EntityHandler {
    async fn handle(
        &self,
        ctx: &HandlerContext<'_>,
        op: &Operation,
        scenario: Option<&Scenario>,
    ) -> Result<HandlerOutput, AgentError> {
        match self.mode {
            Mode::Create => self.create(ctx, op, scenario).await,
            Mode::Modify => self.modify(ctx, op, scenario).await,
        }
    }
}

impl EntityHandler {
    async fn create(
        &self,
        ctx: &HandlerContext<'_>,
        op: &Operation,
        scenario: Option<&Scenario>,
    ) -> Result<HandlerOutput, AgentError> {
        let label = self.kind.label();
        ctx.status(format!("Creating a new {label}...")).await;

        let request = ctx
            .request(
                prompt::entity_system(self.kind, Mode::Create),
                prompt::entity_user(op, None, scenario),
            )
            .with_json_mode();
        let text = ctx.complete(&request).await?;

        let mut entity = match parse_entity(self.kind, &text, None) {
            Ok(v) => v,
            Err(e) => return Ok(self.unreadable(ctx, e).await),
        };
        if let Some(reference) = op.context.referenced_entity() {
            let unnamed = entity
                .get("name")
                .and_then(Value::as_str)
                .is_none_or(|n| n.trim().is_empty());
            if unnamed {
                entity["name"] = json!(reference);
            }
        }

        let base = scenario.cloned().unwrap_or_default();
        let (next, name) = self.apply(&base, None, entity, ctx.user_id)?;
        debug!(kind = label, %name, "Entity created");

        ctx.emit_scenario(scenario, &next).await;
        let response = format!("Added the {label} {name} to the scenario.");
        ctx.say(&response).await;

        Ok(HandlerOutput::reply(response)
            .with_scenario(next)
            .with_follow_ups(followups::for_entity(self.kind, &name)))
    }

    async fn modify(
        &self,
        ctx: &HandlerContext<'_>,
        op: &Operation,
        scenario: Option<&Scenario>,
    ) -> Result<HandlerOutput, AgentError> {
        let label = self.kind.label();
        let Some(current) = scenario else {
            let msg = no_scenario_message(label);
            ctx.say(&msg).await;
            return Ok(HandlerOutput::reply(msg));
        };

        let names = match self.kind {
            EntityKind::Character => current.character_names(),
            EntityKind::Location => current.location_names(),
        };
        let index = match disambiguate::pick(self.kind, &names, op) {
            Pick::Selected(i) => i,
            Pick::Clarify(question) | Pick::Empty(question) => {
                ctx.say(&question).await;
                return Ok(HandlerOutput::reply(question));
            }
        };
        let old_name = names[index].to_string();
        let existing = self.entity_json(current, index);

        ctx.status(format!("Updating {old_name}...")).await;
        let request = ctx
            .request(
                prompt::entity_system(self.kind, Mode::Modify),
                prompt::entity_user(op, Some(&existing), Some(current)),
            )
            .with_json_mode();
        let text = ctx.complete(&request).await?;

        let entity = match parse_entity(self.kind, &text, Some(&existing)) {
            Ok(v) => v,
            Err(e) => return Ok(self.unreadable(ctx, e).await),
        };
        let (next, name) = self.apply(current, Some(index), entity, ctx.user_id)?;

        ctx.emit_scenario(Some(current), &next).await;
        let response = if name == old_name {
            format!("Updated the {label} {name}.")
        } else {
            format!("Updated the {label} {old_name}, now called {name}.")
        };
        ctx.say(&response).await;

        Ok(HandlerOutput::reply(response)
            .with_scenario(next)
            .with_follow_ups(followups::for_entity(self.kind, &name)))
    }

    fn entity_json(&self, scenario: &Scenario, index: usize) -> Value {
        let value = match self.kind {
            EntityKind::Character => scenario.characters.get(index).map(serde_json::to_value),
            EntityKind::Location => scenario.locations.get(index).map(serde_json::to_value),
        };
        value.and_then(Result::ok).unwrap_or_else(|| json!({}))
    }

    /// Merge `entity` into a copy of `base`: appended under a fresh id, or
    /// replacing the entity at `index` with its id kept.
    fn apply(
        &self,
        base: &Scenario,
        index: Option<usize>,
        entity: Value,
        user_id: &str,
    ) -> Result<(Scenario, String), AgentError> {
        let label = self.kind.label();
        let gone = || AgentError::invalid(label, "the entity no longer exists");
        match self.kind {
            EntityKind::Character => {
                let character: Character = serde_json::from_value(entity)
                    .map_err(|e| AgentError::invalid(label, e.to_string()))?;
                let name = checked_name(&character.name, label)?;
                let next = match index {
                    Some(i) => base.with_character_replaced(i, character).ok_or_else(gone)?,
                    None => base.with_character_added(character, user_id),
                };
                Ok((next, name))
            }
            EntityKind::Location => {
                let location: Location = serde_json::from_value(entity)
                    .map_err(|e| AgentError::invalid(label, e.to_string()))?;
                let name = checked_name(&location.name, label)?;
                let next = match index {
                    Some(i) => base.with_location_replaced(i, location).ok_or_else(gone)?,
                    None => base.with_location_added(location, user_id),
                };
                Ok((next, name))
            }
        }
    }

    async fn unreadable(&self, ctx: &HandlerContext<'_>, err: ParseError) -> HandlerOutput {
        warn!(%err, kind = self.kind.label(), "Could not extract entity from backend reply");
        let msg = format!(
            "I couldn't make sense of the generated {}. Could you describe it a little differently?",
            self.kind.label()
        );
        ctx.say(&msg).await;
        HandlerOutput::reply(msg)
    }
}

fn checked_name(name: &str, label: &'static str) -> Result<String, AgentError> {
    let name = name.trim();
    if name.is_empty() {
        Err(AgentError::invalid(label, "missing name"))
    } else {
        Ok(name.to_string())
    }
}

/// Extract the entity object, unwrapping `{"character": {...}}` style
/// replies. Keys missing from a modification reply keep their old values.
fn parse_entity(kind: EntityKind, text: &str, existing: Option<&Value>) -> Result<Value, ParseError> {
    let raw = extract(text, &[], Some(&json!({})))?;
    let mut entity = raw
        .get(kind.label())
        .filter(|v| v.is_object())
        .cloned()
        .unwrap_or(raw);

    if let Value::Object(ref mut map) = entity {
        if let Some(Value::Object(old)) = existing {
            for (key, value) in old {
                map.entry(key.clone()).or_insert_with(|| value.clone());
            }
        }
        for field in REQUIRED {
            map.entry(field.to_string()).or_insert_with(|| json!(""));
        }
    }
    Ok(entity)
}
