//! Backstory, story arc, writing style and notes.

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::warn;

use storyforge_core::scenario::{Scenario, WritingStyle};
use storyforge_core::types::Operation;

use super::{Handler, HandlerContext, HandlerOutput, Mode, ScenarioField, no_scenario_message};
use crate::error::AgentError;
use crate::extract::extract;
use crate::followups;
use crate::prompt;

pub struct FieldHandler {
    pub field: ScenarioField,
    pub mode: Mode,
}

/// A parsed replacement for one field.
#[derive(Debug, Clone, PartialEq)]
enum FieldValue {
    Text(String),
    Style(WritingStyle),
}

#[async_trait]
impl Handler for FieldHandler {
    async fn handle(
        &self,
        ctx: &HandlerContext<'_>,
        op: &Operation,
        scenario: Option<&Scenario>,
    ) -> Result<HandlerOutput, AgentError> {
        let label = self.field.target().label();
        if self.mode == Mode::Modify && scenario.is_none() {
            let msg = no_scenario_message(label);
            ctx.say(&msg).await;
            return Ok(HandlerOutput::reply(msg));
        }

        let base = scenario.cloned().unwrap_or_default();
        let current = current_value(self.field, &base);

        let verb = match self.mode {
            Mode::Create => "Writing",
            Mode::Modify => "Revising",
        };
        ctx.status(format!("{verb} the {label}...")).await;

        let request = ctx
            .request(
                prompt::field_system(self.field, self.mode),
                prompt::field_user(op, &current, scenario),
            )
            .with_json_mode();
        let text = ctx.complete(&request).await?;

        let Some(value) = parse_value(self.field, &text, &current) else {
            warn!(field = label, "Could not extract field value from backend reply");
            let msg = format!(
                "I couldn't turn that into a {label}. Could you say a bit more about what you'd like?"
            );
            ctx.say(&msg).await;
            return Ok(HandlerOutput::reply(msg));
        };

        let next = with_field(&base, self.field, value);
        ctx.emit_scenario(scenario, &next).await;

        let response = match self.mode {
            Mode::Create => format!("Wrote the {label}."),
            Mode::Modify => format!("Updated the {label}."),
        };
        ctx.say(&response).await;

        Ok(HandlerOutput::reply(response)
            .with_scenario(next)
            .with_follow_ups(followups::for_field(self.field)))
    }
}

fn current_value(field: ScenarioField, scenario: &Scenario) -> Value {
    match field {
        ScenarioField::Backstory => json!(scenario.backstory),
        ScenarioField::StoryArc => json!(scenario.story_arc),
        ScenarioField::Notes => json!(scenario.notes),
        ScenarioField::WritingStyle => {
            serde_json::to_value(&scenario.writing_style).unwrap_or_else(|_| json!({}))
        }
    }
}

fn parse_value(field: ScenarioField, text: &str, current: &Value) -> Option<FieldValue> {
    match field {
        ScenarioField::WritingStyle => {
            let raw = extract(text, &[], Some(&json!({}))).ok()?;
            let mut style = raw
                .get(field.target().as_str())
                .filter(|v| v.is_object())
                .cloned()
                .unwrap_or(raw);
            if let (Value::Object(map), Value::Object(old)) = (&mut style, current) {
                for (key, value) in old {
                    map.entry(key.clone()).or_insert_with(|| value.clone());
                }
            }
            serde_json::from_value(style).ok().map(FieldValue::Style)
        }
        _ => {
            let text_value = match extract(text, &[], Some(&json!({}))) {
                Ok(obj) => obj
                    .get("value")
                    .or_else(|| obj.get(field.target().as_str()))
                    .and_then(Value::as_str)
                    .or_else(|| obj.as_object()?.values().find_map(Value::as_str))
                    .map(str::to_string),
                // Prose replies are taken as the value itself.
                Err(_) => Some(text.to_string()),
            };
            text_value
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .map(FieldValue::Text)
        }
    }
}

fn with_field(base: &Scenario, field: ScenarioField, value: FieldValue) -> Scenario {
    let mut next = base.clone();
    match (field, value) {
        (ScenarioField::WritingStyle, FieldValue::Style(style)) => next.writing_style = style,
        (ScenarioField::Backstory, FieldValue::Text(text)) => next.backstory = text,
        (ScenarioField::StoryArc, FieldValue::Text(text)) => next.story_arc = text,
        (ScenarioField::Notes, FieldValue::Text(text)) => next.notes = text,
        _ => {}
    }
    next
}
