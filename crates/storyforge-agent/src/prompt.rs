//! Prompt builders for the classifier and the handlers.

use serde_json::Value;

use storyforge_core::scenario::{EntityKind, Scenario};
use storyforge_core::types::{Action, Operation, Role, Target, Turn};
use storyforge_providers::ChatMessage;

use crate::handlers::{Mode, ScenarioField};

const IDENTITY: &str = "You are Storyforge, a collaborative assistant for writing interactive story scenarios.";

/// The last `window` user/assistant turns as chat messages.
pub fn history_messages(history: &[Turn], window: usize) -> Vec<ChatMessage> {
    let start = history.len().saturating_sub(window);
    history[start..]
        .iter()
        .filter(|t| !t.content.trim().is_empty())
        .filter_map(|t| match t.role {
            Role::User => Some(ChatMessage::user(t.content.clone())),
            Role::Assistant => Some(ChatMessage::assistant(t.content.clone())),
            Role::System => None,
        })
        .collect()
}

fn history_block(history: &[Turn], window: usize) -> String {
    let start = history.len().saturating_sub(window);
    let lines: Vec<String> = history[start..]
        .iter()
        .filter(|t| t.role != Role::System)
        .map(|t| {
            let who = if t.role == Role::User { "User" } else { "Assistant" };
            format!("{who}: {}", t.content.trim())
        })
        .collect();
    if lines.is_empty() {
        "(no previous conversation)".to_string()
    } else {
        lines.join("\n")
    }
}

fn scenario_block(scenario: Option<&Scenario>) -> String {
    scenario
        .map(Scenario::summary)
        .unwrap_or_else(|| "(no scenario yet)".to_string())
}

pub fn classifier_system() -> String {
    let actions: Vec<&str> = Action::ALL.iter().map(Action::as_str).collect();
    let targets: Vec<&str> = Target::ALL.iter().map(Target::as_str).collect();
    format!(
        "{IDENTITY}\n\
         Split the user's message into one or more operations and reply with a single JSON object \
         of the form {{\"operations\": [{{\"action\": ..., \"target\": ..., \"prompt\": ..., \"context\": {{}}}}]}}.\n\
         Allowed actions: {}.\n\
         Allowed targets: {}.\n\
         Each prompt must be a self-contained instruction for that single operation, in the order the user asked.\n\
         If the message refers to someone or something from the conversation with a pronoun (him, her, it, that), \
         write the name into the prompt and set context.referenced_entity to the name and \
         context.reference_type to \"character\" or \"location\".\n\
         Reply with JSON only.",
        actions.join(", "),
        targets.join(", "),
    )
}

pub fn classifier_user(
    user_input: &str,
    history: &[Turn],
    scenario: Option<&Scenario>,
    window: usize,
) -> String {
    format!(
        "Conversation so far:\n{}\n\nCurrent scenario:\n{}\n\nUser message:\n{}",
        history_block(history, window),
        scenario_block(scenario),
        user_input.trim(),
    )
}

pub fn entity_system(kind: EntityKind, mode: Mode) -> String {
    let fields = match kind {
        EntityKind::Character => "name, role, description, personality, appearance, backstory",
        EntityKind::Location => "name, description, atmosphere",
    };
    let task = match mode {
        Mode::Create => format!("Create one new {} for the scenario.", kind.label()),
        Mode::Modify => format!(
            "Apply the requested change to the existing {} and return the complete updated {}.",
            kind.label(),
            kind.label()
        ),
    };
    format!(
        "{IDENTITY}\n{task}\nReply with a single JSON object with the string fields: {fields}. \
         Keep it consistent with the rest of the scenario. Reply with JSON only."
    )
}

pub fn entity_user(op: &Operation, existing: Option<&Value>, scenario: Option<&Scenario>) -> String {
    let mut out = format!("Scenario:\n{}\n\n", scenario_block(scenario));
    if let Some(existing) = existing {
        out.push_str(&format!("Current version:\n{existing}\n\n"));
    }
    out.push_str(&format!("Request:\n{}", op.prompt));
    out
}

pub fn field_system(field: ScenarioField, mode: Mode) -> String {
    let verb = match mode {
        Mode::Create => "Write",
        Mode::Modify => "Revise",
    };
    let shape = match field {
        ScenarioField::WritingStyle => {
            "a JSON object with the string fields genre, tone, pointOfView, tense, style"
        }
        _ => "a JSON object of the form {\"value\": \"...\"}",
    };
    format!(
        "{IDENTITY}\n{verb} the {} of the scenario as requested. Reply with {shape}. Reply with JSON only.",
        field.target().label()
    )
}

pub fn field_user(op: &Operation, current: &Value, scenario: Option<&Scenario>) -> String {
    format!(
        "Scenario:\n{}\n\nCurrent value:\n{current}\n\nRequest:\n{}",
        scenario_block(scenario),
        op.prompt
    )
}

pub fn scenario_system(mode: Mode) -> String {
    let task = match mode {
        Mode::Create => "Create a complete new story scenario from the request.",
        Mode::Modify => {
            "Apply the requested change to the scenario and return the complete updated scenario. \
             Keep every character and location that the request does not remove, with the same names."
        }
    };
    format!(
        "{IDENTITY}\n{task}\nReply with a single JSON object with the fields: title, synopsis, backstory, \
         storyArc, notes, writingStyle {{genre, tone, pointOfView, tense, style}}, \
         characters [{{name, role, description, personality, appearance, backstory}}], \
         locations [{{name, description, atmosphere}}]. Reply with JSON only."
    )
}

pub fn scenario_user(op: &Operation, scenario: Option<&Scenario>) -> String {
    match scenario.and_then(|s| serde_json::to_string_pretty(s).ok()) {
        Some(json) => format!("Current scenario:\n{json}\n\nRequest:\n{}", op.prompt),
        None => format!("Request:\n{}", op.prompt),
    }
}

pub fn explain_system() -> String {
    format!(
        "{IDENTITY}\nAnswer the user's question about their scenario in plain prose. \
         Be specific and draw only on the material provided."
    )
}

pub fn explain_user(op: &Operation, focus: &Value, scenario: Option<&Scenario>) -> String {
    format!(
        "Scenario:\n{}\n\nRelevant material:\n{focus}\n\nQuestion:\n{}",
        scenario_block(scenario),
        op.prompt
    )
}

pub fn chat_system(scenario: Option<&Scenario>) -> String {
    match scenario {
        Some(s) => format!(
            "{IDENTITY}\nChat with the user about their story. The current scenario is:\n{}",
            s.summary()
        ),
        None => format!("{IDENTITY}\nChat with the user about story ideas."),
    }
}
