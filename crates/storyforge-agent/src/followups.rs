//! Follow-up suggestions.

use storyforge_core::scenario::{EntityKind, Scenario};
use storyforge_core::types::Target;

use crate::handlers::ScenarioField;

/// Hard cap on follow-ups returned with one response.
pub const MAX_FOLLOW_UPS: usize = 5;

pub fn for_entity(kind: EntityKind, name: &str) -> Vec<String> {
    match kind {
        EntityKind::Character => vec![
            format!("Give {name} a secret"),
            format!("Describe how {name} met the other characters"),
            format!("Where does {name} live?"),
        ],
        EntityKind::Location => vec![
            format!("Who lives in {name}?"),
            format!("Add a hidden place inside {name}"),
        ],
    }
}

pub fn for_field(field: ScenarioField) -> Vec<String> {
    match field {
        ScenarioField::Backstory => vec!["How does the backstory shape the main conflict?".into()],
        ScenarioField::StoryArc => vec![
            "What is the turning point of the story arc?".into(),
            "Add a twist to the story arc".into(),
        ],
        ScenarioField::WritingStyle => vec!["Rewrite the synopsis in this style".into()],
        ScenarioField::Notes => Vec::new(),
    }
}

pub fn for_scenario(scenario: &Scenario) -> Vec<String> {
    let mut out = Vec::new();
    if scenario.characters.is_empty() {
        out.push("Add a main character".to_string());
    } else {
        out.push("Add a rival for the main character".to_string());
    }
    if scenario.locations.is_empty() {
        out.push("Create the first location".to_string());
    }
    if scenario.story_arc.trim().is_empty() {
        out.push("Outline the story arc".to_string());
    }
    out.truncate(3);
    out
}

pub fn for_explain(target: Target) -> Vec<String> {
    match target {
        Target::Character | Target::Location => vec![format!("Change something about this {}", target.label())],
        _ => Vec::new(),
    }
}

/// Used at wrap-up when no handler suggested anything. At most 2.
pub fn generic(scenario: Option<&Scenario>) -> Vec<String> {
    match scenario {
        Some(s) if !s.title.trim().is_empty() => vec![
            format!("What happens next in {}?", s.title.trim()),
            "Add a new character".to_string(),
        ],
        Some(_) => vec![
            "Give the scenario a title".to_string(),
            "Add a new character".to_string(),
        ],
        None => vec![
            "Create a new scenario".to_string(),
            "Suggest a few story ideas".to_string(),
        ],
    }
}

/// Append `new` to `into`, skipping duplicates, up to `cap` entries.
pub fn merge(into: &mut Vec<String>, new: impl IntoIterator<Item = String>, cap: usize) {
    let cap = cap.min(MAX_FOLLOW_UPS);
    for item in new {
        if into.len() >= cap {
            break;
        }
        let item = item.trim().to_string();
        if item.is_empty() || into.iter().any(|existing| existing.eq_ignore_ascii_case(&item)) {
            continue;
        }
        into.push(item);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_caps_and_dedups() {
        let mut out = vec!["A".to_string()];
        merge(&mut out, ["a", "B", "C", "D", "E", "F", "G"].map(String::from), 10);
        assert_eq!(out, vec!["A", "B", "C", "D", "E"]);
    }

    #[test]
    fn test_generic_is_two() {
        assert_eq!(generic(None).len(), 2);
        let titled = Scenario {
            title: "Dusk".into(),
            ..Scenario::default()
        };
        assert!(generic(Some(&titled))[0].contains("Dusk"));
    }

    #[test]
    fn test_handler_suggestions_are_bounded() {
        assert!(for_entity(EntityKind::Character, "Mira").len() <= 3);
        assert!(for_scenario(&Scenario::default()).len() <= 3);
    }
}
