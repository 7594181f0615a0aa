//! Keyword classification.
//!
//! A pure, backend-free mapping from text to an action and a target. The
//! classifier uses it to coerce invalid backend values and as its whole
//! fallback path when the backend reply cannot be parsed.

use storyforge_core::types::{Action, Operation, Target};

const MODIFICATION: &[&str] = &[
    "change", "modify", "update", "edit", "rename", "rewrite", "revise", "adjust", "tweak",
    "improve", "replace", "remove", "delete", "fix", "alter", "expand", "shorten",
];

const CREATION: &[&str] = &[
    "add", "create", "new", "generate", "introduce", "invent", "build", "design", "come up with",
];

const DETAILS: &[&str] = &[
    "what", "who", "where", "why", "how", "explain", "describe", "tell me", "details", "detail",
    "summarize", "summary", "show", "list",
];

/// Targets in priority order: the first set with a hit wins.
const TARGETS: &[(Target, &[&str])] = &[
    (
        Target::WritingStyle,
        &[
            "writing style", "style", "tone", "genre", "point of view", "pov", "tense", "prose",
            "voice",
        ],
    ),
    (
        Target::StoryArc,
        &["story arc", "storyarc", "arc", "plot", "acts", "chapters", "climax"],
    ),
    (
        Target::Backstory,
        &["backstory", "back story", "history", "background", "lore"],
    ),
    (Target::Notes, &["note", "notes"]),
    (
        Target::Character,
        &[
            "character", "characters", "protagonist", "antagonist", "hero", "heroine", "villain",
            "npc", "person", "companion", "sidekick",
        ],
    ),
    (
        Target::Location,
        &[
            "location", "locations", "place", "places", "setting", "town", "city", "village",
            "forest", "castle", "kingdom", "realm", "map",
        ],
    ),
    (
        Target::Scenario,
        &["scenario", "story", "title", "synopsis", "premise", "world"],
    ),
];

pub fn keyword_action(text: &str) -> Option<Action> {
    let words = words(text);
    if contains_any(&words, MODIFICATION) {
        Some(Action::Modification)
    } else if contains_any(&words, CREATION) {
        Some(Action::Creation)
    } else if contains_any(&words, DETAILS) {
        Some(Action::Details)
    } else {
        None
    }
}

pub fn keyword_target(text: &str) -> Option<Target> {
    let words = words(text);
    TARGETS
        .iter()
        .find(|(_, phrases)| contains_any(&words, phrases))
        .map(|(target, _)| *target)
}

/// One operation for the whole utterance, defaulting to general conversation.
pub fn keyword_operation(text: &str) -> Operation {
    let action = keyword_action(text).unwrap_or(Action::GeneralConversation);
    let target = match action {
        Action::GeneralConversation => Target::General,
        _ => keyword_target(text).unwrap_or(Target::General),
    };
    Operation::new(action, target, text.trim())
}

fn words(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Whole-word (or whole-phrase) match.
fn contains_any(words: &[String], phrases: &[&str]) -> bool {
    phrases.iter().any(|phrase| {
        let needle: Vec<&str> = phrase.split(' ').collect();
        words
            .windows(needle.len())
            .any(|window| window.iter().zip(&needle).all(|(w, n)| w == n))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_creation_character() {
        let op = keyword_operation("Add a dark wizard character");
        assert_eq!(op.action, Action::Creation);
        assert_eq!(op.target, Target::Character);
    }

    #[test]
    fn test_modification_beats_creation() {
        let op = keyword_operation("change the villain and add a scar");
        assert_eq!(op.action, Action::Modification);
        assert_eq!(op.target, Target::Character);
    }

    #[test]
    fn test_target_priority() {
        assert_eq!(
            keyword_target("rewrite the story in a darker tone"),
            Some(Target::WritingStyle)
        );
        assert_eq!(keyword_target("expand the plot of the story"), Some(Target::StoryArc));
        assert_eq!(
            keyword_target("add him to the story as a character"),
            Some(Target::Character)
        );
    }

    #[test]
    fn test_whole_words_only() {
        // "address" must not match "add", "storyline" must not match "story"
        assert_eq!(keyword_action("my address"), None);
        assert_eq!(keyword_target("storyline"), None);
    }

    #[test]
    fn test_phrase_match() {
        assert_eq!(
            keyword_target("switch to first person point of view"),
            Some(Target::WritingStyle)
        );
        assert_eq!(keyword_action("please tell me about Mira"), Some(Action::Details));
    }

    #[test]
    fn test_default_general() {
        let op = keyword_operation("hello there!");
        assert_eq!(op.action, Action::GeneralConversation);
        assert_eq!(op.target, Target::General);
        assert_eq!(op.prompt, "hello there!");
    }
}
