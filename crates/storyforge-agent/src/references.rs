//! Pronoun and deictic reference resolution.
//!
//! When the utterance says "him" or "it" and recent history names an entity,
//! the name is written into the operation's prompt and context so that the
//! handler receives a self-contained instruction.

use storyforge_core::scenario::Scenario;
use storyforge_core::types::{Operation, OperationContext, Target, Turn};
use tracing::debug;

/// Reference words and the entity kind they imply, if any.
const REFERENCES: &[(&str, Option<&str>)] = &[
    ("him", Some("character")),
    ("he", Some("character")),
    ("her", Some("character")),
    ("she", Some("character")),
    ("them", Some("character")),
    ("they", Some("character")),
    ("there", Some("location")),
    ("it", None),
    ("that", None),
];

/// Capitalized words that never start a name on their own.
const STOPWORDS: &[&str] = &[
    "I", "I'm", "I've", "I'd", "The", "A", "An", "And", "But", "Or", "So", "Then", "He", "She",
    "It", "They", "We", "You", "His", "Her", "Their", "This", "That", "What", "Who", "Where",
    "When", "Why", "How", "Can", "Could", "Would", "Should", "Please", "Tell", "Add", "Create",
    "Make", "Yes", "No", "Sure", "Okay", "OK", "Hi", "Hello",
];

/// A named entity found in history, with its kind when known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mention {
    pub name: String,
    pub kind: Option<&'static str>,
}

/// Most recent named entity in the last `window` turns, newest first.
/// Scenario entity names are preferred over free-form proper names.
pub fn recent_mention(history: &[Turn], scenario: Option<&Scenario>, window: usize) -> Option<Mention> {
    let start = history.len().saturating_sub(window);
    history[start..]
        .iter()
        .rev()
        .find_map(|turn| mention_in(&turn.content, scenario))
}

fn mention_in(text: &str, scenario: Option<&Scenario>) -> Option<Mention> {
    if let Some(scenario) = scenario {
        let lower = text.to_lowercase();
        let known = scenario
            .characters
            .iter()
            .map(|c| (c.name.as_str(), "character"))
            .chain(scenario.locations.iter().map(|l| (l.name.as_str(), "location")))
            .filter(|(name, _)| !name.trim().is_empty())
            .filter_map(|(name, kind)| lower.rfind(&name.to_lowercase()).map(|pos| (pos, name, kind)))
            .max_by_key(|(pos, name, _)| (*pos, name.len()));
        if let Some((_, name, kind)) = known {
            return Some(Mention {
                name: name.to_string(),
                kind: Some(kind),
            });
        }
    }
    proper_names(text).pop().map(|name| Mention { name, kind: None })
}

/// Runs of capitalized words that look like names, in order of appearance.
/// A single capitalized word counts only when it does not open a sentence.
fn proper_names(text: &str) -> Vec<String> {
    let mut names = Vec::new();
    let mut run: Vec<&str> = Vec::new();
    let mut run_at_sentence_start = false;
    let mut sentence_start = true;

    for raw in text.split_whitespace() {
        let word = raw.trim_matches(|c: char| !c.is_alphanumeric() && c != '\'');
        let capitalized = word.chars().next().is_some_and(char::is_uppercase);

        if capitalized && !word.is_empty() {
            if run.is_empty() {
                run_at_sentence_start = sentence_start;
            }
            run.push(word);
        } else {
            flush_run(&mut run, run_at_sentence_start, &mut names);
        }

        let ends_sentence = raw.ends_with(['.', '!', '?']);
        let breaks_run = raw.ends_with([',', ';', ':']) || ends_sentence;
        if breaks_run {
            flush_run(&mut run, run_at_sentence_start, &mut names);
        }
        sentence_start = ends_sentence;
    }
    flush_run(&mut run, run_at_sentence_start, &mut names);

    names.retain(|n| !STOPWORDS.contains(&n.as_str()));
    names
}

fn flush_run(run: &mut Vec<&str>, at_start: bool, names: &mut Vec<String>) {
    while run.first().is_some_and(|w| STOPWORDS.contains(w)) {
        run.remove(0);
    }
    if run.len() >= 2 || (run.len() == 1 && !at_start) {
        names.push(run.join(" "));
    }
    run.clear();
}

/// First standalone reference word in `prompt`, as a byte range.
fn find_reference(prompt: &str) -> Option<(usize, usize, Option<&'static str>)> {
    let mut offset = 0;
    let words: Vec<(usize, &str)> = prompt
        .split_inclusive(|c: char| !c.is_alphanumeric() && c != '\'')
        .map(|piece| {
            let start = offset;
            offset += piece.len();
            let word = piece.trim_end_matches(|c: char| !c.is_alphanumeric() && c != '\'');
            (start, word)
        })
        .collect();

    for (i, (start, word)) in words.iter().enumerate() {
        let lower = word.to_lowercase();
        let Some((_, kind)) = REFERENCES.iter().find(|(w, _)| *w == lower) else {
            continue;
        };
        // "that" is a determiner unless it ends the clause ("make that darker" is not a reference)
        if lower == "that" {
            let next = words.get(i + 1).map(|(_, w)| *w).unwrap_or("");
            let piece_end = prompt[*start + word.len()..].chars().next();
            let clause_end = next.is_empty() || piece_end.is_some_and(|c| matches!(c, '.' | ',' | '!' | '?'));
            if !clause_end {
                continue;
            }
        }
        return Some((*start, *start + word.len(), *kind));
    }
    None
}

/// Thread a history reference into `op`. Returns whether the operation changed.
///
/// If the backend already set `context.referenced_entity`, only the prompt is
/// made to mention it. Otherwise a reference word in the prompt, or in the
/// raw utterance when the backend already rewrote the prompt, is tied to the
/// most recent named entity from history.
pub fn resolve(
    op: &mut Operation,
    user_input: &str,
    history: &[Turn],
    scenario: Option<&Scenario>,
    window: usize,
) -> bool {
    if let Some(entity) = op.context.referenced_entity().map(str::to_string) {
        if contains_ignore_case(&op.prompt, &entity) {
            return false;
        }
        match find_reference(&op.prompt) {
            Some((start, end, _)) => op.prompt.replace_range(start..end, &entity),
            None => op.prompt = format!("{} (referring to {entity})", op.prompt.trim_end()),
        }
        return true;
    }

    let in_prompt = find_reference(&op.prompt);
    let in_utterance = find_reference(user_input);
    let Some((_, _, implied)) = in_prompt.or(in_utterance) else {
        return false;
    };
    let Some(mention) = recent_mention(history, scenario, window) else {
        return false;
    };

    let named = contains_ignore_case(&op.prompt, &mention.name);
    match in_prompt {
        Some((start, end, _)) if !named => op.prompt.replace_range(start..end, &mention.name),
        // The backend already substituted the name; only the context is missing.
        _ if named => {}
        _ => return false,
    }

    let reference_type = mention
        .kind
        .or(implied)
        .or(match op.target {
            Target::Character => Some("character"),
            Target::Location => Some("location"),
            _ => None,
        })
        .unwrap_or("entity");

    debug!(entity = %mention.name, reference_type, "Resolved reference from history");
    let extra = std::mem::take(&mut op.context.extra);
    op.context = OperationContext {
        extra,
        ..OperationContext::referencing(mention.name, reference_type)
    };
    true
}

fn contains_ignore_case(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use storyforge_core::scenario::Character;
    use storyforge_core::types::Action;

    #[test]
    fn test_proper_names() {
        assert_eq!(proper_names("Tell me about Donald Trump."), vec!["Donald Trump"]);
        assert_eq!(proper_names("I met Gandalf today"), vec!["Gandalf"]);
        assert!(proper_names("Hello. Nice weather").is_empty());
    }

    #[test]
    fn test_resolve_him_from_history() {
        let history = vec![
            Turn::user("Tell me about Donald Trump"),
            Turn::assistant("He is a businessman and politician."),
        ];
        let mut op = Operation::new(
            Action::Creation,
            Target::Character,
            "add him to the story as a character",
        );
        assert!(resolve(&mut op, "add him to the story as a character", &history, None, 6));
        assert_eq!(op.prompt, "add Donald Trump to the story as a character");
        assert_eq!(op.context.referenced_entity(), Some("Donald Trump"));
        assert_eq!(op.context.reference_type.as_deref(), Some("character"));
    }

    #[test]
    fn test_scenario_names_preferred() {
        let scenario = Scenario {
            characters: vec![Character {
                name: "Mira".into(),
                ..Character::default()
            }],
            ..Scenario::default()
        };
        let history = vec![Turn::assistant("Mira walked into the Old Harbor Inn.")];
        let mention = recent_mention(&history, Some(&scenario), 6).unwrap();
        assert_eq!(mention.name, "Mira");
        assert_eq!(mention.kind, Some("character"));
    }

    #[test]
    fn test_that_as_determiner_is_ignored() {
        let history = vec![Turn::user("Tell me about the Glass Tower")];
        let mut op = Operation::new(Action::Modification, Target::Location, "make that place darker");
        assert!(!resolve(&mut op, "make that place darker", &history, None, 6));

        let mut op = Operation::new(Action::Details, Target::Location, "tell me more about that");
        assert!(resolve(&mut op, "tell me more about that", &history, None, 6));
        assert_eq!(op.prompt, "tell me more about Glass Tower");
    }

    #[test]
    fn test_backend_context_is_threaded_into_prompt() {
        let mut op = Operation::new(Action::Creation, Target::Character, "add him")
            .with_context(OperationContext::referencing("Ada Lovelace", "character"));
        assert!(resolve(&mut op, "add him", &[], None, 6));
        assert_eq!(op.prompt, "add Ada Lovelace");
    }

    #[test]
    fn test_context_set_when_backend_already_named_the_entity() {
        let history = vec![Turn::user("Tell me about Donald Trump")];
        let mut op = Operation::new(
            Action::Creation,
            Target::Character,
            "add Donald Trump to the story as a character",
        );
        assert!(resolve(
            &mut op,
            "add him to the story as a character",
            &history,
            None,
            6
        ));
        assert_eq!(op.prompt, "add Donald Trump to the story as a character");
        assert_eq!(op.context.referenced_entity(), Some("Donald Trump"));
        assert_eq!(op.context.reference_type.as_deref(), Some("character"));
    }

    #[test]
    fn test_utterance_reference_does_not_leak_into_unrelated_operation() {
        let history = vec![Turn::user("Tell me about Donald Trump")];
        let mut op = Operation::new(Action::Creation, Target::Location, "create a misty forest");
        assert!(!resolve(
            &mut op,
            "create a misty forest and add him too",
            &history,
            None,
            6
        ));
        assert_eq!(op.context.referenced_entity(), None);
    }

    #[test]
    fn test_window_limits_history() {
        let history = vec![
            Turn::user("Tell me about Donald Trump"),
            Turn::assistant("ok"),
            Turn::user("and now something else"),
        ];
        assert!(recent_mention(&history, None, 2).is_none());
        assert!(recent_mention(&history, None, 3).is_some());
    }
}
