//! Picking which scenario entity an operation is about.
//!
//! Runs before any backend call. Order: exact match on the resolved
//! reference, then the longest known name appearing in the prompt, then the
//! only candidate if there is exactly one. Anything else is answered with a
//! question instead of a guess.

use storyforge_core::scenario::EntityKind;
use storyforge_core::types::Operation;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pick {
    Selected(usize),
    /// Several candidates and nothing to choose by.
    Clarify(String),
    /// No candidates at all.
    Empty(String),
}

pub fn pick(kind: EntityKind, names: &[&str], op: &Operation) -> Pick {
    if let Some(reference) = op.context.referenced_entity() {
        if let Some(i) = names.iter().position(|n| n.trim().eq_ignore_ascii_case(reference)) {
            return Pick::Selected(i);
        }
    }

    let prompt = op.prompt.to_lowercase();
    let by_name = names
        .iter()
        .enumerate()
        .filter(|(_, n)| !n.trim().is_empty())
        .filter(|(_, n)| prompt.contains(&n.trim().to_lowercase()))
        .max_by_key(|(_, n)| n.trim().len());
    if let Some((i, _)) = by_name {
        return Pick::Selected(i);
    }

    match names.len() {
        0 => Pick::Empty(no_candidates_message(kind)),
        1 => Pick::Selected(0),
        _ => Pick::Clarify(clarification(kind, names)),
    }
}

pub fn no_candidates_message(kind: EntityKind) -> String {
    format!(
        "There are no {label}s in this scenario yet. Would you like me to create a {label}?",
        label = kind.label()
    )
}

fn clarification(kind: EntityKind, names: &[&str]) -> String {
    let listed = match names.split_last() {
        Some((last, rest)) if !rest.is_empty() => format!("{} or {last}", rest.join(", ")),
        _ => names.join(""),
    };
    format!("Which {} do you mean: {listed}?", kind.label())
}

#[cfg(test)]
mod tests {
    use super::*;
    use storyforge_core::types::{Action, OperationContext, Target};

    fn op(prompt: &str) -> Operation {
        Operation::new(Action::Modification, Target::Character, prompt)
    }

    #[test]
    fn test_reference_wins() {
        let op = op("make him older")
            .with_context(OperationContext::referencing("tobin", "character"));
        assert_eq!(pick(EntityKind::Character, &["Mira", "Tobin"], &op), Pick::Selected(1));
    }

    #[test]
    fn test_longest_name_in_prompt() {
        let names = ["Mira", "Mira Vance"];
        assert_eq!(
            pick(EntityKind::Character, &names, &op("give Mira Vance a scar")),
            Pick::Selected(1)
        );
    }

    #[test]
    fn test_single_candidate() {
        assert_eq!(
            pick(EntityKind::Location, &["Harbor"], &op("make it rain")),
            Pick::Selected(0)
        );
    }

    #[test]
    fn test_clarify_lists_all_names() {
        match pick(EntityKind::Character, &["Mira", "Tobin", "Ash"], &op("make them taller")) {
            Pick::Clarify(q) => assert_eq!(q, "Which character do you mean: Mira, Tobin or Ash?"),
            other => panic!("expected clarification, got {other:?}"),
        }
    }

    #[test]
    fn test_empty() {
        assert!(matches!(
            pick(EntityKind::Character, &[], &op("rename him")),
            Pick::Empty(_)
        ));
    }
}
