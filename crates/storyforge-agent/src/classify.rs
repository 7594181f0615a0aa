//! Intent classification.
//!
//! One backend call turns the utterance into an ordered operation list. Every
//! field the backend returns is coerced into the closed action/target sets,
//! and the whole step degrades to keyword matching when the reply cannot be
//! parsed at all, so classification never fails.

use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use storyforge_core::scenario::Scenario;
use storyforge_core::types::{Action, Operation, OperationContext, Target, Turn};
use storyforge_providers::{ChatMessage, CompletionRequest, LlmProvider, ProviderError};

use crate::extract::extract;
use crate::keywords::{keyword_action, keyword_operation, keyword_target};
use crate::prompt;
use crate::references;
use crate::settings::EngineSettings;

/// How the operation list was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassifySource {
    Backend,
    KeywordFallback,
}

#[derive(Debug, Clone)]
pub struct Classification {
    pub operations: Vec<Operation>,
    pub source: ClassifySource,
}

pub async fn classify(
    provider: &dyn LlmProvider,
    settings: &EngineSettings,
    user_input: &str,
    history: &[Turn],
    scenario: Option<&Scenario>,
    cancel: &CancellationToken,
) -> Classification {
    let request = CompletionRequest::new(settings.model.clone(), settings.max_tokens)
        .with_system(prompt::classifier_system())
        .with_temperature(Some(settings.classifier_temperature))
        .with_json_mode()
        .push(ChatMessage::user(prompt::classifier_user(
            user_input,
            history,
            scenario,
            settings.history_window,
        )));

    let limit = settings.request_timeout;
    let reply = tokio::time::timeout(limit, provider.complete(&request, cancel))
        .await
        .unwrap_or(Err(ProviderError::Timeout(limit)));
    let parsed = match reply {
        Ok(text) => parse_operations(&text, user_input),
        Err(e) => {
            warn!(%e, "Classification call failed, using keyword fallback");
            None
        }
    };

    let (mut operations, source) = match parsed {
        Some(ops) => (ops, ClassifySource::Backend),
        None => (vec![keyword_operation(user_input)], ClassifySource::KeywordFallback),
    };

    for op in &mut operations {
        references::resolve(op, user_input, history, scenario, settings.history_window);
    }

    debug!(count = operations.len(), ?source, "Classified request");
    Classification { operations, source }
}

/// Parse the backend reply into coerced operations. `None` when the reply
/// holds no usable operation.
pub fn parse_operations(text: &str, user_input: &str) -> Option<Vec<Operation>> {
    let value = match extract(text, &[], None) {
        Ok(v) => v,
        Err(e) => {
            warn!(%e, "Classifier reply is not structured");
            return None;
        }
    };

    let entries: Vec<Value> = match value {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("operations") {
            Some(Value::Array(items)) => items,
            Some(single @ Value::Object(_)) => vec![single],
            _ if map.contains_key("action") => vec![Value::Object(map)],
            _ => Vec::new(),
        },
        _ => Vec::new(),
    };

    let operations: Vec<Operation> = entries
        .iter()
        .filter(|e| e.is_object())
        .map(|entry| coerce(entry, user_input))
        .collect();

    if operations.is_empty() {
        None
    } else {
        Some(operations)
    }
}

/// Trust valid backend values, else keyword-match the operation's own
/// prompt, else default to general conversation.
fn coerce(entry: &Value, user_input: &str) -> Operation {
    let prompt = entry
        .get("prompt")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .unwrap_or(user_input.trim())
        .to_string();

    let action = entry
        .get("action")
        .and_then(Value::as_str)
        .and_then(Action::parse)
        .or_else(|| keyword_action(&prompt))
        .unwrap_or(Action::GeneralConversation);

    let target = entry
        .get("target")
        .and_then(Value::as_str)
        .and_then(Target::parse)
        .or_else(|| keyword_target(&prompt))
        .unwrap_or(Target::General);

    let context = entry
        .get("context")
        .filter(|c| c.is_object())
        .and_then(|c| serde_json::from_value::<OperationContext>(c.clone()).ok())
        .unwrap_or_default();

    Operation::new(action, target, prompt).with_context(context)
}

/// Serialized form of an operation list, as carried in completion metadata.
pub fn operations_json(operations: &[Operation]) -> Value {
    serde_json::to_value(operations).unwrap_or_else(|_| json!([]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use storyforge_providers::ScriptedProvider;

    #[test]
    fn test_parse_two_operations() {
        let text = r#"```json
{"operations": [
  {"action": "creation", "target": "character", "prompt": "add a dark wizard character"},
  {"action": "creation", "target": "location", "prompt": "create a mysterious forest location"}
]}
```"#;
        let ops = parse_operations(text, "x").unwrap();
        assert_eq!(ops.len(), 2);
        assert_eq!((ops[0].action, ops[0].target), (Action::Creation, Target::Character));
        assert_eq!((ops[1].action, ops[1].target), (Action::Creation, Target::Location));
    }

    #[test]
    fn test_invalid_values_are_coerced() {
        let text = r#"{"operations": [
            {"action": "destroy", "target": "villain", "prompt": "change the villain's name"},
            {"action": 7, "target": null, "prompt": "hello"}
        ]}"#;
        let ops = parse_operations(text, "x").unwrap();
        assert_eq!((ops[0].action, ops[0].target), (Action::Modification, Target::Character));
        assert_eq!(
            (ops[1].action, ops[1].target),
            (Action::GeneralConversation, Target::General)
        );
    }

    #[test]
    fn test_bare_array_and_single_object() {
        let ops = parse_operations(
            r#"[{"action":"details","target":"scenario","prompt":"what is it about"}]"#,
            "x",
        )
        .unwrap();
        assert_eq!(ops[0].action, Action::Details);

        let ops = parse_operations(r#"{"action":"creation","target":"notes"}"#, "jot a note").unwrap();
        assert_eq!(ops[0].target, Target::Notes);
        assert_eq!(ops[0].prompt, "jot a note");
    }

    #[test]
    fn test_empty_operations_is_none() {
        assert!(parse_operations(r#"{"operations": []}"#, "x").is_none());
        assert!(parse_operations("no idea", "x").is_none());
    }

    #[tokio::test]
    async fn test_unparseable_reply_falls_back_to_keywords() {
        let provider = ScriptedProvider::new().reply("I am not JSON at all");
        let result = classify(
            &provider,
            &EngineSettings::default(),
            "create a new character named Mira",
            &[],
            None,
            &CancellationToken::new(),
        )
        .await;
        assert_eq!(result.source, ClassifySource::KeywordFallback);
        assert_eq!(result.operations.len(), 1);
        assert_eq!(result.operations[0].action, Action::Creation);
        assert_eq!(result.operations[0].target, Target::Character);
    }

    #[tokio::test]
    async fn test_backend_failure_falls_back() {
        let provider = ScriptedProvider::new().fail("timeout");
        let result = classify(
            &provider,
            &EngineSettings::default(),
            "hi!",
            &[],
            None,
            &CancellationToken::new(),
        )
        .await;
        assert_eq!(result.operations.len(), 1);
        assert_eq!(result.operations[0].action, Action::GeneralConversation);
    }

    #[tokio::test]
    async fn test_classifier_request_is_json_mode() {
        let provider = ScriptedProvider::new()
            .reply(r#"{"operations":[{"action":"details","target":"scenario","prompt":"x"}]}"#);
        classify(
            &provider,
            &EngineSettings::default(),
            "x",
            &[],
            None,
            &CancellationToken::new(),
        )
        .await;
        let requests = provider.requests();
        assert!(requests[0].json_mode);
        assert_eq!(requests[0].temperature, Some(0.0));
    }
}
