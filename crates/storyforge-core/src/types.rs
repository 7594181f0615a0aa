use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::scenario::Scenario;

/// What the user wants done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Details,
    Modification,
    Creation,
    GeneralConversation,
}

impl Action {
    pub const ALL: [Action; 4] = [
        Action::Details,
        Action::Modification,
        Action::Creation,
        Action::GeneralConversation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Details => "details",
            Action::Modification => "modification",
            Action::Creation => "creation",
            Action::GeneralConversation => "general_conversation",
        }
    }

    /// Lenient parse of a backend-supplied action name. Returns `None` for
    /// anything outside the closed set.
    pub fn parse(raw: &str) -> Option<Self> {
        match normalize_tag(raw).as_str() {
            "details" | "detail" => Some(Action::Details),
            "modification" | "modify" => Some(Action::Modification),
            "creation" | "create" => Some(Action::Creation),
            "generalconversation" => Some(Action::GeneralConversation),
            _ => None,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which part of the scenario an operation is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Target {
    #[serde(rename = "scenario")]
    Scenario,
    #[serde(rename = "character")]
    Character,
    #[serde(rename = "location")]
    Location,
    #[serde(rename = "backstory")]
    Backstory,
    #[serde(rename = "storyarc")]
    StoryArc,
    #[serde(rename = "writingStyle")]
    WritingStyle,
    #[serde(rename = "notes")]
    Notes,
    #[serde(rename = "general")]
    General,
}

impl Target {
    pub const ALL: [Target; 8] = [
        Target::Scenario,
        Target::Character,
        Target::Location,
        Target::Backstory,
        Target::StoryArc,
        Target::WritingStyle,
        Target::Notes,
        Target::General,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Target::Scenario => "scenario",
            Target::Character => "character",
            Target::Location => "location",
            Target::Backstory => "backstory",
            Target::StoryArc => "storyarc",
            Target::WritingStyle => "writingStyle",
            Target::Notes => "notes",
            Target::General => "general",
        }
    }

    /// Human-readable label used in prompts and status messages.
    pub fn label(&self) -> &'static str {
        match self {
            Target::Scenario => "scenario",
            Target::Character => "character",
            Target::Location => "location",
            Target::Backstory => "backstory",
            Target::StoryArc => "story arc",
            Target::WritingStyle => "writing style",
            Target::Notes => "notes",
            Target::General => "conversation",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match normalize_tag(raw).as_str() {
            "scenario" | "story" => Some(Target::Scenario),
            "character" | "characters" => Some(Target::Character),
            "location" | "locations" => Some(Target::Location),
            "backstory" => Some(Target::Backstory),
            "storyarc" => Some(Target::StoryArc),
            "writingstyle" => Some(Target::WritingStyle),
            "notes" | "note" => Some(Target::Notes),
            "general" => Some(Target::General),
            _ => None,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn normalize_tag(raw: &str) -> String {
    raw.trim()
        .chars()
        .filter(|c| !matches!(c, '_' | '-' | ' '))
        .flat_map(char::to_lowercase)
        .collect()
}

/// Key/value bag used to carry resolved references into handlers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub referenced_entity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_type: Option<String>,
    #[serde(default, flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl OperationContext {
    pub fn referencing(entity: impl Into<String>, reference_type: impl Into<String>) -> Self {
        Self {
            referenced_entity: Some(entity.into()),
            reference_type: Some(reference_type.into()),
            extra: BTreeMap::new(),
        }
    }

    pub fn referenced_entity(&self) -> Option<&str> {
        self.referenced_entity
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

/// One decomposed unit of user intent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub action: Action,
    pub target: Target,
    pub prompt: String,
    #[serde(default)]
    pub context: OperationContext,
}

impl Operation {
    pub fn new(action: Action, target: Target, prompt: impl Into<String>) -> Self {
        Self {
            action,
            target,
            prompt: prompt.into(),
            context: OperationContext::default(),
        }
    }

    pub fn with_context(mut self, context: OperationContext) -> Self {
        self.context = context;
        self
    }
}

/// Coarse classification of the whole request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Details,
    Modification,
    Creation,
    GeneralConversation,
    Mixed,
}

impl Category {
    /// The shared action when every operation agrees, `Mixed` otherwise.
    pub fn from_operations(operations: &[Operation]) -> Self {
        let mut actions = operations.iter().map(|op| op.action);
        let Some(first) = actions.next() else {
            return Category::GeneralConversation;
        };
        if actions.all(|a| a == first) {
            match first {
                Action::Details => Category::Details,
                Action::Modification => Category::Modification,
                Action::Creation => Category::Creation,
                Action::GeneralConversation => Category::GeneralConversation,
            }
        } else {
            Category::Mixed
        }
    }
}

/// Kind of work handed to the backend by a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolAction {
    CreateScenario,
    UpdateScenario,
    Explain,
    Chat,
}

impl ToolAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolAction::CreateScenario => "create_scenario",
            ToolAction::UpdateScenario => "update_scenario",
            ToolAction::Explain => "explain",
            ToolAction::Chat => "chat",
        }
    }

    /// Whether the accumulated output must be parsed into a structured entity.
    pub fn yields_entity(&self) -> bool {
        matches!(self, ToolAction::CreateScenario | ToolAction::UpdateScenario)
    }

    /// Parameter key under which the caller finds the entity to apply.
    pub fn result_key(&self) -> &'static str {
        match self {
            ToolAction::UpdateScenario => "updated_scenario",
            _ => "scenario",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    #[default]
    Pending,
    Executing,
    Completed,
    Failed,
}

/// The unit a handler hands to the backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub action: ToolAction,
    #[serde(default)]
    pub parameters: serde_json::Value,
    #[serde(default)]
    pub status: ToolCallStatus,
}

impl ToolCall {
    pub fn new(action: ToolAction, parameters: serde_json::Value) -> Self {
        Self {
            action,
            parameters,
            status: ToolCallStatus::Pending,
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.status, ToolCallStatus::Completed | ToolCallStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// One prior conversation turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    #[serde(default)]
    pub content: String,
    /// Some clients ship the scenario snapshot inside the first turn.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scenario: Option<Scenario>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl Turn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            scenario: None,
            timestamp: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            scenario: None,
            timestamp: None,
        }
    }
}

/// Inbound request to the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRequest {
    pub user_input: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scenario: Option<Scenario>,
    #[serde(default)]
    pub conversation_history: Vec<Turn>,
    pub user_id: String,
    /// Already-classified operations; when present the classifier is skipped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operations: Option<Vec<Operation>>,
}

impl AgentRequest {
    pub fn new(user_id: impl Into<String>, user_input: impl Into<String>) -> Self {
        Self {
            user_input: user_input.into(),
            scenario: None,
            conversation_history: Vec::new(),
            user_id: user_id.into(),
            operations: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_parse_is_lenient_but_closed() {
        assert_eq!(Action::parse("Creation"), Some(Action::Creation));
        assert_eq!(
            Action::parse("general-conversation"),
            Some(Action::GeneralConversation)
        );
        assert_eq!(Action::parse("delete"), None);
        assert_eq!(Action::parse(""), None);
    }

    #[test]
    fn test_target_parse_variants() {
        assert_eq!(Target::parse("writingStyle"), Some(Target::WritingStyle));
        assert_eq!(Target::parse("writing_style"), Some(Target::WritingStyle));
        assert_eq!(Target::parse("story arc"), Some(Target::StoryArc));
        assert_eq!(Target::parse("weather"), None);
    }

    #[test]
    fn test_target_serde_names() {
        let json = serde_json::to_string(&Target::WritingStyle).unwrap();
        assert_eq!(json, "\"writingStyle\"");
        let t: Target = serde_json::from_str("\"storyarc\"").unwrap();
        assert_eq!(t, Target::StoryArc);
    }

    #[test]
    fn test_operation_context_flattens_extra_keys() {
        let op: Operation = serde_json::from_str(
            r#"{"action":"creation","target":"character","prompt":"add him",
                "context":{"referenced_entity":"Donald Trump","reference_type":"character","turn":2}}"#,
        )
        .unwrap();
        assert_eq!(op.context.referenced_entity(), Some("Donald Trump"));
        assert_eq!(op.context.extra.get("turn"), Some(&serde_json::json!(2)));
    }

    #[test]
    fn test_category_from_operations() {
        let ops = vec![
            Operation::new(Action::Creation, Target::Character, "a"),
            Operation::new(Action::Creation, Target::Location, "b"),
        ];
        assert_eq!(Category::from_operations(&ops), Category::Creation);

        let mixed = vec![
            Operation::new(Action::Creation, Target::Character, "a"),
            Operation::new(Action::Details, Target::Scenario, "b"),
        ];
        assert_eq!(Category::from_operations(&mixed), Category::Mixed);
    }

    #[test]
    fn test_tool_action_result_keys() {
        assert!(ToolAction::UpdateScenario.yields_entity());
        assert!(!ToolAction::Chat.yields_entity());
        assert_eq!(ToolAction::UpdateScenario.result_key(), "updated_scenario");
        assert_eq!(ToolAction::CreateScenario.result_key(), "scenario");
    }

    #[test]
    fn test_agent_request_camel_case() {
        let req: AgentRequest = serde_json::from_str(
            r#"{"userInput":"hi","userId":"u1","conversationHistory":[{"role":"user","content":"x"}]}"#,
        )
        .unwrap();
        assert_eq!(req.user_id, "u1");
        assert_eq!(req.conversation_history.len(), 1);
        assert!(req.scenario.is_none());
        assert!(req.operations.is_none());
    }
}
