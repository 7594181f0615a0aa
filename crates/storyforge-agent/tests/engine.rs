//! End-to-end runs of the engine over the scripted provider.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use storyforge_agent::{AgentOutcome, Engine, EngineSettings};
use storyforge_core::protocol::{EventType, StreamingEvent};
use storyforge_core::scenario::{Character, Scenario};
use storyforge_core::types::{Action, AgentRequest, Category, Operation, Target, Turn};
use storyforge_providers::{LlmProvider, ScriptedProvider};

fn engine(provider: &Arc<ScriptedProvider>) -> Arc<Engine> {
    let provider: Arc<dyn LlmProvider> = provider.clone();
    Arc::new(Engine::new(provider, EngineSettings::default()))
}

async fn run(
    provider: &Arc<ScriptedProvider>,
    request: AgentRequest,
) -> (Vec<StreamingEvent>, AgentOutcome) {
    engine(provider)
        .spawn(request)
        .collect()
        .await
        .expect("run task panicked")
}

fn of_type(events: &[StreamingEvent], kind: EventType) -> Vec<&StreamingEvent> {
    events.iter().filter(|e| e.event_type == kind).collect()
}

fn precommitted(input: &str, ops: Vec<Operation>) -> AgentRequest {
    let mut request = AgentRequest::new("u1", input);
    request.operations = Some(ops);
    request
}

fn two_characters() -> Scenario {
    let character = |id: &str, name: &str| Character {
        id: id.into(),
        name: name.into(),
        ..Character::default()
    };
    Scenario {
        title: "Harbor Lights".into(),
        characters: vec![character("char_u1_0", "Mira"), character("char_u1_1", "Tobin")],
        ..Scenario::default()
    }
}

#[tokio::test]
async fn test_compound_request_runs_both_operations() {
    let provider = Arc::new(
        ScriptedProvider::new()
            .reply(
                r#"{"operations": [
                    {"action": "creation", "target": "character", "prompt": "add a dark wizard character"},
                    {"action": "creation", "target": "location", "prompt": "create a mysterious forest location"}
                ]}"#,
            )
            .reply(r#"{"name": "Malvor", "description": "A wizard who trades in shadows."}"#)
            .reply("```json\n{\"name\": \"Whisperwood\", \"description\": \"Fog that remembers.\"}\n```"),
    );
    let request = AgentRequest::new(
        "u1",
        "add a dark wizard character and create a mysterious forest location",
    );
    let (events, outcome) = run(&provider, request).await;

    assert_eq!(outcome.operations.len(), 2);
    assert_eq!(
        (outcome.operations[0].action, outcome.operations[0].target),
        (Action::Creation, Target::Character)
    );
    assert_eq!(
        (outcome.operations[1].action, outcome.operations[1].target),
        (Action::Creation, Target::Location)
    );
    assert_eq!(outcome.category, Some(Category::Creation));

    let scenario = outcome.scenario.expect("scenario");
    assert!(outcome.scenario_changed);
    assert_eq!(scenario.characters[0].id, "char_u1_0");
    assert_eq!(scenario.locations[0].name, "Whisperwood");
    assert_eq!(scenario.locations[0].id, "loc_u1_0");

    let tool_calls = of_type(&events, EventType::ToolCall);
    assert_eq!(tool_calls.len(), 2);
    assert_eq!(tool_calls[0].content, "create_scenario");
    assert_eq!(tool_calls[1].content, "update_scenario");

    let last = events.last().unwrap();
    assert_eq!(last.event_type, EventType::Completion);
    assert_eq!(last.metadata["scenario_changed"], true);
    assert!(outcome.follow_up_questions.len() <= 5);
    assert_eq!(provider.remaining(), 0);
}

#[tokio::test]
async fn test_pronoun_resolved_from_history() {
    let provider = Arc::new(
        ScriptedProvider::new()
            .reply(r#"{"operations": [{"action": "creation", "target": "character", "prompt": "add him to the story as a character"}]}"#)
            .reply(r#"{"description": "A brash tycoon with a gold elevator."}"#),
    );
    let mut request = AgentRequest::new("u1", "add him to the story as a character");
    request.conversation_history = vec![
        Turn::user("Tell me about Donald Trump"),
        Turn::assistant("He is a businessman and politician."),
    ];
    let (_, outcome) = run(&provider, request).await;

    assert_eq!(outcome.operations.len(), 1);
    let op = &outcome.operations[0];
    assert_eq!(op.context.referenced_entity(), Some("Donald Trump"));
    assert!(op.prompt.contains("Donald Trump"));
    assert_eq!(outcome.scenario.unwrap().characters[0].name, "Donald Trump");

    // The entity prompt must carry the resolved name.
    let requests = provider.requests();
    assert!(requests[1].messages.last().unwrap().content.contains("Donald Trump"));
}

#[tokio::test]
async fn test_pronoun_context_kept_when_backend_rewrites_prompt() {
    let provider = Arc::new(
        ScriptedProvider::new()
            .reply(r#"{"operations": [{"action": "creation", "target": "character", "prompt": "add Donald Trump to the story as a character"}]}"#)
            .reply(r#"{"description": "A brash tycoon."}"#),
    );
    let mut request = AgentRequest::new("u1", "add him to the story as a character");
    request.conversation_history = vec![Turn::user("Tell me about Donald Trump")];
    let (_, outcome) = run(&provider, request).await;

    assert_eq!(outcome.operations.len(), 1);
    let op = &outcome.operations[0];
    assert_eq!(op.prompt, "add Donald Trump to the story as a character");
    assert_eq!(op.context.referenced_entity(), Some("Donald Trump"));
    assert_eq!(op.context.reference_type.as_deref(), Some("character"));
    assert_eq!(outcome.scenario.unwrap().characters[0].name, "Donald Trump");
}

#[tokio::test]
async fn test_failed_operation_does_not_stop_the_next() {
    let provider = Arc::new(
        ScriptedProvider::new()
            .fail("upstream timeout")
            .reply(r#"{"name": "Whisperwood", "description": "Old trees."}"#),
    );
    let request = precommitted(
        "add a wizard and a forest",
        vec![
            Operation::new(Action::Creation, Target::Character, "add a dark wizard"),
            Operation::new(Action::Creation, Target::Location, "create a forest"),
        ],
    );
    let (events, outcome) = run(&provider, request).await;

    let errors = of_type(&events, EventType::Error);
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].metadata["op_index"], 0);
    assert_eq!(errors[0].metadata["kind"], "backend");

    assert!(outcome.error.is_some());
    assert!(outcome.response.starts_with("Sorry"));
    assert!(outcome.response.contains("Whisperwood"));
    let scenario = outcome.scenario.unwrap();
    assert!(scenario.characters.is_empty());
    assert_eq!(scenario.locations.len(), 1);
    assert_eq!(events.last().unwrap().event_type, EventType::Completion);
}

#[tokio::test]
async fn test_stalled_backend_times_out_and_sequence_continues() {
    let provider = Arc::new(
        ScriptedProvider::new()
            .stall()
            .reply(r#"{"name": "Whisperwood", "description": "Old trees."}"#),
    );
    let settings = EngineSettings {
        request_timeout: Duration::from_millis(100),
        ..EngineSettings::default()
    };
    let dyn_provider: Arc<dyn LlmProvider> = provider.clone();
    let engine = Arc::new(Engine::new(dyn_provider, settings));
    let request = precommitted(
        "add a wizard and a forest",
        vec![
            Operation::new(Action::Creation, Target::Character, "add a dark wizard"),
            Operation::new(Action::Creation, Target::Location, "create a forest"),
        ],
    );
    let (events, outcome) = engine.spawn(request).collect().await.unwrap();

    let errors = of_type(&events, EventType::Error);
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].metadata["op_index"], 0);
    assert_eq!(errors[0].metadata["kind"], "backend");
    assert!(errors[0].content.contains("did not answer"));

    assert!(!outcome.cancelled);
    assert!(outcome.response.starts_with("Sorry, I ran into a problem creating the character"));
    assert_eq!(outcome.scenario.unwrap().locations[0].name, "Whisperwood");
    assert_eq!(events.last().unwrap().event_type, EventType::Completion);
}

#[tokio::test]
async fn test_streamed_chat_matches_extracted_scenario_text() {
    let scenario_json = r#"{"title": "Salt and Ash", "synopsis": "A port burns.", "characters": [{"name": "Mira"}], "locations": [{"name": "Quay"}]}"#;
    let provider = Arc::new(ScriptedProvider::new().with_chunk_chars(7).reply(scenario_json));
    let request = precommitted(
        "create a scenario about a burning port",
        vec![Operation::new(
            Action::Creation,
            Target::Scenario,
            "create a scenario about a burning port",
        )],
    );
    let (events, outcome) = run(&provider, request).await;

    let tool_index = events
        .iter()
        .position(|e| e.event_type == EventType::ToolCall)
        .expect("tool_call event");
    let streamed: String = events[..tool_index]
        .iter()
        .filter(|e| e.event_type == EventType::Chat)
        .map(|e| e.content.as_str())
        .collect();
    assert_eq!(streamed, scenario_json);

    let entity = &events[tool_index].metadata["parameters"]["scenario"];
    assert_eq!(entity["title"], "Salt and Ash");
    assert_eq!(entity["characters"][0]["id"], "char_u1_0");
    assert_eq!(entity["locations"][0]["id"], "loc_u1_0");

    assert_eq!(outcome.scenario.unwrap().title, "Salt and Ash");
}

#[tokio::test]
async fn test_third_character_id() {
    let provider = Arc::new(ScriptedProvider::new().reply(r#"{"name": "Ash", "description": "A stowaway."}"#));
    let mut request = precommitted(
        "add a stowaway",
        vec![Operation::new(Action::Creation, Target::Character, "add a stowaway")],
    );
    request.scenario = Some(two_characters());
    let (_, outcome) = run(&provider, request).await;

    let scenario = outcome.scenario.unwrap();
    assert_eq!(scenario.characters.len(), 3);
    assert_eq!(scenario.characters[2].id, "char_u1_2");
    assert_eq!(scenario.characters[0].id, "char_u1_0");
}

#[tokio::test]
async fn test_modification_keeps_entity_id() {
    let provider = Arc::new(
        ScriptedProvider::new().reply(r#"{"id": "char_x_9", "name": "Tobin", "description": "Now grey-haired."}"#),
    );
    let mut request = precommitted(
        "make Tobin older",
        vec![Operation::new(Action::Modification, Target::Character, "make Tobin older")],
    );
    request.scenario = Some(two_characters());
    let (_, outcome) = run(&provider, request).await;

    let scenario = outcome.scenario.unwrap();
    assert_eq!(scenario.characters[1].id, "char_u1_1");
    assert_eq!(scenario.characters[1].description, "Now grey-haired.");
    assert_eq!(scenario.characters[0].name, "Mira");
}

#[tokio::test]
async fn test_ambiguous_target_asks_without_backend_call() {
    let provider = Arc::new(ScriptedProvider::new());
    let mut request = precommitted(
        "make them taller",
        vec![Operation::new(Action::Modification, Target::Character, "make them taller")],
    );
    request.scenario = Some(two_characters());
    let (events, outcome) = run(&provider, request).await;

    assert!(provider.requests().is_empty());
    assert_eq!(outcome.response, "Which character do you mean: Mira or Tobin?");
    assert!(!outcome.scenario_changed);
    assert!(outcome.error.is_none());
    assert!(of_type(&events, EventType::ToolCall).is_empty());
    assert!(of_type(&events, EventType::Error).is_empty());
}

#[tokio::test]
async fn test_unparseable_classification_falls_back_to_keywords() {
    let provider = Arc::new(
        ScriptedProvider::new()
            .reply("I'm not sure what you mean.")
            .reply("Doing well, thanks for asking."),
    );
    let (events, outcome) = run(&provider, AgentRequest::new("u1", "hello there, nice to meet you")).await;

    assert_eq!(outcome.operations.len(), 1);
    assert_eq!(outcome.operations[0].action, Action::GeneralConversation);
    assert_eq!(outcome.response, "Doing well, thanks for asking.");
    assert_eq!(outcome.follow_up_questions.len(), 2);
    assert!(of_type(&events, EventType::Error).is_empty());
}

#[tokio::test]
async fn test_cancel_stops_without_completion() {
    let provider = Arc::new(ScriptedProvider::new().stall());
    let request = precommitted(
        "tell me a story",
        vec![Operation::new(Action::GeneralConversation, Target::General, "tell me a story")],
    );
    let handle = engine(&provider).spawn(request);
    handle.cancel();
    let (events, outcome) = handle.collect().await.unwrap();

    assert!(outcome.cancelled);
    assert!(of_type(&events, EventType::Completion).is_empty());
    assert!(!outcome.scenario_changed);
}

#[tokio::test]
async fn test_completion_metadata_carries_changed_scenario() {
    let provider = Arc::new(ScriptedProvider::new().reply(r#"{"value": "The war ended in a truce."}"#));
    let mut request = precommitted(
        "write a backstory",
        vec![Operation::new(Action::Creation, Target::Backstory, "write a backstory")],
    );
    request.scenario = Some(two_characters());
    let (events, outcome) = run(&provider, request).await;

    let completion = events.last().unwrap();
    assert_eq!(completion.event_type, EventType::Completion);
    assert_eq!(
        completion.metadata["scenario"]["backstory"],
        json!("The war ended in a truce.")
    );
    assert_eq!(outcome.scenario.unwrap().backstory, "The war ended in a truce.");
}
