//! General conversation, streamed with recent history as context.

use async_trait::async_trait;

use storyforge_core::scenario::Scenario;
use storyforge_core::types::{Operation, ToolAction};
use storyforge_providers::{ChatMessage, CompletionRequest};

use super::{Handler, HandlerContext, HandlerOutput};
use crate::error::AgentError;
use crate::prompt;

/// Free conversation, with recent history as chat context.
pub struct ChatHandler;

#[async_trait]
impl Handler for ChatHandler {
    async fn handle(
        &self,
        ctx: &HandlerContext<'_>,
        op: &Operation,
        scenario: Option<&Scenario>,
    ) -> Result<HandlerOutput, AgentError> {
        let mut request = CompletionRequest::new(ctx.settings.model.clone(), ctx.settings.max_tokens)
            .with_system(prompt::chat_system(scenario))
            .with_temperature(ctx.settings.temperature);
        for message in prompt::history_messages(ctx.history, ctx.settings.history_window) {
            request = request.push(message);
        }
        let request = request.push(ChatMessage::user(op.prompt.clone()));

        let streamed = ctx.stream(request, ToolAction::Chat, None).await?;
        if let Some(err) = streamed.error {
            return Ok(HandlerOutput::failed(
                "Sorry, I lost my train of thought there. Could you say that again?",
                err,
            ));
        }
        Ok(HandlerOutput::reply(streamed.text.trim()))
    }
}
