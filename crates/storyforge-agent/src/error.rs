use thiserror::Error;

use storyforge_providers::ProviderError;

use crate::extract::ParseError;

/// Failures inside a handler. None of these escape the supervisor: they are
/// turned into an apology line plus an in-band `error` event.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("backend call failed: {0}")]
    Backend(ProviderError),

    #[error("could not read the generated output: {0}")]
    Extraction(#[from] ParseError),

    #[error("generated {kind} is not usable: {reason}")]
    InvalidEntity { kind: &'static str, reason: String },

    #[error("request cancelled")]
    Cancelled,
}

impl AgentError {
    /// Short machine-readable tag carried in `error` event metadata.
    pub fn kind(&self) -> &'static str {
        match self {
            AgentError::Backend(_) => "backend",
            AgentError::Extraction(_) => "extraction",
            AgentError::InvalidEntity { .. } => "invalid_entity",
            AgentError::Cancelled => "cancelled",
        }
    }

    pub fn invalid(kind: &'static str, reason: impl Into<String>) -> Self {
        AgentError::InvalidEntity {
            kind,
            reason: reason.into(),
        }
    }
}

impl From<ProviderError> for AgentError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Cancelled => AgentError::Cancelled,
            other => AgentError::Backend(other),
        }
    }
}
