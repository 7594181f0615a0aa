//! Orchestration engine.
//!
//! The engine takes one free-text request plus optional scenario and history,
//! decomposes it into [`Operation`](storyforge_core::types::Operation)s, routes
//! each one to a handler and streams the handlers' output back as
//! [`StreamingEvent`](storyforge_core::protocol::StreamingEvent)s through an
//! [`EventSink`].
//!
//! Control flow: [`Engine::run`] → supervisor → classifier (unless the request
//! already carries operations) → sequencer → handler(s) → streaming executor
//! → wrap-up.

pub mod classify;
pub mod disambiguate;
pub mod engine;
pub mod error;
pub mod extract;
pub mod followups;
pub mod handlers;
pub mod keywords;
pub mod prompt;
pub mod references;
pub mod sequencer;
pub mod settings;
pub mod sink;
pub mod state;
pub mod streaming;
pub mod supervisor;

pub use engine::{AgentOutcome, Engine, RunHandle};
pub use error::AgentError;
pub use extract::{ParseError, extract};
pub use settings::EngineSettings;
pub use sink::EventSink;
