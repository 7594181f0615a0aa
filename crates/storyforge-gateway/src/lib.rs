//! HTTP gateway for the Storyforge engine.
//!
//! Each request runs the engine once. `POST /v1/agent/stream` relays events
//! as server-sent events while the run progresses; `POST /v1/agent` buffers
//! them. Both share a single-flight [`gate::Gate`] per backend route and
//! answer 429 while it is held.

pub mod gate;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod server;
pub mod state;

pub use server::{router, start_gateway};
pub use state::GatewayState;
