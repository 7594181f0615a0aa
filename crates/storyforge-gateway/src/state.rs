//! Gateway shared state.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use storyforge_agent::Engine;
use storyforge_core::config::Config;

use crate::gate::Gate;

/// Shared state accessible from all handlers.
pub struct GatewayState {
    pub config: Arc<Config>,
    pub engine: Arc<Engine>,
    /// Guards the engine's backend route.
    pub gate: Gate,
    pub started_at: Instant,
    pub runs_total: AtomicU64,
    #[cfg(feature = "metrics")]
    pub prometheus: Option<metrics_exporter_prometheus::PrometheusHandle>,
}

impl GatewayState {
    pub fn new(config: Arc<Config>, engine: Arc<Engine>) -> Self {
        let gate = Gate::new(engine.provider_id());
        Self {
            config,
            engine,
            gate,
            started_at: Instant::now(),
            runs_total: AtomicU64::new(0),
            #[cfg(feature = "metrics")]
            prometheus: None,
        }
    }

    #[cfg(feature = "metrics")]
    pub fn with_prometheus(mut self, handle: metrics_exporter_prometheus::PrometheusHandle) -> Self {
        self.prometheus = Some(handle);
        self
    }

    pub fn bump_runs(&self) -> u64 {
        self.runs_total.fetch_add(1, Ordering::SeqCst) + 1
    }
}
