//! Single-flight gate: at most one generation in flight per backend route.
//!
//! Acquisition never waits. A request that finds the gate held is rejected
//! right away and the caller retries later. The permit is released when it
//! is dropped, however the holder exits.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

#[derive(Debug, Error)]
#[error("backend route '{route}' is busy")]
pub struct GateBusy {
    pub route: String,
}

#[derive(Clone)]
pub struct Gate {
    route: String,
    permits: Arc<Semaphore>,
}

impl Gate {
    pub fn new(route: impl Into<String>) -> Self {
        Self {
            route: route.into(),
            permits: Arc::new(Semaphore::new(1)),
        }
    }

    pub fn route(&self) -> &str {
        &self.route
    }

    pub fn try_enter(&self) -> Result<GatePermit, GateBusy> {
        match Arc::clone(&self.permits).try_acquire_owned() {
            Ok(permit) => {
                debug!(route = %self.route, "Gate acquired");
                Ok(GatePermit {
                    route: self.route.clone(),
                    _permit: permit,
                })
            }
            Err(_) => Err(GateBusy {
                route: self.route.clone(),
            }),
        }
    }

    pub fn is_busy(&self) -> bool {
        self.permits.available_permits() == 0
    }
}

/// Held for the lifetime of one run.
pub struct GatePermit {
    route: String,
    _permit: OwnedSemaphorePermit,
}

impl Drop for GatePermit {
    fn drop(&mut self) {
        debug!(route = %self.route, "Gate released");
    }
}
