//! Per-invocation build context

use crate::state::BakeState;
use kiln_cloud::{Endpoint, ResourceTracker};

/// Mutable context for one bake.
///
/// Created fresh per invocation and exclusively owned by one orchestrator
/// run; it holds the resources created so far and the machine's endpoint
/// once known, and is discarded after cleanup.
#[derive(Debug)]
pub struct BakeSession {
    state: BakeState,
    pub tracker: ResourceTracker,
    pub endpoint: Option<Endpoint>,
}

impl BakeSession {
    pub fn new() -> Self {
        Self {
            state: BakeState::Pending,
            tracker: ResourceTracker::new(),
            endpoint: None,
        }
    }

    pub fn state(&self) -> BakeState {
        self.state
    }

    pub(crate) fn transition(&mut self, next: BakeState) {
        tracing::info!("Bake: {} -> {}", self.state, next);
        self.state = next;
    }
}

impl Default for BakeSession {
    fn default() -> Self {
        Self::new()
    }
}
