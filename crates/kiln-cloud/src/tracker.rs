//! Resource tracking for guaranteed teardown
//!
//! Every resource a provider creates is registered here the moment its
//! handle is known. Whatever happens afterwards — later step fails, build
//! is interrupted, capture succeeds — `release_all` offers every tracked
//! resource back to the provider exactly once, in reverse creation order.

use crate::error::CleanupError;
use crate::provider::{MachineProvider, Resource};

/// Ordered registry of the resources created during one build.
#[derive(Debug, Default)]
pub struct ResourceTracker {
    resources: Vec<Resource>,
}

impl ResourceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a created resource.
    ///
    /// Registering the same (kind, handle) pair twice is a no-op, so a
    /// retried creation path cannot double-track a handle.
    pub fn register(&mut self, resource: Resource) {
        if self.resources.contains(&resource) {
            tracing::debug!("{resource} already tracked, skipping");
            return;
        }
        tracing::debug!("tracking {resource}");
        self.resources.push(resource);
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    pub fn resources(&self) -> &[Resource] {
        &self.resources
    }

    /// Release everything, last created first.
    ///
    /// Dependent resources (a floating IP on an instance, an instance in a
    /// security group) release before what they depend on, which is what
    /// reverse creation order gives us on every backend kiln drives.
    ///
    /// Best-effort: one failed release is recorded and the remaining
    /// resources are still attempted. Drains the registry, so a second
    /// call has nothing left to release.
    pub async fn release_all(
        &mut self,
        provider: &dyn MachineProvider,
    ) -> Result<(), CleanupError> {
        let mut failures = Vec::new();

        for resource in self.resources.drain(..).rev() {
            tracing::info!("Releasing {resource}");
            if let Err(e) = provider.cleanup(&resource).await {
                tracing::warn!("Failed to release {resource}: {e}");
                failures.push((resource, e.to_string()));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(CleanupError { failures })
        }
    }
}
