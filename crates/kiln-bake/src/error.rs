//! Bake error types
//!
//! Every variant that can occur after a resource was registered carries the
//! outcome of the teardown pass alongside the primary cause: cleanup
//! trouble is attached, never substituted for the error that actually
//! failed the build.

use kiln_cloud::{CleanupError, CloudError, Image};
use kiln_remote::RemoteError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BakeError {
    /// Spec rejected before anything was created; no cleanup was needed.
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Provisioning failed: {source}")]
    Provision {
        #[source]
        source: CloudError,
        cleanup: Option<CleanupError>,
    },

    #[error("Machine never became reachable: {reason}")]
    NetworkTimeout {
        reason: String,
        cleanup: Option<CleanupError>,
    },

    #[error("Configuration failed: {source}")]
    Command {
        #[source]
        source: RemoteError,
        cleanup: Option<CleanupError>,
    },

    #[error("Image capture failed: {source}")]
    Capture {
        #[source]
        source: CloudError,
        cleanup: Option<CleanupError>,
    },

    #[error("Build interrupted")]
    Interrupted { cleanup: Option<CleanupError> },

    /// The image was produced, but one or more transient resources could
    /// not be released and may need manual removal.
    #[error("Image '{}' was created, but cleanup failed: {}", .image.name, .cleanup)]
    CleanupOnly { image: Image, cleanup: CleanupError },
}

impl BakeError {
    /// Secondary cleanup failure attached to this error, if any.
    pub fn cleanup_error(&self) -> Option<&CleanupError> {
        match self {
            BakeError::Validation(_) => None,
            BakeError::Provision { cleanup, .. }
            | BakeError::NetworkTimeout { cleanup, .. }
            | BakeError::Command { cleanup, .. }
            | BakeError::Capture { cleanup, .. }
            | BakeError::Interrupted { cleanup } => cleanup.as_ref(),
            BakeError::CleanupOnly { cleanup, .. } => Some(cleanup),
        }
    }

    /// Process exit code, so calling scripts can tell "nothing was
    /// created" (2) from "build failed, cleanup ran" (3) from "something
    /// may need manual cleanup" (4).
    pub fn exit_code(&self) -> i32 {
        match self {
            BakeError::Validation(_) => 2,
            BakeError::CleanupOnly { .. } => 4,
            _ => 3,
        }
    }
}

/// Error of the provisioning-through-capture phase, before the cleanup
/// outcome is known.
#[derive(Debug)]
pub(crate) enum PhaseError {
    Provision(CloudError),
    Network(String),
    Command(RemoteError),
    Capture(CloudError),
    Interrupted,
}

impl PhaseError {
    pub(crate) fn into_bake(self, cleanup: Option<CleanupError>) -> BakeError {
        match self {
            PhaseError::Provision(source) => BakeError::Provision { source, cleanup },
            PhaseError::Network(reason) => BakeError::NetworkTimeout { reason, cleanup },
            PhaseError::Command(source) => BakeError::Command { source, cleanup },
            PhaseError::Capture(source) => BakeError::Capture { source, cleanup },
            PhaseError::Interrupted => BakeError::Interrupted { cleanup },
        }
    }
}
