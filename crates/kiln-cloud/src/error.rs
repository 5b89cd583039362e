//! Provider error types

use crate::provider::Resource;
use thiserror::Error;

/// Errors surfaced by machine providers
#[derive(Error, Debug)]
pub enum CloudError {
    #[error("Provisioning failed: {0}")]
    Provision(String),

    #[error("Machine did not become reachable within {waited_secs}s: {reason}")]
    NetworkTimeout { waited_secs: u64, reason: String },

    #[error("Image capture failed: {0}")]
    Capture(String),

    #[error("Image not found: {0}")]
    ImageNotFound(String),

    #[error("An image named '{0}' already exists")]
    ImageExists(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("API error: {0}")]
    Api(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CloudError>;

/// Aggregated failure from a best-effort teardown pass.
///
/// Always reported as a secondary cause; the error that routed the build
/// into cleanup stays primary.
#[derive(Debug)]
pub struct CleanupError {
    /// Resources that could not be released, with the release error.
    pub failures: Vec<(Resource, String)>,
}

impl std::fmt::Display for CleanupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "failed to release {} resource(s):",
            self.failures.len()
        )?;
        for (resource, reason) in &self.failures {
            write!(f, " [{resource}: {reason}]")?;
        }
        Ok(())
    }
}

impl std::error::Error for CleanupError {}
