//! Build-spec error types

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Spec file not found: {0}")]
    SpecNotFound(PathBuf),

    #[error("Unsupported spec format '{0}' (expected .json, .yaml or .yml)")]
    UnsupportedFormat(String),

    #[error("Missing key '{field}' in spec: {reason}")]
    MissingField { field: &'static str, reason: String },

    #[error("Invalid spec: {0}")]
    Invalid(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

pub type Result<T> = std::result::Result<T, ConfigError>;
