//! Build-spec loading for kiln
//!
//! A kiln build is described by a single JSON or YAML file (the
//! [`ImageSpec`]). This crate owns the spec model, file loading and the
//! pre-flight validation that runs before any cloud resource is created.

pub mod error;
pub mod spec;

pub use error::{ConfigError, Result};
pub use spec::{BaseImage, ImageSpec, NetworkSpec, ProviderKind};
