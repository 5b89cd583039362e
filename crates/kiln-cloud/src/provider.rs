//! Machine provider trait definition

use crate::error::Result;
use crate::tracker::ResourceTracker;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kiln_config::ImageSpec;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Machine provider abstraction
///
/// One implementation per backend (EC2, OpenStack, libvirt). The bake
/// orchestrator only ever sees this capability set; backend handles stay
/// opaque inside [`Resource`].
///
/// A provider instance drives a single build at a time: `provision` may
/// stash per-build material (generated SSH keys, work directories) that
/// `wait_for_endpoint` and `capture` read back.
#[async_trait]
pub trait MachineProvider: Send + Sync {
    /// Provider name (e.g. "ec2", "libvirt")
    fn name(&self) -> &str;

    /// Boot the builder machine described by `spec`.
    ///
    /// Ancillary resources (key pair, security group, floating IP, work
    /// directory) are created first; every successful creation — ancillary
    /// or the machine itself — must be registered with `tracker` the
    /// instant its handle is known, so a failure in any later step can
    /// never lose track of it. Returns the machine resource.
    async fn provision(&self, spec: &ImageSpec, tracker: &mut ResourceTracker)
    -> Result<Resource>;

    /// Poll until the machine has a reachable address, within `policy`.
    async fn wait_for_endpoint(
        &self,
        machine: &Resource,
        spec: &ImageSpec,
        policy: &WaitPolicy,
    ) -> Result<Endpoint>;

    /// Capture the configured machine as a durable image.
    async fn capture(&self, machine: &Resource, spec: &ImageSpec) -> Result<Image>;

    /// Release one created resource.
    ///
    /// Idempotent: releasing twice, or releasing a resource the backend
    /// already removed out-of-band, returns `Ok`.
    async fn cleanup(&self, resource: &Resource) -> Result<()>;

    /// All images owned by this account/backend.
    async fn list_images(&self) -> Result<Vec<Image>>;

    /// One image by id; `ImageNotFound` if absent.
    async fn get_image(&self, id: &str) -> Result<Image>;

    /// Delete one image by id; `ImageNotFound` if absent.
    async fn delete_image(&self, id: &str) -> Result<()>;
}

/// What kind of backend resource a handle refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Instance,
    SecurityGroup,
    KeyPair,
    FloatingIp,
    Volume,
    WorkDir,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceKind::Instance => write!(f, "instance"),
            ResourceKind::SecurityGroup => write!(f, "security-group"),
            ResourceKind::KeyPair => write!(f, "key-pair"),
            ResourceKind::FloatingIp => write!(f, "floating-ip"),
            ResourceKind::Volume => write!(f, "volume"),
            ResourceKind::WorkDir => write!(f, "work-dir"),
        }
    }
}

/// A backend resource created during a build: kind plus an opaque handle
/// (instance id, group id, key name, file path — whatever the backend
/// uses).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub kind: ResourceKind,
    pub handle: String,
}

impl Resource {
    pub fn new(kind: ResourceKind, handle: impl Into<String>) -> Self {
        Self {
            kind,
            handle: handle.into(),
        }
    }
}

impl std::fmt::Display for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.kind, self.handle)
    }
}

/// Where and how to reach the provisioned machine.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub user: String,
    /// PEM-encoded private key for the build's throwaway key pair, when
    /// the provider generated one.
    pub private_key: Option<String>,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: 22,
            user: user.into(),
            private_key: None,
        }
    }

    pub fn with_private_key(mut self, key: impl Into<String>) -> Self {
        self.private_key = Some(key.into());
        self
    }
}

/// The durable artifact of a successful bake.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Image {
    pub id: String,
    pub name: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
    /// Backend-specific details (state, format, size, ...).
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Image {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            created_at: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = at;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Bounds for the readiness waits (instance address, SSH probe).
///
/// Every poll-and-backoff loop in a build runs under one of these; both
/// knobs are configurable rather than hard-coded.
#[derive(Debug, Clone, Copy)]
pub struct WaitPolicy {
    /// Total time to wait before giving up.
    pub timeout: Duration,
    /// Pause between probes.
    pub poll_interval: Duration,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(600),
            poll_interval: Duration::from_secs(5),
        }
    }
}
