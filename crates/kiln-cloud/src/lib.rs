//! kiln machine-provider abstraction
//!
//! Everything the bake orchestrator knows about a backend lives here: the
//! [`MachineProvider`] capability set, the opaque [`Resource`] and
//! [`Endpoint`] handles it trades in, the [`Image`] artifact, and the
//! [`ResourceTracker`] that guarantees every created resource is offered
//! back for release.
//!
//! ```text
//! ┌────────────────────────────────────────────┐
//! │                 kiln-bake                   │
//! │        (state machine, one per build)       │
//! └───────────────────┬────────────────────────┘
//!                     │
//! ┌───────────────────▼────────────────────────┐
//! │                 kiln-cloud                  │
//! │  trait MachineProvider   ResourceTracker    │
//! └──────┬───────────────┬──────────────┬──────┘
//!        │               │              │
//! ┌──────▼─────┐ ┌───────▼─────┐ ┌──────▼─────┐
//! │    ec2     │ │  openstack  │ │  libvirt   │
//! └────────────┘ └─────────────┘ └────────────┘
//! ```

pub mod error;
pub mod provider;
pub mod tracker;

pub use error::{CleanupError, CloudError, Result};
pub use provider::{
    Endpoint, Image, MachineProvider, Resource, ResourceKind, WaitPolicy,
};
pub use tracker::ResourceTracker;
