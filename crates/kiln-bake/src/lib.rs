//! kiln bake orchestration
//!
//! Drives one image build end to end: validate the spec against the
//! catalogue, provision a throwaway machine, wait for it to be reachable,
//! configure it over SSH, capture the image, and release every transient
//! resource — on the success path and on every failure path alike.

pub mod baker;
pub mod catalogue;
pub mod error;
pub mod session;
pub mod state;

pub use baker::Baker;
pub use error::BakeError;
pub use session::BakeSession;
pub use state::BakeState;
