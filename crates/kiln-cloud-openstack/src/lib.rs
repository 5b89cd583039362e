//! OpenStack machine provider for kiln
//!
//! Talks straight to the REST APIs: Keystone for the token, Nova for
//! servers and keypairs, Neutron for security groups and floating IPs,
//! Glance for the image catalogue. Capture stops the builder server and
//! snapshots it; the spec's tags become Glance image properties.
//!
//! Credentials come from the standard `OS_*` environment variables.

mod api;
pub mod auth;
pub mod provider;

pub use auth::OsCredentials;
pub use provider::OpenStackProvider;
