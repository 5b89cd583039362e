//! Amazon EC2 machine provider for kiln
//!
//! Builds run on a throwaway instance launched from the spec's per-region
//! AMI, reachable through a generated key pair and a temporary SSH-only
//! security group. Capture produces an AMI carrying the spec's name,
//! description and tags.
//!
//! Credentials come from the standard AWS chain (environment variables,
//! shared profile, instance metadata).

mod error;
pub mod provider;

pub use provider::Ec2Provider;
