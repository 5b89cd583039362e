//! Local libvirt/KVM machine provider for kiln
//!
//! No cloud account needed: builds boot a KVM domain from an overlay of a
//! local qcow2 base image, with login access injected via a cloud-init
//! NoCloud seed. The catalogue is a directory of compressed qcow2 files
//! with JSON sidecars.
//!
//! Shells out to `virsh`, `qemu-img`, `genisoimage` and `ssh-keygen`,
//! which must be on the PATH.

pub mod provider;
pub mod virsh;

pub use provider::{DEFAULT_IMAGE_DIR, DEFAULT_URI, LibvirtProvider};
pub use virsh::Virsh;
