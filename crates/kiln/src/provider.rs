//! Provider construction from CLI flags and the spec

use crate::Cli;
use anyhow::Context;
use kiln_cloud::MachineProvider;
use kiln_cloud_ec2::Ec2Provider;
use kiln_cloud_libvirt::LibvirtProvider;
use kiln_cloud_openstack::OpenStackProvider;
use kiln_config::{ImageSpec, ProviderKind};
use std::sync::Arc;

/// Backend for a catalogue command, which has no spec to read it from.
pub fn require_provider(cli: &Cli) -> anyhow::Result<ProviderKind> {
    cli.provider
        .context("this command needs a backend: pass --provider ec2|openstack|libvirt")
}

pub async fn build(
    kind: ProviderKind,
    cli: &Cli,
    spec: Option<&ImageSpec>,
) -> anyhow::Result<Arc<dyn MachineProvider>> {
    Ok(match kind {
        ProviderKind::Ec2 => {
            let region = cli
                .region
                .clone()
                .or_else(|| spec.and_then(|s| s.region.clone()))
                .context("ec2 needs a region (--region or the spec's region field)")?;
            Arc::new(Ec2Provider::new(region).await)
        }
        ProviderKind::OpenStack => Arc::new(OpenStackProvider::connect().await?),
        ProviderKind::Libvirt => {
            // URI priority: --uri, then the spec's region field, then the
            // system default.
            let uri = cli
                .uri
                .clone()
                .or_else(|| spec.and_then(|s| s.region.clone()))
                .unwrap_or_else(|| kiln_cloud_libvirt::DEFAULT_URI.to_string());
            Arc::new(LibvirtProvider::new(uri, cli.image_dir.clone()))
        }
    })
}
