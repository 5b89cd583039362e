//! Libvirt machine provider implementation
//!
//! Builds run inside a local KVM domain booted from a qcow2 overlay of the
//! spec's base image, with SSH access injected through a cloud-init seed
//! ISO. Captured images are compressed qcow2 files in the image directory,
//! each with a JSON sidecar holding name, description and tags.

use crate::virsh::{self, DomainState, Virsh};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kiln_cloud::{
    CloudError, Endpoint, Image, MachineProvider, Resource, ResourceKind, ResourceTracker,
    Result, WaitPolicy,
};
use kiln_config::ImageSpec;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::Mutex;

pub const DEFAULT_URI: &str = "qemu:///system";
pub const DEFAULT_IMAGE_DIR: &str = "/var/lib/libvirt/images";

/// Named sizings: (vcpus, memory MiB, disk size).
const INSTANCE_TYPES: &[(&str, u32, u64, &str)] = &[
    ("small", 1, 1024, "10G"),
    ("medium", 2, 4096, "20G"),
    ("large", 4, 8192, "40G"),
    ("xlarge", 8, 16384, "80G"),
];

/// Graceful shutdown grace period before a hard power-off.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Copy)]
struct Sizing {
    vcpus: u32,
    memory_mb: u64,
    disk_size: &'static str,
}

/// Resolve vcpus/memory/disk from the named type with explicit overrides
/// taking precedence.
fn resolve_sizing(spec: &ImageSpec) -> Result<(u32, u64, String)> {
    let base = match spec.instance_type.as_deref() {
        Some(name) => {
            let entry = INSTANCE_TYPES
                .iter()
                .find(|(n, ..)| *n == name)
                .ok_or_else(|| {
                    let valid: Vec<&str> = INSTANCE_TYPES.iter().map(|(n, ..)| *n).collect();
                    CloudError::InvalidConfig(format!(
                        "unknown instance_type '{name}', valid types: {}",
                        valid.join(", ")
                    ))
                })?;
            Sizing {
                vcpus: entry.1,
                memory_mb: entry.2,
                disk_size: entry.3,
            }
        }
        None => Sizing {
            vcpus: 2,
            memory_mb: 2048,
            disk_size: "20G",
        },
    };

    Ok((
        spec.vcpus.unwrap_or(base.vcpus),
        spec.memory_mb.unwrap_or(base.memory_mb),
        spec.disk_size
            .clone()
            .unwrap_or_else(|| base.disk_size.to_string()),
    ))
}

fn render_domain_xml(
    name: &str,
    vcpus: u32,
    memory_mb: u64,
    disk: &Path,
    seed_iso: &Path,
    network: &str,
) -> String {
    format!(
        r#"<domain type='kvm'>
  <name>{name}</name>
  <memory unit='MiB'>{memory_mb}</memory>
  <vcpu>{vcpus}</vcpu>
  <os>
    <type arch='x86_64'>hvm</type>
    <boot dev='hd'/>
  </os>
  <features>
    <acpi/>
    <apic/>
  </features>
  <cpu mode='host-passthrough'/>
  <devices>
    <disk type='file' device='disk'>
      <driver name='qemu' type='qcow2'/>
      <source file='{disk}'/>
      <target dev='vda' bus='virtio'/>
    </disk>
    <disk type='file' device='cdrom'>
      <driver name='qemu' type='raw'/>
      <source file='{seed}'/>
      <target dev='sda' bus='sata'/>
      <readonly/>
    </disk>
    <interface type='network'>
      <source network='{network}'/>
      <model type='virtio'/>
    </interface>
    <serial type='pty'>
      <target port='0'/>
    </serial>
    <console type='pty'>
      <target type='serial' port='0'/>
    </console>
    <channel type='unix'>
      <target type='virtio' name='org.qemu.guest_agent.0'/>
    </channel>
  </devices>
</domain>
"#,
        name = name,
        memory_mb = memory_mb,
        vcpus = vcpus,
        disk = disk.display(),
        seed = seed_iso.display(),
        network = network,
    )
}

fn cloud_init_user_data(user: &str, public_key: &str) -> String {
    format!(
        r#"#cloud-config
users:
  - name: {user}
    sudo: ALL=(ALL) NOPASSWD:ALL
    shell: /bin/bash
    ssh_authorized_keys:
      - {public_key}
ssh_pwauth: false
manage_etc_hosts: true
package_update: false
package_upgrade: false
"#
    )
}

/// JSON sidecar written next to each captured qcow2.
#[derive(Debug, Serialize, Deserialize)]
struct Sidecar {
    name: String,
    #[serde(default)]
    description: String,
    created_at: DateTime<Utc>,
    #[serde(default)]
    tags: BTreeMap<String, String>,
}

#[derive(Default)]
struct BuildState {
    disk: Option<PathBuf>,
    private_key: Option<String>,
}

pub struct LibvirtProvider {
    virsh: Virsh,
    image_dir: PathBuf,
    state: Mutex<BuildState>,
}

impl LibvirtProvider {
    pub fn new(uri: impl Into<String>, image_dir: impl Into<PathBuf>) -> Self {
        Self {
            virsh: Virsh::new(uri),
            image_dir: image_dir.into(),
            state: Mutex::new(BuildState::default()),
        }
    }

    fn qcow2_path(&self, id: &str) -> PathBuf {
        let file = if id.ends_with(".qcow2") {
            id.to_string()
        } else {
            format!("{id}.qcow2")
        };
        self.image_dir.join(file)
    }

    fn sidecar_path(&self, id: &str) -> PathBuf {
        self.qcow2_path(id).with_extension("json")
    }

    fn load_image(&self, path: &Path) -> Result<Image> {
        let id = path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| CloudError::ImageNotFound(path.display().to_string()))?
            .to_string();

        let meta = std::fs::metadata(path)?;
        let mut image = match std::fs::read_to_string(path.with_extension("json")) {
            Ok(raw) => {
                let sidecar: Sidecar = serde_json::from_str(&raw)?;
                let mut image = Image::new(&id, &sidecar.name)
                    .with_description(&sidecar.description)
                    .with_created_at(sidecar.created_at);
                for (k, v) in &sidecar.tags {
                    image = image.with_metadata(k, serde_json::Value::from(v.as_str()));
                }
                image
            }
            // Pre-existing images without a sidecar still show up.
            Err(_) => {
                let created: DateTime<Utc> = meta
                    .modified()
                    .map(DateTime::from)
                    .unwrap_or_else(|_| Utc::now());
                Image::new(&id, &id).with_created_at(created)
            }
        };
        image = image.with_metadata("size", serde_json::Value::from(meta.len()));
        image = image.with_metadata(
            "path",
            serde_json::Value::from(path.display().to_string()),
        );
        Ok(image)
    }

    async fn shutdown_domain(&self, domain: &str) -> Result<()> {
        if self.virsh.state(domain).await? != DomainState::Running {
            return Ok(());
        }
        tracing::info!("Shutting down domain {domain}");
        self.virsh.shutdown(domain).await?;

        let start = tokio::time::Instant::now();
        while self.virsh.state(domain).await? != DomainState::ShutOff {
            if start.elapsed() >= SHUTDOWN_TIMEOUT {
                tracing::warn!("Domain {domain} ignored the shutdown, powering off");
                self.virsh.destroy(domain).await?;
                break;
            }
            tokio::time::sleep(Duration::from_secs(2)).await;
        }
        Ok(())
    }
}

#[async_trait]
impl MachineProvider for LibvirtProvider {
    fn name(&self) -> &str {
        "libvirt"
    }

    async fn provision(
        &self,
        spec: &ImageSpec,
        tracker: &mut ResourceTracker,
    ) -> Result<Resource> {
        let base = spec.base_image.path().ok_or_else(|| {
            CloudError::InvalidConfig("libvirt builds reference the base image by path".into())
        })?;
        if !base.exists() {
            return Err(CloudError::InvalidConfig(format!(
                "base image {} does not exist",
                base.display()
            )));
        }
        let (vcpus, memory_mb, disk_size) = resolve_sizing(spec)?;
        let network = spec
            .network
            .as_ref()
            .map(|n| n.name.as_str())
            .unwrap_or("default");

        let suffix = Utc::now().format("%Y%m%d%H%M%S");
        let domain = format!("kiln-{}-{suffix}", spec.name);

        // /var/tmp so qemu running as its own user can reach the files
        let work_dir = PathBuf::from(format!("/var/tmp/{domain}"));
        std::fs::create_dir_all(&work_dir)?;
        std::fs::set_permissions(&work_dir, std::fs::Permissions::from_mode(0o755))?;
        tracker.register(Resource::new(
            ResourceKind::WorkDir,
            work_dir.display().to_string(),
        ));
        tracing::info!("Work directory {}", work_dir.display());

        let (private_key, public_key) = virsh::generate_keypair(&work_dir).await?;

        let disk = work_dir.join("disk.qcow2");
        tracing::info!("Preparing overlay disk from {}", base.display());
        virsh::create_overlay(base, &disk, Some(&disk_size)).await?;
        std::fs::set_permissions(&disk, std::fs::Permissions::from_mode(0o666))?;

        std::fs::write(
            work_dir.join("user-data"),
            cloud_init_user_data(&spec.user, &public_key),
        )?;
        std::fs::write(
            work_dir.join("meta-data"),
            format!("instance-id: {domain}\nlocal-hostname: {domain}\n"),
        )?;
        let seed_iso = work_dir.join("seed.iso");
        virsh::make_seed_iso(&work_dir, &seed_iso).await?;
        std::fs::set_permissions(&seed_iso, std::fs::Permissions::from_mode(0o644))?;

        let xml = render_domain_xml(&domain, vcpus, memory_mb, &disk, &seed_iso, network);
        let xml_path = work_dir.join("domain.xml");
        std::fs::write(&xml_path, xml)?;

        tracing::info!("Defining and starting domain {domain}");
        self.virsh.define(&xml_path).await?;
        let machine = Resource::new(ResourceKind::Instance, &domain);
        tracker.register(machine.clone());
        self.virsh.start(&domain).await?;

        let mut state = self.state.lock().await;
        state.disk = Some(disk);
        state.private_key = Some(private_key);

        Ok(machine)
    }

    async fn wait_for_endpoint(
        &self,
        machine: &Resource,
        spec: &ImageSpec,
        policy: &WaitPolicy,
    ) -> Result<Endpoint> {
        tracing::info!("Waiting for domain {} to get an address", machine.handle);
        let start = tokio::time::Instant::now();
        loop {
            if let Some(addr) = self.virsh.ipv4_address(&machine.handle).await? {
                tracing::info!("Domain {} is reachable at {addr}", machine.handle);
                let mut endpoint = Endpoint::new(addr, &spec.user);
                if let Some(key) = self.state.lock().await.private_key.clone() {
                    endpoint = endpoint.with_private_key(key);
                }
                return Ok(endpoint);
            }
            if start.elapsed() >= policy.timeout {
                return Err(CloudError::NetworkTimeout {
                    waited_secs: start.elapsed().as_secs(),
                    reason: format!("domain {} never published an IPv4 lease", machine.handle),
                });
            }
            tokio::time::sleep(policy.poll_interval).await;
        }
    }

    async fn capture(&self, machine: &Resource, spec: &ImageSpec) -> Result<Image> {
        let disk = self
            .state
            .lock()
            .await
            .disk
            .clone()
            .ok_or_else(|| CloudError::Capture("no build disk recorded".into()))?;

        self.shutdown_domain(&machine.handle)
            .await
            .map_err(|e| CloudError::Capture(e.to_string()))?;

        std::fs::create_dir_all(&self.image_dir)?;
        let dest = self.qcow2_path(&spec.name);
        if dest.exists() {
            return Err(CloudError::ImageExists(spec.name.clone()));
        }
        tracing::info!("Writing compressed image to {}", dest.display());
        virsh::convert_compressed(&disk, &dest)
            .await
            .map_err(|e| CloudError::Capture(e.to_string()))?;

        let sidecar = Sidecar {
            name: spec.name.clone(),
            description: spec.description.clone(),
            created_at: Utc::now(),
            tags: spec.tags.clone(),
        };
        std::fs::write(
            self.sidecar_path(&spec.name),
            serde_json::to_string_pretty(&sidecar)?,
        )?;

        self.load_image(&dest)
    }

    async fn cleanup(&self, resource: &Resource) -> Result<()> {
        match resource.kind {
            ResourceKind::Instance => {
                if !self.virsh.exists(&resource.handle).await? {
                    return Ok(());
                }
                self.shutdown_domain(&resource.handle).await?;
                tracing::info!("Undefining domain {}", resource.handle);
                self.virsh.undefine(&resource.handle).await
            }
            ResourceKind::WorkDir => {
                let path = Path::new(&resource.handle);
                if path.exists() {
                    tracing::info!("Removing work directory {}", resource.handle);
                    std::fs::remove_dir_all(path)?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    async fn list_images(&self) -> Result<Vec<Image>> {
        let mut images = Vec::new();
        let entries = match std::fs::read_dir(&self.image_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(images),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some("qcow2") {
                images.push(self.load_image(&path)?);
            }
        }
        Ok(images)
    }

    async fn get_image(&self, id: &str) -> Result<Image> {
        let path = self.qcow2_path(id);
        if !path.exists() {
            return Err(CloudError::ImageNotFound(id.to_string()));
        }
        let mut image = self.load_image(&path)?;
        // qemu-img sees the virtual size and format; nice to have in info
        if let Ok(info) = virsh::image_info(&path).await {
            if let Some(virtual_size) = info.get("virtual-size") {
                image = image.with_metadata("virtual_size", virtual_size.clone());
            }
            if let Some(format) = info.get("format") {
                image = image.with_metadata("format", format.clone());
            }
        }
        Ok(image)
    }

    async fn delete_image(&self, id: &str) -> Result<()> {
        let path = self.qcow2_path(id);
        if !path.exists() {
            return Err(CloudError::ImageNotFound(id.to_string()));
        }
        tracing::info!("Deleting {}", path.display());
        std::fs::remove_file(&path)?;
        let sidecar = self.sidecar_path(id);
        if sidecar.exists() {
            std::fs::remove_file(sidecar)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec_json(extra: &str) -> ImageSpec {
        serde_json::from_str(&format!(
            r#"{{
                "name": "base-img",
                "provider": "libvirt",
                "base_image": {{"path": "/tmp/base.qcow2"}},
                "user": "ubuntu"
                {extra}
            }}"#
        ))
        .unwrap()
    }

    #[test]
    fn test_resolve_sizing_named_type() {
        let spec = spec_json(r#", "instance_type": "medium""#);
        let (vcpus, memory, disk) = resolve_sizing(&spec).unwrap();
        assert_eq!((vcpus, memory, disk.as_str()), (2, 4096, "20G"));
    }

    #[test]
    fn test_resolve_sizing_overrides_beat_named_type() {
        let spec = spec_json(r#", "instance_type": "small", "vcpus": 4, "disk_size": "50G""#);
        let (vcpus, memory, disk) = resolve_sizing(&spec).unwrap();
        assert_eq!((vcpus, memory, disk.as_str()), (4, 1024, "50G"));
    }

    #[test]
    fn test_resolve_sizing_unknown_type_is_rejected() {
        let spec = spec_json(r#", "instance_type": "gigantic""#);
        let err = resolve_sizing(&spec).unwrap_err();
        assert!(matches!(err, CloudError::InvalidConfig(_)));
    }

    #[test]
    fn test_domain_xml_names_disk_and_network() {
        let xml = render_domain_xml(
            "kiln-web-1",
            2,
            2048,
            Path::new("/var/tmp/kiln-web-1/disk.qcow2"),
            Path::new("/var/tmp/kiln-web-1/seed.iso"),
            "default",
        );
        assert!(xml.contains("<name>kiln-web-1</name>"));
        assert!(xml.contains("<memory unit='MiB'>2048</memory>"));
        assert!(xml.contains("<source file='/var/tmp/kiln-web-1/disk.qcow2'/>"));
        assert!(xml.contains("<source file='/var/tmp/kiln-web-1/seed.iso'/>"));
        assert!(xml.contains("<source network='default'/>"));
    }

    #[test]
    fn test_user_data_injects_user_and_key() {
        let data = cloud_init_user_data("deploy", "ssh-ed25519 AAAA kiln-builder");
        assert!(data.starts_with("#cloud-config"));
        assert!(data.contains("- name: deploy"));
        assert!(data.contains("- ssh-ed25519 AAAA kiln-builder"));
    }

    #[tokio::test]
    async fn test_catalogue_round_trip_through_sidecars() {
        let dir = tempfile::tempdir().unwrap();
        let provider = LibvirtProvider::new(DEFAULT_URI, dir.path());

        std::fs::write(dir.path().join("web-01.qcow2"), b"not a real qcow2").unwrap();
        let sidecar = Sidecar {
            name: "web-01".to_string(),
            description: "nginx builder".to_string(),
            created_at: Utc::now(),
            tags: BTreeMap::from([("team".to_string(), "infra".to_string())]),
        };
        std::fs::write(
            dir.path().join("web-01.json"),
            serde_json::to_string(&sidecar).unwrap(),
        )
        .unwrap();
        // an old image without a sidecar still lists
        std::fs::write(dir.path().join("legacy.qcow2"), b"old").unwrap();

        let images = provider.list_images().await.unwrap();
        assert_eq!(images.len(), 2);
        let web = images.iter().find(|i| i.id == "web-01").unwrap();
        assert_eq!(web.description, "nginx builder");
        assert_eq!(
            web.metadata.get("team"),
            Some(&serde_json::Value::from("infra"))
        );

        provider.delete_image("web-01").await.unwrap();
        assert!(!dir.path().join("web-01.qcow2").exists());
        assert!(!dir.path().join("web-01.json").exists());

        let err = provider.delete_image("web-01").await.unwrap_err();
        assert!(matches!(err, CloudError::ImageNotFound(_)));
    }
}
