//! The `ImageSpec` build description
//!
//! An image spec is a small JSON or YAML document describing one bake:
//! which backend to build on, which base image to start from, how large the
//! builder machine should be, what to upload and run, and what to call the
//! captured image.

use crate::error::{ConfigError, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Backend selector for a bake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Ec2,
    OpenStack,
    Libvirt,
}

impl std::str::FromStr for ProviderKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "ec2" | "aws" => Ok(ProviderKind::Ec2),
            "openstack" => Ok(ProviderKind::OpenStack),
            "libvirt" => Ok(ProviderKind::Libvirt),
            other => Err(ConfigError::Invalid(format!(
                "unknown provider '{other}' (expected ec2, openstack or libvirt)"
            ))),
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderKind::Ec2 => write!(f, "ec2"),
            ProviderKind::OpenStack => write!(f, "openstack"),
            ProviderKind::Libvirt => write!(f, "libvirt"),
        }
    }
}

/// Reference to the image a build starts from.
///
/// The shape differs per backend: EC2 specs map regions to AMI ids,
/// OpenStack specs name a Glance image, libvirt specs point at a local
/// qcow2 file. A bare string is taken as a backend-native id.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum BaseImage {
    Named { name: String },
    Path { path: PathBuf },
    PerRegion(BTreeMap<String, String>),
    Id(String),
}

impl BaseImage {
    /// AMI id for a region, for per-region maps (EC2).
    pub fn for_region(&self, region: &str) -> Option<&str> {
        match self {
            BaseImage::PerRegion(map) => map.get(region).map(String::as_str),
            BaseImage::Id(id) => Some(id),
            _ => None,
        }
    }

    /// Image name, for named references (OpenStack).
    pub fn name(&self) -> Option<&str> {
        match self {
            BaseImage::Named { name } => Some(name),
            BaseImage::Id(id) => Some(id),
            _ => None,
        }
    }

    /// Local disk path, for file-backed references (libvirt).
    pub fn path(&self) -> Option<&Path> {
        match self {
            BaseImage::Path { path } => Some(path),
            _ => None,
        }
    }
}

/// Network selection for the builder machine.
#[derive(Debug, Clone, Deserialize)]
pub struct NetworkSpec {
    pub name: String,

    /// Attach a floating IP so the machine is reachable from outside the
    /// tenant network (OpenStack).
    #[serde(default, rename = "floating-ip", alias = "floating_ip")]
    pub floating_ip: bool,
}

/// Immutable description of one image build.
#[derive(Debug, Clone, Deserialize)]
pub struct ImageSpec {
    pub name: String,

    #[serde(default)]
    pub description: String,

    pub provider: ProviderKind,

    pub base_image: BaseImage,

    /// Named size (`t3.micro`, flavor name, or the libvirt size table).
    #[serde(default)]
    pub instance_type: Option<String>,

    /// Explicit sizing, overriding `instance_type` (libvirt only).
    #[serde(default)]
    pub vcpus: Option<u32>,
    #[serde(default)]
    pub memory_mb: Option<u64>,
    #[serde(default)]
    pub disk_size: Option<String>,

    #[serde(default)]
    pub network: Option<NetworkSpec>,

    /// local path -> remote path, copied before any command runs.
    /// BTreeMap so upload order is deterministic.
    #[serde(default)]
    pub uploads: BTreeMap<String, String>,

    /// Provisioning commands, executed strictly in order.
    #[serde(default)]
    pub commands: Vec<String>,

    /// Remote login user.
    pub user: String,

    /// EC2 region, or libvirt connection URI when set for libvirt specs.
    #[serde(default)]
    pub region: Option<String>,

    /// Scrub the guest (host keys, machine-id, logs) before capture.
    #[serde(default)]
    pub sysprep: bool,

    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl ImageSpec {
    /// Load a spec from a `.json`, `.yaml` or `.yml` file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::SpecNotFound(path.to_path_buf()));
        }

        let content = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_ascii_lowercase();

        let spec: ImageSpec = match ext.as_str() {
            "json" => serde_json::from_str(&content)?,
            "yaml" | "yml" => serde_yaml::from_str(&content)?,
            other => return Err(ConfigError::UnsupportedFormat(other.to_string())),
        };

        spec.validate()?;
        Ok(spec)
    }

    /// Check the spec before any resource is created.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::MissingField {
                field: "name",
                reason: "image name must not be empty".into(),
            });
        }
        if self.user.trim().is_empty() {
            return Err(ConfigError::MissingField {
                field: "user",
                reason: "connection user must not be empty".into(),
            });
        }

        match self.provider {
            ProviderKind::Ec2 => {
                let region = self.region.as_deref().ok_or(ConfigError::MissingField {
                    field: "region",
                    reason: "ec2 specs must name a region".into(),
                })?;
                if self.base_image.for_region(region).is_none() {
                    return Err(ConfigError::MissingField {
                        field: "base_image",
                        reason: format!("no AMI mapped for region '{region}'"),
                    });
                }
                if self.instance_type.is_none() {
                    return Err(ConfigError::MissingField {
                        field: "instance_type",
                        reason: "ec2 specs must name an instance type".into(),
                    });
                }
            }
            ProviderKind::OpenStack => {
                if self.base_image.name().is_none() {
                    return Err(ConfigError::MissingField {
                        field: "base_image",
                        reason: "openstack specs reference the base image by name".into(),
                    });
                }
                if self.instance_type.is_none() {
                    return Err(ConfigError::MissingField {
                        field: "instance_type",
                        reason: "openstack specs must name a flavor".into(),
                    });
                }
                if self.network.is_none() {
                    return Err(ConfigError::MissingField {
                        field: "network",
                        reason: "openstack specs must name a network".into(),
                    });
                }
            }
            ProviderKind::Libvirt => {
                if self.base_image.path().is_none() {
                    return Err(ConfigError::MissingField {
                        field: "base_image",
                        reason: "libvirt specs reference the base image by path".into(),
                    });
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn ec2_json() -> &'static str {
        r#"{
            "name": "web-01",
            "description": "nginx builder",
            "provider": "ec2",
            "region": "eu-central-1",
            "instance_type": "t3.micro",
            "base_image": {"eu-central-1": "ami-0abcdef12"},
            "user": "ubuntu",
            "uploads": {"files/app.conf": "/tmp/app.conf"},
            "commands": ["sudo apt-get update", "sudo apt-get install -y nginx"]
        }"#
    }

    #[test]
    fn test_load_json_spec() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("web.json");
        fs::write(&path, ec2_json()).unwrap();

        let spec = ImageSpec::load(&path).unwrap();
        assert_eq!(spec.name, "web-01");
        assert_eq!(spec.provider, ProviderKind::Ec2);
        assert_eq!(
            spec.base_image.for_region("eu-central-1"),
            Some("ami-0abcdef12")
        );
        assert_eq!(spec.commands.len(), 2);
    }

    #[test]
    fn test_load_yaml_spec() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vm.yaml");
        fs::write(
            &path,
            r#"
name: base-vm
provider: libvirt
base_image:
  path: /var/lib/libvirt/images/noble.qcow2
instance_type: medium
user: ubuntu
commands:
  - sudo apt-get update
"#,
        )
        .unwrap();

        let spec = ImageSpec::load(&path).unwrap();
        assert_eq!(spec.provider, ProviderKind::Libvirt);
        assert_eq!(
            spec.base_image.path().unwrap(),
            Path::new("/var/lib/libvirt/images/noble.qcow2")
        );
    }

    #[test]
    fn test_unsupported_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spec.toml");
        fs::write(&path, "name = 'x'").unwrap();

        match ImageSpec::load(&path) {
            Err(ConfigError::UnsupportedFormat(ext)) => assert_eq!(ext, "toml"),
            other => panic!("expected UnsupportedFormat, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_region_for_ec2() {
        let mut spec: ImageSpec = serde_json::from_str(ec2_json()).unwrap();
        spec.region = None;

        match spec.validate() {
            Err(ConfigError::MissingField { field, .. }) => assert_eq!(field, "region"),
            other => panic!("expected MissingField, got {other:?}"),
        }
    }

    #[test]
    fn test_ami_must_exist_for_region() {
        let mut spec: ImageSpec = serde_json::from_str(ec2_json()).unwrap();
        spec.region = Some("us-east-1".into());

        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_openstack_requires_network() {
        let spec: std::result::Result<ImageSpec, _> = serde_json::from_str(
            r#"{
                "name": "web-01",
                "provider": "openstack",
                "instance_type": "m1.small",
                "base_image": {"name": "ubuntu-24.04"},
                "user": "ubuntu"
            }"#,
        );
        let spec = spec.unwrap();
        match spec.validate() {
            Err(ConfigError::MissingField { field, .. }) => assert_eq!(field, "network"),
            other => panic!("expected MissingField, got {other:?}"),
        }
    }

    #[test]
    fn test_network_floating_ip_aliases() {
        let net: NetworkSpec =
            serde_json::from_str(r#"{"name": "public", "floating-ip": true}"#).unwrap();
        assert!(net.floating_ip);

        let net: NetworkSpec =
            serde_json::from_str(r#"{"name": "public", "floating_ip": true}"#).unwrap();
        assert!(net.floating_ip);
    }

    #[test]
    fn test_uploads_iterate_in_key_order() {
        let spec: ImageSpec = serde_json::from_str(
            r#"{
                "name": "x", "provider": "libvirt",
                "base_image": {"path": "/img/base.qcow2"},
                "user": "ubuntu",
                "uploads": {"b.txt": "/tmp/b", "a.txt": "/tmp/a"}
            }"#,
        )
        .unwrap();

        let sources: Vec<_> = spec.uploads.keys().cloned().collect();
        assert_eq!(sources, vec!["a.txt", "b.txt"]);
    }

    #[test]
    fn test_provider_kind_from_str() {
        assert_eq!("aws".parse::<ProviderKind>().unwrap(), ProviderKind::Ec2);
        assert_eq!(
            "OpenStack".parse::<ProviderKind>().unwrap(),
            ProviderKind::OpenStack
        );
        assert!("vsphere".parse::<ProviderKind>().is_err());
    }
}
