//! virsh and qemu-img CLI wrappers
//!
//! The provider shells out to the stock tooling instead of linking
//! libvirt: `virsh` for domain lifecycle, `qemu-img` for disk work,
//! `genisoimage` for the cloud-init seed. Everything runs through one
//! helper that turns a nonzero exit into `CloudError::Api` carrying
//! stderr.

use kiln_cloud::{CloudError, Result};
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;

pub(crate) async fn run_tool(program: &str, args: &[&str]) -> Result<String> {
    tracing::debug!("Running: {program} {}", args.join(" "));
    let output = Command::new(program)
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(CloudError::Api(format!(
            "{program} {}: {}",
            args.first().copied().unwrap_or_default(),
            stderr.trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

/// What `virsh domstate` reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainState {
    Running,
    ShutOff,
    Other,
}

/// virsh CLI wrapper, bound to one connection URI.
pub struct Virsh {
    uri: String,
}

impl Virsh {
    pub fn new(uri: impl Into<String>) -> Self {
        Self { uri: uri.into() }
    }

    async fn run(&self, args: &[&str]) -> Result<String> {
        let mut full = vec!["-c", self.uri.as_str()];
        full.extend_from_slice(args);
        run_tool("virsh", &full).await
    }

    pub async fn define(&self, xml_path: &Path) -> Result<()> {
        let path = xml_path.to_string_lossy();
        self.run(&["define", &path]).await?;
        Ok(())
    }

    pub async fn start(&self, domain: &str) -> Result<()> {
        self.run(&["start", domain]).await?;
        Ok(())
    }

    pub async fn shutdown(&self, domain: &str) -> Result<()> {
        self.run(&["shutdown", domain]).await?;
        Ok(())
    }

    /// Hard power-off.
    pub async fn destroy(&self, domain: &str) -> Result<()> {
        self.run(&["destroy", domain]).await?;
        Ok(())
    }

    pub async fn undefine(&self, domain: &str) -> Result<()> {
        self.run(&["undefine", domain]).await?;
        Ok(())
    }

    pub async fn exists(&self, domain: &str) -> Result<bool> {
        match self.run(&["dominfo", domain]).await {
            Ok(_) => Ok(true),
            Err(e) if is_missing_domain(&e) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn state(&self, domain: &str) -> Result<DomainState> {
        let out = self.run(&["domstate", domain]).await?;
        Ok(match out.trim() {
            "running" => DomainState::Running,
            "shut off" => DomainState::ShutOff,
            _ => DomainState::Other,
        })
    }

    /// IPv4 address of the domain, guest agent first, DHCP lease second.
    pub async fn ipv4_address(&self, domain: &str) -> Result<Option<String>> {
        for source in ["agent", "lease"] {
            match self.run(&["domifaddr", domain, "--source", source]).await {
                Ok(out) => {
                    if let Some(addr) = parse_domifaddr(&out) {
                        return Ok(Some(addr));
                    }
                }
                // The agent is not up until the guest has booted.
                Err(CloudError::Api(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }
}

fn is_missing_domain(err: &CloudError) -> bool {
    matches!(err, CloudError::Api(msg) if msg.contains("failed to get domain"))
}

/// Pick the first non-loopback IPv4 out of `virsh domifaddr` output:
///
/// ```text
///  Name       MAC address          Protocol     Address
/// ------------------------------------------------------------
///  vnet0      52:54:00:aa:bb:cc    ipv4         192.168.122.50/24
/// ```
pub(crate) fn parse_domifaddr(output: &str) -> Option<String> {
    for line in output.lines().skip(2) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let [name, _mac, protocol, address] = fields.as_slice() else {
            continue;
        };
        if *name == "lo" || *protocol != "ipv4" {
            continue;
        }
        let addr = address.split('/').next().unwrap_or(address);
        if addr.starts_with("127.") {
            continue;
        }
        return Some(addr.to_string());
    }
    None
}

// ---- qemu-img -----------------------------------------------------------

/// Create a qcow2 overlay backed by `base`, optionally grown to `size`.
pub(crate) async fn create_overlay(base: &Path, dest: &Path, size: Option<&str>) -> Result<()> {
    let base = base.to_string_lossy();
    let dest_str = dest.to_string_lossy();
    run_tool(
        "qemu-img",
        &[
            "create", "-f", "qcow2", "-b", &base, "-F", "qcow2", &dest_str,
        ],
    )
    .await?;
    if let Some(size) = size {
        run_tool("qemu-img", &["resize", &dest_str, size]).await?;
    }
    Ok(())
}

/// Flatten and compress `src` (and its backing chain) into `dest`.
pub(crate) async fn convert_compressed(src: &Path, dest: &Path) -> Result<()> {
    let src = src.to_string_lossy();
    let dest = dest.to_string_lossy();
    run_tool("qemu-img", &["convert", "-O", "qcow2", "-c", &src, &dest]).await?;
    Ok(())
}

/// `qemu-img info` as parsed JSON.
pub(crate) async fn image_info(path: &Path) -> Result<serde_json::Value> {
    let path = path.to_string_lossy();
    let out = run_tool("qemu-img", &["info", "--output=json", &path]).await?;
    Ok(serde_json::from_str(&out)?)
}

/// Build the cloud-init NoCloud seed ISO from a directory holding
/// `user-data` and `meta-data`.
pub(crate) async fn make_seed_iso(source_dir: &Path, iso_path: &Path) -> Result<()> {
    let iso = iso_path.to_string_lossy();
    let user_data = source_dir.join("user-data");
    let meta_data = source_dir.join("meta-data");
    run_tool(
        "genisoimage",
        &[
            "-output",
            &iso,
            "-volid",
            "cidata",
            "-joliet",
            "-rock",
            &user_data.to_string_lossy(),
            &meta_data.to_string_lossy(),
        ],
    )
    .await?;
    Ok(())
}

/// Generate a throwaway ed25519 keypair under `dir`, returning
/// (private key PEM, public key line).
pub(crate) async fn generate_keypair(dir: &Path) -> Result<(String, String)> {
    let key_path = dir.join("id_ed25519");
    run_tool(
        "ssh-keygen",
        &[
            "-q",
            "-t",
            "ed25519",
            "-N",
            "",
            "-C",
            "kiln-builder",
            "-f",
            &key_path.to_string_lossy(),
        ],
    )
    .await?;
    let private = std::fs::read_to_string(&key_path)?;
    let public = std::fs::read_to_string(key_path.with_extension("pub"))?;
    Ok((private, public.trim().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_domifaddr_picks_first_ipv4() {
        let out = "\
 Name       MAC address          Protocol     Address
-------------------------------------------------------------------------------
 vnet0      52:54:00:aa:bb:cc    ipv4         192.168.122.50/24
";
        assert_eq!(parse_domifaddr(out), Some("192.168.122.50".to_string()));
    }

    #[test]
    fn test_parse_domifaddr_skips_loopback_and_ipv6() {
        let out = "\
 Name       MAC address          Protocol     Address
-------------------------------------------------------------------------------
 lo         00:00:00:00:00:00    ipv4         127.0.0.1/8
 enp1s0     52:54:00:aa:bb:cc    ipv6         fe80::1/64
 enp1s0     52:54:00:aa:bb:cc    ipv4         192.168.122.80/24
";
        assert_eq!(parse_domifaddr(out), Some("192.168.122.80".to_string()));
    }

    #[test]
    fn test_parse_domifaddr_empty_table() {
        let out = "\
 Name       MAC address          Protocol     Address
-------------------------------------------------------------------------------
";
        assert_eq!(parse_domifaddr(out), None);
    }
}
