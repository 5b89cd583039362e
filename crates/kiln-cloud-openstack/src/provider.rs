//! OpenStack machine provider implementation

use crate::api::{GlanceImage, OsApi};
use crate::auth::{self, OsCredentials};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kiln_cloud::{
    CloudError, Endpoint, Image, MachineProvider, Resource, ResourceKind, ResourceTracker,
    Result, WaitPolicy,
};
use kiln_config::ImageSpec;
use std::time::Duration;
use tokio::sync::Mutex;

/// Snapshots upload through Glance and take much longer than a boot.
const CAPTURE_TIMEOUT: Duration = Duration::from_secs(1200);

/// Per-build material stashed between `provision` and the later steps.
#[derive(Default)]
struct BuildState {
    private_key: Option<String>,
    /// Created during `provision`, bound to the server once it is ACTIVE.
    floating_ip: Option<(String, String)>,
}

pub struct OpenStackProvider {
    api: OsApi,
    state: Mutex<BuildState>,
}

impl OpenStackProvider {
    /// Authenticate against Keystone using the `OS_*` environment.
    pub async fn connect() -> Result<Self> {
        let creds = OsCredentials::from_env()?;
        let client = reqwest::Client::new();
        let session = auth::authenticate(&client, &creds).await?;
        Ok(Self {
            api: OsApi::new(client, session),
            state: Mutex::new(BuildState::default()),
        })
    }

    async fn find_image_by_name(&self, name: &str) -> Result<Option<GlanceImage>> {
        let images = self.api.list_glance_images().await?;
        Ok(images
            .into_iter()
            .find(|i| i.name.as_deref() == Some(name)))
    }

    /// Stop the server and wait until Nova reports SHUTOFF; snapshotting a
    /// running machine risks a dirty filesystem in the image.
    async fn stop_and_settle(&self, server_id: &str, policy: &WaitPolicy) -> Result<()> {
        tracing::info!("Stopping server {server_id} before capture");
        self.api.stop_server(server_id).await?;

        let start = tokio::time::Instant::now();
        loop {
            let server = self.api.get_server(server_id).await?;
            if server.status == "SHUTOFF" {
                return Ok(());
            }
            if start.elapsed() >= policy.timeout {
                return Err(CloudError::Capture(format!(
                    "server {server_id} did not stop within {}s",
                    start.elapsed().as_secs()
                )));
            }
            tokio::time::sleep(policy.poll_interval).await;
        }
    }
}

#[async_trait]
impl MachineProvider for OpenStackProvider {
    fn name(&self) -> &str {
        "openstack"
    }

    async fn provision(
        &self,
        spec: &ImageSpec,
        tracker: &mut ResourceTracker,
    ) -> Result<Resource> {
        let base_name = spec.base_image.name().ok_or_else(|| {
            CloudError::InvalidConfig("openstack builds reference the base image by name".into())
        })?;
        let flavor_name = spec.instance_type.as_deref().ok_or_else(|| {
            CloudError::InvalidConfig("openstack builds need an instance_type (flavor)".into())
        })?;
        let network = spec.network.as_ref().ok_or_else(|| {
            CloudError::InvalidConfig("openstack builds must name a network".into())
        })?;

        let base = self
            .find_image_by_name(base_name)
            .await?
            .ok_or_else(|| CloudError::ImageNotFound(base_name.to_string()))?;
        let flavor_id = self.api.find_flavor(flavor_name).await?;
        let network_id = self.api.find_network(&network.name).await?;

        let suffix = Utc::now().format("%Y%m%d%H%M%S");
        let key_name = format!("kiln-key-{}-{suffix}", spec.name);
        let sg_name = format!("kiln-grp-{}-{suffix}", spec.name);

        tracing::info!("Creating keypair {key_name}");
        let keypair = self.api.create_keypair(&key_name).await?;
        tracker.register(Resource::new(ResourceKind::KeyPair, &keypair.name));

        tracing::info!("Creating security group {sg_name}");
        let sg_id = self
            .api
            .create_security_group(&sg_name, "kiln temporary group for image builds")
            .await?;
        tracker.register(Resource::new(ResourceKind::SecurityGroup, &sg_id));
        self.api.allow_ssh_ingress(&sg_id).await?;

        tracing::info!("Booting server from image '{base_name}' ({})", base.id);
        let server_id = self
            .api
            .boot_server(
                &format!("kiln-builder-{}-{suffix}", spec.name),
                &base.id,
                &flavor_id,
                &network_id,
                &keypair.name,
                &sg_name,
            )
            .await?;
        let machine = Resource::new(ResourceKind::Instance, &server_id);
        tracker.register(machine.clone());

        let mut state = self.state.lock().await;
        state.private_key = Some(keypair.private_key);

        if network.floating_ip {
            let fip = self.api.create_floating_ip().await?;
            tracing::info!("Allocated floating IP {}", fip.floating_ip_address);
            tracker.register(Resource::new(ResourceKind::FloatingIp, &fip.id));
            state.floating_ip = Some((fip.id, fip.floating_ip_address));
        }

        Ok(machine)
    }

    async fn wait_for_endpoint(
        &self,
        machine: &Resource,
        spec: &ImageSpec,
        policy: &WaitPolicy,
    ) -> Result<Endpoint> {
        let network_name = spec
            .network
            .as_ref()
            .map(|n| n.name.as_str())
            .unwrap_or_default();

        tracing::info!("Waiting for server {} to become ACTIVE", machine.handle);
        let start = tokio::time::Instant::now();
        let server = loop {
            let server = self.api.get_server(&machine.handle).await?;
            match server.status.as_str() {
                "ACTIVE" => break server,
                "ERROR" => {
                    return Err(CloudError::Provision(format!(
                        "server {} went into ERROR state",
                        machine.handle
                    )));
                }
                other => {
                    tracing::debug!("Server {} is {other}", machine.handle);
                }
            }
            if start.elapsed() >= policy.timeout {
                return Err(CloudError::NetworkTimeout {
                    waited_secs: start.elapsed().as_secs(),
                    reason: format!("server {} never became ACTIVE", machine.handle),
                });
            }
            tokio::time::sleep(policy.poll_interval).await;
        };

        let state = self.state.lock().await;
        let host = if let Some((fip_id, fip_addr)) = &state.floating_ip {
            self.api.associate_floating_ip(fip_id, &machine.handle).await?;
            tracing::info!("Bound floating IP {fip_addr} to {}", machine.handle);
            fip_addr.clone()
        } else {
            server
                .address(network_name)
                .map(str::to_string)
                .ok_or_else(|| CloudError::NetworkTimeout {
                    waited_secs: start.elapsed().as_secs(),
                    reason: format!(
                        "server {} has no address on network '{network_name}'",
                        machine.handle
                    ),
                })?
        };

        let mut endpoint = Endpoint::new(host, &spec.user);
        if let Some(key) = state.private_key.clone() {
            endpoint = endpoint.with_private_key(key);
        }
        Ok(endpoint)
    }

    async fn capture(&self, machine: &Resource, spec: &ImageSpec) -> Result<Image> {
        self.stop_and_settle(&machine.handle, &WaitPolicy::default())
            .await?;

        let mut metadata = spec.tags.clone();
        if !spec.description.is_empty() {
            metadata.insert("description".to_string(), spec.description.clone());
        }

        tracing::info!("Snapshotting server {} as '{}'", machine.handle, spec.name);
        let image_id = self
            .api
            .snapshot_server(&machine.handle, &spec.name, &metadata)
            .await
            .map_err(|e| CloudError::Capture(e.to_string()))?;

        tracing::info!("Waiting for image {image_id} to become active");
        let start = tokio::time::Instant::now();
        loop {
            let glance = self.api.get_glance_image(&image_id).await?;
            match glance.status.as_str() {
                "active" => return Ok(to_image(&glance)),
                "killed" | "deleted" => {
                    return Err(CloudError::Capture(format!(
                        "image {image_id} ended up {}",
                        glance.status
                    )));
                }
                _ => {}
            }
            if start.elapsed() >= CAPTURE_TIMEOUT {
                return Err(CloudError::Capture(format!(
                    "image {image_id} still not active after {}s",
                    start.elapsed().as_secs()
                )));
            }
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
    }

    async fn cleanup(&self, resource: &Resource) -> Result<()> {
        match resource.kind {
            ResourceKind::Instance => {
                tracing::info!("Deleting server {}", resource.handle);
                self.api.delete_server(&resource.handle).await?;

                // The security group cannot go while ports still use it.
                let policy = WaitPolicy::default();
                let start = tokio::time::Instant::now();
                while self.api.try_get_server(&resource.handle).await?.is_some() {
                    if start.elapsed() >= policy.timeout {
                        return Err(CloudError::Api(format!(
                            "server {} still present after {}s",
                            resource.handle,
                            start.elapsed().as_secs()
                        )));
                    }
                    tokio::time::sleep(policy.poll_interval).await;
                }
                Ok(())
            }
            ResourceKind::SecurityGroup => {
                tracing::info!("Deleting security group {}", resource.handle);
                self.api.delete_security_group(&resource.handle).await
            }
            ResourceKind::KeyPair => {
                tracing::info!("Deleting keypair {}", resource.handle);
                self.api.delete_keypair(&resource.handle).await
            }
            ResourceKind::FloatingIp => {
                tracing::info!("Releasing floating IP {}", resource.handle);
                self.api.delete_floating_ip(&resource.handle).await
            }
            _ => Ok(()),
        }
    }

    async fn list_images(&self) -> Result<Vec<Image>> {
        let images = self.api.list_glance_images().await?;
        Ok(images.iter().map(to_image).collect())
    }

    async fn get_image(&self, id: &str) -> Result<Image> {
        Ok(to_image(&self.api.get_glance_image(id).await?))
    }

    async fn delete_image(&self, id: &str) -> Result<()> {
        tracing::info!("Deleting image {id}");
        self.api.delete_glance_image(id).await
    }
}

fn to_image(glance: &GlanceImage) -> Image {
    let name = glance.name.as_deref().unwrap_or(&glance.id);
    let mut image = Image::new(&glance.id, name);
    if let Some(desc) = glance
        .properties
        .get("description")
        .and_then(|v| v.as_str())
    {
        image = image.with_description(desc);
    }
    if let Some(created) = glance
        .created_at
        .as_deref()
        .and_then(|d| DateTime::parse_from_rfc3339(d).ok())
    {
        image = image.with_created_at(created.with_timezone(&Utc));
    }
    image = image.with_metadata("status", serde_json::Value::from(glance.status.as_str()));
    if let Some(format) = &glance.disk_format {
        image = image.with_metadata("disk_format", serde_json::Value::from(format.as_str()));
    }
    if let Some(size) = glance.size {
        image = image.with_metadata("size", serde_json::Value::from(size));
    }
    image
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn test_to_image_reads_description_property_and_created_at() {
        let glance: GlanceImage = serde_json::from_value(json!({
            "id": "img-1",
            "name": "web-01",
            "status": "active",
            "created_at": "2024-03-01T12:30:00Z",
            "disk_format": "qcow2",
            "description": "nginx builder"
        }))
        .unwrap();

        let image = to_image(&glance);
        assert_eq!(image.name, "web-01");
        assert_eq!(image.description, "nginx builder");
        assert_eq!(
            image.created_at,
            Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap()
        );
        assert_eq!(
            image.metadata.get("disk_format"),
            Some(&serde_json::Value::from("qcow2"))
        );
    }
}
