//! EC2 machine provider implementation

use crate::error::{api_error, is_not_found};
use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_ec2::Client;
use aws_sdk_ec2::types::{
    ImageState, InstanceStateName, InstanceType, IpPermission, IpRange, ResourceType, Tag,
    TagSpecification,
};
use chrono::{DateTime, Utc};
use kiln_cloud::{
    CloudError, Endpoint, Image, MachineProvider, Resource, ResourceKind, ResourceTracker,
    Result, WaitPolicy,
};
use kiln_config::ImageSpec;
use std::time::Duration;
use tokio::sync::Mutex;

/// AMIs take considerably longer to bake than an instance takes to boot.
const CAPTURE_TIMEOUT: Duration = Duration::from_secs(1200);

/// EC2-backed machine provider.
///
/// Each build launches a throwaway instance from the spec's per-region AMI
/// with a generated key pair and a temporary SSH-only security group.
pub struct Ec2Provider {
    client: Client,
    region: String,
    /// PEM material of the build's throwaway key pair, stashed by
    /// `provision` for `wait_for_endpoint`.
    key_material: Mutex<Option<String>>,
}

impl Ec2Provider {
    /// Connect using the ambient credential chain (environment, profile,
    /// instance metadata).
    pub async fn new(region: impl Into<String>) -> Self {
        let region = region.into();
        let config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(region.clone()))
            .load()
            .await;
        Self {
            client: Client::new(&config),
            region,
            key_material: Mutex::new(None),
        }
    }

    /// Running instance's address, `None` while it is still booting.
    /// Public IP preferred, private IP when none was assigned.
    async fn instance_address(&self, instance_id: &str) -> Result<Option<String>> {
        let resp = self
            .client
            .describe_instances()
            .instance_ids(instance_id)
            .send()
            .await
            .map_err(|e| api_error("describe_instances", e))?;

        let Some(instance) = resp
            .reservations()
            .iter()
            .flat_map(|r| r.instances())
            .next()
        else {
            return Ok(None);
        };

        let running = instance
            .state()
            .and_then(|s| s.name())
            .is_some_and(|name| *name == InstanceStateName::Running);
        if !running {
            return Ok(None);
        }

        Ok(instance
            .public_ip_address()
            .or(instance.private_ip_address())
            .map(str::to_string))
    }

    async fn describe_image(&self, image_id: &str) -> Result<aws_sdk_ec2::types::Image> {
        let resp = self
            .client
            .describe_images()
            .image_ids(image_id)
            .send()
            .await
            .map_err(|e| {
                if is_not_found(&e) {
                    CloudError::ImageNotFound(image_id.to_string())
                } else {
                    api_error("describe_images", e)
                }
            })?;

        resp.images()
            .first()
            .cloned()
            .ok_or_else(|| CloudError::ImageNotFound(image_id.to_string()))
    }

    /// Terminate and block until the state is terminal. The security group
    /// cannot be deleted while an instance still references it.
    async fn terminate_instance(&self, instance_id: &str) -> Result<()> {
        tracing::info!("Terminating instance {instance_id}");
        match self
            .client
            .terminate_instances()
            .instance_ids(instance_id)
            .send()
            .await
        {
            Ok(_) => {}
            Err(e) if is_not_found(&e) => return Ok(()),
            Err(e) => return Err(api_error("terminate_instances", e)),
        }

        let policy = WaitPolicy::default();
        let start = tokio::time::Instant::now();
        loop {
            let resp = match self
                .client
                .describe_instances()
                .instance_ids(instance_id)
                .send()
                .await
            {
                Ok(resp) => resp,
                Err(e) if is_not_found(&e) => return Ok(()),
                Err(e) => return Err(api_error("describe_instances", e)),
            };

            let state = resp
                .reservations()
                .iter()
                .flat_map(|r| r.instances())
                .next()
                .and_then(|i| i.state())
                .and_then(|s| s.name())
                .cloned();
            match state {
                None | Some(InstanceStateName::Terminated) => return Ok(()),
                _ => {}
            }

            if start.elapsed() >= policy.timeout {
                return Err(CloudError::Api(format!(
                    "instance {instance_id} still not terminated after {}s",
                    start.elapsed().as_secs()
                )));
            }
            tokio::time::sleep(policy.poll_interval).await;
        }
    }
}

#[async_trait]
impl MachineProvider for Ec2Provider {
    fn name(&self) -> &str {
        "ec2"
    }

    async fn provision(
        &self,
        spec: &ImageSpec,
        tracker: &mut ResourceTracker,
    ) -> Result<Resource> {
        let region = spec.region.as_deref().unwrap_or(&self.region);
        let ami = spec.base_image.for_region(region).ok_or_else(|| {
            CloudError::InvalidConfig(format!("no AMI mapped for region '{region}'"))
        })?;
        let instance_type = spec
            .instance_type
            .as_deref()
            .ok_or_else(|| CloudError::InvalidConfig("ec2 builds need an instance_type".into()))?;

        let suffix = Utc::now().format("%Y%m%d%H%M%S");
        let key_name = format!("kiln-key-{}-{suffix}", spec.name);
        let sg_name = format!("kiln-grp-{}-{suffix}", spec.name);

        tracing::info!("Creating key pair {key_name}");
        let key = self
            .client
            .create_key_pair()
            .key_name(&key_name)
            .send()
            .await
            .map_err(|e| api_error("create_key_pair", e))?;
        tracker.register(Resource::new(ResourceKind::KeyPair, &key_name));
        *self.key_material.lock().await = key.key_material;

        tracing::info!("Creating security group {sg_name}");
        let sg = self
            .client
            .create_security_group()
            .group_name(&sg_name)
            .description("kiln temporary group for image builds")
            .send()
            .await
            .map_err(|e| api_error("create_security_group", e))?;
        let sg_id = sg
            .group_id()
            .ok_or_else(|| CloudError::Provision("security group created without an id".into()))?
            .to_string();
        tracker.register(Resource::new(ResourceKind::SecurityGroup, &sg_id));

        self.client
            .authorize_security_group_ingress()
            .group_id(&sg_id)
            .ip_permissions(
                IpPermission::builder()
                    .ip_protocol("tcp")
                    .from_port(22)
                    .to_port(22)
                    .ip_ranges(IpRange::builder().cidr_ip("0.0.0.0/0").build())
                    .build(),
            )
            .send()
            .await
            .map_err(|e| api_error("authorize_security_group_ingress", e))?;

        tracing::info!("Launching {instance_type} instance from {ami}");
        let run = self
            .client
            .run_instances()
            .image_id(ami)
            .instance_type(InstanceType::from(instance_type))
            .key_name(&key_name)
            .security_group_ids(&sg_id)
            .min_count(1)
            .max_count(1)
            .tag_specifications(
                TagSpecification::builder()
                    .resource_type(ResourceType::Instance)
                    .tags(
                        Tag::builder()
                            .key("Name")
                            .value(format!("kiln image builder: {}", spec.name))
                            .build(),
                    )
                    .build(),
            )
            .send()
            .await
            .map_err(|e| api_error("run_instances", e))?;

        let instance_id = run
            .instances()
            .first()
            .and_then(|i| i.instance_id())
            .ok_or_else(|| CloudError::Provision("run_instances returned no instance".into()))?
            .to_string();
        let machine = Resource::new(ResourceKind::Instance, &instance_id);
        tracker.register(machine.clone());
        tracing::info!("Instance {instance_id} launched");
        Ok(machine)
    }

    async fn wait_for_endpoint(
        &self,
        machine: &Resource,
        spec: &ImageSpec,
        policy: &WaitPolicy,
    ) -> Result<Endpoint> {
        tracing::info!("Waiting for instance {} to run", machine.handle);
        let start = tokio::time::Instant::now();
        loop {
            if let Some(ip) = self.instance_address(&machine.handle).await? {
                tracing::info!("Instance {} is running at {ip}", machine.handle);
                let mut endpoint = Endpoint::new(ip, &spec.user);
                if let Some(key) = self.key_material.lock().await.clone() {
                    endpoint = endpoint.with_private_key(key);
                }
                return Ok(endpoint);
            }
            if start.elapsed() >= policy.timeout {
                return Err(CloudError::NetworkTimeout {
                    waited_secs: start.elapsed().as_secs(),
                    reason: format!(
                        "instance {} never reached running with an address",
                        machine.handle
                    ),
                });
            }
            tokio::time::sleep(policy.poll_interval).await;
        }
    }

    async fn capture(&self, machine: &Resource, spec: &ImageSpec) -> Result<Image> {
        tracing::info!("Creating image '{}' from {}", spec.name, machine.handle);
        let created = self
            .client
            .create_image()
            .instance_id(&machine.handle)
            .name(&spec.name)
            .description(&spec.description)
            .send()
            .await
            .map_err(|e| api_error("create_image", e))?;
        let image_id = created
            .image_id()
            .ok_or_else(|| CloudError::Capture("create_image returned no id".into()))?
            .to_string();

        let mut tags = vec![
            Tag::builder().key("Name").value(&spec.name).build(),
            Tag::builder()
                .key("Description")
                .value(&spec.description)
                .build(),
        ];
        for (k, v) in &spec.tags {
            tags.push(Tag::builder().key(k).value(v).build());
        }
        self.client
            .create_tags()
            .resources(&image_id)
            .set_tags(Some(tags))
            .send()
            .await
            .map_err(|e| api_error("create_tags", e))?;

        tracing::info!("Waiting for image {image_id} to become available");
        let start = tokio::time::Instant::now();
        loop {
            let ami = self.describe_image(&image_id).await?;
            if ami.state().is_some_and(|s| *s == ImageState::Available) {
                tracing::info!("Image {image_id} is ready");
                return Ok(to_image(&ami));
            }
            if start.elapsed() >= CAPTURE_TIMEOUT {
                return Err(CloudError::Capture(format!(
                    "image {image_id} still not available after {}s",
                    start.elapsed().as_secs()
                )));
            }
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
    }

    async fn cleanup(&self, resource: &Resource) -> Result<()> {
        match resource.kind {
            ResourceKind::Instance => self.terminate_instance(&resource.handle).await,
            ResourceKind::SecurityGroup => {
                tracing::info!("Deleting security group {}", resource.handle);
                match self
                    .client
                    .delete_security_group()
                    .group_id(&resource.handle)
                    .send()
                    .await
                {
                    Ok(_) => Ok(()),
                    Err(e) if is_not_found(&e) => Ok(()),
                    Err(e) => Err(api_error("delete_security_group", e)),
                }
            }
            ResourceKind::KeyPair => {
                tracing::info!("Deleting key pair {}", resource.handle);
                match self
                    .client
                    .delete_key_pair()
                    .key_name(&resource.handle)
                    .send()
                    .await
                {
                    Ok(_) => Ok(()),
                    Err(e) if is_not_found(&e) => Ok(()),
                    Err(e) => Err(api_error("delete_key_pair", e)),
                }
            }
            _ => Ok(()),
        }
    }

    async fn list_images(&self) -> Result<Vec<Image>> {
        let resp = self
            .client
            .describe_images()
            .owners("self")
            .send()
            .await
            .map_err(|e| api_error("describe_images", e))?;
        Ok(resp.images().iter().map(to_image).collect())
    }

    async fn get_image(&self, id: &str) -> Result<Image> {
        Ok(to_image(&self.describe_image(id).await?))
    }

    async fn delete_image(&self, id: &str) -> Result<()> {
        // surfaces ImageNotFound before the deregister call
        self.describe_image(id).await?;
        tracing::info!("Deregistering image {id}");
        self.client
            .deregister_image()
            .image_id(id)
            .send()
            .await
            .map_err(|e| {
                if is_not_found(&e) {
                    CloudError::ImageNotFound(id.to_string())
                } else {
                    api_error("deregister_image", e)
                }
            })?;
        Ok(())
    }
}

fn to_image(ami: &aws_sdk_ec2::types::Image) -> Image {
    let id = ami.image_id().unwrap_or_default();
    let name = ami.name().unwrap_or(id);
    let mut image = Image::new(id, name);
    if let Some(desc) = ami.description() {
        image = image.with_description(desc);
    }
    if let Some(created) = ami
        .creation_date()
        .and_then(|d| DateTime::parse_from_rfc3339(d).ok())
    {
        image = image.with_created_at(created.with_timezone(&Utc));
    }
    if let Some(state) = ami.state() {
        image = image.with_metadata("state", serde_json::Value::from(state.as_str()));
    }
    if let Some(arch) = ami.architecture() {
        image = image.with_metadata("architecture", serde_json::Value::from(arch.as_str()));
    }
    image
}
