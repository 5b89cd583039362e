//! Nova, Neutron and Glance REST calls
//!
//! One thin client over the three service endpoints. Every method maps a
//! single API call; the provider composes them into build steps.

use crate::auth::Session;
use kiln_cloud::{CloudError, Result};
use serde::Deserialize;
use serde_json::json;
use std::collections::{BTreeMap, HashMap};

pub(crate) struct OsApi {
    client: reqwest::Client,
    session: Session,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct Server {
    pub id: String,
    #[serde(default)]
    pub status: String,
    /// network name -> assigned addresses
    #[serde(default)]
    pub addresses: HashMap<String, Vec<Address>>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct Address {
    pub addr: String,
    #[serde(rename = "OS-EXT-IPS:type", default)]
    pub kind: String,
}

impl Server {
    /// Address to connect to: a floating address on any network wins,
    /// otherwise the fixed address on `network`.
    pub fn address(&self, network: &str) -> Option<&str> {
        self.addresses
            .values()
            .flatten()
            .find(|a| a.kind == "floating")
            .or_else(|| self.addresses.get(network).and_then(|v| v.first()))
            .map(|a| a.addr.as_str())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct Keypair {
    pub name: String,
    #[serde(default)]
    pub private_key: String,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct FloatingIp {
    pub id: String,
    pub floating_ip_address: String,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct GlanceImage {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub disk_format: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
    /// Free-form properties (kiln's tags land here).
    #[serde(flatten)]
    pub properties: HashMap<String, serde_json::Value>,
}

#[derive(Deserialize)]
struct IdName {
    id: String,
    #[serde(default)]
    name: String,
}

fn http_error(context: &str, err: reqwest::Error) -> CloudError {
    CloudError::Api(format!("{context}: {err}"))
}

impl OsApi {
    pub fn new(client: reqwest::Client, session: Session) -> Self {
        Self { client, session }
    }

    async fn check(context: &str, resp: reqwest::Response) -> Result<reqwest::Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let text = resp.text().await.unwrap_or_default();
        Err(CloudError::Api(format!("{context}: {status}: {text}")))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, context: &str, url: String) -> Result<T> {
        let resp = self
            .client
            .get(&url)
            .header("X-Auth-Token", &self.session.token)
            .send()
            .await
            .map_err(|e| http_error(context, e))?;
        Self::check(context, resp)
            .await?
            .json()
            .await
            .map_err(|e| http_error(context, e))
    }

    /// GET where a 404 is a meaningful answer, not an error.
    async fn get_json_opt<T: serde::de::DeserializeOwned>(
        &self,
        context: &str,
        url: String,
    ) -> Result<Option<T>> {
        let resp = self
            .client
            .get(&url)
            .header("X-Auth-Token", &self.session.token)
            .send()
            .await
            .map_err(|e| http_error(context, e))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let parsed = Self::check(context, resp)
            .await?
            .json()
            .await
            .map_err(|e| http_error(context, e))?;
        Ok(Some(parsed))
    }

    async fn post_json<T: serde::de::DeserializeOwned>(
        &self,
        context: &str,
        url: String,
        body: serde_json::Value,
    ) -> Result<T> {
        let resp = self
            .client
            .post(&url)
            .header("X-Auth-Token", &self.session.token)
            .json(&body)
            .send()
            .await
            .map_err(|e| http_error(context, e))?;
        Self::check(context, resp)
            .await?
            .json()
            .await
            .map_err(|e| http_error(context, e))
    }

    /// DELETE, treating 404 as already gone.
    async fn delete(&self, context: &str, url: String) -> Result<()> {
        let resp = self
            .client
            .delete(&url)
            .header("X-Auth-Token", &self.session.token)
            .send()
            .await
            .map_err(|e| http_error(context, e))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        Self::check(context, resp).await?;
        Ok(())
    }

    // ---- Nova -----------------------------------------------------------

    pub async fn find_flavor(&self, name: &str) -> Result<String> {
        #[derive(Deserialize)]
        struct Flavors {
            flavors: Vec<IdName>,
        }
        let flavors: Flavors = self
            .get_json("list flavors", format!("{}/flavors", self.session.compute))
            .await?;
        flavors
            .flavors
            .into_iter()
            .find(|f| f.name == name)
            .map(|f| f.id)
            .ok_or_else(|| CloudError::InvalidConfig(format!("no flavor named '{name}'")))
    }

    pub async fn create_keypair(&self, name: &str) -> Result<Keypair> {
        #[derive(Deserialize)]
        struct Wrapper {
            keypair: Keypair,
        }
        let body = json!({ "keypair": { "name": name } });
        let wrapper: Wrapper = self
            .post_json(
                "create keypair",
                format!("{}/os-keypairs", self.session.compute),
                body,
            )
            .await?;
        Ok(wrapper.keypair)
    }

    pub async fn delete_keypair(&self, name: &str) -> Result<()> {
        self.delete(
            "delete keypair",
            format!("{}/os-keypairs/{name}", self.session.compute),
        )
        .await
    }

    pub async fn boot_server(
        &self,
        name: &str,
        image_id: &str,
        flavor_id: &str,
        network_id: &str,
        key_name: &str,
        security_group: &str,
    ) -> Result<String> {
        #[derive(Deserialize)]
        struct Wrapper {
            server: IdName,
        }
        let body = json!({
            "server": {
                "name": name,
                "imageRef": image_id,
                "flavorRef": flavor_id,
                "key_name": key_name,
                "networks": [{ "uuid": network_id }],
                "security_groups": [{ "name": security_group }],
            }
        });
        let wrapper: Wrapper = self
            .post_json(
                "boot server",
                format!("{}/servers", self.session.compute),
                body,
            )
            .await?;
        Ok(wrapper.server.id)
    }

    pub async fn get_server(&self, id: &str) -> Result<Server> {
        self.try_get_server(id)
            .await?
            .ok_or_else(|| CloudError::Api(format!("server {id} not found")))
    }

    pub async fn try_get_server(&self, id: &str) -> Result<Option<Server>> {
        #[derive(Deserialize)]
        struct Wrapper {
            server: Server,
        }
        let wrapper: Option<Wrapper> = self
            .get_json_opt(
                "get server",
                format!("{}/servers/{id}", self.session.compute),
            )
            .await?;
        Ok(wrapper.map(|w| w.server))
    }

    pub async fn stop_server(&self, id: &str) -> Result<()> {
        let resp = self
            .client
            .post(format!("{}/servers/{id}/action", self.session.compute))
            .header("X-Auth-Token", &self.session.token)
            .json(&json!({ "os-stop": null }))
            .send()
            .await
            .map_err(|e| http_error("stop server", e))?;
        // 409 means the server is already stopped
        if resp.status() == reqwest::StatusCode::CONFLICT {
            return Ok(());
        }
        Self::check("stop server", resp).await?;
        Ok(())
    }

    pub async fn delete_server(&self, id: &str) -> Result<()> {
        self.delete(
            "delete server",
            format!("{}/servers/{id}", self.session.compute),
        )
        .await
    }

    /// Snapshot a server into a Glance image, returning the image id.
    pub async fn snapshot_server(
        &self,
        id: &str,
        image_name: &str,
        metadata: &BTreeMap<String, String>,
    ) -> Result<String> {
        let body = json!({
            "createImage": {
                "name": image_name,
                "metadata": metadata,
            }
        });
        let resp = self
            .client
            .post(format!("{}/servers/{id}/action", self.session.compute))
            .header("X-Auth-Token", &self.session.token)
            .json(&body)
            .send()
            .await
            .map_err(|e| http_error("snapshot server", e))?;
        let resp = Self::check("snapshot server", resp).await?;

        // Newer microversions return the id in the body, older ones only
        // in the Location header.
        let location = resp
            .headers()
            .get("Location")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.rsplit('/').next())
            .map(str::to_string);
        #[derive(Deserialize)]
        struct Body {
            #[serde(default)]
            image_id: Option<String>,
        }
        let body: Body = resp.json().await.unwrap_or(Body { image_id: None });

        body.image_id.or(location).ok_or_else(|| {
            CloudError::Capture("createImage returned neither an id nor a Location".into())
        })
    }

    // ---- Neutron --------------------------------------------------------

    pub async fn find_network(&self, name: &str) -> Result<String> {
        #[derive(Deserialize)]
        struct Networks {
            networks: Vec<IdName>,
        }
        let networks: Networks = self
            .get_json(
                "find network",
                format!("{}/v2.0/networks?name={name}", self.session.network),
            )
            .await?;
        networks
            .networks
            .into_iter()
            .next()
            .map(|n| n.id)
            .ok_or_else(|| CloudError::InvalidConfig(format!("no network named '{name}'")))
    }

    pub async fn create_security_group(&self, name: &str, description: &str) -> Result<String> {
        #[derive(Deserialize)]
        struct Wrapper {
            security_group: IdName,
        }
        let body = json!({
            "security_group": { "name": name, "description": description }
        });
        let wrapper: Wrapper = self
            .post_json(
                "create security group",
                format!("{}/v2.0/security-groups", self.session.network),
                body,
            )
            .await?;
        Ok(wrapper.security_group.id)
    }

    pub async fn allow_ssh_ingress(&self, security_group_id: &str) -> Result<()> {
        let body = json!({
            "security_group_rule": {
                "security_group_id": security_group_id,
                "direction": "ingress",
                "protocol": "tcp",
                "port_range_min": 22,
                "port_range_max": 22,
                "remote_ip_prefix": "0.0.0.0/0",
            }
        });
        let _: serde_json::Value = self
            .post_json(
                "allow ssh ingress",
                format!("{}/v2.0/security-group-rules", self.session.network),
                body,
            )
            .await?;
        Ok(())
    }

    pub async fn delete_security_group(&self, id: &str) -> Result<()> {
        self.delete(
            "delete security group",
            format!("{}/v2.0/security-groups/{id}", self.session.network),
        )
        .await
    }

    pub async fn create_floating_ip(&self) -> Result<FloatingIp> {
        #[derive(Deserialize)]
        struct Networks {
            networks: Vec<IdName>,
        }
        #[derive(Deserialize)]
        struct Wrapper {
            floatingip: FloatingIp,
        }

        let external: Networks = self
            .get_json(
                "find external network",
                format!(
                    "{}/v2.0/networks?router:external=true",
                    self.session.network
                ),
            )
            .await?;
        let external_id = external
            .networks
            .into_iter()
            .next()
            .map(|n| n.id)
            .ok_or_else(|| CloudError::InvalidConfig("no external network for floating IPs".into()))?;

        let body = json!({ "floatingip": { "floating_network_id": external_id } });
        let wrapper: Wrapper = self
            .post_json(
                "create floating ip",
                format!("{}/v2.0/floatingips", self.session.network),
                body,
            )
            .await?;
        Ok(wrapper.floatingip)
    }

    /// Bind a floating IP to the server's port.
    pub async fn associate_floating_ip(&self, floating_ip_id: &str, server_id: &str) -> Result<()> {
        #[derive(Deserialize)]
        struct Ports {
            ports: Vec<IdName>,
        }
        let ports: Ports = self
            .get_json(
                "find server port",
                format!("{}/v2.0/ports?device_id={server_id}", self.session.network),
            )
            .await?;
        let port_id = ports
            .ports
            .into_iter()
            .next()
            .map(|p| p.id)
            .ok_or_else(|| CloudError::Api(format!("server {server_id} has no port yet")))?;

        let body = json!({ "floatingip": { "port_id": port_id } });
        let resp = self
            .client
            .put(format!(
                "{}/v2.0/floatingips/{floating_ip_id}",
                self.session.network
            ))
            .header("X-Auth-Token", &self.session.token)
            .json(&body)
            .send()
            .await
            .map_err(|e| http_error("associate floating ip", e))?;
        Self::check("associate floating ip", resp).await?;
        Ok(())
    }

    pub async fn delete_floating_ip(&self, id: &str) -> Result<()> {
        self.delete(
            "delete floating ip",
            format!("{}/v2.0/floatingips/{id}", self.session.network),
        )
        .await
    }

    // ---- Glance ---------------------------------------------------------

    pub async fn list_glance_images(&self) -> Result<Vec<GlanceImage>> {
        #[derive(Deserialize)]
        struct Images {
            images: Vec<GlanceImage>,
        }
        let images: Images = self
            .get_json("list images", format!("{}/v2/images", self.session.image))
            .await?;
        Ok(images.images)
    }

    pub async fn get_glance_image(&self, id: &str) -> Result<GlanceImage> {
        self.get_json_opt("get image", format!("{}/v2/images/{id}", self.session.image))
            .await?
            .ok_or_else(|| CloudError::ImageNotFound(id.to_string()))
    }

    pub async fn delete_glance_image(&self, id: &str) -> Result<()> {
        let resp = self
            .client
            .delete(format!("{}/v2/images/{id}", self.session.image))
            .header("X-Auth-Token", &self.session.token)
            .send()
            .await
            .map_err(|e| http_error("delete image", e))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(CloudError::ImageNotFound(id.to_string()));
        }
        Self::check("delete image", resp).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_address_prefers_floating() {
        let server: Server = serde_json::from_value(json!({
            "id": "s-1",
            "status": "ACTIVE",
            "addresses": {
                "internal": [
                    { "addr": "10.0.0.5", "OS-EXT-IPS:type": "fixed" },
                    { "addr": "185.1.2.3", "OS-EXT-IPS:type": "floating" }
                ]
            }
        }))
        .unwrap();
        assert_eq!(server.address("internal"), Some("185.1.2.3"));
    }

    #[test]
    fn test_server_address_falls_back_to_named_network() {
        let server: Server = serde_json::from_value(json!({
            "id": "s-1",
            "status": "ACTIVE",
            "addresses": {
                "internal": [{ "addr": "10.0.0.5", "OS-EXT-IPS:type": "fixed" }]
            }
        }))
        .unwrap();
        assert_eq!(server.address("internal"), Some("10.0.0.5"));
        assert_eq!(server.address("other"), None);
    }

    #[test]
    fn test_glance_image_extra_properties_are_collected() {
        let image: GlanceImage = serde_json::from_value(json!({
            "id": "img-1",
            "name": "web-01",
            "status": "active",
            "created_at": "2024-03-01T12:30:00Z",
            "billing": "team-a"
        }))
        .unwrap();
        assert_eq!(image.status, "active");
        assert_eq!(
            image.properties.get("billing"),
            Some(&serde_json::Value::from("team-a"))
        );
    }
}
