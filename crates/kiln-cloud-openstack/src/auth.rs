//! Keystone v3 password authentication
//!
//! Credentials come from the standard `OS_*` environment variables, the
//! same ones every OpenStack client reads. Authentication yields a token
//! plus the public endpoints of the three services the provider talks to:
//! Nova (compute), Neutron (network) and Glance (image).

use kiln_cloud::{CloudError, Result};
use serde::Deserialize;
use serde_json::json;

#[derive(Debug, Clone)]
pub struct OsCredentials {
    pub auth_url: String,
    pub username: String,
    pub password: String,
    pub project: String,
    pub user_domain: String,
    pub project_domain: String,
}

impl OsCredentials {
    pub fn from_env() -> Result<Self> {
        fn required(name: &'static str) -> Result<String> {
            std::env::var(name)
                .map_err(|_| CloudError::Auth(format!("{name} is not set")))
        }

        Ok(Self {
            auth_url: required("OS_AUTH_URL")?,
            username: required("OS_USERNAME")?,
            password: required("OS_PASSWORD")?,
            project: required("OS_PROJECT_NAME")?,
            user_domain: std::env::var("OS_USER_DOMAIN_NAME")
                .unwrap_or_else(|_| "Default".to_string()),
            project_domain: std::env::var("OS_PROJECT_DOMAIN_NAME")
                .unwrap_or_else(|_| "Default".to_string()),
        })
    }
}

/// An authenticated token with the service endpoints it unlocks.
#[derive(Debug, Clone)]
pub(crate) struct Session {
    pub token: String,
    pub compute: String,
    pub network: String,
    pub image: String,
}

#[derive(Deserialize)]
struct TokenResponse {
    token: TokenBody,
}

#[derive(Deserialize)]
struct TokenBody {
    #[serde(default)]
    catalog: Vec<CatalogEntry>,
}

#[derive(Deserialize)]
struct CatalogEntry {
    #[serde(rename = "type")]
    service_type: String,
    endpoints: Vec<CatalogEndpoint>,
}

#[derive(Deserialize)]
struct CatalogEndpoint {
    interface: String,
    url: String,
}

fn public_endpoint(catalog: &[CatalogEntry], service_type: &str) -> Result<String> {
    catalog
        .iter()
        .find(|e| e.service_type == service_type)
        .and_then(|e| e.endpoints.iter().find(|ep| ep.interface == "public"))
        .map(|ep| ep.url.trim_end_matches('/').to_string())
        .ok_or_else(|| {
            CloudError::Auth(format!("no public '{service_type}' endpoint in the catalog"))
        })
}

pub(crate) async fn authenticate(
    client: &reqwest::Client,
    creds: &OsCredentials,
) -> Result<Session> {
    let url = format!("{}/auth/tokens", creds.auth_url.trim_end_matches('/'));
    let body = json!({
        "auth": {
            "identity": {
                "methods": ["password"],
                "password": {
                    "user": {
                        "name": creds.username,
                        "domain": { "name": creds.user_domain },
                        "password": creds.password,
                    }
                }
            },
            "scope": {
                "project": {
                    "name": creds.project,
                    "domain": { "name": creds.project_domain },
                }
            }
        }
    });

    tracing::debug!("Authenticating against {url}");
    let resp = client
        .post(&url)
        .json(&body)
        .send()
        .await
        .map_err(|e| CloudError::Auth(format!("keystone unreachable: {e}")))?;

    if !resp.status().is_success() {
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        return Err(CloudError::Auth(format!(
            "keystone rejected the credentials: {status}: {text}"
        )));
    }

    let token = resp
        .headers()
        .get("X-Subject-Token")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .ok_or_else(|| CloudError::Auth("keystone returned no X-Subject-Token".into()))?;

    let parsed: TokenResponse = resp
        .json()
        .await
        .map_err(|e| CloudError::Auth(format!("malformed token response: {e}")))?;

    Ok(Session {
        token,
        compute: public_endpoint(&parsed.token.catalog, "compute")?,
        network: public_endpoint(&parsed.token.catalog, "network")?,
        image: public_endpoint(&parsed.token.catalog, "image")?,
    })
}
