//! OpenStack control-plane client: identity, block storage and image APIs.
//!
//! Authenticates against Keystone v3 with the `OS_*` environment, keeps the
//! token and service catalog until shortly before expiry, and re-authenticates
//! on demand.

use crate::error::{Result, UpstreamError};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use nanny_core::error::Result as NannyResult;
use nanny_core::model::VolumeId;
use nanny_core::repair::VolumeLocker;
use nanny_core::snapshot::{CatalogSnapshot, CatalogSource};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Volume metadata key marking a volume as being repaired.
pub const LOCK_KEY: &str = "nanny-lock";

const ENV_VARS: &[&str] = &[
    "OS_AUTH_URL",
    "OS_USERNAME",
    "OS_PASSWORD",
    "OS_USER_DOMAIN_NAME",
    "OS_PROJECT_NAME",
    "OS_PROJECT_DOMAIN_NAME",
    "OS_REGION",
];

#[derive(Debug, Clone)]
pub struct Credentials {
    pub auth_url: String,
    pub username: String,
    pub password: String,
    pub user_domain: String,
    pub project_name: String,
    pub project_domain: String,
    pub region: String,
}

impl Credentials {
    /// Read every `OS_*` variable; the first missing one is an error.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut values = Vec::with_capacity(ENV_VARS.len());
        for var in ENV_VARS {
            match lookup(var).filter(|v| !v.is_empty()) {
                Some(v) => values.push(v),
                None => return Err(UpstreamError::MissingEnv(var.to_string())),
            }
        }
        let mut it = values.into_iter();
        let mut next = || it.next().unwrap_or_default();
        Ok(Self {
            auth_url: next().trim_end_matches('/').to_string(),
            username: next(),
            password: next(),
            user_domain: next(),
            project_name: next(),
            project_domain: next(),
            region: next(),
        })
    }

    fn auth_body(&self) -> serde_json::Value {
        json!({
            "auth": {
                "identity": {
                    "methods": ["password"],
                    "password": {
                        "user": {
                            "name": self.username,
                            "password": self.password,
                            "domain": { "name": self.user_domain }
                        }
                    }
                },
                "scope": {
                    "project": {
                        "name": self.project_name,
                        "domain": { "name": self.project_domain }
                    }
                }
            }
        })
    }
}

#[derive(Debug, Deserialize)]
struct TokenBody {
    token: TokenInfo,
}

#[derive(Debug, Deserialize)]
struct TokenInfo {
    expires_at: DateTime<Utc>,
    #[serde(default)]
    catalog: Vec<CatalogEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CatalogEntry {
    #[serde(rename = "type")]
    pub service_type: String,
    #[serde(default)]
    pub endpoints: Vec<Endpoint>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Endpoint {
    pub interface: String,
    #[serde(default)]
    pub region: Option<String>,
    pub url: String,
}

/// Public endpoint of `service_type` in `region`.
pub fn find_endpoint(catalog: &[CatalogEntry], service_type: &str, region: &str) -> Option<String> {
    catalog
        .iter()
        .filter(|e| e.service_type == service_type)
        .flat_map(|e| e.endpoints.iter())
        .find(|ep| ep.interface == "public" && ep.region.as_deref().map_or(true, |r| r == region))
        .map(|ep| ep.url.trim_end_matches('/').to_string())
}

#[derive(Debug, Clone)]
struct Session {
    token: String,
    expires_at: DateTime<Utc>,
    catalog: Vec<CatalogEntry>,
}

pub struct OpenStackClient {
    http: reqwest::Client,
    creds: Credentials,
    session: Mutex<Option<Session>>,
}

impl OpenStackClient {
    pub fn new(creds: Credentials) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .unwrap_or_default();
        Self {
            http,
            creds,
            session: Mutex::new(None),
        }
    }

    async fn authenticate(&self) -> Result<Session> {
        let url = format!("{}/auth/tokens", self.creds.auth_url);
        let resp = self
            .http
            .post(&url)
            .json(&self.creds.auth_body())
            .send()
            .await
            .map_err(|e| UpstreamError::http(&url, e))?;
        if !resp.status().is_success() {
            return Err(UpstreamError::Auth(format!(
                "{} answered {}",
                url,
                resp.status()
            )));
        }
        let token = resp
            .headers()
            .get("X-Subject-Token")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| UpstreamError::Auth("no X-Subject-Token header".to_string()))?;
        let body: TokenBody = resp
            .json()
            .await
            .map_err(|e| UpstreamError::decode("token", e))?;
        tracing::debug!("authenticated as {}, token valid until {}", self.creds.username, body.token.expires_at);
        Ok(Session {
            token,
            expires_at: body.token.expires_at,
            catalog: body.token.catalog,
        })
    }

    /// Token and endpoint for `service_type`, authenticating when the cached
    /// token is missing or about to expire.
    async fn session_for(&self, service_type: &str) -> Result<(String, String)> {
        let mut guard = self.session.lock().await;
        let fresh = guard
            .as_ref()
            .map(|s| s.expires_at - Utc::now() > ChronoDuration::minutes(5))
            .unwrap_or(false);
        if !fresh {
            *guard = Some(self.authenticate().await?);
        }
        let session = guard
            .as_ref()
            .ok_or_else(|| UpstreamError::Auth("no session".to_string()))?;
        let endpoint = find_endpoint(&session.catalog, service_type, &self.creds.region)
            .ok_or_else(|| UpstreamError::NoEndpoint(service_type.to_string()))?;
        Ok((session.token.clone(), endpoint))
    }

    async fn send(&self, req: reqwest::RequestBuilder, url: &str) -> Result<reqwest::Response> {
        let resp = req.send().await.map_err(|e| UpstreamError::http(url, e))?;
        if !resp.status().is_success() {
            return Err(UpstreamError::Status {
                url: url.to_string(),
                status: resp.status().as_u16(),
            });
        }
        Ok(resp)
    }

    /// Every image id known to the image service.
    pub async fn image_ids(&self) -> Result<HashSet<Uuid>> {
        #[derive(Deserialize)]
        struct Image {
            id: Uuid,
        }
        #[derive(Deserialize)]
        struct Page {
            images: Vec<Image>,
            next: Option<String>,
        }

        let (token, endpoint) = self.session_for("image").await?;
        let mut ids = HashSet::new();
        let mut next = Some("/v2/images?limit=1000".to_string());
        while let Some(path) = next.take() {
            let url = format!("{}{}", endpoint, path);
            let resp = self
                .send(self.http.get(&url).header("X-Auth-Token", &token), &url)
                .await?;
            let page: Page = resp
                .json()
                .await
                .map_err(|e| UpstreamError::decode("image list", e))?;
            ids.extend(page.images.into_iter().map(|i| i.id));
            next = page.next;
        }
        Ok(ids)
    }

    pub async fn set_volume_metadata(&self, volume: &VolumeId, key: &str, value: &str) -> Result<()> {
        let (token, endpoint) = self.session_for("volumev3").await?;
        let url = format!("{}/volumes/{}/metadata", endpoint, volume);
        let mut metadata = serde_json::Map::new();
        metadata.insert(key.to_string(), json!(value));
        self.send(
            self.http
                .post(&url)
                .header("X-Auth-Token", &token)
                .json(&json!({ "metadata": metadata })),
            &url,
        )
        .await?;
        Ok(())
    }

    /// Remove a metadata key; an absent key is not an error.
    pub async fn delete_volume_metadata(&self, volume: &VolumeId, key: &str) -> Result<()> {
        let (token, endpoint) = self.session_for("volumev3").await?;
        let url = format!("{}/volumes/{}/metadata/{}", endpoint, volume, key);
        match self
            .send(self.http.delete(&url).header("X-Auth-Token", &token), &url)
            .await
        {
            Ok(_) | Err(UpstreamError::Status { status: 404, .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl CatalogSource for OpenStackClient {
    async fn catalog_snapshot(&self) -> NannyResult<CatalogSnapshot> {
        let image_ids = self.image_ids().await.map_err(|e| e.observing("catalog"))?;
        Ok(CatalogSnapshot { image_ids })
    }
}

#[async_trait]
impl VolumeLocker for OpenStackClient {
    async fn lock_volume(&self, volume: &VolumeId) -> NannyResult<()> {
        let stamp = Utc::now().to_rfc3339();
        self.set_volume_metadata(volume, LOCK_KEY, &stamp)
            .await
            .map_err(UpstreamError::repairing)
    }

    async fn unlock_volume(&self, volume: &VolumeId) -> NannyResult<()> {
        self.delete_volume_metadata(volume, LOCK_KEY)
            .await
            .map_err(UpstreamError::repairing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env() -> HashMap<&'static str, String> {
        ENV_VARS
            .iter()
            .map(|k| (*k, format!("{}-value", k.to_lowercase())))
            .collect()
    }

    #[test]
    fn test_credentials_from_lookup() {
        let mut vars = env();
        vars.insert("OS_AUTH_URL", "https://identity.example/v3/".to_string());
        let creds = Credentials::from_lookup(|k| vars.get(k).cloned()).unwrap();
        assert_eq!(creds.auth_url, "https://identity.example/v3");
        assert_eq!(creds.region, "os_region-value");
        let body = creds.auth_body();
        assert_eq!(
            body["auth"]["scope"]["project"]["name"],
            "os_project_name-value"
        );
    }

    #[test]
    fn test_missing_variable_is_reported() {
        let mut vars = env();
        vars.remove("OS_PASSWORD");
        let err = Credentials::from_lookup(|k| vars.get(k).cloned()).unwrap_err();
        assert!(matches!(err, UpstreamError::MissingEnv(v) if v == "OS_PASSWORD"));
    }

    #[test]
    fn test_find_endpoint_prefers_public_in_region() {
        let catalog: Vec<CatalogEntry> = serde_json::from_value(json!([
            {"type": "volumev3", "endpoints": [
                {"interface": "internal", "region": "qa-de-1", "url": "http://internal/v3"},
                {"interface": "public", "region": "eu-nl-1", "url": "https://nl/v3"},
                {"interface": "public", "region": "qa-de-1", "url": "https://de/v3/"}
            ]},
            {"type": "image", "endpoints": [
                {"interface": "public", "url": "https://image"}
            ]}
        ]))
        .unwrap();
        assert_eq!(
            find_endpoint(&catalog, "volumev3", "qa-de-1").as_deref(),
            Some("https://de/v3")
        );
        assert_eq!(
            find_endpoint(&catalog, "image", "qa-de-1").as_deref(),
            Some("https://image")
        );
        assert_eq!(find_endpoint(&catalog, "network", "qa-de-1"), None);
    }
}
