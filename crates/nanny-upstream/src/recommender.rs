//! Client for an external placement recommender.

use crate::error::{Result, UpstreamError};
use async_trait::async_trait;
use nanny_core::balance::memory::{HostLoad, Migration, Recommender};
use nanny_core::error::Result as NannyResult;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Serialize)]
struct RecommendRequest<'a> {
    cluster: &'a str,
    hosts: &'a [HostLoad],
}

#[derive(Debug, Deserialize)]
struct RecommendResponse {
    #[serde(default)]
    migrations: Vec<Migration>,
}

/// POSTs the cluster's host loads and returns the proposed migrations.
/// Proposals are validated by the caller before use.
pub struct HttpRecommender {
    http: reqwest::Client,
    url: String,
}

impl HttpRecommender {
    pub fn new(url: &str) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .unwrap_or_default();
        Self {
            http,
            url: url.to_string(),
        }
    }

    async fn call(&self, cluster: &str, hosts: &[HostLoad]) -> Result<Vec<Migration>> {
        let resp = self
            .http
            .post(&self.url)
            .json(&RecommendRequest { cluster, hosts })
            .send()
            .await
            .map_err(|e| UpstreamError::http(&self.url, e))?;
        if !resp.status().is_success() {
            return Err(UpstreamError::Status {
                url: self.url.clone(),
                status: resp.status().as_u16(),
            });
        }
        let body: RecommendResponse = resp
            .json()
            .await
            .map_err(|e| UpstreamError::decode("recommendation", e))?;
        Ok(body.migrations)
    }
}

#[async_trait]
impl Recommender for HttpRecommender {
    async fn recommend(&self, cluster: &str, hosts: &[HostLoad]) -> NannyResult<Vec<Migration>> {
        tracing::debug!("asking recommender for cluster {} ({} hosts)", cluster, hosts.len());
        self.call(cluster, hosts)
            .await
            .map_err(|e| e.observing("recommender"))
    }
}
