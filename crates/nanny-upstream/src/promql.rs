//! Memory telemetry from a Prometheus-compatible query API.

use crate::error::{Result, UpstreamError};
use async_trait::async_trait;
use nanny_core::balance::memory::MemoryTelemetry;
use nanny_core::error::Result as NannyResult;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::Duration;

/// Queries and label names used to derive the two memory signals.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryQueries {
    /// Instant vector with one non-zero sample per contended host.
    pub contended_hosts: String,
    pub host_label: String,
    /// Instant vector with one non-zero sample per VM ready to move.
    pub ready_vms: String,
    pub vm_label: String,
}

impl Default for TelemetryQueries {
    fn default() -> Self {
        Self {
            contended_hosts:
                "max by (hostsystem) (vrops_hostsystem_memory_contention_percentage) > 0"
                    .to_string(),
            host_label: "hostsystem".to_string(),
            ready_vms: "max by (virtualmachine) (vrops_virtualmachine_memory_ready) > 0"
                .to_string(),
            vm_label: "virtualmachine".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    status: String,
    #[serde(default)]
    error: Option<String>,
    data: Option<QueryData>,
}

#[derive(Debug, Deserialize)]
struct QueryData {
    #[serde(rename = "resultType")]
    result_type: String,
    result: Vec<Sample>,
}

#[derive(Debug, Deserialize)]
struct Sample {
    metric: HashMap<String, String>,
    /// `[timestamp, "value"]`
    value: (f64, String),
}

/// Label values of the non-zero samples in an instant-vector response.
fn labels_of(body: &str, label: &str) -> Result<HashSet<String>> {
    let resp: QueryResponse =
        serde_json::from_str(body).map_err(|e| UpstreamError::decode("prometheus response", e))?;
    if resp.status != "success" {
        return Err(UpstreamError::decode(
            "prometheus response",
            resp.error.unwrap_or_else(|| resp.status.clone()),
        ));
    }
    let data = resp
        .data
        .ok_or_else(|| UpstreamError::decode("prometheus response", "no data"))?;
    if data.result_type != "vector" {
        return Err(UpstreamError::decode(
            "prometheus response",
            format!("expected vector, got {}", data.result_type),
        ));
    }
    Ok(data
        .result
        .into_iter()
        .filter(|s| s.value.1.parse::<f64>().map(|v| v > 0.0).unwrap_or(false))
        .filter_map(|mut s| s.metric.remove(label))
        .collect())
}

pub struct PromTelemetry {
    http: reqwest::Client,
    base: String,
    queries: TelemetryQueries,
}

impl PromTelemetry {
    pub fn new(base: &str, queries: TelemetryQueries) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self {
            http,
            base: base.trim_end_matches('/').to_string(),
            queries,
        }
    }

    async fn query(&self, promql: &str, label: &str) -> Result<HashSet<String>> {
        let url = format!("{}/api/v1/query", self.base);
        let resp = self
            .http
            .get(&url)
            .query(&[("query", promql)])
            .send()
            .await
            .map_err(|e| UpstreamError::http(&url, e))?;
        if !resp.status().is_success() {
            return Err(UpstreamError::Status {
                url,
                status: resp.status().as_u16(),
            });
        }
        let body = resp.text().await.map_err(|e| UpstreamError::http(&url, e))?;
        labels_of(&body, label)
    }
}

#[async_trait]
impl MemoryTelemetry for PromTelemetry {
    async fn contended_hosts(&self) -> NannyResult<HashSet<String>> {
        self.query(&self.queries.contended_hosts, &self.queries.host_label)
            .await
            .map_err(|e| e.observing("prometheus"))
    }

    async fn ready_vms(&self) -> NannyResult<HashSet<String>> {
        self.query(&self.queries.ready_vms, &self.queries.vm_label)
            .await
            .map_err(|e| e.observing("prometheus"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_labels_of_keeps_nonzero_samples() {
        let body = r#"{"status":"success","data":{"resultType":"vector","result":[
            {"metric":{"hostsystem":"node001-bb091"},"value":[1700000000.1,"12.5"]},
            {"metric":{"hostsystem":"node002-bb091"},"value":[1700000000.1,"0"]},
            {"metric":{"other":"x"},"value":[1700000000.1,"3"]}
        ]}}"#;
        let hosts = labels_of(body, "hostsystem").unwrap();
        assert_eq!(hosts.len(), 1);
        assert!(hosts.contains("node001-bb091"));
    }

    #[test]
    fn test_labels_of_rejects_errors_and_matrices() {
        let err = labels_of(r#"{"status":"error","error":"bad query"}"#, "x").unwrap_err();
        assert!(err.to_string().contains("bad query"));
        let matrix = r#"{"status":"success","data":{"resultType":"matrix","result":[]}}"#;
        assert!(labels_of(matrix, "x").is_err());
    }

    #[tokio::test]
    async fn test_unreachable_prometheus_is_unavailable() {
        let t = PromTelemetry::new("http://127.0.0.1:1", TelemetryQueries::default());
        let err = t.contended_hosts().await.unwrap_err();
        assert!(err.is_transient());
    }
}
