//! Storage-array REST client: aggregates, flexible volumes and LUNs.

use crate::error::{Result, UpstreamError};
use async_trait::async_trait;
use nanny_core::error::Result as NannyResult;
use nanny_core::model::{Aggregate, FlexVol, Lun};
use nanny_core::snapshot::{ArraySnapshot, ArraySource};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Deserialize)]
struct Records<T> {
    #[serde(default = "Vec::new")]
    records: Vec<T>,
    #[serde(rename = "_links", default)]
    links: Option<Links>,
}

#[derive(Debug, Deserialize)]
struct Links {
    next: Option<Href>,
}

#[derive(Debug, Deserialize)]
struct Href {
    href: String,
}

#[derive(Debug, Default, Deserialize)]
struct Space {
    #[serde(default)]
    size: u64,
    #[serde(default)]
    used: u64,
    #[serde(default)]
    snapshot: Option<SnapshotSpace>,
    #[serde(default)]
    block_storage: Option<BlockStorage>,
}

#[derive(Debug, Default, Deserialize)]
struct BlockStorage {
    #[serde(default)]
    size: u64,
    #[serde(default)]
    used: u64,
}

#[derive(Debug, Default, Deserialize)]
struct SnapshotSpace {
    #[serde(default)]
    reserve_percent: f64,
}

#[derive(Debug, Deserialize)]
struct AggrRecord {
    name: String,
    #[serde(default)]
    space: Space,
}

#[derive(Debug, Deserialize)]
struct NamedRef {
    name: String,
}

#[derive(Debug, Deserialize)]
struct VolumeRecord {
    name: String,
    #[serde(default)]
    aggregates: Vec<NamedRef>,
    #[serde(default)]
    space: Space,
}

#[derive(Debug, Deserialize)]
struct LunLocation {
    volume: NamedRef,
}

#[derive(Debug, Deserialize)]
struct LunRecord {
    name: String,
    location: LunLocation,
    #[serde(default)]
    space: Space,
}

fn percent(used: u64, size: u64) -> f64 {
    if size == 0 {
        0.0
    } else {
        used as f64 / size as f64 * 100.0
    }
}

fn aggregate(r: AggrRecord) -> Aggregate {
    let (size, used) = match &r.space.block_storage {
        Some(b) => (b.size, b.used),
        None => (r.space.size, r.space.used),
    };
    Aggregate {
        name: r.name,
        capacity_bytes: size,
        used_bytes: used,
        usage_percent: percent(used, size),
    }
}

fn flexvol(r: VolumeRecord) -> Option<FlexVol> {
    let aggregate = r.aggregates.into_iter().next()?.name;
    Some(FlexVol {
        usage_percent: percent(r.space.used, r.space.size),
        capacity_bytes: r.space.size,
        used_bytes: r.space.used,
        snapshot_reserve_percent: r
            .space
            .snapshot
            .map(|s| s.reserve_percent)
            .unwrap_or(0.0),
        name: r.name,
        aggregate,
    })
}

fn lun(r: LunRecord) -> Lun {
    Lun {
        path: r.name,
        flexvol: r.location.volume.name,
        capacity_bytes: r.space.size,
        used_bytes: r.space.used,
    }
}

/// One array management endpoint.
pub struct ArrayClient {
    http: reqwest::Client,
    base: String,
    user: String,
    password: String,
}

impl ArrayClient {
    pub fn new(base: &str, user: &str, password: &str) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .unwrap_or_default();
        Self {
            http,
            base: base.trim_end_matches('/').to_string(),
            user: user.to_string(),
            password: password.to_string(),
        }
    }

    /// All records of a collection, following `_links.next`.
    async fn collect<T: DeserializeOwned>(&self, path: &str) -> Result<Vec<T>> {
        let mut out = Vec::new();
        let mut next = Some(path.to_string());
        while let Some(path) = next.take() {
            let url = format!("{}{}", self.base, path);
            let resp = self
                .http
                .get(&url)
                .basic_auth(&self.user, Some(&self.password))
                .send()
                .await
                .map_err(|e| UpstreamError::http(&url, e))?;
            if !resp.status().is_success() {
                return Err(UpstreamError::Status {
                    url,
                    status: resp.status().as_u16(),
                });
            }
            let page: Records<T> = resp
                .json()
                .await
                .map_err(|e| UpstreamError::decode(path.as_str(), e))?;
            out.extend(page.records);
            next = page.links.and_then(|l| l.next).map(|h| h.href);
        }
        Ok(out)
    }

    pub async fn read(&self) -> Result<ArraySnapshot> {
        let aggrs: Vec<AggrRecord> = self
            .collect("/api/storage/aggregates?fields=name,space")
            .await?;
        let vols: Vec<VolumeRecord> = self
            .collect("/api/storage/volumes?fields=name,aggregates,space")
            .await?;
        let luns: Vec<LunRecord> = self
            .collect("/api/storage/luns?fields=name,location,space")
            .await?;
        Ok(ArraySnapshot {
            aggregates: aggrs
                .into_iter()
                .map(aggregate)
                .map(|a| (a.name.clone(), a))
                .collect(),
            flexvols: vols
                .into_iter()
                .filter_map(flexvol)
                .map(|f| (f.name.clone(), f))
                .collect(),
            luns: luns.into_iter().map(lun).collect(),
        })
    }
}

/// Every configured array, merged into one view. One unreachable array
/// makes the whole view unavailable.
pub struct ArrayFleet {
    arrays: Vec<ArrayClient>,
}

impl ArrayFleet {
    pub fn new(arrays: Vec<ArrayClient>) -> Self {
        Self { arrays }
    }
}

#[async_trait]
impl ArraySource for ArrayFleet {
    async fn array_snapshot(&self) -> NannyResult<ArraySnapshot> {
        let mut merged = ArraySnapshot::default();
        for array in &self.arrays {
            let one = array.read().await.map_err(|e| e.observing("array"))?;
            merged.aggregates.extend(one.aggregates);
            merged.flexvols.extend(one.flexvols);
            merged.luns.extend(one.luns);
        }
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nanny_core::model::GIB;

    #[test]
    fn test_aggregate_prefers_block_storage_space() {
        let r: AggrRecord = serde_json::from_str(&format!(
            r#"{{"name": "aggr_bb01_1", "space": {{"block_storage": {{"size": {}, "used": {}}}}}}}"#,
            100 * GIB,
            40 * GIB
        ))
        .unwrap();
        let a = aggregate(r);
        assert_eq!(a.capacity_bytes, 100 * GIB);
        assert!((a.usage_percent - 40.0).abs() < 1e-9);
    }

    #[test]
    fn test_flexvol_without_aggregate_is_skipped() {
        let r: VolumeRecord = serde_json::from_str(r#"{"name": "vol1", "aggregates": []}"#).unwrap();
        assert!(flexvol(r).is_none());
        let r: VolumeRecord = serde_json::from_str(
            r#"{"name": "vv_bb01", "aggregates": [{"name": "aggr1"}],
                "space": {"size": 1000, "used": 250, "snapshot": {"reserve_percent": 5}}}"#,
        )
        .unwrap();
        let f = flexvol(r).unwrap();
        assert_eq!(f.aggregate, "aggr1");
        assert_eq!(f.snapshot_reserve_percent, 5.0);
        assert!((f.usage_percent - 25.0).abs() < 1e-9);
    }

    #[test]
    fn test_lun_records_keep_path() {
        let page: Records<LunRecord> = serde_json::from_str(
            r#"{"records": [{"name": "/vol/vv_bb01/naa.600a0980383044", "location": {"volume": {"name": "vv_bb01"}}}],
                "_links": {"next": {"href": "/api/storage/luns?start=2"}}}"#,
        )
        .unwrap();
        assert_eq!(page.links.and_then(|l| l.next).unwrap().href, "/api/storage/luns?start=2");
        let l = lun(page.records.into_iter().next().unwrap());
        assert_eq!(l.path, "/vol/vv_bb01/naa.600a0980383044");
        assert_eq!(l.flexvol, "vv_bb01");
    }
}
