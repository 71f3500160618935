//! Virtualization-manager client.
//!
//! Talks to a JSON gateway in front of the manager's property collector and
//! task API. Inventory reads return the engine's model types directly; every
//! mutation is one POST that returns once the manager task has finished.

use crate::error::{Result, UpstreamError};
use crate::retry::{retry, RetryConfig, RetryOutcome};
use async_trait::async_trait;
use futures::future::join_all;
use nanny_core::error::Result as NannyResult;
use nanny_core::model::{
    Cluster, Datastore, DrsBehavior, FolderListing, Host, Moid, SharesLevel, VmObject,
    VM_PROPERTY_PATHS,
};
use nanny_core::repair::VmgrRepair;
use nanny_core::snapshot::{VmgrSnapshot, VmgrSource};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::time::Duration;

pub struct VmgrGateway {
    http: reqwest::Client,
    base: String,
    browse_retry: RetryConfig,
}

impl VmgrGateway {
    pub fn new(base: &str, datastore_retries: u32) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .unwrap_or_default();
        Self {
            http,
            base: base.trim_end_matches('/').to_string(),
            browse_retry: RetryConfig::with_retries(datastore_retries),
        }
    }

    pub fn with_browse_retry(mut self, config: RetryConfig) -> Self {
        self.browse_retry = config;
        self
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}{}", self.base, path);
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| UpstreamError::http(&url, e))?;
        if !resp.status().is_success() {
            return Err(UpstreamError::Status {
                url,
                status: resp.status().as_u16(),
            });
        }
        resp.json().await.map_err(|e| UpstreamError::decode(path, e))
    }

    async fn post(&self, path: &str, body: Value) -> Result<()> {
        let url = format!("{}{}", self.base, path);
        let resp = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| UpstreamError::http(&url, e))?;
        if !resp.status().is_success() {
            return Err(UpstreamError::Status {
                url,
                status: resp.status().as_u16(),
            });
        }
        Ok(())
    }

    async fn vm_task(&self, vm: &Moid, task: &str, body: Value) -> NannyResult<()> {
        tracing::debug!("vmgr task {} on {}", task, vm);
        self.post(&format!("/vms/{}/{}", vm, task), body)
            .await
            .map_err(UpstreamError::repairing)
    }

    /// Recursive listing of one datastore, retried with backoff.
    async fn browse(&self, datastore: &str) -> Option<Vec<FolderListing>> {
        let path = format!("/datastores/{}/browse", datastore);
        match retry(&self.browse_retry, || self.get::<Vec<FolderListing>>(&path)).await {
            RetryOutcome::Success(listing) => Some(listing),
            RetryOutcome::Exhausted {
                last_error,
                attempts,
            } => {
                tracing::warn!(
                    "datastore {} not browsable after {} attempts: {}",
                    datastore,
                    attempts,
                    last_error
                );
                None
            }
        }
    }

    pub async fn read(&self) -> Result<VmgrSnapshot> {
        let vms: Vec<VmObject> = self
            .get(&format!("/vms?properties={}", VM_PROPERTY_PATHS.join(",")))
            .await?;
        let datastores: Vec<Datastore> = self.get("/datastores").await?;
        let hosts: Vec<Host> = self.get("/hosts").await?;
        let clusters: Vec<Cluster> = self.get("/clusters").await?;

        let mut snapshot = VmgrSnapshot {
            vms: vms.into_iter().map(|v| (v.moid.clone(), v)).collect(),
            hosts: hosts.into_iter().map(|h| (h.moid.clone(), h)).collect(),
            clusters: clusters.into_iter().map(|c| (c.moid.clone(), c)).collect(),
            ..Default::default()
        };

        let names: Vec<String> = datastores.iter().map(|d| d.name.clone()).collect();
        let listings = join_all(names.iter().map(|name| self.browse(name))).await;
        for (name, listing) in names.into_iter().zip(listings) {
            match listing {
                Some(folders) => {
                    snapshot.listings.insert(name, folders);
                }
                None => {
                    snapshot.no_access.insert(name);
                }
            }
        }
        snapshot.datastores = datastores.into_iter().map(|d| (d.moid.clone(), d)).collect();
        Ok(snapshot)
    }
}

#[async_trait]
impl VmgrSource for VmgrGateway {
    async fn vmgr_snapshot(&self) -> NannyResult<VmgrSnapshot> {
        self.read().await.map_err(|e| e.observing("vmgr"))
    }
}

#[async_trait]
impl VmgrRepair for VmgrGateway {
    async fn detach_disk(&self, vm: &Moid, disk_key: i32) -> NannyResult<()> {
        self.vm_task(vm, "detach-disk", json!({ "key": disk_key })).await
    }

    async fn detach_nic(&self, vm: &Moid, nic_key: i32) -> NannyResult<()> {
        self.vm_task(vm, "detach-nic", json!({ "key": nic_key })).await
    }

    async fn move_datastore_path(&self, datastore: &str, from: &str, to: &str) -> NannyResult<()> {
        self.post(
            &format!("/datastores/{}/move", datastore),
            json!({ "from": from, "to": to }),
        )
        .await
        .map_err(UpstreamError::repairing)
    }

    async fn delete_datastore_path(&self, datastore: &str, path: &str) -> NannyResult<()> {
        match self
            .post(
                &format!("/datastores/{}/delete", datastore),
                json!({ "path": path }),
            )
            .await
        {
            Ok(()) | Err(UpstreamError::Status { status: 404, .. }) => Ok(()),
            Err(e) => Err(e.repairing()),
        }
    }

    async fn suspend(&self, vm: &Moid) -> NannyResult<()> {
        self.vm_task(vm, "suspend", json!({})).await
    }

    async fn power_off(&self, vm: &Moid) -> NannyResult<()> {
        self.vm_task(vm, "power-off", json!({})).await
    }

    async fn unregister(&self, vm: &Moid) -> NannyResult<()> {
        self.vm_task(vm, "unregister", json!({})).await
    }

    async fn relocate_storage(&self, vm: &Moid, datastore: &Moid) -> NannyResult<()> {
        self.vm_task(vm, "relocate", json!({ "datastore": datastore })).await
    }

    async fn relocate_host(&self, vm: &Moid, host: &Moid) -> NannyResult<()> {
        self.vm_task(vm, "relocate", json!({ "host": host })).await
    }

    async fn set_memory_shares(&self, vm: &Moid, level: SharesLevel) -> NannyResult<()> {
        self.vm_task(vm, "memory-shares", json!({ "level": level })).await
    }

    async fn set_drs_override(
        &self,
        cluster: &Moid,
        vm: &Moid,
        behavior: DrsBehavior,
        edit: bool,
    ) -> NannyResult<()> {
        self.post(
            &format!("/clusters/{}/drs-overrides", cluster),
            json!({ "vm": vm, "behavior": behavior, "operation": if edit { "edit" } else { "add" } }),
        )
        .await
        .map_err(UpstreamError::repairing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::{Path, State};
    use axum::http::StatusCode;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Gateway {
        flaky_calls: AtomicU32,
        tasks: Mutex<Vec<String>>,
    }

    async fn browse(
        State(gw): State<Arc<Gateway>>,
        Path(name): Path<String>,
    ) -> (StatusCode, Json<Value>) {
        match name.as_str() {
            "vvol_bb01" if gw.flaky_calls.fetch_add(1, Ordering::SeqCst) < 2 => {
                (StatusCode::SERVICE_UNAVAILABLE, Json(json!([])))
            }
            "vvol_bb01" => (
                StatusCode::OK,
                Json(json!([{ "folder": "rfc4122.0f1e2d3c", "files": ["a.vmdk"] }])),
            ),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, Json(json!([]))),
        }
    }

    fn datastore(moid: &str, name: &str) -> Value {
        json!({
            "moid": moid, "name": name, "kind": "vvol",
            "capacity_bytes": 100, "free_bytes": 50,
            "overall_status": "Absent", "resident_vms": []
        })
    }

    async fn serve(gw: Arc<Gateway>) -> String {
        let app = Router::new()
            .route("/vms", get(|| async { Json(json!([])) }))
            .route(
                "/datastores",
                get(|| async {
                    Json(json!([datastore("ds-1", "vvol_bb01"), datastore("ds-2", "vvol_bb02")]))
                }),
            )
            .route("/hosts", get(|| async { Json(json!([])) }))
            .route("/clusters", get(|| async { Json(json!([])) }))
            .route("/datastores/:name/browse", get(browse))
            .route(
                "/vms/:moid/:task",
                post(
                    |State(gw): State<Arc<Gateway>>,
                     Path((moid, task)): Path<(String, String)>,
                     Json(body): Json<Value>| async move {
                        gw.tasks
                            .lock()
                            .unwrap()
                            .push(format!("{} {} {}", moid, task, body));
                        StatusCode::OK
                    },
                ),
            )
            .with_state(gw);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn quick() -> RetryConfig {
        RetryConfig {
            max_retries: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }

    #[tokio::test]
    async fn test_browse_retries_then_marks_no_access() {
        let gw = Arc::new(Gateway::default());
        let base = serve(gw.clone()).await;
        let client = VmgrGateway::new(&base, 3).with_browse_retry(quick());

        let snapshot = client.vmgr_snapshot().await.unwrap();
        assert_eq!(snapshot.datastores.len(), 2);
        assert_eq!(snapshot.listings["vvol_bb01"].len(), 1);
        assert!(snapshot.no_access.contains("vvol_bb02"));
        assert_eq!(gw.flaky_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_tasks_post_to_vm() {
        let gw = Arc::new(Gateway::default());
        let base = serve(gw.clone()).await;
        let client = VmgrGateway::new(&base, 0);

        client.detach_disk(&"vm-7".to_string(), 2001).await.unwrap();
        client
            .relocate_host(&"vm-7".to_string(), &"host-2".to_string())
            .await
            .unwrap();
        let tasks = gw.tasks.lock().unwrap().clone();
        assert_eq!(tasks.len(), 2);
        assert!(tasks[0].starts_with("vm-7 detach-disk"));
        assert!(tasks[1].contains("host-2"));
    }

    #[tokio::test]
    async fn test_unreachable_gateway_is_unavailable() {
        let client = VmgrGateway::new("http://127.0.0.1:1", 0);
        let err = client.vmgr_snapshot().await.unwrap_err();
        assert!(err.is_transient());
    }
}
