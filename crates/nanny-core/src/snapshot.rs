//! Per-cycle inventory snapshots and the traits upstream adapters implement
//! to produce them.
//!
//! A snapshot is owned by the cycle that fetched it and dropped when the cycle
//! ends. Compute and storage views are critical: failing to fetch them, or
//! fetching an empty inventory, aborts the cycle. The other views degrade to
//! [`View::Unavailable`] and the classifiers abstain from anything that needs
//! them.

use crate::error::{NannyError, Result};
use crate::model::{
    Aggregate, Cluster, Datastore, FlexVol, FolderListing, Host, Instance, InstanceId, Lun, Moid,
    VmObject, Volume, VolumeId,
};
use crate::tables::{Database, IntegrityPair, RowKey, TableSpec};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use uuid::Uuid;

/// An upstream view that may be missing for this cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum View<T> {
    Available(T),
    Unavailable { reason: String },
    /// The nanny does not use this upstream.
    NotRequested,
}

impl<T> View<T> {
    pub fn get(&self) -> Option<&T> {
        match self {
            View::Available(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, View::Available(_))
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, View::Unavailable { .. })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ComputeSnapshot {
    pub instances: HashMap<InstanceId, Instance>,
    /// Compute host name to the names of the aggregates it belongs to.
    pub host_aggregates: HashMap<String, BTreeSet<String>>,
}

impl ComputeSnapshot {
    /// Compute hosts that carry at least one instance.
    pub fn resident_hosts(&self) -> BTreeSet<String> {
        self.instances
            .values()
            .filter_map(|i| i.host.clone())
            .collect()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageSnapshot {
    pub volumes: HashMap<VolumeId, Volume>,
    /// Ids of volumes that exist only as soft-deleted rows.
    pub deleted_volume_ids: HashSet<VolumeId>,
    /// Every `volume_attachment.id`, live and soft-deleted.
    pub all_attachment_ids: HashSet<Uuid>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VmgrSnapshot {
    pub vms: HashMap<Moid, VmObject>,
    pub datastores: HashMap<Moid, Datastore>,
    pub hosts: HashMap<Moid, Host>,
    pub clusters: HashMap<Moid, Cluster>,
    /// Recursive browse results keyed by datastore name.
    pub listings: BTreeMap<String, Vec<FolderListing>>,
    /// Datastores whose browse failed after retries.
    pub no_access: BTreeSet<String>,
}

impl VmgrSnapshot {
    pub fn datastore_by_name(&self, name: &str) -> Option<&Datastore> {
        self.datastores.values().find(|d| d.name == name)
    }

    /// VMs keyed by instance uuid, shadow VMs excluded.
    pub fn instance_vms(&self) -> HashMap<InstanceId, &VmObject> {
        self.vms
            .values()
            .filter(|vm| !vm.is_shadow())
            .filter_map(|vm| vm.instance_uuid.get().map(|id| (*id, vm)))
            .collect()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArraySnapshot {
    pub aggregates: HashMap<String, Aggregate>,
    pub flexvols: HashMap<String, FlexVol>,
    pub luns: Vec<Lun>,
}

/// Control-plane catalog data used by the virtualization checks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogSnapshot {
    pub image_ids: HashSet<Uuid>,
}

/// A live child row referencing a soft-deleted parent row.
#[derive(Debug, Clone, PartialEq)]
pub struct OrphanRow {
    pub pair: IntegrityPair,
    pub child_key: RowKey,
    pub parent_key: String,
}

#[derive(Debug, Clone, Default)]
pub struct IntegritySnapshot {
    pub database: Option<Database>,
    pub orphans: Vec<OrphanRow>,
    /// Rows flagged deleted whose `deleted_at` is NULL.
    pub missing_deleted_at: Vec<(TableSpec, RowKey)>,
    /// Deleted service rows still referenced by a live volume, with the
    /// referencing host string.
    pub referenced_deleted_services: Vec<(RowKey, String)>,
}

#[async_trait]
pub trait ComputeSource: Send + Sync {
    async fn compute_snapshot(&self) -> Result<ComputeSnapshot>;
}

#[async_trait]
pub trait StorageSource: Send + Sync {
    async fn storage_snapshot(&self) -> Result<StorageSnapshot>;
}

#[async_trait]
pub trait VmgrSource: Send + Sync {
    async fn vmgr_snapshot(&self) -> Result<VmgrSnapshot>;
}

#[async_trait]
pub trait ArraySource: Send + Sync {
    async fn array_snapshot(&self) -> Result<ArraySnapshot>;
}

#[async_trait]
pub trait CatalogSource: Send + Sync {
    async fn catalog_snapshot(&self) -> Result<CatalogSnapshot>;
}

#[async_trait]
pub trait IntegritySource: Send + Sync {
    fn database(&self) -> Database;

    async fn integrity_snapshot(&self, pairs: &[IntegrityPair]) -> Result<IntegritySnapshot>;
}

/// Everything observed in one cycle.
#[derive(Debug, Clone)]
pub struct CycleSnapshot {
    pub taken_at: DateTime<Utc>,
    pub compute: View<ComputeSnapshot>,
    pub storage: View<StorageSnapshot>,
    pub vmgr: View<VmgrSnapshot>,
    pub array: View<ArraySnapshot>,
    pub catalog: View<CatalogSnapshot>,
}

impl CycleSnapshot {
    pub fn empty(taken_at: DateTime<Utc>) -> Self {
        Self {
            taken_at,
            compute: View::NotRequested,
            storage: View::NotRequested,
            vmgr: View::NotRequested,
            array: View::NotRequested,
            catalog: View::NotRequested,
        }
    }

    /// Names of requested upstreams that could not be fetched.
    pub fn unavailable_upstreams(&self) -> Vec<&'static str> {
        let mut out = Vec::new();
        if self.compute.is_unavailable() {
            out.push("compute-db");
        }
        if self.storage.is_unavailable() {
            out.push("storage-db");
        }
        if self.vmgr.is_unavailable() {
            out.push("vmgr");
        }
        if self.array.is_unavailable() {
            out.push("array");
        }
        if self.catalog.is_unavailable() {
            out.push("catalog");
        }
        out
    }
}

/// Fetches the upstream views a nanny needs, in parallel.
#[derive(Clone, Default)]
pub struct Snapshotter {
    pub compute: Option<std::sync::Arc<dyn ComputeSource>>,
    pub storage: Option<std::sync::Arc<dyn StorageSource>>,
    pub vmgr: Option<std::sync::Arc<dyn VmgrSource>>,
    pub array: Option<std::sync::Arc<dyn ArraySource>>,
    pub catalog: Option<std::sync::Arc<dyn CatalogSource>>,
}

fn optional<T>(upstream: &str, fetched: Option<Result<T>>) -> View<T> {
    match fetched {
        None => View::NotRequested,
        Some(Ok(v)) => View::Available(v),
        Some(Err(e)) => {
            tracing::warn!("{} snapshot unavailable: {}", upstream, e);
            View::Unavailable {
                reason: e.to_string(),
            }
        }
    }
}

impl Snapshotter {
    pub async fn collect(&self, taken_at: DateTime<Utc>) -> Result<CycleSnapshot> {
        let compute = async {
            match &self.compute {
                Some(src) => Some(src.compute_snapshot().await),
                None => None,
            }
        };
        let storage = async {
            match &self.storage {
                Some(src) => Some(src.storage_snapshot().await),
                None => None,
            }
        };
        let vmgr = async {
            match &self.vmgr {
                Some(src) => Some(src.vmgr_snapshot().await),
                None => None,
            }
        };
        let array = async {
            match &self.array {
                Some(src) => Some(src.array_snapshot().await),
                None => None,
            }
        };
        let catalog = async {
            match &self.catalog {
                Some(src) => Some(src.catalog_snapshot().await),
                None => None,
            }
        };

        let (compute, storage, vmgr, array, catalog) =
            tokio::join!(compute, storage, vmgr, array, catalog);

        let compute = match compute {
            None => View::NotRequested,
            Some(Ok(snap)) if snap.instances.is_empty() => {
                return Err(NannyError::EmptyInventory {
                    upstream: "compute-db".to_string(),
                })
            }
            Some(Ok(snap)) => View::Available(snap),
            Some(Err(e)) => return Err(e),
        };
        let storage = match storage {
            None => View::NotRequested,
            Some(Ok(snap)) if snap.volumes.is_empty() => {
                return Err(NannyError::EmptyInventory {
                    upstream: "storage-db".to_string(),
                })
            }
            Some(Ok(snap)) => View::Available(snap),
            Some(Err(e)) => return Err(e),
        };

        Ok(CycleSnapshot {
            taken_at,
            compute,
            storage,
            vmgr: optional("vmgr", vmgr),
            array: optional("array", array),
            catalog: optional("catalog", catalog),
        })
    }
}
