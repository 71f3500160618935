//! Repair actions and the upstream traits that apply them.
//!
//! Every action is idempotent: replaying it on the post-state is a no-op
//! (soft-deleting a deleted row, setting a status that is already set,
//! detaching an absent disk).

use crate::error::Result;
use crate::model::{AttachStatus, DrsBehavior, InstanceId, Moid, SharesLevel, VolumeId, VolumeStatus};
use crate::tables::{Database, RowKey, TableSpec};
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use uuid::Uuid;

/// Upstreams in the order their mutations run within one entity: the
/// cheapest to undo first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum Upstream {
    ComputeDb,
    StorageDb,
    ShareDb,
    Vmgr,
}

impl Upstream {
    pub fn for_database(db: Database) -> Self {
        match db {
            Database::Compute => Upstream::ComputeDb,
            Database::Storage => Upstream::StorageDb,
            Database::Share => Upstream::ShareDb,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Upstream::ComputeDb => "compute-db",
            Upstream::StorageDb => "storage-db",
            Upstream::ShareDb => "share-db",
            Upstream::Vmgr => "vmgr",
        }
    }
}

/// A storage-DB attachment row reconstructed from the compute side.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewAttachment {
    pub id: Uuid,
    pub volume_id: VolumeId,
    pub instance_id: InstanceId,
    pub device_name: Option<String>,
    pub attached_host: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RepairAction {
    /// `UPDATE <table> SET deleted=<repr>, deleted_at=now, updated_at=now`
    SoftDelete { table: TableSpec, key: RowKey },
    /// `UPDATE <table> SET deleted_at=updated_at`
    FillDeletedAt { table: TableSpec, key: RowKey },
    /// Clear the deleted flag of a row (services only).
    Undelete { table: TableSpec, key: RowKey },
    SetVolumeStatus {
        volume: VolumeId,
        status: VolumeStatus,
        attach_status: AttachStatus,
    },
    /// Write a freshly allocated attachment id back to a compute mapping row.
    SetMappingAttachmentId { mapping_id: i64, attachment_id: Uuid },
    InsertAttachment(NewAttachment),
    DetachDisk { vm: Moid, disk_key: i32, volume: Option<VolumeId> },
    DetachNic { vm: Moid, nic_key: i32 },
    MoveDatastorePath { datastore: String, from: String, to: String },
    DeleteDatastorePath { datastore: String, path: String },
    SuspendVm { vm: Moid },
    PowerOffVm { vm: Moid },
    UnregisterVm { vm: Moid },
    RelocateStorage {
        vm: Moid,
        volume: VolumeId,
        from_datastore: Moid,
        to_datastore: Moid,
        size_bytes: u64,
    },
    RelocateHost {
        vm: Moid,
        from_host: Moid,
        to_host: Moid,
        memory_bytes: u64,
    },
    SetMemoryShares { vm: Moid, level: SharesLevel },
    SetDrsOverride {
        cluster: Moid,
        vm: Moid,
        behavior: DrsBehavior,
        /// An override already exists and must be edited rather than added.
        edit: bool,
    },
}

impl RepairAction {
    pub fn upstream(&self) -> Upstream {
        match self {
            RepairAction::SoftDelete { table, .. }
            | RepairAction::FillDeletedAt { table, .. }
            | RepairAction::Undelete { table, .. } => Upstream::for_database(table.database),
            RepairAction::SetVolumeStatus { .. } | RepairAction::InsertAttachment(_) => {
                Upstream::StorageDb
            }
            RepairAction::SetMappingAttachmentId { .. } => Upstream::ComputeDb,
            RepairAction::DetachDisk { .. }
            | RepairAction::DetachNic { .. }
            | RepairAction::MoveDatastorePath { .. }
            | RepairAction::DeleteDatastorePath { .. }
            | RepairAction::SuspendVm { .. }
            | RepairAction::PowerOffVm { .. }
            | RepairAction::UnregisterVm { .. }
            | RepairAction::RelocateStorage { .. }
            | RepairAction::RelocateHost { .. }
            | RepairAction::SetMemoryShares { .. }
            | RepairAction::SetDrsOverride { .. } => Upstream::Vmgr,
        }
    }
}

impl fmt::Display for RepairAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RepairAction::SoftDelete { table, key } => write!(
                f,
                "soft-delete {}.{} {}={}",
                table.database, table.name, table.key_column, key
            ),
            RepairAction::FillDeletedAt { table, key } => write!(
                f,
                "set deleted_at=updated_at on {}.{} {}={}",
                table.database, table.name, table.key_column, key
            ),
            RepairAction::Undelete { table, key } => write!(
                f,
                "clear deleted flag on {}.{} {}={}",
                table.database, table.name, table.key_column, key
            ),
            RepairAction::SetVolumeStatus {
                volume,
                status,
                attach_status,
            } => write!(
                f,
                "set volume {} status={} attach_status={}",
                volume, status, attach_status
            ),
            RepairAction::SetMappingAttachmentId {
                mapping_id,
                attachment_id,
            } => write!(
                f,
                "set block_device_mapping {} attachment_id={}",
                mapping_id, attachment_id
            ),
            RepairAction::InsertAttachment(row) => write!(
                f,
                "insert volume_attachment {} volume={} instance={}",
                row.id, row.volume_id, row.instance_id
            ),
            RepairAction::DetachDisk { vm, disk_key, volume } => match volume {
                Some(v) => write!(f, "detach disk {} (volume {}) from vm {}", disk_key, v, vm),
                None => write!(f, "detach disk {} from vm {}", disk_key, vm),
            },
            RepairAction::DetachNic { vm, nic_key } => {
                write!(f, "detach nic {} from vm {}", nic_key, vm)
            }
            RepairAction::MoveDatastorePath { datastore, from, to } => {
                write!(f, "rename [{}] {} -> {}", datastore, from, to)
            }
            RepairAction::DeleteDatastorePath { datastore, path } => {
                write!(f, "delete [{}] {}", datastore, path)
            }
            RepairAction::SuspendVm { vm } => write!(f, "suspend vm {}", vm),
            RepairAction::PowerOffVm { vm } => write!(f, "power off vm {}", vm),
            RepairAction::UnregisterVm { vm } => write!(f, "unregister vm {}", vm),
            RepairAction::RelocateStorage {
                vm,
                volume,
                from_datastore,
                to_datastore,
                size_bytes,
            } => write!(
                f,
                "move volume {} (vm {}, {} GiB) from {} to {}",
                volume,
                vm,
                size_bytes / crate::model::GIB,
                from_datastore,
                to_datastore
            ),
            RepairAction::RelocateHost {
                vm,
                from_host,
                to_host,
                memory_bytes,
            } => write!(
                f,
                "migrate vm {} ({} GiB) from {} to {}",
                vm,
                memory_bytes / crate::model::GIB,
                from_host,
                to_host
            ),
            RepairAction::SetMemoryShares { vm, level } => {
                write!(f, "set memory shares of vm {} to {:?}", vm, level)
            }
            RepairAction::SetDrsOverride {
                cluster,
                vm,
                behavior,
                edit,
            } => write!(
                f,
                "{} drs override {} for vm {} on cluster {}",
                if *edit { "edit" } else { "add" },
                behavior.as_str(),
                vm,
                cluster
            ),
        }
    }
}

/// Row-level mutations shared by every relational upstream.
#[async_trait]
pub trait DatabaseRepair: Send + Sync {
    async fn soft_delete(&self, table: &TableSpec, key: &RowKey) -> Result<()>;

    async fn fill_deleted_at(&self, table: &TableSpec, key: &RowKey) -> Result<()>;

    async fn undelete(&self, table: &TableSpec, key: &RowKey) -> Result<()>;
}

#[async_trait]
pub trait ComputeRepair: DatabaseRepair {
    async fn set_mapping_attachment_id(&self, mapping_id: i64, attachment_id: Uuid) -> Result<()>;
}

#[async_trait]
pub trait StorageRepair: DatabaseRepair {
    async fn set_volume_status(
        &self,
        volume: &VolumeId,
        status: VolumeStatus,
        attach_status: AttachStatus,
    ) -> Result<()>;

    async fn insert_attachment(&self, row: &NewAttachment) -> Result<()>;
}

/// Mutations issued against the virtualization manager. Long-running tasks
/// are awaited to completion.
#[async_trait]
pub trait VmgrRepair: Send + Sync {
    async fn detach_disk(&self, vm: &Moid, disk_key: i32) -> Result<()>;
    async fn detach_nic(&self, vm: &Moid, nic_key: i32) -> Result<()>;
    async fn move_datastore_path(&self, datastore: &str, from: &str, to: &str) -> Result<()>;
    async fn delete_datastore_path(&self, datastore: &str, path: &str) -> Result<()>;
    async fn suspend(&self, vm: &Moid) -> Result<()>;
    async fn power_off(&self, vm: &Moid) -> Result<()>;
    async fn unregister(&self, vm: &Moid) -> Result<()>;
    async fn relocate_storage(&self, vm: &Moid, datastore: &Moid) -> Result<()>;
    async fn relocate_host(&self, vm: &Moid, host: &Moid) -> Result<()>;
    async fn set_memory_shares(&self, vm: &Moid, level: SharesLevel) -> Result<()>;
    async fn set_drs_override(
        &self,
        cluster: &Moid,
        vm: &Moid,
        behavior: DrsBehavior,
        edit: bool,
    ) -> Result<()>;
}

/// Control-plane lock taken on a volume before its storage-DB row changes.
#[async_trait]
pub trait VolumeLocker: Send + Sync {
    async fn lock_volume(&self, volume: &VolumeId) -> Result<()>;
    async fn unlock_volume(&self, volume: &VolumeId) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tables::{compute, storage};

    #[test]
    fn test_upstream_order() {
        let mut ups = vec![Upstream::Vmgr, Upstream::StorageDb, Upstream::ComputeDb];
        ups.sort();
        assert_eq!(ups, vec![Upstream::ComputeDb, Upstream::StorageDb, Upstream::Vmgr]);
    }

    #[test]
    fn test_action_upstreams() {
        let soft = RepairAction::SoftDelete {
            table: storage::VOLUME_ATTACHMENT,
            key: RowKey::new("a"),
        };
        assert_eq!(soft.upstream(), Upstream::StorageDb);
        let bdm = RepairAction::SoftDelete {
            table: compute::BLOCK_DEVICE_MAPPING,
            key: RowKey::new(7),
        };
        assert_eq!(bdm.upstream(), Upstream::ComputeDb);
        let detach = RepairAction::DetachNic {
            vm: "vm-1".to_string(),
            nic_key: 4000,
        };
        assert_eq!(detach.upstream(), Upstream::Vmgr);
    }

    #[test]
    fn test_action_display() {
        let action = RepairAction::SoftDelete {
            table: storage::VOLUME_ATTACHMENT,
            key: RowKey::new("abc"),
        };
        assert_eq!(
            action.to_string(),
            "soft-delete storage-db.volume_attachment id=abc"
        );
        let rename = RepairAction::MoveDatastorePath {
            datastore: "ds1".to_string(),
            from: "x".to_string(),
            to: "x.renamed_by_nanny".to_string(),
        };
        assert_eq!(rename.to_string(), "rename [ds1] x -> x.renamed_by_nanny");
    }
}
