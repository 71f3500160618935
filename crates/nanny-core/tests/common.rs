//! In-memory fleet shared by the integration tests.
//!
//! `FakeFleet` serves every snapshot from one mutable state and applies
//! repairs to that same state, so a test can run several cycles and watch the
//! fleet converge.

#![allow(dead_code)]

use async_trait::async_trait;
use nanny_core::error::{NannyError, Result};
use nanny_core::executor::Repairers;
use nanny_core::model::{
    AttachStatus, BlockDeviceMapping, DrsBehavior, HardwareDevice, Instance, Moid, PowerState,
    Property, Runtime, SharesLevel, VirtualDisk, VmObject, Volume, VolumeAttachment, VolumeId,
    VolumeStatus, GIB,
};
use nanny_core::repair::{
    ComputeRepair, DatabaseRepair, NewAttachment, StorageRepair, VmgrRepair, VolumeLocker,
};
use nanny_core::snapshot::{
    ArraySnapshot, ArraySource, CatalogSnapshot, CatalogSource, ComputeSnapshot, ComputeSource,
    Snapshotter, StorageSnapshot, StorageSource, VmgrSnapshot, VmgrSource,
};
use nanny_core::tables::{compute, storage, RowKey, TableSpec};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

#[derive(Debug, Default, Clone)]
pub struct FleetState {
    pub compute: ComputeSnapshot,
    pub storage: StorageSnapshot,
    pub vmgr: VmgrSnapshot,
    pub array: ArraySnapshot,
    pub catalog: CatalogSnapshot,
    pub vmgr_down: bool,
}

#[derive(Default)]
pub struct FakeFleet {
    pub state: Mutex<FleetState>,
    /// Every mutation in the order it reached the fleet.
    pub calls: Mutex<Vec<String>>,
}

impl FakeFleet {
    pub fn new(state: FleetState) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(state),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn snapshotter(self: &Arc<Self>) -> Snapshotter {
        Snapshotter {
            compute: Some(self.clone()),
            storage: Some(self.clone()),
            vmgr: Some(self.clone()),
            array: Some(self.clone()),
            catalog: Some(self.clone()),
        }
    }

    pub fn repairers(self: &Arc<Self>) -> Repairers {
        Repairers {
            compute: Some(self.clone()),
            storage: Some(self.clone()),
            share: None,
            vmgr: Some(self.clone()),
            locker: Some(self.clone()),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn mutations(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| !c.starts_with("lock") && !c.starts_with("unlock"))
            .collect()
    }

    pub fn volume(&self, id: &VolumeId) -> Option<Volume> {
        self.state.lock().unwrap().storage.volumes.get(id).cloned()
    }

    pub fn with_state<R>(&self, f: impl FnOnce(&mut FleetState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl ComputeSource for FakeFleet {
    async fn compute_snapshot(&self) -> Result<ComputeSnapshot> {
        Ok(self.state.lock().unwrap().compute.clone())
    }
}

#[async_trait]
impl StorageSource for FakeFleet {
    async fn storage_snapshot(&self) -> Result<StorageSnapshot> {
        Ok(self.state.lock().unwrap().storage.clone())
    }
}

#[async_trait]
impl VmgrSource for FakeFleet {
    async fn vmgr_snapshot(&self) -> Result<VmgrSnapshot> {
        let state = self.state.lock().unwrap();
        if state.vmgr_down {
            return Err(NannyError::unavailable("vmgr", "connection reset"));
        }
        Ok(state.vmgr.clone())
    }
}

#[async_trait]
impl ArraySource for FakeFleet {
    async fn array_snapshot(&self) -> Result<ArraySnapshot> {
        Ok(self.state.lock().unwrap().array.clone())
    }
}

#[async_trait]
impl CatalogSource for FakeFleet {
    async fn catalog_snapshot(&self) -> Result<CatalogSnapshot> {
        Ok(self.state.lock().unwrap().catalog.clone())
    }
}

#[async_trait]
impl DatabaseRepair for FakeFleet {
    async fn soft_delete(&self, table: &TableSpec, key: &RowKey) -> Result<()> {
        self.record(format!("soft_delete {} {}", table.name, key));
        let mut state = self.state.lock().unwrap();
        if *table == storage::VOLUME_ATTACHMENT {
            for volume in state.storage.volumes.values_mut() {
                volume.attachments.retain(|a| a.id.to_string() != key.as_str());
            }
        } else if *table == storage::VOLUMES {
            if let Ok(id) = Uuid::parse_str(key.as_str()) {
                state.storage.volumes.remove(&id);
                state.storage.deleted_volume_ids.insert(id);
            }
        } else if *table == compute::BLOCK_DEVICE_MAPPING {
            let id = key.as_i64();
            for instance in state.compute.instances.values_mut() {
                instance.block_devices.retain(|b| Some(b.id) != id);
            }
        }
        Ok(())
    }

    async fn fill_deleted_at(&self, table: &TableSpec, key: &RowKey) -> Result<()> {
        self.record(format!("fill_deleted_at {} {}", table.name, key));
        Ok(())
    }

    async fn undelete(&self, table: &TableSpec, key: &RowKey) -> Result<()> {
        self.record(format!("undelete {} {}", table.name, key));
        Ok(())
    }
}

#[async_trait]
impl ComputeRepair for FakeFleet {
    async fn set_mapping_attachment_id(&self, mapping_id: i64, attachment_id: Uuid) -> Result<()> {
        self.record(format!("set_mapping_attachment_id {} {}", mapping_id, attachment_id));
        let mut state = self.state.lock().unwrap();
        let mapping = state
            .compute
            .instances
            .values_mut()
            .flat_map(|i| i.block_devices.iter_mut())
            .find(|b| b.id == mapping_id);
        match mapping {
            Some(b) => {
                b.attachment_id = Some(attachment_id);
                Ok(())
            }
            None => Err(NannyError::NoRowsAffected {
                table: "block_device_mapping".to_string(),
                key: mapping_id.to_string(),
            }),
        }
    }
}

#[async_trait]
impl StorageRepair for FakeFleet {
    async fn set_volume_status(
        &self,
        volume: &VolumeId,
        status: VolumeStatus,
        attach_status: AttachStatus,
    ) -> Result<()> {
        self.record(format!("set_volume_status {} {} {}", volume, status, attach_status));
        let mut state = self.state.lock().unwrap();
        let v = state
            .storage
            .volumes
            .get_mut(volume)
            .ok_or_else(|| NannyError::NoRowsAffected {
                table: "volumes".to_string(),
                key: volume.to_string(),
            })?;
        v.status = status;
        v.attach_status = attach_status;
        Ok(())
    }

    async fn insert_attachment(&self, row: &NewAttachment) -> Result<()> {
        self.record(format!("insert_attachment {} {}", row.id, row.volume_id));
        let mut state = self.state.lock().unwrap();
        state.storage.all_attachment_ids.insert(row.id);
        if let Some(v) = state.storage.volumes.get_mut(&row.volume_id) {
            v.attachments.push(VolumeAttachment {
                id: row.id,
                volume_id: row.volume_id,
                instance_id: Some(row.instance_id),
                device_name: row.device_name.clone(),
                attach_status: Some(AttachStatus::Attached),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl VmgrRepair for FakeFleet {
    async fn detach_disk(&self, vm: &Moid, disk_key: i32) -> Result<()> {
        self.record(format!("detach_disk {} {}", vm, disk_key));
        let mut state = self.state.lock().unwrap();
        if let Some(Property::Present(devices)) =
            state.vmgr.vms.get_mut(vm).map(|v| &mut v.hardware_devices)
        {
            devices.retain(|d| !matches!(d, HardwareDevice::Disk(disk) if disk.key == disk_key));
        }
        Ok(())
    }

    async fn detach_nic(&self, vm: &Moid, nic_key: i32) -> Result<()> {
        self.record(format!("detach_nic {} {}", vm, nic_key));
        Ok(())
    }

    async fn move_datastore_path(&self, datastore: &str, from: &str, to: &str) -> Result<()> {
        self.record(format!("move [{}] {} {}", datastore, from, to));
        Ok(())
    }

    async fn delete_datastore_path(&self, datastore: &str, path: &str) -> Result<()> {
        self.record(format!("delete [{}] {}", datastore, path));
        Ok(())
    }

    async fn suspend(&self, vm: &Moid) -> Result<()> {
        self.record(format!("suspend {}", vm));
        Ok(())
    }

    async fn power_off(&self, vm: &Moid) -> Result<()> {
        self.record(format!("power_off {}", vm));
        Ok(())
    }

    async fn unregister(&self, vm: &Moid) -> Result<()> {
        self.record(format!("unregister {}", vm));
        Ok(())
    }

    async fn relocate_storage(&self, vm: &Moid, datastore: &Moid) -> Result<()> {
        self.record(format!("relocate_storage {} {}", vm, datastore));
        Ok(())
    }

    async fn relocate_host(&self, vm: &Moid, host: &Moid) -> Result<()> {
        self.record(format!("relocate_host {} {}", vm, host));
        Ok(())
    }

    async fn set_memory_shares(&self, vm: &Moid, level: SharesLevel) -> Result<()> {
        self.record(format!("set_memory_shares {} {:?}", vm, level));
        Ok(())
    }

    async fn set_drs_override(
        &self,
        cluster: &Moid,
        vm: &Moid,
        behavior: DrsBehavior,
        edit: bool,
    ) -> Result<()> {
        self.record(format!(
            "set_drs_override {} {} {} {}",
            cluster,
            vm,
            behavior.as_str(),
            edit
        ));
        Ok(())
    }
}

#[async_trait]
impl VolumeLocker for FakeFleet {
    async fn lock_volume(&self, volume: &VolumeId) -> Result<()> {
        self.record(format!("lock {}", volume));
        Ok(())
    }

    async fn unlock_volume(&self, volume: &VolumeId) -> Result<()> {
        self.record(format!("unlock {}", volume));
        Ok(())
    }
}

pub fn instance(id: Uuid) -> Instance {
    Instance {
        id,
        project: "project".to_string(),
        display_name: "server".to_string(),
        availability_zone: Some("qa-de-1a".to_string()),
        host: Some("nova-compute-bb01".to_string()),
        status: "ACTIVE".to_string(),
        block_devices: Vec::new(),
        port_ids: BTreeSet::new(),
    }
}

pub fn mapping(id: i64, instance: Uuid, volume: Uuid, attachment: Option<Uuid>) -> BlockDeviceMapping {
    BlockDeviceMapping {
        id,
        instance_id: instance,
        volume_id: volume,
        attachment_id: attachment,
        device_name: Some("/dev/sdb".to_string()),
    }
}

pub fn volume(id: Uuid, status: VolumeStatus) -> Volume {
    Volume {
        id,
        project: "project".to_string(),
        status,
        attach_status: if status == VolumeStatus::InUse {
            AttachStatus::Attached
        } else {
            AttachStatus::Detached
        },
        size_bytes: 10 * GIB,
        host: Some("cinder-volume-bb01".to_string()),
        availability_zone: Some("qa-de-1a".to_string()),
        attachments: Vec::new(),
        updated_at: None,
    }
}

pub fn attachment(volume: Uuid, instance: Uuid) -> VolumeAttachment {
    VolumeAttachment {
        id: Uuid::new_v4(),
        volume_id: volume,
        instance_id: Some(instance),
        device_name: Some("/dev/sdb".to_string()),
        attach_status: Some(AttachStatus::Attached),
    }
}

pub fn volume_disk(key: i32, datastore: &str, volume: Uuid, backing: Option<Uuid>) -> VirtualDisk {
    VirtualDisk {
        key,
        backing_filename: format!("[{0}] {1}/{1}.vmdk", datastore, volume),
        backing_uuid: backing,
        capacity_bytes: 10 * GIB,
        datastore: Some("datastore-1".to_string()),
    }
}

pub fn instance_vm(moid: &str, instance: Uuid, disks: Vec<VirtualDisk>) -> VmObject {
    let mut vm = VmObject::new(moid);
    vm.config_name = Property::Present(format!("server ({})", instance));
    vm.instance_uuid = Property::Present(instance);
    vm.annotation = Property::Present("name:server".to_string());
    vm.memory_mb = Property::Present(4096);
    vm.runtime = Property::Present(Runtime {
        power_state: PowerState::PoweredOn,
        host: Some("host-1".to_string()),
    });
    vm.hardware_devices =
        Property::Present(disks.into_iter().map(HardwareDevice::Disk).collect());
    vm
}

/// A fleet with one healthy instance so the compute inventory is never
/// empty.
pub fn base_state() -> FleetState {
    let mut state = FleetState::default();
    let anchor = Uuid::new_v4();
    state.compute.instances.insert(anchor, instance(anchor));
    state
}

pub fn add_volume(state: &mut FleetState, v: Volume) {
    state.storage.volumes.insert(v.id, v);
}
