//! Cross-view joiner.
//!
//! Keys the compute, storage and virtualization snapshots by volume and
//! instance id and resolves which volume each virtual disk belongs to. The
//! disk identity policy, in order of preference:
//!
//! 1. an extra-config `volume-<id>` entry whose value names the disk,
//! 2. the disk's backing uuid,
//! 3. the single uuid embedded in the backing filename.
//!
//! Disagreement between (1) and (2) is reported for an operator. Disagreement
//! between (2) and (3) where both are live volumes, and disks without any
//! recoverable id, are structural anomalies that force the cycle into
//! dry-run.

use crate::events::ManualCheck;
use crate::ident::{self, BackendMapper, BackendMapping, LunPath};
use crate::model::{
    BlockDeviceMapping, Datastore, Instance, InstanceId, VirtualDisk, VmObject, Volume,
    VolumeAttachment, VolumeId,
};
use crate::snapshot::{ArraySnapshot, ComputeSnapshot, StorageSnapshot, VmgrSnapshot};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use uuid::Uuid;

/// A condition that makes mutation unsafe for the rest of the cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Anomaly {
    pub entity: String,
    pub reason: String,
}

impl Anomaly {
    pub fn new(entity: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdSource {
    ExtraConfig,
    BackingUuid,
    Filename,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiskIdentity {
    Volume { id: VolumeId, source: IdSource },
    /// The instance's own root disk.
    Root,
    /// No backing uuid and no recoverable filename id.
    Unresolved,
}

/// One disk of an instance VM with its resolved identity.
#[derive(Debug, Clone)]
pub struct ResolvedDisk<'a> {
    pub disk: &'a VirtualDisk,
    pub identity: DiskIdentity,
    /// The resolved id is not a live volume: a deleted volume, or an
    /// extra-config id storage does not know.
    pub ghost: bool,
}

#[derive(Debug, Clone)]
pub struct JoinedAttachment<'a> {
    pub volume_id: VolumeId,
    pub instance_id: InstanceId,
    pub storage: Option<&'a VolumeAttachment>,
    pub compute: Option<&'a BlockDeviceMapping>,
    pub vmgr: Option<&'a VirtualDisk>,
}

#[derive(Debug, Clone)]
pub struct JoinedVolume<'a> {
    pub id: VolumeId,
    /// `None` when only compute or the virtualization manager reference it.
    pub volume: Option<&'a Volume>,
    pub attachments: BTreeMap<InstanceId, JoinedAttachment<'a>>,
    pub shadow: Option<&'a VmObject>,
}

impl<'a> JoinedVolume<'a> {
    pub fn attachments_cp_storage(&self) -> BTreeSet<InstanceId> {
        self.attachments
            .values()
            .filter(|a| a.storage.is_some())
            .map(|a| a.instance_id)
            .collect()
    }

    pub fn attachments_cp_compute(&self) -> BTreeSet<InstanceId> {
        self.attachments
            .values()
            .filter(|a| a.compute.is_some())
            .map(|a| a.instance_id)
            .collect()
    }

    pub fn attachments_vmgr(&self) -> BTreeSet<InstanceId> {
        self.attachments
            .values()
            .filter(|a| a.vmgr.is_some())
            .map(|a| a.instance_id)
            .collect()
    }

    /// Whether any view records an attachment, ignoring `except`.
    pub fn attached_anywhere_except(&self, except: Option<&InstanceId>) -> bool {
        self.attachments.values().any(|a| {
            Some(&a.instance_id) != except
                && (a.storage.is_some() || a.compute.is_some() || a.vmgr.is_some())
        })
    }
}

#[derive(Debug, Clone)]
pub struct JoinedInstance<'a> {
    pub id: InstanceId,
    pub instance: Option<&'a Instance>,
    pub vm: &'a VmObject,
    pub disks: Vec<ResolvedDisk<'a>>,
}

/// Attachment-level join of one cycle.
#[derive(Debug, Default)]
pub struct Joined<'a> {
    pub volumes: BTreeMap<VolumeId, JoinedVolume<'a>>,
    pub instances: BTreeMap<InstanceId, JoinedInstance<'a>>,
    /// Whether the virtualization view took part in the join.
    pub vmgr_available: bool,
    pub anomalies: Vec<Anomaly>,
    pub manual: Vec<ManualCheck>,
}

impl<'a> Joined<'a> {
    pub fn vm_for(&self, instance: &InstanceId) -> Option<&'a VmObject> {
        self.instances.get(instance).map(|j| j.vm)
    }
}

/// Resolve one disk of `vm` (an instance VM with id `instance`).
pub fn resolve_disk<'a>(
    vm: &VmObject,
    instance: &InstanceId,
    disk: &'a VirtualDisk,
    storage: &StorageSnapshot,
    anomalies: &mut Vec<Anomaly>,
    manual: &mut Vec<ManualCheck>,
) -> ResolvedDisk<'a> {
    let filename_id = ident::uuid_in_filename(&disk.backing_filename);
    if filename_id.as_ref() == Some(instance) {
        return ResolvedDisk {
            disk,
            identity: DiskIdentity::Root,
            ghost: false,
        };
    }

    let live = |id: &Uuid| storage.volumes.contains_key(id);
    let extra = vm.extra_config_volumes();

    if let Some(backing) = disk.backing_uuid {
        // Checked before any extra-config match: a matching entry does not
        // settle which of the two live volumes the disk holds.
        if let Some(from_name) = filename_id {
            if from_name != backing && live(&backing) && live(&from_name) {
                anomalies.push(Anomaly::new(
                    format!("{}:{}", vm.moid, disk.key),
                    format!(
                        "backing uuid {} and filename uuid {} name two live volumes",
                        backing, from_name
                    ),
                ));
            }
        }

        let by_value = extra
            .iter()
            .find(|(_, value)| Uuid::parse_str(value).ok() == Some(backing))
            .map(|(key, _)| *key);
        if let Some(id) = by_value {
            return ResolvedDisk {
                disk,
                identity: DiskIdentity::Volume {
                    id,
                    source: IdSource::ExtraConfig,
                },
                ghost: !live(&id),
            };
        }

        if let Some(value) = extra.get(&backing) {
            manual.push(ManualCheck::new(
                "DISK_ID_DISAGREEMENT",
                format!("{}:{}", vm.moid, disk.key),
                format!(
                    "extra-config volume-{} points at {} but the disk backing uuid is {}",
                    backing, value, backing
                ),
            ));
        }

        return ResolvedDisk {
            disk,
            identity: DiskIdentity::Volume {
                id: backing,
                source: IdSource::BackingUuid,
            },
            ghost: storage.deleted_volume_ids.contains(&backing) && !live(&backing),
        };
    }

    match filename_id {
        Some(id) => ResolvedDisk {
            disk,
            identity: DiskIdentity::Volume {
                id,
                source: IdSource::Filename,
            },
            ghost: storage.deleted_volume_ids.contains(&id) && !live(&id),
        },
        None => {
            anomalies.push(Anomaly::new(
                format!("{}:{}", vm.moid, disk.key),
                format!(
                    "disk {} has no backing uuid and no id in its filename",
                    disk.backing_filename
                ),
            ));
            ResolvedDisk {
                disk,
                identity: DiskIdentity::Unresolved,
                ghost: false,
            }
        }
    }
}

/// Join compute, storage and (optionally) the virtualization manager.
pub fn join_attachments<'a>(
    compute: &'a ComputeSnapshot,
    storage: &'a StorageSnapshot,
    vmgr: Option<&'a VmgrSnapshot>,
) -> Joined<'a> {
    let mut joined = Joined {
        vmgr_available: vmgr.is_some(),
        ..Default::default()
    };

    fn entry<'a, 'j>(
        volumes: &'j mut BTreeMap<VolumeId, JoinedVolume<'a>>,
        storage: &'a StorageSnapshot,
        volume: VolumeId,
    ) -> &'j mut JoinedVolume<'a> {
        volumes.entry(volume).or_insert_with(|| JoinedVolume {
            id: volume,
            volume: storage.volumes.get(&volume),
            attachments: BTreeMap::new(),
            shadow: None,
        })
    }

    fn pair<'a, 'j>(
        volume: &'j mut JoinedVolume<'a>,
        instance: InstanceId,
    ) -> &'j mut JoinedAttachment<'a> {
        let volume_id = volume.id;
        volume
            .attachments
            .entry(instance)
            .or_insert_with(|| JoinedAttachment {
                volume_id,
                instance_id: instance,
                storage: None,
                compute: None,
                vmgr: None,
            })
    }

    for volume in storage.volumes.values() {
        let joined_volume = entry(&mut joined.volumes, storage, volume.id);
        for attachment in &volume.attachments {
            if let Some(instance) = attachment.instance_id {
                pair(joined_volume, instance).storage = Some(attachment);
            }
        }
    }

    for instance in compute.instances.values() {
        for mapping in &instance.block_devices {
            let joined_volume = entry(&mut joined.volumes, storage, mapping.volume_id);
            pair(joined_volume, instance.id).compute = Some(mapping);
        }
    }

    let Some(vmgr) = vmgr else {
        return joined;
    };

    for vm in vmgr.vms.values() {
        if let Some(volume) = vm.shadow_volume_id() {
            if storage.volumes.contains_key(&volume) {
                entry(&mut joined.volumes, storage, volume).shadow = Some(vm);
            }
            if vm.instance_uuid.get().is_some_and(|u| *u != volume) {
                joined.manual.push(ManualCheck::new(
                    "SHADOW_INSTANCE_UUID_MISMATCH",
                    vm.moid.clone(),
                    format!("shadow vm of volume {} carries a different instanceUuid", volume),
                ));
            }
            continue;
        }
        if vm.is_template() {
            continue;
        }
        let Some(instance_id) = vm.instance_uuid.get().copied() else {
            continue;
        };

        let mut disks = Vec::new();
        for disk in vm.disks() {
            let resolved = resolve_disk(
                vm,
                &instance_id,
                disk,
                storage,
                &mut joined.anomalies,
                &mut joined.manual,
            );
            if let DiskIdentity::Volume { id, .. } = resolved.identity {
                let known = storage.volumes.contains_key(&id)
                    || joined.volumes.contains_key(&id);
                if known && !resolved.ghost {
                    let joined_volume = entry(&mut joined.volumes, storage, id);
                    pair(joined_volume, instance_id).vmgr = Some(disk);
                }
            }
            disks.push(resolved);
        }

        joined.instances.insert(
            instance_id,
            JoinedInstance {
                id: instance_id,
                instance: compute.instances.get(&instance_id),
                vm,
                disks,
            },
        );
    }

    joined
}

/// Compute hosts with resident instances that belong to no aggregate whose
/// name starts with `shard_prefix`.
pub fn shard_anomalies(compute: &ComputeSnapshot, shard_prefix: &str) -> Vec<Anomaly> {
    compute
        .resident_hosts()
        .into_iter()
        .filter(|host| {
            !compute
                .host_aggregates
                .get(host)
                .map(|aggs| aggs.iter().any(|a| a.starts_with(shard_prefix)))
                .unwrap_or(false)
        })
        .map(|host| {
            Anomaly::new(
                host.clone(),
                format!(
                    "compute host {} has instances but no {}* aggregate",
                    host, shard_prefix
                ),
            )
        })
        .collect()
}

/// A datastore with its backend and the aggregate that holds its data.
#[derive(Debug, Clone)]
pub struct JoinedDatastore<'a> {
    pub datastore: &'a Datastore,
    pub backend: BackendMapping,
    pub aggregate: Option<String>,
    pub shadow_vms: Vec<&'a VmObject>,
}

#[derive(Debug, Clone)]
pub struct JoinedAggregate {
    pub name: String,
    pub capacity_bytes: u64,
    pub used_bytes: u64,
    pub usage_percent: f64,
    pub backend: BackendMapping,
    pub flexvols: Vec<String>,
    pub datastores: Vec<String>,
}

#[derive(Debug, Default)]
pub struct StorageLayout<'a> {
    pub datastores: Vec<JoinedDatastore<'a>>,
    pub aggregates: Vec<JoinedAggregate>,
    /// Shadow-VM volume id to the flexvol of its LUN.
    pub lun_flexvols: HashMap<VolumeId, String>,
    pub anomalies: Vec<Anomaly>,
}

/// Join datastores with the array hierarchy they live on.
pub fn join_storage_layout<'a>(
    vmgr: &'a VmgrSnapshot,
    array: Option<&ArraySnapshot>,
    mapper: &BackendMapper,
) -> StorageLayout<'a> {
    let mut layout = StorageLayout::default();

    let mut vmfs_flexvol: HashMap<String, String> = HashMap::new();
    if let Some(array) = array {
        for lun in &array.luns {
            match ident::parse_lun_path(&lun.path) {
                Some(LunPath::Vvol { flexvol, uuid }) => {
                    layout.lun_flexvols.insert(uuid, flexvol);
                }
                Some(LunPath::Vmfs { flexvol, datastore }) => {
                    vmfs_flexvol.insert(datastore, flexvol);
                }
                None => {}
            }
        }
    }
    let aggregate_of = |flexvol: &str| -> Option<String> {
        array
            .and_then(|a| a.flexvols.get(flexvol))
            .map(|f| f.aggregate.clone())
    };

    let mut datastores: Vec<&Datastore> = vmgr.datastores.values().collect();
    datastores.sort_by(|a, b| a.name.cmp(&b.name));
    for ds in datastores {
        let backend = mapper.map(&ds.name);
        if let BackendMapping::Ambiguous(candidates) = &backend {
            layout.anomalies.push(Anomaly::new(
                ds.name.clone(),
                format!(
                    "datastore name maps to several backends: {}",
                    candidates.join(", ")
                ),
            ));
        }

        let shadow_vms: Vec<&VmObject> = ds
            .resident_vms
            .iter()
            .filter_map(|moid| vmgr.vms.get(moid))
            .filter(|vm| vm.is_shadow())
            .collect();

        let aggregate = match vmfs_flexvol.get(&ds.name) {
            Some(flexvol) => aggregate_of(flexvol),
            None => {
                let mut counts: BTreeMap<String, usize> = BTreeMap::new();
                for vm in &shadow_vms {
                    if let Some(flexvol) = vm
                        .shadow_volume_id()
                        .and_then(|v| layout.lun_flexvols.get(&v))
                    {
                        if let Some(aggr) = aggregate_of(flexvol) {
                            *counts.entry(aggr).or_default() += 1;
                        }
                    }
                }
                counts
                    .into_iter()
                    .max_by(|a, b| a.1.cmp(&b.1).then(b.0.cmp(&a.0)))
                    .map(|(aggr, _)| aggr)
            }
        };

        layout.datastores.push(JoinedDatastore {
            datastore: ds,
            backend,
            aggregate,
            shadow_vms,
        });
    }

    if let Some(array) = array {
        let mut names: Vec<&String> = array.aggregates.keys().collect();
        names.sort();
        for name in names {
            let aggr = &array.aggregates[name];
            let mut flexvols: Vec<String> = array
                .flexvols
                .values()
                .filter(|f| &f.aggregate == name)
                .map(|f| f.name.clone())
                .collect();
            flexvols.sort();
            let datastores: Vec<String> = layout
                .datastores
                .iter()
                .filter(|d| d.aggregate.as_deref() == Some(name.as_str()))
                .map(|d| d.datastore.name.clone())
                .collect();
            layout.aggregates.push(JoinedAggregate {
                name: name.clone(),
                capacity_bytes: aggr.capacity_bytes,
                used_bytes: aggr.used_bytes,
                usage_percent: aggr.usage_percent,
                backend: mapper.map(name),
                flexvols,
                datastores,
            });
        }
    }

    layout
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        AttachStatus, HardwareDevice, PowerState, Property, Runtime, VolumeStatus, GIB,
    };

    fn volume(id: Uuid, status: VolumeStatus, attached_to: Option<Uuid>) -> Volume {
        Volume {
            id,
            project: "p".to_string(),
            status,
            attach_status: if attached_to.is_some() {
                AttachStatus::Attached
            } else {
                AttachStatus::Detached
            },
            size_bytes: GIB,
            host: None,
            availability_zone: None,
            attachments: attached_to
                .map(|i| {
                    vec![VolumeAttachment {
                        id: Uuid::new_v4(),
                        volume_id: id,
                        instance_id: Some(i),
                        device_name: None,
                        attach_status: Some(AttachStatus::Attached),
                    }]
                })
                .unwrap_or_default(),
            updated_at: None,
        }
    }

    fn instance_vm(instance: Uuid, disks: Vec<VirtualDisk>) -> VmObject {
        let mut vm = VmObject::new("vm-10");
        vm.config_name = Property::Present(format!("web ({})", instance));
        vm.instance_uuid = Property::Present(instance);
        vm.memory_mb = Property::Present(4096);
        vm.runtime = Property::Present(Runtime {
            power_state: PowerState::PoweredOn,
            host: Some("host-1".to_string()),
        });
        vm.hardware_devices =
            Property::Present(disks.into_iter().map(HardwareDevice::Disk).collect());
        vm
    }

    fn disk(key: i32, filename: String, backing: Option<Uuid>) -> VirtualDisk {
        VirtualDisk {
            key,
            backing_filename: filename,
            backing_uuid: backing,
            capacity_bytes: GIB,
            datastore: None,
        }
    }

    #[test]
    fn test_root_disk_is_skipped() {
        let instance = Uuid::new_v4();
        let storage = StorageSnapshot::default();
        let vm = instance_vm(instance, vec![]);
        let d = disk(2000, format!("[eph] {0}/{0}.vmdk", instance), Some(Uuid::new_v4()));
        let mut anomalies = Vec::new();
        let mut manual = Vec::new();
        let resolved = resolve_disk(&vm, &instance, &d, &storage, &mut anomalies, &mut manual);
        assert_eq!(resolved.identity, DiskIdentity::Root);
        assert!(anomalies.is_empty());
    }

    #[test]
    fn test_extra_config_preferred() {
        let instance = Uuid::new_v4();
        let vol = Uuid::new_v4();
        let backing = Uuid::new_v4();
        let mut storage = StorageSnapshot::default();
        storage
            .volumes
            .insert(vol, volume(vol, VolumeStatus::InUse, Some(instance)));
        let mut vm = instance_vm(instance, vec![]);
        let mut extra = BTreeMap::new();
        extra.insert(format!("volume-{}", vol), backing.to_string());
        vm.extra_config = Property::Present(extra);
        let d = disk(2001, "[ds] x/x.vmdk".to_string(), Some(backing));
        let mut anomalies = Vec::new();
        let mut manual = Vec::new();
        let resolved = resolve_disk(&vm, &instance, &d, &storage, &mut anomalies, &mut manual);
        assert_eq!(
            resolved.identity,
            DiskIdentity::Volume {
                id: vol,
                source: IdSource::ExtraConfig
            }
        );
        assert!(!resolved.ghost);
    }

    #[test]
    fn test_backing_filename_conflict_is_anomaly() {
        let instance = Uuid::new_v4();
        let u1 = Uuid::new_v4();
        let u2 = Uuid::new_v4();
        let mut storage = StorageSnapshot::default();
        storage.volumes.insert(u1, volume(u1, VolumeStatus::Available, None));
        storage.volumes.insert(u2, volume(u2, VolumeStatus::Available, None));
        let vm = instance_vm(instance, vec![]);
        let d = disk(2001, format!("[ds] {0}/{0}.vmdk", u2), Some(u1));
        let mut anomalies = Vec::new();
        let mut manual = Vec::new();
        resolve_disk(&vm, &instance, &d, &storage, &mut anomalies, &mut manual);
        assert_eq!(anomalies.len(), 1);
    }

    #[test]
    fn test_filename_conflict_checked_with_extra_config_match() {
        let instance = Uuid::new_v4();
        let u1 = Uuid::new_v4();
        let u2 = Uuid::new_v4();
        let mut storage = StorageSnapshot::default();
        storage.volumes.insert(u1, volume(u1, VolumeStatus::InUse, Some(instance)));
        storage.volumes.insert(u2, volume(u2, VolumeStatus::Available, None));
        let mut vm = instance_vm(instance, vec![]);
        let mut extra = BTreeMap::new();
        extra.insert(format!("volume-{}", u1), u1.to_string());
        vm.extra_config = Property::Present(extra);
        let d = disk(2001, format!("[vvol_bb01] {0}/{0}.vmdk", u2), Some(u1));
        let mut anomalies = Vec::new();
        let mut manual = Vec::new();
        let resolved = resolve_disk(&vm, &instance, &d, &storage, &mut anomalies, &mut manual);
        assert_eq!(
            resolved.identity,
            DiskIdentity::Volume {
                id: u1,
                source: IdSource::ExtraConfig
            }
        );
        assert_eq!(anomalies.len(), 1);
        assert!(anomalies[0].reason.contains("two live volumes"));
    }

    #[test]
    fn test_unresolvable_disk_is_anomaly() {
        let instance = Uuid::new_v4();
        let storage = StorageSnapshot::default();
        let vm = instance_vm(instance, vec![]);
        let d = disk(2001, "[ds] data/data.vmdk".to_string(), None);
        let mut anomalies = Vec::new();
        let mut manual = Vec::new();
        let resolved = resolve_disk(&vm, &instance, &d, &storage, &mut anomalies, &mut manual);
        assert_eq!(resolved.identity, DiskIdentity::Unresolved);
        assert_eq!(anomalies.len(), 1);
    }

    #[test]
    fn test_join_three_views() {
        let instance = Uuid::new_v4();
        let vol = Uuid::new_v4();
        let mut storage = StorageSnapshot::default();
        storage
            .volumes
            .insert(vol, volume(vol, VolumeStatus::InUse, Some(instance)));
        let mut compute = ComputeSnapshot::default();
        compute.instances.insert(
            instance,
            Instance {
                id: instance,
                project: "p".to_string(),
                display_name: "web".to_string(),
                availability_zone: None,
                host: Some("nova-compute-bb01".to_string()),
                status: "ACTIVE".to_string(),
                block_devices: vec![BlockDeviceMapping {
                    id: 1,
                    instance_id: instance,
                    volume_id: vol,
                    attachment_id: None,
                    device_name: None,
                }],
                port_ids: Default::default(),
            },
        );
        let mut vmgr = VmgrSnapshot::default();
        let vm = instance_vm(
            instance,
            vec![disk(2001, format!("[ds] {0}/{0}.vmdk", vol), Some(vol))],
        );
        vmgr.vms.insert(vm.moid.clone(), vm);

        let joined = join_attachments(&compute, &storage, Some(&vmgr));
        let jv = &joined.volumes[&vol];
        assert_eq!(jv.attachments_cp_storage(), jv.attachments_cp_compute());
        assert_eq!(jv.attachments_cp_storage(), jv.attachments_vmgr());
        assert!(joined.anomalies.is_empty());
    }

    #[test]
    fn test_shard_anomaly() {
        let mut compute = ComputeSnapshot::default();
        let id = Uuid::new_v4();
        compute.instances.insert(
            id,
            Instance {
                id,
                project: "p".to_string(),
                display_name: "x".to_string(),
                availability_zone: None,
                host: Some("nova-compute-bb02".to_string()),
                status: "ACTIVE".to_string(),
                block_devices: vec![],
                port_ids: Default::default(),
            },
        );
        assert_eq!(shard_anomalies(&compute, "vc-").len(), 1);
        compute.host_aggregates.insert(
            "nova-compute-bb02".to_string(),
            ["vc-a-0".to_string()].into_iter().collect(),
        );
        assert!(shard_anomalies(&compute, "vc-").is_empty());
    }
}
