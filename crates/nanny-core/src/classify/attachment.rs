//! Attachment-triangle classification (A1..A7).

use crate::fault::{EntityKey, Fault, FaultKind};
use crate::join::{DiskIdentity, Joined, JoinedAttachment, JoinedVolume};
use crate::model::{AttachStatus, Volume, VolumeStatus};
use crate::repair::{NewAttachment, RepairAction};
use crate::snapshot::{ComputeSnapshot, StorageSnapshot};
use crate::tables::{compute, storage, RowKey};
use std::collections::HashSet;
use uuid::Uuid;

fn is_attached_state(volume: &Volume) -> bool {
    volume.status == VolumeStatus::InUse || volume.attach_status == AttachStatus::Attached
}

/// Allocate an attachment id that collides with no existing row, live or
/// soft-deleted, nor with an id already handed out this cycle.
pub fn fresh_attachment_id(existing: &HashSet<Uuid>, issued: &mut HashSet<Uuid>) -> Uuid {
    loop {
        let id = Uuid::new_v4();
        if !existing.contains(&id) && issued.insert(id) {
            return id;
        }
    }
}

pub fn classify(
    joined: &Joined<'_>,
    compute_snap: &ComputeSnapshot,
    storage_snap: &StorageSnapshot,
) -> Vec<Fault> {
    let mut faults = Vec::new();
    let mut issued = HashSet::new();

    for jv in joined.volumes.values() {
        for ja in jv.attachments.values() {
            if let Some(fault) = classify_pair(
                joined,
                jv,
                ja,
                compute_snap,
                storage_snap,
                &mut issued,
            ) {
                faults.push(fault);
            }
        }
    }

    for ji in joined.instances.values() {
        if !ji.vm.extra_config.is_present() {
            continue;
        }
        let recorded: HashSet<Uuid> = ji.vm.extra_config_volumes().into_keys().collect();
        let backed: HashSet<Uuid> = ji
            .disks
            .iter()
            .filter_map(|d| match d.identity {
                DiskIdentity::Volume { id, .. } => Some(id),
                _ => None,
            })
            .filter(|id| {
                storage_snap.volumes.contains_key(id) || storage_snap.deleted_volume_ids.contains(id)
            })
            .collect();
        if recorded != backed {
            let mut missing: Vec<String> = recorded
                .symmetric_difference(&backed)
                .map(|u| u.to_string())
                .collect();
            missing.sort();
            faults.push(
                Fault::report(
                    FaultKind::A5ExtraConfigDiskMismatch,
                    EntityKey::instance(&ji.id),
                    format!(
                        "extra-config volumes and disks of vm {} differ in {}",
                        ji.vm.moid,
                        missing.join(", ")
                    ),
                )
                .with_related(&ji.vm.moid),
            );
        }
    }

    faults
}

fn classify_pair(
    joined: &Joined<'_>,
    jv: &JoinedVolume<'_>,
    ja: &JoinedAttachment<'_>,
    compute_snap: &ComputeSnapshot,
    storage_snap: &StorageSnapshot,
    issued: &mut HashSet<Uuid>,
) -> Option<Fault> {
    let v = ja.volume_id;
    let i = ja.instance_id;
    let entity = EntityKey::attachment(&v, &i);
    let vm_known = joined.vm_for(&i).is_some();
    let vmgr_has_disk = ja.vmgr.is_some();

    match (ja.storage, ja.compute) {
        (Some(row), None) => {
            let volume = jv.volume?;
            let instance_known = compute_snap.instances.contains_key(&i);
            if !instance_known && !is_attached_state(volume) {
                return Some(
                    Fault::repair(
                        FaultKind::A6OrphanAttachmentRow,
                        entity,
                        format!("attachment row {} references unknown instance {}", row.id, i),
                        vec![RepairAction::SoftDelete {
                            table: storage::VOLUME_ATTACHMENT,
                            key: RowKey::new(row.id),
                        }],
                    )
                    .with_related(v)
                    .with_related(i),
                );
            }
            let reason = format!("storage attaches volume {} to {}, compute does not", v, i);
            if !joined.vmgr_available || vmgr_has_disk {
                return Some(
                    Fault::report(FaultKind::A1StorageAttachedComputeMissing, entity, reason)
                        .with_related(v)
                        .with_related(i),
                );
            }
            let mut actions = vec![RepairAction::SoftDelete {
                table: storage::VOLUME_ATTACHMENT,
                key: RowKey::new(row.id),
            }];
            if !jv.attached_anywhere_except(Some(&i)) {
                actions.push(RepairAction::SetVolumeStatus {
                    volume: v,
                    status: VolumeStatus::Available,
                    attach_status: AttachStatus::Detached,
                });
            }
            Some(
                Fault::repair(FaultKind::A1StorageAttachedComputeMissing, entity, reason, actions)
                    .with_lock(v)
                    .with_related(v)
                    .with_related(i),
            )
        }
        (None, Some(mapping)) => {
            if joined.vmgr_available && vmgr_has_disk {
                let Some(volume) = jv.volume else {
                    return Some(Fault::report(
                        FaultKind::A2ComputeAttachedStorageMissing,
                        entity,
                        format!("compute and vmgr attach {} to {} but storage has no such volume", v, i),
                    ));
                };
                let reusable = mapping
                    .attachment_id
                    .filter(|id| !storage_snap.all_attachment_ids.contains(id) && issued.insert(*id));
                let mut actions = Vec::new();
                let attachment_id = match reusable {
                    Some(id) => id,
                    None => {
                        let id = fresh_attachment_id(&storage_snap.all_attachment_ids, issued);
                        actions.push(RepairAction::SetMappingAttachmentId {
                            mapping_id: mapping.id,
                            attachment_id: id,
                        });
                        id
                    }
                };
                let instance_host = compute_snap.instances.get(&i).and_then(|x| x.host.clone());
                actions.push(RepairAction::InsertAttachment(NewAttachment {
                    id: attachment_id,
                    volume_id: v,
                    instance_id: i,
                    device_name: mapping.device_name.clone(),
                    attached_host: instance_host,
                }));
                if !is_attached_state(volume) {
                    actions.push(RepairAction::SetVolumeStatus {
                        volume: v,
                        status: VolumeStatus::InUse,
                        attach_status: AttachStatus::Attached,
                    });
                }
                return Some(
                    Fault::repair(
                        FaultKind::A7ComputeVmgrAttachedStorageMissing,
                        entity,
                        format!("compute and vmgr attach {} to {}, storage does not", v, i),
                        actions,
                    )
                    .with_lock(v)
                    .with_related(v)
                    .with_related(i),
                );
            }
            let reason = format!("compute attaches volume {} to {}, storage does not", v, i);
            if joined.vmgr_available && vm_known {
                return Some(
                    Fault::repair(
                        FaultKind::A2ComputeAttachedStorageMissing,
                        entity,
                        reason,
                        vec![RepairAction::SoftDelete {
                            table: compute::BLOCK_DEVICE_MAPPING,
                            key: RowKey::new(mapping.id),
                        }],
                    )
                    .with_related(v)
                    .with_related(i),
                );
            }
            Some(
                Fault::report(FaultKind::A2ComputeAttachedStorageMissing, entity, reason)
                    .with_related(v)
                    .with_related(i),
            )
        }
        (Some(_), Some(_)) => {
            if joined.vmgr_available && vm_known && !vmgr_has_disk {
                return Some(
                    Fault::report(
                        FaultKind::A4BothAttachedVmgrMissing,
                        entity,
                        format!("both control planes attach {} to {}, vmgr shows no disk", v, i),
                    )
                    .with_related(v)
                    .with_related(i),
                );
            }
            None
        }
        (None, None) => {
            let disk = ja.vmgr?;
            if jv.volume.is_none() {
                return None;
            }
            let vm = joined.vm_for(&i)?;
            if !vm.is_powered_on() {
                return None;
            }
            Some(
                Fault::repair(
                    FaultKind::A3VmgrAttachedBothMissing,
                    entity,
                    format!(
                        "vm {} runs with disk of volume {} that no control plane attaches",
                        vm.moid, v
                    ),
                    vec![RepairAction::DetachDisk {
                        vm: vm.moid.clone(),
                        disk_key: disk.key,
                        volume: Some(v),
                    }],
                )
                .with_related(v)
                .with_related(i)
                .with_related(&vm.moid),
            )
        }
    }
}
