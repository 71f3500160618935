//! Volume state classification: dwell time, status/usage agreement and the
//! shadow-VM size identity.

use crate::fault::{EntityKey, Fault, FaultKind};
use crate::ident::{self, LunPath};
use crate::join::Joined;
use crate::model::{AttachStatus, Volume, VolumeStatus, GIB};
use crate::repair::RepairAction;
use crate::snapshot::ArraySnapshot;
use crate::tables::{storage, RowKey};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use uuid::Uuid;

/// Snapshot reserve of flexvols provisioned before the reserve became
/// configurable.
pub const LEGACY_SNAPSHOT_RESERVE_PERCENT: f64 = 5.0;

#[derive(Debug, Clone)]
pub struct StateRules {
    pub dwell: Duration,
    pub snapshot_reserve_percent: f64,
}

impl Default for StateRules {
    fn default() -> Self {
        Self {
            dwell: Duration::hours(1),
            snapshot_reserve_percent: 0.0,
        }
    }
}

/// Terminal repair for a volume stuck in `phase`.
fn stuck_repair(volume: &Volume) -> Vec<RepairAction> {
    match volume.status {
        VolumeStatus::Deleting => vec![RepairAction::SoftDelete {
            table: storage::VOLUMES,
            key: RowKey::new(volume.id),
        }],
        VolumeStatus::Creating => vec![RepairAction::SetVolumeStatus {
            volume: volume.id,
            status: VolumeStatus::Error,
            attach_status: AttachStatus::Detached,
        }],
        _ => vec![RepairAction::SetVolumeStatus {
            volume: volume.id,
            status: VolumeStatus::Available,
            attach_status: AttachStatus::Detached,
        }],
    }
}

/// Storage size implied by a LUN of `capacity` on a flexvol with snapshot
/// reserve `reserve` percent, or `None` when the reserve is neither the
/// configured nor the legacy value.
pub fn expected_volume_size(capacity: u64, reserve: f64, configured: f64) -> Option<u64> {
    if (reserve - configured).abs() < f64::EPSILON {
        Some((capacity as f64 * (1.0 - reserve / 100.0)).round() as u64)
    } else if (reserve - LEGACY_SNAPSHOT_RESERVE_PERCENT).abs() < f64::EPSILON {
        Some(capacity)
    } else {
        None
    }
}

fn lun_index(array: &ArraySnapshot) -> HashMap<Uuid, (u64, String)> {
    array
        .luns
        .iter()
        .filter_map(|lun| match ident::parse_lun_path(&lun.path)? {
            LunPath::Vvol { flexvol, uuid } => Some((uuid, (lun.capacity_bytes, flexvol))),
            LunPath::Vmfs { .. } => None,
        })
        .collect()
}

pub fn classify(
    joined: &Joined<'_>,
    array: Option<&ArraySnapshot>,
    now: DateTime<Utc>,
    rules: &StateRules,
) -> Vec<Fault> {
    let luns = array.map(lun_index).unwrap_or_default();
    let mut faults = Vec::new();

    for jv in joined.volumes.values() {
        let Some(volume) = jv.volume else {
            continue;
        };
        let entity = EntityKey::volume(&volume.id);
        let live_rows = volume.attachments.len();
        let attached_anywhere = jv.attached_anywhere_except(None);

        if volume.status.is_transient() {
            if let Some(updated) = volume.updated_at {
                let dwell = now.signed_duration_since(updated);
                if dwell > rules.dwell {
                    let kind = FaultKind::S1Stuck(volume.status);
                    let reason = format!(
                        "volume {} has been {} for {} minutes",
                        volume.id,
                        volume.status,
                        dwell.num_minutes()
                    );
                    let fault = if joined.vmgr_available && !attached_anywhere {
                        let actions = stuck_repair(volume);
                        let lock = volume.status != VolumeStatus::Deleting;
                        let fault = Fault::repair(kind, entity, reason, actions);
                        if lock {
                            fault.with_lock(volume.id)
                        } else {
                            fault
                        }
                    } else {
                        Fault::report(kind, entity, reason)
                    };
                    faults.push(fault);
                    continue;
                }
            }
        }

        if volume.status == VolumeStatus::InUse && live_rows == 0 {
            let reason = format!("volume {} is in-use without attachments", volume.id);
            let fault = if joined.vmgr_available && !attached_anywhere {
                Fault::repair(
                    FaultKind::S2StateUsageMismatch,
                    entity,
                    reason,
                    vec![RepairAction::SetVolumeStatus {
                        volume: volume.id,
                        status: VolumeStatus::Available,
                        attach_status: AttachStatus::Detached,
                    }],
                )
                .with_lock(volume.id)
            } else {
                Fault::report(FaultKind::S2StateUsageMismatch, entity, reason)
            };
            faults.push(fault);
            continue;
        }
        // Rows compute does not back are the attachment rules' to remove.
        let confirmed_rows = jv
            .attachments
            .values()
            .filter(|a| a.storage.is_some() && a.compute.is_some())
            .count();
        if volume.status == VolumeStatus::Available && confirmed_rows > 0 {
            let reason = format!(
                "volume {} is available with {} attachments",
                volume.id, confirmed_rows
            );
            let fault = if joined.vmgr_available {
                Fault::repair(
                    FaultKind::S2StateUsageMismatch,
                    entity,
                    reason,
                    vec![RepairAction::SetVolumeStatus {
                        volume: volume.id,
                        status: VolumeStatus::InUse,
                        attach_status: AttachStatus::Attached,
                    }],
                )
                .with_lock(volume.id)
            } else {
                Fault::report(FaultKind::S2StateUsageMismatch, entity, reason)
            };
            faults.push(fault);
            continue;
        }

        if jv.shadow.is_none() {
            continue;
        }
        let Some((capacity, flexvol)) = luns.get(&volume.id) else {
            continue;
        };
        let Some(reserve) = array
            .and_then(|a| a.flexvols.get(flexvol))
            .map(|f| f.snapshot_reserve_percent)
        else {
            continue;
        };
        if let Some(expected) =
            expected_volume_size(*capacity, reserve, rules.snapshot_reserve_percent)
        {
            if expected / GIB != volume.size_bytes / GIB {
                faults.push(Fault::report(
                    FaultKind::S3SizeMismatch,
                    entity,
                    format!(
                        "volume {} is {} GiB in storage, its LUN implies {} GiB",
                        volume.id,
                        volume.size_bytes / GIB,
                        expected / GIB
                    ),
                ));
            }
        }
    }

    faults
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::join::join_attachments;
    use crate::model::{BlockDeviceMapping, Instance, VolumeAttachment};
    use crate::snapshot::{ComputeSnapshot, StorageSnapshot, VmgrSnapshot};

    fn volume(status: VolumeStatus, updated_minutes_ago: i64, now: DateTime<Utc>) -> Volume {
        Volume {
            id: Uuid::new_v4(),
            project: "p".to_string(),
            status,
            attach_status: AttachStatus::Detached,
            size_bytes: 10 * GIB,
            host: None,
            availability_zone: None,
            attachments: vec![],
            updated_at: Some(now - Duration::minutes(updated_minutes_ago)),
        }
    }

    fn run(volumes: Vec<Volume>, vmgr: bool, now: DateTime<Utc>) -> Vec<Fault> {
        let mut storage = StorageSnapshot::default();
        for v in volumes {
            storage.volumes.insert(v.id, v);
        }
        let compute = ComputeSnapshot::default();
        let vmgr_snap = VmgrSnapshot::default();
        let joined = join_attachments(&compute, &storage, vmgr.then_some(&vmgr_snap));
        classify(&joined, None, now, &StateRules::default())
    }

    #[test]
    fn test_stuck_deleting_soft_deletes() {
        let now = Utc::now();
        let faults = run(vec![volume(VolumeStatus::Deleting, 120, now)], true, now);
        assert_eq!(faults.len(), 1);
        assert_eq!(faults[0].kind.name(), "S1_STUCK_DELETING");
        assert!(matches!(faults[0].actions[0], RepairAction::SoftDelete { .. }));
        assert_eq!(faults[0].lock, None);
    }

    #[test]
    fn test_recent_transient_state_is_fine() {
        let now = Utc::now();
        assert!(run(vec![volume(VolumeStatus::Attaching, 5, now)], true, now).is_empty());
    }

    #[test]
    fn test_stuck_without_vmgr_is_report_only() {
        let now = Utc::now();
        let faults = run(vec![volume(VolumeStatus::Detaching, 300, now)], false, now);
        assert!(!faults[0].is_repairable());
    }

    fn available_with_row(now: DateTime<Utc>, mapped: bool) -> (StorageSnapshot, ComputeSnapshot) {
        let instance = Uuid::new_v4();
        let mut v = volume(VolumeStatus::Available, 0, now);
        v.attachments.push(VolumeAttachment {
            id: Uuid::new_v4(),
            volume_id: v.id,
            instance_id: Some(instance),
            device_name: None,
            attach_status: Some(AttachStatus::Attached),
        });
        let mut compute = ComputeSnapshot::default();
        if mapped {
            compute.instances.insert(
                instance,
                Instance {
                    id: instance,
                    project: "p".to_string(),
                    display_name: "web".to_string(),
                    availability_zone: None,
                    host: None,
                    status: "ACTIVE".to_string(),
                    block_devices: vec![BlockDeviceMapping {
                        id: 1,
                        instance_id: instance,
                        volume_id: v.id,
                        attachment_id: None,
                        device_name: None,
                    }],
                    port_ids: Default::default(),
                },
            );
        }
        let mut storage = StorageSnapshot::default();
        storage.volumes.insert(v.id, v);
        (storage, compute)
    }

    #[test]
    fn test_available_with_attachment() {
        let now = Utc::now();
        let (storage, compute) = available_with_row(now, true);
        let vmgr_snap = VmgrSnapshot::default();
        let joined = join_attachments(&compute, &storage, Some(&vmgr_snap));
        let faults = classify(&joined, None, now, &StateRules::default());
        assert_eq!(faults[0].kind, FaultKind::S2StateUsageMismatch);
        assert!(matches!(
            faults[0].actions[0],
            RepairAction::SetVolumeStatus {
                status: VolumeStatus::InUse,
                ..
            }
        ));
    }

    #[test]
    fn test_available_with_stale_row_left_to_attachment_rules() {
        let now = Utc::now();
        let (storage, compute) = available_with_row(now, false);
        let vmgr_snap = VmgrSnapshot::default();
        let joined = join_attachments(&compute, &storage, Some(&vmgr_snap));
        assert!(classify(&joined, None, now, &StateRules::default()).is_empty());
    }

    #[test]
    fn test_available_with_attachment_without_vmgr_is_report_only() {
        let now = Utc::now();
        let (storage, compute) = available_with_row(now, true);
        let joined = join_attachments(&compute, &storage, None);
        let faults = classify(&joined, None, now, &StateRules::default());
        assert_eq!(faults[0].kind, FaultKind::S2StateUsageMismatch);
        assert!(!faults[0].is_repairable());
    }

    #[test]
    fn test_in_use_without_attachment() {
        let now = Utc::now();
        let faults = run(vec![volume(VolumeStatus::InUse, 0, now)], true, now);
        assert_eq!(faults[0].kind, FaultKind::S2StateUsageMismatch);
        assert!(faults[0].is_repairable());
    }

    #[test]
    fn test_expected_volume_size() {
        assert_eq!(expected_volume_size(100, 0.0, 0.0), Some(100));
        assert_eq!(expected_volume_size(100, 20.0, 20.0), Some(80));
        assert_eq!(expected_volume_size(100, 5.0, 20.0), Some(100));
        assert_eq!(expected_volume_size(100, 7.0, 20.0), None);
    }
}
