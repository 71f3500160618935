//! Virtualization-manager classification: ghost devices, unknown templates,
//! shadow placement, orphaned VM folders and the former-instance cleanup.

use crate::fault::{EntityKey, Fault, FaultKind};
use crate::ident::{self, RENAMED_SUFFIX};
use crate::join::Joined;
use crate::model::{DatastoreKind, PowerState, VmObject};
use crate::repair::RepairAction;
use crate::snapshot::{CatalogSnapshot, ComputeSnapshot, StorageSnapshot, VmgrSnapshot};
use regex::Regex;
use std::collections::BTreeSet;
use uuid::Uuid;

#[derive(Debug, Clone, Default)]
pub struct VmgrRules {
    /// Datastore names that hold ephemeral instance storage.
    pub ephemeral_datastores: Option<Regex>,
}

/// `(datastore, top-level folder)` pairs some registered VM lives in.
fn owned_folders(vmgr: &VmgrSnapshot) -> BTreeSet<(String, String)> {
    let mut owned = BTreeSet::new();
    let mut add = |path: &str| {
        if let Some((ds, rel)) = ident::split_datastore_path(path) {
            if let Some(folder) = rel.split('/').next() {
                owned.insert((ds.to_string(), folder.to_string()));
            }
        }
    };
    for vm in vmgr.vms.values() {
        if let Some(path) = vm.vm_path_name.get() {
            add(path);
        }
        for disk in vm.disks() {
            add(&disk.backing_filename);
        }
    }
    owned
}

fn former_instance_fault(vm: &VmObject, instance: &Uuid) -> Option<Fault> {
    let entity = EntityKey::vm(&vm.moid);
    let (kind, action, what) = match vm.power_state()? {
        PowerState::PoweredOn => (
            FaultKind::VFormerInstancePoweredOn,
            RepairAction::SuspendVm {
                vm: vm.moid.clone(),
            },
            "powered on",
        ),
        PowerState::Suspended => (
            FaultKind::VFormerInstanceSuspended,
            RepairAction::PowerOffVm {
                vm: vm.moid.clone(),
            },
            "suspended",
        ),
        PowerState::PoweredOff => (
            FaultKind::VFormerInstancePoweredOff,
            RepairAction::UnregisterVm {
                vm: vm.moid.clone(),
            },
            "powered off",
        ),
    };
    Some(
        Fault::repair(
            kind,
            entity,
            format!(
                "vm {} of instance {} unknown to compute is {}",
                vm.moid, instance, what
            ),
            vec![action],
        )
        .with_related(instance),
    )
}

pub fn classify(
    joined: &Joined<'_>,
    compute: &ComputeSnapshot,
    storage: &StorageSnapshot,
    vmgr: &VmgrSnapshot,
    catalog: Option<&CatalogSnapshot>,
    rules: &VmgrRules,
) -> Vec<Fault> {
    let mut faults = Vec::new();

    let mut moids: Vec<&String> = vmgr.vms.keys().collect();
    moids.sort();
    for moid in moids {
        let vm = &vmgr.vms[moid];
        if vm.is_shadow() {
            let on_ephemeral = rules.ephemeral_datastores.as_ref().and_then(|re| {
                vm.disks()
                    .filter_map(|d| ident::split_datastore_path(&d.backing_filename))
                    .find(|(ds, _)| re.is_match(ds))
                    .map(|(ds, _)| ds.to_string())
            });
            if let Some(ds) = on_ephemeral {
                faults.push(Fault::report(
                    FaultKind::VShadowOnEphemeral,
                    EntityKey::vm(&vm.moid),
                    format!("shadow vm {} keeps its volume on ephemeral datastore {}", vm.moid, ds),
                ));
            }
            continue;
        }

        if vm.is_template() {
            let Some(catalog) = catalog else {
                continue;
            };
            let image = vm
                .config_name
                .get()
                .and_then(|n| ident::uuid_in_filename(n));
            if let Some(image) = image {
                if !catalog.image_ids.contains(&image) {
                    faults.push(Fault::report(
                        FaultKind::VUnknownTemplate,
                        EntityKey::vm(&vm.moid),
                        format!("template {} refers to unknown image {}", vm.moid, image),
                    ));
                }
            }
            continue;
        }

        let Some(instance) = vm.instance_uuid.get() else {
            continue;
        };
        if !compute.instances.contains_key(instance) && vm.has_annotation() {
            if let Some(fault) = former_instance_fault(vm, instance) {
                faults.push(fault);
            }
        }
    }

    for ji in joined.instances.values() {
        for resolved in ji.disks.iter().filter(|d| d.ghost) {
            faults.push(Fault::repair(
                FaultKind::VGhostDisk,
                EntityKey::vm_device(&ji.vm.moid, resolved.disk.key),
                format!(
                    "vm {} has disk {} of a volume storage does not know",
                    ji.vm.moid, resolved.disk.backing_filename
                ),
                vec![RepairAction::DetachDisk {
                    vm: ji.vm.moid.clone(),
                    disk_key: resolved.disk.key,
                    volume: None,
                }],
            ));
        }

        let Some(instance) = ji.instance else {
            continue;
        };
        if instance.port_ids.is_empty() {
            continue;
        }
        for nic in ji.vm.nics() {
            let Some(port) = nic.port_id else {
                continue;
            };
            if !instance.port_ids.contains(&port) {
                faults.push(
                    Fault::repair(
                        FaultKind::VGhostNic,
                        EntityKey::vm_device(&ji.vm.moid, nic.key),
                        format!(
                            "vm {} has nic {} for port {} unknown to instance {}",
                            ji.vm.moid, nic.mac_address, port, instance.id
                        ),
                        vec![RepairAction::DetachNic {
                            vm: ji.vm.moid.clone(),
                            nic_key: nic.key,
                        }],
                    )
                    .with_related(port),
                );
            }
        }
    }

    let owned = owned_folders(vmgr);
    for (ds_name, listing) in &vmgr.listings {
        if vmgr.no_access.contains(ds_name) {
            continue;
        }
        let is_vvol = vmgr
            .datastore_by_name(ds_name)
            .map(|d| d.kind == DatastoreKind::Vvol)
            .unwrap_or(false);
        for folder in listing {
            if folder.folder.contains('/') {
                continue;
            }
            let entity = EntityKey::datastore_path(ds_name, &folder.folder);
            let is_owned = owned.contains(&(ds_name.clone(), folder.folder.clone()));

            if is_vvol && folder.files.is_empty() && !is_owned {
                faults.push(Fault::report(
                    FaultKind::VEmptyVvolFolder,
                    entity,
                    format!("empty folder {} on vvol datastore {}", folder.folder, ds_name),
                ));
                continue;
            }
            if is_owned {
                continue;
            }

            if let Some(stem) = folder.folder.strip_suffix(RENAMED_SUFFIX) {
                if ident::is_uuid_shaped(stem) {
                    faults.push(Fault::repair(
                        FaultKind::VOrphanVmxRenamed,
                        entity,
                        format!("renamed orphan folder {} on {} is still unowned", folder.folder, ds_name),
                        vec![RepairAction::DeleteDatastorePath {
                            datastore: ds_name.clone(),
                            path: folder.folder.clone(),
                        }],
                    ));
                }
                continue;
            }

            if !ident::is_uuid_shaped(&folder.folder)
                || !folder.files.iter().any(|f| f.ends_with(".vmx"))
            {
                continue;
            }
            let id = Uuid::parse_str(folder.folder.split('.').next().unwrap_or_default()).ok();
            let still_referenced = id
                .map(|id| compute.instances.contains_key(&id) || storage.volumes.contains_key(&id))
                .unwrap_or(false);
            let reason = format!("folder {} on {} has a vmx but no registered vm", folder.folder, ds_name);
            if still_referenced {
                faults.push(Fault::report(FaultKind::VOrphanVmx, entity, reason));
                continue;
            }
            faults.push(Fault::repair(
                FaultKind::VOrphanVmx,
                entity,
                reason,
                vec![RepairAction::MoveDatastorePath {
                    datastore: ds_name.clone(),
                    from: folder.folder.clone(),
                    to: format!("{}{}", folder.folder, RENAMED_SUFFIX),
                }],
            ));
        }
    }

    faults
}
