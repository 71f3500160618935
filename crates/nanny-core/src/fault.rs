//! The closed fault taxonomy.

use crate::model::{InstanceId, Moid, VolumeId, VolumeStatus};
use crate::repair::RepairAction;
use crate::tables::{RowKey, TableSpec};
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FaultCategory {
    Attachment,
    State,
    Integrity,
    Vmgr,
    /// Balancer proposals routed through the same cap as repairs.
    Balance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Repair,
    Report,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FaultKind {
    A1StorageAttachedComputeMissing,
    A2ComputeAttachedStorageMissing,
    A3VmgrAttachedBothMissing,
    A4BothAttachedVmgrMissing,
    A5ExtraConfigDiskMismatch,
    A6OrphanAttachmentRow,
    A7ComputeVmgrAttachedStorageMissing,
    /// Volume stuck in one of the transient phases.
    S1Stuck(VolumeStatus),
    S2StateUsageMismatch,
    S3SizeMismatch,
    /// Live child row of the named table referencing a deleted parent.
    IOrphaned(&'static str),
    IMissingDeletedAt,
    IServiceDeletedButReferenced,
    VEmptyVvolFolder,
    VGhostDisk,
    VGhostNic,
    VUnknownTemplate,
    VShadowOnEphemeral,
    VOrphanVmx,
    VOrphanVmxRenamed,
    VFormerInstancePoweredOn,
    VFormerInstanceSuspended,
    VFormerInstancePoweredOff,
    StorageBalanceMove,
    BigVmMigration,
    BigVmShares,
    BigVmDrs,
}

impl FaultKind {
    pub fn category(&self) -> FaultCategory {
        use FaultKind::*;
        match self {
            A1StorageAttachedComputeMissing
            | A2ComputeAttachedStorageMissing
            | A3VmgrAttachedBothMissing
            | A4BothAttachedVmgrMissing
            | A5ExtraConfigDiskMismatch
            | A6OrphanAttachmentRow
            | A7ComputeVmgrAttachedStorageMissing => FaultCategory::Attachment,
            S1Stuck(_) | S2StateUsageMismatch | S3SizeMismatch => FaultCategory::State,
            IOrphaned(_) | IMissingDeletedAt | IServiceDeletedButReferenced => {
                FaultCategory::Integrity
            }
            VEmptyVvolFolder
            | VGhostDisk
            | VGhostNic
            | VUnknownTemplate
            | VShadowOnEphemeral
            | VOrphanVmx
            | VOrphanVmxRenamed
            | VFormerInstancePoweredOn
            | VFormerInstanceSuspended
            | VFormerInstancePoweredOff => FaultCategory::Vmgr,
            StorageBalanceMove | BigVmMigration | BigVmShares | BigVmDrs => FaultCategory::Balance,
        }
    }

    /// Stable name used in logs, metric labels and `fix_limits` keys.
    pub fn name(&self) -> String {
        use FaultKind::*;
        let fixed = match self {
            A1StorageAttachedComputeMissing => "A1_STORAGE_ATTACHED_COMPUTE_MISSING",
            A2ComputeAttachedStorageMissing => "A2_COMPUTE_ATTACHED_STORAGE_MISSING",
            A3VmgrAttachedBothMissing => "A3_VMGR_ATTACHED_BOTH_MISSING",
            A4BothAttachedVmgrMissing => "A4_BOTH_CPs_ATTACHED_VMGR_MISSING",
            A5ExtraConfigDiskMismatch => "A5_EXTRACONFIG_DISK_MISMATCH",
            A6OrphanAttachmentRow => "A6_ORPHAN_ATTACHMENT_ROW",
            A7ComputeVmgrAttachedStorageMissing => "A7_COMPUTE_VMGR_ATTACHED_STORAGE_MISSING",
            S1Stuck(phase) => return format!("S1_STUCK_{}", phase.as_str().to_uppercase()),
            S2StateUsageMismatch => "S2_STATE_USAGE_MISMATCH",
            S3SizeMismatch => "S3_SIZE_MISMATCH",
            IOrphaned(child) => return format!("I_{}_ORPHANED", child.to_uppercase()),
            IMissingDeletedAt => "I_MISSING_DELETED_AT",
            IServiceDeletedButReferenced => "I_SERVICE_DELETED_BUT_REFERENCED",
            VEmptyVvolFolder => "V_EMPTY_VVOL_FOLDER",
            VGhostDisk => "V_GHOST_DISK",
            VGhostNic => "V_GHOST_NIC",
            VUnknownTemplate => "V_UNKNOWN_TEMPLATE",
            VShadowOnEphemeral => "V_SHADOW_ON_EPHEMERAL",
            VOrphanVmx => "V_ORPHAN_VMX",
            VOrphanVmxRenamed => "V_ORPHAN_VMX_RENAMED",
            VFormerInstancePoweredOn => "V_FORMER_INSTANCE_POWERED_ON",
            VFormerInstanceSuspended => "V_FORMER_INSTANCE_SUSPENDED",
            VFormerInstancePoweredOff => "V_FORMER_INSTANCE_POWERED_OFF",
            StorageBalanceMove => "STORAGE_BALANCE_MOVE",
            BigVmMigration => "BIGVM_MIGRATION",
            BigVmShares => "BIGVM_SHARES",
            BigVmDrs => "BIGVM_DRS",
        };
        fixed.to_string()
    }

    /// Fault kinds that are never repaired automatically.
    pub fn is_report_only(&self) -> bool {
        matches!(
            self,
            FaultKind::A4BothAttachedVmgrMissing
                | FaultKind::A5ExtraConfigDiskMismatch
                | FaultKind::S3SizeMismatch
                | FaultKind::VEmptyVvolFolder
                | FaultKind::VShadowOnEphemeral
                | FaultKind::VUnknownTemplate
        )
    }
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

impl Serialize for FaultKind {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.name())
    }
}

/// Identity of the entity a fault is reported on. Stable across cycles so
/// the persistence filter can count consecutive sightings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct EntityKey(pub String);

impl EntityKey {
    pub fn volume(id: &VolumeId) -> Self {
        EntityKey(format!("volume:{}", id))
    }

    pub fn attachment(volume: &VolumeId, instance: &InstanceId) -> Self {
        EntityKey(format!("attachment:{}:{}", volume, instance))
    }

    pub fn instance(id: &InstanceId) -> Self {
        EntityKey(format!("instance:{}", id))
    }

    pub fn vm(moid: &Moid) -> Self {
        EntityKey(format!("vm:{}", moid))
    }

    pub fn vm_device(moid: &Moid, key: i32) -> Self {
        EntityKey(format!("vm:{}:device:{}", moid, key))
    }

    pub fn row(table: &TableSpec, key: &RowKey) -> Self {
        EntityKey(format!("{}.{}:{}", table.database, table.name, key))
    }

    pub fn datastore_path(datastore: &str, path: &str) -> Self {
        EntityKey(format!("[{}] {}", datastore, path))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One classified fault for one entity in one cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct Fault {
    pub kind: FaultKind,
    pub entity: EntityKey,
    /// Other ids involved (volume, instance, vm), for operator output.
    pub related: Vec<String>,
    pub severity: Severity,
    /// Empty when `severity` is [`Severity::Report`].
    pub actions: Vec<RepairAction>,
    /// Volume that must be locked in the control plane while repairing.
    pub lock: Option<VolumeId>,
    pub reason: String,
}

impl Fault {
    pub fn report(kind: FaultKind, entity: EntityKey, reason: impl Into<String>) -> Self {
        Self {
            kind,
            entity,
            related: Vec::new(),
            severity: Severity::Report,
            actions: Vec::new(),
            lock: None,
            reason: reason.into(),
        }
    }

    /// A repairable fault. Report-only kinds and empty action lists are
    /// downgraded to [`Severity::Report`].
    pub fn repair(
        kind: FaultKind,
        entity: EntityKey,
        reason: impl Into<String>,
        actions: Vec<RepairAction>,
    ) -> Self {
        if kind.is_report_only() || actions.is_empty() {
            return Self::report(kind, entity, reason);
        }
        Self {
            kind,
            entity,
            related: Vec::new(),
            severity: Severity::Repair,
            actions,
            lock: None,
            reason: reason.into(),
        }
    }

    pub fn with_lock(mut self, volume: VolumeId) -> Self {
        if self.severity == Severity::Repair {
            self.lock = Some(volume);
        }
        self
    }

    pub fn with_related(mut self, related: impl ToString) -> Self {
        self.related.push(related.to_string());
        self
    }

    pub fn category(&self) -> FaultCategory {
        self.kind.category()
    }

    pub fn is_repairable(&self) -> bool {
        self.severity == Severity::Repair
    }
}
