//! Sequential repair execution.
//!
//! Repairs run one at a time in plan order. A failing action skips the rest
//! of its repair and the executor moves on. Every action produces exactly one
//! operator line prefixed `action:` (executed) or `dry-run:` (skipped).

use crate::error::{NannyError, Result};
use crate::fault::FaultKind;
use crate::metrics::NannyMetrics;
use crate::planner::{Plan, PlannedRepair};
use crate::repair::{
    ComputeRepair, DatabaseRepair, RepairAction, StorageRepair, VmgrRepair, VolumeLocker,
};
use crate::tables::{Database, RowKey, TableSpec};
use std::sync::Arc;

/// The mutating side of each upstream. Unset members make their actions
/// fail with [`NannyError::NotConfigured`].
#[derive(Clone, Default)]
pub struct Repairers {
    pub compute: Option<Arc<dyn ComputeRepair>>,
    pub storage: Option<Arc<dyn StorageRepair>>,
    pub share: Option<Arc<dyn DatabaseRepair>>,
    pub vmgr: Option<Arc<dyn VmgrRepair>>,
    pub locker: Option<Arc<dyn VolumeLocker>>,
}

#[derive(Debug, Default, Clone)]
pub struct ExecutionReport {
    pub executed: usize,
    pub dry_run: usize,
    pub failed: usize,
    /// Operator lines in emission order.
    pub lines: Vec<String>,
    /// Kinds with at least one fully applied repair, with its entity.
    pub applied: Vec<(FaultKind, crate::fault::EntityKey)>,
}

impl ExecutionReport {
    pub fn lines_with_prefix(&self, prefix: &str) -> usize {
        self.lines.iter().filter(|l| l.starts_with(prefix)).count()
    }
}

pub struct Executor {
    repairers: Repairers,
    metrics: Arc<NannyMetrics>,
}

fn missing(upstream: &str) -> NannyError {
    NannyError::NotConfigured(upstream.to_string())
}

#[derive(Debug, Clone, Copy)]
enum RowOp {
    SoftDelete,
    FillDeletedAt,
    Undelete,
}

async fn run_row_op<R: DatabaseRepair + ?Sized>(
    repair: &R,
    op: RowOp,
    table: &TableSpec,
    key: &RowKey,
) -> Result<()> {
    match op {
        RowOp::SoftDelete => repair.soft_delete(table, key).await,
        RowOp::FillDeletedAt => repair.fill_deleted_at(table, key).await,
        RowOp::Undelete => repair.undelete(table, key).await,
    }
}

impl Executor {
    pub fn new(repairers: Repairers, metrics: Arc<NannyMetrics>) -> Self {
        Self { repairers, metrics }
    }

    pub async fn execute(&self, plan: &Plan, dry_run: bool) -> ExecutionReport {
        let mut report = ExecutionReport::default();
        for repair in &plan.repairs {
            if dry_run {
                self.simulate(repair, &mut report);
            } else {
                self.apply(repair, &mut report).await;
            }
        }
        report
    }

    fn simulate(&self, repair: &PlannedRepair, report: &mut ExecutionReport) {
        let kind = repair.kind.name();
        for action in &repair.actions {
            let line = format!("dry-run: {} {}: {}", kind, repair.entity, action);
            tracing::info!("{}", line);
            report.lines.push(line);
            report.dry_run += 1;
            self.metrics.dry_run_actions.with_label_values(&[&kind]).inc();
        }
    }

    async fn apply(&self, repair: &PlannedRepair, report: &mut ExecutionReport) {
        let kind = repair.kind.name();

        let locked = match (&repair.lock, &self.repairers.locker) {
            (Some(volume), Some(locker)) => {
                if let Err(e) = locker.lock_volume(volume).await {
                    tracing::error!("failed to lock volume {} for {}: {}", volume, kind, e);
                    self.metrics.repairs_failed.with_label_values(&[&kind]).inc();
                    report.failed += 1;
                    return;
                }
                Some((*volume, Arc::clone(locker)))
            }
            _ => None,
        };

        let outcome = self.apply_actions(repair, &kind, report).await;

        if let Some((volume, locker)) = locked {
            if let Err(e) = locker.unlock_volume(&volume).await {
                tracing::error!("failed to unlock volume {}: {}", volume, e);
            }
        }

        match outcome {
            Ok(()) => report.applied.push((repair.kind, repair.entity.clone())),
            Err(e) => {
                tracing::error!("repair {} on {} failed: {}", kind, repair.entity, e);
                self.metrics.repairs_failed.with_label_values(&[&kind]).inc();
                report.failed += 1;
            }
        }
    }

    async fn apply_actions(
        &self,
        repair: &PlannedRepair,
        kind: &str,
        report: &mut ExecutionReport,
    ) -> Result<()> {
        for action in &repair.actions {
            let line = format!("action: {} {}: {}", kind, repair.entity, action);
            tracing::info!("{}", line);
            report.lines.push(line);
            self.metrics.repairs_attempted.with_label_values(&[kind]).inc();
            self.dispatch(action).await?;
            report.executed += 1;
        }
        Ok(())
    }

    fn compute(&self) -> Result<&dyn ComputeRepair> {
        self.repairers
            .compute
            .as_deref()
            .ok_or_else(|| missing("compute-db"))
    }

    fn share(&self) -> Result<&dyn DatabaseRepair> {
        self.repairers.share.as_deref().ok_or_else(|| missing("share-db"))
    }

    async fn row_op(&self, op: RowOp, table: &TableSpec, key: &RowKey) -> Result<()> {
        match table.database {
            Database::Compute => run_row_op(self.compute()?, op, table, key).await,
            Database::Storage => run_row_op(self.storage()?, op, table, key).await,
            Database::Share => run_row_op(self.share()?, op, table, key).await,
        }
    }

    fn vmgr(&self) -> Result<&dyn VmgrRepair> {
        self.repairers.vmgr.as_deref().ok_or_else(|| missing("vmgr"))
    }

    fn storage(&self) -> Result<&dyn StorageRepair> {
        self.repairers
            .storage
            .as_deref()
            .ok_or_else(|| missing("storage-db"))
    }

    async fn dispatch(&self, action: &RepairAction) -> Result<()> {
        match action {
            RepairAction::SoftDelete { table, key } => {
                self.row_op(RowOp::SoftDelete, table, key).await
            }
            RepairAction::FillDeletedAt { table, key } => {
                self.row_op(RowOp::FillDeletedAt, table, key).await
            }
            RepairAction::Undelete { table, key } => {
                self.row_op(RowOp::Undelete, table, key).await
            }
            RepairAction::SetVolumeStatus {
                volume,
                status,
                attach_status,
            } => {
                self.storage()?
                    .set_volume_status(volume, *status, *attach_status)
                    .await
            }
            RepairAction::InsertAttachment(row) => self.storage()?.insert_attachment(row).await,
            RepairAction::SetMappingAttachmentId {
                mapping_id,
                attachment_id,
            } => {
                self.compute()?
                    .set_mapping_attachment_id(*mapping_id, *attachment_id)
                    .await
            }
            RepairAction::DetachDisk { vm, disk_key, .. } => {
                self.vmgr()?.detach_disk(vm, *disk_key).await
            }
            RepairAction::DetachNic { vm, nic_key } => self.vmgr()?.detach_nic(vm, *nic_key).await,
            RepairAction::MoveDatastorePath { datastore, from, to } => {
                self.vmgr()?.move_datastore_path(datastore, from, to).await
            }
            RepairAction::DeleteDatastorePath { datastore, path } => {
                self.vmgr()?.delete_datastore_path(datastore, path).await
            }
            RepairAction::SuspendVm { vm } => self.vmgr()?.suspend(vm).await,
            RepairAction::PowerOffVm { vm } => self.vmgr()?.power_off(vm).await,
            RepairAction::UnregisterVm { vm } => self.vmgr()?.unregister(vm).await,
            RepairAction::RelocateStorage {
                vm, to_datastore, ..
            } => self.vmgr()?.relocate_storage(vm, to_datastore).await,
            RepairAction::RelocateHost { vm, to_host, .. } => {
                self.vmgr()?.relocate_host(vm, to_host).await
            }
            RepairAction::SetMemoryShares { vm, level } => {
                self.vmgr()?.set_memory_shares(vm, *level).await
            }
            RepairAction::SetDrsOverride {
                cluster,
                vm,
                behavior,
                edit,
            } => {
                self.vmgr()?
                    .set_drs_override(cluster, vm, *behavior, *edit)
                    .await
            }
        }
    }
}
