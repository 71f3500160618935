//! Storage-balance nanny: proposes shadow-VM storage moves off the most used
//! datastore or aggregate.

use super::{required, unavailable};
use crate::balance::storage::{
    self, datastore_weight, BalanceMode, Container, MoveCandidate, PlannedMove,
    StorageBalanceConfig,
};
use crate::driver::{IterationContext, Nanny, Observation};
use crate::error::Result;
use crate::fault::{EntityKey, Fault, FaultKind};
use crate::ident::BackendMapper;
use crate::join::{join_storage_layout, JoinedDatastore, StorageLayout};
use crate::metrics::NannyMetrics;
use crate::model::{VolumeStatus, VmObject};
use crate::repair::RepairAction;
use crate::snapshot::{Snapshotter, StorageSnapshot};
use async_trait::async_trait;
use regex::Regex;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct StorageBalanceRules {
    pub config: StorageBalanceConfig,
    pub exclude: Option<Regex>,
    pub mapper: BackendMapper,
}

pub struct StorageBalanceNanny {
    snapshotter: Snapshotter,
    rules: StorageBalanceRules,
    metrics: Arc<NannyMetrics>,
}

impl StorageBalanceNanny {
    pub fn new(snapshotter: Snapshotter, rules: StorageBalanceRules, metrics: Arc<NannyMetrics>) -> Self {
        Self {
            snapshotter,
            rules,
            metrics,
        }
    }

    fn excluded(&self, name: &str) -> bool {
        self.rules
            .exclude
            .as_ref()
            .map(|re| re.is_match(name))
            .unwrap_or(false)
    }
}

fn shadow_candidate(
    vm: &VmObject,
    ds: &JoinedDatastore<'_>,
    container: &str,
    storage: &StorageSnapshot,
) -> Option<MoveCandidate> {
    let volume_id = vm.shadow_volume_id()?;
    let volume = storage.volumes.get(&volume_id);
    let size_bytes = volume
        .map(|v| v.size_bytes)
        .unwrap_or_else(|| vm.disks().map(|d| d.capacity_bytes).sum());
    let attached = volume
        .map(|v| v.status == VolumeStatus::InUse || !v.attachments.is_empty())
        .unwrap_or(false);
    Some(MoveCandidate {
        vm: vm.moid.clone(),
        volume: volume_id,
        size_bytes,
        attached,
        container: container.to_string(),
        datastore: ds.datastore.moid.clone(),
    })
}

impl StorageBalanceNanny {
    fn datastore_inputs(
        &self,
        layout: &StorageLayout<'_>,
        storage: &StorageSnapshot,
    ) -> (Vec<Container>, Vec<MoveCandidate>) {
        let mut containers = Vec::new();
        let mut candidates = Vec::new();
        for jd in &layout.datastores {
            let ds = jd.datastore;
            if self.excluded(&ds.name) {
                continue;
            }
            let aggr_usage = jd.aggregate.as_ref().and_then(|name| {
                layout
                    .aggregates
                    .iter()
                    .find(|a| &a.name == name)
                    .map(|a| a.usage_percent)
            });
            containers.push(Container {
                name: ds.name.clone(),
                backend: jd.backend.backend().map(str::to_string),
                capacity_bytes: ds.capacity_bytes,
                used_bytes: ds.used_bytes(),
                weight: aggr_usage
                    .map(|a| datastore_weight(a, ds.usage_percent()))
                    .unwrap_or(1.0),
                target_datastore: Some(ds.moid.clone()),
            });
            candidates.extend(
                jd.shadow_vms
                    .iter()
                    .filter_map(|vm| shadow_candidate(vm, jd, &ds.name, storage)),
            );
        }
        (containers, candidates)
    }

    fn aggregate_inputs(
        &self,
        layout: &StorageLayout<'_>,
        storage: &StorageSnapshot,
    ) -> (Vec<Container>, Vec<MoveCandidate>) {
        let mut containers = Vec::new();
        let mut candidates = Vec::new();
        for aggr in &layout.aggregates {
            let members: Vec<&JoinedDatastore<'_>> = layout
                .datastores
                .iter()
                .filter(|d| d.aggregate.as_deref() == Some(aggr.name.as_str()))
                .filter(|d| !self.excluded(&d.datastore.name))
                .collect();
            if members.is_empty() {
                continue;
            }
            let target = members
                .iter()
                .max_by(|a, b| {
                    a.datastore
                        .free_bytes
                        .cmp(&b.datastore.free_bytes)
                        .then(b.datastore.name.cmp(&a.datastore.name))
                })
                .map(|d| d.datastore.moid.clone());
            containers.push(Container {
                name: aggr.name.clone(),
                backend: aggr.backend.backend().map(str::to_string),
                capacity_bytes: aggr.capacity_bytes,
                used_bytes: aggr.used_bytes,
                weight: 1.0,
                target_datastore: target,
            });
            for jd in members {
                candidates.extend(
                    jd.shadow_vms
                        .iter()
                        .filter_map(|vm| shadow_candidate(vm, jd, &aggr.name, storage)),
                );
            }
        }
        (containers, candidates)
    }

    fn record_usage(&self, layout: &StorageLayout<'_>) {
        for jd in &layout.datastores {
            self.metrics
                .datastore_usage
                .with_label_values(&[&jd.datastore.name])
                .set(jd.datastore.usage_percent());
        }
        for aggr in &layout.aggregates {
            self.metrics
                .aggregate_usage
                .with_label_values(&[&aggr.name])
                .set(aggr.usage_percent);
        }
    }
}

fn move_fault(m: &PlannedMove) -> Fault {
    let entity = EntityKey::vm(&m.candidate.vm);
    let reason = format!("{} for volume {}", m, m.candidate.volume);
    if !m.is_automatic() {
        return Fault::report(
            FaultKind::StorageBalanceMove,
            entity,
            format!("{} (attached, manual move only)", reason),
        )
        .with_related(m.candidate.volume);
    }
    Fault::repair(
        FaultKind::StorageBalanceMove,
        entity,
        reason,
        vec![RepairAction::RelocateStorage {
            vm: m.candidate.vm.clone(),
            volume: m.candidate.volume,
            from_datastore: m.candidate.datastore.clone(),
            to_datastore: m.to_datastore.clone(),
            size_bytes: m.candidate.size_bytes,
        }],
    )
    .with_related(m.candidate.volume)
}

#[async_trait]
impl Nanny for StorageBalanceNanny {
    fn name(&self) -> &str {
        "storage-balance"
    }

    async fn observe(&self, ctx: &mut IterationContext) -> Result<Observation> {
        let snapshot = self.snapshotter.collect(ctx.now).await?;
        let vmgr = required(&snapshot.vmgr, "vmgr")?;
        let storage = required(&snapshot.storage, "storage-db")?;
        let array = match self.rules.config.mode {
            BalanceMode::Aggregate => Some(required(&snapshot.array, "array")?),
            BalanceMode::Datastore => snapshot.array.get(),
        };

        let mut layout = join_storage_layout(vmgr, array, &self.rules.mapper);
        self.record_usage(&layout);
        let (containers, candidates) = match self.rules.config.mode {
            BalanceMode::Datastore => self.datastore_inputs(&layout, storage),
            BalanceMode::Aggregate => self.aggregate_inputs(&layout, storage),
        };

        let mut obs = Observation {
            anomalies: std::mem::take(&mut layout.anomalies),
            unavailable: unavailable(&snapshot),
            ..Default::default()
        };
        let proposals = &self.metrics.balancer_proposals;
        match storage::plan(&containers, &candidates, &self.rules.config) {
            Ok(plan) => {
                let automatic = plan.moves.iter().filter(|m| m.is_automatic()).count();
                proposals.with_label_values(&["gated"]).set(0);
                proposals.with_label_values(&["automatic"]).set(automatic as i64);
                proposals
                    .with_label_values(&["report_only"])
                    .set((plan.moves.len() - automatic) as i64);
                tracing::info!(
                    "balancing {} -> {}: {} GiB over target {:.1}%, {} moves",
                    plan.most_used,
                    plan.least_used,
                    plan.bytes_to_move / crate::model::GIB,
                    plan.target_usage_percent,
                    plan.moves.len()
                );
                for m in &plan.moves {
                    if !m.is_automatic() {
                        tracing::info!("plan: {} for attached volume {}", m, m.candidate.volume);
                    }
                    obs.proposals.push(move_fault(m));
                }
            }
            Err(gate) => {
                tracing::info!("no storage balancing this cycle: {}", gate);
                proposals.with_label_values(&["gated"]).set(1);
                proposals.with_label_values(&["automatic"]).set(0);
                proposals.with_label_values(&["report_only"]).set(0);
            }
        }
        Ok(obs)
    }
}
