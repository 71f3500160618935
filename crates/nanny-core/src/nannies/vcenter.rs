//! vCenter nanny: virtualization-manager objects nothing else accounts for.

use super::{required, unavailable};
use crate::classify::{self, vmgr::VmgrRules};
use crate::driver::{IterationContext, Nanny, Observation};
use crate::error::Result;
use crate::join::join_attachments;
use crate::snapshot::Snapshotter;
use async_trait::async_trait;

pub struct VcenterNanny {
    snapshotter: Snapshotter,
    rules: VmgrRules,
}

impl VcenterNanny {
    pub fn new(snapshotter: Snapshotter, rules: VmgrRules) -> Self {
        Self { snapshotter, rules }
    }
}

#[async_trait]
impl Nanny for VcenterNanny {
    fn name(&self) -> &str {
        "vcenter"
    }

    async fn observe(&self, ctx: &mut IterationContext) -> Result<Observation> {
        let snapshot = self.snapshotter.collect(ctx.now).await?;
        let compute = required(&snapshot.compute, "compute-db")?;
        let storage = required(&snapshot.storage, "storage-db")?;
        let vmgr = required(&snapshot.vmgr, "vmgr")?;

        let mut joined = join_attachments(compute, storage, Some(vmgr));
        let faults = classify::vmgr::classify(
            &joined,
            compute,
            storage,
            vmgr,
            snapshot.catalog.get(),
            &self.rules,
        );
        if !vmgr.no_access.is_empty() {
            tracing::warn!(
                "{} datastores could not be browsed: {}",
                vmgr.no_access.len(),
                vmgr.no_access.iter().cloned().collect::<Vec<_>>().join(", ")
            );
        }

        Ok(Observation {
            faults: classify::one_per_category(faults),
            proposals: Vec::new(),
            anomalies: std::mem::take(&mut joined.anomalies),
            manual: std::mem::take(&mut joined.manual),
            unavailable: unavailable(&snapshot),
        })
    }
}
