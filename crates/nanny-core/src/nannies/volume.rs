//! Volume nanny: attachment agreement between the control planes and the
//! virtualization manager, plus volume state dwell and usage checks.

use super::{required, unavailable};
use crate::classify::{self, attachment, state::StateRules};
use crate::driver::{IterationContext, Nanny, Observation};
use crate::error::Result;
use crate::join::{join_attachments, shard_anomalies};
use crate::snapshot::Snapshotter;
use async_trait::async_trait;

pub struct VolumeNanny {
    snapshotter: Snapshotter,
    rules: StateRules,
    shard_prefix: Option<String>,
}

impl VolumeNanny {
    pub fn new(snapshotter: Snapshotter, rules: StateRules) -> Self {
        Self {
            snapshotter,
            rules,
            shard_prefix: None,
        }
    }

    /// Compute hosts outside every aggregate with this prefix force the cycle
    /// into dry-run.
    pub fn with_shard_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.shard_prefix = Some(prefix.into());
        self
    }
}

#[async_trait]
impl Nanny for VolumeNanny {
    fn name(&self) -> &str {
        "volume"
    }

    async fn observe(&self, ctx: &mut IterationContext) -> Result<Observation> {
        let snapshot = self.snapshotter.collect(ctx.now).await?;
        let compute = required(&snapshot.compute, "compute-db")?;
        let storage = required(&snapshot.storage, "storage-db")?;

        let mut joined = join_attachments(compute, storage, snapshot.vmgr.get());
        let mut faults = attachment::classify(&joined, compute, storage);
        faults.extend(classify::state::classify(
            &joined,
            snapshot.array.get(),
            ctx.now,
            &self.rules,
        ));

        let mut anomalies = std::mem::take(&mut joined.anomalies);
        if let Some(prefix) = &self.shard_prefix {
            anomalies.extend(shard_anomalies(compute, prefix));
        }
        tracing::debug!(
            "volume cycle {}: {} volumes, {} instances joined",
            ctx.cycle,
            joined.volumes.len(),
            joined.instances.len()
        );

        Ok(Observation {
            faults: classify::one_per_category(faults),
            proposals: Vec::new(),
            anomalies,
            manual: std::mem::take(&mut joined.manual),
            unavailable: unavailable(&snapshot),
        })
    }
}
