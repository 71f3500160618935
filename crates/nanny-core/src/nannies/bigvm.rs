//! Big-VM nanny: host-memory relocations plus shares and DRS settings for
//! very large instances.

use super::{required, unavailable};
use crate::balance::memory::{
    self, host_loads, migration_fault, plan_cluster, setting_faults, BigVmConfig, HostLoad,
    MemoryTelemetry, Migration, Recommender,
};
use crate::driver::{IterationContext, Nanny, Observation};
use crate::error::Result;
use crate::fault::FaultKind;
use crate::metrics::NannyMetrics;
use crate::snapshot::{Snapshotter, VmgrSnapshot};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;

pub struct BigVmNanny {
    snapshotter: Snapshotter,
    config: BigVmConfig,
    telemetry: Option<Arc<dyn MemoryTelemetry>>,
    recommender: Option<Arc<dyn Recommender>>,
    metrics: Arc<NannyMetrics>,
}

impl BigVmNanny {
    pub fn new(snapshotter: Snapshotter, config: BigVmConfig, metrics: Arc<NannyMetrics>) -> Self {
        Self {
            snapshotter,
            config,
            telemetry: None,
            recommender: None,
            metrics,
        }
    }

    pub fn with_telemetry(mut self, telemetry: Arc<dyn MemoryTelemetry>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    pub fn with_recommender(mut self, recommender: Arc<dyn Recommender>) -> Self {
        self.recommender = Some(recommender);
        self
    }

    /// Contended hosts and ready VMs. Without telemetry every VM counts as
    /// ready and no host as contended.
    async fn signals(&self, vmgr: &VmgrSnapshot) -> Result<(HashSet<String>, HashSet<String>)> {
        match &self.telemetry {
            Some(t) => Ok((t.contended_hosts().await?, t.ready_vms().await?)),
            None => Ok((
                HashSet::new(),
                vmgr.vms
                    .values()
                    .filter_map(|vm| vm.config_name.get().cloned())
                    .collect(),
            )),
        }
    }

    async fn plan(&self, cluster: &str, hosts: &[HostLoad]) -> Vec<Migration> {
        let Some(recommender) = &self.recommender else {
            return plan_cluster(hosts, &self.config);
        };
        match recommender.recommend(cluster, hosts).await {
            Ok(proposed) => {
                let (accepted, rejected) = memory::validate(proposed, hosts, &self.config);
                for (m, why) in &rejected {
                    tracing::warn!("recommender proposal rejected: {}: {}", m, why);
                }
                self.metrics
                    .balancer_proposals
                    .with_label_values(&["rejected"])
                    .add(rejected.len() as i64);
                accepted
            }
            Err(e) => {
                tracing::warn!(
                    "recommender failed for cluster {}, planning locally: {}",
                    cluster,
                    e
                );
                plan_cluster(hosts, &self.config)
            }
        }
    }
}

#[async_trait]
impl Nanny for BigVmNanny {
    fn name(&self) -> &str {
        "bigvm"
    }

    async fn observe(&self, ctx: &mut IterationContext) -> Result<Observation> {
        let snapshot = self.snapshotter.collect(ctx.now).await?;
        let vmgr = required(&snapshot.vmgr, "vmgr")?;
        let mut obs = Observation {
            unavailable: unavailable(&snapshot),
            ..Default::default()
        };
        let proposals = &self.metrics.balancer_proposals;
        proposals.with_label_values(&["rejected"]).set(0);

        let mut migrations = Vec::new();
        match self.signals(vmgr).await {
            Ok((contended, ready)) => {
                for (cluster, hosts) in host_loads(vmgr, &contended, &ready, &self.config) {
                    let name = vmgr
                        .clusters
                        .get(&cluster)
                        .map(|c| c.name.clone())
                        .unwrap_or_else(|| cluster.clone());
                    migrations.extend(self.plan(&name, &hosts).await);
                }
            }
            Err(e) => {
                tracing::warn!("memory telemetry unavailable, no migrations this cycle: {}", e);
                obs.unavailable.push("prometheus".to_string());
            }
        }

        for m in &migrations {
            tracing::info!("cycle {}: {}", ctx.cycle, m);
            obs.proposals.push(migration_fault(m));
        }
        let settings = setting_faults(vmgr, &self.config);
        let count = |kind: FaultKind| settings.iter().filter(|f| f.kind == kind).count() as i64;
        proposals
            .with_label_values(&["migration"])
            .set(migrations.len() as i64);
        proposals
            .with_label_values(&["shares"])
            .set(count(FaultKind::BigVmShares));
        proposals.with_label_values(&["drs"]).set(count(FaultKind::BigVmDrs));
        obs.proposals.extend(settings);
        Ok(obs)
    }
}
