//! Host-memory balancer for big VMs.
//!
//! A host whose big-VM memory exceeds its capacity by more than the
//! overcommit margin (or that telemetry reports under contention) gives up
//! its smallest movable big VM to the least loaded host of the same cluster.

use crate::error::Result;
use crate::fault::{EntityKey, Fault, FaultKind};
use crate::model::{DrsBehavior, Moid, SharesLevel, VmObject, GIB};
use crate::repair::RepairAction;
use crate::snapshot::VmgrSnapshot;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BigVmConfig {
    pub min_big_vm_size_gb: u64,
    pub overcommit_percent: f64,
    pub shares_action_size_gb: u64,
    pub drs_size_gb: u64,
    /// Hosts or clusters whose name contains one of these never take part.
    pub forbidden_shards: Vec<String>,
}

impl Default for BigVmConfig {
    fn default() -> Self {
        Self {
            min_big_vm_size_gb: 512,
            overcommit_percent: 3.0,
            shares_action_size_gb: 1024,
            drs_size_gb: 3072,
            forbidden_shards: Vec::new(),
        }
    }
}

impl BigVmConfig {
    fn min_big_vm_bytes(&self) -> u64 {
        self.min_big_vm_size_gb * GIB
    }

    fn is_forbidden(&self, name: &str) -> bool {
        self.forbidden_shards.iter().any(|s| name.contains(s.as_str()))
    }
}

/// Contention and readiness signals, keyed by host and VM name.
#[async_trait]
pub trait MemoryTelemetry: Send + Sync {
    async fn contended_hosts(&self) -> Result<HashSet<String>>;
    async fn ready_vms(&self) -> Result<HashSet<String>>;
}

/// External planner that may replace the built-in per-cluster planning.
#[async_trait]
pub trait Recommender: Send + Sync {
    async fn recommend(&self, cluster: &str, hosts: &[HostLoad]) -> Result<Vec<Migration>>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BigVm {
    pub moid: Moid,
    pub name: String,
    pub memory_bytes: u64,
    pub ready: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostLoad {
    pub moid: Moid,
    pub name: String,
    pub cluster: Moid,
    pub capacity_bytes: u64,
    pub provisioned_bytes: u64,
    pub contended: bool,
    pub usable: bool,
    pub big_vms: Vec<BigVm>,
}

impl HostLoad {
    pub fn free_bytes(&self) -> u64 {
        self.capacity_bytes.saturating_sub(self.provisioned_bytes)
    }

    pub fn is_overcommitted(&self, overcommit_percent: f64) -> bool {
        self.provisioned_bytes as f64
            >= self.capacity_bytes as f64 * (1.0 + overcommit_percent / 100.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Migration {
    pub vm: Moid,
    pub from_host: Moid,
    pub to_host: Moid,
    pub memory_bytes: u64,
}

impl fmt::Display for Migration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "migrate {} ({} GiB) from {} to {}",
            self.vm,
            self.memory_bytes / GIB,
            self.from_host,
            self.to_host
        )
    }
}

fn is_big_instance(vm: &VmObject, min_bytes: u64) -> bool {
    vm.is_powered_on() && vm.has_annotation() && !vm.is_template() && vm.memory_bytes() > min_bytes
}

fn cluster_of(vmgr: &VmgrSnapshot, host: &Moid) -> Option<Moid> {
    vmgr.hosts
        .get(host)
        .and_then(|h| h.cluster.clone())
        .or_else(|| {
            vmgr.clusters
                .values()
                .find(|c| c.hosts.contains(host))
                .map(|c| c.moid.clone())
        })
}

/// Per-cluster host loads, sorted by host moid.
pub fn host_loads(
    vmgr: &VmgrSnapshot,
    contended: &HashSet<String>,
    ready: &HashSet<String>,
    cfg: &BigVmConfig,
) -> BTreeMap<Moid, Vec<HostLoad>> {
    let min_bytes = cfg.min_big_vm_bytes();
    let mut by_cluster: BTreeMap<Moid, Vec<HostLoad>> = BTreeMap::new();

    for host in vmgr.hosts.values() {
        let Some(cluster) = cluster_of(vmgr, &host.moid) else {
            continue;
        };
        let cluster_name = vmgr
            .clusters
            .get(&cluster)
            .map(|c| c.name.as_str())
            .unwrap_or_default();
        if cfg.is_forbidden(&host.name) || cfg.is_forbidden(cluster_name) {
            continue;
        }
        let mut big_vms: Vec<BigVm> = vmgr
            .vms
            .values()
            .filter(|vm| vm.runtime_host() == Some(&host.moid))
            .filter(|vm| is_big_instance(vm, min_bytes))
            .map(|vm| {
                let name = vm.config_name.get().cloned().unwrap_or_default();
                BigVm {
                    moid: vm.moid.clone(),
                    ready: ready.contains(&name),
                    name,
                    memory_bytes: vm.memory_bytes(),
                }
            })
            .collect();
        big_vms.sort_by(|a, b| a.memory_bytes.cmp(&b.memory_bytes).then(a.moid.cmp(&b.moid)));

        by_cluster.entry(cluster.clone()).or_default().push(HostLoad {
            moid: host.moid.clone(),
            name: host.name.clone(),
            cluster,
            capacity_bytes: host.memory_bytes,
            provisioned_bytes: big_vms.iter().map(|v| v.memory_bytes).sum(),
            contended: contended.contains(&host.name),
            usable: host.is_usable(),
            big_vms,
        });
    }
    for hosts in by_cluster.values_mut() {
        hosts.sort_by(|a, b| a.moid.cmp(&b.moid));
    }
    by_cluster
}

/// Plans at most one migration per source host of one cluster.
pub fn plan_cluster(hosts: &[HostLoad], cfg: &BigVmConfig) -> Vec<Migration> {
    let min_bytes = cfg.min_big_vm_bytes();
    let mut free: BTreeMap<&Moid, u64> = hosts.iter().map(|h| (&h.moid, h.free_bytes())).collect();

    let mut sources: Vec<&HostLoad> = hosts
        .iter()
        .filter(|h| h.usable)
        .filter(|h| h.is_overcommitted(cfg.overcommit_percent) || h.contended)
        .filter(|h| h.big_vms.iter().any(|v| v.ready))
        .collect();
    sources.sort_by(|a, b| {
        let ratio = |h: &HostLoad| h.provisioned_bytes as f64 / h.capacity_bytes.max(1) as f64;
        ratio(b)
            .partial_cmp(&ratio(a))
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.moid.cmp(&b.moid))
    });

    let mut migrations = Vec::new();
    for source in sources {
        let target = hosts
            .iter()
            .filter(|h| h.moid != source.moid && h.usable && !h.contended)
            .filter(|h| free[&h.moid] >= min_bytes)
            .max_by(|a, b| {
                free[&a.moid]
                    .cmp(&free[&b.moid])
                    .then_with(|| b.moid.cmp(&a.moid))
            });
        let Some(target) = target else {
            tracing::debug!("no target host for {}", source.name);
            continue;
        };
        let target_free = free[&target.moid];
        // big_vms is sorted ascending, so the first fit is the smallest.
        let Some(vm) = source
            .big_vms
            .iter()
            .find(|v| v.ready && v.memory_bytes <= target_free)
        else {
            continue;
        };
        free.insert(&target.moid, target_free - vm.memory_bytes);
        if let Some(f) = free.get_mut(&source.moid) {
            *f += vm.memory_bytes;
        }
        migrations.push(Migration {
            vm: vm.moid.clone(),
            from_host: source.moid.clone(),
            to_host: target.moid.clone(),
            memory_bytes: vm.memory_bytes,
        });
    }
    migrations
}

/// Splits recommender output into migrations that still hold against the
/// current loads and rejected ones with their reason.
pub fn validate(
    proposed: Vec<Migration>,
    hosts: &[HostLoad],
    cfg: &BigVmConfig,
) -> (Vec<Migration>, Vec<(Migration, String)>) {
    let mut free: BTreeMap<Moid, u64> = hosts.iter().map(|h| (h.moid.clone(), h.free_bytes())).collect();
    let mut accepted = Vec::new();
    let mut rejected = Vec::new();

    for m in proposed {
        if m.from_host == m.to_host {
            rejected.push((m, "source and target host are the same".to_string()));
            continue;
        }
        let Some(source) = hosts.iter().find(|h| h.moid == m.from_host) else {
            rejected.push((m, "source host is not in this cluster".to_string()));
            continue;
        };
        let Some(vm) = source.big_vms.iter().find(|v| v.moid == m.vm) else {
            rejected.push((m, "vm is no longer on the source host".to_string()));
            continue;
        };
        if !vm.ready {
            rejected.push((m, "vm is not ready to move".to_string()));
            continue;
        }
        let Some(target) = hosts.iter().find(|h| h.moid == m.to_host) else {
            rejected.push((m, "target host is not in this cluster".to_string()));
            continue;
        };
        if !target.usable || cfg.is_forbidden(&target.name) {
            rejected.push((m, "target host is not usable".to_string()));
            continue;
        }
        if target.contended {
            rejected.push((m, "target host is under memory contention".to_string()));
            continue;
        }
        let target_free = free.get(&target.moid).copied().unwrap_or(0);
        if target_free < vm.memory_bytes {
            rejected.push((m, "target host lacks free memory".to_string()));
            continue;
        }
        free.insert(target.moid.clone(), target_free - vm.memory_bytes);
        accepted.push(Migration {
            memory_bytes: vm.memory_bytes,
            ..m
        });
    }
    (accepted, rejected)
}

pub fn migration_fault(m: &Migration) -> Fault {
    Fault::repair(
        FaultKind::BigVmMigration,
        EntityKey::vm(&m.vm),
        m.to_string(),
        vec![RepairAction::RelocateHost {
            vm: m.vm.clone(),
            from_host: m.from_host.clone(),
            to_host: m.to_host.clone(),
            memory_bytes: m.memory_bytes,
        }],
    )
}

/// Memory-shares and DRS-override proposals for very big VMs.
pub fn setting_faults(vmgr: &VmgrSnapshot, cfg: &BigVmConfig) -> Vec<Fault> {
    let shares_bytes = cfg.shares_action_size_gb * GIB;
    let drs_bytes = cfg.drs_size_gb * GIB;
    let mut vms: Vec<&VmObject> = vmgr
        .vms
        .values()
        .filter(|vm| vm.has_annotation() && !vm.is_template())
        .collect();
    vms.sort_by(|a, b| a.moid.cmp(&b.moid));

    let mut faults = Vec::new();
    for vm in vms {
        let memory = vm.memory_bytes();
        if memory > shares_bytes && vm.memory_shares.get() != Some(&SharesLevel::High) {
            faults.push(Fault::repair(
                FaultKind::BigVmShares,
                EntityKey::vm(&vm.moid),
                format!("vm {} has {} GiB with normal shares", vm.moid, memory / GIB),
                vec![RepairAction::SetMemoryShares {
                    vm: vm.moid.clone(),
                    level: SharesLevel::High,
                }],
            ));
        }
        if memory <= drs_bytes {
            continue;
        }
        let Some(cluster) = vm
            .runtime_host()
            .and_then(|h| cluster_of(vmgr, h))
            .and_then(|c| vmgr.clusters.get(&c))
        else {
            continue;
        };
        let existing = cluster.drs_overrides.get(&vm.moid);
        if existing == Some(&DrsBehavior::PartiallyAutomated) {
            continue;
        }
        faults.push(Fault::repair(
            FaultKind::BigVmDrs,
            EntityKey::vm(&vm.moid),
            format!(
                "vm {} has {} GiB without a partiallyAutomated drs override",
                vm.moid,
                memory / GIB
            ),
            vec![RepairAction::SetDrsOverride {
                cluster: cluster.moid.clone(),
                vm: vm.moid.clone(),
                behavior: DrsBehavior::PartiallyAutomated,
                edit: existing.is_some(),
            }],
        ));
    }
    faults
}
