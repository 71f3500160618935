//! Per-kind safety caps and repair ordering.

use crate::fault::{EntityKey, Fault, FaultKind};
use crate::model::VolumeId;
use crate::repair::RepairAction;
use std::collections::{BTreeMap, HashMap};

/// Cap configuration. Every effective cap is at least 1.
#[derive(Debug, Clone)]
pub struct CapPolicy {
    default: u32,
    per_kind: HashMap<String, u32>,
}

impl CapPolicy {
    pub fn new(default: u32) -> Self {
        Self {
            default: default.max(1),
            per_kind: HashMap::new(),
        }
    }

    pub fn with_overrides(mut self, overrides: &HashMap<String, u32>) -> Self {
        for (kind, cap) in overrides {
            self.per_kind.insert(kind.clone(), (*cap).max(1));
        }
        self
    }

    pub fn cap_for(&self, kind: FaultKind) -> u32 {
        self.per_kind
            .get(&kind.name())
            .copied()
            .unwrap_or(self.default)
    }
}

impl Default for CapPolicy {
    fn default() -> Self {
        Self::new(25)
    }
}

/// One entity's repair with its actions in upstream order.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedRepair {
    pub kind: FaultKind,
    pub entity: EntityKey,
    pub actions: Vec<RepairAction>,
    pub lock: Option<VolumeId>,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct Plan {
    pub repairs: Vec<PlannedRepair>,
    /// Kinds whose candidate count exceeded the cap, with that count.
    pub tripped: BTreeMap<FaultKind, usize>,
    /// Kinds that had candidates and stayed within their cap.
    pub within_cap: Vec<FaultKind>,
}

impl Plan {
    pub fn action_count(&self) -> usize {
        self.repairs.iter().map(|r| r.actions.len()).sum()
    }
}

pub struct RepairPlanner {
    caps: CapPolicy,
}

impl RepairPlanner {
    pub fn new(caps: CapPolicy) -> Self {
        Self { caps }
    }

    /// Build the plan for this cycle's repairable candidates. Report-only
    /// faults do not count towards any cap.
    pub fn plan(&self, candidates: &[Fault]) -> Plan {
        let mut groups: BTreeMap<FaultKind, Vec<&Fault>> = BTreeMap::new();
        for fault in candidates.iter().filter(|f| f.is_repairable()) {
            groups.entry(fault.kind).or_default().push(fault);
        }

        let mut plan = Plan::default();
        for (kind, faults) in groups {
            let cap = self.caps.cap_for(kind) as usize;
            if faults.len() > cap {
                tracing::warn!(
                    "{} candidates of {} exceed the cap of {}; none will be repaired",
                    faults.len(),
                    kind,
                    cap
                );
                plan.tripped.insert(kind, faults.len());
                continue;
            }
            plan.within_cap.push(kind);
            for fault in faults {
                let mut actions = fault.actions.clone();
                actions.sort_by_key(|a| a.upstream());
                plan.repairs.push(PlannedRepair {
                    kind,
                    entity: fault.entity.clone(),
                    actions,
                    lock: fault.lock,
                    reason: fault.reason.clone(),
                });
            }
        }
        order_by_entity(&mut plan.repairs);
        plan
    }
}

/// Repairs of one entity run back to back, earliest upstream first; entities
/// keep the order of their first repair.
fn order_by_entity(repairs: &mut [PlannedRepair]) {
    let mut first_seen: HashMap<EntityKey, usize> = HashMap::new();
    for (i, repair) in repairs.iter().enumerate() {
        first_seen.entry(repair.entity.clone()).or_insert(i);
    }
    repairs.sort_by_key(|r| {
        (
            first_seen.get(&r.entity).copied().unwrap_or(usize::MAX),
            r.actions.first().map(|a| a.upstream()),
        )
    });
}
