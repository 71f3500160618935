//! Storage balancer.
//!
//! Moves shadow-VM disks off the most used container (datastore or
//! aggregate) onto the least used container of a different backend until the
//! source drops below `max_usage - hysteresis`, never pushing the target above
//! that same level.

use crate::model::{Moid, VolumeId, GIB};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BalanceMode {
    #[default]
    Datastore,
    Aggregate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageBalanceConfig {
    pub mode: BalanceMode,
    pub max_usage_percent: f64,
    pub min_usage_percent: f64,
    pub min_free_gb: u64,
    pub min_max_difference_percent: f64,
    pub max_threshold_hysteresis_percent: f64,
    pub lun_min_size_gb: u64,
    pub lun_max_size_gb: u64,
    /// Datastore names matching this regex never take part.
    pub exclude_pattern: Option<String>,
}

impl Default for StorageBalanceConfig {
    fn default() -> Self {
        Self {
            mode: BalanceMode::Datastore,
            max_usage_percent: 85.0,
            min_usage_percent: 70.0,
            min_free_gb: 100,
            min_max_difference_percent: 10.0,
            max_threshold_hysteresis_percent: 5.0,
            lun_min_size_gb: 1,
            lun_max_size_gb: 2048,
            exclude_pattern: None,
        }
    }
}

/// A datastore or aggregate with its occupancy.
#[derive(Debug, Clone, PartialEq)]
pub struct Container {
    pub name: String,
    pub backend: Option<String>,
    pub capacity_bytes: u64,
    pub used_bytes: u64,
    /// Multiplier applied to usage for sort order only.
    pub weight: f64,
    /// Datastore a disk moved onto this container is relocated to.
    pub target_datastore: Option<Moid>,
}

impl Container {
    pub fn usage_percent(&self) -> f64 {
        if self.capacity_bytes == 0 {
            return 100.0;
        }
        self.used_bytes as f64 / self.capacity_bytes as f64 * 100.0
    }

    pub fn free_bytes(&self) -> u64 {
        self.capacity_bytes.saturating_sub(self.used_bytes)
    }

    fn weighted_usage(&self) -> f64 {
        self.usage_percent() * self.weight
    }

    fn usage_with(&self, used: u64) -> f64 {
        if self.capacity_bytes == 0 {
            return 100.0;
        }
        used as f64 / self.capacity_bytes as f64 * 100.0
    }
}

/// Sort weight of a datastore that lives on an aggregate at `aggr_usage`.
pub fn datastore_weight(aggr_usage: f64, ds_usage: f64) -> f64 {
    (aggr_usage + 500.0) / (ds_usage + 500.0)
}

#[derive(Debug, Clone, PartialEq)]
pub struct MoveCandidate {
    pub vm: Moid,
    pub volume: VolumeId,
    pub size_bytes: u64,
    pub attached: bool,
    /// Name of the container the disk currently lives on.
    pub container: String,
    /// Datastore the shadow VM lives on.
    pub datastore: Moid,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlannedMove {
    pub candidate: MoveCandidate,
    pub from: String,
    pub to: String,
    pub to_datastore: Moid,
}

impl PlannedMove {
    pub fn is_automatic(&self) -> bool {
        !self.candidate.attached
    }
}

impl fmt::Display for PlannedMove {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "move {} GB from {} to {}",
            self.candidate.size_bytes / GIB,
            self.from,
            self.to
        )
    }
}

/// Why the balancer produced no plan.
#[derive(Debug, Clone, PartialEq)]
pub enum GateFailure {
    NotEnoughContainers,
    NoOtherBackend,
    MostUsedBelowMax { usage: f64 },
    LeastUsedAboveMin { usage: f64 },
    LeastUsedTooFull { free_gb: u64 },
    DifferenceTooSmall { difference: f64 },
}

impl fmt::Display for GateFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GateFailure::NotEnoughContainers => {
                write!(f, "fewer than two containers with a known backend")
            }
            GateFailure::NoOtherBackend => write!(f, "no container on a different backend"),
            GateFailure::MostUsedBelowMax { usage } => {
                write!(f, "most used container at {:.1}% is below the max", usage)
            }
            GateFailure::LeastUsedAboveMin { usage } => {
                write!(f, "least used container at {:.1}% is above the min", usage)
            }
            GateFailure::LeastUsedTooFull { free_gb } => {
                write!(f, "least used container has only {} GB free", free_gb)
            }
            GateFailure::DifferenceTooSmall { difference } => {
                write!(f, "usage difference {:.1}% is too small", difference)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BalancePlan {
    pub most_used: String,
    pub least_used: String,
    pub target_usage_percent: f64,
    pub bytes_to_move: u64,
    pub moves: Vec<PlannedMove>,
}

pub fn plan(
    containers: &[Container],
    candidates: &[MoveCandidate],
    cfg: &StorageBalanceConfig,
) -> Result<BalancePlan, GateFailure> {
    // Without a known backend "different backend" cannot be decided.
    let mut sorted: Vec<&Container> = containers
        .iter()
        .filter(|c| {
            if c.backend.is_none() {
                tracing::debug!("{} maps to no backend and is not balanced", c.name);
            }
            c.backend.is_some()
        })
        .collect();
    if sorted.len() < 2 {
        return Err(GateFailure::NotEnoughContainers);
    }
    sorted.sort_by(|a, b| {
        b.weighted_usage()
            .partial_cmp(&a.weighted_usage())
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.name.cmp(&b.name))
    });

    let most = sorted[0];
    let least = sorted
        .iter()
        .rev()
        .find(|c| c.name != most.name && c.backend != most.backend)
        .copied()
        .ok_or(GateFailure::NoOtherBackend)?;

    let most_usage = most.usage_percent();
    let least_usage = least.usage_percent();
    if most_usage <= cfg.max_usage_percent {
        return Err(GateFailure::MostUsedBelowMax { usage: most_usage });
    }
    if least_usage >= cfg.min_usage_percent {
        return Err(GateFailure::LeastUsedAboveMin { usage: least_usage });
    }
    let least_free_gb = least.free_bytes() / GIB;
    if least_free_gb <= cfg.min_free_gb {
        return Err(GateFailure::LeastUsedTooFull {
            free_gb: least_free_gb,
        });
    }
    let difference = most_usage - least_usage;
    if difference <= cfg.min_max_difference_percent {
        return Err(GateFailure::DifferenceTooSmall { difference });
    }

    let target = cfg.max_usage_percent - cfg.max_threshold_hysteresis_percent;
    let target_used = (most.capacity_bytes as f64 * target / 100.0) as u64;
    let bytes_to_move = most.used_bytes.saturating_sub(target_used);

    let min_size = cfg.lun_min_size_gb * GIB;
    let max_size = cfg.lun_max_size_gb * GIB;
    let mut pool: Vec<&MoveCandidate> = candidates
        .iter()
        .filter(|c| c.container == most.name)
        .filter(|c| c.size_bytes >= min_size && c.size_bytes <= max_size)
        .collect();
    pool.sort_by(|a, b| b.size_bytes.cmp(&a.size_bytes).then(a.vm.cmp(&b.vm)));

    let to_datastore = least
        .target_datastore
        .clone()
        .unwrap_or_else(|| least.name.clone());
    let mut most_used = most.used_bytes;
    let mut least_used = least.used_bytes;
    let mut remaining = bytes_to_move as i128;
    let mut moves = Vec::new();

    for candidate in pool {
        if remaining <= 0 {
            break;
        }
        if least.usage_with(least_used + candidate.size_bytes) > target {
            break;
        }
        most_used = most_used.saturating_sub(candidate.size_bytes);
        least_used += candidate.size_bytes;
        remaining -= candidate.size_bytes as i128;
        moves.push(PlannedMove {
            candidate: candidate.clone(),
            from: most.name.clone(),
            to: least.name.clone(),
            to_datastore: to_datastore.clone(),
        });
    }
    tracing::debug!(
        "balance {} -> {}: {} moves, source projected at {:.1}%",
        most.name,
        least.name,
        moves.len(),
        most.usage_with(most_used)
    );

    Ok(BalancePlan {
        most_used: most.name.clone(),
        least_used: least.name.clone(),
        target_usage_percent: target,
        bytes_to_move,
        moves,
    })
}
