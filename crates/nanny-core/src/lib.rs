//! Nanny fleet core: snapshots of the compute, storage and virtualization
//! views, fault classification, persistence-gated repair under per-kind caps,
//! and the storage and host-memory balancers.

pub mod balance;
pub mod classify;
pub mod driver;
pub mod error;
pub mod events;
pub mod executor;
pub mod fault;
pub mod ident;
pub mod join;
pub mod metrics;
pub mod model;
pub mod nannies;
pub mod persistence;
pub mod planner;
pub mod repair;
pub mod snapshot;
pub mod tables;

pub use driver::{DriverConfig, IterationContext, LoopDriver, Nanny, Observation};
pub use error::{NannyError, Result};
pub use events::{EventBus, ManualCheck};
pub use executor::{Executor, Repairers};
pub use fault::{EntityKey, Fault, FaultKind};
pub use metrics::NannyMetrics;
pub use planner::CapPolicy;
pub use snapshot::Snapshotter;
