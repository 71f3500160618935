//! The five nannies. Each one is a [`Nanny`](crate::driver::Nanny) that
//! snapshots its upstreams and turns them into faults and proposals for the
//! loop driver.

pub mod bigvm;
pub mod integrity;
pub mod storage_balance;
pub mod vcenter;
pub mod volume;

pub use bigvm::BigVmNanny;
pub use integrity::IntegrityNanny;
pub use storage_balance::StorageBalanceNanny;
pub use vcenter::VcenterNanny;
pub use volume::VolumeNanny;

use crate::error::{NannyError, Result};
use crate::snapshot::{CycleSnapshot, View};

/// A view this nanny cannot work without.
fn required<'a, T>(view: &'a View<T>, upstream: &str) -> Result<&'a T> {
    match view {
        View::Available(v) => Ok(v),
        View::Unavailable { reason } => Err(NannyError::unavailable(upstream, reason)),
        View::NotRequested => Err(NannyError::NotConfigured(upstream.to_string())),
    }
}

fn unavailable(snapshot: &CycleSnapshot) -> Vec<String> {
    snapshot
        .unavailable_upstreams()
        .into_iter()
        .map(str::to_string)
        .collect()
}
