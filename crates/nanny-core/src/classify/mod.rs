//! Fault classifiers.
//!
//! Each classifier turns joined records into [`Fault`]s of one category. A
//! classifier abstains (emits nothing, or a report-only fault) whenever the
//! view it would need to justify a repair is unavailable.

pub mod attachment;
pub mod integrity;
pub mod state;
pub mod vmgr;

use crate::fault::{EntityKey, Fault, FaultCategory};
use std::collections::HashSet;

/// Keep the first fault per (entity, category). Classifiers emit in
/// precedence order, so earlier faults win.
pub fn one_per_category(faults: Vec<Fault>) -> Vec<Fault> {
    let mut seen: HashSet<(EntityKey, FaultCategory)> = HashSet::new();
    faults
        .into_iter()
        .filter(|f| seen.insert((f.entity.clone(), f.category())))
        .collect()
}
