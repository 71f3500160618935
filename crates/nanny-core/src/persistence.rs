//! Consecutive-sighting filter.
//!
//! A fault on `(entity, kind)` becomes a candidate once it has been reported
//! in `threshold` consecutive cycles. A pair that is not reported in a cycle
//! is forgotten at the end of that cycle.

use crate::fault::{EntityKey, Fault, FaultKind};
use std::collections::{HashMap, HashSet};

/// Outcome of one pass through the filter.
#[derive(Debug, Default)]
pub struct Sifted {
    /// Faults that reached the threshold this cycle.
    pub candidates: Vec<Fault>,
    /// Faults still below the threshold, with their current count.
    pub pending: Vec<(Fault, u32)>,
}

#[derive(Debug)]
pub struct PersistenceFilter {
    threshold: u32,
    counters: HashMap<(EntityKey, FaultKind), u32>,
}

impl PersistenceFilter {
    /// `threshold` is clamped to at least 1.
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            counters: HashMap::new(),
        }
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    pub fn count(&self, entity: &EntityKey, kind: FaultKind) -> u32 {
        self.counters
            .get(&(entity.clone(), kind))
            .copied()
            .unwrap_or(0)
    }

    pub fn tracked(&self) -> usize {
        self.counters.len()
    }

    /// Record this cycle's faults. Duplicate `(entity, kind)` reports within
    /// one cycle count once.
    pub fn observe(&mut self, faults: Vec<Fault>) -> Sifted {
        let mut seen: HashSet<(EntityKey, FaultKind)> = HashSet::new();
        let mut sifted = Sifted::default();

        for fault in faults {
            let key = (fault.entity.clone(), fault.kind);
            if !seen.insert(key.clone()) {
                continue;
            }
            let counter = self.counters.entry(key).or_insert(0);
            *counter = counter.saturating_add(1);
            if *counter >= self.threshold {
                sifted.candidates.push(fault);
            } else {
                let n = *counter;
                sifted.pending.push((fault, n));
            }
        }

        self.counters.retain(|k, _| seen.contains(k));
        sifted
    }

    /// Drop the counter of a pair whose repair was applied.
    pub fn forget(&mut self, entity: &EntityKey, kind: FaultKind) {
        self.counters.remove(&(entity.clone(), kind));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn fault(entity: &str) -> Fault {
        Fault::report(
            FaultKind::A6OrphanAttachmentRow,
            EntityKey(entity.to_string()),
            "test",
        )
    }

    #[test]
    fn test_promotes_on_nth_cycle() {
        let mut filter = PersistenceFilter::new(3);
        assert!(filter.observe(vec![fault("a")]).candidates.is_empty());
        assert!(filter.observe(vec![fault("a")]).candidates.is_empty());
        let third = filter.observe(vec![fault("a")]);
        assert_eq!(third.candidates.len(), 1);
        assert!(third.pending.is_empty());
    }

    #[test]
    fn test_gap_resets_counter() {
        let mut filter = PersistenceFilter::new(3);
        filter.observe(vec![fault("a")]);
        filter.observe(vec![fault("a")]);
        filter.observe(vec![]);
        assert_eq!(
            filter.count(&EntityKey("a".to_string()), FaultKind::A6OrphanAttachmentRow),
            0
        );
        let next = filter.observe(vec![fault("a")]);
        assert_eq!(next.pending[0].1, 1);
    }

    #[test]
    fn test_duplicates_in_one_cycle_count_once() {
        let mut filter = PersistenceFilter::new(2);
        let sifted = filter.observe(vec![fault("a"), fault("a")]);
        assert_eq!(sifted.pending.len(), 1);
        assert!(sifted.candidates.is_empty());
    }

    #[test]
    fn test_zero_threshold_clamped() {
        let mut filter = PersistenceFilter::new(0);
        assert_eq!(filter.threshold(), 1);
        assert_eq!(filter.observe(vec![fault("a")]).candidates.len(), 1);
    }

    proptest! {
        #[test]
        fn prop_n_minus_one_sightings_never_promote(n in 1u32..8) {
            let mut filter = PersistenceFilter::new(n);
            for _ in 0..n - 1 {
                prop_assert!(filter.observe(vec![fault("x")]).candidates.is_empty());
            }
            filter.observe(vec![]);
            prop_assert_eq!(filter.tracked(), 0);
        }

        #[test]
        fn prop_n_sightings_promote_on_nth(n in 1u32..8) {
            let mut filter = PersistenceFilter::new(n);
            for cycle in 1..=n {
                let sifted = filter.observe(vec![fault("x")]);
                prop_assert_eq!(sifted.candidates.len() == 1, cycle == n);
            }
        }
    }
}
