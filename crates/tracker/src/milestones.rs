use std::collections::BTreeSet;

use core_model::MILESTONE_THRESHOLDS_MS;

/// Sorted duration cutoffs plus the set already announced this session.
/// Each cutoff fires at most once until `reset`.
#[derive(Debug, Clone)]
pub struct MilestoneTracker {
    thresholds: Vec<u64>,
    notified: BTreeSet<u64>,
}

impl Default for MilestoneTracker {
    fn default() -> Self {
        Self::new(MILESTONE_THRESHOLDS_MS)
    }
}

impl MilestoneTracker {
    pub fn new(thresholds: impl IntoIterator<Item = u64>) -> Self {
        let mut thresholds: Vec<u64> = thresholds.into_iter().collect();
        thresholds.sort_unstable();
        thresholds.dedup();
        Self {
            thresholds,
            notified: BTreeSet::new(),
        }
    }

    /// Thresholds newly reached at `elapsed_ms`, ascending.
    pub fn check(&mut self, elapsed_ms: u64) -> Vec<u64> {
        let mut reached = Vec::new();
        for &threshold in &self.thresholds {
            if threshold > elapsed_ms {
                break;
            }
            if self.notified.insert(threshold) {
                reached.push(threshold);
            }
        }
        reached
    }

    pub fn mark_notified(&mut self, threshold: u64) {
        self.notified.insert(threshold);
    }

    pub fn notified(&self) -> impl Iterator<Item = u64> + '_ {
        self.notified.iter().copied()
    }

    pub fn reset(&mut self) {
        self.notified.clear();
    }
}
