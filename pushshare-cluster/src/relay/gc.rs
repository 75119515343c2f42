use std::collections::{HashMap, HashSet};

use pushshare_core::models::InstanceId;

/// Consecutive-miss counter for instances the server reports but no live
/// member claims
///
/// An id missing from the membership for more than `threshold` consecutive
/// frames is reported once and forgotten, so counting restarts from zero.
#[derive(Debug, Clone)]
pub struct UnknownInstanceTracker {
    threshold: u32,
    misses: HashMap<InstanceId, u32>,
}

impl UnknownInstanceTracker {
    #[must_use]
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold,
            misses: HashMap::new(),
        }
    }

    /// Count one frame's reported ids against the known set, returning the
    /// ids that crossed the threshold
    pub fn observe<'a>(
        &mut self,
        reported: impl IntoIterator<Item = &'a InstanceId>,
        known: &HashSet<InstanceId>,
    ) -> Vec<InstanceId> {
        let mut collect = Vec::new();
        for id in reported {
            if known.contains(id) {
                self.misses.remove(id);
                continue;
            }
            let count = self.misses.entry(id.clone()).or_insert(0);
            *count += 1;
            if *count > self.threshold {
                self.misses.remove(id);
                collect.push(id.clone());
            }
        }
        collect
    }

    /// Current miss count; `None` means zero
    #[must_use]
    pub fn misses(&self, id: &InstanceId) -> Option<u32> {
        self.misses.get(id).copied()
    }

    /// Number of ids with a running count
    #[must_use]
    pub fn tracked(&self) -> usize {
        self.misses.len()
    }

    pub fn clear(&mut self) {
        self.misses.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reports_once_after_threshold_and_resets() {
        let mut tracker = UnknownInstanceTracker::new(3);
        let stale = InstanceId::from("I-stale");
        let known = HashSet::new();

        for _ in 0..3 {
            assert!(tracker.observe([&stale], &known).is_empty());
        }
        assert_eq!(tracker.observe([&stale], &known), vec![stale.clone()]);
        assert_eq!(tracker.misses(&stale), None);

        // Counting starts over
        for _ in 0..3 {
            assert!(tracker.observe([&stale], &known).is_empty());
        }
    }

    #[test]
    fn test_collected_ids_are_forgotten() {
        let mut tracker = UnknownInstanceTracker::new(2);
        let known = HashSet::new();
        let stale: Vec<InstanceId> = (0..50).map(|n| InstanceId::from(format!("I-{n}"))).collect();

        let mut collected = Vec::new();
        for _ in 0..3 {
            collected.extend(tracker.observe(stale.iter(), &known));
        }
        assert_eq!(collected.len(), stale.len());
        assert_eq!(tracker.tracked(), 0);

        tracker.observe([&stale[0]], &known);
        assert_eq!(tracker.tracked(), 1);
        assert_eq!(tracker.misses(&stale[0]), Some(1));
    }

    #[test]
    fn test_known_id_drops_counter() {
        let mut tracker = UnknownInstanceTracker::new(3);
        let id = InstanceId::from("I-late");

        tracker.observe([&id], &HashSet::new());
        tracker.observe([&id], &HashSet::new());
        assert_eq!(tracker.misses(&id), Some(2));

        let known: HashSet<InstanceId> = [id.clone()].into_iter().collect();
        assert!(tracker.observe([&id], &known).is_empty());
        assert_eq!(tracker.misses(&id), None);
    }

    #[test]
    fn test_ids_counted_independently() {
        let mut tracker = UnknownInstanceTracker::new(1);
        let a = InstanceId::from("A");
        let b = InstanceId::from("B");
        let known = HashSet::new();

        assert!(tracker.observe([&a], &known).is_empty());
        assert!(tracker.observe([&a, &b], &known) == vec![a.clone()]);
        assert_eq!(tracker.observe([&b], &known), vec![b]);
    }
}
