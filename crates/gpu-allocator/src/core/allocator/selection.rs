//! Device selection strategies.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::core::lock;
use crate::core::types::DeviceUsage;

/// How to choose among devices that can all take a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SelectionStrategy {
    /// Lowest device id.
    FirstFit,
    /// Lowest fit score, packs work onto the least used device.
    #[default]
    BestFit,
    /// Highest fit score, consolidates onto already busy devices.
    WorstFit,
    /// Next device id after the previous pick, wrapping around.
    RoundRobin,
    /// Lowest load score.
    LoadBalanced,
}

/// Applies a [`SelectionStrategy`] and remembers the round-robin position.
#[derive(Debug, Default)]
pub struct Selector {
    last_pick: Mutex<Option<String>>,
}

impl Selector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Choose one of `candidates`. Ties resolve to the lowest device id.
    pub fn pick(
        &self,
        strategy: SelectionStrategy,
        mut candidates: Vec<DeviceUsage>,
    ) -> Option<DeviceUsage> {
        candidates.sort_by(|a, b| a.device_id.cmp(&b.device_id));

        match strategy {
            SelectionStrategy::FirstFit => candidates.into_iter().next(),
            SelectionStrategy::BestFit => candidates
                .into_iter()
                .min_by(|a, b| a.fit_score().total_cmp(&b.fit_score())),
            SelectionStrategy::WorstFit => candidates
                .into_iter()
                .min_by(|a, b| b.fit_score().total_cmp(&a.fit_score())),
            SelectionStrategy::LoadBalanced => candidates
                .into_iter()
                .min_by(|a, b| a.load_score().total_cmp(&b.load_score())),
            SelectionStrategy::RoundRobin => self.next_in_rotation(candidates),
        }
    }

    fn next_in_rotation(&self, candidates: Vec<DeviceUsage>) -> Option<DeviceUsage> {
        let mut last_pick = lock::lock(&self.last_pick);
        let position = last_pick
            .as_deref()
            .and_then(|last| candidates.iter().position(|c| c.device_id.as_str() > last))
            .unwrap_or(0);
        let chosen = candidates.into_iter().nth(position)?;
        *last_pick = Some(chosen.device_id.clone());
        Some(chosen)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Share;

    fn usage(device_id: &str, millis: u32, memory_used_mib: u64, allocations: usize) -> DeviceUsage {
        DeviceUsage {
            device_id: device_id.to_string(),
            share_used: Share::from_millis(millis),
            memory_used_mib,
            memory_total_mib: 1000,
            active_allocations: allocations,
            free_xcds: None,
        }
    }

    fn devices() -> Vec<DeviceUsage> {
        vec![
            usage("card2", 500, 500, 1),
            usage("card0", 800, 100, 1),
            usage("card1", 200, 100, 4),
        ]
    }

    fn pick(selector: &Selector, strategy: SelectionStrategy) -> String {
        selector.pick(strategy, devices()).unwrap().device_id
    }

    #[test]
    fn scored_strategies() {
        let selector = Selector::new();
        assert_eq!(pick(&selector, SelectionStrategy::FirstFit), "card0");
        // fit: card0 0.52, card1 0.16, card2 0.5
        assert_eq!(pick(&selector, SelectionStrategy::BestFit), "card1");
        assert_eq!(pick(&selector, SelectionStrategy::WorstFit), "card0");
        // load: card0 0.59, card1 0.26, card2 0.38
        assert_eq!(pick(&selector, SelectionStrategy::LoadBalanced), "card1");
    }

    #[test]
    fn round_robin_rotates_and_wraps() {
        let selector = Selector::new();
        let picks = (0..4)
            .map(|_| pick(&selector, SelectionStrategy::RoundRobin))
            .collect::<Vec<_>>();
        assert_eq!(picks, ["card0", "card1", "card2", "card0"]);
    }

    #[test]
    fn round_robin_skips_devices_that_dropped_out() {
        let selector = Selector::new();
        assert_eq!(pick(&selector, SelectionStrategy::RoundRobin), "card0");

        let without_card1 = vec![usage("card0", 0, 0, 0), usage("card2", 0, 0, 0)];
        let next = selector
            .pick(SelectionStrategy::RoundRobin, without_card1)
            .unwrap();
        assert_eq!(next.device_id, "card2");
    }

    #[test]
    fn ties_resolve_to_lowest_id() {
        let selector = Selector::new();
        let same = vec![usage("card1", 0, 0, 0), usage("card0", 0, 0, 0)];
        let chosen = selector.pick(SelectionStrategy::WorstFit, same).unwrap();
        assert_eq!(chosen.device_id, "card0");
        assert!(selector.pick(SelectionStrategy::BestFit, Vec::new()).is_none());
    }
}
