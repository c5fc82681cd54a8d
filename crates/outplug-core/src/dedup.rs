//! Metric registry: remembers which metric definitions the plugin has
//! already been sent.

use std::collections::{HashMap, HashSet};

use crate::harness::{HarnessSample, Thresholds};
use crate::protocol::Metric;
use crate::protocol::mapping::map_metric;

/// Seen-set and threshold snapshot for one extension instance.
#[derive(Debug, Default)]
pub struct MetricRegistry {
    seen: HashSet<String>,
    thresholds: HashMap<String, Thresholds>,
}

impl MetricRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the threshold snapshot. An empty map leaves the current
    /// snapshot in place.
    pub fn set_thresholds(&mut self, thresholds: HashMap<String, Thresholds>) {
        if thresholds.is_empty() {
            return;
        }
        self.thresholds = thresholds;
    }

    pub fn thresholds_for(&self, metric: &str) -> Option<&Thresholds> {
        self.thresholds.get(metric)
    }

    /// Definition for `sample`'s metric the first time it is seen, `None`
    /// afterwards.
    pub fn resolve(&mut self, sample: &HarnessSample) -> Option<Metric> {
        let name = &sample.metric.name;
        if self.seen.contains(name) {
            return None;
        }
        let metric = map_metric(&sample.metric, self.thresholds.get(name));
        self.seen.insert(name.clone());
        Some(metric)
    }

    #[cfg(test)]
    fn is_seen(&self, metric: &str) -> bool {
        self.seen.contains(metric)
    }

    /// Number of metric definitions resolved so far.
    #[cfg(test)]
    fn len(&self) -> usize {
        self.seen.len()
    }
}
