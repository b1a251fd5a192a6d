//! Plugin metrics surface
//!
//! Every plugin answers `get_metrics` with the same shape regardless of
//! transport: monotonic counters, point-in-time gauges, and fixed-bucket
//! histograms.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A fixed-bucket histogram
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Histogram {
    /// Upper bucket boundaries, ascending; an implicit +Inf bucket follows
    pub buckets: Vec<f64>,
    /// Observation count per bucket (`buckets.len() + 1` entries)
    pub counts: Vec<u64>,
    /// Total observations
    pub count: u64,
    /// Sum of all observed values
    pub sum: f64,
}

impl Histogram {
    /// Create an empty histogram with the given bucket boundaries
    #[must_use]
    pub fn new(buckets: Vec<f64>) -> Self {
        let counts = vec![0; buckets.len() + 1];
        Self {
            buckets,
            counts,
            count: 0,
            sum: 0.0,
        }
    }

    /// Record an observation into the first bucket whose boundary admits it
    pub fn observe(&mut self, value: f64) {
        let idx = self
            .buckets
            .iter()
            .position(|&bound| value <= bound)
            .unwrap_or(self.buckets.len());
        self.counts[idx] += 1;
        self.count += 1;
        self.sum += value;
    }
}

/// Metrics reported by a plugin
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsReport {
    /// Monotonic counters by name
    #[serde(default)]
    pub counters: BTreeMap<String, u64>,
    /// Current-value gauges by name
    #[serde(default)]
    pub gauges: BTreeMap<String, f64>,
    /// Histograms by name
    #[serde(default)]
    pub histograms: BTreeMap<String, Histogram>,
}

impl MetricsReport {
    /// Increment a counter, creating it at zero if absent
    pub fn incr_counter(&mut self, name: impl Into<String>, by: u64) {
        *self.counters.entry(name.into()).or_insert(0) += by;
    }

    /// Set a gauge to the given value
    pub fn set_gauge(&mut self, name: impl Into<String>, value: f64) {
        self.gauges.insert(name.into(), value);
    }

    /// Record an observation into a named histogram
    ///
    /// The histogram must have been inserted first; observations for unknown
    /// names are dropped.
    pub fn observe(&mut self, name: &str, value: f64) {
        if let Some(histogram) = self.histograms.get_mut(name) {
            histogram.observe(value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn histogram_places_observations_in_buckets() {
        let mut hist = Histogram::new(vec![0.01, 0.1, 1.0]);
        hist.observe(0.005);
        hist.observe(0.05);
        hist.observe(0.5);
        hist.observe(5.0);

        assert_eq!(hist.counts, vec![1, 1, 1, 1]);
        assert_eq!(hist.count, 4);
        assert!((hist.sum - 5.555).abs() < 1e-9);
    }

    #[test]
    fn boundary_value_lands_in_its_bucket() {
        let mut hist = Histogram::new(vec![1.0, 2.0]);
        hist.observe(1.0);
        assert_eq!(hist.counts, vec![1, 0, 0]);
    }

    #[test]
    fn counters_accumulate() {
        let mut report = MetricsReport::default();
        report.incr_counter("requests_total", 1);
        report.incr_counter("requests_total", 2);
        assert_eq!(report.counters["requests_total"], 3);
    }

    #[test]
    fn observe_unknown_histogram_is_dropped() {
        let mut report = MetricsReport::default();
        report.observe("latency_seconds", 0.2);
        assert!(report.histograms.is_empty());
    }
}
