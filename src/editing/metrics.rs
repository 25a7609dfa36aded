//! Running loss diagnostics
//!
//! Every guidance evaluation reports its terms here. Averages are logged once
//! per iteration and reset. Soft failures are counted, never raised.

use log::{info, warn};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::error::EditError;

/// Running sum and count of one diagnostic
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct RunningMean {
    pub sum: f64,
    pub count: u64,
}

impl RunningMean {
    pub fn update(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
    }

    pub fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }
}

#[derive(Debug, Clone, Default)]
pub struct LossAccumulator {
    metrics: BTreeMap<String, RunningMean>,
    soft_failures: BTreeMap<&'static str, u64>,
}

impl LossAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Non-finite values are dropped so one bad step cannot poison the averages
    pub fn update_metric(&mut self, name: &str, value: f64) {
        if !value.is_finite() {
            warn!("Ignoring non-finite {} value", name);
            return;
        }
        self.metrics.entry(name.to_string()).or_default().update(value);
    }

    pub fn record_soft_failure(&mut self, error: &EditError) {
        *self.soft_failures.entry(error.kind()).or_insert(0) += 1;
    }

    pub fn soft_failures(&self, kind: &str) -> u64 {
        self.soft_failures.get(kind).copied().unwrap_or(0)
    }

    pub fn average(&self, name: &str) -> Option<f64> {
        self.metrics.get(name).and_then(RunningMean::mean)
    }

    pub fn averages(&self) -> BTreeMap<String, f64> {
        self.metrics
            .iter()
            .filter_map(|(name, stat)| stat.mean().map(|mean| (name.clone(), mean)))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty() && self.soft_failures.is_empty()
    }

    /// Fold another accumulator in, as used by parallel iterations
    pub fn merge(&mut self, other: &LossAccumulator) {
        for (name, stat) in &other.metrics {
            let entry = self.metrics.entry(name.clone()).or_default();
            entry.sum += stat.sum;
            entry.count += stat.count;
        }
        for (kind, count) in &other.soft_failures {
            *self.soft_failures.entry(kind).or_insert(0) += count;
        }
    }

    pub fn reset(&mut self) {
        self.metrics.clear();
        self.soft_failures.clear();
    }

    /// Log every average and soft-failure count, then reset
    pub fn log_averages(&mut self, label: &str) {
        for (name, mean) in self.averages() {
            info!("{} {}: {:.6}", label, name, mean);
        }
        for (kind, count) in &self.soft_failures {
            warn!("{} soft failure {}: {} occurrence(s)", label, kind, count);
        }
        self.reset();
    }
}
