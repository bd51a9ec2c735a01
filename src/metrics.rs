//! Per-label metrics aggregation.
//!
//! A [`Metrics`] value accumulates the raw, mergeable data for one request
//! label within one handle: counters, the observed time window, and a latency
//! histogram. Derived statistics (percentiles, mean, achieved rate) are
//! snapshotted into the serializable [`LatencySummary`] by
//! [`Metrics::update_latencies`] before a report is built; the histogram
//! itself never leaves the process.
//!
//! Metrics are mutated only by the runner's single result collector.

use std::time::Duration;

use chrono::{DateTime, Utc};
use hdrhistogram::Histogram;
use serde::{Deserialize, Serialize};

use crate::attack::AttackResult;

/// Latency distribution snapshot, in wall time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LatencySummary {
    pub p50: Duration,
    pub p95: Duration,
    pub p99: Duration,
    pub mean: Duration,
}

/// Counters and latency distribution for one request label.
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Metrics {
    pub requests: u64,
    pub errors: u64,
    /// Achieved requests per second over the observed window.
    pub rate: f64,
    pub latencies: LatencySummary,
    /// Begin stamp of the earliest observed result.
    pub first_begin: Option<DateTime<Utc>>,
    /// End stamp of the latest observed result.
    pub last_end: Option<DateTime<Utc>>,
    #[serde(skip, default = "new_histogram")]
    histogram: Histogram<u64>,
}

fn new_histogram() -> Histogram<u64> {
    // Three significant figures, auto-resizing; records elapsed microseconds.
    Histogram::new(3).expect("sigfig within histogram bounds")
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics")
            .field("requests", &self.requests)
            .field("errors", &self.errors)
            .field("rate", &self.rate)
            .field("latencies", &self.latencies)
            .field("first_begin", &self.first_begin)
            .field("last_end", &self.last_end)
            .finish_non_exhaustive()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            requests: 0,
            errors: 0,
            rate: 0.0,
            latencies: LatencySummary::default(),
            first_begin: None,
            last_end: None,
            histogram: new_histogram(),
        }
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one result record into the counters and histogram.
    pub(crate) fn add(&mut self, r: &AttackResult) {
        self.requests += 1;
        if r.do_result.is_error() {
            self.errors += 1;
        }
        self.histogram
            .record(r.elapsed.as_micros().min(u128::from(u64::MAX)) as u64)
            .ok();
        if self.first_begin.map_or(true, |earliest| r.begin < earliest) {
            self.first_begin = Some(r.begin);
        }
        if self.last_end.map_or(true, |latest| r.end > latest) {
            self.last_end = Some(r.end);
        }
    }

    /// Snapshot the histogram into the serializable summary and recompute
    /// the achieved rate. Called once per bucket before a report is built,
    /// and on the slice-local bucket after each ramp-up second.
    pub fn update_latencies(&mut self) {
        if self.requests == 0 {
            return;
        }
        self.latencies = LatencySummary {
            p50: Duration::from_micros(self.histogram.value_at_quantile(0.50)),
            p95: Duration::from_micros(self.histogram.value_at_quantile(0.95)),
            p99: Duration::from_micros(self.histogram.value_at_quantile(0.99)),
            mean: Duration::from_secs_f64(self.histogram.mean() / 1e6),
        };
        if let (Some(begin), Some(end)) = (self.first_begin, self.last_end) {
            let window = (end - begin)
                .to_std()
                .unwrap_or(Duration::ZERO)
                .as_secs_f64();
            if window > 0.0 {
                self.rate = self.requests as f64 / window;
            }
        }
    }

    /// Share of non-error requests, as a percentage.
    pub fn success_ratio(&self) -> f64 {
        if self.requests == 0 {
            return 0.0;
        }
        (self.requests - self.errors) as f64 / self.requests as f64 * 100.0
    }
}
