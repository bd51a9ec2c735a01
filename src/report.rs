//! Per-handle run reports.
//!
//! A [`RunReport`] is pure data: the runner builds one at the end of its
//! lifecycle, the attacker's `after_run` hook may annotate it, and the
//! manager persists it as one JSON document per run per handle. Re-reading a
//! persisted report yields identical metric values, which is what the
//! degradation comparator relies on.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::AttackConfig;
use crate::metrics::Metrics;

/// Published report format, one document per run per handle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RunReport {
    /// Start of the full attack phase.
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub configuration: AttackConfig,
    /// Per-label metrics buckets.
    pub metrics: HashMap<String, Metrics>,
    /// Set by the error check, or by the attacker's `after_run` hook.
    pub failed: bool,
    /// Free-form entries supplied by the attacker.
    pub output: HashMap<String, serde_json::Value>,
}

impl RunReport {
    pub(crate) fn new(
        started_at: DateTime<Utc>,
        configuration: AttackConfig,
        metrics: HashMap<String, Metrics>,
    ) -> Self {
        Self {
            started_at,
            finished_at: Utc::now(),
            configuration,
            metrics,
            failed: false,
            output: HashMap::new(),
        }
    }

    /// Whether any per-label bucket observed at least one error.
    pub fn has_errors(&self) -> bool {
        self.metrics.values().any(|m| m.errors > 0)
    }
}
