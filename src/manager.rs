//! The load manager: shared state of one suite run.
//!
//! The manager owns the per-handle report map, the fixture store, the report
//! directory and the suite-level `failed` / `degradation` flags. Runners get
//! an `Arc` to it; every mutation goes through a mutex or an atomic, so the
//! manager itself carries no interior surprises. There are no package-level
//! globals: construct, run, shut down.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use chrono::Utc;
use thiserror::Error;
use tracing::{info, warn};

use crate::attack::AttackError;
use crate::config::{AttackConfig, ConfigError, SuiteConfig};
use crate::fixture::{FixtureError, FixtureReader, FixtureWriter};
use crate::report::RunReport;

/// Fatal suite-level failures. Attacker `do_attack` errors are not here;
/// they are recorded in the metrics and surface through the exit code.
#[derive(Debug, Error)]
pub enum SuiteError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Fixture(#[from] FixtureError),
    #[error("BeforeRun failed for handle [{handle}]: {source}")]
    BeforeRun {
        handle: String,
        source: AttackError,
    },
    #[error("AfterRun failed for handle [{handle}]: {source}")]
    AfterRun {
        handle: String,
        source: AttackError,
    },
    #[error("report store: {0}")]
    Io(#[from] std::io::Error),
    #[error("report encoding: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("exit signal received")]
    Interrupted,
}

/// Shared suite state handed to every runner and attacker.
pub struct LoadManager {
    reports: Mutex<HashMap<String, RunReport>>,
    readers: Mutex<HashMap<String, FixtureReader>>,
    writers: Mutex<HashMap<String, FixtureWriter>>,
    report_dir: PathBuf,
    degradation_threshold: f64,
    failed: AtomicBool,
    degradation: AtomicBool,
    root_keys: Option<String>,
    root_ref: Option<String>,
    http_timeout: Option<std::time::Duration>,
}

impl LoadManager {
    /// Create a manager persisting reports under `report_dir`, which is
    /// created if missing.
    pub fn new(report_dir: impl Into<PathBuf>, degradation_threshold: f64) -> Result<Self, SuiteError> {
        let report_dir = report_dir.into();
        fs::create_dir_all(&report_dir)?;
        Ok(Self {
            reports: Mutex::new(HashMap::new()),
            readers: Mutex::new(HashMap::new()),
            writers: Mutex::new(HashMap::new()),
            report_dir,
            degradation_threshold,
            failed: AtomicBool::new(false),
            degradation: AtomicBool::new(false),
            root_keys: None,
            root_ref: None,
            http_timeout: None,
        })
    }

    pub fn from_suite_config(cfg: &SuiteConfig) -> Result<Self, SuiteError> {
        let mut manager = Self::new(cfg.report_dir.clone(), cfg.checks.handle_threshold)?;
        manager.root_keys = cfg.root_keys.clone();
        manager.root_ref = cfg.root_ref.clone();
        manager.http_timeout = cfg.http_timeout_sec.map(std::time::Duration::from_secs);
        Ok(manager)
    }

    pub fn report_dir(&self) -> &Path {
        &self.report_dir
    }

    /// Root credentials from the suite configuration, for attacker setup.
    pub fn root_keys(&self) -> Option<&str> {
        self.root_keys.as_deref()
    }

    pub fn root_ref(&self) -> Option<&str> {
        self.root_ref.as_deref()
    }

    /// Suite-wide default timeout for protocol clients that want one.
    pub fn http_timeout(&self) -> Option<std::time::Duration> {
        self.http_timeout
    }

    pub fn failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    pub fn degradation(&self) -> bool {
        self.degradation.load(Ordering::SeqCst)
    }

    /// Open the fixtures a handle is wired to. Called right before the
    /// handle runs, so a sequenced handle can read a file written by its
    /// predecessor.
    pub fn setup_handle_store(&self, config: &AttackConfig) -> Result<(), FixtureError> {
        if let Some(name) = config.read_fixture() {
            info!(handle = %config.name, file = %name, "opening read fixture");
            let reader = FixtureReader::open(name, config.recycle_data)?;
            self.readers
                .lock()
                .expect("fixture store lock poisoned")
                .insert(config.name.clone(), reader);
        }
        if let Some(name) = config.write_fixture() {
            info!(handle = %config.name, file = %name, "creating write fixture");
            let writer = FixtureWriter::create(name)?;
            self.writers
                .lock()
                .expect("fixture store lock poisoned")
                .insert(config.name.clone(), writer);
        }
        Ok(())
    }

    /// Next record from the handle's read fixture; `None` once a
    /// non-recycling reader is exhausted.
    pub fn read_record(&self, handle: &str) -> Result<Option<Vec<String>>, FixtureError> {
        let mut readers = self.readers.lock().expect("fixture store lock poisoned");
        let reader = readers
            .get_mut(handle)
            .ok_or_else(|| FixtureError::UnknownHandle(handle.to_string()))?;
        Ok(reader.next_record())
    }

    /// Append one record to the handle's write fixture.
    pub fn write_record(&self, handle: &str, fields: &[String]) -> Result<(), FixtureError> {
        let mut writers = self.writers.lock().expect("fixture store lock poisoned");
        let writer = writers
            .get_mut(handle)
            .ok_or_else(|| FixtureError::UnknownHandle(handle.to_string()))?;
        writer.append(fields)
    }

    pub(crate) fn insert_report(&self, handle: String, report: RunReport) {
        self.reports
            .lock()
            .expect("report map lock poisoned")
            .insert(handle, report);
    }

    /// Clone of the stored report for one handle, if any.
    pub fn report_for(&self, handle: &str) -> Option<RunReport> {
        self.reports
            .lock()
            .expect("report map lock poisoned")
            .get(handle)
            .cloned()
    }

    /// Set the suite `failed` flag when any per-label bucket of any handle
    /// observed at least one error.
    pub fn check_errors(&self) {
        let reports = self.reports.lock().expect("report map lock poisoned");
        for (handle, report) in reports.iter() {
            if report.has_errors() {
                warn!(handle = %handle, "errors recorded during run");
                self.failed.store(true, Ordering::SeqCst);
            }
        }
    }

    /// Compare every handle's p50 against its last successful run. A handle
    /// whose `current / baseline` ratio reaches the configured threshold
    /// marks the whole suite degraded; the baseline pointer is then left
    /// untouched by [`LoadManager::store_handle_reports`].
    pub fn check_degradation(&self) {
        let reports = self.reports.lock().expect("report map lock poisoned");
        for (handle, current) in reports.iter() {
            let baseline = match self.last_success_report(handle) {
                Ok(Some(report)) => report,
                Ok(None) => {
                    info!(
                        handle = %handle,
                        dir = %self.report_dir.display(),
                        "nothing to compare, no previous report"
                    );
                    continue;
                }
                Err(err) => {
                    warn!(handle = %handle, error = %err, "unable to load baseline report");
                    continue;
                }
            };
            let (Some(current_bucket), Some(baseline_bucket)) =
                (current.metrics.get(handle), baseline.metrics.get(handle))
            else {
                warn!(handle = %handle, "no metrics bucket under the handle label, skipping degradation check");
                continue;
            };
            let current_ms = current_bucket.latencies.p50.as_secs_f64() * 1e3;
            let baseline_ms = baseline_bucket.latencies.p50.as_secs_f64() * 1e3;
            if baseline_ms <= 0.0 {
                warn!(handle = %handle, "baseline p50 is zero, skipping degradation check");
                continue;
            }
            let ratio = current_ms / baseline_ms;
            info!(
                handle = %handle,
                current_ms,
                baseline_ms,
                ratio,
                "degradation check"
            );
            if ratio >= self.degradation_threshold {
                warn!(handle = %handle, current_ms, baseline_ms, "p50 degradation");
                self.degradation.store(true, Ordering::SeqCst);
            }
        }
    }

    /// Persist one `<handle>-<unix-seconds>.json` per report. When the suite
    /// neither failed nor degraded, the `<handle>_last` pointer is updated
    /// so the next run compares against this one.
    pub fn store_handle_reports(&self) -> Result<(), SuiteError> {
        let ts = Utc::now().timestamp();
        let reports = self.reports.lock().expect("report map lock poisoned");
        for (handle, report) in reports.iter() {
            let body = serde_json::to_string_pretty(report)?;
            let path = self.report_dir.join(format!("{handle}-{ts}.json"));
            info!(handle = %handle, path = %path.display(), "writing report");
            fs::write(&path, body)?;
            if !self.degradation() && !self.failed() {
                self.write_last_success(handle, ts)?;
            }
        }
        Ok(())
    }

    /// Record `ts` as the handle's last successful run.
    pub fn write_last_success(&self, handle: &str, ts: i64) -> Result<(), SuiteError> {
        let path = self.report_dir.join(format!("{handle}_last"));
        fs::write(path, ts.to_string())?;
        Ok(())
    }

    /// Load the report referenced by `<handle>_last`, or `None` when no
    /// baseline exists yet.
    pub fn last_success_report(&self, handle: &str) -> Result<Option<RunReport>, SuiteError> {
        let marker = self.report_dir.join(format!("{handle}_last"));
        let ts = match fs::read_to_string(&marker) {
            Ok(raw) => raw.trim().to_string(),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let path = self.report_dir.join(format!("{handle}-{ts}.json"));
        let body = fs::read_to_string(path)?;
        let report = serde_json::from_str(&body)?;
        Ok(Some(report))
    }

    /// Flush and close every fixture writer. Called on normal termination
    /// and on an exit signal.
    pub fn shutdown(&self) {
        let mut writers = self.writers.lock().expect("fixture store lock poisoned");
        for (handle, writer) in writers.iter_mut() {
            if let Err(err) = writer.flush() {
                warn!(handle = %handle, error = %err, "failed to flush fixture writer");
            }
        }
        writers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::testing::minimal;
    use crate::metrics::Metrics;
    use std::time::Duration;

    fn manager(dir: &tempfile::TempDir, threshold: f64) -> LoadManager {
        LoadManager::new(dir.path(), threshold).unwrap()
    }

    fn report_with_p50(handle: &str, p50: Duration) -> RunReport {
        let mut bucket = Metrics::new();
        bucket.requests = 10;
        bucket.latencies.p50 = p50;
        let mut metrics = HashMap::new();
        metrics.insert(handle.to_string(), bucket);
        RunReport::new(Utc::now(), minimal(handle), metrics)
    }

    #[test]
    fn stores_report_and_last_success_marker() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(&dir, 2.0);
        m.insert_report("h".into(), report_with_p50("h", Duration::from_millis(10)));
        m.store_handle_reports().unwrap();

        let marker = fs::read_to_string(dir.path().join("h_last")).unwrap();
        let ts: i64 = marker.trim().parse().unwrap();
        assert!(dir.path().join(format!("h-{ts}.json")).exists());

        let baseline = m.last_success_report("h").unwrap().unwrap();
        assert_eq!(
            baseline.metrics["h"].latencies.p50,
            Duration::from_millis(10)
        );
    }

    #[test]
    fn missing_baseline_is_not_a_failure() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(&dir, 2.0);
        m.insert_report("h".into(), report_with_p50("h", Duration::from_millis(10)));
        m.check_degradation();
        assert!(!m.degradation());
    }

    #[test]
    fn degradation_detected_and_baseline_kept() {
        let dir = tempfile::tempdir().unwrap();

        // Seed a baseline with p50 = 10ms under ts 100.
        let baseline = report_with_p50("h", Duration::from_millis(10));
        fs::write(
            dir.path().join("h-100.json"),
            serde_json::to_string_pretty(&baseline).unwrap(),
        )
        .unwrap();
        fs::write(dir.path().join("h_last"), "100").unwrap();

        let m = manager(&dir, 2.0);
        m.insert_report("h".into(), report_with_p50("h", Duration::from_millis(40)));
        m.check_degradation();
        assert!(m.degradation());

        // The pointer must survive a degraded store untouched.
        m.store_handle_reports().unwrap();
        assert_eq!(fs::read_to_string(dir.path().join("h_last")).unwrap(), "100");
    }

    #[test]
    fn ratio_below_threshold_is_not_degradation() {
        let dir = tempfile::tempdir().unwrap();
        let baseline = report_with_p50("h", Duration::from_millis(10));
        fs::write(
            dir.path().join("h-100.json"),
            serde_json::to_string_pretty(&baseline).unwrap(),
        )
        .unwrap();
        fs::write(dir.path().join("h_last"), "100").unwrap();

        let m = manager(&dir, 2.0);
        m.insert_report("h".into(), report_with_p50("h", Duration::from_millis(15)));
        m.check_degradation();
        assert!(!m.degradation());
    }

    #[test]
    fn errors_flip_the_failed_flag_and_block_the_marker() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(&dir, 2.0);
        let mut report = report_with_p50("h", Duration::from_millis(10));
        report.metrics.get_mut("h").unwrap().errors = 3;
        m.insert_report("h".into(), report);
        m.check_errors();
        assert!(m.failed());

        m.store_handle_reports().unwrap();
        assert!(!dir.path().join("h_last").exists());
    }

    #[test]
    fn fixture_records_route_by_handle_name() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(&dir, 2.0);

        let write_path = dir.path().join("out.csv");
        let mut cfg = minimal("writer");
        cfg.csv_write = Some(write_path.to_string_lossy().into_owned());
        m.setup_handle_store(&cfg).unwrap();

        m.write_record("writer", &["1".into(), "one".into()]).unwrap();
        m.write_record("writer", &["2".into(), "two".into()]).unwrap();
        m.shutdown();

        let mut cfg = minimal("reader");
        cfg.csv_read = Some(write_path.to_string_lossy().into_owned());
        m.setup_handle_store(&cfg).unwrap();
        assert_eq!(
            m.read_record("reader").unwrap(),
            Some(vec!["1".into(), "one".into()])
        );
        assert!(matches!(
            m.read_record("nobody"),
            Err(FixtureError::UnknownHandle(_))
        ));
    }
}
