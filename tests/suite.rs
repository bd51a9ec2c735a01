//! End-to-end suite scenarios driven through the public API: happy path,
//! timeout storms, sequenced fixture hand-off, startup collisions and the
//! degradation gate.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use clap::Parser;
use stampede::{
    ci_run_with, Attack, AttackConfig, AttackError, ChecksConfig, Cli, DoResult, ExecutionMode,
    LoadManager, RampupStrategy, Suite, SuiteConfig,
};

fn handle(name: &str) -> AttackConfig {
    AttackConfig::builder()
        .name(name)
        .rps(10)
        .attack_time_sec(2)
        .ramp_up_sec(1)
        .max_attackers(2)
        .do_timeout_sec(1)
        .build()
}

fn suite_config(
    dir: &tempfile::TempDir,
    mode: ExecutionMode,
    handles: Vec<AttackConfig>,
) -> SuiteConfig {
    SuiteConfig {
        execution_mode: mode,
        root_keys: None,
        root_ref: None,
        http_timeout_sec: None,
        report_dir: dir.path().join("reports"),
        checks: ChecksConfig::default(),
        handles,
    }
}

/// Sleeps a fixed time and labels results with its handle name.
struct SleepAttack {
    sleep: Duration,
    label: String,
}

#[async_trait]
impl Attack for SleepAttack {
    async fn setup(
        &mut self,
        _manager: Arc<LoadManager>,
        _config: &AttackConfig,
    ) -> Result<(), AttackError> {
        Ok(())
    }

    async fn do_attack(&mut self) -> DoResult {
        tokio::time::sleep(self.sleep).await;
        DoResult::labeled(self.label.clone())
    }

    async fn teardown(&mut self) -> Result<(), AttackError> {
        Ok(())
    }

    fn clone_attack(&self) -> Box<dyn Attack> {
        Box::new(Self {
            sleep: self.sleep,
            label: self.label.clone(),
        })
    }
}

#[tokio::test]
async fn linear_happy_path_reports_clean_metrics() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = handle("steady");
    cfg.rps = 50;
    cfg.attack_time_sec = 4;
    cfg.ramp_up_sec = 2;
    cfg.max_attackers = 10;
    cfg.ramp_up_strategy = RampupStrategy::Linear;
    let config = suite_config(&dir, ExecutionMode::Parallel, vec![cfg]);

    let mut suite = Suite::from_config(config, |name| {
        Box::new(SleepAttack {
            sleep: Duration::from_millis(1),
            label: name.to_string(),
        }) as Box<dyn Attack>
    })
    .unwrap();
    suite.run().await.unwrap();

    let manager = suite.manager();
    let report = manager.report_for("steady").unwrap();
    let bucket = &report.metrics["steady"];
    // Two full-attack seconds at 50 RPS; generous band for scheduler noise.
    assert!(bucket.requests >= 70, "requests = {}", bucket.requests);
    assert!(bucket.requests <= 130, "requests = {}", bucket.requests);
    assert_eq!(bucket.errors, 0);
    assert!(bucket.latencies.p50 >= Duration::from_millis(1));
    assert!(bucket.latencies.p50 <= Duration::from_millis(20));

    manager.check_errors();
    manager.check_degradation();
    assert!(!manager.failed());
    assert!(!manager.degradation());
    manager.store_handle_reports().unwrap();
    assert!(dir.path().join("reports").join("steady_last").exists());
}

/// Blocks until cancelled by the per-call deadline.
struct BlockingAttack;

#[async_trait]
impl Attack for BlockingAttack {
    async fn setup(
        &mut self,
        _manager: Arc<LoadManager>,
        _config: &AttackConfig,
    ) -> Result<(), AttackError> {
        Ok(())
    }

    async fn do_attack(&mut self) -> DoResult {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        DoResult::labeled("never")
    }

    async fn teardown(&mut self) -> Result<(), AttackError> {
        Ok(())
    }

    fn clone_attack(&self) -> Box<dyn Attack> {
        Box::new(Self)
    }
}

#[tokio::test]
async fn blocking_attacker_yields_all_timeout_results() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = handle("stuck");
    cfg.rps = 5;
    cfg.attack_time_sec = 2;
    cfg.ramp_up_sec = 1;
    cfg.do_timeout_sec = 1;
    let config = suite_config(&dir, ExecutionMode::Parallel, vec![cfg]);

    let mut suite =
        Suite::from_config(config, |_| Box::new(BlockingAttack) as Box<dyn Attack>).unwrap();
    suite.run().await.unwrap();

    let manager = suite.manager();
    let report = manager.report_for("stuck").unwrap();
    // Synthetic timeout results carry no label.
    let bucket = report.metrics.get("").expect("timed-out bucket");
    assert!(bucket.requests >= 1);
    assert_eq!(bucket.errors, bucket.requests, "every record is an error");
    assert!(bucket.latencies.p50 >= Duration::from_millis(900));
    assert!(bucket.latencies.p50 <= Duration::from_millis(1600));

    manager.check_errors();
    assert!(manager.failed());
    // A failed run must not move the last-success marker.
    manager.store_handle_reports().unwrap();
    assert!(!dir.path().join("reports").join("stuck_last").exists());
}

/// Writes `count` ids to its fixture on the first call.
struct IdWriter {
    manager: Option<Arc<LoadManager>>,
    handle: String,
    seeded: Arc<AtomicBool>,
    count: usize,
}

#[async_trait]
impl Attack for IdWriter {
    async fn setup(
        &mut self,
        manager: Arc<LoadManager>,
        config: &AttackConfig,
    ) -> Result<(), AttackError> {
        self.manager = Some(manager);
        self.handle = config.name.clone();
        Ok(())
    }

    async fn do_attack(&mut self) -> DoResult {
        if !self.seeded.swap(true, Ordering::SeqCst) {
            for i in 0..self.count {
                if let Err(err) = self.put_data(&[format!("id-{i}")]) {
                    return DoResult::labeled(self.handle.clone()).with_error(err);
                }
            }
        }
        DoResult::labeled(self.handle.clone())
    }

    async fn teardown(&mut self) -> Result<(), AttackError> {
        Ok(())
    }

    fn clone_attack(&self) -> Box<dyn Attack> {
        Box::new(Self {
            manager: None,
            handle: self.handle.clone(),
            seeded: Arc::clone(&self.seeded),
            count: self.count,
        })
    }

    fn store_data(&self) -> bool {
        true
    }

    fn put_data(&self, record: &[String]) -> Result<(), AttackError> {
        let manager = self
            .manager
            .as_ref()
            .ok_or_else(|| AttackError::Fixture("put_data before setup".into()))?;
        manager
            .write_record(&self.handle, record)
            .map_err(|err| AttackError::Fixture(err.to_string()))
    }
}

/// Drains its read fixture on the first call and fails the run when fewer
/// records than expected are available.
struct IdReader {
    manager: Option<Arc<LoadManager>>,
    handle: String,
    drained: Arc<AtomicBool>,
    seen: Arc<Mutex<Vec<String>>>,
    expected: usize,
}

#[async_trait]
impl Attack for IdReader {
    async fn setup(
        &mut self,
        manager: Arc<LoadManager>,
        config: &AttackConfig,
    ) -> Result<(), AttackError> {
        self.manager = Some(manager);
        self.handle = config.name.clone();
        Ok(())
    }

    async fn do_attack(&mut self) -> DoResult {
        if !self.drained.swap(true, Ordering::SeqCst) {
            while let Ok(record) = self.get_data() {
                self.seen.lock().unwrap().push(record[0].clone());
            }
            if self.seen.lock().unwrap().len() < self.expected {
                return DoResult::labeled(self.handle.clone())
                    .with_error(AttackError::Fixture("not enough fixture records".into()));
            }
        }
        DoResult::labeled(self.handle.clone())
    }

    async fn teardown(&mut self) -> Result<(), AttackError> {
        Ok(())
    }

    fn clone_attack(&self) -> Box<dyn Attack> {
        Box::new(Self {
            manager: None,
            handle: self.handle.clone(),
            drained: Arc::clone(&self.drained),
            seen: Arc::clone(&self.seen),
            expected: self.expected,
        })
    }

    fn get_data(&self) -> Result<Vec<String>, AttackError> {
        let manager = self
            .manager
            .as_ref()
            .ok_or_else(|| AttackError::Fixture("get_data before setup".into()))?;
        match manager.read_record(&self.handle) {
            Ok(Some(record)) => Ok(record),
            Ok(None) => Err(AttackError::Fixture("fixture exhausted".into())),
            Err(err) => Err(AttackError::Fixture(err.to_string())),
        }
    }
}

#[tokio::test]
async fn sequenced_suite_hands_fixture_records_between_handles() {
    let dir = tempfile::tempdir().unwrap();
    let ids_path = dir.path().join("ids.csv");
    let ids_file = ids_path.to_string_lossy().into_owned();

    let mut writer_cfg = handle("producer");
    writer_cfg.sequence_num = 1;
    writer_cfg.store_data = true;
    writer_cfg.csv_write = Some(ids_file.clone());
    writer_cfg.max_attackers = 1;
    let mut reader_cfg = handle("consumer");
    reader_cfg.sequence_num = 2;
    reader_cfg.csv_read = Some(ids_file);
    reader_cfg.recycle_data = false;
    reader_cfg.max_attackers = 1;

    let config = suite_config(&dir, ExecutionMode::Sequence, vec![reader_cfg, writer_cfg]);

    let seeded = Arc::new(AtomicBool::new(false));
    let drained = Arc::new(AtomicBool::new(false));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_handle = Arc::clone(&seen);

    let mut suite = Suite::from_config(config, move |name| match name {
        "producer" => Box::new(IdWriter {
            manager: None,
            handle: String::new(),
            seeded: Arc::clone(&seeded),
            count: 100,
        }) as Box<dyn Attack>,
        _ => Box::new(IdReader {
            manager: None,
            handle: String::new(),
            drained: Arc::clone(&drained),
            seen: Arc::clone(&seen_handle),
            expected: 100,
        }) as Box<dyn Attack>,
    })
    .unwrap();

    suite.run().await.unwrap();

    let manager = suite.manager();
    assert!(manager.report_for("producer").is_some());
    assert!(manager.report_for("consumer").is_some());
    manager.check_errors();
    assert!(!manager.failed());

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 100);
    let expected: Vec<String> = (0..100).map(|i| format!("id-{i}")).collect();
    assert_eq!(*seen, expected, "records observed in write order");
}

#[tokio::test]
async fn colliding_write_fixture_aborts_before_any_request() {
    let dir = tempfile::tempdir().unwrap();
    let shared = dir.path().join("shared.csv").to_string_lossy().into_owned();
    let mut a = handle("a");
    a.csv_write = Some(shared.clone());
    let mut b = handle("b");
    b.csv_write = Some(shared);
    let config = suite_config(&dir, ExecutionMode::Parallel, vec![a, b]);

    let err = Suite::from_config(config, |_| {
        Box::new(SleepAttack {
            sleep: Duration::ZERO,
            label: "x".to_string(),
        }) as Box<dyn Attack>
    })
    .err()
    .expect("suite construction must fail");
    assert!(err.to_string().contains("already exists"), "{err}");
}

fn write_ci_config(dir: &tempfile::TempDir) -> std::path::PathBuf {
    let reports = dir.path().join("reports");
    let yaml = format!(
        r#"
execution_mode: parallel
report_dir: {}
checks:
  handle_threshold: 2.0
handles:
  - name: steady
    rps: 10
    attack_time_sec: 2
    ramp_up_sec: 1
    max_attackers: 2
    do_timeout_sec: 1
"#,
        reports.display()
    );
    let path = dir.path().join("suite.yaml");
    std::fs::write(&path, yaml).unwrap();
    path
}

#[tokio::test]
async fn degraded_run_exits_nonzero_and_keeps_the_baseline() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = write_ci_config(&dir);
    let cli = |path: &std::path::Path| {
        Cli::parse_from(["stampede", "--config", path.to_str().unwrap()])
    };

    // First run establishes the baseline.
    let code = ci_run_with(cli(&config_path), |name| {
        Box::new(SleepAttack {
            sleep: Duration::from_millis(1),
            label: name.to_string(),
        }) as Box<dyn Attack>
    })
    .await;
    assert_eq!(code, 0);
    let marker = dir.path().join("reports").join("steady_last");
    let baseline_ts = std::fs::read_to_string(&marker).unwrap();

    // Second run is 30x slower than the baseline p50.
    let code = ci_run_with(cli(&config_path), |name| {
        Box::new(SleepAttack {
            sleep: Duration::from_millis(30),
            label: name.to_string(),
        }) as Box<dyn Attack>
    })
    .await;
    assert_eq!(code, 1, "degradation must fail the suite");
    assert_eq!(
        std::fs::read_to_string(&marker).unwrap(),
        baseline_ts,
        "degraded run must not move the last-success marker"
    );
}

#[tokio::test]
async fn sample_mode_probes_and_exits_clean() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = write_ci_config(&dir);
    let cli = Cli::parse_from([
        "stampede",
        "--config",
        config_path.to_str().unwrap(),
        "-t",
        "2",
    ]);
    let code = ci_run_with(cli, |name| {
        Box::new(SleepAttack {
            sleep: Duration::from_millis(1),
            label: name.to_string(),
        }) as Box<dyn Attack>
    })
    .await;
    assert_eq!(code, 0);
    // Sample mode never runs the suite, so no report is persisted.
    let reports: Vec<_> = std::fs::read_dir(dir.path().join("reports"))
        .map(|entries| entries.filter_map(Result::ok).collect())
        .unwrap_or_default();
    assert!(reports.is_empty());
}
