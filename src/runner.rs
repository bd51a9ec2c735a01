//! Per-handle lifecycle: one [`Runner`] drives one named workload through
//! ramp-up, full attack, drain and teardown, and ends by inserting its
//! [`RunReport`] into the manager.
//!
//! ```text
//! [Constructed] --run--> [BeforeRun] --> [RampUp] --> [FullAttack]
//!                                                         |
//!                                     [Quit workers] <----+
//!                                          |
//!                                     [Teardown] --> [AfterRun] --> [Reported]
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::attack::{attack_loop, Attack, CollectorMsg, NextReceiver, Phase};
use crate::config::{AttackConfig, ConfigError};
use crate::limiter::Limiter;
use crate::manager::{LoadManager, SuiteError};
use crate::metrics::Metrics;
use crate::rampup;
use crate::report::RunReport;

/// Buffered capacity of the result channel; results are drained by a single
/// collector task, the buffer only decouples bursts of completions.
const RESULTS_BUFFER: usize = 256;

/// Drives the complete flow of one handle's load test.
pub struct Runner {
    name: String,
    config: AttackConfig,
    prototype: Box<dyn Attack>,
    manager: Arc<LoadManager>,
    workers: Vec<JoinHandle<Box<dyn Attack>>>,
    spawned: usize,
    next_tx: Option<mpsc::Sender<Phase>>,
    next_rx: NextReceiver,
    results_tx: Option<mpsc::Sender<CollectorMsg>>,
    results_rx: Option<mpsc::Receiver<CollectorMsg>>,
}

impl Runner {
    /// Validate the configuration and prepare the channels. Any
    /// configuration problem is fatal before a single request is issued.
    pub fn new(
        name: impl Into<String>,
        manager: Arc<LoadManager>,
        prototype: Box<dyn Attack>,
        config: AttackConfig,
    ) -> Result<Self, ConfigError> {
        let name = name.into();
        let problems = config.validate();
        if !problems.is_empty() {
            return Err(ConfigError::Invalid(
                problems
                    .into_iter()
                    .map(|p| format!("[{name}] {p}"))
                    .collect(),
            ));
        }
        if config.verbose {
            info!(handle = %name, "bootstrapping generator");
            info!(cpus = num_cpus::get(), "available logical CPUs");
        }

        // The GO channel holds a single token: a send blocks while every
        // worker is busy, which bounds the achieved rate by the pool.
        let (next_tx, next_rx) = mpsc::channel(1);
        let (results_tx, results_rx) = mpsc::channel(RESULTS_BUFFER);
        Ok(Self {
            name,
            config,
            prototype,
            manager,
            workers: Vec::new(),
            spawned: 0,
            next_tx: Some(next_tx),
            next_rx: Arc::new(Mutex::new(next_rx)),
            results_tx: Some(results_tx),
            results_rx: Some(results_rx),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &AttackConfig {
        &self.config
    }

    pub fn sequence(&self) -> i32 {
        self.config.sequence_num
    }

    /// Number of live workers.
    pub fn pool_size(&self) -> usize {
        self.workers.len()
    }

    /// Total attackers spawned successfully over the run.
    pub fn attackers_spawned(&self) -> usize {
        self.spawned
    }

    /// The complete flow of a load test for this handle.
    pub async fn run(&mut self) -> Result<(), SuiteError> {
        self.prototype
            .before_run(&self.config)
            .await
            .map_err(|source| SuiteError::BeforeRun {
                handle: self.name.clone(),
                source,
            })?;

        let results_rx = self
            .results_rx
            .take()
            .expect("runner started more than once");
        let collector = tokio::spawn(collect_results(results_rx));

        if self.config.verbose {
            info!(
                handle = %self.name,
                ramp_up_sec = self.config.ramp_up_sec,
                rps = self.config.rps,
                attack_time_sec = self.config.attack_time_sec,
                strategy = %self.config.ramp_up_strategy,
                "begin rampup"
            );
        }
        rampup::execute(self.config.ramp_up_strategy, self).await;
        if self.config.verbose {
            info!(handle = %self.name, attackers = self.pool_size(), "end rampup");
        }

        let full_attack_started_at = Utc::now();
        self.full_attack().await;

        self.quit_attackers();
        let attackers = self.join_workers().await;
        self.teardown_attackers(attackers).await;

        // All workers are gone and our own sender is dropped, so the
        // collector observes closure and returns its map.
        drop(self.results_tx.take());
        let mut metrics = collector.await.expect("result collector panicked");
        for bucket in metrics.values_mut() {
            bucket.update_latencies();
        }

        let mut report = RunReport::new(full_attack_started_at, self.config.clone(), metrics);
        self.prototype
            .after_run(&mut report)
            .await
            .map_err(|source| SuiteError::AfterRun {
                handle: self.name.clone(),
                source,
            })?;

        self.manager.insert_report(self.name.clone(), report);
        Ok(())
    }

    /// Drive the target RPS for the remaining attack seconds through a
    /// single fresh limiter.
    async fn full_attack(&mut self) {
        // Attack can only proceed when at least one attacker waits for
        // tokens; rampup has probably failed too.
        if self.pool_size() == 0 {
            return;
        }
        let remaining = self.config.attack_time_sec - self.config.ramp_up_sec;
        if self.config.verbose {
            info!(handle = %self.name, seconds = remaining, "begin full attack");
        }
        let mut limiter = Limiter::new(self.config.rps);
        let deadline = Instant::now() + Duration::from_secs(remaining);
        while Instant::now() < deadline {
            limiter.take().await;
            if self.send_token(Phase::Main).await.is_err() {
                break;
            }
        }
        if self.config.verbose {
            info!(handle = %self.name, "end full attack");
        }
    }

    /// Clone the prototype, set it up and hand it to a fresh worker task.
    /// A setup failure is logged and skipped; the pool does not grow.
    pub(crate) async fn spawn_attacker(&mut self) {
        if self.config.verbose {
            info!(handle = %self.name, attacker = self.pool_size() + 1, "setup and spawn new attacker");
        }
        let mut attacker = self.prototype.clone_attack();
        if let Err(err) = attacker.setup(Arc::clone(&self.manager), &self.config).await {
            warn!(
                handle = %self.name,
                attacker = self.pool_size() + 1,
                error = %err,
                "attacker setup failed"
            );
            return;
        }
        let results_tx = self
            .results_tx
            .clone()
            .expect("spawning after the run ended");
        self.workers.push(tokio::spawn(attack_loop(
            attacker,
            Arc::clone(&self.next_rx),
            results_tx,
            self.config.timeout(),
        )));
        self.spawned += 1;
    }

    /// Release one unit of work to the pool. Fails once the run is over.
    pub(crate) async fn send_token(&self, phase: Phase) -> Result<(), ()> {
        match &self.next_tx {
            Some(tx) => tx.send(phase).await.map_err(|_| ()),
            None => Err(()),
        }
    }

    /// Close the given ramp second and collect its slice metrics.
    pub(crate) async fn harvest_slice(&self, second: u32) -> Metrics {
        let Some(results_tx) = &self.results_tx else {
            return Metrics::new();
        };
        let (reply_tx, reply_rx) = oneshot::channel();
        if results_tx
            .send(CollectorMsg::Harvest(second, reply_tx))
            .await
            .is_err()
        {
            return Metrics::new();
        }
        reply_rx.await.unwrap_or_default()
    }

    /// Dropping the GO sender quits the pool: each worker finishes its
    /// in-flight call, emits the result, observes the closed channel and
    /// exits.
    fn quit_attackers(&mut self) {
        if self.config.verbose {
            info!(handle = %self.name, attackers = self.pool_size(), "stopping attackers");
        }
        self.next_tx = None;
    }

    async fn join_workers(&mut self) -> Vec<Box<dyn Attack>> {
        join_all(self.workers.drain(..))
            .await
            .into_iter()
            .filter_map(|joined| match joined {
                Ok(attacker) => Some(attacker),
                Err(err) => {
                    // Keep the rest of the pool's data instead of aborting.
                    error!(error = %err, "worker panicked");
                    None
                }
            })
            .collect()
    }

    async fn teardown_attackers(&mut self, attackers: Vec<Box<dyn Attack>>) {
        if self.config.verbose {
            info!(handle = %self.name, attackers = attackers.len(), "tearing down attackers");
        }
        for (i, mut attacker) in attackers.into_iter().enumerate() {
            if let Err(err) = attacker.teardown().await {
                warn!(handle = %self.name, attacker = i, error = %err, "failed to teardown attacker");
            }
        }
    }

    /// Development helper: perform `count` unmetered calls on one set-up
    /// clone and log each result. No rate control, no metrics.
    pub async fn sample(&mut self, count: usize) {
        let mut probe = self.prototype.clone_attack();
        if let Err(err) = probe.setup(Arc::clone(&self.manager), &self.config).await {
            warn!(handle = %self.name, error = %err, "sample attack setup failed");
            return;
        }
        for _ in 0..count {
            let started = Instant::now();
            let result = probe.do_attack().await;
            info!(
                handle = %self.name,
                label = %result.request_label,
                elapsed = ?started.elapsed(),
                status = ?result.status_code,
                error = ?result.error,
                "sample attack call"
            );
        }
        if let Err(err) = probe.teardown().await {
            warn!(handle = %self.name, error = %err, "sample attack teardown failed");
        }
    }
}

/// Single long-lived collector: applies each result to the aggregator its
/// phase tag selects. Exactly one aggregator sees any given message, so the
/// ramp-up hand-off has no torn state. Returns the per-label map once the
/// channel closes.
async fn collect_results(mut rx: mpsc::Receiver<CollectorMsg>) -> HashMap<String, Metrics> {
    let mut by_label: HashMap<String, Metrics> = HashMap::new();
    let mut slices: HashMap<u32, Metrics> = HashMap::new();
    let mut harvested: u32 = 0;
    while let Some(msg) = rx.recv().await {
        match msg {
            CollectorMsg::Result(r) => match r.phase {
                Phase::Ramp(second) if second > harvested => {
                    slices.entry(second).or_default().add(&r);
                }
                // Main-phase results, plus ramp completions that finished
                // after their slice was harvested.
                _ => {
                    by_label
                        .entry(r.do_result.request_label.clone())
                        .or_default()
                        .add(&r);
                }
            },
            CollectorMsg::Harvest(second, reply) => {
                harvested = harvested.max(second);
                let slice = slices.remove(&second).unwrap_or_default();
                let _ = reply.send(slice);
            }
        }
    }
    by_label
}
