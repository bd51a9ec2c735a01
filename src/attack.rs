//! The attacker contract and the per-worker dispatch loop.
//!
//! An [`Attack`] is the unit a user plugs into the engine: it performs one
//! protocol request per [`Attack::do_attack`] call. The engine clones the
//! prototype whenever the pool grows, runs each clone on its own tokio task
//! ([`attack_loop`]), and releases work to the pool at a paced cadence.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::{timeout, Instant};

use crate::config::AttackConfig;
use crate::manager::LoadManager;
use crate::metrics::Metrics;
use crate::report::RunReport;

/// Errors produced by attacker implementations and the dispatch loop.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AttackError {
    /// The per-call deadline elapsed before `do_attack` completed.
    #[error("attack do() timed out")]
    TimedOut,
    #[error("setup failed: {0}")]
    Setup(String),
    #[error("teardown failed: {0}")]
    Teardown(String),
    #[error("fixture bridge: {0}")]
    Fixture(String),
    #[error("{0}")]
    Other(String),
}

/// Outcome of a single `do_attack` call, assigned by the attacker.
#[derive(Debug, Clone, Default)]
pub struct DoResult {
    /// Label under which this request is aggregated. Must be non-empty for
    /// metered requests; the engine leaves it empty on synthetic timeouts.
    pub request_label: String,
    pub status_code: Option<u16>,
    pub error: Option<AttackError>,
    /// Opaque payload handed to downstream scenarios through the fixture
    /// store.
    pub payload: Option<Vec<String>>,
}

impl DoResult {
    pub fn labeled(label: impl Into<String>) -> Self {
        Self {
            request_label: label.into(),
            ..Self::default()
        }
    }

    pub fn with_status(mut self, code: u16) -> Self {
        self.status_code = Some(code);
        self
    }

    pub fn with_error(mut self, err: AttackError) -> Self {
        self.error = Some(err);
        self
    }

    /// A result counts as an error when the attacker reported one or the
    /// status code is 400 or above.
    pub fn is_error(&self) -> bool {
        self.error.is_some() || matches!(self.status_code, Some(c) if c >= 400)
    }

    fn timed_out() -> Self {
        Self::default().with_error(AttackError::TimedOut)
    }
}

/// Which production loop released the token that produced a result. Ramp
/// results carry their one-second slice number so the collector can route
/// them to the slice-local aggregator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Ramp(u32),
    Main,
}

/// One completed attacker invocation, framed by its begin/end stamps.
#[derive(Debug, Clone)]
pub struct AttackResult {
    pub phase: Phase,
    pub begin: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub elapsed: Duration,
    pub do_result: DoResult,
}

/// Messages understood by the runner's result collector.
pub(crate) enum CollectorMsg {
    Result(AttackResult),
    /// Close the given ramp second and reply with its slice metrics.
    Harvest(u32, oneshot::Sender<Metrics>),
}

/// GO-token source shared by every worker of one runner. Workers compete for
/// the receiver; each received token is one request. The channel holds a
/// single token, so the producer blocks while the whole pool is busy.
pub(crate) type NextReceiver = Arc<Mutex<mpsc::Receiver<Phase>>>;

/// Must be implemented by a service client.
///
/// One instance serves exactly one worker. Clones must share no mutable state
/// except resources explicitly intended to be shared, such as connection
/// pools opened during [`Attack::setup`].
#[async_trait]
pub trait Attack: Send + Sync {
    /// Called once per instance before the first `do_attack`; may open
    /// persistent connections. The manager gives access to the shared
    /// fixture store.
    async fn setup(
        &mut self,
        manager: Arc<LoadManager>,
        config: &AttackConfig,
    ) -> Result<(), AttackError>;

    /// Perform one request. The engine drops the returned future when the
    /// per-call deadline elapses, so implementations must tolerate being
    /// cancelled at any await point.
    async fn do_attack(&mut self) -> DoResult;

    /// Called once per attacker after the run ends.
    async fn teardown(&mut self) -> Result<(), AttackError>;

    /// Return a fresh instance; invoked whenever the pool grows.
    fn clone_attack(&self) -> Box<dyn Attack>;

    /// Whether this scenario saves data needed by another scenario.
    fn store_data(&self) -> bool {
        false
    }

    /// Write one record to the handle's fixture.
    fn put_data(&self, _record: &[String]) -> Result<(), AttackError> {
        Err(AttackError::Fixture("no fixture bridge configured".into()))
    }

    /// Read the next record from the handle's fixture.
    fn get_data(&self) -> Result<Vec<String>, AttackError> {
        Err(AttackError::Fixture("no fixture bridge configured".into()))
    }

    /// Invoked by the runner before the run starts; an error aborts the
    /// whole suite.
    async fn before_run(&mut self, _config: &AttackConfig) -> Result<(), AttackError> {
        Ok(())
    }

    /// Invoked by the runner with the freshly built report; may flip
    /// `failed` and annotate the output map. An error aborts the suite.
    async fn after_run(&mut self, _report: &mut RunReport) -> Result<(), AttackError> {
        Ok(())
    }
}

/// Per-worker loop: wait for a GO token, perform one timed call, emit the
/// result, repeat. Exits when the token channel closes and returns the owned
/// attacker so the runner can tear it down.
///
/// At most one call is in flight per worker. Losing the race against the
/// per-call deadline drops the in-flight future, which cancels it before the
/// next begin stamp is recorded.
pub(crate) async fn attack_loop(
    mut attacker: Box<dyn Attack>,
    next: NextReceiver,
    results: mpsc::Sender<CollectorMsg>,
    per_call_timeout: Duration,
) -> Box<dyn Attack> {
    loop {
        let token = {
            let mut rx = next.lock().await;
            rx.recv().await
        };
        let Some(phase) = token else { break };

        let begin = Utc::now();
        let started = Instant::now();
        let do_result = match timeout(per_call_timeout, attacker.do_attack()).await {
            Ok(r) => r,
            Err(_) => DoResult::timed_out(),
        };
        let end = Utc::now();
        let elapsed = started.elapsed();

        let record = AttackResult {
            phase,
            begin,
            end,
            elapsed,
            do_result,
        };
        if results.send(CollectorMsg::Result(record)).await.is_err() {
            break;
        }
    }
    attacker
}
